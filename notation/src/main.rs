// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! `notation`: sign and verify OCI artifacts and blobs.
//!
//! Exits with 0 on success, 2 when verification failed or no trust policy
//! applies, and 1 on any other error.

use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand, ValueEnum};
use notation_rs::{
    registry::DEFAULT_MAX_SIGNATURES, trustpolicy::PolicyError, verifier::VerificationError,
};

mod command;

#[derive(Parser)]
#[command(name = "notation")]
#[command(bin_name = "notation")]
#[command(author, version, about = "Sign and verify OCI artifacts and blobs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    operation: Operation,

    /// Print debug logs
    #[arg(long, global = true)]
    debug: bool,

    /// Print informational logs
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Operation {
    /// Sign an artifact in a registry
    Sign(SignArgs),

    /// Verify the signatures of an artifact in a registry
    Verify(VerifyArgs),

    /// List the signatures of an artifact
    #[command(alias = "ls")]
    List(ListArgs),

    /// Show the content of a signature file without verifying it
    Inspect(InspectArgs),

    /// Sign and verify arbitrary files
    Blob {
        #[command(subcommand)]
        operation: BlobOperation,
    },
}

#[derive(Subcommand)]
enum BlobOperation {
    /// Sign a file and write a detached signature next to it
    Sign(BlobSignArgs),

    /// Verify a detached signature of a file
    Verify(BlobVerifyArgs),
}

/// How to sign, shared by `sign` and `blob sign`.
#[derive(Args)]
struct SigningArgs {
    /// Name of the signing key in signingkeys.json, the default key when omitted
    #[arg(short, long, conflicts_with = "plugin")]
    key: Option<String>,

    /// Plugin holding the signing key
    #[arg(long, requires = "id")]
    plugin: Option<String>,

    /// Key id understood by the plugin
    #[arg(long, requires = "plugin")]
    id: Option<String>,

    /// Envelope format, overriding config.json
    #[arg(long, value_parser = ["jws", "cose"])]
    signature_format: Option<String>,

    /// How long the signature stays valid, e.g. 30m, 12h or 7d
    #[arg(short, long, value_parser = parse_duration)]
    expiry: Option<chrono::Duration>,

    /// Annotation added to the signed descriptor
    #[arg(short = 'm', long, value_name = "KEY=VALUE", value_parser = parse_key_value)]
    user_metadata: Vec<(String, String)>,

    /// Setting passed to the plugin
    #[arg(long, value_name = "KEY=VALUE", value_parser = parse_key_value)]
    plugin_config: Vec<(String, String)>,

    /// RFC 3161 timestamp authority to countersign with
    #[arg(long, requires = "timestamp_root_cert")]
    timestamp_url: Option<String>,

    /// PEM file with the root certificate of the timestamp authority
    #[arg(long, requires = "timestamp_url")]
    timestamp_root_cert: Option<PathBuf>,
}

#[derive(Args)]
struct SignArgs {
    /// Artifact reference, registry/repository[:tag|@digest]
    reference: String,

    #[command(flatten)]
    signing: SigningArgs,

    /// Always maintain the referrers tag index, even when the registry
    /// supports the Referrers API
    #[arg(long)]
    force_referrers_tag: bool,
}

/// What a signature must carry, shared by `verify` and `blob verify`.
#[derive(Args)]
struct VerificationArgs {
    /// Annotation the signed descriptor must carry
    #[arg(short = 'm', long, value_name = "KEY=VALUE", value_parser = parse_key_value)]
    user_metadata: Vec<(String, String)>,

    /// Setting passed to verification plugins
    #[arg(long, value_name = "KEY=VALUE", value_parser = parse_key_value)]
    plugin_config: Vec<(String, String)>,
}

#[derive(Args)]
struct VerifyArgs {
    reference: String,

    #[command(flatten)]
    verification: VerificationArgs,

    /// Maximum number of signatures to examine
    #[arg(long, default_value_t = DEFAULT_MAX_SIGNATURES)]
    max_signatures: usize,
}

#[derive(Args)]
struct ListArgs {
    reference: String,

    /// Maximum number of signatures to list
    #[arg(long, default_value_t = DEFAULT_MAX_SIGNATURES)]
    max_signatures: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Args)]
struct InspectArgs {
    /// Signature file, `<name>.jws.sig` or `<name>.cose.sig`
    signature: PathBuf,

    /// Envelope media type, detected from the file name when omitted
    #[arg(long)]
    signature_media_type: Option<String>,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,
}

#[derive(Args)]
struct BlobSignArgs {
    /// File to sign
    path: PathBuf,

    #[command(flatten)]
    signing: SigningArgs,

    /// Where to write the signature, the directory of the file by default
    #[arg(long)]
    signature_directory: Option<PathBuf>,

    /// Media type of the file
    #[arg(long)]
    media_type: Option<String>,

    /// Overwrite an existing signature
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct BlobVerifyArgs {
    /// File to verify
    path: PathBuf,

    /// Detached signature of the file
    #[arg(short, long)]
    signature: PathBuf,

    /// Blob trust policy statement to apply, the global one by default
    #[arg(long)]
    policy_name: Option<String>,

    /// Media type the signed file must have
    #[arg(long)]
    media_type: Option<String>,

    #[command(flatten)]
    verification: VerificationArgs,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("`{s}` is not KEY=VALUE")),
    }
}

fn parse_duration(s: &str) -> Result<chrono::Duration, String> {
    let invalid = || format!("`{s}` is not a duration such as 30m, 12h or 7d");
    let unit_at = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (amount, unit) = s.split_at(unit_at);
    let amount: i64 = amount.parse().map_err(|_| invalid())?;
    let duration = match unit {
        "s" => chrono::Duration::try_seconds(amount),
        "m" => chrono::Duration::try_minutes(amount),
        "h" => chrono::Duration::try_hours(amount),
        "d" => chrono::Duration::try_days(amount),
        _ => None,
    };
    match duration {
        Some(duration) if amount > 0 => Ok(duration),
        _ => Err(invalid()),
    }
}

fn exit_code(error: &anyhow::Error) -> u8 {
    let verification_failed = error.chain().any(|cause| {
        cause.is::<VerificationError>()
            || matches!(
                cause.downcast_ref::<PolicyError>(),
                Some(PolicyError::NoApplicablePolicy(_))
            )
    });
    if verification_failed {
        2
    } else {
        1
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(filter));

    match command::run(cli.operation).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
