// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, Result};
use log::debug;
use notation_rs::{
    blob::{self, BlobSignOptions, BlobVerifyOptions},
    config::{Config, KeyEntry, SigningKeys, Timeouts},
    dir::ConfigDirs,
    envelope::EnvelopeFormat,
    inspect, oci,
    plugin::PluginManager,
    registry::{
        auth::Credential, Reference, RemoteOptions, RemoteRepository, ARTIFACT_TYPE_SIGNATURE,
    },
    revocation::{FileCache, RevocationValidator},
    signer::{SignOptions, Signer},
    timestamp::HttpTimestamper,
    verifier::{VerificationOutcome, Verifier, VerifyOptions},
    x509,
};

use crate::{
    BlobOperation, BlobSignArgs, BlobVerifyArgs, InspectArgs, ListArgs, Operation, OutputFormat,
    SignArgs, SigningArgs, VerificationArgs, VerifyArgs,
};

/// Process-wide settings, loaded once per invocation.
struct Settings {
    dirs: ConfigDirs,
    config: Config,
    timeouts: Timeouts,
}

pub(crate) async fn run(operation: Operation) -> Result<()> {
    let dirs = ConfigDirs::from_env().context("failed to locate the configuration directory")?;
    let config = Config::load(&dirs.config_file())
        .with_context(|| format!("failed to load {}", dirs.config_file().display()))?;
    debug!("configuration root {}", dirs.config_root().display());
    let settings = Settings {
        dirs,
        config,
        timeouts: Timeouts::default(),
    };

    match operation {
        Operation::Sign(args) => settings.sign(args).await,
        Operation::Verify(args) => settings.verify(args).await,
        Operation::List(args) => settings.list(args).await,
        Operation::Inspect(args) => inspect_signature(args).await,
        Operation::Blob { operation } => match operation {
            BlobOperation::Sign(args) => settings.blob_sign(args).await,
            BlobOperation::Verify(args) => settings.blob_verify(args).await,
        },
    }
}

fn pairs(args: &[(String, String)]) -> BTreeMap<String, String> {
    args.iter().cloned().collect()
}

fn verify_options(args: &VerificationArgs) -> VerifyOptions {
    VerifyOptions {
        plugin_config: pairs(&args.plugin_config),
        user_metadata: pairs(&args.user_metadata),
        ..Default::default()
    }
}

fn print_user_metadata(outcome: &VerificationOutcome) {
    if outcome.user_metadata.is_empty() {
        return;
    }
    println!("The artifact was signed with the following user metadata.");
    for (key, value) in &outcome.user_metadata {
        println!("  {key}={value}");
    }
}

impl Settings {
    fn parse_reference(&self, reference: &str) -> Result<Reference> {
        reference
            .parse()
            .with_context(|| format!("invalid reference `{reference}`"))
    }

    fn repository(&self, reference: &Reference) -> Result<RemoteRepository> {
        let registry = reference.registry();
        let options = RemoteOptions {
            plain_http: self.config.is_insecure_registry(registry),
            timeout: self.timeouts.registry,
            credential: Credential::resolve(registry)
                .with_context(|| format!("failed to load credentials for {registry}"))?,
            ..Default::default()
        };
        Ok(RemoteRepository::new(reference, options)?)
    }

    fn revocation(&self) -> Result<RevocationValidator> {
        let cache = Arc::new(FileCache::new(self.dirs.crl_cache()));
        Ok(RevocationValidator::new(&self.timeouts, Some(cache))?)
    }

    fn verifier(&self) -> Result<Verifier> {
        Verifier::from_dirs(&self.dirs, &self.timeouts).context("failed to load the trust policy")
    }

    async fn signer(&self, args: &SigningArgs) -> Result<Signer> {
        let entry = match (&args.plugin, &args.id) {
            (Some(plugin), Some(id)) => KeyEntry {
                name: plugin.clone(),
                id: Some(id.clone()),
                plugin_name: Some(plugin.clone()),
                ..Default::default()
            },
            _ => {
                let path = self.dirs.signing_keys();
                let keys = SigningKeys::load(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                keys.get(args.key.as_deref())?.clone()
            }
        };
        let plugins = PluginManager::new(self.dirs.plugins(), self.timeouts.plugin);
        Signer::from_key_entry(&entry, &plugins, &pairs(&args.plugin_config))
            .await
            .with_context(|| format!("failed to load signing key `{}`", entry.name))
    }

    async fn sign_options(&self, args: &SigningArgs) -> Result<SignOptions> {
        let format = args
            .signature_format
            .as_deref()
            .unwrap_or(self.config.signature_format.as_str());
        let format: EnvelopeFormat = format
            .parse()
            .with_context(|| format!("unsupported signature format `{format}`"))?;

        let mut options = SignOptions {
            envelope_media_type: format.media_type().to_string(),
            expiry_duration: args.expiry,
            plugin_config: pairs(&args.plugin_config),
            user_metadata: pairs(&args.user_metadata),
            ..Default::default()
        };
        if let (Some(url), Some(root)) = (&args.timestamp_url, &args.timestamp_root_cert) {
            let pem = tokio::fs::read(root)
                .await
                .with_context(|| format!("failed to read {}", root.display()))?;
            options.tsa_roots = x509::parse_pem_chain(&pem)
                .with_context(|| format!("invalid timestamp root certificate {}", root.display()))?;
            options.timestamper = Some(Arc::new(HttpTimestamper::new(url, self.timeouts.tsa)?));
            options.tsa_revocation = Some(self.revocation()?);
        }
        Ok(options)
    }

    async fn sign(&self, args: SignArgs) -> Result<()> {
        let reference = self.parse_reference(&args.reference)?;
        let repo = self.repository(&reference)?;
        let signer = self.signer(&args.signing).await?;
        let mut options = self.sign_options(&args.signing).await?;
        options.force_referrers_tag = args.force_referrers_tag;

        let result = oci::sign(&signer, &repo, &reference, &options).await?;
        println!(
            "Successfully signed {}",
            reference.with_digest(result.artifact.digest.clone())
        );
        println!(
            "Pushed the signature to {}",
            reference.with_digest(result.signature.digest)
        );
        Ok(())
    }

    async fn verify(&self, args: VerifyArgs) -> Result<()> {
        let reference = self.parse_reference(&args.reference)?;
        let verifier = self.verifier()?;
        let repo = self.repository(&reference)?;
        let options = VerifyOptions {
            max_signature_attempts: args.max_signatures,
            ..verify_options(&args.verification)
        };

        let result = oci::verify(&verifier, &repo, &reference, &options).await?;
        match &result.artifact {
            Some(artifact) => {
                println!(
                    "Successfully verified signature for {}",
                    reference.with_digest(artifact.digest.clone())
                );
                print_user_metadata(&result.outcome);
            }
            None => println!(
                "Trust policy is configured to skip signature verification for {reference}"
            ),
        }
        Ok(())
    }

    async fn list(&self, args: ListArgs) -> Result<()> {
        let reference = self.parse_reference(&args.reference)?;
        let repo = self.repository(&reference)?;
        let (artifact, signatures) = oci::list(&repo, &reference, args.max_signatures).await?;

        let pinned = reference.with_digest(artifact.digest);
        if signatures.descriptors.is_empty() {
            println!("{pinned} has no associated signature");
            return Ok(());
        }
        println!("{pinned}");
        println!("└── {ARTIFACT_TYPE_SIGNATURE}");
        let last = signatures.descriptors.len() - 1;
        for (i, descriptor) in signatures.descriptors.iter().enumerate() {
            let branch = if i == last { "└──" } else { "├──" };
            println!("    {branch} {}", descriptor.digest);
        }
        if signatures.truncated {
            println!("(only the first {} signatures are shown)", args.max_signatures);
        }
        Ok(())
    }

    async fn blob_sign(&self, args: BlobSignArgs) -> Result<()> {
        let signer = self.signer(&args.signing).await?;
        let options = BlobSignOptions {
            sign: self.sign_options(&args.signing).await?,
            media_type: args.media_type,
            signature_directory: args.signature_directory,
            force: args.force,
        };
        let (signature, _) = blob::sign(&signer, &args.path, &options).await?;
        println!("Successfully signed {}", args.path.display());
        println!("Signature file written to {}", signature.display());
        Ok(())
    }

    async fn blob_verify(&self, args: BlobVerifyArgs) -> Result<()> {
        let verifier = self.verifier()?;
        let options = BlobVerifyOptions {
            verify: verify_options(&args.verification),
            policy_name: args.policy_name,
            media_type: args.media_type,
            signature_media_type: None,
        };
        let outcome = blob::verify(&verifier, &args.path, &args.signature, &options).await?;
        if outcome.envelope_digest.is_none() {
            println!(
                "Trust policy is configured to skip signature verification for {}",
                args.path.display()
            );
            return Ok(());
        }
        println!(
            "Successfully verified signature {} for {}",
            args.signature.display(),
            args.path.display()
        );
        print_user_metadata(&outcome);
        Ok(())
    }
}

async fn inspect_signature(args: InspectArgs) -> Result<()> {
    let raw = tokio::fs::read(&args.signature)
        .await
        .with_context(|| format!("failed to read {}", args.signature.display()))?;
    let media_type = match args.signature_media_type {
        Some(media_type) => media_type,
        None => blob::signature_format(&args.signature)?
            .media_type()
            .to_string(),
    };
    let inspection = inspect::inspect(&raw, &media_type)?;
    match args.output {
        OutputFormat::Text => println!("{inspection}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&inspection)?),
    }
    Ok(())
}
