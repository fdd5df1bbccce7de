// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Detached signatures of arbitrary files.
//!
//! The signature of `<name>` is written next to it, or into a chosen
//! directory, as `<name>.jws.sig` or `<name>.cose.sig`.

use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use crate::{
    descriptor::{Descriptor, MEDIA_TYPE_OCTET_STREAM},
    digest::{digest_reader, DigestAlgorithm},
    envelope::EnvelopeFormat,
    signer::{SignOptions, SignedEnvelope, Signer},
    verifier::{CheckError, VerificationError, VerificationOutcome, Verifier, VerifyOptions},
    Result,
};

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("failed to access {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("signature {0} already exists")]
    SignatureExists(PathBuf),

    #[error("cannot tell the envelope format of {0}, expected a .jws.sig or .cose.sig file")]
    UnknownFormat(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BlobError + '_ {
    move |source| BlobError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn format_extension(format: EnvelopeFormat) -> &'static str {
    match format {
        EnvelopeFormat::Jws => "jws",
        EnvelopeFormat::Cose => "cose",
    }
}

/// `<blob file name>.<jws|cose>.sig` inside `directory`.
pub fn signature_path(blob: &Path, format: EnvelopeFormat, directory: &Path) -> PathBuf {
    let name = blob
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "blob".to_string());
    directory.join(format!("{name}.{}.sig", format_extension(format)))
}

/// The envelope format of a signature file, from its `.jws.sig` or
/// `.cose.sig` suffix.
pub fn signature_format(path: &Path) -> std::result::Result<EnvelopeFormat, BlobError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.ends_with(".jws.sig") {
        Ok(EnvelopeFormat::Jws)
    } else if name.ends_with(".cose.sig") {
        Ok(EnvelopeFormat::Cose)
    } else {
        Err(BlobError::UnknownFormat(path.to_path_buf()))
    }
}

/// Describes the file at `path` with `algorithm`.
pub async fn describe(
    path: &Path,
    media_type: &str,
    algorithm: DigestAlgorithm,
) -> std::result::Result<Descriptor, BlobError> {
    let file = tokio::fs::File::open(path).await.map_err(io_error(path))?;
    let (digest, size) = digest_reader(algorithm, file)
        .await
        .map_err(io_error(path))?;
    Ok(Descriptor::new(media_type, digest, size))
}

#[derive(Clone, Default)]
pub struct BlobSignOptions {
    pub sign: SignOptions,
    /// Defaults to `application/octet-stream`.
    pub media_type: Option<String>,
    /// Defaults to the directory of the blob.
    pub signature_directory: Option<PathBuf>,
    /// Overwrite an existing signature file.
    pub force: bool,
}

/// Signs the file at `blob` and writes the detached signature. Returns the
/// signature path.
pub async fn sign(
    signer: &Signer,
    blob: &Path,
    options: &BlobSignOptions,
) -> Result<(PathBuf, SignedEnvelope)> {
    let format = EnvelopeFormat::from_media_type(&options.sign.envelope_media_type)?;
    let directory = match &options.signature_directory {
        Some(directory) => directory.clone(),
        None => blob
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    let output = signature_path(blob, format, &directory);
    if !options.force && tokio::fs::try_exists(&output).await.unwrap_or(false) {
        return Err(BlobError::SignatureExists(output).into());
    }

    let algorithm = signer.key_spec().await?.hash_algorithm().digest_algorithm();
    let media_type = options
        .media_type
        .as_deref()
        .unwrap_or(MEDIA_TYPE_OCTET_STREAM);
    let descriptor = describe(blob, media_type, algorithm).await?;
    debug!("blob {} is {}", blob.display(), descriptor.digest);

    let mut sign_options = options.sign.clone();
    if sign_options.artifact_reference.is_empty() {
        sign_options.artifact_reference = blob.display().to_string();
    }
    let envelope = signer.sign(descriptor, &sign_options).await?;

    tokio::fs::create_dir_all(&directory)
        .await
        .map_err(io_error(&directory))?;
    tokio::fs::write(&output, &envelope.raw)
        .await
        .map_err(io_error(&output))?;
    info!("wrote signature of {} to {}", blob.display(), output.display());
    Ok((output, envelope))
}

#[derive(Clone, Debug, Default)]
pub struct BlobVerifyOptions {
    pub verify: VerifyOptions,
    /// Name of the blob trust policy statement. The global statement
    /// applies when unset.
    pub policy_name: Option<String>,
    /// Expected media type of the signed blob.
    pub media_type: Option<String>,
    /// Envelope media type, overriding detection from the file name.
    pub signature_media_type: Option<String>,
}

/// Verifies `signature` as a signature of the file at `blob`.
pub async fn verify(
    verifier: &Verifier,
    blob: &Path,
    signature: &Path,
    options: &BlobVerifyOptions,
) -> Result<VerificationOutcome> {
    let statement = verifier.blob_statement(options.policy_name.as_deref())?;
    let level = statement.resolved_level();
    if level.is_skip() {
        info!(
            "trust policy `{}` skips verification of {}",
            statement.name,
            blob.display()
        );
        return Ok(VerificationOutcome::new(None, level.level));
    }

    let media_type = match &options.signature_media_type {
        Some(media_type) => media_type.clone(),
        None => signature_format(signature)?.media_type().to_string(),
    };
    let raw = tokio::fs::read(signature)
        .await
        .map_err(io_error(signature))?;

    let mut verify_options = options.verify.clone();
    if verify_options.artifact_reference.is_empty() {
        verify_options.artifact_reference = blob.display().to_string();
    }
    let mut outcome = verifier
        .verify(statement, &raw, &media_type, &verify_options)
        .await;
    if outcome.is_success() {
        if let Some(signed) = outcome.signed_descriptor.clone() {
            let actual = describe(blob, &signed.media_type, signed.digest.algorithm()).await?;
            if actual.digest != signed.digest || actual.size != signed.size {
                outcome.fail(CheckError::ArtifactMismatch {
                    signed: signed.digest,
                    actual: actual.digest,
                });
            } else if let Some(expected) = &options.media_type {
                if *expected != signed.media_type {
                    outcome.fail(CheckError::MediaTypeMismatch {
                        signed: signed.media_type,
                        expected: expected.clone(),
                    });
                }
            }
        }
    }

    if outcome.is_success() {
        Ok(outcome)
    } else {
        Err(VerificationError::NoneValid {
            reference: blob.display().to_string(),
            outcomes: vec![outcome],
        }
        .into())
    }
}
