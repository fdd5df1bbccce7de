// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Storage of signatures next to the artifacts they sign.
//!
//! A signature is an image manifest with `artifactType`
//! [`ARTIFACT_TYPE_SIGNATURE`], an empty config, a single layer holding the
//! envelope and a `subject` pointing at the signed artifact. Registries that
//! implement the Referrers API index it by subject; for the others the
//! manifest is listed in an image index tagged `<alg>-<hex>` after the
//! subject digest.

pub mod auth;
mod client;
mod memory;
mod reference;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use log::{debug, info, warn};
use oci_spec::image::{
    Descriptor as OciDescriptor, DescriptorBuilder, Digest as OciDigest, ImageIndex,
    ImageIndexBuilder, ImageManifest, ImageManifestBuilder, MediaType,
};
use thiserror::Error;

pub use client::{RemoteOptions, RemoteRepository};
pub use memory::MemoryRepository;
pub use reference::Reference;

use crate::{
    descriptor::Descriptor,
    digest::{Digest, DigestAlgorithm},
};

pub const ARTIFACT_TYPE_SIGNATURE: &str = "application/vnd.cncf.notary.signature";

/// JSON array of the hex SHA-256 thumbprints of the signing chain.
pub const ANNOTATION_THUMBPRINT: &str = "io.cncf.notary.x509chain.thumbprint#S256";

pub const ANNOTATION_CREATED: &str = "org.opencontainers.image.created";

pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_EMPTY_JSON: &str = "application/vnd.oci.empty.v1+json";

/// Manifest media types accepted when resolving a reference.
pub const MANIFEST_MEDIA_TYPES: &[&str] = &[
    MEDIA_TYPE_IMAGE_MANIFEST,
    MEDIA_TYPE_IMAGE_INDEX,
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

const EMPTY_JSON: &[u8] = b"{}";

pub const MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;
pub const MAX_SIGNATURE_SIZE: u64 = 64 * 1024 * 1024;

pub const DEFAULT_MAX_SIGNATURES: usize = 100;

/// Read-modify-write attempts on the referrers tag index.
const INDEX_UPDATE_ATTEMPTS: usize = 3;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid reference {0}")]
    InvalidReference(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("access to {0} was denied")]
    Unauthorized(String),

    #[error("request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{0} changed concurrently")]
    Conflict(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("unexpected registry response: {0}")]
    InvalidResponse(String),

    #[error("content digest {actual} does not match {expected}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("{what} exceeds the {limit} byte limit")]
    TooLarge { what: String, limit: u64 },

    #[error("invalid authentication challenge: {0}")]
    InvalidChallenge(String),

    #[error("failed to read registry credentials from {path}")]
    Credentials {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

impl RegistryError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RegistryError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Http { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            RegistryError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Signature manifests found for a subject.
#[derive(Debug, Default)]
pub struct SignatureList {
    pub descriptors: Vec<Descriptor>,
    /// More signatures exist than were returned.
    pub truncated: bool,
}

/// One repository of an OCI registry.
///
/// Implementors provide content access; the signature linking on top of it
/// is shared.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Resolves a tag or digest to the manifest descriptor.
    async fn resolve(&self, reference: &str) -> Result<Descriptor>;

    /// Returns the manifest content, verified against `desc`.
    async fn fetch_manifest(&self, desc: &Descriptor) -> Result<Vec<u8>>;

    /// Returns the blob content, verified against `desc`.
    async fn fetch_blob(&self, desc: &Descriptor) -> Result<Vec<u8>>;

    async fn push_blob(&self, desc: &Descriptor, data: &[u8]) -> Result<()>;

    /// Stores a manifest under `reference` (its digest or a tag). Returns
    /// whether the registry indexed the manifest's `subject` itself.
    async fn push_manifest(&self, desc: &Descriptor, data: &[u8], reference: &str) -> Result<bool>;

    /// Queries the Referrers API. `None` means the registry does not
    /// implement it. Implementations may stop after `limit + 1` entries.
    async fn referrers(
        &self,
        subject: &Descriptor,
        artifact_type: &str,
        limit: usize,
    ) -> Result<Option<Vec<Descriptor>>>;

    /// Stores `envelope` as a signature of `subject`. Returns the envelope
    /// blob descriptor and the signature manifest descriptor.
    async fn push_signature(
        &self,
        subject: &Descriptor,
        envelope_media_type: &str,
        envelope: &[u8],
        annotations: &BTreeMap<String, String>,
        force_referrers_tag: bool,
    ) -> Result<(Descriptor, Descriptor)> {
        let blob = Descriptor::new(
            envelope_media_type,
            DigestAlgorithm::Sha256.digest(envelope),
            envelope.len() as u64,
        );
        self.push_blob(&blob, envelope).await?;
        self.push_blob(&empty_config(), EMPTY_JSON).await?;

        let (data, mut manifest) = signature_manifest(subject, &blob, annotations, true)?;
        let mut indexed = match self
            .push_manifest(&manifest, &data, &manifest.digest.to_string())
            .await
        {
            Ok(indexed) => indexed,
            Err(e) if matches!(e.status(), Some(400 | 415 | 422)) => {
                warn!("registry rejected the signature manifest subject ({e}), falling back to the referrers tag");
                let (data, stripped) = signature_manifest(subject, &blob, annotations, false)?;
                self.push_manifest(&stripped, &data, &stripped.digest.to_string())
                    .await?;
                manifest = stripped;
                false
            }
            Err(e) => return Err(e),
        };
        if force_referrers_tag {
            indexed = false;
        }
        if !indexed {
            self.add_to_referrers_index(subject, &manifest).await?;
        }
        debug!("pushed signature {} for {}", manifest.digest, subject.digest);
        Ok((blob, manifest))
    }

    /// Lists signature manifests of `subject`, at most `max` of them.
    async fn list_signatures(&self, subject: &Descriptor, max: usize) -> Result<SignatureList> {
        let found = match self
            .referrers(subject, ARTIFACT_TYPE_SIGNATURE, max)
            .await?
        {
            Some(found) => found,
            None => {
                info!(
                    "referrers API is not available, reading tag {}",
                    referrers_tag(&subject.digest)
                );
                self.referrers_index(&subject.digest).await?
            }
        };
        let mut descriptors: Vec<Descriptor> = found
            .into_iter()
            .filter(|d| d.artifact_type.as_deref() == Some(ARTIFACT_TYPE_SIGNATURE))
            .collect();
        let truncated = descriptors.len() > max;
        if truncated {
            warn!(
                "{} has more than {max} signatures, only the first {max} are examined",
                subject.digest
            );
            descriptors.truncate(max);
        }
        Ok(SignatureList {
            descriptors,
            truncated,
        })
    }

    /// Fetches the envelope referenced by a signature manifest. Returns the
    /// envelope blob descriptor and its content.
    async fn fetch_signature(&self, manifest: &Descriptor) -> Result<(Descriptor, Vec<u8>)> {
        if manifest.size > MAX_MANIFEST_SIZE {
            return Err(RegistryError::TooLarge {
                what: format!("signature manifest {}", manifest.digest),
                limit: MAX_MANIFEST_SIZE,
            });
        }
        let data = self.fetch_manifest(manifest).await?;
        let blob = signature_layer(&data)?;
        if blob.size > MAX_SIGNATURE_SIZE {
            return Err(RegistryError::TooLarge {
                what: format!("signature envelope {}", blob.digest),
                limit: MAX_SIGNATURE_SIZE,
            });
        }
        let envelope = self.fetch_blob(&blob).await?;
        Ok((blob, envelope))
    }

    /// Manifests listed in the referrers tag index of `subject`.
    async fn referrers_index(&self, subject: &Digest) -> Result<Vec<Descriptor>> {
        let tag = referrers_tag(subject);
        let index = match self.resolve(&tag).await {
            Ok(index) => index,
            Err(RegistryError::NotFound(_)) => return Ok(vec![]),
            Err(e) => return Err(e),
        };
        let data = self.fetch_manifest(&index).await?;
        parse_index(&data)
    }

    /// Adds `manifest` to the referrers tag index of `subject`.
    async fn add_to_referrers_index(&self, subject: &Descriptor, manifest: &Descriptor) -> Result<()> {
        let tag = referrers_tag(&subject.digest);
        for attempt in 1..=INDEX_UPDATE_ATTEMPTS {
            let mut manifests = self.referrers_index(&subject.digest).await?;
            if manifests.iter().any(|d| d.digest == manifest.digest) {
                return Ok(());
            }
            manifests.push(manifest.clone());
            let (data, index) = encode_index(&manifests)?;
            match self.push_manifest(&index, &data, &tag).await {
                Ok(_) => {
                    // Another writer may have replaced the index in between.
                    let current = self.referrers_index(&subject.digest).await?;
                    if current.iter().any(|d| d.digest == manifest.digest) {
                        return Ok(());
                    }
                    debug!("referrers index {tag} was overwritten, attempt {attempt}");
                }
                Err(RegistryError::Conflict(_)) => {
                    debug!("referrers index {tag} update conflicted, attempt {attempt}");
                }
                Err(e) => return Err(e),
            }
        }
        Err(RegistryError::Conflict(tag))
    }
}

/// The referrers tag of a subject, `sha256-<hex>`.
pub fn referrers_tag(subject: &Digest) -> String {
    format!("{}-{}", subject.algorithm(), subject.hex())
}

/// Annotations of a signature manifest: chain thumbprints and creation time.
pub fn signature_annotations(
    chain: &[x509_cert::Certificate],
    created: chrono::DateTime<chrono::Utc>,
) -> crate::Result<BTreeMap<String, String>> {
    let thumbprints = chain
        .iter()
        .map(crate::x509::thumbprint)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut annotations = BTreeMap::new();
    annotations.insert(
        ANNOTATION_THUMBPRINT.to_string(),
        serde_json::to_string(&thumbprints)
            .map_err(|e| RegistryError::InvalidManifest(e.to_string()))?,
    );
    annotations.insert(
        ANNOTATION_CREATED.to_string(),
        created.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );
    Ok(annotations)
}

/// Checks fetched content against its descriptor.
pub(crate) fn verify_content(desc: &Descriptor, data: &[u8]) -> Result<()> {
    let actual = desc.digest.algorithm().digest(data);
    if actual != desc.digest {
        return Err(RegistryError::DigestMismatch {
            expected: desc.digest.clone(),
            actual,
        });
    }
    Ok(())
}

fn invalid(e: impl std::fmt::Display) -> RegistryError {
    RegistryError::InvalidManifest(e.to_string())
}

fn empty_config() -> Descriptor {
    Descriptor::new(
        MEDIA_TYPE_EMPTY_JSON,
        DigestAlgorithm::Sha256.digest(EMPTY_JSON),
        EMPTY_JSON.len() as u64,
    )
}

pub(crate) fn to_oci(desc: &Descriptor) -> Result<OciDescriptor> {
    let mut builder = DescriptorBuilder::default()
        .media_type(MediaType::from(desc.media_type.as_str()))
        .digest(desc.digest.to_string().parse::<OciDigest>().map_err(invalid)?)
        .size(desc.size);
    if !desc.annotations.is_empty() {
        builder = builder.annotations(
            desc.annotations
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
        );
    }
    if let Some(artifact_type) = &desc.artifact_type {
        builder = builder.artifact_type(MediaType::from(artifact_type.as_str()));
    }
    builder.build().map_err(invalid)
}

pub(crate) fn from_oci(desc: &OciDescriptor) -> Result<Descriptor> {
    let digest = desc.digest().to_string().parse().map_err(invalid)?;
    let mut converted = Descriptor::new(desc.media_type().to_string(), digest, desc.size());
    if let Some(annotations) = desc.annotations() {
        converted.annotations = annotations
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
    }
    converted.artifact_type = desc.artifact_type().as_ref().map(ToString::to_string);
    Ok(converted)
}

/// Builds the signature manifest for `blob`, with or without the subject
/// link. The returned descriptor carries the artifact type and annotations
/// so it can be listed in an index as is.
pub(crate) fn signature_manifest(
    subject: &Descriptor,
    blob: &Descriptor,
    annotations: &BTreeMap<String, String>,
    with_subject: bool,
) -> Result<(Vec<u8>, Descriptor)> {
    let mut builder = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .artifact_type(MediaType::from(ARTIFACT_TYPE_SIGNATURE))
        .config(to_oci(&empty_config())?)
        .layers(vec![to_oci(blob)?]);
    if with_subject {
        builder = builder.subject(to_oci(&Descriptor::new(
            subject.media_type.clone(),
            subject.digest.clone(),
            subject.size,
        ))?);
    }
    if !annotations.is_empty() {
        builder = builder.annotations(
            annotations
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
        );
    }
    let manifest: ImageManifest = builder.build().map_err(invalid)?;
    let data = serde_json::to_vec(&manifest).map_err(invalid)?;

    let mut desc = Descriptor::new(
        MEDIA_TYPE_IMAGE_MANIFEST,
        DigestAlgorithm::Sha256.digest(&data),
        data.len() as u64,
    );
    desc.artifact_type = Some(ARTIFACT_TYPE_SIGNATURE.to_string());
    desc.annotations = annotations.clone();
    Ok((data, desc))
}

/// The envelope layer of a signature manifest.
pub(crate) fn signature_layer(data: &[u8]) -> Result<Descriptor> {
    let manifest = ImageManifest::from_reader(data).map_err(invalid)?;
    let artifact_type = manifest
        .artifact_type()
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| manifest.config().media_type().to_string());
    if artifact_type != ARTIFACT_TYPE_SIGNATURE {
        return Err(invalid(format!(
            "artifact type `{artifact_type}` is not a signature"
        )));
    }
    match manifest.layers().as_slice() {
        [layer] => from_oci(layer),
        layers => Err(invalid(format!(
            "signature manifest has {} layers, expected 1",
            layers.len()
        ))),
    }
}

/// The subject digest of a manifest, if it has one.
pub(crate) fn manifest_subject(data: &[u8]) -> Option<Digest> {
    let manifest = ImageManifest::from_reader(data).ok()?;
    manifest
        .subject()
        .as_ref()
        .and_then(|s| s.digest().to_string().parse().ok())
}

pub(crate) fn parse_index(data: &[u8]) -> Result<Vec<Descriptor>> {
    let index = ImageIndex::from_reader(data).map_err(invalid)?;
    index.manifests().iter().map(from_oci).collect()
}

pub(crate) fn encode_index(manifests: &[Descriptor]) -> Result<(Vec<u8>, Descriptor)> {
    let index = ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(
            manifests
                .iter()
                .map(to_oci)
                .collect::<Result<Vec<_>>>()?,
        )
        .build()
        .map_err(invalid)?;
    let data = serde_json::to_vec(&index).map_err(invalid)?;
    let desc = Descriptor::new(
        MEDIA_TYPE_IMAGE_INDEX,
        DigestAlgorithm::Sha256.digest(&data),
        data.len() as u64,
    );
    Ok((data, desc))
}
