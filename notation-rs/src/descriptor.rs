// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::Digest;

/// Content type of the signed payload.
pub const MEDIA_TYPE_PAYLOAD_V1: &str = "application/vnd.cncf.notary.payload.v1+json";

/// Default media type of a signed blob.
pub const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Annotation keys in this namespace are reserved.
pub const RESERVED_ANNOTATION_PREFIX: &str = "io.cncf.notary";

pub type Result<T> = std::result::Result<T, DescriptorError>;

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("invalid digest `{0}`")]
    InvalidDigest(String),

    #[error("unsupported digest algorithm `{0}`")]
    UnsupportedDigestAlgorithm(String),

    #[error("malformed payload")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("annotation key `{0}` is reserved")]
    ReservedAnnotation(String),
}

/// Identifies a piece of content by media type, digest and size.
///
/// The JSON form is what ends up signed; its key order follows the field order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: BTreeMap::new(),
            artifact_type: None,
        }
    }

    /// Two descriptors name the same content if media type, digest and size agree.
    pub fn equal_identity(&self, other: &Descriptor) -> bool {
        self.media_type == other.media_type
            && self.digest == other.digest
            && self.size == other.size
    }

    /// Adds user metadata as annotations, refusing the reserved namespace.
    pub fn with_user_metadata(mut self, metadata: &BTreeMap<String, String>) -> Result<Self> {
        for (key, value) in metadata {
            if key.starts_with(RESERVED_ANNOTATION_PREFIX) {
                return Err(DescriptorError::ReservedAnnotation(key.clone()));
            }
            self.annotations.insert(key.clone(), value.clone());
        }
        Ok(self)
    }

    /// Returns the first `(key, expected)` pair that is absent or different.
    pub fn missing_metadata<'a>(
        &self,
        expected: &'a BTreeMap<String, String>,
    ) -> Option<(&'a str, &'a str)> {
        expected
            .iter()
            .find(|(k, v)| self.annotations.get(*k) != Some(*v))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// The signed payload, `{"targetArtifact": <descriptor>}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub target_artifact: Descriptor,
}

impl Payload {
    pub fn new(target_artifact: Descriptor) -> Self {
        Self { target_artifact }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(DescriptorError::MalformedPayload)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(DescriptorError::MalformedPayload)
    }
}
