// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    descriptor::Descriptor,
    digest::Digest,
    envelope::{EnvelopeContent, EnvelopeError},
    plugin::PluginError,
    revocation::RevocationError,
    timestamp::TimestampError,
    trustpolicy::{ValidationAction, ValidationType, VerificationLevel},
    truststore::TrustStoreError,
    x509::CertificateError,
};

/// Why a single check on a signature failed.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    TrustStore(#[from] TrustStoreError),

    #[error("signing certificate `{0}` does not match any trusted identity")]
    IdentityMismatch(String),

    #[error("signature expired at {0}")]
    SignatureExpired(DateTime<Utc>),

    #[error("invalid timestamp countersignature")]
    TimestampInvalid(#[from] TimestampError),

    #[error("timestamp authority is not trusted: {0}")]
    TimestampUntrusted(String),

    #[error("certificate `{0}` is revoked")]
    Revoked(String),

    #[error("revocation status of certificate `{0}` is unknown")]
    RevocationUnknown(String),

    #[error("revocation check failed")]
    RevocationCheck(#[from] RevocationError),

    #[error("verification plugin `{name}` failed")]
    Plugin {
        name: String,
        #[source]
        source: PluginError,
    },

    #[error("verification plugin: {0}")]
    PluginRejected(String),

    #[error("signature is for {signed} but the artifact is {actual}")]
    ArtifactMismatch { signed: Digest, actual: Digest },

    #[error("signed artifact media type `{signed}` is not the expected `{expected}`")]
    MediaTypeMismatch { signed: String, expected: String },

    #[error("user metadata {key}={value} is not present in the signature")]
    MetadataMismatch { key: String, value: String },
}

/// The result of one check.
#[derive(Debug)]
pub struct ValidationResult {
    pub check: ValidationType,
    pub action: ValidationAction,
    pub error: Option<CheckError>,
}

impl ValidationResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// A failed check whose action makes the whole signature invalid.
    pub fn is_fatal(&self) -> bool {
        self.error.is_some() && self.action == ValidationAction::Enforce
    }
}

/// Everything learned while verifying one signature.
#[derive(Debug)]
pub struct VerificationOutcome {
    /// sha256 of the raw envelope. Absent when the level skipped verification
    /// before any signature was read.
    pub envelope_digest: Option<Digest>,
    pub envelope: Option<EnvelopeContent>,
    pub signed_descriptor: Option<Descriptor>,
    pub results: Vec<ValidationResult>,
    pub level: VerificationLevel,
    /// Annotations of the signed descriptor.
    pub user_metadata: BTreeMap<String, String>,
    /// The time the signing certificate chain was validated at, when it
    /// came from a timestamp or the signing authority.
    pub authentic_signing_time: Option<DateTime<Utc>>,
    /// A failure outside the per-level checks, always fatal.
    pub error: Option<CheckError>,
}

impl VerificationOutcome {
    pub(crate) fn new(envelope_digest: Option<Digest>, level: VerificationLevel) -> Self {
        Self {
            envelope_digest,
            envelope: None,
            signed_descriptor: None,
            results: vec![],
            level,
            user_metadata: BTreeMap::new(),
            authentic_signing_time: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.results.iter().any(ValidationResult::is_fatal)
    }

    /// The failure that made the signature invalid.
    pub fn failure(&self) -> Option<&CheckError> {
        self.results
            .iter()
            .find(|r| r.is_fatal())
            .and_then(|r| r.error.as_ref())
            .or(self.error.as_ref())
    }

    /// Failed checks that were only logged.
    pub fn warnings(&self) -> impl Iterator<Item = &ValidationResult> {
        self.results
            .iter()
            .filter(|r| r.error.is_some() && r.action == ValidationAction::Log)
    }

    pub fn result(&self, check: ValidationType) -> Option<&ValidationResult> {
        self.results.iter().find(|r| r.check == check)
    }

    pub(crate) fn fail(&mut self, error: CheckError) {
        self.error = Some(error);
    }
}

impl std::fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.envelope_digest, self.failure()) {
            (Some(digest), Some(e)) => write!(f, "signature {digest}: {e}"),
            (Some(digest), None) => write!(f, "signature {digest}: verified ({})", self.level),
            (None, _) => write!(f, "verification skipped ({})", self.level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(action: ValidationAction, fails: bool) -> ValidationResult {
        ValidationResult {
            check: ValidationType::Revocation,
            action,
            error: fails.then(|| CheckError::RevocationUnknown("leaf".into())),
        }
    }

    #[test]
    fn test_success_rules() {
        let mut outcome = VerificationOutcome::new(None, VerificationLevel::Permissive);
        outcome.results.push(result(ValidationAction::Log, true));
        assert!(outcome.is_success());
        assert_eq!(outcome.warnings().count(), 1);
        assert!(outcome.failure().is_none());

        outcome.results.push(result(ValidationAction::Enforce, true));
        assert!(!outcome.is_success());
        assert!(matches!(
            outcome.failure(),
            Some(CheckError::RevocationUnknown(_))
        ));

        let mut outcome = VerificationOutcome::new(None, VerificationLevel::Strict);
        outcome.results.push(result(ValidationAction::Enforce, false));
        outcome.fail(CheckError::MetadataMismatch {
            key: "k".into(),
            value: "v".into(),
        });
        assert!(!outcome.is_success());
    }
}
