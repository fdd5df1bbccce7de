// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Trust policy documents.
//!
//! A trust policy maps what is being verified (a registry scope for OCI
//! artifacts, a policy name for blobs) to the trust stores, trusted
//! identities and verification level that apply to it. Both documents share
//! the statement body defined here.

use std::{collections::BTreeMap, collections::HashSet, path::PathBuf};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;
use x509_cert::Certificate;

use crate::{
    config,
    truststore::{is_valid_store_name, StoreType},
    x509::name::DistinguishedName,
};

pub mod blob;
pub mod oci;

pub use blob::{BlobPolicyStatement, BlobTrustPolicy};
pub use oci::{OciPolicyStatement, OciTrustPolicy};

pub const SUPPORTED_VERSION: &str = "1.0";

const WILDCARD: &str = "*";
const X509_SUBJECT: &str = "x509.subject";

pub type Result<T> = std::result::Result<T, PolicyError>;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("trust policy {0} does not exist")]
    NotFound(PathBuf),

    #[error("no {0} trust policy is configured")]
    NotConfigured(&'static str),

    #[error("failed to load trust policy")]
    Load(#[from] config::ConfigError),

    #[error("unsupported trust policy version `{0}`")]
    UnsupportedVersion(String),

    #[error("invalid trust policy: {0}")]
    Invalid(String),

    #[error("invalid trust policy statement `{name}`: {reason}")]
    InvalidStatement { name: String, reason: String },

    #[error("no applicable trust policy for `{0}`")]
    NoApplicablePolicy(String),
}

fn invalid(name: &str, reason: impl Into<String>) -> PolicyError {
    PolicyError::InvalidStatement {
        name: name.to_string(),
        reason: reason.into(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VerificationLevel {
    Strict,
    Permissive,
    Audit,
    Skip,
}

/// The individual checks performed on a signature, in execution order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ValidationType {
    Integrity,
    Authenticity,
    AuthenticTimestamp,
    Expiry,
    Revocation,
}

impl ValidationType {
    pub const ALL: [ValidationType; 5] = [
        ValidationType::Integrity,
        ValidationType::Authenticity,
        ValidationType::AuthenticTimestamp,
        ValidationType::Expiry,
        ValidationType::Revocation,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValidationAction {
    Enforce,
    Log,
    Skip,
}

impl VerificationLevel {
    /// Default action of `check` at this level.
    pub fn action(&self, check: ValidationType) -> ValidationAction {
        use ValidationAction::*;
        use ValidationType::*;
        match (self, check) {
            (VerificationLevel::Skip, _) => Skip,
            (_, Integrity | Authenticity) => Enforce,
            (VerificationLevel::Strict, _) => Enforce,
            (VerificationLevel::Permissive, Expiry) => Enforce,
            (VerificationLevel::Permissive, _) => Log,
            (VerificationLevel::Audit, _) => Log,
        }
    }
}

/// When a timestamp countersignature is validated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VerifyTimestamp {
    #[default]
    Always,
    AfterCertExpiry,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureVerification {
    pub level: VerificationLevel,
    #[serde(default, rename = "override", skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<ValidationType, ValidationAction>,
    #[serde(default)]
    pub verify_timestamp: VerifyTimestamp,
}

impl SignatureVerification {
    pub fn new(level: VerificationLevel) -> Self {
        Self {
            level,
            overrides: BTreeMap::new(),
            verify_timestamp: VerifyTimestamp::Always,
        }
    }

    pub fn resolve(&self) -> ResolvedLevel {
        let actions = ValidationType::ALL
            .iter()
            .map(|check| {
                let action = self
                    .overrides
                    .get(check)
                    .copied()
                    .unwrap_or_else(|| self.level.action(*check));
                (*check, action)
            })
            .collect();
        ResolvedLevel {
            level: self.level,
            actions,
        }
    }
}

/// A verification level with overrides applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedLevel {
    pub level: VerificationLevel,
    actions: BTreeMap<ValidationType, ValidationAction>,
}

impl ResolvedLevel {
    pub fn action(&self, check: ValidationType) -> ValidationAction {
        self.actions
            .get(&check)
            .copied()
            .unwrap_or(ValidationAction::Skip)
    }

    pub fn is_skip(&self) -> bool {
        self.level == VerificationLevel::Skip
    }
}

/// A parsed `<type>:<name>` trust store reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrustStoreRef {
    pub store_type: StoreType,
    pub name: String,
}

impl std::str::FromStr for TrustStoreRef {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (store_type, name) = s
            .split_once(':')
            .ok_or_else(|| format!("trust store `{s}` is not of the form <type>:<name>"))?;
        let store_type = store_type
            .parse::<StoreType>()
            .map_err(|_| format!("trust store `{s}` has unsupported type `{store_type}`"))?;
        if !is_valid_store_name(name) {
            return Err(format!("trust store `{s}` has an invalid name"));
        }
        Ok(Self {
            store_type,
            name: name.to_string(),
        })
    }
}

/// A trusted identity predicate matched against the signing certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrustedIdentity {
    Any,
    X509Subject(DistinguishedName),
}

impl TrustedIdentity {
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        if s == WILDCARD {
            return Ok(Self::Any);
        }
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| format!("trusted identity `{s}` is not of the form <type>:<value>"))?;
        if kind != X509_SUBJECT {
            return Err(format!("trusted identity `{s}` has unsupported type `{kind}`"));
        }
        DistinguishedName::parse_identity(value)
            .map(Self::X509Subject)
            .map_err(|e| format!("trusted identity `{s}`: {e}"))
    }

    pub fn matches(&self, leaf: &Certificate) -> bool {
        match self {
            Self::Any => true,
            Self::X509Subject(dn) => {
                dn.is_subset_of(&DistinguishedName::from_name(&leaf.tbs_certificate.subject))
            }
        }
    }
}

/// The part of a statement shared by OCI and blob policies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatement {
    pub name: String,
    pub signature_verification: SignatureVerification,
    #[serde(default)]
    pub trust_stores: Vec<String>,
    #[serde(default)]
    pub trusted_identities: Vec<String>,
}

impl PolicyStatement {
    pub fn resolved_level(&self) -> ResolvedLevel {
        self.signature_verification.resolve()
    }

    /// Parsed trust store references. Only valid statements reach callers,
    /// so malformed entries were already rejected at load time.
    pub fn trust_store_refs(&self) -> Vec<TrustStoreRef> {
        self.trust_stores
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }

    pub fn identities(&self) -> Vec<TrustedIdentity> {
        self.trusted_identities
            .iter()
            .filter_map(|s| TrustedIdentity::parse(s).ok())
            .collect()
    }

    pub fn stores_of(&self, store_type: StoreType) -> Vec<String> {
        self.trust_store_refs()
            .into_iter()
            .filter(|r| r.store_type == store_type)
            .map(|r| r.name)
            .collect()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let name = self.name.as_str();
        if name.trim().is_empty() {
            return Err(PolicyError::Invalid("statement name must not be empty".into()));
        }

        let verification = &self.signature_verification;
        if verification.level == VerificationLevel::Skip {
            if !verification.overrides.is_empty() {
                return Err(invalid(name, "level `skip` does not allow overrides"));
            }
            if !self.trust_stores.is_empty() || !self.trusted_identities.is_empty() {
                return Err(invalid(
                    name,
                    "level `skip` must not have trust stores or trusted identities",
                ));
            }
            return Ok(());
        }

        for check in [ValidationType::Integrity, ValidationType::Authenticity] {
            if verification.overrides.contains_key(&check) {
                return Err(invalid(name, format!("`{check}` cannot be overridden")));
            }
        }

        if self.trust_stores.is_empty() {
            return Err(invalid(name, "no trust stores"));
        }
        let mut seen = HashSet::new();
        for store in &self.trust_stores {
            store
                .parse::<TrustStoreRef>()
                .map_err(|reason| invalid(name, reason))?;
            if !seen.insert(store) {
                return Err(invalid(name, format!("duplicate trust store `{store}`")));
            }
        }
        if self.stores_of(StoreType::Ca).is_empty()
            && self.stores_of(StoreType::SigningAuthority).is_empty()
        {
            return Err(invalid(
                name,
                "at least one `ca` or `signingAuthority` trust store is required",
            ));
        }

        if self.trusted_identities.is_empty() {
            return Err(invalid(name, "no trusted identities"));
        }
        let mut seen = HashSet::new();
        for identity in &self.trusted_identities {
            if identity == WILDCARD && self.trusted_identities.len() > 1 {
                return Err(invalid(
                    name,
                    "wildcard identity `*` cannot be mixed with other identities",
                ));
            }
            TrustedIdentity::parse(identity).map_err(|reason| invalid(name, reason))?;
            if !seen.insert(identity) {
                return Err(invalid(name, format!("duplicate trusted identity `{identity}`")));
            }
        }
        Ok(())
    }
}

fn check_version(version: &str) -> Result<()> {
    if version != SUPPORTED_VERSION {
        return Err(PolicyError::UnsupportedVersion(version.to_string()));
    }
    Ok(())
}

fn check_unique_names<'a>(names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(PolicyError::Invalid(format!(
                "multiple statements are named `{name}`"
            )));
        }
    }
    Ok(())
}

fn load_document<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Result<T> {
    config::load_json(path)?.ok_or_else(|| PolicyError::NotFound(path.to_path_buf()))
}
