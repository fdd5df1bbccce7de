// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Wire types of the plugin contract. Every command reads one JSON request
//! from stdin and writes one JSON response to stdout.

use std::{cmp::Ordering, collections::BTreeMap};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

pub const CONTRACT_VERSION: &str = "1.0";

/// Name prefix of plugin executables.
pub const EXECUTABLE_PREFIX: &str = "notation-";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Command {
    GetPluginMetadata,
    DescribeKey,
    GenerateSignature,
    GenerateEnvelope,
    VerifySignature,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, AsRefStr, Display, EnumString,
)]
pub enum Capability {
    #[strum(serialize = "SIGNATURE_GENERATOR.RAW")]
    SignatureGenerator,
    #[strum(serialize = "SIGNATURE_GENERATOR.ENVELOPE")]
    EnvelopeGenerator,
    #[strum(serialize = "SIGNATURE_VERIFIER.TRUSTED_IDENTITY")]
    TrustedIdentityVerifier,
    #[strum(serialize = "SIGNATURE_VERIFIER.REVOCATION_CHECK")]
    RevocationCheckVerifier,
}

/// Error codes a plugin may report on stderr.
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    UnsupportedContractVersion,
    AccessDenied,
    Timeout,
    Throttled,
    GenericError,
}

impl ErrorCode {
    /// Codes outside the contract are treated as generic failures.
    pub fn from_wire(code: &str) -> Self {
        code.parse().unwrap_or(ErrorCode::GenericError)
    }
}

/// Body written to stderr by a plugin that exits with a non-zero status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<BTreeMap<String, String>>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod base64_list {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&STANDARD.encode(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(d)?
            .into_iter()
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMetadataRequest {
    pub contract_version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMetadataResponse {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    pub url: String,
    #[serde(default)]
    pub supported_contract_versions: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl GetMetadataResponse {
    /// Capabilities this library understands. Anything else is ignored.
    pub fn known_capabilities(&self) -> Vec<Capability> {
        self.capabilities
            .iter()
            .filter_map(|c| c.parse().ok())
            .collect()
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.known_capabilities().contains(&capability)
    }

    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("name", &self.name),
            ("version", &self.version),
            ("url", &self.url),
        ] {
            if value.trim().is_empty() {
                return Err(format!("empty {field}"));
            }
        }
        if self.capabilities.is_empty() {
            return Err("no capabilities".into());
        }
        let wanted = major(CONTRACT_VERSION);
        if !self
            .supported_contract_versions
            .iter()
            .any(|v| major(v) == wanted)
        {
            return Err(format!(
                "none of the supported contract versions {:?} is compatible with {CONTRACT_VERSION}",
                self.supported_contract_versions
            ));
        }
        Ok(())
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Compares dotted numeric versions such as `1.2.10`; missing components
/// count as zero and anything after `-` or `+` is ignored.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    fn parts(v: &str) -> Option<Vec<u64>> {
        let core = v.trim_start_matches('v').split(['-', '+']).next()?;
        core.split('.').map(|p| p.parse().ok()).collect()
    }
    let (mut a, mut b) = (parts(a)?, parts(b)?);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    Some(a.cmp(&b))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeKeyRequest {
    pub contract_version: String,
    pub key_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeKeyResponse {
    pub key_id: String,
    pub key_spec: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateSignatureRequest {
    pub contract_version: String,
    pub key_id: String,
    pub key_spec: String,
    pub hash_algorithm: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateSignatureResponse {
    pub key_id: String,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    pub signing_algorithm: String,
    #[serde(with = "base64_list")]
    pub certificate_chain: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateEnvelopeRequest {
    pub contract_version: String,
    pub key_id: String,
    pub payload_type: String,
    pub signature_envelope_type: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_duration_in_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateEnvelopeResponse {
    #[serde(with = "base64_bytes")]
    pub signature_envelope: Vec<u8>,
    pub signature_envelope_type: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalAttributes {
    pub content_type: String,
    pub signing_scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentic_signing_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extended_attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub critical_attributes: CriticalAttributes,
    #[serde(default)]
    pub unprocessed_attributes: Vec<String>,
    #[serde(with = "base64_list")]
    pub certificate_chain: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustPolicyInfo {
    pub trusted_identities: Vec<String>,
    pub signature_verification: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySignatureRequest {
    pub contract_version: String,
    pub signature: SignatureInfo,
    pub trust_policy: TrustPolicyInfo,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySignatureResponse {
    #[serde(default)]
    pub verification_results: BTreeMap<String, VerificationResult>,
    #[serde(default)]
    pub processed_attributes: Vec<String>,
}

impl VerifySignatureResponse {
    pub fn result(&self, capability: Capability) -> Option<&VerificationResult> {
        self.verification_results.get(capability.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_wire_names() {
        assert_eq!(Command::GetPluginMetadata.as_ref(), "get-plugin-metadata");
        assert_eq!(Command::VerifySignature.as_ref(), "verify-signature");
        assert_eq!(
            Capability::EnvelopeGenerator.as_ref(),
            "SIGNATURE_GENERATOR.ENVELOPE"
        );
        assert_eq!(ErrorCode::from_wire("THROTTLED"), ErrorCode::Throttled);
        assert_eq!(ErrorCode::from_wire("BOGUS"), ErrorCode::GenericError);
    }

    #[test]
    fn test_signature_response_base64() {
        let response: GenerateSignatureResponse = serde_json::from_str(
            r#"{"keyId":"k","signature":"AQID","signingAlgorithm":"ECDSA-SHA-256","certificateChain":["BAU="]}"#,
        )
        .unwrap();
        assert_eq!(response.signature, vec![1, 2, 3]);
        assert_eq!(response.certificate_chain, vec![vec![4, 5]]);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["signature"], "AQID");
    }

    fn metadata(versions: &[&str], capabilities: &[&str]) -> GetMetadataResponse {
        GetMetadataResponse {
            name: "example".into(),
            description: String::new(),
            version: "1.0.0".into(),
            url: "https://example.com".into(),
            supported_contract_versions: versions.iter().map(|s| s.to_string()).collect(),
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[rstest]
    #[case(&["1.0"], &["SIGNATURE_GENERATOR.RAW"], true)]
    #[case(&["1.1", "2.0"], &["SIGNATURE_VERIFIER.TRUSTED_IDENTITY"], true)]
    #[case(&["2.0"], &["SIGNATURE_GENERATOR.RAW"], false)]
    #[case(&["1.0"], &[], false)]
    fn test_validate_metadata(
        #[case] versions: &[&str],
        #[case] capabilities: &[&str],
        #[case] valid: bool,
    ) {
        assert_eq!(metadata(versions, capabilities).validate().is_ok(), valid);
    }

    #[test]
    fn test_unknown_capabilities_are_ignored() {
        let meta = metadata(&["1.0"], &["SIGNATURE_GENERATOR.RAW", "FUTURE.THING"]);
        assert_eq!(meta.known_capabilities(), vec![Capability::SignatureGenerator]);
        assert!(!meta.has_capability(Capability::EnvelopeGenerator));
    }

    #[rstest]
    #[case("1.0.0", "1.0", Some(Ordering::Equal))]
    #[case("1.2.10", "1.2.9", Some(Ordering::Greater))]
    #[case("v0.9.0-beta", "1.0.0", Some(Ordering::Less))]
    #[case("abc", "1.0.0", None)]
    fn test_compare_versions(#[case] a: &str, #[case] b: &str, #[case] expected: Option<Ordering>) {
        assert_eq!(compare_versions(a, b), expected);
    }
}
