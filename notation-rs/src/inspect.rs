// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Human and machine readable summaries of a signature envelope.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::Serialize;
use x509_cert::Certificate;

use crate::{
    descriptor::Descriptor,
    envelope::{Envelope, ParseOptions},
    timestamp::SignedToken,
    x509, Result,
};

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSummary {
    pub subject: String,
    pub issuer: String,
    #[serde(rename = "SHA256Fingerprint")]
    pub sha256_fingerprint: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CertificateSummary {
    fn new(cert: &Certificate) -> Result<Self> {
        Ok(Self {
            subject: x509::subject(cert),
            issuer: cert.tbs_certificate.issuer.to_string(),
            sha256_fingerprint: x509::thumbprint(cert)?,
            issued_at: x509::not_before(cert),
            expires_at: x509::not_after(cert),
        })
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampSummary {
    pub timestamp: DateTime<Utc>,
    pub certificates: Vec<CertificateSummary>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inspection {
    pub media_type: String,
    pub signature_algorithm: String,
    pub signed_attributes: BTreeMap<String, serde_json::Value>,
    pub user_defined_attributes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<TimestampSummary>,
    pub certificates: Vec<CertificateSummary>,
    pub signed_artifact: Descriptor,
}

/// Parses `raw` and summarizes it. The signature itself is not verified.
pub fn inspect(raw: &[u8], media_type: &str) -> Result<Inspection> {
    let envelope = Envelope::parse(media_type, raw, &ParseOptions::verifier())?;
    let content = envelope.content();
    let info = &content.signer_info;
    let signed = &info.signed_attributes;

    let mut signed_attributes = BTreeMap::new();
    signed_attributes.insert(
        "signingScheme".to_string(),
        serde_json::Value::from(signed.signing_scheme.to_string()),
    );
    signed_attributes.insert(
        "signingTime".to_string(),
        serde_json::Value::from(signed.signing_time.to_rfc3339()),
    );
    if let Some(expiry) = signed.expiry {
        signed_attributes.insert(
            "expiry".to_string(),
            serde_json::Value::from(expiry.to_rfc3339()),
        );
    }
    for attribute in &signed.extended_attributes {
        signed_attributes.insert(attribute.key.clone(), attribute.value.clone());
    }

    let timestamp = match &info.unsigned_attributes.timestamp_signature {
        Some(der) => {
            let token = SignedToken::parse(der)?;
            Some(TimestampSummary {
                timestamp: token.gen_time(),
                certificates: token
                    .certificates()
                    .iter()
                    .map(CertificateSummary::new)
                    .collect::<Result<_>>()?,
            })
        }
        None => None,
    };

    let signed_artifact = content.target_artifact()?;
    Ok(Inspection {
        media_type: envelope.media_type().to_string(),
        signature_algorithm: info.signature_algorithm.to_string(),
        signed_attributes,
        user_defined_attributes: signed_artifact.annotations.clone(),
        signing_agent: info.unsigned_attributes.signing_agent.clone(),
        timestamp,
        certificates: info
            .certificate_chain
            .iter()
            .map(CertificateSummary::new)
            .collect::<Result<_>>()?,
        signed_artifact,
    })
}

fn write_certificates(f: &mut fmt::Formatter<'_>, indent: &str, certs: &[CertificateSummary]) -> fmt::Result {
    for cert in certs {
        writeln!(f, "{indent}- {}", cert.subject)?;
        writeln!(f, "{indent}    issuer: {}", cert.issuer)?;
        writeln!(f, "{indent}    SHA256 fingerprint: {}", cert.sha256_fingerprint)?;
        writeln!(f, "{indent}    issued at: {}", cert.issued_at.to_rfc3339())?;
        writeln!(f, "{indent}    expires at: {}", cert.expires_at.to_rfc3339())?;
    }
    Ok(())
}

impl fmt::Display for Inspection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "media type: {}", self.media_type)?;
        writeln!(f, "signature algorithm: {}", self.signature_algorithm)?;
        writeln!(f, "signed attributes:")?;
        for (key, value) in &self.signed_attributes {
            match value {
                serde_json::Value::String(s) => writeln!(f, "    {key}: {s}")?,
                other => writeln!(f, "    {key}: {other}")?,
            }
        }
        if !self.user_defined_attributes.is_empty() {
            writeln!(f, "user defined attributes:")?;
            for (key, value) in &self.user_defined_attributes {
                writeln!(f, "    {key}: {value}")?;
            }
        }
        writeln!(f, "unsigned attributes:")?;
        if let Some(agent) = &self.signing_agent {
            writeln!(f, "    signing agent: {agent}")?;
        }
        if let Some(timestamp) = &self.timestamp {
            writeln!(f, "    timestamp signature:")?;
            writeln!(f, "        timestamp: {}", timestamp.timestamp.to_rfc3339())?;
            writeln!(f, "        certificates:")?;
            write_certificates(f, "            ", &timestamp.certificates)?;
        }
        writeln!(f, "certificates:")?;
        write_certificates(f, "    ", &self.certificates)?;
        writeln!(f, "signed artifact:")?;
        writeln!(f, "    media type: {}", self.signed_artifact.media_type)?;
        writeln!(f, "    digest: {}", self.signed_artifact.digest)?;
        write!(f, "    size: {}", self.signed_artifact.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::PrivateKey,
        digest::DigestAlgorithm,
        envelope::{MEDIA_TYPE_COSE, MEDIA_TYPE_JWS},
        signer::{LocalSigner, SignOptions, Signer},
        x509::parse_der,
    };
    use rstest::rstest;
    use test_utils::TestPki;

    #[rstest]
    #[case(MEDIA_TYPE_JWS)]
    #[case(MEDIA_TYPE_COSE)]
    #[tokio::test]
    async fn test_inspect(#[case] media_type: &str) {
        let pki = TestPki::new();
        let key = PrivateKey::from_pem(&pki.leaf.key_pem()).unwrap();
        let chain = pki.chain_der().iter().map(|d| parse_der(d).unwrap()).collect();
        let signer = Signer::Local(LocalSigner::new(key, chain).unwrap());

        let mut options = SignOptions {
            envelope_media_type: media_type.to_string(),
            expiry_duration: Some(chrono::Duration::days(1)),
            ..Default::default()
        };
        options.user_metadata.insert("buildId".into(), "42".into());
        let descriptor = Descriptor::new(
            "application/vnd.oci.image.manifest.v1+json",
            DigestAlgorithm::Sha256.digest(b"manifest"),
            8,
        );
        let signed = signer.sign(descriptor.clone(), &options).await.unwrap();

        let inspection = inspect(&signed.raw, media_type).unwrap();
        assert_eq!(inspection.media_type, media_type);
        assert_eq!(inspection.signed_artifact.digest, descriptor.digest);
        assert_eq!(inspection.user_defined_attributes["buildId"], "42");
        assert_eq!(inspection.signed_attributes["signingScheme"], "notary.x509");
        assert!(inspection.signed_attributes.contains_key("expiry"));
        assert_eq!(inspection.certificates.len(), 2);
        assert!(inspection.certificates[0].subject.contains("Notation Test Leaf"));
        assert!(inspection.timestamp.is_none());

        let text = inspection.to_string();
        assert!(text.contains("signature algorithm: ECDSA-SHA-256"));
        assert!(text.contains("buildId: 42"));

        let json = serde_json::to_value(&inspection).unwrap();
        assert!(json["certificates"][0]["SHA256Fingerprint"].is_string());
    }
}
