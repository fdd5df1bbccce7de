// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Notary Project signature envelopes.
//!
//! Two encodings carry the same logical content ([`EnvelopeContent`]):
//! JWS JSON serialization ([`jws`]) and tagged COSE_Sign1 ([`cose`]).
//! An [`Envelope`] remembers the exact bytes it was parsed from so that
//! signature checks run over what was actually signed, not over a
//! re-serialization.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use x509_cert::Certificate;

use crate::{
    crypto::{CryptoError, KeySpec, PublicKey, SignatureAlgorithm},
    descriptor::{Descriptor, DescriptorError, Payload, MEDIA_TYPE_PAYLOAD_V1},
    x509::CertificateError,
};

pub mod cose;
pub mod jws;

pub const MEDIA_TYPE_JWS: &str = "application/jose+json";
pub const MEDIA_TYPE_COSE: &str = "application/cose";

pub const HEADER_SIGNING_SCHEME: &str = "io.cncf.notary.signingScheme";
pub const HEADER_SIGNING_TIME: &str = "io.cncf.notary.signingTime";
pub const HEADER_AUTHENTIC_SIGNING_TIME: &str = "io.cncf.notary.authenticSigningTime";
pub const HEADER_EXPIRY: &str = "io.cncf.notary.expiry";
pub const HEADER_SIGNING_AGENT: &str = "io.cncf.notary.signingAgent";
pub const HEADER_TIMESTAMP_SIGNATURE: &str = "io.cncf.notary.timestampSignature";
pub const HEADER_VERIFICATION_PLUGIN: &str = "io.cncf.notary.verificationPlugin";
pub const HEADER_VERIFICATION_PLUGIN_MIN_VERSION: &str =
    "io.cncf.notary.verificationPluginMinVersion";

/// Upper bound on the size of an envelope we are willing to parse.
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, EnvelopeError>;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("malformed signature envelope: {0}")]
    MalformedEnvelope(String),

    #[error("unsupported signature envelope media type `{0}`")]
    UnsupportedMediaType(String),

    #[error("unknown critical attribute `{0}`")]
    UnknownCriticalAttribute(String),

    #[error("signature algorithm mismatch: {0}")]
    SignatureAlgorithmMismatch(String),

    #[error("signature is not valid")]
    InvalidSignature,

    #[error("certificate chain is empty")]
    EmptyCertificateChain,

    #[error("invalid certificate in envelope")]
    Certificate(#[from] CertificateError),

    #[error("signing failed")]
    Signing(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<CryptoError> for EnvelopeError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AlgorithmMismatch { .. } => {
                EnvelopeError::SignatureAlgorithmMismatch(e.to_string())
            }
            CryptoError::VerificationFailed => EnvelopeError::InvalidSignature,
            other => EnvelopeError::MalformedEnvelope(other.to_string()),
        }
    }
}

impl From<DescriptorError> for EnvelopeError {
    fn from(e: DescriptorError) -> Self {
        EnvelopeError::MalformedEnvelope(e.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EnvelopeFormat {
    Jws,
    Cose,
}

impl EnvelopeFormat {
    pub fn media_type(&self) -> &'static str {
        match self {
            EnvelopeFormat::Jws => MEDIA_TYPE_JWS,
            EnvelopeFormat::Cose => MEDIA_TYPE_COSE,
        }
    }

    pub fn from_media_type(media_type: &str) -> Result<Self> {
        match media_type {
            MEDIA_TYPE_JWS => Ok(EnvelopeFormat::Jws),
            MEDIA_TYPE_COSE => Ok(EnvelopeFormat::Cose),
            other => Err(EnvelopeError::UnsupportedMediaType(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display, EnumString)]
pub enum SigningScheme {
    #[strum(serialize = "notary.x509")]
    X509,
    #[strum(serialize = "notary.x509.signingAuthority")]
    X509SigningAuthority,
}

impl SigningScheme {
    /// Header carrying the signing time under this scheme.
    pub fn signing_time_header(&self) -> &'static str {
        match self {
            SigningScheme::X509 => HEADER_SIGNING_TIME,
            SigningScheme::X509SigningAuthority => HEADER_AUTHENTIC_SIGNING_TIME,
        }
    }
}

/// A signed attribute beyond the standard Notary Project set.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub key: String,
    pub critical: bool,
    pub value: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SignedAttributes {
    pub signing_scheme: SigningScheme,
    pub signing_time: DateTime<Utc>,
    pub expiry: Option<DateTime<Utc>>,
    pub extended_attributes: Vec<Attribute>,
}

impl SignedAttributes {
    pub fn extended_attribute(&self, key: &str) -> Option<&Attribute> {
        self.extended_attributes.iter().find(|a| a.key == key)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnsignedAttributes {
    pub signing_agent: Option<String>,
    pub timestamp_signature: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SignerInfo {
    pub signed_attributes: SignedAttributes,
    pub unsigned_attributes: UnsignedAttributes,
    pub signature_algorithm: SignatureAlgorithm,
    pub signature: Vec<u8>,
    /// Leaf first.
    pub certificate_chain: Vec<Certificate>,
}

/// Format independent view of an envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct EnvelopeContent {
    pub payload_content_type: String,
    pub payload: Vec<u8>,
    pub signer_info: SignerInfo,
}

impl EnvelopeContent {
    /// Decodes the payload into the descriptor of the signed artifact.
    pub fn target_artifact(&self) -> Result<Descriptor> {
        Ok(Payload::from_bytes(&self.payload)?.target_artifact)
    }
}

/// Pre-declared critical attributes the caller knows how to handle.
#[derive(Clone, Debug, Default)]
pub struct ParseOptions {
    pub known_critical: Vec<String>,
}

impl ParseOptions {
    /// Options used by the verifier: the verification plugin attributes are understood.
    pub fn verifier() -> Self {
        Self {
            known_critical: vec![
                HEADER_VERIFICATION_PLUGIN.to_string(),
                HEADER_VERIFICATION_PLUGIN_MIN_VERSION.to_string(),
            ],
        }
    }
}

/// The raw signing primitive behind an envelope: a local key or a
/// `generate-signature` plugin.
#[async_trait]
pub trait PrimitiveSigner: Send + Sync {
    async fn key_spec(&self) -> Result<KeySpec>;

    /// Signs `payload`, returning the raw signature and the leaf-first chain.
    async fn sign(&self, payload: &[u8]) -> Result<(Vec<u8>, Vec<Certificate>)>;
}

/// Everything needed to produce a new envelope.
pub struct SignRequest<'a> {
    pub payload: Vec<u8>,
    pub payload_content_type: String,
    pub signing_scheme: SigningScheme,
    pub signing_time: DateTime<Utc>,
    pub expiry: Option<DateTime<Utc>>,
    pub extended_attributes: Vec<Attribute>,
    pub signing_agent: Option<String>,
    pub signer: &'a dyn PrimitiveSigner,
}

impl<'a> SignRequest<'a> {
    pub fn new(payload: Vec<u8>, signer: &'a dyn PrimitiveSigner) -> Self {
        Self {
            payload,
            payload_content_type: MEDIA_TYPE_PAYLOAD_V1.to_string(),
            signing_scheme: SigningScheme::X509,
            signing_time: Utc::now(),
            expiry: None,
            extended_attributes: vec![],
            signing_agent: None,
            signer,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.payload.is_empty() {
            return Err(EnvelopeError::MalformedEnvelope("payload is empty".into()));
        }
        if self.payload_content_type != MEDIA_TYPE_PAYLOAD_V1 {
            return Err(EnvelopeError::MalformedEnvelope(format!(
                "unsupported payload content type `{}`",
                self.payload_content_type
            )));
        }
        if let Some(expiry) = self.expiry {
            if expiry <= self.signing_time {
                return Err(EnvelopeError::MalformedEnvelope(
                    "expiry must be after signing time".into(),
                ));
            }
        }
        for (i, attr) in self.extended_attributes.iter().enumerate() {
            if is_reserved_header(&attr.key) {
                return Err(EnvelopeError::MalformedEnvelope(format!(
                    "extended attribute `{}` collides with a reserved header",
                    attr.key
                )));
            }
            if self.extended_attributes[..i].iter().any(|a| a.key == attr.key) {
                return Err(EnvelopeError::MalformedEnvelope(format!(
                    "extended attribute `{}` is repeated",
                    attr.key
                )));
            }
        }
        Ok(())
    }
}

/// Header names with a fixed meaning that cannot be reused as extended attributes.
fn is_reserved_header(key: &str) -> bool {
    matches!(
        key,
        "alg"
            | "cty"
            | "crit"
            | HEADER_SIGNING_SCHEME
            | HEADER_SIGNING_TIME
            | HEADER_AUTHENTIC_SIGNING_TIME
            | HEADER_EXPIRY
            | HEADER_SIGNING_AGENT
            | HEADER_TIMESTAMP_SIGNATURE
    )
}

#[derive(Clone, Debug)]
pub enum Envelope {
    Jws(jws::JwsEnvelope),
    Cose(cose::CoseEnvelope),
}

impl Envelope {
    /// Builds and signs a new envelope.
    pub async fn sign(format: EnvelopeFormat, request: SignRequest<'_>) -> Result<Self> {
        request.validate()?;
        let key_spec = request.signer.key_spec().await?;
        match format {
            EnvelopeFormat::Jws => jws::JwsEnvelope::sign(request, key_spec)
                .await
                .map(Envelope::Jws),
            EnvelopeFormat::Cose => cose::CoseEnvelope::sign(request, key_spec)
                .await
                .map(Envelope::Cose),
        }
    }

    pub fn parse(media_type: &str, raw: &[u8], options: &ParseOptions) -> Result<Self> {
        if raw.len() > MAX_ENVELOPE_SIZE {
            return Err(EnvelopeError::MalformedEnvelope(format!(
                "envelope of {} bytes exceeds the {MAX_ENVELOPE_SIZE} byte limit",
                raw.len()
            )));
        }
        let envelope = match EnvelopeFormat::from_media_type(media_type)? {
            EnvelopeFormat::Jws => Envelope::Jws(jws::JwsEnvelope::parse(raw)?),
            EnvelopeFormat::Cose => Envelope::Cose(cose::CoseEnvelope::parse(raw)?),
        };
        envelope.check_critical(options)?;
        Ok(envelope)
    }

    pub fn format(&self) -> EnvelopeFormat {
        match self {
            Envelope::Jws(_) => EnvelopeFormat::Jws,
            Envelope::Cose(_) => EnvelopeFormat::Cose,
        }
    }

    pub fn media_type(&self) -> &'static str {
        self.format().media_type()
    }

    pub fn content(&self) -> &EnvelopeContent {
        match self {
            Envelope::Jws(e) => e.content(),
            Envelope::Cose(e) => e.content(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        match self {
            Envelope::Jws(e) => e.serialize(),
            Envelope::Cose(e) => e.serialize(),
        }
    }

    /// Attaches an RFC 3161 countersignature as an unsigned attribute.
    pub fn set_timestamp_signature(&mut self, token: Vec<u8>) {
        match self {
            Envelope::Jws(e) => e.set_timestamp_signature(token),
            Envelope::Cose(e) => e.set_timestamp_signature(token),
        }
    }

    /// Checks the signature against the leaf certificate of the embedded chain.
    pub fn verify_signature(&self) -> Result<()> {
        let content = self.content();
        let signer_info = &content.signer_info;
        let leaf = signer_info
            .certificate_chain
            .first()
            .ok_or(EnvelopeError::EmptyCertificateChain)?;
        let key = PublicKey::from_certificate(leaf)?;
        check_algorithm(&key, signer_info.signature_algorithm)?;
        let signing_input = match self {
            Envelope::Jws(e) => e.signing_input(),
            Envelope::Cose(e) => e.signing_input(),
        };
        key.verify(
            signer_info.signature_algorithm,
            &signing_input,
            &signer_info.signature,
        )?;
        Ok(())
    }

    /// Critical extended attributes the caller did not declare. Only allowed
    /// when a verification plugin is named to process them.
    pub fn unknown_critical_attributes(&self, options: &ParseOptions) -> Vec<String> {
        self.content()
            .signer_info
            .signed_attributes
            .extended_attributes
            .iter()
            .filter(|a| a.critical && !options.known_critical.contains(&a.key))
            .map(|a| a.key.clone())
            .collect()
    }

    fn check_critical(&self, options: &ParseOptions) -> Result<()> {
        let unknown = self.unknown_critical_attributes(options);
        let has_plugin = self
            .content()
            .signer_info
            .signed_attributes
            .extended_attribute(HEADER_VERIFICATION_PLUGIN)
            .is_some();
        match unknown.into_iter().next() {
            Some(key) if !has_plugin => Err(EnvelopeError::UnknownCriticalAttribute(key)),
            _ => Ok(()),
        }
    }
}

fn check_algorithm(key: &PublicKey, algorithm: SignatureAlgorithm) -> Result<()> {
    let key_spec = key.key_spec()?;
    if key_spec.signature_algorithm() != algorithm {
        return Err(EnvelopeError::SignatureAlgorithmMismatch(format!(
            "envelope declares {algorithm} but the leaf certificate holds a {key_spec} key"
        )));
    }
    Ok(())
}

/// Checks what a [`PrimitiveSigner`] returned before it is embedded.
pub(crate) fn check_signer_output(key_spec: KeySpec, chain: &[Certificate]) -> Result<()> {
    let leaf = chain.first().ok_or(EnvelopeError::EmptyCertificateChain)?;
    check_algorithm(&PublicKey::from_certificate(leaf)?, key_spec.signature_algorithm())
}

/// Envelope times carry second precision.
pub(crate) fn truncate(time: DateTime<Utc>) -> DateTime<Utc> {
    time.trunc_subsecs(0)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{crypto::PrivateKey, digest::DigestAlgorithm, x509::parse_der};
    use rstest::rstest;
    use test_utils::TestPki;

    pub struct TestSigner {
        pub key: PrivateKey,
        pub chain: Vec<Certificate>,
    }

    impl TestSigner {
        pub fn new(pki: &TestPki) -> Self {
            Self {
                key: PrivateKey::from_pem(&pki.leaf.key_pem()).unwrap(),
                chain: pki.chain_der().iter().map(|d| parse_der(d).unwrap()).collect(),
            }
        }
    }

    #[async_trait]
    impl PrimitiveSigner for TestSigner {
        async fn key_spec(&self) -> Result<KeySpec> {
            Ok(self.key.key_spec()?)
        }

        async fn sign(&self, payload: &[u8]) -> Result<(Vec<u8>, Vec<Certificate>)> {
            let alg = self.key.key_spec()?.signature_algorithm();
            Ok((self.key.sign(alg, payload)?, self.chain.clone()))
        }
    }

    pub fn payload() -> Vec<u8> {
        let desc = Descriptor::new(
            "application/vnd.oci.image.manifest.v1+json",
            DigestAlgorithm::Sha256.digest(b"hello"),
            5,
        );
        Payload::new(desc).to_bytes().unwrap()
    }

    async fn sign(format: EnvelopeFormat, signer: &TestSigner) -> Envelope {
        let mut request = SignRequest::new(payload(), signer);
        request.expiry = Some(Utc::now() + chrono::Duration::days(1));
        request.signing_agent = Some("test-agent/1.0".into());
        request.extended_attributes = vec![Attribute {
            key: "buildSystem".into(),
            critical: false,
            value: serde_json::json!("ci"),
        }];
        Envelope::sign(format, request).await.unwrap()
    }

    #[rstest]
    #[case(EnvelopeFormat::Jws)]
    #[case(EnvelopeFormat::Cose)]
    #[tokio::test]
    async fn test_sign_parse_verify(#[case] format: EnvelopeFormat) {
        let pki = TestPki::new();
        let signer = TestSigner::new(&pki);
        let envelope = sign(format, &signer).await;
        envelope.verify_signature().unwrap();

        let raw = envelope.serialize().unwrap();
        let parsed = Envelope::parse(format.media_type(), &raw, &ParseOptions::default()).unwrap();
        assert_eq!(parsed.content(), envelope.content());
        parsed.verify_signature().unwrap();
        assert_eq!(parsed.serialize().unwrap(), raw);

        let signer_info = &parsed.content().signer_info;
        assert_eq!(signer_info.signed_attributes.signing_scheme, SigningScheme::X509);
        assert_eq!(
            signer_info.unsigned_attributes.signing_agent.as_deref(),
            Some("test-agent/1.0")
        );
        assert_eq!(signer_info.certificate_chain.len(), 2);
        assert_eq!(
            parsed.content().target_artifact().unwrap().size,
            5
        );
    }

    fn attribute(key: &str, critical: bool, value: serde_json::Value) -> Attribute {
        Attribute {
            key: key.into(),
            critical,
            value,
        }
    }

    #[rstest]
    #[case(EnvelopeFormat::Jws)]
    #[case(EnvelopeFormat::Cose)]
    #[tokio::test]
    async fn test_extended_attributes_keep_signing_order(#[case] format: EnvelopeFormat) {
        let pki = TestPki::new();
        let signer = TestSigner::new(&pki);
        let attributes = vec![
            attribute("zeta", false, serde_json::json!("last")),
            attribute("com.example.critical", true, serde_json::json!(7)),
            attribute("alpha", false, serde_json::json!(true)),
            attribute("mid", true, serde_json::json!("x")),
        ];
        let mut request = SignRequest::new(payload(), &signer);
        request.expiry = Some(Utc::now() + chrono::Duration::days(1));
        request.extended_attributes = attributes.clone();
        let envelope = Envelope::sign(format, request).await.unwrap();

        let raw = envelope.serialize().unwrap();
        let options = ParseOptions {
            known_critical: vec!["com.example.critical".into(), "mid".into()],
        };
        let parsed = Envelope::parse(format.media_type(), &raw, &options).unwrap();
        assert_eq!(parsed.content(), envelope.content());
        assert_eq!(
            parsed.content().signer_info.signed_attributes.extended_attributes,
            attributes
        );
        parsed.verify_signature().unwrap();
    }

    #[rstest]
    #[case(EnvelopeFormat::Jws)]
    #[case(EnvelopeFormat::Cose)]
    #[tokio::test]
    async fn test_repeated_attribute_is_rejected(#[case] format: EnvelopeFormat) {
        let pki = TestPki::new();
        let signer = TestSigner::new(&pki);
        let mut request = SignRequest::new(payload(), &signer);
        request.extended_attributes = vec![
            attribute("buildId", false, serde_json::json!("1")),
            attribute("buildId", false, serde_json::json!("2")),
        ];
        assert!(matches!(
            Envelope::sign(format, request).await,
            Err(EnvelopeError::MalformedEnvelope(_))
        ));
    }

    #[rstest]
    #[case(EnvelopeFormat::Jws)]
    #[case(EnvelopeFormat::Cose)]
    #[tokio::test]
    async fn test_timestamp_does_not_break_signature(#[case] format: EnvelopeFormat) {
        let pki = TestPki::new();
        let signer = TestSigner::new(&pki);
        let mut envelope = sign(format, &signer).await;
        envelope.set_timestamp_signature(vec![1, 2, 3]);
        let raw = envelope.serialize().unwrap();
        let parsed = Envelope::parse(format.media_type(), &raw, &ParseOptions::default()).unwrap();
        parsed.verify_signature().unwrap();
        assert_eq!(
            parsed
                .content()
                .signer_info
                .unsigned_attributes
                .timestamp_signature,
            Some(vec![1, 2, 3])
        );
    }

    #[rstest]
    #[case(EnvelopeFormat::Jws)]
    #[case(EnvelopeFormat::Cose)]
    #[tokio::test]
    async fn test_unknown_critical_attribute(#[case] format: EnvelopeFormat) {
        let pki = TestPki::new();
        let signer = TestSigner::new(&pki);
        let mut request = SignRequest::new(payload(), &signer);
        request.extended_attributes = vec![Attribute {
            key: "com.example.mustUnderstand".into(),
            critical: true,
            value: serde_json::json!(true),
        }];
        let raw = Envelope::sign(format, request)
            .await
            .unwrap()
            .serialize()
            .unwrap();

        let err = Envelope::parse(format.media_type(), &raw, &ParseOptions::default()).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnknownCriticalAttribute(key) if key == "com.example.mustUnderstand"));

        let options = ParseOptions {
            known_critical: vec!["com.example.mustUnderstand".into()],
        };
        Envelope::parse(format.media_type(), &raw, &options).unwrap();
    }

    #[tokio::test]
    async fn test_reject_bad_requests() {
        let pki = TestPki::new();
        let signer = TestSigner::new(&pki);

        let mut request = SignRequest::new(payload(), &signer);
        request.expiry = Some(request.signing_time - chrono::Duration::seconds(1));
        assert!(matches!(
            Envelope::sign(EnvelopeFormat::Jws, request).await,
            Err(EnvelopeError::MalformedEnvelope(_))
        ));

        let mut request = SignRequest::new(payload(), &signer);
        request.payload_content_type = "application/json".into();
        assert!(Envelope::sign(EnvelopeFormat::Jws, request).await.is_err());

        let mut request = SignRequest::new(payload(), &signer);
        request.extended_attributes = vec![Attribute {
            key: HEADER_EXPIRY.into(),
            critical: true,
            value: serde_json::json!("x"),
        }];
        assert!(Envelope::sign(EnvelopeFormat::Cose, request).await.is_err());
    }

    #[test]
    fn test_unsupported_media_type() {
        assert!(matches!(
            Envelope::parse("application/json", b"{}", &ParseOptions::default()),
            Err(EnvelopeError::UnsupportedMediaType(_))
        ));
    }
}
