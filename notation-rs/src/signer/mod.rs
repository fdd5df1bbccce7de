// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Producing signature envelopes.
//!
//! A [`Signer`] is either a local key pair or a key held by a plugin. Both
//! produce an envelope over the payload describing the target artifact,
//! optionally countersigned by a timestamp authority, and re-verified before
//! it is handed back.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;
use x509_cert::Certificate;

use crate::{
    config::{self, KeyEntry, KeySource},
    crypto::{CryptoError, KeySpec},
    descriptor::{Descriptor, DescriptorError, Payload},
    envelope::{
        Envelope, EnvelopeError, EnvelopeFormat, ParseOptions, PrimitiveSigner, SignRequest,
        MEDIA_TYPE_JWS,
    },
    plugin::{PluginError, PluginManager},
    revocation::{self, RevocationError, RevocationStatus, RevocationValidator},
    timestamp::{TimestampError, TimestampRequest, Timestamper},
    x509::{self, CertificateError, CertificatePurpose},
    SIGNING_AGENT,
};

mod local;
mod plugin;

pub use local::LocalSigner;
pub use plugin::PluginSigner;

pub type Result<T> = std::result::Result<T, SignError>;

#[derive(Error, Debug)]
pub enum SignError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("timestamping failed")]
    Timestamp(#[from] TimestampError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("timestamp certificate revocation check failed")]
    Revocation(#[from] RevocationError),

    #[error("timestamp authority certificate `{0}` is revoked")]
    TimestampRevoked(String),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("invalid plugin response: {0}")]
    InvalidPluginResponse(String),

    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<CryptoError> for SignError {
    fn from(e: CryptoError) -> Self {
        SignError::InvalidKey(e.to_string())
    }
}

/// Per-signature settings.
#[derive(Clone)]
pub struct SignOptions {
    /// The reference being signed, for logging and the referrers link.
    pub artifact_reference: String,
    pub envelope_media_type: String,
    pub expiry_duration: Option<chrono::Duration>,
    pub plugin_config: BTreeMap<String, String>,
    pub user_metadata: BTreeMap<String, String>,
    pub signing_agent: String,
    pub timestamper: Option<Arc<dyn Timestamper>>,
    /// Roots the timestamp token chain must lead to. Without roots the
    /// token is attached unchecked.
    pub tsa_roots: Vec<Certificate>,
    /// Revocation checker for the timestamp token chain.
    pub tsa_revocation: Option<RevocationValidator>,
    pub force_referrers_tag: bool,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            artifact_reference: String::new(),
            envelope_media_type: MEDIA_TYPE_JWS.to_string(),
            expiry_duration: None,
            plugin_config: BTreeMap::new(),
            user_metadata: BTreeMap::new(),
            signing_agent: SIGNING_AGENT.to_string(),
            timestamper: None,
            tsa_roots: vec![],
            tsa_revocation: None,
            force_referrers_tag: false,
        }
    }
}

/// A finished envelope, serialized and parsed.
#[derive(Clone, Debug)]
pub struct SignedEnvelope {
    pub raw: Vec<u8>,
    pub envelope: Envelope,
    /// Annotations a plugin asked to attach to the signature manifest.
    pub annotations: BTreeMap<String, String>,
}

impl SignedEnvelope {
    pub fn media_type(&self) -> &'static str {
        self.envelope.media_type()
    }

    pub fn certificate_chain(&self) -> &[Certificate] {
        &self.envelope.content().signer_info.certificate_chain
    }
}

#[derive(Debug)]
pub enum Signer {
    Local(LocalSigner),
    Plugin(PluginSigner),
}

impl Signer {
    /// Resolves a `signingkeys.json` entry to a signer.
    pub async fn from_key_entry(
        entry: &KeyEntry,
        plugins: &PluginManager,
        plugin_config: &BTreeMap<String, String>,
    ) -> Result<Self> {
        match entry.source()? {
            KeySource::Local {
                key_path,
                cert_path,
            } => Ok(Signer::Local(LocalSigner::from_files(key_path, cert_path)?)),
            KeySource::External {
                id,
                plugin_name,
                plugin_config: key_config,
            } => {
                let mut config = key_config.clone();
                config.extend(plugin_config.clone());
                let plugin = plugins.get(plugin_name).await?;
                Ok(Signer::Plugin(PluginSigner::new(plugin, id, config)))
            }
        }
    }

    /// The spec of the signing key. Its hash algorithm is the digest
    /// algorithm of blob descriptors.
    pub async fn key_spec(&self) -> Result<KeySpec> {
        let spec = match self {
            Signer::Local(signer) => signer.key_spec().await?,
            Signer::Plugin(signer) => signer.key_spec().await?,
        };
        Ok(spec)
    }

    /// Signs `descriptor` with the user metadata of `options` added as
    /// annotations.
    pub async fn sign(&self, descriptor: Descriptor, options: &SignOptions) -> Result<SignedEnvelope> {
        let descriptor = descriptor.with_user_metadata(&options.user_metadata)?;
        debug!(
            "signing {} ({}) as {}",
            options.artifact_reference, descriptor.digest, options.envelope_media_type
        );
        let signed = match self {
            Signer::Plugin(signer) if signer.generates_envelope() => {
                signer.generate_envelope(&descriptor, options).await?
            }
            Signer::Plugin(signer) => {
                let extended = signer.verification_attributes();
                sign_envelope(signer, &descriptor, extended, options).await?
            }
            Signer::Local(signer) => sign_envelope(signer, &descriptor, vec![], options).await?,
        };
        info!(
            "signed {} with certificate `{}`",
            descriptor.digest,
            signed
                .certificate_chain()
                .first()
                .map(x509::subject)
                .unwrap_or_default()
        );
        Ok(signed)
    }
}

async fn sign_envelope(
    signer: &dyn PrimitiveSigner,
    descriptor: &Descriptor,
    extended_attributes: Vec<crate::envelope::Attribute>,
    options: &SignOptions,
) -> Result<SignedEnvelope> {
    let format = EnvelopeFormat::from_media_type(&options.envelope_media_type)?;
    let mut request = SignRequest::new(Payload::new(descriptor.clone()).to_bytes()?, signer);
    let signing_time = Utc::now();
    request.signing_time = signing_time;
    request.expiry = options.expiry_duration.map(|d| signing_time + d);
    request.signing_agent = Some(options.signing_agent.clone());
    request.extended_attributes = extended_attributes;

    let mut envelope = Envelope::sign(format, request).await?;

    if let Some(timestamper) = &options.timestamper {
        let signer_info = &envelope.content().signer_info;
        let ts_request = TimestampRequest::new(
            &signer_info.signature,
            signer_info.signature_algorithm.hash(),
        );
        let (token_der, token) = timestamper.timestamp(&ts_request).await?;
        let tsa_leaf = token.verify(&signer_info.signature)?;
        if !options.tsa_roots.is_empty() {
            let chain = x509::build_chain(tsa_leaf, token.certificates());
            x509::validate_chain(
                &chain,
                &options.tsa_roots,
                CertificatePurpose::Timestamping,
                Some(token.gen_time()),
            )?;
            if let Some(validator) = &options.tsa_revocation {
                let results = validator.validate(&chain).await?;
                match revocation::chain_status(&results) {
                    RevocationStatus::Revoked => {
                        return Err(SignError::TimestampRevoked(x509::subject(tsa_leaf)))
                    }
                    RevocationStatus::Unknown => warn!(
                        "revocation status of timestamp authority `{}` is unknown",
                        x509::subject(tsa_leaf)
                    ),
                    RevocationStatus::Good => {}
                }
            }
        }
        debug!("timestamped signature at {}", token.gen_time());
        envelope.set_timestamp_signature(token_der);
    }

    let raw = envelope.serialize()?;
    // integrity self-check on exactly what will be stored
    let envelope = Envelope::parse(format.media_type(), &raw, &ParseOptions::verifier())?;
    envelope.verify_signature()?;
    Ok(SignedEnvelope {
        raw,
        envelope,
        annotations: BTreeMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::PrivateKey,
        digest::DigestAlgorithm,
        envelope::{MEDIA_TYPE_COSE, HEADER_VERIFICATION_PLUGIN},
        plugin::{
            protocol::{
                DescribeKeyResponse, GenerateEnvelopeResponse, GenerateSignatureResponse,
            },
            tests::{metadata, plugin, ScriptedRunner},
            Capability, Command,
        },
        timestamp::{tests::TestTsa, SignedToken},
        x509::parse_der,
    };
    use async_trait::async_trait;
    use rstest::rstest;
    use test_utils::TestPki;

    fn descriptor() -> Descriptor {
        Descriptor::new(
            "application/vnd.oci.image.manifest.v1+json",
            DigestAlgorithm::Sha256.digest(b"manifest"),
            8,
        )
    }

    fn local(pki: &TestPki) -> Signer {
        let key = PrivateKey::from_pem(&pki.leaf.key_pem()).unwrap();
        let chain = pki.chain_der().iter().map(|d| parse_der(d).unwrap()).collect();
        Signer::Local(LocalSigner::new(key, chain).unwrap())
    }

    #[rstest]
    #[case(MEDIA_TYPE_JWS)]
    #[case(MEDIA_TYPE_COSE)]
    #[tokio::test]
    async fn test_local_sign(#[case] media_type: &str) {
        let pki = TestPki::new();
        let options = SignOptions {
            envelope_media_type: media_type.to_string(),
            expiry_duration: Some(chrono::Duration::hours(1)),
            user_metadata: BTreeMap::from([("buildId".to_string(), "42".to_string())]),
            ..Default::default()
        };
        let signed = local(&pki).sign(descriptor(), &options).await.unwrap();
        assert_eq!(signed.media_type(), media_type);

        let content = signed.envelope.content();
        let target = content.target_artifact().unwrap();
        assert!(target.equal_identity(&descriptor()));
        assert_eq!(target.annotations["buildId"], "42");
        assert!(content.signer_info.signed_attributes.expiry.is_some());
        assert_eq!(
            content.signer_info.unsigned_attributes.signing_agent.as_deref(),
            Some(SIGNING_AGENT)
        );
    }

    #[tokio::test]
    async fn test_reserved_user_metadata() {
        let pki = TestPki::new();
        let options = SignOptions {
            user_metadata: BTreeMap::from([(
                "io.cncf.notary.signingTime".to_string(),
                "x".to_string(),
            )]),
            ..Default::default()
        };
        assert!(matches!(
            local(&pki).sign(descriptor(), &options).await,
            Err(SignError::Descriptor(_))
        ));
    }

    struct FixedTsa(TestTsa);

    #[async_trait]
    impl Timestamper for FixedTsa {
        async fn timestamp(
            &self,
            request: &TimestampRequest,
        ) -> std::result::Result<(Vec<u8>, SignedToken), TimestampError> {
            let info = self
                .0
                .content_info(request.hashed_message.clone(), Utc::now(), Some(request.nonce));
            let der = der::Encode::to_der(&info).unwrap();
            Ok((der.clone(), SignedToken::parse(&der).unwrap()))
        }
    }

    #[tokio::test]
    async fn test_timestamped_sign() {
        let pki = TestPki::new();
        let tsa = TestTsa::new();
        let root = tsa.root_cert();
        let options = SignOptions {
            timestamper: Some(Arc::new(FixedTsa(tsa))),
            tsa_roots: vec![root],
            ..Default::default()
        };
        let signed = local(&pki).sign(descriptor(), &options).await.unwrap();
        let signer_info = &signed.envelope.content().signer_info;
        let token = signer_info
            .unsigned_attributes
            .timestamp_signature
            .as_ref()
            .unwrap();
        SignedToken::parse(token)
            .unwrap()
            .verify(&signer_info.signature)
            .unwrap();

        // a TSA chaining to some other root aborts signing
        let options = SignOptions {
            timestamper: Some(Arc::new(FixedTsa(TestTsa::new()))),
            tsa_roots: vec![TestTsa::new().root_cert()],
            ..Default::default()
        };
        assert!(matches!(
            local(&pki).sign(descriptor(), &options).await,
            Err(SignError::Certificate(_))
        ));
    }

    fn signature_response(pki: &TestPki, payload: &[u8]) -> GenerateSignatureResponse {
        let key = PrivateKey::from_pem(&pki.leaf.key_pem()).unwrap();
        let algorithm = key.key_spec().unwrap().signature_algorithm();
        GenerateSignatureResponse {
            key_id: "key".into(),
            signature: key.sign(algorithm, payload).unwrap(),
            signing_algorithm: algorithm.to_string(),
            certificate_chain: pki.chain_der(),
        }
    }

    /// Signs whatever payload arrives, like a real plugin would.
    struct SigningRunner {
        pki: TestPki,
        inner: ScriptedRunner,
    }

    #[async_trait]
    impl crate::plugin::PluginRunner for SigningRunner {
        async fn run(
            &self,
            executable: &std::path::Path,
            command: Command,
            input: Vec<u8>,
            timeout: std::time::Duration,
        ) -> crate::plugin::Result<crate::plugin::RunOutput> {
            let output = self
                .inner
                .run(executable, command, input.clone(), timeout)
                .await?;
            if command != Command::GenerateSignature || !output.success {
                return Ok(output);
            }
            let request: serde_json::Value = serde_json::from_slice(&input).unwrap();
            let payload = base64::Engine::decode(
                &base64::engine::general_purpose::STANDARD,
                request["payload"].as_str().unwrap(),
            )
            .unwrap();
            Ok(crate::plugin::RunOutput {
                success: true,
                stdout: serde_json::to_vec(&signature_response(&self.pki, &payload)).unwrap(),
                stderr: vec![],
            })
        }
    }

    #[tokio::test]
    async fn test_plugin_sign_after_throttling() {
        let inner = ScriptedRunner::default();
        inner
            .ok(
                Command::GetPluginMetadata,
                metadata(
                    "example",
                    &[Capability::SignatureGenerator, Capability::TrustedIdentityVerifier],
                ),
            )
            .ok(
                Command::DescribeKey,
                DescribeKeyResponse {
                    key_id: "key".into(),
                    key_spec: "EC-256".into(),
                },
            )
            .error(Command::GenerateSignature, "THROTTLED")
            .error(Command::GenerateSignature, "THROTTLED")
            .ok(Command::GenerateSignature, serde_json::json!({}));
        let runner = Arc::new(SigningRunner {
            pki: TestPki::new(),
            inner,
        });
        let plugin = crate::plugin::Plugin::load(
            "example",
            PathBuf::from("notation-example"),
            runner.clone(),
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap()
        .with_backoff(std::time::Duration::from_millis(5));
        let signer = Signer::Plugin(PluginSigner::new(plugin, "key", BTreeMap::new()));

        let signed = signer.sign(descriptor(), &SignOptions::default()).await.unwrap();
        assert_eq!(runner.inner.calls(Command::GenerateSignature), 3);
        let attrs = &signed.envelope.content().signer_info.signed_attributes;
        let plugin_attr = attrs.extended_attribute(HEADER_VERIFICATION_PLUGIN).unwrap();
        assert!(plugin_attr.critical);
        assert_eq!(plugin_attr.value, "example");
    }

    #[tokio::test]
    async fn test_plugin_envelope_must_sign_request() {
        let pki = TestPki::new();
        let other = local(&pki)
            .sign(
                Descriptor::new(
                    "application/vnd.oci.image.manifest.v1+json",
                    DigestAlgorithm::Sha256.digest(b"something else"),
                    14,
                ),
                &SignOptions::default(),
            )
            .await
            .unwrap();

        let runner = Arc::new(ScriptedRunner::default());
        runner
            .ok(
                Command::GetPluginMetadata,
                metadata("example", &[Capability::EnvelopeGenerator]),
            )
            .ok(
                Command::GenerateEnvelope,
                GenerateEnvelopeResponse {
                    signature_envelope: other.raw.clone(),
                    signature_envelope_type: MEDIA_TYPE_JWS.into(),
                    annotations: BTreeMap::new(),
                },
            );
        let signer = Signer::Plugin(PluginSigner::new(
            plugin(runner.clone()).await,
            "key",
            BTreeMap::new(),
        ));
        assert!(matches!(
            signer.sign(descriptor(), &SignOptions::default()).await,
            Err(SignError::InvalidPluginResponse(_))
        ));

        let runner = Arc::new(ScriptedRunner::default());
        runner
            .ok(
                Command::GetPluginMetadata,
                metadata("example", &[Capability::EnvelopeGenerator]),
            )
            .ok(
                Command::GenerateEnvelope,
                GenerateEnvelopeResponse {
                    signature_envelope: other.raw,
                    signature_envelope_type: MEDIA_TYPE_JWS.into(),
                    annotations: BTreeMap::from([("k".to_string(), "v".to_string())]),
                },
            );
        let signer = Signer::Plugin(PluginSigner::new(
            plugin(runner).await,
            "key",
            BTreeMap::new(),
        ));
        let target = other.envelope.content().target_artifact().unwrap();
        let signed = signer.sign(target, &SignOptions::default()).await.unwrap();
        assert_eq!(signed.annotations["k"], "v");
    }
}
