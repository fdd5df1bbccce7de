// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;

use async_trait::async_trait;
use log::warn;
use tokio::sync::OnceCell;
use x509_cert::Certificate;

use super::{Result, SignError, SignOptions, SignedEnvelope};
use crate::{
    crypto::{KeySpec, PublicKey, SignatureAlgorithm},
    descriptor::{Descriptor, MEDIA_TYPE_PAYLOAD_V1},
    envelope::{self, Envelope, EnvelopeError, EnvelopeFormat, ParseOptions, PrimitiveSigner},
    plugin::{
        protocol::{
            DescribeKeyRequest, GenerateEnvelopeRequest, GenerateSignatureRequest,
            CONTRACT_VERSION,
        },
        Capability, Plugin,
    },
    x509,
};

/// A key held by a plugin.
#[derive(Debug)]
pub struct PluginSigner {
    plugin: Plugin,
    key_id: String,
    plugin_config: BTreeMap<String, String>,
    key_spec: OnceCell<KeySpec>,
}

fn signing_error(e: impl std::error::Error + Send + Sync + 'static) -> EnvelopeError {
    EnvelopeError::Signing(Box::new(e))
}

impl PluginSigner {
    pub fn new(plugin: Plugin, key_id: &str, plugin_config: BTreeMap<String, String>) -> Self {
        Self {
            plugin,
            key_id: key_id.to_string(),
            plugin_config,
            key_spec: OnceCell::new(),
        }
    }

    pub fn plugin(&self) -> &Plugin {
        &self.plugin
    }

    /// True when the plugin builds the whole envelope itself.
    pub fn generates_envelope(&self) -> bool {
        self.plugin.has_capability(Capability::EnvelopeGenerator)
    }

    /// Plugins that can also verify get named in the signature so verifiers
    /// know which plugin to call.
    pub(crate) fn verification_attributes(&self) -> Vec<envelope::Attribute> {
        let verifies = self.plugin.has_capability(Capability::TrustedIdentityVerifier)
            || self.plugin.has_capability(Capability::RevocationCheckVerifier);
        if !verifies {
            return vec![];
        }
        vec![envelope::Attribute {
            key: envelope::HEADER_VERIFICATION_PLUGIN.to_string(),
            critical: true,
            value: serde_json::Value::String(self.plugin.name().to_string()),
        }]
    }

    async fn describe(&self) -> Result<KeySpec> {
        let spec = self
            .key_spec
            .get_or_try_init(|| async {
                let response = self
                    .plugin
                    .describe_key(&DescribeKeyRequest {
                        contract_version: CONTRACT_VERSION.to_string(),
                        key_id: self.key_id.clone(),
                        plugin_config: self.plugin_config.clone(),
                    })
                    .await?;
                if response.key_id != self.key_id {
                    return Err(SignError::InvalidPluginResponse(format!(
                        "describe-key answered for key `{}` instead of `{}`",
                        response.key_id, self.key_id
                    )));
                }
                response.key_spec.parse::<KeySpec>().map_err(|_| {
                    SignError::InvalidPluginResponse(format!(
                        "unsupported key spec `{}`",
                        response.key_spec
                    ))
                })
            })
            .await?;
        Ok(*spec)
    }

    async fn generate_signature(&self, payload: &[u8]) -> Result<(Vec<u8>, Vec<Certificate>)> {
        let key_spec = self.describe().await?;
        let response = self
            .plugin
            .generate_signature(&GenerateSignatureRequest {
                contract_version: CONTRACT_VERSION.to_string(),
                key_id: self.key_id.clone(),
                key_spec: key_spec.to_string(),
                hash_algorithm: key_spec.hash_algorithm().to_string(),
                payload: payload.to_vec(),
                plugin_config: self.plugin_config.clone(),
            })
            .await?;

        let invalid = |reason: String| SignError::InvalidPluginResponse(reason);
        if response.key_id != self.key_id {
            return Err(invalid(format!(
                "generate-signature answered for key `{}` instead of `{}`",
                response.key_id, self.key_id
            )));
        }
        let algorithm: SignatureAlgorithm = response.signing_algorithm.parse().map_err(|_| {
            invalid(format!(
                "unsupported signing algorithm `{}`",
                response.signing_algorithm
            ))
        })?;
        if algorithm != key_spec.signature_algorithm() {
            return Err(invalid(format!(
                "signing algorithm {algorithm} does not match key spec {key_spec}"
            )));
        }
        let chain = x509::parse_der_chain(&response.certificate_chain)?;
        envelope::check_signer_output(key_spec, &chain)?;
        let leaf = chain.first().ok_or(EnvelopeError::EmptyCertificateChain)?;
        PublicKey::from_certificate(leaf)?
            .verify(algorithm, payload, &response.signature)
            .map_err(|_| invalid("signature does not verify under the returned leaf".into()))?;
        Ok((response.signature, chain))
    }

    /// Asks the plugin for a complete envelope over `descriptor` and checks it
    /// signs what was requested.
    pub(crate) async fn generate_envelope(
        &self,
        descriptor: &Descriptor,
        options: &SignOptions,
    ) -> Result<SignedEnvelope> {
        let format = EnvelopeFormat::from_media_type(&options.envelope_media_type)?;
        let payload = crate::descriptor::Payload::new(descriptor.clone()).to_bytes()?;
        let response = self
            .plugin
            .generate_envelope(&GenerateEnvelopeRequest {
                contract_version: CONTRACT_VERSION.to_string(),
                key_id: self.key_id.clone(),
                payload_type: MEDIA_TYPE_PAYLOAD_V1.to_string(),
                signature_envelope_type: format.media_type().to_string(),
                payload,
                expiry_duration_in_seconds: options
                    .expiry_duration
                    .map(|d| d.num_seconds().max(0) as u64),
                plugin_config: self.plugin_config.clone(),
            })
            .await?;

        let invalid = |reason: String| SignError::InvalidPluginResponse(reason);
        if response.signature_envelope_type != format.media_type() {
            return Err(invalid(format!(
                "asked for a {} envelope but got `{}`",
                format.media_type(),
                response.signature_envelope_type
            )));
        }
        let envelope = Envelope::parse(
            format.media_type(),
            &response.signature_envelope,
            &ParseOptions::verifier(),
        )?;
        envelope.verify_signature()?;
        let signed = envelope.content().target_artifact()?;
        if !signed.equal_identity(descriptor) {
            return Err(invalid(format!(
                "envelope signs {} instead of {}",
                signed.digest, descriptor.digest
            )));
        }
        if let Some((key, _)) = signed.missing_metadata(&descriptor.annotations) {
            return Err(invalid(format!(
                "envelope payload lost annotation `{key}`"
            )));
        }
        if options.timestamper.is_some() {
            warn!(
                "plugin `{}` generated the envelope; timestamping is skipped",
                self.plugin.name()
            );
        }
        Ok(SignedEnvelope {
            raw: response.signature_envelope,
            envelope,
            annotations: response.annotations,
        })
    }
}

#[async_trait]
impl PrimitiveSigner for PluginSigner {
    async fn key_spec(&self) -> envelope::Result<KeySpec> {
        self.describe().await.map_err(signing_error)
    }

    async fn sign(&self, payload: &[u8]) -> envelope::Result<(Vec<u8>, Vec<Certificate>)> {
        self.generate_signature(payload).await.map_err(signing_error)
    }
}
