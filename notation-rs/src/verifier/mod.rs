// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Verification of signature envelopes against a trust policy statement.
//!
//! Checks run in a fixed order: integrity, authenticity, authentic
//! timestamp, expiry, revocation, then whatever a verification plugin was
//! asked to do, and finally the user metadata the caller expects. The
//! statement's verification level decides whether a failed check stops the
//! signature, is logged, or is not run at all.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;
use x509_cert::Certificate;

use crate::{
    config::Timeouts,
    digest::DigestAlgorithm,
    dir::ConfigDirs,
    envelope::{
        Envelope, EnvelopeError, ParseOptions, SigningScheme, HEADER_VERIFICATION_PLUGIN,
        HEADER_VERIFICATION_PLUGIN_MIN_VERSION,
    },
    plugin::{
        protocol::{
            compare_versions, CriticalAttributes, SignatureInfo, TrustPolicyInfo,
            VerifySignatureRequest, CONTRACT_VERSION,
        },
        Capability, Plugin, PluginManager,
    },
    revocation::{self, FileCache, RevocationStatus, RevocationValidator},
    timestamp::SignedToken,
    trustpolicy::{
        BlobTrustPolicy, OciTrustPolicy, PolicyError, PolicyStatement, ResolvedLevel,
        ValidationAction, ValidationType, VerifyTimestamp,
    },
    truststore::{StoreType, TrustStore, X509TrustStore},
    x509::{self, CertificatePurpose},
};

mod outcome;

pub use outcome::{CheckError, ValidationResult, VerificationOutcome};

pub type Result<T> = std::result::Result<T, VerificationError>;

/// Default number of signatures examined per artifact.
pub const DEFAULT_MAX_SIGNATURE_ATTEMPTS: usize = 100;

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("no signature is associated with `{0}`")]
    NoSignature(String),

    #[error("signature verification failed for `{reference}`{}", describe(.outcomes))]
    NoneValid {
        reference: String,
        outcomes: Vec<VerificationOutcome>,
    },
}

fn describe(outcomes: &[VerificationOutcome]) -> String {
    outcomes
        .iter()
        .map(|o| format!("\n  {o}"))
        .collect::<String>()
}

/// Per-artifact verification settings.
#[derive(Clone, Debug)]
pub struct VerifyOptions {
    pub artifact_reference: String,
    pub plugin_config: BTreeMap<String, String>,
    /// Annotations every accepted signature must carry.
    pub user_metadata: BTreeMap<String, String>,
    pub max_signature_attempts: usize,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            artifact_reference: String::new(),
            plugin_config: BTreeMap::new(),
            user_metadata: BTreeMap::new(),
            max_signature_attempts: DEFAULT_MAX_SIGNATURE_ATTEMPTS,
        }
    }
}

/// Holds what the user trusts and verifies envelopes against it.
pub struct Verifier {
    oci_policy: Option<OciTrustPolicy>,
    blob_policy: Option<BlobTrustPolicy>,
    trust_store: Arc<dyn TrustStore>,
    revocation: RevocationValidator,
    plugins: Option<PluginManager>,
}

impl Verifier {
    pub fn new(trust_store: Arc<dyn TrustStore>, revocation: RevocationValidator) -> Self {
        Self {
            oci_policy: None,
            blob_policy: None,
            trust_store,
            revocation,
            plugins: None,
        }
    }

    /// Builds a verifier from the user's configuration directory. Missing
    /// policy documents are only an error once a verification needs them.
    pub fn from_dirs(dirs: &ConfigDirs, timeouts: &Timeouts) -> crate::Result<Self> {
        let oci_policy = optional(OciTrustPolicy::load(&dirs.oci_trust_policy()))?;
        let blob_policy = optional(BlobTrustPolicy::load(&dirs.blob_trust_policy()))?;
        let cache = Arc::new(FileCache::new(dirs.crl_cache()));
        let mut verifier = Self::new(
            Arc::new(X509TrustStore::new(dirs.trust_store())),
            RevocationValidator::new(timeouts, Some(cache))?,
        )
        .with_plugins(PluginManager::new(dirs.plugins(), timeouts.plugin));
        verifier.oci_policy = oci_policy;
        verifier.blob_policy = blob_policy;
        Ok(verifier)
    }

    pub fn with_oci_policy(mut self, policy: OciTrustPolicy) -> Self {
        self.oci_policy = Some(policy);
        self
    }

    pub fn with_blob_policy(mut self, policy: BlobTrustPolicy) -> Self {
        self.blob_policy = Some(policy);
        self
    }

    pub fn with_plugins(mut self, plugins: PluginManager) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// The statement governing an OCI artifact reference. Pure lookup, so
    /// callers can fail before touching the registry or any signature.
    pub fn oci_statement(&self, reference: &str) -> std::result::Result<&PolicyStatement, PolicyError> {
        self.oci_policy
            .as_ref()
            .ok_or(PolicyError::NotConfigured("OCI"))?
            .statement_for(reference)
    }

    /// The statement named `name`, or the global one.
    pub fn blob_statement(
        &self,
        name: Option<&str>,
    ) -> std::result::Result<&PolicyStatement, PolicyError> {
        self.blob_policy
            .as_ref()
            .ok_or(PolicyError::NotConfigured("blob"))?
            .statement_for(name)
    }

    /// Verifies one envelope under `statement`.
    ///
    /// Never fails outright: every problem is recorded in the returned
    /// outcome, whose [`VerificationOutcome::is_success`] gives the verdict.
    pub async fn verify(
        &self,
        statement: &PolicyStatement,
        raw: &[u8],
        media_type: &str,
        options: &VerifyOptions,
    ) -> VerificationOutcome {
        let level = statement.resolved_level();
        let digest = DigestAlgorithm::Sha256.digest(raw);
        let mut check = SignatureCheck {
            verifier: self,
            statement,
            outcome: VerificationOutcome::new(Some(digest.clone()), level.level),
            level,
            options,
            now: Utc::now(),
        };
        if check.level.is_skip() {
            debug!("trust policy `{}` skips verification", statement.name);
            return check.outcome;
        }
        if check.run(raw, media_type).await.is_ok() {
            info!(
                "signature {digest} verified under trust policy `{}` ({})",
                statement.name, check.outcome.level
            );
        } else {
            debug!("signature {digest} rejected: {}", check.outcome);
        }
        check.outcome
    }
}

fn optional<T>(loaded: std::result::Result<T, PolicyError>) -> std::result::Result<Option<T>, PolicyError> {
    match loaded {
        Ok(policy) => Ok(Some(policy)),
        Err(PolicyError::NotFound(path)) => {
            debug!("no trust policy at {}", path.display());
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Returned once a signature has failed for good.
struct Stop;

/// State of the verification of one signature.
struct SignatureCheck<'a> {
    verifier: &'a Verifier,
    statement: &'a PolicyStatement,
    level: ResolvedLevel,
    options: &'a VerifyOptions,
    outcome: VerificationOutcome,
    now: DateTime<Utc>,
}

impl SignatureCheck<'_> {
    fn enabled(&self, check: ValidationType) -> bool {
        self.level.action(check) != ValidationAction::Skip
    }

    fn record(
        &mut self,
        check: ValidationType,
        result: std::result::Result<(), CheckError>,
    ) -> std::result::Result<(), Stop> {
        let action = self.level.action(check);
        let error = result.err();
        let stop = error.is_some() && action == ValidationAction::Enforce;
        if let Some(e) = &error {
            if action == ValidationAction::Log {
                warn!(
                    "{check} check failed for signature {} and is only logged: {e}",
                    self.digest()
                );
            }
        }
        self.outcome.results.push(ValidationResult {
            check,
            action,
            error,
        });
        if stop {
            Err(Stop)
        } else {
            Ok(())
        }
    }

    fn fail(&mut self, error: CheckError) -> Stop {
        self.outcome.fail(error);
        Stop
    }

    fn digest(&self) -> String {
        self.outcome
            .envelope_digest
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    async fn run(&mut self, raw: &[u8], media_type: &str) -> std::result::Result<(), Stop> {
        let parsed = Envelope::parse(media_type, raw, &ParseOptions::verifier()).and_then(|e| {
            e.verify_signature()?;
            let descriptor = e.content().target_artifact()?;
            Ok((e, descriptor))
        });
        let (envelope, descriptor) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                self.record(ValidationType::Integrity, Err(e.into()))?;
                return Err(Stop);
            }
        };
        self.record(ValidationType::Integrity, Ok(()))?;
        self.outcome.envelope = Some(envelope.content().clone());
        self.outcome.user_metadata = descriptor.annotations.clone();
        self.outcome.signed_descriptor = Some(descriptor.clone());

        let plugin = self.verification_plugin(&envelope).await?;
        let delegated = |capability| plugin.as_ref().is_some_and(|p| p.has_capability(capability));
        let delegate_identity = delegated(Capability::TrustedIdentityVerifier);
        let delegate_revocation = delegated(Capability::RevocationCheckVerifier);

        let signer_info = &envelope.content().signer_info;
        let chain = &signer_info.certificate_chain;
        let authenticity = self.authenticate(signer_info.signed_attributes.signing_scheme, chain, delegate_identity);
        self.record(ValidationType::Authenticity, authenticity)?;

        if self.enabled(ValidationType::AuthenticTimestamp) {
            let result = self.authentic_time(&envelope).await;
            let result = result.map(|time| self.outcome.authentic_signing_time = time);
            self.record(ValidationType::AuthenticTimestamp, result)?;
        }

        if self.enabled(ValidationType::Expiry) {
            let result = match signer_info.signed_attributes.expiry {
                Some(expiry) if self.now > expiry => Err(CheckError::SignatureExpired(expiry)),
                _ => Ok(()),
            };
            self.record(ValidationType::Expiry, result)?;
        }

        if self.enabled(ValidationType::Revocation) && !delegate_revocation {
            let result = self.check_revocation(chain).await;
            self.record(ValidationType::Revocation, result)?;
        }

        if let Some(plugin) = &plugin {
            self.plugin_checks(plugin, &envelope).await?;
        } else if let Some(key) = envelope
            .unknown_critical_attributes(&ParseOptions::verifier())
            .into_iter()
            .next()
        {
            return Err(self.fail(EnvelopeError::UnknownCriticalAttribute(key).into()));
        }

        if let Some((key, value)) = descriptor.missing_metadata(&self.options.user_metadata) {
            return Err(self.fail(CheckError::MetadataMismatch {
                key: key.to_string(),
                value: value.to_string(),
            }));
        }
        Ok(())
    }

    /// Loads the plugin the signature names, if any, and checks its version.
    async fn verification_plugin(
        &mut self,
        envelope: &Envelope,
    ) -> std::result::Result<Option<Plugin>, Stop> {
        let attributes = &envelope.content().signer_info.signed_attributes;
        let Some(name) = attributes
            .extended_attribute(HEADER_VERIFICATION_PLUGIN)
            .and_then(|a| a.value.as_str())
        else {
            return Ok(None);
        };
        let Some(plugins) = &self.verifier.plugins else {
            return Err(self.fail(CheckError::PluginRejected(format!(
                "signature requires verification plugin `{name}` but plugins are not available"
            ))));
        };
        let plugin = match plugins.get(name).await {
            Ok(plugin) => plugin,
            Err(source) => {
                return Err(self.fail(CheckError::Plugin {
                    name: name.to_string(),
                    source,
                }))
            }
        };
        if let Some(minimum) = attributes
            .extended_attribute(HEADER_VERIFICATION_PLUGIN_MIN_VERSION)
            .and_then(|a| a.value.as_str())
        {
            let version = &plugin.metadata().version;
            match compare_versions(version, minimum) {
                Some(std::cmp::Ordering::Less) | None => {
                    return Err(self.fail(CheckError::PluginRejected(format!(
                        "plugin `{name}` version {version} is older than the required {minimum}"
                    ))))
                }
                _ => {}
            }
        }
        Ok(Some(plugin))
    }

    fn trusted_roots(&self, store_type: StoreType) -> std::result::Result<Vec<Certificate>, CheckError> {
        let mut roots = Vec::new();
        for name in self.statement.stores_of(store_type) {
            roots.extend(self.verifier.trust_store.certificates(store_type, &name)?);
        }
        Ok(roots)
    }

    fn authenticate(
        &self,
        scheme: SigningScheme,
        chain: &[Certificate],
        delegate_identity: bool,
    ) -> std::result::Result<(), CheckError> {
        let store_type = match scheme {
            SigningScheme::X509 => StoreType::Ca,
            SigningScheme::X509SigningAuthority => StoreType::SigningAuthority,
        };
        let roots = self.trusted_roots(store_type)?;
        x509::validate_chain(chain, &roots, CertificatePurpose::CodeSigning, None)?;
        if delegate_identity {
            return Ok(());
        }
        let leaf = chain.first().ok_or(EnvelopeError::EmptyCertificateChain)?;
        if self.statement.identities().iter().any(|i| i.matches(leaf)) {
            Ok(())
        } else {
            Err(CheckError::IdentityMismatch(x509::subject(leaf)))
        }
    }

    /// Finds the time at which the signing chain must be valid. Returns the
    /// time when it came from the signature rather than the clock.
    async fn authentic_time(
        &self,
        envelope: &Envelope,
    ) -> std::result::Result<Option<DateTime<Utc>>, CheckError> {
        let signer_info = &envelope.content().signer_info;
        let chain = &signer_info.certificate_chain;
        let attributes = &signer_info.signed_attributes;

        if attributes.signing_scheme == SigningScheme::X509SigningAuthority {
            x509::check_validity(chain, attributes.signing_time)?;
            return Ok(Some(attributes.signing_time));
        }

        let valid_now = x509::check_validity(chain, self.now);
        let token = signer_info.unsigned_attributes.timestamp_signature.as_deref();
        let after_expiry_only =
            self.statement.signature_verification.verify_timestamp == VerifyTimestamp::AfterCertExpiry;
        let token = match (token, valid_now) {
            (None, valid_now) => return valid_now.map(|_| None).map_err(Into::into),
            (Some(_), Ok(())) if after_expiry_only => return Ok(None),
            (Some(token), _) => token,
        };

        let (earliest, latest, gen_time) = self.verify_timestamp(token, &signer_info.signature).await?;
        x509::check_validity(chain, earliest)?;
        x509::check_validity(chain, latest)?;
        debug!("signing certificate chain validated at timestamp {gen_time}");
        Ok(Some(gen_time))
    }

    async fn verify_timestamp(
        &self,
        der: &[u8],
        signature: &[u8],
    ) -> std::result::Result<(DateTime<Utc>, DateTime<Utc>, DateTime<Utc>), CheckError> {
        let token = SignedToken::parse(der)?;
        let tsa_leaf = token.verify(signature)?;
        let roots = self.trusted_roots(StoreType::Tsa)?;
        if roots.is_empty() {
            return Err(CheckError::TimestampUntrusted(format!(
                "trust policy `{}` names no tsa trust store",
                self.statement.name
            )));
        }
        let chain = x509::build_chain(tsa_leaf, token.certificates());
        let gen_time = token.gen_time();
        x509::validate_chain(&chain, &roots, CertificatePurpose::Timestamping, Some(gen_time))
            .map_err(|e| CheckError::TimestampUntrusted(e.to_string()))?;

        let results = self.verifier.revocation.validate(&chain).await?;
        match revocation::chain_status(&results) {
            RevocationStatus::Revoked => {
                return Err(CheckError::TimestampUntrusted(format!(
                    "timestamp authority certificate `{}` is revoked",
                    x509::subject(tsa_leaf)
                )))
            }
            RevocationStatus::Unknown => warn!(
                "revocation status of timestamp authority `{}` is unknown",
                x509::subject(tsa_leaf)
            ),
            RevocationStatus::Good => {}
        }
        let (earliest, latest) = token.time_range();
        Ok((earliest, latest, gen_time))
    }

    async fn check_revocation(&self, chain: &[Certificate]) -> std::result::Result<(), CheckError> {
        let results = self.verifier.revocation.validate(chain).await?;
        let subject_with = |status| {
            chain
                .iter()
                .zip(&results)
                .find(|(_, r)| r.status == status)
                .map(|(cert, _)| x509::subject(cert))
                .unwrap_or_default()
        };
        match revocation::chain_status(&results) {
            RevocationStatus::Good => Ok(()),
            RevocationStatus::Revoked => Err(CheckError::Revoked(subject_with(RevocationStatus::Revoked))),
            RevocationStatus::Unknown => Err(CheckError::RevocationUnknown(subject_with(
                RevocationStatus::Unknown,
            ))),
        }
    }

    /// Hands the checks the plugin claims to the plugin and records its
    /// verdicts.
    async fn plugin_checks(&mut self, plugin: &Plugin, envelope: &Envelope) -> std::result::Result<(), Stop> {
        let mut requested = Vec::new();
        if plugin.has_capability(Capability::TrustedIdentityVerifier) {
            requested.push((Capability::TrustedIdentityVerifier, ValidationType::Authenticity));
        }
        if plugin.has_capability(Capability::RevocationCheckVerifier)
            && self.enabled(ValidationType::Revocation)
        {
            requested.push((Capability::RevocationCheckVerifier, ValidationType::Revocation));
        }
        let unprocessed = envelope.unknown_critical_attributes(&ParseOptions::verifier());
        if requested.is_empty() {
            if let Some(key) = unprocessed.into_iter().next() {
                return Err(self.fail(EnvelopeError::UnknownCriticalAttribute(key).into()));
            }
            return Ok(());
        }

        let request = match self.plugin_request(envelope, unprocessed.clone(), &requested) {
            Ok(request) => request,
            Err(e) => return Err(self.fail(e)),
        };
        let response = match plugin.verify_signature(&request).await {
            Ok(response) => response,
            Err(source) => {
                return Err(self.fail(CheckError::Plugin {
                    name: plugin.name().to_string(),
                    source,
                }))
            }
        };

        for (capability, check) in requested {
            let Some(result) = response.result(capability) else {
                return Err(self.fail(CheckError::PluginRejected(format!(
                    "plugin `{}` returned no result for {capability}",
                    plugin.name()
                ))));
            };
            let verdict = if result.success {
                Ok(())
            } else {
                Err(CheckError::PluginRejected(
                    result
                        .reason
                        .clone()
                        .unwrap_or_else(|| format!("{capability} failed")),
                ))
            };
            self.record(check, verdict)?;
        }

        if let Some(key) = unprocessed
            .into_iter()
            .find(|key| !response.processed_attributes.contains(key))
        {
            return Err(self.fail(EnvelopeError::UnknownCriticalAttribute(key).into()));
        }
        Ok(())
    }

    fn plugin_request(
        &self,
        envelope: &Envelope,
        unprocessed: Vec<String>,
        requested: &[(Capability, ValidationType)],
    ) -> std::result::Result<VerifySignatureRequest, CheckError> {
        let content = envelope.content();
        let attributes = &content.signer_info.signed_attributes;
        let authentic_signing_time = (attributes.signing_scheme
            == SigningScheme::X509SigningAuthority)
            .then_some(attributes.signing_time);
        let certificate_chain = content
            .signer_info
            .certificate_chain
            .iter()
            .map(x509::to_der)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(VerifySignatureRequest {
            contract_version: CONTRACT_VERSION.to_string(),
            signature: SignatureInfo {
                critical_attributes: CriticalAttributes {
                    content_type: content.payload_content_type.clone(),
                    signing_scheme: attributes.signing_scheme.to_string(),
                    expiry: attributes.expiry,
                    authentic_signing_time,
                    extended_attributes: attributes
                        .extended_attributes
                        .iter()
                        .filter(|a| a.critical)
                        .map(|a| (a.key.clone(), a.value.clone()))
                        .collect(),
                },
                unprocessed_attributes: unprocessed,
                certificate_chain,
            },
            trust_policy: TrustPolicyInfo {
                trusted_identities: self.statement.trusted_identities.clone(),
                signature_verification: requested.iter().map(|(c, _)| c.to_string()).collect(),
            },
            plugin_config: self.options.plugin_config.clone(),
        })
    }
}
