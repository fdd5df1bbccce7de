// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Signing and verification of artifacts stored in an OCI registry.

use std::collections::BTreeMap;

use chrono::Utc;
use log::{info, warn};

use crate::{
    descriptor::Descriptor,
    registry::{signature_annotations, Reference, RegistryError, Repository, SignatureList},
    signer::{SignOptions, SignedEnvelope, Signer},
    trustpolicy::VerificationLevel,
    verifier::{CheckError, VerificationError, VerificationOutcome, Verifier, VerifyOptions},
    Result,
};

/// A signature pushed next to its artifact.
#[derive(Debug)]
pub struct SignResult {
    pub artifact: Descriptor,
    /// The signature manifest.
    pub signature: Descriptor,
    pub envelope: SignedEnvelope,
}

/// The outcome of verifying an artifact.
#[derive(Debug)]
pub struct VerifyResult {
    /// Absent when the trust policy skips verification.
    pub artifact: Option<Descriptor>,
    pub outcome: VerificationOutcome,
    /// Signatures examined without success.
    pub rejected: Vec<VerificationOutcome>,
}

/// Resolves the artifact a reference points at, warning when a tag was used.
pub async fn resolve(repo: &dyn Repository, reference: &Reference) -> Result<Descriptor> {
    let target = reference.manifest_reference().ok_or_else(|| {
        RegistryError::InvalidReference(format!("`{reference}` has neither tag nor digest"))
    })?;
    let artifact = repo.resolve(&target).await?;
    if reference.digest().is_none() {
        warn!(
            "resolved tag `{}` to {}; tags are mutable, prefer {}",
            target,
            artifact.digest,
            reference.with_digest(artifact.digest.clone())
        );
    }
    Ok(artifact)
}

/// Signs the artifact `reference` names and pushes the signature.
pub async fn sign(
    signer: &Signer,
    repo: &dyn Repository,
    reference: &Reference,
    options: &SignOptions,
) -> Result<SignResult> {
    let artifact = resolve(repo, reference).await?;
    let mut options = options.clone();
    if options.artifact_reference.is_empty() {
        options.artifact_reference = reference.with_digest(artifact.digest.clone()).to_string();
    }

    let subject = Descriptor::new(
        artifact.media_type.clone(),
        artifact.digest.clone(),
        artifact.size,
    );
    let envelope = signer.sign(subject, &options).await?;

    let mut annotations: BTreeMap<String, String> = envelope.annotations.clone();
    annotations.extend(signature_annotations(envelope.certificate_chain(), Utc::now())?);
    let (_, signature) = repo
        .push_signature(
            &artifact,
            envelope.media_type(),
            &envelope.raw,
            &annotations,
            options.force_referrers_tag,
        )
        .await?;
    info!(
        "pushed signature {} for {}",
        signature.digest, options.artifact_reference
    );
    Ok(SignResult {
        artifact,
        signature,
        envelope,
    })
}

/// Verifies the signatures of the artifact `reference` names.
///
/// The trust policy is selected before anything is fetched. Signatures are
/// tried in listing order and the first valid one wins; under `audit` every
/// signature is examined.
pub async fn verify(
    verifier: &Verifier,
    repo: &dyn Repository,
    reference: &Reference,
    options: &VerifyOptions,
) -> Result<VerifyResult> {
    let statement = verifier.oci_statement(&reference.to_string())?;
    let level = statement.resolved_level();
    if level.is_skip() {
        info!(
            "trust policy `{}` skips verification of {reference}",
            statement.name
        );
        return Ok(VerifyResult {
            artifact: None,
            outcome: VerificationOutcome::new(None, level.level),
            rejected: vec![],
        });
    }

    let artifact = resolve(repo, reference).await?;
    let pinned = reference.with_digest(artifact.digest.clone()).to_string();
    let options = VerifyOptions {
        artifact_reference: pinned.clone(),
        ..options.clone()
    };

    let SignatureList {
        descriptors,
        truncated,
    } = repo
        .list_signatures(&artifact, options.max_signature_attempts)
        .await?;
    if descriptors.is_empty() {
        return Err(VerificationError::NoSignature(pinned).into());
    }

    let audit = level.level == VerificationLevel::Audit;
    let mut accepted = None;
    let mut rejected = Vec::new();
    for manifest in &descriptors {
        let (blob, envelope) = repo.fetch_signature(manifest).await?;
        let mut outcome = verifier
            .verify(statement, &envelope, &blob.media_type, &options)
            .await;
        if outcome.is_success() {
            check_artifact(&mut outcome, &artifact);
        }

        if outcome.is_success() && accepted.is_none() {
            accepted = Some(outcome);
            if !audit {
                break;
            }
        } else {
            rejected.push(outcome);
        }
    }

    match accepted {
        Some(outcome) => {
            for warning in outcome.warnings() {
                if let Some(e) = &warning.error {
                    warn!("{pinned}: {} check failed but was only logged: {e}", warning.check);
                }
            }
            Ok(VerifyResult {
                artifact: Some(artifact),
                outcome,
                rejected,
            })
        }
        None => {
            if truncated {
                warn!(
                    "{pinned}: only {} signatures were examined",
                    options.max_signature_attempts
                );
            }
            Err(VerificationError::NoneValid {
                reference: pinned,
                outcomes: rejected,
            }
            .into())
        }
    }
}

/// The signed descriptor must name the artifact being verified.
fn check_artifact(outcome: &mut VerificationOutcome, artifact: &Descriptor) {
    let Some(signed) = &outcome.signed_descriptor else {
        return;
    };
    let error = if signed.digest != artifact.digest || signed.size != artifact.size {
        CheckError::ArtifactMismatch {
            signed: signed.digest.clone(),
            actual: artifact.digest.clone(),
        }
    } else if signed.media_type != artifact.media_type {
        CheckError::MediaTypeMismatch {
            signed: signed.media_type.clone(),
            expected: artifact.media_type.clone(),
        }
    } else {
        return;
    };
    outcome.fail(error);
}

/// Lists the signature manifests of the artifact `reference` names.
pub async fn list(
    repo: &dyn Repository,
    reference: &Reference,
    max: usize,
) -> Result<(Descriptor, SignatureList)> {
    let artifact = resolve(repo, reference).await?;
    let signatures = repo.list_signatures(&artifact, max).await?;
    Ok((artifact, signatures))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::Timeouts,
        crypto::PrivateKey,
        envelope::MEDIA_TYPE_COSE,
        registry::{
            MemoryRepository, ANNOTATION_CREATED, ANNOTATION_THUMBPRINT,
            MEDIA_TYPE_IMAGE_MANIFEST,
        },
        revocation::RevocationValidator,
        signer::LocalSigner,
        trustpolicy::{OciTrustPolicy, PolicyError},
        truststore::X509TrustStore,
        x509::parse_der,
        Error,
    };
    use test_utils::TestPki;

    const IMAGE: &[u8] = br#"{"schemaVersion":2,"layers":[]}"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        pki: TestPki,
        verifier: Verifier,
        repo: MemoryRepository,
        reference: Reference,
    }

    fn policy(level: &str) -> OciTrustPolicy {
        let statement = if level == "skip" {
            serde_json::json!({
                "name": "app",
                "registryScopes": ["registry.example.com/app"],
                "signatureVerification": { "level": "skip" }
            })
        } else {
            serde_json::json!({
                "name": "app",
                "registryScopes": ["registry.example.com/app"],
                "signatureVerification": {
                    "level": level,
                    "override": { "revocation": "skip" }
                },
                "trustStores": ["ca:test"],
                "trustedIdentities": ["*"]
            })
        };
        let policy: OciTrustPolicy = serde_json::from_value(serde_json::json!({
            "version": "1.0",
            "trustPolicies": [statement]
        }))
        .unwrap();
        policy.validate().unwrap();
        policy
    }

    fn signer(pki: &TestPki) -> Signer {
        let key = PrivateKey::from_pem(&pki.leaf.key_pem()).unwrap();
        let chain = pki.chain_der().iter().map(|d| parse_der(d).unwrap()).collect();
        Signer::Local(LocalSigner::new(key, chain).unwrap())
    }

    fn fixture(level: &str) -> Fixture {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("x509/ca/test");
        std::fs::create_dir_all(&store).unwrap();
        std::fs::write(store.join("root.pem"), pki.root.cert_pem()).unwrap();

        let verifier = Verifier::new(
            Arc::new(X509TrustStore::new(dir.path().join("x509"))),
            RevocationValidator::new(&Timeouts::default(), None).unwrap(),
        )
        .with_oci_policy(policy(level));
        let repo = MemoryRepository::new();
        repo.add_manifest(MEDIA_TYPE_IMAGE_MANIFEST, IMAGE, Some("v1"));
        Fixture {
            _dir: dir,
            pki,
            verifier,
            repo,
            reference: "registry.example.com/app:v1".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_sign_then_verify() {
        let f = fixture("strict");
        let signed = sign(&signer(&f.pki), &f.repo, &f.reference, &SignOptions::default())
            .await
            .unwrap();
        assert!(signed.signature.annotations.contains_key(ANNOTATION_THUMBPRINT));
        assert!(signed.signature.annotations.contains_key(ANNOTATION_CREATED));

        let result = verify(&f.verifier, &f.repo, &f.reference, &VerifyOptions::default())
            .await
            .unwrap();
        assert!(result.outcome.is_success());
        assert_eq!(result.artifact, Some(signed.artifact));
        assert!(result.rejected.is_empty());
    }

    #[tokio::test]
    async fn test_first_valid_signature_wins() {
        let f = fixture("strict");
        let options = SignOptions {
            envelope_media_type: MEDIA_TYPE_COSE.to_string(),
            ..Default::default()
        };
        sign(&signer(&TestPki::new()), &f.repo, &f.reference, &options)
            .await
            .unwrap();
        sign(&signer(&f.pki), &f.repo, &f.reference, &options)
            .await
            .unwrap();

        let result = verify(&f.verifier, &f.repo, &f.reference, &VerifyOptions::default())
            .await
            .unwrap();
        assert!(result.outcome.is_success());
        assert_eq!(result.rejected.len(), 1);
    }

    #[tokio::test]
    async fn test_none_valid() {
        let f = fixture("strict");
        sign(&signer(&TestPki::new()), &f.repo, &f.reference, &SignOptions::default())
            .await
            .unwrap();

        let err = verify(&f.verifier, &f.repo, &f.reference, &VerifyOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::Verification(VerificationError::NoneValid { outcomes, .. }) => {
                assert_eq!(outcomes.len(), 1);
                assert!(!outcomes[0].is_success());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_signature() {
        let f = fixture("strict");
        let err = verify(&f.verifier, &f.repo, &f.reference, &VerifyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Verification(VerificationError::NoSignature(_))
        ));
    }

    #[tokio::test]
    async fn test_no_applicable_policy_fails_before_registry() {
        let f = fixture("strict");
        let reference: Reference = "registry.example.com/other:v1".parse().unwrap();
        let err = verify(&f.verifier, &f.repo, &reference, &VerifyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Policy(PolicyError::NoApplicablePolicy(_))
        ));
    }

    #[tokio::test]
    async fn test_skip_does_not_touch_registry() {
        let f = fixture("skip");
        let reference: Reference = "registry.example.com/app:missing".parse().unwrap();
        let result = verify(&f.verifier, &f.repo, &reference, &VerifyOptions::default())
            .await
            .unwrap();
        assert!(result.artifact.is_none());
        assert!(result.outcome.results.is_empty());
    }

    #[tokio::test]
    async fn test_collected_subject_is_not_found() {
        let f = fixture("strict");
        let signed = sign(&signer(&f.pki), &f.repo, &f.reference, &SignOptions::default())
            .await
            .unwrap();
        f.repo.delete_manifest(&signed.artifact.digest);
        let reference = f.reference.with_digest(signed.artifact.digest.clone());

        let err = verify(&f.verifier, &f.repo, &reference, &VerifyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_audit_examines_every_signature() {
        let f = fixture("audit");
        sign(&signer(&f.pki), &f.repo, &f.reference, &SignOptions::default())
            .await
            .unwrap();
        sign(&signer(&TestPki::new()), &f.repo, &f.reference, &SignOptions::default())
            .await
            .unwrap();

        let result = verify(&f.verifier, &f.repo, &f.reference, &VerifyOptions::default())
            .await
            .unwrap();
        assert!(result.outcome.is_success());
        assert_eq!(result.rejected.len(), 1);
    }

    #[tokio::test]
    async fn test_list() {
        let f = fixture("strict");
        sign(&signer(&f.pki), &f.repo, &f.reference, &SignOptions::default())
            .await
            .unwrap();
        let (artifact, signatures) = list(&f.repo, &f.reference, 10).await.unwrap();
        assert!(artifact.digest.verify(IMAGE));
        assert_eq!(signatures.descriptors.len(), 1);
        assert!(!signatures.truncated);
    }
}
