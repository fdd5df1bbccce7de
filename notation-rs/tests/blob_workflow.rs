// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use notation_rs::{
    blob::{self, BlobSignOptions, BlobVerifyOptions},
    envelope::{EnvelopeError, MEDIA_TYPE_COSE, MEDIA_TYPE_JWS},
    inspect::inspect,
    signer::SignOptions,
    verifier::{CheckError, VerificationError},
    Error,
};
use rstest::rstest;
use serde_json::json;
use test_utils::TestPki;

mod common;
use common::Workspace;

fn sign_options(media_type: &str) -> BlobSignOptions {
    BlobSignOptions {
        sign: SignOptions {
            envelope_media_type: media_type.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn offline_strict(workspace: &Workspace) {
    workspace.blob_policy(json!({ "level": "strict", "override": { "revocation": "skip" } }));
}

#[rstest]
#[case::jws(MEDIA_TYPE_JWS, "jws")]
#[case::cose(MEDIA_TYPE_COSE, "cose")]
#[tokio::test]
async fn test_sign_inspect_verify(#[case] media_type: &str, #[case] suffix: &str) {
    let workspace = Workspace::new(TestPki::new());
    offline_strict(&workspace);
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("release.tar");
    std::fs::write(&artifact, b"release contents").unwrap();

    let (signature, _) = blob::sign(&workspace.signer().await, &artifact, &sign_options(media_type))
        .await
        .unwrap();
    assert_eq!(
        signature,
        dir.path().join(format!("release.tar.{suffix}.sig"))
    );

    let inspection = inspect(&std::fs::read(&signature).unwrap(), media_type).unwrap();
    assert_eq!(inspection.signed_artifact.size, 16);
    assert_eq!(inspection.certificates.len(), 2);

    let outcome = blob::verify(
        &workspace.verifier(),
        &artifact,
        &signature,
        &BlobVerifyOptions::default(),
    )
    .await
    .unwrap();
    assert!(outcome.is_success());
}

#[tokio::test]
async fn test_flipped_signature_byte_is_rejected() {
    let workspace = Workspace::new(TestPki::new());
    offline_strict(&workspace);
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("release.tar");
    std::fs::write(&artifact, b"release contents").unwrap();
    let (signature, _) = blob::sign(&workspace.signer().await, &artifact, &sign_options(MEDIA_TYPE_JWS))
        .await
        .unwrap();

    let mut envelope: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&signature).unwrap()).unwrap();
    let mut raw = URL_SAFE_NO_PAD
        .decode(envelope["signature"].as_str().unwrap())
        .unwrap();
    raw[0] ^= 0x01;
    envelope["signature"] = URL_SAFE_NO_PAD.encode(raw).into();
    std::fs::write(&signature, serde_json::to_vec(&envelope).unwrap()).unwrap();

    let err = blob::verify(
        &workspace.verifier(),
        &artifact,
        &signature,
        &BlobVerifyOptions::default(),
    )
    .await
    .unwrap_err();
    let Error::Verification(VerificationError::NoneValid { outcomes, .. }) = err else {
        panic!("unexpected error: {err:?}");
    };
    // integrity failed, so nothing after it ran
    assert_eq!(outcomes[0].results.len(), 1);
    assert!(matches!(
        outcomes[0].failure(),
        Some(CheckError::Envelope(EnvelopeError::InvalidSignature))
    ));
}

#[tokio::test]
async fn test_skip_policy_does_not_read_the_signature() {
    let workspace = Workspace::new(TestPki::new());
    workspace.blob_policy(json!({ "level": "skip" }));
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("release.tar");
    std::fs::write(&artifact, b"release contents").unwrap();

    let outcome = blob::verify(
        &workspace.verifier(),
        &artifact,
        &dir.path().join("missing.jws.sig"),
        &BlobVerifyOptions::default(),
    )
    .await
    .unwrap();
    assert!(outcome.is_success());
    assert!(outcome.envelope_digest.is_none());
    assert!(outcome.results.is_empty());
}
