// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#![allow(dead_code)]

use std::collections::BTreeMap;

use notation_rs::{
    config::{KeyEntry, SigningKeys, Timeouts},
    dir::ConfigDirs,
    plugin::PluginManager,
    signer::Signer,
    verifier::Verifier,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use test_utils::TestPki;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate, Times,
};

pub const KEY_NAME: &str = "release";
pub const TRUST_STORE: &str = "ca:release";

/// A configuration directory with a trusted root and a local signing key.
pub struct Workspace {
    _dir: TempDir,
    pub dirs: ConfigDirs,
    pub pki: TestPki,
}

impl Workspace {
    pub fn new(pki: TestPki) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let dirs = ConfigDirs::new(dir.path().join("config"), dir.path().join("cache"));

        let store = dirs.trust_store().join("ca").join("release");
        std::fs::create_dir_all(&store).unwrap();
        std::fs::write(store.join("root.pem"), pki.root.cert_pem()).unwrap();

        let (key_path, cert_path) = dirs.local_key(KEY_NAME);
        std::fs::create_dir_all(key_path.parent().unwrap()).unwrap();
        std::fs::write(&key_path, pki.leaf.key_pem()).unwrap();
        std::fs::write(&cert_path, pki.chain_pem()).unwrap();

        let mut keys = SigningKeys::default();
        keys.add(
            KeyEntry {
                name: KEY_NAME.to_string(),
                key_path: Some(key_path),
                cert_path: Some(cert_path),
                ..Default::default()
            },
            true,
        )
        .unwrap();
        keys.save(&dirs.signing_keys()).unwrap();

        Self {
            _dir: dir,
            dirs,
            pki,
        }
    }

    /// Writes an OCI trust policy with a single statement over `scope`.
    pub fn oci_policy(&self, scope: &str, verification: Value) {
        let mut statement = statement(verification);
        statement["registryScopes"] = json!([scope]);
        let document = json!({ "version": "1.0", "trustPolicies": [statement] });
        write_json(&self.dirs.oci_trust_policy(), &document);
    }

    /// Writes a blob trust policy whose only statement is global.
    pub fn blob_policy(&self, verification: Value) {
        let mut statement = statement(verification);
        statement["globalPolicy"] = json!(true);
        let document = json!({ "version": "1.0", "trustPolicies": [statement] });
        write_json(&self.dirs.blob_trust_policy(), &document);
    }

    pub fn verifier(&self) -> Verifier {
        Verifier::from_dirs(&self.dirs, &Timeouts::default()).unwrap()
    }

    /// The default key of `signingkeys.json`.
    pub async fn signer(&self) -> Signer {
        let keys = SigningKeys::load(&self.dirs.signing_keys()).unwrap();
        let plugins = PluginManager::new(self.dirs.plugins(), Timeouts::default().plugin);
        Signer::from_key_entry(keys.get(None).unwrap(), &plugins, &BTreeMap::new())
            .await
            .unwrap()
    }
}

/// A statement trusting the workspace root. Level `skip` takes no trust
/// stores or identities.
fn statement(verification: Value) -> Value {
    let skip = verification["level"] == "skip";
    let mut statement = json!({
        "name": "release",
        "signatureVerification": verification,
    });
    if !skip {
        statement["trustStores"] = json!([TRUST_STORE]);
        statement["trustedIdentities"] = json!(["*"]);
    }
    statement
}

fn write_json(path: &std::path::Path, value: &Value) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
}

/// Answers CRL downloads at `/leaf.crl` with `response`, expecting `calls` of them.
pub async fn serve_crl(server: &MockServer, response: ResponseTemplate, calls: impl Into<Times>) {
    Mock::given(method("GET"))
        .and(path("/leaf.crl"))
        .respond_with(response)
        .expect(calls)
        .mount(server)
        .await;
}

pub fn crl_url(server: &MockServer) -> String {
    format!("{}/leaf.crl", server.uri())
}
