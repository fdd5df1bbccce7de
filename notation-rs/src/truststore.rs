// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Named sets of trusted certificates.
//!
//! An X.509 trust store lives at `truststore/x509/<type>/<name>/` and holds
//! any number of PEM (or DER) files. Stores are read on demand so a policy
//! change never needs a reload.

use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use x509_cert::Certificate;

use crate::x509;

pub type Result<T> = std::result::Result<T, TrustStoreError>;

#[derive(Error, Debug)]
pub enum TrustStoreError {
    #[error("trust store {store_type}:{name} does not exist")]
    NotFound { store_type: StoreType, name: String },

    #[error("failed to read trust store file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("trust store {store_type}:{name} contains no certificates")]
    Empty { store_type: StoreType, name: String },

    #[error("invalid certificate in {path}: {reason}")]
    InvalidCertificate { path: PathBuf, reason: String },

    #[error("invalid trust store name `{0}`")]
    InvalidName(String),
}

/// The role a trust store plays during verification.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum StoreType {
    /// Roots of certificate authorities issuing signing certificates.
    Ca,
    /// Signing authorities trusted directly.
    SigningAuthority,
    /// Roots of timestamp authorities.
    Tsa,
}

pub fn is_valid_store_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Access to trusted certificates by store type and name.
pub trait TrustStore: Send + Sync {
    fn certificates(&self, store_type: StoreType, name: &str) -> Result<Vec<Certificate>>;
}

/// A [`TrustStore`] backed by the `truststore/x509` directory.
#[derive(Clone, Debug)]
pub struct X509TrustStore {
    root: PathBuf,
}

impl X509TrustStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn store_path(&self, store_type: StoreType, name: &str) -> PathBuf {
        self.root.join(store_type.as_ref()).join(name)
    }
}

impl TrustStore for X509TrustStore {
    fn certificates(&self, store_type: StoreType, name: &str) -> Result<Vec<Certificate>> {
        if !is_valid_store_name(name) {
            return Err(TrustStoreError::InvalidName(name.to_string()));
        }
        let dir = self.store_path(store_type, name);
        let entries = std::fs::read_dir(&dir).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                TrustStoreError::NotFound {
                    store_type,
                    name: name.to_string(),
                }
            } else {
                TrustStoreError::Read {
                    path: dir.clone(),
                    source,
                }
            }
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| TrustStoreError::Read {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        // deterministic order regardless of directory iteration
        paths.sort();

        let mut certs = Vec::new();
        for path in paths {
            let loaded = load_file(&path)?;
            for cert in &loaded {
                check_trusted(store_type, cert, &path)?;
            }
            debug!(
                "loaded {} certificate(s) from {}",
                loaded.len(),
                path.display()
            );
            certs.extend(loaded);
        }
        if certs.is_empty() {
            return Err(TrustStoreError::Empty {
                store_type,
                name: name.to_string(),
            });
        }
        Ok(certs)
    }
}

fn load_file(path: &Path) -> Result<Vec<Certificate>> {
    let data = std::fs::read(path).map_err(|source| TrustStoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let invalid = |e: x509::CertificateError| TrustStoreError::InvalidCertificate {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    if data.starts_with(b"-----BEGIN") {
        x509::parse_pem_chain(&data).map_err(invalid)
    } else {
        x509::parse_der(&data).map(|c| vec![c]).map_err(invalid)
    }
}

fn check_trusted(store_type: StoreType, cert: &Certificate, path: &Path) -> Result<()> {
    if store_type == StoreType::SigningAuthority {
        return Ok(());
    }
    if !x509::is_ca(cert) || !x509::is_self_signed(cert) {
        return Err(TrustStoreError::InvalidCertificate {
            path: path.to_path_buf(),
            reason: format!(
                "`{}` is not a self-signed CA certificate",
                x509::subject(cert)
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use test_utils::TestPki;

    #[rstest]
    #[case("acme", true)]
    #[case("acme-rockets_v1.2", true)]
    #[case("", false)]
    #[case("../etc", false)]
    #[case("with space", false)]
    fn test_store_name(#[case] name: &str, #[case] valid: bool) {
        assert_eq!(is_valid_store_name(name), valid);
    }

    #[test]
    fn test_store_type_strings() {
        assert_eq!(StoreType::SigningAuthority.as_ref(), "signingAuthority");
        assert_eq!("tsa".parse::<StoreType>().unwrap(), StoreType::Tsa);
        assert!("x509".parse::<StoreType>().is_err());
    }

    #[test]
    fn test_load_store() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let store = X509TrustStore::new(dir.path());

        assert!(matches!(
            store.certificates(StoreType::Ca, "acme"),
            Err(TrustStoreError::NotFound { .. })
        ));

        let path = store.store_path(StoreType::Ca, "acme");
        std::fs::create_dir_all(&path).unwrap();
        assert!(matches!(
            store.certificates(StoreType::Ca, "acme"),
            Err(TrustStoreError::Empty { .. })
        ));

        std::fs::write(path.join("root.pem"), pki.root.cert_pem()).unwrap();
        std::fs::write(path.join("root.der"), pki.root.cert_der()).unwrap();
        let certs = store.certificates(StoreType::Ca, "acme").unwrap();
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0], certs[1]);
    }

    #[test]
    fn test_reject_non_root_in_ca_store() {
        let dir = tempfile::tempdir().unwrap();
        let pki = TestPki::new();
        let store = X509TrustStore::new(dir.path());

        let ca = store.store_path(StoreType::Ca, "acme");
        std::fs::create_dir_all(&ca).unwrap();
        std::fs::write(ca.join("leaf.pem"), pki.leaf.cert_pem()).unwrap();
        assert!(matches!(
            store.certificates(StoreType::Ca, "acme"),
            Err(TrustStoreError::InvalidCertificate { .. })
        ));

        let sa = store.store_path(StoreType::SigningAuthority, "acme");
        std::fs::create_dir_all(&sa).unwrap();
        std::fs::write(sa.join("leaf.pem"), pki.leaf.cert_pem()).unwrap();
        assert_eq!(
            store
                .certificates(StoreType::SigningAuthority, "acme")
                .unwrap()
                .len(),
            1
        );
    }
}
