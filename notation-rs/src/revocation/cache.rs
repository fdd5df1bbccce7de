// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Persistent CRL cache.
//!
//! Each distribution point URL maps to one JSON file named after the SHA-256
//! of the URL. Files are written to a temporary sibling and renamed into place
//! so readers never observe a partial bundle.

use std::{
    io::{ErrorKind, Write},
    path::PathBuf,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use der::{Decode, Encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_cert::crl::CertificateList;

use super::crl::CrlBundle;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("no cached CRL for {0}")]
    NotFound(String),

    #[error("cached CRL for {0} has expired")]
    Expired(String),

    #[error("CRL cache i/o error")]
    Io(#[from] std::io::Error),

    #[error("corrupt CRL cache entry: {0}")]
    Corrupt(String),
}

/// Storage for downloaded CRL bundles, keyed by distribution point URL.
#[async_trait]
pub trait CrlCache: Send + Sync {
    /// Returns the bundle stored for `url` unless it is past its next update.
    async fn get(&self, url: &str) -> Result<CrlBundle, CacheError>;

    async fn set(&self, url: &str, bundle: &CrlBundle) -> Result<(), CacheError>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    base_crl: String,
    #[serde(default)]
    delta_crls: Vec<String>,
    fetched_at: DateTime<Utc>,
    next_update: DateTime<Utc>,
}

/// A [`CrlCache`] backed by one file per URL.
#[derive(Clone, Debug)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, url: &str) -> PathBuf {
        self.root.join(hex::encode(Sha256::digest(url.as_bytes())))
    }
}

fn decode_crl(b64: &str) -> Result<CertificateList, CacheError> {
    let der = STANDARD
        .decode(b64)
        .map_err(|e| CacheError::Corrupt(e.to_string()))?;
    CertificateList::from_der(&der).map_err(|e| CacheError::Corrupt(e.to_string()))
}

fn encode_crl(crl: &CertificateList) -> Result<String, CacheError> {
    crl.to_der()
        .map(|der| STANDARD.encode(der))
        .map_err(|e| CacheError::Corrupt(e.to_string()))
}

#[async_trait]
impl CrlCache for FileCache {
    async fn get(&self, url: &str) -> Result<CrlBundle, CacheError> {
        let data = match tokio::fs::read(self.path(url)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CacheError::NotFound(url.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let entry: CacheEntry =
            serde_json::from_slice(&data).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        if Utc::now() >= entry.next_update {
            return Err(CacheError::Expired(url.to_string()));
        }
        Ok(CrlBundle {
            base: decode_crl(&entry.base_crl)?,
            deltas: entry
                .delta_crls
                .iter()
                .map(|d| decode_crl(d))
                .collect::<Result<_, _>>()?,
            fetched_at: entry.fetched_at,
        })
    }

    async fn set(&self, url: &str, bundle: &CrlBundle) -> Result<(), CacheError> {
        let next_update = bundle
            .next_update()
            .ok_or_else(|| CacheError::Corrupt("bundle has no next update".into()))?;
        let entry = CacheEntry {
            base_crl: encode_crl(&bundle.base)?,
            delta_crls: bundle
                .deltas
                .iter()
                .map(encode_crl)
                .collect::<Result<_, _>>()?,
            fetched_at: bundle.fetched_at,
            next_update,
        };
        let data = serde_json::to_vec(&entry).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        let root = self.root.clone();
        let path = self.path(url);
        tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
            std::fs::create_dir_all(&root)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&root)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::new(ErrorKind::Other, e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::{revocation_list, CertSpec, Profile};

    fn bundle(next_update: time::OffsetDateTime) -> CrlBundle {
        let root = CertSpec::new("Root", Profile::Root).self_signed();
        let der = revocation_list(&root, &[42], next_update);
        CrlBundle {
            base: CertificateList::from_der(&der).unwrap(),
            deltas: vec![],
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("crl"));
        let url = "http://crl.example.com/root.crl";

        assert!(matches!(cache.get(url).await, Err(CacheError::NotFound(_))));

        let fresh = bundle(time::OffsetDateTime::now_utc() + time::Duration::hours(1));
        cache.set(url, &fresh).await.unwrap();
        let cached = cache.get(url).await.unwrap();
        assert_eq!(cached.base, fresh.base);
        assert_eq!(cached.next_update(), fresh.next_update());

        let file = dir
            .path()
            .join("crl")
            .join(hex::encode(Sha256::digest(url.as_bytes())));
        assert!(file.exists());
        assert_eq!(std::fs::read_dir(dir.path().join("crl")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_expired_and_corrupt_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let url = "http://crl.example.com/stale.crl";

        let stale = bundle(time::OffsetDateTime::now_utc() - time::Duration::minutes(1));
        cache.set(url, &stale).await.unwrap();
        assert!(matches!(cache.get(url).await, Err(CacheError::Expired(_))));

        std::fs::write(cache.path(url), b"{\"baseCrl\": 1}").unwrap();
        assert!(matches!(cache.get(url).await, Err(CacheError::Corrupt(_))));
    }
}
