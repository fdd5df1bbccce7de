// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Locations of the user's configuration and cache.
//!
//! ```text
//! <config>/config.json
//! <config>/trustpolicy.oci.json
//! <config>/trustpolicy.blob.json
//! <config>/truststore/x509/<type>/<name>/*.pem
//! <config>/signingkeys.json
//! <config>/localkeys/<name>.{key,crt}
//! <config>/plugins/<name>/notation-<name>
//! <cache>/crl/<sha256 of url>
//! ```

use std::path::{Path, PathBuf};

use crate::config::{ConfigError, Result};

/// Overrides the configuration root.
pub const ENV_CONFIG_DIR: &str = "NOTATION_CONFIG";

/// Overrides the cache root.
pub const ENV_CACHE_DIR: &str = "NOTATION_CACHE";

const APP_DIR: &str = "notation";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigDirs {
    config: PathBuf,
    cache: PathBuf,
}

impl ConfigDirs {
    pub fn new(config: impl Into<PathBuf>, cache: impl Into<PathBuf>) -> Self {
        Self {
            config: config.into(),
            cache: cache.into(),
        }
    }

    /// Resolves the directories from the environment, falling back to the
    /// platform config and cache directories.
    pub fn from_env() -> Result<Self> {
        let config = match std::env::var_os(ENV_CONFIG_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::config_dir()
                .ok_or_else(|| no_dir("no user config directory"))?
                .join(APP_DIR),
        };
        let cache = match std::env::var_os(ENV_CACHE_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::cache_dir()
                .ok_or_else(|| no_dir("no user cache directory"))?
                .join(APP_DIR),
        };
        Ok(Self { config, cache })
    }

    pub fn config_root(&self) -> &Path {
        &self.config
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.json")
    }

    pub fn oci_trust_policy(&self) -> PathBuf {
        self.config.join("trustpolicy.oci.json")
    }

    pub fn blob_trust_policy(&self) -> PathBuf {
        self.config.join("trustpolicy.blob.json")
    }

    pub fn trust_store(&self) -> PathBuf {
        self.config.join("truststore").join("x509")
    }

    pub fn signing_keys(&self) -> PathBuf {
        self.config.join("signingkeys.json")
    }

    /// Key and certificate paths of a locally generated key pair.
    pub fn local_key(&self, name: &str) -> (PathBuf, PathBuf) {
        let dir = self.config.join("localkeys");
        (dir.join(format!("{name}.key")), dir.join(format!("{name}.crt")))
    }

    pub fn plugins(&self) -> PathBuf {
        self.config.join("plugins")
    }

    pub fn crl_cache(&self) -> PathBuf {
        self.cache.join("crl")
    }
}

fn no_dir(reason: &str) -> ConfigError {
    ConfigError::Read {
        path: PathBuf::new(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, reason.to_string()),
    }
}
