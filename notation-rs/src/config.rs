// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{collections::BTreeMap, fs::File, io::ErrorKind, path::Path, path::PathBuf, time::Duration};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::EnvelopeFormat;

/// Default timeout of one OCSP request.
pub const DEFAULT_OCSP_TIMEOUT: Duration = Duration::from_secs(2);

/// Default timeout of one CRL download.
pub const DEFAULT_CRL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout of one RFC 3161 timestamp request.
pub const DEFAULT_TSA_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout of one plugin invocation.
pub const DEFAULT_PLUGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout of one registry request.
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(30);

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("signing key `{0}` not found")]
    KeyNotFound(String),

    #[error("no default signing key is configured")]
    NoDefaultKey,

    #[error("invalid signing key entry `{name}`: {reason}")]
    InvalidKey { name: String, reason: String },

    #[error("signing key `{0}` already exists")]
    DuplicateKey(String),
}

/// Reads a JSON document, returning `None` when the file does not exist.
pub(crate) fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{} does not exist", path.display());
            return Ok(None);
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_reader(file)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let data = serde_json::to_vec_pretty(value).map_err(|e| write_err(e.into()))?;
    std::fs::write(path, data).map_err(write_err)
}

/// `config.json`: settings shared by every command.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Registries reached over plain HTTP.
    #[serde(default)]
    pub insecure_registries: Vec<String>,

    /// Envelope format used when signing, `jws` or `cose`.
    #[serde(default = "default_signature_format")]
    pub signature_format: String,
}

fn default_signature_format() -> String {
    EnvelopeFormat::Jws.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            insecure_registries: Vec::new(),
            signature_format: default_signature_format(),
        }
    }
}

impl Config {
    /// Loads the configuration. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(load_json(path)?.unwrap_or_default())
    }

    pub fn is_insecure_registry(&self, registry: &str) -> bool {
        self.insecure_registries.iter().any(|r| r == registry)
    }
}

/// One entry of `signingkeys.json`.
///
/// A local key pair sets `keyPath` and `certPath`; an external key held by a
/// plugin sets `id` and `pluginName`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyEntry {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugin_config: BTreeMap<String, String>,
}

/// Where the key material of a [`KeyEntry`] lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySource<'a> {
    Local {
        key_path: &'a Path,
        cert_path: &'a Path,
    },
    External {
        id: &'a str,
        plugin_name: &'a str,
        plugin_config: &'a BTreeMap<String, String>,
    },
}

impl KeyEntry {
    pub fn source(&self) -> Result<KeySource<'_>> {
        let invalid = |reason: &str| ConfigError::InvalidKey {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        match (
            &self.key_path,
            &self.cert_path,
            &self.id,
            &self.plugin_name,
        ) {
            (Some(key_path), Some(cert_path), None, None) => Ok(KeySource::Local {
                key_path,
                cert_path,
            }),
            (None, None, Some(id), Some(plugin_name)) => Ok(KeySource::External {
                id,
                plugin_name,
                plugin_config: &self.plugin_config,
            }),
            (None, None, None, None) => Err(invalid("neither a key pair nor an external key")),
            _ => Err(invalid(
                "a key is either keyPath plus certPath or id plus pluginName",
            )),
        }
    }
}

/// `signingkeys.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SigningKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default)]
    pub keys: Vec<KeyEntry>,
}

impl SigningKeys {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(load_json(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(path, self)
    }

    /// Finds a key by name, or the default key when `name` is `None`.
    pub fn get(&self, name: Option<&str>) -> Result<&KeyEntry> {
        let name = match name {
            Some(name) => name,
            None => self.default.as_deref().ok_or(ConfigError::NoDefaultKey)?,
        };
        self.keys
            .iter()
            .find(|k| k.name == name)
            .ok_or_else(|| ConfigError::KeyNotFound(name.to_string()))
    }

    pub fn add(&mut self, entry: KeyEntry, make_default: bool) -> Result<()> {
        entry.source()?;
        if self.keys.iter().any(|k| k.name == entry.name) {
            return Err(ConfigError::DuplicateKey(entry.name));
        }
        if make_default {
            self.default = Some(entry.name.clone());
        }
        self.keys.push(entry);
        Ok(())
    }
}

/// Network and process timeouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub ocsp: Duration,
    pub crl: Duration,
    pub tsa: Duration,
    pub plugin: Duration,
    pub registry: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ocsp: DEFAULT_OCSP_TIMEOUT,
            crl: DEFAULT_CRL_TIMEOUT,
            tsa: DEFAULT_TSA_TIMEOUT,
            plugin: DEFAULT_PLUGIN_TIMEOUT,
            registry: DEFAULT_REGISTRY_TIMEOUT,
        }
    }
}
