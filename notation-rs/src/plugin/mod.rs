// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Out-of-process signing and verification plugins.
//!
//! A plugin is an executable `notation-<name>` under the plugin directory.
//! Each command spawns a fresh process, writes one JSON request to its stdin
//! and reads one JSON response from its stdout. Failures are reported as a
//! JSON error object on stderr together with a non-zero exit status.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub mod manager;
pub mod protocol;
pub mod runner;

pub use manager::PluginManager;
pub use protocol::{Capability, Command, ErrorCode};
pub use runner::{PluginRunner, ProcessRunner, RunOutput};

use protocol::*;

/// A `TIMEOUT` error is retried this many times.
const MAX_TIMEOUT_RETRIES: u32 = 1;

/// A `THROTTLED` error is retried this many times with exponential backoff.
const MAX_THROTTLE_RETRIES: u32 = 3;

const DEFAULT_BACKOFF: Duration = Duration::from_millis(250);

pub type Result<T> = std::result::Result<T, PluginError>;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("plugin `{0}` is not installed")]
    NotFound(String),

    #[error("failed to read plugin directory {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin `{name}` has invalid metadata: {reason}")]
    InvalidMetadata { name: String, reason: String },

    #[error("plugin `{name}` does not support {capability}")]
    UnsupportedCapability { name: String, capability: Capability },

    #[error("failed to execute plugin {path}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin {path} stopped reading the `{command}` request")]
    Stdin {
        path: PathBuf,
        command: Command,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin {path} did not answer `{command}` in time")]
    Timeout { path: PathBuf, command: Command },

    #[error("failed to encode request for plugin `{name}`")]
    Request {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("plugin `{name}` returned an invalid response to `{command}`: {reason}")]
    InvalidResponse {
        name: String,
        command: Command,
        reason: String,
    },

    #[error("plugin `{name}` rejected the request as malformed: {message}")]
    MalformedRequest { name: String, message: String },

    #[error("plugin `{name}` failed with {code}: {message}")]
    Failed {
        name: String,
        code: ErrorCode,
        message: String,
    },
}

impl PluginError {
    fn code(&self) -> Option<ErrorCode> {
        match self {
            PluginError::Failed { code, .. } => Some(*code),
            PluginError::Timeout { .. } => Some(ErrorCode::Timeout),
            PluginError::MalformedRequest { .. } => Some(ErrorCode::ValidationError),
            _ => None,
        }
    }
}

/// An installed plugin whose metadata has been fetched and validated.
#[derive(Clone)]
pub struct Plugin {
    name: String,
    path: PathBuf,
    runner: Arc<dyn PluginRunner>,
    timeout: Duration,
    backoff: Duration,
    metadata: GetMetadataResponse,
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("version", &self.metadata.version)
            .finish()
    }
}

impl Plugin {
    /// Runs `get-plugin-metadata` and checks that the plugin is usable under
    /// the name it was installed as.
    pub async fn load(
        name: &str,
        path: PathBuf,
        runner: Arc<dyn PluginRunner>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut plugin = Self {
            name: name.to_string(),
            path,
            runner,
            timeout,
            backoff: DEFAULT_BACKOFF,
            metadata: GetMetadataResponse::default(),
        };
        let metadata: GetMetadataResponse = plugin
            .call(
                Command::GetPluginMetadata,
                &GetMetadataRequest {
                    contract_version: CONTRACT_VERSION.to_string(),
                    plugin_config: Default::default(),
                },
            )
            .await?;
        let invalid = |reason: String| PluginError::InvalidMetadata {
            name: name.to_string(),
            reason,
        };
        metadata.validate().map_err(invalid)?;
        if metadata.name != name {
            return Err(invalid(format!(
                "metadata names the plugin `{}`",
                metadata.name
            )));
        }
        plugin.metadata = metadata;
        Ok(plugin)
    }

    /// Overrides the base delay between retries of a throttled request.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &GetMetadataResponse {
        &self.metadata
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.metadata.has_capability(capability)
    }

    fn require(&self, capabilities: &[Capability]) -> Result<()> {
        if capabilities.iter().any(|c| self.has_capability(*c)) {
            return Ok(());
        }
        Err(PluginError::UnsupportedCapability {
            name: self.name.clone(),
            capability: capabilities[0],
        })
    }

    pub async fn describe_key(&self, request: &DescribeKeyRequest) -> Result<DescribeKeyResponse> {
        self.require(&[Capability::SignatureGenerator, Capability::EnvelopeGenerator])?;
        self.call(Command::DescribeKey, request).await
    }

    pub async fn generate_signature(
        &self,
        request: &GenerateSignatureRequest,
    ) -> Result<GenerateSignatureResponse> {
        self.require(&[Capability::SignatureGenerator])?;
        self.call(Command::GenerateSignature, request).await
    }

    pub async fn generate_envelope(
        &self,
        request: &GenerateEnvelopeRequest,
    ) -> Result<GenerateEnvelopeResponse> {
        self.require(&[Capability::EnvelopeGenerator])?;
        self.call(Command::GenerateEnvelope, request).await
    }

    pub async fn verify_signature(
        &self,
        request: &VerifySignatureRequest,
    ) -> Result<VerifySignatureResponse> {
        self.require(&[
            Capability::TrustedIdentityVerifier,
            Capability::RevocationCheckVerifier,
        ])?;
        self.call(Command::VerifySignature, request).await
    }

    /// Sends `request` with the retry policy of the plugin contract: one
    /// retry on `TIMEOUT`, exponential backoff on `THROTTLED`.
    async fn call<Req, Resp>(&self, command: Command, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let input = serde_json::to_vec(request).map_err(|source| PluginError::Request {
            name: self.name.clone(),
            source,
        })?;
        let mut timeouts = 0;
        let mut throttles = 0;
        loop {
            let err = match self.invoke(command, input.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            match err.code() {
                Some(ErrorCode::Timeout) if timeouts < MAX_TIMEOUT_RETRIES => {
                    timeouts += 1;
                    warn!("plugin `{}` timed out on `{command}`, retrying", self.name);
                }
                Some(ErrorCode::Throttled) if throttles < MAX_THROTTLE_RETRIES => {
                    let delay = self.backoff * 2u32.pow(throttles);
                    throttles += 1;
                    warn!(
                        "plugin `{}` throttled `{command}`, retrying in {delay:?}",
                        self.name
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(err),
            }
        }
    }

    async fn invoke<Resp: DeserializeOwned>(&self, command: Command, input: Vec<u8>) -> Result<Resp> {
        let output = self
            .runner
            .run(&self.path, command, input, self.timeout)
            .await?;
        if !output.stderr.is_empty() {
            debug!(
                "plugin `{}` {command} stderr: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        if !output.success {
            return Err(self.failure(&output.stderr));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| PluginError::InvalidResponse {
            name: self.name.clone(),
            command,
            reason: e.to_string(),
        })
    }

    fn failure(&self, stderr: &[u8]) -> PluginError {
        let (code, message) = match serde_json::from_slice::<ErrorResponse>(stderr) {
            Ok(response) => (
                ErrorCode::from_wire(&response.error_code),
                response.error_message,
            ),
            Err(_) => (
                ErrorCode::GenericError,
                String::from_utf8_lossy(stderr).trim().to_string(),
            ),
        };
        match code {
            ErrorCode::ValidationError => PluginError::MalformedRequest {
                name: self.name.clone(),
                message,
            },
            code => PluginError::Failed {
                name: self.name.clone(),
                code,
                message,
            },
        }
    }
}
