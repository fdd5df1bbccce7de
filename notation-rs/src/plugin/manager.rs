// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{path::PathBuf, sync::Arc, time::Duration};

use log::debug;

use super::{
    protocol::EXECUTABLE_PREFIX, Plugin, PluginError, PluginRunner, ProcessRunner, Result,
};

/// Finds plugins under `<config>/plugins/<name>/notation-<name>`.
///
/// Nothing is cached: every lookup re-reads the directory and asks the plugin
/// for fresh metadata.
#[derive(Clone)]
pub struct PluginManager {
    root: PathBuf,
    runner: Arc<dyn PluginRunner>,
    timeout: Duration,
}

impl PluginManager {
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::with_runner(root, Arc::new(ProcessRunner), timeout)
    }

    pub fn with_runner(
        root: impl Into<PathBuf>,
        runner: Arc<dyn PluginRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            runner,
            timeout,
        }
    }

    pub fn executable(&self, name: &str) -> PathBuf {
        let file = format!("{EXECUTABLE_PREFIX}{name}{}", std::env::consts::EXE_SUFFIX);
        self.root.join(name).join(file)
    }

    /// Names of the installed plugins, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(source) => {
                return Err(PluginError::Read {
                    path: self.root.clone(),
                    source,
                })
            }
        };
        let read_err = |source| PluginError::Read {
            path: self.root.clone(),
            source,
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if tokio::fs::metadata(self.executable(&name))
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                names.push(name);
            } else {
                debug!("ignoring plugin directory `{name}` without an executable");
            }
        }
        names.sort();
        Ok(names)
    }

    /// Loads the plugin installed as `name`.
    pub async fn get(&self, name: &str) -> Result<Plugin> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(PluginError::NotFound(name.to_string()));
        }
        let path = self.executable(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(PluginError::NotFound(name.to_string())),
        }
        Plugin::load(name, path, self.runner.clone(), self.timeout).await
    }
}
