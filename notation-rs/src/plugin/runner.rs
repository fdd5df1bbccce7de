// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{path::Path, process::Stdio, time::Duration};

use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncWriteExt;

use super::{protocol::Command, PluginError, Result};

/// What a plugin process produced.
#[derive(Clone, Debug, Default)]
pub struct RunOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Executes one plugin command. The default implementation spawns the plugin
/// executable; tests substitute canned responses.
#[async_trait]
pub trait PluginRunner: Send + Sync {
    async fn run(
        &self,
        executable: &Path,
        command: Command,
        input: Vec<u8>,
        timeout: Duration,
    ) -> Result<RunOutput>;
}

/// Spawns `<executable> <command>` and feeds the request on stdin.
#[derive(Debug, Default)]
pub struct ProcessRunner;

#[async_trait]
impl PluginRunner for ProcessRunner {
    async fn run(
        &self,
        executable: &Path,
        command: Command,
        input: Vec<u8>,
        timeout: Duration,
    ) -> Result<RunOutput> {
        let spawn_err = |source| PluginError::Spawn {
            path: executable.to_path_buf(),
            source,
        };
        let mut child = tokio::process::Command::new(executable)
            .arg(command.as_ref())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        // written while the output is drained so a plugin that answers
        // before reading all of stdin cannot deadlock us
        let stdin = child.stdin.take();
        let write = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(&input).await,
                None => Ok(()),
            }
        };

        // dropping the child on timeout kills the process
        let (written, output) =
            tokio::time::timeout(timeout, async { tokio::join!(write, child.wait_with_output()) })
                .await
                .map_err(|_| PluginError::Timeout {
                    path: executable.to_path_buf(),
                    command,
                })?;
        let output = output.map_err(spawn_err)?;
        if let Err(source) = written {
            debug!(
                "plugin stderr: {}",
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
            return Err(PluginError::Stdin {
                path: executable.to_path_buf(),
                command,
                source,
            });
        }

        Ok(RunOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
