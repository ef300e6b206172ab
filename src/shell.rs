//! Remote shell transport backed by the system `ssh` and `scp` clients.
//!
//! Connections use batch mode with host key checking relaxed, matching the
//! short-lived hosts this tool manages. Streamed commands pipe the remote
//! stdout line by line; the exit status is checked after the stream drains
//! and a non-zero status is delivered as the final stream item.

use std::ffi::OsString;
use std::process::Stdio;

use camino::Utf8Path;
use shell_escape::unix::escape;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::exec::{LineStream, RemoteEndpoint, RemoteShell, ShellError, ShellFuture};
use crate::util::expand_tilde;

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Shell transport that spawns the host operating system's OpenSSH clients.
#[derive(Clone, Debug)]
pub struct ProcessShell {
    ssh_bin: String,
    scp_bin: String,
}

impl Default for ProcessShell {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
        }
    }
}

impl ProcessShell {
    /// Creates a transport using the default `ssh` and `scp` binaries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the transport binaries, mainly for tests.
    #[must_use]
    pub fn with_binaries(ssh_bin: impl Into<String>, scp_bin: impl Into<String>) -> Self {
        Self {
            ssh_bin: ssh_bin.into(),
            scp_bin: scp_bin.into(),
        }
    }

    fn common_options(endpoint: &RemoteEndpoint) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
            OsString::from("-o"),
            OsString::from("UserKnownHostsFile=/dev/null"),
        ];
        if let Some(ref identity_file) = endpoint.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file.as_str())));
        }
        args
    }

    fn ssh_args(&self, endpoint: &RemoteEndpoint, command: &str) -> Vec<OsString> {
        let mut args = vec![OsString::from("-p"), OsString::from(endpoint.port.to_string())];
        args.extend(Self::common_options(endpoint));
        args.push(OsString::from(format!("{}@{}", endpoint.user, endpoint.host)));
        args.push(OsString::from(command));
        args
    }

    fn scp_args(
        &self,
        endpoint: &RemoteEndpoint,
        local: &Utf8Path,
        remote: &Utf8Path,
    ) -> Vec<OsString> {
        let mut args = vec![OsString::from("-P"), OsString::from(endpoint.port.to_string())];
        args.extend(Self::common_options(endpoint));
        args.push(OsString::from(local.as_str()));
        args.push(OsString::from(format!(
            "{}@{}:{}",
            endpoint.user, endpoint.host, remote
        )));
        args
    }

    async fn run_command(
        &self,
        endpoint: &RemoteEndpoint,
        command: &str,
    ) -> Result<String, ShellError> {
        let output = Command::new(&self.ssh_bin)
            .args(self.ssh_args(endpoint, command))
            .output()
            .await
            .map_err(|err| ShellError::Spawn {
                program: self.ssh_bin.clone(),
                message: err.to_string(),
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let status = output.status.code();
        Err(ShellError::CommandFailure {
            host: endpoint.host.clone(),
            status,
            status_text: status.map_or_else(|| String::from("unknown"), |code| code.to_string()),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_owned(),
        })
    }

    async fn copy(
        &self,
        endpoint: &RemoteEndpoint,
        local: &Utf8Path,
        remote: &Utf8Path,
        mode: u32,
    ) -> Result<(), ShellError> {
        let output = Command::new(&self.scp_bin)
            .args(self.scp_args(endpoint, local, remote))
            .output()
            .await
            .map_err(|err| ShellError::Spawn {
                program: self.scp_bin.clone(),
                message: err.to_string(),
            })?;

        if !output.status.success() {
            return Err(ShellError::CopyFailure {
                host: endpoint.host.clone(),
                path: local.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim_end().to_owned(),
            });
        }

        // scp preserves the source mode; normalise to the requested bits.
        let escaped_remote = escape(remote.as_str().into());
        let chmod = format!("chmod {mode:03o} {escaped_remote}");
        self.run_command(endpoint, &chmod)
            .await
            .map_err(|err| ShellError::CopyFailure {
                host: endpoint.host.clone(),
                path: local.to_path_buf(),
                message: err.to_string(),
            })?;
        Ok(())
    }

    async fn stream_command(
        &self,
        endpoint: &RemoteEndpoint,
        command: &str,
        elevate: bool,
    ) -> Result<LineStream, ShellError> {
        let remote_command = if elevate {
            format!("sudo {command}")
        } else {
            command.to_owned()
        };

        let mut child = Command::new(&self.ssh_bin)
            .args(self.ssh_args(endpoint, &remote_command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ShellError::Spawn {
                program: self.ssh_bin.clone(),
                message: err.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ShellError::Spawn {
            program: self.ssh_bin.clone(),
            message: String::from("stdout pipe was not created"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ShellError::Spawn {
            program: self.ssh_bin.clone(),
            message: String::from("stderr pipe was not created"),
        })?;

        // Drain stderr concurrently so a chatty remote cannot stall the pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            BufReader::new(stderr).read_to_string(&mut buffer).await.ok();
            buffer
        });

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let host = endpoint.host.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(Ok(line)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tx.send(Err(ShellError::StreamRead {
                            host,
                            message: err.to_string(),
                        }))
                        .await
                        .ok();
                        return;
                    }
                }
            }

            let stderr_text = stderr_task.await.unwrap_or_default();
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    let code = status.code();
                    tx.send(Err(ShellError::CommandFailure {
                        host,
                        status: code,
                        status_text: code
                            .map_or_else(|| String::from("unknown"), |value| value.to_string()),
                        stderr: stderr_text.trim_end().to_owned(),
                    }))
                    .await
                    .ok();
                }
                Err(err) => {
                    tx.send(Err(ShellError::StreamRead {
                        host,
                        message: err.to_string(),
                    }))
                    .await
                    .ok();
                }
            }
        });

        Ok(LineStream::new(rx))
    }
}

impl RemoteShell for ProcessShell {
    fn run<'a>(
        &'a self,
        endpoint: &'a RemoteEndpoint,
        command: &'a str,
    ) -> ShellFuture<'a, String> {
        Box::pin(self.run_command(endpoint, command))
    }

    fn copy_file<'a>(
        &'a self,
        endpoint: &'a RemoteEndpoint,
        local: &'a Utf8Path,
        remote: &'a Utf8Path,
        mode: u32,
    ) -> ShellFuture<'a, ()> {
        Box::pin(self.copy(endpoint, local, remote, mode))
    }

    fn stream<'a>(
        &'a self,
        endpoint: &'a RemoteEndpoint,
        command: &'a str,
        elevate: bool,
    ) -> ShellFuture<'a, LineStream> {
        Box::pin(self.stream_command(endpoint, command, elevate))
    }
}
