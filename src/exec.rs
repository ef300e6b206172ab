//! Remote command and script execution fanned out over many hosts.
//!
//! The executor runs one task per target host and blocks until every host
//! has reported, success or failure: a full barrier, unlike the
//! provisioner's incremental stream. Within a host, script mode is strictly
//! sequential with abort-on-first-failure; across hosts nothing is ordered
//! and nothing is cancelled.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::fanout::TaskGroup;

/// Remote directory staged scripts are copied into before execution.
pub const REMOTE_STAGING_DIR: &str = "/tmp";

/// Permission bits applied to staged scripts.
pub const STAGED_SCRIPT_MODE: u32 = 0o644;

/// Connection coordinates for one remote host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteEndpoint {
    /// User to authenticate as.
    pub user: String,
    /// Hostname or address.
    pub host: String,
    /// TCP port the remote shell listens on.
    pub port: u16,
    /// Private key used for authentication, when not left to the transport's
    /// defaults.
    pub identity_file: Option<Utf8PathBuf>,
}

impl RemoteEndpoint {
    /// Builds an endpoint with no explicit identity file.
    #[must_use]
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
            identity_file: None,
        }
    }

    /// Attaches an identity file to the endpoint.
    #[must_use]
    pub fn with_identity_file(mut self, path: Utf8PathBuf) -> Self {
        self.identity_file = Some(path);
        self
    }
}

/// Errors raised by the remote shell transport.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ShellError {
    /// Raised when a transport process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the remote command exits with a failure status.
    #[error("remote command on {host} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Host the command ran on.
        host: String,
        /// Exit status, if the process reported one.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the remote command.
        stderr: String,
    },
    /// Raised when copying a file to the remote host fails.
    #[error("failed to copy {path} to {host}: {message}")]
    CopyFailure {
        /// Host the copy targeted.
        host: String,
        /// Local path that was being copied.
        path: Utf8PathBuf,
        /// Transport error message.
        message: String,
    },
    /// Raised when reading the remote output stream fails.
    #[error("output stream from {host} failed: {message}")]
    StreamRead {
        /// Host whose stream failed.
        host: String,
        /// Read error message.
        message: String,
    },
}

/// Live line-by-line output from a streamed remote command.
///
/// The stream ends when the remote process exits; a failure (non-zero exit
/// or read error) is delivered as the final item.
#[derive(Debug)]
pub struct LineStream {
    rx: mpsc::Receiver<Result<String, ShellError>>,
}

impl LineStream {
    pub(crate) const fn new(rx: mpsc::Receiver<Result<String, ShellError>>) -> Self {
        Self { rx }
    }

    /// Waits for the next output line; `None` once the stream has ended.
    pub async fn next_line(&mut self) -> Option<Result<String, ShellError>> {
        self.rx.recv().await
    }
}

/// Future returned by remote shell operations.
pub type ShellFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ShellError>> + Send + 'a>>;

/// Minimal interface onto a remote shell transport.
pub trait RemoteShell: Send + Sync {
    /// Connects and runs `command`, capturing its combined output.
    fn run<'a>(
        &'a self,
        endpoint: &'a RemoteEndpoint,
        command: &'a str,
    ) -> ShellFuture<'a, String>;

    /// Copies a local file to `remote` with the given permission bits.
    fn copy_file<'a>(
        &'a self,
        endpoint: &'a RemoteEndpoint,
        local: &'a Utf8Path,
        remote: &'a Utf8Path,
        mode: u32,
    ) -> ShellFuture<'a, ()>;

    /// Runs `command` and exposes its output as a lazy line sequence.
    /// `elevate` selects the sudo-wrapped variant.
    fn stream<'a>(
        &'a self,
        endpoint: &'a RemoteEndpoint,
        command: &'a str,
        elevate: bool,
    ) -> ShellFuture<'a, LineStream>;
}

/// Result of one host's participation in a fan-out.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostOutcome {
    /// Host the outcome concerns.
    pub host: String,
    /// Captured output on success, or the first error the host hit.
    pub result: Result<String, ShellError>,
}

/// Fans commands and scripts out to many hosts over a [`RemoteShell`].
#[derive(Debug)]
pub struct RemoteExecutor<S> {
    shell: Arc<S>,
}

impl<S> RemoteExecutor<S>
where
    S: RemoteShell + 'static,
{
    /// Creates an executor over a shared shell transport.
    #[must_use]
    pub const fn new(shell: Arc<S>) -> Self {
        Self { shell }
    }

    /// Runs `command` on every host concurrently and blocks until all hosts
    /// have reported.
    ///
    /// Exactly one outcome is returned per target host. Hosts complete in
    /// any order; a failing host never affects its siblings.
    pub async fn run_command(
        &self,
        endpoints: &[RemoteEndpoint],
        command: &str,
    ) -> Vec<HostOutcome> {
        let mut group = TaskGroup::new();
        for endpoint in endpoints.iter().cloned() {
            let shell = Arc::clone(&self.shell);
            let command_text = command.to_owned();
            group.spawn(async move {
                let result = shell.run(&endpoint, &command_text).await;
                match &result {
                    Ok(output) => info!(host = %endpoint.host, "{output}"),
                    Err(err) => warn!(host = %endpoint.host, error = %err, "command failed"),
                }
                HostOutcome {
                    host: endpoint.host,
                    result,
                }
            });
        }
        group.join_all().await
    }

    /// Copies each script to the remote staging path and executes it,
    /// sequentially per host, concurrently across hosts, blocking until all
    /// hosts have reported.
    ///
    /// A host's sequence aborts at the first script that fails to copy or
    /// fails during execution; its remaining scripts are skipped while
    /// sibling hosts continue independently. Output is consumed as a live
    /// line sequence and echoed to the log as it arrives.
    pub async fn run_scripts(
        &self,
        endpoints: &[RemoteEndpoint],
        scripts: &[Utf8PathBuf],
        elevate: bool,
    ) -> Vec<HostOutcome> {
        let mut group = TaskGroup::new();
        for endpoint in endpoints.iter().cloned() {
            let shell = Arc::clone(&self.shell);
            let script_list = scripts.to_vec();
            group.spawn(async move {
                let result =
                    run_host_scripts(shell.as_ref(), &endpoint, &script_list, elevate).await;
                if let Err(ref err) = result {
                    warn!(host = %endpoint.host, error = %err, "script run failed");
                }
                HostOutcome {
                    host: endpoint.host,
                    result,
                }
            });
        }
        group.join_all().await
    }
}

/// Executes the script list for a single host, aborting on first failure.
async fn run_host_scripts<S>(
    shell: &S,
    endpoint: &RemoteEndpoint,
    scripts: &[Utf8PathBuf],
    elevate: bool,
) -> Result<String, ShellError>
where
    S: RemoteShell + ?Sized,
{
    let mut transcript = Vec::new();
    for script in scripts {
        let file_name = script
            .file_name()
            .ok_or_else(|| ShellError::CopyFailure {
                host: endpoint.host.clone(),
                path: script.clone(),
                message: String::from("script path has no filename"),
            })?;
        let staged = Utf8PathBuf::from(REMOTE_STAGING_DIR).join(file_name);

        shell
            .copy_file(endpoint, script, &staged, STAGED_SCRIPT_MODE)
            .await?;
        info!(host = %endpoint.host, script = %script, staged = %staged, "sent script");

        let mut stream = shell
            .stream(endpoint, &format!("bash {staged}"), elevate)
            .await?;
        while let Some(item) = stream.next_line().await {
            match item {
                Ok(line) => {
                    info!(host = %endpoint.host, "{line}");
                    transcript.push(line);
                }
                // The stream delivers its error last; surface it as this
                // host's final outcome and skip its remaining scripts.
                Err(err) => return Err(err),
            }
        }
    }
    Ok(transcript.join("\n"))
}

#[cfg(test)]
mod tests {
    use crate::test_support::{ScriptedShell, ShellCall};

    use super::*;

    fn endpoints(hosts: &[&str]) -> Vec<RemoteEndpoint> {
        hosts
            .iter()
            .map(|host| RemoteEndpoint::new("ops", *host, 22))
            .collect()
    }

    #[tokio::test]
    async fn run_command_reports_every_host() {
        let shell = ScriptedShell::new();
        shell.expect_run("alpha", Ok(String::from("alpha-ok")));
        shell.expect_run("beta", Ok(String::from("beta-ok")));
        shell.expect_run("gamma", Ok(String::from("gamma-ok")));
        let executor = RemoteExecutor::new(Arc::new(shell));

        let mut outcomes = executor
            .run_command(&endpoints(&["alpha", "beta", "gamma"]), "uptime")
            .await;
        outcomes.sort_by(|a, b| a.host.cmp(&b.host));

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|outcome| outcome.result.is_ok()));
    }

    #[tokio::test]
    async fn run_command_keeps_sibling_failures_separate() {
        let shell = ScriptedShell::new();
        shell.expect_run("good", Ok(String::from("fine")));
        shell.expect_run(
            "bad",
            Err(ShellError::CommandFailure {
                host: String::from("bad"),
                status: Some(1),
                status_text: String::from("1"),
                stderr: String::from("boom"),
            }),
        );
        let executor = RemoteExecutor::new(Arc::new(shell));

        let mut outcomes = executor
            .run_command(&endpoints(&["good", "bad"]), "true")
            .await;
        outcomes.sort_by(|a, b| a.host.cmp(&b.host));

        let bad = outcomes.first().expect("bad outcome present");
        assert_eq!(bad.host, "bad");
        assert!(bad.result.is_err());
        let good = outcomes.get(1).expect("good outcome present");
        assert_eq!(good.host, "good");
        assert_eq!(good.result.as_deref(), Ok("fine"));
    }

    #[tokio::test]
    async fn scripts_stage_then_stream_in_order() {
        let shell = ScriptedShell::new();
        shell.expect_copy("alpha", Ok(()));
        shell.expect_stream("alpha", vec![Ok(String::from("line-1")), Ok(String::from("line-2"))]);
        shell.expect_copy("alpha", Ok(()));
        shell.expect_stream("alpha", vec![Ok(String::from("line-3"))]);
        let executor = RemoteExecutor::new(Arc::new(shell.clone()));

        let scripts = vec![
            Utf8PathBuf::from("./setup/install.sh"),
            Utf8PathBuf::from("./setup/verify.sh"),
        ];
        let outcomes = executor
            .run_scripts(&endpoints(&["alpha"]), &scripts, false)
            .await;

        let outcome = outcomes.first().expect("one outcome");
        assert_eq!(outcome.result.as_deref(), Ok("line-1\nline-2\nline-3"));

        let calls = shell.calls_for("alpha");
        assert_eq!(
            calls,
            vec![
                ShellCall::Copy {
                    local: Utf8PathBuf::from("./setup/install.sh"),
                    remote: Utf8PathBuf::from("/tmp/install.sh"),
                    mode: STAGED_SCRIPT_MODE,
                },
                ShellCall::Stream {
                    command: String::from("bash /tmp/install.sh"),
                    elevate: false,
                },
                ShellCall::Copy {
                    local: Utf8PathBuf::from("./setup/verify.sh"),
                    remote: Utf8PathBuf::from("/tmp/verify.sh"),
                    mode: STAGED_SCRIPT_MODE,
                },
                ShellCall::Stream {
                    command: String::from("bash /tmp/verify.sh"),
                    elevate: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn copy_failure_skips_remaining_scripts_for_that_host_only() {
        let shell = ScriptedShell::new();
        // Host A runs both scripts cleanly.
        shell.expect_copy("host-a", Ok(()));
        shell.expect_stream("host-a", vec![Ok(String::from("a-1"))]);
        shell.expect_copy("host-a", Ok(()));
        shell.expect_stream("host-a", vec![Ok(String::from("a-2"))]);
        // Host B fails the first copy.
        shell.expect_copy(
            "host-b",
            Err(ShellError::CopyFailure {
                host: String::from("host-b"),
                path: Utf8PathBuf::from("one.sh"),
                message: String::from("connection refused"),
            }),
        );
        let executor = RemoteExecutor::new(Arc::new(shell.clone()));

        let scripts = vec![Utf8PathBuf::from("one.sh"), Utf8PathBuf::from("two.sh")];
        let mut outcomes = executor
            .run_scripts(&endpoints(&["host-a", "host-b"]), &scripts, false)
            .await;
        outcomes.sort_by(|a, b| a.host.cmp(&b.host));

        assert_eq!(outcomes.len(), 2);
        let host_a = outcomes.first().expect("host-a outcome");
        assert_eq!(host_a.result.as_deref(), Ok("a-1\na-2"));
        let host_b = outcomes.get(1).expect("host-b outcome");
        assert!(matches!(
            host_b.result,
            Err(ShellError::CopyFailure { .. })
        ));

        // Host B never staged its second script.
        let b_calls = shell.calls_for("host-b");
        assert_eq!(b_calls.len(), 1);
        assert!(matches!(
            b_calls.first(),
            Some(ShellCall::Copy { local, .. }) if local == &Utf8PathBuf::from("one.sh")
        ));
    }

    #[tokio::test]
    async fn script_failure_mid_stream_is_final_error() {
        let shell = ScriptedShell::new();
        shell.expect_copy("alpha", Ok(()));
        shell.expect_stream(
            "alpha",
            vec![
                Ok(String::from("starting")),
                Err(ShellError::CommandFailure {
                    host: String::from("alpha"),
                    status: Some(2),
                    status_text: String::from("2"),
                    stderr: String::from("script blew up"),
                }),
            ],
        );
        let executor = RemoteExecutor::new(Arc::new(shell.clone()));

        let scripts = vec![Utf8PathBuf::from("one.sh"), Utf8PathBuf::from("two.sh")];
        let outcomes = executor
            .run_scripts(&endpoints(&["alpha"]), &scripts, false)
            .await;

        let outcome = outcomes.first().expect("one outcome");
        assert!(matches!(
            outcome.result,
            Err(ShellError::CommandFailure { status: Some(2), .. })
        ));
        // The failed stream ended the host's sequence; two.sh was never
        // staged.
        assert_eq!(shell.calls_for("alpha").len(), 2);
    }

    #[tokio::test]
    async fn elevate_flag_reaches_the_transport() {
        let shell = ScriptedShell::new();
        shell.expect_copy("alpha", Ok(()));
        shell.expect_stream("alpha", vec![Ok(String::from("done"))]);
        let executor = RemoteExecutor::new(Arc::new(shell.clone()));

        let scripts = vec![Utf8PathBuf::from("one.sh")];
        let outcomes = executor.run_scripts(&endpoints(&["alpha"]), &scripts, true).await;

        assert!(outcomes.first().expect("one outcome").result.is_ok());
        assert!(shell.calls_for("alpha").iter().any(|call| matches!(
            call,
            ShellCall::Stream { elevate: true, .. }
        )));
    }
}
