//! Test support doubles shared across unit and integration tests.
//!
//! Both doubles are scripted in FIFO order per target, mirroring how the
//! real collaborators are exercised: the provider double drives launch and
//! readiness outcomes without network calls, and the shell double drives
//! remote command, copy, and stream outcomes without spawning processes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::exec::{LineStream, RemoteEndpoint, RemoteShell, ShellError, ShellFuture};
use crate::launch::{LaunchRequest, Tag};
use crate::provider::{CloudProvider, InstanceDescription, ProviderFuture};

/// Error type reported by [`FakeProvider`].
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("{0}")]
pub struct FakeProviderError(pub String);

#[derive(Default)]
struct FakeProviderState {
    launch_queue: VecDeque<Result<Vec<String>, String>>,
    tagging_error: Option<String>,
    tagging_calls: Vec<(Vec<String>, Vec<Tag>)>,
    wait_errors: BTreeMap<String, String>,
    wait_delays: BTreeMap<String, Duration>,
    waited: Vec<String>,
    addresses: BTreeMap<String, (Option<String>, Option<String>)>,
    start_error: Option<String>,
    stop_error: Option<String>,
    terminate_error: Option<String>,
    reboot_error: Option<String>,
    started: Vec<String>,
    stopped: Vec<String>,
    terminated: Vec<String>,
    rebooted: Vec<String>,
    image_queue: VecDeque<String>,
    image_calls: Vec<(String, String, String)>,
    launch_calls: usize,
}

/// Scripted [`CloudProvider`] double with recorded invocations.
#[derive(Clone, Default)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeProviderState>>,
}

impl FakeProvider {
    /// Creates a provider with no scripted responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeProviderState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queues a successful launch response with the given instance ids.
    pub fn queue_launch<I>(&self, instance_ids: Vec<I>)
    where
        I: Into<String>,
    {
        self.state()
            .launch_queue
            .push_back(Ok(instance_ids.into_iter().map(Into::into).collect()));
    }

    /// Queues a failing launch response.
    pub fn fail_launch(&self, message: &str) {
        self.state().launch_queue.push_back(Err(message.to_owned()));
    }

    /// Makes the next tagging call fail.
    pub fn fail_tagging(&self, message: &str) {
        self.state().tagging_error = Some(message.to_owned());
    }

    /// Records the addresses a describe call reports for an instance.
    pub fn set_addresses(&self, instance_id: &str, public: &str, private: &str) {
        self.state().addresses.insert(
            instance_id.to_owned(),
            (Some(public.to_owned()), Some(private.to_owned())),
        );
    }

    /// Records a describe response that carries only a private address.
    pub fn set_private_only(&self, instance_id: &str, private: &str) {
        self.state()
            .addresses
            .insert(instance_id.to_owned(), (None, Some(private.to_owned())));
    }

    /// Makes the readiness wait for one instance fail.
    pub fn fail_wait(&self, instance_id: &str, message: &str) {
        self.state()
            .wait_errors
            .insert(instance_id.to_owned(), message.to_owned());
    }

    /// Delays the readiness wait for one instance.
    pub fn delay_wait(&self, instance_id: &str, delay: Duration) {
        self.state()
            .wait_delays
            .insert(instance_id.to_owned(), delay);
    }

    /// Makes start calls fail.
    pub fn fail_start(&self, message: &str) {
        self.state().start_error = Some(message.to_owned());
    }

    /// Makes stop calls fail.
    pub fn fail_stop(&self, message: &str) {
        self.state().stop_error = Some(message.to_owned());
    }

    /// Makes terminate calls fail.
    pub fn fail_terminate(&self, message: &str) {
        self.state().terminate_error = Some(message.to_owned());
    }

    /// Makes reboot calls fail.
    pub fn fail_reboot(&self, message: &str) {
        self.state().reboot_error = Some(message.to_owned());
    }

    /// Queues the image id returned by the next image registration.
    pub fn queue_image_id(&self, image_id: &str) {
        self.state().image_queue.push_back(image_id.to_owned());
    }

    /// Instances whose readiness wait was entered, in call order.
    #[must_use]
    pub fn waited_instances(&self) -> Vec<String> {
        self.state().waited.clone()
    }

    /// Recorded tagging calls as `(resource ids, tags)` pairs.
    #[must_use]
    pub fn tagging_calls(&self) -> Vec<(Vec<String>, Vec<Tag>)> {
        self.state().tagging_calls.clone()
    }

    /// Instances passed to start, in call order.
    #[must_use]
    pub fn started_instances(&self) -> Vec<String> {
        self.state().started.clone()
    }

    /// Instances passed to stop, in call order.
    #[must_use]
    pub fn stopped_instances(&self) -> Vec<String> {
        self.state().stopped.clone()
    }

    /// Instances passed to terminate, in call order.
    #[must_use]
    pub fn terminated_instances(&self) -> Vec<String> {
        self.state().terminated.clone()
    }

    /// Instances passed to reboot, in call order.
    #[must_use]
    pub fn rebooted_instances(&self) -> Vec<String> {
        self.state().rebooted.clone()
    }

    /// Recorded image registrations as `(instance id, name, description)`.
    #[must_use]
    pub fn image_calls(&self) -> Vec<(String, String, String)> {
        self.state().image_calls.clone()
    }

    /// Number of launch submissions received.
    #[must_use]
    pub fn launch_call_count(&self) -> usize {
        self.state().launch_calls
    }

    fn next_launch(&self) -> Result<Vec<String>, FakeProviderError> {
        let mut state = self.state();
        state.launch_calls += 1;
        state
            .launch_queue
            .pop_front()
            .unwrap_or_else(|| Err(String::from("no scripted launch response")))
            .map_err(FakeProviderError)
    }

    fn wait_plan(&self, instance_id: &str) -> (Option<Duration>, Result<(), FakeProviderError>) {
        let mut state = self.state();
        state.waited.push(instance_id.to_owned());
        let delay = state.wait_delays.get(instance_id).copied();
        let result = state
            .wait_errors
            .get(instance_id)
            .cloned()
            .map_or(Ok(()), |message| Err(FakeProviderError(message)));
        (delay, result)
    }

    fn describe_plan(&self, instance_id: &str) -> InstanceDescription {
        let state = self.state();
        let (public_address, private_address) = state
            .addresses
            .get(instance_id)
            .cloned()
            .unwrap_or((None, None));
        InstanceDescription {
            id: instance_id.to_owned(),
            public_address,
            private_address,
            state: String::from("running"),
        }
    }
}

impl CloudProvider for FakeProvider {
    type Error = FakeProviderError;

    fn launch<'a>(
        &'a self,
        _request: &'a LaunchRequest,
    ) -> ProviderFuture<'a, Vec<String>, Self::Error> {
        Box::pin(async move { self.next_launch() })
    }

    fn create_tags<'a>(
        &'a self,
        instance_ids: &'a [String],
        tags: &'a [Tag],
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            state
                .tagging_calls
                .push((instance_ids.to_vec(), tags.to_vec()));
            state
                .tagging_error
                .clone()
                .map_or(Ok(()), |message| Err(FakeProviderError(message)))
        })
    }

    fn start_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            state.started.push(instance_id.to_owned());
            state
                .start_error
                .clone()
                .map_or(Ok(()), |message| Err(FakeProviderError(message)))
        })
    }

    fn stop_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            state.stopped.push(instance_id.to_owned());
            state
                .stop_error
                .clone()
                .map_or(Ok(()), |message| Err(FakeProviderError(message)))
        })
    }

    fn terminate_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            state.terminated.push(instance_id.to_owned());
            state
                .terminate_error
                .clone()
                .map_or(Ok(()), |message| Err(FakeProviderError(message)))
        })
    }

    fn reboot_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            state.rebooted.push(instance_id.to_owned());
            state
                .reboot_error
                .clone()
                .map_or(Ok(()), |message| Err(FakeProviderError(message)))
        })
    }

    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, InstanceDescription, Self::Error> {
        Box::pin(async move { Ok(self.describe_plan(instance_id)) })
    }

    fn wait_until_running<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let (delay, result) = self.wait_plan(instance_id);
            if let Some(duration) = delay {
                sleep(duration).await;
            }
            result
        })
    }

    fn create_image<'a>(
        &'a self,
        instance_id: &'a str,
        name: &'a str,
        description: &'a str,
    ) -> ProviderFuture<'a, String, Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            state.image_calls.push((
                instance_id.to_owned(),
                name.to_owned(),
                description.to_owned(),
            ));
            Ok(state
                .image_queue
                .pop_front()
                .unwrap_or_else(|| String::from("ami-fake")))
        })
    }
}

/// One invocation recorded by [`ScriptedShell`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ShellCall {
    /// A `run` call with its command string.
    Run {
        /// Command passed to the transport.
        command: String,
    },
    /// A `copy_file` call with its paths and mode.
    Copy {
        /// Local source path.
        local: Utf8PathBuf,
        /// Remote destination path.
        remote: Utf8PathBuf,
        /// Requested permission bits.
        mode: u32,
    },
    /// A `stream` call with its command and elevation flag.
    Stream {
        /// Command passed to the transport.
        command: String,
        /// Whether the sudo-wrapped variant was requested.
        elevate: bool,
    },
}

#[derive(Default)]
struct ScriptedShellState {
    run_responses: BTreeMap<String, VecDeque<Result<String, ShellError>>>,
    copy_responses: BTreeMap<String, VecDeque<Result<(), ShellError>>>,
    stream_responses: BTreeMap<String, VecDeque<Vec<Result<String, ShellError>>>>,
    calls: BTreeMap<String, Vec<ShellCall>>,
}

/// Scripted [`RemoteShell`] double returning pre-seeded responses per host.
#[derive(Clone, Default)]
pub struct ScriptedShell {
    state: Arc<Mutex<ScriptedShellState>>,
}

impl ScriptedShell {
    /// Creates a shell with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptedShellState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queues the outcome of the next `run` call against `host`.
    pub fn expect_run(&self, host: &str, response: Result<String, ShellError>) {
        self.state()
            .run_responses
            .entry(host.to_owned())
            .or_default()
            .push_back(response);
    }

    /// Queues the outcome of the next `copy_file` call against `host`.
    pub fn expect_copy(&self, host: &str, response: Result<(), ShellError>) {
        self.state()
            .copy_responses
            .entry(host.to_owned())
            .or_default()
            .push_back(response);
    }

    /// Queues the items yielded by the next `stream` call against `host`.
    pub fn expect_stream(&self, host: &str, items: Vec<Result<String, ShellError>>) {
        self.state()
            .stream_responses
            .entry(host.to_owned())
            .or_default()
            .push_back(items);
    }

    /// Returns every call recorded against `host`, in order.
    #[must_use]
    pub fn calls_for(&self, host: &str) -> Vec<ShellCall> {
        self.state().calls.get(host).cloned().unwrap_or_default()
    }

    fn record(&self, host: &str, call: ShellCall) {
        self.state()
            .calls
            .entry(host.to_owned())
            .or_default()
            .push(call);
    }

    fn unscripted(host: &str, operation: &str) -> ShellError {
        ShellError::Spawn {
            program: String::from("scripted-shell"),
            message: format!("no scripted {operation} response for host {host}"),
        }
    }
}

impl RemoteShell for ScriptedShell {
    fn run<'a>(
        &'a self,
        endpoint: &'a RemoteEndpoint,
        command: &'a str,
    ) -> ShellFuture<'a, String> {
        Box::pin(async move {
            self.record(
                &endpoint.host,
                ShellCall::Run {
                    command: command.to_owned(),
                },
            );
            self.state()
                .run_responses
                .get_mut(&endpoint.host)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Err(Self::unscripted(&endpoint.host, "run")))
        })
    }

    fn copy_file<'a>(
        &'a self,
        endpoint: &'a RemoteEndpoint,
        local: &'a Utf8Path,
        remote: &'a Utf8Path,
        mode: u32,
    ) -> ShellFuture<'a, ()> {
        Box::pin(async move {
            self.record(
                &endpoint.host,
                ShellCall::Copy {
                    local: local.to_path_buf(),
                    remote: remote.to_path_buf(),
                    mode,
                },
            );
            self.state()
                .copy_responses
                .get_mut(&endpoint.host)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Err(Self::unscripted(&endpoint.host, "copy")))
        })
    }

    fn stream<'a>(
        &'a self,
        endpoint: &'a RemoteEndpoint,
        command: &'a str,
        elevate: bool,
    ) -> ShellFuture<'a, LineStream> {
        Box::pin(async move {
            self.record(
                &endpoint.host,
                ShellCall::Stream {
                    command: command.to_owned(),
                    elevate,
                },
            );
            let items = self
                .state()
                .stream_responses
                .get_mut(&endpoint.host)
                .and_then(VecDeque::pop_front)
                .ok_or_else(|| Self::unscripted(&endpoint.host, "stream"))?;

            let (tx, rx) = mpsc::channel(items.len().max(1));
            for item in items {
                tx.try_send(item).ok();
            }
            drop(tx);
            Ok(LineStream::new(rx))
        })
    }
}
