//! Instance provisioning and concurrent readiness monitoring.
//!
//! The provisioner submits a launch request, applies tags to the whole batch
//! in one call, and then runs one readiness wait per launched instance. The
//! waits are independent failure domains: one instance timing out never
//! blocks or cancels its siblings. Outcomes are consumed incrementally so
//! the caller can record each instance as it becomes ready instead of
//! waiting for the slowest one.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::fanout::{CompletionStream, TaskGroup};
use crate::launch::LaunchRequest;
use crate::provider::CloudProvider;

/// Addresses reported for an instance that reached the running state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadyInstance {
    /// Provider-assigned instance identifier.
    pub instance_id: String,
    /// Public address assigned by the provider.
    pub public_address: String,
    /// Private address assigned by the provider.
    pub private_address: String,
}

/// Readiness failure scoped to a single instance.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("instance {instance_id}: {message}")]
pub struct ReadinessError {
    /// Instance the failure concerns.
    pub instance_id: String,
    /// Description of the wait or describe failure.
    pub message: String,
}

/// Outcome of one instance's readiness wait.
pub type ReadyOutcome = Result<ReadyInstance, ReadinessError>;

/// Errors raised while submitting a launch batch.
///
/// These are fatal for the whole batch, unlike [`ReadinessError`] which is
/// scoped to one instance.
#[derive(Debug, Error)]
pub enum ProvisionError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the launch request is rejected by the provider.
    #[error("launch submission failed: {0}")]
    Submit(#[source] E),
    /// Raised when the provider accepted the request but launched nothing.
    #[error("launch request returned no instances")]
    NothingLaunched,
    /// Raised when batched tagging fails; no readiness wait has begun.
    #[error("failed to tag launched instances: {0}")]
    Tagging(#[source] E),
}

/// Submits launch requests and fans out readiness monitors.
#[derive(Debug)]
pub struct Provisioner<P> {
    provider: Arc<P>,
}

impl<P> Provisioner<P>
where
    P: CloudProvider + 'static,
{
    /// Creates a provisioner over a shared provider handle.
    #[must_use]
    pub const fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }

    /// Submits `request`, tags the batch, and spawns one readiness monitor
    /// per launched instance.
    ///
    /// The returned stream yields exactly one outcome per launched instance,
    /// in completion order. Consumers update the registry between receives;
    /// the monitors themselves never touch shared state.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Submit`] when the launch call fails,
    /// [`ProvisionError::NothingLaunched`] when the provider reports zero
    /// instances, and [`ProvisionError::Tagging`] when the batched tagging
    /// call fails; tagging failure aborts before any readiness wait begins.
    pub async fn launch_all(
        &self,
        request: &LaunchRequest,
    ) -> Result<CompletionStream<ReadyOutcome>, ProvisionError<P::Error>> {
        let instance_ids = self
            .provider
            .launch(request)
            .await
            .map_err(ProvisionError::Submit)?;
        if instance_ids.is_empty() {
            return Err(ProvisionError::NothingLaunched);
        }
        info!(count = instance_ids.len(), "launch request accepted");

        if !request.tags.is_empty() {
            self.provider
                .create_tags(&instance_ids, &request.tags)
                .await
                .map_err(ProvisionError::Tagging)?;
        }

        let mut group = TaskGroup::new();
        for instance_id in instance_ids {
            let provider = Arc::clone(&self.provider);
            group.spawn(async move { monitor_readiness(provider.as_ref(), &instance_id).await });
        }
        Ok(group.into_stream())
    }

    /// Runs a single readiness wait, used when restarting a known instance.
    pub async fn wait_ready(&self, instance_id: &str) -> ReadyOutcome {
        monitor_readiness(self.provider.as_ref(), instance_id).await
    }
}

/// Blocks until the provider reports the instance running, then fetches its
/// addresses.
///
/// Long-poll semantics belong to the provider's wait primitive; no extra
/// timeout is imposed here. Every failure is tagged with the instance id so
/// aggregate reports name the instance they concern.
async fn monitor_readiness<P>(provider: &P, instance_id: &str) -> ReadyOutcome
where
    P: CloudProvider,
{
    info!(instance_id, "waiting for instance to enter the running state");
    provider
        .wait_until_running(instance_id)
        .await
        .map_err(|err| readiness_error(instance_id, &err))?;

    let description = provider
        .describe_instance(instance_id)
        .await
        .map_err(|err| readiness_error(instance_id, &err))?;

    let public_address = description
        .public_address
        .ok_or_else(|| missing_field(instance_id, "public address"))?;
    let private_address = description
        .private_address
        .ok_or_else(|| missing_field(instance_id, "private address"))?;

    info!(instance_id, %public_address, %private_address, "instance is running");
    Ok(ReadyInstance {
        instance_id: description.id,
        public_address,
        private_address,
    })
}

fn readiness_error<E>(instance_id: &str, err: &E) -> ReadinessError
where
    E: std::fmt::Display,
{
    ReadinessError {
        instance_id: instance_id.to_owned(),
        message: err.to_string(),
    }
}

fn missing_field(instance_id: &str, field: &str) -> ReadinessError {
    ReadinessError {
        instance_id: instance_id.to_owned(),
        message: format!("describe response is missing the {field}"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::launch::{LaunchRequest, Tag};
    use crate::test_support::{FakeProvider, FakeProviderError};

    use super::*;

    fn request_with_tags(count: i32, tags: Vec<Tag>) -> LaunchRequest {
        LaunchRequest {
            instance_type: String::from("t2.micro"),
            image_id: String::from("ami-1"),
            key_name: String::from("ops"),
            count,
            block_devices: Vec::new(),
            subnet_id: String::from("subnet-1"),
            security_group_ids: Vec::new(),
            iam_role: None,
            tags,
        }
    }

    #[tokio::test]
    async fn launch_all_yields_one_outcome_per_instance() {
        let provider = FakeProvider::new();
        provider.queue_launch(vec!["i-1", "i-2", "i-3"]);
        for id in ["i-1", "i-2", "i-3"] {
            provider.set_addresses(id, "203.0.113.1", "10.0.0.1");
        }
        let provisioner = Provisioner::new(Arc::new(provider));

        let mut stream = provisioner
            .launch_all(&request_with_tags(3, Vec::new()))
            .await
            .unwrap_or_else(|err| panic!("launch_all: {err}"));

        let mut outcomes = Vec::new();
        while let Some(outcome) = stream.next().await {
            outcomes.push(outcome);
        }
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn one_failure_does_not_suppress_siblings() {
        let provider = FakeProvider::new();
        provider.queue_launch(vec!["i-ok-1", "i-bad", "i-ok-2"]);
        provider.set_addresses("i-ok-1", "203.0.113.1", "10.0.0.1");
        provider.set_addresses("i-ok-2", "203.0.113.2", "10.0.0.2");
        provider.fail_wait("i-bad", "simulated wait timeout");
        let provisioner = Provisioner::new(Arc::new(provider));

        let mut stream = provisioner
            .launch_all(&request_with_tags(3, Vec::new()))
            .await
            .unwrap_or_else(|err| panic!("launch_all: {err}"));

        let mut ready = Vec::new();
        let mut failed = Vec::new();
        while let Some(outcome) = stream.next().await {
            match outcome {
                Ok(instance) => ready.push(instance.instance_id),
                Err(err) => failed.push(err),
            }
        }

        ready.sort_unstable();
        assert_eq!(ready, vec![String::from("i-ok-1"), String::from("i-ok-2")]);
        assert_eq!(failed.len(), 1);
        let failure = failed.first().expect("one failure expected");
        assert_eq!(failure.instance_id, "i-bad");
        assert!(failure.message.contains("simulated wait timeout"));
    }

    #[tokio::test]
    async fn slow_failure_does_not_delay_fast_siblings() {
        let provider = FakeProvider::new();
        provider.queue_launch(vec!["i-fast", "i-slow"]);
        provider.set_addresses("i-fast", "203.0.113.1", "10.0.0.1");
        provider.fail_wait("i-slow", "late failure");
        provider.delay_wait("i-slow", Duration::from_millis(120));
        let provisioner = Provisioner::new(Arc::new(provider));

        let mut stream = provisioner
            .launch_all(&request_with_tags(2, Vec::new()))
            .await
            .unwrap_or_else(|err| panic!("launch_all: {err}"));

        // The fast instance is delivered first despite the failing sibling
        // still being in flight.
        let first = stream.next().await.expect("first outcome");
        assert_eq!(
            first.expect("fast instance should be ready").instance_id,
            "i-fast"
        );
        let second = stream.next().await.expect("second outcome");
        assert_eq!(second.expect_err("slow instance should fail").instance_id, "i-slow");
    }

    #[tokio::test]
    async fn empty_launch_response_is_fatal() {
        let provider = FakeProvider::new();
        provider.queue_launch(Vec::<&str>::new());
        let provisioner = Provisioner::new(Arc::new(provider));

        let result = provisioner.launch_all(&request_with_tags(1, Vec::new())).await;

        assert!(matches!(result, Err(ProvisionError::NothingLaunched)));
    }

    #[tokio::test]
    async fn submission_error_is_fatal() {
        let provider = FakeProvider::new();
        provider.fail_launch("capacity exhausted");
        let provisioner = Provisioner::new(Arc::new(provider));

        let result = provisioner.launch_all(&request_with_tags(1, Vec::new())).await;

        assert!(matches!(result, Err(ProvisionError::Submit(_))));
    }

    #[tokio::test]
    async fn tagging_failure_aborts_before_any_wait() {
        let provider = FakeProvider::new();
        provider.queue_launch(vec!["i-1", "i-2"]);
        provider.fail_tagging("tag quota exceeded");
        let provisioner = Provisioner::new(Arc::new(provider.clone()));

        let tags = vec![Tag {
            key: String::from("env"),
            value: String::from("prod"),
        }];
        let result = provisioner.launch_all(&request_with_tags(2, tags)).await;

        assert!(matches!(result, Err(ProvisionError::Tagging(_))));
        assert!(
            provider.waited_instances().is_empty(),
            "no readiness wait should begin after a tagging failure"
        );
    }

    #[tokio::test]
    async fn tagging_applies_to_all_instances_in_one_call() {
        let provider = FakeProvider::new();
        provider.queue_launch(vec!["i-1", "i-2"]);
        provider.set_addresses("i-1", "203.0.113.1", "10.0.0.1");
        provider.set_addresses("i-2", "203.0.113.2", "10.0.0.2");
        let provisioner = Provisioner::new(Arc::new(provider.clone()));

        let tags = vec![Tag {
            key: String::from("env"),
            value: String::from("prod"),
        }];
        let mut stream = provisioner
            .launch_all(&request_with_tags(2, tags))
            .await
            .unwrap_or_else(|err| panic!("launch_all: {err}"));
        while stream.next().await.is_some() {}

        let calls = provider.tagging_calls();
        assert_eq!(calls.len(), 1, "tagging should be one batched call");
        let (ids, applied) = calls.first().expect("one tagging call");
        assert_eq!(ids, &vec![String::from("i-1"), String::from("i-2")]);
        assert_eq!(applied.len(), 1);
    }

    #[tokio::test]
    async fn missing_address_is_reported_with_instance_id() {
        let provider = FakeProvider::new();
        provider.queue_launch(vec!["i-headless"]);
        provider.set_private_only("i-headless", "10.0.0.9");
        let provisioner = Provisioner::new(Arc::new(provider));

        let mut stream = provisioner
            .launch_all(&request_with_tags(1, Vec::new()))
            .await
            .unwrap_or_else(|err| panic!("launch_all: {err}"));

        let outcome = stream.next().await.expect("one outcome");
        let err = outcome.expect_err("missing public address should fail");
        assert_eq!(err.instance_id, "i-headless");
        assert!(err.message.contains("public address"));
    }

    #[tokio::test]
    async fn wait_ready_surfaces_provider_errors() {
        let provider = FakeProvider::new();
        provider.fail_wait("i-gone", "no such instance");
        let provisioner = Provisioner::new(Arc::new(provider));

        let err = provisioner
            .wait_ready("i-gone")
            .await
            .expect_err("wait should fail");

        assert_eq!(err.instance_id, "i-gone");
        assert_eq!(
            err.message,
            FakeProviderError(String::from("no such instance")).to_string()
        );
    }
}
