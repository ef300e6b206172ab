//! Narrow interface onto the cloud provider's instance API.
//!
//! Everything the rest of the crate needs from a provider is expressed here:
//! submit a launch request, tag resources, drive instance power state by id,
//! describe an instance, long-poll until it is running, and register an
//! image. The wait primitive owns its own retry and backoff semantics; the
//! readiness monitor deliberately does not implement its own.

use std::future::Future;
use std::pin::Pin;

use crate::launch::{LaunchRequest, Tag};

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Point-in-time view of one provider instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceDescription {
    /// Provider-assigned instance identifier.
    pub id: String,
    /// Public address, when one is assigned.
    pub public_address: Option<String>,
    /// Private address, when one is assigned.
    pub private_address: Option<String>,
    /// Provider state name, for example `running` or `pending`.
    pub state: String,
}

/// Minimal interface implemented by cloud providers.
pub trait CloudProvider: Send + Sync {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Submits a launch request and returns the identifiers of every
    /// instance the provider reports as launched.
    fn launch<'a>(
        &'a self,
        request: &'a LaunchRequest,
    ) -> ProviderFuture<'a, Vec<String>, Self::Error>;

    /// Applies `tags` to every listed instance in one batched call.
    fn create_tags<'a>(
        &'a self,
        instance_ids: &'a [String],
        tags: &'a [Tag],
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Starts a stopped instance.
    fn start_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, (), Self::Error>;

    /// Stops a running instance.
    fn stop_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, (), Self::Error>;

    /// Terminates an instance permanently.
    fn terminate_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Reboots an instance in place.
    fn reboot_instance<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, (), Self::Error>;

    /// Fetches the instance's current state and addresses.
    fn describe_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, InstanceDescription, Self::Error>;

    /// Blocks until the provider reports the instance running. Long-poll,
    /// retry, and backoff semantics belong to the implementation.
    fn wait_until_running<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Registers a machine image from an instance and returns its id.
    fn create_image<'a>(
        &'a self,
        instance_id: &'a str,
        name: &'a str,
        description: &'a str,
    ) -> ProviderFuture<'a, String, Self::Error>;
}
