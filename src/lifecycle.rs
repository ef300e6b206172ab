//! Lifecycle drivers that apply provisioning and power-state results to the
//! registry.
//!
//! These functions own the shared-registry policy: readiness monitors and
//! remote tasks report over channels, and only the driver mutates the
//! registry, between receives. Callers persist the registry after every
//! driver call, including when the call returned an error, so partial
//! progress is never lost.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::launch::{self, LaunchError, LaunchOverrides};
use crate::profile::Profile;
use crate::provider::CloudProvider;
use crate::provision::{ProvisionError, Provisioner, ReadinessError};
use crate::registry::{Driver, Instance, InstanceRegistry, RegistryError};

/// Errors raised by lifecycle drivers.
#[derive(Debug, Error)]
pub enum LifecycleError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the launch request cannot be built.
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// Raised when a registry mutation is rejected.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Raised when launch submission or batch tagging fails.
    #[error("provisioning failed: {0}")]
    Provision(#[source] ProvisionError<E>),
    /// Raised when a provider power-state call fails; fatal for the batch.
    #[error("provider call failed for {name}: {source}")]
    Provider {
        /// Registry name of the instance the call targeted.
        name: String,
        /// Provider error.
        #[source]
        source: E,
    },
}

/// Result of a create operation over a batch of instances.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CreateSummary {
    /// Registry names recorded as running.
    pub ready: Vec<String>,
    /// Per-instance readiness failures, tagged with the provider id.
    pub failed: Vec<ReadinessError>,
}

/// Derives registry names for a launch batch: the bare name for a single
/// instance, `name-1`..`name-N` otherwise.
fn batch_names(name: &str, count: i32) -> Vec<String> {
    if count <= 1 {
        return vec![name.to_owned()];
    }
    (1..=count).map(|index| format!("{name}-{index}")).collect()
}

/// Launches instances from a profile and records each one in the registry as
/// it becomes ready.
///
/// Every target name is checked against the registry before any provider
/// call is made. Readiness outcomes are consumed incrementally; a failed
/// instance is reported in the summary while its siblings are still
/// recorded.
///
/// # Errors
///
/// Returns [`LifecycleError::Registry`] when a target name already exists,
/// [`LifecycleError::Launch`] when the request cannot be built, and
/// [`LifecycleError::Provision`] when submission or tagging fails.
pub async fn create_instances<P>(
    provider: &Arc<P>,
    registry: &mut InstanceRegistry,
    profile: &Profile,
    overrides: &LaunchOverrides,
    name: &str,
) -> Result<CreateSummary, LifecycleError<P::Error>>
where
    P: CloudProvider + 'static,
{
    let names = batch_names(name, overrides.count);
    for candidate in &names {
        if registry.contains(candidate) {
            return Err(RegistryError::DuplicateName {
                name: candidate.clone(),
            }
            .into());
        }
    }

    let request = launch::build_launch_request(profile, overrides)?;
    let provisioner = Provisioner::new(Arc::clone(provider));
    let mut stream = provisioner
        .launch_all(&request)
        .await
        .map_err(LifecycleError::Provision)?;

    let mut free_names = names.into_iter();
    let mut summary = CreateSummary::default();
    while let Some(outcome) = stream.next().await {
        match outcome {
            Ok(ready) => {
                let Some(instance_name) = free_names.next() else {
                    warn!(instance_id = %ready.instance_id, "more instances than names; skipping");
                    continue;
                };
                registry.insert(
                    instance_name.clone(),
                    Instance::running_cloud(
                        ready.instance_id,
                        ready.public_address,
                        vec![ready.private_address],
                    ),
                )?;
                info!(name = %instance_name, "machine is ready");
                summary.ready.push(instance_name);
            }
            Err(err) => {
                warn!(instance_id = %err.instance_id, error = %err, "instance failed to become ready");
                summary.failed.push(err);
            }
        }
    }
    Ok(summary)
}

/// Looks up a cloud instance for a power-state operation, warning and
/// returning `None` for names that should be skipped.
fn cloud_instance<'r>(registry: &'r InstanceRegistry, name: &str) -> Option<&'r Instance> {
    let Some(instance) = registry.get(name) else {
        warn!(name, "target machine not found");
        return None;
    };
    if instance.driver != Driver::Cloud {
        warn!(name, "target machine is not provider-managed; skipping");
        return None;
    }
    Some(instance)
}

/// Starts each named instance and waits for it to become reachable again.
///
/// Unknown names and non-cloud instances are skipped with a warning. A
/// provider start failure is fatal for the batch; a readiness failure is
/// scoped to its instance and leaves the record stopped.
///
/// # Errors
///
/// Returns [`LifecycleError::Provider`] when the provider rejects a start
/// call.
pub async fn start_instances<P>(
    provider: &Arc<P>,
    registry: &mut InstanceRegistry,
    names: &[String],
) -> Result<(), LifecycleError<P::Error>>
where
    P: CloudProvider + 'static,
{
    let provisioner = Provisioner::new(Arc::clone(provider));
    for name in names {
        let Some(instance) = cloud_instance(registry, name) else {
            continue;
        };
        let instance_id = instance.id.clone();

        provider
            .start_instance(&instance_id)
            .await
            .map_err(|source| LifecycleError::Provider {
                name: name.clone(),
                source,
            })?;

        match provisioner.wait_ready(&instance_id).await {
            Ok(ready) => {
                registry.mark_running(name, ready.public_address, vec![ready.private_address])?;
                info!(name, "machine started");
            }
            Err(err) => {
                warn!(name, error = %err, "target machine failed to launch");
            }
        }
    }
    Ok(())
}

/// Stops each named instance and clears its connection metadata.
///
/// # Errors
///
/// Returns [`LifecycleError::Provider`] when the provider rejects a stop
/// call.
pub async fn stop_instances<P>(
    provider: &Arc<P>,
    registry: &mut InstanceRegistry,
    names: &[String],
) -> Result<(), LifecycleError<P::Error>>
where
    P: CloudProvider + 'static,
{
    for name in names {
        let Some(instance) = cloud_instance(registry, name) else {
            continue;
        };
        let instance_id = instance.id.clone();

        provider
            .stop_instance(&instance_id)
            .await
            .map_err(|source| LifecycleError::Provider {
                name: name.clone(),
                source,
            })?;

        registry.mark_stopped(name)?;
        info!(name, "machine stopped");
    }
    Ok(())
}

/// Terminates each named instance and drops it from the registry.
///
/// Generic (adopted) hosts are simply dropped; there is nothing to
/// terminate.
///
/// # Errors
///
/// Returns [`LifecycleError::Provider`] when the provider rejects a
/// terminate call.
pub async fn remove_instances<P>(
    provider: &Arc<P>,
    registry: &mut InstanceRegistry,
    names: &[String],
) -> Result<(), LifecycleError<P::Error>>
where
    P: CloudProvider + 'static,
{
    for name in names {
        let Some(instance) = registry.get(name) else {
            warn!(name, "target machine not found");
            continue;
        };

        if instance.driver == Driver::Cloud {
            let instance_id = instance.id.clone();
            provider
                .terminate_instance(&instance_id)
                .await
                .map_err(|source| LifecycleError::Provider {
                    name: name.clone(),
                    source,
                })?;
        }

        registry.remove(name);
        info!(name, "machine removed");
    }
    Ok(())
}

/// Reboots each named instance in place; the registry record is unchanged.
///
/// # Errors
///
/// Returns [`LifecycleError::Provider`] when the provider rejects a reboot
/// call.
pub async fn reboot_instances<P>(
    provider: &Arc<P>,
    registry: &InstanceRegistry,
    names: &[String],
) -> Result<(), LifecycleError<P::Error>>
where
    P: CloudProvider + 'static,
{
    for name in names {
        let Some(instance) = cloud_instance(registry, name) else {
            continue;
        };

        provider
            .reboot_instance(&instance.id)
            .await
            .map_err(|source| LifecycleError::Provider {
                name: name.clone(),
                source,
            })?;
        info!(name, "machine rebooted");
    }
    Ok(())
}

/// Registers a machine image from an instance and returns the new image id.
///
/// # Errors
///
/// Returns the provider's error when image registration fails.
pub async fn register_image<P>(
    provider: &Arc<P>,
    instance_id: &str,
    name: &str,
    description: &str,
) -> Result<String, P::Error>
where
    P: CloudProvider + 'static,
{
    let image_id = provider.create_image(instance_id, name, description).await?;
    info!(instance_id, image_id = %image_id, "image registered");
    Ok(image_id)
}

/// Adopts an SSH-reachable host into the registry under the generic driver.
///
/// # Errors
///
/// Returns [`RegistryError::DuplicateName`] when the name is taken.
pub fn adopt_generic_host(
    registry: &mut InstanceRegistry,
    name: &str,
    host: &str,
    alt_hosts: Vec<String>,
) -> Result<(), RegistryError> {
    registry.insert(name, Instance::adopted_generic(name, host, alt_hosts))?;
    info!(name, host, "machine adopted");
    Ok(())
}
