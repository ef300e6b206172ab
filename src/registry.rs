//! Local registry of instances the tool has created or adopted.
//!
//! The registry is a name-keyed cache of last-known connection metadata. It
//! is not a source of truth: the cloud provider's actual instance state (or
//! a generic host's actual reachability) remains authoritative, and the
//! registry is refreshed whenever a lifecycle operation observes new state.
//! Workers never mutate the registry directly; the orchestrating task applies
//! their reported results between channel receives.

use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{self, StoreError};

/// TCP port a container engine is expected to listen on.
pub const DOCKER_PORT: u16 = 2376;

/// Driver that provisioned an instance.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// Instance launched through the cloud provider API.
    Cloud,
    /// Arbitrary SSH-reachable host adopted into the registry.
    Generic,
}

/// Lifecycle state last observed for an instance.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Instance is running and network-addressable.
    Running,
    /// Instance is stopped; no connection metadata is retained.
    Stopped,
}

/// Connection and state metadata for one tracked instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Instance {
    /// Provider-assigned identifier (or the registry name for generic hosts).
    pub id: String,
    /// Driver that owns the instance's lifecycle.
    pub driver: Driver,
    /// Container engine endpoint, `host:port`, when the instance is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_host: Option<String>,
    /// Primary (public) address when the instance is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Alternative addresses, typically the private address.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_host: Vec<String>,
    /// Last observed lifecycle state.
    pub state: InstanceState,
}

impl Instance {
    /// Builds a running cloud instance record from observed addresses.
    #[must_use]
    pub fn running_cloud(id: impl Into<String>, host: impl Into<String>, alt_host: Vec<String>) -> Self {
        let address = host.into();
        Self {
            id: id.into(),
            driver: Driver::Cloud,
            docker_host: Some(docker_host_address(&address)),
            host: Some(address),
            alt_host,
            state: InstanceState::Running,
        }
    }

    /// Builds a running generic-host record adopted into the registry.
    #[must_use]
    pub fn adopted_generic(name: impl Into<String>, host: impl Into<String>, alt_host: Vec<String>) -> Self {
        let address = host.into();
        Self {
            id: name.into(),
            driver: Driver::Generic,
            docker_host: Some(docker_host_address(&address)),
            host: Some(address),
            alt_host,
            state: InstanceState::Running,
        }
    }
}

/// Formats the container engine endpoint for a host address.
#[must_use]
pub fn docker_host_address(host: &str) -> String {
    format!("{host}:{DOCKER_PORT}")
}

/// Errors raised by registry mutations.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum RegistryError {
    /// Raised when creating an instance under a name already in use.
    #[error("machine {name} already exists")]
    DuplicateName {
        /// Registry name that collided.
        name: String,
    },
    /// Raised when an operation targets a name the registry does not hold.
    #[error("machine {name} not found")]
    UnknownInstance {
        /// Registry name that was looked up.
        name: String,
    },
}

/// Name-keyed mapping of every instance the tool tracks.
///
/// Serialises as a flat JSON object from name to instance record, matching
/// the persisted registry document layout.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct InstanceRegistry {
    instances: BTreeMap<String, Instance>,
}

impl InstanceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            instances: BTreeMap::new(),
        }
    }

    /// Loads the registry document; a missing or empty file is an empty
    /// registry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the document exists but cannot be read or
    /// parsed.
    pub fn load(path: &Utf8Path) -> Result<Self, StoreError> {
        store::load_document(path)
    }

    /// Atomically rewrites the registry document with the in-memory contents.
    ///
    /// Callers invoke this after every mutating operation, including on
    /// early-return error paths, so partial progress survives.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the document cannot be written.
    pub fn dump(&self, path: &Utf8Path) -> Result<(), StoreError> {
        store::dump_document(path, self)
    }

    /// Returns the instance registered under `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Instance> {
        self.instances.get(name)
    }

    /// Returns `true` when `name` is already registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    /// Number of tracked instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns `true` when the registry tracks nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Iterates over `(name, instance)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Instance)> {
        self.instances.iter()
    }

    /// Registers a new instance under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateName`] when the name is taken;
    /// existing records are never overwritten.
    pub fn insert(&mut self, name: impl Into<String>, instance: Instance) -> Result<(), RegistryError> {
        let key = name.into();
        if self.instances.contains_key(&key) {
            return Err(RegistryError::DuplicateName { name: key });
        }
        self.instances.insert(key, instance);
        Ok(())
    }

    /// Removes and returns the instance registered under `name`.
    pub fn remove(&mut self, name: &str) -> Option<Instance> {
        self.instances.remove(name)
    }

    /// Records that the named instance is running at the given addresses.
    ///
    /// Reinstates the running-state invariant: a running instance always has
    /// a host and a derived container engine endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownInstance`] when `name` is not
    /// registered.
    pub fn mark_running(
        &mut self,
        name: &str,
        host: impl Into<String>,
        alt_host: Vec<String>,
    ) -> Result<(), RegistryError> {
        let instance = self
            .instances
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownInstance {
                name: name.to_owned(),
            })?;
        let address = host.into();
        instance.docker_host = Some(docker_host_address(&address));
        instance.host = Some(address);
        instance.alt_host = alt_host;
        instance.state = InstanceState::Running;
        Ok(())
    }

    /// Records that the named instance is stopped, clearing all connection
    /// metadata per the stopped-state invariant.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownInstance`] when `name` is not
    /// registered.
    pub fn mark_stopped(&mut self, name: &str) -> Result<(), RegistryError> {
        let instance = self
            .instances
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownInstance {
                name: name.to_owned(),
            })?;
        instance.docker_host = None;
        instance.host = None;
        instance.alt_host = Vec::new();
        instance.state = InstanceState::Stopped;
        Ok(())
    }
}
