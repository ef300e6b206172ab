//! Host profiles: per-region network, image, and credential defaults synced
//! from the cloud provider.
//!
//! Profiles are pure data. The store keys them by `(region, name)` and a
//! launch must name a profile that exists for its declared region; there is
//! no implicit fallback profile.

use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{self, StoreError};

/// One subnet within a profile's VPC.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SubnetProfile {
    /// Provider subnet identifier.
    pub id: String,
    /// Availability zone the subnet lives in.
    #[serde(default)]
    pub availability_zone: String,
    /// CIDR block assigned to the subnet.
    #[serde(default)]
    pub cidr: String,
    /// Whether the subnet is the default for its availability zone.
    #[serde(default)]
    pub default_for_az: bool,
    /// Whether instances in this subnet receive public addresses.
    #[serde(default)]
    pub public: bool,
}

/// Security group name-to-id mapping; resolved by name at launch time.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SecurityGroup {
    /// Provider security group identifier.
    pub id: String,
    /// Group name used for launch-time resolution.
    pub name: String,
    /// Free-form description, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Network topology for a profile's VPC.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VpcProfile {
    /// Provider VPC identifier.
    pub id: String,
    /// CIDR block assigned to the VPC.
    #[serde(default)]
    pub cidr: String,
    /// Subnets available for launches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<SubnetProfile>,
    /// Security groups available for launches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_groups: Vec<SecurityGroup>,
}

/// Machine image recorded in a profile.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AmiProfile {
    /// Provider image identifier.
    pub id: String,
    /// Image name, if known.
    #[serde(default)]
    pub name: String,
    /// CPU architecture the image targets.
    #[serde(default)]
    pub arch: String,
    /// Free-form description, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// SSH key pair recorded in a profile.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyPair {
    /// Key pair name as registered with the provider.
    pub name: String,
    /// Fingerprint digest, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// A named bundle of network, image, and credential defaults for one region.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Profile {
    /// Profile name; unique within a region.
    pub name: String,
    /// Region the profile was synced from.
    pub region: String,
    /// Provider account identifier.
    #[serde(default)]
    pub account_id: String,
    /// VPC topology for launches.
    pub vpc: VpcProfile,
    /// Key pairs available for launches; the first is the fallback.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_pairs: Vec<KeyPair>,
    /// Machine images available for launches; the first is the fallback.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub amis: Vec<AmiProfile>,
}

/// Errors raised by profile lookups.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ProfileError {
    /// Raised when no profile exists for the requested region and name.
    #[error("no profile named {name} synced for region {region}")]
    UnknownProfile {
        /// Region the launch declared.
        region: String,
        /// Profile name the launch declared.
        name: String,
    },
}

/// Region-then-name keyed store of synced profiles.
///
/// Serialises as a nested JSON object `region -> name -> profile`, matching
/// the persisted profile document layout.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ProfileStore {
    regions: BTreeMap<String, BTreeMap<String, Profile>>,
}

impl ProfileStore {
    /// Creates an empty store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    /// Loads the profile document; a missing or empty file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the document exists but cannot be read or
    /// parsed.
    pub fn load(path: &Utf8Path) -> Result<Self, StoreError> {
        store::load_document(path)
    }

    /// Atomically rewrites the profile document with the in-memory contents.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the document cannot be written.
    pub fn dump(&self, path: &Utf8Path) -> Result<(), StoreError> {
        store::dump_document(path, self)
    }

    /// Returns the profile for `(region, name)`; an unmatched profile is a
    /// hard failure, never a default.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError::UnknownProfile`] when the pair is not present.
    pub fn lookup(&self, region: &str, name: &str) -> Result<&Profile, ProfileError> {
        self.regions
            .get(region)
            .and_then(|profiles| profiles.get(name))
            .ok_or_else(|| ProfileError::UnknownProfile {
                region: region.to_owned(),
                name: name.to_owned(),
            })
    }

    /// Inserts or replaces a profile under its own `(region, name)` key.
    pub fn upsert(&mut self, profile: Profile) {
        self.regions
            .entry(profile.region.clone())
            .or_default()
            .insert(profile.name.clone(), profile);
    }

    /// Returns `true` when no profiles are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    use super::*;

    fn profile_path(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().join("profiles.json"))
            .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()))
    }

    fn sample_profile() -> Profile {
        Profile {
            name: String::from("default"),
            region: String::from("us-east-1"),
            account_id: String::from("123456789012"),
            vpc: VpcProfile {
                id: String::from("vpc-1"),
                cidr: String::from("10.0.0.0/16"),
                subnets: vec![SubnetProfile {
                    id: String::from("subnet-1"),
                    availability_zone: String::from("us-east-1a"),
                    cidr: String::from("10.0.1.0/24"),
                    default_for_az: true,
                    public: true,
                }],
                security_groups: vec![SecurityGroup {
                    id: String::from("sg-1"),
                    name: String::from("default"),
                    description: None,
                }],
            },
            key_pairs: vec![KeyPair {
                name: String::from("ops"),
                digest: None,
            }],
            amis: vec![AmiProfile {
                id: String::from("ami-1"),
                name: String::from("base"),
                arch: String::from("x86_64"),
                description: None,
            }],
        }
    }

    #[test]
    fn load_missing_document_is_empty_store() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));

        let profiles =
            ProfileStore::load(&profile_path(&tmp)).unwrap_or_else(|err| panic!("load: {err}"));

        assert!(profiles.is_empty());
    }

    #[test]
    fn dump_then_load_round_trips() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = profile_path(&tmp);
        let mut profiles = ProfileStore::new();
        profiles.upsert(sample_profile());

        profiles.dump(&path).unwrap_or_else(|err| panic!("dump: {err}"));
        let reloaded = ProfileStore::load(&path).unwrap_or_else(|err| panic!("load: {err}"));

        assert_eq!(reloaded, profiles);
    }

    #[test]
    fn lookup_finds_profile_by_region_and_name() {
        let mut profiles = ProfileStore::new();
        profiles.upsert(sample_profile());

        let found = profiles
            .lookup("us-east-1", "default")
            .unwrap_or_else(|err| panic!("lookup: {err}"));

        assert_eq!(found.vpc.id, "vpc-1");
    }

    #[test]
    fn lookup_unknown_region_is_hard_failure() {
        let mut profiles = ProfileStore::new();
        profiles.upsert(sample_profile());

        let err = profiles
            .lookup("eu-west-1", "default")
            .expect_err("unsynced region should fail");

        assert_eq!(
            err,
            ProfileError::UnknownProfile {
                region: String::from("eu-west-1"),
                name: String::from("default"),
            }
        );
    }

    #[test]
    fn lookup_unknown_name_is_hard_failure() {
        let mut profiles = ProfileStore::new();
        profiles.upsert(sample_profile());

        assert!(profiles.lookup("us-east-1", "staging").is_err());
    }
}
