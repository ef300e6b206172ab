//! Translates a host profile plus user overrides into a concrete provider
//! launch request.
//!
//! The builder fails fast on any mandatory field with neither an override nor
//! a profile fallback, and degrades gracefully on data errors: malformed tags
//! and non-positive volume sizes are dropped with a warning rather than
//! aborting the launch.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::profile::{Profile, VpcProfile};

/// Fixed device name for the root volume.
pub const ROOT_DEVICE_NAME: &str = "xvda";

/// Device-name suffixes available for extra volumes; the pool is bounded by
/// the provider's device-naming limit.
const EXTRA_DEVICE_SUFFIXES: [&str; 8] = ["b", "c", "d", "e", "f", "g", "h", "i"];

const IAM_ARN_PREFIX: &str = "arn:aws:iam";

/// One block-device mapping in a launch request.
///
/// Volume type is fixed to the provider's general-purpose SSD tier and every
/// volume is deleted on termination; only the device name and size vary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockDeviceSpec {
    /// Device name, `xvda` for the root volume or `xvdb`..`xvdi` for extras.
    pub device_name: String,
    /// Volume size in GiB.
    pub size_gib: i32,
}

/// IAM role attachment, by full ARN or by bare name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IamRoleRef {
    /// Attach by full ARN.
    Arn(String),
    /// Attach by role name.
    Name(String),
}

/// One `key=value` tag applied to launched instances.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

/// Complete provider launch request; transient, never persisted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Provider instance type to request.
    pub instance_type: String,
    /// Machine image identifier.
    pub image_id: String,
    /// SSH key pair name.
    pub key_name: String,
    /// Number of instances to launch.
    pub count: i32,
    /// Root and extra block-device mappings.
    pub block_devices: Vec<BlockDeviceSpec>,
    /// Subnet the instances land in.
    pub subnet_id: String,
    /// Resolved security group identifiers.
    pub security_group_ids: Vec<String>,
    /// Optional IAM role attachment.
    pub iam_role: Option<IamRoleRef>,
    /// Tags applied to all launched instances in one batched call.
    pub tags: Vec<Tag>,
}

/// User-supplied overrides layered over a profile's defaults.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchOverrides {
    /// Explicit image identifier; wins over the profile's AMI list.
    pub image_id: Option<String>,
    /// Explicit key pair name; wins over the profile's key pair list.
    pub key_name: Option<String>,
    /// Instance type to request.
    pub instance_type: String,
    /// Number of instances to launch.
    pub count: i32,
    /// IAM role, as an ARN or a bare name; empty means no attachment.
    pub iam_role: String,
    /// Root volume size in GiB; a non-positive size omits the root mapping.
    pub root_size_gib: i32,
    /// Extra volume sizes in GiB, in device-name order.
    pub volume_sizes_gib: Vec<i32>,
    /// Explicit subnet identifier; wins over visibility-based selection.
    pub subnet_id: Option<String>,
    /// Select among the profile's private subnets instead of public ones.
    pub private_subnet: bool,
    /// Security group names resolved against the profile.
    pub security_groups: Vec<String>,
    /// Raw `key=value` tag arguments.
    pub tags: Vec<String>,
}

impl Default for LaunchOverrides {
    fn default() -> Self {
        Self {
            image_id: None,
            key_name: None,
            instance_type: String::from("t2.micro"),
            count: 1,
            iam_role: String::new(),
            root_size_gib: 16,
            volume_sizes_gib: Vec::new(),
            subnet_id: None,
            private_subnet: false,
            security_groups: Vec::new(),
            tags: Vec::new(),
        }
    }
}

/// Errors raised while building a launch request.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum LaunchError {
    /// Raised when neither an override nor the profile supplies an image.
    #[error("cannot proceed without an AMI")]
    MissingImage,
    /// Raised when neither an override nor the profile supplies a key pair.
    #[error("cannot proceed without an SSH keypair")]
    MissingKeyPair,
    /// Raised when the requested instance count is not positive.
    #[error("instance count must be at least 1, got {count}")]
    InvalidCount {
        /// Requested count.
        count: i32,
    },
    /// Raised when the profile has no subnet matching the requested
    /// visibility.
    #[error("profile has no {visibility} subnet to launch into")]
    NoMatchingSubnet {
        /// Requested visibility, `public` or `private`.
        visibility: &'static str,
    },
    /// Raised when more extra volumes are requested than the device-name
    /// pool allows.
    #[error("requested {requested} extra volumes but only {available} device names are available")]
    DeviceNamesExhausted {
        /// Number of usable volumes requested.
        requested: usize,
        /// Size of the device-name pool.
        available: usize,
    },
}

/// Builds a complete [`LaunchRequest`] from a profile and user overrides.
///
/// # Errors
///
/// Returns [`LaunchError`] when a mandatory field has neither an override nor
/// a profile fallback, when the subnet candidate set is empty, or when the
/// extra-volume device-name pool is exhausted.
pub fn build_launch_request(
    profile: &Profile,
    overrides: &LaunchOverrides,
) -> Result<LaunchRequest, LaunchError> {
    if overrides.count < 1 {
        return Err(LaunchError::InvalidCount {
            count: overrides.count,
        });
    }

    let image_id = resolve_image(profile, overrides)?;
    let key_name = resolve_key_pair(profile, overrides)?;
    let block_devices = block_device_mappings(overrides.root_size_gib, &overrides.volume_sizes_gib)?;
    let subnet_id = match overrides.subnet_id.as_deref() {
        Some(id) if !id.is_empty() => id.to_owned(),
        _ => select_subnet(&profile.vpc, !overrides.private_subnet)?,
    };

    Ok(LaunchRequest {
        instance_type: overrides.instance_type.clone(),
        image_id,
        key_name,
        count: overrides.count,
        block_devices,
        subnet_id,
        security_group_ids: resolve_security_groups(&profile.vpc, &overrides.security_groups),
        iam_role: iam_role_reference(&overrides.iam_role),
        tags: parse_tags(&overrides.tags),
    })
}

fn resolve_image(profile: &Profile, overrides: &LaunchOverrides) -> Result<String, LaunchError> {
    if let Some(id) = overrides.image_id.as_deref()
        && !id.is_empty()
    {
        return Ok(id.to_owned());
    }
    profile
        .amis
        .first()
        .map(|ami| ami.id.clone())
        .ok_or(LaunchError::MissingImage)
}

fn resolve_key_pair(profile: &Profile, overrides: &LaunchOverrides) -> Result<String, LaunchError> {
    if let Some(name) = overrides.key_name.as_deref()
        && !name.is_empty()
    {
        return Ok(name.to_owned());
    }
    profile
        .key_pairs
        .first()
        .map(|key| key.name.clone())
        .ok_or(LaunchError::MissingKeyPair)
}

/// Assembles the root mapping (when requested) followed by extra volumes on
/// sequential device-name suffixes.
fn block_device_mappings(
    root_size_gib: i32,
    volume_sizes_gib: &[i32],
) -> Result<Vec<BlockDeviceSpec>, LaunchError> {
    let mut mappings = Vec::new();
    if root_size_gib > 0 {
        mappings.push(BlockDeviceSpec {
            device_name: String::from(ROOT_DEVICE_NAME),
            size_gib: root_size_gib,
        });
    }

    let mut suffixes = EXTRA_DEVICE_SUFFIXES.iter();
    for &size_gib in volume_sizes_gib {
        if size_gib <= 0 {
            warn!(size_gib, "skipping extra volume with non-positive size");
            continue;
        }
        let suffix = suffixes
            .next()
            .ok_or_else(|| LaunchError::DeviceNamesExhausted {
                requested: volume_sizes_gib.iter().filter(|&&size| size > 0).count(),
                available: EXTRA_DEVICE_SUFFIXES.len(),
            })?;
        mappings.push(BlockDeviceSpec {
            device_name: format!("xvd{suffix}"),
            size_gib,
        });
    }
    Ok(mappings)
}

/// Selects uniformly at random among the profile's subnets matching the
/// requested visibility.
///
/// The candidate set is validated non-empty before selection, so an empty
/// profile fails loudly rather than panicking on a random index.
fn select_subnet(vpc: &VpcProfile, public: bool) -> Result<String, LaunchError> {
    let candidates: Vec<&str> = vpc
        .subnets
        .iter()
        .filter(|subnet| subnet.public == public)
        .map(|subnet| subnet.id.as_str())
        .collect();

    let visibility = if public { "public" } else { "private" };
    candidates
        .choose(&mut rand::thread_rng())
        .map(|&id| id.to_owned())
        .ok_or(LaunchError::NoMatchingSubnet { visibility })
}

/// Resolves requested group names to ids by exact match within the profile.
///
/// A name may match more than one group. Names with no match are omitted
/// from the result set with a warning; resolution never fails the launch.
fn resolve_security_groups(vpc: &VpcProfile, names: &[String]) -> Vec<String> {
    let mut ids = Vec::new();
    for name in names {
        let mut matched = false;
        for group in &vpc.security_groups {
            if group.name == *name {
                ids.push(group.id.clone());
                matched = true;
            }
        }
        if !matched {
            warn!(group = %name, "security group not found in profile; omitting");
        }
    }
    ids
}

fn iam_role_reference(iam_role: &str) -> Option<IamRoleRef> {
    if iam_role.starts_with(IAM_ARN_PREFIX) {
        Some(IamRoleRef::Arn(iam_role.to_owned()))
    } else if iam_role.is_empty() {
        None
    } else {
        Some(IamRoleRef::Name(iam_role.to_owned()))
    }
}

/// Parses `key=value` tag arguments, dropping malformed entries with a
/// warning.
///
/// An entry is well-formed when it contains exactly one `=` separating a
/// non-empty key from its value.
#[must_use]
pub fn parse_tags(specs: &[String]) -> Vec<Tag> {
    let mut tags = Vec::new();
    for spec in specs {
        let mut parts = spec.split('=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) if !key.is_empty() => {
                tags.push(Tag {
                    key: key.to_owned(),
                    value: value.to_owned(),
                });
            }
            _ => warn!(tag = %spec, "skipping malformed tag; expected key=value"),
        }
    }
    tags
}
