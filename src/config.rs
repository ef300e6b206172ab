//! Configuration loading via `ortho-config`.
//!
//! Values merge defaults, `machina.toml`, and `MACHINA_*` environment
//! variables. The configuration carries the persisted document paths and the
//! SSH defaults used when talking to remote hosts; per-invocation launch
//! parameters arrive as CLI flags instead.

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::exec::RemoteEndpoint;
use crate::util::expand_tilde;

/// Tool-wide configuration derived from configuration files and environment
/// variables.
#[derive(Clone, Debug, Deserialize, Eq, OrthoConfig, PartialEq)]
#[ortho_config(prefix = "MACHINA")]
pub struct MachinaConfig {
    /// Path to the persisted instance registry document.
    #[ortho_config(default = "~/.machina/instances.json".to_owned())]
    pub registry_path: String,
    /// Path to the persisted host profile document.
    #[ortho_config(default = "~/.machina/profiles.json".to_owned())]
    pub profile_path: String,
    /// Remote user SSH sessions authenticate as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// TCP port remote shells connect to.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Private key used for remote authentication. Supports tilde expansion.
    /// Optional; when unset, SSH falls back to its default key locations.
    pub ssh_identity_file: Option<String>,
    /// Default provider region used when no `--region` flag is given.
    pub region: Option<String>,
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Eq, Error, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty.
    #[error("missing {field}: set MACHINA_{env_suffix} or add {field} to machina.toml", env_suffix = field.to_uppercase())]
    MissingField {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl MachinaConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("machina")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_value(&self.registry_path, "registry_path")?;
        Self::require_value(&self.profile_path, "profile_path")?;
        Self::require_value(&self.ssh_user, "ssh_user")?;
        if let Some(ref identity_file) = self.ssh_identity_file
            && identity_file.trim().is_empty()
        {
            return Err(ConfigError::MissingField {
                field: String::from("ssh_identity_file"),
            });
        }
        Ok(())
    }

    /// Registry document path with the home prefix expanded.
    #[must_use]
    pub fn registry_document_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.registry_path))
    }

    /// Profile document path with the home prefix expanded.
    #[must_use]
    pub fn profile_document_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.profile_path))
    }

    /// Builds a remote endpoint for `host` using the configured SSH defaults.
    #[must_use]
    pub fn endpoint_for(&self, host: &str) -> RemoteEndpoint {
        let endpoint = RemoteEndpoint::new(self.ssh_user.clone(), host, self.ssh_port);
        match self.ssh_identity_file {
            Some(ref identity_file) => {
                endpoint.with_identity_file(Utf8PathBuf::from(identity_file.clone()))
            }
            None => endpoint,
        }
    }

    fn require_value(value: &str, field: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: field.to_owned(),
            });
        }
        Ok(())
    }
}
