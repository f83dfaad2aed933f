//! Configuration loading via `ortho-config`.
//!
//! Three layered structs cover the provider credentials, the lifecycle
//! tunables, and the remote shell. Each merges defaults, `spotkeep.toml`
//! discovery, and environment variables.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::spec_store::LaunchDefaults;
use crate::spot::SaveOrdering;
use crate::wait::Waiter;

/// Default remote login for new instances.
pub const DEFAULT_USER: &str = "root";

/// Scaleway specific configuration derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SCW",
    discovery(
        app_name = "spotkeep",
        env_var = "SPOTKEEP_CONFIG_PATH",
        config_file_name = "spotkeep.toml",
        dotfile_name = ".spotkeep.toml",
        project_file_name = "spotkeep.toml"
    )
)]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: String,
    /// Preferred availability zone. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type used when neither a template nor the operator picks one.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Image label or identifier used when no saved image exists for a name.
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the correct image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
    /// Security group applied to new instances.
    pub default_security_group: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in spotkeep.toml",
            metadata.description, metadata.env_var, metadata.toml_key, metadata.section
        )));
    }
    Ok(())
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("spotkeep")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.secret_key,
                FieldMetadata::new(
                    "Scaleway API secret key",
                    "SCW_SECRET_KEY",
                    "secret_key",
                    "scaleway",
                ),
            ),
            (
                &self.default_project_id,
                FieldMetadata::new(
                    "Scaleway project ID",
                    "SCW_DEFAULT_PROJECT_ID",
                    "default_project_id",
                    "scaleway",
                ),
            ),
            (
                &self.default_zone,
                FieldMetadata::new(
                    "availability zone",
                    "SCW_DEFAULT_ZONE",
                    "default_zone",
                    "scaleway",
                ),
            ),
            (
                &self.default_instance_type,
                FieldMetadata::new(
                    "instance type",
                    "SCW_DEFAULT_INSTANCE_TYPE",
                    "default_instance_type",
                    "scaleway",
                ),
            ),
            (
                &self.default_image,
                FieldMetadata::new("VM image", "SCW_DEFAULT_IMAGE", "default_image", "scaleway"),
            ),
            (
                &self.default_architecture,
                FieldMetadata::new(
                    "CPU architecture",
                    "SCW_DEFAULT_ARCHITECTURE",
                    "default_architecture",
                    "scaleway",
                ),
            ),
        ];
        for (value, metadata) in &required {
            require_field(value, metadata)?;
        }
        Ok(())
    }

    /// Builds the launch defaults templates are layered over.
    #[must_use]
    pub fn launch_defaults(&self, user: &str) -> LaunchDefaults {
        LaunchDefaults {
            image: self.default_image.clone(),
            instance_type: self.default_instance_type.clone(),
            zone: self.default_zone.clone(),
            project_id: self.default_project_id.clone(),
            architecture: self.default_architecture.clone(),
            security_group: self.default_security_group.clone(),
            user: user.to_owned(),
        }
    }
}

/// Tunables for waits, the interruption monitor, and saving.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SPOTKEEP",
    discovery(
        app_name = "spotkeep",
        env_var = "SPOTKEEP_CONFIG_PATH",
        config_file_name = "spotkeep.toml",
        dotfile_name = ".spotkeep.toml",
        project_file_name = "spotkeep.toml"
    )
)]
pub struct LifecycleConfig {
    /// Seconds between provider polls, shared by waiters and the monitor.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Attempt ceiling for snapshot completion. Unset polls until done.
    pub snapshot_max_attempts: Option<u32>,
    /// Attempt ceiling for image availability. Unset polls until done.
    pub image_max_attempts: Option<u32>,
    /// Consecutive failed status reads after which the monitor gives up.
    #[ortho_config(default = 12)]
    pub monitor_max_read_failures: u32,
    /// Seconds between remote shell reachability probes.
    #[ortho_config(default = 1)]
    pub shell_retry_secs: u64,
    /// Time zone applied to new instances.
    #[ortho_config(default = "Europe/London".to_owned())]
    pub timezone: String,
    /// Default save ordering: `terminate-first` or `save-first`.
    #[ortho_config(default = "terminate-first".to_owned())]
    pub save_ordering: String,
    /// Directory holding per-name launch templates.
    #[ortho_config(default = "~/.config/spotkeep/specs".to_owned())]
    pub spec_dir: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            snapshot_max_attempts: None,
            image_max_attempts: None,
            monitor_max_read_failures: 12,
            shell_retry_secs: 1,
            timezone: String::from("Europe/London"),
            save_ordering: String::from("terminate-first"),
            spec_dir: String::from("~/.config/spotkeep/specs"),
        }
    }
}

impl LifecycleConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("spotkeep")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Rejects values that would stall or misconfigure the lifecycle.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero poll interval, a blank
    /// time zone, or an unknown save ordering.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: String::from("poll_interval_secs"),
                message: String::from("must be at least one second"),
            });
        }
        require_field(
            &self.timezone,
            &FieldMetadata::new("time zone", "SPOTKEEP_TIMEZONE", "timezone", "lifecycle"),
        )?;
        self.save_ordering()?;
        Ok(())
    }

    /// Parses the configured save ordering.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the value is not recognised.
    pub fn save_ordering(&self) -> Result<SaveOrdering, ConfigError> {
        self.save_ordering
            .parse()
            .map_err(|message| ConfigError::Invalid {
                field: String::from("save_ordering"),
                message,
            })
    }

    /// Interval between provider polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Unbounded waiter for instance and disk state changes.
    #[must_use]
    pub const fn state_waiter(&self) -> Waiter {
        Waiter::new(self.poll_interval())
    }

    /// Waiter for snapshot completion.
    #[must_use]
    pub const fn snapshot_waiter(&self) -> Waiter {
        Waiter::new(self.poll_interval()).with_max_attempts(self.snapshot_max_attempts)
    }

    /// Waiter for image availability.
    #[must_use]
    pub const fn image_waiter(&self) -> Waiter {
        Waiter::new(self.poll_interval()).with_max_attempts(self.image_max_attempts)
    }

    /// Waiter for remote shell reachability.
    #[must_use]
    pub const fn shell_waiter(&self) -> Waiter {
        Waiter::new(Duration::from_secs(self.shell_retry_secs))
    }

    /// Unbounded waiter for a service endpoint on a booting instance,
    /// polling at the provider poll interval.
    #[must_use]
    pub const fn service_waiter(&self) -> Waiter {
        Waiter::new(self.poll_interval())
    }
}

/// Remote shell settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SPOTKEEP_SSH",
    discovery(
        app_name = "spotkeep",
        env_var = "SPOTKEEP_CONFIG_PATH",
        config_file_name = "spotkeep.toml",
        dotfile_name = ".spotkeep.toml",
        project_file_name = "spotkeep.toml"
    )
)]
pub struct ShellConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = DEFAULT_USER.to_owned())]
    pub user: String,
    /// Remote SSH port.
    #[ortho_config(default = 22)]
    pub port: u16,
    /// Private key used for authentication. Supports `~/` expansion.
    pub identity_file: Option<String>,
    /// Whether to force batch mode to avoid password prompts.
    #[ortho_config(default = true)]
    pub batch_mode: bool,
    /// Whether to enforce host key checking; disabled for short-lived hosts.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
}

impl ShellConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("spotkeep")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.ssh_bin,
            &FieldMetadata::new("ssh binary", "SPOTKEEP_SSH_SSH_BIN", "ssh_bin", "ssh"),
        )?;
        require_field(
            &self.user,
            &FieldMetadata::new("ssh user", "SPOTKEEP_SSH_USER", "user", "ssh"),
        )?;
        if let Some(identity) = self.identity_file.as_deref() {
            require_field(
                identity,
                &FieldMetadata::new(
                    "ssh identity file",
                    "SPOTKEEP_SSH_IDENTITY_FILE",
                    "identity_file",
                    "ssh",
                ),
            )?;
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds an unusable value.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Offending field.
        field: String,
        /// Why the value was rejected.
        message: String,
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
