//! Per-name launch templates.
//!
//! Templates are TOML files in a single directory: `<name>.toml` when one
//! exists for the machine, otherwise `default.toml`. Fields left unset fall
//! back to [`LaunchDefaults`] from the provider configuration.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::toml;
use serde::Deserialize;
use thiserror::Error;

use crate::provider::LaunchSpec;
use crate::remote::expand_tilde;

/// File consulted when no per-name template exists.
pub const DEFAULT_TEMPLATE: &str = "default.toml";

/// Errors raised while loading launch templates.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SpecError {
    /// Raised when a name cannot be used as a file stem.
    #[error("'{name}' is not a valid template name")]
    InvalidName {
        /// Rejected name.
        name: String,
    },
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a template is not valid TOML or has unknown keys.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Launch parameters read from a template. Unset fields use the defaults.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SpecTemplate {
    /// Image label or identifier.
    pub image: Option<String>,
    /// Instance class.
    pub instance_type: Option<String>,
    /// Placement zone.
    pub zone: Option<String>,
    /// CPU architecture.
    pub architecture: Option<String>,
    /// Root disk size in gigabytes.
    pub disk_size_gb: Option<u64>,
    /// Security group reference.
    pub security_group: Option<String>,
    /// Remote login.
    pub user: Option<String>,
}

/// Values used where a template is silent.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaunchDefaults {
    /// Image label or identifier.
    pub image: String,
    /// Instance class.
    pub instance_type: String,
    /// Placement zone.
    pub zone: String,
    /// Project used for billing.
    pub project_id: String,
    /// CPU architecture.
    pub architecture: String,
    /// Security group reference.
    pub security_group: Option<String>,
    /// Remote login.
    pub user: String,
}

impl SpecTemplate {
    /// Layers the template over `defaults` for the machine `name`.
    #[must_use]
    pub fn layer(&self, defaults: &LaunchDefaults, name: &str) -> LaunchSpec {
        let pick = |value: Option<&String>, fallback: &str| {
            value.map_or_else(|| fallback.to_owned(), Clone::clone)
        };
        LaunchSpec {
            name: name.to_owned(),
            image: pick(self.image.as_ref(), &defaults.image),
            instance_type: pick(self.instance_type.as_ref(), &defaults.instance_type),
            zone: pick(self.zone.as_ref(), &defaults.zone),
            project_id: defaults.project_id.clone(),
            architecture: pick(self.architecture.as_ref(), &defaults.architecture),
            disk_size_gb: self.disk_size_gb,
            security_group: self
                .security_group
                .clone()
                .or_else(|| defaults.security_group.clone()),
            user: pick(self.user.as_ref(), &defaults.user),
        }
    }
}

/// Source of launch templates keyed by machine name.
pub trait SpecSource: Send + Sync {
    /// Loads the template for `name`, falling back to the default template.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError`] when a template exists but cannot be read.
    fn load(&self, name: &str) -> Result<SpecTemplate, SpecError>;
}

/// Templates stored as TOML files in one directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpecStore {
    dir: Utf8PathBuf,
}

impl SpecStore {
    /// Creates a store over `dir`. A leading `~/` is expanded.
    #[must_use]
    pub fn new(dir: &str) -> Self {
        Self {
            dir: Utf8PathBuf::from(expand_tilde(dir)),
        }
    }

    /// Directory the store reads from.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn open_dir(&self) -> Result<Option<Dir>, SpecError> {
        match Dir::open_ambient_dir(&self.dir, ambient_authority()) {
            Ok(dir) => Ok(Some(dir)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SpecError::Io {
                path: self.dir.clone(),
                message: err.to_string(),
            }),
        }
    }

    fn read(&self, dir: &Dir, file_name: &str) -> Result<Option<SpecTemplate>, SpecError> {
        let path = self.dir.join(file_name);
        let exists = dir.try_exists(file_name).map_err(|err| SpecError::Io {
            path: path.clone(),
            message: err.to_string(),
        })?;
        if !exists {
            return Ok(None);
        }
        let contents = dir
            .read_to_string(file_name)
            .map_err(|err| SpecError::Io {
                path: path.clone(),
                message: err.to_string(),
            })?;
        toml::from_str(&contents)
            .map(Some)
            .map_err(|err| SpecError::Parse {
                path,
                message: err.to_string(),
            })
    }
}

fn validate_name(name: &str) -> Result<(), SpecError> {
    let invalid = name.trim().is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if invalid {
        return Err(SpecError::InvalidName {
            name: name.to_owned(),
        });
    }
    Ok(())
}

impl SpecSource for SpecStore {
    fn load(&self, name: &str) -> Result<SpecTemplate, SpecError> {
        validate_name(name)?;
        let Some(dir) = self.open_dir()? else {
            tracing::debug!(dir = %self.dir, "template directory missing; using defaults");
            return Ok(SpecTemplate::default());
        };
        if let Some(template) = self.read(&dir, &format!("{name}.toml"))? {
            tracing::debug!(name, "loaded per-name template");
            return Ok(template);
        }
        Ok(self.read(&dir, DEFAULT_TEMPLATE)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests;
