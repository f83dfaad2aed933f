//! Remote command execution over SSH.
//!
//! [`RemoteShell`] is the seam the controllers depend on. [`SshShell`] is the
//! production implementation, shelling out to the system `ssh` client
//! through a [`CommandRunner`].

use std::ffi::OsString;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use shell_escape::unix::escape;
use thiserror::Error;

use crate::config::ShellConfig;

mod types;
mod util;

pub use types::{CommandOutput, CommandRunner, ProcessCommandRunner, RemoteCommandOutput};
pub use util::expand_tilde;

/// Port used when a shell does not configure one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Future returned by remote shell operations.
pub type ShellFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ShellError>> + Send + 'a>>;

/// Errors surfaced while executing remote commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ShellError {
    /// Raised when configuration is missing required values.
    #[error("invalid shell configuration: {field}")]
    InvalidConfig {
        /// Field that failed validation.
        field: String,
    },
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a checked remote command exits unsuccessfully.
    #[error("remote command `{command}` exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command that was run.
        command: String,
        /// Exit status reported by the session.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Captured standard error.
        stderr: String,
    },
}

/// Where and as whom to run remote commands.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShellTarget {
    /// Public address of the instance.
    pub host: IpAddr,
    /// SSH port.
    pub port: u16,
    /// Remote login.
    pub user: String,
}

/// Remote command execution contract.
pub trait RemoteShell: Send + Sync {
    /// Builds the target for `user` on `host`.
    fn target(&self, host: IpAddr, user: &str) -> ShellTarget {
        ShellTarget {
            host,
            port: DEFAULT_SSH_PORT,
            user: user.to_owned(),
        }
    }

    /// Runs `command` as the target user.
    fn run<'a>(
        &'a self,
        target: &'a ShellTarget,
        command: &'a str,
    ) -> ShellFuture<'a, RemoteCommandOutput>;

    /// Runs `command` with elevated privileges.
    fn sudo<'a>(
        &'a self,
        target: &'a ShellTarget,
        command: &'a str,
    ) -> ShellFuture<'a, RemoteCommandOutput> {
        Box::pin(async move {
            let elevated = format!("sudo sh -c {}", escape(command.into()));
            self.run(target, &elevated).await
        })
    }
}

impl<S: RemoteShell + ?Sized> RemoteShell for Arc<S> {
    fn target(&self, host: IpAddr, user: &str) -> ShellTarget {
        (**self).target(host, user)
    }

    fn run<'a>(
        &'a self,
        target: &'a ShellTarget,
        command: &'a str,
    ) -> ShellFuture<'a, RemoteCommandOutput> {
        (**self).run(target, command)
    }

    fn sudo<'a>(
        &'a self,
        target: &'a ShellTarget,
        command: &'a str,
    ) -> ShellFuture<'a, RemoteCommandOutput> {
        (**self).sudo(target, command)
    }
}

/// A shell bound to one target.
#[derive(Debug)]
pub struct Session<'a, S: RemoteShell + ?Sized> {
    shell: &'a S,
    target: ShellTarget,
}

impl<'a, S: RemoteShell + ?Sized> Session<'a, S> {
    /// Binds `shell` to `target`.
    #[must_use]
    pub const fn new(shell: &'a S, target: ShellTarget) -> Self {
        Self { shell, target }
    }

    /// Returns the bound target.
    #[must_use]
    pub const fn target(&self) -> &ShellTarget {
        &self.target
    }

    /// Runs `command` and returns its output regardless of exit status.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError`] when the command cannot be issued.
    pub async fn run(&self, command: &str) -> Result<RemoteCommandOutput, ShellError> {
        self.shell.run(&self.target, command).await
    }

    /// Runs `command` with elevated privileges, failing on non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::CommandFailure`] when the command exits
    /// unsuccessfully.
    pub async fn sudo(&self, command: &str) -> Result<RemoteCommandOutput, ShellError> {
        let output = self.shell.sudo(&self.target, command).await?;
        check(command, output)
    }
}

fn check(command: &str, output: RemoteCommandOutput) -> Result<RemoteCommandOutput, ShellError> {
    if output.is_success() {
        return Ok(output);
    }
    let status_text = output
        .exit_code
        .map_or_else(|| String::from("unknown"), |code| code.to_string());
    Err(ShellError::CommandFailure {
        command: command.to_owned(),
        status: output.exit_code,
        status_text,
        stderr: output.stderr,
    })
}

/// Remote shell backed by the system `ssh` client.
#[derive(Clone, Debug)]
pub struct SshShell<R: CommandRunner> {
    config: ShellConfig,
    runner: Arc<R>,
}

impl SshShell<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: ShellConfig) -> Result<Self, ShellError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner + 'static> SshShell<R> {
    /// Creates a shell using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ShellError::InvalidConfig`] when validation fails.
    pub fn new(config: ShellConfig, runner: R) -> Result<Self, ShellError> {
        config.validate().map_err(|err| ShellError::InvalidConfig {
            field: err.to_string(),
        })?;
        Ok(Self {
            config,
            runner: Arc::new(runner),
        })
    }

    /// Returns the underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &ShellConfig {
        &self.config
    }

    fn build_ssh_args(&self, target: &ShellTarget, command: &str) -> Vec<OsString> {
        let mut args = vec![OsString::from("-p"), OsString::from(target.port.to_string())];

        if let Some(ref identity_file) = self.config.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.config.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.known_hosts_file
            )));
        }

        args.push(OsString::from(format!("{}@{}", target.user, target.host)));
        args.push(OsString::from(command));
        args
    }
}

impl<R: CommandRunner + 'static> RemoteShell for SshShell<R> {
    fn target(&self, host: IpAddr, user: &str) -> ShellTarget {
        ShellTarget {
            host,
            port: self.config.port,
            user: user.to_owned(),
        }
    }

    fn run<'a>(
        &'a self,
        target: &'a ShellTarget,
        command: &'a str,
    ) -> ShellFuture<'a, RemoteCommandOutput> {
        Box::pin(async move {
            let args = self.build_ssh_args(target, command);
            let program = self.config.ssh_bin.clone();
            let runner = Arc::clone(&self.runner);
            let output = tokio::task::spawn_blocking(move || runner.run(&program, &args))
                .await
                .map_err(|err| ShellError::Spawn {
                    program: self.config.ssh_bin.clone(),
                    message: err.to_string(),
                })??;

            Ok(RemoteCommandOutput {
                exit_code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        })
    }
}

#[cfg(test)]
mod tests;
