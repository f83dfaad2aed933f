//! Command-line interface definitions for the `spotkeep` binary.
//!
//! The parser structures live here so both the binary and the build script
//! can use them; the build script renders the manual page from them.

use clap::{Args, Parser};

/// Top-level CLI for the `spotkeep` binary.
#[derive(Debug, Parser)]
#[command(
    name = "spotkeep",
    about = "Run named spot instances that save themselves before they are reclaimed",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Launch a named machine, booting from its latest saved image.
    #[command(name = "launch")]
    Launch(LaunchCommand),
    /// Stop a named machine, saving its root disk unless told otherwise.
    #[command(name = "stop")]
    Stop(StopCommand),
    /// Terminate a named machine without saving it.
    #[command(name = "terminate")]
    Terminate(TerminateCommand),
    /// Attach a reserved public address to a named machine.
    #[command(name = "set-ip")]
    SetIp(SetIpCommand),
}

/// Arguments for `spotkeep launch`.
#[derive(Args, Debug)]
pub(crate) struct LaunchCommand {
    /// Machine name.
    pub(crate) name: String,
    /// Instance class, or comma-separated constraints such as `vcpu>=4,gpu>=1`.
    #[arg(long, value_name = "SELECTION")]
    pub(crate) select: Option<String>,
    /// Comma-separated sort keys; prefix a key with `-` to sort descending.
    #[arg(long, value_name = "KEYS", value_delimiter = ',')]
    pub(crate) sort: Vec<String>,
    /// Reserved address to attach, as an address or an index into the list.
    #[arg(long, value_name = "ADDRESS|INDEX")]
    pub(crate) ip: Option<String>,
    /// Root disk size in gigabytes.
    #[arg(long, value_name = "GB")]
    pub(crate) volume_size: Option<u64>,
    /// Launch on demand instead of on the spot market.
    #[arg(long)]
    pub(crate) on_demand: bool,
    /// Wait for an HTTP service on this port before returning.
    #[arg(long, value_name = "PORT")]
    pub(crate) wait_port: Option<u16>,
    /// Return once the machine is ready instead of watching it.
    #[arg(long)]
    pub(crate) detach: bool,
}

/// Arguments for `spotkeep stop`.
#[derive(Args, Debug)]
pub(crate) struct StopCommand {
    /// Machine name.
    pub(crate) name: String,
    /// Delete the root disk without saving an image.
    #[arg(long)]
    pub(crate) no_save: bool,
    /// Save ordering: `terminate-first` or `save-first`.
    #[arg(long, value_name = "ORDERING")]
    pub(crate) ordering: Option<String>,
    /// Capability to enable through an on-demand relaunch.
    #[arg(long, value_name = "FEATURE", conflicts_with = "no_save")]
    pub(crate) enable_feature: Option<String>,
}

/// Arguments for `spotkeep terminate`.
#[derive(Args, Debug)]
pub(crate) struct TerminateCommand {
    /// Machine name.
    pub(crate) name: String,
    /// Also delete the disks attached to the instance.
    #[arg(long)]
    pub(crate) delete_disk: bool,
}

/// Arguments for `spotkeep set-ip`.
#[derive(Args, Debug)]
pub(crate) struct SetIpCommand {
    /// Machine name.
    pub(crate) name: String,
    /// Reserved address, or an index into the reserved address list.
    pub(crate) address: String,
}
