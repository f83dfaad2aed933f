//! Binary entry point for the `spotkeep` CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use spotkeep::resource::Instance;
use spotkeep::{
    AddressChoice, Context, InstanceController, LaunchOptions, LaunchedInstance,
    LifecycleConfig, LifecycleError, Lookup, MonitorExit, ProcessCommandRunner, ResourceHandle,
    SaveOrdering, ScalewayConfig, ScalewayProvider, ScalewayProviderError, Selection,
    ShellConfig, SortKey, SpecStore, SpotController, SshShell, StopOptions,
};

mod cli;

use cli::{Cli, LaunchCommand, SetIpCommand, StopCommand, TerminateCommand};

type Controller = SpotController<ScalewayProvider, SshShell<ProcessCommandRunner>>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid argument: {0}")]
    Argument(String),
    #[error("remote shell error: {0}")]
    Shell(String),
    #[error("provider error: {0}")]
    Provider(#[from] ScalewayProviderError),
    #[error(transparent)]
    Lifecycle(Box<LifecycleError<ScalewayProviderError>>),
}

impl From<LifecycleError<ScalewayProviderError>> for CliError {
    fn from(value: LifecycleError<ScalewayProviderError>) -> Self {
        Self::Lifecycle(Box::new(value))
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("spotkeep=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let (controller, settings) = build_controller()?;
    match cli {
        Cli::Launch(command) => launch(&controller, &command).await,
        Cli::Stop(command) => stop(&controller, &settings, command).await,
        Cli::Terminate(command) => terminate(&controller, &command).await,
        Cli::SetIp(command) => set_ip(&controller, &command).await,
    }
}

fn build_controller() -> Result<(Controller, LifecycleConfig), CliError> {
    let scaleway =
        ScalewayConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let settings =
        LifecycleConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    settings
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let shell_config =
        ShellConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;

    let defaults = scaleway.launch_defaults(&shell_config.user);
    let shell = SshShell::with_process_runner(shell_config)
        .map_err(|err| CliError::Shell(err.to_string()))?;
    let provider = ScalewayProvider::new(scaleway)?.with_poll_interval(settings.poll_interval());
    let specs = SpecStore::new(&settings.spec_dir);

    let instances = InstanceController::new(Context {
        provider: Arc::new(provider),
        shell: Arc::new(shell),
        specs: Arc::new(specs),
        defaults,
        settings: settings.clone(),
    });
    Ok((SpotController::new(instances), settings))
}

fn launch_options(command: &LaunchCommand) -> Result<LaunchOptions, CliError> {
    let select = command
        .select
        .as_deref()
        .map(Selection::parse)
        .transpose()
        .map_err(|err| CliError::Argument(err.to_string()))?;
    let sort = command
        .sort
        .iter()
        .map(|key| key.parse::<SortKey>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| CliError::Argument(err.to_string()))?;
    let address = command
        .ip
        .as_deref()
        .map(str::parse::<AddressChoice>)
        .transpose()
        .map_err(CliError::Argument)?;
    Ok(LaunchOptions {
        select,
        sort,
        address,
        volume_size_gb: command.volume_size,
        spot: !command.on_demand,
    })
}

async fn launch(controller: &Controller, command: &LaunchCommand) -> Result<(), CliError> {
    let options = launch_options(command)?;
    let launched = controller.launch(&command.name, &options).await?;
    report_launch(&launched);

    if let Some(port) = command.wait_port {
        let url = controller
            .instances()
            .wait_for_service(&launched.handle, port)
            .await?;
        writeln!(io::stdout(), "service: {url}").ok();
    }

    match launched.monitor {
        Some(monitor) if !command.detach => {
            let token = monitor.cancellation_token();
            let join = monitor.join();
            tokio::pin!(join);
            let exit = tokio::select! {
                exit = &mut join => exit,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!(
                        name = %launched.name,
                        "no longer watching; instance left running"
                    );
                    token.cancel();
                    join.await
                }
            };
            report_monitor_exit(&launched.name, &exit);
        }
        Some(monitor) => {
            // The process exits next, taking the monitor task with it.
            monitor.cancel();
        }
        None => {}
    }
    Ok(())
}

fn report_launch(launched: &LaunchedInstance) {
    let mut stdout = io::stdout();
    let id = launched.handle.id().unwrap_or("-");
    writeln!(stdout, "{} is running as {id}", launched.name).ok();
    if let Some(row) = &launched.selected {
        writeln!(stdout, "class: {} in {}", row.instance_type, row.zone).ok();
    }
    if let Some(address) = launched.address {
        writeln!(stdout, "address: {address}").ok();
    }
}

fn report_monitor_exit(name: &str, exit: &MonitorExit) {
    match exit {
        MonitorExit::Done => tracing::info!(name, "interruption handled; machine saved"),
        MonitorExit::Cancelled => tracing::info!(name, "monitor stopped"),
        MonitorExit::Gone { reason } => tracing::info!(name, %reason, "monitor finished"),
        MonitorExit::CallbackFailed { message } | MonitorExit::Aborted { message } => {
            tracing::error!(name, %message, "monitor ended abnormally");
        }
    }
}

async fn stop(
    controller: &Controller,
    settings: &LifecycleConfig,
    command: StopCommand,
) -> Result<(), CliError> {
    let ordering = match command.ordering.as_deref() {
        Some(raw) => raw.parse::<SaveOrdering>().map_err(CliError::Argument)?,
        None => settings
            .save_ordering()
            .map_err(|err| CliError::Config(err.to_string()))?,
    };
    let options = StopOptions {
        save: !command.no_save,
        ordering,
        enable_feature: command.enable_feature,
    };
    let saved = controller.stop_by_name(&command.name, &options).await?;
    if let Some(artifacts) = saved {
        writeln!(
            io::stdout(),
            "saved {} as image {}",
            command.name,
            artifacts.image.id().unwrap_or("-")
        )
        .ok();
    }
    Ok(())
}

async fn resolve_instance(
    controller: &Controller,
    name: &str,
) -> Result<Option<ResourceHandle<Instance>>, CliError> {
    let provider = controller.instances().provider().as_ref();
    let handle = ResourceHandle::<Instance>::resolve(provider, Lookup::Text(name)).await?;
    if handle.is_bound() {
        Ok(Some(handle))
    } else {
        tracing::warn!(name, "no instance carries this name");
        Ok(None)
    }
}

async fn terminate(controller: &Controller, command: &TerminateCommand) -> Result<(), CliError> {
    if let Some(mut handle) = resolve_instance(controller, &command.name).await? {
        controller.terminate(&mut handle, command.delete_disk).await?;
    }
    Ok(())
}

async fn set_ip(controller: &Controller, command: &SetIpCommand) -> Result<(), CliError> {
    let choice = command
        .address
        .parse::<AddressChoice>()
        .map_err(CliError::Argument)?;
    let handle = resolve_instance(controller, &command.name)
        .await?
        .ok_or_else(|| CliError::Argument(format!("no instance named '{}'", command.name)))?;
    let address = controller
        .instances()
        .set_address(&handle, choice)
        .await?;
    writeln!(io::stdout(), "{}: {address}", command.name).ok();
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn launch_command(select: Option<&str>, sort: &[&str], ip: Option<&str>) -> LaunchCommand {
        LaunchCommand {
            name: String::from("box"),
            select: select.map(str::to_owned),
            sort: sort.iter().map(|key| (*key).to_owned()).collect(),
            ip: ip.map(str::to_owned),
            volume_size: Some(40),
            on_demand: false,
            wait_port: None,
            detach: false,
        }
    }

    #[rstest]
    fn launch_options_parse_selection_sort_and_address() {
        let command = launch_command(Some("vcpu>=4"), &["-gpu", "price"], Some("1"));
        let options = launch_options(&command).expect("valid options");

        assert!(options.spot);
        assert_eq!(options.volume_size_gb, Some(40));
        assert_eq!(options.sort.len(), 2);
        assert!(options.sort.first().is_some_and(|key| key.descending));
        assert_eq!(options.address, Some(AddressChoice::Index(1)));
        assert!(matches!(options.select, Some(Selection::Matching(_))));
    }

    #[rstest]
    #[case(Some("vcpu>>4"), None)]
    #[case(None, Some("not-an-address"))]
    fn launch_options_reject_malformed_input(
        #[case] select: Option<&str>,
        #[case] ip: Option<&str>,
    ) {
        let command = launch_command(select, &[], ip);
        assert!(matches!(
            launch_options(&command),
            Err(CliError::Argument(_))
        ));
    }

    #[rstest]
    fn write_error_renders_message() {
        let mut buffer = Vec::new();
        write_error(&mut buffer, &CliError::Config(String::from("missing key")));
        assert_eq!(
            String::from_utf8(buffer).expect("utf8"),
            "configuration error: missing key\n"
        );
    }
}
