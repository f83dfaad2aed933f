use super::*;
use crate::test_support::ScriptedRunner;
use rstest::{fixture, rstest};
use std::net::Ipv4Addr;

#[fixture]
fn shell_config() -> ShellConfig {
    ShellConfig {
        ssh_bin: String::from("ssh"),
        user: String::from("root"),
        port: 2222,
        identity_file: Some(String::from("/keys/id_ed25519")),
        batch_mode: true,
        strict_host_key_checking: false,
        known_hosts_file: String::from("/dev/null"),
    }
}

fn target() -> ShellTarget {
    ShellTarget {
        host: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)),
        port: 2222,
        user: String::from("ubuntu"),
    }
}

#[rstest]
#[tokio::test]
async fn run_builds_ssh_invocation(shell_config: ShellConfig) {
    let runner = ScriptedRunner::new();
    runner.push_output(Some(0), "N 5\n", "");
    let shell = SshShell::new(shell_config, runner.clone()).expect("config should be valid");

    let output = shell
        .run(&target(), "runlevel")
        .await
        .expect("scripted run should succeed");

    assert_eq!(output.stdout, "N 5\n");
    let invocations = runner.invocations();
    let [invocation] = invocations.as_slice() else {
        panic!("expected one invocation, got {invocations:?}");
    };
    assert_eq!(
        invocation.command_string(),
        "ssh -p 2222 -i /keys/id_ed25519 -o BatchMode=yes -o StrictHostKeyChecking=no \
         -o UserKnownHostsFile=/dev/null ubuntu@192.0.2.10 runlevel"
    );
}

#[rstest]
#[tokio::test]
async fn sudo_quotes_command(shell_config: ShellConfig) {
    let runner = ScriptedRunner::new();
    runner.push_success();
    let shell = SshShell::new(shell_config, runner.clone()).expect("config should be valid");

    shell
        .sudo(&target(), "ln -sf /usr/share/zoneinfo/Europe/London /etc/localtime")
        .await
        .expect("scripted sudo should succeed");

    let invocations = runner.invocations();
    let last = invocations
        .last()
        .expect("invocation recorded")
        .command_string();
    assert!(
        last.ends_with("sudo sh -c 'ln -sf /usr/share/zoneinfo/Europe/London /etc/localtime'"),
        "unexpected command: {last}"
    );
}

#[rstest]
#[tokio::test]
async fn session_sudo_rejects_non_zero_exit(shell_config: ShellConfig) {
    let runner = ScriptedRunner::new();
    runner.push_failure(3);
    let shell = SshShell::new(shell_config, runner).expect("config should be valid");
    let session = Session::new(&shell, target());

    let err = session
        .sudo("nvidia-smi -pm 1")
        .await
        .expect_err("non-zero exit should fail");

    assert!(matches!(
        err,
        ShellError::CommandFailure {
            status: Some(3),
            ..
        }
    ));
}

#[rstest]
fn target_uses_configured_port(shell_config: ShellConfig) {
    let shell =
        SshShell::new(shell_config, ScriptedRunner::new()).expect("config should be valid");
    let target = shell.target(IpAddr::V4(Ipv4Addr::LOCALHOST), "ubuntu");

    assert_eq!(target.port, 2222);
    assert_eq!(target.user, "ubuntu");
}

#[rstest]
fn blank_user_is_rejected(shell_config: ShellConfig) {
    let config = ShellConfig {
        user: String::from("  "),
        ..shell_config
    };
    let err = SshShell::new(config, ScriptedRunner::new()).expect_err("blank user should fail");
    assert!(matches!(err, ShellError::InvalidConfig { .. }));
}
