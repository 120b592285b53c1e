//! SSH adapter integration tests against a disposable sshd container.
//! Requires a local Docker daemon; enabled with `--features integration-tests`.
#![cfg(feature = "integration-tests")]

mod common;

use std::time::Duration;

use common::{SshServer, ROOT_PASSWORD, SUDO_PASSWORD, SUDO_USER};
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use uxec::{
    Engine, ExecError, SshAuth, SshOptions, SudoMethod, SudoOptions,
};

async fn start_server() -> (ContainerAsync<SshServer>, u16) {
    let container = SshServer
        .with_mapped_port(0, 22.tcp())
        .start()
        .await
        .expect("failed to start SSH container");
    let port = container
        .get_host_port_ipv4(22)
        .await
        .expect("SSH port not mapped");
    (container, port)
}

fn root_options(port: u16) -> SshOptions {
    let mut opts = SshOptions::new("127.0.0.1", "root");
    opts.port = port;
    opts.auth = SshAuth::Password(ROOT_PASSWORD.to_string());
    opts.suppress_unknown_host_warning = true;
    opts
}

fn sudo_user_options(port: u16, method: SudoMethod) -> SshOptions {
    let mut opts = SshOptions::new("127.0.0.1", SUDO_USER);
    opts.port = port;
    opts.auth = SshAuth::Password(SUDO_PASSWORD.to_string());
    opts.suppress_unknown_host_warning = true;
    opts.sudo = Some(SudoOptions {
        password: Some(SUDO_PASSWORD.to_string()),
        method,
        user: None,
    });
    opts
}

#[tokio::test]
async fn whoami_reports_the_configured_user() {
    let (_container, port) = start_server().await;
    let engine = Engine::new();

    let result = engine
        .command("whoami")
        .ssh(root_options(port))
        .run()
        .await
        .unwrap();
    assert_eq!(result.output.to_stdout_string().unwrap().trim(), "root");

    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn env_and_cwd_apply_remotely() {
    let (_container, port) = start_server().await;
    let engine = Engine::new();

    let result = engine
        .command("echo $FOO && pwd")
        .shell(true)
        .env("FOO", "remote-value")
        .cd("/tmp")
        .ssh(root_options(port))
        .run()
        .await
        .unwrap();
    let stdout = result.output.to_stdout_string().unwrap();
    assert_eq!(stdout, "remote-value\n/tmp\n");

    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn nonzero_remote_exit_raises_command_failed() {
    let (_container, port) = start_server().await;
    let engine = Engine::new();

    let err = engine
        .command("exit 42")
        .shell(true)
        .ssh(root_options(port))
        .run()
        .await
        .unwrap_err();
    match err {
        ExecError::CommandFailed { result } => assert_eq!(result.exit_code(), 42),
        other => panic!("expected CommandFailed, got {other:?}"),
    }

    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn remote_timeout_is_enforced() {
    let (_container, port) = start_server().await;
    let engine = Engine::new();

    let err = engine
        .command("sleep 30")
        .timeout(Duration::from_millis(500))
        .ssh(root_options(port))
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::Timeout { .. }));

    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn sftp_upload_download_round_trip() {
    let (_container, port) = start_server().await;
    let engine = Engine::new();
    let opts = root_options(port);

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("payload.sh");
    std::fs::write(&local, b"#!/bin/sh\necho payload\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&local, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let remote = std::path::Path::new("/tmp/payload.sh");
    engine.ssh().upload_file(&opts, &local, remote).await.unwrap();

    let fetched = dir.path().join("fetched.sh");
    engine
        .ssh()
        .download_file(&opts, remote, &fetched)
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(&local).unwrap(),
        std::fs::read(&fetched).unwrap()
    );
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&fetched).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    engine.dispose().await.unwrap();
}

async fn assert_no_askpass_left(engine: &Engine, opts: &SshOptions) {
    let listing = engine
        .command("ls /tmp/askpass-*.sh 2>/dev/null | wc -l")
        .shell(true)
        .ssh(opts.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(
        listing.output.to_stdout_string().unwrap().trim(),
        "0",
        "askpass helper leaked on the remote host"
    );
}

#[tokio::test]
async fn sudo_secure_askpass_escalates_and_cleans_up() {
    let (_container, port) = start_server().await;
    let engine = Engine::new();

    let result = engine
        .command("whoami")
        .ssh(sudo_user_options(port, SudoMethod::SecureAskpass))
        .run()
        .await
        .unwrap();
    assert_eq!(result.output.to_stdout_string().unwrap().trim(), "root");

    // The helper must be gone whatever the outcome of the command.
    let mut plain = sudo_user_options(port, SudoMethod::SecureAskpass);
    plain.sudo = None;
    assert_no_askpass_left(&engine, &plain).await;
    assert!(engine.ssh().secure_handler().is_empty());

    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn sudo_askpass_cleans_up_after_failed_commands() {
    let (_container, port) = start_server().await;
    let engine = Engine::new();

    let err = engine
        .command("exit 9")
        .shell(true)
        .ssh(sudo_user_options(port, SudoMethod::SecureAskpass))
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::CommandFailed { .. }));

    let mut plain = sudo_user_options(port, SudoMethod::SecureAskpass);
    plain.sudo = None;
    assert_no_askpass_left(&engine, &plain).await;
    assert!(engine.ssh().secure_handler().is_empty());

    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn sudo_stdin_method_escalates() {
    let (_container, port) = start_server().await;
    let engine = Engine::new();

    let result = engine
        .command("whoami")
        .ssh(sudo_user_options(port, SudoMethod::Stdin))
        .run()
        .await
        .unwrap();
    assert_eq!(result.output.to_stdout_string().unwrap().trim(), "root");

    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn wrong_password_is_an_authentication_error() {
    let (_container, port) = start_server().await;
    let engine = Engine::new();

    let mut opts = root_options(port);
    opts.auth = SshAuth::Password("not-the-password".to_string());
    let err = engine
        .command("true")
        .ssh(opts)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::AuthenticationFailed(_)));

    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn concurrent_commands_share_one_pooled_connection() {
    let (_container, port) = start_server().await;
    let engine = Engine::new();
    let opts = root_options(port);

    let mut handles = Vec::new();
    for i in 0..4 {
        let engine = engine.clone();
        let opts = opts.clone();
        handles.push(tokio::spawn(async move {
            engine
                .command(format!("echo task-{i}"))
                .shell(true)
                .ssh(opts)
                .run()
                .await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(
            result.output.to_stdout_string().unwrap().trim(),
            format!("task-{i}")
        );
    }

    engine.dispose().await.unwrap();
}
