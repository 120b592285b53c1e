use std::sync::Once;

use russh_sftp::protocol::OpenFlags;
use tokio::io::AsyncWriteExt;

use super::pool::PooledConnection;
use crate::command::request::{SudoMethod, SudoOptions};
use crate::error::{ExecError, ExecResult};
use crate::secure::{AskpassSession, SecurePasswordHandler};

static ECHO_WARNING: Once = Once::new();

/// A caller command wrapped for privilege escalation.
pub(crate) struct SudoInvocation {
    pub command: String,
    /// Written to the channel before the caller's stdin (stdin strategy).
    pub stdin_prefix: Option<Vec<u8>>,
    /// Helper session to remove once the command finishes.
    pub askpass: Option<AskpassSession>,
}

fn sudo_user_flag(sudo: &SudoOptions) -> String {
    match &sudo.user {
        Some(user) => format!("-u {} ", shell_words::quote(user)),
        None => String::new(),
    }
}

/// The escalated command always runs through `sh -c` so env exports and
/// `cd` prefixes composed earlier survive the sudo boundary.
fn escalated(script: &str) -> String {
    format!("sh -c {}", shell_words::quote(script))
}

fn stdin_command(sudo: &SudoOptions, script: &str) -> String {
    format!("sudo -S -p '' {}{}", sudo_user_flag(sudo), escalated(script))
}

fn echo_command(sudo: &SudoOptions, password: &str, script: &str) -> String {
    format!(
        "echo {} | sudo -S -p '' {}{}",
        shell_words::quote(password),
        sudo_user_flag(sudo),
        escalated(script)
    )
}

fn askpass_command(
    session: &AskpassSession,
    sudo: &SudoOptions,
    password: &str,
    script: &str,
) -> String {
    format!(
        "SUDO_ASKPASS={} {}={} sudo -A {}{}",
        session.remote_path,
        session.env_var,
        shell_words::quote(password),
        sudo_user_flag(sudo),
        escalated(script)
    )
}

/// Upload the askpass helper for `session` with mode 0700.
async fn upload_helper(conn: &PooledConnection, session: &AskpassSession) -> ExecResult<()> {
    let mut sftp_guard = conn.sftp().await?;
    let sftp = sftp_guard
        .as_mut()
        .ok_or_else(|| ExecError::TransferFailed("SFTP session not available".into()))?;

    let mut file = sftp
        .open_with_flags(
            session.remote_path.as_str(),
            OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE,
        )
        .await
        .map_err(|e| ExecError::TransferFailed(format!("askpass helper create failed: {e}")))?;
    file.write_all(session.helper_script().as_bytes())
        .await
        .map_err(|e| ExecError::TransferFailed(format!("askpass helper write failed: {e}")))?;
    file.flush()
        .await
        .map_err(|e| ExecError::TransferFailed(format!("askpass helper flush failed: {e}")))?;
    drop(file);

    let mut attrs = russh_sftp::protocol::FileAttributes::default();
    attrs.permissions = Some(0o700);
    sftp.set_metadata(session.remote_path.as_str(), attrs)
        .await
        .map_err(|e| ExecError::TransferFailed(format!("askpass helper chmod failed: {e}")))?;
    Ok(())
}

/// Wrap `script` according to the configured sudo strategy. For
/// secure-askpass this materialises the remote helper; the caller must
/// invoke [`cleanup_askpass`] when the command finishes, success or not.
pub(crate) async fn prepare_sudo(
    conn: &PooledConnection,
    handler: &SecurePasswordHandler,
    sudo: &SudoOptions,
    script: &str,
) -> ExecResult<SudoInvocation> {
    let password = sudo
        .password
        .as_deref()
        .ok_or_else(|| ExecError::InvalidRequest("sudo requires a password".into()))?;

    match sudo.method {
        SudoMethod::Stdin => Ok(SudoInvocation {
            command: stdin_command(sudo, script),
            stdin_prefix: Some(format!("{password}\n").into_bytes()),
            askpass: None,
        }),
        SudoMethod::Echo => {
            ECHO_WARNING.call_once(|| {
                tracing::warn!(
                    "sudo 'echo' strategy exposes the password in remote process \
                     listings; prefer secure-askpass"
                );
            });
            Ok(SudoInvocation {
                command: echo_command(sudo, password, script),
                stdin_prefix: None,
                askpass: None,
            })
        }
        SudoMethod::SecureAskpass => {
            let session = handler.begin_session();
            upload_helper(conn, &session).await.map_err(|e| {
                // Nothing reached the remote side; forget the session.
                handler.finish_session(&session.id);
                e
            })?;
            tracing::debug!(helper = %session.remote_path, "askpass helper uploaded");
            Ok(SudoInvocation {
                command: askpass_command(&session, sudo, password, script),
                stdin_prefix: None,
                askpass: Some(session),
            })
        }
    }
}

/// Remove the helper script for `session`. Runs on every exit path of a
/// secure-askpass command; failures keep the session pending so `dispose`
/// can retry.
pub(crate) async fn cleanup_askpass(
    conn: &PooledConnection,
    handler: &SecurePasswordHandler,
    session: &AskpassSession,
) {
    let remove = format!("rm -f {}", session.remote_path);
    match run_quiet(conn, &remove).await {
        Ok(()) => handler.finish_session(&session.id),
        Err(e) => {
            tracing::warn!(helper = %session.remote_path, "askpass cleanup failed: {e}");
        }
    }
}

/// Run a short housekeeping command on the connection, ignoring output.
async fn run_quiet(conn: &PooledConnection, command: &str) -> ExecResult<()> {
    let (_permit, mut channel) = conn.open_channel().await?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| ExecError::ConnectionFailed(format!("exec failed: {e}")))?;
    while channel.wait().await.is_some() {}
    Ok(())
}
