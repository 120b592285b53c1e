mod known_hosts;
mod pool;
mod sudo;

use std::collections::HashMap;
use std::path::Path;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use russh::ChannelMsg;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{
    check_capabilities, compose_shell_script, Adapter, AdapterKind, Capabilities,
    DEFAULT_OUTPUT_LIMIT,
};
use crate::command::request::{CommandRequest, SshOptions, TargetOptions};
use crate::command::result::{CommandOutput, ExecutionResult, OutputError, Target};
use crate::error::{ExecError, ExecResult};
use crate::secure::{mask_password, SecurePasswordHandler};
use pool::{ConnectionPool, PoolKey, PooledConnection};

/// Runs commands on remote hosts over pooled russh transports, with SFTP
/// file transfer and sudo escalation.
pub struct SshAdapter {
    pool: ConnectionPool,
    secure: SecurePasswordHandler,
    /// Host each pending askpass helper lives on, so `dispose` can reach it.
    askpass_hosts: Mutex<HashMap<String, PoolKey>>,
    output_limit: usize,
}

impl Default for SshAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SshAdapter {
    pub fn new() -> Self {
        Self {
            pool: ConnectionPool::new(),
            secure: SecurePasswordHandler::new(),
            askpass_hosts: Mutex::new(HashMap::new()),
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// The handler tracking this adapter's askpass sessions.
    pub fn secure_handler(&self) -> &SecurePasswordHandler {
        &self.secure
    }

    /// Upload a local file over SFTP, preserving its mode.
    pub async fn upload_file(
        &self,
        opts: &SshOptions,
        local: &Path,
        remote: &Path,
    ) -> ExecResult<()> {
        let conn = self.pool.acquire(opts).await?;
        let contents = tokio::fs::read(local)
            .await
            .map_err(|e| ExecError::TransferFailed(format!("cannot read '{}': {e}", local.display())))?;
        let remote_str = remote
            .to_str()
            .ok_or_else(|| ExecError::TransferFailed("invalid UTF-8 in remote path".into()))?;

        let mut sftp_guard = conn.sftp().await?;
        let sftp = sftp_guard
            .as_mut()
            .ok_or_else(|| ExecError::TransferFailed("SFTP session not available".into()))?;

        let mut file = sftp
            .open_with_flags(
                remote_str,
                OpenFlags::CREATE | OpenFlags::WRITE | OpenFlags::TRUNCATE,
            )
            .await
            .map_err(|e| ExecError::TransferFailed(format!("remote open failed: {e}")))?;
        file.write_all(&contents)
            .await
            .map_err(|e| ExecError::TransferFailed(format!("remote write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| ExecError::TransferFailed(format!("remote flush failed: {e}")))?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = tokio::fs::metadata(local)
                .await
                .map_err(|e| ExecError::TransferFailed(e.to_string()))?
                .permissions()
                .mode();
            let mut attrs = russh_sftp::protocol::FileAttributes::default();
            attrs.permissions = Some(mode & 0o7777);
            sftp.set_metadata(remote_str, attrs)
                .await
                .map_err(|e| ExecError::TransferFailed(format!("remote chmod failed: {e}")))?;
        }

        tracing::debug!(local = %local.display(), remote = %remote.display(), "file uploaded");
        Ok(())
    }

    /// Download a remote file over SFTP, preserving its mode.
    pub async fn download_file(
        &self,
        opts: &SshOptions,
        remote: &Path,
        local: &Path,
    ) -> ExecResult<()> {
        let conn = self.pool.acquire(opts).await?;
        let remote_str = remote
            .to_str()
            .ok_or_else(|| ExecError::TransferFailed("invalid UTF-8 in remote path".into()))?;

        let mut sftp_guard = conn.sftp().await?;
        let sftp = sftp_guard
            .as_mut()
            .ok_or_else(|| ExecError::TransferFailed("SFTP session not available".into()))?;

        let mut file = sftp
            .open_with_flags(remote_str, OpenFlags::READ)
            .await
            .map_err(|e| ExecError::TransferFailed(format!("remote open failed: {e}")))?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .await
            .map_err(|e| ExecError::TransferFailed(format!("remote read failed: {e}")))?;
        let attrs = sftp
            .metadata(remote_str)
            .await
            .map_err(|e| ExecError::TransferFailed(format!("remote stat failed: {e}")))?;
        drop(sftp_guard);

        tokio::fs::write(local, &contents)
            .await
            .map_err(|e| ExecError::TransferFailed(format!("cannot write '{}': {e}", local.display())))?;

        #[cfg(unix)]
        if let Some(mode) = attrs.permissions {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(local, std::fs::Permissions::from_mode(mode & 0o7777))
                .await
                .map_err(|e| ExecError::TransferFailed(format!("local chmod failed: {e}")))?;
        }

        tracing::debug!(remote = %remote.display(), local = %local.display(), "file downloaded");
        Ok(())
    }
}

/// Drain channel messages into `output` until the channel closes.
async fn drain_channel(
    channel: &mut russh::Channel<russh::client::Msg>,
    output: &mut CommandOutput,
    limit: usize,
) -> ExecResult<()> {
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                output.stdout.extend_from_slice(&data);
                if output.stdout.len() > limit {
                    return Err(ExecError::Output(OutputError::OutputTooLarge {
                        size: output.stdout.len(),
                        limit,
                    }));
                }
            }
            ChannelMsg::ExtendedData { data, .. } => {
                output.stderr.extend_from_slice(&data);
                if output.stderr.len() > limit {
                    return Err(ExecError::Output(OutputError::OutputTooLarge {
                        size: output.stderr.len(),
                        limit,
                    }));
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                output.exit_code = exit_status as i32;
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                output.signal = Some(format!("{signal_name:?}"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Execute one command on an open connection: new channel, stdin, bounded
/// output collection, timeout enforcement.
async fn run_channel(
    conn: &PooledConnection,
    command: &str,
    stdin: Option<Vec<u8>>,
    timeout: Option<std::time::Duration>,
    limit: usize,
) -> ExecResult<CommandOutput> {
    let (_permit, mut channel) = conn.open_channel().await?;
    let started_at = SystemTime::now();
    let started = Instant::now();

    channel
        .exec(true, command)
        .await
        .map_err(|e| ExecError::ConnectionFailed(format!("exec failed: {e}")))?;

    if let Some(bytes) = stdin {
        channel
            .data(&bytes[..])
            .await
            .map_err(|e| ExecError::ConnectionFailed(format!("stdin write failed: {e}")))?;
    }
    // Close remote stdin so commands reading it can finish.
    let _ = channel.eof().await;

    let mut output = CommandOutput::new();
    output.started_at = started_at;

    match timeout {
        Some(budget) => {
            match tokio::time::timeout(budget, drain_channel(&mut channel, &mut output, limit))
                .await
            {
                Ok(drained) => drained?,
                Err(_) => {
                    // Best-effort server-side kill before abandoning the channel.
                    let _ = channel.signal(russh::Sig::KILL).await;
                    return Err(ExecError::Timeout {
                        limit: budget,
                        elapsed: started.elapsed(),
                    });
                }
            }
        }
        None => drain_channel(&mut channel, &mut output, limit).await?,
    }

    output.duration = started.elapsed();
    Ok(output)
}

#[async_trait]
impl Adapter for SshAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Ssh
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            stdin: true,
            tty: false,
            copy: true,
            streaming_logs: false,
            port_forward: false,
            sudo: true,
            default_shell: "/bin/sh",
        }
    }

    async fn is_available(&self) -> bool {
        // The SSH stack is in-process; reachability is per-host and only
        // known at execute time.
        true
    }

    async fn execute(&self, request: &CommandRequest) -> ExecResult<ExecutionResult> {
        let TargetOptions::Ssh(opts) = &request.target else {
            return Err(ExecError::InvalidRequest(
                "ssh adapter received a non-ssh target".into(),
            ));
        };
        check_capabilities(request, &self.capabilities(), self.kind())?;

        let conn = self.pool.acquire(opts).await?;
        let script = compose_shell_script(
            &request.env,
            request.cwd.as_deref(),
            &request.shell,
            &request.command,
            &request.args,
        );

        let mut stdin = request.stdin.read_bytes().await?;
        let (final_command, askpass) = match &opts.sudo {
            Some(sudo_opts) => {
                let invocation =
                    sudo::prepare_sudo(&conn, &self.secure, sudo_opts, &script).await?;
                if let Some(session) = &invocation.askpass {
                    self.askpass_hosts
                        .lock()
                        .await
                        .insert(session.id.clone(), conn.key.clone());
                }
                if let Some(prefix) = invocation.stdin_prefix {
                    let mut combined = prefix;
                    if let Some(user_stdin) = stdin.take() {
                        combined.extend_from_slice(&user_stdin);
                    }
                    stdin = Some(combined);
                }
                (invocation.command, invocation.askpass)
            }
            None => (script, None),
        };

        let exec_result = run_channel(
            &conn,
            &final_command,
            stdin,
            request.timeout,
            self.output_limit,
        )
        .await;

        // The helper must not outlive the command, regardless of outcome.
        if let Some(session) = &askpass {
            sudo::cleanup_askpass(&conn, &self.secure, session).await;
            let removed = !self
                .secure
                .pending_sessions()
                .iter()
                .any(|s| s.id == session.id);
            if removed {
                self.askpass_hosts.lock().await.remove(&session.id);
            }
        }

        let output = exec_result?;

        let mut command_echo = request.display_command();
        if let Some(password) = opts.sudo.as_ref().and_then(|s| s.password.as_deref()) {
            command_echo = mask_password(&command_echo, password);
        }

        tracing::debug!(
            host = %opts.host,
            command = %command_echo,
            exit_code = output.exit_code,
            "ssh command completed"
        );

        Ok(ExecutionResult {
            command: command_echo,
            adapter: AdapterKind::Ssh,
            target: Target::Host(opts.host.clone()),
            output,
        })
    }

    async fn dispose(&self) -> ExecResult<()> {
        // Remove any helper whose per-command cleanup failed, while the
        // connections are still alive.
        let hosts: Vec<_> = {
            let map = self.askpass_hosts.lock().await;
            map.iter()
                .map(|(id, key)| (id.clone(), key.clone()))
                .collect()
        };
        for session in self.secure.pending_sessions() {
            let Some((_, key)) = hosts.iter().find(|(id, _)| *id == session.id) else {
                continue;
            };
            if let Some(conn) = self.pool.live_connection(key).await {
                sudo::cleanup_askpass(&conn, &self.secure, &session).await;
            }
        }
        self.askpass_hosts.lock().await.clear();
        self.pool.dispose().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::request::Shell;

    #[test]
    fn remote_script_composition_matches_ssh_conventions() {
        let mut env = HashMap::new();
        env.insert("DEPLOY_ENV".to_string(), "prod".to_string());
        let script = compose_shell_script(
            &env,
            Some(Path::new("/srv/app")),
            &Shell::Default,
            "./restart.sh",
            &[],
        );
        assert_eq!(script, "export DEPLOY_ENV=prod; cd /srv/app && ./restart.sh");
    }

    #[tokio::test]
    async fn non_ssh_target_is_rejected() {
        let adapter = SshAdapter::new();
        let request = CommandRequest {
            command: "true".into(),
            ..Default::default()
        };
        assert!(matches!(
            adapter.execute(&request).await,
            Err(ExecError::InvalidRequest(_))
        ));
    }
}
