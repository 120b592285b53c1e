use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::sleep;

use super::{check_capabilities, Adapter, AdapterKind, Capabilities, DEFAULT_OUTPUT_LIMIT};
use crate::command::request::{CommandRequest, Shell, TargetOptions};
use crate::command::result::{CommandOutput, ExecutionResult, OutputError, Target};
use crate::error::{ExecError, ExecResult};

const TERM_GRACE: Duration = Duration::from_secs(2);

/// Runs commands as child processes on the host.
pub struct LocalAdapter {
    output_limit: usize,
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAdapter {
    pub fn new() -> Self {
        Self {
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    fn build_command(&self, request: &CommandRequest) -> ExecResult<Command> {
        let (program, args) = resolve_argv(request)?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        // envs() merges onto the inherited environment without clearing it
        cmd.envs(&request.env);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd)
    }
}

/// Turn the request into `(program, argv)` per the shell selection.
fn resolve_argv(request: &CommandRequest) -> ExecResult<(String, Vec<String>)> {
    match &request.shell {
        Shell::Default => Ok((
            "/bin/sh".to_string(),
            vec!["-c".to_string(), request.command.clone()],
        )),
        Shell::Path(path) => Ok((
            path.clone(),
            vec!["-c".to_string(), request.command.clone()],
        )),
        Shell::Never => {
            if request.args.is_empty() {
                let mut parts = shell_words::split(&request.command).map_err(|e| {
                    ExecError::InvalidRequest(format!("cannot parse command: {e}"))
                })?;
                if parts.is_empty() {
                    return Err(ExecError::InvalidRequest("empty command".into()));
                }
                let program = parts.remove(0);
                Ok((program, parts))
            } else {
                Ok((request.command.clone(), request.args.clone()))
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(signal_name)
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGHUP => "HUP".to_string(),
        libc::SIGINT => "INT".to_string(),
        libc::SIGKILL => "KILL".to_string(),
        libc::SIGTERM => "TERM".to_string(),
        other => other.to_string(),
    }
}

/// Ask the child to exit with SIGTERM, escalating to SIGKILL after a grace
/// period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + TERM_GRACE;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
    let _ = child.kill().await;
}

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(
    reader: Option<R>,
    limit: usize,
) -> ExecResult<Vec<u8>> {
    let Some(reader) = reader else {
        return Ok(Vec::new());
    };
    let mut buf = Vec::new();
    let mut capped = reader.take(limit as u64 + 1);
    capped
        .read_to_end(&mut buf)
        .await
        .map_err(|e| ExecError::ConnectionFailed(format!("failed reading output: {e}")))?;
    if buf.len() > limit {
        return Err(ExecError::Output(OutputError::OutputTooLarge {
            size: buf.len(),
            limit,
        }));
    }
    Ok(buf)
}

/// Spawn a prepared command, feed stdin, collect bounded output, and
/// enforce the timeout. Shared by the local adapter and the CLI-driven
/// docker/kubectl adapters.
pub(crate) async fn run_child(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
    output_limit: usize,
) -> ExecResult<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let started_at = SystemTime::now();
    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            ExecError::TargetNotFound(format!("executable not found: {e}"))
        }
        _ => ExecError::ConnectionFailed(format!("failed to spawn process: {e}")),
    })?;

    let stdout_task = tokio::spawn(read_capped(child.stdout.take(), output_limit));
    let stderr_task = tokio::spawn(read_capped(child.stderr.take(), output_limit));

    // Readers are already draining, so a large stdin cannot deadlock
    // against a full output pipe. A child that never reads stdin is fine.
    if let Some(bytes) = stdin {
        if let Some(mut handle) = child.stdin.take() {
            match handle.write_all(&bytes).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => {
                    return Err(ExecError::ConnectionFailed(format!(
                        "failed writing stdin: {e}"
                    )))
                }
            }
            handle.shutdown().await.ok();
        }
    }

    let status = if let Some(limit) = timeout {
        tokio::select! {
            status = child.wait() => {
                status.map_err(|e| ExecError::ConnectionFailed(format!("wait failed: {e}")))?
            }
            _ = sleep(limit) => {
                terminate(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(ExecError::Timeout { limit, elapsed: started.elapsed() });
            }
        }
    } else {
        child
            .wait()
            .await
            .map_err(|e| ExecError::ConnectionFailed(format!("wait failed: {e}")))?
    };

    let stdout = stdout_task
        .await
        .map_err(|e| ExecError::ConnectionFailed(format!("output task failed: {e}")))??;
    let stderr = stderr_task
        .await
        .map_err(|e| ExecError::ConnectionFailed(format!("output task failed: {e}")))??;

    let signal = exit_signal(&status);
    let exit_code = status.code().unwrap_or(-1);

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
        signal,
        started_at,
        duration: started.elapsed(),
    })
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Local
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            stdin: true,
            tty: false,
            copy: true,
            streaming_logs: false,
            port_forward: false,
            sudo: false,
            default_shell: "/bin/sh",
        }
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, request: &CommandRequest) -> ExecResult<ExecutionResult> {
        if !matches!(request.target, TargetOptions::Local) {
            return Err(ExecError::InvalidRequest(
                "local adapter received a non-local target".into(),
            ));
        }
        check_capabilities(request, &self.capabilities(), self.kind())?;

        let cmd = self.build_command(request)?;
        let stdin = request.stdin.read_bytes().await?;
        let output = run_child(cmd, stdin, request.timeout, self.output_limit).await?;

        tracing::debug!(
            command = %request.display_command(),
            exit_code = output.exit_code,
            "local command completed"
        );

        Ok(ExecutionResult {
            command: request.display_command(),
            adapter: AdapterKind::Local,
            target: Target::Local,
            output,
        })
    }

    async fn dispose(&self) -> ExecResult<()> {
        Ok(())
    }
}
