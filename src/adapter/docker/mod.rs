pub mod types;

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use lazy_static::lazy_static;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use super::local::run_child;
use super::{
    check_capabilities, Adapter, AdapterKind, Capabilities, OutputLine, OutputStream,
    DEFAULT_OUTPUT_LIMIT,
};
use crate::command::request::{CommandRequest, DockerOptions, Shell, TargetOptions};
use crate::command::result::{CommandOutput, ExecutionResult, Target};
use crate::error::{ExecError, ExecResult};
pub use types::{ContainerSpec, ContainerStats, ContainerSummary, Healthcheck, PortBinding, VolumeBinding};
use types::EphemeralContainer;

/// Oldest docker client release the adapter is tested against.
const MIN_DOCKER_VERSION: semver::Version = semver::Version::new(20, 10, 0);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

lazy_static! {
    static ref VERSION_RE: Regex = Regex::new(r"(\d+)\.(\d+)\.(\d+)").unwrap();
}

fn random_suffix(length: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Name for a container materialised by the auto-create policy.
fn ephemeral_name() -> String {
    format!("temp-ush-{}", random_suffix(8))
}

/// Name for `create_container` when the spec leaves it out.
fn generated_name() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("xec-{timestamp}-{}", random_suffix(4))
}

fn classify_stderr(stderr: &str, image: &str) -> Option<ExecError> {
    let lowered = stderr.to_lowercase();
    if lowered.contains("no such container") || lowered.contains("no such object") {
        return Some(ExecError::TargetNotFound(stderr.trim().to_string()));
    }
    if lowered.contains("unable to find image")
        || lowered.contains("pull access denied")
        || lowered.contains("invalid reference format")
        || lowered.contains("manifest unknown")
    {
        return Some(ExecError::InvalidImage {
            image: image.to_string(),
            reason: stderr.trim().to_string(),
        });
    }
    None
}

/// Executes commands inside running containers through the docker CLI, and
/// exposes the container lifecycle operations the CLI offers.
pub struct DockerAdapter {
    cli: String,
    ephemeral: Mutex<Vec<EphemeralContainer>>,
    output_limit: usize,
}

impl Default for DockerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerAdapter {
    pub fn new() -> Self {
        Self {
            cli: "docker".to_string(),
            ephemeral: Mutex::new(Vec::new()),
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_cli_path(mut self, path: impl Into<String>) -> Self {
        self.cli = path.into();
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Run one docker CLI invocation to completion.
    async fn run_cli(
        &self,
        args: &[String],
        stdin: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> ExecResult<CommandOutput> {
        let mut cmd = Command::new(&self.cli);
        cmd.args(args);
        run_child(cmd, stdin, timeout, self.output_limit)
            .await
            .map_err(|e| match e {
                // A missing CLI binary means the adapter itself is unusable.
                ExecError::TargetNotFound(reason) => ExecError::AdapterUnavailable {
                    adapter: AdapterKind::Docker,
                    reason,
                },
                other => other,
            })
    }

    /// Run a CLI invocation that is expected to succeed, classifying
    /// well-known failure messages.
    async fn run_checked(&self, args: &[String], image: &str) -> ExecResult<CommandOutput> {
        let output = self.run_cli(args, None, None).await?;
        if output.exit_code != 0 {
            let stderr = output.stderr_lossy();
            if let Some(classified) = classify_stderr(&stderr, image) {
                return Err(classified);
            }
            return Err(ExecError::ConnectionFailed(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                stderr.trim()
            )));
        }
        Ok(output)
    }

    pub async fn container_exists(&self, name: &str) -> ExecResult<bool> {
        let args = vec![
            "container".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            name.to_string(),
        ];
        let output = self.run_cli(&args, None, None).await?;
        Ok(output.exit_code == 0)
    }

    /// Create a container from `spec`; returns the (possibly generated) name.
    pub async fn create_container(&self, spec: &ContainerSpec) -> ExecResult<String> {
        if spec.image.is_empty() {
            return Err(ExecError::InvalidRequest("container spec requires an image".into()));
        }
        let name = spec.name.clone().unwrap_or_else(generated_name);

        let mut args = vec!["create".to_string(), "--name".to_string(), name.clone()];
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", port.host, port.container));
        }
        for volume in &spec.volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", volume.host.display(), volume.container.display()));
        }
        if let Some(workdir) = &spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.to_string_lossy().into_owned());
        }
        if let Some(user) = &spec.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        for (key, value) in &spec.labels {
            args.push("-l".to_string());
            args.push(format!("{key}={value}"));
        }
        if let Some(network) = &spec.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some(health) = &spec.healthcheck {
            args.push("--health-cmd".to_string());
            args.push(health.cmd.clone());
            args.push("--health-interval".to_string());
            args.push(format!("{}s", health.interval.as_secs().max(1)));
            args.push("--health-timeout".to_string());
            args.push(format!("{}s", health.timeout.as_secs().max(1)));
            args.push("--health-retries".to_string());
            args.push(health.retries.to_string());
        }
        args.push(spec.image.clone());
        if let Some(command) = &spec.command {
            args.extend(command.iter().cloned());
        }

        self.run_checked(&args, &spec.image).await?;
        tracing::debug!(container = %name, image = %spec.image, "container created");
        Ok(name)
    }

    pub async fn start_container(&self, name: &str) -> ExecResult<()> {
        let args = vec!["start".to_string(), name.to_string()];
        self.run_checked(&args, "").await?;
        Ok(())
    }

    pub async fn stop_container(&self, name: &str) -> ExecResult<()> {
        let args = vec!["stop".to_string(), name.to_string()];
        self.run_checked(&args, "").await?;
        Ok(())
    }

    pub async fn remove_container(&self, name: &str, force: bool) -> ExecResult<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(name.to_string());
        self.run_checked(&args, "").await?;
        Ok(())
    }

    /// List containers; running only unless `all`.
    pub async fn list_containers(&self, all: bool) -> ExecResult<Vec<ContainerSummary>> {
        let mut args = vec!["ps".to_string()];
        if all {
            args.push("-a".to_string());
        }
        args.push("--format".to_string());
        args.push("json".to_string());
        let output = self.run_checked(&args, "").await?;

        // Some client versions emit a JSON array, others one object per line.
        let stdout = output.to_stdout_string()?;
        if stdout.trim_start().starts_with('[') {
            return Ok(serde_json::from_str(&stdout).map_err(crate::command::result::OutputError::JsonError)?);
        }
        let mut summaries = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let summary: ContainerSummary = serde_json::from_str(line)
                .map_err(crate::command::result::OutputError::JsonError)?;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Full inspect document for the container.
    pub async fn inspect(&self, name: &str) -> ExecResult<serde_json::Value> {
        let args = vec!["container".to_string(), "inspect".to_string(), name.to_string()];
        let output = self.run_checked(&args, "").await?;
        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(crate::command::result::OutputError::JsonError)?;
        parsed
            .as_array()
            .and_then(|entries| entries.first().cloned())
            .ok_or_else(|| ExecError::TargetNotFound(format!("container '{name}' not found")))
    }

    /// Collected logs, stdout and stderr combined as the CLI emits them.
    pub async fn logs(&self, name: &str) -> ExecResult<String> {
        let args = vec!["logs".to_string(), name.to_string()];
        let output = self.run_checked(&args, "").await?;
        let mut text = output.to_stdout_string()?;
        text.push_str(&output.to_stderr_string()?);
        Ok(text)
    }

    async fn logs_stream(&self, name: &str, follow: bool) -> ExecResult<OutputStream> {
        let mut cmd = Command::new(&self.cli);
        cmd.arg("logs");
        if follow {
            cmd.arg("-f");
        }
        cmd.arg(name);
        spawn_line_stream(cmd).await
    }

    /// Push every existing log line to `on_chunk`, in arrival order.
    pub async fn stream_logs(
        &self,
        name: &str,
        mut on_chunk: impl FnMut(OutputLine) + Send,
    ) -> ExecResult<()> {
        let mut stream = self.logs_stream(name, false).await?;
        while let Some(line) = stream.next().await {
            on_chunk(line);
        }
        Ok(())
    }

    /// Stream logs as they are produced; the stream ends when the caller
    /// drops it or the container stops logging.
    pub async fn follow(&self, name: &str) -> ExecResult<OutputStream> {
        self.logs_stream(name, true).await
    }

    pub async fn copy_to(&self, name: &str, local: &Path, remote: &Path) -> ExecResult<()> {
        let args = vec![
            "cp".to_string(),
            local.to_string_lossy().into_owned(),
            format!("{}:{}", name, remote.display()),
        ];
        self.run_checked(&args, "")
            .await
            .map_err(transfer_error)?;
        Ok(())
    }

    pub async fn copy_from(&self, name: &str, remote: &Path, local: &Path) -> ExecResult<()> {
        let args = vec![
            "cp".to_string(),
            format!("{}:{}", name, remote.display()),
            local.to_string_lossy().into_owned(),
        ];
        self.run_checked(&args, "")
            .await
            .map_err(transfer_error)?;
        Ok(())
    }

    pub async fn stats(&self, name: &str) -> ExecResult<ContainerStats> {
        let args = vec![
            "stats".to_string(),
            "--no-stream".to_string(),
            "--format".to_string(),
            "json".to_string(),
            name.to_string(),
        ];
        let output = self.run_checked(&args, "").await?;
        let stdout = output.to_stdout_string()?;
        let line = stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| ExecError::TargetNotFound(format!("no stats for container '{name}'")))?;
        Ok(serde_json::from_str(line).map_err(crate::command::result::OutputError::JsonError)?)
    }

    /// IP address on the given network, or on the first attached network.
    pub async fn get_ip_address(&self, name: &str, network: Option<&str>) -> ExecResult<String> {
        let inspect = self.inspect(name).await?;
        let networks = inspect
            .pointer("/NetworkSettings/Networks")
            .and_then(|v| v.as_object())
            .ok_or_else(|| {
                ExecError::TargetNotFound(format!("container '{name}' has no network settings"))
            })?;

        let entry = match network {
            Some(wanted) => networks.get(wanted).ok_or_else(|| {
                ExecError::TargetNotFound(format!(
                    "container '{name}' is not attached to network '{wanted}'"
                ))
            })?,
            None => networks.values().next().ok_or_else(|| {
                ExecError::TargetNotFound(format!("container '{name}' has no networks"))
            })?,
        };

        entry
            .pointer("/IPAddress")
            .and_then(|v| v.as_str())
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                ExecError::TargetNotFound(format!("container '{name}' has no IP address"))
            })
    }

    /// Poll the runtime's health status until `healthy` or the timeout.
    pub async fn wait_for_healthy(&self, name: &str, timeout: Duration) -> ExecResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let inspect = self.inspect(name).await?;
            let health = inspect
                .pointer("/State/Health/Status")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if health == "healthy" {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ExecError::HealthCheckTimeout {
                    container: name.to_string(),
                    timeout,
                });
            }
            sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// Resolve the exec target, materialising an ephemeral container when
    /// the auto-create policy allows it.
    async fn resolve_container(&self, opts: &DockerOptions) -> ExecResult<String> {
        if !opts.container.is_empty() && self.container_exists(&opts.container).await? {
            return Ok(opts.container.clone());
        }

        let Some(auto) = &opts.auto_create else {
            return Err(ExecError::TargetNotFound(format!(
                "container '{}' does not exist",
                opts.container
            )));
        };

        let name = ephemeral_name();
        let spec = ContainerSpec {
            image: auto.image.clone(),
            name: Some(name.clone()),
            command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        };
        self.create_container(&spec).await?;
        self.start_container(&name).await?;
        self.ephemeral.lock().await.push(EphemeralContainer {
            name: name.clone(),
            image: auto.image.clone(),
            auto_remove: auto.auto_remove,
        });
        tracing::debug!(container = %name, image = %auto.image, "ephemeral container started");
        Ok(name)
    }
}

fn transfer_error(err: ExecError) -> ExecError {
    match err {
        ExecError::ConnectionFailed(msg) => ExecError::TransferFailed(msg),
        other => other,
    }
}

/// Build the argv for `docker exec` from the request.
fn exec_args(request: &CommandRequest, opts: &DockerOptions, container: &str) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if !request.stdin.is_null() {
        args.push("-i".to_string());
    }
    if opts.tty {
        args.push("-t".to_string());
    }
    if let Some(user) = &opts.user {
        args.push("-u".to_string());
        args.push(user.clone());
    }
    let workdir = opts.workdir.as_deref().or(request.cwd.as_deref());
    if let Some(dir) = workdir {
        args.push("-w".to_string());
        args.push(dir.to_string_lossy().into_owned());
    }
    let mut keys: Vec<&String> = request.env.keys().collect();
    keys.sort();
    for key in keys {
        args.push("-e".to_string());
        args.push(format!("{key}={}", request.env[key]));
    }
    args.push(container.to_string());

    match &request.shell {
        // The script string is handed to the in-container shell; args ignored.
        Shell::Default => {
            args.push("/bin/sh".to_string());
            args.push("-c".to_string());
            args.push(request.command.clone());
        }
        Shell::Path(path) => {
            args.push(path.clone());
            args.push("-c".to_string());
            args.push(request.command.clone());
        }
        Shell::Never => {
            if request.args.is_empty() {
                match shell_words::split(&request.command) {
                    Ok(parts) => args.extend(parts),
                    Err(_) => args.push(request.command.clone()),
                }
            } else {
                args.push(request.command.clone());
                args.extend(request.args.iter().cloned());
            }
        }
    }
    args
}

/// Spawn a CLI child and expose its output as a line stream. The child is
/// killed when the stream is dropped.
async fn spawn_line_stream(mut cmd: Command) -> ExecResult<OutputStream> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::ConnectionFailed(format!("failed to spawn process: {e}")))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (tx, rx) = mpsc::channel::<OutputLine>(64);

    if let Some(out) = stdout {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(OutputLine::Stdout(line)).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(err) = stderr {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(OutputLine::Stderr(line)).await.is_err() {
                    break;
                }
            }
        });
    }
    tokio::spawn(async move {
        tokio::select! {
            _ = child.wait() => {}
            _ = tx.closed() => {
                let _ = child.kill().await;
            }
        }
    });

    Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|line| (line, rx))
    })))
}

#[async_trait]
impl Adapter for DockerAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Docker
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            stdin: true,
            tty: true,
            copy: true,
            streaming_logs: true,
            port_forward: false,
            sudo: false,
            default_shell: "/bin/sh",
        }
    }

    async fn is_available(&self) -> bool {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Client.Version}}".to_string(),
        ];
        let Ok(output) = self.run_cli(&args, None, Some(Duration::from_secs(10))).await else {
            return false;
        };
        if output.exit_code != 0 {
            return false;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(captures) = VERSION_RE.captures(&stdout) else {
            return false;
        };
        match semver::Version::parse(&captures[0]) {
            Ok(version) => version >= MIN_DOCKER_VERSION,
            Err(_) => false,
        }
    }

    async fn execute(&self, request: &CommandRequest) -> ExecResult<ExecutionResult> {
        let TargetOptions::Docker(opts) = &request.target else {
            return Err(ExecError::InvalidRequest(
                "docker adapter received a non-docker target".into(),
            ));
        };
        check_capabilities(request, &self.capabilities(), self.kind())?;

        let container = self.resolve_container(opts).await?;
        let args = exec_args(request, opts, &container);
        let stdin = request.stdin.read_bytes().await?;
        let output = self.run_cli(&args, stdin, request.timeout).await?;

        if output.exit_code != 0 {
            if let Some(classified) = classify_stderr(&output.stderr_lossy(), "") {
                return Err(classified);
            }
        }

        tracing::debug!(
            container = %container,
            command = %request.display_command(),
            exit_code = output.exit_code,
            "docker exec completed"
        );

        Ok(ExecutionResult {
            command: request.display_command(),
            adapter: AdapterKind::Docker,
            target: Target::Container(container),
            output,
        })
    }

    async fn dispose(&self) -> ExecResult<()> {
        let ephemeral: Vec<EphemeralContainer> = self.ephemeral.lock().await.drain(..).collect();
        for container in ephemeral {
            if !container.auto_remove {
                continue;
            }
            if let Err(e) = self.remove_container(&container.name, true).await {
                tracing::warn!(container = %container.name, "ephemeral container removal failed: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::request::StdinSource;

    #[test]
    fn ephemeral_names_follow_convention() {
        let name = ephemeral_name();
        assert!(name.starts_with("temp-ush-"));
        assert_eq!(name.len(), "temp-ush-".len() + 8);

        let generated = generated_name();
        assert!(generated.starts_with("xec-"));
        assert_eq!(generated.split('-').count(), 3);
    }

    #[test]
    fn exec_args_include_env_user_and_workdir() {
        let mut request = CommandRequest {
            command: "echo hi".to_string(),
            shell: Shell::Default,
            ..Default::default()
        };
        request.env.insert("FOO".into(), "bar".into());
        let opts = DockerOptions {
            container: "app".into(),
            user: Some("deploy".into()),
            workdir: Some("/srv".into()),
            ..Default::default()
        };
        let args = exec_args(&request, &opts, "app");
        assert_eq!(
            args,
            vec![
                "exec", "-u", "deploy", "-w", "/srv", "-e", "FOO=bar", "app", "/bin/sh", "-c",
                "echo hi"
            ]
        );
    }

    #[test]
    fn exec_args_add_interactive_flag_for_stdin() {
        let request = CommandRequest {
            command: "cat".to_string(),
            stdin: StdinSource::from("data"),
            ..Default::default()
        };
        let opts = DockerOptions::new("app");
        let args = exec_args(&request, &opts, "app");
        assert_eq!(args[1], "-i");
    }

    #[test]
    fn exec_args_split_raw_commands_without_shell() {
        let request = CommandRequest {
            command: "ls -la /tmp".to_string(),
            ..Default::default()
        };
        let opts = DockerOptions::new("app");
        let args = exec_args(&request, &opts, "app");
        assert_eq!(args, vec!["exec", "app", "ls", "-la", "/tmp"]);
    }

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify_stderr("Error: No such container: ghost", ""),
            Some(ExecError::TargetNotFound(_))
        ));
        assert!(matches!(
            classify_stderr("Unable to find image 'nope:latest' locally", "nope:latest"),
            Some(ExecError::InvalidImage { .. })
        ));
        assert!(classify_stderr("some other failure", "").is_none());
    }

    #[test]
    fn request_cwd_is_workdir_fallback() {
        let request = CommandRequest {
            command: "pwd".to_string(),
            cwd: Some("/data".into()),
            ..Default::default()
        };
        let opts = DockerOptions::new("app");
        let args = exec_args(&request, &opts, "app");
        let pos = args.iter().position(|a| a == "-w").unwrap();
        assert_eq!(args[pos + 1], "/data");
    }
}
