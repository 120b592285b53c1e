use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ExecError, ExecResult};

/// How the command string is interpreted by the adapter.
///
/// With `Default` or `Path`, `command` is handed to the shell as a single
/// script argument and `args` is ignored. With `Never`, `command` names the
/// executable (split with shell rules when `args` is empty).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Shell {
    #[default]
    Never,
    Default,
    Path(String),
}

impl From<bool> for Shell {
    fn from(value: bool) -> Self {
        if value {
            Shell::Default
        } else {
            Shell::Never
        }
    }
}

impl From<&str> for Shell {
    fn from(value: &str) -> Self {
        Shell::Path(value.to_string())
    }
}

impl From<String> for Shell {
    fn from(value: String) -> Self {
        Shell::Path(value)
    }
}

type ReaderFactory =
    Arc<dyn Fn() -> Pin<Box<dyn AsyncRead + Send>> + Send + Sync>;

/// Stdin fed to the command. `Reader` is a lazy source, opened only when the
/// adapter starts the invocation.
#[derive(Clone, Default)]
pub enum StdinSource {
    #[default]
    Null,
    Text(String),
    Bytes(Vec<u8>),
    Reader(ReaderFactory),
}

impl fmt::Debug for StdinSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StdinSource::Null => write!(f, "Null"),
            StdinSource::Text(t) => write!(f, "Text({} bytes)", t.len()),
            StdinSource::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            StdinSource::Reader(_) => write!(f, "Reader(..)"),
        }
    }
}

impl From<&str> for StdinSource {
    fn from(value: &str) -> Self {
        StdinSource::Text(value.to_string())
    }
}

impl From<String> for StdinSource {
    fn from(value: String) -> Self {
        StdinSource::Text(value)
    }
}

impl From<Vec<u8>> for StdinSource {
    fn from(value: Vec<u8>) -> Self {
        StdinSource::Bytes(value)
    }
}

impl StdinSource {
    pub fn is_null(&self) -> bool {
        matches!(self, StdinSource::Null)
    }

    /// Materialise the stdin payload. Lazy readers are drained here.
    pub async fn read_bytes(&self) -> ExecResult<Option<Vec<u8>>> {
        match self {
            StdinSource::Null => Ok(None),
            StdinSource::Text(text) => Ok(Some(text.clone().into_bytes())),
            StdinSource::Bytes(bytes) => Ok(Some(bytes.clone())),
            StdinSource::Reader(factory) => {
                let mut reader = factory();
                let mut buf = Vec::new();
                reader
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e| ExecError::InvalidRequest(format!("stdin reader failed: {e}")))?;
                Ok(Some(buf))
            }
        }
    }
}

/// Authentication for an SSH target. `Auto` probes `~/.ssh/id_rsa` and
/// `~/.ssh/id_ed25519` in order.
#[derive(Clone)]
pub enum SshAuth {
    Auto,
    Password(String),
    Key(PathBuf),
    Agent,
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Auto => write!(f, "Auto"),
            SshAuth::Password(_) => write!(f, "Password(***)"),
            SshAuth::Key(path) => write!(f, "Key({})", path.display()),
            SshAuth::Agent => write!(f, "Agent"),
        }
    }
}

/// Privilege escalation strategy for SSH commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SudoMethod {
    /// `sudo -S` with the password written to the channel before stdin.
    Stdin,
    /// `echo <password> | sudo -S`. The password is visible in remote
    /// process listings; a warning is logged once per process.
    Echo,
    /// Short-lived remote askpass helper fed through an environment
    /// variable (`sudo -A`).
    #[default]
    SecureAskpass,
}

#[derive(Clone, Default)]
pub struct SudoOptions {
    pub password: Option<String>,
    pub method: SudoMethod,
    /// Run as this user instead of root.
    pub user: Option<String>,
}

impl fmt::Debug for SudoOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SudoOptions")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("method", &self.method)
            .field("user", &self.user)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    pub sudo: Option<SudoOptions>,
    /// Interval for transport-level keepalive pings.
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    pub suppress_unknown_host_warning: bool,
}

impl SshOptions {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth: SshAuth::Auto,
            sudo: None,
            keepalive: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(30),
            suppress_unknown_host_warning: false,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn auth(mut self, auth: SshAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn sudo(mut self, sudo: SudoOptions) -> Self {
        self.sudo = Some(sudo);
        self
    }
}

/// Policy for materialising a missing container before execution.
#[derive(Debug, Clone)]
pub struct AutoCreate {
    pub image: String,
    /// Remove the ephemeral container on adapter dispose.
    pub auto_remove: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DockerOptions {
    pub container: String,
    pub user: Option<String>,
    /// Overrides the request `cwd` inside the container.
    pub workdir: Option<PathBuf>,
    pub tty: bool,
    pub auto_create: Option<AutoCreate>,
}

impl DockerOptions {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct K8sOptions {
    pub pod: String,
    pub namespace: Option<String>,
    /// Container selector; defaults to the pod's first container.
    pub container: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub kubectl_path: Option<String>,
}

impl K8sOptions {
    pub fn new(pod: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            ..Default::default()
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

/// Backend selection, discriminated by variant.
#[derive(Debug, Clone, Default)]
pub enum TargetOptions {
    #[default]
    Local,
    Ssh(SshOptions),
    Docker(DockerOptions),
    Kubernetes(K8sOptions),
}

/// Retry policy with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Option<Duration>,
    /// Multiplier applied to the delay after each attempt.
    pub backoff: f64,
    /// Timeouts are not retried unless this is set.
    pub retry_on_timeout: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: None,
            backoff: 2.0,
            retry_on_timeout: false,
        }
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }
}

/// Immutable value describing one invocation. Built by
/// [`crate::command::Command`], consumed by adapters.
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    pub command: String,
    pub args: Vec<String>,
    pub shell: Shell,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub stdin: StdinSource,
    pub timeout: Option<Duration>,
    pub nothrow: bool,
    pub retry: Option<RetryPolicy>,
    pub target: TargetOptions,
}

impl CommandRequest {
    /// The command as it should appear in results and error messages.
    pub fn display_command(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, shell_words::join(&self.args))
        }
    }

    /// Reject contradictory or incomplete requests before dispatch.
    pub fn validate(&self) -> ExecResult<()> {
        if self.command.trim().is_empty() {
            return Err(ExecError::InvalidRequest("empty command".into()));
        }
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(ExecError::InvalidRequest(
                    "timeout must be positive".into(),
                ));
            }
        }
        match &self.target {
            TargetOptions::Ssh(opts) => {
                if opts.host.is_empty() || opts.username.is_empty() {
                    return Err(ExecError::InvalidRequest(
                        "ssh target requires host and username".into(),
                    ));
                }
                if let Some(sudo) = &opts.sudo {
                    if sudo.password.is_none() {
                        return Err(ExecError::InvalidRequest(
                            "sudo requires a password".into(),
                        ));
                    }
                }
            }
            TargetOptions::Docker(opts) => {
                if opts.container.is_empty() && opts.auto_create.is_none() {
                    return Err(ExecError::InvalidRequest(
                        "docker target requires a container name or an auto-create policy"
                            .into(),
                    ));
                }
            }
            TargetOptions::Kubernetes(opts) => {
                if opts.pod.is_empty() {
                    return Err(ExecError::InvalidRequest(
                        "kubernetes target requires a pod name".into(),
                    ));
                }
            }
            TargetOptions::Local => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_conversions() {
        assert_eq!(Shell::from(true), Shell::Default);
        assert_eq!(Shell::from(false), Shell::Never);
        assert_eq!(Shell::from("/bin/bash"), Shell::Path("/bin/bash".into()));
    }

    #[test]
    fn debug_never_prints_credentials() {
        let auth = SshAuth::Password("hunter2secret".into());
        assert!(!format!("{auth:?}").contains("hunter2secret"));

        let sudo = SudoOptions {
            password: Some("hunter2secret".into()),
            ..Default::default()
        };
        assert!(!format!("{sudo:?}").contains("hunter2secret"));
    }

    #[test]
    fn validate_rejects_empty_command() {
        let request = CommandRequest::default();
        assert!(matches!(
            request.validate(),
            Err(crate::error::ExecError::InvalidRequest(_))
        ));
    }

    #[test]
    fn validate_rejects_sudo_without_password() {
        let mut opts = SshOptions::new("host", "user");
        opts.sudo = Some(SudoOptions::default());
        let request = CommandRequest {
            command: "whoami".into(),
            target: TargetOptions::Ssh(opts),
            ..Default::default()
        };
        assert!(request.validate().is_err());
    }

    #[tokio::test]
    async fn stdin_sources_materialise() {
        assert_eq!(StdinSource::Null.read_bytes().await.unwrap(), None);
        assert_eq!(
            StdinSource::from("hi").read_bytes().await.unwrap(),
            Some(b"hi".to_vec())
        );
        let lazy = StdinSource::Reader(Arc::new(|| {
            Box::pin(std::io::Cursor::new(b"lazy".to_vec()))
        }));
        assert_eq!(lazy.read_bytes().await.unwrap(), Some(b"lazy".to_vec()));
    }

    #[test]
    fn display_command_joins_args() {
        let request = CommandRequest {
            command: "echo".into(),
            args: vec!["hello world".into()],
            ..Default::default()
        };
        assert_eq!(request.display_command(), "echo 'hello world'");
    }
}
