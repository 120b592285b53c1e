pub mod docker;
pub mod k8s;
pub mod local;
pub mod ssh;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::command::request::{CommandRequest, Shell};
use crate::command::result::ExecutionResult;
use crate::error::{ExecError, ExecResult};

/// Captured output above this many bytes per stream fails the execution.
pub const DEFAULT_OUTPUT_LIMIT: usize = 10 * 1024 * 1024; // 10 MiB

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Local,
    Ssh,
    Docker,
    Kubernetes,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            AdapterKind::Local => "local",
            AdapterKind::Ssh => "ssh",
            AdapterKind::Docker => "docker",
            AdapterKind::Kubernetes => "kubernetes",
        };
        f.write_str(tag)
    }
}

/// Static capability descriptor. Requests needing an unsupported capability
/// are rejected at validation time rather than at execution time.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub stdin: bool,
    pub tty: bool,
    pub copy: bool,
    pub streaming_logs: bool,
    pub port_forward: bool,
    pub sudo: bool,
    pub default_shell: &'static str,
}

/// One line of streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Pull-style output sequence; lines arrive in production order and the
/// stream ends exactly once.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputLine> + Send>>;

/// Uniform contract over the four execution backends.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    fn capabilities(&self) -> Capabilities;

    /// Best-effort probe: client binary present, daemon reachable.
    async fn is_available(&self) -> bool;

    /// Run one command to completion. Non-zero exits are returned as
    /// normal results; raising `CommandFailed` is the dispatcher's job.
    async fn execute(&self, request: &CommandRequest) -> ExecResult<ExecutionResult>;

    /// Release every owned resource: pooled connections, ephemeral
    /// containers, askpass helpers.
    async fn dispose(&self) -> ExecResult<()>;
}

/// Build the shell script a remote runner executes: env exports and a `cd`
/// prefix, then the command wrapped per the shell selection. Used by the
/// SSH and kubernetes adapters, where env cannot be passed out-of-band.
pub(crate) fn compose_shell_script(
    env: &HashMap<String, String>,
    cwd: Option<&Path>,
    shell: &Shell,
    command: &str,
    args: &[String],
) -> String {
    let mut script = String::new();
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    for key in keys {
        script.push_str("export ");
        script.push_str(key);
        script.push('=');
        script.push_str(&shell_words::quote(&env[key]));
        script.push_str("; ");
    }
    if let Some(dir) = cwd {
        script.push_str("cd ");
        script.push_str(&shell_words::quote(&dir.to_string_lossy()));
        script.push_str(" && ");
    }
    match shell {
        // The remote login shell interprets the raw string; args ignored.
        Shell::Default => script.push_str(command),
        Shell::Path(path) => {
            script.push_str(&shell_words::quote(path));
            script.push_str(" -c ");
            script.push_str(&shell_words::quote(command));
        }
        Shell::Never => {
            if args.is_empty() {
                script.push_str(command);
            } else {
                script.push_str(&shell_words::quote(command));
                script.push(' ');
                script.push_str(&shell_words::join(args));
            }
        }
    }
    script
}

/// Validate a request against an adapter's declared capabilities.
pub(crate) fn check_capabilities(
    request: &CommandRequest,
    caps: &Capabilities,
    kind: AdapterKind,
) -> ExecResult<()> {
    if !request.stdin.is_null() && !caps.stdin {
        return Err(ExecError::InvalidRequest(format!(
            "{kind} adapter does not support stdin"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn script_prefixes_env_and_cwd() {
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "a b".to_string());
        let cwd = PathBuf::from("/srv/app");
        let script = compose_shell_script(
            &env,
            Some(cwd.as_path()),
            &Shell::Default,
            "echo $FOO",
            &[],
        );
        assert_eq!(script, "export FOO='a b'; cd /srv/app && echo $FOO");
    }

    #[test]
    fn script_wraps_explicit_shell() {
        let script = compose_shell_script(
            &HashMap::new(),
            None,
            &Shell::Path("/bin/bash".into()),
            "echo $0",
            &[],
        );
        assert_eq!(script, "/bin/bash -c 'echo $0'");
    }

    #[test]
    fn script_quotes_argv_without_shell() {
        let script = compose_shell_script(
            &HashMap::new(),
            None,
            &Shell::Never,
            "echo",
            &["hello world".to_string()],
        );
        assert_eq!(script, "echo 'hello world'");
    }

    #[test]
    fn env_exports_are_deterministic() {
        let mut env = HashMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        let script = compose_shell_script(&env, None, &Shell::Default, "true", &[]);
        assert_eq!(script, "export A=1; export B=2; true");
    }
}
