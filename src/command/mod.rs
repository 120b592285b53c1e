pub mod request;
pub mod result;
mod retry;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use request::{
    CommandRequest, DockerOptions, K8sOptions, RetryPolicy, Shell, SshOptions, StdinSource,
    TargetOptions,
};
use result::ExecutionResult;

use crate::engine::Engine;
use crate::error::{ExecError, ExecResult};

/// Immutable fluent builder for one command invocation.
///
/// Every modifier consumes the builder and returns a new one with the
/// merged configuration; `Command` is `Clone`, so a configured base can be
/// branched freely without shared mutable state:
///
/// ```no_run
/// # async fn demo() -> uxec::ExecResult<()> {
/// let engine = uxec::Engine::new();
/// let base = engine.command("systemctl status app").timeout(std::time::Duration::from_secs(5));
/// let on_web = base.clone().ssh(uxec::SshOptions::new("web1", "deploy"));
/// let result = on_web.run().await?;
/// println!("{}", result.output.to_stdout_string()?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Command {
    engine: Engine,
    request: CommandRequest,
}

impl Command {
    pub(crate) fn new(engine: Engine, command: String) -> Self {
        Self {
            engine,
            request: CommandRequest {
                command,
                ..Default::default()
            },
        }
    }

    /// Append one argument (only meaningful with `shell = Never`).
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.request.args.push(arg.into());
        self
    }

    /// Append multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.env.insert(key.into(), value.into());
        self
    }

    /// Shallow-merge a map of environment variables.
    pub fn envs(mut self, vars: HashMap<String, String>) -> Self {
        self.request.env.extend(vars);
        self
    }

    /// Set the working directory, interpreted on the target.
    pub fn cd(mut self, path: impl Into<PathBuf>) -> Self {
        self.request.cwd = Some(path.into());
        self
    }

    /// Set or replace the execution timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request.timeout = Some(timeout);
        self
    }

    /// Select shell interpretation: `true`, `false`, or a shell path.
    pub fn shell(mut self, shell: impl Into<Shell>) -> Self {
        self.request.shell = shell.into();
        self
    }

    /// Feed stdin from a string, byte buffer, or lazy reader.
    pub fn stdin(mut self, stdin: impl Into<StdinSource>) -> Self {
        self.request.stdin = stdin.into();
        self
    }

    /// Install a retry policy for command-level failures.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.request.retry = Some(policy);
        self
    }

    /// Return non-zero exits as normal results instead of raising.
    pub fn nothrow(mut self) -> Self {
        self.request.nothrow = true;
        self
    }

    /// Bind the command to a remote host over SSH.
    pub fn ssh(mut self, opts: SshOptions) -> Self {
        self.request.target = TargetOptions::Ssh(opts);
        self
    }

    /// Bind the command to a container.
    pub fn docker(mut self, opts: DockerOptions) -> Self {
        self.request.target = TargetOptions::Docker(opts);
        self
    }

    /// Bind the command to a pod.
    pub fn k8s(mut self, pod: impl Into<String>, mut opts: K8sOptions) -> Self {
        opts.pod = pod.into();
        self.request.target = TargetOptions::Kubernetes(opts);
        self
    }

    /// The request this builder would dispatch.
    pub fn request(&self) -> &CommandRequest {
        &self.request
    }

    /// Replace the command string and run, for reusing a configured builder.
    pub async fn exec(mut self, command: impl Into<String>) -> ExecResult<ExecutionResult> {
        self.request.command = command.into();
        self.run().await
    }

    /// Dispatch the command: select the adapter for the target, execute
    /// under the retry policy, then apply nothrow semantics.
    pub async fn run(self) -> ExecResult<ExecutionResult> {
        self.request.validate()?;
        let adapter = self.engine.adapter_for(&self.request.target);

        let request = &self.request;
        let result = retry::execute_with_retry(request.retry.as_ref(), |attempt| {
            let adapter = adapter.clone();
            async move {
                if attempt > 0 {
                    tracing::debug!(
                        attempt,
                        command = %request.display_command(),
                        "retrying command"
                    );
                }
                adapter.execute(request).await
            }
        })
        .await?;

        if !result.is_success() && !self.request.nothrow {
            return Err(ExecError::CommandFailed {
                result: Box::new(result),
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder(command: &str) -> Command {
        Engine::new().command(command)
    }

    #[test]
    fn modifiers_accumulate_into_the_request() {
        let cmd = builder("deploy")
            .env("A", "1")
            .env("B", "2")
            .cd("/srv")
            .timeout(Duration::from_secs(3))
            .nothrow();
        let request = cmd.request();
        assert_eq!(request.env.len(), 2);
        assert_eq!(request.cwd.as_deref(), Some(std::path::Path::new("/srv")));
        assert_eq!(request.timeout, Some(Duration::from_secs(3)));
        assert!(request.nothrow);
    }

    #[test]
    fn clones_branch_independently() {
        let base = builder("echo hi").env("SHARED", "yes");
        let with_timeout = base.clone().timeout(Duration::from_secs(1));
        let with_cwd = base.clone().cd("/tmp");

        assert!(base.request().timeout.is_none());
        assert!(base.request().cwd.is_none());
        assert!(with_timeout.request().timeout.is_some());
        assert!(with_cwd.request().cwd.is_some());
        assert_eq!(with_timeout.request().env["SHARED"], "yes");
    }

    #[test]
    fn target_selectors_rebind_the_builder() {
        let cmd = builder("uptime").ssh(SshOptions::new("db1", "ops"));
        assert!(matches!(cmd.request().target, TargetOptions::Ssh(_)));

        let cmd = builder("uptime").docker(DockerOptions::new("app"));
        assert!(matches!(cmd.request().target, TargetOptions::Docker(_)));

        let cmd = builder("uptime").k8s("api", K8sOptions::default().namespace("prod"));
        match &cmd.request().target {
            TargetOptions::Kubernetes(opts) => {
                assert_eq!(opts.pod, "api");
                assert_eq!(opts.namespace.as_deref(), Some("prod"));
            }
            other => panic!("unexpected target: {other:?}"),
        }
    }

    #[test]
    fn env_merge_is_shallow_and_last_wins() {
        let mut overlay = HashMap::new();
        overlay.insert("A".to_string(), "overridden".to_string());
        let cmd = builder("true").env("A", "first").envs(overlay);
        assert_eq!(cmd.request().env["A"], "overridden");
    }
}
