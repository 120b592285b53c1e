use std::path::Path;

use async_trait::async_trait;

use super::local::run_child;
use super::{
    check_capabilities, compose_shell_script, Adapter, AdapterKind, Capabilities,
    DEFAULT_OUTPUT_LIMIT,
};
use crate::command::request::{CommandRequest, K8sOptions, Shell, TargetOptions};
use crate::command::result::{CommandOutput, ExecutionResult, Target};
use crate::error::{ExecError, ExecResult};

const DEFAULT_NAMESPACE: &str = "default";

/// Copy direction for [`KubernetesAdapter::copy_files`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// Local path into the pod.
    To,
    /// Pod path onto the local filesystem.
    From,
}

/// Executes commands inside pods through the kubectl CLI.
///
/// Executions with distinct container selectors on the same pod are
/// independent; the adapter shares no state between them.
pub struct KubernetesAdapter {
    output_limit: usize,
}

impl Default for KubernetesAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl KubernetesAdapter {
    pub fn new() -> Self {
        Self {
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    fn kubectl(opts: &K8sOptions) -> String {
        opts.kubectl_path
            .clone()
            .unwrap_or_else(|| "kubectl".to_string())
    }

    fn namespace(opts: &K8sOptions) -> &str {
        opts.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Global flags shared by every kubectl invocation.
    fn base_args(opts: &K8sOptions) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(kubeconfig) = &opts.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.to_string_lossy().into_owned());
        }
        args
    }

    async fn run_kubectl(
        &self,
        opts: &K8sOptions,
        args: Vec<String>,
        stdin: Option<Vec<u8>>,
        timeout: Option<std::time::Duration>,
    ) -> ExecResult<CommandOutput> {
        let mut cmd = tokio::process::Command::new(Self::kubectl(opts));
        cmd.args(args);
        run_child(cmd, stdin, timeout, self.output_limit)
            .await
            .map_err(|e| match e {
                ExecError::TargetNotFound(reason) => ExecError::AdapterUnavailable {
                    adapter: AdapterKind::Kubernetes,
                    reason,
                },
                other => other,
            })
    }

    /// Copy a file between the local filesystem and a pod via `kubectl cp`.
    /// Bytes and mode are preserved in both directions.
    pub async fn copy_files(
        &self,
        opts: &K8sOptions,
        source: &Path,
        destination: &Path,
        direction: CopyDirection,
    ) -> ExecResult<()> {
        let namespace = Self::namespace(opts);
        let mut args = Self::base_args(opts);
        args.push("cp".to_string());
        match direction {
            CopyDirection::To => {
                args.push(source.to_string_lossy().into_owned());
                args.push(format!("{namespace}/{}:{}", opts.pod, destination.display()));
            }
            CopyDirection::From => {
                args.push(format!("{namespace}/{}:{}", opts.pod, source.display()));
                args.push(destination.to_string_lossy().into_owned());
            }
        }
        if let Some(container) = &opts.container {
            args.push("-c".to_string());
            args.push(container.clone());
        }

        let output = self.run_kubectl(opts, args, None, None).await?;
        if output.exit_code != 0 {
            let stderr = output.stderr_lossy();
            if is_not_found(&stderr) {
                return Err(ExecError::TargetNotFound(stderr.trim().to_string()));
            }
            return Err(ExecError::TransferFailed(stderr.trim().to_string()));
        }
        Ok(())
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("notfound") || lowered.contains("not found")
}

/// Build the argv for `kubectl exec` from the request.
fn exec_args(request: &CommandRequest, opts: &K8sOptions) -> Vec<String> {
    let mut args = KubernetesAdapter::base_args(opts);
    args.push("exec".to_string());
    if !request.stdin.is_null() {
        args.push("-i".to_string());
    }
    args.push("-n".to_string());
    args.push(KubernetesAdapter::namespace(opts).to_string());
    args.push(opts.pod.clone());
    if let Some(container) = &opts.container {
        args.push("-c".to_string());
        args.push(container.clone());
    }
    args.push("--".to_string());

    // kubectl exec has no env or workdir flags; both travel inside a
    // shell script when needed. A named shell becomes the runner itself,
    // so it is visible as $0 inside the command.
    let needs_wrap = !request.env.is_empty()
        || request.cwd.is_some()
        || !matches!(request.shell, Shell::Never);
    if needs_wrap {
        let runner = match &request.shell {
            Shell::Path(path) => path.clone(),
            _ => "/bin/sh".to_string(),
        };
        let body_shell = match &request.shell {
            Shell::Never => Shell::Never,
            _ => Shell::Default,
        };
        let script = compose_shell_script(
            &request.env,
            request.cwd.as_deref(),
            &body_shell,
            &request.command,
            &request.args,
        );
        args.push(runner);
        args.push("-c".to_string());
        args.push(script);
    } else if request.args.is_empty() {
        match shell_words::split(&request.command) {
            Ok(parts) => args.extend(parts),
            Err(_) => args.push(request.command.clone()),
        }
    } else {
        args.push(request.command.clone());
        args.extend(request.args.iter().cloned());
    }
    args
}

#[async_trait]
impl Adapter for KubernetesAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Kubernetes
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
        let opts = K8sOptions::default();
        let args = vec!["version".to_string(), "--client".to_string()];
        match self
            .run_kubectl(&opts, args, None, Some(std::time::Duration::from_secs(10)))
            .await
        {
            Ok(output) => output.exit_code == 0,
            Err(_) => false,
        }
    }

    async fn execute(&self, request: &CommandRequest) -> ExecResult<ExecutionResult> {
        let TargetOptions::Kubernetes(opts) = &request.target else {
            return Err(ExecError::InvalidRequest(
                "kubernetes adapter received a non-kubernetes target".into(),
            ));
        };
        check_capabilities(request, &self.capabilities(), self.kind())?;

        let args = exec_args(request, opts);
        let stdin = request.stdin.read_bytes().await?;
        let output = self.run_kubectl(opts, args, stdin, request.timeout).await?;

        if output.exit_code != 0 && is_not_found(&output.stderr_lossy()) {
            return Err(ExecError::TargetNotFound(
                output.stderr_lossy().trim().to_string(),
            ));
        }

        tracing::debug!(
            pod = %opts.pod,
            namespace = %KubernetesAdapter::namespace(opts),
            command = %request.display_command(),
            exit_code = output.exit_code,
            "kubectl exec completed"
        );

        Ok(ExecutionResult {
            command: request.display_command(),
            adapter: AdapterKind::Kubernetes,
            target: Target::Pod {
                name: opts.pod.clone(),
                namespace: KubernetesAdapter::namespace(opts).to_string(),
            },
            output,
        })
    }

    async fn dispose(&self) -> ExecResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str) -> CommandRequest {
        CommandRequest {
            command: command.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn exec_args_direct_argv() {
        let opts = K8sOptions::new("api-pod");
        let args = exec_args(&request("echo hello"), &opts);
        assert_eq!(
            args,
            vec!["exec", "-n", "default", "api-pod", "--", "echo", "hello"]
        );
    }

    #[test]
    fn exec_args_with_namespace_and_container() {
        let opts = K8sOptions::new("multi-pod")
            .namespace("staging")
            .container("sidecar");
        let args = exec_args(&request("echo hi"), &opts);
        assert_eq!(
            args,
            vec![
                "exec", "-n", "staging", "multi-pod", "-c", "sidecar", "--", "echo", "hi"
            ]
        );
    }

    #[test]
    fn exec_args_wrap_shell_scripts() {
        let mut req = request("echo $((1+1))");
        req.shell = Shell::Default;
        let opts = K8sOptions::new("pod");
        let args = exec_args(&req, &opts);
        assert_eq!(
            args[args.len() - 3..],
            ["/bin/sh", "-c", "echo $((1+1))"].map(String::from)
        );
    }

    #[test]
    fn exec_args_use_named_shell() {
        let mut req = request("echo $0");
        req.shell = Shell::Path("/bin/bash".into());
        let opts = K8sOptions::new("pod");
        let args = exec_args(&req, &opts);
        assert!(args.contains(&"/bin/bash".to_string()));
        assert_eq!(args.last().unwrap(), "echo $0");
    }

    #[test]
    fn exec_args_env_travels_in_script() {
        let mut req = request("echo $FOO");
        req.env.insert("FOO".into(), "bar".into());
        let opts = K8sOptions::new("pod");
        let args = exec_args(&req, &opts);
        let script = args.last().unwrap();
        assert!(script.starts_with("export FOO=bar; "));
    }

    #[test]
    fn exec_args_include_kubeconfig_first() {
        let mut opts = K8sOptions::new("pod");
        opts.kubeconfig = Some("/etc/kube/config".into());
        let args = exec_args(&request("true"), &opts);
        assert_eq!(args[0], "--kubeconfig");
        assert_eq!(args[1], "/etc/kube/config");
    }

    #[test]
    fn stdin_adds_interactive_flag() {
        let mut req = request("cat");
        req.stdin = crate::command::request::StdinSource::from("x");
        let opts = K8sOptions::new("pod");
        let args = exec_args(&req, &opts);
        assert_eq!(args[1], "-i");
    }

    #[test]
    fn copy_target_format() {
        // kubectl cp addresses pod paths as namespace/pod:path
        let opts = K8sOptions::new("api").namespace("prod");
        assert_eq!(
            format!(
                "{}/{}:{}",
                KubernetesAdapter::namespace(&opts),
                opts.pod,
                "/tmp/file"
            ),
            "prod/api:/tmp/file"
        );
    }
}
