//! Unified command execution across heterogeneous targets.
//!
//! One fluent, immutable builder runs shell commands on the local host,
//! remote hosts over SSH, containers through the docker CLI, and pods
//! through kubectl, with uniform result and error semantics:
//!
//! ```no_run
//! # async fn demo() -> uxec::ExecResult<()> {
//! let engine = uxec::Engine::new();
//!
//! // Local
//! let result = engine.command("echo hello").shell(true).run().await?;
//! assert_eq!(result.output.to_stdout_string()?, "hello\n");
//!
//! // Remote, with sudo via a short-lived askpass helper
//! use uxec::{SshOptions, SudoOptions, SudoMethod};
//! let mut opts = SshOptions::new("web1.example.com", "deploy");
//! opts.sudo = Some(SudoOptions {
//!     password: Some("secret".into()),
//!     method: SudoMethod::SecureAskpass,
//!     user: None,
//! });
//! engine.command("systemctl restart app").ssh(opts).run().await?;
//!
//! engine.dispose().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Non-zero exits raise [`ExecError::CommandFailed`] unless the builder is
//! marked `nothrow()`. Retry policies re-attempt command-level failures
//! with exponential backoff; timeouts are only retried when the policy
//! opts in.

pub mod adapter;
pub mod command;
pub mod engine;
pub mod error;
pub mod secure;

pub use adapter::docker::{
    ContainerSpec, ContainerStats, ContainerSummary, DockerAdapter, Healthcheck, PortBinding,
    VolumeBinding,
};
pub use adapter::k8s::{CopyDirection, KubernetesAdapter};
pub use adapter::local::LocalAdapter;
pub use adapter::ssh::SshAdapter;
pub use adapter::{Adapter, AdapterKind, Capabilities, OutputLine, OutputStream};
pub use command::request::{
    AutoCreate, CommandRequest, DockerOptions, K8sOptions, RetryPolicy, Shell, SshAuth,
    SshOptions, StdinSource, SudoMethod, SudoOptions, TargetOptions,
};
pub use command::result::{CommandOutput, ExecutionResult, OutputError, Target};
pub use command::Command;
pub use engine::Engine;
pub use error::{ExecError, ExecResult};
pub use secure::{
    generate_password, mask_password, validate_password, AskpassSession, PasswordValidation,
    SecurePasswordHandler, MASK,
};
