use std::sync::Arc;

use crate::adapter::docker::DockerAdapter;
use crate::adapter::k8s::KubernetesAdapter;
use crate::adapter::local::LocalAdapter;
use crate::adapter::ssh::SshAdapter;
use crate::adapter::{Adapter, AdapterKind};
use crate::command::request::TargetOptions;
use crate::command::Command;
use crate::error::ExecResult;

struct EngineInner {
    local: Arc<LocalAdapter>,
    ssh: Arc<SshAdapter>,
    docker: Arc<DockerAdapter>,
    k8s: Arc<KubernetesAdapter>,
}

/// Front door of the crate: a write-once registry of the four adapters and
/// the factory for command builders. Cloning is cheap; all clones share
/// the same adapters and their pooled resources.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                local: Arc::new(LocalAdapter::new()),
                ssh: Arc::new(SshAdapter::new()),
                docker: Arc::new(DockerAdapter::new()),
                k8s: Arc::new(KubernetesAdapter::new()),
            }),
        }
    }

    /// Start building a command. The builder defaults to the local target.
    pub fn command(&self, command: impl Into<String>) -> Command {
        Command::new(self.clone(), command.into())
    }

    /// The adapter serving a given target selection.
    pub(crate) fn adapter_for(&self, target: &TargetOptions) -> Arc<dyn Adapter> {
        match target {
            TargetOptions::Local => self.inner.local.clone(),
            TargetOptions::Ssh(_) => self.inner.ssh.clone(),
            TargetOptions::Docker(_) => self.inner.docker.clone(),
            TargetOptions::Kubernetes(_) => self.inner.k8s.clone(),
        }
    }

    pub fn adapter(&self, kind: AdapterKind) -> Arc<dyn Adapter> {
        match kind {
            AdapterKind::Local => self.inner.local.clone(),
            AdapterKind::Ssh => self.inner.ssh.clone(),
            AdapterKind::Docker => self.inner.docker.clone(),
            AdapterKind::Kubernetes => self.inner.k8s.clone(),
        }
    }

    /// SSH adapter handle, for SFTP file transfer.
    pub fn ssh(&self) -> &SshAdapter {
        &self.inner.ssh
    }

    /// Docker adapter handle, for container lifecycle operations.
    pub fn docker(&self) -> &DockerAdapter {
        &self.inner.docker
    }

    /// Kubernetes adapter handle, for pod file copy.
    pub fn kubernetes(&self) -> &KubernetesAdapter {
        &self.inner.k8s
    }

    /// Release every adapter-owned resource: pooled SSH connections,
    /// ephemeral containers, leftover askpass helpers. The first error is
    /// reported but teardown continues across all adapters.
    pub async fn dispose(&self) -> ExecResult<()> {
        let mut first_error = None;
        for adapter in [
            self.adapter(AdapterKind::Ssh),
            self.adapter(AdapterKind::Docker),
            self.adapter(AdapterKind::Kubernetes),
            self.adapter(AdapterKind::Local),
        ] {
            if let Err(e) = adapter.dispose().await {
                tracing::warn!(adapter = %adapter.kind(), "dispose failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_selection_follows_target_tag() {
        let engine = Engine::new();
        assert_eq!(
            engine.adapter_for(&TargetOptions::Local).kind(),
            AdapterKind::Local
        );
        let ssh = TargetOptions::Ssh(crate::command::request::SshOptions::new("h", "u"));
        assert_eq!(engine.adapter_for(&ssh).kind(), AdapterKind::Ssh);
    }

    #[tokio::test]
    async fn clones_share_adapters() {
        let engine = Engine::new();
        let clone = engine.clone();
        assert!(Arc::ptr_eq(&engine.inner, &clone.inner));
    }
}
