use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `hostPort:containerPort` publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
}

/// `hostPath -> containerPath` bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub host: PathBuf,
    pub container: PathBuf,
}

/// Container-level health probe description.
#[derive(Debug, Clone)]
pub struct Healthcheck {
    pub cmd: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

/// Request for `create_container`. A missing `name` is auto-generated.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub name: Option<String>,
    pub env: HashMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub volumes: Vec<VolumeBinding>,
    pub workdir: Option<PathBuf>,
    pub user: Option<String>,
    pub labels: HashMap<String, String>,
    pub network: Option<String>,
    pub healthcheck: Option<Healthcheck>,
    /// Command override appended after the image.
    pub command: Option<Vec<String>>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }
}

/// One entry of `docker ps --format json` (line-delimited JSON objects).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Names")]
    pub names: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Command", default)]
    pub command: String,
    #[serde(rename = "CreatedAt", default)]
    pub created_at: String,
    #[serde(rename = "Ports", default)]
    pub ports: String,
    #[serde(rename = "Networks", default)]
    pub networks: String,
    #[serde(rename = "Labels", default)]
    pub labels: String,
}

impl ContainerSummary {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// One entry of `docker stats --no-stream --format json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStats {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "CPUPerc")]
    pub cpu_percent: String,
    #[serde(rename = "MemUsage")]
    pub memory_usage: String,
    #[serde(rename = "MemPerc")]
    pub memory_percent: String,
    #[serde(rename = "NetIO", default)]
    pub net_io: String,
    #[serde(rename = "BlockIO", default)]
    pub block_io: String,
    #[serde(rename = "PIDs", default)]
    pub pids: String,
}

/// A container this adapter materialised on demand; removed on dispose
/// when `auto_remove` is set.
#[derive(Debug, Clone)]
pub(crate) struct EphemeralContainer {
    pub name: String,
    pub image: String,
    pub auto_remove: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_json_line_parses() {
        let line = r#"{"Command":"\"sleep infinity\"","CreatedAt":"2026-07-30 11:02:15 +0000 UTC","ID":"2af3","Image":"alpine:3.20","Labels":"","LocalVolumes":"0","Mounts":"","Names":"worker-1","Networks":"bridge","Ports":"","RunningFor":"2 hours ago","Size":"0B","State":"running","Status":"Up 2 hours"}"#;
        let summary: ContainerSummary = serde_json::from_str(line).unwrap();
        assert_eq!(summary.names, "worker-1");
        assert!(summary.is_running());
    }

    #[test]
    fn stats_json_parses() {
        let line = r#"{"BlockIO":"0B / 0B","CPUPerc":"0.02%","Container":"2af3","ID":"2af3","MemPerc":"0.11%","MemUsage":"2.1MiB / 15.6GiB","Name":"worker-1","NetIO":"796B / 0B","PIDs":"1"}"#;
        let stats: ContainerStats = serde_json::from_str(line).unwrap();
        assert_eq!(stats.name, "worker-1");
        assert_eq!(stats.cpu_percent, "0.02%");
    }
}
