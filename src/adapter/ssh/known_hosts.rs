use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use colored::*;
use russh::keys::{self, PublicKeyBase64};
use russh::client;
use tokio::fs;

use crate::error::{ExecError, ExecResult};

pub(crate) type KnownHosts = HashMap<String, Vec<keys::PublicKey>>;

/// Parses a single line from a known_hosts file.
fn parse_known_host_line(line: &str) -> Option<(Vec<String>, keys::PublicKey)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return None;
    }

    let hosts = parts[0].split(',').map(String::from).collect();
    match keys::parse_public_key_base64(parts[2]) {
        Ok(key) => Some((hosts, key)),
        Err(_) => {
            tracing::warn!("Failed to parse public key from known_hosts line '{}'", line);
            None
        }
    }
}

/// Loads known hosts from the given file path. Returns a map from
/// hostname/IP to the list of keys trusted for it.
pub(crate) async fn load_known_hosts(path: &Path) -> ExecResult<KnownHosts> {
    let mut trusted: KnownHosts = HashMap::new();

    if !path.exists() {
        tracing::warn!(
            "Known hosts file not found at '{}'. No host keys will be pre-trusted.",
            path.display()
        );
        return Ok(trusted);
    }

    let content = fs::read_to_string(path).await.map_err(|e| {
        ExecError::ConnectionFailed(format!(
            "failed to read known_hosts file '{}': {e}",
            path.display()
        ))
    })?;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((hosts, key)) = parse_known_host_line(trimmed) {
            for host in hosts {
                trusted.entry(host).or_default().push(key.clone());
            }
        }
    }

    Ok(trusted)
}

/// Default known_hosts location under the user's home directory.
pub(crate) fn default_known_hosts_path() -> ExecResult<std::path::PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("known_hosts"))
        .ok_or_else(|| {
            ExecError::ConnectionFailed(
                "could not determine home directory for known_hosts file".to_string(),
            )
        })
}

/// Client handler enforcing the host-key policy: a key that mismatches a
/// known host is rejected; an unknown host is accepted with a warning.
#[derive(Debug)]
pub(crate) struct HostVerifier {
    target_host: String,
    trusted_keys: Arc<KnownHosts>,
    suppress_unknown_host_warning: bool,
}

impl HostVerifier {
    pub(crate) fn new(
        target_host: String,
        trusted_keys: Arc<KnownHosts>,
        suppress_unknown_host_warning: bool,
    ) -> Self {
        Self {
            target_host,
            trusted_keys,
            suppress_unknown_host_warning,
        }
    }
}

impl client::Handler for HostVerifier {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(Default::default());

        match self.trusted_keys.get(&self.target_host) {
            Some(known_keys) => {
                if known_keys.iter().any(|known| known == server_public_key) {
                    tracing::debug!(
                        "Host key for {} verified (fingerprint: {}).",
                        self.target_host,
                        fingerprint
                    );
                    Ok(true)
                } else {
                    // Potential MitM: reject the connection.
                    eprintln!(
                        "{} host {} presented key {} which does not match any known key",
                        "HOST KEY VERIFICATION FAILED:".red().bold(),
                        self.target_host.cyan(),
                        fingerprint.to_string().yellow(),
                    );
                    Ok(false)
                }
            }
            None => {
                if !self.suppress_unknown_host_warning {
                    eprintln!(
                        "{} host {} is not in known_hosts (fingerprint {}); connecting anyway.\n\
                         Add '{} {}' to known_hosts to trust it.",
                        "WARNING:".yellow().bold(),
                        self.target_host.cyan(),
                        fingerprint.to_string().yellow(),
                        self.target_host.cyan(),
                        server_public_key.public_key_base64().green(),
                    );
                }
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn missing_file_yields_empty_map() {
        let map = load_known_hosts(Path::new("/nonexistent/known_hosts"))
            .await
            .unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn comments_and_garbage_are_skipped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "short line").unwrap();
        writeln!(file).unwrap();
        let map = load_known_hosts(file.path()).await.unwrap();
        assert!(map.is_empty());
    }
}
