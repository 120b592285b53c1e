use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use russh::keys;
use russh::{client, Disconnect};
use russh_sftp::client::SftpSession;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use super::known_hosts::{default_known_hosts_path, load_known_hosts, HostVerifier, KnownHosts};
use crate::command::request::{SshAuth, SshOptions};
use crate::error::{ExecError, ExecResult};

/// Idle connections older than this are evicted at acquire time.
const IDLE_TTL: Duration = Duration::from_secs(60);
/// Maximum concurrent channels multiplexed over one transport; excess
/// requests queue on the semaphore.
const MAX_CHANNELS: usize = 8;

/// Pool identity: one transport is shared per `(host, port, username)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl From<&SshOptions> for PoolKey {
    fn from(opts: &SshOptions) -> Self {
        Self {
            host: opts.host.clone(),
            port: opts.port,
            username: opts.username.clone(),
        }
    }
}

/// A live transport shared by concurrent requests. Channel concurrency is
/// bounded by the semaphore; the SFTP session is created lazily and reused.
pub(crate) struct PooledConnection {
    pub(crate) key: PoolKey,
    session: client::Handle<HostVerifier>,
    sftp: Mutex<Option<SftpSession>>,
    channels: Arc<Semaphore>,
    last_used: StdMutex<Instant>,
}

impl PooledConnection {
    fn new(key: PoolKey, session: client::Handle<HostVerifier>) -> Self {
        Self {
            key,
            session,
            sftp: Mutex::new(None),
            channels: Arc::new(Semaphore::new(MAX_CHANNELS)),
            last_used: StdMutex::new(Instant::now()),
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock().expect("last_used lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .expect("last_used lock poisoned")
            .elapsed()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Open an exec channel, waiting for a concurrency permit first.
    pub(crate) async fn open_channel(
        &self,
    ) -> ExecResult<(OwnedSemaphorePermit, russh::Channel<client::Msg>)> {
        let permit = self
            .channels
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecError::ConnectionFailed("connection pool closed".into()))?;
        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::ConnectionFailed(format!("channel open failed: {e}")))?;
        self.touch();
        Ok((permit, channel))
    }

    /// If not already present, create an SFTP session and store it for reuse.
    pub(crate) async fn sftp(&self) -> ExecResult<tokio::sync::MutexGuard<'_, Option<SftpSession>>> {
        let mut guard = self.sftp.lock().await;
        if guard.is_none() {
            let channel = self
                .session
                .channel_open_session()
                .await
                .map_err(|e| ExecError::ConnectionFailed(format!("channel open failed: {e}")))?;
            channel
                .request_subsystem(true, "sftp")
                .await
                .map_err(|e| ExecError::TransferFailed(format!("sftp subsystem failed: {e}")))?;
            let session = SftpSession::new(channel.into_stream())
                .await
                .map_err(|e| ExecError::TransferFailed(format!("sftp handshake failed: {e}")))?;
            *guard = Some(session);
        }
        self.touch();
        Ok(guard)
    }

    async fn disconnect(&self) {
        let _ = self
            .session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
    }
}

/// Concurrent map from connection key to shared transport, with idle TTL
/// eviction. A dead connection found at acquire time is evicted and the
/// dial retried once with a fresh transport.
pub(crate) struct ConnectionPool {
    connections: Mutex<HashMap<PoolKey, Arc<PooledConnection>>>,
    idle_ttl: Duration,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub(crate) fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            idle_ttl: IDLE_TTL,
        }
    }

    pub(crate) async fn acquire(&self, opts: &SshOptions) -> ExecResult<Arc<PooledConnection>> {
        let key = PoolKey::from(opts);
        let mut connections = self.connections.lock().await;

        if let Some(existing) = connections.get(&key) {
            if !existing.is_closed() && existing.idle_for() < self.idle_ttl {
                existing.touch();
                return Ok(Arc::clone(existing));
            }
            tracing::debug!(host = %key.host, "evicting stale ssh connection");
            if let Some(stale) = connections.remove(&key) {
                stale.disconnect().await;
            }
        }

        let session = dial(opts).await?;
        let connection = Arc::new(PooledConnection::new(key.clone(), session));
        connections.insert(key, Arc::clone(&connection));
        Ok(connection)
    }

    /// Connections currently held for the given key, if any.
    pub(crate) async fn live_connection(&self, key: &PoolKey) -> Option<Arc<PooledConnection>> {
        let connections = self.connections.lock().await;
        connections
            .get(key)
            .filter(|c| !c.is_closed())
            .map(Arc::clone)
    }

    pub(crate) async fn dispose(&self) {
        let mut connections = self.connections.lock().await;
        for (_, connection) in connections.drain() {
            connection.disconnect().await;
        }
    }
}

/// Expands tilde (~) in a path to the user's home directory.
fn expand_tilde_path(key_path: &Path) -> ExecResult<PathBuf> {
    if !key_path.starts_with("~") {
        return Ok(key_path.to_path_buf());
    }
    let home = dirs::home_dir().ok_or_else(|| {
        ExecError::AuthenticationFailed("could not determine home directory".to_string())
    })?;
    let path_str = key_path.to_string_lossy();
    if path_str == "~" {
        Ok(home)
    } else if let Some(stripped) = path_str.strip_prefix("~/") {
        Ok(home.join(stripped))
    } else {
        Err(ExecError::AuthenticationFailed(format!(
            "unsupported tilde pattern '{path_str}'; only '~' and '~/' are expanded"
        )))
    }
}

async fn connect_session(
    opts: &SshOptions,
    known: Arc<KnownHosts>,
) -> ExecResult<client::Handle<HostVerifier>> {
    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(opts.keepalive),
        keepalive_max: 3,
        ..Default::default()
    });
    let handler = HostVerifier::new(
        opts.host.clone(),
        known,
        opts.suppress_unknown_host_warning,
    );

    let addr = (opts.host.as_str(), opts.port);
    let connect = client::connect(config, addr, handler);
    match tokio::time::timeout(opts.connect_timeout, connect).await {
        Ok(Ok(session)) => Ok(session),
        Ok(Err(e)) => Err(ExecError::ConnectionFailed(format!(
            "failed to establish SSH connection to '{}:{}': {e}",
            opts.host, opts.port
        ))),
        Err(_) => Err(ExecError::ConnectionFailed(format!(
            "connection to '{}:{}' timed out after {:?}",
            opts.host, opts.port, opts.connect_timeout
        ))),
    }
}

async fn authenticate_with_key(
    session: &mut client::Handle<HostVerifier>,
    username: &str,
    key_path: &Path,
) -> ExecResult<()> {
    let key_pair = keys::load_secret_key(key_path, None).map_err(|e| {
        ExecError::AuthenticationFailed(format!(
            "failed to load SSH private key from '{}': {e}",
            key_path.display()
        ))
    })?;

    let best_hash = session
        .best_supported_rsa_hash()
        .await
        .map_err(|e| ExecError::ConnectionFailed(format!("RSA hash negotiation failed: {e}")))?
        .flatten();

    let auth = session
        .authenticate_publickey(
            username,
            keys::key::PrivateKeyWithHashAlg::new(Arc::new(key_pair), best_hash),
        )
        .await
        .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

    if !auth.success() {
        return Err(ExecError::AuthenticationFailed(format!(
            "key '{}' was rejected by the server",
            key_path.display()
        )));
    }
    Ok(())
}

async fn authenticate_with_agent(
    session: &mut client::Handle<HostVerifier>,
    username: &str,
) -> ExecResult<()> {
    let mut agent = keys::agent::client::AgentClient::connect_env()
        .await
        .map_err(|e| ExecError::AuthenticationFailed(format!("ssh-agent unavailable: {e}")))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| ExecError::AuthenticationFailed(format!("ssh-agent listing failed: {e}")))?;
    if identities.is_empty() {
        return Err(ExecError::AuthenticationFailed(
            "ssh-agent holds no identities".into(),
        ));
    }

    let best_hash = session
        .best_supported_rsa_hash()
        .await
        .map_err(|e| ExecError::ConnectionFailed(format!("RSA hash negotiation failed: {e}")))?
        .flatten();

    for key in identities {
        let auth = session
            .authenticate_publickey_with(username, key, best_hash, &mut agent)
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;
        if auth.success() {
            return Ok(());
        }
    }
    Err(ExecError::AuthenticationFailed(
        "no ssh-agent identity was accepted by the server".into(),
    ))
}

/// Establish and authenticate a new transport for the given options.
async fn dial(opts: &SshOptions) -> ExecResult<client::Handle<HostVerifier>> {
    let known = Arc::new(load_known_hosts(&default_known_hosts_path()?).await?);

    match &opts.auth {
        SshAuth::Password(password) => {
            let mut session = connect_session(opts, known).await?;
            let auth = session
                .authenticate_password(&opts.username, password)
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;
            if !auth.success() {
                return Err(ExecError::AuthenticationFailed(format!(
                    "password rejected for user '{}' on '{}'",
                    opts.username, opts.host
                )));
            }
            Ok(session)
        }
        SshAuth::Key(path) => {
            let expanded = expand_tilde_path(path)?;
            if !expanded.exists() {
                return Err(ExecError::AuthenticationFailed(format!(
                    "specified SSH key file not found: {}",
                    expanded.display()
                )));
            }
            let mut session = connect_session(opts, known).await?;
            authenticate_with_key(&mut session, &opts.username, &expanded).await?;
            Ok(session)
        }
        SshAuth::Agent => {
            let mut session = connect_session(opts, known).await?;
            authenticate_with_agent(&mut session, &opts.username).await?;
            Ok(session)
        }
        SshAuth::Auto => {
            let home = dirs::home_dir().ok_or_else(|| {
                ExecError::AuthenticationFailed("could not determine home directory".into())
            })?;
            let ssh_dir = home.join(".ssh");
            let candidates = [ssh_dir.join("id_rsa"), ssh_dir.join("id_ed25519")];

            let mut errors = Vec::new();
            for key_path in &candidates {
                if !key_path.exists() {
                    tracing::debug!("SSH key not found: {}", key_path.display());
                    continue;
                }
                // A rejected key can leave the session unusable; dial fresh
                // per attempt.
                let mut session = connect_session(opts, Arc::clone(&known)).await?;
                match authenticate_with_key(&mut session, &opts.username, key_path).await {
                    Ok(()) => {
                        tracing::debug!("authenticated with SSH key: {}", key_path.display());
                        return Ok(session);
                    }
                    Err(e) => {
                        tracing::debug!("key {} failed: {e}", key_path.display());
                        errors.push(format!("{}: {e}", key_path.display()));
                        let _ = session
                            .disconnect(Disconnect::ByApplication, "", "English")
                            .await;
                    }
                }
            }

            if errors.is_empty() {
                Err(ExecError::AuthenticationFailed(
                    "no SSH keys found; tried ~/.ssh/id_rsa and ~/.ssh/id_ed25519".into(),
                ))
            } else {
                Err(ExecError::AuthenticationFailed(format!(
                    "all SSH keys were rejected: {}",
                    errors.join("; ")
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_identity() {
        let a = PoolKey::from(&SshOptions::new("host", "user"));
        let b = PoolKey::from(&SshOptions::new("host", "user"));
        let c = PoolKey::from(&SshOptions::new("host", "other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tilde_expansion() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(
            expand_tilde_path(Path::new("~/.ssh/id_rsa")).unwrap(),
            home.join(".ssh/id_rsa")
        );
        assert_eq!(
            expand_tilde_path(Path::new("/abs/key")).unwrap(),
            PathBuf::from("/abs/key")
        );
        assert!(expand_tilde_path(Path::new("~user/key")).is_err());
    }
}
