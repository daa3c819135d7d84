//! SSH connection pool
//!
//! Keeps at most one live connection per `user@host`:
//! - Reusing a cached connection while it answers its liveness probe
//! - Replacing dead connections transparently on the next acquisition
//! - Reclaiming idle or dead connections from a background task
//!
//! Every access to the connection map, including the reclaimer's sweep,
//! goes through one async mutex. Liveness probes run while it is held.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionInfo, Connector};
use crate::error::ConnectionError;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How often the reclaimer sweeps the pool
    pub cleanup_interval: Duration,

    /// Idle time after which a connection is reclaimed
    pub max_idle_time: Duration,

    /// Upper bound for establishing a new connection
    pub connect_timeout: Duration,

    /// Directory holding SSH control sockets
    pub control_dir: PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            max_idle_time: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(15),
            control_dir: std::env::temp_dir().join("kiln-ssh"),
        }
    }
}

/// Observability snapshot of one pooled connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub host: String,
    pub user: String,
    pub last_used: DateTime<Utc>,
    pub is_connected: bool,
    /// Seconds since last use
    pub idle_time: f64,
}

/// Pool entry
struct ManagedConnection {
    connection: Arc<dyn Connection>,
    info: ConnectionInfo,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    alive: bool,
}

impl ManagedConnection {
    fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            info: connection.info().clone(),
            connection,
            last_used: Instant::now(),
            last_used_at: Utc::now(),
            alive: true,
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
        self.last_used_at = Utc::now();
        self.alive = true;
    }
}

/// State shared with the reclaimer task
struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    connections: Mutex<HashMap<String, ManagedConnection>>,
}

impl PoolInner {
    /// Removes entries idle past `max_idle_time` or failing their probe
    async fn cleanup_idle(&self) -> usize {
        let mut connections = self.connections.lock().await;
        let now = Instant::now();

        let keys: Vec<String> = connections.keys().cloned().collect();
        let mut removed = 0;

        for key in keys {
            let Some(entry) = connections.get(&key) else {
                continue;
            };

            let idle = now.saturating_duration_since(entry.last_used);
            let reason = if idle > self.config.max_idle_time {
                Some(format!("idle for {:?}", idle))
            } else if !entry.connection.is_alive().await {
                Some("liveness check failed".to_string())
            } else {
                None
            };

            if let Some(reason) = reason {
                if let Some(entry) = connections.remove(&key) {
                    info!("Reclaiming SSH connection {} ({})", key, reason);
                    entry.connection.close().await;
                    removed += 1;
                }
            }
        }

        removed
    }
}

/// Pool of SSH connections keyed by `user@host`
pub struct ConnectionManager {
    inner: Arc<PoolInner>,
    shutdown: CancellationToken,
    reclaimer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Creates an empty pool
    ///
    /// The background reclaimer is not started until `spawn_reclaimer`.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                connections: Mutex::new(HashMap::new()),
            }),
            shutdown: CancellationToken::new(),
            reclaimer: std::sync::Mutex::new(None),
        })
    }

    /// Starts the background reclaimer, once
    pub fn spawn_reclaimer(&self) {
        let mut reclaimer = self.reclaimer.lock().unwrap_or_else(PoisonError::into_inner);
        if reclaimer.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let token = self.shutdown.clone();
        let period = inner.config.cleanup_interval;

        info!(
            "Starting SSH connection reclaimer (interval: {:?}, max idle: {:?})",
            period, inner.config.max_idle_time
        );

        *reclaimer = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = inner.cleanup_idle().await;
                        if removed > 0 {
                            debug!("Reclaimed {} SSH connection(s)", removed);
                        }
                    }
                }
            }

            debug!("SSH connection reclaimer stopped");
        }));
    }

    /// Returns a live connection for `user@host`, opening one if needed
    ///
    /// Fails with `ConnectionError` if a new connection cannot be opened or
    /// does not pass its liveness probe. Failures are not retried here.
    pub async fn get_connection(
        &self,
        host: &str,
        user: &str,
    ) -> Result<Arc<dyn Connection>, ConnectionError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Shutdown);
        }

        let info = ConnectionInfo::new(host, user);
        let key = info.key();
        let mut connections = self.inner.connections.lock().await;

        if let Some(entry) = connections.get_mut(&key) {
            if entry.connection.is_alive().await {
                entry.touch();
                return Ok(Arc::clone(&entry.connection));
            }

            warn!("Pooled SSH connection {} is dead, replacing it", key);
            if let Some(stale) = connections.remove(&key) {
                stale.connection.close().await;
            }
        }

        let connection = self.inner.connector.connect(&info).await?;

        if !connection.is_alive().await {
            connection.close().await;
            return Err(ConnectionError::Liveness(key));
        }

        debug!("Pooled new SSH connection {}", key);
        connections.insert(key, ManagedConnection::new(Arc::clone(&connection)));

        Ok(connection)
    }

    /// Scoped acquisition
    ///
    /// The returned guard derefs to the pooled connection. Dropping it hands
    /// the connection back to the pool; it is never closed on scope exit.
    pub async fn connection(
        &self,
        host: &str,
        user: &str,
    ) -> Result<PooledConnection, ConnectionError> {
        let connection = self.get_connection(host, user).await?;
        Ok(PooledConnection { connection })
    }

    /// Evicts and closes the connection for `user@host`, if any
    pub async fn close_connection(&self, host: &str, user: &str) {
        let key = ConnectionInfo::new(host, user).key();
        let removed = self.inner.connections.lock().await.remove(&key);

        if let Some(entry) = removed {
            entry.connection.close().await;
            info!("Closed SSH connection {}", key);
        }
    }

    /// Drains and closes every pooled connection
    pub async fn close_all(&self) {
        let mut connections = self.inner.connections.lock().await;
        let count = connections.len();

        for (_, entry) in connections.drain() {
            entry.connection.close().await;
        }

        if count > 0 {
            info!("Closed {} SSH connection(s)", count);
        }
    }

    /// Stops the reclaimer and closes all connections; safe to call repeatedly
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handle = self
            .reclaimer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("SSH connection reclaimer panicked: {}", e);
            }
        }

        self.close_all().await;
    }

    /// Runs one reclamation sweep immediately, returning how many were closed
    pub async fn cleanup_idle(&self) -> usize {
        self.inner.cleanup_idle().await
    }

    /// Snapshot of the pool keyed by `user@host`
    pub async fn get_status(&self) -> HashMap<String, ConnectionStatus> {
        let connections = self.inner.connections.lock().await;
        let now = Instant::now();

        connections
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    ConnectionStatus {
                        host: entry.info.host.clone(),
                        user: entry.info.user.clone(),
                        last_used: entry.last_used_at,
                        is_connected: entry.alive,
                        idle_time: now.saturating_duration_since(entry.last_used).as_secs_f64(),
                    },
                )
            })
            .collect()
    }
}

/// Borrowed handle to a pooled connection
pub struct PooledConnection {
    connection: Arc<dyn Connection>,
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}
