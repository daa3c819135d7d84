//! Shell selection
//!
//! Picks the `Shell` used to reach a deployment host: the local shell for
//! `localhost`, a pooled SSH shell for anything else.

use std::sync::Arc;

use kiln_core::domain::profile::LOCALHOST;
use kiln_remote::{ConnectionError, ConnectionManager, LocalShell, RemoteShell, Shell, ShellError};

/// Hands out shells for deployment hosts
pub trait ShellProvider: Send + Sync {
    /// Shell for `host`, logging in as `user` when the host is remote
    fn shell(&self, host: &str, user: Option<&str>) -> Result<Arc<dyn Shell>, ShellError>;
}

/// Local shell for this machine, pooled SSH shells for remote hosts
pub struct PooledShells {
    pool: Arc<ConnectionManager>,
    local: Arc<LocalShell>,
}

impl PooledShells {
    pub fn new(pool: Arc<ConnectionManager>) -> Self {
        Self {
            pool,
            local: Arc::new(LocalShell::new()),
        }
    }
}

impl ShellProvider for PooledShells {
    fn shell(&self, host: &str, user: Option<&str>) -> Result<Arc<dyn Shell>, ShellError> {
        if host.is_empty() || host == LOCALHOST {
            return Ok(self.local.clone());
        }

        let user = user.filter(|u| !u.is_empty()).ok_or_else(|| {
            ShellError::Connection(ConnectionError::Connect {
                key: host.to_string(),
                reason: "no SSH user configured".to_string(),
            })
        })?;

        Ok(Arc::new(RemoteShell::new(self.pool.clone(), host, user)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_remote::{Connection, ConnectionInfo, Connector, PoolConfig};

    struct NoConnector;

    #[async_trait::async_trait]
    impl Connector for NoConnector {
        async fn connect(
            &self,
            info: &ConnectionInfo,
        ) -> Result<Arc<dyn Connection>, ConnectionError> {
            Err(ConnectionError::Connect {
                key: info.key(),
                reason: "unreachable".to_string(),
            })
        }
    }

    fn shells() -> PooledShells {
        PooledShells::new(ConnectionManager::new(
            PoolConfig::default(),
            Arc::new(NoConnector),
        ))
    }

    #[test]
    fn test_local_hosts_use_local_shell() {
        let shells = shells();
        assert!(!shells.shell("localhost", None).unwrap().is_remote());
        assert!(!shells.shell("", Some("alice")).unwrap().is_remote());
    }

    #[test]
    fn test_remote_host_requires_user() {
        let shells = shells();
        assert!(shells.shell("della.princeton.edu", Some("alice")).unwrap().is_remote());
        assert!(shells.shell("della.princeton.edu", None).is_err());
        assert!(shells.shell("della.princeton.edu", Some("")).is_err());
    }
}
