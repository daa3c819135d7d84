//! Connection abstractions
//!
//! A `Connection` runs commands on one remote host. A `Connector` opens new
//! connections for the pool. Both are traits so the pool can be exercised
//! without a real SSH server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ConnectionError;

/// Identifies a remote login
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub user: String,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
        }
    }

    /// Pool key, `user@host`
    pub fn key(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub(crate) fn from_process(output: std::process::Output) -> Self {
        Self {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// A live command channel to a remote host
#[async_trait]
pub trait Connection: Send + Sync {
    /// Login this connection belongs to
    fn info(&self) -> &ConnectionInfo;

    /// Runs a shell command on the remote host
    async fn exec(&self, command: &str) -> Result<CommandOutput, ConnectionError>;

    /// Runs a shell command with `input` fed to its stdin
    async fn exec_with_input(
        &self,
        command: &str,
        input: &[u8],
    ) -> Result<CommandOutput, ConnectionError>;

    /// Lightweight no-op round trip
    async fn is_alive(&self) -> bool;

    /// Tears down the underlying transport
    async fn close(&self);
}

/// Opens new connections on behalf of the pool
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, info: &ConnectionInfo) -> Result<Arc<dyn Connection>, ConnectionError>;
}
