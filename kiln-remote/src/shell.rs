//! Command execution seam
//!
//! Jobs, submission and file browsing all talk to a `Shell`: either the
//! local `sh`, or a login host reached through the SSH connection pool.

use async_trait::async_trait;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

use crate::connection::{CommandOutput, ConnectionInfo};
use crate::error::ShellError;
use crate::manager::ConnectionManager;

/// Runs shell commands on some host
#[async_trait]
pub trait Shell: Send + Sync {
    /// Runs `command` with `sh -c` semantics and captures its output
    ///
    /// A non-zero exit status is not an error here; callers inspect it.
    async fn run(&self, command: &str) -> Result<CommandOutput, ShellError>;

    /// Writes `contents` to `path`, creating parent directories
    async fn write_file(&self, path: &str, contents: &str) -> Result<(), ShellError>;

    /// Whether commands run on another host
    fn is_remote(&self) -> bool;
}

/// Quotes a single argument for a POSIX shell command line
pub fn quote(arg: &str) -> String {
    let sanitized: Cow<'_, str> = if arg.contains('\0') {
        Cow::Owned(arg.replace('\0', ""))
    } else {
        Cow::Borrowed(arg)
    };

    shlex::try_quote(&sanitized)
        .map(Cow::into_owned)
        .unwrap_or_default()
}

/// Parent directory of a slash-separated path
fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

/// Runs commands on this machine
#[derive(Debug, Clone, Default)]
pub struct LocalShell;

impl LocalShell {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Shell for LocalShell {
    async fn run(&self, command: &str) -> Result<CommandOutput, ShellError> {
        debug!("[local] $ {}", command);

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput::from_process(output))
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), ShellError> {
        if let Some(parent) = parent_dir(path) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    fn is_remote(&self) -> bool {
        false
    }
}

/// Runs commands on a login host through the connection pool
#[derive(Clone)]
pub struct RemoteShell {
    pool: Arc<ConnectionManager>,
    info: ConnectionInfo,
}

impl RemoteShell {
    pub fn new(pool: Arc<ConnectionManager>, host: &str, user: &str) -> Self {
        Self {
            pool,
            info: ConnectionInfo::new(host, user),
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }
}

#[async_trait]
impl Shell for RemoteShell {
    async fn run(&self, command: &str) -> Result<CommandOutput, ShellError> {
        let conn = self
            .pool
            .connection(&self.info.host, &self.info.user)
            .await?;
        Ok(conn.exec(command).await?)
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), ShellError> {
        let command = match parent_dir(path) {
            Some(parent) => format!("mkdir -p {} && cat > {}", quote(parent), quote(path)),
            None => format!("cat > {}", quote(path)),
        };

        let conn = self
            .pool
            .connection(&self.info.host, &self.info.user)
            .await?;
        let output = conn.exec_with_input(&command, contents.as_bytes()).await?;

        if !output.success() {
            return Err(ShellError::Failed {
                command,
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    fn is_remote(&self) -> bool {
        true
    }
}
