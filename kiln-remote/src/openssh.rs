//! OpenSSH control-master connections
//!
//! Each connection is a `ssh -M -N` master process owning a private control
//! socket. Commands are multiplexed over it with `ssh -S <socket>`, so only the
//! first command to a host pays for authentication.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{CommandOutput, Connection, ConnectionInfo, Connector};
use crate::error::ConnectionError;
use crate::manager::PoolConfig;

/// Delay between control socket checks while a master is starting
const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Opens control-master connections with the system `ssh` binary
#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    control_dir: PathBuf,
    connect_timeout: Duration,
}

impl OpenSshConnector {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            control_dir: config.control_dir.clone(),
            connect_timeout: config.connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn connect(&self, info: &ConnectionInfo) -> Result<Arc<dyn Connection>, ConnectionError> {
        tokio::fs::create_dir_all(&self.control_dir).await?;

        let control_path = self.control_dir.join(format!("{}.sock", info.key()));
        // A socket left behind by a crashed master would make `-M` fail
        let _ = tokio::fs::remove_file(&control_path).await;

        info!("Opening SSH master connection to {}", info.key());

        let mut master = Command::new("ssh")
            .arg("-M")
            .arg("-N")
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-o")
            .arg("ControlPersist=no")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ServerAliveInterval=30")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg(info.key())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let started = tokio::time::Instant::now();

        loop {
            if let Some(status) = master.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(ConnectionError::Connect {
                    key: info.key(),
                    reason: format!("ssh exited with {}: {}", status, stderr.trim()),
                });
            }

            if check_master(&control_path, info).await {
                break;
            }

            if started.elapsed() >= self.connect_timeout {
                let _ = master.kill().await;
                return Err(ConnectionError::Timeout {
                    key: info.key(),
                    timeout: self.connect_timeout,
                });
            }

            tokio::time::sleep(MASTER_POLL_INTERVAL).await;
        }

        debug!(
            "SSH master for {} ready on {}",
            info.key(),
            control_path.display()
        );

        Ok(Arc::new(ControlMasterConnection {
            info: info.clone(),
            control_path,
            master: Mutex::new(Some(master)),
        }))
    }
}

/// Asks a master process whether it is still serving its control socket
async fn check_master(control_path: &Path, info: &ConnectionInfo) -> bool {
    Command::new("ssh")
        .arg("-S")
        .arg(control_path)
        .arg("-O")
        .arg("check")
        .arg(info.key())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// A multiplexed SSH connection backed by a master process
pub struct ControlMasterConnection {
    info: ConnectionInfo,
    control_path: PathBuf,
    master: Mutex<Option<Child>>,
}

impl ControlMasterConnection {
    fn command(&self, remote_command: &str) -> Command {
        let mut command = Command::new("ssh");
        command
            .arg("-S")
            .arg(&self.control_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(self.info.key())
            .arg("--")
            .arg(remote_command)
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Connection for ControlMasterConnection {
    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, ConnectionError> {
        debug!("[{}] $ {}", self.info.key(), command);

        let output = self
            .command(command)
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(CommandOutput::from_process(output))
    }

    async fn exec_with_input(
        &self,
        command: &str,
        input: &[u8],
    ) -> Result<CommandOutput, ConnectionError> {
        debug!("[{}] $ {} (<{} bytes)", self.info.key(), command, input.len());

        let mut child = self
            .command(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput::from_process(output))
    }

    async fn is_alive(&self) -> bool {
        {
            let mut master = self.master.lock().await;
            match master.as_mut() {
                Some(child) => {
                    if !matches!(child.try_wait(), Ok(None)) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        matches!(self.exec("true").await, Ok(output) if output.success())
    }

    async fn close(&self) {
        let Some(mut child) = self.master.lock().await.take() else {
            return;
        };

        info!("Closing SSH master connection to {}", self.info.key());

        let _ = Command::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .arg("-O")
            .arg("exit")
            .arg(self.info.key())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        if let Err(e) = child.kill().await {
            debug!("SSH master for {} already gone: {}", self.info.key(), e);
        }

        if let Err(e) = tokio::fs::remove_file(&self.control_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove control socket {}: {}",
                    self.control_path.display(),
                    e
                );
            }
        }
    }
}
