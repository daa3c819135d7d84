//! Tunnel manager
//!
//! Makes a service that listens on a compute node reachable on
//! `localhost:<port>` by running `ssh -N -f -L` forwarders. Forwarders are
//! plain background ssh processes; they are found again for teardown by
//! scanning the process table for their `-L` spec.
//!
//! Local port allocation is serialized within this process. Another process
//! can still grab a port between the probe bind and ssh's own bind.

use async_trait::async_trait;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::process::Stdio;
use sysinfo::{ProcessExt, System, SystemExt};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use kiln_core::domain::service::Service;

use crate::job::Job;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// Tunnel requested before the job's destination is known
    #[error("Cannot open tunnel: {0}")]
    Precondition(String),

    #[error("No free local port in {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Failed to start ssh forwarder: {0}")]
    Spawn(String),
}

/// Opens and closes local forwards for services
#[async_trait]
pub trait Tunnels: Send + Sync {
    /// Forwards a local port to the job's node and port, recording it on the service
    async fn open(&self, service: &mut Service, job: &Job) -> Result<u16, TunnelError>;

    /// Tears down any forwarder for the service's port and clears it
    async fn close(&self, service: &mut Service);
}

/// Tunnels backed by background `ssh -L` processes
pub struct SshTunnels {
    port_range: RangeInclusive<u16>,
    allocation: Mutex<()>,
}

impl SshTunnels {
    pub fn new(port_range: RangeInclusive<u16>) -> Self {
        Self {
            port_range,
            allocation: Mutex::new(()),
        }
    }

    /// First port in range that can currently be bound on loopback
    fn find_free_port(&self) -> Result<u16, TunnelError> {
        self.port_range
            .clone()
            .find(|port| TcpListener::bind(("127.0.0.1", *port)).is_ok())
            .ok_or(TunnelError::NoFreePort {
                start: *self.port_range.start(),
                end: *self.port_range.end(),
            })
    }
}

/// Where ssh should connect to reach `node`
///
/// Remote services go through their login host; when the login host is this
/// machine the compute node is reached directly.
fn forward_target(service: &Service, node: &str) -> String {
    match (&service.user, service.is_local()) {
        (Some(user), false) => format!("{}@{}", user, service.host),
        (None, false) => service.host.clone(),
        (_, true) => node.to_string(),
    }
}

#[async_trait]
impl Tunnels for SshTunnels {
    async fn open(&self, service: &mut Service, job: &Job) -> Result<u16, TunnelError> {
        if service.job_id.is_none() {
            return Err(TunnelError::Precondition(format!(
                "service {} has no job",
                service.id
            )));
        }

        let (Some(node), Some(remote_port)) = (job.node(), job.port()) else {
            return Err(TunnelError::Precondition(format!(
                "job {} has no node or port yet",
                job.job_id()
            )));
        };

        if job.is_local() {
            debug!(
                "Service {} published on localhost:{}, no forwarder needed",
                service.id, remote_port
            );
            service.port = Some(remote_port);
            return Ok(remote_port);
        }

        let _guard = self.allocation.lock().await;
        let local_port = self.find_free_port()?;
        let target = forward_target(service, node);
        let spec = format!("{}:{}:{}", local_port, node, remote_port);

        info!(
            "Opening tunnel localhost:{} -> {}:{} via {}",
            local_port, node, remote_port, target
        );

        let output = Command::new("ssh")
            .arg("-N")
            .arg("-f")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-L")
            .arg(&spec)
            .arg(&target)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TunnelError::Spawn(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TunnelError::Spawn(stderr.trim().to_string()));
        }

        service.port = Some(local_port);
        Ok(local_port)
    }

    async fn close(&self, service: &mut Service) {
        let Some(port) = service.port.take() else {
            return;
        };

        match tokio::task::spawn_blocking(move || kill_forwarders(port)).await {
            Ok(0) => debug!("No forwarder found for port {}", port),
            Ok(killed) => info!("Closed {} forwarder(s) on port {}", killed, port),
            Err(e) => warn!("Tunnel scan for port {} aborted: {}", port, e),
        }
    }
}

/// Local port of every `-L` forward in an ssh command line
fn forwarded_ports(cmd: &[String]) -> Vec<u16> {
    let mut ports = Vec::new();
    let mut args = cmd.iter();

    while let Some(arg) = args.next() {
        let spec = if arg == "-L" {
            match args.next() {
                Some(spec) => spec.as_str(),
                None => break,
            }
        } else if let Some(spec) = arg.strip_prefix("-L") {
            spec
        } else {
            continue;
        };

        // [bind_address:]port:host:hostport
        let fields: Vec<&str> = spec.split(':').collect();
        let local = match fields.len() {
            3 => fields[0],
            4 => fields[1],
            _ => continue,
        };
        if let Ok(port) = local.parse() {
            ports.push(port);
        }
    }

    ports
}

/// Kills every ssh process forwarding `port`, returning how many were killed
fn kill_forwarders(port: u16) -> usize {
    let mut system = System::new();
    system.refresh_processes();

    let mut killed = 0;
    for (pid, process) in system.processes() {
        if process.name() != "ssh" {
            continue;
        }

        // Processes may exit or hide their command line mid-scan
        let cmd = process.cmd();
        if cmd.is_empty() || !forwarded_ports(cmd).contains(&port) {
            continue;
        }

        if process.kill() {
            debug!("Killed ssh forwarder {} for port {}", pid, port);
            killed += 1;
        } else {
            warn!("Could not kill ssh forwarder {} for port {}", pid, port);
        }
    }

    killed
}
