//! Service state machine
//!
//! Drives a service from submission to a terminal status:
//!
//! ```text
//! SUBMITTED -> PENDING -> STARTING -> HEALTHY <-> UNHEALTHY
//!        \          \          \          \          \
//!         +----------+----------+----------+----------+--> STOPPED | TIMEOUT | FAILED
//! ```
//!
//! Terminal statuses absorb every event. The lifecycle only mutates the
//! in-memory `Service`; persisting it is the caller's job.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use kiln_core::domain::profile::{Profile, Provider};
use kiln_core::domain::service::{JobType, Service, ServiceStatus};
use kiln_core::dto::service::{ContainerOptions, JobOptions, JobView};
use kiln_remote::{Shell, ShellError, quote};

use crate::job::{Job, JobState, LocalJob, LocalState, SlurmJob, SlurmState};
use crate::probe::HealthProbe;
use crate::script::{RenderError, ScriptRenderer, instance_name};
use crate::shell::ShellProvider;
use crate::tunnel::Tunnels;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("Failed to render launch script: {0}")]
    Render(#[from] RenderError),

    #[error("Job submission failed: {0}")]
    Submit(String),

    #[error("Unsupported deployment: {0}")]
    Unsupported(String),

    #[error("Could not read a job id from submission output: {0:?}")]
    Parse(String),

    #[error(transparent)]
    Shell(#[from] ShellError),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Stopping or inspecting a service that never got a job
    #[error("Service {0} has no job")]
    NotStarted(Uuid),

    #[error("Job type {0} is not supported")]
    Unsupported(JobType),

    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// What a job state means for the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// Nothing to act on, keep the current status
    NoInfo,
    Queued,
    Running,
    Stopped,
    Timeout,
    Failed,
}

fn signal(state: Option<&JobState>) -> Signal {
    match state {
        None => Signal::NoInfo,
        Some(JobState::Slurm(state)) => match state {
            SlurmState::Pending => Signal::Queued,
            SlurmState::Running => Signal::Running,
            SlurmState::Completed | SlurmState::Cancelled => Signal::Stopped,
            SlurmState::Timeout => Signal::Timeout,
            SlurmState::Failed
            | SlurmState::NodeFail
            | SlurmState::Preempted
            | SlurmState::BootFail
            | SlurmState::Deadline
            | SlurmState::OutOfMemory => Signal::Failed,
            SlurmState::Suspended
            | SlurmState::Completing
            | SlurmState::Requeued
            | SlurmState::Missing
            | SlurmState::Other(_) => Signal::NoInfo,
        },
        Some(JobState::Local(state)) => match state {
            LocalState::Created => Signal::Queued,
            LocalState::Running => Signal::Running,
            LocalState::Missing => Signal::Stopped,
            LocalState::Exited | LocalState::Dead => Signal::Failed,
            LocalState::Restarting | LocalState::Paused => Signal::NoInfo,
        },
    }
}

/// Job id from submission output: last non-empty line, text before `;`
fn parse_job_id(output: &str, job_type: JobType) -> Option<String> {
    let line = output.lines().map(str::trim).rfind(|line| !line.is_empty())?;

    let id = match job_type {
        JobType::Slurm => line.split(';').next().unwrap_or(line).trim(),
        _ => line,
    };

    if id.is_empty() || id.contains(char::is_whitespace) {
        None
    } else {
        Some(id.to_string())
    }
}

/// Coordinates jobs, tunnels and probes for services
pub struct Lifecycle {
    shells: Arc<dyn ShellProvider>,
    tunnels: Arc<dyn Tunnels>,
    probe: Arc<dyn HealthProbe>,
    renderer: Arc<dyn ScriptRenderer>,
}

impl Lifecycle {
    pub fn new(
        shells: Arc<dyn ShellProvider>,
        tunnels: Arc<dyn Tunnels>,
        probe: Arc<dyn HealthProbe>,
        renderer: Arc<dyn ScriptRenderer>,
    ) -> Self {
        Self {
            shells,
            tunnels,
            probe,
            renderer,
        }
    }

    fn shell_for(&self, service: &Service) -> Result<Arc<dyn Shell>, ShellError> {
        self.shells.shell(&service.host, service.user.as_deref())
    }

    /// Renders and submits the service's job
    ///
    /// On success the service carries its `job_id` and is `SUBMITTED`. On
    /// failure the service is left without a job.
    pub async fn start(
        &self,
        service: &mut Service,
        profile: &Profile,
        job_options: &JobOptions,
        container_options: &ContainerOptions,
    ) -> Result<(), StartError> {
        match service.job_type {
            JobType::Ec2 => {
                return Err(StartError::Unsupported("ec2 jobs cannot be started".to_string()));
            }
            JobType::Local if !service.is_local() => {
                return Err(StartError::Unsupported(format!(
                    "local jobs need a local profile, '{}' targets {}",
                    profile.name, service.host
                )));
            }
            _ => {}
        }

        let script = self
            .renderer
            .render(service, profile, job_options, container_options)?;
        let shell = self.shell_for(service)?;

        let home = service.home_dir.trim_end_matches('/');
        let script_path = format!("{}/.kiln/scripts/{}.sh", home, instance_name(service));
        shell.write_file(&script_path, &script).await?;

        let command = match service.job_type {
            JobType::Slurm => format!(
                "mkdir -p {logs} && cd {home} && sbatch --parsable {script}",
                logs = quote(&format!("{}/.kiln/logs", home)),
                home = quote(home),
                script = quote(&script_path)
            ),
            _ => format!("bash {}", quote(&script_path)),
        };

        info!(
            "Submitting {} job for service {} ({})",
            service.job_type, service.name, service.id
        );

        let output = shell.run(&command).await?;
        if !output.success() {
            return Err(StartError::Submit(output.stderr.trim().to_string()));
        }

        let job_id = parse_job_id(&output.stdout, service.job_type)
            .ok_or_else(|| StartError::Parse(output.stdout.clone()))?;

        info!("Service {} submitted as job {}", service.id, job_id);

        service.job_id = Some(job_id);
        service.status = ServiceStatus::Submitted;
        service.updated_at = Utc::now();
        Ok(())
    }

    /// Rebuilds the job handle for a submitted service
    pub fn job(&self, service: &Service) -> Result<Job, LifecycleError> {
        let job_id = service
            .job_id
            .clone()
            .ok_or(LifecycleError::NotStarted(service.id))?;

        match service.job_type {
            JobType::Slurm => Ok(Job::Slurm(SlurmJob::new(
                job_id,
                service.home_dir.clone(),
                self.shell_for(service)?,
            ))),
            JobType::Local => Ok(Job::Local(LocalJob::new(
                job_id,
                service.provider.unwrap_or(Provider::Docker),
                service.home_dir.clone(),
                service.image.container_port(),
                self.shell_for(service)?,
            ))),
            JobType::Ec2 => Err(LifecycleError::Unsupported(JobType::Ec2)),
        }
    }

    /// Current job details for display
    pub async fn job_view(&self, service: &Service) -> Result<JobView, LifecycleError> {
        let mut job = self.job(service)?;
        job.update().await;
        Ok(job.view())
    }

    /// Advances the service one step from its job's current state
    pub async fn refresh(&self, service: &mut Service) -> Result<ServiceStatus, LifecycleError> {
        if service.status.is_terminal() || service.job_id.is_none() {
            return Ok(service.status);
        }

        let mut job = self.job(service)?;
        let state = job.update().await;

        match signal(state.as_ref()) {
            Signal::NoInfo => {
                debug!(
                    "Job {} reported {}, service {} stays {}",
                    job.job_id(),
                    state.map(|s| s.to_string()).unwrap_or_else(|| "nothing".to_string()),
                    service.id,
                    service.status
                );
            }
            Signal::Queued => {
                if matches!(
                    service.status,
                    ServiceStatus::Submitted | ServiceStatus::Pending
                ) {
                    self.transition(service, ServiceStatus::Pending);
                }
            }
            Signal::Running => self.on_running(service, &job).await,
            Signal::Stopped => self.finish(service, &job, false, false).await,
            Signal::Timeout => self.finish(service, &job, true, false).await,
            Signal::Failed => self.finish(service, &job, false, true).await,
        }

        Ok(service.status)
    }

    async fn on_running(&self, service: &mut Service, job: &Job) {
        if service.port.is_none() {
            if let Err(e) = self.tunnels.open(service, job).await {
                warn!("Tunnel for service {} not open: {}", service.id, e);
                self.unresponsive(service);
                return;
            }
        }

        let Some(port) = service.port else {
            self.unresponsive(service);
            return;
        };

        let ping = self.probe.ping(port, service.image.health_path()).await;
        if ping.ok {
            self.transition(service, ServiceStatus::Healthy);
        } else {
            self.unresponsive(service);
        }
    }

    /// Running but not answering probes
    fn unresponsive(&self, service: &mut Service) {
        let next = match service.status {
            ServiceStatus::Healthy | ServiceStatus::Unhealthy => ServiceStatus::Unhealthy,
            _ if service.grace_period_exceeded(Utc::now()) => ServiceStatus::Unhealthy,
            _ => ServiceStatus::Starting,
        };
        self.transition(service, next);
    }

    fn transition(&self, service: &mut Service, next: ServiceStatus) {
        if service.status != next {
            info!("Service {}: {} -> {}", service.id, service.status, next);
            service.status = next;
            service.updated_at = Utc::now();
        }
    }

    /// Stops the service's job and moves it to a terminal status
    ///
    /// `failed` wins over `timeout` when both are set. A no-op on terminal
    /// services.
    pub async fn stop(
        &self,
        service: &mut Service,
        timeout: bool,
        failed: bool,
    ) -> Result<(), LifecycleError> {
        if service.status.is_terminal() {
            return Ok(());
        }

        let job = self.job(service)?;
        self.finish(service, &job, timeout, failed).await;
        Ok(())
    }

    async fn finish(&self, service: &mut Service, job: &Job, timeout: bool, failed: bool) {
        job.cancel().await;
        self.tunnels.close(service).await;

        let next = if failed {
            ServiceStatus::Failed
        } else if timeout {
            ServiceStatus::Timeout
        } else {
            ServiceStatus::Stopped
        };

        self.transition(service, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::DefaultRenderer;
    use crate::testing::{
        FakeProbe, FakeShell, FakeShells, FakeTunnels, local_profile, local_service,
        slurm_profile, slurm_service,
    };
    use chrono::Duration;

    struct Harness {
        shell: Arc<FakeShell>,
        shells: Arc<FakeShells>,
        tunnels: Arc<FakeTunnels>,
        probe: Arc<FakeProbe>,
        lifecycle: Lifecycle,
    }

    fn harness() -> Harness {
        let shell = FakeShell::new();
        let shells = Arc::new(FakeShells::new(shell.clone()));
        let tunnels = Arc::new(FakeTunnels::default());
        let probe = Arc::new(FakeProbe::default());
        let lifecycle = Lifecycle::new(
            shells.clone(),
            tunnels.clone(),
            probe.clone(),
            Arc::new(DefaultRenderer),
        );

        Harness {
            shell,
            shells,
            tunnels,
            probe,
            lifecycle,
        }
    }

    fn running_slurm(status: ServiceStatus) -> Service {
        let mut service = slurm_service();
        service.status = status;
        service.job_id = Some("4242".to_string());
        service
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id("4242\n", JobType::Slurm), Some("4242".to_string()));
        assert_eq!(
            parse_job_id("Submitted\n4242;della\n\n", JobType::Slurm),
            Some("4242".to_string())
        );
        assert_eq!(
            parse_job_id("Unable to find image\nc0ffee1234\n", JobType::Local),
            Some("c0ffee1234".to_string())
        );
        assert_eq!(parse_job_id("\n  \n", JobType::Local), None);
        assert_eq!(parse_job_id("not a job id", JobType::Local), None);
    }

    #[test]
    fn test_signal_mapping() {
        let slurm = |s| signal(Some(&JobState::Slurm(s)));
        let local = |s| signal(Some(&JobState::Local(s)));

        assert_eq!(slurm(SlurmState::Pending), Signal::Queued);
        assert_eq!(slurm(SlurmState::Completed), Signal::Stopped);
        assert_eq!(slurm(SlurmState::Timeout), Signal::Timeout);
        assert_eq!(slurm(SlurmState::NodeFail), Signal::Failed);
        assert_eq!(slurm(SlurmState::Missing), Signal::NoInfo);
        assert_eq!(slurm(SlurmState::Other("RESIZING".into())), Signal::NoInfo);
        assert_eq!(local(LocalState::Created), Signal::Queued);
        assert_eq!(local(LocalState::Missing), Signal::Stopped);
        assert_eq!(local(LocalState::Exited), Signal::Failed);
        assert_eq!(local(LocalState::Paused), Signal::NoInfo);
        assert_eq!(signal(None), Signal::NoInfo);
    }

    #[tokio::test]
    async fn test_healthy_local_service_scenario() {
        let h = harness();
        let mut service = local_service();

        h.shell.on("bash", "c0ffee\n");
        h.lifecycle
            .start(
                &mut service,
                &local_profile(),
                &JobOptions::default(),
                &ContainerOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(service.status, ServiceStatus::Submitted);
        assert_eq!(service.job_id.as_deref(), Some("c0ffee"));
        assert_eq!(h.shell.written().len(), 1);
        assert!(h.shell.written()[0].0.starts_with("/home/alice/.kiln/scripts/kiln-tgi-test-"));

        h.shell.on("docker inspect", "created\n");
        h.shell.on("docker inspect", "running\n");
        h.shell.on("docker port", "127.0.0.1:32768\n");

        assert_eq!(
            h.lifecycle.refresh(&mut service).await.unwrap(),
            ServiceStatus::Pending
        );

        h.probe.set_ok(true);
        assert_eq!(
            h.lifecycle.refresh(&mut service).await.unwrap(),
            ServiceStatus::Healthy
        );
        assert_eq!(service.port, Some(32768));
        assert_eq!(h.tunnels.opens(), 1);
        assert_eq!(h.probe.calls(), 1);

        h.lifecycle.stop(&mut service, false, false).await.unwrap();
        assert_eq!(service.status, ServiceStatus::Stopped);
        assert_eq!(service.port, None);
        assert_eq!(h.shell.count("docker stop"), 1);
        assert_eq!(h.tunnels.closes(), 1);
    }

    #[tokio::test]
    async fn test_slurm_timeout_scenario() {
        let h = harness();
        let mut service = running_slurm(ServiceStatus::Pending);
        service.port = Some(8123);
        h.shell.on("sacct", "TIMEOUT\n");

        let status = h.lifecycle.refresh(&mut service).await.unwrap();

        assert_eq!(status, ServiceStatus::Timeout);
        assert_eq!(h.shell.count("scancel"), 1);
        assert_eq!(h.tunnels.closes(), 1);
        assert_eq!(service.port, None);
    }

    #[tokio::test]
    async fn test_slurm_submission() {
        let h = harness();
        let mut service = slurm_service();
        h.shell.on("mkdir", "4242;della\n");

        h.lifecycle
            .start(
                &mut service,
                &slurm_profile(),
                &JobOptions::default(),
                &ContainerOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(service.job_id.as_deref(), Some("4242"));
        let command = h.shell.commands().pop().unwrap();
        assert!(command.contains("sbatch --parsable /home/alice/.kiln/scripts/"));
        assert!(h.shell.written()[0].1.contains("#SBATCH --job-name=tgi-test"));
    }

    #[tokio::test]
    async fn test_failed_submission_leaves_no_job() {
        let h = harness();
        let mut service = slurm_service();
        h.shell
            .on_output("mkdir", 1, "", "sbatch: error: invalid partition specified");

        let result = h
            .lifecycle
            .start(
                &mut service,
                &slurm_profile(),
                &JobOptions::default(),
                &ContainerOptions::default(),
            )
            .await;

        assert!(matches!(result, Err(StartError::Submit(_))));
        assert!(service.job_id.is_none());
    }

    #[tokio::test]
    async fn test_ec2_start_is_unsupported() {
        let h = harness();
        let mut service = local_service();
        service.job_type = JobType::Ec2;

        let result = h
            .lifecycle
            .start(
                &mut service,
                &local_profile(),
                &JobOptions::default(),
                &ContainerOptions::default(),
            )
            .await;

        assert!(matches!(result, Err(StartError::Unsupported(_))));
        assert!(h.shell.commands().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_statuses_absorb_everything() {
        for status in [
            ServiceStatus::Stopped,
            ServiceStatus::Timeout,
            ServiceStatus::Failed,
        ] {
            let h = harness();
            let mut service = running_slurm(status);
            service.port = Some(8123);

            assert_eq!(h.lifecycle.refresh(&mut service).await.unwrap(), status);
            h.lifecycle.stop(&mut service, true, true).await.unwrap();

            assert_eq!(service.status, status);
            assert_eq!(service.port, Some(8123));
            assert_eq!(h.shells.calls(), 0);
            assert!(h.shell.commands().is_empty());
            assert_eq!(h.tunnels.opens() + h.tunnels.closes(), 0);
        }
    }

    #[tokio::test]
    async fn test_grace_period_boundary() {
        let grace = Duration::seconds(180);

        let h = harness();
        h.shell.on("sacct", "RUNNING\n");
        let mut service = running_slurm(ServiceStatus::Starting);
        service.port = Some(8123);
        service.created_at = Utc::now() - grace - Duration::seconds(1);
        assert_eq!(
            h.lifecycle.refresh(&mut service).await.unwrap(),
            ServiceStatus::Unhealthy
        );

        let h = harness();
        h.shell.on("sacct", "RUNNING\n");
        let mut service = running_slurm(ServiceStatus::Starting);
        service.port = Some(8123);
        service.created_at = Utc::now() - grace + Duration::seconds(1);
        assert_eq!(
            h.lifecycle.refresh(&mut service).await.unwrap(),
            ServiceStatus::Starting
        );
    }

    #[tokio::test]
    async fn test_healthy_service_gets_no_grace() {
        let h = harness();
        h.shell.on("sacct", "RUNNING\n");
        let mut service = running_slurm(ServiceStatus::Healthy);
        service.port = Some(8123);

        assert_eq!(
            h.lifecycle.refresh(&mut service).await.unwrap(),
            ServiceStatus::Unhealthy
        );

        h.probe.set_ok(true);
        assert_eq!(
            h.lifecycle.refresh(&mut service).await.unwrap(),
            ServiceStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_tunnel_failure_counts_as_failed_probe() {
        let h = harness();
        h.shell.on("sacct", "RUNNING\n");
        h.tunnels.fail_open(true);
        h.probe.set_ok(true);
        let mut service = running_slurm(ServiceStatus::Pending);

        assert_eq!(
            h.lifecycle.refresh(&mut service).await.unwrap(),
            ServiceStatus::Starting
        );
        assert_eq!(h.probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_job_states_without_information_keep_status() {
        let h = harness();
        h.shell.on("sacct", "");
        let mut service = running_slurm(ServiceStatus::Pending);

        assert_eq!(
            h.lifecycle.refresh(&mut service).await.unwrap(),
            ServiceStatus::Pending
        );
        assert_eq!(h.tunnels.closes(), 0);
    }

    #[tokio::test]
    async fn test_job_failure_states() {
        let h = harness();
        h.shell.on("sacct", "NODE_FAIL\n");
        let mut service = running_slurm(ServiceStatus::Healthy);
        assert_eq!(
            h.lifecycle.refresh(&mut service).await.unwrap(),
            ServiceStatus::Failed
        );

        let h = harness();
        h.shell.on("sacct", "COMPLETED\n");
        let mut service = running_slurm(ServiceStatus::Healthy);
        assert_eq!(
            h.lifecycle.refresh(&mut service).await.unwrap(),
            ServiceStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_stop_precedence() {
        let h = harness();
        let mut service = running_slurm(ServiceStatus::Healthy);
        let before = Utc::now() - Duration::hours(1);
        service.updated_at = before;
        h.lifecycle.stop(&mut service, true, true).await.unwrap();
        assert_eq!(service.status, ServiceStatus::Failed);
        assert!(service.updated_at > before);

        let mut service = running_slurm(ServiceStatus::Healthy);
        h.lifecycle.stop(&mut service, true, false).await.unwrap();
        assert_eq!(service.status, ServiceStatus::Timeout);
    }

    #[tokio::test]
    async fn test_stop_without_job_is_an_error() {
        let h = harness();
        let mut service = slurm_service();
        assert!(matches!(
            h.lifecycle.stop(&mut service, false, false).await,
            Err(LifecycleError::NotStarted(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_without_job_is_noop() {
        let h = harness();
        let mut service = slurm_service();
        assert_eq!(
            h.lifecycle.refresh(&mut service).await.unwrap(),
            ServiceStatus::Submitted
        );
        assert_eq!(h.shells.calls(), 0);
    }
}
