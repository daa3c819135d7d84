//! Service manager
//!
//! Business logic for services: resolves profiles, runs the lifecycle and
//! persists every change. Operations on one service id are serialized by an
//! in-process lock so two refreshes never race on tunnel allocation.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use uuid::Uuid;

use kiln_core::domain::service::{Service, ServiceStatus};
use kiln_core::dto::service::{CreateService, JobView, ServiceFilter, StopService};

use crate::lifecycle::{Lifecycle, LifecycleError, StartError};
use crate::profiles::{ProfileError, ProfileRegistry};
use crate::repository::{ServiceStore, StoreError};

/// Service error type
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service {0} not found")]
    NotFound(Uuid),

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

type LockMap = Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive hold on one service id
///
/// Dropping it releases the id and evicts its map entry once nobody else
/// holds or waits for it.
struct ServiceLock<'a> {
    locks: &'a LockMap,
    id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ServiceLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

/// Owns service operations end to end
pub struct ServiceManager {
    store: Arc<dyn ServiceStore>,
    profiles: Arc<ProfileRegistry>,
    lifecycle: Lifecycle,
    default_grace_period: u64,
    locks: LockMap,
}

impl ServiceManager {
    pub fn new(
        store: Arc<dyn ServiceStore>,
        profiles: Arc<ProfileRegistry>,
        lifecycle: Lifecycle,
        default_grace_period: u64,
    ) -> Self {
        Self {
            store,
            profiles,
            lifecycle,
            default_grace_period,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, id: Uuid) -> ServiceLock<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(id).or_default().clone()
        };

        ServiceLock {
            locks: &self.locks,
            id,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn load(&self, id: Uuid) -> Result<Service, ServiceError> {
        self.store.get(id).await?.ok_or(ServiceError::NotFound(id))
    }

    /// Creates a service, submits its job and persists it
    ///
    /// Nothing is stored unless the job was accepted.
    pub async fn start(&self, req: CreateService) -> Result<Service, ServiceError> {
        let profile = self.profiles.resolve(&req.profile)?;

        let mut service = Service::from_request(&req, &profile);
        if req.grace_period.is_none() {
            service.grace_period = self.default_grace_period;
        }

        self.lifecycle
            .start(&mut service, &profile, &req.job_options, &req.container_options)
            .await?;

        self.store.add(&service).await?;
        tracing::info!(
            "Service {} ({}) started on profile {}",
            service.name,
            service.id,
            service.profile
        );

        Ok(service)
    }

    /// Refreshes one service and returns its current record
    pub async fn get(&self, id: Uuid) -> Result<Service, ServiceError> {
        let _lock = self.lock(id).await;

        let mut service = self.load(id).await?;
        self.refresh_loaded(&mut service).await?;
        Ok(service)
    }

    /// Refreshes one service and returns its status
    pub async fn refresh(&self, id: Uuid) -> Result<ServiceStatus, ServiceError> {
        Ok(self.get(id).await?.status)
    }

    async fn refresh_loaded(&self, service: &mut Service) -> Result<(), ServiceError> {
        let before = (service.status, service.port, service.job_id.clone());
        self.lifecycle.refresh(service).await?;

        if before != (service.status, service.port, service.job_id.clone()) {
            self.store.update(service).await?;
        }
        Ok(())
    }

    /// Lists services matching `filter`, refreshing each match concurrently
    ///
    /// A service whose refresh fails is returned as stored.
    pub async fn list(&self, filter: &ServiceFilter) -> Result<Vec<Service>, ServiceError> {
        let services = self.store.list(filter).await?;

        let refreshed = join_all(services.into_iter().map(|stored| async move {
            match self.get(stored.id).await {
                Ok(service) => service,
                Err(e) => {
                    tracing::warn!("Failed to refresh service {}: {}", stored.id, e);
                    stored
                }
            }
        }))
        .await;

        Ok(refreshed)
    }

    /// Refreshes every non-terminal service, returning how many were refreshed
    pub async fn refresh_active(&self) -> Result<usize, ServiceError> {
        let active = self.store.list_active().await?;
        let count = active.len();

        let results = join_all(active.iter().map(|s| self.refresh(s.id))).await;
        for (service, result) in active.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("Failed to refresh service {}: {}", service.id, e);
            }
        }

        Ok(count)
    }

    /// Job details of a service
    pub async fn get_job(&self, id: Uuid) -> Result<JobView, ServiceError> {
        let service = self.load(id).await?;
        Ok(self.lifecycle.job_view(&service).await?)
    }

    /// Stops a service; a no-op if it already reached a terminal status
    pub async fn stop(&self, id: Uuid, req: StopService) -> Result<Service, ServiceError> {
        let _lock = self.lock(id).await;

        let mut service = self.load(id).await?;
        if service.status.is_terminal() {
            return Ok(service);
        }

        self.lifecycle
            .stop(&mut service, req.timeout, req.failed)
            .await?;
        self.store.update(&service).await?;

        tracing::info!("Service {} stopped as {}", id, service.status);
        Ok(service)
    }

    /// Deletes a terminal service
    pub async fn delete(&self, id: Uuid) -> Result<(), ServiceError> {
        let _lock = self.lock(id).await;

        let service = self.load(id).await?;
        if !service.status.is_terminal() {
            return Err(ServiceError::InvalidState(format!(
                "Service {} is {}; stop it before deleting",
                id, service.status
            )));
        }

        self.store.delete(id).await?;

        tracing::info!("Service {} deleted", id);
        Ok(())
    }

    /// Polls until the service is healthy or terminal, or `timeout` elapses
    ///
    /// Returns the last status seen; running out of time is not an error.
    pub async fn wait(
        &self,
        id: Uuid,
        timeout: Duration,
        interval: Duration,
    ) -> Result<ServiceStatus, ServiceError> {
        // Too far in the future to represent means no deadline
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let status = self.refresh(id).await?;
            if status == ServiceStatus::Healthy || status.is_terminal() {
                return Ok(status);
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::debug!("Gave up waiting for service {} at {}", id, status);
                        return Ok(status);
                    }
                    interval.min(deadline - now)
                }
                None => interval,
            };

            tokio::time::sleep(pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::DefaultRenderer;
    use crate::testing::{
        FakeProbe, FakeShell, FakeShells, FakeTunnels, MemoryStore, local_profile, request,
        slurm_profile, slurm_service,
    };
    use kiln_core::domain::service::JobType;

    struct Harness {
        shell: Arc<FakeShell>,
        probe: Arc<FakeProbe>,
        store: Arc<MemoryStore>,
        manager: ServiceManager,
    }

    fn harness() -> Harness {
        let shell = FakeShell::new();
        let probe = Arc::new(FakeProbe::default());
        let store = Arc::new(MemoryStore::default());
        let profiles =
            Arc::new(ProfileRegistry::new(vec![local_profile(), slurm_profile()]).unwrap());
        let lifecycle = Lifecycle::new(
            Arc::new(FakeShells::new(shell.clone())),
            Arc::new(FakeTunnels::default()),
            probe.clone(),
            Arc::new(DefaultRenderer),
        );

        Harness {
            shell,
            probe,
            store: store.clone(),
            manager: ServiceManager::new(store, profiles, lifecycle, 120),
        }
    }

    fn submitted(status: ServiceStatus) -> Service {
        let mut service = slurm_service();
        service.job_id = Some("4242".to_string());
        service.status = status;
        service
    }

    #[tokio::test]
    async fn test_start_persists_after_submission() {
        let h = harness();
        h.shell.on("mkdir", "4242\n");

        let service = h.manager.start(request("della")).await.unwrap();
        assert_eq!(service.job_type, JobType::Slurm);
        assert_eq!(service.grace_period, 120);

        let stored = h.store.snapshot(service.id).unwrap();
        assert_eq!(stored.job_id.as_deref(), Some("4242"));
        assert_eq!(stored.status, ServiceStatus::Submitted);
    }

    #[tokio::test]
    async fn test_failed_start_persists_nothing() {
        let h = harness();
        h.shell.on_output("mkdir", 1, "", "sbatch: error: Batch job submission failed");

        let result = h.manager.start(request("della")).await;
        assert!(matches!(result, Err(ServiceError::Start(_))));
        assert!(h.manager.list(&ServiceFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_profile() {
        let h = harness();
        let result = h.manager.start(request("perlmutter")).await;
        assert!(matches!(
            result,
            Err(ServiceError::Profile(ProfileError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_get_refreshes_and_persists() {
        let h = harness();
        let service = submitted(ServiceStatus::Submitted);
        h.store.insert(service.clone());
        h.shell.on("sacct", "PENDING\n");

        let refreshed = h.manager.get(service.id).await.unwrap();
        assert_eq!(refreshed.status, ServiceStatus::Pending);
        assert_eq!(
            h.store.snapshot(service.id).unwrap().status,
            ServiceStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_list_refreshes_every_match() {
        let h = harness();
        let first = submitted(ServiceStatus::Submitted);
        let second = submitted(ServiceStatus::Submitted);
        let done = submitted(ServiceStatus::Stopped);
        h.store.insert(first.clone());
        h.store.insert(second.clone());
        h.store.insert(done.clone());
        h.shell.on("sacct", "PENDING\n");

        let services = h.manager.list(&ServiceFilter::default()).await.unwrap();
        assert_eq!(services.len(), 3);
        assert_eq!(h.shell.count("sacct"), 2);

        let pending = services
            .iter()
            .filter(|s| s.status == ServiceStatus::Pending)
            .count();
        assert_eq!(pending, 2);
    }

    #[tokio::test]
    async fn test_list_filters_before_refresh() {
        let h = harness();
        h.store.insert(submitted(ServiceStatus::Submitted));

        let filter = ServiceFilter {
            profile: Some("local".to_string()),
            ..Default::default()
        };
        assert!(h.manager.list(&filter).await.unwrap().is_empty());
        assert_eq!(h.shell.count("sacct"), 0);
    }

    #[tokio::test]
    async fn test_delete_refused_while_running() {
        let h = harness();
        let service = submitted(ServiceStatus::Healthy);
        h.store.insert(service.clone());

        assert!(matches!(
            h.manager.delete(service.id).await,
            Err(ServiceError::InvalidState(_))
        ));
        assert!(h.store.snapshot(service.id).is_some());

        h.manager
            .stop(service.id, StopService::default())
            .await
            .unwrap();
        h.manager.delete(service.id).await.unwrap();
        assert!(h.store.snapshot(service.id).is_none());
    }

    #[tokio::test]
    async fn test_stop_is_persisted() {
        let h = harness();
        let service = submitted(ServiceStatus::Pending);
        h.store.insert(service.clone());

        let stopped = h
            .manager
            .stop(
                service.id,
                StopService {
                    timeout: true,
                    failed: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(stopped.status, ServiceStatus::Timeout);
        assert_eq!(
            h.store.snapshot(service.id).unwrap().status,
            ServiceStatus::Timeout
        );
        assert_eq!(h.shell.count("scancel"), 1);
    }

    #[tokio::test]
    async fn test_missing_service() {
        let h = harness();
        assert!(matches!(
            h.manager.get(Uuid::new_v4()).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_job_view() {
        let h = harness();
        let service = submitted(ServiceStatus::Starting);
        h.store.insert(service.clone());
        h.shell.on("sacct", "RUNNING\n");
        h.shell.on("squeue", "della-l01g2\n");
        h.shell.on("cat", "8123\n");

        let view = h.manager.get_job(service.id).await.unwrap();
        assert_eq!(view.job_id, "4242");
        assert_eq!(view.state.as_deref(), Some("RUNNING"));
        assert_eq!(view.node.as_deref(), Some("della-l01g2"));
        assert_eq!(view.port, Some(8123));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_last_status_on_timeout() {
        let h = harness();
        let service = submitted(ServiceStatus::Submitted);
        h.store.insert(service.clone());
        h.shell.on("sacct", "PENDING\n");

        let status = h
            .manager
            .wait(service.id, Duration::from_secs(10), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(status, ServiceStatus::Pending);
        assert!(h.shell.count("sacct") >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_stops_when_healthy() {
        let h = harness();
        let mut service = submitted(ServiceStatus::Starting);
        service.port = Some(8123);
        h.store.insert(service.clone());
        h.shell.on("sacct", "RUNNING\n");
        h.probe.set_ok(true);

        let status = h
            .manager
            .wait(service.id, Duration::from_secs(60), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(status, ServiceStatus::Healthy);
        assert_eq!(h.shell.count("sacct"), 1);
    }

    #[tokio::test]
    async fn test_refresh_active_skips_terminal() {
        let h = harness();
        h.store.insert(submitted(ServiceStatus::Pending));
        h.store.insert(submitted(ServiceStatus::Failed));
        h.shell.on("sacct", "RUNNING\n");

        assert_eq!(h.manager.refresh_active().await.unwrap(), 1);
        assert_eq!(h.shell.count("sacct"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_without_representable_deadline() {
        let h = harness();
        let mut service = submitted(ServiceStatus::Starting);
        service.port = Some(8123);
        h.store.insert(service.clone());
        h.shell.on("sacct", "RUNNING\n");

        let becomes_healthy = async {
            tokio::time::sleep(Duration::from_secs(12)).await;
            h.probe.set_ok(true);
        };
        let (status, ()) = tokio::join!(
            h.manager
                .wait(service.id, Duration::from_secs(u64::MAX), Duration::from_secs(5)),
            becomes_healthy
        );

        assert_eq!(status.unwrap(), ServiceStatus::Healthy);
        assert!(h.shell.count("sacct") >= 3);
    }

    #[tokio::test]
    async fn test_locks_released_for_unknown_ids() {
        let h = harness();
        for _ in 0..100 {
            assert!(h.manager.get(Uuid::new_v4()).await.is_err());
        }
        assert_eq!(h.manager.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_locks_released_after_each_operation() {
        let h = harness();
        let service = submitted(ServiceStatus::Pending);
        h.store.insert(service.clone());
        h.shell.on("sacct", "PENDING\n");

        h.manager.get(service.id).await.unwrap();
        assert_eq!(h.manager.held_locks(), 0);

        h.manager
            .stop(service.id, StopService::default())
            .await
            .unwrap();
        assert_eq!(h.manager.held_locks(), 0);

        // terminal and never deleted
        h.manager.get(service.id).await.unwrap();
        assert_eq!(h.manager.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_lock_kept_while_contended() {
        let h = harness();
        let service = submitted(ServiceStatus::Stopped);
        h.store.insert(service.clone());

        let held = h.manager.lock(service.id).await;
        let get = h.manager.get(service.id);
        tokio::pin!(get);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut get)
                .await
                .is_err()
        );
        assert_eq!(h.manager.held_locks(), 1);

        drop(held);
        assert_eq!(h.manager.held_locks(), 1);
        assert_eq!(get.await.unwrap().status, ServiceStatus::Stopped);
        assert_eq!(h.manager.held_locks(), 0);
    }
}
