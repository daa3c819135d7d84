//! Repository Module
//!
//! Data access layer for the orchestrator.
//! The `ServiceStore` trait is the seam the service manager depends on;
//! `service` holds the PostgreSQL implementation.

pub mod service;

use async_trait::async_trait;
use kiln_core::domain::service::{Service, ServiceStatus};
use kiln_core::dto::service::ServiceFilter;
use thiserror::Error;
use uuid::Uuid;

pub use service::PgServiceStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Service {0} not found")]
    NotFound(Uuid),

    /// Only terminal services may be deleted
    #[error("Service {0} is {1}; only stopped, timed out or failed services can be deleted")]
    NotTerminal(Uuid, ServiceStatus),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable storage of service records
#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn add(&self, service: &Service) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Service>, StoreError>;

    async fn update(&self, service: &Service) -> Result<(), StoreError>;

    async fn list(&self, filter: &ServiceFilter) -> Result<Vec<Service>, StoreError>;

    /// Services not yet in a terminal status
    async fn list_active(&self) -> Result<Vec<Service>, StoreError>;

    /// Removes a terminal service
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}
