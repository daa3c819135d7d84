//! Service Module
//!
//! Business logic layer for the orchestrator.
//! The manager orchestrates between the store, the profile registry and the
//! lifecycle, and owns per-service locking.

pub mod manager;

// Re-export for convenience
pub use manager::{ServiceError, ServiceManager};
