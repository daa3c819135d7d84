//! Data Transfer Objects for the REST API
//!
//! Lightweight request and view types exchanged between the orchestrator
//! and its clients.

pub mod service;
