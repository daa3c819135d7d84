//! Kiln Core
//!
//! Core types shared by the Kiln orchestrator and CLI.
//!
//! This crate contains:
//! - Domain types: Services, their lifecycle status, deployment profiles
//! - DTOs: Request and filter types exchanged over the REST API

pub mod domain;
pub mod dto;
