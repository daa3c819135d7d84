//! Core domain types
//!
//! This module contains the core domain structures used across Kiln.
//! They are shared between the orchestrator (which persists and drives them)
//! and the CLI (which renders them).

pub mod profile;
pub mod service;
