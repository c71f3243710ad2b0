//! Common test utilities
//!
//! This module provides shared functionality for integration tests including:
//! - Service construction with fast, deterministic timings
//! - Event collection helpers
//! - Flaky operation builders
#![allow(dead_code)]

pub mod fixtures;

pub use fixtures::*;
