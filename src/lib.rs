//! Failure handling for location-tracking services
//!
//! Classifies failures into a fixed taxonomy, dispatches them through
//! handlers and recovery strategies, retries transient operations with
//! backoff behind per-resource circuit breakers, and runs deferred retries
//! in the background.

// Allow complex types for boxed async callbacks
#![allow(clippy::type_complexity)]

pub mod config;
pub mod error;
pub mod events;
pub mod service;

// Re-export the composition root and the most used types for convenience
pub use config::{CircuitBreakerConfig, ConfigError, ResilienceConfig, RetryPolicyConfig};
pub use error::{
    ErrorContext, ErrorDispatcher, ErrorKind, ErrorRecord, ErrorReport, RetryOptions, Severity,
};
pub use events::{EventBus, RecoverySignal, ResilienceEvent};
pub use service::{global, Resilience};
