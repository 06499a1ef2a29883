#![deny(missing_docs)]
//! Lurkwarden core library.
//!
//! Membership reconciliation and moderation engine: persisted membership model,
//! platform gateway abstraction, sweeper, event handler, executor and enforcer.

/// Per-chat admin id cache.
pub mod admin_cache;
/// Configuration management.
pub mod config;
/// Process-wide coordination flags and hall passes.
pub mod coordination;
/// Operator diagnostics channel.
pub mod diagnostics;
/// Pure membership diffing.
pub mod diff;
/// Error types of the moderation layer.
pub mod error;
/// Real-time membership and message event handling.
pub mod events;
/// Purge/kick/ban exemptions.
pub mod exemption;
/// Batched kick/ban execution.
pub mod executor;
/// Platform query interface.
pub mod gateway;
/// Membership data model.
pub mod model;
/// Command facade used by transports.
pub mod moderator;
/// Cross-chat membership obligations.
pub mod obligation;
/// Rate-limit aware retry loop.
pub mod retry;
/// Persistence layer (memory / R2).
pub mod storage;
/// Periodic membership reconciliation.
pub mod sweeper;
/// Utility functions.
pub mod utils;

#[cfg(test)]
pub mod testing;
