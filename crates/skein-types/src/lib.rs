//! Shared domain types for the Skein canvas orchestrator.
//!
//! This crate contains the core domain types used across the platform:
//! nodes, events, queue items, executions, connections, connection groups,
//! executor specs, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod connection;
pub mod error;
pub mod event;
pub mod execution;
pub mod group;
pub mod node;
pub mod spec;
