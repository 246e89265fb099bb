//! Execution engine core for the Skein canvas orchestrator.
//!
//! This crate defines the "ports" (repository and provider traits) that the
//! infrastructure layer implements, and the engine services built on them:
//! - `expression` -- `${{ inputs.* }}` / `${{ secrets.* }}` spec resolution
//! - `filter` -- JEXL evaluation for connection filters and group-by fields
//! - `executor` -- the pluggable backend contract and response shape
//! - `queue` -- per-node dequeue discipline and executor dispatch
//! - `lifecycle` -- cancellation cascade, error resolution, pause/resume
//! - `aggregation` -- connection-group join engine and timeout sweep
//! - `router` -- event emission and connection matching
//! - `blueprint` -- blueprint expansion into internal sub-graphs
//! - `canvas` -- canvas update validation and maintenance
//! - `worker` -- background loops (queue, sweeper, reconciler)
//!
//! It depends only on `skein-types` -- never on a database or HTTP crate.

pub mod aggregation;
pub mod blueprint;
pub mod canvas;
pub mod executor;
pub mod expression;
pub mod filter;
pub mod lifecycle;
pub mod queue;
pub mod repository;
pub mod router;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;
