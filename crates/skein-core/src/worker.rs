//! Background workers: queue polling, group timeout sweeping, and async
//! execution reconciliation.
//!
//! Independent concurrent loops pulling ready work from the store. They
//! operate on disjoint scopes (per node, per field set, per execution), so
//! cross-scope work is naturally parallel; contention only arises inside
//! the store's guarded transitions. All loops shut down cooperatively via
//! a shared `CancellationToken`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::executor::{BindingProvider, Executor, TokenSigner};
use crate::queue::Dispatcher;
use crate::repository::Store;

/// Polling cadences for the three loops.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_interval: Duration,
    pub sweep_interval: Duration,
    pub reconcile_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(5),
        }
    }
}

/// Drive queue heads: dequeue and dispatch for every node with backlog.
pub async fn run_queue_worker<S, X, B, T>(
    dispatcher: Arc<Dispatcher<S, X, B, T>>,
    interval: Duration,
    cancel: CancellationToken,
) where
    S: Store,
    X: Executor,
    B: BindingProvider,
    T: TokenSigner,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match dispatcher.tick_all().await {
                    Ok(started) if !started.is_empty() => {
                        tracing::debug!(count = started.len(), "queue worker dispatched executions");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "queue worker pass failed"),
                }
            }
        }
    }
    tracing::info!("queue worker stopped");
}

/// Apply timeout behavior to overdue pending field sets.
pub async fn run_timeout_sweeper<S, X, B, T>(
    dispatcher: Arc<Dispatcher<S, X, B, T>>,
    interval: Duration,
    cancel: CancellationToken,
) where
    S: Store,
    X: Executor,
    B: BindingProvider,
    T: TokenSigner,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match dispatcher.router().sweep_groups(Utc::now()).await {
                    Ok(emitted) if emitted > 0 => {
                        tracing::info!(emitted, "timeout sweep emitted partial field sets");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "timeout sweep failed"),
                }
            }
        }
    }
    tracing::info!("timeout sweeper stopped");
}

/// Poll async backends for STARTED executions.
///
/// This is also the crash-recovery path: an execution left STARTED by a
/// worker that died mid-call gets picked up here and completed via `check`.
pub async fn run_reconciler<S, X, B, T>(
    dispatcher: Arc<Dispatcher<S, X, B, T>>,
    interval: Duration,
    cancel: CancellationToken,
) where
    S: Store,
    X: Executor,
    B: BindingProvider,
    T: TokenSigner,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match dispatcher.reconcile_once().await {
                    Ok(completed) if completed > 0 => {
                        tracing::info!(completed, "reconciler completed executions");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "reconciliation pass failed"),
                }
            }
        }
    }
    tracing::info!("reconciler stopped");
}

/// Spawn all three loops with the given config.
pub fn spawn_workers<S, X, B, T>(
    dispatcher: Arc<Dispatcher<S, X, B, T>>,
    config: WorkerConfig,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>>
where
    S: Store + 'static,
    X: Executor + 'static,
    B: BindingProvider + 'static,
    T: TokenSigner + 'static,
{
    vec![
        tokio::spawn(run_queue_worker(
            Arc::clone(&dispatcher),
            config.queue_interval,
            cancel.clone(),
        )),
        tokio::spawn(run_timeout_sweeper(
            Arc::clone(&dispatcher),
            config.sweep_interval,
            cancel.clone(),
        )),
        tokio::spawn(run_reconciler(
            dispatcher,
            config.reconcile_interval,
            cancel,
        )),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
