//! Event routing: the emit capability and connection matching.
//!
//! An emitted event is persisted, then matched against every connection
//! whose source produced it. Direct node targets get a queue item; group
//! targets go through the aggregation engine. A group emission is itself
//! routed recursively (groups can feed nodes and other groups), handled
//! here as an iterative work list rather than recursion.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use skein_types::connection::{Connection, ConnectionTarget, FilterOperator};
use skein_types::error::RepositoryError;
use skein_types::event::{Event, EventOrigin, QueueItem};
use uuid::Uuid;

use crate::aggregation::{Arrival, GroupEngine, GroupError};
use crate::filter::EventEvaluator;
use crate::repository::{ConnectionRepository, EventRepository, Store};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while routing events.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("aggregation error: {0}")]
    Group(#[from] GroupError),
}

// ---------------------------------------------------------------------------
// EventRouter
// ---------------------------------------------------------------------------

/// Matches produced events against downstream connections and dispatches
/// them into node queues or connection-group field sets.
pub struct EventRouter<S> {
    store: Arc<S>,
    engine: GroupEngine<S>,
    evaluator: EventEvaluator,
}

impl<S: Store> EventRouter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            engine: GroupEngine::new(Arc::clone(&store)),
            store,
            evaluator: EventEvaluator::new(),
        }
    }

    pub fn engine(&self) -> &GroupEngine<S> {
        &self.engine
    }

    /// Persist and route an event, following group emissions until the
    /// cascade drains. Returns the ids of every event persisted.
    pub async fn emit(&self, event: Event) -> Result<Vec<Uuid>, RouterError> {
        let mut persisted = Vec::new();
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            self.store.create_event(&event).await?;
            persisted.push(event.id);

            let connections = self
                .store
                .connections_from(event.origin, &event.source_id)
                .await?;
            tracing::debug!(
                event_id = %event.id,
                channel = event.channel.as_str(),
                candidates = connections.len(),
                "routing event"
            );

            for connection in connections {
                if !self.matches(&connection, &event) {
                    continue;
                }
                match connection.target {
                    ConnectionTarget::Node { id } => {
                        self.store.enqueue(&QueueItem::new(id, event.id)).await?;
                    }
                    ConnectionTarget::Group { .. } => {
                        match self.engine.on_event(&connection, &event).await? {
                            Arrival::Emitted(synthetic) => pending.push_back(synthetic),
                            Arrival::Rejected { .. }
                            | Arrival::Recorded { .. }
                            | Arrival::Late { .. } => {}
                        }
                    }
                }
            }
        }

        Ok(persisted)
    }

    /// The `Emit(channel, type, payload)` capability for trigger sources.
    pub async fn emit_external(
        &self,
        canvas_id: Uuid,
        source_id: Uuid,
        channel: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Result<Vec<Uuid>, RouterError> {
        self.emit(Event::chain_root(
            canvas_id,
            EventOrigin::EventSource,
            source_id,
            channel,
            event_type,
            payload,
        ))
        .await
    }

    /// Run the group timeout sweep and route any partial emissions.
    /// Returns the number of emissions routed.
    pub async fn sweep_groups(&self, now: DateTime<Utc>) -> Result<usize, RouterError> {
        let emissions = self.engine.sweep(now).await?;
        let count = emissions.len();
        for emission in emissions {
            self.emit(emission).await?;
        }
        Ok(count)
    }

    /// Evaluate a connection's filters against an event.
    ///
    /// No filters matches everything. A filter that fails to evaluate
    /// counts as a non-match (fail closed).
    fn matches(&self, connection: &Connection, event: &Event) -> bool {
        if connection.filters.is_empty() {
            return true;
        }
        let mut any = false;
        let mut all = true;
        for filter in &connection.filters {
            let matched = match self.evaluator.evaluate_filter(&filter.expression, event) {
                Ok(matched) => matched,
                Err(e) => {
                    tracing::warn!(
                        connection_id = %connection.id,
                        expression = filter.expression.as_str(),
                        error = %e,
                        "filter evaluation failed; treating as non-match"
                    );
                    false
                }
            };
            any |= matched;
            all &= matched;
        }
        match connection.filter_operator {
            FilterOperator::And => all,
            FilterOperator::Or => any,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
