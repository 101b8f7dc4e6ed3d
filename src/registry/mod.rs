//! Per-execution registry of in-flight queries.
//!
//! One registry instance is exclusively owned by one workflow execution's
//! processing context and is never shared across executions. Two disjoint
//! paths drive it concurrently: inbound query handling buffers queries and
//! waits on their termination signals, while task reconciliation resolves
//! them. A single mutex around the record map and the four state-indexed ID
//! sets is the whole critical section; waiting happens on the signal, outside
//! the lock.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::debug;

use crate::{Query, QueryAnswer, QueryFailure, QueryId, QueryOutcome, QueryRegistryError};

mod termination;

pub use termination::TerminationWaiter;
use termination::{termination_channel, TerminationSignal};

/// Lifecycle state of a query within the registry.
///
/// `Buffered` is the sole initial state; the other three are terminal. Once a
/// query reaches a terminal state it is never re-buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryState {
    Buffered,
    Completed,
    Unblocked,
    Failed,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, QueryState::Buffered)
    }
}

#[derive(Debug)]
struct QueryRecord {
    query: Query,
    state: QueryState,
    answer: Option<QueryAnswer>,
    failure: Option<QueryFailure>,
    /// Present while `Buffered`; consumed by the one transition that fires it.
    signal: Option<TerminationSignal>,
    waiter: TerminationWaiter,
}

#[derive(Debug, Default)]
struct RegistryInner {
    records: HashMap<QueryId, QueryRecord>,
    // Invariant: buffered/completed/unblocked/failed partition records.keys().
    buffered: HashSet<QueryId>,
    completed: HashSet<QueryId>,
    unblocked: HashSet<QueryId>,
    failed: HashSet<QueryId>,
}

/// Registry of every in-flight query against one workflow execution.
///
/// Records are created only by [`QueryRegistry::buffer_query`] and are never
/// destroyed by the registry itself; the owning execution context discards
/// the whole registry (after [`QueryRegistry::teardown`]) when the execution
/// completes or is evicted.
#[derive(Debug, Default)]
pub struct QueryRegistry {
    inner: Mutex<RegistryInner>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new query in `Buffered`, allocate its termination signal
    /// and return its id. Never fails.
    pub fn buffer_query(&self, query: Query) -> QueryId {
        let id = QueryId::generate();
        let (signal, waiter) = termination_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.records.insert(
            id,
            QueryRecord {
                query,
                state: QueryState::Buffered,
                answer: None,
                failure: None,
                signal: Some(signal),
                waiter,
            },
        );
        inner.buffered.insert(id);
        debug!(query_id = %id, "buffered query");
        id
    }

    /// Snapshot of the ids currently in `Buffered`. Order is unspecified.
    pub fn buffered_ids(&self) -> Vec<QueryId> {
        self.inner.lock().unwrap().buffered.iter().copied().collect()
    }

    pub fn completed_ids(&self) -> Vec<QueryId> {
        self.inner.lock().unwrap().completed.iter().copied().collect()
    }

    pub fn unblocked_ids(&self) -> Vec<QueryId> {
        self.inner.lock().unwrap().unblocked.iter().copied().collect()
    }

    pub fn failed_ids(&self) -> Vec<QueryId> {
        self.inner.lock().unwrap().failed.iter().copied().collect()
    }

    /// Whether any query is still waiting on a task outcome. Used by
    /// task-dispatch code deciding whether a speculative task is worthwhile.
    pub fn has_buffered_query(&self) -> bool {
        !self.inner.lock().unwrap().buffered.is_empty()
    }

    /// The original request, so the dispatch path can hand it to a worker.
    pub fn query_input(&self, id: QueryId) -> Result<Query, QueryRegistryError> {
        self.inner
            .lock()
            .unwrap()
            .records
            .get(&id)
            .map(|r| r.query.clone())
            .ok_or(QueryRegistryError::UnknownQuery(id))
    }

    /// Current state of a query. Diagnostics accessor.
    pub fn state(&self, id: QueryId) -> Result<QueryState, QueryRegistryError> {
        self.inner
            .lock()
            .unwrap()
            .records
            .get(&id)
            .map(|r| r.state)
            .ok_or(QueryRegistryError::UnknownQuery(id))
    }

    /// Stored answer; `None` unless the query is `Completed`.
    pub fn answer(&self, id: QueryId) -> Result<Option<QueryAnswer>, QueryRegistryError> {
        self.inner
            .lock()
            .unwrap()
            .records
            .get(&id)
            .map(|r| r.answer.clone())
            .ok_or(QueryRegistryError::UnknownQuery(id))
    }

    /// Stored failure; `None` unless the query is `Failed`.
    pub fn failure(&self, id: QueryId) -> Result<Option<QueryFailure>, QueryRegistryError> {
        self.inner
            .lock()
            .unwrap()
            .records
            .get(&id)
            .map(|r| r.failure.clone())
            .ok_or(QueryRegistryError::UnknownQuery(id))
    }

    /// Handle the caller blocks on until the query leaves `Buffered`.
    pub fn termination_waiter(&self, id: QueryId) -> Result<TerminationWaiter, QueryRegistryError> {
        self.inner
            .lock()
            .unwrap()
            .records
            .get(&id)
            .map(|r| r.waiter.clone())
            .ok_or(QueryRegistryError::UnknownQuery(id))
    }

    /// `Buffered` → `Completed`, storing the answer and releasing the waiter.
    pub fn set_completed(&self, id: QueryId, answer: QueryAnswer) -> Result<(), QueryRegistryError> {
        self.transition(id, QueryOutcome::Completed(answer))
    }

    /// `Buffered` → `Unblocked`, recording the hand-off to the direct-query
    /// path so it is not attempted through the task pipeline again.
    pub fn set_unblocked(&self, id: QueryId) -> Result<(), QueryRegistryError> {
        self.transition(id, QueryOutcome::Unblocked)
    }

    /// `Buffered` → `Failed`, storing the failure and releasing the waiter.
    pub fn set_failed(&self, id: QueryId, failure: QueryFailure) -> Result<(), QueryRegistryError> {
        self.transition(id, QueryOutcome::Failed(failure))
    }

    fn transition(&self, id: QueryId, outcome: QueryOutcome) -> Result<(), QueryRegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or(QueryRegistryError::UnknownQuery(id))?;
        if record.state != QueryState::Buffered {
            return Err(QueryRegistryError::NotBuffered {
                id,
                state: record.state,
            });
        }
        let to = match &outcome {
            QueryOutcome::Completed(answer) => {
                record.answer = Some(answer.clone());
                QueryState::Completed
            }
            QueryOutcome::Unblocked => QueryState::Unblocked,
            QueryOutcome::Failed(failure) => {
                record.failure = Some(failure.clone());
                QueryState::Failed
            }
        };
        record.state = to;
        if let Some(signal) = record.signal.take() {
            signal.resolve(outcome);
        }
        inner.buffered.remove(&id);
        match to {
            QueryState::Completed => inner.completed.insert(id),
            QueryState::Unblocked => inner.unblocked.insert(id),
            QueryState::Failed => inner.failed.insert(id),
            QueryState::Buffered => unreachable!("transition target is terminal"),
        };
        debug!(query_id = %id, state = ?to, "query resolved");
        Ok(())
    }

    /// Resolve every still-`Buffered` query to `Failed(ExecutionTornDown)` so
    /// no waiter blocks past the execution's lifetime. Called by the owning
    /// context before discarding the registry.
    pub fn teardown(&self) {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<QueryId> = inner.buffered.drain().collect();
        for id in &ids {
            if let Some(record) = inner.records.get_mut(id) {
                record.state = QueryState::Failed;
                record.failure = Some(QueryFailure::ExecutionTornDown);
                if let Some(signal) = record.signal.take() {
                    signal.resolve(QueryOutcome::Failed(QueryFailure::ExecutionTornDown));
                }
            }
            inner.failed.insert(*id);
        }
        if !ids.is_empty() {
            debug!(count = ids.len(), "teardown resolved still-buffered queries");
        }
    }
}
