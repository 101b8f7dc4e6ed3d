//! Query resolution for workflow executions.
//!
//! A workflow execution can be queried for information about its current or
//! historical state. Answers must reflect state as of a well-defined point in
//! the execution's history, so inbound queries are buffered in a per-execution
//! [`QueryRegistry`] and resolved against workflow task outcomes: when a
//! worker finishes a task it may attach answers for buffered queries, and
//! [`reconcile_buffered_queries`] decides the fate of every buffered query
//! from the task outcome (commit the answer, defer to the next task, redirect
//! to the direct-query path, or fail).
//!
//! The registry is exclusively owned by one execution's processing context.
//! The query-registration path (inbound RPC handling) and the reconciliation
//! path (task processing) run concurrently against it; callers block on a
//! per-query [`TerminationWaiter`] until their query resolves.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod limits;
pub mod reconcile;
pub mod registry;

pub use reconcile::{reconcile_buffered_queries, QueryContext, QueryLimits};
pub use registry::{QueryRegistry, QueryState, TerminationWaiter};

/// Unique identifier for a buffered query. Generated at buffering time and
/// never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(Uuid);

impl QueryId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An inbound query against one workflow execution: a named query type plus
/// serialized arguments. Immutable once buffered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub query_type: String,
    pub args: String,
}

impl Query {
    pub fn new(query_type: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            query_type: query_type.into(),
            args: args.into(),
        }
    }

    /// Build a query whose arguments are the JSON encoding of `args`.
    pub fn new_typed<T: Serialize>(
        query_type: impl Into<String>,
        args: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            query_type: query_type.into(),
            args: serde_json::to_string(args)?,
        })
    }
}

/// Serialized answer payload for a completed query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAnswer(pub String);

impl QueryAnswer {
    /// Wrap the JSON encoding of `value` as an answer payload.
    pub fn new_typed<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Self(serde_json::to_string(value)?))
    }

    /// Decode the payload back into a typed value.
    pub fn to_typed<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.0)
    }

    /// Serialized size checked against the namespace answer-size bound.
    pub fn size_bytes(&self) -> usize {
        self.0.len()
    }
}

/// Per-query result reported by a worker in a workflow task completion.
///
/// Only queries the worker actually addressed appear in the result map; a
/// worker may answer a query or declare it failed (e.g. unknown query type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerQueryResult {
    Answered(QueryAnswer),
    Failed { message: String },
}

/// Identity of the owning workflow execution, used as diagnostics context on
/// registry and reconciliation logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionInfo {
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: String,
}

/// Terminal failure attached to a query record and delivered to its waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryFailure {
    /// The worker's answer exceeds the namespace answer-size bound. The
    /// answer is rejected outright rather than delivered; the waiter sees a
    /// definitive failure, not a retry signal.
    #[error("query answer size {size} bytes exceeds limit of {limit} bytes")]
    AnswerSizeExceeded { size: usize, limit: usize },
    /// The worker declared the query failed.
    #[error("worker failed query: {message}")]
    WorkerFailed { message: String },
    /// The owning execution was completed or evicted while the query was
    /// still buffered.
    #[error("workflow execution is no longer active")]
    ExecutionTornDown,
}

/// Programming-error conditions raised by registry transitions.
///
/// These indicate a defect in the calling pipeline (addressing an unknown or
/// already-resolved query), not a runtime condition to recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueryRegistryError {
    #[error("unknown query id {0}")]
    UnknownQuery(QueryId),
    #[error("query {id} is {state:?}, expected Buffered")]
    NotBuffered { id: QueryId, state: QueryState },
}

/// Terminal outcome of a query, carried by its termination signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Answered by a worker within the size bound.
    Completed(QueryAnswer),
    /// No task will answer it; handed off to the direct-query path.
    Unblocked,
    Failed(QueryFailure),
}
