//! Single-resolution termination signal for buffered queries.
//!
//! Exactly one resolve event carries the terminal outcome. Any number of
//! waiters may block on it, and any number of observers may read the resolved
//! value after the fact. Abandoning a wait (caller-side timeout) has no
//! effect on the query record itself.

use tokio::sync::watch;

use crate::{QueryFailure, QueryOutcome};

pub(crate) fn termination_channel() -> (TerminationSignal, TerminationWaiter) {
    let (tx, rx) = watch::channel(None);
    (TerminationSignal { tx }, TerminationWaiter { rx })
}

/// Resolving half of the signal. Held by the registry while the query is
/// `Buffered` and consumed by the one transition that fires it.
#[derive(Debug)]
pub(crate) struct TerminationSignal {
    tx: watch::Sender<Option<QueryOutcome>>,
}

impl TerminationSignal {
    /// Fire the signal. Takes `self` by value so a second resolution is
    /// unrepresentable.
    pub(crate) fn resolve(self, outcome: QueryOutcome) {
        // Every waiter may already have given up; that is not an error.
        let _ = self.tx.send(Some(outcome));
    }
}

/// Waiting half of the signal. Cloneable so blocked callers and
/// status-inspection code can share one record's signal.
#[derive(Debug, Clone)]
pub struct TerminationWaiter {
    rx: watch::Receiver<Option<QueryOutcome>>,
}

impl TerminationWaiter {
    /// Block until the query leaves `Buffered` and return its terminal
    /// outcome.
    ///
    /// Callers own their deadline: wrap the wait in `tokio::time::timeout`
    /// and drop the future to abandon it. If the owning registry is dropped
    /// before the query resolves, the outcome is
    /// `Failed(ExecutionTornDown)`.
    pub async fn wait(&mut self) -> QueryOutcome {
        loop {
            let current = self.rx.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                // Registry dropped without resolving the record.
                return QueryOutcome::Failed(QueryFailure::ExecutionTornDown);
            }
        }
    }

    /// Non-blocking view of the outcome, if the query has already resolved.
    pub fn try_outcome(&self) -> Option<QueryOutcome> {
        self.rx.borrow().clone()
    }
}
