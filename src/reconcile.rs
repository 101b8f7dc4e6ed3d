//! Reconciliation of buffered queries against a workflow task outcome.
//!
//! Invoked by the task-processing pipeline exactly once per task outcome.
//! Stateless: all side effects are state transitions on the execution's
//! [`QueryRegistry`]. Only ids that are `Buffered` when the pass starts are
//! touched, so re-invoking after they have resolved is a no-op for them.

use std::collections::HashMap;

use tracing::warn;

use crate::limits::DEFAULT_MAX_ANSWER_BYTES;
use crate::registry::QueryRegistry;
use crate::{ExecutionInfo, QueryFailure, QueryId, WorkerQueryResult};

/// Answer-size bound resolved from namespace configuration.
///
/// Supplied fresh on every reconciliation call and never cached across calls,
/// so a namespace configuration change takes effect on the next task outcome.
#[derive(Debug, Clone)]
pub struct QueryLimits {
    /// Maximum serialized size in bytes for one query answer.
    pub max_answer_bytes: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_answer_bytes: DEFAULT_MAX_ANSWER_BYTES,
        }
    }
}

/// Narrow view of the execution's mutable state needed for reconciliation:
/// its query registry plus identity fields for diagnostics. Keeping the
/// dependency this small lets the reconciler run against a minimal stand-in
/// in tests.
pub trait QueryContext {
    fn query_registry(&self) -> &QueryRegistry;
    fn execution_info(&self) -> &ExecutionInfo;
}

/// Apply one workflow task outcome to every currently buffered query.
///
/// - Heartbeat tasks mutate nothing: the task is still open, so any attached
///   answers are provisional and the history point they would correspond to
///   has not been reached yet.
/// - An answered query completes, unless the answer exceeds
///   `limits.max_answer_bytes`, in which case it fails with
///   [`QueryFailure::AnswerSizeExceeded`].
/// - A query the worker declared failed fails with the worker's message.
/// - An unaddressed query stays `Buffered` when a following task will be
///   scheduled, and otherwise becomes `Unblocked` for the direct-query path.
///
/// Resolution is per-id: one query's failure never affects its siblings, and
/// nothing propagates to the invoking task-processing path.
pub fn reconcile_buffered_queries(
    ctx: &impl QueryContext,
    results: &HashMap<QueryId, WorkerQueryResult>,
    will_schedule_new_task: bool,
    limits: &QueryLimits,
    is_heartbeat: bool,
) {
    if is_heartbeat {
        return;
    }

    let registry = ctx.query_registry();
    for id in registry.buffered_ids() {
        let transition = match results.get(&id) {
            Some(WorkerQueryResult::Answered(answer)) => {
                let size = answer.size_bytes();
                if size > limits.max_answer_bytes {
                    registry.set_failed(
                        id,
                        QueryFailure::AnswerSizeExceeded {
                            size,
                            limit: limits.max_answer_bytes,
                        },
                    )
                } else {
                    registry.set_completed(id, answer.clone())
                }
            }
            Some(WorkerQueryResult::Failed { message }) => registry.set_failed(
                id,
                QueryFailure::WorkerFailed {
                    message: message.clone(),
                },
            ),
            None => {
                if will_schedule_new_task {
                    // A following task gets the chance to answer it.
                    continue;
                }
                registry.set_unblocked(id)
            }
        };
        if let Err(err) = transition {
            // Can only happen if the calling pipeline resolved the query out
            // from under this pass; an invariant violation, not a runtime
            // condition. Skip the id and keep resolving the rest.
            let info = ctx.execution_info();
            warn!(
                namespace = %info.namespace,
                workflow_id = %info.workflow_id,
                run_id = %info.run_id,
                query_id = %id,
                error = %err,
                "skipping query transition",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Query, QueryAnswer, QueryState};

    struct TestContext {
        registry: QueryRegistry,
        info: ExecutionInfo,
    }

    impl QueryContext for TestContext {
        fn query_registry(&self) -> &QueryRegistry {
            &self.registry
        }

        fn execution_info(&self) -> &ExecutionInfo {
            &self.info
        }
    }

    const SIZE_LIMIT: usize = 1024;

    fn limits() -> QueryLimits {
        QueryLimits {
            max_answer_bytes: SIZE_LIMIT,
        }
    }

    fn context_with_buffered(n: usize) -> (TestContext, Vec<QueryId>) {
        let registry = QueryRegistry::new();
        let ids = (0..n)
            .map(|i| registry.buffer_query(Query::new("status", format!("{{\"slot\":{i}}}"))))
            .collect();
        let ctx = TestContext {
            registry,
            info: ExecutionInfo {
                namespace: "default".to_string(),
                workflow_id: "wf-1".to_string(),
                run_id: "run-1".to_string(),
            },
        };
        (ctx, ids)
    }

    fn answered(ids: &[QueryId], size: usize) -> HashMap<QueryId, WorkerQueryResult> {
        ids.iter()
            .map(|id| (*id, WorkerQueryResult::Answered(QueryAnswer("a".repeat(size)))))
            .collect()
    }

    fn assert_counts(
        registry: &QueryRegistry,
        buffered: usize,
        completed: usize,
        unblocked: usize,
        failed: usize,
    ) {
        assert_eq!(registry.buffered_ids().len(), buffered, "buffered count");
        assert_eq!(registry.completed_ids().len(), completed, "completed count");
        assert_eq!(registry.unblocked_ids().len(), unblocked, "unblocked count");
        assert_eq!(registry.failed_ids().len(), failed, "failed count");
    }

    #[test]
    fn heartbeat_task_leaves_everything_buffered() {
        let (ctx, ids) = context_with_buffered(10);
        assert_counts(&ctx.registry, 10, 0, 0, 0);

        let results = answered(&ids[0..5], 10);
        reconcile_buffered_queries(&ctx, &results, true, &limits(), true);

        assert_counts(&ctx.registry, 10, 0, 0, 0);
    }

    #[test]
    fn heartbeat_ignores_oversized_answers_and_scheduling_flag() {
        let (ctx, ids) = context_with_buffered(10);

        let results = answered(&ids, SIZE_LIMIT + 1);
        reconcile_buffered_queries(&ctx, &results, false, &limits(), true);

        assert_counts(&ctx.registry, 10, 0, 0, 0);
    }

    #[test]
    fn answered_queries_complete_and_rest_stay_buffered_with_new_task() {
        let (ctx, ids) = context_with_buffered(10);

        let results = answered(&ids[0..5], 10);
        reconcile_buffered_queries(&ctx, &results, true, &limits(), false);

        assert_counts(&ctx.registry, 5, 5, 0, 0);
        for id in &ids[0..5] {
            assert_eq!(ctx.registry.state(*id).unwrap(), QueryState::Completed);
        }
        for id in &ids[5..10] {
            assert_eq!(ctx.registry.state(*id).unwrap(), QueryState::Buffered);
        }
    }

    #[test]
    fn unanswered_queries_unblock_without_new_task() {
        let (ctx, ids) = context_with_buffered(10);

        let results = answered(&ids[0..5], 10);
        reconcile_buffered_queries(&ctx, &results, false, &limits(), false);

        assert_counts(&ctx.registry, 0, 5, 5, 0);
        for id in &ids[5..10] {
            assert_eq!(ctx.registry.state(*id).unwrap(), QueryState::Unblocked);
        }
    }

    #[test]
    fn oversized_answers_fail_their_queries() {
        let (ctx, ids) = context_with_buffered(10);

        let mut results = answered(&ids[0..5], 10);
        results.extend(answered(&ids[5..10], SIZE_LIMIT + 1));
        reconcile_buffered_queries(&ctx, &results, false, &limits(), false);

        assert_counts(&ctx.registry, 0, 5, 0, 5);
        for id in &ids[5..10] {
            assert!(matches!(
                ctx.registry.failure(*id).unwrap(),
                Some(QueryFailure::AnswerSizeExceeded {
                    size,
                    limit: SIZE_LIMIT,
                }) if size == SIZE_LIMIT + 1
            ));
        }
    }

    #[test]
    fn answer_at_exact_bound_completes_and_is_stored_unchanged() {
        let (ctx, ids) = context_with_buffered(1);

        let payload = "b".repeat(SIZE_LIMIT);
        let results = HashMap::from([(
            ids[0],
            WorkerQueryResult::Answered(QueryAnswer(payload.clone())),
        )]);
        reconcile_buffered_queries(&ctx, &results, false, &limits(), false);

        assert_counts(&ctx.registry, 0, 1, 0, 0);
        assert_eq!(
            ctx.registry.answer(ids[0]).unwrap(),
            Some(QueryAnswer(payload))
        );
    }

    #[test]
    fn worker_declared_failure_fails_the_query() {
        let (ctx, ids) = context_with_buffered(2);

        let results = HashMap::from([(
            ids[0],
            WorkerQueryResult::Failed {
                message: "unknown query type".to_string(),
            },
        )]);
        reconcile_buffered_queries(&ctx, &results, true, &limits(), false);

        assert_counts(&ctx.registry, 1, 0, 0, 1);
        assert_eq!(
            ctx.registry.failure(ids[0]).unwrap(),
            Some(QueryFailure::WorkerFailed {
                message: "unknown query type".to_string()
            })
        );
    }

    #[test]
    fn second_pass_never_touches_resolved_queries() {
        let (ctx, ids) = context_with_buffered(4);

        let results = answered(&ids[0..2], 10);
        reconcile_buffered_queries(&ctx, &results, true, &limits(), false);
        assert_counts(&ctx.registry, 2, 2, 0, 0);

        // Same results again, now without a following task: the completed
        // queries keep their state, the remaining buffered ones unblock.
        reconcile_buffered_queries(&ctx, &results, false, &limits(), false);
        assert_counts(&ctx.registry, 0, 2, 2, 0);
        for id in &ids[0..2] {
            assert_eq!(ctx.registry.state(*id).unwrap(), QueryState::Completed);
        }
    }

    #[test]
    fn empty_results_with_new_task_is_a_full_deferral() {
        let (ctx, _ids) = context_with_buffered(3);

        reconcile_buffered_queries(&ctx, &HashMap::new(), true, &limits(), false);

        assert_counts(&ctx.registry, 3, 0, 0, 0);
    }
}
