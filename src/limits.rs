//! Hard limits and constants.
//!
//! Collect all hard limits in one place so they're easy to find, document,
//! and reference from both the reconciler and the surrounding config layer.

/// Default maximum size in bytes for a worker-supplied query answer.
///
/// The effective bound is resolved from namespace configuration and supplied
/// fresh on every reconciliation call; this default backs
/// `QueryLimits::default()` when no namespace override exists.
///
/// 2 MiB — room for large state snapshots while keeping answers within
/// transport limits. Answers over the bound fail the query outright.
pub const DEFAULT_MAX_ANSWER_BYTES: usize = 2 * 1024 * 1024;
