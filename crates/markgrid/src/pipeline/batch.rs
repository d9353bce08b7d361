//! Bounded worker pool over independent items, merged in submission order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::error::GradeError;

/// Batch-level cancellation flag. Clones share the same flag.
///
/// Cancelling lets in-flight items finish and prevents new ones from starting.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run `work` over `items` on at most `limit` threads (`None`: one per core).
///
/// The output has one slot per item, in submission order; items skipped
/// because of cancellation are `None`.
pub(crate) fn supervise<T, R, F>(
    items: &[T],
    limit: Option<usize>,
    cancel: Option<&CancelToken>,
    work: F,
) -> Result<Vec<Option<R>>, GradeError>
where
    T: Sync,
    R: Send,
    F: Fn(usize, &T) -> R + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(limit.unwrap_or(0))
        .thread_name(|i| format!("markgrid-worker-{i}"))
        .build()
        .map_err(|e| GradeError::WorkerPool(e.to_string()))?;

    Ok(pool.install(|| {
        items
            .par_iter()
            .enumerate()
            .map(|(i, item)| {
                if cancel.is_some_and(CancelToken::is_cancelled) {
                    tracing::debug!(item = i, "skipped after cancellation");
                    return None;
                }
                Some(work(i, item))
            })
            .collect()
    }))
}
