//! Bounded-width batch execution.

use futures::future::join_all;
use std::future::Future;
use tracing::warn;

use anchorsync_common::Result;

/// Run `op` over `items` in consecutive batches of at most `width`
/// concurrent futures.
///
/// Each batch completes before the next starts. After a batch in which
/// any operation failed, no further batches are started; the returned
/// results then cover only the items that ran, in input order.
pub async fn run_batched<T, O, F, Fut>(items: Vec<T>, width: usize, op: F) -> Vec<Result<O>>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<O>>,
{
    let width = width.max(1);
    let total = items.len();
    let mut results = Vec::with_capacity(total);
    let mut pending = items.into_iter().peekable();

    while pending.peek().is_some() {
        let batch: Vec<Fut> = pending.by_ref().take(width).map(&op).collect();
        let outcomes = join_all(batch).await;
        let failed = outcomes.iter().any(|r| r.is_err());
        results.extend(outcomes);

        if failed {
            let skipped = total - results.len();
            if skipped > 0 {
                warn!("Batch failed, skipping {} remaining item(s)", skipped);
            }
            break;
        }
    }

    results
}
