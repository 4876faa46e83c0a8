//! Job runner: one fetcher against one query inside the worker pool.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::context::SearchContext;
use crate::error::OrchestratorError;
use crate::fetcher::Fetcher;
use crate::finalizer;
use crate::item::Item;
use crate::registry::TaskId;

/// Invoke a fetcher under a deadline. Panics and timeouts become fetch errors.
pub async fn fetch_with_deadline(
    fetcher: &dyn Fetcher,
    query: &str,
    deadline: Duration,
) -> Result<Vec<Item>, OrchestratorError> {
    let guarded = AssertUnwindSafe(fetcher.fetch(query)).catch_unwind();

    match tokio::time::timeout(deadline, guarded).await {
        Ok(Ok(Ok(items))) => Ok(items),
        Ok(Ok(Err(e))) => Err(OrchestratorError::fetch(fetcher.name(), format!("{e:#}"))),
        Ok(Err(_)) => Err(OrchestratorError::fetch(fetcher.name(), "fetcher panicked")),
        Err(_) => Err(OrchestratorError::FetchTimeout {
            source_name: fetcher.name().to_string(),
            after: deadline,
        }),
    }
}

/// Run one fetcher for `task_id`, merge its items, then signal completion.
///
/// The completion signal is sent exactly once whatever the fetch outcome;
/// the runner that takes the remaining count to zero schedules the
/// finalizer on the pool.
#[instrument(skip(ctx, fetcher), fields(source = %fetcher.name()))]
pub async fn run_job(
    ctx: Arc<SearchContext>,
    task_id: TaskId,
    fetcher: Arc<dyn Fetcher>,
    query: String,
) {
    match fetch_with_deadline(fetcher.as_ref(), &query, ctx.fetch_timeout).await {
        Ok(items) => {
            let count = items.len();
            if let Err(e) = ctx.registry.with_lock(task_id, |record| record.append(&items)) {
                warn!("Dropping {} products from '{}': {}", count, fetcher.name(), e);
            } else {
                info!("Source '{}' returned {} products", fetcher.name(), count);
            }
        }
        Err(e) => warn!("Source failed for task {}: {}", task_id, e),
    }

    match ctx.registry.with_lock(task_id, |record| record.complete_fetcher()) {
        Ok(true) => {
            info!("All sources reported for task {}; scheduling finalizer", task_id);
            ctx.pool
                .spawn("finalizer", finalizer::finalize(ctx.clone(), task_id));
        }
        Ok(false) => {}
        Err(e) => error!("Completion signal lost: {}", e),
    }
}
