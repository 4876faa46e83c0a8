//! One-time post-processing once every fetcher for a task has reported.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::context::SearchContext;
use crate::error::OrchestratorError;
use crate::item::{Filters, Item};
use crate::registry::TaskId;

/// Dedup by URL (first occurrence wins), drop non-positive prices, derive
/// categories and compute filters. Pure over its input order.
pub fn process_items(accumulated: &[Item]) -> Result<(Vec<Item>, Filters), OrchestratorError> {
    if accumulated.is_empty() {
        return Err(OrchestratorError::NoResults(
            "no source returned any products".to_string(),
        ));
    }

    let mut seen = HashSet::with_capacity(accumulated.len());
    let items: Vec<Item> = accumulated
        .iter()
        .filter(|item| seen.insert(item.product_url.as_str()))
        .filter(|item| item.price > 0.0)
        .map(Item::categorized)
        .collect();

    let filters = Filters::from_items(&items).ok_or_else(|| {
        OrchestratorError::NoResults("every product was filtered out".to_string())
    })?;

    Ok((items, filters))
}

/// Finalize a task: write the global cache and move the record to a
/// terminal state. Runs inside the worker pool.
#[instrument(skip(ctx))]
pub async fn finalize(ctx: Arc<SearchContext>, task_id: TaskId) {
    let snapshot = ctx
        .registry
        .with_lock(task_id, |record| (record.query.clone(), record.accumulated.clone()));

    let (query, accumulated) = match snapshot {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Finalizer found no record: {}", e);
            return;
        }
    };

    match process_items(&accumulated) {
        Ok((items, filters)) => {
            let items = Arc::new(items);
            info!(
                "Task {} finalized: {} of {} products kept for '{}'",
                task_id,
                items.len(),
                accumulated.len(),
                query
            );
            ctx.cache.put_by_query(&query, items.clone(), filters.clone());
            if let Err(e) = ctx
                .registry
                .with_lock(task_id, |record| record.succeed(items, filters))
            {
                warn!("Task vanished before success was recorded: {}", e);
            }
        }
        Err(e) => {
            warn!("Task {} for '{}' failed: {}", task_id, query, e);
            let message = e.to_string();
            if let Err(e) = ctx
                .registry
                .with_lock(task_id, |record| record.fail(message))
            {
                warn!("Task vanished before error was recorded: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskStatus;
    use proptest::prelude::*;
    use std::time::Duration;

    fn item(name: &str, price: f64, url: &str) -> Item {
        Item::new(name, price, format!("{url}.jpg"), url, "Store")
    }

    #[test]
    fn test_first_occurrence_wins() {
        let (items, _) = process_items(&[
            item("Nike Boot", 100.0, "u1"),
            item("Nike Boot Copy", 50.0, "u1"),
            item("Puma Sandal", 70.0, "u2"),
        ])
        .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].price, 100.0);
        assert_eq!(items[0].category, "Footwear");
    }

    #[test]
    fn test_duplicate_of_dropped_item_stays_dropped() {
        // The first occurrence of u1 is free, so u1 is removed entirely.
        let err = process_items(&[item("Nike Boot", 0.0, "u1"), item("Nike Boot", 80.0, "u1")])
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoResults(_)));
    }

    #[test]
    fn test_empty_input_is_no_results() {
        assert!(matches!(
            process_items(&[]),
            Err(OrchestratorError::NoResults(_))
        ));
    }

    #[tokio::test]
    async fn test_finalize_writes_cache_and_succeeds() {
        let ctx = SearchContext::new(2, Duration::from_secs(5));
        let id = ctx.registry.create("boots", 1);
        ctx.registry
            .with_lock(id, |r| {
                r.append(&[item("Nike Boot", 100.0, "u1")]);
                r.complete_fetcher();
            })
            .unwrap();

        finalize(ctx.clone(), id).await;

        let record = ctx.registry.get(id).unwrap();
        assert_eq!(record.status, TaskStatus::Success);
        assert_eq!(ctx.cache.get_by_query("boots").unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_failure_skips_cache() {
        let ctx = SearchContext::new(2, Duration::from_secs(5));
        let id = ctx.registry.create("boots", 1);
        ctx.registry
            .with_lock(id, |r| {
                r.append(&[item("Nike Boot", 0.0, "u1")]);
                r.complete_fetcher();
            })
            .unwrap();

        finalize(ctx.clone(), id).await;

        let record = ctx.registry.get(id).unwrap();
        assert_eq!(record.status, TaskStatus::Error);
        assert!(record.error.unwrap().contains("no products found"));
        assert!(ctx.cache.get_by_query("boots").is_none());
    }

    fn arb_items() -> impl Strategy<Value = Vec<Item>> {
        prop::collection::vec(
            ("[a-z]{1,8}( [a-z]{1,8})?", -50.0f64..500.0, 0u8..12),
            0..40,
        )
        .prop_map(|rows| {
            rows.into_iter()
                .map(|(name, price, url)| item(&name, price, &format!("https://shop/{url}")))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_non_positive_prices_never_survive(input in arb_items()) {
            if let Ok((items, filters)) = process_items(&input) {
                prop_assert!(items.iter().all(|i| i.price > 0.0));
                prop_assert!(filters.min_price >= 0);
            }
        }

        #[test]
        fn prop_dedup_is_idempotent(input in arb_items()) {
            if let Ok((once, _)) = process_items(&input) {
                let (twice, _) = process_items(&once).unwrap();
                prop_assert_eq!(&once, &twice);

                let urls: HashSet<_> = once.iter().map(|i| i.product_url.clone()).collect();
                prop_assert_eq!(urls.len(), once.len());
            }
        }
    }
}
