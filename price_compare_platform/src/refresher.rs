//! Periodic coupon refresh loop.
//!
//! Runs on its own tokio task, never on the search worker pool. Each cycle
//! calls every source in order and persists what they return. A failing
//! cycle is logged and retried after a shorter backoff delay; the loop only
//! ends when its handle is shut down.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::settings::RefresherConfig;
use crate::store::Store;

/// A coupon as reported by a source, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouponOffer {
    pub store: String,
    pub code: String,
    pub description: String,
}

#[async_trait]
pub trait RefreshSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_coupons(&self) -> Result<Vec<CouponOffer>>;
}

/// Coupons read from a JSON file.
pub struct CatalogCouponSource {
    name: String,
    path: PathBuf,
}

impl CatalogCouponSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl RefreshSource for CatalogCouponSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_coupons(&self) -> Result<Vec<CouponOffer>> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read coupon catalog: {:?}", self.path))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse coupon catalog: {:?}", self.path))
    }
}

/// Fixed coupon list, or a fixed failure.
pub struct StaticCouponSource {
    name: String,
    result: std::result::Result<Vec<CouponOffer>, String>,
}

impl StaticCouponSource {
    pub fn new(name: impl Into<String>, coupons: Vec<CouponOffer>) -> Self {
        Self {
            name: name.into(),
            result: Ok(coupons),
        }
    }

    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result: Err(message.into()),
        }
    }
}

#[async_trait]
impl RefreshSource for StaticCouponSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_coupons(&self) -> Result<Vec<CouponOffer>> {
        self.result.clone().map_err(|message| anyhow!(message))
    }
}

/// Sleep policy between cycles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshSchedule {
    pub interval: Duration,
    pub retry_interval: Duration,
    pub max_retry_interval: Duration,
}

impl RefreshSchedule {
    pub fn from_config(config: &RefresherConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_hours * 3600),
            retry_interval: Duration::from_secs(config.retry_interval_minutes * 60),
            max_retry_interval: Duration::from_secs(config.max_retry_interval_minutes * 60),
        }
    }

    /// Delay before the next cycle. Zero failures means the last cycle
    /// succeeded; otherwise the retry delay doubles per consecutive failure,
    /// capped at the max retry interval and the normal interval.
    pub fn next_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.interval;
        }
        let factor = 1u32 << (consecutive_failures - 1).min(16);
        self.retry_interval
            .saturating_mul(factor)
            .min(self.max_retry_interval.max(self.retry_interval))
            .min(self.interval)
    }
}

/// State published after every cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub cycles: u64,
    pub consecutive_failures: u32,
    pub persisted_last_cycle: usize,
    pub last_error: Option<String>,
    pub next_delay: Duration,
}

pub struct PeriodicRefresher {
    sources: Vec<Arc<dyn RefreshSource>>,
    store: Arc<dyn Store>,
    schedule: RefreshSchedule,
}

impl PeriodicRefresher {
    pub fn new(
        sources: Vec<Arc<dyn RefreshSource>>,
        store: Arc<dyn Store>,
        schedule: RefreshSchedule,
    ) -> Self {
        Self {
            sources,
            store,
            schedule,
        }
    }

    pub fn from_config(config: &RefresherConfig, store: Arc<dyn Store>) -> Self {
        let sources = config
            .sources
            .iter()
            .map(|s| {
                Arc::new(CatalogCouponSource::new(s.name.clone(), s.catalog_path.clone()))
                    as Arc<dyn RefreshSource>
            })
            .collect();
        Self::new(sources, store, RefreshSchedule::from_config(config))
    }

    /// Run every source once, in order, persisting each coupon. Stops at
    /// the first failing source; a panicking source counts as a failure.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<usize> {
        let mut persisted = 0;
        for source in &self.sources {
            let coupons = AssertUnwindSafe(source.fetch_coupons())
                .catch_unwind()
                .await
                .map_err(|_| anyhow!("source '{}' panicked", source.name()))?
                .with_context(|| format!("source '{}' failed", source.name()))?;

            for coupon in &coupons {
                self.store
                    .upsert_coupon(&coupon.store, &coupon.code, &coupon.description)
                    .await?;
            }
            info!("Refreshed {} coupons from '{}'", coupons.len(), source.name());
            persisted += coupons.len();
        }
        Ok(persisted)
    }

    /// Start the loop on its own task. The first cycle runs immediately.
    pub fn spawn(self) -> RefresherHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (report_tx, report_rx) = watch::channel(RefreshReport::default());

        let join = tokio::spawn(async move {
            let mut report = RefreshReport::default();
            loop {
                report.cycles += 1;
                match self.run_cycle().await {
                    Ok(persisted) => {
                        report.consecutive_failures = 0;
                        report.persisted_last_cycle = persisted;
                        report.last_error = None;
                    }
                    Err(e) => {
                        report.consecutive_failures += 1;
                        report.persisted_last_cycle = 0;
                        report.last_error = Some(format!("{e:#}"));
                    }
                }
                report.next_delay = self.schedule.next_delay(report.consecutive_failures);

                match &report.last_error {
                    Some(e) => error!(
                        "Refresh cycle {} failed ({} in a row): {}; retrying in {:?}",
                        report.cycles, report.consecutive_failures, e, report.next_delay
                    ),
                    None => info!(
                        "Refresh cycle {} persisted {} coupons; next run in {:?}",
                        report.cycles, report.persisted_last_cycle, report.next_delay
                    ),
                }
                let _ = report_tx.send(report.clone());

                tokio::select! {
                    _ = tokio::time::sleep(report.next_delay) => {}
                    _ = shutdown_rx.changed() => {
                        info!("Refresher shutting down");
                        break;
                    }
                }
            }
        });

        RefresherHandle {
            shutdown: shutdown_tx,
            reports: report_rx,
            join,
        }
    }
}

pub struct RefresherHandle {
    shutdown: watch::Sender<bool>,
    reports: watch::Receiver<RefreshReport>,
    join: JoinHandle<()>,
}

impl RefresherHandle {
    /// Receiver updated after every cycle.
    pub fn reports(&self) -> watch::Receiver<RefreshReport> {
        self.reports.clone()
    }

    /// Signal the loop to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!("Refresher task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn offer(store: &str, code: &str) -> CouponOffer {
        CouponOffer {
            store: store.into(),
            code: code.into(),
            description: format!("{code} discount"),
        }
    }

    fn schedule() -> RefreshSchedule {
        RefreshSchedule {
            interval: Duration::from_secs(12 * 3600),
            retry_interval: Duration::from_secs(3600),
            max_retry_interval: Duration::from_secs(6 * 3600),
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct FlakySource {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RefreshSource for FlakySource {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch_coupons(&self) -> Result<Vec<CouponOffer>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(anyhow!("coupon page unavailable"))
            } else {
                Ok(vec![offer("Nike", "JUSTDOIT")])
            }
        }
    }

    struct PanickingSource;

    #[async_trait]
    impl RefreshSource for PanickingSource {
        fn name(&self) -> &str {
            "panics"
        }

        async fn fetch_coupons(&self) -> Result<Vec<CouponOffer>> {
            panic!("layout changed")
        }
    }

    #[test]
    fn test_next_delay_backoff() {
        let s = schedule();
        assert_eq!(s.next_delay(0), Duration::from_secs(12 * 3600));
        assert_eq!(s.next_delay(1), Duration::from_secs(3600));
        assert_eq!(s.next_delay(2), Duration::from_secs(2 * 3600));
        assert_eq!(s.next_delay(3), Duration::from_secs(4 * 3600));
        assert_eq!(s.next_delay(4), Duration::from_secs(6 * 3600));
        assert_eq!(s.next_delay(40), Duration::from_secs(6 * 3600));
    }

    #[tokio::test]
    async fn test_cycle_persists_every_source() {
        let store = Arc::new(InMemoryStore::new());
        let refresher = PeriodicRefresher::new(
            vec![
                Arc::new(StaticCouponSource::new("myntra", vec![offer("Myntra", "MYNTRA20"), offer("Myntra", "STYLEUP")])),
                Arc::new(StaticCouponSource::new("nike", vec![offer("Nike", "JUSTDOIT")])),
            ],
            store.clone(),
            schedule(),
        );

        assert_eq!(refresher.run_cycle().await.unwrap(), 3);
        let coupons = store.coupons_by_store().await.unwrap();
        assert_eq!(coupons["Myntra"].len(), 2);
        assert_eq!(coupons["Nike"].len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_source_fails_cycle() {
        let refresher = PeriodicRefresher::new(
            vec![Arc::new(PanickingSource)],
            Arc::new(InMemoryStore::new()),
            schedule(),
        );
        let err = refresher.run_cycle().await.unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_retries_after_short_interval() {
        let store = Arc::new(InMemoryStore::new());
        let refresher = PeriodicRefresher::new(
            vec![Arc::new(FlakySource {
                failures: 1,
                calls: AtomicU32::new(0),
            })],
            store.clone(),
            schedule(),
        );

        let handle = refresher.spawn();
        let mut reports = handle.reports();

        reports.changed().await.unwrap();
        let first = reports.borrow_and_update().clone();
        let failed_at = tokio::time::Instant::now();
        assert_eq!(first.cycles, 1);
        assert_eq!(first.consecutive_failures, 1);
        assert_eq!(first.next_delay, Duration::from_secs(3600));

        reports.changed().await.unwrap();
        let second = reports.borrow_and_update().clone();
        assert_eq!(second.cycles, 2);
        assert_eq!(second.consecutive_failures, 0);
        assert_eq!(second.next_delay, Duration::from_secs(12 * 3600));
        let waited = failed_at.elapsed();
        assert!(waited >= Duration::from_secs(3600) && waited < Duration::from_secs(3601));

        assert_eq!(store.coupons_by_store().await.unwrap()["Nike"].len(), 1);
        handle.shutdown().await;
    }
}
