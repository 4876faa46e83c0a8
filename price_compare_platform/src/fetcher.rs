//! Per-source fetch capability.
//!
//! A fetcher turns a query into a list of items for one store. Fetchers are
//! slow and fallible; the job runner isolates each one so a failure only
//! contributes zero items to its task.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::item::Item;
use crate::settings::SourceConfig;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Source name used in logs and errors.
    fn name(&self) -> &str;

    async fn fetch(&self, query: &str) -> Result<Vec<Item>>;
}

/// Fetcher backed by a JSON catalog file of items for one store.
pub struct CatalogFetcher {
    name: String,
    catalog_path: PathBuf,
    latency: Duration,
}

impl CatalogFetcher {
    pub fn new(name: impl Into<String>, catalog_path: impl Into<PathBuf>, latency: Duration) -> Self {
        Self {
            name: name.into(),
            catalog_path: catalog_path.into(),
            latency,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(
            config.name.clone(),
            config.catalog_path.clone(),
            Duration::from_millis(config.latency_ms),
        )
    }
}

/// True when every whitespace token of `query` appears in `name`, ignoring case.
fn matches_query(name: &str, query: &str) -> bool {
    let name = name.to_lowercase();
    query
        .split_whitespace()
        .all(|token| name.contains(&token.to_lowercase()))
}

#[async_trait]
impl Fetcher for CatalogFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(source = %self.name))]
    async fn fetch(&self, query: &str) -> Result<Vec<Item>> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let contents = tokio::fs::read_to_string(&self.catalog_path)
            .await
            .with_context(|| format!("Failed to read catalog: {:?}", self.catalog_path))?;

        let catalog: Vec<Item> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse catalog: {:?}", self.catalog_path))?;

        let items: Vec<Item> = catalog
            .into_iter()
            .filter(|item| matches_query(&item.name, query))
            .map(|item| Item {
                category: String::new(),
                ..item
            })
            .collect();

        debug!("Catalog '{}' matched {} items", self.name, items.len());
        Ok(items)
    }
}

/// What a [`StaticFetcher`] does when invoked.
#[derive(Debug, Clone)]
pub enum StaticOutcome {
    Items(Vec<Item>),
    Fail(String),
    /// Never completes; only a deadline gets the runner past it.
    Hang,
}

/// In-memory fetcher with a fixed outcome and optional delay.
pub struct StaticFetcher {
    name: String,
    outcome: StaticOutcome,
    delay: Duration,
    calls: AtomicU64,
}

impl StaticFetcher {
    pub fn new(name: impl Into<String>, outcome: StaticOutcome) -> Self {
        Self {
            name: name.into(),
            outcome,
            delay: Duration::ZERO,
            calls: AtomicU64::new(0),
        }
    }

    pub fn items(name: impl Into<String>, items: Vec<Item>) -> Self {
        Self::new(name, StaticOutcome::Items(items))
    }

    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, StaticOutcome::Fail(message.into()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of times `fetch` has been called.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _query: &str) -> Result<Vec<Item>> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.outcome {
            StaticOutcome::Items(items) => Ok(items.clone()),
            StaticOutcome::Fail(message) => Err(anyhow!("{}", message)),
            StaticOutcome::Hang => {
                futures::future::pending::<()>().await;
                Ok(Vec::new())
            }
        }
    }
}
