//! Core coordinator that fans a query out to every source and tracks the
//! resulting task until a poller consumes its terminal state.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::{
    context::SearchContext,
    error::OrchestratorError,
    fetcher::{CatalogFetcher, Fetcher},
    item::{Filters, Item},
    registry::{StatusReport, TaskId},
    runner,
    settings::Settings,
};

/// Immediate answer to a submitted query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum SubmitOutcome {
    /// Served from the global cache; no task was created.
    Success {
        items: Arc<Vec<Item>>,
        filters: Filters,
    },
    /// A new orchestration was started; poll `task_id`.
    Pending { task_id: TaskId },
}

pub struct Orchestrator {
    ctx: Arc<SearchContext>,
    fetchers: Vec<Arc<dyn Fetcher>>,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(ctx: Arc<SearchContext>, fetchers: Vec<Arc<dyn Fetcher>>) -> Self {
        Self {
            ctx,
            fetchers,
            poll_interval: Duration::from_millis(1_500),
        }
    }

    /// Build the orchestrator and its catalog sources from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let fetchers: Vec<Arc<dyn Fetcher>> = settings
            .sources
            .iter()
            .map(|source| Arc::new(CatalogFetcher::from_config(source)) as Arc<dyn Fetcher>)
            .collect();

        info!("Orchestrator initialized with {} sources", fetchers.len());
        Self::new(SearchContext::from_config(&settings.orchestrator), fetchers)
            .with_poll_interval(Duration::from_millis(settings.orchestrator.poll_interval_ms))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Suggested delay between client polls.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn context(&self) -> &Arc<SearchContext> {
        &self.ctx
    }

    pub fn source_names(&self) -> Vec<String> {
        self.fetchers.iter().map(|f| f.name().to_string()).collect()
    }

    /// Answer from the global cache, or start a new orchestration and
    /// return its task id without waiting for any source.
    #[instrument(skip(self))]
    pub fn submit_query(&self, requester: &str, query: &str) -> SubmitOutcome {
        if let Some(cached) = self.ctx.cache.get_by_query(query) {
            info!("Requester {} got cache hit for '{}'", requester, query);
            self.ctx
                .cache
                .set_current_for_requester(requester, cached.items.clone());
            return SubmitOutcome::Success {
                items: cached.items.clone(),
                filters: cached.filters.clone(),
            };
        }

        let task_id = self.ctx.registry.create(query, self.fetchers.len());
        info!(
            "Requester {} got cache miss for '{}'; task {} dispatched to {} sources",
            requester,
            query,
            task_id,
            self.fetchers.len()
        );

        if self.fetchers.is_empty() {
            let message = OrchestratorError::NoResults("no sources configured".to_string());
            warn!("Task {} cannot run: {}", task_id, message);
            // Pending -> Error with no processing step.
            if let Err(e) = self
                .ctx
                .registry
                .with_lock(task_id, |record| record.fail(message.to_string()))
            {
                warn!("Task vanished before error was recorded: {}", e);
            }
            return SubmitOutcome::Pending { task_id };
        }

        for fetcher in &self.fetchers {
            self.ctx.pool.spawn(
                "job_runner",
                runner::run_job(self.ctx.clone(), task_id, fetcher.clone(), query.to_string()),
            );
        }

        SubmitOutcome::Pending { task_id }
    }

    /// One poll of a task. Terminal states are returned once; the record is
    /// then gone and later polls report `UnknownTask`.
    pub fn poll_status(&self, task_id: TaskId) -> Result<StatusReport, OrchestratorError> {
        self.ctx.registry.poll(task_id)
    }

    /// Poll on behalf of a requester; a successful result also becomes the
    /// requester's current item set.
    pub fn poll_status_for(
        &self,
        requester: &str,
        task_id: TaskId,
    ) -> Result<StatusReport, OrchestratorError> {
        let report = self.poll_status(task_id)?;
        if let StatusReport::Success { items, .. } = &report {
            self.ctx
                .cache
                .set_current_for_requester(requester, items.clone());
        }
        Ok(report)
    }

    pub fn current_items_for_requester(&self, requester: &str) -> Option<Arc<Vec<Item>>> {
        self.ctx.cache.get_current_for_requester(requester)
    }

    /// Poll until the task is terminal, collecting every incremental batch.
    /// Returns the incremental items and the terminal report.
    pub async fn poll_until_terminal(
        &self,
        requester: &str,
        task_id: TaskId,
    ) -> Result<(Vec<Item>, StatusReport), OrchestratorError> {
        let mut delivered = Vec::new();
        loop {
            match self.poll_status_for(requester, task_id)? {
                StatusReport::Pending { items } => delivered.extend(items),
                StatusReport::Processing => {}
                terminal => return Ok((delivered, terminal)),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Tasks not yet consumed by a poller.
    pub fn in_flight(&self) -> usize {
        self.ctx.registry.len()
    }

    /// How long the oldest unconsumed task has been alive.
    pub fn oldest_task_age(&self) -> Option<Duration> {
        self.ctx.registry.oldest_task_age()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::StaticFetcher;

    fn orchestrator(fetchers: Vec<Arc<dyn Fetcher>>) -> Orchestrator {
        Orchestrator::new(SearchContext::new(4, Duration::from_secs(5)), fetchers)
            .with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_no_sources_reports_error() {
        let orchestrator = orchestrator(vec![]);
        let SubmitOutcome::Pending { task_id } = orchestrator.submit_query("alice", "boots") else {
            panic!("expected a task");
        };

        match orchestrator.poll_status(task_id).unwrap() {
            StatusReport::Error { message } => assert!(message.contains("no sources")),
            other => panic!("unexpected report: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_poll_success_sets_requester_pointer() {
        let fetcher: Arc<dyn Fetcher> = Arc::new(StaticFetcher::items(
            "nike",
            vec![Item::new("Nike Boot", 90.0, "i", "u1", "Nike")],
        ));
        let orchestrator = orchestrator(vec![fetcher]);

        let SubmitOutcome::Pending { task_id } = orchestrator.submit_query("alice", "boots") else {
            panic!("expected a task");
        };
        let (_, report) = orchestrator.poll_until_terminal("alice", task_id).await.unwrap();

        assert!(matches!(report, StatusReport::Success { .. }));
        assert_eq!(
            orchestrator.current_items_for_requester("alice").unwrap().len(),
            1
        );
        assert_eq!(orchestrator.in_flight(), 0);
    }
}
