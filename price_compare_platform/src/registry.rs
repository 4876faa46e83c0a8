//! Task registry: owns every in-flight orchestration record.
//!
//! Each record sits behind its own mutex so job runners for different tasks
//! never contend with each other. All mutation goes through
//! [`TaskRegistry::with_lock`] or the narrow helpers built on top of it.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::item::{Filters, Item};

/// Opaque task identifier handed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Success,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Error)
    }
}

/// One in-flight orchestration.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub query: String,
    pub status: TaskStatus,
    pub remaining: usize,
    pub accumulated: Vec<Item>,
    undelivered: Vec<Item>,
    pub final_items: Option<Arc<Vec<Item>>>,
    pub final_filters: Option<Filters>,
    pub error: Option<String>,
    pub created_at: Instant,
    consumed: bool,
}

impl TaskRecord {
    fn new(id: TaskId, query: String, fetcher_count: usize) -> Self {
        Self {
            id,
            query,
            status: TaskStatus::Pending,
            remaining: fetcher_count,
            accumulated: Vec::new(),
            undelivered: Vec::new(),
            final_items: None,
            final_filters: None,
            error: None,
            created_at: Instant::now(),
            consumed: false,
        }
    }

    /// Append one runner's items to the accumulated set and the delivery queue.
    pub fn append(&mut self, items: &[Item]) {
        self.undelivered.extend_from_slice(items);
        self.accumulated.extend_from_slice(items);
    }

    /// Record that one runner finished. Returns `true` exactly once, for the
    /// call that takes the remaining count from 1 to 0; that call also moves
    /// the record to `Processing`.
    pub fn complete_fetcher(&mut self) -> bool {
        if self.remaining == 0 {
            warn!("Task {} received a completion after reaching zero", self.id);
            return false;
        }

        self.remaining -= 1;
        if self.remaining > 0 {
            return false;
        }

        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Processing;
        }
        true
    }

    /// Take every item not yet handed to a poller.
    pub fn drain_undelivered(&mut self) -> Vec<Item> {
        std::mem::take(&mut self.undelivered)
    }

    pub fn pending_delivery(&self) -> usize {
        self.undelivered.len()
    }

    /// Terminal success. Ignored if the record is already terminal.
    pub fn succeed(&mut self, items: Arc<Vec<Item>>, filters: Filters) {
        if self.status.is_terminal() {
            warn!("Task {} already terminal ({:?}); ignoring success", self.id, self.status);
            return;
        }
        self.final_items = Some(items);
        self.final_filters = Some(filters);
        self.status = TaskStatus::Success;
    }

    /// Terminal failure. Ignored if the record is already terminal.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            warn!("Task {} already terminal ({:?}); ignoring error", self.id, self.status);
            return;
        }
        self.error = Some(message.into());
        self.status = TaskStatus::Error;
    }
}

/// What a poller sees for one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum StatusReport {
    Pending {
        #[serde(rename = "products")]
        items: Vec<Item>,
    },
    Processing,
    Success {
        #[serde(rename = "products")]
        items: Arc<Vec<Item>>,
        filters: Filters,
    },
    Error { message: String },
}

impl StatusReport {
    pub fn status(&self) -> TaskStatus {
        match self {
            StatusReport::Pending { .. } => TaskStatus::Pending,
            StatusReport::Processing => TaskStatus::Processing,
            StatusReport::Success { .. } => TaskStatus::Success,
            StatusReport::Error { .. } => TaskStatus::Error,
        }
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Arc<Mutex<TaskRecord>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new `Pending` record expecting `fetcher_count` completions.
    pub fn create(&self, query: &str, fetcher_count: usize) -> TaskId {
        let id = TaskId::new();
        let record = TaskRecord::new(id, query.to_string(), fetcher_count);
        self.tasks.insert(id, Arc::new(Mutex::new(record)));
        debug!("Created task {} for '{}' with {} fetchers", id, query, fetcher_count);
        id
    }

    fn handle(&self, id: TaskId) -> Result<Arc<Mutex<TaskRecord>>, OrchestratorError> {
        // Clone out so the map shard lock is released before the record lock is taken.
        self.tasks
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(OrchestratorError::UnknownTask(id))
    }

    /// Snapshot of a record.
    pub fn get(&self, id: TaskId) -> Result<TaskRecord, OrchestratorError> {
        let handle = self.handle(id)?;
        let record = handle.lock();
        Ok(record.clone())
    }

    /// Run `f` with exclusive access to one record.
    pub fn with_lock<R>(
        &self,
        id: TaskId,
        f: impl FnOnce(&mut TaskRecord) -> R,
    ) -> Result<R, OrchestratorError> {
        let handle = self.handle(id)?;
        let mut record = handle.lock();
        Ok(f(&mut record))
    }

    /// Remove a record. Deleting an absent id is a no-op.
    pub fn delete(&self, id: TaskId) {
        if self.tasks.remove(&id).is_some() {
            debug!("Deleted task {}", id);
        }
    }

    /// Observe a task for a poller. Drains the delivery queue while pending;
    /// a terminal state is reported once and the record is removed.
    pub fn poll(&self, id: TaskId) -> Result<StatusReport, OrchestratorError> {
        let handle = self.handle(id)?;
        let report = {
            let mut record = handle.lock();
            if record.consumed {
                return Err(OrchestratorError::UnknownTask(id));
            }

            match record.status {
                TaskStatus::Pending => StatusReport::Pending {
                    items: record.drain_undelivered(),
                },
                TaskStatus::Processing => StatusReport::Processing,
                TaskStatus::Success => {
                    record.consumed = true;
                    StatusReport::Success {
                        items: record.final_items.clone().unwrap_or_default(),
                        filters: record.final_filters.clone().unwrap_or_default(),
                    }
                }
                TaskStatus::Error => {
                    record.consumed = true;
                    StatusReport::Error {
                        message: record
                            .error
                            .clone()
                            .unwrap_or_else(|| "task failed".to_string()),
                    }
                }
            }
        };

        if report.status().is_terminal() {
            self.delete(id);
        }
        Ok(report)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Age of the longest-lived record still in the registry.
    pub fn oldest_task_age(&self) -> Option<Duration> {
        let handles: Vec<_> = self.tasks.iter().map(|entry| entry.value().clone()).collect();
        handles
            .iter()
            .map(|handle| handle.lock().created_at.elapsed())
            .max()
    }
}
