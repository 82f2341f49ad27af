//! In-memory registry of screening tasks.
//!
//! The outer map lock is held only for insert, lookup and eviction; every
//! task carries its own lock so progress updates on one task never block
//! readers of another.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::screener::{ScreeningCriteria, ScreeningResult};

/// Error recorded on a task cancelled through the API.
pub const CANCELLED_MESSAGE: &str = "cancelled by caller";

/// Default registry capacity.
pub const DEFAULT_MAX_TASKS: usize = 100;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} already finished")]
    AlreadyFinished(String),
}

impl From<TaskError> for lynx_common::Error {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::NotFound(_) => Self::NotFound(err.to_string()),
            TaskError::AlreadyFinished(_) => Self::InvalidState(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One screening job.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub criteria: ScreeningCriteria,
    pub status: TaskStatus,
    pub total: usize,
    pub processed: usize,
    pub results: Vec<ScreeningResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Creation order, breaks `created_at` ties
    pub seq: u64,
}

impl Task {
    /// Percentage done, two decimals. Zero while the total is unknown.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let pct = self.processed as f64 / self.total as f64 * 100.0;
        (pct * 100.0).round() / 100.0
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == TaskStatus::Failed && self.error.as_deref() == Some(CANCELLED_MESSAGE)
    }

    /// Serializable view. Results are only attached to completed tasks.
    pub fn view(&self, include_results: bool) -> TaskView {
        TaskView {
            task_id: self.id.clone(),
            status: self.status,
            criteria: self.criteria.clone(),
            total: self.total,
            processed: self.processed,
            progress: self.progress(),
            result_count: self.results.len(),
            results: (include_results && self.status == TaskStatus::Completed)
                .then(|| self.results.clone()),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub status: TaskStatus,
    pub criteria: ScreeningCriteria,
    pub total: usize,
    pub processed: usize,
    pub progress: f64,
    pub result_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<ScreeningResult>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied by [`TaskRegistry::update`].
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub total: Option<usize>,
    pub processed: Option<usize>,
    pub results: Option<Vec<ScreeningResult>>,
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_processed(mut self, processed: usize) -> Self {
        self.processed = Some(processed);
        self
    }

    pub fn with_results(mut self, results: Vec<ScreeningResult>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn progress(processed: usize) -> Self {
        Self::default().with_processed(processed)
    }

    fn apply(self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(total) = self.total {
            task.total = total;
        }
        if let Some(processed) = self.processed {
            task.processed = processed;
        }
        if let Some(results) = self.results {
            task.results = results;
        }
        if let Some(error) = self.error {
            task.error = Some(error);
        }
        task.updated_at = Utc::now();
    }
}

struct TaskSlot {
    created_at: DateTime<Utc>,
    seq: u64,
    task: Arc<RwLock<Task>>,
}

/// Concurrent task store with capacity eviction.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskSlot>>,
    max_tasks: usize,
    next_seq: AtomicU64,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TASKS)
    }
}

impl TaskRegistry {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            max_tasks: max_tasks.max(1),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Generate a fresh task id.
    pub fn new_task_id() -> String {
        format!("screen_{}", uuid::Uuid::new_v4().simple())
    }

    /// Register a pending task, evicting the oldest when over capacity.
    pub async fn create(&self, id: impl Into<String>, criteria: ScreeningCriteria) -> Task {
        let now = Utc::now();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            id: id.into(),
            criteria,
            status: TaskStatus::Pending,
            total: 0,
            processed: 0,
            results: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
            seq,
        };

        let mut tasks = self.tasks.write().await;
        tasks.insert(
            task.id.clone(),
            TaskSlot {
                created_at: now,
                seq,
                task: Arc::new(RwLock::new(task.clone())),
            },
        );
        while tasks.len() > self.max_tasks {
            let oldest = tasks
                .iter()
                .min_by_key(|(_, slot)| (slot.created_at, slot.seq))
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    tasks.remove(&id);
                    debug!(task_id = %id, "Evicted oldest task");
                }
                None => break,
            }
        }
        task
    }

    async fn slot(&self, id: &str) -> Option<Arc<RwLock<Task>>> {
        self.tasks.read().await.get(id).map(|slot| Arc::clone(&slot.task))
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        let task = self.slot(id).await?;
        let task = task.read().await;
        Some(task.clone())
    }

    /// Apply a partial update. Terminal tasks reject every update.
    pub async fn update(&self, id: &str, update: TaskUpdate) -> Result<(), TaskError> {
        let task = self
            .slot(id)
            .await
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        let mut task = task.write().await;
        if task.status.is_terminal() {
            return Err(TaskError::AlreadyFinished(id.to_string()));
        }
        update.apply(&mut task);
        Ok(())
    }

    /// Mark a running or pending task as cancelled.
    pub async fn try_cancel(&self, id: &str) -> Result<(), TaskError> {
        self.update(
            id,
            TaskUpdate::status(TaskStatus::Failed).with_error(CANCELLED_MESSAGE),
        )
        .await?;
        info!(task_id = %id, "Screening task cancelled");
        Ok(())
    }

    /// Whether the task was cancelled by this call.
    pub async fn cancel(&self, id: &str) -> bool {
        self.try_cancel(id).await.is_ok()
    }

    /// Any task still pending or running.
    pub async fn active(&self) -> Option<Task> {
        let slots: Vec<_> = {
            let tasks = self.tasks.read().await;
            let mut slots: Vec<_> = tasks
                .values()
                .map(|slot| (slot.created_at, slot.seq, Arc::clone(&slot.task)))
                .collect();
            slots.sort_by_key(|(created_at, seq, _)| (*created_at, *seq));
            slots
        };
        for (_, _, task) in slots {
            let task = task.read().await;
            if !task.status.is_terminal() {
                return Some(task.clone());
            }
        }
        None
    }

    /// Every task, newest first.
    pub async fn list_all(&self) -> Vec<Task> {
        let slots: Vec<_> = {
            let tasks = self.tasks.read().await;
            tasks.values().map(|slot| Arc::clone(&slot.task)).collect()
        };
        let mut out = Vec::with_capacity(slots.len());
        for task in slots {
            out.push(task.read().await.clone());
        }
        out.sort_by(|a, b| (b.created_at, b.seq).cmp(&(a.created_at, a.seq)));
        out
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}
