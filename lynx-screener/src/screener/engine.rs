//! Screening pipeline.
//!
//! Drives one task through `pending → running → completed | failed`. The
//! universe is walked in fixed batches; inside a batch instruments are
//! fetched strictly one after another with a short pause between calls, so
//! a scan of thousands of codes never bursts the upstream providers.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use lynx_common::config::ScreeningConfig;

use super::config::{Candidate, ScreeningCriteria, ScreeningRequest, ScreeningResult};
use super::{ScreeningError, ScreeningSource};
use crate::data::InstrumentMeta;
use crate::tasks::{TaskRegistry, TaskStatus, TaskUpdate};

// ============================================================================
// Settings
// ============================================================================

/// Pacing knobs of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Instruments per progress update
    pub batch_size: usize,
    /// Pause between consecutive fetches inside a batch
    pub item_delay: Duration,
    /// Budget for one instrument (quote plus PE)
    pub item_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            item_delay: Duration::from_millis(300),
            item_timeout: Duration::from_secs(15),
        }
    }
}

impl From<&ScreeningConfig> for PipelineSettings {
    fn from(cfg: &ScreeningConfig) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            item_delay: Duration::from_millis(cfg.item_delay_ms),
            item_timeout: Duration::from_secs(cfg.item_timeout_secs.max(1)),
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Runs screening tasks in the background and records them in the registry.
#[derive(Clone)]
pub struct ScreeningPipeline {
    source: Arc<dyn ScreeningSource>,
    registry: Arc<TaskRegistry>,
    settings: PipelineSettings,
}

impl ScreeningPipeline {
    pub fn new(
        source: Arc<dyn ScreeningSource>,
        registry: Arc<TaskRegistry>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> PipelineSettings {
        self.settings
    }

    /// Validate a request and start a task for it.
    ///
    /// Invalid criteria are rejected before any task is registered.
    pub async fn submit(&self, request: &ScreeningRequest) -> Result<String, ScreeningError> {
        let criteria = ScreeningCriteria::from_request(request)?;
        Ok(self.start(criteria).await)
    }

    /// Register a pending task and run it in the background.
    pub async fn start(&self, criteria: ScreeningCriteria) -> String {
        let id = TaskRegistry::new_task_id();
        self.registry.create(&id, criteria).await;
        info!(task_id = %id, "Screening task created");
        self.spawn(id.clone());
        id
    }

    fn spawn(&self, id: String) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let worker = {
                let pipeline = pipeline.clone();
                let id = id.clone();
                tokio::spawn(async move { pipeline.run(&id).await })
            };

            let outcome = match worker.await {
                Ok(result) => result.map(|_| ()),
                Err(join_err) if join_err.is_panic() => Err(ScreeningError::Internal(
                    panic_message(join_err.into_panic()),
                )),
                Err(join_err) => Err(ScreeningError::Internal(join_err.to_string())),
            };
            if let Err(e) = outcome {
                pipeline.fail(&id, &e).await;
            }
        });
    }

    async fn fail(&self, id: &str, err: &ScreeningError) {
        if *err == ScreeningError::Cancelled {
            info!(task_id = %id, "Screening task stopped after cancellation");
            return;
        }
        error!(task_id = %id, error = %err, "Screening task failed");
        let update = TaskUpdate::status(TaskStatus::Failed).with_error(err.to_string());
        if let Err(e) = self.registry.update(id, update).await {
            debug!(task_id = %id, error = %e, "Task already finished");
        }
    }

    /// Execute a registered task to completion and return the result count.
    ///
    /// Does not record failures; callers decide how to surface them.
    pub async fn run(&self, id: &str) -> Result<usize, ScreeningError> {
        self.registry
            .update(id, TaskUpdate::status(TaskStatus::Running))
            .await?;
        let criteria = self
            .registry
            .get(id)
            .await
            .map(|task| task.criteria)
            .ok_or(ScreeningError::Cancelled)?;

        let universe = self.source.universe().await;
        if universe.is_empty() {
            return Err(ScreeningError::UniverseUnavailable);
        }
        let total = universe.len();
        self.registry
            .update(id, TaskUpdate::default().with_total(total))
            .await?;
        info!(task_id = %id, total, "Screening started");

        let batch_size = self.settings.batch_size.max(1);
        let mut candidates = Vec::new();
        let mut missing = 0usize;

        for (batch_idx, batch) in universe.chunks(batch_size).enumerate() {
            for (i, meta) in batch.iter().enumerate() {
                if i > 0 && !self.settings.item_delay.is_zero() {
                    tokio::time::sleep(self.settings.item_delay).await;
                }
                if self.is_cancelled(id).await {
                    return Err(ScreeningError::Cancelled);
                }

                match tokio::time::timeout(self.settings.item_timeout, self.fetch(meta)).await {
                    Ok(Some(candidate)) => candidates.push(candidate),
                    Ok(None) => {
                        missing += 1;
                        debug!(code = %meta.code, "No quote, skipping");
                    }
                    Err(_) => {
                        missing += 1;
                        debug!(code = %meta.code, "Quote fetch timed out, skipping");
                    }
                }
            }

            let processed = ((batch_idx + 1) * batch_size).min(total);
            self.registry
                .update(id, TaskUpdate::progress(processed))
                .await?;
            debug!(task_id = %id, processed, total, "Batch done");
        }

        if missing > 0 {
            info!(
                task_id = %id,
                missing,
                total,
                ratio = %format!("{:.1}%", missing as f64 / total as f64 * 100.0),
                "Some instruments had no data"
            );
        }

        let results = rank(&criteria, candidates);
        let count = results.len();
        self.registry
            .update(
                id,
                TaskUpdate::status(TaskStatus::Completed)
                    .with_processed(total)
                    .with_results(results),
            )
            .await?;
        info!(task_id = %id, matched = count, total, "Screening completed");
        Ok(count)
    }

    async fn is_cancelled(&self, id: &str) -> bool {
        match self.registry.get(id).await {
            Some(task) => task.status.is_terminal(),
            None => true,
        }
    }

    async fn fetch(&self, meta: &InstrumentMeta) -> Option<Candidate> {
        let quote = self.source.quote_fast(&meta.code).await?;
        let pe = if quote.price > 0.0 {
            self.source
                .pe_ttm(&meta.code, quote.price)
                .await
                .or(quote.pe)
        } else {
            quote.pe
        };
        Some(Candidate {
            meta: meta.clone(),
            quote,
            pe,
        })
    }
}

/// Filter, sort by change descending (stable), and assign 1-based ranks.
pub fn rank(criteria: &ScreeningCriteria, candidates: Vec<Candidate>) -> Vec<ScreeningResult> {
    let mut kept: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| criteria.matches(c))
        .collect();
    kept.sort_by(|a, b| b.quote.change_pct.total_cmp(&a.quote.change_pct));
    kept.iter()
        .enumerate()
        .map(|(i, c)| ScreeningResult::from_candidate(i + 1, c))
        .collect()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic during screening".to_string()
    }
}
