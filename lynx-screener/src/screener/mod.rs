//! Batch screening over the instrument universe.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌─────────────────┐
//! │ POST /screen │──▶│ ScreeningPipeline│──▶│  TaskRegistry   │
//! └──────────────┘   └────────┬─────────┘   └─────────────────┘
//!                             │ universe / quote_fast / pe_ttm
//!                    ┌────────▼─────────┐
//!                    │ MarketDataService│
//!                    └──────────────────┘
//! ```
//!
//! Each task walks the universe in batches, fetching instruments one at a
//! time, then filters, sorts and ranks what it collected.

pub mod config;
pub mod engine;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::data::{InstrumentMeta, MarketDataService, Quote};
use crate::tasks::TaskError;

pub use config::{
    Candidate, ChangeDirection, PresetBounds, ScreeningCriteria, ScreeningRequest,
    ScreeningResult, StrategyPreset,
};
pub use engine::ScreeningPipeline;

/// Task-level screening failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScreeningError {
    #[error("instrument universe unavailable")]
    UniverseUnavailable,

    #[error("cancelled by caller")]
    Cancelled,

    #[error("invalid criteria: {0}")]
    Validation(String),

    #[error("screening failed: {0}")]
    Internal(String),
}

impl From<ScreeningError> for lynx_common::Error {
    fn from(err: ScreeningError) -> Self {
        match err {
            ScreeningError::Validation(msg) => Self::InvalidInput(msg),
            ScreeningError::Cancelled => Self::InvalidState(err.to_string()),
            ScreeningError::UniverseUnavailable => Self::Upstream(err.to_string()),
            ScreeningError::Internal(msg) => Self::Internal(msg),
        }
    }
}

impl From<TaskError> for ScreeningError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::AlreadyFinished(_) => Self::Cancelled,
            TaskError::NotFound(id) => Self::Internal(format!("task {id} disappeared")),
        }
    }
}

/// Data the pipeline needs from the acquisition layer.
#[async_trait]
pub trait ScreeningSource: Send + Sync + 'static {
    async fn universe(&self) -> Arc<Vec<InstrumentMeta>>;

    async fn quote_fast(&self, code: &str) -> Option<Quote>;

    async fn pe_ttm(&self, code: &str, price: f64) -> Option<f64>;
}

#[async_trait]
impl ScreeningSource for MarketDataService {
    async fn universe(&self) -> Arc<Vec<InstrumentMeta>> {
        self.get_universe().await
    }

    async fn quote_fast(&self, code: &str) -> Option<Quote> {
        self.get_quote_fast(code).await
    }

    async fn pe_ttm(&self, code: &str, price: f64) -> Option<f64> {
        self.get_pe_ttm(code, price).await
    }
}
