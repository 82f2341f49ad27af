//! Lynx Screener Library
//!
//! Resilient A-share market data acquisition plus a batch screening
//! pipeline on top of it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                   lynx-screener (Rust Service)                      │
//! │                             :4450                                   │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐      │
//! │  │  HTTP routes    │─▶│ Screening       │─▶│  Task Registry  │      │
//! │  │  (axum)         │  │ Pipeline        │  │                 │      │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────────┘      │
//! │           └───────────┬────────┘                                    │
//! │                ┌──────▼────────────┐                                │
//! │                │ MarketDataService │ cache · circuits · store       │
//! │                └──────┬────────────┘                                │
//! │        ┌──────────────┴──────────────┐                              │
//! │  ┌─────▼──────┐                ┌─────▼──────┐                       │
//! │  │ Eastmoney  │ (semaphore)    │ Baostock   │ (session mutex)       │
//! │  └────────────┘                └────────────┘                       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Freshness Tiers
//!
//! Every quote says where it came from:
//! - **snapshot_cache**: bulk market snapshot, refreshed every few minutes
//! - **persisted**: last quote written to SQLite
//! - **live**: most recent daily bar from the session provider
//! - **historical_fallback**: most recent kline from the HTTP provider

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod circuit_breaker;
pub mod data;
pub mod routes;
pub mod screener;
pub mod tasks;

use anyhow::Result;
use axum::http::HeaderValue;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use lynx_common::config::Config;

use crate::data::MarketDataService;
use crate::screener::engine::PipelineSettings;
use crate::screener::ScreeningPipeline;
use crate::tasks::TaskRegistry;

/// Screener service state
pub struct ScreenerState {
    /// Configuration
    pub config: Config,
    /// Market data service
    pub market: MarketDataService,
    /// Screening tasks
    pub registry: Arc<TaskRegistry>,
    /// Screening pipeline
    pub pipeline: ScreeningPipeline,
}

impl ScreenerState {
    /// Build the state with real providers.
    pub fn new(config: Config) -> Self {
        let market = MarketDataService::from_config(&config);
        Self::with_market(config, market)
    }

    /// Build the state around an existing market data service.
    pub fn with_market(config: Config, market: MarketDataService) -> Self {
        let registry = Arc::new(TaskRegistry::new(config.screening.max_tasks));
        let pipeline = ScreeningPipeline::new(
            Arc::new(market.clone()),
            Arc::clone(&registry),
            PipelineSettings::from(&config.screening),
        );
        Self {
            config,
            market,
            registry,
            pipeline,
        }
    }
}

/// Build the HTTP router with all routes and middleware.
pub fn build_router(state: Arc<ScreenerState>) -> Router {
    let cors = cors_layer(&state.config.network.cors_origins);

    Router::new()
        .route("/health", get(routes::health))
        // Screening
        .route("/api/screen", post(routes::start_screening))
        .route("/api/screen/task/:id", get(routes::get_task))
        .route("/api/screen/task/:id/cancel", post(routes::cancel_task))
        .route("/api/screen/tasks", get(routes::list_tasks))
        .route("/api/screen/active", get(routes::active_task))
        .route("/api/screen/strategies", get(routes::list_strategies))
        // Market data
        .route("/api/stocks", get(routes::list_stocks))
        .route("/api/stocks/cache/stats", get(routes::cache_stats))
        .route("/api/stocks/cache/clear", post(routes::clear_cache))
        .route("/api/stocks/snapshot/refresh", post(routes::refresh_snapshot))
        .route("/api/stocks/:code", get(routes::get_stock))
        .route("/api/stocks/:code/history", get(routes::get_stock_history))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

/// Main screener service
pub struct ScreenerService {
    state: Arc<ScreenerState>,
}

impl ScreenerService {
    /// Create a new screener service
    pub fn new(config: Config) -> Self {
        Self {
            state: Arc::new(ScreenerState::new(config)),
        }
    }

    pub fn state(&self) -> &Arc<ScreenerState> {
        &self.state
    }

    /// Serve until Ctrl-C or SIGTERM, then release provider sessions.
    pub async fn start(self) -> Result<()> {
        let addr = self.state.config.bind_address();
        let app = build_router(Arc::clone(&self.state));

        let warm = self.state.market.clone();
        tokio::spawn(async move { warm.warm_up().await });

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(address = %addr, "Starting HTTP server");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("HTTP server stopped, releasing providers");
        self.state.market.shutdown().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
