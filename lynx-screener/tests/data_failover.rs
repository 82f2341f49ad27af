//! Integration tests for market data failover.
//!
//! Drives `MarketDataService` against scripted providers to check tier
//! order, provider fallback, circuit breaking, and graceful degradation.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use lynx_screener::circuit_breaker::CircuitBreakerConfig;
use lynx_screener::data::{FreshnessTier, Period, ProviderError, QuoteStore};
use tempfile::TempDir;

use common::{candle, day, entry, harness, harness_with, universe};

// ============================================================================
// Quote Tiers
// ============================================================================

#[tokio::test]
async fn test_snapshot_tier_serves_quote_without_session() {
    let h = harness(None);
    let mut rows = HashMap::new();
    rows.insert("600519".to_string(), entry("贵州茅台", 1700.0, 1.2));
    h.snapshot.push_snapshot(Ok(rows));

    assert!(h.service.refresh_universe_snapshot().await);
    assert_eq!(h.service.snapshot_len(), 1);

    let quote = h.service.get_quote("600519").await.unwrap();
    assert_eq!(quote.freshness, FreshnessTier::SnapshotCache);
    assert_eq!(quote.price, 1700.0);
    assert_eq!(quote.pe, Some(20.0));
    assert_eq!(h.session.bar_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_snapshot() {
    let h = harness(None);
    let mut rows = HashMap::new();
    rows.insert("600519".to_string(), entry("贵州茅台", 1700.0, 1.2));
    rows.insert("000001".to_string(), entry("平安银行", 10.5, -0.4));
    h.snapshot.push_snapshot(Ok(rows));
    assert!(h.service.refresh_universe_snapshot().await);

    for _ in 0..3 {
        h.snapshot
            .push_snapshot(Err(ProviderError::Network("timeout".into())));
    }
    assert!(!h.service.refresh_universe_snapshot().await);
    assert_eq!(h.service.snapshot_len(), 2);
    assert_eq!(h.snapshot.snapshot_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_live_tier_from_session_bars() {
    let h = harness(None);
    h.session.set_bars(
        "600519",
        Ok(vec![candle(day(9), 1690.0, 0.3), candle(day(10), 1700.0, 0.6)]),
    );

    let quote = h.service.get_quote("600519").await.unwrap();
    assert_eq!(quote.freshness, FreshnessTier::Live);
    assert_eq!(quote.price, 1700.0);
    assert_eq!(quote.trade_date, day(10));
    assert_eq!(h.snapshot.history_calls.load(Ordering::SeqCst), 0);

    // Second lookup comes from memory.
    h.service.get_quote("600519").await.unwrap();
    assert_eq!(h.session.bar_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_falls_back_to_kline_provider() {
    let h = harness(None);
    h.session
        .set_bars("000001", Err(ProviderError::Network("connection refused".into())));
    h.snapshot
        .set_history("000001", Ok(vec![candle(day(10), 10.5, -0.4)]));

    let quote = h.service.get_quote("000001").await.unwrap();
    assert_eq!(quote.freshness, FreshnessTier::HistoricalFallback);
    assert_eq!(quote.price, 10.5);
    assert_eq!(h.snapshot.history_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exhausted_providers_degrade_to_none() {
    let h = harness(None);
    h.session
        .set_bars("300750", Err(ProviderError::Network("reset".into())));
    h.snapshot
        .set_history("300750", Err(ProviderError::MalformedResponse("html page".into())));

    assert!(h.service.get_quote("300750").await.is_none());
}

#[tokio::test]
async fn test_persisted_tier_survives_restart() {
    let dir = TempDir::new().unwrap();
    let store = QuoteStore::open(dir.path().join("lynx.db")).unwrap();

    let first = harness(Some(store.clone()));
    first
        .session
        .set_bars("600519", Ok(vec![candle(day(10), 1700.0, 0.6)]));
    let live = first.service.get_quote("600519").await.unwrap();
    assert_eq!(live.freshness, FreshnessTier::Live);

    for _ in 0..50 {
        if store.quote_count().await.unwrap() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let second = harness(Some(store));
    let quote = second.service.get_quote("600519").await.unwrap();
    assert_eq!(quote.freshness, FreshnessTier::Persisted);
    assert_eq!(quote.price, 1700.0);
    assert_eq!(second.session.bar_calls.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Circuit Breaking
// ============================================================================

#[tokio::test]
async fn test_malformed_responses_open_session_circuit() {
    let h = harness_with(
        None,
        CircuitBreakerConfig::default()
            .failure_threshold(2)
            .cooldown(Duration::from_secs(600)),
    );
    for code in ["600001", "600002", "600003"] {
        h.session
            .set_bars(code, Err(ProviderError::MalformedResponse("garbled".into())));
    }

    assert!(h.service.get_quote("600001").await.is_none());
    assert!(h.service.get_quote("600002").await.is_none());
    assert!(h.service.get_quote("600003").await.is_none());

    assert_eq!(h.session.bar_calls.load(Ordering::SeqCst), 2);
    let circuits = h.service.circuit_states();
    let session = circuits.iter().find(|c| c.provider == "baostock").unwrap();
    assert!(session.open);
    assert_eq!(session.times_opened, 1);
}

#[tokio::test]
async fn test_open_session_circuit_routes_quotes_to_kline_provider() {
    let h = harness_with(
        None,
        CircuitBreakerConfig::default()
            .failure_threshold(1)
            .cooldown(Duration::from_secs(600)),
    );
    h.session
        .set_bars("600001", Err(ProviderError::MalformedResponse("garbled".into())));
    h.session
        .set_bars("000001", Ok(vec![candle(day(10), 99.0, 9.9)]));
    h.snapshot
        .set_history("000001", Ok(vec![candle(day(10), 10.5, -0.4)]));

    assert!(h.service.get_quote("600001").await.is_none());
    let session_calls = h.session.bar_calls.load(Ordering::SeqCst);
    let history_calls = h.snapshot.history_calls.load(Ordering::SeqCst);

    let quote = h.service.get_quote("000001").await.unwrap();
    assert_eq!(quote.freshness, FreshnessTier::HistoricalFallback);
    assert_eq!(quote.price, 10.5);
    assert_eq!(quote.change_pct, -0.4);
    assert_eq!(h.session.bar_calls.load(Ordering::SeqCst), session_calls);
    assert_eq!(
        h.snapshot.history_calls.load(Ordering::SeqCst),
        history_calls + 1
    );
}

#[tokio::test]
async fn test_network_errors_do_not_open_circuit() {
    let h = harness(None);
    for code in ["600001", "600002", "600003"] {
        h.session
            .set_bars(code, Err(ProviderError::Network("timeout".into())));
    }
    for code in ["600001", "600002", "600003"] {
        h.service.get_quote(code).await;
    }
    assert_eq!(h.session.bar_calls.load(Ordering::SeqCst), 3);
}

// ============================================================================
// Fast Path, History, Fundamentals
// ============================================================================

#[tokio::test]
async fn test_fast_quote_widens_window_and_skips_snapshot_provider() {
    let h = harness(None);
    h.session.set_bars("600519", Ok(Vec::new()));

    assert!(h.service.get_quote_fast("600519").await.is_none());
    assert_eq!(h.session.bar_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.snapshot.history_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.snapshot.snapshot_calls.load(Ordering::SeqCst), 0);

    h.session
        .set_bars("000001", Ok(vec![candle(day(10), 10.5, 1.0)]));
    let quote = h.service.get_quote_fast("000001").await.unwrap();
    assert_eq!(quote.freshness, FreshnessTier::Live);
    assert_eq!(h.session.bar_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_history_falls_back_and_caches() {
    let h = harness(None);
    h.session
        .set_bars("600519", Err(ProviderError::Disconnected("eof".into())));
    h.snapshot.set_history(
        "600519",
        Ok(vec![candle(day(3), 1650.0, 0.1), candle(day(10), 1700.0, 0.6)]),
    );

    let bars = h.service.get_history("600519", Period::Weekly, None).await;
    assert_eq!(bars.len(), 2);
    let again = h.service.get_history("600519", Period::Weekly, None).await;
    assert_eq!(again, bars);
    assert_eq!(h.snapshot.history_calls.load(Ordering::SeqCst), 1);

    assert!(h
        .service
        .get_history("688981", Period::Daily, None)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_pe_ttm_uses_cached_eps() {
    let h = harness(None);
    h.session.set_eps("600519", 50.0);

    assert_eq!(h.service.get_pe_ttm("600519", 1700.0).await, Some(34.0));
    assert_eq!(h.service.get_pe_ttm("600519", 1750.0).await, Some(35.0));
    assert_eq!(h.session.eps_calls.load(Ordering::SeqCst), 1);

    assert_eq!(h.service.get_pe_ttm("600519", 0.0).await, None);

    h.session.set_eps("000001", -0.3);
    assert_eq!(h.service.get_pe_ttm("000001", 10.0).await, None);

    // No report in any searched quarter.
    assert_eq!(h.service.get_pe_ttm("300750", 200.0).await, None);
    assert_eq!(h.session.eps_calls.load(Ordering::SeqCst), 1 + 1 + 4);
}

// ============================================================================
// Universe
// ============================================================================

#[tokio::test]
async fn test_universe_retries_then_caches() {
    let h = harness(None);
    h.snapshot
        .push_listing(Err(ProviderError::Network("timeout".into())));
    h.snapshot
        .push_listing(Err(ProviderError::Network("timeout".into())));
    h.snapshot.push_listing(Ok(universe(&[
        ("000001", "平安银行"),
        ("600519", "贵州茅台"),
    ])));

    assert_eq!(h.service.get_universe().await.len(), 2);
    assert_eq!(h.service.get_universe().await.len(), 2);
    assert_eq!(h.snapshot.listing_calls.load(Ordering::SeqCst), 3);

    let meta = h.service.get_instrument("600519").await.unwrap();
    assert_eq!(meta.name, "贵州茅台");
}

#[tokio::test]
async fn test_universe_unavailable_is_empty() {
    let h = harness(None);
    assert!(h.service.get_universe().await.is_empty());
    assert_eq!(h.snapshot.listing_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_stored_universe_served_when_provider_down() {
    let dir = TempDir::new().unwrap();
    let store = QuoteStore::open(dir.path().join("lynx.db")).unwrap();

    let first = harness(Some(store.clone()));
    first.snapshot.push_listing(Ok(universe(&[
        ("000001", "平安银行"),
        ("600519", "贵州茅台"),
    ])));
    assert_eq!(first.service.get_universe().await.len(), 2);

    for _ in 0..50 {
        if store.load_instruments().await.unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let second = harness(Some(store));
    let list = second.service.get_universe().await;
    let codes: Vec<_> = list.iter().map(|m| m.code.as_str()).collect();
    assert_eq!(codes, vec!["000001", "600519"]);
    assert_eq!(second.snapshot.listing_calls.load(Ordering::SeqCst), 3);

    // The stored list is not cached; the provider is asked again next time.
    second.snapshot.push_listing(Ok(universe(&[("300750", "宁德时代")])));
    assert_eq!(second.service.get_universe().await.len(), 1);
    assert_eq!(second.snapshot.listing_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_shutdown_logs_out_session() {
    let h = harness(None);
    h.service.warm_up().await;
    assert_eq!(h.session.logins.load(Ordering::SeqCst), 1);

    h.service.shutdown().await;
    assert_eq!(h.session.logouts.load(Ordering::SeqCst), 1);
}
