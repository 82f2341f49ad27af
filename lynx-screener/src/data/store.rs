//! Persistent quote store using SQLite.
//!
//! Holds the last known quote per instrument and the instrument list so a
//! restart does not start from a cold cache. Every unit of work opens its
//! own connection on the blocking pool; no connection outlives the call
//! or is held across network I/O.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{FreshnessTier, InstrumentMeta, Market, Quote, UniverseSnapshot};

// ============================================================================
// Database Schema
// ============================================================================

const CREATE_TABLES_SQL: &str = r#"
-- Instrument list
CREATE TABLE IF NOT EXISTS instruments (
    code TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    industry TEXT,
    market TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Last known quote per instrument
CREATE TABLE IF NOT EXISTS stock_quotes (
    code TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    price REAL NOT NULL,
    change_pct REAL NOT NULL,
    open REAL,
    high REAL,
    low REAL,
    volume REAL NOT NULL DEFAULT 0,
    turnover REAL NOT NULL DEFAULT 0,
    pe REAL,
    pb REAL,
    market_cap REAL,
    as_of TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_stock_quotes_updated
ON stock_quotes(updated_at DESC);

-- Saved screening runs
CREATE TABLE IF NOT EXISTS screening_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    criteria_json TEXT NOT NULL,
    result_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- User watchlist
CREATE TABLE IF NOT EXISTS watchlist (
    code TEXT PRIMARY KEY,
    added_at TEXT NOT NULL,
    note TEXT
);
"#;

const UPSERT_QUOTE_SQL: &str = r#"
INSERT OR REPLACE INTO stock_quotes
(code, name, price, change_pct, open, high, low, volume, turnover, pe, pb, market_cap, as_of, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
"#;

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// Store
// ============================================================================

/// SQLite-backed store. Cheap to clone; holds only the database path.
#[derive(Debug, Clone)]
pub struct QuoteStore {
    db_path: Arc<PathBuf>,
}

impl QuoteStore {
    /// Open (creating when needed) the database and its schema.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(&db_path).context("Failed to open quote store database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to set database pragmas")?;
        conn.execute_batch(CREATE_TABLES_SQL)
            .context("Failed to create database tables")?;

        info!(db_path = %db_path.display(), "Initialized quote store");
        Ok(Self {
            db_path: Arc::new(db_path),
        })
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(self.db_path.as_path())
            .context("Failed to open quote store database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        Ok(conn)
    }

    /// Run `work` with a fresh connection on the blocking pool.
    async fn with_conn<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = store.connect()?;
            work(&mut conn)
        })
        .await
        .context("Quote store task panicked")?
    }

    // ========================================================================
    // Quotes
    // ========================================================================

    /// Insert or replace the row for `quote.code`.
    pub async fn upsert_quote(&self, quote: Quote) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                UPSERT_QUOTE_SQL,
                params![
                    quote.code,
                    quote.name,
                    quote.price,
                    quote.change_pct,
                    quote.open,
                    quote.high,
                    quote.low,
                    quote.volume,
                    quote.turnover,
                    quote.pe,
                    quote.pb,
                    quote.market_cap,
                    quote.trade_date.to_string(),
                    timestamp(Utc::now()),
                ],
            )
            .context("Failed to upsert quote")?;
            debug!(code = %quote.code, "Persisted quote");
            Ok(())
        })
        .await
    }

    /// The stored quote for `code` when it was written within `max_age`.
    pub async fn latest_quote(&self, code: &str, max_age: Duration) -> Result<Option<Quote>> {
        let code = code.to_string();
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let cutoff = timestamp(Utc::now() - max_age);

        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    r#"
                    SELECT code, name, price, change_pct, open, high, low, volume, turnover,
                           pe, pb, market_cap, as_of, updated_at
                    FROM stock_quotes
                    WHERE code = ?1 AND updated_at > ?2
                    "#,
                    params![code, cutoff],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, f64>(3)?,
                            row.get::<_, Option<f64>>(4)?,
                            row.get::<_, Option<f64>>(5)?,
                            row.get::<_, Option<f64>>(6)?,
                            row.get::<_, f64>(7)?,
                            row.get::<_, f64>(8)?,
                            row.get::<_, Option<f64>>(9)?,
                            row.get::<_, Option<f64>>(10)?,
                            row.get::<_, Option<f64>>(11)?,
                            row.get::<_, String>(12)?,
                            row.get::<_, String>(13)?,
                        ))
                    },
                )
                .optional()
                .context("Failed to read quote")?;

            let Some((code, name, price, change_pct, open, high, low, volume, turnover, pe, pb, market_cap, as_of, updated_at)) = row
            else {
                return Ok(None);
            };

            let trade_date = NaiveDate::parse_from_str(&as_of, "%Y-%m-%d")
                .with_context(|| format!("Bad as_of {as_of:?} for {code}"))?;
            let fetched_at = DateTime::parse_from_rfc3339(&updated_at)
                .with_context(|| format!("Bad updated_at {updated_at:?} for {code}"))?
                .with_timezone(&Utc);
            let tier = FreshnessTier::Persisted;

            Ok(Some(Quote {
                code,
                name,
                price,
                change_pct,
                open,
                high,
                low,
                volume,
                turnover,
                pe,
                pb,
                market_cap,
                trade_date,
                fetched_at,
                freshness: tier,
                delay: tier.delay_description().to_string(),
            }))
        })
        .await
    }

    /// Write every snapshot row, committing once per `chunk` rows.
    ///
    /// Returns the number of rows written.
    pub async fn bulk_upsert_snapshot(
        &self,
        snapshot: Arc<UniverseSnapshot>,
        chunk: usize,
    ) -> Result<usize> {
        let chunk = chunk.max(1);
        self.with_conn(move |conn| {
            let mut rows: Vec<_> = snapshot.entries.iter().collect();
            rows.sort_by(|a, b| a.0.cmp(b.0));
            let updated_at = timestamp(Utc::now());

            let mut written = 0;
            for batch in rows.chunks(chunk) {
                let tx = conn.transaction().context("Failed to begin transaction")?;
                {
                    let mut stmt = tx
                        .prepare_cached(UPSERT_QUOTE_SQL)
                        .context("Failed to prepare snapshot upsert")?;
                    for (code, entry) in batch {
                        stmt.execute(params![
                            code,
                            entry.name,
                            entry.price,
                            entry.change_pct,
                            entry.open,
                            entry.high,
                            entry.low,
                            entry.volume,
                            entry.amount,
                            entry.pe,
                            entry.pb,
                            entry.market_cap,
                            super::china_date(entry.as_of).to_string(),
                            updated_at,
                        ])
                        .with_context(|| format!("Failed to write snapshot row {code}"))?;
                    }
                }
                tx.commit().context("Failed to commit snapshot chunk")?;
                written += batch.len();
            }

            debug!(rows = written, chunk, "Persisted market snapshot");
            Ok(written)
        })
        .await
    }

    /// Stored quote row count.
    pub async fn quote_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM stock_quotes", [], |row| row.get(0))
                .context("Failed to count quotes")?;
            Ok(count as u64)
        })
        .await
    }

    // ========================================================================
    // Instruments
    // ========================================================================

    /// Replace stored metadata for the given instruments.
    pub async fn upsert_instruments(&self, instruments: Arc<Vec<InstrumentMeta>>) -> Result<usize> {
        self.with_conn(move |conn| {
            let updated_at = timestamp(Utc::now());
            let tx = conn.transaction().context("Failed to begin transaction")?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        r#"
                        INSERT OR REPLACE INTO instruments (code, name, industry, market, updated_at)
                        VALUES (?1, ?2, ?3, ?4, ?5)
                        "#,
                    )
                    .context("Failed to prepare instrument upsert")?;
                for meta in instruments.iter() {
                    let market = serde_json::to_value(meta.market)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_else(|| "unknown".to_string());
                    stmt.execute(params![meta.code, meta.name, meta.industry, market, updated_at])
                        .with_context(|| format!("Failed to write instrument {}", meta.code))?;
                }
            }
            tx.commit().context("Failed to commit instruments")?;
            Ok(instruments.len())
        })
        .await
    }

    /// Every stored instrument, ordered by code.
    pub async fn load_instruments(&self) -> Result<Vec<InstrumentMeta>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT code, name, industry, market FROM instruments ORDER BY code")
                .context("Failed to prepare instrument query")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .context("Failed to query instruments")?;

            let mut out = Vec::new();
            for row in rows {
                let (code, name, industry, market) = row.context("Failed to read instrument")?;
                let market = Market::parse(&market).unwrap_or_else(|| Market::from_code(&code));
                out.push(InstrumentMeta {
                    code,
                    name,
                    industry,
                    market,
                });
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SnapshotEntry;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, QuoteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = QuoteStore::open(dir.path().join("data").join("lynx.db")).unwrap();
        (dir, store)
    }

    fn quote(code: &str, price: f64) -> Quote {
        Quote {
            code: code.to_string(),
            name: "平安银行".to_string(),
            price,
            change_pct: 1.5,
            open: Some(10.0),
            high: Some(10.9),
            low: None,
            volume: 1200.0,
            turnover: 1_300_000.0,
            pe: Some(5.2),
            pb: None,
            market_cap: None,
            trade_date: NaiveDate::from_ymd_opt(2024, 5, 10).unwrap(),
            fetched_at: Utc::now(),
            freshness: FreshnessTier::Live,
            delay: FreshnessTier::Live.delay_description().to_string(),
        }
    }

    fn entry(name: &str, price: f64) -> SnapshotEntry {
        SnapshotEntry {
            name: name.to_string(),
            price,
            change_pct: 0.5,
            open: None,
            high: None,
            low: None,
            volume: 100.0,
            amount: 1000.0,
            pe: Some(12.0),
            pb: Some(1.1),
            market_cap: Some(1e10),
            industry: None,
            as_of: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_store_creates_parent_dirs() {
        let (_dir, store) = create_test_store();
        assert!(store.db_path.exists());
        assert_eq!(store.quote_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_quote_roundtrip_is_marked_persisted() {
        let (_dir, store) = create_test_store();
        store.upsert_quote(quote("000001", 10.5)).await.unwrap();
        store.upsert_quote(quote("000001", 10.7)).await.unwrap();

        let got = store
            .latest_quote("000001", Duration::from_secs(1800))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.price, 10.7);
        assert_eq!(got.low, None);
        assert_eq!(got.freshness, FreshnessTier::Persisted);
        assert_eq!(got.delay, "within 30 minutes");
        assert_eq!(store.quote_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_rows_are_ignored() {
        let (_dir, store) = create_test_store();
        store.upsert_quote(quote("000001", 10.5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let got = store
            .latest_quote("000001", Duration::from_millis(1))
            .await
            .unwrap();
        assert!(got.is_none());
        assert!(store
            .latest_quote("600000", Duration::from_secs(1800))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_bulk_upsert_commits_in_chunks() {
        let (_dir, store) = create_test_store();
        let entries: HashMap<String, SnapshotEntry> = (0..7)
            .map(|i| (format!("60000{i}"), entry("测试", 10.0 + i as f64)))
            .collect();
        let snapshot = Arc::new(UniverseSnapshot::new(entries));

        let written = store.bulk_upsert_snapshot(snapshot, 3).await.unwrap();
        assert_eq!(written, 7);
        assert_eq!(store.quote_count().await.unwrap(), 7);

        let got = store
            .latest_quote("600003", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.price, 13.0);
        assert_eq!(got.pe, Some(12.0));
    }

    #[tokio::test]
    async fn test_instruments_roundtrip() {
        let (_dir, store) = create_test_store();
        let list = Arc::new(vec![
            InstrumentMeta::new("688981", "中芯国际").with_industry("半导体"),
            InstrumentMeta::new("000001", "平安银行"),
        ]);
        assert_eq!(store.upsert_instruments(list).await.unwrap(), 2);

        let loaded = store.load_instruments().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].code, "000001");
        assert_eq!(loaded[1].market, Market::Star);
        assert_eq!(loaded[1].industry.as_deref(), Some("半导体"));
    }
}
