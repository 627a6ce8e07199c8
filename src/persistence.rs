//! C8 — durable storage for completed analyses. A `parking_lot`-guarded
//! `rusqlite::Connection`, WAL pragmas applied once at open, and an
//! insert-or-update per call rather than a connection pool. Schema is a
//! `tokens` table plus per-stage append-only snapshot tables; nothing here
//! is queried by free text, so no search index is carried.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::warn;

use crate::domain::CombinedAnalysis;
use crate::error::CoreError;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS tokens (
    address TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    name TEXT NOT NULL,
    first_seen_at INTEGER NOT NULL,
    last_analyzed_at INTEGER NOT NULL,
    last_score REAL NOT NULL,
    last_passed INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS price_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT NOT NULL REFERENCES tokens(address),
    recorded_at INTEGER NOT NULL,
    price REAL NOT NULL,
    market_cap REAL NOT NULL,
    volume_24h REAL NOT NULL,
    liquidity REAL NOT NULL,
    age_hours REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_price_snapshots_address_recorded
    ON price_snapshots(address, recorded_at DESC);

CREATE TABLE IF NOT EXISTS safety_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT NOT NULL REFERENCES tokens(address),
    recorded_at INTEGER NOT NULL,
    safety_score REAL NOT NULL,
    honeypot_risk INTEGER NOT NULL,
    mint_authority INTEGER NOT NULL,
    freeze_authority INTEGER NOT NULL,
    liquidity_locked INTEGER NOT NULL,
    holder_concentration REAL NOT NULL,
    overall_score REAL NOT NULL,
    failed_filters TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_safety_snapshots_address_recorded
    ON safety_snapshots(address, recorded_at DESC);
"#;

/// Storage boundary the aggregator writes through. A failing implementation
/// must never block `Hub` publication — callers log and continue, they do
/// not retry or queue.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    async fn record_analysis(&self, analysis: &CombinedAnalysis) -> Result<(), CoreError>;
}

pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
    pub fn open(db_path: &str) -> Result<Self, CoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .map_err(|e| CoreError::Persistence(format!("open {db_path}: {e}")))?;

        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| CoreError::Persistence(format!("schema init: {e}")))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!(journal_mode, "sqlite WAL mode not active");
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn write(conn: &Connection, analysis: &CombinedAnalysis) -> rusqlite::Result<()> {
        let address = analysis.address.as_str();
        let now = analysis.timestamp.timestamp();

        conn.execute(
            "INSERT INTO tokens (address, symbol, name, first_seen_at, last_analyzed_at, last_score, last_passed)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6)
             ON CONFLICT(address) DO UPDATE SET
                symbol = excluded.symbol,
                name = excluded.name,
                last_analyzed_at = excluded.last_analyzed_at,
                last_score = excluded.last_score,
                last_passed = excluded.last_passed",
            params![
                address,
                analysis.market.symbol,
                analysis.market.name,
                now,
                analysis.overall_score,
                analysis.passed as i64,
            ],
        )?;

        conn.execute(
            "INSERT INTO price_snapshots (address, recorded_at, price, market_cap, volume_24h, liquidity, age_hours)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                address,
                now,
                analysis.market.price,
                analysis.market.market_cap,
                analysis.market.volume_24h,
                analysis.market.liquidity,
                analysis.market.age_hours,
            ],
        )?;

        let failed_filters = analysis.failed_filters.join("; ");
        conn.execute(
            "INSERT INTO safety_snapshots (
                address, recorded_at, safety_score, honeypot_risk, mint_authority,
                freeze_authority, liquidity_locked, holder_concentration, overall_score, failed_filters
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                address,
                now,
                analysis.security.safety_score,
                analysis.security.honeypot_risk as i64,
                analysis.security.mint_authority as i64,
                analysis.security.freeze_authority as i64,
                analysis.security.liquidity_locked as i64,
                analysis.security.holder_concentration,
                analysis.overall_score,
                failed_filters,
            ],
        )?;

        Ok(())
    }
}

#[async_trait]
impl PersistencePort for SqlitePersistence {
    async fn record_analysis(&self, analysis: &CombinedAnalysis) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])
            .map_err(|e| CoreError::Persistence(e.to_string()))?;

        match Self::write(&conn, analysis) {
            Ok(()) => conn
                .execute("COMMIT", [])
                .map(|_| ())
                .map_err(|e| CoreError::Persistence(e.to_string())),
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(CoreError::Persistence(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ChainReport, CombinedAnalysis, MarketSnapshot, RouterReport, SecurityReport, TokenAddress,
    };
    use chrono::Utc;

    fn sample(address: &TokenAddress) -> CombinedAnalysis {
        CombinedAnalysis {
            address: address.clone(),
            market: MarketSnapshot {
                address: address.clone(),
                symbol: "TOK".into(),
                name: "Token".into(),
                launch_timestamp: Utc::now(),
                price: 1.0,
                market_cap: 100.0,
                volume_24h: 10_000.0,
                liquidity: 20_000.0,
                age_hours: 5.0,
                filtered: false,
                filter_reason: None,
            },
            security: SecurityReport {
                address: address.clone(),
                honeypot_risk: false,
                mint_authority: false,
                freeze_authority: false,
                liquidity_locked: true,
                holder_concentration: 12.0,
                safety_score: 8.0,
                risks: Vec::new(),
                warnings: Vec::new(),
                filtered: false,
                filter_reason: None,
            },
            router: RouterReport {
                address: address.clone(),
                routing_available: true,
                slippage_estimate: 1.0,
                spread: 0.5,
                volume_24h: 10_000.0,
                blacklisted: false,
                route_count: 2,
                filtered: false,
                filter_reason: None,
            },
            chain: ChainReport::skipped(address, "unused"),
            overall_score: 88.0,
            passed: true,
            failed_filters: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn record_analysis_is_queryable_afterward() {
        let dir = std::env::temp_dir().join(format!("tokenwatch-test-{}", uuid::Uuid::new_v4()));
        let db_path = dir.to_string_lossy().to_string();
        let store = SqlitePersistence::open(&db_path).unwrap();

        let address = TokenAddress::new("0xabc").unwrap();
        store.record_analysis(&sample(&address)).await.unwrap();

        let conn = store.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tokens WHERE address = ?1", params![address.as_str()], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let price_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM price_snapshots WHERE address = ?1", params![address.as_str()], |r| r.get(0))
            .unwrap();
        assert_eq!(price_rows, 1);

        drop(conn);
        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn second_analysis_updates_token_row_but_appends_snapshots() {
        let dir = std::env::temp_dir().join(format!("tokenwatch-test-{}", uuid::Uuid::new_v4()));
        let db_path = dir.to_string_lossy().to_string();
        let store = SqlitePersistence::open(&db_path).unwrap();

        let address = TokenAddress::new("0xdef").unwrap();
        store.record_analysis(&sample(&address)).await.unwrap();
        store.record_analysis(&sample(&address)).await.unwrap();

        let conn = store.conn.lock();
        let token_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM tokens WHERE address = ?1", params![address.as_str()], |r| r.get(0))
            .unwrap();
        assert_eq!(token_rows, 1);

        let snapshot_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM price_snapshots WHERE address = ?1", params![address.as_str()], |r| r.get(0))
            .unwrap();
        assert_eq!(snapshot_rows, 2);

        drop(conn);
        let _ = std::fs::remove_file(&db_path);
    }
}
