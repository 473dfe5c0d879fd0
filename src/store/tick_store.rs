//! Durable Tick Store
//!
//! Append-only SQLite table of observations keyed by (instrument_id, ts).
//! WAL mode so the single writer never blocks concurrent readers; the
//! composite index makes both "latest row per key in a range" and
//! "ordered series for one key" direct index scans.

use crate::models::Tick;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OpenFlags};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Bounded wait for a contended write lock before the write is dropped.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

const SCHEMA_SQL: &str = r#"
-- WAL for concurrent reads during writes
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS ticks (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    instrument_id TEXT NOT NULL,
    ts            INTEGER NOT NULL,   -- microseconds since Unix epoch
    last_price    REAL,
    prev_close    REAL,
    open_interest REAL,
    implied_vol   REAL,
    delta         REAL,
    gamma         REAL,
    vega          REAL,
    theta         REAL
);

-- Serves both query patterns: latest-per-key in a range and ordered range scan
CREATE INDEX IF NOT EXISTS idx_ticks_instrument_ts
    ON ticks(instrument_id, ts);
"#;

/// Write-side failures. Transient contention is dropped by policy, never
/// propagated to the ingestion loop.
#[derive(Debug)]
pub enum StorageError {
    /// Lock not acquired within the bounded busy timeout.
    Contended,
    Sqlite(rusqlite::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contended => write!(f, "write contended beyond busy timeout"),
            Self::Sqlite(e) => write!(f, "sqlite error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => Self::Contended,
            _ => Self::Sqlite(e),
        }
    }
}

/// Shared handle to the tick database. One writer (the ingestion pipeline via
/// the async writer), many concurrent readers (query engines).
pub struct TickStore {
    conn: Arc<Mutex<Connection>>,
}

impl TickStore {
    /// Open or create the store at `db_path`.
    pub fn open(db_path: &str) -> Result<Self> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create data dir for {}", db_path))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        Self::init(conn, db_path)
    }

    /// In-memory store (for testing).
    pub fn open_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, ":memory:")
    }

    fn init(conn: Connection, db_path: &str) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize tick schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if db_path != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM ticks", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📊 Tick store opened at {} ({} existing rows)", db_path, count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append one observation. Atomic: readers see the whole row or nothing.
    pub fn append(&self, tick: &Tick) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO ticks
             (instrument_id, ts, last_price, prev_close, open_interest, implied_vol,
              delta, gamma, vega, theta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        stmt.execute(params![
            tick.instrument_id,
            tick.ts,
            tick.last_price,
            tick.prev_close,
            tick.open_interest,
            tick.implied_vol,
            tick.delta,
            tick.gamma,
            tick.vega,
            tick.theta,
        ])?;
        Ok(())
    }

    /// Append a batch inside a single transaction.
    pub fn append_batch(&self, ticks: &[Tick]) -> Result<usize, StorageError> {
        if ticks.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<usize, StorageError> {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO ticks
                 (instrument_id, ts, last_price, prev_close, open_interest, implied_vol,
                  delta, gamma, vega, theta)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            let mut inserted = 0usize;
            for tick in ticks {
                stmt.execute(params![
                    tick.instrument_id,
                    tick.ts,
                    tick.last_price,
                    tick.prev_close,
                    tick.open_interest,
                    tick.implied_vol,
                    tick.delta,
                    tick.gamma,
                    tick.vega,
                    tick.theta,
                ])?;
                inserted += 1;
            }
            Ok(inserted)
        })();

        match result {
            Ok(n) => {
                conn.execute("COMMIT", [])?;
                Ok(n)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Latest row per instrument within inclusive [start_us, end_us], as one
    /// bulk statement over the (instrument_id, ts) index. Instruments with no
    /// row in the window are simply missing from the result.
    pub fn latest_in_window(
        &self,
        instrument_ids: &[String],
        start_us: i64,
        end_us: i64,
    ) -> Result<Vec<Tick>, StorageError> {
        if instrument_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; instrument_ids.len()].join(", ");
        let sql = format!(
            "SELECT t.instrument_id, t.ts, t.last_price, t.prev_close, t.open_interest,
                    t.implied_vol, t.delta, t.gamma, t.vega, t.theta
             FROM ticks t
             JOIN (SELECT instrument_id, MAX(ts) AS max_ts
                   FROM ticks
                   WHERE instrument_id IN ({placeholders})
                     AND ts BETWEEN ?{a} AND ?{b}
                   GROUP BY instrument_id) m
               ON t.instrument_id = m.instrument_id AND t.ts = m.max_ts",
            placeholders = placeholders,
            a = instrument_ids.len() + 1,
            b = instrument_ids.len() + 2,
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;

        let params_iter = instrument_ids
            .iter()
            .map(|id| rusqlite::types::Value::from(id.clone()))
            .chain([
                rusqlite::types::Value::from(start_us),
                rusqlite::types::Value::from(end_us),
            ]);

        let ticks = stmt
            .query_map(params_from_iter(params_iter), Self::row_to_tick)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ticks)
    }

    /// Ordered (ts, value) series of one column for one instrument within the
    /// inclusive window. `column` must come from `FieldName::column()`; it is
    /// never caller-supplied text.
    pub fn series_in_window(
        &self,
        instrument_id: &str,
        column: &'static str,
        start_us: i64,
        end_us: i64,
    ) -> Result<Vec<(i64, f64)>, StorageError> {
        let sql = format!(
            "SELECT ts, {column} FROM ticks
             WHERE instrument_id = ?1 AND ts BETWEEN ?2 AND ?3
             ORDER BY ts ASC",
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let points = stmt
            .query_map(params![instrument_id, start_us, end_us], |row| {
                let ts: i64 = row.get(0)?;
                let value: Option<f64> = row.get(1)?;
                Ok((ts, value.unwrap_or(0.0)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(points)
    }

    /// Ordered (ts, last_price, prev_close) rows for the derived
    /// percentage-change series.
    pub fn ltpc_in_window(
        &self,
        instrument_id: &str,
        start_us: i64,
        end_us: i64,
    ) -> Result<Vec<(i64, f64, f64)>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ts, last_price, prev_close FROM ticks
             WHERE instrument_id = ?1 AND ts BETWEEN ?2 AND ?3
             ORDER BY ts ASC",
        )?;
        let rows = stmt
            .query_map(params![instrument_id, start_us, end_us], |row| {
                let ts: i64 = row.get(0)?;
                let ltp: Option<f64> = row.get(1)?;
                let cp: Option<f64> = row.get(2)?;
                Ok((ts, ltp.unwrap_or(0.0), cp.unwrap_or(0.0)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Total row count (diagnostics).
    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM ticks", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct instrument ids present in the store (diagnostics).
    pub fn instrument_ids(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT DISTINCT instrument_id FROM ticks ORDER BY instrument_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn row_to_tick(row: &rusqlite::Row) -> rusqlite::Result<Tick> {
        Ok(Tick {
            instrument_id: row.get(0)?,
            ts: row.get(1)?,
            last_price: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
            prev_close: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
            open_interest: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
            implied_vol: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
            delta: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
            gamma: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
            vega: row.get::<_, Option<f64>>(8)?.unwrap_or(0.0),
            theta: row.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(id: &str, ts: i64, ltp: f64) -> Tick {
        Tick {
            instrument_id: id.to_string(),
            ts,
            last_price: ltp,
            prev_close: 95.0,
            open_interest: 1000.0,
            implied_vol: 0.2,
            delta: 0.5,
            gamma: 0.01,
            vega: 7.0,
            theta: -3.0,
        }
    }

    #[test]
    fn test_append_and_count() {
        let store = TickStore::open_memory().unwrap();
        assert!(store.is_empty());
        store.append(&tick("X", 1_000_000, 100.0)).unwrap();
        store.append(&tick("X", 2_000_000, 101.0)).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_append_batch_transactional() {
        let store = TickStore::open_memory().unwrap();
        let batch: Vec<Tick> = (0..50).map(|i| tick("Y", i * 1_000, 100.0 + i as f64)).collect();
        assert_eq!(store.append_batch(&batch).unwrap(), 50);
        assert_eq!(store.len(), 50);
    }

    #[test]
    fn test_latest_in_window_picks_max_ts() {
        let store = TickStore::open_memory().unwrap();
        store.append(&tick("X", 100, 100.0)).unwrap();
        store.append(&tick("X", 300, 102.0)).unwrap();
        store.append(&tick("X", 200, 101.0)).unwrap();
        store.append(&tick("Y", 150, 50.0)).unwrap();

        let rows = store
            .latest_in_window(&["X".to_string(), "Y".to_string()], 0, 1_000)
            .unwrap();
        assert_eq!(rows.len(), 2);
        let x = rows.iter().find(|t| t.instrument_id == "X").unwrap();
        assert_eq!(x.ts, 300);
        assert_eq!(x.last_price, 102.0);
    }

    #[test]
    fn test_latest_in_window_respects_bounds() {
        let store = TickStore::open_memory().unwrap();
        store.append(&tick("X", 100, 100.0)).unwrap();
        store.append(&tick("X", 900, 105.0)).unwrap();

        let rows = store
            .latest_in_window(&["X".to_string()], 0, 500)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ts, 100);
    }

    #[test]
    fn test_latest_in_window_omits_absent_instruments() {
        let store = TickStore::open_memory().unwrap();
        store.append(&tick("X", 100, 100.0)).unwrap();

        let rows = store
            .latest_in_window(&["X".to_string(), "MISSING".to_string()], 0, 1_000)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].instrument_id, "X");
    }

    #[test]
    fn test_series_ordered_and_bounded() {
        let store = TickStore::open_memory().unwrap();
        store.append(&tick("X", 300, 102.0)).unwrap();
        store.append(&tick("X", 100, 100.0)).unwrap();
        store.append(&tick("X", 200, 101.0)).unwrap();
        store.append(&tick("X", 900, 110.0)).unwrap();

        let series = store.series_in_window("X", "last_price", 100, 300).unwrap();
        assert_eq!(series, vec![(100, 100.0), (200, 101.0), (300, 102.0)]);
    }

    #[test]
    fn test_series_empty_for_unknown_instrument() {
        let store = TickStore::open_memory().unwrap();
        let series = store.series_in_window("NOPE", "last_price", 0, 1_000).unwrap();
        assert!(series.is_empty());
    }
}
