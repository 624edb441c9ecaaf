//! Dispatch ledger: durable idempotency store for every attempted send.
//!
//! One row per attempt, keyed by (rule, recipient, occasion, local day).
//! A partial unique index allows at most one `reserved`/`sent` row per key;
//! `failed` rows are kept as audit history and never block a new occasion.
//! Reservation is the only synchronisation point between concurrent sweeps
//! and manual sends.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use coachdesk_core::error::{CoachDeskError, Result};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::directory::{parse_ts, ts};

/// Uniqueness tuple preventing duplicate sends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchKey {
    pub rule_id: String,
    pub recipient_id: String,
    pub occasion_key: String,
    /// Recipient-local calendar day of the dispatch.
    pub day: NaiveDate,
}

impl std::fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}@{}", self.rule_id, self.recipient_id, self.occasion_key, self.day)
    }
}

/// Record status: `reserved → sent | failed`, no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Reserved,
    Sent,
    Failed,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Reserved => "reserved",
            DispatchStatus::Sent => "sent",
            DispatchStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "sent" => DispatchStatus::Sent,
            "failed" => DispatchStatus::Failed,
            _ => DispatchStatus::Reserved,
        }
    }
}

/// A ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub id: i64,
    pub key: DispatchKey,
    pub status: DispatchStatus,
    /// Channel error detail for failed sends.
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Denial {
    /// A reserved or sent record already exists for this key.
    Duplicate,
    /// The recipient already reached the rule's daily cap.
    CapExceeded,
}

/// Result of `reserve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted(i64),
    Denied(Denial),
}

#[async_trait]
pub trait DispatchLedger: Send + Sync {
    /// Atomically check the daily cap and uniqueness for `key`, then insert a
    /// `reserved` record. Never fails for contention: losers get `Denied`.
    async fn reserve(&self, key: &DispatchKey, max_per_day: u32) -> Result<Reservation>;

    /// Move a reserved record to `sent` or `failed`.
    async fn finalize(&self, id: i64, status: DispatchStatus, detail: Option<String>) -> Result<()>;

    /// Reserved + sent records for (rule, recipient, day).
    async fn count_for_day(&self, rule_id: &str, recipient_id: &str, day: NaiveDate) -> Result<u32>;

    /// Reservations never finalized and older than `older_than`.
    async fn stale_reservations(&self, older_than: DateTime<Utc>) -> Result<Vec<DispatchRecord>>;

    /// Full audit history for (rule, recipient), oldest first.
    async fn records_for(&self, rule_id: &str, recipient_id: &str) -> Result<Vec<DispatchRecord>>;
}

/// SQLite ledger.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open or create the ledger tables in the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| CoachDeskError::Ledger(format!("DB open: {e}")))?;
        // Another process may hold the write lock during its reservation.
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| CoachDeskError::Ledger(format!("Busy timeout: {e}")))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| CoachDeskError::Ledger(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let ledger = Self { conn: Mutex::new(conn) };
        ledger.migrate()?;
        Ok(ledger)
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS dispatch_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                occasion_key TEXT NOT NULL,
                day TEXT NOT NULL,               -- recipient-local YYYY-MM-DD
                status TEXT NOT NULL DEFAULT 'reserved',  -- reserved, sent, failed
                detail TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- At most one live (reserved/sent) record per dispatch key.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_dispatch_live_key
                ON dispatch_records(rule_id, recipient_id, occasion_key, day)
                WHERE status IN ('reserved', 'sent');

            CREATE INDEX IF NOT EXISTS idx_dispatch_cap
                ON dispatch_records(rule_id, recipient_id, day, status);
         ",
            )
            .map_err(|e| CoachDeskError::Ledger(format!("Migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| CoachDeskError::Ledger(e.to_string()))
    }

    fn reserve_sync(&self, key: &DispatchKey, max_per_day: u32) -> Result<Reservation> {
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front so the count and the insert
        // see the same state, also across processes sharing the file.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| CoachDeskError::Ledger(format!("Begin reserve: {e}")))?;

        let day = key.day.to_string();
        let live: Option<i64> = tx
            .query_row(
                "SELECT id FROM dispatch_records
                 WHERE rule_id = ?1 AND recipient_id = ?2 AND occasion_key = ?3 AND day = ?4
                   AND status IN ('reserved', 'sent')",
                rusqlite::params![key.rule_id, key.recipient_id, key.occasion_key, day],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CoachDeskError::Ledger(format!("Check key: {e}")))?;
        if live.is_some() {
            return Ok(Reservation::Denied(Denial::Duplicate));
        }

        let used: u32 = tx
            .query_row(
                "SELECT COUNT(*) FROM dispatch_records
                 WHERE rule_id = ?1 AND recipient_id = ?2 AND day = ?3
                   AND status IN ('reserved', 'sent')",
                rusqlite::params![key.rule_id, key.recipient_id, day],
                |row| row.get(0),
            )
            .map_err(|e| CoachDeskError::Ledger(format!("Count cap: {e}")))?;
        if used >= max_per_day {
            return Ok(Reservation::Denied(Denial::CapExceeded));
        }

        let now = ts(Utc::now());
        let inserted = tx.execute(
            "INSERT INTO dispatch_records
             (rule_id, recipient_id, occasion_key, day, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'reserved', ?5, ?5)",
            rusqlite::params![key.rule_id, key.recipient_id, key.occasion_key, day, now],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Ok(Reservation::Denied(Denial::Duplicate));
            }
            Err(e) => return Err(CoachDeskError::Ledger(format!("Insert reservation: {e}"))),
        }
        let id = tx.last_insert_rowid();
        tx.commit().map_err(|e| CoachDeskError::Ledger(format!("Commit reserve: {e}")))?;
        Ok(Reservation::Granted(id))
    }

    fn query_records(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<DispatchRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| CoachDeskError::Ledger(format!("Prepare records: {e}")))?;
        let rows = stmt
            .query_map(params, |row| {
                let day: String = row.get(4)?;
                let status: String = row.get(5)?;
                let created_at: String = row.get(7)?;
                let updated_at: String = row.get(8)?;
                Ok(DispatchRecord {
                    id: row.get(0)?,
                    key: DispatchKey {
                        rule_id: row.get(1)?,
                        recipient_id: row.get(2)?,
                        occasion_key: row.get(3)?,
                        day: day.parse().unwrap_or_default(),
                    },
                    status: DispatchStatus::parse(&status),
                    detail: row.get(6)?,
                    created_at: parse_ts(&created_at).unwrap_or_default(),
                    updated_at: parse_ts(&updated_at).unwrap_or_default(),
                })
            })
            .map_err(|e| CoachDeskError::Ledger(format!("Query records: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CoachDeskError::Ledger(format!("Read record: {e}")))
    }
}

const RECORD_COLUMNS: &str =
    "id, rule_id, recipient_id, occasion_key, day, status, detail, created_at, updated_at";

#[async_trait]
impl DispatchLedger for SqliteLedger {
    async fn reserve(&self, key: &DispatchKey, max_per_day: u32) -> Result<Reservation> {
        self.reserve_sync(key, max_per_day)
    }

    async fn finalize(&self, id: i64, status: DispatchStatus, detail: Option<String>) -> Result<()> {
        if status == DispatchStatus::Reserved {
            return Err(CoachDeskError::Ledger("cannot finalize a record back to reserved".into()));
        }
        let changed = self
            .lock()?
            .execute(
                "UPDATE dispatch_records SET status = ?1, detail = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'reserved'",
                rusqlite::params![status.as_str(), detail, ts(Utc::now()), id],
            )
            .map_err(|e| CoachDeskError::Ledger(format!("Finalize: {e}")))?;
        if changed == 0 {
            return Err(CoachDeskError::Ledger(format!("record {id} is not reserved")));
        }
        Ok(())
    }

    async fn count_for_day(&self, rule_id: &str, recipient_id: &str, day: NaiveDate) -> Result<u32> {
        self.lock()?
            .query_row(
                "SELECT COUNT(*) FROM dispatch_records
                 WHERE rule_id = ?1 AND recipient_id = ?2 AND day = ?3
                   AND status IN ('reserved', 'sent')",
                rusqlite::params![rule_id, recipient_id, day.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| CoachDeskError::Ledger(format!("Count: {e}")))
    }

    async fn stale_reservations(&self, older_than: DateTime<Utc>) -> Result<Vec<DispatchRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM dispatch_records
                 WHERE status = 'reserved' AND created_at < ?1 ORDER BY id"
            ),
            &[&ts(older_than)],
        )
    }

    async fn records_for(&self, rule_id: &str, recipient_id: &str) -> Result<Vec<DispatchRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM dispatch_records
                 WHERE rule_id = ?1 AND recipient_id = ?2 ORDER BY id"
            ),
            &[&rule_id, &recipient_id],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(occasion: &str, day: u32) -> DispatchKey {
        DispatchKey {
            rule_id: "r1".into(),
            recipient_id: "c1".into(),
            occasion_key: occasion.into(),
            day: NaiveDate::from_ymd_opt(2026, 6, day).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_reserve_then_duplicate() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let k = key("session:1", 1);
        let Reservation::Granted(id) = ledger.reserve(&k, 5).await.unwrap() else {
            panic!("first reservation must be granted");
        };
        assert_eq!(ledger.reserve(&k, 5).await.unwrap(), Reservation::Denied(Denial::Duplicate));

        ledger.finalize(id, DispatchStatus::Sent, None).await.unwrap();
        assert_eq!(ledger.reserve(&k, 5).await.unwrap(), Reservation::Denied(Denial::Duplicate));
    }

    #[tokio::test]
    async fn test_cap_counts_reserved_and_sent_only() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let Reservation::Granted(a) = ledger.reserve(&key("charge:1", 1), 2).await.unwrap() else {
            panic!("expected grant");
        };
        ledger.finalize(a, DispatchStatus::Failed, Some("timeout".into())).await.unwrap();

        // A failed attempt does not consume the cap.
        assert!(matches!(ledger.reserve(&key("charge:2", 1), 2).await.unwrap(), Reservation::Granted(_)));
        assert!(matches!(ledger.reserve(&key("charge:3", 1), 2).await.unwrap(), Reservation::Granted(_)));
        assert_eq!(
            ledger.reserve(&key("charge:4", 1), 2).await.unwrap(),
            Reservation::Denied(Denial::CapExceeded)
        );
        // Next day starts fresh.
        assert!(matches!(ledger.reserve(&key("charge:4", 2), 2).await.unwrap(), Reservation::Granted(_)));

        let day = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        assert_eq!(ledger.count_for_day("r1", "c1", day).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_key_can_be_reserved_again() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let k = key("manual:abc", 1);
        let Reservation::Granted(id) = ledger.reserve(&k, 3).await.unwrap() else {
            panic!("expected grant");
        };
        ledger.finalize(id, DispatchStatus::Failed, Some("503".into())).await.unwrap();
        assert!(matches!(ledger.reserve(&k, 3).await.unwrap(), Reservation::Granted(_)));

        let history = ledger.records_for("r1", "c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, DispatchStatus::Failed);
        assert_eq!(history[0].detail.as_deref(), Some("503"));
        assert_eq!(history[1].status, DispatchStatus::Reserved);
    }

    #[tokio::test]
    async fn test_finalize_only_from_reserved() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let Reservation::Granted(id) = ledger.reserve(&key("welcome", 1), 1).await.unwrap() else {
            panic!("expected grant");
        };
        ledger.finalize(id, DispatchStatus::Sent, None).await.unwrap();
        assert!(ledger.finalize(id, DispatchStatus::Failed, None).await.is_err());
        assert!(ledger.finalize(id, DispatchStatus::Reserved, None).await.is_err());
        assert!(ledger.finalize(9999, DispatchStatus::Sent, None).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_reservations_grant_once() {
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.reserve(&key("session:7", 1), 10).await.unwrap() }));
        }
        let mut granted = 0;
        for h in handles {
            if matches!(h.await.unwrap(), Reservation::Granted(_)) {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn test_stale_reservations_reported() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let Reservation::Granted(done) = ledger.reserve(&key("session:1", 1), 5).await.unwrap() else {
            panic!("expected grant");
        };
        ledger.finalize(done, DispatchStatus::Sent, None).await.unwrap();
        ledger.reserve(&key("session:2", 1), 5).await.unwrap();

        let future = Utc::now() + chrono::Duration::minutes(1);
        let stale = ledger.stale_reservations(future).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].key.occasion_key, "session:2");

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(ledger.stale_reservations(past).await.unwrap().is_empty());
    }

    #[test]
    fn test_file_backed_ledger_shares_constraint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let a = SqliteLedger::open(&path).unwrap();
        let b = SqliteLedger::open(&path).unwrap();
        let k = key("birthday:2026-06-01", 1);
        assert!(matches!(a.reserve_sync(&k, 1).unwrap(), Reservation::Granted(_)));
        assert_eq!(b.reserve_sync(&k, 1).unwrap(), Reservation::Denied(Denial::Duplicate));
    }
}
