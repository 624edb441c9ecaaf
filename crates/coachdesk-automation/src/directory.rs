//! Read access to the dashboard's rule, recipient, session and billing data.
//!
//! The engine only reads through these traits. `SqliteDirectory` serves them
//! from the dashboard database; every call is a fresh query, so rule edits
//! and deactivations are visible on the next sweep without cache invalidation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use coachdesk_core::error::{CoachDeskError, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::recipient::{Charge, Recipient, RecipientStatus, Session};
use crate::rules::{format_time, parse_time, AutomationRule, SendWindow, Trigger};

/// Rule definitions, owned by the management surface.
#[async_trait]
pub trait RuleDirectory: Send + Sync {
    async fn list_active_rules(&self) -> Result<Vec<AutomationRule>>;
    /// Look up a rule regardless of its active flag.
    async fn get_rule(&self, id: &str) -> Result<Option<AutomationRule>>;
}

/// Kind-specific recipient queries used by the evaluator.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn get_recipient(&self, id: &str) -> Result<Option<Recipient>>;
    /// Sessions with `from <= starts_at <= to`.
    async fn sessions_starting_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(Recipient, Session)>>;
    /// Unpaid charges with `from <= due_on <= to`; `None` means no lower bound.
    async fn unpaid_charges_due_between(
        &self,
        from: Option<NaiveDate>,
        to: NaiveDate,
    ) -> Result<Vec<(Recipient, Charge)>>;
    async fn recipients_with_birthday(&self, month: u32, day: u32) -> Result<Vec<Recipient>>;
    /// Recipients whose last activity (or join time, if none) is `<= cutoff`.
    async fn inactive_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Recipient>>;
    async fn joined_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Recipient>>;
    async fn all_recipients(&self) -> Result<Vec<Recipient>>;
}

/// Bulk import payload for seeding a database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    #[serde(default)]
    pub rules: Vec<AutomationRule>,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub charges: Vec<Charge>,
}

/// SQLite-backed directory over the dashboard tables.
pub struct SqliteDirectory {
    conn: Mutex<Connection>,
}

const RECIPIENT_COLUMNS: &str =
    "r.id, r.name, r.address, r.consent, r.status, r.timezone, r.birth_date, r.last_activity_at, r.joined_at";

impl SqliteDirectory {
    /// Open or create the dashboard database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| CoachDeskError::Directory(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| CoachDeskError::Directory(format!("DB open: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let dir = Self { conn: Mutex::new(conn) };
        dir.migrate()?;
        Ok(dir)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS automation_rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                trigger_config TEXT NOT NULL,    -- JSON, tagged by kind
                template TEXT NOT NULL,
                window_start TEXT NOT NULL,      -- HH:MM local
                window_end TEXT NOT NULL,
                max_per_day INTEGER NOT NULL DEFAULT 1,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recipients (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT NOT NULL,
                consent INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                timezone TEXT NOT NULL DEFAULT 'UTC',
                birth_date TEXT,                 -- YYYY-MM-DD
                last_activity_at TEXT,
                joined_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                recipient_id TEXT NOT NULL REFERENCES recipients(id),
                starts_at TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_starts_at ON sessions(starts_at);

            CREATE TABLE IF NOT EXISTS charges (
                id TEXT PRIMARY KEY,
                recipient_id TEXT NOT NULL REFERENCES recipients(id),
                due_on TEXT NOT NULL,            -- YYYY-MM-DD
                amount_cents INTEGER NOT NULL DEFAULT 0,
                paid INTEGER NOT NULL DEFAULT 0,
                description TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_charges_due_on ON charges(due_on);
            ",
        )
        .map_err(|e| CoachDeskError::Directory(format!("Migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| CoachDeskError::Directory(e.to_string()))
    }

    // ─── Writes (seeding / imports) ──────────────────────────

    pub fn upsert_rule(&self, rule: &AutomationRule) -> Result<()> {
        let trigger = serde_json::to_string(&rule.trigger)
            .map_err(|e| CoachDeskError::Directory(format!("Serialize trigger: {e}")))?;
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO automation_rules
                 (id, name, trigger_config, template, window_start, window_end, max_per_day, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    rule.id,
                    rule.name,
                    trigger,
                    rule.template,
                    format_time(rule.window.start()),
                    format_time(rule.window.end()),
                    rule.max_per_day,
                    rule.active as i32,
                    ts(rule.created_at),
                ],
            )
            .map_err(|e| CoachDeskError::Directory(format!("Save rule: {e}")))?;
        Ok(())
    }

    pub fn upsert_recipient(&self, r: &Recipient) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO recipients
                 (id, name, address, consent, status, timezone, birth_date, last_activity_at, joined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    r.id,
                    r.name,
                    r.address,
                    r.consent as i32,
                    r.status.as_str(),
                    r.timezone.name(),
                    r.birth_date.map(|d| d.to_string()),
                    r.last_activity_at.map(ts),
                    ts(r.joined_at),
                ],
            )
            .map_err(|e| CoachDeskError::Directory(format!("Save recipient: {e}")))?;
        Ok(())
    }

    pub fn upsert_session(&self, s: &Session) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO sessions (id, recipient_id, starts_at, title) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![s.id, s.recipient_id, ts(s.starts_at), s.title],
            )
            .map_err(|e| CoachDeskError::Directory(format!("Save session: {e}")))?;
        Ok(())
    }

    pub fn upsert_charge(&self, c: &Charge) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO charges (id, recipient_id, due_on, amount_cents, paid, description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    c.id,
                    c.recipient_id,
                    c.due_on.to_string(),
                    c.amount_cents,
                    c.paid as i32,
                    c.description,
                ],
            )
            .map_err(|e| CoachDeskError::Directory(format!("Save charge: {e}")))?;
        Ok(())
    }

    /// Import everything in a snapshot. Existing rows with the same id are replaced.
    pub fn import(&self, snapshot: &DirectorySnapshot) -> Result<()> {
        for rule in &snapshot.rules {
            rule.validate()?;
            self.upsert_rule(rule)?;
        }
        for r in &snapshot.recipients {
            self.upsert_recipient(r)?;
        }
        for s in &snapshot.sessions {
            self.upsert_session(s)?;
        }
        for c in &snapshot.charges {
            self.upsert_charge(c)?;
        }
        tracing::info!(
            "📥 Imported {} rules, {} recipients, {} sessions, {} charges",
            snapshot.rules.len(),
            snapshot.recipients.len(),
            snapshot.sessions.len(),
            snapshot.charges.len()
        );
        Ok(())
    }

    // ─── Reads ──────────────────────────────────────

    fn query_rules(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<AutomationRule>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| CoachDeskError::Directory(format!("Prepare rules: {e}")))?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, u32>(6)?,
                    row.get::<_, i32>(7)? != 0,
                    row.get::<_, String>(8)?,
                ))
            })
            .map_err(|e| CoachDeskError::Directory(format!("Query rules: {e}")))?;

        let mut rules = Vec::new();
        for row in rows {
            let (id, name, trigger, template, start, end, max_per_day, active, created_at) =
                row.map_err(|e| CoachDeskError::Directory(format!("Read rule: {e}")))?;
            let trigger: Trigger = match serde_json::from_str(&trigger) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!("⚠️ Rule '{id}' has an unreadable trigger, skipping: {e}");
                    continue;
                }
            };
            let window = match (parse_time(&start), parse_time(&end)) {
                (Ok(s), Ok(e)) => match SendWindow::new(s, e) {
                    Ok(w) => w,
                    Err(e) => {
                        tracing::warn!("⚠️ Rule '{id}' skipped: {e}");
                        continue;
                    }
                },
                _ => {
                    tracing::warn!("⚠️ Rule '{id}' has an unreadable send window, skipping");
                    continue;
                }
            };
            rules.push(AutomationRule {
                id,
                name,
                trigger,
                template,
                window,
                max_per_day,
                active,
                created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
            });
        }
        Ok(rules)
    }

    fn query_recipients(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Recipient>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| CoachDeskError::Directory(format!("Prepare recipients: {e}")))?;
        let rows = stmt
            .query_map(params, |row| recipient_from_row(row, 0))
            .map_err(|e| CoachDeskError::Directory(format!("Query recipients: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CoachDeskError::Directory(format!("Read recipient: {e}")))
    }
}

#[async_trait]
impl RuleDirectory for SqliteDirectory {
    async fn list_active_rules(&self) -> Result<Vec<AutomationRule>> {
        self.query_rules(
            "SELECT id, name, trigger_config, template, window_start, window_end, max_per_day, active, created_at
             FROM automation_rules WHERE active = 1 ORDER BY created_at",
            &[],
        )
    }

    async fn get_rule(&self, id: &str) -> Result<Option<AutomationRule>> {
        Ok(self
            .query_rules(
                "SELECT id, name, trigger_config, template, window_start, window_end, max_per_day, active, created_at
                 FROM automation_rules WHERE id = ?1",
                &[&id],
            )?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl RecipientDirectory for SqliteDirectory {
    async fn get_recipient(&self, id: &str) -> Result<Option<Recipient>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {RECIPIENT_COLUMNS} FROM recipients r WHERE r.id = ?1"),
            [id],
            |row| recipient_from_row(row, 0),
        )
        .optional()
        .map_err(|e| CoachDeskError::Directory(format!("Get recipient: {e}")))
    }

    async fn sessions_starting_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(Recipient, Session)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECIPIENT_COLUMNS}, s.id, s.starts_at, s.title
                 FROM sessions s JOIN recipients r ON r.id = s.recipient_id
                 WHERE s.starts_at >= ?1 AND s.starts_at <= ?2
                 ORDER BY s.starts_at"
            ))
            .map_err(|e| CoachDeskError::Directory(format!("Prepare sessions: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params![ts(from), ts(to)], |row| {
                let recipient = recipient_from_row(row, 0)?;
                let starts_at: String = row.get(10)?;
                let session = Session {
                    id: row.get(9)?,
                    recipient_id: recipient.id.clone(),
                    starts_at: parse_ts(&starts_at).unwrap_or(from),
                    title: row.get(11)?,
                };
                Ok((recipient, session))
            })
            .map_err(|e| CoachDeskError::Directory(format!("Query sessions: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CoachDeskError::Directory(format!("Read session: {e}")))
    }

    async fn unpaid_charges_due_between(
        &self,
        from: Option<NaiveDate>,
        to: NaiveDate,
    ) -> Result<Vec<(Recipient, Charge)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECIPIENT_COLUMNS}, c.id, c.due_on, c.amount_cents, c.description
                 FROM charges c JOIN recipients r ON r.id = c.recipient_id
                 WHERE c.paid = 0 AND c.due_on >= COALESCE(?1, '0000-01-01') AND c.due_on <= ?2
                 ORDER BY c.due_on, c.id"
            ))
            .map_err(|e| CoachDeskError::Directory(format!("Prepare charges: {e}")))?;
        let rows = stmt
            .query_map(rusqlite::params![from.map(|d| d.to_string()), to.to_string()], |row| {
                let recipient = recipient_from_row(row, 0)?;
                let due_on: String = row.get(10)?;
                let charge = Charge {
                    id: row.get(9)?,
                    recipient_id: recipient.id.clone(),
                    due_on: due_on.parse().unwrap_or(to),
                    amount_cents: row.get(11)?,
                    paid: false,
                    description: row.get(12)?,
                };
                Ok((recipient, charge))
            })
            .map_err(|e| CoachDeskError::Directory(format!("Query charges: {e}")))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CoachDeskError::Directory(format!("Read charge: {e}")))
    }

    async fn recipients_with_birthday(&self, month: u32, day: u32) -> Result<Vec<Recipient>> {
        self.query_recipients(
            &format!(
                "SELECT {RECIPIENT_COLUMNS} FROM recipients r
                 WHERE r.birth_date IS NOT NULL AND substr(r.birth_date, 6, 5) = ?1"
            ),
            &[&format!("{month:02}-{day:02}")],
        )
    }

    async fn inactive_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Recipient>> {
        self.query_recipients(
            &format!(
                "SELECT {RECIPIENT_COLUMNS} FROM recipients r
                 WHERE COALESCE(r.last_activity_at, r.joined_at) <= ?1"
            ),
            &[&ts(cutoff)],
        )
    }

    async fn joined_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Recipient>> {
        self.query_recipients(
            &format!(
                "SELECT {RECIPIENT_COLUMNS} FROM recipients r
                 WHERE r.joined_at >= ?1 AND r.joined_at <= ?2"
            ),
            &[&ts(from), &ts(to)],
        )
    }

    async fn all_recipients(&self) -> Result<Vec<Recipient>> {
        self.query_recipients(&format!("SELECT {RECIPIENT_COLUMNS} FROM recipients r ORDER BY r.id"), &[])
    }
}

fn recipient_from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Recipient> {
    let id: String = row.get(offset)?;
    let status: String = row.get(offset + 4)?;
    let timezone: String = row.get(offset + 5)?;
    let birth_date: Option<String> = row.get(offset + 6)?;
    let last_activity_at: Option<String> = row.get(offset + 7)?;
    let joined_at: String = row.get(offset + 8)?;

    let timezone = timezone.parse().unwrap_or_else(|_| {
        tracing::warn!("⚠️ Recipient '{id}' has unknown timezone '{timezone}', using UTC");
        chrono_tz::UTC
    });
    // Unknown statuses are treated as archived so they never get scheduled sends.
    let status = RecipientStatus::parse(&status).unwrap_or(RecipientStatus::Archived);

    Ok(Recipient {
        name: row.get(offset + 1)?,
        address: row.get(offset + 2)?,
        consent: row.get::<_, i32>(offset + 3)? != 0,
        status,
        timezone,
        birth_date: birth_date.and_then(|s| s.parse().ok()),
        last_activity_at: last_activity_at.as_deref().and_then(parse_ts),
        joined_at: parse_ts(&joined_at).unwrap_or_else(Utc::now),
        id,
    })
}

/// Fixed-width UTC timestamp so stored values sort lexicographically.
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
}
