//! SQLite-backed persistence for the study plan and the reminder log.
//! The plan is written as a whole snapshot; the reminder log only grows, so
//! a restart never re-sends a reminder that already went out. Dismissals and
//! snoozes are kept next to it so they outlive a restart too.

use std::path::Path;

use ally_core::error::{AllyError, Result};
use ally_core::types::{AvailabilitySlot, ReminderEvent, ReminderKey, Session, Topic};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::store::PlanSnapshot;

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> AllyError + '_ {
    move |e| AllyError::Storage(format!("{context}: {e}"))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AllyError::Storage(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_opt_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_time).transpose()
}

/// Unit-like enums are stored by their serde name ("planned", "active").
fn enum_to_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        Ok(other) => Err(AllyError::Storage(format!("not a unit enum: {other}"))),
        Err(e) => Err(AllyError::Storage(e.to_string())),
    }
}

fn enum_from_text<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| AllyError::Storage(format!("bad value {raw:?}: {e}")))
}

fn key_to_text(key: &ReminderKey) -> Result<String> {
    serde_json::to_string(key).map_err(|e| AllyError::Storage(e.to_string()))
}

type TopicRow = (
    String,
    String,
    String,
    i64,
    i64,
    f64,
    Option<String>,
    Option<i64>,
    String,
    i64,
    String,
);

/// Dismissed and snoozed reminders, by logical key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReminderOverrides {
    pub dismissed: Vec<ReminderKey>,
    pub snoozed: Vec<(ReminderKey, DateTime<Utc>)>,
}

/// SQLite store for plan snapshots.
pub struct PlanDb {
    conn: rusqlite::Connection,
}

impl PlanDb {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path).map_err(db_err("DB open"))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(db_err("DB open"))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS topics (
                id TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                effort_minutes INTEGER NOT NULL,
                remaining_minutes INTEGER NOT NULL,
                weight REAL NOT NULL DEFAULT 1.0,
                deadline TEXT,
                chunk_minutes INTEGER,
                created_at TEXT NOT NULL,
                seq INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active'
            );

            CREATE TABLE IF NOT EXISTS slots (
                id TEXT PRIMARY KEY,
                start_at TEXT NOT NULL,
                end_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                topic_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                start_at TEXT NOT NULL,
                end_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'planned'
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_start ON sessions(start_at);

            -- version, horizon_end, at_risk (JSON array)
            CREATE TABLE IF NOT EXISTS plan_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Reminders that went out. Keyed by logical occurrence.
            CREATE TABLE IF NOT EXISTS reminder_log (
                reminder_key TEXT PRIMARY KEY,   -- JSON ReminderKey
                event_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                subject TEXT NOT NULL,
                scheduled_time TEXT NOT NULL,
                fired_at TEXT NOT NULL
            );

            -- User overrides on reminders that have not fired yet.
            CREATE TABLE IF NOT EXISTS reminder_overrides (
                reminder_key TEXT PRIMARY KEY,   -- JSON ReminderKey
                dismissed INTEGER NOT NULL DEFAULT 0,
                snoozed_until TEXT,
                updated_at TEXT NOT NULL
            );
         ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    // ─── Plan ─────────────────────────────────────────────────

    /// Replace the stored plan with `plan` in one transaction.
    pub fn save_snapshot(&mut self, plan: &PlanSnapshot) -> Result<()> {
        let tx = self.conn.transaction().map_err(db_err("Begin"))?;
        tx.execute_batch(
            "DELETE FROM topics; DELETE FROM slots; DELETE FROM sessions; DELETE FROM plan_meta;",
        )
        .map_err(db_err("Clear plan"))?;

        for topic in &plan.topics {
            tx.execute(
                "INSERT INTO topics
                 (id, subject, title, effort_minutes, remaining_minutes, weight, deadline,
                  chunk_minutes, created_at, seq, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    topic.id,
                    topic.subject,
                    topic.title,
                    topic.effort_minutes,
                    topic.remaining_minutes,
                    topic.weight,
                    topic.deadline.map(|t| t.to_rfc3339()),
                    topic.chunk_minutes,
                    topic.created_at.to_rfc3339(),
                    topic.seq as i64,
                    enum_to_text(&topic.status)?,
                ],
            )
            .map_err(db_err("Save topic"))?;
        }

        for slot in &plan.slots {
            tx.execute(
                "INSERT INTO slots (id, start_at, end_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![slot.id, slot.start.to_rfc3339(), slot.end.to_rfc3339()],
            )
            .map_err(db_err("Save slot"))?;
        }

        for session in &plan.sessions {
            tx.execute(
                "INSERT INTO sessions (id, topic_id, subject, chunk_index, start_at, end_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    session.id,
                    session.topic_id,
                    session.subject,
                    session.chunk_index,
                    session.start.to_rfc3339(),
                    session.end.to_rfc3339(),
                    enum_to_text(&session.status)?,
                ],
            )
            .map_err(db_err("Save session"))?;
        }

        let at_risk = serde_json::to_string(&plan.at_risk)
            .map_err(|e| AllyError::Storage(e.to_string()))?;
        let mut meta = vec![("version", plan.version.to_string()), ("at_risk", at_risk)];
        if let Some(end) = plan.horizon_end {
            meta.push(("horizon_end", end.to_rfc3339()));
        }
        for (key, value) in meta {
            tx.execute(
                "INSERT INTO plan_meta (key, value) VALUES (?1, ?2)",
                rusqlite::params![key, value],
            )
            .map_err(db_err("Save meta"))?;
        }

        tx.commit().map_err(db_err("Commit"))?;
        tracing::debug!(
            "💾 Plan v{} saved: {} topics, {} sessions",
            plan.version,
            plan.topics.len(),
            plan.sessions.len()
        );
        Ok(())
    }

    /// Load the stored plan. `None` if nothing was ever saved.
    pub fn load_snapshot(&self) -> Result<Option<PlanSnapshot>> {
        let meta = self.load_meta()?;
        let Some(version) = meta.iter().find(|(k, _)| k == "version").map(|(_, v)| v) else {
            return Ok(None);
        };
        let version: u64 = version
            .parse()
            .map_err(|e| AllyError::Storage(format!("bad version {version:?}: {e}")))?;
        let meta_value = |key: &str| meta.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
        let horizon_end = parse_opt_time(meta_value("horizon_end"))?;
        let at_risk = match meta_value("at_risk") {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| AllyError::Storage(e.to_string()))?
            }
            None => Default::default(),
        };

        Ok(Some(PlanSnapshot {
            topics: self.load_topics()?,
            slots: self.load_slots()?,
            sessions: self.load_sessions()?,
            at_risk,
            horizon_end,
            version,
        }))
    }

    fn load_meta(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM plan_meta")
            .map_err(db_err("Load meta"))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err("Load meta"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err("Load meta"))
    }

    fn load_topics(&self) -> Result<Vec<Topic>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, subject, title, effort_minutes, remaining_minutes, weight, deadline,
                        chunk_minutes, created_at, seq, status
                 FROM topics ORDER BY seq",
            )
            .map_err(db_err("Load topics"))?;
        let rows: Vec<TopicRow> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                ))
            })
            .map_err(db_err("Load topics"))?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err("Load topics"))?;

        rows.into_iter()
            .map(
                |(
                    id,
                    subject,
                    title,
                    effort,
                    remaining,
                    weight,
                    deadline,
                    chunk,
                    created_at,
                    seq,
                    status,
                )| {
                    Ok(Topic {
                        id,
                        subject,
                        title,
                        effort_minutes: effort,
                        remaining_minutes: remaining,
                        weight,
                        deadline: parse_opt_time(deadline)?,
                        chunk_minutes: chunk,
                        created_at: parse_time(&created_at)?,
                        seq: seq as u64,
                        status: enum_from_text(&status)?,
                    })
                },
            )
            .collect()
    }

    fn load_slots(&self) -> Result<Vec<AvailabilitySlot>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, start_at, end_at FROM slots ORDER BY start_at")
            .map_err(db_err("Load slots"))?;
        let rows: Vec<(String, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(db_err("Load slots"))?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err("Load slots"))?;

        rows.into_iter()
            .map(|(id, start, end)| {
                Ok(AvailabilitySlot {
                    id,
                    start: parse_time(&start)?,
                    end: parse_time(&end)?,
                })
            })
            .collect()
    }

    fn load_sessions(&self) -> Result<Vec<Session>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, topic_id, subject, chunk_index, start_at, end_at, status
                 FROM sessions ORDER BY start_at",
            )
            .map_err(db_err("Load sessions"))?;
        let rows: Vec<(String, String, String, u32, String, String, String)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })
            .map_err(db_err("Load sessions"))?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err("Load sessions"))?;

        rows.into_iter()
            .map(|(id, topic_id, subject, chunk_index, start, end, status)| {
                Ok(Session {
                    id,
                    topic_id,
                    subject,
                    chunk_index,
                    start: parse_time(&start)?,
                    end: parse_time(&end)?,
                    status: enum_from_text(&status)?,
                })
            })
            .collect()
    }

    // ─── Reminder log ─────────────────────────────────────────

    /// Remember that `event` went out. Idempotent per logical key.
    pub fn record_fired(&self, event: &ReminderEvent, fired_at: DateTime<Utc>) -> Result<()> {
        let key = key_to_text(&event.key)?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO reminder_log
                 (reminder_key, event_id, kind, subject, scheduled_time, fired_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    key,
                    event.id,
                    event.kind().to_string(),
                    event.subject_name,
                    event.scheduled_time.to_rfc3339(),
                    fired_at.to_rfc3339(),
                ],
            )
            .map_err(db_err("Record reminder"))?;
        Ok(())
    }

    /// Keys of every reminder that already went out.
    pub fn load_fired_keys(&self) -> Result<Vec<ReminderKey>> {
        let mut stmt = self
            .conn
            .prepare("SELECT reminder_key FROM reminder_log ORDER BY fired_at")
            .map_err(db_err("Load reminders"))?;
        let raw: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_err("Load reminders"))?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err("Load reminders"))?;

        let mut keys = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_str(&entry) {
                Ok(key) => keys.push(key),
                Err(e) => tracing::warn!("⚠️ Skipping unreadable reminder key {entry:?}: {e}"),
            }
        }
        Ok(keys)
    }

    /// Remember that the user dismissed `key`. Clears any snooze.
    pub fn record_dismissed(&self, key: &ReminderKey, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO reminder_overrides (reminder_key, dismissed, snoozed_until, updated_at)
                 VALUES (?1, 1, NULL, ?2)
                 ON CONFLICT(reminder_key) DO UPDATE SET
                     dismissed = 1, snoozed_until = NULL, updated_at = excluded.updated_at",
                rusqlite::params![key_to_text(key)?, at.to_rfc3339()],
            )
            .map_err(db_err("Record dismissal"))?;
        Ok(())
    }

    /// Remember that `key` was snoozed until `until`.
    pub fn record_snooze(
        &self,
        key: &ReminderKey,
        until: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO reminder_overrides (reminder_key, dismissed, snoozed_until, updated_at)
                 VALUES (?1, 0, ?2, ?3)
                 ON CONFLICT(reminder_key) DO UPDATE SET
                     snoozed_until = excluded.snoozed_until, updated_at = excluded.updated_at",
                rusqlite::params![key_to_text(key)?, until.to_rfc3339(), at.to_rfc3339()],
            )
            .map_err(db_err("Record snooze"))?;
        Ok(())
    }

    pub fn load_overrides(&self) -> Result<ReminderOverrides> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT reminder_key, dismissed, snoozed_until
                 FROM reminder_overrides ORDER BY updated_at",
            )
            .map_err(db_err("Load overrides"))?;
        let rows: Vec<(String, bool, Option<String>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(db_err("Load overrides"))?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err("Load overrides"))?;

        let mut overrides = ReminderOverrides::default();
        for (raw, dismissed, snoozed_until) in rows {
            let key: ReminderKey = match serde_json::from_str(&raw) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!("⚠️ Skipping unreadable reminder key {raw:?}: {e}");
                    continue;
                }
            };
            if dismissed {
                overrides.dismissed.push(key);
            } else if let Some(until) = parse_opt_time(snoozed_until)? {
                overrides.snoozed.push((key, until));
            }
        }
        Ok(overrides)
    }
}
