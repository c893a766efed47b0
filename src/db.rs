//! Durable store for session checkpoints and the reset audit log

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::models::{SessionResetEvent, SessionSnapshot, TriggerKind};

/// Thread-safe database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

/// Fixed-width RFC 3339 so text comparison in SQL matches time order
fn ts(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

impl Database {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        Self::with_connection(conn)
    }

    /// Throwaway database, used by tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("Database lock poisoned"))
    }

    /// Initialize the database schema
    fn init(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            -- Latest checkpoint per session
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                revision INTEGER NOT NULL,
                snapshot TEXT NOT NULL,
                saved_at TEXT NOT NULL
            );

            -- Append-only reset audit log
            CREATE TABLE IF NOT EXISTS reset_events (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                previous_count INTEGER NOT NULL,
                new_count INTEGER NOT NULL,
                fired_at TEXT NOT NULL,
                trigger_kind TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_reset_events_session
                ON reset_events(session_id, fired_at);
            "#,
        )?;

        Ok(())
    }

    /// Last checkpoint for a session, if any
    pub fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|json| {
            serde_json::from_str(&json)
                .with_context(|| format!("Corrupt checkpoint for session '{}'", session_id))
        })
        .transpose()
    }

    /// Overwrite the checkpoint for a session
    pub fn save(&self, session_id: &str, snapshot: &SessionSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot).context("Failed to serialize snapshot")?;
        let conn = self.lock()?;
        conn.execute(
            r#"INSERT INTO sessions (session_id, revision, snapshot, saved_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(session_id) DO UPDATE SET
                   revision = excluded.revision,
                   snapshot = excluded.snapshot,
                   saved_at = excluded.saved_at"#,
            params![
                session_id,
                snapshot.revision as i64,
                json,
                ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Every session that has a checkpoint
    pub fn list_session_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT session_id FROM sessions ORDER BY session_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    pub fn append_reset_event(&self, event: &SessionResetEvent) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"INSERT INTO reset_events (id, session_id, previous_count, new_count, fired_at, trigger_kind)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                &event.id,
                &event.session_id,
                event.previous_count,
                event.new_count,
                ts(&event.fired_at_utc),
                event.trigger_kind.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Reset events for a session, oldest first, optionally bounded by `[from, to)`
    pub fn list_reset_events(
        &self,
        session_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<SessionResetEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, session_id, previous_count, new_count, fired_at, trigger_kind
               FROM reset_events
               WHERE session_id = ?1
                 AND (?2 IS NULL OR fired_at >= ?2)
                 AND (?3 IS NULL OR fired_at < ?3)
               ORDER BY fired_at ASC, rowid ASC"#,
        )?;

        let rows = stmt.query_map(
            params![session_id, from.as_ref().map(ts), to.as_ref().map(ts)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?;

        let mut events = Vec::new();
        for row in rows {
            let (id, session_id, previous_count, new_count, fired_at, trigger) = row?;
            let trigger_kind = TriggerKind::parse(&trigger)
                .ok_or_else(|| anyhow!("Unknown trigger kind '{}'", trigger))?;
            events.push(SessionResetEvent {
                id,
                session_id,
                previous_count,
                new_count,
                fired_at_utc: parse_ts(&fired_at)?,
                trigger_kind,
            });
        }

        Ok(events)
    }
}

#[cfg(test)]
impl Database {
    /// Raw SQL, for tests that need to break the schema
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }
}
