//! SQLite persistence: sessions, the paginated message log, and per-session
//! transcript checkpoints.
//!
//! All writes are best-effort from the caller's perspective: the orchestrator
//! logs persistence failures and still returns its response. The connection
//! sits behind a Mutex; turns are short and per-session serialized upstream.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::transcript::Transcript;

/// Safety scores saturate here; a crisis turn adds 2.
pub const MAX_SAFETY_SCORE: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub user_name: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub safety_score: i64,
    pub metadata: serde_json::Value,
}

/// One stored exchange: the user message and the assistant's reply, with the
/// structured response payload in `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: String,
    pub user_id: String,
    pub user_name: String,
    pub user_message: String,
    pub ai_response: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Durable transcript snapshot for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub transcript: Transcript,
    pub crisis_flag: bool,
    pub safety_score: i64,
    pub updated_at: DateTime<Utc>,
}

pub struct SessionDatabase {
    conn: Mutex<Connection>,
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            tracing::warn!("Unparseable timestamp in database: {}", raw);
            Utc::now()
        })
}

fn parse_metadata(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

impl SessionDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                user_name TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_activity TEXT NOT NULL,
                safety_score INTEGER NOT NULL DEFAULT 0,
                metadata_json TEXT NOT NULL DEFAULT 'null'
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                user_name TEXT NOT NULL,
                user_message TEXT NOT NULL,
                ai_response TEXT NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT 'null',
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS checkpoints (
                session_id TEXT PRIMARY KEY,
                transcript_json TEXT NOT NULL,
                crisis_flag INTEGER NOT NULL DEFAULT 0,
                safety_score INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }

    /// Create the session if it does not exist; otherwise leave it untouched.
    pub fn upsert_session(
        &self,
        session_id: &str,
        user_id: &str,
        user_name: &str,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO sessions (session_id, user_id, user_name, created_at, last_activity, safety_score, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 'null')",
            params![session_id, user_id, user_name, now.clone(), now],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.lock_conn()?;
        let record = conn
            .query_row(
                "SELECT session_id, user_id, user_name, created_at, last_activity, safety_score, metadata_json
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionRecord {
                        session_id: row.get(0)?,
                        user_id: row.get(1)?,
                        user_name: row.get(2)?,
                        created_at: parse_timestamp(&row.get::<_, String>(3)?),
                        last_activity: parse_timestamp(&row.get::<_, String>(4)?),
                        safety_score: row.get(5)?,
                        metadata: parse_metadata(&row.get::<_, String>(6)?),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn touch_session(&self, session_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sessions SET last_activity = ?1 WHERE session_id = ?2",
            params![Utc::now().to_rfc3339(), session_id],
        )?;
        Ok(())
    }

    /// Raise the session's safety score by `delta`, saturating at
    /// `MAX_SAFETY_SCORE`. Returns the new score.
    pub fn adjust_safety_score(&self, session_id: &str, delta: i64) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sessions SET safety_score = MIN(safety_score + ?1, ?2) WHERE session_id = ?3",
            params![delta, MAX_SAFETY_SCORE, session_id],
        )?;
        let score = conn.query_row(
            "SELECT safety_score FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(score)
    }

    pub fn store_message(
        &self,
        session_id: &str,
        user_id: &str,
        user_name: &str,
        user_message: &str,
        ai_response: &str,
        metadata: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO messages (session_id, user_id, user_name, user_message, ai_response, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                user_id,
                user_name,
                user_message,
                ai_response,
                serde_json::to_string(metadata)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Page through a session's exchanges, oldest first.
    pub fn get_message_history(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, user_id, user_name, user_message, ai_response, metadata_json, created_at
             FROM messages WHERE session_id = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3",
        )?;
        let messages = stmt
            .query_map(params![session_id, limit as i64, offset as i64], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    user_id: row.get(2)?,
                    user_name: row.get(3)?,
                    user_message: row.get(4)?,
                    ai_response: row.get(5)?,
                    metadata: parse_metadata(&row.get::<_, String>(6)?),
                    created_at: parse_timestamp(&row.get::<_, String>(7)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub fn count_messages(&self, session_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// The most recent `limit` exchanges, oldest first, for prompt context.
    pub fn get_recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let total = self.count_messages(session_id)?;
        let offset = total.saturating_sub(limit);
        self.get_message_history(session_id, limit, offset)
    }

    pub fn get_user_sessions(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, user_name, created_at, last_activity, safety_score, metadata_json
             FROM sessions WHERE user_id = ?1 ORDER BY last_activity DESC",
        )?;
        let sessions = stmt
            .query_map(params![user_id], |row| {
                Ok(SessionRecord {
                    session_id: row.get(0)?,
                    user_id: row.get(1)?,
                    user_name: row.get(2)?,
                    created_at: parse_timestamp(&row.get::<_, String>(3)?),
                    last_activity: parse_timestamp(&row.get::<_, String>(4)?),
                    safety_score: row.get(5)?,
                    metadata: parse_metadata(&row.get::<_, String>(6)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    pub fn save_checkpoint(
        &self,
        session_id: &str,
        transcript: &Transcript,
        crisis_flag: bool,
        safety_score: i64,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO checkpoints (session_id, transcript_json, crisis_flag, safety_score, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                transcript_json = excluded.transcript_json,
                crisis_flag = excluded.crisis_flag,
                safety_score = excluded.safety_score,
                updated_at = excluded.updated_at",
            params![
                session_id,
                serde_json::to_string(transcript).context("Failed to serialize transcript")?,
                crisis_flag as i64,
                safety_score,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_checkpoint(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT transcript_json, crisis_flag, safety_score, updated_at
                 FROM checkpoints WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((transcript_json, crisis_flag, safety_score, updated_at)) => {
                let transcript = serde_json::from_str(&transcript_json)
                    .context("Corrupt transcript checkpoint")?;
                Ok(Some(Checkpoint {
                    session_id: session_id.to_string(),
                    transcript,
                    crisis_flag: crisis_flag != 0,
                    safety_score,
                    updated_at: parse_timestamp(&updated_at),
                }))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::TurnMessage;
    use tempfile::TempDir;

    fn test_db() -> (TempDir, SessionDatabase) {
        let dir = TempDir::new().unwrap();
        let db = SessionDatabase::new(dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn session_creation_is_idempotent() {
        let (_dir, db) = test_db();
        db.upsert_session("s1", "u1", "Ada").unwrap();
        db.adjust_safety_score("s1", 2).unwrap();
        // A second upsert must not reset the score
        db.upsert_session("s1", "u1", "Ada").unwrap();
        let session = db.get_session("s1").unwrap().unwrap();
        assert_eq!(session.safety_score, 2);
        assert_eq!(session.user_name, "Ada");
    }

    #[test]
    fn missing_session_is_none() {
        let (_dir, db) = test_db();
        assert!(db.get_session("nope").unwrap().is_none());
    }

    #[test]
    fn safety_score_saturates_at_cap() {
        let (_dir, db) = test_db();
        db.upsert_session("s1", "u1", "Ada").unwrap();
        for _ in 0..4 {
            db.adjust_safety_score("s1", 2).unwrap();
        }
        let score = db.adjust_safety_score("s1", 2).unwrap();
        assert_eq!(score, MAX_SAFETY_SCORE);
    }

    #[test]
    fn message_history_pagination() {
        let (_dir, db) = test_db();
        db.upsert_session("s1", "u1", "Ada").unwrap();
        for i in 0..7 {
            db.store_message(
                "s1",
                "u1",
                "Ada",
                &format!("q{}", i),
                &format!("a{}", i),
                &serde_json::Value::Null,
            )
            .unwrap();
        }

        assert_eq!(db.count_messages("s1").unwrap(), 7);

        let page = db.get_message_history("s1", 3, 0).unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].user_message, "q0");

        let page = db.get_message_history("s1", 3, 6).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].user_message, "q6");
    }

    #[test]
    fn recent_messages_returns_tail_in_order() {
        let (_dir, db) = test_db();
        db.upsert_session("s1", "u1", "Ada").unwrap();
        for i in 0..10 {
            db.store_message(
                "s1",
                "u1",
                "Ada",
                &format!("q{}", i),
                &format!("a{}", i),
                &serde_json::Value::Null,
            )
            .unwrap();
        }
        let recent = db.get_recent_messages("s1", 3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].user_message, "q7");
        assert_eq!(recent[2].user_message, "q9");
    }

    #[test]
    fn history_is_scoped_to_session() {
        let (_dir, db) = test_db();
        db.upsert_session("s1", "u1", "Ada").unwrap();
        db.upsert_session("s2", "u1", "Ada").unwrap();
        db.store_message("s1", "u1", "Ada", "hi", "hello", &serde_json::Value::Null)
            .unwrap();
        assert_eq!(db.count_messages("s2").unwrap(), 0);
    }

    #[test]
    fn checkpoint_round_trip() {
        let (_dir, db) = test_db();
        db.upsert_session("s1", "u1", "Ada").unwrap();

        let mut transcript = Transcript::new();
        transcript.push(TurnMessage::user("I feel anxious"));
        transcript.push(TurnMessage::assistant("That sounds hard."));

        db.save_checkpoint("s1", &transcript, true, 2).unwrap();
        let checkpoint = db.load_checkpoint("s1").unwrap().unwrap();
        assert!(checkpoint.crisis_flag);
        assert_eq!(checkpoint.safety_score, 2);
        assert_eq!(checkpoint.transcript.len(), 2);

        // Overwrite replaces, not appends
        db.save_checkpoint("s1", &Transcript::new(), false, 0).unwrap();
        let checkpoint = db.load_checkpoint("s1").unwrap().unwrap();
        assert!(!checkpoint.crisis_flag);
        assert!(checkpoint.transcript.is_empty());
    }

    #[test]
    fn user_sessions_listed_most_recent_first() {
        let (_dir, db) = test_db();
        db.upsert_session("s1", "u1", "Ada").unwrap();
        db.upsert_session("s2", "u1", "Ada").unwrap();
        db.touch_session("s1").unwrap();
        let sessions = db.get_user_sessions("u1").unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "s1");
    }
}
