//! Durable session recording and the query path.
//!
//! The store is append-only: turns and per-turn metrics are written once,
//! in index order, and the Analysis record is written exactly once at
//! finalization. The only "mutation" the contract allows is the batch
//! pass replacing the whole metrics series wholesale. Two implementations
//! ship: an in-memory store for tests and embedded use, and a SQLite store
//! with JSON payload columns.

use std::path::PathBuf;

use anyhow::{anyhow, bail};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::Analysis;
use crate::basin::BasinLabel;
use crate::metrics::MetricsSnapshot;
use crate::session::{excerpt, SessionSummary, Turn};

/// Listing excerpt width.
const EXCERPT_CHARS: usize = 80;

/// What the live pipeline records per turn: the snapshot plus the basin
/// label published on the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnMetricsRecord {
    pub snapshot: MetricsSnapshot,
    pub basin: BasinLabel,
}

/// Append-only storage for sessions, addressable by session id.
pub trait SessionStore: Send + Sync {
    /// Register a new session. Fails if the id already exists.
    fn create_session(
        &self,
        id: Uuid,
        provocation: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), anyhow::Error>;

    /// Append one turn. The index must equal the current turn count and
    /// the session must not be finalized.
    fn append_turn(&self, id: Uuid, turn: &Turn) -> Result<(), anyhow::Error>;

    /// Append one per-turn metrics record, same discipline as turns.
    fn append_metrics(&self, id: Uuid, record: &TurnMetricsRecord) -> Result<(), anyhow::Error>;

    /// Replace the whole metrics series with the batch recomputation.
    fn replace_metrics(
        &self,
        id: Uuid,
        records: &[TurnMetricsRecord],
    ) -> Result<(), anyhow::Error>;

    /// Write the Analysis exactly once; a second write is rejected.
    fn write_analysis(&self, id: Uuid, analysis: &Analysis) -> Result<(), anyhow::Error>;

    fn list_sessions(&self) -> Result<Vec<SessionSummary>, anyhow::Error>;

    fn turns(&self, id: Uuid) -> Result<Vec<Turn>, anyhow::Error>;

    fn metrics(&self, id: Uuid) -> Result<Vec<TurnMetricsRecord>, anyhow::Error>;

    /// `None` until the session has been finalized.
    fn analysis(&self, id: Uuid) -> Result<Option<Analysis>, anyhow::Error>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemorySession {
    provocation: String,
    created_at: Option<DateTime<Utc>>,
    turns: Vec<Turn>,
    metrics: Vec<TurnMetricsRecord>,
    analysis: Option<Analysis>,
}

/// DashMap-backed store; the default for tests and embedded engines.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: DashMap<Uuid, MemorySession>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn create_session(
        &self,
        id: Uuid,
        provocation: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        if self.sessions.contains_key(&id) {
            bail!("session {id} already exists");
        }
        self.sessions.insert(
            id,
            MemorySession {
                provocation: provocation.to_string(),
                created_at: Some(created_at),
                ..MemorySession::default()
            },
        );
        Ok(())
    }

    fn append_turn(&self, id: Uuid, turn: &Turn) -> Result<(), anyhow::Error> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown session {id}"))?;
        if session.analysis.is_some() {
            bail!("session {id} is finalized");
        }
        if turn.index != session.turns.len() {
            bail!(
                "non-monotonic turn index {} (expected {})",
                turn.index,
                session.turns.len()
            );
        }
        session.turns.push(turn.clone());
        Ok(())
    }

    fn append_metrics(&self, id: Uuid, record: &TurnMetricsRecord) -> Result<(), anyhow::Error> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown session {id}"))?;
        if session.analysis.is_some() {
            bail!("session {id} is finalized");
        }
        if record.snapshot.turn_index != session.metrics.len() {
            bail!(
                "non-monotonic metrics index {} (expected {})",
                record.snapshot.turn_index,
                session.metrics.len()
            );
        }
        session.metrics.push(record.clone());
        Ok(())
    }

    fn replace_metrics(
        &self,
        id: Uuid,
        records: &[TurnMetricsRecord],
    ) -> Result<(), anyhow::Error> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown session {id}"))?;
        session.metrics = records.to_vec();
        Ok(())
    }

    fn write_analysis(&self, id: Uuid, analysis: &Analysis) -> Result<(), anyhow::Error> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown session {id}"))?;
        if session.analysis.is_some() {
            bail!("analysis for session {id} already written");
        }
        session.analysis = Some(analysis.clone());
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<SessionSummary>, anyhow::Error> {
        let mut rows: Vec<(Option<DateTime<Utc>>, SessionSummary)> = self
            .sessions
            .iter()
            .map(|entry| {
                (
                    entry.created_at,
                    SessionSummary {
                        id: *entry.key(),
                        turn_count: entry.turns.len(),
                        has_analysis: entry.analysis.is_some(),
                        provocation_excerpt: excerpt(&entry.provocation, EXCERPT_CHARS),
                    },
                )
            })
            .collect();
        rows.sort_by_key(|(created_at, summary)| (*created_at, summary.id));
        Ok(rows.into_iter().map(|(_, summary)| summary).collect())
    }

    fn turns(&self, id: Uuid) -> Result<Vec<Turn>, anyhow::Error> {
        Ok(self
            .sessions
            .get(&id)
            .ok_or_else(|| anyhow!("unknown session {id}"))?
            .turns
            .clone())
    }

    fn metrics(&self, id: Uuid) -> Result<Vec<TurnMetricsRecord>, anyhow::Error> {
        Ok(self
            .sessions
            .get(&id)
            .ok_or_else(|| anyhow!("unknown session {id}"))?
            .metrics
            .clone())
    }

    fn analysis(&self, id: Uuid) -> Result<Option<Analysis>, anyhow::Error> {
        Ok(self
            .sessions
            .get(&id)
            .ok_or_else(|| anyhow!("unknown session {id}"))?
            .analysis
            .clone())
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

/// SQLite-backed store with JSON payload columns.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (and initialize) the database at `db_path`.
    pub fn new(db_path: PathBuf) -> Result<Self, anyhow::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        store.initialize_db()?;
        Ok(store)
    }

    fn connection(&self) -> Result<Connection, anyhow::Error> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn initialize_db(&self) -> Result<(), anyhow::Error> {
        let conn = self.connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                 id TEXT PRIMARY KEY,
                 provocation TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS turns (
                 session_id TEXT NOT NULL,
                 idx INTEGER NOT NULL,
                 payload TEXT NOT NULL,
                 PRIMARY KEY (session_id, idx)
             );
             CREATE TABLE IF NOT EXISTS turn_metrics (
                 session_id TEXT NOT NULL,
                 idx INTEGER NOT NULL,
                 payload TEXT NOT NULL,
                 PRIMARY KEY (session_id, idx)
             );
             CREATE TABLE IF NOT EXISTS analyses (
                 session_id TEXT PRIMARY KEY,
                 payload TEXT NOT NULL
             );",
        )?;
        Ok(())
    }

    fn turn_count(conn: &Connection, id: Uuid) -> Result<usize, anyhow::Error> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM turns WHERE session_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn has_analysis(conn: &Connection, id: Uuid) -> Result<bool, anyhow::Error> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM analyses WHERE session_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

impl SessionStore for SqliteStore {
    fn create_session(
        &self,
        id: Uuid,
        provocation: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        let conn = self.connection()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sessions (id, provocation, created_at) VALUES (?1, ?2, ?3)",
            params![id.to_string(), provocation, created_at.to_rfc3339()],
        )?;
        if inserted == 0 {
            bail!("session {id} already exists");
        }
        Ok(())
    }

    fn append_turn(&self, id: Uuid, turn: &Turn) -> Result<(), anyhow::Error> {
        let conn = self.connection()?;
        if Self::has_analysis(&conn, id)? {
            bail!("session {id} is finalized");
        }
        let expected = Self::turn_count(&conn, id)?;
        if turn.index != expected {
            bail!("non-monotonic turn index {} (expected {expected})", turn.index);
        }
        conn.execute(
            "INSERT INTO turns (session_id, idx, payload) VALUES (?1, ?2, ?3)",
            params![
                id.to_string(),
                turn.index as i64,
                serde_json::to_string(turn)?
            ],
        )?;
        Ok(())
    }

    fn append_metrics(&self, id: Uuid, record: &TurnMetricsRecord) -> Result<(), anyhow::Error> {
        let conn = self.connection()?;
        if Self::has_analysis(&conn, id)? {
            bail!("session {id} is finalized");
        }
        conn.execute(
            "INSERT INTO turn_metrics (session_id, idx, payload) VALUES (?1, ?2, ?3)",
            params![
                id.to_string(),
                record.snapshot.turn_index as i64,
                serde_json::to_string(record)?
            ],
        )?;
        Ok(())
    }

    fn replace_metrics(
        &self,
        id: Uuid,
        records: &[TurnMetricsRecord],
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM turn_metrics WHERE session_id = ?1",
            params![id.to_string()],
        )?;
        for record in records {
            tx.execute(
                "INSERT INTO turn_metrics (session_id, idx, payload) VALUES (?1, ?2, ?3)",
                params![
                    id.to_string(),
                    record.snapshot.turn_index as i64,
                    serde_json::to_string(record)?
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn write_analysis(&self, id: Uuid, analysis: &Analysis) -> Result<(), anyhow::Error> {
        let conn = self.connection()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO analyses (session_id, payload) VALUES (?1, ?2)",
            params![id.to_string(), serde_json::to_string(analysis)?],
        )?;
        if inserted == 0 {
            bail!("analysis for session {id} already written");
        }
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<SessionSummary>, anyhow::Error> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.provocation,
                    (SELECT COUNT(*) FROM turns t WHERE t.session_id = s.id),
                    (SELECT COUNT(*) FROM analyses a WHERE a.session_id = s.id)
             FROM sessions s ORDER BY s.created_at, s.id",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let provocation: String = row.get(1)?;
            let turn_count: i64 = row.get(2)?;
            let analyses: i64 = row.get(3)?;
            Ok((id, provocation, turn_count, analyses))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id, provocation, turn_count, analyses) = row?;
            summaries.push(SessionSummary {
                id: Uuid::parse_str(&id)?,
                turn_count: turn_count as usize,
                has_analysis: analyses > 0,
                provocation_excerpt: excerpt(&provocation, EXCERPT_CHARS),
            });
        }
        Ok(summaries)
    }

    fn turns(&self, id: Uuid) -> Result<Vec<Turn>, anyhow::Error> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT payload FROM turns WHERE session_id = ?1 ORDER BY idx")?;
        let rows = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;
        let mut turns = Vec::new();
        for row in rows {
            turns.push(serde_json::from_str(&row?)?);
        }
        Ok(turns)
    }

    fn metrics(&self, id: Uuid) -> Result<Vec<TurnMetricsRecord>, anyhow::Error> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT payload FROM turn_metrics WHERE session_id = ?1 ORDER BY idx")?;
        let rows = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    fn analysis(&self, id: Uuid) -> Result<Option<Analysis>, anyhow::Error> {
        let conn = self.connection()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM analyses WHERE session_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
