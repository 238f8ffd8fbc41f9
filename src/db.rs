/// Session persistence: the `SessionStore` seam and its SQLite implementation.
use crate::model::{AgentSession, SessionAnalysis};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Agents with a session ingested within this many hours count as active.
pub const ACTIVE_AGENT_WINDOW_HOURS: i64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("failed to encode or decode stored record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("store is closed")]
    Closed,
    #[error("store task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable session storage used by the HTTP layer, the queue workers and
/// the analyzer.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a batch. Either every session is written or none is.
    /// Re-ingesting an existing session id replaces it and discards its
    /// previous analysis.
    async fn store_sessions(&self, sessions: &[AgentSession], api_key: &str) -> StoreResult<()>;

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<AgentSession>>;

    /// Sessions for one agent, most recent `start_time` first.
    async fn list_sessions(
        &self,
        agent_name: &str,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<AgentSession>>;

    /// Sessions for one agent with `from_ms <= start_time < to_ms`, oldest first.
    async fn sessions_in_range(
        &self,
        agent_name: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> StoreResult<Vec<AgentSession>>;

    async fn save_analysis(&self, analysis: &SessionAnalysis) -> StoreResult<()>;

    async fn get_analysis(&self, session_id: &str) -> StoreResult<Option<SessionAnalysis>>;

    async fn count_sessions(&self) -> StoreResult<u64>;

    async fn count_active_agents(&self) -> StoreResult<u64>;

    /// Release the underlying connection. Later calls fail with `Closed`.
    async fn close(&self) -> StoreResult<()>;
}

/// Opens (or creates) the SQLite database at the given path.
///
/// Creates the sessions and session_analysis tables and their indexes if
/// they don't already exist.
pub fn open_or_create(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;

    // Enable WAL mode for better concurrent read performance
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_id  TEXT PRIMARY KEY,
            agent_name  TEXT NOT NULL,
            user_id     TEXT,
            start_time  INTEGER NOT NULL,
            end_time    INTEGER,
            payload     TEXT NOT NULL,
            key_hint    TEXT,
            ingested_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_agent_start ON sessions(agent_name, start_time);
        CREATE INDEX IF NOT EXISTS idx_sessions_ingested ON sessions(ingested_at);

        CREATE TABLE IF NOT EXISTS session_analysis (
            session_id  TEXT PRIMARY KEY REFERENCES sessions(session_id) ON DELETE CASCADE,
            flagged     INTEGER NOT NULL,
            payload     TEXT NOT NULL
        );",
    )?;

    Ok(conn)
}

/// Non-secret hint of the credential that submitted a session.
pub fn key_hint(api_key: &str) -> String {
    let prefix: String = api_key.chars().take(4).collect();
    format!("{prefix}***")
}

/// SQLite-backed `SessionStore`.
///
/// rusqlite is synchronous, so every call runs on tokio's blocking pool
/// against a single mutex-guarded connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_or_create(path)?;
        tracing::info!(path = %path.display(), "session store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Task("connection mutex poisoned".to_string()))?;
            let conn = guard.as_mut().ok_or(StoreError::Closed)?;
            f(conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn decode_sessions(payloads: Vec<String>) -> StoreResult<Vec<AgentSession>> {
    payloads
        .iter()
        .map(|p| serde_json::from_str(p).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn store_sessions(&self, sessions: &[AgentSession], api_key: &str) -> StoreResult<()> {
        let sessions = sessions.to_vec();
        let hint = key_hint(api_key);

        self.with_conn(move |conn| {
            let ingested_at = now_ms();
            let tx = conn.transaction()?;
            {
                let mut upsert = tx.prepare(
                    "INSERT INTO sessions
                        (session_id, agent_name, user_id, start_time, end_time, payload, key_hint, ingested_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(session_id) DO UPDATE SET
                        agent_name = excluded.agent_name,
                        user_id = excluded.user_id,
                        start_time = excluded.start_time,
                        end_time = excluded.end_time,
                        payload = excluded.payload,
                        key_hint = excluded.key_hint,
                        ingested_at = excluded.ingested_at",
                )?;
                let mut clear_analysis =
                    tx.prepare("DELETE FROM session_analysis WHERE session_id = ?1")?;

                for s in &sessions {
                    let payload = serde_json::to_string(s)?;
                    upsert.execute(params![
                        s.session_id,
                        s.agent_name,
                        s.user_id,
                        s.start_time,
                        s.end_time,
                        payload,
                        hint,
                        ingested_at,
                    ])?;
                    clear_analysis.execute(params![s.session_id])?;
                }
            }
            tx.commit()?;
            tracing::debug!(count = sessions.len(), "stored session batch");
            Ok(())
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<AgentSession>> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM sessions WHERE session_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            payload
                .map(|p| serde_json::from_str(&p).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn list_sessions(
        &self,
        agent_name: &str,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<AgentSession>> {
        let agent = agent_name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM sessions WHERE agent_name = ?1
                 ORDER BY start_time DESC, session_id ASC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let payloads = stmt
                .query_map(params![agent, limit, offset], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            decode_sessions(payloads)
        })
        .await
    }

    async fn sessions_in_range(
        &self,
        agent_name: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> StoreResult<Vec<AgentSession>> {
        let agent = agent_name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM sessions
                 WHERE agent_name = ?1 AND start_time >= ?2 AND start_time < ?3
                 ORDER BY start_time ASC, session_id ASC",
            )?;
            let payloads = stmt
                .query_map(params![agent, from_ms, to_ms], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            decode_sessions(payloads)
        })
        .await
    }

    async fn save_analysis(&self, analysis: &SessionAnalysis) -> StoreResult<()> {
        let analysis = analysis.clone();
        self.with_conn(move |conn| {
            let payload = serde_json::to_string(&analysis)?;
            conn.execute(
                "INSERT OR REPLACE INTO session_analysis (session_id, flagged, payload)
                 VALUES (?1, ?2, ?3)",
                params![analysis.session_id, analysis.flagged, payload],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_analysis(&self, session_id: &str) -> StoreResult<Option<SessionAnalysis>> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM session_analysis WHERE session_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            payload
                .map(|p| serde_json::from_str(&p).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn count_sessions(&self) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    async fn count_active_agents(&self) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let since = now_ms() - ACTIVE_AGENT_WINDOW_HOURS * 3_600_000;
            let count: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT agent_name) FROM sessions WHERE ingested_at >= ?1",
                params![since],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn close(&self) -> StoreResult<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Task("connection mutex poisoned".to_string()))?;
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, e)| StoreError::Db(e))?;
                tracing::info!("session store closed");
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}
