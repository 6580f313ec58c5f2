use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use super::models::*;

/// Async-safe handle to the session database.
///
/// Wraps `SessionDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SessionDb>>,
}

impl DbHandle {
    pub fn new(db: SessionDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    ///
    /// The closure runs while holding the database mutex, so anything it does
    /// after a successful write is ordered with respect to every other write.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&SessionDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct SessionDb {
    conn: Connection,
}

const SESSION_COLUMNS: &str = "id, name, backend, image, cpus, memory, pull_policy, storage_class, \
     repo_url, base_branch, branch_name, workdir, status, access_mode, agent_activity, \
     backend_handle, pr, error, version, created_at, updated_at";

impl SessionDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure SQLite")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    backend TEXT NOT NULL,
                    image TEXT NOT NULL,
                    cpus REAL NOT NULL,
                    memory TEXT NOT NULL,
                    pull_policy TEXT NOT NULL DEFAULT 'if_not_present',
                    storage_class TEXT,
                    repo_url TEXT NOT NULL,
                    base_branch TEXT NOT NULL,
                    branch_name TEXT NOT NULL UNIQUE,
                    workdir TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'creating',
                    access_mode TEXT NOT NULL DEFAULT 'ask',
                    agent_activity TEXT NOT NULL DEFAULT 'unknown',
                    backend_handle TEXT,
                    pr TEXT,
                    version INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
                ",
            )
            .context("Failed to create sessions table")?;

        // Additive migrations (columns are nullable, safe to re-run).
        // Only "duplicate column" errors are ignored.
        match self
            .conn
            .execute("ALTER TABLE sessions ADD COLUMN error TEXT", [])
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add error column: {}", e)),
        }

        Ok(())
    }

    // ── Session CRUD ──────────────────────────────────────────────────

    pub fn insert_session(&self, session: &Session) -> Result<()> {
        let pr = encode_pr(&session.pr)?;
        self.conn
            .execute(
                "INSERT INTO sessions (id, name, backend, image, cpus, memory, pull_policy, storage_class,
                    repo_url, base_branch, branch_name, workdir, status, access_mode, agent_activity,
                    backend_handle, pr, error, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                params![
                    session.id,
                    session.name,
                    session.execution.backend.as_str(),
                    session.execution.image,
                    session.execution.resources.cpus,
                    session.execution.resources.memory,
                    session.execution.pull_policy.as_str(),
                    session.execution.storage_class,
                    session.workspace.repo_url,
                    session.workspace.base_branch,
                    session.workspace.branch_name,
                    session.workspace.workdir,
                    session.status.as_str(),
                    session.access_mode.as_str(),
                    session.agent_activity.as_str(),
                    session.backend_handle,
                    pr,
                    session.error,
                    session.version,
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert session")?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS))
            .context("Failed to prepare get_session")?;
        let mut rows = stmt
            .query_map(params![id], SessionRow::read)
            .context("Failed to query session")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read session row")?;
                Ok(Some(r.into_session()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM sessions ORDER BY created_at, id",
                SESSION_COLUMNS
            ))
            .context("Failed to prepare list_sessions")?;
        let rows = stmt
            .query_map([], SessionRow::read)
            .context("Failed to query sessions")?;
        let mut sessions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read session row")?;
            sessions.push(r.into_session()?);
        }
        Ok(sessions)
    }

    /// Write every mutable field of `session` if the stored version still
    /// equals `expected_version`. `session.version` is written as the new
    /// version. Returns `false` when another writer got there first.
    pub fn compare_and_swap(&self, session: &Session, expected_version: i64) -> Result<bool> {
        let pr = encode_pr(&session.pr)?;
        let changed = self
            .conn
            .execute(
                "UPDATE sessions SET status = ?1, access_mode = ?2, agent_activity = ?3,
                    backend_handle = ?4, pr = ?5, error = ?6, version = ?7, updated_at = ?8
                 WHERE id = ?9 AND version = ?10",
                params![
                    session.status.as_str(),
                    session.access_mode.as_str(),
                    session.agent_activity.as_str(),
                    session.backend_handle,
                    pr,
                    session.error,
                    session.version,
                    session.updated_at.to_rfc3339(),
                    session.id,
                    expected_version,
                ],
            )
            .context("Failed to update session")?;
        Ok(changed == 1)
    }

    pub fn current_version(&self, id: &str) -> Result<Option<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT version FROM sessions WHERE id = ?1")
            .context("Failed to prepare current_version")?;
        let mut rows = stmt
            .query_map(params![id], |row| row.get::<_, i64>(0))
            .context("Failed to query session version")?;
        match rows.next() {
            Some(v) => Ok(Some(v.context("Failed to read session version")?)),
            None => Ok(None),
        }
    }

    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .context("Failed to delete session")?;
        Ok(count > 0)
    }
}

fn encode_pr(pr: &Option<PullRequest>) -> Result<Option<String>> {
    pr.as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to encode pull request JSON")
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Raw column values, converted into typed fields by `into_session`.
struct SessionRow {
    id: String,
    name: String,
    backend: String,
    image: String,
    cpus: f64,
    memory: String,
    pull_policy: String,
    storage_class: Option<String>,
    repo_url: String,
    base_branch: String,
    branch_name: String,
    workdir: String,
    status: String,
    access_mode: String,
    agent_activity: String,
    backend_handle: Option<String>,
    pr: Option<String>,
    error: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            backend: row.get(2)?,
            image: row.get(3)?,
            cpus: row.get(4)?,
            memory: row.get(5)?,
            pull_policy: row.get(6)?,
            storage_class: row.get(7)?,
            repo_url: row.get(8)?,
            base_branch: row.get(9)?,
            branch_name: row.get(10)?,
            workdir: row.get(11)?,
            status: row.get(12)?,
            access_mode: row.get(13)?,
            agent_activity: row.get(14)?,
            backend_handle: row.get(15)?,
            pr: row.get(16)?,
            error: row.get(17)?,
            version: row.get(18)?,
            created_at: row.get(19)?,
            updated_at: row.get(20)?,
        })
    }

    fn into_session(self) -> Result<Session> {
        let parse_err = |e: String| anyhow::anyhow!(e);
        let backend = BackendKind::from_str(&self.backend)
            .map_err(parse_err)
            .context("Failed to parse session backend")?;
        let pull_policy = PullPolicy::from_str(&self.pull_policy)
            .map_err(parse_err)
            .context("Failed to parse pull policy")?;
        let status = SessionStatus::from_str(&self.status)
            .map_err(parse_err)
            .context("Failed to parse session status")?;
        let access_mode = AccessMode::from_str(&self.access_mode)
            .map_err(parse_err)
            .context("Failed to parse access mode")?;
        let agent_activity = AgentActivity::from_str(&self.agent_activity)
            .map_err(parse_err)
            .context("Failed to parse agent activity")?;
        let pr: Option<PullRequest> = self
            .pr
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse pull request JSON")?;

        Ok(Session {
            id: self.id,
            name: self.name,
            execution: ExecutionDescriptor {
                backend,
                image: self.image,
                resources: ResourceLimits {
                    cpus: self.cpus,
                    memory: self.memory,
                },
                pull_policy,
                storage_class: self.storage_class,
            },
            workspace: WorkspaceDescriptor {
                repo_url: self.repo_url,
                base_branch: self.base_branch,
                branch_name: self.branch_name,
                workdir: self.workdir,
            },
            status,
            access_mode,
            agent_activity,
            backend_handle: self.backend_handle,
            pr,
            error: self.error,
            version: self.version,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp '{}'", raw))
}

// ── Tests ─────────────────────────────────────────────────────────────
