// crates/cadence-core/src/audit/sqlite.rs
// SQLite-backed audit log using deadpool-sqlite
//
// Appends go through an unbounded channel to a single writer task, so records
// land in the table in the order `append` was called. `flush` resolves once
// everything appended before it has been committed.

use super::EventSink;
use crate::error::{CadenceError, Result};
use async_trait::async_trait;
use cadence_types::{AuditEvent, AuditRecord};
use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT,
    turn_number INTEGER,
    timestamp TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_session ON audit_log(session_id, turn_number);
";

enum Command {
    Append(AuditRecord),
    Flush(oneshot::Sender<std::result::Result<(), String>>),
}

/// Durable audit log
pub struct SqliteEventLog {
    pool: Pool,
    tx: mpsc::UnboundedSender<Command>,
    path: Option<PathBuf>,
}

/// Row as written: (session_id, turn_number, timestamp, kind, payload)
type AuditRow = (Option<String>, Option<i64>, String, String, String);

impl SqliteEventLog {
    /// Open (or create) the log at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::open_internal(path.to_string_lossy().into_owned(), Some(path.to_path_buf())).await
    }

    /// Shared-cache in-memory database; all pool connections see the same data
    pub async fn open_in_memory() -> Result<Self> {
        let uri = format!(
            "file:audit_{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        Self::open_internal(uri, None).await
    }

    async fn open_internal(conn_str: String, path: Option<PathBuf>) -> Result<Self> {
        let pool = Config::new(conn_str)
            .builder(Runtime::Tokio1)
            .map_err(|e| CadenceError::Other(format!("Failed to create pool builder: {e}")))?
            .max_size(4)
            .post_create(make_post_create_hook(path.is_some()))
            .build()
            .map_err(|e| CadenceError::Other(format!("Failed to build connection pool: {e}")))?;

        interact(&pool, |conn| conn.execute_batch(SCHEMA)).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(pool.clone(), rx));

        tracing::debug!(path = ?path, "Audit log opened");
        Ok(Self { pool, tx, path })
    }

    /// Database file path (None for in-memory)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// All records for a session, in append order
    pub async fn query_session(&self, session_id: &str) -> Result<Vec<AuditRecord>> {
        let session_id = session_id.to_string();
        let rows = interact(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, turn_number, timestamp, kind, payload
                 FROM audit_log WHERE session_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([session_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<rusqlite::Result<Vec<AuditRow>>>()?;
            Ok(rows)
        })
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Number of records per kind
    pub async fn count_by_kind(&self) -> Result<Vec<(String, u64)>> {
        interact(&self.pool, |conn| {
            let mut stmt =
                conn.prepare("SELECT kind, COUNT(*) FROM audit_log GROUP BY kind ORDER BY kind")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

#[async_trait]
impl EventSink for SqliteEventLog {
    fn append(&self, record: AuditRecord) {
        if self.tx.send(Command::Append(record)).is_err() {
            tracing::warn!("Audit writer stopped, record dropped");
        }
    }

    async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .map_err(|_| CadenceError::Other("audit writer stopped".into()))?;
        done_rx
            .await
            .map_err(|_| CadenceError::Other("audit writer stopped".into()))?
            .map_err(CadenceError::Other)
    }
}

async fn run_writer(pool: Pool, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::new();
        let mut waiters = Vec::new();

        let mut take = |cmd: Command| match cmd {
            Command::Append(record) => batch.push(record),
            Command::Flush(done) => waiters.push(done),
        };
        take(first);
        while let Ok(cmd) = rx.try_recv() {
            take(cmd);
        }

        let outcome = if batch.is_empty() {
            Ok(())
        } else {
            let count = batch.len();
            match write_batch(&pool, batch).await {
                Ok(()) => {
                    tracing::trace!(count, "Audit batch written");
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!(count, error = %e, "Audit batch write failed");
                    Err(e.to_string())
                }
            }
        };

        for done in waiters {
            let _ = done.send(outcome.clone());
        }
    }
    tracing::debug!("Audit writer shutting down");
}

async fn write_batch(pool: &Pool, batch: Vec<AuditRecord>) -> Result<()> {
    let rows = batch
        .into_iter()
        .map(|r| {
            Ok((
                r.session_id,
                r.turn_number.map(|t| t as i64),
                r.timestamp,
                r.event.kind().to_string(),
                serde_json::to_string(&r.event)?,
            ))
        })
        .collect::<Result<Vec<AuditRow>>>()?;

    interact(pool, move |conn| {
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO audit_log (session_id, turn_number, timestamp, kind, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (session_id, turn_number, timestamp, kind, payload) in &rows {
                stmt.execute(rusqlite::params![session_id, turn_number, timestamp, kind, payload])?;
            }
        }
        tx.commit()
    })
    .await
}

fn row_to_record(row: AuditRow) -> Result<AuditRecord> {
    let (session_id, turn_number, timestamp, _kind, payload) = row;
    let event: AuditEvent = serde_json::from_str(&payload)?;
    Ok(AuditRecord {
        session_id,
        turn_number: turn_number.map(|t| t as u64),
        timestamp,
        event,
    })
}

/// Run a closure on a pooled connection (off the async runtime)
async fn interact<F, R>(pool: &Pool, f: F) -> Result<R>
where
    F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
    R: Send + 'static,
{
    let conn = pool
        .get()
        .await
        .map_err(|e| CadenceError::Other(format!("Failed to get connection: {e}")))?;
    let result = conn
        .interact(move |conn| f(conn))
        .await
        .map_err(|e| CadenceError::Other(format!("interact failed: {e}")))??;
    Ok(result)
}

/// WAL + busy timeout for files; busy timeout only for shared memory
fn make_post_create_hook(file_backed: bool) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        Box::pin(async move {
            conn.interact(move |conn| {
                if file_backed {
                    conn.execute_batch(
                        "PRAGMA journal_mode=WAL; \
                         PRAGMA busy_timeout=5000; \
                         PRAGMA synchronous=NORMAL;",
                    )
                } else {
                    conn.execute_batch("PRAGMA busy_timeout=5000;")
                }
            })
            .await
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into())
            })?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}
