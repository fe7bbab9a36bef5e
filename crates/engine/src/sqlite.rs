//! SQLite-backed checkpointer.
//!
//! Threads are stored as JSON columns; pending writes live in a sidecar
//! table keyed by `(thread_id, etag)`. The schema is bootstrapped on open.

use crate::checkpoint::{AgentThread, Checkpointer};
use crate::error::EngineError;
use crate::state::PendingWrite;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS threads (
    id              TEXT PRIMARY KEY,
    messages        TEXT NOT NULL,
    execution_state TEXT,
    last_reduction  TEXT,
    conversation_id TEXT,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_writes (
    thread_id     TEXT NOT NULL,
    etag          TEXT NOT NULL,
    call_id       TEXT NOT NULL,
    function_name TEXT NOT NULL,
    result_json   TEXT NOT NULL,
    completed_at  INTEGER NOT NULL,
    iteration     INTEGER NOT NULL,
    PRIMARY KEY (thread_id, etag, call_id)
);
";

pub struct SqliteCheckpointer {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointer {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn sql_err(err: rusqlite::Error) -> EngineError {
    EngineError::Checkpoint(err.to_string())
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    async fn save_thread(&self, thread: &AgentThread) -> Result<(), EngineError> {
        let messages = serde_json::to_string(&thread.messages)?;
        let last_reduction = thread
            .last_reduction
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO threads (id, messages, execution_state, last_reduction, conversation_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                messages = excluded.messages,
                execution_state = excluded.execution_state,
                last_reduction = excluded.last_reduction,
                conversation_id = excluded.conversation_id,
                updated_at = excluded.updated_at",
            params![
                thread.id,
                messages,
                thread.execution_state,
                last_reduction,
                thread.conversation_id,
                now
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn load_thread(&self, thread_id: &str) -> Result<Option<AgentThread>, EngineError> {
        let conn = self.conn.lock();
        let row: Option<(String, Option<String>, Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT messages, execution_state, last_reduction, conversation_id
                 FROM threads WHERE id = ?1",
                params![thread_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .optional()
            .map_err(sql_err)?;

        let Some((messages, execution_state, last_reduction, conversation_id)) = row else {
            return Ok(None);
        };

        Ok(Some(AgentThread {
            id: thread_id.to_string(),
            messages: serde_json::from_str(&messages)?,
            execution_state,
            last_reduction: last_reduction
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            conversation_id,
        }))
    }

    async fn save_pending_writes(
        &self,
        thread_id: &str,
        etag: &str,
        writes: &[PendingWrite],
    ) -> Result<(), EngineError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        for write in writes {
            tx.execute(
                "INSERT OR REPLACE INTO pending_writes
                 (thread_id, etag, call_id, function_name, result_json, completed_at, iteration)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    thread_id,
                    etag,
                    write.call_id,
                    write.function_name,
                    serde_json::to_string(&write.result_json)?,
                    write.completed_at,
                    write.iteration
                ],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    async fn load_pending_writes(
        &self,
        thread_id: &str,
        etag: &str,
    ) -> Result<Vec<PendingWrite>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT call_id, function_name, result_json, completed_at, iteration
                 FROM pending_writes WHERE thread_id = ?1 AND etag = ?2
                 ORDER BY completed_at, call_id",
            )
            .map_err(sql_err)?;

        let rows = stmt
            .query_map(params![thread_id, etag], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, u32>(4)?,
                ))
            })
            .map_err(sql_err)?;

        let mut writes = Vec::new();
        for row in rows {
            let (call_id, function_name, result_json, completed_at, iteration) =
                row.map_err(sql_err)?;
            writes.push(PendingWrite {
                call_id,
                function_name,
                result_json: serde_json::from_str(&result_json)?,
                completed_at,
                iteration,
                thread_id: thread_id.to_string(),
            });
        }
        Ok(writes)
    }

    async fn delete_pending_writes(&self, thread_id: &str, etag: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM pending_writes WHERE thread_id = ?1 AND etag = ?2",
            params![thread_id, etag],
        )
        .map_err(sql_err)?;
        Ok(())
    }
}
