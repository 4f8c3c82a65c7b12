//! Archival of finished run contexts, keyed by run id.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::context::PipelineContext;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("context encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

pub trait RunStore: Send + Sync {
    /// Inserts or replaces the context for its run id.
    fn archive(&self, context: &PipelineContext) -> Result<(), StoreError>;

    fn load(&self, run_id: Uuid) -> Result<Option<PipelineContext>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    contexts: Mutex<HashMap<Uuid, PipelineContext>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RunStore for InMemoryRunStore {
    fn archive(&self, context: &PipelineContext) -> Result<(), StoreError> {
        let mut contexts = self.contexts.lock().map_err(|_| StoreError::Poisoned)?;
        contexts.insert(context.run_id(), context.clone());
        info!(
            component = "store",
            event = "store.context.archived",
            backend = "memory",
            run_id = %context.run_id()
        );
        Ok(())
    }

    fn load(&self, run_id: Uuid) -> Result<Option<PipelineContext>, StoreError> {
        let contexts = self.contexts.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(contexts.get(&run_id).cloned())
    }
}

pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        create_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM run_contexts", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS run_contexts (
            run_id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            state TEXT NOT NULL,
            created_at TEXT NOT NULL,
            context_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS run_contexts_session ON run_contexts(session_id);
        ",
    )?;
    Ok(())
}

impl RunStore for SqliteRunStore {
    fn archive(&self, context: &PipelineContext) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(context)?;
        let state = serde_json::to_value(context.state())?;
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "
            INSERT INTO run_contexts (run_id, session_id, state, created_at, context_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(run_id) DO UPDATE SET
                session_id = excluded.session_id,
                state = excluded.state,
                created_at = excluded.created_at,
                context_json = excluded.context_json
            ",
            params![
                context.run_id().to_string(),
                context.session_id(),
                state.as_str().unwrap_or_default(),
                context.created_at().to_rfc3339(),
                encoded,
            ],
        )?;
        info!(
            component = "store",
            event = "store.context.archived",
            backend = "sqlite",
            run_id = %context.run_id()
        );
        Ok(())
    }

    fn load(&self, run_id: Uuid) -> Result<Option<PipelineContext>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let encoded: Option<String> = conn
            .query_row(
                "SELECT context_json FROM run_contexts WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        encoded
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_round_trips() {
        let store = InMemoryRunStore::new();
        let ctx = PipelineContext::new(Uuid::new_v4(), "s-1");
        assert!(store.is_empty());
        store.archive(&ctx).unwrap();
        store.archive(&ctx).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load(ctx.run_id()).unwrap(), Some(ctx));
        assert_eq!(store.load(Uuid::new_v4()).unwrap(), None);
    }
}
