use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};

use marshal_core::error::{MarshalError, Result};
use marshal_core::traits::StateStore;
use marshal_core::types::{RunId, StateMap};

/// Process-local state store. Contents are lost on exit.
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<RunId, StateMap>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, run_id: &RunId, state: &StateMap) -> BoxFuture<'_, Result<()>> {
        let result = self
            .states
            .write()
            .map(|mut s| {
                s.insert(run_id.clone(), state.clone());
            })
            .map_err(|e| MarshalError::Database(e.to_string()));
        Box::pin(async move { result })
    }

    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<StateMap>>> {
        let result = self
            .states
            .read()
            .map(|s| s.get(run_id).cloned())
            .map_err(|e| MarshalError::Database(e.to_string()));
        Box::pin(async move { result })
    }
}

/// Final run states persisted in SQLite, one row per run (latest wins).
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create the state database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| MarshalError::Database(format!("Failed to open state store: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS run_states (
                 run_id TEXT PRIMARY KEY,
                 state_json TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .map_err(|e| MarshalError::Database(format!("Failed to initialize state schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn save_sync(&self, run_id: &RunId, state: &StateMap) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| MarshalError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO run_states (run_id, state_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(run_id) DO UPDATE SET state_json = ?2, updated_at = ?3",
            params![run_id.0, json, Utc::now().to_rfc3339()],
        )
        .map_err(|e| MarshalError::Database(format!("Failed to save state: {}", e)))?;
        Ok(())
    }

    fn load_sync(&self, run_id: &RunId) -> Result<Option<StateMap>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| MarshalError::Database(e.to_string()))?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM run_states WHERE run_id = ?1",
                params![run_id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| MarshalError::Database(format!("Failed to load state: {}", e)))?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }
}

impl StateStore for SqliteStateStore {
    fn save(&self, run_id: &RunId, state: &StateMap) -> BoxFuture<'_, Result<()>> {
        let result = self.save_sync(run_id, state);
        Box::pin(async move { result })
    }

    fn load(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<StateMap>>> {
        let result = self.load_sync(run_id);
        Box::pin(async move { result })
    }
}
