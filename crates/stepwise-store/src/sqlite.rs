use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::ProcessStorage;
use stepwise_core::types::{ProcessStateRecord, StepState};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS process_state (
        process_name TEXT NOT NULL,
        process_id TEXT NOT NULL,
        record_json TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (process_name, process_id)
    );

    CREATE TABLE IF NOT EXISTS step_state (
        step_name TEXT NOT NULL,
        step_id TEXT NOT NULL,
        state_json TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (step_name, step_id)
    );";

fn db_err(e: rusqlite::Error) -> StepwiseError {
    StepwiseError::Storage(e.to_string())
}

/// SQLite-backed process storage. Records are stored as JSON.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StepwiseError::Storage(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite process storage opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ProcessStorage for SqliteStorage {
    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StepwiseError::Storage(e.to_string()))?;
            conn.execute_batch(SCHEMA).map_err(db_err)
        })
    }

    fn get_process_state<'a>(
        &'a self,
        process_name: &'a str,
        instance_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ProcessStateRecord>>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StepwiseError::Storage(e.to_string()))?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT record_json FROM process_state
                     WHERE process_name = ?1 AND process_id = ?2",
                    params![process_name, instance_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            json.map(|j| serde_json::from_str(&j).map_err(StepwiseError::from))
                .transpose()
        })
    }

    fn save_process_state<'a>(
        &'a self,
        process_name: &'a str,
        instance_id: &'a str,
        record: &'a ProcessStateRecord,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_string(record)?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| StepwiseError::Storage(e.to_string()))?;
            conn.execute(
                "INSERT INTO process_state (process_name, process_id, record_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(process_name, process_id)
                 DO UPDATE SET record_json = excluded.record_json,
                               updated_at = excluded.updated_at",
                params![process_name, instance_id, json, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            debug!(process = process_name, id = instance_id, "Saved process record");
            Ok(())
        })
    }

    fn get_step_state<'a>(
        &'a self,
        step_name: &'a str,
        step_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<StepState>>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StepwiseError::Storage(e.to_string()))?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT state_json FROM step_state WHERE step_name = ?1 AND step_id = ?2",
                    params![step_name, step_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            json.map(|j| serde_json::from_str(&j).map_err(StepwiseError::from))
                .transpose()
        })
    }

    fn save_step_state<'a>(&'a self, state: &'a StepState) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let json = serde_json::to_string(state)?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| StepwiseError::Storage(e.to_string()))?;
            conn.execute(
                "INSERT INTO step_state (step_name, step_id, state_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(step_name, step_id)
                 DO UPDATE SET state_json = excluded.state_json,
                               updated_at = excluded.updated_at",
                params![state.name, state.id, json, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StepwiseError::Storage(e.to_string()))?;
            // Fold the WAL back into the main file.
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
                .map_err(db_err)
        })
    }
}
