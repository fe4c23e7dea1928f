use super::{DispatchStore, StoreError, TaskDocument};
use crate::scheduling::schedule::Schedule;
use crate::shared::ids::{CallId, ScheduleId};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};

/// SQLite-backed store. Documents are JSON text keyed by id; a connection is
/// opened per operation so the store can be shared across threads.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS queued_calls (
                    task_id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    enqueued_at INTEGER NOT NULL,
                    document TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS schedules (
                    schedule_id TEXT PRIMARY KEY,
                    next_run INTEGER,
                    created_at INTEGER NOT NULL,
                    document TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_queued_calls_enqueued
                    ON queued_calls(enqueued_at);
                CREATE INDEX IF NOT EXISTS idx_schedules_created
                    ON schedules(created_at);
                ",
            )
            .map_err(|source| StoreError::Sql { source })
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let connection = Connection::open(&self.db_path).map_err(|source| StoreError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|source| StoreError::Sql { source })?;
        Ok(connection)
    }

    fn list_documents(&self, query: &str) -> Result<Vec<(String, String)>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(query)
            .map_err(|source| StoreError::Sql { source })?;
        let rows = statement
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|source| StoreError::Sql { source })?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|source| StoreError::Sql { source })
    }
}

fn encode<T: serde::Serialize>(kind: &'static str, id: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Encode {
        kind,
        id: id.to_string(),
        source,
    })
}

fn decode<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    id: &str,
    raw: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|source| StoreError::Decode {
        kind,
        id: id.to_string(),
        source,
    })
}

impl DispatchStore for SqliteStore {
    fn save_task(&self, doc: &TaskDocument) -> Result<(), StoreError> {
        let id = doc.request.id.as_str();
        let document = encode("task", id, doc)?;
        self.connect()?
            .execute(
                "INSERT INTO queued_calls (task_id, state, enqueued_at, document)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(task_id) DO UPDATE SET
                    state = excluded.state,
                    document = excluded.document",
                params![
                    id,
                    doc.state.to_string(),
                    doc.enqueued_at.timestamp_micros(),
                    document
                ],
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(())
    }

    fn load_task(&self, id: &CallId) -> Result<Option<TaskDocument>, StoreError> {
        let raw: Option<String> = self
            .connect()?
            .query_row(
                "SELECT document FROM queued_calls WHERE task_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|source| StoreError::Sql { source })?;
        raw.map(|raw| decode("task", id.as_str(), &raw)).transpose()
    }

    fn remove_task(&self, id: &CallId) -> Result<bool, StoreError> {
        let removed = self
            .connect()?
            .execute(
                "DELETE FROM queued_calls WHERE task_id = ?1",
                params![id.as_str()],
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(removed > 0)
    }

    fn list_tasks(&self) -> Result<Vec<TaskDocument>, StoreError> {
        self.list_documents(
            "SELECT task_id, document FROM queued_calls ORDER BY enqueued_at ASC, task_id ASC",
        )?
        .into_iter()
        .map(|(id, raw)| decode("task", &id, &raw))
        .collect()
    }

    fn save_schedule(&self, schedule: &Schedule) -> Result<(), StoreError> {
        let id = schedule.id.as_str();
        let document = encode("schedule", id, schedule)?;
        self.connect()?
            .execute(
                "INSERT INTO schedules (schedule_id, next_run, created_at, document)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(schedule_id) DO UPDATE SET
                    next_run = excluded.next_run,
                    document = excluded.document",
                params![
                    id,
                    schedule.next_run.map(|at| at.timestamp()),
                    schedule.created_at.timestamp_micros(),
                    document
                ],
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(())
    }

    fn load_schedule(&self, id: &ScheduleId) -> Result<Option<Schedule>, StoreError> {
        let raw: Option<String> = self
            .connect()?
            .query_row(
                "SELECT document FROM schedules WHERE schedule_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|source| StoreError::Sql { source })?;
        raw.map(|raw| decode("schedule", id.as_str(), &raw))
            .transpose()
    }

    fn remove_schedule(&self, id: &ScheduleId) -> Result<bool, StoreError> {
        let removed = self
            .connect()?
            .execute(
                "DELETE FROM schedules WHERE schedule_id = ?1",
                params![id.as_str()],
            )
            .map_err(|source| StoreError::Sql { source })?;
        Ok(removed > 0)
    }

    fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        self.list_documents(
            "SELECT schedule_id, document FROM schedules ORDER BY created_at ASC, schedule_id ASC",
        )?
        .into_iter()
        .map(|(id, raw)| decode("schedule", &id, &raw))
        .collect()
    }
}
