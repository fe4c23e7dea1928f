mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::dispatch::call::SerializedCallRequest;
use crate::dispatch::task::{TaskError, TaskState};
use crate::scheduling::schedule::Schedule;
use crate::shared::ids::{CallId, ScheduleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create store database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to encode {kind} document `{id}`: {source}")]
    Encode {
        kind: &'static str,
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode {kind} document `{id}`: {source}")]
    Decode {
        kind: &'static str,
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Persisted form of a queued or archived task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDocument {
    pub request: SerializedCallRequest,
    pub state: TaskState,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<TaskError>,
}

/// Document store for task and schedule records, keyed by id.
pub trait DispatchStore: Send + Sync {
    fn save_task(&self, doc: &TaskDocument) -> Result<(), StoreError>;
    fn load_task(&self, id: &CallId) -> Result<Option<TaskDocument>, StoreError>;
    fn remove_task(&self, id: &CallId) -> Result<bool, StoreError>;
    /// Task documents ordered by enqueue time.
    fn list_tasks(&self) -> Result<Vec<TaskDocument>, StoreError>;

    fn save_schedule(&self, schedule: &Schedule) -> Result<(), StoreError>;
    fn load_schedule(&self, id: &ScheduleId) -> Result<Option<Schedule>, StoreError>;
    fn remove_schedule(&self, id: &ScheduleId) -> Result<bool, StoreError>;
    /// Schedules ordered by creation time.
    fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError>;
}
