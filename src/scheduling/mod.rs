pub mod dispatcher;
pub mod iso8601;
pub mod schedule;
pub mod scheduler;

pub use dispatcher::{ScheduleDispatcher, DEFAULT_POLL_INTERVAL_SECS};
pub use iso8601::{parse_iso8601_interval, IsoInterval};
pub use schedule::{Schedule, ScheduleOptions, SchedulePatch};
pub use scheduler::{ScheduledRun, Scheduler};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("unknown schedule `{schedule_id}`")]
    UnknownSchedule { schedule_id: String },
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] crate::dispatch::DispatchError),
    #[error("failed to spawn {worker} thread: {source}")]
    Spawn {
        worker: String,
        #[source]
        source: std::io::Error,
    },
}

impl ScheduleError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidSchedule(message.into())
    }
}
