use super::WorkerEvent;
use crate::shared::logging::DispatchLog;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Stopped,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub state: WorkerState,
    pub last_heartbeat: Option<i64>,
    pub last_error: Option<String>,
}

/// Folds one worker event into the health table and mirrors it to the log.
pub(crate) fn apply_worker_event(
    log: &DispatchLog,
    workers: &mut BTreeMap<String, WorkerHealth>,
    event: WorkerEvent,
) {
    match event {
        WorkerEvent::Started { worker_id, at } => {
            let entry = workers.entry(worker_id.clone()).or_default();
            entry.state = WorkerState::Running;
            entry.last_heartbeat = Some(at);
            log.append("info", "worker.started", &worker_id);
        }
        WorkerEvent::Heartbeat { worker_id, at } => {
            let entry = workers.entry(worker_id).or_default();
            if entry.state != WorkerState::Error {
                entry.state = WorkerState::Running;
            }
            entry.last_heartbeat = Some(at);
        }
        WorkerEvent::Error {
            worker_id,
            at,
            message,
            fatal,
        } => {
            let entry = workers.entry(worker_id.clone()).or_default();
            entry.state = WorkerState::Error;
            entry.last_heartbeat = Some(at);
            entry.last_error = Some(message.clone());
            log.append(
                if fatal { "error" } else { "warn" },
                "worker.error",
                &format!("{worker_id}: {message}"),
            );
        }
        WorkerEvent::Stopped { worker_id, at } => {
            let entry = workers.entry(worker_id.clone()).or_default();
            if entry.state != WorkerState::Error {
                entry.state = WorkerState::Stopped;
            }
            entry.last_heartbeat = Some(at);
            log.append("info", "worker.stopped", &worker_id);
        }
    }
}
