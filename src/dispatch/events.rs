use super::task::TaskState;
use crate::shared::ids::{CallId, ScheduleId};
use crate::shared::logging::append_line;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    #[serde(rename_all = "camelCase")]
    TaskTransition {
        task_id: CallId,
        old_state: TaskState,
        new_state: TaskState,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    MissedSchedule {
        schedule_id: ScheduleId,
        skipped_intervals: u32,
        timestamp: DateTime<Utc>,
    },
}

/// Observability sink. Emission must not fail the caller, so implementations
/// swallow their own errors.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &DispatchEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: &DispatchEvent) {}
}

/// Appends one JSON object per event to a file, typically `logs/events.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlEventSink {
    path: PathBuf,
}

impl JsonlEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlEventSink {
    fn emit(&self, event: &DispatchEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let _ = append_line(&self.path, &line);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<DispatchEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DispatchEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// `(old, new)` pairs recorded for one task, in emission order.
    pub fn transitions_for(&self, task_id: &CallId) -> Vec<(TaskState, TaskState)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DispatchEvent::TaskTransition {
                    task_id: id,
                    old_state,
                    new_state,
                    ..
                } if &id == task_id => Some((old_state, new_state)),
                _ => None,
            })
            .collect()
    }

    pub fn missed_schedules(&self) -> Vec<(ScheduleId, u32)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                DispatchEvent::MissedSchedule {
                    schedule_id,
                    skipped_intervals,
                    ..
                } => Some((schedule_id, skipped_intervals)),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: &DispatchEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn jsonl_sink_writes_tagged_events() {
        let dir = tempdir().expect("tempdir");
        let sink = JsonlEventSink::new(dir.path().join("logs/events.jsonl"));
        let task_id = CallId::generate();
        sink.emit(&DispatchEvent::TaskTransition {
            task_id: task_id.clone(),
            old_state: TaskState::Waiting,
            new_state: TaskState::Running,
            timestamp: Utc::now(),
        });
        sink.emit(&DispatchEvent::MissedSchedule {
            schedule_id: ScheduleId::generate(),
            skipped_intervals: 3,
            timestamp: Utc::now(),
        });

        let raw = std::fs::read_to_string(sink.path()).expect("read events");
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|line| serde_json::from_str(line).expect("json"))
            .collect();
        assert_eq!(lines[0]["event"], "task_transition");
        assert_eq!(lines[0]["taskId"], task_id.as_str());
        assert_eq!(lines[0]["newState"], "running");
        assert_eq!(lines[1]["event"], "missed_schedule");
        assert_eq!(lines[1]["skippedIntervals"], 3);
    }

    #[test]
    fn memory_sink_filters_by_task() {
        let sink = MemoryEventSink::new();
        let a = CallId::generate();
        let b = CallId::generate();
        for (id, old, new) in [
            (&a, TaskState::Waiting, TaskState::Running),
            (&b, TaskState::Waiting, TaskState::Canceled),
            (&a, TaskState::Running, TaskState::Finished),
        ] {
            sink.emit(&DispatchEvent::TaskTransition {
                task_id: id.clone(),
                old_state: old,
                new_state: new,
                timestamp: Utc::now(),
            });
        }
        assert_eq!(
            sink.transitions_for(&a),
            vec![
                (TaskState::Waiting, TaskState::Running),
                (TaskState::Running, TaskState::Finished)
            ]
        );
        assert!(sink.missed_schedules().is_empty());
    }
}
