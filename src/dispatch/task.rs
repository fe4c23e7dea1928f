use super::call::{CallRequest, LifecycleEvent};
use super::events::{DispatchEvent, EventSink, NullEventSink};
use super::job::{Job, JobContext, JobError};
use super::DispatchError;
use crate::shared::ids::{CallId, GroupId, JobName, ScheduleId};
use crate::shared::logging::DispatchLog;
use crate::store::{DispatchStore, MemoryStore, TaskDocument};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Running,
    Finished,
    Error,
    Canceled,
}

impl TaskState {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (TaskState::Waiting, TaskState::Running)
                | (TaskState::Waiting, TaskState::Error)
                | (TaskState::Waiting, TaskState::Canceled)
                | (TaskState::Running, TaskState::Finished)
                | (TaskState::Running, TaskState::Error)
                | (TaskState::Running, TaskState::Canceled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Error | TaskState::Canceled
        )
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("unknown task state `{raw}`")),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Waiting => write!(f, "waiting"),
            TaskState::Running => write!(f, "running"),
            TaskState::Finished => write!(f, "finished"),
            TaskState::Error => write!(f, "error"),
            TaskState::Canceled => write!(f, "canceled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    CallFailed,
    Timeout,
    DependencyFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    /// Cause chain, outermost first.
    #[serde(default)]
    pub detail: Vec<String>,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: Vec::new(),
        }
    }

    pub fn call_failed(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::CallFailed, message)
    }

    pub fn from_job_error(err: &JobError) -> Self {
        let mut detail = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            detail.push(cause.to_string());
            source = cause.source();
        }
        Self {
            kind: TaskErrorKind::CallFailed,
            message: err.to_string(),
            detail,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Point-in-time view of a task handed to callbacks and query callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub task_id: CallId,
    pub job: JobName,
    pub call: String,
    pub state: TaskState,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub schedule_id: Option<ScheduleId>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub asynchronous: bool,
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

/// Collaborators every task reports to: the event sink, the task document
/// store and the dispatch log.
#[derive(Clone)]
pub struct DispatchContext {
    pub sink: Arc<dyn EventSink>,
    pub store: Arc<dyn DispatchStore>,
    pub log: DispatchLog,
}

impl DispatchContext {
    pub fn new(sink: Arc<dyn EventSink>, store: Arc<dyn DispatchStore>, log: DispatchLog) -> Self {
        Self { sink, store, log }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(NullEventSink),
            Arc::new(MemoryStore::new()),
            DispatchLog::disabled(),
        )
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }
}

#[derive(Debug)]
struct TaskInner {
    state: TaskState,
    enqueued_at: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    finish_time: Option<DateTime<Utc>>,
    progress: Option<Value>,
    result: Option<Value>,
    error: Option<TaskError>,
}

/// Execution wrapper around exactly one call request.
pub struct Task {
    request: CallRequest,
    cancel_flag: Arc<AtomicBool>,
    inner: Mutex<TaskInner>,
    ctx: DispatchContext,
}

impl Task {
    pub fn new(request: CallRequest, ctx: DispatchContext) -> Self {
        Self {
            request,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(TaskInner {
                state: TaskState::Waiting,
                enqueued_at: Utc::now(),
                start_time: None,
                finish_time: None,
                progress: None,
                result: None,
                error: None,
            }),
            ctx,
        }
    }

    pub fn id(&self) -> &CallId {
        self.request.id()
    }

    pub fn request(&self) -> &CallRequest {
        &self.request
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.lock().start_time
    }

    pub fn finish_time(&self) -> Option<DateTime<Utc>> {
        self.lock().finish_time
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    pub fn set_progress(&self, progress: Value) {
        self.lock().progress = Some(progress);
    }

    pub fn report(&self) -> TaskReport {
        let inner = self.lock();
        TaskReport {
            task_id: self.request.id().clone(),
            job: self.request.job().clone(),
            call: self.request.describe(),
            state: inner.state,
            group_id: self.request.group_id().cloned(),
            schedule_id: self.request.schedule_id().cloned(),
            tags: self.request.tags().to_vec(),
            asynchronous: self.request.asynchronous(),
            enqueued_at: inner.enqueued_at,
            start_time: inner.start_time,
            finish_time: inner.finish_time,
            progress: inner.progress.clone(),
            result: inner.result.clone(),
            error: inner.error.clone(),
        }
    }

    pub fn document(&self) -> TaskDocument {
        let inner = self.lock();
        TaskDocument {
            request: self.request.to_serialized(),
            state: inner.state,
            enqueued_at: inner.enqueued_at,
            start_time: inner.start_time,
            finish_time: inner.finish_time,
            progress: inner.progress.clone(),
            result: inner.result.clone(),
            error: inner.error.clone(),
        }
    }

    /// Executes the job. Returns without touching the task if it is no longer
    /// waiting (canceled or failed before a worker picked it up).
    pub fn run(&self, job: &dyn Job) {
        if !self.transition(TaskState::Running, |inner| {
            inner.start_time = Some(Utc::now());
        }) {
            return;
        }
        self.fire(LifecycleEvent::RunStart);

        let ctx = JobContext::new(self);
        let outcome = catch_unwind(AssertUnwindSafe(|| job.run(&ctx, self.request.args())));
        match outcome {
            Ok(Ok(_)) if self.request.asynchronous() => {
                self.ctx.log.append(
                    "info",
                    "task.awaiting_reply",
                    &format!("task={} call={}", self.id(), self.request.describe()),
                );
            }
            Ok(Ok(result)) => {
                self.succeed(result);
            }
            Ok(Err(err)) => {
                self.fail(TaskError::from_job_error(&err));
            }
            Err(payload) => {
                self.fail(TaskError::call_failed(format!(
                    "job panicked: {}",
                    panic_message(payload.as_ref())
                )));
            }
        }
    }

    /// `RUNNING -> FINISHED`. Returns `false` when the task already settled.
    pub fn succeed(&self, result: Value) -> bool {
        let finished = self.transition(TaskState::Finished, |inner| {
            inner.finish_time = Some(Utc::now());
            inner.result = Some(result);
        });
        if finished {
            self.fire(LifecycleEvent::Success);
            self.fire(LifecycleEvent::Complete);
        }
        finished
    }

    /// Moves a waiting or running task to `ERROR`. Returns `false` when the
    /// task already settled.
    pub fn fail(&self, error: TaskError) -> bool {
        let failed = self.transition(TaskState::Error, |inner| {
            inner.finish_time = Some(Utc::now());
            inner.error = Some(error);
        });
        if failed {
            self.fire(LifecycleEvent::Failure);
            self.fire(LifecycleEvent::Complete);
        }
        failed
    }

    /// Returns `Ok(false)` if the task already reached a terminal state.
    /// A waiting task is canceled only if it is still waiting at the moment
    /// of the transition; once a worker has started it, the running rules
    /// apply instead.
    pub fn cancel(&self) -> Result<bool, DispatchError> {
        loop {
            match self.state() {
                state if state.is_terminal() => return Ok(false),
                TaskState::Waiting => {
                    if self.settle_canceled(TaskState::Waiting) {
                        return Ok(true);
                    }
                }
                _ => {
                    self.run_cancel_hook()?;
                    return Ok(self.settle_canceled(TaskState::Running));
                }
            }
        }
    }

    fn run_cancel_hook(&self) -> Result<(), DispatchError> {
        let hook = self
            .request
            .cancel_hook()
            .ok_or_else(|| DispatchError::NotCancelable {
                task_id: self.id().to_string(),
            })?;
        let report = self.report();
        let outcome = catch_unwind(AssertUnwindSafe(|| hook(&report))).unwrap_or_else(|payload| {
            Err(format!("hook panicked: {}", panic_message(payload.as_ref())))
        });
        outcome.map_err(|message| DispatchError::HookFailed {
            task_id: self.id().to_string(),
            message,
        })
    }

    /// `from -> CANCELED`, only while the task is still in `from`.
    fn settle_canceled(&self, from: TaskState) -> bool {
        let canceled = self.transition_from(from, TaskState::Canceled, |inner| {
            inner.finish_time = Some(Utc::now());
        });
        if canceled {
            self.cancel_flag.store(true, Ordering::SeqCst);
            self.fire(LifecycleEvent::Cancel);
            self.fire(LifecycleEvent::Complete);
        }
        canceled
    }

    pub(crate) fn fire(&self, event: LifecycleEvent) {
        let callbacks = self.request.callbacks(event);
        if callbacks.is_empty() {
            return;
        }
        let report = self.report();
        for callback in callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(&report))) {
                self.ctx.log.append(
                    "error",
                    "task.callback_panicked",
                    &format!(
                        "task={} callback={} error={}",
                        self.id(),
                        event,
                        panic_message(payload.as_ref())
                    ),
                );
            }
        }
    }

    pub(crate) fn persist(&self) {
        if let Err(err) = self.ctx.store.save_task(&self.document()) {
            self.ctx.log.append(
                "error",
                "task.persist_failed",
                &format!("task={} error={err}", self.id()),
            );
        }
    }

    fn transition(&self, next: TaskState, apply: impl FnOnce(&mut TaskInner)) -> bool {
        self.transition_when(|_| true, next, apply)
    }

    fn transition_from(
        &self,
        expected: TaskState,
        next: TaskState,
        apply: impl FnOnce(&mut TaskInner),
    ) -> bool {
        self.transition_when(|old| old == expected, next, apply)
    }

    /// Checks the current state and moves to `next` under one lock.
    fn transition_when(
        &self,
        accept: impl FnOnce(TaskState) -> bool,
        next: TaskState,
        apply: impl FnOnce(&mut TaskInner),
    ) -> bool {
        let old = {
            let mut inner = self.lock();
            let old = inner.state;
            if !accept(old) || !old.can_transition_to(next) {
                return false;
            }
            inner.state = next;
            apply(&mut inner);
            old
        };
        self.ctx.sink.emit(&DispatchEvent::TaskTransition {
            task_id: self.id().clone(),
            old_state: old,
            new_state: next,
            timestamp: Utc::now(),
        });
        self.persist();
        true
    }

    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic payload".to_string()
}
