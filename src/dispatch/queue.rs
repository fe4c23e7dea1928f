use super::job::JobRegistry;
use super::resource::ResourceOps;
use super::task::{DispatchContext, Task, TaskError, TaskErrorKind, TaskState};
use super::DispatchError;
use crate::shared::ids::CallId;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_CONCURRENCY: u32 = 4;
pub const DEFAULT_DISPATCH_INTERVAL_MS: u64 = 500;
pub const DEFAULT_ARCHIVE_RETENTION_SECS: u64 = 20;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;
const SHUTDOWN_POLL_MS: u64 = 10;
/// Settled outcomes remembered for dependency checks, independent of how long
/// archived tasks stay queryable.
pub const RETIRED_OUTCOME_LIMIT: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_concurrency: u32,
    pub dispatch_interval: Duration,
    pub archive_retention: Duration,
    pub default_reply_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            dispatch_interval: Duration::from_millis(DEFAULT_DISPATCH_INTERVAL_MS),
            archive_retention: Duration::from_secs(DEFAULT_ARCHIVE_RETENTION_SECS),
            default_reply_timeout: None,
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DependencyStatus {
    Pending,
    Satisfied,
    Failed(TaskState),
    Unknown,
}

#[derive(Debug)]
enum QueueMessage {
    Wake,
    WorkerExited(CallId),
    Shutdown,
}

#[derive(Debug)]
struct Entry {
    task: Arc<Task>,
    weight: u32,
    blockers: BTreeSet<CallId>,
    pending: BTreeSet<CallId>,
    failed_dependency: Option<CallId>,
    started: bool,
    worker_active: bool,
}

impl Entry {
    fn ready(&self) -> bool {
        self.blockers.is_empty() && self.pending.is_empty() && self.failed_dependency.is_none()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<CallId, Entry>,
    waiting: VecDeque<CallId>,
    running: HashSet<CallId>,
    running_weight: u32,
    archived: HashMap<CallId, (Arc<Task>, Instant)>,
    retired: Outcomes,
}

/// Final states of settled calls, oldest evicted first once the limit is hit.
#[derive(Debug, Default)]
struct Outcomes {
    states: HashMap<CallId, TaskState>,
    order: VecDeque<CallId>,
}

impl Outcomes {
    fn record(&mut self, id: CallId, state: TaskState) {
        if self.states.insert(id.clone(), state).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > RETIRED_OUTCOME_LIMIT {
            if let Some(oldest) = self.order.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }

    fn get(&self, id: &CallId) -> Option<TaskState> {
        self.states.get(id).copied()
    }
}

/// Work collected under the queue lock and carried out after releasing it, so
/// task callbacks never run while the lock is held.
#[derive(Default)]
struct Plan {
    dropped: Vec<CallId>,
    dependency_failures: Vec<(Arc<Task>, CallId)>,
    timeouts: Vec<(Arc<Task>, Duration)>,
    start: Vec<Arc<Task>>,
}

impl Plan {
    fn is_empty(&self) -> bool {
        self.dropped.is_empty()
            && self.dependency_failures.is_empty()
            && self.timeouts.is_empty()
            && self.start.is_empty()
    }
}

/// Weight-budgeted task queue with one dispatch loop thread. Admission and
/// dispatch share one lock; worker threads only report exit over a channel.
pub struct TaskQueue {
    config: QueueConfig,
    registry: Arc<JobRegistry>,
    ctx: DispatchContext,
    state: Mutex<QueueState>,
    sender: Mutex<Option<Sender<QueueMessage>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    in_flight: Arc<AtomicUsize>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig, registry: Arc<JobRegistry>, ctx: DispatchContext) -> Self {
        Self {
            config,
            registry,
            ctx,
            state: Mutex::new(QueueState::default()),
            sender: Mutex::new(None),
            handle: Mutex::new(None),
            stopping: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub(crate) fn context(&self) -> &DispatchContext {
        &self.ctx
    }

    pub fn start(self: &Arc<Self>) -> Result<(), DispatchError> {
        let mut handle = lock(&self.handle);
        if handle.is_some() {
            return Ok(());
        }
        self.stopping.store(false, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        *lock(&self.sender) = Some(tx);
        let queue = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("tasking-dispatch".to_string())
            .spawn(move || queue.dispatch_loop(rx))
            .map_err(|source| DispatchError::Spawn {
                worker: "dispatch loop".to_string(),
                source,
            })?;
        *handle = Some(spawned);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.handle).is_some() && !self.stopping.load(Ordering::SeqCst)
    }

    /// Stops starting new work, then waits up to the shutdown timeout for
    /// in-flight workers. Waiting tasks stay persisted for recovery.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.send(QueueMessage::Shutdown);
        if let Some(handle) = lock(&self.handle).take() {
            let _ = handle.join();
        }
        *lock(&self.sender) = None;

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(SHUTDOWN_POLL_MS));
        }
        self.ctx.log.append(
            "info",
            "queue.stopped",
            &format!(
                "in_flight={} waiting={}",
                self.in_flight.load(Ordering::SeqCst),
                self.state().waiting.len()
            ),
        );
    }

    pub fn wake(&self) {
        self.send(QueueMessage::Wake);
    }

    pub fn find(&self, id: &CallId) -> Option<Arc<Task>> {
        let state = self.state();
        state
            .entries
            .get(id)
            .map(|entry| Arc::clone(&entry.task))
            .or_else(|| state.archived.get(id).map(|(task, _)| Arc::clone(task)))
    }

    /// Seeds final states of calls settled before this queue existed, so
    /// recovered dependents are judged against them.
    pub(crate) fn remember_outcomes(
        &self,
        outcomes: impl IntoIterator<Item = (CallId, TaskState)>,
    ) {
        let mut state = self.state();
        for (id, outcome) in outcomes {
            state.retired.record(id, outcome);
        }
    }

    /// Active tasks in submission order followed by archived ones.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        let state = self.state();
        let mut running: Vec<&Entry> = state
            .running
            .iter()
            .filter_map(|id| state.entries.get(id))
            .collect();
        running.sort_by_key(|entry| entry.task.report().enqueued_at);
        let mut tasks: Vec<Arc<Task>> = running
            .into_iter()
            .map(|entry| Arc::clone(&entry.task))
            .collect();
        tasks.extend(
            state
                .waiting
                .iter()
                .filter_map(|id| state.entries.get(id))
                .map(|entry| Arc::clone(&entry.task)),
        );
        let mut archived: Vec<&Arc<Task>> = state.archived.values().map(|(task, _)| task).collect();
        archived.sort_by_key(|task| task.report().enqueued_at);
        tasks.extend(archived.into_iter().map(Arc::clone));
        tasks
    }

    pub fn running_weight(&self) -> u32 {
        self.state().running_weight
    }

    pub fn waiting_count(&self) -> usize {
        self.state().waiting.len()
    }

    pub(crate) fn admission(&self) -> Admission<'_> {
        Admission {
            state: self.state(),
            max_concurrency: self.config.max_concurrency,
        }
    }

    /// Post-admission bookkeeping, run after the admission lock is released.
    pub(crate) fn enqueued(&self, tasks: &[Arc<Task>]) {
        for task in tasks {
            task.persist();
            self.ctx.log.append(
                "info",
                "task.enqueued",
                &format!("task={} call={}", task.id(), task.request().describe()),
            );
            task.fire(super::call::LifecycleEvent::Enqueue);
        }
        self.wake();
    }

    fn send(&self, message: QueueMessage) {
        if let Some(sender) = lock(&self.sender).as_ref() {
            let _ = sender.send(message);
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.state)
    }

    fn dispatch_loop(&self, rx: Receiver<QueueMessage>) {
        self.ctx.log.append(
            "info",
            "queue.started",
            &format!("max_concurrency={}", self.config.max_concurrency),
        );
        loop {
            self.pump();
            let message = match rx.recv_timeout(self.config.dispatch_interval) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let mut shutdown = self.handle_message(message);
            while let Ok(message) = rx.try_recv() {
                shutdown |= self.handle_message(message);
            }
            if shutdown {
                break;
            }
        }
    }

    fn handle_message(&self, message: QueueMessage) -> bool {
        match message {
            QueueMessage::Wake => false,
            QueueMessage::WorkerExited(id) => {
                if let Some(entry) = self.state().entries.get_mut(&id) {
                    entry.worker_active = false;
                }
                false
            }
            QueueMessage::Shutdown => true,
        }
    }

    /// Runs dispatch passes until one produces no follow-up work.
    fn pump(&self) {
        loop {
            let plan = self.plan();
            if plan.is_empty() {
                return;
            }
            if !self.apply(plan) {
                return;
            }
        }
    }

    fn plan(&self) -> Plan {
        let mut plan = Plan::default();
        let mut state = self.state();
        let now = Instant::now();

        let settled: Vec<CallId> = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.worker_active && entry.task.state().is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in settled {
            let Some(entry) = state.entries.remove(&id) else {
                continue;
            };
            let outcome = entry.task.state();
            state.waiting.retain(|waiting| waiting != &id);
            state.running.remove(&id);
            if entry.started {
                state.running_weight = state.running_weight.saturating_sub(entry.weight);
            }
            for other in state.entries.values_mut() {
                other.blockers.remove(&id);
                if other.pending.remove(&id) && outcome != TaskState::Finished {
                    other.failed_dependency.get_or_insert_with(|| id.clone());
                }
            }
            state.retired.record(id.clone(), outcome);
            if entry.task.request().archive() {
                state.archived.insert(id.clone(), (entry.task, now));
            } else {
                plan.dropped.push(id.clone());
            }
            self.ctx.log.append(
                "info",
                "task.retired",
                &format!("task={id} state={outcome}"),
            );
        }

        for entry in state.entries.values() {
            if let Some(dependency) = &entry.failed_dependency {
                if entry.task.state() == TaskState::Waiting {
                    plan.dependency_failures
                        .push((Arc::clone(&entry.task), dependency.clone()));
                }
            }
        }

        let wall_clock = Utc::now();
        for id in &state.running {
            let Some(entry) = state.entries.get(id) else {
                continue;
            };
            let request = entry.task.request();
            if entry.worker_active || !request.asynchronous() {
                continue;
            }
            let Some(timeout) = request.reply_timeout().or(self.config.default_reply_timeout)
            else {
                continue;
            };
            let Some(started) = entry.task.start_time() else {
                continue;
            };
            let elapsed = (wall_clock - started).to_std().unwrap_or_default();
            if elapsed >= timeout && entry.task.state() == TaskState::Running {
                plan.timeouts.push((Arc::clone(&entry.task), timeout));
            }
        }

        if !self.stopping.load(Ordering::SeqCst) {
            let mut budget = self
                .config
                .max_concurrency
                .saturating_sub(state.running_weight);
            let mut started = Vec::new();
            for id in &state.waiting {
                let Some(entry) = state.entries.get(id) else {
                    continue;
                };
                if entry.ready()
                    && entry.weight <= budget
                    && entry.task.state() == TaskState::Waiting
                {
                    budget -= entry.weight;
                    started.push(id.clone());
                }
            }
            for id in started {
                let Some(entry) = state.entries.get_mut(&id) else {
                    continue;
                };
                entry.started = true;
                entry.worker_active = true;
                let weight = entry.weight;
                plan.start.push(Arc::clone(&entry.task));
                state.running_weight += weight;
                state.waiting.retain(|waiting| waiting != &id);
                state.running.insert(id);
            }
        }

        let retention = self.config.archive_retention;
        let expired: Vec<CallId> = state
            .archived
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) >= retention)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            state.archived.remove(&id);
            plan.dropped.push(id);
        }

        plan
    }

    /// Returns `true` when the plan changed task states and another pass is due.
    fn apply(&self, plan: Plan) -> bool {
        let mut again = false;
        for id in plan.dropped {
            if let Err(err) = self.ctx.store.remove_task(&id) {
                self.ctx.log.append(
                    "error",
                    "task.remove_failed",
                    &format!("task={id} error={err}"),
                );
            }
        }
        for (task, dependency) in plan.dependency_failures {
            again |= task.fail(TaskError::new(
                TaskErrorKind::DependencyFailed,
                format!("dependency {dependency} did not finish"),
            ));
        }
        for (task, timeout) in plan.timeouts {
            again |= task.fail(TaskError::new(
                TaskErrorKind::Timeout,
                format!("no reply within {}s", timeout.as_secs_f64()),
            ));
        }
        for task in plan.start {
            if let Err(message) = self.spawn_worker(Arc::clone(&task)) {
                if let Some(entry) = self.state().entries.get_mut(task.id()) {
                    entry.worker_active = false;
                }
                self.ctx.log.append(
                    "error",
                    "task.start_failed",
                    &format!("task={} error={message}", task.id()),
                );
                task.fail(TaskError::call_failed(message));
                again = true;
            }
        }
        again
    }

    fn spawn_worker(&self, task: Arc<Task>) -> Result<(), String> {
        let job = self
            .registry
            .get(task.request().job())
            .ok_or_else(|| format!("unknown job `{}`", task.request().job()))?;
        let sender = lock(&self.sender)
            .clone()
            .ok_or_else(|| "task queue is not running".to_string())?;
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);
        let worker_task = Arc::clone(&task);
        let spawned = thread::Builder::new()
            .name(format!("tasking-worker-{}", task.id()))
            .spawn(move || {
                worker_task.run(job.as_ref());
                in_flight.fetch_sub(1, Ordering::SeqCst);
                let _ = sender.send(QueueMessage::WorkerExited(worker_task.id().clone()));
            });
        if let Err(err) = spawned {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(format!("failed to spawn worker thread: {err}"));
        }
        Ok(())
    }
}

/// Queue state held locked for the duration of one admission decision.
pub(crate) struct Admission<'a> {
    state: MutexGuard<'a, QueueState>,
    max_concurrency: u32,
}

impl Admission<'_> {
    /// Resource claims of every non-terminal task, including canceled tasks
    /// whose worker has not exited yet.
    pub(crate) fn claims(&self) -> Vec<(&CallId, &ResourceOps)> {
        self.state
            .entries
            .values()
            .map(|entry| (entry.task.id(), entry.task.request().resources()))
            .collect()
    }

    pub(crate) fn dependency_status(&self, id: &CallId) -> DependencyStatus {
        if let Some(entry) = self.state.entries.get(id) {
            return match entry.task.state() {
                TaskState::Finished if !entry.worker_active => DependencyStatus::Satisfied,
                _ => DependencyStatus::Pending,
            };
        }
        match self.state.retired.get(id) {
            Some(TaskState::Finished) => DependencyStatus::Satisfied,
            Some(state) => DependencyStatus::Failed(state),
            None => DependencyStatus::Unknown,
        }
    }

    pub(crate) fn insert(&mut self, task: Arc<Task>, blockers: BTreeSet<CallId>) {
        let mut pending = BTreeSet::new();
        let mut failed_dependency = None;
        for dependency in task.request().dependencies() {
            match self.dependency_status(dependency) {
                DependencyStatus::Satisfied => {}
                DependencyStatus::Pending | DependencyStatus::Unknown => {
                    pending.insert(dependency.clone());
                }
                DependencyStatus::Failed(_) => {
                    failed_dependency.get_or_insert_with(|| dependency.clone());
                }
            }
        }
        let id = task.id().clone();
        let weight = task.request().weight().min(self.max_concurrency);
        self.state.entries.insert(
            id.clone(),
            Entry {
                task,
                weight,
                blockers,
                pending,
                failed_dependency,
                started: false,
                worker_active: false,
            },
        );
        self.state.waiting.push_back(id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::call::CallRequest;
    use crate::dispatch::job::{job_fn, JobContext};
    use crate::shared::ids::JobName;
    use serde_json::Value;
    use std::sync::mpsc::channel;

    fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {what}");
    }

    /// Registers `gate`, a job that blocks until released through its channel.
    fn gated_queue(config: QueueConfig) -> (Arc<TaskQueue>, Sender<()>) {
        let (release_tx, release_rx) = channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let mut registry = JobRegistry::new();
        registry.register(
            JobName::parse("gate").expect("job"),
            job_fn(move |_: &JobContext<'_>, _| {
                let _ = release_rx.lock().expect("gate").recv();
                Ok(Value::Null)
            }),
        );
        registry.register(JobName::parse("noop").expect("job"), job_fn(|_, _| Ok(Value::Null)));
        let queue = Arc::new(TaskQueue::new(
            config,
            Arc::new(registry),
            DispatchContext::in_memory(),
        ));
        queue.start().expect("start queue");
        (queue, release_tx)
    }

    fn submit(queue: &TaskQueue, job: &str, weight: u32, archive: bool) -> Arc<Task> {
        let request = CallRequest::builder(JobName::parse(job).expect("job"))
            .weight(weight)
            .archive(archive)
            .build()
            .expect("build");
        let task = Arc::new(Task::new(request, queue.context().clone()));
        queue.admission().insert(Arc::clone(&task), BTreeSet::new());
        queue.enqueued(&[Arc::clone(&task)]);
        task
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            max_concurrency: 2,
            dispatch_interval: Duration::from_millis(10),
            ..QueueConfig::default()
        }
    }

    #[test]
    fn weight_budget_limits_running_tasks_and_lighter_tasks_skip_ahead() {
        let (queue, release) = gated_queue(fast_config());
        let first = submit(&queue, "gate", 1, false);
        let heavy = submit(&queue, "gate", 2, false);
        let light = submit(&queue, "gate", 1, false);

        wait_until("first and light running", || {
            first.state() == TaskState::Running && light.state() == TaskState::Running
        });
        assert_eq!(heavy.state(), TaskState::Waiting);
        assert_eq!(queue.running_weight(), 2);

        release.send(()).expect("release");
        release.send(()).expect("release");
        wait_until("heavy running", || heavy.state() == TaskState::Running);
        release.send(()).expect("release");
        wait_until("heavy finished", || heavy.state() == TaskState::Finished);
        queue.shutdown();
    }

    #[test]
    fn oversized_weight_is_clamped_and_runs_alone() {
        let (queue, release) = gated_queue(fast_config());
        let huge = submit(&queue, "gate", 10, false);
        wait_until("clamped task running", || huge.state() == TaskState::Running);
        assert_eq!(queue.running_weight(), 2);
        release.send(()).expect("release");
        wait_until("clamped task finished", || huge.state() == TaskState::Finished);
        queue.shutdown();
    }

    #[test]
    fn zero_weight_tasks_run_even_when_budget_is_spent() {
        let (queue, release) = gated_queue(fast_config());
        let blocker = submit(&queue, "gate", 2, false);
        wait_until("blocker running", || blocker.state() == TaskState::Running);
        let bookkeeping = submit(&queue, "noop", 0, false);
        wait_until("zero weight finished", || {
            bookkeeping.state() == TaskState::Finished
        });
        release.send(()).expect("release");
        queue.shutdown();
    }

    #[test]
    fn archived_tasks_stay_queryable_until_retention_expires() {
        let (queue, _release) = gated_queue(QueueConfig {
            archive_retention: Duration::from_millis(200),
            ..fast_config()
        });
        let kept = submit(&queue, "noop", 1, true);
        let dropped = submit(&queue, "noop", 1, false);
        wait_until("both finished", || {
            kept.state() == TaskState::Finished && dropped.state() == TaskState::Finished
        });
        wait_until("non-archived dropped", || queue.find(dropped.id()).is_none());
        assert!(queue.find(kept.id()).is_some());
        wait_until("archive swept", || queue.find(kept.id()).is_none());
        queue.shutdown();
    }

    #[test]
    fn shutdown_leaves_waiting_tasks_untouched() {
        let (queue, release) = gated_queue(QueueConfig {
            max_concurrency: 1,
            shutdown_timeout: Duration::from_millis(50),
            ..fast_config()
        });
        let running = submit(&queue, "gate", 1, false);
        wait_until("running", || running.state() == TaskState::Running);
        let waiting = submit(&queue, "noop", 1, false);
        queue.shutdown();
        release.send(()).expect("release");
        wait_until("gate finished", || running.state() == TaskState::Finished);

        assert!(!queue.is_running());
        assert_eq!(waiting.state(), TaskState::Waiting);
        assert_eq!(queue.waiting_count(), 1);
    }

    #[test]
    fn settled_outcomes_outlive_archive_retention() {
        let (queue, _release) = gated_queue(QueueConfig {
            archive_retention: Duration::from_millis(50),
            ..fast_config()
        });
        let done = submit(&queue, "noop", 1, false);
        wait_until("released from queue", || {
            done.state() == TaskState::Finished && queue.find(done.id()).is_none()
        });
        thread::sleep(Duration::from_millis(150));
        queue.wake();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(
            queue.admission().dependency_status(done.id()),
            DependencyStatus::Satisfied
        );

        let failed = CallId::generate();
        queue.remember_outcomes([(failed.clone(), TaskState::Error)]);
        assert_eq!(
            queue.admission().dependency_status(&failed),
            DependencyStatus::Failed(TaskState::Error)
        );
        assert_eq!(
            queue.admission().dependency_status(&CallId::generate()),
            DependencyStatus::Unknown
        );
        queue.shutdown();
    }

    #[test]
    fn outcome_record_evicts_oldest_past_its_limit() {
        let mut outcomes = Outcomes::default();
        let first = CallId::generate();
        outcomes.record(first.clone(), TaskState::Finished);
        for _ in 0..RETIRED_OUTCOME_LIMIT {
            outcomes.record(CallId::generate(), TaskState::Finished);
        }
        assert_eq!(outcomes.get(&first), None);
        assert_eq!(outcomes.order.len(), RETIRED_OUTCOME_LIMIT);
        assert_eq!(outcomes.states.len(), RETIRED_OUTCOME_LIMIT);
    }
}
