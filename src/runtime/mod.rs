pub mod scheduler_worker;
pub mod state_paths;
pub mod worker_primitives;
pub mod worker_registry;

pub use crate::shared::errors::RuntimeError;
pub use scheduler_worker::{tick_schedule_worker, SCHEDULE_WORKER_ID};
pub use state_paths::{bootstrap_state_root, StatePaths};
pub use worker_primitives::WorkerEvent;
pub use worker_registry::{WorkerHealth, WorkerState};

use crate::config::{Settings, StoreKind};
use crate::dispatch::{
    AgentTransport, Coordinator, DispatchContext, JobRegistry, JsonlEventSink, ResourceGuard,
    TaskQueue,
};
use crate::scheduling::ScheduleDispatcher;
use crate::shared::logging::DispatchLog;
use crate::store::{DispatchStore, MemoryStore, SqliteStore};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

pub const DISPATCH_WORKER_ID: &str = "dispatch_loop";

/// Optional collaborators wired into the coordinator at start.
#[derive(Default)]
pub struct RuntimeOptions {
    pub guards: Vec<Arc<dyn ResourceGuard>>,
    pub agent_transport: Option<Arc<dyn AgentTransport>>,
}

/// A started dispatch engine: state root, store, task queue, coordinator and
/// the schedule worker thread.
pub struct DispatchRuntime {
    paths: StatePaths,
    settings: Settings,
    log: DispatchLog,
    coordinator: Arc<Coordinator>,
    schedules: Arc<ScheduleDispatcher>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    events: Mutex<Receiver<WorkerEvent>>,
    workers: Mutex<BTreeMap<String, WorkerHealth>>,
    running: bool,
}

impl DispatchRuntime {
    pub fn start(
        settings: Settings,
        registry: JobRegistry,
        guards: Vec<Arc<dyn ResourceGuard>>,
    ) -> Result<Self, RuntimeError> {
        Self::start_with(
            settings,
            registry,
            RuntimeOptions {
                guards,
                agent_transport: None,
            },
        )
    }

    pub fn start_with(
        settings: Settings,
        registry: JobRegistry,
        options: RuntimeOptions,
    ) -> Result<Self, RuntimeError> {
        settings.validate()?;
        let paths = StatePaths::new(settings.resolve_state_root()?);
        bootstrap_state_root(&paths)?;

        let store: Arc<dyn DispatchStore> = match settings.store {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::Sqlite => Arc::new(SqliteStore::open(&paths.store_db_path())?),
        };
        let log = DispatchLog::to_file(paths.dispatch_log_path());
        let ctx = DispatchContext::new(
            Arc::new(JsonlEventSink::new(paths.events_log_path())),
            store,
            log.clone(),
        );
        let queue = Arc::new(TaskQueue::new(
            settings.queue_config(),
            Arc::new(registry),
            ctx,
        ));
        let mut coordinator = Coordinator::new(queue);
        for guard in options.guards {
            coordinator = coordinator.with_guard(guard);
        }
        if let Some(transport) = options.agent_transport {
            coordinator = coordinator.with_agent_transport(transport);
        }
        let coordinator = Arc::new(coordinator);
        let recovered = coordinator.start()?;

        let schedules = Arc::new(ScheduleDispatcher::new(
            Arc::clone(&coordinator),
            settings.schedule_poll_interval(),
        ));
        let stop = Arc::new(AtomicBool::new(false));
        let (events_tx, events_rx) = mpsc::channel::<WorkerEvent>();
        let worker = {
            let schedules = Arc::clone(&schedules);
            let log = log.clone();
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("tasking-schedules".to_string())
                .spawn(move || {
                    scheduler_worker::run_schedule_worker(&schedules, &log, &stop, &events_tx)
                })
        };
        let handle = match worker {
            Ok(handle) => handle,
            Err(source) => {
                coordinator.shutdown();
                return Err(RuntimeError::Spawn {
                    worker: SCHEDULE_WORKER_ID.to_string(),
                    source,
                });
            }
        };

        log.append(
            "info",
            "runtime.started",
            &format!(
                "root={} store={} recovered={recovered}",
                paths.root.display(),
                settings.store
            ),
        );
        Ok(Self {
            paths,
            settings,
            log,
            coordinator,
            schedules,
            stop,
            handles: vec![handle],
            events: Mutex::new(events_rx),
            workers: Mutex::new(BTreeMap::new()),
            running: true,
        })
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn schedules(&self) -> &Arc<ScheduleDispatcher> {
        &self.schedules
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Health of the dispatch loop and every worker thread, folding in any
    /// worker events received since the last call.
    pub fn worker_health(&self) -> BTreeMap<String, WorkerHealth> {
        let mut workers = lock(&self.workers);
        self.drain_events(&mut workers);
        let mut snapshot = workers.clone();
        snapshot.insert(
            DISPATCH_WORKER_ID.to_string(),
            WorkerHealth {
                state: if self.coordinator.queue().is_running() {
                    WorkerState::Running
                } else {
                    WorkerState::Stopped
                },
                last_heartbeat: None,
                last_error: None,
            },
        );
        snapshot
    }

    /// Stops the schedule worker, then the task queue. Waiting tasks stay in
    /// the store for the next start.
    pub fn shutdown(&mut self) -> Result<(), RuntimeError> {
        if !self.running {
            return Err(RuntimeError::NotRunning);
        }
        self.running = false;
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                self.log.append(
                    "error",
                    "runtime.worker_panicked",
                    SCHEDULE_WORKER_ID,
                );
            }
        }
        self.coordinator.shutdown();
        let mut workers = lock(&self.workers);
        self.drain_events(&mut workers);
        self.log.append("info", "runtime.stopped", "");
        Ok(())
    }

    fn drain_events(&self, workers: &mut BTreeMap<String, WorkerHealth>) {
        let events = lock(&self.events);
        while let Ok(event) = events.try_recv() {
            worker_registry::apply_worker_event(&self.log, workers, event);
        }
    }
}

impl Drop for DispatchRuntime {
    fn drop(&mut self) {
        if self.running {
            let _ = self.shutdown();
        }
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
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn bootstrap_creates_required_directories() {
        let dir = tempdir().expect("temp dir");
        let paths = StatePaths::new(dir.path().join("state"));
        bootstrap_state_root(&paths).expect("bootstrap succeeds");

        for required in paths.required_directories() {
            assert!(
                required.is_dir(),
                "missing directory: {}",
                required.display()
            );
        }
    }

    #[test]
    fn state_paths_layout() {
        let paths = StatePaths::new("/tmp/.tasking");
        assert_eq!(paths.settings_file(), PathBuf::from("/tmp/.tasking/config.yaml"));
        assert_eq!(
            paths.events_log_path(),
            PathBuf::from("/tmp/.tasking/logs/events.jsonl")
        );
        assert_eq!(
            paths.store_db_path(),
            PathBuf::from("/tmp/.tasking/data/tasking.db")
        );
    }
}
