use super::schedule::{Schedule, ScheduleOptions, SchedulePatch};
use super::scheduler::Scheduler;
use super::ScheduleError;
use crate::dispatch::call::{CallRequest, LifecycleEvent};
use crate::dispatch::coordinator::{CallReport, CallResponse, Coordinator};
use crate::dispatch::events::{DispatchEvent, EventSink};
use crate::dispatch::resource::ResourceTag;
use crate::dispatch::task::{TaskReport, TaskState};
use crate::dispatch::DispatchError;
use crate::shared::ids::ScheduleId;
use crate::shared::logging::DispatchLog;
use crate::shared::time;
use crate::store::DispatchStore;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Schedule bookkeeping shared between the dispatcher and the completion
/// callbacks of the calls it submits. The mutex serialises read-modify-write
/// cycles on stored schedules.
struct ScheduleBook {
    store: Arc<dyn DispatchStore>,
    log: DispatchLog,
    guard: Mutex<()>,
}

impl ScheduleBook {
    fn lock(&self) -> MutexGuard<'_, ()> {
        match self.guard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn load(&self, id: &ScheduleId) -> Result<Schedule, ScheduleError> {
        self.store
            .load_schedule(id)?
            .ok_or_else(|| ScheduleError::UnknownSchedule {
                schedule_id: id.to_string(),
            })
    }

    fn record_outcome(&self, id: &ScheduleId, report: &TaskReport) {
        let succeeded = match report.state {
            TaskState::Finished => true,
            TaskState::Error => false,
            _ => return,
        };
        let _guard = self.lock();
        let mut schedule = match self.store.load_schedule(id) {
            Ok(Some(schedule)) => schedule,
            // Exhausted schedules are deleted before their last call settles.
            Ok(None) => return,
            Err(err) => {
                self.log.append(
                    "error",
                    "schedule.outcome_failed",
                    &format!("schedule={id} task={} error={err}", report.task_id),
                );
                return;
            }
        };
        let disabled = schedule.record_outcome(succeeded, time::now());
        if disabled {
            self.log.append(
                "warn",
                "schedule.disabled",
                &format!(
                    "schedule={id} consecutive_failures={}",
                    schedule.consecutive_failures
                ),
            );
        }
        if let Err(err) = self.store.save_schedule(&schedule) {
            self.log.append(
                "error",
                "schedule.outcome_failed",
                &format!("schedule={id} task={} error={err}", report.task_id),
            );
        }
    }
}

/// Resubmits due schedules through the coordinator. `tick` is driven by the
/// runtime's schedule worker every poll interval.
pub struct ScheduleDispatcher {
    coordinator: Arc<Coordinator>,
    book: Arc<ScheduleBook>,
    sink: Arc<dyn EventSink>,
    poll_interval: Duration,
}

impl ScheduleDispatcher {
    pub fn new(coordinator: Arc<Coordinator>, poll_interval: Duration) -> Self {
        let ctx = coordinator.queue().context().clone();
        Self {
            coordinator,
            book: Arc::new(ScheduleBook {
                store: ctx.store,
                log: ctx.log,
                guard: Mutex::new(()),
            }),
            sink: ctx.sink,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Stores a schedule for `template`. The template's id, group and
    /// dependencies are not kept; every run is submitted as a fresh call.
    pub fn add_schedule(
        &self,
        template: &CallRequest,
        scheduler: Scheduler,
        options: ScheduleOptions,
    ) -> Result<ScheduleId, ScheduleError> {
        if !self.coordinator.queue().registry().contains(template.job()) {
            return Err(DispatchError::UnknownJob {
                job: template.job().to_string(),
            }
            .into());
        }
        let schedule = Schedule::new(template.to_serialized(), scheduler, options, time::now())?;
        let _guard = self.book.lock();
        self.book.store.save_schedule(&schedule)?;
        self.book.log.append(
            "info",
            "schedule.added",
            &format!(
                "schedule={} call={} next_run={}",
                schedule.id,
                template.describe(),
                schedule.first_run.to_rfc3339()
            ),
        );
        Ok(schedule.id)
    }

    pub fn update_schedule(
        &self,
        id: &ScheduleId,
        patch: SchedulePatch,
    ) -> Result<Schedule, ScheduleError> {
        let _guard = self.book.lock();
        let mut schedule = self.book.load(id)?;
        schedule.apply(patch, time::now())?;
        self.book.store.save_schedule(&schedule)?;
        self.book
            .log
            .append("info", "schedule.updated", &format!("schedule={id}"));
        Ok(schedule)
    }

    pub fn remove_schedule(&self, id: &ScheduleId) -> Result<(), ScheduleError> {
        let _guard = self.book.lock();
        if !self.book.store.remove_schedule(id)? {
            return Err(ScheduleError::UnknownSchedule {
                schedule_id: id.to_string(),
            });
        }
        self.book
            .log
            .append("info", "schedule.removed", &format!("schedule={id}"));
        Ok(())
    }

    pub fn get_schedule(&self, id: &ScheduleId) -> Result<Schedule, ScheduleError> {
        self.book.load(id)
    }

    /// All schedules, or only those whose template touches `resource`.
    pub fn list_schedules(
        &self,
        resource: Option<&ResourceTag>,
    ) -> Result<Vec<Schedule>, ScheduleError> {
        let schedules = self.book.store.list_schedules()?;
        Ok(match resource {
            Some(tag) => schedules
                .into_iter()
                .filter(|schedule| schedule.touches(tag))
                .collect(),
            None => schedules,
        })
    }

    /// Processes every schedule due at `now`. Failures of one schedule are
    /// logged and do not stop the others.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<CallReport>, ScheduleError> {
        let _guard = self.book.lock();
        let mut reports = Vec::new();
        for schedule in self.book.store.list_schedules()? {
            if !schedule.is_due(now) {
                continue;
            }
            let id = schedule.id.clone();
            match self.fire(schedule, now) {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(err) => self.book.log.append(
                    "error",
                    "schedule.tick_failed",
                    &format!("schedule={id} error={err}"),
                ),
            }
        }
        Ok(reports)
    }

    fn fire(
        &self,
        mut schedule: Schedule,
        now: DateTime<Utc>,
    ) -> Result<Option<CallReport>, ScheduleError> {
        let Some(run_at) = schedule.next_run else {
            return Ok(None);
        };
        let mut report = None;
        if schedule.enabled {
            report = self.submit(&schedule);
            schedule.last_run = Some(run_at);
        }

        match schedule.scheduler.schedule(Some(run_at), now) {
            Some(next) => {
                if next.skipped_intervals > 0 {
                    self.sink.emit(&DispatchEvent::MissedSchedule {
                        schedule_id: schedule.id.clone(),
                        skipped_intervals: next.skipped_intervals,
                        timestamp: now,
                    });
                    self.book.log.append(
                        "warn",
                        "schedule.missed",
                        &format!(
                            "schedule={} skipped_intervals={}",
                            schedule.id, next.skipped_intervals
                        ),
                    );
                }
                schedule.next_run = Some(next.run_at);
                schedule.updated_at = now;
                self.book.store.save_schedule(&schedule)?;
            }
            None => {
                self.book.store.remove_schedule(&schedule.id)?;
                self.book.log.append(
                    "info",
                    "schedule.exhausted",
                    &format!("schedule={}", schedule.id),
                );
            }
        }
        Ok(report)
    }

    /// Submits one run of `schedule`. Admission failures are logged; the
    /// schedule still advances so a broken template is not retried every poll.
    fn submit(&self, schedule: &Schedule) -> Option<CallReport> {
        let outcome = CallRequest::from_serialized(schedule.template.reissue(Some(&schedule.id)))
            .and_then(|mut request| {
                let book = Arc::clone(&self.book);
                let schedule_id = schedule.id.clone();
                request.add_callback(
                    LifecycleEvent::Complete,
                    Arc::new(move |report: &TaskReport| book.record_outcome(&schedule_id, report)),
                );
                self.coordinator.execute_call(request)
            });
        match outcome {
            Ok(report) => {
                let (level, event) = match report.response {
                    CallResponse::Rejected => ("warn", "schedule.run_rejected"),
                    _ => ("info", "schedule.run_submitted"),
                };
                self.book.log.append(
                    level,
                    event,
                    &format!(
                        "schedule={} task={} reasons={}",
                        schedule.id,
                        report.task_id,
                        report.reasons.join("; ")
                    ),
                );
                Some(report)
            }
            Err(err) => {
                self.book.log.append(
                    "error",
                    "schedule.run_failed",
                    &format!("schedule={} error={err}", schedule.id),
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::job::{job_fn, JobRegistry};
    use crate::dispatch::queue::{QueueConfig, TaskQueue};
    use crate::dispatch::task::DispatchContext;
    use crate::shared::ids::JobName;
    use chrono::TimeZone;
    use serde_json::Value;

    fn dispatcher() -> ScheduleDispatcher {
        let mut registry = JobRegistry::new();
        registry.register(
            JobName::parse("noop").expect("job"),
            job_fn(|_, _| Ok(Value::Null)),
        );
        let queue = Arc::new(TaskQueue::new(
            QueueConfig::default(),
            Arc::new(registry),
            DispatchContext::in_memory(),
        ));
        ScheduleDispatcher::new(
            Arc::new(Coordinator::new(queue)),
            Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        )
    }

    fn template(job: &str) -> CallRequest {
        CallRequest::builder(JobName::parse(job).expect("job"))
            .reads(ResourceTag::repository("repo-1"))
            .build()
            .expect("template")
    }

    #[test]
    fn add_schedule_rejects_unknown_jobs() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .add_schedule(&template("missing"), Scheduler::immediate(), ScheduleOptions::default())
            .expect_err("unknown job");
        assert!(matches!(
            err,
            ScheduleError::Dispatch(DispatchError::UnknownJob { .. })
        ));
    }

    #[test]
    fn immediate_schedule_fires_once_and_is_deleted() {
        let dispatcher = dispatcher();
        let id = dispatcher
            .add_schedule(&template("noop"), Scheduler::immediate(), ScheduleOptions::default())
            .expect("add");
        let later = time::now() + chrono::Duration::seconds(1);
        let reports = dispatcher.tick(later).expect("tick");
        assert_eq!(reports.len(), 1);
        assert_ne!(reports[0].response, CallResponse::Rejected);
        assert!(matches!(
            dispatcher.get_schedule(&id),
            Err(ScheduleError::UnknownSchedule { .. })
        ));
        assert!(dispatcher.tick(later).expect("second tick").is_empty());
    }

    #[test]
    fn list_schedules_filters_by_resource_and_remove_is_strict() {
        let dispatcher = dispatcher();
        let start = Utc.timestamp_opt(4_000_000_000, 0).single().expect("future");
        let id = dispatcher
            .add_schedule(
                &template("noop"),
                Scheduler::interval(60, Some(start), None).expect("interval"),
                ScheduleOptions::default(),
            )
            .expect("add");
        assert_eq!(
            dispatcher
                .list_schedules(Some(&ResourceTag::repository("repo-1")))
                .expect("list")
                .len(),
            1
        );
        assert!(dispatcher
            .list_schedules(Some(&ResourceTag::repository("repo-2")))
            .expect("list")
            .is_empty());
        dispatcher.remove_schedule(&id).expect("remove");
        assert!(matches!(
            dispatcher.remove_schedule(&id),
            Err(ScheduleError::UnknownSchedule { .. })
        ));
    }
}
