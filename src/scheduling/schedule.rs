use super::scheduler::Scheduler;
use super::ScheduleError;
use crate::dispatch::call::SerializedCallRequest;
use crate::dispatch::resource::ResourceTag;
use crate::shared::ids::ScheduleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Persisted recurrence policy that resubmits a call request template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: ScheduleId,
    pub template: SerializedCallRequest,
    pub scheduler: Scheduler,
    pub first_run: DateTime<Utc>,
    /// `None` once the scheduler has no further runs.
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    pub enabled: bool,
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOptions {
    pub enabled: bool,
    pub failure_threshold: Option<u32>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: None,
        }
    }
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulePatch {
    pub enabled: Option<bool>,
    pub failure_threshold: Option<Option<u32>>,
    pub remaining_runs: Option<Option<u32>>,
    pub scheduler: Option<Scheduler>,
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<Map<String, Value>>,
}

impl Schedule {
    pub fn new(
        template: SerializedCallRequest,
        mut scheduler: Scheduler,
        options: ScheduleOptions,
        now: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        if options.failure_threshold == Some(0) {
            return Err(ScheduleError::invalid("failure threshold must be >= 1"));
        }
        let first = scheduler
            .schedule(None, now)
            .ok_or_else(|| ScheduleError::invalid("scheduler produces no runs"))?;
        let id = ScheduleId::generate();
        let template = SerializedCallRequest {
            schedule_id: Some(id.clone()),
            ..template.reissue(Some(&id))
        };
        Ok(Self {
            id,
            template,
            scheduler,
            first_run: first.run_at,
            next_run: Some(first.run_at),
            last_run: None,
            enabled: options.enabled,
            failure_threshold: options.failure_threshold,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Runs still to come, counting the pending `next_run`. `None` repeats
    /// forever.
    pub fn remaining_runs(&self) -> Option<u32> {
        let pending = u32::from(self.next_run.is_some());
        match self.scheduler {
            Scheduler::Interval { .. } => self
                .scheduler
                .remaining_runs()
                .map(|after_next| after_next.saturating_add(pending)),
            Scheduler::Immediate | Scheduler::At { .. } => Some(pending),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run.is_some_and(|next| next <= now)
    }

    pub fn touches(&self, tag: &ResourceTag) -> bool {
        self.template.resources.touches(tag)
    }

    pub fn apply(&mut self, patch: SchedulePatch, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        if patch.failure_threshold == Some(Some(0)) {
            return Err(ScheduleError::invalid("failure threshold must be >= 1"));
        }
        if patch.remaining_runs == Some(Some(0)) {
            return Err(ScheduleError::invalid("remaining runs must be >= 1 when set"));
        }
        if let Some(mut scheduler) = patch.scheduler {
            let first = scheduler
                .schedule(None, now)
                .ok_or_else(|| ScheduleError::invalid("scheduler produces no runs"))?;
            self.scheduler = scheduler;
            self.first_run = first.run_at;
            self.next_run = Some(first.run_at);
            self.last_run = None;
        }
        if let Some(runs) = patch.remaining_runs {
            if !matches!(self.scheduler, Scheduler::Interval { .. }) {
                return Err(ScheduleError::invalid(
                    "remaining runs only apply to interval schedules",
                ));
            }
            // The scheduler counts runs after the pending one.
            let pending = u32::from(self.next_run.is_some());
            self.scheduler
                .set_remaining_runs(runs.map(|total| total.saturating_sub(pending)));
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
            if enabled {
                self.consecutive_failures = 0;
            }
        }
        if let Some(threshold) = patch.failure_threshold {
            self.failure_threshold = threshold;
        }
        if let Some(args) = patch.args {
            self.template.args = args;
        }
        if let Some(kwargs) = patch.kwargs {
            self.template.kwargs = kwargs;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Records a finished scheduled call. Returns `true` when this failure
    /// disabled the schedule.
    pub fn record_outcome(&mut self, succeeded: bool, now: DateTime<Utc>) -> bool {
        self.updated_at = now;
        if succeeded {
            self.consecutive_failures = 0;
            return false;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.failure_threshold {
            Some(threshold) if self.enabled && self.consecutive_failures >= threshold => {
                self.enabled = false;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::call::CallRequest;
    use crate::shared::ids::JobName;
    use chrono::TimeZone;

    fn template() -> SerializedCallRequest {
        CallRequest::builder(JobName::parse("repo.sync").expect("job"))
            .arg("repo-1")
            .reads(ResourceTag::repository("repo-1"))
            .build()
            .expect("build")
            .to_serialized()
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().expect("now")
    }

    #[test]
    fn new_schedule_takes_first_run_from_scheduler() {
        let scheduler = Scheduler::interval(60, None, Some(3)).expect("interval");
        let schedule = Schedule::new(template(), scheduler, ScheduleOptions::default(), now())
            .expect("schedule");
        assert_eq!(schedule.first_run, now());
        assert_eq!(schedule.next_run, Some(now()));
        assert_eq!(schedule.remaining_runs(), Some(3));
        assert_eq!(schedule.template.schedule_id.as_ref(), Some(&schedule.id));
        assert!(schedule.touches(&ResourceTag::repository("repo-1")));
        assert!(schedule.is_due(now()));
    }

    #[test]
    fn failures_disable_at_threshold_and_success_resets() {
        let mut schedule = Schedule::new(
            template(),
            Scheduler::immediate(),
            ScheduleOptions {
                enabled: true,
                failure_threshold: Some(2),
            },
            now(),
        )
        .expect("schedule");
        assert!(!schedule.record_outcome(false, now()));
        assert!(!schedule.record_outcome(true, now()));
        assert_eq!(schedule.consecutive_failures, 0);
        assert!(!schedule.record_outcome(false, now()));
        assert!(schedule.record_outcome(false, now()));
        assert!(!schedule.enabled);
    }

    #[test]
    fn patch_rejects_runs_on_one_shot_schedules() {
        let mut schedule = Schedule::new(
            template(),
            Scheduler::immediate(),
            ScheduleOptions::default(),
            now(),
        )
        .expect("schedule");
        let err = schedule
            .apply(
                SchedulePatch {
                    remaining_runs: Some(Some(4)),
                    ..SchedulePatch::default()
                },
                now(),
            )
            .expect_err("immediate has no runs counter");
        assert!(err.to_string().contains("interval"));

        schedule
            .apply(
                SchedulePatch {
                    enabled: Some(false),
                    args: Some(vec![Value::from("repo-2")]),
                    ..SchedulePatch::default()
                },
                now(),
            )
            .expect("patch");
        assert!(!schedule.enabled);
        assert_eq!(schedule.template.args, vec![Value::from("repo-2")]);
    }

    #[test]
    fn remaining_runs_count_the_pending_run() {
        let mut schedule = Schedule::new(
            template(),
            Scheduler::interval(60, None, Some(3)).expect("interval"),
            ScheduleOptions::default(),
            now(),
        )
        .expect("schedule");
        assert_eq!(schedule.remaining_runs(), Some(3));

        schedule
            .apply(
                SchedulePatch {
                    remaining_runs: Some(Some(1)),
                    ..SchedulePatch::default()
                },
                now(),
            )
            .expect("patch");
        assert_eq!(schedule.remaining_runs(), Some(1));
        assert_eq!(schedule.scheduler.remaining_runs(), Some(0));

        let pending = schedule.next_run.expect("pending run");
        assert_eq!(schedule.scheduler.schedule(Some(pending), now()), None);
    }
}
