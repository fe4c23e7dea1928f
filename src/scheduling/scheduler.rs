use super::iso8601::{parse_iso8601_interval, MAX_INTERVAL_SECS};
use super::ScheduleError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One run produced by a scheduler, with the number of whole intervals that
/// were skipped because the previous run overran them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRun {
    pub run_at: DateTime<Utc>,
    pub skipped_intervals: u32,
}

impl ScheduledRun {
    fn on_time(run_at: DateTime<Utc>) -> Self {
        Self {
            run_at,
            skipped_intervals: 0,
        }
    }
}

/// Recurrence policy deciding when a schedule's call runs next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scheduler {
    Immediate,
    #[serde(rename_all = "camelCase")]
    At {
        scheduled_time: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Interval {
        interval_secs: u64,
        #[serde(default)]
        start_time: Option<DateTime<Utc>>,
        /// Runs left after the pending one; `None` repeats forever.
        #[serde(default)]
        remaining_runs: Option<u32>,
    },
}

impl Scheduler {
    pub fn immediate() -> Self {
        Self::Immediate
    }

    pub fn at(scheduled_time: DateTime<Utc>, now: DateTime<Utc>) -> Result<Self, ScheduleError> {
        if scheduled_time < now {
            return Err(ScheduleError::invalid(format!(
                "scheduled time {scheduled_time} is in the past"
            )));
        }
        Ok(Self::At { scheduled_time })
    }

    pub fn interval(
        interval_secs: u64,
        start_time: Option<DateTime<Utc>>,
        runs: Option<u32>,
    ) -> Result<Self, ScheduleError> {
        if interval_secs == 0 {
            return Err(ScheduleError::invalid("interval must be at least one second"));
        }
        if interval_secs > MAX_INTERVAL_SECS {
            return Err(ScheduleError::invalid(format!(
                "interval must be <= {MAX_INTERVAL_SECS} seconds"
            )));
        }
        if runs == Some(0) {
            return Err(ScheduleError::invalid("runs must be >= 1 when set"));
        }
        Ok(Self::Interval {
            interval_secs,
            start_time,
            remaining_runs: runs,
        })
    }

    pub fn from_iso8601(raw: &str) -> Result<Self, ScheduleError> {
        let parsed = parse_iso8601_interval(raw)?;
        Self::interval(parsed.interval_secs, parsed.start, parsed.recurrences)
    }

    pub fn remaining_runs(&self) -> Option<u32> {
        match self {
            Self::Interval { remaining_runs, .. } => *remaining_runs,
            Self::Immediate | Self::At { .. } => Some(1),
        }
    }

    pub(crate) fn set_remaining_runs(&mut self, runs: Option<u32>) {
        if let Self::Interval { remaining_runs, .. } = self {
            *remaining_runs = runs;
        }
    }

    /// Next run after `previous_run`, which must be the previously *scheduled*
    /// time. Interval runs advance from that time rather than from when the
    /// call actually ran; intervals already behind `now` are skipped and
    /// counted. Each returned interval run consumes one remaining run.
    pub fn schedule(
        &mut self,
        previous_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<ScheduledRun> {
        match self {
            Self::Immediate => match previous_run {
                None => Some(ScheduledRun::on_time(now)),
                Some(_) => None,
            },
            Self::At { scheduled_time } => match previous_run {
                None => Some(ScheduledRun::on_time(*scheduled_time)),
                Some(_) => None,
            },
            Self::Interval {
                interval_secs,
                start_time,
                remaining_runs,
            } => {
                if *remaining_runs == Some(0) {
                    return None;
                }
                let run = match previous_run {
                    None => ScheduledRun::on_time(start_time.unwrap_or(now)),
                    Some(previous) => {
                        let step = Duration::seconds(i64::try_from(*interval_secs).ok()?);
                        let candidate = previous.checked_add_signed(step)?;
                        if candidate > now {
                            ScheduledRun::on_time(candidate)
                        } else {
                            let step_nanos = step.num_nanoseconds()?;
                            let skipped = (now - candidate).num_nanoseconds()? / step_nanos + 1;
                            let advance = Duration::nanoseconds(skipped.checked_mul(step_nanos)?);
                            ScheduledRun {
                                run_at: candidate.checked_add_signed(advance)?,
                                skipped_intervals: u32::try_from(skipped).unwrap_or(u32::MAX),
                            }
                        }
                    }
                };
                if let Some(remaining) = remaining_runs {
                    *remaining -= 1;
                }
                Some(run)
            }
        }
    }
}
