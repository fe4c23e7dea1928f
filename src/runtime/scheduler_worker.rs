use super::worker_primitives::sleep_with_stop;
use super::WorkerEvent;
use crate::scheduling::ScheduleDispatcher;
use crate::shared::logging::DispatchLog;
use crate::shared::time;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Sender;

pub const SCHEDULE_WORKER_ID: &str = "schedule_dispatcher";

/// Runs one schedule pass at the current time. Returns the number of calls
/// submitted.
pub fn tick_schedule_worker(
    dispatcher: &ScheduleDispatcher,
    log: &DispatchLog,
) -> Result<usize, String> {
    let reports = dispatcher.tick(time::now()).map_err(|err| err.to_string())?;
    if !reports.is_empty() {
        log.append(
            "info",
            "scheduler.tick",
            &format!("dispatched={}", reports.len()),
        );
    }
    Ok(reports.len())
}

/// Polls the schedule dispatcher until `stop` is raised.
pub(crate) fn run_schedule_worker(
    dispatcher: &ScheduleDispatcher,
    log: &DispatchLog,
    stop: &AtomicBool,
    events: &Sender<WorkerEvent>,
) {
    let worker_id = SCHEDULE_WORKER_ID.to_string();
    let _ = events.send(WorkerEvent::Started {
        worker_id: worker_id.clone(),
        at: time::now_secs(),
    });
    loop {
        let event = match tick_schedule_worker(dispatcher, log) {
            Ok(_) => WorkerEvent::Heartbeat {
                worker_id: worker_id.clone(),
                at: time::now_secs(),
            },
            Err(message) => WorkerEvent::Error {
                worker_id: worker_id.clone(),
                at: time::now_secs(),
                message,
                fatal: false,
            },
        };
        let _ = events.send(event);
        if !sleep_with_stop(stop, dispatcher.poll_interval()) {
            break;
        }
    }
    let _ = events.send(WorkerEvent::Stopped {
        worker_id,
        at: time::now_secs(),
    });
}
