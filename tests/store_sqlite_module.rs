use chrono::{Duration, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde_json::json;
use tasking::dispatch::{CallRequest, ResourceTag, TaskError, TaskState};
use tasking::scheduling::{Schedule, ScheduleOptions, Scheduler};
use tasking::shared::ids::{CallId, JobName, ScheduleId};
use tasking::store::{DispatchStore, SqliteStore, StoreError, TaskDocument};
use tempfile::tempdir;

fn document(offset_secs: i64) -> TaskDocument {
    let request = CallRequest::builder(JobName::parse("repo.sync").expect("job"))
        .arg("repo-1")
        .kwarg("override", json!({"auto_publish": false}))
        .updates(ResourceTag::repository("repo-1"))
        .tag("resource:repository:repo-1")
        .build()
        .expect("request");
    TaskDocument {
        request: request.to_serialized(),
        state: TaskState::Waiting,
        enqueued_at: Utc
            .timestamp_opt(1_700_000_000 + offset_secs, 0)
            .single()
            .expect("timestamp"),
        start_time: None,
        finish_time: None,
        progress: None,
        result: None,
        error: None,
    }
}

fn schedule(offset_secs: i64) -> Schedule {
    let template = CallRequest::builder(JobName::parse("repo.sync").expect("job"))
        .reads(ResourceTag::repository("repo-1"))
        .build()
        .expect("template");
    let now = Utc
        .timestamp_opt(1_700_000_000 + offset_secs, 0)
        .single()
        .expect("timestamp");
    Schedule::new(
        template.to_serialized(),
        Scheduler::interval(3600, None, Some(4)).expect("interval"),
        ScheduleOptions::default(),
        now,
    )
    .expect("schedule")
}

#[test]
fn task_documents_upsert_and_list_in_enqueue_order() {
    let dir = tempdir().expect("tempdir");
    let store = SqliteStore::open(&dir.path().join("data/tasking.db")).expect("open");

    let late = document(10);
    let early = document(0);
    store.save_task(&late).expect("save late");
    store.save_task(&early).expect("save early");

    let listed: Vec<CallId> = store
        .list_tasks()
        .expect("list")
        .into_iter()
        .map(|doc| doc.request.id)
        .collect();
    assert_eq!(listed, vec![early.request.id.clone(), late.request.id.clone()]);

    let mut failed = early.clone();
    failed.state = TaskState::Error;
    failed.finish_time = Some(failed.enqueued_at + Duration::seconds(3));
    failed.error = Some(TaskError::call_failed("remote unreachable"));
    store.save_task(&failed).expect("update");

    let loaded = store
        .load_task(&early.request.id)
        .expect("load")
        .expect("present");
    assert_eq!(loaded, failed);
    assert_eq!(store.list_tasks().expect("list").len(), 2);

    assert!(store.remove_task(&early.request.id).expect("remove"));
    assert!(!store.remove_task(&early.request.id).expect("remove again"));
    assert!(store
        .load_task(&early.request.id)
        .expect("load removed")
        .is_none());
}

#[test]
fn documents_survive_reopening_the_database() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("tasking.db");
    let doc = document(0);
    let first = schedule(0);
    let second = schedule(60);
    {
        let store = SqliteStore::open(&db_path).expect("open");
        store.save_task(&doc).expect("save task");
        store.save_schedule(&second).expect("save second");
        store.save_schedule(&first).expect("save first");
    }

    let store = SqliteStore::open(&db_path).expect("reopen");
    assert_eq!(store.path(), db_path.as_path());
    assert_eq!(
        store.load_task(&doc.request.id).expect("load task"),
        Some(doc)
    );
    let ids: Vec<ScheduleId> = store
        .list_schedules()
        .expect("list schedules")
        .into_iter()
        .map(|schedule| schedule.id)
        .collect();
    assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);

    let loaded = store
        .load_schedule(&first.id)
        .expect("load schedule")
        .expect("present");
    assert_eq!(loaded, first);
    assert_eq!(loaded.remaining_runs(), Some(4));

    assert!(store.remove_schedule(&first.id).expect("remove"));
    assert!(!store.remove_schedule(&first.id).expect("remove again"));
    assert_eq!(store.list_schedules().expect("list").len(), 1);
}

#[test]
fn corrupt_documents_surface_decode_errors() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("tasking.db");
    let store = SqliteStore::open(&db_path).expect("open");

    let connection = Connection::open(&db_path).expect("raw connection");
    connection
        .execute(
            "INSERT INTO queued_calls (task_id, state, enqueued_at, document)
             VALUES (?1, 'waiting', 0, ?2)",
            params!["broken", "{not json"],
        )
        .expect("insert corrupt row");

    let err = store.list_tasks().expect_err("corrupt document");
    assert!(matches!(err, StoreError::Decode { kind: "task", .. }));
    assert!(err.to_string().contains("broken"));
}
