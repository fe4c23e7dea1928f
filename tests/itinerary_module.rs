use serde_json::{json, Value};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tasking::dispatch::{
    job_fn, AgentJob, AgentMessage, AgentReply, CallResponse, ChannelTransport, Coordinator,
    DispatchContext, FindCriteria, JobError, JobRegistry, QueueConfig, ResourceTag, TaskErrorKind,
    TaskQueue, TaskState,
};
use tasking::itinerary::{
    bind_itinerary, repo_delete_itinerary, Binding, AGENT_BIND_JOB, AGENT_UNBIND_JOB, BIND_JOB,
    DELETE_BINDING_JOB, REPO_DELETE_JOB, UNBIND_JOB,
};
use tasking::shared::ids::{CallId, JobName};

fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

fn job(name: &str) -> JobName {
    JobName::parse(name).expect("job name")
}

struct Pulp {
    coordinator: Coordinator,
    agent: Receiver<AgentMessage>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl Pulp {
    /// Local binding jobs append their name to the journal; agent jobs go
    /// over a channel transport. `fail_bind` makes the bind step fail.
    fn new(fail_bind: bool) -> Self {
        let (agent_tx, agent) = channel();
        let transport = Arc::new(ChannelTransport::new(agent_tx));
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut registry = JobRegistry::new();
        for name in [UNBIND_JOB, DELETE_BINDING_JOB, REPO_DELETE_JOB] {
            let journal = Arc::clone(&journal);
            registry.register(
                job(name),
                job_fn(move |ctx, _| {
                    journal
                        .lock()
                        .expect("journal")
                        .push(format!("{name}:{}", ctx.task_id()));
                    Ok(Value::Null)
                }),
            );
        }
        {
            let journal = Arc::clone(&journal);
            registry.register(
                job(BIND_JOB),
                job_fn(move |_, args| {
                    if fail_bind {
                        return Err(JobError::failed("distributor missing"));
                    }
                    let consumer: String = args.arg(0)?;
                    journal
                        .lock()
                        .expect("journal")
                        .push(format!("{BIND_JOB}:{consumer}"));
                    Ok(json!({"bound": consumer}))
                }),
            );
        }
        registry.register(
            job(AGENT_BIND_JOB),
            AgentJob::new(transport.clone(), "bind", "tasking.replies"),
        );
        registry.register(
            job(AGENT_UNBIND_JOB),
            AgentJob::new(transport.clone(), "unbind", "tasking.replies"),
        );

        let queue = Arc::new(TaskQueue::new(
            QueueConfig {
                dispatch_interval: Duration::from_millis(10),
                shutdown_timeout: Duration::from_millis(100),
                ..QueueConfig::default()
            },
            Arc::new(registry),
            DispatchContext::in_memory(),
        ));
        let coordinator = Coordinator::new(queue).with_agent_transport(transport);
        coordinator.start().expect("start coordinator");
        Self {
            coordinator,
            agent,
            journal,
        }
    }

    fn state(&self, id: &CallId) -> Option<TaskState> {
        self.coordinator.get_task(id).ok().map(|report| report.state)
    }

    fn wait_for(&self, id: &CallId, state: TaskState) {
        wait_until(&format!("task {id} to reach {state}"), || {
            self.state(id) == Some(state)
        });
    }

    fn next_agent_request(&self) -> tasking::dispatch::AgentRequest {
        match self
            .agent
            .recv_timeout(Duration::from_secs(5))
            .expect("agent message")
        {
            AgentMessage::Request(request) => request,
            other => panic!("expected agent request, got {other:?}"),
        }
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().expect("journal").clone()
    }
}

impl Drop for Pulp {
    fn drop(&mut self) {
        self.coordinator.shutdown();
    }
}

#[test]
fn bind_notifies_the_agent_after_the_bind_record_exists() {
    let pulp = Pulp::new(false);
    let binding = Binding::new("consumer-1", "repo-1", "dist-1");
    let itinerary =
        bind_itinerary(&binding, true, json!({"auto": true}), json!({})).expect("itinerary");
    let ids = itinerary.ids();

    let reports = itinerary.submit(&pulp.coordinator).expect("submit");
    assert!(reports.iter().all(|r| r.response == CallResponse::Accepted));

    let request = pulp.next_agent_request();
    assert_eq!(request.correlation_id, ids[1]);
    assert_eq!(request.operation, "bind");
    assert_eq!(pulp.state(&ids[0]), Some(TaskState::Finished));
    assert_eq!(pulp.journal(), vec![format!("{BIND_JOB}:consumer-1")]);

    pulp.coordinator
        .handle_agent_reply(AgentReply::succeeded(ids[1].clone(), json!({})))
        .expect("reply");
    pulp.wait_for(&ids[1], TaskState::Finished);

    let tagged = pulp.coordinator.find_tasks(&FindCriteria {
        tags: vec!["resource:consumer:consumer-1".to_string()],
        ..FindCriteria::default()
    });
    assert_eq!(tagged.len(), 2);
    let group = tagged[0].group_id.clone().expect("group id");
    assert!(tagged.iter().all(|task| task.group_id.as_ref() == Some(&group)));
}

#[test]
fn failed_bind_skips_the_agent_notification() {
    let pulp = Pulp::new(true);
    let binding = Binding::new("consumer-1", "repo-1", "dist-1");
    let itinerary = bind_itinerary(&binding, true, json!({}), json!({})).expect("itinerary");
    let ids = itinerary.ids();
    itinerary.submit(&pulp.coordinator).expect("submit");

    pulp.wait_for(&ids[1], TaskState::Error);
    let agent_step = pulp.coordinator.get_task(&ids[1]).expect("agent step");
    assert_eq!(
        agent_step.error.expect("error").kind,
        TaskErrorKind::DependencyFailed
    );
    assert!(pulp.agent.try_recv().is_err());
}

#[test]
fn repository_delete_waits_for_agent_unbind_confirmation() {
    let pulp = Pulp::new(false);
    let bindings = [
        Binding::new("consumer-1", "repo-1", "dist-1"),
        Binding::new("consumer-2", "repo-1", "dist-1"),
    ];
    let itinerary = repo_delete_itinerary("repo-1", &bindings, json!({})).expect("itinerary");
    let ids = itinerary.ids();
    let delete_id = ids.last().cloned().expect("delete step");
    let reports = itinerary.submit(&pulp.coordinator).expect("submit");

    let delete_report = reports
        .iter()
        .find(|r| r.task_id == delete_id)
        .expect("delete report");
    assert_eq!(delete_report.response, CallResponse::Postponed);

    let first = pulp.next_agent_request();
    let second = pulp.next_agent_request();
    assert!([&first, &second]
        .iter()
        .all(|request| request.operation == "unbind"));

    pulp.coordinator
        .handle_agent_reply(AgentReply::succeeded(first.correlation_id, json!({})))
        .expect("first reply");
    thread::sleep(Duration::from_millis(100));
    assert_eq!(pulp.state(&delete_id), Some(TaskState::Waiting));

    pulp.coordinator
        .handle_agent_reply(AgentReply::succeeded(second.correlation_id, json!({})))
        .expect("second reply");
    pulp.wait_for(&delete_id, TaskState::Finished);

    let journal = pulp.journal();
    assert_eq!(
        journal.last().expect("journal entry"),
        &format!("{REPO_DELETE_JOB}:{delete_id}")
    );
    assert_eq!(
        journal
            .iter()
            .filter(|entry| entry.starts_with(DELETE_BINDING_JOB))
            .count(),
        2
    );

    let busy = pulp.coordinator.find_tasks(&FindCriteria {
        resource: Some(ResourceTag::repository("repo-1")),
        state: Some(TaskState::Finished),
        ..FindCriteria::default()
    });
    assert_eq!(busy.len(), ids.len());
}
