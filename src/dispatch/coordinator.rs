use super::agent::{agent_cancel_hook, AgentReply, AgentReplyStatus, AgentTransport};
use super::call::CallRequest;
use super::collision::{check_preconditions, detect, Decision, ResourceGuard};
use super::queue::{DependencyStatus, TaskQueue};
use super::resource::ResourceTag;
use super::task::{Task, TaskError, TaskReport, TaskState};
use super::DispatchError;
use crate::shared::ids::{CallId, GroupId, JobName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResponse {
    Accepted,
    Postponed,
    Rejected,
}

/// Admission result for one submitted call request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallReport {
    pub task_id: CallId,
    pub response: CallResponse,
    /// `None` for rejected requests, which never become tasks.
    pub state: Option<TaskState>,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindCriteria {
    pub resource: Option<ResourceTag>,
    pub tags: Vec<String>,
    pub state: Option<TaskState>,
    pub group_id: Option<GroupId>,
    pub job: Option<JobName>,
}

impl FindCriteria {
    pub fn matches(&self, task: &Task) -> bool {
        let request = task.request();
        if let Some(resource) = &self.resource {
            if !request.resources().touches(resource) {
                return false;
            }
        }
        if !self.tags.iter().all(|tag| request.tags().contains(tag)) {
            return false;
        }
        if let Some(state) = self.state {
            if task.state() != state {
                return false;
            }
        }
        if self.group_id.is_some() && request.group_id() != self.group_id.as_ref() {
            return false;
        }
        if let Some(job) = &self.job {
            if request.job() != job {
                return false;
            }
        }
        true
    }
}

/// Admission front door: runs preconditions and collision detection, then
/// hands accepted and postponed requests to the task queue.
pub struct Coordinator {
    queue: Arc<TaskQueue>,
    guards: Vec<Arc<dyn ResourceGuard>>,
    agent: Option<Arc<dyn AgentTransport>>,
}

impl Coordinator {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self {
            queue,
            guards: Vec::new(),
            agent: None,
        }
    }

    pub fn with_guard(mut self, guard: Arc<dyn ResourceGuard>) -> Self {
        self.guards.push(guard);
        self
    }

    /// Asynchronous requests without their own cancel hook get one that sends
    /// a cancel request over this transport.
    pub fn with_agent_transport(mut self, transport: Arc<dyn AgentTransport>) -> Self {
        self.agent = Some(transport);
        self
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Resubmits calls interrupted by a previous shutdown, then starts the
    /// dispatch loop. Returns the number of recovered calls.
    pub fn start(&self) -> Result<usize, DispatchError> {
        let recovered = self.recover()?;
        self.queue.start()?;
        Ok(recovered)
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    pub fn execute_call(&self, request: CallRequest) -> Result<CallReport, DispatchError> {
        let mut reports = self.admit(vec![request])?;
        reports
            .pop()
            .ok_or_else(|| DispatchError::invalid("admission produced no report"))
    }

    /// Submits an itinerary: every request joins one new call group and the
    /// group is admitted or rejected as a whole. Reports follow submission order.
    pub fn execute_multiple_calls(
        &self,
        requests: Vec<CallRequest>,
    ) -> Result<Vec<CallReport>, DispatchError> {
        self.submit_group(requests, GroupId::generate())
    }

    fn submit_group(
        &self,
        mut requests: Vec<CallRequest>,
        group_id: GroupId,
    ) -> Result<Vec<CallReport>, DispatchError> {
        for request in &mut requests {
            request.set_group(group_id.clone());
        }
        self.admit(requests)
    }

    fn admit(&self, mut requests: Vec<CallRequest>) -> Result<Vec<CallReport>, DispatchError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let submitted: Vec<CallId> = requests.iter().map(|r| r.id().clone()).collect();
        let batch: HashSet<CallId> = submitted.iter().cloned().collect();
        if batch.len() != submitted.len() {
            return Err(DispatchError::invalid("duplicate call request id in submission"));
        }
        for request in &mut requests {
            if !self.queue.registry().contains(request.job()) {
                return Err(DispatchError::UnknownJob {
                    job: request.job().to_string(),
                });
            }
            if request.asynchronous() && request.cancel_hook().is_none() {
                if let Some(agent) = &self.agent {
                    request.set_cancel_hook(agent_cancel_hook(Arc::clone(agent)));
                }
            }
        }

        let preconditions: Vec<Decision> = requests
            .iter()
            .map(|request| check_preconditions(&self.guards, request.resources()))
            .collect();
        if preconditions.iter().any(Decision::is_rejected) {
            return Ok(self.reject_all(&requests, preconditions));
        }

        let ordered = topological_order(requests)?;
        let mut decisions: HashMap<CallId, Decision> = HashMap::new();
        let mut tasks = Vec::with_capacity(ordered.len());
        {
            let mut admission = self.queue.admission();
            for request in &ordered {
                if admission.dependency_status(request.id()) != DependencyStatus::Unknown {
                    return Err(DispatchError::invalid(format!(
                        "call request `{}` was already submitted",
                        request.id()
                    )));
                }
                for dependency in request.dependencies() {
                    if !batch.contains(dependency)
                        && admission.dependency_status(dependency) == DependencyStatus::Unknown
                    {
                        return Err(DispatchError::invalid(format!(
                            "call request `{}` depends on unknown call `{dependency}`",
                            request.id()
                        )));
                    }
                }
            }
            for request in ordered {
                let decision = detect(admission.claims(), request.resources());
                let blockers = match &decision {
                    Decision::Postponed { blockers, .. } => blockers.clone(),
                    _ => BTreeSet::new(),
                };
                let task = Arc::new(Task::new(request, self.queue.context().clone()));
                admission.insert(Arc::clone(&task), blockers);
                decisions.insert(task.id().clone(), decision);
                tasks.push(task);
            }
        }
        self.queue.enqueued(&tasks);

        let by_id: HashMap<&CallId, &Arc<Task>> = tasks.iter().map(|t| (t.id(), t)).collect();
        let mut reports = Vec::with_capacity(submitted.len());
        for id in &submitted {
            let (Some(task), Some(decision)) = (by_id.get(id), decisions.remove(id)) else {
                continue;
            };
            let response = match decision {
                Decision::Accepted => CallResponse::Accepted,
                Decision::Postponed { .. } => CallResponse::Postponed,
                Decision::Rejected { .. } => CallResponse::Rejected,
            };
            let log_event = match response {
                CallResponse::Postponed => "call.postponed",
                _ => "call.accepted",
            };
            self.queue.context().log.append(
                "info",
                log_event,
                &format!("task={id} call={}", task.request().describe()),
            );
            reports.push(CallReport {
                task_id: id.clone(),
                response,
                state: Some(task.state()),
                reasons: decision.reasons().to_vec(),
                group_id: task.request().group_id().cloned(),
            });
        }
        Ok(reports)
    }

    fn reject_all(&self, requests: &[CallRequest], decisions: Vec<Decision>) -> Vec<CallReport> {
        requests
            .iter()
            .zip(decisions)
            .map(|(request, decision)| {
                let reasons = match decision {
                    Decision::Rejected { reasons } => reasons,
                    _ => vec!["another call in the group was rejected".to_string()],
                };
                self.queue.context().log.append(
                    "warn",
                    "call.rejected",
                    &format!(
                        "task={} call={} reasons={}",
                        request.id(),
                        request.describe(),
                        reasons.join("; ")
                    ),
                );
                CallReport {
                    task_id: request.id().clone(),
                    response: CallResponse::Rejected,
                    state: None,
                    reasons,
                    group_id: request.group_id().cloned(),
                }
            })
            .collect()
    }

    /// Cancels one task. `Ok(false)` when it had already settled; waiting
    /// dependents are failed by the dispatch loop.
    pub fn cancel_call(&self, id: &CallId) -> Result<bool, DispatchError> {
        let task = self.task(id)?;
        let canceled = task.cancel()?;
        if canceled {
            self.queue
                .context()
                .log
                .append("info", "call.canceled", &format!("task={id}"));
        }
        self.queue.wake();
        Ok(canceled)
    }

    pub fn cancel_task(&self, id: &CallId) -> Result<bool, DispatchError> {
        self.cancel_call(id)
    }

    /// Cancels every task of a call group, returning the per-task outcome.
    pub fn cancel_multiple_calls(
        &self,
        group_id: &GroupId,
    ) -> BTreeMap<CallId, Result<bool, DispatchError>> {
        let criteria = FindCriteria {
            group_id: Some(group_id.clone()),
            ..FindCriteria::default()
        };
        self.queue
            .tasks()
            .into_iter()
            .filter(|task| criteria.matches(task))
            .map(|task| (task.id().clone(), self.cancel_call(task.id())))
            .collect()
    }

    pub fn complete_call_success(&self, id: &CallId, result: Value) -> Result<bool, DispatchError> {
        let task = self.async_task(id)?;
        let settled = task.succeed(result);
        self.queue.wake();
        Ok(settled)
    }

    pub fn complete_call_failure(
        &self,
        id: &CallId,
        message: impl Into<String>,
    ) -> Result<bool, DispatchError> {
        let task = self.async_task(id)?;
        let settled = task.fail(TaskError::call_failed(message));
        self.queue.wake();
        Ok(settled)
    }

    pub fn report_call_progress(&self, id: &CallId, progress: Value) -> Result<(), DispatchError> {
        self.task(id)?.set_progress(progress);
        Ok(())
    }

    pub fn handle_agent_reply(&self, reply: AgentReply) -> Result<bool, DispatchError> {
        match reply.status {
            AgentReplyStatus::Succeeded => self.complete_call_success(
                &reply.correlation_id,
                reply.result.unwrap_or(Value::Null),
            ),
            AgentReplyStatus::Failed => self.complete_call_failure(
                &reply.correlation_id,
                reply
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            ),
        }
    }

    pub fn get_task(&self, id: &CallId) -> Result<TaskReport, DispatchError> {
        Ok(self.task(id)?.report())
    }

    pub fn find_tasks(&self, criteria: &FindCriteria) -> Vec<TaskReport> {
        self.queue
            .tasks()
            .into_iter()
            .filter(|task| criteria.matches(task))
            .map(|task| task.report())
            .collect()
    }

    fn task(&self, id: &CallId) -> Result<Arc<Task>, DispatchError> {
        self.queue
            .find(id)
            .ok_or_else(|| DispatchError::UnknownTask {
                task_id: id.to_string(),
            })
    }

    fn async_task(&self, id: &CallId) -> Result<Arc<Task>, DispatchError> {
        let task = self.task(id)?;
        if !task.request().asynchronous() {
            return Err(DispatchError::invalid(format!(
                "task `{id}` is not asynchronous"
            )));
        }
        Ok(task)
    }

    fn recover(&self) -> Result<usize, DispatchError> {
        let ctx = self.queue.context();
        let mut documents = ctx.store.list_tasks()?;
        documents.sort_by_key(|doc| doc.enqueued_at);

        let interrupted: HashSet<CallId> = documents
            .iter()
            .filter(|doc| !doc.state.is_terminal())
            .map(|doc| doc.request.id.clone())
            .collect();
        // Calls that settled while the dispatch loop was down never released
        // their dependents; admission fails those whose dependency did not finish.
        let settled: HashMap<CallId, TaskState> = documents
            .iter()
            .filter(|doc| doc.state.is_terminal())
            .map(|doc| (doc.request.id.clone(), doc.state))
            .collect();
        self.queue
            .remember_outcomes(settled.iter().map(|(id, state)| (id.clone(), *state)));
        let mut ungrouped = Vec::new();
        let mut groups: Vec<(GroupId, Vec<CallRequest>)> = Vec::new();
        for doc in documents {
            if doc.state.is_terminal() {
                ctx.store.remove_task(&doc.request.id)?;
                continue;
            }
            let id = doc.request.id.clone();
            let mut request = match CallRequest::from_serialized(doc.request) {
                Ok(request) => request,
                Err(err) => {
                    ctx.log.append(
                        "error",
                        "queue.recovery_skipped",
                        &format!("task={id} error={err}"),
                    );
                    ctx.store.remove_task(&id)?;
                    continue;
                }
            };
            request.retain_dependencies(|dependency| {
                interrupted.contains(dependency) || settled.contains_key(dependency)
            });
            match request.group_id().cloned() {
                Some(group_id) => match groups.iter_mut().find(|(id, _)| id == &group_id) {
                    Some((_, members)) => members.push(request),
                    None => groups.push((group_id, vec![request])),
                },
                None => ungrouped.push(request),
            }
        }

        let mut recovered = 0;
        for request in ungrouped {
            recovered += self.resubmit(vec![request], None);
        }
        for (group_id, members) in groups {
            recovered += self.resubmit(members, Some(group_id));
        }
        Ok(recovered)
    }

    fn resubmit(&self, requests: Vec<CallRequest>, group_id: Option<GroupId>) -> usize {
        let ids: Vec<CallId> = requests.iter().map(|r| r.id().clone()).collect();
        let outcome = match group_id {
            Some(group_id) => self.submit_group(requests, group_id),
            None => self.admit(requests),
        };
        let log = &self.queue.context().log;
        match outcome {
            Ok(reports) => {
                let mut recovered = 0;
                for report in reports {
                    if report.response == CallResponse::Rejected {
                        let _ = self.queue.context().store.remove_task(&report.task_id);
                        log.append(
                            "warn",
                            "queue.recovery_rejected",
                            &format!("task={} reasons={}", report.task_id, report.reasons.join("; ")),
                        );
                        continue;
                    }
                    log.append("info", "queue.recovered", &format!("task={}", report.task_id));
                    recovered += 1;
                }
                recovered
            }
            Err(err) => {
                for id in &ids {
                    let _ = self.queue.context().store.remove_task(id);
                }
                log.append(
                    "error",
                    "queue.recovery_failed",
                    &format!("tasks={} error={err}", ids.len()),
                );
                0
            }
        }
    }
}

/// Orders a batch so every request follows the in-batch requests it depends
/// on; ties keep submission order. Fails on dependency cycles.
fn topological_order(requests: Vec<CallRequest>) -> Result<Vec<CallRequest>, DispatchError> {
    let ids: HashSet<CallId> = requests.iter().map(|r| r.id().clone()).collect();
    let mut remaining: Vec<Option<CallRequest>> = requests.into_iter().map(Some).collect();
    let mut placed: HashSet<CallId> = HashSet::new();
    let mut ordered = Vec::with_capacity(remaining.len());

    while ordered.len() < remaining.len() {
        let next = remaining.iter().position(|slot| {
            slot.as_ref().is_some_and(|request| {
                request
                    .dependencies()
                    .iter()
                    .all(|dep| !ids.contains(dep) || placed.contains(dep))
            })
        });
        let Some(index) = next else {
            return Err(DispatchError::invalid(
                "call requests contain a dependency cycle",
            ));
        };
        if let Some(request) = remaining[index].take() {
            placed.insert(request.id().clone());
            ordered.push(request);
        }
    }
    Ok(ordered)
}
