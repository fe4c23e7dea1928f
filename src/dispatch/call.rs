use super::job::CallArgs;
use super::resource::{Operation, ResourceOps, ResourceTag};
use super::task::TaskReport;
use super::DispatchError;
use crate::shared::ids::{CallId, GroupId, JobName, ScheduleId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_WEIGHT: u32 = 1;
const OBFUSCATED: &str = "**OBFUSCATED**";

/// Control hook invoked when a running task is asked to stop.
pub type CancelHook = Arc<dyn Fn(&TaskReport) -> Result<(), String> + Send + Sync>;
/// Lifecycle observer. Panics are caught and logged by the task.
pub type Callback = Arc<dyn Fn(&TaskReport) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleEvent {
    Enqueue,
    RunStart,
    Success,
    Failure,
    Cancel,
    Complete,
}

impl LifecycleEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::RunStart => "run-start",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancel => "cancel",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one unit of work: which job to run, with what
/// arguments, and which resources it reads or writes.
#[derive(Clone)]
pub struct CallRequest {
    id: CallId,
    job: JobName,
    args: CallArgs,
    resources: ResourceOps,
    weight: u32,
    tags: Vec<String>,
    archive: bool,
    asynchronous: bool,
    reply_timeout: Option<Duration>,
    obfuscate_args: bool,
    dependencies: BTreeSet<CallId>,
    group_id: Option<GroupId>,
    schedule_id: Option<ScheduleId>,
    cancel_hook: Option<CancelHook>,
    callbacks: BTreeMap<LifecycleEvent, Vec<Callback>>,
}

impl CallRequest {
    pub fn builder(job: JobName) -> CallRequestBuilder {
        CallRequestBuilder::new(job)
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn job(&self) -> &JobName {
        &self.job
    }

    pub fn args(&self) -> &CallArgs {
        &self.args
    }

    pub fn resources(&self) -> &ResourceOps {
        &self.resources
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn archive(&self) -> bool {
        self.archive
    }

    pub fn asynchronous(&self) -> bool {
        self.asynchronous
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout
    }

    pub fn dependencies(&self) -> &BTreeSet<CallId> {
        &self.dependencies
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        self.group_id.as_ref()
    }

    pub fn schedule_id(&self) -> Option<&ScheduleId> {
        self.schedule_id.as_ref()
    }

    pub fn cancel_hook(&self) -> Option<&CancelHook> {
        self.cancel_hook.as_ref()
    }

    pub fn callbacks(&self, event: LifecycleEvent) -> &[Callback] {
        self.callbacks
            .get(&event)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub(crate) fn set_group(&mut self, group_id: GroupId) {
        self.group_id = Some(group_id);
    }

    pub(crate) fn set_cancel_hook(&mut self, hook: CancelHook) {
        self.cancel_hook = Some(hook);
    }

    pub(crate) fn add_callback(&mut self, event: LifecycleEvent, callback: Callback) {
        self.callbacks.entry(event).or_default().push(callback);
    }

    pub(crate) fn retain_dependencies(&mut self, keep: impl Fn(&CallId) -> bool) {
        self.dependencies.retain(|id| keep(id));
    }

    /// `job(args, kwargs)` rendering used in logs; argument values are hidden
    /// when the request asks for obfuscation.
    pub fn describe(&self) -> String {
        if self.obfuscate_args {
            return format!("{}({OBFUSCATED})", self.job);
        }
        let mut parts: Vec<String> = self.args.args.iter().map(Value::to_string).collect();
        parts.extend(
            self.args
                .kwargs
                .iter()
                .map(|(key, value)| format!("{key}={value}")),
        );
        format!("{}({})", self.job, parts.join(", "))
    }

    pub fn to_serialized(&self) -> SerializedCallRequest {
        SerializedCallRequest {
            id: self.id.clone(),
            job: self.job.clone(),
            args: self.args.args.clone(),
            kwargs: self.args.kwargs.clone(),
            resources: self.resources.clone(),
            weight: self.weight,
            tags: self.tags.clone(),
            archive: self.archive,
            asynchronous: self.asynchronous,
            reply_timeout_secs: self.reply_timeout.map(|d| d.as_secs()),
            obfuscate_args: self.obfuscate_args,
            dependencies: self.dependencies.clone(),
            group_id: self.group_id.clone(),
            schedule_id: self.schedule_id.clone(),
        }
    }

    /// Rebuilds a request from its stored form. Hooks and callbacks are not
    /// persisted and come back empty.
    pub fn from_serialized(doc: SerializedCallRequest) -> Result<Self, DispatchError> {
        let mut builder = CallRequestBuilder::new(doc.job)
            .id(doc.id)
            .args(doc.args)
            .kwargs(doc.kwargs)
            .weight(doc.weight)
            .archive(doc.archive)
            .asynchronous(doc.asynchronous)
            .obfuscate_args(doc.obfuscate_args);
        for op in doc.resources.iter() {
            builder = builder.resource(op.tag.clone(), op.operation);
        }
        for tag in doc.tags {
            builder = builder.tag(tag);
        }
        for dependency in doc.dependencies {
            builder = builder.depends_on(dependency);
        }
        if let Some(secs) = doc.reply_timeout_secs {
            builder = builder.reply_timeout(Duration::from_secs(secs));
        }
        if let Some(schedule_id) = doc.schedule_id {
            builder = builder.schedule(schedule_id);
        }
        let mut request = builder.build()?;
        request.group_id = doc.group_id;
        Ok(request)
    }
}

impl fmt::Debug for CallRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRequest")
            .field("id", &self.id)
            .field("call", &self.describe())
            .field("resources", &self.resources)
            .field("weight", &self.weight)
            .field("dependencies", &self.dependencies)
            .field("group_id", &self.group_id)
            .field("has_cancel_hook", &self.cancel_hook.is_some())
            .finish_non_exhaustive()
    }
}

pub struct CallRequestBuilder {
    id: Option<CallId>,
    job: JobName,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    resources: Vec<(ResourceTag, Operation)>,
    weight: u32,
    tags: Vec<String>,
    archive: bool,
    asynchronous: bool,
    reply_timeout: Option<Duration>,
    obfuscate_args: bool,
    dependencies: BTreeSet<CallId>,
    schedule_id: Option<ScheduleId>,
    cancel_hook: Option<CancelHook>,
    callbacks: BTreeMap<LifecycleEvent, Vec<Callback>>,
}

impl CallRequestBuilder {
    fn new(job: JobName) -> Self {
        Self {
            id: None,
            job,
            args: Vec::new(),
            kwargs: Map::new(),
            resources: Vec::new(),
            weight: DEFAULT_WEIGHT,
            tags: Vec::new(),
            archive: false,
            asynchronous: false,
            reply_timeout: None,
            obfuscate_args: false,
            dependencies: BTreeSet::new(),
            schedule_id: None,
            cancel_hook: None,
            callbacks: BTreeMap::new(),
        }
    }

    pub fn id(mut self, id: CallId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn resource(mut self, tag: ResourceTag, operation: Operation) -> Self {
        self.resources.push((tag, operation));
        self
    }

    pub fn reads(self, tag: ResourceTag) -> Self {
        self.resource(tag, Operation::Read)
    }

    pub fn updates(self, tag: ResourceTag) -> Self {
        self.resource(tag, Operation::Update)
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn archive(mut self, archive: bool) -> Self {
        self.archive = archive;
        self
    }

    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    pub fn obfuscate_args(mut self, obfuscate: bool) -> Self {
        self.obfuscate_args = obfuscate;
        self
    }

    pub fn depends_on(mut self, id: CallId) -> Self {
        self.dependencies.insert(id);
        self
    }

    pub fn schedule(mut self, schedule_id: ScheduleId) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    pub fn cancel_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TaskReport) -> Result<(), String> + Send + Sync + 'static,
    {
        self.cancel_hook = Some(Arc::new(hook));
        self
    }

    /// Declares the job as cooperative: cancelling a running task only raises
    /// the flag the job polls through its context.
    pub fn cooperative_cancel(self) -> Self {
        self.cancel_hook(|_| Ok(()))
    }

    pub fn on<F>(mut self, event: LifecycleEvent, callback: F) -> Self
    where
        F: Fn(&TaskReport) + Send + Sync + 'static,
    {
        self.callbacks
            .entry(event)
            .or_default()
            .push(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<CallRequest, DispatchError> {
        let id = self.id.unwrap_or_else(CallId::generate);
        let resources = ResourceOps::try_from(self.resources).map_err(DispatchError::InvalidRequest)?;
        if self.dependencies.contains(&id) {
            return Err(DispatchError::invalid(format!(
                "call request `{id}` depends on itself"
            )));
        }
        Ok(CallRequest {
            id,
            job: self.job,
            args: CallArgs::new(self.args, self.kwargs),
            resources,
            weight: self.weight,
            tags: self.tags,
            archive: self.archive,
            asynchronous: self.asynchronous,
            reply_timeout: self.reply_timeout,
            obfuscate_args: self.obfuscate_args,
            dependencies: self.dependencies,
            group_id: None,
            schedule_id: self.schedule_id,
            cancel_hook: self.cancel_hook,
            callbacks: self.callbacks,
        })
    }
}

/// Persisted form of a call request. Carries everything except hooks and
/// callbacks, which are process-local closures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedCallRequest {
    pub id: CallId,
    pub job: JobName,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub resources: ResourceOps,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub archive: bool,
    #[serde(default)]
    pub asynchronous: bool,
    #[serde(default)]
    pub reply_timeout_secs: Option<u64>,
    #[serde(default)]
    pub obfuscate_args: bool,
    #[serde(default)]
    pub dependencies: BTreeSet<CallId>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub schedule_id: Option<ScheduleId>,
}

fn default_weight() -> u32 {
    DEFAULT_WEIGHT
}

impl SerializedCallRequest {
    /// Copy of this template for a fresh submission: new id, no group and no
    /// dependencies on earlier calls.
    pub fn reissue(&self, schedule_id: Option<&ScheduleId>) -> Self {
        Self {
            id: CallId::generate(),
            dependencies: BTreeSet::new(),
            group_id: None,
            schedule_id: schedule_id.cloned().or_else(|| self.schedule_id.clone()),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(name: &str) -> JobName {
        JobName::parse(name).expect("job name")
    }

    #[test]
    fn builder_collapses_identical_pairs_and_rejects_mixed_operations() {
        let request = CallRequest::builder(job("repo.sync"))
            .reads(ResourceTag::repository("x"))
            .reads(ResourceTag::repository("x"))
            .build()
            .expect("identical pairs collapse");
        assert_eq!(request.resources().len(), 1);

        let err = CallRequest::builder(job("repo.delete"))
            .resource(ResourceTag::repository("x"), Operation::Create)
            .resource(ResourceTag::repository("x"), Operation::Delete)
            .build()
            .expect_err("create and delete on one tag");
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
    }

    #[test]
    fn builder_rejects_self_dependency() {
        let id = CallId::generate();
        let err = CallRequest::builder(job("noop"))
            .id(id.clone())
            .depends_on(id)
            .build()
            .expect_err("self dependency");
        assert!(err.to_string().contains("depends on itself"));
    }

    #[test]
    fn describe_hides_obfuscated_arguments() {
        let plain = CallRequest::builder(job("user.create"))
            .arg("alice")
            .kwarg("admin", true)
            .build()
            .expect("build");
        assert_eq!(plain.describe(), "user.create(\"alice\", admin=true)");

        let hidden = CallRequest::builder(job("user.create"))
            .arg("secret-password")
            .obfuscate_args(true)
            .build()
            .expect("build");
        assert_eq!(hidden.describe(), "user.create(**OBFUSCATED**)");
    }

    #[test]
    fn serialized_form_survives_json_and_drops_closures() {
        let dependency = CallId::generate();
        let request = CallRequest::builder(job("repo.publish"))
            .arg("repo-1")
            .kwarg("distributor", "yum")
            .updates(ResourceTag::repository("repo-1"))
            .weight(2)
            .tag("pulp:action:publish")
            .archive(true)
            .depends_on(dependency.clone())
            .on(LifecycleEvent::Complete, |_| {})
            .cooperative_cancel()
            .build()
            .expect("build");

        let raw = serde_json::to_string(&request.to_serialized()).expect("encode");
        let decoded: SerializedCallRequest = serde_json::from_str(&raw).expect("decode");
        assert_eq!(decoded, request.to_serialized());
        assert_eq!(decoded.resources.operation_on(&ResourceTag::repository("repo-1")), Some(Operation::Update));

        let rebuilt = CallRequest::from_serialized(decoded).expect("rebuild");
        assert_eq!(rebuilt.id(), request.id());
        assert_eq!(rebuilt.args().args, vec![json!("repo-1")]);
        assert!(rebuilt.dependencies().contains(&dependency));
        assert!(rebuilt.cancel_hook().is_none());
        assert!(rebuilt.callbacks(LifecycleEvent::Complete).is_empty());
    }

    #[test]
    fn reissue_assigns_fresh_identity() {
        let template = CallRequest::builder(job("repo.sync"))
            .depends_on(CallId::generate())
            .build()
            .expect("build")
            .to_serialized();
        let schedule_id = ScheduleId::generate();
        let copy = template.reissue(Some(&schedule_id));
        assert_ne!(copy.id, template.id);
        assert!(copy.dependencies.is_empty());
        assert_eq!(copy.schedule_id, Some(schedule_id));
    }
}
