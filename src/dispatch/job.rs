use super::task::Task;
use crate::shared::ids::{CallId, JobName};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Positional and keyword arguments handed to a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, JobError> {
        let value = self.args.get(index).ok_or_else(|| {
            JobError::InvalidArguments(format!("missing positional argument {index}"))
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, JobError> {
        let value = self.kwargs.get(name).ok_or_else(|| {
            JobError::InvalidArguments(format!("missing keyword argument `{name}`"))
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn kwarg_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T, JobError> {
        match self.kwargs.get(name) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(default),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("argument decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("job observed cancellation")]
    Canceled,
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Handle a running job uses to observe cancellation and publish progress.
pub struct JobContext<'a> {
    task: &'a Task,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(task: &'a Task) -> Self {
        Self { task }
    }

    pub fn task_id(&self) -> &CallId {
        self.task.id()
    }

    pub fn is_canceled(&self) -> bool {
        self.task.cancel_requested()
    }

    pub fn report_progress(&self, progress: Value) {
        self.task.set_progress(progress);
    }
}

/// One executable operation type. Jobs are registered by name and resolved when
/// a task runs; the call request only carries the name and JSON arguments.
pub trait Job: Send + Sync {
    fn run(&self, ctx: &JobContext<'_>, args: &CallArgs) -> Result<Value, JobError>;
}

impl<F> Job for F
where
    F: Fn(&JobContext<'_>, &CallArgs) -> Result<Value, JobError> + Send + Sync,
{
    fn run(&self, ctx: &JobContext<'_>, args: &CallArgs) -> Result<Value, JobError> {
        self(ctx, args)
    }
}

/// Pins a closure to the `Job` signature so argument and error types infer.
pub fn job_fn<F>(f: F) -> F
where
    F: Fn(&JobContext<'_>, &CallArgs) -> Result<Value, JobError> + Send + Sync,
{
    f
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<JobName, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: JobName, job: impl Job + 'static) -> &mut Self {
        self.jobs.insert(name, Arc::new(job));
        self
    }

    pub fn get(&self, name: &JobName) -> Option<Arc<dyn Job>> {
        self.jobs.get(name).cloned()
    }

    pub fn contains(&self, name: &JobName) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn names(&self) -> Vec<&JobName> {
        self.jobs.keys().collect()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.jobs.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_args_decode_positional_and_keyword_values() {
        let args = CallArgs::new(
            vec![json!("repo-1"), json!(3)],
            Map::from_iter([("force".to_string(), json!(true))]),
        );
        assert_eq!(args.arg::<String>(0).expect("repo id"), "repo-1");
        assert_eq!(args.arg::<u32>(1).expect("count"), 3);
        assert!(args.kwarg::<bool>("force").expect("force"));
        assert!(!args.kwarg_or("dry_run", false).expect("default"));

        let err = args.arg::<String>(5).expect_err("missing arg");
        assert!(err.to_string().contains("missing positional argument 5"));
        args.arg::<u32>(0).expect_err("type mismatch");
    }

    #[test]
    fn registry_resolves_registered_closures() {
        let mut registry = JobRegistry::new();
        registry.register(
            JobName::parse("noop").expect("name"),
            job_fn(|_, _| Ok(Value::Null)),
        );
        assert!(registry.contains(&JobName::parse("noop").expect("name")));
        assert!(registry.get(&JobName::parse("other").expect("name")).is_none());
        assert_eq!(registry.names().len(), 1);
    }
}
