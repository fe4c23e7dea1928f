pub mod agent;
pub mod call;
pub mod collision;
pub mod coordinator;
pub mod events;
pub mod job;
pub mod queue;
pub mod resource;
pub mod task;

pub use agent::{
    agent_cancel_hook, AgentJob, AgentMessage, AgentReply, AgentReplyStatus, AgentRequest,
    AgentTransport, ChannelTransport,
};
pub use call::{
    CallRequest, CallRequestBuilder, Callback, CancelHook, LifecycleEvent, SerializedCallRequest,
};
pub use collision::{check_preconditions, detect, Decision, ResourceGuard, UnavailableResources};
pub use coordinator::{CallReport, CallResponse, Coordinator, FindCriteria};
pub use events::{DispatchEvent, EventSink, JsonlEventSink, MemoryEventSink, NullEventSink};
pub use job::{job_fn, CallArgs, Job, JobContext, JobError, JobRegistry};
pub use queue::{QueueConfig, TaskQueue};
pub use resource::{Operation, ResourceOp, ResourceOps, ResourceTag, ResourceType};
pub use task::{DispatchContext, Task, TaskError, TaskErrorKind, TaskReport, TaskState};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid call request: {0}")]
    InvalidRequest(String),
    #[error("unknown job `{job}`")]
    UnknownJob { job: String },
    #[error("unknown task `{task_id}`")]
    UnknownTask { task_id: String },
    #[error("task `{task_id}` is running and has no cancel hook")]
    NotCancelable { task_id: String },
    #[error("cancel hook for task `{task_id}` failed: {message}")]
    HookFailed { task_id: String, message: String },
    #[error("task queue is not running")]
    QueueStopped,
    #[error("failed to spawn {worker} thread: {source}")]
    Spawn {
        worker: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

impl DispatchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}
