use super::call::CancelHook;
use super::job::{CallArgs, Job, JobContext, JobError};
use super::task::TaskReport;
use crate::shared::ids::CallId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

/// Outbound request to a remote agent. The correlation id is the task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub operation: String,
    pub args: CallArgs,
    pub reply_to: String,
    pub correlation_id: CallId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentReplyStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
    pub correlation_id: CallId,
    pub status: AgentReplyStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentReply {
    pub fn succeeded(correlation_id: CallId, result: Value) -> Self {
        Self {
            correlation_id,
            status: AgentReplyStatus::Succeeded,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(correlation_id: CallId, error: impl Into<String>) -> Self {
        Self {
            correlation_id,
            status: AgentReplyStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Black-box RPC channel to remote agents.
pub trait AgentTransport: Send + Sync {
    fn send(&self, request: &AgentRequest) -> Result<(), String>;
    fn cancel(&self, correlation_id: &CallId) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    Request(AgentRequest),
    Cancel { correlation_id: CallId },
}

/// In-process transport that forwards every message over an mpsc channel.
#[derive(Debug)]
pub struct ChannelTransport {
    sender: Mutex<Sender<AgentMessage>>,
}

impl ChannelTransport {
    pub fn new(sender: Sender<AgentMessage>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }

    fn forward(&self, message: AgentMessage) -> Result<(), String> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| "agent channel lock poisoned".to_string())?;
        sender
            .send(message)
            .map_err(|_| "agent channel disconnected".to_string())
    }
}

impl AgentTransport for ChannelTransport {
    fn send(&self, request: &AgentRequest) -> Result<(), String> {
        self.forward(AgentMessage::Request(request.clone()))
    }

    fn cancel(&self, correlation_id: &CallId) -> Result<(), String> {
        self.forward(AgentMessage::Cancel {
            correlation_id: correlation_id.clone(),
        })
    }
}

/// Job that hands its call to a remote agent and returns immediately. The
/// submitting request must be asynchronous; the task settles when the reply
/// arrives through the coordinator.
pub struct AgentJob {
    transport: Arc<dyn AgentTransport>,
    operation: String,
    reply_to: String,
}

impl AgentJob {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        operation: impl Into<String>,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            operation: operation.into(),
            reply_to: reply_to.into(),
        }
    }
}

impl Job for AgentJob {
    fn run(&self, ctx: &JobContext<'_>, args: &CallArgs) -> Result<Value, JobError> {
        let request = AgentRequest {
            operation: self.operation.clone(),
            args: args.clone(),
            reply_to: self.reply_to.clone(),
            correlation_id: ctx.task_id().clone(),
        };
        self.transport
            .send(&request)
            .map_err(|err| JobError::failed(format!("agent request failed: {err}")))?;
        Ok(Value::Null)
    }
}

pub fn agent_cancel_hook(transport: Arc<dyn AgentTransport>) -> CancelHook {
    Arc::new(move |report: &TaskReport| transport.cancel(&report.task_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn channel_transport_forwards_requests_and_cancels() {
        let (tx, rx) = channel();
        let transport = ChannelTransport::new(tx);
        let id = CallId::generate();
        transport
            .send(&AgentRequest {
                operation: "bind".to_string(),
                args: CallArgs::default(),
                reply_to: "tasking.replies".to_string(),
                correlation_id: id.clone(),
            })
            .expect("send");
        transport.cancel(&id).expect("cancel");

        assert!(matches!(rx.recv().expect("request"), AgentMessage::Request(req) if req.correlation_id == id));
        assert_eq!(
            rx.recv().expect("cancel"),
            AgentMessage::Cancel { correlation_id: id }
        );
    }

    #[test]
    fn reply_json_uses_lowercase_status() {
        let reply = AgentReply::failed(CallId::generate(), "consumer offline");
        let raw = serde_json::to_value(&reply).expect("encode");
        assert_eq!(raw["status"], "failed");
        assert_eq!(raw["error"], "consumer offline");
    }

    #[test]
    fn disconnected_channel_reports_error() {
        let (tx, rx) = channel();
        drop(rx);
        let transport = ChannelTransport::new(tx);
        let err = transport.cancel(&CallId::generate()).expect_err("disconnected");
        assert!(err.contains("disconnected"));
    }
}
