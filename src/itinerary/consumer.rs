use super::{action_tag, resource_tag, Itinerary};
use crate::dispatch::{CallRequest, CallRequestBuilder, DispatchError, ResourceTag};
use crate::shared::ids::JobName;
use serde_json::Value;

pub const BIND_JOB: &str = "consumer.bind";
pub const AGENT_BIND_JOB: &str = "consumer.agent_bind";
pub const UNBIND_JOB: &str = "consumer.unbind";
pub const AGENT_UNBIND_JOB: &str = "consumer.agent_unbind";
pub const DELETE_BINDING_JOB: &str = "consumer.delete_binding";

/// A consumer bound to one distributor of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub consumer_id: String,
    pub repo_id: String,
    pub distributor_id: String,
}

impl Binding {
    pub fn new(
        consumer_id: impl Into<String>,
        repo_id: impl Into<String>,
        distributor_id: impl Into<String>,
    ) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            repo_id: repo_id.into(),
            distributor_id: distributor_id.into(),
        }
    }

    fn resources(&self) -> [ResourceTag; 3] {
        [
            ResourceTag::consumer(&self.consumer_id),
            ResourceTag::repository(&self.repo_id),
            ResourceTag::distributor(&self.distributor_id),
        ]
    }

    /// Every binding call reads the consumer, repository and distributor.
    fn step(&self, job: &str, action: &str) -> Result<CallRequestBuilder, DispatchError> {
        let job = JobName::parse(job).map_err(DispatchError::InvalidRequest)?;
        let mut builder = CallRequest::builder(job)
            .arg(self.consumer_id.as_str())
            .arg(self.repo_id.as_str())
            .arg(self.distributor_id.as_str())
            .archive(true);
        for tag in self.resources() {
            builder = builder.tag(resource_tag(&tag)).reads(tag);
        }
        Ok(builder.tag(action_tag(action)))
    }

    /// Remote agent notification. Completes when the agent replies.
    fn agent_step(
        &self,
        job: &str,
        action: &str,
        options: &Value,
    ) -> Result<CallRequestBuilder, DispatchError> {
        Ok(self
            .step(job, action)?
            .kwarg("options", options.clone())
            .asynchronous(true))
    }
}

/// Creates the bind record, then notifies the consumer's agent when
/// `notify_agent` is set. The notification never runs if the bind fails.
pub fn bind_itinerary(
    binding: &Binding,
    notify_agent: bool,
    binding_config: Value,
    options: Value,
) -> Result<Itinerary, DispatchError> {
    let mut itinerary = Itinerary::new();
    itinerary.then(
        binding
            .step(BIND_JOB, "bind")?
            .weight(0)
            .kwarg("notify_agent", notify_agent)
            .kwarg("binding_config", binding_config),
    )?;
    if notify_agent {
        itinerary.then(binding.agent_step(AGENT_BIND_JOB, "agent_bind", &options)?)?;
    }
    Ok(itinerary)
}

/// Marks the binding deleted, asks the agent to unbind and removes the
/// binding once the agent confirms.
pub fn unbind_itinerary(binding: &Binding, options: Value) -> Result<Itinerary, DispatchError> {
    let mut itinerary = Itinerary::new();
    itinerary.then(binding.step(UNBIND_JOB, "unbind")?.weight(0))?;
    itinerary.then(binding.agent_step(AGENT_UNBIND_JOB, "agent_unbind", &options)?)?;
    itinerary.then(binding.step(DELETE_BINDING_JOB, "delete_binding")?.weight(0))?;
    Ok(itinerary)
}

/// Like `unbind_itinerary`, but the binding is removed without waiting for
/// the agent, whose notification runs alongside.
pub fn forced_unbind_itinerary(
    binding: &Binding,
    options: Value,
) -> Result<Itinerary, DispatchError> {
    let mut itinerary = Itinerary::new();
    let unbind = itinerary.then(binding.step(UNBIND_JOB, "unbind")?.weight(0))?;
    itinerary.after(
        &[unbind.clone()],
        binding
            .step(DELETE_BINDING_JOB, "delete_binding")?
            .weight(0)
            .kwarg("force", true),
    )?;
    itinerary.after(
        &[unbind],
        binding.agent_step(AGENT_UNBIND_JOB, "agent_unbind", &options)?,
    )?;
    Ok(itinerary)
}
