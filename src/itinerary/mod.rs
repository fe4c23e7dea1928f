pub mod consumer;
pub mod repository;

pub use consumer::{
    bind_itinerary, forced_unbind_itinerary, unbind_itinerary, Binding, AGENT_BIND_JOB,
    AGENT_UNBIND_JOB, BIND_JOB, DELETE_BINDING_JOB, UNBIND_JOB,
};
pub use repository::{repo_delete_itinerary, REPO_DELETE_JOB};

use crate::dispatch::{CallReport, CallRequest, CallRequestBuilder, Coordinator, DispatchError};
use crate::dispatch::ResourceTag;
use crate::shared::ids::CallId;

/// `resource:<type>:<id>` search tag for a resource.
pub fn resource_tag(tag: &ResourceTag) -> String {
    format!("resource:{tag}")
}

/// `action:<name>` search tag for the operation a call performs.
pub fn action_tag(action: &str) -> String {
    format!("action:{action}")
}

/// Ordered list of call requests linked by dependency edges. Submitted as
/// one call group through `Coordinator::execute_multiple_calls`.
#[derive(Debug, Default)]
pub struct Itinerary {
    requests: Vec<CallRequest>,
}

impl Itinerary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a step with no dependency on earlier steps.
    pub fn push(&mut self, request: CallRequest) -> CallId {
        let id = request.id().clone();
        self.requests.push(request);
        id
    }

    /// Adds a step that runs only after every call in `dependencies` finished.
    pub fn after(
        &mut self,
        dependencies: &[CallId],
        builder: CallRequestBuilder,
    ) -> Result<CallId, DispatchError> {
        let builder = dependencies
            .iter()
            .cloned()
            .fold(builder, CallRequestBuilder::depends_on);
        Ok(self.push(builder.build()?))
    }

    /// Adds a step depending on the most recently added one.
    pub fn then(&mut self, builder: CallRequestBuilder) -> Result<CallId, DispatchError> {
        let previous: Vec<CallId> = self
            .requests
            .last()
            .map(|request| vec![request.id().clone()])
            .unwrap_or_default();
        self.after(&previous, builder)
    }

    /// Appends every step of `other`, keeping its internal edges.
    pub fn extend(&mut self, other: Itinerary) {
        self.requests.extend(other.requests);
    }

    pub fn requests(&self) -> &[CallRequest] {
        &self.requests
    }

    pub fn ids(&self) -> Vec<CallId> {
        self.requests.iter().map(|r| r.id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn into_requests(self) -> Vec<CallRequest> {
        self.requests
    }

    pub fn submit(self, coordinator: &Coordinator) -> Result<Vec<CallReport>, DispatchError> {
        coordinator.execute_multiple_calls(self.requests)
    }
}
