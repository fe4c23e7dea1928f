use super::consumer::{unbind_itinerary, Binding};
use super::{action_tag, resource_tag, Itinerary};
use crate::dispatch::{CallRequest, DispatchError, Operation, ResourceTag};
use crate::shared::ids::{CallId, JobName};
use serde_json::Value;

pub const REPO_DELETE_JOB: &str = "repository.delete";

/// Unbinds every consumer bound to `repo_id`, then deletes the repository.
/// The delete only runs once every binding is gone.
pub fn repo_delete_itinerary(
    repo_id: &str,
    bindings: &[Binding],
    options: Value,
) -> Result<Itinerary, DispatchError> {
    let mut itinerary = Itinerary::new();
    let mut unbound: Vec<CallId> = Vec::with_capacity(bindings.len());
    for binding in bindings {
        if binding.repo_id != repo_id {
            return Err(DispatchError::invalid(format!(
                "binding of consumer `{}` is for repository `{}`, not `{repo_id}`",
                binding.consumer_id, binding.repo_id
            )));
        }
        let unbind = unbind_itinerary(binding, options.clone())?;
        if let Some(last) = unbind.ids().pop() {
            unbound.push(last);
        }
        itinerary.extend(unbind);
    }

    let repository = ResourceTag::repository(repo_id);
    let job = JobName::parse(REPO_DELETE_JOB).map_err(DispatchError::InvalidRequest)?;
    itinerary.after(
        &unbound,
        CallRequest::builder(job)
            .arg(repo_id)
            .tag(resource_tag(&repository))
            .tag(action_tag("delete"))
            .resource(repository, Operation::Delete)
            .archive(true),
    )?;
    Ok(itinerary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itinerary::DELETE_BINDING_JOB;
    use serde_json::json;

    #[test]
    fn delete_waits_for_every_binding_removal() {
        let bindings = [
            Binding::new("c1", "repo-1", "dist-1"),
            Binding::new("c2", "repo-1", "dist-1"),
        ];
        let itinerary = repo_delete_itinerary("repo-1", &bindings, json!({})).expect("itinerary");
        let requests = itinerary.requests();
        assert_eq!(requests.len(), 7);

        let delete = requests.last().expect("delete step");
        assert_eq!(delete.job().as_str(), REPO_DELETE_JOB);
        assert_eq!(
            delete.resources().operation_on(&ResourceTag::repository("repo-1")),
            Some(Operation::Delete)
        );
        let removals: Vec<&CallId> = requests
            .iter()
            .filter(|r| r.job().as_str() == DELETE_BINDING_JOB)
            .map(|r| r.id())
            .collect();
        assert_eq!(removals.len(), 2);
        assert!(removals.iter().all(|id| delete.dependencies().contains(*id)));
    }

    #[test]
    fn unbound_repository_deletes_directly() {
        let itinerary = repo_delete_itinerary("repo-1", &[], json!({})).expect("itinerary");
        assert_eq!(itinerary.len(), 1);
        assert!(itinerary.requests()[0].dependencies().is_empty());
    }

    #[test]
    fn rejects_bindings_of_other_repositories() {
        let err = repo_delete_itinerary(
            "repo-1",
            &[Binding::new("c1", "repo-2", "dist-1")],
            json!({}),
        )
        .expect_err("foreign binding");
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
    }
}
