use super::resource::{Operation, ResourceOps, ResourceTag};
use crate::shared::ids::CallId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// Admission outcome for one call request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    Postponed {
        blockers: BTreeSet<CallId>,
        reasons: Vec<String>,
    },
    Rejected {
        reasons: Vec<String>,
    },
}

impl Decision {
    pub fn reasons(&self) -> &[String] {
        match self {
            Decision::Accepted => &[],
            Decision::Postponed { reasons, .. } | Decision::Rejected { reasons } => reasons,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Decision::Rejected { .. })
    }
}

/// Compares `request` against the resource claims of every non-terminal task.
/// Any overlapping tag where the two operations are not both `READ` becomes a
/// blocker. Never rejects.
pub fn detect<'a, I>(active: I, request: &ResourceOps) -> Decision
where
    I: IntoIterator<Item = (&'a CallId, &'a ResourceOps)>,
{
    let mut blockers = BTreeSet::new();
    let mut reasons = Vec::new();
    for (task_id, claims) in active {
        for op in request.iter() {
            let Some(held) = claims.operation_on(&op.tag) else {
                continue;
            };
            if op.operation.compatible_with(held) {
                continue;
            }
            blockers.insert(task_id.clone());
            reasons.push(format!(
                "{} on {} conflicts with {} held by task {}",
                op.operation, op.tag, held, task_id
            ));
        }
    }
    if blockers.is_empty() {
        Decision::Accepted
    } else {
        Decision::Postponed { blockers, reasons }
    }
}

/// Caller-supplied admission precondition. Returns a rejection reason when
/// `operation` on `tag` must not be admitted right now.
pub trait ResourceGuard: Send + Sync {
    fn check(&self, tag: &ResourceTag, operation: Operation) -> Option<String>;
}

pub fn check_preconditions(guards: &[Arc<dyn ResourceGuard>], request: &ResourceOps) -> Decision {
    let reasons: Vec<String> = request
        .iter()
        .flat_map(|op| {
            guards
                .iter()
                .filter_map(move |guard| guard.check(&op.tag, op.operation))
        })
        .collect();
    if reasons.is_empty() {
        Decision::Accepted
    } else {
        Decision::Rejected { reasons }
    }
}

/// Tags marked unavailable (for example a repository being deleted) reject
/// every operation until cleared.
#[derive(Debug, Default)]
pub struct UnavailableResources {
    marked: Mutex<BTreeMap<ResourceTag, String>>,
}

impl UnavailableResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, tag: ResourceTag, reason: impl Into<String>) {
        self.with_marked(|marked| {
            marked.insert(tag, reason.into());
        });
    }

    pub fn clear(&self, tag: &ResourceTag) -> bool {
        self.with_marked(|marked| marked.remove(tag).is_some())
    }

    pub fn is_unavailable(&self, tag: &ResourceTag) -> bool {
        self.with_marked(|marked| marked.contains_key(tag))
    }

    fn with_marked<T>(&self, f: impl FnOnce(&mut BTreeMap<ResourceTag, String>) -> T) -> T {
        match self.marked.lock() {
            Ok(mut marked) => f(&mut marked),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl ResourceGuard for UnavailableResources {
    fn check(&self, tag: &ResourceTag, operation: Operation) -> Option<String> {
        self.with_marked(|marked| {
            marked
                .get(tag)
                .map(|reason| format!("{operation} on {tag} rejected: {reason}"))
        })
    }
}
