use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Repository,
    RepositoryImporter,
    RepositoryDistributor,
    Consumer,
    ConsumerGroup,
    ContentUnit,
    ContentType,
    Role,
    User,
    Schedule,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Repository => "repository",
            Self::RepositoryImporter => "repository_importer",
            Self::RepositoryDistributor => "repository_distributor",
            Self::Consumer => "consumer",
            Self::ConsumerGroup => "consumer_group",
            Self::ContentUnit => "content_unit",
            Self::ContentType => "content_type",
            Self::Role => "role",
            Self::User => "user",
            Self::Schedule => "schedule",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "repository" | "repo" => Ok(Self::Repository),
            "repository_importer" => Ok(Self::RepositoryImporter),
            "repository_distributor" => Ok(Self::RepositoryDistributor),
            "consumer" => Ok(Self::Consumer),
            "consumer_group" => Ok(Self::ConsumerGroup),
            "content_unit" => Ok(Self::ContentUnit),
            "content_type" => Ok(Self::ContentType),
            "role" => Ok(Self::Role),
            "user" => Ok(Self::User),
            "schedule" => Ok(Self::Schedule),
            _ => Err(format!("unknown resource type `{raw}`")),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(type, id)` pair naming a shared entity. Used purely as a lookup key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTag {
    pub resource_type: ResourceType,
    pub resource_id: String,
}

impl ResourceTag {
    pub fn new(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
        }
    }

    pub fn repository(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Repository, id)
    }

    pub fn consumer(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Consumer, id)
    }

    pub fn distributor(id: impl Into<String>) -> Self {
        Self::new(ResourceType::RepositoryDistributor, id)
    }

    /// Parses the `type:id` rendering produced by `Display`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (kind, id) = raw
            .split_once(':')
            .ok_or_else(|| format!("resource tag `{raw}` must look like `type:id`"))?;
        if id.trim().is_empty() {
            return Err(format!("resource tag `{raw}` has an empty id"));
        }
        Ok(Self::new(ResourceType::parse(kind)?, id.trim()))
    }
}

impl fmt::Display for ResourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.resource_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    /// Only two readers may share a resource; any writer on either side conflicts.
    pub fn compatible_with(self, other: Operation) -> bool {
        matches!((self, other), (Operation::Read, Operation::Read))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Read => "READ",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOp {
    pub tag: ResourceTag,
    pub operation: Operation,
}

/// Insertion-ordered set of resource operations claimed by one call request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceOps(Vec<ResourceOp>);

impl ResourceOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `(tag, operation)`. Re-adding an identical pair is a no-op; the same
    /// tag with a different operation is an error.
    pub fn insert(&mut self, tag: ResourceTag, operation: Operation) -> Result<(), String> {
        if let Some(existing) = self.0.iter().find(|op| op.tag == tag) {
            if existing.operation == operation {
                return Ok(());
            }
            return Err(format!(
                "resource `{tag}` is claimed with both {} and {}",
                existing.operation, operation
            ));
        }
        self.0.push(ResourceOp { tag, operation });
        Ok(())
    }

    pub fn operation_on(&self, tag: &ResourceTag) -> Option<Operation> {
        self.0
            .iter()
            .find(|op| &op.tag == tag)
            .map(|op| op.operation)
    }

    pub fn touches(&self, tag: &ResourceTag) -> bool {
        self.operation_on(tag).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceOp> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<(ResourceTag, Operation)>> for ResourceOps {
    type Error = String;

    fn try_from(pairs: Vec<(ResourceTag, Operation)>) -> Result<Self, Self::Error> {
        let mut ops = Self::new();
        for (tag, operation) in pairs {
            ops.insert(tag, operation)?;
        }
        Ok(ops)
    }
}
