//! Resource records held in the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of thing a resource represents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Datasets, documents, cached results.
    Data,
    /// CPU/GPU slots, worker quotas.
    Computational,
    /// Anything else, labelled by the caller.
    Other(String),
}

/// How many agents may hold a resource at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// At most one holder.
    Exclusive,
    /// Up to `capacity` holders.
    Shared,
}

/// Parameters for creating a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    pub kind: ResourceKind,
    pub mode: AccessMode,
    /// Ignored for exclusive resources (always 1).
    pub capacity: usize,
    pub owner: String,
    #[serde(default)]
    pub payload: Value,
}

impl ResourceSpec {
    /// An exclusive resource with an empty payload.
    pub fn exclusive(name: impl Into<String>, kind: ResourceKind, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            mode: AccessMode::Exclusive,
            capacity: 1,
            owner: owner.into(),
            payload: Value::Null,
        }
    }

    /// A shared resource admitting up to `capacity` concurrent holders.
    pub fn shared(
        name: impl Into<String>,
        kind: ResourceKind,
        capacity: usize,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            mode: AccessMode::Shared,
            capacity,
            owner: owner.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Effective capacity: 1 for exclusive resources.
    pub fn effective_capacity(&self) -> usize {
        match self.mode {
            AccessMode::Exclusive => 1,
            AccessMode::Shared => self.capacity,
        }
    }
}

/// A registered resource and its current holders.
///
/// Invariant: `holders.len() <= capacity`; an empty holder list means the
/// resource is fully released.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub name: String,
    pub kind: ResourceKind,
    pub mode: AccessMode,
    pub capacity: usize,
    pub owner: String,
    pub payload: Value,
    /// Current holders in grant order.
    pub holders: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Resource {
    pub(crate) fn from_spec(id: String, spec: ResourceSpec) -> Self {
        let capacity = spec.effective_capacity();
        Self {
            id,
            name: spec.name,
            kind: spec.kind,
            mode: spec.mode,
            capacity,
            owner: spec.owner,
            payload: spec.payload,
            holders: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.holders.len() < self.capacity
    }

    pub fn is_held_by(&self, agent_id: &str) -> bool {
        self.holders.iter().any(|h| h == agent_id)
    }

    pub fn is_released(&self) -> bool {
        self.holders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_capacity_is_one() {
        let mut spec = ResourceSpec::exclusive("db", ResourceKind::Data, "owner");
        spec.capacity = 10;
        assert_eq!(spec.effective_capacity(), 1);
    }

    #[test]
    fn test_resource_capacity_tracking() {
        let spec = ResourceSpec::shared("gpu", ResourceKind::Computational, 2, "ops");
        let mut res = Resource::from_spec("r1".into(), spec);
        assert!(res.is_released());
        res.holders.push("a".into());
        assert!(res.has_capacity());
        res.holders.push("b".into());
        assert!(!res.has_capacity());
        assert!(res.is_held_by("b"));
    }
}
