//! Subgroup type registry.
//!
//! Applications declare their subgroup types as entries in a registry; the
//! type id is the entry's index in declaration order, and every dispatch
//! (state transfer at joins, persistence detection, replica construction)
//! goes through the entry's closures rather than compile-time type
//! machinery.

use std::sync::Arc;

use crate::{SubgroupId, SubgroupTypeId};

pub type StateSerializer = Arc<dyn Fn(SubgroupId) -> anyhow::Result<Vec<u8>> + Send + Sync>;
pub type StateDeserializer = Arc<dyn Fn(SubgroupId, &[u8]) -> anyhow::Result<()> + Send + Sync>;
pub type ReplicaFactory = Arc<dyn Fn(SubgroupId) + Send + Sync>;

/// Dispatch table for one subgroup type.
#[derive(Clone)]
pub struct SubgroupTypeEntry {
    pub name: String,
    /// Persistent types get version logs, ragged-trim records, and state
    /// shipping at total restart.
    pub has_persistent_fields: bool,
    /// Captures the current replica state for shipping to a joiner.
    pub serialize_state: StateSerializer,
    /// Installs shipped state into the local replica.
    pub deserialize_state: StateDeserializer,
    /// Constructs the local replica when this node first joins a shard.
    pub make_replica: ReplicaFactory,
}

impl SubgroupTypeEntry {
    /// An entry with no replica state to ship and nothing persistent; the
    /// delivery callbacks are the whole application surface.
    pub fn volatile(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            has_persistent_fields: false,
            serialize_state: Arc::new(|_| Ok(Vec::new())),
            deserialize_state: Arc::new(|_, _| Ok(())),
            make_replica: Arc::new(|_| {}),
        }
    }

    pub fn persistent(
        name: impl Into<String>,
        serialize_state: StateSerializer,
        deserialize_state: StateDeserializer,
    ) -> Self {
        Self {
            name: name.into(),
            has_persistent_fields: true,
            serialize_state,
            deserialize_state,
            make_replica: Arc::new(|_| {}),
        }
    }
}

/// Ordered collection of subgroup types. The declaration order is part of
/// the group's identity and must match at every member.
#[derive(Clone, Default)]
pub struct SubgroupRegistry {
    entries: Vec<SubgroupTypeEntry>,
}

impl SubgroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: SubgroupTypeEntry) -> SubgroupTypeId {
        self.entries.push(entry);
        (self.entries.len() - 1) as SubgroupTypeId
    }

    pub fn entries(&self) -> &[SubgroupTypeEntry] {
        &self.entries
    }

    pub fn entry(&self, type_id: SubgroupTypeId) -> Option<&SubgroupTypeEntry> {
        self.entries.get(type_id as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn any_persistent(&self) -> bool {
        self.entries.iter().any(|e| e.has_persistent_fields)
    }
}
