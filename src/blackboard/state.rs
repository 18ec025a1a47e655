//! Keyed shared state with versioned entries.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::events::{EventKind, EventLog};

/// The current value under a key and who wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub value: Value,
    /// Agent that performed the latest write.
    pub written_by: String,
    /// Starts at 1 and increases with every write to the key.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Blackboard key/value store. Writes are published as
/// [`EventKind::StateUpdated`] with the previous and new value, so the
/// event log doubles as the full mutation history.
pub struct SharedState {
    entries: RwLock<HashMap<String, StateEntry>>,
    log: Arc<EventLog>,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("keys", &self.entries.read().len())
            .finish()
    }
}

impl SharedState {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            log,
        }
    }

    /// Write a value and return its new version.
    pub fn write(&self, key: impl Into<String>, value: Value, agent_id: &str) -> u64 {
        let key = key.into();
        let (previous, version) = {
            let mut entries = self.entries.write();
            let previous = entries.get(&key).cloned();
            let version = previous.as_ref().map_or(1, |e| e.version + 1);
            entries.insert(
                key.clone(),
                StateEntry {
                    value: value.clone(),
                    written_by: agent_id.to_string(),
                    version,
                    updated_at: Utc::now(),
                },
            );
            (previous.map(|e| e.value), version)
        };

        self.log.publish(
            EventKind::StateUpdated,
            json!({
                "key": key,
                "old_value": previous,
                "new_value": value,
                "version": version,
            }),
            Some(agent_id),
        );
        version
    }

    pub fn read(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    pub fn entry(&self, key: &str) -> Option<StateEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Copy of every current value.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.entries
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Every value ever written to `key`, oldest first, rebuilt from the log.
    pub fn history(&self, key: &str) -> Vec<Value> {
        self.log
            .recent(usize::MAX, Some(&EventKind::StateUpdated))
            .into_iter()
            .filter(|e| e.data["key"] == key)
            .map(|e| e.data["new_value"].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
