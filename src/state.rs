//! Persistent record of what the engine has created.
//!
//! The store is the single source of truth for planning: the provider is never
//! consulted to decide what to do, only to do it.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::resource::{Attributes, ResourceId};

pub const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: ResourceId,
    pub provider_id: String,
    /// Attribute values last sent to the provider.
    #[serde(default)]
    pub attributes: Attributes,
    /// Values the provider computed (always includes `id`).
    #[serde(default)]
    pub outputs: Attributes,
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,
}

impl StateRecord {
    /// Looks an attribute up the way downstream references see it.
    ///
    /// Declared values win over outputs of the same name, matching what the
    /// planner renders for a declared attribute.
    pub fn lookup(&self, attribute: &str) -> Option<&serde_json::Value> {
        self.attributes
            .get(attribute)
            .or_else(|| self.outputs.get(attribute))
    }

    /// Declared values layered over outputs, as exposed to dependents.
    pub fn exposed(&self) -> Attributes {
        let mut merged = self.outputs.clone();
        merged.extend(self.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: u32,
    pub serial: u64,
    #[serde(default)]
    pub resources: Vec<StateRecord>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            serial: 0,
            resources: Vec::new(),
        }
    }
}

impl StateDocument {
    pub fn validate(&self, location: &str) -> Result<(), StateError> {
        let corrupt = |message: String| StateError::Corruption {
            location: location.to_string(),
            message,
        };

        if self.version != STATE_FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported state version {} (expected {})",
                self.version, STATE_FORMAT_VERSION
            )));
        }

        let mut seen = HashSet::with_capacity(self.resources.len());
        for record in &self.resources {
            if !seen.insert(&record.id) {
                return Err(corrupt(format!("{} is recorded more than once", record.id)));
            }
            if record.provider_id.trim().is_empty() {
                return Err(corrupt(format!("{} has an empty provider id", record.id)));
            }
        }
        Ok(())
    }

    pub fn upsert(&mut self, record: StateRecord) {
        match self.resources.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => {
                self.resources.push(record);
                self.resources.sort_by(|a, b| a.id.cmp(&b.id));
            }
        }
    }

    /// Stores `record` in place of the record under `old`.
    pub fn rebind(&mut self, old: &ResourceId, record: StateRecord) {
        if &record.id != old {
            self.remove(old);
        }
        self.upsert(record);
    }

    pub fn remove(&mut self, id: &ResourceId) -> bool {
        let before = self.resources.len();
        self.resources.retain(|r| &r.id != id);
        before != self.resources.len()
    }
}

/// Storage for state records. `put`, `delete` and `replace` are atomic:
/// after they return `Ok`, the change survives a process exit.
pub trait StateStore: Send + Sync {
    fn get(&self, id: &ResourceId) -> Result<Option<StateRecord>, StateError>;
    fn put(&self, record: StateRecord) -> Result<(), StateError>;
    fn delete(&self, id: &ResourceId) -> Result<(), StateError>;
    /// Stores `record` and drops the record under `old` in one commit.
    fn replace(&self, old: &ResourceId, record: StateRecord) -> Result<(), StateError>;
    /// All records, sorted by logical id.
    fn list(&self) -> Result<Vec<StateRecord>, StateError>;
}

#[cfg(test)]
pub(crate) fn record(id: ResourceId, provider_id: &str) -> StateRecord {
    StateRecord {
        outputs: Attributes::from([("id".to_string(), serde_json::json!(provider_id))]),
        id,
        provider_id: provider_id.to_string(),
        attributes: Attributes::new(),
        dependencies: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_prefers_declared_values() {
        let mut rec = record(ResourceId::new("network", "main"), "net-1");
        rec.attributes.insert("name".to_string(), serde_json::json!("main"));
        rec.outputs.insert("name".to_string(), serde_json::json!("MAIN"));
        rec.outputs.insert("arn".to_string(), serde_json::json!("sim:network:net-1"));

        assert_eq!(rec.lookup("name"), Some(&serde_json::json!("main")));
        assert_eq!(rec.lookup("id"), Some(&serde_json::json!("net-1")));
        assert_eq!(rec.lookup("missing"), None);

        let exposed = rec.exposed();
        assert_eq!(exposed["name"], "main");
        assert_eq!(exposed["arn"], "sim:network:net-1");
        assert_eq!(exposed.get("name"), rec.lookup("name"));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let doc = StateDocument {
            resources: vec![
                record(ResourceId::new("a", "b"), "1"),
                record(ResourceId::new("a", "b"), "2"),
            ],
            ..Default::default()
        };
        assert!(matches!(doc.validate("test"), Err(StateError::Corruption { .. })));
    }

    #[test]
    fn test_validate_rejects_unknown_version() {
        let doc = StateDocument {
            version: 99,
            ..Default::default()
        };
        assert!(matches!(doc.validate("test"), Err(StateError::Corruption { .. })));
    }

    #[test]
    fn test_validate_rejects_empty_provider_id() {
        let doc = StateDocument {
            resources: vec![record(ResourceId::new("a", "b"), " ")],
            ..Default::default()
        };
        assert!(doc.validate("test").is_err());
    }

    #[test]
    fn test_upsert_keeps_sorted_order() {
        let mut doc = StateDocument::default();
        doc.upsert(record(ResourceId::new("subnet", "b"), "2"));
        doc.upsert(record(ResourceId::new("network", "a"), "1"));
        doc.upsert(record(ResourceId::new("subnet", "b"), "3"));

        assert_eq!(doc.resources.len(), 2);
        assert_eq!(doc.resources[0].id, ResourceId::new("network", "a"));
        assert_eq!(doc.resources[1].provider_id, "3");
        assert!(doc.remove(&ResourceId::new("network", "a")));
        assert!(!doc.remove(&ResourceId::new("network", "a")));
    }

    #[test]
    fn test_rebind_moves_record() {
        let mut doc = StateDocument::default();
        doc.upsert(record(ResourceId::new("subnet", "s"), "sn-1"));

        let mut moved = record(ResourceId::indexed("subnet", "s", 0), "sn-1");
        moved.attributes.insert("cidr".to_string(), serde_json::json!("10.0.1.0/24"));
        doc.rebind(&ResourceId::new("subnet", "s"), moved);

        assert_eq!(doc.resources.len(), 1);
        assert_eq!(doc.resources[0].id, ResourceId::indexed("subnet", "s", 0));
        assert!(doc.validate("test").is_ok());
    }
}
