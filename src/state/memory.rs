use std::sync::Mutex;

use crate::error::StateError;
use crate::resource::ResourceId;

use super::{StateDocument, StateRecord, StateStore};

/// Non-persistent store, used for tests and speculative runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    document: Mutex<StateDocument>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = StateRecord>) -> Self {
        let mut document = StateDocument::default();
        for record in records {
            document.upsert(record);
        }
        Self {
            document: Mutex::new(document),
        }
    }

    pub fn serial(&self) -> u64 {
        self.document.lock().map(|doc| doc.serial).unwrap_or_default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, id: &ResourceId) -> Result<Option<StateRecord>, StateError> {
        let doc = self.document.lock().map_err(|_| StateError::Poisoned)?;
        Ok(doc.resources.iter().find(|r| &r.id == id).cloned())
    }

    fn put(&self, record: StateRecord) -> Result<(), StateError> {
        let mut doc = self.document.lock().map_err(|_| StateError::Poisoned)?;
        doc.upsert(record);
        doc.serial += 1;
        Ok(())
    }

    fn delete(&self, id: &ResourceId) -> Result<(), StateError> {
        let mut doc = self.document.lock().map_err(|_| StateError::Poisoned)?;
        if doc.remove(id) {
            doc.serial += 1;
        }
        Ok(())
    }

    fn replace(&self, old: &ResourceId, record: StateRecord) -> Result<(), StateError> {
        let mut doc = self.document.lock().map_err(|_| StateError::Poisoned)?;
        doc.rebind(old, record);
        doc.serial += 1;
        Ok(())
    }

    fn list(&self) -> Result<Vec<StateRecord>, StateError> {
        let doc = self.document.lock().map_err(|_| StateError::Poisoned)?;
        Ok(doc.resources.clone())
    }
}
