use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StateError;
use crate::resource::ResourceId;

use super::{StateDocument, StateRecord, StateStore};

/// JSON state file guarded by a whole-store lock.
///
/// Every mutation rewrites the document to a sibling temp file, syncs it and
/// renames it over the original, so a crash leaves either the old or the new
/// document on disk, never a torn one.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    document: Mutex<StateDocument>,
}

impl FileStateStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let location = path.display().to_string();

        let document = match fs::read_to_string(&path) {
            Ok(content) => {
                let document: StateDocument =
                    serde_json::from_str(&content).map_err(|e| StateError::Corruption {
                        location: location.clone(),
                        message: format!("unreadable state document: {}", e),
                    })?;
                document.validate(&location)?;
                tracing::debug!(
                    path = %location,
                    serial = document.serial,
                    resources = document.resources.len(),
                    "loaded state"
                );
                document
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %location, "no state file, starting empty");
                StateDocument::default()
            }
            Err(e) => return Err(StateError::Io(e)),
        };

        Ok(Self {
            path,
            document: Mutex::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn serial(&self) -> Result<u64, StateError> {
        Ok(self.document.lock().map_err(|_| StateError::Poisoned)?.serial)
    }

    fn commit(&self, mutate: impl FnOnce(&mut StateDocument) -> bool) -> Result<(), StateError> {
        let mut guard = self.document.lock().map_err(|_| StateError::Poisoned)?;

        let mut next = guard.clone();
        if !mutate(&mut next) {
            return Ok(());
        }
        next.serial += 1;

        write_atomically(&self.path, &serde_json::to_vec_pretty(&next)?)?;
        tracing::debug!(path = %self.path.display(), serial = next.serial, "state written");

        *guard = next;
        Ok(())
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state.json".to_string());
    let tmp = dir.join(format!(".{}.tmp", file_name));

    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    // NOTE: Directory fsync persists the rename itself; not supported on Windows.
    #[cfg(unix)]
    File::open(&dir)?.sync_all()?;

    Ok(())
}

impl StateStore for FileStateStore {
    fn get(&self, id: &ResourceId) -> Result<Option<StateRecord>, StateError> {
        let doc = self.document.lock().map_err(|_| StateError::Poisoned)?;
        Ok(doc.resources.iter().find(|r| &r.id == id).cloned())
    }

    fn put(&self, record: StateRecord) -> Result<(), StateError> {
        self.commit(|doc| {
            doc.upsert(record);
            true
        })
    }

    fn delete(&self, id: &ResourceId) -> Result<(), StateError> {
        self.commit(|doc| doc.remove(id))
    }

    fn replace(&self, old: &ResourceId, record: StateRecord) -> Result<(), StateError> {
        self.commit(|doc| {
            doc.rebind(old, record);
            true
        })
    }

    fn list(&self) -> Result<Vec<StateRecord>, StateError> {
        let doc = self.document.lock().map_err(|_| StateError::Poisoned)?;
        Ok(doc.resources.clone())
    }
}
