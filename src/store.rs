//! Resource persistence.
//!
//! [`ResourceStore`] is the seam to whatever database holds resource records.
//! Implementations supply five primitives; status transitions are provided
//! on top of `update`, which must run its closure atomically with respect to
//! other writers of the same record.
//!
//! - [`MemoryStore`]: a mutex-guarded map.
//! - [`JsonStore`]: one JSON file per resource, safe across processes.

use crate::cache::hash_key;
use crate::file_guard::FileGuard;
use crate::iiif::BaseType;
use crate::imaging::Dimensions;
use crate::resource::{Resource, StateError, Status};
use std::collections::BTreeMap;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Resource already exists: {0}")]
    Duplicate(String),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("Store IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Corrupt resource record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub trait ResourceStore: Send + Sync {
    fn get(&self, identifier: &str) -> Result<Option<Resource>, StoreError>;

    /// Add a new record. Fails with [`StoreError::Duplicate`] if the
    /// identifier is taken.
    fn insert(&self, resource: Resource) -> Result<(), StoreError>;

    /// Atomically read-modify-write one record.
    ///
    /// `f` returns whether it changed anything; only then is the record
    /// written back. Returns the record as it stands afterwards, or `None`
    /// if no such record exists.
    fn update(
        &self,
        identifier: &str,
        f: &mut dyn FnMut(&mut Resource) -> bool,
    ) -> Result<Option<Resource>, StoreError>;

    fn delete(&self, identifier: &str) -> Result<bool, StoreError>;

    /// Every record, sorted by identifier.
    fn list(&self) -> Result<Vec<Resource>, StoreError>;

    /// Compare-and-set on status.
    ///
    /// Returns `true` only if the record was in `from` and is now in `to`.
    /// Of several callers racing on the same `from`, exactly one wins.
    fn transition(&self, identifier: &str, from: Status, to: Status) -> Result<bool, StoreError> {
        from.check_transition(to)?;
        let mut moved = false;
        self.update(identifier, &mut |r| {
            if r.status != from {
                return false;
            }
            r.status = to;
            r.error_message = None;
            moved = true;
            true
        })?;
        Ok(moved)
    }

    /// Move a `processing` record to `failure` with `message`.
    fn record_failure(&self, identifier: &str, message: &str) -> Result<bool, StoreError> {
        Status::Processing.check_transition(Status::Failure)?;
        let mut moved = false;
        self.update(identifier, &mut |r| {
            if r.status != Status::Processing {
                return false;
            }
            r.status = Status::Failure;
            r.error_message = Some(message.to_string());
            moved = true;
            true
        })?;
        Ok(moved)
    }

    /// Record a base's dimensions, but only while the record is still being
    /// processed; a reset record keeps its cleared dimensions.
    fn record_dimensions(
        &self,
        identifier: &str,
        base_type: BaseType,
        dims: Dimensions,
    ) -> Result<bool, StoreError> {
        let mut recorded = false;
        self.update(identifier, &mut |r| {
            if r.status != Status::Processing {
                return false;
            }
            r.dimensions.set(base_type, dims);
            recorded = true;
            true
        })?;
        Ok(recorded)
    }
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, Resource>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceStore for MemoryStore {
    fn get(&self, identifier: &str) -> Result<Option<Resource>, StoreError> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records.get(identifier).cloned())
    }

    fn insert(&self, resource: Resource) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        if records.contains_key(&resource.identifier) {
            return Err(StoreError::Duplicate(resource.identifier));
        }
        records.insert(resource.identifier.clone(), resource);
        Ok(())
    }

    fn update(
        &self,
        identifier: &str,
        f: &mut dyn FnMut(&mut Resource) -> bool,
    ) -> Result<Option<Resource>, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records.get_mut(identifier).map(|record| {
            f(record);
            record.clone()
        }))
    }

    fn delete(&self, identifier: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records.remove(identifier).is_some())
    }

    fn list(&self) -> Result<Vec<Resource>, StoreError> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records.values().cloned().collect())
    }
}

// ============================================================================
// JSON files
// ============================================================================

/// Records as `{directory}/{sha256(identifier)}.json`.
///
/// Writes are staged in a temp file and renamed into place. Every mutation
/// runs under the directory's `.guard` lock, which makes `update` atomic
/// across threads and processes.
#[derive(Debug, Clone)]
pub struct JsonStore {
    directory: PathBuf,
}

impl JsonStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn record_path(&self, identifier: &str) -> PathBuf {
        self.directory.join(format!("{}.json", hash_key(identifier)))
    }

    fn guard(&self) -> Result<FileGuard, StoreError> {
        Ok(FileGuard::acquire(&self.directory.join(".guard"))?)
    }

    fn read(path: &Path) -> Result<Option<Resource>, StoreError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }

    fn write(&self, resource: &Resource) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.directory)?;
        let mut staged = tempfile::NamedTempFile::new_in(&self.directory)?;
        serde_json::to_writer_pretty(&mut staged, resource).map_err(io::Error::from)?;
        staged.flush()?;
        staged
            .persist(self.record_path(&resource.identifier))
            .map_err(|e| e.error)?;
        Ok(())
    }
}

impl ResourceStore for JsonStore {
    fn get(&self, identifier: &str) -> Result<Option<Resource>, StoreError> {
        Self::read(&self.record_path(identifier))
    }

    fn insert(&self, resource: Resource) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        if self.record_path(&resource.identifier).exists() {
            return Err(StoreError::Duplicate(resource.identifier));
        }
        self.write(&resource)
    }

    fn update(
        &self,
        identifier: &str,
        f: &mut dyn FnMut(&mut Resource) -> bool,
    ) -> Result<Option<Resource>, StoreError> {
        let _guard = self.guard()?;
        let Some(mut record) = Self::read(&self.record_path(identifier))? else {
            return Ok(None);
        };
        if f(&mut record) {
            self.write(&record)?;
        }
        Ok(Some(record))
    }

    fn delete(&self, identifier: &str) -> Result<bool, StoreError> {
        let _guard = self.guard()?;
        match std::fs::remove_file(self.record_path(identifier)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<Resource>, StoreError> {
        let mut records = Vec::new();
        for entry in WalkDir::new(&self.directory)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if entry.file_type().is_file() && path.extension().is_some_and(|e| e == "json") {
                records.extend(Self::read(path)?);
            }
        }
        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(records)
    }
}
