//! Resolving source locators to files on disk.

use crate::imaging::ImageBackend;
use crate::resource::{Resource, SourceLocator};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

const PLACEHOLDER_PREFIX: &str = "placeholder:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Source {locator} is unreadable: {reason}")]
    Unreadable { locator: String, reason: String },
}

impl SourceError {
    fn unreadable(locator: impl ToString, reason: impl Into<String>) -> Self {
        SourceError::Unreadable {
            locator: locator.to_string(),
            reason: reason.into(),
        }
    }
}

/// Relative paths that stay below their base directory.
fn is_contained(rel: &Path) -> bool {
    rel.components().all(|c| matches!(c, Component::Normal(_)))
}

#[derive(Debug, Clone)]
pub struct SourceResolver {
    root: PathBuf,
    placeholder_directory: PathBuf,
}

impl SourceResolver {
    pub fn new(root: impl Into<PathBuf>, placeholder_directory: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            placeholder_directory: placeholder_directory.into(),
        }
    }

    pub fn placeholder_path(&self, name: &str) -> PathBuf {
        self.placeholder_directory.join(format!("{name}.png"))
    }

    /// Path of the source file, which must exist.
    pub fn resolve(&self, locator: &SourceLocator) -> Result<PathBuf, SourceError> {
        let path = match locator {
            SourceLocator::File(path) => {
                if !path.is_absolute() {
                    return Err(SourceError::unreadable(locator, "file path must be absolute"));
                }
                path.clone()
            }
            SourceLocator::Root(rel) => {
                if !is_contained(Path::new(rel)) {
                    return Err(SourceError::unreadable(locator, "path escapes the source root"));
                }
                self.root.join(rel)
            }
            SourceLocator::Placeholder(name) => {
                if !is_contained(Path::new(name)) {
                    return Err(SourceError::unreadable(locator, "invalid placeholder name"));
                }
                self.placeholder_path(name)
            }
        };
        if !path.is_file() {
            return Err(SourceError::unreadable(
                locator,
                format!("{} does not exist", path.display()),
            ));
        }
        Ok(path)
    }

    /// Names of the placeholder images on disk, sorted.
    pub fn known_placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = WalkDir::new(&self.placeholder_directory)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let path = e.path();
                if path.extension()? != "png" {
                    return None;
                }
                path.file_stem()?.to_str().map(String::from)
            })
            .collect();
        names.sort();
        names
    }

    /// Synthesize the resource for a `placeholder:<name>` identifier.
    ///
    /// Returns `None` when the identifier is not a placeholder or no such
    /// placeholder image exists.
    pub fn placeholder_resource<B: ImageBackend>(
        &self,
        identifier: &str,
        backend: &B,
    ) -> Result<Option<Resource>, SourceError> {
        let Some(name) = identifier.strip_prefix(PLACEHOLDER_PREFIX) else {
            return Ok(None);
        };
        let locator = SourceLocator::Placeholder(name.to_string());
        let Ok(path) = self.resolve(&locator) else {
            return Ok(None);
        };
        let dims = backend
            .identify(&path)
            .map_err(|e| SourceError::unreadable(&locator, e.to_string()))?;
        Ok(Some(Resource::placeholder(name, dims)))
    }
}
