//! Script bundles and the temporary workspace they are materialized into.

use crate::error::{PoolError, Result};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Child side of the protocol for CPython workers.
///
/// Import it from an entry script and register handlers:
///
/// ```python
/// from scriptpool_adapter import serve
/// serve({"add": lambda arg: {"result": arg["a"] + arg["b"]}})
/// ```
pub const PYTHON_ADAPTER: &str = include_str!("../python/scriptpool_adapter.py");

/// File name the Python adapter is written under in a bundle.
pub const PYTHON_ADAPTER_NAME: &str = "scriptpool_adapter.py";

/// An in-memory tree of script files.
///
/// Keys are relative paths. The bundle is written out once per pool and every
/// worker runs with the resulting directory as its working directory.
#[derive(Debug, Clone, Default)]
pub struct ScriptBundle {
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl ScriptBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file, builder style.
    pub fn with_file(mut self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) -> Result<Self> {
        self.insert(path, contents)?;
        Ok(self)
    }

    /// Add the Python adapter as `scriptpool_adapter.py`.
    pub fn with_python_adapter(self) -> Result<Self> {
        self.with_file(PYTHON_ADAPTER_NAME, PYTHON_ADAPTER)
    }

    /// Add or replace a file.
    ///
    /// The path must be relative and stay inside the bundle root.
    pub fn insert(&mut self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) -> Result<()> {
        let path = normalize_relative(path.as_ref())?;
        self.files.insert(path, contents.into());
        Ok(())
    }

    /// Load every regular file below `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut bundle = Self::new();

        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                PoolError::Workspace {
                    message: format!("failed to walk script directory: {}", e),
                    path: Some(path),
                    source: e.into_io_error(),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(|_| PoolError::Workspace {
                    message: "file outside script directory".to_string(),
                    path: Some(entry.path().to_path_buf()),
                    source: None,
                })?;
            let contents = std::fs::read(entry.path())
                .map_err(|e| PoolError::workspace_io("failed to read script", entry.path(), e))?;
            bundle.insert(relative, contents)?;
        }

        debug!(
            "Loaded {} script files from {}",
            bundle.len(),
            dir.display()
        );
        Ok(bundle)
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        normalize_relative(path.as_ref())
            .map(|path| self.files.contains_key(&path))
            .unwrap_or(false)
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<&[u8]> {
        let path = normalize_relative(path.as_ref()).ok()?;
        self.files.get(&path).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Relative paths of every file, in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(PathBuf::as_path)
    }

    /// Write the bundle into a fresh temporary directory.
    ///
    /// The directory is created under `root`, or the system temp dir when
    /// `root` is `None`. It is removed when the returned `TempDir` drops, so a
    /// failure part way through leaves nothing behind.
    pub fn materialize_in(&self, root: Option<&Path>) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("scriptpool-");
        let workspace = match root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| PoolError::Workspace {
            message: format!("failed to create temp dir: {}", e),
            path: root.map(Path::to_path_buf),
            source: Some(e),
        })?;

        for (relative, contents) in &self.files {
            let target = workspace.path().join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PoolError::workspace_io("failed to create script directory", parent, e)
                })?;
            }
            std::fs::write(&target, contents)
                .map_err(|e| PoolError::workspace_io("failed to write script", &target, e))?;
        }

        info!(
            "Materialized {} script files into {}",
            self.files.len(),
            workspace.path().display()
        );
        Ok(workspace)
    }
}

fn normalize_relative(path: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PoolError::Config {
                    message: format!(
                        "script path must be relative and inside the bundle: {}",
                        path.display()
                    ),
                });
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(PoolError::Config {
            message: "script path must not be empty".to_string(),
        });
    }
    Ok(normalized)
}
