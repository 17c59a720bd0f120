use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Read-only view of a tree of assets.
pub trait AssetStore {
    /// Names of the entries directly inside `dir`, in storage order.
    ///
    /// `dir` is relative to the root of the store; the empty string is the
    /// root itself. Anything that is not a directory lists as empty.
    fn list(&self, dir: &str) -> io::Result<Vec<String>>;
}

/// An [`AssetStore`] backed by a directory on disk.
#[derive(Debug, Clone)]
pub struct DirAssetStore {
    root: PathBuf,
}

impl DirAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetStore for DirAssetStore {
    fn list(&self, dir: &str) -> io::Result<Vec<String>> {
        let path = self.root.join(dir);
        if !path.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}

/// Which entries count as images, and whether folders are descended into.
#[derive(Debug, Clone)]
pub struct AssetDiscovery {
    extensions: Vec<String>,
    recurse: bool,
}

impl AssetDiscovery {
    pub fn new(extensions: impl IntoIterator<Item = impl AsRef<str>>, recurse: bool) -> Self {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().to_ascii_lowercase())
                .collect(),
            recurse,
        }
    }

    fn is_image(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    /// Lists every image below `folder`, as paths relative to the store root.
    ///
    /// Folders that can not be listed are logged and skipped.
    pub fn find(&self, store: &impl AssetStore, folder: &str) -> Vec<String> {
        let mut found = Vec::new();
        self.walk(store, folder, &mut found);
        found
    }

    fn walk(&self, store: &impl AssetStore, dir: &str, found: &mut Vec<String>) {
        let entries = match store.list(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir, error = %e, "can not list asset folder, skipping it");
                return;
            }
        };

        for name in entries {
            let path = if dir.is_empty() {
                name.clone()
            } else {
                format!("{dir}/{name}")
            };

            if self.is_image(&name) {
                debug!(%path, "found stamp image");
                found.push(path);
            } else if self.recurse {
                self.walk(store, &path, found);
            }
        }
    }
}

impl Default for AssetDiscovery {
    fn default() -> Self {
        Self::new([".png", ".jpg", ".jpeg"], true)
    }
}
