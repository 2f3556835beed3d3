//! On-disk store root for the SQLite anchor registry.
//!
//! Everything persisted by the CLI lives under one directory: the anchor
//! database, the governance config and the JSONL audit logs.

use std::path::{Path, PathBuf};

pub const STORE_DIR: &str = ".anchorage";

/// Handle to a store directory.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
}

impl Store {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at `<project_dir>/.anchorage`.
    pub fn for_project_dir(project_dir: &Path) -> Self {
        Self::at(project_dir.join(STORE_DIR))
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(crate::core::config::CONFIG_FILE)
    }

    pub fn conference_log_path(&self) -> PathBuf {
        self.root.join("conference.events.jsonl")
    }

    pub fn broker_log_path(&self) -> PathBuf {
        self.root.join("broker.events.jsonl")
    }
}

/// Walk up from `start_dir` to the nearest directory holding a store.
pub fn find_store(start_dir: &Path) -> Option<Store> {
    start_dir
        .ancestors()
        .find(|dir| dir.join(STORE_DIR).is_dir())
        .map(Store::for_project_dir)
}
