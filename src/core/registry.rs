//! Anchor registry: the storage boundary.
//!
//! At most one anchor is canonical per (project, marker). Every write names
//! the version it read; a commit applies all of its writes or none.

use crate::core::artefact::{Artefact, ArtefactKind};
use crate::core::error::GovernanceError;
use crate::core::marker::{AnchorStatus, Deviation, Lifecycle, Marker, MarkerSnapshot};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnchorKey {
    pub project_id: u64,
    pub marker: Marker,
}

impl AnchorKey {
    pub fn new(project_id: u64, marker: Marker) -> Self {
        Self { project_id, marker }
    }
}

impl fmt::Display for AnchorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "project {} {}", self.project_id, self.marker)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Anchor {
    pub project_id: u64,
    pub marker: Marker,
    pub identifier: String,
    /// Bumped by every commit.
    pub version: u64,
    /// Bumped by every accepted deviation.
    pub revision: u64,
    /// Lifecycle cycle the version was committed in.
    pub cycle: u32,
    pub status: AnchorStatus,
    pub artefact: Artefact,
    /// Canonical document rendered from `artefact`.
    pub document: String,
    #[serde(default)]
    pub deviations: Vec<Deviation>,
    /// Set on the COMPLETE version that closed `cycle`.
    #[serde(default)]
    pub closes_cycle: bool,
    pub updated_at: String,
    pub updated_by: String,
}

impl Anchor {
    pub fn key(&self) -> AnchorKey {
        AnchorKey::new(self.project_id, self.marker)
    }

    pub fn kind(&self) -> ArtefactKind {
        self.artefact.kind()
    }
}

/// One conditional write. `expected_version` 0 means no anchor may exist.
#[derive(Debug, Clone)]
pub struct AnchorWrite {
    pub anchor: Anchor,
    pub expected_version: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub writes: Vec<AnchorWrite>,
    pub lifecycle: Option<Lifecycle>,
    /// Recorded by stores that keep an audit trail.
    pub actor: String,
    pub conference_id: Option<String>,
}

impl CommitBatch {
    pub fn new(actor: &str, conference_id: &str) -> Self {
        Self {
            actor: actor.to_string(),
            conference_id: Some(conference_id.to_string()),
            ..Self::default()
        }
    }

    pub fn write(mut self, anchor: Anchor, expected_version: u64) -> Self {
        self.writes.push(AnchorWrite {
            anchor,
            expected_version,
        });
        self
    }
}

/// Check a write against the version currently stored for its key.
pub fn check_write(write: &AnchorWrite, current_version: u64) -> Result<(), GovernanceError> {
    if write.expected_version != current_version {
        return Err(GovernanceError::ConcurrencyConflict {
            expected: write.expected_version,
            actual: current_version,
        });
    }
    if write.anchor.version != current_version + 1 {
        return Err(GovernanceError::ValidationError(format!(
            "{} must be written as version {}, not {}",
            write.anchor.key(),
            current_version + 1,
            write.anchor.version
        )));
    }
    Ok(())
}

pub trait AnchorStore {
    fn load(&self, key: AnchorKey) -> Result<Option<Anchor>, GovernanceError>;

    /// Every committed version, oldest first.
    fn history(&self, key: AnchorKey) -> Result<Vec<Anchor>, GovernanceError>;

    fn load_lifecycle(&self, project_id: u64, chat_id: &str) -> Result<Option<Lifecycle>, GovernanceError>;

    /// Apply every write in `batch` or none of them.
    fn commit(&mut self, batch: CommitBatch) -> Result<(), GovernanceError>;

    fn snapshot(&self, project_id: u64) -> Result<MarkerSnapshot, GovernanceError> {
        let mut snapshot = MarkerSnapshot::default();
        for marker in Marker::ALL {
            if let Some(anchor) = self.load(AnchorKey::new(project_id, marker))? {
                snapshot = snapshot.with(marker, anchor.status);
            }
        }
        Ok(snapshot)
    }
}

/// In-process store; the default for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAnchorStore {
    anchors: FxHashMap<AnchorKey, Vec<Anchor>>,
    lifecycles: FxHashMap<(u64, String), Lifecycle>,
}

impl MemoryAnchorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(&self, key: AnchorKey) -> u64 {
        self.anchors
            .get(&key)
            .and_then(|versions| versions.last())
            .map(|a| a.version)
            .unwrap_or(0)
    }
}

impl AnchorStore for MemoryAnchorStore {
    fn load(&self, key: AnchorKey) -> Result<Option<Anchor>, GovernanceError> {
        Ok(self.anchors.get(&key).and_then(|v| v.last()).cloned())
    }

    fn history(&self, key: AnchorKey) -> Result<Vec<Anchor>, GovernanceError> {
        Ok(self.anchors.get(&key).cloned().unwrap_or_default())
    }

    fn load_lifecycle(&self, project_id: u64, chat_id: &str) -> Result<Option<Lifecycle>, GovernanceError> {
        Ok(self.lifecycles.get(&(project_id, chat_id.to_string())).cloned())
    }

    fn commit(&mut self, batch: CommitBatch) -> Result<(), GovernanceError> {
        for write in &batch.writes {
            check_write(write, self.current_version(write.anchor.key()))?;
        }
        for write in batch.writes {
            self.anchors
                .entry(write.anchor.key())
                .or_default()
                .push(write.anchor);
        }
        if let Some(lifecycle) = batch.lifecycle {
            self.lifecycles
                .insert((lifecycle.project_id, lifecycle.chat_id.clone()), lifecycle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::knowledge::{KnowledgeKind, KnowledgeObject};

    fn anchor(version: u64) -> Anchor {
        let artefact = Artefact::Knowledge(KnowledgeObject::new(KnowledgeKind::Cko, 7));
        Anchor {
            project_id: 7,
            marker: Marker::Intent,
            identifier: artefact.identifier(),
            version,
            revision: 0,
            cycle: 1,
            status: AnchorStatus::Draft,
            artefact,
            document: String::new(),
            deviations: Vec::new(),
            closes_cycle: false,
            updated_at: "0Z".to_string(),
            updated_by: "test".to_string(),
        }
    }

    #[test]
    fn first_write_must_expect_nothing() {
        let mut store = MemoryAnchorStore::new();
        let err = store.commit(CommitBatch::default().write(anchor(2), 1)).unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::ConcurrencyConflict { expected: 1, actual: 0 }
        ));
        store.commit(CommitBatch::default().write(anchor(1), 0)).unwrap();
        assert_eq!(store.load(AnchorKey::new(7, Marker::Intent)).unwrap().unwrap().version, 1);
    }

    #[test]
    fn stale_write_conflicts_and_history_grows() {
        let mut store = MemoryAnchorStore::new();
        store.commit(CommitBatch::default().write(anchor(1), 0)).unwrap();
        store.commit(CommitBatch::default().write(anchor(2), 1)).unwrap();
        let err = store.commit(CommitBatch::default().write(anchor(2), 1)).unwrap_err();
        assert_eq!(err.code(), "CONCURRENCY_CONFLICT");
        assert_eq!(store.history(AnchorKey::new(7, Marker::Intent)).unwrap().len(), 2);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let mut store = MemoryAnchorStore::new();
        let mut route = anchor(1);
        route.marker = Marker::Route;
        let batch = CommitBatch::default().write(anchor(1), 0).write(route, 5);
        assert!(store.commit(batch).is_err());
        assert!(store.load(AnchorKey::new(7, Marker::Intent)).unwrap().is_none());
    }

    #[test]
    fn snapshot_reflects_statuses() {
        let mut store = MemoryAnchorStore::new();
        let mut a = anchor(1);
        a.status = AnchorStatus::Locked;
        store.commit(CommitBatch::default().write(a, 0)).unwrap();
        let snap = store.snapshot(7).unwrap();
        assert_eq!(snap.status(Marker::Intent), Some(AnchorStatus::Locked));
        assert_eq!(snap.latest(), Some(Marker::Intent));
    }
}
