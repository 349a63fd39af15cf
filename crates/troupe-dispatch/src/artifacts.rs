use std::collections::HashMap;
use troupe_core::{Artifact, ArtifactKind};

/// Current-per-kind view of the artifacts produced during one run.
///
/// A later artifact of the same kind replaces the earlier one; the full
/// append-only history stays in the conversation state. Owned by the one
/// in-flight request, so no synchronization.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    current: HashMap<ArtifactKind, Artifact>,
}

impl ArtifactStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the current view from an append-only artifact log.
    pub fn from_log(log: &[Artifact]) -> Self {
        let mut store = Self::new();
        for artifact in log {
            store.put(artifact.clone());
        }
        store
    }

    /// Inserts an artifact, replacing any existing one of the same kind.
    pub fn put(&mut self, artifact: Artifact) {
        self.current.insert(artifact.kind, artifact);
    }

    /// The current artifact of a kind, if any.
    pub fn get(&self, kind: ArtifactKind) -> Option<&Artifact> {
        self.current.get(&kind)
    }

    /// All current artifacts, ordered by creation time.
    pub fn all(&self) -> Vec<Artifact> {
        let mut artifacts: Vec<Artifact> = self.current.values().cloned().collect();
        artifacts.sort_by_key(|a| a.created_at);
        artifacts
    }

    /// Number of kinds currently present.
    pub fn len(&self) -> usize {
        self.current.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}
