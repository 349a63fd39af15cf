use crate::roster::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of typed document a worker can produce.
///
/// The set is closed: the artifact store keeps at most one current
/// instance per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Captured requirements for the task.
    Requirements,
    /// High-level design specification.
    DesignSpec,
    /// Step-by-step implementation plan.
    ImplementationPlan,
    /// Security review findings.
    SecurityReview,
    /// Test plan and coverage notes.
    TestPlan,
    /// Final review verdict.
    CodeReview,
}

/// A typed document produced by a worker during a conversation run.
///
/// Workers exchange artifacts through the store instead of re-parsing
/// transcript history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// The document type discriminant.
    pub kind: ArtifactKind,
    /// The document body.
    pub content: String,
    /// The worker that produced this artifact.
    pub produced_by: WorkerId,
    /// UTC timestamp of production.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Creates a new artifact tagged with its producer.
    pub fn new(kind: ArtifactKind, content: impl Into<String>, produced_by: WorkerId) -> Self {
        Self {
            kind,
            content: content.into(),
            produced_by,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_creation() {
        let artifact = Artifact::new(
            ArtifactKind::SecurityReview,
            "No injection vectors found",
            WorkerId::Security,
        );
        assert_eq!(artifact.kind, ArtifactKind::SecurityReview);
        assert_eq!(artifact.produced_by, WorkerId::Security);
    }

    #[test]
    fn test_artifact_kind_serialization() {
        let json = serde_json::to_string(&ArtifactKind::ImplementationPlan).unwrap();
        assert_eq!(json, "\"implementation_plan\"");
    }
}
