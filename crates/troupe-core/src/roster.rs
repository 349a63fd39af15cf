use serde::{Deserialize, Serialize};

/// Identity of a worker in the fixed roster.
///
/// The roster is fixed at compile time; routing rules are not
/// user-programmable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerId {
    /// Analyzes requirements and produces the implementation plan.
    Planner,
    /// Produces the implementation; supports bounded self-loop retry.
    Builder,
    /// Writes the test plan.
    Tester,
    /// Performs the security review.
    Security,
    /// Reviews the final output and can hand off directly.
    Reviewer,
}

impl WorkerId {
    /// All roster members, in their canonical pipeline order.
    pub const ALL: [WorkerId; 5] = [
        WorkerId::Planner,
        WorkerId::Builder,
        WorkerId::Tester,
        WorkerId::Security,
        WorkerId::Reviewer,
    ];

    /// Parses a worker name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "planner" => Some(WorkerId::Planner),
            "builder" => Some(WorkerId::Builder),
            "tester" => Some(WorkerId::Tester),
            "security" => Some(WorkerId::Security),
            "reviewer" => Some(WorkerId::Reviewer),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerId::Planner => write!(f, "planner"),
            WorkerId::Builder => write!(f, "builder"),
            WorkerId::Tester => write!(f, "tester"),
            WorkerId::Security => write!(f, "security"),
            WorkerId::Reviewer => write!(f, "reviewer"),
        }
    }
}

/// Where control goes next: a worker, or the terminal sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// Dispatch to the named worker.
    Worker(WorkerId),
    /// Terminate the conversation run.
    Finish,
}

impl RouteTarget {
    /// Parses a routing target: `"finish"` or a worker name.
    pub fn parse(name: &str) -> Option<Self> {
        let trimmed = name.trim().to_lowercase();
        if trimmed == "finish" || trimmed == "done" || trimmed == "end" {
            return Some(RouteTarget::Finish);
        }
        WorkerId::parse(&trimmed).map(RouteTarget::Worker)
    }
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteTarget::Worker(id) => write!(f, "{id}"),
            RouteTarget::Finish => write!(f, "finish"),
        }
    }
}

impl Serialize for RouteTarget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RouteTarget {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RouteTarget::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown route target: {raw}")))
    }
}
