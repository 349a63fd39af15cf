use crate::artifact::Artifact;
use crate::message::Message;
use crate::roster::{RouteTarget, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// How a [`StateDelta`] updates the captured failure string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorUpdate {
    /// Leave the current value untouched.
    #[default]
    Keep,
    /// Clear the failure string (success path).
    Clear,
    /// Record a new failure string.
    Set(String),
}

/// A worker's contribution to the conversation, merged into
/// [`ConversationState`] by pure per-field reducers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDelta {
    /// Messages to append. Concatenation only; existing messages are
    /// never replaced.
    pub messages: Vec<Message>,
    /// Workers that acted. Merged by set union.
    pub contributors: Vec<WorkerId>,
    /// Artifacts to append.
    pub artifacts: Vec<Artifact>,
    /// Direct handoff target, latest-write-wins. `None` returns control
    /// to the router.
    pub next: Option<RouteTarget>,
    /// Self-loop retry request, latest-write-wins.
    pub needs_retry: Option<bool>,
    /// Failure string update.
    pub last_error: ErrorUpdate,
}

impl StateDelta {
    /// A delta recording one worker's message and contribution.
    pub fn message_from(worker: WorkerId, message: Message) -> Self {
        Self {
            messages: vec![message],
            contributors: vec![worker],
            ..Self::default()
        }
    }

    /// Adds an artifact to this delta.
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Sets a direct handoff target.
    pub fn with_handoff(mut self, target: RouteTarget) -> Self {
        self.next = Some(target);
        self
    }

    /// Marks the delta as a failure, recording the error string.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = ErrorUpdate::Set(error.into());
        self
    }
}

/// The unit of work threaded through the dispatcher.
///
/// Owned exclusively by the one in-flight request processing its thread;
/// never shared across conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    /// The conversation thread identifier.
    pub thread_id: Uuid,
    /// Ordered, append-only transcript.
    pub messages: Vec<Message>,
    /// Pending routing target. `None` means the router decides next.
    pub next: Option<RouteTarget>,
    /// Workers that have acted, first-occurrence order, no duplicates.
    pub contributors: Vec<WorkerId>,
    /// Append-only artifact log (the store keeps the current-per-kind view).
    pub artifacts: Vec<Artifact>,
    /// Count of router invocations; strictly increasing.
    pub turn_count: u32,
    /// Self-loop retry flag, consumed only by the self-loop-capable worker.
    pub needs_retry: bool,
    /// Per-worker self-loop retry counters, reset on success or handoff.
    pub agent_retries: HashMap<WorkerId, u32>,
    /// Last captured failure string, cleared on success.
    pub last_error: Option<String>,
}

impl ConversationState {
    /// Creates an empty state for the given thread.
    pub fn new(thread_id: Uuid) -> Self {
        Self {
            thread_id,
            messages: Vec::new(),
            next: None,
            contributors: Vec::new(),
            artifacts: Vec::new(),
            turn_count: 0,
            needs_retry: false,
            agent_retries: HashMap::new(),
            last_error: None,
        }
    }

    /// Merges a delta into this state using the per-field reducers:
    /// messages and artifacts concatenate, contributors union,
    /// `next`/`needs_retry` latest-write-wins, `last_error` per its
    /// [`ErrorUpdate`].
    pub fn apply(&mut self, delta: StateDelta) {
        self.messages.extend(delta.messages);
        for worker in delta.contributors {
            if !self.contributors.contains(&worker) {
                self.contributors.push(worker);
            }
        }
        self.artifacts.extend(delta.artifacts);
        if delta.next.is_some() {
            self.next = delta.next;
        }
        if let Some(flag) = delta.needs_retry {
            self.needs_retry = flag;
        }
        match delta.last_error {
            ErrorUpdate::Keep => {}
            ErrorUpdate::Clear => self.last_error = None,
            ErrorUpdate::Set(msg) => self.last_error = Some(msg),
        }
    }

    /// Increments the router-turn counter.
    pub fn bump_turn(&mut self) {
        self.turn_count += 1;
    }

    /// Increments and returns the retry counter for a worker.
    pub fn record_retry(&mut self, worker: WorkerId) -> u32 {
        let count = self.agent_retries.entry(worker).or_insert(0);
        *count += 1;
        *count
    }

    /// Current retry count for a worker.
    pub fn retries_for(&self, worker: WorkerId) -> u32 {
        self.agent_retries.get(&worker).copied().unwrap_or(0)
    }

    /// Resets a worker's retry counter (success or handoff).
    pub fn reset_retries(&mut self, worker: WorkerId) {
        self.agent_retries.remove(&worker);
    }
}
