use crate::artifacts::ArtifactStore;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use troupe_core::{
    Artifact, ArtifactKind, ConversationState, ErrorUpdate, Message, Role, RouteTarget,
    StateDelta, TroupeResult, WorkerId,
};
use troupe_cost::ModelRouter;
use troupe_llm::{InferenceProvider, InvokeRequest, ProviderOutput};

/// Everything a worker needs for one turn. Borrowed from the dispatcher
/// for the duration of the act call.
pub struct WorkerContext<'a> {
    /// The conversation so far.
    pub state: &'a ConversationState,
    /// Current-per-kind artifacts.
    pub artifacts: &'a ArtifactStore,
    /// The guarded provider every call goes through.
    pub provider: &'a dyn InferenceProvider,
    /// Model selection.
    pub models: &'a ModelRouter,
    /// Output token ceiling for worker calls.
    pub max_tokens: u32,
}

/// A member of the fixed roster.
///
/// `act` is infallible: a worker catches its own provider errors and
/// returns a degraded but valid delta instead.
#[async_trait]
pub trait Worker: Send + Sync {
    /// This worker's identity.
    fn id(&self) -> WorkerId;

    /// Whether this worker may loop back to itself on `needs_retry`.
    fn self_loop(&self) -> bool {
        false
    }

    /// Performs one turn and returns the contribution to merge.
    async fn act(&self, ctx: &WorkerContext<'_>) -> StateDelta;
}

/// The most recent user message, used for model routing heuristics.
pub(crate) fn latest_user_query(state: &ConversationState) -> String {
    state
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// One guarded model call with router bookkeeping. Returns the reply text.
async fn call_model(
    ctx: &WorkerContext<'_>,
    worker: WorkerId,
    system: String,
) -> TroupeResult<String> {
    let query = latest_user_query(ctx.state);
    let choice = ctx.models.select_model(worker, &query);
    let request = InvokeRequest {
        model: choice.model.clone(),
        system: Some(system),
        messages: ctx.state.messages.clone(),
        schema: None,
        max_tokens: ctx.max_tokens,
        agent: worker.to_string(),
        thread_id: Some(ctx.state.thread_id),
    };
    match ctx.provider.invoke(&request).await {
        Ok(reply) => {
            ctx.models.record_success(worker, choice.tier);
            Ok(match reply.output {
                ProviderOutput::Text(text) => text,
                ProviderOutput::Structured(value) => value.to_string(),
                ProviderOutput::ToolCalls(_) => String::new(),
            })
        }
        Err(e) => {
            ctx.models.record_failure(worker, choice.tier);
            Err(e)
        }
    }
}

/// The degraded delta for a failed worker turn: an apologetic message,
/// the contributor recorded, the failure captured, no artifact.
fn degraded(worker: WorkerId, state: &ConversationState, error: &troupe_core::TroupeError) -> StateDelta {
    warn!(worker = %worker, error = %error, "Worker turn degraded");
    StateDelta::message_from(
        worker,
        Message::assistant(
            format!("The {worker} stage could not complete: {error}"),
            state.thread_id,
        ),
    )
    .with_error(error.to_string())
}

fn success_delta(worker: WorkerId, state: &ConversationState, content: &str) -> StateDelta {
    let mut delta = StateDelta::message_from(
        worker,
        Message::assistant(content.to_string(), state.thread_id),
    );
    delta.last_error = ErrorUpdate::Clear;
    delta
}

fn artifact_context(ctx: &WorkerContext<'_>, kinds: &[ArtifactKind]) -> String {
    let mut sections = String::new();
    for &kind in kinds {
        if let Some(artifact) = ctx.artifacts.get(kind) {
            sections.push_str(&format!("\n\n[{:?} from {}]\n{}", kind, artifact.produced_by, artifact.content));
        }
    }
    sections
}

/// Analyzes the request and produces requirements plus a plan.
pub struct PlannerWorker;

const PLANNER_PROMPT: &str = "You are the planner of a software delivery team. \
Restate the user's requirements, then write a step-by-step implementation plan. \
Put the plan under a heading line starting with 'Plan:'.";

impl PlannerWorker {
    /// Splits a planner reply into requirements and plan at the first
    /// line that looks like a plan heading. Without one, the full text
    /// serves as both.
    fn split_reply(reply: &str) -> (String, String) {
        let mut requirements = String::new();
        let mut plan = String::new();
        let mut in_plan = false;
        for line in reply.lines() {
            let trimmed = line.trim().to_lowercase();
            if !in_plan && (trimmed.starts_with("plan:") || trimmed.starts_with("## plan")) {
                in_plan = true;
            }
            if in_plan {
                plan.push_str(line);
                plan.push('\n');
            } else {
                requirements.push_str(line);
                requirements.push('\n');
            }
        }
        if plan.is_empty() {
            (reply.to_string(), reply.to_string())
        } else {
            (requirements.trim().to_string(), plan.trim().to_string())
        }
    }
}

#[async_trait]
impl Worker for PlannerWorker {
    fn id(&self) -> WorkerId {
        WorkerId::Planner
    }

    async fn act(&self, ctx: &WorkerContext<'_>) -> StateDelta {
        match call_model(ctx, self.id(), PLANNER_PROMPT.to_string()).await {
            Ok(reply) => {
                let (requirements, plan) = Self::split_reply(&reply);
                success_delta(self.id(), ctx.state, &reply)
                    .with_artifact(Artifact::new(
                        ArtifactKind::Requirements,
                        requirements,
                        self.id(),
                    ))
                    .with_artifact(Artifact::new(ArtifactKind::ImplementationPlan, plan, self.id()))
            }
            Err(e) => degraded(self.id(), ctx.state, &e),
        }
    }
}

/// Produces the implementation. The only self-loop-capable worker: a
/// failed turn requests a bounded retry of itself.
pub struct BuilderWorker;

const BUILDER_PROMPT: &str = "You are the builder of a software delivery team. \
Produce the implementation the conversation asks for, following the plan when \
one is available. Output the complete result, not a sketch.";

#[async_trait]
impl Worker for BuilderWorker {
    fn id(&self) -> WorkerId {
        WorkerId::Builder
    }

    fn self_loop(&self) -> bool {
        true
    }

    async fn act(&self, ctx: &WorkerContext<'_>) -> StateDelta {
        let system = format!(
            "{BUILDER_PROMPT}{}",
            artifact_context(ctx, &[ArtifactKind::Requirements, ArtifactKind::ImplementationPlan])
        );
        match call_model(ctx, self.id(), system).await {
            Ok(reply) => {
                let mut delta = success_delta(self.id(), ctx.state, &reply);
                delta.needs_retry = Some(false);
                delta
            }
            Err(e) => {
                let mut delta = degraded(self.id(), ctx.state, &e);
                delta.needs_retry = Some(true);
                delta
            }
        }
    }
}

/// Writes the test plan for the current implementation.
pub struct TesterWorker;

const TESTER_PROMPT: &str = "You are the tester of a software delivery team. \
Write a concrete test plan for the work in this conversation: what to test, \
how, and the edge cases that matter.";

#[async_trait]
impl Worker for TesterWorker {
    fn id(&self) -> WorkerId {
        WorkerId::Tester
    }

    async fn act(&self, ctx: &WorkerContext<'_>) -> StateDelta {
        let system = format!(
            "{TESTER_PROMPT}{}",
            artifact_context(ctx, &[ArtifactKind::ImplementationPlan])
        );
        match call_model(ctx, self.id(), system).await {
            Ok(reply) => success_delta(self.id(), ctx.state, &reply).with_artifact(Artifact::new(
                ArtifactKind::TestPlan,
                reply.clone(),
                self.id(),
            )),
            Err(e) => degraded(self.id(), ctx.state, &e),
        }
    }
}

/// Reviews the conversation for security problems.
pub struct SecurityWorker;

const SECURITY_PROMPT: &str = "You are the security reviewer of a software \
delivery team. Examine the work in this conversation for injection vectors, \
secret handling, authentication gaps, and unsafe defaults. Report findings \
with severity.";

#[async_trait]
impl Worker for SecurityWorker {
    fn id(&self) -> WorkerId {
        WorkerId::Security
    }

    async fn act(&self, ctx: &WorkerContext<'_>) -> StateDelta {
        let system = format!(
            "{SECURITY_PROMPT}{}",
            artifact_context(ctx, &[ArtifactKind::ImplementationPlan])
        );
        match call_model(ctx, self.id(), system).await {
            Ok(reply) => success_delta(self.id(), ctx.state, &reply).with_artifact(Artifact::new(
                ArtifactKind::SecurityReview,
                reply.clone(),
                self.id(),
            )),
            Err(e) => degraded(self.id(), ctx.state, &e),
        }
    }
}

/// Produces the final review verdict; may hand control off directly.
pub struct ReviewerWorker {
    handoff_re: Regex,
}

const REVIEWER_PROMPT: &str = "You are the final reviewer of a software \
delivery team. Judge whether the work is complete and correct, citing the \
security review and test plan when present. If another stage must act next, \
end your reply with a line 'HANDOFF: <stage>' naming one of: planner, \
builder, tester, security, finish.";

impl ReviewerWorker {
    /// Creates the reviewer with its handoff-line matcher.
    pub fn new() -> Self {
        #[allow(clippy::expect_used)]
        let handoff_re =
            Regex::new(r"(?mi)^\s*handoff:\s*([a-z]+)\s*$").expect("static regex is valid");
        Self { handoff_re }
    }

    fn extract_handoff(&self, reply: &str) -> (String, Option<RouteTarget>) {
        match self.handoff_re.captures(reply) {
            Some(caps) => {
                let target = RouteTarget::parse(&caps[1]);
                let cleaned = self.handoff_re.replace(reply, "").trim().to_string();
                (cleaned, target)
            }
            None => (reply.to_string(), None),
        }
    }
}

impl Default for ReviewerWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Worker for ReviewerWorker {
    fn id(&self) -> WorkerId {
        WorkerId::Reviewer
    }

    async fn act(&self, ctx: &WorkerContext<'_>) -> StateDelta {
        let system = format!(
            "{REVIEWER_PROMPT}{}",
            artifact_context(ctx, &[ArtifactKind::SecurityReview, ArtifactKind::TestPlan])
        );
        match call_model(ctx, self.id(), system).await {
            Ok(reply) => {
                let (content, handoff) = self.extract_handoff(&reply);
                let mut delta = success_delta(self.id(), ctx.state, &content).with_artifact(
                    Artifact::new(ArtifactKind::CodeReview, content.clone(), self.id()),
                );
                if let Some(target) = handoff {
                    delta = delta.with_handoff(target);
                }
                delta
            }
            Err(e) => degraded(self.id(), ctx.state, &e),
        }
    }
}

/// The fixed roster, keyed by identity.
pub fn standard_roster() -> HashMap<WorkerId, Arc<dyn Worker>> {
    let workers: [Arc<dyn Worker>; 5] = [
        Arc::new(PlannerWorker),
        Arc::new(BuilderWorker),
        Arc::new(TesterWorker),
        Arc::new(SecurityWorker),
        Arc::new(ReviewerWorker::new()),
    ];
    workers.into_iter().map(|w| (w.id(), w)).collect()
}
