use crate::artifacts::ArtifactStore;
use crate::decision::DecisionEngine;
use crate::events::{emit, DispatchEvent};
use crate::workers::{latest_user_query, standard_roster, Worker, WorkerContext};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use troupe_core::{Artifact, ConversationState, Role, RouteTarget, WorkerId};
use troupe_cost::ModelRouter;
use troupe_llm::InferenceProvider;
use troupe_resilience::BreakerRegistry;

const WORKER_MAX_TOKENS: u32 = 2_048;

/// Outcome of one conversation run.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    /// The final reply for the user.
    pub reply: String,
    /// The conversation thread.
    pub thread_id: uuid::Uuid,
    /// Workers that acted, first-occurrence order.
    pub contributors: Vec<WorkerId>,
    /// Router turns consumed.
    pub turn_count: u32,
    /// Current-per-kind artifacts at the end of the run.
    pub artifacts: Vec<Artifact>,
}

/// The conversation run loop.
///
/// Each turn either consumes a pending direct handoff or asks the
/// decision chain; the chosen worker acts and its delta is merged. Safety
/// ceilings (turns, self-loop retries) and breaker checks all degrade to
/// a clean finish, so a run never returns an error.
pub struct Dispatcher {
    decisions: Arc<DecisionEngine>,
    workers: HashMap<WorkerId, Arc<dyn Worker>>,
    provider: Arc<dyn InferenceProvider>,
    models: Arc<ModelRouter>,
    breakers: Arc<BreakerRegistry>,
    max_turns: u32,
    max_agent_retries: u32,
}

impl Dispatcher {
    /// Creates a dispatcher over the standard roster.
    pub fn new(
        decisions: Arc<DecisionEngine>,
        provider: Arc<dyn InferenceProvider>,
        models: Arc<ModelRouter>,
        breakers: Arc<BreakerRegistry>,
        max_turns: u32,
        max_agent_retries: u32,
    ) -> Self {
        Self {
            decisions,
            workers: standard_roster(),
            provider,
            models,
            breakers,
            max_turns,
            max_agent_retries,
        }
    }

    /// Runs the conversation to completion, emitting stream events on the
    /// optional channel.
    pub async fn run(
        &self,
        state: &mut ConversationState,
        events: Option<mpsc::Sender<DispatchEvent>>,
    ) -> DispatchReport {
        let mut artifacts = ArtifactStore::from_log(&state.artifacts);
        let mut next = state.next.take();

        loop {
            // Handoff-driven dispatches consume a turn like router-driven
            // ones, so the ceiling bounds every run.
            if state.turn_count >= self.max_turns {
                warn!(
                    thread_id = %state.thread_id,
                    turns = state.turn_count,
                    "Turn ceiling reached, finishing"
                );
                break;
            }
            state.bump_turn();

            let target = match next.take() {
                Some(target) => target,
                None => {
                    let decision = self.decisions.decide(state).await;
                    debug!(
                        target = %decision.target,
                        reasoning = %decision.reasoning,
                        "Route decided"
                    );
                    decision.target
                }
            };

            let worker_id = match target {
                RouteTarget::Finish => break,
                RouteTarget::Worker(worker_id) => worker_id,
            };

            // The chosen worker's model must be healthy before dispatch;
            // finishing needs no such check.
            let query = latest_user_query(state);
            let choice = self.models.select_model(worker_id, &query);
            if !self.breakers.can_execute(&choice.model) {
                warn!(
                    worker = %worker_id,
                    model = %choice.model,
                    "Circuit open for chosen model, finishing"
                );
                break;
            }

            let Some(worker) = self.workers.get(&worker_id) else {
                break;
            };

            emit(&events, DispatchEvent::AgentStart { worker: worker_id }).await;
            let delta = {
                let ctx = WorkerContext {
                    state,
                    artifacts: &artifacts,
                    provider: self.provider.as_ref(),
                    models: &self.models,
                    max_tokens: WORKER_MAX_TOKENS,
                };
                worker.act(&ctx).await
            };

            // A handoff back to the emitting worker would loop without
            // router oversight; drop it and let the router decide.
            let handoff = match delta.next {
                Some(RouteTarget::Worker(target)) if target == worker_id => {
                    warn!(worker = %worker_id, "Ignoring handoff to self");
                    None
                }
                other => other,
            };
            for message in &delta.messages {
                emit(
                    &events,
                    DispatchEvent::Chunk {
                        content: message.content.clone(),
                    },
                )
                .await;
            }
            for artifact in &delta.artifacts {
                artifacts.put(artifact.clone());
            }
            state.apply(delta);
            // The handoff is consumed here, never left pending.
            state.next = None;
            emit(&events, DispatchEvent::AgentEnd { worker: worker_id }).await;

            if let Some(target) = handoff {
                emit(
                    &events,
                    DispatchEvent::Handoff {
                        from: worker_id,
                        to: target,
                    },
                )
                .await;
                state.needs_retry = false;
                state.reset_retries(worker_id);
                next = Some(target);
                continue;
            }

            if worker.self_loop() && state.needs_retry {
                let count = state.record_retry(worker_id);
                if count <= self.max_agent_retries {
                    debug!(worker = %worker_id, retry = count, "Self-loop retry");
                    next = Some(RouteTarget::Worker(worker_id));
                    continue;
                }
                warn!(worker = %worker_id, "Self-loop ceiling reached, returning to router");
                state.needs_retry = false;
                state.reset_retries(worker_id);
            } else {
                state.reset_retries(worker_id);
            }
        }

        emit(&events, DispatchEvent::Done).await;

        let reply = state
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "No reply was produced.".to_string());

        info!(
            thread_id = %state.thread_id,
            turns = state.turn_count,
            contributors = state.contributors.len(),
            "Conversation run finished"
        );

        DispatchReport {
            reply,
            thread_id: state.thread_id,
            contributors: state.contributors.clone(),
            turn_count: state.turn_count,
            artifacts: artifacts.all(),
        }
    }
}
