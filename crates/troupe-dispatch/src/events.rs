use serde::Serialize;
use tokio::sync::mpsc;
use troupe_core::{RouteTarget, WorkerId};

/// Events emitted while a conversation run is in flight.
///
/// Mirrored to SSE by the gateway; emission is best effort and a slow or
/// dropped consumer never stalls the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// A worker is about to act.
    AgentStart {
        /// The worker.
        worker: WorkerId,
    },
    /// A worker handed control directly to another target.
    Handoff {
        /// The worker handing off.
        from: WorkerId,
        /// Where control goes.
        to: RouteTarget,
    },
    /// A worker finished acting.
    AgentEnd {
        /// The worker.
        worker: WorkerId,
    },
    /// A piece of reply content.
    Chunk {
        /// The content.
        content: String,
    },
    /// The run finished.
    Done,
}

/// Best-effort emission to an optional event channel.
pub(crate) async fn emit(events: &Option<mpsc::Sender<DispatchEvent>>, event: DispatchEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_shape() {
        let json = serde_json::to_value(DispatchEvent::Handoff {
            from: WorkerId::Reviewer,
            to: RouteTarget::Finish,
        })
        .unwrap();
        assert_eq!(json["event"], "handoff");
        assert_eq!(json["from"], "reviewer");
        assert_eq!(json["to"], "finish");
    }

    #[tokio::test]
    async fn test_emit_without_channel_is_noop() {
        emit(&None, DispatchEvent::Done).await;
    }
}
