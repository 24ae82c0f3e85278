//! Server-sent event render surface
//!
//! Every surface call becomes one named event on a channel; the route handler
//! drains the channel into the SSE response.

use axum::response::sse::Event;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::conversation::Role;
use crate::core::{ChatError, Notice, PlaceholderId, RenderSurface, RenderUpdate, SubmitOutcome};

/// One event bound for the client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurfaceEvent {
    pub name: &'static str,
    pub data: Value,
}

impl SurfaceEvent {
    fn new(name: &'static str, data: Value) -> Self {
        Self { name, data }
    }

    pub fn into_sse(self) -> Event {
        Event::default().event(self.name).data(self.data.to_string())
    }
}

pub struct ChannelSurface {
    tx: UnboundedSender<SurfaceEvent>,
}

impl ChannelSurface {
    pub fn new(tx: UnboundedSender<SurfaceEvent>) -> Self {
        Self { tx }
    }

    /// Final event of a submission
    pub fn done(&mut self, result: &Result<SubmitOutcome, ChatError>) {
        let data = match result {
            Ok(SubmitOutcome::Committed(response)) => json!({
                "outcome": "committed",
                "metrics": response.metrics,
            }),
            Ok(SubmitOutcome::Empty(empty)) => json!({
                "outcome": "empty",
                "message": empty.to_string(),
            }),
            Err(e) => json!({
                "outcome": "error",
                "message": e.to_string(),
            }),
        };
        self.send(SurfaceEvent::new("done", data));
    }

    fn send(&mut self, event: SurfaceEvent) {
        // The client may have gone away; the generation still completes
        if self.tx.send(event).is_err() {
            tracing::debug!("Event receiver dropped");
        }
    }
}

impl RenderSurface for ChannelSurface {
    fn create_placeholder(&mut self, role: Role) -> PlaceholderId {
        let id = PlaceholderId::new();
        self.send(SurfaceEvent::new("placeholder", json!({ "id": id, "role": role })));
        id
    }

    fn update_placeholder(&mut self, id: PlaceholderId, update: RenderUpdate) {
        let name = match update {
            RenderUpdate::Preview { .. } => "preview",
            RenderUpdate::ThinkingBlock { .. } => "thinking",
            RenderUpdate::Answer { .. } => "answer",
            RenderUpdate::Metrics(_) => "metrics",
        };
        let mut data = serde_json::to_value(&update).unwrap_or_default();
        data["id"] = json!(id);
        self.send(SurfaceEvent::new(name, data));
    }

    fn notify(&mut self, notice: Notice) {
        self.send(SurfaceEvent::new("notice", json!(notice)));
    }

    fn set_input_enabled(&mut self, enabled: bool) {
        self.send(SurfaceEvent::new("input", json!({ "enabled": enabled })));
    }
}
