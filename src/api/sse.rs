//! Server-Sent Events support
//!
//! A subscriber sees events published after it connects. Nothing is
//! replayed; a client that reconnects starts a fresh view.

use crate::events::EventEnvelope;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Convert a session's event subscription to an SSE stream
pub fn sse_stream(
    session_id: String,
    turn_running: bool,
    rx: broadcast::Receiver<EventEnvelope>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let connected = json!({
        "type": "connected",
        "session_id": session_id,
        "turn_running": turn_running,
    });
    let init = futures::stream::once(async move {
        Ok(Event::default()
            .event("connected")
            .data(connected.to_string()))
    });

    let events = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(envelope) => envelope_to_event(&envelope).map(Ok),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(skipped, "SSE subscriber lagged, events dropped");
            None
        }
    });

    Sse::new(init.chain(events)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn envelope_to_event(envelope: &EventEnvelope) -> Option<Event> {
    match serde_json::to_string(envelope) {
        Ok(data) => Some(
            Event::default()
                .event(envelope.event.event_type())
                .id(format!("{}:{}", envelope.turn_id, envelope.sequence))
                .data(data),
        ),
        Err(e) => {
            tracing::error!(
                error = %e,
                event = envelope.event.event_type(),
                "Failed to serialize event"
            );
            None
        }
    }
}
