//! Renders a run's [`UpdateEvent`] stream as server-sent events.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use futures_util::StreamExt as _;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::domain::run::UpdateEvent;

fn frame_name(update: &UpdateEvent) -> &'static str {
    match update {
        UpdateEvent::AgentMessageChunk { .. } | UpdateEvent::ToolCall(_) | UpdateEvent::Plan(_) | UpdateEvent::Thought(_) => {
            "update"
        }
        UpdateEvent::Cancelled => "cancelled",
        UpdateEvent::Completed { .. } => "completed",
        UpdateEvent::Failed { .. } => "failed",
    }
}

/// One SSE frame per [`UpdateEvent`]: `event: <variant>\ndata: <json>\n\n`.
pub fn stream_updates(
    rx: UnboundedReceiver<UpdateEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = UnboundedReceiverStream::new(rx).map(|update| {
        let name = frame_name(&update);
        let event = match Event::default().event(name).json_data(&update) {
            Ok(event) => event,
            Err(_) => Event::default().event("failed").data("internal encoding error"),
        };
        Ok(event)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
