//! Live SSE tail of the event bus.
//!
//! Each connection gets its own broadcast receiver, created at connect
//! time. Nothing emitted before that is replayed; clients pull a snapshot.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::stream::{self, Stream};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tracing::{debug, warn};

use crate::domain::{Event, LiveFrame};

use crate::server::AppState;

/// GET /api/stream
pub async fn stream_events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    debug!(listeners = state.events.live_listeners() + 1, "Live client connected");
    let stream = stream::unfold(state.events.tail(), |mut rx| async move {
        let frame = next_frame(&mut rx).await?;
        Some((Ok(frame), rx))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// Wait for the next forwardable event. `None` once the bus is gone.
async fn next_frame(rx: &mut Receiver<Event>) -> Option<SseEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => match encode(event) {
                Ok(frame) => return Some(frame),
                Err(e) => warn!(error = %e, "Dropping event that failed to encode"),
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Live client lagged; events dropped, client must resync");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

fn encode(event: Event) -> Result<SseEvent, serde_json::Error> {
    let data = serde_json::to_string(&LiveFrame::from(event))?;
    Ok(SseEvent::default().data(data))
}
