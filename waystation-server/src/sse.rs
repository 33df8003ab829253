//! SSE fan-out of the event bus.
//!
//! Wire format: one `data: <json>` line per event, blank-line terminated;
//! heartbeats are `: ping` comment lines every 15 seconds. There is no
//! replay — clients reconcile by polling the stores after subscribing.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::state::AppState;

const HEARTBEAT: Duration = Duration::from_secs(15);

/// `GET /api/notifications/stream`
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();
    let stream = ReceiverStream::new(rx)
        .map(|line| Ok::<_, Infallible>(Event::default().data(line.to_string())));

    Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT).text("ping"))
}
