use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::state::OrchState;

/// GET /api/events: SSE stream of status table snapshots.
///
/// The current table is sent on connect, then one `table` event per applied
/// update. A slow client only ever sees the latest table.
pub async fn table_events(
    State(app): State<OrchState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = WatchStream::new(app.orch.watch())
        .map(|snapshot| Event::default().event("table").json_data(&snapshot));
    Sse::new(stream).keep_alive(KeepAlive::default())
}
