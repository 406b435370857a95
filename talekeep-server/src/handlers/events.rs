//! Server-sent event stream bridging the in-process hub to UI clients.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Deserialize;
use talekeep_core::events::EventHub;

use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Restrict the stream to one operation id.
    pub operation: Option<String>,
}

/// Drops back to the hub when the SSE connection goes away, so the client
/// entry (and its delivery channel) is removed exactly once.
struct UnregisterOnDrop {
    hub: Arc<EventHub>,
    client_id: String,
}

impl Drop for UnregisterOnDrop {
    fn drop(&mut self) {
        let hub = Arc::clone(&self.hub);
        let client_id = std::mem::take(&mut self.client_id);
        tokio::spawn(async move {
            hub.unregister_client(&client_id).await;
        });
    }
}

pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, anyhow::Error>>> {
    let heartbeat = state.config.event_hub.heartbeat_interval_secs;
    let (client_id, receiver) = state.hub.register_client(query.operation).await;
    let guard = UnregisterOnDrop {
        hub: Arc::clone(&state.hub),
        client_id,
    };

    let stream = futures::stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
        match receiver.recv().await {
            Some(event) => {
                let sse = Event::default().json_data(&event).map_err(Into::into);
                Some((sse, (receiver, guard)))
            }
            None => None,
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(heartbeat.max(1)))
            .text("keepalive"),
    )
}
