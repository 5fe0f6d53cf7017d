//! SSE endpoints.
//!
//! Every endpoint speaks `text/event-stream`, authenticates through the shared
//! JWT gate (bearer header, `token` query parameter, or cookie), and differs
//! only in which slice of the event stream it forwards. Unauthenticated
//! clients get a typed `error` event and the stream ends, unless demo mode
//! serves them a reduced stream under a synthetic identity.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use axum_extra::extract::CookieJar;
use futures_util::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::auth::JwtGate;
use crate::queue::DetectionQueue;
use crate::sse::hub::{ConnectionHandle, EventName, OutboundEvent, SseHub};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const COOKIE_NAME: &str = "recoup_token";

#[derive(Clone)]
pub struct SseState {
    pub hub: Arc<SseHub>,
    pub gate: Arc<JwtGate>,
    pub queue: Arc<DetectionQueue>,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Which events one endpoint forwards.
#[derive(Debug, Clone)]
enum EventFilter {
    All,
    Name(EventName),
    NameAndSync(EventName, String),
}

impl EventFilter {
    fn allows(&self, event: &OutboundEvent, demo: bool) -> bool {
        // Demo clients get the reduced stream: lifecycle frames only.
        if demo
            && !matches!(
                event.name,
                EventName::Connected | EventName::Notifications | EventName::Error | EventName::Close
            )
        {
            return false;
        }

        match self {
            EventFilter::All => true,
            EventFilter::Name(name) => {
                event.name == *name || matches!(event.name, EventName::Error | EventName::Close)
            }
            EventFilter::NameAndSync(name, sync_id) => {
                (event.name == *name
                    && event.data.get("sync_id").and_then(|v| v.as_str()) == Some(sync_id))
                    || matches!(event.name, EventName::Error | EventName::Close)
            }
        }
    }
}

pub fn router(state: SseState) -> Router {
    Router::new()
        .route("/stream", get(stream_all))
        .route("/status", get(service_status))
        .route("/sync-progress/:sync_id", get(sync_progress))
        .route("/detection-updates/:sync_id", get(detection_updates))
        .route("/financial-events", get(financial_events))
        .route("/notifications", get(notifications))
        .route("/connection-status", get(connection_status))
        .with_state(state)
}

type EventStream = Sse<BoxStream<'static, Result<Event, Infallible>>>;

fn extract_token(params: &TokenQuery, headers: &HeaderMap, jar: &CookieJar) -> Option<String> {
    if let Some(token) = &params.token {
        return Some(token.clone());
    }
    if let Some(token) = headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }
    jar.get(COOKIE_NAME).map(|c| c.value().to_string())
}

fn frame(event: &OutboundEvent) -> Option<Event> {
    let mut out = Event::default().event(event.name.as_str());
    if let Some(id) = &event.id {
        out = out.id(id);
    }
    match out.json_data(&event.data) {
        Ok(ev) => Some(ev),
        Err(e) => {
            warn!(error = %e, "failed to serialize SSE frame");
            None
        }
    }
}

/// Terminal error stream: one typed `error` event, then `close`.
fn refused(reason: String, code: &'static str) -> EventStream {
    let stream = async_stream::stream! {
        if let Ok(ev) = Event::default()
            .event(EventName::Error.as_str())
            .json_data(json!({"error": reason, "code": code}))
        {
            yield Ok::<Event, Infallible>(ev);
        }
        yield Ok(Event::default().event(EventName::Close.as_str()).data("{}"));
    };
    Sse::new(stream.boxed())
}

/// Guard that unregisters the connection when the client goes away.
struct Unregister {
    hub: Arc<SseHub>,
    handle: ConnectionHandle,
}

impl Drop for Unregister {
    fn drop(&mut self) {
        self.hub.unregister(&self.handle);
    }
}

fn open_stream(
    state: &SseState,
    params: TokenQuery,
    headers: HeaderMap,
    jar: CookieJar,
    filter: EventFilter,
) -> EventStream {
    let token = extract_token(&params, &headers, &jar);
    let user = match state.gate.authenticate(token.as_deref()) {
        Ok(user) => user,
        Err(e) => return refused(e.to_string(), e.code()),
    };

    let (handle, mut rx) = state.hub.register(&user.user_id, user.tenant.clone());
    let hub = state.hub.clone();
    let demo = user.demo;
    let user_id = user.user_id.clone();

    let stream = async_stream::stream! {
        let _guard = Unregister { hub, handle };

        // The hello queued at registration is always the first frame.
        if let Some(hello) = rx.recv().await {
            if let Some(ev) = frame(&hello) {
                yield Ok::<Event, Infallible>(ev);
            }
        }

        if !demo {
            let ack = OutboundEvent {
                name: EventName::AuthSuccess,
                data: json!({"user_id": user_id, "timestamp": chrono::Utc::now()}),
                id: None,
            };
            if let Some(ev) = frame(&ack) {
                yield Ok(ev);
            }
        }

        while let Some(event) = rx.recv().await {
            if !filter.allows(&event, demo) {
                continue;
            }
            if let Some(ev) = frame(&event) {
                yield Ok(ev);
            }
        }
    };

    Sse::new(stream.boxed()).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("keep-alive"),
    )
}

async fn stream_all(
    State(state): State<SseState>,
    Query(params): Query<TokenQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> EventStream {
    open_stream(&state, params, headers, jar, EventFilter::All)
}

async fn sync_progress(
    State(state): State<SseState>,
    Path(sync_id): Path<String>,
    Query(params): Query<TokenQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> EventStream {
    open_stream(
        &state,
        params,
        headers,
        jar,
        EventFilter::NameAndSync(EventName::SyncProgress, sync_id),
    )
}

async fn detection_updates(
    State(state): State<SseState>,
    Path(sync_id): Path<String>,
    Query(params): Query<TokenQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> EventStream {
    open_stream(
        &state,
        params,
        headers,
        jar,
        EventFilter::NameAndSync(EventName::DetectionUpdates, sync_id),
    )
}

async fn financial_events(
    State(state): State<SseState>,
    Query(params): Query<TokenQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> EventStream {
    open_stream(
        &state,
        params,
        headers,
        jar,
        EventFilter::Name(EventName::FinancialEvents),
    )
}

async fn notifications(
    State(state): State<SseState>,
    Query(params): Query<TokenQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> EventStream {
    open_stream(
        &state,
        params,
        headers,
        jar,
        EventFilter::Name(EventName::Notifications),
    )
}

/// One-shot service status, framed like every other stream.
async fn service_status(
    State(state): State<SseState>,
    Query(params): Query<TokenQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> EventStream {
    let token = extract_token(&params, &headers, &jar);
    if let Err(e) = state.gate.authenticate(token.as_deref()) {
        return refused(e.to_string(), e.code());
    }

    let queue_healthy = state.queue.healthy();
    let connections = state.hub.total_connections();
    let stream = async_stream::stream! {
        let payload = json!({
            "status": if queue_healthy { "ok" } else { "degraded" },
            "queue_healthy": queue_healthy,
            "connections": connections,
            "timestamp": chrono::Utc::now(),
        });
        if let Ok(ev) = Event::default()
            .event(EventName::Connected.as_str())
            .json_data(payload)
        {
            yield Ok::<Event, Infallible>(ev);
        }
        yield Ok(Event::default().event(EventName::Close.as_str()).data("{}"));
    };
    Sse::new(stream.boxed())
}

/// Live view of this user's registered connections.
async fn connection_status(
    State(state): State<SseState>,
    Query(params): Query<TokenQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> EventStream {
    let token = extract_token(&params, &headers, &jar);
    let user = match state.gate.authenticate(token.as_deref()) {
        Ok(user) => user,
        Err(e) => return refused(e.to_string(), e.code()),
    };

    let count = state.hub.connection_count(&user.user_id);
    let stream = async_stream::stream! {
        let payload = json!({
            "status": "connected",
            "user_id": user.user_id,
            "connections": count,
            "timestamp": chrono::Utc::now(),
        });
        if let Ok(ev) = Event::default()
            .event(EventName::Connected.as_str())
            .json_data(payload)
        {
            yield Ok::<Event, Infallible>(ev);
        }
        yield Ok(Event::default().event(EventName::Close.as_str()).data("{}"));
    };
    Sse::new(stream.boxed())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: EventName, data: serde_json::Value) -> OutboundEvent {
        OutboundEvent {
            name,
            data,
            id: None,
        }
    }

    #[test]
    fn test_filter_by_name() {
        let filter = EventFilter::Name(EventName::Notifications);
        assert!(filter.allows(&event(EventName::Notifications, json!({})), false));
        assert!(!filter.allows(&event(EventName::SyncProgress, json!({})), false));
        // Errors always pass so clients observe failures.
        assert!(filter.allows(&event(EventName::Error, json!({})), false));
    }

    #[test]
    fn test_filter_by_sync_id() {
        let filter = EventFilter::NameAndSync(EventName::SyncProgress, "sync-1".into());
        assert!(filter.allows(
            &event(EventName::SyncProgress, json!({"sync_id": "sync-1"})),
            false
        ));
        assert!(!filter.allows(
            &event(EventName::SyncProgress, json!({"sync_id": "sync-2"})),
            false
        ));
        assert!(!filter.allows(&event(EventName::SyncProgress, json!({})), false));
    }

    #[test]
    fn test_demo_gets_reduced_stream() {
        let filter = EventFilter::All;
        assert!(filter.allows(&event(EventName::Notifications, json!({})), true));
        assert!(filter.allows(&event(EventName::Connected, json!({})), true));
        assert!(!filter.allows(&event(EventName::DetectionUpdates, json!({})), true));
        assert!(!filter.allows(&event(EventName::FinancialEvents, json!({})), true));
    }
}
