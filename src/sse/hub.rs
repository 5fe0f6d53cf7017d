//! SSE Hub
//!
//! Per-user connection registry with FIFO delivery. Every connection owns a
//! bounded channel; a consumer that blocks a send past the timeout is dropped
//! rather than buffered without bound. Heartbeats are comment frames emitted
//! by the transport layer (axum `KeepAlive`), cancelled with the connection.

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Closed event namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventName {
    Connected,
    AuthSuccess,
    Error,
    Close,
    SyncProgress,
    DetectionUpdates,
    FinancialEvents,
    Notifications,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Connected => "connected",
            EventName::AuthSuccess => "auth_success",
            EventName::Error => "error",
            EventName::Close => "close",
            EventName::SyncProgress => "sync_progress",
            EventName::DetectionUpdates => "detection_updates",
            EventName::FinancialEvents => "financial_events",
            EventName::Notifications => "notifications",
        }
    }
}

/// One framed event on its way to a client.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub name: EventName,
    pub data: Value,
    pub id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub user_id: String,
    pub connection_id: Uuid,
}

struct Connection {
    id: Uuid,
    tenant: Option<String>,
    tx: mpsc::Sender<OutboundEvent>,
}

/// How many events a slow consumer may lag before delivery starts blocking.
const CHANNEL_CAPACITY: usize = 64;
/// How long a blocked delivery waits before the connection is dropped.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct SseHub {
    connections: RwLock<HashMap<String, Vec<Connection>>>,
}

impl SseHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a user. The `connected` hello is queued
    /// before the receiver is handed back, so it is always the first frame.
    pub fn register(
        &self,
        user_id: &str,
        tenant: Option<String>,
    ) -> (ConnectionHandle, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let id = Uuid::new_v4();

        let hello = OutboundEvent {
            name: EventName::Connected,
            data: json!({
                "status": "connected",
                "timestamp": Utc::now(),
                "user_id": user_id,
                "tenant": tenant.clone(),
            }),
            id: None,
        };
        let _ = tx.try_send(hello);

        self.connections
            .write()
            .entry(user_id.to_string())
            .or_default()
            .push(Connection {
                id,
                tenant,
                tx,
            });

        info!(user = user_id, connection = %id, "📡 SSE client registered");
        metrics::gauge!("recoup_sse_connections", self.total_connections() as f64);

        (
            ConnectionHandle {
                user_id: user_id.to_string(),
                connection_id: id,
            },
            rx,
        )
    }

    pub fn unregister(&self, handle: &ConnectionHandle) {
        let mut connections = self.connections.write();
        if let Some(list) = connections.get_mut(&handle.user_id) {
            list.retain(|c| c.id != handle.connection_id);
            if list.is_empty() {
                connections.remove(&handle.user_id);
            }
        }
        drop(connections);
        debug!(user = %handle.user_id, connection = %handle.connection_id, "SSE client unregistered");
        metrics::gauge!("recoup_sse_connections", self.total_connections() as f64);
    }

    /// Deliver an event to every connection of one user, FIFO per connection.
    /// Consumers that block past the send timeout are dropped.
    pub async fn send_event(&self, user_id: &str, name: EventName, data: Value, id: Option<String>) {
        let targets: Vec<(Uuid, mpsc::Sender<OutboundEvent>)> = {
            let connections = self.connections.read();
            match connections.get(user_id) {
                Some(list) => list.iter().map(|c| (c.id, c.tx.clone())).collect(),
                None => return,
            }
        };

        let event = OutboundEvent {
            name,
            data: with_timestamp(data),
            id,
        };

        let mut dead = Vec::new();
        for (conn_id, tx) in targets {
            match tx.send_timeout(event.clone(), SEND_TIMEOUT).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!(user = user_id, connection = %conn_id, "dropping slow SSE consumer");
                    dead.push(conn_id);
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    dead.push(conn_id);
                }
            }
        }

        if !dead.is_empty() {
            let mut connections = self.connections.write();
            if let Some(list) = connections.get_mut(user_id) {
                list.retain(|c| !dead.contains(&c.id));
                if list.is_empty() {
                    connections.remove(user_id);
                }
            }
        }
    }

    /// Deliver an event to every user of a tenant. No cross-user ordering
    /// guarantees.
    pub async fn broadcast_tenant(&self, tenant: &str, name: EventName, data: Value) {
        let users: Vec<String> = {
            let connections = self.connections.read();
            connections
                .iter()
                .filter(|(_, list)| list.iter().any(|c| c.tenant.as_deref() == Some(tenant)))
                .map(|(user, _)| user.clone())
                .collect()
        };

        for user in users {
            self.send_event(&user, name, data.clone(), None).await;
        }
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.connections
            .read()
            .get(user_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.connections.read().values().map(Vec::len).sum()
    }
}

/// Every payload carries a timestamp; endpoints add sync_id where applicable.
fn with_timestamp(mut data: Value) -> Value {
    if let Value::Object(map) = &mut data {
        map.entry("timestamp".to_string())
            .or_insert_with(|| json!(Utc::now()));
    }
    data
}
