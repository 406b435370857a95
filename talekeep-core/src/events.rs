//! Real-time event hub.
//!
//! Fans operation progress/log/status events out to subscribed clients over
//! bounded per-client channels. A slow consumer only ever loses its own
//! events: delivery is a non-blocking `try_send`, drops are counted and
//! logged, and the client-map lock is never held across a send.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use talekeep_model::{LogLevel, OperationStatus, calculate_percentage};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{CoreError, Result};

/// Wire-visible event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    #[serde(rename = "operation.progress")]
    OperationProgress,
    #[serde(rename = "operation.status")]
    OperationStatus,
    #[serde(rename = "operation.log")]
    OperationLog,
    #[serde(rename = "system.status")]
    SystemStatus,
    #[serde(rename = "connection.established")]
    ConnectionEstablished,
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

/// One event on the stream. `id` is the associated operation id, empty for
/// system-wide events.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType, id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            event_type,
            id: id.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    fn heartbeat() -> Self {
        Self::new(EventType::Heartbeat, "", Map::new())
    }
}

struct ClientHandle {
    tx: mpsc::Sender<Event>,
    /// Operation ids this client wants; empty means everything.
    subscriptions: HashSet<String>,
}

/// In-process fan-out engine for UI clients.
pub struct EventHub {
    clients: RwLock<HashMap<String, ClientHandle>>,
    buffer: usize,
    dropped: AtomicU64,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("buffer", &self.buffer)
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventHub {
    pub fn new(client_buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            buffer: client_buffer.max(1),
            dropped: AtomicU64::new(0),
        })
    }

    /// Register a new client, optionally pre-subscribed to one operation.
    ///
    /// The first message on the returned channel is always
    /// `connection.established` carrying the assigned client id.
    pub async fn register_client(
        &self,
        operation_id: Option<String>,
    ) -> (String, mpsc::Receiver<Event>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.buffer);

        let mut data = Map::new();
        data.insert("client_id".into(), json!(id));
        let hello = Event::new(EventType::ConnectionEstablished, "", data);
        // A fresh buffer always has room for the hello.
        let _ = tx.try_send(hello);

        let mut subscriptions = HashSet::new();
        if let Some(op) = operation_id {
            subscriptions.insert(op);
        }

        let mut clients = self.clients.write().await;
        clients.insert(id.clone(), ClientHandle { tx, subscriptions });
        tracing::debug!(client_id = %id, clients = clients.len(), "client registered");
        (id, rx)
    }

    /// Remove a client. Dropping its handle drops the only sender, which
    /// closes the delivery channel exactly once.
    pub async fn unregister_client(&self, id: &str) {
        let mut clients = self.clients.write().await;
        if clients.remove(id).is_some() {
            tracing::debug!(client_id = %id, clients = clients.len(), "client unregistered");
        }
    }

    pub async fn subscribe(&self, client_id: &str, operation_id: &str) -> Result<()> {
        let mut clients = self.clients.write().await;
        let handle = clients
            .get_mut(client_id)
            .ok_or_else(|| CoreError::not_found(format!("client {client_id}")))?;
        handle.subscriptions.insert(operation_id.to_owned());
        Ok(())
    }

    pub async fn unsubscribe(&self, client_id: &str, operation_id: &str) -> Result<()> {
        let mut clients = self.clients.write().await;
        let handle = clients
            .get_mut(client_id)
            .ok_or_else(|| CoreError::not_found(format!("client {client_id}")))?;
        handle.subscriptions.remove(operation_id);
        Ok(())
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Events dropped because a client buffer was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Deliver to every client interested in the event: everyone for an
    /// empty event id, otherwise clients with no subscriptions or with a
    /// matching one. Senders are cloned under the read lock and the lock is
    /// released before any send happens.
    pub async fn broadcast(&self, event: Event) {
        let targets: Vec<(String, mpsc::Sender<Event>)> = {
            let clients = self.clients.read().await;
            clients
                .iter()
                .filter(|(_, handle)| {
                    event.id.is_empty()
                        || handle.subscriptions.is_empty()
                        || handle.subscriptions.contains(&event.id)
                })
                .map(|(id, handle)| (id.clone(), handle.tx.clone()))
                .collect()
        };

        let mut gone = Vec::new();
        for (client_id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(client_id = %client_id, event = ?event.event_type, "client buffer full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(client_id),
            }
        }

        if !gone.is_empty() {
            let mut clients = self.clients.write().await;
            for id in gone {
                clients.remove(&id);
            }
        }
    }

    /// Periodic heartbeat so idle streams stay distinguishable from dead
    /// ones. Returns the task handle; aborting it stops the heartbeat.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                hub.broadcast(Event::heartbeat()).await;
            }
        })
    }

    pub async fn send_operation_progress(&self, id: &str, current: u64, total: u64, message: &str) {
        let mut data = Map::new();
        data.insert("current".into(), json!(current));
        data.insert("total".into(), json!(total));
        data.insert(
            "percentage".into(),
            json!(calculate_percentage(current, total)),
        );
        data.insert("message".into(), json!(message));
        self.broadcast(Event::new(EventType::OperationProgress, id, data))
            .await;
    }

    pub async fn send_operation_status(
        &self,
        id: &str,
        status: OperationStatus,
        details: Option<Map<String, Value>>,
    ) {
        let mut data = details.unwrap_or_default();
        data.insert("status".into(), json!(status.as_str()));
        self.broadcast(Event::new(EventType::OperationStatus, id, data))
            .await;
    }

    pub async fn send_operation_log(
        &self,
        id: &str,
        level: LogLevel,
        message: &str,
        details: Option<Value>,
    ) {
        let mut data = Map::new();
        data.insert("level".into(), json!(level.as_str()));
        data.insert("message".into(), json!(message));
        if let Some(details) = details {
            data.insert("details".into(), details);
        }
        self.broadcast(Event::new(EventType::OperationLog, id, data))
            .await;
    }

    /// System-wide status snapshot; empty event id reaches every client.
    pub async fn send_system_status(&self, data: Map<String, Value>) {
        self.broadcast(Event::new(EventType::SystemStatus, "", data))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain_hello(rx: &mut mpsc::Receiver<Event>) {
        let hello = rx.recv().await.expect("hello event");
        assert_eq!(hello.event_type, EventType::ConnectionEstablished);
        assert!(hello.data.contains_key("client_id"));
    }

    #[tokio::test]
    async fn connection_established_is_first() {
        let hub = EventHub::new(4);
        let (id, mut rx) = hub.register_client(None).await;
        let hello = rx.recv().await.unwrap();
        assert_eq!(hello.event_type, EventType::ConnectionEstablished);
        assert_eq!(hello.data["client_id"], json!(id));
    }

    #[tokio::test]
    async fn fanout_respects_subscriptions() {
        let hub = EventHub::new(4);
        let (_, mut all) = hub.register_client(None).await;
        let (_, mut only_a) = hub.register_client(Some("op-a".into())).await;
        drain_hello(&mut all).await;
        drain_hello(&mut only_a).await;

        hub.send_operation_progress("op-b", 1, 2, "working").await;
        hub.send_operation_progress("op-a", 1, 2, "working").await;

        // The unsubscribed client sees both.
        assert_eq!(all.recv().await.unwrap().id, "op-b");
        assert_eq!(all.recv().await.unwrap().id, "op-a");
        // The subscribed client sees only its operation.
        let got = only_a.recv().await.unwrap();
        assert_eq!(got.id, "op-a");
        assert!(only_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_event_id_reaches_subscribed_clients() {
        let hub = EventHub::new(4);
        let (_, mut only_a) = hub.register_client(Some("op-a".into())).await;
        drain_hello(&mut only_a).await;

        hub.send_system_status(Map::new()).await;
        assert_eq!(
            only_a.recv().await.unwrap().event_type,
            EventType::SystemStatus
        );
    }

    #[tokio::test]
    async fn slow_consumer_does_not_block_others() {
        let hub = EventHub::new(1);
        let (_, mut healthy) = hub.register_client(None).await;
        let (_, mut slow) = hub.register_client(None).await;
        drain_hello(&mut healthy).await;
        // The slow client never drains; its buffer holds only the hello.

        for i in 0..5u64 {
            hub.send_operation_progress("op-x", i, 5, "tick").await;
        }

        // Healthy client got at least the first event; slow client dropped.
        let got = healthy.recv().await.unwrap();
        assert_eq!(got.event_type, EventType::OperationProgress);
        assert!(hub.dropped_events() > 0);
        // The slow client still has only its undrained hello.
        assert_eq!(
            slow.recv().await.unwrap().event_type,
            EventType::ConnectionEstablished
        );
    }

    #[tokio::test]
    async fn unregister_closes_channel_once() {
        let hub = EventHub::new(4);
        let (id, mut rx) = hub.register_client(None).await;
        drain_hello(&mut rx).await;
        hub.unregister_client(&id).await;
        assert!(rx.recv().await.is_none());
        // A second unregister is a no-op.
        hub.unregister_client(&id).await;
    }

    #[tokio::test]
    async fn progress_percentage_is_bounded() {
        let hub = EventHub::new(4);
        let (_, mut rx) = hub.register_client(None).await;
        drain_hello(&mut rx).await;

        hub.send_operation_progress("op", 2, 5, "m").await;
        assert_eq!(rx.recv().await.unwrap().data["percentage"], json!(40.0));

        hub.send_operation_progress("op", 7, 5, "m").await;
        assert_eq!(rx.recv().await.unwrap().data["percentage"], json!(100.0));

        hub.send_operation_progress("op", 7, 0, "m").await;
        assert_eq!(rx.recv().await.unwrap().data["percentage"], json!(0.0));
    }
}
