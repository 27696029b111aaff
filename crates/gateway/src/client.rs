//! Client state and registry management.
//!
//! The registry is the gateway's broadcast surface: it tracks connected
//! clients, their room memberships, and a reverse room → clients index for
//! routing. Per-client send queues are bounded; a client that cannot keep
//! up overflows its queue and is dropped.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;
use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Bounded per-client send queue; overflow drops the connection.
pub const SEND_QUEUE_LIMIT: usize = 1024;

/// Protocol violations tolerated before the connection is dropped.
pub const MAX_PROTOCOL_VIOLATIONS: u32 = 3;

/// State for a single connected client.
pub struct ClientState {
    /// Unique client identifier.
    pub id: ClientId,
    /// Channel to the connection's writer task.
    tx: mpsc::Sender<Message>,
    /// Rooms this client has joined.
    pub rooms: DashSet<String>,
    /// Timestamp when the client connected (epoch ms).
    pub connected_at: i64,
    /// Timestamp of the last ping received.
    last_ping: AtomicI64,
    /// Count of protocol violations on this connection.
    violations: AtomicU32,
}

impl ClientState {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            tx,
            rooms: DashSet::new(),
            connected_at: now,
            last_ping: AtomicI64::new(now),
            violations: AtomicU32::new(0),
        }
    }

    /// Send a message to this client without blocking. A full queue is an
    /// overflow error; callers drop the connection.
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.send_raw(json)
    }

    /// Send a pre-serialized frame.
    pub fn send_raw(&self, json: String) -> Result<()> {
        self.tx
            .try_send(Message::Text(json.into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => GatewayError::SendQueueFull,
                mpsc::error::TrySendError::Closed(_) => GatewayError::ChannelSend,
            })
    }

    /// Queue a WebSocket ping frame.
    pub fn send_ping(&self) -> Result<()> {
        self.tx
            .try_send(Message::Ping(Vec::new().into()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => GatewayError::SendQueueFull,
                mpsc::error::TrySendError::Closed(_) => GatewayError::ChannelSend,
            })
    }

    /// Record a pong/ping from the client.
    pub fn update_ping(&self) {
        self.last_ping
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_ping_time(&self) -> i64 {
        self.last_ping.load(Ordering::Relaxed)
    }

    /// Record a protocol violation; returns true once the connection has
    /// exhausted its tolerance and should be dropped.
    pub fn record_violation(&self) -> bool {
        let count = self.violations.fetch_add(1, Ordering::Relaxed) + 1;
        count >= MAX_PROTOCOL_VIOLATIONS
    }
}

/// Registry of connected clients and their room memberships.
pub struct ClientRegistry {
    /// Client ID → client state.
    clients: DashMap<ClientId, Arc<ClientState>>,
    /// Room name → member client IDs.
    rooms: DashMap<String, DashSet<ClientId>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Register a new client.
    pub fn register(&self, client: Arc<ClientState>) -> ClientId {
        let id = client.id;
        self.clients.insert(id, client);
        info!("Client {id} connected");
        id
    }

    /// Unregister a client and release all of its room memberships.
    pub fn unregister(&self, client_id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(client_id) {
            for room in client.rooms.iter() {
                if let Some(members) = self.rooms.get(&*room) {
                    members.remove(client_id);
                }
            }
            info!("Client {client_id} disconnected");
        }
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientState>> {
        self.clients.get(client_id).map(|r| r.clone())
    }

    /// Join a room. Joining a room the client is already in is a no-op;
    /// returns whether the membership is new.
    pub fn join_room(&self, client_id: &ClientId, room: &str) -> Result<bool> {
        let client = self
            .clients
            .get(client_id)
            .ok_or_else(|| GatewayError::ClientNotFound(client_id.to_string()))?;

        let newly_joined = client.rooms.insert(room.to_string());
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(*client_id);

        if newly_joined {
            debug!("Client {client_id} joined {room}");
        }
        Ok(newly_joined)
    }

    /// Leave a room. Leaving a room the client never joined is a no-op.
    pub fn leave_room(&self, client_id: &ClientId, room: &str) -> Result<()> {
        let client = self
            .clients
            .get(client_id)
            .ok_or_else(|| GatewayError::ClientNotFound(client_id.to_string()))?;

        client.rooms.remove(room);
        if let Some(members) = self.rooms.get(room) {
            members.remove(client_id);
        }
        debug!("Client {client_id} left {room}");
        Ok(())
    }

    /// Members of a room.
    pub fn room_members(&self, room: &str) -> Vec<Arc<ClientState>> {
        if let Some(members) = self.rooms.get(room) {
            members
                .iter()
                .filter_map(|id| self.clients.get(&*id).map(|c| c.clone()))
                .collect()
        } else {
            Vec::new()
        }
    }

    /// Emit to every connected client. Returns the delivery count.
    pub fn broadcast(&self, msg: &ServerMessage) -> Result<usize> {
        let json = serde_json::to_string(msg)?;
        let targets: Vec<Arc<ClientState>> =
            self.clients.iter().map(|e| e.value().clone()).collect();
        Ok(self.deliver(&targets, &json))
    }

    /// Emit to every member of a room. Returns the delivery count.
    pub fn broadcast_to_room(&self, room: &str, msg: &ServerMessage) -> Result<usize> {
        let members = self.room_members(room);
        if members.is_empty() {
            return Ok(0);
        }
        let json = serde_json::to_string(msg)?;
        Ok(self.deliver(&members, &json))
    }

    /// Deliver a pre-serialized frame, dropping clients whose send queue
    /// overflowed.
    fn deliver(&self, targets: &[Arc<ClientState>], json: &str) -> usize {
        let mut delivered = 0;
        let mut overflowed = Vec::new();

        for client in targets {
            match client.send_raw(json.to_string()) {
                Ok(()) => delivered += 1,
                Err(GatewayError::SendQueueFull) => {
                    warn!("Client {} send queue overflow, dropping connection", client.id);
                    overflowed.push(client.id);
                }
                Err(_) => {
                    debug!("Client {} channel closed", client.id);
                }
            }
        }

        for id in overflowed {
            self.unregister(&id);
        }
        delivered
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Total number of (client, room) memberships.
    pub fn subscription_count(&self) -> usize {
        self.rooms.iter().map(|e| e.value().len()).sum()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::room_for_ticker;
    use serde_json::json;

    fn connect(registry: &ClientRegistry, queue: usize) -> (Arc<ClientState>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(queue);
        let client = Arc::new(ClientState::new(tx));
        registry.register(client.clone());
        (client, rx)
    }

    fn trade_frame(symbol: &str) -> ServerMessage {
        ServerMessage::TradeUpdate {
            data: json!({"type": "trade", "symbol": symbol, "price": 1.0}),
        }
    }

    #[tokio::test]
    async fn double_subscribe_is_a_no_op() {
        let registry = ClientRegistry::new();
        let (client, _rx) = connect(&registry, 8);
        let room = room_for_ticker("AAPL");

        assert!(registry.join_room(&client.id, &room).unwrap());
        assert!(!registry.join_room(&client.id, &room).unwrap());
        assert_eq!(registry.subscription_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_without_subscribe_is_a_no_op() {
        let registry = ClientRegistry::new();
        let (client, _rx) = connect(&registry, 8);

        registry.leave_room(&client.id, &room_for_ticker("MSFT")).unwrap();
        assert_eq!(registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn rooms_isolate_broadcasts() {
        let registry = ClientRegistry::new();
        let (c1, mut rx1) = connect(&registry, 8);
        let (c2, mut rx2) = connect(&registry, 8);
        registry.join_room(&c1.id, &room_for_ticker("AAPL")).unwrap();
        registry.join_room(&c2.id, &room_for_ticker("MSFT")).unwrap();

        let delivered = registry
            .broadcast_to_room(&room_for_ticker("AAPL"), &trade_frame("AAPL"))
            .unwrap();
        assert_eq!(delivered, 1);

        let frame = rx1.try_recv().expect("subscriber receives");
        match frame {
            Message::Text(text) => assert!(text.contains("trade_update")),
            other => panic!("expected text frame, got {other:?}"),
        }
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn global_broadcast_reaches_everyone() {
        let registry = ClientRegistry::new();
        let (_c1, mut rx1) = connect(&registry, 8);
        let (_c2, mut rx2) = connect(&registry, 8);

        let delivered = registry.broadcast(&trade_frame("AAPL")).unwrap();
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn disconnect_releases_room_memberships() {
        let registry = ClientRegistry::new();
        let (client, _rx) = connect(&registry, 8);
        registry.join_room(&client.id, &room_for_ticker("AAPL")).unwrap();

        registry.unregister(&client.id);
        assert_eq!(registry.client_count(), 0);
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(
            registry
                .broadcast_to_room(&room_for_ticker("AAPL"), &trade_frame("AAPL"))
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn send_queue_overflow_drops_the_client() {
        let registry = ClientRegistry::new();
        // queue of 1: the second undelivered frame overflows
        let (client, _rx) = connect(&registry, 1);
        registry.join_room(&client.id, &room_for_ticker("AAPL")).unwrap();

        let room = room_for_ticker("AAPL");
        assert_eq!(registry.broadcast_to_room(&room, &trade_frame("AAPL")).unwrap(), 1);
        assert_eq!(registry.broadcast_to_room(&room, &trade_frame("AAPL")).unwrap(), 0);
        assert_eq!(registry.client_count(), 0);
    }

    #[tokio::test]
    async fn violations_accumulate_to_a_drop() {
        let (tx, _rx) = mpsc::channel(1);
        let client = ClientState::new(tx);
        assert!(!client.record_violation());
        assert!(!client.record_violation());
        assert!(client.record_violation());
    }
}
