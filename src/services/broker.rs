//! Broker peer — multi-server coordination over pub/sub.
//!
//! DESIGN
//! ======
//! All inter-server traffic is JSON frames on channels prefixed with the
//! room key. Every frame carries the origin server id; receivers drop
//! their own frames, so publishing never needs loopback filtering at the
//! source. The broker itself sits behind a trait object (production uses
//! Redis, tests share one in-process bus) and the same handle doubles as
//! the key-value backend for layer snapshots.
//!
//! PRESENCE & LIVENESS
//! ===================
//! After a short settling delay a starting server demands the room state
//! with `collect`; every peer answers `provide` with its locally hosted
//! clients. From then on, every 10s with at least one remote server in
//! the roster, a `ping` goes out; remote ids that fail to `pong` within
//! 6s are declared dead and their clients pruned.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::protocol::{ChatBody, DistServer, PaintBody, PointerBody, StrokeBody, ValidChat};
use crate::roster::Client;
use crate::services::engine::{self, Origin};
use crate::state::AppState;

/// Frame kinds, each mapped to one prefixed channel.
pub const CHANNELS: [&str; 9] = [
    "collect", "provide", "ping", "pong", "system", "chat", "paint", "stroke", "pointer",
];

const SETTLE_DELAY: Duration = Duration::from_secs(3);
const PING_INTERVAL: Duration = Duration::from_secs(10);
const PONG_WINDOW: Duration = Duration::from_secs(6);

const SUBSCRIBE_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("frame encode failed: {0}")]
    Encode(String),
}

/// One message received from a subscribed channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

// =============================================================================
// BROKER TRAIT
// =============================================================================

/// The pub/sub + key-value surface this server needs from a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError>;

    /// Subscribe to a set of channels. Messages arrive on the returned
    /// receiver until it is dropped.
    async fn subscribe(&self, channels: Vec<String>) -> Result<mpsc::Receiver<ChannelMessage>, BrokerError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), BrokerError>;
}

// =============================================================================
// REDIS BROKER
// =============================================================================

pub struct RedisBroker {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
}

impl RedisBroker {
    /// Connect to the configured Redis instance.
    ///
    /// # Errors
    ///
    /// Returns a redis error if the initial connection fails.
    pub async fn connect(config: &Config) -> Result<Self, BrokerError> {
        let host = config.redis_host.as_deref().unwrap_or("127.0.0.1");
        let url = match &config.redis_password {
            Some(password) => format!("redis://:{password}@{host}:{}/", config.redis_port),
            None => format!("redis://{host}:{}/", config.redis_port),
        };
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: Vec<String>) -> Result<mpsc::Receiver<ChannelMessage>, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in &channels {
            pubsub.subscribe(channel).await?;
        }

        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                if tx.send(ChannelMessage { channel, payload }).await.is_err() {
                    break;
                }
            }
            info!("redis subscription stream ended");
        });
        Ok(rx)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }
}

// =============================================================================
// IN-PROCESS BROKER
// =============================================================================

/// One shared bus standing in for the external broker. Lets several
/// server instances in one process (tests, mostly) coordinate exactly as
/// they would through Redis.
pub struct MemoryBroker {
    bus: broadcast::Sender<ChannelMessage>,
    kv: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(SUBSCRIBE_BUFFER);
        Self { bus, kv: Mutex::new(HashMap::new()) }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        // No subscribers is fine; broadcast::send only errors then.
        let _ = self
            .bus
            .send(ChannelMessage { channel: channel.to_string(), payload });
        Ok(())
    }

    async fn subscribe(&self, channels: Vec<String>) -> Result<mpsc::Receiver<ChannelMessage>, BrokerError> {
        let mut bus_rx = self.bus.subscribe();
        let channels: HashSet<String> = channels.into_iter().collect();
        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        tokio::spawn(async move {
            while let Ok(msg) = bus_rx.recv().await {
                if !channels.contains(&msg.channel) {
                    continue;
                }
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        Ok(self.kv.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), BrokerError> {
        self.kv.lock().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

// =============================================================================
// PEER FRAME
// =============================================================================

/// Envelope for every inter-server frame. The `server` field is what
/// makes loopback suppression possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerFrame {
    pub server: DistServer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<Client>,
    #[serde(default)]
    pub body: serde_json::Value,
}

// =============================================================================
// BROKER PEER
// =============================================================================

pub struct BrokerPeer {
    broker: Arc<dyn Broker>,
    server_id: Uuid,
    key_prefix: String,
    /// Server ids heard from during the current pong window.
    pongs: Mutex<HashSet<Uuid>>,
}

impl BrokerPeer {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: &Config, server_id: Uuid) -> Self {
        Self {
            broker,
            server_id,
            key_prefix: config.redis_key_prefix.clone(),
            pongs: Mutex::new(HashSet::new()),
        }
    }

    /// The underlying broker handle, shared with the snapshot store for
    /// key-value persistence.
    #[must_use]
    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    fn channel(&self, kind: &str) -> String {
        format!("{}{kind}", self.key_prefix)
    }

    fn kind<'a>(&self, channel: &'a str) -> &'a str {
        channel.strip_prefix(&self.key_prefix).unwrap_or(channel)
    }

    // -------------------------------------------------------------------------
    // Publishing
    // -------------------------------------------------------------------------

    async fn publish_frame(
        &self,
        kind: &str,
        client: Option<&Client>,
        body: serde_json::Value,
    ) -> Result<(), BrokerError> {
        let frame = PeerFrame {
            server: DistServer { id: self.server_id },
            client: client.cloned(),
            body,
        };
        let payload = serde_json::to_string(&frame).map_err(|e| BrokerError::Encode(e.to_string()))?;
        self.broker.publish(&self.channel(kind), payload).await
    }

    /// Demand the roster: every peer answers with a `provide`.
    pub async fn publish_collect(&self) -> Result<(), BrokerError> {
        self.publish_frame("collect", None, serde_json::json!({ "target": "clients" }))
            .await
    }

    /// Announce the authoritative list of locally hosted clients.
    pub async fn publish_provide(&self, clients: &[Client]) -> Result<(), BrokerError> {
        self.publish_frame(
            "provide",
            None,
            serde_json::json!({ "target": "clients", "body": clients }),
        )
        .await
    }

    pub async fn publish_ping(&self) -> Result<(), BrokerError> {
        self.publish_frame("ping", None, serde_json::json!({})).await
    }

    pub async fn publish_pong(&self) -> Result<(), BrokerError> {
        self.publish_frame("pong", None, serde_json::json!({})).await
    }

    pub async fn publish_system(&self, message: &str) -> Result<(), BrokerError> {
        self.publish_frame("system", None, serde_json::json!({ "body": message }))
            .await
    }

    pub async fn publish_chat(&self, client: &Client, body: &ChatBody) -> Result<(), BrokerError> {
        let body = serde_json::to_value(body).map_err(|e| BrokerError::Encode(e.to_string()))?;
        self.publish_frame("chat", Some(client), body).await
    }

    pub async fn publish_paint(&self, client: &Client, body: &PaintBody) -> Result<(), BrokerError> {
        let body = serde_json::to_value(body).map_err(|e| BrokerError::Encode(e.to_string()))?;
        self.publish_frame("paint", Some(client), body).await
    }

    pub async fn publish_stroke(&self, client: &Client, body: &StrokeBody) -> Result<(), BrokerError> {
        let body = serde_json::to_value(body).map_err(|e| BrokerError::Encode(e.to_string()))?;
        self.publish_frame("stroke", Some(client), body).await
    }

    pub async fn publish_pointer(&self, client: &Client, body: &PointerBody) -> Result<(), BrokerError> {
        let body = serde_json::to_value(body).map_err(|e| BrokerError::Encode(e.to_string()))?;
        self.publish_frame("pointer", Some(client), body).await
    }

    // -------------------------------------------------------------------------
    // Receiving
    // -------------------------------------------------------------------------

    /// Subscribe and process inter-server frames until the broker stream
    /// ends. Spawns the presence bootstrap and the liveness loop.
    pub async fn run(self: Arc<Self>, state: AppState) {
        let channels = CHANNELS.iter().map(|kind| self.channel(kind)).collect();
        let mut rx = match self.broker.subscribe(channels).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "broker subscribe failed; continuing single-host");
                return;
            }
        };

        // Presence bootstrap after the settling delay.
        let peer = Arc::clone(&self);
        tokio::spawn(async move {
            tokio::time::sleep(SETTLE_DELAY).await;
            if let Err(e) = peer.publish_collect().await {
                warn!(error = %e, "collect publish failed");
            }
        });

        // Liveness loop.
        let peer = Arc::clone(&self);
        let liveness_state = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(PING_INTERVAL).await;
                peer.liveness_cycle(&liveness_state, PONG_WINDOW).await;
            }
        });

        info!(server_id = %self.server_id, "broker peer running");
        while let Some(msg) = rx.recv().await {
            self.dispatch(&state, &msg).await;
        }
        warn!("broker subscription ended");
    }

    /// One ping/pong round: probe, wait out the window, prune every
    /// remote server that stayed silent.
    pub(crate) async fn liveness_cycle(&self, state: &AppState, window: Duration) {
        let remotes = state
            .room
            .read()
            .await
            .roster
            .remote_server_ids(self.server_id);
        if remotes.is_empty() {
            return;
        }

        self.pongs.lock().unwrap().clear();
        if let Err(e) = self.publish_ping().await {
            warn!(error = %e, "ping publish failed");
            return;
        }
        tokio::time::sleep(window).await;

        let heard = self.pongs.lock().unwrap().clone();
        let dead: Vec<Uuid> = remotes.into_iter().filter(|id| !heard.contains(id)).collect();
        if dead.is_empty() {
            return;
        }

        warn!(count = dead.len(), "remote servers unresponsive; pruning their clients");
        state.room.write().await.roster.prune_dead_servers(&dead);
        engine::broadcast_roster(state).await;
    }

    /// Decode one frame and apply it. Loopback frames and undecodable
    /// payloads are dropped.
    async fn dispatch(&self, state: &AppState, msg: &ChannelMessage) {
        let Ok(frame) = serde_json::from_str::<PeerFrame>(&msg.payload) else {
            debug!(channel = %msg.channel, "undecodable broker frame");
            return;
        };
        if frame.server.id == self.server_id {
            return;
        }

        match self.kind(&msg.channel) {
            "collect" => {
                let clients = state
                    .room
                    .read()
                    .await
                    .roster
                    .local_clients(self.server_id);
                if let Err(e) = self.publish_provide(&clients).await {
                    warn!(error = %e, "provide publish failed");
                }
            }
            "provide" => {
                let list = frame.body.get("body").cloned().unwrap_or_default();
                let Ok(clients) = serde_json::from_value::<Vec<Client>>(list) else {
                    debug!("malformed provide body");
                    return;
                };
                state
                    .room
                    .write()
                    .await
                    .roster
                    .reconcile(frame.server.id, clients);
                engine::broadcast_roster(state).await;
            }
            "ping" => {
                if let Err(e) = self.publish_pong().await {
                    warn!(error = %e, "pong publish failed");
                }
            }
            "pong" => {
                self.pongs.lock().unwrap().insert(frame.server.id);
            }
            "system" => {
                let Some(message) = frame.body.get("body").and_then(|v| v.as_str()) else {
                    return;
                };
                engine::handle_chat(
                    state,
                    Origin::Remote,
                    None,
                    ValidChat { message: message.to_string(), time: None },
                )
                .await;
            }
            "chat" => {
                let Some(client) = frame.client.as_ref() else {
                    return;
                };
                let Ok(body) = serde_json::from_value::<ChatBody>(frame.body.clone()) else {
                    return;
                };
                engine::handle_chat(
                    state,
                    Origin::Remote,
                    Some(client),
                    ValidChat { message: body.message, time: Some(body.time) },
                )
                .await;
            }
            "paint" => {
                let Some(client) = frame.client.as_ref() else {
                    return;
                };
                let Ok(body) = serde_json::from_value::<PaintBody>(frame.body.clone()) else {
                    return;
                };
                // A replicated patch revalidates exactly like a local one.
                let Some(valid) = body.validate(state.config.layer_count) else {
                    debug!("replicated paint failed validation");
                    return;
                };
                engine::handle_paint(state, Origin::Remote, client, valid).await;
            }
            "stroke" => {
                let Some(client) = frame.client.as_ref() else {
                    return;
                };
                let Ok(body) = serde_json::from_value::<StrokeBody>(frame.body.clone()) else {
                    return;
                };
                engine::handle_stroke(state, Origin::Remote, client, body).await;
            }
            "pointer" => {
                let Some(client) = frame.client.as_ref() else {
                    return;
                };
                let Ok(body) = serde_json::from_value::<PointerBody>(frame.body.clone()) else {
                    return;
                };
                engine::handle_pointer(state, Origin::Remote, client, body).await;
            }
            other => debug!(channel = other, "frame on unknown channel"),
        }
    }
}

#[cfg(test)]
#[path = "broker_test.rs"]
mod tests;
