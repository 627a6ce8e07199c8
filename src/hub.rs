//! C7 — the pub/sub hub: a channel/topic registry with non-blocking
//! delivery and heartbeat/reap. A parking_lot-guarded client registry with
//! heartbeat/staleness bookkeeping and a bounded `tokio::sync::mpsc`
//! channel per client, addressed through a tagged JSON wire protocol.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{CombinedAnalysis, TokenAddress};

const FIXED_CHANNELS: [&str; 5] = ["tokens", "alerts", "filters", "market", "signals"];

fn is_valid_channel(name: &str) -> bool {
    if FIXED_CHANNELS.contains(&name) {
        return true;
    }
    for prefix in ["token:", "filter:", "user:"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            return !rest.is_empty();
        }
    }
    false
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        channels: Vec<String>,
        #[serde(default)]
        filters: Option<serde_json::Value>,
    },
    Unsubscribe {
        channels: Vec<String>,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub client_id: String,
    pub available_channels: Vec<String>,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckPayload {
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub severity: String,
    pub message: String,
    pub address: Option<TokenAddress>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "welcome")]
    Welcome {
        payload: WelcomePayload,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "subscription_ack")]
    SubscriptionAck {
        payload: AckPayload,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "unsubscription_ack")]
    UnsubscriptionAck {
        payload: AckPayload,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "pong")]
    Pong { timestamp: DateTime<Utc> },
    #[serde(rename = "ping")]
    Ping { timestamp: DateTime<Utc> },
    #[serde(rename = "error")]
    Error { payload: ErrorPayload },
    #[serde(rename = "TOKEN_UPDATE")]
    TokenUpdate {
        payload: Box<CombinedAnalysis>,
        timestamp: DateTime<Utc>,
        channel: String,
    },
    #[serde(rename = "ALERT")]
    Alert {
        payload: AlertPayload,
        timestamp: DateTime<Utc>,
        channel: String,
    },
    #[serde(rename = "FILTER_RESULT")]
    FilterResult {
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
        channel: String,
    },
    #[serde(rename = "PRICE_UPDATE")]
    PriceUpdate {
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
        channel: String,
    },
}

struct ClientHandle {
    sender: mpsc::Sender<ServerMessage>,
    channels: Mutex<HashSet<String>>,
    last_seen: Mutex<Instant>,
}

pub struct Hub {
    clients: RwLock<HashMap<String, Arc<ClientHandle>>>,
    channel_index: RwLock<HashMap<String, HashSet<String>>>,
    buffer_capacity: usize,
    heartbeat_interval: Duration,
    connection_timeout: Duration,
    reap_task: Mutex<Option<JoinHandle<()>>>,
    /// Invoked once per connected client per heartbeat tick so the
    /// transport layer (owned by the caller, e.g. an axum WS handler) can
    /// emit a protocol-level ping. The hub itself never touches a socket.
    ping_hook: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl Hub {
    pub fn new(
        buffer_capacity: usize,
        heartbeat_interval: Duration,
        connection_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            channel_index: RwLock::new(HashMap::new()),
            buffer_capacity,
            heartbeat_interval,
            connection_timeout,
            reap_task: Mutex::new(None),
            ping_hook: None,
        })
    }

    pub fn with_ping_hook(mut self: Arc<Self>, hook: Arc<dyn Fn(&str) + Send + Sync>) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("ping hook must be set before the hub is shared")
            .ping_hook = Some(hook);
        self
    }

    pub fn start(self: &Arc<Self>) {
        let mut task = self.reap_task.lock();
        if task.is_some() {
            return;
        }
        let this = self.clone();
        *task = Some(tokio::spawn(async move { this.heartbeat_loop().await }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.reap_task.lock().take() {
            handle.abort();
        }
    }

    /// Registers a new client and returns its id plus the receiving half
    /// of its outgoing buffer. The caller (transport layer) is responsible
    /// for draining the receiver and writing frames to the socket.
    pub fn on_connect(&self) -> (String, mpsc::Receiver<ServerMessage>) {
        let client_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.buffer_capacity);
        let handle = Arc::new(ClientHandle {
            sender: tx,
            channels: Mutex::new(HashSet::new()),
            last_seen: Mutex::new(Instant::now()),
        });
        self.clients.write().insert(client_id.clone(), handle);

        let welcome = ServerMessage::Welcome {
            payload: WelcomePayload {
                client_id: client_id.clone(),
                available_channels: FIXED_CHANNELS.iter().map(|s| s.to_string()).collect(),
                server_time: Utc::now(),
            },
            timestamp: Utc::now(),
        };
        self.send_to(&client_id, welcome);
        (client_id, rx)
    }

    pub fn subscribe(&self, client_id: &str, channels: Vec<String>) {
        self.touch(client_id);
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for channel in channels {
            if is_valid_channel(&channel) {
                accepted.push(channel);
            } else {
                rejected.push(channel);
            }
        }

        if let Some(client) = self.clients.read().get(client_id).cloned() {
            {
                let mut client_channels = client.channels.lock();
                let mut index = self.channel_index.write();
                for channel in &accepted {
                    client_channels.insert(channel.clone());
                    index.entry(channel.clone()).or_default().insert(client_id.to_string());
                }
            }
            if !rejected.is_empty() {
                self.send_to(
                    client_id,
                    ServerMessage::Error {
                        payload: ErrorPayload {
                            message: format!("invalid channel(s): {}", rejected.join(", ")),
                            timestamp: Utc::now(),
                        },
                    },
                );
            }
            if !accepted.is_empty() {
                self.send_to(
                    client_id,
                    ServerMessage::SubscriptionAck {
                        payload: AckPayload { channels: accepted },
                        timestamp: Utc::now(),
                    },
                );
            }
        }
    }

    pub fn unsubscribe(&self, client_id: &str, channels: Vec<String>) {
        self.touch(client_id);
        if let Some(client) = self.clients.read().get(client_id).cloned() {
            {
                let mut client_channels = client.channels.lock();
                let mut index = self.channel_index.write();
                for channel in &channels {
                    client_channels.remove(channel);
                    if let Some(subscribers) = index.get_mut(channel) {
                        subscribers.remove(client_id);
                    }
                }
            }
            self.send_to(
                client_id,
                ServerMessage::UnsubscriptionAck {
                    payload: AckPayload { channels },
                    timestamp: Utc::now(),
                },
            );
        }
    }

    pub fn ping(&self, client_id: &str) {
        self.touch(client_id);
        self.send_to(client_id, ServerMessage::Pong { timestamp: Utc::now() });
    }

    /// Server-initiated keepalive, invoked from `heartbeat_tick` via the
    /// registered ping hook. Unlike `ping`, this does not touch the
    /// client's liveness deadline — only real client traffic (or a pong)
    /// should do that, or a dead connection would never be reaped.
    pub fn send_ping(&self, client_id: &str) {
        self.send_to(client_id, ServerMessage::Ping { timestamp: Utc::now() });
    }

    /// Any observed traffic from a client (a received message, or a
    /// transport-level pong) refreshes its liveness deadline.
    pub fn touch(&self, client_id: &str) {
        if let Some(client) = self.clients.read().get(client_id) {
            *client.last_seen.lock() = Instant::now();
        }
    }

    pub fn disconnect(&self, client_id: &str) {
        self.evict(client_id);
    }

    pub fn publish_token_update(&self, analysis: &CombinedAnalysis) {
        let timestamp = Utc::now();
        let payload = Box::new(analysis.clone());
        self.broadcast(
            "tokens",
            ServerMessage::TokenUpdate {
                payload: payload.clone(),
                timestamp,
                channel: "tokens".to_string(),
            },
        );
        let per_token = format!("token:{}", analysis.address.as_str());
        self.broadcast(
            &per_token,
            ServerMessage::TokenUpdate {
                payload,
                timestamp,
                channel: per_token.clone(),
            },
        );
    }

    pub fn publish_alert(&self, alert: AlertPayload) {
        self.broadcast(
            "alerts",
            ServerMessage::Alert {
                payload: alert,
                timestamp: Utc::now(),
                channel: "alerts".to_string(),
            },
        );
    }

    pub fn publish_filter_results(&self, filter_id: &str, payload: serde_json::Value) {
        let channel = format!("filter:{filter_id}");
        self.broadcast(
            &channel,
            ServerMessage::FilterResult {
                payload,
                timestamp: Utc::now(),
                channel: channel.clone(),
            },
        );
    }

    pub fn publish_market(&self, payload: serde_json::Value) {
        self.broadcast(
            "market",
            ServerMessage::PriceUpdate {
                payload,
                timestamp: Utc::now(),
                channel: "market".to_string(),
            },
        );
    }

    fn broadcast(&self, channel: &str, message: ServerMessage) {
        let subscribers: Vec<String> = self
            .channel_index
            .read()
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for client_id in subscribers {
            self.send_to(&client_id, message.clone());
        }
    }

    /// Never blocks. A full buffer marks the client slow and evicts it
    /// immediately so the publisher is never held up by a dead consumer.
    fn send_to(&self, client_id: &str, message: ServerMessage) {
        let client = self.clients.read().get(client_id).cloned();
        let Some(client) = client else { return };
        match client.sender.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id, "outgoing buffer full; evicting slow consumer");
                self.evict(client_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.evict(client_id);
            }
        }
    }

    fn evict(&self, client_id: &str) {
        let client = self.clients.write().remove(client_id);
        if let Some(client) = client {
            let mut index = self.channel_index.write();
            for channel in client.channels.lock().iter() {
                if let Some(subscribers) = index.get_mut(channel) {
                    subscribers.remove(client_id);
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        loop {
            interval.tick().await;
            self.heartbeat_tick();
        }
    }

    fn heartbeat_tick(&self) {
        let now = Instant::now();
        let snapshot: Vec<(String, Instant)> = self
            .clients
            .read()
            .iter()
            .map(|(id, c)| (id.clone(), *c.last_seen.lock()))
            .collect();

        for (client_id, last_seen) in snapshot {
            if now.duration_since(last_seen) > self.connection_timeout {
                warn!(client_id, "no traffic within connection timeout; reaping");
                self.evict(&client_id);
            } else if let Some(hook) = &self.ping_hook {
                hook(&client_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ChainReport, CreatorInfo, FundingPattern, MarketSnapshot, RouterReport, SecurityReport,
    };

    fn sample_analysis(address: &str) -> CombinedAnalysis {
        let addr = TokenAddress::new(address).unwrap();
        CombinedAnalysis {
            address: addr.clone(),
            market: MarketSnapshot::skipped(&addr, "n/a"),
            security: SecurityReport::skipped(&addr, "n/a"),
            router: RouterReport::skipped(&addr, "n/a"),
            chain: ChainReport {
                address: addr.clone(),
                creator_wallet: String::new(),
                creator_info: CreatorInfo::default(),
                top_holders: Vec::new(),
                top_holders_percentage: 0.0,
                funding_pattern: FundingPattern::Organic,
                filtered: false,
                filter_reason: None,
            },
            overall_score: 80.0,
            passed: true,
            failed_filters: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn on_connect_sends_welcome() {
        let hub = Hub::new(16, Duration::from_secs(30), Duration::from_secs(60));
        let (_id, mut rx) = hub.on_connect();
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::Welcome { .. }));
    }

    #[tokio::test]
    async fn invalid_channel_is_rejected_valid_ones_acked() {
        let hub = Hub::new(16, Duration::from_secs(30), Duration::from_secs(60));
        let (id, mut rx) = hub.on_connect();
        let _welcome = rx.recv().await.unwrap();

        hub.subscribe(&id, vec!["tokens".to_string(), "nonsense".to_string()]);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let has_error = matches!(first, ServerMessage::Error { .. }) || matches!(second, ServerMessage::Error { .. });
        let has_ack = matches!(first, ServerMessage::SubscriptionAck { .. })
            || matches!(second, ServerMessage::SubscriptionAck { .. });
        assert!(has_error && has_ack);
    }

    #[tokio::test]
    async fn subscriber_receives_published_token_update() {
        let hub = Hub::new(16, Duration::from_secs(30), Duration::from_secs(60));
        let (id, mut rx) = hub.on_connect();
        let _welcome = rx.recv().await.unwrap();
        hub.subscribe(&id, vec!["tokens".to_string()]);
        let _ack = rx.recv().await.unwrap();

        hub.publish_token_update(&sample_analysis("0xabc"));
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::TokenUpdate { .. }));
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_without_blocking_others() {
        let hub = Hub::new(2, Duration::from_secs(30), Duration::from_secs(60));

        let (slow_id, mut slow_rx) = hub.on_connect();
        let _ = slow_rx.recv().await.unwrap();
        hub.subscribe(&slow_id, vec!["tokens".to_string()]);
        let _ = slow_rx.recv().await.unwrap();

        let (fast_id, mut fast_rx) = hub.on_connect();
        let _ = fast_rx.recv().await.unwrap();
        hub.subscribe(&fast_id, vec!["tokens".to_string()]);
        let _ = fast_rx.recv().await.unwrap();

        // The slow consumer never drains; the fast one drains after the fact.
        for i in 0..10 {
            hub.publish_token_update(&sample_analysis(&format!("0x{i}")));
        }

        assert!(!hub.clients.read().contains_key(&slow_id));
        assert!(hub.clients.read().contains_key(&fast_id));

        let mut received = 0;
        while let Ok(msg) = fast_rx.try_recv() {
            assert!(matches!(msg, ServerMessage::TokenUpdate { .. }));
            received += 1;
        }
        assert_eq!(received, 10);
    }

    #[test]
    fn channel_validation_accepts_fixed_and_patterned() {
        assert!(is_valid_channel("tokens"));
        assert!(is_valid_channel("token:0xabc"));
        assert!(is_valid_channel("filter:123"));
        assert!(is_valid_channel("user:42"));
        assert!(!is_valid_channel("token:"));
        assert!(!is_valid_channel("nonsense"));
    }
}
