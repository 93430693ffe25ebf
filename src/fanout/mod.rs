// =============================================================================
// C7 — Fanout Server
// =============================================================================
//
// Websocket server: each client holds its own subscription set (a subset of
// the instruments C5's SubscriptionRegistry tracks globally) and receives
// tick/candle frames for exactly what it asked for. A client whose outbound
// buffer grows past `ws_max_buffered_bytes` is a slow consumer and is
// evicted rather than allowed to apply backpressure to the whole fanout.
//
// The connection-lifecycle shape — `ws_handler` validating a token then
// upgrading, and a `tokio::select!` loop alternating push and recv — is
// generalized from the engine's own dashboard websocket handler; the
// behavior is rewritten from "push a full state snapshot on a timer" to
// "push exactly the frames this client subscribed to, as they occur,"
// per-client subscription sets instead of one global broadcast, plus
// slow-consumer eviction and a 20-second heartbeat.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::auth::validate_token;
use crate::market_data::candle::CandleEngine;
use crate::market_data::subscription::SubscriptionRegistry;
use crate::market_data::supervisor::MarketFeedSupervisor;
use crate::market_data::tick_bus::TickBus;
use crate::symbol;
use crate::types::{Candle, InstrumentKey, NormalizedTick};

const HEARTBEAT_INTERVAL_SECS: u64 = 20;
/// Close code 1008 — Policy Violation, per RFC 6455.
const CLOSE_CODE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    Subscribe { symbols: Vec<String> },
    Unsubscribe { symbols: Vec<String> },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    Connected {
        client_id: Uuid,
    },
    Tick {
        tick: &'a NormalizedTick,
    },
    Candle {
        candle: &'a Candle,
    },
    Subscribed {
        added: Vec<String>,
        rejected: Vec<String>,
        total: usize,
    },
    Unsubscribed {
        removed: Vec<String>,
        ignored: Vec<String>,
        total: usize,
    },
    Heartbeat {
        server_time_ms: i64,
    },
    Error {
        error: String,
    },
}

struct ClientHandle {
    id: Uuid,
    sender: mpsc::Sender<Vec<u8>>,
    subscriptions: RwLock<HashSet<InstrumentKey>>,
    buffered_bytes: AtomicUsize,
    max_buffered_bytes: usize,
}

impl ClientHandle {
    /// Attempt to enqueue a frame. Returns `false` if the client is over its
    /// buffer budget and should be evicted as a slow consumer.
    fn try_send(&self, payload: Vec<u8>) -> bool {
        let size = payload.len();
        if self.buffered_bytes.load(Ordering::Relaxed) + size > self.max_buffered_bytes {
            warn!(client = %self.id, "slow consumer — evicting");
            return false;
        }
        self.buffered_bytes.fetch_add(size, Ordering::Relaxed);
        match self.sender.try_send(payload) {
            Ok(()) => true,
            Err(_) => {
                self.buffered_bytes.fetch_sub(size, Ordering::Relaxed);
                false
            }
        }
    }

    fn on_flushed(&self, size: usize) {
        self.buffered_bytes.fetch_sub(size, Ordering::Relaxed);
    }
}

pub struct FanoutServer {
    clients: RwLock<std::collections::HashMap<Uuid, Arc<ClientHandle>>>,
    registry: Arc<SubscriptionRegistry>,
    supervisor: Arc<MarketFeedSupervisor>,
    candles: Arc<CandleEngine>,
    max_symbols_per_client: u32,
    max_buffered_bytes: usize,
    max_message_size_bytes: usize,
    auth_required: bool,
}

impl FanoutServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        supervisor: Arc<MarketFeedSupervisor>,
        candles: Arc<CandleEngine>,
        max_symbols_per_client: u32,
        max_buffered_bytes: usize,
        max_message_size_bytes: usize,
        auth_required: bool,
    ) -> Self {
        Self {
            clients: RwLock::new(std::collections::HashMap::new()),
            registry,
            supervisor,
            candles,
            max_symbols_per_client,
            max_buffered_bytes,
            max_message_size_bytes,
            auth_required,
        }
    }

    /// Register a handler on the tick bus that fans ticks out to every
    /// subscribed client.
    pub fn attach_to_tick_bus(self: &Arc<Self>, bus: &TickBus) {
        let server = Arc::clone(self);
        bus.register_handler(Arc::new(move |tick: NormalizedTick| {
            server.broadcast_tick(&tick);
        }));
    }

    fn broadcast_tick(self: &Arc<Self>, tick: &NormalizedTick) {
        let frame = ServerFrame::Tick { tick };
        let Ok(payload) = serde_json::to_vec(&frame) else {
            return;
        };
        self.broadcast_to_subscribers(&tick.key, payload);
    }

    pub fn broadcast_candle(self: &Arc<Self>, candle: &Candle) {
        let frame = ServerFrame::Candle { candle };
        let Ok(payload) = serde_json::to_vec(&frame) else {
            return;
        };
        self.broadcast_to_subscribers(&candle.key, payload);
    }

    fn broadcast_to_subscribers(self: &Arc<Self>, key: &InstrumentKey, payload: Vec<u8>) {
        let clients = self.clients.read();
        let mut evict = Vec::new();
        for (id, client) in clients.iter() {
            if client.subscriptions.read().contains(key) && !client.try_send(payload.clone()) {
                evict.push(*id);
            }
        }
        drop(clients);
        for id in evict {
            self.remove_client(&id);
        }
    }

    fn add_client(&self, handle: Arc<ClientHandle>) {
        self.clients.write().insert(handle.id, handle);
    }

    fn remove_client(self: &Arc<Self>, id: &Uuid) {
        if let Some(client) = self.clients.write().remove(id) {
            let keys: Vec<InstrumentKey> = client.subscriptions.read().iter().cloned().collect();
            let server = Arc::clone(self);
            tokio::spawn(async move {
                for key in keys {
                    if let Err(e) = server.supervisor.unsubscribe_key(&key).await {
                        warn!(key = %key, error = %e, "failed to unsubscribe upstream on client disconnect");
                    }
                }
            });
        }
    }

    pub fn connected_count(&self) -> usize {
        self.clients.read().len()
    }
}

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<FanoutServer>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if server.auth_required {
        let token = query.token.unwrap_or_default();
        if !validate_token(&token) {
            warn!("fanout connection rejected: invalid token");
            return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token")
                .into_response();
        }
    }

    info!("fanout connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, server))
        .into_response()
}

async fn handle_connection(socket: WebSocket, server: Arc<FanoutServer>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);

    let handle = Arc::new(ClientHandle {
        id: Uuid::new_v4(),
        sender: tx,
        subscriptions: RwLock::new(HashSet::new()),
        buffered_bytes: AtomicUsize::new(0),
        max_buffered_bytes: server.max_buffered_bytes,
    });
    server.add_client(Arc::clone(&handle));
    info!(client = %handle.id, "fanout client connected");

    {
        let frame = ServerFrame::Connected { client_id: handle.id };
        if let Ok(payload) = serde_json::to_vec(&frame) {
            handle.try_send(payload);
        }
    }

    let mut heartbeat = interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let frame = ServerFrame::Heartbeat { server_time_ms: chrono::Utc::now().timestamp_millis() };
                if let Ok(payload) = serde_json::to_vec(&frame) {
                    if sink.send(Message::Text(String::from_utf8_lossy(&payload).into_owned().into())).await.is_err() {
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(payload) => {
                        let size = payload.len();
                        let text = String::from_utf8_lossy(&payload).into_owned();
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                        handle.on_flushed(size);
                    }
                    None => break,
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > server.max_message_size_bytes {
                            warn!(client = %handle.id, size = text.len(), "inbound frame exceeds max message size — closing");
                            let _ = sink.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                                code: CLOSE_CODE_POLICY_VIOLATION,
                                reason: "message too large".into(),
                            }))).await;
                            break;
                        }
                        handle_client_command(&server, &handle, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(client = %handle.id, error = %e, "fanout recv error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    server.remove_client(&handle.id);
    info!(client = %handle.id, "fanout client disconnected");
}

async fn handle_client_command(server: &Arc<FanoutServer>, handle: &Arc<ClientHandle>, text: &str) {
    let cmd = match serde_json::from_str::<ClientCommand>(text) {
        Ok(cmd) => cmd,
        Err(e) => {
            let frame = ServerFrame::Error { error: format!("invalid command: {e}") };
            if let Ok(payload) = serde_json::to_vec(&frame) {
                handle.try_send(payload);
            }
            return;
        }
    };

    match cmd {
        ClientCommand::Subscribe { symbols } => {
            let mut added = Vec::new();
            let mut rejected = Vec::new();
            for raw in symbols {
                let at_limit = handle.subscriptions.read().len() as u32 >= server.max_symbols_per_client;
                if at_limit {
                    warn!(client = %handle.id, "client hit max-symbols-per-client limit");
                    rejected.push(raw);
                    continue;
                }
                let Ok(key) = symbol::normalize(&raw) else {
                    rejected.push(raw);
                    continue;
                };
                let newly_local = handle.subscriptions.write().insert(key.clone());
                if !newly_local {
                    continue;
                }
                match server.supervisor.subscribe_key(&key).await {
                    Ok(_) => added.push(raw),
                    Err(e) => {
                        warn!(client = %handle.id, key = %key, error = %e, "upstream subscribe failed");
                        handle.subscriptions.write().remove(&key);
                        rejected.push(raw);
                    }
                }
            }
            let total = handle.subscriptions.read().len();
            let frame = ServerFrame::Subscribed { added, rejected, total };
            if let Ok(payload) = serde_json::to_vec(&frame) {
                handle.try_send(payload);
            }
        }
        ClientCommand::Unsubscribe { symbols } => {
            let mut removed = Vec::new();
            let mut ignored = Vec::new();
            for raw in symbols {
                let Ok(key) = symbol::normalize(&raw) else {
                    ignored.push(raw);
                    continue;
                };
                let was_local = handle.subscriptions.write().remove(&key);
                if !was_local {
                    ignored.push(raw);
                    continue;
                }
                if let Err(e) = server.supervisor.unsubscribe_key(&key).await {
                    warn!(client = %handle.id, key = %key, error = %e, "upstream unsubscribe failed");
                }
                removed.push(raw);
            }
            let total = handle.subscriptions.read().len();
            let frame = ServerFrame::Unsubscribed { removed, ignored, total };
            if let Ok(payload) = serde_json::to_vec(&frame) {
                handle.try_send(payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Segment;

    async fn make_server() -> Arc<FanoutServer> {
        let registry = Arc::new(SubscriptionRegistry::new());
        let broker: crate::market_data::broker::SharedBroker =
            Arc::new(crate::market_data::broker::SimulatedBroker::new());
        broker.connect().await.unwrap();
        let supervisor = Arc::new(MarketFeedSupervisor::new(
            broker,
            registry.clone(),
            Arc::new(TickBus::new()),
            1,
        ));
        Arc::new(FanoutServer::new(
            registry,
            supervisor,
            Arc::new(CandleEngine::new(10)),
            5,
            1024,
            65_536,
            false,
        ))
    }

    #[tokio::test]
    async fn client_over_symbol_limit_stops_subscribing() {
        let server = make_server().await;
        let (tx, _rx) = mpsc::channel(8);
        let handle = Arc::new(ClientHandle {
            id: Uuid::new_v4(),
            sender: tx,
            subscriptions: RwLock::new(HashSet::new()),
            buffered_bytes: AtomicUsize::new(0),
            max_buffered_bytes: 1024,
        });
        server.add_client(Arc::clone(&handle));

        let symbols: Vec<String> = (0..10).map(|i| format!("NSE_EQ|{i}")).collect();
        let cmd = serde_json::json!({"type": "subscribe", "symbols": symbols}).to_string();
        handle_client_command(&server, &handle, &cmd).await;

        assert_eq!(handle.subscriptions.read().len(), 5);
    }

    #[test]
    fn try_send_fails_over_budget() {
        let handle = ClientHandle {
            id: Uuid::new_v4(),
            sender: mpsc::channel(1).0,
            subscriptions: RwLock::new(HashSet::new()),
            buffered_bytes: AtomicUsize::new(0),
            max_buffered_bytes: 4,
        };
        assert!(!handle.try_send(vec![0u8; 10]));
    }

    #[tokio::test]
    async fn remove_client_releases_subscriptions() {
        let server = make_server().await;
        let key = InstrumentKey::new(Segment::NseEq, "1");
        let (tx, _rx) = mpsc::channel(8);
        let handle = Arc::new(ClientHandle {
            id: Uuid::new_v4(),
            sender: tx,
            subscriptions: RwLock::new(HashSet::new()),
            buffered_bytes: AtomicUsize::new(0),
            max_buffered_bytes: 1024,
        });
        handle.subscriptions.write().insert(key.clone());
        server.registry.subscribe(&key);
        server.add_client(Arc::clone(&handle));

        server.remove_client(&handle.id);
        // remove_client releases the upstream subscription on a spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!server.registry.is_active(&key));
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_replies_report_counts() {
        let server = make_server().await;
        let (tx, mut rx) = mpsc::channel(8);
        let handle = Arc::new(ClientHandle {
            id: Uuid::new_v4(),
            sender: tx,
            subscriptions: RwLock::new(HashSet::new()),
            buffered_bytes: AtomicUsize::new(0),
            max_buffered_bytes: 1024,
        });
        server.add_client(Arc::clone(&handle));

        let sub_cmd = serde_json::json!({"type": "subscribe", "symbols": ["NSE_EQ|1"]}).to_string();
        handle_client_command(&server, &handle, &sub_cmd).await;
        let reply: serde_json::Value =
            serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "subscribed");
        assert_eq!(reply["total"], 1);

        let unsub_cmd =
            serde_json::json!({"type": "unsubscribe", "symbols": ["NSE_EQ|1"]}).to_string();
        handle_client_command(&server, &handle, &unsub_cmd).await;
        let reply: serde_json::Value =
            serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["type"], "unsubscribed");
        assert_eq!(reply["total"], 0);
    }
}
