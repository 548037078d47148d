//! Agent Connection Router (C4): inbound socket server for remote agents,
//! request/response correlation, and cross-replica routing.
//!
//! An adapter owns an `axum::Router` whose routes close over `Arc`-cloned
//! shared state, and the server itself is `axum::serve` over a
//! `tokio::net::TcpListener`, with a single `GET /agent/:token` websocket
//! upgrade.

use crate::arena::bus::{keys, ttl, EventBus};
use crate::arena::persistence::PersistenceGateway;
use crate::arena::protocol::{close_code, AgentClientMessage, AgentServerMessage};
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum RouterError {
    InvalidToken,
    NotConnected,
    Timeout,
    InvalidResponse(String),
    Bus(String),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::InvalidToken => write!(f, "invalid or unknown agent token"),
            RouterError::NotConnected => write!(f, "agent not connected"),
            RouterError::Timeout => write!(f, "agent request timed out"),
            RouterError::InvalidResponse(msg) => write!(f, "invalid agent response: {}", msg),
            RouterError::Bus(msg) => write!(f, "event bus error: {}", msg),
        }
    }
}

impl Error for RouterError {}

/// A validated `debate_response` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedAgentResponse {
    pub message: String,
    pub confidence: Option<f32>,
}

const MAX_RESPONSE_CHARS: usize = 8000;

fn validate_response(message: &str, confidence: Option<f32>) -> Result<ValidatedAgentResponse, RouterError> {
    if message.trim().is_empty() {
        return Err(RouterError::InvalidResponse("empty message".to_string()));
    }
    if message.chars().count() > MAX_RESPONSE_CHARS {
        return Err(RouterError::InvalidResponse("message too long".to_string()));
    }
    if let Some(c) = confidence {
        if !(0.0..=1.0).contains(&c) {
            return Err(RouterError::InvalidResponse("confidence out of [0,1]".to_string()));
        }
    }
    Ok(ValidatedAgentResponse {
        message: message.to_string(),
        confidence,
    })
}

type PendingResult = Result<ValidatedAgentResponse, RouterError>;

struct LocalAgentHandle {
    outbox: mpsc::UnboundedSender<AgentServerMessage>,
    last_pong: Instant,
}

/// Envelope carried on `inbox:replica:{owner}` when the originating replica
/// does not locally host the target agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CrossReplicaRequest {
    request_id: String,
    agent_id: String,
    request: AgentServerMessage,
}

/// Commands forwarded from the agent socket's `queue_join`/`queue_leave`
/// messages to whatever owns matchmaking. The router itself does not
/// implement matchmaking — it only relays.
#[derive(Debug, Clone)]
pub enum QueueCommand {
    Join { agent_id: String, stake: u64, preset_id: String },
    Leave { agent_id: String },
}

/// Inbound socket server for agents.
pub struct AgentRouter {
    persistence: Arc<dyn PersistenceGateway>,
    bus: Arc<dyn EventBus>,
    replica_id: String,
    local_agents: RwLock<HashMap<String, LocalAgentHandle>>,
    pending: RwLock<HashMap<String, oneshot::Sender<PendingResult>>>,
    queue_commands: mpsc::UnboundedSender<QueueCommand>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl AgentRouter {
    pub fn new(
        persistence: Arc<dyn PersistenceGateway>,
        bus: Arc<dyn EventBus>,
        replica_id: impl Into<String>,
        queue_commands: mpsc::UnboundedSender<QueueCommand>,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            persistence,
            bus,
            replica_id: replica_id.into(),
            local_agents: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            queue_commands,
            shutdown: Arc::new(tokio::sync::Notify::new()),
        });
        tokio::spawn(router.clone().run_inbox_listener());
        router
    }

    /// Stop accepting agent traffic: every open connection's read loop
    /// and the liveness loop wake up and return on their next select.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Build the axum router exposing `GET /agent/{token}`.
    pub fn axum_router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/agent/{token}", get(upgrade_handler))
            .with_state(self)
    }

    async fn handle_connection(self: Arc<Self>, token: String, socket: WebSocket) {
        if token.len() != 64 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
            close_with(socket, close_code::INVALID_URL, "invalid token format").await;
            return;
        }

        let agent = match self.persistence.find_agent_by_token(&token).await {
            Ok(Some(agent)) => agent,
            _ => {
                close_with(socket, close_code::INVALID_TOKEN, "unknown token").await;
                return;
            }
        };

        if let Some(existing) = self.local_agents.write().await.remove(&agent.id) {
            let _ = existing.outbox; // dropping the sender ends the writer task
            log::info!("router: replacing existing connection for agent {}", agent.id);
        }

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<AgentServerMessage>();
        let (mut ws_tx, mut ws_rx) = socket.split();

        self.local_agents.write().await.insert(
            agent.id.clone(),
            LocalAgentHandle {
                outbox: outbox_tx.clone(),
                last_pong: Instant::now(),
            },
        );
        self.bus
            .kv_set(&keys::agent_connected(&agent.id), self.replica_id.clone(), ttl::AGENT_CONNECTED)
            .await;
        log::info!("router: agent {} connected on replica {}", agent.id, self.replica_id);

        let _ = outbox_tx.send(AgentServerMessage::Connected {
            bot_id: agent.id.clone(),
            bot_name: agent.display_name.clone(),
        });

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbox_rx.recv().await {
                let text = serde_json::to_string(&msg).unwrap_or_default();
                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let msg = tokio::select! {
                msg = ws_rx.next() => match msg {
                    Some(Ok(msg)) => msg,
                    _ => break,
                },
                _ = self.shutdown.notified() => break,
            };
            let WsMessage::Text(text) = msg else { continue };
            match serde_json::from_str::<AgentClientMessage>(&text) {
                Ok(AgentClientMessage::Pong) => {
                    if let Some(handle) = self.local_agents.write().await.get_mut(&agent.id) {
                        handle.last_pong = Instant::now();
                    }
                    self.bus
                        .kv_set(&keys::agent_connected(&agent.id), self.replica_id.clone(), ttl::AGENT_CONNECTED)
                        .await;
                }
                Ok(AgentClientMessage::DebateResponse {
                    request_id,
                    message,
                    confidence,
                }) => {
                    self.resolve_response(&request_id, validate_response(&message, confidence)).await;
                }
                Ok(AgentClientMessage::ResponseChunk { .. }) => {
                    // Reserved for future streaming support; accepted but not acted on.
                }
                Ok(AgentClientMessage::QueueJoin { stake, preset_id }) => {
                    let _ = self.queue_commands.send(QueueCommand::Join {
                        agent_id: agent.id.clone(),
                        stake,
                        preset_id,
                    });
                }
                Ok(AgentClientMessage::QueueLeave) => {
                    let _ = self.queue_commands.send(QueueCommand::Leave { agent_id: agent.id.clone() });
                }
                Err(e) => {
                    log::warn!("router: malformed message from agent {}: {}", agent.id, e);
                }
            }
        }

        writer.abort();
        self.local_agents.write().await.remove(&agent.id);
        self.bus.kv_delete(&keys::agent_connected(&agent.id)).await;
        log::info!("router: agent {} disconnected", agent.id);
    }

    /// Resolve a response: if a locally-originated request is awaiting it,
    /// fulfil that oneshot; otherwise this response belongs to a
    /// cross-replica request with no local pending entry, so it is
    /// republished on `channel:agent_response:{request_id}` instead.
    async fn resolve_response(&self, request_id: &str, result: PendingResult) {
        if let Some(tx) = self.pending.write().await.remove(request_id) {
            let _ = tx.send(result);
            return;
        }
        let payload = match &result {
            Ok(r) => serde_json::json!({"ok": true, "message": r.message, "confidence": r.confidence}),
            Err(e) => serde_json::json!({"ok": false, "error": e.to_string()}),
        };
        self.bus.publish(&keys::agent_response_channel(request_id), payload).await;
    }

    /// The public entry point: obtain a response from `agent_id`, routing
    /// across replicas via the bus if necessary.
    pub async fn send_request(
        &self,
        agent_id: &str,
        request: AgentServerMessage,
        timeout: Duration,
    ) -> Result<ValidatedAgentResponse, RouterError> {
        let request_id = Uuid::new_v4().to_string();
        let request = with_request_id(request, &request_id);

        if self.local_agents.read().await.contains_key(agent_id) {
            return self.send_local(agent_id, &request_id, request, timeout).await;
        }

        let owner = self.bus.kv_get(&keys::agent_connected(agent_id)).await;
        let Some(owner) = owner else {
            return Err(RouterError::NotConnected);
        };

        let mut response_rx = self.bus.subscribe(&keys::agent_response_channel(&request_id)).await;
        self.bus
            .publish(
                &keys::replica_inbox(&owner),
                serde_json::to_value(CrossReplicaRequest {
                    request_id: request_id.clone(),
                    agent_id: agent_id.to_string(),
                    request,
                })
                .map_err(|e| RouterError::Bus(e.to_string()))?,
            )
            .await;

        let wait = tokio::time::timeout(timeout, response_rx.recv()).await;
        match wait {
            Ok(Ok(msg)) => parse_remote_response(&msg.payload),
            Ok(Err(_)) | Err(_) => Err(RouterError::Timeout),
        }
    }

    async fn send_local(
        &self,
        agent_id: &str,
        request_id: &str,
        request: AgentServerMessage,
        timeout: Duration,
    ) -> Result<ValidatedAgentResponse, RouterError> {
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(request_id.to_string(), tx);

        let sent = {
            let agents = self.local_agents.read().await;
            agents.get(agent_id).map(|h| h.outbox.send(request))
        };
        if sent.is_none() || sent.unwrap().is_err() {
            self.pending.write().await.remove(request_id);
            return Err(RouterError::NotConnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => {
                self.pending.write().await.remove(request_id);
                Err(RouterError::Timeout)
            }
        }
    }

    /// Background task: deliver requests forwarded from other replicas to a
    /// locally-connected agent.
    async fn run_inbox_listener(self: Arc<Self>) {
        let mut rx = self.bus.subscribe(&keys::replica_inbox(&self.replica_id)).await;
        while let Ok(msg) = rx.recv().await {
            let Ok(envelope) = serde_json::from_value::<CrossReplicaRequest>(msg.payload) else {
                continue;
            };
            let agents = self.local_agents.read().await;
            if let Some(handle) = agents.get(&envelope.agent_id) {
                let _ = handle.outbox.send(envelope.request);
            }
            // If the agent is not (or no longer) local, the origin replica's
            // await simply times out.
        }
    }

    /// Every 30s, ping local agents and evict any whose socket is closed.
    pub async fn run_liveness_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.notified() => return,
            }
            let dead: Vec<String> = {
                let agents = self.local_agents.read().await;
                agents
                    .iter()
                    .filter_map(|(id, handle)| {
                        if handle.outbox.send(AgentServerMessage::Ping).is_err() {
                            Some(id.clone())
                        } else {
                            None
                        }
                    })
                    .collect()
            };
            for id in dead {
                self.local_agents.write().await.remove(&id);
                self.bus.kv_delete(&keys::agent_connected(&id)).await;
                log::info!("router: evicted unresponsive agent {}", id);
            }
        }
    }

    /// Fire-and-forget notification on contest completion. Best-effort:
    /// silently drops if the agent isn't locally connected.
    pub async fn notify_complete(&self, agent_id: &str, debate_id: String, won: Option<bool>, elo_change: i64) {
        if let Some(handle) = self.local_agents.read().await.get(agent_id) {
            let _ = handle.outbox.send(AgentServerMessage::DebateComplete {
                debate_id,
                won,
                elo_change,
            });
        }
    }

    /// Acknowledge a `queue_join` once the matchmaker has accepted the
    /// entry. Best-effort, same as [`AgentRouter::notify_complete`].
    pub async fn notify_queue_joined(&self, agent_id: &str, queue_ids: Vec<String>, stake: u64, preset_ids: Vec<String>) {
        if let Some(handle) = self.local_agents.read().await.get(agent_id) {
            let _ = handle.outbox.send(AgentServerMessage::QueueJoined { queue_ids, stake, preset_ids });
        }
    }

    /// Acknowledge a `queue_leave`.
    pub async fn notify_queue_left(&self, agent_id: &str) {
        if let Some(handle) = self.local_agents.read().await.get(agent_id) {
            let _ = handle.outbox.send(AgentServerMessage::QueueLeft);
        }
    }

    /// Report a matchmaking-side rejection of a `queue_join` (e.g. unknown
    /// or inactive agent).
    pub async fn notify_queue_error(&self, agent_id: &str, error: String) {
        if let Some(handle) = self.local_agents.read().await.get(agent_id) {
            let _ = handle.outbox.send(AgentServerMessage::QueueError { error });
        }
    }

    pub fn is_connected_locally(&self, agent_id: &str) -> bool {
        self.local_agents.try_read().map(|agents| agents.contains_key(agent_id)).unwrap_or(false)
    }
}

fn with_request_id(request: AgentServerMessage, request_id: &str) -> AgentServerMessage {
    match request {
        AgentServerMessage::DebateRequest { .. } => {
            let AgentServerMessage::DebateRequest {
                debate_id,
                round,
                topic,
                position,
                opponent_last_message,
                time_limit_seconds,
                word_limit,
                char_limit,
                messages_so_far,
                ..
            } = request
            else {
                unreachable!()
            };
            AgentServerMessage::DebateRequest {
                request_id: request_id.to_string(),
                debate_id,
                round,
                topic,
                position,
                opponent_last_message,
                time_limit_seconds,
                word_limit,
                char_limit,
                messages_so_far,
            }
        }
        other => other,
    }
}

fn parse_remote_response(payload: &serde_json::Value) -> Result<ValidatedAgentResponse, RouterError> {
    if payload.get("ok").and_then(|v| v.as_bool()) == Some(true) {
        let message = payload.get("message").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let confidence = payload.get("confidence").and_then(|v| v.as_f64()).map(|f| f as f32);
        validate_response(&message, confidence)
    } else {
        let reason = payload.get("error").and_then(|v| v.as_str()).unwrap_or("remote error");
        Err(RouterError::InvalidResponse(reason.to_string()))
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn upgrade_handler(
    State(router): State<Arc<AgentRouter>>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| router.handle_connection(token, socket))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_response_rejects_empty_and_out_of_range_confidence() {
        assert!(validate_response("", None).is_err());
        assert!(validate_response("hi", Some(1.5)).is_err());
        assert!(validate_response("hi", Some(-0.1)).is_err());
        assert!(validate_response("hi", Some(0.9)).is_ok());
    }

    #[test]
    fn validate_response_rejects_overlong_message() {
        let long = "a".repeat(MAX_RESPONSE_CHARS + 1);
        assert!(validate_response(&long, None).is_err());
    }

    /// An agent connected to one replica answers a request issued by the
    /// orchestrator on another replica, round-tripping through
    /// `inbox:replica:{owner}` and `channel:agent_response:{id}`.
    #[tokio::test]
    async fn cross_replica_request_round_trips_through_the_bus() {
        use crate::arena::bus::InProcessEventBus;
        use crate::arena::model::Side;
        use crate::arena::persistence::InMemoryPersistence;
        use crate::arena::protocol::{CharLimit, WordLimit};

        let persistence = InMemoryPersistence::shared();
        let bus = InProcessEventBus::shared();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let r1 = AgentRouter::new(persistence.clone(), bus.clone(), "replica-1", tx1);
        let r2 = AgentRouter::new(persistence, bus.clone(), "replica-2", tx2);

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<AgentServerMessage>();
        r1.local_agents.write().await.insert(
            "agent-a".to_string(),
            LocalAgentHandle {
                outbox: outbox_tx,
                last_pong: Instant::now(),
            },
        );
        bus.kv_set(&keys::agent_connected("agent-a"), "replica-1".to_string(), ttl::AGENT_CONNECTED)
            .await;

        let responder = {
            let r1 = r1.clone();
            tokio::spawn(async move {
                let request = outbox_rx.recv().await.expect("request forwarded to the connected replica");
                let request_id = match &request {
                    AgentServerMessage::DebateRequest { request_id, .. } => request_id.clone(),
                    other => panic!("unexpected request: {:?}", other),
                };
                r1.resolve_response(
                    &request_id,
                    Ok(ValidatedAgentResponse {
                        message: "my argument".to_string(),
                        confidence: Some(0.8),
                    }),
                )
                .await;
            })
        };

        let request = AgentServerMessage::DebateRequest {
            request_id: String::new(),
            debate_id: "c1".into(),
            round: "Opening".into(),
            topic: "t".into(),
            position: Side::Pro,
            opponent_last_message: None,
            time_limit_seconds: 5,
            word_limit: WordLimit { min: 0, max: 100 },
            char_limit: CharLimit { min: 0, max: 500 },
            messages_so_far: vec![],
        };
        let response = r2
            .send_request("agent-a", request, Duration::from_secs(5))
            .await
            .expect("cross-replica response arrives within the timeout");
        assert_eq!(response.message, "my argument");
        responder.await.unwrap();
    }
}
