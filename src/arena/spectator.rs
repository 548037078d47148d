//! Spectator Broadcast Layer (C5): inbound socket server for viewers,
//! state replay, vote ingress, and fleet-wide spectator-count aggregation.
//!
//! Shares the adapter shape used by [`crate::arena::router`]: an
//! `axum::Router` whose single route upgrades to a websocket.

use crate::arena::bus::{keys, ttl, EventBus};
use crate::arena::error::{ClientErrorCode, VoteRejectionReason};
use crate::arena::model::{Side, Turn};
use crate::arena::persistence::PersistenceGateway;
use crate::arena::protocol::{ErrorPayload, LifecycleEvent, SpectatorClientMessage, SpectatorServerMessage};
use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Where vote admission rules actually live (round status, round index,
/// duplicate detection) — the orchestrator. The spectator layer only
/// authenticates and relays.
#[async_trait]
pub trait VoteSink: Send + Sync {
    async fn submit_vote(
        &self,
        contest_id: &str,
        round_index: u32,
        voter_id: &str,
        choice: Side,
    ) -> Result<(), VoteRejectionReason>;
}

fn vote_rejection_code(reason: VoteRejectionReason) -> ClientErrorCode {
    match reason {
        VoteRejectionReason::NotFound => ClientErrorCode::InvalidDebateId,
        VoteRejectionReason::WrongRound => ClientErrorCode::InvalidVote,
        VoteRejectionReason::NotOpen | VoteRejectionReason::AlreadyVoted => ClientErrorCode::VoteFailed,
    }
}

struct ViewerHandle {
    outbox: mpsc::UnboundedSender<SpectatorServerMessage>,
    contest_id: Option<String>,
    voter_id: Option<String>,
}

struct ContestSubscription {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for ContestSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Inbound socket server for spectators.
pub struct SpectatorLayer {
    persistence: Arc<dyn PersistenceGateway>,
    bus: Arc<dyn EventBus>,
    vote_sink: Arc<dyn VoteSink>,
    replica_id: String,
    viewers: RwLock<HashMap<String, ViewerHandle>>,
    local_members: RwLock<HashMap<String, HashSet<String>>>,
    contest_subs: RwLock<HashMap<String, ContestSubscription>>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl SpectatorLayer {
    pub fn new(
        persistence: Arc<dyn PersistenceGateway>,
        bus: Arc<dyn EventBus>,
        vote_sink: Arc<dyn VoteSink>,
        replica_id: impl Into<String>,
    ) -> Arc<Self> {
        let layer = Arc::new(Self {
            persistence,
            bus,
            vote_sink,
            replica_id: replica_id.into(),
            viewers: RwLock::new(HashMap::new()),
            local_members: RwLock::new(HashMap::new()),
            contest_subs: RwLock::new(HashMap::new()),
            shutdown: Arc::new(tokio::sync::Notify::new()),
        });
        let register = layer.clone();
        tokio::spawn(async move { register.register_in_roster().await });
        layer
    }

    /// Stop accepting spectator traffic: every open connection's read
    /// loop wakes up and returns on its next select.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub fn axum_router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/spectator", get(upgrade_handler))
            .with_state(self)
    }

    async fn register_in_roster(&self) {
        let roster = self.bus.kv_get(&keys::replica_roster()).await.unwrap_or_default();
        let mut ids: HashSet<&str> = roster.split(',').filter(|s| !s.is_empty()).collect();
        ids.insert(&self.replica_id);
        let joined = ids.into_iter().collect::<Vec<_>>().join(",");
        // Best-effort, non-atomic read-modify-write: acceptable because the
        // roster only informs an advisory spectator count, never a
        // correctness invariant.
        self.bus.kv_set(&keys::replica_roster(), joined, ttl::SPECTATOR_COUNT * 60).await;
    }

    async fn total_spectators(&self, contest_id: &str) -> u32 {
        let roster = self.bus.kv_get(&keys::replica_roster()).await.unwrap_or_default();
        let mut total = 0u32;
        for replica in roster.split(',').filter(|s| !s.is_empty()) {
            if let Some(count) = self.bus.kv_get(&keys::spectators(contest_id, replica)).await {
                total += count.parse::<u32>().unwrap_or(0);
            }
        }
        total
    }

    async fn handle_connection(self: Arc<Self>, socket: WebSocket) {
        let viewer_id = Uuid::new_v4().to_string();
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<SpectatorServerMessage>();
        let (mut ws_tx, mut ws_rx) = socket.split();

        self.viewers.write().await.insert(
            viewer_id.clone(),
            ViewerHandle {
                outbox: outbox_tx.clone(),
                contest_id: None,
                voter_id: None,
            },
        );

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
            match serde_json::from_str::<SpectatorClientMessage>(&text) {
                Ok(SpectatorClientMessage::JoinDebate { debate_id, user_id }) => {
                    Arc::clone(&self).join_debate(&viewer_id, &debate_id, user_id).await;
                }
                Ok(SpectatorClientMessage::LeaveDebate) => {
                    self.detach(&viewer_id).await;
                }
                Ok(SpectatorClientMessage::SubmitVote {
                    debate_id,
                    round_index,
                    choice,
                }) => {
                    self.submit_vote(&viewer_id, &debate_id, round_index, choice).await;
                }
                Ok(SpectatorClientMessage::Ping) => {
                    let _ = outbox_tx.send(SpectatorServerMessage::Pong);
                }
                Err(e) => {
                    log::warn!("spectator: malformed message from {}: {}", viewer_id, e);
                    let _ = outbox_tx.send(SpectatorServerMessage::Error {
                        debate_id: None,
                        payload: ErrorPayload {
                            code: ClientErrorCode::InvalidMessage,
                            message: "unrecognized message".to_string(),
                        },
                    });
                }
            }
        }

        writer.abort();
        self.detach(&viewer_id).await;
        self.viewers.write().await.remove(&viewer_id);
    }

    async fn detach(&self, viewer_id: &str) {
        let prior = {
            let mut viewers = self.viewers.write().await;
            let Some(handle) = viewers.get_mut(viewer_id) else { return };
            handle.contest_id.take()
        };
        let Some(contest_id) = prior else { return };
        self.leave_contest(viewer_id, &contest_id).await;
    }

    async fn leave_contest(&self, viewer_id: &str, contest_id: &str) {
        let now_empty = {
            let mut members = self.local_members.write().await;
            if let Some(set) = members.get_mut(contest_id) {
                set.remove(viewer_id);
                let empty = set.is_empty();
                if empty {
                    members.remove(contest_id);
                }
                empty
            } else {
                true
            }
        };
        if now_empty {
            self.contest_subs.write().await.remove(contest_id);
            self.bus.kv_delete(&keys::spectators(contest_id, &self.replica_id)).await;
        } else {
            let count = self.local_members.read().await.get(contest_id).map(|s| s.len()).unwrap_or(0);
            self.bus
                .kv_set(&keys::spectators(contest_id, &self.replica_id), count.to_string(), ttl::SPECTATOR_COUNT)
                .await;
        }
        self.report_total(contest_id).await;
    }

    async fn join_debate(self: Arc<Self>, viewer_id: &str, contest_id: &str, voter_id: Option<String>) {
        let prior = {
            let mut viewers = self.viewers.write().await;
            let Some(handle) = viewers.get_mut(viewer_id) else { return };
            let prior = handle.contest_id.take();
            handle.contest_id = Some(contest_id.to_string());
            handle.voter_id = voter_id;
            prior
        };
        if let Some(old) = prior {
            if old != contest_id {
                self.leave_contest(viewer_id, &old).await;
            }
        }

        self.local_members
            .write()
            .await
            .entry(contest_id.to_string())
            .or_default()
            .insert(viewer_id.to_string());

        self.clone().ensure_subscribed(contest_id).await;

        let count = self.local_members.read().await.get(contest_id).map(|s| s.len()).unwrap_or(0);
        self.bus
            .kv_set(&keys::spectators(contest_id, &self.replica_id), count.to_string(), ttl::SPECTATOR_COUNT)
            .await;
        self.report_total(contest_id).await;

        self.replay_snapshot(viewer_id, contest_id).await;
    }

    async fn ensure_subscribed(self: Arc<Self>, contest_id: &str) {
        if self.contest_subs.read().await.contains_key(contest_id) {
            return;
        }
        let mut subs = self.contest_subs.write().await;
        if subs.contains_key(contest_id) {
            return;
        }
        let mut rx = self.bus.subscribe(&keys::contest_channel(contest_id)).await;
        let layer = self.clone();
        let contest_id_owned = contest_id.to_string();
        let task = tokio::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                let Ok(event) = serde_json::from_value::<SpectatorServerMessage>(msg.payload) else {
                    continue;
                };
                layer.deliver_to_local_members(&contest_id_owned, event).await;
            }
        });
        subs.insert(contest_id.to_string(), ContestSubscription { task });
    }

    async fn deliver_to_local_members(&self, contest_id: &str, event: SpectatorServerMessage) {
        let members = self.local_members.read().await;
        let Some(ids) = members.get(contest_id) else { return };
        let viewers = self.viewers.read().await;
        for id in ids {
            if let Some(handle) = viewers.get(id) {
                let _ = handle.outbox.send(event.clone());
            }
        }
    }

    /// Persist the fleet-wide total as `Contest::spectator_count` and
    /// broadcast it to every spectator watching this contest, fleet-wide.
    /// Best effort: a lost race against a concurrent status transition just
    /// means the next join/leave will retry with a fresher count — this is
    /// informational, not authoritative.
    async fn report_total(&self, contest_id: &str) {
        let total = self.total_spectators(contest_id).await;
        if let Ok(Some(contest)) = self.persistence.find_contest(contest_id).await {
            let status = contest.status;
            let _ = self
                .persistence
                .update_contest_status(contest_id, status, Box::new(move |c| c.spectator_count = total))
                .await;
        }
        self.broadcast(
            contest_id,
            SpectatorServerMessage::SpectatorCount {
                debate_id: contest_id.to_string(),
                payload: LifecycleEvent::SpectatorCount { count: total },
            },
        )
        .await;
    }

    async fn replay_snapshot(&self, viewer_id: &str, contest_id: &str) {
        let viewers = self.viewers.read().await;
        let Some(handle) = viewers.get(viewer_id) else { return };
        let outbox = handle.outbox.clone();
        drop(viewers);

        let contest = match self.persistence.find_contest(contest_id).await {
            Ok(Some(c)) => c,
            _ => {
                let _ = outbox.send(SpectatorServerMessage::Error {
                    debate_id: None,
                    payload: ErrorPayload {
                        code: ClientErrorCode::InvalidDebateId,
                        message: "no such debate".to_string(),
                    },
                });
                return;
            }
        };

        let _ = outbox.send(SpectatorServerMessage::DebateStarted {
            debate_id: contest_id.to_string(),
            payload: LifecycleEvent::DebateStarted {
                topic: contest.topic.clone(),
                pro_agent_id: contest.pro_agent_id.clone(),
                con_agent_id: contest.con_agent_id.clone(),
                preset_id: contest.preset_id.clone(),
            },
        });

        let turns: Vec<Turn> = self.persistence.turns_for_contest(contest_id).await.unwrap_or_default();
        for turn in turns {
            let _ = outbox.send(SpectatorServerMessage::BotMessage {
                debate_id: contest_id.to_string(),
                payload: LifecycleEvent::BotMessage {
                    round_index: turn.round_index,
                    position: turn.position,
                    content: turn.content,
                },
            });
        }
    }

    async fn submit_vote(&self, viewer_id: &str, contest_id: &str, round_index: u32, choice: Side) {
        let (attached, voter_id, outbox) = {
            let viewers = self.viewers.read().await;
            let Some(handle) = viewers.get(viewer_id) else { return };
            (handle.contest_id.clone(), handle.voter_id.clone(), handle.outbox.clone())
        };

        let Some(voter_id) = voter_id else {
            let _ = outbox.send(SpectatorServerMessage::Error {
                debate_id: Some(contest_id.to_string()),
                payload: ErrorPayload {
                    code: ClientErrorCode::NotAuthenticated,
                    message: "vote requires a voter id".to_string(),
                },
            });
            return;
        };
        if attached.as_deref() != Some(contest_id) {
            let _ = outbox.send(SpectatorServerMessage::Error {
                debate_id: Some(contest_id.to_string()),
                payload: ErrorPayload {
                    code: ClientErrorCode::WrongDebate,
                    message: "not attached to this debate".to_string(),
                },
            });
            return;
        }

        match self.vote_sink.submit_vote(contest_id, round_index, &voter_id, choice).await {
            Ok(()) => {
                let _ = outbox.send(SpectatorServerMessage::VoteAccepted {
                    debate_id: contest_id.to_string(),
                    payload: LifecycleEvent::VoteAccepted { round_index, choice },
                });
            }
            Err(reason) => {
                let _ = outbox.send(SpectatorServerMessage::Error {
                    debate_id: Some(contest_id.to_string()),
                    payload: ErrorPayload {
                        code: vote_rejection_code(reason),
                        message: format!("vote rejected: {:?}", reason),
                    },
                });
            }
        }
    }

    /// Publish a lifecycle event fleet-wide. Local delivery happens
    /// uniformly through this replica's own subscription, not a separate
    /// direct path.
    pub async fn broadcast(&self, contest_id: &str, event: SpectatorServerMessage) {
        if let Ok(payload) = serde_json::to_value(&event) {
            self.bus.publish(&keys::contest_channel(contest_id), payload).await;
        }
    }
}

async fn upgrade_handler(State(layer): State<Arc<SpectatorLayer>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| layer.handle_connection(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::bus::InProcessEventBus;
    use crate::arena::model::Contest;
    use crate::arena::persistence::InMemoryPersistence;
    use chrono::Utc;

    struct AlwaysAccept;

    #[async_trait]
    impl VoteSink for AlwaysAccept {
        async fn submit_vote(&self, _: &str, _: u32, _: &str, _: Side) -> Result<(), VoteRejectionReason> {
            Ok(())
        }
    }

    struct AlwaysReject(VoteRejectionReason);

    #[async_trait]
    impl VoteSink for AlwaysReject {
        async fn submit_vote(&self, _: &str, _: u32, _: &str, _: Side) -> Result<(), VoteRejectionReason> {
            Err(self.0)
        }
    }

    #[tokio::test]
    async fn vote_rejection_reasons_map_to_documented_error_codes() {
        assert_eq!(vote_rejection_code(VoteRejectionReason::NotFound), ClientErrorCode::InvalidDebateId);
        assert_eq!(vote_rejection_code(VoteRejectionReason::WrongRound), ClientErrorCode::InvalidVote);
        assert_eq!(vote_rejection_code(VoteRejectionReason::NotOpen), ClientErrorCode::VoteFailed);
        assert_eq!(vote_rejection_code(VoteRejectionReason::AlreadyVoted), ClientErrorCode::VoteFailed);
    }

    #[tokio::test]
    async fn join_debate_replays_persisted_turns_then_subscribes_for_live_events() {
        let persistence = InMemoryPersistence::shared();
        let bus = InProcessEventBus::shared();
        let layer = SpectatorLayer::new(persistence.clone(), bus.clone(), Arc::new(AlwaysAccept), "replica-1");

        let contest = Contest::new("c1", "topic", "classic", "pro", "con", 0, Utc::now());
        persistence.create_contest(contest).await.unwrap();
        persistence
            .append_turn(Turn {
                contest_id: "c1".into(),
                round_index: 0,
                exchange_index: 0,
                position: Side::Pro,
                author_agent_id: "pro".into(),
                content: "opening".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        layer
            .viewers
            .write()
            .await
            .insert(
                "v1".to_string(),
                ViewerHandle {
                    outbox: mpsc::unbounded_channel().0,
                    contest_id: None,
                    voter_id: None,
                },
            );
        layer.clone().join_debate("v1", "c1", Some("voter-1".to_string())).await;

        assert!(layer.local_members.read().await.get("c1").unwrap().contains("v1"));
        assert!(layer.contest_subs.read().await.contains_key("c1"));

        let total = layer.total_spectators("c1").await;
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn join_debate_broadcasts_spectator_count_to_local_members() {
        let persistence = InMemoryPersistence::shared();
        let bus = InProcessEventBus::shared();
        let layer = SpectatorLayer::new(persistence.clone(), bus.clone(), Arc::new(AlwaysAccept), "replica-1");
        persistence
            .create_contest(Contest::new("c1", "t", "classic", "pro", "con", 0, Utc::now()))
            .await
            .unwrap();

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
        layer.viewers.write().await.insert(
            "v1".to_string(),
            ViewerHandle {
                outbox: outbox_tx,
                contest_id: None,
                voter_id: None,
            },
        );
        layer.clone().join_debate("v1", "c1", None).await;

        let mut saw_count = None;
        while let Ok(msg) = outbox_rx.try_recv() {
            if let SpectatorServerMessage::SpectatorCount { payload: LifecycleEvent::SpectatorCount { count }, .. } = msg {
                saw_count = Some(count);
            }
        }
        assert_eq!(saw_count, Some(1));
    }

    #[tokio::test]
    async fn detach_removes_subscription_once_last_viewer_leaves() {
        let persistence = InMemoryPersistence::shared();
        let bus = InProcessEventBus::shared();
        let layer = SpectatorLayer::new(persistence.clone(), bus.clone(), Arc::new(AlwaysAccept), "replica-1");
        persistence
            .create_contest(Contest::new("c1", "t", "classic", "pro", "con", 0, Utc::now()))
            .await
            .unwrap();

        layer
            .viewers
            .write()
            .await
            .insert(
                "v1".to_string(),
                ViewerHandle {
                    outbox: mpsc::unbounded_channel().0,
                    contest_id: None,
                    voter_id: None,
                },
            );
        layer.clone().join_debate("v1", "c1", None).await;
        layer.detach("v1").await;

        assert!(!layer.local_members.read().await.contains_key("c1"));
        assert!(!layer.contest_subs.read().await.contains_key("c1"));
    }

    #[tokio::test]
    async fn submit_vote_requires_attachment_and_relays_vote_sink_rejection() {
        let persistence = InMemoryPersistence::shared();
        let bus = InProcessEventBus::shared();
        let layer = SpectatorLayer::new(
            persistence.clone(),
            bus.clone(),
            Arc::new(AlwaysReject(VoteRejectionReason::NotOpen)),
            "replica-1",
        );
        persistence
            .create_contest(Contest::new("c1", "t", "classic", "pro", "con", 0, Utc::now()))
            .await
            .unwrap();

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
        layer.viewers.write().await.insert(
            "v1".to_string(),
            ViewerHandle {
                outbox: outbox_tx,
                contest_id: None,
                voter_id: None,
            },
        );

        // Not yet attached to any debate: rejected before reaching the vote sink.
        layer.submit_vote("v1", "c1", 0, Side::Pro).await;
        match outbox_rx.recv().await.unwrap() {
            SpectatorServerMessage::Error { payload, .. } => assert_eq!(payload.code, ClientErrorCode::NotAuthenticated),
            other => panic!("unexpected message: {:?}", other),
        }

        layer.clone().join_debate("v1", "c1", Some("voter-1".to_string())).await;
        // Drain the replay snapshot messages before checking the vote outcome.
        while let Ok(msg) = outbox_rx.try_recv() {
            let _ = msg;
        }

        layer.submit_vote("v1", "c1", 0, Side::Pro).await;
        match outbox_rx.recv().await.unwrap() {
            SpectatorServerMessage::Error { payload, .. } => assert_eq!(payload.code, ClientErrorCode::VoteFailed),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
