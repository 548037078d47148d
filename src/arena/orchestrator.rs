//! Debate Orchestrator (C7): drives each contest's state machine, persists
//! every transition, and emits lifecycle events.
//!
//! A driver owns one contest end-to-end, suspending at well-defined points
//! rather than polling.

use crate::arena::bus::{keys, EventBus, RecoveryLock};
use crate::arena::config::{ArenaConfig, PresetRegistry};
use crate::arena::error::VoteRejectionReason;
use crate::arena::matchmaker::Pairing;
use crate::arena::model::{
    Contest, ContestStatus, FormatPreset, RoundOutcome, RoundSpec, RoundStatus, Side, Speaker, SpectatorVote, Turn,
    Winner,
};
use crate::arena::persistence::{CastVoteOutcome, PersistenceGateway};
use crate::arena::protocol::{
    AgentServerMessage, CharLimit, ErrorPayload, LifecycleEvent, PastMessage, SpectatorServerMessage, WordLimit,
};
use crate::arena::rating::{settle_bets, settle_tie, update_ratings};
use crate::arena::router::AgentRouter;
use crate::arena::spectator::{SpectatorLayer, VoteSink};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum OrchestratorError {
    UnknownPreset(String),
    ContestNotFound(String),
    NotOwner,
    Persistence(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::UnknownPreset(id) => write!(f, "unknown preset: {}", id),
            OrchestratorError::ContestNotFound(id) => write!(f, "contest not found or not active here: {}", id),
            OrchestratorError::NotOwner => write!(f, "requester does not own either agent in this contest"),
            OrchestratorError::Persistence(msg) => write!(f, "persistence error: {}", msg),
        }
    }
}

impl Error for OrchestratorError {}

/// Snapshot of the in-memory round position, consulted by the vote
/// admission fast path.
#[derive(Debug, Clone, Copy)]
struct ContestSnapshot {
    current_round_index: u32,
    round_status: RoundStatus,
}

struct ActiveContest {
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    forfeit_tx: mpsc::UnboundedSender<Side>,
    snapshot: Arc<RwLock<ContestSnapshot>>,
}

/// Outcome of one driver step used to unwind the round loop cleanly on
/// forfeit or cancellation.
enum StepOutcome {
    Continue,
    Forfeited(Side),
    Cancelled,
    ShuttingDown,
}

/// Drives every contest this replica owns.
pub struct Orchestrator {
    persistence: Arc<dyn PersistenceGateway>,
    bus: Arc<dyn EventBus>,
    router: Arc<AgentRouter>,
    spectator: Arc<SpectatorLayer>,
    presets: PresetRegistry,
    config: ArenaConfig,
    active: RwLock<HashMap<String, ActiveContest>>,
    shutdown_notify: Arc<Notify>,
    shutting_down: Arc<AtomicBool>,
    recovery_lock: RecoveryLock,
}

impl Orchestrator {
    pub fn new(
        persistence: Arc<dyn PersistenceGateway>,
        bus: Arc<dyn EventBus>,
        router: Arc<AgentRouter>,
        spectator: Arc<SpectatorLayer>,
        presets: PresetRegistry,
        config: ArenaConfig,
    ) -> Arc<Self> {
        let recovery_lock = RecoveryLock::new(bus.clone());
        Arc::new(Self {
            persistence,
            bus,
            router,
            spectator,
            presets,
            config,
            active: RwLock::new(HashMap::new()),
            shutdown_notify: Arc::new(Notify::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            recovery_lock,
        })
    }

    /// Stop driving every contest this replica currently owns without
    /// finalizing any of them, in response to an externally driven
    /// shutdown signal. Unlike [`Orchestrator::cancel_contest`], this
    /// leaves persisted contest and round state untouched — the contest
    /// stays `in_progress` and [`Orchestrator::recover_stuck_contests`]
    /// picks it back up on the next startup, here or on another replica.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_waiters();
        let count = self.active.read().await.len();
        log::info!("orchestrator: shutdown requested, {} contest(s) in flight will resume on restart", count);
    }

    /// Create and start a contest for a pairing produced by the matchmaker.
    pub async fn start_from_pairing(
        self: &Arc<Self>,
        pairing: Pairing,
        preset_id: String,
        topic: String,
    ) -> Result<String, OrchestratorError> {
        let preset = self
            .presets
            .get(&preset_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownPreset(preset_id.clone()))?;
        let contest_id = Uuid::new_v4().to_string();
        let contest = Contest::new(
            contest_id.clone(),
            topic,
            preset_id,
            pairing.pro.agent_id.clone(),
            pairing.con.agent_id.clone(),
            pairing.pro.stake_amount,
            Utc::now(),
        );
        self.persistence
            .create_contest(contest)
            .await
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?;
        self.clone().spawn_driver(contest_id.clone(), preset, false, false).await;
        Ok(contest_id)
    }

    /// Request cancellation of a contest owned by this replica.
    pub async fn cancel_contest(&self, contest_id: &str) -> Result<(), OrchestratorError> {
        let active = self.active.read().await;
        let handle = active
            .get(contest_id)
            .ok_or_else(|| OrchestratorError::ContestNotFound(contest_id.to_string()))?;
        handle.cancelled.store(true, Ordering::Relaxed);
        handle.cancel_notify.notify_waiters();
        Ok(())
    }

    /// Forfeit a side on behalf of its owner. The caller (router or REST
    /// surface) has already authenticated `requesting_owner_id`; this
    /// verifies it actually owns one of the two agents.
    pub async fn request_forfeit(&self, contest_id: &str, requesting_owner_id: &str) -> Result<(), OrchestratorError> {
        let contest = self
            .persistence
            .find_contest(contest_id)
            .await
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?
            .ok_or_else(|| OrchestratorError::ContestNotFound(contest_id.to_string()))?;
        let pro_agent = self
            .persistence
            .find_agent(&contest.pro_agent_id)
            .await
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?
            .ok_or_else(|| OrchestratorError::ContestNotFound(contest_id.to_string()))?;
        let con_agent = self
            .persistence
            .find_agent(&contest.con_agent_id)
            .await
            .map_err(|e| OrchestratorError::Persistence(e.to_string()))?
            .ok_or_else(|| OrchestratorError::ContestNotFound(contest_id.to_string()))?;

        let side = if pro_agent.owner_id == requesting_owner_id {
            Side::Pro
        } else if con_agent.owner_id == requesting_owner_id {
            Side::Con
        } else {
            return Err(OrchestratorError::NotOwner);
        };

        let active = self.active.read().await;
        let handle = active
            .get(contest_id)
            .ok_or_else(|| OrchestratorError::ContestNotFound(contest_id.to_string()))?;
        let _ = handle.forfeit_tx.send(side);
        Ok(())
    }

    /// Scan storage for contests left `in_progress` by a dead driver and
    /// resume them.
    pub async fn recover_stuck_contests(self: &Arc<Self>) {
        let contests = self.persistence.list_recent_contests(500).await.unwrap_or_default();
        for contest in contests {
            if contest.status != ContestStatus::InProgress {
                continue;
            }
            if self.active.read().await.contains_key(&contest.id) {
                continue;
            }
            if !self.recovery_lock.try_acquire(&contest.id, &self.config.replica_id).await {
                continue;
            }
            let Some(preset) = self.presets.get(&contest.preset_id).cloned() else {
                log::warn!("orchestrator: unknown preset {} for stuck contest {}", contest.preset_id, contest.id);
                self.recovery_lock.release(&contest.id).await;
                continue;
            };

            let driver = self.clone();
            tokio::spawn(async move {
                let reconnected = driver
                    .wait_for_agents_reconnect(&contest.id, &contest.pro_agent_id, &contest.con_agent_id)
                    .await;
                if reconnected {
                    // `spawn_driver` takes over heartbeat-refreshing the
                    // recovery lock for the rest of the contest's lifetime
                    // and releases it when the driver exits.
                    driver.clone().spawn_driver(contest.id.clone(), preset, true, true).await;
                } else {
                    let contest_id = contest.id.clone();
                    let _ = driver
                        .persistence
                        .update_contest_status(
                            &contest_id,
                            ContestStatus::InProgress,
                            Box::new(|c| {
                                c.status = ContestStatus::Cancelled;
                                c.ended_at = Some(Utc::now());
                            }),
                        )
                        .await;
                    driver.recovery_lock.release(&contest_id).await;
                    log::warn!("orchestrator: cancelled {} after recovery reconnect timeout", contest_id);
                }
            });
        }
    }

    /// Waits up to 60s for both agents to reconnect, refreshing this
    /// replica's recovery-lock claim on `contest_id` every poll so the
    /// claim — whose TTL is far shorter than this wait — survives until
    /// `spawn_driver` takes over refreshing it for the drive itself.
    async fn wait_for_agents_reconnect(&self, contest_id: &str, pro_id: &str, con_id: &str) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        loop {
            self.recovery_lock.refresh(contest_id, &self.config.replica_id).await;
            let pro_ok = self.bus.kv_get(&keys::agent_connected(pro_id)).await.is_some();
            let con_ok = self.bus.kv_get(&keys::agent_connected(con_id)).await.is_some();
            if pro_ok && con_ok {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// `recovery_owned` is set only when this driver was spawned by
    /// [`Orchestrator::recover_stuck_contests`] after claiming the recovery
    /// lock for `contest_id`; it then heartbeat-refreshes that claim for as
    /// long as the driver runs and releases it when the driver exits, since
    /// the claim's TTL is far shorter than a full contest drive.
    async fn spawn_driver(self: Arc<Self>, contest_id: String, preset: FormatPreset, resume: bool, recovery_owned: bool) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_notify = Arc::new(Notify::new());
        let (forfeit_tx, forfeit_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(RwLock::new(ContestSnapshot {
            current_round_index: 0,
            round_status: RoundStatus::Pending,
        }));

        self.active.write().await.insert(
            contest_id.clone(),
            ActiveContest {
                cancelled: cancelled.clone(),
                cancel_notify: cancel_notify.clone(),
                forfeit_tx,
                snapshot: snapshot.clone(),
            },
        );

        let driver = self.clone();
        let contest_id_for_task = contest_id.clone();
        tokio::spawn(async move {
            let heartbeat = recovery_owned.then(|| {
                let driver = driver.clone();
                let contest_id = contest_id_for_task.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_secs(10));
                    loop {
                        interval.tick().await;
                        driver.recovery_lock.refresh(&contest_id, &driver.config.replica_id).await;
                    }
                })
            });

            driver
                .clone()
                .run(contest_id_for_task.clone(), preset, resume, cancelled, cancel_notify, forfeit_rx, snapshot)
                .await;
            driver.active.write().await.remove(&contest_id_for_task);
            if let Some(heartbeat) = heartbeat {
                heartbeat.abort();
                driver.recovery_lock.release(&contest_id_for_task).await;
            }
        });
    }

    async fn run(
        self: Arc<Self>,
        contest_id: String,
        preset: FormatPreset,
        resume: bool,
        cancelled: Arc<AtomicBool>,
        cancel_notify: Arc<Notify>,
        mut forfeit_rx: mpsc::UnboundedReceiver<Side>,
        snapshot: Arc<RwLock<ContestSnapshot>>,
    ) {
        let Some(contest) = self.persistence.find_contest(&contest_id).await.ok().flatten() else {
            log::error!("orchestrator: contest {} vanished before its driver started", contest_id);
            return;
        };

        let mut start_round = 0u32;
        let mut resume_mode = ResumeMode::FreshRound;

        if resume {
            {
                let mut snap = snapshot.write().await;
                snap.current_round_index = contest.current_round_index;
                snap.round_status = contest.round_status;
            }
            start_round = contest.current_round_index;
            resume_mode = match contest.round_status {
                RoundStatus::Pending => ResumeMode::FreshRound,
                RoundStatus::BotResponding => ResumeMode::ReplayThenFinishTurns,
                RoundStatus::Voting => ResumeMode::ResumeVoting,
                RoundStatus::Completed => {
                    start_round += 1;
                    ResumeMode::FreshRound
                }
            };
            log::info!(
                "contest {} resuming at round {} ({:?})",
                contest_id, contest.current_round_index, contest.round_status
            );
            self.spectator
                .broadcast(
                    &contest_id,
                    SpectatorServerMessage::DebateResumed {
                        debate_id: contest_id.clone(),
                        payload: LifecycleEvent::DebateResumed {
                            resume_round_index: contest.current_round_index,
                            resume_round_status: format!("{:?}", contest.round_status),
                        },
                    },
                )
                .await;
        } else {
            if self
                .persistence
                .update_contest_status(
                    &contest_id,
                    ContestStatus::Pending,
                    Box::new(|c| {
                        c.status = ContestStatus::InProgress;
                        c.started_at = Some(Utc::now());
                    }),
                )
                .await
                .is_err()
            {
                return; // another driver already owns this contest
            }
            log::info!("contest {} started: {} vs {}", contest_id, contest.pro_agent_id, contest.con_agent_id);
            self.spectator
                .broadcast(
                    &contest_id,
                    SpectatorServerMessage::DebateStarted {
                        debate_id: contest_id.clone(),
                        payload: LifecycleEvent::DebateStarted {
                            topic: contest.topic.clone(),
                            pro_agent_id: contest.pro_agent_id.clone(),
                            con_agent_id: contest.con_agent_id.clone(),
                            preset_id: contest.preset_id.clone(),
                        },
                    },
                )
                .await;

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(preset.prep_time_seconds)) => {}
                _ = cancel_notify.notified() => {
                    self.finalize_cancelled(&contest_id).await;
                    return;
                }
                _ = self.shutdown_notify.notified() => return,
            }
        }

        let mut forfeited: Option<Side> = None;

        'rounds: for round_index in start_round..preset.rounds.len() as u32 {
            if cancelled.load(Ordering::Relaxed) {
                self.finalize_cancelled(&contest_id).await;
                return;
            }
            if self.shutting_down.load(Ordering::Relaxed) {
                return;
            }

            let round_spec = preset.rounds[round_index as usize].clone();
            let phase = if round_index == start_round { resume_mode } else { ResumeMode::FreshRound };

            let outcome = match phase {
                ResumeMode::FreshRound => {
                    self.begin_round(&contest_id, round_index, &round_spec, &snapshot).await;
                    self.run_turns(
                        &contest_id,
                        &contest,
                        &round_spec,
                        round_index,
                        &std::collections::HashSet::new(),
                        &mut forfeit_rx,
                        &cancel_notify,
                    )
                    .await
                }
                ResumeMode::ReplayThenFinishTurns => {
                    {
                        let mut snap = snapshot.write().await;
                        snap.current_round_index = round_index;
                        snap.round_status = RoundStatus::BotResponding;
                    }
                    let already = self.replay_round_turns(&contest_id, round_index).await;
                    self.run_turns(
                        &contest_id,
                        &contest,
                        &round_spec,
                        round_index,
                        &already,
                        &mut forfeit_rx,
                        &cancel_notify,
                    )
                    .await
                }
                ResumeMode::ResumeVoting => {
                    if contest.round_outcomes.iter().any(|r| r.round_index == round_index) {
                        continue 'rounds; // outcome already persisted before the crash
                    }
                    self.replay_round_turns(&contest_id, round_index).await;
                    StepOutcome::Continue
                }
            };

            match outcome {
                StepOutcome::Cancelled => {
                    self.finalize_cancelled(&contest_id).await;
                    return;
                }
                StepOutcome::ShuttingDown => return,
                StepOutcome::Forfeited(side) => {
                    forfeited = Some(side);
                    break 'rounds;
                }
                StepOutcome::Continue => {}
            }

            {
                let mut snap = snapshot.write().await;
                snap.round_status = RoundStatus::Voting;
            }
            let _ = self
                .persistence
                .update_contest_status(&contest_id, ContestStatus::InProgress, Box::new(|c| c.round_status = RoundStatus::Voting))
                .await;
            log::info!("contest {} round {} entered voting", contest_id, round_index);
            self.spectator
                .broadcast(
                    &contest_id,
                    SpectatorServerMessage::VotingStarted {
                        debate_id: contest_id.clone(),
                        payload: LifecycleEvent::VotingStarted {
                            round_index,
                            window_seconds: preset.vote_window_seconds,
                        },
                    },
                )
                .await;

            match self
                .run_voting_window(&contest_id, preset.vote_window_seconds, round_index, &mut forfeit_rx, &cancel_notify)
                .await
            {
                StepOutcome::Cancelled => {
                    self.finalize_cancelled(&contest_id).await;
                    return;
                }
                StepOutcome::ShuttingDown => return,
                StepOutcome::Forfeited(side) => {
                    forfeited = Some(side);
                    break 'rounds;
                }
                StepOutcome::Continue => {}
            }

            // Close vote admission's fast path *before* reading the tally
            // that becomes this round's RoundOutcome, not after: otherwise a
            // vote submitted in the gap is persisted via `cast_vote` but
            // misses the tally snapshot, breaking the invariant that every
            // accepted vote is reflected in a RoundOutcome.
            {
                let mut snap = snapshot.write().await;
                snap.round_status = RoundStatus::Completed;
            }
            let (pro_votes, con_votes) = self.persistence.tally_round_votes(&contest_id, round_index).await.unwrap_or((0, 0));
            let round_outcome = RoundOutcome::new(round_index, pro_votes, con_votes);
            let _ = self.persistence.append_round_outcome(&contest_id, round_outcome.clone()).await;
            let _ = self
                .persistence
                .update_contest_status(&contest_id, ContestStatus::InProgress, Box::new(|c| c.round_status = RoundStatus::Completed))
                .await;

            let standings = self.persistence.find_contest(&contest_id).await.ok().flatten();
            let (overall_pro, overall_con) = standings.as_ref().map(|c| c.round_wins()).unwrap_or((0, 0));
            log::info!(
                "contest {} round {} ended: pro={} con={} winner={:?} (overall {}-{})",
                contest_id, round_index, pro_votes, con_votes, round_outcome.winner, overall_pro, overall_con
            );
            self.spectator
                .broadcast(
                    &contest_id,
                    SpectatorServerMessage::RoundEnded {
                        debate_id: contest_id.clone(),
                        payload: LifecycleEvent::RoundEnded {
                            round_index,
                            pro_votes,
                            con_votes,
                            winner: round_outcome.winner.as_side(),
                            overall_pro_wins: overall_pro,
                            overall_con_wins: overall_con,
                        },
                    },
                )
                .await;
        }

        let final_contest = self.persistence.find_contest(&contest_id).await.ok().flatten().unwrap_or(contest);
        self.complete_contest(&contest_id, final_contest, forfeited).await;
    }

    async fn begin_round(
        &self,
        contest_id: &str,
        round_index: u32,
        round_spec: &RoundSpec,
        snapshot: &Arc<RwLock<ContestSnapshot>>,
    ) {
        {
            let mut snap = snapshot.write().await;
            snap.current_round_index = round_index;
            snap.round_status = RoundStatus::Pending;
        }
        let _ = self
            .persistence
            .update_contest_status(
                contest_id,
                ContestStatus::InProgress,
                Box::new(move |c| {
                    c.current_round_index = round_index;
                    c.round_status = RoundStatus::Pending;
                }),
            )
            .await;
        log::info!("contest {} round {} started: {}", contest_id, round_index, round_spec.name);
        self.spectator
            .broadcast(
                contest_id,
                SpectatorServerMessage::RoundStarted {
                    debate_id: contest_id.to_string(),
                    payload: LifecycleEvent::RoundStarted {
                        round_index,
                        name: round_spec.name.clone(),
                    },
                },
            )
            .await;
        let _ = self
            .persistence
            .update_contest_status(contest_id, ContestStatus::InProgress, Box::new(|c| c.round_status = RoundStatus::BotResponding))
            .await;
    }

    /// Replay already-persisted turns for `round_index` to spectators, for
    /// the `bot_responding`/`voting` recovery cases. Returns the set of
    /// `(exchange_index, position)` pairs already persisted, which is the
    /// literal re-request guard: "does a Turn exist for this round,
    /// position, and exchange index" — not a count of turns, since a
    /// `speaker = both` round can crash with the pro turn of an exchange
    /// persisted and the con turn of that same exchange still missing, and
    /// a raw count would misidentify which side still needs requesting.
    async fn replay_round_turns(&self, contest_id: &str, round_index: u32) -> std::collections::HashSet<(u32, Side)> {
        let turns = self.persistence.turns_for_contest(contest_id).await.unwrap_or_default();
        let mut existing = std::collections::HashSet::new();
        for turn in turns.into_iter().filter(|t| t.round_index == round_index) {
            existing.insert((turn.exchange_index, turn.position));
            self.spectator
                .broadcast(
                    contest_id,
                    SpectatorServerMessage::BotMessage {
                        debate_id: contest_id.to_string(),
                        payload: LifecycleEvent::BotMessage {
                            round_index,
                            position: turn.position,
                            content: turn.content,
                        },
                    },
                )
                .await;
        }
        existing
    }

    async fn build_transcript(&self, contest_id: &str) -> Vec<PastMessage> {
        self.persistence
            .turns_for_contest(contest_id)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|t| PastMessage {
                round_index: t.round_index,
                position: t.position,
                content: t.content,
            })
            .collect()
    }

    async fn run_turns(
        &self,
        contest_id: &str,
        contest: &Contest,
        round_spec: &RoundSpec,
        round_index: u32,
        already_present: &std::collections::HashSet<(u32, Side)>,
        forfeit_rx: &mut mpsc::UnboundedReceiver<Side>,
        cancel_notify: &Arc<Notify>,
    ) -> StepOutcome {
        let sides_per_exchange: &[Side] = match round_spec.speaker {
            Speaker::Pro => &[Side::Pro],
            Speaker::Con => &[Side::Con],
            Speaker::Both => &[Side::Pro, Side::Con],
        };
        let effective_timeout =
            Duration::from_secs(round_spec.turn_time_limit_seconds.min(self.config.bot_request_timeout_ceiling_seconds));

        for exchange in 0..round_spec.exchanges {
            for &position in sides_per_exchange {
                if already_present.contains(&(exchange, position)) {
                    continue;
                }

                if let Ok(side) = forfeit_rx.try_recv() {
                    return StepOutcome::Forfeited(side);
                }

                let agent_id = contest.agent_id(position).to_string();
                self.spectator
                    .broadcast(
                        contest_id,
                        SpectatorServerMessage::BotTyping {
                            debate_id: contest_id.to_string(),
                            payload: LifecycleEvent::BotTyping { round_index, position },
                        },
                    )
                    .await;

                let messages_so_far = self.build_transcript(contest_id).await;
                let opponent_last_message = messages_so_far
                    .iter()
                    .rev()
                    .find(|m| m.position == position.opposite())
                    .map(|m| m.content.clone());

                let request = AgentServerMessage::DebateRequest {
                    request_id: String::new(),
                    debate_id: contest_id.to_string(),
                    round: round_spec.name.clone(),
                    topic: contest.topic.clone(),
                    position,
                    opponent_last_message,
                    time_limit_seconds: effective_timeout.as_secs(),
                    word_limit: WordLimit {
                        min: round_spec.word_limit.0,
                        max: round_spec.word_limit.1,
                    },
                    char_limit: CharLimit {
                        min: round_spec.char_limit.0,
                        max: round_spec.char_limit.1,
                    },
                    messages_so_far,
                };

                let content = tokio::select! {
                    result = self.router.send_request(&agent_id, request, effective_timeout) => match result {
                        Ok(response) => response.message,
                        Err(e) => format!("[Bot failed to respond: {}]", e),
                    },
                    _ = cancel_notify.notified() => return StepOutcome::Cancelled,
                    _ = self.shutdown_notify.notified() => return StepOutcome::ShuttingDown,
                };

                let turn = Turn {
                    contest_id: contest_id.to_string(),
                    round_index,
                    exchange_index: exchange,
                    position,
                    author_agent_id: agent_id,
                    content: content.clone(),
                    created_at: Utc::now(),
                };
                let _ = self.persistence.append_turn(turn).await;
                self.spectator
                    .broadcast(
                        contest_id,
                        SpectatorServerMessage::BotMessage {
                            debate_id: contest_id.to_string(),
                            payload: LifecycleEvent::BotMessage {
                                round_index,
                                position,
                                content,
                            },
                        },
                    )
                    .await;
            }
        }
        StepOutcome::Continue
    }

    async fn run_voting_window(
        &self,
        contest_id: &str,
        window_seconds: u64,
        round_index: u32,
        forfeit_rx: &mut mpsc::UnboundedReceiver<Side>,
        cancel_notify: &Arc<Notify>,
    ) -> StepOutcome {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(window_seconds);
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            if tokio::time::Instant::now() >= deadline {
                return StepOutcome::Continue;
            }
            tokio::select! {
                _ = tick.tick() => {
                    if let Ok(side) = forfeit_rx.try_recv() {
                        return StepOutcome::Forfeited(side);
                    }
                    let (pro, con) = self.persistence.tally_round_votes(contest_id, round_index).await.unwrap_or((0, 0));
                    self.spectator.broadcast(contest_id, SpectatorServerMessage::VoteUpdate {
                        debate_id: contest_id.to_string(),
                        payload: LifecycleEvent::VoteUpdate { round_index, pro_votes: pro, con_votes: con },
                    }).await;
                }
                _ = cancel_notify.notified() => return StepOutcome::Cancelled,
                _ = self.shutdown_notify.notified() => return StepOutcome::ShuttingDown,
            }
        }
    }

    async fn finalize_cancelled(&self, contest_id: &str) {
        let _ = self
            .persistence
            .update_contest_status(
                contest_id,
                ContestStatus::InProgress,
                Box::new(|c| {
                    c.status = ContestStatus::Cancelled;
                    c.ended_at = Some(Utc::now());
                }),
            )
            .await;
        log::info!("contest {} cancelled", contest_id);
        self.spectator
            .broadcast(
                contest_id,
                SpectatorServerMessage::Error {
                    debate_id: Some(contest_id.to_string()),
                    payload: ErrorPayload {
                        code: crate::arena::error::ClientErrorCode::DebateCancelled,
                        message: "contest cancelled".to_string(),
                    },
                },
            )
            .await;
    }

    async fn complete_contest(&self, contest_id: &str, contest: Contest, forfeited_side: Option<Side>) {
        let winner = match forfeited_side {
            Some(forfeiter) => Winner::from_counts(
                if forfeiter == Side::Con { 1 } else { 0 },
                if forfeiter == Side::Pro { 1 } else { 0 },
            ),
            None => {
                let (pro_wins, con_wins) = contest.round_wins();
                Winner::from_counts(pro_wins, con_wins)
            }
        };

        let (pro_delta, con_delta) = match winner.as_side() {
            Some(winning_side) => self.settle_decisive(contest_id, &contest, winning_side).await,
            None => {
                let bets = self.persistence.bets_for_contest(contest_id).await.unwrap_or_default();
                let payouts: HashMap<String, u64> = settle_tie(&bets).into_iter().map(|p| (p.bettor_id, p.amount)).collect();
                let _ = self.persistence.settle_bets(contest_id, payouts).await;
                (0, 0)
            }
        };

        let _ = self
            .persistence
            .update_contest_status(
                contest_id,
                ContestStatus::InProgress,
                Box::new(move |c| {
                    c.status = ContestStatus::Completed;
                    c.winner = winner;
                    c.ended_at = Some(Utc::now());
                }),
            )
            .await;

        if let Some(forfeiter) = forfeited_side {
            log::info!("contest {} forfeited by {:?}, winner {:?}", contest_id, forfeiter, forfeiter.opposite());
            self.spectator
                .broadcast(
                    contest_id,
                    SpectatorServerMessage::DebateForfeit {
                        debate_id: contest_id.to_string(),
                        payload: LifecycleEvent::DebateForfeit {
                            forfeited_by: forfeiter,
                            winner: forfeiter.opposite(),
                        },
                    },
                )
                .await;
        } else {
            log::info!(
                "contest {} ended: winner={:?} pro_delta={} con_delta={}",
                contest_id, winner.as_side(), pro_delta, con_delta
            );
            self.spectator
                .broadcast(
                    contest_id,
                    SpectatorServerMessage::DebateEnded {
                        debate_id: contest_id.to_string(),
                        payload: LifecycleEvent::DebateEnded {
                            winner: winner.as_side(),
                            pro_rating_delta: pro_delta,
                            con_rating_delta: con_delta,
                        },
                    },
                )
                .await;
        }

        self.router
            .notify_complete(&contest.pro_agent_id, contest_id.to_string(), winner.as_side().map(|s| s == Side::Pro), pro_delta)
            .await;
        self.router
            .notify_complete(&contest.con_agent_id, contest_id.to_string(), winner.as_side().map(|s| s == Side::Con), con_delta)
            .await;
    }

    async fn settle_decisive(&self, contest_id: &str, contest: &Contest, winning_side: Side) -> (i64, i64) {
        let pro_agent = self.persistence.find_agent(&contest.pro_agent_id).await.ok().flatten();
        let con_agent = self.persistence.find_agent(&contest.con_agent_id).await.ok().flatten();
        let (Some(pro_agent), Some(con_agent)) = (pro_agent, con_agent) else {
            return (0, 0);
        };

        let (winner_rating, loser_rating) = if winning_side == Side::Pro {
            (pro_agent.rating, con_agent.rating)
        } else {
            (con_agent.rating, pro_agent.rating)
        };
        let update = update_ratings(winner_rating, loser_rating, self.config.rating_k_factor);

        let mut new_pro = pro_agent;
        let mut new_con = con_agent;
        let (pro_delta, con_delta) = if winning_side == Side::Pro {
            new_pro.rating = update.winner.new_rating;
            new_pro.wins += 1;
            new_con.rating = update.loser.new_rating;
            new_con.losses += 1;
            (update.winner.delta, update.loser.delta)
        } else {
            new_con.rating = update.winner.new_rating;
            new_con.wins += 1;
            new_pro.rating = update.loser.new_rating;
            new_pro.losses += 1;
            (update.loser.delta, update.winner.delta)
        };
        let _ = self.persistence.update_agent(new_pro).await;
        let _ = self.persistence.update_agent(new_con).await;

        let bets = self.persistence.bets_for_contest(contest_id).await.unwrap_or_default();
        let payouts: HashMap<String, u64> = settle_bets(&bets, winning_side).into_iter().map(|p| (p.bettor_id, p.amount)).collect();
        let _ = self.persistence.settle_bets(contest_id, payouts).await;

        (pro_delta, con_delta)
    }
}

#[async_trait]
impl VoteSink for Orchestrator {
    /// Vote admission: accepted iff the contest is `in_progress`, the
    /// vote's round matches the current one, that round is in `voting`,
    /// and no prior vote exists. Consults the in-memory snapshot when this
    /// replica owns the contest (fast path), falling back to the persisted
    /// contest row otherwise.
    async fn submit_vote(
        &self,
        contest_id: &str,
        round_index: u32,
        voter_id: &str,
        choice: Side,
    ) -> Result<(), VoteRejectionReason> {
        let contest = self
            .persistence
            .find_contest(contest_id)
            .await
            .map_err(|_| VoteRejectionReason::NotFound)?
            .ok_or(VoteRejectionReason::NotFound)?;

        let (current_round, round_status) = if let Some(active) = self.active.read().await.get(contest_id) {
            let snap = *active.snapshot.read().await;
            (snap.current_round_index, snap.round_status)
        } else {
            (contest.current_round_index, contest.round_status)
        };

        if contest.status != ContestStatus::InProgress {
            return Err(VoteRejectionReason::NotOpen);
        }
        if round_index != current_round {
            return Err(VoteRejectionReason::WrongRound);
        }
        if round_status != RoundStatus::Voting {
            return Err(VoteRejectionReason::NotOpen);
        }

        match self
            .persistence
            .cast_vote(SpectatorVote {
                contest_id: contest_id.to_string(),
                round_index,
                voter_id: voter_id.to_string(),
                choice,
            })
            .await
        {
            Ok(CastVoteOutcome::Recorded) | Ok(CastVoteOutcome::AlreadyVotedSameChoice) => Ok(()),
            Ok(CastVoteOutcome::AlreadyVotedDifferentChoice) => Err(VoteRejectionReason::AlreadyVoted),
            Err(_) => Err(VoteRejectionReason::NotFound),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ResumeMode {
    FreshRound,
    ReplayThenFinishTurns,
    ResumeVoting,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::bus::InProcessEventBus;
    use crate::arena::config::classic_preset;
    use crate::arena::matchmaker::Pairing;
    use crate::arena::model::{Agent, QueueEntry};
    use crate::arena::persistence::InMemoryPersistence;

    fn queue_entry(agent_id: &str) -> QueueEntry {
        QueueEntry {
            agent_id: agent_id.to_string(),
            owner_id: format!("owner-{}", agent_id),
            stake_amount: 0,
            preset_id: "classic".to_string(),
            enqueued_at: Utc::now(),
            allow_same_owner: false,
            expansions: 0,
        }
    }

    fn agent(id: &str, rating: i64) -> Agent {
        Agent {
            id: id.to_string(),
            owner_id: format!("owner-{}", id),
            display_name: id.to_string(),
            rating,
            wins: 0,
            losses: 0,
            active: true,
            connection_token: "0".repeat(64),
        }
    }

    async fn build_orchestrator() -> (Arc<Orchestrator>, Arc<InMemoryPersistence>) {
        let persistence = InMemoryPersistence::shared();
        let bus = InProcessEventBus::shared();
        let (tx, _rx) = mpsc::unbounded_channel();
        let router = AgentRouter::new(persistence.clone(), bus.clone(), "replica-1", tx);
        struct NoopVoteSink;
        #[async_trait]
        impl VoteSink for NoopVoteSink {
            async fn submit_vote(&self, _: &str, _: u32, _: &str, _: Side) -> Result<(), VoteRejectionReason> {
                Ok(())
            }
        }
        let spectator = SpectatorLayer::new(persistence.clone(), bus.clone(), Arc::new(NoopVoteSink), "replica-1");
        let mut presets = PresetRegistry::new();
        presets.register(classic_preset());
        let orchestrator = Orchestrator::new(persistence.clone(), bus, router, spectator, presets, ArenaConfig::default());
        (orchestrator, persistence)
    }

    #[tokio::test]
    async fn start_from_pairing_persists_an_in_progress_contest() {
        let (orchestrator, persistence) = build_orchestrator().await;
        persistence.seed_agent(agent("pro-agent", 1500)).await;
        persistence.seed_agent(agent("con-agent", 1500)).await;

        let pairing = Pairing {
            pro: queue_entry("pro-agent"),
            con: queue_entry("con-agent"),
        };
        let contest_id = orchestrator
            .start_from_pairing(pairing, "classic".to_string(), "topic".to_string())
            .await
            .unwrap();

        // Give the spawned driver a moment to flip status to in_progress.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let contest = persistence.find_contest(&contest_id).await.unwrap().unwrap();
        assert_eq!(contest.status, ContestStatus::InProgress);

        orchestrator.cancel_contest(&contest_id).await.unwrap();
    }

    #[tokio::test]
    async fn replay_round_turns_reports_which_side_of_a_both_exchange_is_missing() {
        let (orchestrator, persistence) = build_orchestrator().await;
        persistence
            .create_contest(Contest::new("c1", "t", "classic", "pro-agent", "con-agent", 0, Utc::now()))
            .await
            .unwrap();
        // Exchange 0 completed in full; exchange 1 crashed after the pro
        // turn landed but before the con turn was requested.
        persistence
            .append_turn(Turn {
                contest_id: "c1".to_string(),
                round_index: 0,
                exchange_index: 0,
                position: Side::Pro,
                author_agent_id: "pro-agent".to_string(),
                content: "opening".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        persistence
            .append_turn(Turn {
                contest_id: "c1".to_string(),
                round_index: 0,
                exchange_index: 0,
                position: Side::Con,
                author_agent_id: "con-agent".to_string(),
                content: "rebuttal".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        persistence
            .append_turn(Turn {
                contest_id: "c1".to_string(),
                round_index: 0,
                exchange_index: 1,
                position: Side::Pro,
                author_agent_id: "pro-agent".to_string(),
                content: "second opening".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let already = orchestrator.replay_round_turns("c1", 0).await;

        assert!(already.contains(&(0, Side::Pro)));
        assert!(already.contains(&(0, Side::Con)));
        assert!(already.contains(&(1, Side::Pro)));
        assert!(!already.contains(&(1, Side::Con)));
    }

    #[tokio::test]
    async fn vote_rejected_when_round_index_does_not_match_current_round() {
        let (orchestrator, persistence) = build_orchestrator().await;
        persistence
            .create_contest(Contest::new("c1", "t", "classic", "pro", "con", 0, Utc::now()))
            .await
            .unwrap();
        let result = orchestrator.submit_vote("c1", 3, "voter-1", Side::Pro).await;
        assert_eq!(result, Err(VoteRejectionReason::WrongRound));
    }

    #[tokio::test]
    async fn vote_rejected_when_contest_not_in_progress() {
        let (orchestrator, persistence) = build_orchestrator().await;
        let mut contest = Contest::new("c1", "t", "classic", "pro", "con", 0, Utc::now());
        contest.status = ContestStatus::Pending;
        persistence.create_contest(contest).await.unwrap();
        let result = orchestrator.submit_vote("c1", 0, "voter-1", Side::Pro).await;
        assert_eq!(result, Err(VoteRejectionReason::NotOpen));
    }

    #[tokio::test]
    async fn forfeit_requires_requester_to_own_one_of_the_two_agents() {
        let (orchestrator, persistence) = build_orchestrator().await;
        persistence.seed_agent(agent("pro-agent", 1500)).await;
        persistence.seed_agent(agent("con-agent", 1500)).await;
        persistence
            .create_contest(Contest::new("c1", "t", "classic", "pro-agent", "con-agent", 0, Utc::now()))
            .await
            .unwrap();

        let result = orchestrator.request_forfeit("c1", "not-an-owner").await;
        assert!(matches!(result, Err(OrchestratorError::NotOwner)));
    }
}
