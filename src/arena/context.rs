//! Root wiring object: one object an embedder constructs once per process
//! in place of module-scoped singletons.
//!
//! A builder that owns `Arc`-shared components and assembles them into a
//! running server. [`ArenaContext`] plays that role for this crate:
//! construct it once, call [`ArenaContext::spawn_background_tasks`], mount
//! [`ArenaContext::axum_router`], and every socket route and background task
//! is already wired.

use crate::arena::bus::EventBus;
use crate::arena::config::{ArenaConfig, PresetRegistry};
use crate::arena::error::VoteRejectionReason;
use crate::arena::matchmaker::Matchmaker;
use crate::arena::model::Side;
use crate::arena::orchestrator::Orchestrator;
use crate::arena::persistence::PersistenceGateway;
use crate::arena::router::{AgentRouter, QueueCommand};
use crate::arena::spectator::{SpectatorLayer, VoteSink};
use async_trait::async_trait;
use axum::Router;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Forwards vote submissions to whichever [`Orchestrator`] is installed.
/// Exists only to break the constructor cycle between
/// [`SpectatorLayer`] (which needs a [`VoteSink`] at construction) and
/// [`Orchestrator`] (which needs the already-built [`SpectatorLayer`]).
struct DeferredVoteSink {
    orchestrator: RwLock<Option<Arc<Orchestrator>>>,
}

impl DeferredVoteSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            orchestrator: RwLock::new(None),
        })
    }

    /// Install the orchestrator. Called once, synchronously, immediately
    /// after construction in [`ArenaContext::new`] — the lock is brand new
    /// and uncontended, so `try_write` always succeeds.
    fn install_sync(&self, orchestrator: Arc<Orchestrator>) -> bool {
        match self.orchestrator.try_write() {
            Ok(mut guard) => {
                *guard = Some(orchestrator);
                true
            }
            Err(_) => false,
        }
    }
}

#[async_trait]
impl VoteSink for DeferredVoteSink {
    async fn submit_vote(
        &self,
        contest_id: &str,
        round_index: u32,
        voter_id: &str,
        choice: Side,
    ) -> Result<(), VoteRejectionReason> {
        match self.orchestrator.read().await.as_ref() {
            Some(orchestrator) => orchestrator.submit_vote(contest_id, round_index, voter_id, choice).await,
            None => Err(VoteRejectionReason::NotFound),
        }
    }
}

/// Owns one instance of every component and exposes the combined
/// `axum::Router` an embedder mounts.
pub struct ArenaContext {
    pub persistence: Arc<dyn PersistenceGateway>,
    pub bus: Arc<dyn EventBus>,
    pub router: Arc<AgentRouter>,
    pub spectator: Arc<SpectatorLayer>,
    pub matchmaker: Arc<Matchmaker>,
    pub orchestrator: Arc<Orchestrator>,
    pub config: ArenaConfig,
}

impl ArenaContext {
    /// Wire every component together. `presets` is consulted by the
    /// orchestrator and by whatever queue-join handling an embedder layers
    /// on top of [`ArenaContext::queue_commands`].
    pub fn new(
        persistence: Arc<dyn PersistenceGateway>,
        bus: Arc<dyn EventBus>,
        config: ArenaConfig,
        presets: PresetRegistry,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<QueueCommand>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let router = AgentRouter::new(persistence.clone(), bus.clone(), config.replica_id.clone(), queue_tx);

        let deferred_vote_sink = DeferredVoteSink::new();
        let spectator = SpectatorLayer::new(persistence.clone(), bus.clone(), deferred_vote_sink.clone(), config.replica_id.clone());

        let matchmaker = Arc::new(Matchmaker::new());

        let orchestrator = Orchestrator::new(
            persistence.clone(),
            bus.clone(),
            router.clone(),
            spectator.clone(),
            presets,
            config.clone(),
        );

        let installed = deferred_vote_sink.install_sync(orchestrator.clone());
        debug_assert!(installed, "deferred vote sink lock is uncontended at construction time");

        let context = Arc::new(Self {
            persistence,
            bus,
            router,
            spectator,
            matchmaker,
            orchestrator,
            config,
        });
        (context, queue_rx)
    }

    /// The combined socket surface: `/agent/{token}` and `/spectator`.
    pub fn axum_router(&self) -> Router {
        self.router.clone().axum_router().merge(self.spectator.clone().axum_router())
    }

    /// Launch the background tasks that keep the fleet alive: agent
    /// liveness pings and startup recovery of contests left `in_progress`
    /// by a dead driver.
    pub async fn spawn_background_tasks(self: &Arc<Self>) {
        let router = self.router.clone();
        tokio::spawn(async move {
            router.run_liveness_loop().await;
        });

        let orchestrator = self.orchestrator.clone();
        orchestrator.recover_stuck_contests().await;
    }

    /// Gracefully stop every component in response to an externally
    /// driven shutdown signal. Open agent and spectator sockets close, and
    /// in-flight contest drivers return without finalizing — persisted
    /// state is left exactly as it stood, so a fresh process picks every
    /// in-progress contest back up via
    /// [`Orchestrator::recover_stuck_contests`].
    pub async fn shutdown(&self) {
        self.router.shutdown();
        self.spectator.shutdown();
        self.orchestrator.shutdown().await;
    }
}
