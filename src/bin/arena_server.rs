//! Standalone binary wiring one `ArenaContext` to a listening socket. This
//! is the embedder this crate otherwise leaves unwritten: an operator who
//! just wants the arena running as a process, not linked into a larger
//! service.
//!
//! ```bash
//! ARENA_REPLICA_ID=replica-1 cargo run --bin arena_server
//! ```

use arenacore::arena::config::{ArenaConfig, PresetRegistry};
use arenacore::arena::context::ArenaContext;
use arenacore::arena::bus::InProcessEventBus;
use arenacore::arena::persistence::InMemoryPersistence;
use arenacore::arena::router::QueueCommand;
use chrono::Utc;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Drains `queue_join`/`queue_leave` commands off the router and feeds the
/// matchmaker, starting a contest through the orchestrator whenever a
/// compatible pair turns up.
async fn run_matchmaking_loop(context: std::sync::Arc<ArenaContext>, mut queue_rx: tokio::sync::mpsc::UnboundedReceiver<QueueCommand>) {
    use arenacore::arena::model::QueueEntry;

    loop {
        tokio::select! {
            command = queue_rx.recv() => {
                match command {
                    Some(QueueCommand::Join { agent_id, stake, preset_id }) => {
                        let owner_id = match context.persistence.find_agent(&agent_id).await {
                            Ok(Some(agent)) => agent.owner_id,
                            _ => {
                                log::warn!("arena_server: queue_join for unknown agent {}", agent_id);
                                context.router.notify_queue_error(&agent_id, "unknown agent".to_string()).await;
                                continue;
                            }
                        };
                        context
                            .matchmaker
                            .enqueue(QueueEntry {
                                agent_id: agent_id.clone(),
                                owner_id,
                                stake_amount: stake,
                                preset_id: preset_id.clone(),
                                enqueued_at: Utc::now(),
                                allow_same_owner: false,
                                expansions: 0,
                            })
                            .await;
                        context
                            .router
                            .notify_queue_joined(&agent_id, vec![agent_id.clone()], stake, vec![preset_id])
                            .await;
                    }
                    Some(QueueCommand::Leave { agent_id }) => {
                        context.matchmaker.remove(&agent_id).await;
                        context.router.notify_queue_left(&agent_id).await;
                    }
                    None => return,
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
        }

        // `find_pair`'s tie-break needs a synchronous rating lookup, so
        // snapshot the queued agents' ratings once per scan rather than
        // threading an async call through the comparator.
        let mut ratings = std::collections::HashMap::new();
        for agent_id in context.matchmaker.queued_agent_ids().await {
            let rating = context.persistence.find_agent(&agent_id).await.ok().flatten().map(|a| a.rating).unwrap_or(1500);
            ratings.insert(agent_id, rating);
        }
        let rating_of = |agent_id: &str| -> i64 { *ratings.get(agent_id).unwrap_or(&1500) };
        while let Some(pairing) = context.matchmaker.find_pair(Utc::now(), rating_of).await {
            context.matchmaker.remove_pair(&pairing).await;
            let older_enqueued_at = pairing.pro.enqueued_at.min(pairing.con.enqueued_at);
            let waited_seconds = (Utc::now() - older_enqueued_at).num_seconds().max(0);
            context.matchmaker.record_wait(waited_seconds).await;
            let preset_id = pairing.pro.preset_id.clone();
            match context.orchestrator.start_from_pairing(pairing, preset_id, "Untitled debate".to_string()).await {
                Ok(contest_id) => log::info!("arena_server: started contest {}", contest_id),
                Err(err) => log::error!("arena_server: failed to start contest: {}", err),
            }
        }

        let stats = context.matchmaker.stats().await;
        log::debug!("arena_server: queue_size={} average_wait_seconds={:.1}", stats.queue_size, stats.average_wait_seconds);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = ArenaConfig::from_env();
    let persistence = InMemoryPersistence::shared();
    let bus = InProcessEventBus::shared();
    let presets = PresetRegistry::with_defaults();

    let (context, queue_rx) = ArenaContext::new(persistence, bus, config.clone(), presets);
    context.spawn_background_tasks().await;
    tokio::spawn(run_matchmaking_loop(context.clone(), queue_rx));

    let addr: SocketAddr = std::env::var("ARENA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8070".to_string()).parse()?;
    let listener = TcpListener::bind(addr).await?;
    log::info!("arena_server: replica {} listening on {}", config.replica_id, addr);

    let shutdown_context = context.clone();
    axum::serve(listener, context.axum_router())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("arena_server: ctrl-c received, shutting down");
            shutdown_context.shutdown().await;
        })
        .await?;
    Ok(())
}
