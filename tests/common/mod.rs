use arenacore::arena::bus::InProcessEventBus;
use arenacore::arena::config::ArenaConfig;
use arenacore::arena::context::ArenaContext;
use arenacore::arena::model::{Agent, Contest, ContestStatus, RoundSpec, RoundStatus, Speaker};
use arenacore::arena::persistence::{InMemoryPersistence, PersistenceGateway};
use std::sync::Arc;
use std::time::Duration;

/// A preset shaped like the "classic" 7-round format, but with a
/// sub-second prep delay and a short vote window so integration tests
/// don't spend real wall-clock minutes waiting on timers that exist to
/// give spectators and voters a chance to act, not to gate correctness.
pub fn fast_preset(id: &str, round_count: u32) -> arenacore::arena::model::FormatPreset {
    let rounds = (0..round_count)
        .map(|i| RoundSpec {
            name: format!("Round {}", i + 1),
            speaker: Speaker::Both,
            exchanges: 1,
            turn_time_limit_seconds: 5,
            word_limit: (0, 500),
            char_limit: (0, 2000),
        })
        .collect();
    arenacore::arena::model::FormatPreset {
        id: id.to_string(),
        name: "Fast".to_string(),
        prep_time_seconds: 0,
        vote_window_seconds: 1,
        rounds,
        win_condition: "Most rounds won".to_string(),
    }
}

pub fn agent(id: &str, owner: &str, rating: i64) -> Agent {
    Agent {
        id: id.to_string(),
        owner_id: owner.to_string(),
        display_name: id.to_string(),
        rating,
        wins: 0,
        losses: 0,
        active: true,
        connection_token: "0".repeat(64),
    }
}

/// Build a context with a fresh in-memory backend. Neither agent in these
/// tests holds an open socket, so every `send_request` fails immediately
/// with `NotConnected` and the driver records a sentinel-content Turn — a
/// convenient way to exercise the round/voting state machine without a
/// live socket client.
pub fn build_context(presets: arenacore::arena::config::PresetRegistry) -> Arc<ArenaContext> {
    let persistence = InMemoryPersistence::shared();
    let bus = InProcessEventBus::shared();
    let (context, _queue_rx) = ArenaContext::new(persistence, bus, ArenaConfig::default(), presets);
    context
}

/// Poll `find_contest` until `predicate` holds or `timeout` elapses.
pub async fn wait_for_contest(
    persistence: &Arc<dyn PersistenceGateway>,
    contest_id: &str,
    timeout: Duration,
    predicate: impl Fn(&Contest) -> bool,
) -> Contest {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(contest)) = persistence.find_contest(contest_id).await {
            if predicate(&contest) {
                return contest;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for contest {} to satisfy predicate", contest_id);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn is_voting_on(round_index: u32) -> impl Fn(&Contest) -> bool {
    move |c: &Contest| c.status == ContestStatus::InProgress && c.current_round_index == round_index && c.round_status == RoundStatus::Voting
}

pub fn is_completed() -> impl Fn(&Contest) -> bool {
    |c: &Contest| c.status == ContestStatus::Completed
}
