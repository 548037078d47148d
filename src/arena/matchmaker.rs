//! Matchmaker (C6): ELO/stake-bucketed pairing engine with widening
//! tolerance.
//!
//! Queue mutation is funneled through a single `tokio::sync::Mutex`-guarded
//! `Vec`, a small owned collection with its own mutation methods.

use crate::arena::model::QueueEntry;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// Effective-tolerance growth schedule: starts at `INITIAL_TOLERANCE`,
/// grows by `TOLERANCE_STEP` every `TOLERANCE_INTERVAL` of waiting, up to
/// `TOLERANCE_CEILING`.
pub const INITIAL_TOLERANCE: i64 = 100;
pub const TOLERANCE_STEP: i64 = 100;
pub const TOLERANCE_INTERVAL_SECONDS: i64 = 30;
pub const TOLERANCE_CEILING: i64 = 1000;

/// Effective tolerance for an entry that has waited `waited_seconds`.
pub fn effective_tolerance(waited_seconds: i64) -> i64 {
    let steps = (waited_seconds / TOLERANCE_INTERVAL_SECONDS).max(0);
    (INITIAL_TOLERANCE + steps * TOLERANCE_STEP).min(TOLERANCE_CEILING)
}

/// A compatible pair found by [`Matchmaker::find_pair`], with deterministic
/// side assignment already applied.
#[derive(Debug, Clone)]
pub struct Pairing {
    pub pro: QueueEntry,
    pub con: QueueEntry,
}

/// Rolling queue statistics exposed to callers.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub queue_size: usize,
    pub average_wait_seconds: f64,
}

/// In-memory matchmaking queue. No durable row backs a [`QueueEntry`].
pub struct Matchmaker {
    entries: Mutex<Vec<QueueEntry>>,
    recent_wait_seconds: Mutex<VecDeque<i64>>,
    /// Bound on the rolling wait-time window used for the mean of recent
    /// successful pairings.
    wait_window: usize,
}

impl Matchmaker {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            recent_wait_seconds: Mutex::new(VecDeque::new()),
            wait_window: 50,
        }
    }

    /// Add (or replace) a queue entry for `entry.agent_id`. Adding an
    /// entry for an already-queued agent replaces the old entry.
    pub async fn enqueue(&self, entry: QueueEntry) {
        let mut entries = self.entries.lock().await;
        entries.retain(|e| e.agent_id != entry.agent_id);
        entries.push(entry);
    }

    /// Remove `agent_id`'s entry, if any (e.g. on disconnect, deactivation,
    /// or deletion).
    pub async fn remove(&self, agent_id: &str) -> Option<QueueEntry> {
        let mut entries = self.entries.lock().await;
        let idx = entries.iter().position(|e| e.agent_id == agent_id)?;
        Some(entries.remove(idx))
    }

    pub async fn size(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Ids currently queued, for callers that need to pre-fetch ratings
    /// before calling [`Matchmaker::find_pair`] with a synchronous lookup.
    pub async fn queued_agent_ids(&self) -> Vec<String> {
        self.entries.lock().await.iter().map(|e| e.agent_id.clone()).collect()
    }

    /// Scan for the best compatible pair, by tie-break ordering:
    /// oldest-older-entry first, then smallest rating gap. `rating_of`
    /// looks up an agent's current rating (owned by the persistence
    /// gateway, not the queue itself). Does not remove the winning
    /// entries — callers call [`Matchmaker::remove_pair`] once the contest
    /// has actually been created, so both entries are atomically removed
    /// before the contest is announced.
    pub async fn find_pair<F>(&self, now: DateTime<Utc>, rating_of: F) -> Option<Pairing>
    where
        F: Fn(&str) -> i64,
    {
        let entries = self.entries.lock().await;
        let mut best: Option<(usize, usize, i64, i64)> = None; // (i, j, older_age, gap)

        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let (a, b) = (&entries[i], &entries[j]);
                if !compatible(a, b) {
                    continue;
                }
                let older = if a.enqueued_at <= b.enqueued_at { a } else { b };
                let age = (now - older.enqueued_at).num_seconds().max(0);
                let tolerance = effective_tolerance(age);
                let gap = (rating_of(&a.agent_id) - rating_of(&b.agent_id)).abs();
                if gap > tolerance {
                    continue;
                }
                let candidate_key = (age, gap);
                let is_better = match &best {
                    None => true,
                    Some((_, _, best_age, best_gap)) => {
                        candidate_key.0 > *best_age || (candidate_key.0 == *best_age && candidate_key.1 < *best_gap)
                    }
                };
                if is_better {
                    best = Some((i, j, age, gap));
                }
            }
        }

        best.map(|(i, j, _, _)| {
            let (first, second) = (entries[i].clone(), entries[j].clone());
            assign_sides(first, second, rating_of)
        })
    }

    /// Remove both paired entries; call only once the contest they pair
    /// into has been created.
    pub async fn remove_pair(&self, pairing: &Pairing) {
        let mut entries = self.entries.lock().await;
        entries.retain(|e| e.agent_id != pairing.pro.agent_id && e.agent_id != pairing.con.agent_id);
    }

    /// Record a successful pairing's wait time (the older entry's age) for
    /// the rolling average.
    pub async fn record_wait(&self, waited_seconds: i64) {
        let mut recent = self.recent_wait_seconds.lock().await;
        recent.push_back(waited_seconds);
        while recent.len() > self.wait_window {
            recent.pop_front();
        }
    }

    pub async fn stats(&self) -> QueueStats {
        let entries = self.entries.lock().await;
        let recent = self.recent_wait_seconds.lock().await;
        let average_wait_seconds = if recent.is_empty() {
            0.0
        } else {
            recent.iter().sum::<i64>() as f64 / recent.len() as f64
        };
        QueueStats {
            queue_size: entries.len(),
            average_wait_seconds,
        }
    }
}

impl Default for Matchmaker {
    fn default() -> Self {
        Self::new()
    }
}

fn compatible(a: &QueueEntry, b: &QueueEntry) -> bool {
    if a.agent_id == b.agent_id {
        return false;
    }
    if a.owner_id == b.owner_id && !(a.allow_same_owner || b.allow_same_owner) {
        return false;
    }
    if a.preset_id != b.preset_id {
        return false;
    }
    if a.stake_amount != b.stake_amount {
        return false;
    }
    true
}

/// Deterministic side assignment by agent id ordering, so identical
/// inputs always yield identical matches in tests.
fn assign_sides<F>(a: QueueEntry, b: QueueEntry, rating_of: F) -> Pairing
where
    F: Fn(&str) -> i64,
{
    let _ = &rating_of; // rating is used for compatibility, not side choice.
    if a.agent_id < b.agent_id {
        Pairing { pro: a, con: b }
    } else {
        Pairing { pro: b, con: a }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn entry(agent_id: &str, owner: &str, stake: u64, preset: &str, age_seconds: i64) -> QueueEntry {
        QueueEntry {
            agent_id: agent_id.to_string(),
            owner_id: owner.to_string(),
            stake_amount: stake,
            preset_id: preset.to_string(),
            enqueued_at: Utc::now() - ChronoDuration::seconds(age_seconds),
            allow_same_owner: false,
            expansions: 0,
        }
    }

    #[tokio::test]
    async fn requeueing_same_agent_replaces_prior_entry() {
        let mm = Matchmaker::new();
        mm.enqueue(entry("a1", "owner1", 100, "classic", 0)).await;
        mm.enqueue(entry("a1", "owner1", 200, "classic", 0)).await;
        assert_eq!(mm.size().await, 1);
    }

    #[tokio::test]
    async fn pairs_require_distinct_owners_matching_preset_and_stake() {
        let mm = Matchmaker::new();
        mm.enqueue(entry("a1", "owner1", 100, "classic", 0)).await;
        mm.enqueue(entry("a2", "owner1", 100, "classic", 0)).await;
        // Same owner, not allowed -> no pairing.
        assert!(mm.find_pair(Utc::now(), |_| 1500).await.is_none());

        mm.enqueue(entry("a3", "owner2", 100, "classic", 0)).await;
        let pairing = mm.find_pair(Utc::now(), |_| 1500).await.unwrap();
        assert_ne!(pairing.pro.owner_id, pairing.con.owner_id);
    }

    #[tokio::test]
    async fn rating_gap_beyond_tolerance_is_rejected() {
        let mm = Matchmaker::new();
        mm.enqueue(entry("a1", "owner1", 0, "classic", 0)).await;
        mm.enqueue(entry("a2", "owner2", 0, "classic", 0)).await;
        let rating_of = |id: &str| if id == "a1" { 1000 } else { 2000 };
        assert!(mm.find_pair(Utc::now(), rating_of).await.is_none());
    }

    #[tokio::test]
    async fn widened_tolerance_eventually_allows_pairing() {
        let mm = Matchmaker::new();
        // Older entry waited long enough that tolerance has expanded past the gap.
        mm.enqueue(entry("a1", "owner1", 0, "classic", 400)).await;
        mm.enqueue(entry("a2", "owner2", 0, "classic", 0)).await;
        let rating_of = |id: &str| if id == "a1" { 1000 } else { 1400 };
        let pairing = mm.find_pair(Utc::now(), rating_of).await;
        assert!(pairing.is_some());
    }

    #[tokio::test]
    async fn side_assignment_is_deterministic() {
        let mm = Matchmaker::new();
        mm.enqueue(entry("zeta", "owner1", 0, "classic", 0)).await;
        mm.enqueue(entry("alpha", "owner2", 0, "classic", 0)).await;
        let pairing = mm.find_pair(Utc::now(), |_| 1500).await.unwrap();
        assert_eq!(pairing.pro.agent_id, "alpha");
        assert_eq!(pairing.con.agent_id, "zeta");
    }

    #[tokio::test]
    async fn remove_pair_drops_both_entries() {
        let mm = Matchmaker::new();
        mm.enqueue(entry("a1", "owner1", 0, "classic", 0)).await;
        mm.enqueue(entry("a2", "owner2", 0, "classic", 0)).await;
        let pairing = mm.find_pair(Utc::now(), |_| 1500).await.unwrap();
        mm.remove_pair(&pairing).await;
        assert_eq!(mm.size().await, 0);
    }
}
