//! Persistence Gateway (C1): the narrow interface to durable storage.
//!
//! `PersistenceGateway` is the *only* write path for contest status, round
//! outcomes, turns, and votes. Every status-mutating call takes the
//! caller's expected prior status and fails loudly on mismatch — the
//! concurrency fence against a split-brain orchestrator.
//!
//! [`InMemoryPersistence`] is the reference implementation used by this
//! crate's own tests and by embedders who haven't wired a relational store
//! yet. A relational storage access layer is an external collaborator;
//! this type is deliberately not that.

use crate::arena::model::{Agent, Bet, Contest, ContestStatus, RoundOutcome, Side, SpectatorVote, Turn};
use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub enum PersistenceError {
    NotFound(String),
    /// The caller's expected prior status did not match storage — the
    /// optimistic concurrency fence tripped.
    StatusMismatch { expected: ContestStatus, actual: ContestStatus },
    Backend(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::NotFound(id) => write!(f, "not found: {}", id),
            PersistenceError::StatusMismatch { expected, actual } => write!(
                f,
                "status fence failed: expected {:?}, found {:?}",
                expected, actual
            ),
            PersistenceError::Backend(msg) => write!(f, "storage backend error: {}", msg),
        }
    }
}

impl Error for PersistenceError {}

/// Result of [`PersistenceGateway::cast_vote`]: whether the vote was newly
/// recorded, or already present (idempotent no-op / rejection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastVoteOutcome {
    Recorded,
    /// A prior vote for this `(contest, round, voter)` exists with the same
    /// choice — a no-op.
    AlreadyVotedSameChoice,
    /// A prior vote exists with a different choice — rejected.
    AlreadyVotedDifferentChoice,
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn create_contest(&self, contest: Contest) -> Result<(), PersistenceError>;

    /// Transition `contest_id`'s status, fencing on `expected_status`.
    async fn update_contest_status(
        &self,
        contest_id: &str,
        expected_status: ContestStatus,
        mutate: Box<dyn FnOnce(&mut Contest) + Send>,
    ) -> Result<(), PersistenceError>;

    async fn append_turn(&self, turn: Turn) -> Result<(), PersistenceError>;

    async fn append_round_outcome(
        &self,
        contest_id: &str,
        outcome: RoundOutcome,
    ) -> Result<(), PersistenceError>;

    async fn cast_vote(&self, vote: SpectatorVote) -> Result<CastVoteOutcome, PersistenceError>;

    /// Current `(pro_count, con_count)` for `(contest, round)`.
    async fn tally_round_votes(&self, contest_id: &str, round_index: u32) -> Result<(u32, u32), PersistenceError>;

    async fn find_contest(&self, contest_id: &str) -> Result<Option<Contest>, PersistenceError>;

    async fn turns_for_contest(&self, contest_id: &str) -> Result<Vec<Turn>, PersistenceError>;

    async fn list_recent_contests(&self, limit: usize) -> Result<Vec<Contest>, PersistenceError>;

    async fn find_agent(&self, agent_id: &str) -> Result<Option<Agent>, PersistenceError>;

    /// Look up an agent by its socket connection token. The router
    /// authenticates inbound connections against this, not the agent id.
    async fn find_agent_by_token(&self, token: &str) -> Result<Option<Agent>, PersistenceError>;

    async fn update_agent(&self, agent: Agent) -> Result<(), PersistenceError>;

    async fn create_bet(&self, bet: Bet) -> Result<(), PersistenceError>;

    async fn bets_for_contest(&self, contest_id: &str) -> Result<Vec<Bet>, PersistenceError>;

    async fn settle_bets(&self, contest_id: &str, payouts: HashMap<String, u64>) -> Result<(), PersistenceError>;
}

/// In-memory `Arc<RwLock<...>>`-guarded implementation: append-only
/// `Vec`s for turns/votes/bets, a `HashMap` registry for contests/agents.
#[derive(Default)]
pub struct InMemoryPersistence {
    contests: RwLock<HashMap<String, Contest>>,
    turns: RwLock<Vec<Turn>>,
    votes: RwLock<Vec<SpectatorVote>>,
    agents: RwLock<HashMap<String, Agent>>,
    bets: RwLock<Vec<Bet>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Test/bootstrap helper: seed an agent directly.
    pub async fn seed_agent(&self, agent: Agent) {
        self.agents.write().await.insert(agent.id.clone(), agent);
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryPersistence {
    async fn create_contest(&self, contest: Contest) -> Result<(), PersistenceError> {
        self.contests.write().await.insert(contest.id.clone(), contest);
        Ok(())
    }

    async fn update_contest_status(
        &self,
        contest_id: &str,
        expected_status: ContestStatus,
        mutate: Box<dyn FnOnce(&mut Contest) + Send>,
    ) -> Result<(), PersistenceError> {
        let mut contests = self.contests.write().await;
        let contest = contests
            .get_mut(contest_id)
            .ok_or_else(|| PersistenceError::NotFound(contest_id.to_string()))?;
        if contest.status != expected_status {
            return Err(PersistenceError::StatusMismatch {
                expected: expected_status,
                actual: contest.status,
            });
        }
        mutate(contest);
        Ok(())
    }

    async fn append_turn(&self, turn: Turn) -> Result<(), PersistenceError> {
        self.turns.write().await.push(turn);
        Ok(())
    }

    async fn append_round_outcome(
        &self,
        contest_id: &str,
        outcome: RoundOutcome,
    ) -> Result<(), PersistenceError> {
        let mut contests = self.contests.write().await;
        let contest = contests
            .get_mut(contest_id)
            .ok_or_else(|| PersistenceError::NotFound(contest_id.to_string()))?;
        contest.round_outcomes.push(outcome);
        Ok(())
    }

    async fn cast_vote(&self, vote: SpectatorVote) -> Result<CastVoteOutcome, PersistenceError> {
        let mut votes = self.votes.write().await;
        if let Some(existing) = votes.iter().find(|v| {
            v.contest_id == vote.contest_id && v.round_index == vote.round_index && v.voter_id == vote.voter_id
        }) {
            return Ok(if existing.choice == vote.choice {
                CastVoteOutcome::AlreadyVotedSameChoice
            } else {
                CastVoteOutcome::AlreadyVotedDifferentChoice
            });
        }
        votes.push(vote);
        Ok(CastVoteOutcome::Recorded)
    }

    async fn tally_round_votes(&self, contest_id: &str, round_index: u32) -> Result<(u32, u32), PersistenceError> {
        let votes = self.votes.read().await;
        let mut pro = 0;
        let mut con = 0;
        for v in votes.iter().filter(|v| v.contest_id == contest_id && v.round_index == round_index) {
            match v.choice {
                Side::Pro => pro += 1,
                Side::Con => con += 1,
            }
        }
        Ok((pro, con))
    }

    async fn find_contest(&self, contest_id: &str) -> Result<Option<Contest>, PersistenceError> {
        Ok(self.contests.read().await.get(contest_id).cloned())
    }

    async fn turns_for_contest(&self, contest_id: &str) -> Result<Vec<Turn>, PersistenceError> {
        let turns = self.turns.read().await;
        let mut matching: Vec<Turn> = turns.iter().filter(|t| t.contest_id == contest_id).cloned().collect();
        matching.sort_by_key(|t| (t.round_index, t.exchange_index));
        Ok(matching)
    }

    async fn list_recent_contests(&self, limit: usize) -> Result<Vec<Contest>, PersistenceError> {
        let contests = self.contests.read().await;
        let mut all: Vec<Contest> = contests.values().cloned().collect();
        all.sort_by_key(|c| std::cmp::Reverse(c.created_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn find_agent(&self, agent_id: &str) -> Result<Option<Agent>, PersistenceError> {
        Ok(self.agents.read().await.get(agent_id).cloned())
    }

    async fn find_agent_by_token(&self, token: &str) -> Result<Option<Agent>, PersistenceError> {
        // Token bytes are compared in constant time so a connected socket
        // can't use response timing to probe for a valid prefix.
        let token = token.as_bytes();
        Ok(self
            .agents
            .read()
            .await
            .values()
            .find(|a| bool::from(a.connection_token.as_bytes().ct_eq(token)))
            .cloned())
    }

    async fn update_agent(&self, agent: Agent) -> Result<(), PersistenceError> {
        self.agents.write().await.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn create_bet(&self, bet: Bet) -> Result<(), PersistenceError> {
        self.bets.write().await.push(bet);
        Ok(())
    }

    async fn bets_for_contest(&self, contest_id: &str) -> Result<Vec<Bet>, PersistenceError> {
        Ok(self.bets.read().await.iter().filter(|b| b.contest_id == contest_id).cloned().collect())
    }

    async fn settle_bets(&self, contest_id: &str, payouts: HashMap<String, u64>) -> Result<(), PersistenceError> {
        let mut bets = self.bets.write().await;
        for bet in bets.iter_mut().filter(|b| b.contest_id == contest_id) {
            bet.settled = true;
            bet.payout = payouts.get(&bet.bettor_id).copied().unwrap_or(0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::model::{Contest, Winner};
    use chrono::Utc;

    fn contest() -> Contest {
        Contest::new("c1", "topic", "classic", "pro-agent", "con-agent", 0, Utc::now())
    }

    #[tokio::test]
    async fn find_agent_by_token_looks_up_by_token_not_id() {
        let store = InMemoryPersistence::new();
        store
            .seed_agent(Agent {
                id: "agent-1".into(),
                owner_id: "owner-1".into(),
                display_name: "Debater".into(),
                rating: 1500,
                wins: 0,
                losses: 0,
                active: true,
                connection_token: "a".repeat(64),
            })
            .await;

        assert!(store.find_agent("a".repeat(64).as_str()).await.unwrap().is_none());
        let found = store.find_agent_by_token(&"a".repeat(64)).await.unwrap().unwrap();
        assert_eq!(found.id, "agent-1");
    }

    #[tokio::test]
    async fn status_fence_rejects_mismatched_prior_status() {
        let store = InMemoryPersistence::new();
        store.create_contest(contest()).await.unwrap();

        let result = store
            .update_contest_status(
                "c1",
                ContestStatus::InProgress,
                Box::new(|c| c.status = ContestStatus::Voting),
            )
            .await;
        assert!(matches!(result, Err(PersistenceError::StatusMismatch { .. })));

        store
            .update_contest_status("c1", ContestStatus::Pending, Box::new(|c| c.status = ContestStatus::InProgress))
            .await
            .unwrap();
        let loaded = store.find_contest("c1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ContestStatus::InProgress);
    }

    #[tokio::test]
    async fn cast_vote_is_idempotent_on_same_choice_and_rejects_change() {
        let store = InMemoryPersistence::new();
        let vote = SpectatorVote {
            contest_id: "c1".into(),
            round_index: 0,
            voter_id: "v1".into(),
            choice: Side::Pro,
        };
        assert_eq!(store.cast_vote(vote.clone()).await.unwrap(), CastVoteOutcome::Recorded);
        assert_eq!(
            store.cast_vote(vote.clone()).await.unwrap(),
            CastVoteOutcome::AlreadyVotedSameChoice
        );

        let mut changed = vote;
        changed.choice = Side::Con;
        assert_eq!(
            store.cast_vote(changed).await.unwrap(),
            CastVoteOutcome::AlreadyVotedDifferentChoice
        );

        let (pro, con) = store.tally_round_votes("c1", 0).await.unwrap();
        assert_eq!((pro, con), (1, 0));
    }

    #[tokio::test]
    async fn append_round_outcome_accumulates_on_contest() {
        let store = InMemoryPersistence::new();
        store.create_contest(contest()).await.unwrap();
        store
            .append_round_outcome("c1", RoundOutcome::new(0, 10, 5))
            .await
            .unwrap();
        let loaded = store.find_contest("c1").await.unwrap().unwrap();
        assert_eq!(loaded.round_outcomes.len(), 1);
        assert_eq!(loaded.round_outcomes[0].winner, Winner::Pro);
    }
}
