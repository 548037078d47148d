//! Core domain types for the debate arena.
//!
//! These are plain, serde-derived records shared by every component in
//! [`crate::arena`] — the persistence gateway stores them, the orchestrator
//! mutates them, and the protocol layer serializes slices of them onto the
//! agent and spectator sockets.
//!
//! # Example
//!
//! ```rust
//! use arenacore::arena::model::{FormatPreset, RoundSpec, Speaker};
//!
//! let preset = FormatPreset {
//!     id: "classic".to_string(),
//!     name: "Classic".to_string(),
//!     prep_time_seconds: 30,
//!     vote_window_seconds: 60,
//!     rounds: vec![RoundSpec {
//!         name: "Opening Statements".to_string(),
//!         speaker: Speaker::Both,
//!         exchanges: 1,
//!         turn_time_limit_seconds: 90,
//!         word_limit: (50, 400),
//!         char_limit: (200, 2000),
//!     }],
//!     win_condition: "Most rounds won".to_string(),
//! };
//!
//! assert_eq!(preset.rounds.len(), 1);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two sides of a contest, as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Pro,
    Con,
}

impl Side {
    /// The other side.
    pub fn opposite(self) -> Side {
        match self {
            Side::Pro => Side::Con,
            Side::Con => Side::Pro,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Pro => write!(f, "pro"),
            Side::Con => write!(f, "con"),
        }
    }
}

/// Who speaks during a round: one side, or both in pro-then-con order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Pro,
    Con,
    Both,
}

/// An outcome that may resolve to a tie rather than either side winning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Pro,
    Con,
    None,
}

impl Winner {
    /// Strictly-greater-count comparison used for both round tallies and the
    /// overall score.
    pub fn from_counts(pro: u32, con: u32) -> Winner {
        match pro.cmp(&con) {
            std::cmp::Ordering::Greater => Winner::Pro,
            std::cmp::Ordering::Less => Winner::Con,
            std::cmp::Ordering::Equal => Winner::None,
        }
    }

    pub fn as_side(self) -> Option<Side> {
        match self {
            Winner::Pro => Some(Side::Pro),
            Winner::Con => Some(Side::Con),
            Winner::None => None,
        }
    }
}

/// Top-level contest lifecycle, monotonic for the life of a contest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContestStatus {
    Pending,
    InProgress,
    Voting,
    Completed,
    Cancelled,
}

/// Per-round status, cycling within `ContestStatus::InProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    BotResponding,
    Voting,
    Completed,
}

/// One named step of a [`FormatPreset`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSpec {
    pub name: String,
    pub speaker: Speaker,
    /// Number of question/answer exchanges this round contains. Defaults to
    /// 1 in preset construction helpers; must be >= 1.
    pub exchanges: u32,
    pub turn_time_limit_seconds: u64,
    /// (min, max) inclusive word count bounds.
    pub word_limit: (u32, u32),
    /// (min, max) inclusive character count bounds.
    pub char_limit: (u32, u32),
}

impl RoundSpec {
    /// Number of turns this round produces:
    /// `exchanges * (1 if single-speaker else 2)`.
    pub fn turn_count(&self) -> u32 {
        self.exchanges * if self.speaker == Speaker::Both { 2 } else { 1 }
    }
}

/// Immutable configuration referenced by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatPreset {
    pub id: String,
    pub name: String,
    pub prep_time_seconds: u64,
    pub vote_window_seconds: u64,
    pub rounds: Vec<RoundSpec>,
    /// Informational only; not consulted by the state machine.
    pub win_condition: String,
}

/// A remote worker holding a persistent inbound socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub owner_id: String,
    pub display_name: String,
    pub rating: i64,
    pub wins: u32,
    pub losses: u32,
    pub active: bool,
    /// High-entropy secret identifying this agent's socket session. Never
    /// logged or echoed back to spectators.
    pub connection_token: String,
}

/// A single produced message by one agent within a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub contest_id: String,
    pub round_index: u32,
    /// Position within the round's exchange sequence; this, together with
    /// `round_index`, is the literal re-request guard used when resuming a
    /// crashed driver.
    pub exchange_index: u32,
    pub position: Side,
    pub author_agent_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Per-round tally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub round_index: u32,
    pub pro_votes: u32,
    pub con_votes: u32,
    pub winner: Winner,
}

impl RoundOutcome {
    pub fn new(round_index: u32, pro_votes: u32, con_votes: u32) -> Self {
        Self {
            round_index,
            pro_votes,
            con_votes,
            winner: Winner::from_counts(pro_votes, con_votes),
        }
    }
}

/// `(contest, round index, voter id, choice)` with at most one live entry
/// per `(contest, round, voter)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectatorVote {
    pub contest_id: String,
    pub round_index: u32,
    pub voter_id: String,
    pub choice: Side,
}

/// A wager on a contest outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub contest_id: String,
    pub bettor_id: String,
    pub side: Side,
    /// Minor units; non-negative.
    pub amount: u64,
    pub settled: bool,
    pub payout: u64,
}

/// The root entity: one scheduled interaction between two agents through a
/// fixed preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contest {
    pub id: String,
    pub topic: String,
    pub preset_id: String,
    pub pro_agent_id: String,
    pub con_agent_id: String,
    pub status: ContestStatus,
    pub current_round_index: u32,
    pub round_status: RoundStatus,
    pub round_outcomes: Vec<RoundOutcome>,
    pub winner: Winner,
    /// Non-negative, minor units.
    pub stake_amount: u64,
    pub spectator_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Contest {
    pub fn new(
        id: impl Into<String>,
        topic: impl Into<String>,
        preset_id: impl Into<String>,
        pro_agent_id: impl Into<String>,
        con_agent_id: impl Into<String>,
        stake_amount: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            preset_id: preset_id.into(),
            pro_agent_id: pro_agent_id.into(),
            con_agent_id: con_agent_id.into(),
            status: ContestStatus::Pending,
            current_round_index: 0,
            round_status: RoundStatus::Pending,
            round_outcomes: Vec::new(),
            winner: Winner::None,
            stake_amount,
            spectator_count: 0,
            created_at,
            started_at: None,
            ended_at: None,
        }
    }

    /// Agent id occupying `side` in this contest.
    pub fn agent_id(&self, side: Side) -> &str {
        match side {
            Side::Pro => &self.pro_agent_id,
            Side::Con => &self.con_agent_id,
        }
    }

    /// Count of rounds won by each side so far (ties counted toward
    /// neither).
    pub fn round_wins(&self) -> (u32, u32) {
        let pro = self
            .round_outcomes
            .iter()
            .filter(|r| r.winner == Winner::Pro)
            .count() as u32;
        let con = self
            .round_outcomes
            .iter()
            .filter(|r| r.winner == Winner::Con)
            .count() as u32;
        (pro, con)
    }
}

/// An entry waiting in the matchmaker's in-memory queue. Never persisted.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub agent_id: String,
    pub owner_id: String,
    pub stake_amount: u64,
    pub preset_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub allow_same_owner: bool,
    /// Number of tolerance-expansion steps applied so far.
    pub expansions: u32,
}
