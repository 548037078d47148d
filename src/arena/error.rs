//! Error kinds shared across the arena components.
//!
//! Each component keeps its own richer error enum (see
//! [`crate::arena::persistence::PersistenceError`],
//! [`crate::arena::router::RouterError`], ...) but every one of them can be
//! classified into the small closed [`ArenaErrorKind`] set, which is what
//! gets logged and what the orchestrator's propagation policy switches on.
//!
//! # Example
//!
//! ```rust
//! use arenacore::arena::error::ArenaErrorKind;
//!
//! let kind = ArenaErrorKind::AgentTimeout;
//! assert_eq!(kind.to_string(), "agent-timeout");
//! assert!(kind.is_turn_local());
//! ```

use std::error::Error;
use std::fmt;

/// The seven error kinds recognized across the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaErrorKind {
    TransientBus,
    TransientStorage,
    AgentTimeout,
    AgentProtocol,
    AgentUnavailable,
    InvalidClientRequest,
    OwnershipViolation,
    InvariantViolation,
}

impl ArenaErrorKind {
    /// Whether this kind is localized to a single turn (the contest
    /// proceeds) rather than aborting the whole contest.
    pub fn is_turn_local(self) -> bool {
        matches!(
            self,
            ArenaErrorKind::AgentTimeout | ArenaErrorKind::AgentProtocol | ArenaErrorKind::AgentUnavailable
        )
    }
}

impl fmt::Display for ArenaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArenaErrorKind::TransientBus => "transient-bus",
            ArenaErrorKind::TransientStorage => "transient-storage",
            ArenaErrorKind::AgentTimeout => "agent-timeout",
            ArenaErrorKind::AgentProtocol => "agent-protocol",
            ArenaErrorKind::AgentUnavailable => "agent-unavailable",
            ArenaErrorKind::InvalidClientRequest => "invalid-client-request",
            ArenaErrorKind::OwnershipViolation => "ownership-violation",
            ArenaErrorKind::InvariantViolation => "invariant-violation",
        };
        write!(f, "{}", s)
    }
}

impl Error for ArenaErrorKind {}

/// Stable error-code vocabulary sent to clients in `error{code,message}`
/// envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ClientErrorCode {
    #[serde(rename = "INVALID_MESSAGE")]
    InvalidMessage,
    #[serde(rename = "INVALID_DEBATE_ID")]
    InvalidDebateId,
    #[serde(rename = "WRONG_DEBATE")]
    WrongDebate,
    #[serde(rename = "NOT_AUTHENTICATED")]
    NotAuthenticated,
    #[serde(rename = "INVALID_VOTE")]
    InvalidVote,
    #[serde(rename = "VOTE_FAILED")]
    VoteFailed,
    #[serde(rename = "DEBATE_CANCELLED")]
    DebateCancelled,
}

/// Discriminated reasons a submitted vote can be rejected by vote
/// admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteRejectionReason {
    WrongRound,
    NotOpen,
    AlreadyVoted,
    NotFound,
}
