//! Wire protocol: closed, tagged-union message envelopes for the agent
//! socket and the spectator socket.
//!
//! Every envelope is a single `serde`-tagged enum keyed on `type`, rather
//! than dynamic untyped JSON. Deserializing an unrecognized `type` value
//! fails at the `serde_json` layer, and callers are expected to turn that
//! failure into [`crate::arena::error::ClientErrorCode::InvalidMessage`].

use crate::arena::error::ClientErrorCode;
use crate::arena::model::Side;
use serde::{Deserialize, Serialize};

/// Close codes used when the router rejects or replaces an agent
/// connection.
pub mod close_code {
    pub const INVALID_URL: u16 = 4001;
    pub const INVALID_TOKEN: u16 = 4002;
    pub const REPLACED: u16 = 4003;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordLimit {
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharLimit {
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PastMessage {
    pub round_index: u32,
    pub position: Side,
    pub content: String,
}

/// Server → Agent envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum AgentServerMessage {
    Connected {
        bot_id: String,
        bot_name: String,
    },
    Ping,
    DebateRequest {
        request_id: String,
        debate_id: String,
        round: String,
        topic: String,
        position: Side,
        opponent_last_message: Option<String>,
        time_limit_seconds: u64,
        word_limit: WordLimit,
        char_limit: CharLimit,
        messages_so_far: Vec<PastMessage>,
    },
    QueueJoined {
        queue_ids: Vec<String>,
        stake: u64,
        preset_ids: Vec<String>,
    },
    QueueLeft,
    QueueError {
        error: String,
    },
    DebateComplete {
        debate_id: String,
        won: Option<bool>,
        elo_change: i64,
    },
}

/// Agent → Server envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum AgentClientMessage {
    Pong,
    DebateResponse {
        request_id: String,
        message: String,
        confidence: Option<f32>,
    },
    /// Reserved for future streaming support; accepted but not acted on.
    ResponseChunk {
        request_id: String,
        text: String,
    },
    QueueJoin {
        stake: u64,
        preset_id: String,
    },
    QueueLeave,
}

/// Client → Server envelopes on the spectator socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum SpectatorClientMessage {
    JoinDebate {
        debate_id: String,
        user_id: Option<String>,
    },
    LeaveDebate,
    SubmitVote {
        debate_id: String,
        round_index: u32,
        choice: Side,
    },
    Ping,
}

/// Server → Client envelopes on the spectator socket. Each carries
/// `{type, debate_id, payload}`; `debate_id` is `None` for the
/// connection-scoped `pong`/`error` replies that precede any `join_debate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum SpectatorServerMessage {
    DebateStarted {
        debate_id: String,
        payload: LifecycleEvent,
    },
    DebateResumed {
        debate_id: String,
        payload: LifecycleEvent,
    },
    RoundStarted {
        debate_id: String,
        payload: LifecycleEvent,
    },
    BotTyping {
        debate_id: String,
        payload: LifecycleEvent,
    },
    BotMessage {
        debate_id: String,
        payload: LifecycleEvent,
    },
    VotingStarted {
        debate_id: String,
        payload: LifecycleEvent,
    },
    VoteUpdate {
        debate_id: String,
        payload: LifecycleEvent,
    },
    RoundEnded {
        debate_id: String,
        payload: LifecycleEvent,
    },
    DebateEnded {
        debate_id: String,
        payload: LifecycleEvent,
    },
    DebateForfeit {
        debate_id: String,
        payload: LifecycleEvent,
    },
    SpectatorCount {
        debate_id: String,
        payload: LifecycleEvent,
    },
    VoteAccepted {
        debate_id: String,
        payload: LifecycleEvent,
    },
    Error {
        debate_id: Option<String>,
        payload: ErrorPayload,
    },
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ClientErrorCode,
    pub message: String,
}

/// The payload carried by every contest lifecycle event, in publication
/// order:
/// `debate_started, [round_started, bot_typing?, bot_message+, voting_started,
/// vote_update*, round_ended]+, {debate_ended | debate_forfeit | error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    DebateStarted {
        topic: String,
        pro_agent_id: String,
        con_agent_id: String,
        preset_id: String,
    },
    DebateResumed {
        resume_round_index: u32,
        resume_round_status: String,
    },
    RoundStarted {
        round_index: u32,
        name: String,
    },
    BotTyping {
        round_index: u32,
        position: Side,
    },
    BotMessage {
        round_index: u32,
        position: Side,
        content: String,
    },
    VotingStarted {
        round_index: u32,
        window_seconds: u64,
    },
    VoteUpdate {
        round_index: u32,
        pro_votes: u32,
        con_votes: u32,
    },
    RoundEnded {
        round_index: u32,
        pro_votes: u32,
        con_votes: u32,
        winner: Option<Side>,
        overall_pro_wins: u32,
        overall_con_wins: u32,
    },
    DebateEnded {
        winner: Option<Side>,
        pro_rating_delta: i64,
        con_rating_delta: i64,
    },
    DebateForfeit {
        forfeited_by: Side,
        winner: Side,
    },
    SpectatorCount {
        count: u32,
    },
    VoteAccepted {
        round_index: u32,
        choice: Side,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_client_message_round_trips_debate_response() {
        let msg = AgentClientMessage::DebateResponse {
            request_id: "req-1".into(),
            message: "I argue that...".into(),
            confidence: Some(0.9),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"debate_response\""));
        let back: AgentClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            AgentClientMessage::DebateResponse { request_id, .. } => assert_eq!(request_id, "req-1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_tag_fails_to_deserialize() {
        let bad = r#"{"type":"not_a_real_message"}"#;
        let result: Result<AgentClientMessage, _> = serde_json::from_str(bad);
        assert!(result.is_err());
    }

    #[test]
    fn spectator_server_message_tags_error_with_stable_code() {
        let msg = SpectatorServerMessage::Error {
            debate_id: Some("c1".into()),
            payload: ErrorPayload {
                code: ClientErrorCode::WrongDebate,
                message: "wrong round".into(),
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["payload"]["code"], "WRONG_DEBATE");
    }
}
