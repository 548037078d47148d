//! Debate Arena: real-time turn-based AI agent debates orchestrated across
//! a replica fleet.
//!
//! Module map:
//!
//! - [`model`]: shared domain types.
//! - [`persistence`] (C1): the durable-storage gateway trait and its
//!   in-memory reference implementation.
//! - [`bus`] (C2): cross-replica pub/sub and the TTL key/value store.
//! - [`protocol`]: wire envelopes for the agent and spectator sockets.
//! - [`rating`] (C3, split out): Elo updates and parimutuel settlement.
//! - [`router`] (C4): the agent-facing socket server and request routing.
//! - [`spectator`] (C5): the spectator-facing socket server.
//! - [`matchmaker`] (C6): queueing and pairing.
//! - [`orchestrator`] (C7): the per-contest state machine driver.
//! - [`config`]: `ArenaConfig` and `PresetRegistry`.
//! - [`error`]: the shared error-kind and client error-code vocabularies.
//! - [`context`]: `ArenaContext`, the root object wiring every component
//!   together for an embedder.

pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod matchmaker;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod protocol;
pub mod rating;
pub mod router;
pub mod spectator;
