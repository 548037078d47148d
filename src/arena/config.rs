//! Configuration for the debate arena.
//!
//! A plain struct constructed directly by the embedder, with a `Default`
//! impl. No TOML/YAML/env-file parsing dependency is introduced —
//! environment variables are read at the call site with `std::env::var`.
//!
//! # Example
//!
//! ```rust
//! use arenacore::arena::config::{ArenaConfig, PresetRegistry};
//!
//! let config = ArenaConfig::default();
//! assert_eq!(config.bot_request_timeout_ceiling_seconds, 120);
//!
//! let registry = PresetRegistry::with_defaults();
//! assert!(registry.get("classic").is_some());
//! ```

use crate::arena::model::{FormatPreset, RoundSpec, Speaker};
use std::collections::HashMap;

/// Global configuration for the arena components.
///
/// This struct is intentionally minimal; users construct it however they
/// want (directly, or from their own env/file loader upstream of this
/// crate).
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// `None` implies single-replica mode.
    pub event_bus_url: Option<String>,
    /// Auto-generated if not supplied by the embedder.
    pub replica_id: String,
    /// Absolute ceiling on any single bot request, regardless of the
    /// round's own turn time limit. Default 120s.
    pub bot_request_timeout_ceiling_seconds: u64,
    /// Elo-style K-factor used by [`crate::arena::rating::update_ratings`].
    pub rating_k_factor: f64,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            event_bus_url: None,
            replica_id: uuid::Uuid::new_v4().to_string(),
            bot_request_timeout_ceiling_seconds: 120,
            rating_k_factor: crate::arena::rating::DEFAULT_K_FACTOR,
        }
    }
}

impl ArenaConfig {
    /// Build a config from environment variables: database URL (consumed
    /// by the embedder's own persistence wiring, not read here), event bus
    /// URL, replica id, bot request timeout ceiling, and rating K-factor.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("ARENA_EVENT_BUS_URL") {
            if !url.is_empty() {
                config.event_bus_url = Some(url);
            }
        }
        if let Ok(replica_id) = std::env::var("ARENA_REPLICA_ID") {
            if !replica_id.is_empty() {
                config.replica_id = replica_id;
            }
        }
        if let Ok(ceiling) = std::env::var("ARENA_BOT_TIMEOUT_CEILING_SECONDS") {
            if let Ok(parsed) = ceiling.parse() {
                config.bot_request_timeout_ceiling_seconds = parsed;
            }
        }
        if let Ok(k) = std::env::var("ARENA_RATING_K_FACTOR") {
            if let Ok(parsed) = k.parse() {
                config.rating_k_factor = parsed;
            }
        }
        config
    }
}

/// In-memory registry of [`FormatPreset`]s keyed by id.
#[derive(Debug, Clone, Default)]
pub struct PresetRegistry {
    presets: HashMap<String, FormatPreset>,
}

impl PresetRegistry {
    pub fn new() -> Self {
        Self {
            presets: HashMap::new(),
        }
    }

    /// A registry seeded with the "classic" 7-round preset.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(classic_preset());
        registry
    }

    pub fn register(&mut self, preset: FormatPreset) {
        self.presets.insert(preset.id.clone(), preset);
    }

    pub fn get(&self, id: &str) -> Option<&FormatPreset> {
        self.presets.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(|s| s.as_str())
    }
}

/// The "classic" preset: 7 rounds, both speakers, 30s prep, 60s vote
/// window.
pub fn classic_preset() -> FormatPreset {
    let round = |name: &str| RoundSpec {
        name: name.to_string(),
        speaker: Speaker::Both,
        exchanges: 1,
        turn_time_limit_seconds: 90,
        word_limit: (50, 400),
        char_limit: (200, 2000),
    };
    FormatPreset {
        id: "classic".to_string(),
        name: "Classic".to_string(),
        prep_time_seconds: 30,
        vote_window_seconds: 60,
        rounds: vec![
            round("Opening Statements"),
            round("Round 2"),
            round("Round 3"),
            round("Round 4"),
            round("Round 5"),
            round("Round 6"),
            round("Closing Statements"),
        ],
        win_condition: "Most rounds won by majority vote".to_string(),
    }
}
