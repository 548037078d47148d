//! Event Bus (C2): cross-replica publish/subscribe abstraction.
//!
//! The bus is never authoritative state — [`crate::arena::persistence`]
//! holds all durable truth. When the bus is unreachable the system degrades
//! to single-replica mode, logging a warning: in-process fan-out substitutes
//! pub/sub, cross-replica routing is unavailable, and spectator totals use
//! the local count only.
//!
//! [`InProcessEventBus`] is that single-replica substitute and this crate's
//! only shipped implementation — an external (e.g. Redis-backed) bus is an
//! embedder concern behind the same [`EventBus`] trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};

/// A bus message: a channel key plus its JSON payload with the closed
/// `type` discriminator already embedded. The set of message types is
/// closed.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish `payload` on `channel`. Never blocks on subscriber presence.
    async fn publish(&self, channel: &str, payload: serde_json::Value);

    /// Subscribe to `channel`; returns a receiver that only ever sees
    /// messages published after this call.
    async fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage>;

    /// Set `key` to `value` with `ttl`, refreshing if already present.
    async fn kv_set(&self, key: &str, value: String, ttl: Duration);

    /// Read `key`, returning `None` if absent or expired.
    async fn kv_get(&self, key: &str) -> Option<String>;

    /// Remove `key` immediately (used on deliberate disconnect/leave).
    async fn kv_delete(&self, key: &str);

    /// Whether this bus is a local in-process substitute for single-replica
    /// degradation rather than a real cross-replica transport.
    fn is_single_replica(&self) -> bool;
}

struct TtlEntry {
    value: String,
    expires_at: Instant,
}

/// In-process substitute for a real pub/sub transport. Every channel is
/// lazily created on first `publish`/`subscribe` and backed by a
/// `tokio::sync::broadcast` channel, with the key/value side stored in an
/// `Arc<RwLock<HashMap<...>>>`.
pub struct InProcessEventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    kv: RwLock<HashMap<String, TtlEntry>>,
    channel_capacity: usize,
}

impl InProcessEventBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            kv: RwLock::new(HashMap::new()),
            channel_capacity: 256,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    async fn sender_for(&self, channel: &str) -> broadcast::Sender<BusMessage> {
        if let Some(tx) = self.channels.read().await.get(channel) {
            return tx.clone();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn publish(&self, channel: &str, payload: serde_json::Value) {
        let tx = self.sender_for(channel).await;
        // A `send` error just means nobody is currently subscribed; that is
        // not a bus failure. There is no durability requirement for
        // unobserved publishes.
        let _ = tx.send(BusMessage {
            channel: channel.to_string(),
            payload,
        });
    }

    async fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(channel).await.subscribe()
    }

    async fn kv_set(&self, key: &str, value: String, ttl: Duration) {
        self.kv.write().await.insert(
            key.to_string(),
            TtlEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn kv_get(&self, key: &str) -> Option<String> {
        let kv = self.kv.read().await;
        kv.get(key).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    async fn kv_delete(&self, key: &str) {
        self.kv.write().await.remove(key);
    }

    fn is_single_replica(&self) -> bool {
        true
    }
}

/// Bus-backed arbitration lock for recovery ownership: only one replica
/// may own recovery for a given contest at a time. Wraps a plain
/// `kv_set`/`kv_get` pair behind its own type so the arbitration rule is
/// testable independently of the orchestrator's recovery scan.
pub struct RecoveryLock {
    bus: Arc<dyn EventBus>,
    ttl: Duration,
}

impl RecoveryLock {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            bus,
            ttl: Duration::from_secs(30),
        }
    }

    #[cfg(test)]
    fn with_ttl(bus: Arc<dyn EventBus>, ttl: Duration) -> Self {
        Self { bus, ttl }
    }

    /// Attempt to claim recovery ownership of `contest_id` for `replica_id`.
    /// Returns `false` if another replica already holds an unexpired claim.
    pub async fn try_acquire(&self, contest_id: &str, replica_id: &str) -> bool {
        if self.bus.kv_get(&keys::recovery_lock(contest_id)).await.is_some() {
            return false;
        }
        self.bus.kv_set(&keys::recovery_lock(contest_id), replica_id.to_string(), self.ttl).await;
        true
    }

    /// Refresh the TTL on a claim this replica already holds. Callers must
    /// keep calling this at an interval well under `ttl` for as long as the
    /// critical section the lock protects is still open — the claim is not
    /// reacquired, just extended, the same way `key:agent_connected` is kept
    /// alive by a ping/pong heartbeat rather than a single long TTL.
    pub async fn refresh(&self, contest_id: &str, replica_id: &str) {
        self.bus.kv_set(&keys::recovery_lock(contest_id), replica_id.to_string(), self.ttl).await;
    }

    /// Release a claim this replica holds, so another replica can recover
    /// the contest immediately instead of waiting out the TTL.
    pub async fn release(&self, contest_id: &str) {
        self.bus.kv_delete(&keys::recovery_lock(contest_id)).await;
    }
}

/// TTLs for the bus's key/value entries.
pub mod ttl {
    use std::time::Duration;

    pub const AGENT_CONNECTED: Duration = Duration::from_secs(120);
    pub const SPECTATOR_COUNT: Duration = Duration::from_secs(60);
}

/// Bus key helpers for the bus's channel and key/value namespaces.
pub mod keys {
    pub fn contest_channel(contest_id: &str) -> String {
        format!("channel:contest:{}", contest_id)
    }

    pub fn agent_response_channel(request_id: &str) -> String {
        format!("channel:agent_response:{}", request_id)
    }

    pub fn replica_inbox(replica_id: &str) -> String {
        format!("inbox:replica:{}", replica_id)
    }

    pub fn agent_connected(agent_id: &str) -> String {
        format!("key:agent_connected:{}", agent_id)
    }

    pub fn spectators(contest_id: &str, replica_id: &str) -> String {
        format!("key:spectators:{}:{}", contest_id, replica_id)
    }

    /// Arbitration lock for recovery ownership: only one replica may own
    /// recovery for a given contest at a time.
    pub fn recovery_lock(contest_id: &str) -> String {
        format!("key:recovery_lock:{}", contest_id)
    }

    /// Advisory, best-effort roster of replica ids that have ever announced
    /// themselves, used by [`crate::arena::spectator::SpectatorLayer`] to
    /// sum per-replica spectator counts into a fleet-wide total. Not atomic;
    /// acceptable because spectator counts are informational, not a
    /// correctness invariant.
    pub fn replica_roster() -> String {
        "key:replica_roster".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_later_sees_nothing_from_before() {
        let bus = InProcessEventBus::new();
        bus.publish("channel:contest:c1", serde_json::json!({"type": "debate_started"}))
            .await;
        let mut rx = bus.subscribe("channel:contest:c1").await;
        bus.publish("channel:contest:c1", serde_json::json!({"type": "round_started"}))
            .await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload["type"], "round_started");
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive_fan_out() {
        let bus = InProcessEventBus::new();
        let mut rx1 = bus.subscribe("channel:contest:c1").await;
        let mut rx2 = bus.subscribe("channel:contest:c1").await;
        bus.publish("channel:contest:c1", serde_json::json!({"type": "x"})).await;
        assert_eq!(rx1.recv().await.unwrap().payload["type"], "x");
        assert_eq!(rx2.recv().await.unwrap().payload["type"], "x");
    }

    #[tokio::test]
    async fn kv_expires_after_ttl() {
        let bus = InProcessEventBus::new();
        bus.kv_set("key:agent_connected:a1", "replica-1".into(), Duration::from_millis(20))
            .await;
        assert_eq!(bus.kv_get("key:agent_connected:a1").await, Some("replica-1".to_string()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(bus.kv_get("key:agent_connected:a1").await, None);
    }

    #[tokio::test]
    async fn recovery_lock_grants_exactly_one_claimant() {
        let bus = InProcessEventBus::shared();
        let lock = RecoveryLock::new(bus);
        assert!(lock.try_acquire("c1", "replica-1").await);
        assert!(!lock.try_acquire("c1", "replica-2").await);
        // A different contest is unaffected by the first one's claim.
        assert!(lock.try_acquire("c2", "replica-2").await);
    }

    #[tokio::test]
    async fn recovery_lock_refresh_outlives_the_original_ttl() {
        let bus = InProcessEventBus::shared();
        let lock = RecoveryLock::with_ttl(bus, Duration::from_millis(30));
        assert!(lock.try_acquire("c1", "replica-1").await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.refresh("c1", "replica-1").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Still held past the original TTL because of the refresh.
        assert!(!lock.try_acquire("c1", "replica-2").await);
    }

    #[tokio::test]
    async fn recovery_lock_release_frees_the_claim_immediately() {
        let bus = InProcessEventBus::shared();
        let lock = RecoveryLock::new(bus);
        assert!(lock.try_acquire("c1", "replica-1").await);
        lock.release("c1").await;
        assert!(lock.try_acquire("c1", "replica-2").await);
    }

    #[tokio::test]
    async fn kv_delete_removes_immediately() {
        let bus = InProcessEventBus::new();
        bus.kv_set("k", "v".into(), Duration::from_secs(60)).await;
        bus.kv_delete("k").await;
        assert_eq!(bus.kv_get("k").await, None);
    }
}
