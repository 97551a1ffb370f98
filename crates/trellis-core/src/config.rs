//! Runtime configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the trellis runtime.
///
/// All durations are in the unit named by the field suffix. The defaults
/// match the production tuning of the event loop and the storage backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrellisConfig {
    /// Cap on intents per commit attempt.
    pub max_batch_size: usize,

    /// Stable runtime identifier; a random UUID is used when unset.
    pub runtime_id: Option<String>,

    /// Namespace used when a session does not supply one.
    pub default_namespace: String,

    /// Minimum sleep between event loop iterations.
    pub event_poll_interval_ms: u64,

    /// Per-handler claim batch size per iteration.
    pub event_claim_limit: usize,

    /// Aggregate cap on events processed across handlers per iteration.
    pub max_events_per_iteration: usize,

    /// Lease duration for event claims.
    pub event_claim_lease_ms: u64,

    /// Events older than this are eligible for namespace-scoped GC.
    pub event_retention_ms: u64,

    /// Session heartbeat cadence.
    pub session_heartbeat_interval_ms: u64,

    /// Sessions without a heartbeat for this long are considered dead.
    pub session_ttl_ms: u64,

    /// Dead-letter threshold per (event, handler).
    pub event_max_attempts: u32,

    /// Exponential backoff base for failed claims.
    pub event_backoff_base_ms: u64,

    /// Exponential backoff ceiling for failed claims.
    pub event_backoff_max_ms: u64,

    /// Derived events beyond this depth are rejected at emit.
    pub max_event_chain_depth: u32,

    /// Hard timeout for write-lock acquisition on the object-store backend.
    pub store_lock_timeout_ms: u64,

    /// Write lease TTL on the object-store backend; renewed at ttl/3.
    pub store_lease_ttl_ms: u64,

    /// Per-request I/O timeout applied by remote object-store clients.
    pub store_request_timeout_s: f64,
}

impl Default for TrellisConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10_000,
            runtime_id: None,
            default_namespace: "default".to_string(),
            event_poll_interval_ms: 1000,
            event_claim_limit: 100,
            max_events_per_iteration: 1000,
            event_claim_lease_ms: 30_000,
            event_retention_ms: 604_800_000,
            session_heartbeat_interval_ms: 5000,
            session_ttl_ms: 60_000,
            event_max_attempts: 10,
            event_backoff_base_ms: 250,
            event_backoff_max_ms: 30_000,
            max_event_chain_depth: 20,
            store_lock_timeout_ms: 5000,
            store_lease_ttl_ms: 30_000,
            store_request_timeout_s: 10.0,
        }
    }
}
