//! Typed events, envelopes, and the per-(event, handler) claim model.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock;
use crate::error::{Result, TrellisError};

/// Event type of the built-in dead-letter audit event.
pub const DEAD_LETTER_EVENT_TYPE: &str = "event.dead_letter";

/// A typed message consumed by handlers. Payload fields are user-defined;
/// the envelope carries the runtime metadata.
pub trait Event: Serialize + DeserializeOwned {
    fn event_type() -> &'static str;

    /// Higher priority is consumed earlier.
    fn priority() -> i64 {
        100
    }
}

/// Wire envelope of an event: payload plus identity, ordering, and chain
/// lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub event_type: String,
    pub payload: Value,
    pub created_at: String,
    pub priority: i64,
    pub root_event_id: String,
    pub chain_depth: u32,
}

impl EventEnvelope {
    /// Envelope a typed event as a root event (fresh id, depth 0).
    pub fn new<E: Event>(event: &E) -> Result<EventEnvelope> {
        let payload =
            serde_json::to_value(event).map_err(|e| TrellisError::Serialization(e.to_string()))?;
        let id = Uuid::new_v4().to_string();
        Ok(EventEnvelope {
            id: id.clone(),
            event_type: E::event_type().to_string(),
            payload,
            created_at: clock::now_iso(),
            priority: E::priority(),
            root_event_id: id,
            chain_depth: 0,
        })
    }

    /// Decode the payload into a typed event.
    pub fn decode<E: Event>(&self) -> Result<E> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| TrellisError::Serialization(e.to_string()))
    }

    /// Restamp as a fresh root event (used by schedules and replay).
    pub fn as_root_copy(&self) -> EventEnvelope {
        let id = Uuid::new_v4().to_string();
        EventEnvelope {
            id: id.clone(),
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            created_at: clock::now_iso(),
            priority: self.priority,
            root_event_id: id,
            chain_depth: 0,
        }
    }

    /// Restamp as a derived event inheriting lineage from `parent`.
    /// Rejects chains beyond `max_chain_depth`.
    pub fn derive_from(&self, parent: &EventEnvelope, max_chain_depth: u32) -> Result<EventEnvelope> {
        let chain_depth = parent.chain_depth + 1;
        if chain_depth > max_chain_depth {
            return Err(TrellisError::EventLoopLimit {
                depth: chain_depth,
                limit: max_chain_depth,
            });
        }
        let mut out = self.clone();
        out.created_at = clock::now_iso();
        out.root_event_id = parent.root_event_id.clone();
        out.chain_depth = chain_depth;
        Ok(out)
    }
}

/// Built-in event emitted when a handler dead-letters an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    pub event_id: String,
    pub handler_id: String,
    pub attempts: u32,
    pub last_error: String,
}

impl Event for DeadLetterEvent {
    fn event_type() -> &'static str {
        DEAD_LETTER_EVENT_TYPE
    }
}

/// Schedule definition that emits a copy of an event template each time
/// the 5-field cron expression matches.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub event: EventEnvelope,
    pub cron: String,
}

impl Schedule {
    pub fn new<E: Event>(event: &E, cron: &str) -> Result<Schedule> {
        Ok(Schedule {
            event: EventEnvelope::new(event)?,
            cron: cron.to_string(),
        })
    }
}

/// An event claimed by a handler, with its lease horizon.
#[derive(Debug, Clone)]
pub struct ClaimedEvent {
    pub envelope: EventEnvelope,
    pub lease_until: DateTime<Utc>,
}

/// Claim lifecycle states. `Unclaimed` is the absence of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Claimed,
    Backoff,
    Reclaimable,
    Acked,
    DeadLettered,
}

/// Persistent claim row for one `(event_id, handler_id)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub event_id: String,
    pub handler_id: String,
    pub session_id: String,
    pub claimed_at: String,
    pub lease_until: String,
    pub ack_at: Option<String>,
    pub attempts: u32,
    pub available_at: String,
    pub last_error: Option<String>,
    pub dead_lettered_at: Option<String>,
}

impl ClaimRecord {
    /// Derive the lifecycle state at `now`. Terminal states win over
    /// lease arithmetic.
    pub fn state(&self, now: DateTime<Utc>) -> ClaimState {
        if self.dead_lettered_at.is_some() {
            return ClaimState::DeadLettered;
        }
        if self.ack_at.is_some() {
            return ClaimState::Acked;
        }
        let lease_until = clock::parse_iso(&self.lease_until).unwrap_or(now);
        if lease_until > now {
            return ClaimState::Claimed;
        }
        let available_at = clock::parse_iso(&self.available_at).unwrap_or(now);
        if available_at > now {
            ClaimState::Backoff
        } else {
            ClaimState::Reclaimable
        }
    }
}

/// Exponential backoff delay before a failed claim becomes reclaimable:
/// `min(base * 2^attempts, max)`. Jitter is added by the caller.
pub fn backoff_delay_ms(attempts: u32, base_ms: u64, max_ms: u64) -> u64 {
    let factor = 2u64.saturating_pow(attempts.min(32));
    base_ms.saturating_mul(factor).min(max_ms)
}

/// Append-only audit row written when a claim dead-letters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub event_id: String,
    pub event_type: String,
    pub handler_id: String,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: String,
}

/// Registered event-loop session with heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub namespace: String,
    pub started_at: String,
    pub last_heartbeat: String,
    pub is_dead: bool,
    pub metadata: Value,
}

/// Operator view of one event with derived status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: String,
    pub event_type: String,
    pub created_at: String,
    pub priority: i64,
    /// One of `pending`, `claimed`, `acked`, `dead_lettered`.
    pub status: String,
    pub handler: Option<String>,
    pub payload: Value,
}

/// Operator view of one namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceSummary {
    pub namespace: String,
    pub sessions: usize,
    pub pending_events: usize,
    pub dead_letters: usize,
}

/// Full inspection record for one event: envelope plus all claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDetail {
    pub envelope: EventEnvelope,
    pub namespace: String,
    pub claims: Vec<ClaimRecord>,
}
