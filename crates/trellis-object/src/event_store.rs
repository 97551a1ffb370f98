//! Object-store event store: one JSON object per record, claims
//! coordinated through per-object CAS preconditions.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde_json::{json, Value};
use uuid::Uuid;

use trellis_core::clock;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{
    ClaimRecord, ClaimedEvent, DeadLetterRecord, EventDetail, EventEnvelope, EventSummary,
    NamespaceSummary, SessionSummary,
};
use trellis_core::repo::EventStore;
use trellis_core::{backoff_delay_ms, TrellisConfig, DEAD_LETTER_EVENT_TYPE};

use crate::fs_store::{ObjectStore, Precondition, PutOutcome};

pub struct ObjectEventStore {
    store: Box<dyn ObjectStore>,
    config: TrellisConfig,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct EventObject {
    id: String,
    namespace: String,
    #[serde(rename = "type")]
    event_type: String,
    payload: Value,
    created_at: String,
    priority: i64,
    root_event_id: String,
    chain_depth: u32,
}

impl EventObject {
    fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            id: self.id.clone(),
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            created_at: self.created_at.clone(),
            priority: self.priority,
            root_event_id: self.root_event_id.clone(),
            chain_depth: self.chain_depth,
        }
    }
}

fn storage_err(operation: &str, e: impl ToString) -> TrellisError {
    TrellisError::storage(operation, e.to_string())
}

impl ObjectEventStore {
    pub fn new(store: Box<dyn ObjectStore>, config: TrellisConfig) -> ObjectEventStore {
        ObjectEventStore { store, config }
    }

    fn event_key(namespace: &str, event_id: &str, created_at: &str) -> String {
        let ts = created_at.replace(':', "-");
        format!("events/{namespace}/{ts}_{event_id}.json")
    }

    fn claim_key(namespace: &str, event_id: &str, handler_id: &str) -> String {
        format!("claims/{namespace}/{event_id}/{handler_id}.json")
    }

    fn dead_key(namespace: &str, event_id: &str, handler_id: &str) -> String {
        format!("dead_letters/{namespace}/{event_id}/{handler_id}.json")
    }

    fn session_key(namespace: &str, session_id: &str) -> String {
        format!("sessions/{namespace}/{session_id}.json")
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<(T, String)>> {
        match self.store.get(key)? {
            Some((bytes, etag)) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| TrellisError::Serialization(e.to_string()))?;
                Ok(Some((value, etag)))
            }
            None => Ok(None),
        }
    }

    fn put_json<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
        precondition: Precondition,
    ) -> Result<PutOutcome> {
        let body = serde_json::to_vec(value)
            .map_err(|e| TrellisError::Serialization(e.to_string()))?;
        self.store.put(key, &body, precondition)
    }

    fn load_events(&self, namespace: &str) -> Result<Vec<EventObject>> {
        let mut events = Vec::new();
        for key in self.store.list(&format!("events/{namespace}/"))? {
            if let Some((event, _)) = self.get_json::<EventObject>(&key)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn load_claims(&self, namespace: &str, event_id: &str) -> Result<Vec<ClaimRecord>> {
        let mut claims = Vec::new();
        for key in self
            .store
            .list(&format!("claims/{namespace}/{event_id}/"))?
        {
            if let Some((claim, _)) = self.get_json::<ClaimRecord>(&key)? {
                claims.push(claim);
            }
        }
        claims.sort_by(|a, b| a.handler_id.cmp(&b.handler_id));
        Ok(claims)
    }
}

impl EventStore for ObjectEventStore {
    fn enqueue(&self, envelope: &EventEnvelope, namespace: &str) -> Result<()> {
        let object = EventObject {
            id: envelope.id.clone(),
            namespace: namespace.to_string(),
            event_type: envelope.event_type.clone(),
            payload: envelope.payload.clone(),
            created_at: envelope.created_at.clone(),
            priority: envelope.priority,
            root_event_id: envelope.root_event_id.clone(),
            chain_depth: envelope.chain_depth,
        };
        self.put_json(
            &Self::event_key(namespace, &envelope.id, &envelope.created_at),
            &object,
            Precondition::None,
        )?;
        Ok(())
    }

    fn claim(
        &self,
        namespace: &str,
        handler_id: &str,
        session_id: &str,
        event_types: &[String],
        limit: usize,
        lease_ms: u64,
    ) -> Result<Vec<ClaimedEvent>> {
        if limit == 0 || event_types.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates = self.load_events(namespace)?;
        candidates.retain(|e| event_types.iter().any(|t| t == &e.event_type));
        candidates.sort_by(|a, b| {
            (-a.priority, &a.created_at, &a.id).cmp(&(-b.priority, &b.created_at, &b.id))
        });

        let now = clock::now();
        let now_iso = clock::to_iso(now);
        let lease_until = now + Duration::milliseconds(lease_ms as i64);
        let lease_until_iso = clock::to_iso(lease_until);

        let mut out = Vec::new();
        for candidate in candidates {
            if out.len() >= limit {
                break;
            }

            let claim_key = Self::claim_key(namespace, &candidate.id, handler_id);
            let existing = self.get_json::<ClaimRecord>(&claim_key)?;

            let mut record = ClaimRecord {
                event_id: candidate.id.clone(),
                handler_id: handler_id.to_string(),
                session_id: session_id.to_string(),
                claimed_at: now_iso.clone(),
                lease_until: lease_until_iso.clone(),
                ack_at: None,
                attempts: 0,
                available_at: now_iso.clone(),
                last_error: None,
                dead_lettered_at: None,
            };

            let outcome = match existing {
                None => self.put_json(&claim_key, &record, Precondition::IfNoneMatch)?,
                Some((claim, etag)) => {
                    if claim.ack_at.is_some() || claim.dead_lettered_at.is_some() {
                        continue;
                    }
                    let lease_old = clock::parse_iso(&claim.lease_until).unwrap_or(now);
                    let avail_old = clock::parse_iso(&claim.available_at).unwrap_or(now);
                    if now < lease_old || now < avail_old {
                        continue;
                    }
                    record.attempts = claim.attempts;
                    record.available_at = claim.available_at.clone();
                    record.last_error = claim.last_error.clone();
                    self.put_json(&claim_key, &record, Precondition::IfMatch(etag))?
                }
            };

            // Lost the race for this claim: skip, another session has it.
            if outcome.is_precondition_failed() {
                continue;
            }

            out.push(ClaimedEvent {
                envelope: candidate.envelope(),
                lease_until,
            });
        }
        Ok(out)
    }

    fn ack(&self, handler_id: &str, event_id: &str, namespace: &str) -> Result<()> {
        let claim_key = Self::claim_key(namespace, event_id, handler_id);
        let Some((mut claim, etag)) = self.get_json::<ClaimRecord>(&claim_key)? else {
            return Ok(());
        };
        claim.ack_at = Some(clock::now_iso());
        let _ = self.put_json(&claim_key, &claim, Precondition::IfMatch(etag))?;
        Ok(())
    }

    fn release(
        &self,
        handler_id: &str,
        event_id: &str,
        namespace: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let claim_key = Self::claim_key(namespace, event_id, handler_id);
        let Some((mut claim, etag)) = self.get_json::<ClaimRecord>(&claim_key)? else {
            return Ok(());
        };

        claim.attempts += 1;
        claim.last_error = Some(error.unwrap_or("handler failure").to_string());
        claim.lease_until = clock::now_iso();

        if claim.attempts >= self.config.event_max_attempts {
            let failed_at = clock::now_iso();
            claim.dead_lettered_at = Some(failed_at.clone());

            // Lineage of the failed event, preserved on the audit trail
            // and the synthetic dead-letter event.
            let source = self.inspect_event(event_id, Some(namespace))?;
            let (root_event_id, chain_depth) = source
                .as_ref()
                .map(|d| (d.envelope.root_event_id.clone(), d.envelope.chain_depth))
                .unwrap_or_else(|| (event_id.to_string(), 0));

            let dead = json!({
                "event_id": event_id,
                "handler_id": handler_id,
                "namespace": namespace,
                "failed_at": failed_at,
                "attempts": claim.attempts,
                "last_error": claim.last_error,
                "event_type": source.as_ref().map(|d| d.envelope.event_type.clone()),
                "root_event_id": root_event_id,
                "chain_depth": chain_depth,
            });
            self.put_json(
                &Self::dead_key(namespace, event_id, handler_id),
                &dead,
                Precondition::None,
            )?;

            tracing::warn!(
                event_id,
                handler_id,
                attempts = claim.attempts,
                "event dead-lettered after exhausting attempts"
            );

            let dead_evt = EventEnvelope {
                id: Uuid::new_v4().to_string(),
                event_type: DEAD_LETTER_EVENT_TYPE.to_string(),
                payload: json!({
                    "event_id": event_id,
                    "handler_id": handler_id,
                    "attempts": claim.attempts,
                    "last_error": claim.last_error,
                }),
                created_at: clock::now_iso(),
                priority: 100,
                root_event_id,
                chain_depth: chain_depth + 1,
            };
            self.enqueue(&dead_evt, namespace)?;
        } else {
            let jitter: u64 = rand::thread_rng().gen_range(0..=100);
            let backoff = backoff_delay_ms(
                claim.attempts,
                self.config.event_backoff_base_ms,
                self.config.event_backoff_max_ms,
            );
            claim.available_at = clock::to_iso(
                clock::now() + Duration::milliseconds((backoff + jitter) as i64),
            );
        }

        let _ = self.put_json(&claim_key, &claim, Precondition::IfMatch(etag))?;
        Ok(())
    }

    fn register_session(
        &self,
        session_id: &str,
        namespace: &str,
        metadata: &Value,
    ) -> Result<()> {
        let now = clock::now_iso();
        let record = SessionSummary {
            session_id: session_id.to_string(),
            namespace: namespace.to_string(),
            started_at: now.clone(),
            last_heartbeat: now,
            is_dead: false,
            metadata: metadata.clone(),
        };
        self.put_json(
            &Self::session_key(namespace, session_id),
            &record,
            Precondition::None,
        )?;
        Ok(())
    }

    fn heartbeat(&self, session_id: &str, namespace: &str) -> Result<()> {
        let key = Self::session_key(namespace, session_id);
        let Some((mut record, etag)) = self.get_json::<SessionSummary>(&key)? else {
            return self.register_session(session_id, namespace, &Value::Null);
        };
        record.last_heartbeat = clock::now_iso();
        let _ = self.put_json(&key, &record, Precondition::IfMatch(etag))?;
        Ok(())
    }

    fn list_namespaces(&self, _session_ttl_ms: u64) -> Result<Vec<NamespaceSummary>> {
        let mut namespaces = std::collections::BTreeSet::new();
        for prefix in ["events/", "sessions/"] {
            for key in self.store.list(prefix)? {
                if let Some(ns) = key
                    .strip_prefix(prefix)
                    .and_then(|rest| rest.split('/').next())
                {
                    if !ns.is_empty() {
                        namespaces.insert(ns.to_string());
                    }
                }
            }
        }

        let mut out = Vec::new();
        for namespace in namespaces {
            let pending = self.store.list(&format!("events/{namespace}/"))?.len();
            let dead = self
                .store
                .list(&format!("dead_letters/{namespace}/"))?
                .len();
            let sessions = self.store.list(&format!("sessions/{namespace}/"))?.len();
            out.push(NamespaceSummary {
                namespace,
                sessions,
                pending_events: pending,
                dead_letters: dead,
            });
        }
        Ok(out)
    }

    fn list_sessions(
        &self,
        namespace: &str,
        session_ttl_ms: u64,
    ) -> Result<Vec<SessionSummary>> {
        let now = clock::now();
        let mut out = Vec::new();
        for key in self.store.list(&format!("sessions/{namespace}/"))? {
            if let Some((mut record, _)) = self.get_json::<SessionSummary>(&key)? {
                record.is_dead = clock::parse_iso(&record.last_heartbeat)
                    .map(|hb| now - hb > Duration::milliseconds(session_ttl_ms as i64))
                    .unwrap_or(true);
                out.push(record);
            }
        }
        out.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat));
        Ok(out)
    }

    fn list_events(&self, namespace: &str, limit: usize) -> Result<Vec<EventSummary>> {
        let now = clock::now();
        let mut out = Vec::new();
        for event in self.load_events(namespace)? {
            let claims = self.load_claims(namespace, &event.id)?;
            let mut status = "pending";
            let mut handler: Option<String> = None;
            for claim in &claims {
                handler = Some(claim.handler_id.clone());
                if claim.dead_lettered_at.is_some() {
                    status = "dead_lettered";
                    break;
                }
                if claim.ack_at.is_some() {
                    status = "acked";
                } else if status == "pending" {
                    let lease_until =
                        clock::parse_iso(&claim.lease_until).unwrap_or(now);
                    if lease_until > now {
                        status = "claimed";
                    }
                }
            }
            out.push(EventSummary {
                id: event.id.clone(),
                event_type: event.event_type.clone(),
                created_at: event.created_at.clone(),
                priority: event.priority,
                status: status.to_string(),
                handler,
                payload: event.payload.clone(),
            });
        }
        out.sort_by(|a, b| {
            (-a.priority, &a.created_at, &a.id).cmp(&(-b.priority, &b.created_at, &b.id))
        });
        out.truncate(limit);
        Ok(out)
    }

    fn list_dead_letters(&self, namespace: &str, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let mut out = Vec::new();
        for key in self.store.list(&format!("dead_letters/{namespace}/"))? {
            if let Some((value, _)) = self.get_json::<Value>(&key)? {
                out.push(DeadLetterRecord {
                    event_id: value
                        .get("event_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    event_type: value
                        .get("event_type")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    handler_id: value
                        .get("handler_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    attempts: value.get("attempts").and_then(Value::as_u64).unwrap_or(0)
                        as u32,
                    last_error: value
                        .get("last_error")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    failed_at: value
                        .get("failed_at")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }
        out.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        out.truncate(limit);
        Ok(out)
    }

    fn cleanup_events(&self, namespace: &str, before: DateTime<Utc>) -> Result<usize> {
        let cutoff = clock::to_iso(before);
        let mut deleted = 0;
        for key in self.store.list(&format!("events/{namespace}/"))? {
            let Some((event, _)) = self.get_json::<EventObject>(&key)? else {
                continue;
            };
            if event.created_at < cutoff {
                self.store.delete(&key, None)?;
                deleted += 1;
                for claim_key in self
                    .store
                    .list(&format!("claims/{namespace}/{}/", event.id))?
                {
                    self.store.delete(&claim_key, None)?;
                }
            }
        }
        Ok(deleted)
    }

    fn replay_event(&self, namespace: &str, event_id: &str) -> Result<String> {
        let Some(detail) = self.inspect_event(event_id, Some(namespace))? else {
            return Err(TrellisError::storage(
                "replay_event",
                format!("event '{event_id}' not found"),
            ));
        };
        let copy = detail.envelope.as_root_copy();
        self.enqueue(&copy, namespace)?;
        Ok(copy.id)
    }

    fn inspect_event(
        &self,
        event_id: &str,
        namespace: Option<&str>,
    ) -> Result<Option<EventDetail>> {
        let prefix = match namespace {
            Some(ns) => format!("events/{ns}/"),
            None => "events/".to_string(),
        };
        for key in self.store.list(&prefix)? {
            let Some((event, _)) = self.get_json::<EventObject>(&key)? else {
                continue;
            };
            if event.id != event_id {
                continue;
            }
            let claims = self.load_claims(&event.namespace, event_id)?;
            return Ok(Some(EventDetail {
                envelope: event.envelope(),
                namespace: event.namespace,
                claims,
            }));
        }
        Ok(None)
    }
}
