//! SQLite-backed event store with claim/ack/retry semantics.
//!
//! Shares the repository connection so `commit(event)` enqueues inside
//! the same transaction as the commit rows.

use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use trellis_core::clock;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{
    ClaimRecord, ClaimedEvent, DeadLetterRecord, EventDetail, EventEnvelope, EventSummary,
    NamespaceSummary, SessionSummary,
};
use trellis_core::repo::EventStore;
use trellis_core::{backoff_delay_ms, TrellisConfig, DEAD_LETTER_EVENT_TYPE};

pub struct SqliteEventStore {
    conn: Rc<Connection>,
    config: TrellisConfig,
}

fn storage_err(operation: &str, e: impl ToString) -> TrellisError {
    TrellisError::storage(operation, e.to_string())
}

impl SqliteEventStore {
    pub fn new(conn: Rc<Connection>, config: TrellisConfig) -> Result<SqliteEventStore> {
        let store = SqliteEventStore { conn, config };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS events (
                    id TEXT PRIMARY KEY,
                    namespace TEXT NOT NULL,
                    type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    priority INTEGER NOT NULL DEFAULT 100,
                    root_event_id TEXT NOT NULL,
                    chain_depth INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_events_namespace_type_order
                    ON events(namespace, type, priority DESC, created_at ASC, id ASC);

                CREATE TABLE IF NOT EXISTS event_claims (
                    event_id TEXT NOT NULL,
                    handler_id TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    claimed_at TEXT NOT NULL,
                    lease_until TEXT NOT NULL,
                    ack_at TEXT,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    available_at TEXT NOT NULL,
                    last_error TEXT,
                    dead_lettered_at TEXT,
                    PRIMARY KEY (event_id, handler_id)
                );
                CREATE INDEX IF NOT EXISTS idx_event_claims_handler_state
                    ON event_claims(handler_id, ack_at, dead_lettered_at,
                                    lease_until, available_at);
                CREATE INDEX IF NOT EXISTS idx_event_claims_event
                    ON event_claims(event_id);

                CREATE TABLE IF NOT EXISTS dead_letters (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_id TEXT NOT NULL,
                    handler_id TEXT NOT NULL,
                    namespace TEXT NOT NULL,
                    failed_at TEXT NOT NULL,
                    attempts INTEGER NOT NULL,
                    last_error TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    event_payload TEXT NOT NULL,
                    root_event_id TEXT NOT NULL,
                    chain_depth INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_dead_letters_namespace_failed
                    ON dead_letters(namespace, failed_at DESC);

                CREATE TABLE IF NOT EXISTS sessions (
                    session_id TEXT PRIMARY KEY,
                    namespace TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    last_heartbeat TEXT NOT NULL,
                    metadata TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_sessions_heartbeat
                    ON sessions(last_heartbeat);
                CREATE INDEX IF NOT EXISTS idx_sessions_namespace
                    ON sessions(namespace);",
            )
            .map_err(|e| storage_err("event_tables", e))
    }

    fn in_own_tx<T>(&self, op: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let own = self.conn.is_autocommit();
        if own {
            self.conn
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| storage_err(op, e))?;
        }
        match f() {
            Ok(out) => {
                if own {
                    self.conn
                        .execute_batch("COMMIT")
                        .map_err(|e| storage_err(op, e))?;
                }
                Ok(out)
            }
            Err(e) => {
                if own {
                    let _ = self.conn.execute_batch("ROLLBACK");
                }
                Err(e)
            }
        }
    }
}

fn row_to_envelope(
    id: String,
    event_type: String,
    payload: String,
    created_at: String,
    priority: i64,
    root_event_id: String,
    chain_depth: i64,
) -> Result<EventEnvelope> {
    Ok(EventEnvelope {
        id,
        event_type,
        payload: serde_json::from_str(&payload)
            .map_err(|e| TrellisError::Serialization(e.to_string()))?,
        created_at,
        priority,
        root_event_id,
        chain_depth: chain_depth as u32,
    })
}

impl EventStore for SqliteEventStore {
    fn enqueue(&self, envelope: &EventEnvelope, namespace: &str) -> Result<()> {
        let payload = trellis_core::hash::canonical_json(&envelope.payload);
        self.conn
            .execute(
                "INSERT INTO events \
                 (id, namespace, type, payload, created_at, priority, root_event_id, chain_depth) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    envelope.id,
                    namespace,
                    envelope.event_type,
                    payload,
                    envelope.created_at,
                    envelope.priority,
                    envelope.root_event_id,
                    envelope.chain_depth as i64
                ],
            )
            .map_err(|e| storage_err("enqueue", e))?;
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

        let now = clock::now();
        let now_iso = clock::to_iso(now);
        let lease_until = now + Duration::milliseconds(lease_ms as i64);
        let lease_until_iso = clock::to_iso(lease_until);
        let placeholders = vec!["?"; event_types.len()].join(", ");

        self.in_own_tx("claim", || {
            let sql = format!(
                "SELECT e.id, e.type, e.payload, e.created_at, e.priority, \
                        e.root_event_id, e.chain_depth \
                 FROM events e \
                 LEFT JOIN event_claims c \
                     ON e.id = c.event_id AND c.handler_id = ? \
                 WHERE e.namespace = ? \
                   AND e.type IN ({placeholders}) \
                   AND ( \
                       c.event_id IS NULL OR ( \
                           c.ack_at IS NULL \
                           AND c.dead_lettered_at IS NULL \
                           AND c.lease_until <= ? \
                           AND c.available_at <= ? \
                       ) \
                   ) \
                 ORDER BY e.priority DESC, e.created_at ASC, e.id ASC \
                 LIMIT ?"
            );
            let mut params_vec: Vec<rusqlite::types::Value> = Vec::new();
            params_vec.push(rusqlite::types::Value::Text(handler_id.to_string()));
            params_vec.push(rusqlite::types::Value::Text(namespace.to_string()));
            for t in event_types {
                params_vec.push(rusqlite::types::Value::Text(t.clone()));
            }
            params_vec.push(rusqlite::types::Value::Text(now_iso.clone()));
            params_vec.push(rusqlite::types::Value::Text(now_iso.clone()));
            params_vec.push(rusqlite::types::Value::Integer(limit as i64));

            let mut stmt = self.conn.prepare(&sql).map_err(|e| storage_err("claim", e))?;
            let candidates = stmt
                .query_map(params_from_iter(params_vec.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                })
                .map_err(|e| storage_err("claim", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| storage_err("claim", e))?;

            let mut claimed = Vec::new();
            for (id, event_type, payload, created_at, priority, root_event_id, chain_depth) in
                candidates
            {
                self.conn
                    .execute(
                        "INSERT INTO event_claims \
                         (event_id, handler_id, session_id, claimed_at, lease_until, \
                          attempts, available_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6) \
                         ON CONFLICT(event_id, handler_id) DO UPDATE SET \
                             session_id = excluded.session_id, \
                             claimed_at = excluded.claimed_at, \
                             lease_until = excluded.lease_until \
                         WHERE event_claims.ack_at IS NULL \
                           AND event_claims.dead_lettered_at IS NULL \
                           AND event_claims.lease_until <= excluded.claimed_at \
                           AND event_claims.available_at <= excluded.claimed_at",
                        params![id, handler_id, session_id, now_iso, lease_until_iso, now_iso],
                    )
                    .map_err(|e| storage_err("claim", e))?;

                // Verify the claim landed for this session in this sweep.
                let claim_row: Option<(String, String)> = self
                    .conn
                    .query_row(
                        "SELECT session_id, claimed_at FROM event_claims \
                         WHERE event_id = ?1 AND handler_id = ?2",
                        params![id, handler_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .map_err(|e| storage_err("claim", e))?;
                match claim_row {
                    Some((sid, claimed_at)) if sid == session_id && claimed_at == now_iso => {}
                    _ => continue,
                }

                claimed.push(ClaimedEvent {
                    envelope: row_to_envelope(
                        id,
                        event_type,
                        payload,
                        created_at,
                        priority,
                        root_event_id,
                        chain_depth,
                    )?,
                    lease_until,
                });
            }
            Ok(claimed)
        })
    }

    fn ack(&self, handler_id: &str, event_id: &str, _namespace: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE event_claims SET ack_at = ?1 WHERE event_id = ?2 AND handler_id = ?3",
                params![clock::now_iso(), event_id, handler_id],
            )
            .map_err(|e| storage_err("ack", e))?;
        Ok(())
    }

    fn release(
        &self,
        handler_id: &str,
        event_id: &str,
        namespace: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let now_iso = clock::now_iso();
        self.in_own_tx("release", || {
            let row: Option<(i64, String, String, String, i64)> = self
                .conn
                .query_row(
                    "SELECT c.attempts, e.type, e.payload, e.root_event_id, e.chain_depth \
                     FROM event_claims c \
                     JOIN events e ON e.id = c.event_id \
                     WHERE c.event_id = ?1 AND c.handler_id = ?2 AND e.namespace = ?3",
                    params![event_id, handler_id, namespace],
                    |r| {
                        Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
                    },
                )
                .optional()
                .map_err(|e| storage_err("release", e))?;

            let Some((attempts, event_type, payload, root_event_id, chain_depth)) = row else {
                return Ok(());
            };
            let attempts = attempts as u32 + 1;
            let last_error = error.unwrap_or("handler failure").to_string();

            if attempts >= self.config.event_max_attempts {
                self.conn
                    .execute(
                        "UPDATE event_claims \
                         SET attempts = ?1, last_error = ?2, dead_lettered_at = ?3, \
                             lease_until = ?4, available_at = ?5 \
                         WHERE event_id = ?6 AND handler_id = ?7",
                        params![attempts, last_error, now_iso, now_iso, now_iso, event_id, handler_id],
                    )
                    .map_err(|e| storage_err("release", e))?;
                self.conn
                    .execute(
                        "INSERT INTO dead_letters \
                         (event_id, handler_id, namespace, failed_at, attempts, last_error, \
                          event_type, event_payload, root_event_id, chain_depth) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        params![
                            event_id,
                            handler_id,
                            namespace,
                            now_iso,
                            attempts,
                            last_error,
                            event_type,
                            payload,
                            root_event_id,
                            chain_depth
                        ],
                    )
                    .map_err(|e| storage_err("release", e))?;

                tracing::warn!(
                    event_id,
                    handler_id,
                    attempts,
                    "event dead-lettered after exhausting attempts"
                );

                // Synthetic audit event preserving the failed event's
                // lineage for loop detection.
                let dead = EventEnvelope {
                    id: Uuid::new_v4().to_string(),
                    event_type: DEAD_LETTER_EVENT_TYPE.to_string(),
                    payload: serde_json::json!({
                        "event_id": event_id,
                        "handler_id": handler_id,
                        "attempts": attempts,
                        "last_error": last_error,
                    }),
                    created_at: now_iso.clone(),
                    priority: 100,
                    root_event_id,
                    chain_depth: chain_depth as u32 + 1,
                };
                self.enqueue(&dead, namespace)?;
            } else {
                let jitter: u64 = rand::thread_rng().gen_range(0..=100);
                let backoff = backoff_delay_ms(
                    attempts,
                    self.config.event_backoff_base_ms,
                    self.config.event_backoff_max_ms,
                );
                let available_at = clock::to_iso(
                    clock::now() + Duration::milliseconds((backoff + jitter) as i64),
                );
                self.conn
                    .execute(
                        "UPDATE event_claims \
                         SET attempts = ?1, last_error = ?2, lease_until = ?3, available_at = ?4 \
                         WHERE event_id = ?5 AND handler_id = ?6",
                        params![attempts, last_error, now_iso, available_at, event_id, handler_id],
                    )
                    .map_err(|e| storage_err("release", e))?;
            }
            Ok(())
        })
    }

    fn register_session(
        &self,
        session_id: &str,
        namespace: &str,
        metadata: &Value,
    ) -> Result<()> {
        let now = clock::now_iso();
        self.conn
            .execute(
                "INSERT INTO sessions (session_id, namespace, started_at, last_heartbeat, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(session_id) DO UPDATE SET \
                     namespace = excluded.namespace, \
                     last_heartbeat = excluded.last_heartbeat, \
                     metadata = excluded.metadata",
                params![
                    session_id,
                    namespace,
                    now,
                    now,
                    trellis_core::hash::canonical_json(metadata)
                ],
            )
            .map_err(|e| storage_err("register_session", e))?;
        Ok(())
    }

    fn heartbeat(&self, session_id: &str, _namespace: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET last_heartbeat = ?1 WHERE session_id = ?2",
                params![clock::now_iso(), session_id],
            )
            .map_err(|e| storage_err("heartbeat", e))?;
        Ok(())
    }

    fn list_namespaces(&self, session_ttl_ms: u64) -> Result<Vec<NamespaceSummary>> {
        let now = clock::now();
        let mut namespaces = std::collections::BTreeSet::new();
        for table in ["events", "sessions", "dead_letters"] {
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT DISTINCT namespace FROM {table}"))
                .map_err(|e| storage_err("list_namespaces", e))?;
            let rows: Vec<String> = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| storage_err("list_namespaces", e))?
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| storage_err("list_namespaces", e))?;
            namespaces.extend(rows);
        }

        let mut out = Vec::new();
        for ns in namespaces {
            let pending: i64 = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM events WHERE namespace = ?1",
                    params![ns],
                    |row| row.get(0),
                )
                .map_err(|e| storage_err("list_namespaces", e))?;
            let dead: i64 = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM dead_letters WHERE namespace = ?1",
                    params![ns],
                    |row| row.get(0),
                )
                .map_err(|e| storage_err("list_namespaces", e))?;

            let mut stmt = self
                .conn
                .prepare("SELECT last_heartbeat FROM sessions WHERE namespace = ?1")
                .map_err(|e| storage_err("list_namespaces", e))?;
            let heartbeats: Vec<String> = stmt
                .query_map(params![ns], |row| row.get(0))
                .map_err(|e| storage_err("list_namespaces", e))?
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| storage_err("list_namespaces", e))?;
            let active = heartbeats
                .iter()
                .filter(|hb| {
                    clock::parse_iso(hb)
                        .map(|hb| now - hb <= Duration::milliseconds(session_ttl_ms as i64))
                        .unwrap_or(false)
                })
                .count();

            out.push(NamespaceSummary {
                namespace: ns,
                sessions: active,
                pending_events: pending as usize,
                dead_letters: dead as usize,
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
        let mut stmt = self
            .conn
            .prepare(
                "SELECT session_id, started_at, last_heartbeat, metadata \
                 FROM sessions WHERE namespace = ?1",
            )
            .map_err(|e| storage_err("list_sessions", e))?;
        let rows: Vec<(String, String, String, Option<String>)> = stmt
            .query_map(params![namespace], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(|e| storage_err("list_sessions", e))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| storage_err("list_sessions", e))?;

        let mut out: Vec<SessionSummary> = rows
            .into_iter()
            .map(|(session_id, started_at, last_heartbeat, metadata)| {
                let is_dead = clock::parse_iso(&last_heartbeat)
                    .map(|hb| now - hb > Duration::milliseconds(session_ttl_ms as i64))
                    .unwrap_or(true);
                SessionSummary {
                    session_id,
                    namespace: namespace.to_string(),
                    started_at,
                    last_heartbeat,
                    is_dead,
                    metadata: metadata
                        .and_then(|m| serde_json::from_str(&m).ok())
                        .unwrap_or(Value::Null),
                }
            })
            .collect();
        out.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat));
        Ok(out)
    }

    fn list_events(&self, namespace: &str, limit: usize) -> Result<Vec<EventSummary>> {
        let now_iso = clock::now_iso();
        let mut stmt = self
            .conn
            .prepare(
                "SELECT e.id, e.type, e.created_at, e.priority, e.payload, \
                        MAX(CASE WHEN c.dead_lettered_at IS NOT NULL THEN 1 ELSE 0 END) AS dead, \
                        MAX(CASE WHEN c.ack_at IS NOT NULL THEN 1 ELSE 0 END) AS ack, \
                        MAX(CASE WHEN c.ack_at IS NULL AND c.dead_lettered_at IS NULL \
                                 AND c.lease_until > ?1 THEN 1 ELSE 0 END) AS claimed, \
                        MAX(c.handler_id) AS any_handler \
                 FROM events e \
                 LEFT JOIN event_claims c ON e.id = c.event_id \
                 WHERE e.namespace = ?2 \
                 GROUP BY e.id, e.type, e.created_at, e.priority, e.payload \
                 ORDER BY e.priority DESC, e.created_at ASC, e.id ASC \
                 LIMIT ?3",
            )
            .map_err(|e| storage_err("list_events", e))?;
        let rows: Vec<(String, String, String, i64, String, i64, i64, i64, Option<String>)> = stmt
            .query_map(params![now_iso, namespace, limit as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(7)?.unwrap_or(0),
                    row.get(8)?,
                ))
            })
            .map_err(|e| storage_err("list_events", e))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| storage_err("list_events", e))?;

        rows.into_iter()
            .map(
                |(id, event_type, created_at, priority, payload, dead, ack, claimed, handler)| {
                    let status = if dead > 0 {
                        "dead_lettered"
                    } else if ack > 0 {
                        "acked"
                    } else if claimed > 0 {
                        "claimed"
                    } else {
                        "pending"
                    };
                    Ok(EventSummary {
                        id,
                        event_type,
                        created_at,
                        priority,
                        status: status.to_string(),
                        handler,
                        payload: serde_json::from_str(&payload)
                            .map_err(|e| TrellisError::Serialization(e.to_string()))?,
                    })
                },
            )
            .collect()
    }

    fn list_dead_letters(&self, namespace: &str, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT event_id, event_type, handler_id, attempts, last_error, failed_at \
                 FROM dead_letters WHERE namespace = ?1 \
                 ORDER BY failed_at DESC LIMIT ?2",
            )
            .map_err(|e| storage_err("list_dead_letters", e))?;
        let rows = stmt
            .query_map(params![namespace, limit as i64], |row| {
                Ok(DeadLetterRecord {
                    event_id: row.get(0)?,
                    event_type: row.get(1)?,
                    handler_id: row.get(2)?,
                    attempts: row.get::<_, i64>(3)? as u32,
                    last_error: row.get(4)?,
                    failed_at: row.get(5)?,
                })
            })
            .map_err(|e| storage_err("list_dead_letters", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage_err("list_dead_letters", e))?;
        Ok(rows)
    }

    fn cleanup_events(&self, namespace: &str, before: DateTime<Utc>) -> Result<usize> {
        let cutoff = clock::to_iso(before);
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM events WHERE namespace = ?1 AND created_at < ?2")
            .map_err(|e| storage_err("cleanup_events", e))?;
        let ids: Vec<String> = stmt
            .query_map(params![namespace, cutoff], |row| row.get(0))
            .map_err(|e| storage_err("cleanup_events", e))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| storage_err("cleanup_events", e))?;
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        self.conn
            .execute(
                &format!("DELETE FROM event_claims WHERE event_id IN ({placeholders})"),
                params_from_iter(ids.iter()),
            )
            .map_err(|e| storage_err("cleanup_events", e))?;
        self.conn
            .execute(
                &format!("DELETE FROM events WHERE id IN ({placeholders})"),
                params_from_iter(ids.iter()),
            )
            .map_err(|e| storage_err("cleanup_events", e))?;
        Ok(ids.len())
    }

    fn replay_event(&self, namespace: &str, event_id: &str) -> Result<String> {
        let row: Option<(String, String, i64)> = self
            .conn
            .query_row(
                "SELECT type, payload, priority FROM events WHERE id = ?1 AND namespace = ?2",
                params![event_id, namespace],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .map_err(|e| storage_err("replay_event", e))?;
        let Some((event_type, payload, priority)) = row else {
            return Err(TrellisError::storage(
                "replay_event",
                format!("event '{event_id}' not found"),
            ));
        };

        let new_id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO events \
                 (id, namespace, type, payload, created_at, priority, root_event_id, chain_depth) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                params![
                    new_id,
                    namespace,
                    event_type,
                    payload,
                    clock::now_iso(),
                    priority,
                    new_id
                ],
            )
            .map_err(|e| storage_err("replay_event", e))?;
        Ok(new_id)
    }

    fn inspect_event(
        &self,
        event_id: &str,
        namespace: Option<&str>,
    ) -> Result<Option<EventDetail>> {
        let row: Option<(String, String, String, String, String, i64, String, i64)> =
            match namespace {
                Some(ns) => self
                    .conn
                    .query_row(
                        "SELECT id, namespace, type, payload, created_at, priority, \
                         root_event_id, chain_depth \
                         FROM events WHERE id = ?1 AND namespace = ?2",
                        params![event_id, ns],
                        |r| {
                            Ok((
                                r.get(0)?,
                                r.get(1)?,
                                r.get(2)?,
                                r.get(3)?,
                                r.get(4)?,
                                r.get(5)?,
                                r.get(6)?,
                                r.get(7)?,
                            ))
                        },
                    )
                    .optional(),
                None => self
                    .conn
                    .query_row(
                        "SELECT id, namespace, type, payload, created_at, priority, \
                         root_event_id, chain_depth \
                         FROM events WHERE id = ?1",
                        params![event_id],
                        |r| {
                            Ok((
                                r.get(0)?,
                                r.get(1)?,
                                r.get(2)?,
                                r.get(3)?,
                                r.get(4)?,
                                r.get(5)?,
                                r.get(6)?,
                                r.get(7)?,
                            ))
                        },
                    )
                    .optional(),
            }
            .map_err(|e| storage_err("inspect_event", e))?;

        let Some((id, ns, event_type, payload, created_at, priority, root_event_id, depth)) = row
        else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT event_id, handler_id, session_id, claimed_at, lease_until, ack_at, \
                 attempts, available_at, last_error, dead_lettered_at \
                 FROM event_claims WHERE event_id = ?1 ORDER BY handler_id ASC",
            )
            .map_err(|e| storage_err("inspect_event", e))?;
        let claims = stmt
            .query_map(params![id], |row| {
                Ok(ClaimRecord {
                    event_id: row.get(0)?,
                    handler_id: row.get(1)?,
                    session_id: row.get(2)?,
                    claimed_at: row.get(3)?,
                    lease_until: row.get(4)?,
                    ack_at: row.get(5)?,
                    attempts: row.get::<_, i64>(6)? as u32,
                    available_at: row.get(7)?,
                    last_error: row.get(8)?,
                    dead_lettered_at: row.get(9)?,
                })
            })
            .map_err(|e| storage_err("inspect_event", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage_err("inspect_event", e))?;

        Ok(Some(EventDetail {
            envelope: row_to_envelope(
                id,
                event_type,
                payload,
                created_at,
                priority,
                root_event_id,
                depth,
            )?,
            namespace: ns,
            claims,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use trellis_core::Event;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: i64,
    }

    impl Event for Ping {
        fn event_type() -> &'static str {
            "ping"
        }
    }

    fn store() -> SqliteEventStore {
        let conn = Rc::new(Connection::open_in_memory().unwrap());
        let mut config = TrellisConfig::default();
        config.event_max_attempts = 3;
        config.event_backoff_base_ms = 10;
        config.event_backoff_max_ms = 100;
        SqliteEventStore::new(conn, config).unwrap()
    }

    fn enqueue(store: &SqliteEventStore, n: i64) -> EventEnvelope {
        let env = EventEnvelope::new(&Ping { n }).unwrap();
        store.enqueue(&env, "default").unwrap();
        env
    }

    #[test]
    fn test_claim_orders_by_priority_then_age() {
        let s = store();
        let mut low = EventEnvelope::new(&Ping { n: 1 }).unwrap();
        low.priority = 10;
        s.enqueue(&low, "default").unwrap();
        let mut high = EventEnvelope::new(&Ping { n: 2 }).unwrap();
        high.priority = 200;
        s.enqueue(&high, "default").unwrap();

        let claimed = s
            .claim("default", "h1", "s1", &["ping".to_string()], 10, 30_000)
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].envelope.priority, 200);
        assert_eq!(claimed[1].envelope.priority, 10);
    }

    #[test]
    fn test_claim_is_exclusive_per_handler() {
        let s = store();
        enqueue(&s, 1);

        let first = s
            .claim("default", "h1", "s1", &["ping".to_string()], 10, 30_000)
            .unwrap();
        assert_eq!(first.len(), 1);

        // Same handler, another session: lease still live, nothing to claim.
        let second = s
            .claim("default", "h1", "s2", &["ping".to_string()], 10, 30_000)
            .unwrap();
        assert!(second.is_empty());

        // A different handler claims independently.
        let other = s
            .claim("default", "h2", "s2", &["ping".to_string()], 10, 30_000)
            .unwrap();
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn test_ack_is_terminal() {
        let s = store();
        let env = enqueue(&s, 1);
        s.claim("default", "h1", "s1", &["ping".to_string()], 10, 0)
            .unwrap();
        s.ack("h1", &env.id, "default").unwrap();

        // Lease expired but acked: never reclaimed.
        let again = s
            .claim("default", "h1", "s1", &["ping".to_string()], 10, 30_000)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_release_backoff_then_dead_letter() {
        let s = store();
        let env = enqueue(&s, 1);

        for attempt in 1..=3 {
            let claimed = loop {
                let claimed = s
                    .claim("default", "h1", "s1", &["ping".to_string()], 10, 0)
                    .unwrap();
                if !claimed.is_empty() {
                    break claimed;
                }
                // Waiting out the backoff window.
                std::thread::sleep(std::time::Duration::from_millis(20));
            };
            assert_eq!(claimed.len(), 1);
            s.release("h1", &env.id, "default", Some("boom")).unwrap();

            let detail = s.inspect_event(&env.id, Some("default")).unwrap().unwrap();
            assert_eq!(detail.claims[0].attempts, attempt);
        }

        let detail = s.inspect_event(&env.id, Some("default")).unwrap().unwrap();
        assert!(detail.claims[0].dead_lettered_at.is_some());

        let dead = s.list_dead_letters("default", 10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].last_error, "boom");

        // The synthetic dead-letter event preserves lineage.
        let events = s.list_events("default", 10).unwrap();
        let dl = events
            .iter()
            .find(|e| e.event_type == DEAD_LETTER_EVENT_TYPE)
            .expect("dead letter event enqueued");
        let dl_detail = s.inspect_event(&dl.id, Some("default")).unwrap().unwrap();
        assert_eq!(dl_detail.envelope.root_event_id, env.root_event_id);
        assert_eq!(dl_detail.envelope.chain_depth, env.chain_depth + 1);
    }

    #[test]
    fn test_replay_resets_lineage() {
        let s = store();
        let env = enqueue(&s, 7);
        let new_id = s.replay_event("default", &env.id).unwrap();
        let detail = s.inspect_event(&new_id, Some("default")).unwrap().unwrap();
        assert_eq!(detail.envelope.root_event_id, new_id);
        assert_eq!(detail.envelope.chain_depth, 0);
        assert_eq!(detail.envelope.payload, env.payload);
    }

    #[test]
    fn test_namespace_isolation() {
        let s = store();
        let env = EventEnvelope::new(&Ping { n: 1 }).unwrap();
        s.enqueue(&env, "ns-a").unwrap();

        let other = s
            .claim("ns-b", "h1", "s1", &["ping".to_string()], 10, 30_000)
            .unwrap();
        assert!(other.is_empty());

        let own = s
            .claim("ns-a", "h1", "s1", &["ping".to_string()], 10, 30_000)
            .unwrap();
        assert_eq!(own.len(), 1);
    }

    #[test]
    fn test_cleanup_events() {
        let s = store();
        enqueue(&s, 1);
        enqueue(&s, 2);
        let removed = s
            .cleanup_events("default", clock::now() + Duration::seconds(1))
            .unwrap();
        assert_eq!(removed, 2);
        assert!(s.list_events("default", 10).unwrap().is_empty());
    }

    #[test]
    fn test_sessions_and_heartbeat() {
        let s = store();
        s.register_session("s1", "default", &serde_json::json!({"pid": 1}))
            .unwrap();
        s.heartbeat("s1", "default").unwrap();

        let sessions = s.list_sessions("default", 60_000).unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].is_dead);

        let dead_view = s.list_sessions("default", 0).unwrap();
        assert!(dead_view[0].is_dead);

        let namespaces = s.list_namespaces(60_000).unwrap();
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].sessions, 1);
    }
}
