//! Handler registry and execution context for the reactive loop.
//!
//! Handlers are explicit values carrying `{event_type, priority,
//! callable}`; the typed constructor wires payload decoding so a handler
//! body receives its event struct directly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use trellis_core::error::Result;
use trellis_core::event::{Event, EventEnvelope};
use trellis_core::model::IntentBatch;

use crate::session::Session;

type HandlerFn = Box<dyn Fn(&mut HandlerContext<'_>) -> Result<()>>;

/// A registered event handler.
pub struct Handler {
    pub(crate) event_type: String,
    pub(crate) handler_id: String,
    pub(crate) priority: i64,
    pub(crate) func: HandlerFn,
}

impl Handler {
    /// Register `func` for the event type `E`. The handler id must be
    /// stable across sessions: it keys the claim records.
    pub fn new<E, F>(handler_id: &str, func: F) -> Handler
    where
        E: Event + 'static,
        F: Fn(&mut HandlerContext<'_>, E) -> Result<()> + 'static,
    {
        Handler {
            event_type: E::event_type().to_string(),
            handler_id: handler_id.to_string(),
            priority: 100,
            func: Box::new(move |ctx| {
                let event: E = ctx.envelope.decode()?;
                func(ctx, event)
            }),
        }
    }

    /// Higher-priority handlers run earlier within an iteration.
    pub fn with_priority(mut self, priority: i64) -> Handler {
        self.priority = priority;
        self
    }

    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("event_type", &self.event_type)
            .field("handler_id", &self.handler_id)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Context supplied to a handler invocation.
///
/// Intents queued via `ensure` and events buffered via `emit` are only
/// promoted when the handler succeeds; on failure both are discarded and
/// the claim is released for retry.
pub struct HandlerContext<'a> {
    pub envelope: EventEnvelope,
    pub lease_until: DateTime<Utc>,
    pub(crate) session: &'a mut Session,
    pub(crate) buffered: Vec<EventEnvelope>,
    pub(crate) commit_meta: BTreeMap<String, String>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        session: &'a mut Session,
        envelope: EventEnvelope,
        lease_until: DateTime<Utc>,
    ) -> HandlerContext<'a> {
        HandlerContext {
            envelope,
            lease_until,
            session,
            buffered: Vec::new(),
            commit_meta: BTreeMap::new(),
        }
    }

    /// Queue intents for the next `commit` from this handler.
    pub fn ensure(&mut self, intents: impl Into<IntentBatch>) {
        self.session.ensure(intents);
    }

    /// Buffer a derived event, stamped with this event's lineage.
    /// Rejected immediately when the chain depth limit is exceeded.
    pub fn emit<E: Event>(&mut self, event: &E) -> Result<()> {
        let max_depth = self.session.config().max_event_chain_depth;
        let derived = EventEnvelope::new(event)?.derive_from(&self.envelope, max_depth)?;
        self.buffered.push(derived);
        Ok(())
    }

    /// Attach a metadata entry to the next commit from this handler.
    pub fn add_commit_meta(&mut self, key: &str, value: &str) {
        self.commit_meta.insert(key.to_string(), value.to_string());
    }

    /// Lease-aware commit of queued intents.
    pub fn commit(&mut self) -> Result<Option<i64>> {
        let meta = std::mem::take(&mut self.commit_meta);
        self.session
            .commit_from_handler(None, meta, self.lease_until)
    }

    /// Lease-aware commit that also enqueues a derived event on success.
    /// With an empty delta, no commit row is created but the event is
    /// still enqueued.
    pub fn commit_with_event<E: Event>(&mut self, event: &E) -> Result<Option<i64>> {
        let max_depth = self.session.config().max_event_chain_depth;
        let derived = EventEnvelope::new(event)?.derive_from(&self.envelope, max_depth)?;
        let meta = std::mem::take(&mut self.commit_meta);
        self.session
            .commit_from_handler(Some(derived), meta, self.lease_until)
    }

    /// Query builder over the session's repository.
    pub fn query(&self) -> crate::query::QueryBuilder<'_> {
        self.session.query()
    }

    /// Request a graceful stop of the event loop after this handler.
    pub fn stop(&mut self) {
        self.session.stop();
    }
}

/// Validate and order handler entries: duplicates rejected, execution
/// order `(priority DESC, handler_id ASC)`.
pub(crate) fn order_handlers(handlers: &[Handler]) -> Result<Vec<usize>> {
    let mut seen = std::collections::BTreeSet::new();
    for handler in handlers {
        if !seen.insert(handler.handler_id.clone()) {
            return Err(trellis_core::TrellisError::Handler(format!(
                "duplicate handler: {}",
                handler.handler_id
            )));
        }
    }
    let mut order: Vec<usize> = (0..handlers.len()).collect();
    order.sort_by(|&a, &b| {
        (-handlers[a].priority, &handlers[a].handler_id)
            .cmp(&(-handlers[b].priority, &handlers[b].handler_id))
    });
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl Event for Ping {
        fn event_type() -> &'static str {
            "ping"
        }
    }

    #[test]
    fn test_order_handlers() {
        let handlers = vec![
            Handler::new::<Ping, _>("b", |_, _| Ok(())),
            Handler::new::<Ping, _>("a", |_, _| Ok(())),
            Handler::new::<Ping, _>("c", |_, _| Ok(())).with_priority(200),
        ];
        let order = order_handlers(&handlers).unwrap();
        let ids: Vec<&str> = order
            .iter()
            .map(|&i| handlers[i].handler_id())
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let handlers = vec![
            Handler::new::<Ping, _>("a", |_, _| Ok(())),
            Handler::new::<Ping, _>("a", |_, _| Ok(())),
        ];
        assert!(order_handlers(&handlers).is_err());
    }
}
