//! Trellis Core: types and traits for the trellis ontology storage engine
//!
//! This crate defines the shared abstractions for a typed, append-only
//! ontology store with a reactive event bus:
//! - Typed schemas with canonical type-spec trees for drift detection
//! - A backend-agnostic `Repository` contract (transactional and
//!   object-store backends implement it)
//! - A predicate AST shared by the SQL compiler and the in-process evaluator
//! - Durable event envelopes with per-(event, handler) claim records
//!
//! Key properties:
//! - Append-only history: logical updates append new rows, never mutate
//! - Monotonic commit ids serialised through a write lease
//! - Per-type schema versions with activation-commit boundaries

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod hash;
pub mod model;
pub mod repo;
pub mod schema;
pub mod type_spec;

pub use config::TrellisConfig;
pub use error::{Result, TrellisError};
pub use event::{
    backoff_delay_ms, ClaimRecord, ClaimState, ClaimedEvent, DeadLetterEvent, DeadLetterRecord,
    Event, EventDetail, EventEnvelope, EventSummary, NamespaceSummary, Schedule, SessionSummary,
    DEAD_LETTER_EVENT_TYPE,
};
pub use filter::{
    field, left, right, AnyPathRef, CompareOp, EndpointField, FieldRef, FieldScope, FilterExpr,
    ScalarValue,
};
pub use model::{Entity, Hydrated, Identity, Intent, IntentBatch, Meta, Relation};
pub use repo::{
    AggSpec, Aggregate, ChangeOp, CommitChange, CommitInfo, Direction, EndpointTypes, EntityRow,
    EventStore, GroupBySpec, HavingSpec, QueryDiagnostics, QuerySpec, RelationRow, Repository,
    SchemaVersionRecord, StorageInfo, TemporalMode,
};
pub use schema::{FieldDef, TypeKind, TypeSchema, TypeSchemaDiff};
pub use type_spec::TypeSpec;

/// JSON object alias used for row payloads throughout the engine.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
