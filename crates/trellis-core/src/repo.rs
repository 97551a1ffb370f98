//! Backend-agnostic repository and event-store contracts.
//!
//! Both storage backends implement [`Repository`]: writes are serialised
//! through the backend's write lease, reads are snapshot-consistent
//! against a single head, and commits fail atomically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::event::{
    ClaimedEvent, DeadLetterRecord, EventDetail, EventEnvelope, EventSummary, NamespaceSummary,
    SessionSummary,
};
use crate::filter::FilterExpr;
use crate::schema::TypeKind;
use crate::JsonMap;

/// Temporal window of a query, scoped to the active schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemporalMode {
    /// Latest row per identity.
    #[default]
    Latest,
    /// Latest row per identity at or before the given commit.
    AsOf(i64),
    /// Every history row, ordered `commit_id ASC`.
    WithHistory,
    /// History rows strictly after the given commit.
    HistorySince(i64),
}

impl TemporalMode {
    pub fn is_latest(&self) -> bool {
        matches!(self, TemporalMode::Latest)
    }

    /// Whether the mode returns raw history rows without deduplication.
    pub fn is_history(&self) -> bool {
        matches!(self, TemporalMode::WithHistory | TemporalMode::HistorySince(_))
    }
}

/// Declarative query parameters handed to a backend.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub filter: Option<FilterExpr>,
    /// Payload field to order by.
    pub order_by: Option<String>,
    pub order_desc: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub temporal: TemporalMode,
    /// Active schema version; temporal modes restrict rows to it.
    pub schema_version_id: Option<i64>,
}

/// One materialised entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub key: String,
    pub fields: JsonMap,
    pub commit_id: i64,
    pub schema_version_id: Option<i64>,
}

/// One materialised relation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRow {
    pub left_key: String,
    pub right_key: String,
    pub instance_key: String,
    pub fields: JsonMap,
    pub commit_id: i64,
    pub schema_version_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: i64,
    pub created_at: String,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    UpdateVersion,
}

/// One change record of a commit, with the inferred operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitChange {
    pub kind: TypeKind,
    pub type_name: String,
    pub key: Option<String>,
    pub left_key: Option<String>,
    pub right_key: Option<String>,
    pub instance_key: Option<String>,
    pub operation: ChangeOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersionRecord {
    pub schema_version_id: i64,
    pub schema_json: String,
    pub schema_hash: String,
    pub created_at: String,
    pub runtime_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    /// Average `json_array_length` of a list field; null lists excluded,
    /// empty lists contribute zero.
    AvgLen,
}

impl Aggregate {
    pub fn sql_name(&self) -> &'static str {
        match self {
            Aggregate::Count => "COUNT",
            Aggregate::Sum => "SUM",
            Aggregate::Avg => "AVG",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
            Aggregate::AvgLen => "AVG",
        }
    }
}

/// Aggregation request: function plus optional payload field.
#[derive(Debug, Clone, PartialEq)]
pub struct AggSpec {
    pub func: Aggregate,
    pub field: Option<String>,
}

/// HAVING clause applied to grouped aggregation.
#[derive(Debug, Clone)]
pub struct HavingSpec {
    pub agg: AggSpec,
    pub op: crate::filter::CompareOp,
    pub value: Value,
}

/// Grouped aggregation request.
#[derive(Debug, Clone)]
pub struct GroupBySpec {
    pub group_field: String,
    /// `(alias, spec)` pairs, in output order.
    pub aggs: Vec<(String, AggSpec)>,
    pub having: Option<HavingSpec>,
}

/// Endpoint entity types of a relation query; required when the filter
/// references `left(...)` / `right(...)` fields.
#[derive(Debug, Clone, Default)]
pub struct EndpointTypes {
    pub left: Option<String>,
    pub right: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
}

/// Structured diagnostic attached to the last query, e.g. temporal reads
/// before a schema version's activation commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDiagnostics {
    pub reason: String,
    pub activation_commit_id: i64,
}

/// Operator-facing backend description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub backend: String,
    pub engine_version: String,
    pub detail: Value,
}

/// Backend contract shared by the transactional and object-store engines.
///
/// Writes happen between `begin_transaction` and `commit_transaction`
/// while holding the write lock; `commit_transaction` is the atomic
/// visibility point. Readers always observe a single committed head.
pub trait Repository {
    fn close(&self) -> Result<()>;
    fn storage_info(&self) -> StorageInfo;
    fn last_query_diagnostics(&self) -> Option<QueryDiagnostics>;

    // --- Commits ---

    /// Allocate the next commit id and record its metadata. Requires the
    /// write lock on backends that stage commits.
    fn create_commit(&self, metadata: Option<Value>) -> Result<i64>;
    fn head_commit_id(&self) -> Result<Option<i64>>;
    fn get_commit(&self, commit_id: i64) -> Result<Option<CommitInfo>>;
    fn list_commits(&self, limit: usize, since_commit_id: Option<i64>)
        -> Result<Vec<CommitInfo>>;
    fn list_commit_changes(&self, commit_id: i64) -> Result<Vec<CommitChange>>;
    fn count_commit_operations(&self, commit_id: i64) -> Result<usize>;

    // --- Entities ---

    fn latest_entity(&self, type_name: &str, key: &str) -> Result<Option<EntityRow>>;
    fn insert_entity(
        &self,
        type_name: &str,
        key: &str,
        fields: &JsonMap,
        commit_id: i64,
        schema_version_id: Option<i64>,
    ) -> Result<()>;
    fn query_entities(&self, type_name: &str, spec: &QuerySpec) -> Result<Vec<EntityRow>>;
    fn count_entities(&self, type_name: &str, filter: Option<&FilterExpr>) -> Result<u64>;
    fn aggregate_entities(
        &self,
        type_name: &str,
        agg: &AggSpec,
        filter: Option<&FilterExpr>,
    ) -> Result<Value>;
    fn group_by_entities(
        &self,
        type_name: &str,
        spec: &GroupBySpec,
        filter: Option<&FilterExpr>,
    ) -> Result<Vec<JsonMap>>;

    // --- Relations ---

    fn latest_relation(
        &self,
        type_name: &str,
        left_key: &str,
        right_key: &str,
        instance_key: &str,
    ) -> Result<Option<RelationRow>>;
    #[allow(clippy::too_many_arguments)]
    fn insert_relation(
        &self,
        type_name: &str,
        left_key: &str,
        right_key: &str,
        instance_key: &str,
        fields: &JsonMap,
        commit_id: i64,
        schema_version_id: Option<i64>,
    ) -> Result<()>;
    fn query_relations(
        &self,
        type_name: &str,
        endpoints: &EndpointTypes,
        spec: &QuerySpec,
    ) -> Result<Vec<RelationRow>>;
    fn count_relations(
        &self,
        type_name: &str,
        endpoints: &EndpointTypes,
        filter: Option<&FilterExpr>,
    ) -> Result<u64>;
    fn aggregate_relations(
        &self,
        type_name: &str,
        agg: &AggSpec,
        filter: Option<&FilterExpr>,
    ) -> Result<Value>;
    fn group_by_relations(
        &self,
        type_name: &str,
        endpoints: &EndpointTypes,
        spec: &GroupBySpec,
        filter: Option<&FilterExpr>,
    ) -> Result<Vec<JsonMap>>;
    fn relations_for_entity(
        &self,
        relation_type: &str,
        entity_key: &str,
        direction: Direction,
    ) -> Result<Vec<RelationRow>>;

    // --- Schema registry and versions ---

    fn get_schema(&self, kind: TypeKind, name: &str) -> Result<Option<Value>>;
    fn store_schema(&self, kind: TypeKind, name: &str, schema: &Value) -> Result<()>;
    fn list_schemas(&self, kind: TypeKind) -> Result<Vec<(String, Value)>>;
    fn create_schema_version(
        &self,
        kind: TypeKind,
        name: &str,
        schema_json: &str,
        schema_hash: &str,
        runtime_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<i64>;
    fn current_schema_version(
        &self,
        kind: TypeKind,
        name: &str,
    ) -> Result<Option<SchemaVersionRecord>>;
    fn get_schema_version(
        &self,
        kind: TypeKind,
        name: &str,
        version_id: i64,
    ) -> Result<Option<SchemaVersionRecord>>;
    fn list_schema_versions(
        &self,
        kind: TypeKind,
        name: &str,
    ) -> Result<Vec<SchemaVersionRecord>>;

    /// Mark a schema version current for typed reads, recording its
    /// activation commit. No-op on engines without version partitions.
    fn activate_schema_version(
        &self,
        kind: TypeKind,
        name: &str,
        schema_version_id: i64,
        activation_commit_id: i64,
    ) -> Result<()> {
        let _ = (kind, name, schema_version_id, activation_commit_id);
        Ok(())
    }

    fn count_latest_entities(&self, type_name: &str) -> Result<u64>;
    fn count_latest_relations(&self, type_name: &str) -> Result<u64>;
    /// Current-state rows for migration scans.
    fn latest_entity_rows(&self, type_name: &str) -> Result<Vec<EntityRow>>;
    fn latest_relation_rows(&self, type_name: &str) -> Result<Vec<RelationRow>>;

    // --- Write lock ---

    fn acquire_lock(&self, owner_id: &str, timeout_ms: u64, lease_ms: u64) -> Result<bool>;
    fn renew_lock(&self, owner_id: &str, lease_ms: u64) -> Result<bool>;
    fn release_lock(&self, owner_id: &str) -> Result<()>;

    /// A `Send` renewal closure usable from a keep-alive thread. Each
    /// invocation renews the lease and reports success.
    fn lock_renewer(
        &self,
        owner_id: &str,
        lease_ms: u64,
    ) -> Result<Box<dyn FnMut() -> bool + Send>>;

    // --- Transactions ---

    fn begin_transaction(&self) -> Result<()>;
    fn commit_transaction(&self) -> Result<()>;
    fn rollback_transaction(&self) -> Result<()>;

    // --- Event bus ---

    /// The backend's event store, sharing its coordination substrate.
    fn event_store(&self) -> Result<Box<dyn EventStore>>;
}

/// Durable, namespaced event store with per-(event, handler) claims.
pub trait EventStore {
    fn enqueue(&self, envelope: &EventEnvelope, namespace: &str) -> Result<()>;

    /// Atomically claim up to `limit` Unclaimed/Reclaimable events of the
    /// given types, ordered `(priority DESC, created_at ASC, id ASC)`.
    fn claim(
        &self,
        namespace: &str,
        handler_id: &str,
        session_id: &str,
        event_types: &[String],
        limit: usize,
        lease_ms: u64,
    ) -> Result<Vec<ClaimedEvent>>;

    fn ack(&self, handler_id: &str, event_id: &str, namespace: &str) -> Result<()>;

    /// Record a failed attempt: schedule backoff, or dead-letter once the
    /// attempt budget is exhausted (emitting the synthetic audit event).
    fn release(
        &self,
        handler_id: &str,
        event_id: &str,
        namespace: &str,
        error: Option<&str>,
    ) -> Result<()>;

    fn register_session(&self, session_id: &str, namespace: &str, metadata: &Value)
        -> Result<()>;
    fn heartbeat(&self, session_id: &str, namespace: &str) -> Result<()>;

    fn list_namespaces(&self, session_ttl_ms: u64) -> Result<Vec<NamespaceSummary>>;
    fn list_sessions(&self, namespace: &str, session_ttl_ms: u64)
        -> Result<Vec<SessionSummary>>;
    fn list_events(&self, namespace: &str, limit: usize) -> Result<Vec<EventSummary>>;
    fn list_dead_letters(&self, namespace: &str, limit: usize)
        -> Result<Vec<DeadLetterRecord>>;

    /// Delete events (and their claims) created before the cutoff.
    fn cleanup_events(&self, namespace: &str, before: DateTime<Utc>) -> Result<usize>;

    /// Re-enqueue a copy of a stored event as a fresh root event; returns
    /// the new event id.
    fn replay_event(&self, namespace: &str, event_id: &str) -> Result<String>;

    fn inspect_event(&self, event_id: &str, namespace: Option<&str>)
        -> Result<Option<EventDetail>>;
}
