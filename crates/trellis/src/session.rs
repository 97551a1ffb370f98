//! Session: unit of work, schema validation, commit path, event loop.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use uuid::Uuid;

use trellis_core::clock;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{Event, EventEnvelope, Schedule};
use trellis_core::model::{Entity, Identity, IntentBatch, Relation};
use trellis_core::repo::{CommitChange, CommitInfo, EventStore, Repository};
use trellis_core::schema::{
    build_schema_diff, legacy_type_spec_upgrade_matches, TypeKind, TypeSchema, TypeSchemaDiff,
};
use trellis_core::TrellisConfig;

use crate::handlers::{order_handlers, Handler, HandlerContext};
use crate::migration::{
    compute_migration_token, compute_plan_hash, verify_token, LeaseKeepAlive, MigrationPreview,
    MigrationResult, UpgraderRegistry,
};
use crate::query::QueryBuilder;
use crate::reconcile::reconcile;
use crate::uri::open_repository;

const HEAD_RETRY_BUDGET: u32 = 3;

/// Builder for [`Session`]: datastore binding plus the typed models the
/// session validates against stored schemas.
pub struct SessionBuilder {
    uri: String,
    namespace: Option<String>,
    config: TrellisConfig,
    engine_version: Option<String>,
    entity_schemas: BTreeMap<String, TypeSchema>,
    relation_schemas: BTreeMap<String, TypeSchema>,
    instance_metadata: serde_json::Map<String, Value>,
}

impl SessionBuilder {
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    pub fn config(mut self, config: TrellisConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine_version(mut self, engine_version: &str) -> Self {
        self.engine_version = Some(engine_version.to_string());
        self
    }

    /// Register an entity type for schema validation and migration.
    pub fn entity<T: Entity>(mut self) -> Self {
        self.entity_schemas
            .insert(T::type_name().to_string(), T::schema());
        self
    }

    /// Register a relation type for schema validation and migration.
    pub fn relation<T: Relation>(mut self) -> Self {
        self.relation_schemas
            .insert(T::type_name().to_string(), T::schema());
        self
    }

    pub fn instance_metadata(mut self, key: &str, value: Value) -> Self {
        self.instance_metadata.insert(key.to_string(), value);
        self
    }

    pub fn open(self) -> Result<Session> {
        for schema in self.entity_schemas.values().chain(self.relation_schemas.values()) {
            schema.validate()?;
        }

        let repo = open_repository(&self.uri, &self.config, self.engine_version.as_deref())?;
        let event_store = repo.event_store()?;
        let backend = repo.storage_info().backend;

        let runtime_id = self
            .config
            .runtime_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let namespace = self
            .namespace
            .unwrap_or_else(|| self.config.default_namespace.clone());

        let mut metadata = self.instance_metadata;
        metadata
            .entry("namespace".to_string())
            .or_insert_with(|| Value::from(namespace.clone()));

        Ok(Session {
            repo,
            event_store,
            backend,
            config: self.config,
            namespace,
            session_id: Uuid::new_v4().to_string(),
            runtime_id,
            datastore_uri: self.uri,
            entity_schemas: self.entity_schemas,
            relation_schemas: self.relation_schemas,
            schema_version_ids: BTreeMap::new(),
            schema_validated: false,
            intents: Vec::new(),
            stop_requested: false,
            instance_metadata: Value::Object(metadata),
        })
    }
}

/// A session over one datastore: FIFO intent queue, validated schema
/// cache, commit API, query surface, and the reactive event loop.
pub struct Session {
    repo: Box<dyn Repository>,
    event_store: Box<dyn EventStore>,
    backend: String,
    config: TrellisConfig,
    namespace: String,
    session_id: String,
    runtime_id: String,
    datastore_uri: String,
    entity_schemas: BTreeMap<String, TypeSchema>,
    relation_schemas: BTreeMap<String, TypeSchema>,
    schema_version_ids: BTreeMap<String, i64>,
    schema_validated: bool,
    intents: Vec<trellis_core::model::Intent>,
    stop_requested: bool,
    instance_metadata: Value,
}

impl Session {
    pub fn builder(datastore_uri: &str) -> SessionBuilder {
        SessionBuilder {
            uri: datastore_uri.to_string(),
            namespace: None,
            config: TrellisConfig::default(),
            engine_version: None,
            entity_schemas: BTreeMap::new(),
            relation_schemas: BTreeMap::new(),
            instance_metadata: serde_json::Map::new(),
        }
    }

    /// Open a session without registered types (untyped tooling access).
    pub fn open(datastore_uri: &str) -> Result<Session> {
        Self::builder(datastore_uri).open()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn datastore_uri(&self) -> &str {
        &self.datastore_uri
    }

    pub fn config(&self) -> &TrellisConfig {
        &self.config
    }

    /// Backend repository, for low-level tooling and tests.
    pub fn repo(&self) -> &dyn Repository {
        self.repo.as_ref()
    }

    /// Backend event store, for operator tooling.
    pub fn event_store(&self) -> &dyn EventStore {
        self.event_store.as_ref()
    }

    pub fn close(self) -> Result<()> {
        self.repo.close()
    }

    /// Request a graceful stop of a running event loop.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    // --- Intents and commits ---

    /// Queue intents for the next commit. An empty batch is a no-op.
    pub fn ensure(&mut self, intents: impl Into<IntentBatch>) {
        let batch: IntentBatch = intents.into();
        self.intents.extend(batch.0);
    }

    pub fn pending_intents(&self) -> usize {
        self.intents.len()
    }

    /// Reconcile queued intents and persist a commit. Returns the commit
    /// id, or `None` when the delta was empty.
    pub fn commit(&mut self) -> Result<Option<i64>> {
        self.commit_internal(None, BTreeMap::new(), None)
    }

    /// Commit queued intents and enqueue a root event. With an empty
    /// delta no commit row is created, but the event is still enqueued.
    pub fn commit_with_event<E: Event>(&mut self, event: &E) -> Result<Option<i64>> {
        let envelope = EventEnvelope::new(event)?;
        self.commit_internal(Some(envelope), BTreeMap::new(), None)
    }

    pub(crate) fn commit_from_handler(
        &mut self,
        event: Option<EventEnvelope>,
        commit_meta: BTreeMap<String, String>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        self.commit_internal(event, commit_meta, Some(lease_until))
    }

    fn commit_internal(
        &mut self,
        event: Option<EventEnvelope>,
        commit_meta: BTreeMap<String, String>,
        lease_until: Option<DateTime<Utc>>,
    ) -> Result<Option<i64>> {
        // Lease-aware guard: refuse to commit inside the lease safety
        // margin so a reclaiming session cannot observe a double write.
        if let Some(lease_until) = lease_until {
            let margin =
                chrono::Duration::milliseconds((self.config.event_claim_lease_ms / 3) as i64);
            if clock::now() + margin >= lease_until {
                return Err(TrellisError::LeaseExpired);
            }
        }

        if self.intents.is_empty() && event.is_none() {
            return Ok(None);
        }
        if self.intents.len() > self.config.max_batch_size {
            let count = self.intents.len();
            self.intents.clear();
            return Err(TrellisError::BatchSizeExceeded {
                count,
                limit: self.config.max_batch_size,
            });
        }

        self.ensure_schema_validated()?;
        let intents = std::mem::take(&mut self.intents);

        let mut metadata = serde_json::Map::new();
        metadata.insert("namespace".to_string(), Value::from(self.namespace.clone()));
        for (key, value) in &commit_meta {
            metadata.insert(key.clone(), Value::from(value.clone()));
        }
        let metadata = Value::Object(metadata);

        let mut attempt: u32 = 0;
        loop {
            if !self.repo.acquire_lock(
                &self.session_id,
                self.config.store_lock_timeout_ms,
                self.config.store_lease_ttl_ms,
            )? {
                return Err(TrellisError::LockContention {
                    timeout_ms: self.config.store_lock_timeout_ms,
                });
            }

            let outcome = self.commit_attempt(&intents, event.as_ref(), &metadata);
            let _ = self.repo.release_lock(&self.session_id);

            match outcome {
                Ok(commit_id) => {
                    if let Some(envelope) = &event {
                        if self.backend != "sqlite" {
                            self.event_store.enqueue(envelope, &self.namespace)?;
                        }
                    }
                    return Ok(commit_id);
                }
                Err(TrellisError::HeadMismatch { .. }) if attempt < HEAD_RETRY_BUDGET => {
                    attempt += 1;
                    let jitter: u64 = rand::thread_rng().gen_range(0..10);
                    std::thread::sleep(Duration::from_millis(
                        10u64.saturating_mul(1u64 << attempt) + jitter,
                    ));
                }
                Err(TrellisError::HeadMismatch { .. }) => {
                    return Err(TrellisError::HeadMismatch {
                        retries: HEAD_RETRY_BUDGET,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One serialised commit attempt under the write lock.
    fn commit_attempt(
        &mut self,
        intents: &[trellis_core::model::Intent],
        event: Option<&EventEnvelope>,
        metadata: &Value,
    ) -> Result<Option<i64>> {
        let changes = reconcile(self.repo.as_ref(), intents.to_vec())?;
        if !changes.is_empty() {
            self.assert_no_schema_drift(&changes)?;
        }

        let result = (|| -> Result<Option<i64>> {
            self.repo.begin_transaction()?;

            let mut commit_id = None;
            if !changes.is_empty() {
                let cid = self.repo.create_commit(Some(metadata.clone()))?;
                for change in &changes {
                    let svid = self
                        .schema_version_ids
                        .get(change.identity.type_name())
                        .copied();
                    match &change.identity {
                        Identity::Entity { type_name, key } => {
                            self.repo
                                .insert_entity(type_name, key, &change.payload, cid, svid)?;
                        }
                        Identity::Relation {
                            type_name,
                            left_key,
                            right_key,
                            instance_key,
                        } => {
                            self.repo.insert_relation(
                                type_name,
                                left_key,
                                right_key,
                                instance_key,
                                &change.payload,
                                cid,
                                svid,
                            )?;
                        }
                    }
                }
                commit_id = Some(cid);
            }

            // The transactional backend enqueues inside the commit
            // transaction; object backends enqueue after publication.
            if let Some(envelope) = event {
                if self.backend == "sqlite" {
                    self.event_store.enqueue(envelope, &self.namespace)?;
                }
            }

            self.repo.commit_transaction()?;
            Ok(commit_id)
        })();

        if result.is_err() {
            let _ = self.repo.rollback_transaction();
        }
        result
    }

    // --- Schema validation ---

    fn code_schema(&self, kind: TypeKind, name: &str) -> Option<&TypeSchema> {
        match kind {
            TypeKind::Entity => self.entity_schemas.get(name),
            TypeKind::Relation => self.relation_schemas.get(name),
        }
    }

    fn registered_types(&self) -> Vec<(TypeKind, String)> {
        let mut out: Vec<(TypeKind, String)> = Vec::new();
        out.extend(
            self.entity_schemas
                .keys()
                .map(|n| (TypeKind::Entity, n.clone())),
        );
        out.extend(
            self.relation_schemas
                .keys()
                .map(|n| (TypeKind::Relation, n.clone())),
        );
        out
    }

    fn ensure_schema_validated(&mut self) -> Result<()> {
        if self.schema_validated
            || (self.entity_schemas.is_empty() && self.relation_schemas.is_empty())
        {
            return Ok(());
        }
        self.validate()
    }

    /// Validate code-defined schemas against the latest stored versions.
    /// New types are stored as version 1; stored schemas lacking type
    /// specs are upgraded in place when legacy synthesis matches.
    pub fn validate(&mut self) -> Result<()> {
        let lock_owner = if self.backend != "sqlite" {
            let owner = format!("schema-validate-{}", self.runtime_id);
            if !self.repo.acquire_lock(
                &owner,
                self.config.store_lock_timeout_ms,
                self.config.store_lease_ttl_ms,
            )? {
                return Err(TrellisError::LockContention {
                    timeout_ms: self.config.store_lock_timeout_ms,
                });
            }
            Some(owner)
        } else {
            None
        };

        let outcome = self.validate_inner();

        if let Some(owner) = lock_owner {
            let _ = self.repo.release_lock(&owner);
        }
        outcome
    }

    fn validate_inner(&mut self) -> Result<()> {
        let mut diffs: Vec<TypeSchemaDiff> = Vec::new();
        let mut version_ids: BTreeMap<String, i64> = BTreeMap::new();

        for (kind, name) in self.registered_types() {
            let schema = self.code_schema(kind, &name).expect("registered above");
            let code_value = schema.to_canonical_value();
            let code_json = schema.canonical_json();
            let code_hash = schema.hash();

            let stored = self.repo.current_schema_version(kind, &name)?;
            match stored {
                None => {
                    let vid = self.repo.create_schema_version(
                        kind,
                        &name,
                        &code_json,
                        &code_hash,
                        Some(&self.runtime_id),
                        Some("initial"),
                    )?;
                    self.repo.store_schema(kind, &name, &code_value)?;
                    version_ids.insert(name, vid);
                }
                Some(stored) if stored.schema_hash == code_hash => {
                    version_ids.insert(name, stored.schema_version_id);
                }
                Some(stored) => {
                    let stored_schema: Value = serde_json::from_str(&stored.schema_json)
                        .map_err(|e| TrellisError::Serialization(e.to_string()))?;
                    if legacy_type_spec_upgrade_matches(&stored_schema, &code_value) {
                        // Stored schema predates type specs; re-store the
                        // upgraded schema to avoid future drift.
                        let vid = self.repo.create_schema_version(
                            kind,
                            &name,
                            &code_json,
                            &code_hash,
                            Some(&self.runtime_id),
                            Some("type_spec_upgrade"),
                        )?;
                        self.repo.store_schema(kind, &name, &code_value)?;
                        version_ids.insert(name, vid);
                    } else {
                        diffs.push(build_schema_diff(
                            kind,
                            &name,
                            stored.schema_version_id,
                            &stored_schema,
                            &code_value,
                        ));
                    }
                }
            }
        }

        if !diffs.is_empty() {
            self.schema_validated = false;
            self.schema_version_ids.clear();
            return Err(TrellisError::SchemaOutdated { diffs });
        }

        self.schema_version_ids = version_ids;
        self.schema_validated = true;
        Ok(())
    }

    /// Abort a write when a touched type's stored schema version drifted
    /// from the validated snapshot.
    fn assert_no_schema_drift(&mut self, changes: &[crate::reconcile::Change]) -> Result<()> {
        if !self.schema_validated {
            return Ok(());
        }

        let mut touched: Vec<(TypeKind, String)> = changes
            .iter()
            .map(|c| match &c.identity {
                Identity::Entity { type_name, .. } => (TypeKind::Entity, type_name.clone()),
                Identity::Relation { type_name, .. } => (TypeKind::Relation, type_name.clone()),
            })
            .collect();
        touched.sort();
        touched.dedup();

        let mut diffs = Vec::new();
        for (kind, type_name) in touched {
            let Some(expected) = self.schema_version_ids.get(&type_name).copied() else {
                continue;
            };
            let Some(code) = self.code_schema(kind, &type_name) else {
                continue;
            };
            let code_value = code.to_canonical_value();

            match self.repo.current_schema_version(kind, &type_name)? {
                None => {
                    diffs.push(build_schema_diff(kind, &type_name, 0, &json!({"fields": {}}), &code_value));
                }
                Some(stored) if stored.schema_version_id == expected => {}
                Some(stored) => {
                    let stored_schema: Value = serde_json::from_str(&stored.schema_json)
                        .map_err(|e| TrellisError::Serialization(e.to_string()))?;
                    diffs.push(build_schema_diff(
                        kind,
                        &type_name,
                        stored.schema_version_id,
                        &stored_schema,
                        &code_value,
                    ));
                }
            }
        }

        if !diffs.is_empty() {
            self.schema_validated = false;
            return Err(TrellisError::SchemaOutdated { diffs });
        }
        Ok(())
    }

    // --- Queries and inspection ---

    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self.repo.as_ref(), self.schema_version_ids.clone())
    }

    pub fn list_commits(
        &self,
        limit: usize,
        since_commit_id: Option<i64>,
    ) -> Result<Vec<CommitInfo>> {
        self.repo.list_commits(limit, since_commit_id)
    }

    pub fn get_commit(&self, commit_id: i64) -> Result<Option<CommitInfo>> {
        self.repo.get_commit(commit_id)
    }

    pub fn list_commit_changes(&self, commit_id: i64) -> Result<Vec<CommitChange>> {
        self.repo.list_commit_changes(commit_id)
    }

    /// Delete events past the configured retention window.
    pub fn cleanup_expired_events(&self) -> Result<usize> {
        let cutoff = clock::now()
            - chrono::Duration::milliseconds(self.config.event_retention_ms as i64);
        self.event_store.cleanup_events(&self.namespace, cutoff)
    }

    // --- Migration ---

    fn compute_migration_plan(
        &mut self,
    ) -> Result<(
        Vec<TypeSchemaDiff>,
        BTreeMap<String, u64>,
        Vec<String>,
        Vec<String>,
    )> {
        let mut diffs = Vec::new();
        let mut estimated_rows = BTreeMap::new();
        let mut schema_only = Vec::new();
        let mut needs_upgrader = Vec::new();

        for (kind, name) in self.registered_types() {
            let schema = self.code_schema(kind, &name).expect("registered above");
            let code_value = schema.to_canonical_value();
            let code_hash = schema.hash();

            let Some(stored) = self.repo.current_schema_version(kind, &name)? else {
                continue;
            };
            if stored.schema_hash == code_hash {
                continue;
            }
            let stored_schema: Value = serde_json::from_str(&stored.schema_json)
                .map_err(|e| TrellisError::Serialization(e.to_string()))?;
            diffs.push(build_schema_diff(
                kind,
                &name,
                stored.schema_version_id,
                &stored_schema,
                &code_value,
            ));

            let rows = match kind {
                TypeKind::Entity => self.repo.count_latest_entities(&name)?,
                TypeKind::Relation => self.repo.count_latest_relations(&name)?,
            };
            estimated_rows.insert(name.clone(), rows);
            if rows == 0 {
                schema_only.push(name);
            } else {
                needs_upgrader.push(name);
            }
        }

        Ok((diffs, estimated_rows, schema_only, needs_upgrader))
    }

    /// Preview a migration: diffs, row estimates, upgrader coverage, and
    /// the plan token required by `migrate_apply`.
    pub fn migrate_preview(
        &mut self,
        upgraders: Option<&UpgraderRegistry>,
    ) -> Result<MigrationPreview> {
        let (diffs, estimated_rows, schema_only, needs_upgrader) =
            self.compute_migration_plan()?;

        if diffs.is_empty() {
            return Ok(MigrationPreview {
                has_changes: false,
                token: String::new(),
                diffs,
                estimated_rows: BTreeMap::new(),
                types_requiring_upgraders: Vec::new(),
                types_schema_only: Vec::new(),
                missing_upgraders: Vec::new(),
            });
        }

        let plan_hash = compute_plan_hash(&diffs);
        let head = self.repo.head_commit_id()?;
        let token = compute_migration_token(&plan_hash, head);

        let missing: Vec<String> = needs_upgrader
            .iter()
            .filter(|name| {
                let stored_version = diffs
                    .iter()
                    .find(|d| &d.type_name == *name)
                    .map(|d| d.stored_version)
                    .unwrap_or(0);
                match upgraders {
                    Some(registry) => !registry.contains(name, stored_version),
                    None => true,
                }
            })
            .cloned()
            .collect();

        Ok(MigrationPreview {
            has_changes: true,
            token,
            diffs,
            estimated_rows,
            types_requiring_upgraders: needs_upgrader,
            types_schema_only: schema_only,
            missing_upgraders: missing,
        })
    }

    /// Apply a migration previously previewed. The token is recomputed
    /// under the write lease and must match unless `force` is set.
    pub fn migrate_apply(
        &mut self,
        token: Option<&str>,
        force: bool,
        upgraders: &UpgraderRegistry,
    ) -> Result<MigrationResult> {
        if !force && token.is_none() {
            return Err(TrellisError::Migration(
                "either a token or force is required for apply".to_string(),
            ));
        }
        if force && token.is_some() {
            return Err(TrellisError::Migration(
                "cannot specify both a token and force".to_string(),
            ));
        }

        let started = std::time::Instant::now();
        let owner = format!("migration-{}-{}", self.runtime_id, Uuid::new_v4());
        let lease_ms = 60_000;
        if !self.repo.acquire_lock(&owner, 10_000, lease_ms)? {
            return Err(TrellisError::Migration(
                "could not acquire write lock for migration".to_string(),
            ));
        }
        let keepalive = LeaseKeepAlive::start(
            self.repo.lock_renewer(&owner, lease_ms)?,
            Duration::from_millis(lease_ms / 3),
        );

        let outcome = self.migrate_apply_locked(token, force, upgraders, started);

        drop(keepalive);
        let _ = self.repo.release_lock(&owner);
        outcome
    }

    fn migrate_apply_locked(
        &mut self,
        token: Option<&str>,
        force: bool,
        upgraders: &UpgraderRegistry,
        started: std::time::Instant,
    ) -> Result<MigrationResult> {
        // Recompute the plan under the lease; the preview token is only
        // valid if nothing moved since.
        let (diffs, estimated_rows, schema_only, needs_upgrader) =
            self.compute_migration_plan()?;
        if diffs.is_empty() {
            return Ok(MigrationResult::empty(started));
        }

        if !force {
            let plan_hash = compute_plan_hash(&diffs);
            let head = self.repo.head_commit_id()?;
            if !verify_token(token.unwrap_or(""), &plan_hash, head) {
                return Err(TrellisError::MigrationToken(
                    "schema or data changed since preview; run migrate_preview again"
                        .to_string(),
                ));
            }
        }

        // Upgrader coverage for types with data.
        let mut missing: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for name in &needs_upgrader {
            let stored_version = diffs
                .iter()
                .find(|d| &d.type_name == name)
                .map(|d| d.stored_version)
                .unwrap_or(0);
            if !upgraders.contains(name, stored_version) {
                missing.insert(name.clone(), vec![stored_version]);
            }
        }
        if !missing.is_empty() {
            return Err(TrellisError::MissingUpgrader { missing });
        }

        let result = (|| -> Result<MigrationResult> {
            self.repo.begin_transaction()?;

            let migrated_types_meta: Vec<Value> = diffs
                .iter()
                .map(|d| {
                    json!({
                        "type_kind": d.type_kind,
                        "type_name": d.type_name,
                        "from_schema_version_id": d.stored_version,
                        "to_schema_version_id": d.stored_version + 1,
                        "rows_rewritten": estimated_rows.get(&d.type_name).copied().unwrap_or(0),
                    })
                })
                .collect();
            let migration_commit = self.repo.create_commit(Some(json!({
                "kind": "migration",
                "migrated_types": migrated_types_meta,
            })))?;

            let mut types_migrated = Vec::new();
            let mut rows_migrated = BTreeMap::new();
            let mut new_versions = BTreeMap::new();

            for diff in &diffs {
                let kind = diff.type_kind;
                let name = diff.type_name.clone();
                let schema = self
                    .code_schema(kind, &name)
                    .expect("plan only covers registered types")
                    .clone();
                let code_value = schema.to_canonical_value();
                let vid = self.repo.create_schema_version(
                    kind,
                    &name,
                    &schema.canonical_json(),
                    &schema.hash(),
                    Some(&self.runtime_id),
                    Some("migration"),
                )?;

                let mut row_count: u64 = 0;
                if !schema_only.contains(&name) {
                    let chain = upgraders.chain(&name, diff.stored_version, diff.stored_version + 1)?;

                    match kind {
                        TypeKind::Entity => {
                            for row in self.repo.latest_entity_rows(&name)? {
                                let mut fields = row.fields.clone();
                                for step in &chain {
                                    fields = step(fields).map_err(|e| {
                                        TrellisError::UpgraderFailed {
                                            type_name: name.clone(),
                                            identity: row.key.clone(),
                                            stage: "upgrade".to_string(),
                                            input: Value::Object(row.fields.clone()).to_string(),
                                            detail: e.to_string(),
                                        }
                                    })?;
                                }
                                schema.validate_payload(&fields).map_err(|e| {
                                    TrellisError::UpgraderFailed {
                                        type_name: name.clone(),
                                        identity: row.key.clone(),
                                        stage: "validate".to_string(),
                                        input: Value::Object(row.fields.clone()).to_string(),
                                        detail: e.to_string(),
                                    }
                                })?;
                                self.repo.insert_entity(
                                    &name,
                                    &row.key,
                                    &fields,
                                    migration_commit,
                                    Some(vid),
                                )?;
                                row_count += 1;
                            }
                        }
                        TypeKind::Relation => {
                            for row in self.repo.latest_relation_rows(&name)? {
                                let identity = format!(
                                    "{}:{}:{}",
                                    row.left_key, row.right_key, row.instance_key
                                );
                                let mut fields = row.fields.clone();
                                for step in &chain {
                                    fields = step(fields).map_err(|e| {
                                        TrellisError::UpgraderFailed {
                                            type_name: name.clone(),
                                            identity: identity.clone(),
                                            stage: "upgrade".to_string(),
                                            input: Value::Object(row.fields.clone()).to_string(),
                                            detail: e.to_string(),
                                        }
                                    })?;
                                }
                                schema.validate_payload(&fields).map_err(|e| {
                                    TrellisError::UpgraderFailed {
                                        type_name: name.clone(),
                                        identity: identity.clone(),
                                        stage: "validate".to_string(),
                                        input: Value::Object(row.fields.clone()).to_string(),
                                        detail: e.to_string(),
                                    }
                                })?;
                                self.repo.insert_relation(
                                    &name,
                                    &row.left_key,
                                    &row.right_key,
                                    &row.instance_key,
                                    &fields,
                                    migration_commit,
                                    Some(vid),
                                )?;
                                row_count += 1;
                            }
                        }
                    }
                }

                self.repo
                    .activate_schema_version(kind, &name, vid, migration_commit)?;
                self.repo.store_schema(kind, &name, &code_value)?;
                new_versions.insert(name.clone(), vid);
                rows_migrated.insert(name.clone(), row_count);
                types_migrated.push(name);
            }

            self.repo.commit_transaction()?;
            tracing::info!(
                types = types_migrated.len(),
                commit_id = migration_commit,
                "migration applied"
            );

            Ok(MigrationResult {
                success: true,
                types_migrated,
                rows_migrated,
                new_schema_versions: new_versions,
                duration: started.elapsed(),
            })
        })();

        if result.is_err() {
            let _ = self.repo.rollback_transaction();
        }

        // Force a fresh validate() on the next write path.
        self.schema_validated = false;
        self.schema_version_ids.clear();
        result
    }

    // --- Event loop ---

    /// Run the reactive loop: claim events per handler, invoke, ack or
    /// release, fire schedules, heartbeat. Returns after `max_iterations`
    /// or a `stop()` request.
    pub fn run(
        &mut self,
        handlers: &[Handler],
        schedules: &[Schedule],
        max_iterations: Option<usize>,
    ) -> Result<()> {
        self.ensure_schema_validated()?;
        let order = order_handlers(handlers)?;

        struct ScheduleState {
            template: EventEnvelope,
            cron: cron::Schedule,
            next_fire: DateTime<Utc>,
        }

        let mut schedule_states = Vec::new();
        for schedule in schedules {
            // The public syntax is standard 5-field cron; the evaluator
            // takes a seconds field, so one is prepended.
            let expr = format!("0 {}", schedule.cron.trim());
            let compiled = cron::Schedule::from_str(&expr).map_err(|e| {
                TrellisError::Validation(format!("invalid cron '{}': {e}", schedule.cron))
            })?;
            let next_fire = compiled.after(&clock::now()).next().ok_or_else(|| {
                TrellisError::Validation(format!("cron '{}' never fires", schedule.cron))
            })?;
            schedule_states.push(ScheduleState {
                template: schedule.event.clone(),
                cron: compiled,
                next_fire,
            });
        }

        self.event_store.register_session(
            &self.session_id,
            &self.namespace,
            &self.instance_metadata,
        )?;
        tracing::info!(
            session_id = self.session_id.as_str(),
            namespace = self.namespace.as_str(),
            "event loop started"
        );

        let heartbeat_interval =
            chrono::Duration::milliseconds(self.config.session_heartbeat_interval_ms as i64);
        let poll_interval = Duration::from_millis(self.config.event_poll_interval_ms);
        let mut next_heartbeat = clock::now();
        let mut outstanding: Vec<(String, String)> = Vec::new();

        self.stop_requested = false;
        let mut iterations = 0usize;

        let loop_result = (|| -> Result<()> {
            while !self.stop_requested {
                if let Some(max) = max_iterations {
                    if iterations >= max {
                        break;
                    }
                }

                let now = clock::now();
                if now >= next_heartbeat {
                    self.event_store.heartbeat(&self.session_id, &self.namespace)?;
                    next_heartbeat = now + heartbeat_interval;
                }

                for state in schedule_states.iter_mut() {
                    while now >= state.next_fire {
                        let fired = state.template.as_root_copy();
                        self.event_store.enqueue(&fired, &self.namespace)?;
                        state.next_fire = state
                            .cron
                            .after(&state.next_fire)
                            .next()
                            .unwrap_or(now + chrono::Duration::days(366));
                    }
                }

                let mut processed = 0usize;
                for &idx in &order {
                    if processed >= self.config.max_events_per_iteration {
                        break;
                    }
                    let handler = &handlers[idx];
                    let remaining = self.config.max_events_per_iteration - processed;
                    let claim_limit = self.config.event_claim_limit.min(remaining);

                    let claimed = self.event_store.claim(
                        &self.namespace,
                        &handler.handler_id,
                        &self.session_id,
                        &[handler.event_type.clone()],
                        claim_limit,
                        self.config.event_claim_lease_ms,
                    )?;

                    for claimed_event in claimed {
                        if processed >= self.config.max_events_per_iteration {
                            break;
                        }
                        let event_id = claimed_event.envelope.id.clone();
                        outstanding.push((handler.handler_id.clone(), event_id.clone()));

                        // Leftover intents never leak across handlers.
                        self.intents.clear();
                        let mut ctx = HandlerContext::new(
                            self,
                            claimed_event.envelope,
                            claimed_event.lease_until,
                        );
                        let handler_result = (handler.func)(&mut ctx);
                        let buffered = std::mem::take(&mut ctx.buffered);
                        let parent = ctx.envelope.clone();
                        drop(ctx);

                        match handler_result {
                            Err(e) => {
                                self.intents.clear();
                                outstanding.pop();
                                self.event_store.release(
                                    &handler.handler_id,
                                    &event_id,
                                    &self.namespace,
                                    Some(&e.to_string()),
                                )?;
                                processed += 1;
                                continue;
                            }
                            Ok(()) => {}
                        }

                        // Ack before flushing buffered emits: a flush
                        // failure must not retry an already-acked handler
                        // and duplicate its committed side effects.
                        if let Err(e) = self.event_store.ack(
                            &handler.handler_id,
                            &event_id,
                            &self.namespace,
                        ) {
                            tracing::warn!(
                                event_id = event_id.as_str(),
                                error = %e,
                                "ack failed; claim will expire and may retry"
                            );
                            outstanding.pop();
                            processed += 1;
                            continue;
                        }
                        outstanding.pop();

                        for envelope in buffered {
                            if let Err(e) = self.event_store.enqueue(&envelope, &self.namespace)
                            {
                                tracing::warn!(
                                    parent_event = parent.id.as_str(),
                                    error = %e,
                                    "buffered emit lost after ack"
                                );
                            }
                        }
                        processed += 1;
                    }
                }

                std::thread::sleep(poll_interval);
                iterations += 1;
            }
            Ok(())
        })();

        // Graceful exit: outstanding claims are released for other
        // sessions to pick up.
        for (handler_id, event_id) in outstanding.drain(..) {
            let _ = self.event_store.release(
                &handler_id,
                &event_id,
                &self.namespace,
                Some("session stopped"),
            );
        }
        tracing::info!(
            session_id = self.session_id.as_str(),
            iterations,
            "event loop stopped"
        );
        loop_result
    }
}
