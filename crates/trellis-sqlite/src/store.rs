//! SQLite-backed repository for entity and relation history.

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::Rng;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};

use trellis_core::clock;
use trellis_core::error::{Result, TrellisError};
use trellis_core::filter::{extract_scope, references_scope, FieldScope, FilterExpr};
use trellis_core::repo::{
    AggSpec, Aggregate, ChangeOp, CommitChange, CommitInfo, Direction, EndpointTypes, EntityRow,
    EventStore, GroupBySpec, QueryDiagnostics, QuerySpec, RelationRow, Repository,
    SchemaVersionRecord, StorageInfo, TemporalMode,
};
use trellis_core::schema::TypeKind;
use trellis_core::{JsonMap, TrellisConfig};

use crate::event_store::SqliteEventStore;
use crate::sql::{compile_filter, having_op, json_to_sql};

const WRITE_LOCK_NAME: &str = "ontology_write";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineVersion {
    V1,
    V2,
}

impl EngineVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineVersion::V1 => "v1",
            EngineVersion::V2 => "v2",
        }
    }

    pub fn parse(s: &str) -> Result<EngineVersion> {
        match s {
            "v1" => Ok(EngineVersion::V1),
            "v2" => Ok(EngineVersion::V2),
            other => Err(TrellisError::storage(
                "open_repository",
                format!("unsupported sqlite engine version '{other}'"),
            )),
        }
    }
}

/// Inspect an existing database for its engine version. New stores and
/// in-memory databases default to the latest engine; stores without
/// engine metadata are legacy v1.
pub fn detect_engine_version(db_path: &str) -> EngineVersion {
    if db_path == ":memory:" || !Path::new(db_path).exists() {
        return EngineVersion::V2;
    }
    let Ok(conn) = Connection::open(db_path) else {
        return EngineVersion::V1;
    };
    let has_meta: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'storage_meta'",
            [],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten();
    if has_meta.is_none() {
        return EngineVersion::V1;
    }
    let engine: Option<String> = conn
        .query_row(
            "SELECT value FROM storage_meta WHERE key = 'engine_version' LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten();
    match engine.as_deref() {
        Some("v2") => EngineVersion::V2,
        _ => EngineVersion::V1,
    }
}

struct Layout {
    schema_version_id: i64,
    activation_commit_id: i64,
}

/// SQLite repository. Both engine versions share the history tables; v2
/// additionally maintains the type layout catalog that scopes typed reads
/// to the current schema version.
pub struct SqliteRepository {
    conn: Rc<Connection>,
    db_path: String,
    engine: EngineVersion,
    config: TrellisConfig,
    diagnostics: RefCell<Option<QueryDiagnostics>>,
    tx_active: Cell<bool>,
}

fn storage_err(operation: &str, e: impl ToString) -> TrellisError {
    TrellisError::storage(operation, e.to_string())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_fields(raw: &str) -> Result<JsonMap> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(TrellisError::Serialization(
            "fields_json must be a JSON object".to_string(),
        )),
        Err(e) => Err(TrellisError::Serialization(e.to_string())),
    }
}

fn fields_json(fields: &JsonMap) -> String {
    serde_json::to_string(&Value::Object(fields.clone())).unwrap_or_else(|_| "{}".to_string())
}

fn sql_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Value::from(f),
        SqlValue::Text(s) => Value::from(s),
        SqlValue::Blob(_) => Value::Null,
    }
}

impl SqliteRepository {
    pub fn open(
        db_path: &str,
        config: TrellisConfig,
        engine: Option<EngineVersion>,
    ) -> Result<SqliteRepository> {
        let engine = engine.unwrap_or_else(|| detect_engine_version(db_path));
        if db_path != ":memory:" {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let conn = Connection::open(db_path).map_err(|e| storage_err("open", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| storage_err("open", e))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| storage_err("open", e))?;

        let repo = SqliteRepository {
            conn: Rc::new(conn),
            db_path: db_path.to_string(),
            engine,
            config,
            diagnostics: RefCell::new(None),
            tx_active: Cell::new(false),
        };
        repo.create_tables()?;
        Ok(repo)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS commits (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_at TEXT NOT NULL,
                    metadata_json TEXT
                );

                CREATE TABLE IF NOT EXISTS entity_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_type TEXT NOT NULL,
                    entity_key TEXT NOT NULL,
                    fields_json TEXT NOT NULL,
                    commit_id INTEGER NOT NULL,
                    schema_version_id INTEGER,
                    FOREIGN KEY (commit_id) REFERENCES commits(id)
                );

                CREATE INDEX IF NOT EXISTS idx_entity_history_lookup
                    ON entity_history(entity_type, entity_key, commit_id DESC);

                CREATE TABLE IF NOT EXISTS relation_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    relation_type TEXT NOT NULL,
                    left_key TEXT NOT NULL,
                    right_key TEXT NOT NULL,
                    instance_key TEXT NOT NULL DEFAULT '',
                    fields_json TEXT NOT NULL,
                    commit_id INTEGER NOT NULL,
                    schema_version_id INTEGER,
                    FOREIGN KEY (commit_id) REFERENCES commits(id)
                );

                CREATE INDEX IF NOT EXISTS idx_relation_history_lookup
                    ON relation_history(relation_type, left_key, right_key,
                                        instance_key, commit_id DESC);

                CREATE TABLE IF NOT EXISTS schema_registry (
                    type_kind TEXT NOT NULL,
                    type_name TEXT NOT NULL,
                    schema_json TEXT NOT NULL,
                    PRIMARY KEY (type_kind, type_name)
                );

                CREATE TABLE IF NOT EXISTS schema_versions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    type_kind TEXT NOT NULL,
                    type_name TEXT NOT NULL,
                    schema_version_id INTEGER NOT NULL,
                    schema_json TEXT NOT NULL,
                    schema_hash TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    runtime_id TEXT,
                    reason TEXT,
                    UNIQUE(type_kind, type_name, schema_version_id)
                );

                CREATE TABLE IF NOT EXISTS locks (
                    lock_name TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    acquired_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                );",
            )
            .map_err(|e| storage_err("create_tables", e))?;

        self.migrate_history_columns()?;

        if self.engine == EngineVersion::V2 {
            self.conn
                .execute_batch(
                    "CREATE TABLE IF NOT EXISTS storage_meta (
                        key   TEXT PRIMARY KEY,
                        value TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS type_layout_catalog (
                        type_kind             TEXT NOT NULL,
                        type_name             TEXT NOT NULL,
                        schema_version_id     INTEGER NOT NULL,
                        activation_commit_id  INTEGER NOT NULL,
                        is_current            INTEGER NOT NULL DEFAULT 0,
                        created_at            TEXT NOT NULL DEFAULT (datetime('now')),
                        PRIMARY KEY (type_kind, type_name, schema_version_id)
                    );",
                )
                .map_err(|e| storage_err("create_tables", e))?;
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO storage_meta (key, value) VALUES ('engine_version', 'v2')",
                    [],
                )
                .map_err(|e| storage_err("create_tables", e))?;
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO storage_meta (key, value) VALUES ('backend', 'sqlite')",
                    [],
                )
                .map_err(|e| storage_err("create_tables", e))?;
        }

        self.bootstrap_schema_versions()?;
        Ok(())
    }

    /// Add columns that legacy stores predate.
    fn migrate_history_columns(&self) -> Result<()> {
        for table in ["entity_history", "relation_history"] {
            let mut stmt = self
                .conn
                .prepare(&format!("PRAGMA table_info({table})"))
                .map_err(|e| storage_err("migrate_columns", e))?;
            let cols: Vec<String> = stmt
                .query_map([], |row| row.get::<_, String>(1))
                .map_err(|e| storage_err("migrate_columns", e))?
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| storage_err("migrate_columns", e))?;

            if !cols.iter().any(|c| c == "schema_version_id") {
                self.conn
                    .execute(
                        &format!("ALTER TABLE {table} ADD COLUMN schema_version_id INTEGER"),
                        [],
                    )
                    .map_err(|e| storage_err("migrate_columns", e))?;
            }
            if table == "relation_history" && !cols.iter().any(|c| c == "instance_key") {
                self.conn
                    .execute(
                        "ALTER TABLE relation_history \
                         ADD COLUMN instance_key TEXT NOT NULL DEFAULT ''",
                        [],
                    )
                    .map_err(|e| storage_err("migrate_columns", e))?;
                self.conn
                    .execute_batch(
                        "DROP INDEX IF EXISTS idx_relation_history_lookup;
                         CREATE INDEX idx_relation_history_lookup
                             ON relation_history(relation_type, left_key, right_key,
                                                 instance_key, commit_id DESC);",
                    )
                    .map_err(|e| storage_err("migrate_columns", e))?;
            }
        }
        Ok(())
    }

    /// Seed schema_versions from schema_registry on stores that predate
    /// version tracking.
    fn bootstrap_schema_versions(&self) -> Result<()> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM schema_versions", [], |row| row.get(0))
            .map_err(|e| storage_err("bootstrap", e))?;
        if count > 0 {
            return Ok(());
        }

        let mut stmt = self
            .conn
            .prepare("SELECT type_kind, type_name, schema_json FROM schema_registry")
            .map_err(|e| storage_err("bootstrap", e))?;
        let rows: Vec<(String, String, String)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(|e| storage_err("bootstrap", e))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| storage_err("bootstrap", e))?;

        let now = clock::now_iso();
        for (kind, name, schema_json) in rows {
            let hash = trellis_core::hash::schema_hash(&schema_json);
            self.conn
                .execute(
                    "INSERT INTO schema_versions \
                     (type_kind, type_name, schema_version_id, schema_json, schema_hash, \
                      created_at, reason) \
                     VALUES (?1, ?2, 1, ?3, ?4, ?5, 'bootstrap')",
                    params![kind, name, schema_json, hash, now],
                )
                .map_err(|e| storage_err("bootstrap", e))?;
        }
        Ok(())
    }

    pub fn engine_version(&self) -> EngineVersion {
        self.engine
    }

    pub fn connection(&self) -> Rc<Connection> {
        Rc::clone(&self.conn)
    }

    fn current_layout(&self, kind: TypeKind, type_name: &str) -> Result<Option<Layout>> {
        if self.engine != EngineVersion::V2 {
            return Ok(None);
        }
        self.conn
            .query_row(
                "SELECT schema_version_id, activation_commit_id FROM type_layout_catalog \
                 WHERE type_kind = ?1 AND type_name = ?2 AND is_current = 1 LIMIT 1",
                params![kind.to_string(), type_name],
                |row| {
                    Ok(Layout {
                        schema_version_id: row.get(0)?,
                        activation_commit_id: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(|e| storage_err("current_layout", e))
    }

    fn set_boundary_diag(&self, activation_commit_id: i64) {
        *self.diagnostics.borrow_mut() = Some(QueryDiagnostics {
            reason: "commit_before_activation".to_string(),
            activation_commit_id,
        });
    }

    /// Check v2 insert preconditions and activate the layout on first
    /// write under a new schema version.
    fn check_v2_insert(
        &self,
        kind: TypeKind,
        type_name: &str,
        commit_id: i64,
        schema_version_id: Option<i64>,
    ) -> Result<()> {
        if self.engine != EngineVersion::V2 {
            return Ok(());
        }
        let Some(current) = self.current_schema_version(kind, type_name)? else {
            // Low-level usage that bypasses schema registration.
            return Ok(());
        };
        let expected = current.schema_version_id;
        let svid = schema_version_id.unwrap_or(expected);
        if svid != expected {
            return Err(TrellisError::storage(
                "insert",
                format!(
                    "schema_version_id mismatch for {kind} '{type_name}': \
                     expected {expected}, got {svid}"
                ),
            ));
        }
        let layout = self.current_layout(kind, type_name)?;
        let needs_activation = match &layout {
            Some(l) => l.schema_version_id != expected,
            None => true,
        };
        if needs_activation {
            self.activate_schema_version(kind, type_name, expected, commit_id)?;
        }
        Ok(())
    }

    /// v1 query semantics over the history tables; v2 entry points
    /// pre-process the query spec before delegating here.
    fn query_entities_raw(&self, type_name: &str, spec: &QuerySpec) -> Result<Vec<EntityRow>> {
        let mut params: Vec<SqlValue> = Vec::new();
        let apply_sv = spec.schema_version_id.is_some() && !spec.temporal.is_latest();

        let mut sql = match spec.temporal {
            TemporalMode::WithHistory | TemporalMode::HistorySince(_) => {
                let mut s = String::from(
                    "SELECT eh.entity_key, eh.fields_json, eh.commit_id, eh.schema_version_id \
                     FROM entity_history eh WHERE eh.entity_type = ?",
                );
                params.push(SqlValue::Text(type_name.to_string()));
                if let TemporalMode::HistorySince(since) = spec.temporal {
                    s.push_str(" AND eh.commit_id > ?");
                    params.push(SqlValue::Integer(since));
                }
                if apply_sv {
                    s.push_str(" AND eh.schema_version_id = ?");
                    params.push(SqlValue::Integer(spec.schema_version_id.unwrap()));
                }
                s
            }
            TemporalMode::AsOf(as_of) => {
                let sv_sub = if apply_sv { " AND schema_version_id = ?" } else { "" };
                let sv_outer = if apply_sv {
                    " AND eh.schema_version_id = ?"
                } else {
                    ""
                };
                let s = format!(
                    "SELECT eh.entity_key, eh.fields_json, eh.commit_id, eh.schema_version_id \
                     FROM entity_history eh \
                     INNER JOIN ( \
                       SELECT entity_key, MAX(commit_id) AS max_cid \
                       FROM entity_history \
                       WHERE entity_type = ? AND commit_id <= ?{sv_sub} \
                       GROUP BY entity_key \
                     ) latest ON eh.entity_key = latest.entity_key \
                       AND eh.commit_id = latest.max_cid \
                     WHERE eh.entity_type = ?{sv_outer}"
                );
                params.push(SqlValue::Text(type_name.to_string()));
                params.push(SqlValue::Integer(as_of));
                if apply_sv {
                    params.push(SqlValue::Integer(spec.schema_version_id.unwrap()));
                }
                params.push(SqlValue::Text(type_name.to_string()));
                if apply_sv {
                    params.push(SqlValue::Integer(spec.schema_version_id.unwrap()));
                }
                s
            }
            TemporalMode::Latest => {
                let s = String::from(
                    "SELECT eh.entity_key, eh.fields_json, eh.commit_id, eh.schema_version_id \
                     FROM entity_history eh \
                     INNER JOIN ( \
                       SELECT entity_key, MAX(commit_id) AS max_cid \
                       FROM entity_history \
                       WHERE entity_type = ? \
                       GROUP BY entity_key \
                     ) latest ON eh.entity_key = latest.entity_key \
                       AND eh.commit_id = latest.max_cid \
                     WHERE eh.entity_type = ?",
                );
                params.push(SqlValue::Text(type_name.to_string()));
                params.push(SqlValue::Text(type_name.to_string()));
                s
            }
        };

        if let Some(filter) = &spec.filter {
            let clause = compile_filter(filter, &mut params, "eh")?;
            sql.push_str(" AND ");
            sql.push_str(&clause);
        }

        if let Some(order_by) = &spec.order_by {
            let direction = if spec.order_desc { "DESC" } else { "ASC" };
            sql.push_str(&format!(
                " ORDER BY json_extract(eh.fields_json, '$.{order_by}') {direction}"
            ));
        } else if spec.temporal.is_history() {
            sql.push_str(" ORDER BY eh.commit_id ASC, eh.entity_key ASC");
        }

        if let Some(limit) = spec.limit {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(limit as i64));
        }
        if let Some(offset) = spec.offset {
            sql.push_str(" OFFSET ?");
            params.push(SqlValue::Integer(offset as i64));
        }

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| storage_err("query_entities", e))?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })
            .map_err(|e| storage_err("query_entities", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage_err("query_entities", e))?;

        rows.into_iter()
            .map(|(key, raw, commit_id, svid)| {
                Ok(EntityRow {
                    key,
                    fields: parse_fields(&raw)?,
                    commit_id,
                    schema_version_id: svid,
                })
            })
            .collect()
    }

    fn query_relations_raw(
        &self,
        type_name: &str,
        endpoints: &EndpointTypes,
        spec: &QuerySpec,
    ) -> Result<Vec<RelationRow>> {
        let needs_left = spec
            .filter
            .as_ref()
            .is_some_and(|f| references_scope(f, FieldScope::Left));
        let needs_right = spec
            .filter
            .as_ref()
            .is_some_and(|f| references_scope(f, FieldScope::Right));
        if needs_left && endpoints.left.is_none() {
            return Err(TrellisError::Validation(
                "left endpoint type is required for left endpoint filters".to_string(),
            ));
        }
        if needs_right && endpoints.right.is_none() {
            return Err(TrellisError::Validation(
                "right endpoint type is required for right endpoint filters".to_string(),
            ));
        }

        let mut params: Vec<SqlValue> = Vec::new();
        let apply_sv = spec.schema_version_id.is_some() && !spec.temporal.is_latest();

        let select = "SELECT rh.left_key, rh.right_key, rh.instance_key, rh.fields_json, \
                      rh.commit_id, rh.schema_version_id FROM relation_history rh";
        let mut sql = match spec.temporal {
            TemporalMode::WithHistory | TemporalMode::HistorySince(_) => {
                let mut s = format!("{select} WHERE rh.relation_type = ?");
                params.push(SqlValue::Text(type_name.to_string()));
                if let TemporalMode::HistorySince(since) = spec.temporal {
                    s.push_str(" AND rh.commit_id > ?");
                    params.push(SqlValue::Integer(since));
                }
                if apply_sv {
                    s.push_str(" AND rh.schema_version_id = ?");
                    params.push(SqlValue::Integer(spec.schema_version_id.unwrap()));
                }
                s
            }
            TemporalMode::AsOf(as_of) => {
                let sv_sub = if apply_sv { " AND schema_version_id = ?" } else { "" };
                let sv_outer = if apply_sv {
                    " AND rh.schema_version_id = ?"
                } else {
                    ""
                };
                let s = format!(
                    "{select} \
                     INNER JOIN ( \
                       SELECT left_key, right_key, instance_key, MAX(commit_id) AS max_cid \
                       FROM relation_history \
                       WHERE relation_type = ? AND commit_id <= ?{sv_sub} \
                       GROUP BY left_key, right_key, instance_key \
                     ) latest ON rh.left_key = latest.left_key \
                       AND rh.right_key = latest.right_key \
                       AND rh.instance_key = latest.instance_key \
                       AND rh.commit_id = latest.max_cid \
                     WHERE rh.relation_type = ?{sv_outer}"
                );
                params.push(SqlValue::Text(type_name.to_string()));
                params.push(SqlValue::Integer(as_of));
                if apply_sv {
                    params.push(SqlValue::Integer(spec.schema_version_id.unwrap()));
                }
                params.push(SqlValue::Text(type_name.to_string()));
                if apply_sv {
                    params.push(SqlValue::Integer(spec.schema_version_id.unwrap()));
                }
                s
            }
            TemporalMode::Latest => {
                let s = format!(
                    "{select} \
                     INNER JOIN ( \
                       SELECT left_key, right_key, instance_key, MAX(commit_id) AS max_cid \
                       FROM relation_history \
                       WHERE relation_type = ? \
                       GROUP BY left_key, right_key, instance_key \
                     ) latest ON rh.left_key = latest.left_key \
                       AND rh.right_key = latest.right_key \
                       AND rh.instance_key = latest.instance_key \
                       AND rh.commit_id = latest.max_cid \
                     WHERE rh.relation_type = ?"
                );
                params.push(SqlValue::Text(type_name.to_string()));
                params.push(SqlValue::Text(type_name.to_string()));
                s
            }
        };

        // Endpoint predicates become EXISTS subqueries scanning the
        // endpoint type's state under the outer temporal mode.
        if needs_left {
            let left_type = endpoints.left.as_deref().unwrap();
            sql.push_str(&endpoint_exists_sql(
                "le",
                left_type,
                "rh.left_key",
                &spec.temporal,
                &mut params,
            ));
            if let Some(left_filter) = spec
                .filter
                .as_ref()
                .and_then(|f| extract_scope(f, FieldScope::Left))
            {
                let clause = compile_filter(&left_filter, &mut params, "le")?;
                sql.push_str(" AND ");
                sql.push_str(&clause);
            }
            sql.push(')');
        }
        if needs_right {
            let right_type = endpoints.right.as_deref().unwrap();
            sql.push_str(&endpoint_exists_sql(
                "re",
                right_type,
                "rh.right_key",
                &spec.temporal,
                &mut params,
            ));
            if let Some(right_filter) = spec
                .filter
                .as_ref()
                .and_then(|f| extract_scope(f, FieldScope::Right))
            {
                let clause = compile_filter(&right_filter, &mut params, "re")?;
                sql.push_str(" AND ");
                sql.push_str(&clause);
            }
            sql.push(')');
        }

        if let Some(direct) = spec
            .filter
            .as_ref()
            .and_then(|f| extract_scope(f, FieldScope::Row))
        {
            let clause = compile_filter(&direct, &mut params, "rh")?;
            sql.push_str(" AND ");
            sql.push_str(&clause);
        }

        if let Some(order_by) = &spec.order_by {
            let direction = if spec.order_desc { "DESC" } else { "ASC" };
            sql.push_str(&format!(
                " ORDER BY json_extract(rh.fields_json, '$.{order_by}') {direction}"
            ));
        } else if spec.temporal.is_history() {
            sql.push_str(
                " ORDER BY rh.commit_id ASC, rh.left_key ASC, rh.right_key ASC, \
                 rh.instance_key ASC",
            );
        }

        if let Some(limit) = spec.limit {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(limit as i64));
        }
        if let Some(offset) = spec.offset {
            sql.push_str(" OFFSET ?");
            params.push(SqlValue::Integer(offset as i64));
        }

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| storage_err("query_relations", e))?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })
            .map_err(|e| storage_err("query_relations", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage_err("query_relations", e))?;

        rows.into_iter()
            .map(|(left_key, right_key, instance_key, raw, commit_id, svid)| {
                Ok(RelationRow {
                    left_key,
                    right_key,
                    instance_key,
                    fields: parse_fields(&raw)?,
                    commit_id,
                    schema_version_id: svid,
                })
            })
            .collect()
    }

    fn latest_entity_join(type_name: &str, params: &mut Vec<SqlValue>) -> String {
        params.push(SqlValue::Text(type_name.to_string()));
        params.push(SqlValue::Text(type_name.to_string()));
        "FROM entity_history eh \
         INNER JOIN ( \
           SELECT entity_key, MAX(commit_id) AS max_cid \
           FROM entity_history WHERE entity_type = ? GROUP BY entity_key \
         ) latest ON eh.entity_key = latest.entity_key AND eh.commit_id = latest.max_cid \
         WHERE eh.entity_type = ?"
            .to_string()
    }

    fn latest_relation_join(type_name: &str, params: &mut Vec<SqlValue>) -> String {
        params.push(SqlValue::Text(type_name.to_string()));
        params.push(SqlValue::Text(type_name.to_string()));
        "FROM relation_history rh \
         INNER JOIN ( \
           SELECT left_key, right_key, instance_key, MAX(commit_id) AS max_cid \
           FROM relation_history WHERE relation_type = ? \
           GROUP BY left_key, right_key, instance_key \
         ) latest ON rh.left_key = latest.left_key AND rh.right_key = latest.right_key \
           AND rh.instance_key = latest.instance_key AND rh.commit_id = latest.max_cid \
         WHERE rh.relation_type = ?"
            .to_string()
    }

    fn run_aggregate(&self, sql: &str, params: Vec<SqlValue>) -> Result<Value> {
        let value: SqlValue = self
            .conn
            .query_row(sql, params_from_iter(params.iter()), |row| {
                row.get::<_, SqlValue>(0)
            })
            .map_err(|e| storage_err("aggregate", e))?;
        Ok(sql_to_json(value))
    }

    fn agg_sql_expr(agg: &AggSpec, alias: &str) -> String {
        match (agg.func, &agg.field) {
            (Aggregate::Count, _) => "COUNT(*)".to_string(),
            (Aggregate::AvgLen, Some(field)) => format!(
                "AVG(json_array_length(json_extract({alias}.fields_json, '$.{field}')))"
            ),
            (Aggregate::Sum | Aggregate::Avg, Some(field)) => format!(
                "{}(CAST(json_extract({alias}.fields_json, '$.{field}') AS REAL))",
                agg.func.sql_name()
            ),
            (func, Some(field)) => format!(
                "{}(json_extract({alias}.fields_json, '$.{field}'))",
                func.sql_name()
            ),
            (func, None) => format!("{}(*)", func.sql_name()),
        }
    }

    fn group_by_sql(
        &self,
        base_join: String,
        alias: &str,
        spec: &GroupBySpec,
        filter: Option<&FilterExpr>,
        mut params: Vec<SqlValue>,
    ) -> Result<Vec<JsonMap>> {
        let group_col = format!(
            "json_extract({alias}.fields_json, '$.{}')",
            spec.group_field
        );
        let mut select_parts = vec![format!("{group_col} AS group_key")];
        for (agg_alias, agg) in &spec.aggs {
            select_parts.push(format!(
                "{} AS \"{}\"",
                Self::agg_sql_expr(agg, alias),
                agg_alias
            ));
        }
        let mut sql = format!("SELECT {} {base_join}", select_parts.join(", "));

        if let Some(filter) = filter {
            if let Some(direct) = extract_scope(filter, FieldScope::Row) {
                let clause = compile_filter(&direct, &mut params, alias)?;
                sql.push_str(" AND ");
                sql.push_str(&clause);
            }
        }

        sql.push_str(&format!(" GROUP BY {group_col}"));

        if let Some(having) = &spec.having {
            sql.push_str(&format!(
                " HAVING {} {} ?",
                Self::agg_sql_expr(&having.agg, alias),
                having_op(having.op)?
            ));
            params.push(json_to_sql(&having.value));
        }

        let mut stmt = self.conn.prepare(&sql).map_err(|e| storage_err("group_by", e))?;
        let n_cols = 1 + spec.aggs.len();
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                let mut values = Vec::with_capacity(n_cols);
                for i in 0..n_cols {
                    values.push(row.get::<_, SqlValue>(i)?);
                }
                Ok(values)
            })
            .map_err(|e| storage_err("group_by", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage_err("group_by", e))?;

        let group_key_name = spec
            .group_field
            .rsplit('.')
            .next()
            .unwrap_or(&spec.group_field)
            .to_string();
        Ok(rows
            .into_iter()
            .map(|values| {
                let mut out = JsonMap::new();
                let mut iter = values.into_iter();
                out.insert(group_key_name.clone(), sql_to_json(iter.next().unwrap()));
                for ((agg_alias, _), value) in spec.aggs.iter().zip(iter) {
                    out.insert(agg_alias.clone(), sql_to_json(value));
                }
                out
            })
            .collect())
    }
}

/// Opening clause of an EXISTS subquery against an endpoint entity's
/// state under the outer temporal mode. The caller appends endpoint
/// predicates and the closing parenthesis.
fn endpoint_exists_sql(
    alias: &str,
    entity_type: &str,
    key_col: &str,
    temporal: &TemporalMode,
    params: &mut Vec<SqlValue>,
) -> String {
    match temporal {
        TemporalMode::WithHistory | TemporalMode::HistorySince(_) => {
            params.push(SqlValue::Text(entity_type.to_string()));
            let mut s = format!(
                " AND EXISTS (SELECT 1 FROM entity_history {alias} \
                 WHERE {alias}.entity_type = ? AND {alias}.entity_key = {key_col}"
            );
            if let TemporalMode::HistorySince(since) = temporal {
                s.push_str(&format!(" AND {alias}.commit_id > ?"));
                params.push(SqlValue::Integer(*since));
            }
            s
        }
        TemporalMode::AsOf(as_of) => {
            params.push(SqlValue::Text(entity_type.to_string()));
            params.push(SqlValue::Integer(*as_of));
            params.push(SqlValue::Text(entity_type.to_string()));
            format!(
                " AND EXISTS (SELECT 1 FROM entity_history {alias} \
                 INNER JOIN ( \
                   SELECT entity_key, MAX(commit_id) AS max_cid \
                   FROM entity_history WHERE entity_type = ? AND commit_id <= ? \
                   GROUP BY entity_key \
                 ) {alias}_latest ON {alias}.entity_key = {alias}_latest.entity_key \
                   AND {alias}.commit_id = {alias}_latest.max_cid \
                 WHERE {alias}.entity_type = ? AND {alias}.entity_key = {key_col}"
            )
        }
        TemporalMode::Latest => {
            params.push(SqlValue::Text(entity_type.to_string()));
            params.push(SqlValue::Text(entity_type.to_string()));
            format!(
                " AND EXISTS (SELECT 1 FROM entity_history {alias} \
                 INNER JOIN ( \
                   SELECT entity_key, MAX(commit_id) AS max_cid \
                   FROM entity_history WHERE entity_type = ? GROUP BY entity_key \
                 ) {alias}_latest ON {alias}.entity_key = {alias}_latest.entity_key \
                   AND {alias}.commit_id = {alias}_latest.max_cid \
                 WHERE {alias}.entity_type = ? AND {alias}.entity_key = {key_col}"
            )
        }
    }
}

impl Repository for SqliteRepository {
    fn close(&self) -> Result<()> {
        // The connection closes on drop.
        Ok(())
    }

    fn storage_info(&self) -> StorageInfo {
        let mut detail = json!({ "db_path": self.db_path });
        if self.engine == EngineVersion::V2 {
            if let Ok(layouts) = self.type_layouts() {
                detail["type_layouts"] = layouts;
            }
        }
        StorageInfo {
            backend: "sqlite".to_string(),
            engine_version: self.engine.as_str().to_string(),
            detail,
        }
    }

    fn last_query_diagnostics(&self) -> Option<QueryDiagnostics> {
        self.diagnostics.borrow().clone()
    }

    fn create_commit(&self, metadata: Option<Value>) -> Result<i64> {
        let now = clock::now_iso();
        let meta_json = metadata.map(|m| m.to_string());
        self.conn
            .execute(
                "INSERT INTO commits (created_at, metadata_json) VALUES (?1, ?2)",
                params![now, meta_json],
            )
            .map_err(|e| storage_err("create_commit", e))?;
        Ok(self.conn.last_insert_rowid())
    }

    fn head_commit_id(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(id) FROM commits", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .map_err(|e| storage_err("head_commit_id", e))
    }

    fn get_commit(&self, commit_id: i64) -> Result<Option<CommitInfo>> {
        self.conn
            .query_row(
                "SELECT id, created_at, metadata_json FROM commits WHERE id = ?1",
                params![commit_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| storage_err("get_commit", e))?
            .map(|(id, created_at, meta)| {
                Ok(CommitInfo {
                    id,
                    created_at,
                    metadata: meta
                        .map(|m| serde_json::from_str(&m))
                        .transpose()
                        .map_err(|e| TrellisError::Serialization(e.to_string()))?,
                })
            })
            .transpose()
    }

    fn list_commits(
        &self,
        limit: usize,
        since_commit_id: Option<i64>,
    ) -> Result<Vec<CommitInfo>> {
        let (sql, params): (&str, Vec<SqlValue>) = match since_commit_id {
            Some(since) => (
                "SELECT id, created_at, metadata_json FROM commits \
                 WHERE id > ? ORDER BY id DESC LIMIT ?",
                vec![SqlValue::Integer(since), SqlValue::Integer(limit as i64)],
            ),
            None => (
                "SELECT id, created_at, metadata_json FROM commits ORDER BY id DESC LIMIT ?",
                vec![SqlValue::Integer(limit as i64)],
            ),
        };
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| storage_err("list_commits", e))?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(|e| storage_err("list_commits", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage_err("list_commits", e))?;

        rows.into_iter()
            .map(|(id, created_at, meta)| {
                Ok(CommitInfo {
                    id,
                    created_at,
                    metadata: meta
                        .map(|m| serde_json::from_str(&m))
                        .transpose()
                        .map_err(|e| TrellisError::Serialization(e.to_string()))?,
                })
            })
            .collect()
    }

    fn list_commit_changes(&self, commit_id: i64) -> Result<Vec<CommitChange>> {
        let mut changes = Vec::new();

        let mut stmt = self
            .conn
            .prepare("SELECT entity_type, entity_key FROM entity_history WHERE commit_id = ?1")
            .map_err(|e| storage_err("list_commit_changes", e))?;
        let entity_rows: Vec<(String, String)> = stmt
            .query_map(params![commit_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| storage_err("list_commit_changes", e))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| storage_err("list_commit_changes", e))?;

        for (etype, ekey) in entity_rows {
            let prior: Option<i64> = self
                .conn
                .query_row(
                    "SELECT 1 FROM entity_history \
                     WHERE entity_type = ?1 AND entity_key = ?2 AND commit_id < ?3 LIMIT 1",
                    params![etype, ekey, commit_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| storage_err("list_commit_changes", e))?;
            changes.push(CommitChange {
                kind: TypeKind::Entity,
                type_name: etype,
                key: Some(ekey),
                left_key: None,
                right_key: None,
                instance_key: None,
                operation: if prior.is_some() {
                    ChangeOp::UpdateVersion
                } else {
                    ChangeOp::Insert
                },
            });
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT relation_type, left_key, right_key, instance_key \
                 FROM relation_history WHERE commit_id = ?1",
            )
            .map_err(|e| storage_err("list_commit_changes", e))?;
        let relation_rows: Vec<(String, String, String, String)> = stmt
            .query_map(params![commit_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(|e| storage_err("list_commit_changes", e))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| storage_err("list_commit_changes", e))?;

        for (rtype, lkey, rkey, ikey) in relation_rows {
            let prior: Option<i64> = self
                .conn
                .query_row(
                    "SELECT 1 FROM relation_history \
                     WHERE relation_type = ?1 AND left_key = ?2 AND right_key = ?3 \
                       AND instance_key = ?4 AND commit_id < ?5 LIMIT 1",
                    params![rtype, lkey, rkey, ikey, commit_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| storage_err("list_commit_changes", e))?;
            changes.push(CommitChange {
                kind: TypeKind::Relation,
                type_name: rtype,
                key: None,
                left_key: Some(lkey),
                right_key: Some(rkey),
                instance_key: Some(ikey),
                operation: if prior.is_some() {
                    ChangeOp::UpdateVersion
                } else {
                    ChangeOp::Insert
                },
            });
        }

        Ok(changes)
    }

    fn count_commit_operations(&self, commit_id: i64) -> Result<usize> {
        let entities: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM entity_history WHERE commit_id = ?1",
                params![commit_id],
                |row| row.get(0),
            )
            .map_err(|e| storage_err("count_commit_operations", e))?;
        let relations: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM relation_history WHERE commit_id = ?1",
                params![commit_id],
                |row| row.get(0),
            )
            .map_err(|e| storage_err("count_commit_operations", e))?;
        Ok((entities + relations) as usize)
    }

    fn latest_entity(&self, type_name: &str, key: &str) -> Result<Option<EntityRow>> {
        self.conn
            .query_row(
                "SELECT fields_json, commit_id, schema_version_id FROM entity_history \
                 WHERE entity_type = ?1 AND entity_key = ?2 \
                 ORDER BY commit_id DESC LIMIT 1",
                params![type_name, key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| storage_err("latest_entity", e))?
            .map(|(raw, commit_id, svid)| {
                Ok(EntityRow {
                    key: key.to_string(),
                    fields: parse_fields(&raw)?,
                    commit_id,
                    schema_version_id: svid,
                })
            })
            .transpose()
    }

    fn insert_entity(
        &self,
        type_name: &str,
        key: &str,
        fields: &JsonMap,
        commit_id: i64,
        schema_version_id: Option<i64>,
    ) -> Result<()> {
        self.check_v2_insert(TypeKind::Entity, type_name, commit_id, schema_version_id)?;
        self.conn
            .execute(
                "INSERT INTO entity_history \
                 (entity_type, entity_key, fields_json, commit_id, schema_version_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![type_name, key, fields_json(fields), commit_id, schema_version_id],
            )
            .map_err(|e| storage_err("insert_entity", e))?;
        Ok(())
    }

    fn query_entities(&self, type_name: &str, spec: &QuerySpec) -> Result<Vec<EntityRow>> {
        self.diagnostics.replace(None);

        if let Some(layout) = self.current_layout(TypeKind::Entity, type_name)? {
            let mut scoped = spec.clone();
            scoped.schema_version_id = Some(layout.schema_version_id);
            match spec.temporal {
                TemporalMode::AsOf(as_of) => {
                    if as_of < layout.activation_commit_id {
                        self.set_boundary_diag(layout.activation_commit_id);
                        return Ok(Vec::new());
                    }
                }
                TemporalMode::WithHistory => {
                    scoped.temporal =
                        TemporalMode::HistorySince(layout.activation_commit_id - 1);
                }
                TemporalMode::HistorySince(since) => {
                    scoped.temporal = TemporalMode::HistorySince(
                        since.max(layout.activation_commit_id - 1),
                    );
                }
                TemporalMode::Latest => {
                    let head = self.head_commit_id()?;
                    match head {
                        Some(head) if head >= layout.activation_commit_id => {
                            scoped.temporal = TemporalMode::AsOf(head);
                        }
                        _ => return Ok(Vec::new()),
                    }
                }
            }
            return self.query_entities_raw(type_name, &scoped);
        }

        self.query_entities_raw(type_name, spec)
    }

    fn count_entities(&self, type_name: &str, filter: Option<&FilterExpr>) -> Result<u64> {
        let mut params: Vec<SqlValue> = Vec::new();
        let mut sql = format!(
            "SELECT COUNT(*) {}",
            Self::latest_entity_join(type_name, &mut params)
        );
        if let Some(filter) = filter {
            let clause = compile_filter(filter, &mut params, "eh")?;
            sql.push_str(" AND ");
            sql.push_str(&clause);
        }
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))
            .map_err(|e| storage_err("count_entities", e))?;
        Ok(count as u64)
    }

    fn aggregate_entities(
        &self,
        type_name: &str,
        agg: &AggSpec,
        filter: Option<&FilterExpr>,
    ) -> Result<Value> {
        let mut params: Vec<SqlValue> = Vec::new();
        let join = Self::latest_entity_join(type_name, &mut params);
        let mut sql = format!("SELECT {} {join}", Self::agg_sql_expr(agg, "eh"));
        if let Some(filter) = filter {
            let clause = compile_filter(filter, &mut params, "eh")?;
            sql.push_str(" AND ");
            sql.push_str(&clause);
        }
        self.run_aggregate(&sql, params)
    }

    fn group_by_entities(
        &self,
        type_name: &str,
        spec: &GroupBySpec,
        filter: Option<&FilterExpr>,
    ) -> Result<Vec<JsonMap>> {
        let mut params: Vec<SqlValue> = Vec::new();
        let join = Self::latest_entity_join(type_name, &mut params);
        self.group_by_sql(join, "eh", spec, filter, params)
    }

    fn latest_relation(
        &self,
        type_name: &str,
        left_key: &str,
        right_key: &str,
        instance_key: &str,
    ) -> Result<Option<RelationRow>> {
        self.conn
            .query_row(
                "SELECT fields_json, commit_id, schema_version_id FROM relation_history \
                 WHERE relation_type = ?1 AND left_key = ?2 AND right_key = ?3 \
                   AND instance_key = ?4 \
                 ORDER BY commit_id DESC LIMIT 1",
                params![type_name, left_key, right_key, instance_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| storage_err("latest_relation", e))?
            .map(|(raw, commit_id, svid)| {
                Ok(RelationRow {
                    left_key: left_key.to_string(),
                    right_key: right_key.to_string(),
                    instance_key: instance_key.to_string(),
                    fields: parse_fields(&raw)?,
                    commit_id,
                    schema_version_id: svid,
                })
            })
            .transpose()
    }

    fn insert_relation(
        &self,
        type_name: &str,
        left_key: &str,
        right_key: &str,
        instance_key: &str,
        fields: &JsonMap,
        commit_id: i64,
        schema_version_id: Option<i64>,
    ) -> Result<()> {
        self.check_v2_insert(TypeKind::Relation, type_name, commit_id, schema_version_id)?;
        self.conn
            .execute(
                "INSERT INTO relation_history \
                 (relation_type, left_key, right_key, instance_key, fields_json, \
                  commit_id, schema_version_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    type_name,
                    left_key,
                    right_key,
                    instance_key,
                    fields_json(fields),
                    commit_id,
                    schema_version_id
                ],
            )
            .map_err(|e| storage_err("insert_relation", e))?;
        Ok(())
    }

    fn query_relations(
        &self,
        type_name: &str,
        endpoints: &EndpointTypes,
        spec: &QuerySpec,
    ) -> Result<Vec<RelationRow>> {
        self.diagnostics.replace(None);

        if let Some(layout) = self.current_layout(TypeKind::Relation, type_name)? {
            let mut scoped = spec.clone();
            scoped.schema_version_id = Some(layout.schema_version_id);
            match spec.temporal {
                TemporalMode::AsOf(as_of) => {
                    if as_of < layout.activation_commit_id {
                        self.set_boundary_diag(layout.activation_commit_id);
                        return Ok(Vec::new());
                    }
                }
                TemporalMode::WithHistory => {
                    scoped.temporal =
                        TemporalMode::HistorySince(layout.activation_commit_id - 1);
                }
                TemporalMode::HistorySince(since) => {
                    scoped.temporal = TemporalMode::HistorySince(
                        since.max(layout.activation_commit_id - 1),
                    );
                }
                TemporalMode::Latest => {
                    let head = self.head_commit_id()?;
                    match head {
                        Some(head) if head >= layout.activation_commit_id => {
                            scoped.temporal = TemporalMode::AsOf(head);
                        }
                        _ => return Ok(Vec::new()),
                    }
                }
            }
            return self.query_relations_raw(type_name, endpoints, &scoped);
        }

        self.query_relations_raw(type_name, endpoints, spec)
    }

    fn count_relations(
        &self,
        type_name: &str,
        _endpoints: &EndpointTypes,
        filter: Option<&FilterExpr>,
    ) -> Result<u64> {
        let mut params: Vec<SqlValue> = Vec::new();
        let mut sql = format!(
            "SELECT COUNT(*) {}",
            Self::latest_relation_join(type_name, &mut params)
        );
        if let Some(filter) = filter {
            if let Some(direct) = extract_scope(filter, FieldScope::Row) {
                let clause = compile_filter(&direct, &mut params, "rh")?;
                sql.push_str(" AND ");
                sql.push_str(&clause);
            }
        }
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))
            .map_err(|e| storage_err("count_relations", e))?;
        Ok(count as u64)
    }

    fn aggregate_relations(
        &self,
        type_name: &str,
        agg: &AggSpec,
        filter: Option<&FilterExpr>,
    ) -> Result<Value> {
        let mut params: Vec<SqlValue> = Vec::new();
        let join = Self::latest_relation_join(type_name, &mut params);
        let mut sql = format!("SELECT {} {join}", Self::agg_sql_expr(agg, "rh"));
        if let Some(filter) = filter {
            if let Some(direct) = extract_scope(filter, FieldScope::Row) {
                let clause = compile_filter(&direct, &mut params, "rh")?;
                sql.push_str(" AND ");
                sql.push_str(&clause);
            }
        }
        self.run_aggregate(&sql, params)
    }

    fn group_by_relations(
        &self,
        type_name: &str,
        _endpoints: &EndpointTypes,
        spec: &GroupBySpec,
        filter: Option<&FilterExpr>,
    ) -> Result<Vec<JsonMap>> {
        let mut params: Vec<SqlValue> = Vec::new();
        let join = Self::latest_relation_join(type_name, &mut params);
        self.group_by_sql(join, "rh", spec, filter, params)
    }

    fn relations_for_entity(
        &self,
        relation_type: &str,
        entity_key: &str,
        direction: Direction,
    ) -> Result<Vec<RelationRow>> {
        let key_col = match direction {
            Direction::Left => "left_key",
            Direction::Right => "right_key",
        };
        let sql = format!(
            "SELECT rh.left_key, rh.right_key, rh.instance_key, rh.fields_json, \
             rh.commit_id, rh.schema_version_id \
             FROM relation_history rh \
             INNER JOIN ( \
               SELECT left_key, right_key, instance_key, MAX(commit_id) AS max_cid \
               FROM relation_history WHERE relation_type = ?1 \
               GROUP BY left_key, right_key, instance_key \
             ) latest ON rh.left_key = latest.left_key AND rh.right_key = latest.right_key \
               AND rh.instance_key = latest.instance_key AND rh.commit_id = latest.max_cid \
             WHERE rh.relation_type = ?2 AND rh.{key_col} = ?3"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| storage_err("relations_for_entity", e))?;
        let rows = stmt
            .query_map(params![relation_type, relation_type, entity_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })
            .map_err(|e| storage_err("relations_for_entity", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage_err("relations_for_entity", e))?;

        rows.into_iter()
            .map(|(left_key, right_key, instance_key, raw, commit_id, svid)| {
                Ok(RelationRow {
                    left_key,
                    right_key,
                    instance_key,
                    fields: parse_fields(&raw)?,
                    commit_id,
                    schema_version_id: svid,
                })
            })
            .collect()
    }

    fn get_schema(&self, kind: TypeKind, name: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT schema_json FROM schema_registry WHERE type_kind = ?1 AND type_name = ?2",
                params![kind.to_string(), name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_err("get_schema", e))?;
        raw.map(|r| serde_json::from_str(&r).map_err(|e| TrellisError::Serialization(e.to_string())))
            .transpose()
    }

    fn store_schema(&self, kind: TypeKind, name: &str, schema: &Value) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO schema_registry (type_kind, type_name, schema_json) \
                 VALUES (?1, ?2, ?3)",
                params![kind.to_string(), name, schema.to_string()],
            )
            .map_err(|e| storage_err("store_schema", e))?;
        Ok(())
    }

    fn list_schemas(&self, kind: TypeKind) -> Result<Vec<(String, Value)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT type_name, schema_json FROM schema_registry WHERE type_kind = ?1")
            .map_err(|e| storage_err("list_schemas", e))?;
        let rows: Vec<(String, String)> = stmt
            .query_map(params![kind.to_string()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(|e| storage_err("list_schemas", e))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| storage_err("list_schemas", e))?;
        rows.into_iter()
            .map(|(name, raw)| {
                Ok((
                    name,
                    serde_json::from_str(&raw)
                        .map_err(|e| TrellisError::Serialization(e.to_string()))?,
                ))
            })
            .collect()
    }

    fn create_schema_version(
        &self,
        kind: TypeKind,
        name: &str,
        schema_json: &str,
        schema_hash: &str,
        runtime_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<i64> {
        let max: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(schema_version_id) FROM schema_versions \
                 WHERE type_kind = ?1 AND type_name = ?2",
                params![kind.to_string(), name],
                |row| row.get(0),
            )
            .map_err(|e| storage_err("create_schema_version", e))?;
        let next_id = max.unwrap_or(0) + 1;
        let now = clock::now_iso();
        self.conn
            .execute(
                "INSERT INTO schema_versions \
                 (type_kind, type_name, schema_version_id, schema_json, schema_hash, \
                  created_at, runtime_id, reason) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    kind.to_string(),
                    name,
                    next_id,
                    schema_json,
                    schema_hash,
                    now,
                    runtime_id,
                    reason
                ],
            )
            .map_err(|e| storage_err("create_schema_version", e))?;
        Ok(next_id)
    }

    fn current_schema_version(
        &self,
        kind: TypeKind,
        name: &str,
    ) -> Result<Option<SchemaVersionRecord>> {
        self.conn
            .query_row(
                "SELECT schema_version_id, schema_json, schema_hash, created_at, \
                 runtime_id, reason \
                 FROM schema_versions WHERE type_kind = ?1 AND type_name = ?2 \
                 ORDER BY schema_version_id DESC LIMIT 1",
                params![kind.to_string(), name],
                map_schema_version,
            )
            .optional()
            .map_err(|e| storage_err("current_schema_version", e))
    }

    fn get_schema_version(
        &self,
        kind: TypeKind,
        name: &str,
        version_id: i64,
    ) -> Result<Option<SchemaVersionRecord>> {
        self.conn
            .query_row(
                "SELECT schema_version_id, schema_json, schema_hash, created_at, \
                 runtime_id, reason \
                 FROM schema_versions \
                 WHERE type_kind = ?1 AND type_name = ?2 AND schema_version_id = ?3",
                params![kind.to_string(), name, version_id],
                map_schema_version,
            )
            .optional()
            .map_err(|e| storage_err("get_schema_version", e))
    }

    fn list_schema_versions(
        &self,
        kind: TypeKind,
        name: &str,
    ) -> Result<Vec<SchemaVersionRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT schema_version_id, schema_json, schema_hash, created_at, \
                 runtime_id, reason \
                 FROM schema_versions WHERE type_kind = ?1 AND type_name = ?2 \
                 ORDER BY schema_version_id ASC",
            )
            .map_err(|e| storage_err("list_schema_versions", e))?;
        let rows = stmt
            .query_map(params![kind.to_string(), name], map_schema_version)
            .map_err(|e| storage_err("list_schema_versions", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage_err("list_schema_versions", e))?;
        Ok(rows)
    }

    fn activate_schema_version(
        &self,
        kind: TypeKind,
        name: &str,
        schema_version_id: i64,
        activation_commit_id: i64,
    ) -> Result<()> {
        if self.engine != EngineVersion::V2 {
            return Ok(());
        }
        self.conn
            .execute(
                "UPDATE type_layout_catalog SET is_current = 0 \
                 WHERE type_kind = ?1 AND type_name = ?2",
                params![kind.to_string(), name],
            )
            .map_err(|e| storage_err("activate_schema_version", e))?;
        self.conn
            .execute(
                "INSERT INTO type_layout_catalog \
                 (type_kind, type_name, schema_version_id, activation_commit_id, is_current) \
                 VALUES (?1, ?2, ?3, ?4, 1) \
                 ON CONFLICT(type_kind, type_name, schema_version_id) DO UPDATE SET \
                 activation_commit_id = excluded.activation_commit_id, \
                 is_current = 1",
                params![kind.to_string(), name, schema_version_id, activation_commit_id],
            )
            .map_err(|e| storage_err("activate_schema_version", e))?;
        Ok(())
    }

    fn count_latest_entities(&self, type_name: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(DISTINCT entity_key) FROM entity_history WHERE entity_type = ?1",
                params![type_name],
                |row| row.get(0),
            )
            .map_err(|e| storage_err("count_latest_entities", e))?;
        Ok(count as u64)
    }

    fn count_latest_relations(&self, type_name: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM ( \
                   SELECT DISTINCT left_key, right_key, instance_key \
                   FROM relation_history WHERE relation_type = ?1 \
                 )",
                params![type_name],
                |row| row.get(0),
            )
            .map_err(|e| storage_err("count_latest_relations", e))?;
        Ok(count as u64)
    }

    fn latest_entity_rows(&self, type_name: &str) -> Result<Vec<EntityRow>> {
        let mut spec = QuerySpec::default();
        spec.order_by = None;
        let mut rows = self.query_entities_raw(type_name, &spec)?;
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }

    fn latest_relation_rows(&self, type_name: &str) -> Result<Vec<RelationRow>> {
        let spec = QuerySpec::default();
        let mut rows = self.query_relations_raw(type_name, &EndpointTypes::default(), &spec)?;
        rows.sort_by(|a, b| {
            (&a.left_key, &a.right_key, &a.instance_key)
                .cmp(&(&b.left_key, &b.right_key, &b.instance_key))
        });
        Ok(rows)
    }

    fn acquire_lock(&self, owner_id: &str, timeout_ms: u64, lease_ms: u64) -> Result<bool> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let now = clock::now();
            let now_iso = clock::to_iso(now);
            let expires =
                clock::to_iso(now + chrono::Duration::milliseconds(lease_ms as i64));

            self.conn
                .execute(
                    "DELETE FROM locks WHERE lock_name = ?1 AND expires_at < ?2",
                    params![WRITE_LOCK_NAME, now_iso],
                )
                .map_err(|e| storage_err("acquire_lock", e))?;

            match self.conn.execute(
                "INSERT INTO locks (lock_name, owner_id, acquired_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![WRITE_LOCK_NAME, owner_id, now_iso, expires],
            ) {
                Ok(_) => return Ok(true),
                Err(e) if is_constraint_violation(&e) => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    let jitter = rand::thread_rng().gen_range(0..10);
                    std::thread::sleep(Duration::from_millis(10 + jitter));
                }
                Err(e) => return Err(storage_err("acquire_lock", e)),
            }
        }
    }

    fn renew_lock(&self, owner_id: &str, lease_ms: u64) -> Result<bool> {
        let expires =
            clock::to_iso(clock::now() + chrono::Duration::milliseconds(lease_ms as i64));
        let updated = self
            .conn
            .execute(
                "UPDATE locks SET expires_at = ?1 WHERE lock_name = ?2 AND owner_id = ?3",
                params![expires, WRITE_LOCK_NAME, owner_id],
            )
            .map_err(|e| storage_err("renew_lock", e))?;
        Ok(updated > 0)
    }

    fn release_lock(&self, owner_id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM locks WHERE lock_name = ?1 AND owner_id = ?2",
                params![WRITE_LOCK_NAME, owner_id],
            )
            .map_err(|e| storage_err("release_lock", e))?;
        Ok(())
    }

    fn lock_renewer(
        &self,
        owner_id: &str,
        lease_ms: u64,
    ) -> Result<Box<dyn FnMut() -> bool + Send>> {
        let db_path = self.db_path.clone();
        let owner = owner_id.to_string();
        Ok(Box::new(move || {
            let Ok(conn) = Connection::open(&db_path) else {
                return false;
            };
            let expires =
                clock::to_iso(clock::now() + chrono::Duration::milliseconds(lease_ms as i64));
            conn.execute(
                "UPDATE locks SET expires_at = ?1 WHERE lock_name = ?2 AND owner_id = ?3",
                params![expires, WRITE_LOCK_NAME, owner],
            )
            .map(|n| n > 0)
            .unwrap_or(false)
        }))
    }

    fn begin_transaction(&self) -> Result<()> {
        if self.tx_active.get() {
            return Ok(());
        }
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| storage_err("begin_transaction", e))?;
        self.tx_active.set(true);
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        if !self.tx_active.get() {
            return Ok(());
        }
        self.tx_active.set(false);
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| storage_err("commit_transaction", e))?;
        Ok(())
    }

    fn rollback_transaction(&self) -> Result<()> {
        if !self.tx_active.get() {
            return Ok(());
        }
        self.tx_active.set(false);
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| storage_err("rollback_transaction", e))?;
        Ok(())
    }

    fn event_store(&self) -> Result<Box<dyn EventStore>> {
        Ok(Box::new(SqliteEventStore::new(
            Rc::clone(&self.conn),
            self.config.clone(),
        )?))
    }
}

impl SqliteRepository {
    fn type_layouts(&self) -> Result<Value> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT type_kind, type_name, schema_version_id, activation_commit_id, \
                 is_current FROM type_layout_catalog",
            )
            .map_err(|e| storage_err("type_layouts", e))?;
        let rows: Vec<(String, String, i64, i64, i64)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })
            .map_err(|e| storage_err("type_layouts", e))?
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| storage_err("type_layouts", e))?;

        let mut grouped: std::collections::BTreeMap<(String, String), Vec<(i64, i64, bool)>> =
            std::collections::BTreeMap::new();
        for (kind, name, svid, activation, is_current) in rows {
            grouped
                .entry((kind, name))
                .or_default()
                .push((svid, activation, is_current != 0));
        }

        let mut layouts = serde_json::Map::new();
        for ((kind, name), entries) in grouped {
            let Some(&(current_svid, activation, _)) =
                entries.iter().find(|(_, _, current)| *current)
            else {
                continue;
            };
            let mut historical: Vec<i64> = entries
                .iter()
                .filter(|(svid, _, _)| *svid != current_svid)
                .map(|(svid, _, _)| *svid)
                .collect();
            historical.sort_unstable();
            let key = if layouts.contains_key(&name) {
                format!("{kind}:{name}")
            } else {
                name.clone()
            };
            layouts.insert(
                key,
                json!({
                    "type_kind": kind,
                    "current_schema_version_id": current_svid,
                    "activation_commit_id": activation,
                    "historical_versions": historical,
                }),
            );
        }
        Ok(Value::Object(layouts))
    }
}

fn map_schema_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<SchemaVersionRecord> {
    Ok(SchemaVersionRecord {
        schema_version_id: row.get(0)?,
        schema_json: row.get(1)?,
        schema_hash: row.get(2)?,
        created_at: row.get(3)?,
        runtime_id: row.get(4)?,
        reason: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repo() -> SqliteRepository {
        SqliteRepository::open(":memory:", TrellisConfig::default(), Some(EngineVersion::V1))
            .unwrap()
    }

    fn obj(value: Value) -> JsonMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_commit_monotonic() {
        let r = repo();
        assert_eq!(r.head_commit_id().unwrap(), None);
        let c1 = r.create_commit(None).unwrap();
        let c2 = r.create_commit(Some(json!({"source": "test"}))).unwrap();
        assert_eq!(c1, 1);
        assert_eq!(c2, 2);
        assert_eq!(r.head_commit_id().unwrap(), Some(2));

        let info = r.get_commit(2).unwrap().unwrap();
        assert_eq!(info.metadata, Some(json!({"source": "test"})));
    }

    #[test]
    fn test_latest_entity_roundtrip() {
        let r = repo();
        let c1 = r.create_commit(None).unwrap();
        r.insert_entity("Customer", "c1", &obj(json!({"name": "Alice"})), c1, None)
            .unwrap();
        let c2 = r.create_commit(None).unwrap();
        r.insert_entity("Customer", "c1", &obj(json!({"name": "Bob"})), c2, None)
            .unwrap();

        let latest = r.latest_entity("Customer", "c1").unwrap().unwrap();
        assert_eq!(latest.commit_id, c2);
        assert_eq!(latest.fields.get("name"), Some(&json!("Bob")));
        assert!(r.latest_entity("Customer", "nope").unwrap().is_none());
    }

    #[test]
    fn test_query_entities_temporal_windows() {
        let r = repo();
        let c1 = r.create_commit(None).unwrap();
        r.insert_entity("Customer", "c1", &obj(json!({"name": "Alice"})), c1, None)
            .unwrap();
        let c2 = r.create_commit(None).unwrap();
        r.insert_entity("Customer", "c1", &obj(json!({"name": "Alice2"})), c2, None)
            .unwrap();
        r.insert_entity("Customer", "c2", &obj(json!({"name": "Bob"})), c2, None)
            .unwrap();

        let latest = r
            .query_entities("Customer", &QuerySpec::default())
            .unwrap();
        assert_eq!(latest.len(), 2);

        let as_of = r
            .query_entities(
                "Customer",
                &QuerySpec {
                    temporal: TemporalMode::AsOf(c1),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(as_of.len(), 1);
        assert_eq!(as_of[0].fields.get("name"), Some(&json!("Alice")));

        let history = r
            .query_entities(
                "Customer",
                &QuerySpec {
                    temporal: TemporalMode::WithHistory,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.windows(2).all(|w| w[0].commit_id <= w[1].commit_id));

        let since = r
            .query_entities(
                "Customer",
                &QuerySpec {
                    temporal: TemporalMode::HistorySince(c1),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(since.len(), 2);
    }

    #[test]
    fn test_query_with_filter_and_order() {
        let r = repo();
        let c1 = r.create_commit(None).unwrap();
        for (key, age) in [("a", 30), ("b", 20), ("c", 40)] {
            r.insert_entity(
                "Customer",
                key,
                &obj(json!({"name": key, "age": age})),
                c1,
                None,
            )
            .unwrap();
        }

        let spec = QuerySpec {
            filter: Some(trellis_core::field("age").ge(30)),
            order_by: Some("age".to_string()),
            order_desc: true,
            ..Default::default()
        };
        let rows = r.query_entities("Customer", &spec).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "c");
        assert_eq!(rows[1].key, "a");
    }

    #[test]
    fn test_relation_instance_key_multiplicity() {
        let r = repo();
        let c1 = r.create_commit(None).unwrap();
        r.insert_relation(
            "Employment",
            "p1",
            "c1",
            "a",
            &obj(json!({"role": "Eng"})),
            c1,
            None,
        )
        .unwrap();
        r.insert_relation(
            "Employment",
            "p1",
            "c1",
            "b",
            &obj(json!({"role": "Mgr"})),
            c1,
            None,
        )
        .unwrap();

        let rows = r
            .query_relations(
                "Employment",
                &EndpointTypes::default(),
                &QuerySpec::default(),
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            r.count_relations("Employment", &EndpointTypes::default(), None)
                .unwrap(),
            2
        );

        let one = r
            .latest_relation("Employment", "p1", "c1", "a")
            .unwrap()
            .unwrap();
        assert_eq!(one.fields.get("role"), Some(&json!("Eng")));
    }

    #[test]
    fn test_aggregates() {
        let r = repo();
        let c1 = r.create_commit(None).unwrap();
        for (key, amount, tags) in [
            ("a", 10, json!(["x"])),
            ("b", 20, json!(["x", "y"])),
            ("c", 30, json!([])),
        ] {
            r.insert_entity(
                "Order",
                key,
                &obj(json!({"amount": amount, "tags": tags})),
                c1,
                None,
            )
            .unwrap();
        }

        assert_eq!(r.count_entities("Order", None).unwrap(), 3);
        let sum = r
            .aggregate_entities(
                "Order",
                &AggSpec {
                    func: Aggregate::Sum,
                    field: Some("amount".to_string()),
                },
                None,
            )
            .unwrap();
        assert_eq!(sum, json!(60.0));

        let avg_len = r
            .aggregate_entities(
                "Order",
                &AggSpec {
                    func: Aggregate::AvgLen,
                    field: Some("tags".to_string()),
                },
                None,
            )
            .unwrap();
        assert_eq!(avg_len, json!(1.0));
    }

    #[test]
    fn test_lock_contention_and_takeover() {
        let r = repo();
        assert!(r.acquire_lock("owner-a", 100, 30_000).unwrap());
        // Second owner cannot acquire while the lease is live.
        assert!(!r.acquire_lock("owner-b", 50, 30_000).unwrap());
        // Released: available again.
        r.release_lock("owner-a").unwrap();
        assert!(r.acquire_lock("owner-b", 50, 30_000).unwrap());
        r.release_lock("owner-b").unwrap();

        // Expired lease is taken over.
        assert!(r.acquire_lock("owner-c", 50, 0).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(r.acquire_lock("owner-d", 200, 30_000).unwrap());
    }

    #[test]
    fn test_commit_changes_inference() {
        let r = repo();
        let c1 = r.create_commit(None).unwrap();
        r.insert_entity("Customer", "c1", &obj(json!({"name": "A"})), c1, None)
            .unwrap();
        let c2 = r.create_commit(None).unwrap();
        r.insert_entity("Customer", "c1", &obj(json!({"name": "B"})), c2, None)
            .unwrap();
        r.insert_entity("Customer", "c2", &obj(json!({"name": "C"})), c2, None)
            .unwrap();

        let changes = r.list_commit_changes(c2).unwrap();
        assert_eq!(changes.len(), 2);
        let ops: Vec<ChangeOp> = changes.iter().map(|c| c.operation).collect();
        assert!(ops.contains(&ChangeOp::UpdateVersion));
        assert!(ops.contains(&ChangeOp::Insert));
        assert_eq!(r.count_commit_operations(c2).unwrap(), 2);
    }

    #[test]
    fn test_schema_versions() {
        let r = repo();
        let v1 = r
            .create_schema_version(
                TypeKind::Entity,
                "Customer",
                "{}",
                "hash1",
                Some("rt"),
                Some("initial"),
            )
            .unwrap();
        assert_eq!(v1, 1);
        let v2 = r
            .create_schema_version(
                TypeKind::Entity,
                "Customer",
                "{}",
                "hash2",
                None,
                Some("migration"),
            )
            .unwrap();
        assert_eq!(v2, 2);

        let current = r
            .current_schema_version(TypeKind::Entity, "Customer")
            .unwrap()
            .unwrap();
        assert_eq!(current.schema_version_id, 2);
        assert_eq!(current.schema_hash, "hash2");
        assert_eq!(
            r.list_schema_versions(TypeKind::Entity, "Customer")
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_transaction_rollback_discards_rows() {
        let r = repo();
        r.begin_transaction().unwrap();
        let c1 = r.create_commit(None).unwrap();
        r.insert_entity("Customer", "c1", &obj(json!({"name": "A"})), c1, None)
            .unwrap();
        r.rollback_transaction().unwrap();

        assert_eq!(r.head_commit_id().unwrap(), None);
        assert!(r.latest_entity("Customer", "c1").unwrap().is_none());
    }

    #[test]
    fn test_v2_boundary_semantics() {
        let r = SqliteRepository::open(
            ":memory:",
            TrellisConfig::default(),
            Some(EngineVersion::V2),
        )
        .unwrap();
        r.create_schema_version(TypeKind::Entity, "Customer", "{}", "h1", None, None)
            .unwrap();

        let c1 = r.create_commit(None).unwrap();
        r.insert_entity("Customer", "c1", &obj(json!({"name": "A"})), c1, Some(1))
            .unwrap();

        // Bump to v2 and activate at commit 2 with a rewritten row.
        r.create_schema_version(TypeKind::Entity, "Customer", "{}", "h2", None, None)
            .unwrap();
        let c2 = r.create_commit(None).unwrap();
        r.insert_entity("Customer", "c1", &obj(json!({"name": "A2"})), c2, Some(2))
            .unwrap();

        // as_of before activation: empty with diagnostic.
        let spec = QuerySpec {
            temporal: TemporalMode::AsOf(c1),
            ..Default::default()
        };
        let rows = r.query_entities("Customer", &spec).unwrap();
        assert!(rows.is_empty());
        let diag = r.last_query_diagnostics().unwrap();
        assert_eq!(diag.reason, "commit_before_activation");
        assert_eq!(diag.activation_commit_id, c2);

        // Latest sees the rewritten current-version row.
        let rows = r.query_entities("Customer", &QuerySpec::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields.get("name"), Some(&json!("A2")));
    }
}
