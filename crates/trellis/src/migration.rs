//! Schema migration: preview/apply with plan-hash tokens and row-level
//! upgrader chains.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use serde_json::Value;

use trellis_core::error::{Result, TrellisError};
use trellis_core::hash::{canonical_json, sha256_hex};
use trellis_core::schema::TypeSchemaDiff;
use trellis_core::JsonMap;

/// A pure row transformation from one schema version to the next,
/// keyed by `(type_name, from_version)`.
pub type UpgraderFn = Box<dyn Fn(JsonMap) -> Result<JsonMap>>;

/// Registry of upgrader functions supplied to `migrate`.
#[derive(Default)]
pub struct UpgraderRegistry {
    map: HashMap<(String, i64), UpgraderFn>,
}

impl UpgraderRegistry {
    pub fn new() -> UpgraderRegistry {
        UpgraderRegistry::default()
    }

    /// Register an upgrader for `type_name` from `from_version` to
    /// `from_version + 1`.
    pub fn register<F>(&mut self, type_name: &str, from_version: i64, func: F)
    where
        F: Fn(JsonMap) -> Result<JsonMap> + 'static,
    {
        self.map
            .insert((type_name.to_string(), from_version), Box::new(func));
    }

    pub fn contains(&self, type_name: &str, from_version: i64) -> bool {
        self.map
            .contains_key(&(type_name.to_string(), from_version))
    }

    fn get(&self, type_name: &str, from_version: i64) -> Option<&UpgraderFn> {
        self.map.get(&(type_name.to_string(), from_version))
    }

    /// Compose the upgrader chain `from_version -> to_version`,
    /// validating that every step exists.
    pub fn chain(
        &self,
        type_name: &str,
        from_version: i64,
        to_version: i64,
    ) -> Result<Vec<&UpgraderFn>> {
        let mut missing = Vec::new();
        let mut chain = Vec::new();
        for version in from_version..to_version {
            match self.get(type_name, version) {
                Some(f) => chain.push(f),
                None => missing.push(version),
            }
        }
        if !missing.is_empty() {
            let mut map = BTreeMap::new();
            map.insert(type_name.to_string(), missing);
            return Err(TrellisError::MissingUpgrader { missing: map });
        }
        Ok(chain)
    }
}

impl std::fmt::Debug for UpgraderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgraderRegistry")
            .field("registered", &self.map.len())
            .finish()
    }
}

/// Result of a dry-run migration preview.
#[derive(Debug, Clone)]
pub struct MigrationPreview {
    pub has_changes: bool,
    /// Drift-detection token binding this plan to the observed head.
    pub token: String,
    pub diffs: Vec<TypeSchemaDiff>,
    pub estimated_rows: BTreeMap<String, u64>,
    pub types_requiring_upgraders: Vec<String>,
    pub types_schema_only: Vec<String>,
    pub missing_upgraders: Vec<String>,
}

/// Result of an applied migration.
#[derive(Debug, Clone)]
pub struct MigrationResult {
    pub success: bool,
    pub types_migrated: Vec<String>,
    pub rows_migrated: BTreeMap<String, u64>,
    pub new_schema_versions: BTreeMap<String, i64>,
    pub duration: Duration,
}

impl MigrationResult {
    pub(crate) fn empty(started: Instant) -> MigrationResult {
        MigrationResult {
            success: true,
            types_migrated: Vec::new(),
            rows_migrated: BTreeMap::new(),
            new_schema_versions: BTreeMap::new(),
            duration: started.elapsed(),
        }
    }
}

/// SHA-256 of the canonical JSON rendering of the plan's diffs.
pub fn compute_plan_hash(diffs: &[TypeSchemaDiff]) -> String {
    let mut sorted: Vec<&TypeSchemaDiff> = diffs.iter().collect();
    sorted.sort_by_key(|d| (d.type_kind.to_string(), d.type_name.clone()));
    let value = serde_json::to_value(&sorted).unwrap_or(Value::Null);
    sha256_hex(canonical_json(&value).as_bytes())
}

/// Token = base64(`plan_hash:head_commit_id_or_none`). Drift detection,
/// not authentication.
pub fn compute_migration_token(plan_hash: &str, head_commit_id: Option<i64>) -> String {
    let head = head_commit_id
        .map(|h| h.to_string())
        .unwrap_or_else(|| "none".to_string());
    URL_SAFE.encode(format!("{plan_hash}:{head}"))
}

pub fn verify_token(token: &str, plan_hash: &str, head_commit_id: Option<i64>) -> bool {
    token == compute_migration_token(plan_hash, head_commit_id)
}

/// Keep-alive thread renewing a write lease at ttl/3 while a migration
/// runs.
pub(crate) struct LeaseKeepAlive {
    stop: std::sync::Arc<std::sync::atomic::AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl LeaseKeepAlive {
    pub(crate) fn start(
        mut renew: Box<dyn FnMut() -> bool + Send>,
        interval: Duration,
    ) -> LeaseKeepAlive {
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_clone = std::sync::Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            while !stop_clone.load(std::sync::atomic::Ordering::Relaxed) {
                std::thread::sleep(interval);
                if stop_clone.load(std::sync::atomic::Ordering::Relaxed) {
                    break;
                }
                if !renew() {
                    return;
                }
            }
        });
        LeaseKeepAlive {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for LeaseKeepAlive {
    fn drop(&mut self) {
        self.stop
            .store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::schema::TypeKind;

    fn diff(name: &str) -> TypeSchemaDiff {
        TypeSchemaDiff {
            type_kind: TypeKind::Entity,
            type_name: name.to_string(),
            stored_version: 1,
            added_fields: vec!["email".to_string()],
            removed_fields: vec![],
            changed_fields: BTreeMap::new(),
        }
    }

    #[test]
    fn test_plan_hash_order_independent() {
        let a = compute_plan_hash(&[diff("A"), diff("B")]);
        let b = compute_plan_hash(&[diff("B"), diff("A")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_token_binds_plan_and_head() {
        let hash = compute_plan_hash(&[diff("A")]);
        let token = compute_migration_token(&hash, Some(5));
        assert!(verify_token(&token, &hash, Some(5)));
        assert!(!verify_token(&token, &hash, Some(6)));
        assert!(!verify_token(
            &token,
            &compute_plan_hash(&[diff("B")]),
            Some(5)
        ));

        let empty_head = compute_migration_token(&hash, None);
        assert!(verify_token(&empty_head, &hash, None));
    }

    #[test]
    fn test_chain_composition_and_missing() {
        let mut registry = UpgraderRegistry::new();
        registry.register("Customer", 1, |mut fields| {
            fields.insert("step1".into(), serde_json::json!(true));
            Ok(fields)
        });
        registry.register("Customer", 2, |mut fields| {
            fields.insert("step2".into(), serde_json::json!(true));
            Ok(fields)
        });

        let chain = registry.chain("Customer", 1, 3).unwrap();
        let mut fields = JsonMap::new();
        for f in &chain {
            fields = f(fields).unwrap();
        }
        assert!(fields.contains_key("step1"));
        assert!(fields.contains_key("step2"));

        match registry.chain("Customer", 1, 4) {
            Err(TrellisError::MissingUpgrader { missing }) => {
                assert_eq!(missing["Customer"], vec![3]);
            }
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("expected missing upgrader error"),
        }
    }
}
