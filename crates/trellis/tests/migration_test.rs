//! Schema migration: preview tokens, upgrader chains, version boundaries.

mod common;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::TempDir;

use trellis::prelude::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CustomerV1 {
    id: String,
    name: String,
}

impl Entity for CustomerV1 {
    fn type_name() -> &'static str {
        "Customer"
    }

    fn schema() -> TypeSchema {
        TypeSchema::entity("Customer")
            .primary_key("id")
            .field("name", TypeSpec::str())
    }

    fn key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CustomerV2 {
    id: String,
    name: String,
    email: String,
}

impl Entity for CustomerV2 {
    fn type_name() -> &'static str {
        "Customer"
    }

    fn schema() -> TypeSchema {
        TypeSchema::entity("Customer")
            .primary_key("id")
            .field("name", TypeSpec::str())
            .field("email", TypeSpec::str())
    }

    fn key(&self) -> String {
        self.id.clone()
    }
}

fn sqlite_uri(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("onto.db").display())
}

fn object_uri(dir: &TempDir) -> String {
    format!("file://{}", dir.path().join("store").display())
}

fn seed_v1(uri: &str) -> i64 {
    let mut session = Session::builder(uri).entity::<CustomerV1>().open().unwrap();
    session.ensure(
        CustomerV1 {
            id: "c1".into(),
            name: "Alice".into(),
        }
        .as_intent()
        .unwrap(),
    );
    session.commit().unwrap().unwrap()
}

fn email_upgrader() -> UpgraderRegistry {
    let mut registry = UpgraderRegistry::new();
    registry.register("Customer", 1, |mut fields| {
        let name = fields
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_lowercase();
        fields.insert("email".into(), json!(format!("{name}@example.com")));
        Ok(fields)
    });
    registry
}

fn run_migration_flow(uri: &str) {
    let data_commit = seed_v1(uri);

    let mut session = Session::builder(uri).entity::<CustomerV2>().open().unwrap();

    // Validation reports drift before migration.
    let err = session.validate().unwrap_err();
    match err {
        TrellisError::SchemaOutdated { diffs } => {
            assert_eq!(diffs.len(), 1);
            assert_eq!(diffs[0].type_name, "Customer");
            assert_eq!(diffs[0].added_fields, vec!["email"]);
        }
        other => panic!("unexpected error {other:?}"),
    }

    // Preview: one type with data, upgrader required.
    let preview = session.migrate_preview(None).unwrap();
    assert!(preview.has_changes);
    assert_eq!(preview.types_requiring_upgraders, vec!["Customer"]);
    assert!(preview.types_schema_only.is_empty());
    assert_eq!(preview.estimated_rows.get("Customer"), Some(&1));
    assert_eq!(preview.missing_upgraders, vec!["Customer"]);

    let upgraders = email_upgrader();
    let preview = session.migrate_preview(Some(&upgraders)).unwrap();
    assert!(preview.missing_upgraders.is_empty());

    // Apply with the preview token.
    let result = session
        .migrate_apply(Some(&preview.token), false, &upgraders)
        .unwrap();
    assert!(result.success);
    assert_eq!(result.types_migrated, vec!["Customer"]);
    assert_eq!(result.rows_migrated.get("Customer"), Some(&1));
    assert_eq!(result.new_schema_versions.get("Customer"), Some(&2));

    // Immediately re-running preview reports a clean state.
    let preview = session.migrate_preview(None).unwrap();
    assert!(!preview.has_changes);
    session.validate().unwrap();

    // Current reads see the rewritten v2 population.
    let hit = session
        .query()
        .entities::<CustomerV2>()
        .first()
        .unwrap()
        .unwrap();
    assert_eq!(hit.email, "alice@example.com");
    let migration_commit = hit.meta.commit_id;
    assert!(migration_commit > data_commit);

    // Reads before the activation commit are empty with a diagnostic.
    let before = session
        .query()
        .entities::<CustomerV2>()
        .as_of(data_commit)
        .collect()
        .unwrap();
    assert!(before.is_empty());
    let diag = session.repo().last_query_diagnostics().unwrap();
    assert_eq!(diag.reason, "commit_before_activation");
    assert_eq!(diag.activation_commit_id, migration_commit);

    // At the activation commit the v2 state is visible.
    let at = session
        .query()
        .entities::<CustomerV2>()
        .as_of(migration_commit)
        .first()
        .unwrap()
        .unwrap();
    assert_eq!(at.email, "alice@example.com");
}

#[test]
fn test_migration_flow_sqlite() {
    let dir = TempDir::new().unwrap();
    run_migration_flow(&sqlite_uri(&dir));
}

#[test]
fn test_migration_flow_object() {
    let dir = TempDir::new().unwrap();
    run_migration_flow(&object_uri(&dir));
}

#[test]
fn test_stale_token_rejected() {
    let dir = TempDir::new().unwrap();
    let uri = sqlite_uri(&dir);
    seed_v1(&uri);

    let mut v2 = Session::builder(&uri).entity::<CustomerV2>().open().unwrap();
    let preview = v2.migrate_preview(None).unwrap();
    let stale_token = preview.token;

    // Head moves between preview and apply.
    let mut v1 = Session::builder(&uri).entity::<CustomerV1>().open().unwrap();
    v1.ensure(
        CustomerV1 {
            id: "c2".into(),
            name: "Bob".into(),
        }
        .as_intent()
        .unwrap(),
    );
    v1.commit().unwrap();

    let err = v2
        .migrate_apply(Some(&stale_token), false, &email_upgrader())
        .unwrap_err();
    assert!(matches!(err, TrellisError::MigrationToken(_)));

    // Force skips token verification (still recomputed under the lock).
    let result = v2.migrate_apply(None, true, &email_upgrader()).unwrap();
    assert_eq!(result.rows_migrated.get("Customer"), Some(&2));
}

#[test]
fn test_missing_upgrader_aborts() {
    let dir = TempDir::new().unwrap();
    let uri = sqlite_uri(&dir);
    seed_v1(&uri);

    let mut v2 = Session::builder(&uri).entity::<CustomerV2>().open().unwrap();
    let preview = v2.migrate_preview(None).unwrap();
    let err = v2
        .migrate_apply(Some(&preview.token), false, &UpgraderRegistry::new())
        .unwrap_err();
    match err {
        TrellisError::MissingUpgrader { missing } => {
            assert_eq!(missing["Customer"], vec![1]);
        }
        other => panic!("unexpected error {other:?}"),
    }

    // Nothing was applied.
    let preview = v2.migrate_preview(None).unwrap();
    assert!(preview.has_changes);
}

#[test]
fn test_failing_upgrader_rolls_back() {
    let dir = TempDir::new().unwrap();
    let uri = sqlite_uri(&dir);
    seed_v1(&uri);

    let mut registry = UpgraderRegistry::new();
    registry.register("Customer", 1, |_fields| {
        Err(TrellisError::Validation("cannot upgrade".into()))
    });

    let mut v2 = Session::builder(&uri).entity::<CustomerV2>().open().unwrap();
    let preview = v2.migrate_preview(None).unwrap();
    let err = v2
        .migrate_apply(Some(&preview.token), false, &registry)
        .unwrap_err();
    match err {
        TrellisError::UpgraderFailed {
            type_name,
            identity,
            stage,
            ..
        } => {
            assert_eq!(type_name, "Customer");
            assert_eq!(identity, "c1");
            assert_eq!(stage, "upgrade");
        }
        other => panic!("unexpected error {other:?}"),
    }

    // The failed apply left no migration commit behind.
    assert_eq!(v2.repo().head_commit_id().unwrap(), Some(1));
}

#[test]
fn test_schema_only_migration() {
    let dir = TempDir::new().unwrap();
    let uri = sqlite_uri(&dir);

    // Register v1 without writing any rows.
    let mut v1 = Session::builder(&uri).entity::<CustomerV1>().open().unwrap();
    v1.validate().unwrap();
    drop(v1);

    let mut v2 = Session::builder(&uri).entity::<CustomerV2>().open().unwrap();
    let preview = v2.migrate_preview(None).unwrap();
    assert!(preview.has_changes);
    assert_eq!(preview.types_schema_only, vec!["Customer"]);
    assert!(preview.types_requiring_upgraders.is_empty());
    // No upgraders needed for a zero-row type.
    assert!(preview.missing_upgraders.is_empty());

    let result = v2
        .migrate_apply(Some(&preview.token), false, &UpgraderRegistry::new())
        .unwrap();
    assert_eq!(result.rows_migrated.get("Customer"), Some(&0));
    v2.validate().unwrap();
}
