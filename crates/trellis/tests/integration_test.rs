//! End-to-end commit semantics across both backends.

mod common;

use common::*;
use trellis::prelude::*;
use trellis_core::repo::ChangeOp;

#[test]
fn test_delta_noop_round_trip() {
    for (backend, mut fx) in fixtures() {
        let c = customer("c1", "Alice");
        fx.session.ensure(c.as_intent().unwrap());
        let cid = fx.session.commit().unwrap();
        assert_eq!(cid, Some(1), "backend {backend}");

        // Asserting the identical state again produces no commit.
        fx.session.ensure(c.as_intent().unwrap());
        assert_eq!(fx.session.commit().unwrap(), None, "backend {backend}");
        assert_eq!(
            fx.session.repo().head_commit_id().unwrap(),
            Some(1),
            "backend {backend}"
        );

        // A changed payload appends a version.
        let mut changed = c.clone();
        changed.name = "Alicia".to_string();
        fx.session.ensure(changed.as_intent().unwrap());
        assert_eq!(fx.session.commit().unwrap(), Some(2), "backend {backend}");
    }
}

#[test]
fn test_keyed_relation_multiplicity() {
    for (backend, mut fx) in fixtures() {
        fx.session.ensure(vec![
            customer("p1", "Pat").as_intent().unwrap(),
            company("c1", "Acme", 10).as_intent().unwrap(),
            Employment {
                left_key: "p1".into(),
                right_key: "c1".into(),
                stint_id: "a".into(),
                role: "Eng".into(),
            }
            .as_intent()
            .unwrap(),
            Employment {
                left_key: "p1".into(),
                right_key: "c1".into(),
                stint_id: "b".into(),
                role: "Mgr".into(),
            }
            .as_intent()
            .unwrap(),
        ]);
        let cid = fx.session.commit().unwrap();
        assert_eq!(cid, Some(1), "backend {backend}");

        // Two stints for the same endpoint pair.
        assert_eq!(
            fx.session.query().relations::<Employment>().count().unwrap(),
            2,
            "backend {backend}"
        );

        // The unkeyed relation collapses the same pair to one row.
        fx.session.ensure(vec![
            Follows {
                left_key: "p1".into(),
                right_key: "c1".into(),
                since: 2020,
            }
            .as_intent()
            .unwrap(),
            Follows {
                left_key: "p1".into(),
                right_key: "c1".into(),
                since: 2021,
            }
            .as_intent()
            .unwrap(),
        ]);
        fx.session.commit().unwrap();
        assert_eq!(
            fx.session.query().relations::<Follows>().count().unwrap(),
            1,
            "backend {backend}"
        );
        let follows = fx.session.query().relations::<Follows>().first().unwrap().unwrap();
        assert_eq!(follows.since, 2021, "later intent wins, backend {backend}");
    }
}

#[test]
fn test_empty_ensure_is_noop() {
    let mut fx = sqlite_fixture();
    fx.session.ensure(Vec::<trellis::Intent>::new());
    assert_eq!(fx.session.commit().unwrap(), None);
    assert_eq!(fx.session.repo().head_commit_id().unwrap(), None);
}

#[test]
fn test_batch_size_cap() {
    let dir = tempfile::TempDir::new().unwrap();
    let uri = format!("sqlite://{}", dir.path().join("onto.db").display());
    let mut config = TrellisConfig::default();
    config.max_batch_size = 2;
    let mut session = Session::builder(&uri)
        .config(config)
        .entity::<Customer>()
        .open()
        .unwrap();

    for i in 0..3 {
        session.ensure(customer(&format!("c{i}"), "X").as_intent().unwrap());
    }
    let err = session.commit().unwrap_err();
    assert!(matches!(
        err,
        TrellisError::BatchSizeExceeded { count: 3, limit: 2 }
    ));
    // Nothing was persisted.
    assert_eq!(session.repo().head_commit_id().unwrap(), None);
}

#[test]
fn test_commit_inspection() {
    for (backend, mut fx) in fixtures() {
        fx.session.ensure(customer("c1", "Alice").as_intent().unwrap());
        fx.session.commit().unwrap();
        fx.session.ensure(vec![
            customer("c1", "Alicia").as_intent().unwrap(),
            customer("c2", "Bob").as_intent().unwrap(),
        ]);
        fx.session.commit().unwrap();

        let commits = fx.session.list_commits(10, None).unwrap();
        assert_eq!(commits.len(), 2, "backend {backend}");
        assert_eq!(commits[0].id, 2);
        assert_eq!(
            commits[0]
                .metadata
                .as_ref()
                .and_then(|m| m.get("namespace"))
                .and_then(|v| v.as_str()),
            Some("default"),
            "backend {backend}"
        );

        let changes = fx.session.list_commit_changes(2).unwrap();
        assert_eq!(changes.len(), 2, "backend {backend}");
        let update = changes
            .iter()
            .find(|c| c.key.as_deref() == Some("c1"))
            .unwrap();
        assert_eq!(update.operation, ChangeOp::UpdateVersion);
        let insert = changes
            .iter()
            .find(|c| c.key.as_deref() == Some("c2"))
            .unwrap();
        assert_eq!(insert.operation, ChangeOp::Insert);

        let since = fx.session.list_commits(10, Some(1)).unwrap();
        assert_eq!(since.len(), 1, "backend {backend}");
        assert_eq!(since[0].id, 2);
    }
}

#[test]
fn test_persisted_rows_carry_current_schema_version() {
    for (backend, mut fx) in fixtures() {
        fx.session.ensure(customer("c1", "Alice").as_intent().unwrap());
        fx.session.commit().unwrap();

        let row = fx
            .session
            .repo()
            .latest_entity("Customer", "c1")
            .unwrap()
            .unwrap();
        let current = fx
            .session
            .repo()
            .current_schema_version(trellis_core::TypeKind::Entity, "Customer")
            .unwrap()
            .unwrap();
        assert_eq!(
            row.schema_version_id,
            Some(current.schema_version_id),
            "backend {backend}"
        );
    }
}

#[test]
fn test_hydrated_meta() {
    let mut fx = sqlite_fixture();
    let mut c = customer("c1", "Alice");
    c.balance = 12.5;
    fx.session.ensure(c.as_intent().unwrap());
    fx.session.commit().unwrap();

    let hit = fx
        .session
        .query()
        .entities::<Customer>()
        .first()
        .unwrap()
        .unwrap();
    assert_eq!(hit.name, "Alice");
    assert_eq!(hit.balance, 12.5);
    assert_eq!(hit.meta.commit_id, 1);
    assert_eq!(hit.meta.key.as_deref(), Some("c1"));
    assert_eq!(hit.meta.type_name, "Customer");
}
