//! Temporal query semantics: as_of, history windows, version boundaries.

mod common;

use common::*;
use trellis::prelude::*;

#[test]
fn test_as_of_reads_point_in_time_state() {
    for (backend, mut fx) in fixtures() {
        fx.session.ensure(customer("c1", "Alice").as_intent().unwrap());
        let c1 = fx.session.commit().unwrap().unwrap();
        fx.session.ensure(customer("c1", "Alicia").as_intent().unwrap());
        let c2 = fx.session.commit().unwrap().unwrap();

        let v1 = fx
            .session
            .query()
            .entities::<Customer>()
            .as_of(c1)
            .first()
            .unwrap()
            .unwrap();
        assert_eq!(v1.name, "Alice", "backend {backend}");
        assert_eq!(v1.meta.commit_id, c1);

        let v2 = fx
            .session
            .query()
            .entities::<Customer>()
            .as_of(c2)
            .first()
            .unwrap()
            .unwrap();
        assert_eq!(v2.name, "Alicia", "backend {backend}");

        // as_of beyond head clamps to head.
        let beyond = fx
            .session
            .query()
            .entities::<Customer>()
            .as_of(c2 + 10)
            .first()
            .unwrap()
            .unwrap();
        assert_eq!(beyond.name, "Alicia", "backend {backend}");
    }
}

#[test]
fn test_history_windows() {
    for (backend, mut fx) in fixtures() {
        fx.session.ensure(customer("c1", "V1").as_intent().unwrap());
        let c1 = fx.session.commit().unwrap().unwrap();
        fx.session.ensure(customer("c1", "V2").as_intent().unwrap());
        fx.session.commit().unwrap();
        fx.session.ensure(customer("c2", "Other").as_intent().unwrap());
        fx.session.commit().unwrap();

        let history = fx
            .session
            .query()
            .entities::<Customer>()
            .with_history()
            .collect()
            .unwrap();
        assert_eq!(history.len(), 3, "backend {backend}");
        // Ordered commit_id ASC.
        let commits: Vec<i64> = history.iter().map(|h| h.meta.commit_id).collect();
        let mut sorted = commits.clone();
        sorted.sort();
        assert_eq!(commits, sorted, "backend {backend}");

        let since = fx
            .session
            .query()
            .entities::<Customer>()
            .history_since(c1)
            .collect()
            .unwrap();
        assert_eq!(since.len(), 2, "backend {backend}");
        assert!(since.iter().all(|h| h.meta.commit_id > c1));
    }
}

#[test]
fn test_relation_history() {
    for (backend, mut fx) in fixtures() {
        fx.session.ensure(vec![
            customer("p1", "Pat").as_intent().unwrap(),
            company("c1", "Acme", 5).as_intent().unwrap(),
            Employment {
                left_key: "p1".into(),
                right_key: "c1".into(),
                stint_id: "a".into(),
                role: "Eng".into(),
            }
            .as_intent()
            .unwrap(),
        ]);
        let first = fx.session.commit().unwrap().unwrap();
        fx.session.ensure(
            Employment {
                left_key: "p1".into(),
                right_key: "c1".into(),
                stint_id: "a".into(),
                role: "Mgr".into(),
            }
            .as_intent()
            .unwrap(),
        );
        fx.session.commit().unwrap();

        let at_first = fx
            .session
            .query()
            .relations::<Employment>()
            .as_of(first)
            .first()
            .unwrap()
            .unwrap();
        assert_eq!(at_first.role, "Eng", "backend {backend}");

        let history = fx
            .session
            .query()
            .relations::<Employment>()
            .with_history()
            .collect()
            .unwrap();
        assert_eq!(history.len(), 2, "backend {backend}");
    }
}
