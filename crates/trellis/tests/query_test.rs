//! Query DSL: predicates, paths, existentials, aggregation, traversal.

mod common;

use common::*;
use serde_json::json;
use trellis::prelude::*;
use trellis::query::{avg, count, sum};

fn seed_accounts(session: &mut Session) {
    let accounts = vec![
        Account {
            id: "a1".into(),
            profile: Some(json!({"city": "Oslo", "zip": "0150"})),
            events: Some(json!([
                {"kind": "view", "weight": 1},
                {"kind": "click", "weight": 3},
            ])),
            active: true,
        },
        Account {
            id: "a2".into(),
            profile: Some(json!({"city": "Bergen", "zip": "5003"})),
            events: Some(json!([])),
            active: false,
        },
        Account {
            id: "a3".into(),
            profile: None,
            events: None,
            active: true,
        },
    ];
    let intents: Vec<trellis::Intent> = accounts
        .iter()
        .map(|a| a.as_intent().unwrap())
        .collect();
    session.ensure(intents);
    session.commit().unwrap();
}

#[test]
fn test_nested_path_predicates() {
    for (backend, mut fx) in fixtures() {
        seed_accounts(&mut fx.session);

        let hits = fx
            .session
            .query()
            .entities::<Account>()
            .where_(field("profile").path("city").eq("Oslo"))
            .collect()
            .unwrap();
        assert_eq!(hits.len(), 1, "backend {backend}");
        assert_eq!(hits[0].id, "a1");

        // Missing nested keys resolve to null.
        let hits = fx
            .session
            .query()
            .entities::<Account>()
            .where_(field("profile").path("city").is_null())
            .collect()
            .unwrap();
        assert_eq!(hits.len(), 1, "backend {backend}");
        assert_eq!(hits[0].id, "a3");
    }
}

#[test]
fn test_existential_predicates() {
    for (backend, mut fx) in fixtures() {
        seed_accounts(&mut fx.session);

        let q = fx.session.query();
        let hits = q
            .entities::<Account>()
            .where_(field("events").any_path("kind").eq("click"))
            .collect()
            .unwrap();
        assert_eq!(hits.len(), 1, "backend {backend}");
        assert_eq!(hits[0].id, "a1");

        // Null and empty lists yield false.
        let none = q
            .entities::<Account>()
            .where_(field("events").any_path("kind").eq("purchase"))
            .count()
            .unwrap();
        assert_eq!(none, 0, "backend {backend}");

        let weighted = q
            .entities::<Account>()
            .count_where(field("events").any_path("weight").gt(2))
            .unwrap();
        assert_eq!(weighted, 1, "backend {backend}");
    }
}

#[test]
fn test_boolean_and_in_predicates() {
    for (backend, mut fx) in fixtures() {
        seed_accounts(&mut fx.session);
        let q = fx.session.query();

        assert_eq!(
            q.entities::<Account>()
                .where_(field("active").is_true())
                .count()
                .unwrap(),
            2,
            "backend {backend}"
        );
        assert_eq!(
            q.entities::<Account>()
                .where_(field("active").is_false())
                .count()
                .unwrap(),
            1,
            "backend {backend}"
        );

        // Empty IN always yields empty without error.
        let empty: Vec<&str> = vec![];
        assert_eq!(
            q.entities::<Account>()
                .where_(field("profile").path("city").is_in(empty))
                .count()
                .unwrap(),
            0,
            "backend {backend}"
        );
        assert_eq!(
            q.entities::<Account>()
                .where_(field("profile").path("city").is_in(vec!["Oslo", "Bergen"]))
                .count()
                .unwrap(),
            2,
            "backend {backend}"
        );
    }
}

#[test]
fn test_order_limit_offset() {
    for (backend, mut fx) in fixtures() {
        let intents: Vec<trellis::Intent> = [("c1", 30.0), ("c2", 10.0), ("c3", 20.0)]
            .iter()
            .map(|(id, balance)| {
                let mut c = customer(id, "X");
                c.balance = *balance;
                c.as_intent().unwrap()
            })
            .collect();
        fx.session.ensure(intents);
        fx.session.commit().unwrap();

        let hits = fx
            .session
            .query()
            .entities::<Customer>()
            .order_by(field("balance"))
            .collect()
            .unwrap();
        let keys: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(keys, vec!["c2", "c3", "c1"], "backend {backend}");

        let hits = fx
            .session
            .query()
            .entities::<Customer>()
            .order_by_desc(field("balance"))
            .limit(1)
            .collect()
            .unwrap();
        assert_eq!(hits[0].id, "c1", "backend {backend}");

        let hits = fx
            .session
            .query()
            .entities::<Customer>()
            .order_by(field("balance"))
            .offset(1)
            .limit(1)
            .collect()
            .unwrap();
        assert_eq!(hits[0].id, "c3", "backend {backend}");
    }
}

#[test]
fn test_aggregates() {
    for (backend, mut fx) in fixtures() {
        let intents: Vec<trellis::Intent> = [("c1", 10.0), ("c2", 20.0), ("c3", 30.0)]
            .iter()
            .map(|(id, balance)| {
                let mut c = customer(id, "X");
                c.balance = *balance;
                c.as_intent().unwrap()
            })
            .collect();
        fx.session.ensure(intents);
        fx.session.commit().unwrap();

        let q = fx.session.query();
        assert_eq!(q.entities::<Customer>().count().unwrap(), 3);
        assert_eq!(
            q.entities::<Customer>()
                .sum(field("balance"))
                .unwrap()
                .as_f64(),
            Some(60.0),
            "backend {backend}"
        );
        assert_eq!(
            q.entities::<Customer>()
                .avg(field("balance"))
                .unwrap()
                .as_f64(),
            Some(20.0),
            "backend {backend}"
        );
        assert_eq!(
            q.entities::<Customer>()
                .min_(field("balance"))
                .unwrap()
                .as_f64(),
            Some(10.0),
            "backend {backend}"
        );
        assert_eq!(
            q.entities::<Customer>()
                .max_(field("balance"))
                .unwrap()
                .as_f64(),
            Some(30.0),
            "backend {backend}"
        );
    }
}

#[test]
fn test_avg_len() {
    for (backend, mut fx) in fixtures() {
        seed_accounts(&mut fx.session);
        let avg_len = fx
            .session
            .query()
            .entities::<Account>()
            .avg_len(field("events"))
            .unwrap();
        // [2 events, 0 events]; the null list is excluded.
        assert_eq!(avg_len, Some(1.0), "backend {backend}");

        // All-null list field: no aggregate.
        let none = fx
            .session
            .query()
            .entities::<Account>()
            .where_(field("events").is_null())
            .avg_len(field("events"))
            .unwrap();
        assert_eq!(none, None, "backend {backend}");
    }
}

#[test]
fn test_group_by_having() {
    for (backend, mut fx) in fixtures() {
        let rows = [
            ("c1", "gold", 10.0),
            ("c2", "gold", 30.0),
            ("c3", "silver", 5.0),
        ];
        let intents: Vec<trellis::Intent> = rows
            .iter()
            .map(|(id, tier, balance)| {
                let mut c = customer(id, "X");
                c.tier = Some(tier.to_string());
                c.balance = *balance;
                c.as_intent().unwrap()
            })
            .collect();
        fx.session.ensure(intents);
        fx.session.commit().unwrap();

        let groups = fx
            .session
            .query()
            .entities::<Customer>()
            .group_by(field("tier"))
            .agg(vec![
                ("members", count()),
                ("total", sum(field("balance"))),
                ("mean", avg(field("balance"))),
            ])
            .unwrap();
        assert_eq!(groups.len(), 2, "backend {backend}");
        let gold = groups
            .iter()
            .find(|g| g.get("tier") == Some(&json!("gold")))
            .unwrap();
        assert_eq!(gold.get("members"), Some(&json!(2)));
        assert_eq!(gold.get("total").and_then(|v| v.as_f64()), Some(40.0));

        let big = fx
            .session
            .query()
            .entities::<Customer>()
            .group_by(field("tier"))
            .having(count().gt(1))
            .agg(vec![("members", count())])
            .unwrap();
        assert_eq!(big.len(), 1, "backend {backend}");
        assert_eq!(big[0].get("tier"), Some(&json!("gold")));
    }
}

#[test]
fn test_endpoint_predicates() {
    for (backend, mut fx) in fixtures() {
        let mut gold = customer("p1", "Pat");
        gold.tier = Some("Gold".into());
        let mut silver = customer("p2", "Sam");
        silver.tier = Some("Silver".into());
        fx.session.ensure(vec![
            gold.as_intent().unwrap(),
            silver.as_intent().unwrap(),
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
                left_key: "p2".into(),
                right_key: "c1".into(),
                stint_id: "a".into(),
                role: "Eng".into(),
            }
            .as_intent()
            .unwrap(),
        ]);
        fx.session.commit().unwrap();

        let hits = fx
            .session
            .query()
            .relations::<Employment>()
            .where_(left("tier").eq("Gold"))
            .collect()
            .unwrap();
        assert_eq!(hits.len(), 1, "backend {backend}");
        assert_eq!(hits[0].left_key, "p1");
        // Endpoints hydrate alongside the relation.
        assert_eq!(
            hits[0].left.as_ref().map(|l| l.name.clone()),
            Some("Pat".to_string())
        );
        assert_eq!(
            hits[0].right.as_ref().map(|r| r.name.clone()),
            Some("Acme".to_string())
        );

        let hits = fx
            .session
            .query()
            .relations::<Employment>()
            .where_(right("size").gt(5) & field("role").eq("Eng"))
            .count()
            .unwrap();
        assert_eq!(hits, 2, "backend {backend}");
    }
}

#[test]
fn test_traversal_paths() {
    for (backend, mut fx) in fixtures() {
        fx.session.ensure(vec![
            customer("p1", "Pat").as_intent().unwrap(),
            customer("p2", "Sam").as_intent().unwrap(),
            company("c1", "Acme", 10).as_intent().unwrap(),
            company("c2", "Globex", 20).as_intent().unwrap(),
            Employment {
                left_key: "p1".into(),
                right_key: "c1".into(),
                stint_id: "a".into(),
                role: "Eng".into(),
            }
            .as_intent()
            .unwrap(),
            // Two stints to the same company: destination deduped.
            Employment {
                left_key: "p1".into(),
                right_key: "c1".into(),
                stint_id: "b".into(),
                role: "Mgr".into(),
            }
            .as_intent()
            .unwrap(),
            Employment {
                left_key: "p1".into(),
                right_key: "c2".into(),
                stint_id: "a".into(),
                role: "Eng".into(),
            }
            .as_intent()
            .unwrap(),
        ]);
        fx.session.commit().unwrap();

        let paths = fx
            .session
            .query()
            .entities::<Customer>()
            .via::<Employment>()
            .collect()
            .unwrap();
        assert_eq!(paths.len(), 2, "backend {backend}");

        let p1 = paths
            .iter()
            .find(|p| p.source.id == "p1")
            .expect("source preserved");
        assert_eq!(p1.relations.len(), 3);
        let mut destinations: Vec<&str> =
            p1.destinations.iter().map(|d| d.key.as_str()).collect();
        destinations.sort();
        assert_eq!(destinations, vec!["c1", "c2"], "backend {backend}");

        // Zero-hop source still yields a path.
        let p2 = paths.iter().find(|p| p.source.id == "p2").unwrap();
        assert!(p2.relations.is_empty());
        assert!(p2.destinations.is_empty());
    }
}

#[test]
fn test_starts_with_and_contains() {
    for (backend, mut fx) in fixtures() {
        fx.session.ensure(vec![
            customer("c1", "Alice Smith").as_intent().unwrap(),
            customer("c2", "Bob Stone").as_intent().unwrap(),
        ]);
        fx.session.commit().unwrap();

        let q = fx.session.query();
        assert_eq!(
            q.entities::<Customer>()
                .where_(field("name").starts_with("Ali"))
                .count()
                .unwrap(),
            1,
            "backend {backend}"
        );
        assert_eq!(
            q.entities::<Customer>()
                .where_(field("name").ends_with("e"))
                .count()
                .unwrap(),
            1,
            "backend {backend}"
        );
        assert_eq!(
            q.entities::<Customer>()
                .where_(field("name").contains("o"))
                .count()
                .unwrap(),
            1,
            "backend {backend}"
        );
    }
}
