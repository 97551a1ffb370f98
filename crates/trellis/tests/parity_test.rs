//! Predicate parity: the SQL compiler and the in-process evaluator must
//! agree on every expression over the same dataset.

mod common;

use common::*;
use serde_json::json;
use trellis::prelude::*;

fn seed(session: &mut Session) {
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
        Account {
            id: "a4".into(),
            profile: Some(json!({"city": "Oslo", "zip": "0151"})),
            events: Some(json!([{"kind": "view", "weight": 9}])),
            active: false,
        },
    ];
    let intents: Vec<trellis::Intent> = accounts
        .iter()
        .map(|a| a.as_intent().unwrap())
        .collect();
    session.ensure(intents);
    session.commit().unwrap();
}

fn predicate_grid() -> Vec<(&'static str, FilterExpr)> {
    vec![
        ("eq_string", field("profile").path("zip").eq("0150")),
        ("ne_string", field("profile").path("zip").ne("0150")),
        ("nested_eq", field("profile").path("city").eq("Oslo")),
        ("nested_missing", field("profile").path("city").is_null()),
        ("nested_not_null", field("profile").path("zip").is_not_null()),
        ("bool_true", field("active").is_true()),
        ("bool_false", field("active").is_false()),
        ("like_prefix", field("profile").path("zip").starts_with("01")),
        ("like_suffix", field("profile").path("zip").ends_with("3")),
        ("like_contains", field("profile").path("city").contains("erg")),
        (
            "in_list",
            field("profile").path("zip").is_in(vec!["0150", "0151"]),
        ),
        (
            "in_empty",
            field("profile").path("zip").is_in(Vec::<&str>::new()),
        ),
        ("exists_eq", field("events").any_path("kind").eq("click")),
        ("exists_gt", field("events").any_path("weight").gt(2)),
        ("exists_in", field("events").any_path("kind").is_in(vec!["view"])),
        ("exists_never", field("events").any_path("kind").eq("purchase")),
        (
            "and_mix",
            field("active").is_true() & field("profile").path("city").eq("Oslo"),
        ),
        (
            "or_mix",
            field("profile").path("city").eq("Bergen")
                | field("events").any_path("weight").gt(5),
        ),
        ("not_mix", !field("active").is_true()),
        (
            "nested_and_not",
            !(field("profile").path("city").eq("Oslo") & field("active").is_false()),
        ),
    ]
}

#[test]
fn test_sql_and_in_process_evaluation_agree() {
    let mut sqlite = sqlite_fixture();
    let mut object = object_fixture();
    seed(&mut sqlite.session);
    seed(&mut object.session);

    for (name, predicate) in predicate_grid() {
        let mut sqlite_keys: Vec<String> = sqlite
            .session
            .query()
            .entities::<Account>()
            .where_(predicate.clone())
            .collect()
            .unwrap()
            .into_iter()
            .map(|h| h.id.clone())
            .collect();
        sqlite_keys.sort();

        let mut object_keys: Vec<String> = object
            .session
            .query()
            .entities::<Account>()
            .where_(predicate)
            .collect()
            .unwrap()
            .into_iter()
            .map(|h| h.id.clone())
            .collect();
        object_keys.sort();

        assert_eq!(
            sqlite_keys, object_keys,
            "predicate '{name}' diverged between SQL and in-process evaluation"
        );
    }
}

#[test]
fn test_aggregate_parity() {
    let mut sqlite = sqlite_fixture();
    let mut object = object_fixture();
    seed(&mut sqlite.session);
    seed(&mut object.session);

    for fx in [&sqlite, &object] {
        let q = fx.session.query();
        assert_eq!(q.entities::<Account>().count().unwrap(), 4);
        assert_eq!(
            q.entities::<Account>()
                .count_where(field("events").any_path("kind").eq("view"))
                .unwrap(),
            2
        );
        // Two lists with lengths 2 and 0 and one with 1; nulls excluded.
        assert_eq!(
            q.entities::<Account>().avg_len(field("events")).unwrap(),
            Some(1.0)
        );
    }
}
