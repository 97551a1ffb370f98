//! Shared fixtures for integration tests.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;

use trellis::prelude::*;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub tier: Option<String>,
    pub balance: f64,
}

impl Entity for Customer {
    fn type_name() -> &'static str {
        "Customer"
    }

    fn schema() -> TypeSchema {
        TypeSchema::entity("Customer")
            .primary_key("id")
            .field("name", TypeSpec::str())
            .field("tier", TypeSpec::optional(TypeSpec::str()))
            .field("balance", TypeSpec::float())
    }

    fn key(&self) -> String {
        self.id.clone()
    }
}

pub fn customer(id: &str, name: &str) -> Customer {
    Customer {
        id: id.to_string(),
        name: name.to_string(),
        tier: None,
        balance: 0.0,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub size: i64,
}

impl Entity for Company {
    fn type_name() -> &'static str {
        "Company"
    }

    fn schema() -> TypeSchema {
        TypeSchema::entity("Company")
            .primary_key("id")
            .field("name", TypeSpec::str())
            .field("size", TypeSpec::int())
    }

    fn key(&self) -> String {
        self.id.clone()
    }
}

pub fn company(id: &str, name: &str, size: i64) -> Company {
    Company {
        id: id.to_string(),
        name: name.to_string(),
        size,
    }
}

/// Keyed relation: multiple stints per (person, company) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Employment {
    pub left_key: String,
    pub right_key: String,
    pub stint_id: String,
    pub role: String,
}

impl Relation for Employment {
    type Left = Customer;
    type Right = Company;

    fn type_name() -> &'static str {
        "Employment"
    }

    fn schema() -> TypeSchema {
        TypeSchema::relation("Employment", "Customer", "Company")
            .instance_key("stint_id")
            .field("role", TypeSpec::str())
    }

    fn left_key(&self) -> String {
        self.left_key.clone()
    }

    fn right_key(&self) -> String {
        self.right_key.clone()
    }
}

/// Unkeyed relation: one row per (customer, company) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Follows {
    pub left_key: String,
    pub right_key: String,
    pub since: i64,
}

impl Relation for Follows {
    type Left = Customer;
    type Right = Company;

    fn type_name() -> &'static str {
        "Follows"
    }

    fn schema() -> TypeSchema {
        TypeSchema::relation("Follows", "Customer", "Company")
            .field("since", TypeSpec::int())
    }

    fn left_key(&self) -> String {
        self.left_key.clone()
    }

    fn right_key(&self) -> String {
        self.right_key.clone()
    }
}

/// Entity with nested typed-dict and list-of-typed-dict payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub profile: Option<Value>,
    pub events: Option<Value>,
    pub active: bool,
}

impl Entity for Account {
    fn type_name() -> &'static str {
        "Account"
    }

    fn schema() -> TypeSchema {
        TypeSchema::entity("Account")
            .primary_key("id")
            .field(
                "profile",
                TypeSpec::optional(TypeSpec::typed_dict(
                    "Profile",
                    vec![("city", TypeSpec::str()), ("zip", TypeSpec::str())],
                )),
            )
            .field(
                "events",
                TypeSpec::optional(TypeSpec::list(TypeSpec::typed_dict(
                    "AccountEvent",
                    vec![("kind", TypeSpec::str()), ("weight", TypeSpec::int())],
                ))),
            )
            .field("active", TypeSpec::bool())
    }

    fn key(&self) -> String {
        self.id.clone()
    }
}

pub struct Fixture {
    pub session: Session,
    // Held for the lifetime of the fixture so the datastore survives.
    _dir: TempDir,
}

fn build(uri: &str) -> trellis::SessionBuilder {
    let mut config = TrellisConfig::default();
    config.event_poll_interval_ms = 5;
    config.event_backoff_base_ms = 1;
    config.event_backoff_max_ms = 10;
    Session::builder(uri)
        .config(config)
        .entity::<Customer>()
        .entity::<Company>()
        .entity::<Account>()
        .relation::<Employment>()
        .relation::<Follows>()
}

/// Session over a fresh SQLite store (latest engine).
pub fn sqlite_fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let uri = format!("sqlite://{}", dir.path().join("onto.db").display());
    Fixture {
        session: build(&uri).open().unwrap(),
        _dir: dir,
    }
}

/// Session over a fresh object-store (file://) repository.
pub fn object_fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let uri = format!("file://{}", dir.path().join("store").display());
    Fixture {
        session: build(&uri).open().unwrap(),
        _dir: dir,
    }
}

/// Both backends, for behaviour-parity assertions.
pub fn fixtures() -> Vec<(&'static str, Fixture)> {
    vec![("sqlite", sqlite_fixture()), ("object", object_fixture())]
}
