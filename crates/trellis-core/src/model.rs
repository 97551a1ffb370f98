//! Typed entity and relation models.
//!
//! Instead of runtime reflection, types declare themselves through the
//! [`Entity`] and [`Relation`] traits: a serde-serialisable struct plus an
//! explicit [`TypeSchema`]. Intents capture an instance's identity and
//! canonical payload for delta reconciliation.

use std::ops::Deref;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TrellisError};
use crate::schema::TypeSchema;
use crate::type_spec::TypeSpec;
use crate::JsonMap;

/// A typed entity: one primary key field (typed `str`), arbitrary payload
/// fields.
pub trait Entity: Serialize + DeserializeOwned + Clone {
    fn type_name() -> &'static str;
    fn schema() -> TypeSchema;

    /// Primary key value of this instance.
    fn key(&self) -> String;

    /// Build an intent asserting this instance as desired state.
    fn as_intent(&self) -> Result<Intent> {
        Intent::from_entity(self)
    }
}

/// A typed edge between two entity types, optionally discriminated by an
/// instance key.
pub trait Relation: Serialize + DeserializeOwned + Clone {
    type Left: Entity;
    type Right: Entity;

    fn type_name() -> &'static str;
    fn schema() -> TypeSchema;
    fn left_key(&self) -> String;
    fn right_key(&self) -> String;

    /// Build an intent asserting this instance as desired state.
    fn as_intent(&self) -> Result<Intent> {
        Intent::from_relation(self)
    }
}

/// Metadata attached to query-hydrated instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub commit_id: i64,
    pub type_name: String,
    pub key: Option<String>,
    pub left_key: Option<String>,
    pub right_key: Option<String>,
    pub instance_key: Option<String>,
}

/// A typed value together with its storage metadata. Dereferences to the
/// inner value for ergonomic field access.
#[derive(Debug, Clone)]
pub struct Hydrated<T> {
    pub value: T,
    pub meta: Meta,
}

impl<T> Deref for Hydrated<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Hydrated<T> {
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// The tuple that uniquely names a record for upsert/version purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    Entity {
        type_name: String,
        key: String,
    },
    Relation {
        type_name: String,
        left_key: String,
        right_key: String,
        /// Empty string is the unkeyed-relation sentinel.
        instance_key: String,
    },
}

impl Identity {
    pub fn type_name(&self) -> &str {
        match self {
            Identity::Entity { type_name, .. } => type_name,
            Identity::Relation { type_name, .. } => type_name,
        }
    }

    /// Human-readable identity for diagnostics.
    pub fn display_key(&self) -> String {
        match self {
            Identity::Entity { key, .. } => key.clone(),
            Identity::Relation {
                left_key,
                right_key,
                instance_key,
                ..
            } => {
                if instance_key.is_empty() {
                    format!("{left_key}:{right_key}")
                } else {
                    format!("{left_key}:{right_key}:{instance_key}")
                }
            }
        }
    }
}

/// A declarative statement of expected state for one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub identity: Identity,
    pub payload: JsonMap,
    pub schema: TypeSchema,
}

impl Intent {
    pub fn from_entity<T: Entity>(value: &T) -> Result<Intent> {
        let schema = T::schema();
        schema.validate()?;
        let key = value.key();
        if key.trim().is_empty() {
            return Err(TrellisError::Validation(format!(
                "entity '{}' primary key must not be empty",
                T::type_name()
            )));
        }

        let mut payload = to_payload(value)?;
        if let Some(pk) = &schema.primary_key_field {
            payload.remove(pk);
        }
        normalize_payload(&schema, &mut payload);

        Ok(Intent {
            identity: Identity::Entity {
                type_name: T::type_name().to_string(),
                key,
            },
            payload,
            schema,
        })
    }

    pub fn from_relation<T: Relation>(value: &T) -> Result<Intent> {
        let schema = T::schema();
        schema.validate()?;
        let left_key = value.left_key();
        let right_key = value.right_key();
        if left_key.trim().is_empty() || right_key.trim().is_empty() {
            return Err(TrellisError::Validation(format!(
                "relation '{}' endpoint keys must not be empty",
                T::type_name()
            )));
        }

        let mut payload = to_payload(value)?;
        payload.remove("left_key");
        payload.remove("right_key");

        let instance_key = match &schema.instance_key_field {
            Some(field) => {
                let raw = payload.remove(field);
                match raw.as_ref().and_then(Value::as_str) {
                    Some(s) if !s.trim().is_empty() => s.to_string(),
                    _ => {
                        return Err(TrellisError::Validation(format!(
                            "relation '{}' requires a non-empty '{}' instance key",
                            T::type_name(),
                            field
                        )))
                    }
                }
            }
            None => String::new(),
        };

        normalize_payload(&schema, &mut payload);

        Ok(Intent {
            identity: Identity::Relation {
                type_name: T::type_name().to_string(),
                left_key,
                right_key,
                instance_key,
            },
            payload,
            schema,
        })
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<JsonMap> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(TrellisError::Serialization(format!(
            "expected an object payload, got {other}"
        ))),
        Err(e) => Err(TrellisError::Serialization(e.to_string())),
    }
}

/// Type-spec-aware payload normalisation: integers in float-typed fields
/// are widened so canonical JSON equality is representation-independent.
pub fn normalize_payload(schema: &TypeSchema, payload: &mut JsonMap) {
    for (name, value) in payload.iter_mut() {
        if let Some(TypeSpec::Primitive { name: prim }) = schema.field_spec(name) {
            if prim == "float" {
                if let Some(i) = value.as_i64() {
                    *value = Value::from(i as f64);
                }
            }
        }
    }
}

/// An ordered batch of intents accepted by `Session::ensure`.
#[derive(Debug, Clone, Default)]
pub struct IntentBatch(pub Vec<Intent>);

impl From<Intent> for IntentBatch {
    fn from(intent: Intent) -> Self {
        IntentBatch(vec![intent])
    }
}

impl From<Vec<Intent>> for IntentBatch {
    fn from(intents: Vec<Intent>) -> Self {
        IntentBatch(intents)
    }
}

impl FromIterator<Intent> for IntentBatch {
    fn from_iter<I: IntoIterator<Item = Intent>>(iter: I) -> Self {
        IntentBatch(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TypeSchema;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Customer {
        id: String,
        name: String,
        balance: f64,
    }

    impl Entity for Customer {
        fn type_name() -> &'static str {
            "Customer"
        }

        fn schema() -> TypeSchema {
            TypeSchema::entity("Customer")
                .primary_key("id")
                .field("name", TypeSpec::str())
                .field("balance", TypeSpec::float())
        }

        fn key(&self) -> String {
            self.id.clone()
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Employment {
        left_key: String,
        right_key: String,
        stint_id: String,
        role: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Company {
        id: String,
    }

    impl Entity for Company {
        fn type_name() -> &'static str {
            "Company"
        }

        fn schema() -> TypeSchema {
            TypeSchema::entity("Company").primary_key("id")
        }

        fn key(&self) -> String {
            self.id.clone()
        }
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

    #[test]
    fn test_entity_intent_excludes_primary_key() {
        let c = Customer {
            id: "c1".into(),
            name: "Alice".into(),
            balance: 10.0,
        };
        let intent = c.as_intent().unwrap();
        assert_eq!(
            intent.identity,
            Identity::Entity {
                type_name: "Customer".into(),
                key: "c1".into()
            }
        );
        assert!(!intent.payload.contains_key("id"));
        assert_eq!(intent.payload.get("name"), Some(&json!("Alice")));
    }

    #[test]
    fn test_relation_intent_extracts_instance_key() {
        let e = Employment {
            left_key: "p1".into(),
            right_key: "c1".into(),
            stint_id: "a".into(),
            role: "Eng".into(),
        };
        let intent = e.as_intent().unwrap();
        match &intent.identity {
            Identity::Relation {
                left_key,
                right_key,
                instance_key,
                ..
            } => {
                assert_eq!(left_key, "p1");
                assert_eq!(right_key, "c1");
                assert_eq!(instance_key, "a");
            }
            other => panic!("unexpected identity {other:?}"),
        }
        assert!(!intent.payload.contains_key("stint_id"));
        assert!(!intent.payload.contains_key("left_key"));
    }

    #[test]
    fn test_empty_instance_key_rejected() {
        let e = Employment {
            left_key: "p1".into(),
            right_key: "c1".into(),
            stint_id: "  ".into(),
            role: "Eng".into(),
        };
        assert!(e.as_intent().is_err());
    }

    #[test]
    fn test_float_normalisation() {
        // A whole-number balance serialises as an integer in JSON; the
        // normaliser widens it so equality against stored 10.0 holds.
        let mut payload: JsonMap = json!({"balance": 10}).as_object().unwrap().clone();
        normalize_payload(&Customer::schema(), &mut payload);
        assert_eq!(payload.get("balance"), Some(&json!(10.0)));
    }
}
