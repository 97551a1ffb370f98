//! Delta reconciliation: intents against current state.

use std::collections::HashMap;

use trellis_core::error::Result;
use trellis_core::model::{Identity, Intent};
use trellis_core::repo::{ChangeOp, Repository};
use trellis_core::JsonMap;

/// One change record produced by reconciliation.
#[derive(Debug, Clone)]
pub struct Change {
    pub identity: Identity,
    pub payload: JsonMap,
    pub operation: ChangeOp,
}

/// Reconcile an ordered intent batch against the repository's current
/// state under the caller's lease snapshot.
///
/// Duplicate identities within the batch collapse to the last intent (no
/// change record for superseded intermediates); unchanged payloads are
/// no-ops; everything else becomes an insert or a version append.
pub fn reconcile(repo: &dyn Repository, intents: Vec<Intent>) -> Result<Vec<Change>> {
    // Group by identity preserving first-seen order, later overrides.
    let mut order: Vec<Identity> = Vec::new();
    let mut by_identity: HashMap<Identity, Intent> = HashMap::new();
    for intent in intents {
        if !by_identity.contains_key(&intent.identity) {
            order.push(intent.identity.clone());
        }
        by_identity.insert(intent.identity.clone(), intent);
    }

    let mut changes = Vec::new();
    for identity in order {
        let intent = by_identity.remove(&identity).expect("intent grouped above");
        match &identity {
            Identity::Entity { type_name, key } => {
                let current = repo.latest_entity(type_name, key)?;
                match current {
                    None => changes.push(Change {
                        identity,
                        payload: intent.payload,
                        operation: ChangeOp::Insert,
                    }),
                    Some(row) if row.fields != intent.payload => changes.push(Change {
                        identity,
                        payload: intent.payload,
                        operation: ChangeOp::UpdateVersion,
                    }),
                    Some(_) => {}
                }
            }
            Identity::Relation {
                type_name,
                left_key,
                right_key,
                instance_key,
            } => {
                let current = repo.latest_relation(type_name, left_key, right_key, instance_key)?;
                match current {
                    None => changes.push(Change {
                        identity: identity.clone(),
                        payload: intent.payload,
                        operation: ChangeOp::Insert,
                    }),
                    Some(row) if row.fields != intent.payload => changes.push(Change {
                        identity: identity.clone(),
                        payload: intent.payload,
                        operation: ChangeOp::UpdateVersion,
                    }),
                    Some(_) => {}
                }
            }
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use trellis_core::model::Entity;
    use trellis_core::schema::TypeSchema;
    use trellis_core::{TrellisConfig, TypeSpec};
    use trellis_sqlite::{EngineVersion, SqliteRepository};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Customer {
        id: String,
        name: String,
    }

    impl Entity for Customer {
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

    fn customer(id: &str, name: &str) -> Intent {
        Customer {
            id: id.into(),
            name: name.into(),
        }
        .as_intent()
        .unwrap()
    }

    #[test]
    fn test_insert_then_noop_then_update() {
        let repo =
            SqliteRepository::open(":memory:", TrellisConfig::default(), Some(EngineVersion::V1))
                .unwrap();

        let changes = reconcile(&repo, vec![customer("c1", "Alice")]).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, ChangeOp::Insert);

        // Persist and reconcile the identical payload: no-op.
        let cid = repo.create_commit(None).unwrap();
        repo.insert_entity("Customer", "c1", &changes[0].payload, cid, None)
            .unwrap();
        let changes = reconcile(&repo, vec![customer("c1", "Alice")]).unwrap();
        assert!(changes.is_empty());

        // Changed payload: version append.
        let changes = reconcile(&repo, vec![customer("c1", "Alicia")]).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, ChangeOp::UpdateVersion);
    }

    #[test]
    fn test_later_intent_overrides_earlier() {
        let repo =
            SqliteRepository::open(":memory:", TrellisConfig::default(), Some(EngineVersion::V1))
                .unwrap();
        let changes = reconcile(
            &repo,
            vec![customer("c1", "First"), customer("c1", "Second")],
        )
        .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0].payload.get("name"),
            Some(&serde_json::json!("Second"))
        );
    }

    #[test]
    fn test_order_preserved_across_identities() {
        let repo =
            SqliteRepository::open(":memory:", TrellisConfig::default(), Some(EngineVersion::V1))
                .unwrap();
        let changes = reconcile(
            &repo,
            vec![
                customer("b", "B"),
                customer("a", "A"),
                customer("b", "B2"),
            ],
        )
        .unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].identity.display_key(), "b");
        assert_eq!(changes[1].identity.display_key(), "a");
    }
}
