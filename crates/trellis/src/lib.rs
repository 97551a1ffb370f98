//! Trellis: a typed, append-only ontology store with a reactive event bus.
//!
//! Typed entities and relations live in an auditable, monotonically
//! versioned commit log. Sessions reconcile declared intents against
//! current state into atomic commits; a durable, namespaced event bus
//! with per-(event, handler) claims drives reactive handlers and
//! scheduled work. Two interchangeable backends implement the storage
//! contract: a transactional SQLite engine and an object-store engine
//! built on a manifest chain with head compare-and-swap.
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use trellis::prelude::*;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Customer {
//!     id: String,
//!     name: String,
//! }
//!
//! impl Entity for Customer {
//!     fn type_name() -> &'static str {
//!         "Customer"
//!     }
//!     fn schema() -> TypeSchema {
//!         TypeSchema::entity("Customer")
//!             .primary_key("id")
//!             .field("name", TypeSpec::str())
//!     }
//!     fn key(&self) -> String {
//!         self.id.clone()
//!     }
//! }
//!
//! # fn main() -> trellis::Result<()> {
//! let mut session = Session::builder("sqlite:///onto.db")
//!     .entity::<Customer>()
//!     .open()?;
//! session.ensure(Customer { id: "c1".into(), name: "Alice".into() }.as_intent()?);
//! let commit_id = session.commit()?;
//! assert!(commit_id.is_some());
//!
//! let hit = session
//!     .query()
//!     .entities::<Customer>()
//!     .where_(field("name").eq("Alice"))
//!     .first()?;
//! assert!(hit.is_some());
//! # Ok(())
//! # }
//! ```

pub mod handlers;
pub mod migration;
pub mod prelude;
pub mod query;
pub mod reconcile;
pub mod session;
pub mod uri;

pub use handlers::{Handler, HandlerContext};
pub use migration::{MigrationPreview, MigrationResult, UpgraderRegistry};
pub use query::{Path, QueryBuilder, RelationHit};
pub use session::{Session, SessionBuilder};
pub use uri::{open_repository, parse_storage_target, StorageTarget};

pub use trellis_core::{
    field, left, right, ClaimRecord, ClaimState, DeadLetterEvent, Entity, Event, EventEnvelope,
    FilterExpr, Hydrated, Identity, Intent, IntentBatch, Meta, Relation, Result, Schedule,
    TemporalMode, TrellisConfig, TrellisError, TypeSchema, TypeSpec,
};
pub use trellis_object::ObjectRepository;
pub use trellis_sqlite::SqliteRepository;
