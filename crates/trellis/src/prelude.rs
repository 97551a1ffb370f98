//! Common imports for trellis applications.
//!
//! ```
//! use trellis::prelude::*;
//! ```

pub use trellis_core::{
    field, left, right, Entity, Event, EventEnvelope, FilterExpr, Hydrated, IntentBatch, Meta,
    Relation, Result, Schedule, TrellisConfig, TrellisError, TypeSchema, TypeSpec,
};

pub use crate::handlers::{Handler, HandlerContext};
pub use crate::migration::UpgraderRegistry;
pub use crate::query::{avg, count, max, min, sum};
pub use crate::session::Session;
