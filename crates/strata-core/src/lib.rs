//! Data model of the strata migration ledger.
//!
//! Records, operations and field descriptors, the project state they
//! produce when replayed, the dependency graph that orders them, plus the
//! shared configuration and error types.

pub mod config;
pub mod error;
pub mod migration;
pub mod schema;

pub use config::StrataConfig;
pub use error::{Result, StrataError};
pub use migration::{MigrationGraph, MigrationId, MigrationRecord, Operation};
pub use schema::{FieldDef, FieldKind, ModelState, OnDelete, ProjectState};
