pub mod autodetect;
pub mod backend;
pub mod db;
pub mod ddl;
pub mod executor;
pub mod generator;
pub mod plan;

pub use autodetect::{DiffAction, DiffEntry, SchemaDiff};
pub use backend::{
    AppliedMigration, AppliedSet, FileLock, JsonAppliedSet, LocalLock, MemoryAppliedSet,
    MemoryDatabase, MigrationLock, PgAdvisoryLock, PgAppliedSet, PgSchemaEditor, SchemaEditor,
    SqlCollector,
};
pub use db::Database;
pub use executor::{collect_sql, ExecutorOptions, MigrationExecutor, MigrationRunResult, MigrationStatus};
pub use generator::{load_models_file, GeneratedMigration, MigrationGenerator};
pub use plan::{Direction, MigrationPlan, MigrationTarget, PlanStep};
