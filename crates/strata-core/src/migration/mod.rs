mod graph;
mod loader;
mod operation;
mod record;

pub use graph::MigrationGraph;
pub use loader::{load_app_records, load_records_from_dir};
pub use operation::Operation;
pub use record::{MigrationId, MigrationRecord, RecordFile};
