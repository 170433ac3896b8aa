mod field;
mod model;
mod state;
mod types;

pub use field::{
    resolve_model_ref, table_name, Choice, FieldDef, FieldKind, ManyRelation, Relation,
};
pub use model::ModelState;
pub use state::ProjectState;
pub use types::{OnDelete, SqlType};
