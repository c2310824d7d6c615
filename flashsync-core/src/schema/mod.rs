//! Schema inference, type mapping and comparison.

mod comparison;
mod inference;
mod type_mapping;

pub use comparison::{SchemaComparison, compare_schemas, schemas_match};
pub use inference::{infer_schema, sample_query};
pub use type_mapping::{lookup_native_type, map_native_type, normalize_type_name};
