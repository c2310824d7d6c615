//! Schema comparison between a live destination table and an inferred schema.
//!
//! Equality is defined over (name, semantic type) pairs only: field order,
//! the required flag and any other metadata are ignored.

use std::collections::HashMap;

use crate::models::{SchemaField, SemanticType, TableSchema};

/// Differences between an existing schema and an incoming one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaComparison {
    /// Fields present in the incoming schema but not in the existing one
    pub new_fields: Vec<SchemaField>,
    /// Fields present in the existing schema but not in the incoming one
    pub missing_fields: Vec<SchemaField>,
    /// Type changes: (field name, existing type, incoming type)
    pub type_changes: Vec<(String, SemanticType, SemanticType)>,
}

impl SchemaComparison {
    /// True when both schemas carry the same (name, type) pairs.
    pub fn is_identical(&self) -> bool {
        self.new_fields.is_empty() && self.missing_fields.is_empty() && self.type_changes.is_empty()
    }

    /// Returns the first new field that is marked required, if any.
    pub fn first_new_required_field(&self) -> Option<&SchemaField> {
        self.new_fields.iter().find(|f| f.required)
    }
}

/// Compares an existing schema against an incoming one.
pub fn compare_schemas(existing: &TableSchema, incoming: &TableSchema) -> SchemaComparison {
    let existing_fields: HashMap<&str, &SchemaField> = existing
        .fields()
        .iter()
        .map(|f| (f.name.as_str(), f))
        .collect();

    let incoming_fields: HashMap<&str, &SchemaField> = incoming
        .fields()
        .iter()
        .map(|f| (f.name.as_str(), f))
        .collect();

    let mut comparison = SchemaComparison::default();

    for field in incoming.fields() {
        match existing_fields.get(field.name.as_str()) {
            Some(current) if current.field_type != field.field_type => {
                comparison.type_changes.push((
                    field.name.clone(),
                    current.field_type,
                    field.field_type,
                ));
            }
            Some(_) => {}
            None => comparison.new_fields.push(field.clone()),
        }
    }

    for field in existing.fields() {
        if !incoming_fields.contains_key(field.name.as_str()) {
            comparison.missing_fields.push(field.clone());
        }
    }

    comparison
}

/// Reports whether two schemas match, logging every difference at WARN.
///
/// # Example
/// ```rust
/// use flashsync_core::models::{SchemaField, SemanticType, TableSchema};
/// use flashsync_core::schema::schemas_match;
///
/// let a = TableSchema::new(vec![
///     SchemaField::required("id", SemanticType::Integer),
///     SchemaField::nullable("name", SemanticType::String),
/// ]).unwrap();
/// let b = TableSchema::new(vec![
///     SchemaField::nullable("name", SemanticType::String),
///     SchemaField::nullable("id", SemanticType::Integer),
/// ]).unwrap();
///
/// assert!(schemas_match(&a, &b));
/// ```
pub fn schemas_match(existing: &TableSchema, incoming: &TableSchema) -> bool {
    if existing.len() != incoming.len() {
        tracing::warn!(
            existing_fields = existing.len(),
            incoming_fields = incoming.len(),
            "Schema field count differs"
        );
    }

    let comparison = compare_schemas(existing, incoming);

    for field in &comparison.missing_fields {
        tracing::warn!(field = %field.name, "Field missing from incoming schema");
    }
    for field in &comparison.new_fields {
        tracing::warn!(field = %field.name, field_type = %field.field_type, "Field missing from existing schema");
    }
    for (name, current, proposed) in &comparison.type_changes {
        tracing::warn!(
            field = %name,
            existing_type = %current,
            incoming_type = %proposed,
            "Field type mismatch"
        );
    }

    comparison.is_identical()
}
