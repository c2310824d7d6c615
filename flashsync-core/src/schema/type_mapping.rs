//! Native column type to semantic type conversion.
//!
//! Source drivers report type names such as `VARCHAR(50)`, `int unsigned` or
//! `DATETIME`. These are normalized (upper-cased, parameters and modifiers
//! stripped) and looked up in a fixed table. The mapping is total: anything
//! unrecognized is stored as [`SemanticType::String`].

use crate::models::SemanticType;

/// Normalizes a native type name for lookup.
///
/// Upper-cases the name, drops everything from the first `(`, and removes the
/// `UNSIGNED`/`SIGNED`/`ZEROFILL` modifiers.
///
/// # Example
/// ```rust
/// use flashsync_core::schema::normalize_type_name;
///
/// assert_eq!(normalize_type_name("varchar(50)"), "VARCHAR");
/// assert_eq!(normalize_type_name("int(10) unsigned zerofill"), "INT");
/// assert_eq!(normalize_type_name("double precision"), "DOUBLE PRECISION");
/// ```
pub fn normalize_type_name(native: &str) -> String {
    let upper = native.trim().to_uppercase();
    let base = upper.split('(').next().unwrap_or_default();

    base.split_whitespace()
        .filter(|word| !matches!(*word, "UNSIGNED" | "SIGNED" | "ZEROFILL"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Looks up a native type name, returning `None` when it is not recognized.
pub fn lookup_native_type(native: &str) -> Option<SemanticType> {
    let semantic = match normalize_type_name(native).as_str() {
        // String types
        "VARCHAR" | "CHAR" | "CHARACTER" | "CHARACTER VARYING" | "TEXT" | "TINYTEXT"
        | "MEDIUMTEXT" | "LONGTEXT" => SemanticType::String,

        // Integer types
        "INT" | "INTEGER" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "BIGINT" => {
            SemanticType::Integer
        }

        // Decimal and floating point types
        "FLOAT" | "DOUBLE" | "DOUBLE PRECISION" | "REAL" | "DECIMAL" | "NUMERIC" => {
            SemanticType::Float
        }

        // Date/Time types
        "DATE" => SemanticType::Date,
        "DATETIME" | "TIMESTAMP" => SemanticType::Timestamp,

        // Boolean type
        "BOOLEAN" | "BOOL" => SemanticType::Boolean,

        _ => return None,
    };
    Some(semantic)
}

/// Maps a native type name to its semantic type, defaulting to STRING.
///
/// # Example
/// ```rust
/// use flashsync_core::models::SemanticType;
/// use flashsync_core::schema::map_native_type;
///
/// assert_eq!(map_native_type("VARCHAR(50)"), SemanticType::String);
/// assert_eq!(map_native_type("bigint unsigned"), SemanticType::Integer);
/// assert_eq!(map_native_type("datetime"), SemanticType::Timestamp);
/// assert_eq!(map_native_type("GEOMETRY"), SemanticType::String);
/// ```
pub fn map_native_type(native: &str) -> SemanticType {
    lookup_native_type(native).unwrap_or(SemanticType::String)
}
