//! Compilation of decoded requests into low-level SQL operations.

use super::db::{self, Type, Value};
use crate::error::Error;
use crate::schema::{Field, FieldType, Resource};

pub mod delete;
pub mod insert;
pub mod register;
pub mod resolve;
pub mod select;
pub mod shape;
pub mod update;

/// Lower a schema field type to its storage type.
pub(crate) fn lower_type(ty: FieldType) -> Type {
    match ty {
        FieldType::Serial => Type::Serial,
        FieldType::Int => Type::Int4,
        FieldType::BigInt => Type::Int8,
        FieldType::Text => Type::Text,
        // Timestamps are stored as ISO-8601 text, which orders correctly.
        FieldType::Timestamp => Type::Text,
        FieldType::Bool => Type::Bool,
    }
}

/// Coerce a raw request value into a typed parameter for the given field.
pub(crate) fn lower_value(resource: &Resource, field: &Field, raw: &str) -> Result<Value, Error> {
    let parsed = match field.ty() {
        FieldType::Serial | FieldType::BigInt => raw.parse().ok().map(Value::Int8),
        FieldType::Int => raw.parse().ok().map(Value::Int4),
        FieldType::Text | FieldType::Timestamp => Some(Value::Text(raw.into())),
        FieldType::Bool => match raw {
            "true" | "1" => Some(Value::Bool(true)),
            "false" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
    };
    parsed.ok_or_else(|| {
        Error::malformed(format!(
            "invalid {} value '{raw}' for {}.{}",
            field.ty(),
            resource.name(),
            field.name()
        ))
    })
}

/// Coerce a JSON record value into a typed parameter for the given field.
pub(crate) fn lower_json_value(
    resource: &Resource,
    field: &Field,
    value: &serde_json::Value,
) -> Result<Value, Error> {
    use serde_json::Value as Json;

    let parsed = match (field.ty(), value) {
        (_, Json::Null) => Some(Value::Null),
        (FieldType::Serial | FieldType::BigInt, Json::Number(n)) => n.as_i64().map(Value::Int8),
        (FieldType::Int, Json::Number(n)) => {
            n.as_i64().and_then(|n| i32::try_from(n).ok()).map(Value::Int4)
        }
        (FieldType::Text | FieldType::Timestamp, Json::String(s)) => {
            Some(Value::Text(s.clone()))
        }
        (FieldType::Bool, Json::Bool(b)) => Some(Value::Bool(*b)),
        _ => None,
    };
    parsed.ok_or_else(|| {
        Error::malformed(format!(
            "invalid {} value for {}.{}",
            field.ty(),
            resource.name(),
            field.name()
        ))
    })
}

/// Redact a storage-layer failure, preserving timeouts.
pub(crate) fn storage_error<E: db::Error>(err: E) -> Error {
    if err.is_timeout() {
        Error::Timeout
    } else {
        Error::storage(err)
    }
}
