//! Creation of new records.

use super::super::db::{Connection, Insert as _, Value};
use super::{lower_json_value, storage_error};
use crate::access::VisibilityTable;
use crate::error::Error;
use crate::schema::{FieldType, Resource, Schema};
use serde_json::Map;

/// Insert a record into `resource` on behalf of `role`.
///
/// The record may cover any subset of the resource's non-identity fields; omitted fields are
/// stored as NULL. Writes fail closed: the resource and every field written must be visible to
/// the role.
pub async fn execute<C: Connection>(
    conn: &C,
    schema: &Schema,
    visibility: &VisibilityTable,
    role: &str,
    resource: &str,
    record: &Map<String, serde_json::Value>,
) -> Result<(), Error> {
    let resource = schema
        .resource(resource)
        .ok_or_else(|| Error::malformed(format!("unknown resource '{resource}'")))?;
    check_writable(resource, visibility, role, record)?;

    let mut columns = vec![];
    let mut values = vec![];
    for field in resource.fields() {
        if field.ty() == FieldType::Serial {
            continue;
        }
        columns.push(field.name().to_string());
        values.push(match record.get(field.name()) {
            Some(value) => lower_json_value(resource, field, value)?,
            None => Value::Null,
        });
    }

    conn.insert(resource.name().to_string(), columns)
        .rows([values])
        .execute()
        .await
        .map_err(storage_error)
}

/// Shared write-path validation: the resource must be visible to the role, and every field in the
/// record must exist, be visible, and not be storage-assigned.
pub(super) fn check_writable(
    resource: &Resource,
    visibility: &VisibilityTable,
    role: &str,
    record: &Map<String, serde_json::Value>,
) -> Result<(), Error> {
    if visibility.visible_fields(role, resource.name()).is_none() {
        return Err(Error::AccessDenied {
            role: role.into(),
            resource: resource.name().into(),
        });
    }

    for name in record.keys() {
        let field = resource.field(name).ok_or_else(|| Error::UnknownField {
            resource: resource.name().into(),
            field: name.clone(),
        })?;
        if field.ty() == FieldType::Serial {
            return Err(Error::malformed(format!(
                "{}.{} is assigned by storage",
                resource.name(),
                name
            )));
        }
        if !visibility.is_visible(role, resource.name(), name) {
            return Err(Error::AccessDenied {
                role: role.into(),
                resource: format!("{}.{}", resource.name(), name),
            });
        }
    }

    Ok(())
}
