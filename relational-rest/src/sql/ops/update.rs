//! Modification of existing records.

use super::super::db::{Boolean, Column, Connection, Update as _};
use super::{insert::check_writable, lower_json_value, lower_value, storage_error};
use crate::access::VisibilityTable;
use crate::error::Error;
use crate::schema::Schema;
use serde_json::Map;

/// Update the record of `resource` identified by `id` on behalf of `role`.
///
/// Only the fields present in the record are touched. The same write-path checks as
/// [`insert`](super::insert) apply.
pub async fn execute<C: Connection>(
    conn: &C,
    schema: &Schema,
    visibility: &VisibilityTable,
    role: &str,
    resource: &str,
    id: &str,
    record: &Map<String, serde_json::Value>,
) -> Result<(), Error> {
    let resource = schema
        .resource(resource)
        .ok_or_else(|| Error::malformed(format!("unknown resource '{resource}'")))?;
    check_writable(resource, visibility, role, record)?;
    if record.is_empty() {
        return Err(Error::malformed("update record names no fields"));
    }

    let identity = resource.identity_field();
    let id = lower_value(resource, identity, id)?;

    let mut update = conn.update(resource.name().to_string());
    for (name, value) in record {
        // `check_writable` established the field exists.
        let field = resource.field(name).unwrap();
        update = update.set(name.clone(), lower_json_value(resource, field, value)?);
    }
    update
        .filter(Boolean::cmp(Column::named(identity.name().to_string()), "=", id).into())
        .execute()
        .await
        .map_err(storage_error)
}
