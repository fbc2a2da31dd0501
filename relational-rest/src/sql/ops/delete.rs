//! Removal of existing records.

use super::super::db::{Boolean, Column, Connection, Delete as _};
use super::{lower_value, storage_error};
use crate::access::VisibilityTable;
use crate::error::Error;
use crate::schema::Schema;

/// Delete the record of `resource` identified by `id` on behalf of `role`.
pub async fn execute<C: Connection>(
    conn: &C,
    schema: &Schema,
    visibility: &VisibilityTable,
    role: &str,
    resource: &str,
    id: &str,
) -> Result<(), Error> {
    let resource = schema
        .resource(resource)
        .ok_or_else(|| Error::malformed(format!("unknown resource '{resource}'")))?;
    if visibility.visible_fields(role, resource.name()).is_none() {
        return Err(Error::AccessDenied {
            role: role.into(),
            resource: resource.name().into(),
        });
    }

    let identity = resource.identity_field();
    let id = lower_value(resource, identity, id)?;

    conn.delete(resource.name().to_string())
        .filter(Boolean::cmp(Column::named(identity.name().to_string()), "=", id).into())
        .execute()
        .await
        .map_err(storage_error)
}
