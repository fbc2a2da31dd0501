//! Creation of the backing tables for a schema.

use super::super::db::{Connection, ConstraintKind, CreateTable as _, SchemaColumn, Type};
use super::{lower_type, storage_error};
use crate::error::Error;
use crate::schema::{JoinKeys, Schema};
use std::collections::HashSet;

/// Create the backing table for every resource and link table in `schema`.
///
/// Tables are created `IF NOT EXISTS`, so registering against an already-provisioned database is
/// harmless.
pub async fn execute<C: Connection>(conn: &C, schema: &Schema) -> Result<(), Error> {
    for resource in schema.resources() {
        let columns = resource
            .fields()
            .iter()
            .map(|field| SchemaColumn::new(field.name().to_string(), lower_type(field.ty())))
            .collect();
        conn.create_table(resource.name().to_string(), columns)
            .constraint(ConstraintKind::PrimaryKey, [resource.identity().to_string()])
            .execute()
            .await
            .map_err(storage_error)?;
    }

    // A link table may back several relationships (typically one per direction); create it once.
    let mut seen = HashSet::new();
    for relationship in schema.relationships() {
        let JoinKeys::Via {
            table,
            source_column,
            target_column,
        } = relationship.keys()
        else {
            continue;
        };
        if !seen.insert(table.clone()) {
            continue;
        }

        conn.create_table(
            table.to_string(),
            vec![
                SchemaColumn::new(source_column.to_string(), Type::Int8),
                SchemaColumn::new(target_column.to_string(), Type::Int8),
            ],
        )
        .constraint(
            ConstraintKind::ForeignKey {
                table: relationship.source().into(),
            },
            [source_column.to_string()],
        )
        .constraint(
            ConstraintKind::ForeignKey {
                table: relationship.target().into(),
            },
            [target_column.to_string()],
        )
        .execute()
        .await
        .map_err(storage_error)?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::super::super::db::mock;
    use super::*;
    use crate::init_logging;
    use crate::schema::test::calendar;

    #[async_std::test]
    async fn test_register_creates_resource_and_link_tables() {
        init_logging();
        let schema = calendar();
        let db = mock::Connection::create();
        execute(&db, &schema).await.unwrap();

        let tables = db.schema().await;
        for table in ["event", "type", "tag", "nn_event_type", "nn_event_tag"] {
            assert!(tables.contains_key(table), "missing table {table}");
        }
        let event = &tables["event"];
        assert_eq!(event.len(), 4);
        assert!(event
            .iter()
            .any(|col| col.name() == "time" && col.ty() == Type::Text));

        // Registering again is a no-op, not an error.
        execute(&db, &schema).await.unwrap();
    }
}
