//! The service facade: one object tying the whole pipeline together.
//!
//! A [`Service`] owns the schema graph, the visibility table and a database connection. Per
//! request it runs decode → resolve → access pruning → compile → execute, in that order, so every
//! compiler-stage error is raised before any storage round trip. The service has no per-request
//! mutable state and can be shared across concurrent handlers; the transport layer (HTTP routing,
//! authentication) is somebody else's job and only needs [`read`](Service::read),
//! [`decode`](Service::decode) and the write operations.

use crate::access::{self, VisibilityTable};
use crate::error::Error;
use crate::rest::uri::{self, Request};
use crate::schema::Schema;
use crate::sql::db::Connection;
use crate::sql::ops::{delete, insert, register, resolve::resolve, select, shape::ResultGraph, update};
use crate::Config;
use async_std::future::timeout;
use serde::Serialize;
use serde_json::json;

/// The decoded form of a URI, as returned by the introspection endpoint.
///
/// `encoded` is the canonical re-encoding of `request`; decoding it again yields the same
/// request, though the text may differ from what was received.
#[derive(Clone, Debug, Serialize)]
pub struct Decoded {
    pub received: String,
    pub request: Request,
    pub encoded: String,
}

/// A request service bound to a schema, a visibility table and a database.
#[derive(Clone, Debug)]
pub struct Service<Db> {
    db: Db,
    schema: Schema,
    visibility: VisibilityTable,
    config: Config,
}

impl<Db: Connection + Send + Sync> Service<Db> {
    /// Create a service for `schema`, enforcing `visibility`, executing against `db`.
    pub fn new(db: Db, schema: Schema, visibility: VisibilityTable, config: Config) -> Self {
        Self {
            db,
            schema,
            visibility,
            config,
        }
    }

    /// The schema this service serves.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The underlying connection to the database.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Create the backing tables for the schema.
    pub async fn provision(&self) -> Result<(), Error> {
        register::execute(&self.db, &self.schema).await
    }

    /// Decode `uri` and echo its canonical form, without executing anything.
    pub fn decode(&self, uri_str: &str) -> Result<Decoded, Error> {
        let request = uri::decode(uri_str, &self.schema)?;
        let encoded = uri::encode(&request);
        Ok(Decoded {
            received: uri_str.into(),
            request,
            encoded,
        })
    }

    /// Read the records matching `uri` as `role`.
    ///
    /// One request compiles to one join query; the storage round trip is bounded by the
    /// configured query timeout.
    pub async fn read(&self, uri_str: &str, role: &str) -> Result<ResultGraph, Error> {
        let request = uri::decode(uri_str, &self.schema)?;
        tracing::debug!(?request, role, "decoded request");

        let tree = resolve(&request, &self.schema, self.config.max_wildcard_depth)?;
        let tree = access::prune(&tree, &self.visibility, role)?;
        let compiled = select::compile(
            &request,
            &self.schema,
            tree,
            &self.visibility,
            role,
            self.config.default_limit,
        )?;

        timeout(
            self.config.query_timeout,
            select::execute(&self.db, &compiled),
        )
        .await
        .map_err(|_| Error::Timeout)?
    }

    /// Insert a record into `resource` as `role`.
    pub async fn create(
        &self,
        resource: &str,
        record: &serde_json::Map<String, serde_json::Value>,
        role: &str,
    ) -> Result<(), Error> {
        timeout(
            self.config.query_timeout,
            insert::execute(&self.db, &self.schema, &self.visibility, role, resource, record),
        )
        .await
        .map_err(|_| Error::Timeout)?
    }

    /// Update the record of `resource` identified by `id` as `role`.
    pub async fn update(
        &self,
        resource: &str,
        id: &str,
        record: &serde_json::Map<String, serde_json::Value>,
        role: &str,
    ) -> Result<(), Error> {
        timeout(
            self.config.query_timeout,
            update::execute(
                &self.db,
                &self.schema,
                &self.visibility,
                role,
                resource,
                id,
                record,
            ),
        )
        .await
        .map_err(|_| Error::Timeout)?
    }

    /// Delete the record of `resource` identified by `id` as `role`.
    pub async fn delete(&self, resource: &str, id: &str, role: &str) -> Result<(), Error> {
        timeout(
            self.config.query_timeout,
            delete::execute(&self.db, &self.schema, &self.visibility, role, resource, id),
        )
        .await
        .map_err(|_| Error::Timeout)?
    }

    /// The resource index: every resource with its fields and outgoing relationships.
    pub fn resource_index(&self) -> serde_json::Value {
        let mut index = serde_json::Map::new();
        for resource in self.schema.resources() {
            index.insert(
                resource.name().into(),
                json!({
                    "identity": resource.identity(),
                    "fields": resource
                        .fields()
                        .iter()
                        .map(|f| json!({"name": f.name(), "type": f.ty().to_string()}))
                        .collect::<Vec<_>>(),
                    "relationships": self
                        .schema
                        .relationships_from(resource.name())
                        .map(|r| {
                            json!({
                                "name": r.name(),
                                "target": r.target(),
                                "cardinality": r.cardinality().to_string(),
                            })
                        })
                        .collect::<Vec<_>>(),
                }),
            );
        }
        index.into()
    }
}
