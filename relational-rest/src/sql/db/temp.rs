//! A temporary database which is dropped on [`Drop`].
#![cfg(feature = "postgres")]

use super::postgres::{Config, Connection, Error, PoolConfig};
use super::{Connection as _, SchemaColumn, SelectColumn, TableRef};
use async_trait::async_trait;
use rand::RngCore;
use std::borrow::Cow;

/// A [`Connection`](super::Connection) backed by a temporary database in a PostgreSQL cluster.
///
/// A randomly named database is created on construction and dropped again when this struct is
/// dropped, which makes it useful for integration tests that need a pristine database each run.
pub struct TempDatabase {
    name: String,
    admin: Config,
    // `Option` so that `Drop` can disconnect before dropping the database.
    conn: Option<Connection>,
}

impl TempDatabase {
    /// Create a temporary database in the cluster `admin` points at, and connect to it.
    pub async fn create(admin: Config) -> Result<Self, Error> {
        let name = format!("tempdb{}", rand::thread_rng().next_u64());
        let mut bootstrap = Connection::new(admin.clone()).await?;
        bootstrap.create_db(&name).await?;
        drop(bootstrap);

        let mut config = admin.clone();
        config.dbname(&name);
        let conn = Connection::with_pool(config, PoolConfig::default()).await?;
        Ok(Self {
            name,
            admin,
            conn: Some(conn),
        })
    }

    /// The name of the temporary database.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn conn(&self) -> &Connection {
        // Only `Drop` takes the connection.
        self.conn.as_ref().unwrap()
    }
}

impl Drop for TempDatabase {
    fn drop(&mut self) {
        // Disconnect from the temporary database before asking the cluster to drop it.
        drop(self.conn.take());

        let result = async_std::task::block_on(async {
            let mut bootstrap = Connection::new(self.admin.clone()).await?;
            bootstrap.drop_db(&self.name).await
        });
        if let Err(err) = result {
            tracing::error!("error dropping temp DB {}: {err}", self.name);
        }
    }
}

#[async_trait]
impl super::Connection for TempDatabase {
    type Error = Error;

    type CreateTable<'a> = <Connection as super::Connection>::CreateTable<'a>
    where
        Self: 'a;

    type Select<'a> = <Connection as super::Connection>::Select<'a>
    where
        Self: 'a;

    type Insert<'a> = <Connection as super::Connection>::Insert<'a>
    where
        Self: 'a;

    type Update<'a> = <Connection as super::Connection>::Update<'a>
    where
        Self: 'a;

    type Delete<'a> = <Connection as super::Connection>::Delete<'a>
    where
        Self: 'a;

    async fn create_db(&mut self, _name: &str) -> Result<(), Self::Error> {
        Err(super::Error::custom(
            "TempDatabase does not support creating more databases",
        ))
    }

    async fn drop_db(&mut self, _name: &str) -> Result<(), Self::Error> {
        Err(super::Error::custom(
            "TempDatabase does not support dropping databases",
        ))
    }

    fn create_table<'a>(
        &'a self,
        table: impl Into<Cow<'a, str>> + Send,
        columns: Vec<SchemaColumn<'a>>,
    ) -> Self::CreateTable<'a> {
        self.conn().create_table(table, columns)
    }

    fn select<'a>(
        &'a self,
        columns: &'a [SelectColumn<'a>],
        from: TableRef<'a>,
    ) -> Self::Select<'a> {
        self.conn().select(columns, from)
    }

    fn insert<'a, C>(
        &'a self,
        table: impl Into<Cow<'a, str>> + Send,
        columns: impl IntoIterator<Item = C>,
    ) -> Self::Insert<'a>
    where
        C: Into<String>,
    {
        self.conn().insert(table, columns)
    }

    fn update<'a>(&'a self, table: impl Into<Cow<'a, str>> + Send) -> Self::Update<'a> {
        self.conn().update(table)
    }

    fn delete<'a>(&'a self, table: impl Into<Cow<'a, str>> + Send) -> Self::Delete<'a> {
        self.conn().delete(table)
    }
}
