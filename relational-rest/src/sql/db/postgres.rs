//! Instantiation of the abstract [`db`](super) interface for PostgreSQL.
//!
//! This instantiation is built on [`async-postgres`]. Connections are checked out of a managed
//! pool per statement, with a bounded size and a wait timeout, and returned on every exit path.
//! Comparison values are always sent as statement parameters (`$n` placeholders), never spliced
//! into statement text.
#![cfg(feature = "postgres")]

use super::{
    escape_ident, Clause, ConstraintKind, JoinClause, JoinKind, OrderClause, SchemaColumn,
    SelectColumn, TableRef, Value, WhereClause,
};
use async_std::task::spawn;
use async_trait::async_trait;
use bytes::BytesMut;
use deadpool::{
    managed::{self, Object, PoolError, RecycleResult, Timeouts},
    Runtime,
};
use derive_more::From;
use futures::{stream::BoxStream, StreamExt, TryFutureExt, TryStreamExt};
use itertools::Itertools;
use snafu::Snafu;
use std::borrow::Cow;
use std::fmt::Display;
use std::time::Duration;
use tokio_postgres::types::{accepts, to_sql_checked, FromSql, IsNull, ToSql, Type};

pub use async_postgres::{Config, Row};

/// Errors returned by a PostgreSQL database.
#[derive(Debug, Snafu, From)]
pub enum Error {
    #[from]
    Sql {
        source: async_postgres::Error,
    },
    Connect {
        source: std::io::Error,
    },
    #[snafu(display("timed out waiting for a pooled connection"))]
    PoolTimeout,
    Pool {
        message: String,
    },
    UnsupportedType {
        ty: Type,
    },
    Custom {
        message: String,
    },
}

impl super::Error for Error {
    fn custom(msg: impl Display) -> Self {
        Self::Custom {
            message: msg.to_string(),
        }
    }

    fn is_timeout(&self) -> bool {
        matches!(self, Self::PoolTimeout)
    }
}

/// Sizing and patience limits for the connection pool.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Maximum number of connections checked out at once.
    pub max_connections: usize,
    /// How long a statement may wait for a connection before failing.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Creates pooled clients by connecting to the database.
struct ClientManager {
    config: Config,
}

#[async_trait]
impl managed::Manager for ClientManager {
    type Type = tokio_postgres::Client;
    type Error = Error;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let (client, conn) = async_postgres::connect(self.config.clone())
            .await
            .map_err(|source| Error::Connect { source })?;
        spawn(conn);
        Ok(client)
    }

    async fn recycle(&self, client: &mut Self::Type) -> RecycleResult<Self::Error> {
        if client.is_closed() {
            return Err(managed::RecycleError::Message(
                "client disconnected".into(),
            ));
        }
        Ok(())
    }
}

/// A pooled connection to a PostgreSQL database.
#[derive(Clone)]
pub struct Connection {
    pool: managed::Pool<ClientManager>,
}

impl Connection {
    /// Connect with the given [`Config`] and default pool limits.
    pub async fn new(config: Config) -> Result<Self, Error> {
        Self::with_pool(config, PoolConfig::default()).await
    }

    /// Connect with the given [`Config`] and pool limits.
    ///
    /// One connection is established eagerly so that misconfiguration surfaces here rather than on
    /// the first request.
    pub async fn with_pool(config: Config, pool_config: PoolConfig) -> Result<Self, Error> {
        let pool = managed::Pool::builder(ClientManager { config })
            .max_size(pool_config.max_connections)
            .timeouts(Timeouts {
                wait: Some(pool_config.acquire_timeout),
                create: Some(pool_config.acquire_timeout),
                recycle: None,
            })
            .runtime(Runtime::AsyncStd1)
            .build()
            .map_err(|err| Error::Pool {
                message: err.to_string(),
            })?;
        let conn = Self { pool };
        conn.client().await?;
        Ok(conn)
    }

    async fn client(&self) -> Result<Object<ClientManager>, Error> {
        self.pool.get().await.map_err(|err| match err {
            PoolError::Timeout(_) => Error::PoolTimeout,
            PoolError::Backend(err) => err,
            err => Error::Pool {
                message: err.to_string(),
            },
        })
    }

    async fn query(
        &self,
        statement: &str,
        params: &[Value],
    ) -> Result<BoxStream<'static, Result<Row, Error>>, Error> {
        tracing::info!(?params, "{}", statement);
        let client = self.client().await?;
        let params = params.iter().map(|param| {
            let param: &dyn ToSql = param;
            param
        });
        let stream = client
            .query_raw(statement, params)
            .await
            .map_err(Error::from)?;
        // The move closure keeps the pooled client checked out until the row stream is dropped,
        // whether it completes, fails or is cancelled.
        Ok(stream
            .map_err(Error::from)
            .map(move |row| {
                let _checked_out = &client;
                row
            })
            .boxed())
    }
}

#[async_trait]
impl super::Connection for Connection {
    type Error = Error;
    type CreateTable<'a> = CreateTable<'a>;
    type Select<'a> = Select<'a>;
    type Insert<'a> = Insert<'a>;
    type Update<'a> = Update<'a>;
    type Delete<'a> = Delete<'a>;

    async fn create_db(&mut self, name: &str) -> Result<(), Self::Error> {
        self.query(&format!("CREATE DATABASE {}", escape_ident(name)), &[])
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    async fn drop_db(&mut self, name: &str) -> Result<(), Self::Error> {
        self.query(&format!("DROP DATABASE {}", escape_ident(name)), &[])
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    fn create_table<'a>(
        &'a self,
        table: impl Into<Cow<'a, str>> + Send,
        columns: Vec<SchemaColumn<'a>>,
    ) -> Self::CreateTable<'a> {
        CreateTable {
            conn: self,
            table: table.into(),
            columns,
            constraints: vec![],
        }
    }

    fn select<'a>(
        &'a self,
        columns: &'a [SelectColumn<'a>],
        from: TableRef<'a>,
    ) -> Self::Select<'a> {
        Select {
            conn: self,
            columns,
            from,
            joins: vec![],
            filters: vec![],
            orders: vec![],
            limit: None,
        }
    }

    fn insert<'a, C>(
        &'a self,
        table: impl Into<Cow<'a, str>> + Send,
        columns: impl IntoIterator<Item = C>,
    ) -> Self::Insert<'a>
    where
        C: Into<String>,
    {
        Insert {
            conn: self,
            table: table.into(),
            columns: columns.into_iter().map(|c| c.into()).collect(),
            rows: vec![],
        }
    }

    fn update<'a>(&'a self, table: impl Into<Cow<'a, str>> + Send) -> Self::Update<'a> {
        Update {
            conn: self,
            table: table.into(),
            sets: vec![],
            filters: vec![],
        }
    }

    fn delete<'a>(&'a self, table: impl Into<Cow<'a, str>> + Send) -> Self::Delete<'a> {
        Delete {
            conn: self,
            table: table.into(),
            filters: vec![],
        }
    }
}

/// A query against a PostgreSQL database.
pub struct Select<'a> {
    conn: &'a Connection,
    columns: &'a [SelectColumn<'a>],
    from: TableRef<'a>,
    joins: Vec<JoinClause<'a>>,
    filters: Vec<WhereClause<'a>>,
    orders: Vec<OrderClause<'a>>,
    limit: Option<u64>,
}

impl<'a> super::Select<'a> for Select<'a> {
    type Error = Error;
    type Row = Row;
    type Stream = BoxStream<'a, Result<Self::Row, Self::Error>>;

    fn clause(mut self, clause: Clause<'a>) -> Self {
        match clause {
            Clause::Join(join) => self.joins.push(join),
            Clause::Where(filter) => self.filters.push(filter),
        }
        self
    }

    fn order(mut self, order: OrderClause<'a>) -> Self {
        self.orders.push(order);
        self
    }

    fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn stream(self) -> Self::Stream {
        async move {
            let (statement, params) = build_select(
                self.columns,
                &self.from,
                &self.joins,
                &self.filters,
                &self.orders,
                self.limit,
            );
            let rows = self.conn.query(statement.as_str(), &params).await?;
            Ok(rows)
        }
        .try_flatten_stream()
        .boxed()
    }
}

/// Format a `SELECT` statement, collecting comparison values into a parameter list.
fn build_select(
    columns: &[SelectColumn],
    from: &TableRef,
    joins: &[JoinClause],
    filters: &[WhereClause],
    orders: &[OrderClause],
    limit: Option<u64>,
) -> (String, Vec<Value>) {
    let columns = columns
        .iter()
        .map(|col| match col {
            SelectColumn::Column(col) => col.escape(),
            SelectColumn::All => "*".to_string(),
        })
        .join(", ");

    let mut statement = format!(
        "SELECT {columns} FROM {} AS {}",
        escape_ident(&from.table),
        escape_ident(&from.alias)
    );
    for join in joins {
        statement = format!(
            "{statement} {} {} AS {} ON {} {} {}",
            join.kind,
            escape_ident(&join.table),
            escape_ident(&join.alias),
            join.lhs.escape(),
            join.op,
            join.rhs.escape()
        );
    }

    let mut params = vec![];
    if !filters.is_empty() {
        let condition = filters
            .iter()
            .map(|clause| render_where(clause, &mut params))
            .join(" AND ");
        statement = format!("{statement} WHERE {condition}");
    }

    if !orders.is_empty() {
        let orders = orders
            .iter()
            .map(|order| format!("{} {}", order.column.escape(), order.direction))
            .join(", ");
        statement = format!("{statement} ORDER BY {orders}");
    }
    if let Some(limit) = limit {
        statement = format!("{statement} LIMIT {limit}");
    }

    (statement, params)
}

/// Render a `WHERE` clause, appending its comparison values to `params`.
fn render_where(clause: &WhereClause, params: &mut Vec<Value>) -> String {
    match clause {
        WhereClause::All(clauses) if clauses.is_empty() => "TRUE".into(),
        WhereClause::All(clauses) => {
            let rendered = clauses
                .iter()
                .map(|clause| render_where(clause, params))
                .join(" AND ");
            format!("({rendered})")
        }
        WhereClause::Any(clauses) if clauses.is_empty() => "FALSE".into(),
        WhereClause::Any(clauses) => {
            let rendered = clauses
                .iter()
                .map(|clause| render_where(clause, params))
                .join(" OR ");
            format!("({rendered})")
        }
        WhereClause::Predicate(super::Boolean::Cmp { column, op, param }) => {
            params.push(param.clone());
            format!("{} {op} ${}", column.escape(), params.len())
        }
        WhereClause::Predicate(super::Boolean::OneOf {
            column,
            params: options,
        }) => {
            if options.is_empty() {
                // `IN ()` is invalid SQL; an empty list matches nothing.
                return "FALSE".into();
            }
            let placeholders = options
                .iter()
                .map(|option| {
                    params.push(option.clone());
                    format!("${}", params.len())
                })
                .join(", ");
            format!("{} IN ({placeholders})", column.escape())
        }
    }
}

/// An `INSERT` statement for a PostgreSQL database.
pub struct Insert<'a> {
    conn: &'a Connection,
    table: Cow<'a, str>,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[async_trait]
impl<'a> super::Insert for Insert<'a> {
    type Error = Error;

    fn rows<R>(mut self, rows: R) -> Self
    where
        R: IntoIterator<Item = Vec<Value>>,
    {
        self.rows.extend(rows);
        self
    }

    async fn execute(self) -> Result<(), Error> {
        let width = self.columns.len();
        let columns = self.columns.iter().map(escape_ident).join(",");
        let rows = (0..self.rows.len())
            .map(|i| {
                let values = (0..width)
                    .map(|j| {
                        // In the statement itself, just reference a parameter by number. The value
                        // travels to the driver out of band, which is what defeats injection.
                        // Params are 1-indexed.
                        format!("${}", i * width + j + 1)
                    })
                    .join(",");
                format!("({values})")
            })
            .join(",");
        let params = self.rows.into_iter().flatten().collect::<Vec<_>>();
        self.conn
            .query(
                format!(
                    "INSERT INTO {} ({}) VALUES {}",
                    escape_ident(self.table),
                    columns,
                    rows
                )
                .as_str(),
                &params,
            )
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }
}

/// An `UPDATE` statement for a PostgreSQL database.
pub struct Update<'a> {
    conn: &'a Connection,
    table: Cow<'a, str>,
    sets: Vec<(Cow<'a, str>, Value)>,
    filters: Vec<WhereClause<'a>>,
}

#[async_trait]
impl<'a> super::Update<'a> for Update<'a> {
    type Error = Error;

    fn set(mut self, column: impl Into<Cow<'a, str>>, value: Value) -> Self {
        self.sets.push((column.into(), value));
        self
    }

    fn filter(mut self, clause: WhereClause<'a>) -> Self {
        self.filters.push(clause);
        self
    }

    async fn execute(self) -> Result<(), Error> {
        let mut params = vec![];
        let sets = self
            .sets
            .into_iter()
            .map(|(column, value)| {
                params.push(value);
                format!("{} = ${}", escape_ident(column), params.len())
            })
            .join(", ");
        let mut statement = format!("UPDATE {} SET {sets}", escape_ident(&self.table));
        if !self.filters.is_empty() {
            let condition = self
                .filters
                .iter()
                .map(|clause| render_where(clause, &mut params))
                .join(" AND ");
            statement = format!("{statement} WHERE {condition}");
        }
        self.conn
            .query(statement.as_str(), &params)
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }
}

/// A `DELETE` statement for a PostgreSQL database.
pub struct Delete<'a> {
    conn: &'a Connection,
    table: Cow<'a, str>,
    filters: Vec<WhereClause<'a>>,
}

#[async_trait]
impl<'a> super::Delete<'a> for Delete<'a> {
    type Error = Error;

    fn filter(mut self, clause: WhereClause<'a>) -> Self {
        self.filters.push(clause);
        self
    }

    async fn execute(self) -> Result<(), Error> {
        let mut params = vec![];
        let mut statement = format!("DELETE FROM {}", escape_ident(&self.table));
        if !self.filters.is_empty() {
            let condition = self
                .filters
                .iter()
                .map(|clause| render_where(clause, &mut params))
                .join(" AND ");
            statement = format!("{statement} WHERE {condition}");
        }
        self.conn
            .query(statement.as_str(), &params)
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }
}

/// A `CREATE TABLE` statement for a PostgreSQL database.
pub struct CreateTable<'a> {
    conn: &'a Connection,
    table: Cow<'a, str>,
    columns: Vec<SchemaColumn<'a>>,
    constraints: Vec<(ConstraintKind, Vec<String>)>,
}

#[async_trait]
impl<'a> super::CreateTable for CreateTable<'a> {
    type Error = Error;

    fn constraint<I>(mut self, kind: ConstraintKind, columns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.constraints
            .push((kind, columns.into_iter().map(|col| col.into()).collect()));
        self
    }

    async fn execute(self) -> Result<(), Self::Error> {
        let table = escape_ident(&self.table);
        let columns = self
            .columns
            .into_iter()
            .map(|col| {
                let ty = match col.ty() {
                    super::Type::Int4 => "int4",
                    super::Type::Int8 => "int8",
                    super::Type::Bool => "boolean",
                    super::Type::Text => "text",
                    // Identities read back as int8 everywhere.
                    super::Type::Serial => "bigserial",
                };
                format!("{} {}", escape_ident(col.name()), ty)
            })
            .join(",");
        let constraints = self
            .constraints
            .into_iter()
            .map(|(kind, cols)| format_constraint(&self.table, kind, &cols))
            .join(",");
        self.conn
            .query(
                format!(
                    "CREATE TABLE IF NOT EXISTS {table} ({columns}{}{constraints})",
                    if constraints.is_empty() { "" } else { "," }
                )
                .as_str(),
                &[],
            )
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }
}

impl super::Row for Row {
    type Error = Error;

    fn column(&self, column: usize) -> Result<Value, Self::Error> {
        Ok(self
            .try_get::<_, Option<Value>>(column)?
            .unwrap_or(Value::Null))
    }
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>
    where
        Self: Sized,
    {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Text(x) => x.to_sql(ty, out),
            Self::Int4(x) => x.to_sql(ty, out),
            Self::Int8(x) => x.to_sql(ty, out),
            Self::Bool(x) => x.to_sql(ty, out),
        }
    }

    accepts!(BOOL, INT4, INT8, TEXT);
    to_sql_checked!();
}

impl<'a> FromSql<'a> for Value {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync + 'static>> {
        match ty {
            &Type::BOOL => Ok(Self::Bool(bool::from_sql(ty, raw)?)),
            &Type::INT4 => Ok(Self::Int4(i32::from_sql(ty, raw)?)),
            &Type::INT8 => Ok(Self::Int8(i64::from_sql(ty, raw)?)),
            &Type::TEXT => Ok(Self::Text(String::from_sql(ty, raw)?)),
            ty => Err(Box::new(Error::UnsupportedType { ty: ty.clone() })),
        }
    }

    accepts!(BOOL, INT4, INT8, TEXT);
}

fn format_constraint(table: impl AsRef<str>, kind: ConstraintKind, cols: &[String]) -> String {
    let table = table.as_ref();
    let cols_ident = cols.iter().join("-");
    let cols = cols.iter().map(escape_ident).join(",");
    match kind {
        ConstraintKind::PrimaryKey => {
            format!(
                "CONSTRAINT {} PRIMARY KEY ({cols})",
                escape_ident(format!("{table}-pk-{cols_ident}"))
            )
        }
        ConstraintKind::ForeignKey { table: target } => {
            format!(
                "CONSTRAINT {} FOREIGN KEY ({cols}) REFERENCES {}",
                escape_ident(format!("{table}-fk-{target}-{cols_ident}")),
                escape_ident(target)
            )
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::{Boolean, Column, Direction};
    use super::*;

    fn select_fixture<'a>(
        columns: &'a [SelectColumn<'a>],
        filters: Vec<WhereClause<'a>>,
    ) -> (String, Vec<Value>) {
        build_select(
            columns,
            &TableRef::aliased("event", "event_0"),
            &[],
            &filters,
            &[],
            None,
        )
    }

    #[test]
    fn test_build_select_joins_and_aliases() {
        let columns = [
            SelectColumn::Column(Column::qualified("event_0", "id")),
            SelectColumn::Column(Column::qualified("tag_1", "name")),
        ];
        let joins = [
            JoinClause {
                kind: JoinKind::Inner,
                table: "nn_event_tag".into(),
                alias: "tag_1_ln".into(),
                lhs: Column::qualified("event_0", "id"),
                op: "=".into(),
                rhs: Column::qualified("tag_1_ln", "event_id"),
            },
            JoinClause {
                kind: JoinKind::Left,
                table: "tag".into(),
                alias: "tag_1".into(),
                lhs: Column::qualified("tag_1_ln", "tag_id"),
                op: "=".into(),
                rhs: Column::qualified("tag_1", "id"),
            },
        ];
        let (statement, params) = build_select(
            &columns,
            &TableRef::aliased("event", "event_0"),
            &joins,
            &[],
            &[OrderClause {
                column: Column::qualified("tag_1", "name"),
                direction: Direction::Asc,
            }],
            Some(10),
        );
        assert_eq!(
            statement,
            "SELECT \"event_0\".\"id\", \"tag_1\".\"name\" FROM \"event\" AS \"event_0\" \
             JOIN \"nn_event_tag\" AS \"tag_1_ln\" ON \"event_0\".\"id\" = \"tag_1_ln\".\"event_id\" \
             LEFT JOIN \"tag\" AS \"tag_1\" ON \"tag_1_ln\".\"tag_id\" = \"tag_1\".\"id\" \
             ORDER BY \"tag_1\".\"name\" ASC LIMIT 10"
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_filter_values_are_parameters_not_text() {
        // A hostile filter value must end up as a bound parameter, never in the statement.
        let hostile = "'; DROP TABLE event;--";
        let columns = [SelectColumn::Column(Column::qualified("event_0", "id"))];
        let (statement, params) = select_fixture(
            &columns,
            vec![Boolean::cmp(Column::qualified("event_0", "summary"), "=", hostile).into()],
        );
        assert_eq!(
            statement,
            "SELECT \"event_0\".\"id\" FROM \"event\" AS \"event_0\" \
             WHERE \"event_0\".\"summary\" = $1"
        );
        assert_eq!(params, [Value::from(hostile)]);
    }

    #[test]
    fn test_nested_where_rendering() {
        let columns = [SelectColumn::All];
        let clause = WhereClause::any([
            WhereClause::from(Boolean::cmp(Column::named("a"), "<", 1i32)),
            WhereClause::all([
                WhereClause::from(Boolean::cmp(Column::named("b"), ">", 2i32)),
                WhereClause::from(Boolean::one_of(Column::named("c"), [3i32, 4])),
            ]),
        ]);
        let (statement, params) = select_fixture(&columns, vec![clause]);
        assert_eq!(
            statement,
            "SELECT * FROM \"event\" AS \"event_0\" \
             WHERE (\"a\" < $1 OR (\"b\" > $2 AND \"c\" IN ($3, $4)))"
        );
        assert_eq!(
            params,
            [
                Value::Int4(1),
                Value::Int4(2),
                Value::Int4(3),
                Value::Int4(4)
            ]
        );
    }

    #[async_std::test]
    async fn test_postgres_round_trip() {
        use super::super::temp::TempDatabase;
        use super::super::{
            Connection as _, CreateTable as _, Insert as _, Row as _, SelectExt, Type,
        };
        use crate::init_logging;
        use std::env;

        init_logging();
        if env::var("POSTGRES_TESTS").is_err() {
            tracing::warn!("skipping postgres test since POSTGRES_TESTS are not enabled");
            return;
        }
        let port = env::var("POSTGRES_TESTS_PORT")
            .map(|port| port.parse().unwrap())
            .unwrap_or(5432);
        let password = env::var("POSTGRES_TESTS_PASSWORD").unwrap_or("password".to_string());

        let mut config = Config::default();
        config
            .host("127.0.0.1")
            .user("postgres")
            .password(&password)
            .port(port);
        let db = TempDatabase::create(config).await.unwrap();

        db.create_table(
            "tag",
            vec![
                SchemaColumn::new("id", Type::Serial),
                SchemaColumn::new("name", Type::Text),
            ],
        )
        .execute()
        .await
        .unwrap();
        db.insert("tag", ["name"])
            .rows([vec![Value::from("alpha")], vec![Value::from("beta")]])
            .execute()
            .await
            .unwrap();

        let columns = [SelectColumn::Column(Column::qualified("tag", "name"))];
        let rows = db
            .select(&columns, TableRef::aliased("tag", "tag"))
            .filter(Boolean::cmp(
                Column::qualified("tag", "name"),
                "LIKE",
                "a%",
            ))
            .many()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].column(0).unwrap(), Value::from("alpha"));
    }

    #[test]
    fn test_empty_one_of_matches_nothing() {
        let columns = [SelectColumn::All];
        let (statement, params) = select_fixture(
            &columns,
            vec![Boolean::one_of(Column::named("id"), Vec::<Value>::new()).into()],
        );
        assert_eq!(
            statement,
            "SELECT * FROM \"event\" AS \"event_0\" WHERE FALSE"
        );
        assert!(params.is_empty());
    }
}
