//! Abstract interface to a SQL database.
//!
//! Statements are built as small ASTs ([`WhereClause`], [`JoinClause`], [`OrderClause`]) and
//! handed to a [`Connection`] implementation. Every comparison value travels as a [`Value`]
//! parameter all the way to the driver; no implementation may splice one into statement text.

use async_trait::async_trait;
use derive_more::{Display, From, TryInto};
use futures::{Stream, StreamExt, TryStreamExt};
use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};

pub mod mock;
pub mod postgres;
pub mod temp;

/// Errors returned by the database.
pub trait Error: Sized + Send + std::error::Error {
    /// Wrap a custom message into this error type.
    fn custom(msg: impl Display) -> Self;

    /// An error indicating that a query returned more than the `expected` number of rows.
    fn too_many_rows(expected: usize) -> Self {
        Self::custom(format!(
            "query result has more rows than the expected {expected}"
        ))
    }

    /// An error indicating that a query which was expected to return some rows did not.
    fn empty_rows() -> Self {
        Self::custom("query result is empty")
    }

    /// Whether this error is a deadline or pool-wait expiry rather than an engine failure.
    fn is_timeout(&self) -> bool {
        false
    }
}

/// A column in a list of columns selected from a query.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SelectColumn<'a> {
    /// A single named column.
    #[display(fmt = "{}", _0)]
    Column(Column<'a>),
    /// Select all columns.
    #[display(fmt = "*")]
    All,
}

/// A column in a schema.
///
/// This describes the structure and format of each entry in the column, along with column-level
/// metadata like the name and constraints.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(fmt = "{name} {ty}")]
pub struct SchemaColumn<'a> {
    name: Cow<'a, str>,
    ty: Type,
}

impl<'a> SchemaColumn<'a> {
    /// Create a column given a name and type.
    pub fn new(name: impl Into<Cow<'a, str>>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    /// The name of this column.
    pub fn name(&self) -> Cow<'a, str> {
        self.name.clone()
    }

    /// The type of this column.
    pub fn ty(&self) -> Type {
        self.ty
    }

    /// Remove the lifetime requirement from `self` by cloning and taking ownership of borrowed
    /// data.
    pub fn into_static(self) -> SchemaColumn<'static> {
        SchemaColumn {
            name: Cow::Owned(self.name.into_owned()),
            ty: self.ty,
        }
    }
}

/// A SQL primitive data type.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Type {
    #[display(fmt = "text")]
    Text,
    #[display(fmt = "int4")]
    Int4,
    #[display(fmt = "int8")]
    Int8,
    #[display(fmt = "bool")]
    Bool,
    #[display(fmt = "serial")]
    Serial,
}

/// A primitive value supported by a SQL database.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, From)]
pub enum Value {
    /// The absence of a value.
    #[display(fmt = "NULL")]
    Null,
    /// A text string.
    #[display(fmt = "{}", _0)]
    Text(String),
    /// A 4-byte signed integer.
    #[display(fmt = "{}", _0)]
    Int4(i32),
    /// An 8-byte signed integer.
    #[display(fmt = "{}", _0)]
    Int8(i64),
    /// A boolean.
    #[display(fmt = "{}", _0)]
    Bool(bool),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.into())
    }
}

/// An identifier of a column in a SQL query, optionally qualified by a table alias.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Column<'a> {
    table: Option<Cow<'a, str>>,
    name: Cow<'a, str>,
}

impl<'a> Column<'a> {
    /// A named column.
    pub fn named(name: impl Into<Cow<'a, str>>) -> Self {
        Self {
            name: name.into(),
            table: None,
        }
    }

    /// A named column, qualified by a table name or alias.
    pub fn qualified(table: impl Into<Cow<'a, str>>, name: impl Into<Cow<'a, str>>) -> Self {
        Self {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    /// Escape this column name for interpolation into a SQL query.
    pub fn escape(&self) -> String {
        match &self.table {
            Some(table) => format!("{}.{}", escape_ident(table), escape_ident(&self.name)),
            None => escape_ident(&self.name),
        }
    }
}

impl<'a> Display for Column<'a> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if let Some(table) = &self.table {
            write!(f, "{table}.")?;
        }
        write!(f, "{}", self.name)
    }
}

impl<'a> From<Cow<'a, str>> for Column<'a> {
    fn from(name: Cow<'a, str>) -> Self {
        Self::named(name)
    }
}

impl<'a> From<&'a str> for Column<'a> {
    fn from(name: &'a str) -> Self {
        Self::named(name)
    }
}

impl<'a> From<String> for Column<'a> {
    fn from(name: String) -> Self {
        Self::named(name)
    }
}

/// A table reference in a `FROM` clause, renamed for the duration of the query.
///
/// Aliasing is what lets the same table participate in a query several times, which wildcard
/// traversal relies on.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(fmt = "{table} AS {alias}")]
pub struct TableRef<'a> {
    /// The underlying table.
    pub table: Cow<'a, str>,
    /// The name the table goes by in this query.
    pub alias: Cow<'a, str>,
}

impl<'a> TableRef<'a> {
    /// Reference `table` under `alias`.
    pub fn aliased(table: impl Into<Cow<'a, str>>, alias: impl Into<Cow<'a, str>>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
        }
    }
}

/// A clause modifying a SQL statement.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, From, TryInto)]
pub enum Clause<'a> {
    /// A `WHERE` clause.
    Where(WhereClause<'a>),
    /// A `JOIN` clause.
    Join(JoinClause<'a>),
}

/// A `WHERE` clause.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WhereClause<'a> {
    /// A `WHERE` clause which holds on any row where all of the sub-clauses hold.
    All(Box<Vec<WhereClause<'a>>>),
    /// A `WHERE` clause which holds on any row where any of the sub-clauses hold.
    Any(Box<Vec<WhereClause<'a>>>),
    /// A `WHERE` clause which holds on any row where a boolean expression is true.
    Predicate(Boolean<'a>),
}

impl<'a> From<Boolean<'a>> for WhereClause<'a> {
    fn from(b: Boolean<'a>) -> Self {
        Self::Predicate(b)
    }
}

impl<'a> WhereClause<'a> {
    /// A `WHERE` clause which holds on any row where all of the sub-clauses hold.
    pub fn all<I>(clauses: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<WhereClause<'a>>,
    {
        let mut clauses = clauses
            .into_iter()
            .map(|clause| clause.into())
            .collect::<Vec<_>>();
        if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Self::All(Box::new(clauses))
        }
    }

    /// A `WHERE` clause which holds on any row where any of the sub-clauses hold.
    pub fn any<I>(clauses: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<WhereClause<'a>>,
    {
        let mut clauses = clauses
            .into_iter()
            .map(|clause| clause.into())
            .collect::<Vec<_>>();
        if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            Self::Any(Box::new(clauses))
        }
    }
}

/// A boolean expression in a `WHERE` clause.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Boolean<'a> {
    Cmp {
        /// The column to filter.
        column: Column<'a>,
        /// The operation used to filter values of `column`.
        op: Cow<'a, str>,
        /// Parameter to `op`.
        param: Value,
    },
    OneOf {
        /// The column to filter.
        column: Column<'a>,
        /// Values to match `column` against.
        params: Vec<Value>,
    },
}

impl<'a> Boolean<'a> {
    /// A boolean expression which compares the value of a column to a constant.
    pub fn cmp(
        column: impl Into<Column<'a>>,
        op: impl Into<Cow<'a, str>>,
        param: impl Into<Value>,
    ) -> Self {
        Self::Cmp {
            column: column.into(),
            op: op.into(),
            param: param.into(),
        }
    }

    /// A boolean expression which checks if the value of a column is one of a list of constants.
    pub fn one_of<I>(column: impl Into<Column<'a>>, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Self::OneOf {
            column: column.into(),
            params: params.into_iter().map(|p| p.into()).collect(),
        }
    }
}

/// How a `JOIN` treats rows on the near side that match nothing on the far side.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JoinKind {
    /// Unmatched rows are dropped.
    #[display(fmt = "JOIN")]
    Inner,
    /// Unmatched rows are kept, with NULLs for the joined columns.
    #[display(fmt = "LEFT JOIN")]
    Left,
}

/// A `JOIN` clause.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(fmt = "{kind} {table} AS {alias} ON {lhs} {op} {rhs}")]
pub struct JoinClause<'a> {
    /// How unmatched rows are treated.
    pub kind: JoinKind,
    /// The table to join with.
    pub table: Cow<'a, str>,
    /// The name the joined table goes by in this query.
    pub alias: Cow<'a, str>,
    /// The LHS in the join condition.
    pub lhs: Column<'a>,
    /// The operation in the join condition.
    pub op: Cow<'a, str>,
    /// The RHS in the join condition.
    pub rhs: Column<'a>,
}

/// Sort direction in an `ORDER BY` clause.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    #[display(fmt = "ASC")]
    Asc,
    #[display(fmt = "DESC")]
    Desc,
}

/// An `ORDER BY` criterion.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(fmt = "{column} {direction}")]
pub struct OrderClause<'a> {
    /// The column to sort by.
    pub column: Column<'a>,
    /// The sort direction.
    pub direction: Direction,
}

/// A constraint on a set of columns in a table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey { table: String },
}

/// A connection to the database.
#[async_trait]
pub trait Connection {
    /// Errors returned from queries.
    type Error: Error;

    /// A `CREATE TABLE` statement which can be executed against the database.
    type CreateTable<'a>: CreateTable<Error = Self::Error>
    where
        Self: 'a;

    /// A `SELECT` query which can be executed against the database.
    type Select<'a>: Select<'a, Error = Self::Error>
    where
        Self: 'a;

    /// An `INSERT` statement which can be executed against the database.
    type Insert<'a>: Insert<Error = Self::Error>
    where
        Self: 'a;

    /// An `UPDATE` statement which can be executed against the database.
    type Update<'a>: Update<'a, Error = Self::Error>
    where
        Self: 'a;

    /// A `DELETE` statement which can be executed against the database.
    type Delete<'a>: Delete<'a, Error = Self::Error>
    where
        Self: 'a;

    /// Create a new database.
    async fn create_db(&mut self, name: &str) -> Result<(), Self::Error>;

    /// Drop the named database.
    async fn drop_db(&mut self, name: &str) -> Result<(), Self::Error>;

    /// Start a `CREATE TABLE` statement.
    ///
    /// `table` and `columns` describe the name and the basic structure of the table. More
    /// fine-grained control over the table (such as adding constraints) is available via the
    /// methods on the [`CreateTable`] object.
    fn create_table<'a>(
        &'a self,
        table: impl Into<Cow<'a, str>> + Send,
        columns: Vec<SchemaColumn<'a>>,
    ) -> Self::CreateTable<'a>;

    /// Start a `SELECT` query.
    ///
    /// `columns` indicates the columns to include in the query results. The resulting [`Select`]
    /// represents a statement of the form `SELECT columns FROM table AS alias`. The query can be
    /// refined, for example by adding `JOIN`, `WHERE` or `ORDER BY` clauses, using the appropriate
    /// methods on the [`Select`] object before running it.
    fn select<'a>(
        &'a self,
        columns: &'a [SelectColumn<'a>],
        from: TableRef<'a>,
    ) -> Self::Select<'a>;

    /// Start an `INSERT` statement.
    ///
    /// `table` indicates the table to insert into and `columns` the names of the columns in that
    /// table into which values should be inserted.
    fn insert<'a, C>(
        &'a self,
        table: impl Into<Cow<'a, str>> + Send,
        columns: impl IntoIterator<Item = C>,
    ) -> Self::Insert<'a>
    where
        C: Into<String>;

    /// Start an `UPDATE` statement.
    ///
    /// `table` indicates the table to update. Set the values of columns and restrict the affected
    /// rows using the methods on the [`Update`] object.
    fn update<'a>(&'a self, table: impl Into<Cow<'a, str>> + Send) -> Self::Update<'a>;

    /// Start a `DELETE` statement.
    ///
    /// `table` indicates the table to delete from. Restrict the affected rows using the methods on
    /// the [`Delete`] object.
    fn delete<'a>(&'a self, table: impl Into<Cow<'a, str>> + Send) -> Self::Delete<'a>;
}

/// A `CREATE TABLE` statement which can be executed against the database.
#[async_trait]
pub trait CreateTable: Send {
    /// Errors returned by this statement.
    type Error: Error;

    /// Add a constraint to the table.
    fn constraint<I>(self, kind: ConstraintKind, columns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>;

    /// Create the table.
    ///
    /// This will execute a statement of the form
    /// `CREATE TABLE IF NOT EXISTS table (columns constraints)`.
    async fn execute(self) -> Result<(), Self::Error>;
}

/// A `SELECT` query which can be executed against the database.
pub trait Select<'a>: Send {
    /// Errors returned by this query.
    type Error: Error;
    /// Rows returned by this query.
    type Row: Row<Error = Self::Error>;
    /// An asynchronous stream of rows.
    type Stream: Stream<Item = Result<Self::Row, Self::Error>> + Unpin + Send;

    /// Add a clause to the query.
    fn clause(self, clause: Clause<'a>) -> Self;

    /// Add an `ORDER BY` criterion to the query.
    fn order(self, order: OrderClause<'a>) -> Self;

    /// Cap the number of rows returned by the query.
    fn limit(self, limit: u64) -> Self;

    /// Run the query and get a stream of results.
    fn stream(self) -> Self::Stream;
}

/// An extension trait for [`Select`] that provides some higher-level functions.
#[async_trait]
pub trait SelectExt<'a>: Select<'a> {
    /// Add a `WHERE` clause to the query.
    fn filter(self, clause: impl Into<WhereClause<'a>>) -> Self;

    /// Add a `WHERE` clause based on a column comparison.
    fn cmp(self, column: impl Into<Column<'a>>, op: impl Into<Cow<'a, str>>, param: Value) -> Self;

    /// Add an inner `JOIN` clause to the query.
    fn join(
        self,
        table: impl Into<Cow<'a, str>>,
        alias: impl Into<Cow<'a, str>>,
        lhs: impl Into<Column<'a>>,
        op: impl Into<Cow<'a, str>>,
        rhs: impl Into<Column<'a>>,
    ) -> Self;

    /// Add multiple clauses to the query.
    fn clauses<I>(self, clauses: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Clause<'a>>;

    /// Run a query which is expected to return a single row.
    ///
    /// # Errors
    ///
    /// This method will fail if the query does not return exactly one row.
    async fn one(self) -> Result<Self::Row, Self::Error>;

    /// Run a query and collect the results.
    async fn many(self) -> Result<Vec<Self::Row>, Self::Error>;

    /// Run a query which is expected to return either 0 or 1 rows.
    ///
    /// # Errors
    ///
    /// This method will fail if the query does not return exactly 0 or 1 rows.
    async fn opt(self) -> Result<Option<Self::Row>, Self::Error>;
}

#[async_trait]
impl<'a, T: Select<'a>> SelectExt<'a> for T {
    fn filter(self, clause: impl Into<WhereClause<'a>>) -> Self {
        self.clause(clause.into().into())
    }

    fn cmp(self, column: impl Into<Column<'a>>, op: impl Into<Cow<'a, str>>, param: Value) -> Self {
        self.filter(Boolean::Cmp {
            column: column.into(),
            op: op.into(),
            param,
        })
    }

    fn join(
        self,
        table: impl Into<Cow<'a, str>>,
        alias: impl Into<Cow<'a, str>>,
        lhs: impl Into<Column<'a>>,
        op: impl Into<Cow<'a, str>>,
        rhs: impl Into<Column<'a>>,
    ) -> Self {
        self.clause(Clause::Join(JoinClause {
            kind: JoinKind::Inner,
            table: table.into(),
            alias: alias.into(),
            lhs: lhs.into(),
            op: op.into(),
            rhs: rhs.into(),
        }))
    }

    fn clauses<I>(mut self, clauses: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Clause<'a>>,
    {
        for clause in clauses {
            self = self.clause(clause.into());
        }
        self
    }

    async fn opt(self) -> Result<Option<Self::Row>, Self::Error> {
        let mut rows = self.stream();
        let Some(row) = rows.next().await else { return Ok(None); };
        if rows.next().await.is_some() {
            return Err(Self::Error::too_many_rows(1));
        }
        row.map(Some)
    }

    async fn one(self) -> Result<Self::Row, Self::Error> {
        self.opt().await?.ok_or_else(Self::Error::empty_rows)
    }

    async fn many(self) -> Result<Vec<Self::Row>, Self::Error> {
        self.stream().try_collect().await
    }
}

/// An `INSERT` statement which can be executed against the database.
#[async_trait]
pub trait Insert: Send {
    /// Errors returned by this statement.
    type Error: Error;

    /// Add rows to insert.
    ///
    /// Each row must have one value per column named when the statement was created.
    fn rows<R>(self, rows: R) -> Self
    where
        R: IntoIterator<Item = Vec<Value>>;

    /// Do the insertion.
    ///
    /// This will execute a statement of the form `INSERT INTO table (columns) VALUES (rows)`.
    async fn execute(self) -> Result<(), Self::Error>;
}

/// An `UPDATE` statement which can be executed against the database.
#[async_trait]
pub trait Update<'a>: Send {
    /// Errors returned by this statement.
    type Error: Error;

    /// Set a column of every affected row to a parameter value.
    fn set(self, column: impl Into<Cow<'a, str>>, value: Value) -> Self;

    /// Restrict the rows affected by the statement.
    fn filter(self, clause: WhereClause<'a>) -> Self;

    /// Do the update.
    ///
    /// This will execute a statement of the form `UPDATE table SET columns WHERE filters`.
    async fn execute(self) -> Result<(), Self::Error>;
}

/// A `DELETE` statement which can be executed against the database.
#[async_trait]
pub trait Delete<'a>: Send {
    /// Errors returned by this statement.
    type Error: Error;

    /// Restrict the rows affected by the statement.
    fn filter(self, clause: WhereClause<'a>) -> Self;

    /// Do the deletion.
    ///
    /// This will execute a statement of the form `DELETE FROM table WHERE filters`.
    async fn execute(self) -> Result<(), Self::Error>;
}

/// A row in a database table.
pub trait Row: Sized + Send {
    /// Errors returned by row operations.
    type Error: Error;

    /// Get the value of `column` in this row.
    ///
    /// `column` is an index corresponding to the order in which columns were requested in the
    /// `SELECT` statement.
    ///
    /// # Errors
    ///
    /// This method will fail if the specified column does not exist.
    fn column(&self, column: usize) -> Result<Value, Self::Error>;
}

/// Escape an identifier (table name, column name, etc.) for inclusion in a SQL query.
pub fn escape_ident(s: impl AsRef<str>) -> String {
    format!("\"{}\"", s.as_ref().replace('"', "\"\""))
}
