//! Mock instantiation of the abstract [`db`](super) interface.
//!
//! This instantiation is built on a simple in-memory database. It is useful for testing in
//! isolation from an actual database. It evaluates the same statement ASTs as the real backends,
//! including aliased joins, `LIKE` patterns, ordering and limits.
#![cfg(any(test, feature = "mocks"))]

use super::{
    Clause, Column, ConstraintKind, Direction, Error as _, JoinClause, JoinKind, OrderClause,
    SchemaColumn, SelectColumn, TableRef, Type, Value, WhereClause,
};
use async_std::sync::{Arc, RwLock};
use async_trait::async_trait;
use derive_more::From;
use futures::{
    stream::{self, BoxStream},
    StreamExt, TryFutureExt,
};
use itertools::Itertools;
use snafu::Snafu;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::hash_map::{Entry, HashMap};
use std::fmt::Display;
use std::iter;

/// Errors returned by the in-memory database.
#[derive(Debug, Snafu, From)]
#[snafu(display("mock DB error: {}", message))]
pub struct Error {
    message: String,
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

impl super::Error for Error {
    fn custom(msg: impl Display) -> Self {
        Self {
            message: msg.to_string(),
        }
    }
}

/// The in-memory database.
#[derive(Debug, Default)]
struct Db {
    tables: HashMap<String, Table>,
}

/// An in-memory table.
#[derive(Debug)]
struct Table {
    name: String,
    serial_cols: Vec<SchemaColumn<'static>>,
    explicit_cols: Vec<SchemaColumn<'static>>,
    rows: Vec<Row>,
}

impl Table {
    fn new(name: String, schema: Vec<SchemaColumn<'static>>) -> Self {
        // Separate the auto-incrementing columns from the columns that require explicit values.
        let (serial_cols, explicit_cols) = schema
            .into_iter()
            .partition(|col| col.ty() == Type::Serial);
        Self {
            name,
            serial_cols,
            explicit_cols,
            rows: vec![],
        }
    }

    fn append(&mut self, rows: impl IntoIterator<Item = Vec<Value>>) -> Result<(), Error> {
        for row in rows {
            // We require a value for all columns except the serial columns, which are
            // auto-incremented.
            if row.len() != self.explicit_cols.len() {
                return Err(Error::from(format!(
                    "incorrect width for table {} (found {}, expected {})",
                    self.name,
                    row.len(),
                    self.explicit_cols.len()
                )));
            }

            let auto_values =
                iter::repeat(Value::Int8(self.rows.len() as i64 + 1)).take(self.serial_cols.len());
            self.rows.push(Row::new(auto_values.chain(row).collect()));
        }

        Ok(())
    }

    fn schema(&self) -> impl '_ + Iterator<Item = SchemaColumn<'static>> {
        self.serial_cols.iter().chain(&self.explicit_cols).cloned()
    }

    /// The columns of this table, qualified by `alias`.
    fn qualified_schema(&self, alias: &str) -> Vec<Column<'static>> {
        self.schema()
            .map(|col| Column::qualified(alias.to_string(), col.name().into_owned()))
            .collect()
    }
}

/// A connection to the in-memory database.
#[derive(Clone, Debug)]
pub struct Connection(Arc<RwLock<Db>>);

impl Default for Connection {
    fn default() -> Self {
        Self::create()
    }
}

impl Connection {
    /// Create a new database and connect to it.
    ///
    /// This will create a connection to a fresh, empty database. It will not be connected or
    /// related to any previous connection or database. Once the database is created, this
    /// connection can be [cloned](Clone) in order to create multiple simultaneous connections to
    /// the same database.
    pub fn create() -> Self {
        Self(Default::default())
    }

    /// Create a table with the given columns.
    pub async fn create_table(
        &self,
        table: impl Into<String>,
        columns: Vec<SchemaColumn<'static>>,
    ) -> Result<(), Error> {
        let mut db = self.0.write().await;
        let table = table.into();
        if let Entry::Vacant(e) = db.tables.entry(table.clone()) {
            e.insert(Table::new(table, columns));
        }
        Ok(())
    }

    /// Create a table with the given columns and row values.
    ///
    /// The values specified for each row cover the non-serial columns; serial columns are
    /// auto-incremented.
    pub async fn create_table_with_rows(
        &self,
        table: impl Into<String>,
        columns: Vec<SchemaColumn<'static>>,
        rows: impl IntoIterator<Item = Vec<Value>>,
    ) -> Result<(), Error> {
        let table = table.into();
        self.create_table(&table, columns).await?;

        let mut db = self.0.write().await;
        let table = db.tables.get_mut(&table).unwrap();
        table.append(rows)
    }

    /// The schema of this database.
    ///
    /// The schema maps table names to the schema for each table. Each table schema consists of a
    /// list of column schemas.
    pub async fn schema(&self) -> HashMap<String, Vec<SchemaColumn<'static>>> {
        self.0
            .read()
            .await
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), table.schema().collect()))
            .collect()
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

    async fn create_db(&mut self, _name: &str) -> Result<(), Self::Error> {
        Err(Self::Error::custom(
            "Mock database does not support creating more databases",
        ))
    }

    async fn drop_db(&mut self, _name: &str) -> Result<(), Self::Error> {
        Err(Self::Error::custom(
            "Mock database does not support dropping databases",
        ))
    }

    fn create_table<'a>(
        &'a self,
        table: impl Into<Cow<'a, str>> + Send,
        columns: Vec<SchemaColumn<'a>>,
    ) -> Self::CreateTable<'a> {
        CreateTable {
            db: self,
            table: table.into(),
            columns,
        }
    }

    fn select<'a>(
        &'a self,
        columns: &'a [SelectColumn<'a>],
        from: TableRef<'a>,
    ) -> Self::Select<'a> {
        Select {
            db: &self.0,
            from,
            columns,
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
            db: &self.0,
            table: table.into(),
            columns: columns.into_iter().map(|c| c.into()).collect(),
            rows: vec![],
        }
    }

    fn update<'a>(&'a self, table: impl Into<Cow<'a, str>> + Send) -> Self::Update<'a> {
        Update {
            db: &self.0,
            table: table.into(),
            sets: vec![],
            filters: vec![],
        }
    }

    fn delete<'a>(&'a self, table: impl Into<Cow<'a, str>> + Send) -> Self::Delete<'a> {
        Delete {
            db: &self.0,
            table: table.into(),
            filters: vec![],
        }
    }
}

/// A query against an in-memory database.
pub struct Select<'a> {
    db: &'a RwLock<Db>,
    from: TableRef<'a>,
    columns: &'a [SelectColumn<'a>],
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
            let db = self.db.read().await;
            let table = db
                .tables
                .get(&*self.from.table)
                .ok_or_else(|| Error::from(format!("no such table {}", self.from.table)))?;

            tracing::info!("SELECT {:?} FROM {}", self.columns, self.from);
            let mut rows = table.rows.clone();
            let mut schema = table.qualified_schema(&self.from.alias);
            for JoinClause {
                kind,
                table,
                alias,
                lhs,
                op,
                rhs,
            } in self.joins
            {
                tracing::info!("{kind} {table} AS {alias} ON {lhs} {op} {rhs}");
                let join_table = db
                    .tables
                    .get(&*table)
                    .ok_or_else(|| Error::from(format!("no such table {}", table)))?;
                let width = join_table.schema().count();
                schema.extend(join_table.qualified_schema(&alias));

                let mut joined = vec![];
                for row in rows {
                    let mut matched = false;
                    for right in join_table.rows.clone() {
                        if let Some(combined) = row.clone().join(right, &schema, &lhs, &op, &rhs)? {
                            joined.push(combined);
                            matched = true;
                        }
                    }
                    if !matched && kind == JoinKind::Left {
                        // Keep the unmatched row, padding the joined columns with NULLs.
                        joined.push(row.pad(width));
                    }
                }
                rows = joined;
            }
            for clause in &self.filters {
                tracing::info!("WHERE {clause:?}");
                rows = rows
                    .into_iter()
                    .filter_map(|row| match row.eval(&schema, clause) {
                        Ok(true) => Some(Ok(row)),
                        Ok(false) => None,
                        Err(err) => Some(Err(err)),
                    })
                    .try_collect()?;
            }

            // Later criteria are subordinate to earlier ones, so apply them first; the sorts are
            // stable.
            for OrderClause { column, direction } in self.orders.iter().rev() {
                tracing::info!("ORDER BY {column} {direction}");
                let mut failed = Ok(());
                rows.sort_by(|a, b| {
                    let ordering = match (a.get(&schema, column), b.get(&schema, column)) {
                        (Ok(a), Ok(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
                        (Err(err), _) | (_, Err(err)) => {
                            failed = Err(Error::custom(&err));
                            Ordering::Equal
                        }
                    };
                    match direction {
                        Direction::Asc => ordering,
                        Direction::Desc => ordering.reverse(),
                    }
                });
                failed?;
            }

            if let Some(limit) = self.limit {
                rows.truncate(limit as usize);
            }

            let rows = rows
                .into_iter()
                .map(|row| row.select(&schema, self.columns))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(stream::iter(rows).map(Ok))
        }
        .try_flatten_stream()
        .boxed()
    }
}

/// An insert statement for an in-memory database.
pub struct Insert<'a> {
    db: &'a RwLock<Db>,
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
        let mut db = self.db.write().await;
        let table = db
            .tables
            .get_mut(&*self.table)
            .ok_or_else(|| Error::from(format!("no such table {}", self.table)))?;

        // Map positions in the input rows to the positions of the corresponding columns in the
        // table schema.
        if self.columns.len() != table.explicit_cols.len() {
            return Err(Error::from(format!(
                "incorrect width for table {} (found {}, expected {})",
                self.table,
                self.columns.len(),
                table.explicit_cols.len()
            )));
        }
        let mut permutation = Vec::with_capacity(table.explicit_cols.len());
        for col in &table.explicit_cols {
            let index = self
                .columns
                .iter()
                .position(|name| *name == *col.name())
                .ok_or_else(|| {
                    Error::from(format!("insert into {} misses column {}", self.table, col))
                })?;
            permutation.push(index);
        }

        let rows = self
            .rows
            .into_iter()
            .map(|row| {
                if row.len() != permutation.len() {
                    return Err(Error::from(format!(
                        "incorrect width for table {} (found {}, expected {})",
                        self.table,
                        row.len(),
                        permutation.len()
                    )));
                }
                Ok(permutation.iter().map(|i| row[*i].clone()).collect())
            })
            .collect::<Result<Vec<Vec<_>>, _>>()?;

        table.append(rows)
    }
}

/// An update statement for an in-memory database.
pub struct Update<'a> {
    db: &'a RwLock<Db>,
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
        let mut db = self.db.write().await;
        let table = db
            .tables
            .get_mut(&*self.table)
            .ok_or_else(|| Error::from(format!("no such table {}", self.table)))?;

        let schema = table.qualified_schema(&self.table);
        let mut sets = Vec::with_capacity(self.sets.len());
        for (column, value) in self.sets {
            let index = schema
                .iter()
                .position(|col| col.name == column)
                .ok_or_else(|| {
                    Error::from(format!("table {} has no column {column}", self.table))
                })?;
            sets.push((index, value));
        }

        let mut rows = std::mem::take(&mut table.rows);
        for row in &mut rows {
            if row.matches(&schema, &self.filters)? {
                for (index, value) in &sets {
                    row.columns[*index] = value.clone();
                }
            }
        }
        table.rows = rows;
        Ok(())
    }
}

/// A delete statement for an in-memory database.
pub struct Delete<'a> {
    db: &'a RwLock<Db>,
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
        let mut db = self.db.write().await;
        let table = db
            .tables
            .get_mut(&*self.table)
            .ok_or_else(|| Error::from(format!("no such table {}", self.table)))?;

        let schema = table.qualified_schema(&self.table);
        let mut failed = Ok(());
        let rows = std::mem::take(&mut table.rows);
        table.rows = rows
            .into_iter()
            .filter(|row| match row.matches(&schema, &self.filters) {
                Ok(matches) => !matches,
                Err(err) => {
                    failed = Err(err);
                    true
                }
            })
            .collect();
        failed
    }
}

/// A create table statement for an in-memory database.
pub struct CreateTable<'a> {
    db: &'a Connection,
    table: Cow<'a, str>,
    columns: Vec<SchemaColumn<'a>>,
}

#[async_trait]
impl<'a> super::CreateTable for CreateTable<'a> {
    type Error = Error;

    fn constraint<I>(self, _kind: ConstraintKind, _columns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        // The mock database doesn't enforce constraints.
        self
    }

    async fn execute(self) -> Result<(), Self::Error> {
        self.db
            .create_table(
                self.table,
                self.columns
                    .into_iter()
                    .map(|col| col.into_static())
                    .collect(),
            )
            .await
    }
}

/// A row in an in-memory table.
#[derive(Clone, Debug, Default)]
pub struct Row {
    columns: Vec<Value>,
}

impl Row {
    /// Create a row with the given entries.
    fn new(columns: Vec<Value>) -> Self {
        Self { columns }
    }

    /// Evaluate a `WHERE` clause against this row.
    fn eval(&self, schema: &[Column], clause: &WhereClause) -> Result<bool, Error> {
        match clause {
            WhereClause::All(clauses) => {
                for clause in clauses.iter() {
                    if !self.eval(schema, clause)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            WhereClause::Any(clauses) => {
                for clause in clauses.iter() {
                    if self.eval(schema, clause)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            WhereClause::Predicate(super::Boolean::Cmp { column, op, param }) => {
                Self::cmp(self.get(schema, column)?, op, param)
            }
            WhereClause::Predicate(super::Boolean::OneOf { column, params }) => {
                let value = self.get(schema, column)?;
                Ok(params.iter().any(|param| param == value))
            }
        }
    }

    /// Evaluate the conjunction of `filters` against this row.
    fn matches(&self, schema: &[Column], filters: &[WhereClause]) -> Result<bool, Error> {
        for clause in filters {
            if !self.eval(schema, clause)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Join this row with another row if the joined pair matches a condition.
    ///
    /// `schema` should be the concatenated schemas of `self` and `other`.
    ///
    /// If the joined pair matches, a new row will be returned which consists of all of the columns
    /// of this row, in order, followed by all of the columns of the other row, in order.
    fn join(
        mut self,
        other: Row,
        schema: &[Column],
        lhs: &Column,
        op: &str,
        rhs: &Column,
    ) -> Result<Option<Self>, Error> {
        self.columns.extend(other.columns);
        Ok(
            if Self::cmp(self.get(schema, lhs)?, op, self.get(schema, rhs)?)? {
                Some(self)
            } else {
                None
            },
        )
    }

    /// Extend this row with `width` NULL columns.
    fn pad(mut self, width: usize) -> Self {
        self.columns
            .extend(iter::repeat(Value::Null).take(width));
        self
    }

    /// Create a new row with just the specified columns, in the specified order.
    fn select(self, schema: &[Column], columns: &[SelectColumn]) -> Result<Self, Error> {
        let mut selected = vec![];
        for col in columns {
            match col {
                SelectColumn::All => return Ok(self),
                SelectColumn::Column(col) => {
                    selected.push(self.get(schema, col)?.clone());
                }
            }
        }
        Ok(Self { columns: selected })
    }

    /// Compare two values.
    fn cmp(lhs: &Value, op: &str, rhs: &Value) -> Result<bool, Error> {
        if matches!(lhs, Value::Null) || matches!(rhs, Value::Null) {
            // NULL compares with nothing, like in SQL.
            return Ok(false);
        }
        match op {
            "=" => Ok(lhs == rhs),
            "!=" => Ok(lhs != rhs),
            "LIKE" => match (lhs, rhs) {
                (Value::Text(text), Value::Text(pattern)) => Ok(like_match(text, pattern)),
                (lhs, rhs) => Err(Error::from(format!(
                    "LIKE requires text operands, got {lhs:?} and {rhs:?}"
                ))),
            },
            "<" | "<=" | ">" | ">=" => {
                let ordering = lhs.partial_cmp(rhs).ok_or_else(|| {
                    Error::from(format!("type mismatch for op {op}: {lhs:?}, {rhs:?}"))
                })?;
                Ok(match op {
                    "<" => ordering == Ordering::Less,
                    "<=" => ordering != Ordering::Greater,
                    ">" => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                })
            }
            op => Err(Error::from(format!("unsupported operator {op}"))),
        }
    }

    /// Get the value of the named column.
    fn get(&self, schema: &[Column], col: &Column) -> Result<&Value, Error> {
        let index = schema
            .iter()
            .position(|schema_col| {
                if col.table.is_some() {
                    // Every column in the schema is qualified, so if `col` is also qualified, we
                    // want an exact match.
                    col.table == schema_col.table && col.name == schema_col.name
                } else {
                    // Otherwise find the first column whose name matches `col`.
                    col.name == schema_col.name
                }
            })
            .ok_or_else(|| Error::from(format!("no such column {col}")))?;
        Ok(&self.columns[index])
    }
}

impl super::Row for Row {
    type Error = Error;

    fn column(&self, column: usize) -> Result<Value, Self::Error> {
        self.columns
            .get(column)
            .cloned()
            .ok_or_else(|| format!("column index {column} out of range").into())
    }
}

/// Match `text` against a SQL `LIKE` pattern, where `%` matches any run of characters and `_`
/// matches exactly one.
fn like_match(text: &str, pattern: &str) -> bool {
    fn helper(text: &[char], pattern: &[char]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some('%') => (0..=text.len()).any(|skip| helper(&text[skip..], &pattern[1..])),
            Some('_') => !text.is_empty() && helper(&text[1..], &pattern[1..]),
            Some(c) => text.first() == Some(c) && helper(&text[1..], &pattern[1..]),
        }
    }
    helper(
        &text.chars().collect::<Vec<_>>(),
        &pattern.chars().collect::<Vec<_>>(),
    )
}
