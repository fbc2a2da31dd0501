//! Compilation of a resolved request into a single join query, and its execution.
//!
//! Compilation binds every projection, filter and ordering to a concrete `(alias, column)` pair
//! on the join tree, checks operator/type compatibility, and lowers relationship edges into join
//! clauses. All of this happens before any storage round trip, so every error the compiler can
//! produce is detected without side effects. Execution then runs the whole tree as one statement
//! and folds the row stream into a [`ResultGraph`].

use super::{
    super::db::{
        Boolean, Column, Connection, Direction as SqlDirection, JoinClause, JoinKind, OrderClause,
        Row as _, Select as _, SelectColumn, SelectExt, TableRef, WhereClause,
    },
    lower_value,
    resolve::JoinTree,
    shape::{Assembler, NodeLayout, ResultGraph},
    storage_error,
};
use crate::access::VisibilityTable;
use crate::error::Error;
use crate::rest::uri::{Direction, FieldRef, FilterOp, Request};
use crate::schema::{Field, JoinKeys, Resource, Schema};
use futures::StreamExt;

/// The join tree of a request plus its validated projection, filter and ordering clauses, each
/// resolved to a concrete alias.
#[derive(Clone, Debug)]
pub struct CompiledQuery {
    tree: JoinTree,
    columns: Vec<SelectColumn<'static>>,
    layout: Vec<NodeLayout>,
    joins: Vec<JoinClause<'static>>,
    filters: Vec<WhereClause<'static>>,
    orders: Vec<OrderClause<'static>>,
    limit: Option<u64>,
}

impl CompiledQuery {
    /// The resolved join tree behind this query.
    pub fn tree(&self) -> &JoinTree {
        &self.tree
    }
}

/// Bind the projections and filters of `request` onto a resolved (and access-pruned) join tree.
pub fn compile(
    request: &Request,
    schema: &Schema,
    tree: JoinTree,
    visibility: &VisibilityTable,
    role: &str,
    default_limit: Option<u64>,
) -> Result<CompiledQuery, Error> {
    let binder = Binder {
        schema,
        tree: &tree,
        visibility,
        role,
    };

    // Lower each relationship edge into its join clauses. A direct edge is one join; an edge
    // through a link table is two. Wildcard branches are left joins, so a union branch that
    // matches nothing contributes NULLs instead of eliminating the row.
    let mut joins = vec![];
    for node in tree.nodes() {
        let (Some(parent), Some(name)) = (node.parent, &node.relationship) else {
            continue;
        };
        let parent_node = &tree.nodes()[parent];
        let kind = if node.optional {
            JoinKind::Left
        } else {
            JoinKind::Inner
        };
        // The resolver built this edge from the schema, so it is still there.
        let relationship = schema
            .relationship_from(&parent_node.resource, name)
            .unwrap();
        let source = schema.resource(relationship.source()).unwrap();
        let target = schema.resource(relationship.target()).unwrap();

        match relationship.keys() {
            JoinKeys::Direct {
                source_column,
                target_column,
            } => joins.push(JoinClause {
                kind,
                table: node.resource.clone().into(),
                alias: node.alias.clone().into(),
                lhs: Column::qualified(parent_node.alias.clone(), source_column.clone()),
                op: "=".into(),
                rhs: Column::qualified(node.alias.clone(), target_column.clone()),
            }),
            JoinKeys::Via {
                table,
                source_column,
                target_column,
            } => {
                let link_alias = format!("{}_ln", node.alias);
                joins.push(JoinClause {
                    kind,
                    table: table.clone().into(),
                    alias: link_alias.clone().into(),
                    lhs: Column::qualified(parent_node.alias.clone(), source.identity().to_string()),
                    op: "=".into(),
                    rhs: Column::qualified(link_alias.clone(), source_column.clone()),
                });
                joins.push(JoinClause {
                    kind,
                    table: node.resource.clone().into(),
                    alias: node.alias.clone().into(),
                    lhs: Column::qualified(link_alias, target_column.clone()),
                    op: "=".into(),
                    rhs: Column::qualified(node.alias.clone(), target.identity().to_string()),
                });
            }
        }
    }

    // Filters from the query string. A resource occurring at several nodes is constrained at its
    // first occurrence, which is the shallowest node in traversal order.
    let mut filters: Vec<WhereClause<'static>> = vec![];
    for filter in &request.filters {
        let (resource, field, nodes) = binder.bind(&filter.field)?;
        if (filter.op.requires_orderable() && !field.ty().orderable())
            || (filter.op.requires_text() && !field.ty().textual())
        {
            return Err(Error::InvalidFilterOperator {
                resource: resource.name().into(),
                field: field.name().into(),
                operator: filter.op.to_string(),
            });
        }

        let column = Column::qualified(
            tree.nodes()[nodes[0]].alias.clone(),
            field.name().to_string(),
        );
        let clause = match filter.op {
            FilterOp::In => {
                let mut params = vec![];
                if !filter.value.is_empty() {
                    for element in filter.value.split(',') {
                        params.push(lower_value(resource, field, element)?);
                    }
                }
                Boolean::OneOf { column, params }
            }
            op => Boolean::Cmp {
                column,
                op: comparison_op(op).into(),
                param: lower_value(resource, field, &filter.value)?,
            },
        };
        filters.push(clause.into());
    }

    // Identity constraints picked up from the path.
    for node in tree.nodes() {
        let Some(id) = &node.identity else { continue };
        let resource = schema.resource(&node.resource).unwrap();
        let field = resource.identity_field();
        filters.push(
            Boolean::Cmp {
                column: Column::qualified(node.alias.clone(), field.name().to_string()),
                op: "=".into(),
                param: lower_value(resource, field, id)?,
            }
            .into(),
        );
    }

    // Work out which fields each node contributes. An absent projection means every field of
    // every node the role can see; explicit projections are validated and fail loudly.
    let mut node_fields: Vec<Vec<String>> = vec![vec![]; tree.nodes().len()];
    if request.projection.is_empty() {
        for (i, node) in tree.nodes().iter().enumerate() {
            let resource = schema.resource(&node.resource).unwrap();
            node_fields[i] = resource
                .fields()
                .iter()
                .filter(|f| visibility.is_visible(role, &node.resource, f.name()))
                .map(|f| f.name().to_string())
                .collect();
        }
    } else {
        for projection in &request.projection {
            let (_, field, nodes) = binder.bind(projection)?;
            for node in nodes {
                let fields = &mut node_fields[node];
                if !fields.iter().any(|f| f == field.name()) {
                    fields.push(field.name().to_string());
                }
            }
        }
    }

    // Every node selects its identity (the result graph is keyed by it), then its fields.
    let mut columns = vec![];
    let mut layout = vec![];
    for (i, node) in tree.nodes().iter().enumerate() {
        let resource = schema.resource(&node.resource).unwrap();
        let identity_column = columns.len();
        columns.push(SelectColumn::Column(Column::qualified(
            node.alias.clone(),
            resource.identity().to_string(),
        )));

        let mut fields = vec![];
        for name in &node_fields[i] {
            if name == resource.identity() {
                fields.push((name.clone(), identity_column));
                continue;
            }
            fields.push((name.clone(), columns.len()));
            columns.push(SelectColumn::Column(Column::qualified(
                node.alias.clone(),
                name.clone(),
            )));
        }
        layout.push(NodeLayout {
            resource: node.resource.clone(),
            parent: node.parent,
            relationship: node.relationship.clone(),
            identity_column,
            fields,
        });
    }

    // Orderings bind like projections; a resource at several nodes sorts by its first occurrence.
    let mut orders = vec![];
    for ordering in &request.order {
        let (_, field, nodes) = binder.bind(&ordering.field)?;
        let alias = tree.nodes()[nodes[0]].alias.clone();
        orders.push(OrderClause {
            column: Column::qualified(alias, field.name().to_string()),
            direction: match ordering.direction {
                Direction::Asc => SqlDirection::Asc,
                Direction::Desc => SqlDirection::Desc,
            },
        });
    }

    let limit = request.limit.or(default_limit);

    Ok(CompiledQuery {
        tree,
        columns,
        layout,
        joins,
        filters,
        orders,
        limit,
    })
}

/// Execute a compiled query as a single join statement and shape the rows into a graph.
///
/// Rows are folded into the graph as they stream in; memory is bounded by the number of distinct
/// entities and edges, not the number of joined rows.
pub async fn execute<C: Connection>(conn: &C, query: &CompiledQuery) -> Result<ResultGraph, Error> {
    let root = query.tree.root();
    let mut select = conn
        .select(
            &query.columns,
            TableRef::aliased(root.resource.clone(), root.alias.clone()),
        )
        .clauses(query.joins.iter().cloned())
        .clauses(query.filters.iter().cloned());
    for order in &query.orders {
        select = select.order(order.clone());
    }
    if let Some(limit) = query.limit {
        select = select.limit(limit);
    }

    let mut assembler = Assembler::new(&query.layout);
    let mut rows = select.stream();
    while let Some(row) = rows.next().await {
        let row = row.map_err(storage_error)?;
        let values = (0..query.columns.len())
            .map(|column| row.column(column))
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_error)?;
        assembler.add_row(&values);
    }
    Ok(assembler.finish())
}

/// Binds explicit field references against the schema, the visibility table and the join tree.
struct Binder<'a> {
    schema: &'a Schema,
    tree: &'a JoinTree,
    visibility: &'a VisibilityTable,
    role: &'a str,
}

impl<'a> Binder<'a> {
    /// Bind a field reference to the join-tree nodes of its resource.
    ///
    /// Checks run in a fixed order: the field must exist in the schema, must be visible to the
    /// role, and its resource must occur on the join tree. A field that exists but is forbidden is
    /// [`AccessDenied`](Error::AccessDenied); everything else is [`UnknownField`](Error::UnknownField).
    fn bind(&self, field: &FieldRef) -> Result<(&'a Resource, &'a Field, Vec<usize>), Error> {
        let unknown = || Error::UnknownField {
            resource: field.resource.clone(),
            field: field.field.clone(),
        };
        let resource = self.schema.resource(&field.resource).ok_or_else(unknown)?;
        let bound = resource.field(&field.field).ok_or_else(unknown)?;
        if !self
            .visibility
            .is_visible(self.role, resource.name(), bound.name())
        {
            // An explicit request for forbidden data is an error, unlike implicit traversal
            // through a forbidden resource, which merely prunes.
            return Err(Error::AccessDenied {
                role: self.role.into(),
                resource: field.to_string(),
            });
        }
        let nodes = self.tree.nodes_for(resource.name());
        if nodes.is_empty() {
            return Err(unknown());
        }
        Ok((resource, bound, nodes))
    }
}

/// The SQL comparison operator a filter operator lowers to.
fn comparison_op(op: FilterOp) -> &'static str {
    match op {
        FilterOp::Eq => "=",
        FilterOp::Ne => "!=",
        FilterOp::Lt => "<",
        FilterOp::Le => "<=",
        FilterOp::Gt => ">",
        FilterOp::Ge => ">=",
        FilterOp::Like => "LIKE",
        // `in` lowers to a membership predicate, not a comparison.
        FilterOp::In => unreachable!("in filters lower to OneOf"),
    }
}

#[cfg(test)]
mod test {
    use super::super::super::db::mock;
    use super::super::{register, resolve::resolve};
    use super::*;
    use crate::access::{self, VisibilityTable};
    use crate::init_logging;
    use crate::rest::uri;
    use crate::schema::test::calendar;
    use crate::sql::db::{Insert as _, Value};
    use serde_json::json;

    async fn fixture() -> (Schema, mock::Connection) {
        let schema = calendar();
        let db = mock::Connection::create();
        register::execute(&db, &schema).await.unwrap();

        db.insert("tag", ["name", "color", "parent_id"])
            .rows([
                vec![Value::from("billiards"), Value::from("green"), Value::Null],
                vec![Value::from("reading"), Value::from("blue"), Value::Int8(1)],
            ])
            .execute()
            .await
            .unwrap();
        db.insert("event", ["summary", "description", "time"])
            .rows([
                vec![
                    Value::from("pool night"),
                    Value::from("bring your own cue"),
                    Value::from("1999-05-01T20:00:00"),
                ],
                vec![
                    Value::from("club meeting"),
                    Value::from(""),
                    Value::from("2001-06-01T18:00:00"),
                ],
                vec![
                    Value::from("quiet evening"),
                    Value::from(""),
                    Value::from("1999-01-01T19:00:00"),
                ],
            ])
            .execute()
            .await
            .unwrap();
        db.insert("nn_event_tag", ["event_id", "tag_id"])
            .rows([
                vec![Value::Int8(1), Value::Int8(1)],
                vec![Value::Int8(2), Value::Int8(1)],
                vec![Value::Int8(3), Value::Int8(2)],
            ])
            .execute()
            .await
            .unwrap();

        (schema, db)
    }

    async fn run(
        schema: &Schema,
        db: &mock::Connection,
        visibility: &VisibilityTable,
        role: &str,
        uri_str: &str,
    ) -> Result<ResultGraph, Error> {
        let request = uri::decode(uri_str, schema)?;
        let tree = resolve(&request, schema, 4)?;
        let tree = access::prune(&tree, visibility, role)?;
        let compiled = compile(&request, schema, tree, visibility, role, None)?;
        execute(db, &compiled).await
    }

    #[async_std::test]
    async fn test_wildcard_projection_and_filters() {
        init_logging();
        let (schema, db) = fixture().await;
        let visibility = VisibilityTable::permissive(&schema);

        // Any relationship two levels deep, projecting three fields, filtered on both ends.
        let graph = run(
            &schema,
            &db,
            &visibility,
            "anyone",
            "/event/+/+/event.time,event.summary,tag.color\
             ?event.time.lt=2000-01-01&tag.name.like=%25bill%25",
        )
        .await
        .unwrap();

        let event = graph
            .records
            .iter()
            .find(|r| r.resource == "event")
            .unwrap();
        assert_eq!(event.id, json!(1));
        assert_eq!(event.fields.get("summary"), Some(&json!("pool night")));
        assert_eq!(
            event.fields.get("time"),
            Some(&json!("1999-05-01T20:00:00"))
        );
        // Projected fields only.
        assert_eq!(event.fields.get("description"), None);

        let tag = graph.records.iter().find(|r| r.resource == "tag").unwrap();
        assert_eq!(tag.id, json!(1));
        assert_eq!(tag.fields.get("color"), Some(&json!("green")));
        assert_eq!(tag.fields.get("name"), None);

        // The second wildcard level walks back out through the shared tag, so the other event on
        // that tag is part of the union; the third event fails the filters on the root.
        let event_ids = graph
            .records
            .iter()
            .filter(|r| r.resource == "event")
            .map(|r| r.id.clone())
            .collect::<Vec<_>>();
        assert_eq!(event_ids, [json!(1), json!(2)]);
        assert_eq!(
            tag.links
                .iter()
                .map(|link| link.id.clone())
                .collect::<Vec<_>>(),
            [json!(1), json!(2)]
        );
    }

    #[async_std::test]
    async fn test_deduplicates_entity_reached_twice() {
        init_logging();
        let (schema, db) = fixture().await;
        let visibility = VisibilityTable::permissive(&schema);

        // Tag 1 is attached to events 1 and 2, so it is reached through two joined rows.
        let graph = run(&schema, &db, &visibility, "anyone", "/tag/1/event")
            .await
            .unwrap();
        assert_eq!(
            graph
                .records
                .iter()
                .filter(|r| r.resource == "tag")
                .count(),
            1
        );
        let tag = &graph.records[0];
        assert_eq!(
            tag.links
                .iter()
                .map(|link| link.id.clone())
                .collect::<Vec<_>>(),
            [json!(1), json!(2)]
        );
    }

    #[async_std::test]
    async fn test_identity_and_in_filters() {
        init_logging();
        let (schema, db) = fixture().await;
        let visibility = VisibilityTable::permissive(&schema);

        let graph = run(
            &schema,
            &db,
            &visibility,
            "anyone",
            "/event?event.id.in=1,3",
        )
        .await
        .unwrap();
        assert_eq!(
            graph.records.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
            [json!(1), json!(3)]
        );

        let graph = run(&schema, &db, &visibility, "anyone", "/event/2")
            .await
            .unwrap();
        assert_eq!(graph.records.len(), 1);
        assert_eq!(graph.records[0].id, json!(2));
    }

    #[async_std::test]
    async fn test_order_and_limit() {
        init_logging();
        let (schema, db) = fixture().await;
        let visibility = VisibilityTable::permissive(&schema);

        let graph = run(
            &schema,
            &db,
            &visibility,
            "anyone",
            "/event?_order=event.time.desc&_limit=2",
        )
        .await
        .unwrap();
        assert_eq!(
            graph.records.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
            [json!(2), json!(1)]
        );
    }

    #[async_std::test]
    async fn test_unknown_fields() {
        init_logging();
        let (schema, db) = fixture().await;
        let visibility = VisibilityTable::permissive(&schema);

        assert_eq!(
            run(&schema, &db, &visibility, "anyone", "/event?event.wages.gt=1")
                .await
                .unwrap_err(),
            Error::UnknownField {
                resource: "event".into(),
                field: "wages".into()
            }
        );

        // The field exists, but its resource is not on this request's path.
        assert_eq!(
            run(&schema, &db, &visibility, "anyone", "/event?type.name=x")
                .await
                .unwrap_err(),
            Error::UnknownField {
                resource: "type".into(),
                field: "name".into()
            }
        );
    }

    #[async_std::test]
    async fn test_operator_type_mismatch() {
        init_logging();
        let (schema, db) = fixture().await;
        let visibility = VisibilityTable::permissive(&schema);

        assert_eq!(
            run(&schema, &db, &visibility, "anyone", "/event?event.id.like=%25x%25")
                .await
                .unwrap_err(),
            Error::InvalidFilterOperator {
                resource: "event".into(),
                field: "id".into(),
                operator: "like".into()
            }
        );
        // Timestamps order but are not text.
        assert_eq!(
            run(&schema, &db, &visibility, "anyone", "/event?event.time.like=%251999%25")
                .await
                .unwrap_err(),
            Error::InvalidFilterOperator {
                resource: "event".into(),
                field: "time".into(),
                operator: "like".into()
            }
        );
    }

    #[async_std::test]
    async fn test_explicit_request_for_forbidden_field() {
        init_logging();
        let (schema, db) = fixture().await;
        let visibility = VisibilityTable::builder(&schema)
            .allow("user", "event", ["*"])
            .allow("user", "tag", ["id", "name"])
            .build()
            .unwrap();

        assert_eq!(
            run(&schema, &db, &visibility, "user", "/event/tag/tag.color")
                .await
                .unwrap_err(),
            Error::AccessDenied {
                role: "user".into(),
                resource: "tag.color".into()
            }
        );
        assert_eq!(
            run(&schema, &db, &visibility, "user", "/event/tag?tag.color=green")
                .await
                .unwrap_err(),
            Error::AccessDenied {
                role: "user".into(),
                resource: "tag.color".into()
            }
        );
    }

    #[async_std::test]
    async fn test_default_projection_respects_visibility() {
        init_logging();
        let (schema, db) = fixture().await;
        let visibility = VisibilityTable::builder(&schema)
            .allow("user", "event", ["id", "summary"])
            .allow("user", "tag", ["id", "name"])
            .build()
            .unwrap();

        let graph = run(&schema, &db, &visibility, "user", "/event/1/tag")
            .await
            .unwrap();
        let event = graph
            .records
            .iter()
            .find(|r| r.resource == "event")
            .unwrap();
        assert_eq!(
            event.fields.keys().collect::<Vec<_>>(),
            ["id", "summary"]
        );
        let tag = graph.records.iter().find(|r| r.resource == "tag").unwrap();
        assert_eq!(tag.fields.keys().collect::<Vec<_>>(), ["id", "name"]);
    }

    #[async_std::test]
    async fn test_hostile_filter_value_is_literal_data() {
        init_logging();
        let (schema, db) = fixture().await;
        let visibility = VisibilityTable::permissive(&schema);

        let hostile = "'; DROP TABLE event;--";
        db.insert("event", ["summary", "description", "time"])
            .rows([vec![
                Value::from(hostile),
                Value::from(""),
                Value::from("2020-01-01T00:00:00"),
            ]])
            .execute()
            .await
            .unwrap();

        // The hostile value matches only as literal text.
        let graph = run(
            &schema,
            &db,
            &visibility,
            "anyone",
            "/event?event.summary=%27%3B%20DROP%20TABLE%20event%3B--",
        )
        .await
        .unwrap();
        assert_eq!(graph.records.len(), 1);
        assert_eq!(graph.records[0].fields.get("summary"), Some(&json!(hostile)));

        // And the table is still there.
        let graph = run(&schema, &db, &visibility, "anyone", "/event")
            .await
            .unwrap();
        assert_eq!(graph.records.len(), 4);
    }
}
