//! Assembly of joined rows into a deduplicated result graph.
//!
//! A join query returns one row per combination of matched entities, so the same entity shows up
//! once per combination it participates in. The assembler folds that stream back into a graph:
//! one record per `(resource, identity)` pair, in first-encounter order, with the relationship
//! edges from every row it appeared in merged together. Cyclic relationship graphs come out as
//! records linking to one another, which is what graph-drawing consumers want.

use super::super::db::Value;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// The response payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ResultGraph {
    /// The included records, in first-encounter order.
    pub records: Vec<Record>,
}

/// One entity in a [`ResultGraph`], tagged with its resource and identity.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Record {
    /// The resource this record belongs to.
    pub resource: String,
    /// The identity of the record within its resource.
    pub id: serde_json::Value,
    /// The projected field values.
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// Relationship edges to other records included in the graph.
    pub links: Vec<Link>,
}

/// A relationship edge between two records of a [`ResultGraph`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Link {
    /// The relationship traversed.
    pub relationship: String,
    /// The resource of the record the edge points at.
    pub resource: String,
    /// The identity of the record the edge points at.
    pub id: serde_json::Value,
}

/// How one join-tree node maps onto the columns of an executed query.
#[derive(Clone, Debug)]
pub(crate) struct NodeLayout {
    /// The resource at this node.
    pub resource: String,
    /// Position of the parent node in the layout, `None` for the root.
    pub parent: Option<usize>,
    /// The relationship this node was reached over, `None` for the root.
    pub relationship: Option<String>,
    /// The column holding this node's identity.
    pub identity_column: usize,
    /// The projected fields of this node, as (field name, column) pairs.
    pub fields: Vec<(String, usize)>,
}

/// Folds rows into a [`ResultGraph`], one row at a time.
pub(crate) struct Assembler<'a> {
    layout: &'a [NodeLayout],
    index: HashMap<(String, String), usize>,
    records: Vec<Record>,
    links_seen: HashSet<(usize, String, usize)>,
}

impl<'a> Assembler<'a> {
    pub fn new(layout: &'a [NodeLayout]) -> Self {
        Self {
            layout,
            index: HashMap::new(),
            records: vec![],
            links_seen: HashSet::new(),
        }
    }

    /// Merge one row of the joined query into the graph.
    ///
    /// `values` holds one [`Value`] per select column, in select order.
    pub fn add_row(&mut self, values: &[Value]) {
        // Upsert the record behind each node of the row, remembering where it landed.
        let mut row_records = Vec::with_capacity(self.layout.len());
        for node in self.layout {
            let id = &values[node.identity_column];
            if matches!(id, Value::Null) {
                row_records.push(None);
                continue;
            }

            let key = (node.resource.clone(), id.to_string());
            let index = match self.index.get(&key) {
                Some(index) => *index,
                None => {
                    let index = self.records.len();
                    self.records.push(Record {
                        resource: node.resource.clone(),
                        id: value_to_json(id),
                        fields: Default::default(),
                        links: vec![],
                    });
                    self.index.insert(key, index);
                    index
                }
            };

            let record = &mut self.records[index];
            for (name, column) in &node.fields {
                if !record.fields.contains_key(name) {
                    record
                        .fields
                        .insert(name.clone(), value_to_json(&values[*column]));
                }
            }
            row_records.push(Some(index));
        }

        // Record the relationship edges present in this row, once each.
        for (position, node) in self.layout.iter().enumerate() {
            let (Some(parent), Some(relationship)) = (node.parent, &node.relationship) else {
                continue;
            };
            let (Some(parent_record), Some(child_record)) =
                (row_records[parent], row_records[position])
            else {
                continue;
            };
            if self
                .links_seen
                .insert((parent_record, relationship.clone(), child_record))
            {
                let link = Link {
                    relationship: relationship.clone(),
                    resource: self.records[child_record].resource.clone(),
                    id: self.records[child_record].id.clone(),
                };
                self.records[parent_record].links.push(link);
            }
        }
    }

    pub fn finish(self) -> ResultGraph {
        ResultGraph {
            records: self.records,
        }
    }
}

/// Lower a storage value into its JSON representation.
pub(crate) fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Int4(n) => serde_json::Value::Number((*n).into()),
        Value::Int8(n) => serde_json::Value::Number((*n).into()),
        Value::Bool(b) => serde_json::Value::Bool(*b),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn layout() -> Vec<NodeLayout> {
        vec![
            NodeLayout {
                resource: "event".into(),
                parent: None,
                relationship: None,
                identity_column: 0,
                fields: vec![("summary".into(), 1)],
            },
            NodeLayout {
                resource: "tag".into(),
                parent: Some(0),
                relationship: Some("tag".into()),
                identity_column: 2,
                fields: vec![("name".into(), 3)],
            },
        ]
    }

    #[test]
    fn test_entities_deduplicate_and_edges_merge() {
        let layout = layout();
        let mut assembler = Assembler::new(&layout);

        // The same event joined against two different tags, then one tag repeated.
        assembler.add_row(&[
            Value::Int8(1),
            Value::from("party"),
            Value::Int8(10),
            Value::from("fun"),
        ]);
        assembler.add_row(&[
            Value::Int8(1),
            Value::from("party"),
            Value::Int8(11),
            Value::from("loud"),
        ]);
        assembler.add_row(&[
            Value::Int8(1),
            Value::from("party"),
            Value::Int8(10),
            Value::from("fun"),
        ]);

        let graph = assembler.finish();
        assert_eq!(graph.records.len(), 3);

        let event = &graph.records[0];
        assert_eq!(event.resource, "event");
        assert_eq!(event.id, json!(1));
        assert_eq!(event.fields.get("summary"), Some(&json!("party")));
        assert_eq!(
            event
                .links
                .iter()
                .map(|link| (link.relationship.as_str(), link.id.clone()))
                .collect::<Vec<_>>(),
            [("tag", json!(10)), ("tag", json!(11))]
        );

        assert_eq!(graph.records[1].resource, "tag");
        assert!(graph.records[1].links.is_empty());
    }

    #[test]
    fn test_null_branch_is_skipped() {
        let layout = layout();
        let mut assembler = Assembler::new(&layout);
        assembler.add_row(&[
            Value::Int8(1),
            Value::from("party"),
            Value::Null,
            Value::Null,
        ]);

        let graph = assembler.finish();
        assert_eq!(graph.records.len(), 1);
        assert!(graph.records[0].links.is_empty());
    }

    #[test]
    fn test_serialization_shape() {
        let layout = layout();
        let mut assembler = Assembler::new(&layout);
        assembler.add_row(&[
            Value::Int8(1),
            Value::from("party"),
            Value::Int8(10),
            Value::from("fun"),
        ]);

        let json = serde_json::to_value(assembler.finish()).unwrap();
        assert_eq!(
            json,
            json!({
                "records": [
                    {
                        "resource": "event",
                        "id": 1,
                        "fields": {"summary": "party"},
                        "links": [{"relationship": "tag", "resource": "tag", "id": 10}],
                    },
                    {
                        "resource": "tag",
                        "id": 10,
                        "fields": {"name": "fun"},
                        "links": [],
                    },
                ]
            })
        );
    }
}
