//! The schema graph: resources, relationships, and how to join across them.
//!
//! A [`Schema`] is built once at startup from a declarative description and is immutable
//! afterwards, which makes it safe to share across request handlers without synchronization. It is
//! a directed graph: resources are nodes, relationships are named edges carrying the join keys
//! needed to traverse them. The graph is allowed to contain cycles (self-referential resources,
//! mutually linked resources); the path resolver deals with those at traversal time.

use derive_more::Display;
use snafu::Snafu;
use std::collections::hash_map::{Entry, HashMap};

/// Errors reported while building a schema.
///
/// These are programming errors in the schema description, not request-time failures, so they have
/// their own type rather than sharing the request [taxonomy](crate::error::Error).
#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum SchemaError {
    #[snafu(display("resource {name} is registered twice"))]
    DuplicateResource { name: String },

    #[snafu(display("resource {resource} declares field {field} twice"))]
    DuplicateField { resource: String, field: String },

    #[snafu(display("resource {resource} has no field {field} to use as identity"))]
    UnknownIdentity { resource: String, field: String },

    #[snafu(display("relationship {relationship} references unregistered resource {resource}"))]
    UnknownResource {
        relationship: String,
        resource: String,
    },

    #[snafu(display("relationship {relationship} references no column {column} on {resource}"))]
    UnknownJoinColumn {
        relationship: String,
        resource: String,
        column: String,
    },

    #[snafu(display("resource {resource} already has an outgoing relationship {relationship}"))]
    DuplicateRelationship {
        resource: String,
        relationship: String,
    },
}

/// The scalar type of a resource field.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// An auto-incrementing integer identity.
    #[display(fmt = "serial")]
    Serial,
    /// A 4-byte signed integer.
    #[display(fmt = "int")]
    Int,
    /// An 8-byte signed integer.
    #[display(fmt = "bigint")]
    BigInt,
    /// A text string.
    #[display(fmt = "text")]
    Text,
    /// A point in time, stored and compared as ISO-8601 text.
    #[display(fmt = "timestamp")]
    Timestamp,
    /// A boolean.
    #[display(fmt = "bool")]
    Bool,
}

impl FieldType {
    /// Whether `<` and `>` comparisons are meaningful for this type.
    pub fn orderable(&self) -> bool {
        !matches!(self, Self::Bool)
    }

    /// Whether `like` pattern matching is meaningful for this type.
    pub fn textual(&self) -> bool {
        matches!(self, Self::Text)
    }
}

/// A field of a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    name: String,
    ty: FieldType,
}

impl Field {
    /// The name of this field.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type of this field.
    pub fn ty(&self) -> FieldType {
        self.ty
    }
}

/// A named entity type backed by a storage table.
#[derive(Clone, Debug)]
pub struct Resource {
    name: String,
    fields: Vec<Field>,
    identity: String,
}

impl Resource {
    /// The name of this resource, which is also the name of its backing table.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fields of this resource, in declaration order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The name of the field identifying rows of this resource.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The identity field itself.
    pub fn identity_field(&self) -> &Field {
        // The builder checked that the identity names a declared field.
        self.field(&self.identity).unwrap()
    }
}

/// How many rows on each side participate in a relationship.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Cardinality {
    #[display(fmt = "one-to-one")]
    OneToOne,
    #[display(fmt = "one-to-many")]
    OneToMany,
    #[display(fmt = "many-to-many")]
    ManyToMany,
}

/// The columns used to traverse a relationship.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinKeys {
    /// The two tables join directly on a pair of columns.
    Direct {
        /// The joining column on the source resource's table.
        source_column: String,
        /// The joining column on the target resource's table.
        target_column: String,
    },
    /// The two tables join through a link table holding identities of both sides.
    Via {
        /// The link table.
        table: String,
        /// The link-table column matching the source resource's identity.
        source_column: String,
        /// The link-table column matching the target resource's identity.
        target_column: String,
    },
}

/// A directed, named edge between two resources.
#[derive(Clone, Debug)]
pub struct Relationship {
    name: String,
    source: String,
    target: String,
    cardinality: Cardinality,
    keys: JoinKeys,
}

impl Relationship {
    /// The name of this relationship, unique among the source resource's outgoing edges.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resource this edge leaves from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The resource this edge points at.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The cardinality of this edge.
    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    /// The join keys used to traverse this edge.
    pub fn keys(&self) -> &JoinKeys {
        &self.keys
    }
}

/// The immutable graph of resources and relationships.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    resources: Vec<Resource>,
    resource_index: HashMap<String, usize>,
    relationships: Vec<Relationship>,
    // Outgoing edge indices per resource, in declaration order. Declaration order is load bearing:
    // it is the tie break for wildcard expansion, so identical requests resolve identically.
    outgoing: HashMap<String, Vec<usize>>,
}

impl Schema {
    /// Start describing a schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Look up a resource by name.
    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resource_index.get(name).map(|i| &self.resources[*i])
    }

    /// All registered resources, in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    /// All registered relationships, in declaration order.
    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.iter()
    }

    /// The outgoing relationships of `resource`, in declaration order.
    pub fn relationships_from<'a>(
        &'a self,
        resource: &str,
    ) -> impl Iterator<Item = &'a Relationship> {
        self.outgoing
            .get(resource)
            .map(|edges| edges.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|i| &self.relationships[*i])
    }

    /// The outgoing relationship of `resource` named `name`, if any.
    pub fn relationship_from(&self, resource: &str, name: &str) -> Option<&Relationship> {
        self.relationships_from(resource).find(|r| r.name == name)
    }

    /// Whether `name` names a registered resource or relationship.
    ///
    /// The URI decoder uses this for early validation of literal path segments; it deliberately
    /// does not imply the name is valid at any particular position in a path.
    pub fn is_known_name(&self, name: &str) -> bool {
        self.resource_index.contains_key(name)
            || self.relationships.iter().any(|r| r.name == name)
    }
}

/// Builder for a [`Schema`].
///
/// Resources must be declared before the relationships that mention them; everything else is
/// validated when [`build`](Self::build) runs.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    resources: Vec<Resource>,
    relationships: Vec<Relationship>,
}

impl SchemaBuilder {
    /// Declare a resource with the given identity field and field set.
    pub fn resource<I, N>(mut self, name: impl Into<String>, identity: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (N, FieldType)>,
        N: Into<String>,
    {
        self.resources.push(Resource {
            name: name.into(),
            identity: identity.into(),
            fields: fields
                .into_iter()
                .map(|(name, ty)| Field {
                    name: name.into(),
                    ty,
                })
                .collect(),
        });
        self
    }

    /// Declare a relationship between two resources.
    pub fn relationship(
        mut self,
        name: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        cardinality: Cardinality,
        keys: JoinKeys,
    ) -> Self {
        self.relationships.push(Relationship {
            name: name.into(),
            source: source.into(),
            target: target.into(),
            cardinality,
            keys,
        });
        self
    }

    /// Validate the description and freeze it into a [`Schema`].
    pub fn build(self) -> Result<Schema, SchemaError> {
        let mut schema = Schema::default();

        for resource in self.resources {
            for (i, field) in resource.fields.iter().enumerate() {
                if resource.fields[..i].iter().any(|f| f.name == field.name) {
                    return Err(SchemaError::DuplicateField {
                        resource: resource.name,
                        field: field.name.clone(),
                    });
                }
            }
            if resource.field(&resource.identity).is_none() {
                return Err(SchemaError::UnknownIdentity {
                    resource: resource.name.clone(),
                    field: resource.identity,
                });
            }
            match schema.resource_index.entry(resource.name.clone()) {
                Entry::Occupied(_) => {
                    return Err(SchemaError::DuplicateResource {
                        name: resource.name,
                    })
                }
                Entry::Vacant(e) => {
                    e.insert(schema.resources.len());
                    schema.outgoing.insert(resource.name.clone(), vec![]);
                    schema.resources.push(resource);
                }
            }
        }

        for relationship in self.relationships {
            let source = schema.resource(&relationship.source).ok_or_else(|| {
                SchemaError::UnknownResource {
                    relationship: relationship.name.clone(),
                    resource: relationship.source.clone(),
                }
            })?;
            let target = schema.resource(&relationship.target).ok_or_else(|| {
                SchemaError::UnknownResource {
                    relationship: relationship.name.clone(),
                    resource: relationship.target.clone(),
                }
            })?;
            if let JoinKeys::Direct {
                source_column,
                target_column,
            } = &relationship.keys
            {
                for (resource, column) in [(source, source_column), (target, target_column)] {
                    if resource.field(column).is_none() {
                        return Err(SchemaError::UnknownJoinColumn {
                            relationship: relationship.name.clone(),
                            resource: resource.name.clone(),
                            column: column.clone(),
                        });
                    }
                }
            }
            if schema
                .relationship_from(&relationship.source, &relationship.name)
                .is_some()
            {
                return Err(SchemaError::DuplicateRelationship {
                    resource: relationship.source,
                    relationship: relationship.name,
                });
            }

            schema
                .outgoing
                .get_mut(&relationship.source)
                .unwrap()
                .push(schema.relationships.len());
            schema.relationships.push(relationship);
        }

        Ok(schema)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// The schema used by tests across the crate: a calendar of events, each linked to any number
    /// of tags and types, with tags forming a self-referential hierarchy.
    pub(crate) fn calendar() -> Schema {
        Schema::builder()
            .resource(
                "event",
                "id",
                [
                    ("id", FieldType::Serial),
                    ("summary", FieldType::Text),
                    ("description", FieldType::Text),
                    ("time", FieldType::Timestamp),
                ],
            )
            .resource(
                "type",
                "id",
                [("id", FieldType::Serial), ("name", FieldType::Text)],
            )
            .resource(
                "tag",
                "id",
                [
                    ("id", FieldType::Serial),
                    ("name", FieldType::Text),
                    ("color", FieldType::Text),
                    ("parent_id", FieldType::BigInt),
                ],
            )
            .relationship(
                "type",
                "event",
                "type",
                Cardinality::ManyToMany,
                JoinKeys::Via {
                    table: "nn_event_type".into(),
                    source_column: "event_id".into(),
                    target_column: "type_id".into(),
                },
            )
            .relationship(
                "tag",
                "event",
                "tag",
                Cardinality::ManyToMany,
                JoinKeys::Via {
                    table: "nn_event_tag".into(),
                    source_column: "event_id".into(),
                    target_column: "tag_id".into(),
                },
            )
            .relationship(
                "event",
                "tag",
                "event",
                Cardinality::ManyToMany,
                JoinKeys::Via {
                    table: "nn_event_tag".into(),
                    source_column: "tag_id".into(),
                    target_column: "event_id".into(),
                },
            )
            .relationship(
                "parent",
                "tag",
                "tag",
                Cardinality::OneToMany,
                JoinKeys::Direct {
                    source_column: "parent_id".into(),
                    target_column: "id".into(),
                },
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_lookup_and_declaration_order() {
        let schema = calendar();
        assert_eq!(schema.resource("event").unwrap().identity(), "id");
        assert!(schema.resource("nope").is_none());

        // Wildcard expansion depends on this order being exactly declaration order.
        let names = schema
            .relationships_from("event")
            .map(|r| r.name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, ["type", "tag"]);

        let rel = schema.relationship_from("tag", "parent").unwrap();
        assert_eq!(rel.target(), "tag");
        assert_eq!(rel.cardinality(), Cardinality::OneToMany);
    }

    #[test]
    fn test_known_names() {
        let schema = calendar();
        assert!(schema.is_known_name("event"));
        assert!(schema.is_known_name("parent"));
        assert!(!schema.is_known_name("salary"));
    }

    #[test]
    fn test_rejects_duplicate_resource() {
        let err = Schema::builder()
            .resource("event", "id", [("id", FieldType::Serial)])
            .resource("event", "id", [("id", FieldType::Serial)])
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::DuplicateResource {
                name: "event".into()
            }
        );
    }

    #[test]
    fn test_rejects_unknown_identity() {
        let err = Schema::builder()
            .resource("event", "uuid", [("id", FieldType::Serial)])
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnknownIdentity {
                resource: "event".into(),
                field: "uuid".into()
            }
        );
    }

    #[test]
    fn test_rejects_dangling_relationship() {
        let err = Schema::builder()
            .resource("event", "id", [("id", FieldType::Serial)])
            .relationship(
                "tag",
                "event",
                "tag",
                Cardinality::ManyToMany,
                JoinKeys::Via {
                    table: "nn_event_tag".into(),
                    source_column: "event_id".into(),
                    target_column: "tag_id".into(),
                },
            )
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnknownResource {
                relationship: "tag".into(),
                resource: "tag".into()
            }
        );
    }

    #[test]
    fn test_rejects_duplicate_outgoing_edge() {
        let keys = JoinKeys::Direct {
            source_column: "parent_id".into(),
            target_column: "id".into(),
        };
        let err = Schema::builder()
            .resource(
                "tag",
                "id",
                [("id", FieldType::Serial), ("parent_id", FieldType::BigInt)],
            )
            .relationship("parent", "tag", "tag", Cardinality::OneToMany, keys.clone())
            .relationship("parent", "tag", "tag", Cardinality::OneToOne, keys)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::DuplicateRelationship {
                resource: "tag".into(),
                relationship: "parent".into()
            }
        );
    }

    #[test]
    fn test_rejects_unknown_join_column() {
        let err = Schema::builder()
            .resource("tag", "id", [("id", FieldType::Serial)])
            .relationship(
                "parent",
                "tag",
                "tag",
                Cardinality::OneToMany,
                JoinKeys::Direct {
                    source_column: "parent_id".into(),
                    target_column: "id".into(),
                },
            )
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnknownJoinColumn {
                relationship: "parent".into(),
                resource: "tag".into(),
                column: "parent_id".into()
            }
        );
    }
}
