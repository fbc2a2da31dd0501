//! Role-based field visibility.
//!
//! Visibility is a declarative table: resource name → role name → set of readable fields. The
//! table is built once, next to the schema, and is queried read-only for the lifetime of the
//! process; per-role lookups are precomputed at build time, so nothing is re-derived per request.
//!
//! Absence is denial: a role with no entry for a resource (directly or through the
//! [`EVERYONE`] pseudo-role) cannot see it at all. For the root resource of a request that is a
//! hard failure; anywhere else in the join tree the invisible branch is dropped silently, so
//! traversal degrades gracefully instead of failing a whole request over one forbidden corner of
//! the graph.

use crate::error::Error;
use crate::schema::Schema;
use crate::sql::ops::resolve::{JoinNode, JoinTree};
use snafu::Snafu;
use std::collections::{HashMap, HashSet};

/// The pseudo-role whose grants apply to every principal.
pub const EVERYONE: &str = "*";

/// Errors reported while building a visibility table.
#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum VisibilityError {
    #[snafu(display("visibility rule references unregistered resource {resource}"))]
    UnknownResource { resource: String },

    #[snafu(display("visibility rule references no field {field} on resource {resource}"))]
    UnknownField { resource: String, field: String },
}

/// The immutable role → visible-fields table.
#[derive(Clone, Debug, Default)]
pub struct VisibilityTable {
    // resource -> role -> fields. Role entries are merged with the EVERYONE grants for the same
    // resource at build time, so a lookup is a plain nested map access.
    grants: HashMap<String, HashMap<String, HashSet<String>>>,
}

impl VisibilityTable {
    /// Start describing a visibility table for `schema`.
    pub fn builder(schema: &Schema) -> VisibilityBuilder {
        VisibilityBuilder {
            schema,
            rules: vec![],
        }
    }

    /// A table where everyone can read every field of every resource.
    ///
    /// This effectively disables authorization; useful for tests and demos.
    pub fn permissive(schema: &Schema) -> Self {
        // The wildcard rule cannot fail validation.
        Self::builder(schema)
            .allow(EVERYONE, "*", ["*"])
            .build()
            .unwrap()
    }

    /// The fields of `resource` readable by `role`, or [`None`] if the role has no visibility
    /// into the resource at all.
    pub fn visible_fields(&self, role: &str, resource: &str) -> Option<&HashSet<String>> {
        let roles = self.grants.get(resource)?;
        roles.get(role).or_else(|| roles.get(EVERYONE))
    }

    /// Whether `role` may read `resource.field`.
    pub fn is_visible(&self, role: &str, resource: &str, field: &str) -> bool {
        self.visible_fields(role, resource)
            .map(|fields| fields.contains(field))
            .unwrap_or(false)
    }
}

/// Builder for a [`VisibilityTable`].
pub struct VisibilityBuilder<'a> {
    schema: &'a Schema,
    rules: Vec<(String, String, Vec<String>)>,
}

impl<'a> VisibilityBuilder<'a> {
    /// Grant `role` read access to the given fields of `resource`.
    ///
    /// `"*"` as the resource applies the rule to every resource; `"*"` among the fields grants
    /// every field of the resource. Grants are additive across calls.
    pub fn allow<I, F>(mut self, role: impl Into<String>, resource: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        self.rules.push((
            role.into(),
            resource.into(),
            fields.into_iter().map(|f| f.into()).collect(),
        ));
        self
    }

    /// Validate the rules and freeze them into a [`VisibilityTable`].
    pub fn build(self) -> Result<VisibilityTable, VisibilityError> {
        let mut table = VisibilityTable::default();

        for (role, resource, fields) in self.rules {
            let resources = if resource == "*" {
                self.schema.resources().collect::<Vec<_>>()
            } else {
                vec![self.schema.resource(&resource).ok_or_else(|| {
                    VisibilityError::UnknownResource {
                        resource: resource.clone(),
                    }
                })?]
            };

            for res in resources {
                let mut expanded = HashSet::new();
                for field in &fields {
                    if field == "*" {
                        expanded.extend(res.fields().iter().map(|f| f.name().to_string()));
                    } else {
                        if res.field(field).is_none() {
                            return Err(VisibilityError::UnknownField {
                                resource: res.name().into(),
                                field: field.clone(),
                            });
                        }
                        expanded.insert(field.clone());
                    }
                }
                table
                    .grants
                    .entry(res.name().into())
                    .or_default()
                    .entry(role.clone())
                    .or_default()
                    .extend(expanded);
            }
        }

        // Fold the EVERYONE grants into every named role so lookups need no per-request merging.
        for roles in table.grants.values_mut() {
            if let Some(everyone) = roles.get(EVERYONE).cloned() {
                for (role, fields) in roles.iter_mut() {
                    if role != EVERYONE {
                        fields.extend(everyone.iter().cloned());
                    }
                }
            }
        }

        Ok(table)
    }
}

/// Apply `role`'s visibility to a join tree.
///
/// Fails closed if the root resource is not visible to the role. Invisible non-root nodes are
/// dropped together with their descendants, silently.
pub fn prune(tree: &JoinTree, table: &VisibilityTable, role: &str) -> Result<JoinTree, Error> {
    let root = tree.root();
    if table.visible_fields(role, &root.resource).is_none() {
        return Err(Error::AccessDenied {
            role: role.into(),
            resource: root.resource.clone(),
        });
    }

    let mut remap: Vec<Option<usize>> = vec![None; tree.nodes().len()];
    let mut nodes: Vec<JoinNode> = vec![];
    for (index, node) in tree.nodes().iter().enumerate() {
        // Nodes are in depth-first order, so a dropped parent is seen before its descendants.
        let parent = match node.parent {
            None => None,
            Some(parent) => match remap[parent] {
                None => continue,
                remapped => remapped,
            },
        };
        if index > 0 && table.visible_fields(role, &node.resource).is_none() {
            tracing::debug!(
                resource = %node.resource,
                role,
                "dropping join branch not visible to role"
            );
            continue;
        }
        remap[index] = Some(nodes.len());
        nodes.push(JoinNode {
            parent,
            ..node.clone()
        });
    }

    Ok(JoinTree::from_nodes(nodes))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rest::uri;
    use crate::schema::test::calendar;
    use crate::sql::ops::resolve::resolve;

    fn table(schema: &Schema) -> VisibilityTable {
        VisibilityTable::builder(schema)
            .allow("admin", "*", ["*"])
            .allow("user", "event", ["*"])
            .allow("user", "tag", ["id", "name"])
            .allow(EVERYONE, "type", ["id", "name"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_visible_fields() {
        let schema = calendar();
        let table = table(&schema);

        assert!(table.is_visible("admin", "tag", "color"));
        assert!(table.is_visible("user", "tag", "name"));
        assert!(!table.is_visible("user", "tag", "color"));

        // Roles with no entry of their own inherit the EVERYONE grants.
        assert!(table.is_visible("user", "type", "name"));
        assert!(table.is_visible("stranger", "type", "name"));

        // Absence of any entry means no visibility at all.
        assert_eq!(table.visible_fields("stranger", "event"), None);
    }

    #[test]
    fn test_everyone_grants_merge_into_named_roles() {
        let schema = calendar();
        let table = VisibilityTable::builder(&schema)
            .allow(EVERYONE, "event", ["id"])
            .allow("user", "event", ["summary"])
            .build()
            .unwrap();
        let fields = table.visible_fields("user", "event").unwrap();
        assert!(fields.contains("id") && fields.contains("summary"));
    }

    #[test]
    fn test_build_rejects_unknown_names() {
        let schema = calendar();
        assert_eq!(
            VisibilityTable::builder(&schema)
                .allow("user", "salary", ["*"])
                .build()
                .unwrap_err(),
            VisibilityError::UnknownResource {
                resource: "salary".into()
            }
        );
        assert_eq!(
            VisibilityTable::builder(&schema)
                .allow("user", "event", ["wages"])
                .build()
                .unwrap_err(),
            VisibilityError::UnknownField {
                resource: "event".into(),
                field: "wages".into()
            }
        );
    }

    #[test]
    fn test_prune_fails_closed_on_root() {
        let schema = calendar();
        let table = table(&schema);
        let request = uri::decode("/tag", &schema).unwrap();
        let tree = resolve(&request, &schema, 4).unwrap();

        assert_eq!(
            prune(&tree, &table, "stranger").unwrap_err(),
            Error::AccessDenied {
                role: "stranger".into(),
                resource: "tag".into()
            }
        );
    }

    #[test]
    fn test_prune_drops_invisible_branches_silently() {
        let schema = calendar();
        // user cannot see `type`, so the type branch of a wildcard disappears but the request
        // still succeeds.
        let table = table(&schema);
        let request = uri::decode("/event/+", &schema).unwrap();
        let tree = resolve(&request, &schema, 4).unwrap();

        let pruned = prune(&tree, &table, "user").unwrap();
        let resources = pruned
            .nodes()
            .iter()
            .map(|node| node.resource.as_str())
            .collect::<Vec<_>>();
        assert_eq!(resources, ["event", "tag"]);
        // Aliases keep their pre-pruning names.
        assert_eq!(pruned.nodes()[1].alias, "tag_2");

        // The admin sees the whole fan-out.
        assert_eq!(prune(&tree, &table, "admin").unwrap(), tree);
    }

    #[test]
    fn test_prune_drops_descendants_of_invisible_nodes() {
        let schema = calendar();
        let table = VisibilityTable::builder(&schema)
            .allow("user", "event", ["*"])
            .allow("user", "type", ["*"])
            .build()
            .unwrap();
        // event -> tag -> event: the middle node is invisible, so the deeper (visible) event node
        // must go with it.
        let request = uri::decode("/event/tag/event", &schema).unwrap();
        let tree = resolve(&request, &schema, 4).unwrap();
        let pruned = prune(&tree, &table, "user").unwrap();
        assert_eq!(pruned.nodes().len(), 1);
        assert_eq!(pruned.root().resource, "event");
    }
}
