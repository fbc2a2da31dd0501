//! Resolution of a decoded request's path into a join tree.
//!
//! Concrete relationship segments select a fixed edge out of the current resource. Wildcard
//! segments fan out into a parallel branch per outgoing relationship, in declaration order, so the
//! result is a union over relationship choices rather than a single path. A run of `k` consecutive
//! wildcards descends up to `k` levels; branches that run out of relationships earlier are kept.
//!
//! The schema graph may contain cycles, so two mechanisms bound the traversal: a request may not
//! ask for more consecutive wildcard levels than the configured maximum, and a wildcard never
//! re-expands a `(resource, relationship)` pair already used earlier in the same branch. The same
//! resource may still appear several times in a tree when reached over distinct paths.

use crate::error::Error;
use crate::rest::uri::{Request, Segment};
use crate::schema::Schema;

/// One node of a join tree: a resource reached over a relationship, under a query-unique alias.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinNode {
    /// The resource at this node.
    pub resource: String,
    /// The alias the resource's table goes by in the compiled query.
    pub alias: String,
    /// The node this one was reached from, `None` for the root.
    pub parent: Option<usize>,
    /// The relationship this node was reached over, `None` for the root.
    pub relationship: Option<String>,
    /// An identity literal from the path constraining this node.
    pub identity: Option<String>,
    /// Whether this node came from wildcard expansion.
    ///
    /// Wildcard branches are unions of possibilities, so they must not eliminate rows that lack
    /// them; the compiler turns optional edges into left joins.
    pub optional: bool,
}

/// The resolved join structure of a request: which resources it touches and how they connect.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JoinTree {
    nodes: Vec<JoinNode>,
}

impl JoinTree {
    pub(crate) fn from_nodes(nodes: Vec<JoinNode>) -> Self {
        Self { nodes }
    }

    /// The nodes of the tree. The first node is the root; every node's parent precedes it.
    pub fn nodes(&self) -> &[JoinNode] {
        &self.nodes
    }

    /// The root node.
    pub fn root(&self) -> &JoinNode {
        &self.nodes[0]
    }

    /// Indices of the nodes holding `resource`, in traversal order.
    pub fn nodes_for(&self, resource: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.resource == resource)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Resolve the path of `request` against `schema`.
pub fn resolve(request: &Request, schema: &Schema, max_depth: usize) -> Result<JoinTree, Error> {
    // The depth bound is a property of the request text alone: the longest run of consecutive
    // wildcards is the deepest any branch can descend.
    let mut run = 0;
    for segment in &request.segments {
        match segment {
            Segment::Wildcard => {
                run += 1;
                if run > max_depth {
                    return Err(Error::DepthExceeded { max: max_depth });
                }
            }
            _ => run = 0,
        }
    }

    let mut resolver = Resolver {
        schema,
        failure: None,
    };
    let mut root = Branch {
        resource: request.resource.clone(),
        relationship: None,
        identity: None,
        optional: false,
        children: vec![],
    };
    if !resolver.grow(&mut root, &request.segments, &[]) {
        let (resource, segment) = resolver
            .failure
            .unwrap_or_else(|| (request.resource.clone(), "+".into()));
        return Err(Error::UnresolvableRelationship { resource, segment });
    }

    let mut tree = JoinTree::default();
    flatten(root, None, &mut tree.nodes);
    Ok(tree)
}

/// A branch of the tree while it is being grown.
struct Branch {
    resource: String,
    relationship: Option<String>,
    identity: Option<String>,
    optional: bool,
    children: Vec<Branch>,
}

struct Resolver<'a> {
    schema: &'a Schema,
    /// Where a concrete segment first failed to resolve, for error reporting.
    failure: Option<(String, String)>,
}

impl<'a> Resolver<'a> {
    /// Consume `segments` from the tip of `branch`, growing children as needed.
    ///
    /// Returns whether the remaining path could be consumed along at least one descent from this
    /// branch. `visited` holds the `(resource, relationship)` pairs used on the way here.
    fn grow(
        &mut self,
        branch: &mut Branch,
        segments: &[Segment],
        visited: &[(String, String)],
    ) -> bool {
        let Some(segment) = segments.first() else { return true; };
        let rest = &segments[1..];

        match segment {
            Segment::Identity(id) => {
                branch.identity = Some(id.clone());
                self.grow(branch, rest, visited)
            }
            Segment::Relation(name) => {
                let Some(relationship) = self.schema.relationship_from(&branch.resource, name)
                else {
                    if self.failure.is_none() {
                        self.failure = Some((branch.resource.clone(), name.clone()));
                    }
                    return false;
                };

                let mut child = Branch {
                    resource: relationship.target().into(),
                    relationship: Some(relationship.name().into()),
                    identity: None,
                    optional: false,
                    children: vec![],
                };
                let mut visited = visited.to_vec();
                visited.push((branch.resource.clone(), relationship.name().into()));
                if self.grow(&mut child, rest, &visited) {
                    branch.children.push(child);
                    true
                } else {
                    false
                }
            }
            Segment::Wildcard => {
                let relationships = self
                    .schema
                    .relationships_from(&branch.resource)
                    .map(|r| (r.name().to_string(), r.target().to_string()))
                    .collect::<Vec<_>>();

                let mut any = false;
                for (name, target) in relationships {
                    let pair = (branch.resource.clone(), name.clone());
                    if visited.contains(&pair) {
                        // This edge was already traversed on the way here. Cutting the branch
                        // keeps cyclic schemas from expanding forever.
                        continue;
                    }

                    let mut child = Branch {
                        resource: target,
                        relationship: Some(name),
                        identity: None,
                        optional: true,
                        children: vec![],
                    };
                    let mut visited = visited.to_vec();
                    visited.push(pair);
                    if self.grow(&mut child, rest, &visited) {
                        branch.children.push(child);
                        any = true;
                    }
                }

                // A branch that cannot descend any further still satisfies a path whose remainder
                // is nothing but deeper wildcard levels.
                any || rest_is_optional(rest)
            }
        }
    }
}

/// Whether a path remainder consists only of wildcards, making descent optional.
fn rest_is_optional(segments: &[Segment]) -> bool {
    segments
        .iter()
        .all(|segment| matches!(segment, Segment::Wildcard))
}

/// Flatten a grown branch into the node list, assigning aliases in depth-first order.
fn flatten(branch: Branch, parent: Option<usize>, nodes: &mut Vec<JoinNode>) {
    let index = nodes.len();
    nodes.push(JoinNode {
        alias: format!("{}_{index}", branch.resource),
        resource: branch.resource,
        parent,
        relationship: branch.relationship,
        identity: branch.identity,
        optional: branch.optional,
    });
    for child in branch.children {
        flatten(child, Some(index), nodes);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rest::uri;
    use crate::schema::test::calendar;

    fn resolve_uri(uri_str: &str, max_depth: usize) -> Result<JoinTree, Error> {
        let schema = calendar();
        let request = uri::decode(uri_str, &schema)?;
        resolve(&request, &schema, max_depth)
    }

    /// A compact rendering of the tree for assertions: `(parent index, resource, relationship)`.
    fn shape(tree: &JoinTree) -> Vec<(Option<usize>, String, Option<String>)> {
        tree.nodes()
            .iter()
            .map(|node| {
                (
                    node.parent,
                    node.resource.clone(),
                    node.relationship.clone(),
                )
            })
            .collect()
    }

    #[test]
    fn test_resolve_bare_resource() {
        let tree = resolve_uri("/event", 4).unwrap();
        assert_eq!(shape(&tree), [(None, "event".into(), None)]);
        assert_eq!(tree.root().alias, "event_0");
    }

    #[test]
    fn test_resolve_concrete_path_with_identity() {
        let tree = resolve_uri("/event/12/tag", 4).unwrap();
        assert_eq!(
            shape(&tree),
            [
                (None, "event".into(), None),
                (Some(0), "tag".into(), Some("tag".into())),
            ]
        );
        assert_eq!(tree.root().identity.as_deref(), Some("12"));
        assert_eq!(tree.nodes()[1].alias, "tag_1");
    }

    #[test]
    fn test_resolve_wildcard_in_declaration_order() {
        let tree = resolve_uri("/event/+", 4).unwrap();
        assert_eq!(
            shape(&tree),
            [
                (None, "event".into(), None),
                (Some(0), "type".into(), Some("type".into())),
                (Some(0), "tag".into(), Some("tag".into())),
            ]
        );
    }

    #[test]
    fn test_resolve_wildcard_keeps_short_branches() {
        // `type` has no outgoing relationships, but one wildcard level is enough to include it
        // when the remainder of the path is wildcards only.
        let tree = resolve_uri("/event/+/+", 4).unwrap();
        assert_eq!(
            shape(&tree),
            [
                (None, "event".into(), None),
                (Some(0), "type".into(), Some("type".into())),
                (Some(0), "tag".into(), Some("tag".into())),
                (Some(2), "event".into(), Some("event".into())),
                (Some(2), "tag".into(), Some("parent".into())),
            ]
        );

        // The same resource appears twice, under distinct aliases.
        assert_eq!(tree.nodes_for("event"), [0, 3]);
        assert_eq!(tree.nodes()[3].alias, "event_3");
    }

    #[test]
    fn test_resolve_prunes_revisited_edges() {
        // At depth three, the tag -> event branch may not re-expand the (event, tag) edge it
        // arrived through, but may still reach (event, type).
        let tree = resolve_uri("/event/+/+/+", 4).unwrap();
        let shapes = shape(&tree);
        // event -> tag -> event -> tag would revisit (event, tag); it must not be present.
        let tag_event = shapes
            .iter()
            .position(|(parent, resource, _)| {
                *parent == Some(2) && resource == "event"
            })
            .unwrap();
        assert!(
            !shapes
                .iter()
                .any(|(parent, _, relationship)| *parent == Some(tag_event)
                    && relationship.as_deref() == Some("tag")),
            "revisited (event, tag) edge was not pruned: {shapes:?}"
        );
        assert!(
            shapes
                .iter()
                .any(|(parent, _, relationship)| *parent == Some(tag_event)
                    && relationship.as_deref() == Some("type")),
            "distinct (event, type) edge should survive: {shapes:?}"
        );
    }

    #[test]
    fn test_resolve_terminates_on_cyclic_schema() {
        // tag -> parent -> tag is a self-cycle; a full-depth wildcard walk still terminates.
        let tree = resolve_uri("/tag/+/+/+/+", 4).unwrap();
        assert!(tree.nodes().len() < 64);
    }

    #[test]
    fn test_resolve_depth_limit() {
        assert_eq!(
            resolve_uri("/event/+/+/+", 2).unwrap_err(),
            Error::DepthExceeded { max: 2 }
        );
        // Non-consecutive wildcards do not add up.
        resolve_uri("/event/+/event/+", 2).unwrap();
        // At the limit is fine.
        resolve_uri("/event/+/+", 2).unwrap();
    }

    #[test]
    fn test_resolve_unresolvable_relationship() {
        assert_eq!(
            resolve_uri("/event/parent", 4).unwrap_err(),
            Error::UnresolvableRelationship {
                resource: "event".into(),
                segment: "parent".into()
            }
        );
    }

    #[test]
    fn test_resolve_concrete_after_wildcard_drops_dead_branches() {
        // Only tags have parents, so the type branch cannot satisfy the trailing segment and is
        // dropped rather than joined dangling.
        let tree = resolve_uri("/event/+/parent", 4).unwrap();
        assert_eq!(
            shape(&tree),
            [
                (None, "event".into(), None),
                (Some(0), "tag".into(), Some("tag".into())),
                (Some(1), "tag".into(), Some("parent".into())),
            ]
        );
    }

    #[test]
    fn test_resolve_marks_wildcard_branches_optional() {
        let tree = resolve_uri("/event/+/event", 4).unwrap();
        let optional = tree
            .nodes()
            .iter()
            .map(|node| node.optional)
            .collect::<Vec<_>>();
        // Root and the concrete trailing segment are required; the wildcard level is not.
        assert_eq!(optional, [false, true, false]);
    }

    #[test]
    fn test_resolve_explicit_repeat_is_allowed() {
        // An explicit path may walk the same edge twice; only wildcard expansion prunes repeats.
        let tree = resolve_uri("/tag/parent/parent", 4).unwrap();
        assert_eq!(
            shape(&tree),
            [
                (None, "tag".into(), None),
                (Some(0), "tag".into(), Some("parent".into())),
                (Some(1), "tag".into(), Some("parent".into())),
            ]
        );
    }

    #[test]
    fn test_resolve_identity_after_wildcard_lands_on_every_branch() {
        let tree = resolve_uri("/event/+/7", 4).unwrap();
        for node in &tree.nodes()[1..] {
            assert_eq!(node.identity.as_deref(), Some("7"));
        }
    }
}
