//! Decoding and encoding of the request URI grammar.
//!
//! This is a central part of the engine: it defines the interface between the shape of a URI and
//! the join query that gets generated. The grammar is:
//!
//! ```text
//! /<resource>[/<segment>...][/<projection>]?[<filter>&...][&_order=...][&_limit=N]
//! ```
//!
//! where
//!
//! * `<resource>` is the root resource name;
//! * each `<segment>` is a relationship name to traverse, the wildcard `+` (traverse every
//!   relationship from the current resource, one level per `+`), or an identity value filtering
//!   the resource introduced by the preceding segment;
//! * `<projection>`, if present as the final segment, is a comma-separated list of
//!   `resource.field` tokens; absent, every visible field of every resource on the path is
//!   returned;
//! * each `<filter>` is `resource.field.operator=value` with operators `eq` (the default when
//!   omitted), `ne`, `lt`, `le`, `gt`, `ge`, `like` (SQL `%` wildcards) and `in`
//!   (comma-separated values);
//! * `_order` is `resource.field.asc` or `resource.field.desc`, repeatable;
//! * `_limit` caps the number of joined rows.
//!
//! Decoding is a single left-to-right pass with no backtracking: the first segment or parameter
//! that does not match the grammar fails the whole request. The schema is consulted only to
//! validate that literal names exist at all; whether a name is valid at its position in the path
//! is the resolver's job.

use crate::error::Error;
use crate::schema::Schema;
use derive_more::Display;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Serialize;

/// Characters escaped when a decoded value is re-encoded into a URI component.
const COMPONENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b',')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'=')
    .add(b'?');

/// A decoded request, the unit of work handed to the resolver.
///
/// One of these exists per call; it is produced here, consumed by the resolver and compiler, and
/// discarded once the response is built.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Request {
    /// The root resource of the path.
    pub resource: String,
    /// The path segments after the root, in order.
    pub segments: Vec<Segment>,
    /// Requested fields; empty means every visible field of every resource on the path.
    pub projection: Vec<FieldRef>,
    /// Filter predicates from the query string.
    pub filters: Vec<Filter>,
    /// Result ordering, applied left to right.
    pub order: Vec<Ordering>,
    /// Maximum number of joined rows to return.
    pub limit: Option<u64>,
}

/// One path segment after the root resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    /// Traverse the named relationship from the current resource.
    Relation(String),
    /// Traverse every relationship from the current resource, one level.
    Wildcard,
    /// Filter the current resource by identity.
    Identity(String),
}

/// A field reference qualified by its resource name.
#[derive(Clone, Debug, Display, PartialEq, Eq, Serialize)]
#[display(fmt = "{resource}.{field}")]
pub struct FieldRef {
    pub resource: String,
    pub field: String,
}

impl FieldRef {
    pub fn new(resource: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            field: field.into(),
        }
    }
}

/// A filter comparison operator.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    #[display(fmt = "eq")]
    Eq,
    #[display(fmt = "ne")]
    Ne,
    #[display(fmt = "lt")]
    Lt,
    #[display(fmt = "le")]
    Le,
    #[display(fmt = "gt")]
    Gt,
    #[display(fmt = "ge")]
    Ge,
    #[display(fmt = "like")]
    Like,
    #[display(fmt = "in")]
    In,
}

impl FilterOp {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "lt" => Some(Self::Lt),
            "le" => Some(Self::Le),
            "gt" => Some(Self::Gt),
            "ge" => Some(Self::Ge),
            "like" => Some(Self::Like),
            "in" => Some(Self::In),
            _ => None,
        }
    }

    /// Whether the operator requires a type that supports ordering comparisons.
    pub fn requires_orderable(&self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Gt | Self::Ge)
    }

    /// Whether the operator requires a text-typed field.
    pub fn requires_text(&self) -> bool {
        matches!(self, Self::Like)
    }
}

/// A single filter predicate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Filter {
    pub field: FieldRef,
    pub op: FilterOp,
    /// The raw (percent-decoded) value; typed coercion happens at compile time.
    pub value: String,
}

/// Sort direction.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[display(fmt = "asc")]
    Asc,
    #[display(fmt = "desc")]
    Desc,
}

/// One `_order` criterion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Ordering {
    pub field: FieldRef,
    pub direction: Direction,
}

/// Decode a URI into a [`Request`].
///
/// Pure: no side effects, and the schema is used only to check that literal names exist.
pub fn decode(uri: &str, schema: &Schema) -> Result<Request, Error> {
    let (path, query) = uri.split_once('?').unwrap_or((uri, ""));

    let raw_segments = path
        .trim_matches('/')
        .split('/')
        .collect::<Vec<_>>();
    if raw_segments.iter().any(|s| s.is_empty()) {
        return Err(Error::malformed(format!("empty path segment in '{path}'")));
    }

    let mut segments = raw_segments
        .iter()
        .map(|s| decode_component(s))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter();

    let resource = segments
        .next()
        .ok_or_else(|| Error::malformed("path names no resource"))?;
    if schema.resource(&resource).is_none() {
        return Err(Error::malformed(format!("unknown resource '{resource}'")));
    }

    let mut request = Request {
        resource,
        ..Default::default()
    };

    let trailing = segments.len();
    for (left, segment) in segments.enumerate() {
        let last = left + 1 == trailing;
        if segment == "+" {
            request.segments.push(Segment::Wildcard);
        } else if segment.chars().all(|c| c.is_ascii_digit()) {
            if matches!(request.segments.last(), Some(Segment::Identity(_))) {
                return Err(Error::malformed(format!(
                    "consecutive identity segments at '{segment}'"
                )));
            }
            request.segments.push(Segment::Identity(segment));
        } else if last && segment.contains('.') {
            for token in segment.split(',') {
                request.projection.push(parse_field_ref(token)?);
            }
        } else if schema.is_known_name(&segment) {
            request.segments.push(Segment::Relation(segment));
        } else {
            return Err(Error::malformed(format!("unknown name '{segment}'")));
        }
    }

    if !query.is_empty() {
        for parameter in query.split('&') {
            let (key, value) = parameter.split_once('=').unwrap_or((parameter, ""));
            let key = decode_component(key)?;
            let value = decode_component(value)?;

            match key.as_str() {
                "" => return Err(Error::malformed("empty query parameter")),
                "_limit" => {
                    request.limit = Some(value.parse().map_err(|_| {
                        Error::malformed(format!("invalid limit '{value}'"))
                    })?);
                }
                "_order" => {
                    request.order.push(parse_ordering(&value)?);
                }
                _ => {
                    let (field, op) = parse_filter_key(&key)?;
                    request.filters.push(Filter { field, op, value });
                }
            }
        }
    }

    Ok(request)
}

/// Encode a [`Request`] back into its canonical URI.
///
/// Decoding the result yields a request equal to the input; the text may differ from whatever the
/// request was originally decoded from (operators are always spelled out, values re-escaped).
pub fn encode(request: &Request) -> String {
    let mut path = vec![encode_component(&request.resource)];
    for segment in &request.segments {
        path.push(match segment {
            Segment::Relation(name) => encode_component(name),
            Segment::Wildcard => "+".into(),
            Segment::Identity(id) => encode_component(id),
        });
    }
    if !request.projection.is_empty() {
        path.push(
            request
                .projection
                .iter()
                .map(|f| format!("{}.{}", encode_component(&f.resource), encode_component(&f.field)))
                .collect::<Vec<_>>()
                .join(","),
        );
    }

    let mut query = request
        .filters
        .iter()
        .map(|f| {
            format!(
                "{}.{}.{}={}",
                encode_component(&f.field.resource),
                encode_component(&f.field.field),
                f.op,
                encode_component(&f.value)
            )
        })
        .collect::<Vec<_>>();
    for order in &request.order {
        query.push(format!(
            "_order={}.{}.{}",
            encode_component(&order.field.resource),
            encode_component(&order.field.field),
            order.direction
        ));
    }
    if let Some(limit) = request.limit {
        query.push(format!("_limit={limit}"));
    }

    let path = format!("/{}", path.join("/"));
    if query.is_empty() {
        path
    } else {
        format!("{path}?{}", query.join("&"))
    }
}

fn decode_component(raw: &str) -> Result<String, Error> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| Error::malformed(format!("invalid percent-encoding in '{raw}'")))
}

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

/// Parse a `resource.field` token.
fn parse_field_ref(token: &str) -> Result<FieldRef, Error> {
    match token.split('.').collect::<Vec<_>>()[..] {
        [resource, field] if !resource.is_empty() && !field.is_empty() => {
            Ok(FieldRef::new(resource, field))
        }
        _ => Err(Error::malformed(format!(
            "field reference '{token}' must be resource.field"
        ))),
    }
}

/// Parse a filter key, `resource.field` or `resource.field.operator`.
fn parse_filter_key(key: &str) -> Result<(FieldRef, FilterOp), Error> {
    match key.split('.').collect::<Vec<_>>()[..] {
        [resource, field] if !resource.is_empty() && !field.is_empty() => {
            Ok((FieldRef::new(resource, field), FilterOp::Eq))
        }
        [resource, field, op] if !resource.is_empty() && !field.is_empty() => {
            let op = FilterOp::parse(op)
                .ok_or_else(|| Error::malformed(format!("unrecognized operator '{op}'")))?;
            Ok((FieldRef::new(resource, field), op))
        }
        _ => Err(Error::malformed(format!(
            "filter '{key}' must be resource.field.operator"
        ))),
    }
}

/// Parse an `_order` value, `resource.field` or `resource.field.direction`.
fn parse_ordering(value: &str) -> Result<Ordering, Error> {
    let (token, direction) = match value.split('.').collect::<Vec<_>>()[..] {
        [resource, field] => ((resource, field), Direction::Asc),
        [resource, field, "asc"] => ((resource, field), Direction::Asc),
        [resource, field, "desc"] => ((resource, field), Direction::Desc),
        [_, _, direction] => {
            return Err(Error::malformed(format!(
                "invalid sort direction '{direction}'"
            )))
        }
        _ => {
            return Err(Error::malformed(format!(
                "ordering '{value}' must be resource.field.direction"
            )))
        }
    };
    if token.0.is_empty() || token.1.is_empty() {
        return Err(Error::malformed(format!(
            "ordering '{value}' must be resource.field.direction"
        )));
    }
    Ok(Ordering {
        field: FieldRef::new(token.0, token.1),
        direction,
    })
}
