//! The error taxonomy shared by every stage of the request pipeline.
//!
//! Everything before the storage round trip (decoding, resolution, compilation, access checks) is
//! detected without side effects, so those errors are always recoverable locally. Only
//! [`Timeout`](Error::Timeout) and [`Storage`](Error::Storage) can originate after a query has
//! started executing.
//!
//! Each variant carries a stable machine-readable code and an HTTP status for whatever transport
//! sits in front of the service. Storage errors never expose driver text to clients; the detail is
//! logged and the display is generic.

use snafu::Snafu;

/// Errors reported while decoding, compiling or executing a request.
#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The URI does not match the path or query-string grammar.
    #[snafu(display("malformed request: {reason}"))]
    MalformedRequest { reason: String },

    /// A projection, filter or record references a field that does not exist.
    #[snafu(display("unknown field {resource}.{field}"))]
    UnknownField { resource: String, field: String },

    /// A filter operator is not applicable to the type of its field.
    #[snafu(display("operator {operator} cannot be applied to {resource}.{field}"))]
    InvalidFilterOperator {
        resource: String,
        field: String,
        operator: String,
    },

    /// A path segment names a relationship that does not exist from the current resource.
    #[snafu(display("no relationship {segment} from resource {resource}"))]
    UnresolvableRelationship { resource: String, segment: String },

    /// Wildcard traversal asked for more levels than the configured maximum.
    #[snafu(display("wildcard traversal exceeds the maximum depth of {max}"))]
    DepthExceeded { max: usize },

    /// The role may not see an explicitly requested resource or field, or the root resource.
    #[snafu(display("role {role} may not access {resource}"))]
    AccessDenied { role: String, resource: String },

    /// The storage round trip exceeded its deadline.
    #[snafu(display("request timed out"))]
    Timeout,

    /// The storage engine failed. Details are logged, never returned to clients.
    #[snafu(display("storage engine failure"))]
    Storage,
}

impl Error {
    /// The HTTP status a transport layer should map this error to.
    pub fn status(&self) -> u16 {
        match self {
            Self::MalformedRequest { .. } => 400,
            Self::UnknownField { .. } => 400,
            Self::InvalidFilterOperator { .. } => 400,
            Self::UnresolvableRelationship { .. } => 404,
            Self::DepthExceeded { .. } => 400,
            Self::AccessDenied { .. } => 403,
            Self::Timeout => 504,
            Self::Storage => 502,
        }
    }

    /// A stable machine-readable code identifying the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedRequest { .. } => "malformed_request",
            Self::UnknownField { .. } => "unknown_field",
            Self::InvalidFilterOperator { .. } => "invalid_filter_operator",
            Self::UnresolvableRelationship { .. } => "unresolvable_relationship",
            Self::DepthExceeded { .. } => "depth_exceeded",
            Self::AccessDenied { .. } => "access_denied",
            Self::Timeout => "timeout",
            Self::Storage => "storage_failure",
        }
    }

    /// Wrap a grammar violation.
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedRequest {
            reason: reason.into(),
        }
    }

    /// Redact a storage-layer error, logging the detail.
    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        tracing::error!("storage engine error: {err}");
        Self::Storage
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_and_code_are_stable() {
        let cases = [
            (Error::malformed("x"), 400, "malformed_request"),
            (
                Error::UnknownField {
                    resource: "event".into(),
                    field: "nope".into(),
                },
                400,
                "unknown_field",
            ),
            (
                Error::InvalidFilterOperator {
                    resource: "event".into(),
                    field: "time".into(),
                    operator: "like".into(),
                },
                400,
                "invalid_filter_operator",
            ),
            (
                Error::UnresolvableRelationship {
                    resource: "event".into(),
                    segment: "nope".into(),
                },
                404,
                "unresolvable_relationship",
            ),
            (Error::DepthExceeded { max: 4 }, 400, "depth_exceeded"),
            (
                Error::AccessDenied {
                    role: "user".into(),
                    resource: "salary".into(),
                },
                403,
                "access_denied",
            ),
            (Error::Timeout, 504, "timeout"),
            (Error::Storage, 502, "storage_failure"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn test_storage_errors_are_redacted() {
        let err = Error::storage("connection refused by host 10.0.0.1");
        assert_eq!(err.to_string(), "storage engine failure");
    }
}
