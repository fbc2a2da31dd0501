//! Relational REST is a small engine that translates a compact URI grammar into relational join
//! queries. It consists of two sections:
//!
//! * A frontend, which most users will interact with, for describing [schemas](schema) and
//!   decoding [URIs](rest::uri). A [schema](schema::Schema) is a runtime graph of resources and
//!   the relationships between them. The URI grammar lets clients name a path through that graph
//!   (including wildcard traversal of any relationship, several levels deep), select the fields
//!   they want back and attach typed filter predicates.
//! * A [backend](sql), which is responsible for resolving a decoded request against the schema
//!   graph and compiling it into a single join query against a relational database. The backend is
//!   agnostic to the specifics of the application's data model: the same resolver and compiler
//!   serve any schema that can be registered at startup.
//!
//! Between the two sits a role-based [access filter](access): a read-only table of which fields of
//! which resources each role may see, applied to every compiled query before it reaches storage.
//!
//! This crate comes with a PostgreSQL target as well as a mock database, which is useful for
//! lightweight testing. The library is modular, though, so it is possible to implement your own
//! storage target by implementing the [db](sql::db) traits.
//!
//! Every request compiles to at most one query, filter values are always bound as statement
//! parameters (never spliced into query text), and results come back as a graph of records
//! deduplicated by identity, so the same entity reached over two join paths appears once.

use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub mod access;
pub mod error;
pub mod prelude;
pub mod rest;
pub mod schema;
pub mod sql;

pub use error::Error;

/// Initialize tracing.
pub fn init_logging() {
    static ONCE: Once = Once::new();

    ONCE.call_once(|| {
        color_eyre::install().unwrap();
        tracing_subscriber::fmt()
            .with_ansi(true)
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    });
}

/// Tunables for request resolution and execution.
///
/// A [`Config`] is attached to a [`Service`](rest::Service) at construction and is immutable
/// afterwards, like the schema itself.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of consecutive wildcard segments a path may traverse.
    ///
    /// The schema graph may contain cycles, so unbounded wildcard expansion would never
    /// terminate. Paths that ask for more consecutive wildcard levels than this fail with
    /// [`Error::DepthExceeded`].
    pub max_wildcard_depth: usize,
    /// Deadline for the storage round trip of a single request.
    ///
    /// Requests that exceed it fail with [`Error::Timeout`] and the in-flight query is dropped.
    pub query_timeout: Duration,
    /// Row limit applied when a request does not carry its own `_limit`.
    pub default_limit: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_wildcard_depth: 4,
            query_timeout: Duration::from_secs(30),
            default_limit: None,
        }
    }
}
