//! The request-facing half of the engine: the URI grammar and the service facade.

pub mod service;
pub mod uri;

pub use service::*;
