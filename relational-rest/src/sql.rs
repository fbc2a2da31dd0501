//! The storage-facing half of the engine: resolution, compilation and execution of requests
//! against a SQL database.

pub mod db;
pub mod ops;
