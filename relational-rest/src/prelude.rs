//! The imports most users of the engine need.

pub use crate::access::{VisibilityTable, EVERYONE};
pub use crate::error::Error;
pub use crate::rest::uri;
pub use crate::rest::{Decoded, Service};
pub use crate::schema::{Cardinality, FieldType, JoinKeys, Schema};
pub use crate::sql::ops::shape::{Link, Record, ResultGraph};
pub use crate::Config;
