// crates/core/src/lib.rs
//! Domain types for the dashstats engine: calendar intervals, bucket
//! truncation/enumeration, and the closed set of aggregation operations.
//!
//! Everything here is pure — no database access. The `db` crate builds
//! SQL around these types.

mod error;
mod interval;
mod operation;

pub use error::CoreError;
pub use interval::{enumerate_buckets, truncate, truncate_ceiling, Interval};
pub use operation::Operation;
