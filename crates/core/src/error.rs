// crates/core/src/error.rs
use thiserror::Error;

/// Errors from parsing stored configuration strings.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Unknown time interval: {name}")]
    UnknownInterval { name: String },

    #[error("Unknown aggregation operation: {name}")]
    UnknownOperation { name: String },
}
