use thiserror::Error;

use crate::format::DataFormat;

#[derive(Error, Debug)]
pub enum Error {
    /// Dangling reference, out-of-order node, duplicate name or unknown output.
    #[error("malformed graph: {0}")]
    MalformedGraph(String),
    #[error("unsupported {op} in node '{node}': {reason}")]
    UnsupportedOperator {
        node: String,
        op: String,
        reason: String,
    },
    #[error("invalid attribute '{name}' on node '{node}': {reason}")]
    InvalidAttribute {
        node: String,
        name: String,
        reason: String,
    },
    /// A lowering rule consumed a tensor in the wrong layout. Always a bug in
    /// the rule, never a property of the input graph.
    #[error("layout conflict on tensor '{tensor}': expected {expected}, found {found}")]
    LayoutConflict {
        tensor: String,
        expected: DataFormat,
        found: DataFormat,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
