//! Runtime errors

use cascade_ir::NodeKey;
use thiserror::Error;

/// Runtime result type
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("no instance supplied for node: {0}")]
    NodeNotFound(NodeKey),

    #[error("no factory handles node {node} of type {kind}")]
    UnknownNodeType { node: NodeKey, kind: String },

    #[error("node {node} missing config param: {param}")]
    MissingConfig { node: NodeKey, param: String },

    #[error("invalid config for {node}.{param}: {message}")]
    InvalidConfig {
        node: NodeKey,
        param: String,
        message: String,
    },

    #[error("node execution failed: {0}")]
    Execution(String),
}
