/*!
 * @file error.rs
 * @brief docpipe error taxonomy
 */

use thiserror::Error;

/// Error taxonomy for the aggregation engine, grouped the way errors are
/// meant to surface to a caller: pipeline shape, operator shape, type/value,
/// and environment (a cross-collection stage used without a collaborator).
#[derive(Error, Debug)]
pub enum DocPipeError {
    #[error("pipeline error: {0}")]
    PipelineShape(String),

    #[error("operator error: {0}")]
    OperatorShape(String),

    #[error("type error: {0}")]
    TypeMismatch(String),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("BSON decode error: {0}")]
    Bson(#[from] bson::de::Error),

    #[error("BSON encode error: {0}")]
    BsonSerialization(#[from] bson::ser::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DocPipeError>;

impl DocPipeError {
    pub fn pipeline(stage: &str, detail: impl std::fmt::Display) -> Self {
        DocPipeError::PipelineShape(format!("{stage}: {detail}"))
    }

    pub fn operator(op: &str, detail: impl std::fmt::Display) -> Self {
        DocPipeError::OperatorShape(format!("{op}: {detail}"))
    }

    pub fn type_error(context: &str, detail: impl std::fmt::Display) -> Self {
        DocPipeError::TypeMismatch(format!("{context}: {detail}"))
    }
}
