//! IR loading errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IrError {
    #[error("invalid IR JSON: {0}")]
    Json(#[from] serde_json::Error),
}
