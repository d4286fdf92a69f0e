//! Codegen error types.

use thiserror::Error;

/// Errors that can occur while compiling a policy to WASM.
///
/// Every variant aborts compilation; no partial module is returned.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// A call names a function that is neither planned, native nor declared.
    #[error("illegal function reference: {0}")]
    IllegalFunctionReference(String),

    /// A statement kind has no codegen rule.
    #[error("illegal statement: {0}")]
    IllegalStatement(String),

    /// A binary module could not be read back.
    #[error("WASM decode failed: {0}")]
    Decode(String),

    /// The generated WASM module failed validation.
    #[error("WASM validation failed: {0}")]
    ValidationFailed(String),

    /// An internal consistency check failed.
    #[error("internal codegen error: {0}")]
    Internal(String),

    /// The external optimizer ran but did not produce a usable module.
    #[error("optimizer failed: {0}")]
    Optimizer(String),

    /// Too many arguments, locals or other entities for the target ABI.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
}

impl From<wasmparser::BinaryReaderError> for CodegenError {
    fn from(err: wasmparser::BinaryReaderError) -> Self {
        CodegenError::Decode(err.to_string())
    }
}

/// Codegen result type alias.
pub type CodegenResult<T> = Result<T, CodegenError>;
