//! VM error types.

use thiserror::Error;

/// Errors raised while loading or running a compiled policy.
#[derive(Debug, Error)]
pub enum VmError {
    /// The module could not be parsed, linked or instantiated.
    #[error("instantiation failed: {0}")]
    Instantiate(String),

    /// Guest code called `opa_abort`, e.g. on an assignment conflict.
    #[error("policy aborted: {0}")]
    Abort(String),

    /// A builtin failed or was not allowed to run.
    #[error("builtin error: {0}")]
    Builtin(String),

    /// Guest execution trapped without a recorded cause.
    #[error("trap: {0}")]
    Trap(String),

    /// A data patch was rejected; nothing was applied.
    #[error("data path {path}: {}", data_path_reason(.code))]
    DataPath { path: String, code: i32 },

    /// A patch `test` operation did not match.
    #[error("patch test failed at {path}")]
    PatchTestFailed { path: String },

    /// The module's builtin table names a builtin the host does not provide.
    #[error("unknown builtin: {0}")]
    UnknownBuiltin(String),

    #[error("unknown entrypoint: {0}")]
    UnknownEntrypoint(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Guest memory access failed or ran past the memory limit.
    #[error("heap error: {0}")]
    Heap(String),

    /// The caller cancelled the evaluation.
    #[error("evaluation cancelled")]
    Cancelled,

    #[error("VM pool is closed")]
    PoolClosed,
}

/// Host return codes of `opa_value_add_path` / `opa_value_remove_path`.
pub mod code {
    pub const OK: i32 = 0;
    pub const INVALID_TYPE: i32 = 2;
    pub const INVALID_PATH: i32 = 3;
}

fn data_path_reason(code: &i32) -> &'static str {
    match *code {
        code::INVALID_TYPE => "invalid type",
        code::INVALID_PATH => "invalid path",
        _ => "unknown error",
    }
}

/// VM result type alias.
pub type VmResult<T> = Result<T, VmError>;
