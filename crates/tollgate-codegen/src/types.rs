//! ABI constants shared by the compiler, the host-runtime module and the VM.
//!
//! # Linear memory layout
//!
//! ```text
//! 0 .. 2048          bootstrap region (host scratch, never a valid value address)
//! 2048 .. end        policy string constants, NUL-terminated, then builtin and
//!                    entrypoint names, then runtime error messages
//! align8(end) ..     bump-allocated heap (`opa_heap_ptr` global)
//! ```
//!
//! # Evaluation context
//!
//! `opa_eval_ctx_new` allocates a 16-byte record:
//!
//! | Offset | Field      |
//! |--------|------------|
//! | 0      | input      |
//! | 4      | data       |
//! | 8      | result set |
//! | 12     | entrypoint |

// ── ABI version ──────────────────────────────────────────────────────────────

pub const ABI_VERSION: i32 = 1;
/// Minor version 2 adds the one-shot `opa_eval` export.
pub const ABI_MINOR_VERSION: i32 = 2;
pub const ABI_VERSION_GLOBAL: &str = "opa_wasm_abi_version";
pub const ABI_MINOR_VERSION_GLOBAL: &str = "opa_wasm_abi_minor_version";
/// The lowest minor version that carries `opa_eval`.
pub const ONE_SHOT_MINOR_VERSION: i32 = 2;

// ── Memory ───────────────────────────────────────────────────────────────────

/// Address of the first policy string constant.
pub const STRING_BASE: u32 = 2048;
/// Minimum pages the host must provide for the imported memory.
pub const MEMORY_MIN_PAGES: u64 = 2;
pub const WASM_PAGE_SIZE: u32 = 65536;
/// Exported name of the bump-allocator global.
pub const HEAP_PTR_GLOBAL: &str = "opa_heap_ptr";
pub const HOST_MODULE: &str = "env";
pub const MEMORY_IMPORT: &str = "memory";

// ── Evaluation context ───────────────────────────────────────────────────────

pub const CTX_SIZE: i32 = 16;
pub const CTX_INPUT: u64 = 0;
pub const CTX_DATA: u64 = 4;
pub const CTX_RESULT: u64 = 8;
pub const CTX_ENTRYPOINT: u64 = 12;

// ── Value types (as returned by `opa_value_type`) ────────────────────────────

pub const TYPE_NULL: i32 = 1;
pub const TYPE_BOOLEAN: i32 = 2;
pub const TYPE_NUMBER: i32 = 3;
pub const TYPE_STRING: i32 = 4;
pub const TYPE_ARRAY: i32 = 5;
pub const TYPE_OBJECT: i32 = 6;
pub const TYPE_SET: i32 = 7;

// ── Exports ──────────────────────────────────────────────────────────────────

pub const EXPORT_EVAL: &str = "eval";
pub const EXPORT_ONE_SHOT_EVAL: &str = "opa_eval";
pub const EXPORT_BUILTINS: &str = "builtins";
pub const EXPORT_ENTRYPOINTS: &str = "entrypoints";

// ── Runtime error messages ───────────────────────────────────────────────────

pub const ERR_VAR_ASSIGN_CONFLICT: &str = "var assignment conflict";
pub const ERR_OBJECT_INSERT_CONFLICT: &str = "object insert conflict";
pub const ERR_ILLEGAL_ENTRYPOINT: &str = "internal: illegal entrypoint id";

/// Laid out after the policy strings, in this order.
pub const ERROR_MESSAGES: [&str; 3] = [
    ERR_VAR_ASSIGN_CONFLICT,
    ERR_OBJECT_INSERT_CONFLICT,
    ERR_ILLEGAL_ENTRYPOINT,
];

/// Round up to the next multiple of 8.
pub const fn align8(addr: u32) -> u32 {
    (addr + 7) & !7
}
