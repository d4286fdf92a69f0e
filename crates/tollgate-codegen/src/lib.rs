//! Tollgate WASM code generator: compiles a policy IR to a `.wasm` binary.
//!
//! # Architecture
//!
//! Compilation starts from a prebuilt host-runtime module ([`runtime`]) that
//! fixes the ABI, then appends the policy: a data segment of string
//! constants, one function per IR function, and the entrypoints.  Unreachable
//! functions are pruned before the module is encoded and validated.
//!
//! ## Imports (`env`)
//! - `memory`, at least two pages
//! - every extern in [`abi::EXTERNS`] that the policy can reach: allocation,
//!   value construction and inspection, JSON parse and dump, the
//!   `opa_builtin{0..4}` dispatchers and the native builtins
//!
//! ## Exports
//! - `eval(ctx) -> 0`: run the plan selected by the context's entrypoint id
//! - `opa_eval(entrypoint, data, input_ptr, input_len, heap_ptr) -> json_ptr`
//! - `builtins() -> object` and `entrypoints() -> object`: name → id tables
//! - `opa_eval_ctx_*`, `opa_heap_ptr_get` / `opa_heap_ptr_set`
//! - globals `opa_heap_ptr`, `opa_wasm_abi_version`,
//!   `opa_wasm_abi_minor_version`
//!
//! ## Values
//!
//! Values live in guest memory and are created and inspected only through
//! externs.  Address `0` is the undefined sentinel: every statement that can
//! fail to produce a value tests for it and leaves its block.

pub mod abi;
pub mod compiler;
pub mod error;
pub mod instr;
pub mod module;
pub mod optimize;
pub mod prune;
pub mod runtime;
pub mod stmt;
pub mod types;

pub use compiler::{compile, compile_module, CompileOptions};
pub use error::{CodegenError, CodegenResult};
pub use module::Module;
pub use optimize::OptimizerConfig;
