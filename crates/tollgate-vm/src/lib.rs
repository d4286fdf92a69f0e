//! Tollgate execution VM.
//!
//! Loads a module produced by `tollgate-codegen` into `wasmi`, links the host
//! externs it imports, and evaluates its entrypoints.
//!
//! ```text
//! Vm::load(policy, data)
//!   ├── instantiate       memory + linker + externs
//!   ├── builtins()        dispatch table, unknown names fail the load
//!   ├── entrypoints()     name -> id
//!   └── data              parsed once, between base and eval checkpoints
//!
//! Vm::eval(id, options)   rewind to eval checkpoint, run, read JSON result
//! ```
//!
//! Values live in guest memory; see [`value`] for the cell layout.

pub mod builtins;
pub mod config;
pub mod error;
pub mod externs;
pub mod json;
pub mod patch;
pub mod pool;
pub mod value;
pub mod vm;

pub use builtins::{InterQueryCache, PrintHook};
pub use config::VmConfig;
pub use error::{VmError, VmResult};
pub use patch::PatchOp;
pub use pool::{PooledVm, VmPool};
pub use vm::{EvalOptions, Vm};
