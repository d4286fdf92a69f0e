//! The prebuilt host-runtime module every policy is compiled into.
//!
//! It fixes the ABI surface before any policy code exists:
//!
//! - imports `env.memory` and every extern in [`abi::EXTERNS`];
//! - defines the bump-allocator global, exported as `opa_heap_ptr`;
//! - defines and exports the evaluation-context helpers and
//!   `opa_heap_ptr_get` / `opa_heap_ptr_set`;
//! - names every function, which is how the compiler resolves externs.
//!
//! The module is built once per process and handed out as encoded bytes, so
//! the compiler reads it exactly as it would read a runtime shipped on disk.

use std::sync::OnceLock;

use wasm_encoder::ValType;

use crate::abi::{self, Extern};
use crate::instr::{Body, Instr};
use crate::module::{Code, FuncType, Global, Import, ImportKind, Module};
use crate::types::*;

/// Index of the heap-pointer global inside the runtime module.
pub const GLOBAL_HEAP_PTR: u32 = 0;

/// Encoded runtime module.
pub fn bytes() -> &'static [u8] {
    static BYTES: OnceLock<Vec<u8>> = OnceLock::new();
    BYTES.get_or_init(|| build().encode())
}

/// Build the runtime module model.
pub fn build() -> Module {
    let mut m = Module::new();

    m.imports.push(Import {
        module: HOST_MODULE.to_string(),
        name: MEMORY_IMPORT.to_string(),
        kind: ImportKind::Memory {
            minimum: MEMORY_MIN_PAGES,
            maximum: None,
        },
    });
    for ext in abi::EXTERNS {
        import_extern(&mut m, ext);
    }

    let heap = m.add_global(Global {
        mutable: true,
        init: STRING_BASE as i32,
    });
    m.export_global(HEAP_PTR_GLOBAL, heap);

    let malloc = extern_index(abi::OPA_MALLOC);

    define(
        &mut m,
        abi::OPA_EVAL_CTX_NEW,
        FuncType::new(vec![], vec![ValType::I32]),
        emit_eval_ctx_new(malloc),
    );
    define(
        &mut m,
        abi::OPA_EVAL_CTX_SET_INPUT,
        FuncType::new(vec![ValType::I32; 2], vec![]),
        emit_ctx_store(CTX_INPUT),
    );
    define(
        &mut m,
        abi::OPA_EVAL_CTX_SET_DATA,
        FuncType::new(vec![ValType::I32; 2], vec![]),
        emit_ctx_store(CTX_DATA),
    );
    define(
        &mut m,
        abi::OPA_EVAL_CTX_SET_ENTRYPOINT,
        FuncType::new(vec![ValType::I32; 2], vec![]),
        emit_ctx_store(CTX_ENTRYPOINT),
    );
    define(
        &mut m,
        abi::OPA_EVAL_CTX_GET_RESULT,
        FuncType::i32s(1),
        Body::new(
            vec![],
            vec![Instr::LocalGet(0), Instr::I32Load { offset: CTX_RESULT }],
        ),
    );
    define(
        &mut m,
        abi::OPA_HEAP_PTR_GET,
        FuncType::new(vec![], vec![ValType::I32]),
        Body::new(vec![], vec![Instr::GlobalGet(GLOBAL_HEAP_PTR)]),
    );
    define(
        &mut m,
        abi::OPA_HEAP_PTR_SET,
        FuncType::new(vec![ValType::I32], vec![]),
        Body::new(
            vec![],
            vec![Instr::LocalGet(0), Instr::GlobalSet(GLOBAL_HEAP_PTR)],
        ),
    );

    m
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn import_extern(m: &mut Module, ext: &Extern) {
    let ty = m.add_type(FuncType::new(ext.params, ext.results));
    let index = m.func_import_count();
    m.imports.push(Import {
        module: HOST_MODULE.to_string(),
        name: ext.name.to_string(),
        kind: ImportKind::Func(ty),
    });
    m.names.insert(index, ext.name.to_string());
}

fn define(m: &mut Module, name: &str, ty: FuncType, body: Body) {
    let index = m.declare_func(name, ty, true);
    let slot = (index - m.func_import_count()) as usize;
    m.code[slot] = Code::Body(body);
}

/// Function index of an extern; function imports follow [`abi::EXTERNS`].
fn extern_index(name: &str) -> u32 {
    abi::EXTERNS
        .iter()
        .position(|e| e.name == name)
        .unwrap_or(abi::EXTERNS.len()) as u32
}

/// `opa_eval_ctx_new() -> ctx`: allocate and zero a context record.
fn emit_eval_ctx_new(malloc: u32) -> Body {
    let ctx = 0;
    let mut instrs = vec![
        Instr::I32Const(CTX_SIZE),
        Instr::Call(malloc),
        Instr::LocalSet(ctx),
    ];
    for offset in [CTX_INPUT, CTX_DATA, CTX_RESULT, CTX_ENTRYPOINT] {
        instrs.extend([
            Instr::LocalGet(ctx),
            Instr::I32Const(0),
            Instr::I32Store { offset },
        ]);
    }
    instrs.push(Instr::LocalGet(ctx));
    Body::new(vec![(1, ValType::I32)], instrs)
}

/// `(ctx, value)`: store `value` into one context field.
fn emit_ctx_store(offset: u64) -> Body {
    Body::new(
        vec![],
        vec![
            Instr::LocalGet(0),
            Instr::LocalGet(1),
            Instr::I32Store { offset },
        ],
    )
}
