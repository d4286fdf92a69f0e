//! Module compiler.
//!
//! Lowers a [`Policy`] onto the prebuilt host-runtime module:
//! 1. `init_module`: decode the runtime, harvest its function names, add the
//!    ABI version globals and declare every IR function plus the exports
//! 2. `compile_strings`: lay out all constants in one data segment at 2048
//! 3. `compile_external_func_decls`: the `builtins()` name → id table
//! 4. `compile_entrypoint_decls`: the `entrypoints()` name → id table
//! 5. `compile_funcs`: one body per IR function
//! 6. `compile_plans`: `eval(ctx)` and the one-shot `opa_eval`
//! 7. prune functions no export reaches
//!
//! [`compile`] then encodes, validates with `wasmparser` and optionally runs
//! the external optimizer.

use std::collections::HashMap;

use serde::Deserialize;
use tollgate_ir::{Local, Policy};
use wasm_encoder::ValType;

use crate::abi;
use crate::error::{CodegenError, CodegenResult};
use crate::instr::{Body, Instr};
use crate::module::{DataSegment, FuncType, Global, Module};
use crate::optimize::OptimizerConfig;
use crate::prune::prune;
use crate::runtime;
use crate::stmt::emit_block;
use crate::types::*;

// ══════════════════════════════════════════════════════════════════════════════
// Public API
// ══════════════════════════════════════════════════════════════════════════════

/// Compiler configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Run the external optimizer after validation.
    pub optimize: bool,
    pub optimizer: OptimizerConfig,
}

/// Compile a policy into a validated `.wasm` binary.
pub fn compile(policy: &Policy, options: &CompileOptions) -> CodegenResult<Vec<u8>> {
    let module = compile_module(policy)?;
    let bytes = validated(module.encode())?;

    if !options.optimize {
        return Ok(bytes);
    }

    #[cfg(feature = "optimize")]
    {
        let optimized = crate::optimize::optimize(module, &options.optimizer)?;
        validated(optimized.encode())
    }
    #[cfg(not(feature = "optimize"))]
    {
        tracing::warn!("optimizer requested but the `optimize` feature is disabled");
        Ok(bytes)
    }
}

/// Compile a policy into the in-memory module model, pruned but not yet
/// validated.
pub fn compile_module(policy: &Policy) -> CodegenResult<Module> {
    let mut compiler = Compiler::new(policy)?;
    compiler.compile()?;
    Ok(compiler.module)
}

fn validated(bytes: Vec<u8>) -> CodegenResult<Vec<u8>> {
    wasmparser::validate(&bytes).map_err(|e| CodegenError::ValidationFailed(format!("{e}")))?;
    Ok(bytes)
}

// ══════════════════════════════════════════════════════════════════════════════
// Compiler
// ══════════════════════════════════════════════════════════════════════════════

/// How a `Call` statement reaches its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Callee {
    /// An IR function or a native builtin extern, called directly.
    Direct(u32),
    /// A builtin dispatched by id through `opa_builtin{N}`.
    Dispatched { id: i32, dispatcher: u32 },
}

/// Builder state threaded through every stage.
pub(crate) struct Compiler<'a> {
    policy: &'a Policy,
    module: Module,
    /// Every named function, runtime and IR, by absolute index.
    funcs: HashMap<String, u32>,
    /// Address of each policy string constant, by string index.
    string_addrs: Vec<u32>,
    /// Non-native builtins in id order.
    external_names: Vec<String>,
    external_ids: HashMap<String, i32>,
    external_name_addrs: Vec<u32>,
    entrypoint_name_addrs: Vec<u32>,
    error_addrs: HashMap<&'static str, u32>,

    // ── Declared export indices ──────────────────────────────────────────
    eval: u32,
    one_shot: u32,
    builtins: u32,
    entrypoints: u32,
}

impl<'a> Compiler<'a> {
    fn new(policy: &'a Policy) -> CodegenResult<Self> {
        let module = Module::decode(runtime::bytes())?;
        let funcs = module
            .names
            .iter()
            .map(|(index, name)| (name.clone(), *index))
            .collect();

        let mut external_names = Vec::new();
        let mut external_ids = HashMap::new();
        for decl in &policy.static_.builtin_funcs {
            if abi::native_builtin(&decl.name).is_some() || external_ids.contains_key(&decl.name)
            {
                continue;
            }
            external_ids.insert(decl.name.clone(), external_names.len() as i32);
            external_names.push(decl.name.clone());
        }

        Ok(Self {
            policy,
            module,
            funcs,
            string_addrs: Vec::new(),
            external_names,
            external_ids,
            external_name_addrs: Vec::new(),
            entrypoint_name_addrs: Vec::new(),
            error_addrs: HashMap::new(),
            eval: 0,
            one_shot: 0,
            builtins: 0,
            entrypoints: 0,
        })
    }

    fn compile(&mut self) -> CodegenResult<()> {
        self.init_module()?;
        self.compile_strings();
        self.compile_external_func_decls()?;
        self.compile_entrypoint_decls()?;
        self.compile_funcs()?;
        self.compile_plans()?;
        prune(&mut self.module)?;
        Ok(())
    }

    // ── Stage 1: module skeleton ─────────────────────────────────────────

    fn init_module(&mut self) -> CodegenResult<()> {
        let major = self.module.add_global(Global {
            mutable: false,
            init: ABI_VERSION,
        });
        self.module.export_global(ABI_VERSION_GLOBAL, major);
        let minor = self.module.add_global(Global {
            mutable: false,
            init: ABI_MINOR_VERSION,
        });
        self.module.export_global(ABI_MINOR_VERSION_GLOBAL, minor);

        for func in &self.policy.funcs.funcs {
            if self.funcs.contains_key(&func.name) {
                return Err(CodegenError::Internal(format!(
                    "duplicate function name {}",
                    func.name
                )));
            }
            let index =
                self.module
                    .declare_func(&func.name, FuncType::i32s(func.params.len()), false);
            self.funcs.insert(func.name.clone(), index);
        }

        self.eval = self.declare_export(EXPORT_EVAL, FuncType::i32s(1));
        self.one_shot = self.declare_export(EXPORT_ONE_SHOT_EVAL, FuncType::i32s(5));
        self.builtins = self.declare_export(EXPORT_BUILTINS, FuncType::i32s(0));
        self.entrypoints = self.declare_export(EXPORT_ENTRYPOINTS, FuncType::i32s(0));

        tracing::debug!(
            funcs = self.policy.funcs.funcs.len(),
            plans = self.policy.plans.plans.len(),
            "module initialized"
        );
        Ok(())
    }

    fn declare_export(&mut self, name: &str, ty: FuncType) -> u32 {
        let index = self.module.declare_func(name, ty, true);
        self.funcs.insert(name.to_string(), index);
        index
    }

    // ── Stage 2: data segment ────────────────────────────────────────────

    fn compile_strings(&mut self) {
        let mut bytes = Vec::new();
        let mut push = |s: &str| -> u32 {
            let addr = STRING_BASE + bytes.len() as u32;
            bytes.extend_from_slice(s.as_bytes());
            bytes.push(0);
            addr
        };

        self.string_addrs = self
            .policy
            .static_
            .strings
            .iter()
            .map(|s| push(&s.value))
            .collect();
        self.external_name_addrs = self.external_names.iter().map(|n| push(n)).collect();
        self.entrypoint_name_addrs = self
            .policy
            .plans
            .plans
            .iter()
            .map(|p| push(&p.name))
            .collect();
        for msg in ERROR_MESSAGES {
            let addr = push(msg);
            self.error_addrs.insert(msg, addr);
        }

        let segment = DataSegment {
            offset: STRING_BASE,
            bytes,
        };
        let heap_start = align8(segment.end());
        tracing::debug!(bytes = segment.bytes.len(), heap_start, "strings laid out");
        self.module.data.push(segment);
        if let Some(heap) = self
            .module
            .globals
            .get_mut(runtime::GLOBAL_HEAP_PTR as usize)
        {
            heap.init = heap_start as i32;
        }
    }

    // ── Stages 3 and 4: name tables ──────────────────────────────────────

    fn compile_external_func_decls(&mut self) -> CodegenResult<()> {
        let body = self.emit_name_table(&self.external_name_addrs)?;
        self.module.set_body(self.builtins, body)
    }

    fn compile_entrypoint_decls(&mut self) -> CodegenResult<()> {
        let body = self.emit_name_table(&self.entrypoint_name_addrs)?;
        self.module.set_body(self.entrypoints, body)
    }

    /// `() -> object`: an object mapping each name to its position.
    fn emit_name_table(&self, addrs: &[u32]) -> CodegenResult<Body> {
        let obj = 0;
        let mut instrs = vec![Instr::Call(self.func(abi::OPA_OBJECT)?), Instr::LocalSet(obj)];
        for (id, addr) in addrs.iter().enumerate() {
            instrs.extend([
                Instr::LocalGet(obj),
                Instr::I32Const(*addr as i32),
                Instr::Call(self.func(abi::OPA_STRING_TERMINATED)?),
                Instr::I64Const(id as i64),
                Instr::Call(self.func(abi::OPA_NUMBER_INT)?),
                Instr::Call(self.func(abi::OPA_OBJECT_INSERT)?),
            ]);
        }
        instrs.push(Instr::LocalGet(obj));
        Ok(Body::new(vec![(1, ValType::I32)], instrs))
    }

    // ── Stage 5: IR functions ────────────────────────────────────────────

    fn compile_funcs(&mut self) -> CodegenResult<()> {
        for func in &self.policy.funcs.funcs {
            let mut fc = FuncContext::default();
            for param in &func.params {
                fc.local(*param);
            }
            let ret = fc.local(func.return_);

            let mut instrs = Vec::with_capacity(func.blocks.len() + 1);
            for block in &func.blocks {
                instrs.push(Instr::Block(emit_block(block, self, &mut fc)?));
            }
            instrs.push(Instr::LocalGet(ret));

            let body = Body::new(fc.local_decls(func.params.len() as u32), instrs);
            let index = self.func(&func.name)?;
            self.module.set_body(index, body)?;
        }
        tracing::debug!(count = self.policy.funcs.funcs.len(), "functions compiled");
        Ok(())
    }

    // ── Stage 6: entrypoints ─────────────────────────────────────────────

    fn compile_plans(&mut self) -> CodegenResult<()> {
        let body = self.emit_eval()?;
        self.module.set_body(self.eval, body)?;
        let body = self.emit_one_shot_eval()?;
        self.module.set_body(self.one_shot, body)?;
        tracing::debug!(count = self.policy.plans.plans.len(), "plans compiled");
        Ok(())
    }

    /// `eval(ctx) -> 0`: run the plan selected by the context's entrypoint id,
    /// adding results to a fresh set stored back into the context.
    fn emit_eval(&self) -> CodegenResult<Body> {
        let mut fc = FuncContext::default();
        let ctx = fc.gen_local();
        let lrs = fc.gen_local();
        let leid = fc.gen_local();
        let input = fc.local(Local::INPUT);
        let data = fc.local(Local::DATA);
        fc.result_set = Some(lrs);

        let mut instrs = vec![
            Instr::LocalGet(ctx),
            Instr::I32Load { offset: CTX_INPUT },
            Instr::LocalSet(input),
            Instr::LocalGet(ctx),
            Instr::I32Load { offset: CTX_DATA },
            Instr::LocalSet(data),
            Instr::Call(self.func(abi::OPA_SET)?),
            Instr::LocalSet(lrs),
            Instr::LocalGet(ctx),
            Instr::LocalGet(lrs),
            Instr::I32Store { offset: CTX_RESULT },
            Instr::LocalGet(ctx),
            Instr::I32Load {
                offset: CTX_ENTRYPOINT,
            },
            Instr::LocalSet(leid),
        ];

        let mut main = Vec::new();
        for (id, plan) in self.policy.plans.plans.iter().enumerate() {
            let mut blocks = Vec::new();
            let last = plan.blocks.len().saturating_sub(1);
            for (i, block) in plan.blocks.iter().enumerate() {
                let code = emit_block(block, self, &mut fc)?;
                if i < last {
                    blocks.push(Instr::Block(code));
                } else {
                    blocks.extend(code);
                }
            }
            main.push(Instr::Block(vec![
                Instr::LocalGet(leid),
                Instr::I32Const(id as i32),
                Instr::I32Ne,
                Instr::BrIf(0),
                Instr::Block(blocks),
                Instr::Br(1),
            ]));
        }
        main.extend([
            Instr::I32Const(self.error_message(ERR_ILLEGAL_ENTRYPOINT)? as i32),
            Instr::Call(self.func(abi::OPA_ABORT)?),
            Instr::Unreachable,
        ]);
        instrs.push(Instr::Block(main));
        instrs.push(Instr::I32Const(0));

        Ok(Body::new(fc.local_decls(1), instrs))
    }

    /// `opa_eval(entrypoint, data, input_ptr, input_len, heap_ptr) -> json`:
    /// parse the raw input at `input_ptr`, evaluate and dump the result set.
    fn emit_one_shot_eval(&self) -> CodegenResult<Body> {
        let (entrypoint, data, input_ptr, input_len, heap_ptr) = (0, 1, 2, 3, 4);
        let (ctx, input) = (5, 6);

        let instrs = vec![
            Instr::LocalGet(heap_ptr),
            Instr::Call(self.func(abi::OPA_HEAP_PTR_SET)?),
            Instr::Call(self.func(abi::OPA_EVAL_CTX_NEW)?),
            Instr::LocalSet(ctx),
            Instr::Block(vec![
                Instr::LocalGet(input_len),
                Instr::I32Eqz,
                Instr::BrIf(0),
                Instr::LocalGet(input_ptr),
                Instr::LocalGet(input_len),
                Instr::Call(self.func(abi::OPA_JSON_PARSE)?),
                Instr::LocalSet(input),
                Instr::LocalGet(ctx),
                Instr::LocalGet(input),
                Instr::Call(self.func(abi::OPA_EVAL_CTX_SET_INPUT)?),
            ]),
            Instr::LocalGet(ctx),
            Instr::LocalGet(data),
            Instr::Call(self.func(abi::OPA_EVAL_CTX_SET_DATA)?),
            Instr::LocalGet(ctx),
            Instr::LocalGet(entrypoint),
            Instr::Call(self.func(abi::OPA_EVAL_CTX_SET_ENTRYPOINT)?),
            Instr::LocalGet(ctx),
            Instr::Call(self.eval),
            Instr::Drop,
            Instr::LocalGet(ctx),
            Instr::Call(self.func(abi::OPA_EVAL_CTX_GET_RESULT)?),
            Instr::Call(self.func(abi::OPA_JSON_DUMP)?),
        ];
        Ok(Body::new(vec![(2, ValType::I32)], instrs))
    }

    // ── Lookups used by the statement emitter ────────────────────────────

    /// Absolute index of a named function.
    pub(crate) fn func(&self, name: &str) -> CodegenResult<u32> {
        self.funcs
            .get(name)
            .copied()
            .ok_or_else(|| CodegenError::Internal(format!("runtime function {name} missing")))
    }

    /// Address and byte length of string constant `index`.
    pub(crate) fn string_const(&self, index: usize) -> CodegenResult<(u32, u32)> {
        let addr = self.string_addrs.get(index).copied();
        let value = self.policy.static_.strings.get(index);
        match (addr, value) {
            (Some(addr), Some(s)) => Ok((addr, s.value.len() as u32)),
            _ => Err(CodegenError::Internal(format!(
                "string index {index} out of range"
            ))),
        }
    }

    pub(crate) fn error_message(&self, msg: &'static str) -> CodegenResult<u32> {
        self.error_addrs
            .get(msg)
            .copied()
            .ok_or_else(|| CodegenError::Internal(format!("error message {msg:?} not laid out")))
    }

    /// Resolve a call target: IR function, then native builtin, then
    /// dispatched builtin.
    pub(crate) fn resolve_call(&self, name: &str, arity: usize) -> CodegenResult<Callee> {
        let direct = if self.policy.func(name).is_some() {
            self.funcs.get(name).copied()
        } else {
            abi::native_builtin(name).and_then(|ext| self.funcs.get(ext).copied())
        };

        if let Some(index) = direct {
            let params = self
                .module
                .func_type_index(index)
                .and_then(|ty| self.module.types.get(ty as usize))
                .map(|ty| ty.params.len());
            if params != Some(arity) {
                return Err(CodegenError::IllegalFunctionReference(format!(
                    "{name} called with {arity} arguments"
                )));
            }
            return Ok(Callee::Direct(index));
        }

        if let Some(&id) = self.external_ids.get(name) {
            let dispatcher = abi::BUILTIN_DISPATCHERS.get(arity).ok_or_else(|| {
                CodegenError::LimitExceeded(format!(
                    "builtin {name} takes {arity} arguments, at most {} supported",
                    abi::BUILTIN_DISPATCHERS.len() - 1
                ))
            })?;
            return Ok(Callee::Dispatched {
                id,
                dispatcher: self.func(dispatcher)?,
            });
        }

        Err(CodegenError::IllegalFunctionReference(name.to_string()))
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Function context
// ══════════════════════════════════════════════════════════════════════════════

/// Per-function local allocation.
#[derive(Debug, Default)]
pub(crate) struct FuncContext {
    locals: HashMap<Local, u32>,
    next_local: u32,
    /// The result-set local, inside `eval` only.
    pub(crate) result_set: Option<u32>,
}

impl FuncContext {
    /// The WASM local for an IR local, allocated on first reference.
    pub(crate) fn local(&mut self, local: Local) -> u32 {
        if let Some(index) = self.locals.get(&local) {
            return *index;
        }
        let index = self.gen_local();
        self.locals.insert(local, index);
        index
    }

    /// A fresh temporary with no IR counterpart.
    pub(crate) fn gen_local(&mut self) -> u32 {
        let index = self.next_local;
        self.next_local += 1;
        index
    }

    /// Local declarations beyond the first `params` locals.
    fn local_decls(&self, params: u32) -> Vec<(u32, ValType)> {
        match self.next_local.saturating_sub(params) {
            0 => Vec::new(),
            n => vec![(n, ValType::I32)],
        }
    }
}
