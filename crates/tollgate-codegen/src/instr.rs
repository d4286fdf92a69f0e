//! Structured instruction trees.
//!
//! The compiler never emits arbitrary jumps: `block` and `loop` own their
//! bodies, and branches name a relative depth.  Keeping bodies nested until
//! encoding lets the pruner rewrite call targets and lets codegen splice
//! sub-blocks without tracking `end` markers.  All blocks are `[] -> []`.

use wasm_encoder::{BlockType, Function, Instruction, MemArg, ValType};
use wasmparser::Operator;

use crate::error::{CodegenError, CodegenResult};

/// One WASM instruction, with nested bodies for structured control.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Unreachable,
    Nop,
    Block(Vec<Instr>),
    Loop(Vec<Instr>),
    Br(u32),
    BrIf(u32),
    Return,
    Call(u32),
    Drop,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    I32Load { offset: u64 },
    I32Store { offset: u64 },
    I32Const(i32),
    I64Const(i64),
    F64Const(f64),
    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32GtS,
    I32LeS,
    I32GeS,
    I32Add,
    I32Sub,
    I32Mul,
}

/// A function body: local declarations (beyond the parameters) and code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    pub locals: Vec<(u32, ValType)>,
    pub instrs: Vec<Instr>,
}

impl Body {
    pub fn new(locals: Vec<(u32, ValType)>, instrs: Vec<Instr>) -> Self {
        Self { locals, instrs }
    }

    /// Encode into a `wasm_encoder` function, including the final `end`.
    pub fn to_function(&self) -> Function {
        let mut f = Function::new(self.locals.iter().copied());
        emit_instrs(&self.instrs, &mut f);
        f.instruction(&Instruction::End);
        f
    }

    /// Visit every instruction, depth first.
    pub fn walk(&self, visit: &mut impl FnMut(&Instr)) {
        walk_instrs(&self.instrs, visit);
    }

    /// Rewrite every instruction in place, depth first.
    pub fn walk_mut(&mut self, visit: &mut impl FnMut(&mut Instr)) {
        walk_instrs_mut(&mut self.instrs, visit);
    }

    /// Decode a function body.  Returns `Ok(None)` if it uses instructions
    /// outside the structured subset; callers keep such bodies raw.
    pub fn decode(body: &wasmparser::FunctionBody<'_>) -> CodegenResult<Option<Body>> {
        let mut locals = Vec::new();
        for local in body.get_locals_reader()? {
            let (count, ty) = local?;
            match val_type(ty) {
                Some(ty) => locals.push((count, ty)),
                None => return Ok(None),
            }
        }

        // Stack of open bodies; the bottom entry is the function body itself.
        let mut open: Vec<(Vec<Instr>, bool)> = vec![(Vec::new(), false)];
        let mut reader = body.get_operators_reader()?;
        while !reader.eof() {
            let op = reader.read()?;
            let instr = match op {
                Operator::Block { blockty } | Operator::Loop { blockty } => {
                    if !matches!(blockty, wasmparser::BlockType::Empty) {
                        return Ok(None);
                    }
                    let is_loop = matches!(op, Operator::Loop { .. });
                    open.push((Vec::new(), is_loop));
                    continue;
                }
                Operator::End => {
                    let (instrs, is_loop) = open
                        .pop()
                        .ok_or_else(|| CodegenError::Decode("unbalanced end".into()))?;
                    match open.last_mut() {
                        Some((parent, _)) => {
                            parent.push(if is_loop {
                                Instr::Loop(instrs)
                            } else {
                                Instr::Block(instrs)
                            });
                            continue;
                        }
                        None => {
                            if !reader.eof() {
                                return Err(CodegenError::Decode(
                                    "instructions after function end".into(),
                                ));
                            }
                            return Ok(Some(Body::new(locals, instrs)));
                        }
                    }
                }
                other => match from_operator(&other) {
                    Some(instr) => instr,
                    None => return Ok(None),
                },
            };
            if let Some((current, _)) = open.last_mut() {
                current.push(instr);
            }
        }
        Err(CodegenError::Decode("function body missing end".into()))
    }
}

fn val_type(ty: wasmparser::ValType) -> Option<ValType> {
    match ty {
        wasmparser::ValType::I32 => Some(ValType::I32),
        wasmparser::ValType::I64 => Some(ValType::I64),
        wasmparser::ValType::F32 => Some(ValType::F32),
        wasmparser::ValType::F64 => Some(ValType::F64),
        _ => None,
    }
}

fn from_operator(op: &Operator<'_>) -> Option<Instr> {
    Some(match *op {
        Operator::Unreachable => Instr::Unreachable,
        Operator::Nop => Instr::Nop,
        Operator::Br { relative_depth } => Instr::Br(relative_depth),
        Operator::BrIf { relative_depth } => Instr::BrIf(relative_depth),
        Operator::Return => Instr::Return,
        Operator::Call { function_index } => Instr::Call(function_index),
        Operator::Drop => Instr::Drop,
        Operator::LocalGet { local_index } => Instr::LocalGet(local_index),
        Operator::LocalSet { local_index } => Instr::LocalSet(local_index),
        Operator::LocalTee { local_index } => Instr::LocalTee(local_index),
        Operator::GlobalGet { global_index } => Instr::GlobalGet(global_index),
        Operator::GlobalSet { global_index } => Instr::GlobalSet(global_index),
        Operator::I32Load { memarg } if memarg.memory == 0 => Instr::I32Load {
            offset: memarg.offset,
        },
        Operator::I32Store { memarg } if memarg.memory == 0 => Instr::I32Store {
            offset: memarg.offset,
        },
        Operator::I32Const { value } => Instr::I32Const(value),
        Operator::I64Const { value } => Instr::I64Const(value),
        Operator::F64Const { value } => Instr::F64Const(f64::from_bits(value.bits())),
        Operator::I32Eqz => Instr::I32Eqz,
        Operator::I32Eq => Instr::I32Eq,
        Operator::I32Ne => Instr::I32Ne,
        Operator::I32LtS => Instr::I32LtS,
        Operator::I32GtS => Instr::I32GtS,
        Operator::I32LeS => Instr::I32LeS,
        Operator::I32GeS => Instr::I32GeS,
        Operator::I32Add => Instr::I32Add,
        Operator::I32Sub => Instr::I32Sub,
        Operator::I32Mul => Instr::I32Mul,
        _ => return None,
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// Encoding
// ══════════════════════════════════════════════════════════════════════════════

fn emit_instrs(instrs: &[Instr], f: &mut Function) {
    for instr in instrs {
        emit_instr(instr, f);
    }
}

fn emit_instr(instr: &Instr, f: &mut Function) {
    match instr {
        Instr::Block(body) => {
            f.instruction(&Instruction::Block(BlockType::Empty));
            emit_instrs(body, f);
            f.instruction(&Instruction::End);
        }
        Instr::Loop(body) => {
            f.instruction(&Instruction::Loop(BlockType::Empty));
            emit_instrs(body, f);
            f.instruction(&Instruction::End);
        }
        Instr::Unreachable => {
            f.instruction(&Instruction::Unreachable);
        }
        Instr::Nop => {
            f.instruction(&Instruction::Nop);
        }
        Instr::Br(depth) => {
            f.instruction(&Instruction::Br(*depth));
        }
        Instr::BrIf(depth) => {
            f.instruction(&Instruction::BrIf(*depth));
        }
        Instr::Return => {
            f.instruction(&Instruction::Return);
        }
        Instr::Call(index) => {
            f.instruction(&Instruction::Call(*index));
        }
        Instr::Drop => {
            f.instruction(&Instruction::Drop);
        }
        Instr::LocalGet(i) => {
            f.instruction(&Instruction::LocalGet(*i));
        }
        Instr::LocalSet(i) => {
            f.instruction(&Instruction::LocalSet(*i));
        }
        Instr::LocalTee(i) => {
            f.instruction(&Instruction::LocalTee(*i));
        }
        Instr::GlobalGet(i) => {
            f.instruction(&Instruction::GlobalGet(*i));
        }
        Instr::GlobalSet(i) => {
            f.instruction(&Instruction::GlobalSet(*i));
        }
        Instr::I32Load { offset } => {
            f.instruction(&Instruction::I32Load(memarg(*offset, 2)));
        }
        Instr::I32Store { offset } => {
            f.instruction(&Instruction::I32Store(memarg(*offset, 2)));
        }
        Instr::I32Const(v) => {
            f.instruction(&Instruction::I32Const(*v));
        }
        Instr::I64Const(v) => {
            f.instruction(&Instruction::I64Const(*v));
        }
        Instr::F64Const(v) => {
            f.instruction(&Instruction::F64Const(*v));
        }
        Instr::I32Eqz => {
            f.instruction(&Instruction::I32Eqz);
        }
        Instr::I32Eq => {
            f.instruction(&Instruction::I32Eq);
        }
        Instr::I32Ne => {
            f.instruction(&Instruction::I32Ne);
        }
        Instr::I32LtS => {
            f.instruction(&Instruction::I32LtS);
        }
        Instr::I32GtS => {
            f.instruction(&Instruction::I32GtS);
        }
        Instr::I32LeS => {
            f.instruction(&Instruction::I32LeS);
        }
        Instr::I32GeS => {
            f.instruction(&Instruction::I32GeS);
        }
        Instr::I32Add => {
            f.instruction(&Instruction::I32Add);
        }
        Instr::I32Sub => {
            f.instruction(&Instruction::I32Sub);
        }
        Instr::I32Mul => {
            f.instruction(&Instruction::I32Mul);
        }
    }
}

fn walk_instrs(instrs: &[Instr], visit: &mut impl FnMut(&Instr)) {
    for instr in instrs {
        visit(instr);
        if let Instr::Block(body) | Instr::Loop(body) = instr {
            walk_instrs(body, visit);
        }
    }
}

fn walk_instrs_mut(instrs: &mut [Instr], visit: &mut impl FnMut(&mut Instr)) {
    for instr in instrs {
        visit(instr);
        if let Instr::Block(body) | Instr::Loop(body) = instr {
            walk_instrs_mut(body, visit);
        }
    }
}

pub(crate) fn memarg(offset: u64, align: u32) -> MemArg {
    MemArg {
        offset,
        align,
        memory_index: 0,
    }
}
