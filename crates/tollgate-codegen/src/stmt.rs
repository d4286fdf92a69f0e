//! Statement code generation.
//!
//! Every rule appends to a flat instruction list for the enclosing block.
//! A statement that can be undefined ends with `br_if 0`, leaving the
//! innermost enclosing block; locals holding `0` are undefined.

use tollgate_ir::{Block, Local, Stmt};

use crate::abi;
use crate::compiler::{Callee, Compiler, FuncContext};
use crate::error::{CodegenError, CodegenResult};
use crate::instr::Instr;
use crate::types::*;

/// Emit the statements of one block.
pub(crate) fn emit_block(
    block: &Block,
    c: &Compiler<'_>,
    fc: &mut FuncContext,
) -> CodegenResult<Vec<Instr>> {
    let mut out = Vec::new();
    for stmt in &block.stmts {
        emit_stmt(stmt, c, fc, &mut out)?;
    }
    Ok(out)
}

fn emit_stmt(
    stmt: &Stmt,
    c: &Compiler<'_>,
    fc: &mut FuncContext,
    out: &mut Vec<Instr>,
) -> CodegenResult<()> {
    match stmt {
        // ── Control ──────────────────────────────────────────────────────
        Stmt::Return { code } => out.extend([Instr::I32Const(*code), Instr::Return]),
        Stmt::ReturnLocal { source } => {
            out.extend([Instr::LocalGet(fc.local(*source)), Instr::Return])
        }
        Stmt::Block { blocks } => {
            for block in blocks {
                out.push(Instr::Block(emit_block(block, c, fc)?));
            }
        }
        Stmt::Break { index } => out.push(Instr::Br(*index)),
        Stmt::Nop => out.push(Instr::Nop),

        // ── Calls ────────────────────────────────────────────────────────
        Stmt::Call { func, args, result } => emit_call(func, args, *result, c, fc, out)?,
        Stmt::CallDynamic { .. } | Stmt::With { .. } => {
            return Err(CodegenError::IllegalStatement(stmt.kind().to_string()))
        }

        // ── Structured evaluation ────────────────────────────────────────
        Stmt::Not { block } => emit_not(block, c, fc, out)?,
        Stmt::Scan {
            source,
            key,
            value,
            block,
        } => emit_scan(*source, *key, *value, block, c, fc, out)?,
        Stmt::Dot {
            source,
            key,
            target,
        } => out.extend([
            Instr::LocalGet(fc.local(*source)),
            Instr::LocalGet(fc.local(*key)),
            Instr::Call(c.func(abi::OPA_VALUE_GET)?),
            Instr::LocalTee(fc.local(*target)),
            Instr::I32Eqz,
            Instr::BrIf(0),
        ]),
        Stmt::Len { source, target } => out.extend([
            Instr::LocalGet(fc.local(*source)),
            Instr::Call(c.func(abi::OPA_VALUE_LENGTH)?),
            Instr::Call(c.func(abi::OPA_NUMBER_SIZE)?),
            Instr::LocalSet(fc.local(*target)),
        ]),

        // ── Assignment ───────────────────────────────────────────────────
        Stmt::AssignVar { source, target } => out.extend([
            Instr::LocalGet(fc.local(*source)),
            Instr::LocalSet(fc.local(*target)),
        ]),
        Stmt::AssignVarOnce { source, target } => emit_assign_once(*source, *target, c, fc, out)?,
        Stmt::AssignInt { value, target } => out.extend([
            Instr::LocalGet(fc.local(*target)),
            Instr::I64Const(*value),
            Instr::Call(c.func(abi::OPA_VALUE_NUMBER_SET_INT)?),
        ]),
        Stmt::AssignBoolean { value, target } => out.extend([
            Instr::LocalGet(fc.local(*target)),
            Instr::I32Const(i32::from(*value)),
            Instr::Call(c.func(abi::OPA_VALUE_BOOLEAN_SET)?),
        ]),
        Stmt::ResetLocal { target } => {
            out.extend([Instr::I32Const(0), Instr::LocalSet(fc.local(*target))])
        }

        // ── Constructors ─────────────────────────────────────────────────
        Stmt::MakeNull { target } => make(vec![], abi::OPA_NULL, *target, c, fc, out)?,
        Stmt::MakeBoolean { value, target } => make(
            vec![Instr::I32Const(i32::from(*value))],
            abi::OPA_BOOLEAN,
            *target,
            c,
            fc,
            out,
        )?,
        Stmt::MakeNumberInt { value, target } => make(
            vec![Instr::I64Const(*value)],
            abi::OPA_NUMBER_INT,
            *target,
            c,
            fc,
            out,
        )?,
        Stmt::MakeNumberFloat { value, target } => make(
            vec![Instr::F64Const(*value)],
            abi::OPA_NUMBER_FLOAT,
            *target,
            c,
            fc,
            out,
        )?,
        Stmt::MakeNumberRef { index, target } => {
            let (addr, len) = c.string_const(*index)?;
            make(
                vec![Instr::I32Const(addr as i32), Instr::I32Const(len as i32)],
                abi::OPA_NUMBER_REF,
                *target,
                c,
                fc,
                out,
            )?
        }
        Stmt::MakeString { index, target } => {
            let (addr, _) = c.string_const(*index)?;
            make(
                vec![Instr::I32Const(addr as i32)],
                abi::OPA_STRING_TERMINATED,
                *target,
                c,
                fc,
                out,
            )?
        }
        Stmt::MakeArray { capacity, target } => make(
            vec![Instr::I32Const(*capacity)],
            abi::OPA_ARRAY_WITH_CAP,
            *target,
            c,
            fc,
            out,
        )?,
        Stmt::MakeObject { target } => make(vec![], abi::OPA_OBJECT, *target, c, fc, out)?,
        Stmt::MakeSet { target } => make(vec![], abi::OPA_SET, *target, c, fc, out)?,

        // ── Comparisons and type tests ───────────────────────────────────
        Stmt::Equal { a, b } => emit_compare(*a, *b, &[], c, fc, out)?,
        Stmt::NotEqual { a, b } => emit_compare(*a, *b, &[Instr::I32Eqz], c, fc, out)?,
        Stmt::LessThan { a, b } => {
            emit_compare(*a, *b, &[Instr::I32Const(0), Instr::I32GeS], c, fc, out)?
        }
        Stmt::LessThanEqual { a, b } => {
            emit_compare(*a, *b, &[Instr::I32Const(0), Instr::I32GtS], c, fc, out)?
        }
        Stmt::GreaterThan { a, b } => {
            emit_compare(*a, *b, &[Instr::I32Const(0), Instr::I32LeS], c, fc, out)?
        }
        Stmt::GreaterThanEqual { a, b } => {
            emit_compare(*a, *b, &[Instr::I32Const(0), Instr::I32LtS], c, fc, out)?
        }
        Stmt::IsArray { source } => emit_is_type(*source, TYPE_ARRAY, c, fc, out)?,
        Stmt::IsObject { source } => emit_is_type(*source, TYPE_OBJECT, c, fc, out)?,
        Stmt::IsDefined { source } => out.extend([
            Instr::LocalGet(fc.local(*source)),
            Instr::I32Eqz,
            Instr::BrIf(0),
        ]),
        Stmt::IsUndefined { source } => out.extend([
            Instr::LocalGet(fc.local(*source)),
            Instr::I32Const(0),
            Instr::I32Ne,
            Instr::BrIf(0),
        ]),

        // ── Composite mutation ───────────────────────────────────────────
        Stmt::ArrayAppend { value, array } => out.extend([
            Instr::LocalGet(fc.local(*array)),
            Instr::LocalGet(fc.local(*value)),
            Instr::Call(c.func(abi::OPA_ARRAY_APPEND)?),
        ]),
        Stmt::ObjectInsert { key, value, object } => out.extend([
            Instr::LocalGet(fc.local(*object)),
            Instr::LocalGet(fc.local(*key)),
            Instr::LocalGet(fc.local(*value)),
            Instr::Call(c.func(abi::OPA_OBJECT_INSERT)?),
        ]),
        Stmt::ObjectInsertOnce { key, value, object } => {
            emit_object_insert_once(*key, *value, *object, c, fc, out)?
        }
        Stmt::ObjectMerge { a, b, target } => out.extend([
            Instr::LocalGet(fc.local(*a)),
            Instr::LocalGet(fc.local(*b)),
            Instr::Call(c.func(abi::OPA_VALUE_MERGE)?),
            Instr::LocalTee(fc.local(*target)),
            Instr::I32Eqz,
            Instr::BrIf(0),
        ]),
        Stmt::SetAdd { value, set } => out.extend([
            Instr::LocalGet(fc.local(*set)),
            Instr::LocalGet(fc.local(*value)),
            Instr::Call(c.func(abi::OPA_SET_ADD)?),
        ]),
        Stmt::ResultSetAdd { value } => {
            let lrs = fc.result_set.ok_or_else(|| {
                CodegenError::IllegalStatement(format!("{} outside a plan", stmt.kind()))
            })?;
            out.extend([
                Instr::LocalGet(lrs),
                Instr::LocalGet(fc.local(*value)),
                Instr::Call(c.func(abi::OPA_SET_ADD)?),
            ]);
        }
    }
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Calls
// ══════════════════════════════════════════════════════════════════════════════

fn emit_call(
    func: &str,
    args: &[Local],
    result: Local,
    c: &Compiler<'_>,
    fc: &mut FuncContext,
    out: &mut Vec<Instr>,
) -> CodegenResult<()> {
    match c.resolve_call(func, args.len())? {
        Callee::Direct(index) => {
            let mut call: Vec<Instr> = args.iter().map(|a| Instr::LocalGet(fc.local(*a))).collect();
            call.extend([
                Instr::Call(index),
                Instr::LocalTee(fc.local(result)),
                Instr::I32Eqz,
                Instr::BrIf(1),
            ]);
            out.push(Instr::Block(call));
        }
        Callee::Dispatched { id, dispatcher } => {
            // The reserved context argument is always 0.
            out.extend([Instr::I32Const(id), Instr::I32Const(0)]);
            out.extend(args.iter().map(|a| Instr::LocalGet(fc.local(*a))));
            out.extend([
                Instr::Call(dispatcher),
                Instr::LocalTee(fc.local(result)),
                Instr::I32Eqz,
                Instr::BrIf(0),
            ]);
        }
    }
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Structured evaluation
// ══════════════════════════════════════════════════════════════════════════════

/// `cond = 1; block { <block>; cond = 0 }; if cond == 0 { leave }`
fn emit_not(
    block: &Block,
    c: &Compiler<'_>,
    fc: &mut FuncContext,
    out: &mut Vec<Instr>,
) -> CodegenResult<()> {
    let cond = fc.gen_local();
    let mut nested = emit_block(block, c, fc)?;
    nested.extend([Instr::I32Const(0), Instr::LocalSet(cond)]);
    out.extend([
        Instr::I32Const(1),
        Instr::LocalSet(cond),
        Instr::Block(nested),
        Instr::LocalGet(cond),
        Instr::I32Eqz,
        Instr::BrIf(0),
    ]);
    Ok(())
}

/// Loop over `source`.  An undefined statement in the body moves on to
/// the next key; a zero key from the iterator ends the scan.
#[allow(clippy::too_many_arguments)]
fn emit_scan(
    source: Local,
    key: Local,
    value: Local,
    block: &Block,
    c: &Compiler<'_>,
    fc: &mut FuncContext,
    out: &mut Vec<Instr>,
) -> CodegenResult<()> {
    let (source, key, value) = (fc.local(source), fc.local(key), fc.local(value));
    let mut body = vec![
        Instr::LocalGet(source),
        Instr::LocalGet(key),
        Instr::Call(c.func(abi::OPA_VALUE_ITER)?),
        Instr::LocalTee(key),
        Instr::I32Eqz,
        Instr::BrIf(1),
        Instr::LocalGet(source),
        Instr::LocalGet(key),
        Instr::Call(c.func(abi::OPA_VALUE_GET)?),
        Instr::LocalSet(value),
    ];
    body.extend(emit_block(block, c, fc)?);
    body.push(Instr::Br(0));

    out.extend([
        Instr::I32Const(0),
        Instr::LocalSet(key),
        Instr::Block(vec![Instr::Loop(body)]),
    ]);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Assignment with conflict detection
// ══════════════════════════════════════════════════════════════════════════════

fn emit_assign_once(
    source: Local,
    target: Local,
    c: &Compiler<'_>,
    fc: &mut FuncContext,
    out: &mut Vec<Instr>,
) -> CodegenResult<()> {
    let (source, target) = (fc.local(source), fc.local(target));
    let check = vec![
        Instr::LocalGet(target),
        Instr::I32Eqz,
        Instr::BrIf(0),
        Instr::LocalGet(target),
        Instr::LocalGet(source),
        Instr::Call(c.func(abi::OPA_VALUE_COMPARE)?),
        Instr::I32Eqz,
        Instr::BrIf(1),
    ];
    out.push(Instr::Block(vec![
        Instr::Block(with_abort(check, ERR_VAR_ASSIGN_CONFLICT, c)?),
        Instr::LocalGet(source),
        Instr::LocalSet(target),
    ]));
    Ok(())
}

fn emit_object_insert_once(
    key: Local,
    value: Local,
    object: Local,
    c: &Compiler<'_>,
    fc: &mut FuncContext,
    out: &mut Vec<Instr>,
) -> CodegenResult<()> {
    let (key, value, object) = (fc.local(key), fc.local(value), fc.local(object));
    let existing = fc.gen_local();
    let check = vec![
        Instr::LocalGet(object),
        Instr::LocalGet(key),
        Instr::Call(c.func(abi::OPA_VALUE_GET)?),
        Instr::LocalTee(existing),
        Instr::I32Eqz,
        Instr::BrIf(0),
        Instr::LocalGet(existing),
        Instr::LocalGet(value),
        Instr::Call(c.func(abi::OPA_VALUE_COMPARE)?),
        Instr::I32Eqz,
        Instr::BrIf(1),
    ];
    out.push(Instr::Block(vec![
        Instr::Block(with_abort(check, ERR_OBJECT_INSERT_CONFLICT, c)?),
        Instr::LocalGet(object),
        Instr::LocalGet(key),
        Instr::LocalGet(value),
        Instr::Call(c.func(abi::OPA_OBJECT_INSERT)?),
    ]));
    Ok(())
}

fn with_abort(
    mut instrs: Vec<Instr>,
    msg: &'static str,
    c: &Compiler<'_>,
) -> CodegenResult<Vec<Instr>> {
    instrs.extend([
        Instr::I32Const(c.error_message(msg)? as i32),
        Instr::Call(c.func(abi::OPA_ABORT)?),
        Instr::Unreachable,
    ]);
    Ok(instrs)
}

// ══════════════════════════════════════════════════════════════════════════════
// Small shapes
// ══════════════════════════════════════════════════════════════════════════════

/// `target = ctor(args...)`
fn make(
    args: Vec<Instr>,
    ctor: &str,
    target: Local,
    c: &Compiler<'_>,
    fc: &mut FuncContext,
    out: &mut Vec<Instr>,
) -> CodegenResult<()> {
    out.extend(args);
    out.extend([
        Instr::Call(c.func(ctor)?),
        Instr::LocalSet(fc.local(target)),
    ]);
    Ok(())
}

/// `opa_value_compare(a, b)` followed by `test`; leave when the result is
/// non-zero.
fn emit_compare(
    a: Local,
    b: Local,
    test: &[Instr],
    c: &Compiler<'_>,
    fc: &mut FuncContext,
    out: &mut Vec<Instr>,
) -> CodegenResult<()> {
    out.extend([
        Instr::LocalGet(fc.local(a)),
        Instr::LocalGet(fc.local(b)),
        Instr::Call(c.func(abi::OPA_VALUE_COMPARE)?),
    ]);
    out.extend(test.iter().cloned());
    out.push(Instr::BrIf(0));
    Ok(())
}

fn emit_is_type(
    source: Local,
    ty: i32,
    c: &Compiler<'_>,
    fc: &mut FuncContext,
    out: &mut Vec<Instr>,
) -> CodegenResult<()> {
    out.extend([
        Instr::LocalGet(fc.local(source)),
        Instr::Call(c.func(abi::OPA_VALUE_TYPE)?),
        Instr::I32Const(ty),
        Instr::I32Ne,
        Instr::BrIf(0),
    ]);
    Ok(())
}
