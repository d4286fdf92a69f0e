//! Dead-function elimination.
//!
//! Roots are the exported functions and the start function.  Everything not
//! reachable from a root through `call` is removed, imports included, and
//! the function index space is renumbered.  Code and name are dropped
//! together, so the name map stays in lockstep with the code section.

use crate::error::{CodegenError, CodegenResult};
use crate::instr::Instr;
use crate::module::{Code, ExportKind, ImportKind, Module};

/// Remove unreachable functions from `module`.
pub fn prune(module: &mut Module) -> CodegenResult<()> {
    let imported = module.func_import_count();
    let total = module.func_count();

    let mut live = vec![false; total as usize];
    let mut work: Vec<u32> = module
        .exports
        .iter()
        .filter(|e| e.kind == ExportKind::Func)
        .map(|e| e.index)
        .chain(module.start)
        .collect();

    while let Some(index) = work.pop() {
        let seen = live.get_mut(index as usize).ok_or_else(|| {
            CodegenError::Internal(format!("call to function {index} out of range"))
        })?;
        if std::mem::replace(seen, true) || index < imported {
            continue;
        }
        match &module.code[(index - imported) as usize] {
            Code::Body(body) => body.walk(&mut |instr| {
                if let Instr::Call(callee) = instr {
                    work.push(*callee);
                }
            }),
            Code::Raw(_) => {
                return Err(CodegenError::Internal(format!(
                    "cannot prune through raw body of function {index}"
                )))
            }
        }
    }

    let mut remap = vec![None; total as usize];
    let mut next = 0u32;
    for (index, keep) in live.iter().enumerate() {
        if *keep {
            remap[index] = Some(next);
            next += 1;
        }
    }
    if next == total {
        return Ok(());
    }

    // Imports: keep the memory and every live function.
    let mut ordinal = 0usize;
    module.imports.retain(|import| match import.kind {
        ImportKind::Func(_) => {
            let keep = live[ordinal];
            ordinal += 1;
            keep
        }
        ImportKind::Memory { .. } => true,
    });

    // Defined functions and their code, in lockstep.
    let defined = std::mem::take(&mut module.funcs)
        .into_iter()
        .zip(std::mem::take(&mut module.code))
        .enumerate()
        .filter(|(i, _)| live[imported as usize + i])
        .map(|(_, entry)| entry);
    let (funcs, code): (Vec<u32>, Vec<Code>) = defined.unzip();
    module.funcs = funcs;
    module.code = code;

    module.names = std::mem::take(&mut module.names)
        .into_iter()
        .filter_map(|(index, name)| {
            remap
                .get(index as usize)
                .copied()
                .flatten()
                .map(|new| (new, name))
        })
        .collect();

    for export in &mut module.exports {
        if export.kind == ExportKind::Func {
            export.index = remapped(&remap, export.index)?;
        }
    }
    if let Some(start) = module.start {
        module.start = Some(remapped(&remap, start)?);
    }
    for code in &mut module.code {
        if let Code::Body(body) = code {
            body.walk_mut(&mut |instr| {
                if let Instr::Call(callee) = instr {
                    if let Some(Some(new)) = remap.get(*callee as usize) {
                        *callee = *new;
                    }
                }
            });
        }
    }

    tracing::debug!(removed = total - next, kept = next, "pruned unreachable functions");
    Ok(())
}

fn remapped(remap: &[Option<u32>], index: u32) -> CodegenResult<u32> {
    remap
        .get(index as usize)
        .copied()
        .flatten()
        .ok_or_else(|| CodegenError::Internal(format!("live function {index} lost its index")))
}
