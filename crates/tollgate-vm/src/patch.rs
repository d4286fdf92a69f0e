//! JSON Patch over the data document.
//!
//! Operations run in order through the VM's data-path primitives.  Each
//! operation either applies fully or not at all; a failing operation stops
//! the patch and leaves the earlier ones applied.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{code, VmError, VmResult};
use crate::vm::Vm;

/// One JSON Patch operation; paths are JSON pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl PatchOp {
    /// The pointer the operation writes to or checks.
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. }
            | PatchOp::Remove { path }
            | PatchOp::Replace { path, .. }
            | PatchOp::Move { path, .. }
            | PatchOp::Copy { path, .. }
            | PatchOp::Test { path, .. } => path,
        }
    }
}

/// Split a JSON pointer into unescaped segments.  `""` is the root.
pub fn parse_pointer(pointer: &str) -> VmResult<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let rest = pointer.strip_prefix('/').ok_or_else(|| VmError::DataPath {
        path: pointer.to_string(),
        code: code::INVALID_PATH,
    })?;
    Ok(rest
        .split('/')
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn segments(pointer: &[String]) -> Vec<&str> {
    pointer.iter().map(String::as_str).collect()
}

fn missing(pointer: &str) -> VmError {
    VmError::DataPath {
        path: pointer.to_string(),
        code: code::INVALID_PATH,
    }
}

impl Vm {
    /// Apply `ops` in order, stopping at the first failure.
    pub fn apply_patch(&mut self, ops: &[PatchOp]) -> VmResult<()> {
        for op in ops {
            self.apply_op(op)?;
        }
        tracing::debug!(ops = ops.len(), "patch applied");
        Ok(())
    }

    fn apply_op(&mut self, op: &PatchOp) -> VmResult<()> {
        match op {
            PatchOp::Add { path, value } => {
                let at = parse_pointer(path)?;
                self.set_data_path(&segments(&at), value)
            }
            PatchOp::Remove { path } => {
                let at = parse_pointer(path)?;
                self.remove_data_path(&segments(&at))
            }
            PatchOp::Replace { path, value } => {
                let at = parse_pointer(path)?;
                let at = segments(&at);
                if at.is_empty() {
                    return self.set_data_path(&at, value);
                }
                if self.data_path(&at)?.is_none() {
                    return Err(missing(path));
                }
                self.remove_data_path(&at)?;
                self.set_data_path(&at, value)
            }
            PatchOp::Move { from, path } => {
                let (src, dst) = (parse_pointer(from)?, parse_pointer(path)?);
                let (src, dst) = (segments(&src), segments(&dst));
                if src == dst {
                    return match self.data_path(&src)? {
                        Some(_) => Ok(()),
                        None => Err(missing(from)),
                    };
                }
                if dst.len() > src.len() && dst[..src.len()] == src[..] {
                    return Err(VmError::DataPath {
                        path: path.clone(),
                        code: code::INVALID_PATH,
                    });
                }
                let moved = self.data_path(&src)?.ok_or_else(|| missing(from))?;
                self.remove_data_path(&src)?;
                if let Err(e) = self.set_data_path(&dst, &moved) {
                    self.set_data_path(&src, &moved)?;
                    return Err(e);
                }
                Ok(())
            }
            PatchOp::Copy { from, path } => {
                let (src, dst) = (parse_pointer(from)?, parse_pointer(path)?);
                let copied = self
                    .data_path(&segments(&src))?
                    .ok_or_else(|| missing(from))?;
                self.set_data_path(&segments(&dst), &copied)
            }
            PatchOp::Test { path, value } => {
                let at = parse_pointer(path)?;
                match self.data_path(&segments(&at))? {
                    Some(found) if found == *value => Ok(()),
                    _ => Err(VmError::PatchTestFailed { path: path.clone() }),
                }
            }
        }
    }
}
