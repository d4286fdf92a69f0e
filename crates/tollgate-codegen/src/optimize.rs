//! Optional post-pass through an external binary optimizer.
//!
//! The module is written to a temporary file, the tool rewrites it into a
//! second file, and the result is decoded back with raw bodies.  A missing
//! tool is not an error: the module is returned unchanged.

use serde::Deserialize;

#[cfg(feature = "optimize")]
use crate::error::{CodegenError, CodegenResult};
#[cfg(feature = "optimize")]
use crate::module::Module;

/// Which optimizer to run and how.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            program: "wasm-opt".to_string(),
            args: vec!["-O2".to_string(), "--debuginfo".to_string()],
        }
    }
}

/// Run the optimizer over `module`.
#[cfg(feature = "optimize")]
pub fn optimize(module: Module, config: &OptimizerConfig) -> CodegenResult<Module> {
    use std::io::ErrorKind;
    use std::process::Command;

    let stem = temp_stem();
    let input = std::env::temp_dir().join(format!("{stem}.in.wasm"));
    let output = std::env::temp_dir().join(format!("{stem}.out.wasm"));

    std::fs::write(&input, module.encode())
        .map_err(|e| CodegenError::Optimizer(format!("write {}: {e}", input.display())))?;

    let run = Command::new(&config.program)
        .args(&config.args)
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .output();

    let result = match run {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!(
                program = %config.program,
                "optimizer not found, skipping optimization"
            );
            None
        }
        Err(e) => Some(Err(CodegenError::Optimizer(format!(
            "failed to run {}: {e}",
            config.program
        )))),
        Ok(out) if !out.status.success() => Some(Err(CodegenError::Optimizer(format!(
            "{} exited with {}: {}",
            config.program,
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        )))),
        Ok(_) => Some(std::fs::read(&output).map_err(|e| {
            CodegenError::Optimizer(format!("read {}: {e}", output.display()))
        })),
    };

    let _ = std::fs::remove_file(&input);
    let _ = std::fs::remove_file(&output);

    let bytes = match result {
        None => return Ok(module),
        Some(bytes) => bytes?,
    };

    let mut optimized = Module::decode(&bytes)?;
    if optimized.names.is_empty() && optimized.func_count() == module.func_count() {
        optimized.names = module.names;
    }
    tracing::debug!(
        before = module.code.len(),
        after = optimized.code.len(),
        "optimizer finished"
    );
    Ok(optimized)
}

#[cfg(feature = "optimize")]
fn temp_stem() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!(
        "tollgate-{}-{}-{nanos}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
