//! VM configuration.

use serde::Deserialize;

/// Memory limits and pool sizing.
///
/// ```
/// let config: tollgate_vm::VmConfig =
///     serde_json::from_str(r#"{"memory_max_pages": 256}"#).unwrap();
/// assert_eq!(config.memory_min_pages, 2);
/// assert_eq!(config.memory_max_pages, 256);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Initial size of the linear memory, in 64 KiB pages.
    pub memory_min_pages: u32,
    /// Hard limit; allocation past it fails the evaluation.
    pub memory_max_pages: u32,
    /// Number of instances a [`VmPool`](crate::VmPool) keeps.
    pub pool_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_min_pages: 2,
            memory_max_pages: 1024,
            pool_size: 4,
        }
    }
}
