//! A fixed set of independent instances of one policy.
//!
//! Each instance sits behind its own lock; a free list says which ones are
//! idle.  Whole-pool updates lock every instance before changing any, so
//! they wait for in-flight evaluations instead of interrupting them, and
//! every instance serves the same data once they return.

use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde_json::Value;

use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::vm::Vm;

pub struct VmPool {
    slots: Vec<Mutex<Vm>>,
    free: Mutex<FreeList>,
    released: Condvar,
}

struct FreeList {
    idle: Vec<usize>,
    closed: bool,
}

impl VmPool {
    /// Build a pool of `size` instances: `seed` plus clones of it.
    pub fn new(seed: Vm, size: usize) -> VmResult<Self> {
        let size = size.max(1);
        let mut vms = Vec::with_capacity(size);
        for _ in 1..size {
            vms.push(seed.try_clone()?);
        }
        vms.push(seed);
        tracing::debug!(size, "vm pool ready");
        Ok(Self {
            slots: vms.into_iter().map(Mutex::new).collect(),
            free: Mutex::new(FreeList {
                idle: (0..size).rev().collect(),
                closed: false,
            }),
            released: Condvar::new(),
        })
    }

    /// Load `policy` once and size the pool from `config`.
    pub fn load(policy: impl Into<Vec<u8>>, data: Option<&[u8]>, config: VmConfig) -> VmResult<Self> {
        let size = config.pool_size;
        Self::new(Vm::load(policy, data, config)?, size)
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Instances not currently handed out.
    pub fn idle(&self) -> usize {
        self.free.lock().idle.len()
    }

    /// Block until an instance is free.
    pub fn acquire(&self) -> VmResult<PooledVm<'_>> {
        let mut free = self.free.lock();
        let index = loop {
            if free.closed {
                return Err(VmError::PoolClosed);
            }
            if let Some(index) = free.idle.pop() {
                break index;
            }
            self.released.wait(&mut free);
        };
        drop(free);
        Ok(PooledVm {
            pool: self,
            index,
            vm: self.slots[index].lock(),
        })
    }

    /// Like [`acquire`](Self::acquire) but never blocks.
    pub fn try_acquire(&self) -> VmResult<Option<PooledVm<'_>>> {
        let mut free = self.free.lock();
        if free.closed {
            return Err(VmError::PoolClosed);
        }
        let Some(index) = free.idle.pop() else {
            return Ok(None);
        };
        drop(free);
        Ok(Some(PooledVm {
            pool: self,
            index,
            vm: self.slots[index].lock(),
        }))
    }

    /// Apply `f` to every instance while holding all of them.  The first
    /// instance decides the outcome: if `f` fails there, no instance has
    /// changed.  A later instance that fails on its own is replaced by a
    /// clone of the first; only a failing clone is reported after the
    /// first instance succeeded.
    fn each(&self, mut f: impl FnMut(&mut Vm) -> VmResult<()>) -> VmResult<()> {
        if self.free.lock().closed {
            return Err(VmError::PoolClosed);
        }
        let mut guards: Vec<_> = self.slots.iter().map(Mutex::lock).collect();
        let Some((first, rest)) = guards.split_first_mut() else {
            return Ok(());
        };
        f(&mut **first)?;
        for (i, vm) in rest.iter_mut().enumerate() {
            if let Err(e) = f(&mut **vm) {
                tracing::warn!(instance = i + 1, error = %e, "update failed, replacing instance");
                **vm = first.try_clone()?;
            }
        }
        Ok(())
    }

    /// Replace policy and data on every instance.
    pub fn set_policy_data(&self, policy: &[u8], data: Option<&[u8]>) -> VmResult<()> {
        self.each(|vm| vm.set_policy_data(policy, data))
    }

    /// Set a data path on every instance.
    pub fn set_data_path(&self, path: &[&str], value: &Value) -> VmResult<()> {
        self.each(|vm| vm.set_data_path(path, value))
    }

    pub fn remove_data_path(&self, path: &[&str]) -> VmResult<()> {
        self.each(|vm| vm.remove_data_path(path))
    }

    /// Refuse further acquisitions and wake every waiter.
    pub fn close(&self) {
        self.free.lock().closed = true;
        self.released.notify_all();
    }
}

/// An instance on loan from a [`VmPool`]; returned on drop.
pub struct PooledVm<'a> {
    pool: &'a VmPool,
    index: usize,
    vm: MutexGuard<'a, Vm>,
}

impl Deref for PooledVm<'_> {
    type Target = Vm;

    fn deref(&self) -> &Vm {
        &self.vm
    }
}

impl DerefMut for PooledVm<'_> {
    fn deref_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

impl Drop for PooledVm<'_> {
    fn drop(&mut self) {
        self.pool.free.lock().idle.push(self.index);
        self.pool.released.notify_one();
    }
}
