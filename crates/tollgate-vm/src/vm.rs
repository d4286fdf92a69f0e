//! A loaded policy instance.
//!
//! Memory layout of a loaded VM:
//!
//! ```text
//! .. base_heap_ptr            module strings and names
//! base_heap_ptr .. eval_ptr   data document (and any patches applied to it)
//! eval_ptr ..                 scratch, reclaimed before every evaluation
//! ```
//!
//! Everything an evaluation allocates lives above `eval_ptr`, so rewinding
//! the heap pointer to it discards the previous evaluation wholesale.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tollgate_codegen::abi;
use tollgate_codegen::types::{
    ABI_MINOR_VERSION_GLOBAL, ABI_VERSION, ABI_VERSION_GLOBAL, EXPORT_BUILTINS, EXPORT_ENTRYPOINTS,
    EXPORT_EVAL, EXPORT_ONE_SHOT_EVAL, HEAP_PTR_GLOBAL, HOST_MODULE, MEMORY_IMPORT,
    ONE_SHOT_MINOR_VERSION, TYPE_NUMBER, TYPE_OBJECT, TYPE_STRING,
};
use wasmi::{
    AsContextMut, Engine, Instance, Linker, Memory, MemoryType, Module, Store, TypedFunc,
    WasmParams, WasmResults,
};

use crate::builtins::{self, Hooks, InterQueryCache, PrintHook};
use crate::config::VmConfig;
use crate::error::{code, VmError, VmResult};
use crate::externs::{self, HostState};
use crate::json;
use crate::value::{self, GuestHeap, Heap};

/// Per-call inputs to [`Vm::eval`].
#[derive(Default)]
pub struct EvalOptions {
    /// Raw JSON input document.
    pub input: Option<Vec<u8>>,
    /// Source of randomness for `rand.intn`.
    pub seed: Option<Box<dyn Read + Send>>,
    /// Clock reading for `time.now_ns`; the wall clock when unset.
    pub now: Option<SystemTime>,
    pub cache: Option<Arc<InterQueryCache>>,
    pub print: Option<PrintHook>,
    /// Dispatched builtins allowed to run; all of them when unset.
    pub capabilities: Option<HashSet<String>>,
    /// Checked before each dispatched builtin call.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl EvalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_seed(mut self, seed: impl Read + Send + 'static) -> Self {
        self.seed = Some(Box::new(seed));
        self
    }

    pub fn with_now(mut self, now: SystemTime) -> Self {
        self.now = Some(now);
        self
    }

    pub fn with_cache(mut self, cache: Arc<InterQueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_print(mut self, print: impl FnMut(&str) + Send + 'static) -> Self {
        self.print = Some(Box::new(print));
        self
    }

    pub fn with_capabilities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }
}

/// A compiled policy instantiated in `wasmi`, with its data loaded.
pub struct Vm {
    store: Store<HostState>,
    memory: Memory,
    policy: Arc<Vec<u8>>,
    config: VmConfig,
    abi_version: (i32, i32),
    entrypoints: BTreeMap<String, i32>,
    exports: Exports,
    base_heap_ptr: u32,
    eval_heap_ptr: u32,
    /// Address of the data document, `0` when there is none.
    data_addr: u32,
}

/// Guest functions the VM calls, resolved once per instance.
struct Exports {
    builtins: TypedFunc<(), i32>,
    entrypoints: TypedFunc<(), i32>,
    /// Present from ABI minor version 2.
    one_shot: Option<TypedFunc<(i32, i32, i32, i32, i32), i32>>,
    eval: TypedFunc<i32, i32>,
    ctx_new: TypedFunc<(), i32>,
    ctx_set_input: TypedFunc<(i32, i32), ()>,
    ctx_set_data: TypedFunc<(i32, i32), ()>,
    ctx_set_entrypoint: TypedFunc<(i32, i32), ()>,
    ctx_get_result: TypedFunc<i32, i32>,
}

impl Exports {
    fn resolve(instance: &Instance, store: &Store<HostState>, minor: i32) -> VmResult<Self> {
        fn typed<P: WasmParams, R: WasmResults>(
            instance: &Instance,
            store: &Store<HostState>,
            name: &str,
        ) -> VmResult<TypedFunc<P, R>> {
            instance
                .get_typed_func(store, name)
                .map_err(|e| VmError::Instantiate(format!("export {name}: {e}")))
        }

        let one_shot = if minor >= ONE_SHOT_MINOR_VERSION {
            Some(typed(instance, store, EXPORT_ONE_SHOT_EVAL)?)
        } else {
            None
        };
        Ok(Self {
            builtins: typed(instance, store, EXPORT_BUILTINS)?,
            entrypoints: typed(instance, store, EXPORT_ENTRYPOINTS)?,
            one_shot,
            eval: typed(instance, store, EXPORT_EVAL)?,
            ctx_new: typed(instance, store, abi::OPA_EVAL_CTX_NEW)?,
            ctx_set_input: typed(instance, store, abi::OPA_EVAL_CTX_SET_INPUT)?,
            ctx_set_data: typed(instance, store, abi::OPA_EVAL_CTX_SET_DATA)?,
            ctx_set_entrypoint: typed(instance, store, abi::OPA_EVAL_CTX_SET_ENTRYPOINT)?,
            ctx_get_result: typed(instance, store, abi::OPA_EVAL_CTX_GET_RESULT)?,
        })
    }
}

/// Call `func`, preferring the cause an extern recorded over the bare trap.
fn call<P: WasmParams, R: WasmResults>(
    store: &mut Store<HostState>,
    func: &TypedFunc<P, R>,
    params: P,
) -> VmResult<R> {
    func.call(&mut *store, params).map_err(|e| {
        store
            .data_mut()
            .error
            .take()
            .unwrap_or_else(|| VmError::Trap(e.to_string()))
    })
}

fn instantiate_error(e: impl Display) -> VmError {
    VmError::Instantiate(e.to_string())
}

impl Vm {
    /// Instantiate `policy` and parse `data` into it once.
    pub fn load(policy: impl Into<Vec<u8>>, data: Option<&[u8]>, config: VmConfig) -> VmResult<Self> {
        let data = data.map(serde_json::from_slice::<Value>).transpose()?;
        let mut vm = Self::instantiate(Arc::new(policy.into()), config)?;
        vm.load_data(data.as_ref())?;
        tracing::debug!(
            entrypoints = vm.entrypoints.len(),
            base = vm.base_heap_ptr,
            eval = vm.eval_heap_ptr,
            "policy loaded"
        );
        Ok(vm)
    }

    fn instantiate(policy: Arc<Vec<u8>>, config: VmConfig) -> VmResult<Self> {
        let engine = Engine::default();
        let module = Module::new(&engine, &policy[..]).map_err(instantiate_error)?;
        let mut store = Store::new(&engine, HostState::default());

        let ty = MemoryType::new(config.memory_min_pages, Some(config.memory_max_pages))
            .map_err(instantiate_error)?;
        let memory = Memory::new(&mut store, ty).map_err(instantiate_error)?;

        let mut linker = Linker::<HostState>::new(&engine);
        linker
            .define(HOST_MODULE, MEMORY_IMPORT, memory)
            .map_err(instantiate_error)?;
        externs::link(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(instantiate_error)?
            .start(&mut store)
            .map_err(instantiate_error)?;

        let heap_ptr = instance
            .get_global(&store, HEAP_PTR_GLOBAL)
            .ok_or_else(|| VmError::Instantiate(format!("missing {HEAP_PTR_GLOBAL} export")))?;
        store.data_mut().memory = Some(memory);
        store.data_mut().heap_ptr = Some(heap_ptr);

        let global = |name: &str| {
            instance
                .get_global(&store, name)
                .and_then(|g| g.get(&store).i32())
        };
        let major = global(ABI_VERSION_GLOBAL)
            .ok_or_else(|| VmError::Instantiate(format!("missing {ABI_VERSION_GLOBAL} export")))?;
        let minor = global(ABI_MINOR_VERSION_GLOBAL).unwrap_or(0);
        if major != ABI_VERSION {
            return Err(VmError::Instantiate(format!(
                "unsupported ABI version {major}.{minor}"
            )));
        }

        let exports = Exports::resolve(&instance, &store, minor)?;
        let mut vm = Self {
            store,
            memory,
            policy,
            config,
            abi_version: (major, minor),
            entrypoints: BTreeMap::new(),
            exports,
            base_heap_ptr: 0,
            eval_heap_ptr: 0,
            data_addr: 0,
        };

        let start = vm.heap()?.heap_ptr()?;
        vm.read_builtins()?;
        vm.read_entrypoints()?;
        vm.heap()?.set_heap_ptr(start)?;
        Ok(vm)
    }

    fn heap(&mut self) -> VmResult<GuestHeap<'_>> {
        GuestHeap::attach(self.store.as_context_mut())
    }

    /// Read a `{name: id}` table returned by the export `name`.
    fn read_table(&mut self, name: &str) -> VmResult<Vec<(String, i32)>> {
        let func = if name == EXPORT_BUILTINS {
            &self.exports.builtins
        } else {
            &self.exports.entrypoints
        };
        let table = call(&mut self.store, func, ())? as u32;
        let heap = self.heap()?;
        if value::type_of(&heap, table)? != TYPE_OBJECT {
            return Err(VmError::Instantiate(format!("{name}() did not return an object")));
        }
        let mut out = Vec::new();
        for (k, v) in value::entries(&heap, table)? {
            if value::type_of(&heap, k)? != TYPE_STRING || value::type_of(&heap, v)? != TYPE_NUMBER {
                return Err(VmError::Instantiate(format!("malformed {name}() table")));
            }
            let id = value::number(&heap, v)?
                .as_i64()
                .and_then(|id| i32::try_from(id).ok())
                .ok_or_else(|| VmError::Instantiate(format!("bad id in {name}() table")))?;
            out.push((value::str_value(&heap, k)?.to_string(), id));
        }
        Ok(out)
    }

    fn read_builtins(&mut self) -> VmResult<()> {
        let table = self.read_table(EXPORT_BUILTINS)?;
        let mut resolved = Vec::new();
        for (name, id) in table {
            let builtin =
                builtins::lookup(&name).ok_or_else(|| VmError::UnknownBuiltin(name.clone()))?;
            let slot = usize::try_from(id)
                .map_err(|_| VmError::Instantiate(format!("negative id for builtin {name}")))?;
            if resolved.len() <= slot {
                resolved.resize(slot + 1, None);
            }
            resolved[slot] = Some(builtin);
        }
        self.store.data_mut().builtins = resolved;
        Ok(())
    }

    fn read_entrypoints(&mut self) -> VmResult<()> {
        self.entrypoints = self.read_table(EXPORT_ENTRYPOINTS)?.into_iter().collect();
        Ok(())
    }

    /// Materialize `data` at the current heap pointer and fix the base and
    /// eval checkpoints around it.
    fn load_data(&mut self, data: Option<&Value>) -> VmResult<()> {
        let mut heap = self.heap()?;
        let base = heap.heap_ptr()?;
        let addr = match data {
            Some(doc) => json::from_json(&mut heap, doc)?,
            None => 0,
        };
        let end = heap.heap_ptr()?;
        self.base_heap_ptr = base;
        self.data_addr = addr;
        self.eval_heap_ptr = end;
        Ok(())
    }

    // ── Introspection ────────────────────────────────────────────────────

    /// Entrypoint names and their ids.
    pub fn entrypoints(&self) -> &BTreeMap<String, i32> {
        &self.entrypoints
    }

    pub fn entrypoint_id(&self, name: &str) -> VmResult<i32> {
        self.entrypoints
            .get(name)
            .copied()
            .ok_or_else(|| VmError::UnknownEntrypoint(name.to_string()))
    }

    /// `(major, minor)` ABI version the module was built against.
    pub fn abi_version(&self) -> (i32, i32) {
        self.abi_version
    }

    pub fn policy(&self) -> &[u8] {
        &self.policy
    }

    // ── Evaluation ───────────────────────────────────────────────────────

    /// Evaluate an entrypoint and return the result set as raw JSON text.
    pub fn eval(&mut self, entrypoint: i32, options: EvalOptions) -> VmResult<String> {
        if !self.entrypoints.values().any(|id| *id == entrypoint) {
            return Err(VmError::UnknownEntrypoint(entrypoint.to_string()));
        }
        let EvalOptions {
            input,
            seed,
            now,
            cache,
            print,
            capabilities,
            cancel,
        } = options;
        if let Some(bytes) = &input {
            serde_json::from_slice::<serde::de::IgnoredAny>(bytes)?;
        }
        if cancel.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(VmError::Cancelled);
        }

        let now_ns = now
            .unwrap_or_else(SystemTime::now)
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        let state = self.store.data_mut();
        state.error = None;
        state.hooks = Hooks {
            now_ns,
            seed,
            cache,
            print,
            capabilities,
            cancel,
            ..Hooks::default()
        };

        let eval_ptr = self.eval_heap_ptr;
        self.heap()?.set_heap_ptr(eval_ptr)?;
        let result = if self.abi_version.1 >= ONE_SHOT_MINOR_VERSION {
            self.eval_one_shot(entrypoint, input.as_deref())
        } else {
            self.eval_legacy(entrypoint, input.as_deref())
        };
        self.store.data_mut().hooks = Hooks::default();

        let addr = result?;
        let heap = self.heap()?;
        let text = String::from_utf8(heap.cstr(addr)?.to_vec())
            .map_err(|e| VmError::Heap(format!("result is not UTF-8: {e}")))?;
        tracing::debug!(entrypoint, bytes = text.len(), "evaluated");
        Ok(text)
    }

    /// Single call into `opa_eval` with the raw input copied above the
    /// eval checkpoint.
    fn eval_one_shot(&mut self, entrypoint: i32, input: Option<&[u8]>) -> VmResult<u32> {
        let mut heap = self.heap()?;
        let (input_ptr, input_len) = match input {
            Some(bytes) => {
                let ptr = heap.alloc(bytes.len() as u32)?;
                heap.write(ptr, bytes)?;
                (ptr, bytes.len() as u32)
            }
            None => (0, 0),
        };
        let heap_ptr = heap.heap_ptr()?;
        let data = self.data_addr;
        let func = self.exports.one_shot.as_ref().ok_or_else(|| {
            VmError::Instantiate(format!("missing {EXPORT_ONE_SHOT_EVAL} export"))
        })?;
        let out = call(
            &mut self.store,
            func,
            (
                entrypoint,
                data as i32,
                input_ptr as i32,
                input_len as i32,
                heap_ptr as i32,
            ),
        )?;
        Ok(out as u32)
    }

    /// Context-based evaluation for modules older than `opa_eval`.
    fn eval_legacy(&mut self, entrypoint: i32, input: Option<&[u8]>) -> VmResult<u32> {
        let ctx = call(&mut self.store, &self.exports.ctx_new, ())?;
        if let Some(bytes) = input {
            let mut heap = self.heap()?;
            let parsed = json::parse_json(&mut heap, bytes)?;
            call(&mut self.store, &self.exports.ctx_set_input, (ctx, parsed as i32))?;
        }
        if self.data_addr != 0 {
            let data = self.data_addr as i32;
            call(&mut self.store, &self.exports.ctx_set_data, (ctx, data))?;
        }
        call(&mut self.store, &self.exports.ctx_set_entrypoint, (ctx, entrypoint))?;
        call(&mut self.store, &self.exports.eval, ctx)?;
        let result = call(&mut self.store, &self.exports.ctx_get_result, ctx)? as u32;
        let mut heap = self.heap()?;
        json::dump_json(&mut heap, result)
    }

    // ── Data ─────────────────────────────────────────────────────────────

    /// Set `value` at `path` in the data document.  An empty path replaces
    /// the whole document; a missing document starts out as `{}`.
    pub fn set_data_path(&mut self, path: &[&str], doc: &Value) -> VmResult<()> {
        let (eval_ptr, data) = (self.eval_heap_ptr, self.data_addr);
        let mut heap = self.heap()?;
        heap.set_heap_ptr(eval_ptr)?;

        let patched = (|| -> VmResult<(u32, i32)> {
            let v = json::from_json(&mut heap, doc)?;
            match path {
                [] => Ok((v, code::OK)),
                _ => {
                    let root = if data == 0 { value::object(&mut heap)? } else { data };
                    let segments = value::path(&mut heap, path)?;
                    Ok((root, value::add_path(&mut heap, root, segments, v)?))
                }
            }
        })();
        let root = settle(&mut heap, eval_ptr, path, patched)?;

        let end = heap.heap_ptr()?;
        self.data_addr = root;
        self.eval_heap_ptr = end;
        tracing::debug!(path = %display_path(path), "data path set");
        Ok(())
    }

    /// Remove the member at `path`.  An empty path resets the document to
    /// `{}`.
    pub fn remove_data_path(&mut self, path: &[&str]) -> VmResult<()> {
        let (eval_ptr, data) = (self.eval_heap_ptr, self.data_addr);
        let mut heap = self.heap()?;
        heap.set_heap_ptr(eval_ptr)?;

        let patched = (|| -> VmResult<(u32, i32)> {
            match path {
                [] => Ok((value::object(&mut heap)?, code::OK)),
                _ if data == 0 => Ok((0, code::INVALID_PATH)),
                _ => {
                    let segments = value::path(&mut heap, path)?;
                    Ok((data, value::remove_path(&mut heap, data, segments)?))
                }
            }
        })();
        let root = settle(&mut heap, eval_ptr, path, patched)?;

        let end = heap.heap_ptr()?;
        self.data_addr = root;
        self.eval_heap_ptr = end;
        tracing::debug!(path = %display_path(path), "data path removed");
        Ok(())
    }

    /// Read the subtree at `path`, `None` when nothing is there.
    pub fn data_path(&mut self, path: &[&str]) -> VmResult<Option<Value>> {
        let (eval_ptr, data) = (self.eval_heap_ptr, self.data_addr);
        if data == 0 {
            return Ok(None);
        }
        let mut heap = self.heap()?;
        heap.set_heap_ptr(eval_ptr)?;
        let segments = value::path(&mut heap, path)?;
        let segments = value::elems(&heap, segments)?;
        let node = value::lookup(&heap, data, &segments)?;
        let out = if node == 0 {
            None
        } else {
            Some(json::to_json(&heap, node)?)
        };
        heap.set_heap_ptr(eval_ptr)?;
        Ok(out)
    }

    /// Swap in new policy bytes and data.  Identical bytes keep the
    /// instance and only reload the data.
    pub fn set_policy_data(&mut self, policy: &[u8], data: Option<&[u8]>) -> VmResult<()> {
        let data = data.map(serde_json::from_slice::<Value>).transpose()?;
        if policy != self.policy.as_slice() {
            let mut fresh = Self::instantiate(Arc::new(policy.to_vec()), self.config.clone())?;
            fresh.load_data(data.as_ref())?;
            *self = fresh;
            tracing::debug!("policy replaced");
        } else {
            let base = self.base_heap_ptr;
            self.heap()?.set_heap_ptr(base)?;
            self.load_data(data.as_ref())?;
            tracing::debug!("data reloaded");
        }
        Ok(())
    }

    /// A twin instance on the same module, with the data region copied over
    /// instead of parsed again.
    pub fn try_clone(&self) -> VmResult<Self> {
        let mut twin = Self::instantiate(self.policy.clone(), self.config.clone())?;
        let (base, end) = (self.base_heap_ptr, self.eval_heap_ptr);
        let snapshot = self
            .memory
            .data(&self.store)
            .get(base as usize..end as usize)
            .ok_or_else(|| VmError::Heap("data region out of bounds".into()))?
            .to_vec();

        let mut heap = twin.heap()?;
        if heap.heap_ptr()? != base {
            return Err(VmError::Instantiate(
                "clone diverged from the source layout".into(),
            ));
        }
        heap.reserve(end)?;
        heap.write(base, &snapshot)?;
        heap.set_heap_ptr(end)?;

        twin.base_heap_ptr = base;
        twin.eval_heap_ptr = end;
        twin.data_addr = self.data_addr;
        Ok(twin)
    }
}

/// Turn a patch outcome into the new data root, rewinding the heap to
/// `eval_ptr` when the patch was refused or ran out of memory.
fn settle(
    heap: &mut GuestHeap<'_>,
    eval_ptr: u32,
    path: &[&str],
    outcome: VmResult<(u32, i32)>,
) -> VmResult<u32> {
    let err = match outcome {
        Ok((root, code::OK)) => return Ok(root),
        Ok((_, rc)) => VmError::DataPath {
            path: display_path(path),
            code: rc,
        },
        Err(e) => e,
    };
    heap.set_heap_ptr(eval_ptr)?;
    Err(err)
}

fn display_path(path: &[&str]) -> String {
    format!("/{}", path.join("/"))
}
