//! Host externs.
//!
//! Every entry of the ABI extern table is registered on a `wasmi::Linker`
//! under `env`.  Each one runs against the guest heap; a failure is recorded
//! on [`HostState::error`] and the call traps, so the VM can report the
//! original error rather than the trap text.

use tollgate_codegen::abi;
use tollgate_codegen::types::{
    HOST_MODULE, TYPE_ARRAY, TYPE_BOOLEAN, TYPE_NULL, TYPE_NUMBER, TYPE_OBJECT, TYPE_SET,
    TYPE_STRING,
};
use wasmi::{AsContextMut, Caller, Global, Linker, Memory};

use crate::builtins::{self, Builtin, Hooks};
use crate::error::{VmError, VmResult};
use crate::json;
use crate::value::{self, GuestHeap, Heap};

/// Store data of a policy instance.
#[derive(Default)]
pub struct HostState {
    pub(crate) memory: Option<Memory>,
    pub(crate) heap_ptr: Option<Global>,
    /// Dispatched builtins by the id the module assigned.
    pub(crate) builtins: Vec<Option<&'static Builtin>>,
    pub(crate) hooks: Hooks,
    /// Cause of the most recent trap raised by an extern.
    pub(crate) error: Option<VmError>,
}

/// Run `f` on the caller's heap, turning an error into a trap.
fn host<R>(
    caller: &mut Caller<'_, HostState>,
    f: impl FnOnce(&mut GuestHeap<'_>) -> VmResult<R>,
) -> Result<R, wasmi::Error> {
    let result = GuestHeap::attach(caller.as_context_mut()).and_then(|mut heap| f(&mut heap));
    result.map_err(|e| {
        let msg = e.to_string();
        caller.data_mut().error = Some(e);
        wasmi::Error::new(msg)
    })
}

/// Call dispatched builtin `id` with the hooks lent out of the host state.
fn dispatch(heap: &mut GuestHeap<'_>, id: i32, args: &[u32]) -> VmResult<u32> {
    let builtin = usize::try_from(id)
        .ok()
        .and_then(|i| heap.state().builtins.get(i).copied().flatten())
        .ok_or_else(|| VmError::UnknownBuiltin(format!("id {id}")))?;
    let mut hooks = std::mem::take(&mut heap.state_mut().hooks);
    let result = builtins::call(&mut hooks, heap, builtin, args);
    heap.state_mut().hooks = hooks;
    result
}

fn addr(v: VmResult<u32>) -> VmResult<i32> {
    v.map(|a| a as i32)
}

macro_rules! link {
    ($linker:ident, $name:expr, |$h:ident $(, $arg:ident: $ty:ty)*| -> $ret:ty $body:block) => {
        $linker
            .func_wrap(
                HOST_MODULE,
                $name,
                |mut caller: Caller<'_, HostState>, $($arg: $ty),*| -> Result<$ret, wasmi::Error> {
                    host(&mut caller, |$h: &mut GuestHeap<'_>| -> VmResult<$ret> { $body })
                },
            )
            .map_err(|e| VmError::Instantiate(format!("link {}: {e}", $name)))?;
    };
}

/// Register every host extern on `linker`.
pub fn link(linker: &mut Linker<HostState>) -> VmResult<()> {
    // ── Control ──────────────────────────────────────────────────────────
    link!(linker, abi::OPA_ABORT, |h, msg: i32| -> () {
        let text = String::from_utf8_lossy(h.cstr(msg as u32)?).into_owned();
        Err(VmError::Abort(text))
    });
    link!(linker, abi::BUILTIN_DISPATCHERS[0], |h, id: i32, _ctx: i32| -> i32 {
        addr(dispatch(h, id, &[]))
    });
    link!(linker, abi::BUILTIN_DISPATCHERS[1], |h, id: i32, _ctx: i32, a: i32| -> i32 {
        addr(dispatch(h, id, &[a as u32]))
    });
    link!(linker, abi::BUILTIN_DISPATCHERS[2], |h, id: i32, _ctx: i32, a: i32, b: i32| -> i32 {
        addr(dispatch(h, id, &[a as u32, b as u32]))
    });
    link!(linker, abi::BUILTIN_DISPATCHERS[3], |h, id: i32, _ctx: i32, a: i32, b: i32, c: i32| -> i32 {
        addr(dispatch(h, id, &[a as u32, b as u32, c as u32]))
    });
    link!(linker, abi::BUILTIN_DISPATCHERS[4], |h, id: i32, _ctx: i32, a: i32, b: i32, c: i32, d: i32| -> i32 {
        addr(dispatch(h, id, &[a as u32, b as u32, c as u32, d as u32]))
    });

    // ── Allocation ───────────────────────────────────────────────────────
    link!(linker, abi::OPA_MALLOC, |h, size: i32| -> i32 {
        addr(h.alloc(size as u32))
    });
    link!(linker, abi::OPA_FREE, |_h, _ptr: i32| -> () { Ok(()) });

    // ── Serialization ────────────────────────────────────────────────────
    link!(linker, abi::OPA_JSON_PARSE, |h, ptr: i32, len: i32| -> i32 {
        let text = h.bytes(ptr as u32, len as u32)?.to_vec();
        match json::parse_json(h, &text) {
            Ok(v) => Ok(v as i32),
            Err(VmError::Json(e)) => {
                tracing::debug!(error = %e, "opa_json_parse rejected input");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    });
    link!(linker, abi::OPA_JSON_DUMP, |h, v: i32| -> i32 {
        addr(json::dump_json(h, v as u32))
    });
    link!(linker, abi::OPA_VALUE_PARSE, |h, ptr: i32, len: i32| -> i32 {
        let text = h.bytes(ptr as u32, len as u32)?.to_vec();
        match json::parse_value(h, &text) {
            Ok(v) => Ok(v as i32),
            Err(e) => {
                tracing::debug!(error = %e, "opa_value_parse rejected input");
                Ok(0)
            }
        }
    });
    link!(linker, abi::OPA_VALUE_DUMP, |h, v: i32| -> i32 {
        let text = json::dump_value(h, v as u32)?;
        addr(json::write_terminated(h, text.as_bytes()))
    });

    // ── Construction ─────────────────────────────────────────────────────
    link!(linker, abi::OPA_NULL, |h| -> i32 { addr(value::null(h)) });
    link!(linker, abi::OPA_BOOLEAN, |h, b: i32| -> i32 {
        addr(value::boolean(h, b != 0))
    });
    link!(linker, abi::OPA_NUMBER_INT, |h, i: i64| -> i32 {
        addr(value::number_int(h, i))
    });
    link!(linker, abi::OPA_NUMBER_FLOAT, |h, f: f64| -> i32 {
        addr(value::number_float(h, f))
    });
    link!(linker, abi::OPA_NUMBER_REF, |h, ptr: i32, len: i32| -> i32 {
        addr(value::number_ref(h, ptr as u32, len as u32))
    });
    link!(linker, abi::OPA_NUMBER_SIZE, |h, n: i32| -> i32 {
        addr(value::number_int(h, i64::from(n as u32)))
    });
    link!(linker, abi::OPA_STRING_TERMINATED, |h, s: i32| -> i32 {
        addr(value::string_terminated(h, s as u32))
    });
    link!(linker, abi::OPA_ARRAY_WITH_CAP, |h, cap: i32| -> i32 {
        addr(value::array_with_cap(h, cap as u32))
    });
    link!(linker, abi::OPA_OBJECT, |h| -> i32 { addr(value::object(h)) });
    link!(linker, abi::OPA_SET, |h| -> i32 { addr(value::set(h)) });

    // ── Mutation ─────────────────────────────────────────────────────────
    link!(linker, abi::OPA_ARRAY_APPEND, |h, arr: i32, v: i32| -> () {
        value::array_append(h, arr as u32, v as u32)
    });
    link!(linker, abi::OPA_OBJECT_INSERT, |h, obj: i32, k: i32, v: i32| -> () {
        value::object_insert(h, obj as u32, k as u32, v as u32)
    });
    link!(linker, abi::OPA_SET_ADD, |h, set: i32, v: i32| -> () {
        value::set_add(h, set as u32, v as u32)
    });
    link!(linker, abi::OPA_VALUE_MERGE, |h, a: i32, b: i32| -> i32 {
        addr(value::merge(h, a as u32, b as u32))
    });
    link!(linker, abi::OPA_VALUE_BOOLEAN_SET, |h, v: i32, b: i32| -> () {
        value::boolean_set(h, v as u32, b != 0)
    });
    link!(linker, abi::OPA_VALUE_NUMBER_SET_INT, |h, v: i32, i: i64| -> () {
        value::number_set_int(h, v as u32, i)
    });

    // ── Inspection ───────────────────────────────────────────────────────
    link!(linker, abi::OPA_VALUE_GET, |h, v: i32, k: i32| -> i32 {
        addr(value::get(h, v as u32, k as u32))
    });
    link!(linker, abi::OPA_VALUE_ITER, |h, v: i32, prev: i32| -> i32 {
        addr(value::iter(h, v as u32, prev as u32))
    });
    link!(linker, abi::OPA_VALUE_LENGTH, |h, v: i32| -> i32 {
        addr(value::length(h, v as u32))
    });
    link!(linker, abi::OPA_VALUE_TYPE, |h, v: i32| -> i32 {
        value::type_of(h, v as u32)
    });
    link!(linker, abi::OPA_VALUE_COMPARE, |h, a: i32, b: i32| -> i32 {
        Ok(value::compare(h, a as u32, b as u32)? as i32)
    });

    // ── Patch ────────────────────────────────────────────────────────────
    link!(linker, abi::OPA_VALUE_ADD_PATH, |h, base: i32, path: i32, v: i32| -> i32 {
        value::add_path(h, base as u32, path as u32, v as u32)
    });
    link!(linker, abi::OPA_VALUE_REMOVE_PATH, |h, base: i32, path: i32| -> i32 {
        value::remove_path(h, base as u32, path as u32)
    });

    link_natives(linker)
}

fn link_natives(linker: &mut Linker<HostState>) -> VmResult<()> {
    link!(linker, abi::OPA_ARITH_PLUS, |h, a: i32, b: i32| -> i32 {
        addr(builtins::arith_plus(h, a as u32, b as u32))
    });
    link!(linker, abi::OPA_ARITH_MINUS, |h, a: i32, b: i32| -> i32 {
        addr(builtins::arith_minus(h, a as u32, b as u32))
    });
    link!(linker, abi::OPA_ARITH_MULTIPLY, |h, a: i32, b: i32| -> i32 {
        addr(builtins::arith_multiply(h, a as u32, b as u32))
    });
    link!(linker, abi::OPA_ARITH_DIVIDE, |h, a: i32, b: i32| -> i32 {
        addr(builtins::arith_divide(h, a as u32, b as u32))
    });
    link!(linker, abi::OPA_ARITH_REM, |h, a: i32, b: i32| -> i32 {
        addr(builtins::arith_rem(h, a as u32, b as u32))
    });
    link!(linker, abi::OPA_ARITH_ABS, |h, a: i32| -> i32 {
        addr(builtins::arith_abs(h, a as u32))
    });
    link!(linker, abi::OPA_AGG_COUNT, |h, a: i32| -> i32 {
        addr(builtins::agg_count(h, a as u32))
    });
    link!(linker, abi::OPA_AGG_SUM, |h, a: i32| -> i32 {
        addr(builtins::agg_sum(h, a as u32))
    });
    link!(linker, abi::OPA_AGG_MAX, |h, a: i32| -> i32 {
        addr(builtins::agg_max(h, a as u32))
    });
    link!(linker, abi::OPA_AGG_MIN, |h, a: i32| -> i32 {
        addr(builtins::agg_min(h, a as u32))
    });
    link!(linker, abi::OPA_STRINGS_CONCAT, |h, a: i32, b: i32| -> i32 {
        addr(builtins::strings_concat(h, a as u32, b as u32))
    });
    link!(linker, abi::OPA_STRINGS_CONTAINS, |h, a: i32, b: i32| -> i32 {
        addr(builtins::strings_contains(h, a as u32, b as u32))
    });
    link!(linker, abi::OPA_STRINGS_STARTSWITH, |h, a: i32, b: i32| -> i32 {
        addr(builtins::strings_startswith(h, a as u32, b as u32))
    });
    link!(linker, abi::OPA_STRINGS_ENDSWITH, |h, a: i32, b: i32| -> i32 {
        addr(builtins::strings_endswith(h, a as u32, b as u32))
    });
    link!(linker, abi::OPA_STRINGS_LOWER, |h, a: i32| -> i32 {
        addr(builtins::strings_lower(h, a as u32))
    });
    link!(linker, abi::OPA_STRINGS_UPPER, |h, a: i32| -> i32 {
        addr(builtins::strings_upper(h, a as u32))
    });
    link!(linker, abi::OPA_TYPES_IS_NUMBER, |h, a: i32| -> i32 {
        addr(builtins::types_is(h, a as u32, TYPE_NUMBER))
    });
    link!(linker, abi::OPA_TYPES_IS_STRING, |h, a: i32| -> i32 {
        addr(builtins::types_is(h, a as u32, TYPE_STRING))
    });
    link!(linker, abi::OPA_TYPES_IS_BOOLEAN, |h, a: i32| -> i32 {
        addr(builtins::types_is(h, a as u32, TYPE_BOOLEAN))
    });
    link!(linker, abi::OPA_TYPES_IS_ARRAY, |h, a: i32| -> i32 {
        addr(builtins::types_is(h, a as u32, TYPE_ARRAY))
    });
    link!(linker, abi::OPA_TYPES_IS_OBJECT, |h, a: i32| -> i32 {
        addr(builtins::types_is(h, a as u32, TYPE_OBJECT))
    });
    link!(linker, abi::OPA_TYPES_IS_SET, |h, a: i32| -> i32 {
        addr(builtins::types_is(h, a as u32, TYPE_SET))
    });
    link!(linker, abi::OPA_TYPES_IS_NULL, |h, a: i32| -> i32 {
        addr(builtins::types_is(h, a as u32, TYPE_NULL))
    });
    link!(linker, abi::OPA_TYPES_NAME, |h, a: i32| -> i32 {
        addr(builtins::types_name(h, a as u32))
    });
    link!(linker, abi::OPA_REGEX_MATCH, |h, a: i32, b: i32| -> i32 {
        addr(builtins::regex_match(h, a as u32, b as u32))
    });
    Ok(())
}
