//! Builtin functions.
//!
//! Natives are linked as dedicated externs and called directly by compiled
//! code.  Everything else goes through the `opa_builtin{N}` dispatchers,
//! keyed by the ids the module's `builtins()` export assigns; those calls
//! see the per-evaluation [`Hooks`].
//!
//! Builtins return `0` (undefined) when an operand has the wrong type.

use std::collections::hash_map::RandomState;
use std::collections::{HashMap, HashSet};
use std::hash::{BuildHasher, Hasher};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tollgate_codegen::types::{
    TYPE_ARRAY, TYPE_BOOLEAN, TYPE_NULL, TYPE_NUMBER, TYPE_OBJECT, TYPE_SET, TYPE_STRING,
};

use crate::error::{VmError, VmResult};
use crate::json;
use crate::value::{self, Heap, Num};

// ══════════════════════════════════════════════════════════════════════════════
// Evaluation hooks
// ══════════════════════════════════════════════════════════════════════════════

/// Receives each `print` line.
pub type PrintHook = Box<dyn FnMut(&str) + Send>;

/// Per-evaluation state consulted by dispatched builtins.
#[derive(Default)]
pub struct Hooks {
    pub(crate) now_ns: i64,
    pub(crate) seed: Option<Box<dyn Read + Send>>,
    pub(crate) seed_value: Option<u64>,
    pub(crate) rand_memo: HashMap<(String, i64), i64>,
    pub(crate) cache: Option<Arc<InterQueryCache>>,
    pub(crate) print: Option<PrintHook>,
    pub(crate) capabilities: Option<HashSet<String>>,
    pub(crate) cancel: Option<Arc<AtomicBool>>,
}

/// A cache shared across evaluations, and across VMs when the same `Arc` is
/// handed to each.
#[derive(Debug, Default)]
pub struct InterQueryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl InterQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.lock().insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Dispatch
// ══════════════════════════════════════════════════════════════════════════════

pub type BuiltinFn = fn(&mut Hooks, &mut dyn Heap, &[u32]) -> VmResult<u32>;

/// A builtin reachable through the dispatchers.
#[derive(Debug, Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub arity: usize,
    pub func: BuiltinFn,
}

const DISPATCHED: &[Builtin] = &[
    Builtin {
        name: "time.now_ns",
        arity: 0,
        func: time_now_ns,
    },
    Builtin {
        name: "rand.intn",
        arity: 2,
        func: rand_intn,
    },
    Builtin {
        name: "crypto.sha256",
        arity: 1,
        func: crypto_sha256,
    },
    Builtin {
        name: "internal.print",
        arity: 1,
        func: internal_print,
    },
    Builtin {
        name: "json.is_valid",
        arity: 1,
        func: json_is_valid,
    },
];

/// The host implementation of a dispatched builtin.
pub fn lookup(name: &str) -> Option<&'static Builtin> {
    DISPATCHED.iter().find(|b| b.name == name)
}

/// Names of every dispatched builtin the host provides.
pub fn names() -> impl Iterator<Item = &'static str> {
    DISPATCHED.iter().map(|b| b.name)
}

/// Run a dispatched builtin after the cancellation and capability checks.
pub fn call(
    hooks: &mut Hooks,
    h: &mut dyn Heap,
    builtin: &Builtin,
    args: &[u32],
) -> VmResult<u32> {
    if hooks
        .cancel
        .as_ref()
        .is_some_and(|flag| flag.load(Ordering::Relaxed))
    {
        return Err(VmError::Cancelled);
    }
    if let Some(allowed) = &hooks.capabilities {
        if !allowed.contains(builtin.name) {
            return Err(VmError::Builtin(format!(
                "{} is not permitted by the capability set",
                builtin.name
            )));
        }
    }
    if args.len() != builtin.arity {
        return Err(VmError::Builtin(format!(
            "{} expects {} arguments, got {}",
            builtin.name,
            builtin.arity,
            args.len()
        )));
    }
    tracing::trace!(builtin = builtin.name, "dispatching builtin");
    (builtin.func)(hooks, h, args)
}

fn time_now_ns(hooks: &mut Hooks, h: &mut dyn Heap, _: &[u32]) -> VmResult<u32> {
    value::number_int(h, hooks.now_ns)
}

/// `rand.intn(str, n)`: the same `(str, n)` yields the same number within one
/// evaluation.
fn rand_intn(hooks: &mut Hooks, h: &mut dyn Heap, args: &[u32]) -> VmResult<u32> {
    let key = string_arg(h, args[0])?.map(str::to_string);
    let (Some(key), Some(n)) = (key, int_arg(h, args[1])?) else {
        return Ok(0);
    };
    let n = n.checked_abs().unwrap_or(i64::MAX);
    if n == 0 {
        return value::number_int(h, 0);
    }
    let memo_key = (key.clone(), n);
    if let Some(hit) = hooks.rand_memo.get(&memo_key) {
        return value::number_int(h, *hit);
    }

    let seed = match hooks.seed_value {
        Some(seed) => seed,
        None => {
            let seed = match hooks.seed.as_mut() {
                Some(reader) => {
                    let mut buf = [0u8; 8];
                    reader
                        .read_exact(&mut buf)
                        .map_err(|e| VmError::Builtin(format!("rand.intn: seed: {e}")))?;
                    u64::from_le_bytes(buf)
                }
                None => RandomState::new().build_hasher().finish(),
            };
            hooks.seed_value = Some(seed);
            seed
        }
    };

    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(key.as_bytes());
    hasher.update(n.to_le_bytes());
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    let picked = (u64::from_le_bytes(word) % n as u64) as i64;

    hooks.rand_memo.insert(memo_key, picked);
    value::number_int(h, picked)
}

fn crypto_sha256(hooks: &mut Hooks, h: &mut dyn Heap, args: &[u32]) -> VmResult<u32> {
    let Some(input) = string_arg(h, args[0])? else {
        return Ok(0);
    };
    let cache_key = format!("crypto.sha256:{input}");
    let hex = match hooks.cache.as_ref().and_then(|c| c.get(&cache_key)) {
        Some(hex) => hex,
        None => {
            let hex = format!("{:x}", Sha256::digest(input.as_bytes()));
            if let Some(cache) = &hooks.cache {
                cache.insert(cache_key, hex.clone());
            }
            hex
        }
    };
    value::string(h, &hex)
}

/// `internal.print(args)`: each argument arrives as a set of its possible
/// values; an empty set prints as `<undefined>`.
fn internal_print(hooks: &mut Hooks, h: &mut dyn Heap, args: &[u32]) -> VmResult<u32> {
    let mut parts = Vec::new();
    let operands = match value::type_of(h, args[0])? {
        TYPE_ARRAY | TYPE_SET => value::elems(h, args[0])?,
        _ => vec![args[0]],
    };
    for operand in operands {
        if value::type_of(h, operand)? == TYPE_SET {
            let values = value::elems(h, operand)?;
            if values.is_empty() {
                parts.push("<undefined>".to_string());
            }
            for v in values {
                parts.push(print_text(h, v)?);
            }
        } else {
            parts.push(print_text(h, operand)?);
        }
    }
    let line = parts.join(" ");
    match hooks.print.as_mut() {
        Some(print) => print(&line),
        None => tracing::debug!(%line, "print without a print hook"),
    }
    value::boolean(h, true)
}

fn print_text(h: &dyn Heap, v: u32) -> VmResult<String> {
    if value::type_of(h, v)? == TYPE_STRING {
        Ok(value::str_value(h, v)?.to_string())
    } else {
        json::dump_value(h, v)
    }
}

fn json_is_valid(_: &mut Hooks, h: &mut dyn Heap, args: &[u32]) -> VmResult<u32> {
    if value::type_of(h, args[0])? != TYPE_STRING {
        return Ok(0);
    }
    let valid = serde_json::from_slice::<serde::de::IgnoredAny>(value::str_bytes(h, args[0])?)
        .is_ok();
    value::boolean(h, valid)
}

// ══════════════════════════════════════════════════════════════════════════════
// Natives
// ══════════════════════════════════════════════════════════════════════════════

fn num_arg(h: &dyn Heap, v: u32) -> VmResult<Option<Num>> {
    if value::type_of(h, v)? != TYPE_NUMBER {
        return Ok(None);
    }
    value::number(h, v).map(Some)
}

fn int_arg(h: &dyn Heap, v: u32) -> VmResult<Option<i64>> {
    Ok(num_arg(h, v)?.and_then(Num::as_i64))
}

fn string_arg(h: &dyn Heap, v: u32) -> VmResult<Option<&str>> {
    if value::type_of(h, v)? != TYPE_STRING {
        return Ok(None);
    }
    value::str_value(h, v).map(Some)
}

fn arith(
    h: &mut dyn Heap,
    a: u32,
    b: u32,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> VmResult<u32> {
    let (Some(x), Some(y)) = (num_arg(h, a)?, num_arg(h, b)?) else {
        return Ok(0);
    };
    if let (Num::Int(i), Num::Int(j)) = (x, y) {
        if let Some(r) = int_op(i, j) {
            return value::number_int(h, r);
        }
    }
    value::number_from_f64(h, float_op(x.as_f64(), y.as_f64()))
}

pub fn arith_plus(h: &mut dyn Heap, a: u32, b: u32) -> VmResult<u32> {
    arith(h, a, b, i64::checked_add, |x, y| x + y)
}

pub fn arith_minus(h: &mut dyn Heap, a: u32, b: u32) -> VmResult<u32> {
    arith(h, a, b, i64::checked_sub, |x, y| x - y)
}

pub fn arith_multiply(h: &mut dyn Heap, a: u32, b: u32) -> VmResult<u32> {
    arith(h, a, b, i64::checked_mul, |x, y| x * y)
}

/// Division by zero is undefined.
pub fn arith_divide(h: &mut dyn Heap, a: u32, b: u32) -> VmResult<u32> {
    if num_arg(h, b)?.is_some_and(|d| d.as_f64() == 0.0) {
        return Ok(0);
    }
    arith(
        h,
        a,
        b,
        |x, y| match x.checked_rem(y) {
            Some(0) => x.checked_div(y),
            _ => None,
        },
        |x, y| x / y,
    )
}

/// Remainder is defined on integers only.
pub fn arith_rem(h: &mut dyn Heap, a: u32, b: u32) -> VmResult<u32> {
    match (int_arg(h, a)?, int_arg(h, b)?) {
        (Some(x), Some(y)) if y != 0 => match x.checked_rem(y) {
            Some(r) => value::number_int(h, r),
            None => value::number_int(h, 0),
        },
        _ => Ok(0),
    }
}

pub fn arith_abs(h: &mut dyn Heap, a: u32) -> VmResult<u32> {
    match num_arg(h, a)? {
        Some(Num::Int(i)) => match i.checked_abs() {
            Some(r) => value::number_int(h, r),
            None => value::number_from_f64(h, (i as f64).abs()),
        },
        Some(Num::Float(f)) => value::number_from_f64(h, f.abs()),
        None => Ok(0),
    }
}

pub fn agg_count(h: &mut dyn Heap, a: u32) -> VmResult<u32> {
    match value::type_of(h, a)? {
        TYPE_ARRAY | TYPE_OBJECT | TYPE_SET | TYPE_STRING => {
            let n = value::length(h, a)?;
            value::number_int(h, i64::from(n))
        }
        _ => Ok(0),
    }
}

fn numeric_elems(h: &dyn Heap, a: u32) -> VmResult<Option<Vec<Num>>> {
    if !matches!(value::type_of(h, a)?, TYPE_ARRAY | TYPE_SET) {
        return Ok(None);
    }
    let mut out = Vec::new();
    for e in value::elems(h, a)? {
        match num_arg(h, e)? {
            Some(n) => out.push(n),
            None => return Ok(None),
        }
    }
    Ok(Some(out))
}

pub fn agg_sum(h: &mut dyn Heap, a: u32) -> VmResult<u32> {
    let Some(nums) = numeric_elems(h, a)? else {
        return Ok(0);
    };
    let mut int_sum = Some(0i64);
    let mut float_sum = 0.0;
    for n in nums {
        int_sum = match (int_sum, n) {
            (Some(acc), Num::Int(i)) => acc.checked_add(i),
            _ => None,
        };
        float_sum += n.as_f64();
    }
    match int_sum {
        Some(s) => value::number_int(h, s),
        None => value::number_from_f64(h, float_sum),
    }
}

fn extreme(h: &mut dyn Heap, a: u32, want: std::cmp::Ordering) -> VmResult<u32> {
    if !matches!(value::type_of(h, a)?, TYPE_ARRAY | TYPE_SET) {
        return Ok(0);
    }
    let mut best = 0;
    for e in value::elems(h, a)? {
        if best == 0 || value::compare(h, e, best)? == want {
            best = e;
        }
    }
    Ok(best)
}

pub fn agg_max(h: &mut dyn Heap, a: u32) -> VmResult<u32> {
    extreme(h, a, std::cmp::Ordering::Greater)
}

pub fn agg_min(h: &mut dyn Heap, a: u32) -> VmResult<u32> {
    extreme(h, a, std::cmp::Ordering::Less)
}

/// `concat(delimiter, collection)` over an array or set of strings.
pub fn strings_concat(h: &mut dyn Heap, delim: u32, coll: u32) -> VmResult<u32> {
    let Some(delim) = string_arg(h, delim)?.map(str::to_string) else {
        return Ok(0);
    };
    if !matches!(value::type_of(h, coll)?, TYPE_ARRAY | TYPE_SET) {
        return Ok(0);
    }
    let mut parts = Vec::new();
    for e in value::elems(h, coll)? {
        match string_arg(h, e)? {
            Some(s) => parts.push(s.to_string()),
            None => return Ok(0),
        }
    }
    value::string(h, &parts.join(&delim))
}

fn string_predicate(
    h: &mut dyn Heap,
    a: u32,
    b: u32,
    pred: fn(&str, &str) -> bool,
) -> VmResult<u32> {
    let result = match (string_arg(h, a)?, string_arg(h, b)?) {
        (Some(x), Some(y)) => pred(x, y),
        _ => return Ok(0),
    };
    value::boolean(h, result)
}

pub fn strings_contains(h: &mut dyn Heap, a: u32, b: u32) -> VmResult<u32> {
    string_predicate(h, a, b, |x, y| x.contains(y))
}

pub fn strings_startswith(h: &mut dyn Heap, a: u32, b: u32) -> VmResult<u32> {
    string_predicate(h, a, b, |x, y| x.starts_with(y))
}

pub fn strings_endswith(h: &mut dyn Heap, a: u32, b: u32) -> VmResult<u32> {
    string_predicate(h, a, b, |x, y| x.ends_with(y))
}

pub fn strings_lower(h: &mut dyn Heap, a: u32) -> VmResult<u32> {
    match string_arg(h, a)?.map(str::to_lowercase) {
        Some(s) => value::string(h, &s),
        None => Ok(0),
    }
}

pub fn strings_upper(h: &mut dyn Heap, a: u32) -> VmResult<u32> {
    match string_arg(h, a)?.map(str::to_uppercase) {
        Some(s) => value::string(h, &s),
        None => Ok(0),
    }
}

/// `is_<type>(x)`; false for any other type.
pub fn types_is(h: &mut dyn Heap, a: u32, tag: i32) -> VmResult<u32> {
    let matches = value::type_of(h, a)? == tag;
    value::boolean(h, matches)
}

pub fn types_name(h: &mut dyn Heap, a: u32) -> VmResult<u32> {
    let name = match value::type_of(h, a)? {
        TYPE_NULL => "null",
        TYPE_BOOLEAN => "boolean",
        TYPE_NUMBER => "number",
        TYPE_STRING => "string",
        TYPE_ARRAY => "array",
        TYPE_OBJECT => "object",
        TYPE_SET => "set",
        _ => return Ok(0),
    };
    value::string(h, name)
}

/// `regex.match(pattern, value)`.  A malformed pattern is an error, not
/// undefined.
pub fn regex_match(h: &mut dyn Heap, pattern: u32, subject: u32) -> VmResult<u32> {
    let matched = match (string_arg(h, pattern)?, string_arg(h, subject)?) {
        (Some(p), Some(s)) => regex::Regex::new(p)
            .map_err(|e| VmError::Builtin(format!("regex.match: {e}")))?
            .is_match(s),
        _ => return Ok(0),
    };
    value::boolean(h, matched)
}
