//! Guest value heap.
//!
//! Every value is a 16-byte cell in linear memory, allocated by bumping the
//! module's `opa_heap_ptr` global.  Nothing is ever freed: the VM rewinds the
//! pointer to a checkpoint instead.  Address `0` is the undefined value.
//!
//! | Tag | Type   | Layout after the tag                                     |
//! |-----|--------|----------------------------------------------------------|
//! | 1   | null   |                                                          |
//! | 2   | bool   | `+4` value                                               |
//! | 3   | number | `+4` kind; int `+8` i64, float `+8` f64, ref `+8` ptr `+12` len |
//! | 4   | string | `+4` len, `+8` ptr                                       |
//! | 5   | array  | `+4` len, `+8` cap, `+12` element buffer (u32 each)      |
//! | 6   | object | `+4` len, `+8` cap, `+12` entry buffer (key, value pairs) |
//! | 7   | set    | like array                                               |
//!
//! Object entries are kept sorted by key and set elements sorted and
//! unique, both under [`compare`].  Buffers double when full; the old
//! buffer is abandoned in place.

use std::cmp::Ordering;

use tollgate_codegen::types::{
    align8, TYPE_ARRAY, TYPE_BOOLEAN, TYPE_NULL, TYPE_NUMBER, TYPE_OBJECT, TYPE_SET, TYPE_STRING,
    WASM_PAGE_SIZE,
};
use wasmi::{AsContext, AsContextMut, Global, Memory, StoreContextMut, Val};

use crate::error::{code, VmError, VmResult};
use crate::externs::HostState;

/// Size of a value cell.
pub const CELL: u32 = 16;

const NUM_INT: u32 = 0;
const NUM_FLOAT: u32 = 1;
const NUM_REF: u32 = 2;

const ELEM: u32 = 4;
const ENTRY: u32 = 8;

// ══════════════════════════════════════════════════════════════════════════════
// Heap access
// ══════════════════════════════════════════════════════════════════════════════

/// Linear memory plus the bump pointer.
pub trait Heap {
    fn memory(&self) -> &[u8];
    fn memory_mut(&mut self) -> &mut [u8];
    fn heap_ptr(&self) -> VmResult<u32>;
    fn set_heap_ptr(&mut self, ptr: u32) -> VmResult<()>;
    /// Grow memory so that it covers `[0, end)`.
    fn reserve(&mut self, end: u32) -> VmResult<()>;

    /// Bump-allocate `size` bytes, 8-byte aligned.
    fn alloc(&mut self, size: u32) -> VmResult<u32> {
        let addr = align8(self.heap_ptr()?);
        let end = addr
            .checked_add(size)
            .ok_or_else(|| VmError::Heap(format!("allocation of {size} bytes overflows")))?;
        self.reserve(end)?;
        self.set_heap_ptr(end)?;
        Ok(addr)
    }

    fn bytes(&self, addr: u32, len: u32) -> VmResult<&[u8]> {
        let start = addr as usize;
        self.memory()
            .get(start..start + len as usize)
            .ok_or_else(|| out_of_bounds(addr, len))
    }

    fn write(&mut self, addr: u32, bytes: &[u8]) -> VmResult<()> {
        let start = addr as usize;
        let slot = self
            .memory_mut()
            .get_mut(start..start + bytes.len())
            .ok_or_else(|| out_of_bounds(addr, bytes.len() as u32))?;
        slot.copy_from_slice(bytes);
        Ok(())
    }

    fn read_u32(&self, addr: u32) -> VmResult<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.bytes(addr, 4)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> VmResult<()> {
        self.write(addr, &value.to_le_bytes())
    }

    fn read_i64(&self, addr: u32) -> VmResult<i64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(addr, 8)?);
        Ok(i64::from_le_bytes(buf))
    }

    fn write_i64(&mut self, addr: u32, value: i64) -> VmResult<()> {
        self.write(addr, &value.to_le_bytes())
    }

    fn read_f64(&self, addr: u32) -> VmResult<f64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(addr, 8)?);
        Ok(f64::from_le_bytes(buf))
    }

    /// The NUL-terminated byte string at `addr`, without the terminator.
    fn cstr(&self, addr: u32) -> VmResult<&[u8]> {
        let tail = self
            .memory()
            .get(addr as usize..)
            .ok_or_else(|| out_of_bounds(addr, 1))?;
        let len = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| VmError::Heap(format!("unterminated string at {addr}")))?;
        Ok(&tail[..len])
    }
}

fn out_of_bounds(addr: u32, len: u32) -> VmError {
    VmError::Heap(format!("access of {len} bytes at {addr} is out of bounds"))
}

/// The heap of a live instance, reached through its store.
pub struct GuestHeap<'a> {
    ctx: StoreContextMut<'a, HostState>,
    memory: Memory,
    heap_ptr: Global,
}

impl<'a> GuestHeap<'a> {
    /// Use the memory and heap global recorded on the host state.
    pub fn attach(ctx: StoreContextMut<'a, HostState>) -> VmResult<Self> {
        let state = ctx.data();
        let memory = state
            .memory
            .ok_or_else(|| VmError::Heap("no memory attached".into()))?;
        let heap_ptr = state
            .heap_ptr
            .ok_or_else(|| VmError::Heap("no heap pointer attached".into()))?;
        Ok(Self {
            ctx,
            memory,
            heap_ptr,
        })
    }

    pub fn state(&self) -> &HostState {
        self.ctx.data()
    }

    pub fn state_mut(&mut self) -> &mut HostState {
        self.ctx.data_mut()
    }
}

impl Heap for GuestHeap<'_> {
    fn memory(&self) -> &[u8] {
        self.memory.data(self.ctx.as_context())
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(self.ctx.as_context_mut())
    }

    fn heap_ptr(&self) -> VmResult<u32> {
        self.heap_ptr
            .get(self.ctx.as_context())
            .i32()
            .map(|p| p as u32)
            .ok_or_else(|| VmError::Heap("heap pointer global is not i32".into()))
    }

    fn set_heap_ptr(&mut self, ptr: u32) -> VmResult<()> {
        self.heap_ptr
            .set(self.ctx.as_context_mut(), Val::I32(ptr as i32))
            .map_err(|e| VmError::Heap(e.to_string()))
    }

    fn reserve(&mut self, end: u32) -> VmResult<()> {
        let len = self.memory().len() as u64;
        if u64::from(end) <= len {
            return Ok(());
        }
        let pages = (u64::from(end) - len).div_ceil(u64::from(WASM_PAGE_SIZE));
        self.memory
            .grow(self.ctx.as_context_mut(), pages as _)
            .map_err(|e| VmError::Heap(format!("out of memory growing by {pages} pages: {e}")))?;
        Ok(())
    }
}

/// A heap over a plain buffer, for unit tests.
#[cfg(test)]
pub(crate) struct VecHeap {
    mem: Vec<u8>,
    ptr: u32,
    limit: Option<u32>,
}

#[cfg(test)]
impl VecHeap {
    pub(crate) fn new() -> Self {
        Self {
            mem: vec![0; 4096],
            ptr: tollgate_codegen::types::STRING_BASE,
            limit: None,
        }
    }

    /// Fail any allocation that would end past `end`.
    pub(crate) fn limit_to(&mut self, end: u32) {
        self.limit = Some(end);
    }
}

#[cfg(test)]
impl Heap for VecHeap {
    fn memory(&self) -> &[u8] {
        &self.mem
    }
    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }
    fn heap_ptr(&self) -> VmResult<u32> {
        Ok(self.ptr)
    }
    fn set_heap_ptr(&mut self, ptr: u32) -> VmResult<()> {
        self.ptr = ptr;
        Ok(())
    }
    fn reserve(&mut self, end: u32) -> VmResult<()> {
        if self.limit.is_some_and(|limit| end > limit) {
            return Err(VmError::Heap(format!("out of memory reserving up to {end}")));
        }
        if end as usize > self.mem.len() {
            self.mem.resize(end as usize, 0);
        }
        Ok(())
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Constructors
// ══════════════════════════════════════════════════════════════════════════════

fn cell(h: &mut dyn Heap, tag: i32) -> VmResult<u32> {
    let addr = h.alloc(CELL)?;
    h.write(addr, &[0; CELL as usize])?;
    h.write_u32(addr, tag as u32)?;
    Ok(addr)
}

pub fn null(h: &mut dyn Heap) -> VmResult<u32> {
    cell(h, TYPE_NULL)
}

pub fn boolean(h: &mut dyn Heap, value: bool) -> VmResult<u32> {
    let v = cell(h, TYPE_BOOLEAN)?;
    h.write_u32(v + 4, u32::from(value))?;
    Ok(v)
}

pub fn number_int(h: &mut dyn Heap, value: i64) -> VmResult<u32> {
    let v = cell(h, TYPE_NUMBER)?;
    h.write_u32(v + 4, NUM_INT)?;
    h.write_i64(v + 8, value)?;
    Ok(v)
}

pub fn number_float(h: &mut dyn Heap, value: f64) -> VmResult<u32> {
    let v = cell(h, TYPE_NUMBER)?;
    h.write_u32(v + 4, NUM_FLOAT)?;
    h.write(v + 8, &value.to_le_bytes())?;
    Ok(v)
}

/// A number whose decimal text lives at `ptr`.
pub fn number_ref(h: &mut dyn Heap, ptr: u32, len: u32) -> VmResult<u32> {
    let v = cell(h, TYPE_NUMBER)?;
    h.write_u32(v + 4, NUM_REF)?;
    h.write_u32(v + 8, ptr)?;
    h.write_u32(v + 12, len)?;
    Ok(v)
}

/// A number from decimal text, copied into the heap.
pub fn number_text(h: &mut dyn Heap, text: &str) -> VmResult<u32> {
    let ptr = copy_bytes(h, text.as_bytes())?;
    number_ref(h, ptr, text.len() as u32)
}

/// An int when `value` is integral and exact, a float otherwise.
pub fn number_from_f64(h: &mut dyn Heap, value: f64) -> VmResult<u32> {
    const EXACT: f64 = 9_007_199_254_740_992.0;
    if value.fract() == 0.0 && value.abs() < EXACT {
        number_int(h, value as i64)
    } else {
        number_float(h, value)
    }
}

/// A string cell over existing bytes.
pub fn string_at(h: &mut dyn Heap, ptr: u32, len: u32) -> VmResult<u32> {
    let v = cell(h, TYPE_STRING)?;
    h.write_u32(v + 4, len)?;
    h.write_u32(v + 8, ptr)?;
    Ok(v)
}

/// A string cell over a copy of `s`.
pub fn string(h: &mut dyn Heap, s: &str) -> VmResult<u32> {
    let ptr = copy_bytes(h, s.as_bytes())?;
    string_at(h, ptr, s.len() as u32)
}

pub fn string_terminated(h: &mut dyn Heap, addr: u32) -> VmResult<u32> {
    let len = h.cstr(addr)?.len() as u32;
    string_at(h, addr, len)
}

fn copy_bytes(h: &mut dyn Heap, bytes: &[u8]) -> VmResult<u32> {
    let ptr = h.alloc(bytes.len() as u32)?;
    h.write(ptr, bytes)?;
    Ok(ptr)
}

fn collection(h: &mut dyn Heap, tag: i32, cap: u32, stride: u32) -> VmResult<u32> {
    let v = cell(h, tag)?;
    if cap > 0 {
        let buf = h.alloc(cap * stride)?;
        h.write_u32(v + 8, cap)?;
        h.write_u32(v + 12, buf)?;
    }
    Ok(v)
}

pub fn array_with_cap(h: &mut dyn Heap, cap: u32) -> VmResult<u32> {
    collection(h, TYPE_ARRAY, cap, ELEM)
}

pub fn object(h: &mut dyn Heap) -> VmResult<u32> {
    collection(h, TYPE_OBJECT, 0, ENTRY)
}

pub fn set(h: &mut dyn Heap) -> VmResult<u32> {
    collection(h, TYPE_SET, 0, ELEM)
}

// ══════════════════════════════════════════════════════════════════════════════
// Inspection
// ══════════════════════════════════════════════════════════════════════════════

/// A decoded number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    /// The exact integer value, if there is one.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Num::Int(i) => Some(i),
            Num::Float(f) if f.fract() == 0.0 && f.abs() < 9.2e18 => Some(f as i64),
            Num::Float(_) => None,
        }
    }
}

/// Type tag of a value; `0` for undefined.
pub fn type_of(h: &dyn Heap, v: u32) -> VmResult<i32> {
    if v == 0 {
        return Ok(0);
    }
    Ok(h.read_u32(v)? as i32)
}

pub fn bool_value(h: &dyn Heap, v: u32) -> VmResult<bool> {
    Ok(h.read_u32(v + 4)? != 0)
}

pub fn number(h: &dyn Heap, v: u32) -> VmResult<Num> {
    match h.read_u32(v + 4)? {
        NUM_INT => Ok(Num::Int(h.read_i64(v + 8)?)),
        NUM_FLOAT => Ok(Num::Float(h.read_f64(v + 8)?)),
        _ => {
            let text = number_ref_text(h, v)?;
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Num::Int(i));
            }
            text.parse::<f64>()
                .map(Num::Float)
                .map_err(|_| VmError::Heap(format!("malformed number {text:?}")))
        }
    }
}

/// The decimal text of a ref number, `None` for int and float cells.
pub fn number_literal(h: &dyn Heap, v: u32) -> VmResult<Option<&str>> {
    if h.read_u32(v + 4)? != NUM_REF {
        return Ok(None);
    }
    number_ref_text(h, v).map(Some)
}

fn number_ref_text(h: &dyn Heap, v: u32) -> VmResult<&str> {
    let bytes = h.bytes(h.read_u32(v + 8)?, h.read_u32(v + 12)?)?;
    std::str::from_utf8(bytes).map_err(|e| VmError::Heap(format!("number text: {e}")))
}

pub fn str_bytes(h: &dyn Heap, v: u32) -> VmResult<&[u8]> {
    h.bytes(h.read_u32(v + 8)?, h.read_u32(v + 4)?)
}

pub fn str_value(h: &dyn Heap, v: u32) -> VmResult<&str> {
    std::str::from_utf8(str_bytes(h, v)?).map_err(|e| VmError::Heap(format!("string: {e}")))
}

/// Element or entry count of a collection.
fn count(h: &dyn Heap, v: u32) -> VmResult<u32> {
    h.read_u32(v + 4)
}

fn buffer(h: &dyn Heap, v: u32) -> VmResult<u32> {
    h.read_u32(v + 12)
}

fn elem(h: &dyn Heap, v: u32, i: u32) -> VmResult<u32> {
    h.read_u32(buffer(h, v)? + i * ELEM)
}

fn entry(h: &dyn Heap, v: u32, i: u32) -> VmResult<(u32, u32)> {
    let at = buffer(h, v)? + i * ENTRY;
    Ok((h.read_u32(at)?, h.read_u32(at + 4)?))
}

/// Elements of an array or set, in order.
pub fn elems(h: &dyn Heap, v: u32) -> VmResult<Vec<u32>> {
    (0..count(h, v)?).map(|i| elem(h, v, i)).collect()
}

/// Key/value entries of an object, in key order.
pub fn entries(h: &dyn Heap, v: u32) -> VmResult<Vec<(u32, u32)>> {
    (0..count(h, v)?).map(|i| entry(h, v, i)).collect()
}

/// Length as `opa_value_length` reports it: elements for collections,
/// characters for strings.
pub fn length(h: &dyn Heap, v: u32) -> VmResult<u32> {
    match type_of(h, v)? {
        TYPE_ARRAY | TYPE_OBJECT | TYPE_SET => count(h, v),
        TYPE_STRING => {
            let bytes = str_bytes(h, v)?;
            Ok(std::str::from_utf8(bytes)
                .map(|s| s.chars().count())
                .unwrap_or(bytes.len()) as u32)
        }
        _ => Ok(0),
    }
}

/// Total order over values: null < boolean < number < string < array <
/// object < set, undefined before everything.
pub fn compare(h: &dyn Heap, a: u32, b: u32) -> VmResult<Ordering> {
    if a == b {
        return Ok(Ordering::Equal);
    }
    if a == 0 || b == 0 {
        return Ok((a != 0).cmp(&(b != 0)));
    }
    let (ta, tb) = (type_of(h, a)?, type_of(h, b)?);
    if ta != tb {
        return Ok(ta.cmp(&tb));
    }
    match ta {
        TYPE_NULL => Ok(Ordering::Equal),
        TYPE_BOOLEAN => Ok(bool_value(h, a)?.cmp(&bool_value(h, b)?)),
        TYPE_NUMBER => Ok(compare_numbers(number(h, a)?, number(h, b)?)),
        TYPE_STRING => Ok(str_bytes(h, a)?.cmp(str_bytes(h, b)?)),
        TYPE_ARRAY | TYPE_SET => {
            let (la, lb) = (count(h, a)?, count(h, b)?);
            for i in 0..la.min(lb) {
                let ord = compare(h, elem(h, a, i)?, elem(h, b, i)?)?;
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
            }
            Ok(la.cmp(&lb))
        }
        TYPE_OBJECT => {
            let (la, lb) = (count(h, a)?, count(h, b)?);
            for i in 0..la.min(lb) {
                let ((ka, va), (kb, vb)) = (entry(h, a, i)?, entry(h, b, i)?);
                let ord = compare(h, ka, kb)?.then(compare(h, va, vb)?);
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
            }
            Ok(la.cmp(&lb))
        }
        other => Err(VmError::Heap(format!("bad value tag {other} at {a}"))),
    }
}

pub fn compare_numbers(a: Num, b: Num) -> Ordering {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => x.cmp(&y),
        _ => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
    }
}

/// Binary search a sorted buffer of `len` slots of `stride` bytes, keyed by
/// the first word of each slot.
fn search(h: &dyn Heap, v: u32, stride: u32, key: u32) -> VmResult<Result<u32, u32>> {
    let (base, mut lo, mut hi) = (buffer(h, v)?, 0, count(h, v)?);
    while lo < hi {
        let mid = (lo + hi) / 2;
        match compare(h, h.read_u32(base + mid * stride)?, key)? {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(lo))
}

/// `v[key]`, or `0` when absent.  A set yields its own element.
pub fn get(h: &dyn Heap, v: u32, key: u32) -> VmResult<u32> {
    match type_of(h, v)? {
        TYPE_ARRAY => match array_index(h, v, key, false)? {
            Some(i) => elem(h, v, i),
            None => Ok(0),
        },
        TYPE_OBJECT => match search(h, v, ENTRY, key)? {
            Ok(i) => Ok(entry(h, v, i)?.1),
            Err(_) => Ok(0),
        },
        TYPE_SET => match search(h, v, ELEM, key)? {
            Ok(i) => elem(h, v, i),
            Err(_) => Ok(0),
        },
        _ => Ok(0),
    }
}

/// The key after `prev` (`0` starts), or `0` when exhausted.  Array keys
/// are fresh number cells.
pub fn iter(h: &mut dyn Heap, v: u32, prev: u32) -> VmResult<u32> {
    match type_of(h, v)? {
        TYPE_ARRAY => {
            let next = if prev == 0 {
                0
            } else {
                match number(h, prev)?.as_i64() {
                    Some(i) => i + 1,
                    None => return Ok(0),
                }
            };
            if next < i64::from(count(h, v)?) {
                number_int(h, next)
            } else {
                Ok(0)
            }
        }
        tag @ (TYPE_OBJECT | TYPE_SET) => {
            let stride = if tag == TYPE_OBJECT { ENTRY } else { ELEM };
            let next = if prev == 0 {
                0
            } else {
                match search(h, v, stride, prev)? {
                    Ok(i) => i + 1,
                    Err(_) => return Ok(0),
                }
            };
            if next < count(h, v)? {
                h.read_u32(buffer(h, v)? + next * stride)
            } else {
                Ok(0)
            }
        }
        _ => Ok(0),
    }
}

/// Array position named by `key`: a number, or a decimal string for path
/// segments.  With `append`, one-past-the-end and `"-"` are accepted.
fn array_index(h: &dyn Heap, arr: u32, key: u32, append: bool) -> VmResult<Option<u32>> {
    let len = count(h, arr)?;
    let index = match type_of(h, key)? {
        TYPE_NUMBER => number(h, key)?.as_i64(),
        TYPE_STRING => {
            let s = str_bytes(h, key)?;
            if append && s == b"-" {
                return Ok(Some(len));
            }
            let canonical = !s.is_empty()
                && s.iter().all(u8::is_ascii_digit)
                && (s.len() == 1 || s[0] != b'0');
            if canonical {
                std::str::from_utf8(s).ok().and_then(|s| s.parse().ok())
            } else {
                None
            }
        }
        _ => None,
    };
    let limit = if append { len } else { len.saturating_sub(1) };
    Ok(index
        .filter(|i| *i >= 0 && *i <= i64::from(limit) && (append || len > 0))
        .map(|i| i as u32))
}

// ══════════════════════════════════════════════════════════════════════════════
// Mutation
// ══════════════════════════════════════════════════════════════════════════════

fn ensure_capacity(h: &mut dyn Heap, v: u32, stride: u32) -> VmResult<()> {
    let (len, cap) = (count(h, v)?, h.read_u32(v + 8)?);
    if len < cap {
        return Ok(());
    }
    let new_cap = (cap * 2).max(4);
    let old = h.bytes(buffer(h, v)?, len * stride)?.to_vec();
    let buf = h.alloc(new_cap * stride)?;
    h.write(buf, &old)?;
    h.write_u32(v + 8, new_cap)?;
    h.write_u32(v + 12, buf)
}

/// Insert `slot` at position `at`, shifting the tail right.
fn insert_at(h: &mut dyn Heap, v: u32, stride: u32, at: u32, slot: &[u8]) -> VmResult<()> {
    ensure_capacity(h, v, stride)?;
    let (len, base) = (count(h, v)?, buffer(h, v)?);
    let tail = h.bytes(base + at * stride, (len - at) * stride)?.to_vec();
    h.write(base + (at + 1) * stride, &tail)?;
    h.write(base + at * stride, slot)?;
    h.write_u32(v + 4, len + 1)
}

/// Remove the slot at position `at`, shifting the tail left.
fn remove_at(h: &mut dyn Heap, v: u32, stride: u32, at: u32) -> VmResult<()> {
    let (len, base) = (count(h, v)?, buffer(h, v)?);
    let tail = h.bytes(base + (at + 1) * stride, (len - at - 1) * stride)?.to_vec();
    h.write(base + at * stride, &tail)?;
    h.write_u32(v + 4, len - 1)
}

pub fn array_append(h: &mut dyn Heap, arr: u32, value: u32) -> VmResult<()> {
    let len = count(h, arr)?;
    insert_at(h, arr, ELEM, len, &value.to_le_bytes())
}

/// Insert or overwrite `key`.
pub fn object_insert(h: &mut dyn Heap, obj: u32, key: u32, value: u32) -> VmResult<()> {
    match search(h, obj, ENTRY, key)? {
        Ok(i) => {
            let at = buffer(h, obj)? + i * ENTRY + 4;
            h.write_u32(at, value)
        }
        Err(i) => {
            let mut slot = [0u8; ENTRY as usize];
            slot[..4].copy_from_slice(&key.to_le_bytes());
            slot[4..].copy_from_slice(&value.to_le_bytes());
            insert_at(h, obj, ENTRY, i, &slot)
        }
    }
}

pub fn set_add(h: &mut dyn Heap, set: u32, value: u32) -> VmResult<()> {
    match search(h, set, ELEM, value)? {
        Ok(_) => Ok(()),
        Err(i) => insert_at(h, set, ELEM, i, &value.to_le_bytes()),
    }
}

/// Deep-merge two objects into a new one; `0` if either is not an object
/// or a key holds two non-object values.
pub fn merge(h: &mut dyn Heap, a: u32, b: u32) -> VmResult<u32> {
    if a == 0 {
        return Ok(b);
    }
    if b == 0 {
        return Ok(a);
    }
    if type_of(h, a)? != TYPE_OBJECT || type_of(h, b)? != TYPE_OBJECT {
        return Ok(0);
    }
    let out = object(h)?;
    for (k, v) in entries(h, a)? {
        object_insert(h, out, k, v)?;
    }
    for (k, vb) in entries(h, b)? {
        let va = get(h, out, k)?;
        let merged = if va == 0 { vb } else { merge(h, va, vb)? };
        if merged == 0 {
            return Ok(0);
        }
        object_insert(h, out, k, merged)?;
    }
    Ok(out)
}

pub fn boolean_set(h: &mut dyn Heap, v: u32, value: bool) -> VmResult<()> {
    h.write_u32(v + 4, u32::from(value))
}

pub fn number_set_int(h: &mut dyn Heap, v: u32, value: i64) -> VmResult<()> {
    h.write_u32(v + 4, NUM_INT)?;
    h.write_i64(v + 8, value)
}

// ══════════════════════════════════════════════════════════════════════════════
// Paths
// ══════════════════════════════════════════════════════════════════════════════

/// Set `value` at `path` (an array of segments) below `base`.
///
/// Missing object members along the way are created as empty objects.  An
/// array segment must be an index; the last one may also be one past the
/// end or `"-"`, and inserts.  The whole path is checked and every cell
/// allocated before anything reachable from `base` is written, so neither
/// a non-zero code nor an allocation error leaves `base` changed.
pub fn add_path(h: &mut dyn Heap, base: u32, path: u32, value: u32) -> VmResult<i32> {
    let segments = match path_segments(h, path)? {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(code::INVALID_PATH),
    };
    let last = segments.len() - 1;

    let mut node = base;
    let mut depth = 0;
    while depth < last {
        match type_of(h, node)? {
            TYPE_OBJECT => {
                let child = get(h, node, segments[depth])?;
                if child == 0 {
                    break;
                }
                node = child;
            }
            TYPE_ARRAY => match array_index(h, node, segments[depth], false)? {
                Some(i) => node = elem(h, node, i)?,
                None => return Ok(code::INVALID_PATH),
            },
            _ => return Ok(code::INVALID_TYPE),
        }
        depth += 1;
    }

    if depth == last {
        match type_of(h, node)? {
            TYPE_OBJECT => {}
            TYPE_ARRAY => {
                if array_index(h, node, segments[last], true)?.is_none() {
                    return Ok(code::INVALID_PATH);
                }
            }
            _ => return Ok(code::INVALID_TYPE),
        }
    }

    // Missing members are built bottom-up in fresh cells, and the parent's
    // slot is reserved, before the single write into `node`.
    let (key, value) = if depth < last {
        let mut chain = value;
        for segment in segments[depth + 1..].iter().rev() {
            let fresh = object(h)?;
            object_insert(h, fresh, *segment, chain)?;
            chain = fresh;
        }
        (segments[depth], chain)
    } else {
        (segments[last], value)
    };

    match type_of(h, node)? {
        TYPE_OBJECT => {
            ensure_capacity(h, node, ENTRY)?;
            object_insert(h, node, key, value)?;
        }
        _ => {
            let Some(i) = array_index(h, node, key, true)? else {
                return Ok(code::INVALID_PATH);
            };
            ensure_capacity(h, node, ELEM)?;
            insert_at(h, node, ELEM, i, &value.to_le_bytes())?;
        }
    }
    Ok(code::OK)
}

/// Remove the member at `path` below `base`.
pub fn remove_path(h: &mut dyn Heap, base: u32, path: u32) -> VmResult<i32> {
    let segments = match path_segments(h, path)? {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(code::INVALID_PATH),
    };
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return Ok(code::INVALID_PATH),
    };

    let mut node = base;
    for segment in parents {
        match type_of(h, node)? {
            TYPE_OBJECT | TYPE_ARRAY => {
                node = get(h, node, *segment)?;
                if node == 0 {
                    return Ok(code::INVALID_PATH);
                }
            }
            _ => return Ok(code::INVALID_TYPE),
        }
    }

    match type_of(h, node)? {
        TYPE_OBJECT => match search(h, node, ENTRY, *last)? {
            Ok(i) => remove_at(h, node, ENTRY, i)?,
            Err(_) => return Ok(code::INVALID_PATH),
        },
        TYPE_ARRAY => match array_index(h, node, *last, false)? {
            Some(i) => remove_at(h, node, ELEM, i)?,
            None => return Ok(code::INVALID_PATH),
        },
        _ => return Ok(code::INVALID_TYPE),
    }
    Ok(code::OK)
}

/// Walk `path` below `base` without creating anything.
pub fn lookup(h: &dyn Heap, base: u32, path: &[u32]) -> VmResult<u32> {
    let mut node = base;
    for segment in path {
        if node == 0 {
            break;
        }
        node = match type_of(h, node)? {
            TYPE_ARRAY => match array_index(h, node, *segment, false)? {
                Some(i) => elem(h, node, i)?,
                None => 0,
            },
            _ => get(h, node, *segment)?,
        };
    }
    Ok(node)
}

fn path_segments(h: &dyn Heap, path: u32) -> VmResult<Option<Vec<u32>>> {
    if type_of(h, path)? != TYPE_ARRAY {
        return Ok(None);
    }
    elems(h, path).map(Some)
}

/// Build an array of string segments.
pub fn path(h: &mut dyn Heap, segments: &[&str]) -> VmResult<u32> {
    let arr = array_with_cap(h, segments.len() as u32)?;
    for segment in segments {
        let s = string(h, segment)?;
        array_append(h, arr, s)?;
    }
    Ok(arr)
}
