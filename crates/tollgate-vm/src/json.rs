//! Conversion between guest values and text.
//!
//! JSON goes through `serde_json`.  The value format is a JSON superset that
//! can also spell sets: `set()` for the empty set and `{a, b}` otherwise.

use serde_json::{Map, Number, Value};
use tollgate_codegen::types::{
    TYPE_ARRAY, TYPE_BOOLEAN, TYPE_NULL, TYPE_NUMBER, TYPE_OBJECT, TYPE_SET, TYPE_STRING,
};

use crate::error::{VmError, VmResult};
use crate::value::{self, Heap, Num};

// ══════════════════════════════════════════════════════════════════════════════
// JSON
// ══════════════════════════════════════════════════════════════════════════════

/// Parse JSON text into a fresh value.
pub fn parse_json(h: &mut dyn Heap, text: &[u8]) -> VmResult<u32> {
    let doc: Value = serde_json::from_slice(text)?;
    from_json(h, &doc)
}

/// Materialize a `serde_json` value in the heap.
pub fn from_json(h: &mut dyn Heap, doc: &Value) -> VmResult<u32> {
    match doc {
        Value::Null => value::null(h),
        Value::Bool(b) => value::boolean(h, *b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => value::number_int(h, i),
            None => value::number_text(h, &n.to_string()),
        },
        Value::String(s) => value::string(h, s),
        Value::Array(items) => {
            let arr = value::array_with_cap(h, items.len() as u32)?;
            for item in items {
                let v = from_json(h, item)?;
                value::array_append(h, arr, v)?;
            }
            Ok(arr)
        }
        Value::Object(members) => {
            let obj = value::object(h)?;
            for (k, item) in members {
                let key = value::string(h, k)?;
                let v = from_json(h, item)?;
                value::object_insert(h, obj, key, v)?;
            }
            Ok(obj)
        }
    }
}

/// Read a value back as JSON.  Sets become arrays; object keys that are not
/// strings are spelled in the value format.
pub fn to_json(h: &dyn Heap, v: u32) -> VmResult<Value> {
    match value::type_of(h, v)? {
        TYPE_NULL => Ok(Value::Null),
        TYPE_BOOLEAN => Ok(Value::Bool(value::bool_value(h, v)?)),
        TYPE_NUMBER => Ok(Value::Number(json_number(h, v)?)),
        TYPE_STRING => Ok(Value::String(value::str_value(h, v)?.to_string())),
        TYPE_ARRAY | TYPE_SET => value::elems(h, v)?
            .into_iter()
            .map(|e| to_json(h, e))
            .collect::<VmResult<Vec<_>>>()
            .map(Value::Array),
        TYPE_OBJECT => {
            let mut members = Map::new();
            for (k, item) in value::entries(h, v)? {
                let key = if value::type_of(h, k)? == TYPE_STRING {
                    value::str_value(h, k)?.to_string()
                } else {
                    dump_value(h, k)?
                };
                members.insert(key, to_json(h, item)?);
            }
            Ok(Value::Object(members))
        }
        0 => Err(VmError::Heap("cannot serialize an undefined value".into())),
        other => Err(VmError::Heap(format!("bad value tag {other} at {v}"))),
    }
}

fn json_number(h: &dyn Heap, v: u32) -> VmResult<Number> {
    if let Some(text) = value::number_literal(h, v)? {
        if let Ok(n) = serde_json::from_str::<Number>(text) {
            return Ok(n);
        }
    }
    match value::number(h, v)? {
        Num::Int(i) => Ok(Number::from(i)),
        Num::Float(f) => Number::from_f64(f)
            .ok_or_else(|| VmError::Heap(format!("{f} has no JSON representation"))),
    }
}

/// Serialize to JSON and write it NUL-terminated into the heap.
pub fn dump_json(h: &mut dyn Heap, v: u32) -> VmResult<u32> {
    let text = serde_json::to_vec(&to_json(h, v)?)?;
    write_terminated(h, &text)
}

/// Copy `bytes` plus a NUL terminator into the heap.
pub fn write_terminated(h: &mut dyn Heap, bytes: &[u8]) -> VmResult<u32> {
    let addr = h.alloc(bytes.len() as u32 + 1)?;
    h.write(addr, bytes)?;
    h.write(addr + bytes.len() as u32, &[0])?;
    Ok(addr)
}

// ══════════════════════════════════════════════════════════════════════════════
// Value format
// ══════════════════════════════════════════════════════════════════════════════

/// Spell a value in the value format.
pub fn dump_value(h: &dyn Heap, v: u32) -> VmResult<String> {
    let mut out = String::new();
    write_value(h, v, &mut out)?;
    Ok(out)
}

fn write_value(h: &dyn Heap, v: u32, out: &mut String) -> VmResult<()> {
    match value::type_of(h, v)? {
        TYPE_NULL | TYPE_BOOLEAN | TYPE_NUMBER | TYPE_STRING => {
            out.push_str(&serde_json::to_string(&to_json(h, v)?)?);
        }
        TYPE_ARRAY => {
            out.push('[');
            write_list(h, &value::elems(h, v)?, out)?;
            out.push(']');
        }
        TYPE_SET => {
            let elems = value::elems(h, v)?;
            if elems.is_empty() {
                out.push_str("set()");
            } else {
                out.push('{');
                write_list(h, &elems, out)?;
                out.push('}');
            }
        }
        TYPE_OBJECT => {
            out.push('{');
            for (i, (k, item)) in value::entries(h, v)?.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(h, k, out)?;
                out.push(':');
                write_value(h, item, out)?;
            }
            out.push('}');
        }
        0 => return Err(VmError::Heap("cannot serialize an undefined value".into())),
        other => return Err(VmError::Heap(format!("bad value tag {other} at {v}"))),
    }
    Ok(())
}

fn write_list(h: &dyn Heap, items: &[u32], out: &mut String) -> VmResult<()> {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_value(h, *item, out)?;
    }
    Ok(())
}

/// Parse value-format text into a fresh value.
pub fn parse_value(h: &mut dyn Heap, text: &[u8]) -> VmResult<u32> {
    let mut parser = ValueParser { src: text, pos: 0 };
    let v = parser.value(h)?;
    parser.skip_ws();
    if parser.pos != text.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(v)
}

struct ValueParser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl ValueParser<'_> {
    fn error(&self, msg: &str) -> VmError {
        VmError::Heap(format!("value parse error at offset {}: {msg}", self.pos))
    }

    fn skip_ws(&mut self) {
        while self
            .src
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8) -> VmResult<()> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn keyword(&mut self, word: &str) -> bool {
        if self.src[self.pos..].starts_with(word.as_bytes()) {
            self.pos += word.len();
            true
        } else {
            false
        }
    }

    fn value(&mut self, h: &mut dyn Heap) -> VmResult<u32> {
        match self.peek() {
            Some(b'n') if self.keyword("null") => value::null(h),
            Some(b't') if self.keyword("true") => value::boolean(h, true),
            Some(b'f') if self.keyword("false") => value::boolean(h, false),
            Some(b's') if self.keyword("set()") => value::set(h),
            Some(b'"') => {
                let s = self.string()?;
                value::string(h, &s)
            }
            Some(b'[') => self.array(h),
            Some(b'{') => self.braced(h),
            Some(b'-' | b'0'..=b'9') => self.number(h),
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn string(&mut self) -> VmResult<String> {
        let start = self.pos;
        self.pos += 1;
        loop {
            match self.src.get(self.pos) {
                Some(b'\\') => self.pos += 2,
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => self.pos += 1,
                None => return Err(self.error("unterminated string")),
            }
        }
        Ok(serde_json::from_slice(&self.src[start..self.pos])?)
    }

    fn number(&mut self, h: &mut dyn Heap) -> VmResult<u32> {
        let start = self.pos;
        while self
            .src
            .get(self.pos)
            .is_some_and(|b| matches!(b, b'-' | b'+' | b'.' | b'e' | b'E' | b'0'..=b'9'))
        {
            self.pos += 1;
        }
        let n: Number = serde_json::from_slice(&self.src[start..self.pos])?;
        from_json(h, &Value::Number(n))
    }

    fn array(&mut self, h: &mut dyn Heap) -> VmResult<u32> {
        self.expect(b'[')?;
        let arr = value::array_with_cap(h, 0)?;
        if self.eat(b']') {
            return Ok(arr);
        }
        loop {
            let item = self.value(h)?;
            value::array_append(h, arr, item)?;
            if !self.eat(b',') {
                break;
            }
        }
        self.expect(b']')?;
        Ok(arr)
    }

    /// `{}` and `{k: v, ..}` are objects, `{a, ..}` is a set.
    fn braced(&mut self, h: &mut dyn Heap) -> VmResult<u32> {
        self.expect(b'{')?;
        if self.eat(b'}') {
            return value::object(h);
        }
        let first = self.value(h)?;
        if self.eat(b':') {
            let obj = value::object(h)?;
            let mut key = first;
            loop {
                let item = self.value(h)?;
                value::object_insert(h, obj, key, item)?;
                if !self.eat(b',') {
                    break;
                }
                key = self.value(h)?;
                self.expect(b':')?;
            }
            self.expect(b'}')?;
            return Ok(obj);
        }
        let set = value::set(h)?;
        value::set_add(h, set, first)?;
        while self.eat(b',') {
            let item = self.value(h)?;
            value::set_add(h, set, item)?;
        }
        self.expect(b'}')?;
        Ok(set)
    }
}
