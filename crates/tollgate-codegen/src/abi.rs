//! The host ABI: every extern the compiled code may call, plus the table of
//! builtins that have a dedicated extern instead of going through the
//! generic `opa_builtin{N}` dispatchers.
//!
//! Names and signatures here are a contract with the VM's linker.  Renaming
//! an entry on either side is a breaking change and must bump
//! [`ABI_VERSION`](crate::types::ABI_VERSION).

use wasm_encoder::ValType;

/// A host-implemented function imported from the `env` module.
#[derive(Debug, Clone, Copy)]
pub struct Extern {
    pub name: &'static str,
    pub params: &'static [ValType],
    pub results: &'static [ValType],
}

const I: ValType = ValType::I32;
const L: ValType = ValType::I64;
const D: ValType = ValType::F64;

const fn ext(
    name: &'static str,
    params: &'static [ValType],
    results: &'static [ValType],
) -> Extern {
    Extern {
        name,
        params,
        results,
    }
}

// ── Extern names the compiler emits calls to ─────────────────────────────────

pub const OPA_ABORT: &str = "opa_abort";
pub const OPA_MALLOC: &str = "opa_malloc";
pub const OPA_JSON_PARSE: &str = "opa_json_parse";
pub const OPA_JSON_DUMP: &str = "opa_json_dump";
pub const OPA_NULL: &str = "opa_null";
pub const OPA_BOOLEAN: &str = "opa_boolean";
pub const OPA_NUMBER_INT: &str = "opa_number_int";
pub const OPA_NUMBER_FLOAT: &str = "opa_number_float";
pub const OPA_NUMBER_REF: &str = "opa_number_ref";
pub const OPA_NUMBER_SIZE: &str = "opa_number_size";
pub const OPA_STRING_TERMINATED: &str = "opa_string_terminated";
pub const OPA_ARRAY_WITH_CAP: &str = "opa_array_with_cap";
pub const OPA_OBJECT: &str = "opa_object";
pub const OPA_SET: &str = "opa_set";
pub const OPA_ARRAY_APPEND: &str = "opa_array_append";
pub const OPA_OBJECT_INSERT: &str = "opa_object_insert";
pub const OPA_SET_ADD: &str = "opa_set_add";
pub const OPA_VALUE_MERGE: &str = "opa_value_merge";
pub const OPA_VALUE_BOOLEAN_SET: &str = "opa_value_boolean_set";
pub const OPA_VALUE_NUMBER_SET_INT: &str = "opa_value_number_set_int";
pub const OPA_VALUE_GET: &str = "opa_value_get";
pub const OPA_VALUE_ITER: &str = "opa_value_iter";
pub const OPA_VALUE_LENGTH: &str = "opa_value_length";
pub const OPA_VALUE_TYPE: &str = "opa_value_type";
pub const OPA_VALUE_COMPARE: &str = "opa_value_compare";
pub const OPA_FREE: &str = "opa_free";
pub const OPA_VALUE_PARSE: &str = "opa_value_parse";
pub const OPA_VALUE_DUMP: &str = "opa_value_dump";
pub const OPA_VALUE_ADD_PATH: &str = "opa_value_add_path";
pub const OPA_VALUE_REMOVE_PATH: &str = "opa_value_remove_path";

// ── Native builtin externs ───────────────────────────────────────────────────

pub const OPA_ARITH_PLUS: &str = "opa_arith_plus";
pub const OPA_ARITH_MINUS: &str = "opa_arith_minus";
pub const OPA_ARITH_MULTIPLY: &str = "opa_arith_multiply";
pub const OPA_ARITH_DIVIDE: &str = "opa_arith_divide";
pub const OPA_ARITH_REM: &str = "opa_arith_rem";
pub const OPA_ARITH_ABS: &str = "opa_arith_abs";
pub const OPA_AGG_COUNT: &str = "opa_agg_count";
pub const OPA_AGG_SUM: &str = "opa_agg_sum";
pub const OPA_AGG_MAX: &str = "opa_agg_max";
pub const OPA_AGG_MIN: &str = "opa_agg_min";
pub const OPA_STRINGS_CONCAT: &str = "opa_strings_concat";
pub const OPA_STRINGS_CONTAINS: &str = "opa_strings_contains";
pub const OPA_STRINGS_STARTSWITH: &str = "opa_strings_startswith";
pub const OPA_STRINGS_ENDSWITH: &str = "opa_strings_endswith";
pub const OPA_STRINGS_LOWER: &str = "opa_strings_lower";
pub const OPA_STRINGS_UPPER: &str = "opa_strings_upper";
pub const OPA_TYPES_IS_NUMBER: &str = "opa_types_is_number";
pub const OPA_TYPES_IS_STRING: &str = "opa_types_is_string";
pub const OPA_TYPES_IS_BOOLEAN: &str = "opa_types_is_boolean";
pub const OPA_TYPES_IS_ARRAY: &str = "opa_types_is_array";
pub const OPA_TYPES_IS_OBJECT: &str = "opa_types_is_object";
pub const OPA_TYPES_IS_SET: &str = "opa_types_is_set";
pub const OPA_TYPES_IS_NULL: &str = "opa_types_is_null";
pub const OPA_TYPES_NAME: &str = "opa_types_name";
pub const OPA_REGEX_MATCH: &str = "opa_regex_match";

// ── Functions defined inside the host-runtime module ─────────────────────────

pub const OPA_EVAL_CTX_NEW: &str = "opa_eval_ctx_new";
pub const OPA_EVAL_CTX_SET_INPUT: &str = "opa_eval_ctx_set_input";
pub const OPA_EVAL_CTX_SET_DATA: &str = "opa_eval_ctx_set_data";
pub const OPA_EVAL_CTX_SET_ENTRYPOINT: &str = "opa_eval_ctx_set_entrypoint";
pub const OPA_EVAL_CTX_GET_RESULT: &str = "opa_eval_ctx_get_result";
pub const OPA_HEAP_PTR_GET: &str = "opa_heap_ptr_get";
pub const OPA_HEAP_PTR_SET: &str = "opa_heap_ptr_set";

/// `opa_builtin{N}(id, ctx, arg_1 .. arg_N) -> value`, indexed by arity.
pub const BUILTIN_DISPATCHERS: [&str; 5] = [
    "opa_builtin0",
    "opa_builtin1",
    "opa_builtin2",
    "opa_builtin3",
    "opa_builtin4",
];

/// Every extern the host provides, in import order.
pub const EXTERNS: &[Extern] = &[
    // Control
    ext(OPA_ABORT, &[I], &[]),
    ext(BUILTIN_DISPATCHERS[0], &[I, I], &[I]),
    ext(BUILTIN_DISPATCHERS[1], &[I, I, I], &[I]),
    ext(BUILTIN_DISPATCHERS[2], &[I, I, I, I], &[I]),
    ext(BUILTIN_DISPATCHERS[3], &[I, I, I, I, I], &[I]),
    ext(BUILTIN_DISPATCHERS[4], &[I, I, I, I, I, I], &[I]),
    // Allocation
    ext(OPA_MALLOC, &[I], &[I]),
    ext(OPA_FREE, &[I], &[]),
    // Serialization
    ext(OPA_JSON_PARSE, &[I, I], &[I]),
    ext(OPA_JSON_DUMP, &[I], &[I]),
    ext(OPA_VALUE_PARSE, &[I, I], &[I]),
    ext(OPA_VALUE_DUMP, &[I], &[I]),
    // Construction
    ext(OPA_NULL, &[], &[I]),
    ext(OPA_BOOLEAN, &[I], &[I]),
    ext(OPA_NUMBER_INT, &[L], &[I]),
    ext(OPA_NUMBER_FLOAT, &[D], &[I]),
    ext(OPA_NUMBER_REF, &[I, I], &[I]),
    ext(OPA_NUMBER_SIZE, &[I], &[I]),
    ext(OPA_STRING_TERMINATED, &[I], &[I]),
    ext(OPA_ARRAY_WITH_CAP, &[I], &[I]),
    ext(OPA_OBJECT, &[], &[I]),
    ext(OPA_SET, &[], &[I]),
    // Mutation
    ext(OPA_ARRAY_APPEND, &[I, I], &[]),
    ext(OPA_OBJECT_INSERT, &[I, I, I], &[]),
    ext(OPA_SET_ADD, &[I, I], &[]),
    ext(OPA_VALUE_MERGE, &[I, I], &[I]),
    ext(OPA_VALUE_BOOLEAN_SET, &[I, I], &[]),
    ext(OPA_VALUE_NUMBER_SET_INT, &[I, L], &[]),
    // Inspection
    ext(OPA_VALUE_GET, &[I, I], &[I]),
    ext(OPA_VALUE_ITER, &[I, I], &[I]),
    ext(OPA_VALUE_LENGTH, &[I], &[I]),
    ext(OPA_VALUE_TYPE, &[I], &[I]),
    ext(OPA_VALUE_COMPARE, &[I, I], &[I]),
    // Patch
    ext(OPA_VALUE_ADD_PATH, &[I, I, I], &[I]),
    ext(OPA_VALUE_REMOVE_PATH, &[I, I], &[I]),
    // Native builtins
    ext(OPA_ARITH_PLUS, &[I, I], &[I]),
    ext(OPA_ARITH_MINUS, &[I, I], &[I]),
    ext(OPA_ARITH_MULTIPLY, &[I, I], &[I]),
    ext(OPA_ARITH_DIVIDE, &[I, I], &[I]),
    ext(OPA_ARITH_REM, &[I, I], &[I]),
    ext(OPA_ARITH_ABS, &[I], &[I]),
    ext(OPA_AGG_COUNT, &[I], &[I]),
    ext(OPA_AGG_SUM, &[I], &[I]),
    ext(OPA_AGG_MAX, &[I], &[I]),
    ext(OPA_AGG_MIN, &[I], &[I]),
    ext(OPA_STRINGS_CONCAT, &[I, I], &[I]),
    ext(OPA_STRINGS_CONTAINS, &[I, I], &[I]),
    ext(OPA_STRINGS_STARTSWITH, &[I, I], &[I]),
    ext(OPA_STRINGS_ENDSWITH, &[I, I], &[I]),
    ext(OPA_STRINGS_LOWER, &[I], &[I]),
    ext(OPA_STRINGS_UPPER, &[I], &[I]),
    ext(OPA_TYPES_IS_NUMBER, &[I], &[I]),
    ext(OPA_TYPES_IS_STRING, &[I], &[I]),
    ext(OPA_TYPES_IS_BOOLEAN, &[I], &[I]),
    ext(OPA_TYPES_IS_ARRAY, &[I], &[I]),
    ext(OPA_TYPES_IS_OBJECT, &[I], &[I]),
    ext(OPA_TYPES_IS_SET, &[I], &[I]),
    ext(OPA_TYPES_IS_NULL, &[I], &[I]),
    ext(OPA_TYPES_NAME, &[I], &[I]),
    ext(OPA_REGEX_MATCH, &[I, I], &[I]),
];

/// Builtins implemented by a dedicated extern, keyed by builtin name.
pub const NATIVE_BUILTINS: &[(&str, &str)] = &[
    ("plus", OPA_ARITH_PLUS),
    ("minus", OPA_ARITH_MINUS),
    ("mul", OPA_ARITH_MULTIPLY),
    ("div", OPA_ARITH_DIVIDE),
    ("rem", OPA_ARITH_REM),
    ("abs", OPA_ARITH_ABS),
    ("count", OPA_AGG_COUNT),
    ("sum", OPA_AGG_SUM),
    ("max", OPA_AGG_MAX),
    ("min", OPA_AGG_MIN),
    ("concat", OPA_STRINGS_CONCAT),
    ("contains", OPA_STRINGS_CONTAINS),
    ("startswith", OPA_STRINGS_STARTSWITH),
    ("endswith", OPA_STRINGS_ENDSWITH),
    ("lower", OPA_STRINGS_LOWER),
    ("upper", OPA_STRINGS_UPPER),
    ("is_number", OPA_TYPES_IS_NUMBER),
    ("is_string", OPA_TYPES_IS_STRING),
    ("is_boolean", OPA_TYPES_IS_BOOLEAN),
    ("is_array", OPA_TYPES_IS_ARRAY),
    ("is_object", OPA_TYPES_IS_OBJECT),
    ("is_set", OPA_TYPES_IS_SET),
    ("is_null", OPA_TYPES_IS_NULL),
    ("type_name", OPA_TYPES_NAME),
    ("regex.match", OPA_REGEX_MATCH),
    ("re_match", OPA_REGEX_MATCH),
];

/// The dedicated extern for a builtin, if it has one.
pub fn native_builtin(name: &str) -> Option<&'static str> {
    NATIVE_BUILTINS
        .iter()
        .find(|(builtin, _)| *builtin == name)
        .map(|(_, ext)| *ext)
}

/// Look up an extern by name.
pub fn extern_named(name: &str) -> Option<&'static Extern> {
    EXTERNS.iter().find(|e| e.name == name)
}
