//! Integration tests for the Tollgate WASM compiler.
//!
//! Tests validate:
//! - Policies compile to valid WASM against the host-runtime ABI
//! - Module structure (imports, exports, globals, data segment)
//! - Pruning keeps code and names in lockstep and drops unused externs
//! - Call resolution and its errors
//! - Deterministic output (same IR → same bytes)

use std::collections::BTreeSet;

use tollgate_codegen::instr::Instr;
use tollgate_codegen::module::Code;
use tollgate_codegen::types::*;
use tollgate_codegen::{compile, compile_module, CodegenError, CompileOptions, Module};
use tollgate_ir::Policy;
use wasmparser::{ExternalKind, Parser as WasmParser, Payload, TypeRef};

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

/// Parse planner JSON (panics on error).
fn policy(json: &str) -> Policy {
    Policy::from_json(json.as_bytes()).unwrap_or_else(|e| panic!("bad IR: {e}"))
}

/// Compile planner JSON to WASM bytes (panics on error).
fn compile_json(json: &str) -> Vec<u8> {
    compile(&policy(json), &CompileOptions::default())
        .unwrap_or_else(|e| panic!("codegen failed: {e}"))
}

fn try_compile(json: &str) -> Result<Vec<u8>, CodegenError> {
    compile(&policy(json), &CompileOptions::default())
}

/// Wrap plan statements into a one-entrypoint policy.
fn single_plan(strings: &[&str], stmts: &str) -> String {
    let strings: Vec<String> = strings
        .iter()
        .map(|s| format!(r#"{{"value": "{s}"}}"#))
        .collect();
    format!(
        r#"{{
            "static": {{"strings": [{}]}},
            "plans": {{"plans": [{{"name": "test/p", "blocks": [{{"stmts": [{stmts}]}}]}}]}}
        }}"#,
        strings.join(",")
    )
}

/// `input.foo == 1`, adding `{"result": true}` to the result set.
const INPUT_FOO_EQ_1: &str = r#"{
    "static": {"strings": [{"value": "foo"}, {"value": "result"}]},
    "plans": {"plans": [{"name": "example/allow", "blocks": [{"stmts": [
        {"type": "MakeStringStmt", "stmt": {"index": 0, "target": 2}},
        {"type": "DotStmt", "stmt": {"source": 0, "key": 2, "target": 3}},
        {"type": "MakeNumberIntStmt", "stmt": {"value": 1, "target": 4}},
        {"type": "EqualStmt", "stmt": {"a": 3, "b": 4}},
        {"type": "MakeObjectStmt", "stmt": {"target": 5}},
        {"type": "MakeStringStmt", "stmt": {"index": 1, "target": 6}},
        {"type": "MakeBooleanStmt", "stmt": {"value": true, "target": 7}},
        {"type": "ObjectInsertStmt", "stmt": {"key": 6, "value": 7, "object": 5}},
        {"type": "ResultSetAddStmt", "stmt": {"value": 5}}
    ]}]}]}
}"#;

fn get_exports(wasm: &[u8]) -> Vec<(String, ExternalKind)> {
    let mut exports = Vec::new();
    for payload in WasmParser::new(0).parse_all(wasm) {
        if let Ok(Payload::ExportSection(reader)) = payload {
            for export in reader {
                let exp = export.expect("valid export");
                exports.push((exp.name.to_string(), exp.kind));
            }
        }
    }
    exports
}

/// Names of imported functions, in order.
fn get_func_imports(wasm: &[u8]) -> Vec<String> {
    let mut imports = Vec::new();
    for payload in WasmParser::new(0).parse_all(wasm) {
        if let Ok(Payload::ImportSection(reader)) = payload {
            for import in reader {
                let import = import.expect("valid import");
                if matches!(import.ty, TypeRef::Func(_)) {
                    imports.push(import.name.to_string());
                }
            }
        }
    }
    imports
}

fn decode(wasm: &[u8]) -> Module {
    Module::decode(wasm).unwrap_or_else(|e| panic!("decode failed: {e}"))
}

fn global_export(m: &Module, name: &str) -> i32 {
    let export = m.export(name).unwrap_or_else(|| panic!("missing {name}"));
    m.globals[export.index as usize].init
}

// ══════════════════════════════════════════════════════════════════════════════
// Module structure
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn ground_comparison_compiles_to_valid_wasm() {
    let wasm = compile_json(INPUT_FOO_EQ_1);
    assert_eq!(&wasm[0..4], b"\0asm");
    wasmparser::validate(&wasm).expect("valid module");
}

#[test]
fn has_required_exports() {
    let wasm = compile_json(INPUT_FOO_EQ_1);
    let exports = get_exports(&wasm);
    for name in [
        EXPORT_EVAL,
        EXPORT_ONE_SHOT_EVAL,
        EXPORT_BUILTINS,
        EXPORT_ENTRYPOINTS,
        "opa_eval_ctx_new",
        "opa_eval_ctx_set_input",
        "opa_eval_ctx_set_data",
        "opa_eval_ctx_set_entrypoint",
        "opa_eval_ctx_get_result",
        "opa_heap_ptr_get",
        "opa_heap_ptr_set",
    ] {
        let kind = exports.iter().find(|(n, _)| n == name).map(|(_, k)| *k);
        assert_eq!(kind, Some(ExternalKind::Func), "missing {name}");
    }
    for name in [HEAP_PTR_GLOBAL, ABI_VERSION_GLOBAL, ABI_MINOR_VERSION_GLOBAL] {
        let kind = exports.iter().find(|(n, _)| n == name).map(|(_, k)| *k);
        assert_eq!(kind, Some(ExternalKind::Global), "missing {name}");
    }
}

#[test]
fn memory_is_imported_from_env() {
    let wasm = compile_json(INPUT_FOO_EQ_1);
    let mut found = false;
    for payload in WasmParser::new(0).parse_all(&wasm) {
        if let Ok(Payload::ImportSection(reader)) = payload {
            for import in reader {
                let import = import.unwrap();
                if let TypeRef::Memory(mem) = import.ty {
                    assert_eq!((import.module, import.name), (HOST_MODULE, MEMORY_IMPORT));
                    assert!(mem.initial >= MEMORY_MIN_PAGES);
                    found = true;
                }
            }
        }
    }
    assert!(found, "memory import missing");
}

#[test]
fn abi_version_globals() {
    let m = decode(&compile_json(INPUT_FOO_EQ_1));
    assert_eq!(global_export(&m, ABI_VERSION_GLOBAL), ABI_VERSION);
    assert_eq!(global_export(&m, ABI_MINOR_VERSION_GLOBAL), ABI_MINOR_VERSION);
}

#[test]
fn strings_start_at_base_and_heap_follows_aligned() {
    let m = decode(&compile_json(INPUT_FOO_EQ_1));
    assert_eq!(m.data.len(), 1);
    let segment = &m.data[0];
    assert_eq!(segment.offset, STRING_BASE);
    assert!(segment.bytes.starts_with(b"foo\0result\0example/allow\0"));
    assert!(segment
        .bytes
        .windows(ERR_VAR_ASSIGN_CONFLICT.len())
        .any(|w| w == ERR_VAR_ASSIGN_CONFLICT.as_bytes()));

    let heap = global_export(&m, HEAP_PTR_GLOBAL) as u32;
    assert_eq!(heap % 8, 0);
    assert!(heap >= segment.end());
    assert!(heap < segment.end() + 8);
}

#[test]
fn types_are_deduplicated() {
    let m = decode(&compile_json(INPUT_FOO_EQ_1));
    let mut seen = Vec::new();
    for ty in &m.types {
        assert!(!seen.contains(&ty), "duplicate type {ty:?}");
        seen.push(ty);
    }
}

#[test]
fn compilation_is_deterministic() {
    assert_eq!(compile_json(INPUT_FOO_EQ_1), compile_json(INPUT_FOO_EQ_1));
}

// ══════════════════════════════════════════════════════════════════════════════
// Pruning
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn unused_externs_are_not_linked() {
    let imports = get_func_imports(&compile_json(INPUT_FOO_EQ_1));
    for name in ["opa_value_compare", "opa_value_get", "opa_set_add"] {
        assert!(imports.iter().any(|i| i == name), "{name} should be linked");
    }
    for name in [
        "opa_regex_match",
        "opa_strings_concat",
        "opa_arith_plus",
        "opa_builtin0",
        "opa_value_add_path",
    ] {
        assert!(!imports.iter().any(|i| i == name), "{name} should be pruned");
    }
}

#[test]
fn every_function_has_code_and_name_in_lockstep() {
    let m = decode(&compile_json(INPUT_FOO_EQ_1));
    assert_eq!(m.funcs.len(), m.code.len());
    let named: BTreeSet<u32> = m.names.keys().copied().collect();
    let all: BTreeSet<u32> = (0..m.func_count()).collect();
    assert_eq!(named, all);
}

#[test]
fn unreachable_ir_functions_are_pruned() {
    let json = r#"{
        "plans": {"plans": [{"name": "p", "blocks": [{"stmts": [
            {"type": "CallStmt", "stmt": {"func": "g0.used", "args": [0, 1], "result": 2}},
            {"type": "ResultSetAddStmt", "stmt": {"value": 2}}
        ]}]}]},
        "funcs": {"funcs": [
            {"name": "g0.used", "params": [0, 1], "return": 2, "blocks": [{"stmts": [
                {"type": "MakeNullStmt", "stmt": {"target": 2}},
                {"type": "ReturnLocalStmt", "stmt": {"source": 2}}
            ]}]},
            {"name": "g0.unused", "params": [0, 1], "return": 2, "blocks": [{"stmts": [
                {"type": "ReturnLocalStmt", "stmt": {"source": 2}}
            ]}]}
        ]}
    }"#;
    let m = decode(&compile_json(json));
    let names: Vec<&str> = m.names.values().map(String::as_str).collect();
    assert!(names.contains(&"g0.used"));
    assert!(!names.contains(&"g0.unused"));
    assert!(m.export("g0.used").is_none(), "IR functions are internal");
}

#[test]
fn ir_function_calls_are_remapped_after_pruning() {
    let json = r#"{
        "plans": {"plans": [{"name": "p", "blocks": [{"stmts": [
            {"type": "CallStmt", "stmt": {"func": "g0.f", "args": [0, 1], "result": 2}},
            {"type": "ResultSetAddStmt", "stmt": {"value": 2}}
        ]}]}]},
        "funcs": {"funcs": [
            {"name": "g0.f", "params": [0, 1], "return": 2, "blocks": [{"stmts": [
                {"type": "AssignVarStmt", "stmt": {"source": 0, "target": 2}}
            ]}]}
        ]}
    }"#;
    let m = compile_module(&policy(json)).unwrap();
    let f = m.func_by_name("g0.f").expect("g0.f kept");
    let eval = m.export(EXPORT_EVAL).unwrap().index;
    let Code::Body(body) = &m.code[(eval - m.func_import_count()) as usize] else {
        panic!("eval has a raw body");
    };
    let mut calls = Vec::new();
    body.walk(&mut |i| {
        if let Instr::Call(idx) = i {
            calls.push(*idx);
        }
    });
    assert!(calls.contains(&f), "eval must call g0.f at {f}: {calls:?}");
}

// ══════════════════════════════════════════════════════════════════════════════
// Statements
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn control_and_structured_statements_compile() {
    let json = single_plan(
        &["k"],
        r#"
        {"type": "MakeObjectStmt", "stmt": {"target": 2}},
        {"type": "ScanStmt", "stmt": {"source": 0, "key": 3, "value": 4, "block": {"stmts": [
            {"type": "IsObjectStmt", "stmt": {"source": 4}},
            {"type": "NotStmt", "stmt": {"block": {"stmts": [
                {"type": "IsUndefinedStmt", "stmt": {"source": 4}}
            ]}}},
            {"type": "ObjectInsertOnceStmt", "stmt": {"key": 3, "value": 4, "object": 2}}
        ]}}},
        {"type": "BlockStmt", "stmt": {"blocks": [
            {"stmts": [{"type": "BreakStmt", "stmt": {"index": 0}}]},
            {"stmts": [{"type": "NopStmt"}]}
        ]}},
        {"type": "LenStmt", "stmt": {"source": 2, "target": 5}},
        {"type": "MakeNumberRefStmt", "stmt": {"index": 0, "target": 6}},
        {"type": "MakeNumberFloatStmt", "stmt": {"value": 1.5, "target": 7}},
        {"type": "LessThanStmt", "stmt": {"a": 5, "b": 7}},
        {"type": "AssignVarOnceStmt", "stmt": {"source": 5, "target": 8}},
        {"type": "AssignIntStmt", "stmt": {"value": 3, "target": 5}},
        {"type": "MakeSetStmt", "stmt": {"target": 9}},
        {"type": "SetAddStmt", "stmt": {"value": 5, "set": 9}},
        {"type": "MakeArrayStmt", "stmt": {"capacity": 2, "target": 10}},
        {"type": "ArrayAppendStmt", "stmt": {"value": 9, "array": 10}},
        {"type": "IsArrayStmt", "stmt": {"source": 10}},
        {"type": "ObjectMergeStmt", "stmt": {"a": 2, "b": 2, "target": 11}},
        {"type": "ResultSetAddStmt", "stmt": {"value": 11}}
        "#,
    );
    let wasm = compile_json(&json);
    wasmparser::validate(&wasm).expect("valid module");
    let imports = get_func_imports(&wasm);
    for name in ["opa_value_iter", "opa_abort", "opa_number_ref", "opa_value_merge"] {
        assert!(imports.iter().any(|i| i == name), "{name} should be linked");
    }
}

#[test]
fn with_statement_is_illegal() {
    let json = single_plan(
        &[],
        r#"{"type": "WithStmt", "stmt": {"local": 0, "path": [], "value": 1, "block": {"stmts": []}}}"#,
    );
    match try_compile(&json) {
        Err(CodegenError::IllegalStatement(kind)) => assert_eq!(kind, "WithStmt"),
        other => panic!("expected illegal statement, got {other:?}"),
    }
}

#[test]
fn call_dynamic_statement_is_illegal() {
    let json = single_plan(
        &[],
        r#"{"type": "CallDynamicStmt", "stmt": {"path": [2], "args": [0, 1], "result": 3}}"#,
    );
    assert!(matches!(
        try_compile(&json),
        Err(CodegenError::IllegalStatement(_))
    ));
}

#[test]
fn result_set_add_outside_a_plan_is_illegal() {
    let json = r#"{
        "funcs": {"funcs": [{"name": "f", "params": [0], "return": 1, "blocks": [{"stmts": [
            {"type": "ResultSetAddStmt", "stmt": {"value": 0}}
        ]}]}]}
    }"#;
    assert!(matches!(
        try_compile(json),
        Err(CodegenError::IllegalStatement(_))
    ));
}

// ══════════════════════════════════════════════════════════════════════════════
// Call resolution
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn unknown_function_is_illegal_reference() {
    let json = single_plan(
        &[],
        r#"{"type": "CallStmt", "stmt": {"func": "no.such.func", "args": [], "result": 2}}"#,
    );
    match try_compile(&json) {
        Err(CodegenError::IllegalFunctionReference(name)) => assert_eq!(name, "no.such.func"),
        other => panic!("expected illegal function reference, got {other:?}"),
    }
}

#[test]
fn native_builtin_links_its_extern() {
    let json = r#"{
        "static": {"builtin_funcs": [{"name": "plus"}]},
        "plans": {"plans": [{"name": "p", "blocks": [{"stmts": [
            {"type": "MakeNumberIntStmt", "stmt": {"value": 1, "target": 2}},
            {"type": "CallStmt", "stmt": {"func": "plus", "args": [2, 2], "result": 3}},
            {"type": "ResultSetAddStmt", "stmt": {"value": 3}}
        ]}]}]}
    }"#;
    let wasm = compile_json(json);
    let imports = get_func_imports(&wasm);
    assert!(imports.iter().any(|i| i == "opa_arith_plus"));
    assert!(!imports.iter().any(|i| i.starts_with("opa_builtin")));

    // Native builtins are not part of the dispatch table.
    let m = decode(&wasm);
    assert!(!m.data[0].bytes.windows(5).any(|w| w == b"plus\0"));
}

#[test]
fn native_builtin_arity_is_checked() {
    let json = r#"{
        "plans": {"plans": [{"name": "p", "blocks": [{"stmts": [
            {"type": "CallStmt", "stmt": {"func": "abs", "args": [0, 1], "result": 2}}
        ]}]}]}
    }"#;
    assert!(matches!(
        try_compile(json),
        Err(CodegenError::IllegalFunctionReference(_))
    ));
}

#[test]
fn declared_builtin_goes_through_dispatcher() {
    let json = r#"{
        "static": {"builtin_funcs": [{"name": "time.now_ns"}, {"name": "crypto.sha256"}]},
        "plans": {"plans": [{"name": "p", "blocks": [{"stmts": [
            {"type": "CallStmt", "stmt": {"func": "crypto.sha256", "args": [0], "result": 2}},
            {"type": "ResultSetAddStmt", "stmt": {"value": 2}}
        ]}]}]}
    }"#;
    let wasm = compile_json(json);
    let imports = get_func_imports(&wasm);
    assert!(imports.iter().any(|i| i == "opa_builtin1"));
    assert!(!imports.iter().any(|i| i == "opa_builtin0"));

    let m = decode(&wasm);
    assert!(m.data[0]
        .bytes
        .windows(b"time.now_ns\0crypto.sha256\0".len())
        .any(|w| w == b"time.now_ns\0crypto.sha256\0"));
}

#[test]
fn builtin_with_too_many_arguments_exceeds_limit() {
    let json = r#"{
        "static": {"builtin_funcs": [{"name": "custom.wide"}]},
        "plans": {"plans": [{"name": "p", "blocks": [{"stmts": [
            {"type": "CallStmt", "stmt": {"func": "custom.wide", "args": [0, 0, 0, 0, 0], "result": 2}}
        ]}]}]}
    }"#;
    assert!(matches!(
        try_compile(json),
        Err(CodegenError::LimitExceeded(_))
    ));
}

#[test]
fn ir_function_shadows_builtin_of_same_name() {
    let json = r#"{
        "static": {"builtin_funcs": [{"name": "count"}]},
        "plans": {"plans": [{"name": "p", "blocks": [{"stmts": [
            {"type": "CallStmt", "stmt": {"func": "count", "args": [0], "result": 2}},
            {"type": "ResultSetAddStmt", "stmt": {"value": 2}}
        ]}]}]},
        "funcs": {"funcs": [{"name": "count", "params": [0], "return": 1, "blocks": [{"stmts": [
            {"type": "AssignVarStmt", "stmt": {"source": 0, "target": 1}}
        ]}]}]}
    }"#;
    let imports = get_func_imports(&compile_json(json));
    assert!(!imports.iter().any(|i| i == "opa_agg_count"));
}

#[test]
fn options_default_to_no_optimizer() {
    let options = CompileOptions::default();
    assert!(!options.optimize);
    assert_eq!(options.optimizer.program, "wasm-opt");
}
