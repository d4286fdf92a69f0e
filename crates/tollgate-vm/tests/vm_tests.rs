//! End-to-end tests: compile IR with `tollgate-codegen`, run it in the VM.
//!
//! Tests validate:
//! - Evaluation results for input and data lookups
//! - Repeated evaluation and clones produce identical output
//! - Runtime conflicts surface as the recorded abort message
//! - Data patching is atomic on failure
//! - Native and dispatched builtins, hooks and capabilities
//! - The context-based path used by older modules

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tollgate_codegen::types::{
    ABI_MINOR_VERSION_GLOBAL, ABI_VERSION, EXPORT_EVAL, EXPORT_ONE_SHOT_EVAL,
};
use tollgate_codegen::{compile, CompileOptions, Module};
use tollgate_ir::Policy;
use tollgate_vm::error::code;
use tollgate_vm::{EvalOptions, InterQueryCache, Vm, VmConfig, VmError};

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

fn compile_json(json: &str) -> Vec<u8> {
    let policy = Policy::from_json(json.as_bytes()).unwrap_or_else(|e| panic!("bad IR: {e}"));
    compile(&policy, &CompileOptions::default()).unwrap_or_else(|e| panic!("codegen failed: {e}"))
}

fn load(json: &str, data: Option<&str>) -> Vm {
    Vm::load(compile_json(json), data.map(str::as_bytes), VmConfig::default())
        .unwrap_or_else(|e| panic!("load failed: {e}"))
}

/// Evaluate the only entrypoint and parse the result set.
fn eval_with(vm: &mut Vm, options: EvalOptions) -> Result<Value, VmError> {
    let id = *vm.entrypoints().values().next().expect("one entrypoint");
    let text = vm.eval(id, options)?;
    Ok(serde_json::from_str(&text).expect("result is JSON"))
}

fn eval(vm: &mut Vm, input: &str) -> Value {
    eval_with(vm, EvalOptions::new().with_input(input)).unwrap_or_else(|e| panic!("eval: {e}"))
}

/// Wrap plan statements into a one-entrypoint policy.
fn single_plan(strings: &[&str], builtins: &[&str], stmts: &str) -> String {
    let strings: Vec<String> = strings
        .iter()
        .map(|s| format!(r#"{{"value": "{s}"}}"#))
        .collect();
    let builtins: Vec<String> = builtins
        .iter()
        .map(|b| format!(r#"{{"name": "{b}"}}"#))
        .collect();
    format!(
        r#"{{
            "static": {{"strings": [{}], "builtin_funcs": [{}]}},
            "plans": {{"plans": [{{"name": "test/p", "blocks": [{{"stmts": [{stmts}]}}]}}]}}
        }}"#,
        strings.join(","),
        builtins.join(",")
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

/// `{"role": data.roles[input.user]}`.
fn role_lookup() -> String {
    single_plan(
        &["roles", "user", "role"],
        &[],
        r#"
        {"type": "MakeStringStmt", "stmt": {"index": 0, "target": 2}},
        {"type": "DotStmt", "stmt": {"source": 1, "key": 2, "target": 3}},
        {"type": "MakeStringStmt", "stmt": {"index": 1, "target": 4}},
        {"type": "DotStmt", "stmt": {"source": 0, "key": 4, "target": 5}},
        {"type": "DotStmt", "stmt": {"source": 3, "key": 5, "target": 6}},
        {"type": "MakeObjectStmt", "stmt": {"target": 7}},
        {"type": "MakeStringStmt", "stmt": {"index": 2, "target": 8}},
        {"type": "ObjectInsertStmt", "stmt": {"key": 8, "value": 6, "object": 7}},
        {"type": "ResultSetAddStmt", "stmt": {"value": 7}}
        "#,
    )
}

/// Every element of `input.items`, as a set.
fn scan_items() -> String {
    single_plan(
        &["items"],
        &[],
        r#"
        {"type": "MakeStringStmt", "stmt": {"index": 0, "target": 2}},
        {"type": "DotStmt", "stmt": {"source": 0, "key": 2, "target": 3}},
        {"type": "ScanStmt", "stmt": {"source": 3, "key": 4, "value": 5, "block": {"stmts": [
            {"type": "ResultSetAddStmt", "stmt": {"value": 5}}
        ]}}}
        "#,
    )
}

/// Call `func` on string constant 0 and add the result.
fn call_on_string(func: &str, builtins: &[&str]) -> String {
    single_plan(
        &["abc"],
        builtins,
        &format!(
            r#"
            {{"type": "MakeStringStmt", "stmt": {{"index": 0, "target": 2}}}},
            {{"type": "CallStmt", "stmt": {{"func": "{func}", "args": [2], "result": 3}}}},
            {{"type": "ResultSetAddStmt", "stmt": {{"value": 3}}}}
            "#
        ),
    )
}

// ══════════════════════════════════════════════════════════════════════════════
// Evaluation
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn ground_comparison_against_input() {
    let mut vm = load(INPUT_FOO_EQ_1, None);
    assert_eq!(vm.abi_version().0, ABI_VERSION);
    assert_eq!(vm.entrypoint_id("example/allow").unwrap(), 0);
    assert_eq!(eval(&mut vm, r#"{"foo": 1}"#), json!([{"result": true}]));
    assert_eq!(eval(&mut vm, r#"{"foo": 2}"#), json!([]));
}

#[test]
fn missing_input_is_undefined() {
    let mut vm = load(INPUT_FOO_EQ_1, None);
    assert_eq!(eval_with(&mut vm, EvalOptions::new()).unwrap(), json!([]));
}

#[test]
fn repeated_evaluation_is_identical() {
    let mut vm = load(&role_lookup(), Some(r#"{"roles": {"alice": "admin"}}"#));
    let id = vm.entrypoint_id("test/p").unwrap();
    let first = vm
        .eval(id, EvalOptions::new().with_input(r#"{"user": "alice"}"#))
        .unwrap();
    for _ in 0..20 {
        let again = vm
            .eval(id, EvalOptions::new().with_input(r#"{"user": "alice"}"#))
            .unwrap();
        assert_eq!(again, first);
    }
    assert_eq!(first, r#"[{"role":"admin"}]"#);
}

#[test]
fn scan_visits_every_element() {
    let mut vm = load(&scan_items(), None);
    assert_eq!(eval(&mut vm, r#"{"items": [3, 1, 3, 2]}"#), json!([1, 2, 3]));
    assert_eq!(eval(&mut vm, r#"{"items": []}"#), json!([]));
    assert_eq!(eval(&mut vm, r#"{"items": {"a": "x", "b": "y"}}"#), json!(["x", "y"]));
}

#[test]
fn not_succeeds_only_when_its_block_is_undefined() {
    let plan = single_plan(
        &["x"],
        &[],
        r#"
        {"type": "NotStmt", "stmt": {"block": {"stmts": [
            {"type": "MakeStringStmt", "stmt": {"index": 0, "target": 2}},
            {"type": "DotStmt", "stmt": {"source": 0, "key": 2, "target": 3}}
        ]}}},
        {"type": "MakeBooleanStmt", "stmt": {"value": true, "target": 4}},
        {"type": "ResultSetAddStmt", "stmt": {"value": 4}}
        "#,
    );
    let mut vm = load(&plan, None);
    assert_eq!(eval(&mut vm, r#"{"x": 1}"#), json!([]));
    assert_eq!(eval(&mut vm, r#"{"y": 1}"#), json!([true]));
}

#[test]
fn ir_function_result_feeds_the_plan() {
    let json = r#"{
        "static": {"strings": [{"value": "x"}]},
        "plans": {"plans": [{"name": "test/p", "blocks": [{"stmts": [
            {"type": "CallStmt", "stmt": {"func": "g0.x", "args": [0, 1], "result": 2}},
            {"type": "ResultSetAddStmt", "stmt": {"value": 2}}
        ]}]}]},
        "funcs": {"funcs": [
            {"name": "g0.x", "params": [0, 1], "return": 2, "blocks": [{"stmts": [
                {"type": "MakeStringStmt", "stmt": {"index": 0, "target": 3}},
                {"type": "DotStmt", "stmt": {"source": 0, "key": 3, "target": 4}},
                {"type": "AssignVarStmt", "stmt": {"source": 4, "target": 2}},
                {"type": "ReturnLocalStmt", "stmt": {"source": 2}}
            ]}]}
        ]}
    }"#;
    let mut vm = load(json, None);
    assert_eq!(eval(&mut vm, r#"{"x": 5}"#), json!([5]));
    assert_eq!(eval(&mut vm, r#"{"y": 5}"#), json!([]));
}

#[test]
fn insert_once_accepts_equal_values_and_aborts_on_conflict() {
    let plan = |second: i64| {
        single_plan(
            &["k"],
            &[],
            &format!(
                r#"
                {{"type": "MakeObjectStmt", "stmt": {{"target": 2}}}},
                {{"type": "MakeStringStmt", "stmt": {{"index": 0, "target": 3}}}},
                {{"type": "MakeNumberIntStmt", "stmt": {{"value": 1, "target": 4}}}},
                {{"type": "MakeNumberIntStmt", "stmt": {{"value": {second}, "target": 5}}}},
                {{"type": "ObjectInsertOnceStmt", "stmt": {{"key": 3, "value": 4, "object": 2}}}},
                {{"type": "ObjectInsertOnceStmt", "stmt": {{"key": 3, "value": 5, "object": 2}}}},
                {{"type": "ResultSetAddStmt", "stmt": {{"value": 2}}}}
                "#
            ),
        )
    };

    let mut same = load(&plan(1), None);
    assert_eq!(eval_with(&mut same, EvalOptions::new()).unwrap(), json!([{"k": 1}]));

    let mut clash = load(&plan(2), None);
    let err = eval_with(&mut clash, EvalOptions::new()).unwrap_err();
    assert!(
        matches!(&err, VmError::Abort(msg) if msg == "object insert conflict"),
        "{err}"
    );
}

#[test]
fn scans_over_empty_collections_fall_through() {
    let plan = single_plan(
        &[],
        &[],
        r#"
        {"type": "MakeSetStmt", "stmt": {"target": 2}},
        {"type": "ScanStmt", "stmt": {"source": 2, "key": 3, "value": 4, "block": {"stmts": [
            {"type": "ResultSetAddStmt", "stmt": {"value": 4}}
        ]}}},
        {"type": "MakeObjectStmt", "stmt": {"target": 5}},
        {"type": "ScanStmt", "stmt": {"source": 5, "key": 6, "value": 7, "block": {"stmts": [
            {"type": "ResultSetAddStmt", "stmt": {"value": 7}}
        ]}}},
        {"type": "MakeBooleanStmt", "stmt": {"value": true, "target": 8}},
        {"type": "ResultSetAddStmt", "stmt": {"value": 8}}
        "#,
    );
    let mut vm = load(&plan, None);
    assert_eq!(eval_with(&mut vm, EvalOptions::new()).unwrap(), json!([true]));
}

#[test]
fn break_leaves_the_chosen_enclosing_block() {
    let plan = |index: u32| {
        single_plan(
            &[],
            &[],
            &format!(
                r#"
                {{"type": "BlockStmt", "stmt": {{"blocks": [{{"stmts": [
                    {{"type": "BlockStmt", "stmt": {{"blocks": [{{"stmts": [
                        {{"type": "BreakStmt", "stmt": {{"index": {index}}}}}
                    ]}}]}}}},
                    {{"type": "MakeNumberIntStmt", "stmt": {{"value": 1, "target": 2}}}},
                    {{"type": "ResultSetAddStmt", "stmt": {{"value": 2}}}}
                ]}}]}}}},
                {{"type": "MakeNumberIntStmt", "stmt": {{"value": 2, "target": 3}}}},
                {{"type": "ResultSetAddStmt", "stmt": {{"value": 3}}}}
                "#
            ),
        )
    };

    let mut inner = load(&plan(0), None);
    assert_eq!(eval_with(&mut inner, EvalOptions::new()).unwrap(), json!([1, 2]));
    let mut outer = load(&plan(1), None);
    assert_eq!(eval_with(&mut outer, EvalOptions::new()).unwrap(), json!([2]));
}

#[test]
fn assignment_conflict_aborts_with_its_message() {
    let plan = |second: i64| {
        single_plan(
            &[],
            &[],
            &format!(
                r#"
                {{"type": "MakeNumberIntStmt", "stmt": {{"value": 1, "target": 2}}}},
                {{"type": "MakeNumberIntStmt", "stmt": {{"value": {second}, "target": 3}}}},
                {{"type": "AssignVarOnceStmt", "stmt": {{"source": 2, "target": 4}}}},
                {{"type": "AssignVarOnceStmt", "stmt": {{"source": 3, "target": 4}}}},
                {{"type": "ResultSetAddStmt", "stmt": {{"value": 4}}}}
                "#
            ),
        )
    };

    let mut same = load(&plan(1), None);
    assert_eq!(eval_with(&mut same, EvalOptions::new()).unwrap(), json!([1]));

    let mut clash = load(&plan(2), None);
    let err = eval_with(&mut clash, EvalOptions::new()).unwrap_err();
    assert!(
        matches!(&err, VmError::Abort(msg) if msg == "var assignment conflict"),
        "{err}"
    );
    // The instance stays usable after a trap.
    let err = eval_with(&mut clash, EvalOptions::new()).unwrap_err();
    assert!(matches!(err, VmError::Abort(_)));
}

#[test]
fn unknown_entrypoint_and_bad_input_are_rejected() {
    let mut vm = load(INPUT_FOO_EQ_1, None);
    assert!(matches!(
        vm.entrypoint_id("nope"),
        Err(VmError::UnknownEntrypoint(_))
    ));
    assert!(matches!(
        vm.eval(7, EvalOptions::new()),
        Err(VmError::UnknownEntrypoint(_))
    ));
    assert!(matches!(
        vm.eval(0, EvalOptions::new().with_input("{not json")),
        Err(VmError::Json(_))
    ));
}

#[test]
fn data_that_outgrows_memory_fails_the_load() {
    let big = serde_json::to_vec(&json!({"blob": "x".repeat(200_000)})).unwrap();
    let config = VmConfig {
        memory_min_pages: 2,
        memory_max_pages: 2,
        ..VmConfig::default()
    };
    let result = Vm::load(compile_json(INPUT_FOO_EQ_1), Some(&big), config);
    assert!(matches!(result, Err(VmError::Heap(_))));
}

// ══════════════════════════════════════════════════════════════════════════════
// Data
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn data_paths_update_later_evaluations() {
    let mut vm = load(&role_lookup(), Some(r#"{"roles": {"alice": "admin"}}"#));
    assert_eq!(eval(&mut vm, r#"{"user": "bob"}"#), json!([]));

    vm.set_data_path(&["roles", "bob"], &json!("dev")).unwrap();
    assert_eq!(eval(&mut vm, r#"{"user": "bob"}"#), json!([{"role": "dev"}]));
    assert_eq!(eval(&mut vm, r#"{"user": "alice"}"#), json!([{"role": "admin"}]));

    vm.remove_data_path(&["roles", "alice"]).unwrap();
    assert_eq!(eval(&mut vm, r#"{"user": "alice"}"#), json!([]));
    assert_eq!(
        vm.data_path(&["roles"]).unwrap(),
        Some(json!({"bob": "dev"}))
    );
}

#[test]
fn failed_patch_leaves_data_untouched() {
    let mut vm = load(&role_lookup(), Some(r#"{"roles": {"alice": "admin"}}"#));
    let before = vm.data_path(&[]).unwrap();

    let err = vm
        .set_data_path(&["roles", "alice", "deep"], &json!(1))
        .unwrap_err();
    assert!(
        matches!(&err, VmError::DataPath { path, code: c } if path == "/roles/alice/deep" && *c == code::INVALID_TYPE),
        "{err}"
    );
    let err = vm.remove_data_path(&["roles", "carol"]).unwrap_err();
    assert!(matches!(err, VmError::DataPath { code: code::INVALID_PATH, .. }));

    assert_eq!(vm.data_path(&[]).unwrap(), before);
    assert_eq!(eval(&mut vm, r#"{"user": "alice"}"#), json!([{"role": "admin"}]));
}

#[test]
fn patch_that_runs_out_of_memory_leaves_data_untouched() {
    let plan = single_plan(&[], &[], r#"{"type": "ResultSetAddStmt", "stmt": {"value": 1}}"#);
    let config = VmConfig {
        memory_min_pages: 2,
        memory_max_pages: 2,
        ..VmConfig::default()
    };
    let mut vm = Vm::load(compile_json(&plan), Some(b"{}"), config).unwrap();
    let path = ["a", "b", "c", "d"];
    let attempt = |vm: &mut Vm, len: usize| {
        let result = vm.set_data_path(&path, &json!("s".repeat(len)));
        if let Err(err) = &result {
            assert!(matches!(err, VmError::Heap(_)), "{len}: {err}");
            assert_eq!(vm.data_path(&[]).unwrap(), Some(json!({})), "{len}");
            assert_eq!(eval_with(vm, EvalOptions::new()).unwrap(), json!([{}]), "{len}");
        }
        result.is_ok()
    };

    // Find the largest string that fits, then walk up to it in small steps
    // so the nested members are the allocations that fail.
    let fits = (0..128)
        .map(|k| 131_072 - k * 1024)
        .find(|&len| attempt(&mut vm.try_clone().unwrap(), len))
        .expect("some value fits");
    let mut failures = 0;
    let mut len = fits + 1024;
    while !attempt(&mut vm, len) {
        failures += 1;
        len -= 8;
    }
    assert!(failures > 0);
    assert_eq!(vm.data_path(&path).unwrap(), Some(json!("s".repeat(len))));
}

#[test]
fn patching_without_data_starts_from_an_empty_object() {
    let mut vm = load(&role_lookup(), None);
    assert_eq!(vm.data_path(&[]).unwrap(), None);
    vm.set_data_path(&["roles", "eve"], &json!("ops")).unwrap();
    assert_eq!(vm.data_path(&[]).unwrap(), Some(json!({"roles": {"eve": "ops"}})));
    assert_eq!(eval(&mut vm, r#"{"user": "eve"}"#), json!([{"role": "ops"}]));

    vm.remove_data_path(&[]).unwrap();
    assert_eq!(vm.data_path(&[]).unwrap(), Some(json!({})));
}

#[test]
fn set_policy_data_reloads_data_or_rebuilds() {
    let mut vm = load(&role_lookup(), Some(r#"{"roles": {"alice": "admin"}}"#));
    let policy = vm.policy().to_vec();

    vm.set_policy_data(&policy, Some(br#"{"roles": {"alice": "viewer"}}"#))
        .unwrap();
    assert_eq!(eval(&mut vm, r#"{"user": "alice"}"#), json!([{"role": "viewer"}]));

    vm.set_policy_data(&compile_json(INPUT_FOO_EQ_1), None).unwrap();
    assert!(vm.entrypoint_id("example/allow").is_ok());
    assert!(vm.entrypoint_id("test/p").is_err());
    assert_eq!(eval(&mut vm, r#"{"foo": 1}"#), json!([{"result": true}]));
}

#[test]
fn clones_share_data_but_not_state() {
    let mut vm = load(&role_lookup(), Some(r#"{"roles": {"alice": "admin"}}"#));
    vm.set_data_path(&["roles", "bob"], &json!("dev")).unwrap();
    let mut twin = vm.try_clone().unwrap();

    for user in ["alice", "bob", "carol"] {
        let input = format!(r#"{{"user": "{user}"}}"#);
        assert_eq!(eval(&mut twin, &input), eval(&mut vm, &input), "{user}");
    }

    vm.remove_data_path(&["roles", "bob"]).unwrap();
    assert_eq!(eval(&mut twin, r#"{"user": "bob"}"#), json!([{"role": "dev"}]));
    assert_eq!(eval(&mut vm, r#"{"user": "bob"}"#), json!([]));
}

// ══════════════════════════════════════════════════════════════════════════════
// Builtins
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn native_builtin_is_called_directly() {
    let plan = single_plan(
        &[],
        &[],
        r#"
        {"type": "MakeNumberIntStmt", "stmt": {"value": 2, "target": 2}},
        {"type": "MakeNumberIntStmt", "stmt": {"value": 3, "target": 3}},
        {"type": "CallStmt", "stmt": {"func": "plus", "args": [2, 3], "result": 4}},
        {"type": "ResultSetAddStmt", "stmt": {"value": 4}}
        "#,
    );
    let mut vm = load(&plan, None);
    assert_eq!(eval_with(&mut vm, EvalOptions::new()).unwrap(), json!([5]));
}

#[test]
fn dispatched_builtin_uses_the_shared_cache() {
    let mut vm = load(&call_on_string("crypto.sha256", &["crypto.sha256"]), None);
    let cache = Arc::new(InterQueryCache::new());
    let out = eval_with(&mut vm, EvalOptions::new().with_cache(cache.clone())).unwrap();
    assert_eq!(
        out,
        json!(["ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"])
    );
    assert_eq!(cache.len(), 1);
}

#[test]
fn clock_hook_feeds_time_now_ns() {
    let plan = single_plan(
        &[],
        &["time.now_ns"],
        r#"
        {"type": "CallStmt", "stmt": {"func": "time.now_ns", "args": [], "result": 2}},
        {"type": "ResultSetAddStmt", "stmt": {"value": 2}}
        "#,
    );
    let mut vm = load(&plan, None);
    let now = UNIX_EPOCH + Duration::from_secs(5);
    let out = eval_with(&mut vm, EvalOptions::new().with_now(now)).unwrap();
    assert_eq!(out, json!([5_000_000_000i64]));

    // Four centuries of nanoseconds do not fit an i64.
    let far = UNIX_EPOCH + Duration::from_secs(400 * 365 * 86_400);
    let out = eval_with(&mut vm, EvalOptions::new().with_now(far)).unwrap();
    assert_eq!(out, json!([i64::MAX]));
}

#[test]
fn print_hook_receives_lines() {
    let mut vm = load(&call_on_string("internal.print", &["internal.print"]), None);
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let out = eval_with(
        &mut vm,
        EvalOptions::new().with_print(move |line| sink.lock().push(line.to_string())),
    )
    .unwrap();
    assert_eq!(out, json!([true]));
    assert_eq!(*lines.lock(), vec!["abc".to_string()]);
}

#[test]
fn capabilities_restrict_dispatched_builtins() {
    let mut vm = load(&call_on_string("crypto.sha256", &["crypto.sha256"]), None);
    let err = eval_with(
        &mut vm,
        EvalOptions::new().with_capabilities(["time.now_ns"]),
    )
    .unwrap_err();
    assert!(matches!(err, VmError::Builtin(_)), "{err}");

    let ok = eval_with(
        &mut vm,
        EvalOptions::new().with_capabilities(["crypto.sha256"]),
    );
    assert!(ok.is_ok());
}

#[test]
fn cancelled_evaluation_stops() {
    let mut vm = load(&call_on_string("crypto.sha256", &["crypto.sha256"]), None);
    let flag = Arc::new(AtomicBool::new(true));
    let err = eval_with(&mut vm, EvalOptions::new().with_cancel(flag)).unwrap_err();
    assert!(matches!(err, VmError::Cancelled));
}

#[test]
fn unknown_builtin_fails_the_load() {
    let wasm = compile_json(&call_on_string("http.send", &["http.send"]));
    let result = Vm::load(wasm, None, VmConfig::default());
    assert!(matches!(result, Err(VmError::UnknownBuiltin(name)) if name == "http.send"));
}

// ══════════════════════════════════════════════════════════════════════════════
// Older modules
// ══════════════════════════════════════════════════════════════════════════════

/// Rewrite the module's minor version so the VM takes the context path.
fn with_minor_version(wasm: &[u8], minor: i32) -> Vec<u8> {
    let mut m = Module::decode(wasm).expect("decode");
    let index = m.export(ABI_MINOR_VERSION_GLOBAL).expect("minor export").index;
    m.globals[index as usize].init = minor;
    m.encode()
}

#[test]
fn context_path_matches_one_shot() {
    let data = r#"{"roles": {"alice": "admin"}}"#;
    let wasm = compile_json(&role_lookup());
    let mut modern = Vm::load(wasm.clone(), Some(data.as_bytes()), VmConfig::default()).unwrap();
    let mut legacy = Vm::load(
        with_minor_version(&wasm, 1),
        Some(data.as_bytes()),
        VmConfig::default(),
    )
    .unwrap();
    assert_eq!(legacy.abi_version(), (ABI_VERSION, 1));

    for input in [r#"{"user": "alice"}"#, r#"{"user": "bob"}"#] {
        assert_eq!(eval(&mut legacy, input), eval(&mut modern, input), "{input}");
    }
    assert_eq!(eval_with(&mut legacy, EvalOptions::new()).unwrap(), json!([]));
}

#[test]
fn missing_evaluation_export_fails_the_load() {
    let wasm = compile_json(&role_lookup());
    let without = |wasm: &[u8], name: &str| {
        let mut m = Module::decode(wasm).expect("decode");
        m.exports.retain(|e| e.name != name);
        m.encode()
    };

    let result = Vm::load(without(&wasm, EXPORT_ONE_SHOT_EVAL), None, VmConfig::default());
    assert!(matches!(result, Err(VmError::Instantiate(_))));

    let legacy = with_minor_version(&wasm, 1);
    assert!(Vm::load(without(&legacy, EXPORT_ONE_SHOT_EVAL), None, VmConfig::default()).is_ok());
    let result = Vm::load(without(&legacy, EXPORT_EVAL), None, VmConfig::default());
    assert!(matches!(result, Err(VmError::Instantiate(_))));
}
