//! Tests for `VmPool`: concurrent evaluation, pool-wide data updates, and
//! shutdown.

use std::thread;

use serde_json::{json, Value};
use tollgate_codegen::{compile, CompileOptions};
use tollgate_ir::Policy;
use tollgate_vm::{EvalOptions, VmConfig, VmError, VmPool};

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

/// `{"limit": data.limits[input.user]}`.
const LIMIT_LOOKUP: &str = r#"{
    "static": {"strings": [{"value": "limits"}, {"value": "user"}, {"value": "limit"}]},
    "plans": {"plans": [{"name": "quota/limit", "blocks": [{"stmts": [
        {"type": "MakeStringStmt", "stmt": {"index": 0, "target": 2}},
        {"type": "DotStmt", "stmt": {"source": 1, "key": 2, "target": 3}},
        {"type": "MakeStringStmt", "stmt": {"index": 1, "target": 4}},
        {"type": "DotStmt", "stmt": {"source": 0, "key": 4, "target": 5}},
        {"type": "DotStmt", "stmt": {"source": 3, "key": 5, "target": 6}},
        {"type": "MakeObjectStmt", "stmt": {"target": 7}},
        {"type": "MakeStringStmt", "stmt": {"index": 2, "target": 8}},
        {"type": "ObjectInsertStmt", "stmt": {"key": 8, "value": 6, "object": 7}},
        {"type": "ResultSetAddStmt", "stmt": {"value": 7}}
    ]}]}]}
}"#;

fn pool(size: usize) -> VmPool {
    let policy = Policy::from_json(LIMIT_LOOKUP.as_bytes()).unwrap();
    let wasm = compile(&policy, &CompileOptions::default()).unwrap();
    let data = br#"{"limits": {"u0": 0, "u1": 10, "u2": 20, "u3": 30}}"#;
    let config = VmConfig {
        pool_size: size,
        ..VmConfig::default()
    };
    VmPool::load(wasm, Some(data), config).unwrap()
}

fn limit(pool: &VmPool, user: &str) -> Value {
    let mut vm = pool.acquire().unwrap();
    let id = vm.entrypoint_id("quota/limit").unwrap();
    let input = format!(r#"{{"user": "{user}"}}"#);
    let text = vm.eval(id, EvalOptions::new().with_input(input)).unwrap();
    serde_json::from_str(&text).unwrap()
}

// ══════════════════════════════════════════════════════════════════════════════
// Tests
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn concurrent_evaluations_agree() {
    let pool = pool(3);
    assert_eq!(pool.size(), 3);

    thread::scope(|s| {
        for t in 0..8 {
            let pool = &pool;
            s.spawn(move || {
                for i in 0..25 {
                    let n = (t + i) % 4;
                    let got = limit(pool, &format!("u{n}"));
                    assert_eq!(got, json!([{"limit": n * 10}]));
                }
            });
        }
    });
    assert_eq!(pool.idle(), 3);
}

#[test]
fn data_updates_reach_every_instance() {
    let pool = pool(2);
    pool.set_data_path(&["limits", "u9"], &json!(90)).unwrap();
    pool.remove_data_path(&["limits", "u1"]).unwrap();

    // Hold one instance so the next acquisition gets the other.
    let first = pool.acquire().unwrap();
    assert_eq!(limit(&pool, "u9"), json!([{"limit": 90}]));
    assert_eq!(limit(&pool, "u1"), json!([]));
    drop(first);
    assert_eq!(limit(&pool, "u9"), json!([{"limit": 90}]));

    let err = pool
        .set_data_path(&["limits", "u2", "x"], &json!(1))
        .unwrap_err();
    assert!(matches!(err, VmError::DataPath { .. }));
    assert_eq!(limit(&pool, "u2"), json!([{"limit": 20}]));
}

#[test]
fn every_instance_agrees_after_a_rejected_update() {
    let pool = pool(3);
    pool.set_data_path(&["limits", "u4"], &json!(40)).unwrap();
    assert!(pool.set_data_path(&["limits", "u4", "x"], &json!(1)).is_err());
    assert!(pool.remove_data_path(&["limits", "u8"]).is_err());

    let held: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
    for mut vm in held {
        assert_eq!(vm.data_path(&["limits", "u4"]).unwrap(), Some(json!(40)));
        assert_eq!(vm.data_path(&["limits", "u8"]).unwrap(), None);
    }
}

#[test]
fn exhausted_pool_does_not_block_try_acquire() {
    let pool = pool(2);
    let a = pool.try_acquire().unwrap().expect("first");
    let b = pool.try_acquire().unwrap().expect("second");
    assert!(pool.try_acquire().unwrap().is_none());
    assert_eq!(pool.idle(), 0);

    drop(a);
    assert!(pool.try_acquire().unwrap().is_some());
    drop(b);
    assert_eq!(pool.idle(), 2);
}

#[test]
fn closed_pool_rejects_work_and_wakes_waiters() {
    let pool = pool(1);
    let held = pool.acquire().unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| pool.acquire().map(|_| ()));
        // The waiter either blocks until close or sees the closed flag first.
        thread::sleep(std::time::Duration::from_millis(20));
        pool.close();
        assert!(matches!(waiter.join().unwrap(), Err(VmError::PoolClosed)));
    });

    drop(held);
    assert!(matches!(pool.acquire(), Err(VmError::PoolClosed)));
    assert!(matches!(pool.try_acquire(), Err(VmError::PoolClosed)));
    assert!(matches!(
        pool.set_data_path(&["limits", "x"], &json!(1)),
        Err(VmError::PoolClosed)
    ));
}
