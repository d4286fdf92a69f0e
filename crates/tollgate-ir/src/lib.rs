//! Tollgate policy IR.
//!
//! The IR is the planner's already-lowered description of a policy's
//! evaluation logic: a static string table, a set of named functions and one
//! named plan per entrypoint.  It is produced once upstream, arrives here as
//! JSON and is never mutated afterwards.
//!
//! ```text
//! Policy
//! ├── static   strings, builtin_funcs
//! ├── plans    [Plan { name, blocks }]        one per entrypoint
//! └── funcs    [Func { name, params, return, blocks }]
//! ```

mod error;
mod stmt;

use serde::{Deserialize, Serialize};

pub use error::IrError;
pub use stmt::Stmt;

// ══════════════════════════════════════════════════════════════════════════════
// Policy
// ══════════════════════════════════════════════════════════════════════════════

/// A planned policy: everything the WASM compiler needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "static", default)]
    pub static_: Static,
    #[serde(default)]
    pub plans: Plans,
    #[serde(default)]
    pub funcs: Funcs,
}

impl Policy {
    /// Parse the planner's JSON output.
    pub fn from_json(bytes: &[u8]) -> Result<Self, IrError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serialize back to the planner's JSON shape.
    pub fn to_json(&self) -> Result<Vec<u8>, IrError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Look up a planned function by name.
    pub fn func(&self, name: &str) -> Option<&Func> {
        self.funcs.funcs.iter().find(|f| f.name == name)
    }
}

/// Static data indexed into by statements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Static {
    /// Deduplicated string constants, addressed by position.
    #[serde(default)]
    pub strings: Vec<StringConst>,
    /// Builtins the policy calls that are not planned functions.
    #[serde(default)]
    pub builtin_funcs: Vec<BuiltinFunc>,
}

/// A string constant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringConst {
    pub value: String,
}

impl StringConst {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }
}

/// A builtin function declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltinFunc {
    pub name: String,
}

/// The named query plans exposed as entrypoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plans {
    #[serde(default)]
    pub plans: Vec<Plan>,
}

/// Planned functions callable from plans and from each other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Funcs {
    #[serde(default)]
    pub funcs: Vec<Func>,
}

// ══════════════════════════════════════════════════════════════════════════════
// Plans, functions, blocks
// ══════════════════════════════════════════════════════════════════════════════

/// An ordered series of blocks executed for one entrypoint.
///
/// Inside a plan, [`Local::INPUT`] holds the input document and
/// [`Local::DATA`] the data document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub blocks: Vec<Block>,
}

impl Plan {
    pub fn new(name: impl Into<String>, blocks: Vec<Block>) -> Self {
        Self {
            name: name.into(),
            blocks,
        }
    }
}

/// A named function.  By convention the input and data documents are the
/// first and second parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Func {
    pub name: String,
    pub params: Vec<Local>,
    #[serde(rename = "return")]
    pub return_: Local,
    pub blocks: Vec<Block>,
}

/// An ordered sequence of statements.
///
/// A block runs until a statement is undefined, a return or break is
/// reached, or it runs out of statements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

impl Block {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }
}

/// A plan- or function-scoped variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Local(pub u32);

impl Local {
    /// The input document inside a plan.
    pub const INPUT: Local = Local(0);
    /// The data document inside a plan.
    pub const DATA: Local = Local(1);
    /// First local free for planner allocation.
    pub const UNUSED: Local = Local(2);
}

/// Status codes carried by [`Stmt::Return`].
pub mod status {
    pub const UNDEFINED: i32 = 0;
    pub const DEFINED: i32 = 1;
    pub const ERROR: i32 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLANNED: &str = r#"{
        "static": {
            "strings": [{"value": "result"}, {"value": "foo"}],
            "builtin_funcs": [{"name": "time.now_ns"}]
        },
        "plans": {"plans": [{
            "name": "example/allow",
            "blocks": [{"stmts": [
                {"type": "MakeStringStmt", "stmt": {"index": 1, "target": 2}},
                {"type": "DotStmt", "stmt": {"source": 0, "key": 2, "target": 3}},
                {"type": "ResultSetAddStmt", "stmt": {"value": 3}}
            ]}]
        }]},
        "funcs": {"funcs": [{
            "name": "g0.data.example.p",
            "params": [0, 1],
            "return": 2,
            "blocks": [{"stmts": [{"type": "ReturnLocalStmt", "stmt": {"source": 2}}]}]
        }]}
    }"#;

    #[test]
    fn parses_planner_output() {
        let policy = Policy::from_json(PLANNED.as_bytes()).expect("parse failed");
        assert_eq!(policy.static_.strings.len(), 2);
        assert_eq!(policy.static_.builtin_funcs[0].name, "time.now_ns");
        assert_eq!(policy.plans.plans[0].name, "example/allow");
        assert_eq!(
            policy.plans.plans[0].blocks[0].stmts[1],
            Stmt::Dot {
                source: Local::INPUT,
                key: Local(2),
                target: Local(3)
            }
        );
        let func = policy.func("g0.data.example.p").expect("func");
        assert_eq!(func.params, vec![Local(0), Local(1)]);
        assert_eq!(func.return_, Local(2));
    }

    #[test]
    fn json_round_trip_preserves_statements() {
        let policy = Policy::from_json(PLANNED.as_bytes()).unwrap();
        let bytes = policy.to_json().unwrap();
        assert_eq!(Policy::from_json(&bytes).unwrap(), policy);
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let policy = Policy::from_json(b"{}").unwrap();
        assert!(policy.plans.plans.is_empty());
        assert!(policy.funcs.funcs.is_empty());
        assert!(policy.static_.strings.is_empty());
    }

    #[test]
    fn unknown_statement_kind_is_rejected() {
        let err = Policy::from_json(
            br#"{"plans": {"plans": [{"name": "x", "blocks": [{"stmts": [
                {"type": "TeleportStmt", "stmt": {}}
            ]}]}]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("TeleportStmt"), "{err}");
    }
}
