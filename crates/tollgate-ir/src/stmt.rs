//! IR statements.
//!
//! Statements are encoded the way the planner emits them:
//! `{"type": "DotStmt", "stmt": {"source": 0, "key": 2, "target": 3}}`.
//! Statements that test something (comparisons, `Dot`, `Is*`, calls) make the
//! enclosing block undefined when the test fails.

use serde::{Deserialize, Serialize};

use crate::{Block, Local};

/// A single IR statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "stmt")]
pub enum Stmt {
    // ── Control ──────────────────────────────────────────────────────────
    /// Return a status code from the enclosing plan or function.
    #[serde(rename = "ReturnStmt")]
    Return { code: i32 },
    /// Return the value held by `source`.
    #[serde(rename = "ReturnLocalStmt")]
    ReturnLocal { source: Local },
    /// Nested blocks executed in order.
    #[serde(rename = "BlockStmt")]
    Block { blocks: Vec<Block> },
    /// Exit the `index`-th enclosing block.
    #[serde(rename = "BreakStmt")]
    Break { index: u32 },
    #[serde(rename = "NopStmt")]
    Nop,

    // ── Calls ────────────────────────────────────────────────────────────
    /// Call a planned function or builtin; undefined if the result is.
    #[serde(rename = "CallStmt")]
    Call {
        func: String,
        args: Vec<Local>,
        result: Local,
    },
    /// Call a function selected at runtime by a path of locals.
    #[serde(rename = "CallDynamicStmt")]
    CallDynamic {
        path: Vec<Local>,
        args: Vec<Local>,
        result: Local,
    },
    /// Evaluate `block` with `local` (or a path inside it) replaced by `value`.
    #[serde(rename = "WithStmt")]
    With {
        local: Local,
        path: Vec<usize>,
        value: Local,
        block: Block,
    },

    // ── Structured evaluation ────────────────────────────────────────────
    /// Defined only if `block` is undefined.
    #[serde(rename = "NotStmt")]
    Not { block: Block },
    /// Run `block` once per key/value of `source`.
    #[serde(rename = "ScanStmt")]
    Scan {
        source: Local,
        key: Local,
        value: Local,
        block: Block,
    },
    /// `target = source[key]`; undefined if missing.
    #[serde(rename = "DotStmt")]
    Dot {
        source: Local,
        key: Local,
        target: Local,
    },
    #[serde(rename = "LenStmt")]
    Len { source: Local, target: Local },

    // ── Assignment ───────────────────────────────────────────────────────
    #[serde(rename = "AssignVarStmt")]
    AssignVar { source: Local, target: Local },
    /// Assign, or trap if `target` already holds a different value.
    #[serde(rename = "AssignVarOnceStmt")]
    AssignVarOnce { source: Local, target: Local },
    /// Overwrite the number held by `target` in place.
    #[serde(rename = "AssignIntStmt")]
    AssignInt { value: i64, target: Local },
    /// Overwrite the boolean held by `target` in place.
    #[serde(rename = "AssignBooleanStmt")]
    AssignBoolean { value: bool, target: Local },
    /// Make `target` undefined.
    #[serde(rename = "ResetLocalStmt")]
    ResetLocal { target: Local },

    // ── Constructors ─────────────────────────────────────────────────────
    #[serde(rename = "MakeNullStmt")]
    MakeNull { target: Local },
    #[serde(rename = "MakeBooleanStmt")]
    MakeBoolean { value: bool, target: Local },
    #[serde(rename = "MakeNumberIntStmt")]
    MakeNumberInt { value: i64, target: Local },
    #[serde(rename = "MakeNumberFloatStmt")]
    MakeNumberFloat { value: f64, target: Local },
    /// A number whose decimal text is string constant `index`.
    #[serde(rename = "MakeNumberRefStmt")]
    MakeNumberRef { index: usize, target: Local },
    #[serde(rename = "MakeStringStmt")]
    MakeString { index: usize, target: Local },
    #[serde(rename = "MakeArrayStmt")]
    MakeArray { capacity: i32, target: Local },
    #[serde(rename = "MakeObjectStmt")]
    MakeObject { target: Local },
    #[serde(rename = "MakeSetStmt")]
    MakeSet { target: Local },

    // ── Comparisons and type tests ───────────────────────────────────────
    #[serde(rename = "EqualStmt")]
    Equal { a: Local, b: Local },
    #[serde(rename = "NotEqualStmt")]
    NotEqual { a: Local, b: Local },
    #[serde(rename = "LessThanStmt")]
    LessThan { a: Local, b: Local },
    #[serde(rename = "LessThanEqualStmt")]
    LessThanEqual { a: Local, b: Local },
    #[serde(rename = "GreaterThanStmt")]
    GreaterThan { a: Local, b: Local },
    #[serde(rename = "GreaterThanEqualStmt")]
    GreaterThanEqual { a: Local, b: Local },
    #[serde(rename = "IsArrayStmt")]
    IsArray { source: Local },
    #[serde(rename = "IsObjectStmt")]
    IsObject { source: Local },
    #[serde(rename = "IsDefinedStmt")]
    IsDefined { source: Local },
    #[serde(rename = "IsUndefinedStmt")]
    IsUndefined { source: Local },

    // ── Composite mutation ───────────────────────────────────────────────
    #[serde(rename = "ArrayAppendStmt")]
    ArrayAppend { value: Local, array: Local },
    #[serde(rename = "ObjectInsertStmt")]
    ObjectInsert {
        key: Local,
        value: Local,
        object: Local,
    },
    /// Insert, or trap if `key` is already bound to a different value.
    #[serde(rename = "ObjectInsertOnceStmt")]
    ObjectInsertOnce {
        key: Local,
        value: Local,
        object: Local,
    },
    /// `target = merge(a, b)`; undefined on conflict.
    #[serde(rename = "ObjectMergeStmt")]
    ObjectMerge { a: Local, b: Local, target: Local },
    #[serde(rename = "SetAddStmt")]
    SetAdd { value: Local, set: Local },
    /// Add `value` to the entrypoint's result set.
    #[serde(rename = "ResultSetAddStmt")]
    ResultSetAdd { value: Local },
}

impl Stmt {
    /// The planner's name for this statement kind, e.g. `"ScanStmt"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Stmt::Return { .. } => "ReturnStmt",
            Stmt::ReturnLocal { .. } => "ReturnLocalStmt",
            Stmt::Block { .. } => "BlockStmt",
            Stmt::Break { .. } => "BreakStmt",
            Stmt::Nop => "NopStmt",
            Stmt::Call { .. } => "CallStmt",
            Stmt::CallDynamic { .. } => "CallDynamicStmt",
            Stmt::With { .. } => "WithStmt",
            Stmt::Not { .. } => "NotStmt",
            Stmt::Scan { .. } => "ScanStmt",
            Stmt::Dot { .. } => "DotStmt",
            Stmt::Len { .. } => "LenStmt",
            Stmt::AssignVar { .. } => "AssignVarStmt",
            Stmt::AssignVarOnce { .. } => "AssignVarOnceStmt",
            Stmt::AssignInt { .. } => "AssignIntStmt",
            Stmt::AssignBoolean { .. } => "AssignBooleanStmt",
            Stmt::ResetLocal { .. } => "ResetLocalStmt",
            Stmt::MakeNull { .. } => "MakeNullStmt",
            Stmt::MakeBoolean { .. } => "MakeBooleanStmt",
            Stmt::MakeNumberInt { .. } => "MakeNumberIntStmt",
            Stmt::MakeNumberFloat { .. } => "MakeNumberFloatStmt",
            Stmt::MakeNumberRef { .. } => "MakeNumberRefStmt",
            Stmt::MakeString { .. } => "MakeStringStmt",
            Stmt::MakeArray { .. } => "MakeArrayStmt",
            Stmt::MakeObject { .. } => "MakeObjectStmt",
            Stmt::MakeSet { .. } => "MakeSetStmt",
            Stmt::Equal { .. } => "EqualStmt",
            Stmt::NotEqual { .. } => "NotEqualStmt",
            Stmt::LessThan { .. } => "LessThanStmt",
            Stmt::LessThanEqual { .. } => "LessThanEqualStmt",
            Stmt::GreaterThan { .. } => "GreaterThanStmt",
            Stmt::GreaterThanEqual { .. } => "GreaterThanEqualStmt",
            Stmt::IsArray { .. } => "IsArrayStmt",
            Stmt::IsObject { .. } => "IsObjectStmt",
            Stmt::IsDefined { .. } => "IsDefinedStmt",
            Stmt::IsUndefined { .. } => "IsUndefinedStmt",
            Stmt::ArrayAppend { .. } => "ArrayAppendStmt",
            Stmt::ObjectInsert { .. } => "ObjectInsertStmt",
            Stmt::ObjectInsertOnce { .. } => "ObjectInsertOnceStmt",
            Stmt::ObjectMerge { .. } => "ObjectMergeStmt",
            Stmt::SetAdd { .. } => "SetAddStmt",
            Stmt::ResultSetAdd { .. } => "ResultSetAddStmt",
        }
    }
}
