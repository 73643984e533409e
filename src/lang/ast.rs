//! # Decorated syntax tree
//!
//! The tree handed to the bytecode compiler by the front end. Literal values
//! are already resolved (`true` is the real `1`, numeric literals are
//! reals), and every node carries the source position it came from.
//!
//! Expressions and statements share a single node type, the same way the
//! front end produces them. Any expression may be used as a statement (its
//! value is discarded); using a statement where a value is expected is a
//! compile error.

use super::value::Value;
use serde::{Deserialize, Serialize};

/// Source position, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    #[serde(default)]
    pub span: Span,
}

impl Node {
    pub fn new(kind: NodeKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    /// `div`
    IntDiv,
    /// `mod` / `%`
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    /// `^^`
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Plus,
    Neg,
    Not,
    BitNot,
}

/// Short-circuit operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
}

impl AssignOp {
    /// The binary operator a compound assignment applies, `None` for `=`.
    pub fn binary(self) -> Option<BinaryOp> {
        Some(match self {
            AssignOp::Set => return None,
            AssignOp::Add => BinaryOp::Add,
            AssignOp::Sub => BinaryOp::Sub,
            AssignOp::Mul => BinaryOp::Mul,
            AssignOp::Div => BinaryOp::Div,
            AssignOp::Mod => BinaryOp::Mod,
            AssignOp::BitAnd => BinaryOp::BitAnd,
            AssignOp::BitOr => BinaryOp::BitOr,
            AssignOp::BitXor => BinaryOp::BitXor,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncDecOp {
    PreIncrement,
    PreDecrement,
    PostIncrement,
    PostDecrement,
}

impl IncDecOp {
    pub fn is_prefix(self) -> bool {
        matches!(self, IncDecOp::PreIncrement | IncDecOp::PreDecrement)
    }

    pub fn binary(self) -> BinaryOp {
        match self {
            IncDecOp::PreIncrement | IncDecOp::PostIncrement => BinaryOp::Add,
            IncDecOp::PreDecrement | IncDecOp::PostDecrement => BinaryOp::Sub,
        }
    }
}

/// One `name [= init]` item of a `var` or `static` declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: String,
    #[serde(default)]
    pub init: Option<Node>,
}

/// A `case` label (or `default` when `label` is `None`) and the statements
/// that follow it up to the next label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    #[serde(default)]
    pub label: Option<Node>,
    #[serde(default)]
    pub body: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumMember {
    pub name: String,
    #[serde(default)]
    pub value: Option<Node>,
}

/// `function [name](params) { body }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionLiteral {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub params: Vec<String>,
    /// Set by the front end when the body reads `argument[..]` or
    /// `argument_count`.
    #[serde(default)]
    pub variadic: bool,
    pub body: Box<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    // ───────────────────────────── Expressions ─────────────────────────────
    Literal(Value),

    /// Bare name: a variable, constant, asset or function.
    Identifier(String),

    /// `object.field`; also `global.x`, `self.x`, `other.x` and `Enum.Member`.
    Member {
        object: Box<Node>,
        field: String,
    },

    /// `target[i]` or `target[i, j]`.
    Index {
        target: Box<Node>,
        indices: Vec<Node>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },

    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },

    Logical {
        op: LogicalOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },

    /// `condition ? then : otherwise`
    Ternary {
        condition: Box<Node>,
        then: Box<Node>,
        otherwise: Box<Node>,
    },

    /// Call by name: builtin, user function, or a variable holding a function.
    Call {
        callee: String,
        #[serde(default)]
        args: Vec<Node>,
    },

    /// Call of an arbitrary expression, e.g. `handlers[i](x)`.
    CallValue {
        callee: Box<Node>,
        #[serde(default)]
        args: Vec<Node>,
    },

    Function(FunctionLiteral),

    /// `[a, b, c]`
    Array(Vec<Node>),

    IncDec {
        op: IncDecOp,
        target: Box<Node>,
    },

    // ───────────────────────────── Statements ──────────────────────────────
    Block(Vec<Node>),

    Var(Vec<Declaration>),

    Static(Vec<Declaration>),

    GlobalVar(Vec<String>),

    Assign {
        op: AssignOp,
        target: Box<Node>,
        value: Box<Node>,
    },

    If {
        condition: Box<Node>,
        then: Box<Node>,
        #[serde(default)]
        otherwise: Option<Box<Node>>,
    },

    While {
        condition: Box<Node>,
        body: Box<Node>,
    },

    /// `do body until (condition)`
    DoUntil {
        body: Box<Node>,
        condition: Box<Node>,
    },

    Repeat {
        count: Box<Node>,
        body: Box<Node>,
    },

    For {
        #[serde(default)]
        init: Option<Box<Node>>,
        #[serde(default)]
        condition: Option<Box<Node>>,
        #[serde(default)]
        step: Option<Box<Node>>,
        body: Box<Node>,
    },

    Switch {
        value: Box<Node>,
        cases: Vec<Case>,
    },

    With {
        target: Box<Node>,
        body: Box<Node>,
    },

    Break,

    Continue,

    Return(Option<Box<Node>>),

    Exit,

    Enum {
        name: String,
        members: Vec<EnumMember>,
    },
}

impl NodeKind {
    /// Human-readable node name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Literal(_) => "literal",
            NodeKind::Identifier(_) => "identifier",
            NodeKind::Member { .. } => "member access",
            NodeKind::Index { .. } => "index",
            NodeKind::Unary { .. } => "unary expression",
            NodeKind::Binary { .. } => "binary expression",
            NodeKind::Logical { .. } => "logical expression",
            NodeKind::Ternary { .. } => "ternary expression",
            NodeKind::Call { .. } => "call",
            NodeKind::CallValue { .. } => "call",
            NodeKind::Function(_) => "function literal",
            NodeKind::Array(_) => "array literal",
            NodeKind::IncDec { .. } => "increment",
            NodeKind::Block(_) => "block",
            NodeKind::Var(_) => "var",
            NodeKind::Static(_) => "static",
            NodeKind::GlobalVar(_) => "globalvar",
            NodeKind::Assign { .. } => "assignment",
            NodeKind::If { .. } => "if",
            NodeKind::While { .. } => "while",
            NodeKind::DoUntil { .. } => "do",
            NodeKind::Repeat { .. } => "repeat",
            NodeKind::For { .. } => "for",
            NodeKind::Switch { .. } => "switch",
            NodeKind::With { .. } => "with",
            NodeKind::Break => "break",
            NodeKind::Continue => "continue",
            NodeKind::Return(_) => "return",
            NodeKind::Exit => "exit",
            NodeKind::Enum { .. } => "enum",
        }
    }
}

/// A script or named function of the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub variadic: bool,
    pub body: Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDecl {
    pub name: String,
    pub kind: crate::bytecode::accumulator::AssetKind,
}

/// Everything the compiler needs from one project.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub functions: Vec<FunctionDecl>,
    #[serde(default)]
    pub assets: Vec<AssetDecl>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_from_json() {
        let json = r#"{
            "functions": [{
                "name": "main",
                "body": { "kind": { "block": [
                    { "kind": { "assign": {
                        "op": "set",
                        "target": { "kind": { "identifier": "x" } },
                        "value": { "kind": { "literal": { "real": 1.0 } } }
                    } }, "span": { "line": 2, "col": 5 } },
                    { "kind": "break" }
                ] } }
            }],
            "assets": [{ "name": "spr_player", "kind": "sprite" }]
        }"#;

        let project: Project = serde_json::from_str(json).unwrap();
        assert_eq!(project.functions.len(), 1);
        assert_eq!(project.assets[0].name, "spr_player");

        let NodeKind::Block(stmts) = &project.functions[0].body.kind else {
            panic!("expected block");
        };
        assert_eq!(stmts[0].span, Span::new(2, 5));
        assert!(matches!(stmts[1].kind, NodeKind::Break));
        assert_eq!(stmts[1].span, Span::default());
    }

    #[test]
    fn test_assign_op_binary() {
        assert_eq!(AssignOp::Set.binary(), None);
        assert_eq!(AssignOp::BitXor.binary(), Some(BinaryOp::BitXor));
    }

    #[test]
    fn test_incdec() {
        assert!(IncDecOp::PreDecrement.is_prefix());
        assert!(!IncDecOp::PostIncrement.is_prefix());
        assert_eq!(IncDecOp::PostDecrement.binary(), BinaryOp::Sub);
    }
}
