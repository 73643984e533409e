//! Shorthand constructors for decorated trees.
//!
//! Hosts that generate code (and the test-suite) build trees with these
//! instead of spelling out `Node { kind: .., span: .. }` by hand. Nodes get
//! a default span; use [`Node::at`] to attach one.

use super::ast::*;
use super::value::Value;

impl Node {
    pub fn at(mut self, line: u32, col: u32) -> Self {
        self.span = Span::new(line, col);
        self
    }
}

fn node(kind: NodeKind) -> Node {
    Node::new(kind, Span::default())
}

fn boxed(n: Node) -> Box<Node> {
    Box::new(n)
}

// ─────────────────────────────── Expressions ───────────────────────────────

pub fn real(r: f64) -> Node {
    node(NodeKind::Literal(Value::Real(r)))
}

pub fn string(s: &str) -> Node {
    node(NodeKind::Literal(Value::string(s)))
}

pub fn undefined() -> Node {
    node(NodeKind::Literal(Value::Undefined))
}

pub fn ident(name: &str) -> Node {
    node(NodeKind::Identifier(name.to_string()))
}

pub fn member(object: Node, field: &str) -> Node {
    node(NodeKind::Member {
        object: boxed(object),
        field: field.to_string(),
    })
}

pub fn global(field: &str) -> Node {
    member(ident("global"), field)
}

pub fn index(target: Node, indices: Vec<Node>) -> Node {
    node(NodeKind::Index {
        target: boxed(target),
        indices,
    })
}

pub fn unary(op: UnaryOp, operand: Node) -> Node {
    node(NodeKind::Unary {
        op,
        operand: boxed(operand),
    })
}

pub fn binary(op: BinaryOp, lhs: Node, rhs: Node) -> Node {
    node(NodeKind::Binary {
        op,
        lhs: boxed(lhs),
        rhs: boxed(rhs),
    })
}

pub fn add(lhs: Node, rhs: Node) -> Node {
    binary(BinaryOp::Add, lhs, rhs)
}

pub fn lt(lhs: Node, rhs: Node) -> Node {
    binary(BinaryOp::Lt, lhs, rhs)
}

pub fn eq(lhs: Node, rhs: Node) -> Node {
    binary(BinaryOp::Eq, lhs, rhs)
}

pub fn and(lhs: Node, rhs: Node) -> Node {
    node(NodeKind::Logical {
        op: LogicalOp::And,
        lhs: boxed(lhs),
        rhs: boxed(rhs),
    })
}

pub fn or(lhs: Node, rhs: Node) -> Node {
    node(NodeKind::Logical {
        op: LogicalOp::Or,
        lhs: boxed(lhs),
        rhs: boxed(rhs),
    })
}

pub fn ternary(condition: Node, then: Node, otherwise: Node) -> Node {
    node(NodeKind::Ternary {
        condition: boxed(condition),
        then: boxed(then),
        otherwise: boxed(otherwise),
    })
}

pub fn call(callee: &str, args: Vec<Node>) -> Node {
    node(NodeKind::Call {
        callee: callee.to_string(),
        args,
    })
}

pub fn call_value(callee: Node, args: Vec<Node>) -> Node {
    node(NodeKind::CallValue {
        callee: boxed(callee),
        args,
    })
}

pub fn function(params: &[&str], body: Vec<Node>) -> Node {
    node(NodeKind::Function(FunctionLiteral {
        name: None,
        params: params.iter().map(|p| p.to_string()).collect(),
        variadic: false,
        body: boxed(block(body)),
    }))
}

pub fn named_function(name: &str, params: &[&str], body: Vec<Node>) -> Node {
    node(NodeKind::Function(FunctionLiteral {
        name: Some(name.to_string()),
        params: params.iter().map(|p| p.to_string()).collect(),
        variadic: false,
        body: boxed(block(body)),
    }))
}

pub fn array(items: Vec<Node>) -> Node {
    node(NodeKind::Array(items))
}

pub fn inc_dec(op: IncDecOp, target: Node) -> Node {
    node(NodeKind::IncDec {
        op,
        target: boxed(target),
    })
}

/// `show_debug_message(value)`, the builtin the executor captures.
pub fn print(value: Node) -> Node {
    call("show_debug_message", vec![value])
}

// ─────────────────────────────── Statements ────────────────────────────────

pub fn block(stmts: Vec<Node>) -> Node {
    node(NodeKind::Block(stmts))
}

pub fn var(name: &str, init: Option<Node>) -> Node {
    node(NodeKind::Var(vec![Declaration {
        name: name.to_string(),
        init,
    }]))
}

pub fn static_var(name: &str, init: Option<Node>) -> Node {
    node(NodeKind::Static(vec![Declaration {
        name: name.to_string(),
        init,
    }]))
}

pub fn globalvar(names: &[&str]) -> Node {
    node(NodeKind::GlobalVar(
        names.iter().map(|n| n.to_string()).collect(),
    ))
}

pub fn assign_op(op: AssignOp, target: Node, value: Node) -> Node {
    node(NodeKind::Assign {
        op,
        target: boxed(target),
        value: boxed(value),
    })
}

pub fn assign(target: Node, value: Node) -> Node {
    assign_op(AssignOp::Set, target, value)
}

pub fn if_(condition: Node, then: Node, otherwise: Option<Node>) -> Node {
    node(NodeKind::If {
        condition: boxed(condition),
        then: boxed(then),
        otherwise: otherwise.map(boxed),
    })
}

pub fn while_(condition: Node, body: Node) -> Node {
    node(NodeKind::While {
        condition: boxed(condition),
        body: boxed(body),
    })
}

pub fn do_until(body: Node, condition: Node) -> Node {
    node(NodeKind::DoUntil {
        body: boxed(body),
        condition: boxed(condition),
    })
}

pub fn repeat(count: Node, body: Node) -> Node {
    node(NodeKind::Repeat {
        count: boxed(count),
        body: boxed(body),
    })
}

pub fn for_(init: Option<Node>, condition: Option<Node>, step: Option<Node>, body: Node) -> Node {
    node(NodeKind::For {
        init: init.map(boxed),
        condition: condition.map(boxed),
        step: step.map(boxed),
        body: boxed(body),
    })
}

pub fn case(label: Node, body: Vec<Node>) -> Case {
    Case {
        label: Some(label),
        body,
    }
}

pub fn default_case(body: Vec<Node>) -> Case {
    Case { label: None, body }
}

pub fn switch(value: Node, cases: Vec<Case>) -> Node {
    node(NodeKind::Switch {
        value: boxed(value),
        cases,
    })
}

pub fn with(target: Node, body: Node) -> Node {
    node(NodeKind::With {
        target: boxed(target),
        body: boxed(body),
    })
}

pub fn break_() -> Node {
    node(NodeKind::Break)
}

pub fn continue_() -> Node {
    node(NodeKind::Continue)
}

pub fn return_(value: Option<Node>) -> Node {
    node(NodeKind::Return(value.map(boxed)))
}

pub fn exit() -> Node {
    node(NodeKind::Exit)
}

pub fn enum_(name: &str, members: Vec<(&str, Option<Node>)>) -> Node {
    node(NodeKind::Enum {
        name: name.to_string(),
        members: members
            .into_iter()
            .map(|(name, value)| EnumMember {
                name: name.to_string(),
                value,
            })
            .collect(),
    })
}

// ──────────────────────────────── Project ──────────────────────────────────

pub fn func(name: &str, params: &[&str], body: Vec<Node>) -> FunctionDecl {
    FunctionDecl {
        name: name.to_string(),
        params: params.iter().map(|p| p.to_string()).collect(),
        variadic: false,
        body: block(body),
    }
}

pub fn project(functions: Vec<FunctionDecl>) -> Project {
    Project {
        functions,
        assets: Vec::new(),
    }
}
