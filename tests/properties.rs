//! Properties of generated code over random terminating programs.

use gmlc::bytecode::ProgramBc;
use gmlc::bytecode::compile::Compiler;
use gmlc::bytecode::stack_check::check_program;
use gmlc::config::GenerateConfig;
use gmlc::lang::ast::{AssignOp, BinaryOp, IncDecOp, Node};
use gmlc::lang::build::*;
use gmlc::runtime::vm_bc::{VmBc, VmBcConfig};
use proptest::prelude::*;

const VARS: [&str; 3] = ["a", "b", "c"];

#[derive(Debug, Clone)]
enum Expr {
    Num(i8),
    Var(u8),
    Arith(u8, Box<Expr>, Box<Expr>),
    Compare(u8, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    PostInc(u8),
    PreDec(u8),
    /// `helper(e)`
    Helper(Box<Expr>),
    /// `function(x) { return x + body }(arg)`
    Lambda(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
enum Stmt {
    Assign(u8, Expr),
    AddAssign(u8, Expr),
    Print(Expr),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    Repeat(u8, Vec<Stmt>),
    While(u8, Vec<Stmt>),
    For(u8, Vec<Stmt>),
    DoUntil(u8, Vec<Stmt>),
    /// `do { ... } until (true)`, or `until (false)` left by a guarded break.
    DoUntilConst(bool, u8, Vec<Stmt>),
    Switch(Expr, Vec<Vec<Stmt>>, Option<Vec<Stmt>>),
    WithSelf(Vec<Stmt>),
    Static(Expr),
    Break,
    Continue,
    Return(Expr),
    Exit,
}

fn expr() -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![
        (-3i8..10).prop_map(Expr::Num),
        (0u8..3).prop_map(Expr::Var),
        (0u8..3).prop_map(Expr::PostInc),
        (0u8..3).prop_map(Expr::PreDec),
    ];
    leaf.prop_recursive(3, 16, 3, |inner| {
        prop_oneof![
            (0u8..3, inner.clone(), inner.clone())
                .prop_map(|(op, a, b)| Expr::Arith(op, Box::new(a), Box::new(b))),
            (0u8..3, inner.clone(), inner.clone())
                .prop_map(|(op, a, b)| Expr::Compare(op, Box::new(a), Box::new(b))),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::And(Box::new(a), Box::new(b))),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::Or(Box::new(a), Box::new(b))),
            (inner.clone(), inner.clone(), inner.clone())
                .prop_map(|(c, a, b)| Expr::Cond(Box::new(c), Box::new(a), Box::new(b))),
            inner.clone().prop_map(|a| Expr::Helper(Box::new(a))),
            (inner.clone(), inner).prop_map(|(body, arg)| Expr::Lambda(Box::new(body), Box::new(arg))),
        ]
    })
}

fn stmt() -> impl Strategy<Value = Stmt> {
    let leaf = prop_oneof![
        4 => (0u8..3, expr()).prop_map(|(v, e)| Stmt::Assign(v, e)),
        2 => (0u8..3, expr()).prop_map(|(v, e)| Stmt::AddAssign(v, e)),
        4 => expr().prop_map(Stmt::Print),
        1 => expr().prop_map(Stmt::Static),
        1 => Just(Stmt::Break),
        1 => Just(Stmt::Continue),
        1 => expr().prop_map(Stmt::Return),
        1 => Just(Stmt::Exit),
    ];
    leaf.prop_recursive(3, 32, 4, |inner| {
        let body = prop::collection::vec(inner, 0..4);
        prop_oneof![
            (expr(), body.clone(), body.clone()).prop_map(|(c, t, e)| Stmt::If(c, t, e)),
            (0u8..4, body.clone()).prop_map(|(n, b)| Stmt::Repeat(n, b)),
            (0u8..4, body.clone()).prop_map(|(n, b)| Stmt::While(n, b)),
            (0u8..4, body.clone()).prop_map(|(n, b)| Stmt::For(n, b)),
            (0u8..4, body.clone()).prop_map(|(n, b)| Stmt::DoUntil(n, b)),
            (any::<bool>(), 1u8..4, body.clone()).prop_map(|(stop, n, b)| Stmt::DoUntilConst(stop, n, b)),
            (
                expr(),
                prop::collection::vec(body.clone(), 0..4),
                prop::option::of(body.clone())
            )
                .prop_map(|(v, cases, default)| Stmt::Switch(v, cases, default)),
            body.prop_map(Stmt::WithSelf),
        ]
    })
}

fn var_name(v: u8) -> Node {
    ident(VARS[v as usize % VARS.len()])
}

fn to_expr(e: &Expr) -> Node {
    match e {
        Expr::Num(n) => real(*n as f64),
        Expr::Var(v) => var_name(*v),
        Expr::Arith(op, a, b) => {
            let op = [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul][*op as usize % 3];
            binary(op, to_expr(a), to_expr(b))
        }
        Expr::Compare(op, a, b) => {
            let op = [BinaryOp::Lt, BinaryOp::Eq, BinaryOp::Ge][*op as usize % 3];
            binary(op, to_expr(a), to_expr(b))
        }
        Expr::And(a, b) => and(to_expr(a), to_expr(b)),
        Expr::Or(a, b) => or(to_expr(a), to_expr(b)),
        Expr::Cond(c, a, b) => ternary(to_expr(c), to_expr(a), to_expr(b)),
        Expr::PostInc(v) => inc_dec(IncDecOp::PostIncrement, var_name(*v)),
        Expr::PreDec(v) => inc_dec(IncDecOp::PreDecrement, var_name(*v)),
        Expr::Helper(a) => call("helper", vec![to_expr(a)]),
        Expr::Lambda(body, arg) => call_value(
            function(&["x"], vec![return_(Some(add(ident("x"), to_expr(body))))]),
            vec![to_expr(arg)],
        ),
    }
}

/// Lowers generated statements, naming statics and loop counters.
#[derive(Default)]
struct Lower {
    fresh: usize,
}

impl Lower {
    fn fresh(&mut self, prefix: &str) -> String {
        self.fresh += 1;
        format!("{}{}", prefix, self.fresh)
    }

    /// `in_loop`: `continue` is allowed. `breakable`: `break` is allowed.
    fn stmts(&mut self, stmts: &[Stmt], in_loop: bool, breakable: bool) -> Vec<Node> {
        stmts.iter().map(|s| self.stmt(s, in_loop, breakable)).collect()
    }

    /// A loop body that bumps `counter` before anything can `continue`.
    fn counted(&mut self, counter: &str, body: &[Stmt]) -> Node {
        let mut out = vec![assign_op(AssignOp::Add, ident(counter), real(1.0))];
        out.extend(self.stmts(body, true, true));
        block(out)
    }

    fn stmt(&mut self, s: &Stmt, in_loop: bool, breakable: bool) -> Node {
        match s {
            Stmt::Assign(v, e) => assign(var_name(*v), to_expr(e)),
            Stmt::AddAssign(v, e) => assign_op(AssignOp::Add, var_name(*v), to_expr(e)),
            Stmt::Print(e) => print(to_expr(e)),
            Stmt::If(c, t, e) => if_(
                to_expr(c),
                block(self.stmts(t, in_loop, breakable)),
                Some(block(self.stmts(e, in_loop, breakable))),
            ),
            Stmt::Repeat(n, body) => repeat(real(*n as f64), block(self.stmts(body, true, true))),
            Stmt::While(n, body) => {
                let i = self.fresh("w");
                block(vec![
                    assign(ident(&i), real(0.0)),
                    while_(lt(ident(&i), real(*n as f64)), self.counted(&i, body)),
                ])
            }
            Stmt::For(n, body) => {
                let i = self.fresh("f");
                for_(
                    Some(assign(ident(&i), real(0.0))),
                    Some(lt(ident(&i), real(*n as f64))),
                    Some(assign_op(AssignOp::Add, ident(&i), real(1.0))),
                    block(self.stmts(body, true, true)),
                )
            }
            Stmt::DoUntil(n, body) => {
                let i = self.fresh("d");
                block(vec![
                    assign(ident(&i), real(0.0)),
                    do_until(
                        self.counted(&i, body),
                        binary(BinaryOp::Ge, ident(&i), real(*n as f64)),
                    ),
                ])
            }
            Stmt::DoUntilConst(stop, n, body) => {
                let i = self.fresh("k");
                let mut inner = vec![
                    assign_op(AssignOp::Add, ident(&i), real(1.0)),
                    if_(binary(BinaryOp::Ge, ident(&i), real(*n as f64 + 1.0)), break_(), None),
                ];
                inner.extend(self.stmts(body, true, true));
                block(vec![
                    assign(ident(&i), real(0.0)),
                    do_until(block(inner), real(if *stop { 1.0 } else { 0.0 })),
                ])
            }
            Stmt::Switch(v, cases, default) => {
                let mut out: Vec<_> = cases
                    .iter()
                    .enumerate()
                    .map(|(i, body)| case(real(i as f64), self.stmts(body, in_loop, true)))
                    .collect();
                if let Some(body) = default {
                    out.push(default_case(self.stmts(body, in_loop, true)));
                }
                switch(to_expr(v), out)
            }
            Stmt::WithSelf(body) => with(ident("self"), block(self.stmts(body, true, true))),
            Stmt::Static(e) => {
                let name = self.fresh("s");
                block(vec![static_var(&name, Some(to_expr(e))), print(ident(&name))])
            }
            Stmt::Break if breakable => break_(),
            Stmt::Continue if in_loop => continue_(),
            Stmt::Break | Stmt::Continue => print(real(-1.0)),
            Stmt::Return(e) => return_(Some(to_expr(e))),
            Stmt::Exit => exit(),
        }
    }
}

fn main_body(stmts: &[Stmt]) -> Vec<Node> {
    let mut body: Vec<Node> = VARS.iter().map(|v| assign(ident(v), real(0.0))).collect();
    body.extend(Lower::default().stmts(stmts, false, false));
    body
}

fn compile_with(body: Vec<Node>, config: GenerateConfig) -> ProgramBc {
    let helper = func("helper", &["x"], vec![return_(Some(add(ident("x"), real(1.0))))]);
    Compiler::new(config)
        .compile_project(&project(vec![func("main", &[], body), helper]))
        .expect("generated programs compile")
}

fn compile(body: Vec<Node>, peephole: bool) -> ProgramBc {
    compile_with(
        body,
        GenerateConfig {
            peephole,
            ..GenerateConfig::default()
        },
    )
}

/// Output of two runs of `main`, so statics are observed on re-entry.
fn execute(program: &ProgramBc) -> (Vec<String>, Result<String, String>) {
    let mut vm = VmBc::with_config(VmBcConfig {
        max_steps: Some(1_000_000),
        ..VmBcConfig::default()
    });
    let result = vm
        .run(program, "main", Vec::new())
        .and_then(|_| vm.run(program, "main", Vec::new()))
        .map(|v| v.to_string())
        .map_err(|e| e.to_string());
    (vm.take_output(), result)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn generated_code_passes_stack_check(stmts in prop::collection::vec(stmt(), 0..6)) {
        for peephole in [true, false] {
            let program = compile(main_body(&stmts), peephole);
            prop_assert!(check_program(&program).is_ok(), "{:?}", check_program(&program));

            for code in &program.functions {
                for op in &code.ops {
                    if let Some(target) = op.target() {
                        prop_assert!(*target < code.ops.len());
                    }
                }
            }
        }
    }

    #[test]
    fn peephole_preserves_behaviour(stmts in prop::collection::vec(stmt(), 0..6)) {
        let optimized = compile(main_body(&stmts), true);
        let plain = compile(main_body(&stmts), false);

        prop_assert_eq!(optimized.functions.len(), plain.functions.len());
        for (o, p) in optimized.functions.iter().zip(&plain.functions) {
            prop_assert_eq!(&o.name, &p.name);
            prop_assert!(o.ops.len() <= p.ops.len());
        }
        prop_assert_eq!(execute(&optimized), execute(&plain));
    }

    #[test]
    fn constant_do_until_folds_its_back_edge(
        stop in any::<bool>(),
        n in 1u8..4,
        body in prop::collection::vec(stmt(), 0..4),
    ) {
        let stmts = vec![Stmt::DoUntilConst(stop, n, body)];
        let optimized = compile(main_body(&stmts), true);
        let plain = compile(main_body(&stmts), false);

        prop_assert!(optimized.functions[0].ops.len() < plain.functions[0].ops.len());
        prop_assert_eq!(execute(&optimized), execute(&plain));
    }

    #[test]
    fn compilation_is_deterministic(stmts in prop::collection::vec(stmt(), 0..6)) {
        let sequential = compile(main_body(&stmts), true);
        prop_assert_eq!(&sequential, &compile(main_body(&stmts), true));

        let parallel = compile_with(main_body(&stmts), GenerateConfig {
            jobs: 4,
            ..GenerateConfig::default()
        });
        prop_assert_eq!(sequential, parallel);
    }
}
