//! Project pre-pass.
//!
//! Runs once, single-threaded, before any function body is compiled:
//!
//! 1. collects every `globalvar` name and defines every enum, so all
//!    functions see them whatever their order;
//! 2. reserves a name and bytecode index for every function literal, so a
//!    named literal can be called from any function;
//! 3. walks every body in declaration order and interns each variable name
//!    the generator will later ask for.
//!
//! Namespace ids, lambda names and literal indices therefore follow source
//! order and do not depend on how worker threads interleave.

use std::collections::HashSet;

use crate::{
    bytecode::{
        compile::Compiler,
        compile_error::{CompileError, Location},
        expr::argument_number,
        namespace::NamespaceKind,
    },
    lang::ast::{FunctionDecl, Node, NodeKind, Project},
};

pub(crate) struct Prepass<'c> {
    compiler: &'c Compiler,
}

/// Names that shadow the namespaces inside one function.
#[derive(Debug, Default, Clone)]
struct Scope {
    function: String,
    params: Vec<String>,
    locals: HashSet<String>,
    statics: HashSet<String>,
}

impl Scope {
    fn new(function: &str, params: &[String]) -> Self {
        Self {
            function: function.to_string(),
            params: params.to_vec(),
            ..Self::default()
        }
    }

    fn shadows(&self, name: &str) -> bool {
        self.locals.contains(name) || self.params.iter().any(|p| p == name) || self.statics.contains(name)
    }
}

impl<'c> Prepass<'c> {
    pub(crate) fn new(compiler: &'c Compiler) -> Self {
        Self { compiler }
    }

    pub(crate) fn run(&self, project: &Project, errors: &mut Vec<CompileError>) {
        for decl in &project.functions {
            if let Err(e) = self.collect(&decl.name, &decl.body) {
                errors.push(e);
            }
        }
        for decl in &project.functions {
            if let Err(e) = self.literals(&decl.name, &decl.body, &mut 0) {
                errors.push(e);
            }
        }
        for decl in &project.functions {
            if let Err(e) = self.function(decl) {
                errors.push(e);
            }
        }
    }

    // ───────────────────────── globalvar and enum ─────────────────────────

    fn collect(&self, function: &str, node: &Node) -> Result<(), CompileError> {
        match &node.kind {
            NodeKind::GlobalVar(names) => {
                for name in names {
                    self.compiler.declare_globalvar(name);
                }
            }
            NodeKind::Enum { name, members } => {
                let location = Location::new(function, node.span);
                self.compiler.define_enum(name, members, location, |init| {
                    self.compiler.evaluate_constant(init, function)
                })?;
            }
            _ => {}
        }
        for child in children(node) {
            self.collect(function, child)?;
        }
        Ok(())
    }

    // ────────────────────────── Function literals ──────────────────────────

    /// Reserve the literals of `unit`, numbered in the order the generator
    /// reaches them. A literal's own body is a unit of its own.
    fn literals(&self, unit: &str, node: &Node, ordinal: &mut u32) -> Result<(), CompileError> {
        match &node.kind {
            NodeKind::Function(literal) => {
                let location = Location::new(unit, node.span);
                let (name, _) = self.compiler.declare_literal(unit, *ordinal, literal, location)?;
                *ordinal += 1;
                return self.literals(&name, &literal.body, &mut 0);
            }
            // initializers are constants
            NodeKind::Enum { .. } => return Ok(()),
            _ => {}
        }
        for child in children(node) {
            self.literals(unit, child, ordinal)?;
        }
        Ok(())
    }

    // ─────────────────────────────── Names ────────────────────────────────

    fn function(&self, decl: &FunctionDecl) -> Result<(), CompileError> {
        let mut scope = Scope::new(&decl.name, &decl.params);
        self.walk(&mut scope, &decl.body)
    }

    fn intern(&self, scope: &Scope, kind: NamespaceKind, name: &str) -> Result<(), CompileError> {
        self.compiler.intern(kind, name, &scope.function).map(|_| ())
    }

    /// Intern a bare name the way the generator will resolve it.
    fn name(&self, scope: &Scope, name: &str) -> Result<(), CompileError> {
        let compiler = self.compiler;
        let bound = scope.shadows(name)
            || name == "argument_count"
            || argument_number(name).is_some()
            || compiler.library().constant(name).is_some()
            || compiler.assets().get(name).is_some()
            || compiler.bytecode().lookup(name).is_some();
        if bound {
            return Ok(());
        }
        if compiler.is_globalvar(name) {
            self.intern(scope, NamespaceKind::Global, name)
        } else {
            self.intern(scope, NamespaceKind::Instance, name)
        }
    }

    fn walk(&self, scope: &mut Scope, node: &Node) -> Result<(), CompileError> {
        match &node.kind {
            NodeKind::Identifier(name) => self.name(scope, name),

            NodeKind::Member { object, field } => {
                match &object.kind {
                    NodeKind::Identifier(o) if o == "global" => {
                        return self.intern(scope, NamespaceKind::Global, field);
                    }
                    NodeKind::Identifier(o) if o == "self" || o == "other" => {
                        return self.intern(scope, NamespaceKind::Instance, field);
                    }
                    NodeKind::Identifier(e) if self.compiler.enums().contains(e) => return Ok(()),
                    _ => {}
                }
                self.walk(scope, object)?;
                self.intern(scope, NamespaceKind::Instance, field)
            }

            NodeKind::Index { target, indices } => {
                let argument_array =
                    matches!(&target.kind, NodeKind::Identifier(n) if n == "argument" && !scope.shadows(n));
                if !argument_array {
                    self.walk(scope, target)?;
                }
                for index in indices {
                    self.walk(scope, index)?;
                }
                Ok(())
            }

            // the callee is resolved as a function, never as a variable
            NodeKind::Call { args, .. } => {
                for arg in args {
                    self.walk(scope, arg)?;
                }
                Ok(())
            }

            NodeKind::Function(literal) => {
                let mut inner = Scope::new(&scope.function, &literal.params);
                self.walk(&mut inner, &literal.body)
            }

            NodeKind::Var(decls) => {
                for decl in decls {
                    if let Some(init) = &decl.init {
                        self.walk(scope, init)?;
                    }
                    scope.locals.insert(decl.name.clone());
                }
                Ok(())
            }

            NodeKind::Static(decls) => {
                for decl in decls {
                    scope.statics.insert(decl.name.clone());
                    if let Some(init) = &decl.init {
                        self.walk(scope, init)?;
                    }
                }
                Ok(())
            }

            NodeKind::GlobalVar(names) => {
                for name in names {
                    self.intern(scope, NamespaceKind::Global, name)?;
                }
                Ok(())
            }

            NodeKind::Enum { .. } => Ok(()),

            _ => {
                for child in children(node) {
                    self.walk(scope, child)?;
                }
                Ok(())
            }
        }
    }
}

/// Direct children of a node, in evaluation order.
fn children(node: &Node) -> Vec<&Node> {
    match &node.kind {
        NodeKind::Literal(_)
        | NodeKind::Identifier(_)
        | NodeKind::GlobalVar(_)
        | NodeKind::Break
        | NodeKind::Continue
        | NodeKind::Exit => Vec::new(),

        NodeKind::Member { object, .. } => vec![&**object],
        NodeKind::Index { target, indices } => std::iter::once(&**target).chain(indices).collect(),
        NodeKind::Unary { operand, .. } => vec![&**operand],
        NodeKind::Binary { lhs, rhs, .. } | NodeKind::Logical { lhs, rhs, .. } => vec![&**lhs, &**rhs],
        NodeKind::Ternary {
            condition,
            then,
            otherwise,
        } => vec![&**condition, &**then, &**otherwise],
        NodeKind::Call { args, .. } => args.iter().collect(),
        NodeKind::CallValue { callee, args } => args.iter().chain(std::iter::once(&**callee)).collect(),
        NodeKind::Function(literal) => vec![&*literal.body],
        NodeKind::Array(items) | NodeKind::Block(items) => items.iter().collect(),
        NodeKind::IncDec { target, .. } => vec![&**target],
        NodeKind::Var(decls) | NodeKind::Static(decls) => decls.iter().filter_map(|d| d.init.as_ref()).collect(),
        NodeKind::Assign { target, value, .. } => vec![&**target, &**value],
        NodeKind::If {
            condition,
            then,
            otherwise,
        } => {
            let mut out: Vec<&Node> = vec![&**condition, &**then];
            out.extend(otherwise.as_deref());
            out
        }
        NodeKind::While { condition, body } => vec![&**condition, &**body],
        NodeKind::DoUntil { body, condition } => vec![&**body, &**condition],
        NodeKind::Repeat { count, body } => vec![&**count, &**body],
        NodeKind::For {
            init,
            condition,
            step,
            body,
        } => init
            .as_deref()
            .into_iter()
            .chain(condition.as_deref())
            .chain(std::iter::once(&**body))
            .chain(step.as_deref())
            .collect(),
        NodeKind::Switch { value, cases } => std::iter::once(&**value)
            .chain(cases.iter().flat_map(|c| c.label.iter()))
            .chain(cases.iter().flat_map(|c| c.body.iter()))
            .collect(),
        NodeKind::With { target, body } => vec![&**target, &**body],
        NodeKind::Return(value) => value.as_deref().into_iter().collect(),
        NodeKind::Enum { members, .. } => members.iter().filter_map(|m| m.value.as_ref()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerateConfig;
    use crate::lang::build::*;

    #[test]
    fn test_ids_follow_source_order() {
        let compiler = Compiler::new(GenerateConfig::default());
        let project = project(vec![
            func("a", &[], vec![assign(ident("zeta"), ident("alpha"))]),
            func("b", &["p"], vec![var("l", Some(ident("p"))), assign(ident("beta"), ident("l"))]),
        ]);
        Prepass::new(&compiler).run(&project, &mut Vec::new());

        let names = compiler.namespace(NamespaceKind::Instance).names();
        assert_eq!(names, vec!["zeta", "alpha", "beta"]);
    }

    #[test]
    fn test_globalvar_is_project_wide() {
        let compiler = Compiler::new(GenerateConfig::default());
        let project = project(vec![
            func("reader", &[], vec![assign(ident("x"), ident("score"))]),
            func("writer", &[], vec![globalvar(&["score"])]),
        ]);
        Prepass::new(&compiler).run(&project, &mut Vec::new());

        assert!(compiler.is_globalvar("score"));
        assert_eq!(compiler.namespace(NamespaceKind::Global).names(), vec!["score"]);
        assert_eq!(compiler.namespace(NamespaceKind::Instance).names(), vec!["x"]);
    }

    #[test]
    fn test_enums_defined_before_bodies() {
        let compiler = Compiler::new(GenerateConfig::default());
        let project = project(vec![
            func("user", &[], vec![assign(ident("x"), member(ident("State"), "Run"))]),
            func("defs", &[], vec![enum_("State", vec![("Idle", None), ("Run", None)])]),
        ]);
        let mut errors = Vec::new();
        Prepass::new(&compiler).run(&project, &mut errors);

        assert!(errors.is_empty());
        assert_eq!(compiler.enums().get("State", "Run"), Some(crate::lang::value::Value::Real(1.0)));
        // `State.Run` is not a field
        assert_eq!(compiler.namespace(NamespaceKind::Instance).names(), vec!["x"]);
    }

    #[test]
    fn test_bad_enum_is_reported() {
        let compiler = Compiler::new(GenerateConfig::default());
        let project = project(vec![func("defs", &[], vec![enum_("E", vec![("A", Some(ident("nope")))])])]);
        let mut errors = Vec::new();
        Prepass::new(&compiler).run(&project, &mut errors);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_literals_reserved_before_names() {
        let compiler = Compiler::new(GenerateConfig::default());
        let project = project(vec![
            func("user", &[], vec![assign(ident("x"), ident("helper"))]),
            func(
                "defs",
                &[],
                vec![
                    var(
                        "h",
                        Some(named_function("helper", &[], vec![var("k", Some(function(&[], vec![])))])),
                    ),
                    var("m", Some(function(&[], vec![]))),
                ],
            ),
        ]);
        let mut errors = Vec::new();
        Prepass::new(&compiler).run(&project, &mut errors);

        assert!(errors.is_empty());
        let bytecode = compiler.bytecode();
        assert_eq!(bytecode.lookup("helper"), Some(0));
        assert_eq!(bytecode.lookup("helper@lambda0"), Some(1));
        assert_eq!(bytecode.lookup("defs@lambda1"), Some(2));
        assert_eq!(compiler.reserved_literal("helper", 0), Some(("helper@lambda0".to_string(), 1)));
        assert_eq!(compiler.reserved_literal("defs", 1), Some(("defs@lambda1".to_string(), 2)));
        // `helper` is a function value, not a field
        assert_eq!(compiler.namespace(NamespaceKind::Instance).names(), vec!["x"]);
    }

    #[test]
    fn test_function_literal_gets_own_scope() {
        let compiler = Compiler::new(GenerateConfig::default());
        let project = project(vec![func(
            "main",
            &[],
            vec![
                var("v", None),
                var("f", Some(function(&["q"], vec![assign(ident("v"), ident("q"))]))),
            ],
        )]);
        Prepass::new(&compiler).run(&project, &mut Vec::new());
        // inside the literal `v` is not a local
        assert_eq!(compiler.namespace(NamespaceKind::Instance).names(), vec!["v"]);
    }
}
