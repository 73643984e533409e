//! Expression generation and name resolution.

use crate::{
    bytecode::{
        Op,
        accumulator::Builtin,
        compile::{Compiler, Generator},
        compile_error::{CompileError, Location},
        context::GenerateContext,
        namespace::NamespaceKind,
        op::{Place, Var},
    },
    lang::{
        ast::{BinaryOp, FunctionLiteral, IncDecOp, LogicalOp, Node, NodeKind, Span, UnaryOp},
        value::{Value, apply_binary, apply_unary},
    },
};

/// Positional argument names the language predefines.
const MAX_ARGUMENT_NAME: u32 = 16;

/// What a bare name refers to.
#[derive(Debug, Clone, PartialEq)]
enum Resolved {
    Var(Var),
    Constant(Value),
    Function(u32),
    ArgumentCount,
}

pub(crate) fn argument_number(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("argument")?;
    if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
        return None;
    }
    digits.parse().ok().filter(|&n| n < MAX_ARGUMENT_NAME)
}

/// `self`, `other` and `global` in front of a `.`.
fn keyword_var(object: &Node, compiler: &Compiler, field: &str, function: &str) -> Result<Option<Var>, CompileError> {
    let NodeKind::Identifier(name) = &object.kind else {
        return Ok(None);
    };
    Ok(match name.as_str() {
        "global" => Some(Var::Global(compiler.intern(NamespaceKind::Global, field, function)?)),
        "self" => Some(Var::Instance(compiler.intern(NamespaceKind::Instance, field, function)?)),
        "other" => Some(Var::Other(compiler.intern(NamespaceKind::Instance, field, function)?)),
        _ => None,
    })
}

/// Fold `node` to a value if it is a constant expression.
///
/// `Ok(None)` means the node is not constant; an error means it is but its
/// value cannot be computed (a division by zero, a missing enum member).
pub(crate) fn fold(compiler: &Compiler, node: &Node, function: &str) -> Result<Option<Value>, CompileError> {
    let location = || Location::new(function, node.span);
    let computed = |value: Option<Value>| {
        value.map(Some).ok_or_else(|| {
            CompileError::malformed("constant expression has no value", location())
        })
    };

    match &node.kind {
        NodeKind::Literal(v) => Ok(Some(v.clone())),

        NodeKind::Identifier(name) => Ok(compiler
            .library()
            .constant(name)
            .cloned()
            .or_else(|| {
                compiler
                    .assets()
                    .get(name)
                    .map(|asset| Value::Real(asset.id as f64))
            })),

        NodeKind::Member { object, field } => match &object.kind {
            NodeKind::Identifier(e) if compiler.enums().contains(e) => compiler
                .enums()
                .get(e, field)
                .map(Some)
                .ok_or_else(|| CompileError::unresolved(&format!("{}.{}", e, field), location())),
            _ => Ok(None),
        },

        NodeKind::Unary { op, operand } => match fold(compiler, operand, function)? {
            Some(v) if *op == UnaryOp::Plus => Ok(Some(v)),
            Some(v) => computed(apply_unary(*op, &v)),
            None => Ok(None),
        },

        NodeKind::Binary { op, lhs, rhs } => {
            match (fold(compiler, lhs, function)?, fold(compiler, rhs, function)?) {
                (Some(a), Some(b)) => computed(apply_binary(*op, &a, &b)),
                _ => Ok(None),
            }
        }

        NodeKind::Logical { op, lhs, rhs } => {
            let Some(a) = fold(compiler, lhs, function)? else {
                return Ok(None);
            };
            let a = computed(a.truthy().map(Value::from))?;
            let short = match op {
                LogicalOp::And => a == Some(Value::from(false)),
                LogicalOp::Or => a == Some(Value::from(true)),
            };
            if short {
                return Ok(a);
            }
            match fold(compiler, rhs, function)? {
                Some(b) => computed(b.truthy().map(Value::from)),
                None => Ok(None),
            }
        }

        NodeKind::Ternary {
            condition,
            then,
            otherwise,
        } => {
            let Some(c) = fold(compiler, condition, function)? else {
                return Ok(None);
            };
            match c.truthy() {
                Some(true) => fold(compiler, then, function),
                Some(false) => fold(compiler, otherwise, function),
                None => computed(None),
            }
        }

        _ => Ok(None),
    }
}

impl Generator<'_> {
    /// A compile-time constant. Anything else is generated in enum mode,
    /// which rejects it.
    pub(crate) fn constant(&mut self, node: &Node, ctx: GenerateContext) -> Result<Value, CompileError> {
        if let Some(value) = fold(self.compiler, node, &self.state.name)? {
            return Ok(value);
        }
        self.expression(node, ctx)?;
        Err(CompileError::internal("non-constant enum initializer generated code"))
    }

    fn resolve(&self, name: &str) -> Result<Resolved, CompileError> {
        let compiler = self.compiler;
        let function = &self.state.name;

        if let Some(slot) = self.state.local(name) {
            return Ok(Resolved::Var(Var::Local(slot)));
        }
        if let Some(i) = self.state.param(name) {
            return Ok(Resolved::Var(Var::Argument(i)));
        }
        if let Some(id) = self.state.statics.get(name) {
            return Ok(Resolved::Var(Var::Static(id)));
        }
        if let Some(n) = argument_number(name) {
            return Ok(Resolved::Var(Var::Argument(n)));
        }
        if name == "argument_count" {
            return Ok(Resolved::ArgumentCount);
        }
        if let Some(value) = compiler.library().constant(name) {
            return Ok(Resolved::Constant(value.clone()));
        }
        if let Some(asset) = compiler.assets().get(name) {
            return Ok(Resolved::Constant(Value::Real(asset.id as f64)));
        }
        if let Some(index) = compiler.bytecode().lookup(name) {
            return Ok(Resolved::Function(index));
        }
        if compiler.is_globalvar(name) {
            return Ok(Resolved::Var(Var::Global(
                compiler.intern(NamespaceKind::Global, name, function)?,
            )));
        }
        Ok(Resolved::Var(Var::Instance(
            compiler.intern(NamespaceKind::Instance, name, function)?,
        )))
    }

    fn resolve_var(&self, name: &str, span: Span) -> Result<Var, CompileError> {
        match self.resolve(name)? {
            Resolved::Var(var) => Ok(var),
            Resolved::ArgumentCount => Err(self.malformed("cannot assign to argument_count", span)),
            Resolved::Constant(_) => Err(self.malformed(format!("cannot assign to constant '{}'", name), span)),
            Resolved::Function(_) => Err(self.malformed(format!("cannot assign to function '{}'", name), span)),
        }
    }

    /// `argument[i]` reads the argument list unless `argument` is a
    /// variable of this function.
    fn is_argument_array(&self, target: &Node) -> bool {
        matches!(&target.kind, NodeKind::Identifier(name)
            if name == "argument"
                && self.state.local(name).is_none()
                && self.state.param(name).is_none()
                && self.state.statics.get(name).is_none())
    }

    fn dims(&self, indices: &[Node], span: Span) -> Result<u8, CompileError> {
        match u8::try_from(indices.len()) {
            Ok(0) => Err(self.malformed("index expression without indices", span)),
            Ok(n) => Ok(n),
            Err(_) => Err(self.malformed("too many array dimensions", span)),
        }
    }

    fn indices(&mut self, indices: &[Node], ctx: GenerateContext) -> Result<(), CompileError> {
        for index in indices {
            self.expression(index, ctx)?;
        }
        Ok(())
    }

    fn field_id(&self, field: &str) -> Result<u32, CompileError> {
        self.compiler
            .intern(NamespaceKind::Instance, field, &self.state.name)
    }

    // =========================================================================
    // Places
    // =========================================================================

    /// Emit the operands of an assignment target and return its place.
    pub(crate) fn place(&mut self, target: &Node, ctx: GenerateContext) -> Result<Place, CompileError> {
        let span = target.span;
        match &target.kind {
            NodeKind::Identifier(name) => Ok(Place::Var(self.resolve_var(name, span)?)),

            NodeKind::Member { object, field } => {
                if let Some(var) = keyword_var(object, self.compiler, field, &self.state.name)? {
                    return Ok(Place::Var(var));
                }
                if let NodeKind::Identifier(e) = &object.kind {
                    if self.compiler.enums().contains(e) {
                        return Err(self.malformed(format!("cannot assign to enum member '{}.{}'", e, field), span));
                    }
                }
                self.expression(object, ctx)?;
                Ok(Place::Field(self.field_id(field)?))
            }

            NodeKind::Index { target: inner, indices } => {
                let dims = self.dims(indices, span)?;
                if self.is_argument_array(inner) {
                    return Err(self.malformed("cannot assign to argument[]", span));
                }
                match &inner.kind {
                    NodeKind::Identifier(name) => {
                        let var = self.resolve_var(name, inner.span)?;
                        self.indices(indices, ctx)?;
                        Ok(Place::Indexed { var, dims })
                    }
                    NodeKind::Member { object, field } => {
                        if let Some(var) = keyword_var(object, self.compiler, field, &self.state.name)? {
                            self.indices(indices, ctx)?;
                            return Ok(Place::Indexed { var, dims });
                        }
                        self.expression(object, ctx)?;
                        self.indices(indices, ctx)?;
                        Ok(Place::FieldIndexed {
                            field: self.field_id(field)?,
                            dims,
                        })
                    }
                    _ => Err(self.malformed("only variables and fields can be indexed for assignment", span)),
                }
            }

            other => Err(self.malformed(format!("cannot assign to a {}", other.name()), span)),
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// Generate `node`, leaving exactly one value on the stack.
    pub(crate) fn expression(&mut self, node: &Node, ctx: GenerateContext) -> Result<(), CompileError> {
        if ctx.enum_expression {
            return Err(self.malformed("enum initializer must be a constant expression", node.span));
        }

        match &node.kind {
            NodeKind::Literal(value) => self.emit(Op::Push(value.clone())),

            NodeKind::Identifier(name) => match self.resolve(name)? {
                Resolved::Var(var) => self.emit_named(Op::Load(Place::Var(var)), name),
                Resolved::Constant(value) => self.emit(Op::Push(value)),
                Resolved::Function(index) => self.emit_named(Op::PushFunction(index), name),
                Resolved::ArgumentCount => self.emit(Op::ArgumentCount),
            },

            NodeKind::Member { object, field } => {
                if let Some(var) = keyword_var(object, self.compiler, field, &self.state.name)? {
                    return self.emit_named(Op::Load(Place::Var(var)), field);
                }
                if let NodeKind::Identifier(e) = &object.kind {
                    if self.compiler.enums().contains(e) {
                        let value = self.compiler.enums().get(e, field).ok_or_else(|| {
                            CompileError::unresolved(&format!("{}.{}", e, field), self.location(node.span))
                        })?;
                        return self.emit(Op::Push(value));
                    }
                }
                self.expression(object, ctx)?;
                let id = self.field_id(field)?;
                self.emit_named(Op::Load(Place::Field(id)), field)
            }

            NodeKind::Index { target, indices } => self.index(target, indices, node.span, ctx),

            NodeKind::Unary { op, operand } => {
                self.expression(operand, ctx)?;
                match op {
                    UnaryOp::Plus => Ok(()),
                    UnaryOp::Neg => self.emit(Op::Neg),
                    UnaryOp::Not => self.emit(Op::Not),
                    UnaryOp::BitNot => self.emit(Op::BitNot),
                }
            }

            NodeKind::Binary { op, lhs, rhs } => {
                self.expression(lhs, ctx)?;
                self.expression(rhs, ctx)?;
                self.emit(Op::from_binary(*op))
            }

            NodeKind::Logical { op, lhs, rhs } => {
                self.expression(lhs, ctx)?;
                self.emit(Op::ToBool)?;
                self.emit(Op::Dup)?;
                let end = match op {
                    LogicalOp::And => self.hole(Op::JumpIfFalse)?,
                    LogicalOp::Or => self.hole(Op::JumpIfTrue)?,
                };
                self.emit(Op::Pop)?;
                self.expression(rhs, ctx)?;
                self.emit(Op::ToBool)?;
                let at = self.label();
                self.patch(end, at)
            }

            NodeKind::Ternary {
                condition,
                then,
                otherwise,
            } => {
                self.expression(condition, ctx)?;
                let else_hole = self.hole(Op::JumpIfFalse)?;
                self.expression(then, ctx)?;
                let end_hole = self.hole(Op::Jump)?;
                let else_at = self.label();
                self.patch(else_hole, else_at)?;
                self.expression(otherwise, ctx)?;
                let end = self.label();
                self.patch(end_hole, end)
            }

            NodeKind::Call { callee, args } => self.call(callee, args, node.span, ctx),

            NodeKind::CallValue { callee, args } => {
                let argc = self.argc(args, node.span)?;
                self.arguments(args, ctx)?;
                self.expression(callee, ctx)?;
                self.emit(Op::CallValue { argc })
            }

            NodeKind::Function(literal) => self.function_literal(literal, node.span),

            NodeKind::Array(items) => {
                let n = u32::try_from(items.len())
                    .map_err(|_| self.malformed("array literal is too long", node.span))?;
                for item in items {
                    self.expression(item, ctx)?;
                }
                self.emit(Op::MakeArray(n))
            }

            NodeKind::IncDec { op, target } => self.inc_dec(*op, target, ctx),

            other => Err(self.malformed(format!("{} cannot be used as a value", other.name()), node.span)),
        }
    }

    fn index(&mut self, target: &Node, indices: &[Node], span: Span, ctx: GenerateContext) -> Result<(), CompileError> {
        if self.is_argument_array(target) {
            let [index] = indices else {
                return Err(self.malformed("argument[] takes exactly one index", span));
            };
            self.expression(index, ctx)?;
            return self.emit(Op::LoadArgument);
        }

        let dims = self.dims(indices, span)?;
        match &target.kind {
            NodeKind::Identifier(name) => {
                if let Resolved::Var(var) = self.resolve(name)? {
                    self.indices(indices, ctx)?;
                    return self.emit_named(Op::Load(Place::Indexed { var, dims }), name);
                }
            }
            NodeKind::Member { object, field } => {
                if let Some(var) = keyword_var(object, self.compiler, field, &self.state.name)? {
                    self.indices(indices, ctx)?;
                    return self.emit_named(Op::Load(Place::Indexed { var, dims }), field);
                }
                let is_enum = matches!(&object.kind, NodeKind::Identifier(e) if self.compiler.enums().contains(e));
                if !is_enum {
                    self.expression(object, ctx)?;
                    self.indices(indices, ctx)?;
                    let id = self.field_id(field)?;
                    return self.emit_named(Op::Load(Place::FieldIndexed { field: id, dims }), field);
                }
            }
            _ => {}
        }

        // any other value: index one dimension at a time
        self.expression(target, ctx)?;
        for index in indices {
            self.expression(index, ctx)?;
            self.emit(Op::Index)?;
        }
        Ok(())
    }

    /// `++x` leaves the new value, `x++` the old one.
    fn inc_dec(&mut self, op: IncDecOp, target: &Node, ctx: GenerateContext) -> Result<(), CompileError> {
        let place = self.place(target, ctx)?;
        let n = place.operands();
        self.dup_operands(n)?;
        self.emit(Op::Load(place))?;
        if !op.is_prefix() {
            self.tuck(n)?;
        }
        self.emit(Op::Push(Value::Real(1.0)))?;
        self.emit(Op::from_binary(op.binary()))?;
        if op.is_prefix() {
            self.tuck(n)?;
        }
        self.emit(Op::Store(place))
    }

    /// Copy the top value below the `n` place operands under it.
    fn tuck(&mut self, n: usize) -> Result<(), CompileError> {
        if n == 0 {
            return self.emit(Op::Dup);
        }
        let n = u8::try_from(n).map_err(|_| CompileError::capacity(&self.state.name, "array dimension", u8::MAX as usize))?;
        self.emit(Op::Tuck(n))
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn argc(&self, args: &[Node], span: Span) -> Result<u8, CompileError> {
        u8::try_from(args.len()).map_err(|_| self.malformed("too many arguments", span))
    }

    fn arguments(&mut self, args: &[Node], ctx: GenerateContext) -> Result<(), CompileError> {
        for arg in args {
            self.expression(arg, ctx)?;
        }
        Ok(())
    }

    fn call(&mut self, callee: &str, args: &[Node], span: Span, ctx: GenerateContext) -> Result<(), CompileError> {
        let argc = self.argc(args, span)?;

        // a variable of this function holding a function value
        let local = self
            .state
            .local(callee)
            .map(Var::Local)
            .or_else(|| self.state.param(callee).map(Var::Argument))
            .or_else(|| self.state.statics.get(callee).map(Var::Static));
        if let Some(var) = local {
            self.arguments(args, ctx)?;
            self.emit_named(Op::Load(Place::Var(var)), callee)?;
            return self.emit(Op::CallValue { argc });
        }

        match self.compiler.library().get(callee).cloned() {
            Some(Builtin::Function { id, min_args, max_args }) => {
                let fits = argc >= min_args && max_args.is_none_or(|max| argc <= max);
                if !fits {
                    let expected = match max_args {
                        Some(max) if max == min_args => max.to_string(),
                        Some(max) => format!("{} to {}", min_args, max),
                        None => format!("at least {}", min_args),
                    };
                    return Err(CompileError::arity(callee, expected, args.len(), self.location(span)));
                }
                self.arguments(args, ctx)?;
                return self.emit_named(Op::CallBuiltin { id, argc }, callee);
            }
            Some(Builtin::Constant(_)) => {
                return Err(self.malformed(format!("'{}' is a constant, not a function", callee), span));
            }
            None => {}
        }

        if let Some(function) = self.compiler.bytecode().lookup(callee) {
            let arity = self.compiler.bytecode().arity(function).unwrap_or_default();
            if !arity.accepts(args.len()) {
                return Err(CompileError::arity(
                    callee,
                    format!("at most {}", arity.params),
                    args.len(),
                    self.location(span),
                ));
            }
            self.arguments(args, ctx)?;
            return self.emit_named(Op::Call { function, argc }, callee);
        }

        Err(CompileError::unresolved(callee, self.location(span)))
    }

    /// Compile a function literal as a function of its own and push it.
    ///
    /// Project compilation reserves every literal up front; a function
    /// compiled on its own reserves them as it reaches them.
    fn function_literal(&mut self, literal: &FunctionLiteral, span: Span) -> Result<(), CompileError> {
        let ordinal = self.state.next_literal();
        let (name, index) = match self.compiler.reserved_literal(&self.state.name, ordinal) {
            Some(reserved) => reserved,
            None => {
                let location = self.location(span);
                self.compiler
                    .declare_literal(&self.state.name, ordinal, literal, location)?
            }
        };
        self.compiler
            .compile_body(index, &name, &literal.params, literal.variadic, &literal.body)?;
        self.emit_named(Op::PushFunction(index), &name)
    }
}
