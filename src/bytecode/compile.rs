use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
    bytecode::{
        CodeObject, Op, ProgramBc,
        accumulator::{Arity, AssetDescriptor, AssetKind, AssetTable, BytecodeTable, EnumTable, Library},
        compile_error::{CompileError, CompileErrors, Location},
        context::{Cleanup, FunctionState, GenerateContext},
        emitter::{Address, Emitter, Hole, JumpCtor},
        expr,
        namespace::{Namespace, NamespaceKind},
        op::{Place, Var},
        peephole,
        prepass::Prepass,
        sinks::{DebugRecord, DebugSink, ReflectionSink, Sinks},
    },
    config::GenerateConfig,
    lang::{
        ast::{
            BinaryOp, Case, Declaration, EnumMember, FunctionDecl, FunctionLiteral, Node, NodeKind, Project, Span,
        },
        value::Value,
    },
};

/// A compilation session.
///
/// Owns the project-wide tables. Functions can be compiled one at a time
/// with [`Compiler::compile_function`] or all at once with
/// [`Compiler::compile_project`]; every method takes `&self`, so one
/// compiler can be shared by worker threads.
pub struct Compiler {
    config: GenerateConfig,
    library: Library,
    assets: AssetTable,
    bytecode: BytecodeTable,
    enums: EnumTable,
    instance: Namespace,
    globals: Namespace,
    /// Names declared with `globalvar`.
    globalvars: RwLock<HashSet<String>>,
    /// Numbers anonymous function literals.
    lambda_counter: AtomicU32,
    /// Reserved function literals: (enclosing unit, position in it) ->
    /// (name, index).
    literals: RwLock<HashMap<(String, u32), (String, u32)>>,
    sinks: Sinks,
}

impl Compiler {
    pub fn new(config: GenerateConfig) -> Self {
        Self::with_library(config, Library::standard())
    }

    pub fn with_library(config: GenerateConfig, library: Library) -> Self {
        Self {
            instance: Namespace::new(NamespaceKind::Instance, config.max_variables),
            globals: Namespace::new(NamespaceKind::Global, config.max_variables),
            config,
            library,
            assets: AssetTable::new(),
            bytecode: BytecodeTable::new(),
            enums: EnumTable::new(),
            globalvars: RwLock::new(HashSet::new()),
            lambda_counter: AtomicU32::new(0),
            literals: RwLock::new(HashMap::new()),
            sinks: Sinks::default(),
        }
    }

    pub fn set_debug_sink(&mut self, sink: Box<dyn DebugSink>) {
        self.sinks.set_debug(sink);
    }

    pub fn set_reflection_sink(&mut self, sink: Box<dyn ReflectionSink>) {
        self.sinks.set_reflection(sink);
    }

    pub fn config(&self) -> &GenerateConfig {
        &self.config
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn assets(&self) -> &AssetTable {
        &self.assets
    }

    pub fn bytecode(&self) -> &BytecodeTable {
        &self.bytecode
    }

    pub fn enums(&self) -> &EnumTable {
        &self.enums
    }

    pub fn namespace(&self, kind: NamespaceKind) -> &Namespace {
        match kind {
            NamespaceKind::Instance => &self.instance,
            NamespaceKind::Global => &self.globals,
        }
    }

    pub(crate) fn sinks(&self) -> &Sinks {
        &self.sinks
    }

    pub fn register_asset(&self, name: &str, kind: AssetKind) -> AssetDescriptor {
        self.assets.register(name, kind)
    }

    pub fn declare_globalvar(&self, name: &str) {
        self.globalvars.write().insert(name.to_string());
    }

    pub fn is_globalvar(&self, name: &str) -> bool {
        self.globalvars.read().contains(name)
    }

    /// Reserve a bytecode index so calls can be compiled before the callee.
    pub fn declare_function(&self, name: &str, arity: Arity, location: Location) -> Result<u32, CompileError> {
        let index = self
            .bytecode
            .reserve(name, arity)
            .ok_or_else(|| CompileError::duplicate_function(name, location))?;
        self.sinks.function(name, index);
        Ok(index)
    }

    /// Reserve the `ordinal`-th function literal of `unit`, naming it if it
    /// is anonymous.
    pub(crate) fn declare_literal(
        &self,
        unit: &str,
        ordinal: u32,
        literal: &FunctionLiteral,
        location: Location,
    ) -> Result<(String, u32), CompileError> {
        let name = match &literal.name {
            Some(name) => name.clone(),
            None => self.next_lambda(unit),
        };
        let params = u8::try_from(literal.params.len())
            .map_err(|_| CompileError::capacity(&name, "parameter", u8::MAX as usize))?;
        let index = self.declare_function(&name, Arity::new(params, literal.variadic), location)?;
        self.literals
            .write()
            .insert((unit.to_string(), ordinal), (name.clone(), index));
        Ok((name, index))
    }

    pub(crate) fn reserved_literal(&self, unit: &str, ordinal: u32) -> Option<(String, u32)> {
        self.literals.read().get(&(unit.to_string(), ordinal)).cloned()
    }

    /// Id of a variable name, creating it on first reference.
    pub(crate) fn intern(
        &self,
        kind: NamespaceKind,
        name: &str,
        function: &str,
    ) -> Result<u32, CompileError> {
        let ns = self.namespace(kind);
        let symbol = ns.get_or_insert(name).ok_or_else(|| {
            let what = match kind {
                NamespaceKind::Instance => "instance variable",
                NamespaceKind::Global => "global variable",
            };
            CompileError::capacity(function, what, ns.limit())
        })?;
        if symbol.fresh {
            self.sinks.variable(kind, name, symbol.id);
        }
        Ok(symbol.id)
    }

    pub(crate) fn next_lambda(&self, enclosing: &str) -> String {
        let n = self.lambda_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}@lambda{}", enclosing, n)
    }

    /// Evaluate a compile-time constant expression.
    pub fn evaluate_constant(&self, node: &Node, function: &str) -> Result<Value, CompileError> {
        expr::fold(self, node, function)?.ok_or_else(|| {
            CompileError::malformed(
                format!("{} is not a constant expression", node.kind.name()),
                Location::new(function, node.span),
            )
        })
    }

    /// Define the members of an enum, numbering them from the previous
    /// member's value.
    pub(crate) fn define_enum(
        &self,
        name: &str,
        members: &[EnumMember],
        location: Location,
        mut value_of: impl FnMut(&Node) -> Result<Value, CompileError>,
    ) -> Result<(), CompileError> {
        let mut next = Some(0.0);
        for member in members {
            let value = match &member.value {
                Some(init) => value_of(init)?,
                None => Value::Real(next.ok_or_else(|| {
                    CompileError::malformed(
                        format!(
                            "enum member '{}.{}' follows a non-numeric value and needs an initializer",
                            name, member.name
                        ),
                        location.clone(),
                    )
                })?),
            };
            next = value.as_real().map(|r| r + 1.0);

            if let Some(old) = self.enums.define(name, &member.name, value.clone()) {
                if old != value {
                    warn!("enum member {}.{} redefined: {} -> {}", name, member.name, old, value);
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Compile one function, reserving its index if it has none yet.
    pub fn compile_function(&self, decl: &FunctionDecl) -> Result<u32, CompileError> {
        let location = Location::new(&decl.name, decl.body.span);
        let index = match self.bytecode.lookup(&decl.name) {
            Some(index) if !self.bytecode.is_defined(index) => index,
            Some(_) => return Err(CompileError::duplicate_function(&decl.name, location)),
            None => self.declare_function(&decl.name, decl_arity(decl)?, location)?,
        };
        self.compile_body(index, &decl.name, &decl.params, decl.variadic, &decl.body)?;
        Ok(index)
    }

    /// Compile every function of a project.
    ///
    /// Source errors are collected across functions; an internal error stops
    /// the compilation at once. Errors in declarations (duplicate names, bad
    /// enums) stop it before any body is compiled.
    pub fn compile_project(&self, project: &Project) -> Result<ProgramBc, CompileErrors> {
        let mut errors = Vec::new();

        for asset in &project.assets {
            self.register_asset(&asset.name, asset.kind);
        }

        let mut jobs = Vec::with_capacity(project.functions.len());
        for decl in &project.functions {
            let location = Location::new(&decl.name, decl.body.span);
            match decl_arity(decl).and_then(|arity| self.declare_function(&decl.name, arity, location)) {
                Ok(index) => jobs.push((decl, index)),
                Err(e) => errors.push(e),
            }
        }

        Prepass::new(self).run(project, &mut errors);
        if !errors.is_empty() {
            return Err(CompileErrors(errors));
        }

        let failures = if self.config.jobs > 1 && jobs.len() > 1 {
            self.compile_parallel(&jobs)
        } else {
            self.compile_sequential(&jobs)
        };
        errors.extend(failures);

        if !errors.is_empty() {
            return Err(CompileErrors(errors));
        }
        self.program().map_err(CompileErrors::from)
    }

    /// Snapshot of everything compiled so far.
    pub fn program(&self) -> Result<ProgramBc, CompileError> {
        Ok(ProgramBc {
            functions: self.bytecode.code_objects()?,
            instance_names: self.instance.names(),
            global_names: self.globals.names(),
        })
    }

    fn compile_sequential(&self, jobs: &[(&FunctionDecl, u32)]) -> Vec<CompileError> {
        let mut errors = Vec::new();
        for (decl, index) in jobs {
            if let Err(e) =
                self.compile_body(*index, &decl.name, &decl.params, decl.variadic, &decl.body)
            {
                let internal = e.is_internal();
                errors.push(e);
                if internal {
                    break;
                }
            }
        }
        errors
    }

    fn compile_parallel(&self, jobs: &[(&FunctionDecl, u32)]) -> Vec<CompileError> {
        let next = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let failures: Mutex<Vec<(usize, CompileError)>> = Mutex::new(Vec::new());
        let workers = self.config.jobs.min(jobs.len());

        debug!("compiling {} functions on {} threads", jobs.len(), workers);

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| {
                    while !abort.load(Ordering::Relaxed) {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some((decl, index)) = jobs.get(i) else {
                            break;
                        };
                        if let Err(e) = self.compile_body(
                            *index,
                            &decl.name,
                            &decl.params,
                            decl.variadic,
                            &decl.body,
                        ) {
                            if e.is_internal() {
                                abort.store(true, Ordering::Relaxed);
                            }
                            failures.lock().push((i, e));
                        }
                    }
                });
            }
        });

        let mut failures = failures.into_inner();
        failures.sort_by_key(|(i, _)| *i);
        failures.into_iter().map(|(_, e)| e).collect()
    }

    pub(crate) fn compile_body(
        &self,
        index: u32,
        name: &str,
        params: &[String],
        variadic: bool,
        body: &Node,
    ) -> Result<(), CompileError> {
        debug!("compiling '{}' (index {})", name, index);

        let arity = self.bytecode.arity(index).ok_or_else(|| {
            CompileError::internal(format!("function '{}' has no reserved index", name))
        })?;

        let mut generator = Generator::new(self, name, params, variadic);
        generator.statement(body, GenerateContext::default())?;
        generator.emit(Op::Ret)?;

        let code = generator.finish(arity)?;
        self.bytecode.define(index, code)
    }
}

fn decl_arity(decl: &FunctionDecl) -> Result<Arity, CompileError> {
    let params = u8::try_from(decl.params.len())
        .map_err(|_| CompileError::capacity(&decl.name, "parameter", u8::MAX as usize))?;
    Ok(Arity::new(params, decl.variadic))
}

// =============================================================================
// Generator - walks one function
// =============================================================================

pub(crate) struct Generator<'c> {
    pub(crate) compiler: &'c Compiler,
    pub(crate) em: Emitter,
    pub(crate) state: FunctionState,
}

impl<'c> Generator<'c> {
    fn new(compiler: &'c Compiler, name: &str, params: &[String], variadic: bool) -> Self {
        Self {
            compiler,
            em: Emitter::new(name, compiler.config.max_instructions),
            state: FunctionState::new(name, params, variadic),
        }
    }

    fn finish(self, arity: Arity) -> Result<CodeObject, CompileError> {
        let state = self.state;
        if !state.breaks.is_empty() || !state.continues.is_empty() || !state.cleanup.is_empty() {
            return Err(CompileError::internal(format!(
                "unbalanced scopes at end of '{}'",
                state.name
            )));
        }

        let (ops, locations) = self.em.finish()?;
        Ok(CodeObject {
            local_count: state.local_count(),
            static_count: state.statics.len() as u32,
            name: state.name,
            ops,
            locations,
            arity,
        })
    }

    // ───────────────────────────── Emission ─────────────────────────────

    pub(crate) fn location(&self, span: Span) -> Location {
        let span = if span == Span::default() {
            self.em.span()
        } else {
            span
        };
        Location::new(self.state.name.clone(), span)
    }

    pub(crate) fn malformed(&self, message: impl Into<String>, span: Span) -> CompileError {
        CompileError::malformed(message, self.location(span))
    }

    pub(crate) fn emit(&mut self, op: Op<Address>) -> Result<(), CompileError> {
        self.emit_symbol(op, None)
    }

    /// Emit an instruction that refers to a named variable or function.
    pub(crate) fn emit_named(
        &mut self,
        op: Op<Address>,
        symbol: &str,
    ) -> Result<(), CompileError> {
        self.emit_symbol(op, Some(symbol))
    }

    fn emit_symbol(
        &mut self,
        op: Op<Address>,
        symbol: Option<&str>,
    ) -> Result<(), CompileError> {
        let address = self.em.emit(op)?;
        self.report(address, symbol);

        if self.compiler.config.peephole {
            if let Some(from) = peephole::optimize_tail(&mut self.em)? {
                if self.compiler.config.debug_symbols {
                    self.compiler.sinks.retract(&self.state.name, from);
                    for address in from..self.em.here() {
                        self.report(address, None);
                    }
                }
            }
        }
        Ok(())
    }

    fn report(&self, address: usize, symbol: Option<&str>) {
        if !self.compiler.config.debug_symbols {
            return;
        }
        self.compiler.sinks.record(DebugRecord {
            function: self.state.name.clone(),
            address,
            span: self.em.span_at(address).unwrap_or_default(),
            symbol: symbol.map(str::to_string),
        });
    }

    pub(crate) fn jump(&mut self, ctor: JumpCtor, target: usize) -> Result<(), CompileError> {
        self.emit(ctor(Address::Resolved(target)))
    }

    pub(crate) fn hole(&mut self, ctor: JumpCtor) -> Result<Hole, CompileError> {
        let hole = self.em.reserve_placeholder(ctor)?;
        self.report(hole.address(), None);
        Ok(hole)
    }

    pub(crate) fn label(&mut self) -> usize {
        self.em.label()
    }

    pub(crate) fn patch(&mut self, hole: Hole, target: usize) -> Result<(), CompileError> {
        self.em.patch(hole, target)
    }

    fn patch_all(&mut self, holes: Vec<Hole>, target: usize) -> Result<(), CompileError> {
        for hole in holes {
            self.patch(hole, target)?;
        }
        Ok(())
    }

    /// Run `body` with fresh break (and optionally continue) lists, and
    /// hand back the holes collected in them.
    fn breakable(
        &mut self,
        continuable: bool,
        body: impl FnOnce(&mut Self) -> Result<(), CompileError>,
    ) -> Result<(Vec<Hole>, Vec<Hole>), CompileError> {
        self.state.breaks.push(Vec::new());
        if continuable {
            self.state.continues.push(Vec::new());
        }

        let result = body(self);

        let continues = if continuable {
            self.state.continues.pop()
        } else {
            Some(Vec::new())
        };
        let breaks = self.state.breaks.pop();
        result?;

        match (breaks, continues) {
            (Some(b), Some(c)) => Ok((b, c)),
            _ => Err(CompileError::internal("break/continue list stack underflow")),
        }
    }

    /// Run `body` with a cleanup command active.
    fn scoped(
        &mut self,
        cleanup: Cleanup,
        body: impl FnOnce(&mut Self) -> Result<(Vec<Hole>, Vec<Hole>), CompileError>,
    ) -> Result<(Vec<Hole>, Vec<Hole>), CompileError> {
        self.state.cleanup.push(cleanup);
        let result = body(self);
        self.state.cleanup.pop();
        result
    }

    /// Emit the unwind sequence for an early exit.
    fn unwind(&mut self) -> Result<(), CompileError> {
        for cleanup in self.state.unwind() {
            match cleanup {
                Cleanup::PopValue => self.emit(Op::Pop)?,
                Cleanup::ExitWith => self.emit(Op::WithExit)?,
            }
        }
        Ok(())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    pub(crate) fn statement(&mut self, node: &Node, ctx: GenerateContext) -> Result<(), CompileError> {
        let saved = self.em.span();
        if node.span != Span::default() {
            self.em.set_span(node.span);
        }
        if self.compiler.config.debug_symbols && !matches!(node.kind, NodeKind::Block(_)) {
            self.em.mark_boundary();
            self.compiler
                .sinks
                .anchor(&self.state.name, self.em.here(), self.em.span());
        }

        let result = self.statement_kind(node, ctx);
        self.em.set_span(saved);
        result
    }

    fn statement_kind(&mut self, node: &Node, ctx: GenerateContext) -> Result<(), CompileError> {
        match &node.kind {
            NodeKind::Block(stmts) => {
                for stmt in stmts {
                    self.statement(stmt, ctx)?;
                }
            }

            NodeKind::Var(decls) => {
                for decl in decls {
                    self.var_decl(decl, ctx)?;
                }
            }

            NodeKind::Static(decls) => {
                for decl in decls {
                    self.static_decl(decl, ctx)?;
                }
            }

            NodeKind::GlobalVar(names) => {
                for name in names {
                    self.compiler.declare_globalvar(name);
                    self.compiler
                        .intern(NamespaceKind::Global, name, &self.state.name)?;
                }
            }

            NodeKind::Assign { op, target, value } => match op.binary() {
                None => {
                    let place = self.place(target, ctx)?;
                    self.expression(value, ctx)?;
                    self.emit(Op::Store(place))?;
                }
                Some(bin) => self.update(target, bin, Some(value), ctx)?,
            },

            // as a statement no value is kept
            NodeKind::IncDec { op, target } => self.update(target, op.binary(), None, ctx)?,

            NodeKind::If {
                condition,
                then,
                otherwise,
            } => self.if_stmt(condition, then, otherwise.as_deref(), ctx)?,

            NodeKind::While { condition, body } => self.while_stmt(condition, body, ctx)?,

            NodeKind::DoUntil { body, condition } => self.do_until(body, condition, ctx)?,

            NodeKind::Repeat { count, body } => self.repeat(count, body, ctx)?,

            NodeKind::For {
                init,
                condition,
                step,
                body,
            } => self.for_stmt(
                init.as_deref(),
                condition.as_deref(),
                step.as_deref(),
                body,
                ctx,
            )?,

            NodeKind::Switch { value, cases } => self.switch(value, cases, node.span, ctx)?,

            NodeKind::With { target, body } => self.with(target, body, ctx)?,

            NodeKind::Break => {
                if self.state.breaks.is_empty() {
                    return Err(self.malformed("break outside of a loop, switch or with", node.span));
                }
                let hole = self.hole(Op::Jump)?;
                if let Some(list) = self.state.breaks.last_mut() {
                    list.push(hole);
                }
            }

            NodeKind::Continue => {
                if self.state.continues.is_empty() {
                    return Err(self.malformed("continue outside of a loop", node.span));
                }
                for _ in 0..ctx.continue_pop_count {
                    self.emit(Op::Pop)?;
                }
                let hole = self.hole(Op::Jump)?;
                if let Some(list) = self.state.continues.last_mut() {
                    list.push(hole);
                }
            }

            NodeKind::Return(value) => {
                if let Some(value) = value {
                    self.expression(value, ctx)?;
                    self.emit(Op::SetReturn)?;
                }
                self.unwind()?;
                self.emit(Op::Ret)?;
            }

            NodeKind::Exit => {
                self.unwind()?;
                self.emit(Op::Ret)?;
            }

            NodeKind::Enum { name, members } => {
                let ctx = ctx.enum_mode();
                let location = self.location(node.span);
                let compiler = self.compiler;
                compiler.define_enum(name, members, location, |init| self.constant(init, ctx))?;
            }

            // expression statement
            _ => {
                self.expression(node, ctx)?;
                self.emit(Op::Pop)?;
            }
        }

        Ok(())
    }

    fn var_decl(&mut self, decl: &Declaration, ctx: GenerateContext) -> Result<(), CompileError> {
        if let Some(init) = &decl.init {
            self.expression(init, ctx)?;
        }
        let limit = self.compiler.config.max_locals;
        let slot = self
            .state
            .declare_local(&decl.name, limit)
            .ok_or_else(|| CompileError::capacity(&self.state.name, "local variable", limit))?;
        if decl.init.is_some() {
            self.emit_named(Op::Store(Place::Var(Var::Local(slot))), &decl.name)?;
        }
        Ok(())
    }

    /// `static x = e;` runs `e` only the first time the function reaches it.
    fn static_decl(&mut self, decl: &Declaration, ctx: GenerateContext) -> Result<(), CompileError> {
        let limit = self.compiler.config.max_statics;
        let id = self
            .state
            .statics
            .declare(&decl.name, limit)
            .ok_or_else(|| CompileError::capacity(&self.state.name, "static variable", limit))?;

        self.emit(Op::StaticInitialized(id))?;
        let skip = self.hole(Op::JumpIfTrue)?;
        match &decl.init {
            Some(init) => self.expression(init, ctx)?,
            None => self.emit(Op::Push(Value::Undefined))?,
        }
        self.emit_named(
            Op::Store(Place::Var(Var::Static(id))),
            &decl.name,
        )?;
        let end = self.label();
        self.patch(skip, end)
    }

    /// `target op= value`, or `target op= 1` when `value` is `None`.
    fn update(
        &mut self,
        target: &Node,
        op: BinaryOp,
        value: Option<&Node>,
        ctx: GenerateContext,
    ) -> Result<(), CompileError> {
        let place = self.place(target, ctx)?;
        self.dup_operands(place.operands())?;
        self.emit(Op::Load(place))?;
        match value {
            Some(value) => self.expression(value, ctx)?,
            None => self.emit(Op::Push(Value::Real(1.0)))?,
        }
        self.emit(Op::from_binary(op))?;
        self.emit(Op::Store(place))
    }

    fn if_stmt(
        &mut self,
        condition: &Node,
        then: &Node,
        otherwise: Option<&Node>,
        ctx: GenerateContext,
    ) -> Result<(), CompileError> {
        self.expression(condition, ctx)?;
        let else_hole = self.hole(Op::JumpIfFalse)?;
        self.statement(then, ctx)?;

        match otherwise {
            None => {
                let end = self.label();
                self.patch(else_hole, end)
            }
            Some(otherwise) => {
                let end_hole = self.hole(Op::Jump)?;
                let else_at = self.label();
                self.patch(else_hole, else_at)?;
                self.statement(otherwise, ctx)?;
                let end = self.label();
                self.patch(end_hole, end)
            }
        }
    }

    fn while_stmt(&mut self, condition: &Node, body: &Node, ctx: GenerateContext) -> Result<(), CompileError> {
        let top = self.label();
        self.expression(condition, ctx)?;
        let exit = self.hole(Op::JumpIfFalse)?;

        let (breaks, continues) = self.breakable(true, |g| g.statement(body, ctx.enter_loop()))?;
        self.jump(Op::Jump, top)?;

        let end = self.label();
        self.patch(exit, end)?;
        self.patch_all(breaks, end)?;
        self.patch_all(continues, top)
    }

    fn do_until(&mut self, body: &Node, condition: &Node, ctx: GenerateContext) -> Result<(), CompileError> {
        let top = self.label();
        let (breaks, continues) = self.breakable(true, |g| g.statement(body, ctx.enter_loop()))?;

        let cont = self.label();
        self.expression(condition, ctx)?;
        self.jump(Op::JumpIfFalse, top)?;

        let end = self.label();
        self.patch_all(breaks, end)?;
        self.patch_all(continues, cont)
    }

    fn for_stmt(
        &mut self,
        init: Option<&Node>,
        condition: Option<&Node>,
        step: Option<&Node>,
        body: &Node,
        ctx: GenerateContext,
    ) -> Result<(), CompileError> {
        if let Some(init) = init {
            self.statement(init, ctx)?;
        }

        let top = self.label();
        let exit = match condition {
            Some(condition) => {
                self.expression(condition, ctx)?;
                Some(self.hole(Op::JumpIfFalse)?)
            }
            None => None,
        };

        let (breaks, continues) = self.breakable(true, |g| g.statement(body, ctx.enter_loop()))?;

        let cont = self.label();
        if let Some(step) = step {
            self.statement(step, ctx)?;
        }
        self.jump(Op::Jump, top)?;

        let end = self.label();
        if let Some(exit) = exit {
            self.patch(exit, end)?;
        }
        self.patch_all(breaks, end)?;
        self.patch_all(continues, cont)
    }

    /// The counter stays on the stack for the whole loop.
    fn repeat(&mut self, count: &Node, body: &Node, ctx: GenerateContext) -> Result<(), CompileError> {
        self.expression(count, ctx)?;

        let top = self.label();
        self.emit(Op::Dup)?;
        self.emit(Op::Push(Value::Real(0.0)))?;
        self.emit(Op::Gt)?;
        let exit = self.hole(Op::JumpIfFalse)?;

        let (breaks, continues) = self.scoped(Cleanup::PopValue, |g| {
            g.breakable(true, |g| g.statement(body, ctx.enter_loop()))
        })?;

        let cont = self.label();
        self.emit(Op::Push(Value::Real(1.0)))?;
        self.emit(Op::Sub)?;
        self.jump(Op::Jump, top)?;

        let end = self.label();
        self.emit(Op::Pop)?;

        self.patch(exit, end)?;
        self.patch_all(breaks, end)?;
        self.patch_all(continues, cont)
    }

    /// The dispatch value stays on the stack until the end of the switch.
    fn switch(
        &mut self,
        value: &Node,
        cases: &[Case],
        span: Span,
        ctx: GenerateContext,
    ) -> Result<(), CompileError> {
        self.expression(value, ctx)?;
        let inner = ctx
            .enter_switch()
            .ok_or_else(|| CompileError::capacity(&self.state.name, "switch nesting", u16::MAX as usize))?;

        let (breaks, _) = self.scoped(Cleanup::PopValue, |g| {
            g.breakable(false, |g| g.switch_cases(cases, span, inner))
        })?;

        let end = self.label();
        self.emit(Op::Pop)?;
        self.patch_all(breaks, end)
    }

    fn switch_cases(&mut self, cases: &[Case], span: Span, ctx: GenerateContext) -> Result<(), CompileError> {
        let mut dispatch = Vec::new();
        let mut default = None;

        for (i, case) in cases.iter().enumerate() {
            match &case.label {
                Some(label) => {
                    self.emit(Op::Dup)?;
                    self.expression(label, ctx)?;
                    self.emit(Op::Eq)?;
                    dispatch.push((i, self.hole(Op::JumpIfTrue)?));
                }
                None if default.is_some() => {
                    return Err(self.malformed("switch has more than one default case", span));
                }
                None => default = Some(i),
            }
        }
        let fallback = self.hole(Op::Jump)?;

        let mut starts = Vec::with_capacity(cases.len());
        for case in cases {
            starts.push(self.label());
            for stmt in &case.body {
                self.statement(stmt, ctx)?;
            }
        }

        for (i, hole) in dispatch {
            self.patch(hole, starts[i])?;
        }
        match default {
            Some(i) => self.patch(fallback, starts[i]),
            // no default: leave through the end, like a break
            None => match self.state.breaks.last_mut() {
                Some(list) => {
                    list.push(fallback);
                    Ok(())
                }
                None => Err(CompileError::internal("switch without a break list")),
            },
        }
    }

    fn with(&mut self, target: &Node, body: &Node, ctx: GenerateContext) -> Result<(), CompileError> {
        self.expression(target, ctx)?;
        self.emit(Op::WithEnter)?;

        let top = self.label();
        let exit = self.hole(Op::WithNext)?;

        let (breaks, continues) = self.scoped(Cleanup::ExitWith, |g| {
            g.breakable(true, |g| g.statement(body, ctx.enter_loop()))
        })?;
        self.jump(Op::Jump, top)?;

        let end = self.label();
        self.emit(Op::WithExit)?;

        self.patch(exit, end)?;
        self.patch_all(breaks, end)?;
        self.patch_all(continues, top)
    }

    pub(crate) fn dup_operands(&mut self, n: usize) -> Result<(), CompileError> {
        if n > 0 {
            let n = u8::try_from(n)
                .map_err(|_| CompileError::capacity(&self.state.name, "array dimension", u8::MAX as usize))?;
            self.emit(Op::DupN(n))?;
        }
        Ok(())
    }
}
