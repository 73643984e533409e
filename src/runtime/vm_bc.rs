use crate::bytecode::accumulator::Library;
use crate::bytecode::op::{Place, Var};
use crate::bytecode::stack_check::check_program;
use crate::bytecode::{Op, ProgramBc};
use crate::lang::ast::{BinaryOp, UnaryOp};
use crate::lang::value::{Value, apply_binary, apply_unary};
use crate::runtime::runtime_error::{
    ErrorKind, RuntimeError, division_by_zero, index_out_of_bounds, stack_underflow, type_error,
};
use log::{debug, trace};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// Ids below this are object indices.
pub const FIRST_INSTANCE_ID: u32 = 100_000;

const SELF: f64 = -1.0;
const OTHER: f64 = -2.0;
const ALL: f64 = -3.0;

#[derive(Debug, Clone)]
pub struct VmBcConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<usize>,
    pub max_stack_size: usize,
}

impl Default for VmBcConfig {
    fn default() -> Self {
        VmBcConfig {
            max_call_depth: 1000,
            max_steps: None,
            max_stack_size: 10_000,
        }
    }
}

// =============================================================================
// RtValue - values at run time
// =============================================================================

#[derive(Debug, Clone, Default)]
pub enum RtValue {
    #[default]
    Undefined,
    Real(f64),
    String(String),
    /// Arrays are shared by reference. 2-D arrays are arrays of arrays.
    Array(Rc<RefCell<Vec<RtValue>>>),
    /// Bytecode-table index.
    Function(u32),
    /// Iterator of an active `with`.
    With(Rc<RefCell<WithIter>>),
}

#[derive(Debug)]
pub struct WithIter {
    ids: Vec<u32>,
    next: usize,
    saved_self: u32,
    saved_other: u32,
}

impl WithIter {
    fn advance(&mut self) -> Option<u32> {
        let id = *self.ids.get(self.next)?;
        self.next += 1;
        Some(id)
    }
}

impl RtValue {
    pub fn array(items: Vec<RtValue>) -> Self {
        RtValue::Array(Rc::new(RefCell::new(items)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RtValue::Undefined => "undefined",
            RtValue::Real(_) => "real",
            RtValue::String(_) => "string",
            RtValue::Array(_) => "array",
            RtValue::Function(_) => "function",
            RtValue::With(_) => "with iterator",
        }
    }

    /// The value as a compile-time constant, if it is one.
    fn scalar(&self) -> Option<Value> {
        match self {
            RtValue::Undefined => Some(Value::Undefined),
            RtValue::Real(r) => Some(Value::Real(*r)),
            RtValue::String(s) => Some(Value::String(s.clone())),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Result<f64, RuntimeError> {
        match self {
            RtValue::Real(r) => Ok(*r),
            other => Err(type_error(format!("expected real, got {}", other.type_name()))),
        }
    }

    pub fn truthy(&self) -> Result<bool, RuntimeError> {
        match self {
            RtValue::Real(r) => Ok(*r > 0.5),
            other => Err(type_error(format!(
                "{} has no truth value",
                other.type_name()
            ))),
        }
    }
}

impl From<Value> for RtValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Undefined => RtValue::Undefined,
            Value::Real(r) => RtValue::Real(r),
            Value::String(s) => RtValue::String(s),
        }
    }
}

impl From<f64> for RtValue {
    fn from(r: f64) -> Self {
        RtValue::Real(r)
    }
}

impl From<bool> for RtValue {
    fn from(b: bool) -> Self {
        RtValue::Real(if b { 1.0 } else { 0.0 })
    }
}

impl PartialEq for RtValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RtValue::Undefined, RtValue::Undefined) => true,
            (RtValue::Real(a), RtValue::Real(b)) => a == b,
            (RtValue::String(a), RtValue::String(b)) => a == b,
            (RtValue::Array(a), RtValue::Array(b)) => Rc::ptr_eq(a, b),
            (RtValue::Function(a), RtValue::Function(b)) => a == b,
            (RtValue::With(a), RtValue::With(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Display for RtValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RtValue::Undefined => write!(f, "undefined"),
            RtValue::Real(r) => write!(f, "{}", Value::Real(*r)),
            RtValue::String(s) => write!(f, "{}", s),
            RtValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            RtValue::Function(index) => write!(f, "function {}", index),
            RtValue::With(_) => write!(f, "<with>"),
        }
    }
}

// =============================================================================
// Frames and instances
// =============================================================================

#[derive(Debug)]
struct Frame {
    function: u32,
    ip: usize,
    stack: Vec<RtValue>,
    locals: Vec<RtValue>,
    args: Vec<RtValue>,
    ret: RtValue,
    self_id: u32,
    other_id: u32,
}

impl Frame {
    fn push(&mut self, v: RtValue) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Result<RtValue, RuntimeError> {
        self.stack.pop().ok_or_else(stack_underflow)
    }

    fn peek(&self) -> Result<&RtValue, RuntimeError> {
        self.stack.last().ok_or_else(stack_underflow)
    }

    /// Pop `n` values, oldest first.
    fn pop_n(&mut self, n: usize) -> Result<Vec<RtValue>, RuntimeError> {
        let at = self.stack.len().checked_sub(n).ok_or_else(stack_underflow)?;
        Ok(self.stack.split_off(at))
    }
}

#[derive(Debug, Default)]
struct Instance {
    /// `None` for the instance `run` executes in.
    object: Option<u32>,
    vars: HashMap<u32, RtValue>,
}

enum Flow {
    Next,
    Call(Frame),
    Return,
}

// =============================================================================
// VmBc
// =============================================================================

/// Reference executor for compiled programs.
///
/// Globals, statics and instances persist across calls to [`VmBc::run`].
pub struct VmBc {
    library: Library,
    config: VmBcConfig,
    globals: HashMap<u32, RtValue>,
    statics: HashMap<(u32, u32), RtValue>,
    instances: BTreeMap<u32, Instance>,
    next_instance: u32,
    root: u32,
    output: Vec<String>,
    steps: usize,
}

impl Default for VmBc {
    fn default() -> Self {
        Self::new()
    }
}

impl VmBc {
    pub fn new() -> Self {
        Self::with_config(VmBcConfig::default())
    }

    pub fn with_config(config: VmBcConfig) -> Self {
        Self::with_library(Library::standard(), config)
    }

    /// The library must be the one the program was compiled against.
    pub fn with_library(library: Library, config: VmBcConfig) -> Self {
        let mut vm = Self {
            library,
            config,
            globals: HashMap::new(),
            statics: HashMap::new(),
            instances: BTreeMap::new(),
            next_instance: FIRST_INSTANCE_ID,
            root: FIRST_INSTANCE_ID,
            output: Vec::new(),
            steps: 0,
        };
        vm.root = vm.spawn(None);
        vm
    }

    /// Lines printed by `show_debug_message`.
    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    /// The instance `run` executes in.
    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn global(&self, program: &ProgramBc, name: &str) -> RtValue {
        program
            .global_names
            .iter()
            .position(|n| n == name)
            .and_then(|id| self.globals.get(&(id as u32)))
            .cloned()
            .unwrap_or_default()
    }

    pub fn instance_var(&self, program: &ProgramBc, instance: u32, name: &str) -> RtValue {
        program
            .instance_names
            .iter()
            .position(|n| n == name)
            .map(|id| self.field(instance, id as u32))
            .unwrap_or_default()
    }

    /// Call `function` by name in the root instance.
    pub fn run(
        &mut self,
        program: &ProgramBc,
        function: &str,
        args: Vec<RtValue>,
    ) -> Result<RtValue, RuntimeError> {
        check_program(program).map_err(|e| RuntimeError::new(&e.to_string()))?;

        let (index, _) = program
            .function(function)
            .ok_or_else(|| RuntimeError::from(ErrorKind::UnknownFunction(function.to_string())))?;

        debug!("running '{}' (index {})", function, index);
        self.steps = 0;
        let entry = self.frame(program, index, args, self.root, self.root)?;
        self.execute(program, entry)
    }

    fn spawn(&mut self, object: Option<u32>) -> u32 {
        let id = self.next_instance;
        self.next_instance += 1;
        self.instances.insert(
            id,
            Instance {
                object,
                ..Instance::default()
            },
        );
        id
    }

    fn frame(
        &self,
        program: &ProgramBc,
        function: u32,
        args: Vec<RtValue>,
        self_id: u32,
        other_id: u32,
    ) -> Result<Frame, RuntimeError> {
        let code = program
            .functions
            .get(function as usize)
            .ok_or_else(|| RuntimeError::from(ErrorKind::UnknownFunction(format!("#{}", function))))?;

        Ok(Frame {
            function,
            ip: 0,
            stack: Vec::new(),
            locals: vec![RtValue::Undefined; code.local_count as usize],
            args,
            ret: RtValue::Undefined,
            self_id,
            other_id,
        })
    }

    // Execution

    fn execute(&mut self, program: &ProgramBc, entry: Frame) -> Result<RtValue, RuntimeError> {
        let mut frames = vec![entry];

        loop {
            let Some(frame) = frames.last_mut() else {
                return Err(RuntimeError::new("no active frame"));
            };

            let flow = match self.step(program, frame) {
                Ok(flow) => flow,
                Err(e) => return Err(with_trace(e, program, &frames)),
            };

            match flow {
                Flow::Next => {}
                Flow::Call(callee) => {
                    if frames.len() >= self.config.max_call_depth {
                        let e = ErrorKind::CallDepth(self.config.max_call_depth).into();
                        return Err(with_trace(e, program, &frames));
                    }
                    frames.push(callee);
                }
                Flow::Return => {
                    let Some(done) = frames.pop() else {
                        return Err(RuntimeError::new("no active frame"));
                    };
                    match frames.last_mut() {
                        Some(caller) => caller.push(done.ret),
                        None => return Ok(done.ret),
                    }
                }
            }
        }
    }

    fn check_limits(&mut self, frame: &Frame) -> Result<(), RuntimeError> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(ErrorKind::StepLimit(max).into());
            }
        }

        if frame.stack.len() > self.config.max_stack_size {
            return Err(RuntimeError::new(&format!(
                "stack size limit exceeded ({})",
                self.config.max_stack_size
            )));
        }

        Ok(())
    }

    fn step(&mut self, program: &ProgramBc, frame: &mut Frame) -> Result<Flow, RuntimeError> {
        self.check_limits(frame)?;

        let code = program
            .functions
            .get(frame.function as usize)
            .ok_or_else(|| RuntimeError::new("frame refers to a missing function"))?;
        let op = code
            .ops
            .get(frame.ip)
            .ok_or_else(|| RuntimeError::new("control fell off the end of the function"))?;
        frame.ip += 1;

        match op {
            Op::Push(v) => frame.push(v.clone().into()),

            // Stack operations
            Op::Pop => {
                frame.pop()?;
            }
            Op::Dup => {
                let v = frame.peek()?.clone();
                frame.push(v);
            }
            Op::DupN(n) => {
                let at = frame
                    .stack
                    .len()
                    .checked_sub(*n as usize)
                    .ok_or_else(stack_underflow)?;
                frame.stack.extend_from_within(at..);
            }
            Op::Tuck(n) => {
                let v = frame.peek()?.clone();
                let at = frame
                    .stack
                    .len()
                    .checked_sub(*n as usize + 1)
                    .ok_or_else(stack_underflow)?;
                frame.stack.insert(at, v);
            }
            Op::Swap => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(b);
                frame.push(a);
            }

            // Operators
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::IntDiv
            | Op::Mod
            | Op::BitAnd
            | Op::BitOr
            | Op::BitXor
            | Op::Shl
            | Op::Shr
            | Op::Xor
            | Op::Eq
            | Op::Ne
            | Op::Lt
            | Op::Gt
            | Op::Le
            | Op::Ge => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                let op = op
                    .binary()
                    .ok_or_else(|| RuntimeError::new("not a binary instruction"))?;
                frame.push(binary(op, a, b)?);
            }
            Op::Neg => {
                let a = frame.pop()?;
                frame.push(unary(UnaryOp::Neg, a)?);
            }
            Op::Not => {
                let a = frame.pop()?;
                frame.push(unary(UnaryOp::Not, a)?);
            }
            Op::BitNot => {
                let a = frame.pop()?;
                frame.push(unary(UnaryOp::BitNot, a)?);
            }
            Op::ToBool => {
                let a = frame.pop()?;
                frame.push(a.truthy()?.into());
            }

            // Variables
            Op::Load(place) => {
                let v = self.load(frame, place)?;
                frame.push(v);
            }
            Op::Store(place) => {
                let v = frame.pop()?;
                self.store(frame, place, v)?;
            }
            Op::LoadArgument => {
                let i = frame.pop()?;
                let i = array_index(&i)?;
                let v = frame
                    .args
                    .get(i)
                    .cloned()
                    .ok_or_else(|| index_out_of_bounds(i as f64, frame.args.len()))?;
                frame.push(v);
            }
            Op::ArgumentCount => frame.push(RtValue::Real(frame.args.len() as f64)),
            Op::StaticInitialized(id) => {
                let set = self.statics.contains_key(&(frame.function, *id));
                frame.push(set.into());
            }

            // Arrays
            Op::MakeArray(n) => {
                let items = frame.pop_n(*n as usize)?;
                frame.push(RtValue::array(items));
            }
            Op::Index => {
                let i = frame.pop()?;
                let container = frame.pop()?;
                frame.push(element(&container, &i)?);
            }

            // Control flow
            Op::Jump(t) => frame.ip = *t,
            Op::JumpIfFalse(t) => {
                if !frame.pop()?.truthy()? {
                    frame.ip = *t;
                }
            }
            Op::JumpIfTrue(t) => {
                if frame.pop()?.truthy()? {
                    frame.ip = *t;
                }
            }

            // Calls
            Op::Call { function, argc } => {
                let args = frame.pop_n(*argc as usize)?;
                let callee = self.frame(program, *function, args, frame.self_id, frame.other_id)?;
                return Ok(Flow::Call(callee));
            }
            Op::CallBuiltin { id, argc } => {
                let args = frame.pop_n(*argc as usize)?;
                let v = self.builtin(program, *id, args)?;
                frame.push(v);
            }
            Op::CallValue { argc } => {
                let callee = frame.pop()?;
                let args = frame.pop_n(*argc as usize)?;
                let RtValue::Function(index) = callee else {
                    return Err(type_error(format!("cannot call {}", callee.type_name())));
                };
                let callee = self.frame(program, index, args, frame.self_id, frame.other_id)?;
                return Ok(Flow::Call(callee));
            }
            Op::PushFunction(index) => frame.push(RtValue::Function(*index)),

            // with
            Op::WithEnter => {
                let target = frame.pop()?;
                let ids = self.with_targets(frame, &target)?;
                trace!("with over {} instance(s)", ids.len());
                frame.push(RtValue::With(Rc::new(RefCell::new(WithIter {
                    ids,
                    next: 0,
                    saved_self: frame.self_id,
                    saved_other: frame.other_id,
                }))));
            }
            Op::WithNext(t) => {
                let iter = match frame.peek()? {
                    RtValue::With(iter) => Rc::clone(iter),
                    other => {
                        return Err(type_error(format!(
                            "expected with iterator, got {}",
                            other.type_name()
                        )));
                    }
                };
                let mut iter = iter.borrow_mut();
                match iter.advance() {
                    Some(id) => {
                        frame.self_id = id;
                        frame.other_id = iter.saved_self;
                    }
                    None => frame.ip = *t,
                }
            }
            Op::WithExit => {
                let RtValue::With(iter) = frame.pop()? else {
                    return Err(type_error("expected with iterator"));
                };
                let iter = iter.borrow();
                frame.self_id = iter.saved_self;
                frame.other_id = iter.saved_other;
            }

            Op::SetReturn => frame.ret = frame.pop()?,
            Op::Ret => return Ok(Flow::Return),
        }

        Ok(Flow::Next)
    }

    // Variables

    fn field(&self, instance: u32, field: u32) -> RtValue {
        self.instances
            .get(&instance)
            .and_then(|i| i.vars.get(&field))
            .cloned()
            .unwrap_or_default()
    }

    fn field_slot(&mut self, instance: u32, field: u32) -> Result<&mut RtValue, RuntimeError> {
        let instance = self
            .instances
            .get_mut(&instance)
            .ok_or(ErrorKind::NoInstance(instance as f64))?;
        Ok(instance.vars.entry(field).or_default())
    }

    fn read(&self, frame: &Frame, var: Var) -> RtValue {
        match var {
            Var::Local(slot) => frame.locals.get(slot as usize).cloned().unwrap_or_default(),
            Var::Argument(i) => frame.args.get(i as usize).cloned().unwrap_or_default(),
            Var::Static(id) => self
                .statics
                .get(&(frame.function, id))
                .cloned()
                .unwrap_or_default(),
            Var::Instance(id) => self.field(frame.self_id, id),
            Var::Other(id) => self.field(frame.other_id, id),
            Var::Global(id) => self.globals.get(&id).cloned().unwrap_or_default(),
        }
    }

    fn slot<'a>(&'a mut self, frame: &'a mut Frame, var: Var) -> Result<&'a mut RtValue, RuntimeError> {
        match var {
            Var::Local(slot) => frame
                .locals
                .get_mut(slot as usize)
                .ok_or_else(|| RuntimeError::new(&format!("local slot {} out of range", slot))),
            Var::Argument(i) => {
                let i = i as usize;
                if frame.args.len() <= i {
                    frame.args.resize(i + 1, RtValue::Undefined);
                }
                Ok(&mut frame.args[i])
            }
            Var::Static(id) => Ok(self.statics.entry((frame.function, id)).or_default()),
            Var::Instance(id) => self.field_slot(frame.self_id, id),
            Var::Other(id) => self.field_slot(frame.other_id, id),
            Var::Global(id) => Ok(self.globals.entry(id).or_default()),
        }
    }

    /// Resolve the instance operand of a field access.
    fn instance_of(&self, frame: &Frame, target: &RtValue) -> Result<u32, RuntimeError> {
        let r = target.as_real()?;
        let id = if r == SELF {
            Some(frame.self_id)
        } else if r == OTHER {
            Some(frame.other_id)
        } else if r >= FIRST_INSTANCE_ID as f64 {
            Some(r as u32).filter(|id| self.instances.contains_key(id))
        } else if r >= 0.0 {
            self.instances_of(r as u32).next()
        } else {
            None
        };
        id.ok_or_else(|| ErrorKind::NoInstance(r).into())
    }

    fn instances_of(&self, object: u32) -> impl Iterator<Item = u32> + '_ {
        self.instances
            .iter()
            .filter(move |(_, i)| i.object == Some(object))
            .map(|(id, _)| *id)
    }

    /// Instances a `with` visits, in creation order.
    ///
    /// `all` covers created instances only, not the root.
    fn with_targets(&self, frame: &Frame, target: &RtValue) -> Result<Vec<u32>, RuntimeError> {
        let r = target.as_real()?;
        Ok(if r == SELF {
            vec![frame.self_id]
        } else if r == OTHER {
            vec![frame.other_id]
        } else if r == ALL {
            self.instances
                .iter()
                .filter(|(_, i)| i.object.is_some())
                .map(|(id, _)| *id)
                .collect()
        } else if r >= FIRST_INSTANCE_ID as f64 {
            let id = r as u32;
            if self.instances.contains_key(&id) {
                vec![id]
            } else {
                Vec::new()
            }
        } else if r >= 0.0 {
            self.instances_of(r as u32).collect()
        } else {
            // noone
            Vec::new()
        })
    }

    fn load(&self, frame: &mut Frame, place: &Place) -> Result<RtValue, RuntimeError> {
        match *place {
            Place::Var(var) => Ok(self.read(frame, var)),
            Place::Indexed { var, dims } => {
                let indices = frame.pop_n(dims as usize)?;
                element_at(self.read(frame, var), &indices)
            }
            Place::Field(field) => {
                let target = frame.pop()?;
                let id = self.instance_of(frame, &target)?;
                Ok(self.field(id, field))
            }
            Place::FieldIndexed { field, dims } => {
                let indices = frame.pop_n(dims as usize)?;
                let target = frame.pop()?;
                let id = self.instance_of(frame, &target)?;
                element_at(self.field(id, field), &indices)
            }
        }
    }

    fn store(&mut self, frame: &mut Frame, place: &Place, value: RtValue) -> Result<(), RuntimeError> {
        match *place {
            Place::Var(var) => *self.slot(frame, var)? = value,
            Place::Indexed { var, dims } => {
                let indices = frame.pop_n(dims as usize)?;
                store_element(self.slot(frame, var)?, &indices, value)?;
            }
            Place::Field(field) => {
                let target = frame.pop()?;
                let id = self.instance_of(frame, &target)?;
                *self.field_slot(id, field)? = value;
            }
            Place::FieldIndexed { field, dims } => {
                let indices = frame.pop_n(dims as usize)?;
                let target = frame.pop()?;
                let id = self.instance_of(frame, &target)?;
                store_element(self.field_slot(id, field)?, &indices, value)?;
            }
        }
        Ok(())
    }

    // Builtins

    fn builtin(
        &mut self,
        program: &ProgramBc,
        id: u32,
        args: Vec<RtValue>,
    ) -> Result<RtValue, RuntimeError> {
        let name = self
            .library
            .function_name(id)
            .ok_or_else(|| RuntimeError::from(ErrorKind::UnknownFunction(format!("builtin #{}", id))))?
            .to_string();
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();

        match name.as_str() {
            "show_debug_message" => {
                let line = arg(0).to_string();
                debug!("show_debug_message: {}", line);
                self.output.push(line);
                Ok(RtValue::Undefined)
            }
            "string" => Ok(RtValue::String(arg(0).to_string())),
            "real" => match arg(0) {
                RtValue::Real(r) => Ok(RtValue::Real(r)),
                RtValue::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(RtValue::Real)
                    .map_err(|_| type_error(format!("cannot convert \"{}\" to a real", s))),
                other => Err(type_error(format!("cannot convert {} to a real", other.type_name()))),
            },
            "abs" => Ok(RtValue::Real(arg(0).as_real()?.abs())),
            "floor" => Ok(RtValue::Real(arg(0).as_real()?.floor())),
            "min" | "max" => {
                let mut best: Option<f64> = None;
                for v in &args {
                    let r = v.as_real()?;
                    best = Some(match best {
                        None => r,
                        Some(b) if name == "min" => b.min(r),
                        Some(b) => b.max(r),
                    });
                }
                Ok(best.map(RtValue::Real).unwrap_or_default())
            }
            "array_length" => match arg(0) {
                RtValue::Array(items) => Ok(RtValue::Real(items.borrow().len() as f64)),
                other => Err(type_error(format!("expected array, got {}", other.type_name()))),
            },
            "instance_create" => {
                let x = arg(0).as_real()?;
                let y = arg(1).as_real()?;
                let object = arg(2).as_real()?;
                if !(0.0..FIRST_INSTANCE_ID as f64).contains(&object) {
                    return Err(type_error(format!("{} is not an object index", object)));
                }
                let id = self.spawn(Some(object as u32));
                for (field, value) in [("x", x), ("y", y)] {
                    if let Some(field) = program.instance_names.iter().position(|n| n == field) {
                        *self.field_slot(id, field as u32)? = RtValue::Real(value);
                    }
                }
                Ok(RtValue::Real(id as f64))
            }
            "is_undefined" => Ok(matches!(arg(0), RtValue::Undefined).into()),
            _ => Err(ErrorKind::UnknownFunction(name).into()),
        }
    }
}

fn with_trace(mut e: RuntimeError, program: &ProgramBc, frames: &[Frame]) -> RuntimeError {
    e.call_stack = frames
        .iter()
        .map(|frame| match program.functions.get(frame.function as usize) {
            Some(code) => match code.span_at(frame.ip.saturating_sub(1)) {
                Some(span) if span.line != 0 => format!("{} (line {})", code.name, span.line),
                _ => code.name.clone(),
            },
            None => format!("#{}", frame.function),
        })
        .collect();
    e
}

fn binary(op: BinaryOp, a: RtValue, b: RtValue) -> Result<RtValue, RuntimeError> {
    let (Some(x), Some(y)) = (a.scalar(), b.scalar()) else {
        return match op {
            BinaryOp::Eq => Ok((a == b).into()),
            BinaryOp::Ne => Ok((a != b).into()),
            _ => Err(type_error(format!(
                "cannot apply {:?} to {} and {}",
                op,
                a.type_name(),
                b.type_name()
            ))),
        };
    };

    if let Some(v) = apply_binary(op, &x, &y) {
        return Ok(v.into());
    }
    if matches!(op, BinaryOp::Div | BinaryOp::IntDiv | BinaryOp::Mod) && y == Value::Real(0.0) {
        return Err(division_by_zero());
    }
    Err(type_error(format!(
        "cannot apply {:?} to {} and {}",
        op,
        x.type_name(),
        y.type_name()
    )))
}

fn unary(op: UnaryOp, a: RtValue) -> Result<RtValue, RuntimeError> {
    a.scalar()
        .and_then(|v| apply_unary(op, &v))
        .map(RtValue::from)
        .ok_or_else(|| type_error(format!("cannot apply {:?} to {}", op, a.type_name())))
}

fn array_index(i: &RtValue) -> Result<usize, RuntimeError> {
    let r = i.as_real()?;
    if r < 0.0 || !r.is_finite() {
        return Err(index_out_of_bounds(r, 0));
    }
    Ok(r as usize)
}

fn element(container: &RtValue, i: &RtValue) -> Result<RtValue, RuntimeError> {
    let RtValue::Array(items) = container else {
        return Err(type_error(format!("cannot index {}", container.type_name())));
    };
    let items = items.borrow();
    let r = i.as_real()?;
    array_index(i)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .ok_or_else(|| index_out_of_bounds(r, items.len()))
}

fn element_at(base: RtValue, indices: &[RtValue]) -> Result<RtValue, RuntimeError> {
    indices.iter().try_fold(base, |current, i| element(&current, i))
}

/// Store through `indices`, creating and growing arrays on the way.
fn store_element(slot: &mut RtValue, indices: &[RtValue], value: RtValue) -> Result<(), RuntimeError> {
    let Some((first, rest)) = indices.split_first() else {
        *slot = value;
        return Ok(());
    };
    let i = array_index(first)?;

    let existing = match &*slot {
        RtValue::Array(items) => Some(Rc::clone(items)),
        _ => None,
    };
    let items = match existing {
        Some(items) => items,
        None => {
            let items = Rc::new(RefCell::new(Vec::new()));
            *slot = RtValue::Array(Rc::clone(&items));
            items
        }
    };

    let mut items = items
        .try_borrow_mut()
        .map_err(|_| RuntimeError::new("array contains itself"))?;
    if items.len() <= i {
        items.resize(i + 1, RtValue::Undefined);
    }
    store_element(&mut items[i], rest, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::CodeObject;

    fn program_from_functions(functions: Vec<(&str, Vec<Op>)>) -> ProgramBc {
        ProgramBc {
            functions: functions
                .into_iter()
                .map(|(name, ops)| {
                    let mut code = CodeObject::empty(name);
                    code.ops = ops;
                    code.local_count = 4;
                    code
                })
                .collect(),
            instance_names: vec!["x".to_string(), "y".to_string()],
            global_names: vec!["g".to_string()],
        }
    }

    /// Run `ops` as `main` and return the value stored in global 0.
    fn run_ops(ops: Vec<Op>) -> Result<RtValue, RuntimeError> {
        let program = program_from_functions(vec![("main", ops)]);
        let mut vm = VmBc::new();
        vm.run(&program, "main", vec![])?;
        Ok(vm.global(&program, "g"))
    }

    fn push(r: f64) -> Op {
        Op::Push(Value::Real(r))
    }

    fn store_g() -> Op {
        Op::Store(Place::Var(Var::Global(0)))
    }

    #[test]
    fn test_arithmetic() {
        let v = run_ops(vec![push(2.0), push(3.0), push(4.0), Op::Mul, Op::Add, store_g(), Op::Ret]);
        assert_eq!(v, Ok(RtValue::Real(14.0)));
    }

    #[test]
    fn test_string_concat() {
        let v = run_ops(vec![
            Op::Push(Value::string("ab")),
            Op::Push(Value::string("cd")),
            Op::Add,
            store_g(),
            Op::Ret,
        ]);
        assert_eq!(v, Ok(RtValue::String("abcd".to_string())));
    }

    #[test]
    fn test_division_by_zero() {
        let err = run_ops(vec![push(1.0), push(0.0), Op::Div, store_g(), Op::Ret]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DivisionByZero);
        assert_eq!(err.call_stack, vec!["main".to_string()]);
    }

    #[test]
    fn test_type_error() {
        let err = run_ops(vec![
            Op::Push(Value::string("a")),
            push(1.0),
            Op::Sub,
            store_g(),
            Op::Ret,
        ])
        .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Type(_)));
    }

    #[test]
    fn test_string_has_no_truth_value() {
        let err = run_ops(vec![Op::Push(Value::string("yes")), Op::JumpIfFalse(2), Op::Ret]).unwrap_err();
        assert!(err.to_string().contains("no truth value"));
    }

    #[test]
    fn test_tuck_and_dup_n() {
        // ( 1 2 -- 1 2 1 2 ), then tuck 9 under the top pair
        let v = run_ops(vec![
            push(1.0),
            push(2.0),
            Op::DupN(2),
            push(9.0),
            Op::Tuck(2),
            Op::MakeArray(6),
            store_g(),
            Op::Ret,
        ]);
        assert_eq!(v.unwrap().to_string(), "[1, 2, 9, 1, 2, 9]");
    }

    #[test]
    fn test_indexed_store_grows_arrays() {
        let a = Place::Indexed {
            var: Var::Global(0),
            dims: 2,
        };
        let v = run_ops(vec![push(2.0), push(1.0), push(7.0), Op::Store(a), Op::Ret]);
        assert_eq!(v.unwrap().to_string(), "[undefined, undefined, [undefined, 7]]");
    }

    #[test]
    fn test_index_out_of_bounds() {
        let err = run_ops(vec![
            push(1.0),
            Op::MakeArray(1),
            push(3.0),
            Op::Index,
            store_g(),
            Op::Ret,
        ])
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::IndexOutOfBounds { index: 3.0, len: 1 });
    }

    #[test]
    fn test_array_equality_is_identity() {
        let v = run_ops(vec![
            Op::MakeArray(0),
            Op::Dup,
            Op::Eq,
            Op::MakeArray(0),
            Op::MakeArray(0),
            Op::Eq,
            Op::MakeArray(2),
            store_g(),
            Op::Ret,
        ]);
        assert_eq!(v.unwrap().to_string(), "[1, 0]");
    }

    #[test]
    fn test_step_limit() {
        let program = program_from_functions(vec![("main", vec![Op::Jump(0)])]);
        let mut vm = VmBc::with_config(VmBcConfig {
            max_steps: Some(100),
            ..VmBcConfig::default()
        });
        let err = vm.run(&program, "main", vec![]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StepLimit(100));
    }

    #[test]
    fn test_call_depth_limit() {
        let program = program_from_functions(vec![(
            "forever",
            vec![Op::Call { function: 0, argc: 0 }, Op::Pop, Op::Ret],
        )]);
        let mut vm = VmBc::with_config(VmBcConfig {
            max_call_depth: 50,
            ..VmBcConfig::default()
        });
        let err = vm.run(&program, "forever", vec![]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CallDepth(50));
        assert_eq!(err.call_stack.len(), 50);
    }

    #[test]
    fn test_invalid_bytecode_is_rejected() {
        let program = program_from_functions(vec![("main", vec![Op::Add, Op::Ret])]);
        let err = VmBc::new().run(&program, "main", vec![]).unwrap_err();
        assert!(err.to_string().contains("stack underflow"));
    }

    #[test]
    fn test_unknown_function() {
        let program = program_from_functions(vec![("main", vec![Op::Ret])]);
        let err = VmBc::new().run(&program, "nope", vec![]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownFunction("nope".to_string()));
    }

    #[test]
    fn test_arguments() {
        let program = program_from_functions(vec![(
            "main",
            vec![
                Op::ArgumentCount,
                push(1.0),
                Op::LoadArgument,
                Op::Load(Place::Var(Var::Argument(0))),
                Op::MakeArray(3),
                Op::SetReturn,
                Op::Ret,
            ],
        )]);
        let v = VmBc::new()
            .run(&program, "main", vec![RtValue::Real(5.0), RtValue::Real(6.0)])
            .unwrap();
        assert_eq!(v.to_string(), "[2, 6, 5]");
    }

    #[test]
    fn test_with_over_object() {
        // instance_create(1, 2, 0); instance_create(3, 4, 0); with (0) g += x + y
        let create = |x: f64, y: f64| {
            vec![push(x), push(y), push(0.0), Op::CallBuiltin { id: 8, argc: 3 }, Op::Pop]
        };
        let mut ops = vec![push(0.0), store_g()];
        ops.extend(create(1.0, 2.0));
        ops.extend(create(3.0, 4.0));
        ops.extend([
            push(0.0),
            Op::WithEnter,
            Op::WithNext(22),
            Op::Load(Place::Var(Var::Global(0))),
            Op::Load(Place::Var(Var::Instance(0))),
            Op::Load(Place::Var(Var::Instance(1))),
            Op::Add,
            Op::Add,
            store_g(),
            Op::Jump(14),
            Op::WithExit,
            Op::Ret,
        ]);
        assert_eq!(ops[22], Op::WithExit);
        assert_eq!(run_ops(ops), Ok(RtValue::Real(10.0)));
    }

    #[test]
    fn test_with_sets_other_and_restores_self() {
        let program = program_from_functions(vec![(
            "main",
            vec![
                push(0.0),
                push(0.0),
                push(0.0),
                Op::CallBuiltin { id: 8, argc: 3 },
                Op::WithEnter,
                Op::WithNext(9),
                // other.x = 5
                push(5.0),
                Op::Store(Place::Var(Var::Other(0))),
                Op::Jump(5),
                Op::WithExit,
                Op::Ret,
            ],
        )]);
        let mut vm = VmBc::new();
        vm.run(&program, "main", vec![]).unwrap();
        assert_eq!(vm.instance_var(&program, vm.root(), "x"), RtValue::Real(5.0));
    }

    #[test]
    fn test_field_on_missing_instance() {
        let err = run_ops(vec![push(123456.0), Op::Load(Place::Field(0)), Op::Pop, Op::Ret]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoInstance(123456.0));
    }

    #[test]
    fn test_call_value_needs_function() {
        let err = run_ops(vec![push(1.0), Op::CallValue { argc: 0 }, Op::Pop, Op::Ret]).unwrap_err();
        assert!(err.to_string().contains("cannot call real"));
    }
}
