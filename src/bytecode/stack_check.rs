use crate::bytecode::{CodeObject, Op, ProgramBc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stack-check error in '{function}' at {address:04}: {message}")]
pub struct StackCheckError {
    pub function: String,
    pub address: usize,
    pub message: String,
}

impl StackCheckError {
    fn new(code: &CodeObject, address: usize, message: impl Into<String>) -> Self {
        Self {
            function: code.name.clone(),
            address,
            message: message.into(),
        }
    }
}

/// Returns (pops, pushes) for an op.
///
/// "Pops" is the depth the op needs; ops that inspect a value without
/// consuming it (`WithNext`) list it on both sides.
fn effect(op: &Op) -> (usize, usize) {
    use Op::*;
    match op {
        Push(_) | PushFunction(_) => (0, 1),
        Pop => (1, 0),
        Dup => (1, 2),
        DupN(n) => (*n as usize, 2 * *n as usize),
        Tuck(n) => (*n as usize + 1, *n as usize + 2),
        Swap => (2, 2),

        Add | Sub | Mul | Div | IntDiv | Mod | BitAnd | BitOr | BitXor | Shl | Shr | Xor => (2, 1),
        Eq | Ne | Lt | Gt | Le | Ge => (2, 1),
        Neg | Not | BitNot | ToBool => (1, 1),

        Load(place) => (place.operands(), 1),
        Store(place) => (place.operands() + 1, 0),
        LoadArgument => (1, 1),
        ArgumentCount => (0, 1),
        StaticInitialized(_) => (0, 1),

        MakeArray(n) => (*n as usize, 1),
        Index => (2, 1),

        // =================================================================
        // Control flow
        // =================================================================
        Jump(_) => (0, 0),
        JumpIfFalse(_) | JumpIfTrue(_) => (1, 0),

        Call { argc, .. } | CallBuiltin { argc, .. } => (*argc as usize, 1),
        CallValue { argc } => (*argc as usize + 1, 1),

        WithEnter => (1, 1),
        WithNext(_) => (1, 1),
        WithExit => (1, 0),

        SetReturn => (1, 0),
        Ret => (0, 0),
    }
}

/// Addresses control can reach after `ip`.
fn successors(op: &Op, ip: usize) -> Vec<usize> {
    match op {
        Op::Jump(t) => vec![*t],
        Op::JumpIfFalse(t) | Op::JumpIfTrue(t) | Op::WithNext(t) => vec![ip + 1, *t],
        Op::Ret => vec![],
        _ => vec![ip + 1],
    }
}

/// Verify one function's stack discipline.
///
/// Follows every jump from the entry point, tracking the depth at each
/// reachable instruction:
/// - no instruction pops more than the depth;
/// - every path into an instruction arrives with the same depth;
/// - `Ret` is reached with an empty stack;
/// - no path runs off the end or jumps outside the function.
///
/// Unreachable instructions are not checked.
pub fn check_code(code: &CodeObject) -> Result<(), StackCheckError> {
    let ops = &code.ops;
    let mut depth_at: Vec<Option<usize>> = vec![None; ops.len()];
    let mut worklist = vec![(0usize, 0usize)];

    if ops.is_empty() {
        return Err(StackCheckError::new(code, 0, "empty function"));
    }

    while let Some((ip, depth)) = worklist.pop() {
        match depth_at[ip] {
            Some(seen) if seen == depth => continue,
            Some(seen) => {
                return Err(StackCheckError::new(
                    code,
                    ip,
                    format!("inconsistent stack depth: {} vs {}", seen, depth),
                ));
            }
            None => depth_at[ip] = Some(depth),
        }

        let op = &ops[ip];
        let (pops, pushes) = effect(op);
        if depth < pops {
            return Err(StackCheckError::new(
                code,
                ip,
                format!("stack underflow, op={:?} needs {} items, depth {}", op, pops, depth),
            ));
        }
        let after = depth - pops + pushes;

        if *op == Op::Ret && depth != 0 {
            return Err(StackCheckError::new(
                code,
                ip,
                format!("return with {} values left on the stack", depth),
            ));
        }

        for next in successors(op, ip) {
            if next >= ops.len() {
                let message = if op.target() == Some(&next) {
                    format!("jump target {} out of range", next)
                } else {
                    "control falls off the end".to_string()
                };
                return Err(StackCheckError::new(code, ip, message));
            }
            worklist.push((next, after));
        }
    }

    Ok(())
}

/// Check every function and every direct call index of a program.
pub fn check_program(program: &ProgramBc) -> Result<(), StackCheckError> {
    for code in &program.functions {
        check_code(code)?;
        for (ip, op) in code.ops.iter().enumerate() {
            if let Op::Call { function, .. } = op {
                if *function as usize >= program.functions.len() {
                    return Err(StackCheckError::new(
                        code,
                        ip,
                        format!("call of unknown function index {}", function),
                    ));
                }
            }
        }
    }
    Ok(())
}
