use crate::lang::ast::BinaryOp;
use crate::lang::value::Value;
use serde::{Deserialize, Serialize};

// =============================================================================
// VAR / PLACE - Storage locations
// =============================================================================

/// A variable the VM can address directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Var {
    /// `var` slot of the current frame.
    Local(u32),
    /// Positional argument (`argument3`, or the fourth named parameter).
    Argument(u32),
    /// Per-function static cell.
    Static(u32),
    /// Variable of the `self` instance.
    Instance(u32),
    Global(u32),
    /// Variable of the `other` instance.
    Other(u32),
}

/// Target of a `Load` or `Store`.
///
/// Operands are pushed before the instruction: array indices for the
/// indexed forms, and the instance id (below the indices) for the field
/// forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Place {
    Var(Var),
    Indexed { var: Var, dims: u8 },
    /// `expr.field`; the id is in the instance namespace.
    Field(u32),
    FieldIndexed { field: u32, dims: u8 },
}

impl Place {
    /// Number of stack operands the place consumes.
    pub fn operands(&self) -> usize {
        match self {
            Place::Var(_) => 0,
            Place::Indexed { dims, .. } => *dims as usize,
            Place::Field(_) => 1,
            Place::FieldIndexed { dims, .. } => 1 + *dims as usize,
        }
    }
}

// =============================================================================
// OP - Bytecode instructions
// =============================================================================

/// One instruction.
///
/// `A` is the jump-operand type: `Address` while a function is being
/// generated (targets may still be placeholders), `usize` in finished code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op<A = usize> {
    // literals
    Push(Value),

    // stack ops
    Pop,
    Dup,
    /// Duplicate the top `n` values, preserving their order.
    DupN(u8),
    /// ( a.. v -- v a.. v ) with `n` values in `a..`
    Tuck(u8),
    Swap,

    // arithmetic / bitwise
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    /// Logical xor (`^^`).
    Xor,

    // comparison
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,

    // unary
    Neg,
    Not,
    BitNot,
    /// Normalize a value to `0` or `1`.
    ToBool,

    // variables
    Load(Place),
    Store(Place),
    /// ( i -- argument[i] )
    LoadArgument,
    ArgumentCount,
    /// ( -- bool ) has static cell `id` been assigned yet
    StaticInitialized(u32),

    // arrays
    MakeArray(u32),
    /// ( container i -- value )
    Index,

    // ==========================================================================
    // Jumps (absolute addresses)
    // ==========================================================================
    Jump(A),
    /// Pop a condition, jump if it is false.
    JumpIfFalse(A),
    /// Pop a condition, jump if it is true.
    JumpIfTrue(A),

    // calls
    Call { function: u32, argc: u8 },
    CallBuiltin { id: u32, argc: u8 },
    /// ( args f -- r )
    CallValue { argc: u8 },
    PushFunction(u32),

    // `with` iteration
    WithEnter,
    /// Advance to the next instance, or jump when exhausted.
    WithNext(A),
    WithExit,

    SetReturn,
    Ret,
}

impl<A> Op<A> {
    pub fn target(&self) -> Option<&A> {
        match self {
            Op::Jump(a) | Op::JumpIfFalse(a) | Op::JumpIfTrue(a) | Op::WithNext(a) => Some(a),
            _ => None,
        }
    }

    pub fn target_mut(&mut self) -> Option<&mut A> {
        match self {
            Op::Jump(a) | Op::JumpIfFalse(a) | Op::JumpIfTrue(a) | Op::WithNext(a) => Some(a),
            _ => None,
        }
    }

    /// True when control never reaches the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Jump(_) | Op::Ret)
    }

    /// Convert the jump operand, keeping every other instruction as is.
    pub fn try_map_target<B, E>(self, f: impl FnOnce(A) -> Result<B, E>) -> Result<Op<B>, E> {
        use Op::*;
        Ok(match self {
            Jump(a) => Jump(f(a)?),
            JumpIfFalse(a) => JumpIfFalse(f(a)?),
            JumpIfTrue(a) => JumpIfTrue(f(a)?),
            WithNext(a) => WithNext(f(a)?),

            Push(v) => Push(v),
            Pop => Pop,
            Dup => Dup,
            DupN(n) => DupN(n),
            Tuck(n) => Tuck(n),
            Swap => Swap,
            Add => Add,
            Sub => Sub,
            Mul => Mul,
            Div => Div,
            IntDiv => IntDiv,
            Mod => Mod,
            BitAnd => BitAnd,
            BitOr => BitOr,
            BitXor => BitXor,
            Shl => Shl,
            Shr => Shr,
            Xor => Xor,
            Eq => Eq,
            Ne => Ne,
            Lt => Lt,
            Gt => Gt,
            Le => Le,
            Ge => Ge,
            Neg => Neg,
            Not => Not,
            BitNot => BitNot,
            ToBool => ToBool,
            Load(p) => Load(p),
            Store(p) => Store(p),
            LoadArgument => LoadArgument,
            ArgumentCount => ArgumentCount,
            StaticInitialized(id) => StaticInitialized(id),
            MakeArray(n) => MakeArray(n),
            Index => Index,
            Call { function, argc } => Call { function, argc },
            CallBuiltin { id, argc } => CallBuiltin { id, argc },
            CallValue { argc } => CallValue { argc },
            PushFunction(i) => PushFunction(i),
            WithEnter => WithEnter,
            WithExit => WithExit,
            SetReturn => SetReturn,
            Ret => Ret,
        })
    }

    /// The operator a binary instruction applies.
    pub fn binary(&self) -> Option<BinaryOp> {
        Some(match self {
            Op::Add => BinaryOp::Add,
            Op::Sub => BinaryOp::Sub,
            Op::Mul => BinaryOp::Mul,
            Op::Div => BinaryOp::Div,
            Op::IntDiv => BinaryOp::IntDiv,
            Op::Mod => BinaryOp::Mod,
            Op::BitAnd => BinaryOp::BitAnd,
            Op::BitOr => BinaryOp::BitOr,
            Op::BitXor => BinaryOp::BitXor,
            Op::Shl => BinaryOp::Shl,
            Op::Shr => BinaryOp::Shr,
            Op::Xor => BinaryOp::Xor,
            Op::Eq => BinaryOp::Eq,
            Op::Ne => BinaryOp::Ne,
            Op::Lt => BinaryOp::Lt,
            Op::Gt => BinaryOp::Gt,
            Op::Le => BinaryOp::Le,
            Op::Ge => BinaryOp::Ge,
            _ => return None,
        })
    }

    pub fn from_binary(op: BinaryOp) -> Self {
        match op {
            BinaryOp::Add => Op::Add,
            BinaryOp::Sub => Op::Sub,
            BinaryOp::Mul => Op::Mul,
            BinaryOp::Div => Op::Div,
            BinaryOp::IntDiv => Op::IntDiv,
            BinaryOp::Mod => Op::Mod,
            BinaryOp::BitAnd => Op::BitAnd,
            BinaryOp::BitOr => Op::BitOr,
            BinaryOp::BitXor => Op::BitXor,
            BinaryOp::Shl => Op::Shl,
            BinaryOp::Shr => Op::Shr,
            BinaryOp::Xor => Op::Xor,
            BinaryOp::Eq => Op::Eq,
            BinaryOp::Ne => Op::Ne,
            BinaryOp::Lt => Op::Lt,
            BinaryOp::Gt => Op::Gt,
            BinaryOp::Le => Op::Le,
            BinaryOp::Ge => Op::Ge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_operands() {
        assert_eq!(Place::Var(Var::Local(0)).operands(), 0);
        assert_eq!(
            Place::Indexed {
                var: Var::Global(1),
                dims: 2
            }
            .operands(),
            2
        );
        assert_eq!(Place::Field(3).operands(), 1);
        assert_eq!(Place::FieldIndexed { field: 3, dims: 1 }.operands(), 2);
    }

    #[test]
    fn test_map_target() {
        let op: Op<i64> = Op::JumpIfTrue(7);
        let mapped: Result<Op<usize>, ()> = op.try_map_target(|a| Ok(a as usize * 2));
        assert_eq!(mapped, Ok(Op::JumpIfTrue(14)));

        let op: Op<i64> = Op::Push(Value::Real(1.0));
        let mapped: Result<Op<usize>, ()> = op.try_map_target(|_| Err(()));
        assert_eq!(mapped, Ok(Op::Push(Value::Real(1.0))));
    }

    #[test]
    fn test_binary_roundtrip() {
        for op in [BinaryOp::Add, BinaryOp::Shr, BinaryOp::Xor, BinaryOp::Ge] {
            let instr: Op = Op::from_binary(op);
            assert_eq!(instr.binary(), Some(op));
        }
        assert_eq!(Op::<usize>::Neg.binary(), None);
    }

    #[test]
    fn test_terminators() {
        assert!(Op::<usize>::Jump(0).is_terminator());
        assert!(Op::<usize>::Ret.is_terminator());
        assert!(!Op::<usize>::JumpIfFalse(0).is_terminator());
    }
}
