//! Tail optimizer.
//!
//! Runs after every emission and rewrites short instruction windows ending
//! at the last instruction. Earlier windows in the tail were examined when
//! they were the end of the stream, so only the newest ones can match.
//! Rewrites never reach below the emitter's horizon.

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::emitter::{Address, Emitter};
use crate::bytecode::op::Op;
use crate::lang::ast::UnaryOp;
use crate::lang::value::{Value, apply_binary, apply_unary};
use log::trace;

/// Apply rules until none matches.
///
/// Returns the lowest address that was rewritten, so debug records from it
/// onwards can be retracted and re-reported.
pub fn optimize_tail(em: &mut Emitter) -> Result<Option<usize>, CompileError> {
    let mut lowest: Option<usize> = None;

    while let Some((start, len, replacement)) = match_tail(em.ops(), em.horizon()) {
        trace!(
            "{}: peephole {:?} -> {:?}",
            em.function(),
            &em.ops()[start..start + len],
            replacement
        );
        em.rewrite(start, len, replacement)?;
        lowest = Some(lowest.map_or(start, |l| l.min(start)));
    }

    Ok(lowest)
}

type Rewrite = (usize, usize, Vec<Op<Address>>);

fn match_tail(ops: &[Op<Address>], horizon: usize) -> Option<Rewrite> {
    let end = ops.len();
    let tail = &ops[horizon.min(end)..];

    // Three-instruction windows first, so `Push a; Push b; op` folds before
    // anything else looks at its last two instructions.
    if let Some([Op::Push(a), Op::Push(b), op]) = last::<3>(tail) {
        if let Some(value) = op.binary().and_then(|bin| apply_binary(bin, a, b)) {
            return Some((end - 3, 3, vec![Op::Push(value)]));
        }
    }

    rule_pair(last::<2>(tail)?).map(|replacement| (end - 2, 2, replacement))
}

fn last<const N: usize>(tail: &[Op<Address>]) -> Option<&[Op<Address>; N]> {
    tail.len()
        .checked_sub(N)
        .and_then(|from| tail[from..].try_into().ok())
}

fn rule_pair(window: &[Op<Address>; 2]) -> Option<Vec<Op<Address>>> {
    Some(match window {
        // value that is immediately discarded
        [Op::Push(_) | Op::Dup, Op::Pop] => vec![],

        [Op::Swap, Op::Swap] => vec![],

        // constant condition
        [Op::Push(c), Op::JumpIfFalse(Address::Resolved(t))] => {
            if c.truthy()? {
                vec![]
            } else {
                vec![Op::Jump(Address::Resolved(*t))]
            }
        }
        [Op::Push(c), Op::JumpIfTrue(Address::Resolved(t))] => {
            if c.truthy()? {
                vec![Op::Jump(Address::Resolved(*t))]
            } else {
                vec![]
            }
        }

        [Op::Push(a), unary] => vec![Op::Push(fold_unary(unary, a)?)],

        // negated condition
        [Op::Not, Op::JumpIfFalse(t)] => vec![Op::JumpIfTrue(*t)],
        [Op::Not, Op::JumpIfTrue(t)] => vec![Op::JumpIfFalse(*t)],

        _ => return None,
    })
}

fn fold_unary(op: &Op<Address>, a: &Value) -> Option<Value> {
    match op {
        Op::Neg => apply_unary(UnaryOp::Neg, a),
        Op::Not => apply_unary(UnaryOp::Not, a),
        Op::BitNot => apply_unary(UnaryOp::BitNot, a),
        Op::ToBool => a.truthy().map(Value::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real(r: f64) -> Op<Address> {
        Op::Push(Value::Real(r))
    }

    /// Emit every op, optimizing after each one like the generator does.
    fn run(ops: Vec<Op<Address>>) -> Vec<Op<Address>> {
        let mut em = Emitter::new("test", 1000);
        for op in ops {
            em.emit(op).unwrap();
            optimize_tail(&mut em).unwrap();
        }
        em.ops().to_vec()
    }

    #[test]
    fn test_push_pop_removed() {
        assert_eq!(run(vec![real(1.0), Op::Pop]), vec![]);
        assert_eq!(run(vec![Op::ArgumentCount, Op::Dup, Op::Pop]), vec![Op::ArgumentCount]);
    }

    #[test]
    fn test_swap_swap_removed() {
        assert_eq!(run(vec![Op::ArgumentCount, Op::Swap, Op::Swap]), vec![Op::ArgumentCount]);
    }

    #[test]
    fn test_constant_folding_chains() {
        // (1 + 2) * 4
        let ops = run(vec![real(1.0), real(2.0), Op::Add, real(4.0), Op::Mul]);
        assert_eq!(ops, vec![real(12.0)]);
    }

    #[test]
    fn test_no_fold_on_division_by_zero() {
        let ops = run(vec![real(1.0), real(0.0), Op::Div]);
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_no_fold_on_mixed_types() {
        let ops = run(vec![Op::Push(Value::string("a")), real(1.0), Op::Add]);
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn test_unary_folding() {
        assert_eq!(run(vec![real(3.0), Op::Neg]), vec![real(-3.0)]);
        assert_eq!(run(vec![real(0.9), Op::ToBool]), vec![real(1.0)]);
        assert_eq!(run(vec![real(1.0), Op::Not]), vec![real(0.0)]);
        assert_eq!(run(vec![Op::Push(Value::string("s")), Op::Not]).len(), 2);
    }

    #[test]
    fn test_constant_branch() {
        let t = Address::Resolved(0);
        assert_eq!(run(vec![real(1.0), Op::JumpIfFalse(t)]), vec![]);
        assert_eq!(run(vec![real(0.0), Op::JumpIfFalse(t)]), vec![Op::Jump(t)]);
        assert_eq!(run(vec![real(1.0), Op::JumpIfTrue(t)]), vec![Op::Jump(t)]);
        assert_eq!(run(vec![real(0.0), Op::JumpIfTrue(t)]), vec![]);
    }

    #[test]
    fn test_placeholder_branch_not_folded() {
        let mut em = Emitter::new("test", 100);
        em.emit(real(1.0)).unwrap();
        em.reserve_placeholder(Op::JumpIfFalse).unwrap();
        assert_eq!(optimize_tail(&mut em).unwrap(), None);
        assert_eq!(em.ops().len(), 2);
    }

    #[test]
    fn test_not_jump_inverted() {
        let t = Address::Resolved(0);
        let ops = run(vec![Op::ArgumentCount, Op::Not, Op::JumpIfFalse(t)]);
        assert_eq!(ops, vec![Op::ArgumentCount, Op::JumpIfTrue(t)]);
    }

    #[test]
    fn test_horizon_blocks_rewrite() {
        let mut em = Emitter::new("test", 100);
        em.emit(real(1.0)).unwrap();
        em.label();
        em.emit(Op::Pop).unwrap();
        assert_eq!(optimize_tail(&mut em).unwrap(), None);
        assert_eq!(em.ops().len(), 2);
    }

    #[test]
    fn test_reports_lowest_rewritten_address() {
        let mut em = Emitter::new("test", 100);
        em.emit(Op::ArgumentCount).unwrap();
        em.emit(real(2.0)).unwrap();
        em.emit(real(3.0)).unwrap();
        em.emit(Op::Mul).unwrap();
        assert_eq!(optimize_tail(&mut em).unwrap(), Some(1));
        assert_eq!(em.ops(), &[Op::ArgumentCount, real(6.0)]);
    }
}
