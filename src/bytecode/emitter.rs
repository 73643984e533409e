//! Instruction stream of one function under construction.
//!
//! Forward jumps are emitted with a placeholder operand and patched once the
//! target is known. The emitter also keeps the peephole horizon: the lowest
//! address the optimizer may still rewrite. Anything a jump can land on, and
//! every instruction still waiting for a patch, sits below it.

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::op::Op;
use crate::lang::ast::Span;
use log::trace;

/// Jump operand while a function is being generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Address {
    Resolved(usize),
    /// Waiting for `Emitter::patch`.
    Placeholder,
    /// Never assigned. Reaching `finish` with one is a compiler bug.
    #[default]
    Invalid,
}

/// Address of an instruction whose jump operand is a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hole(usize);

impl Hole {
    pub fn address(self) -> usize {
        self.0
    }
}

pub type JumpCtor = fn(Address) -> Op<Address>;

pub struct Emitter {
    function: String,
    ops: Vec<Op<Address>>,
    spans: Vec<Span>,
    span: Span,
    horizon: usize,
    limit: usize,
}

impl Emitter {
    pub fn new(function: impl Into<String>, limit: usize) -> Self {
        Self {
            function: function.into(),
            ops: Vec::new(),
            spans: Vec::new(),
            span: Span::default(),
            horizon: 0,
            limit,
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    /// Address the next instruction will get.
    pub fn here(&self) -> usize {
        self.ops.len()
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn ops(&self) -> &[Op<Address>] {
        &self.ops
    }

    pub fn span_at(&self, address: usize) -> Option<Span> {
        self.spans.get(address).copied()
    }

    /// Source position attached to subsequent instructions.
    pub fn set_span(&mut self, span: Span) {
        self.span = span;
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn emit(&mut self, op: Op<Address>) -> Result<usize, CompileError> {
        if self.ops.len() >= self.limit {
            return Err(CompileError::capacity(
                &self.function,
                "instruction",
                self.limit,
            ));
        }
        let address = self.ops.len();
        self.ops.push(op);
        self.spans.push(self.span);
        Ok(address)
    }

    /// Emit a jump whose target is not known yet.
    pub fn reserve_placeholder(&mut self, ctor: JumpCtor) -> Result<Hole, CompileError> {
        let address = self.emit(ctor(Address::Placeholder))?;
        self.mark_boundary();
        Ok(Hole(address))
    }

    pub fn patch(&mut self, hole: Hole, target: usize) -> Result<(), CompileError> {
        let operand = self
            .ops
            .get_mut(hole.0)
            .and_then(|op| op.target_mut())
            .ok_or_else(|| {
                CompileError::internal(format!(
                    "patch of non-jump instruction at {} in '{}'",
                    hole.0, self.function
                ))
            })?;

        if *operand != Address::Placeholder {
            return Err(CompileError::internal(format!(
                "patch of resolved operand {:?} at {} in '{}'",
                operand, hole.0, self.function
            )));
        }
        *operand = Address::Resolved(target);
        trace!("{}: patched {:04} -> {:04}", self.function, hole.0, target);
        self.mark_boundary();
        Ok(())
    }

    /// Bind a jump target at the end of the stream.
    pub fn label(&mut self) -> usize {
        self.mark_boundary();
        self.here()
    }

    /// Freeze everything emitted so far. Never moves backwards.
    pub fn mark_boundary(&mut self) {
        self.horizon = self.horizon.max(self.ops.len());
    }

    /// Replace `len` instructions starting at `start`.
    ///
    /// Only the tail above the horizon can be rewritten, and nothing refers
    /// to an address inside it, so later instructions may shift freely.
    /// Replacement instructions inherit the span of the first one replaced.
    pub fn rewrite(
        &mut self,
        start: usize,
        len: usize,
        replacement: Vec<Op<Address>>,
    ) -> Result<(), CompileError> {
        if start < self.horizon {
            return Err(CompileError::internal(format!(
                "rewrite at {} below horizon {} in '{}'",
                start, self.horizon, self.function
            )));
        }
        let end = start + len;
        if end > self.ops.len() {
            return Err(CompileError::internal(format!(
                "rewrite of {}..{} past end {} in '{}'",
                start,
                end,
                self.ops.len(),
                self.function
            )));
        }

        let span = self.spans.get(start).copied().unwrap_or(self.span);
        let count = replacement.len();
        self.ops.splice(start..end, replacement);
        self.spans.splice(start..end, std::iter::repeat_n(span, count));
        Ok(())
    }

    /// Resolve every operand and hand the finished stream over, together
    /// with the address/span table (one entry per change of span).
    pub fn finish(self) -> Result<(Vec<Op>, Vec<(usize, Span)>), CompileError> {
        let function = self.function;
        let ops = self
            .ops
            .into_iter()
            .enumerate()
            .map(|(ip, op)| {
                op.try_map_target(|a| match a {
                    Address::Resolved(t) => Ok(t),
                    other => Err(CompileError::internal(format!(
                        "{:?} jump operand at {} in '{}'",
                        other, ip, function
                    ))),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut locations: Vec<(usize, Span)> = Vec::new();
        for (ip, span) in self.spans.into_iter().enumerate() {
            if locations.last().is_none_or(|(_, last)| *last != span) {
                locations.push((ip, span));
            }
        }

        Ok((ops, locations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::Value;

    #[test]
    fn test_emit_returns_addresses() {
        let mut em = Emitter::new("f", 100);
        assert_eq!(em.emit(Op::Pop).unwrap(), 0);
        assert_eq!(em.emit(Op::Dup).unwrap(), 1);
        assert_eq!(em.here(), 2);
    }

    #[test]
    fn test_capacity() {
        let mut em = Emitter::new("f", 2);
        em.emit(Op::Pop).unwrap();
        em.emit(Op::Pop).unwrap();
        let err = em.emit(Op::Pop).unwrap_err();
        assert!(matches!(err, CompileError::Capacity { limit: 2, .. }));
    }

    #[test]
    fn test_placeholder_patch() {
        let mut em = Emitter::new("f", 100);
        let hole = em.reserve_placeholder(Op::JumpIfFalse).unwrap();
        assert_eq!(em.horizon(), 1);
        em.emit(Op::Pop).unwrap();
        let exit = em.label();
        em.patch(hole, exit).unwrap();

        let (ops, _) = em.finish().unwrap();
        assert_eq!(ops[0], Op::JumpIfFalse(2));
    }

    #[test]
    fn test_double_patch_is_internal() {
        let mut em = Emitter::new("f", 100);
        let hole = em.reserve_placeholder(Op::Jump).unwrap();
        em.patch(hole, 1).unwrap();
        assert!(em.patch(hole, 1).unwrap_err().is_internal());
    }

    #[test]
    fn test_patch_of_non_jump_is_internal() {
        let mut em = Emitter::new("f", 100);
        em.emit(Op::Pop).unwrap();
        assert!(em.patch(Hole(0), 0).unwrap_err().is_internal());
    }

    #[test]
    fn test_unpatched_placeholder_fails_finish() {
        let mut em = Emitter::new("f", 100);
        em.reserve_placeholder(Op::Jump).unwrap();
        let err = em.finish().unwrap_err();
        assert!(err.is_internal());
        assert!(err.to_string().contains("Placeholder"));
    }

    #[test]
    fn test_invalid_address_fails_finish() {
        let mut em = Emitter::new("f", 100);
        em.emit(Op::Jump(Address::default())).unwrap();
        assert!(em.finish().unwrap_err().is_internal());
    }

    #[test]
    fn test_horizon_is_monotonic() {
        let mut em = Emitter::new("f", 100);
        em.emit(Op::Pop).unwrap();
        em.emit(Op::Pop).unwrap();
        em.mark_boundary();
        em.rewrite(1, 1, vec![]).unwrap_err();
        assert_eq!(em.horizon(), 2);
        em.rewrite(2, 0, vec![]).unwrap();
        em.mark_boundary();
        assert_eq!(em.horizon(), 2);
    }

    #[test]
    fn test_rewrite_below_horizon_is_internal() {
        let mut em = Emitter::new("f", 100);
        em.emit(Op::Push(Value::Real(1.0))).unwrap();
        em.label();
        em.emit(Op::Pop).unwrap();
        assert!(em.rewrite(0, 2, vec![]).unwrap_err().is_internal());
    }

    #[test]
    fn test_rewrite_keeps_first_span() {
        let mut em = Emitter::new("f", 100);
        em.set_span(Span::new(4, 1));
        em.emit(Op::Push(Value::Real(1.0))).unwrap();
        em.set_span(Span::new(4, 9));
        em.emit(Op::Push(Value::Real(2.0))).unwrap();
        em.emit(Op::Add).unwrap();
        em.rewrite(0, 3, vec![Op::Push(Value::Real(3.0))]).unwrap();

        assert_eq!(em.ops().len(), 1);
        assert_eq!(em.span_at(0), Some(Span::new(4, 1)));
    }

    #[test]
    fn test_locations_collapse_runs() {
        let mut em = Emitter::new("f", 100);
        em.set_span(Span::new(1, 1));
        em.emit(Op::Pop).unwrap();
        em.emit(Op::Pop).unwrap();
        em.set_span(Span::new(2, 1));
        em.emit(Op::Ret).unwrap();

        let (_, locations) = em.finish().unwrap();
        assert_eq!(
            locations,
            vec![(0, Span::new(1, 1)), (2, Span::new(2, 1))]
        );
    }
}
