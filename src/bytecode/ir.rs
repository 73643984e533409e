use crate::bytecode::Op;
use crate::bytecode::accumulator::Arity;
use crate::lang::ast::Span;
use serde::{Deserialize, Serialize};

/// A compiled bytecode program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramBc {
    /// Every function, indexed by its bytecode-table index.
    pub functions: Vec<CodeObject>,

    /// Instance variable names, indexed by id.
    pub instance_names: Vec<String>,

    /// Global variable names, indexed by id.
    pub global_names: Vec<String>,
}

impl ProgramBc {
    pub fn function(&self, name: &str) -> Option<(u32, &CodeObject)> {
        self.functions
            .iter()
            .enumerate()
            .find(|(_, code)| code.name == name)
            .map(|(i, code)| (i as u32, code))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// A single compiled function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    pub name: String,
    pub ops: Vec<Op>,
    /// `(first address, span)` for each run of instructions from the same
    /// source position.
    pub locations: Vec<(usize, Span)>,
    pub arity: Arity,
    pub local_count: u32,
    pub static_count: u32,
}

impl CodeObject {
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ops: vec![Op::Ret],
            locations: Vec::new(),
            arity: Arity::default(),
            local_count: 0,
            static_count: 0,
        }
    }

    /// Source position of the instruction at `address`.
    pub fn span_at(&self, address: usize) -> Option<Span> {
        let i = self
            .locations
            .partition_point(|(start, _)| *start <= address);
        i.checked_sub(1).map(|i| self.locations[i].1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::Value;

    #[test]
    fn test_span_lookup() {
        let mut code = CodeObject::empty("f");
        code.ops = vec![Op::Pop, Op::Pop, Op::Pop, Op::Ret];
        code.locations = vec![(0, Span::new(1, 1)), (2, Span::new(3, 5))];

        assert_eq!(code.span_at(0), Some(Span::new(1, 1)));
        assert_eq!(code.span_at(1), Some(Span::new(1, 1)));
        assert_eq!(code.span_at(3), Some(Span::new(3, 5)));
        assert_eq!(CodeObject::empty("g").span_at(0), None);
    }

    #[test]
    fn test_postcard_roundtrip() {
        let mut main = CodeObject::empty("main");
        main.ops = vec![
            Op::Push(Value::string("hi")),
            Op::Push(Value::Real(2.5)),
            Op::JumpIfFalse(3),
            Op::Ret,
        ];
        let program = ProgramBc {
            functions: vec![main],
            instance_names: vec!["hp".to_string()],
            global_names: vec![],
        };

        let bytes = program.to_bytes().unwrap();
        let back = ProgramBc::from_bytes(&bytes).unwrap();
        assert_eq!(back, program);
        assert_eq!(back.function("main").map(|(i, _)| i), Some(0));
    }
}
