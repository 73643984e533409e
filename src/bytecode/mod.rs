pub mod accumulator;
pub mod compile;
pub mod compile_error;
pub mod context;
pub mod disasm;
pub mod emitter;
mod expr;
pub mod ir;
pub mod namespace;
pub mod op;
pub mod peephole;
mod prepass;
pub mod sinks;
pub mod stack_check;

pub use ir::{CodeObject, ProgramBc};
pub use op::Op;
