use crate::bytecode::emitter::Hole;
use crate::bytecode::namespace::StaticMap;
use std::collections::HashMap;

/// Per-node generation settings, passed down by value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerateContext {
    /// Values a `continue` must pop before jumping: one per `switch`
    /// entered since the innermost loop.
    pub continue_pop_count: u16,
    /// Evaluate constants only; emitting code is an error.
    pub enum_expression: bool,
}

impl GenerateContext {
    /// Context for the body of a loop or `with`.
    pub fn enter_loop(self) -> Self {
        Self {
            continue_pop_count: 0,
            ..self
        }
    }

    /// Context for the cases of a `switch`.
    pub fn enter_switch(self) -> Option<Self> {
        Some(Self {
            continue_pop_count: self.continue_pop_count.checked_add(1)?,
            ..self
        })
    }

    pub fn enum_mode(self) -> Self {
        Self {
            enum_expression: true,
            ..self
        }
    }
}

/// Runtime state a scope holds, undone on early exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleanup {
    /// A value under the scope's body (`repeat` counter, `switch` value).
    PopValue,
    /// An active `with` iterator.
    ExitWith,
}

/// Mutable state of one function's generation.
#[derive(Debug, Default)]
pub struct FunctionState {
    pub name: String,
    /// One list per enclosing breakable construct, innermost last.
    pub breaks: Vec<Vec<Hole>>,
    /// One list per enclosing loop or `with`, innermost last.
    pub continues: Vec<Vec<Hole>>,
    pub cleanup: Vec<Cleanup>,
    pub statics: StaticMap,
    pub variadic: bool,
    params: Vec<String>,
    locals: HashMap<String, u32>,
    /// Function literals reached so far.
    literals: u32,
}

impl FunctionState {
    pub fn new(name: impl Into<String>, params: &[String], variadic: bool) -> Self {
        Self {
            name: name.into(),
            params: params.to_vec(),
            variadic,
            ..Self::default()
        }
    }

    pub fn param(&self, name: &str) -> Option<u32> {
        self.params
            .iter()
            .position(|p| p == name)
            .map(|i| i as u32)
    }

    pub fn local(&self, name: &str) -> Option<u32> {
        self.locals.get(name).copied()
    }

    /// Slot for a `var` name. Redeclaring reuses the slot.
    pub fn declare_local(&mut self, name: &str, limit: usize) -> Option<u32> {
        if let Some(&slot) = self.locals.get(name) {
            return Some(slot);
        }
        if self.locals.len() >= limit {
            return None;
        }
        let slot = self.locals.len() as u32;
        self.locals.insert(name.to_string(), slot);
        Some(slot)
    }

    /// Position of the next function literal in this function.
    pub fn next_literal(&mut self) -> u32 {
        let ordinal = self.literals;
        self.literals += 1;
        ordinal
    }

    pub fn local_count(&self) -> u32 {
        self.locals.len() as u32
    }

    /// Cleanup commands in the order an early exit runs them.
    pub fn unwind(&self) -> Vec<Cleanup> {
        self.cleanup.iter().rev().copied().collect()
    }
}
