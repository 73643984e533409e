//! Optional observers of a compilation.
//!
//! Sink failures are logged and otherwise ignored: a broken debug-info
//! writer must not fail a build.

use crate::bytecode::namespace::NamespaceKind;
use crate::lang::ast::Span;
use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sink error: {0}")]
pub struct SinkError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugRecord {
    pub function: String,
    pub address: usize,
    pub span: Span,
    /// Variable or function the instruction refers to, if any.
    pub symbol: Option<String>,
}

pub trait DebugSink: Send {
    fn record(&mut self, record: DebugRecord) -> Result<(), SinkError>;

    /// Forget every record of `function` at or above `from`.
    fn retract(&mut self, function: &str, from: usize) -> Result<(), SinkError>;

    /// A statement starts at `address`.
    fn anchor(&mut self, function: &str, address: usize, span: Span) -> Result<(), SinkError>;
}

pub trait ReflectionSink: Send {
    fn variable(&mut self, kind: NamespaceKind, name: &str, id: u32) -> Result<(), SinkError>;

    fn function(&mut self, name: &str, index: u32) -> Result<(), SinkError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DebugSink for NoopSink {
    fn record(&mut self, _: DebugRecord) -> Result<(), SinkError> {
        Ok(())
    }

    fn retract(&mut self, _: &str, _: usize) -> Result<(), SinkError> {
        Ok(())
    }

    fn anchor(&mut self, _: &str, _: usize, _: Span) -> Result<(), SinkError> {
        Ok(())
    }
}

impl ReflectionSink for NoopSink {
    fn variable(&mut self, _: NamespaceKind, _: &str, _: u32) -> Result<(), SinkError> {
        Ok(())
    }

    fn function(&mut self, _: &str, _: u32) -> Result<(), SinkError> {
        Ok(())
    }
}

// ───────────────────────────── Recording sinks ─────────────────────────────

#[derive(Debug, Default)]
struct DebugTables {
    records: Vec<DebugRecord>,
    anchors: Vec<(String, usize, Span)>,
}

/// Debug sink that keeps everything in memory.
///
/// Clones share the same tables, so keep one handle and give the compiler
/// another.
#[derive(Debug, Default, Clone)]
pub struct DebugSymbols {
    tables: Arc<Mutex<DebugTables>>,
}

impl DebugSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DebugRecord> {
        self.tables.lock().records.clone()
    }

    pub fn records_for(&self, function: &str) -> Vec<DebugRecord> {
        self.tables
            .lock()
            .records
            .iter()
            .filter(|r| r.function == function)
            .cloned()
            .collect()
    }

    pub fn anchors(&self) -> Vec<(String, usize, Span)> {
        self.tables.lock().anchors.clone()
    }
}

impl DebugSink for DebugSymbols {
    fn record(&mut self, record: DebugRecord) -> Result<(), SinkError> {
        self.tables.lock().records.push(record);
        Ok(())
    }

    fn retract(&mut self, function: &str, from: usize) -> Result<(), SinkError> {
        self.tables
            .lock()
            .records
            .retain(|r| r.function != function || r.address < from);
        Ok(())
    }

    fn anchor(&mut self, function: &str, address: usize, span: Span) -> Result<(), SinkError> {
        self.tables
            .lock()
            .anchors
            .push((function.to_string(), address, span));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ReflectionTables {
    variables: Vec<(NamespaceKind, String, u32)>,
    functions: Vec<(String, u32)>,
}

/// Reflection sink that keeps everything in memory. Clones share tables.
#[derive(Debug, Default, Clone)]
pub struct Reflection {
    tables: Arc<Mutex<ReflectionTables>>,
}

impl Reflection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variables(&self) -> Vec<(NamespaceKind, String, u32)> {
        self.tables.lock().variables.clone()
    }

    pub fn functions(&self) -> Vec<(String, u32)> {
        self.tables.lock().functions.clone()
    }
}

impl ReflectionSink for Reflection {
    fn variable(&mut self, kind: NamespaceKind, name: &str, id: u32) -> Result<(), SinkError> {
        self.tables
            .lock()
            .variables
            .push((kind, name.to_string(), id));
        Ok(())
    }

    fn function(&mut self, name: &str, index: u32) -> Result<(), SinkError> {
        self.tables.lock().functions.push((name.to_string(), index));
        Ok(())
    }
}

// ──────────────────────────────── Sinks ────────────────────────────────────

/// The sinks of one compiler, shared between worker threads.
pub struct Sinks {
    debug: Mutex<Box<dyn DebugSink>>,
    reflection: Mutex<Box<dyn ReflectionSink>>,
}

impl Default for Sinks {
    fn default() -> Self {
        Self {
            debug: Mutex::new(Box::new(NoopSink)),
            reflection: Mutex::new(Box::new(NoopSink)),
        }
    }
}

impl Sinks {
    pub fn set_debug(&mut self, sink: Box<dyn DebugSink>) {
        self.debug = Mutex::new(sink);
    }

    pub fn set_reflection(&mut self, sink: Box<dyn ReflectionSink>) {
        self.reflection = Mutex::new(sink);
    }

    pub fn record(&self, record: DebugRecord) {
        if let Err(e) = self.debug.lock().record(record) {
            warn!("debug sink: {}", e);
        }
    }

    pub fn retract(&self, function: &str, from: usize) {
        if let Err(e) = self.debug.lock().retract(function, from) {
            warn!("debug sink: {}", e);
        }
    }

    pub fn anchor(&self, function: &str, address: usize, span: Span) {
        if let Err(e) = self.debug.lock().anchor(function, address, span) {
            warn!("debug sink: {}", e);
        }
    }

    pub fn variable(&self, kind: NamespaceKind, name: &str, id: u32) {
        if let Err(e) = self.reflection.lock().variable(kind, name, id) {
            warn!("reflection sink: {}", e);
        }
    }

    pub fn function(&self, name: &str, index: u32) {
        if let Err(e) = self.reflection.lock().function(name, index) {
            warn!("reflection sink: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl DebugSink for Failing {
        fn record(&mut self, _: DebugRecord) -> Result<(), SinkError> {
            Err(SinkError("disk full".to_string()))
        }

        fn retract(&mut self, _: &str, _: usize) -> Result<(), SinkError> {
            Err(SinkError("disk full".to_string()))
        }

        fn anchor(&mut self, _: &str, _: usize, _: Span) -> Result<(), SinkError> {
            Err(SinkError("disk full".to_string()))
        }
    }

    fn record(function: &str, address: usize) -> DebugRecord {
        DebugRecord {
            function: function.to_string(),
            address,
            span: Span::default(),
            symbol: None,
        }
    }

    #[test]
    fn test_retract_only_touches_one_function() {
        let mut symbols = DebugSymbols::new();
        for address in 0..4 {
            symbols.record(record("a", address)).unwrap();
        }
        symbols.record(record("b", 3)).unwrap();
        symbols.retract("a", 2).unwrap();

        let addresses: Vec<_> = symbols.records_for("a").iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![0, 1]);
        assert_eq!(symbols.records_for("b").len(), 1);
    }

    #[test]
    fn test_clones_share_tables() {
        let symbols = DebugSymbols::new();
        let mut sinks = Sinks::default();
        sinks.set_debug(Box::new(symbols.clone()));
        sinks.record(record("a", 0));
        sinks.anchor("a", 0, Span::new(1, 1));
        assert_eq!(symbols.records().len(), 1);
        assert_eq!(symbols.anchors().len(), 1);
    }

    #[test]
    fn test_failures_are_swallowed() {
        let mut sinks = Sinks::default();
        sinks.set_debug(Box::new(Failing));
        sinks.record(record("a", 0));
        sinks.retract("a", 0);
        sinks.anchor("a", 0, Span::default());
    }

    #[test]
    fn test_reflection_records() {
        let reflection = Reflection::new();
        let mut sinks = Sinks::default();
        sinks.set_reflection(Box::new(reflection.clone()));
        sinks.variable(NamespaceKind::Global, "score", 0);
        sinks.function("scr_main", 0);
        assert_eq!(
            reflection.variables(),
            vec![(NamespaceKind::Global, "score".to_string(), 0)]
        );
        assert_eq!(reflection.functions(), vec![("scr_main".to_string(), 0)]);
    }
}
