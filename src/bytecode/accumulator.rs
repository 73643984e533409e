//! Project-wide registries the compiler reads and fills.

use crate::bytecode::CodeObject;
use crate::bytecode::compile_error::CompileError;
use crate::lang::value::Value;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─────────────────────────────── Library ───────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Builtin {
    Function {
        id: u32,
        min_args: u8,
        /// `None` for variadic builtins.
        max_args: Option<u8>,
    },
    Constant(Value),
}

/// Builtin functions and constants, by name.
#[derive(Debug, Clone, Default)]
pub struct Library {
    entries: HashMap<String, Builtin>,
    functions: Vec<String>,
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    /// The builtins the reference executor implements.
    pub fn standard() -> Self {
        let mut lib = Self::new();

        lib.add_function("show_debug_message", 1, Some(1));
        lib.add_function("string", 1, Some(1));
        lib.add_function("real", 1, Some(1));
        lib.add_function("abs", 1, Some(1));
        lib.add_function("floor", 1, Some(1));
        lib.add_function("min", 1, None);
        lib.add_function("max", 1, None);
        lib.add_function("array_length", 1, Some(1));
        lib.add_function("instance_create", 3, Some(3));
        lib.add_function("is_undefined", 1, Some(1));

        lib.add_constant("true", Value::Real(1.0));
        lib.add_constant("false", Value::Real(0.0));
        lib.add_constant("pi", Value::Real(std::f64::consts::PI));
        lib.add_constant("undefined", Value::Undefined);
        lib.add_constant("self", Value::Real(-1.0));
        lib.add_constant("other", Value::Real(-2.0));
        lib.add_constant("all", Value::Real(-3.0));
        lib.add_constant("noone", Value::Real(-4.0));
        lib.add_constant("global", Value::Real(-5.0));

        lib
    }

    pub fn add_function(&mut self, name: &str, min_args: u8, max_args: Option<u8>) -> u32 {
        let id = self.functions.len() as u32;
        self.functions.push(name.to_string());
        self.entries.insert(
            name.to_string(),
            Builtin::Function {
                id,
                min_args,
                max_args,
            },
        );
        id
    }

    pub fn add_constant(&mut self, name: &str, value: Value) {
        self.entries
            .insert(name.to_string(), Builtin::Constant(value));
    }

    pub fn get(&self, name: &str) -> Option<&Builtin> {
        self.entries.get(name)
    }

    pub fn constant(&self, name: &str) -> Option<&Value> {
        match self.entries.get(name) {
            Some(Builtin::Constant(v)) => Some(v),
            _ => None,
        }
    }

    pub fn function_name(&self, id: u32) -> Option<&str> {
        self.functions.get(id as usize).map(String::as_str)
    }
}

// ──────────────────────────────── Assets ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Sprite,
    Sound,
    Background,
    Path,
    Script,
    Font,
    Timeline,
    Object,
    Room,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetDescriptor {
    /// Index among the assets of the same kind.
    pub id: u32,
    pub kind: AssetKind,
}

/// Asset names. Ids are assigned per kind in registration order.
#[derive(Debug, Default)]
pub struct AssetTable {
    inner: RwLock<AssetInner>,
}

#[derive(Debug, Default)]
struct AssetInner {
    by_name: HashMap<String, AssetDescriptor>,
    counts: HashMap<AssetKind, u32>,
}

impl AssetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asset. A name registered twice keeps its first entry.
    pub fn register(&self, name: &str, kind: AssetKind) -> AssetDescriptor {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_name.get(name) {
            return *existing;
        }
        let count = inner.counts.entry(kind).or_insert(0);
        let descriptor = AssetDescriptor { id: *count, kind };
        *count += 1;
        inner.by_name.insert(name.to_string(), descriptor);
        descriptor
    }

    pub fn get(&self, name: &str) -> Option<AssetDescriptor> {
        self.inner.read().by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────── Bytecode ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Arity {
    /// Named parameters.
    pub params: u8,
    /// Accepts more arguments than it names.
    pub variadic: bool,
    /// Values returned (`0` or `1`).
    pub retc: u8,
}

impl Arity {
    pub fn new(params: u8, variadic: bool) -> Self {
        Self {
            params,
            variadic,
            retc: 1,
        }
    }

    pub fn accepts(&self, argc: usize) -> bool {
        self.variadic || argc <= self.params as usize
    }
}

#[derive(Debug)]
struct FunctionEntry {
    name: String,
    arity: Arity,
    code: Option<CodeObject>,
}

/// Function name -> stable index, reservable before any code exists.
#[derive(Debug, Default)]
pub struct BytecodeTable {
    inner: RwLock<BytecodeInner>,
}

#[derive(Debug, Default)]
struct BytecodeInner {
    index: HashMap<String, u32>,
    entries: Vec<FunctionEntry>,
}

impl BytecodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if the name already has an index.
    pub fn reserve(&self, name: &str, arity: Arity) -> Option<u32> {
        let mut inner = self.inner.write();
        if inner.index.contains_key(name) {
            return None;
        }
        let index = inner.entries.len() as u32;
        inner.index.insert(name.to_string(), index);
        inner.entries.push(FunctionEntry {
            name: name.to_string(),
            arity,
            code: None,
        });
        Some(index)
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.inner.read().index.get(name).copied()
    }

    pub fn arity(&self, index: u32) -> Option<Arity> {
        self.inner
            .read()
            .entries
            .get(index as usize)
            .map(|e| e.arity)
    }

    pub fn name(&self, index: u32) -> Option<String> {
        self.inner
            .read()
            .entries
            .get(index as usize)
            .map(|e| e.name.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach compiled code to a reserved index.
    pub fn define(&self, index: u32, code: CodeObject) -> Result<(), CompileError> {
        let mut inner = self.inner.write();
        let entry = inner.entries.get_mut(index as usize).ok_or_else(|| {
            CompileError::internal(format!("define of unreserved function index {}", index))
        })?;
        if entry.code.is_some() {
            return Err(CompileError::internal(format!(
                "function '{}' compiled twice",
                entry.name
            )));
        }
        entry.code = Some(code);
        Ok(())
    }

    pub fn is_defined(&self, index: u32) -> bool {
        self.inner
            .read()
            .entries
            .get(index as usize)
            .is_some_and(|e| e.code.is_some())
    }

    /// Every function's code, in index order.
    pub fn code_objects(&self) -> Result<Vec<CodeObject>, CompileError> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|e| {
                e.code.clone().ok_or_else(|| {
                    CompileError::internal(format!("function '{}' was never compiled", e.name))
                })
            })
            .collect()
    }
}

// ──────────────────────────────── Enums ────────────────────────────────────

/// `enum` constants, visible to every function once defined.
#[derive(Debug, Default)]
pub struct EnumTable {
    inner: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl EnumTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a member, returning the value it replaced.
    pub fn define(&self, name: &str, member: &str, value: Value) -> Option<Value> {
        self.inner
            .write()
            .entry(name.to_string())
            .or_default()
            .insert(member.to_string(), value)
    }

    pub fn get(&self, name: &str, member: &str) -> Option<Value> {
        self.inner.read().get(name)?.get(member).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_library() {
        let lib = Library::standard();
        match lib.get("min") {
            Some(Builtin::Function { max_args, .. }) => assert_eq!(*max_args, None),
            other => panic!("expected function, got {:?}", other),
        }
        assert_eq!(lib.constant("noone"), Some(&Value::Real(-4.0)));
        assert_eq!(lib.function_name(0), Some("show_debug_message"));
        assert!(lib.get("nope").is_none());
    }

    #[test]
    fn test_asset_ids_per_kind() {
        let assets = AssetTable::new();
        let a = assets.register("spr_a", AssetKind::Sprite);
        let b = assets.register("obj_a", AssetKind::Object);
        let c = assets.register("spr_b", AssetKind::Sprite);
        let again = assets.register("spr_a", AssetKind::Sound);

        assert_eq!((a.id, b.id, c.id), (0, 0, 1));
        assert_eq!(again, a);
        assert_eq!(assets.len(), 3);
    }

    #[test]
    fn test_reserve_and_lookup() {
        let table = BytecodeTable::new();
        let a = table.reserve("scr_a", Arity::new(2, false)).unwrap();
        let b = table.reserve("scr_b", Arity::new(0, true)).unwrap();

        assert_eq!((a, b), (0, 1));
        assert_eq!(table.lookup("scr_b"), Some(1));
        assert_eq!(table.arity(0).map(|a| a.params), Some(2));
        assert!(table.arity(1).is_some_and(|a| a.accepts(9)));
    }

    #[test]
    fn test_duplicate_reserve() {
        let table = BytecodeTable::new();
        table.reserve("scr_a", Arity::default()).unwrap();
        assert_eq!(table.reserve("scr_a", Arity::new(3, false)), None);
        assert_eq!(table.arity(0), Some(Arity::default()));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_code_objects_require_every_definition() {
        let table = BytecodeTable::new();
        let a = table.reserve("scr_a", Arity::default()).unwrap();
        table.reserve("scr_b", Arity::default()).unwrap();
        table.define(a, CodeObject::empty("scr_a")).unwrap();

        assert!(table.is_defined(a));
        assert!(table.code_objects().unwrap_err().is_internal());
        assert!(table.define(a, CodeObject::empty("scr_a")).is_err());
    }

    #[test]
    fn test_enum_table() {
        let enums = EnumTable::new();
        assert_eq!(enums.define("Color", "Red", Value::Real(0.0)), None);
        assert_eq!(enums.get("Color", "Red"), Some(Value::Real(0.0)));
        assert!(enums.contains("Color"));
        assert_eq!(
            enums.define("Color", "Red", Value::Real(1.0)),
            Some(Value::Real(0.0))
        );
    }
}
