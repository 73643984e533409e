use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceKind {
    Instance,
    Global,
}

impl std::fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NamespaceKind::Instance => write!(f, "instance"),
            NamespaceKind::Global => write!(f, "global"),
        }
    }
}

/// Result of interning a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub id: u32,
    /// The id was created by this call.
    pub fresh: bool,
}

#[derive(Debug, Default)]
struct Table {
    ids: HashMap<String, u32>,
    names: Vec<String>,
}

/// Name <-> id mapping shared by every function of a compilation.
///
/// Ids are dense, start at zero and never change once handed out.
#[derive(Debug)]
pub struct Namespace {
    kind: NamespaceKind,
    table: RwLock<Table>,
    limit: usize,
}

impl Namespace {
    pub fn new(kind: NamespaceKind, limit: usize) -> Self {
        Self {
            kind,
            table: RwLock::new(Table::default()),
            limit,
        }
    }

    pub fn kind(&self) -> NamespaceKind {
        self.kind
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Id of `name`, assigning the next one on first reference.
    ///
    /// `None` when the namespace is full.
    pub fn get_or_insert(&self, name: &str) -> Option<Symbol> {
        let table = self.table.upgradable_read();
        if let Some(&id) = table.ids.get(name) {
            return Some(Symbol { id, fresh: false });
        }
        if table.names.len() >= self.limit {
            return None;
        }

        let mut table = RwLockUpgradableReadGuard::upgrade(table);
        let id = table.names.len() as u32;
        table.ids.insert(name.to_string(), id);
        table.names.push(name.to_string());
        Some(Symbol { id, fresh: true })
    }

    pub fn find(&self, name: &str) -> Option<u32> {
        self.table.read().ids.get(name).copied()
    }

    pub fn name(&self, id: u32) -> Option<String> {
        self.table.read().names.get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every name, indexed by id.
    pub fn names(&self) -> Vec<String> {
        self.table.read().names.clone()
    }
}

/// Static variables of one function.
///
/// Append-only while the function compiles; each distinct name gets one
/// persistent cell.
#[derive(Debug, Clone, Default)]
pub struct StaticMap {
    ids: HashMap<String, u32>,
}

impl StaticMap {
    /// Id for `name`, creating it if needed. `None` past `limit` cells.
    pub fn declare(&mut self, name: &str, limit: usize) -> Option<u32> {
        if let Some(&id) = self.ids.get(name) {
            return Some(id);
        }
        if self.ids.len() >= limit {
            return None;
        }
        let id = self.ids.len() as u32;
        self.ids.insert(name.to_string(), id);
        Some(id)
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
