//! file: core/src/vm/symbol.rs
//! description: symbol tables mapping names to ids across nested blocks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type SymbolId = usize;
pub type TableId = usize;

pub const ROOT_TABLE: TableId = 0;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
struct Table {
    parent: Option<TableId>,
    symbols: BTreeMap<String, SymbolId>,
}

/// Compile-time naming information shared by every scope of a program.
///
/// Tables form a tree stored as an arena; table `0` is the root. Symbol ids
/// are unique across the whole arena, so the same name declared in two
/// nested blocks yields two distinct ids and shadowing falls out naturally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolTable {
    tables: Vec<Table>,
    names: Vec<String>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable { tables: vec![Table::default()], names: Vec::new() }
    }

    // ------- Table Helpers -------

    pub fn new_child(&mut self, parent: TableId) -> TableId {
        self.tables.push(Table { parent: Some(parent), symbols: BTreeMap::new() });
        self.tables.len() - 1
    }

    pub fn parent_of(&self, table: TableId) -> Option<TableId> {
        self.tables.get(table).and_then(|t| t.parent)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn contains_table(&self, table: TableId) -> bool {
        table < self.tables.len()
    }

    // ------- Symbol Helpers -------

    /// Declares `name` in `table`. Re-declaring in the same table returns the
    /// existing id.
    pub fn declare(&mut self, table: TableId, name: &str) -> SymbolId {
        if let Some(id) = self.lookup_local(table, name) {
            return id;
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        if let Some(t) = self.tables.get_mut(table) {
            t.symbols.insert(name.to_string(), id);
        }
        id
    }

    pub fn lookup_local(&self, table: TableId, name: &str) -> Option<SymbolId> {
        self.tables.get(table).and_then(|t| t.symbols.get(name).copied())
    }

    /// Resolves `name` from `table` outward to the root.
    pub fn lookup(&self, table: TableId, name: &str) -> Option<SymbolId> {
        let mut current = Some(table);
        while let Some(tid) = current {
            if let Some(id) = self.lookup_local(tid, name) {
                return Some(id);
            }
            current = self.parent_of(tid);
        }
        None
    }

    pub fn name_of(&self, id: SymbolId) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn symbols_in(&self, table: TableId) -> impl Iterator<Item = (&str, SymbolId)> {
        self.tables
            .get(table)
            .into_iter()
            .flat_map(|t| t.symbols.iter().map(|(n, id)| (n.as_str(), *id)))
    }

    pub fn symbol_count(&self) -> usize {
        self.names.len()
    }
}
