//! file: core/src/vm/scope.rs
//! description: lexical scopes holding variable values by symbol id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::vm::symbol::{SymbolId, SymbolTable, TableId, ROOT_TABLE};
use crate::vm::value::Value;

/// One lexical level of bindings.
///
/// Closures keep their defining scope alive through the `Arc`; concurrent
/// holders synchronize through the binding mutex.
pub struct Scope {
    table: TableId,
    symbols: Arc<SymbolTable>,
    bindings: Mutex<HashMap<SymbolId, Value>>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    pub fn root(symbols: Arc<SymbolTable>) -> Arc<Self> {
        Arc::new(Scope { table: ROOT_TABLE, symbols, bindings: Mutex::new(HashMap::new()), parent: None })
    }

    pub fn child(self: &Arc<Self>, table: TableId) -> Arc<Self> {
        Arc::new(Scope {
            table,
            symbols: Arc::clone(&self.symbols),
            bindings: Mutex::new(HashMap::new()),
            parent: Some(Arc::clone(self)),
        })
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn symbols(&self) -> &Arc<SymbolTable> {
        &self.symbols
    }

    pub fn parent(&self) -> Option<&Arc<Scope>> {
        self.parent.as_ref()
    }

    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cur = self.parent.as_ref();
        while let Some(s) = cur {
            depth += 1;
            cur = s.parent.as_ref();
        }
        depth
    }

    /// Walks outward until a binding for `id` is found.
    pub fn get(&self, id: SymbolId) -> Option<Value> {
        if let Some(v) = self.bindings.lock().get(&id) {
            return Some(v.clone());
        }
        let mut cur = self.parent.as_ref();
        while let Some(s) = cur {
            if let Some(v) = s.bindings.lock().get(&id) {
                return Some(v.clone());
            }
            cur = s.parent.as_ref();
        }
        None
    }

    pub fn get_local(&self, id: SymbolId) -> Option<Value> {
        self.bindings.lock().get(&id).cloned()
    }

    /// New binding in this scope, shadowing anything outside it.
    pub fn declare(&self, id: SymbolId, value: Value) {
        self.bindings.lock().insert(id, value);
    }

    /// Rebinds the nearest existing binding of `id`, or declares it here.
    pub fn assign(&self, id: SymbolId, value: Value) {
        let mut cur: Option<&Scope> = Some(self);
        while let Some(s) = cur {
            let mut guard = s.bindings.lock();
            if let Some(slot) = guard.get_mut(&id) {
                *slot = value;
                return;
            }
            drop(guard);
            cur = s.parent.as_deref();
        }
        self.declare(id, value);
    }

    /// Name-based lookup used by the debugger and `LoadName`: at each level
    /// the name is resolved against that level's own table.
    pub fn get_value_by_name(&self, name: &str) -> Option<Value> {
        let mut cur: Option<&Scope> = Some(self);
        while let Some(s) = cur {
            if let Some(id) = self.symbols.lookup_local(s.table, name) {
                if let Some(v) = s.get_local(id) {
                    return Some(v);
                }
            }
            cur = s.parent.as_deref();
        }
        None
    }

    /// Local bindings keyed by name, for display.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.bindings
            .lock()
            .iter()
            .map(|(id, v)| {
                let name = self.symbols.name_of(*id).map(str::to_string).unwrap_or_else(|| format!("#{}", id));
                (name, v.clone())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("table", &self.table)
            .field("depth", &self.depth())
            .field("bindings", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (Arc<SymbolTable>, SymbolId, SymbolId, TableId) {
        let mut t = SymbolTable::new();
        let a = t.declare(ROOT_TABLE, "a");
        let block = t.new_child(ROOT_TABLE);
        let shadow = t.declare(block, "a");
        (Arc::new(t), a, shadow, block)
    }

    #[test]
    fn assign_rebinds_nearest_and_declare_shadows() {
        let (t, a, shadow, block) = table();
        let root = Scope::root(t);
        root.declare(a, Value::from(1i64));
        let child = root.child(block);

        child.assign(a, Value::from(2i64));
        assert_eq!(root.get(a), Some(Value::from(2i64)));
        assert!(child.get_local(a).is_none());

        child.declare(shadow, Value::from(3i64));
        assert_eq!(child.get_value_by_name("a"), Some(Value::from(3i64)));
        assert_eq!(root.get_value_by_name("a"), Some(Value::from(2i64)));
    }

    #[test]
    fn lookup_walks_every_level() {
        let (t, a, _, block) = table();
        let root = Scope::root(t);
        root.declare(a, Value::from("x"));
        let deep = root.child(block).child(block).child(block);
        assert_eq!(deep.get(a), Some(Value::from("x")));
        assert_eq!(deep.depth(), 3);
        assert!(deep.get(99).is_none());
    }
}
