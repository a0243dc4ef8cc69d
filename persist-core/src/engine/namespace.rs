//! Namespace Table
//!
//! Every code unit and every loaded module owns a namespace: a package name,
//! a persistent symbol table (`rhai::Scope`) and the compiled AST its
//! functions and hooks live in.
//!
//! Unit namespaces get ids stepped by a large prime so package names are
//! hard to guess, and their names are derived from the id alone
//! (`Persist::Private::_p01076561`).  Module namespaces are named after
//! their module path and sit outside the private prefix.

use rhai::{Dynamic, Scope, AST};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tracing::debug;

pub(crate) type NamespaceId = u32;

/// Stride between consecutive namespace ids.
pub const NAMESPACE_STRIDE: u32 = 17_261_921;

/// Prefix of every unit namespace.
pub const PRIVATE_PREFIX: &str = "Persist::Private";

/// Package name of the unit namespace with `id`.
pub fn private_name(id: u32) -> String {
    format!("{PRIVATE_PREFIX}::_p{id:08X}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NamespaceKind {
    Unit,
    Module,
}

pub(crate) struct Namespace {
    pub(crate) name: String,
    pub(crate) kind: NamespaceKind,
    pub(crate) scope: Scope<'static>,
    pub(crate) ast: Option<Rc<AST>>,
}

/// All namespaces of one runtime.
pub(crate) struct NamespaceTable {
    last_id: u32,
    by_id: HashMap<NamespaceId, Namespace>,
    by_name: HashMap<String, NamespaceId>,
}

impl NamespaceTable {
    pub(crate) fn new() -> Self {
        Self {
            last_id: 0,
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    fn next_id(&mut self) -> NamespaceId {
        loop {
            self.last_id = self.last_id.wrapping_add(NAMESPACE_STRIDE);
            if !self.by_id.contains_key(&self.last_id) {
                return self.last_id;
            }
        }
    }

    /// Allocate a private namespace for a code unit.
    pub(crate) fn allocate_unit(&mut self) -> NamespaceId {
        let id = self.next_id();
        self.insert(id, private_name(id), NamespaceKind::Unit);
        id
    }

    /// Allocate a namespace for a module path.
    pub(crate) fn allocate_module(&mut self, name: &str) -> NamespaceId {
        let id = self.next_id();
        self.insert(id, name.to_string(), NamespaceKind::Module);
        id
    }

    fn insert(&mut self, id: NamespaceId, name: String, kind: NamespaceKind) {
        debug!(id, name = %name, "Namespace allocated");
        self.by_name.insert(name.clone(), id);
        self.by_id.insert(
            id,
            Namespace {
                name,
                kind,
                scope: Scope::new(),
                ast: None,
            },
        );
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<NamespaceId> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn name(&self, id: NamespaceId) -> Option<&str> {
        self.by_id.get(&id).map(|ns| ns.name.as_str())
    }

    pub(crate) fn is_module(&self, id: NamespaceId) -> bool {
        self.by_id
            .get(&id)
            .is_some_and(|ns| ns.kind == NamespaceKind::Module)
    }

    pub(crate) fn set_ast(&mut self, id: NamespaceId, ast: Rc<AST>) {
        if let Some(ns) = self.by_id.get_mut(&id) {
            ns.ast = Some(ast);
        }
    }

    pub(crate) fn ast(&self, id: NamespaceId) -> Option<Rc<AST>> {
        self.by_id.get(&id).and_then(|ns| ns.ast.clone())
    }

    /// Take the symbol table out for a run.
    pub(crate) fn take_scope(&mut self, id: NamespaceId) -> Scope<'static> {
        self.by_id
            .get_mut(&id)
            .map(|ns| std::mem::take(&mut ns.scope))
            .unwrap_or_default()
    }

    /// Put the symbol table back, keeping only the newest entry per name.
    pub(crate) fn put_scope(&mut self, id: NamespaceId, mut scope: Scope<'static>) {
        compact(&mut scope);
        if let Some(ns) = self.by_id.get_mut(&id) {
            ns.scope = scope;
        }
    }

    /// Drop the AST and symbol table and remove the name mapping.
    pub(crate) fn erase(&mut self, id: NamespaceId) -> bool {
        match self.by_id.remove(&id) {
            Some(ns) => {
                self.by_name.remove(&ns.name);
                debug!(id, name = %ns.name, symbols = ns.scope.len(), "Namespace erased");
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.by_id.clear();
        self.by_name.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }
}

impl Default for NamespaceTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse shadowed entries so re-declared globals do not pile up.
pub(crate) fn compact(scope: &mut Scope<'static>) {
    let entries: Vec<(String, bool, Dynamic)> = scope
        .iter()
        .map(|(name, constant, value)| (name.to_string(), constant, value))
        .collect();
    if entries.len() < 2 {
        return;
    }

    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(entries.len());
    for entry in entries.into_iter().rev() {
        if seen.insert(entry.0.clone()) {
            kept.push(entry);
        }
    }

    scope.clear();
    for (name, constant, value) in kept.into_iter().rev() {
        if constant {
            scope.push_constant_dynamic(name, value);
        } else {
            scope.push_dynamic(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_step_by_stride() {
        let mut table = NamespaceTable::new();
        let a = table.allocate_unit();
        let b = table.allocate_unit();
        assert_eq!(a, NAMESPACE_STRIDE);
        assert_eq!(b, NAMESPACE_STRIDE.wrapping_mul(2));
        assert_eq!(table.name(a), Some("Persist::Private::_p01076561"));
    }

    #[test]
    fn test_name_derivable_from_id() {
        let mut table = NamespaceTable::new();
        let id = table.allocate_unit();
        assert_eq!(table.lookup(&private_name(id)), Some(id));
        assert!(!table.is_module(id));
    }

    #[test]
    fn test_module_namespace() {
        let mut table = NamespaceTable::new();
        let id = table.allocate_module("Text::Util");
        assert!(table.is_module(id));
        assert_eq!(table.lookup("Text::Util"), Some(id));
    }

    #[test]
    fn test_erase_removes_mapping() {
        let mut table = NamespaceTable::new();
        let id = table.allocate_unit();
        assert!(table.erase(id));
        assert!(table.name(id).is_none());
        assert!(table.lookup(&private_name(id)).is_none());
        assert!(!table.erase(id));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_compact_keeps_newest() {
        let mut scope = Scope::new();
        scope.push("count", 1_i64);
        scope.push("other", true);
        scope.push("count", 2_i64);
        compact(&mut scope);
        assert_eq!(scope.len(), 2);
        assert_eq!(scope.get_value::<i64>("count"), Some(2));
        assert_eq!(scope.get_value::<bool>("other"), Some(true));
    }

    #[test]
    fn test_scope_round_trip_through_table() {
        let mut table = NamespaceTable::new();
        let id = table.allocate_unit();
        let mut scope = table.take_scope(id);
        scope.push("x", 5_i64);
        table.put_scope(id, scope);
        assert_eq!(table.take_scope(id).get_value::<i64>("x"), Some(5));
    }
}
