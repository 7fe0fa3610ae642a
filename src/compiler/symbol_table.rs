use indexmap::IndexMap;

use crate::codegen::Platform;
use crate::compiler::const_pool::ConstIndex;
use crate::compiler::type_table::{TypeId, TypeKind, TypeTable};

pub type ScopeId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Unknown,
    Keyword,
    Function,
    Parameter,
    Variable,
    Constant,
    Shadow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolStatus {
    Declared,
    Defined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Static,
    Auto,
    Parameter,
    External,
}

#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub name: String,
    pub kind: SymbolKind,
    pub status: SymbolStatus,
    pub type_id: TypeId,
    pub scope: ScopeId,
    pub bank: u32,
    pub ordinal: u32,
    pub param_ordinal: u32,
    pub element_count: u32,
    pub constant_index: Option<ConstIndex>,
    pub storage: StorageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Invalid,
    Module,
    Bank,
    Function,
    Block,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub id: ScopeId,
    pub parent: ScopeId,
    pub module_name: Option<String>,
    pub kind: ScopeKind,
    pub bank: u32,
    pub ordinal: u32,
    pub param_ordinal: u32,
    pub nested_count: u32,
    pub table_allocation_count: u32,
    pub nested_size: u32,
    pub table_size: u32,
    pub table_allocation_size: u32,
    pub leaf: bool,
    pub entries: IndexMap<String, SymbolEntry>,
}

/// The scope forest. Scope 0 is the universal root; ids only grow, and
/// a scope's parent id is always strictly smaller.
#[derive(Debug)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    stack: Vec<ScopeId>,
    leaf_scopes: Vec<ScopeId>,
    next_bank: u32,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            scopes: vec![Scope {
                id: 0,
                parent: 0,
                module_name: None,
                kind: ScopeKind::Invalid,
                bank: 0,
                ordinal: 0,
                param_ordinal: 0,
                nested_count: 0,
                table_allocation_count: 0,
                nested_size: 0,
                table_size: 0,
                table_allocation_size: 0,
                leaf: true,
                entries: IndexMap::new(),
            }],
            stack: vec![0],
            leaf_scopes: Vec::new(),
            next_bank: 1,
        }
    }

    pub fn current_scope(&self) -> ScopeId {
        *self.stack.last().unwrap_or(&0)
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id as usize]
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    pub fn open_scope(&mut self, kind: ScopeKind) -> ScopeId {
        let parent = self.current_scope();
        let bank = match kind {
            ScopeKind::Invalid => 0,
            ScopeKind::Bank => {
                let bank = self.next_bank;
                self.next_bank += 1;
                bank
            }
            _ => self.scopes[parent as usize].bank,
        };
        let id = self.scopes.len() as ScopeId;
        self.scopes.push(Scope {
            id,
            parent,
            module_name: None,
            kind,
            bank,
            ordinal: 0,
            param_ordinal: 0,
            nested_count: 0,
            table_allocation_count: 0,
            nested_size: 0,
            table_size: 0,
            table_allocation_size: 0,
            leaf: true,
            entries: IndexMap::new(),
        });
        self.stack.push(id);
        id
    }

    /// Pops the current scope, folding its allocation counters into
    /// the parent and recording it as a leaf when it never grew a
    /// child.
    pub fn close_scope(&mut self) {
        let Some(id) = self.stack.pop() else {
            return;
        };
        let entry_count = self.scopes[id as usize].entries.len() as u32;
        let nested = self.scopes[id as usize].nested_count;
        self.scopes[id as usize].table_allocation_count =
            entry_count + nested;

        let parent = self.scopes[id as usize].parent;
        if parent != id {
            let count = self.scopes[id as usize].table_allocation_count;
            let parent_scope = &mut self.scopes[parent as usize];
            parent_scope.nested_count = parent_scope.nested_count.max(count);
            parent_scope.leaf = false;
        }
        if self.scopes[id as usize].leaf {
            self.leaf_scopes.push(id);
        }
    }

    /// Re-enters an already-created scope during resolution.
    pub fn push_scope(&mut self, id: ScopeId) {
        self.stack.push(id);
    }

    pub fn pop_scope(&mut self) {
        self.stack.pop();
    }

    /// Idempotent placeholder entry in the current scope.
    pub fn declare(
        &mut self,
        name: &str,
        kind: SymbolKind,
        type_id: TypeId,
        storage: StorageKind,
    ) {
        let scope_id = self.current_scope();
        let scope = &mut self.scopes[scope_id as usize];
        if scope.entries.contains_key(name) {
            return;
        }
        let bank = scope.bank;
        scope.entries.insert(
            name.to_owned(),
            SymbolEntry {
                name: name.to_owned(),
                kind,
                status: SymbolStatus::Declared,
                type_id,
                scope: scope_id,
                bank,
                ordinal: 0,
                param_ordinal: 0,
                element_count: 0,
                constant_index: None,
                storage,
            },
        );
    }

    /// Defines a symbol in the current scope, assigning its ordinal
    /// from the scope counters.
    pub fn define(
        &mut self,
        name: &str,
        kind: SymbolKind,
        type_id: TypeId,
        storage: StorageKind,
    ) -> SymbolEntry {
        let scope_id = self.current_scope();
        let scope = &mut self.scopes[scope_id as usize];
        let entry = SymbolEntry {
            name: name.to_owned(),
            kind,
            status: SymbolStatus::Defined,
            type_id,
            scope: scope_id,
            bank: scope.bank,
            ordinal: scope.ordinal,
            param_ordinal: scope.param_ordinal,
            element_count: 0,
            constant_index: None,
            storage,
        };
        match kind {
            // Statics live in the data image and take no stack slot.
            SymbolKind::Variable | SymbolKind::Constant
                if storage == StorageKind::Auto =>
            {
                scope.ordinal += 1
            }
            SymbolKind::Parameter => scope.param_ordinal += 1,
            _ => {}
        }
        scope.entries.insert(name.to_owned(), entry.clone());
        entry
    }

    pub fn set_constant_index(&mut self, name: &str, index: ConstIndex) {
        let scope_id = self.current_scope();
        if let Some(entry) =
            self.scopes[scope_id as usize].entries.get_mut(name)
        {
            entry.constant_index = Some(index);
        }
    }

    pub fn update_element_count(&mut self, name: &str, element_count: u32) {
        let mut current = self.current_scope();
        loop {
            let scope = &mut self.scopes[current as usize];
            if let Some(entry) = scope.entries.get_mut(name)
                && entry.status == SymbolStatus::Defined
            {
                entry.element_count = element_count;
                return;
            }
            if current == 0 {
                return;
            }
            current = scope.parent;
        }
    }

    /// Lexical lookup from the given scope upward. Shadow entries do
    /// not answer the lookup themselves but retype the next real hit.
    pub fn get(&self, scope: ScopeId, name: &str) -> Option<SymbolEntry> {
        let mut current = scope;
        let mut shadow_type: TypeId = 0;
        loop {
            let s = &self.scopes[current as usize];
            if let Some(entry) = s.entries.get(name) {
                if entry.kind == SymbolKind::Shadow {
                    if shadow_type == 0 {
                        shadow_type = entry.type_id;
                    }
                } else {
                    let mut entry = entry.clone();
                    if shadow_type != 0 {
                        entry.type_id = shadow_type;
                    }
                    return Some(entry);
                }
            }
            if current == 0 {
                return None;
            }
            current = s.parent;
        }
    }

    pub fn get_current(&self, name: &str) -> Option<SymbolEntry> {
        self.get(self.current_scope(), name)
    }

    /// Lookup that does not walk parents.
    pub fn get_current_only(&self, name: &str) -> Option<&SymbolEntry> {
        self.scopes[self.current_scope() as usize].entries.get(name)
    }

    pub fn scope_has(&self, name: &str) -> bool {
        self.get_current(name).is_some()
    }

    /// Fallback lookup across every bank scope, so bank members are
    /// callable from outside their bank.
    pub fn check_banks(&self, name: &str) -> Option<SymbolEntry> {
        self.scopes
            .iter()
            .filter(|s| s.kind == ScopeKind::Bank)
            .find_map(|s| s.entries.get(name))
            .cloned()
    }

    /// Names the current scope as a module. Fails when the name is
    /// already taken by another scope.
    pub fn name_scope(&mut self, name: &str) -> bool {
        let current = self.current_scope();
        if self.scopes[current as usize].module_name.is_some() {
            return true;
        }
        if self.scope_id_by_name(name).is_some() {
            return false;
        }
        self.scopes[current as usize].module_name = Some(name.to_owned());
        true
    }

    pub fn scope_id_by_name(&self, name: &str) -> Option<ScopeId> {
        self.scopes
            .iter()
            .find(|s| {
                s.kind != ScopeKind::Invalid
                    && s.module_name.as_deref() == Some(name)
            })
            .map(|s| s.id)
    }

    /// Nearest enclosing module name, used to qualify TAC symbols.
    pub fn module_name_from(&self, scope: ScopeId) -> Option<String> {
        let mut current = scope;
        loop {
            let s = &self.scopes[current as usize];
            if let Some(name) = &s.module_name {
                return Some(name.clone());
            }
            if current == 0 {
                return None;
            }
            current = s.parent;
        }
    }

    /// Stack slot number for a local: its own ordinal plus the local
    /// counters of every scope out to the owning function, one-based
    /// so slot zero stays clear of the saved frame pointer pair.
    pub fn stack_ordinal(&self, entry: &SymbolEntry) -> u32 {
        let mut ordinal = entry.ordinal;
        let mut current = &self.scopes[entry.scope as usize];
        while current.kind != ScopeKind::Function && current.id != 0 {
            current = &self.scopes[current.parent as usize];
            ordinal += current.ordinal;
        }
        ordinal + 1
    }

    /// Post-resolution layout pass: caches per-scope table sizes, then
    /// pushes allocation totals up from every leaf until a module
    /// scope is reached. A function scope's `table_allocation_size`
    /// afterwards is its required stack frame.
    pub fn calculate_allocations(
        &mut self,
        platform: &dyn Platform,
        types: &TypeTable,
    ) {
        let sizes: Vec<u32> = (0..self.scopes.len())
            .map(|index| self.table_size_of(index, platform, types))
            .collect();
        for (scope, size) in self.scopes.iter_mut().zip(sizes) {
            scope.table_size = size;
        }

        let leaves: Vec<ScopeId> = self
            .leaf_scopes
            .iter()
            .copied()
            .filter(|&id| self.scopes[id as usize].leaf)
            .collect();
        for leaf in leaves {
            let mut current = leaf;
            while !matches!(
                self.scopes[current as usize].kind,
                ScopeKind::Module | ScopeKind::Invalid
            ) {
                let scope = &self.scopes[current as usize];
                let allocation = scope.table_size + scope.nested_size;
                let parent = scope.parent;
                self.scopes[current as usize].table_allocation_size =
                    allocation;
                let parent_scope = &mut self.scopes[parent as usize];
                parent_scope.nested_size =
                    parent_scope.nested_size.max(allocation);
                current = parent;
            }
        }
    }

    fn table_size_of(
        &self,
        index: usize,
        platform: &dyn Platform,
        types: &TypeTable,
    ) -> u32 {
        let scope = &self.scopes[index];
        let mut size = 0;
        for entry in scope.entries.values() {
            if entry.status != SymbolStatus::Defined
                || matches!(
                    entry.kind,
                    SymbolKind::Shadow | SymbolKind::Parameter
                )
                || !matches!(entry.storage, StorageKind::Auto)
            {
                continue;
            }
            if entry.element_count > 0 {
                let element = types
                    .get_parent(entry.type_id)
                    .filter(|_| types.kind(entry.type_id) == TypeKind::Array)
                    .unwrap_or(entry.type_id);
                size += platform.size_of(types, element) * entry.element_count;
            } else {
                size += platform.size_of(types, entry.type_id);
            }
        }
        size
    }

    pub fn report(&self) {
        log::debug!("symbol table ({} scopes)", self.scopes.len());
        for scope in &self.scopes {
            log::debug!(
                "  scope {} (parent {}, {:?}, table size {}, allocation {})",
                scope.id,
                scope.parent,
                scope.kind,
                scope.table_size,
                scope.table_allocation_size
            );
            for entry in scope.entries.values() {
                log::debug!(
                    "    {} - {:?} ({:?}, ordinal {})",
                    entry.name,
                    entry.kind,
                    entry.storage,
                    entry.ordinal
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::type_table::Primitive;

    #[test]
    fn scope_ids_grow_and_parents_are_smaller() {
        let mut table = SymbolTable::new();
        let a = table.open_scope(ScopeKind::Module);
        let b = table.open_scope(ScopeKind::Function);
        assert!(a < b);
        assert!(table.scope(b).parent == a);
        table.close_scope();
        table.close_scope();
    }

    #[test]
    fn open_close_on_empty_scope_keeps_counters_zeroed() {
        let mut table = SymbolTable::new();
        table.open_scope(ScopeKind::Module);
        let id = table.open_scope(ScopeKind::Block);
        table.close_scope();
        let scope = table.scope(id);
        assert_eq!(scope.table_allocation_count, 0);
        assert_eq!(scope.ordinal, 0);
        assert!(scope.leaf);
    }

    #[test]
    fn define_assigns_ordinals_per_kind() {
        let mut table = SymbolTable::new();
        table.open_scope(ScopeKind::Function);
        let p0 = table.define(
            "a",
            SymbolKind::Parameter,
            Primitive::U8.id(),
            StorageKind::Parameter,
        );
        let p1 = table.define(
            "b",
            SymbolKind::Parameter,
            Primitive::U8.id(),
            StorageKind::Parameter,
        );
        let v0 = table.define(
            "x",
            SymbolKind::Variable,
            Primitive::U8.id(),
            StorageKind::Auto,
        );
        let v1 = table.define(
            "y",
            SymbolKind::Variable,
            Primitive::U8.id(),
            StorageKind::Auto,
        );
        assert_eq!((p0.param_ordinal, p1.param_ordinal), (0, 1));
        assert_eq!((v0.ordinal, v1.ordinal), (0, 1));
    }

    #[test]
    fn lookup_walks_parents() {
        let mut table = SymbolTable::new();
        table.open_scope(ScopeKind::Module);
        table.define(
            "x",
            SymbolKind::Variable,
            Primitive::U8.id(),
            StorageKind::Static,
        );
        table.open_scope(ScopeKind::Block);
        assert!(table.get_current("x").is_some());
        assert!(table.get_current_only("x").is_none());
        assert!(table.get_current("missing").is_none());
    }

    #[test]
    fn shadow_entries_retype_without_masking() {
        let mut table = SymbolTable::new();
        table.open_scope(ScopeKind::Module);
        table.define(
            "x",
            SymbolKind::Variable,
            Primitive::U8.id(),
            StorageKind::Static,
        );
        table.open_scope(ScopeKind::Block);
        table.define(
            "x",
            SymbolKind::Shadow,
            Primitive::U16.id(),
            StorageKind::Auto,
        );
        let entry = table.get_current("x").unwrap();
        assert_eq!(entry.kind, SymbolKind::Variable);
        assert_eq!(entry.type_id, Primitive::U16.id());
    }

    #[test]
    fn bank_scopes_take_fresh_bank_indices() {
        let mut table = SymbolTable::new();
        table.open_scope(ScopeKind::Module);
        let bank1 = table.open_scope(ScopeKind::Bank);
        let inner = table.open_scope(ScopeKind::Block);
        assert_eq!(table.scope(bank1).bank, 1);
        assert_eq!(table.scope(inner).bank, 1);
        table.close_scope();
        table.close_scope();
        let bank2 = table.open_scope(ScopeKind::Bank);
        assert_eq!(table.scope(bank2).bank, 2);
    }
}
