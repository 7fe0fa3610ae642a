use std::collections::HashSet;

use indexmap::IndexMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::compiler::error::CompilerError;

pub type TypeId = u32;

/// The bootstrap primitive block. The ids are part of the contract
/// between the front end and every back end and never move.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u32)]
pub enum Primitive {
    Void = 1,
    Bool = 2,
    U8 = 3,
    I8 = 4,
    U16 = 5,
    I16 = 6,
    Number = 7,
    String = 8,
    Fn = 9,
    Char = 10,
    Ptr = 11,
    Initializer = 12,
}

impl Primitive {
    pub const fn id(self) -> TypeId {
        self as TypeId
    }

    pub const fn byte_size(self) -> u32 {
        match self {
            Primitive::Void | Primitive::Initializer => 0,
            Primitive::Bool
            | Primitive::U8
            | Primitive::I8
            | Primitive::Char => 1,
            Primitive::U16 | Primitive::I16 => 2,
            Primitive::Number
            | Primitive::String
            | Primitive::Fn
            | Primitive::Ptr => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeStatus {
    Unknown,
    Declared,
    Defined,
    Complete,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Unknown,
    Primitive,
    Pointer,
    Array,
    Function,
    Record,
    Union,
}

/// One ordered member of a compound type: record members carry names,
/// function entries are the parameters with the return type last,
/// pointers and arrays hold their single element type (arrays also an
/// element count).
#[derive(Debug, Clone, PartialEq)]
pub struct FieldEntry {
    pub type_id: TypeId,
    pub name: Option<String>,
    pub element_count: u32,
}

impl FieldEntry {
    pub fn unnamed(type_id: TypeId) -> Self {
        FieldEntry {
            type_id,
            name: None,
            element_count: 0,
        }
    }

    pub fn named(name: &str, type_id: TypeId) -> Self {
        FieldEntry {
            type_id,
            name: Some(name.to_owned()),
            element_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub id: TypeId,
    pub module: Option<String>,
    pub name: String,
    pub status: TypeStatus,
    pub kind: TypeKind,
    pub fields: Vec<FieldEntry>,
    pub byte_size: u32,
}

/// Registry of named and structural types. Ids are stable for the
/// session; names resolve through an insertion-ordered alias map so
/// reports list types in declaration order.
#[derive(Debug)]
pub struct TypeTable {
    entries: Vec<TypeEntry>,
    aliases: IndexMap<(Option<String>, String), TypeId>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTable {
    pub fn new() -> Self {
        let mut table = TypeTable {
            entries: vec![TypeEntry {
                id: 0,
                module: None,
                name: String::new(),
                status: TypeStatus::Unknown,
                kind: TypeKind::Unknown,
                fields: Vec::new(),
                byte_size: 0,
            }],
            aliases: IndexMap::new(),
        };
        for primitive in [
            Primitive::Void,
            Primitive::Bool,
            Primitive::U8,
            Primitive::I8,
            Primitive::U16,
            Primitive::I16,
            Primitive::Number,
        ] {
            table.register_primitive(name_of(primitive), primitive.byte_size());
        }
        // `string` is an array of char with a fixed pointer-sized
        // representation, so it lands between number and fn.
        let string_id = table.push_entry(
            None,
            "string".to_owned(),
            TypeKind::Array,
            vec![FieldEntry::unnamed(Primitive::Char.id())],
        );
        table.entries[string_id as usize].status = TypeStatus::Complete;
        table.entries[string_id as usize].byte_size =
            Primitive::String.byte_size();
        for primitive in [Primitive::Fn, Primitive::Char, Primitive::Ptr] {
            table.register_primitive(name_of(primitive), primitive.byte_size());
        }
        let initializer_id = table.push_entry(
            None,
            "initializer".to_owned(),
            TypeKind::Unknown,
            Vec::new(),
        );
        table.entries[initializer_id as usize].status = TypeStatus::Complete;

        for (alias, primitive) in [
            ("uint8", Primitive::U8),
            ("int8", Primitive::I8),
            ("uint16", Primitive::U16),
            ("int16", Primitive::I16),
        ] {
            table
                .aliases
                .insert((None, alias.to_owned()), primitive.id());
        }
        table
    }

    fn push_entry(
        &mut self,
        module: Option<String>,
        name: String,
        kind: TypeKind,
        fields: Vec<FieldEntry>,
    ) -> TypeId {
        let id = self.entries.len() as TypeId;
        self.aliases.insert((module.clone(), name.clone()), id);
        self.entries.push(TypeEntry {
            id,
            module,
            name,
            status: TypeStatus::Declared,
            kind,
            fields,
            byte_size: 0,
        });
        id
    }

    pub fn register_primitive(&mut self, name: &str, byte_size: u32) -> TypeId {
        if let Some(&id) = self.aliases.get(&(None, name.to_owned())) {
            return id;
        }
        let id = self.push_entry(
            None,
            name.to_owned(),
            TypeKind::Primitive,
            Vec::new(),
        );
        self.entries[id as usize].status = TypeStatus::Complete;
        self.entries[id as usize].byte_size = byte_size;
        id
    }

    /// Idempotent forward declaration in the given module namespace.
    pub fn declare(&mut self, module: Option<&str>, name: &str) -> TypeId {
        if let Some(id) = self.lookup(module, name) {
            return id;
        }
        self.push_entry(
            module.map(str::to_owned),
            name.to_owned(),
            TypeKind::Unknown,
            Vec::new(),
        )
    }

    /// Transitions `declared` to `defined`. Defining twice with the
    /// same kind is a no-op; a different kind is an error.
    pub fn define(
        &mut self,
        id: TypeId,
        kind: TypeKind,
        fields: Vec<FieldEntry>,
    ) -> Result<TypeId, CompilerError> {
        let entry = &mut self.entries[id as usize];
        match entry.status {
            TypeStatus::Declared | TypeStatus::Unknown => {
                entry.kind = kind;
                entry.fields = fields;
                entry.status = TypeStatus::Defined;
                Ok(id)
            }
            _ if entry.kind == kind => Ok(id),
            _ => Err(CompilerError::TypeRedefinition(entry.name.clone())),
        }
    }

    /// Registers a structural type (`^T`, `[N]T`, `fn(...): T`) under
    /// its canonical printed name, reusing an existing id if the same
    /// shape was seen before.
    pub fn register_structural(
        &mut self,
        name: &str,
        kind: TypeKind,
        fields: Vec<FieldEntry>,
    ) -> TypeId {
        if let Some(&id) = self.aliases.get(&(None, name.to_owned())) {
            return id;
        }
        let id = self.push_entry(None, name.to_owned(), kind, fields);
        self.entries[id as usize].status = TypeStatus::Defined;
        id
    }

    /// Points an extra spelling at an existing entry, the way the
    /// `uint8` family maps onto `u8`. Enum names alias `u8` this way.
    pub fn alias(&mut self, module: Option<&str>, name: &str, target: TypeId) {
        self.aliases
            .insert((module.map(str::to_owned), name.to_owned()), target);
    }

    fn lookup(&self, module: Option<&str>, name: &str) -> Option<TypeId> {
        if let Some(module) = module
            && let Some(&id) = self
                .aliases
                .get(&(Some(module.to_owned()), name.to_owned()))
        {
            return Some(id);
        }
        self.aliases.get(&(None, name.to_owned())).copied()
    }

    pub fn get_by_name(
        &self,
        module: Option<&str>,
        name: &str,
    ) -> Option<TypeId> {
        self.lookup(module, name)
    }

    pub fn get(&self, id: TypeId) -> &TypeEntry {
        &self.entries[id as usize]
    }

    pub fn kind(&self, id: TypeId) -> TypeKind {
        self.entries[id as usize].kind
    }

    pub fn name(&self, id: TypeId) -> &str {
        &self.entries[id as usize].name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Element type of a pointer or array, return-carrying entry list
    /// excluded for functions.
    pub fn get_parent(&self, id: TypeId) -> Option<TypeId> {
        let entry = &self.entries[id as usize];
        match entry.kind {
            TypeKind::Pointer | TypeKind::Array => {
                entry.fields.first().map(|f| f.type_id)
            }
            _ => None,
        }
    }

    pub fn has_parent(&self, id: TypeId) -> bool {
        self.get_parent(id).is_some()
    }

    /// Walks every entry and assigns byte sizes. Records sum their
    /// fields, unions overlap them, pointers and arrays are always
    /// pointer-sized so a pointer through an incomplete type is fine.
    /// A cycle through record fields is fatal.
    pub fn calculate_sizes(&mut self) -> Result<(), CompilerError> {
        for id in 1..self.entries.len() as TypeId {
            let mut visited = HashSet::new();
            self.size_of_entry(id, &mut visited)?;
        }
        Ok(())
    }

    fn size_of_entry(
        &mut self,
        id: TypeId,
        visited: &mut HashSet<TypeId>,
    ) -> Result<u32, CompilerError> {
        let entry = &self.entries[id as usize];
        if entry.kind == TypeKind::Primitive
            || entry.status == TypeStatus::Complete
        {
            return Ok(entry.byte_size);
        }
        visited.insert(id);

        let kind = entry.kind;
        let fields = entry.fields.clone();
        let total = match kind {
            TypeKind::Record | TypeKind::Union => {
                let mut sum = 0u32;
                let mut max = 0u32;
                for field in &fields {
                    if visited.contains(&field.type_id) {
                        return Err(CompilerError::RecursiveType);
                    }
                    let size = self.size_of_entry(field.type_id, visited)?;
                    sum += size * field.element_count.max(1);
                    max = max.max(size);
                }
                if kind == TypeKind::Union { max } else { sum }
            }
            TypeKind::Pointer | TypeKind::Array | TypeKind::Function => {
                Primitive::Ptr.byte_size()
            }
            TypeKind::Primitive | TypeKind::Unknown => 0,
        };
        let entry = &mut self.entries[id as usize];
        entry.byte_size = total;
        entry.status = TypeStatus::Complete;
        Ok(total)
    }

    pub fn report(&self) {
        log::debug!("type table ({} entries)", self.entries.len());
        for entry in self.entries.iter().skip(1) {
            log::debug!(
                "  {} - {:?} | {} bytes",
                entry.name,
                entry.status,
                entry.byte_size
            );
        }
    }
}

fn name_of(primitive: Primitive) -> &'static str {
    match primitive {
        Primitive::Void => "void",
        Primitive::Bool => "bool",
        Primitive::U8 => "u8",
        Primitive::I8 => "i8",
        Primitive::U16 => "u16",
        Primitive::I16 => "i16",
        Primitive::Number => "number",
        Primitive::String => "string",
        Primitive::Fn => "fn",
        Primitive::Char => "char",
        Primitive::Ptr => "ptr",
        Primitive::Initializer => "initializer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_ids_match_the_reserved_block() {
        let table = TypeTable::new();
        assert_eq!(table.get_by_name(None, "void"), Some(1));
        assert_eq!(table.get_by_name(None, "bool"), Some(2));
        assert_eq!(table.get_by_name(None, "u8"), Some(3));
        assert_eq!(table.get_by_name(None, "i8"), Some(4));
        assert_eq!(table.get_by_name(None, "u16"), Some(5));
        assert_eq!(table.get_by_name(None, "i16"), Some(6));
        assert_eq!(table.get_by_name(None, "number"), Some(7));
        assert_eq!(table.get_by_name(None, "string"), Some(8));
        assert_eq!(table.get_by_name(None, "fn"), Some(9));
        assert_eq!(table.get_by_name(None, "char"), Some(10));
        assert_eq!(table.get_by_name(None, "ptr"), Some(11));
        assert_eq!(table.get_by_name(None, "uint16"), Some(5));
    }

    #[test]
    fn declare_is_idempotent() {
        let mut table = TypeTable::new();
        let a = table.declare(Some("main"), "Node");
        let b = table.declare(Some("main"), "Node");
        assert_eq!(a, b);
    }

    #[test]
    fn define_twice_same_kind_is_idempotent() {
        let mut table = TypeTable::new();
        let id = table.declare(None, "Pair");
        let fields = vec![
            FieldEntry::named("a", Primitive::U8.id()),
            FieldEntry::named("b", Primitive::U8.id()),
        ];
        assert!(table.define(id, TypeKind::Record, fields.clone()).is_ok());
        assert!(table.define(id, TypeKind::Record, fields).is_ok());
        assert!(matches!(
            table.define(id, TypeKind::Union, Vec::new()),
            Err(CompilerError::TypeRedefinition(_))
        ));
    }

    #[test]
    fn record_sizes_sum_fields() {
        let mut table = TypeTable::new();
        let id = table.declare(None, "Pair");
        table
            .define(
                id,
                TypeKind::Record,
                vec![
                    FieldEntry::named("a", Primitive::U8.id()),
                    FieldEntry::named("b", Primitive::U16.id()),
                ],
            )
            .unwrap();
        table.calculate_sizes().unwrap();
        assert_eq!(table.get(id).byte_size, 3);
        assert_eq!(table.get(id).status, TypeStatus::Complete);
    }

    #[test]
    fn record_cycles_are_fatal() {
        let mut table = TypeTable::new();
        let a = table.declare(None, "A");
        let b = table.declare(None, "B");
        table
            .define(a, TypeKind::Record, vec![FieldEntry::named("b", b)])
            .unwrap();
        table
            .define(b, TypeKind::Record, vec![FieldEntry::named("a", a)])
            .unwrap();
        assert_eq!(table.calculate_sizes(), Err(CompilerError::RecursiveType));
    }

    #[test]
    fn pointer_through_incomplete_type_is_complete() {
        let mut table = TypeTable::new();
        let node = table.declare(None, "Node");
        let ptr = table.register_structural(
            "^Node",
            TypeKind::Pointer,
            vec![FieldEntry::unnamed(node)],
        );
        table
            .define(
                node,
                TypeKind::Record,
                vec![
                    FieldEntry::named("next", ptr),
                    FieldEntry::named("val", Primitive::U8.id()),
                ],
            )
            .unwrap();
        table.calculate_sizes().unwrap();
        assert_eq!(
            table.get(node).byte_size,
            Primitive::Ptr.byte_size() + Primitive::U8.byte_size()
        );
        assert_eq!(table.get(ptr).byte_size, Primitive::Ptr.byte_size());
    }
}
