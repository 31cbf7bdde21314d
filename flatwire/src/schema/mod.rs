//! The schema: the single source of truth for field indices, inline sizes and offsets.
//!
//! A schema is declared with a [`SchemaBuilder`] and resolved once by [`SchemaBuilder::build`].
//! Resolution assigns ids to every type, lays out structs, picks the vtable decoder of every
//! table and rejects inconsistent declarations, so the runtime never inspects types on the fly.

mod declarations;
mod resolution;

use std::fmt::{Display, Formatter};

pub use declarations::*;
use flatwire_buffer::{Alignment, ScalarType};
use flatwire_error::{FlatResult, flat_err};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::value::ScalarValue;
use crate::vtable::VTableKind;

macro_rules! schema_id {
    ($name:ident, $what:literal) => {
        #[doc = concat!("The id of a ", $what, " within its [`Schema`].")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) usize);

        impl $name {
            pub fn index(&self) -> usize {
                self.0
            }
        }
    };
}

schema_id!(TableId, "table");
schema_id!(StructId, "struct");
schema_id!(UnionId, "union");

/// Declares a schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    pub(crate) tables: Vec<TableDef>,
    pub(crate) structs: Vec<StructDef>,
    pub(crate) unions: Vec<UnionDef>,
    pub(crate) file_identifier: Option<String>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TableDef) -> Self {
        self.tables.push(table);
        self
    }

    pub fn structure(mut self, structure: StructDef) -> Self {
        self.structs.push(structure);
        self
    }

    pub fn union(mut self, union: UnionDef) -> Self {
        self.unions.push(union);
        self
    }

    /// The four bytes written after the root offset of every buffer.
    pub fn file_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.file_identifier = Some(identifier.into());
        self
    }
}

/// A resolved schema.
#[derive(Debug, Clone)]
pub struct Schema {
    tables: Vec<TableLayout>,
    structs: Vec<StructLayout>,
    unions: Vec<UnionLayout>,
    table_names: FxHashMap<String, TableId>,
    file_identifier: Option<[u8; 4]>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    pub fn table(&self, id: TableId) -> &TableLayout {
        &self.tables[id.0]
    }

    pub fn struct_layout(&self, id: StructId) -> &StructLayout {
        &self.structs[id.0]
    }

    pub fn union_layout(&self, id: UnionId) -> &UnionLayout {
        &self.unions[id.0]
    }

    pub fn table_id(&self, name: &str) -> FlatResult<TableId> {
        self.table_names
            .get(name)
            .copied()
            .ok_or_else(|| flat_err!(InvalidArgument: "unknown table {}", name))
    }

    pub fn tables(&self) -> impl Iterator<Item = (TableId, &TableLayout)> + '_ {
        self.tables
            .iter()
            .enumerate()
            .map(|(id, layout)| (TableId(id), layout))
    }

    pub fn file_identifier(&self) -> Option<&[u8; 4]> {
        self.file_identifier.as_ref()
    }

    /// Returns true if any table reachable from `root` declares a write-through field.
    pub fn reaches_write_through(&self, root: TableId) -> bool {
        let mut seen = FxHashSet::default();
        let mut pending = vec![root];
        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            let table = self.table(id);
            if table.fields().iter().any(FieldLayout::is_write_through) {
                return true;
            }
            pending.extend(table.fields().iter().flat_map(|field| self.referenced_tables(field)));
        }
        false
    }

    fn referenced_tables(&self, field: &FieldLayout) -> Vec<TableId> {
        match field.kind() {
            FieldKind::Table(id) => vec![*id],
            FieldKind::Vector(vector) => match vector.element() {
                ElementKind::Table(id) => vec![*id],
                _ => Vec::new(),
            },
            FieldKind::Union(id) => self
                .union_layout(*id)
                .members()
                .iter()
                .filter_map(|member| match member.kind() {
                    UnionMemberKind::Table(id) => Some(id),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A resolved table.
#[derive(Debug, Clone)]
pub struct TableLayout {
    name: String,
    fields: Vec<FieldLayout>,
    slots: Vec<Option<usize>>,
    vtable_kind: VTableKind,
    key: Option<usize>,
}

impl TableLayout {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fields in index order.
    pub fn fields(&self) -> &[FieldLayout] {
        &self.fields
    }

    /// The position within [`TableLayout::fields`] of the field declared at `index`.
    pub fn position(&self, index: u8) -> Option<usize> {
        self.slots
            .get(usize::from(index))
            .copied()
            .flatten()
            .filter(|&position| self.fields[position].index == index)
    }

    /// The field declared at `index`.
    pub fn field(&self, index: u8) -> FlatResult<&FieldLayout> {
        self.position(index)
            .map(|position| &self.fields[position])
            .ok_or_else(|| flat_err!(InvalidArgument: "table {} has no field {}", self.name, index))
    }

    /// The number of vtable slots the table uses.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn vtable_kind(&self) -> VTableKind {
        self.vtable_kind
    }

    /// The key field, if any.
    pub fn key(&self) -> Option<&FieldLayout> {
        self.key.map(|position| &self.fields[position])
    }
}

/// The resolved type of a table field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(ScalarType),
    String { shared: bool },
    Struct(StructId),
    Table(TableId),
    Union(UnionId),
    Vector(VectorLayout),
}

impl Display for FieldKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar(scalar_type) => write!(f, "{}", scalar_type),
            Self::String { shared: false } => write!(f, "string"),
            Self::String { shared: true } => write!(f, "shared string"),
            Self::Struct(_) => write!(f, "struct"),
            Self::Table(_) => write!(f, "table"),
            Self::Union(_) => write!(f, "union"),
            Self::Vector(_) => write!(f, "vector"),
        }
    }
}

/// A resolved table field.
#[derive(Debug, Clone)]
pub struct FieldLayout {
    name: String,
    index: u8,
    kind: FieldKind,
    inline_size: usize,
    inline_alignment: Alignment,
    default: Option<ScalarValue>,
    required: bool,
    key: bool,
    write_through: bool,
    sorted: bool,
    deprecated: bool,
}

impl FieldLayout {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    /// The size of the value stored inline in the table: the scalar, the struct, a uoffset, or
    /// for unions the one-byte discriminator.
    pub fn inline_size(&self) -> usize {
        self.inline_size
    }

    pub fn inline_alignment(&self) -> Alignment {
        self.inline_alignment
    }

    /// Unions use two vtable slots, every other field one.
    pub fn slot_count(&self) -> usize {
        match self.kind {
            FieldKind::Union(_) => 2,
            _ => 1,
        }
    }

    /// The declared default of a scalar field.
    pub fn default(&self) -> Option<ScalarValue> {
        self.default
    }

    /// The value an absent scalar field reads as.
    pub fn default_scalar(&self) -> Option<ScalarValue> {
        match self.kind {
            FieldKind::Scalar(scalar_type) => {
                Some(self.default.unwrap_or_else(|| ScalarValue::zero(scalar_type)))
            }
            _ => None,
        }
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_key(&self) -> bool {
        self.key
    }

    pub fn is_write_through(&self) -> bool {
        self.write_through
    }

    /// Sorted on write. Indexed vectors are always sorted.
    pub fn is_sorted(&self) -> bool {
        self.sorted
            || matches!(&self.kind, FieldKind::Vector(vector) if vector.kind() == VectorKind::Indexed)
    }

    pub fn is_deprecated(&self) -> bool {
        self.deprecated
    }
}

/// The resolved type of a vector element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Scalar(ScalarType),
    String { shared: bool },
    Struct(StructId),
    Table(TableId),
}

/// A resolved vector type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorLayout {
    element: ElementKind,
    kind: VectorKind,
    stride: usize,
    alignment: Alignment,
}

impl VectorLayout {
    pub fn element(&self) -> &ElementKind {
        &self.element
    }

    pub fn kind(&self) -> VectorKind {
        self.kind
    }

    /// The distance between consecutive elements.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// The alignment of the first element.
    pub fn alignment(&self) -> Alignment {
        self.alignment
    }

    /// Returns true for vectors of elements with a fixed inline size and no references.
    pub fn is_fixed_size(&self) -> bool {
        matches!(self.element, ElementKind::Scalar(_) | ElementKind::Struct(_))
    }
}

/// The resolved type of a struct field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructFieldKind {
    Scalar(ScalarType),
    Struct(StructId),
}

/// A resolved struct field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructFieldLayout {
    name: String,
    kind: StructFieldKind,
    offset: usize,
}

impl StructFieldLayout {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StructFieldKind {
        self.kind
    }

    /// The offset from the start of the struct.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// A resolved struct with its C layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    name: String,
    fields: Vec<StructFieldLayout>,
    size: usize,
    alignment: Alignment,
}

impl StructLayout {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[StructFieldLayout] {
        &self.fields
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> Alignment {
        self.alignment
    }
}

/// The resolved type of a union member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnionMemberKind {
    Table(TableId),
    Struct(StructId),
    String,
}

/// A resolved union member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnionMemberLayout {
    tag: u8,
    kind: UnionMemberKind,
}

impl UnionMemberLayout {
    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn kind(&self) -> UnionMemberKind {
        self.kind
    }
}

/// A resolved union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnionLayout {
    name: String,
    members: Vec<UnionMemberLayout>,
}

impl UnionLayout {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[UnionMemberLayout] {
        &self.members
    }

    pub fn member(&self, tag: u8) -> Option<&UnionMemberLayout> {
        self.members.iter().find(|member| member.tag == tag)
    }
}
