use flatwire_buffer::ScalarType;

use crate::value::ScalarValue;

/// The shape of a vector field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VectorKind {
    /// A fixed-length array. Elements can be replaced in greedy-mutable objects.
    Array,
    /// A growable list. Elements can be replaced, pushed and removed in greedy-mutable objects.
    #[default]
    List,
    /// A list that is never mutable.
    ReadOnlyList,
    /// A block of bytes handed out as one memory slice.
    Memory,
    /// A map from the key of each element table to the element, sorted on the wire.
    Indexed,
    /// A zero-copy slice of numeric scalars.
    Native,
}

/// The element type of a vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementType {
    Scalar(ScalarType),
    String,
    SharedString,
    Struct(String),
    Table(String),
}

/// A vector declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorType {
    pub element: ElementType,
    pub kind: VectorKind,
}

impl VectorType {
    pub fn new(element: ElementType, kind: VectorKind) -> Self {
        Self { element, kind }
    }

    pub fn list(element: ElementType) -> Self {
        Self::new(element, VectorKind::List)
    }
}

/// The declared type of a table field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Scalar(ScalarType),
    String,
    /// A string de-duplicated by the shared string writer and reader, if configured.
    SharedString,
    Struct(String),
    Table(String),
    /// A union occupies its own index for the discriminator and the next index for the value.
    Union(String),
    Vector(VectorType),
}

/// A table field declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub(crate) name: String,
    pub(crate) index: u8,
    pub(crate) field_type: FieldType,
    pub(crate) default: Option<ScalarValue>,
    pub(crate) required: bool,
    pub(crate) key: bool,
    pub(crate) write_through: bool,
    pub(crate) sorted: bool,
    pub(crate) deprecated: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, index: u8, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            index,
            field_type,
            default: None,
            required: false,
            key: false,
            write_through: false,
            sorted: false,
            deprecated: false,
        }
    }

    /// The value of an absent scalar field. Scalars equal to it are not written.
    pub fn with_default(mut self, default: impl Into<ScalarValue>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// The field must be present in every buffer.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// The field is the sort key of the table in sorted and indexed vectors.
    pub fn key(mut self) -> Self {
        self.key = true;
        self
    }

    /// Mutations through a lazily or progressively parsed object are written into the buffer.
    pub fn write_through(mut self) -> Self {
        self.write_through = true;
        self
    }

    /// Vector elements are sorted by key when written.
    pub fn sorted(mut self) -> Self {
        self.sorted = true;
        self
    }

    /// The field is never written and always reads as absent.
    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }
}

/// A table declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub(crate) name: String,
    pub(crate) fields: Vec<FieldDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }
}

/// The type of a struct field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructFieldType {
    Scalar(ScalarType),
    Struct(String),
}

/// A struct field declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructFieldDef {
    pub(crate) name: String,
    pub(crate) field_type: StructFieldType,
}

impl StructFieldDef {
    pub fn new(name: impl Into<String>, field_type: StructFieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }

    pub fn scalar(name: impl Into<String>, scalar_type: ScalarType) -> Self {
        Self::new(name, StructFieldType::Scalar(scalar_type))
    }
}

/// A struct declaration. Fields are laid out in declaration order with C alignment rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDef {
    pub(crate) name: String,
    pub(crate) fields: Vec<StructFieldDef>,
}

impl StructDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: StructFieldDef) -> Self {
        self.fields.push(field);
        self
    }
}

/// The type of a union member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnionMemberType {
    Table(String),
    /// A struct stored out of line.
    Struct(String),
    String,
}

/// A union declaration. Tag 0 is reserved for "none".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnionDef {
    pub(crate) name: String,
    pub(crate) members: Vec<(u8, UnionMemberType)>,
}

impl UnionDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn member(mut self, tag: u8, member: UnionMemberType) -> Self {
        self.members.push((tag, member));
        self
    }
}
