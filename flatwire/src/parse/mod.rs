//! The deserialization strategy engine.
//!
//! Parsing produces cheap, reference-counted handles ([`Table`], [`Vector`], [`StructRef`],
//! [`UnionRef`]) whose behaviour is fixed by the [`DeserializationMode`] of the parse:
//!
//! * `Lazy` handles re-read the buffer on every access and hand out fresh handles each time.
//! * `Progressive` handles decode each field once and cache it, so repeated accesses return the
//!   same handle.
//! * `Greedy` and `GreedyMutable` handles are decoded in full at parse time and keep no
//!   reference to the buffer. Only `GreedyMutable` handles accept mutation.
//!
//! Buffer-backed handles can still be written through for fields that declare it, as long as
//! write-through is enabled in the options of the parse.

mod structs;
mod table;
mod union;
mod vector;

use std::fmt::{Debug, Formatter};
use std::rc::Rc;
use std::sync::Arc;

use flatwire_buffer::{ArrayInputBuffer, InputBuffer, MAX_SCALAR_SIZE, ScalarType};
use flatwire_error::{FlatResult, flat_bail};
pub use structs::*;
pub use table::*;
pub use union::*;
pub use vector::*;

use crate::codec::{SIZE_OF_UOFFSET, read_string, read_string_bytes, read_uoffset};
use crate::options::DeserializationMode;
use crate::schema::{ElementKind, FieldKind, FieldLayout, Schema, TableId};
use crate::shared_string::SharedStringReader;
use crate::value::{ScalarValue, Value};

static_assertions::assert_not_impl_any!(Table<ArrayInputBuffer>: Send, Sync);
static_assertions::assert_not_impl_any!(Vector<ArrayInputBuffer>: Send, Sync);

/// Everything a parsed handle needs to decode its children.
pub(crate) struct ParseContext {
    schema: Arc<Schema>,
    mode: DeserializationMode,
    write_through: bool,
    strings: Option<Rc<dyn SharedStringReader>>,
}

impl ParseContext {
    pub(crate) fn new(
        schema: Arc<Schema>,
        mode: DeserializationMode,
        write_through: bool,
        strings: Option<Rc<dyn SharedStringReader>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            schema,
            mode,
            write_through,
            strings,
        })
    }

    /// The same schema and string reader under another mode.
    fn with_mode(&self, mode: DeserializationMode) -> Rc<Self> {
        Rc::new(Self {
            schema: self.schema.clone(),
            mode,
            write_through: self.write_through && !mode.is_eager(),
            strings: self.strings.clone(),
        })
    }

    pub(crate) fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(crate) fn mode(&self) -> DeserializationMode {
        self.mode
    }

    /// Returns true if a field declaring write-through may be written through in this parse.
    fn writes_through(&self, declared: bool) -> bool {
        declared && self.write_through && !self.mode.is_eager()
    }

    fn read_string<B: InputBuffer>(
        &self,
        buffer: &B,
        offset: usize,
        shared: bool,
    ) -> FlatResult<Arc<str>> {
        match &self.strings {
            Some(strings) if shared => strings.read(offset, &read_string_bytes(buffer, offset)?),
            _ => read_string(buffer, offset),
        }
    }
}

/// Parse the buffer rooted at a table of type `root`.
pub(crate) fn parse_root<B: InputBuffer + Clone>(
    ctx: Rc<ParseContext>,
    root: TableId,
    buffer: B,
) -> FlatResult<Table<B>> {
    let offset = read_uoffset(&buffer, 0)?;
    if !ctx.mode.is_eager() {
        return Table::buffered(ctx, root, buffer, offset);
    }
    let lazy = Table::buffered(ctx.with_mode(DeserializationMode::Lazy), root, buffer, offset)?;
    Table::from_value(ctx, root, lazy.to_value()?.as_table()?)
}

/// A decoded field, vector element or union member.
pub enum FieldValue<B> {
    Scalar(ScalarValue),
    String(Arc<str>),
    Struct(StructRef<B>),
    Table(Table<B>),
    Vector(Vector<B>),
    Union(UnionRef<B>),
}

impl<B> Clone for FieldValue<B> {
    fn clone(&self) -> Self {
        match self {
            Self::Scalar(v) => Self::Scalar(*v),
            Self::String(v) => Self::String(v.clone()),
            Self::Struct(v) => Self::Struct(v.clone()),
            Self::Table(v) => Self::Table(v.clone()),
            Self::Vector(v) => Self::Vector(v.clone()),
            Self::Union(v) => Self::Union(v.clone()),
        }
    }
}

impl<B> FieldValue<B> {
    /// A short name of the variant for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::String(_) => "string",
            Self::Struct(_) => "struct",
            Self::Table(_) => "table",
            Self::Vector(_) => "vector",
            Self::Union(_) => "union",
        }
    }

    pub fn as_scalar(&self) -> FlatResult<ScalarValue> {
        match self {
            Self::Scalar(v) => Ok(*v),
            other => flat_bail!(MismatchedTypes: "scalar", other.kind_name()),
        }
    }

    pub fn as_str(&self) -> FlatResult<&Arc<str>> {
        match self {
            Self::String(v) => Ok(v),
            other => flat_bail!(MismatchedTypes: "string", other.kind_name()),
        }
    }

    pub fn as_struct(&self) -> FlatResult<&StructRef<B>> {
        match self {
            Self::Struct(v) => Ok(v),
            other => flat_bail!(MismatchedTypes: "struct", other.kind_name()),
        }
    }

    /// The table, or `MismatchedTypes` for any other variant.
    pub fn as_table(&self) -> FlatResult<&Table<B>> {
        match self {
            Self::Table(v) => Ok(v),
            other => flat_bail!(MismatchedTypes: "table", other.kind_name()),
        }
    }

    pub fn as_vector(&self) -> FlatResult<&Vector<B>> {
        match self {
            Self::Vector(v) => Ok(v),
            other => flat_bail!(MismatchedTypes: "vector", other.kind_name()),
        }
    }

    pub fn as_union(&self) -> FlatResult<&UnionRef<B>> {
        match self {
            Self::Union(v) => Ok(v),
            other => flat_bail!(MismatchedTypes: "union", other.kind_name()),
        }
    }

    /// Returns true if both values are the same decoded instance. Scalars are never identical.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String(s), Self::String(o)) => Arc::ptr_eq(s, o),
            (Self::Struct(s), Self::Struct(o)) => s.ptr_eq(o),
            (Self::Table(s), Self::Table(o)) => s.ptr_eq(o),
            (Self::Vector(s), Self::Vector(o)) => s.ptr_eq(o),
            (Self::Union(s), Self::Union(o)) => s.ptr_eq(o),
            _ => false,
        }
    }
}

impl<B: InputBuffer + Clone> FieldValue<B> {
    /// A buffer-free copy of the value.
    pub fn to_value(&self) -> FlatResult<Value> {
        Ok(match self {
            Self::Scalar(v) => Value::Scalar(*v),
            Self::String(v) => Value::String(v.clone()),
            Self::Struct(v) => v.to_value()?,
            Self::Table(v) => v.to_value()?,
            Self::Vector(v) => v.to_value()?,
            Self::Union(v) => v.to_value()?,
        })
    }
}

impl<B> Debug for FieldValue<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            Self::String(v) => f.debug_tuple("String").field(v).finish(),
            Self::Struct(v) => v.fmt(f),
            Self::Table(v) => v.fmt(f),
            Self::Vector(v) => v.fmt(f),
            Self::Union(v) => v.fmt(f),
        }
    }
}

impl<B> From<ScalarValue> for FieldValue<B> {
    fn from(value: ScalarValue) -> Self {
        Self::Scalar(value)
    }
}

impl<B> From<&str> for FieldValue<B> {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

impl<B> From<Arc<str>> for FieldValue<B> {
    fn from(value: Arc<str>) -> Self {
        Self::String(value)
    }
}

macro_rules! field_value_from {
    ($T:ty) => {
        impl<B> From<$T> for FieldValue<B> {
            fn from(value: $T) -> Self {
                Self::Scalar(ScalarValue::from(value))
            }
        }
    };
    ($T:ty, $variant:ident) => {
        impl<B> From<$T> for FieldValue<B> {
            fn from(value: $T) -> Self {
                Self::$variant(value)
            }
        }
    };
}

field_value_from!(bool);
field_value_from!(u8);
field_value_from!(i8);
field_value_from!(u16);
field_value_from!(i16);
field_value_from!(u32);
field_value_from!(i32);
field_value_from!(u64);
field_value_from!(i64);
field_value_from!(f32);
field_value_from!(f64);
field_value_from!(StructRef<B>, Struct);
field_value_from!(Table<B>, Table);
field_value_from!(Vector<B>, Vector);
field_value_from!(UnionRef<B>, Union);

/// Decode a scalar of `scalar_type` at `offset`, which must be aligned to the scalar's width.
fn read_scalar_value<B: InputBuffer>(
    buffer: &B,
    offset: usize,
    scalar_type: ScalarType,
) -> FlatResult<ScalarValue> {
    if !scalar_type.alignment().is_offset_aligned(offset) {
        flat_bail!(InvalidFormat: "{} at offset {} is not aligned", scalar_type, offset);
    }
    let mut raw = [0u8; MAX_SCALAR_SIZE];
    let raw = &mut raw[..scalar_type.byte_width()];
    buffer.read_into(offset, raw)?;
    ScalarValue::from_le_slice(scalar_type, raw)
}

/// Store a scalar in place.
fn write_scalar_value<B: InputBuffer>(
    buffer: &B,
    offset: usize,
    value: ScalarValue,
) -> FlatResult<()> {
    let scalar_type = value.scalar_type();
    if !scalar_type.alignment().is_offset_aligned(offset) {
        flat_bail!(InvalidFormat: "{} at offset {} is not aligned", scalar_type, offset);
    }
    let mut raw = [0u8; MAX_SCALAR_SIZE];
    let raw = &mut raw[..scalar_type.byte_width()];
    value.write_le_slice(raw)?;
    buffer.write_from(offset, raw)?;
    log::trace!("wrote {} through to offset {}", value, offset);
    Ok(())
}

/// Resolve the uoffset stored at `position`.
fn read_reference<B: InputBuffer>(buffer: &B, position: usize) -> FlatResult<usize> {
    if position % SIZE_OF_UOFFSET != 0 {
        flat_bail!(InvalidFormat: "uoffset at offset {} is not 4-byte aligned", position);
    }
    read_uoffset(buffer, position)
}

/// Decode the element of type `element` stored inline at `position`.
fn read_element<B: InputBuffer + Clone>(
    ctx: &Rc<ParseContext>,
    buffer: &B,
    position: usize,
    element: ElementKind,
    write_through: bool,
) -> FlatResult<FieldValue<B>> {
    Ok(match element {
        ElementKind::Scalar(scalar_type) => {
            FieldValue::Scalar(read_scalar_value(buffer, position, scalar_type)?)
        }
        ElementKind::Struct(id) => FieldValue::Struct(StructRef::buffered(
            ctx.clone(),
            id,
            buffer.clone(),
            position,
            write_through,
        )?),
        ElementKind::String { shared } => {
            let target = read_reference(buffer, position)?;
            FieldValue::String(ctx.read_string(buffer, target, shared)?)
        }
        ElementKind::Table(id) => {
            let target = read_reference(buffer, position)?;
            FieldValue::Table(Table::buffered(ctx.clone(), id, buffer.clone(), target)?)
        }
    })
}

/// Build a buffer-free handle for a value of element type `element`.
fn element_from_value<B: InputBuffer + Clone>(
    ctx: &Rc<ParseContext>,
    element: ElementKind,
    value: &Value,
) -> FlatResult<FieldValue<B>> {
    Ok(match element {
        ElementKind::Scalar(scalar_type) => FieldValue::Scalar(value.as_scalar()?.cast(scalar_type)?),
        ElementKind::String { .. } => FieldValue::String(value.as_str()?.clone()),
        ElementKind::Struct(id) => {
            FieldValue::Struct(StructRef::from_value(ctx, id, value.as_struct()?)?)
        }
        ElementKind::Table(id) => {
            FieldValue::Table(Table::from_value(ctx.clone(), id, value.as_table()?)?)
        }
    })
}

/// Build a buffer-free handle for a value of `field`.
fn field_from_value<B: InputBuffer + Clone>(
    ctx: &Rc<ParseContext>,
    field: &FieldLayout,
    value: &Value,
) -> FlatResult<FieldValue<B>> {
    let element = match field.kind() {
        FieldKind::Scalar(scalar_type) => ElementKind::Scalar(*scalar_type),
        FieldKind::String { shared } => ElementKind::String { shared: *shared },
        FieldKind::Struct(id) => ElementKind::Struct(*id),
        FieldKind::Table(id) => ElementKind::Table(*id),
        FieldKind::Vector(layout) => {
            return Ok(FieldValue::Vector(Vector::from_value(
                ctx,
                layout,
                field.is_sorted(),
                value,
            )?));
        }
        FieldKind::Union(id) => {
            return Ok(FieldValue::Union(UnionRef::from_value(ctx, *id, value.as_union()?)?));
        }
    };
    element_from_value(ctx, element, value)
}
