use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;
use std::sync::Arc;

use flatwire_buffer::{InputBuffer, InputBufferExt, Scalar};
use flatwire_error::{FlatError, FlatResult, flat_bail, flat_err};

use super::{
    FieldValue, ParseContext, StructRef, UnionRef, Vector, field_from_value, read_element,
    read_reference, write_scalar_value,
};
use crate::codec::SIZE_OF_UOFFSET;
use crate::options::DeserializationMode;
use crate::schema::{ElementKind, FieldKind, FieldLayout, TableId, TableLayout, UnionId};
use crate::serialize::encode_struct;
use crate::value::{ScalarValue, SortKey, TableValue, Value};
use crate::vtable::AnyVTable;

/// A parsed table.
///
/// Cloning the handle is cheap and clones share state: a field cached or mutated through one
/// clone is visible through every other.
pub struct Table<B>(Rc<TableInner<B>>);

struct TableInner<B> {
    ctx: Rc<ParseContext>,
    id: TableId,
    state: TableState<B>,
}

/// One decoded slot per field, in [`TableLayout::fields`] order. The outer `None` marks a field
/// that has not been read yet.
type FieldCache<B> = RefCell<Vec<Option<Option<FieldValue<B>>>>>;

enum TableState<B> {
    Lazy(BufferedTable<B>),
    Progressive(BufferedTable<B>, FieldCache<B>),
    Greedy(RefCell<BTreeMap<u8, FieldValue<B>>>),
}

struct BufferedTable<B> {
    buffer: B,
    offset: usize,
    vtable: AnyVTable,
}

impl<B> Clone for Table<B> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<B> Table<B> {
    /// The schema id of the table type.
    pub fn id(&self) -> TableId {
        self.0.id
    }

    /// The resolved layout of the table type.
    pub fn layout(&self) -> &TableLayout {
        self.0.ctx.schema().table(self.0.id)
    }

    /// The mode this table was parsed in.
    pub fn mode(&self) -> DeserializationMode {
        self.0.ctx.mode()
    }

    /// The buffer the table reads from. Greedy tables hold no buffer.
    pub fn buffer(&self) -> Option<&B> {
        match &self.0.state {
            TableState::Lazy(table) | TableState::Progressive(table, _) => Some(&table.buffer),
            TableState::Greedy(_) => None,
        }
    }

    /// Returns true if both handles refer to the same parsed table.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn field_at(&self, index: u8) -> FlatResult<(usize, &FieldLayout)> {
        let layout = self.layout();
        let position = layout.position(index).ok_or_else(
            || flat_err!(InvalidArgument: "table {} has no field {}", layout.name(), index),
        )?;
        Ok((position, &layout.fields()[position]))
    }
}

impl<B: InputBuffer + Clone> Table<B> {
    pub(crate) fn buffered(
        ctx: Rc<ParseContext>,
        id: TableId,
        buffer: B,
        offset: usize,
    ) -> FlatResult<Self> {
        let layout = ctx.schema().table(id);
        let vtable = AnyVTable::create(layout.vtable_kind(), &buffer, offset)?;
        let table = BufferedTable {
            buffer,
            offset,
            vtable,
        };
        let state = match ctx.mode() {
            DeserializationMode::Progressive => {
                let cache = (0..layout.fields().len()).map(|_| None).collect();
                TableState::Progressive(table, RefCell::new(cache))
            }
            _ => TableState::Lazy(table),
        };
        Ok(Self(Rc::new(TableInner { ctx, id, state })))
    }

    pub(crate) fn from_value(
        ctx: Rc<ParseContext>,
        id: TableId,
        value: &TableValue,
    ) -> FlatResult<Self> {
        let layout = ctx.schema().table(id);
        let mut fields = BTreeMap::new();
        for (index, field_value) in value.iter() {
            let field = layout.field(index)?;
            if field.is_deprecated() || matches!(field_value, Value::Union(u) if u.tag() == 0) {
                continue;
            }
            fields.insert(index, field_from_value(&ctx, field, field_value)?);
        }
        Ok(Self(Rc::new(TableInner {
            ctx,
            id,
            state: TableState::Greedy(RefCell::new(fields)),
        })))
    }

    /// The field declared at `index`, or `None` if it is absent.
    ///
    /// Absent scalars read as `None` here, see [`Table::get_or_default`].
    pub fn get(&self, index: u8) -> FlatResult<Option<FieldValue<B>>> {
        let (position, field) = self.field_at(index)?;
        if field.is_deprecated() {
            return Ok(None);
        }
        let ctx = &self.0.ctx;
        match &self.0.state {
            TableState::Lazy(table) => table.read_field(ctx, field),
            TableState::Progressive(table, cache) => {
                if let Some(cached) = &cache.borrow()[position] {
                    return Ok(cached.clone());
                }
                let value = table.read_field(ctx, field)?;
                cache.borrow_mut()[position] = Some(value.clone());
                Ok(value)
            }
            TableState::Greedy(fields) => Ok(fields.borrow().get(&index).cloned()),
        }
    }

    /// Like [`Table::get`], but absent scalar fields read as their default.
    pub fn get_or_default(&self, index: u8) -> FlatResult<Option<FieldValue<B>>> {
        match self.get(index)? {
            Some(value) => Ok(Some(value)),
            None => Ok(self.field_at(index)?.1.default_scalar().map(FieldValue::Scalar)),
        }
    }

    /// Returns true if the field is stored in the table.
    pub fn is_present(&self, index: u8) -> FlatResult<bool> {
        let (_, field) = self.field_at(index)?;
        if field.is_deprecated() {
            return Ok(false);
        }
        match &self.0.state {
            TableState::Lazy(table) | TableState::Progressive(table, _) => {
                let offset = table
                    .vtable
                    .offset_of(&table.buffer, usize::from(index))?;
                Ok(offset != 0)
            }
            TableState::Greedy(fields) => Ok(fields.borrow().contains_key(&index)),
        }
    }

    /// The scalar field at `index` converted to `T`, or its default if absent.
    pub fn scalar<T: Scalar + TryFrom<ScalarValue, Error = FlatError>>(
        &self,
        index: u8,
    ) -> FlatResult<T> {
        match self.get_or_default(index)? {
            Some(value) => value.as_scalar()?.cast(T::SCALAR_TYPE)?.as_primitive(),
            None => flat_bail!(MismatchedTypes: "scalar", self.field_at(index)?.1.kind()),
        }
    }

    /// The string field at `index`, or `None` if it is absent.
    ///
    /// Shared strings come from the reader cache of the parse when one is configured.
    pub fn string(&self, index: u8) -> FlatResult<Option<Arc<str>>> {
        self.get(index)?.map(|v| v.as_str().cloned()).transpose()
    }

    /// The table field at `index`, or `None` if it is absent.
    pub fn table(&self, index: u8) -> FlatResult<Option<Table<B>>> {
        self.get(index)?.map(|v| v.as_table().cloned()).transpose()
    }

    /// The vector field at `index`, or `None` if it is absent.
    pub fn vector(&self, index: u8) -> FlatResult<Option<Vector<B>>> {
        self.get(index)?.map(|v| v.as_vector().cloned()).transpose()
    }

    /// The struct field at `index`, or `None` if it is absent.
    pub fn struct_ref(&self, index: u8) -> FlatResult<Option<StructRef<B>>> {
        self.get(index)?.map(|v| v.as_struct().cloned()).transpose()
    }

    /// The union field whose tag sits in slot `index`, or `None` if it is absent. Tag 0 is
    /// absent.
    pub fn union(&self, index: u8) -> FlatResult<Option<UnionRef<B>>> {
        self.get(index)?.map(|v| v.as_union().cloned()).transpose()
    }

    /// Replace the field at `index`.
    ///
    /// Greedy-mutable tables store a buffer-free copy of `value`. Buffer-backed tables write
    /// scalar and struct fields that declare write-through in place, which requires the field to
    /// be present in the buffer. Every other table fails with a not-mutable error.
    pub fn set(&self, index: u8, value: impl Into<FieldValue<B>>) -> FlatResult<()> {
        let value = value.into();
        let (position, field) = self.field_at(index)?;
        let ctx = &self.0.ctx;
        match &self.0.state {
            TableState::Greedy(fields) => {
                self.check_mutable()?;
                if field.is_deprecated() {
                    flat_bail!(InvalidOperation: "field {} of table {} is deprecated", field.name(), self.layout().name());
                }
                let value = field_from_value(ctx, field, &value.to_value()?)?;
                fields.borrow_mut().insert(index, value);
                Ok(())
            }
            TableState::Lazy(table) => table.write_through(ctx, field, &value),
            TableState::Progressive(table, cache) => {
                table.write_through(ctx, field, &value)?;
                // Struct handles read the buffer on every access, scalars are cached by value.
                if matches!(field.kind(), FieldKind::Scalar(_)) {
                    cache.borrow_mut()[position] = None;
                }
                Ok(())
            }
        }
    }

    /// Set the field at `index` from a buffer-free value.
    pub fn set_value(&self, index: u8, value: &Value) -> FlatResult<()> {
        let (_, field) = self.field_at(index)?;
        let value = field_from_value(&self.0.ctx, field, value)?;
        self.set(index, value)
    }

    /// Remove the field at `index` from a greedy-mutable table.
    pub fn clear(&self, index: u8) -> FlatResult<()> {
        let (_, field) = self.field_at(index)?;
        let TableState::Greedy(fields) = &self.0.state else {
            flat_bail!(NotMutable: "fields of buffer-backed tables cannot be removed");
        };
        self.check_mutable()?;
        if field.is_required() {
            flat_bail!(InvalidOperation: "required field {} cannot be removed", field.name());
        }
        fields.borrow_mut().remove(&index);
        Ok(())
    }

    fn check_mutable(&self) -> FlatResult<()> {
        if !self.mode().is_mutable() {
            flat_bail!(NotMutable: "table {} was parsed in {} mode", self.layout().name(), self.mode());
        }
        Ok(())
    }

    /// The key of a table whose type declares one.
    pub fn key(&self) -> FlatResult<SortKey> {
        let layout = self.layout();
        let key = layout
            .key()
            .ok_or_else(|| flat_err!(InvalidOperation: "table {} has no key", layout.name()))?;
        match self.get_or_default(key.index())? {
            Some(FieldValue::Scalar(value)) => Ok(SortKey::from_scalar(value)),
            Some(FieldValue::String(value)) => Ok(SortKey::String(value)),
            Some(other) => flat_bail!(MismatchedTypes: "scalar or string key", other.kind_name()),
            None => flat_bail!(InvalidFormat: "key {} of table {} is missing", key.name(), layout.name()),
        }
    }

    /// A buffer-free copy of the table.
    pub fn to_value(&self) -> FlatResult<Value> {
        let mut value = TableValue::new();
        match &self.0.state {
            TableState::Greedy(fields) => {
                for (index, field) in fields.borrow().iter() {
                    value.set(*index, field.to_value()?);
                }
            }
            TableState::Lazy(_) | TableState::Progressive(..) => {
                for field in self.layout().fields() {
                    if let Some(field_value) = self.get(field.index())? {
                        value.set(field.index(), field_value.to_value()?);
                    }
                }
            }
        }
        Ok(Value::Table(value))
    }

    /// Copy the table out of its buffer into a greedy table, mutable if `mutable` is set.
    pub fn detach(&self, mutable: bool) -> FlatResult<Self> {
        let mode = if mutable {
            DeserializationMode::GreedyMutable
        } else {
            DeserializationMode::Greedy
        };
        let ctx = self.0.ctx.with_mode(mode);
        Self::from_value(ctx, self.0.id, self.to_value()?.as_table()?)
    }
}

impl<B: InputBuffer + Clone> BufferedTable<B> {
    /// The absolute offset of slot `slot`, if present.
    fn slot_position(&self, slot: usize, size: usize) -> FlatResult<Option<usize>> {
        Ok(self
            .vtable
            .field_offset(&self.buffer, slot, size)?
            .map(|offset| self.offset + offset))
    }

    fn read_field(
        &self,
        ctx: &Rc<ParseContext>,
        field: &FieldLayout,
    ) -> FlatResult<Option<FieldValue<B>>> {
        if let FieldKind::Union(id) = field.kind() {
            return self.read_union(ctx, *id, usize::from(field.index()));
        }
        let Some(position) = self.inline_position(field)? else {
            return Ok(None);
        };
        let write_through = ctx.writes_through(field.is_write_through());
        let element = match field.kind() {
            FieldKind::Scalar(scalar_type) => ElementKind::Scalar(*scalar_type),
            FieldKind::String { shared } => ElementKind::String { shared: *shared },
            FieldKind::Struct(id) => ElementKind::Struct(*id),
            FieldKind::Table(id) => ElementKind::Table(*id),
            FieldKind::Vector(layout) => {
                let target = read_reference(&self.buffer, position)?;
                return Ok(Some(FieldValue::Vector(Vector::buffered(
                    ctx.clone(),
                    layout,
                    field.is_sorted(),
                    write_through,
                    self.buffer.clone(),
                    target,
                )?)));
            }
            FieldKind::Union(_) => {
                flat_bail!(InvalidOperation: "union {} has no single inline value", field.name())
            }
        };
        read_element(ctx, &self.buffer, position, element, write_through).map(Some)
    }

    /// The absolute offset of the inline value of `field`, checked for alignment.
    fn inline_position(&self, field: &FieldLayout) -> FlatResult<Option<usize>> {
        let position = self.slot_position(usize::from(field.index()), field.inline_size())?;
        if let Some(position) = position {
            if !field.inline_alignment().is_offset_aligned(position) {
                flat_bail!(
                    InvalidFormat: "field {} at offset {} is not aligned to {}",
                    field.name(),
                    position,
                    field.inline_alignment()
                );
            }
        }
        Ok(position)
    }

    fn read_union(
        &self,
        ctx: &Rc<ParseContext>,
        id: UnionId,
        slot: usize,
    ) -> FlatResult<Option<FieldValue<B>>> {
        let tag = self.slot_position(slot, 1)?;
        let value = self.slot_position(slot + 1, SIZE_OF_UOFFSET)?;
        match (tag, value) {
            (None, None) => Ok(None),
            (Some(tag), Some(value)) => {
                let tag = self.buffer.read_u8(tag)?;
                let target = read_reference(&self.buffer, value)?;
                Ok(Some(FieldValue::Union(UnionRef::buffered(
                    ctx,
                    id,
                    tag,
                    &self.buffer,
                    target,
                )?)))
            }
            _ => flat_bail!(
                InvalidFormat: "union in slot {} of the table at {} stores only one of its tag and value",
                slot,
                self.offset
            ),
        }
    }

    fn write_through(
        &self,
        ctx: &ParseContext,
        field: &FieldLayout,
        value: &FieldValue<B>,
    ) -> FlatResult<()> {
        if !ctx.writes_through(field.is_write_through()) {
            flat_bail!(
                NotMutable: "field {} of a table parsed in {} mode is read-only",
                field.name(),
                ctx.mode()
            );
        }
        let Some(position) = self.inline_position(field)? else {
            flat_bail!(
                InvalidOperation: "field {} is absent from the buffer and cannot be written in place",
                field.name()
            );
        };
        match field.kind() {
            FieldKind::Scalar(scalar_type) => {
                write_scalar_value(&self.buffer, position, value.as_scalar()?.cast(*scalar_type)?)
            }
            FieldKind::Struct(id) => {
                let bytes = encode_struct(ctx.schema(), *id, value.as_struct()?.to_value()?.as_struct()?)?;
                self.buffer.write_from(position, &bytes)?;
                log::trace!("wrote struct {} through to offset {}", field.name(), position);
                Ok(())
            }
            kind => flat_bail!(NotMutable: "{} fields cannot be written through", kind),
        }
    }
}

impl<B> Debug for Table<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.layout().name())
            .field("mode", &self.mode())
            .field("buffered", &self.buffer().is_some())
            .finish()
    }
}
