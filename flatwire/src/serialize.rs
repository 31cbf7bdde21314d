//! Writing values into a FlatBuffer, and bounding the space that takes.
//!
//! The writer walks a [`Value`] against the schema front to back. A table is written as its
//! soffset and inline fields, then its vtable, then the objects its fields refer to, so every
//! uoffset in the output points forward.

use std::sync::Arc;

use flatwire_buffer::{Alignment, MAX_SCALAR_SIZE, ScalarType};
use flatwire_error::{FlatResult, flat_bail, flat_err};

use crate::codec::{FILE_IDENTIFIER_LENGTH, SIZE_OF_UOFFSET, SerializationContext};
use crate::schema::{
    ElementKind, FieldKind, FieldLayout, Schema, StructFieldKind, StructId, TableId, UnionId,
    UnionMemberKind, VectorKind, VectorLayout,
};
use crate::shared_string::SharedStringWriter;
use crate::value::{ScalarValue, SortKey, StructValue, TableValue, UnionValue, Value};

/// The most padding a single allocation can need: scalars and structs are at most 8-byte aligned.
const ALLOCATION_SLACK: usize = 7;

const UOFFSET_ALIGNMENT: Alignment = Alignment::new(SIZE_OF_UOFFSET);

pub(crate) struct Writer<'s, 'b> {
    schema: &'s Schema,
    ctx: SerializationContext<'b>,
    strings: Option<Box<dyn SharedStringWriter>>,
    force_defaults: bool,
}

impl<'s, 'b> Writer<'s, 'b> {
    pub(crate) fn new(
        schema: &'s Schema,
        ctx: SerializationContext<'b>,
        strings: Option<Box<dyn SharedStringWriter>>,
        force_defaults: bool,
    ) -> Self {
        Self {
            schema,
            ctx,
            strings,
            force_defaults,
        }
    }

    /// Write a complete buffer rooted at a table of type `root`, returning its length.
    pub(crate) fn write_root(mut self, root: TableId, value: &TableValue) -> FlatResult<usize> {
        let root_position = self.ctx.allocate(SIZE_OF_UOFFSET, UOFFSET_ALIGNMENT)?;
        if let Some(identifier) = self.schema.file_identifier() {
            let position = self
                .ctx
                .allocate(FILE_IDENTIFIER_LENGTH, Alignment::none())?;
            self.ctx.write_bytes(position, identifier)?;
        }
        let table = self.write_table(root, value)?;
        self.ctx.write_uoffset(root_position, table)?;
        if let Some(strings) = self.strings.as_mut() {
            strings.flush(&mut self.ctx)?;
        }
        Ok(self.ctx.offset())
    }

    fn write_table(&mut self, id: TableId, value: &TableValue) -> FlatResult<usize> {
        let schema = self.schema;
        let layout = schema.table(id);
        for (index, _) in value.iter() {
            layout.field(index)?;
        }

        let start = self.ctx.allocate(SIZE_OF_UOFFSET, UOFFSET_ALIGNMENT)?;
        let mut slots = vec![0u16; layout.slot_count()];
        let mut deferred: Vec<(usize, &FieldLayout, &Value)> = Vec::new();
        for field in layout.fields() {
            if field.is_deprecated() {
                continue;
            }
            let Some(field_value) = value.get(field.index()) else {
                if field.is_required() {
                    flat_bail!(
                        "required field {} of table {} is missing",
                        field.name(),
                        layout.name()
                    );
                }
                continue;
            };
            let slot = usize::from(field.index());
            match field.kind() {
                FieldKind::Scalar(scalar_type) => {
                    let scalar = field_value.as_scalar()?.cast(*scalar_type)?;
                    if !self.force_defaults && field.default_scalar() == Some(scalar) {
                        continue;
                    }
                    let position = self
                        .ctx
                        .allocate(field.inline_size(), field.inline_alignment())?;
                    self.write_scalar(position, scalar)?;
                    slots[slot] = relative(start, position)?;
                }
                FieldKind::Struct(struct_id) => {
                    let position = self
                        .ctx
                        .allocate(field.inline_size(), field.inline_alignment())?;
                    self.write_struct(*struct_id, field_value.as_struct()?, position)?;
                    slots[slot] = relative(start, position)?;
                }
                FieldKind::Union(union_id) => {
                    let union = field_value.as_union()?;
                    if union.tag() == 0 {
                        continue;
                    }
                    if schema.union_layout(*union_id).member(union.tag()).is_none() {
                        flat_bail!(
                            "tag {} is not a member of union {}",
                            union.tag(),
                            schema.union_layout(*union_id).name()
                        );
                    }
                    let tag_position = self.ctx.allocate(1, Alignment::none())?;
                    self.ctx.write_scalar(tag_position, union.tag())?;
                    slots[slot] = relative(start, tag_position)?;
                    let position = self.ctx.allocate(SIZE_OF_UOFFSET, UOFFSET_ALIGNMENT)?;
                    slots[slot + 1] = relative(start, position)?;
                    deferred.push((position, field, field_value));
                }
                FieldKind::String { .. } | FieldKind::Table(_) | FieldKind::Vector(_) => {
                    let position = self.ctx.allocate(SIZE_OF_UOFFSET, UOFFSET_ALIGNMENT)?;
                    slots[slot] = relative(start, position)?;
                    deferred.push((position, field, field_value));
                }
            }
        }

        let table_length = relative(start, self.ctx.offset())?;
        let used = slots.iter().rposition(|&slot| slot != 0).map_or(0, |last| last + 1);
        let vtable_length = u16::try_from(4 + 2 * used)
            .map_err(|_| flat_err!("vtable of {} slots is too long", used))?;
        let mut vtable = Vec::with_capacity(usize::from(vtable_length));
        vtable.extend_from_slice(&vtable_length.to_le_bytes());
        vtable.extend_from_slice(&table_length.to_le_bytes());
        for slot in &slots[..used] {
            vtable.extend_from_slice(&slot.to_le_bytes());
        }
        let vtable_offset = self.ctx.write_vtable(&vtable)?;
        self.ctx.write_soffset(start, vtable_offset)?;

        for (position, field, field_value) in deferred {
            self.write_reference(position, field, field_value)?;
        }
        Ok(start)
    }

    fn write_reference(
        &mut self,
        position: usize,
        field: &FieldLayout,
        value: &Value,
    ) -> FlatResult<()> {
        match field.kind() {
            FieldKind::String { shared } => self.write_string(position, value.as_str()?, *shared),
            FieldKind::Table(id) => {
                let table = self.write_table(*id, value.as_table()?)?;
                self.ctx.write_uoffset(position, table)
            }
            FieldKind::Vector(layout) => {
                let vector = self.write_vector(layout, field.is_sorted(), value)?;
                self.ctx.write_uoffset(position, vector)
            }
            FieldKind::Union(id) => self.write_union(position, *id, value.as_union()?),
            kind => flat_bail!(InvalidOperation: "{} fields are stored inline", kind),
        }
    }

    fn write_union(
        &mut self,
        position: usize,
        id: UnionId,
        value: &UnionValue,
    ) -> FlatResult<()> {
        let schema = self.schema;
        let member = schema
            .union_layout(id)
            .member(value.tag())
            .ok_or_else(|| flat_err!("tag {} is not a member of its union", value.tag()))?;
        match member.kind() {
            UnionMemberKind::Table(table_id) => {
                let table = self.write_table(table_id, value.value().as_table()?)?;
                self.ctx.write_uoffset(position, table)
            }
            UnionMemberKind::Struct(struct_id) => {
                let layout = schema.struct_layout(struct_id);
                let target = self.ctx.allocate(layout.size(), layout.alignment())?;
                self.write_struct(struct_id, value.value().as_struct()?, target)?;
                self.ctx.write_uoffset(position, target)
            }
            UnionMemberKind::String => self.write_string(position, value.value().as_str()?, false),
        }
    }

    fn write_string(&mut self, position: usize, value: &Arc<str>, shared: bool) -> FlatResult<()> {
        match self.strings.as_mut() {
            Some(strings) if shared => strings.write(&mut self.ctx, position, value),
            _ => {
                let target = self.ctx.write_string(value)?;
                self.ctx.write_uoffset(position, target)
            }
        }
    }

    fn write_vector(
        &mut self,
        layout: &VectorLayout,
        sorted: bool,
        value: &Value,
    ) -> FlatResult<usize> {
        if let Value::Bytes(bytes) = value {
            if *layout.element() != ElementKind::Scalar(ScalarType::U8) {
                flat_bail!(MismatchedTypes: "vector of non-byte elements", "bytes");
            }
            let start = self.ctx.allocate_vector(bytes.len(), 1, Alignment::none())?;
            self.ctx.write_bytes(start + SIZE_OF_UOFFSET, bytes)?;
            return Ok(start);
        }
        let Value::Vector(items) = value else {
            flat_bail!(MismatchedTypes: "vector", value.kind_name());
        };

        let order = match layout.element() {
            ElementKind::Table(table_id) if sorted => {
                sorted_order(self.schema, *table_id, layout.kind(), items)?
            }
            _ => (0..items.len()).collect(),
        };

        let start = self
            .ctx
            .allocate_vector(items.len(), layout.stride(), layout.alignment())?;
        let data = start + SIZE_OF_UOFFSET;
        for (i, item) in order.into_iter().map(|item| &items[item]).enumerate() {
            let position = data + i * layout.stride();
            match layout.element() {
                ElementKind::Scalar(scalar_type) => {
                    self.write_scalar(position, item.as_scalar()?.cast(*scalar_type)?)?
                }
                ElementKind::Struct(struct_id) => {
                    self.write_struct(*struct_id, item.as_struct()?, position)?
                }
                ElementKind::String { shared } => {
                    self.write_string(position, item.as_str()?, *shared)?
                }
                ElementKind::Table(table_id) => {
                    let table = self.write_table(*table_id, item.as_table()?)?;
                    self.ctx.write_uoffset(position, table)?;
                }
            }
        }
        Ok(start)
    }

    fn write_scalar(&mut self, position: usize, value: ScalarValue) -> FlatResult<()> {
        let mut raw = [0u8; MAX_SCALAR_SIZE];
        let raw = &mut raw[..value.scalar_type().byte_width()];
        value.write_le_slice(raw)?;
        self.ctx.write_bytes(position, raw)
    }

    fn write_struct(
        &mut self,
        id: StructId,
        value: &StructValue,
        position: usize,
    ) -> FlatResult<()> {
        let bytes = encode_struct(self.schema, id, value)?;
        self.ctx.write_bytes(position, &bytes)
    }
}

/// The order in which the elements of a sorted vector of tables are written: stable by key.
fn sorted_order(
    schema: &Schema,
    table: TableId,
    kind: VectorKind,
    items: &[Value],
) -> FlatResult<Vec<usize>> {
    let keys = items
        .iter()
        .map(|item| table_key(schema, table, item.as_table()?))
        .collect::<FlatResult<Vec<_>>>()?;
    let mut order = (0..items.len()).collect::<Vec<_>>();
    order.sort_by(|a, b| keys[*a].cmp(&keys[*b]));
    if kind == VectorKind::Indexed {
        if let Some(pair) = order.windows(2).find(|pair| keys[pair[0]] == keys[pair[1]]) {
            flat_bail!("duplicate key {} in indexed vector", keys[pair[0]]);
        }
    }
    Ok(order)
}

/// The sort key of a table value, falling back to the default of an absent scalar key.
pub(crate) fn table_key(schema: &Schema, table: TableId, value: &TableValue) -> FlatResult<SortKey> {
    let layout = schema.table(table);
    let key = layout
        .key()
        .ok_or_else(|| flat_err!(InvalidOperation: "table {} has no key", layout.name()))?;
    match (key.kind(), value.get(key.index())) {
        (FieldKind::Scalar(scalar_type), Some(field)) => {
            Ok(SortKey::from_scalar(field.as_scalar()?.cast(*scalar_type)?))
        }
        (FieldKind::String { .. }, Some(field)) => Ok(SortKey::String(field.as_str()?.clone())),
        (_, None) => key
            .default_scalar()
            .map(SortKey::from_scalar)
            .ok_or_else(|| flat_err!("key {} of table {} is missing", key.name(), layout.name())),
        (kind, Some(_)) => flat_bail!(InvalidSchema: "{} cannot be a key", kind),
    }
}

/// Encode a struct value into its fixed-size wire layout.
pub(crate) fn encode_struct(schema: &Schema, id: StructId, value: &StructValue) -> FlatResult<Vec<u8>> {
    let mut bytes = vec![0u8; schema.struct_layout(id).size()];
    encode_struct_into(schema, id, value, &mut bytes)?;
    Ok(bytes)
}

fn encode_struct_into(
    schema: &Schema,
    id: StructId,
    value: &StructValue,
    dst: &mut [u8],
) -> FlatResult<()> {
    let layout = schema.struct_layout(id);
    if value.len() != layout.fields().len() {
        flat_bail!(
            "struct {} has {} fields but the value has {}",
            layout.name(),
            layout.fields().len(),
            value.len()
        );
    }
    for (field, field_value) in layout.fields().iter().zip(value.fields()) {
        match field.kind() {
            StructFieldKind::Scalar(scalar_type) => {
                let end = field.offset() + scalar_type.byte_width();
                field_value
                    .as_scalar()?
                    .cast(scalar_type)?
                    .write_le_slice(&mut dst[field.offset()..end])?;
            }
            StructFieldKind::Struct(nested) => {
                let end = field.offset() + schema.struct_layout(nested).size();
                encode_struct_into(
                    schema,
                    nested,
                    field_value.as_struct()?,
                    &mut dst[field.offset()..end],
                )?;
            }
        }
    }
    Ok(())
}

fn relative(start: usize, position: usize) -> FlatResult<u16> {
    u16::try_from(position - start)
        .map_err(|_| flat_err!("table at {} is larger than 64KiB", start))
}

/// An upper bound on the number of bytes [`Writer::write_root`] needs for `value`.
pub(crate) fn max_size(schema: &Schema, root: TableId, value: &TableValue) -> FlatResult<usize> {
    Ok(SIZE_OF_UOFFSET + FILE_IDENTIFIER_LENGTH + table_max_size(schema, root, value)?)
}

fn table_max_size(schema: &Schema, id: TableId, value: &TableValue) -> FlatResult<usize> {
    let layout = schema.table(id);
    // soffset, then the vtable
    let mut size = SIZE_OF_UOFFSET + ALLOCATION_SLACK + 4 + 2 * layout.slot_count() + ALLOCATION_SLACK;
    for (index, field_value) in value.iter() {
        let field = layout.field(index)?;
        size += field.inline_size() + ALLOCATION_SLACK;
        size += match field.kind() {
            FieldKind::Scalar(_) | FieldKind::Struct(_) => 0,
            FieldKind::String { .. } => string_max_size(field_value.as_str()?),
            FieldKind::Table(table) => table_max_size(schema, *table, field_value.as_table()?)?,
            FieldKind::Vector(vector) => vector_max_size(schema, vector, field_value)?,
            FieldKind::Union(union) => {
                let union_value = field_value.as_union()?;
                SIZE_OF_UOFFSET
                    + ALLOCATION_SLACK
                    + match schema.union_layout(*union).member(union_value.tag()) {
                        None => 0,
                        Some(member) => match member.kind() {
                            UnionMemberKind::Table(table) => {
                                table_max_size(schema, table, union_value.value().as_table()?)?
                            }
                            UnionMemberKind::Struct(id) => {
                                schema.struct_layout(id).size() + ALLOCATION_SLACK
                            }
                            UnionMemberKind::String => {
                                string_max_size(union_value.value().as_str()?)
                            }
                        },
                    }
            }
        };
    }
    Ok(size)
}

fn string_max_size(value: &str) -> usize {
    SIZE_OF_UOFFSET + value.len() + 1 + ALLOCATION_SLACK
}

fn vector_max_size(schema: &Schema, layout: &VectorLayout, value: &Value) -> FlatResult<usize> {
    let items = match value {
        Value::Bytes(bytes) => return Ok(SIZE_OF_UOFFSET + bytes.len() + ALLOCATION_SLACK),
        Value::Vector(items) => items,
        other => flat_bail!(MismatchedTypes: "vector", other.kind_name()),
    };
    let header = SIZE_OF_UOFFSET + ALLOCATION_SLACK + items.len() * layout.stride();
    Ok(match layout.element() {
        ElementKind::Scalar(_) | ElementKind::Struct(_) => header,
        ElementKind::String { .. } => items
            .iter()
            .map(|item| item.as_str().map(|s| string_max_size(s)))
            .sum::<FlatResult<usize>>()?
            + header,
        ElementKind::Table(table) => items
            .iter()
            .map(|item| table_max_size(schema, *table, item.as_table()?))
            .sum::<FlatResult<usize>>()?
            + header,
    })
}
