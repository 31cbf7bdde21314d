//! Structural validation of untrusted buffers.
//!
//! The validator walks a buffer from its root through every reference the schema declares,
//! checking offsets, lengths, alignment and terminators without building any typed handle, and
//! the key order of sorted vectors. It stops at the first problem and reports it as a
//! [`ValidationError`]. A buffer that passes can be parsed in any mode without format errors.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::Range;
use std::sync::Arc;

use flatwire_buffer::Alignment;

use crate::codec::{FILE_IDENTIFIER_LENGTH, SIZE_OF_UOFFSET, vtable_field_count};
use crate::options::ValidatorOptions;
use crate::schema::{
    ElementKind, FieldKind, FieldLayout, Schema, StructId, TableId, UnionId, UnionMemberKind,
    VectorKind, VectorLayout,
};
use crate::value::{ScalarValue, SortKey};

const UOFFSET_ALIGNMENT: Alignment = Alignment::new(SIZE_OF_UOFFSET);

/// The category of a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationErrorCode {
    BufferTooSmall,
    FileIdentifierMismatch,
    InvalidUOffset,
    UOffsetInsideParent,
    OutOfBounds,
    Unaligned,
    InvalidVTableLength,
    FieldOutOfTable,
    VectorCountOverflow,
    StringOutOfBounds,
    StringMissingTerminator,
    InvalidUtf8,
    UnionMismatch,
    UnknownUnionTag,
    RequiredFieldMissing,
    DepthLimitExceeded,
    TableLimitExceeded,
    InvalidStructLayout,
    UnsortedVector,
    DuplicateKey,
}

impl Display for ValidationErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BufferTooSmall => "buffer_too_small",
            Self::FileIdentifierMismatch => "file_identifier_mismatch",
            Self::InvalidUOffset => "invalid_uoffset",
            Self::UOffsetInsideParent => "uoffset_inside_parent",
            Self::OutOfBounds => "out_of_bounds",
            Self::Unaligned => "unaligned",
            Self::InvalidVTableLength => "invalid_vtable_length",
            Self::FieldOutOfTable => "field_out_of_table",
            Self::VectorCountOverflow => "vector_count_overflow",
            Self::StringOutOfBounds => "string_out_of_bounds",
            Self::StringMissingTerminator => "string_missing_terminator",
            Self::InvalidUtf8 => "invalid_utf8",
            Self::UnionMismatch => "union_mismatch",
            Self::UnknownUnionTag => "unknown_union_tag",
            Self::RequiredFieldMissing => "required_field_missing",
            Self::DepthLimitExceeded => "depth_limit_exceeded",
            Self::TableLimitExceeded => "table_limit_exceeded",
            Self::InvalidStructLayout => "invalid_struct_layout",
            Self::UnsortedVector => "unsorted_vector",
            Self::DuplicateKey => "duplicate_key",
        };
        f.write_str(name)
    }
}

/// The first problem found in a buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ValidationError {
    code: ValidationErrorCode,
    message: String,
}

impl ValidationError {
    pub fn new(code: ValidationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ValidationErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The outcome of [`Validator::validate`].
pub type ValidationResult = Result<(), ValidationError>;

macro_rules! invalid {
    ($code:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {
        ValidationError::new(ValidationErrorCode::$code, format!($fmt $(, $arg)*))
    };
}

macro_rules! reject {
    ($($tt:tt)+) => {
        return Err(invalid!($($tt)+))
    };
}

/// Checks buffers rooted at one table of a schema.
#[derive(Debug, Clone, Copy)]
pub struct Validator<'s> {
    schema: &'s Schema,
    root: TableId,
    options: ValidatorOptions,
}

impl<'s> Validator<'s> {
    pub fn new(schema: &'s Schema, root: TableId, options: ValidatorOptions) -> Self {
        Self {
            schema,
            root,
            options,
        }
    }

    /// Validate `bytes`, returning the first problem found.
    pub fn validate(&self, bytes: &[u8]) -> ValidationResult {
        let result = Walk {
            schema: self.schema,
            bytes,
            options: self.options,
            tables: 0,
        }
        .root(self.root);
        if let Err(error) = &result {
            log::debug!("rejected buffer of {} bytes: {}", bytes.len(), error);
        }
        result
    }
}

/// The inline part of a table and the vtable describing it.
struct TableFrame {
    offset: usize,
    vtable: usize,
    vtable_length: u16,
    table_length: u16,
}

impl TableFrame {
    fn range(&self) -> Range<usize> {
        self.offset..self.offset + usize::from(self.table_length)
    }
}

struct Walk<'s, 'b> {
    schema: &'s Schema,
    bytes: &'b [u8],
    options: ValidatorOptions,
    tables: usize,
}

impl Walk<'_, '_> {
    fn root(&mut self, root: TableId) -> ValidationResult {
        let header = SIZE_OF_UOFFSET
            + self
                .schema
                .file_identifier()
                .map_or(0, |_| FILE_IDENTIFIER_LENGTH);
        // the root table needs at least its soffset
        let minimum = header + SIZE_OF_UOFFSET;
        if self.bytes.len() < minimum {
            reject!(
                BufferTooSmall: "buffer of {} bytes is shorter than the minimum of {}",
                self.bytes.len(),
                minimum
            );
        }
        if let Some(identifier) = self.schema.file_identifier() {
            let found = &self.bytes[SIZE_OF_UOFFSET..header];
            if found != identifier {
                reject!(
                    FileIdentifierMismatch: "expected file identifier {} but found {}",
                    String::from_utf8_lossy(identifier),
                    String::from_utf8_lossy(found)
                );
            }
        }
        let table = self.uoffset(0, 0..header)?;
        self.table(root, table, 1)
    }

    fn enter(&self, depth: usize) -> ValidationResult {
        if depth > self.options.max_depth {
            reject!(DepthLimitExceeded: "nesting exceeds the limit of {}", self.options.max_depth);
        }
        Ok(())
    }

    fn table(&mut self, id: TableId, offset: usize, depth: usize) -> ValidationResult {
        self.enter(depth)?;
        self.tables += 1;
        if self.tables > self.options.max_tables {
            reject!(TableLimitExceeded: "buffer holds more than {} tables", self.options.max_tables);
        }
        let frame = self.frame(offset)?;
        let schema = self.schema;
        for field in schema.table(id).fields() {
            if !field.is_deprecated() {
                self.field(&frame, field, depth)?;
            }
        }
        Ok(())
    }

    fn frame(&self, offset: usize) -> Result<TableFrame, ValidationError> {
        self.aligned(offset, UOFFSET_ALIGNMENT, "table")?;
        let soffset = i64::from(self.read_i32(offset)?);
        let vtable = i64::try_from(offset)
            .ok()
            .and_then(|table| table.checked_sub(soffset))
            .and_then(|vtable| usize::try_from(vtable).ok())
            .filter(|vtable| *vtable < self.bytes.len())
            .ok_or_else(|| {
                invalid!(OutOfBounds: "soffset {} of table at {} points outside the buffer", soffset, offset)
            })?;
        self.aligned(vtable, Alignment::of::<u16>(), "vtable")?;
        let vtable_length = self.read_u16(vtable)?;
        let table_length = self.read_u16(vtable + 2)?;
        if vtable_length < 4 || vtable_length % 2 != 0 {
            reject!(InvalidVTableLength: "vtable length {} at offset {}", vtable_length, vtable);
        }
        if table_length < 4 {
            reject!(
                InvalidVTableLength: "table length {} of table at {} is shorter than its soffset",
                table_length,
                offset
            );
        }
        self.range(vtable, usize::from(vtable_length), "vtable")?;
        self.range(offset, usize::from(table_length), "table")?;
        Ok(TableFrame {
            offset,
            vtable,
            vtable_length,
            table_length,
        })
    }

    /// The absolute position of a present field of `size` inline bytes.
    fn slot(
        &self,
        frame: &TableFrame,
        slot: usize,
        size: usize,
    ) -> Result<Option<usize>, ValidationError> {
        if slot >= vtable_field_count(frame.vtable_length) {
            return Ok(None);
        }
        let offset = usize::from(self.read_u16(frame.vtable + 4 + 2 * slot)?);
        if offset == 0 {
            return Ok(None);
        }
        if offset < SIZE_OF_UOFFSET || offset + size > usize::from(frame.table_length) {
            reject!(
                FieldOutOfTable: "slot {} at offset {} with size {} exceeds table length {}",
                slot,
                offset,
                size,
                frame.table_length
            );
        }
        Ok(Some(frame.offset + offset))
    }

    fn field(&mut self, frame: &TableFrame, field: &FieldLayout, depth: usize) -> ValidationResult {
        if let FieldKind::Union(id) = field.kind() {
            return self.union(frame, field, *id, depth);
        }
        let Some(position) = self.slot(frame, usize::from(field.index()), field.inline_size())?
        else {
            if field.is_required() {
                reject!(RequiredFieldMissing: "required field {} is missing", field.name());
            }
            return Ok(());
        };
        self.aligned(position, field.inline_alignment(), field.name())?;
        match field.kind() {
            FieldKind::Scalar(_) | FieldKind::Struct(_) | FieldKind::Union(_) => Ok(()),
            FieldKind::String { .. } => {
                let target = self.uoffset(position, frame.range())?;
                self.string(target)
            }
            FieldKind::Table(id) => {
                let target = self.uoffset(position, frame.range())?;
                self.table(*id, target, depth + 1)
            }
            FieldKind::Vector(layout) => {
                let target = self.uoffset(position, frame.range())?;
                self.vector(layout, field.is_sorted(), target, depth + 1)
            }
        }
    }

    fn union(
        &mut self,
        frame: &TableFrame,
        field: &FieldLayout,
        id: UnionId,
        depth: usize,
    ) -> ValidationResult {
        let slot = usize::from(field.index());
        let tag = self.slot(frame, slot, 1)?;
        let value = self.slot(frame, slot + 1, SIZE_OF_UOFFSET)?;
        let (tag, value) = match (tag, value) {
            (Some(tag), Some(value)) => (tag, value),
            (None, None) if field.is_required() => {
                reject!(RequiredFieldMissing: "required union {} is missing", field.name())
            }
            (None, None) => return Ok(()),
            _ => reject!(
                UnionMismatch: "union {} stores only one of its tag and value",
                field.name()
            ),
        };
        let tag = self.read_u8(tag)?;
        let schema = self.schema;
        let layout = schema.union_layout(id);
        let Some(member) = layout.member(tag) else {
            reject!(UnknownUnionTag: "tag {} is not a member of union {}", tag, layout.name());
        };
        let target = self.uoffset(value, frame.range())?;
        match member.kind() {
            UnionMemberKind::Table(table) => self.table(table, target, depth + 1),
            UnionMemberKind::Struct(id) => self.out_of_line_struct(id, target),
            UnionMemberKind::String => self.string(target),
        }
    }

    fn out_of_line_struct(&self, id: StructId, offset: usize) -> ValidationResult {
        let layout = self.schema.struct_layout(id);
        let fits = offset
            .checked_add(layout.size())
            .is_some_and(|end| end <= self.bytes.len());
        if !fits || !layout.alignment().is_offset_aligned(offset) {
            reject!(
                InvalidStructLayout: "struct {} of {} bytes at offset {} is not aligned to {} or exceeds buffer of {} bytes",
                layout.name(),
                layout.size(),
                offset,
                layout.alignment(),
                self.bytes.len()
            );
        }
        Ok(())
    }

    fn string(&self, offset: usize) -> ValidationResult {
        self.aligned(offset, UOFFSET_ALIGNMENT, "string")?;
        let length = self.read_u32(offset)? as usize;
        let data = offset + SIZE_OF_UOFFSET;
        let terminator = data
            .checked_add(length)
            .filter(|terminator| *terminator < self.bytes.len())
            .ok_or_else(|| {
                invalid!(
                    StringOutOfBounds: "string of {} bytes at offset {} exceeds buffer of {} bytes",
                    length,
                    offset,
                    self.bytes.len()
                )
            })?;
        if self.bytes[terminator] != 0 {
            reject!(StringMissingTerminator: "string at offset {} is not NUL-terminated", offset);
        }
        std::str::from_utf8(&self.bytes[data..terminator])
            .map_err(|err| invalid!(InvalidUtf8: "string at offset {}: {}", offset, err))?;
        Ok(())
    }

    fn vector(
        &mut self,
        layout: &VectorLayout,
        sorted: bool,
        offset: usize,
        depth: usize,
    ) -> ValidationResult {
        self.enter(depth)?;
        self.aligned(offset, UOFFSET_ALIGNMENT, "vector")?;
        let count = self.read_u32(offset)? as usize;
        let data = offset + SIZE_OF_UOFFSET;
        let end = count
            .checked_mul(layout.stride())
            .and_then(|length| data.checked_add(length))
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                invalid!(
                    VectorCountOverflow: "vector of {} elements of {} bytes at offset {} exceeds buffer of {} bytes",
                    count,
                    layout.stride(),
                    offset,
                    self.bytes.len()
                )
            })?;
        match *layout.element() {
            ElementKind::Scalar(_) => self.aligned(data, layout.alignment(), "vector elements"),
            ElementKind::Struct(id) => {
                if !layout.alignment().is_offset_aligned(data) {
                    reject!(
                        InvalidStructLayout: "elements of struct {} at offset {} are not aligned to {}",
                        self.schema.struct_layout(id).name(),
                        data,
                        layout.alignment()
                    );
                }
                Ok(())
            }
            ElementKind::String { .. } => {
                for element in 0..count {
                    let target = self.uoffset(data + element * SIZE_OF_UOFFSET, offset..end)?;
                    self.string(target)?;
                }
                Ok(())
            }
            ElementKind::Table(id) => {
                let mut previous: Option<SortKey> = None;
                for element in 0..count {
                    let target = self.uoffset(data + element * SIZE_OF_UOFFSET, offset..end)?;
                    self.table(id, target, depth + 1)?;
                    if !sorted {
                        continue;
                    }
                    let key = self.key(id, target)?;
                    if let Some(previous) = &previous {
                        match previous.cmp(&key) {
                            Ordering::Greater => reject!(
                                UnsortedVector: "key {} of element {} of vector at offset {} sorts before {}",
                                key,
                                element,
                                offset,
                                previous
                            ),
                            Ordering::Equal if layout.kind() == VectorKind::Indexed => reject!(
                                DuplicateKey: "key {} repeats at element {} of indexed vector at offset {}",
                                key,
                                element,
                                offset
                            ),
                            _ => {}
                        }
                    }
                    previous = Some(key);
                }
                Ok(())
            }
        }
    }

    /// The sort key of a table that has already passed [`Walk::table`].
    fn key(&self, id: TableId, offset: usize) -> Result<SortKey, ValidationError> {
        let layout = self.schema.table(id);
        let Some(key) = layout.key() else {
            reject!(UnsortedVector: "table {} has no key to sort by", layout.name());
        };
        let frame = self.frame(offset)?;
        let position = self.slot(&frame, usize::from(key.index()), key.inline_size())?;
        match (key.kind(), position) {
            (FieldKind::Scalar(scalar_type), Some(position)) => {
                let bytes = &self.bytes[position..position + scalar_type.byte_width()];
                ScalarValue::from_le_slice(*scalar_type, bytes)
                    .map(SortKey::from_scalar)
                    .map_err(|err| invalid!(OutOfBounds: "key of table at {}: {}", offset, err))
            }
            (FieldKind::String { .. }, Some(position)) => {
                let target = self.uoffset(position, frame.range())?;
                let data = target + SIZE_OF_UOFFSET;
                let length = self.read_u32(target)? as usize;
                std::str::from_utf8(&self.bytes[data..data + length])
                    .map(|key| SortKey::String(Arc::from(key)))
                    .map_err(|err| invalid!(InvalidUtf8: "key of table at {}: {}", offset, err))
            }
            (_, None) => key.default_scalar().map(SortKey::from_scalar).ok_or_else(|| {
                invalid!(
                    RequiredFieldMissing: "key {} of table {} at offset {} is missing",
                    key.name(),
                    layout.name(),
                    offset
                )
            }),
            (kind, Some(_)) => reject!(UnsortedVector: "{} cannot be a key", kind),
        }
    }

    /// Resolve the uoffset at `position`, which lies inside the object spanning `parent`.
    fn uoffset(&self, position: usize, parent: Range<usize>) -> Result<usize, ValidationError> {
        self.aligned(position, UOFFSET_ALIGNMENT, "uoffset")?;
        let raw = self.read_u32(position)? as usize;
        if raw < SIZE_OF_UOFFSET {
            reject!(InvalidUOffset: "uoffset {} at offset {}", raw, position);
        }
        let target = position
            .checked_add(raw)
            .filter(|target| *target < self.bytes.len())
            .ok_or_else(|| {
                invalid!(
                    OutOfBounds: "uoffset {} at offset {} points past buffer of {} bytes",
                    raw,
                    position,
                    self.bytes.len()
                )
            })?;
        if parent.contains(&target) {
            reject!(
                UOffsetInsideParent: "uoffset at offset {} points at {} inside its own object",
                position,
                target
            );
        }
        Ok(target)
    }

    fn aligned(&self, offset: usize, alignment: Alignment, what: &str) -> ValidationResult {
        if !alignment.is_offset_aligned(offset) {
            reject!(Unaligned: "{} at offset {} is not aligned to {}", what, offset, alignment);
        }
        Ok(())
    }

    fn range(&self, offset: usize, length: usize, what: &str) -> ValidationResult {
        if offset
            .checked_add(length)
            .is_none_or(|end| end > self.bytes.len())
        {
            reject!(
                OutOfBounds: "{} of {} bytes at offset {} exceeds buffer of {} bytes",
                what,
                length,
                offset,
                self.bytes.len()
            );
        }
        Ok(())
    }

    fn read<const N: usize>(&self, offset: usize) -> Result<[u8; N], ValidationError> {
        offset
            .checked_add(N)
            .and_then(|end| self.bytes.get(offset..end))
            .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
            .ok_or_else(|| {
                invalid!(
                    OutOfBounds: "{} bytes at offset {} exceed buffer of {} bytes",
                    N,
                    offset,
                    self.bytes.len()
                )
            })
    }

    fn read_u8(&self, offset: usize) -> Result<u8, ValidationError> {
        self.read::<1>(offset).map(|[byte]| byte)
    }

    fn read_u16(&self, offset: usize) -> Result<u16, ValidationError> {
        self.read(offset).map(u16::from_le_bytes)
    }

    fn read_u32(&self, offset: usize) -> Result<u32, ValidationError> {
        self.read(offset).map(u32::from_le_bytes)
    }

    fn read_i32(&self, offset: usize) -> Result<i32, ValidationError> {
        self.read(offset).map(i32::from_le_bytes)
    }
}
