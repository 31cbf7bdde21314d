//! Decoding of table vtables.
//!
//! A vtable is `[u16 vtable_length][u16 table_length][u16 field_offset]*` and is located by
//! subtracting the signed offset stored at the start of its table. Tables with few fields use a
//! specialized decoder that loads every slot with one bulk read into a single integer, so
//! `offset_of` becomes a shift. Larger tables use [`VTableGeneric`], which reads on demand.

use flatwire_buffer::{InputBuffer, InputBufferExt, checked_range};
use flatwire_error::{FlatResult, flat_bail, flat_err};

cfg_if::cfg_if! {
    if #[cfg(target_endian = "little")] {
        /// Whether [`VTable::create`] takes the bulk load path on this host.
        pub const BULK_LOAD: bool = true;
    } else {
        /// Whether [`VTable::create`] takes the bulk load path on this host.
        pub const BULK_LOAD: bool = false;
    }
}

/// The fixed header of a vtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VTableHeader {
    vtable_offset: usize,
    vtable_length: u16,
    table_length: u16,
}

impl VTableHeader {
    /// Resolve the vtable of the table starting at `table_offset`.
    ///
    /// Fails with a format error when the vtable length is odd or shorter than its own header, or
    /// when the vtable or the table does not fit in the buffer.
    pub fn locate<B: InputBuffer + ?Sized>(buffer: &B, table_offset: usize) -> FlatResult<Self> {
        if table_offset % 4 != 0 {
            flat_bail!(InvalidFormat: "table at offset {} is not 4-byte aligned", table_offset);
        }
        let soffset = i64::from(buffer.read_i32(table_offset)?);
        let vtable_offset = i64::try_from(table_offset)
            .ok()
            .and_then(|table| table.checked_sub(soffset))
            .and_then(|vtable| usize::try_from(vtable).ok())
            .ok_or_else(|| {
                flat_err!(InvalidFormat: "soffset {} of table at {} points before the buffer", soffset, table_offset)
            })?;
        if vtable_offset % 2 != 0 {
            flat_bail!(InvalidFormat: "vtable at offset {} is not 2-byte aligned", vtable_offset);
        }

        let vtable_length = buffer.read_u16(vtable_offset)?;
        let table_length = buffer.read_u16(vtable_offset + 2)?;
        if vtable_length < 4 || vtable_length % 2 != 0 {
            flat_bail!(InvalidFormat: "invalid vtable length {} at offset {}", vtable_length, vtable_offset);
        }
        if table_length < 4 {
            flat_bail!(InvalidFormat: "invalid table length {} at offset {}", table_length, table_offset);
        }
        checked_range(vtable_offset, vtable_length.into(), buffer.len())?;
        checked_range(table_offset, table_length.into(), buffer.len())?;

        Ok(Self {
            vtable_offset,
            vtable_length,
            table_length,
        })
    }

    /// The absolute offset of the vtable.
    #[inline]
    pub fn vtable_offset(&self) -> usize {
        self.vtable_offset
    }

    /// The length of the vtable in bytes, header included.
    #[inline]
    pub fn vtable_length(&self) -> u16 {
        self.vtable_length
    }

    /// The length of the inline part of the table in bytes, soffset included.
    #[inline]
    pub fn table_length(&self) -> u16 {
        self.table_length
    }

    /// The number of field slots the vtable declares.
    #[inline]
    pub fn field_count(&self) -> usize {
        crate::codec::vtable_field_count(self.vtable_length)
    }

    /// The absolute offset of the first field slot.
    #[inline]
    pub fn fields_offset(&self) -> usize {
        self.vtable_offset + 4
    }
}

/// A decoded vtable answering `offset_of(index)`.
pub trait VTable: Sized {
    /// The number of slots this decoder can answer for. Higher indices read as absent.
    const MAX_SUPPORTED_INDEX: usize;

    /// Decode the vtable of the table at `table_offset` using the fastest path for this host.
    #[inline]
    fn create<B: InputBuffer + ?Sized>(buffer: &B, table_offset: usize) -> FlatResult<Self> {
        if BULK_LOAD {
            Self::create_little_endian(buffer, table_offset)
        } else {
            Self::create_big_endian(buffer, table_offset)
        }
    }

    /// Decode with a single bulk read of every slot.
    fn create_little_endian<B: InputBuffer + ?Sized>(
        buffer: &B,
        table_offset: usize,
    ) -> FlatResult<Self>;

    /// Decode slot by slot. Correct on every host.
    fn create_big_endian<B: InputBuffer + ?Sized>(
        buffer: &B,
        table_offset: usize,
    ) -> FlatResult<Self>;

    /// The offset of field slot `index` relative to the table start, or 0 if absent.
    fn offset_of<B: InputBuffer + ?Sized>(&self, buffer: &B, index: usize) -> FlatResult<u16>;

    /// The inline length of the table in bytes, including its soffset.
    fn table_length(&self) -> u16;
}

/// The vtable of a table without fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VTable0 {
    table_length: u16,
}

impl VTable for VTable0 {
    const MAX_SUPPORTED_INDEX: usize = 0;

    fn create_little_endian<B: InputBuffer + ?Sized>(
        buffer: &B,
        table_offset: usize,
    ) -> FlatResult<Self> {
        Self::create_big_endian(buffer, table_offset)
    }

    fn create_big_endian<B: InputBuffer + ?Sized>(
        buffer: &B,
        table_offset: usize,
    ) -> FlatResult<Self> {
        let header = VTableHeader::locate(buffer, table_offset)?;
        Ok(Self {
            table_length: header.table_length(),
        })
    }

    #[inline]
    fn offset_of<B: InputBuffer + ?Sized>(&self, _buffer: &B, _index: usize) -> FlatResult<u16> {
        Ok(0)
    }

    #[inline]
    fn table_length(&self) -> u16 {
        self.table_length
    }
}

macro_rules! packed_vtable {
    ($name:ident, $packed:ty, $slots:literal) => {
        #[doc = concat!("A vtable of up to ", stringify!($slots), " slots packed into a `", stringify!($packed), "`.")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            packed: $packed,
            table_length: u16,
        }

        impl VTable for $name {
            const MAX_SUPPORTED_INDEX: usize = $slots;

            fn create_little_endian<B: InputBuffer + ?Sized>(
                buffer: &B,
                table_offset: usize,
            ) -> FlatResult<Self> {
                let header = VTableHeader::locate(buffer, table_offset)?;
                let start = header.fields_offset();
                let declared = header.field_count().min($slots) * 2;
                let load = $slots * 2;

                let mut raw = [0u8; size_of::<$packed>()];
                if start + load <= buffer.len() {
                    buffer.read_into(start, &mut raw[..load])?;
                    raw[declared..load].fill(0);
                } else {
                    // Not enough bytes left for the bulk load, read only the declared slots.
                    buffer.read_into(start, &mut raw[..declared])?;
                }

                Ok(Self {
                    packed: <$packed>::from_le_bytes(raw),
                    table_length: header.table_length(),
                })
            }

            fn create_big_endian<B: InputBuffer + ?Sized>(
                buffer: &B,
                table_offset: usize,
            ) -> FlatResult<Self> {
                let header = VTableHeader::locate(buffer, table_offset)?;
                let mut packed: $packed = 0;
                for index in 0..header.field_count().min($slots) {
                    let offset = buffer.read_u16(header.fields_offset() + 2 * index)?;
                    packed |= <$packed>::from(offset) << (16 * index);
                }
                Ok(Self {
                    packed,
                    table_length: header.table_length(),
                })
            }

            #[inline]
            #[allow(clippy::cast_possible_truncation)]
            fn offset_of<B: InputBuffer + ?Sized>(
                &self,
                _buffer: &B,
                index: usize,
            ) -> FlatResult<u16> {
                if index >= $slots {
                    return Ok(0);
                }
                Ok((self.packed >> (16 * index)) as u16)
            }

            #[inline]
            fn table_length(&self) -> u16 {
                self.table_length
            }
        }
    };
}

packed_vtable!(VTable1, u16, 1);
packed_vtable!(VTable2, u32, 2);
packed_vtable!(VTable3, u64, 3);
packed_vtable!(VTable4, u64, 4);
packed_vtable!(VTable7, u128, 7);
packed_vtable!(VTable8, u128, 8);

/// A vtable of any size, reading slots from the buffer on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VTableGeneric {
    fields_offset: usize,
    count: usize,
    table_length: u16,
}

impl VTable for VTableGeneric {
    const MAX_SUPPORTED_INDEX: usize = 256;

    fn create_little_endian<B: InputBuffer + ?Sized>(
        buffer: &B,
        table_offset: usize,
    ) -> FlatResult<Self> {
        Self::create_big_endian(buffer, table_offset)
    }

    fn create_big_endian<B: InputBuffer + ?Sized>(
        buffer: &B,
        table_offset: usize,
    ) -> FlatResult<Self> {
        let header = VTableHeader::locate(buffer, table_offset)?;
        Ok(Self {
            fields_offset: header.fields_offset(),
            count: header.field_count().min(Self::MAX_SUPPORTED_INDEX),
            table_length: header.table_length(),
        })
    }

    #[inline]
    fn offset_of<B: InputBuffer + ?Sized>(&self, buffer: &B, index: usize) -> FlatResult<u16> {
        if index >= self.count {
            return Ok(0);
        }
        buffer.read_u16(self.fields_offset + 2 * index)
    }

    #[inline]
    fn table_length(&self) -> u16 {
        self.table_length
    }
}

/// The decoder chosen for a table when its schema is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VTableKind {
    V0,
    V1,
    V2,
    V3,
    V4,
    V7,
    V8,
    Generic,
}

impl VTableKind {
    /// Select the smallest decoder covering every slot up to `max_index`.
    pub fn for_max_index(max_index: Option<usize>) -> Self {
        match max_index {
            None => Self::V0,
            Some(0) => Self::V1,
            Some(1) => Self::V2,
            Some(2) => Self::V3,
            Some(3) => Self::V4,
            Some(4..=6) => Self::V7,
            Some(7) => Self::V8,
            Some(_) => Self::Generic,
        }
    }

    /// The number of slots the decoder answers for.
    pub fn max_supported_index(&self) -> usize {
        match self {
            Self::V0 => VTable0::MAX_SUPPORTED_INDEX,
            Self::V1 => VTable1::MAX_SUPPORTED_INDEX,
            Self::V2 => VTable2::MAX_SUPPORTED_INDEX,
            Self::V3 => VTable3::MAX_SUPPORTED_INDEX,
            Self::V4 => VTable4::MAX_SUPPORTED_INDEX,
            Self::V7 => VTable7::MAX_SUPPORTED_INDEX,
            Self::V8 => VTable8::MAX_SUPPORTED_INDEX,
            Self::Generic => VTableGeneric::MAX_SUPPORTED_INDEX,
        }
    }
}

/// One of the vtable decoders, selected by [`VTableKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnyVTable {
    V0(VTable0),
    V1(VTable1),
    V2(VTable2),
    V3(VTable3),
    V4(VTable4),
    V7(VTable7),
    V8(VTable8),
    Generic(VTableGeneric),
}

macro_rules! dispatch_create {
    ($kind:expr, $method:ident, $buffer:expr, $offset:expr) => {
        Ok(match $kind {
            VTableKind::V0 => AnyVTable::V0(VTable0::$method($buffer, $offset)?),
            VTableKind::V1 => AnyVTable::V1(VTable1::$method($buffer, $offset)?),
            VTableKind::V2 => AnyVTable::V2(VTable2::$method($buffer, $offset)?),
            VTableKind::V3 => AnyVTable::V3(VTable3::$method($buffer, $offset)?),
            VTableKind::V4 => AnyVTable::V4(VTable4::$method($buffer, $offset)?),
            VTableKind::V7 => AnyVTable::V7(VTable7::$method($buffer, $offset)?),
            VTableKind::V8 => AnyVTable::V8(VTable8::$method($buffer, $offset)?),
            VTableKind::Generic => AnyVTable::Generic(VTableGeneric::$method($buffer, $offset)?),
        })
    };
}

macro_rules! dispatch {
    ($self:expr, $vtable:ident => $body:expr) => {
        match $self {
            AnyVTable::V0($vtable) => $body,
            AnyVTable::V1($vtable) => $body,
            AnyVTable::V2($vtable) => $body,
            AnyVTable::V3($vtable) => $body,
            AnyVTable::V4($vtable) => $body,
            AnyVTable::V7($vtable) => $body,
            AnyVTable::V8($vtable) => $body,
            AnyVTable::Generic($vtable) => $body,
        }
    };
}

impl AnyVTable {
    /// Decode with the decoder selected by `kind`, on the fastest path for this host.
    pub fn create<B: InputBuffer + ?Sized>(
        kind: VTableKind,
        buffer: &B,
        table_offset: usize,
    ) -> FlatResult<Self> {
        dispatch_create!(kind, create, buffer, table_offset)
    }

    /// Decode with a single bulk little-endian load. Tests compare this against
    /// [`AnyVTable::create_big_endian`] on every host.
    pub fn create_little_endian<B: InputBuffer + ?Sized>(
        kind: VTableKind,
        buffer: &B,
        table_offset: usize,
    ) -> FlatResult<Self> {
        dispatch_create!(kind, create_little_endian, buffer, table_offset)
    }

    /// Decode slot by slot with portable reads.
    pub fn create_big_endian<B: InputBuffer + ?Sized>(
        kind: VTableKind,
        buffer: &B,
        table_offset: usize,
    ) -> FlatResult<Self> {
        dispatch_create!(kind, create_big_endian, buffer, table_offset)
    }

    #[inline]
    pub fn offset_of<B: InputBuffer + ?Sized>(&self, buffer: &B, index: usize) -> FlatResult<u16> {
        dispatch!(self, vtable => vtable.offset_of(buffer, index))
    }

    #[inline]
    pub fn table_length(&self) -> u16 {
        dispatch!(self, vtable => vtable.table_length())
    }

    /// The offset of a present field whose inline value is `size` bytes, checked to lie inside
    /// the table.
    pub fn field_offset<B: InputBuffer + ?Sized>(
        &self,
        buffer: &B,
        index: usize,
        size: usize,
    ) -> FlatResult<Option<usize>> {
        let offset = usize::from(self.offset_of(buffer, index)?);
        if offset == 0 {
            return Ok(None);
        }
        if offset < 4 || offset + size > usize::from(self.table_length()) {
            flat_bail!(
                InvalidFormat: "field {} at offset {} with size {} exceeds table length {}",
                index,
                offset,
                size,
                self.table_length()
            );
        }
        Ok(Some(offset))
    }
}
