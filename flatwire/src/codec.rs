//! Wire primitives: offset resolution, strings, vector headers and the output writer.

use std::borrow::Cow;
use std::sync::Arc;

use flatwire_buffer::{
    Alignment, InputBuffer, InputBufferExt, NativeScalar, Scalar, checked_range,
};
use flatwire_error::{FlatResult, flat_bail, flat_err};
use rustc_hash::FxHashMap;

/// The size of a uoffset, a soffset and a vector length on the wire.
pub const SIZE_OF_UOFFSET: usize = 4;

/// The size of a file identifier.
pub const FILE_IDENTIFIER_LENGTH: usize = 4;

/// The number of field slots declared by a vtable of the given length.
#[inline]
pub fn vtable_field_count(vtable_length: u16) -> usize {
    usize::from(vtable_length).saturating_sub(4) / 2
}

/// Resolve the uoffset stored at `offset` into the absolute offset it points at.
///
/// A raw uoffset below 4 cannot point past its own storage and is rejected as corrupt.
pub fn read_uoffset<B: InputBuffer + ?Sized>(buffer: &B, offset: usize) -> FlatResult<usize> {
    let raw = buffer.read_u32(offset)?;
    if (raw as usize) < SIZE_OF_UOFFSET {
        flat_bail!(InvalidFormat: "invalid uoffset {} at offset {}", raw, offset);
    }
    let target = offset
        .checked_add(raw as usize)
        .ok_or_else(|| flat_err!(InvalidFormat: "uoffset {} at offset {} overflows", raw, offset))?;
    if target >= buffer.len() {
        flat_bail!(
            InvalidFormat: "uoffset {} at offset {} points past the end of a {} byte buffer",
            raw,
            offset,
            buffer.len()
        );
    }
    Ok(target)
}

/// The location of a vector's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorHeader {
    /// The number of elements.
    pub count: usize,
    /// The absolute offset of the first element.
    pub data_offset: usize,
}

/// Read the header of the vector starting at `offset` whose elements are `stride` bytes wide.
///
/// The element count multiplied by the stride must neither overflow nor run past the buffer.
pub fn vector_header<B: InputBuffer + ?Sized>(
    buffer: &B,
    offset: usize,
    stride: usize,
) -> FlatResult<VectorHeader> {
    if offset % SIZE_OF_UOFFSET != 0 {
        flat_bail!(InvalidFormat: "vector length at offset {} is not 4-byte aligned", offset);
    }
    let count = buffer.read_u32(offset)? as usize;
    let data_offset = offset + SIZE_OF_UOFFSET;
    let byte_length = count.checked_mul(stride).ok_or_else(|| {
        flat_err!(InvalidFormat: "vector of {} elements of {} bytes overflows", count, stride)
    })?;
    if checked_range(data_offset, byte_length, buffer.len()).is_err() {
        flat_bail!(
            InvalidFormat: "vector of {} elements of {} bytes at offset {} exceeds buffer of {} bytes",
            count,
            stride,
            offset,
            buffer.len()
        );
    }
    Ok(VectorHeader { count, data_offset })
}

/// The UTF-8 bytes of the string starting at `offset`, excluding the terminator.
pub fn read_string_bytes<B: InputBuffer + ?Sized>(
    buffer: &B,
    offset: usize,
) -> FlatResult<Cow<'_, [u8]>> {
    let header = vector_header(buffer, offset, 1)?;
    if header.data_offset + header.count >= buffer.len() {
        flat_bail!(InvalidFormat: "string at offset {} is missing its terminator", offset);
    }
    let span = buffer.get_read_only_span(header.data_offset, header.count + 1)?;
    if span.last() != Some(&0) {
        flat_bail!(InvalidFormat: "string at offset {} is missing its terminator", offset);
    }
    Ok(match span {
        Cow::Borrowed(bytes) => Cow::Borrowed(&bytes[..header.count]),
        Cow::Owned(mut bytes) => {
            bytes.truncate(header.count);
            Cow::Owned(bytes)
        }
    })
}

/// Decode the string starting at `offset`.
pub fn read_string<B: InputBuffer + ?Sized>(buffer: &B, offset: usize) -> FlatResult<Arc<str>> {
    let bytes = read_string_bytes(buffer, offset)?;
    Ok(Arc::from(std::str::from_utf8(&bytes)?))
}

/// Reinterpret `count` elements of `T` starting at `offset` of a contiguous little-endian buffer.
///
/// The start must be aligned for `T` in memory, not only relative to the buffer.
pub fn read_native_slice<T: NativeScalar>(
    bytes: &[u8],
    offset: usize,
    count: usize,
) -> FlatResult<&[T]> {
    if !cfg!(target_endian = "little") {
        flat_bail!(InvalidOperation: "native slices require a little-endian host");
    }
    let byte_length = count
        .checked_mul(T::SIZE)
        .ok_or_else(|| flat_err!(InvalidFormat: "native slice of {} elements overflows", count))?;
    let range = checked_range(offset, byte_length, bytes.len())?;
    let data = &bytes[range];
    if !data.as_ptr().cast::<T>().is_aligned() {
        flat_bail!(
            InvalidOperation: "native slice of {} at offset {} is not aligned in memory",
            T::SCALAR_TYPE,
            offset
        );
    }
    // SAFETY: the range is in bounds and aligned for `T`, `NativeScalar` guarantees every bit
    // pattern is valid and the wire layout matches the in-memory layout on little-endian hosts.
    Ok(unsafe { std::slice::from_raw_parts(data.as_ptr().cast::<T>(), count) })
}

/// The output side of serialization: a caller-supplied byte slice written front to back.
///
/// Every allocation is bounds-checked and padding is zero-filled. Identical vtables are written
/// once and shared when `share_vtables` is set.
pub struct SerializationContext<'a> {
    buffer: &'a mut [u8],
    offset: usize,
    share_vtables: bool,
    vtables: FxHashMap<Vec<u8>, usize>,
}

impl<'a> SerializationContext<'a> {
    pub fn new(buffer: &'a mut [u8], share_vtables: bool) -> Self {
        Self {
            buffer,
            offset: 0,
            share_vtables,
            vtables: FxHashMap::default(),
        }
    }

    /// The number of bytes allocated so far.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reserve `size` bytes aligned to `alignment`, returning their absolute offset.
    pub fn allocate(&mut self, size: usize, alignment: Alignment) -> FlatResult<usize> {
        let start = alignment
            .align_up(self.offset)
            .ok_or_else(|| flat_err!(BufferTooSmall: usize::MAX, self.buffer.len()))?;
        self.reserve(start, size)
    }

    /// Reserve a vector of `count` elements of `stride` bytes, returning the offset of its length
    /// prefix. The prefix is 4-byte aligned and the first element is aligned to `alignment`.
    pub fn allocate_vector(
        &mut self,
        count: usize,
        stride: usize,
        alignment: Alignment,
    ) -> FlatResult<usize> {
        let mut start = Alignment::new(SIZE_OF_UOFFSET)
            .align_up(self.offset)
            .ok_or_else(|| flat_err!(BufferTooSmall: usize::MAX, self.buffer.len()))?;
        while !alignment.is_offset_aligned(start + SIZE_OF_UOFFSET) {
            start += SIZE_OF_UOFFSET;
        }
        let data_length = count.checked_mul(stride).ok_or_else(|| {
            flat_err!(InvalidArgument: "vector of {} elements of {} bytes overflows", count, stride)
        })?;
        let start = self.reserve(start, SIZE_OF_UOFFSET + data_length)?;
        self.write_scalar(start, u32_len(count)?)?;
        Ok(start)
    }

    fn reserve(&mut self, start: usize, size: usize) -> FlatResult<usize> {
        let end = start
            .checked_add(size)
            .ok_or_else(|| flat_err!(BufferTooSmall: usize::MAX, self.buffer.len()))?;
        if end > self.buffer.len() {
            flat_bail!(BufferTooSmall: end, self.buffer.len());
        }
        self.buffer[self.offset..end].fill(0);
        self.offset = end;
        Ok(start)
    }

    fn span(&mut self, offset: usize, length: usize) -> FlatResult<&mut [u8]> {
        let range = checked_range(offset, length, self.offset)
            .map_err(|_| flat_err!(BufferTooSmall: offset.saturating_add(length), self.offset))?;
        Ok(&mut self.buffer[range])
    }

    /// Write a little-endian scalar into previously allocated space.
    pub fn write_scalar<T: Scalar>(&mut self, offset: usize, value: T) -> FlatResult<()> {
        value.write_le_slice(self.span(offset, T::SIZE)?)
    }

    /// Write raw bytes into previously allocated space.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> FlatResult<()> {
        self.span(offset, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Write the uoffset at `position` so that it points at `target`. Uoffsets only point forward.
    pub fn write_uoffset(&mut self, position: usize, target: usize) -> FlatResult<()> {
        if target < position + SIZE_OF_UOFFSET {
            flat_bail!(
                InvalidOperation: "uoffset at {} cannot point backwards to {}",
                position,
                target
            );
        }
        let raw = u32::try_from(target - position)
            .map_err(|_| flat_err!(InvalidArgument: "uoffset {} does not fit in 32 bits", target - position))?;
        self.write_scalar(position, raw)
    }

    /// Point the table starting at `table_offset` at the vtable at `vtable_offset`.
    pub fn write_soffset(&mut self, table_offset: usize, vtable_offset: usize) -> FlatResult<()> {
        let soffset = i64::try_from(table_offset)
            .ok()
            .zip(i64::try_from(vtable_offset).ok())
            .and_then(|(table, vtable)| i32::try_from(table - vtable).ok())
            .ok_or_else(|| flat_err!(InvalidArgument: "soffset from {} to {} does not fit in 32 bits", table_offset, vtable_offset))?;
        self.write_scalar(table_offset, soffset)
    }

    /// Write a length-prefixed, NUL-terminated string and return its offset.
    pub fn write_string(&mut self, value: &str) -> FlatResult<usize> {
        let start = self.allocate_vector(value.len() + 1, 1, Alignment::none())?;
        // The terminator is counted in the allocation but not in the length prefix.
        self.write_scalar(start, u32_len(value.len())?)?;
        self.write_bytes(start + SIZE_OF_UOFFSET, value.as_bytes())?;
        Ok(start)
    }

    /// Write a vtable, or reuse an identical one written earlier, and return its offset.
    pub fn write_vtable(&mut self, vtable: &[u8]) -> FlatResult<usize> {
        if self.share_vtables {
            if let Some(&existing) = self.vtables.get(vtable) {
                log::trace!("reusing vtable at offset {}", existing);
                return Ok(existing);
            }
        }
        let offset = self.allocate(vtable.len(), Alignment::of::<u16>())?;
        self.write_bytes(offset, vtable)?;
        if self.share_vtables {
            self.vtables.insert(vtable.to_vec(), offset);
        }
        Ok(offset)
    }

    /// The bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.buffer[..self.offset]
    }
}

fn u32_len(length: usize) -> FlatResult<u32> {
    u32::try_from(length)
        .map_err(|_| flat_err!(InvalidArgument: "length {} does not fit in 32 bits", length))
}

#[cfg(test)]
mod test {
    use flatwire_buffer::{Alignment, ArrayInputBuffer, ReadOnlyMemoryInputBuffer};
    use flatwire_error::FlatError;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(3)]
    fn uoffset_below_four_is_corrupt(#[case] raw: u32) {
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(&raw.to_le_bytes());
        let buffer = ReadOnlyMemoryInputBuffer::new(&bytes);
        assert!(read_uoffset(&buffer, 0).unwrap_err().is_format_error());
    }

    #[test]
    fn uoffset_resolves_forward() {
        let mut bytes = vec![0u8; 16];
        bytes[4..8].copy_from_slice(&8u32.to_le_bytes());
        let buffer = ReadOnlyMemoryInputBuffer::new(&bytes);
        assert_eq!(read_uoffset(&buffer, 4).unwrap(), 12);
        bytes[4..8].copy_from_slice(&12u32.to_le_bytes());
        let buffer = ReadOnlyMemoryInputBuffer::new(&bytes);
        assert!(read_uoffset(&buffer, 4).is_err());
    }

    #[test]
    fn vector_count_must_fit() {
        let mut bytes = vec![0u8; 12];
        bytes[0..4].copy_from_slice(&2u32.to_le_bytes());
        let buffer = ReadOnlyMemoryInputBuffer::new(&bytes);
        assert_eq!(
            vector_header(&buffer, 0, 4).unwrap(),
            VectorHeader {
                count: 2,
                data_offset: 4
            }
        );
        assert!(vector_header(&buffer, 0, 8).unwrap_err().is_format_error());
        bytes[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        let buffer = ReadOnlyMemoryInputBuffer::new(&bytes);
        assert!(vector_header(&buffer, 0, usize::MAX / 2).unwrap_err().is_format_error());
    }

    #[test]
    fn string_needs_terminator() {
        let mut bytes = b"\x02\x00\x00\x00hi\x00".to_vec();
        let buffer = ArrayInputBuffer::new(bytes.clone());
        assert_eq!(read_string(&buffer, 0).unwrap().as_ref(), "hi");
        bytes[6] = b'!';
        let buffer = ArrayInputBuffer::new(bytes.clone());
        assert!(read_string(&buffer, 0).unwrap_err().is_format_error());
        bytes.truncate(6);
        let buffer = ArrayInputBuffer::new(bytes);
        assert!(read_string(&buffer, 0).unwrap_err().is_format_error());
    }

    #[test]
    fn string_must_be_utf8() {
        let bytes = b"\x01\x00\x00\x00\xFF\x00".to_vec();
        let buffer = ReadOnlyMemoryInputBuffer::new(&bytes);
        assert!(matches!(
            read_string(&buffer, 0),
            Err(FlatError::Utf8Error(..))
        ));
    }

    #[test]
    fn allocations_are_aligned_and_zeroed() {
        let mut out = vec![0xAAu8; 32];
        let mut ctx = SerializationContext::new(&mut out, true);
        assert_eq!(ctx.allocate(1, Alignment::none()).unwrap(), 0);
        assert_eq!(ctx.allocate(8, Alignment::new(8)).unwrap(), 8);
        assert_eq!(ctx.offset(), 16);
        assert_eq!(&ctx.written()[1..8], &[0u8; 7]);
    }

    #[test]
    fn vector_elements_are_aligned() {
        let mut out = vec![0u8; 64];
        let mut ctx = SerializationContext::new(&mut out, true);
        ctx.allocate(4, Alignment::new(4)).unwrap();
        let start = ctx.allocate_vector(2, 8, Alignment::new(8)).unwrap();
        assert_eq!(start, 4);
        assert_eq!((start + 4) % 8, 0);
        let start = ctx.allocate_vector(1, 8, Alignment::new(8)).unwrap();
        assert_eq!(start, 28);
    }

    #[test]
    fn overrun_is_buffer_too_small() {
        let mut out = vec![0u8; 6];
        let mut ctx = SerializationContext::new(&mut out, true);
        assert!(matches!(
            ctx.write_string("hello"),
            Err(FlatError::BufferTooSmall(10, 6, _))
        ));
    }

    #[test]
    fn vtables_are_deduplicated() {
        let mut out = vec![0u8; 32];
        let mut ctx = SerializationContext::new(&mut out, true);
        let first = ctx.write_vtable(&[6, 0, 8, 0, 4, 0]).unwrap();
        let second = ctx.write_vtable(&[6, 0, 8, 0, 4, 0]).unwrap();
        assert_eq!(first, second);
        assert_eq!(ctx.offset(), 6);

        let mut out = vec![0u8; 32];
        let mut ctx = SerializationContext::new(&mut out, false);
        let first = ctx.write_vtable(&[6, 0, 8, 0, 4, 0]).unwrap();
        let second = ctx.write_vtable(&[6, 0, 8, 0, 4, 0]).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn uoffsets_only_point_forward() {
        let mut out = vec![0u8; 16];
        let mut ctx = SerializationContext::new(&mut out, true);
        ctx.allocate(16, Alignment::new(4)).unwrap();
        ctx.write_uoffset(0, 12).unwrap();
        assert_eq!(&ctx.written()[0..4], &12u32.to_le_bytes());
        assert!(ctx.write_uoffset(8, 4).is_err());
        ctx.write_soffset(4, 12).unwrap();
        assert_eq!(&ctx.written()[4..8], &(-8i32).to_le_bytes());
    }

    #[test]
    fn native_slice_requires_alignment() {
        let values = [1u32, 2, 3, 4];
        let bytes: &[u8] = unsafe {
            std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), size_of_val(&values))
        };
        if cfg!(target_endian = "little") {
            assert_eq!(read_native_slice::<u32>(bytes, 4, 2).unwrap(), &[2, 3]);
            assert!(read_native_slice::<u32>(bytes, 2, 1).is_err());
            assert!(read_native_slice::<u32>(bytes, 8, 3).is_err());
        }
    }
}
