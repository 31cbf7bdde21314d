use std::borrow::Cow;
use std::cell::Cell;
use std::ops::Range;

use bytes::Bytes;
use flatwire_error::{FlatResult, flat_bail, flat_err};

use crate::{MAX_SCALAR_SIZE, MemorySlice, Scalar};

/// A contiguous range of bytes that a FlatBuffer can be parsed from.
///
/// Every accessor takes an `(offset, length)` pair and returns a borrowed view wherever the
/// concrete buffer kind can provide one. Mutable views are handed out as `&[Cell<u8>]`, so a
/// buffer that supports write-through is never `Sync` and concurrent mutation is ruled out by the
/// type system.
pub trait InputBuffer {
    /// The length of the buffer in bytes.
    fn len(&self) -> usize;

    /// Returns true if the buffer has no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if this buffer refuses every mutable view.
    fn is_read_only(&self) -> bool;

    /// Returns true if the memory behind this buffer will not move for the lifetime of the
    /// buffer. Zero-copy native vector views require a pinned buffer.
    fn is_pinned(&self) -> bool;

    /// The "full" fast path: the whole buffer as an immutable slice.
    ///
    /// Only buffers whose bytes can never be written through a shared reference return `Some`.
    fn contiguous(&self) -> Option<&[u8]> {
        None
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    fn read_into(&self, offset: usize, dst: &mut [u8]) -> FlatResult<()>;

    /// Copy `src` into the buffer starting at `offset`.
    fn write_from(&self, offset: usize, src: &[u8]) -> FlatResult<()> {
        let span = self.get_span(offset, src.len())?;
        span.iter().zip(src).for_each(|(cell, byte)| cell.set(*byte));
        Ok(())
    }

    /// A mutable view over `length` bytes starting at `offset`.
    fn get_span(&self, offset: usize, length: usize) -> FlatResult<&[Cell<u8>]>;

    /// An immutable view over `length` bytes starting at `offset`.
    ///
    /// Borrowed when the buffer exposes [`InputBuffer::contiguous`], copied otherwise.
    fn get_read_only_span(&self, offset: usize, length: usize) -> FlatResult<Cow<'_, [u8]>> {
        if let Some(bytes) = self.contiguous() {
            let range = checked_range(offset, length, bytes.len())?;
            return Ok(Cow::Borrowed(&bytes[range]));
        }
        let mut copy = vec![0u8; length];
        self.read_into(offset, &mut copy)?;
        Ok(Cow::Owned(copy))
    }

    /// A storable, mutable handle over `length` bytes starting at `offset`.
    fn get_memory(&self, offset: usize, length: usize) -> FlatResult<MemorySlice<Self>>
    where
        Self: Sized + Clone,
    {
        if self.is_read_only() {
            flat_bail!(InvalidOperation: "cannot create a mutable memory view over a read-only buffer");
        }
        checked_range(offset, length, self.len())?;
        Ok(MemorySlice::new(self.clone(), offset, length))
    }

    /// An owned, immutable handle over `length` bytes starting at `offset`.
    fn get_read_only_memory(&self, offset: usize, length: usize) -> FlatResult<Bytes> {
        Ok(Bytes::from(self.get_read_only_span(offset, length)?.into_owned()))
    }
}

impl<T: InputBuffer + ?Sized> InputBuffer for &T {
    #[inline]
    fn len(&self) -> usize {
        (**self).len()
    }

    #[inline]
    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }

    #[inline]
    fn is_pinned(&self) -> bool {
        (**self).is_pinned()
    }

    #[inline]
    fn contiguous(&self) -> Option<&[u8]> {
        (**self).contiguous()
    }

    #[inline]
    fn read_into(&self, offset: usize, dst: &mut [u8]) -> FlatResult<()> {
        (**self).read_into(offset, dst)
    }

    #[inline]
    fn write_from(&self, offset: usize, src: &[u8]) -> FlatResult<()> {
        (**self).write_from(offset, src)
    }

    #[inline]
    fn get_span(&self, offset: usize, length: usize) -> FlatResult<&[Cell<u8>]> {
        (**self).get_span(offset, length)
    }

    #[inline]
    fn get_read_only_span(&self, offset: usize, length: usize) -> FlatResult<Cow<'_, [u8]>> {
        (**self).get_read_only_span(offset, length)
    }

    #[inline]
    fn get_read_only_memory(&self, offset: usize, length: usize) -> FlatResult<Bytes> {
        (**self).get_read_only_memory(offset, length)
    }
}

/// Scalar access for every [`InputBuffer`].
///
/// This is the single place scalars are decoded from a buffer. Buffers exposing the contiguous
/// fast path are read directly, every other buffer is read into a stack array first.
pub trait InputBufferExt: InputBuffer {
    /// Read a little-endian scalar at `offset`.
    #[inline]
    fn read_scalar<T: Scalar>(&self, offset: usize) -> FlatResult<T> {
        debug_assert!(
            offset % T::SIZE == 0,
            "unaligned {} read at offset {}",
            T::SCALAR_TYPE,
            offset
        );
        if let Some(bytes) = self.contiguous() {
            let range = checked_range(offset, T::SIZE, bytes.len())?;
            return T::from_le_slice(&bytes[range]);
        }
        let mut raw = [0u8; MAX_SCALAR_SIZE];
        let raw = &mut raw[..T::SIZE];
        self.read_into(offset, raw)?;
        T::from_le_slice(raw)
    }

    /// Write a little-endian scalar at `offset`.
    #[inline]
    fn write_scalar<T: Scalar>(&self, offset: usize, value: T) -> FlatResult<()> {
        debug_assert!(
            offset % T::SIZE == 0,
            "unaligned {} write at offset {}",
            T::SCALAR_TYPE,
            offset
        );
        let mut raw = [0u8; MAX_SCALAR_SIZE];
        let raw = &mut raw[..T::SIZE];
        value.write_le_slice(raw)?;
        self.write_from(offset, raw)
    }

    /// Read a `u8` at `offset`.
    #[inline]
    fn read_u8(&self, offset: usize) -> FlatResult<u8> {
        self.read_scalar(offset)
    }

    /// Read a little-endian `u16` at `offset`.
    #[inline]
    fn read_u16(&self, offset: usize) -> FlatResult<u16> {
        self.read_scalar(offset)
    }

    /// Read a little-endian `u32` at `offset`.
    #[inline]
    fn read_u32(&self, offset: usize) -> FlatResult<u32> {
        self.read_scalar(offset)
    }

    /// Read a little-endian `i32` at `offset`.
    #[inline]
    fn read_i32(&self, offset: usize) -> FlatResult<i32> {
        self.read_scalar(offset)
    }
}

impl<B: InputBuffer + ?Sized> InputBufferExt for B {}

/// Check that `length` bytes starting at `offset` fit within `total` bytes.
#[inline]
pub fn checked_range(offset: usize, length: usize, total: usize) -> FlatResult<Range<usize>> {
    let end = offset
        .checked_add(length)
        .ok_or_else(|| flat_err!(OutOfBounds: offset, 0, total))?;
    if end > total {
        return Err(flat_err!(OutOfBounds: end, 0, total));
    }
    Ok(offset..end)
}

/// Copy bytes out of a slice of cells.
pub(crate) fn read_cells(cells: &[Cell<u8>], offset: usize, dst: &mut [u8]) -> FlatResult<()> {
    let range = checked_range(offset, dst.len(), cells.len())?;
    dst.iter_mut()
        .zip(&cells[range])
        .for_each(|(byte, cell)| *byte = cell.get());
    Ok(())
}

/// Borrow a sub-range of a slice of cells.
pub(crate) fn span_cells(cells: &[Cell<u8>], offset: usize, length: usize) -> FlatResult<&[Cell<u8>]> {
    let range = checked_range(offset, length, cells.len())?;
    Ok(&cells[range])
}
