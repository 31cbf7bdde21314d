use std::cell::Cell;

use flatwire_error::{FlatResult, flat_bail};

use crate::input::{checked_range, read_cells, span_cells};
use crate::InputBuffer;

/// A writable input buffer borrowing caller-owned memory.
///
/// The caller declares whether the memory is pinned, i.e. will not be relocated while the buffer
/// is alive. Only pinned buffers may back zero-copy native vector views.
#[derive(Clone, Copy, Debug)]
pub struct MemoryInputBuffer<'a> {
    cells: &'a [Cell<u8>],
    pinned: bool,
}

impl<'a> MemoryInputBuffer<'a> {
    /// Borrow the given memory, which is not pinned.
    pub fn new(data: &'a mut [u8]) -> Self {
        Self::with_pinned(data, false)
    }

    /// Borrow the given memory and declare whether it is pinned.
    pub fn with_pinned(data: &'a mut [u8], pinned: bool) -> Self {
        Self {
            cells: Cell::from_mut(data).as_slice_of_cells(),
            pinned,
        }
    }
}

impl InputBuffer for MemoryInputBuffer<'_> {
    #[inline]
    fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    fn is_read_only(&self) -> bool {
        false
    }

    #[inline]
    fn is_pinned(&self) -> bool {
        self.pinned
    }

    #[inline]
    fn read_into(&self, offset: usize, dst: &mut [u8]) -> FlatResult<()> {
        read_cells(self.cells, offset, dst)
    }

    #[inline]
    fn get_span(&self, offset: usize, length: usize) -> FlatResult<&[Cell<u8>]> {
        span_cells(self.cells, offset, length)
    }
}

/// A read-only input buffer borrowing caller-owned memory.
///
/// Every request for a mutable view fails with an invalid-operation error, so a read-only input
/// can never be used to build an object that writes into memory the caller does not own.
#[derive(Clone, Copy, Debug)]
pub struct ReadOnlyMemoryInputBuffer<'a> {
    data: &'a [u8],
    pinned: bool,
}

impl<'a> ReadOnlyMemoryInputBuffer<'a> {
    /// Borrow the given memory, which is not pinned.
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_pinned(data, false)
    }

    /// Borrow the given memory and declare whether it is pinned.
    pub fn with_pinned(data: &'a [u8], pinned: bool) -> Self {
        Self { data, pinned }
    }

    /// The borrowed bytes.
    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }
}

impl InputBuffer for ReadOnlyMemoryInputBuffer<'_> {
    #[inline]
    fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    fn is_read_only(&self) -> bool {
        true
    }

    #[inline]
    fn is_pinned(&self) -> bool {
        self.pinned
    }

    #[inline]
    fn contiguous(&self) -> Option<&[u8]> {
        Some(self.data)
    }

    #[inline]
    fn read_into(&self, offset: usize, dst: &mut [u8]) -> FlatResult<()> {
        let range = checked_range(offset, dst.len(), self.data.len())?;
        dst.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_from(&self, _offset: usize, _src: &[u8]) -> FlatResult<()> {
        flat_bail!(InvalidOperation: "cannot write into a read-only buffer")
    }

    fn get_span(&self, _offset: usize, _length: usize) -> FlatResult<&[Cell<u8>]> {
        flat_bail!(InvalidOperation: "cannot create a mutable span over a read-only buffer")
    }
}
