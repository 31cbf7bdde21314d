use std::cell::Cell;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use flatwire_error::FlatResult;

use crate::input::{read_cells, span_cells};
use crate::InputBuffer;

/// A writable input buffer that owns a heap array of bytes.
///
/// Clones share the same array, so a write through one clone is visible through all of them.
/// The array may be moved by the allocator, so it never reports itself as pinned.
#[derive(Clone)]
pub struct ArrayInputBuffer {
    cells: Rc<[Cell<u8>]>,
}

impl ArrayInputBuffer {
    /// Take ownership of the given bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            cells: bytes.into().into_iter().map(Cell::new).collect(),
        }
    }

    /// Copy the current contents of the buffer out into a `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.cells.iter().map(Cell::get).collect()
    }
}

impl From<Vec<u8>> for ArrayInputBuffer {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl From<&[u8]> for ArrayInputBuffer {
    fn from(value: &[u8]) -> Self {
        Self::new(value.to_vec())
    }
}

impl Debug for ArrayInputBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayInputBuffer")
            .field("length", &self.cells.len())
            .finish()
    }
}

impl InputBuffer for ArrayInputBuffer {
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
        false
    }

    #[inline]
    fn read_into(&self, offset: usize, dst: &mut [u8]) -> FlatResult<()> {
        read_cells(&self.cells, offset, dst)
    }

    #[inline]
    fn get_span(&self, offset: usize, length: usize) -> FlatResult<&[Cell<u8>]> {
        span_cells(&self.cells, offset, length)
    }
}
