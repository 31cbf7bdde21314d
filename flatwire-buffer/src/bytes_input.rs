use std::cell::Cell;

use bytes::Bytes;
use flatwire_error::{FlatResult, flat_bail};

use crate::input::checked_range;
use crate::InputBuffer;

/// A read-only input buffer that owns a reference-counted [`Bytes`].
///
/// Unlike the borrowing buffers this one is `Send + Sync` and `'static`, so parsed objects over
/// it can outlive the scope that produced the bytes. Memory handles are zero-copy slices.
#[derive(Clone, Debug)]
pub struct BytesInputBuffer {
    bytes: Bytes,
}

impl BytesInputBuffer {
    /// Wrap the given bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Unwrap the inner bytes.
    pub fn into_inner(self) -> Bytes {
        self.bytes
    }
}

impl From<Bytes> for BytesInputBuffer {
    fn from(value: Bytes) -> Self {
        Self::new(value)
    }
}

impl InputBuffer for BytesInputBuffer {
    #[inline]
    fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    fn is_read_only(&self) -> bool {
        true
    }

    /// `Bytes` never moves its backing allocation.
    #[inline]
    fn is_pinned(&self) -> bool {
        true
    }

    #[inline]
    fn contiguous(&self) -> Option<&[u8]> {
        Some(self.bytes.as_ref())
    }

    #[inline]
    fn read_into(&self, offset: usize, dst: &mut [u8]) -> FlatResult<()> {
        let range = checked_range(offset, dst.len(), self.bytes.len())?;
        dst.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write_from(&self, _offset: usize, _src: &[u8]) -> FlatResult<()> {
        flat_bail!(InvalidOperation: "cannot write into a read-only buffer")
    }

    fn get_span(&self, _offset: usize, _length: usize) -> FlatResult<&[Cell<u8>]> {
        flat_bail!(InvalidOperation: "cannot create a mutable span over a read-only buffer")
    }

    fn get_read_only_memory(&self, offset: usize, length: usize) -> FlatResult<Bytes> {
        let range = checked_range(offset, length, self.bytes.len())?;
        Ok(self.bytes.slice(range))
    }
}
