use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use flatwire_error::{FlatResult, flat_bail, flat_err};

use crate::InputBuffer;

/// A storable handle over a sub-range of an [`InputBuffer`].
///
/// The handle keeps its own clone of the buffer, so it can be stored on a parsed object and read
/// or written later without copying the bytes it covers.
#[derive(Clone)]
pub struct MemorySlice<B> {
    buffer: B,
    offset: usize,
    len: usize,
}

impl<B: InputBuffer> MemorySlice<B> {
    pub(crate) fn new(buffer: B, offset: usize, len: usize) -> Self {
        Self {
            buffer,
            offset,
            len,
        }
    }

    /// The number of bytes covered by this slice.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the slice covers no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The absolute offset of the first byte within the backing buffer.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The backing buffer.
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    /// Read the byte at `index`.
    pub fn get(&self, index: usize) -> FlatResult<u8> {
        let mut byte = [0u8; 1];
        self.buffer
            .read_into(self.absolute(index)?, &mut byte)?;
        Ok(byte[0])
    }

    /// Write the byte at `index` through to the backing buffer.
    pub fn set(&self, index: usize, value: u8) -> FlatResult<()> {
        self.buffer.write_from(self.absolute(index)?, &[value])
    }

    /// Overwrite the whole slice with `src`, which must have the same length.
    pub fn copy_from_slice(&self, src: &[u8]) -> FlatResult<()> {
        if src.len() != self.len {
            flat_bail!(
                "source length {} does not match memory slice length {}",
                src.len(),
                self.len
            );
        }
        self.buffer.write_from(self.offset, src)
    }

    /// Copy the current contents out into a `Vec`.
    pub fn to_vec(&self) -> FlatResult<Vec<u8>> {
        Ok(self
            .buffer
            .get_read_only_span(self.offset, self.len)?
            .into_owned())
    }

    /// The current contents as [`Bytes`], zero-copy where the buffer supports it.
    pub fn to_bytes(&self) -> FlatResult<Bytes> {
        self.buffer.get_read_only_memory(self.offset, self.len)
    }

    fn absolute(&self, index: usize) -> FlatResult<usize> {
        if index >= self.len {
            return Err(flat_err!(OutOfBounds: index, 0, self.len));
        }
        Ok(self.offset + index)
    }
}

impl<B> Debug for MemorySlice<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySlice")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use crate::{ArrayInputBuffer, InputBuffer};

    #[test]
    fn slice_reads_and_writes_window() {
        let buffer = ArrayInputBuffer::new(vec![0u8, 1, 2, 3, 4, 5]);
        let memory = buffer.get_memory(2, 3).unwrap();
        assert_eq!(memory.len(), 3);
        assert_eq!(memory.offset(), 2);
        assert_eq!(memory.get(0).unwrap(), 2);
        memory.copy_from_slice(&[7, 8, 9]).unwrap();
        assert_eq!(memory.to_vec().unwrap(), vec![7, 8, 9]);
        assert_eq!(buffer.to_vec(), vec![0, 1, 7, 8, 9, 5]);
        assert_eq!(memory.to_bytes().unwrap().as_ref(), &[7, 8, 9]);
    }

    #[test]
    fn slice_length_is_checked() {
        let buffer = ArrayInputBuffer::new(vec![0u8; 4]);
        let memory = buffer.get_memory(0, 2).unwrap();
        assert!(memory.get(2).is_err());
        assert!(memory.copy_from_slice(&[1, 2, 3]).is_err());
        assert!(buffer.get_memory(3, 2).is_err());
    }
}
