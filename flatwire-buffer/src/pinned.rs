use std::cell::Cell;
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::ptr::NonNull;

use flatwire_error::{FlatResult, flat_bail, flat_err};

use crate::input::checked_range;
use crate::InputBuffer;

/// A scoped guard over caller memory that reads through raw pointers.
///
/// The guard borrows the memory for `'a`, so the memory can neither move nor be touched by the
/// caller while the guard lives. Each access performs one bounds check and then copies through a
/// raw pointer. The guard must be released exactly once: [`PinnedInputBuffer::release`] is
/// idempotent, dropping the guard releases it, and every access after release fails with
/// [`flatwire_error::FlatError::Disposed`].
///
/// Parsed objects hold `&PinnedInputBuffer`, so no view can outlive the guard.
pub struct PinnedInputBuffer<'a> {
    ptr: NonNull<u8>,
    len: usize,
    read_only: bool,
    released: Cell<bool>,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> PinnedInputBuffer<'a> {
    /// Pin writable memory.
    pub fn pin(data: &'a mut [u8]) -> Self {
        Self {
            len: data.len(),
            ptr: NonNull::from(data).cast(),
            read_only: false,
            released: Cell::new(false),
            _marker: PhantomData,
        }
    }

    /// Pin read-only memory. Every mutable view request fails.
    pub fn pin_read_only(data: &'a [u8]) -> Self {
        Self {
            len: data.len(),
            ptr: NonNull::from(data).cast(),
            read_only: true,
            released: Cell::new(false),
            _marker: PhantomData,
        }
    }

    /// Release the pin. Releasing twice is a no-op.
    pub fn release(&self) {
        if !self.released.replace(true) {
            log::trace!("released pinned buffer of {} bytes", self.len);
        }
    }

    /// Returns true once the buffer has been released.
    pub fn is_released(&self) -> bool {
        self.released.get()
    }

    #[inline]
    fn live(&self) -> FlatResult<()> {
        if self.released.get() {
            return Err(flat_err!(Disposed));
        }
        Ok(())
    }
}

impl Drop for PinnedInputBuffer<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl Debug for PinnedInputBuffer<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedInputBuffer")
            .field("len", &self.len)
            .field("read_only", &self.read_only)
            .field("released", &self.released.get())
            .finish()
    }
}

impl InputBuffer for PinnedInputBuffer<'_> {
    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[inline]
    fn is_pinned(&self) -> bool {
        !self.released.get()
    }

    /// Only read-only guards hand out a plain slice; a writable guard may be written through
    /// any span it has handed out.
    #[inline]
    fn contiguous(&self) -> Option<&[u8]> {
        if !self.read_only || self.released.get() {
            return None;
        }
        // SAFETY: the guard borrows `len` initialized bytes for `'a` and never writes them.
        Some(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) })
    }

    #[inline]
    fn read_into(&self, offset: usize, dst: &mut [u8]) -> FlatResult<()> {
        self.live()?;
        checked_range(offset, dst.len(), self.len)?;
        // SAFETY: the range was checked against the borrowed length, and `dst` is a distinct
        // Rust allocation so the two regions cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    fn get_span(&self, offset: usize, length: usize) -> FlatResult<&[Cell<u8>]> {
        self.live()?;
        if self.read_only {
            flat_bail!(InvalidOperation: "cannot create a mutable span over a read-only buffer");
        }
        checked_range(offset, length, self.len)?;
        // SAFETY: the guard holds the only borrow of this writable memory for `'a` and only ever
        // exposes it as cells, which have the same layout as `u8`.
        Ok(unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr().add(offset).cast::<Cell<u8>>(), length)
        })
    }
}
