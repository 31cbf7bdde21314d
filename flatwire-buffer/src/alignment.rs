use std::fmt::Display;
use std::ops::Deref;

use flatwire_error::{FlatResult, flat_bail};

/// The alignment of a buffer or of a region allocated within one.
///
/// This type is a wrapper around `usize` that ensures the alignment is a power of 2 and fits
/// into a `u16`.
#[derive(Clone, Debug, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Alignment(usize);

impl Alignment {
    /// Create a new alignment.
    ///
    /// ## Panics
    ///
    /// Panics if `align` is not a power of 2, or is greater than `u16::MAX`.
    #[inline]
    pub const fn new(align: usize) -> Self {
        assert!(align > 0, "Alignment must be greater than 0");
        assert!(align <= u16::MAX as usize, "Alignment must fit into u16");
        assert!(align.is_power_of_two(), "Alignment must be a power of 2");
        Self(align)
    }

    /// Create a new alignment, returning an error instead of panicking on invalid input.
    pub fn try_new(align: usize) -> FlatResult<Self> {
        if align == 0 || align > u16::MAX as usize || !align.is_power_of_two() {
            flat_bail!("alignment {} must be a power of 2 that fits into u16", align);
        }
        Ok(Self(align))
    }

    /// An alignment of one byte, i.e. no alignment requirement.
    #[inline]
    pub const fn none() -> Self {
        Self::new(1)
    }

    /// Create an alignment from the alignment of a type `T`.
    #[inline]
    pub const fn of<T>() -> Self {
        Self::new(align_of::<T>())
    }

    /// Check if this alignment is a "larger" than another alignment.
    ///
    /// ## Example
    ///
    /// ```
    /// use flatwire_buffer::Alignment;
    ///
    /// let a = Alignment::new(4);
    /// let b = Alignment::new(2);
    /// assert!(a.is_aligned_to(b));
    /// assert!(!b.is_aligned_to(a));
    /// ```
    #[inline]
    pub fn is_aligned_to(&self, other: Alignment) -> bool {
        self.0.trailing_zeros() >= other.0.trailing_zeros()
    }

    /// Returns true if `offset` is a multiple of this alignment.
    #[inline]
    pub fn is_offset_aligned(&self, offset: usize) -> bool {
        offset & (self.0 - 1) == 0
    }

    /// Round `offset` up to the next multiple of this alignment.
    #[inline]
    pub fn align_up(&self, offset: usize) -> Option<usize> {
        offset
            .checked_add(self.0 - 1)
            .map(|bumped| bumped & !(self.0 - 1))
    }

    /// The number of padding bytes needed to move `offset` onto this alignment.
    #[inline]
    pub fn padding_for(&self, offset: usize) -> usize {
        offset.wrapping_neg() & (self.0 - 1)
    }

    /// Returns the log2 of the alignment.
    #[allow(clippy::cast_possible_truncation)]
    pub fn exponent(&self) -> u8 {
        // An alignment that fits into u16 has at most 15 trailing zeros.
        self.0.trailing_zeros() as u8
    }
}

impl Display for Alignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for Alignment {
    type Target = usize;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<usize> for Alignment {
    #[inline]
    fn from(value: usize) -> Self {
        Self::new(value)
    }
}

impl From<Alignment> for usize {
    #[inline]
    fn from(value: Alignment) -> Self {
        value.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    #[should_panic]
    fn alignment_zero() {
        Alignment::new(0);
    }

    #[test]
    #[should_panic]
    fn alignment_not_power_of_two() {
        Alignment::new(3);
    }

    #[test]
    fn try_new_rejects_invalid() {
        assert!(Alignment::try_new(6).is_err());
        assert_eq!(Alignment::try_new(8).unwrap(), Alignment::new(8));
    }

    #[test]
    fn align_up_and_padding() {
        let eight = Alignment::new(8);
        assert_eq!(eight.align_up(0), Some(0));
        assert_eq!(eight.align_up(1), Some(8));
        assert_eq!(eight.align_up(16), Some(16));
        assert_eq!(eight.padding_for(12), 4);
        assert_eq!(eight.padding_for(16), 0);
        assert_eq!(eight.align_up(usize::MAX), None);
        assert!(eight.is_offset_aligned(24));
        assert!(!eight.is_offset_aligned(20));
    }

    #[test]
    fn exponent() {
        assert_eq!(Alignment::new(1).exponent(), 0);
        assert_eq!(Alignment::new(16).exponent(), 4);
    }
}
