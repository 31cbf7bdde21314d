use std::fmt::{Debug, Display, Formatter};

use flatwire_error::{FlatResult, flat_bail, flat_err};
use num_traits::{FromBytes, ToBytes};

use crate::Alignment;

/// The widest scalar on the wire, in bytes.
pub const MAX_SCALAR_SIZE: usize = 8;

/// The scalar kinds that can appear inline in a table, struct or vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScalarType {
    /// A single byte, zero is `false` and anything else is `true`.
    Bool,
    /// An unsigned 8-bit integer.
    U8,
    /// A signed 8-bit integer.
    I8,
    /// An unsigned 16-bit integer.
    U16,
    /// A signed 16-bit integer.
    I16,
    /// An unsigned 32-bit integer.
    U32,
    /// A signed 32-bit integer.
    I32,
    /// An unsigned 64-bit integer.
    U64,
    /// A signed 64-bit integer.
    I64,
    /// An IEEE-754 single precision float.
    F32,
    /// An IEEE-754 double precision float.
    F64,
}

impl ScalarType {
    /// The width of this scalar on the wire, in bytes.
    #[inline]
    pub const fn byte_width(&self) -> usize {
        match self {
            Self::Bool | Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    /// Scalars are always aligned to their own width.
    #[inline]
    pub const fn alignment(&self) -> Alignment {
        Alignment::new(self.byte_width())
    }

    /// Returns true for the integer types.
    pub const fn is_int(&self) -> bool {
        self.is_unsigned_int() || self.is_signed_int()
    }

    /// Returns true for the unsigned integer types.
    pub const fn is_unsigned_int(&self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U32 | Self::U64)
    }

    /// Returns true for the signed integer types.
    pub const fn is_signed_int(&self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    /// Returns true for the floating point types.
    pub const fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Returns true if values of this type can be viewed in place as a native Rust slice.
    pub const fn is_native(&self) -> bool {
        !matches!(self, Self::Bool)
    }
}

impl Display for ScalarType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::U8 => write!(f, "u8"),
            Self::I8 => write!(f, "i8"),
            Self::U16 => write!(f, "u16"),
            Self::I16 => write!(f, "i16"),
            Self::U32 => write!(f, "u32"),
            Self::I32 => write!(f, "i32"),
            Self::U64 => write!(f, "u64"),
            Self::I64 => write!(f, "i64"),
            Self::F32 => write!(f, "f32"),
            Self::F64 => write!(f, "f64"),
        }
    }
}

/// A Rust type that has a fixed little-endian wire representation.
pub trait Scalar: Copy + Debug + PartialEq + Send + Sync + 'static {
    /// The wire scalar kind of this type.
    const SCALAR_TYPE: ScalarType;

    /// The width of this scalar on the wire, in bytes.
    const SIZE: usize = Self::SCALAR_TYPE.byte_width();

    /// Decode a value from exactly [`Self::SIZE`] little-endian bytes.
    fn from_le_slice(bytes: &[u8]) -> FlatResult<Self>;

    /// Encode a value into exactly [`Self::SIZE`] little-endian bytes.
    fn write_le_slice(self, dst: &mut [u8]) -> FlatResult<()>;
}

/// Scalars whose wire layout is byte-for-byte identical to their in-memory layout on a
/// little-endian host.
///
/// # Safety
///
/// Implementors must have no padding, no invalid bit patterns, and a size equal to
/// `Self::SIZE`.
pub unsafe trait NativeScalar: Scalar {}

impl Scalar for bool {
    const SCALAR_TYPE: ScalarType = ScalarType::Bool;

    #[inline]
    fn from_le_slice(bytes: &[u8]) -> FlatResult<Self> {
        match bytes {
            [b] => Ok(*b != 0),
            _ => flat_bail!("expected 1 byte for bool but got {}", bytes.len()),
        }
    }

    #[inline]
    fn write_le_slice(self, dst: &mut [u8]) -> FlatResult<()> {
        match dst {
            [b] => {
                *b = u8::from(self);
                Ok(())
            }
            _ => flat_bail!("expected 1 byte for bool but got {}", dst.len()),
        }
    }
}

macro_rules! native_scalar {
    ($T:ty, $ST:ident) => {
        impl Scalar for $T {
            const SCALAR_TYPE: ScalarType = ScalarType::$ST;

            #[inline]
            fn from_le_slice(bytes: &[u8]) -> FlatResult<Self> {
                let raw: [u8; size_of::<$T>()] = bytes.try_into().map_err(|_| {
                    flat_err!(
                        "expected {} bytes for {} but got {}",
                        size_of::<$T>(),
                        ScalarType::$ST,
                        bytes.len()
                    )
                })?;
                Ok(<$T as FromBytes>::from_le_bytes(&raw))
            }

            #[inline]
            fn write_le_slice(self, dst: &mut [u8]) -> FlatResult<()> {
                let raw = <$T as ToBytes>::to_le_bytes(&self);
                if dst.len() != raw.len() {
                    flat_bail!(
                        "expected {} bytes for {} but got {}",
                        raw.len(),
                        ScalarType::$ST,
                        dst.len()
                    );
                }
                dst.copy_from_slice(&raw);
                Ok(())
            }
        }

        unsafe impl NativeScalar for $T {}
    };
}

native_scalar!(u8, U8);
native_scalar!(i8, I8);
native_scalar!(u16, U16);
native_scalar!(i16, I16);
native_scalar!(u32, U32);
native_scalar!(i32, I32);
native_scalar!(u64, U64);
native_scalar!(i64, I64);
native_scalar!(f32, F32);
native_scalar!(f64, F64);

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ScalarType::Bool, 1)]
    #[case(ScalarType::I8, 1)]
    #[case(ScalarType::U16, 2)]
    #[case(ScalarType::F32, 4)]
    #[case(ScalarType::I64, 8)]
    #[case(ScalarType::F64, 8)]
    fn widths(#[case] scalar_type: ScalarType, #[case] width: usize) {
        assert_eq!(scalar_type.byte_width(), width);
        assert_eq!(*scalar_type.alignment(), width);
    }

    #[test]
    fn little_endian_regardless_of_host() {
        let mut raw = [0u8; 4];
        0x0403_0201u32.write_le_slice(&mut raw).unwrap();
        assert_eq!(raw, [1, 2, 3, 4]);
        assert_eq!(u32::from_le_slice(&raw).unwrap(), 0x0403_0201);
        assert_eq!(i16::from_le_slice(&[0xFE, 0xFF]).unwrap(), -2);
        assert_eq!(f64::from_le_slice(&1.5f64.to_le_bytes()).unwrap(), 1.5);
    }

    #[test]
    fn wrong_width_is_an_error() {
        assert!(u64::from_le_slice(&[0; 4]).is_err());
        assert!(true.write_le_slice(&mut [0u8; 2]).is_err());
    }

    #[test]
    fn bool_is_any_non_zero() {
        assert!(!bool::from_le_slice(&[0]).unwrap());
        assert!(bool::from_le_slice(&[7]).unwrap());
        assert_eq!(bool::SIZE, 1);
        assert!(!ScalarType::Bool.is_native());
    }
}
