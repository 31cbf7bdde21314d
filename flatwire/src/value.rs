//! Buffer-free values.
//!
//! A [`Value`] is what gets written by the serializer and what every parsed object converts back
//! into with `to_value`. Tables are keyed by field index, structs list their fields in
//! declaration order.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use flatwire_buffer::{Scalar, ScalarType};
use flatwire_error::{FlatError, FlatResult, flat_bail, flat_err};
use paste::paste;

/// A single scalar value, tagged with its wire type.
#[derive(Debug, Clone, Copy)]
pub enum ScalarValue {
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(s), Self::Bool(o)) => s == o,
            (Self::F32(s), Self::F32(o)) => s.total_cmp(o).is_eq(),
            (Self::F64(s), Self::F64(o)) => s.total_cmp(o).is_eq(),
            (s, o) => match (s.as_i128(), o.as_i128()) {
                (Some(s), Some(o)) => s == o,
                _ => false,
            },
        }
    }
}

macro_rules! as_primitive {
    ($T:ty) => {
        paste! {
            #[doc = "Access the value as `" $T "`, returning `None` if conversion is unsuccessful"]
            pub fn [<as_ $T>](self) -> Option<$T> {
                match self {
                    ScalarValue::Bool(_) => None,
                    ScalarValue::U8(v) => <$T as num_traits::NumCast>::from(v),
                    ScalarValue::I8(v) => <$T as num_traits::NumCast>::from(v),
                    ScalarValue::U16(v) => <$T as num_traits::NumCast>::from(v),
                    ScalarValue::I16(v) => <$T as num_traits::NumCast>::from(v),
                    ScalarValue::U32(v) => <$T as num_traits::NumCast>::from(v),
                    ScalarValue::I32(v) => <$T as num_traits::NumCast>::from(v),
                    ScalarValue::U64(v) => <$T as num_traits::NumCast>::from(v),
                    ScalarValue::I64(v) => <$T as num_traits::NumCast>::from(v),
                    ScalarValue::F32(v) => <$T as num_traits::NumCast>::from(v),
                    ScalarValue::F64(v) => <$T as num_traits::NumCast>::from(v),
                }
            }
        }
    };
}

impl ScalarValue {
    /// The zero value of a scalar type, which is also the implicit default of every scalar field.
    pub fn zero(scalar_type: ScalarType) -> Self {
        match scalar_type {
            ScalarType::Bool => Self::Bool(false),
            ScalarType::U8 => Self::U8(0),
            ScalarType::I8 => Self::I8(0),
            ScalarType::U16 => Self::U16(0),
            ScalarType::I16 => Self::I16(0),
            ScalarType::U32 => Self::U32(0),
            ScalarType::I32 => Self::I32(0),
            ScalarType::U64 => Self::U64(0),
            ScalarType::I64 => Self::I64(0),
            ScalarType::F32 => Self::F32(0.0),
            ScalarType::F64 => Self::F64(0.0),
        }
    }

    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Bool(_) => ScalarType::Bool,
            Self::U8(_) => ScalarType::U8,
            Self::I8(_) => ScalarType::I8,
            Self::U16(_) => ScalarType::U16,
            Self::I16(_) => ScalarType::I16,
            Self::U32(_) => ScalarType::U32,
            Self::I32(_) => ScalarType::I32,
            Self::U64(_) => ScalarType::U64,
            Self::I64(_) => ScalarType::I64,
            Self::F32(_) => ScalarType::F32,
            Self::F64(_) => ScalarType::F64,
        }
    }

    pub fn is_instance_of(&self, scalar_type: ScalarType) -> bool {
        self.scalar_type() == scalar_type
    }

    #[inline]
    pub fn as_primitive<T: Scalar + TryFrom<ScalarValue, Error = FlatError>>(
        &self,
    ) -> FlatResult<T> {
        T::try_from(*self)
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match *self {
            Self::U8(v) => Some(i128::from(v)),
            Self::I8(v) => Some(i128::from(v)),
            Self::U16(v) => Some(i128::from(v)),
            Self::I16(v) => Some(i128::from(v)),
            Self::U32(v) => Some(i128::from(v)),
            Self::I32(v) => Some(i128::from(v)),
            Self::U64(v) => Some(i128::from(v)),
            Self::I64(v) => Some(i128::from(v)),
            Self::Bool(_) | Self::F32(_) | Self::F64(_) => None,
        }
    }

    /// Convert into another scalar type, failing if the value is not representable.
    ///
    /// Booleans only convert to booleans. Integers and floats convert between each other
    /// following [`num_traits::NumCast`].
    pub fn cast(self, scalar_type: ScalarType) -> FlatResult<Self> {
        if self.scalar_type() == scalar_type {
            return Ok(self);
        }
        let cast = match scalar_type {
            ScalarType::Bool => None,
            ScalarType::U8 => self.as_u8().map(Self::U8),
            ScalarType::I8 => self.as_i8().map(Self::I8),
            ScalarType::U16 => self.as_u16().map(Self::U16),
            ScalarType::I16 => self.as_i16().map(Self::I16),
            ScalarType::U32 => self.as_u32().map(Self::U32),
            ScalarType::I32 => self.as_i32().map(Self::I32),
            ScalarType::U64 => self.as_u64().map(Self::U64),
            ScalarType::I64 => self.as_i64().map(Self::I64),
            ScalarType::F32 => self.as_f32().map(Self::F32),
            ScalarType::F64 => self.as_f64().map(Self::F64),
        };
        cast.ok_or_else(|| flat_err!(MismatchedTypes: scalar_type, self))
    }

    /// Decode a scalar of the given type from its little-endian wire bytes.
    pub fn from_le_slice(scalar_type: ScalarType, bytes: &[u8]) -> FlatResult<Self> {
        Ok(match scalar_type {
            ScalarType::Bool => Self::Bool(bool::from_le_slice(bytes)?),
            ScalarType::U8 => Self::U8(u8::from_le_slice(bytes)?),
            ScalarType::I8 => Self::I8(i8::from_le_slice(bytes)?),
            ScalarType::U16 => Self::U16(u16::from_le_slice(bytes)?),
            ScalarType::I16 => Self::I16(i16::from_le_slice(bytes)?),
            ScalarType::U32 => Self::U32(u32::from_le_slice(bytes)?),
            ScalarType::I32 => Self::I32(i32::from_le_slice(bytes)?),
            ScalarType::U64 => Self::U64(u64::from_le_slice(bytes)?),
            ScalarType::I64 => Self::I64(i64::from_le_slice(bytes)?),
            ScalarType::F32 => Self::F32(f32::from_le_slice(bytes)?),
            ScalarType::F64 => Self::F64(f64::from_le_slice(bytes)?),
        })
    }

    /// Encode the scalar into exactly `byte_width` little-endian bytes.
    pub fn write_le_slice(self, dst: &mut [u8]) -> FlatResult<()> {
        match self {
            Self::Bool(v) => v.write_le_slice(dst),
            Self::U8(v) => v.write_le_slice(dst),
            Self::I8(v) => v.write_le_slice(dst),
            Self::U16(v) => v.write_le_slice(dst),
            Self::I16(v) => v.write_le_slice(dst),
            Self::U32(v) => v.write_le_slice(dst),
            Self::I32(v) => v.write_le_slice(dst),
            Self::U64(v) => v.write_le_slice(dst),
            Self::I64(v) => v.write_le_slice(dst),
            Self::F32(v) => v.write_le_slice(dst),
            Self::F64(v) => v.write_le_slice(dst),
        }
    }

    as_primitive!(i8);
    as_primitive!(i16);
    as_primitive!(i32);
    as_primitive!(i64);
    as_primitive!(u8);
    as_primitive!(u16);
    as_primitive!(u32);
    as_primitive!(u64);
    as_primitive!(f32);
    as_primitive!(f64);
}

macro_rules! num_scalar_value {
    ($T:ty, $ST:tt) => {
        impl TryFrom<ScalarValue> for $T {
            type Error = FlatError;

            fn try_from(value: ScalarValue) -> Result<Self, Self::Error> {
                paste! { value.[<as_ $T>]() }
                    .ok_or_else(|| flat_err!(MismatchedTypes: ScalarType::$ST, value))
            }
        }

        impl From<$T> for ScalarValue {
            fn from(value: $T) -> Self {
                ScalarValue::$ST(value)
            }
        }

        impl From<$T> for Value {
            fn from(value: $T) -> Self {
                Value::Scalar(ScalarValue::$ST(value))
            }
        }
    };
}

num_scalar_value!(u8, U8);
num_scalar_value!(i8, I8);
num_scalar_value!(u16, U16);
num_scalar_value!(i16, I16);
num_scalar_value!(u32, U32);
num_scalar_value!(i32, I32);
num_scalar_value!(u64, U64);
num_scalar_value!(i64, I64);
num_scalar_value!(f32, F32);
num_scalar_value!(f64, F64);

impl TryFrom<ScalarValue> for bool {
    type Error = FlatError;

    fn try_from(value: ScalarValue) -> Result<Self, Self::Error> {
        value
            .as_bool()
            .ok_or_else(|| flat_err!(MismatchedTypes: ScalarType::Bool, value))
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Bool(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Scalar(ScalarValue::Bool(value))
    }
}

impl Display for ScalarValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::U8(v) => write!(f, "{}u8", v),
            Self::I8(v) => write!(f, "{}i8", v),
            Self::U16(v) => write!(f, "{}u16", v),
            Self::I16(v) => write!(f, "{}i16", v),
            Self::U32(v) => write!(f, "{}u32", v),
            Self::I32(v) => write!(f, "{}i32", v),
            Self::U64(v) => write!(f, "{}u64", v),
            Self::I64(v) => write!(f, "{}i64", v),
            Self::F32(v) => write!(f, "{}f32", v),
            Self::F64(v) => write!(f, "{}f64", v),
        }
    }
}

/// A buffer-free value of any field type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(ScalarValue),
    String(Arc<str>),
    /// The contents of a `u8` vector.
    Bytes(Bytes),
    Struct(StructValue),
    Table(TableValue),
    Vector(Vec<Value>),
    Union(UnionValue),
}

impl Value {
    /// A short name of the variant, used in type mismatch errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Struct(_) => "struct",
            Self::Table(_) => "table",
            Self::Vector(_) => "vector",
            Self::Union(_) => "union",
        }
    }

    pub fn as_scalar(&self) -> FlatResult<ScalarValue> {
        match self {
            Self::Scalar(s) => Ok(*s),
            other => Err(flat_err!(MismatchedTypes: "scalar", other.kind_name())),
        }
    }

    pub fn as_str(&self) -> FlatResult<&Arc<str>> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(flat_err!(MismatchedTypes: "string", other.kind_name())),
        }
    }

    pub fn as_table(&self) -> FlatResult<&TableValue> {
        match self {
            Self::Table(t) => Ok(t),
            other => Err(flat_err!(MismatchedTypes: "table", other.kind_name())),
        }
    }

    pub fn as_struct(&self) -> FlatResult<&StructValue> {
        match self {
            Self::Struct(s) => Ok(s),
            other => Err(flat_err!(MismatchedTypes: "struct", other.kind_name())),
        }
    }

    pub fn as_union(&self) -> FlatResult<&UnionValue> {
        match self {
            Self::Union(u) => Ok(u),
            other => Err(flat_err!(MismatchedTypes: "union", other.kind_name())),
        }
    }
}

impl From<ScalarValue> for Value {
    fn from(value: ScalarValue) -> Self {
        Value::Scalar(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value.into())
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Bytes(value)
    }
}

impl From<TableValue> for Value {
    fn from(value: TableValue) -> Self {
        Value::Table(value)
    }
}

impl From<StructValue> for Value {
    fn from(value: StructValue) -> Self {
        Value::Struct(value)
    }
}

impl From<UnionValue> for Value {
    fn from(value: UnionValue) -> Self {
        Value::Union(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Vector(value)
    }
}

/// The fields of a struct in declaration order. Each field is a scalar or a nested struct.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructValue(Vec<Value>);

impl StructValue {
    pub fn new(fields: Vec<Value>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &[Value] {
        &self.0
    }

    pub fn field(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Value> for StructValue {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The present fields of a table, keyed by field index.
///
/// A field missing from the map is absent on the wire. Union fields are keyed by the index of
/// their discriminator slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableValue(BTreeMap<u8, Value>);

impl TableValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`TableValue::set`].
    pub fn with(mut self, index: u8, value: impl Into<Value>) -> Self {
        self.set(index, value);
        self
    }

    pub fn set(&mut self, index: u8, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(index, value.into())
    }

    pub fn get(&self, index: u8) -> Option<&Value> {
        self.0.get(&index)
    }

    pub fn remove(&mut self, index: u8) -> Option<Value> {
        self.0.remove(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &Value)> + '_ {
        self.0.iter().map(|(index, value)| (*index, value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(u8, Value)> for TableValue {
    fn from_iter<T: IntoIterator<Item = (u8, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A present union: a non-zero member tag and the member value.
#[derive(Debug, Clone, PartialEq)]
pub struct UnionValue {
    tag: u8,
    value: Box<Value>,
}

impl UnionValue {
    pub fn new(tag: u8, value: impl Into<Value>) -> Self {
        Self {
            tag,
            value: Box::new(value.into()),
        }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// The key of an element in a sorted or indexed vector.
///
/// Keys of the same kind order naturally: floats by their total order, strings byte-wise. Keys
/// of different kinds never compare equal.
#[derive(Debug, Clone)]
pub enum SortKey {
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    String(Arc<str>),
}

impl SortKey {
    /// The key for a scalar key field.
    pub fn from_scalar(value: ScalarValue) -> Self {
        match value {
            ScalarValue::Bool(v) => Self::Bool(v),
            ScalarValue::U8(v) => Self::Unsigned(u64::from(v)),
            ScalarValue::U16(v) => Self::Unsigned(u64::from(v)),
            ScalarValue::U32(v) => Self::Unsigned(u64::from(v)),
            ScalarValue::U64(v) => Self::Unsigned(v),
            ScalarValue::I8(v) => Self::Signed(i64::from(v)),
            ScalarValue::I16(v) => Self::Signed(i64::from(v)),
            ScalarValue::I32(v) => Self::Signed(i64::from(v)),
            ScalarValue::I64(v) => Self::Signed(v),
            ScalarValue::F32(v) => Self::Float(f64::from(v)),
            ScalarValue::F64(v) => Self::Float(v),
        }
    }

    /// The key of a field value, which must be a scalar or a string.
    pub fn from_value(value: &Value) -> FlatResult<Self> {
        match value {
            Value::Scalar(s) => Ok(Self::from_scalar(*s)),
            Value::String(s) => Ok(Self::String(s.clone())),
            other => flat_bail!(MismatchedTypes: "scalar or string key", other.kind_name()),
        }
    }

    /// This key in the key space of a scalar key field of `scalar_type`, or `None` if no value of
    /// that type equals it.
    pub fn coerce(&self, scalar_type: ScalarType) -> Option<Self> {
        let value = match self {
            Self::Bool(v) => ScalarValue::Bool(*v),
            Self::Signed(v) => ScalarValue::I64(*v),
            Self::Unsigned(v) => ScalarValue::U64(*v),
            Self::Float(v) => ScalarValue::F64(*v),
            Self::String(_) => return None,
        };
        let cast = value.cast(scalar_type).ok()?;
        // 2.5 casts to 2 and back to 2.0, so it matches no integer key
        let restored = cast.cast(value.scalar_type()).ok()?;
        (restored == value).then(|| Self::from_scalar(cast))
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 0,
            Self::Signed(_) => 1,
            Self::Unsigned(_) => 2,
            Self::Float(_) => 3,
            Self::String(_) => 4,
        }
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for SortKey {}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(s), Self::Bool(o)) => s.cmp(o),
            (Self::Signed(s), Self::Signed(o)) => s.cmp(o),
            (Self::Unsigned(s), Self::Unsigned(o)) => s.cmp(o),
            (Self::Float(s), Self::Float(o)) => s.total_cmp(o),
            (Self::String(s), Self::String(o)) => s.as_bytes().cmp(o.as_bytes()),
            (s, o) => s.rank().cmp(&o.rank()),
        }
    }
}

impl Display for SortKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Signed(v) => write!(f, "{}", v),
            Self::Unsigned(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "\"{}\"", v),
        }
    }
}

impl From<&str> for SortKey {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

impl From<ScalarValue> for SortKey {
    fn from(value: ScalarValue) -> Self {
        Self::from_scalar(value)
    }
}

macro_rules! sort_key_from {
    ($T:ty) => {
        impl From<$T> for SortKey {
            fn from(value: $T) -> Self {
                Self::from_scalar(ScalarValue::from(value))
            }
        }
    };
}

sort_key_from!(bool);
sort_key_from!(u8);
sort_key_from!(i8);
sort_key_from!(u16);
sort_key_from!(i16);
sort_key_from!(u32);
sort_key_from!(i32);
sort_key_from!(u64);
sort_key_from!(i64);
sort_key_from!(f32);
sort_key_from!(f64);
