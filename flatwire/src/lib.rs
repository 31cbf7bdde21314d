//! A FlatBuffers runtime driven by an explicit schema.
//!
//! A [`schema::Schema`] describes tables, structs, unions and vectors once. A [`Serializer`] built
//! over it writes [`value::Value`]s into FlatBuffers, validates untrusted buffers and parses
//! buffers back into handles under one of four [`DeserializationMode`]s:
//!
//! * `Lazy` reads straight from the buffer on every access.
//! * `Progressive` reads each field once and caches it.
//! * `Greedy` copies the whole buffer out at parse time into immutable objects.
//! * `GreedyMutable` does the same, but the objects can be changed.
//!
//! Fields declared write-through can be changed in place in lazily parsed buffers.
//!
//! ```
//! use std::sync::Arc;
//!
//! use flatwire::schema::{FieldDef, FieldType, SchemaBuilder, TableDef};
//! use flatwire::value::{TableValue, Value};
//! use flatwire::{Serializer, SerializerOptions};
//! use flatwire_buffer::{ArrayInputBuffer, ScalarType};
//!
//! let schema = SchemaBuilder::new()
//!     .table(
//!         TableDef::new("Monster")
//!             .field(FieldDef::new("hp", 0, FieldType::Scalar(ScalarType::U16)))
//!             .field(FieldDef::new("name", 1, FieldType::String)),
//!     )
//!     .build()
//!     .unwrap();
//! let serializer = Serializer::new(Arc::new(schema), "Monster", SerializerOptions::default()).unwrap();
//!
//! let orc = Value::Table(TableValue::new().with(0, 300u16).with(1, "orc"));
//! let bytes = serializer.serialize(&orc).unwrap();
//! let monster = serializer.parse(ArrayInputBuffer::new(bytes.to_vec())).unwrap();
//! assert_eq!(monster.scalar::<u16>(0).unwrap(), 300);
//! assert_eq!(monster.string(1).unwrap().as_deref(), Some("orc"));
//! ```

pub mod codec;
pub mod options;
pub mod parse;
pub mod schema;
mod serialize;
mod serializer;
pub mod shared_string;
pub mod validate;
pub mod value;
pub mod vtable;

pub use options::{DeserializationMode, SerializerOptions, ValidatorOptions};
pub use parse::{FieldValue, StructRef, Table, UnionRef, Vector};
pub use serializer::*;
pub use validate::{ValidationError, ValidationErrorCode, ValidationResult, Validator};
