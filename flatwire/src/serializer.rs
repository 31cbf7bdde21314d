use std::sync::Arc;

use bytes::Bytes;
use flatwire_buffer::InputBuffer;
use flatwire_error::{ContextExt, FlatResult, flat_bail, flat_err};

use crate::codec::{FILE_IDENTIFIER_LENGTH, SIZE_OF_UOFFSET, SerializationContext};
use crate::options::SerializerOptions;
use crate::parse::{ParseContext, Table, parse_root};
use crate::schema::{Schema, TableId};
use crate::serialize::{Writer, max_size};
use crate::validate::{ValidationResult, Validator};
use crate::value::Value;

/// Writes, validates and parses buffers rooted at one table of a schema.
///
/// A serializer is cheap to clone and can be shared between threads. Every parse creates its own
/// shared string reader from the configured factory, so handles from different parses never
/// share state unless the factory hands out a shared reader.
#[derive(Debug, Clone)]
pub struct Serializer {
    schema: Arc<Schema>,
    root: TableId,
    options: SerializerOptions,
}

impl Serializer {
    /// Create a serializer for buffers whose root is the table named `root`.
    ///
    /// Fails with an invalid operation if write-through is enabled, the root reaches a field that
    /// declares it and the mode copies buffers out eagerly.
    pub fn new(schema: Arc<Schema>, root: &str, options: SerializerOptions) -> FlatResult<Self> {
        let root = schema.table_id(root)?;
        let mode = options.deserialization_mode();
        let declared = schema.reaches_write_through(root);
        if declared && options.enable_write_through() && mode.is_eager() {
            flat_bail!(
                InvalidOperation: "table {} has write-through fields, which cannot be used in {} mode",
                schema.table(root).name(),
                mode
            );
        }
        if declared && !options.enable_write_through() {
            log::warn!(
                "write-through is disabled, write-through fields of {} are read-only",
                schema.table(root).name()
            );
        }
        log::debug!(
            "created serializer for {} in {} mode",
            schema.table(root).name(),
            mode
        );
        Ok(Self {
            schema,
            root,
            options,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn root(&self) -> TableId {
        self.root
    }

    pub fn options(&self) -> &SerializerOptions {
        &self.options
    }

    /// An upper bound on the bytes [`Serializer::write`] needs for `value`.
    pub fn get_max_size(&self, value: &Value) -> FlatResult<usize> {
        max_size(&self.schema, self.root, value.as_table()?)
    }

    /// Write `value` to the front of `buffer`, returning the number of bytes written.
    ///
    /// Fails with [`flatwire_error::FlatError::BufferTooSmall`] instead of writing past the end.
    pub fn write(&self, buffer: &mut [u8], value: &Value) -> FlatResult<usize> {
        let table = value.as_table()?;
        let ctx = SerializationContext::new(buffer, self.options.share_vtables());
        let strings = self
            .options
            .shared_string_writer()
            .map(|factory| factory());
        let written = Writer::new(&self.schema, ctx, strings, self.options.force_defaults())
            .write_root(self.root, table)?;
        log::trace!(
            "wrote {} bytes for {}",
            written,
            self.schema.table(self.root).name()
        );
        Ok(written)
    }

    /// Write `value` into a new buffer of exactly the written size.
    pub fn serialize(&self, value: &Value) -> FlatResult<Bytes> {
        let mut buffer = vec![0u8; self.get_max_size(value)?];
        let written = self.write(&mut buffer, value)?;
        buffer.truncate(written);
        Ok(Bytes::from(buffer))
    }

    /// Parse `buffer` in the configured mode.
    pub fn parse<B: InputBuffer + Clone>(&self, buffer: B) -> FlatResult<Table<B>> {
        if self.options.validate_on_parse() {
            let bytes = buffer.get_read_only_span(0, buffer.len())?;
            self.validate(&bytes)
                .map_err(|err| flat_err!(InvalidFormat: "{}", err))?;
        }
        if let Some(identifier) = self.schema.file_identifier() {
            let end = SIZE_OF_UOFFSET + FILE_IDENTIFIER_LENGTH;
            if buffer.len() < end {
                flat_bail!(
                    InvalidFormat: "buffer of {} bytes cannot hold a file identifier",
                    buffer.len()
                );
            }
            let found = buffer.get_read_only_span(SIZE_OF_UOFFSET, FILE_IDENTIFIER_LENGTH)?;
            if found.as_ref() != identifier {
                flat_bail!(
                    InvalidFormat: "expected file identifier {} but found {}",
                    String::from_utf8_lossy(identifier),
                    String::from_utf8_lossy(&found)
                );
            }
        }
        let strings = self
            .options
            .shared_string_reader()
            .map(|factory| factory());
        let ctx = ParseContext::new(
            self.schema.clone(),
            self.options.deserialization_mode(),
            self.options.enable_write_through(),
            strings,
        );
        parse_root(ctx, self.root, buffer)
            .context(|| format!("parsing {}", self.schema.table(self.root).name()))
    }

    /// Check `bytes` with the configured validator limits.
    pub fn validate(&self, bytes: &[u8]) -> ValidationResult {
        Validator::new(&self.schema, self.root, self.options.validator()).validate(bytes)
    }
}

#[cfg(test)]
mod test {
    use flatwire_buffer::{ArrayInputBuffer, ScalarType};
    use flatwire_error::FlatError;

    use super::*;
    use crate::options::DeserializationMode;
    use crate::schema::{FieldDef, FieldType, SchemaBuilder, TableDef};
    use crate::value::TableValue;

    fn schema(identifier: Option<&str>) -> Arc<Schema> {
        let mut builder = SchemaBuilder::new().table(
            TableDef::new("Counter")
                .field(FieldDef::new("hits", 0, FieldType::Scalar(ScalarType::U64)).write_through())
                .field(FieldDef::new("label", 1, FieldType::String)),
        );
        if let Some(identifier) = identifier {
            builder = builder.file_identifier(identifier);
        }
        Arc::new(builder.build().unwrap())
    }

    fn counter() -> Value {
        Value::Table(TableValue::new().with(0, 3u64).with(1, "requests"))
    }

    #[test]
    fn eager_modes_reject_write_through() {
        let options =
            SerializerOptions::new().with_deserialization_mode(DeserializationMode::Greedy);
        let err = Serializer::new(schema(None), "Counter", options.clone()).unwrap_err();
        assert!(err.to_string().contains("write-through"));

        Serializer::new(schema(None), "Counter", options.with_write_through(false)).unwrap();
    }

    #[test]
    fn unknown_roots_are_rejected() {
        Serializer::new(schema(None), "Missing", SerializerOptions::default()).unwrap_err();
    }

    #[test]
    fn write_reports_small_buffers() {
        let serializer =
            Serializer::new(schema(None), "Counter", SerializerOptions::default()).unwrap();
        let mut buffer = [0u8; 8];
        assert!(matches!(
            serializer.write(&mut buffer, &counter()).unwrap_err(),
            FlatError::BufferTooSmall(..)
        ));
        let written = serializer.serialize(&counter()).unwrap();
        assert!(serializer.get_max_size(&counter()).unwrap() >= written.len());
    }

    #[test]
    fn write_through_reaches_the_buffer() {
        let serializer =
            Serializer::new(schema(None), "Counter", SerializerOptions::default()).unwrap();
        let bytes = serializer.serialize(&counter()).unwrap();
        let buffer = ArrayInputBuffer::new(bytes.to_vec());
        let table = serializer.parse(buffer.clone()).unwrap();
        table.set(0, 4u64).unwrap();

        let reparsed = serializer.parse(buffer).unwrap();
        assert_eq!(reparsed.scalar::<u64>(0).unwrap(), 4);
        assert_eq!(reparsed.string(1).unwrap().as_deref(), Some("requests"));
    }

    #[test]
    fn parse_checks_the_file_identifier() {
        let serializer =
            Serializer::new(schema(Some("CNTR")), "Counter", SerializerOptions::default()).unwrap();
        let mut bytes = serializer.serialize(&counter()).unwrap().to_vec();
        serializer.parse(ArrayInputBuffer::new(bytes.clone())).unwrap();
        bytes[5] = b'X';
        assert!(serializer.parse(ArrayInputBuffer::new(bytes)).unwrap_err().is_format_error());
    }

    #[test]
    fn validate_on_parse_rejects_corrupt_buffers() {
        let options = SerializerOptions::new().with_validate_on_parse(true);
        let serializer = Serializer::new(schema(None), "Counter", options).unwrap();
        let mut bytes = serializer.serialize(&counter()).unwrap().to_vec();
        serializer.parse(ArrayInputBuffer::new(bytes.clone())).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(serializer.parse(ArrayInputBuffer::new(bytes)).unwrap_err().is_format_error());
    }
}
