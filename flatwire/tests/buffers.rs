#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use bytes::Bytes;
    use flatwire::schema::{
        ElementType, FieldDef, FieldType, SchemaBuilder, TableDef, VectorKind, VectorType,
    };
    use flatwire::shared_string::concurrent_reader;
    use flatwire::value::{TableValue, Value};
    use flatwire::{DeserializationMode, Serializer, SerializerOptions};
    use flatwire_buffer::{
        ArrayInputBuffer, BytesInputBuffer, MemoryInputBuffer, ReadOnlyMemoryInputBuffer,
        ScalarType,
    };
    use flatwire_error::FlatError;
    use rstest::rstest;

    /// `Series { samples: Native<f64>, raw: Memory<u8> (write-through), count: u32 (write-through),
    /// label: shared string }`.
    fn series_serializer(options: SerializerOptions) -> Serializer {
        let schema = SchemaBuilder::new()
            .table(
                TableDef::new("Series")
                    .field(FieldDef::new(
                        "samples",
                        0,
                        FieldType::Vector(VectorType::new(
                            ElementType::Scalar(ScalarType::F64),
                            VectorKind::Native,
                        )),
                    ))
                    .field(
                        FieldDef::new(
                            "raw",
                            1,
                            FieldType::Vector(VectorType::new(
                                ElementType::Scalar(ScalarType::U8),
                                VectorKind::Memory,
                            )),
                        )
                        .write_through(),
                    )
                    .field(
                        FieldDef::new("count", 2, FieldType::Scalar(ScalarType::U32))
                            .write_through(),
                    )
                    .field(FieldDef::new("label", 3, FieldType::SharedString)),
            )
            .build()
            .unwrap();
        Serializer::new(Arc::new(schema), "Series", options).unwrap()
    }

    fn series() -> Value {
        Value::Table(
            TableValue::new()
                .with(
                    0,
                    Value::Vector(vec![1.5f64.into(), (-2.0f64).into(), 1e300f64.into()]),
                )
                .with(1, Bytes::from_static(b"wire"))
                .with(2, 3u32)
                .with(3, "temperature"),
        )
    }

    fn lazy() -> SerializerOptions {
        SerializerOptions::new().with_deserialization_mode(DeserializationMode::Lazy)
    }

    #[cfg(target_endian = "little")]
    #[rstest]
    fn pinned_buffers_hand_out_native_slices(
        #[values(DeserializationMode::Lazy, DeserializationMode::Progressive)]
        mode: DeserializationMode,
    ) {
        use flatwire_buffer::PinnedInputBuffer;

        let serializer = series_serializer(lazy().with_deserialization_mode(mode));
        let bytes = serializer.serialize(&series()).unwrap();
        let mut storage = vec![0u8; bytes.len() + 8];
        let start = storage.as_ptr().align_offset(8);
        let aligned = &mut storage[start..start + bytes.len()];
        aligned.copy_from_slice(&bytes);

        let pinned = PinnedInputBuffer::pin_read_only(aligned);
        let table = serializer.parse(&pinned).unwrap();
        let samples = table.vector(0).unwrap().unwrap();
        assert_eq!(samples.native_slice::<f64>().unwrap(), &[1.5, -2.0, 1e300]);
        samples.native_slice::<i64>().unwrap_err();
        assert_eq!(
            table.vector(1).unwrap().unwrap().bytes().unwrap().as_ref(),
            b"wire"
        );

        pinned.release();
        pinned.release();
        assert!(pinned.is_released());
        assert!(matches!(
            table.scalar::<u32>(2).unwrap_err().root_cause(),
            FlatError::Disposed(..)
        ));
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn pinned_writable_buffers_write_through() {
        use flatwire_buffer::PinnedInputBuffer;

        let serializer = series_serializer(lazy());
        let mut bytes = serializer.serialize(&series()).unwrap().to_vec();
        {
            let pinned = PinnedInputBuffer::pin(&mut bytes);
            let table = serializer.parse(&pinned).unwrap();
            table.set(2, 10u32).unwrap();
            // Writable pinned memory is not handed out as a shared slice.
            table.vector(0).unwrap().unwrap().native_slice::<f64>().unwrap_err();
        }
        let table = serializer.parse(ArrayInputBuffer::new(bytes)).unwrap();
        assert_eq!(table.scalar::<u32>(2).unwrap(), 10);
    }

    #[test]
    fn unpinned_buffers_refuse_native_slices() {
        let serializer = series_serializer(lazy());
        let bytes = serializer.serialize(&series()).unwrap();
        let table = serializer.parse(ArrayInputBuffer::new(bytes.to_vec())).unwrap();
        let samples = table.vector(0).unwrap().unwrap();
        assert!(matches!(
            samples.native_slice::<f64>().unwrap_err().root_cause(),
            FlatError::InvalidOperation(..)
        ));
        assert_eq!(samples.to_native_vec::<f64>().unwrap(), vec![1.5, -2.0, 1e300]);
    }

    #[test]
    fn read_only_memory_refuses_writes() {
        let serializer = series_serializer(lazy());
        let bytes = serializer.serialize(&series()).unwrap();
        let table = serializer.parse(ReadOnlyMemoryInputBuffer::new(&bytes)).unwrap();
        assert_eq!(table.scalar::<u32>(2).unwrap(), 3);
        table.set(2, 4u32).unwrap_err();
        table.vector(1).unwrap().unwrap().memory().unwrap_err();
        assert_eq!(table.scalar::<u32>(2).unwrap(), 3);
    }

    #[test]
    fn memory_slices_write_into_caller_memory() {
        let serializer = series_serializer(lazy());
        let mut bytes = serializer.serialize(&series()).unwrap().to_vec();
        {
            let table = serializer.parse(MemoryInputBuffer::new(&mut bytes)).unwrap();
            let raw = table.vector(1).unwrap().unwrap().memory().unwrap();
            assert_eq!(raw.len(), 4);
            raw.copy_from_slice(b"WIRE").unwrap();
            raw.set(0, b'F').unwrap();
            raw.set(4, 0).unwrap_err();
        }
        let table = serializer.parse(ArrayInputBuffer::new(bytes)).unwrap();
        assert_eq!(
            table.vector(1).unwrap().unwrap().bytes().unwrap().as_ref(),
            b"FIRE"
        );
    }

    #[test]
    fn write_through_can_be_switched_off() {
        let serializer = series_serializer(lazy().with_write_through(false));
        let bytes = serializer.serialize(&series()).unwrap();
        let table = serializer.parse(ArrayInputBuffer::new(bytes.to_vec())).unwrap();
        assert!(table.set(2, 4u32).unwrap_err().is_not_mutable());
        assert!(
            table
                .vector(1)
                .unwrap()
                .unwrap()
                .memory()
                .unwrap_err()
                .is_not_mutable()
        );
    }

    #[test]
    fn bytes_buffers_parse_on_many_threads() {
        let serializer = series_serializer(
            SerializerOptions::new()
                .with_deserialization_mode(DeserializationMode::Progressive)
                .with_shared_string_reader(concurrent_reader(16))
                .with_write_through(false),
        );
        let buffer = BytesInputBuffer::new(serializer.serialize(&series()).unwrap());
        thread::scope(|scope| {
            for _ in 0..4 {
                let buffer = buffer.clone();
                let serializer = &serializer;
                scope.spawn(move || {
                    let table = serializer.parse(buffer).unwrap();
                    assert_eq!(table.string(3).unwrap().as_deref(), Some("temperature"));
                    assert_eq!(table.to_value().unwrap(), series());
                });
            }
        });
    }

    #[test]
    fn truncated_buffers_fail_without_panicking() {
        let serializer = series_serializer(lazy());
        let bytes = serializer.serialize(&series()).unwrap();
        for length in 0..bytes.len() {
            let truncated = ArrayInputBuffer::new(&bytes[..length]);
            serializer.validate(&bytes[..length]).unwrap_err();
            // Reads either fail cleanly or land on bytes that survived the cut.
            if let Ok(table) = serializer.parse(truncated) {
                let _ = table.to_value();
            }
        }
    }
}
