#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use bytes::Bytes;
    use flatwire::schema::{
        ElementType, FieldDef, FieldType, Schema, SchemaBuilder, StructDef, StructFieldDef,
        TableDef, UnionDef, UnionMemberType, VectorKind, VectorType,
    };
    use flatwire::shared_string::{SharedStringReaderFactory, concurrent_reader, reader_cache};
    use flatwire::value::{SortKey, StructValue, TableValue, UnionValue, Value};
    use flatwire::{
        DeserializationMode, FieldValue, Serializer, SerializerOptions, Table, ValidatorOptions,
    };
    use flatwire_buffer::{ArrayInputBuffer, ReadOnlyMemoryInputBuffer, ScalarType};
    use rstest::rstest;

    fn monster_schema(tags: ElementType) -> Arc<Schema> {
        Arc::new(
            SchemaBuilder::new()
                .structure(
                    StructDef::new("Vec3")
                        .field(StructFieldDef::scalar("x", ScalarType::F32))
                        .field(StructFieldDef::scalar("y", ScalarType::F32))
                        .field(StructFieldDef::scalar("z", ScalarType::F32)),
                )
                .table(
                    TableDef::new("Weapon")
                        .field(FieldDef::new("name", 0, FieldType::String).key())
                        .field(FieldDef::new("damage", 1, FieldType::Scalar(ScalarType::I16))),
                )
                .union(
                    UnionDef::new("Equipment")
                        .member(1, UnionMemberType::Table("Weapon".into()))
                        .member(2, UnionMemberType::String)
                        .member(3, UnionMemberType::Struct("Vec3".into())),
                )
                .table(
                    TableDef::new("Monster")
                        .field(FieldDef::new("pos", 0, FieldType::Struct("Vec3".into())))
                        .field(
                            FieldDef::new("mana", 1, FieldType::Scalar(ScalarType::I16))
                                .with_default(150i16),
                        )
                        .field(
                            FieldDef::new("hp", 2, FieldType::Scalar(ScalarType::U16))
                                .with_default(100u16),
                        )
                        .field(FieldDef::new("name", 3, FieldType::String).required())
                        .field(
                            FieldDef::new("friendly", 4, FieldType::Scalar(ScalarType::Bool))
                                .deprecated(),
                        )
                        .field(FieldDef::new(
                            "inventory",
                            5,
                            FieldType::Vector(VectorType::new(
                                ElementType::Scalar(ScalarType::U8),
                                VectorKind::Memory,
                            )),
                        ))
                        .field(
                            FieldDef::new("color", 6, FieldType::Scalar(ScalarType::U8))
                                .with_default(2u8),
                        )
                        .field(FieldDef::new(
                            "weapons",
                            7,
                            FieldType::Vector(VectorType::new(
                                ElementType::Table("Weapon".into()),
                                VectorKind::Indexed,
                            )),
                        ))
                        .field(FieldDef::new(
                            "equipped",
                            8,
                            FieldType::Union("Equipment".into()),
                        ))
                        .field(FieldDef::new(
                            "path",
                            10,
                            FieldType::Vector(VectorType::list(ElementType::Struct("Vec3".into()))),
                        ))
                        .field(FieldDef::new(
                            "tags",
                            11,
                            FieldType::Vector(VectorType::list(tags)),
                        ))
                        .field(FieldDef::new("enemy", 12, FieldType::Table("Monster".into())))
                        .field(FieldDef::new(
                            "scores",
                            13,
                            FieldType::Vector(VectorType::new(
                                ElementType::Scalar(ScalarType::F64),
                                VectorKind::Native,
                            )),
                        ))
                        .field(FieldDef::new(
                            "flags",
                            14,
                            FieldType::Vector(VectorType::new(
                                ElementType::Scalar(ScalarType::Bool),
                                VectorKind::Array,
                            )),
                        ))
                        .field(FieldDef::new("ratio", 15, FieldType::Scalar(ScalarType::F32)))
                        .field(FieldDef::new("big", 16, FieldType::Scalar(ScalarType::U64)))
                        .field(FieldDef::new("mood", 17, FieldType::Scalar(ScalarType::I8)))
                        .field(FieldDef::new(
                            "legacy_ids",
                            18,
                            FieldType::Vector(VectorType::new(
                                ElementType::Scalar(ScalarType::U32),
                                VectorKind::ReadOnlyList,
                            )),
                        )),
                )
                .build()
                .unwrap(),
        )
    }

    fn vec3(x: f32, y: f32, z: f32) -> Value {
        Value::Struct(StructValue::new(vec![x.into(), y.into(), z.into()]))
    }

    fn list<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Value {
        Value::Vector(items.into_iter().map(Into::into).collect())
    }

    fn weapon(name: &str, damage: i16) -> Value {
        Value::Table(TableValue::new().with(0, name).with(1, damage))
    }

    fn orc() -> Value {
        Value::Table(
            TableValue::new()
                .with(0, vec3(1.0, 2.0, 3.0))
                .with(1, 200i16)
                .with(2, 300u16)
                .with(3, "Orc")
                .with(5, Bytes::from_static(&[0, 1, 2, 3, 4]))
                .with(6, 1u8)
                .with(7, vec![weapon("axe", 5), weapon("sword", 3)])
                .with(8, UnionValue::new(1, weapon("club", 2)))
                .with(10, vec![vec3(0.0, 0.5, 1.0), vec3(-1.0, -2.0, -3.0)])
                .with(11, list(["red", "green", "red"]))
                .with(
                    12,
                    TableValue::new()
                        .with(3, "Goblin")
                        .with(2, 50u16)
                        .with(8, UnionValue::new(2, "dagger")),
                )
                .with(13, list([0.5f64, 1.5, -8.25]))
                .with(14, list([true, false, true]))
                .with(15, 0.25f32)
                .with(16, u64::MAX)
                .with(17, -3i8)
                .with(18, list([7u32, 9])),
        )
    }

    fn serializer(mode: DeserializationMode) -> Serializer {
        let options = SerializerOptions::new().with_deserialization_mode(mode);
        Serializer::new(monster_schema(ElementType::SharedString), "Monster", options).unwrap()
    }

    fn parse(mode: DeserializationMode, bytes: &Bytes) -> Table<ArrayInputBuffer> {
        serializer(mode)
            .parse(ArrayInputBuffer::new(bytes.to_vec()))
            .unwrap()
    }

    #[rstest]
    fn values_survive_a_round_trip(
        #[values(
            DeserializationMode::Lazy,
            DeserializationMode::Progressive,
            DeserializationMode::Greedy,
            DeserializationMode::GreedyMutable
        )]
        mode: DeserializationMode,
    ) {
        let serializer = serializer(mode);
        let bytes = serializer.serialize(&orc()).unwrap();
        serializer.validate(&bytes).unwrap();

        let monster = parse(mode, &bytes);
        assert_eq!(monster.to_value().unwrap(), orc());
        assert_eq!(monster.scalar::<u16>(2).unwrap(), 300);
        assert_eq!(monster.string(3).unwrap().as_deref(), Some("Orc"));
        assert_eq!(monster.scalar::<u64>(16).unwrap(), u64::MAX);

        let enemy = monster.table(12).unwrap().unwrap();
        assert_eq!(enemy.scalar::<i16>(1).unwrap(), 150);
        assert_eq!(enemy.scalar::<u8>(6).unwrap(), 2);
        assert!(enemy.get(0).unwrap().is_none());
        let dagger = enemy.union(8).unwrap().unwrap();
        assert_eq!(dagger.tag(), 2);
        assert_eq!(dagger.value().as_str().unwrap().as_ref(), "dagger");

        let pos = monster.struct_ref(0).unwrap().unwrap();
        assert_eq!(pos.scalar::<f32>(2).unwrap(), 3.0);
        let scores = monster.vector(13).unwrap().unwrap();
        assert_eq!(scores.to_native_vec::<f64>().unwrap(), vec![0.5, 1.5, -8.25]);
        let weapons = monster.vector(7).unwrap().unwrap();
        let sword = weapons.find(&SortKey::from("sword")).unwrap().unwrap();
        assert_eq!(sword.scalar::<i16>(1).unwrap(), 3);
        assert!(weapons.find(&SortKey::from("bow")).unwrap().is_none());
        assert_eq!(
            monster.vector(5).unwrap().unwrap().bytes().unwrap().as_ref(),
            &[0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn table_with_scalar_and_string_has_a_fixed_layout() {
        let schema = SchemaBuilder::new()
            .table(
                TableDef::new("Raw")
                    .field(FieldDef::new("value", 0, FieldType::Scalar(ScalarType::U64)))
                    .field(FieldDef::new("text", 1, FieldType::String)),
            )
            .build()
            .unwrap();
        let serializer =
            Serializer::new(Arc::new(schema), "Raw", SerializerOptions::default()).unwrap();
        let value = Value::Table(
            TableValue::new()
                .with(0, 0xABAD_CAFE_ABAD_CAFEu64)
                .with(1, "hi"),
        );
        let bytes = serializer.serialize(&value).unwrap();
        #[rustfmt::skip]
        let expected: &[u8] = &[
            4, 0, 0, 0,                                     // root uoffset
            240, 255, 255, 255,                             // soffset to the vtable at 20
            0xFE, 0xCA, 0xAD, 0xAB, 0xFE, 0xCA, 0xAD, 0xAB, // value
            12, 0, 0, 0,                                    // uoffset to the string at 28
            8, 0, 16, 0, 4, 0, 12, 0,                       // vtable
            2, 0, 0, 0, b'h', b'i', 0,                      // string
        ];
        assert_eq!(bytes.as_ref(), expected);

        let raw = serializer.parse(ArrayInputBuffer::new(bytes.to_vec())).unwrap();
        assert_eq!(raw.scalar::<u64>(0).unwrap(), 0xABAD_CAFE_ABAD_CAFE);
        assert_eq!(raw.string(1).unwrap().as_deref(), Some("hi"));
    }

    fn vtables_of_points(bytes: &[u8]) -> HashSet<usize> {
        let read_u32 = |offset: usize| {
            u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize
        };
        let root = read_u32(0);
        let vector = root + 4 + read_u32(root + 4);
        (0..read_u32(vector))
            .map(|i| {
                let slot = vector + 4 + 4 * i;
                let table = slot + read_u32(slot);
                let soffset = i32::from_le_bytes(bytes[table..table + 4].try_into().unwrap());
                usize::try_from(i64::try_from(table).unwrap() - i64::from(soffset)).unwrap()
            })
            .collect()
    }

    #[rstest]
    #[case::shared(true, 1)]
    #[case::unshared(false, 5)]
    fn identical_tables_share_one_vtable(#[case] share: bool, #[case] expected: usize) {
        let schema = SchemaBuilder::new()
            .table(
                TableDef::new("Point")
                    .field(FieldDef::new("x", 0, FieldType::Scalar(ScalarType::I32)))
                    .field(FieldDef::new("y", 1, FieldType::Scalar(ScalarType::I32))),
            )
            .table(TableDef::new("Path").field(FieldDef::new(
                "points",
                0,
                FieldType::Vector(VectorType::list(ElementType::Table("Point".into()))),
            )))
            .build()
            .unwrap();
        let options = SerializerOptions::new().with_share_vtables(share);
        let serializer = Serializer::new(Arc::new(schema), "Path", options).unwrap();
        let points = (0..5)
            .map(|i| Value::Table(TableValue::new().with(0, i + 1).with(1, -i - 1)))
            .collect::<Vec<_>>();
        let bytes = serializer
            .serialize(&Value::Table(TableValue::new().with(0, points)))
            .unwrap();
        assert_eq!(vtables_of_points(&bytes).len(), expected);
        serializer.validate(&bytes).unwrap();
    }

    #[test]
    fn progressive_hands_out_the_same_objects() {
        let bytes = serializer(DeserializationMode::Progressive)
            .serialize(&orc())
            .unwrap();
        let monster = parse(DeserializationMode::Progressive, &bytes);
        let first = monster.get(12).unwrap().unwrap();
        assert!(first.ptr_eq(&monster.get(12).unwrap().unwrap()));
        let tags = monster.vector(11).unwrap().unwrap();
        assert!(tags.ptr_eq(&monster.vector(11).unwrap().unwrap()));
        assert!(tags.get(0).unwrap().ptr_eq(&tags.get(0).unwrap()));
        assert!(monster.buffer().is_some());

        let monster = parse(DeserializationMode::Lazy, &bytes);
        let first = monster.get(12).unwrap().unwrap();
        assert!(!first.ptr_eq(&monster.get(12).unwrap().unwrap()));
        assert!(monster.buffer().is_some());
    }

    #[rstest]
    fn greedy_objects_hold_no_buffer(
        #[values(DeserializationMode::Greedy, DeserializationMode::GreedyMutable)]
        mode: DeserializationMode,
    ) {
        let bytes = serializer(mode).serialize(&orc()).unwrap();
        let monster = parse(mode, &bytes);
        assert!(monster.buffer().is_none());
        assert!(monster.table(12).unwrap().unwrap().buffer().is_none());
        assert!(monster.vector(10).unwrap().unwrap().buffer().is_none());
        assert!(monster.struct_ref(0).unwrap().unwrap().buffer().is_none());
        let first = monster.get(12).unwrap().unwrap();
        assert!(first.ptr_eq(&monster.get(12).unwrap().unwrap()));
    }

    #[rstest]
    fn only_greedy_mutable_objects_change(
        #[values(
            DeserializationMode::Lazy,
            DeserializationMode::Progressive,
            DeserializationMode::Greedy
        )]
        mode: DeserializationMode,
    ) {
        let bytes = serializer(mode).serialize(&orc()).unwrap();
        let monster = parse(mode, &bytes);
        assert!(monster.set(2, 1u16).unwrap_err().is_not_mutable());
        let path = monster.vector(10).unwrap().unwrap();
        assert!(path.remove(0).unwrap_err().is_not_mutable());
        let tags = monster.vector(11).unwrap().unwrap();
        assert!(tags.set(0, "blue").unwrap_err().is_not_mutable());
        assert!(tags.push("blue").unwrap_err().is_not_mutable());
        assert!(tags.remove(0).unwrap_err().is_not_mutable());
        let pos = monster.struct_ref(0).unwrap().unwrap();
        assert!(pos.set(0, 4.0f32).unwrap_err().is_not_mutable());
        assert_eq!(monster.to_value().unwrap(), orc());
    }

    #[test]
    fn greedy_mutable_changes_stay_off_the_buffer() {
        let mode = DeserializationMode::GreedyMutable;
        let bytes = serializer(mode).serialize(&orc()).unwrap();
        let monster = parse(mode, &bytes);
        monster.set(2, 1u16).unwrap();
        monster.set_value(3, &"Troll".into()).unwrap();
        monster.clear(12).unwrap();
        assert!(monster.clear(3).is_err());
        let tags = monster.vector(11).unwrap().unwrap();
        tags.set(0, "blue").unwrap();
        tags.push("black").unwrap();
        assert_eq!(tags.remove(1).unwrap().as_str().unwrap().as_ref(), "green");
        monster.struct_ref(0).unwrap().unwrap().set(0, 4.0f32).unwrap();
        let legacy = monster.vector(18).unwrap().unwrap();
        assert!(legacy.set(0, 1u32).unwrap_err().is_not_mutable());

        assert_eq!(monster.scalar::<u16>(2).unwrap(), 1);
        assert_eq!(monster.string(3).unwrap().as_deref(), Some("Troll"));
        assert!(monster.table(12).unwrap().is_none());
        assert_eq!(
            tags.to_value().unwrap(),
            list(["blue", "red", "black"])
        );
        assert_eq!(
            monster.struct_ref(0).unwrap().unwrap().scalar::<f32>(0).unwrap(),
            4.0
        );

        let original = parse(DeserializationMode::Lazy, &bytes);
        assert_eq!(original.to_value().unwrap(), orc());
    }

    #[test]
    fn detached_tables_leave_the_buffer_behind() {
        let bytes = serializer(DeserializationMode::Lazy)
            .serialize(&orc())
            .unwrap();
        let monster = parse(DeserializationMode::Lazy, &bytes);
        let copy = monster.detach(true).unwrap();
        assert!(copy.buffer().is_none());
        copy.set(2, 7u16).unwrap();
        assert_eq!(copy.scalar::<u16>(2).unwrap(), 7);
        assert_eq!(monster.scalar::<u16>(2).unwrap(), 300);

        let frozen = monster.detach(false).unwrap();
        assert!(frozen.set(2, 7u16).unwrap_err().is_not_mutable());
        assert_eq!(frozen.to_value().unwrap(), orc());
    }

    #[test]
    fn deprecated_fields_are_never_written() {
        let serializer = serializer(DeserializationMode::Lazy);
        let Value::Table(mut value) = orc() else {
            unreachable!()
        };
        value.set(4, true);
        let bytes = serializer.serialize(&Value::Table(value)).unwrap();
        let monster = parse(DeserializationMode::Lazy, &bytes);
        assert!(monster.get(4).unwrap().is_none());
        assert!(!monster.is_present(4).unwrap());
        assert_eq!(monster.to_value().unwrap(), orc());
    }

    #[test]
    fn missing_required_fields_fail_to_serialize() {
        let serializer = serializer(DeserializationMode::Lazy);
        let Value::Table(mut value) = orc() else {
            unreachable!()
        };
        value.remove(3);
        serializer.serialize(&Value::Table(value)).unwrap_err();
    }

    #[test]
    fn shared_strings_parse_like_plain_strings() {
        let value = orc();
        let shared = serializer(DeserializationMode::Lazy);
        let unshared = Serializer::new(
            monster_schema(ElementType::SharedString),
            "Monster",
            SerializerOptions::new()
                .with_deserialization_mode(DeserializationMode::Lazy)
                .without_shared_strings(),
        )
        .unwrap();
        let plain = Serializer::new(
            monster_schema(ElementType::String),
            "Monster",
            SerializerOptions::new().with_deserialization_mode(DeserializationMode::Lazy),
        )
        .unwrap();

        let shared_bytes = shared.serialize(&value).unwrap();
        let unshared_bytes = unshared.serialize(&value).unwrap();
        assert!(shared_bytes.len() < unshared_bytes.len());
        assert_eq!(unshared_bytes, plain.serialize(&value).unwrap());

        for bytes in [&shared_bytes, &unshared_bytes] {
            let monster = shared.parse(ArrayInputBuffer::new(bytes.to_vec())).unwrap();
            assert_eq!(monster.to_value().unwrap(), value);
        }
    }

    #[test]
    fn reader_cache_returns_one_string_per_offset() {
        let options = SerializerOptions::new()
            .with_deserialization_mode(DeserializationMode::Lazy)
            .with_shared_string_reader(reader_cache(64));
        let serializer =
            Serializer::new(monster_schema(ElementType::SharedString), "Monster", options).unwrap();
        let bytes = serializer.serialize(&orc()).unwrap();
        let monster = serializer.parse(ReadOnlyMemoryInputBuffer::new(&bytes)).unwrap();
        let tags = monster.vector(11).unwrap().unwrap();
        let first = tags.get(0).unwrap();
        let third = tags.get(2).unwrap();
        let (FieldValue::String(first), FieldValue::String(third)) = (first, third) else {
            unreachable!()
        };
        assert!(Arc::ptr_eq(&first, &third));

        let plain = parse(DeserializationMode::Lazy, &bytes);
        let tags = plain.vector(11).unwrap().unwrap();
        assert!(!tags.get(0).unwrap().ptr_eq(&tags.get(2).unwrap()));
    }

    fn tagged(name: &str, tag: &str) -> Value {
        Value::Table(TableValue::new().with(3, name).with(11, list([tag, tag])))
    }

    fn tags(monster: &Table<ArrayInputBuffer>) -> Vec<Value> {
        monster
            .vector(11)
            .unwrap()
            .unwrap()
            .iter()
            .map(|tag| tag.unwrap().to_value().unwrap())
            .collect()
    }

    #[rstest]
    #[case::per_parse(reader_cache(64))]
    #[case::shared(concurrent_reader(64))]
    fn one_serializer_reads_many_buffers(
        #[case] strings: SharedStringReaderFactory,
        #[values(DeserializationMode::Lazy, DeserializationMode::Progressive)]
        mode: DeserializationMode,
    ) {
        let options = SerializerOptions::new()
            .with_deserialization_mode(mode)
            .with_shared_string_reader(strings);
        let serializer =
            Serializer::new(monster_schema(ElementType::SharedString), "Monster", options).unwrap();
        let alpha = serializer.serialize(&tagged("Orc", "alpha")).unwrap();
        let bravo = serializer.serialize(&tagged("Imp", "bravo")).unwrap();
        // Same shape and string lengths, so every string sits at the same offset.
        assert_eq!(alpha.len(), bravo.len());

        let first = serializer.parse(ArrayInputBuffer::new(alpha.to_vec())).unwrap();
        let second = serializer.parse(ArrayInputBuffer::new(bravo.to_vec())).unwrap();
        for (monster, tag) in [(&first, "alpha"), (&second, "bravo"), (&first, "alpha")] {
            assert_eq!(tags(monster), vec![Value::from(tag), Value::from(tag)]);
        }
        assert_eq!(first.to_value().unwrap(), tagged("Orc", "alpha"));
        assert_eq!(second.to_value().unwrap(), tagged("Imp", "bravo"));
    }

    #[test]
    fn validate_on_parse_applies_the_limits() {
        let options = SerializerOptions::new()
            .with_validate_on_parse(true)
            .with_validator_options(ValidatorOptions {
                max_depth: 2,
                ..ValidatorOptions::default()
            });
        let serializer =
            Serializer::new(monster_schema(ElementType::SharedString), "Monster", options).unwrap();
        let bytes = serializer.serialize(&orc()).unwrap();
        // weapon tables sit below the weapons vector, three levels down
        assert!(
            serializer
                .parse(ArrayInputBuffer::new(bytes.to_vec()))
                .unwrap_err()
                .is_format_error()
        );
    }
}
