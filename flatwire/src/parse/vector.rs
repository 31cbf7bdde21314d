use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use bytes::Bytes;
use flatwire_buffer::{InputBuffer, MemorySlice, NativeScalar, Scalar, ScalarType};
use flatwire_error::{FlatError, FlatResult, flat_bail, flat_err};

use super::{
    FieldValue, ParseContext, Table, element_from_value, read_element, write_scalar_value,
};
use crate::codec::{VectorHeader, read_native_slice, vector_header};
use crate::options::DeserializationMode;
use crate::schema::{ElementKind, FieldKind, FieldLayout, VectorKind, VectorLayout};
use crate::serialize::encode_struct;
use crate::value::{ScalarValue, SortKey, Value};

/// A parsed vector.
///
/// What a vector allows depends on its [`VectorKind`] and the mode it was parsed in: only
/// greedy-mutable vectors change shape, and only `List` vectors grow or shrink.
pub struct Vector<B>(Rc<VectorInner<B>>);

struct VectorInner<B> {
    ctx: Rc<ParseContext>,
    layout: VectorLayout,
    sorted: bool,
    write_through: bool,
    state: VectorState<B>,
}

enum VectorState<B> {
    Lazy(BufferedVector<B>),
    Progressive(BufferedVector<B>, RefCell<Vec<Option<FieldValue<B>>>>),
    Greedy(RefCell<Elements<B>>),
}

struct BufferedVector<B> {
    buffer: B,
    header: VectorHeader,
}

/// The elements of a greedy vector.
enum Elements<B> {
    List(Vec<FieldValue<B>>),
    Bytes(Vec<u8>),
    Indexed(BTreeMap<SortKey, Table<B>>),
}

impl<B> Elements<B> {
    fn len(&self) -> usize {
        match self {
            Self::List(items) => items.len(),
            Self::Bytes(bytes) => bytes.len(),
            Self::Indexed(items) => items.len(),
        }
    }
}

impl<B> Clone for Vector<B> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<B> Vector<B> {
    /// The resolved element layout.
    pub fn layout(&self) -> &VectorLayout {
        &self.0.layout
    }

    /// The declared kind, which decides the operations the vector accepts.
    pub fn kind(&self) -> VectorKind {
        self.0.layout.kind()
    }

    pub fn mode(&self) -> DeserializationMode {
        self.0.ctx.mode()
    }

    /// The number of elements.
    pub fn len(&self) -> usize {
        match &self.0.state {
            VectorState::Lazy(vector) | VectorState::Progressive(vector, _) => vector.header.count,
            VectorState::Greedy(elements) => elements.borrow().len(),
        }
    }

    /// Returns true if the vector has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The buffer the vector reads from. Greedy vectors hold no buffer.
    pub fn buffer(&self) -> Option<&B> {
        match &self.0.state {
            VectorState::Lazy(vector) | VectorState::Progressive(vector, _) => Some(&vector.buffer),
            VectorState::Greedy(_) => None,
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn check_bounds(&self, index: usize) -> FlatResult<()> {
        let len = self.len();
        if index >= len {
            flat_bail!(OutOfBounds: index, 0, len);
        }
        Ok(())
    }

    /// Fails unless the vector is greedy-mutable and its kind allows changing its length.
    fn check_resizable(&self) -> FlatResult<()> {
        if !self.mode().is_mutable() {
            flat_bail!(NotMutable: "vector parsed in {} mode", self.mode());
        }
        if self.kind() != VectorKind::List {
            flat_bail!(NotMutable: "only list vectors change length");
        }
        Ok(())
    }
}

impl<B: InputBuffer + Clone> Vector<B> {
    pub(crate) fn buffered(
        ctx: Rc<ParseContext>,
        layout: &VectorLayout,
        sorted: bool,
        write_through: bool,
        buffer: B,
        offset: usize,
    ) -> FlatResult<Self> {
        let header = vector_header(&buffer, offset, layout.stride())?;
        if !layout.alignment().is_offset_aligned(header.data_offset) {
            flat_bail!(
                InvalidFormat: "vector elements at offset {} are not aligned to {}",
                header.data_offset,
                layout.alignment()
            );
        }
        let vector = BufferedVector { buffer, header };
        let state = match ctx.mode() {
            DeserializationMode::Progressive => {
                let cache = (0..header.count).map(|_| None).collect();
                VectorState::Progressive(vector, RefCell::new(cache))
            }
            _ => VectorState::Lazy(vector),
        };
        Ok(Self(Rc::new(VectorInner {
            ctx,
            layout: layout.clone(),
            sorted,
            write_through,
            state,
        })))
    }

    pub(crate) fn from_value(
        ctx: &Rc<ParseContext>,
        layout: &VectorLayout,
        sorted: bool,
        value: &Value,
    ) -> FlatResult<Self> {
        let element = *layout.element();
        let elements = match (layout.kind(), value) {
            (_, Value::Bytes(_)) if element != ElementKind::Scalar(ScalarType::U8) => {
                flat_bail!(MismatchedTypes: "vector of non-byte elements", "bytes")
            }
            (VectorKind::Memory, Value::Bytes(bytes)) => Elements::Bytes(bytes.to_vec()),
            (VectorKind::Memory, Value::Vector(items)) => Elements::Bytes(
                items
                    .iter()
                    .map(|item| item.as_scalar()?.as_primitive::<u8>())
                    .collect::<FlatResult<_>>()?,
            ),
            (_, Value::Bytes(bytes)) => Elements::List(
                bytes
                    .iter()
                    .map(|byte| FieldValue::Scalar(ScalarValue::U8(*byte)))
                    .collect(),
            ),
            (VectorKind::Indexed, Value::Vector(items)) => {
                let ElementKind::Table(id) = element else {
                    flat_bail!(InvalidSchema: "indexed vectors hold tables");
                };
                let mut tables = BTreeMap::new();
                for item in items {
                    let table = Table::from_value(ctx.clone(), id, item.as_table()?)?;
                    let key = table.key()?;
                    if tables.contains_key(&key) {
                        flat_bail!("duplicate key {} in indexed vector", key);
                    }
                    tables.insert(key, table);
                }
                Elements::Indexed(tables)
            }
            (_, Value::Vector(items)) => Elements::List(
                items
                    .iter()
                    .map(|item| element_from_value(ctx, element, item))
                    .collect::<FlatResult<_>>()?,
            ),
            (_, other) => flat_bail!(MismatchedTypes: "vector", other.kind_name()),
        };
        Ok(Self(Rc::new(VectorInner {
            ctx: ctx.clone(),
            layout: layout.clone(),
            sorted,
            write_through: false,
            state: VectorState::Greedy(RefCell::new(elements)),
        })))
    }

    /// The element at `index`. Indexed greedy vectors are addressed in key order.
    pub fn get(&self, index: usize) -> FlatResult<FieldValue<B>> {
        self.check_bounds(index)?;
        let inner = &*self.0;
        match &inner.state {
            VectorState::Lazy(vector) => vector.read(inner, index),
            VectorState::Progressive(vector, cache) => {
                if let Some(cached) = &cache.borrow()[index] {
                    return Ok(cached.clone());
                }
                let value = vector.read(inner, index)?;
                cache.borrow_mut()[index] = Some(value.clone());
                Ok(value)
            }
            VectorState::Greedy(elements) => match &*elements.borrow() {
                Elements::List(items) => Ok(items[index].clone()),
                Elements::Bytes(bytes) => Ok(FieldValue::Scalar(ScalarValue::U8(bytes[index]))),
                Elements::Indexed(tables) => tables
                    .values()
                    .nth(index)
                    .map(|table| FieldValue::Table(table.clone()))
                    .ok_or_else(|| flat_err!(OutOfBounds: index, 0, tables.len())),
            },
        }
    }

    /// The elements in order, each read as [`Vector::get`] would.
    pub fn iter(&self) -> impl Iterator<Item = FlatResult<FieldValue<B>>> + '_ {
        (0..self.len()).map(move |index| self.get(index))
    }

    /// Replace the element at `index`.
    ///
    /// Greedy-mutable `Array`, `List`, `Memory` and `Native` vectors store a copy of `value`.
    /// Buffer-backed vectors of scalars or structs write through when their field declares it.
    pub fn set(&self, index: usize, value: impl Into<FieldValue<B>>) -> FlatResult<()> {
        let value = value.into();
        self.check_bounds(index)?;
        let inner = &*self.0;
        let element = *inner.layout.element();
        match &inner.state {
            VectorState::Greedy(elements) => {
                if !self.mode().is_mutable() {
                    flat_bail!(NotMutable: "vector parsed in {} mode", self.mode());
                }
                match self.kind() {
                    VectorKind::ReadOnlyList => flat_bail!(NotMutable: "read-only list"),
                    VectorKind::Indexed => {
                        flat_bail!(InvalidOperation: "indexed vectors are changed with insert")
                    }
                    _ => {}
                }
                match &mut *elements.borrow_mut() {
                    Elements::Bytes(bytes) => bytes[index] = value.as_scalar()?.as_primitive()?,
                    Elements::List(items) => {
                        items[index] = element_from_value(&inner.ctx, element, &value.to_value()?)?
                    }
                    Elements::Indexed(_) => {
                        flat_bail!(InvalidOperation: "indexed vectors are changed with insert")
                    }
                }
                Ok(())
            }
            VectorState::Lazy(vector) => vector.write_through(inner, index, &value),
            VectorState::Progressive(vector, cache) => {
                vector.write_through(inner, index, &value)?;
                if matches!(element, ElementKind::Scalar(_)) {
                    cache.borrow_mut()[index] = None;
                }
                Ok(())
            }
        }
    }

    /// Append an element to a greedy-mutable list.
    pub fn push(&self, value: impl Into<FieldValue<B>>) -> FlatResult<()> {
        self.check_resizable()?;
        let value = value.into().to_value()?;
        let inner = &*self.0;
        if let VectorState::Greedy(elements) = &inner.state {
            if let Elements::List(items) = &mut *elements.borrow_mut() {
                items.push(element_from_value(&inner.ctx, *inner.layout.element(), &value)?);
                return Ok(());
            }
        }
        flat_bail!(NotMutable: "vector cannot grow")
    }

    /// Remove and return the element at `index` of a greedy-mutable list.
    pub fn remove(&self, index: usize) -> FlatResult<FieldValue<B>> {
        self.check_resizable()?;
        self.check_bounds(index)?;
        if let VectorState::Greedy(elements) = &self.0.state {
            if let Elements::List(items) = &mut *elements.borrow_mut() {
                return Ok(items.remove(index));
            }
        }
        flat_bail!(NotMutable: "vector cannot shrink")
    }

    /// Insert a copy of `table` into a greedy-mutable indexed vector, returning the element it
    /// replaced.
    pub fn insert(&self, table: &Table<B>) -> FlatResult<Option<Table<B>>> {
        if !self.mode().is_mutable() {
            flat_bail!(NotMutable: "vector parsed in {} mode", self.mode());
        }
        let inner = &*self.0;
        let VectorState::Greedy(elements) = &inner.state else {
            flat_bail!(NotMutable: "buffer-backed vectors cannot grow");
        };
        let mut elements = elements.borrow_mut();
        let Elements::Indexed(tables) = &mut *elements else {
            flat_bail!(InvalidOperation: "insert requires an indexed vector, use push");
        };
        let ElementKind::Table(id) = *inner.layout.element() else {
            flat_bail!(InvalidSchema: "indexed vectors hold tables");
        };
        let table = Table::from_value(inner.ctx.clone(), id, table.to_value()?.as_table()?)?;
        Ok(tables.insert(table.key()?, table))
    }

    /// The element table whose key equals `key`.
    ///
    /// Numeric keys are first converted to the type of the key field, so `SortKey::Signed(5)`
    /// finds an element whose `u16` key is 5. Sorted buffer-backed vectors are binary searched,
    /// greedy indexed vectors are looked up directly, every other vector is scanned.
    pub fn find(&self, key: &SortKey) -> FlatResult<Option<Table<B>>> {
        let ElementKind::Table(id) = *self.0.layout.element() else {
            flat_bail!(InvalidOperation: "only vectors of tables can be searched by key");
        };
        let coerced;
        let key = match self.0.ctx.schema().table(id).key().map(FieldLayout::kind) {
            Some(FieldKind::Scalar(scalar_type)) => match key.coerce(*scalar_type) {
                Some(found) => {
                    coerced = found;
                    &coerced
                }
                None => return Ok(None),
            },
            _ => key,
        };
        if let VectorState::Greedy(elements) = &self.0.state {
            if let Elements::Indexed(tables) = &*elements.borrow() {
                return Ok(tables.get(key).cloned());
            }
        }
        if self.0.sorted && self.buffer().is_some() {
            return self.binary_search(key);
        }
        for item in self.iter() {
            let table = item?.as_table()?.clone();
            if table.key()? == *key {
                return Ok(Some(table));
            }
        }
        Ok(None)
    }

    fn binary_search(&self, key: &SortKey) -> FlatResult<Option<Table<B>>> {
        let mut low = 0;
        let mut high = self.len();
        while low < high {
            let middle = low + (high - low) / 2;
            let table = self.get(middle)?.as_table()?.clone();
            match table.key()?.cmp(key) {
                Ordering::Less => low = middle + 1,
                Ordering::Greater => high = middle,
                Ordering::Equal => return Ok(Some(table)),
            }
        }
        Ok(None)
    }

    /// The keys of the element tables, in element order.
    pub fn keys(&self) -> FlatResult<Vec<SortKey>> {
        if let VectorState::Greedy(elements) = &self.0.state {
            if let Elements::Indexed(tables) = &*elements.borrow() {
                return Ok(tables.keys().cloned().collect());
            }
        }
        self.iter()
            .map(|item| item?.as_table()?.key())
            .collect()
    }

    /// The contents of a byte vector. Zero-copy for buffers that support it.
    pub fn bytes(&self) -> FlatResult<Bytes> {
        if *self.0.layout.element() != ElementKind::Scalar(ScalarType::U8) {
            flat_bail!(MismatchedTypes: "vector of u8", "vector of other elements");
        }
        match &self.0.state {
            VectorState::Lazy(vector) | VectorState::Progressive(vector, _) => vector
                .buffer
                .get_read_only_memory(vector.header.data_offset, vector.header.count),
            VectorState::Greedy(elements) => match &*elements.borrow() {
                Elements::Bytes(bytes) => Ok(Bytes::copy_from_slice(bytes)),
                Elements::List(items) => items
                    .iter()
                    .map(|item| item.as_scalar()?.as_primitive::<u8>())
                    .collect::<FlatResult<Vec<_>>>()
                    .map(Bytes::from),
                Elements::Indexed(_) => flat_bail!(MismatchedTypes: "vector of u8", "indexed vector"),
            },
        }
    }

    /// A writable view over the bytes of a write-through byte vector.
    pub fn memory(&self) -> FlatResult<MemorySlice<B>> {
        if *self.0.layout.element() != ElementKind::Scalar(ScalarType::U8) {
            flat_bail!(MismatchedTypes: "vector of u8", "vector of other elements");
        }
        match &self.0.state {
            VectorState::Lazy(vector) | VectorState::Progressive(vector, _)
                if self.0.write_through =>
            {
                vector
                    .buffer
                    .get_memory(vector.header.data_offset, vector.header.count)
            }
            _ => flat_bail!(NotMutable: "byte vector parsed in {} mode without write-through", self.mode()),
        }
    }

    /// The elements of a scalar vector, borrowed straight from a pinned contiguous buffer.
    ///
    /// Only vectors of numeric scalars whose element type is exactly `T` qualify, and only when
    /// the buffer was pinned read-only ([`flatwire_buffer::PinnedInputBuffer::pin_read_only`]) and
    /// the elements are aligned for `T` in memory. Writable pinned buffers, greedy vectors and
    /// vectors of structs fail with `InvalidOperation`; [`Vector::to_native_vec`] copies instead.
    pub fn native_slice<T: NativeScalar>(&self) -> FlatResult<&[T]> {
        if *self.0.layout.element() != ElementKind::Scalar(T::SCALAR_TYPE) {
            flat_bail!(MismatchedTypes: T::SCALAR_TYPE, "vector of other elements");
        }
        let (VectorState::Lazy(vector) | VectorState::Progressive(vector, _)) = &self.0.state else {
            flat_bail!(InvalidOperation: "greedy vectors hold no buffer, use to_native_vec");
        };
        if !vector.buffer.is_pinned() {
            flat_bail!(InvalidOperation: "native slices require a pinned buffer");
        }
        let bytes = vector.buffer.contiguous().ok_or_else(|| {
            flat_err!(InvalidOperation: "native slices require a contiguous read-only buffer")
        })?;
        read_native_slice(bytes, vector.header.data_offset, vector.header.count)
    }

    /// Copy the elements of a scalar vector out as `T`.
    pub fn to_native_vec<T: Scalar + TryFrom<ScalarValue, Error = FlatError>>(
        &self,
    ) -> FlatResult<Vec<T>> {
        self.iter()
            .map(|item| item?.as_scalar()?.cast(T::SCALAR_TYPE)?.as_primitive())
            .collect()
    }

    /// A buffer-free copy of the vector. Memory vectors copy out as bytes.
    pub fn to_value(&self) -> FlatResult<Value> {
        if self.kind() == VectorKind::Memory {
            return Ok(Value::Bytes(self.bytes()?));
        }
        self.iter()
            .map(|item| item?.to_value())
            .collect::<FlatResult<Vec<_>>>()
            .map(Value::Vector)
    }
}

impl<B: InputBuffer + Clone> BufferedVector<B> {
    fn position(&self, layout: &VectorLayout, index: usize) -> usize {
        self.header.data_offset + index * layout.stride()
    }

    fn read(&self, inner: &VectorInner<B>, index: usize) -> FlatResult<FieldValue<B>> {
        read_element(
            &inner.ctx,
            &self.buffer,
            self.position(&inner.layout, index),
            *inner.layout.element(),
            inner.write_through,
        )
    }

    fn write_through(
        &self,
        inner: &VectorInner<B>,
        index: usize,
        value: &FieldValue<B>,
    ) -> FlatResult<()> {
        if !inner.write_through {
            flat_bail!(NotMutable: "vector parsed in {} mode without write-through", inner.ctx.mode());
        }
        let position = self.position(&inner.layout, index);
        match *inner.layout.element() {
            ElementKind::Scalar(scalar_type) => {
                write_scalar_value(&self.buffer, position, value.as_scalar()?.cast(scalar_type)?)
            }
            ElementKind::Struct(id) => {
                let bytes = encode_struct(
                    inner.ctx.schema(),
                    id,
                    value.as_struct()?.to_value()?.as_struct()?,
                )?;
                self.buffer.write_from(position, &bytes)
            }
            ElementKind::String { .. } | ElementKind::Table(_) => {
                flat_bail!(NotMutable: "only scalar and struct elements can be written through")
            }
        }
    }
}

impl<B> Debug for Vector<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vector")
            .field("kind", &self.kind())
            .field("len", &self.len())
            .field("mode", &self.mode())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use flatwire_buffer::{ArrayInputBuffer, ReadOnlyMemoryInputBuffer};
    use rstest::rstest;

    use super::*;
    use crate::codec::SerializationContext;
    use crate::parse::parse_root;
    use crate::schema::{
        ElementType, FieldDef, FieldType, Schema, SchemaBuilder, TableDef, VectorType,
    };
    use crate::serialize::{Writer, max_size};
    use crate::value::TableValue;

    fn schema() -> Arc<Schema> {
        Arc::new(
            SchemaBuilder::new()
                .table(
                    TableDef::new("Item")
                        .field(FieldDef::new("id", 0, FieldType::Scalar(ScalarType::I32)).key()),
                )
                .table(
                    TableDef::new("Root")
                        .field(FieldDef::new(
                            "list",
                            0,
                            FieldType::Vector(VectorType::list(ElementType::Scalar(ScalarType::U16))),
                        ))
                        .field(FieldDef::new(
                            "items",
                            1,
                            FieldType::Vector(VectorType::new(
                                ElementType::Table("Item".into()),
                                VectorKind::Indexed,
                            )),
                        ))
                        .field(
                            FieldDef::new(
                                "blob",
                                2,
                                FieldType::Vector(VectorType::new(
                                    ElementType::Scalar(ScalarType::U8),
                                    VectorKind::Memory,
                                )),
                            )
                            .write_through(),
                        )
                        .field(FieldDef::new(
                            "fixed",
                            3,
                            FieldType::Vector(VectorType::new(
                                ElementType::Scalar(ScalarType::U32),
                                VectorKind::Array,
                            )),
                        )),
                )
                .build()
                .unwrap(),
        )
    }

    fn encode(schema: &Schema) -> Vec<u8> {
        let root = schema.table_id("Root").unwrap();
        let items = [5i32, 1, 3]
            .iter()
            .map(|id| Value::Table(TableValue::new().with(0, *id)))
            .collect::<Vec<_>>();
        let value = TableValue::new()
            .with(0, vec![Value::from(1u16), Value::from(2u16)])
            .with(1, items)
            .with(2, Bytes::from_static(b"abc"))
            .with(3, vec![Value::from(10u32), Value::from(20u32)]);
        let mut out = vec![0u8; max_size(schema, root, &value).unwrap()];
        let written = Writer::new(schema, SerializationContext::new(&mut out, true), None, false)
            .write_root(root, &value)
            .unwrap();
        out.truncate(written);
        out
    }

    fn parse(mode: DeserializationMode) -> Table<ArrayInputBuffer> {
        let schema = schema();
        let bytes = encode(&schema);
        let root = schema.table_id("Root").unwrap();
        parse_root(ParseContext::new(schema, mode, true, None), root, ArrayInputBuffer::new(bytes))
            .unwrap()
    }

    #[rstest]
    #[case(DeserializationMode::Lazy)]
    #[case(DeserializationMode::Progressive)]
    #[case(DeserializationMode::Greedy)]
    #[case(DeserializationMode::GreedyMutable)]
    fn indexed_vectors_are_sorted_and_searchable(#[case] mode: DeserializationMode) {
        let items = parse(mode).vector(1).unwrap().unwrap();
        assert_eq!(
            items.keys().unwrap(),
            vec![SortKey::Signed(1), SortKey::Signed(3), SortKey::Signed(5)]
        );
        for id in [1i64, 3, 5] {
            let found = items.find(&SortKey::Signed(id)).unwrap().unwrap();
            assert_eq!(found.key().unwrap(), SortKey::Signed(id));
        }
        assert!(items.find(&SortKey::Signed(4)).unwrap().is_none());
    }

    #[rstest]
    #[case(DeserializationMode::Lazy)]
    #[case(DeserializationMode::Progressive)]
    #[case(DeserializationMode::Greedy)]
    fn only_greedy_mutable_lists_change(#[case] mode: DeserializationMode) {
        let list = parse(mode).vector(0).unwrap().unwrap();
        assert!(list.set(0, 9u16).unwrap_err().is_not_mutable());
        assert!(list.push(9u16).unwrap_err().is_not_mutable());
        assert!(list.remove(0).unwrap_err().is_not_mutable());
    }

    #[test]
    fn greedy_mutable_list_operations() {
        let table = parse(DeserializationMode::GreedyMutable);
        let list = table.vector(0).unwrap().unwrap();
        list.set(0, 7u16).unwrap();
        list.push(3u16).unwrap();
        assert_eq!(list.remove(1).unwrap().as_scalar().unwrap(), ScalarValue::U16(2));
        assert_eq!(list.to_native_vec::<u16>().unwrap(), vec![7, 3]);
        assert!(matches!(list.get(2), Err(FlatError::OutOfBounds(2, 0, 2, _))));

        let fixed = table.vector(3).unwrap().unwrap();
        fixed.set(1, 21u32).unwrap();
        assert!(fixed.push(1u32).unwrap_err().is_not_mutable());

        let items = table.vector(1).unwrap().unwrap();
        let extra = items.get(0).unwrap().as_table().unwrap().detach(true).unwrap();
        extra.set(0, 2i32).unwrap();
        assert!(items.insert(&extra).unwrap().is_none());
        assert_eq!(items.len(), 4);
        assert!(items.find(&SortKey::Signed(2)).unwrap().is_some());
    }

    #[test]
    fn memory_vectors_write_through() {
        let table = parse(DeserializationMode::Lazy);
        let blob = table.vector(2).unwrap().unwrap();
        assert_eq!(blob.bytes().unwrap(), Bytes::from_static(b"abc"));
        blob.memory().unwrap().set(0, b'x').unwrap();
        assert_eq!(blob.bytes().unwrap(), Bytes::from_static(b"xbc"));
        assert_eq!(blob.to_value().unwrap(), Value::Bytes(Bytes::from_static(b"xbc")));

        let greedy = parse(DeserializationMode::Greedy).vector(2).unwrap().unwrap();
        assert!(greedy.memory().unwrap_err().is_not_mutable());
    }

    #[test]
    fn native_slices_need_a_pinned_buffer() {
        let schema = schema();
        let bytes = encode(&schema);
        let root = schema.table_id("Root").unwrap();

        let unpinned = ReadOnlyMemoryInputBuffer::new(&bytes);
        let ctx = ParseContext::new(schema.clone(), DeserializationMode::Lazy, true, None);
        let table = parse_root(ctx, root, &unpinned).unwrap();
        let fixed = table.vector(3).unwrap().unwrap();
        assert!(fixed.native_slice::<u32>().is_err());

        let pinned = ReadOnlyMemoryInputBuffer::with_pinned(&bytes, true);
        let ctx = ParseContext::new(schema, DeserializationMode::Lazy, true, None);
        let table = parse_root(ctx, root, &pinned).unwrap();
        let fixed = table.vector(3).unwrap().unwrap();
        assert!(fixed.native_slice::<u16>().is_err());
        // The slice is only handed out when the bytes happen to be aligned in memory.
        if let Ok(slice) = fixed.native_slice::<u32>() {
            assert_eq!(slice, &[10, 20]);
        }
        assert_eq!(fixed.to_native_vec::<u32>().unwrap(), vec![10, 20]);
    }

    #[test]
    fn native_slices_refuse_greedy_and_table_vectors() {
        let greedy = parse(DeserializationMode::Greedy).vector(3).unwrap().unwrap();
        assert!(matches!(
            greedy.native_slice::<u32>(),
            Err(FlatError::InvalidOperation(..))
        ));
        assert_eq!(greedy.to_native_vec::<u32>().unwrap(), vec![10, 20]);

        let items = parse(DeserializationMode::Lazy).vector(1).unwrap().unwrap();
        assert!(matches!(
            items.native_slice::<i32>(),
            Err(FlatError::MismatchedTypes(..))
        ));
    }
}
