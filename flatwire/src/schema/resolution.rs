use flatwire_buffer::{Alignment, ScalarType};
use flatwire_error::{FlatResult, flat_bail, flat_err};
use itertools::Itertools;
use rustc_hash::FxHashMap;

use crate::codec::{FILE_IDENTIFIER_LENGTH, SIZE_OF_UOFFSET};
use crate::schema::{
    ElementKind, ElementType, FieldDef, FieldKind, FieldLayout, FieldType, Schema, SchemaBuilder,
    StructFieldKind, StructFieldLayout, StructFieldType, StructId, StructLayout, TableDef, TableId,
    TableLayout, UnionId, UnionLayout, UnionMemberKind, UnionMemberLayout, UnionMemberType,
    VectorKind, VectorLayout, VectorType,
};
use crate::vtable::VTableKind;

#[derive(Debug, Clone, Copy)]
enum TypeRef {
    Table(TableId),
    Struct(StructId),
    Union(UnionId),
}

impl SchemaBuilder {
    /// Resolve every declaration into a [`Schema`].
    pub fn build(self) -> FlatResult<Schema> {
        let resolver = Resolver::new(&self)?;
        let structs = resolver.structs()?;
        let unions = resolver.unions()?;
        let tables = self
            .tables
            .iter()
            .map(|table| resolver.table(table, &structs))
            .collect::<FlatResult<Vec<_>>>()?;

        let file_identifier = self
            .file_identifier
            .as_deref()
            .map(|identifier| {
                <[u8; FILE_IDENTIFIER_LENGTH]>::try_from(identifier.as_bytes()).map_err(|_| {
                    flat_err!(InvalidSchema: "file identifier \"{}\" must be exactly 4 bytes", identifier)
                })
            })
            .transpose()?;

        let table_names = tables
            .iter()
            .enumerate()
            .map(|(id, table)| (table.name.clone(), TableId(id)))
            .collect();

        log::debug!(
            "built schema with {} tables, {} structs and {} unions",
            tables.len(),
            structs.len(),
            unions.len()
        );

        Ok(Schema {
            tables,
            structs,
            unions,
            table_names,
            file_identifier,
        })
    }
}

struct Resolver<'a> {
    builder: &'a SchemaBuilder,
    names: FxHashMap<&'a str, TypeRef>,
    keyed: Vec<bool>,
}

impl<'a> Resolver<'a> {
    fn new(builder: &'a SchemaBuilder) -> FlatResult<Self> {
        let declared = builder
            .tables
            .iter()
            .enumerate()
            .map(|(id, table)| (table.name.as_str(), TypeRef::Table(TableId(id))))
            .chain(
                builder
                    .structs
                    .iter()
                    .enumerate()
                    .map(|(id, s)| (s.name.as_str(), TypeRef::Struct(StructId(id)))),
            )
            .chain(
                builder
                    .unions
                    .iter()
                    .enumerate()
                    .map(|(id, u)| (u.name.as_str(), TypeRef::Union(UnionId(id)))),
            );

        let mut names = FxHashMap::default();
        for (name, type_ref) in declared {
            if names.insert(name, type_ref).is_some() {
                flat_bail!(InvalidSchema: "type {} is declared more than once", name);
            }
        }

        let keyed = builder
            .tables
            .iter()
            .map(|table| table.fields.iter().any(|field| field.key))
            .collect();

        Ok(Self {
            builder,
            names,
            keyed,
        })
    }

    fn lookup(&self, name: &str) -> FlatResult<TypeRef> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| flat_err!(InvalidSchema: "unknown type {}", name))
    }

    fn table_id(&self, name: &str) -> FlatResult<TableId> {
        match self.lookup(name)? {
            TypeRef::Table(id) => Ok(id),
            _ => Err(flat_err!(InvalidSchema: "{} is not a table", name)),
        }
    }

    fn struct_id(&self, name: &str) -> FlatResult<StructId> {
        match self.lookup(name)? {
            TypeRef::Struct(id) => Ok(id),
            _ => Err(flat_err!(InvalidSchema: "{} is not a struct", name)),
        }
    }

    fn union_id(&self, name: &str) -> FlatResult<UnionId> {
        match self.lookup(name)? {
            TypeRef::Union(id) => Ok(id),
            _ => Err(flat_err!(InvalidSchema: "{} is not a union", name)),
        }
    }

    fn structs(&self) -> FlatResult<Vec<StructLayout>> {
        let count = self.builder.structs.len();
        let mut layouts = vec![None; count];
        let mut visiting = vec![false; count];
        for id in 0..count {
            self.layout_struct(StructId(id), &mut layouts, &mut visiting)?;
        }
        Ok(layouts.into_iter().flatten().collect())
    }

    fn layout_struct(
        &self,
        id: StructId,
        layouts: &mut [Option<StructLayout>],
        visiting: &mut [bool],
    ) -> FlatResult<(usize, Alignment)> {
        if let Some(layout) = &layouts[id.0] {
            return Ok((layout.size, layout.alignment));
        }
        let def = &self.builder.structs[id.0];
        if visiting[id.0] {
            flat_bail!(InvalidSchema: "struct {} contains itself", def.name);
        }
        if def.fields.is_empty() {
            flat_bail!(InvalidSchema: "struct {} has no fields", def.name);
        }
        if let Some(name) = def.fields.iter().map(|f| &f.name).duplicates().next() {
            flat_bail!(InvalidSchema: "struct {} declares field {} more than once", def.name, name);
        }
        visiting[id.0] = true;

        let mut offset: usize = 0;
        let mut alignment = Alignment::none();
        let mut fields = Vec::with_capacity(def.fields.len());
        for field in &def.fields {
            let (kind, size, field_alignment) = match &field.field_type {
                StructFieldType::Scalar(scalar_type) => (
                    StructFieldKind::Scalar(*scalar_type),
                    scalar_type.byte_width(),
                    scalar_type.alignment(),
                ),
                StructFieldType::Struct(name) => {
                    let nested = self.struct_id(name)?;
                    let (size, nested_alignment) = self.layout_struct(nested, layouts, visiting)?;
                    (StructFieldKind::Struct(nested), size, nested_alignment)
                }
            };
            offset = offset.next_multiple_of(*field_alignment);
            fields.push(StructFieldLayout {
                name: field.name.clone(),
                kind,
                offset,
            });
            offset += size;
            alignment = alignment.max(field_alignment);
        }

        let size = offset.next_multiple_of(*alignment);
        visiting[id.0] = false;
        layouts[id.0] = Some(StructLayout {
            name: def.name.clone(),
            fields,
            size,
            alignment,
        });
        Ok((size, alignment))
    }

    fn unions(&self) -> FlatResult<Vec<UnionLayout>> {
        self.builder
            .unions
            .iter()
            .map(|def| {
                if def.members.is_empty() {
                    flat_bail!(InvalidSchema: "union {} has no members", def.name);
                }
                if let Some(tag) = def.members.iter().map(|(tag, _)| tag).duplicates().next() {
                    flat_bail!(InvalidSchema: "union {} declares tag {} more than once", def.name, tag);
                }
                let members = def
                    .members
                    .iter()
                    .map(|(tag, member)| {
                        if *tag == 0 {
                            flat_bail!(InvalidSchema: "union {} uses the reserved tag 0", def.name);
                        }
                        let kind = match member {
                            UnionMemberType::Table(name) => UnionMemberKind::Table(self.table_id(name)?),
                            UnionMemberType::Struct(name) => UnionMemberKind::Struct(self.struct_id(name)?),
                            UnionMemberType::String => UnionMemberKind::String,
                        };
                        Ok(UnionMemberLayout { tag: *tag, kind })
                    })
                    .collect::<FlatResult<Vec<_>>>()?;
                Ok(UnionLayout {
                    name: def.name.clone(),
                    members,
                })
            })
            .collect()
    }

    fn table(
        &self,
        def: &TableDef,
        structs: &[StructLayout],
    ) -> FlatResult<TableLayout> {
        if let Some(name) = def.fields.iter().map(|f| &f.name).duplicates().next() {
            flat_bail!(InvalidSchema: "table {} declares field {} more than once", def.name, name);
        }

        let mut fields = def
            .fields
            .iter()
            .map(|field| {
                self.field(field, structs)
                    .map_err(|err| err.with_context(format!("in table {}", def.name)))
            })
            .collect::<FlatResult<Vec<_>>>()?;
        fields.sort_by_key(|field| field.index);

        let slot_count = fields
            .iter()
            .map(|field| usize::from(field.index) + field.slot_count())
            .max()
            .unwrap_or(0);
        let mut slots = vec![None; slot_count];
        for (position, field) in fields.iter().enumerate() {
            let first = usize::from(field.index);
            for slot in &mut slots[first..first + field.slot_count()] {
                if slot.is_some() {
                    flat_bail!(
                        InvalidSchema: "field {} of table {} overlaps another field at index {}",
                        field.name,
                        def.name,
                        first
                    );
                }
                *slot = Some(position);
            }
        }

        let keys = fields.iter().positions(|field| field.key).collect::<Vec<_>>();
        if keys.len() > 1 {
            flat_bail!(InvalidSchema: "table {} declares more than one key", def.name);
        }

        Ok(TableLayout {
            name: def.name.clone(),
            vtable_kind: VTableKind::for_max_index(slot_count.checked_sub(1)),
            fields,
            slots,
            key: keys.first().copied(),
        })
    }

    fn field(&self, def: &FieldDef, structs: &[StructLayout]) -> FlatResult<FieldLayout> {
        let uoffset = (SIZE_OF_UOFFSET, Alignment::new(SIZE_OF_UOFFSET));
        let (kind, (inline_size, inline_alignment)) = match &def.field_type {
            FieldType::Scalar(scalar_type) => (
                FieldKind::Scalar(*scalar_type),
                (scalar_type.byte_width(), scalar_type.alignment()),
            ),
            FieldType::String => (FieldKind::String { shared: false }, uoffset),
            FieldType::SharedString => (FieldKind::String { shared: true }, uoffset),
            FieldType::Struct(name) => {
                let id = self.struct_id(name)?;
                let layout = &structs[id.0];
                (FieldKind::Struct(id), (layout.size, layout.alignment))
            }
            FieldType::Table(name) => (FieldKind::Table(self.table_id(name)?), uoffset),
            FieldType::Union(name) => {
                if def.index == u8::MAX {
                    flat_bail!(InvalidSchema: "union field {} at index 255 has no room for its value slot", def.name);
                }
                (FieldKind::Union(self.union_id(name)?), (1, Alignment::none()))
            }
            FieldType::Vector(vector) => (
                FieldKind::Vector(self.vector(def, vector, structs)?),
                uoffset,
            ),
        };

        let default = match (&kind, def.default) {
            (_, None) => None,
            (FieldKind::Scalar(scalar_type), Some(default)) => Some(
                default
                    .cast(*scalar_type)
                    .map_err(|_| flat_err!(InvalidSchema: "default {} of field {} is not a {}", default, def.name, scalar_type))?,
            ),
            (kind, Some(_)) => {
                flat_bail!(InvalidSchema: "field {} of type {} cannot have a default", def.name, kind)
            }
        };

        if def.required && matches!(kind, FieldKind::Scalar(_)) {
            flat_bail!(InvalidSchema: "scalar field {} cannot be required", def.name);
        }
        if def.key && !matches!(kind, FieldKind::Scalar(_) | FieldKind::String { .. }) {
            flat_bail!(InvalidSchema: "field {} of type {} cannot be a key", def.name, kind);
        }
        if def.write_through {
            let supported = match &kind {
                FieldKind::Scalar(_) | FieldKind::Struct(_) => true,
                FieldKind::Vector(vector) => vector.is_fixed_size(),
                _ => false,
            };
            if !supported {
                flat_bail!(InvalidSchema: "field {} of type {} cannot be write-through", def.name, kind);
            }
        }
        if def.sorted {
            match &kind {
                FieldKind::Vector(vector) if matches!(vector.element, ElementKind::Table(_)) => {}
                _ => flat_bail!(InvalidSchema: "only vectors of tables can be sorted, field {} is not one", def.name),
            }
        }

        Ok(FieldLayout {
            name: def.name.clone(),
            index: def.index,
            kind,
            inline_size,
            inline_alignment,
            default,
            required: def.required,
            key: def.key,
            write_through: def.write_through,
            sorted: def.sorted,
            deprecated: def.deprecated,
        })
    }

    fn vector(
        &self,
        def: &FieldDef,
        vector: &VectorType,
        structs: &[StructLayout],
    ) -> FlatResult<VectorLayout> {
        let uoffset = (SIZE_OF_UOFFSET, Alignment::new(SIZE_OF_UOFFSET));
        let (element, (stride, alignment)) = match &vector.element {
            ElementType::Scalar(scalar_type) => (
                ElementKind::Scalar(*scalar_type),
                (scalar_type.byte_width(), scalar_type.alignment()),
            ),
            ElementType::String => (ElementKind::String { shared: false }, uoffset),
            ElementType::SharedString => (ElementKind::String { shared: true }, uoffset),
            ElementType::Struct(name) => {
                let id = self.struct_id(name)?;
                let layout = &structs[id.0];
                (ElementKind::Struct(id), (layout.size, layout.alignment))
            }
            ElementType::Table(name) => (ElementKind::Table(self.table_id(name)?), uoffset),
        };

        match vector.kind {
            VectorKind::Memory if element != ElementKind::Scalar(ScalarType::U8) => {
                flat_bail!(InvalidSchema: "memory vector {} must have u8 elements", def.name)
            }
            VectorKind::Native
                if !matches!(element, ElementKind::Scalar(scalar_type) if scalar_type.is_native()) =>
            {
                flat_bail!(InvalidSchema: "native vector {} must have numeric elements", def.name)
            }
            VectorKind::Indexed => match element {
                ElementKind::Table(id) if self.keyed[id.0] => {}
                _ => flat_bail!(InvalidSchema: "indexed vector {} must have keyed table elements", def.name),
            },
            _ => {}
        }
        if def.sorted {
            if let ElementKind::Table(id) = element {
                if !self.keyed[id.0] {
                    flat_bail!(InvalidSchema: "sorted vector {} must have keyed table elements", def.name);
                }
            }
        }

        Ok(VectorLayout {
            element,
            kind: vector.kind,
            stride,
            alignment,
        })
    }
}
