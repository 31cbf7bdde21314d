use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use flatwire_buffer::{InputBuffer, Scalar, checked_range};
use flatwire_error::{FlatError, FlatResult, flat_bail, flat_err};

use super::{FieldValue, ParseContext, read_scalar_value, write_scalar_value};
use crate::schema::{StructFieldKind, StructId, StructLayout};
use crate::value::{ScalarValue, StructValue, Value};

/// A parsed struct.
///
/// Buffer-backed structs read their fields straight from the buffer on every access.
pub struct StructRef<B>(Rc<StructInner<B>>);

struct StructInner<B> {
    ctx: Rc<ParseContext>,
    id: StructId,
    state: StructState<B>,
}

enum StructState<B> {
    Buffered {
        buffer: B,
        offset: usize,
        write_through: bool,
    },
    Greedy(RefCell<Vec<FieldValue<B>>>),
}

impl<B> Clone for StructRef<B> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<B> StructRef<B> {
    /// The resolved layout of the struct type.
    pub fn layout(&self) -> &StructLayout {
        self.0.ctx.schema().struct_layout(self.0.id)
    }

    /// The buffer the struct reads from. Greedy structs hold no buffer.
    pub fn buffer(&self) -> Option<&B> {
        match &self.0.state {
            StructState::Buffered { buffer, .. } => Some(buffer),
            StructState::Greedy(_) => None,
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<B: InputBuffer + Clone> StructRef<B> {
    pub(crate) fn buffered(
        ctx: Rc<ParseContext>,
        id: StructId,
        buffer: B,
        offset: usize,
        write_through: bool,
    ) -> FlatResult<Self> {
        let layout = ctx.schema().struct_layout(id);
        if !layout.alignment().is_offset_aligned(offset) {
            flat_bail!(
                InvalidFormat: "struct {} at offset {} is not aligned to {}",
                layout.name(),
                offset,
                layout.alignment()
            );
        }
        checked_range(offset, layout.size(), buffer.len()).map_err(|_| {
            flat_err!(
                InvalidFormat: "struct {} at offset {} exceeds buffer of {} bytes",
                layout.name(),
                offset,
                buffer.len()
            )
        })?;
        Ok(Self(Rc::new(StructInner {
            ctx,
            id,
            state: StructState::Buffered {
                buffer,
                offset,
                write_through,
            },
        })))
    }

    pub(crate) fn from_value(
        ctx: &Rc<ParseContext>,
        id: StructId,
        value: &StructValue,
    ) -> FlatResult<Self> {
        let layout = ctx.schema().struct_layout(id);
        if value.len() != layout.fields().len() {
            flat_bail!(
                "struct {} has {} fields but the value has {}",
                layout.name(),
                layout.fields().len(),
                value.len()
            );
        }
        let fields = layout
            .fields()
            .iter()
            .zip(value.fields())
            .map(|(field, field_value)| {
                Ok(match field.kind() {
                    StructFieldKind::Scalar(scalar_type) => {
                        FieldValue::Scalar(field_value.as_scalar()?.cast(scalar_type)?)
                    }
                    StructFieldKind::Struct(nested) => FieldValue::Struct(StructRef::from_value(
                        ctx,
                        nested,
                        field_value.as_struct()?,
                    )?),
                })
            })
            .collect::<FlatResult<Vec<_>>>()?;
        Ok(Self(Rc::new(StructInner {
            ctx: ctx.clone(),
            id,
            state: StructState::Greedy(RefCell::new(fields)),
        })))
    }

    /// The field at position `field` in declaration order.
    pub fn get(&self, field: usize) -> FlatResult<FieldValue<B>> {
        let layout = self.layout();
        let declared = layout
            .fields()
            .get(field)
            .ok_or_else(|| flat_err!(OutOfBounds: field, 0, layout.fields().len()))?;
        match &self.0.state {
            StructState::Buffered {
                buffer,
                offset,
                write_through,
            } => {
                let position = offset + declared.offset();
                Ok(match declared.kind() {
                    StructFieldKind::Scalar(scalar_type) => {
                        FieldValue::Scalar(read_scalar_value(buffer, position, scalar_type)?)
                    }
                    StructFieldKind::Struct(nested) => FieldValue::Struct(StructRef::buffered(
                        self.0.ctx.clone(),
                        nested,
                        buffer.clone(),
                        position,
                        *write_through,
                    )?),
                })
            }
            StructState::Greedy(fields) => Ok(fields.borrow()[field].clone()),
        }
    }

    /// The scalar at position `field`, converted to `T` if it fits.
    pub fn scalar<T: Scalar + TryFrom<ScalarValue, Error = FlatError>>(
        &self,
        field: usize,
    ) -> FlatResult<T> {
        self.get(field)?
            .as_scalar()?
            .cast(T::SCALAR_TYPE)?
            .as_primitive()
    }

    /// Replace the scalar at position `field`.
    pub fn set(&self, field: usize, value: impl Into<ScalarValue>) -> FlatResult<()> {
        let layout = self.layout();
        let declared = layout
            .fields()
            .get(field)
            .ok_or_else(|| flat_err!(OutOfBounds: field, 0, layout.fields().len()))?;
        let StructFieldKind::Scalar(scalar_type) = declared.kind() else {
            flat_bail!(
                InvalidOperation: "field {} of struct {} is a struct, set its fields instead",
                declared.name(),
                layout.name()
            );
        };
        let value = value.into().cast(scalar_type)?;
        match &self.0.state {
            StructState::Buffered {
                buffer,
                offset,
                write_through: true,
            } => write_scalar_value(buffer, offset + declared.offset(), value),
            StructState::Buffered { .. } => flat_bail!(
                NotMutable: "struct {} parsed in {} mode without write-through",
                layout.name(),
                self.0.ctx.mode()
            ),
            StructState::Greedy(fields) => {
                if !self.0.ctx.mode().is_mutable() {
                    flat_bail!(NotMutable: "struct {} parsed in {} mode", layout.name(), self.0.ctx.mode());
                }
                fields.borrow_mut()[field] = FieldValue::Scalar(value);
                Ok(())
            }
        }
    }

    pub fn to_value(&self) -> FlatResult<Value> {
        (0..self.layout().fields().len())
            .map(|field| self.get(field)?.to_value())
            .collect::<FlatResult<StructValue>>()
            .map(Value::Struct)
    }
}

impl<B> Debug for StructRef<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructRef")
            .field("name", &self.layout().name())
            .field("buffered", &self.buffer().is_some())
            .finish()
    }
}
