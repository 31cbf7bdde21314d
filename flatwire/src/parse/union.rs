use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use flatwire_buffer::InputBuffer;
use flatwire_error::{FlatResult, flat_err};

use super::{FieldValue, ParseContext, StructRef, Table};
use crate::schema::{UnionId, UnionMemberKind};
use crate::value::{UnionValue, Value};

/// A parsed union: the member tag and the member value.
pub struct UnionRef<B>(Rc<UnionInner<B>>);

struct UnionInner<B> {
    tag: u8,
    value: FieldValue<B>,
}

impl<B> Clone for UnionRef<B> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<B> UnionRef<B> {
    /// The member tag, never 0.
    pub fn tag(&self) -> u8 {
        self.0.tag
    }

    /// The member value: a table, a struct or a string.
    pub fn value(&self) -> &FieldValue<B> {
        &self.0.value
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<B: InputBuffer + Clone> UnionRef<B> {
    /// Decode the member `tag` of union `id` stored at `target`.
    pub(crate) fn buffered(
        ctx: &Rc<ParseContext>,
        id: UnionId,
        tag: u8,
        buffer: &B,
        target: usize,
    ) -> FlatResult<Self> {
        let layout = ctx.schema().union_layout(id);
        let member = layout.member(tag).ok_or_else(|| {
            flat_err!(InvalidFormat: "tag {} is not a member of union {}", tag, layout.name())
        })?;
        let value = match member.kind() {
            UnionMemberKind::Table(table) => {
                FieldValue::Table(Table::buffered(ctx.clone(), table, buffer.clone(), target)?)
            }
            UnionMemberKind::Struct(id) => FieldValue::Struct(StructRef::buffered(
                ctx.clone(),
                id,
                buffer.clone(),
                target,
                false,
            )?),
            UnionMemberKind::String => FieldValue::String(ctx.read_string(buffer, target, false)?),
        };
        Ok(Self(Rc::new(UnionInner { tag, value })))
    }

    pub(crate) fn from_value(
        ctx: &Rc<ParseContext>,
        id: UnionId,
        value: &UnionValue,
    ) -> FlatResult<Self> {
        let layout = ctx.schema().union_layout(id);
        let member = layout.member(value.tag()).ok_or_else(|| {
            flat_err!("tag {} is not a member of union {}", value.tag(), layout.name())
        })?;
        let member_value = match member.kind() {
            UnionMemberKind::Table(table) => {
                FieldValue::Table(Table::from_value(ctx.clone(), table, value.value().as_table()?)?)
            }
            UnionMemberKind::Struct(id) => {
                FieldValue::Struct(StructRef::from_value(ctx, id, value.value().as_struct()?)?)
            }
            UnionMemberKind::String => FieldValue::String(value.value().as_str()?.clone()),
        };
        Ok(Self(Rc::new(UnionInner {
            tag: value.tag(),
            value: member_value,
        })))
    }

    pub fn to_value(&self) -> FlatResult<Value> {
        Ok(Value::Union(UnionValue::new(
            self.tag(),
            self.value().to_value()?,
        )))
    }
}

impl<B> Debug for UnionRef<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnionRef")
            .field("tag", &self.tag())
            .field("value", self.value())
            .finish()
    }
}
