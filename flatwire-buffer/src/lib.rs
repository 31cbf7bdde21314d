#![deny(missing_docs)]

//! Input buffers for the flatwire FlatBuffers runtime.
//!
//! A FlatBuffer is parsed straight out of the bytes it arrived in. This crate provides the
//! [`InputBuffer`] abstraction over those bytes and the concrete buffer kinds:
//!
//! * [`ArrayInputBuffer`] owns a writable heap array and is never pinned.
//! * [`MemoryInputBuffer`] borrows writable caller memory, pinned if the caller says so.
//! * [`ReadOnlyMemoryInputBuffer`] borrows read-only caller memory and refuses mutable views.
//! * [`BytesInputBuffer`] owns a reference-counted [`bytes::Bytes`] and can be sent across threads.
//! * [`PinnedInputBuffer`] is a scoped guard reading through raw pointers (little-endian only).
//!
//! All scalar access goes through [`InputBufferExt`], which always decodes little-endian.

pub use alignment::*;
pub use array::*;
pub use bytes_input::*;
pub use input::*;
pub use memory::*;
#[cfg(target_endian = "little")]
pub use pinned::*;
pub use scalar::*;
pub use slice::*;

mod alignment;
mod array;
mod bytes_input;
mod input;
mod memory;
#[cfg(target_endian = "little")]
mod pinned;
mod scalar;
mod slice;
