//! Shared strings: de-duplication of repeated strings while writing, and memoization of decoded
//! strings while reading.
//!
//! The writer is scoped to a single serialization call. Because every uoffset must point forward,
//! a shared string is not written when it is first seen. Instead the writer remembers every
//! position that refers to it and writes the string once, when it is evicted from the cache or
//! when serialization finishes, patching all pending positions at that point.

use std::cell::RefCell;
use std::hash::BuildHasher;
use std::rc::Rc;
use std::sync::Arc;

use flatwire_error::FlatResult;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;

use crate::codec::{SIZE_OF_UOFFSET, SerializationContext};

/// The capacity of the shared string caches unless configured otherwise.
pub const DEFAULT_SHARED_STRING_CAPACITY: usize = 1000;

/// Creates one shared string writer per serialization call.
pub type SharedStringWriterFactory = Arc<dyn Fn() -> Box<dyn SharedStringWriter> + Send + Sync>;

/// Creates the shared string reader used by one parse.
pub type SharedStringReaderFactory = Arc<dyn Fn() -> Rc<dyn SharedStringReader> + Send + Sync>;

/// De-duplicates strings during a single serialization call.
pub trait SharedStringWriter {
    /// Record that the uoffset at `position` must point at `value`.
    fn write(
        &mut self,
        ctx: &mut SerializationContext<'_>,
        position: usize,
        value: &Arc<str>,
    ) -> FlatResult<()>;

    /// Write every string still held by the writer and patch the positions that refer to it.
    fn flush(&mut self, ctx: &mut SerializationContext<'_>) -> FlatResult<()>;
}

struct PendingString {
    value: Arc<str>,
    positions: Vec<usize>,
}

impl PendingString {
    fn write_out(self, ctx: &mut SerializationContext<'_>) -> FlatResult<()> {
        let target = ctx.write_string(&self.value)?;
        for position in self.positions {
            ctx.write_uoffset(position, target)?;
        }
        Ok(())
    }
}

/// A direct-mapped cache: every string hashes to exactly one slot and a colliding string evicts
/// the resident one.
pub struct DirectMappedSharedStringWriter {
    slots: Vec<Option<PendingString>>,
    hasher: FxBuildHasher,
}

impl DirectMappedSharedStringWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity.max(1)).map(|_| None).collect(),
            hasher: FxBuildHasher,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, value: &str) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let hash = self.hasher.hash_one(value) as usize;
        hash % self.slots.len()
    }
}

impl SharedStringWriter for DirectMappedSharedStringWriter {
    fn write(
        &mut self,
        ctx: &mut SerializationContext<'_>,
        position: usize,
        value: &Arc<str>,
    ) -> FlatResult<()> {
        let slot = self.slot(value);
        match &mut self.slots[slot] {
            Some(pending) if pending.value == *value => {
                pending.positions.push(position);
                return Ok(());
            }
            _ => {}
        }
        let incoming = PendingString {
            value: value.clone(),
            positions: vec![position],
        };
        if let Some(evicted) = self.slots[slot].replace(incoming) {
            log::trace!(
                "evicting shared string of {} bytes referenced {} times",
                evicted.value.len(),
                evicted.positions.len()
            );
            evicted.write_out(ctx)?;
        }
        Ok(())
    }

    fn flush(&mut self, ctx: &mut SerializationContext<'_>) -> FlatResult<()> {
        let mut flushed = 0;
        for pending in self.slots.iter_mut().filter_map(Option::take) {
            pending.write_out(ctx)?;
            flushed += 1;
        }
        log::trace!("flushed {} shared strings", flushed);
        Ok(())
    }
}

/// A factory for direct-mapped shared string writers of the given capacity.
pub fn direct_mapped_writer(capacity: usize) -> SharedStringWriterFactory {
    Arc::new(move || -> Box<dyn SharedStringWriter> {
        Box::new(DirectMappedSharedStringWriter::new(capacity))
    })
}

/// Memoizes decoded strings by the offset they were read from.
///
/// A cached string is only returned when it still matches the bytes at that offset, so one
/// reader can serve parses of different buffers.
pub trait SharedStringReader {
    /// Return the string whose encoded `bytes` (without the terminator) start at `offset`,
    /// decoding them if they are not cached.
    fn read(&self, offset: usize, bytes: &[u8]) -> FlatResult<Arc<str>>;
}

impl<T: SharedStringReader + ?Sized> SharedStringReader for Arc<T> {
    fn read(&self, offset: usize, bytes: &[u8]) -> FlatResult<Arc<str>> {
        (**self).read(offset, bytes)
    }
}

type ReaderSlots = Vec<Option<(usize, Arc<str>)>>;

fn read_slot(slots: &mut ReaderSlots, offset: usize, bytes: &[u8]) -> FlatResult<Arc<str>> {
    // Strings start on 4-byte boundaries.
    let slot = (offset / SIZE_OF_UOFFSET) % slots.len();
    if let Some((cached, value)) = &slots[slot] {
        if *cached == offset && value.as_bytes() == bytes {
            return Ok(value.clone());
        }
    }
    let value: Arc<str> = Arc::from(std::str::from_utf8(bytes)?);
    slots[slot] = Some((offset, value.clone()));
    Ok(value)
}

/// A single-threaded, direct-mapped reader cache.
pub struct SharedStringReaderCache {
    slots: RefCell<ReaderSlots>,
}

impl SharedStringReaderCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RefCell::new(vec![None; capacity.max(1)]),
        }
    }
}

impl SharedStringReader for SharedStringReaderCache {
    fn read(&self, offset: usize, bytes: &[u8]) -> FlatResult<Arc<str>> {
        read_slot(&mut self.slots.borrow_mut(), offset, bytes)
    }
}

/// A thread-safe, direct-mapped reader cache that can be shared between parses on different
/// threads.
pub struct ConcurrentSharedStringReader {
    slots: Mutex<ReaderSlots>,
}

impl ConcurrentSharedStringReader {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity.max(1)]),
        }
    }
}

impl SharedStringReader for ConcurrentSharedStringReader {
    fn read(&self, offset: usize, bytes: &[u8]) -> FlatResult<Arc<str>> {
        read_slot(&mut self.slots.lock(), offset, bytes)
    }
}

/// A factory creating a fresh single-threaded reader cache for every parse.
pub fn reader_cache(capacity: usize) -> SharedStringReaderFactory {
    Arc::new(move || -> Rc<dyn SharedStringReader> {
        Rc::new(SharedStringReaderCache::new(capacity))
    })
}

/// A factory handing the same thread-safe reader cache to every parse. Hits are checked against
/// the bytes of the buffer being parsed, so parses of different buffers never share a string.
pub fn concurrent_reader(capacity: usize) -> SharedStringReaderFactory {
    let reader = Arc::new(ConcurrentSharedStringReader::new(capacity));
    Arc::new(move || -> Rc<dyn SharedStringReader> { Rc::new(reader.clone()) })
}

#[cfg(test)]
mod test {
    use flatwire_buffer::{Alignment, ArrayInputBuffer};

    use super::*;
    use crate::codec::read_string;

    fn pointers(ctx: &mut SerializationContext<'_>, count: usize) -> Vec<usize> {
        (0..count)
            .map(|_| ctx.allocate(SIZE_OF_UOFFSET, Alignment::new(SIZE_OF_UOFFSET)).unwrap())
            .collect()
    }

    #[test]
    fn repeated_strings_are_written_once() {
        let mut out = vec![0u8; 64];
        let mut ctx = SerializationContext::new(&mut out, true);
        let positions = pointers(&mut ctx, 3);
        let mut writer = DirectMappedSharedStringWriter::new(16);
        let hello: Arc<str> = Arc::from("hello");
        writer.write(&mut ctx, positions[0], &hello).unwrap();
        writer.write(&mut ctx, positions[1], &Arc::from("world")).unwrap();
        writer.write(&mut ctx, positions[2], &hello).unwrap();
        writer.flush(&mut ctx).unwrap();
        let written = ctx.offset();

        let buffer = ArrayInputBuffer::new(&out[..written]);
        let targets = positions
            .iter()
            .map(|p| crate::codec::read_uoffset(&buffer, *p).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(targets[0], targets[2]);
        assert_ne!(targets[0], targets[1]);
        assert_eq!(&*read_string(&buffer, targets[0]).unwrap(), "hello");
        assert_eq!(&*read_string(&buffer, targets[1]).unwrap(), "world");
    }

    #[test]
    fn collisions_evict_and_patch() {
        let mut out = vec![0u8; 64];
        let mut ctx = SerializationContext::new(&mut out, true);
        let positions = pointers(&mut ctx, 3);
        // A single slot: every new string evicts the previous one.
        let mut writer = DirectMappedSharedStringWriter::new(1);
        writer.write(&mut ctx, positions[0], &Arc::from("a")).unwrap();
        writer.write(&mut ctx, positions[1], &Arc::from("b")).unwrap();
        writer.write(&mut ctx, positions[2], &Arc::from("a")).unwrap();
        writer.flush(&mut ctx).unwrap();
        let written = ctx.offset();

        let buffer = ArrayInputBuffer::new(&out[..written]);
        let strings = positions
            .iter()
            .map(|p| {
                let target = crate::codec::read_uoffset(&buffer, *p).unwrap();
                read_string(&buffer, target).unwrap()
            })
            .collect::<Vec<_>>();
        assert_eq!(strings.iter().map(|s| &**s).collect::<Vec<_>>(), vec!["a", "b", "a"]);
        assert_eq!(writer.capacity(), 1);
    }

    #[test]
    fn reader_cache_decodes_once_per_offset() {
        let cache = SharedStringReaderCache::new(8);
        let first = cache.read(12, b"x").unwrap();
        let second = cache.read(12, b"x").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        let other = cache.read(16, b"x").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn reader_cache_rejects_invalid_utf8() {
        let cache = SharedStringReaderCache::new(8);
        cache.read(4, &[0xFF, 0xFE]).unwrap_err();
    }

    #[test]
    fn concurrent_factory_shares_one_cache() {
        let factory = concurrent_reader(8);
        let first = factory().read(8, b"shared").unwrap();
        let second = factory().read(8, b"shared").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn concurrent_cache_rereads_changed_bytes() {
        let factory = concurrent_reader(8);
        assert_eq!(&*factory().read(8, b"alpha").unwrap(), "alpha");
        assert_eq!(&*factory().read(8, b"bravo").unwrap(), "bravo");
        assert_eq!(&*factory().read(8, b"alpha").unwrap(), "alpha");
    }
}
