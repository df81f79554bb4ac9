//! Bounded, newest-first version history of one key, shared between processes.
//!
//! The buffer lives in the segment as a small header followed by a slot array.
//! Every slot holds `[revision: u64][timestamp: i64 micros][value bytes]`, so the
//! revision of any slot can be read without knowing the value type. The
//! garbage collector relies on that through [`RawRingBuffer`].
//!
//! One [`SharableMutex`] guards each buffer: queries take it shared, mutations
//! take it exclusive, and nothing locks across keys. A writer releases the lock
//! only after a record is completely copied in, so readers never see a torn
//! record.
//!
//! Records are copied out on read. A record obtained before later writes keeps
//! its value no matter how the buffer moves on.

use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytemuck::Pod;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::hasher::type_tag;
use crate::record::Versioned;
use crate::segment::layout::align_up;
use crate::segment::{NamedObject, Segment};
use crate::sync::SharableMutex;

const RECORD_PREFIX: usize = 16;

#[repr(C)]
#[derive(Debug)]
pub struct RingHeader {
    lock: SharableMutex,
    head: AtomicU32,
    len: AtomicU32,
    capacity: AtomicU32,
    slot_size: AtomicU64,
    slots_offset: AtomicU64,
}

const HEADER_BYTES: usize = size_of::<RingHeader>();

/// Size of one slot for a value type.
pub fn slot_size<V>() -> usize {
    RECORD_PREFIX + align_up(size_of::<V>(), 8)
}

/// Snapshot of the cursor fields, read under the lock.
#[derive(Clone, Copy)]
struct Cursor {
    head: usize,
    len: usize,
    capacity: usize,
    slot_size: usize,
    slots_offset: u64,
}

impl Cursor {
    fn back(&self) -> usize {
        (self.head + self.len - 1) % self.capacity
    }

    fn nth(&self, i: usize) -> usize {
        (self.head + i) % self.capacity
    }
}

/// Type-erased view of a ring buffer; sees revisions and timestamps only.
#[derive(Clone, Copy)]
pub struct RawRingBuffer<'a> {
    segment: &'a Segment,
    header: &'a RingHeader,
}

impl<'a> RawRingBuffer<'a> {
    /// Attaches to the buffer at `offset`, checking that it fits the heap.
    pub fn attach(segment: &'a Segment, offset: u64) -> Result<Self> {
        segment.check_range(offset, HEADER_BYTES, "ring buffer")?;
        let header = unsafe { segment.object::<RingHeader>(offset) };
        let ring = RawRingBuffer { segment, header };

        let cursor = {
            let _guard = header.lock.read();
            ring.cursor()
        };
        if cursor.capacity == 0 || cursor.slot_size < RECORD_PREFIX || cursor.len > cursor.capacity {
            return Err(Error::malformed(
                segment.path(),
                "ring buffer",
                format!(
                    "bad geometry: capacity {} length {} slot size {}",
                    cursor.capacity, cursor.len, cursor.slot_size
                ),
            ));
        }
        segment.check_range(
            cursor.slots_offset,
            cursor.capacity * cursor.slot_size,
            "ring buffer slots",
        )?;
        Ok(ring)
    }

    fn cursor(&self) -> Cursor {
        Cursor {
            head: self.header.head.load(Ordering::Relaxed) as usize,
            len: self.header.len.load(Ordering::Relaxed) as usize,
            capacity: self.header.capacity.load(Ordering::Relaxed) as usize,
            slot_size: self.header.slot_size.load(Ordering::Relaxed) as usize,
            slots_offset: self.header.slots_offset.load(Ordering::Relaxed),
        }
    }

    fn slot(&self, cursor: &Cursor, index: usize) -> *mut u8 {
        debug_assert!(index < cursor.capacity);
        self.segment
            .ptr(cursor.slots_offset as usize + index * cursor.slot_size)
    }

    fn slot_revision(&self, cursor: &Cursor, index: usize) -> u64 {
        unsafe { std::ptr::read_unaligned(self.slot(cursor, index) as *const u64) }
    }

    fn slot_timestamp(&self, cursor: &Cursor, index: usize) -> DateTime<Utc> {
        let micros =
            unsafe { std::ptr::read_unaligned(self.slot(cursor, index).add(8) as *const i64) };
        DateTime::from_timestamp_micros(micros).unwrap_or_default()
    }

    fn slot_bytes(&self, cursor: &Cursor, index: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.slot(cursor, index), cursor.slot_size) }
    }

    pub fn capacity(&self) -> usize {
        let _guard = self.header.lock.read();
        self.cursor().capacity
    }

    pub fn element_count(&self) -> usize {
        let _guard = self.header.lock.read();
        self.cursor().len
    }

    pub fn empty(&self) -> bool {
        self.element_count() == 0
    }

    pub fn full(&self) -> bool {
        let _guard = self.header.lock.read();
        let cursor = self.cursor();
        cursor.len == cursor.capacity
    }

    pub fn front_revision(&self) -> Result<u64> {
        let _guard = self.header.lock.read();
        let cursor = self.cursor();
        if cursor.len == 0 {
            return Err(Error::EmptyBuffer);
        }
        Ok(self.slot_revision(&cursor, cursor.head))
    }

    pub fn back_revision(&self) -> Result<u64> {
        let _guard = self.header.lock.read();
        let cursor = self.cursor();
        if cursor.len == 0 {
            return Err(Error::EmptyBuffer);
        }
        Ok(self.slot_revision(&cursor, cursor.back()))
    }

    /// Revisions and timestamps, newest first.
    pub fn revisions(&self) -> Vec<(u64, DateTime<Utc>)> {
        let _guard = self.header.lock.read();
        let cursor = self.cursor();
        (0..cursor.len)
            .map(|i| {
                let index = cursor.nth(i);
                (
                    self.slot_revision(&cursor, index),
                    self.slot_timestamp(&cursor, index),
                )
            })
            .collect()
    }

    /// Removes the oldest record if its revision is still `expected`.
    pub fn pop_back_revision(&self, expected: u64) -> bool {
        let _guard = self.header.lock.write();
        let cursor = self.cursor();
        if cursor.len == 0 || self.slot_revision(&cursor, cursor.back()) != expected {
            return false;
        }
        self.header
            .len
            .store((cursor.len - 1) as u32, Ordering::Relaxed);
        true
    }

    /// Drops every record; returns how many were removed.
    pub fn clear(&self) -> usize {
        let _guard = self.header.lock.write();
        let len = self.header.len.swap(0, Ordering::Relaxed);
        len as usize
    }

    /// Raises the capacity, moving the slots to a fresh heap allocation.
    /// Shrinking is not supported; a smaller or equal capacity is a no-op.
    pub fn grow(&self, new_capacity: usize) -> Result<()> {
        if new_capacity > u32::MAX as usize {
            return Err(Error::exhausted(self.segment.path(), "ring buffer capacity"));
        }

        let _guard = self.header.lock.write();
        let cursor = self.cursor();
        if new_capacity <= cursor.capacity {
            return Ok(());
        }

        let new_offset = self.segment.allocate(new_capacity * cursor.slot_size, 8)?;
        for i in 0..cursor.len {
            let src = self.slot(&cursor, cursor.nth(i));
            let dst = self.segment.ptr(new_offset as usize + i * cursor.slot_size);
            unsafe { std::ptr::copy_nonoverlapping(src, dst, cursor.slot_size) };
        }

        self.header.slots_offset.store(new_offset, Ordering::Relaxed);
        self.header
            .capacity
            .store(new_capacity as u32, Ordering::Relaxed);
        self.header.head.store(0, Ordering::Relaxed);

        tracing::debug!(
            from = cursor.capacity,
            to = new_capacity,
            elements = cursor.len,
            "Grew ring buffer"
        );
        Ok(())
    }
}

/// Typed ring buffer of [`Versioned`] records.
pub struct MultiReaderRingBuffer<'a, V> {
    raw: RawRingBuffer<'a>,
    _marker: PhantomData<V>,
}

impl<'a, V: Pod> MultiReaderRingBuffer<'a, V> {
    fn encode(record: &Versioned<V>, slot_size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; slot_size];
        buf[..8].copy_from_slice(&record.revision.to_ne_bytes());
        buf[8..16].copy_from_slice(&record.timestamp.timestamp_micros().to_ne_bytes());
        let value = bytemuck::bytes_of(&record.value);
        buf[RECORD_PREFIX..RECORD_PREFIX + value.len()].copy_from_slice(value);
        buf
    }

    fn decode(&self, cursor: &Cursor, index: usize) -> Versioned<V> {
        let bytes = self.raw.slot_bytes(cursor, index);
        let value: V =
            bytemuck::pod_read_unaligned(&bytes[RECORD_PREFIX..RECORD_PREFIX + size_of::<V>()]);
        Versioned {
            value,
            revision: self.raw.slot_revision(cursor, index),
            timestamp: self.raw.slot_timestamp(cursor, index),
        }
    }

    pub fn raw(&self) -> RawRingBuffer<'a> {
        self.raw
    }

    /// Inserts the newest record, overwriting the oldest when full.
    pub fn push_front(&self, record: &Versioned<V>) {
        let _guard = self.raw.header.lock.write();
        let cursor = self.raw.cursor();
        let encoded = Self::encode(record, cursor.slot_size);

        let head = (cursor.head + cursor.capacity - 1) % cursor.capacity;
        let slot = self.raw.slot(&cursor, head);
        unsafe { std::ptr::copy_nonoverlapping(encoded.as_ptr(), slot, encoded.len()) };

        self.raw.header.head.store(head as u32, Ordering::Relaxed);
        if cursor.len < cursor.capacity {
            self.raw
                .header
                .len
                .store((cursor.len + 1) as u32, Ordering::Relaxed);
        }
    }

    /// Newest record.
    pub fn front(&self) -> Result<Versioned<V>> {
        let _guard = self.raw.header.lock.read();
        let cursor = self.raw.cursor();
        if cursor.len == 0 {
            return Err(Error::EmptyBuffer);
        }
        Ok(self.decode(&cursor, cursor.head))
    }

    /// Oldest record.
    pub fn back(&self) -> Result<Versioned<V>> {
        let _guard = self.raw.header.lock.read();
        let cursor = self.raw.cursor();
        if cursor.len == 0 {
            return Err(Error::EmptyBuffer);
        }
        Ok(self.decode(&cursor, cursor.back()))
    }

    /// Removes the oldest record only if it is still `expected`, so a caller
    /// working from a stale view cannot drop a different record.
    pub fn pop_back(&self, expected: &Versioned<V>) -> bool {
        let _guard = self.raw.header.lock.write();
        let cursor = self.raw.cursor();
        if cursor.len == 0 {
            return false;
        }
        let encoded = Self::encode(expected, cursor.slot_size);
        if self.raw.slot_bytes(&cursor, cursor.back()) != encoded.as_slice() {
            return false;
        }
        self.raw
            .header
            .len
            .store((cursor.len - 1) as u32, Ordering::Relaxed);
        true
    }

    /// All records, newest first.
    pub fn history(&self) -> Vec<Versioned<V>> {
        let _guard = self.raw.header.lock.read();
        let cursor = self.raw.cursor();
        (0..cursor.len)
            .map(|i| self.decode(&cursor, cursor.nth(i)))
            .collect()
    }

    pub fn grow(&self, new_capacity: usize) -> Result<()> {
        self.raw.grow(new_capacity)
    }

    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    pub fn element_count(&self) -> usize {
        self.raw.element_count()
    }

    pub fn empty(&self) -> bool {
        self.raw.empty()
    }

    pub fn full(&self) -> bool {
        self.raw.full()
    }
}

impl<'a, V: Pod> NamedObject<'a> for MultiReaderRingBuffer<'a, V> {
    type Params = usize;

    fn type_tag() -> u64 {
        type_tag::<V>("multi_reader_ring_buffer")
    }

    fn size_for(capacity: &usize) -> usize {
        align_up(HEADER_BYTES, 8) + capacity * slot_size::<V>()
    }

    fn init(segment: &'a Segment, offset: u64, capacity: &usize) -> Result<()> {
        if *capacity == 0 || *capacity > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "history depth {} out of range",
                capacity
            )));
        }
        let header = unsafe { segment.object::<RingHeader>(offset) };
        header.head.store(0, Ordering::Relaxed);
        header.len.store(0, Ordering::Relaxed);
        header.capacity.store(*capacity as u32, Ordering::Relaxed);
        header
            .slot_size
            .store(slot_size::<V>() as u64, Ordering::Relaxed);
        header.slots_offset.store(
            offset + align_up(HEADER_BYTES, 8) as u64,
            Ordering::Release,
        );
        Ok(())
    }

    fn attach(segment: &'a Segment, offset: u64) -> Result<Self> {
        let raw = RawRingBuffer::attach(segment, offset)?;
        let stored = raw.header.slot_size.load(Ordering::Relaxed) as usize;
        if stored != slot_size::<V>() {
            return Err(Error::malformed(
                segment.path(),
                "ring buffer",
                format!("slot size {} expected {}", stored, slot_size::<V>()),
            ));
        }
        Ok(MultiReaderRingBuffer {
            raw,
            _marker: PhantomData,
        })
    }
}
