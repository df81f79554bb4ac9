//! Reader and writer token pools, claimed from lock-free bitmaps.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};

pub type ReaderTokenId = u16;
pub type WriterTokenId = u16;

/// Largest reader pool, a few ids short of the full `u16` range.
pub const READER_LIMIT: usize = (1 << 16) - 4;
pub const WRITER_LIMIT: usize = 1;

const NO_REVISION: u64 = 0;
const NO_TIMESTAMP: i64 = i64::MIN;

fn load_revision(cell: &AtomicU64) -> Option<u64> {
    match cell.load(Ordering::Acquire) {
        NO_REVISION => None,
        revision => Some(revision),
    }
}

fn load_timestamp(cell: &AtomicI64) -> Option<DateTime<Utc>> {
    match cell.load(Ordering::Acquire) {
        NO_TIMESTAMP => None,
        micros => DateTime::from_timestamp_micros(micros),
    }
}

fn store_timestamp(cell: &AtomicI64, timestamp: Option<DateTime<Utc>>) {
    let micros = timestamp.map_or(NO_TIMESTAMP, |ts| ts.timestamp_micros());
    cell.store(micros, Ordering::Release);
}

/// Per-reader slot. The `last_read_*` fields belong to the reader holding the
/// token; the `processed_*` fields are the owner's snapshot of them.
#[repr(C)]
#[derive(Debug)]
pub struct ReaderToken {
    last_read_revision: AtomicU64,
    last_read_timestamp: AtomicI64,
    processed_revision: AtomicU64,
    processed_timestamp: AtomicI64,
}

impl ReaderToken {
    pub fn last_read_revision(&self) -> Option<u64> {
        load_revision(&self.last_read_revision)
    }

    pub fn last_read_timestamp(&self) -> Option<DateTime<Utc>> {
        load_timestamp(&self.last_read_timestamp)
    }

    pub fn record_read(&self, revision: u64, timestamp: DateTime<Utc>) {
        store_timestamp(&self.last_read_timestamp, Some(timestamp));
        self.last_read_revision.store(revision, Ordering::Release);
    }

    pub fn processed_revision(&self) -> Option<u64> {
        load_revision(&self.processed_revision)
    }

    pub fn processed_timestamp(&self) -> Option<DateTime<Utc>> {
        load_timestamp(&self.processed_timestamp)
    }

    pub(crate) fn set_processed(&self, revision: Option<u64>, timestamp: Option<DateTime<Utc>>) {
        store_timestamp(&self.processed_timestamp, timestamp);
        self.processed_revision
            .store(revision.unwrap_or(NO_REVISION), Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.last_read_revision.store(NO_REVISION, Ordering::Release);
        store_timestamp(&self.last_read_timestamp, None);
    }

    pub(crate) fn init(&self) {
        self.clear();
        self.set_processed(None, None);
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct WriterToken {
    last_write_revision: AtomicU64,
    last_write_timestamp: AtomicI64,
    last_flushed_revision: AtomicU64,
    last_flush_timestamp: AtomicI64,
}

impl WriterToken {
    pub fn last_write_revision(&self) -> Option<u64> {
        load_revision(&self.last_write_revision)
    }

    pub fn last_write_timestamp(&self) -> Option<DateTime<Utc>> {
        load_timestamp(&self.last_write_timestamp)
    }

    pub fn last_flushed_revision(&self) -> Option<u64> {
        load_revision(&self.last_flushed_revision)
    }

    pub fn last_flush_timestamp(&self) -> Option<DateTime<Utc>> {
        load_timestamp(&self.last_flush_timestamp)
    }

    pub fn record_write(&self, revision: u64, timestamp: DateTime<Utc>) {
        store_timestamp(&self.last_write_timestamp, Some(timestamp));
        self.last_write_revision.store(revision, Ordering::Release);
    }

    pub fn record_flush(&self, revision: Option<u64>, timestamp: DateTime<Utc>) {
        store_timestamp(&self.last_flush_timestamp, Some(timestamp));
        self.last_flushed_revision
            .store(revision.unwrap_or(NO_REVISION), Ordering::Release);
    }

    pub(crate) fn init(&self) {
        self.last_write_revision.store(NO_REVISION, Ordering::Release);
        store_timestamp(&self.last_write_timestamp, None);
        self.last_flushed_revision
            .store(NO_REVISION, Ordering::Release);
        store_timestamp(&self.last_flush_timestamp, None);
    }
}

/// Lock-free free list of token ids backed by an atomic bitmap.
pub struct FreeList<'a> {
    words: &'a [AtomicU64],
    capacity: usize,
}

impl<'a> FreeList<'a> {
    pub fn words_for(capacity: usize) -> usize {
        capacity.div_ceil(64)
    }

    pub(crate) fn new(words: &'a [AtomicU64], capacity: usize) -> Self {
        debug_assert!(words.len() >= Self::words_for(capacity));
        Self { words, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claims the lowest free id, or `None` when every id is live.
    pub fn acquire(&self) -> Option<usize> {
        for (w, word) in self.words.iter().enumerate() {
            let valid = self.valid_mask(w);
            let mut current = word.load(Ordering::Relaxed);
            loop {
                let free = !current & valid;
                if free == 0 {
                    break;
                }
                let bit = free.trailing_zeros() as usize;
                match word.compare_exchange_weak(
                    current,
                    current | (1 << bit),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(w * 64 + bit),
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    /// Returns an id to the pool. Returns false if it was not live.
    pub fn release(&self, id: usize) -> bool {
        if id >= self.capacity {
            return false;
        }
        let mask = 1u64 << (id % 64);
        self.words[id / 64].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    pub fn is_allocated(&self, id: usize) -> bool {
        if id >= self.capacity {
            return false;
        }
        self.words[id / 64].load(Ordering::Acquire) & (1u64 << (id % 64)) != 0
    }

    pub fn allocated_count(&self) -> usize {
        self.words
            .iter()
            .enumerate()
            .map(|(w, word)| (word.load(Ordering::Acquire) & self.valid_mask(w)).count_ones() as usize)
            .sum()
    }

    pub fn free_count(&self) -> usize {
        self.capacity - self.allocated_count()
    }

    /// Marks every id free. Only safe when no handle can be live.
    pub(crate) fn reset(&self) {
        for word in self.words {
            word.store(0, Ordering::Release);
        }
    }

    fn valid_mask(&self, word: usize) -> u64 {
        let start = word * 64;
        if start >= self.capacity {
            0
        } else if self.capacity - start >= 64 {
            u64::MAX
        } else {
            (1u64 << (self.capacity - start)) - 1
        }
    }
}

/// View over the token arrays and their free lists.
pub struct ResourcePool<'a> {
    pub reader_tokens: &'a [ReaderToken],
    pub writer_tokens: &'a [WriterToken],
    pub reader_free_list: FreeList<'a>,
    pub writer_free_list: FreeList<'a>,
}

impl<'a> ResourcePool<'a> {
    pub(crate) fn init(&self) {
        for token in self.reader_tokens {
            token.init();
        }
        for token in self.writer_tokens {
            token.init();
        }
        self.reader_free_list.reset();
        self.writer_free_list.reset();
    }

    pub fn reader_token(&self, id: ReaderTokenId) -> Option<&'a ReaderToken> {
        self.reader_tokens.get(id as usize)
    }

    pub fn writer_token(&self, id: WriterTokenId) -> Option<&'a WriterToken> {
        self.writer_tokens.get(id as usize)
    }
}
