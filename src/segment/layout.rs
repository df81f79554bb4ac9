//! Fixed placement of every region inside the segment.
//!
//! ```text
//! 0          header (encoded, HEADER_SIZE bytes)
//! 256        control block
//!            reader tokens        [ReaderToken; reader_capacity]
//!            reader free bitmap   [u64; ceil(reader_capacity / 64)]
//!            writer tokens        [WriterToken; WRITER_LIMIT]
//!            writer free bitmap   [u64; 1]
//!            directory            [DirEntry; directory_capacity]
//! heap       ring buffers, bump allocated
//! ```
//!
//! All positions are offsets from the segment base so every process can map
//! the file at a different address.

use std::mem::size_of;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::directory::DirEntry;
use crate::pool::{FreeList, ReaderToken, WriterToken, WRITER_LIMIT};

pub const CONTROL_OFFSET: usize = 256;

pub const REGION_ALIGN: usize = 64;

pub fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Shared counters and the persisted layout parameters.
#[repr(C)]
#[derive(Debug)]
pub struct ControlBlock {
    pub segment_size: AtomicU64,
    pub reader_capacity: AtomicU64,
    pub directory_capacity: AtomicU64,
    pub heap_offset: AtomicU64,
    pub alloc_cursor: AtomicU64,
    pub global_revision: AtomicU64,
    pub directory_len: AtomicU64,
    pub registered_len: AtomicU64,
    pub global_oldest_read: AtomicU64,
    pub global_oldest_read_timestamp: AtomicI64,
    // Reader token id of the live owner plus one; 0 when no owner holds one
    pub owner_reader_token: AtomicU64,
}

impl ControlBlock {
    /// Reserves the next revision. Revisions start at 1; 0 means "none".
    pub fn next_revision(&self) -> u64 {
        self.global_revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn owner_reader_token(&self) -> Option<usize> {
        match self.owner_reader_token.load(Ordering::Acquire) {
            0 => None,
            id => Some(id as usize - 1),
        }
    }

    pub fn set_owner_reader_token(&self, id: Option<usize>) {
        let value = id.map_or(0, |id| id as u64 + 1);
        self.owner_reader_token.store(value, Ordering::Release);
    }

    pub fn latest_revision(&self) -> Option<u64> {
        match self.global_revision.load(Ordering::Acquire) {
            0 => None,
            revision => Some(revision),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub reader_capacity: usize,
    pub directory_capacity: usize,
    pub reader_tokens: usize,
    pub reader_bitmap: usize,
    pub writer_tokens: usize,
    pub writer_bitmap: usize,
    pub directory: usize,
    pub heap: usize,
}

impl Layout {
    pub fn new(reader_capacity: usize, directory_capacity: usize) -> Self {
        let reader_tokens = align_up(CONTROL_OFFSET + size_of::<ControlBlock>(), REGION_ALIGN);
        let reader_bitmap = reader_tokens + reader_capacity * size_of::<ReaderToken>();
        let writer_tokens = align_up(
            reader_bitmap + FreeList::words_for(reader_capacity) * size_of::<u64>(),
            REGION_ALIGN,
        );
        let writer_bitmap = writer_tokens + WRITER_LIMIT * size_of::<WriterToken>();
        let directory = align_up(
            writer_bitmap + FreeList::words_for(WRITER_LIMIT) * size_of::<u64>(),
            REGION_ALIGN,
        );
        let heap = align_up(
            directory + directory_capacity * size_of::<DirEntry>(),
            REGION_ALIGN,
        );

        Layout {
            reader_capacity,
            directory_capacity,
            reader_tokens,
            reader_bitmap,
            writer_tokens,
            writer_bitmap,
            directory,
            heap,
        }
    }

    /// Smallest segment that holds the fixed regions.
    pub fn min_size(&self) -> usize {
        self.heap
    }
}
