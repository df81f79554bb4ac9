//! Append-only table of named objects stored in the segment.
//!
//! Entries are never removed. An entry is filled in and then published with a
//! release store on its state word, after which the shared length is bumped;
//! readers pair these with acquire loads, so a visible entry is always complete.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const MAX_KEY_LENGTH: usize = 31;

const NAME_WORDS: usize = 4;

const EMPTY: u32 = 0;
const READY: u32 = 1;

#[repr(C)]
#[derive(Debug)]
pub struct DirEntry {
    state: AtomicU32,
    name_len: AtomicU32,
    type_tag: AtomicU64,
    offset: AtomicU64,
    name: [AtomicU64; NAME_WORDS],
    _reserved: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub type_tag: u64,
    pub offset: u64,
}

impl DirEntry {
    fn load(&self) -> Option<EntryInfo> {
        if self.state.load(Ordering::Acquire) != READY {
            return None;
        }
        let len = (self.name_len.load(Ordering::Relaxed) as usize).min(MAX_KEY_LENGTH);
        let mut bytes = [0u8; NAME_WORDS * 8];
        for (i, word) in self.name.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        Some(EntryInfo {
            name: String::from_utf8_lossy(&bytes[..len]).into_owned(),
            type_tag: self.type_tag.load(Ordering::Relaxed),
            offset: self.offset.load(Ordering::Relaxed),
        })
    }

    fn store(&self, name: &str, type_tag: u64, offset: u64) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), EMPTY);
        let mut bytes = [0u8; NAME_WORDS * 8];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        for (i, word) in self.name.iter().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            word.store(u64::from_le_bytes(chunk), Ordering::Relaxed);
        }
        self.name_len.store(name.len() as u32, Ordering::Relaxed);
        self.type_tag.store(type_tag, Ordering::Relaxed);
        self.offset.store(offset, Ordering::Relaxed);
        self.state.store(READY, Ordering::Release);
    }
}

/// View over the directory region of a mapped segment.
pub struct Directory<'a> {
    entries: &'a [DirEntry],
    len: &'a AtomicU64,
}

impl<'a> Directory<'a> {
    pub(crate) fn new(entries: &'a [DirEntry], len: &'a AtomicU64) -> Self {
        Self { entries, len }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of published entries.
    pub fn len(&self) -> usize {
        (self.len.load(Ordering::Acquire) as usize).min(self.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<EntryInfo> {
        if index >= self.len() {
            return None;
        }
        self.entries[index].load()
    }

    /// Appends an entry. Callers serialize appends; returns `None` when full.
    pub(crate) fn append(&self, name: &str, type_tag: u64, offset: u64) -> Option<usize> {
        let index = self.len.load(Ordering::Acquire) as usize;
        if index >= self.entries.len() {
            return None;
        }
        self.entries[index].store(name, type_tag, offset);
        self.len.store(index as u64 + 1, Ordering::Release);
        Some(index)
    }
}

/// Process-local name index over the shared directory.
///
/// Built lazily: lookups that miss pull in any entries published since the
/// last refresh. Since entries are immutable once published, cached
/// positions never go stale.
#[derive(Debug, Default)]
pub struct DirectoryIndex {
    by_name: HashMap<String, (u64, u64)>,
    scanned: usize,
}

impl DirectoryIndex {
    pub fn get(&self, name: &str) -> Option<(u64, u64)> {
        self.by_name.get(name).copied()
    }

    pub fn is_current(&self, directory: &Directory<'_>) -> bool {
        self.scanned >= directory.len()
    }

    pub fn refresh(&mut self, directory: &Directory<'_>) {
        let len = directory.len();
        while self.scanned < len {
            match directory.get(self.scanned) {
                Some(info) => {
                    self.by_name.insert(info.name, (info.type_tag, info.offset));
                    self.scanned += 1;
                }
                // Length is bumped after the entry is ready, so this only
                // happens on a corrupt directory; stop and retry later.
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: usize) -> Vec<DirEntry> {
        (0..n)
            .map(|_| DirEntry {
                state: AtomicU32::new(0),
                name_len: AtomicU32::new(0),
                type_tag: AtomicU64::new(0),
                offset: AtomicU64::new(0),
                name: Default::default(),
                _reserved: AtomicU64::new(0),
            })
            .collect()
    }

    #[test]
    fn test_entry_size_is_stable() {
        assert_eq!(std::mem::size_of::<DirEntry>(), 64);
    }

    #[test]
    fn test_append_and_get() {
        let slots = entries(2);
        let len = AtomicU64::new(0);
        let dir = Directory::new(&slots, &len);

        assert!(dir.is_empty());
        assert_eq!(dir.append("alpha", 7, 4096), Some(0));
        assert_eq!(dir.append(&"z".repeat(31), 8, 8192), Some(1));
        assert_eq!(dir.append("gamma", 9, 0), None);

        let first = dir.get(0).unwrap();
        assert_eq!(first.name, "alpha");
        assert_eq!(first.type_tag, 7);
        assert_eq!(first.offset, 4096);
        assert_eq!(dir.get(1).unwrap().name, "z".repeat(31));
        assert!(dir.get(2).is_none());
    }

    #[test]
    fn test_index_refresh_is_incremental() {
        let slots = entries(4);
        let len = AtomicU64::new(0);
        let dir = Directory::new(&slots, &len);
        let mut index = DirectoryIndex::default();

        dir.append("a", 1, 100);
        assert!(!index.is_current(&dir));
        index.refresh(&dir);
        assert!(index.is_current(&dir));
        assert_eq!(index.get("a"), Some((1, 100)));
        assert_eq!(index.get("b"), None);

        dir.append("b", 2, 200);
        assert!(!index.is_current(&dir));
        index.refresh(&dir);
        assert_eq!(index.get("b"), Some((2, 200)));
    }
}
