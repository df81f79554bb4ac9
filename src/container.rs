use std::sync::Arc;

use bytemuck::Pod;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::pool::{ReaderToken, WriterToken};
use crate::record::Versioned;
use crate::ring_buffer::MultiReaderRingBuffer;
use crate::segment::Segment;

/// Typed key-value operations. Every key is a [`MultiReaderRingBuffer`] named
/// after it.
#[derive(Debug)]
pub struct Container {
    segment: Arc<Segment>,
    // Held from revision allocation until the record is published
    writing: Mutex<()>,
}

impl Container {
    pub fn new(segment: Arc<Segment>) -> Self {
        Self {
            segment,
            writing: Mutex::new(()),
        }
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Buffer for `key`, if it was ever written.
    pub fn history<V: Pod>(&self, key: &str) -> Result<Option<MultiReaderRingBuffer<'_, V>>> {
        self.segment.find::<MultiReaderRingBuffer<V>>(key)
    }

    fn existing<V: Pod>(&self, key: &str) -> Result<MultiReaderRingBuffer<'_, V>> {
        self.history::<V>(key)?
            .ok_or_else(|| Error::key_not_found(self.segment.path(), key))
    }

    /// True if `key` holds at least one record.
    pub fn exists<V: Pod>(&self, key: &str) -> Result<bool> {
        Ok(self
            .history::<V>(key)?
            .map_or(false, |ring| !ring.empty()))
    }

    /// Newest record of `key`, recorded against the reader's token.
    pub fn read_versioned<V: Pod>(&self, token: &ReaderToken, key: &str) -> Result<Versioned<V>> {
        let record = match self.existing::<V>(key)?.front() {
            Ok(record) => record,
            Err(Error::EmptyBuffer) => return Err(Error::key_not_found(self.segment.path(), key)),
            Err(e) => return Err(e),
        };
        token.record_read(record.revision, record.timestamp);
        Ok(record)
    }

    pub fn read<V: Pod>(&self, token: &ReaderToken, key: &str) -> Result<V> {
        self.read_versioned::<V>(token, key).map(|record| record.value)
    }

    /// Appends a new version of `key` and returns its revision. The buffer is
    /// created with `history_depth` slots on first write.
    pub fn write<V: Pod>(
        &self,
        token: &WriterToken,
        key: &str,
        value: V,
        history_depth: usize,
    ) -> Result<u64> {
        let ring = self
            .segment
            .find_or_create::<MultiReaderRingBuffer<V>>(key, &history_depth)?;

        let _writing = self.writing.lock();
        let revision = self.segment.control().next_revision();
        let timestamp = Utc::now();
        ring.push_front(&Versioned::new(value, revision, timestamp));
        token.record_write(revision, timestamp);
        Ok(revision)
    }

    pub fn oldest_revision<V: Pod>(&self, key: &str) -> Result<u64> {
        self.existing::<V>(key)?
            .raw()
            .back_revision()
            .map_err(|_| Error::key_not_found(self.segment.path(), key))
    }

    pub fn newest_revision<V: Pod>(&self, key: &str) -> Result<u64> {
        self.existing::<V>(key)?
            .raw()
            .front_revision()
            .map_err(|_| Error::key_not_found(self.segment.path(), key))
    }

    /// Number of records currently retained for `key`.
    pub fn history_depth<V: Pod>(&self, key: &str) -> Result<usize> {
        Ok(self.existing::<V>(key)?.element_count())
    }

    /// Pops every record of `key` regardless of the read watermark and
    /// returns how many were removed.
    pub fn remove<V: Pod>(&self, key: &str) -> Result<usize> {
        let ring = self.existing::<V>(key)?;
        let _writing = self.writing.lock();
        let mut removed = 0;
        loop {
            let oldest = match ring.back() {
                Ok(record) => record,
                Err(Error::EmptyBuffer) => break,
                Err(e) => return Err(e),
            };
            if ring.pop_back(&oldest) {
                removed += 1;
            }
        }
        tracing::debug!(key, removed, "Removed key history");
        Ok(removed)
    }

    /// Writes the mapping back and records the flush on the writer token.
    pub fn flush(&self, token: &WriterToken) -> Result<()> {
        let revision = self.segment.control().latest_revision();
        self.segment.flush()?;
        token.record_flush(revision, Utc::now());
        tracing::info!(
            path = %self.segment.path().display(),
            revision = revision.unwrap_or(0),
            "Flushed segment"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MvccConfig;
    use crate::flock::FileLock;
    use crate::handle::{ReaderHandle, WriterHandle};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        _lock: FileLock,
        container: Container,
        reader: ReaderHandle,
        writer: WriterHandle,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let config = MvccConfig::new(dir.path().join("container.db"))
            .size(1 << 20)
            .reader_limit(4)
            .directory_capacity(16);
        let lock = FileLock::acquire(&config.path).unwrap();
        let segment = Arc::new(Segment::create_or_open(&config, &lock).unwrap());
        Fixture {
            _dir: dir,
            _lock: lock,
            container: Container::new(Arc::clone(&segment)),
            reader: ReaderHandle::acquire(Arc::clone(&segment)).unwrap(),
            writer: WriterHandle::acquire(segment).unwrap(),
        }
    }

    #[test]
    fn test_write_then_read() {
        let f = fixture();
        let rev = f.container.write(f.writer.token(), "k", 7u64, 8).unwrap();
        assert_eq!(rev, 1);
        assert_eq!(f.writer.token().last_write_revision(), Some(1));

        assert!(f.container.exists::<u64>("k").unwrap());
        assert_eq!(f.container.read::<u64>(f.reader.token(), "k").unwrap(), 7);
        assert_eq!(f.reader.token().last_read_revision(), Some(1));
    }

    #[test]
    fn test_revisions_increase_across_keys() {
        let f = fixture();
        let a = f.container.write(f.writer.token(), "a", 1u32, 8).unwrap();
        let b = f.container.write(f.writer.token(), "b", 2u32, 8).unwrap();
        let c = f.container.write(f.writer.token(), "a", 3u32, 8).unwrap();
        assert!(a < b && b < c);

        let record = f.container.read_versioned::<u32>(f.reader.token(), "a").unwrap();
        assert_eq!(record.value, 3);
        assert_eq!(record.revision, c);
    }

    #[test]
    fn test_missing_key() {
        let f = fixture();
        assert!(!f.container.exists::<u64>("absent").unwrap());
        assert!(f
            .container
            .read::<u64>(f.reader.token(), "absent")
            .unwrap_err()
            .is_key_not_found());
        assert!(f.container.remove::<u64>("absent").unwrap_err().is_key_not_found());
        assert_eq!(f.reader.token().last_read_revision(), None);
    }

    #[test]
    fn test_remove_empties_history() {
        let f = fixture();
        for v in 0..5u64 {
            f.container.write(f.writer.token(), "gone", v, 8).unwrap();
        }
        assert_eq!(f.container.remove::<u64>("gone").unwrap(), 5);
        assert!(!f.container.exists::<u64>("gone").unwrap());
        assert!(f
            .container
            .read::<u64>(f.reader.token(), "gone")
            .unwrap_err()
            .is_key_not_found());
        assert_eq!(f.container.remove::<u64>("gone").unwrap(), 0);

        f.container.write(f.writer.token(), "gone", 9u64, 8).unwrap();
        assert_eq!(f.container.read::<u64>(f.reader.token(), "gone").unwrap(), 9);
    }

    #[test]
    fn test_wrong_type_is_malformed() {
        let f = fixture();
        f.container.write(f.writer.token(), "typed", 1u64, 8).unwrap();
        assert!(f
            .container
            .read::<[u8; 64]>(f.reader.token(), "typed")
            .unwrap_err()
            .is_malformed());
    }

    #[test]
    fn test_invalid_key() {
        let f = fixture();
        let long = "x".repeat(32);
        assert!(matches!(
            f.container.write(f.writer.token(), &long, 1u64, 8),
            Err(Error::InvalidKey { .. })
        ));
        assert!(matches!(
            f.container.exists::<u64>(""),
            Err(Error::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_flush_records_revision() {
        let f = fixture();
        f.container.flush(f.writer.token()).unwrap();
        assert_eq!(f.writer.token().last_flushed_revision(), None);
        assert!(f.writer.token().last_flush_timestamp().is_some());

        f.container.write(f.writer.token(), "k", 1u64, 8).unwrap();
        f.container.write(f.writer.token(), "k", 2u64, 8).unwrap();
        f.container.flush(f.writer.token()).unwrap();
        assert_eq!(f.writer.token().last_flushed_revision(), Some(2));
    }

    #[test]
    fn test_concurrent_writes_stay_newest_first() {
        let f = fixture();
        std::thread::scope(|scope| {
            for t in 0..4u64 {
                let f = &f;
                scope.spawn(move || {
                    for i in 0..200u64 {
                        f.container.write(f.writer.token(), "shared", t * 1000 + i, 16).unwrap();
                    }
                });
            }
        });

        let revisions: Vec<u64> = f
            .container
            .history::<u64>("shared")
            .unwrap()
            .unwrap()
            .history()
            .iter()
            .map(|r| r.revision)
            .collect();
        assert_eq!(revisions.len(), 16);
        assert!(revisions.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(revisions[0], 800);
        assert_eq!(f.writer.token().last_write_revision(), Some(800));
        let newest = f.container.read_versioned::<u64>(f.reader.token(), "shared").unwrap();
        assert_eq!(newest.revision, 800);
    }

    #[test]
    fn test_segment_out_of_space() {
        let dir = tempdir().unwrap();
        let config = MvccConfig::new(dir.path().join("small.db"))
            .size(64 << 10)
            .reader_limit(4)
            .directory_capacity(64);
        let lock = FileLock::acquire(&config.path).unwrap();
        let segment = Arc::new(Segment::create_or_open(&config, &lock).unwrap());
        let container = Container::new(Arc::clone(&segment));
        let writer = WriterHandle::acquire(segment).unwrap();

        let result = (0..64).try_for_each(|i| {
            container
                .write(writer.token(), &format!("key{}", i), [0u8; 1024], 4)
                .map(|_| ())
        });
        assert!(result.unwrap_err().is_resource_exhausted());
    }
}
