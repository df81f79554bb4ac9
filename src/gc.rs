//! Resumable eviction of history no reader can still see. The newest record of
//! a key is always kept.

use std::ops::Bound;

use crossbeam_skiplist::SkipSet;

use crate::error::{Error, Result};
use crate::metadata::global_oldest_read;
use crate::ring_buffer::RawRingBuffer;
use crate::segment::Segment;

/// Runs one pass starting at `from` (inclusive), or at the first key.
///
/// With a non-zero `max_attempts` the pass stops once that many records were
/// evicted and more work remains, returning the key to resume from. `None`
/// means the pass reached the end of the registry.
pub fn collect_garbage(
    segment: &Segment,
    registry: &SkipSet<String>,
    from: Option<&str>,
    max_attempts: usize,
) -> Result<Option<String>> {
    let Some((watermark, _)) = global_oldest_read(segment) else {
        tracing::debug!("No processed reads, nothing to collect");
        return Ok(None);
    };

    let lower = from.map_or(Bound::Unbounded, Bound::Included);
    let mut evicted = 0usize;
    let mut visited = 0usize;

    for entry in registry.range::<str, _>((lower, Bound::Unbounded)) {
        let key = entry.value();
        visited += 1;

        let (_, offset) = segment.lookup(key)?.ok_or_else(|| {
            Error::malformed(
                segment.path(),
                "key registry",
                format!("registered key {:?} missing from directory", key),
            )
        })?;
        let ring = RawRingBuffer::attach(segment, offset)?;

        while ring.element_count() > 1 {
            let oldest = ring.back_revision()?;
            if oldest >= watermark {
                break;
            }
            if max_attempts != 0 && evicted >= max_attempts {
                tracing::debug!(key = %key, evicted, watermark, "Garbage collection paused");
                return Ok(Some(key.clone()));
            }
            if ring.pop_back_revision(oldest) {
                evicted += 1;
                tracing::trace!(key = %key, revision = oldest, "Evicted record");
            }
        }
    }

    tracing::debug!(visited, evicted, watermark, "Garbage collection pass complete");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MvccConfig;
    use crate::container::Container;
    use crate::flock::FileLock;
    use crate::handle::{ReaderHandle, WriterHandle};
    use crate::metadata::Metadata;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        _lock: FileLock,
        segment: Arc<Segment>,
        container: Container,
        metadata: Metadata,
        writer: WriterHandle,
        reader: ReaderHandle,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let config = MvccConfig::new(dir.path().join("gc.db"))
            .size(1 << 20)
            .reader_limit(4)
            .directory_capacity(16);
        let lock = FileLock::acquire(&config.path).unwrap();
        let segment = Arc::new(Segment::create_or_open(&config, &lock).unwrap());
        Fixture {
            _dir: dir,
            _lock: lock,
            container: Container::new(Arc::clone(&segment)),
            metadata: Metadata::load(&segment).unwrap(),
            writer: WriterHandle::acquire(Arc::clone(&segment)).unwrap(),
            reader: ReaderHandle::acquire(Arc::clone(&segment)).unwrap(),
            segment,
        }
    }

    impl Fixture {
        fn write(&self, key: &str, value: u64) -> u64 {
            self.container.write(self.writer.token(), key, value, 16).unwrap()
        }

        /// Reads `key` and makes that read the watermark.
        fn pin(&self, key: &str) {
            self.container.read::<u64>(self.reader.token(), key).unwrap();
            self.metadata.process_write_metadata(&self.segment, 0).unwrap();
            self.metadata.process_read_metadata(&self.segment, 0..4);
        }

        fn revisions(&self, key: &str) -> Vec<u64> {
            self.container
                .history::<u64>(key)
                .unwrap()
                .unwrap()
                .history()
                .iter()
                .map(|r| r.revision)
                .collect()
        }

        fn collect(&self, from: Option<&str>, max: usize) -> Option<String> {
            collect_garbage(&self.segment, self.metadata.registry(), from, max).unwrap()
        }
    }

    #[test]
    fn test_nothing_collected_without_watermark() {
        let f = fixture();
        for v in 0..4 {
            f.write("k", v);
        }
        f.metadata.process_write_metadata(&f.segment, 0).unwrap();
        assert_eq!(f.collect(None, 0), None);
        assert_eq!(f.revisions("k"), vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_evicts_only_below_watermark() {
        let f = fixture();
        for v in 0..3 {
            f.write("k", v);
        }
        f.pin("k");
        f.write("k", 3);

        assert_eq!(f.collect(None, 0), None);
        assert_eq!(f.revisions("k"), vec![4, 3]);
    }

    #[test]
    fn test_keeps_newest_record() {
        let f = fixture();
        f.write("old", 1);
        f.write("old", 2);
        f.write("new", 3);
        f.write("new", 4);
        f.pin("new");

        assert_eq!(f.collect(None, 0), None);
        assert_eq!(f.revisions("old"), vec![2]);
        assert_eq!(f.revisions("new"), vec![4]);
        assert_eq!(f.container.read::<u64>(f.reader.token(), "old").unwrap(), 2);
    }

    #[test]
    fn test_bounded_pass_resumes() {
        let f = fixture();
        for key in ["a", "b", "c"] {
            for v in 0..3 {
                f.write(key, v);
            }
        }
        f.write("z", 0);
        f.pin("z");

        // Six records are evictable, two per key
        assert_eq!(f.collect(None, 3).as_deref(), Some("b"));
        assert_eq!(f.revisions("a").len(), 1);
        assert_eq!(f.revisions("b").len(), 2);

        assert_eq!(f.collect(Some("b"), 3), None);
        for key in ["a", "b", "c"] {
            assert_eq!(f.revisions(key).len(), 1);
        }
    }

    #[test]
    fn test_start_key_skips_earlier_keys() {
        let f = fixture();
        for key in ["a", "b"] {
            f.write(key, 0);
            f.write(key, 1);
        }
        f.pin("b");

        assert_eq!(f.collect(Some("b"), 0), None);
        assert_eq!(f.revisions("a").len(), 2);
        assert_eq!(f.revisions("b").len(), 1);
    }

    #[test]
    fn test_converges_as_watermark_advances() {
        let f = fixture();
        for v in 0..5 {
            f.write("k", v);
        }
        f.pin("k");
        f.collect(None, 0);
        let first = f.revisions("k");
        f.collect(None, 0);
        assert_eq!(f.revisions("k"), first);

        for v in 5..8 {
            f.write("k", v);
        }
        f.collect(None, 0);
        assert_eq!(f.revisions("k"), vec![8, 7, 6, 5]);

        f.pin("k");
        f.collect(None, 0);
        assert_eq!(f.revisions("k"), vec![8]);
    }

    #[test]
    fn test_stale_pop_is_refused() {
        let f = fixture();
        f.write("k", 1);
        f.write("k", 2);
        let ring = f.container.history::<u64>("k").unwrap().unwrap();
        let oldest = ring.back().unwrap();
        assert!(ring.pop_back(&oldest));
        assert!(!ring.raw().pop_back_revision(oldest.revision));
        assert_eq!(ring.element_count(), 1);
    }
}
