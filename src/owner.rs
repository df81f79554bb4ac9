//! The single writing participant.

use std::path::Path;
use std::sync::Arc;

use bytemuck::Pod;
use chrono::{DateTime, Utc};

use crate::config::MvccConfig;
use crate::container::Container;
use crate::error::Result;
use crate::flock::FileLock;
use crate::gc;
use crate::handle::{ReaderHandle, WriterHandle};
use crate::metadata::{global_oldest_read, Metadata};
use crate::pool::ReaderTokenId;
use crate::record::Versioned;
use crate::segment::Segment;

// Fields drop in order: the handles release their tokens before the owner
// lock is given up.
#[derive(Debug)]
pub struct MvccOwner {
    config: MvccConfig,
    container: Container,
    metadata: Metadata,
    writer: WriterHandle,
    reader: ReaderHandle,
    _lock: FileLock,
}

impl MvccOwner {
    /// Opens the store described by `config`, creating it if absent.
    ///
    /// Fails with `LockError` while another owner holds the store.
    pub fn open(config: MvccConfig) -> Result<Self> {
        config.validate()?;
        let lock = FileLock::acquire(&config.path)?;
        let segment = Arc::new(Segment::create_or_open(&config, &lock)?);

        // Holding the owner lock means no other owner is live, so a writer
        // token still marked live was left behind by one that crashed.
        let pool = segment.pool();
        if pool.writer_free_list.allocated_count() > 0 {
            tracing::warn!(
                path = %segment.path().display(),
                "Reclaiming writer token left by a previous owner"
            );
            pool.writer_free_list.reset();
        }
        if let Some(id) = segment.control().owner_reader_token() {
            tracing::warn!(
                path = %segment.path().display(),
                token = id,
                "Reclaiming reader token left by a previous owner"
            );
            if let Some(token) = pool.reader_token(id as ReaderTokenId) {
                token.clear();
            }
            pool.reader_free_list.release(id);
            segment.control().set_owner_reader_token(None);
        }

        let writer = WriterHandle::acquire(Arc::clone(&segment))?;
        let reader = ReaderHandle::acquire(Arc::clone(&segment))?;
        segment
            .control()
            .set_owner_reader_token(Some(reader.id() as usize));
        let metadata = Metadata::load(&segment)?;

        tracing::info!(
            path = %segment.path().display(),
            size = segment.len(),
            available = segment.available_space(),
            history_depth = config.history_depth,
            "Opened owner"
        );
        Ok(Self {
            config,
            container: Container::new(segment),
            metadata,
            writer,
            reader,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &MvccConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        self.segment().path()
    }

    fn segment(&self) -> &Arc<Segment> {
        self.container.segment()
    }

    pub fn available_space(&self) -> usize {
        self.segment().available_space()
    }

    pub fn exists<V: Pod>(&self, key: &str) -> Result<bool> {
        self.container.exists::<V>(key)
    }

    pub fn read<V: Pod>(&self, key: &str) -> Result<V> {
        self.container.read::<V>(self.reader.token(), key)
    }

    pub fn read_versioned<V: Pod>(&self, key: &str) -> Result<Versioned<V>> {
        self.container.read_versioned::<V>(self.reader.token(), key)
    }

    /// Writes a new version of `key` and returns its revision.
    pub fn write<V: Pod>(&self, key: &str, value: V) -> Result<u64> {
        self.container
            .write(self.writer.token(), key, value, self.config.history_depth)
    }

    /// Drops the whole history of `key`, returning the number of records.
    pub fn remove<V: Pod>(&self, key: &str) -> Result<usize> {
        self.container.remove::<V>(key)
    }

    /// Snapshots the reads of reader tokens `from..to`.
    pub fn process_read_metadata(&self, from: usize, to: usize) {
        self.metadata.process_read_metadata(self.segment(), from..to);
    }

    /// Snapshots the reads of every reader token.
    pub fn process_all_read_metadata(&self) {
        self.process_read_metadata(0, self.segment().layout().reader_capacity);
    }

    pub fn process_write_metadata(&self, max_attempts: usize) -> Result<usize> {
        self.metadata
            .process_write_metadata(self.segment(), max_attempts)
    }

    pub fn collect_garbage(&self, max_attempts: usize) -> Result<Option<String>> {
        gc::collect_garbage(self.segment(), self.metadata.registry(), None, max_attempts)
    }

    pub fn collect_garbage_from(&self, from: &str, max_attempts: usize) -> Result<Option<String>> {
        gc::collect_garbage(
            self.segment(),
            self.metadata.registry(),
            Some(from),
            max_attempts,
        )
    }

    pub fn flush(&self) -> Result<()> {
        self.container.flush(self.writer.token())
    }

    pub fn reader_token_id(&self) -> ReaderTokenId {
        self.reader.id()
    }

    pub fn last_read_revision(&self) -> Option<u64> {
        self.reader.token().last_read_revision()
    }

    pub fn oldest_revision<V: Pod>(&self, key: &str) -> Result<u64> {
        self.container.oldest_revision::<V>(key)
    }

    pub fn newest_revision<V: Pod>(&self, key: &str) -> Result<u64> {
        self.container.newest_revision::<V>(key)
    }

    pub fn history_depth<V: Pod>(&self, key: &str) -> Result<usize> {
        self.container.history_depth::<V>(key)
    }

    pub fn global_oldest_revision_read(&self) -> Option<u64> {
        global_oldest_read(self.segment()).map(|(revision, _)| revision)
    }

    pub fn global_oldest_timestamp_read(&self) -> Option<DateTime<Utc>> {
        global_oldest_read(self.segment()).and_then(|(_, timestamp)| timestamp)
    }

    pub fn registered_keys(&self) -> Vec<String> {
        self.metadata.registered_keys()
    }

    pub fn last_write_revision(&self) -> Option<u64> {
        self.writer.token().last_write_revision()
    }

    pub fn last_write_timestamp(&self) -> Option<DateTime<Utc>> {
        self.writer.token().last_write_timestamp()
    }

    pub fn last_flushed_revision(&self) -> Option<u64> {
        self.writer.token().last_flushed_revision()
    }

    pub fn last_flush_timestamp(&self) -> Option<DateTime<Utc>> {
        self.writer.token().last_flush_timestamp()
    }
}

impl Drop for MvccOwner {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(path = %self.path().display(), error = %e, "Flush on close failed");
        }
        self.segment().control().set_owner_reader_token(None);
        tracing::info!(path = %self.path().display(), "Closed owner");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::reader::MvccReader;
    use crate::record::FixedString;
    use std::fs;
    use tempfile::tempdir;

    type Value = FixedString<16>;

    fn value(s: &str) -> Value {
        FixedString::new(s).unwrap()
    }

    fn config(dir: &Path) -> MvccConfig {
        MvccConfig::new(dir.join("owner.db"))
            .size(1 << 20)
            .reader_limit(8)
            .history_depth(16)
            .directory_capacity(32)
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        {
            let owner = MvccOwner::open(config.clone()).unwrap();
            owner.write("k", value("11")).unwrap();
            owner.write("k", value("22")).unwrap();
            owner.process_write_metadata(0).unwrap();
        }

        let owner = MvccOwner::open(config).unwrap();
        assert_eq!(owner.read::<Value>("k").unwrap(), value("22"));
        assert_eq!(owner.registered_keys(), vec!["k"]);
        assert_eq!(owner.write("k", value("33")).unwrap(), 3);
        assert_eq!(owner.history_depth::<Value>("k").unwrap(), 3);
    }

    #[test]
    fn test_second_owner_is_locked_out() {
        let dir = tempdir().unwrap();
        let _owner = MvccOwner::open(config(dir.path())).unwrap();
        let result = MvccOwner::open(config(dir.path()));
        assert!(matches!(result, Err(Error::LockError(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let result = MvccOwner::open(config(dir.path()).history_depth(0));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
        assert!(!dir.path().join("owner.db").exists());
    }

    #[test]
    fn test_corrupted_header_leaves_file_unmodified() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        {
            let owner = MvccOwner::open(config.clone()).unwrap();
            owner.write("k", 7u64).unwrap();
        }

        let mut bytes = fs::read(&config.path).unwrap();
        bytes[2] = b'X';
        fs::write(&config.path, &bytes).unwrap();

        let result = MvccOwner::open(config.clone());
        assert!(matches!(result, Err(Error::MalformedDb { .. })));
        assert_eq!(fs::read(&config.path).unwrap(), bytes);
    }

    #[test]
    fn test_stale_writer_token_reclaimed() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        drop(MvccOwner::open(config.clone()).unwrap());

        {
            // Simulate a crashed owner that never released its token
            let segment = Segment::open_existing(&config.path).unwrap();
            assert!(segment.pool().writer_free_list.acquire().is_some());
        }

        let owner = MvccOwner::open(config).unwrap();
        assert!(owner.write("k", 1u64).is_ok());
    }

    #[test]
    fn test_stale_owner_reader_token_reclaimed() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        drop(MvccOwner::open(config.clone()).unwrap());

        {
            // Simulate a crashed owner whose reader token still pins revision 1
            let segment = Segment::open_existing(&config.path).unwrap();
            let pool = segment.pool();
            let id = pool.reader_free_list.acquire().unwrap();
            pool.reader_token(id as ReaderTokenId)
                .unwrap()
                .record_read(1, Utc::now());
            segment.control().set_owner_reader_token(Some(id));
        }

        let owner = MvccOwner::open(config).unwrap();
        owner.write("k", 1u64).unwrap();
        owner.write("k", 2u64).unwrap();
        owner.process_all_read_metadata();
        assert_eq!(owner.global_oldest_revision_read(), None);
        assert_eq!(owner.segment().pool().reader_free_list.allocated_count(), 1);

        owner.read::<u64>("k").unwrap();
        owner.process_write_metadata(0).unwrap();
        owner.process_all_read_metadata();
        assert_eq!(owner.global_oldest_revision_read(), Some(2));
        owner.collect_garbage(0).unwrap();
        assert_eq!(owner.history_depth::<u64>("k").unwrap(), 1);
    }

    #[test]
    fn test_closed_owner_frees_its_reader_token() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        drop(MvccOwner::open(config.clone()).unwrap());

        let reader = MvccReader::open(&config.path).unwrap();
        let owner = MvccOwner::open(config).unwrap();
        assert_ne!(owner.reader_token_id(), reader.reader_token_id());
        assert_eq!(owner.segment().pool().reader_free_list.allocated_count(), 2);
    }

    #[test]
    fn test_writes_from_threads_keep_revision_order() {
        let dir = tempdir().unwrap();
        let owner = MvccOwner::open(config(dir.path())).unwrap();
        std::thread::scope(|scope| {
            for t in 0..4u64 {
                let owner = &owner;
                scope.spawn(move || {
                    for i in 0..200u64 {
                        owner.write("k", t << 32 | i).unwrap();
                    }
                });
            }
        });

        assert_eq!(owner.newest_revision::<u64>("k").unwrap(), 800);
        assert_eq!(owner.oldest_revision::<u64>("k").unwrap(), 785);
        assert_eq!(owner.last_write_revision(), Some(800));
        assert_eq!(owner.read_versioned::<u64>("k").unwrap().revision, 800);
    }

    #[test]
    fn test_watermark_tracks_processed_read() {
        let dir = tempdir().unwrap();
        let owner = MvccOwner::open(config(dir.path())).unwrap();
        let reader = MvccReader::open(owner.path()).unwrap();

        let rev11 = owner.write("k", value("11")).unwrap();
        assert_eq!(reader.read::<Value>("k").unwrap(), value("11"));
        owner.write("k", value("22")).unwrap();

        owner.process_all_read_metadata();
        assert_eq!(reader.last_read_revision(), Some(rev11));
        assert_eq!(owner.global_oldest_revision_read(), Some(rev11));
        assert_eq!(reader.global_oldest_revision_read(), Some(rev11));
        assert!(owner.global_oldest_timestamp_read().is_some());
    }

    #[test]
    fn test_process_read_metadata_single_key() {
        let dir = tempdir().unwrap();
        let owner = MvccOwner::open(config(dir.path())).unwrap();
        let a = MvccReader::open(owner.path()).unwrap();
        let b = MvccReader::open(owner.path()).unwrap();

        owner.write("single", value("abc1")).unwrap();
        a.read::<Value>("single").unwrap();
        b.read::<Value>("single").unwrap();
        owner.process_all_read_metadata();
        let oldest1 = owner.global_oldest_revision_read().unwrap();
        assert_eq!(a.last_read_revision(), Some(oldest1));
        assert_eq!(b.last_read_revision(), Some(oldest1));

        owner.write("single", value("abc2")).unwrap();
        a.read::<Value>("single").unwrap();
        b.read::<Value>("single").unwrap();
        owner.process_all_read_metadata();
        let oldest2 = owner.global_oldest_revision_read().unwrap();
        assert_eq!(a.last_read_revision(), Some(oldest2));
        assert_eq!(b.last_read_revision(), Some(oldest2));

        owner.write("single", value("abc3")).unwrap();
        a.read::<Value>("single").unwrap();
        owner.process_all_read_metadata();
        let oldest3 = owner.global_oldest_revision_read().unwrap();
        assert_ne!(a.last_read_revision(), Some(oldest3));
        assert_eq!(b.last_read_revision(), Some(oldest3));
        assert_eq!(oldest2, oldest3);
    }

    #[test]
    fn test_process_read_metadata_multi_key() {
        let dir = tempdir().unwrap();
        let owner = MvccOwner::open(config(dir.path())).unwrap();
        let a = MvccReader::open(owner.path()).unwrap();
        let b = MvccReader::open(owner.path()).unwrap();

        owner.write("multi_A", value("abc1")).unwrap();
        a.read::<Value>("multi_A").unwrap();
        b.read::<Value>("multi_A").unwrap();
        owner.process_all_read_metadata();
        let oldest1 = owner.global_oldest_revision_read().unwrap();

        owner.write("multi_B", value("xyz1")).unwrap();
        a.read::<Value>("multi_B").unwrap();
        b.read::<Value>("multi_B").unwrap();
        owner.process_all_read_metadata();
        let oldest2 = owner.global_oldest_revision_read().unwrap();
        assert!(oldest1 < oldest2);
        assert_eq!(a.last_read_revision(), Some(oldest2));

        owner.write("multi_C", value("!@#1")).unwrap();
        b.read::<Value>("multi_C").unwrap();
        owner.process_all_read_metadata();
        let oldest3 = owner.global_oldest_revision_read().unwrap();
        assert_eq!(oldest2, oldest3);
        assert!(Some(oldest3) < b.last_read_revision());
        assert_eq!(a.last_read_revision(), Some(oldest3));
    }

    #[test]
    fn test_process_read_metadata_subset() {
        let dir = tempdir().unwrap();
        let owner = MvccOwner::open(config(dir.path())).unwrap();
        let a = MvccReader::open(owner.path()).unwrap();
        let b = MvccReader::open(owner.path()).unwrap();
        let c = MvccReader::open(owner.path()).unwrap();

        owner.write("A", value("abc123")).unwrap();
        a.read::<Value>("A").unwrap();
        b.read::<Value>("A").unwrap();
        c.read::<Value>("A").unwrap();

        owner.write("B", value("def456")).unwrap();
        a.read::<Value>("B").unwrap();
        b.read::<Value>("B").unwrap();

        owner.write("A", value("xyz123")).unwrap();
        a.read::<Value>("A").unwrap();

        owner.process_read_metadata(a.reader_token_id() as usize, c.reader_token_id() as usize);
        let oldest = owner.global_oldest_revision_read().unwrap();
        let rev = |r: &MvccReader| r.last_read_revision().unwrap();
        assert!(oldest < rev(&a));
        assert_eq!(oldest, rev(&b));
        assert!(rev(&c) < oldest);
    }

    #[test]
    fn test_remove_ignores_watermark() {
        let dir = tempdir().unwrap();
        let owner = MvccOwner::open(config(dir.path())).unwrap();
        let reader = MvccReader::open(owner.path()).unwrap();

        owner.write("k", 1u64).unwrap();
        owner.write("k", 2u64).unwrap();
        reader.read::<u64>("k").unwrap();
        owner.process_all_read_metadata();

        assert_eq!(owner.remove::<u64>("k").unwrap(), 2);
        assert!(!reader.exists::<u64>("k").unwrap());
        assert!(reader.read::<u64>("k").unwrap_err().is_key_not_found());
    }

    #[test]
    fn test_full_cycle() {
        let dir = tempdir().unwrap();
        let owner = MvccOwner::open(config(dir.path())).unwrap();
        let reader = MvccReader::open(owner.path()).unwrap();

        for i in 0..10u64 {
            owner.write("a", i).unwrap();
            owner.write("b", i * 2).unwrap();
        }
        reader.read::<u64>("b").unwrap();
        owner.process_write_metadata(0).unwrap();
        owner.process_all_read_metadata();

        let mut from = owner.collect_garbage(4).unwrap();
        while let Some(key) = from {
            from = owner.collect_garbage_from(&key, 4).unwrap();
        }

        let watermark = owner.global_oldest_revision_read().unwrap();
        assert_eq!(owner.history_depth::<u64>("a").unwrap(), 1);
        assert_eq!(owner.history_depth::<u64>("b").unwrap(), 1);
        assert!(owner.oldest_revision::<u64>("b").unwrap() >= watermark);
        assert_eq!(owner.read::<u64>("a").unwrap(), 9);

        owner.flush().unwrap();
        assert_eq!(owner.last_flushed_revision(), owner.last_write_revision());
        assert!(owner.last_flush_timestamp().is_some());
    }

    #[test]
    fn test_history_depth_bounds_retention() {
        let dir = tempdir().unwrap();
        let owner = MvccOwner::open(config(dir.path()).history_depth(4)).unwrap();
        for i in 0..10u64 {
            owner.write("k", i).unwrap();
        }
        assert_eq!(owner.history_depth::<u64>("k").unwrap(), 4);
        assert_eq!(owner.oldest_revision::<u64>("k").unwrap(), 7);
        assert_eq!(owner.newest_revision::<u64>("k").unwrap(), 10);
    }
}
