use std::path::Path;
use std::sync::Arc;

use bytemuck::Pod;
use chrono::{DateTime, Utc};

use crate::container::Container;
use crate::error::Result;
use crate::handle::ReaderHandle;
use crate::metadata::global_oldest_read;
use crate::pool::ReaderTokenId;
use crate::record::Versioned;
use crate::segment::Segment;

/// Read-only view of a store. Each read is recorded on the reader's token.
#[derive(Debug)]
pub struct MvccReader {
    handle: ReaderHandle,
    container: Container,
}

impl MvccReader {
    /// Maps an existing store and claims a reader token.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let segment = Arc::new(Segment::open_existing(path.as_ref())?);
        let handle = ReaderHandle::acquire(Arc::clone(&segment))?;

        tracing::info!(
            path = %segment.path().display(),
            token = handle.id(),
            "Opened reader"
        );
        Ok(Self {
            handle,
            container: Container::new(segment),
        })
    }

    pub fn exists<V: Pod>(&self, key: &str) -> Result<bool> {
        self.container.exists::<V>(key)
    }

    pub fn read<V: Pod>(&self, key: &str) -> Result<V> {
        self.container.read::<V>(self.handle.token(), key)
    }

    pub fn read_versioned<V: Pod>(&self, key: &str) -> Result<Versioned<V>> {
        self.container.read_versioned::<V>(self.handle.token(), key)
    }

    pub fn reader_token_id(&self) -> ReaderTokenId {
        self.handle.id()
    }

    pub fn last_read_revision(&self) -> Option<u64> {
        self.handle.token().last_read_revision()
    }

    pub fn last_read_timestamp(&self) -> Option<DateTime<Utc>> {
        self.handle.token().last_read_timestamp()
    }

    pub fn oldest_revision<V: Pod>(&self, key: &str) -> Result<u64> {
        self.container.oldest_revision::<V>(key)
    }

    pub fn newest_revision<V: Pod>(&self, key: &str) -> Result<u64> {
        self.container.newest_revision::<V>(key)
    }

    pub fn global_oldest_revision_read(&self) -> Option<u64> {
        global_oldest_read(self.container.segment()).map(|(revision, _)| revision)
    }

    pub fn path(&self) -> &Path {
        self.container.segment().path()
    }
}

impl Drop for MvccReader {
    fn drop(&mut self) {
        tracing::info!(path = %self.path().display(), token = self.handle.id(), "Closed reader");
    }
}
