use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::{ReaderToken, ReaderTokenId, WriterToken, WriterTokenId};
use crate::segment::Segment;

#[derive(Debug)]
pub struct ReaderHandle {
    segment: Arc<Segment>,
    id: ReaderTokenId,
}

impl ReaderHandle {
    pub fn acquire(segment: Arc<Segment>) -> Result<Self> {
        let id = segment
            .pool()
            .reader_free_list
            .acquire()
            .ok_or_else(|| Error::exhausted(segment.path(), "reader tokens"))?;
        let id = id as ReaderTokenId;

        // A fresh token starts with no reads and no snapshot
        if let Some(token) = segment.pool().reader_token(id) {
            token.clear();
        }
        tracing::debug!(path = %segment.path().display(), token = id, "Acquired reader token");
        Ok(Self { segment, id })
    }

    pub fn id(&self) -> ReaderTokenId {
        self.id
    }

    pub fn token(&self) -> &ReaderToken {
        // The id was handed out by the pool, so it is in range
        let tokens = self.segment.pool().reader_tokens;
        &tokens[self.id as usize]
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.token().clear();
        let released = self.segment.pool().reader_free_list.release(self.id as usize);
        tracing::debug!(
            path = %self.segment.path().display(),
            token = self.id,
            released,
            "Released reader token"
        );
    }
}

#[derive(Debug)]
pub struct WriterHandle {
    segment: Arc<Segment>,
    id: WriterTokenId,
}

impl WriterHandle {
    pub fn acquire(segment: Arc<Segment>) -> Result<Self> {
        let id = segment
            .pool()
            .writer_free_list
            .acquire()
            .ok_or_else(|| Error::exhausted(segment.path(), "writer tokens"))?;
        let id = id as WriterTokenId;

        tracing::debug!(path = %segment.path().display(), token = id, "Acquired writer token");
        Ok(Self { segment, id })
    }

    pub fn id(&self) -> WriterTokenId {
        self.id
    }

    pub fn token(&self) -> &WriterToken {
        let tokens = self.segment.pool().writer_tokens;
        &tokens[self.id as usize]
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        let released = self.segment.pool().writer_free_list.release(self.id as usize);
        tracing::debug!(
            path = %self.segment.path().display(),
            token = self.id,
            released,
            "Released writer token"
        );
    }
}
