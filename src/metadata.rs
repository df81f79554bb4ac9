//! Owner-side bookkeeping: reader snapshots, the read watermark and the key
//! registry.
//!
//! Readers only ever touch their own token. The owner periodically copies each
//! token's last read into the token's processed snapshot; the minimum over all
//! snapshots is the global oldest-read watermark, below which history can be
//! collected. Snapshots are also counted in a process-local multiset so that
//! processing a sub-range of tokens costs time proportional to the range
//! rather than to the whole pool.
//!
//! The registry is the sorted set of every key ever written. Keys are taken
//! from the directory in creation order, starting at a persisted cursor, so
//! registration can be spread over many bounded calls.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use crossbeam_skiplist::SkipSet;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::segment::Segment;

/// Number of processed snapshots at each revision, with the record timestamp
/// that revision carries.
#[derive(Debug, Default)]
struct Snapshots {
    by_revision: BTreeMap<u64, (usize, Option<DateTime<Utc>>)>,
}

impl Snapshots {
    fn insert(&mut self, revision: Option<u64>, timestamp: Option<DateTime<Utc>>) {
        if let Some(revision) = revision {
            let entry = self.by_revision.entry(revision).or_insert((0, timestamp));
            entry.0 += 1;
        }
    }

    fn remove(&mut self, revision: Option<u64>) {
        let Some(revision) = revision else { return };
        if let Some(entry) = self.by_revision.get_mut(&revision) {
            entry.0 -= 1;
            if entry.0 == 0 {
                self.by_revision.remove(&revision);
            }
        }
    }

    fn oldest(&self) -> Option<(u64, Option<DateTime<Utc>>)> {
        self.by_revision
            .iter()
            .next()
            .map(|(revision, (_, timestamp))| (*revision, *timestamp))
    }
}

#[derive(Debug)]
pub struct Metadata {
    registry: SkipSet<String>,
    snapshots: Mutex<Snapshots>,
    registering: Mutex<()>,
}

impl Metadata {
    /// Rebuilds the owner-local state from the segment.
    pub fn load(segment: &Segment) -> Result<Self> {
        let directory = segment.directory();
        let registered = segment.control().registered_len.load(Ordering::Acquire) as usize;
        if registered > directory.len() {
            return Err(Error::malformed(
                segment.path(),
                "key registry",
                format!(
                    "{} keys registered but only {} written",
                    registered,
                    directory.len()
                ),
            ));
        }

        let registry = SkipSet::new();
        for index in 0..registered {
            let entry = directory.get(index).ok_or_else(|| {
                Error::malformed(segment.path(), "directory", format!("entry {} unreadable", index))
            })?;
            registry.insert(entry.name);
        }

        let mut snapshots = Snapshots::default();
        for token in segment.pool().reader_tokens {
            snapshots.insert(token.processed_revision(), token.processed_timestamp());
        }

        let metadata = Self {
            registry,
            snapshots: Mutex::new(snapshots),
            registering: Mutex::new(()),
        };
        metadata.publish(segment);

        tracing::debug!(
            path = %segment.path().display(),
            registered,
            watermark = segment.control().global_oldest_read.load(Ordering::Acquire),
            "Loaded metadata"
        );
        Ok(metadata)
    }

    /// Refreshes the processed snapshot of reader tokens in `range` and
    /// recomputes the global oldest-read watermark. Free tokens get an empty
    /// snapshot so they no longer hold back collection; tokens outside the
    /// range keep theirs.
    pub fn process_read_metadata(&self, segment: &Segment, range: Range<usize>) {
        let pool = segment.pool();
        let end = range.end.min(pool.reader_tokens.len());
        let start = range.start.min(end);

        let mut snapshots = self.snapshots.lock();
        let mut changed = 0;
        for id in start..end {
            let token = &pool.reader_tokens[id];
            let (revision, timestamp) = if pool.reader_free_list.is_allocated(id) {
                (token.last_read_revision(), token.last_read_timestamp())
            } else {
                (None, None)
            };

            let previous = token.processed_revision();
            if previous != revision {
                snapshots.remove(previous);
                snapshots.insert(revision, timestamp);
                changed += 1;
            }
            token.set_processed(revision, timestamp);
        }
        drop(snapshots);

        let watermark = self.publish(segment);
        tracing::debug!(
            start,
            end,
            changed,
            watermark = watermark.unwrap_or(0),
            "Processed read metadata"
        );
    }

    fn publish(&self, segment: &Segment) -> Option<u64> {
        let oldest = self.snapshots.lock().oldest();
        let control = segment.control();
        let (revision, timestamp) = match oldest {
            Some((revision, timestamp)) => (
                revision,
                timestamp.map_or(i64::MIN, |ts| ts.timestamp_micros()),
            ),
            None => (0, i64::MIN),
        };
        control
            .global_oldest_read_timestamp
            .store(timestamp, Ordering::Release);
        control.global_oldest_read.store(revision, Ordering::Release);
        oldest.map(|(revision, _)| revision)
    }

    /// Registers keys written since the last call, oldest first. At most
    /// `max_attempts` keys are taken when it is non-zero. Returns how many
    /// keys were registered.
    pub fn process_write_metadata(&self, segment: &Segment, max_attempts: usize) -> Result<usize> {
        let _guard = self.registering.lock();
        let directory = segment.directory();
        let control = segment.control();

        let start = control.registered_len.load(Ordering::Acquire) as usize;
        let end = match max_attempts {
            0 => directory.len(),
            max => directory.len().min(start.saturating_add(max)),
        };

        for index in start..end {
            let entry = directory.get(index).ok_or_else(|| {
                Error::malformed(segment.path(), "directory", format!("entry {} unreadable", index))
            })?;
            self.registry.insert(entry.name);
            control
                .registered_len
                .store(index as u64 + 1, Ordering::Release);
        }

        let registered = end.saturating_sub(start);
        tracing::debug!(
            registered,
            pending = directory.len().saturating_sub(end),
            "Processed write metadata"
        );
        Ok(registered)
    }

    /// Registered keys in sorted order.
    pub fn registered_keys(&self) -> Vec<String> {
        self.registry.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn registry(&self) -> &SkipSet<String> {
        &self.registry
    }
}

/// Global oldest-read watermark and the timestamp of the record at it.
pub fn global_oldest_read(segment: &Segment) -> Option<(u64, Option<DateTime<Utc>>)> {
    let control = segment.control();
    match control.global_oldest_read.load(Ordering::Acquire) {
        0 => None,
        revision => {
            let micros = control.global_oldest_read_timestamp.load(Ordering::Acquire);
            let timestamp = match micros {
                i64::MIN => None,
                micros => DateTime::from_timestamp_micros(micros),
            };
            Some((revision, timestamp))
        }
    }
}
