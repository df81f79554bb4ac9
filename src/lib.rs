//! Embedded, memory-mapped multi-version key-value store.
//!
//! One owner process writes; any number of reader processes map the same
//! backing file and read concurrently. Every write creates a new immutable,
//! timestamped revision of its key, kept in a bounded per-key history until
//! the owner collects versions that no reader can still observe.

pub mod config;
pub mod container;
pub mod error;
pub mod flock;
pub mod gc;
pub mod handle;
pub mod hasher;
pub mod metadata;
pub mod owner;
pub mod pool;
pub mod reader;
pub mod record;
pub mod ring_buffer;
pub mod segment;
pub mod sync;

pub use config::MvccConfig;
pub use error::{Error, Result};
pub use hasher::Hasher;
pub use owner::MvccOwner;
pub use reader::MvccReader;
pub use record::{FixedString, Versioned};
pub use ring_buffer::MultiReaderRingBuffer;
pub use segment::Segment;
