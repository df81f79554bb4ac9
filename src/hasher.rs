use std::fmt;

use crc::{Algorithm, Crc};

pub const CRC_64_ECMA: Algorithm<u64> = crc::CRC_64_ECMA_182;

/// Incremental CRC64 used to derive type tags for named objects.
#[derive(Clone)]
pub struct Hasher {
    crc64: Crc<u64>,
    buffer: Vec<u8>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher")
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            crc64: Crc::<u64>::new(&CRC_64_ECMA),
            buffer: Vec::new(),
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn checksum(&self) -> u64 {
        self.crc64.checksum(&self.buffer)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Tag persisted next to a named object and checked on every lookup.
///
/// Only the object kind and the element layout go into it, so separately
/// compiled binaries agree on the tag for equal layouts.
pub fn type_tag<T>(kind: &str) -> u64 {
    let mut hasher = Hasher::new();
    hasher.write(kind.as_bytes());
    hasher.write_u64(std::mem::size_of::<T>() as u64);
    hasher.write_u64(std::mem::align_of::<T>() as u64);
    // Zero is reserved for unused directory slots
    hasher.checksum().max(1)
}
