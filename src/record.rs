use bytemuck::Pod;
use chrono::{DateTime, Utc};

/// One immutable version of a key's value.
///
/// Values are plain data (`bytemuck::Pod`) because they are stored in memory
/// shared between processes; they cannot own heap allocations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Versioned<V> {
    pub value: V,
    pub revision: u64,
    pub timestamp: DateTime<Utc>,
}

impl<V: Pod> Versioned<V> {
    pub fn new(value: V, revision: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            revision,
            timestamp,
        }
    }
}

/// Fixed-capacity, NUL-padded UTF-8 string usable as a stored value.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedString<const N: usize> {
    len: u32,
    bytes: [u8; N],
}

// Safety: the struct is repr(C) with a u32 followed by bytes, and every N in
// use is checked at compile time to leave no padding.
unsafe impl<const N: usize> bytemuck::Zeroable for FixedString<N> {}
unsafe impl<const N: usize> Pod for FixedString<N> where Self: NoPadding {}

/// Implemented for capacities that are a multiple of four, which keeps the
/// layout free of padding bytes.
pub trait NoPadding {}

macro_rules! no_padding {
    ($($n:literal),*) => { $(impl NoPadding for FixedString<$n> {})* };
}

no_padding!(4, 8, 12, 16, 24, 32, 48, 64, 128, 256);

impl<const N: usize> FixedString<N> {
    /// Copies `value`, or returns `None` if it does not fit.
    pub fn new(value: &str) -> Option<Self> {
        if value.len() > N {
            return None;
        }
        let mut bytes = [0u8; N];
        bytes[..value.len()].copy_from_slice(value.as_bytes());
        Some(Self {
            len: value.len() as u32,
            bytes,
        })
    }

    pub fn as_str(&self) -> &str {
        let len = (self.len as usize).min(N);
        std::str::from_utf8(&self.bytes[..len]).unwrap_or("")
    }

    pub const fn capacity() -> usize {
        N
    }
}

impl<const N: usize> std::fmt::Debug for FixedString<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl<const N: usize> std::fmt::Display for FixedString<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
