//! Sharable (reader/writer) mutex that lives inside the mapped segment.
//!
//! The whole lock is one `AtomicU32`, so it is valid at any base address and
//! in any process mapping the segment. Bit 31 marks an exclusive holder, bit 30
//! a waiting writer, and the low bits count shared holders. A waiting writer
//! blocks new shared acquisitions so writers are not starved by a steady
//! stream of readers.
//!
//! Waits spin briefly and then yield to the scheduler; there is no timeout.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::lock_api::{GuardNoSend, RawRwLock};

const EXCLUSIVE: u32 = 1 << 31;
const WRITER_WAITING: u32 = 1 << 30;
const SHARED_MASK: u32 = WRITER_WAITING - 1;

const SPIN_LIMIT: u32 = 64;

#[repr(transparent)]
#[derive(Debug)]
pub struct SharableMutex {
    state: AtomicU32,
}

impl SharableMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    pub fn read(&self) -> SharedGuard<'_> {
        self.lock_shared();
        SharedGuard { mutex: self }
    }

    pub fn write(&self) -> ExclusiveGuard<'_> {
        self.lock_exclusive();
        ExclusiveGuard { mutex: self }
    }

    pub fn try_read(&self) -> Option<SharedGuard<'_>> {
        self.try_lock_shared().then(|| SharedGuard { mutex: self })
    }

    pub fn try_write(&self) -> Option<ExclusiveGuard<'_>> {
        self.try_lock_exclusive()
            .then(|| ExclusiveGuard { mutex: self })
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & (EXCLUSIVE | SHARED_MASK) != 0
    }

    pub fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & EXCLUSIVE != 0
    }

    fn backoff(spins: &mut u32) {
        if *spins < SPIN_LIMIT {
            *spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}

impl Default for SharableMutex {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawRwLock for SharableMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = SharableMutex::new();

    type GuardMarker = GuardNoSend;

    fn lock_shared(&self) {
        let mut spins = 0;
        while !self.try_lock_shared() {
            Self::backoff(&mut spins);
        }
    }

    fn try_lock_shared(&self) -> bool {
        let state = self.state.load(Ordering::Relaxed);
        if state & (EXCLUSIVE | WRITER_WAITING) != 0 || state & SHARED_MASK == SHARED_MASK {
            return false;
        }
        self.state
            .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_shared(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        let mut spins = 0;
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & (EXCLUSIVE | SHARED_MASK) == 0 {
                // Clears WRITER_WAITING too; other waiting writers set it again
                if self
                    .state
                    .compare_exchange_weak(state, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            } else if state & WRITER_WAITING == 0 {
                self.state.fetch_or(WRITER_WAITING, Ordering::Relaxed);
            }
            Self::backoff(&mut spins);
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        let state = self.state.load(Ordering::Relaxed);
        if state & (EXCLUSIVE | SHARED_MASK) != 0 {
            return false;
        }
        self.state
            .compare_exchange(state, EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock_exclusive(&self) {
        self.state.fetch_and(!EXCLUSIVE, Ordering::Release);
    }
}

pub struct SharedGuard<'a> {
    mutex: &'a SharableMutex,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.mutex.unlock_shared() }
    }
}

pub struct ExclusiveGuard<'a> {
    mutex: &'a SharableMutex,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        unsafe { self.mutex.unlock_exclusive() }
    }
}
