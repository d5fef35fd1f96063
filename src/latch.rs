//! Non-reentrant reader/writer latch for in-memory page buffers.
//!
//! Latches are held for short, bounded work and follow an explicit
//! acquire/release protocol rather than guard objects, because latch coupling
//! releases a parent after acquiring its child — a shape borrow-scoped guards
//! cannot express across node hops.

use parking_lot::lock_api::{RawRwLock as RawRwLockApi, RawRwLockDowngrade};
use parking_lot::RawRwLock;

pub struct Latch {
    raw: RawRwLock,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub const fn new() -> Self {
        Self {
            raw: <RawRwLock as RawRwLockApi>::INIT,
        }
    }

    pub fn acquire_shared(&self) {
        self.raw.lock_shared();
    }

    pub fn try_acquire_shared(&self) -> bool {
        self.raw.try_lock_shared()
    }

    pub fn acquire_exclusive(&self) {
        self.raw.lock_exclusive();
    }

    pub fn try_acquire_exclusive(&self) -> bool {
        self.raw.try_lock_exclusive()
    }

    /// Exclusive to shared without letting writers in between.
    pub fn downgrade(&self) {
        // SAFETY: caller holds the exclusive latch per the latch protocol.
        unsafe { self.raw.downgrade() }
    }

    pub fn release_shared(&self) {
        // SAFETY: caller holds a shared latch per the latch protocol.
        unsafe { self.raw.unlock_shared() }
    }

    pub fn release_exclusive(&self) {
        // SAFETY: caller holds the exclusive latch per the latch protocol.
        unsafe { self.raw.unlock_exclusive() }
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn shared_latches_coexist() {
        let latch = Latch::new();
        latch.acquire_shared();
        assert!(latch.try_acquire_shared());
        assert!(!latch.try_acquire_exclusive());
        latch.release_shared();
        latch.release_shared();
        assert!(latch.try_acquire_exclusive());
        latch.release_exclusive();
    }

    #[test]
    fn downgrade_keeps_readers_out_of_write() {
        let latch = Arc::new(Latch::new());
        latch.acquire_exclusive();
        latch.downgrade();

        let l2 = Arc::clone(&latch);
        let t = thread::spawn(move || {
            assert!(l2.try_acquire_shared());
            assert!(!l2.try_acquire_exclusive());
            l2.release_shared();
        });
        t.join().unwrap();
        latch.release_shared();
    }
}
