//! Per-transaction lock ownership: a stack of held locks in chained
//! fixed-capacity blocks, with nested savepoint scopes.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::lock::{lock_hash, LockKey, LockManager, LockMode, LockResult, LockerId};

const FIRST_BLOCK_CAPACITY: usize = 8;
const MAX_BLOCK_CAPACITY: usize = 64;

struct Block {
    locks: Vec<HeldLock>,
    capacity: usize,
    /// Bit per entry: set when the entry records a promotion of a lock
    /// acquired in an enclosing scope, not a fresh acquisition.
    upgrades: u64,
    prev: Option<Box<Block>>,
}

struct HeldLock {
    key: LockKey,
    hash: u64,
}

/// Owns a transaction's locks. All acquisitions funnel through here so that
/// scope exit, promotion and rollback can unwind them in order.
pub struct Locker {
    mgr: Arc<LockManager>,
    id: LockerId,
    interrupt: Arc<AtomicBool>,
    head: Option<Box<Block>>,
    count: usize,
    /// Savepoints: the lock count at each `scope_enter`.
    scopes: Vec<usize>,
}

impl Locker {
    pub fn new(mgr: Arc<LockManager>) -> Self {
        let (id, interrupt) = mgr.register_locker();
        Self {
            mgr,
            id,
            interrupt,
            head: None,
            count: 0,
            scopes: Vec::new(),
        }
    }

    pub fn id(&self) -> LockerId {
        self.id
    }

    /// Handle for interrupting this locker's pending lock waits from
    /// another thread.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            mgr: Arc::clone(&self.mgr),
            id: self.id,
        }
    }

    pub fn held_count(&self) -> usize {
        self.count
    }

    /// Request `mode` on `(index_id, key)`. Deadlock detection runs only
    /// after a timeout, keeping the uncontended path cheap.
    pub fn lock(
        &mut self,
        mode: LockMode,
        index_id: u64,
        key: &[u8],
        nanos_timeout: i64,
    ) -> Result<LockResult> {
        let lock_key = LockKey::new(index_id, key);
        let hash = lock_hash(index_id, key);
        let result = self
            .mgr
            .try_lock(mode, self.id, &self.interrupt, &lock_key, hash, nanos_timeout);
        match result {
            LockResult::Acquired => {
                self.push(lock_key, hash, false);
                Ok(result)
            }
            LockResult::Upgraded => {
                self.push(lock_key, hash, true);
                Ok(result)
            }
            LockResult::TimedOut => {
                if let Some((cycle, guilty)) = self.mgr.detect_deadlock(self.id, &lock_key) {
                    self.mgr.clear_waiting(self.id);
                    return Err(Error::Deadlock { cycle, guilty });
                }
                self.mgr.clear_waiting(self.id);
                Err(Error::LockTimeout)
            }
            LockResult::Interrupted => Err(Error::LockInterrupted),
            LockResult::Illegal => Err(Error::IllegalUpgrade),
            owned => Ok(owned),
        }
    }

    /// Try-only variant; never waits and never reports deadlock.
    pub fn try_lock_nowait(&mut self, mode: LockMode, index_id: u64, key: &[u8]) -> Result<LockResult> {
        let lock_key = LockKey::new(index_id, key);
        let hash = lock_hash(index_id, key);
        let result = self
            .mgr
            .try_lock(mode, self.id, &self.interrupt, &lock_key, hash, 0);
        match result {
            LockResult::Acquired => {
                self.push(lock_key, hash, false);
                Ok(LockResult::Acquired)
            }
            LockResult::Upgraded => {
                self.push(lock_key, hash, true);
                Ok(LockResult::Upgraded)
            }
            LockResult::Illegal => Err(Error::IllegalUpgrade),
            other => Ok(other),
        }
    }

    fn push(&mut self, key: LockKey, hash: u64, upgrade: bool) {
        let need_block = match &self.head {
            Some(block) => block.locks.len() >= block.capacity,
            None => true,
        };
        if need_block {
            let capacity = self
                .head
                .as_ref()
                .map(|b| (b.capacity * 2).min(MAX_BLOCK_CAPACITY))
                .unwrap_or(FIRST_BLOCK_CAPACITY);
            let prev = self.head.take();
            self.head = Some(Box::new(Block {
                locks: Vec::with_capacity(capacity),
                capacity,
                upgrades: 0,
                prev,
            }));
        }
        let block = self.head.as_mut().expect("block just ensured");
        let idx = block.locks.len();
        if upgrade {
            block.upgrades |= 1 << idx;
        }
        block.locks.push(HeldLock { key, hash });
        self.count += 1;
    }

    fn pop(&mut self) -> Option<(HeldLock, bool)> {
        let block = self.head.as_mut()?;
        let idx = block.locks.len().checked_sub(1)?;
        let upgrade = block.upgrades & (1 << idx) != 0;
        block.upgrades &= !(1 << idx);
        let lock = block.locks.pop()?;
        if block.locks.is_empty() {
            let prev = block.prev.take();
            self.head = prev;
        }
        self.count -= 1;
        Some((lock, upgrade))
    }

    fn peek_is_upgrade(&self) -> Option<bool> {
        let block = self.head.as_ref()?;
        let idx = block.locks.len().checked_sub(1)?;
        Some(block.upgrades & (1 << idx) != 0)
    }

    /// Release the most recently acquired lock.
    ///
    /// Like the scope machinery, this does not accurately track whether the
    /// top lock belongs to the current scope; callers release only locks
    /// they pushed since their own `scope_enter`.
    pub fn unlock(&mut self) -> Result<()> {
        match self.peek_is_upgrade() {
            None => Ok(()),
            Some(true) => {
                // discarding a promotion would silently widen the enclosing
                // scope's lock
                Err(Error::IllegalUpgrade)
            }
            Some(false) => {
                if let Some((lock, _)) = self.pop() {
                    self.mgr.release(self.id, &lock.key, lock.hash);
                }
                Ok(())
            }
        }
    }

    /// Demote the most recently acquired lock to shared.
    pub fn unlock_to_shared(&mut self) -> Result<()> {
        let block = match &self.head {
            Some(block) => block,
            None => return Ok(()),
        };
        let idx = block.locks.len() - 1;
        let lock = &block.locks[idx];
        self.mgr.demote_to_shared(self.id, &lock.key, lock.hash);
        if let Some(block) = self.head.as_mut() {
            block.upgrades &= !(1 << idx);
        }
        Ok(())
    }

    /// Demote the most recently acquired lock to upgradable.
    pub fn unlock_to_upgradable(&mut self) -> Result<()> {
        let block = match &self.head {
            Some(block) => block,
            None => return Ok(()),
        };
        let idx = block.locks.len() - 1;
        let lock = &block.locks[idx];
        self.mgr.demote_to_upgradable(self.id, &lock.key, lock.hash);
        if let Some(block) = self.head.as_mut() {
            block.upgrades &= !(1 << idx);
        }
        Ok(())
    }

    /// Open a nested savepoint.
    pub fn scope_enter(&mut self) {
        self.scopes.push(self.count);
    }

    /// Close the current savepoint, releasing everything acquired inside
    /// it. A promotion reverts to upgradable instead of releasing, since
    /// the underlying lock belongs to the enclosing scope.
    pub fn scope_exit(&mut self) {
        let target = self.scopes.pop().unwrap_or(0);
        self.unwind_to(target);
    }

    /// Merge the current scope into its parent: locks are retained across
    /// the boundary.
    pub fn promote(&mut self) {
        self.scopes.pop();
    }

    /// Release down to the enclosing savepoint without closing it (or
    /// everything when no scope is open).
    pub fn scope_unlock_all(&mut self) {
        let target = self.scopes.last().copied().unwrap_or(0);
        self.unwind_to(target);
    }

    /// Release every lock and forget all savepoints.
    pub fn release_all(&mut self) {
        self.scopes.clear();
        self.unwind_to(0);
    }

    fn unwind_to(&mut self, target: usize) {
        while self.count > target {
            match self.pop() {
                Some((lock, true)) => {
                    self.mgr.demote_to_upgradable(self.id, &lock.key, lock.hash);
                }
                Some((lock, false)) => {
                    self.mgr.release(self.id, &lock.key, lock.hash);
                }
                None => break,
            }
        }
    }
}

/// Interrupts a locker blocked on a lock wait; the wait returns
/// `LockInterrupted` and the locker's stack is unchanged.
pub struct Interrupter {
    mgr: Arc<LockManager>,
    id: LockerId,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.mgr.interrupt(self.id);
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        self.release_all();
        self.mgr.unregister_locker(self.id);
    }
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("id", &self.id)
            .field("held", &self.count)
            .field("scopes", &self.scopes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpgradeRule;

    fn locker() -> Locker {
        Locker::new(Arc::new(LockManager::new(UpgradeRule::Lenient)))
    }

    #[test]
    fn scope_exit_restores_entry_lock_set() {
        let mut locker = locker();
        locker.lock(LockMode::Exclusive, 1, b"outer", -1).unwrap();
        locker.scope_enter();
        locker.lock(LockMode::Exclusive, 1, b"inner-1", -1).unwrap();
        locker.lock(LockMode::Exclusive, 1, b"inner-2", -1).unwrap();
        assert_eq!(locker.held_count(), 3);

        locker.scope_exit();
        assert_eq!(locker.held_count(), 1);
    }

    #[test]
    fn scope_exit_reverts_upgrade_to_upgradable() {
        let mgr = Arc::new(LockManager::new(UpgradeRule::Lenient));
        let mut locker = Locker::new(Arc::clone(&mgr));
        locker.lock(LockMode::Upgradable, 1, b"row", -1).unwrap();
        locker.scope_enter();
        assert_eq!(
            locker.lock(LockMode::Exclusive, 1, b"row", -1).unwrap(),
            LockResult::Upgraded
        );
        locker.scope_exit();
        assert_eq!(locker.held_count(), 1);

        // the lock is back to upgradable: another locker can share it
        let mut other = Locker::new(mgr);
        assert_eq!(
            other.lock(LockMode::Shared, 1, b"row", 0).unwrap(),
            LockResult::Acquired
        );
    }

    #[test]
    fn unlock_refuses_to_discard_upgrade() {
        let mut locker = locker();
        locker.lock(LockMode::Upgradable, 1, b"row", -1).unwrap();
        locker.lock(LockMode::Exclusive, 1, b"row", -1).unwrap();
        assert!(matches!(locker.unlock(), Err(Error::IllegalUpgrade)));
    }

    #[test]
    fn promote_keeps_inner_locks() {
        let mut locker = locker();
        locker.scope_enter();
        locker.lock(LockMode::Exclusive, 1, b"kept", -1).unwrap();
        locker.promote();
        locker.scope_unlock_all();
        // no parent scope after promote: everything released
        assert_eq!(locker.held_count(), 0);
    }

    #[test]
    fn block_chain_grows_past_first_capacity() {
        let mut locker = locker();
        for i in 0..100u32 {
            locker
                .lock(LockMode::Exclusive, 1, &i.to_le_bytes(), -1)
                .unwrap();
        }
        assert_eq!(locker.held_count(), 100);
        locker.release_all();
        assert_eq!(locker.held_count(), 0);
    }
}
