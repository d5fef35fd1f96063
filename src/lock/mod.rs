//! Row-lock manager: hashed partitions of key locks with shared,
//! upgradable and exclusive modes, FIFO waiter queues split by mode, and a
//! timeout-triggered deadlock detector.
//!
//! Locks are logical (per index id and key) and scoped to a transaction's
//! `Locker`; they are held across latch releases and node movement, unlike
//! the short-lived node latches.

pub(crate) mod locker;

pub use locker::{Interrupter, Locker};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::config::UpgradeRule;
use crate::error::DeadlockInfo;

pub type LockerId = u64;

const PARTITION_COUNT: usize = 16; // power of two
const DEADLOCK_SEARCH_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Upgradable,
    Exclusive,
}

/// Outcome of a lock request. `Owned*` answers report a lock already held
/// in a sufficient mode; they do not add a stack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    Acquired,
    Upgraded,
    OwnedShared,
    OwnedUpgradable,
    OwnedExclusive,
    TimedOut,
    Interrupted,
    Illegal,
}

impl LockResult {
    pub fn is_held(self) -> bool {
        matches!(
            self,
            LockResult::Acquired
                | LockResult::Upgraded
                | LockResult::OwnedShared
                | LockResult::OwnedUpgradable
                | LockResult::OwnedExclusive
        )
    }

    /// True when the request pushed new state that must be unwound.
    pub fn is_acquisition(self) -> bool {
        matches!(self, LockResult::Acquired | LockResult::Upgraded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct LockKey {
    pub index_id: u64,
    pub key: Box<[u8]>,
}

impl LockKey {
    pub fn new(index_id: u64, key: &[u8]) -> Self {
        Self {
            index_id,
            key: key.to_vec().into_boxed_slice(),
        }
    }
}

/// Scramble of the index id and key bytes; the low bits pick the
/// partition.
pub(crate) fn lock_hash(index_id: u64, key: &[u8]) -> u64 {
    let mut k = 0xcbf2_9ce4_8422_2325u64;
    for &b in key {
        k = (k ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3);
    }
    let mut h = index_id.wrapping_mul(0x9E37_79B1) ^ k;
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h
}

#[derive(Default)]
struct LockEntry {
    /// Holder of the upgradable or exclusive mode.
    owner: Option<LockerId>,
    exclusive: bool,
    shared: HashSet<LockerId>,
    /// FIFO queues, split so exclusive waiters do not starve behind a
    /// stream of shared requests.
    queue_ux: VecDeque<LockerId>,
    queue_s: VecDeque<LockerId>,
}

impl LockEntry {
    fn is_unused(&self) -> bool {
        self.owner.is_none()
            && self.shared.is_empty()
            && self.queue_ux.is_empty()
            && self.queue_s.is_empty()
    }

    fn remove_waiter(&mut self, id: LockerId) {
        self.queue_ux.retain(|w| *w != id);
        self.queue_s.retain(|w| *w != id);
    }
}

struct Partition {
    locks: Mutex<HashMap<LockKey, LockEntry>>,
    cond: Condvar,
}

pub struct LockManager {
    partitions: Box<[Partition]>,
    upgrade_rule: UpgradeRule,
    /// Live waits, for the deadlock detector's wait-for graph.
    waiting: Mutex<HashMap<LockerId, LockKey>>,
    interrupts: Mutex<HashMap<LockerId, Arc<AtomicBool>>>,
    next_locker_id: AtomicU64,
}

impl LockManager {
    pub fn new(upgrade_rule: UpgradeRule) -> Self {
        let partitions = (0..PARTITION_COUNT)
            .map(|_| Partition {
                locks: Mutex::new(HashMap::new()),
                cond: Condvar::new(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            partitions,
            upgrade_rule,
            waiting: Mutex::new(HashMap::new()),
            interrupts: Mutex::new(HashMap::new()),
            next_locker_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn register_locker(&self) -> (LockerId, Arc<AtomicBool>) {
        let id = self.next_locker_id.fetch_add(1, Ordering::Relaxed);
        let flag = Arc::new(AtomicBool::new(false));
        self.interrupts.lock().insert(id, Arc::clone(&flag));
        (id, flag)
    }

    pub(crate) fn unregister_locker(&self, id: LockerId) {
        self.interrupts.lock().remove(&id);
        self.clear_waiting(id);
    }

    /// Interrupt a waiting locker; its pending request returns
    /// `Interrupted`.
    pub fn interrupt(&self, id: LockerId) {
        if let Some(flag) = self.interrupts.lock().get(&id) {
            flag.store(true, Ordering::Release);
        }
        for partition in self.partitions.iter() {
            let _guard = partition.locks.lock();
            partition.cond.notify_all();
        }
    }

    fn partition(&self, hash: u64) -> &Partition {
        &self.partitions[(hash as usize) & (PARTITION_COUNT - 1)]
    }

    /// Request a lock. `nanos_timeout < 0` waits forever, `0` is try-only.
    ///
    /// On `TimedOut` the waiting-for edge is left in place so the deadlock
    /// detector can walk it; the caller clears it with `clear_waiting`.
    pub(crate) fn try_lock(
        &self,
        mode: LockMode,
        locker_id: LockerId,
        interrupt: &AtomicBool,
        lock_key: &LockKey,
        hash: u64,
        nanos_timeout: i64,
    ) -> LockResult {
        let partition = self.partition(hash);
        let mut locks = partition.locks.lock();
        let entry = locks.entry(lock_key.clone()).or_default();

        // Already-owned answers per the mode transition table.
        if entry.owner == Some(locker_id) {
            if entry.exclusive {
                return LockResult::OwnedExclusive;
            }
            match mode {
                LockMode::Shared | LockMode::Upgradable => return LockResult::OwnedUpgradable,
                LockMode::Exclusive => {
                    // upgradable to exclusive: wait for shared holders
                    return self.wait_for(
                        partition,
                        locks,
                        lock_key,
                        locker_id,
                        interrupt,
                        nanos_timeout,
                        false,
                        WaitGoal::Upgrade,
                    );
                }
            }
        }
        if entry.shared.contains(&locker_id) {
            match mode {
                LockMode::Shared => return LockResult::OwnedShared,
                LockMode::Upgradable => return LockResult::Illegal,
                LockMode::Exclusive => {
                    return match self.upgrade_rule {
                        UpgradeRule::Strict => LockResult::Illegal,
                        UpgradeRule::Lenient => {
                            if entry.owner.is_none() && entry.shared.len() == 1 {
                                entry.shared.remove(&locker_id);
                                entry.owner = Some(locker_id);
                                entry.exclusive = true;
                                LockResult::Upgraded
                            } else {
                                LockResult::Illegal
                            }
                        }
                        UpgradeRule::Unchecked => self.wait_for(
                            partition,
                            locks,
                            lock_key,
                            locker_id,
                            interrupt,
                            nanos_timeout,
                            false,
                            WaitGoal::UpgradeFromShared,
                        ),
                    };
                }
            }
        }

        // Fresh request: grant immediately when compatible and nobody
        // conflicting is queued ahead.
        if grantable(entry, mode) {
            grant(entry, mode, locker_id);
            return LockResult::Acquired;
        }
        if nanos_timeout == 0 {
            if locks.get(lock_key).map_or(false, LockEntry::is_unused) {
                locks.remove(lock_key);
            }
            return LockResult::TimedOut;
        }
        let goal = match mode {
            LockMode::Shared => WaitGoal::Shared,
            LockMode::Upgradable => WaitGoal::Upgradable,
            LockMode::Exclusive => WaitGoal::Exclusive,
        };
        self.wait_for(
            partition,
            locks,
            lock_key,
            locker_id,
            interrupt,
            nanos_timeout,
            true,
            goal,
        )
    }

    /// Park until the goal becomes grantable, the timeout elapses or the
    /// locker is interrupted.
    #[allow(clippy::too_many_arguments)]
    fn wait_for(
        &self,
        partition: &Partition,
        mut locks: parking_lot::MutexGuard<'_, HashMap<LockKey, LockEntry>>,
        lock_key: &LockKey,
        locker_id: LockerId,
        interrupt: &AtomicBool,
        nanos_timeout: i64,
        enqueue: bool,
        goal: WaitGoal,
    ) -> LockResult {
        // try-only requests never park
        if nanos_timeout == 0 {
            let entry = locks.entry(lock_key.clone()).or_default();
            if goal_grantable(entry, locker_id, goal) {
                apply_goal(entry, locker_id, goal);
                return goal.result();
            }
            if locks.get(lock_key).map_or(false, LockEntry::is_unused) {
                locks.remove(lock_key);
            }
            return LockResult::TimedOut;
        }

        if enqueue {
            let entry = locks.entry(lock_key.clone()).or_default();
            match goal {
                WaitGoal::Shared => entry.queue_s.push_back(locker_id),
                _ => entry.queue_ux.push_back(locker_id),
            }
        }
        self.waiting.lock().insert(locker_id, lock_key.clone());
        debug!("locker {locker_id} waiting for lock on index {}", lock_key.index_id);

        let deadline = if nanos_timeout < 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_nanos(nanos_timeout as u64))
        };

        loop {
            {
                let entry = locks.entry(lock_key.clone()).or_default();
                let at_front = match goal {
                    WaitGoal::Shared => {
                        entry.queue_ux.is_empty()
                            && (!enqueue || entry.queue_s.front() == Some(&locker_id))
                    }
                    WaitGoal::Upgrade | WaitGoal::UpgradeFromShared => true,
                    _ => !enqueue || entry.queue_ux.front() == Some(&locker_id),
                };
                if at_front && goal_grantable(entry, locker_id, goal) {
                    if enqueue {
                        entry.remove_waiter(locker_id);
                    }
                    apply_goal(entry, locker_id, goal);
                    self.waiting.lock().remove(&locker_id);
                    partition.cond.notify_all();
                    return goal.result();
                }
            }
            if interrupt.load(Ordering::Acquire) {
                interrupt.store(false, Ordering::Release);
                let entry = locks.entry(lock_key.clone()).or_default();
                entry.remove_waiter(locker_id);
                if entry.is_unused() {
                    locks.remove(lock_key);
                }
                self.waiting.lock().remove(&locker_id);
                return LockResult::Interrupted;
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline
                        || partition.cond.wait_until(&mut locks, deadline).timed_out()
                    {
                        // the queue entry and the waiting-for edge both
                        // stay in place so the deadlock detector still
                        // sees this waiter in the graph; `clear_waiting`
                        // removes them afterwards
                        return LockResult::TimedOut;
                    }
                }
                None => partition.cond.wait(&mut locks),
            }
        }
    }

    /// Drop a timed-out waiter's remains: the waiting-for edge and its
    /// queue entry, which were left behind for the deadlock detector.
    pub(crate) fn clear_waiting(&self, locker_id: LockerId) {
        let key = self.waiting.lock().remove(&locker_id);
        if let Some(key) = key {
            let partition = self.partition(lock_hash(key.index_id, &key.key));
            let mut locks = partition.locks.lock();
            if let Some(entry) = locks.get_mut(&key) {
                entry.remove_waiter(locker_id);
                if entry.is_unused() {
                    locks.remove(&key);
                }
            }
            partition.cond.notify_all();
        }
    }

    pub(crate) fn release(&self, locker_id: LockerId, lock_key: &LockKey, hash: u64) {
        let partition = self.partition(hash);
        let mut locks = partition.locks.lock();
        if let Some(entry) = locks.get_mut(lock_key) {
            if entry.owner == Some(locker_id) {
                entry.owner = None;
                entry.exclusive = false;
            } else {
                entry.shared.remove(&locker_id);
            }
            if entry.is_unused() {
                locks.remove(lock_key);
            }
        }
        partition.cond.notify_all();
    }

    pub(crate) fn demote_to_shared(&self, locker_id: LockerId, lock_key: &LockKey, hash: u64) {
        let partition = self.partition(hash);
        let mut locks = partition.locks.lock();
        if let Some(entry) = locks.get_mut(lock_key) {
            if entry.owner == Some(locker_id) {
                entry.owner = None;
                entry.exclusive = false;
                entry.shared.insert(locker_id);
            }
        }
        partition.cond.notify_all();
    }

    pub(crate) fn demote_to_upgradable(&self, locker_id: LockerId, lock_key: &LockKey, hash: u64) {
        let partition = self.partition(hash);
        let mut locks = partition.locks.lock();
        if let Some(entry) = locks.get_mut(lock_key) {
            if entry.owner == Some(locker_id) {
                entry.exclusive = false;
            }
        }
        partition.cond.notify_all();
    }

    /// Lockers that `waiter` is blocked behind on `lock_key`: the owner,
    /// the shared holders, and the FIFO waiters queued ahead of it — the
    /// lock goes to whoever is next in line, so a queued-ahead waiter is
    /// as real a dependency as a current owner.
    fn holders_of(&self, lock_key: &LockKey, waiter: LockerId) -> Vec<LockerId> {
        let partition = self.partition(lock_hash(lock_key.index_id, &lock_key.key));
        let locks = partition.locks.lock();
        let mut out = Vec::new();
        if let Some(entry) = locks.get(lock_key) {
            if let Some(owner) = entry.owner {
                out.push(owner);
            }
            out.extend(entry.shared.iter().copied());
            match entry.queue_ux.iter().position(|w| *w == waiter) {
                Some(i) => out.extend(entry.queue_ux.iter().take(i).copied()),
                // a waiter not in this queue (shared or upgrading) is
                // gated by every queued upgradable/exclusive waiter
                None => out.extend(entry.queue_ux.iter().copied()),
            }
            if let Some(i) = entry.queue_s.iter().position(|w| *w == waiter) {
                out.extend(entry.queue_s.iter().take(i).copied());
            }
        }
        // an upgrading owner depends on the other holders, never on itself
        out.retain(|&holder| holder != waiter);
        out
    }

    /// Depth-limited cycle search over the wait-for graph, run after a
    /// timeout so the common path stays cheap. Returns the cycle's lock set
    /// and the guilty locker (the one most recently added to the cycle).
    pub(crate) fn detect_deadlock(
        &self,
        origin: LockerId,
        origin_key: &LockKey,
    ) -> Option<(Vec<DeadlockInfo>, LockerId)> {
        let waiting = self.waiting.lock().clone();
        let mut cycle = Vec::new();
        let mut seen = HashSet::new();
        if self.search_cycle(
            origin,
            origin_key,
            origin,
            &waiting,
            &mut cycle,
            &mut seen,
            DEADLOCK_SEARCH_DEPTH,
        ) {
            let guilty = cycle.last().map(|(l, _)| *l).unwrap_or(origin);
            let infos = cycle
                .into_iter()
                .map(|(_, k)| DeadlockInfo {
                    index_id: k.index_id,
                    key: k.key.into_vec(),
                })
                .collect();
            debug!("deadlock detected for locker {origin}");
            Some((infos, guilty))
        } else {
            None
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn search_cycle(
        &self,
        origin: LockerId,
        lock_key: &LockKey,
        waiter: LockerId,
        waiting: &HashMap<LockerId, LockKey>,
        cycle: &mut Vec<(LockerId, LockKey)>,
        seen: &mut HashSet<LockerId>,
        depth: usize,
    ) -> bool {
        if depth == 0 {
            return false;
        }
        for holder in self.holders_of(lock_key, waiter) {
            if holder == origin {
                cycle.push((holder, lock_key.clone()));
                return true;
            }
            if !seen.insert(holder) {
                continue;
            }
            if let Some(next_key) = waiting.get(&holder) {
                cycle.push((holder, lock_key.clone()));
                if self.search_cycle(origin, next_key, holder, waiting, cycle, seen, depth - 1) {
                    return true;
                }
                cycle.pop();
            }
        }
        false
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WaitGoal {
    Shared,
    Upgradable,
    Exclusive,
    /// Upgradable owner waiting for shared holders to drain.
    Upgrade,
    /// Sole-shared holder waiting to become exclusive (Unchecked rule).
    UpgradeFromShared,
}

impl WaitGoal {
    fn result(self) -> LockResult {
        match self {
            WaitGoal::Shared | WaitGoal::Upgradable | WaitGoal::Exclusive => LockResult::Acquired,
            WaitGoal::Upgrade | WaitGoal::UpgradeFromShared => LockResult::Upgraded,
        }
    }
}

fn grantable(entry: &LockEntry, mode: LockMode) -> bool {
    match mode {
        // shared coexists with shared and an upgradable owner, but queued
        // upgradable/exclusive waiters go first
        LockMode::Shared => !entry.exclusive && entry.queue_ux.is_empty(),
        LockMode::Upgradable => entry.owner.is_none() && entry.queue_ux.is_empty(),
        LockMode::Exclusive => {
            entry.owner.is_none() && entry.shared.is_empty() && entry.queue_ux.is_empty()
        }
    }
}

fn grant(entry: &mut LockEntry, mode: LockMode, locker_id: LockerId) {
    match mode {
        LockMode::Shared => {
            entry.shared.insert(locker_id);
        }
        LockMode::Upgradable => {
            entry.owner = Some(locker_id);
            entry.exclusive = false;
        }
        LockMode::Exclusive => {
            entry.owner = Some(locker_id);
            entry.exclusive = true;
        }
    }
}

fn goal_grantable(entry: &LockEntry, locker_id: LockerId, goal: WaitGoal) -> bool {
    match goal {
        WaitGoal::Shared => !entry.exclusive,
        WaitGoal::Upgradable => entry.owner.is_none(),
        WaitGoal::Exclusive => entry.owner.is_none() && entry.shared.is_empty(),
        WaitGoal::Upgrade => entry.owner == Some(locker_id) && entry.shared.is_empty(),
        WaitGoal::UpgradeFromShared => {
            entry.owner.is_none() && entry.shared.len() == 1 && entry.shared.contains(&locker_id)
        }
    }
}

fn apply_goal(entry: &mut LockEntry, locker_id: LockerId, goal: WaitGoal) {
    match goal {
        WaitGoal::Shared => grant(entry, LockMode::Shared, locker_id),
        WaitGoal::Upgradable => grant(entry, LockMode::Upgradable, locker_id),
        WaitGoal::Exclusive => grant(entry, LockMode::Exclusive, locker_id),
        WaitGoal::Upgrade => entry.exclusive = true,
        WaitGoal::UpgradeFromShared => {
            entry.shared.remove(&locker_id);
            entry.owner = Some(locker_id);
            entry.exclusive = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manager() -> Arc<LockManager> {
        Arc::new(LockManager::new(UpgradeRule::Lenient))
    }

    fn key(b: &[u8]) -> (LockKey, u64) {
        (LockKey::new(1, b), lock_hash(1, b))
    }

    #[test]
    fn shared_holders_coexist_and_block_exclusive() {
        let mgr = manager();
        let (a, fa) = mgr.register_locker();
        let (b, fb) = mgr.register_locker();
        let (k, h) = key(b"row");

        assert_eq!(
            mgr.try_lock(LockMode::Shared, a, &fa, &k, h, 0),
            LockResult::Acquired
        );
        assert_eq!(
            mgr.try_lock(LockMode::Shared, b, &fb, &k, h, 0),
            LockResult::Acquired
        );
        let (c, fc) = mgr.register_locker();
        assert_eq!(
            mgr.try_lock(LockMode::Exclusive, c, &fc, &k, h, 0),
            LockResult::TimedOut
        );
        mgr.clear_waiting(c);

        mgr.release(a, &k, h);
        mgr.release(b, &k, h);
        assert_eq!(
            mgr.try_lock(LockMode::Exclusive, c, &fc, &k, h, 0),
            LockResult::Acquired
        );
    }

    #[test]
    fn transition_table_owned_answers() {
        let mgr = manager();
        let (a, fa) = mgr.register_locker();
        let (k, h) = key(b"row");

        assert_eq!(
            mgr.try_lock(LockMode::Upgradable, a, &fa, &k, h, 0),
            LockResult::Acquired
        );
        assert_eq!(
            mgr.try_lock(LockMode::Shared, a, &fa, &k, h, 0),
            LockResult::OwnedUpgradable
        );
        assert_eq!(
            mgr.try_lock(LockMode::Upgradable, a, &fa, &k, h, 0),
            LockResult::OwnedUpgradable
        );
        // upgradable to exclusive with no shared holders: immediate
        assert_eq!(
            mgr.try_lock(LockMode::Exclusive, a, &fa, &k, h, -1),
            LockResult::Upgraded
        );
        assert_eq!(
            mgr.try_lock(LockMode::Shared, a, &fa, &k, h, 0),
            LockResult::OwnedExclusive
        );
    }

    #[test]
    fn shared_to_upgradable_is_illegal() {
        let mgr = manager();
        let (a, fa) = mgr.register_locker();
        let (k, h) = key(b"row");
        assert_eq!(
            mgr.try_lock(LockMode::Shared, a, &fa, &k, h, 0),
            LockResult::Acquired
        );
        assert_eq!(
            mgr.try_lock(LockMode::Upgradable, a, &fa, &k, h, 0),
            LockResult::Illegal
        );
    }

    #[test]
    fn lenient_rule_upgrades_sole_shared_holder() {
        let mgr = manager();
        let (a, fa) = mgr.register_locker();
        let (k, h) = key(b"row");
        assert_eq!(
            mgr.try_lock(LockMode::Shared, a, &fa, &k, h, 0),
            LockResult::Acquired
        );
        assert_eq!(
            mgr.try_lock(LockMode::Exclusive, a, &fa, &k, h, 0),
            LockResult::Upgraded
        );
    }

    #[test]
    fn strict_rule_refuses_shared_upgrade() {
        let mgr = Arc::new(LockManager::new(UpgradeRule::Strict));
        let (a, fa) = mgr.register_locker();
        let (k, h) = key(b"row");
        assert_eq!(
            mgr.try_lock(LockMode::Shared, a, &fa, &k, h, 0),
            LockResult::Acquired
        );
        assert_eq!(
            mgr.try_lock(LockMode::Exclusive, a, &fa, &k, h, 0),
            LockResult::Illegal
        );
    }

    #[test]
    fn blocking_wait_succeeds_after_release() {
        let mgr = manager();
        let (a, fa) = mgr.register_locker();
        let (b, fb) = mgr.register_locker();
        let (k, h) = key(b"row");
        assert_eq!(
            mgr.try_lock(LockMode::Exclusive, a, &fa, &k, h, 0),
            LockResult::Acquired
        );

        let mgr2 = Arc::clone(&mgr);
        let k2 = k.clone();
        let waiter = thread::spawn(move || {
            mgr2.try_lock(LockMode::Exclusive, b, &fb, &k2, h, 2_000_000_000)
        });
        thread::sleep(Duration::from_millis(50));
        mgr.release(a, &k, h);
        assert_eq!(waiter.join().unwrap(), LockResult::Acquired);
    }

    #[test]
    fn interrupt_wakes_waiter() {
        let mgr = manager();
        let (a, fa) = mgr.register_locker();
        let (b, fb) = mgr.register_locker();
        let (k, h) = key(b"row");
        assert_eq!(
            mgr.try_lock(LockMode::Exclusive, a, &fa, &k, h, 0),
            LockResult::Acquired
        );

        let mgr2 = Arc::clone(&mgr);
        let k2 = k.clone();
        let waiter =
            thread::spawn(move || mgr2.try_lock(LockMode::Exclusive, b, &fb, &k2, h, -1));
        thread::sleep(Duration::from_millis(50));
        mgr.interrupt(b);
        assert_eq!(waiter.join().unwrap(), LockResult::Interrupted);
    }

    #[test]
    fn deadlock_through_queued_waiter_is_found() {
        let mgr = manager();
        let (a, fa) = mgr.register_locker();
        let (c, fc) = mgr.register_locker();
        let (w, fw) = mgr.register_locker();
        let (kb, hb) = key(b"b");
        let (kc, hc) = key(b"c");

        // C owns "b"; W owns "c"
        assert_eq!(
            mgr.try_lock(LockMode::Exclusive, c, &fc, &kb, hb, 0),
            LockResult::Acquired
        );
        assert_eq!(
            mgr.try_lock(LockMode::Exclusive, w, &fw, &kc, hc, 0),
            LockResult::Acquired
        );

        // C waits for "c" in the background
        let c_waiter = {
            let mgr = Arc::clone(&mgr);
            let kc = kc.clone();
            thread::spawn(move || mgr.try_lock(LockMode::Exclusive, c, &fc, &kc, hc, -1))
        };
        // W queues on "b" behind A (below), closing the cycle through A's
        // queue position rather than through any owner
        let w_waiter = {
            let mgr = Arc::clone(&mgr);
            let kb = kb.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                mgr.try_lock(LockMode::Exclusive, w, &fw, &kb, hb, -1)
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(
            mgr.try_lock(LockMode::Exclusive, a, &fa, &kb, hb, 600_000_000),
            LockResult::TimedOut
        );
        // A -> "b" -> C (owner) -> "c" -> W -> "b" -> A (queued ahead of W):
        // the cycle only closes through the queue edge
        let found = mgr.detect_deadlock(a, &kb);
        assert!(found.is_some(), "queued-ahead waiter must appear in the graph");
        mgr.clear_waiting(a);

        mgr.interrupt(c);
        mgr.interrupt(w);
        assert_eq!(c_waiter.join().unwrap(), LockResult::Interrupted);
        assert_eq!(w_waiter.join().unwrap(), LockResult::Interrupted);
        mgr.release(c, &kb, hb);
        mgr.release(w, &kc, hc);
    }

    #[test]
    fn deadlock_cycle_is_found() {
        let mgr = manager();
        let (a, fa) = mgr.register_locker();
        let (b, fb) = mgr.register_locker();
        let (ka, ha) = key(b"a");
        let (kb, hb) = key(b"b");

        assert_eq!(
            mgr.try_lock(LockMode::Exclusive, a, &fa, &ka, ha, 0),
            LockResult::Acquired
        );
        assert_eq!(
            mgr.try_lock(LockMode::Exclusive, b, &fb, &kb, hb, 0),
            LockResult::Acquired
        );

        // b waits for a's lock in the background
        let mgr2 = Arc::clone(&mgr);
        let ka2 = ka.clone();
        let waiter = thread::spawn(move || {
            mgr2.try_lock(LockMode::Exclusive, b, &fb, &ka2, ha, 500_000_000)
        });
        thread::sleep(Duration::from_millis(50));

        // a requesting b's lock closes the cycle
        assert_eq!(
            mgr.try_lock(LockMode::Exclusive, a, &fa, &kb, hb, 100_000_000),
            LockResult::TimedOut
        );
        let found = mgr.detect_deadlock(a, &kb);
        assert!(found.is_some());
        mgr.clear_waiting(a);

        mgr.release(a, &ka, ha);
        assert_eq!(waiter.join().unwrap(), LockResult::Acquired);
    }
}
