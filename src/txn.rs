//! Transactions: lock acquisition policy, the in-memory undo list, ghost
//! bookkeeping and redo emission, layered over the tree's latch-level
//! operations.
//!
//! Writers take exclusive row locks before mutating and hold them to the
//! end of the transaction. Reads take shared locks and keep them too, so
//! re-reading a key inside one transaction is repeatable. Transactional
//! deletes only ghost the entry; the physical removal happens at commit,
//! under the still-held exclusive lock.

use log::debug;

use crate::config::RedoPolicy;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::lock::{Interrupter, LockMode, Locker};
use crate::tree::Tree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    RolledBack,
}

struct UndoEntry {
    tree: Tree,
    key: Vec<u8>,
    prior: Option<Vec<u8>>,
}

pub struct Transaction {
    db: Db,
    id: u64,
    locker: Locker,
    state: TxnState,
    entered: bool,
    durable: bool,
    undo: Vec<UndoEntry>,
    ghosts: Vec<(Tree, Vec<u8>)>,
    lock_timeout_nanos: i64,
}

impl Transaction {
    pub(crate) fn new(db: Db, id: u64, locker: Locker, lock_timeout_nanos: i64) -> Self {
        Self {
            db,
            id,
            locker,
            state: TxnState::Active,
            entered: false,
            durable: true,
            undo: Vec::new(),
            ghosts: Vec::new(),
            lock_timeout_nanos,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Per-request lock timeout in nanoseconds; negative waits forever,
    /// zero makes every lock request try-only.
    pub fn set_lock_timeout_nanos(&mut self, nanos: i64) {
        self.lock_timeout_nanos = nanos;
    }

    /// A non-durable transaction skips redo logging; a crash may lose it
    /// even after commit. Trees opened with `RedoPolicy::AlwaysRedo` log
    /// regardless.
    pub fn set_durable(&mut self, durable: bool) {
        self.durable = durable;
    }

    fn logs_for(&self, tree: &Tree) -> bool {
        self.durable || tree.shared.redo_policy == RedoPolicy::AlwaysRedo
    }

    /// Handle for interrupting this transaction's lock waits from another
    /// thread.
    pub fn interrupter(&self) -> Interrupter {
        self.locker.interrupter()
    }

    fn check_active(&self) -> Result<()> {
        match self.state {
            TxnState::Active => Ok(()),
            TxnState::Committed => Err(Error::InvalidTransactionState(
                "transaction already committed".into(),
            )),
            TxnState::RolledBack => Err(Error::InvalidTransactionState(
                "transaction already rolled back".into(),
            )),
        }
    }

    /// Open a nested lock scope (savepoint). Locks acquired after this are
    /// released by the matching `scope_exit`.
    pub fn scope_enter(&mut self) -> Result<()> {
        self.check_active()?;
        self.locker.scope_enter();
        Ok(())
    }

    /// Close the innermost scope, releasing the locks it acquired. An
    /// upgraded lock reverts to upgradable rather than releasing.
    pub fn scope_exit(&mut self) -> Result<()> {
        self.check_active()?;
        self.locker.scope_exit();
        Ok(())
    }

    /// Merge the innermost scope into its parent, retaining its locks.
    pub fn promote_scope(&mut self) -> Result<()> {
        self.check_active()?;
        self.locker.promote();
        Ok(())
    }

    fn note_entered(&mut self) -> Result<()> {
        if !self.entered {
            self.entered = true;
            self.db.redo_with(|redo| redo.txn_enter(self.id))?;
        }
        Ok(())
    }

    /// Make every change durable and visible. Ghosted entries are deleted
    /// for real while their exclusive locks are still held, then all locks
    /// release.
    pub fn commit(mut self) -> Result<()> {
        self.check_active()?;
        self.db.check_poison()?;
        let result = self.commit_inner();
        match &result {
            Ok(()) => self.state = TxnState::Committed,
            Err(_) => {
                // a failed commit leaves the transaction rolled back
                let _ = self.rollback_inner();
                self.state = TxnState::RolledBack;
            }
        }
        result
    }

    fn commit_inner(&mut self) -> Result<()> {
        let db = self.db.clone();
        let inner = db.inner_handle();
        let _commit = inner.commit_latch.read();
        if self.entered {
            self.db.redo_with(|redo| redo.txn_commit_final(self.id))?;
        }
        for (tree, key) in std::mem::take(&mut self.ghosts) {
            db.guard(tree.delete_ghost_locked(&key))?;
        }
        self.undo.clear();
        self.locker.release_all();
        debug!("txn {} committed", self.id);
        Ok(())
    }

    /// Undo every change and release all locks.
    pub fn rollback(mut self) -> Result<()> {
        self.check_active()?;
        let result = self.rollback_inner();
        self.state = TxnState::RolledBack;
        result
    }

    fn rollback_inner(&mut self) -> Result<()> {
        let db = self.db.clone();
        let inner = db.inner_handle();
        let _commit = inner.commit_latch.read();
        // newest change first, so a key touched twice lands on its oldest
        // prior state
        for entry in std::mem::take(&mut self.undo).into_iter().rev() {
            let result = match &entry.prior {
                Some(prior) => entry.tree.store_locked(&entry.key, Some(prior)).map(|_| ()),
                None => entry
                    .tree
                    .store_locked(&entry.key, None)
                    .and_then(|_| entry.tree.delete_ghost_locked(&entry.key)),
            };
            db.guard(result)?;
        }
        self.ghosts.clear();
        if self.entered {
            self.db.redo_with(|redo| redo.txn_rollback_final(self.id))?;
        }
        self.locker.release_all();
        debug!("txn {} rolled back", self.id);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            let _ = self.rollback_inner();
            self.state = TxnState::RolledBack;
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Tree {
    /// Read `key` under a shared row lock, which is held to the end of the
    /// transaction for repeatable reads.
    pub fn load(&self, txn: &mut Transaction, key: &[u8]) -> Result<Option<Vec<u8>>> {
        txn.check_active()?;
        let db = self.db()?;
        db.check_poison()?;
        self.check_key(key)?;
        txn.locker
            .lock(LockMode::Shared, self.index_id(), key, txn.lock_timeout_nanos)?;
        self.load_latched(key)
    }

    /// Insert or replace `key` under an exclusive row lock.
    pub fn store(&self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        txn.check_active()?;
        let db = self.db()?;
        db.check_poison()?;
        self.check_key(key)?;
        // the row lock comes first: lock waits must not hold up checkpoints
        txn.locker.lock(
            LockMode::Exclusive,
            self.index_id(),
            key,
            txn.lock_timeout_nanos,
        )?;
        let inner = db.inner_handle();
        let _commit = inner.commit_latch.read();
        let prior = db.guard(self.store_locked(key, Some(value)))?;
        txn.undo.push(UndoEntry {
            tree: self.clone(),
            key: key.to_vec(),
            prior,
        });
        if txn.logs_for(self) {
            txn.note_entered()?;
            db.redo_with(|redo| redo.txn_store(txn.id, self.index_id(), key, Some(value)))?;
        }
        Ok(())
    }

    /// Transactionally delete `key`: the entry is ghosted now and removed
    /// at commit. Returns whether the key was present.
    pub fn delete(&self, txn: &mut Transaction, key: &[u8]) -> Result<bool> {
        txn.check_active()?;
        let db = self.db()?;
        db.check_poison()?;
        self.check_key(key)?;
        txn.locker.lock(
            LockMode::Exclusive,
            self.index_id(),
            key,
            txn.lock_timeout_nanos,
        )?;
        let inner = db.inner_handle();
        let _commit = inner.commit_latch.read();
        let prior = db.guard(self.store_locked(key, None))?;
        let was_present = prior.is_some();
        if was_present {
            txn.ghosts.push((self.clone(), key.to_vec()));
            txn.undo.push(UndoEntry {
                tree: self.clone(),
                key: key.to_vec(),
                prior,
            });
            if txn.logs_for(self) {
                txn.note_entered()?;
                db.redo_with(|redo| redo.txn_store(txn.id, self.index_id(), key, None))?;
            }
        }
        Ok(was_present)
    }

    /// Auto-commit insert or replace.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let db = self.db()?;
        let mut txn = db.begin()?;
        self.store(&mut txn, key, value)?;
        txn.commit()
    }

    /// Auto-commit read.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let db = self.db()?;
        db.check_poison()?;
        self.load_latched(key)
    }

    /// Auto-commit delete. Returns whether the key was present.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let db = self.db()?;
        let mut txn = db.begin()?;
        let present = self.delete(&mut txn, key)?;
        txn.commit()?;
        Ok(present)
    }
}
