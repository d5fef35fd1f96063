//! marten: an embedded transactional key-value storage engine.
//!
//! Keys and values are opaque byte strings, ordered lexicographically by
//! key. A database holds any number of named indexes, each an independent
//! copy-on-write B+ tree backed by a single page file, with row-level
//! shared/upgradable/exclusive locking, deadlock detection, and a
//! write-ahead redo log for crash recovery.
//!
//! ```no_run
//! use marten::{Db, DbConfig};
//!
//! let db = Db::open(DbConfig::new("/tmp/example.mtdb"))?;
//! let people = db.index("people")?;
//!
//! let mut txn = db.begin()?;
//! people.store(&mut txn, b"ada", b"lovelace")?;
//! txn.commit()?;
//!
//! assert_eq!(people.get(b"ada")?.as_deref(), Some(&b"lovelace"[..]));
//! # Ok::<(), marten::Error>(())
//! ```

mod config;
mod db;
mod error;
mod latch;
mod lock;
mod redo;
mod store;
mod tree;
mod txn;

pub use crate::config::{DbConfig, RedoPolicy, UpgradeRule, DEFAULT_PAGE_SIZE};
pub use crate::db::Db;
pub use crate::error::{DeadlockInfo, Error, Result};
pub use crate::lock::{Interrupter, LockMode, LockResult};
pub use crate::redo::{RedoLog, RedoReader, RedoVisitor};
pub use crate::store::{
    CryptoPageStore, FilePageStore, MemPageStore, PageCipher, PageId, PageStore,
};
pub use crate::tree::{Cursor, Tree, TreeStats};
pub use crate::txn::Transaction;
