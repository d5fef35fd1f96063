use thiserror::Error;

/// Identifies one lock involved in a deadlock cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockInfo {
    pub index_id: u64,
    pub key: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("key too large: {len} bytes (max {max})")]
    KeyTooLarge { len: usize, max: usize },

    #[error("value too large: {len} bytes (max {max})")]
    ValueTooLarge { len: usize, max: usize },

    #[error("corrupt page {page_id}: {detail}")]
    CorruptPage { page_id: u64, detail: String },

    #[error("index closed")]
    ClosedIndex,

    #[error("illegal lock upgrade")]
    IllegalUpgrade,

    #[error("lock request timed out")]
    LockTimeout,

    #[error("interrupted while waiting for lock")]
    LockInterrupted,

    #[error("deadlock detected ({} locks in cycle)", cycle.len())]
    Deadlock { cycle: Vec<DeadlockInfo>, guilty: u64 },

    #[error("invariant violated: {0}")]
    Assertion(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store is read-only")]
    ReadOnly,

    #[error("engine poisoned by earlier fatal error")]
    Poisoned,

    #[error("invalid transaction state: {0}")]
    InvalidTransactionState(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Fatal errors poison the engine: no further writes may reach the store.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Assertion(_) | Error::Poisoned)
    }

    pub(crate) fn corrupt(page_id: u64, detail: impl Into<String>) -> Self {
        Error::CorruptPage {
            page_id,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
