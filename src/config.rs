use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 65536;

const DEFAULT_CACHE_CAPACITY_NODES: usize = 256;
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Governs shared-to-exclusive lock upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeRule {
    /// Shared to exclusive is always illegal.
    Strict,
    /// Allowed when the requester is the sole shared owner.
    Lenient,
    /// Always attempt the upgrade.
    Unchecked,
}

/// Redo durability policy for a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoPolicy {
    /// Every committed mutation is written to the redo log.
    AlwaysRedo,
    /// Follow the owning transaction's durability choice.
    Default,
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    pub page_size: usize,
    pub cache_capacity_nodes: usize,
    pub lock_timeout: Duration,
    pub upgrade_rule: UpgradeRule,
    /// Hard ceiling on encoded key length for every tree.
    pub max_key_size: usize,
    pub redo_enabled: bool,
    pub read_only: bool,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity_nodes: DEFAULT_CACHE_CAPACITY_NODES,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            upgrade_rule: UpgradeRule::Lenient,
            max_key_size: 0, // derived from page_size when 0
            redo_enabled: true,
            read_only: false,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn cache_capacity_nodes(mut self, nodes: usize) -> Self {
        self.cache_capacity_nodes = nodes;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn upgrade_rule(mut self, rule: UpgradeRule) -> Self {
        self.upgrade_rule = rule;
        self
    }

    pub fn redo_enabled(mut self, enabled: bool) -> Self {
        self.redo_enabled = enabled;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Largest key the node layout can store: a full page must hold at least
    /// two max-size entries plus the header and vector overhead.
    pub fn effective_max_key_size(&self) -> usize {
        if self.max_key_size != 0 {
            return self.max_key_size;
        }
        ((self.page_size - 12) / 2 - 22).min(16383)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        let ps = self.page_size;
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&ps) || !ps.is_power_of_two() {
            return Err(crate::error::Error::Storage(format!(
                "page size must be a power of two in {MIN_PAGE_SIZE}..={MAX_PAGE_SIZE}, got {ps}"
            )));
        }
        if self.cache_capacity_nodes < 8 {
            return Err(crate::error::Error::Storage(
                "cache capacity must be at least 8 nodes".into(),
            ));
        }
        Ok(())
    }
}
