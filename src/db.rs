//! Engine handle: wires the page store, node cache, lock manager and redo
//! log together, owns the index catalog, and runs checkpoints and crash
//! recovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::lock::{LockManager, Locker};
use crate::redo::{RedoLog, RedoReader, RedoVisitor};
use crate::store::{FilePageStore, PageId, PageStore, STUB_PAGE};
use crate::tree::cache::NodeCache;
use crate::tree::node::Node;
use crate::tree::{init_empty_root, Tree, TreeShared};
use crate::txn::Transaction;

/// An embedded transactional key-value database. Cheap to clone; all
/// clones share one engine.
#[derive(Clone)]
pub struct Db {
    pub(crate) inner: Arc<DbInner>,
}

pub(crate) struct DbInner {
    pub config: DbConfig,
    pub store: Arc<dyn PageStore>,
    pub cache: Arc<NodeCache>,
    pub locks: Arc<LockManager>,
    /// Held shared by every write operation; checkpoint takes it exclusive
    /// to capture a structurally quiescent snapshot point.
    pub commit_latch: RwLock<()>,
    pub redo: Mutex<Option<RedoLog>>,
    pub catalog: Mutex<Catalog>,
    pub stub: Arc<Node>,
    /// Once set, every entry point refuses further work: a fatal invariant
    /// failure must not reach the store.
    pub poisoned: AtomicBool,
    pub next_txn_id: AtomicU64,
}

pub(crate) struct Catalog {
    next_index_id: u64,
    entries: HashMap<String, CatalogEntry>,
    open: HashMap<String, Tree>,
}

#[derive(Clone)]
struct CatalogEntry {
    index_id: u64,
    root_page: PageId,
}

impl Db {
    /// Open or create a database per the configuration. When a redo log
    /// from an unclean shutdown exists, it is replayed before the handle is
    /// returned.
    pub fn open(mut config: DbConfig) -> Result<Self> {
        config.validate()?;
        let exists = config.path.exists() && config.path.metadata()?.len() > 0;
        let store: Arc<dyn PageStore> = if exists {
            let store = FilePageStore::open(&config.path, config.read_only)?;
            // an existing file dictates the page size
            config.page_size = store.page_size();
            Arc::new(store)
        } else {
            if config.read_only {
                return Err(Error::Storage(format!(
                    "cannot create database in read-only mode: {:?}",
                    config.path
                )));
            }
            Arc::new(FilePageStore::create(&config.path, config.page_size)?)
        };
        config.max_key_size = config.effective_max_key_size();

        let cache = Arc::new(NodeCache::new(
            Arc::clone(&store),
            config.cache_capacity_nodes,
        ));
        let locks = Arc::new(LockManager::new(config.upgrade_rule));
        let catalog = Catalog::decode(&store.read_metadata()?)?;

        let stub = Arc::new(Node::new(STUB_PAGE, vec![0u8; config.page_size].into_boxed_slice()));
        stub.latch.acquire_exclusive();
        init_empty_root(&stub);
        stub.latch.release_exclusive();

        let db = Db {
            inner: Arc::new(DbInner {
                config,
                store,
                cache,
                locks,
                commit_latch: RwLock::new(()),
                redo: Mutex::new(None),
                catalog: Mutex::new(catalog),
                stub,
                poisoned: AtomicBool::new(false),
                next_txn_id: AtomicU64::new(1),
            }),
        };

        if db.inner.config.redo_enabled && !db.inner.config.read_only {
            let redo_path = redo_path(&db.inner.config.path);
            if exists && redo_path.exists() {
                db.recover(&redo_path)?;
            }
            *db.inner.redo.lock() = Some(RedoLog::create(&redo_path)?);
        }
        Ok(db)
    }

    fn recover(&self, redo_path: &Path) -> Result<()> {
        info!("replaying redo log {redo_path:?}");
        let mut reader = match RedoReader::open(redo_path) {
            Ok(reader) => reader,
            Err(err) => {
                warn!("unreadable redo log, skipping recovery: {err}");
                return Ok(());
            }
        };
        let mut applier = RedoApplier {
            db: self,
            pending: HashMap::new(),
        };
        reader.replay(&mut applier)?;
        // everything replayed is made durable before fresh logging starts
        self.checkpoint()
    }

    pub(crate) fn inner_handle(&self) -> &DbInner {
        &self.inner
    }

    pub fn check_poison(&self) -> Result<()> {
        if self.inner.poisoned.load(Ordering::Acquire) {
            return Err(Error::Poisoned);
        }
        Ok(())
    }

    /// Funnel for mutation results: a fatal error poisons the engine so no
    /// further write can persist damage.
    pub(crate) fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.inner.poisoned.store(true, Ordering::Release);
                warn!("engine poisoned: {err}");
            }
        }
        result
    }

    pub(crate) fn redo_with(
        &self,
        f: impl FnOnce(&mut RedoLog) -> Result<()>,
    ) -> Result<()> {
        let mut redo = self.inner.redo.lock();
        match redo.as_mut() {
            Some(log) => f(log),
            None => Ok(()),
        }
    }

    /// Open the named index, creating it when absent.
    pub fn index(&self, name: &str) -> Result<Tree> {
        self.index_with_policy(name, crate::config::RedoPolicy::Default)
    }

    /// `index`, with an explicit redo policy: an `AlwaysRedo` tree logs
    /// every committed mutation even for transactions marked non-durable.
    pub fn index_with_policy(
        &self,
        name: &str,
        redo_policy: crate::config::RedoPolicy,
    ) -> Result<Tree> {
        self.check_poison()?;
        let mut created = false;
        let tree = {
            let mut catalog = self.inner.catalog.lock();
            if let Some(tree) = catalog.open.get(name) {
                return Ok(tree.clone());
            }
            let (index_id, root) = match catalog.entries.get(name) {
                Some(entry) => {
                    let root = self.inner.cache.load_root(entry.root_page)?;
                    (entry.index_id, root)
                }
                None => {
                    if self.inner.config.read_only {
                        return Err(Error::ReadOnly);
                    }
                    created = true;
                    let index_id = catalog.next_index_id;
                    catalog.next_index_id += 1;
                    let root = self.inner.cache.alloc_new()?;
                    init_empty_root(&root);
                    // the catalog entry below becomes durable right away,
                    // so the page it points at must be readable
                    if let Err(err) = self.inner.store.write_page(root.id(), root.read().page()) {
                        let _ = self.inner.cache.delete_node(&root);
                        root.latch.release_exclusive();
                        return Err(err);
                    }
                    self.inner.cache.make_unevictable(&root);
                    root.latch.release_exclusive();
                    catalog.entries.insert(
                        name.to_string(),
                        CatalogEntry {
                            index_id,
                            root_page: root.id(),
                        },
                    );
                    (index_id, root)
                }
            };
            let shared = Arc::new(TreeShared {
                index_id,
                name: name.to_string(),
                root,
                stub: Arc::clone(&self.inner.stub),
                cache: Arc::clone(&self.inner.cache),
                max_key_size: self.inner.config.max_key_size,
                redo_policy,
                db: Arc::downgrade(&self.inner),
            });
            let tree = Tree::new(shared);
            catalog.open.insert(name.to_string(), tree.clone());
            tree
        };
        if created {
            // creation becomes durable immediately, so redo records that
            // reference the new index id resolve after a crash
            self.persist_catalog()?;
        }
        Ok(tree)
    }

    /// Drop the named index. Its root is closed, so operations against
    /// still-held `Tree` handles fail with `ClosedIndex`. The tree's pages
    /// are reclaimed lazily.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.check_poison()?;
        let removed = {
            let mut catalog = self.inner.catalog.lock();
            let tree = catalog.open.remove(name);
            let entry = catalog.entries.remove(name);
            if let Some(tree) = &tree {
                let root = &tree.shared.root;
                root.latch.acquire_exclusive();
                root.write().close();
                self.inner.cache.discard_node(root);
                root.latch.release_exclusive();
            }
            entry
        };
        let Some(entry) = removed else {
            return Ok(());
        };
        self.redo_with(|redo| redo.drop_index(entry.index_id))?;
        self.persist_catalog()
    }

    /// Rename an index without touching its contents.
    pub fn rename_index(&self, name: &str, new_name: &str) -> Result<()> {
        self.check_poison()?;
        let index_id = {
            let mut catalog = self.inner.catalog.lock();
            let Some(entry) = catalog.entries.remove(name) else {
                return Err(Error::Storage(format!("no such index: {name}")));
            };
            let index_id = entry.index_id;
            catalog.entries.insert(new_name.to_string(), entry);
            if let Some(tree) = catalog.open.remove(name) {
                catalog.open.insert(new_name.to_string(), tree);
            }
            index_id
        };
        self.redo_with(|redo| redo.rename_index(index_id, new_name.as_bytes()))?;
        self.persist_catalog()
    }

    pub(crate) fn tree_by_id(&self, index_id: u64) -> Result<Option<Tree>> {
        let name = {
            let catalog = self.inner.catalog.lock();
            if let Some(tree) = catalog
                .open
                .values()
                .find(|t| t.index_id() == index_id)
            {
                return Ok(Some(tree.clone()));
            }
            catalog
                .entries
                .iter()
                .find(|(_, e)| e.index_id == index_id)
                .map(|(name, _)| name.clone())
        };
        match name {
            Some(name) => Ok(Some(self.index(&name)?)),
            None => Ok(None),
        }
    }

    /// Start a transaction.
    pub fn begin(&self) -> Result<Transaction> {
        self.check_poison()?;
        let locker = Locker::new(Arc::clone(&self.inner.locks));
        let id = self.inner.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let timeout = self.inner.config.lock_timeout.as_nanos() as i64;
        Ok(Transaction::new(self.clone(), id, locker, timeout))
    }

    /// Catalog bytes with root ids refreshed from the open trees. Only
    /// valid at a checkpoint quiesce point: a refreshed root id becomes
    /// durable via the checkpoint's own flush, never before.
    fn encode_catalog_refreshed(&self) -> Vec<u8> {
        let mut catalog = self.inner.catalog.lock();
        let roots: Vec<(String, PageId)> = catalog
            .open
            .iter()
            .map(|(name, tree)| (name.clone(), tree.root_page_id()))
            .collect();
        for (name, root) in roots {
            if let Some(entry) = catalog.entries.get_mut(&name) {
                entry.root_page = root;
            }
        }
        catalog.encode()
    }

    /// Persist the catalog as stored (last-checkpoint root ids). Safe at
    /// any time; used when the name set changes.
    fn persist_catalog(&self) -> Result<()> {
        let bytes = self.inner.catalog.lock().encode();
        self.inner.store.write_metadata(&bytes)?;
        self.inner.store.sync(true)
    }

    /// Capture and persist a checkpoint: flip the dirty generation under
    /// the exclusive commit latch, write the previous generation out, sync,
    /// persist the catalog roots, then recycle pages retired before the
    /// prior checkpoint and truncate the redo log.
    pub fn checkpoint(&self) -> Result<()> {
        self.check_poison()?;
        if self.inner.config.read_only {
            return Ok(());
        }
        let (old_gen, dirty, metadata) = {
            let _quiesce = self.inner.commit_latch.write();
            let (old_gen, dirty) = self.inner.cache.flip_generation();
            (old_gen, dirty, self.encode_catalog_refreshed())
        };
        info!("checkpoint: writing {} dirty nodes", dirty.len());
        for node in &dirty {
            self.guard(self.inner.cache.flush_for_checkpoint(node, old_gen))?;
        }
        self.guard(self.inner.store.sync(false))?;
        self.guard(self.inner.store.write_metadata(&metadata))?;
        self.guard(self.inner.store.sync(true))?;
        self.guard(self.inner.cache.release_retired_pages())?;

        let mut redo = self.inner.redo.lock();
        let path = redo.as_ref().map(|log| log.path().to_path_buf());
        if let Some(path) = path {
            *redo = Some(RedoLog::create(path)?);
        }
        Ok(())
    }

    /// Checkpoint, write the shutdown record and release the handle.
    pub fn close(self) -> Result<()> {
        if !self.inner.poisoned.load(Ordering::Acquire) {
            self.checkpoint()?;
        }
        let mut redo = self.inner.redo.lock();
        if let Some(log) = redo.as_mut() {
            log.shutdown()?;
        }
        *redo = None;
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.config.read_only
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.inner.config.path)
            .field("page_size", &self.inner.config.page_size)
            .finish_non_exhaustive()
    }
}

impl Catalog {
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self {
                next_index_id: 1,
                entries: HashMap::new(),
                open: HashMap::new(),
            });
        }
        let mut cursor = std::io::Cursor::new(bytes);
        let next_index_id = cursor.read_u64::<LittleEndian>()?;
        let count = cursor.read_u16::<LittleEndian>()? as usize;
        let mut entries = HashMap::with_capacity(count);
        for _ in 0..count {
            let name_len = cursor.read_u16::<LittleEndian>()? as usize;
            let mut name = vec![0u8; name_len];
            std::io::Read::read_exact(&mut cursor, &mut name)?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::Storage("catalog name is not utf-8".into()))?;
            let index_id = cursor.read_u64::<LittleEndian>()?;
            let root_page = cursor.read_u64::<LittleEndian>()?;
            entries.insert(
                name,
                CatalogEntry {
                    index_id,
                    root_page,
                },
            );
        }
        Ok(Self {
            next_index_id,
            entries,
            open: HashMap::new(),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u64::<LittleEndian>(self.next_index_id)
            .expect("vec write");
        out.write_u16::<LittleEndian>(self.entries.len() as u16)
            .expect("vec write");
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        for name in names {
            let entry = &self.entries[name];
            out.write_u16::<LittleEndian>(name.len() as u16)
                .expect("vec write");
            out.extend_from_slice(name.as_bytes());
            out.write_u64::<LittleEndian>(entry.index_id).expect("vec write");
            out.write_u64::<LittleEndian>(entry.root_page).expect("vec write");
        }
        out
    }
}

fn redo_path(db_path: &Path) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "marten".into());
    name.push(".redo");
    db_path.with_file_name(name)
}

/// Replays logical redo records against the engine. Transactional stores
/// buffer until their commit record; rolled-back transactions apply
/// nothing.
struct RedoApplier<'a> {
    db: &'a Db,
    pending: HashMap<u64, Vec<(u64, Vec<u8>, Option<Vec<u8>>)>>,
}

impl RedoApplier<'_> {
    fn apply(&self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let Some(tree) = self.db.tree_by_id(index_id)? else {
            warn!("redo record for unknown index {index_id}, skipping");
            return Ok(());
        };
        match value {
            Some(value) => {
                tree.store_locked(key, Some(value))?;
            }
            None => {
                tree.store_locked(key, None)?;
                tree.delete_ghost_locked(key)?;
            }
        }
        Ok(())
    }

    fn apply_pending(&mut self, txn_id: u64) -> Result<()> {
        for (index_id, key, value) in self.pending.remove(&txn_id).unwrap_or_default() {
            self.apply(index_id, &key, value.as_deref())?;
        }
        Ok(())
    }
}

impl RedoVisitor for RedoApplier<'_> {
    fn reset(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn timestamp(&mut self, _timestamp: i64) -> Result<bool> {
        Ok(true)
    }

    fn shutdown(&mut self, _timestamp: i64) -> Result<bool> {
        Ok(true)
    }

    fn close(&mut self, _timestamp: i64) -> Result<bool> {
        Ok(true)
    }

    fn end_file(&mut self, _timestamp: i64) -> Result<bool> {
        Ok(true)
    }

    fn store(&mut self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        self.apply(index_id, key, value)?;
        Ok(true)
    }

    fn store_no_lock(&mut self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        self.apply(index_id, key, value)?;
        Ok(true)
    }

    fn drop_index(&mut self, index_id: u64) -> Result<bool> {
        let name = {
            let catalog = self.db.inner.catalog.lock();
            catalog
                .entries
                .iter()
                .find(|(_, e)| e.index_id == index_id)
                .map(|(name, _)| name.clone())
        };
        if let Some(name) = name {
            self.db.drop_index(&name)?;
        }
        Ok(true)
    }

    fn rename_index(&mut self, index_id: u64, new_name: &[u8]) -> Result<bool> {
        let new_name = String::from_utf8_lossy(new_name).into_owned();
        let name = {
            let catalog = self.db.inner.catalog.lock();
            catalog
                .entries
                .iter()
                .find(|(_, e)| e.index_id == index_id)
                .map(|(name, _)| name.clone())
        };
        if let Some(name) = name {
            if name != new_name {
                self.db.rename_index(&name, &new_name)?;
            }
        }
        Ok(true)
    }

    fn txn_enter(&mut self, txn_id: u64) -> Result<bool> {
        self.pending.entry(txn_id).or_default();
        Ok(true)
    }

    fn txn_rollback(&mut self, txn_id: u64) -> Result<bool> {
        self.pending.remove(&txn_id);
        Ok(true)
    }

    fn txn_rollback_final(&mut self, txn_id: u64) -> Result<bool> {
        self.pending.remove(&txn_id);
        Ok(true)
    }

    fn txn_commit(&mut self, _txn_id: u64) -> Result<bool> {
        Ok(true)
    }

    fn txn_commit_final(&mut self, txn_id: u64) -> Result<bool> {
        self.apply_pending(txn_id)?;
        Ok(true)
    }

    fn txn_store(
        &mut self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.pending
            .entry(txn_id)
            .or_default()
            .push((index_id, key.to_vec(), value.map(|v| v.to_vec())));
        Ok(true)
    }

    fn txn_store_commit_final(
        &mut self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.pending
            .entry(txn_id)
            .or_default()
            .push((index_id, key.to_vec(), value.map(|v| v.to_vec())));
        self.apply_pending(txn_id)?;
        Ok(true)
    }
}
