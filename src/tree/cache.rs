//! Bounded pool of resident tree nodes.
//!
//! Nodes are reachable only through the tree structure (parent child tables
//! and tree roots), never by page id: a page has exactly one parent, so the
//! single loading path per page keeps residency single-copy without a global
//! map. Eviction strips a victim's buffer and zeroes its id; stale parent
//! references detect the mismatch and re-fault.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::Result;
use crate::store::{PageId, PageStore, NO_PAGE, STUB_PAGE};
use crate::tree::node::{
    Node, NodeInner, CACHED_CLEAN, CACHED_DIRTY_A, CACHED_DIRTY_B,
};

pub(crate) struct NodeCache {
    store: Arc<dyn PageStore>,
    capacity: usize,
    pool: Mutex<Vec<Arc<Node>>>,
    access: AtomicU64,
    /// The active dirty generation: `CACHED_DIRTY_A` or `CACHED_DIRTY_B`.
    generation: AtomicU8,
    spares: Mutex<Vec<Box<[u8]>>>,
    /// Page ids retired in the current checkpoint interval. They stay out of
    /// the store's free pool until the *next* checkpoint commits, because
    /// the last durable snapshot may still reference them.
    pending_free: Mutex<Vec<PageId>>,
    ready_free: Mutex<Vec<PageId>>,
}

impl NodeCache {
    pub fn new(store: Arc<dyn PageStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity,
            pool: Mutex::new(Vec::new()),
            access: AtomicU64::new(0),
            generation: AtomicU8::new(CACHED_DIRTY_A),
            spares: Mutex::new(Vec::new()),
            pending_free: Mutex::new(Vec::new()),
            ready_free: Mutex::new(Vec::new()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    pub fn current_generation(&self) -> u8 {
        self.generation.load(Ordering::Acquire)
    }

    /// Touch the LRU stamp.
    pub fn used(&self, node: &Node) {
        let stamp = self.access.fetch_add(1, Ordering::Relaxed) + 1;
        node.last_access.store(stamp, Ordering::Relaxed);
    }

    // ---- allocation -------------------------------------------------------

    /// Pool a fresh node object with an unloaded buffer, exclusively
    /// latched.
    fn alloc_object(&self) -> Result<Arc<Node>> {
        self.evict_for_room();
        let buf = self.take_buffer();
        let node = Arc::new(Node::new(NO_PAGE, buf));
        node.latch.acquire_exclusive();
        self.used(&node);
        self.pool.lock().push(Arc::clone(&node));
        Ok(node)
    }

    /// Allocate a brand-new dirty node backed by a fresh page id. Returned
    /// exclusively latched; the caller initializes the page.
    pub fn alloc_new(&self) -> Result<Arc<Node>> {
        let node = self.alloc_object()?;
        let id = match self.store.allocate_page() {
            Ok(id) => id,
            Err(err) => {
                let buf = node.write().close();
                self.add_spare_buffer(buf);
                node.latch.release_exclusive();
                self.remove_from_pool(&node);
                return Err(err);
            }
        };
        node.set_id(id);
        node.cached_state
            .store(self.current_generation(), Ordering::Release);
        Ok(node)
    }

    /// `alloc_new`, pinned so eviction cannot pick it before a parent
    /// insert completes (split siblings).
    pub fn alloc_unevictable(&self) -> Result<Arc<Node>> {
        let node = self.alloc_new()?;
        node.unevictable.store(true, Ordering::Release);
        Ok(node)
    }

    pub fn make_evictable(&self, node: &Node) {
        node.unevictable.store(false, Ordering::Release);
    }

    pub fn make_unevictable(&self, node: &Node) {
        node.unevictable.store(true, Ordering::Release);
    }

    /// Fault a tree root by page id. Roots are pinned for the tree's
    /// lifetime.
    pub fn load_root(&self, id: PageId) -> Result<Arc<Node>> {
        let node = self.alloc_object()?;
        node.set_id(id);
        let loaded = self
            .store
            .read_page(id, node.write().page_mut())
            .and_then(|()| node.read().validate(id));
        match loaded {
            Ok(()) => {
                node.cached_state.store(CACHED_CLEAN, Ordering::Release);
                node.unevictable.store(true, Ordering::Release);
                node.latch.release_exclusive();
                Ok(node)
            }
            Err(err) => {
                let buf = node.write().close();
                self.add_spare_buffer(buf);
                node.latch.release_exclusive();
                self.remove_from_pool(&node);
                Err(err)
            }
        }
    }

    // ---- child faulting ---------------------------------------------------

    /// Fault a child into the parent's child table.
    ///
    /// The caller holds the parent's exclusive latch. The child shell is
    /// made visible (id set, inserted into the table, exclusively latched)
    /// before page I/O begins. With `exclusive = false` the parent latch is
    /// released before the read so long loads do not hold up the parent, and
    /// the child comes back share-latched; a second thread racing to the
    /// same entry parks on the child's latch until the load completes.
    /// With `exclusive = true` the parent stays latched (writer descents
    /// keep it for child-id maintenance) and the child comes back
    /// exclusively latched.
    pub fn fetch_child(
        &self,
        parent: &Arc<Node>,
        child_id: PageId,
        exclusive: bool,
    ) -> Result<Arc<Node>> {
        let child = self.alloc_object()?;
        child.set_id(child_id);
        parent
            .write()
            .children
            .insert(child_id, Arc::clone(&child));
        if !exclusive {
            parent.latch.release_exclusive();
        }

        let loaded = self
            .store
            .read_page(child_id, child.write().page_mut())
            .and_then(|()| child.read().validate(child_id));
        match loaded {
            Ok(()) => {
                child.cached_state.store(CACHED_CLEAN, Ordering::Release);
                self.used(&child);
                if !exclusive {
                    child.latch.downgrade();
                }
                Ok(child)
            }
            Err(err) => {
                child.set_id(NO_PAGE);
                let buf = child.write().close();
                self.add_spare_buffer(buf);
                child.latch.release_exclusive();
                self.remove_from_pool(&child);
                if exclusive {
                    parent.write().children.remove(&child_id);
                } else {
                    parent.latch.acquire_exclusive();
                    let ours = parent
                        .read()
                        .children
                        .get(&child_id)
                        .map_or(false, |cur| Arc::ptr_eq(cur, &child));
                    if ours {
                        parent.write().children.remove(&child_id);
                    }
                    parent.latch.release_exclusive();
                }
                Err(err)
            }
        }
    }

    // ---- dirty state ------------------------------------------------------

    /// Move a node into the current dirty generation, assigning it a fresh
    /// copy-on-write page id. Returns true when the id was replaced (the
    /// caller updates the parent's stored child id). Requires the node's
    /// exclusive latch.
    pub fn mark_dirty(&self, node: &Arc<Node>) -> Result<bool> {
        let gen = self.current_generation();
        let state = node.cached_state.load(Ordering::Acquire);
        if state == gen {
            return Ok(false);
        }
        if state != CACHED_CLEAN {
            // Previous-generation image not yet flushed; persist the
            // checkpoint snapshot before the node moves on.
            self.store.write_page(node.id(), node.read().page())?;
        }
        let old_id = node.id();
        let new_id = self.store.allocate_page()?;
        if old_id > STUB_PAGE {
            self.pending_free.lock().push(old_id);
        }
        node.set_id(new_id);
        node.cached_state.store(gen, Ordering::Release);
        Ok(true)
    }

    /// Resolve a node's dirty obligations ahead of deletion: an unflushed
    /// previous-generation image is written out so the in-flight checkpoint
    /// snapshot stays complete.
    pub fn prepare_to_delete(&self, node: &Arc<Node>) -> Result<()> {
        let gen = self.current_generation();
        let state = node.cached_state.load(Ordering::Acquire);
        if state != CACHED_CLEAN && state != gen {
            self.store.write_page(node.id(), node.read().page())?;
        }
        node.cached_state.store(CACHED_CLEAN, Ordering::Release);
        Ok(())
    }

    /// Retire a node: its page id joins the deferred free list and the
    /// object leaves the pool closed. Requires the exclusive latch.
    pub fn delete_node(&self, node: &Arc<Node>) -> Result<()> {
        self.prepare_to_delete(node)?;
        let id = node.id();
        if id > STUB_PAGE {
            self.pending_free.lock().push(id);
        }
        node.set_id(NO_PAGE);
        let buf = node.write().close();
        self.add_spare_buffer(buf);
        self.remove_from_pool(node);
        Ok(())
    }

    /// Drop a node object from the pool without freeing its page (index
    /// drop: the pages are reclaimed lazily). Requires the exclusive latch;
    /// the node must already be closed.
    pub fn discard_node(&self, node: &Arc<Node>) {
        debug_assert!(node.read().is_closed());
        self.remove_from_pool(node);
    }

    // ---- eviction ---------------------------------------------------------

    fn evict_for_room(&self) {
        while self.pool.lock().len() >= self.capacity {
            if !self.evict_one() {
                // Every candidate was pinned, latched or bound; the pool
                // runs over capacity rather than blocking the allocation.
                debug!("node cache over capacity: no evictable node");
                return;
            }
        }
    }

    /// Evict the least-recently-used node that satisfies the victim rules:
    /// not pinned, no bound cursor frames, not mid-split, exclusive latch
    /// available without waiting, and no resident children. A candidate
    /// that fails any check is abandoned, not waited on.
    fn evict_one(&self) -> bool {
        let mut candidates: Vec<Arc<Node>> = self.pool.lock().clone();
        candidates.sort_by_key(|n| n.last_access.load(Ordering::Relaxed));

        for node in candidates {
            if node.unevictable.load(Ordering::Acquire) {
                continue;
            }
            if !node.latch.try_acquire_exclusive() {
                continue;
            }
            let evictable = {
                let inner = node.read();
                !node.unevictable.load(Ordering::Acquire)
                    && !inner.is_closed()
                    && inner.split.is_none()
                    && !node.has_frames()
                    && !(inner.is_internal() && has_resident_children(inner))
            };
            if !evictable {
                node.latch.release_exclusive();
                continue;
            }
            if node.cached_state.load(Ordering::Acquire) != CACHED_CLEAN {
                if let Err(err) = self.store.write_page(node.id(), node.read().page()) {
                    // Node state is untouched; the caller may retry another
                    // victim or surface the failure on the write path.
                    warn!("evicting node {} failed: {err}", node.id());
                    node.latch.release_exclusive();
                    continue;
                }
                node.cached_state.store(CACHED_CLEAN, Ordering::Release);
            }
            debug!("evicting node {}", node.id());
            node.set_id(NO_PAGE);
            let buf = node.write().close();
            self.add_spare_buffer(buf);
            node.latch.release_exclusive();
            self.remove_from_pool(&node);
            return true;
        }
        false
    }

    fn remove_from_pool(&self, node: &Arc<Node>) {
        let mut pool = self.pool.lock();
        if let Some(idx) = pool.iter().position(|n| Arc::ptr_eq(n, node)) {
            pool.swap_remove(idx);
        }
    }

    pub fn resident_count(&self) -> usize {
        self.pool.lock().len()
    }

    // ---- checkpoint support -----------------------------------------------

    /// Flip the dirty generation and return the previous generation's dirty
    /// nodes; the caller writes them out while new mutations dirty pages
    /// under the new generation.
    pub fn flip_generation(&self) -> (u8, Vec<Arc<Node>>) {
        let old = self.current_generation();
        let new = if old == CACHED_DIRTY_A { CACHED_DIRTY_B } else { CACHED_DIRTY_A };
        self.generation.store(new, Ordering::Release);
        let dirty = self
            .pool
            .lock()
            .iter()
            .filter(|n| n.cached_state.load(Ordering::Acquire) == old)
            .cloned()
            .collect();
        (old, dirty)
    }

    /// Write one captured node if it still carries the old generation.
    pub fn flush_for_checkpoint(&self, node: &Arc<Node>, old_gen: u8) -> Result<()> {
        node.latch.acquire_shared();
        let result = if node.cached_state.load(Ordering::Acquire) == old_gen
            && !node.read().is_closed()
        {
            match self.store.write_page(node.id(), node.read().page()) {
                Ok(()) => {
                    node.cached_state.store(CACHED_CLEAN, Ordering::Release);
                    Ok(())
                }
                Err(err) => Err(err),
            }
        } else {
            Ok(())
        };
        node.latch.release_shared();
        result
    }

    /// Release page ids retired before the previous checkpoint and age the
    /// current interval's retirements. Called after checkpoint metadata is
    /// durable.
    pub fn release_retired_pages(&self) -> Result<()> {
        let ready: Vec<PageId> = std::mem::take(&mut *self.ready_free.lock());
        for id in ready {
            self.store.free_page(id)?;
        }
        let pending: Vec<PageId> = std::mem::take(&mut *self.pending_free.lock());
        *self.ready_free.lock() = pending;
        Ok(())
    }

    // ---- spare buffers ----------------------------------------------------

    /// Take a scratch page buffer for compaction; callers return it on
    /// every exit path.
    pub fn remove_spare_buffer(&self) -> Box<[u8]> {
        self.take_buffer()
    }

    pub fn add_spare_buffer(&self, buf: Box<[u8]>) {
        if buf.len() != self.page_size() {
            return; // closed sentinel or foreign buffer
        }
        let mut spares = self.spares.lock();
        if spares.len() < 8 {
            spares.push(buf);
        }
    }

    fn take_buffer(&self) -> Box<[u8]> {
        if let Some(mut buf) = self.spares.lock().pop() {
            buf.fill(0);
            return buf;
        }
        vec![0u8; self.page_size()].into_boxed_slice()
    }
}

fn has_resident_children(inner: &NodeInner) -> bool {
    inner
        .children
        .iter()
        .any(|(id, child)| child.id() == *id)
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("capacity", &self.capacity)
            .field("resident", &self.resident_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemPageStore;
    use crate::tree::node::{FLAG_HIGH_EXTREMITY, FLAG_LOW_EXTREMITY, TYPE_LEAF};

    fn cache(capacity: usize) -> NodeCache {
        NodeCache::new(Arc::new(MemPageStore::new(512)), capacity)
    }

    fn init_leaf(node: &Arc<Node>) {
        node.write()
            .init(TYPE_LEAF, FLAG_LOW_EXTREMITY | FLAG_HIGH_EXTREMITY);
    }

    #[test]
    fn alloc_new_is_dirty_in_current_generation() {
        let cache = cache(8);
        let node = cache.alloc_new().unwrap();
        init_leaf(&node);
        assert_eq!(
            node.cached_state.load(Ordering::Acquire),
            cache.current_generation()
        );
        node.latch.release_exclusive();
    }

    #[test]
    fn mark_dirty_replaces_page_id_once_per_generation() {
        let cache = cache(8);
        let node = cache.alloc_new().unwrap();
        init_leaf(&node);
        let id = node.id();

        // already dirty in this generation: no-op
        assert!(!cache.mark_dirty(&node).unwrap());
        assert_eq!(node.id(), id);

        // flip, then the first dirtying replaces the id
        let (_old, _dirty) = cache.flip_generation();
        assert!(cache.mark_dirty(&node).unwrap());
        assert_ne!(node.id(), id);
        node.latch.release_exclusive();
    }

    #[test]
    fn eviction_skips_pinned_and_latched_nodes() {
        let cache = cache(4);
        let mut nodes = Vec::new();
        for _ in 0..4 {
            let node = cache.alloc_new().unwrap();
            init_leaf(&node);
            node.latch.release_exclusive();
            nodes.push(node);
        }
        cache.make_unevictable(&nodes[0]);
        assert!(nodes[1].latch.try_acquire_exclusive());

        // allocating a fifth node forces an eviction; 0 is pinned and 1 is
        // latched, so the victim is the least-recently-used of 2 and 3
        let extra = cache.alloc_new().unwrap();
        extra.latch.release_exclusive();
        assert_eq!(nodes[2].id(), NO_PAGE);
        assert!(nodes[3].id() != NO_PAGE);
        nodes[1].latch.release_exclusive();
    }

    #[test]
    fn retired_pages_wait_one_full_checkpoint() {
        let cache = cache(8);
        let node = cache.alloc_new().unwrap();
        init_leaf(&node);
        let first_id = node.id();
        cache.flip_generation();
        cache.mark_dirty(&node).unwrap();
        node.latch.release_exclusive();

        // first release only ages the retirement
        cache.release_retired_pages().unwrap();
        let probe = cache.store().allocate_page().unwrap();
        assert_ne!(probe, first_id);

        // second release actually frees it
        cache.release_retired_pages().unwrap();
        let recycled = cache.store().allocate_page().unwrap();
        assert_eq!(recycled, first_id);
    }
}
