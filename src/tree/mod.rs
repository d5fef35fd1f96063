//! B+ tree operations over cached nodes: latch-coupled descent, in-node
//! mutation with the compact / rebalance / split escalation, split
//! finishing, and structural cleanup after deletes.
//!
//! Latch discipline: descents acquire parent before child and release the
//! parent once committed to a side. Read descents use shared latches and
//! route around in-progress splits; write descents take exclusive latches
//! along the whole path they may modify and move every touched node into
//! the current dirty generation (assigning copy-on-write page ids). Upward
//! steps (split finishing, empty-node removal) drop the child latch before
//! taking the parent, then re-latch and re-verify.

pub(crate) mod cache;
pub(crate) mod cursor;
pub(crate) mod node;

use std::sync::Arc;

use log::trace;

use crate::error::{Error, Result};
use crate::store::{PageId, STUB_PAGE};
use crate::tree::cache::NodeCache;
use crate::tree::cursor::{unbind_chain, Frame, FrameRef};
use crate::tree::node::{
    check_value_len, encoded_key_len, mid_key, value_encoding_len, EntrySpace, Node, NodeInner,
    Split, ValueRef, FLAG_HIGH_EXTREMITY, FLAG_LOW_EXTREMITY, HEADER_SIZE, TYPE_LEAF,
};

pub use cursor::Cursor;

/// One named index: an independent B+ tree sharing the database's node
/// cache and page store.
#[derive(Clone)]
pub struct Tree {
    pub(crate) shared: Arc<TreeShared>,
}

pub(crate) struct TreeShared {
    pub index_id: u64,
    pub name: String,
    pub root: Arc<Node>,
    /// Synthetic node (page id 1) that keeps stale cursor frames coherent
    /// after a structural change orphans their node.
    pub stub: Arc<Node>,
    pub cache: Arc<NodeCache>,
    pub max_key_size: usize,
    /// Redo durability policy for this tree.
    pub redo_policy: crate::config::RedoPolicy,
    /// Owning engine, for the transaction-surface entry points.
    pub db: std::sync::Weak<crate::db::DbInner>,
}

/// Leaf position produced by a bound descent: the frame chain, the latched
/// leaf, and the search result.
pub(crate) struct LeafPoint {
    pub frame: FrameRef,
    pub node: Arc<Node>,
    pub pos: i32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Left,
    Right,
}

/// Exclusively latched parties of a sibling donation.
struct Donation {
    parent: Arc<Node>,
    sibling: Arc<Node>,
    ci: usize,
    si: usize,
    sib_id: PageId,
}

impl Tree {
    pub(crate) fn new(shared: Arc<TreeShared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn index_id(&self) -> u64 {
        self.shared.index_id
    }

    pub(crate) fn root_page_id(&self) -> PageId {
        self.shared.root.id()
    }

    pub(crate) fn db(&self) -> Result<crate::db::Db> {
        self.shared
            .db
            .upgrade()
            .map(|inner| crate::db::Db { inner })
            .ok_or(Error::ClosedIndex)
    }

    /// Forward scanner over this tree.
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.clone())
    }

    fn max_entry_size(&self) -> usize {
        let page_size = self.shared.cache.page_size();
        (page_size - HEADER_SIZE) / 2 - 2
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.shared.max_key_size {
            return Err(Error::KeyTooLarge {
                len: key.len(),
                max: self.shared.max_key_size,
            });
        }
        Ok(())
    }

    // ---- read path --------------------------------------------------------

    /// Copy out the value for `key`, latch-consistent. Ghosted entries read
    /// as absent. Takes no row locks; lock-aware reads live on the
    /// transaction surface.
    pub(crate) fn load_latched(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        let (node, pos) = self.descend_read(key)?;
        let result = if pos >= 0 {
            node.read().leaf_value_bytes(pos as usize)
        } else {
            Ok(None)
        };
        node.latch.release_shared();
        result
    }

    /// Shared-latched descent to the leaf covering `key`. Returns the leaf
    /// with its shared latch held and the `binary_search` result. Binds no
    /// frames.
    fn descend_read(&self, key: &[u8]) -> Result<(Arc<Node>, i32)> {
        'restart: loop {
            let mut node = Arc::clone(&self.shared.root);
            node.latch.acquire_shared();
            loop {
                if node.read().is_closed() {
                    node.latch.release_shared();
                    if Arc::ptr_eq(&node, &self.shared.root) {
                        return Err(Error::ClosedIndex);
                    }
                    continue 'restart;
                }
                // A split is pending between sibling creation and the
                // parent insert; route to the side the key belongs to.
                let selected = node
                    .read()
                    .split
                    .as_ref()
                    .map(|split| split.select_node(&node, key));
                if let Some(selected) = selected {
                    if !Arc::ptr_eq(&selected, &node) {
                        selected.latch.acquire_shared();
                        node.latch.release_shared();
                        node = selected;
                        continue;
                    }
                }
                if node.read().is_leaf() {
                    match node.read().binary_search(key) {
                        Ok(pos) => return Ok((node, pos)),
                        Err(err) => {
                            node.latch.release_shared();
                            return Err(err);
                        }
                    }
                }

                let (idx, child_id) = match node.read().binary_search(key) {
                    Ok(pos) => {
                        let idx = NodeInner::internal_pos(pos);
                        (idx, node.read().child_id(idx))
                    }
                    Err(err) => {
                        node.latch.release_shared();
                        return Err(err);
                    }
                };

                if let Some(child) = node.read().children.get(&child_id).cloned() {
                    if child.id() == child_id {
                        child.latch.acquire_shared();
                        // the evictor may have raced between lookup and
                        // latch; a mismatch means the entry went stale
                        if child.id() == child_id {
                            self.shared.cache.used(&child);
                            node.latch.release_shared();
                            node = child;
                            continue;
                        }
                        child.latch.release_shared();
                    }
                }

                // Fault path: the shared latch cannot be upgraded in place,
                // so remember the change stamp, re-latch exclusively and
                // restart from the root if the node moved on meanwhile.
                let seq = node.seq();
                node.latch.release_shared();
                node.latch.acquire_exclusive();
                if node.seq() != seq || node.read().is_closed() || node.read().split.is_some() {
                    node.latch.release_exclusive();
                    trace!("descent restarting at root: node changed under released latch");
                    continue 'restart;
                }
                {
                    let inner = node.write();
                    if let Some(stale) = inner.children.get(&child_id) {
                        if stale.id() != child_id {
                            inner.children.remove(&child_id);
                        }
                    }
                }
                // Loads the child while the parent stays visible: the shell
                // enters the child table latched before I/O, and the parent
                // latch is released for the read's duration.
                let child = self.shared.cache.fetch_child(&node, child_id, false)?;
                node = child;
            }
        }
    }

    // ---- write path -------------------------------------------------------

    /// Exclusive descent for a mutation: every node on the path is moved
    /// into the current dirty generation (copy-on-write id assignment, with
    /// the parent's stored child id updated in the same latch hold) and a
    /// frame chain is bound for the structural operations that may follow.
    pub(crate) fn descend_dirty(&self, key: &[u8]) -> Result<LeafPoint> {
        'restart: loop {
            let root = Arc::clone(&self.shared.root);
            root.latch.acquire_exclusive();
            if root.read().is_closed() {
                root.latch.release_exclusive();
                return Err(Error::ClosedIndex);
            }
            if let Err(err) = self.shared.cache.mark_dirty(&root) {
                root.latch.release_exclusive();
                return Err(err);
            }
            let mut node = root;
            let mut chain: Option<FrameRef> = None;
            loop {
                if node.read().is_leaf() {
                    let pos = match node.read().binary_search(key) {
                        Ok(pos) => pos,
                        Err(err) => {
                            node.latch.release_exclusive();
                            abandon_chain(chain);
                            return Err(err);
                        }
                    };
                    let frame = Frame::new_ref(Arc::clone(&node), pos, chain.take());
                    if pos < 0 {
                        frame.lock().not_found_key = Some(key.to_vec().into_boxed_slice());
                    }
                    node.bind_frame(&frame);
                    return Ok(LeafPoint { frame, node, pos });
                }

                let (idx, child_id) = match node.read().binary_search(key) {
                    Ok(pos) => {
                        let idx = NodeInner::internal_pos(pos);
                        (idx, node.read().child_id(idx))
                    }
                    Err(err) => {
                        node.latch.release_exclusive();
                        abandon_chain(chain);
                        return Err(err);
                    }
                };

                let resident = {
                    let inner = node.write();
                    match inner.children.get(&child_id) {
                        Some(c) if c.id() == child_id => Some(Arc::clone(c)),
                        Some(_) => {
                            inner.children.remove(&child_id);
                            None
                        }
                        None => None,
                    }
                };
                let child = match resident {
                    Some(child) => {
                        child.latch.acquire_exclusive();
                        if child.id() == child_id {
                            child
                        } else {
                            child.latch.release_exclusive();
                            node.write().children.remove(&child_id);
                            match self.shared.cache.fetch_child(&node, child_id, true) {
                                Ok(child) => child,
                                Err(err) => {
                                    node.latch.release_exclusive();
                                    abandon_chain(chain);
                                    return Err(err);
                                }
                            }
                        }
                    }
                    None => match self.shared.cache.fetch_child(&node, child_id, true) {
                        Ok(child) => child,
                        Err(err) => {
                            node.latch.release_exclusive();
                            abandon_chain(chain);
                            return Err(err);
                        }
                    },
                };

                if child.read().split.is_some() {
                    // another writer is between sibling creation and the
                    // parent insert; step aside and retry
                    child.latch.release_exclusive();
                    node.latch.release_exclusive();
                    abandon_chain(chain.take());
                    std::thread::yield_now();
                    continue 'restart;
                }

                self.shared.cache.used(&child);
                match self.shared.cache.mark_dirty(&child) {
                    Ok(true) => {
                        let inner = node.write();
                        inner.set_child_id(idx, child.id());
                        inner.children.remove(&child_id);
                        inner.children.insert(child.id(), Arc::clone(&child));
                    }
                    Ok(false) => {}
                    Err(err) => {
                        child.latch.release_exclusive();
                        node.latch.release_exclusive();
                        abandon_chain(chain);
                        return Err(err);
                    }
                }

                let frame = Frame::new_ref(Arc::clone(&node), (idx * 2) as i32, chain.take());
                node.bind_frame(&frame);
                chain = Some(frame);
                node.latch.release_exclusive();
                node = child;
            }
        }
    }

    /// Insert or replace under an already-held row lock. `value = None`
    /// ghosts an existing entry (transactional delete). Returns the prior
    /// value for the undo log.
    pub(crate) fn store_locked(&self, key: &[u8], value: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        if let Some(v) = value {
            check_value_len(v.len())?;
            let encoded = encoded_key_len(key.len()) + value_encoding_len(v.len());
            if encoded > self.max_entry_size() {
                // oversized values belong to the fragment store, which this
                // build does not carry
                return Err(Error::ValueTooLarge {
                    len: v.len(),
                    max: self.max_entry_size(),
                });
            }
        }

        let point = self.descend_dirty(key)?;
        match self.store_at(&point, key, value) {
            Ok((old, latch_consumed)) => {
                if !latch_consumed {
                    point.node.latch.release_exclusive();
                }
                unbind_chain(&point.frame);
                Ok(old)
            }
            Err(err) => {
                point.node.latch.release_exclusive();
                unbind_chain(&point.frame);
                Err(err)
            }
        }
    }

    /// Returns the prior value and whether the leaf latch was consumed by a
    /// split (which releases every latch it touches).
    fn store_at(
        &self,
        point: &LeafPoint,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<(Option<Vec<u8>>, bool)> {
        let node = &point.node;
        if point.pos >= 0 {
            let pos = point.pos as usize;
            let old = node.read().leaf_value_bytes(pos)?;
            match value {
                Some(new_value) => loop {
                    match node.write().update_leaf_value(pos, new_value)? {
                        EntrySpace::Loc(_) => return Ok((old, false)),
                        EntrySpace::Compact => {
                            let spare = self.shared.cache.remove_spare_buffer();
                            let old_buf = node.write().compact(spare)?;
                            self.shared.cache.add_spare_buffer(old_buf);
                        }
                        EntrySpace::Full => {
                            // replacement does not fit even compacted:
                            // retire the entry and run the insert path
                            node.write().delete_leaf_entry(pos)?;
                            self.fix_frames_after_delete(node, pos, key);
                            point.frame.lock().pos = !(pos as i32);
                            let consumed = self.insert_at(point, pos, key, Some(new_value))?;
                            return Ok((old, consumed));
                        }
                    }
                },
                None => {
                    if old.is_some() {
                        node.write().ghost_leaf_entry(pos)?;
                    }
                    Ok((old, false))
                }
            }
        } else {
            match value {
                Some(_) => {
                    let ins = (!point.pos) as usize;
                    let consumed = self.insert_at(point, ins, key, value)?;
                    Ok((None, consumed))
                }
                // deleting an absent key is a no-op
                None => Ok((None, false)),
            }
        }
    }

    /// Create a fresh entry at `ins`, escalating through compaction,
    /// rebalance and finally a split. Returns true when the escalation
    /// consumed the leaf latch (split paths release everything).
    fn insert_at(&self, point: &LeafPoint, ins: usize, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
        let encoded = encoded_key_len(key.len()) + value_encoding_len(value.map_or(0, |v| v.len()));
        let node = Arc::clone(&point.node);
        let mut ins = ins;
        let mut rebalanced = false;
        loop {
            let space = node.write().create_leaf_entry(ins, encoded);
            match space {
                EntrySpace::Loc(loc) => {
                    node.write().write_leaf_entry(loc, key, value);
                    self.fix_frames_after_insert(&node, ins, key, &point.frame);
                    let mut frame = point.frame.lock();
                    frame.pos = ins as i32;
                    frame.not_found_key = None;
                    return Ok(false);
                }
                EntrySpace::Compact => {
                    let spare = self.shared.cache.remove_spare_buffer();
                    let old_buf = node.write().compact(spare)?;
                    self.shared.cache.add_spare_buffer(old_buf);
                }
                EntrySpace::Full => {
                    if !rebalanced {
                        rebalanced = true;
                        let needed = (encoded + 2)
                            .saturating_sub(node.read().available_bytes() + node.read().garbage());
                        if self.try_rebalance_leaf(&point.frame, &node, ins, needed)? {
                            // entries moved; recompute the insertion point
                            let pos = node.read().binary_search(key)?;
                            debug_assert!(pos < 0);
                            ins = (!pos) as usize;
                            continue;
                        }
                    }
                    return match self.split_leaf_and_insert(point, &node, ins, key, value) {
                        Ok(()) => Ok(true),
                        Err(err) => {
                            // the split path released everything; re-take
                            // the leaf latch so the caller's release pairs
                            node.latch.acquire_exclusive();
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    /// Bound frames at or after an inserted slot shift right by one entry.
    /// The inserting cursor's own frame is fixed by the caller.
    fn fix_frames_after_insert(&self, node: &Arc<Node>, ins: usize, key: &[u8], own: &FrameRef) {
        node.visit_frames(|frame_ref, frame| {
            if Arc::ptr_eq(frame_ref, own) {
                return;
            }
            if frame.pos >= 0 {
                if frame.pos as usize >= ins {
                    frame.pos += 2;
                }
            } else {
                let ipos = (!frame.pos) as usize;
                if ipos > ins {
                    frame.pos = !((ipos + 2) as i32);
                } else if ipos == ins {
                    // the gap now holds a live entry; route the waiting
                    // cursor by its cached search key
                    let after = frame.not_found_key.as_deref().map_or(false, |nk| nk > key);
                    if after {
                        frame.pos = !((ipos + 2) as i32);
                    }
                }
            }
        });
    }

    /// Bound frames after a removed slot shift left; a frame on the removed
    /// entry becomes a not-found frame at the gap.
    fn fix_frames_after_delete(&self, node: &Arc<Node>, pos: usize, key: &[u8]) {
        node.visit_frames(|_, frame| {
            if frame.pos >= 0 {
                let fpos = frame.pos as usize;
                if fpos == pos {
                    frame.pos = !(pos as i32);
                    frame.not_found_key = Some(key.to_vec().into_boxed_slice());
                } else if fpos > pos {
                    frame.pos -= 2;
                }
            } else {
                let ipos = (!frame.pos) as usize;
                if ipos > pos {
                    frame.pos = !((ipos - 2) as i32);
                }
            }
        });
    }

    // ---- split ------------------------------------------------------------

    /// Split the full leaf around the pending insert, then push the
    /// separator into the parent. Releases every latch it touches,
    /// including the caller's leaf latch.
    fn split_leaf_and_insert(
        &self,
        point: &LeafPoint,
        node: &Arc<Node>,
        ins: usize,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        if node.read().split.is_some() {
            return Err(Error::Assertion("split of split node".into()));
        }
        let sibling = self.shared.cache.alloc_unevictable()?;
        let outcome = node.write().split_leaf(sibling.write(), ins, key, value);
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                // the sibling never became reachable; give it back
                let _ = self.shared.cache.delete_node(&sibling);
                sibling.latch.release_exclusive();
                node.latch.release_exclusive();
                return Err(err);
            }
        };

        // Re-route frames bound to the split node. Frame positions are
        // still pre-split values, so plain offset arithmetic across the
        // boundary applies; the new entry's shift is applied afterwards to
        // whichever side received it.
        let boundary_bytes = outcome.boundary * 2;
        let sep = outcome.sep.clone();
        let own = Arc::clone(&point.frame);
        node.migrate_frames(
            &sibling,
            |frame| frame_belongs_right(frame, boundary_bytes, &sep, outcome.new_left),
            |frame| {
                if frame.pos >= 0 {
                    frame.pos -= boundary_bytes as i32;
                } else {
                    let ipos = (!frame.pos) as usize;
                    frame.pos = !((ipos.saturating_sub(boundary_bytes)) as i32);
                }
            },
        );
        {
            let target = if outcome.entry_in_sibling { &sibling } else { node };
            self.fix_frames_after_insert(target, outcome.entry_pos, key, &own);
        }
        // The storing cursor binds exactly where its entry landed.
        {
            let target = if outcome.entry_in_sibling { &sibling } else { node };
            let (old, rebound) = {
                let mut frame = own.lock();
                let rebind = frame
                    .node
                    .as_ref()
                    .map_or(true, |bound| !Arc::ptr_eq(bound, target));
                frame.pos = outcome.entry_pos as i32;
                frame.not_found_key = None;
                if rebind {
                    let old = frame.node.take();
                    frame.node = Some(Arc::clone(target));
                    (old, true)
                } else {
                    (None, false)
                }
            };
            if rebound {
                if let Some(old) = old {
                    old.unbind_frame(&own);
                }
                target.bind_frame(&own);
            }
        }

        node.write().split = Some(Split {
            new_left: outcome.new_left,
            sibling: Arc::clone(&sibling),
            key: sep,
        });
        sibling.latch.release_exclusive();
        self.finish_split(&point.frame, node)
    }

    /// Insert a pending split's separator into the parent, splitting the
    /// parent in turn when it is full. Enters with the splitting node
    /// exclusively latched; returns with no latches held.
    fn finish_split(&self, frame: &FrameRef, node: &Arc<Node>) -> Result<()> {
        let mut frame = Arc::clone(frame);
        let mut node = Arc::clone(node);
        loop {
            let parent_ref = frame.lock().parent.clone();
            let Some(parent_frame) = parent_ref else {
                // splitting the root
                let split = node
                    .write()
                    .split
                    .take()
                    .ok_or_else(|| Error::Assertion("root split descriptor vanished".into()))?;
                let result = self.finish_split_root(&node, split);
                node.latch.release_exclusive();
                return result;
            };

            // Latch order is parent before child: give up the child latch,
            // take the parent, re-take the child, and re-verify the split.
            node.latch.release_exclusive();
            let parent = loop {
                let parent = parent_frame
                    .lock()
                    .node
                    .clone()
                    .ok_or_else(|| cursor::frame_error("parent frame unbound mid-split"))?;
                parent.latch.acquire_exclusive();
                if parent.read().split.is_some() {
                    // someone else is finishing the parent's own split
                    parent.latch.release_exclusive();
                    std::thread::yield_now();
                    continue;
                }
                break parent;
            };
            node.latch.acquire_exclusive();
            let Some(split) = node.write().split.take() else {
                node.latch.release_exclusive();
                parent.latch.release_exclusive();
                return Ok(());
            };
            let Split { sibling, key: sep, new_left } = split;

            let klen = encoded_key_len(sep.len());
            let mut inserted = false;
            let mut rebalanced = false;
            let mut last_pos = None;
            loop {
                // the separator's slot moves when the parent rebalances, so
                // it is recomputed every round
                let spos = match parent.read().binary_search(&sep) {
                    Ok(pos) if pos < 0 => (!pos) as usize,
                    Ok(_) => {
                        node.write().split = Some(Split {
                            new_left,
                            sibling: Arc::clone(&sibling),
                            key: sep.clone(),
                        });
                        node.latch.release_exclusive();
                        parent.latch.release_exclusive();
                        return Err(Error::Assertion("split separator already in parent".into()));
                    }
                    Err(err) => {
                        node.write().split = Some(Split {
                            new_left,
                            sibling: Arc::clone(&sibling),
                            key: sep.clone(),
                        });
                        node.latch.release_exclusive();
                        parent.latch.release_exclusive();
                        return Err(err);
                    }
                };
                let child_idx = spos / 2;
                let new_child_index = if new_left { child_idx } else { child_idx + 1 };
                last_pos = Some((spos, new_child_index));

                let space = parent
                    .write()
                    .create_internal_entry(spos, klen, new_child_index, sibling.id());
                match space {
                    EntrySpace::Loc(loc) => {
                        parent.write().write_key_at(loc, &sep);
                        parent
                            .write()
                            .children
                            .insert(sibling.id(), Arc::clone(&sibling));
                        // child links at or after the new slot shifted right
                        parent.visit_frames(|_, f| {
                            if f.pos >= (new_child_index * 2) as i32 {
                                f.pos += 2;
                            }
                        });
                        // cursors that followed the moved half re-route
                        // through the sibling's slot
                        sibling.visit_frames(|_, f| {
                            if let Some(pf) = &f.parent {
                                pf.lock().pos = (new_child_index * 2) as i32;
                            }
                        });
                        self.shared.cache.make_evictable(&sibling);
                        inserted = true;
                        break;
                    }
                    EntrySpace::Compact => {
                        let spare = self.shared.cache.remove_spare_buffer();
                        let old_buf = parent.write().compact(spare)?;
                        self.shared.cache.add_spare_buffer(old_buf);
                    }
                    EntrySpace::Full => {
                        if !rebalanced {
                            rebalanced = true;
                            let needed = (klen + 2 + 8).saturating_sub(
                                parent.read().available_bytes() + parent.read().garbage(),
                            );
                            if self.try_rebalance_internal(
                                &parent_frame,
                                &parent,
                                spos,
                                needed,
                            )? {
                                continue;
                            }
                        }
                        break;
                    }
                }
            }
            node.latch.release_exclusive();
            if inserted {
                parent.latch.release_exclusive();
                return Ok(());
            }
            let Some((spos, new_child_index)) = last_pos else {
                parent.latch.release_exclusive();
                return Err(Error::Assertion("separator insert made no attempt".into()));
            };

            // Parent is full: split it and carry the separator upward.
            let parent_sibling = self.shared.cache.alloc_unevictable()?;
            let internal_outcome = parent.write().split_internal(
                parent_sibling.write(),
                spos,
                &sep,
                new_child_index,
                sibling.id(),
            );
            let internal_outcome = match internal_outcome {
                Ok(outcome) => outcome,
                Err(err) => {
                    let _ = self.shared.cache.delete_node(&parent_sibling);
                    parent_sibling.latch.release_exclusive();
                    parent.latch.release_exclusive();
                    return Err(err);
                }
            };

            // Hand the leaf-level sibling's Arc to whichever half now
            // stores its child id, and re-route internal frames across the
            // boundary.
            let boundary = parent.read().key_count();
            if find_child_slot(parent.read(), sibling.id()).is_some() {
                parent
                    .write()
                    .children
                    .insert(sibling.id(), Arc::clone(&sibling));
            } else {
                parent_sibling
                    .write()
                    .children
                    .insert(sibling.id(), Arc::clone(&sibling));
            }
            parent.migrate_frames(
                &parent_sibling,
                |f| (f.pos.max(0) as usize) / 2 > boundary,
                |f| {
                    let shifted = f.pos - ((boundary + 1) * 2) as i32;
                    f.pos = shifted.max(0);
                },
            );
            self.shared.cache.make_evictable(&sibling);
            parent.write().split = Some(Split {
                new_left: false,
                sibling: Arc::clone(&parent_sibling),
                key: internal_outcome.sep,
            });
            parent_sibling.latch.release_exclusive();

            // ascend: the parent is now the splitting node (still latched)
            frame = parent_frame;
            node = parent;
        }
    }

    /// Root split: the root page is reused for a new one-key internal node
    /// whose children are the two halves; the old root's contents move into
    /// a freshly allocated dirty node.
    fn finish_split_root(&self, root: &Arc<Node>, split: Split) -> Result<()> {
        let content = self.shared.cache.alloc_new()?;
        content.write().swap_page(root.write());

        let sibling = split.sibling;
        let bottom = content.read().is_leaf();
        let (left_id, right_id) = if split.new_left {
            (sibling.id(), content.id())
        } else {
            (content.id(), sibling.id())
        };
        root.write()
            .init_root_internal(bottom, &split.key, left_id, right_id)?;
        root.write()
            .children
            .insert(content.id(), Arc::clone(&content));
        root.write()
            .children
            .insert(sibling.id(), Arc::clone(&sibling));

        // Frames bound to the old root now belong to the content node; each
        // gains a parent frame bound to the new root at slot 0 or 2.
        let (content_pos, sibling_pos): (i32, i32) = if split.new_left { (2, 0) } else { (0, 2) };
        root.migrate_frames(
            &content,
            |_| true,
            |frame| {
                let parent = Frame::new_ref(Arc::clone(root), content_pos, None);
                root.bind_frame(&parent);
                frame.parent = Some(parent);
            },
        );
        // frames the leaf split already routed to the sibling need their
        // parent hooked to the new root as well
        sibling.visit_frames(|_, frame| {
            if frame.parent.is_none() {
                let parent = Frame::new_ref(Arc::clone(root), sibling_pos, None);
                root.bind_frame(&parent);
                frame.parent = Some(parent);
            }
        });

        self.shared.cache.make_evictable(&sibling);
        content.latch.release_exclusive();
        trace!("root split: tree {} grew a level", self.shared.name);
        Ok(())
    }

    // ---- rebalance --------------------------------------------------------

    /// Try to move entries to a sibling instead of splitting. Directions
    /// are attempted in a pseudo-random order seeded by the node id so a
    /// repeated workload does not always donate the same way.
    fn try_rebalance_leaf(
        &self,
        frame: &FrameRef,
        node: &Arc<Node>,
        ins: usize,
        needed: usize,
    ) -> Result<bool> {
        let order = if node.id() & 1 == 0 {
            [Direction::Left, Direction::Right]
        } else {
            [Direction::Right, Direction::Left]
        };
        for dir in order {
            if self.try_rebalance_leaf_dir(frame, node, ins, needed, dir)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn try_rebalance_leaf_dir(
        &self,
        frame: &FrameRef,
        node: &Arc<Node>,
        ins: usize,
        needed: usize,
        dir: Direction,
    ) -> Result<bool> {
        let vec_len = node.read().vec_len();
        if node.read().key_count() < 2 {
            return Ok(false);
        }
        // An insert at the edge belongs beyond anything this direction
        // could move; rebalance cannot help and the caller splits.
        match dir {
            Direction::Right if ins >= vec_len => return Ok(false),
            Direction::Left if ins == 0 => return Ok(false),
            _ => {}
        }

        let Some(latched) = self.try_latch_for_donation(frame, node, dir) else {
            return Ok(false);
        };
        let Donation { parent, sibling, ci, si, sib_id } = latched;
        if !sibling.read().is_leaf() {
            sibling.latch.release_exclusive();
            parent.latch.release_exclusive();
            return Ok(false);
        }

        let moved =
            self.do_rebalance_leaf(&parent, node, &sibling, ci, si, sib_id, ins, needed, dir);
        sibling.latch.release_exclusive();
        parent.latch.release_exclusive();
        moved
    }

    /// Try-latch the parent and the `dir` sibling for a donation, with the
    /// §4.6 verifications: parent not splitting, cached state matching, the
    /// parent still pointing here, and a sibling that exists, is resident,
    /// and is not mid-split. Everything comes back exclusively latched;
    /// `None` leaves no latches held.
    fn try_latch_for_donation(
        &self,
        frame: &FrameRef,
        node: &Arc<Node>,
        dir: Direction,
    ) -> Option<Donation> {
        let parent_frame = frame.lock().parent.clone()?;
        let parent = parent_frame.lock().node.clone()?;
        if !parent.latch.try_acquire_exclusive() {
            return None;
        }
        let ok = !parent.read().is_closed()
            && parent.read().split.is_none()
            && parent.cached_state.load(std::sync::atomic::Ordering::Acquire)
                == node.cached_state.load(std::sync::atomic::Ordering::Acquire);
        if !ok {
            parent.latch.release_exclusive();
            return None;
        }
        let ci = (parent_frame.lock().pos.max(0) as usize) / 2;
        let child_count = parent.read().child_count();
        if ci >= child_count || parent.read().child_id(ci) != node.id() {
            parent.latch.release_exclusive();
            return None;
        }
        let si = match dir {
            Direction::Left => {
                if ci == 0 {
                    parent.latch.release_exclusive();
                    return None;
                }
                ci - 1
            }
            Direction::Right => {
                if ci + 1 >= child_count {
                    parent.latch.release_exclusive();
                    return None;
                }
                ci + 1
            }
        };
        let sib_id = parent.read().child_id(si);
        let sibling = match parent.read().children.get(&sib_id).cloned() {
            Some(s) if s.id() == sib_id => s,
            _ => {
                // donating to a non-resident sibling is not worth a fault
                parent.latch.release_exclusive();
                return None;
            }
        };
        if !sibling.latch.try_acquire_exclusive() {
            parent.latch.release_exclusive();
            return None;
        }
        if sibling.read().split.is_some() || sibling.read().is_closed() {
            sibling.latch.release_exclusive();
            parent.latch.release_exclusive();
            return None;
        }
        Some(Donation { parent, sibling, ci, si, sib_id })
    }

    #[allow(clippy::too_many_arguments)]
    fn do_rebalance_leaf(
        &self,
        parent: &Arc<Node>,
        node: &Arc<Node>,
        sibling: &Arc<Node>,
        ci: usize,
        si: usize,
        sib_id: PageId,
        ins: usize,
        needed: usize,
        dir: Direction,
    ) -> Result<bool> {
        let n = node.read().key_count();

        // Pick how many entries to move. Walk from the donation end,
        // always leaving at least one entry, and never crossing the
        // insertion point.
        let mut move_count = 0usize;
        let mut freed = 0usize;
        let mut move_bytes = 0usize;
        while freed < needed && move_count + 1 < n {
            let idx = match dir {
                Direction::Right => n - 1 - move_count,
                Direction::Left => move_count,
            };
            let crosses = match dir {
                Direction::Right => ins > idx * 2,
                Direction::Left => ins < (idx + 1) * 2,
            };
            if crosses {
                break;
            }
            let len = node.read().leaf_entry_len(idx * 2)?;
            move_count += 1;
            freed += len + 2;
            move_bytes += len;
        }
        if move_count == 0 || freed < needed {
            return Ok(false);
        }
        // the receiver must absorb the entries, reclaiming its own garbage
        // if necessary
        if sibling.read().available_bytes() + sibling.read().garbage() < move_bytes + move_count * 2
        {
            return Ok(false);
        }

        let boundary = match dir {
            Direction::Right => n - move_count,
            Direction::Left => move_count,
        };
        // New separator between the final boundary pair. Valid for both
        // directions: entries [0, boundary) stay/go left of it.
        let sep = {
            let inner = node.read();
            let left_max = inner.key_at((boundary - 1) * 2)?;
            let right_min = inner.key_at(boundary * 2)?;
            mid_key(left_max, right_min)
        };
        let sep_index = match dir {
            Direction::Right => ci, // separator between node and right sibling
            Direction::Left => si,  // separator between left sibling and node
        };
        // The donation dirties the sibling; its copy-on-write id lands in
        // the parent in the same latch hold, before anything else moves.
        if self.shared.cache.mark_dirty(sibling)? {
            let inner = parent.write();
            inner.set_child_id(si, sibling.id());
            inner.children.remove(&sib_id);
            inner.children.insert(sibling.id(), Arc::clone(sibling));
        }
        if !self.replace_separator(parent, sep_index, &sep)? {
            return Ok(false);
        }

        // Move the entry bytes.
        match dir {
            Direction::Right => {
                // existing sibling frames shift right by the incoming count
                sibling.visit_frames(|_, f| {
                    if f.pos >= 0 {
                        f.pos += (move_count * 2) as i32;
                    } else {
                        let ipos = (!f.pos) as usize;
                        f.pos = !((ipos + move_count * 2) as i32);
                    }
                });
                for k in 0..move_count {
                    let pos = (n - 1 - k) * 2;
                    let (loc, len) = {
                        let inner = node.read();
                        (inner.entry_loc(pos), inner.leaf_entry_len(pos)?)
                    };
                    let bytes = node.read().page()[loc..loc + len].to_vec();
                    sibling.write().prepend_entry_bytes(&bytes)?;
                    node.write().delete_leaf_entry(pos)?;
                }
            }
            Direction::Left => {
                for _ in 0..move_count {
                    let (loc, len) = {
                        let inner = node.read();
                        (inner.entry_loc(0), inner.leaf_entry_len(0)?)
                    };
                    let bytes = node.read().page()[loc..loc + len].to_vec();
                    sibling.write().append_entry_bytes(&bytes)?;
                    node.write().delete_leaf_entry(0)?;
                }
            }
        }

        // Frame fixups. Donor frame positions were not adjusted during the
        // moves, so pre-move offsets still apply.
        let boundary_bytes = boundary * 2;
        let sib_base = match dir {
            Direction::Right => 0usize,
            Direction::Left => sibling.read().vec_len() - move_count * 2,
        };
        node.migrate_frames(
            sibling,
            |frame| {
                let ipos = if frame.pos >= 0 {
                    frame.pos as usize
                } else {
                    (!frame.pos) as usize
                };
                match dir {
                    Direction::Right => {
                        if frame.pos >= 0 {
                            ipos >= boundary_bytes
                        } else if ipos != boundary_bytes {
                            ipos > boundary_bytes
                        } else {
                            // the separator moved; an extra comparison of
                            // the cached search key decides the side
                            frame
                                .not_found_key
                                .as_deref()
                                .map_or(false, |nk| nk >= sep.as_ref())
                        }
                    }
                    Direction::Left => {
                        if frame.pos >= 0 {
                            ipos < boundary_bytes
                        } else if ipos != boundary_bytes {
                            ipos < boundary_bytes
                        } else {
                            frame
                                .not_found_key
                                .as_deref()
                                .map_or(false, |nk| nk < sep.as_ref())
                        }
                    }
                }
            },
            |frame| {
                match dir {
                    Direction::Right => {
                        if frame.pos >= 0 {
                            frame.pos -= boundary_bytes as i32;
                        } else {
                            let ipos = (!frame.pos) as usize;
                            frame.pos = !((ipos - boundary_bytes) as i32);
                        }
                    }
                    Direction::Left => {
                        if frame.pos >= 0 {
                            frame.pos += sib_base as i32;
                        } else {
                            let ipos = (!frame.pos) as usize;
                            frame.pos = !((ipos + sib_base) as i32);
                        }
                    }
                }
                if let Some(pf) = &frame.parent {
                    let mut pf = pf.lock();
                    match dir {
                        Direction::Right => pf.pos += 2,
                        Direction::Left => pf.pos -= 2,
                    }
                }
            },
        );
        // frames left on the donor after a left-donation slide down
        if dir == Direction::Left {
            node.visit_frames(|_, frame| {
                if frame.pos >= 0 {
                    frame.pos -= boundary_bytes as i32;
                } else {
                    let ipos = (!frame.pos) as usize;
                    frame.pos = !((ipos.saturating_sub(boundary_bytes)) as i32);
                }
            });
        }

        trace!(
            "rebalanced {move_count} entries {} from node {}",
            match dir {
                Direction::Right => "right",
                Direction::Left => "left",
            },
            node.id()
        );
        Ok(true)
    }

    /// Internal-node donation: rotate single (key, child) pairs through the
    /// shared parent separator until the node can take its pending
    /// separator. Directions follow the same pseudo-random order as leaves,
    /// and every latch is a try.
    fn try_rebalance_internal(
        &self,
        frame: &FrameRef,
        node: &Arc<Node>,
        ins: usize,
        needed: usize,
    ) -> Result<bool> {
        let order = if node.id() & 1 == 0 {
            [Direction::Left, Direction::Right]
        } else {
            [Direction::Right, Direction::Left]
        };
        for dir in order {
            if self.try_rebalance_internal_dir(frame, node, ins, needed, dir)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn try_rebalance_internal_dir(
        &self,
        frame: &FrameRef,
        node: &Arc<Node>,
        ins: usize,
        needed: usize,
        dir: Direction,
    ) -> Result<bool> {
        let vec_len = node.read().vec_len();
        if node.read().key_count() < 2 {
            return Ok(false);
        }
        match dir {
            Direction::Right if ins >= vec_len => return Ok(false),
            Direction::Left if ins == 0 => return Ok(false),
            _ => {}
        }

        let Some(latched) = self.try_latch_for_donation(frame, node, dir) else {
            return Ok(false);
        };
        let Donation { parent, sibling, ci, si, sib_id } = latched;
        if !sibling.read().is_internal() {
            sibling.latch.release_exclusive();
            parent.latch.release_exclusive();
            return Ok(false);
        }

        let moved =
            self.do_rebalance_internal(&parent, node, &sibling, ci, si, sib_id, ins, needed, dir);
        sibling.latch.release_exclusive();
        parent.latch.release_exclusive();
        moved
    }

    /// One rotation per step: the parent separator descends into the
    /// sibling together with the boundary child, and the node's boundary
    /// key ascends to the parent. A partial donation leaves the tree
    /// consistent; the caller splits when not enough was freed.
    #[allow(clippy::too_many_arguments)]
    fn do_rebalance_internal(
        &self,
        parent: &Arc<Node>,
        node: &Arc<Node>,
        sibling: &Arc<Node>,
        ci: usize,
        si: usize,
        sib_id: PageId,
        ins: usize,
        needed: usize,
        dir: Direction,
    ) -> Result<bool> {
        let target = node.read().available_bytes() + node.read().garbage() + needed;
        let sep_index = match dir {
            Direction::Right => ci,
            Direction::Left => si,
        };

        if self.shared.cache.mark_dirty(sibling)? {
            let inner = parent.write();
            inner.set_child_id(si, sibling.id());
            inner.children.remove(&sib_id);
            inner.children.insert(sibling.id(), Arc::clone(sibling));
        }

        let mut ins = ins;
        let mut rotated = 0usize;
        loop {
            if node.read().available_bytes() + node.read().garbage() >= target {
                break;
            }
            let n = node.read().key_count();
            if n < 2 {
                break;
            }
            let idx = match dir {
                Direction::Right => n - 1,
                Direction::Left => 0,
            };
            let crosses = match dir {
                Direction::Right => ins > idx * 2,
                Direction::Left => ins < 2,
            };
            if crosses {
                break;
            }

            let sep_key = parent.read().key_at(sep_index * 2)?.to_vec();
            let boundary_key = node.read().key_at(idx * 2)?.to_vec();
            let sep_enc = encoded_key_len(sep_key.len());
            if sibling.read().available_bytes() + sibling.read().garbage() < sep_enc + 10 {
                break;
            }

            match dir {
                Direction::Right => {
                    let moved_child = node.read().child_id(idx + 1);
                    // the old separator becomes the sibling's first key,
                    // owning the descended child
                    sibling.visit_frames(|_, f| f.pos += 2);
                    match sibling
                        .write()
                        .create_internal_entry_compacting(0, sep_enc, 0, moved_child)?
                    {
                        EntrySpace::Loc(loc) => sibling.write().write_key_at(loc, &sep_key),
                        _ => {
                            sibling.visit_frames(|_, f| f.pos -= 2);
                            break;
                        }
                    }
                    if !self.replace_separator(parent, sep_index, &boundary_key)? {
                        // undo the sibling prepend and give up
                        sibling.write().delete_child_ref(0, 0)?;
                        sibling.visit_frames(|_, f| f.pos -= 2);
                        break;
                    }
                    if let Some(child) = node.write().children.remove(&moved_child) {
                        sibling.write().children.insert(moved_child, child);
                    }
                    node.migrate_frames(
                        sibling,
                        |f| (f.pos.max(0) as usize) / 2 == idx + 1,
                        |f| {
                            f.pos = 0;
                            if let Some(pf) = &f.parent {
                                pf.lock().pos += 2;
                            }
                        },
                    );
                    node.write().delete_child_ref(idx * 2, idx + 1)?;
                }
                Direction::Left => {
                    let moved_child = node.read().child_id(0);
                    let spos = sibling.read().vec_len();
                    let scount = sibling.read().child_count();
                    match sibling
                        .write()
                        .create_internal_entry_compacting(spos, sep_enc, scount, moved_child)?
                    {
                        EntrySpace::Loc(loc) => sibling.write().write_key_at(loc, &sep_key),
                        _ => break,
                    }
                    if !self.replace_separator(parent, sep_index, &boundary_key)? {
                        sibling.write().delete_child_ref(spos, scount)?;
                        break;
                    }
                    if let Some(child) = node.write().children.remove(&moved_child) {
                        sibling.write().children.insert(moved_child, child);
                    }
                    node.migrate_frames(
                        sibling,
                        |f| f.pos.max(0) == 0,
                        |f| {
                            f.pos = (scount * 2) as i32;
                            if let Some(pf) = &f.parent {
                                pf.lock().pos -= 2;
                            }
                        },
                    );
                    node.write().delete_child_ref(0, 0)?;
                    node.visit_frames(|_, f| {
                        if f.pos >= 2 {
                            f.pos -= 2;
                        }
                    });
                    ins -= 2;
                }
            }
            rotated += 1;
        }

        let enough = node.read().available_bytes() + node.read().garbage() >= target;
        if rotated > 0 {
            trace!(
                "rotated {rotated} separators {} through node {}",
                match dir {
                    Direction::Right => "right",
                    Direction::Left => "left",
                },
                node.id()
            );
        }
        Ok(enough && rotated > 0)
    }

    /// Replace the separator at key index `sep_index` in place when the new
    /// key fits the old encoding, else through fresh segment space. False
    /// when the parent genuinely has no room.
    fn replace_separator(&self, parent: &Arc<Node>, sep_index: usize, sep: &[u8]) -> Result<bool> {
        let pos = sep_index * 2;
        let old_len = {
            let inner = parent.read();
            encoded_key_len(inner.key_at(pos)?.len())
        };
        let new_len = encoded_key_len(sep.len());
        if new_len <= old_len {
            let loc = parent.read().entry_loc(pos);
            let inner = parent.write();
            inner.write_key_at(loc, sep);
            inner.add_garbage(old_len - new_len);
            return Ok(true);
        }
        if parent.read().available_bytes() + parent.read().garbage() < new_len {
            return Ok(false);
        }
        if parent.read().available_bytes() < new_len {
            let spare = self.shared.cache.remove_spare_buffer();
            let old_buf = parent.write().compact(spare)?;
            self.shared.cache.add_spare_buffer(old_buf);
        }
        match parent.write().alloc_separator(new_len) {
            Some(loc) => {
                let inner = parent.write();
                inner.add_garbage(old_len);
                inner.write_key_at(loc, sep);
                inner.set_entry_loc_at(pos, loc);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ---- delete and structural cleanup ------------------------------------

    /// Physically remove a ghosted entry (commit-time delete). Empty leaves
    /// are unlinked from their parent, and a root that runs out of keys
    /// collapses into its sole child.
    pub(crate) fn delete_ghost_locked(&self, key: &[u8]) -> Result<()> {
        let point = self.descend_dirty(key)?;
        let emptied = (|| {
            if point.pos < 0 {
                return Ok(false);
            }
            let pos = point.pos as usize;
            match point.node.read().leaf_value_at(pos)? {
                ValueRef::Ghost => {}
                // the entry was re-stored after the ghost; leave it alone
                _ => return Ok(false),
            }
            point.node.write().delete_leaf_entry(pos)?;
            self.fix_frames_after_delete(&point.node, pos, key);
            Ok(point.node.read().key_count() == 0)
        })();

        match emptied {
            Ok(empty) => {
                if empty && !Arc::ptr_eq(&point.node, &self.shared.root) {
                    // releases and re-takes latches internally
                    self.remove_empty_leaf(&point)?;
                } else {
                    point.node.latch.release_exclusive();
                }
                unbind_chain(&point.frame);
                Ok(())
            }
            Err(err) => {
                point.node.latch.release_exclusive();
                unbind_chain(&point.frame);
                Err(err)
            }
        }
    }

    /// Remove the (empty) leaf at `point` from its parent. Consumes the
    /// leaf latch.
    fn remove_empty_leaf(&self, point: &LeafPoint) -> Result<()> {
        let leaf = Arc::clone(&point.node);
        let Some(parent_frame) = point.frame.lock().parent.clone() else {
            leaf.latch.release_exclusive();
            return Ok(());
        };
        leaf.latch.release_exclusive();

        let Some(parent) = parent_frame.lock().node.clone() else {
            return Ok(());
        };
        parent.latch.acquire_exclusive();
        if parent.read().is_closed() || parent.read().split.is_some() {
            parent.latch.release_exclusive();
            return Ok(());
        }
        leaf.latch.acquire_exclusive();

        // Re-verify after the latch gap: still empty, still this parent's
        // child at the recorded slot.
        let ci = (parent_frame.lock().pos.max(0) as usize) / 2;
        let valid = leaf.read().key_count() == 0
            && !leaf.read().is_closed()
            && leaf.read().split.is_none()
            && ci < parent.read().child_count()
            && parent.read().child_id(ci) == leaf.id();
        if !valid {
            leaf.latch.release_exclusive();
            parent.latch.release_exclusive();
            return Ok(());
        }

        // Removing child `ci` removes the separator on its left (or the
        // first separator for the leftmost child).
        let sep_pos = if ci == 0 { 0 } else { (ci - 1) * 2 };
        let leaf_id = leaf.id();
        let unlinked = (|| {
            parent.write().delete_child_ref(sep_pos, ci)?;
            parent.write().children.remove(&leaf_id);
            parent.visit_frames(|_, f| {
                if (f.pos.max(0) as usize) / 2 > ci {
                    f.pos -= 2;
                }
            });

            // Stale frames survive on the stub until their cursors
            // re-descend.
            let stub = Arc::clone(&self.shared.stub);
            leaf.migrate_frames(
                &stub,
                |_| true,
                |frame| {
                    frame.pos = !0;
                    frame.parent = None;
                },
            );
            self.shared.cache.delete_node(&leaf)
        })();
        leaf.latch.release_exclusive();
        if let Err(err) = unlinked {
            parent.latch.release_exclusive();
            return Err(err);
        }

        let result = if parent.read().key_count() == 0
            && Arc::ptr_eq(&parent, &self.shared.root)
        {
            self.root_collapse(&parent)
        } else {
            Ok(())
        };
        parent.latch.release_exclusive();
        result
    }

    /// Collapse a keyless internal root into its sole child, repeatedly if
    /// the chain is several levels deep. The orphan node objects become
    /// stubs for any frames still bound to them.
    fn root_collapse(&self, root: &Arc<Node>) -> Result<()> {
        while root.read().is_internal() && root.read().key_count() == 0 {
            let child_id = root.read().child_id(0);
            let child = match root.read().children.get(&child_id).cloned() {
                Some(c) if c.id() == child_id => {
                    c.latch.acquire_exclusive();
                    if c.id() != child_id {
                        c.latch.release_exclusive();
                        self.shared.cache.fetch_child(root, child_id, true)?
                    } else {
                        c
                    }
                }
                _ => self.shared.cache.fetch_child(root, child_id, true)?,
            };

            root.write().swap_page(child.write());
            // live positions move to the root, which now holds the data
            // they reference; the orphan keeps nothing
            child.migrate_frames(root, |_| true, |frame| frame.parent = None);
            self.shared.cache.delete_node(&child)?;
            child.latch.release_exclusive();
            trace!("root collapse: tree {} lost a level", self.shared.name);
        }
        Ok(())
    }

    // ---- cursor scan support ---------------------------------------------

    /// Leftmost live entry; binds and returns a frame chain for it.
    pub(crate) fn scan_first(&self) -> Result<Option<(FrameRef, Vec<u8>, Vec<u8>)>> {
        self.scan_from(&[])
    }

    /// First live entry with key strictly greater than `after`.
    pub(crate) fn scan_greater(
        &self,
        after: &[u8],
    ) -> Result<Option<(FrameRef, Vec<u8>, Vec<u8>)>> {
        self.scan_from(after)
    }

    /// Exact lookup that leaves a bound frame for subsequent `next` calls.
    pub(crate) fn scan_find(&self, key: &[u8]) -> Result<Option<(FrameRef, Vec<u8>)>> {
        self.check_key(key)?;
        let point = self.descend_bound(key)?;
        let result = if point.pos >= 0 {
            point.node.read().leaf_value_bytes(point.pos as usize)?
        } else {
            None
        };
        point.node.latch.release_shared();
        match result {
            Some(value) => Ok(Some((point.frame, value))),
            None => {
                unbind_chain(&point.frame);
                Ok(None)
            }
        }
    }

    /// Advance within the leaf a cursor frame is bound to. Returns `None`
    /// when the leaf is exhausted or the frame went stale; the caller falls
    /// back to a fresh descent.
    pub(crate) fn scan_next(
        &self,
        frame: &FrameRef,
        last: &[u8],
    ) -> Result<Option<(FrameRef, Vec<u8>, Vec<u8>)>> {
        let Some(node) = frame.lock().node.clone() else {
            return Ok(None);
        };
        if node.id() == STUB_PAGE {
            return Ok(None);
        }
        // a contended leaf is not worth waiting on; the fallback descent
        // re-finds the position
        if !node.latch.try_acquire_shared() {
            return Ok(None);
        }
        let still_bound = frame
            .lock()
            .node
            .as_ref()
            .map_or(false, |n| Arc::ptr_eq(n, &node));
        if !still_bound || node.read().is_closed() || !node.read().is_leaf() {
            node.latch.release_shared();
            return Ok(None);
        }

        // find the successor of `last` near the frame's recorded position
        let hint = {
            let p = frame.lock().pos;
            if p >= 0 {
                p as usize
            } else {
                (!p) as usize
            }
        };
        let vec_len = node.read().vec_len();
        let found = node.read().binary_search_hint(last, hint)?;
        let mut pos = if found >= 0 {
            (found + 2) as usize
        } else {
            (!found) as usize
        };
        while pos < vec_len {
            match node.read().leaf_value_bytes(pos)? {
                Some(value) => {
                    let key = node.read().key_at(pos)?.to_vec();
                    {
                        let mut f = frame.lock();
                        f.pos = pos as i32;
                        f.not_found_key = None;
                    }
                    node.latch.release_shared();
                    return Ok(Some((Arc::clone(frame), key, value)));
                }
                None => pos += 2, // ghost
            }
        }
        node.latch.release_shared();
        Ok(None)
    }

    /// Shared descent binding a frame chain, leaf share-latched on return.
    fn descend_bound(&self, key: &[u8]) -> Result<LeafPoint> {
        'restart: loop {
            let mut node = Arc::clone(&self.shared.root);
            node.latch.acquire_shared();
            let mut chain: Option<FrameRef> = None;
            loop {
                if node.read().is_closed() {
                    node.latch.release_shared();
                    if Arc::ptr_eq(&node, &self.shared.root) {
                        abandon_chain(chain);
                        return Err(Error::ClosedIndex);
                    }
                    abandon_chain(chain.take());
                    continue 'restart;
                }
                if node.read().split.is_some() {
                    // frames must not bind across an unfinished split; let
                    // the splitter finish and retry
                    node.latch.release_shared();
                    abandon_chain(chain.take());
                    std::thread::yield_now();
                    continue 'restart;
                }
                if node.read().is_leaf() {
                    let pos = match node.read().binary_search(key) {
                        Ok(pos) => pos,
                        Err(err) => {
                            node.latch.release_shared();
                            abandon_chain(chain);
                            return Err(err);
                        }
                    };
                    let frame = Frame::new_ref(Arc::clone(&node), pos, chain.take());
                    if pos < 0 {
                        frame.lock().not_found_key = Some(key.to_vec().into_boxed_slice());
                    }
                    node.bind_frame(&frame);
                    return Ok(LeafPoint { frame, node, pos });
                }

                let (idx, child_id) = match node.read().binary_search(key) {
                    Ok(pos) => {
                        let idx = NodeInner::internal_pos(pos);
                        (idx, node.read().child_id(idx))
                    }
                    Err(err) => {
                        node.latch.release_shared();
                        abandon_chain(chain);
                        return Err(err);
                    }
                };

                let resident = node
                    .read()
                    .children
                    .get(&child_id)
                    .filter(|c| c.id() == child_id)
                    .cloned();
                if let Some(child) = resident {
                    child.latch.acquire_shared();
                    if child.id() == child_id {
                        self.shared.cache.used(&child);
                        let frame =
                            Frame::new_ref(Arc::clone(&node), (idx * 2) as i32, chain.take());
                        node.bind_frame(&frame);
                        chain = Some(frame);
                        node.latch.release_shared();
                        node = child;
                        continue;
                    }
                    child.latch.release_shared();
                }

                // fault, then restart so the bound chain stays consistent
                let seq = node.seq();
                node.latch.release_shared();
                node.latch.acquire_exclusive();
                if node.seq() != seq || node.read().is_closed() || node.read().split.is_some() {
                    node.latch.release_exclusive();
                    abandon_chain(chain.take());
                    continue 'restart;
                }
                {
                    let inner = node.write();
                    if let Some(stale) = inner.children.get(&child_id) {
                        if stale.id() != child_id {
                            inner.children.remove(&child_id);
                        }
                    }
                }
                match self.shared.cache.fetch_child(&node, child_id, false) {
                    Ok(child) => {
                        child.latch.release_shared();
                        abandon_chain(chain.take());
                        continue 'restart;
                    }
                    Err(err) => {
                        abandon_chain(chain);
                        return Err(err);
                    }
                }
            }
        }
    }

    /// First live entry with key greater than `after` (empty `after` scans
    /// from the beginning). Walks leaves left to right by ascending the
    /// bound frame chain.
    fn scan_from(&self, after: &[u8]) -> Result<Option<(FrameRef, Vec<u8>, Vec<u8>)>> {
        'restart: loop {
            let point = self.descend_bound(after)?;
            let mut frame = point.frame;
            let mut node = point.node;
            // leaf share-latched here
            let mut pos = if point.pos >= 0 {
                point.pos as usize
            } else {
                (!point.pos) as usize
            };
            loop {
                let vec_len = node.read().vec_len();
                while pos < vec_len {
                    let key = node.read().key_at(pos)?.to_vec();
                    if !after.is_empty() && key.as_slice() <= after {
                        pos += 2;
                        continue;
                    }
                    match node.read().leaf_value_bytes(pos)? {
                        Some(value) => {
                            {
                                let mut f = frame.lock();
                                f.pos = pos as i32;
                                f.not_found_key = None;
                            }
                            node.latch.release_shared();
                            return Ok(Some((frame, key, value)));
                        }
                        None => pos += 2,
                    }
                }

                // leaf exhausted: ascend to the nearest ancestor with an
                // unvisited right subtree
                node.latch.release_shared();
                let mut cur = Arc::clone(&frame);
                let (parent_frame, parent, next_idx) = loop {
                    let parent_ref = cur.lock().parent.clone();
                    let Some(pf) = parent_ref else {
                        unbind_chain(&frame);
                        return Ok(None); // rightmost leaf
                    };
                    let Some(parent) = pf.lock().node.clone() else {
                        unbind_chain(&frame);
                        continue 'restart;
                    };
                    parent.latch.acquire_shared();
                    let usable = !parent.read().is_closed()
                        && parent.read().split.is_none()
                        && parent.read().is_internal();
                    if !usable {
                        parent.latch.release_shared();
                        unbind_chain(&frame);
                        continue 'restart;
                    }
                    let idx = (pf.lock().pos.max(0) as usize) / 2;
                    if idx + 1 < parent.read().child_count() {
                        break (pf, parent, idx + 1);
                    }
                    parent.latch.release_shared();
                    cur = pf;
                };

                // descend the leftmost path of the next subtree, rebuilding
                // the chain below the ancestor
                parent_frame.lock().pos = (next_idx * 2) as i32;
                let mut dnode = parent;
                let mut didx = next_idx;
                let mut dchain = Arc::clone(&parent_frame);
                let descended = loop {
                    let child_id = dnode.read().child_id(didx);
                    let resident = dnode
                        .read()
                        .children
                        .get(&child_id)
                        .filter(|c| c.id() == child_id)
                        .cloned();
                    let child = match resident {
                        Some(child) => {
                            child.latch.acquire_shared();
                            if child.id() != child_id {
                                child.latch.release_shared();
                                dnode.latch.release_shared();
                                break false;
                            }
                            dnode.latch.release_shared();
                            child
                        }
                        None => {
                            // cold subtree: fall back to a keyed descent,
                            // which handles faulting
                            dnode.latch.release_shared();
                            break false;
                        }
                    };
                    if child.read().split.is_some() {
                        child.latch.release_shared();
                        break false;
                    }
                    if child.read().is_leaf() {
                        let new_frame = Frame::new_ref(Arc::clone(&child), !0, Some(dchain));
                        child.bind_frame(&new_frame);
                        // sever the stale branch of the old chain; the frame
                        // guard drops before the list is touched
                        let old_node = {
                            let mut old = frame.lock();
                            old.parent = None;
                            old.node.take()
                        };
                        if let Some(n) = old_node {
                            n.unbind_frame(&frame);
                        }
                        frame = new_frame;
                        node = child;
                        pos = 0;
                        break true;
                    }
                    let new_frame = Frame::new_ref(Arc::clone(&child), 0, Some(dchain));
                    child.bind_frame(&new_frame);
                    dchain = new_frame;
                    dnode = child;
                    didx = 0;
                };
                if !descended {
                    unbind_chain(&frame);
                    continue 'restart;
                }
            }
        }
    }
}

/// Aggregate shape of a tree, from [`Tree::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStats {
    pub depth: usize,
    pub leaf_count: usize,
    pub internal_count: usize,
    /// Live (non-ghost) entries.
    pub entry_count: usize,
    pub min_leaf_available: usize,
    pub max_leaf_available: usize,
    /// Leaves at least half empty, candidates for merging into a sibling.
    pub merge_eligible_leaves: usize,
    /// Free bytes per leaf, in key order.
    pub leaf_available: Vec<usize>,
}

impl Tree {
    /// Walk the whole tree verifying structural invariants: header sanity,
    /// strictly ascending keys, child-pointer counts, garbage accounting
    /// bounds and separator ordering. Returns aggregate statistics.
    ///
    /// Intended for tests and integrity checks; the walk holds shared
    /// latches one node at a time.
    pub fn verify(&self) -> Result<TreeStats> {
        let mut stats = TreeStats {
            depth: 0,
            leaf_count: 0,
            internal_count: 0,
            entry_count: 0,
            min_leaf_available: usize::MAX,
            max_leaf_available: 0,
            merge_eligible_leaves: 0,
            leaf_available: Vec::new(),
        };
        let root = Arc::clone(&self.shared.root);
        self.verify_node(&root, None, None, 1, &mut stats)?;
        if stats.leaf_count == 0 {
            stats.min_leaf_available = 0;
        }
        Ok(stats)
    }

    /// Separator bounds from the parent: `sep(left) <= key < sep(right)`
    /// must hold for every key in the subtree.
    fn verify_node(
        &self,
        node: &Arc<Node>,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        depth: usize,
        stats: &mut TreeStats,
    ) -> Result<()> {
        node.latch.acquire_shared();
        let result = (|| {
            let inner = node.read();
            if inner.is_closed() {
                return Err(Error::ClosedIndex);
            }
            inner.validate(node.id())?;
            stats.depth = stats.depth.max(depth);

            let n = inner.key_count();
            for i in 0..n {
                let key = inner.key_at(i * 2)?;
                if let Some(low) = low {
                    if key < low {
                        return Err(Error::corrupt(node.id(), "key below parent separator"));
                    }
                }
                if let Some(high) = high {
                    if key >= high {
                        return Err(Error::corrupt(node.id(), "key above parent separator"));
                    }
                }
            }

            if inner.is_leaf() {
                stats.leaf_count += 1;
                for i in 0..n {
                    if !matches!(inner.leaf_value_at(i * 2)?, ValueRef::Ghost) {
                        stats.entry_count += 1;
                    }
                }
                let available = inner.available_bytes();
                stats.min_leaf_available = stats.min_leaf_available.min(available);
                stats.max_leaf_available = stats.max_leaf_available.max(available);
                if inner.is_merge_eligible() {
                    stats.merge_eligible_leaves += 1;
                }
                stats.leaf_available.push(available);
                Ok(Vec::new())
            } else {
                stats.internal_count += 1;
                // collect child ids and bounds before releasing the latch
                let mut plan = Vec::with_capacity(n + 1);
                for i in 0..=n {
                    let child_low = if i == 0 {
                        low.map(|k| k.to_vec())
                    } else {
                        Some(inner.key_at((i - 1) * 2)?.to_vec())
                    };
                    let child_high = if i == n {
                        high.map(|k| k.to_vec())
                    } else {
                        Some(inner.key_at(i * 2)?.to_vec())
                    };
                    plan.push((inner.child_id(i), child_low, child_high));
                }
                Ok(plan)
            }
        })();
        node.latch.release_shared();
        let plan = result?;

        for (child_id, child_low, child_high) in plan {
            let child = self.fetch_for_verify(node, child_id)?;
            self.verify_node(
                &child,
                child_low.as_deref(),
                child_high.as_deref(),
                depth + 1,
                stats,
            )?;
        }
        Ok(())
    }

    fn fetch_for_verify(&self, parent: &Arc<Node>, child_id: PageId) -> Result<Arc<Node>> {
        parent.latch.acquire_shared();
        let resident = parent
            .read()
            .children
            .get(&child_id)
            .filter(|c| c.id() == child_id)
            .cloned();
        parent.latch.release_shared();
        if let Some(child) = resident {
            return Ok(child);
        }
        parent.latch.acquire_exclusive();
        let child = self.shared.cache.fetch_child(parent, child_id, true);
        parent.latch.release_exclusive();
        let child = child?;
        child.latch.release_exclusive();
        Ok(child)
    }
}

/// Decide whether a frame follows the moved half of a leaf split.
fn frame_belongs_right(frame: &Frame, boundary_bytes: usize, sep: &[u8], new_left: bool) -> bool {
    if new_left {
        // only the new entry moved to a left sibling; existing entries (and
        // found frames) stay put
        return frame.pos < 0
            && frame
                .not_found_key
                .as_deref()
                .map_or((!frame.pos) == 0, |nk| nk < sep);
    }
    if frame.pos >= 0 {
        frame.pos as usize >= boundary_bytes
    } else {
        let ipos = (!frame.pos) as usize;
        if ipos != boundary_bytes {
            ipos > boundary_bytes
        } else {
            frame.not_found_key.as_deref().map_or(true, |nk| nk >= sep)
        }
    }
}

fn find_child_slot(inner: &NodeInner, id: PageId) -> Option<usize> {
    (0..inner.child_count()).find(|&i| inner.child_id(i) == id)
}

fn abandon_chain(chain: Option<FrameRef>) {
    if let Some(frame) = chain {
        unbind_chain(&frame);
    }
}

/// Build an empty tree: a single leaf root flagged as both extremities.
pub(crate) fn init_empty_root(root: &Arc<Node>) {
    root.write()
        .init(TYPE_LEAF, FLAG_LOW_EXTREMITY | FLAG_HIGH_EXTREMITY);
}
