//! Cursor position frames and the forward-scan cursor.
//!
//! A frame marks a position inside one node. Frames bound to a node are
//! registered on that node and are repositioned wholesale by any structural
//! modification, so an idle cursor stays valid across splits, rebalances and
//! root changes happening around it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::tree::node::Node;
use crate::tree::Tree;

/// Position marker bound to a node.
///
/// `pos` is the even byte offset of the entry within the node's search
/// vector. A negative value is the bitwise complement of the insertion
/// offset for a key that was not found; `not_found_key` then caches the
/// search key so later rebalance and split fixups can re-route the frame by
/// comparison against the moving separator.
pub(crate) struct Frame {
    pub node: Option<Arc<Node>>,
    pub pos: i32,
    pub parent: Option<FrameRef>,
    pub not_found_key: Option<Box<[u8]>>,
}

pub(crate) type FrameRef = Arc<Mutex<Frame>>;

impl Frame {
    pub fn new_ref(node: Arc<Node>, pos: i32, parent: Option<FrameRef>) -> FrameRef {
        Arc::new(Mutex::new(Frame {
            node: Some(node),
            pos,
            parent,
            not_found_key: None,
        }))
    }
}

/// Unbind a frame chain from its nodes, leaf first. The frame guard is
/// dropped before touching any node's frame list: list-then-frame is the
/// lock order everywhere else.
pub(crate) fn unbind_chain(leaf: &FrameRef) {
    let mut current = Some(leaf.clone());
    while let Some(frame_ref) = current {
        let (node, parent) = {
            let mut frame = frame_ref.lock();
            (frame.node.take(), frame.parent.take())
        };
        if let Some(node) = node {
            node.unbind_frame(&frame_ref);
        }
        current = parent;
    }
}

/// Forward scanner over one tree. Values are read latch-consistent; ghosted
/// entries (uncommitted deletes) are skipped.
pub struct Cursor {
    pub(crate) tree: Tree,
    pub(crate) leaf: Option<FrameRef>,
    /// Last key returned, used to recover the scan position when the bound
    /// node was invalidated underneath the cursor.
    pub(crate) last_key: Option<Vec<u8>>,
    pub(crate) exhausted: bool,
}

impl Cursor {
    pub(crate) fn new(tree: Tree) -> Self {
        Self {
            tree,
            leaf: None,
            last_key: None,
            exhausted: false,
        }
    }

    /// Position on the smallest entry and return it.
    pub fn first(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.reset();
        self.exhausted = false;
        match self.tree.scan_first()? {
            Some((frame, key, value)) => {
                self.bind(frame, &key);
                Ok(Some((key, value)))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Advance to the next entry in key order.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.exhausted {
            return Ok(None);
        }
        let Some(last) = self.last_key.clone() else {
            return self.first();
        };

        // Fast path: advance within the bound leaf. Falls back to a fresh
        // descent when the frame was invalidated (node deleted, stub bound,
        // or the position was disturbed past recognition).
        let step = match self.leaf.clone() {
            Some(frame) => self.tree.scan_next(&frame, &last)?,
            None => None,
        };
        let step = match step {
            Some(found) => Some(found),
            None => self.tree.scan_greater(&last)?,
        };
        match step {
            Some((frame, key, value)) => {
                self.rebind(frame, &key);
                Ok(Some((key, value)))
            }
            None => {
                self.reset();
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Position on `key` if present and return its value.
    pub fn find(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.reset();
        self.exhausted = false;
        match self.tree.scan_find(key)? {
            Some((frame, value)) => {
                self.bind(frame, key);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Forget the current position.
    pub fn reset(&mut self) {
        if let Some(frame) = self.leaf.take() {
            unbind_chain(&frame);
        }
        self.last_key = None;
    }

    fn bind(&mut self, frame: FrameRef, key: &[u8]) {
        self.leaf = Some(frame);
        self.last_key = Some(key.to_vec());
    }

    fn rebind(&mut self, frame: FrameRef, key: &[u8]) {
        if let Some(old) = self.leaf.take() {
            if !Arc::ptr_eq(&old, &frame) {
                unbind_chain(&old);
            }
        }
        self.bind(frame, key);
    }

}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.reset();
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

pub(crate) fn frame_error(detail: &str) -> Error {
    Error::Assertion(format!("cursor frame invariant: {detail}"))
}
