//! On-page B+ tree node: layout, search and in-node mutation.
//!
//! A tree page is partitioned as
//!
//! ```text
//! +--------+--------------+------+---------------+------------+------+---------------+
//! | header | left segment | free | search vector | child ids* | free | right segment |
//! +--------+--------------+------+---------------+------------+------+---------------+
//! ```
//!
//! Entries live in the two segments and are addressed by the search vector,
//! an even-aligned array of u16 pointers sorted by key. Internal nodes pack
//! an 8-byte child id per subtree immediately after the vector (`*`).
//! The segments grow toward the middle; deleting or replacing an entry
//! leaves its bytes behind as garbage until a compaction rebuilds the page.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::latch::Latch;
use crate::store::PageId;
use crate::tree::cursor::{Frame, FrameRef};

// Header layout (little-endian), offsets in bytes:
//   0: type (u8)      - node type in the 4 high bits, extremity flags low
//   1: reserved (u8)  - must be zero
//   2: garbage (u16)  - dead bytes inside the segments
//   4: left tail (u16)  - exclusive upper bound of the left segment
//   6: right tail (u16) - exclusive lower bound of the right segment
//   8: vector start (u16) - inclusive, even-aligned
//  10: vector end (u16)   - inclusive (start - 2 when empty)
const HDR_TYPE: usize = 0;
const HDR_RESERVED: usize = 1;
const HDR_GARBAGE: usize = 2;
const HDR_LEFT_TAIL: usize = 4;
const HDR_RIGHT_TAIL: usize = 6;
const HDR_VEC_START: usize = 8;
const HDR_VEC_END: usize = 10;
pub(crate) const HEADER_SIZE: usize = 12;

const CHILD_ID_SIZE: usize = 8;

// Node type codes, stored in the 4 high bits of the type byte.
pub(crate) const TYPE_FRAGMENT: u8 = 0x2;
pub(crate) const TYPE_UNDO_LOG: u8 = 0x3;
pub(crate) const TYPE_INTERNAL: u8 = 0x4;
pub(crate) const TYPE_BOTTOM_INTERNAL: u8 = 0x5;
pub(crate) const TYPE_LEAF: u8 = 0x6;

// Extremity flags: set on every node of the leftmost / rightmost
// root-to-leaf path.
pub(crate) const FLAG_LOW_EXTREMITY: u8 = 0x02;
pub(crate) const FLAG_HIGH_EXTREMITY: u8 = 0x01;

// Key header: `0Lxxxxxx` one byte for 1..=64 byte keys, `10xxxxxx` plus one
// byte for 0..=16383. The second form's spare range is reserved for prefix
// compression, which is not engaged.
const KEY_SMALL_MAX: usize = 64;
pub(crate) const KEY_MAX: usize = 16383;

// Value header: `0xxxxxxx` short 0..=127, `10f0xxxx`+u8 medium 1..=4096,
// `10f1xxxx`+u8+u8 large 1..=1048576, `11111111` ghost. The `f` bit marks a
// fragmented value whose bytes encode a fragment descriptor.
const VALUE_SMALL_MAX: usize = 127;
const VALUE_MEDIUM_MAX: usize = 4096;
pub(crate) const VALUE_LARGE_MAX: usize = 1_048_576;
const VALUE_GHOST: u8 = 0xff;
const VALUE_FRAGMENTED_BIT: u8 = 0x20;

/// Cached-state codes. The two dirty codes alternate as checkpoint
/// generations: flipping the active code captures a snapshot of the pages
/// that must be written without blocking new mutations.
pub(crate) const CACHED_CLEAN: u8 = 0;
pub(crate) const CACHED_DIRTY_A: u8 = 1;
pub(crate) const CACHED_DIRTY_B: u8 = 2;

/// In-progress split descriptor. A node carrying one holds an exclusive
/// latch; the descriptor is cleared once the separator key is inserted into
/// the parent.
pub(crate) struct Split {
    /// The new sibling lies left of the splitting node.
    pub new_left: bool,
    pub sibling: Arc<Node>,
    /// Separator: greater than every key left of the boundary, not greater
    /// than any key right of it.
    pub key: Box<[u8]>,
}

impl Split {
    /// Route a descent that encountered the split: pick the side `key`
    /// belongs to.
    pub fn select_node(&self, node: &Arc<Node>, key: &[u8]) -> Arc<Node> {
        let to_sibling = if self.new_left {
            key < self.key.as_ref()
        } else {
            key >= self.key.as_ref()
        };
        if to_sibling {
            Arc::clone(&self.sibling)
        } else {
            Arc::clone(node)
        }
    }
}

/// Latched state of a node. Everything here is guarded by the node's latch.
pub(crate) struct NodeInner {
    page: Box<[u8]>,
    /// Resident children of an internal node, keyed by the child id stored
    /// in the page at insertion time. Entries whose node no longer carries
    /// the key id are stale and pruned on lookup.
    pub children: HashMap<PageId, Arc<Node>>,
    pub split: Option<Split>,
    closed: bool,
}

/// A resident tree page with its latch, cache bookkeeping and bound cursor
/// frames.
pub(crate) struct Node {
    id: AtomicU64,
    pub latch: Latch,
    inner: std::cell::UnsafeCell<NodeInner>,
    /// One of `CACHED_*`; always equal to the active checkpoint generation
    /// while dirty.
    pub cached_state: AtomicU8,
    /// Bumped on every exclusive access. A reader that had to give up its
    /// shared latch compares stamps after re-latching to learn whether the
    /// node changed underneath it (restart from root when it did).
    seq: AtomicU64,
    pub last_access: AtomicU64,
    pub unevictable: AtomicBool,
    /// Cursor frames bound to this node. Guarded by its own mutex; the lock
    /// order is node latch, then frame list, then individual frames.
    frames: Mutex<Vec<Weak<Mutex<Frame>>>>,
}

// SAFETY: `inner` is only reached through `read()`/`write()`, whose contract
// requires the caller to hold the node latch in the matching mode.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    pub fn new(id: PageId, page: Box<[u8]>) -> Self {
        Self {
            id: AtomicU64::new(id),
            latch: Latch::new(),
            inner: std::cell::UnsafeCell::new(NodeInner {
                page,
                children: HashMap::new(),
                split: None,
                closed: false,
            }),
            cached_state: AtomicU8::new(CACHED_CLEAN),
            seq: AtomicU64::new(0),
            last_access: AtomicU64::new(0),
            unevictable: AtomicBool::new(false),
            frames: Mutex::new(Vec::new()),
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn id(&self) -> PageId {
        self.id.load(Ordering::Acquire)
    }

    /// Requires the exclusive latch.
    pub fn set_id(&self, id: PageId) {
        self.id.store(id, Ordering::Release);
    }

    /// Access node state under a shared latch.
    ///
    /// SAFETY contract: the caller holds this node's latch (shared or
    /// exclusive) for the lifetime of the returned reference.
    #[allow(clippy::mut_from_ref)]
    pub fn read(&self) -> &NodeInner {
        unsafe { &*self.inner.get() }
    }

    /// Access node state under the exclusive latch.
    ///
    /// SAFETY contract: the caller holds this node's exclusive latch for the
    /// lifetime of the returned reference.
    #[allow(clippy::mut_from_ref)]
    pub fn write(&self) -> &mut NodeInner {
        self.seq.fetch_add(1, Ordering::AcqRel);
        unsafe { &mut *self.inner.get() }
    }

    pub fn bind_frame(&self, frame: &FrameRef) {
        self.frames.lock().push(Arc::downgrade(frame));
    }

    pub fn unbind_frame(&self, frame: &FrameRef) {
        self.frames
            .lock()
            .retain(|w| w.upgrade().map_or(false, |f| !Arc::ptr_eq(&f, frame)));
    }

    /// True when at least one live cursor frame is bound here.
    pub fn has_frames(&self) -> bool {
        let mut list = self.frames.lock();
        list.retain(|w| w.strong_count() > 0);
        !list.is_empty()
    }

    /// Visit every live bound frame. Callers hold the exclusive latch, so
    /// frame positions cannot move underneath them.
    pub fn visit_frames(&self, mut f: impl FnMut(&FrameRef, &mut Frame)) {
        let mut list = self.frames.lock();
        list.retain(|w| w.strong_count() > 0);
        for weak in list.iter() {
            if let Some(frame_ref) = weak.upgrade() {
                let mut frame = frame_ref.lock();
                f(&frame_ref, &mut frame);
            }
        }
    }

    /// Move every bound frame satisfying `take` onto `target`, applying
    /// `adjust` to each. Requires the exclusive latch on both nodes.
    pub fn migrate_frames(
        self: &Arc<Self>,
        target: &Arc<Node>,
        mut take: impl FnMut(&Frame) -> bool,
        mut adjust: impl FnMut(&mut Frame),
    ) {
        let mut list = self.frames.lock();
        let mut keep = Vec::with_capacity(list.len());
        for weak in list.drain(..) {
            let Some(frame_ref) = weak.upgrade() else {
                continue;
            };
            let mut frame = frame_ref.lock();
            if take(&frame) {
                frame.node = Some(Arc::clone(target));
                adjust(&mut frame);
                drop(frame);
                target.frames.lock().push(Arc::downgrade(&frame_ref));
            } else {
                drop(frame);
                keep.push(Arc::downgrade(&frame_ref));
            }
        }
        *list = keep;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("id", &self.id()).finish()
    }
}

/// Where an entry may be created, per the compact / rebalance / split
/// escalation in the insertion path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntrySpace {
    /// Entry bytes go at this offset; the vector slot is already open.
    Loc(usize),
    /// No contiguous room, but garbage reclaim would make room.
    Compact,
    /// The node genuinely cannot hold the entry.
    Full,
}

/// Decoded leaf value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueRef {
    /// Offset and length of the value bytes, plus the fragmented bit.
    Slice { start: usize, len: usize, fragmented: bool },
    Ghost,
}

impl NodeInner {
    // ---- header accessors -------------------------------------------------

    pub fn page(&self) -> &[u8] {
        &self.page
    }

    pub fn page_mut(&mut self) -> &mut [u8] {
        &mut self.page
    }

    pub fn page_size(&self) -> usize {
        self.page.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Replace the page buffer with the empty sentinel. Mutations against a
    /// closed node surface `ClosedIndex`.
    pub fn close(&mut self) -> Box<[u8]> {
        self.closed = true;
        self.children.clear();
        std::mem::replace(&mut self.page, Box::new([]))
    }

    pub fn swap_page(&mut self, other: &mut NodeInner) {
        std::mem::swap(&mut self.page, &mut other.page);
        std::mem::swap(&mut self.children, &mut other.children);
    }

    pub fn replace_page(&mut self, page: Box<[u8]>) -> Box<[u8]> {
        std::mem::replace(&mut self.page, page)
    }

    pub fn node_type(&self) -> u8 {
        self.page[HDR_TYPE] >> 4
    }

    pub fn type_flags(&self) -> u8 {
        self.page[HDR_TYPE] & 0x03
    }

    pub fn set_type(&mut self, node_type: u8, flags: u8) {
        self.page[HDR_TYPE] = (node_type << 4) | (flags & 0x03);
    }

    pub fn set_flags(&mut self, flags: u8) {
        let t = self.node_type();
        self.set_type(t, flags);
    }

    pub fn is_leaf(&self) -> bool {
        self.node_type() == TYPE_LEAF
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.node_type(), TYPE_INTERNAL | TYPE_BOTTOM_INTERNAL)
    }

    pub fn garbage(&self) -> usize {
        LittleEndian::read_u16(&self.page[HDR_GARBAGE..]) as usize
    }

    pub fn set_garbage(&mut self, garbage: usize) {
        LittleEndian::write_u16(&mut self.page[HDR_GARBAGE..], garbage as u16);
    }

    pub fn add_garbage(&mut self, amount: usize) {
        let g = self.garbage() + amount;
        self.set_garbage(g);
    }

    pub fn left_tail(&self) -> usize {
        LittleEndian::read_u16(&self.page[HDR_LEFT_TAIL..]) as usize
    }

    pub fn set_left_tail(&mut self, v: usize) {
        LittleEndian::write_u16(&mut self.page[HDR_LEFT_TAIL..], v as u16);
    }

    pub fn right_tail(&self) -> usize {
        LittleEndian::read_u16(&self.page[HDR_RIGHT_TAIL..]) as usize
    }

    pub fn set_right_tail(&mut self, v: usize) {
        LittleEndian::write_u16(&mut self.page[HDR_RIGHT_TAIL..], v as u16);
    }

    pub fn vec_start(&self) -> usize {
        LittleEndian::read_u16(&self.page[HDR_VEC_START..]) as usize
    }

    pub fn set_vec_start(&mut self, v: usize) {
        LittleEndian::write_u16(&mut self.page[HDR_VEC_START..], v as u16);
    }

    pub fn vec_end(&self) -> usize {
        LittleEndian::read_u16(&self.page[HDR_VEC_END..]) as usize
    }

    pub fn set_vec_end(&mut self, v: usize) {
        LittleEndian::write_u16(&mut self.page[HDR_VEC_END..], v as u16);
    }

    /// Byte length of the search vector; `key_count * 2`.
    pub fn vec_len(&self) -> usize {
        self.vec_end() + 2 - self.vec_start()
    }

    pub fn key_count(&self) -> usize {
        self.vec_len() / 2
    }

    pub fn child_count(&self) -> usize {
        self.key_count() + 1
    }

    /// Initialize as an empty node of the given type, vector centered.
    pub fn init(&mut self, node_type: u8, flags: u8) {
        let page_size = self.page_size();
        self.page.fill(0);
        self.set_type(node_type, flags);
        self.set_garbage(0);
        self.set_left_tail(HEADER_SIZE);
        self.set_right_tail(page_size - 1);
        let mid = (HEADER_SIZE + page_size / 2) & !1;
        self.set_vec_start(mid);
        self.set_vec_end(mid - 2);
        self.children.clear();
        self.split = None;
        self.closed = false;
    }

    /// Initialize as a one-key internal node over a freshly split root.
    pub fn init_root_internal(
        &mut self,
        bottom: bool,
        key: &[u8],
        left_id: PageId,
        right_id: PageId,
    ) -> Result<()> {
        let node_type = if bottom { TYPE_BOTTOM_INTERNAL } else { TYPE_INTERNAL };
        self.init(node_type, FLAG_LOW_EXTREMITY | FLAG_HIGH_EXTREMITY);
        let klen = encoded_key_len(key.len());
        // key entry in the left segment, vector right after mid-page
        let loc = HEADER_SIZE;
        write_key(&mut self.page, loc, key);
        self.set_left_tail(loc + klen);
        let vs = (self.page_size() / 2) & !1;
        self.set_vec_start(vs);
        self.set_vec_end(vs);
        LittleEndian::write_u16(&mut self.page[vs..], loc as u16);
        write_child_id(&mut self.page, vs + 2, left_id);
        write_child_id(&mut self.page, vs + 2 + CHILD_ID_SIZE, right_id);
        Ok(())
    }

    // ---- corruption checks ------------------------------------------------

    /// Sanity-check a page faulted from the store.
    pub fn validate(&self, page_id: PageId) -> Result<()> {
        if self.page.len() < HEADER_SIZE {
            return Err(Error::corrupt(page_id, "page smaller than header"));
        }
        if self.page[HDR_RESERVED] != 0 {
            return Err(Error::corrupt(page_id, "reserved header byte not zero"));
        }
        match self.node_type() {
            TYPE_LEAF | TYPE_INTERNAL | TYPE_BOTTOM_INTERNAL | TYPE_FRAGMENT | TYPE_UNDO_LOG => {}
            t => {
                return Err(Error::corrupt(page_id, format!("unknown node type {t:#x}")));
            }
        }
        let vs = self.vec_start();
        let ve = self.vec_end();
        if vs % 2 != 0 || vs < self.left_tail() || ve + 2 < vs {
            return Err(Error::corrupt(page_id, "bad search vector bounds"));
        }
        let tail_area = if self.is_internal() {
            self.child_count() * CHILD_ID_SIZE
        } else {
            0
        };
        if ve + 2 + tail_area > self.right_tail() + 1 {
            return Err(Error::corrupt(page_id, "vector overlaps right segment"));
        }
        // keys strictly ascending
        let mut prev: Option<(usize, usize)> = None;
        for i in 0..self.key_count() {
            let loc = self.entry_loc(i * 2);
            let (start, len) = decode_key(&self.page, loc)
                .map_err(|detail| Error::corrupt(page_id, detail))?;
            if let Some((pstart, plen)) = prev {
                if self.page[pstart..pstart + plen] >= self.page[start..start + len] {
                    return Err(Error::corrupt(page_id, "key order inversion"));
                }
            }
            prev = Some((start, len));
        }
        if self.is_internal() {
            // duplicate child ids corrupt the tree shape
            for i in 0..self.child_count() {
                for j in i + 1..self.child_count() {
                    if self.child_id(i) == self.child_id(j) {
                        return Err(Error::corrupt(page_id, "duplicate child id"));
                    }
                }
            }
        }
        Ok(())
    }

    // ---- search -----------------------------------------------------------

    /// Entry location referenced by the vector at byte offset `pos`.
    pub fn entry_loc(&self, pos: usize) -> usize {
        LittleEndian::read_u16(&self.page[self.vec_start() + pos..]) as usize
    }

    fn set_entry_loc(&mut self, pos: usize, loc: usize) {
        let vs = self.vec_start();
        LittleEndian::write_u16(&mut self.page[vs + pos..], loc as u16);
    }

    /// Key bytes of the entry at vector byte offset `pos`.
    pub fn key_at(&self, pos: usize) -> Result<&[u8]> {
        let loc = self.entry_loc(pos);
        let (start, len) = decode_key(&self.page, loc).map_err(|d| Error::corrupt(0, d))?;
        Ok(&self.page[start..start + len])
    }

    /// Binary search for `key`. Returns the even byte offset of the match
    /// within the vector, or the bitwise complement of the insertion offset.
    ///
    /// The bracket tracks how many leading bytes are known equal at each
    /// end, so per-step comparisons skip the shared prefix.
    pub fn binary_search(&self, key: &[u8]) -> Result<i32> {
        self.binary_search_in(key, 0, self.key_count())
    }

    /// `binary_search` with a starting hint, used to find nearby keys
    /// without paying for a full descent bracket.
    pub fn binary_search_hint(&self, key: &[u8], hint_pos: usize) -> Result<i32> {
        let n = self.key_count();
        let hint = (hint_pos / 2).min(n.saturating_sub(1));
        if n == 0 {
            return Ok(!0);
        }
        let (_, ord) = self.compare_key_at(hint * 2, key, 0)?;
        match ord {
            std::cmp::Ordering::Equal => Ok((hint * 2) as i32),
            std::cmp::Ordering::Less => self.binary_search_in(key, hint + 1, n),
            std::cmp::Ordering::Greater => self.binary_search_in(key, 0, hint),
        }
    }

    fn binary_search_in(&self, key: &[u8], mut low: usize, mut high: usize) -> Result<i32> {
        let mut low_match = 0usize;
        let mut high_match = 0usize;
        while low < high {
            let mid = (low + high) >> 1;
            let skip = low_match.min(high_match);
            let (matched, ord) = self.compare_key_at(mid * 2, key, skip)?;
            match ord {
                std::cmp::Ordering::Equal => return Ok((mid * 2) as i32),
                // node key < search key: go right
                std::cmp::Ordering::Less => {
                    low = mid + 1;
                    low_match = matched;
                }
                std::cmp::Ordering::Greater => {
                    high = mid;
                    high_match = matched;
                }
            }
        }
        Ok(!((low * 2) as i32))
    }

    /// Compare the stored key at `pos` against `key`, skipping the first
    /// `skip` bytes which are known equal. Returns the total matched prefix
    /// length and the ordering of stored key vs `key`.
    fn compare_key_at(
        &self,
        pos: usize,
        key: &[u8],
        skip: usize,
    ) -> Result<(usize, std::cmp::Ordering)> {
        let stored = self.key_at(pos)?;
        let limit = stored.len().min(key.len());
        let mut i = skip.min(limit);
        while i < limit {
            let a = stored[i];
            let b = key[i];
            if a != b {
                return Ok((i, if a < b { std::cmp::Ordering::Less } else { std::cmp::Ordering::Greater }));
            }
            i += 1;
        }
        Ok((limit, stored.len().cmp(&key.len())))
    }

    /// Decode the value of the leaf entry at vector byte offset `pos`.
    pub fn leaf_value_at(&self, pos: usize) -> Result<ValueRef> {
        let loc = self.entry_loc(pos);
        let (kstart, klen) = decode_key(&self.page, loc).map_err(|d| Error::corrupt(0, d))?;
        decode_value(&self.page, kstart + klen).map_err(|d| Error::corrupt(0, d))
    }

    pub fn leaf_value_bytes(&self, pos: usize) -> Result<Option<Vec<u8>>> {
        match self.leaf_value_at(pos)? {
            ValueRef::Ghost => Ok(None),
            ValueRef::Slice { start, len, .. } => Ok(Some(self.page[start..start + len].to_vec())),
        }
    }

    /// Total encoded length of the leaf entry at `pos`.
    pub fn leaf_entry_len(&self, pos: usize) -> Result<usize> {
        let loc = self.entry_loc(pos);
        leaf_entry_len_at(&self.page, loc).map_err(|d| Error::corrupt(0, d))
    }

    fn internal_entry_len(&self, pos: usize) -> Result<usize> {
        let loc = self.entry_loc(pos);
        let (kstart, klen) = decode_key(&self.page, loc).map_err(|d| Error::corrupt(0, d))?;
        Ok(kstart - loc + klen)
    }

    // ---- free-space accounting --------------------------------------------

    fn left_gap(&self) -> usize {
        self.vec_start() - self.left_tail()
    }

    fn right_gap(&self) -> usize {
        let tail_area = if self.is_internal() {
            self.child_count() * CHILD_ID_SIZE
        } else {
            0
        };
        (self.right_tail() + 1).saturating_sub(self.vec_end() + 2 + tail_area)
    }

    /// Free bytes usable for new entries before any compaction.
    pub fn available_bytes(&self) -> usize {
        self.left_gap() + self.right_gap()
    }

    /// A leaf with at least half the page free may be merged into a sibling.
    pub fn is_merge_eligible(&self) -> bool {
        self.available_bytes() >= (self.page_size() - HEADER_SIZE) / 2
    }

    // ---- leaf insertion ---------------------------------------------------

    /// Open a vector slot at byte offset `pos` and reserve `len` entry
    /// bytes. On success the slot holds the entry location; the caller
    /// writes the entry bytes.
    pub fn create_leaf_entry(&mut self, pos: usize, len: usize) -> EntrySpace {
        debug_assert!(pos % 2 == 0 && pos <= self.vec_len());
        debug_assert!(self.is_leaf());
        match self.try_make_room(pos, len, 0) {
            Some(loc) => EntrySpace::Loc(loc),
            None => {
                if self.garbage() + self.available_bytes() >= len + 2 {
                    EntrySpace::Compact
                } else {
                    EntrySpace::Full
                }
            }
        }
    }

    /// Shared slot-opening machinery for leaves and internal nodes.
    /// `tail_growth` is the extra room needed past the vector (child ids).
    fn try_make_room(&mut self, pos: usize, len: usize, tail_growth: usize) -> Option<usize> {
        let vec_len = self.vec_len();
        let left_gap = self.left_gap();
        let right_gap = self.right_gap();

        // Fast paths: shift the shorter half of the vector in place.
        // Shifting the left half consumes 2 bytes of the left gap; shifting
        // the right half consumes 2 + tail_growth of the right gap (the
        // child-id area rides along).
        let prefer_left = pos <= vec_len / 2;
        let order = if prefer_left { [true, false] } else { [false, true] };
        for &shift_left in &order {
            if shift_left {
                if left_gap < 2 || right_gap < tail_growth {
                    continue;
                }
                // entry may go in either gap; prefer the larger
                let el = left_gap - 2;
                let er = right_gap - tail_growth;
                let alloc_left = if el >= len && er >= len {
                    el >= er
                } else if el >= len {
                    true
                } else if er >= len {
                    false
                } else {
                    continue;
                };
                let loc = self.alloc_entry(alloc_left, len);
                self.shift_vec_left_half(pos);
                self.set_entry_loc(pos, loc);
                return Some(loc);
            } else {
                if right_gap < 2 + tail_growth {
                    continue;
                }
                let el = left_gap;
                let er = right_gap - 2 - tail_growth;
                let alloc_left = if el >= len && er >= len {
                    el >= er
                } else if el >= len {
                    true
                } else if er >= len {
                    false
                } else {
                    continue;
                };
                let loc = self.alloc_entry(alloc_left, len);
                self.shift_vec_right_half(pos);
                self.set_entry_loc(pos, loc);
                return Some(loc);
            }
        }

        // Slow path: the free space exists but is split awkwardly around the
        // vector. Re-center the vector (bias right) and retry.
        if left_gap + right_gap >= len + 2 + tail_growth {
            return self.recenter_and_make_room(pos, len, tail_growth);
        }
        None
    }

    fn alloc_entry(&mut self, from_left: bool, len: usize) -> usize {
        if from_left {
            let loc = self.left_tail();
            self.set_left_tail(loc + len);
            loc
        } else {
            let tail = self.right_tail();
            self.set_right_tail(tail - len);
            tail - len + 1
        }
    }

    /// Move vector entries `[0, pos)` two bytes left, opening slot `pos`.
    fn shift_vec_left_half(&mut self, pos: usize) {
        let vs = self.vec_start();
        if pos > 0 {
            self.page.copy_within(vs..vs + pos, vs - 2);
        }
        self.set_vec_start(vs - 2);
    }

    /// Move vector entries `[pos, len)` (and the child-id area, if any) two
    /// bytes right, opening slot `pos`.
    fn shift_vec_right_half(&mut self, pos: usize) {
        let vs = self.vec_start();
        let ve = self.vec_end();
        let tail_area = if self.is_internal() {
            self.child_count() * CHILD_ID_SIZE
        } else {
            0
        };
        let end = ve + 2 + tail_area;
        if vs + pos < end {
            self.page.copy_within(vs + pos..end, vs + pos + 2);
        }
        self.set_vec_end(ve + 2);
    }

    fn recenter_and_make_room(&mut self, pos: usize, len: usize, tail_growth: usize) -> Option<usize> {
        let vs = self.vec_start();
        let ve = self.vec_end();
        let tail_area = if self.is_internal() {
            self.child_count() * CHILD_ID_SIZE
        } else {
            0
        };

        // Lift the vector plus child ids out, with the new slot opened.
        let mut tmp = Vec::with_capacity(ve + 2 - vs + 2 + tail_area + tail_growth);
        tmp.extend_from_slice(&self.page[vs..vs + pos]);
        tmp.extend_from_slice(&[0, 0]);
        tmp.extend_from_slice(&self.page[vs + pos..ve + 2 + tail_area]);
        tmp.extend_from_slice(&vec![0; tail_growth]);

        let loc = self.alloc_entry(true, len);
        let left_tail = self.left_tail();
        let free = (self.right_tail() + 1) - left_tail - tmp.len();
        // bias right: keep the larger share of the free space on the left
        let mut new_vs = (left_tail + free - free / 2 + 1) & !1;
        let limit = (self.right_tail() + 1 - tmp.len()) & !1;
        if new_vs > limit {
            new_vs = limit;
        }
        if new_vs < left_tail {
            // an exact fit can lose its last byte to even alignment; undo
            // and let the caller escalate
            self.set_left_tail(loc);
            return None;
        }
        self.page[new_vs..new_vs + tmp.len()].copy_from_slice(&tmp);
        self.set_vec_start(new_vs);
        self.set_vec_end(new_vs + (ve - vs) + 2);
        self.set_entry_loc(pos, loc);
        Some(loc)
    }

    /// Write a leaf entry's bytes at `loc`. `value = None` writes a ghost.
    pub fn write_leaf_entry(&mut self, loc: usize, key: &[u8], value: Option<&[u8]>) {
        let off = write_key(&mut self.page, loc, key);
        write_value(&mut self.page, off, value);
    }

    /// Write separator key bytes at `loc` (internal entry bodies are keys
    /// only).
    pub fn write_key_at(&mut self, loc: usize, key: &[u8]) {
        write_key(&mut self.page, loc, key);
    }

    /// Reserve `len` segment bytes without touching the vector, for a
    /// separator rewritten out of place.
    pub fn alloc_separator(&mut self, len: usize) -> Option<usize> {
        let left = self.left_gap();
        let right = self.right_gap();
        if left >= len && (left >= right || right < len) {
            Some(self.alloc_entry(true, len))
        } else if right >= len {
            Some(self.alloc_entry(false, len))
        } else {
            None
        }
    }

    /// Point the vector slot at byte offset `pos` at a new entry location.
    pub fn set_entry_loc_at(&mut self, pos: usize, loc: usize) {
        self.set_entry_loc(pos, loc);
    }

    /// `create_leaf_entry`, compacting in place first when garbage reclaim
    /// would make room.
    pub fn create_leaf_entry_compacting(&mut self, pos: usize, len: usize) -> Result<EntrySpace> {
        match self.create_leaf_entry(pos, len) {
            EntrySpace::Compact => {
                let scratch = vec![0u8; self.page_size()].into_boxed_slice();
                self.compact(scratch)?;
                Ok(self.create_leaf_entry(pos, len))
            }
            other => Ok(other),
        }
    }

    pub fn create_internal_entry_compacting(
        &mut self,
        pos: usize,
        key_len: usize,
        child_index: usize,
        child_id: PageId,
    ) -> Result<EntrySpace> {
        match self.create_internal_entry(pos, key_len, child_index, child_id) {
            EntrySpace::Compact => {
                let scratch = vec![0u8; self.page_size()].into_boxed_slice();
                self.compact(scratch)?;
                Ok(self.create_internal_entry(pos, key_len, child_index, child_id))
            }
            other => Ok(other),
        }
    }

    /// Replace the value of the entry at `pos` in place when the encoding
    /// fits, otherwise retire the old bytes and reserve fresh space.
    pub fn update_leaf_value(&mut self, pos: usize, value: &[u8]) -> Result<EntrySpace> {
        let loc = self.entry_loc(pos);
        let (kstart, klen) = decode_key(&self.page, loc).map_err(|d| Error::corrupt(0, d))?;
        let voff = kstart + klen;
        let old_vlen = value_encoded_len_at(&self.page, voff).map_err(|d| Error::corrupt(0, d))?;
        let new_vlen = value_encoding_len(value.len());
        if new_vlen <= old_vlen {
            write_value(&mut self.page, voff, Some(value));
            self.add_garbage(old_vlen - new_vlen);
            return Ok(EntrySpace::Loc(loc));
        }

        // Rewrite the whole entry elsewhere; the old span becomes garbage.
        let key = self.page[kstart..kstart + klen].to_vec();
        let old_total = (voff - loc) + old_vlen;
        let new_total = (voff - loc) + new_vlen;
        let left_gap = self.left_gap();
        let right_gap = self.right_gap();
        let alloc_left = if left_gap >= new_total && right_gap >= new_total {
            left_gap >= right_gap
        } else if left_gap >= new_total {
            true
        } else if right_gap >= new_total {
            false
        } else {
            // the old entry stays live (and vector-referenced) until the
            // replacement is actually placed
            return Ok(if self.garbage() + self.available_bytes() >= new_total {
                EntrySpace::Compact
            } else {
                EntrySpace::Full
            });
        };
        self.add_garbage(old_total);
        let new_loc = self.alloc_entry(alloc_left, new_total);
        let off = write_key(&mut self.page, new_loc, &key);
        write_value(&mut self.page, off, Some(value));
        self.set_entry_loc(pos, new_loc);
        Ok(EntrySpace::Loc(new_loc))
    }

    /// Turn the entry's value into a ghost; the value bytes become garbage.
    pub fn ghost_leaf_entry(&mut self, pos: usize) -> Result<()> {
        let loc = self.entry_loc(pos);
        let (kstart, klen) = decode_key(&self.page, loc).map_err(|d| Error::corrupt(0, d))?;
        let voff = kstart + klen;
        let old_vlen = value_encoded_len_at(&self.page, voff).map_err(|d| Error::corrupt(0, d))?;
        self.page[voff] = VALUE_GHOST;
        self.add_garbage(old_vlen - 1);
        Ok(())
    }

    /// Remove the vector slot at `pos`; the entry bytes become garbage.
    pub fn delete_leaf_entry(&mut self, pos: usize) -> Result<()> {
        let entry_len = self.leaf_entry_len(pos)?;
        self.add_garbage(entry_len);
        self.remove_vec_slot(pos);
        Ok(())
    }

    fn remove_vec_slot(&mut self, pos: usize) {
        let vs = self.vec_start();
        let ve = self.vec_end();
        let vec_len = ve + 2 - vs;
        if pos < vec_len / 2 {
            if pos > 0 {
                self.page.copy_within(vs..vs + pos, vs + 2);
            }
            self.set_vec_start(vs + 2);
        } else {
            let tail_area = if self.is_internal() {
                self.child_count() * CHILD_ID_SIZE
            } else {
                0
            };
            if vs + pos + 2 < ve + 2 + tail_area {
                self.page
                    .copy_within(vs + pos + 2..ve + 2 + tail_area, vs + pos);
            }
            self.set_vec_end(ve - 2);
        }
    }

    // ---- internal nodes ---------------------------------------------------

    fn child_area_start(&self) -> usize {
        self.vec_end() + 2
    }

    pub fn child_id(&self, index: usize) -> PageId {
        debug_assert!(index < self.child_count());
        read_child_id(&self.page, self.child_area_start() + index * CHILD_ID_SIZE)
    }

    pub fn set_child_id(&mut self, index: usize, id: PageId) {
        debug_assert!(index < self.child_count());
        let off = self.child_area_start() + index * CHILD_ID_SIZE;
        write_child_id(&mut self.page, off, id);
    }

    /// Child slot index for a descent, from a `binary_search` result.
    pub fn internal_pos(pos: i32) -> usize {
        let ipos = if pos < 0 { !pos } else { pos + 2 };
        (ipos >> 1) as usize
    }

    /// Insert a separator key at vector byte offset `pos` with a new child
    /// id at slot `child_index`. The caller writes the key bytes at the
    /// returned location.
    pub fn create_internal_entry(
        &mut self,
        pos: usize,
        key_len: usize,
        child_index: usize,
        child_id: PageId,
    ) -> EntrySpace {
        debug_assert!(self.is_internal());
        debug_assert!(child_index <= self.child_count());
        let old_children = self.child_count();
        match self.try_make_room(pos, key_len, CHILD_ID_SIZE) {
            Some(loc) => {
                // try_make_room grew the vector; the child area moved with it
                // when the right half shifted. Open the child slot.
                let start = self.child_area_start();
                let end = start + old_children * CHILD_ID_SIZE;
                let at = start + child_index * CHILD_ID_SIZE;
                self.page.copy_within(at..end, at + CHILD_ID_SIZE);
                write_child_id(&mut self.page, at, child_id);
                EntrySpace::Loc(loc)
            }
            None => {
                if self.garbage() + self.available_bytes() >= key_len + 2 + CHILD_ID_SIZE {
                    EntrySpace::Compact
                } else {
                    EntrySpace::Full
                }
            }
        }
    }

    /// Remove the separator at vector offset `pos` and the child pointer at
    /// `child_index` (one of the two children adjacent to the separator).
    pub fn delete_child_ref(&mut self, pos: usize, child_index: usize) -> Result<()> {
        debug_assert!(self.is_internal());
        let entry_len = self.internal_entry_len(pos)?;
        self.add_garbage(entry_len);

        // Drop the child slot first, while the area start is unmoved.
        let start = self.child_area_start();
        let count = self.child_count();
        let at = start + child_index * CHILD_ID_SIZE;
        self.page
            .copy_within(at + CHILD_ID_SIZE..start + count * CHILD_ID_SIZE, at);

        // Then drop the vector slot; the surviving child ids slide with the
        // cheaper half.
        let vs = self.vec_start();
        let ve = self.vec_end();
        let vec_len = ve + 2 - vs;
        if pos < vec_len / 2 {
            if pos > 0 {
                self.page.copy_within(vs..vs + pos, vs + 2);
            }
            self.set_vec_start(vs + 2);
        } else {
            let tail_end = start + (count - 1) * CHILD_ID_SIZE;
            self.page.copy_within(vs + pos + 2..tail_end, vs + pos);
            self.set_vec_end(ve - 2);
        }
        Ok(())
    }

    // ---- compaction -------------------------------------------------------

    /// Rebuild the page into `scratch`, dropping garbage and re-centering
    /// the vector, then adopt `scratch` as the page buffer. Returns the old
    /// buffer for return to the spare pool.
    pub fn compact(&mut self, mut scratch: Box<[u8]>) -> Result<Box<[u8]>> {
        debug_assert_eq!(scratch.len(), self.page_size());
        let n = self.key_count();
        let internal = self.is_internal();

        scratch.fill(0);
        scratch[HDR_TYPE] = self.page[HDR_TYPE];

        // Pack live entries into the left segment in vector order.
        let mut left_tail = HEADER_SIZE;
        let mut locs = Vec::with_capacity(n);
        for i in 0..n {
            let loc = self.entry_loc(i * 2);
            let len = if internal {
                self.internal_entry_len(i * 2)?
            } else {
                self.leaf_entry_len(i * 2)?
            };
            scratch[left_tail..left_tail + len].copy_from_slice(&self.page[loc..loc + len]);
            locs.push(left_tail);
            left_tail += len;
        }

        let tail_area = if internal { (n + 1) * CHILD_ID_SIZE } else { 0 };
        let vec_bytes = n * 2;
        let page_size = self.page_size();
        let free = page_size - left_tail - vec_bytes - tail_area;
        // bias right
        let mut vs = (left_tail + free - free / 2 + 1) & !1;
        let limit = (page_size - vec_bytes - tail_area) & !1;
        if vs > limit {
            vs = limit;
        }
        for (i, loc) in locs.iter().enumerate() {
            LittleEndian::write_u16(&mut scratch[vs + i * 2..], *loc as u16);
        }
        if internal {
            let src = self.child_area_start();
            let dst = vs + vec_bytes;
            scratch[dst..dst + tail_area]
                .copy_from_slice(&self.page[src..src + tail_area]);
        }

        LittleEndian::write_u16(&mut scratch[HDR_GARBAGE..], 0);
        LittleEndian::write_u16(&mut scratch[HDR_LEFT_TAIL..], left_tail as u16);
        LittleEndian::write_u16(&mut scratch[HDR_RIGHT_TAIL..], (page_size - 1) as u16);
        LittleEndian::write_u16(&mut scratch[HDR_VEC_START..], vs as u16);
        LittleEndian::write_u16(&mut scratch[HDR_VEC_END..], (vs + vec_bytes).wrapping_sub(2) as u16);

        Ok(std::mem::replace(&mut self.page, scratch))
    }

    // ---- splits -----------------------------------------------------------

    /// Raw bytes of the leaf entry at `pos`, for transfer to a sibling.
    fn leaf_entry_bytes(&self, pos: usize) -> Result<(usize, usize)> {
        let loc = self.entry_loc(pos);
        let len = self.leaf_entry_len(pos)?;
        Ok((loc, len))
    }

    /// Append a pre-encoded leaf entry to this node's vector (used while
    /// moving entries between siblings; the source guarantees key order).
    pub fn append_entry_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        debug_assert!(self.is_leaf());
        let pos = self.vec_len();
        match self.create_leaf_entry_compacting(pos, bytes.len())? {
            EntrySpace::Loc(loc) => {
                self.page[loc..loc + bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(Error::Assertion("sibling ran out of room mid-move".into())),
        }
    }

    /// Prepend a pre-encoded leaf entry (mirror of `append_entry_bytes`).
    pub fn prepend_entry_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        debug_assert!(self.is_leaf());
        match self.create_leaf_entry_compacting(0, bytes.len())? {
            EntrySpace::Loc(loc) => {
                self.page[loc..loc + bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(Error::Assertion("sibling ran out of room mid-move".into())),
        }
    }

    /// Split this full leaf around an insertion of `key`/`value` at vector
    /// offset `pos`. `sibling` must be a freshly initialized empty node of
    /// the same page size. Returns the separator key and the side (and
    /// final position) the new entry landed on.
    pub fn split_leaf(
        &mut self,
        sibling: &mut NodeInner,
        pos: usize,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<LeafSplit> {
        debug_assert!(self.is_leaf());
        let n = self.key_count();
        let vec_len = self.vec_len();
        let entry_len = encoded_key_len(key.len()) + value_encoding_len(value.map_or(0, |v| v.len()));
        let flags = self.type_flags();

        if pos == 0 {
            // Descending-order load: only the new entry moves to a new left
            // sibling.
            sibling.init(TYPE_LEAF, flags & FLAG_LOW_EXTREMITY);
            self.set_flags(flags & FLAG_HIGH_EXTREMITY);
            let loc = match sibling.create_leaf_entry(0, entry_len) {
                EntrySpace::Loc(loc) => loc,
                _ => return Err(Error::Assertion("empty sibling rejected entry".into())),
            };
            sibling.write_leaf_entry(loc, key, value);
            let sep = mid_key(key, self.key_at(0)?);
            return Ok(LeafSplit {
                new_left: true,
                sep,
                boundary: 0,
                entry_in_sibling: true,
                entry_pos: 0,
            });
        }

        if pos == vec_len {
            // Ascending-order load: only the new entry moves to a new right
            // sibling.
            sibling.init(TYPE_LEAF, flags & FLAG_HIGH_EXTREMITY);
            self.set_flags(flags & FLAG_LOW_EXTREMITY);
            let loc = match sibling.create_leaf_entry(0, entry_len) {
                EntrySpace::Loc(loc) => loc,
                _ => return Err(Error::Assertion("empty sibling rejected entry".into())),
            };
            sibling.write_leaf_entry(loc, key, value);
            let sep = mid_key(self.key_at(vec_len - 2)?, key);
            return Ok(LeafSplit {
                new_left: false,
                sep,
                boundary: n,
                entry_in_sibling: true,
                entry_pos: 0,
            });
        }

        // General case: move trailing entries to a new right sibling until
        // the byte load balances, then place the new entry on its side.
        sibling.init(TYPE_LEAF, flags & FLAG_HIGH_EXTREMITY);
        self.set_flags(flags & FLAG_LOW_EXTREMITY);

        let mut lens = Vec::with_capacity(n);
        let mut total = entry_len + 2;
        for i in 0..n {
            let len = self.leaf_entry_len(i * 2)?;
            lens.push(len);
            total += len + 2;
        }

        debug_assert!(n >= 2);
        let insert_idx = pos / 2;
        let mut boundary = n;
        let mut right_bytes = 0usize;
        while boundary > 1 {
            let cand = lens[boundary - 1] + 2;
            let with_insert = if insert_idx >= boundary - 1 { entry_len + 2 } else { 0 };
            if right_bytes + cand + with_insert > total / 2 && right_bytes > 0 {
                break;
            }
            right_bytes += cand;
            boundary -= 1;
        }
        // never empty either side
        let boundary = boundary.clamp(1, n - 1);

        let mut moved_garbage = 0usize;
        for i in boundary..n {
            let (loc, len) = self.leaf_entry_bytes(i * 2)?;
            let bytes = self.page[loc..loc + len].to_vec();
            sibling.append_entry_bytes(&bytes)?;
            moved_garbage += len;
        }
        self.set_vec_end(self.vec_start() + boundary * 2 - 2);
        self.add_garbage(moved_garbage);

        // Insert the new entry on the side its position falls in; if that
        // side has no room the other side takes it.
        let entry_in_sibling;
        let entry_pos;
        if insert_idx >= boundary {
            let spos = pos - boundary * 2;
            match sibling.create_leaf_entry_compacting(spos, entry_len)? {
                EntrySpace::Loc(loc) => {
                    sibling.write_leaf_entry(loc, key, value);
                    entry_in_sibling = true;
                    entry_pos = spos;
                }
                _ => {
                    let lpos = self.vec_len();
                    match self.create_leaf_entry_compacting(lpos, entry_len)? {
                        EntrySpace::Loc(loc) => {
                            self.write_leaf_entry(loc, key, value);
                            entry_in_sibling = false;
                            entry_pos = lpos;
                        }
                        _ => return Err(Error::Assertion("split could not place entry".into())),
                    }
                }
            }
        } else {
            match self.create_leaf_entry_compacting(pos, entry_len)? {
                EntrySpace::Loc(loc) => {
                    self.write_leaf_entry(loc, key, value);
                    entry_in_sibling = false;
                    entry_pos = pos;
                }
                _ => {
                    match sibling.create_leaf_entry_compacting(0, entry_len)? {
                        EntrySpace::Loc(loc) => {
                            sibling.write_leaf_entry(loc, key, value);
                            entry_in_sibling = true;
                            entry_pos = 0;
                        }
                        _ => return Err(Error::Assertion("split could not place entry".into())),
                    }
                }
            }
        }

        let sep = mid_key(self.key_at(self.vec_len() - 2)?, sibling.key_at(0)?);
        Ok(LeafSplit { new_left: false, sep, boundary, entry_in_sibling, entry_pos })
    }

    /// Split this full internal node around an insertion of `key` at vector
    /// offset `pos` with new child `child_id` at `child_index`. One existing
    /// key (or the incoming key itself) is promoted to the parent.
    pub fn split_internal(
        &mut self,
        sibling: &mut NodeInner,
        pos: usize,
        key: &[u8],
        child_index: usize,
        child_id: PageId,
    ) -> Result<InternalSplit> {
        debug_assert!(self.is_internal());
        let n = self.key_count();
        if n < 2 {
            // the key-size ceiling guarantees room for two separators plus
            // their overhead, so a one-key node never reaches a split
            return Err(Error::Assertion("split of underfull internal node".into()));
        }
        let flags = self.type_flags();
        sibling.init(self.node_type(), flags & FLAG_HIGH_EXTREMITY);
        self.set_flags(flags & FLAG_LOW_EXTREMITY);

        let insert_idx = pos / 2;
        let key_len = encoded_key_len(key.len());

        // Two keys with the insertion in the middle: promote the incoming
        // key without storing it in either half.
        if n == 2 && insert_idx == 1 {
            let k1 = self.key_at(2)?.to_vec();
            let k1_len = self.internal_entry_len(2)?;
            let c1 = self.child_id(1);
            let c2 = self.child_id(2);

            // right half: key1 with children [new, c2]
            let loc = match sibling.create_internal_first(k1_len) {
                Some(loc) => loc,
                None => return Err(Error::Assertion("empty sibling rejected key".into())),
            };
            write_key(&mut sibling.page, loc, &k1);
            sibling.set_child_id(0, child_id);
            sibling.set_child_id(1, c2);
            if let Some(child) = self.children.remove(&c2) {
                sibling.children.insert(c2, child);
            }

            // left half keeps key0 with children [c0, c1]
            self.truncate_internal(1)?;
            debug_assert_eq!(self.child_id(1), c1);
            self.add_garbage(k1_len);
            return Ok(InternalSplit { sep: key.to_vec().into_boxed_slice() });
        }

        // General case: walk keys from the high end until both sides
        // balance; the boundary key is promoted.
        let mut lens = Vec::with_capacity(n);
        let mut total = key_len + 2 + CHILD_ID_SIZE;
        for i in 0..n {
            let len = self.internal_entry_len(i * 2)?;
            lens.push(len);
            total += len + 2 + CHILD_ID_SIZE;
        }
        let mut boundary = n - 1;
        let mut right_bytes = 0usize;
        while boundary > 1 {
            let cand = lens[boundary] + 2 + CHILD_ID_SIZE;
            if right_bytes + cand > total / 2 && right_bytes > 0 {
                break;
            }
            right_bytes += cand;
            boundary -= 1;
        }
        // Keep both halves non-degenerate: the half that does not receive
        // the pending key must retain at least one key of its own. The
        // pending key goes left when `insert_idx <= boundary`; re-guess the
        // boundary once if the initial side proves wrong.
        if insert_idx <= boundary {
            boundary = boundary.min(n - 2);
        } else {
            boundary = boundary.max(1);
        }

        let sep = self.key_at(boundary * 2)?.to_vec().into_boxed_slice();
        let sep_len = self.internal_entry_len(boundary * 2)?;

        // Copy keys (boundary, n) and children [boundary+1, n] to the
        // sibling.
        let move_keys = n - boundary - 1;
        let mut loc_cursor = HEADER_SIZE;
        let mut sib_locs = Vec::with_capacity(move_keys);
        for i in boundary + 1..n {
            let loc = self.entry_loc(i * 2);
            let len = lens[i];
            sibling.page[loc_cursor..loc_cursor + len]
                .copy_from_slice(&self.page[loc..loc + len]);
            sib_locs.push(loc_cursor);
            loc_cursor += len;
        }
        sibling.set_left_tail(loc_cursor);
        let vs = (sibling.page_size() / 2) & !1;
        sibling.set_vec_start(vs);
        sibling.set_vec_end(vs + move_keys * 2 - 2);
        for (i, loc) in sib_locs.iter().enumerate() {
            LittleEndian::write_u16(&mut sibling.page[vs + i * 2..], *loc as u16);
        }
        for i in 0..=move_keys {
            let id = self.child_id(boundary + 1 + i);
            sibling.set_child_id(i, id);
        }

        // Move resident child objects across.
        for i in 0..=move_keys {
            let id = sibling.child_id(i);
            if let Some(child) = self.children.remove(&id) {
                sibling.children.insert(id, child);
            }
        }

        let mut moved = sep_len;
        for len in &lens[boundary + 1..] {
            moved += len;
        }
        self.truncate_internal(boundary)?;
        self.add_garbage(moved);

        // Finally apply the pending insert to the proper side.
        if insert_idx <= boundary {
            let space = self.create_internal_entry_compacting(pos, key_len, child_index, child_id)?;
            match space {
                EntrySpace::Loc(loc) => {
                    self.write_key_at(loc, key);
                }
                _ => return Err(Error::Assertion("split left half rejected key".into())),
            }
        } else {
            let spos = pos - (boundary + 1) * 2;
            let scidx = child_index - (boundary + 1);
            let space = sibling.create_internal_entry_compacting(spos, key_len, scidx, child_id)?;
            match space {
                EntrySpace::Loc(loc) => {
                    sibling.write_key_at(loc, key);
                }
                _ => return Err(Error::Assertion("split right half rejected key".into())),
            }
        }

        Ok(InternalSplit { sep })
    }

    /// First key of a fresh internal node; reserves room for two child ids.
    fn create_internal_first(&mut self, key_len: usize) -> Option<usize> {
        debug_assert_eq!(self.key_count(), 0);
        let loc = HEADER_SIZE;
        if key_len + 2 + 2 * CHILD_ID_SIZE > self.page_size() - HEADER_SIZE {
            return None;
        }
        self.set_left_tail(loc + key_len);
        let vs = (self.page_size() / 2) & !1;
        self.set_vec_start(vs);
        self.set_vec_end(vs);
        LittleEndian::write_u16(&mut self.page[vs..], loc as u16);
        Some(loc)
    }

    /// Keep the first `keep` keys and `keep + 1` children; the child-id
    /// array slides left to follow the shorter vector.
    fn truncate_internal(&mut self, keep: usize) -> Result<()> {
        let old_start = self.child_area_start();
        let keep_children = (keep + 1) * CHILD_ID_SIZE;
        let mut ids = vec![0u8; keep_children];
        ids.copy_from_slice(&self.page[old_start..old_start + keep_children]);
        self.set_vec_end(self.vec_start() + keep * 2 - 2);
        let new_start = self.child_area_start();
        self.page[new_start..new_start + keep_children].copy_from_slice(&ids);
        Ok(())
    }
}

/// Outcome of a leaf split.
pub(crate) struct LeafSplit {
    pub new_left: bool,
    pub sep: Box<[u8]>,
    /// Entries left on the split node, counted before the pending insert
    /// (frame fixups translate pre-split positions across this boundary).
    pub boundary: usize,
    pub entry_in_sibling: bool,
    pub entry_pos: usize,
}

/// Outcome of an internal split.
pub(crate) struct InternalSplit {
    pub sep: Box<[u8]>,
}

// ---- entry codecs ---------------------------------------------------------

/// Encoded length of a key header plus key bytes.
pub(crate) fn encoded_key_len(len: usize) -> usize {
    if (1..=KEY_SMALL_MAX).contains(&len) {
        1 + len
    } else {
        2 + len
    }
}

/// Encoded length of a value header plus value bytes; ghosts encode as a
/// single byte.
pub(crate) fn value_encoding_len(len: usize) -> usize {
    if len <= VALUE_SMALL_MAX {
        1 + len
    } else if len <= VALUE_MEDIUM_MAX {
        2 + len
    } else {
        3 + len
    }
}

pub(crate) fn check_value_len(len: usize) -> Result<()> {
    if len > VALUE_LARGE_MAX {
        return Err(Error::ValueTooLarge { len, max: VALUE_LARGE_MAX });
    }
    Ok(())
}

fn write_key(page: &mut [u8], loc: usize, key: &[u8]) -> usize {
    let len = key.len();
    let start = if (1..=KEY_SMALL_MAX).contains(&len) {
        page[loc] = (len - 1) as u8;
        loc + 1
    } else {
        debug_assert!(len <= KEY_MAX);
        page[loc] = 0x80 | ((len >> 8) as u8 & 0x3f);
        page[loc + 1] = len as u8;
        loc + 2
    };
    page[start..start + len].copy_from_slice(key);
    start + len
}

/// Returns `(key_start, key_len)` for the entry at `loc`.
fn decode_key(page: &[u8], loc: usize) -> std::result::Result<(usize, usize), String> {
    let h = *page.get(loc).ok_or("key header out of bounds")?;
    if h & 0x80 == 0 {
        if h & 0x40 != 0 {
            return Err(format!("bad key header {h:#x}"));
        }
        let len = (h & 0x3f) as usize + 1;
        if loc + 1 + len > page.len() {
            return Err("key bytes out of bounds".into());
        }
        Ok((loc + 1, len))
    } else {
        if h & 0x40 != 0 {
            return Err(format!("bad key header {h:#x}"));
        }
        let h2 = *page.get(loc + 1).ok_or("key header out of bounds")? as usize;
        let len = (((h & 0x3f) as usize) << 8) | h2;
        if loc + 2 + len > page.len() {
            return Err("key bytes out of bounds".into());
        }
        Ok((loc + 2, len))
    }
}

fn write_value(page: &mut [u8], off: usize, value: Option<&[u8]>) {
    let Some(value) = value else {
        page[off] = VALUE_GHOST;
        return;
    };
    let len = value.len();
    let start = if len <= VALUE_SMALL_MAX {
        page[off] = len as u8;
        off + 1
    } else if len <= VALUE_MEDIUM_MAX {
        let enc = len - 1;
        page[off] = 0x80 | ((enc >> 8) as u8 & 0x0f);
        page[off + 1] = enc as u8;
        off + 2
    } else {
        debug_assert!(len <= VALUE_LARGE_MAX);
        let enc = len - 1;
        page[off] = 0x90 | ((enc >> 16) as u8 & 0x0f);
        page[off + 1] = (enc >> 8) as u8;
        page[off + 2] = enc as u8;
        off + 3
    };
    page[start..start + len].copy_from_slice(value);
}

fn decode_value(page: &[u8], off: usize) -> std::result::Result<ValueRef, String> {
    let h = *page.get(off).ok_or("value header out of bounds")?;
    if h & 0x80 == 0 {
        return Ok(ValueRef::Slice { start: off + 1, len: h as usize, fragmented: false });
    }
    if h == VALUE_GHOST {
        return Ok(ValueRef::Ghost);
    }
    if h & 0xc0 != 0x80 {
        return Err(format!("bad value header {h:#x}"));
    }
    let fragmented = h & VALUE_FRAGMENTED_BIT != 0;
    if h & 0x10 == 0 {
        let h2 = *page.get(off + 1).ok_or("value header out of bounds")? as usize;
        let len = ((((h & 0x0f) as usize) << 8) | h2) + 1;
        Ok(ValueRef::Slice { start: off + 2, len, fragmented })
    } else {
        let h2 = *page.get(off + 1).ok_or("value header out of bounds")? as usize;
        let h3 = *page.get(off + 2).ok_or("value header out of bounds")? as usize;
        let len = ((((h & 0x0f) as usize) << 16) | (h2 << 8) | h3) + 1;
        Ok(ValueRef::Slice { start: off + 3, len, fragmented })
    }
}

/// Header-plus-bytes length of the value starting at `off`.
fn value_encoded_len_at(page: &[u8], off: usize) -> std::result::Result<usize, String> {
    match decode_value(page, off)? {
        ValueRef::Ghost => Ok(1),
        ValueRef::Slice { start, len, .. } => Ok(start - off + len),
    }
}

fn leaf_entry_len_at(page: &[u8], loc: usize) -> std::result::Result<usize, String> {
    let (kstart, klen) = decode_key(page, loc)?;
    let voff = kstart + klen;
    Ok(voff - loc + value_encoded_len_at(page, voff)?)
}

fn read_child_id(page: &[u8], off: usize) -> PageId {
    LittleEndian::read_u64(&page[off..off + 8]) & ((1 << 48) - 1)
}

fn write_child_id(page: &mut [u8], off: usize, id: PageId) {
    LittleEndian::write_u64(&mut page[off..off + 8], id);
}

/// Shortest byte string strictly greater than `low` and not greater than
/// `high`. Used as a suffix-compressed split separator.
pub(crate) fn mid_key(low: &[u8], high: &[u8]) -> Box<[u8]> {
    debug_assert!(low < high);
    let mut i = 0;
    while i < low.len() && i < high.len() && low[i] == high[i] {
        i += 1;
    }
    high[..(i + 1).min(high.len())].to_vec().into_boxed_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(page_size: usize) -> NodeInner {
        let mut inner = NodeInner {
            page: vec![0u8; page_size].into_boxed_slice(),
            children: HashMap::new(),
            split: None,
            closed: false,
        };
        inner.init(TYPE_LEAF, FLAG_LOW_EXTREMITY | FLAG_HIGH_EXTREMITY);
        inner
    }

    fn insert(node: &mut NodeInner, key: &[u8], value: &[u8]) -> bool {
        let pos = match node.binary_search(key).unwrap() {
            pos if pos >= 0 => panic!("duplicate key"),
            pos => (!pos) as usize,
        };
        let len = encoded_key_len(key.len()) + value_encoding_len(value.len());
        match node.create_leaf_entry(pos, len) {
            EntrySpace::Loc(loc) => {
                node.write_leaf_entry(loc, key, Some(value));
                true
            }
            _ => false,
        }
    }

    fn find(node: &NodeInner, key: &[u8]) -> Option<Vec<u8>> {
        match node.binary_search(key).unwrap() {
            pos if pos >= 0 => node.leaf_value_bytes(pos as usize).unwrap(),
            _ => None,
        }
    }

    #[test]
    fn insert_find_roundtrip() {
        let mut node = leaf(512);
        assert!(insert(&mut node, b"banana", b"yellow"));
        assert!(insert(&mut node, b"apple", b"red"));
        assert!(insert(&mut node, b"cherry", b"dark"));

        assert_eq!(find(&node, b"apple").unwrap(), b"red");
        assert_eq!(find(&node, b"banana").unwrap(), b"yellow");
        assert_eq!(find(&node, b"cherry").unwrap(), b"dark");
        assert!(find(&node, b"durian").is_none());

        // strictly ascending vector
        assert_eq!(node.key_at(0).unwrap(), b"apple");
        assert_eq!(node.key_at(2).unwrap(), b"banana");
        assert_eq!(node.key_at(4).unwrap(), b"cherry");
    }

    #[test]
    fn delete_accumulates_garbage_and_compact_reclaims() {
        let mut node = leaf(512);
        for i in 0..8u8 {
            insert(&mut node, &[b'k', i], &[b'v'; 20]);
        }
        assert_eq!(node.garbage(), 0);
        let pos = node.binary_search(&[b'k', 3]).unwrap() as usize;
        node.delete_leaf_entry(pos).unwrap();
        let expected = encoded_key_len(2) + value_encoding_len(20);
        assert_eq!(node.garbage(), expected);

        let scratch = vec![0u8; 512].into_boxed_slice();
        node.compact(scratch).unwrap();
        assert_eq!(node.garbage(), 0);
        assert_eq!(node.key_count(), 7);
        assert!(find(&node, &[b'k', 3]).is_none());
        assert_eq!(find(&node, &[b'k', 4]).unwrap(), vec![b'v'; 20]);
    }

    #[test]
    fn ghost_keeps_key_visible_to_search() {
        let mut node = leaf(512);
        insert(&mut node, b"key", b"value");
        let pos = node.binary_search(b"key").unwrap() as usize;
        node.ghost_leaf_entry(pos).unwrap();
        assert_eq!(node.leaf_value_at(pos).unwrap(), ValueRef::Ghost);
        assert!(node.leaf_value_bytes(pos).unwrap().is_none());
        // 5 value bytes orphaned; the 1-byte short header became the ghost
        assert_eq!(node.garbage(), 5);
    }

    #[test]
    fn update_in_place_and_realloc() {
        let mut node = leaf(512);
        insert(&mut node, b"key", b"long-initial-value");
        let pos = node.binary_search(b"key").unwrap() as usize;

        // shrinking fits in place
        node.update_leaf_value(pos, b"tiny").unwrap();
        assert_eq!(find(&node, b"key").unwrap(), b"tiny");

        // growing reallocates within the node
        node.update_leaf_value(pos, &[b'x'; 100]).unwrap();
        assert_eq!(find(&node, b"key").unwrap(), vec![b'x'; 100]);
        assert!(node.garbage() > 0);
    }

    #[test]
    fn fills_then_reports_full() {
        let mut node = leaf(256);
        let mut stored = 0;
        for i in 0..100u8 {
            if !insert(&mut node, &[b'k', i], &[b'v'; 16]) {
                break;
            }
            stored += 1;
        }
        assert!(stored > 0 && stored < 100);
        // with no garbage, the failed insert reported Full, not Compact
        let len = encoded_key_len(2) + value_encoding_len(16);
        assert_eq!(node.create_leaf_entry(0, len), EntrySpace::Full);
    }

    #[test]
    fn split_leaf_balances_bytes() {
        let mut node = leaf(512);
        let mut i = 0u8;
        while insert(&mut node, &[b'k', i], &[b'v'; 24]) {
            i += 1;
        }
        let n = node.key_count();

        let mut sibling = leaf(512);
        let split = node
            .split_leaf(&mut sibling, node.vec_len() / 2, &[b'k', i, 0], Some(&[b'v'; 24]))
            .unwrap();
        assert!(!split.new_left);
        assert!(node.key_count() >= 1);
        assert!(sibling.key_count() >= 1);
        assert_eq!(node.key_count() + sibling.key_count(), n + 1);

        // separator between the halves
        let left_max = node.key_at(node.vec_len() - 2).unwrap().to_vec();
        let right_min = sibling.key_at(0).unwrap().to_vec();
        assert!(left_max < split.sep.to_vec());
        assert!(split.sep.to_vec() <= right_min);
    }

    #[test]
    fn split_leaf_ascending_moves_only_new_entry() {
        let mut node = leaf(512);
        let mut i = 0u8;
        while insert(&mut node, &[b'k', i], &[b'v'; 24]) {
            i += 1;
        }
        let n = node.key_count();
        let mut sibling = leaf(512);
        let split = node
            .split_leaf(&mut sibling, node.vec_len(), &[b'z'], Some(b"last"))
            .unwrap();
        assert!(!split.new_left);
        assert!(split.entry_in_sibling);
        assert_eq!(node.key_count(), n);
        assert_eq!(sibling.key_count(), 1);
    }

    #[test]
    fn split_leaf_descending_moves_only_new_entry() {
        let mut node = leaf(512);
        let mut i = 255u8;
        while insert(&mut node, &[b'k', i], &[b'v'; 24]) {
            i -= 1;
        }
        let n = node.key_count();
        let mut sibling = leaf(512);
        let split = node
            .split_leaf(&mut sibling, 0, &[b'a'], Some(b"first"))
            .unwrap();
        assert!(split.new_left);
        assert!(split.entry_in_sibling);
        assert_eq!(node.key_count(), n);
        assert_eq!(sibling.key_count(), 1);
    }

    #[test]
    fn mid_key_is_shortest_separator() {
        assert_eq!(mid_key(b"apple", b"banana").as_ref(), b"b");
        assert_eq!(mid_key(b"abcX", b"abcZ").as_ref(), b"abcZ");
        assert_eq!(mid_key(b"ab", b"abc").as_ref(), b"abc");
    }

    #[test]
    fn ghost_header_collides_with_no_short_value() {
        // Short values keep the top bit clear, so 0xff can never be read as
        // a live value header.
        for len in 0..=VALUE_SMALL_MAX {
            assert_ne!(len as u8, VALUE_GHOST);
            assert_eq!((len as u8) & 0x80, 0);
        }
    }

    #[test]
    fn value_header_roundtrip_all_sizes() {
        let mut page = vec![0u8; VALUE_LARGE_MAX + 16];
        for len in [0usize, 1, 127, 128, 4096, 4097, 100_000, VALUE_LARGE_MAX] {
            let value = vec![0x42u8; len];
            write_value(&mut page, 0, Some(&value));
            match decode_value(&page, 0).unwrap() {
                ValueRef::Slice { start, len: dlen, fragmented } => {
                    assert_eq!(dlen, len, "length roundtrip for {len}");
                    assert!(!fragmented);
                    assert_eq!(start - 0, value_encoding_len(len) - len);
                }
                ValueRef::Ghost => panic!("unexpected ghost"),
            }
        }
    }

    #[test]
    fn internal_entry_and_child_ops() {
        let mut node = NodeInner {
            page: vec![0u8; 512].into_boxed_slice(),
            children: HashMap::new(),
            split: None,
            closed: false,
        };
        node.init_root_internal(true, b"m", 10, 11).unwrap();
        assert_eq!(node.key_count(), 1);
        assert_eq!(node.child_id(0), 10);
        assert_eq!(node.child_id(1), 11);
        assert_eq!(node.node_type(), TYPE_BOTTOM_INTERNAL);

        // insert separator "t" with new right child 12
        let pos = match node.binary_search(b"t").unwrap() {
            p if p >= 0 => p as usize,
            p => (!p) as usize,
        };
        let klen = encoded_key_len(1);
        match node.create_internal_entry(pos, klen, 2, 12) {
            EntrySpace::Loc(loc) => node.write_key_at(loc, b"t"),
            other => panic!("expected room, got {other:?}"),
        }
        assert_eq!(node.key_count(), 2);
        assert_eq!(node.child_id(0), 10);
        assert_eq!(node.child_id(1), 11);
        assert_eq!(node.child_id(2), 12);

        // descent routing
        assert_eq!(NodeInner::internal_pos(node.binary_search(b"a").unwrap()), 0);
        assert_eq!(NodeInner::internal_pos(node.binary_search(b"m").unwrap()), 1);
        assert_eq!(NodeInner::internal_pos(node.binary_search(b"p").unwrap()), 1);
        assert_eq!(NodeInner::internal_pos(node.binary_search(b"t").unwrap()), 2);
        assert_eq!(NodeInner::internal_pos(node.binary_search(b"z").unwrap()), 2);

        // drop separator "t" and its right child
        node.delete_child_ref(2, 2).unwrap();
        assert_eq!(node.key_count(), 1);
        assert_eq!(node.child_id(0), 10);
        assert_eq!(node.child_id(1), 11);
        assert_eq!(NodeInner::internal_pos(node.binary_search(b"z").unwrap()), 1);
    }

    #[test]
    fn internal_split_two_keys_middle_promotes_incoming() {
        let mut node = NodeInner {
            page: vec![0u8; 512].into_boxed_slice(),
            children: HashMap::new(),
            split: None,
            closed: false,
        };
        node.init_root_internal(false, b"g", 10, 11).unwrap();
        match node.create_internal_entry(2, encoded_key_len(1), 2, 12) {
            EntrySpace::Loc(loc) => node.write_key_at(loc, b"t"),
            other => panic!("expected room, got {other:?}"),
        }
        // keys [g, t], children [10, 11, 12]; a middle insert promotes the
        // incoming key itself
        let mut sibling = NodeInner {
            page: vec![0u8; 512].into_boxed_slice(),
            children: HashMap::new(),
            split: None,
            closed: false,
        };
        let outcome = node.split_internal(&mut sibling, 2, b"m", 2, 13).unwrap();
        assert_eq!(outcome.sep.as_ref(), b"m");

        assert_eq!(node.key_count(), 1);
        assert_eq!(node.key_at(0).unwrap(), b"g");
        assert_eq!(node.child_id(0), 10);
        assert_eq!(node.child_id(1), 11);

        assert_eq!(sibling.key_count(), 1);
        assert_eq!(sibling.key_at(0).unwrap(), b"t");
        assert_eq!(sibling.child_id(0), 13);
        assert_eq!(sibling.child_id(1), 12);
    }

    #[test]
    fn validate_rejects_corruption() {
        let mut node = leaf(512);
        insert(&mut node, b"b", b"2");
        insert(&mut node, b"a", b"1");
        node.validate(7).unwrap();

        // reserved byte must be zero
        node.page[HDR_RESERVED] = 1;
        assert!(matches!(node.validate(7), Err(Error::CorruptPage { .. })));
        node.page[HDR_RESERVED] = 0;

        // unknown type nibble
        let t = node.page[HDR_TYPE];
        node.page[HDR_TYPE] = 0xf0;
        assert!(matches!(node.validate(7), Err(Error::CorruptPage { .. })));
        node.page[HDR_TYPE] = t;

        // swap the two vector slots to invert key order
        let vs = node.vec_start();
        let a = LittleEndian::read_u16(&node.page[vs..]);
        let b = LittleEndian::read_u16(&node.page[vs + 2..]);
        LittleEndian::write_u16(&mut node.page[vs..], b);
        LittleEndian::write_u16(&mut node.page[vs + 2..], a);
        assert!(matches!(node.validate(7), Err(Error::CorruptPage { .. })));
    }

    #[test]
    fn binary_search_hint_matches_plain_search() {
        let mut node = leaf(2048);
        for i in 0..40u8 {
            insert(&mut node, &[b'k', i * 2], b"v");
        }
        for probe in 0..80u8 {
            let key = [b'k', probe];
            let plain = node.binary_search(&key).unwrap();
            for hint in [0usize, 10, 38, 78] {
                assert_eq!(node.binary_search_hint(&key, hint).unwrap(), plain);
            }
        }
    }
}
