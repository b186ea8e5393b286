//! The raw intrusive skip list.
//!
//! This module implements the concurrency protocol: lock-free traversal over
//! per-layer forward pointers, combined with fine-grained per-node locking
//! (`being_modified`) for structural mutation. It never allocates or frees
//! user records; callers embed a [`Node`] in their own structs and are
//! responsible for keeping that storage alive until the node has been
//! unlinked *and* no concurrent reader can still hold a pointer to it
//! (epoch reclamation, hazard pointers, or coarse quiescence at a higher
//! layer; [`crate::set`] is one such layer).

use core::cell::UnsafeCell;
use core::cmp::Ordering;
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize};

use crossbeam_utils::{Backoff, CachePadded};
use thiserror::Error;

use crate::comparator::CompareFn;

/// Maximum number of layers a list can be configured with.
///
/// `Config::max_layer` must not exceed this; a node's `top_layer` is
/// consequently at most `MAX_LAYER - 1`. The byte-sized field could in
/// principle count to 255, but the logical cap is the only one in force.
pub const MAX_LAYER: usize = 12;

/// An intrusive skip list node header.
///
/// Embed this as the **first** field of a `#[repr(C)]` record (or recover the
/// record through any other stable header→record mapping) and hand pointers
/// to it to [`RawSkipList`]. A fresh node is not a member of any list; all
/// linkage state is owned by the list while the node is present.
///
/// A node may be reinserted after a successful erase, once the caller has
/// made sure no concurrent reader can still observe it.
pub struct Node {
    /// Forward pointers, one per layer in `0..=top_layer`.
    ///
    /// The box is (re)sized by `insert` while the node is unpublished and
    /// exclusively owned by the inserting thread; once the node is reachable
    /// the slice itself is never resized and all access goes through the
    /// `AtomicPtr`s.
    tower: UnsafeCell<Box<[AtomicPtr<Node>]>>,

    /// Highest layer this node occupies. Fixed per insertion cycle.
    top_layer: AtomicU8,

    /// Publication flag: false until the node is reachable from layer 0,
    /// cleared again once a remover has unlinked it.
    is_fully_linked: AtomicBool,

    /// Per-node lock bit. A writer CASes this before mutating the node's
    /// forward pointers (as a predecessor) or removing the node itself.
    being_modified: AtomicBool,

    /// Tombstone: once set, traversal treats the node as absent even while
    /// it is still physically linked.
    removed: AtomicBool,
}

// The `UnsafeCell` around the tower is only mutated while the node is
// unpublished and owned by a single thread; everything else is atomic.
unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    /// Creates a detached node header with an empty tower.
    pub fn new() -> Node {
        Node {
            tower: UnsafeCell::new(Vec::new().into_boxed_slice()),
            top_layer: AtomicU8::new(0),
            is_fully_linked: AtomicBool::new(false),
            being_modified: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    /// Returns `true` if this node carries the removal tombstone.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Acquire)
    }

    /// A node is live iff it has been published and not tombstoned. Only
    /// live nodes are visible to traversal.
    fn is_live(&self) -> bool {
        self.is_fully_linked.load(Acquire) && !self.removed.load(Acquire)
    }

    fn top_layer(&self) -> usize {
        self.top_layer.load(Relaxed) as usize
    }

    /// The forward pointer at `layer`. Panics if the tower is smaller.
    fn next(&self, layer: usize) -> &AtomicPtr<Node> {
        unsafe { &(*self.tower.get())[layer] }
    }

    /// Prepares the node for (re)insertion: clears all flags and makes sure
    /// the tower has exactly `top_layer + 1` slots.
    ///
    /// Must only be called while the node is not in any list and no other
    /// thread can access it.
    unsafe fn init(&self, top_layer: usize) {
        debug_assert!(top_layer < MAX_LAYER);

        self.is_fully_linked.store(false, Relaxed);
        self.being_modified.store(false, Relaxed);
        self.removed.store(false, Relaxed);

        let tower = &mut *self.tower.get();
        if tower.len() != top_layer + 1 {
            *tower = (0..=top_layer)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect();
        }
        self.top_layer.store(top_layer as u8, Relaxed);
    }
}

impl Default for Node {
    fn default() -> Node {
        Node::new()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("top_layer", &self.top_layer())
            .field("is_fully_linked", &self.is_fully_linked.load(Relaxed))
            .field("being_modified", &self.being_modified.load(Relaxed))
            .field("removed", &self.removed.load(Relaxed))
            .finish()
    }
}

/// List configuration.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Denominator of the geometric layer distribution: a node reaches layer
    /// `L + 1` with probability `1 / fanout`. Must be at least 1 (a fanout
    /// of 1 grows every tower to `max_layer`, which is legal but pointless).
    pub fanout: usize,
    /// Number of layers searches descend through, in `1..=MAX_LAYER`.
    /// Should cover `log_fanout(expected_len)`.
    pub max_layer: usize,
    /// Opaque value passed verbatim to the comparator.
    pub aux: *mut (),
}

impl Default for Config {
    fn default() -> Config {
        Config {
            fanout: 4,
            max_layer: MAX_LAYER,
            aux: ptr::null_mut(),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.fanout == 0 {
            return Err(ConfigError::InvalidFanout);
        }
        if self.max_layer == 0 || self.max_layer > MAX_LAYER {
            return Err(ConfigError::InvalidMaxLayer);
        }
        Ok(())
    }
}

/// Error returned by [`RawSkipList::with_config`] and
/// [`RawSkipList::set_config`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `fanout` was zero.
    #[error("fanout must be at least 1")]
    InvalidFanout,
    /// `max_layer` was zero or larger than [`MAX_LAYER`].
    #[error("max_layer must be in 1..=MAX_LAYER")]
    InvalidMaxLayer,
    /// The configuration of a non-empty list cannot change.
    #[error("configuration can only change while the list is empty")]
    NotEmpty,
}

/// Error returned by [`RawSkipList::erase`] and [`RawSkipList::erase_node`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EraseError {
    /// The tombstone was already set when the call started.
    #[error("node was already removed")]
    AlreadyRemoved,
    /// Another writer holds the node's lock bit; the caller may retry.
    /// [`RawSkipList::erase`] retries this internally.
    #[error("node is being modified by another writer")]
    Busy,
    /// A concurrent remover finished unlinking the node between this call's
    /// lock acquisition and its re-search.
    #[error("node was already unlinked by a concurrent remover")]
    AlreadyUnlinked,
    /// No live node compared equal to the query.
    #[error("no matching node in the list")]
    NotFound,
}

/// Frequently written data, padded to its own cache line.
struct HotData {
    /// Seed for layer sampling.
    seed: AtomicUsize,
    /// Number of live entries; approximate under concurrent mutation.
    len: AtomicUsize,
}

/// Predecessors recorded during a writer's descent, plus which of their lock
/// bits this writer currently holds.
///
/// Locks are acquired top-down; `locked_from` is the lowest locked layer.
/// Releasing honors the same deduplication rule as acquisition: at layer `L`
/// the bit is cleared iff `L == top` or `prevs[L] != prevs[L + 1]`, so each
/// distinct predecessor is released exactly once. Dropping the frame
/// releases everything still held, which also unwinds cleanly if the
/// comparator panics mid-descent.
struct LockFrame {
    prevs: [*const Node; MAX_LAYER],
    locked_from: usize,
    top: usize,
}

impl LockFrame {
    fn new(top: usize) -> LockFrame {
        LockFrame {
            prevs: [ptr::null(); MAX_LAYER],
            locked_from: top + 1,
            top,
        }
    }

    /// Makes sure `prevs[layer]`'s lock bit is held by this writer, either
    /// by reusing the bit already held for the same node one layer up or by
    /// CASing it. Returns `false` (frame unchanged) if the CAS loses.
    fn try_lock(&mut self, layer: usize) -> bool {
        if layer < self.top && ptr::eq(self.prevs[layer], self.prevs[layer + 1]) {
            // Same predecessor as the layer above: the bit is already ours.
            self.locked_from = layer;
            return true;
        }
        let prev = unsafe { &*self.prevs[layer] };
        if prev
            .being_modified
            .compare_exchange(false, true, AcqRel, Acquire)
            .is_ok()
        {
            self.locked_from = layer;
            true
        } else {
            false
        }
    }

    fn release_all(&mut self) {
        for layer in self.locked_from..=self.top {
            if layer == self.top || !ptr::eq(self.prevs[layer], self.prevs[layer + 1]) {
                let prev = unsafe { &*self.prevs[layer] };
                debug_assert!(prev.being_modified.load(Relaxed));
                prev.being_modified.store(false, Release);
            }
        }
        self.locked_from = self.top + 1;
    }
}

impl Drop for LockFrame {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// A concurrent intrusive skip list.
///
/// Multiple reader and writer threads may operate on the list through a
/// shared reference. Readers never block; writers lock individual
/// predecessor nodes and retry on interference.
///
/// The list stores only pointers to caller-owned [`Node`] headers. Keys are
/// never copied; ordering comes from the comparator callback, which receives
/// the two node headers and the configured `aux` value and must implement a
/// total order that is stable for as long as a node is in the list.
pub struct RawSkipList {
    // Sentinels are boxed so their addresses survive moves of the list
    // itself; forward pointers of real nodes reference them directly.
    head: Box<Node>,
    tail: Box<Node>,
    cmp: CompareFn,
    config: Config,
    hot: CachePadded<HotData>,
}

// Callers vouch for the comparator and `aux` being usable from any thread
// when they share the list; every node-facing entry point is already unsafe.
unsafe impl Send for RawSkipList {}
unsafe impl Sync for RawSkipList {}

impl RawSkipList {
    /// Creates an empty list with the default [`Config`], wiring head to
    /// tail at every layer.
    pub fn new(cmp: CompareFn) -> RawSkipList {
        match RawSkipList::with_config(Config::default(), cmp) {
            Ok(list) => list,
            // The default config always validates.
            Err(_) => unreachable!(),
        }
    }

    /// Creates an empty list with the given configuration.
    pub fn with_config(config: Config, cmp: CompareFn) -> Result<RawSkipList, ConfigError> {
        config.validate()?;

        let head = Box::new(Node::new());
        let tail = Box::new(Node::new());
        // Sentinel towers always span MAX_LAYER so `max_layer` can be raised
        // later without rebuilding them.
        unsafe {
            head.init(MAX_LAYER - 1);
            tail.init(MAX_LAYER - 1);
        }
        let tail_ptr: *mut Node = &*tail as *const Node as *mut Node;
        for layer in 0..MAX_LAYER {
            head.next(layer).store(tail_ptr, Relaxed);
            tail.next(layer).store(ptr::null_mut(), Relaxed);
        }
        head.is_fully_linked.store(true, Relaxed);
        tail.is_fully_linked.store(true, Relaxed);

        Ok(RawSkipList {
            head,
            tail,
            cmp,
            config,
            hot: CachePadded::new(HotData {
                seed: AtomicUsize::new(1),
                len: AtomicUsize::new(0),
            }),
        })
    }

    /// Returns a copy of the current configuration.
    pub fn config(&self) -> Config {
        self.config
    }

    /// Replaces the configuration.
    ///
    /// Only allowed while the list is empty: populated express lanes above a
    /// shrunken `max_layer` would become unreachable to searches but still
    /// need maintenance during unlink.
    pub fn set_config(&mut self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        if !self.is_empty() {
            return Err(ConfigError::NotEmpty);
        }
        self.config = config;
        Ok(())
    }

    /// Returns the number of live entries.
    ///
    /// Under concurrent mutation this is an approximation without any
    /// guarantees.
    pub fn len(&self) -> usize {
        let len = self.hot.len.load(Relaxed);

        // The counter is maintained with relaxed increments/decrements and
        // may transiently underflow; treat wrapped values as empty.
        if len > isize::MAX as usize {
            0
        } else {
            len
        }
    }

    /// Returns `true` if the list holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples a node's top layer from the geometric distribution
    /// configured by `fanout`, capped at `max_layer - 1`.
    fn sample_top_layer(&self) -> usize {
        // Pseudorandom number generation from "Xorshift RNGs" by George
        // Marsaglia; one draw per coin flip. The seed is shared without
        // synchronization; racing writers merely correlate their draws.
        let mut num = self.hot.seed.load(Relaxed);
        let mut layer = 0;
        loop {
            num ^= num << 13;
            num ^= num >> 17;
            num ^= num << 5;
            if layer + 1 < self.config.max_layer && num % self.config.fanout == 0 {
                layer += 1;
            } else {
                break;
            }
        }
        self.hot.seed.store(num, Relaxed);
        layer
    }

    /// Three-way comparison with the sentinels folded in: head sorts below
    /// everything, tail above everything, identical pointers are equal.
    pub(crate) unsafe fn compare(&self, a: &Node, b: &Node) -> Ordering {
        if ptr::eq(a, b) {
            return Ordering::Equal;
        }
        if ptr::eq(a, &*self.head) || ptr::eq(b, &*self.tail) {
            return Ordering::Less;
        }
        if ptr::eq(a, &*self.tail) || ptr::eq(b, &*self.head) {
            return Ordering::Greater;
        }
        (self.cmp)(a, b, self.config.aux)
    }

    /// Follows `cur`'s forward pointer at `layer`, skipping nodes that are
    /// not live, and returns the first live node (possibly the tail).
    ///
    /// Never blocks and never allocates. It is fine to walk through a
    /// tombstoned node: its forward pointers keep pointing at valid
    /// successors until the node is reclaimed.
    unsafe fn next_live<'a>(&'a self, cur: &'a Node, layer: usize) -> &'a Node {
        debug_assert!(!ptr::eq(cur, &*self.tail));
        // Acquire pairs with the Release splice stores and makes the
        // successor's tower contents visible before we chase them.
        let mut next = cur.next(layer).load(Acquire);
        loop {
            match next.as_ref() {
                None => return &self.tail,
                Some(n) if n.is_live() => return n,
                Some(n) => next = n.next(layer).load(Acquire),
            }
        }
    }

    unsafe fn is_live_ptr(&self, node: *const Node) -> bool {
        (*node).is_live()
    }

    fn non_sentinel(&self, node: &Node) -> Option<NonNull<Node>> {
        if ptr::eq(node, &*self.head) || ptr::eq(node, &*self.tail) {
            None
        } else {
            Some(NonNull::from(node))
        }
    }

    /// Inserts a caller-owned node.
    ///
    /// The node becomes a live member once this returns; interference from
    /// concurrent writers is resolved internally by retrying.
    ///
    /// # Safety
    ///
    /// * `node` must point to a valid [`Node`] that is not currently in any
    ///   list and is not accessed by any other thread until this returns.
    /// * The node's storage must stay valid until it has been erased and no
    ///   concurrent reader can still reach it.
    /// * The comparator must assign the node a position distinct from every
    ///   live member: inserting a key equal to an existing one is undefined
    ///   at this layer.
    pub unsafe fn insert(&self, node: NonNull<Node>) {
        let top = self.sample_top_layer();
        let node_ref = node.as_ref();
        node_ref.init(top);

        let max_layer = self.config.max_layer;
        let backoff = Backoff::new();

        'retry: loop {
            let mut frame = LockFrame::new(top);
            let mut nexts: [*const Node; MAX_LAYER] = [ptr::null(); MAX_LAYER];
            let mut cur: &Node = &self.head;

            let mut layer = max_layer;
            while layer > 0 {
                layer -= 1;

                // Advance until the node sorts at or before the next live
                // successor on this layer.
                let mut next = self.next_live(cur, layer);
                while self.compare(node_ref, next) == Ordering::Greater {
                    cur = next;
                    next = self.next_live(cur, layer);
                }

                if layer <= top {
                    frame.prevs[layer] = cur as *const Node;
                    nexts[layer] = next as *const Node;

                    if !frame.try_lock(layer) {
                        backoff.spin();
                        continue 'retry;
                    }

                    // The neighborhood was captured before the lock; make
                    // sure it still stands. Once the predecessor's bit is
                    // ours nobody else can splice through it.
                    if !self.is_live_ptr(frame.prevs[layer])
                        || !self.is_live_ptr(nexts[layer])
                        || !ptr::eq(self.next_live(cur, layer), next)
                    {
                        backoff.spin();
                        continue 'retry;
                    }

                    // Safe to set before publication: nobody can observe the
                    // node until the bottom-layer splice below.
                    node_ref
                        .next(layer)
                        .store(nexts[layer] as *mut Node, Release);
                }
            }

            // All layers locked and validated. Splice bottom-up; the
            // layer-0 store is the linearization point of the insert.
            for layer in 0..=top {
                (*frame.prevs[layer])
                    .next(layer)
                    .store(node.as_ptr(), Release);
            }
            node_ref.is_fully_linked.store(true, Release);
            self.hot.len.fetch_add(1, Relaxed);

            // Dropping the frame releases every distinct predecessor.
            return;
        }
    }

    /// Looks up the live node comparing equal to `query`.
    ///
    /// `query` is a scratch node; it is only ever passed to the comparator
    /// and is not linked into the list.
    ///
    /// # Safety
    ///
    /// `query` must point to a valid node the comparator can interpret, and
    /// the caller must keep the list's nodes alive for the duration of the
    /// call (and of any use of the returned pointer).
    pub unsafe fn find(&self, query: NonNull<Node>) -> Option<NonNull<Node>> {
        let query = query.as_ref();
        let mut cur: &Node = &self.head;

        let mut layer = self.config.max_layer;
        while layer > 0 {
            layer -= 1;
            loop {
                let next = self.next_live(cur, layer);
                match self.compare(query, next) {
                    Ordering::Greater => cur = next,
                    Ordering::Equal => return Some(NonNull::from(next)),
                    Ordering::Less => break,
                }
            }
        }
        None
    }

    /// Returns the greatest live node that compares strictly below `query`,
    /// or `None` if every live node is at or above it.
    ///
    /// # Safety
    ///
    /// Same contract as [`RawSkipList::find`].
    pub unsafe fn find_smaller(&self, query: NonNull<Node>) -> Option<NonNull<Node>> {
        let query = query.as_ref();
        let mut cur: &Node = &self.head;

        let mut layer = self.config.max_layer;
        while layer > 0 {
            layer -= 1;
            loop {
                let next = self.next_live(cur, layer);
                if self.compare(query, next) == Ordering::Greater {
                    cur = next;
                } else {
                    break;
                }
            }
        }
        self.non_sentinel(cur)
    }

    /// Unlinks the live node comparing equal to `query`, retrying while the
    /// node is busy, and returns the unlinked node so the caller can retire
    /// its storage.
    ///
    /// # Safety
    ///
    /// Same contract as [`RawSkipList::find`].
    pub unsafe fn erase(&self, query: NonNull<Node>) -> Result<NonNull<Node>, EraseError> {
        let found = self.find(query).ok_or(EraseError::NotFound)?;

        let backoff = Backoff::new();
        loop {
            match self.erase_node(found) {
                // Another writer owns the node right now; wait it out.
                Err(EraseError::Busy) => backoff.snooze(),
                Ok(()) => return Ok(found),
                Err(err) => return Err(err),
            }
        }
    }

    /// Unlinks one specific live node.
    ///
    /// On success the node is no longer reachable and its tombstone is set.
    /// `Busy` means another writer holds the node's lock bit and the caller
    /// may retry; the other variants are described on [`EraseError`].
    ///
    /// # Safety
    ///
    /// `node` must point to a node that was inserted into this list and
    /// whose storage is still valid; the caller may reclaim the storage only
    /// after this returns `Ok` and no concurrent reader can still reach the
    /// node.
    pub unsafe fn erase_node(&self, node: NonNull<Node>) -> Result<(), EraseError> {
        let node_ref = node.as_ref();

        if node_ref.removed.load(Acquire) {
            return Err(EraseError::AlreadyRemoved);
        }
        if node_ref
            .being_modified
            .compare_exchange(false, true, AcqRel, Acquire)
            .is_err()
        {
            return Err(EraseError::Busy);
        }

        // From here on traversal skips the node, so the predecessor search
        // below lands on its successors.
        node_ref.removed.store(true, Release);

        // Declared before any `LockFrame` so it runs last: predecessors are
        // released first, then the node's own lock bit.
        let node_lock = scopeguard::guard(node_ref, |n| {
            n.being_modified.store(false, Release);
        });

        let top = node_ref.top_layer();
        let max_layer = self.config.max_layer;
        let backoff = Backoff::new();

        'retry: loop {
            if !node_lock.is_fully_linked.load(Acquire) {
                // Lost the race against a remover that finished before our
                // lock acquisition.
                return Err(EraseError::AlreadyUnlinked);
            }

            let mut frame = LockFrame::new(top);
            let mut nexts: [*const Node; MAX_LAYER] = [ptr::null(); MAX_LAYER];
            let mut cur: &Node = &self.head;

            let mut layer = max_layer;
            while layer > 0 {
                layer -= 1;

                let mut next = self.next_live(cur, layer);
                while self.compare(node_ref, next) == Ordering::Greater {
                    cur = next;
                    next = self.next_live(cur, layer);
                }
                // The tombstone guarantees the search skipped the node
                // itself; `next` is strictly beyond it.
                debug_assert!(!ptr::eq(next, node_ref));

                if layer <= top {
                    frame.prevs[layer] = cur as *const Node;
                    nexts[layer] = next as *const Node;

                    if !frame.try_lock(layer) {
                        backoff.spin();
                        continue 'retry;
                    }
                    if !self.is_live_ptr(frame.prevs[layer])
                        || !self.is_live_ptr(nexts[layer])
                        || !ptr::eq(self.next_live(cur, layer), next)
                    {
                        backoff.spin();
                        continue 'retry;
                    }
                }
            }

            // Unlink bottom-up; the layer-0 store is the linearization
            // point of the removal.
            for layer in 0..=top {
                (*frame.prevs[layer])
                    .next(layer)
                    .store(nexts[layer] as *mut Node, Release);
            }
            node_lock.is_fully_linked.store(false, Release);
            self.hot.len.fetch_sub(1, Relaxed);

            // Frame drop releases the predecessors, then the scope guard
            // clears the node's own lock bit.
            return Ok(());
        }
    }

    /// Returns the live successor of `node` on the bottom layer.
    ///
    /// # Safety
    ///
    /// `node` must point to a node of this list (possibly tombstoned) whose
    /// storage is still valid, and list nodes must stay alive for the call.
    pub unsafe fn next(&self, node: NonNull<Node>) -> Option<NonNull<Node>> {
        let next = self.next_live(node.as_ref(), 0);
        self.non_sentinel(next)
    }

    /// Returns the greatest live node ordered strictly before `node`.
    ///
    /// # Safety
    ///
    /// Same contract as [`RawSkipList::next`].
    pub unsafe fn prev(&self, node: NonNull<Node>) -> Option<NonNull<Node>> {
        self.find_smaller(node)
    }

    /// Returns the first live node, or `None` if the list is empty.
    ///
    /// # Safety
    ///
    /// List nodes must stay alive for the call and for any use of the
    /// returned pointer.
    pub unsafe fn begin(&self) -> Option<NonNull<Node>> {
        let next = self.next_live(&self.head, 0);
        self.non_sentinel(next)
    }

    /// Returns the last live node, or `None` if the list is empty.
    ///
    /// # Safety
    ///
    /// Same contract as [`RawSkipList::begin`].
    pub unsafe fn end(&self) -> Option<NonNull<Node>> {
        self.find_smaller(NonNull::from(&*self.tail))
    }

    /// First node in the physical bottom-layer chain, live or tombstoned.
    /// Used by owning layers to tear the structure down.
    pub(crate) unsafe fn first_physical(&self) -> Option<NonNull<Node>> {
        let next = self.head.next(0).load(Acquire);
        let next = next.as_ref()?;
        self.non_sentinel(next)
    }

    /// Physical bottom-layer successor of `node`, live or tombstoned.
    pub(crate) unsafe fn next_physical(&self, node: NonNull<Node>) -> Option<NonNull<Node>> {
        let next = node.as_ref().next(0).load(Acquire);
        let next = next.as_ref()?;
        self.non_sentinel(next)
    }
}

impl fmt::Debug for RawSkipList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSkipList")
            .field("len", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct TestRecord {
        node: Node,
        key: u64,
    }

    impl TestRecord {
        fn new(key: u64) -> Box<TestRecord> {
            Box::new(TestRecord {
                node: Node::new(),
                key,
            })
        }

        fn node(&self) -> NonNull<Node> {
            NonNull::from(&self.node)
        }
    }

    unsafe fn record(node: &Node) -> &TestRecord {
        &*(node as *const Node as *const TestRecord)
    }

    unsafe fn cmp_records(a: &Node, b: &Node, _aux: *mut ()) -> Ordering {
        record(a).key.cmp(&record(b).key)
    }

    fn key_of(node: NonNull<Node>) -> u64 {
        unsafe { record(node.as_ref()).key }
    }

    /// Keys visible on `layer` after the live filter, in list order.
    fn layer_keys(list: &RawSkipList, layer: usize) -> Vec<u64> {
        let mut out = Vec::new();
        unsafe {
            let mut cur: &Node = &list.head;
            loop {
                let next = list.next_live(cur, layer);
                if ptr::eq(next, &*list.tail) {
                    return out;
                }
                out.push(record(next).key);
                cur = next;
            }
        }
    }

    fn insert_all(list: &RawSkipList, records: &[Box<TestRecord>]) {
        for rec in records {
            unsafe { list.insert(rec.node()) };
        }
    }

    #[test]
    fn empty_list() {
        let list = RawSkipList::new(cmp_records);
        assert!(list.is_empty());
        unsafe {
            assert!(list.begin().is_none());
            assert!(list.end().is_none());
            let probe = TestRecord::new(7);
            assert!(list.find(probe.node()).is_none());
            assert!(list.find_smaller(probe.node()).is_none());
        }
    }

    #[test]
    fn basic_lookup_and_neighbors() {
        let list = RawSkipList::new(cmp_records);
        let records: Vec<_> = [1, 2, 3].iter().map(|&k| TestRecord::new(k)).collect();
        insert_all(&list, &records);

        unsafe {
            let probe = TestRecord::new(2);
            let found = list.find(probe.node()).unwrap();
            assert_eq!(key_of(found), 2);

            let one = list.find(TestRecord::new(1).node()).unwrap();
            assert_eq!(key_of(list.next(one).unwrap()), 2);
            assert_eq!(key_of(list.begin().unwrap()), 1);
            assert_eq!(key_of(list.end().unwrap()), 3);
            assert!(list.prev(one).is_none());
        }
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn find_smaller_brackets() {
        let list = RawSkipList::new(cmp_records);
        let records: Vec<_> = [10, 20, 30].iter().map(|&k| TestRecord::new(k)).collect();
        insert_all(&list, &records);

        unsafe {
            let at = |k: u64| TestRecord::new(k);
            assert_eq!(key_of(list.find_smaller(at(25).node()).unwrap()), 20);
            assert!(list.find_smaller(at(5).node()).is_none());
            assert_eq!(key_of(list.find_smaller(at(35).node()).unwrap()), 30);
            // An exact match returns the strict predecessor.
            assert_eq!(key_of(list.find_smaller(at(20).node()).unwrap()), 10);
        }
    }

    #[test]
    fn erase_keeps_order() {
        let list = RawSkipList::new(cmp_records);
        let records: Vec<_> = (1..=1000).map(TestRecord::new).collect();
        insert_all(&list, &records);

        unsafe {
            let probe = TestRecord::new(500);
            let erased = list.erase(probe.node()).unwrap();
            assert_eq!(key_of(erased), 500);
            assert!(list.find(probe.node()).is_none());
        }

        let expected: Vec<u64> = (1..=1000).filter(|&k| k != 500).collect();
        assert_eq!(layer_keys(&list, 0), expected);
        assert_eq!(list.len(), 999);
    }

    #[test]
    fn erase_status_codes() {
        let list = RawSkipList::new(cmp_records);
        let rec = TestRecord::new(42);
        unsafe {
            list.insert(rec.node());

            // Contended: another writer holds the lock bit.
            rec.node.being_modified.store(true, Relaxed);
            assert_eq!(list.erase_node(rec.node()), Err(EraseError::Busy));
            rec.node.being_modified.store(false, Relaxed);

            assert_eq!(list.erase_node(rec.node()), Ok(()));
            assert_eq!(list.erase_node(rec.node()), Err(EraseError::AlreadyRemoved));
            assert_eq!(
                list.erase(TestRecord::new(42).node()),
                Err(EraseError::NotFound)
            );
        }
    }

    #[test]
    fn erase_already_unlinked() {
        let list = RawSkipList::new(cmp_records);
        let rec = TestRecord::new(9);
        unsafe {
            list.insert(rec.node());
            // Simulate the window where a concurrent remover finished the
            // unlink but this thread won the lock CAS.
            rec.node.is_fully_linked.store(false, Relaxed);
            assert_eq!(
                list.erase_node(rec.node()),
                Err(EraseError::AlreadyUnlinked)
            );
            // The lock bit is released on that path.
            assert!(!rec.node.being_modified.load(Relaxed));
        }
    }

    #[test]
    fn node_reuse_after_erase() {
        let list = RawSkipList::new(cmp_records);
        let mut rec = TestRecord::new(5);
        unsafe {
            list.insert(rec.node());
            list.erase(rec.node()).unwrap();
        }
        assert!(list.is_empty());

        rec.key = 11;
        unsafe {
            list.insert(rec.node());
            assert_eq!(key_of(list.begin().unwrap()), 11);
        }
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn layers_sorted_and_contained() {
        let list = RawSkipList::new(cmp_records);
        // Insertion order shuffled by a multiplicative walk.
        let records: Vec<_> = (0..512u64)
            .map(|i| TestRecord::new((i * 73) % 512))
            .collect();
        insert_all(&list, &records);

        let bottom = layer_keys(&list, 0);
        assert_eq!(bottom, (0..512).collect::<Vec<u64>>());

        for layer in 1..list.config().max_layer {
            let keys = layer_keys(&list, layer);
            for pair in keys.windows(2) {
                assert!(pair[0] < pair[1], "layer {} is not sorted", layer);
            }
            // Every node on layer L also appears on layer L - 1.
            let below = layer_keys(&list, layer - 1);
            for key in &keys {
                assert!(
                    below.contains(key),
                    "key {} on layer {} is missing below",
                    key,
                    layer
                );
            }
        }
    }

    #[test]
    fn sampler_stays_in_range() {
        let list = RawSkipList::new(cmp_records);
        let max_layer = list.config().max_layer;
        let mut counts = vec![0usize; max_layer];
        for _ in 0..10_000 {
            let layer = list.sample_top_layer();
            assert!(layer < max_layer);
            counts[layer] += 1;
        }
        // With fanout 4, roughly 3/4 of the samples stay on layer 0.
        assert!(counts[0] > counts[1]);
    }

    #[test]
    fn config_validation() {
        let bad_fanout = Config {
            fanout: 0,
            ..Config::default()
        };
        assert_eq!(
            RawSkipList::with_config(bad_fanout, cmp_records).err(),
            Some(ConfigError::InvalidFanout)
        );

        let bad_layers = Config {
            max_layer: MAX_LAYER + 1,
            ..Config::default()
        };
        assert_eq!(
            RawSkipList::with_config(bad_layers, cmp_records).err(),
            Some(ConfigError::InvalidMaxLayer)
        );

        let mut list = RawSkipList::new(cmp_records);
        let rec = TestRecord::new(1);
        unsafe { list.insert(rec.node()) };
        assert_eq!(
            list.set_config(Config::default()),
            Err(ConfigError::NotEmpty)
        );

        unsafe { list.erase(rec.node()).unwrap() };
        let narrow = Config {
            max_layer: 4,
            ..Config::default()
        };
        assert_eq!(list.set_config(narrow), Ok(()));
        assert_eq!(list.config().max_layer, 4);
    }

    #[test]
    fn tombstoned_nodes_are_skipped_in_place() {
        let list = RawSkipList::new(cmp_records);
        let records: Vec<_> = [1, 2, 3].iter().map(|&k| TestRecord::new(k)).collect();
        insert_all(&list, &records);

        // Tombstone the middle node without unlinking it: traversal must
        // already treat it as absent (this is the reader-visible state
        // during the remove protocol's re-search).
        records[1].node.removed.store(true, Relaxed);
        assert_eq!(layer_keys(&list, 0), vec![1, 3]);
        unsafe {
            let one = list.find(TestRecord::new(1).node()).unwrap();
            assert_eq!(key_of(list.next(one).unwrap()), 3);
            assert!(list.find(TestRecord::new(2).node()).is_none());
        }
    }
}
