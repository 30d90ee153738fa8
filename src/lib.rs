//! # hamt-rs
//!
//! A persistent (immutable, structurally-shared) hash map implemented as a
//! 32-way hash array mapped trie, plus a memoizing cache built on top of it.
//!
//! `insert` returns a new map and leaves the old one untouched; the two maps
//! share every subtree the insert did not rewrite, so keeping old versions
//! alive is cheap. Keys bring their own hashing and equivalence capability
//! (see [`HashKey`]), which is allowed to be identity-based rather than
//! structural.
//!
//! ## Example
//!
//! ```rust
//! use hamt_rs::HamtMap;
//!
//! let m1: HamtMap<u64, &str> = HamtMap::new();
//! let m2 = m1.insert(1, "one");
//! let m3 = m2.insert(2, "two");
//!
//! assert_eq!(m3.find(&1), Some(&"one"));
//! assert_eq!(m3.find(&2), Some(&"two"));
//! // Older versions are unaffected by later inserts.
//! assert_eq!(m2.find(&2), None);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

// =============================================================================
// Configuration
// =============================================================================

/// Hash bits consumed per trie level.
const BITS_PER_LEVEL: u32 = 5;

/// Fan-out of a branch node (2^BITS_PER_LEVEL).
const BRANCH_WIDTH: usize = 32;

/// Mask selecting the slot index from the remaining hash.
const SLOT_MASK: u64 = (BRANCH_WIDTH - 1) as u64;

/// A collision bucket that reaches this size below `MAX_DEPTH` is spread
/// back over trie structure.
const MAX_COLLISIONS: usize = 4;

/// Depth (1-based) past which buckets are kept flat: 30 hash bits have been
/// consumed and rebuilding is unlikely to separate the remaining members.
const MAX_DEPTH: u32 = 7;

// =============================================================================
// Hashing
// =============================================================================

/// Combines two 64-bit hashes into one.
///
/// Order-sensitive: `mix_hash(a, b)` and `mix_hash(b, a)` differ. This is
/// the mixing primitive used for every composite hash in this crate (the
/// 128-to-64 folding step from CityHash); consumers building their own
/// composite keys should use it too so hash quality stays uniform.
pub fn mix_hash(h1: u64, h2: u64) -> u64 {
    const K_MUL: u64 = 0x9ddf_ea08_eb38_2d69;
    let mut a = (h1 ^ h2).wrapping_mul(K_MUL);
    a ^= a >> 47;
    let mut b = (h2 ^ a).wrapping_mul(K_MUL);
    b ^= b >> 47;
    b.wrapping_mul(K_MUL)
}

/// SplitMix64 step; used to finalize raw integers and addresses whose low
/// bits carry little entropy (the trie consumes hashes low-bits-first).
fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Hashing and equivalence capability of map keys.
///
/// Deliberately separate from [`std::hash::Hash`] + [`Eq`]: the equivalence
/// relation may be identity-based, i.e. two structurally equal values held
/// in different allocations are allowed to compare unequal (see the [`Rc`]
/// impl). Under such a relation a false negative costs a lookup miss, never
/// a wrong answer.
///
/// Contract: `a.equiv(b)` implies `a.hash64() == b.hash64()`, and `hash64`
/// is deterministic for a given value (for identity-based impls, for a
/// given allocation).
pub trait HashKey {
    /// Returns the 64-bit hash of this key.
    fn hash64(&self) -> u64;

    /// Returns true if the two keys are interchangeable as map keys.
    fn equiv(&self, other: &Self) -> bool;
}

impl HashKey for u64 {
    fn hash64(&self) -> u64 {
        splitmix64(*self)
    }

    fn equiv(&self, other: &Self) -> bool {
        self == other
    }
}

/// Identity-based keying: two `Rc`s are equivalent only if they are the
/// same allocation. The hash is derived from the allocation address, which
/// is stable for the lifetime of the allocation. Clones of one `Rc` are
/// equivalent to each other; a structurally equal value built separately is
/// a distinct key.
impl<T> HashKey for Rc<T> {
    fn hash64(&self) -> u64 {
        // Addresses are aligned; finalize so the low 5-bit slices differ.
        splitmix64(Rc::as_ptr(self) as usize as u64)
    }

    fn equiv(&self, other: &Self) -> bool {
        Rc::ptr_eq(self, other)
    }
}

// =============================================================================
// Composite cache keys
// =============================================================================

/// Evaluation mode under which a cached result was produced.
///
/// Results computed under different modes are independent cache entries
/// even for the same subject, so the mode participates in key hashing and
/// equivalence with exact equality.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Full-strength evaluation.
    Full,
    /// Reduced-strength evaluation.
    Reduced,
    /// Minimal evaluation.
    Minimal,
}

impl Mode {
    fn hash64(self) -> u64 {
        // Three distinct constants; mix_hash does the spreading.
        match self {
            Mode::Full => 7,
            Mode::Reduced => 11,
            Mode::Minimal => 13,
        }
    }
}

/// Composite lookup key for memoized computations: an evaluation [`Mode`],
/// a primary subject, and an optional secondary subject.
///
/// Hash: `mix_hash(mode, mix_hash(primary, secondary))`, where an absent
/// secondary hashes as zero. Equivalence requires equal modes, matching
/// secondary presence (`None` matches only `None`), and component-wise
/// [`HashKey::equiv`].
#[derive(Clone, Debug)]
pub struct CacheKey<T> {
    /// Evaluation mode the cached result belongs to.
    pub mode: Mode,
    /// Primary subject of the computation.
    pub primary: T,
    /// Optional secondary subject refining the computation.
    pub secondary: Option<T>,
}

impl<T> CacheKey<T> {
    /// Creates a key with no secondary subject.
    pub fn new(mode: Mode, primary: T) -> Self {
        Self {
            mode,
            primary,
            secondary: None,
        }
    }

    /// Creates a key with a secondary subject.
    pub fn with_secondary(mode: Mode, primary: T, secondary: T) -> Self {
        Self {
            mode,
            primary,
            secondary: Some(secondary),
        }
    }
}

impl<T: HashKey> HashKey for CacheKey<T> {
    fn hash64(&self) -> u64 {
        let secondary = self.secondary.as_ref().map_or(0, HashKey::hash64);
        mix_hash(
            self.mode.hash64(),
            mix_hash(self.primary.hash64(), secondary),
        )
    }

    fn equiv(&self, other: &Self) -> bool {
        if self.mode != other.mode {
            return false;
        }
        let secondary_matches = match (&self.secondary, &other.secondary) {
            (None, None) => true,
            (Some(a), Some(b)) => a.equiv(b),
            _ => false,
        };
        secondary_matches && self.primary.equiv(&other.primary)
    }
}

// =============================================================================
// Trie nodes
// =============================================================================

/// Short inline storage for collision buckets; buckets below `MAX_DEPTH`
/// are capped at `MAX_COLLISIONS` members by the rebuild heuristic.
type Bucket<T> = SmallVec<[T; MAX_COLLISIONS]>;

/// One of the 32 slots of a branch node.
#[derive(Clone)]
enum Slot<K, V> {
    Empty,
    Pair(K, V),
    Child(Rc<Node<K, V>>),
}

#[derive(Clone)]
enum Node<K, V> {
    /// 32-way branch indexed by the low 5 bits of the remaining hash.
    Branch(Box<[Slot<K, V>; BRANCH_WIDTH]>),
    /// Flat bucket of pairs whose hashes agree on every level above it.
    /// Parallel arrays of equal length; insertion order is preserved.
    Collision { keys: Bucket<K>, values: Bucket<V> },
}

impl<K, V> Node<K, V> {
    /// Number of pairs held in a collision bucket (0 for a branch); the
    /// quantity the `MAX_COLLISIONS` rebuild predicate reads.
    fn bucket_size(&self) -> usize {
        match self {
            Node::Branch(_) => 0,
            Node::Collision { keys, .. } => keys.len(),
        }
    }
}

fn empty_slots<K, V>() -> Box<[Slot<K, V>; BRANCH_WIDTH]> {
    Box::new(std::array::from_fn(|_| Slot::Empty))
}

/// Fresh two-member bucket from a slot split; the resident pair stays
/// first.
fn two_member_bucket<K, V>(k0: K, v0: V, k1: K, v1: V) -> Node<K, V> {
    let mut keys = Bucket::new();
    let mut values = Bucket::new();
    keys.push(k0);
    values.push(v0);
    keys.push(k1);
    values.push(v1);
    Node::Collision { keys, values }
}

/// Adds a pair to a bucket: an equivalent resident is overwritten in place
/// (key and value both), otherwise the pair is appended.
fn bucket_insert<K: HashKey, V>(
    mut keys: Bucket<K>,
    mut values: Bucket<V>,
    key: K,
    value: V,
) -> Node<K, V> {
    match keys.iter().position(|k| key.equiv(k)) {
        Some(i) => {
            keys[i] = key;
            values[i] = value;
        }
        None => {
            keys.push(key);
            values.push(value);
        }
    }
    Node::Collision { keys, values }
}

/// Spreads a bucket's members back over trie structure, re-inserting each
/// with the part of its full hash that this depth has not yet consumed.
fn spread_bucket<K: HashKey + Clone, V: Clone>(node: Node<K, V>, depth: u32) -> Node<K, V> {
    match node {
        Node::Collision { keys, values } => {
            let consumed = BITS_PER_LEVEL * (depth - 1);
            let mut out = Node::Branch(empty_slots());
            for (k, v) in keys.into_iter().zip(values) {
                let hash = k.hash64() >> consumed;
                out = insert_at(&out, hash, depth, k, v);
            }
            out
        }
        branch => branch,
    }
}

/// Functional insert: returns a fresh node for the touched path and shares
/// every sibling subtree of the input by reference.
fn insert_at<K: HashKey + Clone, V: Clone>(
    node: &Node<K, V>,
    hash: u64,
    depth: u32,
    key: K,
    value: V,
) -> Node<K, V> {
    match node {
        Node::Branch(slots) => {
            let idx = (hash & SLOT_MASK) as usize;
            let mut slots = slots.clone();
            slots[idx] = match &slots[idx] {
                Slot::Empty => Slot::Pair(key, value),
                Slot::Pair(k, v) => {
                    if key.equiv(k) {
                        Slot::Pair(key, value)
                    } else {
                        Slot::Child(Rc::new(two_member_bucket(k.clone(), v.clone(), key, value)))
                    }
                }
                Slot::Child(child) => Slot::Child(Rc::new(insert_at(
                    child,
                    hash >> BITS_PER_LEVEL,
                    depth + 1,
                    key,
                    value,
                ))),
            };
            Node::Branch(slots)
        }
        Node::Collision { keys, values } => {
            let bucket = bucket_insert(keys.clone(), values.clone(), key, value);
            if depth >= MAX_DEPTH || bucket.bucket_size() < MAX_COLLISIONS {
                bucket
            } else {
                // A shallow bucket grew to the cap: the collision is likely
                // incidental to the first few levels rather than a full-hash
                // collision, so trade one rebuild for cheaper lookups.
                spread_bucket(bucket, depth)
            }
        }
    }
}

// =============================================================================
// Persistent map
// =============================================================================

/// Persistent 32-way hash array mapped trie.
///
/// `insert` produces a new map; the input map is never modified and both
/// share all untouched subtrees. Cloning a map is O(1). There is no
/// removal.
pub struct HamtMap<K, V> {
    root: Rc<Node<K, V>>,
    size: usize,
}

impl<K, V> HamtMap<K, V> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            root: Rc::new(Node::Branch(empty_slots())),
            size: 0,
        }
    }

    /// Number of inserts this map has absorbed.
    ///
    /// Inserting over an existing key still increments this counter, so the
    /// value is an upper bound on the number of distinct keys, not an exact
    /// count. Callers that need an exact count can take `iter().count()`.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Iterates over all entries in deterministic trie order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            stack: vec![(self.root.as_ref(), 0)],
        }
    }
}

impl<K: HashKey, V> HamtMap<K, V> {
    /// Looks up a key, descending by successive 5-bit slices of its hash.
    ///
    /// A branch slot holding a non-equivalent pair is a definitive miss;
    /// there is no probing to other slots.
    pub fn find(&self, key: &K) -> Option<&V> {
        let mut hash = key.hash64();
        let mut node: &Node<K, V> = &self.root;
        loop {
            match node {
                Node::Branch(slots) => match &slots[(hash & SLOT_MASK) as usize] {
                    Slot::Empty => return None,
                    Slot::Pair(k, v) => return if key.equiv(k) { Some(v) } else { None },
                    Slot::Child(child) => {
                        node = child.as_ref();
                        hash >>= BITS_PER_LEVEL;
                    }
                },
                Node::Collision { keys, values } => {
                    return keys.iter().position(|k| key.equiv(k)).map(|i| &values[i]);
                }
            }
        }
    }

    /// Returns true if an equivalent key is present.
    pub fn contains(&self, key: &K) -> bool {
        self.find(key).is_some()
    }
}

impl<K: HashKey + Clone, V: Clone> HamtMap<K, V> {
    /// Returns a new map with `(key, value)` added, sharing all untouched
    /// subtrees with `self`. An equivalent existing key is overwritten in
    /// the new map (the old map keeps its entry).
    pub fn insert(&self, key: K, value: V) -> Self {
        let hash = key.hash64();
        Self {
            root: Rc::new(insert_at(&self.root, hash, 1, key, value)),
            size: self.size + 1,
        }
    }
}

impl<K, V> Clone for HamtMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: Rc::clone(&self.root),
            size: self.size,
        }
    }
}

impl<K, V> Default for HamtMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for HamtMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Borrowing iterator over a [`HamtMap`], yielding `(&K, &V)`.
pub struct Iter<'a, K, V> {
    /// Pending (node, next position) frames; the position is a slot index
    /// for branches and a member index for buckets.
    stack: Vec<(&'a Node<K, V>, usize)>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((node, start)) = self.stack.pop() {
            match node {
                Node::Branch(slots) => {
                    for (i, slot) in slots.iter().enumerate().skip(start) {
                        match slot {
                            Slot::Empty => {}
                            Slot::Pair(k, v) => {
                                self.stack.push((node, i + 1));
                                return Some((k, v));
                            }
                            Slot::Child(child) => {
                                self.stack.push((node, i + 1));
                                self.stack.push((child.as_ref(), 0));
                                break;
                            }
                        }
                    }
                }
                Node::Collision { keys, values } => {
                    if start < keys.len() {
                        self.stack.push((node, start + 1));
                        return Some((&keys[start], &values[start]));
                    }
                }
            }
        }
        None
    }
}

// =============================================================================
// Memoizing cache
// =============================================================================

/// Memoizing cache over a [`HamtMap`] table.
///
/// All mutation goes through `&mut self`; the cache is an explicitly
/// passed, exclusively owned cell, not ambient state. The table itself is
/// persistent, so handing out snapshots of it is free and safe.
pub struct MemoCache<K, V> {
    table: HamtMap<K, V>,
}

impl<K, V> MemoCache<K, V> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            table: HamtMap::new(),
        }
    }

    /// The current table. Cloning the returned map is O(1), so
    /// collaborators can snapshot it cheaply.
    pub fn table(&self) -> &HamtMap<K, V> {
        &self.table
    }

    /// Installs `table` and returns the previous one. Together with
    /// [`table`](Self::table) this lets a caller save the table, run nested
    /// work against a fresh one, and restore the saved table afterwards;
    /// the scoping policy is the caller's.
    pub fn replace_table(&mut self, table: HamtMap<K, V>) -> HamtMap<K, V> {
        std::mem::replace(&mut self.table, table)
    }

    /// Insert count of the underlying table (see [`HamtMap::size`]).
    pub fn len(&self) -> usize {
        self.table.size()
    }

    /// Returns true if nothing has been cached.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl<K: HashKey + Clone, V: Clone> MemoCache<K, V> {
    /// Returns the cached value for `key`, or runs `compute` and caches its
    /// result.
    ///
    /// On a hit, `compute` is not invoked. On a miss, `compute` receives
    /// the cache itself and may re-enter `get_or_compute` recursively;
    /// nested write-backs are preserved because the insert reads the table
    /// as it stands after the callback returns, not a snapshot from before
    /// it ran. A re-entrant call for the *same* key is tolerated and
    /// recomputes redundantly; the last write wins.
    ///
    /// If `compute` fails, the error is returned unmodified and the cache
    /// is left untouched, so a later call may retry the key.
    pub fn get_or_compute<E, F>(&mut self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce(&mut Self) -> Result<V, E>,
    {
        if let Some(value) = self.table.find(&key) {
            return Ok(value.clone());
        }
        let value = compute(self)?;
        self.table = self.table.insert(key, value.clone());
        Ok(value)
    }
}

impl<K, V> Default for MemoCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for MemoCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoCache")
            .field("table", &self.table)
            .finish()
    }
}


#[cfg(test)]
mod proptests;
