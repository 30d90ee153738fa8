use super::*;

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::HashMap;

fn low_bits(n: u32) -> u64 {
    if n >= 64 {
        u64::MAX
    } else {
        (1u64 << n) - 1
    }
}

/// Walks the node graph and checks the structural invariants: every entry
/// sits on its hash path, collision buckets are well-formed and capped below
/// the rebuild depth, and the size counter dominates the reachable entry
/// count.
pub(crate) fn validate_map<K: HashKey, V>(map: &HamtMap<K, V>) {
    let mut pairs = 0usize;
    validate_node(&map.root, 0, 0, 1, &mut pairs);
    assert!(
        pairs <= map.size(),
        "size counter must dominate reachable entry count"
    );
}

fn validate_node<K: HashKey, V>(
    node: &Node<K, V>,
    prefix: u64,
    prefix_bits: u32,
    depth: u32,
    pairs: &mut usize,
) {
    match node {
        Node::Branch(slots) => {
            for (i, slot) in slots.iter().enumerate() {
                let child_prefix = prefix | ((i as u64) << prefix_bits);
                match slot {
                    Slot::Empty => {}
                    Slot::Pair(k, _) => {
                        *pairs += 1;
                        assert_eq!(
                            k.hash64() & low_bits(prefix_bits + BITS_PER_LEVEL),
                            child_prefix,
                            "entry stored off its hash path"
                        );
                    }
                    Slot::Child(child) => validate_node(
                        child,
                        child_prefix,
                        prefix_bits + BITS_PER_LEVEL,
                        depth + 1,
                        pairs,
                    ),
                }
            }
        }
        Node::Collision { keys, values } => {
            assert_eq!(keys.len(), values.len(), "bucket arrays out of step");
            assert!(keys.len() >= 2, "bucket smaller than a split");
            if depth < MAX_DEPTH {
                assert!(
                    keys.len() < MAX_COLLISIONS,
                    "shallow bucket exceeded the rebuild cap"
                );
            }
            for k in keys {
                assert_eq!(
                    k.hash64() & low_bits(prefix_bits),
                    prefix,
                    "bucket member off its hash path"
                );
            }
            for (i, a) in keys.iter().enumerate() {
                for b in &keys[i + 1..] {
                    assert!(!a.equiv(b), "bucket holds duplicate keys");
                }
            }
            *pairs += keys.len();
        }
    }
}

/// Key with a deliberately low-entropy hash so op sequences exercise slot
/// splits, collision buckets, rebuilds, and full-hash collisions.
#[derive(Clone, Debug)]
struct SparseKey {
    id: u64,
}

impl SparseKey {
    fn new(raw: u16) -> Self {
        Self {
            id: u64::from(raw) % 300,
        }
    }
}

impl HashKey for SparseKey {
    fn hash64(&self) -> u64 {
        // 100 distinct hashes over up to 300 ids.
        self.id % 100
    }

    fn equiv(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

#[derive(Clone, Debug, Arbitrary)]
enum Op {
    Insert(u16, u64),
    Get(u16),
    Snapshot,
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(any::<Op>(), 0..=600)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_model_equivalence(ops in ops_strategy()) {
        let mut m: HamtMap<SparseKey, u64> = HamtMap::new();
        let mut model: HashMap<u64, u64> = HashMap::new();
        let mut inserts = 0usize;
        let mut snapshots: Vec<(HamtMap<SparseKey, u64>, HashMap<u64, u64>)> = Vec::new();

        for op in ops {
            match op {
                Op::Insert(raw, v) => {
                    let k = SparseKey::new(raw);
                    m = m.insert(k.clone(), v);
                    model.insert(k.id, v);
                    inserts += 1;
                }
                Op::Get(raw) => {
                    let k = SparseKey::new(raw);
                    prop_assert_eq!(m.find(&k), model.get(&k.id));
                }
                Op::Snapshot => snapshots.push((m.clone(), model.clone())),
            }
            prop_assert_eq!(m.size(), inserts);
        }

        validate_map(&m);
        for id in 0..300u64 {
            prop_assert_eq!(m.find(&SparseKey { id }), model.get(&id));
        }

        let mut entries: Vec<(u64, u64)> = m.iter().map(|(k, v)| (k.id, *v)).collect();
        entries.sort_unstable();
        let mut expected: Vec<(u64, u64)> = model.iter().map(|(&k, &v)| (k, v)).collect();
        expected.sort_unstable();
        prop_assert_eq!(entries, expected);

        // Snapshots taken along the way must be unaffected by later
        // inserts.
        for (old, old_model) in snapshots {
            validate_map(&old);
            for id in 0..300u64 {
                prop_assert_eq!(old.find(&SparseKey { id }), old_model.get(&id));
            }
        }
    }

    #[test]
    fn prop_memo_computes_each_key_once(raws in prop::collection::vec(any::<u16>(), 0..=200)) {
        let mut cache: MemoCache<SparseKey, u64> = MemoCache::new();
        let mut computed: HashMap<u64, u32> = HashMap::new();

        for raw in &raws {
            let k = SparseKey::new(*raw);
            let id = k.id;
            let v: Result<u64, ()> = cache.get_or_compute(k, |_| {
                *computed.entry(id).or_insert(0) += 1;
                Ok(id * 2)
            });
            prop_assert_eq!(v, Ok(id * 2));
        }

        for raw in raws {
            let k = SparseKey::new(raw);
            prop_assert_eq!(computed.get(&k.id).copied(), Some(1));
            prop_assert_eq!(cache.table().find(&k), Some(&(k.id * 2)));
        }
    }
}
