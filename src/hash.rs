use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Hash function used for ring positions and Maglev permutations. The
/// default reduces an md5 digest to a 128-bit integer, any replacement must
/// be stable across processes for placements to agree.
pub type HashFn = fn(&str) -> u128;

pub fn md5_hash(key: &str) -> u128 {
    let digest = Md5::digest(key.as_bytes());
    u128::from_be_bytes(digest.into())
}

pub const DEFAULT_WEIGHT: u32 = 16;
pub const DEFAULT_VIRTUAL_ENTRY_COUNT: usize = 16;

// Maglev table sizes are drawn from this fixed table, requests beyond its
// last entry saturate at 997.
const PRIMES: [u32; 168] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
    97, 101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167, 173, 179, 181, 191,
    193, 197, 199, 211, 223, 227, 229, 233, 239, 241, 251, 257, 263, 269, 271, 277, 281, 283, 293,
    307, 311, 313, 317, 331, 337, 347, 349, 353, 359, 367, 373, 379, 383, 389, 397, 401, 409, 419,
    421, 431, 433, 439, 443, 449, 457, 461, 463, 467, 479, 487, 491, 499, 503, 509, 521, 523, 541,
    547, 557, 563, 569, 571, 577, 587, 593, 599, 601, 607, 613, 617, 619, 631, 641, 643, 647, 653,
    659, 661, 673, 677, 683, 691, 701, 709, 719, 727, 733, 739, 743, 751, 757, 761, 769, 773, 787,
    797, 809, 811, 821, 823, 827, 829, 839, 853, 857, 859, 863, 877, 881, 883, 887, 907, 911, 919,
    929, 937, 941, 947, 953, 967, 971, 977, 983, 991, 997,
];

fn prime_at_least(target: usize) -> usize {
    let pos = PRIMES.partition_point(|&prime| (prime as usize) < target);
    PRIMES[pos.min(PRIMES.len() - 1)] as usize
}

/// One placement target. Two nodes with the same key can't coexist in the
/// same manager.
#[derive(Debug, Clone)]
pub struct HashNode {
    pub key: String,
    pub weight: u32,
    pub enabled: bool,
    pub hashed_key: u128,
}

impl HashNode {
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_weight(key, DEFAULT_WEIGHT)
    }

    pub fn with_weight(key: impl Into<String>, weight: u32) -> Self {
        let key = key.into();
        HashNode {
            hashed_key: md5_hash(&key),
            key,
            weight,
            enabled: true,
        }
    }
}

// The node bookkeeping both managers share: the key to node mapping plus the
// enabled keys in insertion order. Insertion order is part of the contract,
// Maglev indexes its lookup table by position in this list.
#[derive(Clone)]
struct NodeSet {
    name: String,
    hash_fn: HashFn,
    objects: HashMap<String, HashNode>,
    order: Vec<String>,
}

impl NodeSet {
    fn new(name: String, hash_fn: HashFn) -> Self {
        NodeSet {
            name,
            hash_fn,
            objects: HashMap::new(),
            order: Vec::new(),
        }
    }

    // Returns whether the enabled set changed.
    fn insert(&mut self, node: HashNode) -> bool {
        if self.objects.contains_key(&node.key) {
            return false;
        }
        let enabled = node.enabled;
        let key = node.key.clone();
        self.objects.insert(key.clone(), node);
        if enabled {
            self.order.push(key);
        }
        enabled
    }

    fn remove(&mut self, key: &str) -> bool {
        if self.objects.remove(key).is_none() {
            return false;
        }
        self.order.retain(|existing| existing != key);
        true
    }

    fn enable(&mut self, key: &str) -> bool {
        match self.objects.get_mut(key) {
            Some(node) if !node.enabled => {
                node.enabled = true;
                self.order.push(key.to_string());
                true
            }
            _ => false,
        }
    }

    fn disable(&mut self, key: &str) -> bool {
        match self.objects.get_mut(key) {
            Some(node) if node.enabled => {
                node.enabled = false;
                self.order.retain(|existing| existing != key);
                true
            }
            _ => false,
        }
    }

    fn reset(&mut self) {
        self.objects.clear();
        self.order.clear();
    }

    fn filter(&self, keys: &HashSet<&str>) -> Self {
        NodeSet {
            name: self.name.clone(),
            hash_fn: self.hash_fn,
            objects: self
                .objects
                .iter()
                .filter(|(key, _)| keys.contains(key.as_str()))
                .map(|(key, node)| (key.clone(), node.clone()))
                .collect(),
            order: self
                .order
                .iter()
                .filter(|key| keys.contains(key.as_str()))
                .cloned()
                .collect(),
        }
    }
}

/// Classic consistent-hash ring. Every enabled node contributes `weight`
/// virtual keys, lookups walk to the smallest virtual key at or past the
/// hashed input, wrapping around to the first one.
#[derive(Clone)]
pub struct HashRing {
    nodes: NodeSet,
    // Derived purely from the enabled set, swapped wholesale on rehash so
    // clones stay cheap.
    ring: Arc<BTreeMap<u128, String>>,
}

impl HashRing {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_hash_fn(name, md5_hash)
    }

    pub fn with_hash_fn(name: impl Into<String>, hash_fn: HashFn) -> Self {
        HashRing {
            nodes: NodeSet::new(name.into(), hash_fn),
            ring: Arc::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.nodes.name
    }

    pub fn node_count(&self) -> usize {
        self.nodes.order.len()
    }

    pub fn add_node(&mut self, node: HashNode) {
        if self.nodes.insert(node) {
            self.rehash();
        }
    }

    pub fn add_nodes(&mut self, nodes: Vec<HashNode>) {
        let mut changed = false;
        for node in nodes {
            changed |= self.nodes.insert(node);
        }
        if changed {
            self.rehash();
        }
    }

    pub fn remove_node(&mut self, key: &str) {
        if self.nodes.remove(key) {
            self.rehash();
        }
    }

    pub fn enable_node(&mut self, key: &str) {
        if self.nodes.enable(key) {
            self.rehash();
        }
    }

    pub fn disable_node(&mut self, key: &str) {
        if self.nodes.disable(key) {
            self.rehash();
        }
    }

    pub fn reset(&mut self) {
        self.nodes.reset();
        self.ring = Arc::new(BTreeMap::new());
    }

    /// A copy of this manager restricted to the given node keys.
    pub fn filter(&self, keys: &[&str]) -> Self {
        let keys: HashSet<&str> = keys.iter().copied().collect();
        let mut filtered = HashRing {
            nodes: self.nodes.filter(&keys),
            ring: Arc::new(BTreeMap::new()),
        };
        filtered.rehash();
        filtered
    }

    pub fn rehash(&mut self) {
        let mut ring = BTreeMap::new();
        for key in &self.nodes.order {
            let node = &self.nodes.objects[key];
            for idx in 0..node.weight {
                let virtual_key = (self.nodes.hash_fn)(&format!("{}-{}", node.key, idx));
                // First writer wins on colliding positions.
                ring.entry(virtual_key).or_insert_with(|| node.key.clone());
            }
        }
        self.ring = Arc::new(ring);
    }

    pub fn get_node(&self, key: &str) -> Option<&HashNode> {
        if self.ring.is_empty() {
            return None;
        }
        let virtual_key = (self.nodes.hash_fn)(key);
        let owner = self
            .ring
            .range(virtual_key..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, owner)| owner)?;
        self.nodes.objects.get(owner)
    }
}

/// Maglev-style consistent hash: a prime-sized lookup table filled by
/// round-robin over per-node permutations, balanced to within one slot
/// across nodes.
#[derive(Clone)]
pub struct MaglevHash {
    nodes: NodeSet,
    virtual_entry_count: usize,
    // Slot to index into the enabled order, swapped wholesale on rehash.
    table: Arc<Vec<usize>>,
}

impl MaglevHash {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_hash_fn(name, md5_hash, DEFAULT_VIRTUAL_ENTRY_COUNT)
    }

    pub fn with_hash_fn(
        name: impl Into<String>,
        hash_fn: HashFn,
        virtual_entry_count: usize,
    ) -> Self {
        MaglevHash {
            nodes: NodeSet::new(name.into(), hash_fn),
            virtual_entry_count,
            table: Arc::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.nodes.name
    }

    pub fn node_count(&self) -> usize {
        self.nodes.order.len()
    }

    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    pub fn add_node(&mut self, node: HashNode) {
        if self.nodes.insert(node) {
            self.rehash();
        }
    }

    pub fn add_nodes(&mut self, nodes: Vec<HashNode>) {
        let mut changed = false;
        for node in nodes {
            changed |= self.nodes.insert(node);
        }
        if changed {
            self.rehash();
        }
    }

    pub fn remove_node(&mut self, key: &str) {
        if self.nodes.remove(key) {
            self.rehash();
        }
    }

    pub fn enable_node(&mut self, key: &str) {
        if self.nodes.enable(key) {
            self.rehash();
        }
    }

    pub fn disable_node(&mut self, key: &str) {
        if self.nodes.disable(key) {
            self.rehash();
        }
    }

    pub fn reset(&mut self) {
        self.nodes.reset();
        self.table = Arc::new(Vec::new());
    }

    pub fn filter(&self, keys: &[&str]) -> Self {
        let keys: HashSet<&str> = keys.iter().copied().collect();
        let mut filtered = MaglevHash {
            nodes: self.nodes.filter(&keys),
            virtual_entry_count: self.virtual_entry_count,
            table: Arc::new(Vec::new()),
        };
        filtered.rehash();
        filtered
    }

    pub fn rehash(&mut self) {
        let enabled = self.nodes.order.len();
        if enabled == 0 {
            self.table = Arc::new(Vec::new());
            return;
        }

        let entry_count = prime_at_least(enabled * self.virtual_entry_count);
        let hash_fn = self.nodes.hash_fn;

        // offset and skip fully determine each node's visiting order over
        // the table, no need to materialize the whole permutation.
        let mut offsets = Vec::with_capacity(enabled);
        let mut skips = Vec::with_capacity(enabled);
        for key in &self.nodes.order {
            offsets.push((hash_fn(&format!("cat{}", key)) % entry_count as u128) as u64);
            skips.push((hash_fn(&format!("lee{}", key)) % (entry_count as u128 - 1)) as u64 + 1);
        }

        let mut nexts = vec![0u64; enabled];
        let mut entries = vec![usize::MAX; entry_count];
        let mut filled = 0;

        // Round-robin fill: each node claims the next unclaimed slot along
        // its permutation until the table is complete.
        'fill: loop {
            for idx in 0..enabled {
                let mut slot =
                    ((offsets[idx] + nexts[idx] * skips[idx]) % entry_count as u64) as usize;
                while entries[slot] != usize::MAX {
                    nexts[idx] += 1;
                    slot = ((offsets[idx] + nexts[idx] * skips[idx]) % entry_count as u64) as usize;
                }
                entries[slot] = idx;
                nexts[idx] += 1;
                filled += 1;
                if filled == entry_count {
                    break 'fill;
                }
            }
        }

        self.table = Arc::new(entries);
    }

    pub fn get_node(&self, key: &str) -> Option<&HashNode> {
        if self.table.is_empty() {
            return None;
        }
        let hashed = (self.nodes.hash_fn)(&format!("cat{}", key));
        let idx = self.table[(hashed % self.table.len() as u128) as usize];
        let owner = self.nodes.order.get(idx)?;
        self.nodes.objects.get(owner)
    }
}
