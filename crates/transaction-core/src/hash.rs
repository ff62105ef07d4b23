//! Open hash table keyed by a precomputed 32-bit hash
//!
//! Transactions and legs are stored in arenas; the tables only map a hash
//! to the arena keys that carry it. Several keys may share a hash (a
//! request and its tagged forks, different legs of one Call-ID), so lookups
//! return every candidate and the caller does the exact comparison.
//!
//! Collisions are resolved by linear probing. Removal uses backward-shift
//! deletion, so probe runs never contain tombstones.

/// FNV-1a over the ASCII-lowercased bytes
pub fn hash_istring(s: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in s.bytes() {
        hash ^= u32::from(b.to_ascii_lowercase());
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Transaction hash of Call-ID and CSeq number
pub fn transaction_hash(call_id: &str, cseq: u32) -> u32 {
    hash_istring(call_id).wrapping_add(cseq.wrapping_mul(26839))
}

const MIN_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct HashTable<K> {
    slots: Vec<Option<(u32, K)>>,
    len: usize,
}

impl<K: Copy + Eq> Default for HashTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq> HashTable<K> {
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        HashTable {
            slots: vec![None; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Add `key` under `hash`. The same pair may not be inserted twice.
    pub fn insert(&mut self, hash: u32, key: K) {
        if (self.len + 1) * 2 > self.slots.len() {
            self.grow();
        }
        let mask = self.mask();
        let mut i = hash as usize & mask;
        while self.slots[i].is_some() {
            i = (i + 1) & mask;
        }
        self.slots[i] = Some((hash, key));
        self.len += 1;
    }

    /// Remove the pair; returns false if it was not present
    pub fn remove(&mut self, hash: u32, key: K) -> bool {
        let mask = self.mask();
        let mut i = hash as usize & mask;
        loop {
            match self.slots[i] {
                None => return false,
                Some((h, k)) if h == hash && k == key => break,
                Some(_) => i = (i + 1) & mask,
            }
        }
        self.slots[i] = None;
        self.len -= 1;

        let mut hole = i;
        let mut j = (i + 1) & mask;
        while let Some((h, k)) = self.slots[j] {
            let home = h as usize & mask;
            // The entry may fill the hole if the hole lies on its probe path
            if (j.wrapping_sub(home) & mask) >= (j.wrapping_sub(hole) & mask) {
                self.slots[hole] = Some((h, k));
                self.slots[j] = None;
                hole = j;
            }
            j = (j + 1) & mask;
        }
        true
    }

    /// All keys stored under `hash`, in probe order
    pub fn candidates(&self, hash: u32) -> impl Iterator<Item = K> + '_ {
        let mask = self.mask();
        let mut i = hash as usize & mask;
        let mut done = false;
        std::iter::from_fn(move || {
            while !done {
                match self.slots[i] {
                    None => done = true,
                    Some((h, k)) => {
                        i = (i + 1) & mask;
                        if h == hash {
                            return Some(k);
                        }
                    }
                }
            }
            None
        })
    }

    /// First candidate under `hash` accepted by `pred`
    pub fn find(&self, hash: u32, mut pred: impl FnMut(K) -> bool) -> Option<K> {
        self.candidates(hash).find(|k| pred(*k))
    }

    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        self.slots.iter().filter_map(|s| s.map(|(_, k)| k))
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.len = 0;
    }

    fn grow(&mut self) {
        let len = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![None; len]);
        self.len = 0;
        for (hash, key) in old.into_iter().flatten() {
            self.insert(hash, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hash_ignores_case() {
        assert_eq!(hash_istring("Call-ID@Host"), hash_istring("call-id@host"));
        assert_ne!(hash_istring("a"), hash_istring("b"));
        assert_ne!(transaction_hash("x", 1), transaction_hash("x", 2));
    }

    #[test]
    fn test_collisions_and_removal() {
        let mut table = HashTable::new();
        // Same home slot for all of these
        table.insert(1, 10u32);
        table.insert(17, 20);
        table.insert(1, 30);
        table.insert(2, 40);
        assert_eq!(table.candidates(1).collect::<Vec<_>>(), vec![10, 30]);

        assert!(table.remove(1, 10));
        assert!(!table.remove(1, 10));
        assert_eq!(table.candidates(1).collect::<Vec<_>>(), vec![30]);
        assert_eq!(table.candidates(17).collect::<Vec<_>>(), vec![20]);
        assert_eq!(table.candidates(2).collect::<Vec<_>>(), vec![40]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_wraps_around_the_end() {
        let mut table = HashTable::with_capacity(16);
        table.insert(15, 1u32);
        table.insert(15, 2);
        table.insert(31, 3);
        assert_eq!(table.candidates(15).collect::<Vec<_>>(), vec![1, 2]);
        assert!(table.remove(15, 1));
        assert_eq!(table.candidates(31).collect::<Vec<_>>(), vec![3]);
        assert_eq!(table.find(15, |k| k == 2), Some(2));
    }

    #[test]
    fn test_grows_and_keeps_entries() {
        let mut table = HashTable::new();
        for key in 0..100u32 {
            table.insert(key % 7, key);
        }
        assert_eq!(table.len(), 100);
        assert!(table.capacity() >= 200);
        assert_eq!(table.candidates(3).count(), 14);
        assert!(table.candidates(3).all(|k| k % 7 == 3));
    }

    proptest! {
        #[test]
        fn prop_matches_a_plain_list(ops in proptest::collection::vec((any::<bool>(), 0u32..64, 0u32..8), 1..400)) {
            let mut table = HashTable::new();
            let mut model: Vec<(u32, u32)> = Vec::new();
            for (insert, hash, key) in ops {
                if insert {
                    if !model.contains(&(hash, key)) {
                        table.insert(hash, key);
                        model.push((hash, key));
                    }
                } else {
                    let present = model.iter().position(|e| *e == (hash, key));
                    prop_assert_eq!(table.remove(hash, key), present.is_some());
                    if let Some(pos) = present {
                        model.remove(pos);
                    }
                }
                prop_assert_eq!(table.len(), model.len());
            }
            for hash in 0..64 {
                let mut got: Vec<u32> = table.candidates(hash).collect();
                let mut want: Vec<u32> = model.iter().filter(|(h, _)| *h == hash).map(|(_, k)| *k).collect();
                got.sort_unstable();
                want.sort_unstable();
                prop_assert_eq!(got, want);
            }
        }
    }
}
