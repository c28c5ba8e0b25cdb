//! Keyed registry with hash lookup and stable insertion-order iteration.
//!
//! Every entry lives in an arena slot and is linked into two chains by slot
//! index: its hash bucket (for lookup) and the global insertion order (for
//! iteration). A single cursor walks the insertion order and can remove the
//! element it points at, moving on to the following element in the same
//! step. That is what lets the engine drop a failed connection in the middle
//! of a polling pass or a fan-out send.
//!
//! The bucket for a key comes from an external [`BucketIndex`]
//! implementation, which must be deterministic and return values below the
//! table size.

use std::marker::PhantomData;

use crate::error::RegistryError;

/// Maps a key to its hash bucket.
pub trait BucketIndex<K> {
    fn bucket_index(key: &K) -> usize;
}

struct Slot<K, V> {
    key: K,
    value: V,
    bucket: usize,
    hash_prev: Option<usize>,
    hash_next: Option<usize>,
    list_prev: Option<usize>,
    list_next: Option<usize>,
}

/// Registry of `BUCKETS` hash chains over an arena of entries.
pub struct KeyedRegistry<K, V, H, const BUCKETS: usize> {
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    buckets: Box<[Option<usize>]>,
    first: Option<usize>,
    last: Option<usize>,
    cursor: Option<usize>,
    len: usize,
    _index: PhantomData<fn() -> H>,
}

impl<K, V, H, const BUCKETS: usize> KeyedRegistry<K, V, H, BUCKETS>
where
    K: Eq,
    H: BucketIndex<K>,
{
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: vec![None; BUCKETS].into_boxed_slice(),
            first: None,
            last: None,
            cursor: None,
            len: 0,
            _index: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a new entry at the end of the iteration order.
    pub fn add(&mut self, key: K, value: V) -> Result<(), RegistryError> {
        let bucket = Self::bucket_of(&key)?;
        if self.find_in_bucket(bucket, &key).is_some() {
            return Err(RegistryError::DuplicateKey);
        }

        let head = self.buckets[bucket];
        let index = self.alloc(Slot {
            key,
            value,
            bucket,
            hash_prev: None,
            hash_next: head,
            list_prev: self.last,
            list_next: None,
        });

        if let Some(head) = head {
            self.slot_mut(head).hash_prev = Some(index);
        }
        self.buckets[bucket] = Some(index);

        match self.last {
            Some(last) => self.slot_mut(last).list_next = Some(index),
            None => self.first = Some(index),
        }
        self.last = Some(index);
        self.len += 1;
        Ok(())
    }

    /// Remove an entry by key and return its value.
    ///
    /// If the cursor points at the removed entry it moves on to the next one.
    pub fn remove(&mut self, key: &K) -> Result<V, RegistryError> {
        let index = self.find(key)?.ok_or(RegistryError::KeyNotFound)?;
        Ok(self.unlink(index).value)
    }

    pub fn contains(&self, key: &K) -> bool {
        matches!(self.find(key), Ok(Some(_)))
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let index = self.find(key).ok()??;
        Some(&self.slot(index).value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = self.find(key).ok()??;
        Some(&mut self.slot_mut(index).value)
    }

    /// Drop every entry and reset the cursor.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.buckets.fill(None);
        self.first = None;
        self.last = None;
        self.cursor = None;
        self.len = 0;
    }

    pub fn goto_first(&mut self) {
        self.cursor = self.first;
    }

    pub fn goto_last(&mut self) {
        self.cursor = self.last;
    }

    /// Advance the cursor. Past the last element the cursor becomes empty.
    pub fn goto_next(&mut self) {
        if let Some(index) = self.cursor {
            self.cursor = self.slot(index).list_next;
        }
    }

    pub fn goto_previous(&mut self) {
        if let Some(index) = self.cursor {
            self.cursor = self.slot(index).list_prev;
        }
    }

    /// Point the cursor at `key`. The cursor is emptied when the key is absent.
    pub fn goto_key(&mut self, key: &K) -> Result<(), RegistryError> {
        self.cursor = None;
        self.cursor = Some(self.find(key)?.ok_or(RegistryError::KeyNotFound)?);
        Ok(())
    }

    pub fn has_current(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn current(&self) -> Option<(&K, &V)> {
        let slot = self.slot(self.cursor?);
        Some((&slot.key, &slot.value))
    }

    pub fn current_mut(&mut self) -> Option<(&K, &mut V)> {
        let index = self.cursor?;
        let slot = self.slot_mut(index);
        Some((&slot.key, &mut slot.value))
    }

    /// Remove the element under the cursor and advance to the element that
    /// followed it.
    pub fn remove_current(&mut self) -> Result<(K, V), RegistryError> {
        let index = self.cursor.ok_or(RegistryError::NoCurrentElement)?;
        let slot = self.unlink(index);
        Ok((slot.key, slot.value))
    }

    /// Iterate in insertion order without touching the cursor.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            slots: &self.slots,
            next: self.first,
            remaining: self.len,
        }
    }

    /// Snapshot of the keys in insertion order.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.iter().map(|(k, _)| k.clone()).collect()
    }

    fn bucket_of(key: &K) -> Result<usize, RegistryError> {
        let index = H::bucket_index(key);
        if index >= BUCKETS {
            return Err(RegistryError::InvalidBucketIndex {
                index,
                buckets: BUCKETS,
            });
        }
        Ok(index)
    }

    fn find(&self, key: &K) -> Result<Option<usize>, RegistryError> {
        let bucket = Self::bucket_of(key)?;
        Ok(self.find_in_bucket(bucket, key))
    }

    fn find_in_bucket(&self, bucket: usize, key: &K) -> Option<usize> {
        let mut next = self.buckets[bucket];
        while let Some(index) = next {
            let slot = self.slot(index);
            if slot.key == *key {
                return Some(index);
            }
            next = slot.hash_next;
        }
        None
    }

    fn alloc(&mut self, slot: Slot<K, V>) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    /// Detach a slot from both chains and release it.
    fn unlink(&mut self, index: usize) -> Slot<K, V> {
        let Some(slot) = self.slots[index].take() else {
            unreachable!("registry link to vacant slot {index}");
        };

        match slot.hash_prev {
            Some(prev) => self.slot_mut(prev).hash_next = slot.hash_next,
            None => self.buckets[slot.bucket] = slot.hash_next,
        }
        if let Some(next) = slot.hash_next {
            self.slot_mut(next).hash_prev = slot.hash_prev;
        }

        match slot.list_prev {
            Some(prev) => self.slot_mut(prev).list_next = slot.list_next,
            None => self.first = slot.list_next,
        }
        match slot.list_next {
            Some(next) => self.slot_mut(next).list_prev = slot.list_prev,
            None => self.last = slot.list_prev,
        }

        if self.cursor == Some(index) {
            self.cursor = slot.list_next;
        }
        self.free.push(index);
        self.len -= 1;
        slot
    }

    fn slot(&self, index: usize) -> &Slot<K, V> {
        match &self.slots[index] {
            Some(slot) => slot,
            None => unreachable!("registry link to vacant slot {index}"),
        }
    }

    fn slot_mut(&mut self, index: usize) -> &mut Slot<K, V> {
        match &mut self.slots[index] {
            Some(slot) => slot,
            None => unreachable!("registry link to vacant slot {index}"),
        }
    }
}

impl<K, V, H, const BUCKETS: usize> Default for KeyedRegistry<K, V, H, BUCKETS>
where
    K: Eq,
    H: BucketIndex<K>,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Insertion-order iterator over a [`KeyedRegistry`].
pub struct Iter<'a, K, V> {
    slots: &'a [Option<Slot<K, V>>],
    next: Option<usize>,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.slots[self.next?].as_ref()?;
        self.next = slot.list_next;
        self.remaining -= 1;
        Some((&slot.key, &slot.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TEST_BUCKETS: usize = 4;

    struct ModBuckets;

    impl BucketIndex<u32> for ModBuckets {
        fn bucket_index(key: &u32) -> usize {
            (*key as usize) % TEST_BUCKETS
        }
    }

    /// Always out of range.
    struct BrokenBuckets;

    impl BucketIndex<u32> for BrokenBuckets {
        fn bucket_index(_: &u32) -> usize {
            TEST_BUCKETS
        }
    }

    type Registry = KeyedRegistry<u32, String, ModBuckets, TEST_BUCKETS>;

    impl<K, V, H, const BUCKETS: usize> KeyedRegistry<K, V, H, BUCKETS>
    where
        K: Eq,
        H: BucketIndex<K>,
    {
        /// Walk both chain families and assert they describe the same set.
        fn assert_consistent(&self) {
            let mut count = 0;
            let mut prev = None;
            let mut next = self.first;
            while let Some(index) = next {
                let slot = self.slot(index);
                assert_eq!(slot.list_prev, prev, "broken list back-link");
                assert_eq!(slot.bucket, H::bucket_index(&slot.key));
                assert_eq!(self.find_in_bucket(slot.bucket, &slot.key), Some(index));
                prev = Some(index);
                next = slot.list_next;
                count += 1;
            }
            assert_eq!(self.last, prev);
            assert_eq!(count, self.len);

            let mut hashed = 0;
            for (bucket, head) in self.buckets.iter().enumerate() {
                let mut prev = None;
                let mut next = *head;
                while let Some(index) = next {
                    let slot = self.slot(index);
                    assert_eq!(slot.bucket, bucket);
                    assert_eq!(slot.hash_prev, prev, "broken bucket back-link");
                    prev = Some(index);
                    next = slot.hash_next;
                    hashed += 1;
                }
            }
            assert_eq!(hashed, self.len);
            assert_eq!(self.slots.iter().filter(|s| s.is_some()).count(), self.len);

            if let Some(index) = self.cursor {
                assert!(self.slots[index].is_some(), "cursor on vacant slot");
            }
        }
    }

    fn registry_with(keys: &[u32]) -> Registry {
        let mut r = Registry::new();
        for &k in keys {
            r.add(k, format!("v{k}")).unwrap();
        }
        r
    }

    #[test]
    fn add_and_lookup() {
        let r = registry_with(&[1, 5, 9, 2]);
        assert_eq!(r.len(), 4);
        assert_eq!(r.get(&5).map(String::as_str), Some("v5"));
        assert!(r.contains(&9));
        assert!(r.get(&3).is_none());
        r.assert_consistent();
    }

    #[test]
    fn duplicate_key_rejected() {
        let mut r = registry_with(&[1]);
        assert_eq!(r.add(1, "again".into()), Err(RegistryError::DuplicateKey));
        assert_eq!(r.get(&1).map(String::as_str), Some("v1"));
    }

    #[test]
    fn remove_missing_key() {
        let mut r = registry_with(&[1]);
        assert_eq!(r.remove(&2), Err(RegistryError::KeyNotFound));
    }

    #[test]
    fn out_of_range_bucket_rejected() {
        let mut r: KeyedRegistry<u32, (), BrokenBuckets, TEST_BUCKETS> = KeyedRegistry::new();
        assert_eq!(
            r.add(1, ()),
            Err(RegistryError::InvalidBucketIndex {
                index: TEST_BUCKETS,
                buckets: TEST_BUCKETS
            })
        );
        assert!(!r.contains(&1));
        assert!(r.is_empty());
    }

    #[test]
    fn iteration_keeps_insertion_order() {
        let r = registry_with(&[8, 3, 4, 0, 7]);
        assert_eq!(r.keys(), vec![8, 3, 4, 0, 7]);
        assert_eq!(r.iter().len(), 5);
    }

    #[test]
    fn add_delete_add_is_stable() {
        let mut r = registry_with(&[1, 2, 3]);
        let before = r.keys();

        r.add(5, "v5".into()).unwrap();
        r.remove(&5).unwrap();
        assert_eq!(r.keys(), before);
        assert!(!r.contains(&5));

        r.add(5, "v5".into()).unwrap();
        r.remove(&5).unwrap();
        assert_eq!(r.len(), 3);
        assert_eq!(r.keys(), before);
        // The freed slot is reused instead of growing the arena.
        assert_eq!(r.slots.len(), 4);
        r.assert_consistent();
    }

    #[test]
    fn cursor_walks_both_directions() {
        let mut r = registry_with(&[1, 2, 3]);
        r.goto_first();
        assert_eq!(r.current().map(|(k, _)| *k), Some(1));
        r.goto_next();
        r.goto_next();
        assert_eq!(r.current().map(|(k, _)| *k), Some(3));
        r.goto_next();
        assert!(!r.has_current());

        r.goto_last();
        r.goto_previous();
        assert_eq!(r.current().map(|(k, _)| *k), Some(2));
        r.goto_previous();
        r.goto_previous();
        assert!(!r.has_current());
    }

    #[test]
    fn remove_current_advances() {
        let mut r = registry_with(&[1, 2, 3]);
        r.goto_first();
        r.goto_next();
        let (k, v) = r.remove_current().unwrap();
        assert_eq!((k, v.as_str()), (2, "v2"));
        assert_eq!(r.current().map(|(k, _)| *k), Some(3));

        let (k, _) = r.remove_current().unwrap();
        assert_eq!(k, 3);
        assert!(!r.has_current());
        assert_eq!(r.remove_current(), Err(RegistryError::NoCurrentElement));
        assert_eq!(r.keys(), vec![1]);
        r.assert_consistent();
    }

    #[test]
    fn remove_by_key_under_cursor_advances() {
        let mut r = registry_with(&[1, 2, 3]);
        r.goto_key(&2).unwrap();
        r.remove(&2).unwrap();
        assert_eq!(r.current().map(|(k, _)| *k), Some(3));
    }

    #[test]
    fn remove_during_full_scan() {
        let mut r = registry_with(&[0, 1, 2, 3, 4, 5, 6, 7]);
        r.goto_first();
        while let Some((k, _)) = r.current() {
            if k % 2 == 0 {
                r.remove_current().unwrap();
            } else {
                r.goto_next();
            }
        }
        assert_eq!(r.keys(), vec![1, 3, 5, 7]);
        r.assert_consistent();
    }

    #[test]
    fn current_mut_updates_value() {
        let mut r = registry_with(&[4]);
        r.goto_first();
        if let Some((_, v)) = r.current_mut() {
            v.push('!');
        }
        assert_eq!(r.get(&4).map(String::as_str), Some("v4!"));
        *r.get_mut(&4).unwrap() = "x".into();
        assert_eq!(r.get(&4).map(String::as_str), Some("x"));
    }

    #[test]
    fn clear_resets_everything() {
        let mut r = registry_with(&[1, 2]);
        r.goto_first();
        r.clear();
        assert!(r.is_empty());
        assert!(!r.has_current());
        r.add(1, "v1".into()).unwrap();
        r.assert_consistent();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u32),
        Remove(u32),
        RemoveCurrent,
        First,
        Last,
        Next,
        Previous,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..16).prop_map(Op::Add),
            (0u32..16).prop_map(Op::Remove),
            Just(Op::RemoveCurrent),
            Just(Op::First),
            Just(Op::Last),
            Just(Op::Next),
            Just(Op::Previous),
        ]
    }

    proptest! {
        #[test]
        fn links_stay_consistent(ops in proptest::collection::vec(op(), 0..200)) {
            let mut r = Registry::new();
            let mut model: Vec<u32> = Vec::new();
            let mut cursor: Option<u32> = None;

            for op in ops {
                match op {
                    Op::Add(k) => {
                        let res = r.add(k, format!("v{k}"));
                        if model.contains(&k) {
                            prop_assert_eq!(res, Err(RegistryError::DuplicateKey));
                        } else {
                            prop_assert!(res.is_ok());
                            model.push(k);
                        }
                    }
                    Op::Remove(k) => match model.iter().position(|&m| m == k) {
                        Some(pos) => {
                            prop_assert_eq!(r.remove(&k), Ok(format!("v{k}")));
                            model.remove(pos);
                            if cursor == Some(k) {
                                cursor = model.get(pos).copied();
                            }
                        }
                        None => prop_assert_eq!(r.remove(&k), Err(RegistryError::KeyNotFound)),
                    },
                    Op::RemoveCurrent => match cursor {
                        Some(k) => {
                            let pos = model.iter().position(|&m| m == k).unwrap();
                            prop_assert_eq!(r.remove_current(), Ok((k, format!("v{k}"))));
                            model.remove(pos);
                            cursor = model.get(pos).copied();
                        }
                        None => prop_assert_eq!(r.remove_current(), Err(RegistryError::NoCurrentElement)),
                    },
                    Op::First => {
                        r.goto_first();
                        cursor = model.first().copied();
                    }
                    Op::Last => {
                        r.goto_last();
                        cursor = model.last().copied();
                    }
                    Op::Next => {
                        r.goto_next();
                        if let Some(k) = cursor {
                            let pos = model.iter().position(|&m| m == k).unwrap();
                            cursor = model.get(pos + 1).copied();
                        }
                    }
                    Op::Previous => {
                        r.goto_previous();
                        if let Some(k) = cursor {
                            let pos = model.iter().position(|&m| m == k).unwrap();
                            cursor = pos.checked_sub(1).map(|p| model[p]);
                        }
                    }
                }

                r.assert_consistent();
                prop_assert_eq!(r.keys(), model.clone());
                prop_assert_eq!(r.current().map(|(k, _)| *k), cursor);
                for k in 0..16u32 {
                    prop_assert_eq!(r.contains(&k), model.contains(&k));
                }
            }
        }
    }
}
