//! Bucketed record image of hash and table stores.

use crate::storage::RecordMap;

/// Records spread over `crc32(key) mod bucket_count` buckets.
///
/// Iteration visits buckets in index order and records in insertion order
/// within each bucket. Overwriting a record keeps its place.
#[derive(Debug, Clone)]
pub struct BucketMap {
    buckets: Vec<Vec<(Vec<u8>, Vec<u8>)>>,
    len: usize,
}

/// Place of a record in iteration order.
pub type Position = (usize, usize);

impl BucketMap {
    pub fn new(bucket_count: u64) -> Self {
        let count = usize::try_from(bucket_count.max(1)).unwrap_or(usize::MAX);
        Self {
            buckets: vec![Vec::new(); count],
            len: 0,
        }
    }

    pub fn bucket_count(&self) -> u64 {
        self.buckets.len() as u64
    }

    fn bucket_of(&self, key: &[u8]) -> usize {
        (crc32fast::hash(key) as usize) % self.buckets.len()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.buckets[self.bucket_of(key)]
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite. Returns the previous value.
    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) -> Option<Vec<u8>> {
        let bucket = self.bucket_of(key);
        let slot = &mut self.buckets[bucket];
        if let Some((_, existing)) = slot.iter_mut().find(|(k, _)| k == key) {
            return Some(std::mem::replace(existing, value));
        }
        slot.push((key.to_vec(), value));
        self.len += 1;
        None
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let bucket = self.bucket_of(key);
        let slot = &mut self.buckets[bucket];
        let idx = slot.iter().position(|(k, _)| k == key)?;
        self.len -= 1;
        Some(slot.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iteration rank of `key`, used to restore store order after sorting.
    pub fn position(&self, key: &[u8]) -> Option<Position> {
        let bucket = self.bucket_of(key);
        self.buckets[bucket]
            .iter()
            .position(|(k, _)| k == key)
            .map(|idx| (bucket, idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.buckets
            .iter()
            .flatten()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.iter().map(|(k, _)| k)
    }
}

impl RecordMap for BucketMap {
    fn chain(&self, key: &[u8]) -> Option<&[Vec<u8>]> {
        self.get(key).map(std::slice::from_ref)
    }

    fn restore(&mut self, key: &[u8], chain: Option<Vec<Vec<u8>>>) {
        match chain.and_then(|values| values.into_iter().next()) {
            Some(value) => {
                self.insert(key, value);
            }
            None => {
                self.remove(key);
            }
        }
    }

    fn clear(&mut self) {
        self.buckets.iter_mut().for_each(Vec::clear);
        self.len = 0;
    }

    fn key_count(&self) -> usize {
        self.len
    }

    fn record_count(&self) -> u64 {
        self.len as u64
    }

    fn for_each_chain(&self, visit: &mut dyn FnMut(&[u8], &[Vec<u8>])) {
        for (key, value) in self.buckets.iter().flatten() {
            visit(key, std::slice::from_ref(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_insert_overwrite_remove() {
        let mut map = BucketMap::new(7);
        assert_eq!(map.insert(b"a", b"1".to_vec()), None);
        assert_eq!(map.insert(b"a", b"2".to_vec()), Some(b"1".to_vec()));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(b"a"), Some(&b"2".to_vec()));
        assert_eq!(map.remove(b"a"), Some(b"2".to_vec()));
        assert_eq!(map.remove(b"a"), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_iteration_follows_buckets_then_insertion() {
        // A single bucket keeps pure insertion order.
        let mut map = BucketMap::new(1);
        for key in ["c", "a", "b"] {
            map.insert(key.as_bytes(), Vec::new());
        }
        map.insert(b"a", b"again".to_vec());
        let keys: Vec<&[u8]> = map.keys().collect();
        assert_eq!(keys, vec![b"c".as_slice(), b"a".as_slice(), b"b".as_slice()]);

        let mut map = BucketMap::new(31);
        for i in 0..100u32 {
            map.insert(&i.to_le_bytes(), Vec::new());
        }
        let positions: Vec<Position> = map
            .keys()
            .map(|k| map.position(k).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);
    }

    #[test]
    fn test_restore_uses_first_value() {
        let mut map = BucketMap::new(3);
        map.restore(b"k", Some(vec![b"x".to_vec(), b"y".to_vec()]));
        assert_eq!(map.chain(b"k"), Some(&[b"x".to_vec()][..]));
        map.restore(b"k", None);
        assert_eq!(map.record_count(), 0);
    }
}
