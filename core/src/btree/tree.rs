//! In-memory B+tree with pluggable key order and value chains.
//!
//! Nodes live in an arena and refer to each other by index. Leaves are
//! doubly linked for ordered scans in both directions. Underfull nodes are
//! not merged; empty ones are unlinked and their slots reused.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::btree::comparator::{BuiltinComparator, Comparator};
use crate::storage::RecordMap;

type NodeId = usize;

#[derive(Debug, Clone)]
struct LeafRecord {
    key: Vec<u8>,
    /// Duplicate chain in insertion order, never empty.
    values: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        records: Vec<LeafRecord>,
        prev: Option<NodeId>,
        next: Option<NodeId>,
    },
    /// `keys[i]` is the lower bound of `children[i + 1]`.
    Inner {
        keys: Vec<Vec<u8>>,
        children: Vec<NodeId>,
    },
    Free,
}

impl Node {
    fn empty_leaf() -> Self {
        Node::Leaf {
            records: Vec::new(),
            prev: None,
            next: None,
        }
    }
}

/// Location of one record (a key and its chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    leaf: NodeId,
    idx: usize,
}

/// Ordered multimap from byte keys to value chains.
pub struct OrderedTree {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    root: NodeId,
    comparator: Arc<dyn Comparator>,
    leaf_members: usize,
    internal_members: usize,
    keys: usize,
    records: u64,
    /// Bumped by every mutation; positions taken earlier may be stale.
    stamp: u64,
}

impl OrderedTree {
    pub fn new(comparator: Arc<dyn Comparator>, leaf_members: u32, internal_members: u32) -> Self {
        Self {
            nodes: vec![Node::empty_leaf()],
            free: Vec::new(),
            root: 0,
            comparator,
            leaf_members: leaf_members.max(2) as usize,
            internal_members: internal_members.max(2) as usize,
            keys: 0,
            records: 0,
            stamp: 0,
        }
    }

    /// Tree with byte-wise order and default fan-out.
    pub fn lexical() -> Self {
        Self::new(BuiltinComparator::Lexical.shared(), 128, 256)
    }

    pub fn comparator(&self) -> &Arc<dyn Comparator> {
        &self.comparator
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.comparator.compare(a, b)
    }

    pub fn len(&self) -> usize {
        self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys == 0
    }

    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn records(&self, leaf: NodeId) -> &[LeafRecord] {
        match &self.nodes[leaf] {
            Node::Leaf { records, .. } => records,
            _ => &[],
        }
    }

    /// Number of separators `<= key`, the child to descend into.
    fn child_index(&self, keys: &[Vec<u8>], key: &[u8]) -> usize {
        keys.partition_point(|k| self.compare(k, key) != Ordering::Greater)
    }

    fn leaf_for(&self, key: &[u8]) -> NodeId {
        let mut id = self.root;
        while let Node::Inner { keys, children } = &self.nodes[id] {
            id = children[self.child_index(keys, key)];
        }
        id
    }

    fn search(&self, leaf: NodeId, key: &[u8]) -> std::result::Result<usize, usize> {
        self.records(leaf)
            .binary_search_by(|record| self.compare(&record.key, key))
    }

    pub fn find(&self, key: &[u8]) -> Option<Pos> {
        let leaf = self.leaf_for(key);
        self.search(leaf, key).ok().map(|idx| Pos { leaf, idx })
    }

    pub fn get(&self, key: &[u8]) -> Option<&[Vec<u8>]> {
        self.find(key).map(|pos| self.record(pos).1)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    /// Key and chain at `pos`. `pos` must come from this tree since the
    /// last mutation.
    pub fn record(&self, pos: Pos) -> (&[u8], &[Vec<u8>]) {
        let record = &self.records(pos.leaf)[pos.idx];
        (&record.key, &record.values)
    }

    /// Replace the chain of `key`, returning the previous one. An empty
    /// chain removes the key.
    pub fn insert(&mut self, key: &[u8], values: Vec<Vec<u8>>) -> Option<Vec<Vec<u8>>> {
        if values.is_empty() {
            return self.remove(key);
        }
        self.stamp += 1;
        let added = values.len() as u64;
        let (old, split) = self.insert_at(self.root, key, values);
        if let Some((separator, right)) = split {
            let left = self.root;
            self.root = self.alloc(Node::Inner {
                keys: vec![separator],
                children: vec![left, right],
            });
        }
        match &old {
            Some(previous) => self.records = self.records - previous.len() as u64 + added,
            None => {
                self.keys += 1;
                self.records += added;
            }
        }
        old
    }

    fn insert_at(
        &mut self,
        id: NodeId,
        key: &[u8],
        values: Vec<Vec<u8>>,
    ) -> (Option<Vec<Vec<u8>>>, Option<(Vec<u8>, NodeId)>) {
        let route = match &self.nodes[id] {
            Node::Inner { keys, children } => {
                let idx = self.child_index(keys, key);
                Some((idx, children[idx]))
            }
            _ => None,
        };

        if let Some((idx, child)) = route {
            let (old, split) = self.insert_at(child, key, values);
            if let Some((separator, right)) = split {
                if let Node::Inner { keys, children } = &mut self.nodes[id] {
                    keys.insert(idx, separator);
                    children.insert(idx + 1, right);
                }
                return (old, self.split_inner(id));
            }
            return (old, None);
        }

        let found = self.search(id, key);
        let Node::Leaf { records, .. } = &mut self.nodes[id] else {
            return (None, None);
        };
        match found {
            Ok(idx) => (Some(std::mem::replace(&mut records[idx].values, values)), None),
            Err(idx) => {
                records.insert(
                    idx,
                    LeafRecord {
                        key: key.to_vec(),
                        values,
                    },
                );
                (None, self.split_leaf(id))
            }
        }
    }

    fn split_leaf(&mut self, id: NodeId) -> Option<(Vec<u8>, NodeId)> {
        let limit = self.leaf_members;
        let (moved, next) = match &mut self.nodes[id] {
            Node::Leaf { records, next, .. } if records.len() > limit => {
                let mid = records.len() / 2;
                (records.split_off(mid), *next)
            }
            _ => return None,
        };
        let separator = moved[0].key.clone();
        let right = self.alloc(Node::Leaf {
            records: moved,
            prev: Some(id),
            next,
        });
        if let Node::Leaf { next, .. } = &mut self.nodes[id] {
            *next = Some(right);
        }
        if let Some(after) = next {
            if let Node::Leaf { prev, .. } = &mut self.nodes[after] {
                *prev = Some(right);
            }
        }
        Some((separator, right))
    }

    fn split_inner(&mut self, id: NodeId) -> Option<(Vec<u8>, NodeId)> {
        let limit = self.internal_members;
        let (separator, right_keys, right_children) = match &mut self.nodes[id] {
            Node::Inner { keys, children } if keys.len() > limit => {
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid + 1);
                let separator = keys.pop()?;
                (separator, right_keys, children.split_off(mid + 1))
            }
            _ => return None,
        };
        let right = self.alloc(Node::Inner {
            keys: right_keys,
            children: right_children,
        });
        Some((separator, right))
    }

    /// Remove `key` and its whole chain.
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<Vec<u8>>> {
        let (values, _) = self.remove_at(self.root, key)?;
        self.stamp += 1;
        self.keys -= 1;
        self.records -= values.len() as u64;

        if matches!(&self.nodes[self.root], Node::Inner { children, .. } if children.is_empty()) {
            self.nodes[self.root] = Node::empty_leaf();
        }
        loop {
            let only = match &self.nodes[self.root] {
                Node::Inner { children, .. } if children.len() == 1 => children[0],
                _ => break,
            };
            self.release(self.root);
            self.root = only;
        }
        Some(values)
    }

    /// Returns the removed chain and whether node `id` is now empty.
    fn remove_at(&mut self, id: NodeId, key: &[u8]) -> Option<(Vec<Vec<u8>>, bool)> {
        let route = match &self.nodes[id] {
            Node::Inner { keys, children } => {
                let idx = self.child_index(keys, key);
                Some((idx, children[idx]))
            }
            _ => None,
        };

        if let Some((idx, child)) = route {
            let (values, child_empty) = self.remove_at(child, key)?;
            if child_empty {
                self.unlink(child);
                self.release(child);
            }
            let Node::Inner { keys, children } = &mut self.nodes[id] else {
                return Some((values, false));
            };
            if child_empty {
                children.remove(idx);
                if !keys.is_empty() {
                    keys.remove(idx.saturating_sub(1));
                }
            }
            return Some((values, children.is_empty()));
        }

        let idx = self.search(id, key).ok()?;
        let Node::Leaf { records, .. } = &mut self.nodes[id] else {
            return None;
        };
        let record = records.remove(idx);
        Some((record.values, records.is_empty()))
    }

    fn unlink(&mut self, id: NodeId) {
        let (before, after) = match &self.nodes[id] {
            Node::Leaf { prev, next, .. } => (*prev, *next),
            _ => return,
        };
        if let Some(before) = before {
            if let Node::Leaf { next, .. } = &mut self.nodes[before] {
                *next = after;
            }
        }
        if let Some(after) = after {
            if let Node::Leaf { prev, .. } = &mut self.nodes[after] {
                *prev = before;
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        self.nodes[id] = Node::Free;
        self.free.push(id);
    }

    /// Append `value` to the chain of `key`, creating the key if absent.
    pub fn append_dup(&mut self, key: &[u8], value: Vec<u8>) {
        let len = self.get(key).map_or(0, <[Vec<u8>]>::len);
        self.insert_value_at(key, len, value);
    }

    /// Insert `value` at `index` of the chain of `key`. Index 0 creates a
    /// missing key; `false` if `index` is past the chain end.
    pub fn insert_value_at(&mut self, key: &[u8], index: usize, value: Vec<u8>) -> bool {
        let Some(pos) = self.find(key) else {
            if index != 0 {
                return false;
            }
            self.insert(key, vec![value]);
            return true;
        };
        let Node::Leaf { records, .. } = &mut self.nodes[pos.leaf] else {
            return false;
        };
        let values = &mut records[pos.idx].values;
        if index > values.len() {
            return false;
        }
        values.insert(index, value);
        self.records += 1;
        self.stamp += 1;
        true
    }

    /// Remove the value at `index` of the chain of `key`. The key goes
    /// with its last value.
    pub fn remove_value_at(&mut self, key: &[u8], index: usize) -> Option<Vec<u8>> {
        let pos = self.find(key)?;
        let Node::Leaf { records, .. } = &mut self.nodes[pos.leaf] else {
            return None;
        };
        let values = &mut records[pos.idx].values;
        if index >= values.len() {
            return None;
        }
        if values.len() == 1 {
            return self.remove(key).and_then(|mut chain| chain.pop());
        }
        let removed = values.remove(index);
        self.records -= 1;
        self.stamp += 1;
        Some(removed)
    }

    /// Overwrite the value at `index`, returning the old one.
    pub fn replace_value_at(&mut self, key: &[u8], index: usize, value: Vec<u8>) -> Option<Vec<u8>> {
        let pos = self.find(key)?;
        let Node::Leaf { records, .. } = &mut self.nodes[pos.leaf] else {
            return None;
        };
        let slot = records[pos.idx].values.get_mut(index)?;
        let old = std::mem::replace(slot, value);
        self.stamp += 1;
        Some(old)
    }

    /// Remove the first occurrence of `value` from the chain of `key`.
    pub fn remove_dup_value(&mut self, key: &[u8], value: &[u8]) -> bool {
        let Some(pos) = self.find(key) else {
            return false;
        };
        let Node::Leaf { records, .. } = &mut self.nodes[pos.leaf] else {
            return false;
        };
        let values = &mut records[pos.idx].values;
        let Some(at) = values.iter().position(|v| v == value) else {
            return false;
        };
        if values.len() == 1 {
            self.remove(key);
        } else {
            values.remove(at);
            self.records -= 1;
            self.stamp += 1;
        }
        true
    }

    pub fn first(&self) -> Option<Pos> {
        let mut id = self.root;
        while let Node::Inner { children, .. } = &self.nodes[id] {
            id = *children.first()?;
        }
        (!self.records(id).is_empty()).then_some(Pos { leaf: id, idx: 0 })
    }

    pub fn last(&self) -> Option<Pos> {
        let mut id = self.root;
        while let Node::Inner { children, .. } = &self.nodes[id] {
            id = *children.last()?;
        }
        let len = self.records(id).len();
        (len > 0).then(|| Pos {
            leaf: id,
            idx: len - 1,
        })
    }

    pub fn next(&self, pos: Pos) -> Option<Pos> {
        if pos.idx + 1 < self.records(pos.leaf).len() {
            return Some(Pos {
                leaf: pos.leaf,
                idx: pos.idx + 1,
            });
        }
        match &self.nodes[pos.leaf] {
            Node::Leaf { next: Some(next), .. } => Some(Pos {
                leaf: *next,
                idx: 0,
            }),
            _ => None,
        }
    }

    pub fn prev(&self, pos: Pos) -> Option<Pos> {
        if pos.idx > 0 {
            return Some(Pos {
                leaf: pos.leaf,
                idx: pos.idx - 1,
            });
        }
        match &self.nodes[pos.leaf] {
            Node::Leaf { prev: Some(prev), .. } => {
                let len = self.records(*prev).len();
                (len > 0).then(|| Pos {
                    leaf: *prev,
                    idx: len - 1,
                })
            }
            _ => None,
        }
    }

    /// First record whose key is `>= key`.
    pub fn seek(&self, key: &[u8]) -> Option<Pos> {
        let leaf = self.leaf_for(key);
        let records = self.records(leaf);
        let idx = records.partition_point(|r| self.compare(&r.key, key) == Ordering::Less);
        if idx < records.len() {
            return Some(Pos { leaf, idx });
        }
        if records.is_empty() {
            return None;
        }
        self.next(Pos {
            leaf,
            idx: records.len() - 1,
        })
    }

    /// Last record whose key is `<= key`.
    pub fn seek_back(&self, key: &[u8]) -> Option<Pos> {
        let leaf = self.leaf_for(key);
        let records = self.records(leaf);
        let idx = records.partition_point(|r| self.compare(&r.key, key) != Ordering::Greater);
        if idx > 0 {
            return Some(Pos { leaf, idx: idx - 1 });
        }
        if records.is_empty() {
            return None;
        }
        self.prev(Pos { leaf, idx: 0 })
    }

    /// Records in key order starting at `pos`.
    pub fn entries_from(&self, pos: Option<Pos>) -> Entries<'_> {
        Entries { tree: self, pos }
    }

    pub fn entries(&self) -> Entries<'_> {
        self.entries_from(self.first())
    }

    /// Keys within the bounds in key order, once per value of the chain.
    /// `None` bounds are open.
    pub fn range(
        &self,
        begin: Option<(&[u8], bool)>,
        end: Option<(&[u8], bool)>,
        max: Option<usize>,
    ) -> Vec<Vec<u8>> {
        let max = max.unwrap_or(usize::MAX);
        let mut start = match begin {
            Some((key, _)) => self.seek(key),
            None => self.first(),
        };
        if let (Some((key, false)), Some(pos)) = (begin, start) {
            if self.compare(self.record(pos).0, key) == Ordering::Equal {
                start = self.next(pos);
            }
        }

        let mut keys = Vec::new();
        for (key, values) in self.entries_from(start) {
            if let Some((limit, inclusive)) = end {
                match self.compare(key, limit) {
                    Ordering::Greater => break,
                    Ordering::Equal if !inclusive => break,
                    _ => {}
                }
            }
            for _ in values {
                if keys.len() >= max {
                    return keys;
                }
                keys.push(key.to_vec());
            }
        }
        keys
    }

    /// Keys starting with `prefix` in key order.
    ///
    /// Under byte-wise order the scan starts at the prefix; any other order
    /// may scatter matches, so the whole tree is scanned.
    pub fn fwmkeys(&self, prefix: &[u8], max: Option<usize>) -> Vec<Vec<u8>> {
        let max = max.unwrap_or(usize::MAX);
        if self.comparator.builtin() == Some(BuiltinComparator::Lexical) {
            return self
                .entries_from(self.seek(prefix))
                .map(|(key, _)| key)
                .take_while(|key| key.starts_with(prefix))
                .take(max)
                .map(<[u8]>::to_vec)
                .collect();
        }
        self.entries()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(prefix))
            .take(max)
            .map(<[u8]>::to_vec)
            .collect()
    }

    fn reset(&mut self) {
        self.nodes = vec![Node::empty_leaf()];
        self.free.clear();
        self.root = 0;
        self.keys = 0;
        self.records = 0;
        self.stamp += 1;
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        let mut depth = 1;
        let mut id = self.root;
        while let Node::Inner { children, .. } = &self.nodes[id] {
            id = children[0];
            depth += 1;
        }
        depth
    }
}

/// Iterator over records in key order.
pub struct Entries<'a> {
    tree: &'a OrderedTree,
    pos: Option<Pos>,
}

impl<'a> Iterator for Entries<'a> {
    type Item = (&'a [u8], &'a [Vec<u8>]);

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.pos?;
        self.pos = self.tree.next(pos);
        Some(self.tree.record(pos))
    }
}

impl RecordMap for OrderedTree {
    fn chain(&self, key: &[u8]) -> Option<&[Vec<u8>]> {
        self.get(key)
    }

    fn restore(&mut self, key: &[u8], chain: Option<Vec<Vec<u8>>>) {
        match chain {
            Some(values) => {
                self.insert(key, values);
            }
            None => {
                self.remove(key);
            }
        }
    }

    fn clear(&mut self) {
        self.reset();
    }

    fn key_count(&self) -> usize {
        self.keys
    }

    fn record_count(&self) -> u64 {
        self.records
    }

    fn for_each_chain(&self, visit: &mut dyn FnMut(&[u8], &[Vec<u8>])) {
        for (key, values) in self.entries() {
            visit(key, values);
        }
    }

    fn insert_value(&mut self, key: &[u8], index: usize, value: Vec<u8>) -> bool {
        self.insert_value_at(key, index, value)
    }

    fn remove_value(&mut self, key: &[u8], index: usize) -> Option<Vec<u8>> {
        self.remove_value_at(key, index)
    }

    fn replace_value(&mut self, key: &[u8], index: usize, value: Vec<u8>) -> Option<Vec<u8>> {
        self.replace_value_at(key, index, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn small_tree() -> OrderedTree {
        OrderedTree::new(BuiltinComparator::Lexical.shared(), 4, 4)
    }

    fn key(i: u32) -> Vec<u8> {
        format!("{i:05}").into_bytes()
    }

    fn all_keys(tree: &OrderedTree) -> Vec<Vec<u8>> {
        tree.entries().map(|(k, _)| k.to_vec()).collect()
    }

    #[test]
    fn test_insert_splits_and_stays_sorted() {
        let mut tree = small_tree();
        for i in (0..500).rev() {
            assert_eq!(tree.insert(&key(i), vec![b"v".to_vec()]), None);
        }
        assert!(tree.depth() > 2);
        assert_eq!(tree.len(), 500);
        assert_eq!(all_keys(&tree), (0..500).map(key).collect::<Vec<_>>());

        let backwards: Vec<Vec<u8>> = std::iter::successors(tree.last(), |p| tree.prev(*p))
            .map(|p| tree.record(p).0.to_vec())
            .collect();
        assert_eq!(backwards, (0..500).rev().map(key).collect::<Vec<_>>());
    }

    #[test]
    fn test_remove_collapses_tree() {
        let mut tree = small_tree();
        for i in 0..300 {
            tree.insert(&key(i), vec![b"v".to_vec()]);
        }
        for i in (0..300).filter(|i| i % 3 != 0) {
            assert!(tree.remove(&key(i)).is_some());
        }
        assert_eq!(tree.len(), 100);
        assert_eq!(
            all_keys(&tree),
            (0..300).filter(|i| i % 3 == 0).map(key).collect::<Vec<_>>()
        );

        for i in (0..300).filter(|i| i % 3 == 0) {
            tree.remove(&key(i));
        }
        assert!(tree.is_empty());
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.first(), None);

        // Freed slots are reused.
        let slots = tree.nodes.len();
        for i in 0..300 {
            tree.insert(&key(i), vec![b"v".to_vec()]);
        }
        assert!(tree.nodes.len() <= slots);
    }

    #[test]
    fn test_seek_and_seek_back() {
        let mut tree = small_tree();
        for i in (0..100).step_by(10) {
            tree.insert(&key(i), vec![b"v".to_vec()]);
        }
        let at = |pos: Option<Pos>| pos.map(|p| tree.record(p).0.to_vec());
        assert_eq!(at(tree.seek(&key(35))), Some(key(40)));
        assert_eq!(at(tree.seek(&key(40))), Some(key(40)));
        assert_eq!(at(tree.seek(&key(95))), None);
        assert_eq!(at(tree.seek_back(&key(35))), Some(key(30)));
        assert_eq!(at(tree.seek_back(&key(30))), Some(key(30)));
        assert_eq!(at(tree.seek_back(b"")), None);
    }

    #[test]
    fn test_range_bounds_and_duplicates() {
        let mut tree = small_tree();
        for i in 1..=5 {
            tree.insert(&key(i), vec![b"v".to_vec()]);
        }
        tree.append_dup(&key(3), b"w".to_vec());
        assert_eq!(tree.record_count(), 6);

        let (low, high) = (key(2), key(4));
        let keys = tree.range(Some((low.as_slice(), true)), Some((high.as_slice(), true)), None);
        assert_eq!(keys, vec![key(2), key(3), key(3), key(4)]);

        let keys = tree.range(Some((low.as_slice(), false)), Some((high.as_slice(), false)), None);
        assert_eq!(keys, vec![key(3), key(3)]);

        let keys = tree.range(None, None, Some(3));
        assert_eq!(keys, vec![key(1), key(2), key(3)]);
    }

    #[test]
    fn test_chain_edits() {
        let mut tree = small_tree();
        tree.append_dup(b"k", b"a".to_vec());
        tree.append_dup(b"k", b"b".to_vec());
        tree.append_dup(b"k", b"a".to_vec());
        assert_eq!(tree.get(b"k").unwrap().len(), 3);

        assert!(tree.remove_dup_value(b"k", b"a"));
        assert_eq!(tree.get(b"k").unwrap(), &[b"b".to_vec(), b"a".to_vec()][..]);
        assert!(!tree.remove_dup_value(b"k", b"zz"));
        assert!(tree.remove_dup_value(b"k", b"b"));
        assert!(tree.remove_dup_value(b"k", b"a"));
        assert!(!tree.contains(b"k"));
        assert_eq!(tree.record_count(), 0);
    }

    #[test]
    fn test_positional_value_edits() {
        let mut tree = small_tree();
        for i in 0..6 {
            tree.insert(&key(i), vec![b"x".to_vec()]);
        }
        assert!(!tree.insert_value_at(b"k", 1, b"a".to_vec()));
        assert!(tree.insert_value_at(b"k", 0, b"b".to_vec()));
        assert!(tree.insert_value_at(b"k", 0, b"a".to_vec()));
        assert!(tree.insert_value_at(b"k", 2, b"c".to_vec()));
        assert_eq!(tree.record_count(), 9);

        assert_eq!(tree.replace_value_at(b"k", 1, b"B".to_vec()), Some(b"b".to_vec()));
        assert_eq!(tree.replace_value_at(b"k", 3, b"z".to_vec()), None);
        assert_eq!(tree.remove_value_at(b"k", 0), Some(b"a".to_vec()));
        assert_eq!(tree.get(b"k").unwrap(), &[b"B".to_vec(), b"c".to_vec()][..]);

        assert_eq!(tree.remove_value_at(b"k", 2), None);
        tree.remove_value_at(b"k", 1);
        assert_eq!(tree.remove_value_at(b"k", 0), Some(b"B".to_vec()));
        assert!(!tree.contains(b"k"));
        assert_eq!(tree.key_count(), 6);
        assert_eq!(tree.record_count(), 6);
    }

    #[test]
    fn test_fwmkeys_with_other_order() {
        let mut tree = OrderedTree::new(BuiltinComparator::Decimal.shared(), 4, 4);
        for k in ["10a", "9a", "100", "1a", "2b"] {
            tree.insert(k.as_bytes(), vec![Vec::new()]);
        }
        assert_eq!(
            tree.fwmkeys(b"1", None),
            vec![b"1a".to_vec(), b"10a".to_vec(), b"100".to_vec()]
        );

        let mut tree = small_tree();
        for k in ["apple", "apricot", "banana", "ap"] {
            tree.insert(k.as_bytes(), vec![Vec::new()]);
        }
        assert_eq!(
            tree.fwmkeys(b"ap", Some(2)),
            vec![b"ap".to_vec(), b"apple".to_vec()]
        );
    }

    #[test]
    fn test_stamp_tracks_mutations() {
        let mut tree = small_tree();
        let start = tree.stamp();
        tree.insert(b"a", vec![b"1".to_vec()]);
        assert!(tree.stamp() > start);
        let after_insert = tree.stamp();
        assert_eq!(tree.remove(b"missing"), None);
        assert_eq!(tree.stamp(), after_insert);
    }
}
