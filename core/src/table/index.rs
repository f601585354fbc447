//! Secondary indexes of the table store.
//!
//! Each index is an ordered tree mapping index terms to the primary keys
//! of the records that produce them. Decimal terms are stored as 8-byte
//! keys whose byte order is the numeric order.

use std::collections::BTreeSet;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::btree::OrderedTree;
use crate::table::record::Columns;
use crate::text::{normalize, parse_decimal, qgrams, tokens, QGRAM_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Whole value, byte-wise.
    Lexical,
    /// Leading decimal number of the value.
    Decimal,
    /// Each whitespace or comma separated word.
    Token,
    /// Character 3-grams of the normalized value.
    QGram,
}

impl IndexKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lexical => "lexical",
            Self::Decimal => "decimal",
            Self::Token => "token",
            Self::QGram => "qgram",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    Create(IndexKind),
    /// Rebuild an existing index from the records.
    Optimize,
    /// Drop the index.
    Remove,
}

/// Argument of `TableDb::setindex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub op: IndexOp,
    /// Fail with `AlreadyExists` instead of replacing an existing index.
    pub keep: bool,
    /// Build on first use by a query instead of before returning.
    pub deferred: bool,
}

impl IndexSpec {
    pub fn new(kind: IndexKind) -> Self {
        Self {
            op: IndexOp::Create(kind),
            keep: false,
            deferred: false,
        }
    }

    pub fn optimize() -> Self {
        Self {
            op: IndexOp::Optimize,
            keep: false,
            deferred: false,
        }
    }

    pub fn void() -> Self {
        Self {
            op: IndexOp::Remove,
            keep: false,
            deferred: false,
        }
    }

    pub fn keep(mut self) -> Self {
        self.keep = true;
        self
    }

    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }
}

/// Declaration persisted in the table file's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IndexDecl {
    pub kind: IndexKind,
    pub deferred: bool,
}

pub(crate) const INDEX_META_PREFIX: &str = "index:";

pub(crate) fn meta_name(column: &str) -> String {
    format!("{INDEX_META_PREFIX}{column}")
}

pub(crate) struct SecondaryIndex {
    column: String,
    kind: IndexKind,
    tree: OrderedTree,
    built: bool,
}

impl SecondaryIndex {
    pub fn new(column: &str, kind: IndexKind) -> Self {
        Self {
            column: column.to_string(),
            kind,
            tree: OrderedTree::lexical(),
            built: false,
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Number of distinct terms.
    pub fn term_count(&self) -> usize {
        self.tree.len()
    }

    fn terms(&self, value: &str) -> BTreeSet<Vec<u8>> {
        match self.kind {
            IndexKind::Lexical => BTreeSet::from([value.as_bytes().to_vec()]),
            IndexKind::Decimal => BTreeSet::from([numeric_key(parse_decimal(value))]),
            IndexKind::Token => tokens(value).map(|t| t.as_bytes().to_vec()).collect(),
            IndexKind::QGram => qgrams(&normalize(value))
                .into_iter()
                .map(String::into_bytes)
                .collect(),
        }
    }

    pub fn insert(&mut self, pk: &[u8], columns: &Columns) {
        if let Some(value) = columns.get(&self.column) {
            for term in self.terms(value) {
                self.tree.append_dup(&term, pk.to_vec());
            }
        }
    }

    pub fn remove(&mut self, pk: &[u8], columns: &Columns) {
        if let Some(value) = columns.get(&self.column) {
            for term in self.terms(value) {
                self.tree.remove_dup_value(&term, pk);
            }
        }
    }

    /// Rebuild from every record of the table.
    pub fn rebuild<'a, I>(&mut self, records: I)
    where
        I: IntoIterator<Item = (&'a [u8], Columns)>,
    {
        self.tree = OrderedTree::lexical();
        for (pk, columns) in records {
            self.insert(pk, &columns);
        }
        self.built = true;
    }

    pub fn clear(&mut self) {
        self.tree = OrderedTree::lexical();
    }

    /// Primary keys under exactly `term`.
    fn term(&self, term: &[u8]) -> Vec<Vec<u8>> {
        self.tree.get(term).map(<[Vec<u8>]>::to_vec).unwrap_or_default()
    }

    /// Records whose whole value is `value`. Lexical index.
    pub fn equal(&self, value: &str) -> Vec<Vec<u8>> {
        self.term(value.as_bytes())
    }

    /// Records whose value starts with `prefix`. Lexical index.
    pub fn prefix(&self, prefix: &str) -> Vec<Vec<u8>> {
        self.tree
            .entries_from(self.tree.seek(prefix.as_bytes()))
            .take_while(|(key, _)| key.starts_with(prefix.as_bytes()))
            .flat_map(|(_, pks)| pks.iter().cloned())
            .collect()
    }

    /// Records whose value contains the word `token`. Token index.
    pub fn token(&self, token: &str) -> Vec<Vec<u8>> {
        self.term(token.as_bytes())
    }

    /// Records whose number lies within the bounds. Decimal index.
    pub fn numeric(&self, low: Bound<f64>, high: Bound<f64>) -> Vec<Vec<u8>> {
        let (start, skip_equal) = match low {
            Bound::Included(n) => (self.tree.seek(&numeric_key(n)), None),
            Bound::Excluded(n) => (self.tree.seek(&numeric_key(n)), Some(numeric_key(n))),
            Bound::Unbounded => (self.tree.first(), None),
        };
        let high = match high {
            Bound::Included(n) => Bound::Included(numeric_key(n)),
            Bound::Excluded(n) => Bound::Excluded(numeric_key(n)),
            Bound::Unbounded => Bound::Unbounded,
        };
        self.tree
            .entries_from(start)
            .skip_while(|(key, _)| skip_equal.as_deref() == Some(*key))
            .take_while(|(key, _)| match &high {
                Bound::Included(limit) => *key <= limit.as_slice(),
                Bound::Excluded(limit) => *key < limit.as_slice(),
                Bound::Unbounded => true,
            })
            .flat_map(|(_, pks)| pks.iter().cloned())
            .collect()
    }

    /// Records whose normalized value may contain the normalized
    /// `phrase`. Q-gram index. `None` when the index cannot narrow the
    /// search.
    pub fn phrase(&self, phrase: &str) -> Option<Vec<Vec<u8>>> {
        if phrase.is_empty() {
            return None;
        }
        if phrase.chars().count() < QGRAM_LEN {
            // Short phrases sit inside some gram or are a whole short value.
            let found = self
                .tree
                .entries()
                .filter(|(gram, _)| contains(gram, phrase.as_bytes()))
                .flat_map(|(_, pks)| pks.iter().cloned())
                .collect::<BTreeSet<_>>();
            return Some(found.into_iter().collect());
        }
        let mut result: Option<BTreeSet<Vec<u8>>> = None;
        for gram in qgrams(phrase) {
            let pks: BTreeSet<Vec<u8>> = self.term(gram.as_bytes()).into_iter().collect();
            let narrowed = match result {
                Some(current) => current.intersection(&pks).cloned().collect(),
                None => pks,
            };
            if narrowed.is_empty() {
                return Some(Vec::new());
            }
            result = Some(narrowed);
        }
        result.map(|set| set.into_iter().collect())
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Key whose byte order matches the numeric order of `n`.
pub(crate) fn numeric_key(n: f64) -> Vec<u8> {
    let n = if n == 0.0 { 0.0 } else { n };
    let bits = n.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits | 1 << 63 };
    ordered.to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::record::columns;
    use pretty_assertions::assert_eq;

    fn index_of(kind: IndexKind, values: &[(&str, &str)]) -> SecondaryIndex {
        let mut index = SecondaryIndex::new("col", kind);
        let records: Vec<(Vec<u8>, Columns)> = values
            .iter()
            .map(|(pk, value)| (pk.as_bytes().to_vec(), columns([("col", *value)])))
            .collect();
        index.rebuild(records.iter().map(|(pk, cols)| (pk.as_slice(), cols.clone())));
        index
    }

    fn sorted(mut pks: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        pks.sort();
        pks
    }

    #[test]
    fn test_numeric_key_order() {
        let values = [-1e9, -2.5, -0.0, 0.0, 0.5, 3.0, 1e12];
        let keys: Vec<Vec<u8>> = values.iter().map(|n| numeric_key(*n)).collect();
        for pair in keys.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(numeric_key(-0.0), numeric_key(0.0));
    }

    #[test]
    fn test_lexical_lookups() {
        let index = index_of(
            IndexKind::Lexical,
            &[("1", "apple"), ("2", "apricot"), ("3", "banana"), ("4", "apple")],
        );
        assert!(index.is_built());
        assert_eq!(sorted(index.equal("apple")), vec![b"1".to_vec(), b"4".to_vec()]);
        assert_eq!(index.prefix("apr"), vec![b"2".to_vec()]);
        assert!(index.equal("cherry").is_empty());
    }

    #[test]
    fn test_numeric_ranges() {
        let index = index_of(
            IndexKind::Decimal,
            &[("a", "10"), ("b", "25.5"), ("c", "30"), ("d", "-4"), ("e", "x")],
        );
        let between = index.numeric(Bound::Included(10.0), Bound::Included(30.0));
        assert_eq!(between, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        let above = index.numeric(Bound::Excluded(10.0), Bound::Unbounded);
        assert_eq!(above, vec![b"b".to_vec(), b"c".to_vec()]);
        let below = index.numeric(Bound::Unbounded, Bound::Excluded(10.0));
        assert_eq!(below, vec![b"d".to_vec(), b"e".to_vec()]);
    }

    #[test]
    fn test_token_index_dedupes_words() {
        let index = index_of(IndexKind::Token, &[("1", "red red,blue"), ("2", "blue")]);
        assert_eq!(index.token("red"), vec![b"1".to_vec()]);
        assert_eq!(sorted(index.token("blue")), vec![b"1".to_vec(), b"2".to_vec()]);
        assert_eq!(index.term_count(), 2);
    }

    #[test]
    fn test_qgram_phrase_candidates() {
        let index = index_of(
            IndexKind::QGram,
            &[("1", "The Quick  Brown fox"), ("2", "quickly"), ("3", "ox")],
        );
        assert_eq!(
            sorted(index.phrase("quick").unwrap()),
            vec![b"1".to_vec(), b"2".to_vec()]
        );
        assert_eq!(index.phrase("brown fox").unwrap(), vec![b"1".to_vec()]);
        assert_eq!(
            sorted(index.phrase("ox").unwrap()),
            vec![b"1".to_vec(), b"3".to_vec()]
        );
        assert!(index.phrase("zebra").unwrap().is_empty());
        assert_eq!(index.phrase(""), None);
    }

    #[test]
    fn test_insert_and_remove_follow_records() {
        let mut index = index_of(IndexKind::Lexical, &[]);
        let record = columns([("col", "v")]);
        index.insert(b"k", &record);
        assert_eq!(index.equal("v"), vec![b"k".to_vec()]);
        index.remove(b"k", &record);
        assert!(index.equal("v").is_empty());
        assert_eq!(index.term_count(), 0);

        let other = columns([("else", "v")]);
        index.insert(b"k", &other);
        assert_eq!(index.term_count(), 0);
    }
}
