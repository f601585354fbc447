//! Index selection for table queries.
//!
//! Every condition that an index can answer yields a candidate key set;
//! the smallest one wins. Candidates are only a superset: the caller
//! still checks every condition against each fetched record.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use tracing::debug;

use crate::hash::BucketMap;
use crate::query::condition::{Condition, Predicate};
use crate::table::{IndexKind, SecondaryIndex};

/// Candidate keys drawn from one index, in store iteration order.
#[derive(Debug, Clone)]
pub(crate) struct Candidates {
    /// Position of the answering condition.
    pub condition: usize,
    /// Human readable source, e.g. `index "age" (decimal)`.
    pub source: String,
    pub keys: Vec<Vec<u8>>,
}

pub(crate) fn choose(
    conditions: &[Condition],
    records: &BucketMap,
    indexes: &BTreeMap<String, SecondaryIndex>,
) -> Option<Candidates> {
    let mut best: Option<Candidates> = None;
    for (at, condition) in conditions.iter().enumerate() {
        if !condition.may_use_index() {
            continue;
        }
        let found = if condition.column.is_empty() {
            primary_keys(&condition.predicate, records).map(|keys| (keys, "primary key".to_string()))
        } else {
            indexes
                .get(&condition.column)
                .filter(|index| index.is_built())
                .and_then(|index| {
                    lookup(&condition.predicate, index).map(|keys| {
                        let source = format!("index {:?} ({})", index.column(), index.kind().as_str());
                        (keys, source)
                    })
                })
        };
        let Some((keys, source)) = found else {
            continue;
        };
        let keys = store_order(keys, records);
        if best.as_ref().is_none_or(|current| keys.len() < current.keys.len()) {
            best = Some(Candidates {
                condition: at,
                source,
                keys,
            });
        }
    }
    if let Some(chosen) = &best {
        debug!(
            source = %chosen.source,
            op = %conditions[chosen.condition].op.op,
            candidates = chosen.keys.len(),
            "query plan chose an index"
        );
    }
    best
}

/// Deduplicate and sort keys into the store's iteration order, dropping
/// keys the store no longer holds.
fn store_order(keys: Vec<Vec<u8>>, records: &BucketMap) -> Vec<Vec<u8>> {
    let positioned: BTreeMap<_, _> = keys
        .into_iter()
        .filter_map(|pk| records.position(&pk).map(|position| (position, pk)))
        .collect();
    positioned.into_values().collect()
}

fn primary_keys(predicate: &Predicate, records: &BucketMap) -> Option<Vec<Vec<u8>>> {
    let wanted: Vec<&String> = match predicate {
        Predicate::StrEq(pk) => vec![pk],
        Predicate::StrOrEq(pks) => pks.iter().collect(),
        _ => return None,
    };
    Some(
        wanted
            .into_iter()
            .filter(|pk| records.contains(pk.as_bytes()))
            .map(|pk| pk.as_bytes().to_vec())
            .collect(),
    )
}

fn union<I>(sets: I) -> Vec<Vec<u8>>
where
    I: IntoIterator<Item = Vec<Vec<u8>>>,
{
    sets.into_iter().flatten().collect::<BTreeSet<_>>().into_iter().collect()
}

fn intersection<I>(sets: I) -> Option<Vec<Vec<u8>>>
where
    I: IntoIterator<Item = Vec<Vec<u8>>>,
{
    let mut result: Option<BTreeSet<Vec<u8>>> = None;
    for set in sets {
        let set: BTreeSet<Vec<u8>> = set.into_iter().collect();
        result = Some(match result {
            Some(current) => current.intersection(&set).cloned().collect(),
            None => set,
        });
    }
    result.map(|set| set.into_iter().collect())
}

/// Phrase lookups combined by `combine`; `None` if any phrase cannot be
/// answered or there are none.
fn phrases<F>(index: &SecondaryIndex, phrases: &[String], combine: F) -> Option<Vec<Vec<u8>>>
where
    F: FnOnce(Vec<Vec<Vec<u8>>>) -> Option<Vec<Vec<u8>>>,
{
    if phrases.is_empty() {
        return None;
    }
    let sets = phrases
        .iter()
        .map(|phrase| index.phrase(phrase))
        .collect::<Option<Vec<_>>>()?;
    combine(sets)
}

/// Keys an index yields for a condition, or `None` when this index kind
/// cannot answer the operator.
fn lookup(predicate: &Predicate, index: &SecondaryIndex) -> Option<Vec<Vec<u8>>> {
    use Bound::{Excluded, Included, Unbounded};

    match (index.kind(), predicate) {
        (IndexKind::Lexical, Predicate::StrEq(value)) => Some(index.equal(value)),
        (IndexKind::Lexical, Predicate::StrBw(prefix)) => Some(index.prefix(prefix)),
        (IndexKind::Lexical, Predicate::StrOrEq(values)) => {
            Some(union(values.iter().map(|value| index.equal(value))))
        }

        (IndexKind::Decimal, Predicate::NumEq(n)) => Some(index.numeric(Included(*n), Included(*n))),
        (IndexKind::Decimal, Predicate::NumGt(n)) => Some(index.numeric(Excluded(*n), Unbounded)),
        (IndexKind::Decimal, Predicate::NumGe(n)) => Some(index.numeric(Included(*n), Unbounded)),
        (IndexKind::Decimal, Predicate::NumLt(n)) => Some(index.numeric(Unbounded, Excluded(*n))),
        (IndexKind::Decimal, Predicate::NumLe(n)) => Some(index.numeric(Unbounded, Included(*n))),
        (IndexKind::Decimal, Predicate::NumBt(low, high)) => {
            Some(index.numeric(Included(*low), Included(*high)))
        }
        (IndexKind::Decimal, Predicate::NumOrEq(numbers)) => Some(union(
            numbers.iter().map(|n| index.numeric(Included(*n), Included(*n))),
        )),

        (IndexKind::Token, Predicate::StrAnd(words)) if !words.is_empty() => {
            intersection(words.iter().map(|word| index.token(word)))
        }
        (IndexKind::Token, Predicate::StrOr(words) | Predicate::StrOrEq(words)) => {
            Some(union(words.iter().map(|word| index.token(word))))
        }

        (IndexKind::QGram, Predicate::FtsPh(phrase)) => index.phrase(phrase),
        (IndexKind::QGram, Predicate::FtsAnd(words)) => phrases(index, words, intersection),
        (IndexKind::QGram, Predicate::FtsOr(words)) => phrases(index, words, |sets| Some(union(sets))),
        (IndexKind::QGram, Predicate::FtsEx(alternatives)) => {
            if alternatives.is_empty() {
                return None;
            }
            let mut sets = Vec::with_capacity(alternatives.len());
            for alternative in alternatives {
                sets.push(phrases(index, &alternative.required, intersection)?);
            }
            Some(union(sets))
        }

        _ => None,
    }
}
