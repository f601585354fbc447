//! Queries over a table store.
//!
//! A query collects conditions, an optional order and a limit, then runs
//! against the table it was created from. It holds only a weak handle to
//! the table and fails with `NotOpen` once that table is closed.

mod condition;
mod planner;

pub use condition::{CondOp, QueryOp};

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::error::{CaskError, Result};
use crate::table::{Columns, TableShared, TableState, column_value, decode};
use crate::text::parse_decimal;
use condition::Condition;
use planner::Candidates;

/// Result order of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    StrAsc,
    StrDesc,
    NumAsc,
    NumDesc,
}

impl OrderType {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::StrAsc),
            1 => Some(Self::StrDesc),
            2 => Some(Self::NumAsc),
            3 => Some(Self::NumDesc),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StrAsc => "STRASC",
            Self::StrDesc => "STRDESC",
            Self::NumAsc => "NUMASC",
            Self::NumDesc => "NUMDESC",
        }
    }

    /// Stable sort by `column`. A missing column sorts as the empty
    /// string, or zero.
    fn sort(self, rows: &mut [Row], column: &str) {
        match self {
            Self::StrAsc => rows.sort_by(|a, b| sort_text(a, column).cmp(&sort_text(b, column))),
            Self::StrDesc => rows.sort_by(|a, b| sort_text(b, column).cmp(&sort_text(a, column))),
            Self::NumAsc => rows.sort_by(|a, b| sort_number(a, column).total_cmp(&sort_number(b, column))),
            Self::NumDesc => rows.sort_by(|a, b| sort_number(b, column).total_cmp(&sort_number(a, column))),
        }
    }
}

/// How `metasearch` combines the key sets of several queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    /// Keys of any query, in first-seen order.
    Union,
    /// Keys of every query.
    Intersect,
    /// Keys of the first query that no other query matches.
    Difference,
}

impl SetOp {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Union),
            1 => Some(Self::Intersect),
            2 => Some(Self::Difference),
            _ => None,
        }
    }
}

type Row = (Vec<u8>, Columns);

fn sort_text<'a>(row: &'a Row, column: &str) -> Cow<'a, str> {
    column_value(&row.0, &row.1, column).unwrap_or_default()
}

fn sort_number(row: &Row, column: &str) -> f64 {
    parse_decimal(&sort_text(row, column))
}

pub struct Query {
    table: Weak<TableShared>,
    generation: u64,
    conditions: Vec<Condition>,
    order: Option<(String, OrderType)>,
    max: Option<usize>,
    skip: usize,
}

impl Query {
    pub(crate) fn new(table: Weak<TableShared>, generation: u64) -> Self {
        Self {
            table,
            generation,
            conditions: Vec::new(),
            order: None,
            max: None,
            skip: 0,
        }
    }

    pub(crate) fn is_bound_to(&self, shared: &Arc<TableShared>) -> bool {
        std::ptr::eq(self.table.as_ptr(), Arc::as_ptr(shared))
    }

    /// Add a condition on `column`; `""` is the primary key. Conditions are
    /// ANDed.
    pub fn add_cond(&mut self, column: &str, op: impl Into<CondOp>, operand: &str) -> Result<()> {
        self.conditions.push(Condition::new(column, op.into(), operand)?);
        Ok(())
    }

    pub fn set_order(&mut self, column: &str, order: OrderType) {
        self.order = Some((column.to_string(), order));
    }

    /// Return at most `max` results after skipping `skip`.
    pub fn set_limit(&mut self, max: Option<usize>, skip: usize) {
        self.max = max;
        self.skip = skip;
    }

    fn table(&self) -> Result<Arc<TableShared>> {
        self.table.upgrade().ok_or(CaskError::NotOpen)
    }

    /// Build deferred indexes before the first lookup.
    fn prepare(&self, shared: &TableShared) -> Result<()> {
        let pending = {
            let state = shared.state.read();
            state.records_at(self.generation)?;
            state.has_pending_indexes()
        };
        if pending {
            shared.state.write().build_pending_indexes()?;
        }
        Ok(())
    }

    /// Matching records in store order, with the index plan used.
    fn matching(&self, state: &TableState) -> Result<(Vec<Row>, Option<Candidates>)> {
        let records = state.records_at(self.generation)?;
        let plan = planner::choose(&self.conditions, records, state.indexes());

        let mut rows = Vec::new();
        let mut visit = |pk: &[u8], bytes: &[u8]| -> Result<()> {
            let columns = decode(bytes)?;
            if self.conditions.iter().all(|c| c.matches(pk, &columns)) {
                rows.push((pk.to_vec(), columns));
            }
            Ok(())
        };
        match &plan {
            Some(candidates) => {
                for pk in &candidates.keys {
                    if let Some(bytes) = records.get(pk) {
                        visit(pk.as_slice(), bytes.as_slice())?;
                    }
                }
            }
            None => {
                for (pk, bytes) in records.iter() {
                    visit(pk, bytes)?;
                }
            }
        }
        Ok((rows, plan))
    }

    /// Apply order, skip and limit.
    fn arrange(&self, mut rows: Vec<Row>) -> Vec<Vec<u8>> {
        if let Some((column, order)) = &self.order {
            order.sort(&mut rows, column);
        }
        rows.into_iter()
            .skip(self.skip)
            .take(self.max.unwrap_or(usize::MAX))
            .map(|(pk, _)| pk)
            .collect()
    }

    /// Primary keys of the matching records.
    pub fn search(&self) -> Result<Vec<Vec<u8>>> {
        let shared = self.table()?;
        self.prepare(&shared)?;
        let state = shared.state.read();
        let (rows, _) = self.matching(&state)?;
        Ok(self.arrange(rows))
    }

    /// Remove every record `search` would return. Each removal stands on
    /// its own; an error stops the scan with earlier removals kept.
    pub fn search_out(&self) -> Result<usize> {
        let shared = self.table()?;
        self.prepare(&shared)?;
        let mut state = shared.state.write();
        let (rows, _) = self.matching(&state)?;
        let keys = self.arrange(rows);
        for pk in &keys {
            state.write_record(pk, None)?;
        }
        debug!(removed = keys.len(), "query removed records");
        Ok(keys.len())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.search()?.len())
    }

    /// Describe how the query would run.
    pub fn plan(&self) -> Result<String> {
        let shared = self.table()?;
        self.prepare(&shared)?;
        let state = shared.state.read();
        let records = state.records_at(self.generation)?;

        let mut lines = Vec::new();
        match planner::choose(&self.conditions, records, state.indexes()) {
            Some(chosen) => lines.push(format!(
                "{} answers condition {} ({}): {} candidates",
                chosen.source,
                chosen.condition,
                self.conditions[chosen.condition].op.op,
                chosen.keys.len()
            )),
            None => lines.push(format!("full scan of {} records", records.len())),
        }
        for (at, condition) in self.conditions.iter().enumerate() {
            let mut line = format!("condition {at}: {:?} {}", condition.column, condition.op.op);
            if condition.op.negated {
                line.push_str(" negated");
            }
            if condition.op.index_disabled {
                line.push_str(" no-index");
            }
            lines.push(line);
        }
        if let Some((column, order)) = &self.order {
            lines.push(format!("order by {column:?} {}", order.as_str()));
        }
        if self.max.is_some() || self.skip > 0 {
            let max = self.max.map_or_else(|| "all".to_string(), |max| max.to_string());
            lines.push(format!("limit {max} skip {}", self.skip));
        }
        Ok(lines.join("\n"))
    }
}

/// Combine the matching keys of `queries`, then order and limit them as
/// the first query says.
pub(crate) fn metasearch(
    shared: &Arc<TableShared>,
    queries: &[&Query],
    op: SetOp,
) -> Result<Vec<Vec<u8>>> {
    let Some(first) = queries.first() else {
        return Ok(Vec::new());
    };
    for query in queries {
        query.prepare(shared)?;
    }
    let state = shared.state.read();
    let mut sets = Vec::with_capacity(queries.len());
    for query in queries {
        sets.push(query.matching(&state)?.0);
    }

    let mut sets = sets.into_iter();
    let mut combined = sets.next().unwrap_or_default();
    match op {
        SetOp::Union => {
            let mut seen: HashSet<Vec<u8>> = combined.iter().map(|(pk, _)| pk.clone()).collect();
            for rows in sets {
                for row in rows {
                    if seen.insert(row.0.clone()) {
                        combined.push(row);
                    }
                }
            }
        }
        SetOp::Intersect => {
            for rows in sets {
                let keep: HashSet<Vec<u8>> = rows.into_iter().map(|(pk, _)| pk).collect();
                combined.retain(|(pk, _)| keep.contains(pk));
            }
        }
        SetOp::Difference => {
            for rows in sets {
                let drop: HashSet<Vec<u8>> = rows.into_iter().map(|(pk, _)| pk).collect();
                combined.retain(|(pk, _)| !drop.contains(pk));
            }
        }
    }
    debug!(queries = queries.len(), ?op, results = combined.len(), "metasearch");
    Ok(first.arrange(combined))
}
