//! Query operators and compiled conditions.

use std::collections::HashSet;
use std::fmt;

use regex::{Regex, RegexBuilder};

use crate::error::{CaskError, Result};
use crate::table::{Columns, column_value};
use crate::text::{normalize, parse_decimal, tokens};

/// Condition operators. Numeric codes match the classic table API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryOp {
    /// Value equals the operand.
    StrEq,
    /// Value contains the operand.
    StrInc,
    /// Value begins with the operand.
    StrBw,
    /// Value ends with the operand.
    StrEw,
    /// Value words include every operand word.
    StrAnd,
    /// Value words include at least one operand word.
    StrOr,
    /// Value equals one of the operand words.
    StrOrEq,
    /// Value matches the regular expression. A leading `*` ignores case.
    StrRx,
    NumEq,
    NumGt,
    NumGe,
    NumLt,
    NumLe,
    /// Value lies between the two operand numbers, inclusive.
    NumBt,
    /// Value equals one of the operand numbers.
    NumOrEq,
    /// Normalized value contains the normalized phrase.
    FtsPh,
    /// Normalized value contains every operand word.
    FtsAnd,
    /// Normalized value contains at least one operand word.
    FtsOr,
    /// Compound full-text expression.
    FtsEx,
}

const OPS: [QueryOp; 19] = [
    QueryOp::StrEq,
    QueryOp::StrInc,
    QueryOp::StrBw,
    QueryOp::StrEw,
    QueryOp::StrAnd,
    QueryOp::StrOr,
    QueryOp::StrOrEq,
    QueryOp::StrRx,
    QueryOp::NumEq,
    QueryOp::NumGt,
    QueryOp::NumGe,
    QueryOp::NumLt,
    QueryOp::NumLe,
    QueryOp::NumBt,
    QueryOp::NumOrEq,
    QueryOp::FtsPh,
    QueryOp::FtsAnd,
    QueryOp::FtsOr,
    QueryOp::FtsEx,
];

impl QueryOp {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        OPS.get(code as usize).copied()
    }

    /// Look up an operator by its name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        OPS.into_iter().find(|op| op.as_str().eq_ignore_ascii_case(name))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StrEq => "STREQ",
            Self::StrInc => "STRINC",
            Self::StrBw => "STRBW",
            Self::StrEw => "STREW",
            Self::StrAnd => "STRAND",
            Self::StrOr => "STROR",
            Self::StrOrEq => "STROREQ",
            Self::StrRx => "STRRX",
            Self::NumEq => "NUMEQ",
            Self::NumGt => "NUMGT",
            Self::NumGe => "NUMGE",
            Self::NumLt => "NUMLT",
            Self::NumLe => "NUMLE",
            Self::NumBt => "NUMBT",
            Self::NumOrEq => "NUMOREQ",
            Self::FtsPh => "FTSPH",
            Self::FtsAnd => "FTSAND",
            Self::FtsOr => "FTSOR",
            Self::FtsEx => "FTSEX",
        }
    }

    pub fn negate(self) -> CondOp {
        CondOp::from(self).negate()
    }

    pub fn no_index(self) -> CondOp {
        CondOp::from(self).no_index()
    }
}

impl fmt::Display for QueryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator plus modifiers, as passed to `Query::add_cond`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondOp {
    pub op: QueryOp,
    /// Invert the match.
    pub negated: bool,
    /// Never answer the condition from an index.
    pub index_disabled: bool,
}

impl CondOp {
    /// Code flag inverting the match.
    pub const NEGATE: u32 = 1 << 24;
    /// Code flag forbidding index use.
    pub const NO_INDEX: u32 = 1 << 25;

    pub fn negate(mut self) -> Self {
        self.negated = true;
        self
    }

    pub fn no_index(mut self) -> Self {
        self.index_disabled = true;
        self
    }

    /// Decode an operator code with its flag bits.
    pub fn from_code(code: u32) -> Result<Self> {
        let base = code & !(Self::NEGATE | Self::NO_INDEX);
        let op = QueryOp::from_code(base)
            .ok_or_else(|| CaskError::Query(format!("unknown operator code {code}")))?;
        Ok(Self {
            op,
            negated: code & Self::NEGATE != 0,
            index_disabled: code & Self::NO_INDEX != 0,
        })
    }

    pub fn code(self) -> u32 {
        let mut code = self.op.code();
        if self.negated {
            code |= Self::NEGATE;
        }
        if self.index_disabled {
            code |= Self::NO_INDEX;
        }
        code
    }
}

impl From<QueryOp> for CondOp {
    fn from(op: QueryOp) -> Self {
        Self {
            op,
            negated: false,
            index_disabled: false,
        }
    }
}

/// Operand compiled for its operator.
#[derive(Debug, Clone)]
pub(crate) enum Predicate {
    StrEq(String),
    StrInc(String),
    StrBw(String),
    StrEw(String),
    StrAnd(Vec<String>),
    StrOr(Vec<String>),
    StrOrEq(Vec<String>),
    StrRx(Regex),
    NumEq(f64),
    NumGt(f64),
    NumGe(f64),
    NumLt(f64),
    NumLe(f64),
    NumBt(f64, f64),
    NumOrEq(Vec<f64>),
    /// Normalized phrase.
    FtsPh(String),
    /// Normalized words.
    FtsAnd(Vec<String>),
    FtsOr(Vec<String>),
    FtsEx(Vec<FtsAlternative>),
}

/// One `||` branch of a compound full-text expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct FtsAlternative {
    /// Normalized phrases that must all be present.
    pub required: Vec<String>,
    /// Normalized phrases that must all be absent.
    pub excluded: Vec<String>,
}

impl FtsAlternative {
    fn is_empty(&self) -> bool {
        self.required.is_empty() && self.excluded.is_empty()
    }

    fn matches(&self, text: &str) -> bool {
        self.required.iter().all(|phrase| text.contains(phrase.as_str()))
            && !self.excluded.iter().any(|phrase| text.contains(phrase.as_str()))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Condition {
    pub column: String,
    pub op: CondOp,
    pub predicate: Predicate,
}

impl Condition {
    pub fn new(column: &str, op: CondOp, operand: &str) -> Result<Self> {
        Ok(Self {
            column: column.to_string(),
            op,
            predicate: compile(op.op, operand)?,
        })
    }

    /// Whether the record satisfies the condition. A missing column never
    /// matches before negation.
    pub fn matches(&self, pk: &[u8], columns: &Columns) -> bool {
        let hit = column_value(pk, columns, &self.column)
            .is_some_and(|value| self.predicate.test(&value));
        hit != self.op.negated
    }

    pub fn may_use_index(&self) -> bool {
        !self.op.negated && !self.op.index_disabled
    }
}

fn words(operand: &str) -> Vec<String> {
    tokens(operand).map(str::to_string).collect()
}

fn numbers(operand: &str) -> Vec<f64> {
    tokens(operand).map(parse_decimal).collect()
}

fn compile(op: QueryOp, operand: &str) -> Result<Predicate> {
    Ok(match op {
        QueryOp::StrEq => Predicate::StrEq(operand.to_string()),
        QueryOp::StrInc => Predicate::StrInc(operand.to_string()),
        QueryOp::StrBw => Predicate::StrBw(operand.to_string()),
        QueryOp::StrEw => Predicate::StrEw(operand.to_string()),
        QueryOp::StrAnd => Predicate::StrAnd(words(operand)),
        QueryOp::StrOr => Predicate::StrOr(words(operand)),
        QueryOp::StrOrEq => Predicate::StrOrEq(words(operand)),
        QueryOp::StrRx => {
            let (pattern, ignore_case) = match operand.strip_prefix('*') {
                Some(rest) => (rest, true),
                None => (operand, false),
            };
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(ignore_case)
                .build()
                .map_err(|err| {
                    CaskError::Query(format!("invalid regular expression {operand:?}: {err}"))
                })?;
            Predicate::StrRx(regex)
        }
        QueryOp::NumEq => Predicate::NumEq(parse_decimal(operand)),
        QueryOp::NumGt => Predicate::NumGt(parse_decimal(operand)),
        QueryOp::NumGe => Predicate::NumGe(parse_decimal(operand)),
        QueryOp::NumLt => Predicate::NumLt(parse_decimal(operand)),
        QueryOp::NumLe => Predicate::NumLe(parse_decimal(operand)),
        QueryOp::NumBt => match numbers(operand).as_slice() {
            [a, b, ..] => Predicate::NumBt(a.min(*b), a.max(*b)),
            _ => {
                return Err(CaskError::Query(format!(
                    "NUMBT needs two numbers, got {operand:?}"
                )));
            }
        },
        QueryOp::NumOrEq => Predicate::NumOrEq(numbers(operand)),
        QueryOp::FtsPh => Predicate::FtsPh(normalize(operand)),
        QueryOp::FtsAnd => Predicate::FtsAnd(tokens(operand).map(normalize).collect()),
        QueryOp::FtsOr => Predicate::FtsOr(tokens(operand).map(normalize).collect()),
        QueryOp::FtsEx => Predicate::FtsEx(parse_expression(operand)),
    })
}

impl Predicate {
    fn test(&self, value: &str) -> bool {
        match self {
            Self::StrEq(operand) => value == operand,
            Self::StrInc(operand) => value.contains(operand.as_str()),
            Self::StrBw(operand) => value.starts_with(operand.as_str()),
            Self::StrEw(operand) => value.ends_with(operand.as_str()),
            Self::StrAnd(words) => {
                let have: HashSet<&str> = tokens(value).collect();
                words.iter().all(|word| have.contains(word.as_str()))
            }
            Self::StrOr(words) => {
                let have: HashSet<&str> = tokens(value).collect();
                words.iter().any(|word| have.contains(word.as_str()))
            }
            Self::StrOrEq(words) => words.iter().any(|word| word == value),
            Self::StrRx(regex) => regex.is_match(value),
            Self::NumEq(n) => parse_decimal(value) == *n,
            Self::NumGt(n) => parse_decimal(value) > *n,
            Self::NumGe(n) => parse_decimal(value) >= *n,
            Self::NumLt(n) => parse_decimal(value) < *n,
            Self::NumLe(n) => parse_decimal(value) <= *n,
            Self::NumBt(low, high) => (*low..=*high).contains(&parse_decimal(value)),
            Self::NumOrEq(numbers) => {
                let number = parse_decimal(value);
                numbers.iter().any(|n| *n == number)
            }
            Self::FtsPh(phrase) => normalize(value).contains(phrase.as_str()),
            Self::FtsAnd(phrases) => {
                let text = normalize(value);
                phrases.iter().all(|phrase| text.contains(phrase.as_str()))
            }
            Self::FtsOr(phrases) => {
                let text = normalize(value);
                phrases.iter().any(|phrase| text.contains(phrase.as_str()))
            }
            Self::FtsEx(alternatives) => {
                let text = normalize(value);
                alternatives.iter().any(|alt| alt.matches(&text))
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum FtsToken {
    Term(String),
    Or,
    Not,
}

fn lex_expression(expr: &str) -> Vec<FtsToken> {
    let chars: Vec<char> = expr.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let rest = &chars[i..];
        if rest[0].is_whitespace() {
            i += 1;
        } else if rest[0] == '"' {
            let len = rest[1..].iter().position(|c| *c == '"').unwrap_or(rest.len() - 1);
            out.push(FtsToken::Term(rest[1..1 + len].iter().collect()));
            i += len + 2;
        } else if rest.starts_with(&['|', '|']) {
            out.push(FtsToken::Or);
            i += 2;
        } else if rest.starts_with(&['!', '!']) {
            out.push(FtsToken::Not);
            i += 2;
        } else if rest.starts_with(&['&', '&']) {
            i += 2;
        } else {
            let len = rest
                .iter()
                .position(|c| c.is_whitespace() || *c == '"')
                .unwrap_or(rest.len());
            out.push(FtsToken::Term(rest[..len].iter().collect()));
            i += len;
        }
    }
    out
}

/// Parse `a "b c" !!d || e` into alternatives. Terms within an
/// alternative are ANDed; `!!` excludes the next term.
pub(crate) fn parse_expression(expr: &str) -> Vec<FtsAlternative> {
    let mut alternatives = Vec::new();
    let mut current = FtsAlternative::default();
    let mut exclude_next = false;
    for token in lex_expression(expr) {
        match token {
            FtsToken::Term(term) => {
                let phrase = normalize(&term);
                if !phrase.is_empty() {
                    if exclude_next {
                        current.excluded.push(phrase);
                    } else {
                        current.required.push(phrase);
                    }
                }
                exclude_next = false;
            }
            FtsToken::Not => exclude_next = true,
            FtsToken::Or => {
                if !current.is_empty() {
                    alternatives.push(std::mem::take(&mut current));
                }
                exclude_next = false;
            }
        }
    }
    if !current.is_empty() {
        alternatives.push(current);
    }
    alternatives
}
