//! Key orderings of the ordered store.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::text::parse_decimal;

/// Total order over byte-string keys.
///
/// Implementations must stay consistent while a store is open. They run
/// under the store's lock and must not call back into the same store.
pub trait Comparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    fn name(&self) -> &str {
        "custom"
    }

    /// The builtin this comparator is, recorded in the file header.
    fn builtin(&self) -> Option<BuiltinComparator> {
        None
    }
}

/// Comparators recorded by id in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BuiltinComparator {
    /// Byte-wise.
    Lexical = 1,
    /// Leading decimal number, then byte-wise.
    Decimal = 2,
    /// 4-byte little-endian signed integers.
    Int32 = 3,
    /// 8-byte little-endian signed integers.
    Int64 = 4,
}

impl BuiltinComparator {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::Lexical),
            2 => Some(Self::Decimal),
            3 => Some(Self::Int32),
            4 => Some(Self::Int64),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lexical => "lexical",
            Self::Decimal => "decimal",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
        }
    }

    pub fn shared(self) -> Arc<dyn Comparator> {
        Arc::new(self)
    }
}

impl Comparator for BuiltinComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Self::Lexical => a.cmp(b),
            Self::Decimal => {
                let left = parse_decimal(&String::from_utf8_lossy(a));
                let right = parse_decimal(&String::from_utf8_lossy(b));
                left.total_cmp(&right).then_with(|| a.cmp(b))
            }
            Self::Int32 => int32(a).cmp(&int32(b)).then_with(|| a.cmp(b)),
            Self::Int64 => int64(a).cmp(&int64(b)).then_with(|| a.cmp(b)),
        }
    }

    fn name(&self) -> &str {
        self.as_str()
    }

    fn builtin(&self) -> Option<BuiltinComparator> {
        Some(*self)
    }
}

// Keys of the wrong width order as zero, then byte-wise.
fn int32(key: &[u8]) -> i32 {
    key.try_into().map(i32::from_le_bytes).unwrap_or(0)
}

fn int64(key: &[u8]) -> i64 {
    key.try_into().map(i64::from_le_bytes).unwrap_or(0)
}

/// Caller-supplied ordering that receives an opaque context on every call.
pub struct ContextComparator<C, F> {
    context: C,
    compare: F,
}

impl<C, F> ContextComparator<C, F>
where
    C: Send + Sync,
    F: Fn(&[u8], &[u8], &C) -> Ordering + Send + Sync,
{
    pub fn new(context: C, compare: F) -> Self {
        Self { context, compare }
    }

    pub fn context(&self) -> &C {
        &self.context
    }
}

impl<C, F> Comparator for ContextComparator<C, F>
where
    C: Send + Sync,
    F: Fn(&[u8], &[u8], &C) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.compare)(a, b, &self.context)
    }
}

impl<C, F> fmt::Debug for ContextComparator<C, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContextComparator")
    }
}
