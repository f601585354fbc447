//! Column maps and their stored form.
//!
//! A record is stored as `name\0value\0` pairs in column-name order.

use std::collections::BTreeMap;

use crate::error::{CaskError, Result};
use crate::text::parse_decimal;

/// Columns of one table record, by name.
pub type Columns = BTreeMap<String, String>;

/// Column updated by `addint` and `adddouble`.
pub const NUMERIC_COLUMN: &str = "_num";

/// Build a column map from name/value pairs.
pub fn columns<I, K, V>(pairs: I) -> Columns
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(name, value)| (name.into(), value.into()))
        .collect()
}

pub(crate) fn check_columns(columns: &Columns) -> Result<()> {
    for (name, value) in columns {
        if name.is_empty() {
            return Err(CaskError::InvalidOperation(
                "empty column name is reserved for the primary key".into(),
            ));
        }
        if name.contains('\0') || value.contains('\0') {
            return Err(CaskError::InvalidOperation(format!(
                "column {name:?} contains a NUL byte"
            )));
        }
    }
    Ok(())
}

pub(crate) fn encode(columns: &Columns) -> Result<Vec<u8>> {
    check_columns(columns)?;
    let mut out = Vec::new();
    for (name, value) in columns {
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    Ok(out)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Columns> {
    let mut columns = Columns::new();
    let Some(body) = bytes.strip_suffix(&[0]) else {
        if bytes.is_empty() {
            return Ok(columns);
        }
        return Err(CaskError::Corrupt("unterminated table record".into()));
    };
    let mut parts = body.split(|b| *b == 0);
    while let Some(name) = parts.next() {
        let value = parts
            .next()
            .ok_or_else(|| CaskError::Corrupt("table record has a column without value".into()))?;
        columns.insert(utf8(name)?, utf8(value)?);
    }
    Ok(columns)
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| CaskError::Corrupt("table record is not valid UTF-8".into()))
}

/// Value of `column`, where `""` is the primary key itself.
pub(crate) fn column_value<'a>(
    pk: &'a [u8],
    columns: &'a Columns,
    column: &str,
) -> Option<std::borrow::Cow<'a, str>> {
    if column.is_empty() {
        return Some(String::from_utf8_lossy(pk));
    }
    columns.get(column).map(|value| value.as_str().into())
}

/// Numeric value of the `_num` column, zero when absent.
pub(crate) fn numeric(columns: Option<&Columns>) -> f64 {
    columns
        .and_then(|columns| columns.get(NUMERIC_COLUMN))
        .map_or(0.0, |value| parse_decimal(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_layout() {
        let record = columns([("name", "alice"), ("age", "31")]);
        assert_eq!(encode(&record).unwrap(), b"age\x0031\x00name\x00alice\x00".to_vec());
        assert_eq!(decode(&encode(&record).unwrap()).unwrap(), record);
    }

    #[test]
    fn test_empty_values_survive() {
        let record = columns([("a", ""), ("b", "x")]);
        assert_eq!(decode(&encode(&record).unwrap()).unwrap(), record);
        assert_eq!(decode(b"").unwrap(), Columns::new());
    }

    #[test]
    fn test_rejects_nul_and_reserved_name() {
        assert_eq!(
            encode(&columns([("a", "x\0y")])).unwrap_err().kind(),
            "invalid_operation"
        );
        assert_eq!(
            encode(&columns([("", "pk")])).unwrap_err().kind(),
            "invalid_operation"
        );
    }

    #[test]
    fn test_decode_rejects_damage() {
        assert_eq!(decode(b"name\x00alice").unwrap_err().kind(), "corrupt");
        assert_eq!(decode(b"name\x00").unwrap_err().kind(), "corrupt");
    }

    #[test]
    fn test_primary_key_column() {
        let record = columns([("a", "1")]);
        assert_eq!(column_value(b"pk1", &record, "").as_deref(), Some("pk1"));
        assert_eq!(column_value(b"pk1", &record, "a").as_deref(), Some("1"));
        assert_eq!(column_value(b"pk1", &record, "b"), None);
    }
}
