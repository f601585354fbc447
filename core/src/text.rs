//! Text helpers shared by indexes and query conditions.

/// Split on whitespace and commas, dropping empty pieces.
pub fn tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
}

/// Lowercase, collapse whitespace runs to one space, trim.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.extend(word.chars().flat_map(char::to_lowercase));
    }
    out
}

/// Gram length of the q-gram index.
pub const QGRAM_LEN: usize = 3;

/// Distinct character q-grams of already normalized text. Text shorter
/// than a gram yields itself as the only gram.
pub fn qgrams(normalized: &str) -> Vec<String> {
    let chars: Vec<char> = normalized.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() < QGRAM_LEN {
        return vec![normalized.to_string()];
    }
    let mut grams: Vec<String> = chars
        .windows(QGRAM_LEN)
        .map(|window| window.iter().collect())
        .collect();
    grams.sort();
    grams.dedup();
    grams
}

/// Parse the leading decimal number of `text`, `0.0` when there is none.
///
/// Accepts surrounding whitespace, a sign, a fraction and an exponent,
/// and ignores whatever follows the numeric prefix.
pub fn parse_decimal(text: &str) -> f64 {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;
    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        if digits > 0 {
            end = frac_end;
        }
    }
    if digits == 0 {
        return 0.0;
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    text[..end].parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tokens() {
        let found: Vec<&str> = tokens(" red,green  blue,,").collect();
        assert_eq!(found, vec!["red", "green", "blue"]);
        assert_eq!(tokens("").count(), 0);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Hello \t  WORLD\n"), "hello world");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_qgrams() {
        assert_eq!(qgrams("abcab"), vec!["abc", "bca", "cab"]);
        assert_eq!(qgrams("ab"), vec!["ab"]);
        assert!(qgrams("").is_empty());
        assert_eq!(qgrams("ééé"), vec!["ééé"]);
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal("42"), 42.0);
        assert_eq!(parse_decimal("  -3.5kg"), -3.5);
        assert_eq!(parse_decimal("1e3x"), 1000.0);
        assert_eq!(parse_decimal("7e"), 7.0);
        assert_eq!(parse_decimal(".5"), 0.5);
        assert_eq!(parse_decimal("abc"), 0.0);
        assert_eq!(parse_decimal("-"), 0.0);
        assert_eq!(parse_decimal("12."), 12.0);
    }
}
