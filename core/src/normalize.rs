//! Field-level format normalization: null tokens, timestamps, numbers.

use crate::types::Timestamp;
use chrono::{NaiveDate, NaiveDateTime};

const NULL_TOKENS: &[&str] = &["na", "n/a", "nan", "null", "none", "nat"];

pub fn is_null_token(value: &str) -> bool {
    let v = value.trim();
    NULL_TOKENS.iter().any(|t| v.eq_ignore_ascii_case(t))
}

/// Parse against the accepted formats in order; the first success wins.
/// Date-only formats resolve to midnight.
pub fn parse_timestamp(value: &str, formats: &[String]) -> Option<Timestamp> {
    let v = value.trim();
    formats.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(v, fmt)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(v, fmt)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            })
    })
}

/// Coerce a numeric string that may carry thousands separators,
/// embedded spaces or a trailing unit ("1,250", "12.5 mm", "40km/h").
///
/// Returns None when no finite number can be recovered.
pub fn coerce_numeric(value: &str) -> Option<f64> {
    let compact: String = value
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | ' ' | '\u{a0}'))
        .collect();
    if compact.is_empty() {
        return None;
    }
    if let Ok(v) = compact.parse::<f64>() {
        return v.is_finite().then_some(v);
    }

    // Longest numeric-looking prefix that parses.
    let prefix_len = compact
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    (1..=prefix_len)
        .rev()
        .filter_map(|end| compact[..end].parse::<f64>().ok())
        .find(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formats() -> Vec<String> {
        vec![
            "%Y-%m-%d %H:%M:%S".into(),
            "%Y-%m-%d %H:%M".into(),
            "%d/%m/%Y %H:%M".into(),
            "%Y-%m-%d".into(),
        ]
    }

    #[test]
    fn null_tokens_are_case_insensitive() {
        assert!(is_null_token("NaN"));
        assert!(is_null_token(" n/a "));
        assert!(!is_null_token("London"));
    }

    #[test]
    fn timestamps_try_formats_in_order() {
        let f = formats();
        let a = parse_timestamp("2024-01-01 08:00:00", &f).unwrap();
        let b = parse_timestamp("2024-01-01 08:00", &f).unwrap();
        let c = parse_timestamp("01/01/2024 08:00", &f).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        let midnight = parse_timestamp("2024-01-01", &f).unwrap();
        assert_eq!(midnight.format("%H:%M:%S").to_string(), "00:00:00");
    }

    #[test]
    fn impossible_dates_are_rejected() {
        let f = formats();
        assert!(parse_timestamp("2099-13-40 25:61", &f).is_none());
        assert!(parse_timestamp("2099-00-00 99:99", &f).is_none());
        assert!(parse_timestamp("yesterday", &f).is_none());
    }

    #[test]
    fn numbers_with_separators_and_units() {
        assert_eq!(coerce_numeric("1,250"), Some(1250.0));
        assert_eq!(coerce_numeric("12.5 mm"), Some(12.5));
        assert_eq!(coerce_numeric("40km/h"), Some(40.0));
        assert_eq!(coerce_numeric("-999"), Some(-999.0));
        assert_eq!(coerce_numeric("3em"), Some(3.0));
    }

    #[test]
    fn uncoercible_numbers_are_missing() {
        assert_eq!(coerce_numeric("heavy"), None);
        assert_eq!(coerce_numeric(""), None);
        assert_eq!(coerce_numeric("inf"), None);
        assert_eq!(coerce_numeric("-"), None);
    }
}
