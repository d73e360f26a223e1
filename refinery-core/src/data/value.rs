//! Cell-level helpers shared by transformations, statistics, and the exporter.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;
use std::cmp::Ordering;

/// Canonical text form for datetimes produced by conversions.
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const DATETIME_LAYOUTS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];
const DATE_LAYOUTS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// Numeric view of a cell. Only JSON numbers qualify.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Encode a float as a JSON number; non-finite values become null.
pub fn float(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Parse a datetime string in any of the accepted layouts. Offsets are
/// normalized to UTC.
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_utc());
    }
    for layout in DATETIME_LAYOUTS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, layout) {
            return Some(dt);
        }
    }
    DATE_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDate::parse_from_str(text, layout).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Datetime view of a cell: strings in an accepted layout.
pub fn as_datetime(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::String(s) => parse_datetime(s),
        _ => None,
    }
}

/// Render a cell as the label used for categories and derived column names.
pub fn label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Stable key for row equality; JSON text of the selected cells.
pub fn row_key<'a>(cells: impl IntoIterator<Item = &'a Value>) -> String {
    let cells: Vec<&Value> = cells.into_iter().collect();
    serde_json::to_string(&cells).unwrap_or_default()
}

/// Total order over cells: null < bool < number < string < other (by JSON text).
pub fn compare(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(_), Value::Number(_)) => {
            let x = as_f64(a).unwrap_or(f64::NAN);
            let y = as_f64(b).unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a)
            .cmp(&rank(b))
            .then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_datetime_layouts() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        for text in ["2024-03-09", "2024/03/09", "03/09/2024", "2024-03-09 00:00:00"] {
            assert_eq!(parse_datetime(text), Some(expected), "{text}");
        }
        assert_eq!(
            parse_datetime("2024-03-09T10:00:00+02:00")
                .unwrap()
                .format(DATETIME_FORMAT)
                .to_string(),
            "2024-03-09T08:00:00"
        );
        assert!(parse_datetime("not a date").is_none());
    }

    #[test]
    fn test_float_non_finite_is_null() {
        assert_eq!(float(f64::NAN), Value::Null);
        assert_eq!(float(1.5), json!(1.5));
    }

    #[test]
    fn test_compare_orders_numbers_numerically() {
        assert_eq!(compare(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(compare(&Value::Null, &json!(0)), Ordering::Less);
        assert_eq!(compare(&json!("b"), &json!("a")), Ordering::Greater);
    }

    #[test]
    fn test_label() {
        assert_eq!(label(&json!("red")), "red");
        assert_eq!(label(&json!(3)), "3");
        assert_eq!(label(&json!(true)), "true");
    }
}
