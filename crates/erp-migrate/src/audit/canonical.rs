//! Canonical JSON encoding.
//!
//! Object keys are sorted by byte order at every level, no whitespace is
//! emitted, and floats with no fractional part are written as integers
//! (`72.0` becomes `72`). Other numbers use serde_json's shortest
//! round-trip form. The output does not depend on map iteration order.

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// Largest float written in integer form without losing precision.
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

/// Encode `value` canonically.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&mut out, &value)?;
    Ok(out)
}

pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(to_canonical_string(value)?.into_bytes())
}

fn write_value(out: &mut String, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                out.push_str(&n.to_string());
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() <= MAX_EXACT_FLOAT {
                    out.push_str(&format!("{}", f as i64));
                } else {
                    out.push_str(&n.to_string());
                }
            }
        }
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(out, &map[key])?;
            }
            out.push('}');
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_recursively() {
        let value = json!({ "b": 1, "a": { "z": [ { "y": 1, "x": 2 } ], "c": null } });
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            r#"{"a":{"c":null,"z":[{"x":2,"y":1}]},"b":1}"#
        );
    }

    #[test]
    fn test_number_formatting() {
        let value = json!({ "score": 72.0, "rate": 0.25, "neg": -3.0, "n": 7 });
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            r#"{"n":7,"neg":-3,"rate":0.25,"score":72}"#
        );
    }

    #[test]
    fn test_strings_are_escaped() {
        let value = json!({ "name": "Jon \"J\" Smith\n" });
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            r#"{"name":"Jon \"J\" Smith\n"}"#
        );
    }
}
