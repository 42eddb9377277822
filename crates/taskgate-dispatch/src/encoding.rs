//! URL query and form body encoding.
//!
//! Form bodies use bracket notation for nested values, the shape most web frameworks decode back
//! into nested maps: `{"child": {"any": "thing"}}` becomes `child%5Bany%5D=thing`.

use serde_json::Value;
use taskgate_core::{Error, Result};

/// `name=value` pairs joined with `&`, both sides percent-encoded.
pub fn encode_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                urlencoding::encode(name),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Append an encoded query string to `url`, extending any query the URL already carries.
pub fn append_query(url: &str, query: &str) -> String {
    if query.is_empty() {
        return url.to_string();
    }
    match url.find('?') {
        None => format!("{url}?{query}"),
        Some(_) if url.ends_with('?') || url.ends_with('&') => format!("{url}{query}"),
        Some(_) => format!("{url}&{query}"),
    }
}

/// Encode a JSON object or array as `application/x-www-form-urlencoded`.
///
/// Booleans become `1`/`0` and nulls are omitted.
pub fn encode_form(body: &Value) -> Result<String> {
    let mut pairs = Vec::new();
    match body {
        Value::Object(map) => {
            for (key, value) in map {
                flatten(key.clone(), value, &mut pairs);
            }
        }
        Value::Array(items) => {
            for (idx, value) in items.iter().enumerate() {
                flatten(idx.to_string(), value, &mut pairs);
            }
        }
        _ => {
            return Err(Error::configuration(
                "form body must be a json object or array",
            ));
        }
    }
    Ok(encode_query(&pairs))
}

fn flatten(key: String, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push((key, if *b { "1" } else { "0" }.to_string())),
        Value::Number(n) => out.push((key, n.to_string())),
        Value::String(s) => out.push((key, s.clone())),
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                flatten(format!("{key}[{idx}]"), item, out);
            }
        }
        Value::Object(map) => {
            for (child, item) in map {
                flatten(format!("{key}[{child}]"), item, out);
            }
        }
    }
}
