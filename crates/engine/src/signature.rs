//! Deterministic function-call signatures.
//!
//! The circuit breaker compares tool calls by a serialized signature:
//! `"{name}({k1=v1,k2=v2,…})"` with keys in ordinal (byte) order, compact
//! JSON values, nulls included, and a nesting bound. Values that cannot be
//! rendered within the bound degrade to `"{json_type}:{stable_hash}"`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Maximum value-nesting depth a signature will serialize before degrading
/// to a hash placeholder.
const MAX_SIGNATURE_DEPTH: usize = 64;

/// A 64-bit rapidhash value, serialized as a 16-character hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StableHash(u64);

impl StableHash {
    #[inline]
    pub fn of(data: &[u8]) -> Self {
        Self(rapidhash::v3::rapidhash_v3(data))
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, std::num::ParseIntError> {
        u64::from_str_radix(s, 16).map(Self)
    }
}

impl fmt::Debug for StableHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StableHash({:016x})", self.0)
    }
}

impl fmt::Display for StableHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for StableHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for StableHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Builds the deterministic signature for a tool call.
pub fn call_signature(name: &str, arguments: &Map<String, Value>) -> String {
    let mut keys: Vec<&String> = arguments.keys().collect();
    keys.sort_unstable();

    let mut out = String::with_capacity(name.len() + 2 + arguments.len() * 16);
    out.push_str(name);
    out.push('(');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(key);
        out.push('=');
        out.push_str(&render_value(&arguments[key.as_str()]));
    }
    out.push(')');
    out
}

fn render_value(value: &Value) -> String {
    if depth_of(value, 0) > MAX_SIGNATURE_DEPTH {
        return hashed_placeholder(value);
    }
    match serde_json::to_string(value) {
        Ok(json) => json,
        Err(_) => hashed_placeholder(value),
    }
}

fn hashed_placeholder(value: &Value) -> String {
    let rendered = format!("{value:?}");
    format!("{}:{}", json_type_name(value), StableHash::of(rendered.as_bytes()))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn depth_of(value: &Value, current: usize) -> usize {
    if current > MAX_SIGNATURE_DEPTH {
        // Deep enough to degrade; no need to recurse further.
        return current;
    }
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| depth_of(v, current + 1))
            .max()
            .unwrap_or(current + 1),
        Value::Object(map) => map
            .values()
            .map(|v| depth_of(v, current + 1))
            .max()
            .unwrap_or(current + 1),
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    // ── Signature shape ────────────────────────────────────────────────────

    #[test]
    fn empty_arguments_render_as_bare_parens() {
        assert_eq!(call_signature("now", &Map::new()), "now()");
    }

    #[test]
    fn keys_are_sorted_ordinally() {
        let sig = call_signature(
            "get_weather",
            &args(&[("zip", json!("10001")), ("city", json!("X"))]),
        );
        assert_eq!(sig, r#"get_weather(city="X",zip="10001")"#);
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let a = call_signature("t", &args(&[("a", json!(1)), ("b", json!(2))]));
        let b = call_signature("t", &args(&[("b", json!(2)), ("a", json!(1))]));
        assert_eq!(a, b);
    }

    #[test]
    fn nulls_are_included_and_case_preserved() {
        let sig = call_signature("t", &args(&[("Key", json!(null))]));
        assert_eq!(sig, "t(Key=null)");
    }

    #[test]
    fn nested_values_use_compact_json() {
        let sig = call_signature("t", &args(&[("cfg", json!({"a": [1, 2], "b": "x"}))]));
        assert_eq!(sig, r#"t(cfg={"a":[1,2],"b":"x"})"#);
    }

    #[test]
    fn over_deep_values_degrade_to_type_and_hash() {
        let mut deep = json!(0);
        for _ in 0..70 {
            deep = json!([deep]);
        }
        let sig = call_signature("t", &args(&[("v", deep.clone())]));
        assert!(sig.starts_with("t(v=array:"));
        // Degradation is still deterministic.
        assert_eq!(sig, call_signature("t", &args(&[("v", deep)])));
    }

    // ── StableHash ─────────────────────────────────────────────────────────

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(StableHash::of(b"hello"), StableHash::of(b"hello"));
        assert_ne!(StableHash::of(b"hello"), StableHash::of(b"world"));
    }

    #[test]
    fn stable_hash_hex_round_trips() {
        let hash = StableHash::of(b"sig");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 16);
        assert_eq!(StableHash::from_hex(&hex).unwrap(), hash);
    }

    #[test]
    fn stable_hash_serde_round_trips() {
        let hash = StableHash::of(b"sig");
        let json = serde_json::to_string(&hash).unwrap();
        let restored: StableHash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, restored);
    }
}
