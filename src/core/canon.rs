//! Canonical JSON encoding for event and snapshot hashing.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonError {
    #[error("json encode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("non-finite numbers are not allowed in canonical form")]
    NonFiniteNumber,
}

/// Serialize a value to canonical JSON bytes.
///
/// Canonical rules (JCS-equivalent for the subset we emit):
/// - object keys sorted by UTF-8 byte order, recursively
/// - no insignificant whitespace
/// - non-finite numbers rejected
///
/// All hashable structures in this crate carry payloads as `serde_json::Value`,
/// which cannot represent NaN/Infinity; the guard below covers any `Number`
/// that slips through a custom `Serialize` impl.
pub fn to_canon_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonError> {
    let value = serde_json::to_value(value)?;
    let canon = canon_value(value)?;
    Ok(serde_json::to_vec(&canon)?)
}

fn canon_value(value: Value) -> Result<Value, CanonError> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut canon = Map::new();
            for (key, value) in entries {
                canon.insert(key, canon_value(value)?);
            }
            Ok(Value::Object(canon))
        }
        Value::Array(values) => Ok(Value::Array(
            values
                .into_iter()
                .map(canon_value)
                .collect::<Result<_, _>>()?,
        )),
        Value::Number(n) => {
            if n.as_f64().is_some_and(|f| !f.is_finite()) {
                return Err(CanonError::NonFiniteNumber);
            }
            Ok(Value::Number(n))
        }
        other => Ok(other),
    }
}
