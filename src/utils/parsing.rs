use serde_json::Value;

/// Converts a JSON Value to f64, handling both Number and String types.
pub fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

/// Converts a JSON Value to u64, handling both Number and String types.
pub fn value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    }
}

#[inline]
pub fn field_f64(obj: &Value, key: &str) -> Option<f64> {
    obj.get(key).and_then(value_to_f64)
}

#[inline]
pub fn field_u64(obj: &Value, key: &str) -> Option<u64> {
    obj.get(key).and_then(value_to_u64)
}

#[inline]
pub fn field_str<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}
