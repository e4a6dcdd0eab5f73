//! Lenient (de)serializers for fields the registry renders inconsistently

use serde::{Deserialize, Deserializer, Serializer};
use serde_json::Value;

/// Accept a string, number or bool and keep its textual form.
pub(crate) fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Accept `true`, `"true"` (any case) or a non-zero number as true.
pub(crate) fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_u64().map(|n| n != 0).unwrap_or(false),
        _ => false,
    })
}

/// The registry expects booleans as the strings "true"/"false".
pub(crate) fn bool_as_string<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(if *value { "true" } else { "false" })
}
