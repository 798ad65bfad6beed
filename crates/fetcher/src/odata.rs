//! Response unwrapping shared by the REST helpers.
//!
//! The platform answers in several JSON flavours depending on the requested metadata level; these
//! helpers only peel the envelopes, they never build queries.

use serde_json::Value;

use crate::{Error, Result};

/// Strip a verbose `{"d": ...}` envelope.
pub(crate) fn entity(value: Value) -> Value {
	match value {
		Value::Object(mut map) if map.len() == 1 && map.contains_key("d") => map.remove("d").unwrap_or(Value::Null),
		other => other,
	}
}

/// Items of a collection response: `{"d": {"results": [...]}}`, `{"value": [...]}` or a bare array.
pub(crate) fn collection(value: Value) -> Result<Vec<Value>> {
	match entity(value) {
		Value::Array(items) => Ok(items),
		Value::Object(mut map) => match map.remove("results").or_else(|| map.remove("value")) {
			Some(Value::Array(items)) => Ok(items),
			_ => Err(Error::Protocol("expected a collection response".into())),
		},
		_ => Err(Error::Protocol("expected a collection response".into())),
	}
}

/// Returns true for responses carrying no entity (`null`, `{}`, `{"d": null}`, empty collections).
pub(crate) fn is_empty(value: &Value) -> bool {
	match value {
		Value::Null => true,
		Value::Object(map) => {
			map.is_empty()
				|| (map.len() == 1 && map.get("d").is_some_and(is_empty))
				|| map.get("value").is_some_and(|v| v.as_array().is_some_and(Vec::is_empty))
				|| map.get("results").is_some_and(|v| v.as_array().is_some_and(Vec::is_empty))
		}
		Value::Array(items) => items.is_empty(),
		_ => false,
	}
}

/// Canonical form of a GUID as the platform prints it: braces, `/Guid(...)/` and case dropped.
pub(crate) fn normalize_guid(raw: &str) -> String {
	let trimmed = raw.trim();
	let inner = trimmed
		.strip_prefix("/Guid(")
		.and_then(|s| s.strip_suffix(")/"))
		.unwrap_or(trimmed);
	inner.trim_start_matches('{').trim_end_matches('}').to_ascii_lowercase()
}

/// Quote a string literal for a REST path segment (`'` doubled).
pub(crate) fn quote(raw: &str) -> String {
	format!("'{}'", raw.replace('\'', "''"))
}
