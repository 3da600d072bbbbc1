//! Payload codec for sync push bodies.
//!
//! Chat events arrive as base64 text wrapping a MessagePack record. Decoding is
//! best-effort: anything that does not survive the full pipeline comes back as
//! [`Decoded::Text`] instead of an error, so unknown frame shapes never stall
//! the session.

pub mod message;

pub use message::{classify_direction, DecryptedMessage, MessageDirection};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Number, Value};

/// Result of running a payload through the codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Fully decoded MessagePack record, canonicalized to a JSON tree.
    Tree(Value),
    /// Fallback: the base64-decoded bytes (or the raw input) as lossy UTF-8.
    Text(String),
}

impl Decoded {
    /// Structured view of the payload. Text fallbacks that happen to be JSON
    /// documents are parsed; anything else yields `None`.
    pub fn into_tree(self) -> Option<Value> {
        match self {
            Self::Tree(tree) => Some(tree),
            Self::Text(text) => serde_json::from_str::<Value>(text.trim()).ok(),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, Self::Tree(_))
    }
}

/// Strip everything outside the standard base64 alphabet.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .collect()
}

/// Base64-decode normalized input. On failure the input is re-padded to a
/// multiple of four and decoded once more.
pub fn decode_base64(cleaned: &str) -> anyhow::Result<Vec<u8>> {
    match STANDARD.decode(cleaned) {
        Ok(bytes) => Ok(bytes),
        Err(first) => {
            let trimmed = cleaned.trim_end_matches('=');
            let padding = (4 - trimmed.len() % 4) % 4;
            let padded = format!("{trimmed}{}", "=".repeat(padding));
            STANDARD
                .decode(padded.as_bytes())
                .map_err(|second| anyhow::anyhow!("base64 decode failed: {first}; after padding: {second}"))
        }
    }
}

/// Decode one sync payload. Never fails.
pub fn decode_payload(raw: &str) -> Decoded {
    let cleaned = normalize(raw);
    let bytes = match decode_base64(&cleaned) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("Codec: {e}; returning raw text");
            return Decoded::Text(raw.to_string());
        }
    };

    let mut cursor: &[u8] = &bytes;
    match rmpv::decode::read_value(&mut cursor) {
        Ok(value) if cursor.is_empty() => Decoded::Tree(canonicalize(&value)),
        // A leading map or array is the record; whatever follows is padding.
        // A bare scalar is more likely text that happens to parse.
        Ok(value) if value.is_map() || value.is_array() => {
            tracing::debug!(
                "Codec: ignoring {} trailing bytes after MessagePack record",
                cursor.len()
            );
            Decoded::Tree(canonicalize(&value))
        }
        Ok(_) => {
            tracing::debug!(
                "Codec: {} trailing bytes after MessagePack scalar; returning text",
                cursor.len()
            );
            Decoded::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        Err(e) => {
            tracing::debug!("Codec: MessagePack decode failed: {e}; returning text");
            Decoded::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

/// Encode a JSON tree the way the server does (MessagePack, then base64).
pub fn encode_payload(tree: &Value) -> anyhow::Result<String> {
    let value = to_msgpack(tree);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value)?;
    Ok(STANDARD.encode(buf))
}

/// Convert a MessagePack value into a generic JSON tree.
///
/// Map keys become strings (integer keys such as `1` turn into `"1"`), binary
/// blobs become UTF-8 strings when valid and base64 otherwise.
pub fn canonicalize(value: &rmpv::Value) -> Value {
    match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(*b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                Value::Number(n.into())
            } else if let Some(n) = i.as_u64() {
                Value::Number(n.into())
            } else {
                Value::Null
            }
        }
        rmpv::Value::F32(f) => float_value(f64::from(*f)),
        rmpv::Value::F64(f) => float_value(*f),
        rmpv::Value::String(s) => match s.as_str() {
            Some(text) => Value::String(text.to_string()),
            None => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        },
        rmpv::Value::Binary(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => Value::String(STANDARD.encode(bytes)),
        },
        rmpv::Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        rmpv::Value::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, val) in entries {
                map.insert(map_key(key), canonicalize(val));
            }
            Value::Object(map)
        }
        rmpv::Value::Ext(_, data) => Value::String(STANDARD.encode(data)),
    }
}

fn map_key(key: &rmpv::Value) -> String {
    match key {
        rmpv::Value::String(s) => s
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| String::from_utf8_lossy(s.as_bytes()).into_owned()),
        rmpv::Value::Integer(i) => i
            .as_i64()
            .map(|n| n.to_string())
            .or_else(|| i.as_u64().map(|n| n.to_string()))
            .unwrap_or_default(),
        other => canonicalize(other).to_string(),
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}

fn to_msgpack(tree: &Value) -> rmpv::Value {
    match tree {
        Value::Null => rmpv::Value::Nil,
        Value::Bool(b) => rmpv::Value::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rmpv::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                rmpv::Value::from(u)
            } else {
                rmpv::Value::F64(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => rmpv::Value::from(s.as_str()),
        Value::Array(items) => rmpv::Value::Array(items.iter().map(to_msgpack).collect()),
        Value::Object(map) => rmpv::Value::Map(
            map.iter()
                .map(|(k, v)| (rmpv::Value::from(k.as_str()), to_msgpack(v)))
                .collect(),
        ),
    }
}
