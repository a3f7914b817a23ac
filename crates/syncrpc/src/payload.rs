//! Binary payloads inside JSON values.
//!
//! JSON has no byte-string type, so binary values travel as `{"$bytes": "<base64>"}`.
//! On the warm path the lock writer moves those bytes into the content file and
//! leaves `{"$content": [offset, len]}` references behind; the reader splices the
//! raw bytes back. User objects whose only key is `$content` are wrapped in one
//! more `$content` layer on the way out and unwrapped on the way in, so they survive
//! unchanged. A user object whose only key is `$bytes` is indistinguishable from a
//! binary value.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};

const BYTES_KEY: &str = "$bytes";
const CONTENT_KEY: &str = "$content";

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("content reference {offset}+{len} is outside the {available}-byte content file")]
    OutOfBounds {
        offset: usize,
        len: usize,
        available: usize,
    },
}

/// Wrap raw bytes as a JSON value.
pub fn bytes(data: impl AsRef<[u8]>) -> Value {
    single_entry_object(BYTES_KEY, Value::String(STANDARD.encode(data)))
}

/// Raw bytes of a value produced by [`bytes`], if it is one.
pub fn as_bytes(value: &Value) -> Option<Vec<u8>> {
    let encoded = single_entry(value, BYTES_KEY)?.as_str()?;
    STANDARD.decode(encoded).ok()
}

pub fn is_bytes(value: &Value) -> bool {
    as_bytes(value).is_some()
}

fn single_entry_object(key: &str, inner: Value) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(key.to_string(), inner);
    Value::Object(map)
}

fn single_entry<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.get(key)
}

fn content_ref(offset: usize, len: usize) -> Value {
    single_entry_object(CONTENT_KEY, Value::from(vec![offset as u64, len as u64]))
}

fn as_content_ref(value: &Value) -> Option<(usize, usize)> {
    match single_entry(value, CONTENT_KEY)?.as_array()?.as_slice() {
        [offset, len] => Some((offset.as_u64()? as usize, len.as_u64()? as usize)),
        _ => None,
    }
}

/// Move every binary node of `value` into `content`, leaving references behind.
pub(crate) fn extract_bytes(value: &mut Value, content: &mut Vec<u8>) {
    if let Some(data) = as_bytes(value) {
        let offset = content.len();
        content.extend_from_slice(&data);
        *value = content_ref(offset, data.len());
        return;
    }
    if single_entry(value, CONTENT_KEY).is_some() {
        if let Value::Object(map) = value {
            map.values_mut().for_each(|item| extract_bytes(item, content));
        }
        *value = single_entry_object(CONTENT_KEY, value.take());
        return;
    }
    match value {
        Value::Array(items) => items.iter_mut().for_each(|item| extract_bytes(item, content)),
        Value::Object(map) => map.values_mut().for_each(|item| extract_bytes(item, content)),
        _ => {}
    }
}

/// Inverse of [`extract_bytes`].
pub(crate) fn splice_bytes(value: &mut Value, content: &[u8]) -> Result<(), PayloadError> {
    if let Some((offset, len)) = as_content_ref(value) {
        let slice = offset
            .checked_add(len)
            .and_then(|end| content.get(offset..end))
            .ok_or(PayloadError::OutOfBounds {
                offset,
                len,
                available: content.len(),
            })?;
        *value = bytes(slice);
        return Ok(());
    }
    if let Some(Value::Object(_)) = single_entry(value, CONTENT_KEY) {
        let Some(Value::Object(mut escaped)) = value.as_object_mut().and_then(|m| m.remove(CONTENT_KEY))
        else {
            return Ok(());
        };
        escaped
            .values_mut()
            .try_for_each(|item| splice_bytes(item, content))?;
        *value = Value::Object(escaped);
        return Ok(());
    }
    match value {
        Value::Array(items) => items.iter_mut().try_for_each(|item| splice_bytes(item, content)),
        Value::Object(map) => map
            .values_mut()
            .try_for_each(|item| splice_bytes(item, content)),
        _ => Ok(()),
    }
}
