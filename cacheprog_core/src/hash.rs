//! Binary identifiers exchanged with the build tool.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// An opaque hash supplied by the build tool (an action id or an output id).
///
/// The protocol carries ids as base64 JSON strings; on disk they are named by
/// their lowercase hex encoding.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HashId(Vec<u8>);

impl HashId {
    /// Create an id from raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        HashId(bytes.into())
    }

    /// Create an id from its hex encoding.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.is_empty() {
            return Err(Error::invalid_key("Empty hex string"));
        }

        let bytes =
            hex::decode(hex_str).map_err(|e| Error::invalid_key(format!("Invalid hex: {}", e)))?;
        Ok(HashId(bytes))
    }

    /// Convert to lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Check that `key` can name a file inside a store directory.
///
/// Keys are non-empty lowercase hex, so they never contain separators or `..`.
pub fn validate_hex(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_key("Key cannot be empty"));
    }
    if key.len() % 2 != 0 {
        return Err(Error::invalid_key(format!(
            "Odd number of hex characters in {:?}",
            key
        )));
    }
    if let Some(c) = key
        .chars()
        .find(|c| !matches!(c, '0'..='9' | 'a'..='f'))
    {
        return Err(Error::invalid_key(format!(
            "Unexpected character {:?} in {:?}",
            c, key
        )));
    }
    Ok(())
}

impl fmt::Display for HashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for HashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashId({})", self.to_hex())
    }
}

impl Serialize for HashId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for HashId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_str(Base64Visitor).map(HashId)
    }
}

/// Decodes a base64 JSON string into bytes.
struct Base64Visitor;

impl Visitor<'_> for Base64Visitor {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a base64-encoded byte array")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
        STANDARD.decode(v).map_err(E::custom)
    }
}

/// Decode a base64 byte-array value.
pub(crate) fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| Error::invalid_body(format!("Invalid base64: {}", e)))
}
