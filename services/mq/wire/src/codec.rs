//! Frame metadata: a small string-keyed map carried as canonical CBOR.
//!
//! Keys are kept sorted so equal metadata always encodes to equal bytes.
//! Empty metadata encodes to zero bytes.

use bytes::Bytes;
use ciborium::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::WireError;

/// Failure to encode or decode a frame
#[derive(Error, Debug)]
pub enum CodecError {
    /// Framing problem
    #[error(transparent)]
    Wire(#[from] WireError),
    /// CBOR serialization failed
    #[error("metadata encoding failed: {0}")]
    MetaEncode(String),
    /// Metadata bytes are not a CBOR map
    #[error("metadata decoding failed: {0}")]
    MetaDecode(String),
}

/// Frame metadata map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta {
    entries: BTreeMap<String, Value>,
}

impl Meta {
    /// Empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a text entry
    pub fn with_str(mut self, key: &str, value: &str) -> Self {
        self.entries
            .insert(key.to_owned(), Value::Text(value.to_owned()));
        self
    }

    /// Add an unsigned integer entry
    pub fn with_u32(mut self, key: &str, value: u32) -> Self {
        self.entries.insert(key.to_owned(), Value::Integer(value.into()));
        self
    }

    /// Text value under `key`
    pub fn str(&self, key: &str) -> Option<&str> {
        match self.entries.get(key)? {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Integer value under `key`, if it fits a `u32`
    pub fn u32(&self, key: &str) -> Option<u32> {
        match self.entries.get(key)? {
            Value::Integer(int) => u32::try_from(*int).ok(),
            _ => None,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to canonical CBOR
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        if self.entries.is_empty() {
            return Ok(Bytes::new());
        }
        let map = Value::Map(
            self.entries
                .iter()
                .map(|(key, value)| (Value::Text(key.clone()), value.clone()))
                .collect(),
        );
        let mut out = Vec::with_capacity(16 * self.entries.len());
        ciborium::into_writer(&map, &mut out).map_err(|e| CodecError::MetaEncode(e.to_string()))?;
        Ok(Bytes::from(out))
    }

    /// Parse CBOR bytes; non-text keys are skipped
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let value: Value =
            ciborium::from_reader(raw).map_err(|e| CodecError::MetaDecode(e.to_string()))?;
        let Value::Map(pairs) = value else {
            return Err(CodecError::MetaDecode("top level is not a map".to_owned()));
        };

        let entries = pairs
            .into_iter()
            .filter_map(|(key, value)| match key {
                Value::Text(key) => Some((key, value)),
                _ => None,
            })
            .collect();
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_lookups() {
        let raw = Meta::new()
            .with_str("service", "echo")
            .with_u32("code", 3)
            .encode()
            .unwrap();

        let meta = Meta::decode(&raw).unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(meta.str("service"), Some("echo"));
        assert_eq!(meta.u32("code"), Some(3));
        // Wrong type reads as absent
        assert_eq!(meta.u32("service"), None);
        assert_eq!(meta.str("missing"), None);
    }

    #[test]
    fn test_empty_meta_is_zero_bytes() {
        let raw = Meta::new().encode().unwrap();
        assert!(raw.is_empty());
        assert!(Meta::decode(&raw).unwrap().is_empty());
    }

    #[test]
    fn test_encoding_is_independent_of_insert_order() {
        let a = Meta::new().with_str("b", "2").with_str("a", "1").encode().unwrap();
        let b = Meta::new().with_str("a", "1").with_str("b", "2").encode().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_non_map_rejected() {
        let mut raw = Vec::new();
        ciborium::into_writer(&Value::Text("x".into()), &mut raw).unwrap();
        assert!(matches!(Meta::decode(&raw), Err(CodecError::MetaDecode(_))));
    }
}
