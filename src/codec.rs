//! Job-data map serialization.
//!
//! Two modes, selected by `JobStoreConfig::use_properties`: an opaque binary
//! form (default) and a string-only properties form. Transient entries
//! (`TRANSIENT_PREFIX`) are dropped before encoding in either mode.
//!
//! The specification's open question — what a properties-mode `null` value
//! should do — is resolved here as an explicit rejection (`StoreError::Codec`)
//! rather than silent stringification, so `decode(encode(map)) == map` holds
//! for every map the codec accepts.

use std::collections::BTreeMap;

use crate::error::{Result, StoreError};
use crate::model::{JobDataMap, JobDataValue};

pub trait JobDataCodec {
    fn encode(&self, map: &JobDataMap) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<JobDataMap>;
}

/// Opaque binary mode: a `serde_json` envelope over the durable entries.
/// There is no class-loading context in this store to reconstruct arbitrary
/// Java-style object graphs, so the "binary blob" is a JSON envelope rather
/// than a Java serialization stream — the wire contract the spec cares about
/// (round-trip equality of the map) holds regardless of the byte format.
pub struct BinaryCodec;

impl JobDataCodec for BinaryCodec {
    fn encode(&self, map: &JobDataMap) -> Result<Vec<u8>> {
        let durable = map.durable_entries();
        serde_json::to_vec(&durable).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<JobDataMap> {
        if bytes.is_empty() {
            return Ok(JobDataMap::new());
        }
        let entries: BTreeMap<String, JobDataValue> =
            serde_json::from_slice(bytes).map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(JobDataMap {
            entries,
            dirty: false,
        })
    }
}

/// Properties mode: a `key=value` text stream, one entry per line, matching
/// a standard `.properties` file. Every value must be `JobDataValue::String`
/// and present — a non-string value or `None` fails the whole encode before
/// any row is touched.
pub struct PropertiesCodec;

impl JobDataCodec for PropertiesCodec {
    fn encode(&self, map: &JobDataMap) -> Result<Vec<u8>> {
        let mut out = String::new();
        for (key, value) in map.durable_entries() {
            let s = value.as_str().ok_or_else(|| {
                StoreError::Codec(format!(
                    "properties mode requires string values; key '{key}' is not a string"
                ))
            })?;
            if s.contains('\n') || s.contains('=') {
                return Err(StoreError::Codec(format!(
                    "value for key '{key}' cannot contain '=' or a newline in properties mode"
                )));
            }
            out.push_str(&key);
            out.push('=');
            out.push_str(s);
            out.push('\n');
        }
        Ok(out.into_bytes())
    }

    fn decode(&self, bytes: &[u8]) -> Result<JobDataMap> {
        let text = std::str::from_utf8(bytes).map_err(|e| StoreError::Codec(e.to_string()))?;
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                StoreError::Codec(format!("malformed properties line: '{line}'"))
            })?;
            entries.insert(key.to_string(), JobDataValue::String(value.to_string()));
        }
        Ok(JobDataMap {
            entries,
            dirty: false,
        })
    }
}

/// Select the codec implied by `use_properties`.
pub fn codec_for(use_properties: bool) -> Box<dyn JobDataCodec + Send + Sync> {
    if use_properties {
        Box::new(PropertiesCodec)
    } else {
        Box::new(BinaryCodec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_round_trip() {
        let mut map = JobDataMap::new();
        map.insert("foo", "bar");
        map.insert("count", 3i64);
        map.insert("__transient_scratch", "drop-me");

        let codec = BinaryCodec;
        let bytes = codec.encode(&map).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(decoded.get("foo"), Some(&JobDataValue::String("bar".into())));
        assert_eq!(decoded.get("count"), Some(&JobDataValue::I64(3)));
        assert!(decoded.get("__transient_scratch").is_none());
    }

    #[test]
    fn properties_round_trip() {
        let mut map = JobDataMap::new();
        map.insert("a", "1");
        map.insert("b", "two");

        let codec = PropertiesCodec;
        let bytes = codec.encode(&map).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(decoded.get("a"), Some(&JobDataValue::String("1".into())));
        assert_eq!(decoded.get("b"), Some(&JobDataValue::String("two".into())));
    }

    #[test]
    fn properties_mode_rejects_non_string_values() {
        let mut map = JobDataMap::new();
        map.insert("n", 42i64);

        let codec = PropertiesCodec;
        let err = codec.encode(&map).unwrap_err();
        assert!(matches!(err, StoreError::Codec(_)));
    }

    #[test]
    fn empty_binary_blob_decodes_to_empty_map() {
        let codec = BinaryCodec;
        let decoded = codec.decode(&[]).unwrap();
        assert!(decoded.entries.is_empty());
    }
}
