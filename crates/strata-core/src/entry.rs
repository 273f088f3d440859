//! The cache entry record moved between tiers.
//!
//! An entry is one opaque data value plus the metadata that drives tiering,
//! refresh and invalidation decisions. In the shared store the two halves
//! live in separate records (a binary DATA blob and an INFO field map), so
//! `EntryInfo` converts losslessly to and from a string field map.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::key::checksum;

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Metadata half of a cache entry.
///
/// Field meanings follow the shared-store INFO record:
/// - `params`: reduced parameter set the data was fetched with
/// - `source`: stable id of the originating data source; empty when the
///   entry cannot be refreshed (e.g. directly stored values)
/// - `checksum`: digest of `data`, drives change detection
/// - `timestamp_ms`: last fetch time; `created_ms`: first fetch time;
///   `modified_ms`: last time the checksum changed
/// - `ttl_ms`: time to live of the DATA record
/// - `duration_ms`: latency of the last source fetch
/// - `count`: usage counter, only ever incremented in place in the store
/// - `permanent`: never expires in the local tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryInfo {
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub timestamp_ms: i64,
    #[serde(default)]
    pub modified_ms: i64,
    #[serde(default)]
    pub created_ms: i64,
    #[serde(default)]
    pub ttl_ms: i64,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub permanent: bool,
}

impl EntryInfo {
    /// Whether the entry can be recomputed from its source.
    pub fn is_refreshable(&self) -> bool {
        !self.source.is_empty()
    }

    /// Render as store hash fields.
    ///
    /// `count` is deliberately excluded: writing it back would clobber
    /// increments racing from other instances.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("params".into(), self.params.to_string()),
            ("source".into(), self.source.clone()),
            ("checksum".into(), self.checksum.clone()),
            ("timestamp_ms".into(), self.timestamp_ms.to_string()),
            ("modified_ms".into(), self.modified_ms.to_string()),
            ("created_ms".into(), self.created_ms.to_string()),
            ("ttl_ms".into(), self.ttl_ms.to_string()),
            ("duration_ms".into(), self.duration_ms.to_string()),
            ("permanent".into(), if self.permanent { "1" } else { "0" }.into()),
        ];
        if let Some(metadata) = &self.metadata {
            if let Ok(json) = serde_json::to_string(metadata) {
                fields.push(("metadata".into(), json));
            }
        }
        fields
    }

    /// Parse from store hash fields. Unknown fields are ignored, missing
    /// fields fall back to defaults.
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let int = |name: &str| -> i64 {
            fields.get(name).and_then(|v| v.parse().ok()).unwrap_or(0)
        };
        Self {
            params: fields
                .get("params")
                .and_then(|v| serde_json::from_str(v).ok())
                .unwrap_or(Value::Null),
            source: fields.get("source").cloned().unwrap_or_default(),
            metadata: fields
                .get("metadata")
                .and_then(|v| serde_json::from_str(v).ok()),
            checksum: fields.get("checksum").cloned().unwrap_or_default(),
            timestamp_ms: int("timestamp_ms"),
            modified_ms: int("modified_ms"),
            created_ms: int("created_ms"),
            ttl_ms: int("ttl_ms"),
            duration_ms: int("duration_ms"),
            count: int("count"),
            permanent: matches!(fields.get("permanent").map(String::as_str), Some("1")),
        }
    }

    /// Refresh priority: `(duration / slow_duration)^2 * (count / age_ms)`,
    /// scaled to counts-per-second. Expensive and frequently used entries
    /// sort first.
    pub fn priority_score(&self, slow_duration_ms: u64, at_ms: i64) -> f64 {
        let duration_factor = if self.duration_ms > 0 {
            self.duration_ms as f64 / slow_duration_ms.max(1) as f64
        } else {
            1.0
        };
        let age_ms = match at_ms - self.created_ms {
            age if age > 0 => age as f64,
            _ => 1000.0,
        };
        let usage_factor = self.count.max(1) as f64 / age_ms * 1000.0;
        duration_factor * duration_factor * usage_factor
    }
}

/// A cache entry: key, opaque data and metadata.
///
/// `dependent_keys` carries the dependency keys declared by the last fetch;
/// they are registered into the dependency index at write time and are not
/// part of the persisted INFO record.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub data: Value,
    pub info: EntryInfo,
    pub dependent_keys: Vec<String>,
}

impl CacheEntry {
    /// Build an entry around already-fetched data, stamping checksum and
    /// creation times.
    pub fn new(key: impl Into<String>, data: Value) -> Self {
        let now = now_ms();
        let info = EntryInfo {
            checksum: checksum(&data),
            timestamp_ms: now,
            modified_ms: now,
            created_ms: now,
            ..EntryInfo::default()
        };
        Self { key: key.into(), data, info, dependent_keys: Vec::new() }
    }

    /// Remaining lifetime relative to the last fetch, in milliseconds.
    /// Negative once expired.
    pub fn remaining_ttl_ms(&self, at_ms: i64) -> i64 {
        self.info.timestamp_ms + self.info.ttl_ms - at_ms
    }

    /// Encode the data value as a MessagePack blob for the DATA record.
    pub fn encode_data(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(&self.data)?)
    }

    /// Decode a DATA record blob.
    pub fn decode_data(bytes: &[u8]) -> Result<Value> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn info_fields_roundtrip() {
        let info = EntryInfo {
            params: json!({"id": 3}),
            source: "products".into(),
            metadata: Some(BTreeMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )])),
            checksum: "abc".into(),
            timestamp_ms: 1_000,
            modified_ms: 900,
            created_ms: 800,
            ttl_ms: 60_000,
            duration_ms: 42,
            count: 7,
            permanent: true,
        };
        let map: HashMap<String, String> = info.to_fields().into_iter().collect();
        let parsed = EntryInfo::from_fields(&map);

        // count is never written through fields, only incremented in place
        assert_eq!(parsed.count, 0);
        assert_eq!(parsed, EntryInfo { count: 0, ..info });
    }

    #[test]
    fn from_fields_tolerates_missing_and_junk() {
        let mut map = HashMap::new();
        map.insert("ttl_ms".to_string(), "not a number".to_string());
        map.insert("source".to_string(), "orders".to_string());
        let parsed = EntryInfo::from_fields(&map);
        assert_eq!(parsed.ttl_ms, 0);
        assert_eq!(parsed.source, "orders");
        assert!(parsed.is_refreshable());
        assert!(!parsed.permanent);
    }

    #[test]
    fn data_blob_roundtrip() {
        let entry = CacheEntry::new("k1", json!({"x": 1, "list": [1, 2, 3]}));
        let bytes = entry.encode_data().unwrap();
        assert_eq!(CacheEntry::decode_data(&bytes).unwrap(), entry.data);
    }

    #[test]
    fn new_entry_stamps_checksum_and_times() {
        let entry = CacheEntry::new("k1", json!({"x": 1}));
        assert_eq!(entry.info.checksum, checksum(&json!({"x": 1})));
        assert_eq!(entry.info.created_ms, entry.info.timestamp_ms);
        assert_eq!(entry.info.modified_ms, entry.info.timestamp_ms);
    }

    #[test]
    fn priority_favors_slow_and_popular() {
        let now = now_ms();
        let slow = EntryInfo {
            duration_ms: 1000,
            count: 100,
            created_ms: now - 10_000,
            ..EntryInfo::default()
        };
        let fast = EntryInfo {
            duration_ms: 10,
            count: 100,
            created_ms: now - 10_000,
            ..EntryInfo::default()
        };
        assert!(slow.priority_score(500, now) > fast.priority_score(500, now));

        let unpopular = EntryInfo { count: 1, ..slow.clone() };
        assert!(slow.priority_score(500, now) > unpopular.priority_score(500, now));
    }

    #[test]
    fn remaining_ttl_goes_negative_after_expiry() {
        let mut entry = CacheEntry::new("k1", json!(1));
        entry.info.ttl_ms = 100;
        let t0 = entry.info.timestamp_ms;
        assert!(entry.remaining_ttl_ms(t0) > 0);
        assert!(entry.remaining_ttl_ms(t0 + 101) < 0);
    }
}
