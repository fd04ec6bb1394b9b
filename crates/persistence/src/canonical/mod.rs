//! Deterministic JSON encoding with a bounded encode cache.
//!
//! Object keys are sorted at every depth, arrays keep their order and no
//! whitespace is emitted, so logically equal documents always produce the
//! same bytes regardless of how `serde_json::Map` is backed.

mod digest;

use std::fmt::Write as _;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{SaveError, SaveResult};
use crate::sync;

pub(crate) use digest::{to_hex_lower, Fnv1a};
pub use digest::{
    check_document_checksum, checksum_status, document_checksum, seal_document, sha256_hex,
    verify_document_checksum, ChecksumStatus, SealedDocument, CHECKSUM_FIELD,
};

pub const DEFAULT_CACHE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    document: Value,
    text: String,
}

#[derive(Debug)]
struct EncodeCache {
    entries: Option<LruCache<(u64, bool), CacheEntry>>,
    stats: CacheStats,
}

/// Canonical encoder shared by the save manager, recovery and tooling.
#[derive(Debug)]
pub struct CanonicalEncoder {
    cache: Mutex<EncodeCache>,
}

impl Default for CanonicalEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

impl CanonicalEncoder {
    /// A `cache_size` of zero disables caching.
    pub fn new(cache_size: usize) -> Self {
        Self {
            cache: Mutex::new(EncodeCache {
                entries: NonZeroUsize::new(cache_size).map(LruCache::new),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Canonical text for `document`. With `exclude_checksum`, the top-level
    /// checksum field is left out.
    pub fn encode(&self, document: &Value, exclude_checksum: bool) -> SaveResult<String> {
        let key = (fingerprint(document, exclude_checksum), exclude_checksum);

        {
            let mut cache = sync::lock(&self.cache, "canonical_cache_lookup");
            let cache = &mut *cache;
            if let Some(entries) = cache.entries.as_mut() {
                match entries.get(&key) {
                    Some(entry) if entry.document == *document => {
                        cache.stats.hits += 1;
                        return Ok(entry.text.clone());
                    }
                    _ => cache.stats.misses += 1,
                }
            }
        }

        let text = encode_uncached(document, exclude_checksum)?;

        let mut cache = sync::lock(&self.cache, "canonical_cache_insert");
        let cache = &mut *cache;
        if let Some(entries) = cache.entries.as_mut() {
            let entry = CacheEntry {
                document: document.clone(),
                text: text.clone(),
            };
            if let Some((evicted_key, _)) = entries.push(key, entry) {
                if evicted_key != key {
                    cache.stats.evictions += 1;
                }
            }
        }
        Ok(text)
    }

    pub fn set_cache_size(&self, max_entries: usize) {
        let mut cache = sync::lock(&self.cache, "canonical_cache_resize");
        let cache = &mut *cache;
        match NonZeroUsize::new(max_entries) {
            None => {
                cache.entries = None;
                debug!("canonical_cache_disabled");
            }
            Some(capacity) => match cache.entries.as_mut() {
                Some(entries) => {
                    let before = entries.len();
                    entries.resize(capacity);
                    cache.stats.evictions += before.saturating_sub(entries.len()) as u64;
                }
                None => cache.entries = Some(LruCache::new(capacity)),
            },
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        sync::lock(&self.cache, "canonical_cache_stats").stats
    }

    pub fn cached_entries(&self) -> usize {
        sync::lock(&self.cache, "canonical_cache_len")
            .entries
            .as_ref()
            .map_or(0, LruCache::len)
    }

    pub fn clear_cache(&self) {
        let mut cache = sync::lock(&self.cache, "canonical_cache_clear");
        if let Some(entries) = cache.entries.as_mut() {
            entries.clear();
        }
        cache.stats = CacheStats::default();
    }
}

/// Rebuilds `value` with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(child) = map.get(key) {
                    sorted.insert(key.clone(), canonicalize(child));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn encode_uncached(document: &Value, exclude_checksum: bool) -> SaveResult<String> {
    let mut out = String::new();
    let skip = exclude_checksum.then_some(CHECKSUM_FIELD);
    write_canonical(document, skip, &mut out).map_err(|error| SaveError::SerializationFailed {
        message: format!("canonical encoding failed: {error}"),
    })?;
    Ok(out)
}

fn write_canonical(
    value: &Value,
    skip_key: Option<&str>,
    out: &mut String,
) -> Result<(), serde_json::Error> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => {
            let _ = write!(out, "{number}");
        }
        Value::String(text) => out.push_str(&serde_json::to_string(text)?),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, None, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys = map
                .keys()
                .filter(|key| Some(key.as_str()) != skip_key)
                .collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                if let Some(child) = map.get(key) {
                    write_canonical(child, None, out)?;
                }
            }
            out.push('}');
        }
    }
    Ok(())
}

fn fingerprint(value: &Value, exclude_checksum: bool) -> u64 {
    let mut hasher = Fnv1a::default();
    let skip = exclude_checksum.then_some(CHECKSUM_FIELD);
    fingerprint_into(value, skip, &mut hasher);
    hasher.finish()
}

fn fingerprint_into(value: &Value, skip_key: Option<&str>, hasher: &mut Fnv1a) {
    match value {
        Value::Null => hasher.write_u8(0),
        Value::Bool(flag) => {
            hasher.write_u8(1);
            hasher.write_u8(u8::from(*flag));
        }
        Value::Number(number) => {
            hasher.write_u8(2);
            hasher.write(number.to_string().as_bytes());
        }
        Value::String(text) => {
            hasher.write_u8(3);
            hasher.write(&(text.len() as u64).to_le_bytes());
            hasher.write(text.as_bytes());
        }
        Value::Array(items) => {
            hasher.write_u8(4);
            hasher.write(&(items.len() as u64).to_le_bytes());
            for item in items {
                fingerprint_into(item, None, hasher);
            }
        }
        Value::Object(map) => {
            hasher.write_u8(5);
            let mut keys = map
                .keys()
                .filter(|key| Some(key.as_str()) != skip_key)
                .collect::<Vec<_>>();
            keys.sort();
            hasher.write(&(keys.len() as u64).to_le_bytes());
            for key in keys {
                hasher.write(&(key.len() as u64).to_le_bytes());
                hasher.write(key.as_bytes());
                if let Some(child) = map.get(key) {
                    fingerprint_into(child, None, hasher);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn encoding_sorts_keys_recursively_without_whitespace() {
        let encoder = CanonicalEncoder::new(4);
        let document = json!({
            "zeta": {"b": [3, {"y": 1, "x": 2}], "a": null},
            "alpha": "text with \"quotes\"",
            "mid": 1.5,
        });
        let text = encoder.encode(&document, false).expect("encode");
        assert_eq!(
            text,
            r#"{"alpha":"text with \"quotes\"","mid":1.5,"zeta":{"a":null,"b":[3,{"x":2,"y":1}]}}"#
        );
    }

    #[test]
    fn exclude_checksum_only_drops_top_level_field() {
        let encoder = CanonicalEncoder::new(0);
        let document = json!({"checksum": "abc", "nested": {"checksum": "keep"}});
        assert_eq!(
            encoder.encode(&document, true).expect("encode"),
            r#"{"nested":{"checksum":"keep"}}"#
        );
        assert_eq!(
            encoder.encode(&document, false).expect("encode"),
            r#"{"checksum":"abc","nested":{"checksum":"keep"}}"#
        );
    }

    #[test]
    fn cache_tracks_hits_misses_and_evictions() {
        let encoder = CanonicalEncoder::new(2);
        let a = json!({"a": 1});
        let b = json!({"b": 2});
        let c = json!({"c": 3});

        encoder.encode(&a, false).expect("a");
        encoder.encode(&a, false).expect("a again");
        encoder.encode(&b, false).expect("b");
        encoder.encode(&c, false).expect("c evicts a");

        let stats = encoder.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.evictions, 1);
        assert_eq!(encoder.cached_entries(), 2);
        assert!((stats.hit_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_sized_cache_disables_caching() {
        let encoder = CanonicalEncoder::new(0);
        let document = json!({"k": [1, 2, 3]});
        encoder.encode(&document, false).expect("first");
        encoder.encode(&document, false).expect("second");
        assert_eq!(encoder.cache_stats(), CacheStats::default());
        assert_eq!(encoder.cached_entries(), 0);

        encoder.set_cache_size(1);
        encoder.encode(&document, false).expect("third");
        encoder.encode(&document, false).expect("fourth");
        assert_eq!(encoder.cache_stats().hits, 1);

        encoder.set_cache_size(0);
        assert_eq!(encoder.cached_entries(), 0);
    }

    #[test]
    fn cached_and_uncached_output_agree() {
        let cached = CanonicalEncoder::new(8);
        let uncached = CanonicalEncoder::new(0);
        let document = json!({"systems": {"eco": {"gold": 5, "debt": -2}}, "header": {"v": "1.0.0"}});
        for _ in 0..3 {
            assert_eq!(
                cached.encode(&document, true).expect("cached"),
                uncached.encode(&document, true).expect("uncached")
            );
        }
    }

    #[test]
    fn canonicalize_preserves_array_order() {
        let value = json!({"list": [{"b": 1, "a": 2}, 3, 1]});
        let canonical = canonicalize(&value);
        assert_eq!(canonical, value);
        assert_eq!(canonical["list"][1], json!(3));
    }
}
