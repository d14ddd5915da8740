//! Fingerprint-keyed phase result cache.
//!
//! Keys digest the phase name, the request, and a canonicalized rendering of
//! the input data, so a change in any upstream stage's output misses the
//! cache. Entries are TTL-bounded; at capacity the oldest-expiring entry is
//! evicted. Only successful outputs are cached.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::CacheConfig;
use crate::phase::PhaseOutput;

/// Stable cache key for `(phase, request, input data)`.
pub fn fingerprint(phase: &str, request: &str, data: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(phase.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonicalize(data).to_string().as_bytes());
    let digest = hasher.finalize();
    format!("{digest:x}")
}

/// Recursively sort object keys so logically equal values fingerprint equally.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

struct Entry {
    output: PhaseOutput,
    expires_at: Instant,
}

/// Process-local TTL cache for successful phase outputs.
pub struct ResultCache {
    entries: RwLock<HashMap<String, Entry>>,
    capacity: usize,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: config.capacity.max(1),
            ttl: config.ttl,
        }
    }

    /// Look up a still-valid entry.
    pub fn get(&self, key: &str) -> Option<PhaseOutput> {
        let entries = self.entries.read().expect("cache lock");
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        debug!(key = &key[..12.min(key.len())], "phase cache hit");
        Some(entry.output.clone())
    }

    /// Insert a successful output, evicting the oldest-expiring entry at
    /// capacity.
    pub fn insert(&self, key: String, output: PhaseOutput) {
        let mut entries = self.entries.write().expect("cache lock");
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let victim = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
            }
        }

        entries.insert(
            key,
            Entry {
                output,
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().expect("cache lock").clear();
    }
}
