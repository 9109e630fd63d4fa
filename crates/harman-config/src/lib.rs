//! Layered YAML configuration.
//!
//! Files merge in order (later overrides earlier, objects deep-merge,
//! arrays replace), the merged document is canonicalized (sorted keys,
//! compact JSON) and SHA-256 hashed for reproducibility, then consumed
//! into the typed [`HarmanConfig`]. Secrets (the database URL) come from
//! the environment, never from config files.

use anyhow::{Context, Result};
use serde_json::map::Entry;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;

pub mod consumption;

pub use consumption::HarmanConfig;

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

impl LoadedConfig {
    fn from_value(merged: Value) -> Result<Self> {
        let canonical = to_canonical_json(&merged)?;
        Ok(Self {
            config_hash: sha256_hex(canonical.as_bytes()),
            config_json: merged,
            canonical_json: canonical,
        })
    }

    /// An empty document; callers running on pure defaults use this.
    pub fn empty() -> Self {
        Self {
            config_json: Value::Object(Map::new()),
            canonical_json: "{}".to_string(),
            config_hash: sha256_hex(b"{}"),
        }
    }
}

/// Load and merge YAML layers in order, canonicalize, and hash.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Map::new());

    for path in paths {
        let raw = fs::read_to_string(path).with_context(|| format!("read config: {path}"))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&raw).with_context(|| format!("parse yaml: {path}"))?;
        let layer = serde_json::to_value(layer).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, layer);
    }

    LoadedConfig::from_value(merged)
}

/// Later layers win. Two objects merge entry-by-entry; any other pairing
/// (array, scalar, or mismatched shapes) replaces the base wholesale.
fn deep_merge(base: &mut Value, overlay: Value) {
    let overlay = match (base.as_object_mut(), overlay) {
        (Some(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.entry(key) {
                    Entry::Occupied(mut occupied) => deep_merge(occupied.get_mut(), value),
                    Entry::Vacant(vacant) => {
                        vacant.insert(value);
                    }
                }
            }
            return;
        }
        (_, other) => other,
    };
    *base = overlay;
}

/// Compact JSON with object keys emitted in sorted order, so the hash does
/// not depend on the key order the YAML parser happened to preserve.
fn to_canonical_json(value: &Value) -> Result<String> {
    serde_json::to_string(&canonical_value(value)).context("canonical json encode failed")
}

/// Rebuild every object through a `BTreeMap`, whose iteration order is the
/// sorted key order.
fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<&String, Value> = map
                .iter()
                .map(|(key, nested)| (key, canonical_value(nested)))
                .collect();
            Value::Object(
                ordered
                    .into_iter()
                    .map(|(key, nested)| (key.clone(), nested))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        scalar => scalar.clone(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_overrides_scalars_and_merges_objects() {
        let mut base = serde_json::json!({
            "daemon": { "bind_addr": "127.0.0.1:8787", "workers": 4 },
            "risk": { "max_notional": "50.00" },
        });
        deep_merge(
            &mut base,
            serde_json::json!({
                "daemon": { "workers": 8 },
                "reconcile": { "interval_secs": 3 },
            }),
        );
        assert_eq!(base["daemon"]["bind_addr"], "127.0.0.1:8787");
        assert_eq!(base["daemon"]["workers"], 8);
        assert_eq!(base["reconcile"]["interval_secs"], 3);
    }

    #[test]
    fn deep_merge_replaces_mismatched_shapes() {
        let mut base = serde_json::json!({ "sweeper": { "workers": 4 } });
        deep_merge(&mut base, serde_json::json!({ "sweeper": "disabled" }));
        assert_eq!(base["sweeper"], "disabled");

        let mut base = serde_json::json!({ "tickers": ["A", "B"] });
        deep_merge(&mut base, serde_json::json!({ "tickers": ["C"] }));
        assert_eq!(base["tickers"], serde_json::json!(["C"]));
    }

    #[test]
    fn canonicalization_is_key_order_independent() {
        let a = serde_json::json!({ "b": 1, "a": { "y": 2, "x": 3 } });
        let b = serde_json::json!({ "a": { "x": 3, "y": 2 }, "b": 1 });
        assert_eq!(
            to_canonical_json(&a).unwrap(),
            to_canonical_json(&b).unwrap()
        );
        assert_eq!(
            to_canonical_json(&a).unwrap(),
            r#"{"a":{"x":3,"y":2},"b":1}"#
        );
    }

    #[test]
    fn empty_config_has_stable_hash() {
        assert_eq!(LoadedConfig::empty().config_hash, sha256_hex(b"{}"));
        assert_eq!(LoadedConfig::empty().canonical_json, "{}");
    }
}
