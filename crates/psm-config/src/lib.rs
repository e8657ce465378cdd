//! psm-config
//!
//! Layered YAML configuration for the sync manager.
//!
//! Documents are merged in order (later overrides earlier), checked for
//! secret literals, and hashed over their canonical JSON so a run can record
//! exactly which configuration produced it.

pub mod consumption;
pub mod secrets;
pub mod settings;

pub use consumption::{
    consumed_pointers_for_command, report_unused_keys, ConfigCommand, UnusedKeyPolicy,
    UnusedKeyReport,
};
pub use secrets::{resolve_database_url, DatabaseUrl};
pub use settings::{
    check_retention_days, SyncSettings, DEFAULT_DATABASE_URL_ENV, DEFAULT_RETENTION_DAYS,
    MAX_RETENTION_DAYS,
};

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Merged configuration plus its identity.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Lowercase hex SHA-256 of `canonical_json`.
    pub config_hash: String,
    /// Compact JSON, object keys sorted at every depth.
    pub canonical_json: String,
    pub config_json: Value,
}

impl LoadedConfig {
    /// An empty configuration; every setting falls back to its default.
    pub fn empty() -> Result<Self> {
        load_layered_yaml_from_strings(&[])
    }

    pub fn settings(&self) -> Result<SyncSettings> {
        SyncSettings::from_config_json(&self.config_json)
    }
}

/// Read and merge YAML files in the given order.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let docs = paths
        .iter()
        .map(|p| fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}")))
        .collect::<Result<Vec<String>>>()?;
    let refs: Vec<&str> = docs.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(serde_json::Map::new());
    for (i, raw) in yaml_docs.iter().enumerate() {
        let layer: serde_yaml::Value =
            serde_yaml::from_str(raw).with_context(|| format!("invalid yaml in layer {i}"))?;
        // An empty document parses to null; it contributes nothing.
        if layer.is_null() {
            continue;
        }
        let layer = serde_json::to_value(layer)
            .with_context(|| format!("yaml->json conversion failed in layer {i}"))?;
        merge_layer(&mut merged, layer);
    }

    secrets::reject_secret_literals(&merged)?;

    let canonical_json =
        serde_json::to_string(&sorted(&merged)).context("canonical json serialize failed")?;
    let config_hash = hex::encode(Sha256::digest(canonical_json.as_bytes()));
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

/// Maps merge key by key; anything else in `layer` replaces `base`.
fn merge_layer(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base_map), Value::Object(layer_map)) => {
            for (k, v) in layer_map {
                match base_map.get_mut(&k) {
                    Some(slot) => merge_layer(slot, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, other) => *slot = other,
    }
}

fn sorted(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let ordered: BTreeMap<&String, Value> = map.iter().map(|(k, v)| (k, sorted(v))).collect();
            Value::Object(ordered.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Every scalar leaf with its JSON pointer. An empty map or array has none.
pub(crate) fn leaves(v: &Value) -> Vec<(String, &Value)> {
    let mut out = Vec::new();
    walk(v, String::new(), &mut out);
    out
}

fn walk<'a>(v: &'a Value, pointer: String, out: &mut Vec<(String, &'a Value)>) {
    match v {
        Value::Object(map) => {
            for (k, child) in map {
                let token = k.replace('~', "~0").replace('/', "~1");
                walk(child, format!("{pointer}/{token}"), out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                walk(child, format!("{pointer}/{i}"), out);
            }
        }
        leaf if pointer.is_empty() => out.push(("/".to_string(), leaf)),
        leaf => out.push((pointer, leaf)),
    }
}
