//! Layered YAML configuration loading.
//!
//! Later files in the list override earlier ones via a recursive deep
//! merge; the result is canonicalised (object keys sorted) before being
//! hashed, so two semantically identical configs in different key order
//! hash identically.

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

pub const ENV_DATABASE_URL: &str = "PACP_DATABASE_URL";
pub const ENV_DAEMON_ADDR: &str = "PACP_DAEMON_ADDR";

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Load and deep-merge a list of YAML files, in order.
pub fn load_layered_yaml<P: AsRef<Path>>(paths: &[P]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let p = p.as_ref();
        let s = fs::read_to_string(p).with_context(|| format!("read config: {}", p.display()))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {}", p.display()))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

/// Load the subset of paths that exist, skipping the rest — used for the
/// `config/base.yaml` + `config/<env>.yaml` + optional operator-override
/// layering where not every layer is always present.
pub fn load_layered_yaml_existing<P: AsRef<Path>>(paths: &[P]) -> Result<LoadedConfig> {
    let existing: Vec<&Path> = paths
        .iter()
        .map(|p| p.as_ref())
        .filter(|p| p.exists())
        .collect();
    load_layered_yaml(&existing)
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Parse a `PipelineConfig` out of a merged config document's `pipeline`
/// key, falling back to defaults for anything absent.
pub fn pipeline_config_from_json(v: &Value) -> Result<pacp_schemas::PipelineConfig> {
    match v.get("pipeline") {
        Some(pipeline) => {
            serde_json::from_value(pipeline.clone()).context("invalid pipeline config section")
        }
        None => Ok(pacp_schemas::PipelineConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn later_layer_overrides_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_temp(&dir, "base.yaml", "a: 1\nb:\n  c: 2\n");
        let env = write_temp(&dir, "env.yaml", "b:\n  c: 3\n  d: 4\n");

        let loaded = load_layered_yaml(&[base, env]).unwrap();
        assert_eq!(loaded.config_json["a"], 1);
        assert_eq!(loaded.config_json["b"]["c"], 3);
        assert_eq!(loaded.config_json["b"]["d"], 4);
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_temp(&dir, "a.yaml", "a: 1\nb: 2\n");
        let b = write_temp(&dir, "b.yaml", "b: 2\na: 1\n");

        let loaded_a = load_layered_yaml(&[a]).unwrap();
        let loaded_b = load_layered_yaml(&[b]).unwrap();
        assert_eq!(loaded_a.config_hash, loaded_b.config_hash);
    }

    #[test]
    fn missing_layers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_temp(&dir, "base.yaml", "a: 1\n");
        let missing = dir.path().join("does-not-exist.yaml");

        let loaded = load_layered_yaml_existing(&[base, missing]).unwrap();
        assert_eq!(loaded.config_json["a"], 1);
    }
}
