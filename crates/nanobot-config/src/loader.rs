// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority. Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/nanobot/config.yaml"));
    paths.push(PathBuf::from("/etc/nanobot/config.yml"));

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/nanobot/config.yaml"));
        paths.push(home.join(".config/nanobot/config.yml"));
        paths.push(home.join(".nanobot/config.yaml"));
    }

    paths.push(PathBuf::from("nanobot.yaml"));
    paths.push(PathBuf::from("nanobot.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (`--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_yaml(&mut merged, read_layer(&path)?);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        merge_yaml(&mut merged, read_layer(p)?);
    }

    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).context("deserializing merged config")?
    };
    Ok(config)
}

fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                match d.get_mut(&k) {
                    Some(slot) => merge_yaml(slot, v),
                    None => {
                        d.insert(k, v);
                    }
                }
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst: serde_yaml::Value = serde_yaml::from_str("a: 1").unwrap();
        let src: serde_yaml::Value = serde_yaml::from_str("a: 2").unwrap();
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"], serde_yaml::Value::from(2));
    }

    #[test]
    fn merge_is_deep_for_mappings() {
        let mut dst: serde_yaml::Value =
            serde_yaml::from_str("agent:\n  max_iterations: 1\n  memory_window: 50").unwrap();
        let src: serde_yaml::Value = serde_yaml::from_str("agent:\n  max_iterations: 9").unwrap();
        merge_yaml(&mut dst, src);
        assert_eq!(dst["agent"]["max_iterations"], serde_yaml::Value::from(9));
        assert_eq!(dst["agent"]["memory_window"], serde_yaml::Value::from(50));
    }

    #[test]
    fn explicit_path_layer_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.yaml");
        std::fs::write(&path, "agent:\n  max_iterations: 3\n").unwrap();
        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.agent.max_iterations, 3);
    }

    #[test]
    fn missing_explicit_path_errors() {
        assert!(load(Some(Path::new("/nonexistent/nanobot.yaml"))).is_err());
    }
}
