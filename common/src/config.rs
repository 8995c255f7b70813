// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed daemon settings, loaded from a TOML file with compiled-in defaults
//! when the file is absent — mirrors `settingsservice`'s `config` crate usage.

use crate::error::DaemonError;
use crate::types::ClusterConfig;
use serde::Deserialize;

/// Top-level settings for the node daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub node_id: String,
    pub bus_url: String,
    pub etcd_endpoints: Vec<String>,
    pub availability_zone: Option<String>,
    pub cluster_config_path: String,
    #[serde(default = "default_bus_request_timeout_secs")]
    pub bus_request_timeout_secs: u64,
    #[serde(default = "default_crash_window_secs")]
    pub crash_window_secs: u64,
    #[serde(default = "default_max_restarts_in_window")]
    pub max_restarts_in_window: u32,
    #[serde(default = "default_restart_base_secs")]
    pub restart_base_secs: u64,
    #[serde(default = "default_restart_max_secs")]
    pub restart_max_secs: u64,
    #[serde(default = "default_detach_pause_ms")]
    pub detach_pause_ms: u64,
}

fn default_bus_request_timeout_secs() -> u64 {
    10
}
fn default_crash_window_secs() -> u64 {
    3600
}
fn default_max_restarts_in_window() -> u32 {
    10
}
fn default_restart_base_secs() -> u64 {
    5
}
fn default_restart_max_secs() -> u64 {
    120
}
fn default_detach_pause_ms() -> u64 {
    100
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            node_id: "node-a".to_string(),
            bus_url: "nats://127.0.0.1:4222".to_string(),
            etcd_endpoints: vec!["127.0.0.1:2379".to_string()],
            availability_zone: None,
            cluster_config_path: "/etc/noded/cluster.toml".to_string(),
            bus_request_timeout_secs: default_bus_request_timeout_secs(),
            crash_window_secs: default_crash_window_secs(),
            max_restarts_in_window: default_max_restarts_in_window(),
            restart_base_secs: default_restart_base_secs(),
            restart_max_secs: default_restart_max_secs(),
            detach_pause_ms: default_detach_pause_ms(),
        }
    }
}

/// Load settings from `path`, falling back to [`Settings::default`] when the
/// file does not exist or fails to parse — matching `common::setting`'s
/// "best effort, never fatal at startup" behavior.
pub fn load_settings(path: &str) -> Settings {
    let builder = config::Config::builder().add_source(config::File::with_name(path).required(false));

    match builder.build() {
        Ok(cfg) => cfg.try_deserialize().unwrap_or_default(),
        Err(_) => Settings::default(),
    }
}

/// Loads cluster membership from `path` (§3.1). Unlike [`load_settings`]
/// this is not best-effort: a missing or malformed cluster config means the
/// node cannot determine its peers or compute the health-check config
/// hash, so it fails startup rather than silently running with none.
pub fn load_cluster_config(path: &str) -> Result<ClusterConfig, DaemonError> {
    let builder = config::Config::builder().add_source(config::File::with_name(path).required(true));
    let cfg = builder
        .build()
        .map_err(|e| DaemonError::ServerInternal(format!("load cluster config {path}: {e}")))?;
    cfg.try_deserialize()
        .map_err(|e| DaemonError::ServerInternal(format!("parse cluster config {path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = load_settings("/nonexistent/path/noded.toml");
        assert_eq!(settings.node_id, "node-a");
        assert_eq!(settings.max_restarts_in_window, 10);
    }

    #[test]
    fn loads_overrides_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noded.toml");
        std::fs::write(
            &path,
            r#"
            node_id = "node-b"
            bus_url = "nats://10.0.0.5:4222"
            etcd_endpoints = ["10.0.0.5:2379"]
            cluster_config_path = "/etc/noded/cluster.toml"
            max_restarts_in_window = 3
            "#,
        )
        .unwrap();

        let settings = load_settings(path.to_str().unwrap().trim_end_matches(".toml"));
        assert_eq!(settings.node_id, "node-b");
        assert_eq!(settings.max_restarts_in_window, 3);
        assert_eq!(settings.restart_base_secs, 5);
    }

    #[test]
    fn missing_cluster_config_errors_instead_of_defaulting() {
        let err = load_cluster_config("/nonexistent/path/cluster").unwrap_err();
        assert_eq!(err.code(), "ServerInternal");
    }

    #[test]
    fn loads_cluster_config_with_node_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");
        std::fs::write(
            &path,
            r#"
            epoch = 5
            version = "v1"
            node_id = "node-a"

            [nodes.node-a]
            node_id = "node-a"
            bus_url = "nats://127.0.0.1:4222"
            total_vcpus = 8
            total_memory_gib = 16.0
            "#,
        )
        .unwrap();

        let cfg = load_cluster_config(path.to_str().unwrap().trim_end_matches(".toml")).unwrap();
        assert_eq!(cfg.epoch, 5);
        assert_eq!(cfg.nodes.len(), 1);
        assert_eq!(cfg.nodes["node-a"].total_vcpus, 8);
    }
}
