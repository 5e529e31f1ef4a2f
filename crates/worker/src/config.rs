// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};

use remote_protocol::{CasInsertionControl, CasInsertionPolicy};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path} as TOML: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_liveness_poll_interval_ms() -> u64 {
    5_000
}

fn default_inline_limit() -> usize {
    4096
}

fn default_max_cache_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

#[derive(Debug, Clone, Copy, Deserialize, Default, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum InsertionPolicyConfig {
    #[default]
    Unknown,
    AlwaysInsert,
    InsertAboveLimit,
    NeverInsert,
}

impl From<InsertionPolicyConfig> for CasInsertionPolicy {
    fn from(value: InsertionPolicyConfig) -> Self {
        match value {
            InsertionPolicyConfig::Unknown => CasInsertionPolicy::Unknown,
            InsertionPolicyConfig::AlwaysInsert => CasInsertionPolicy::AlwaysInsert,
            InsertionPolicyConfig::InsertAboveLimit => CasInsertionPolicy::InsertAboveLimit,
            InsertionPolicyConfig::NeverInsert => CasInsertionPolicy::NeverInsert,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamPolicyConfig {
    #[serde(default = "default_inline_limit")]
    pub limit: usize,
    #[serde(default)]
    pub policy: InsertionPolicyConfig,
}

impl Default for StreamPolicyConfig {
    fn default() -> Self {
        StreamPolicyConfig {
            limit: default_inline_limit(),
            policy: InsertionPolicyConfig::default(),
        }
    }
}

impl From<StreamPolicyConfig> for CasInsertionControl {
    fn from(value: StreamPolicyConfig) -> Self {
        CasInsertionControl::new(value.limit, value.policy.into())
    }
}

/// The worker's on-disk configuration: where to cache blobs, how much disk to give the cache,
/// where to materialize execution directories, how often to poll for work, and how captured
/// output streams get packaged.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub cache_dir: PathBuf,
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,
    pub exec_root: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_liveness_poll_interval_ms")]
    pub liveness_poll_interval_ms: u64,
    #[serde(default)]
    pub stdout: StreamPolicyConfig,
    #[serde(default)]
    pub stderr: StreamPolicyConfig,
    #[serde(default)]
    pub output_files: StreamPolicyConfig,
    /// Passed through to `env_logger` as the default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<WorkerConfig, WorkerError> {
        let contents = std::fs::read_to_string(path).map_err(|source| WorkerError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| WorkerError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "cache_dir = \"/tmp/cache\"\nexec_root = \"/tmp/exec\"\n").unwrap();
        let config = WorkerConfig::load(&path).unwrap();
        assert_eq!(config.poll_interval_ms, default_poll_interval_ms());
        assert_eq!(config.stdout.limit, default_inline_limit());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = WorkerConfig::load(Path::new("/nonexistent/worker.toml")).unwrap_err();
        assert!(matches!(err, WorkerError::Read { .. }));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "not valid toml {{{").unwrap();
        let err = WorkerConfig::load(&path).unwrap_err();
        assert!(matches!(err, WorkerError::Parse { .. }));
    }

    #[test]
    fn explicit_stream_policy_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(
            &path,
            r#"
            cache_dir = "/tmp/cache"
            exec_root = "/tmp/exec"

            [stdout]
            limit = 1024
            policy = "always_insert"
            "#,
        )
        .unwrap();
        let config = WorkerConfig::load(&path).unwrap();
        assert_eq!(config.stdout.limit, 1024);
        assert_eq!(config.stdout.policy, InsertionPolicyConfig::AlwaysInsert);
    }
}
