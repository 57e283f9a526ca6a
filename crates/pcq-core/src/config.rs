// Copyright [2026] [Joseph Verdicchio]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 Joseph Verdicchio and PCQ Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use crate::error::{PcqError, PcqResult};

pub const ENV_DATA_DIR: &str = "PCQ_DATA_DIR";
pub const ENV_MAX_WORKERS: &str = "PCQ_MAX_WORKERS";
pub const ENV_NODE_MAX_ATTEMPTS: &str = "PCQ_NODE_MAX_ATTEMPTS";
pub const ENV_CHECKSUM_CHUNK_BYTES: &str = "PCQ_CHECKSUM_CHUNK_BYTES";

pub const DEFAULT_NODE_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_CHECKSUM_CHUNK_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Upper bound on executor worker threads. The pool never exceeds the
    /// host's available parallelism either.
    pub max_workers: usize,
    pub node_max_attempts: u32,
    pub checksum_chunk_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_workers: host_parallelism(),
            node_max_attempts: DEFAULT_NODE_MAX_ATTEMPTS,
            checksum_chunk_bytes: DEFAULT_CHECKSUM_CHUNK_BYTES,
        }
    }
}

fn host_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_positive<T: std::str::FromStr + PartialOrd + Default>(
    name: &str,
    raw: &str,
) -> PcqResult<T> {
    match raw.trim().parse::<T>() {
        Ok(v) if v > T::default() => Ok(v),
        _ => Err(PcqError::InvalidArgument(format!(
            "{name} must be a positive integer, got {raw:?}"
        ))),
    }
}

impl EngineConfig {
    pub fn from_env() -> PcqResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source. Unset variables
    /// keep their defaults; malformed ones are rejected.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PcqResult<Self> {
        let mut cfg = Self::default();
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_MAX_WORKERS) {
            cfg.max_workers = parse_positive(ENV_MAX_WORKERS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_NODE_MAX_ATTEMPTS) {
            cfg.node_max_attempts = parse_positive(ENV_NODE_MAX_ATTEMPTS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CHECKSUM_CHUNK_BYTES) {
            cfg.checksum_chunk_bytes = parse_positive(ENV_CHECKSUM_CHUNK_BYTES, &raw)?;
        }
        Ok(cfg)
    }

    pub fn with_data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.data_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.max_workers.min(host_parallelism()).max(1)
    }

    pub fn cas_dir(&self) -> PathBuf {
        self.data_dir.join("cas")
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.data_dir.join("manifests")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let cfg = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.node_max_attempts, DEFAULT_NODE_MAX_ATTEMPTS);
        assert_eq!(cfg.checksum_chunk_bytes, DEFAULT_CHECKSUM_CHUNK_BYTES);
        assert!(cfg.worker_count() >= 1);
    }

    #[test]
    fn variables_override_defaults() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            (ENV_DATA_DIR, "/var/lib/pcq"),
            (ENV_MAX_WORKERS, "1"),
            (ENV_NODE_MAX_ATTEMPTS, "5"),
            (ENV_CHECKSUM_CHUNK_BYTES, "512"),
        ]))
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/pcq"));
        assert_eq!(cfg.worker_count(), 1);
        assert_eq!(cfg.node_max_attempts, 5);
        assert_eq!(cfg.checksum_chunk_bytes, 512);
        assert_eq!(cfg.cas_dir(), PathBuf::from("/var/lib/pcq/cas"));
    }

    #[test]
    fn zero_or_garbage_is_rejected() {
        assert!(EngineConfig::from_lookup(lookup(&[(ENV_MAX_WORKERS, "0")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[(ENV_NODE_MAX_ATTEMPTS, "many")])).is_err());
    }
}
