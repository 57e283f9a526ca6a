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

//! Content-addressed blob storage.
//!
//! Keys are the SHA-256 of the stored bytes. Writes are idempotent and reads
//! re-hash the returned bytes, so a corrupted blob surfaces as
//! [`CasError::Corrupt`] instead of silently feeding wrong data downstream.
//! Blobs are never rewritten in place; the only removal path is
//! [`collect_garbage`].

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::digest::{canonical_json, parse_hash32, sha256, Hash32};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CasError {
    #[error("blob {0} not found")]
    NotFound(String),
    #[error("blob {key} is corrupt: stored bytes hash to {actual}")]
    Corrupt { key: String, actual: String },
    #[error("blob {key} does not decode: {reason}")]
    Decode { key: String, reason: String },
    #[error("cas io error: {0}")]
    Io(String),
}

pub trait BlobStore: Send + Sync {
    fn put(&self, bytes: &[u8]) -> Result<Hash32, CasError>;

    /// Returns the bytes stored under `key` after checking they still hash to it.
    fn get(&self, key: &Hash32) -> Result<Vec<u8>, CasError>;

    fn contains(&self, key: &Hash32) -> bool;

    fn list(&self) -> Result<Vec<Hash32>, CasError>;

    /// Only called by [`collect_garbage`].
    fn remove(&self, key: &Hash32) -> Result<bool, CasError>;
}

fn check_integrity(key: &Hash32, bytes: &[u8]) -> Result<(), CasError> {
    let actual = sha256(bytes);
    if &actual != key {
        return Err(CasError::Corrupt {
            key: hex::encode(key),
            actual: hex::encode(actual),
        });
    }
    Ok(())
}

pub fn put_json<T: Serialize>(store: &dyn BlobStore, value: &T) -> Result<Hash32, CasError> {
    let bytes = canonical_json(value).map_err(|e| CasError::Decode {
        key: String::new(),
        reason: e.to_string(),
    })?;
    store.put(&bytes)
}

pub fn get_json<T: DeserializeOwned>(store: &dyn BlobStore, key: &Hash32) -> Result<T, CasError> {
    let bytes = store.get(key)?;
    serde_json::from_slice(&bytes).map_err(|e| CasError::Decode {
        key: hex::encode(key),
        reason: e.to_string(),
    })
}

#[derive(Debug, Default)]
pub struct MemoryCas {
    blobs: RwLock<BTreeMap<Hash32, Arc<[u8]>>>,
}

impl MemoryCas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Overwrites a blob without re-keying it. Test hook for corruption checks.
    #[cfg(test)]
    pub(crate) fn corrupt(&self, key: &Hash32, bytes: &[u8]) {
        self.blobs.write().insert(*key, Arc::from(bytes));
    }
}

impl BlobStore for MemoryCas {
    fn put(&self, bytes: &[u8]) -> Result<Hash32, CasError> {
        let key = sha256(bytes);
        self.blobs
            .write()
            .entry(key)
            .or_insert_with(|| Arc::from(bytes));
        Ok(key)
    }

    fn get(&self, key: &Hash32) -> Result<Vec<u8>, CasError> {
        let blob = self
            .blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| CasError::NotFound(hex::encode(key)))?;
        check_integrity(key, &blob)?;
        Ok(blob.to_vec())
    }

    fn contains(&self, key: &Hash32) -> bool {
        self.blobs.read().contains_key(key)
    }

    fn list(&self) -> Result<Vec<Hash32>, CasError> {
        Ok(self.blobs.read().keys().copied().collect())
    }

    fn remove(&self, key: &Hash32) -> Result<bool, CasError> {
        Ok(self.blobs.write().remove(key).is_some())
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Filesystem store laid out as `<root>/<first byte hex>/<full hex>`.
#[derive(Debug, Clone)]
pub struct FsCas {
    root: PathBuf,
}

impl FsCas {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CasError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| CasError::Io(e.to_string()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &Hash32) -> PathBuf {
        let hex_key = hex::encode(key);
        self.root.join(&hex_key[..2]).join(hex_key)
    }
}

impl BlobStore for FsCas {
    fn put(&self, bytes: &[u8]) -> Result<Hash32, CasError> {
        let key = sha256(bytes);
        let path = self.blob_path(&key);
        if path.exists() {
            return Ok(key);
        }
        let dir = path
            .parent()
            .ok_or_else(|| CasError::Io("blob path has no parent".to_string()))?;
        fs::create_dir_all(dir).map_err(|e| CasError::Io(e.to_string()))?;
        let tmp = dir.join(format!(
            ".{}.tmp-{}-{}",
            hex::encode(key),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, bytes).map_err(|e| CasError::Io(e.to_string()))?;
        // Concurrent writers of the same content race to an identical file.
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            if !path.exists() {
                return Err(CasError::Io(err.to_string()));
            }
        }
        Ok(key)
    }

    fn get(&self, key: &Hash32) -> Result<Vec<u8>, CasError> {
        let path = self.blob_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CasError::NotFound(hex::encode(key)))
            }
            Err(e) => return Err(CasError::Io(e.to_string())),
        };
        check_integrity(key, &bytes)?;
        Ok(bytes)
    }

    fn contains(&self, key: &Hash32) -> bool {
        self.blob_path(key).is_file()
    }

    fn list(&self) -> Result<Vec<Hash32>, CasError> {
        let mut keys = Vec::new();
        let shards = fs::read_dir(&self.root).map_err(|e| CasError::Io(e.to_string()))?;
        for shard in shards {
            let shard = shard.map_err(|e| CasError::Io(e.to_string()))?;
            if !shard.path().is_dir() {
                continue;
            }
            let entries = fs::read_dir(shard.path()).map_err(|e| CasError::Io(e.to_string()))?;
            for entry in entries {
                let entry = entry.map_err(|e| CasError::Io(e.to_string()))?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if let Ok(key) = parse_hash32(name) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn remove(&self, key: &Hash32) -> Result<bool, CasError> {
        match fs::remove_file(self.blob_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CasError::Io(e.to_string())),
        }
    }
}

/// Store that reads through to `base` but keeps its own writes in memory.
/// Verification and read-only runs use it so they never mutate the real store.
/// Written blobs are always held in scratch, so a damaged copy of the same key
/// in `base` never shadows a freshly computed one.
pub struct OverlayCas {
    base: Arc<dyn BlobStore>,
    scratch: MemoryCas,
}

impl OverlayCas {
    pub fn new(base: Arc<dyn BlobStore>) -> Self {
        Self {
            base,
            scratch: MemoryCas::new(),
        }
    }

    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }
}

impl BlobStore for OverlayCas {
    fn put(&self, bytes: &[u8]) -> Result<Hash32, CasError> {
        self.scratch.put(bytes)
    }

    fn get(&self, key: &Hash32) -> Result<Vec<u8>, CasError> {
        if self.scratch.contains(key) {
            return self.scratch.get(key);
        }
        self.base.get(key)
    }

    fn contains(&self, key: &Hash32) -> bool {
        self.scratch.contains(key) || self.base.contains(key)
    }

    fn list(&self) -> Result<Vec<Hash32>, CasError> {
        let mut keys: BTreeSet<Hash32> = self.base.list()?.into_iter().collect();
        keys.extend(self.scratch.list()?);
        Ok(keys.into_iter().collect())
    }

    fn remove(&self, key: &Hash32) -> Result<bool, CasError> {
        self.scratch.remove(key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub scanned: usize,
    pub retained: usize,
    pub removed: Vec<String>,
}

/// Deletes every blob not in `live`. Callers compute `live` from the blobs
/// referenced by manifests and installed policy modules.
pub fn collect_garbage(
    store: &dyn BlobStore,
    live: &BTreeSet<Hash32>,
) -> Result<GcReport, CasError> {
    let mut report = GcReport::default();
    for key in store.list()? {
        report.scanned += 1;
        if live.contains(&key) {
            report.retained += 1;
            continue;
        }
        if store.remove(&key)? {
            report.removed.push(hex::encode(key));
        }
    }
    tracing::info!(
        target: "pcq.cas",
        scanned = report.scanned,
        removed = report.removed.len(),
        "cas garbage collection finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_idempotent_and_keyed_by_content() {
        let cas = MemoryCas::new();
        let a = cas.put(b"rows").unwrap();
        let b = cas.put(b"rows").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, sha256(b"rows"));
        assert_eq!(cas.len(), 1);
        assert_eq!(cas.get(&a).unwrap(), b"rows");
    }

    #[test]
    fn corrupted_memory_blob_is_reported() {
        let cas = MemoryCas::new();
        let key = cas.put(b"original").unwrap();
        cas.corrupt(&key, b"tampered");
        assert!(matches!(cas.get(&key), Err(CasError::Corrupt { .. })));
    }

    #[test]
    fn missing_blob_is_not_found() {
        let cas = MemoryCas::new();
        assert!(matches!(
            cas.get(&sha256(b"nope")),
            Err(CasError::NotFound(_))
        ));
    }

    #[test]
    fn fs_store_round_trips_and_detects_tamper() {
        let dir = tempfile::tempdir().unwrap();
        let cas = FsCas::open(dir.path().join("cas")).unwrap();
        let key = cas.put(b"hello").unwrap();
        assert!(cas.contains(&key));
        assert_eq!(cas.put(b"hello").unwrap(), key);
        assert_eq!(cas.get(&key).unwrap(), b"hello");
        assert_eq!(cas.list().unwrap(), vec![key]);

        fs::write(cas.blob_path(&key), b"HELLO").unwrap();
        assert!(matches!(cas.get(&key), Err(CasError::Corrupt { .. })));
    }

    #[test]
    fn fs_store_ignores_temp_files_when_listing() {
        let dir = tempfile::tempdir().unwrap();
        let cas = FsCas::open(dir.path()).unwrap();
        let key = cas.put(b"x").unwrap();
        let shard = cas.blob_path(&key).parent().unwrap().to_path_buf();
        fs::write(shard.join(".stray.tmp-1-1"), b"junk").unwrap();
        assert_eq!(cas.list().unwrap(), vec![key]);
    }

    #[test]
    fn overlay_writes_do_not_reach_base() {
        let base: Arc<dyn BlobStore> = Arc::new(MemoryCas::new());
        let existing = base.put(b"base").unwrap();
        let overlay = OverlayCas::new(base.clone());
        let added = overlay.put(b"scratch").unwrap();
        assert_eq!(overlay.put(b"base").unwrap(), existing);
        assert_eq!(overlay.scratch_len(), 2);
        assert!(overlay.contains(&added));
        assert!(!base.contains(&added));
        assert_eq!(overlay.get(&existing).unwrap(), b"base");
    }

    #[test]
    fn gc_keeps_live_blobs_only() {
        let cas = MemoryCas::new();
        let keep = cas.put(b"keep").unwrap();
        let drop = cas.put(b"drop").unwrap();
        let live: BTreeSet<Hash32> = [keep].into_iter().collect();
        let report = collect_garbage(&cas, &live).unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed, vec![hex::encode(drop)]);
        assert!(cas.contains(&keep));
        assert!(!cas.contains(&drop));
    }

    #[test]
    fn json_helpers_store_canonical_form() {
        let cas = MemoryCas::new();
        let v = serde_json::json!({"b": 1, "a": [2, 3]});
        let key = put_json(&cas, &v).unwrap();
        assert_eq!(cas.get(&key).unwrap(), br#"{"a":[2,3],"b":1}"#);
        let back: serde_json::Value = get_json(&cas, &key).unwrap();
        assert_eq!(back, v);
    }
}
