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

//! Installed policy modules and the per-tenant active mapping.
//!
//! Module bytes live in the CAS. The store keeps one metadata file per
//! installed module and `active_map.json`, which names the active module of
//! each tenant and the modules it replaced. Retired modules are never deleted;
//! old manifests cite them by hash and must stay verifiable.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::bytecode::{DecodeError, PolicyModule};
use crate::cas::{BlobStore, CasError};
use crate::digest::{parse_hash32, Hash32};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("policy store io error: {0}")]
    Io(String),
    #[error(transparent)]
    Cas(#[from] CasError),
    #[error("policy module does not decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("policy module {0} is not installed")]
    NotInstalled(String),
    #[error("policy module {0} is unknown")]
    UnknownModule(String),
    #[error("module belongs to tenant `{module_tenant}`, not `{tenant}`")]
    TenantMismatch {
        tenant: String,
        module_tenant: String,
    },
    #[error("version {candidate} does not increase on active version {active}")]
    VersionNotMonotonic { active: u64, candidate: u64 },
    #[error("policy store metadata is corrupt: {0}")]
    Corrupt(String),
}

/// Looks up compiled modules by hash. Verification and simulation take this
/// rather than a concrete store.
pub trait ModuleResolver: Send + Sync {
    fn resolve(&self, module_hash: &Hash32) -> Result<Arc<PolicyModule>, StoreError>;
}

/// In-memory resolver.
#[derive(Debug, Default, Clone)]
pub struct ModuleSet {
    modules: BTreeMap<Hash32, Arc<PolicyModule>>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module: Arc<PolicyModule>) {
        self.modules.insert(module.module_hash, module);
    }

    pub fn with(mut self, module: Arc<PolicyModule>) -> Self {
        self.insert(module);
        self
    }
}

impl ModuleResolver for ModuleSet {
    fn resolve(&self, module_hash: &Hash32) -> Result<Arc<PolicyModule>, StoreError> {
        self.modules
            .get(module_hash)
            .cloned()
            .ok_or_else(|| StoreError::UnknownModule(hex::encode(module_hash)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSummary {
    pub module_hash: String,
    pub name: String,
    pub tenant: String,
    pub version: u64,
    pub compiled_at: u64,
}

impl ModuleSummary {
    fn of(module: &PolicyModule) -> Self {
        Self {
            module_hash: hex::encode(module.module_hash),
            name: module.name.clone(),
            tenant: module.tenant.clone(),
            version: module.version,
            compiled_at: module.compiled_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ActiveMappings {
    mappings: Vec<ActiveMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActiveMapping {
    tenant: String,
    module_hash_hex: String,
    version: u64,
    #[serde(default)]
    retired: Vec<RetiredModule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredModule {
    pub module_hash_hex: String,
    pub version: u64,
}

const ACTIVE_MAP_FILE: &str = "active_map.json";

pub struct PolicyStore {
    dir: PathBuf,
    active_map_file: PathBuf,
    cas: Arc<dyn BlobStore>,
    map_lock: Mutex<()>,
}

fn io(err: std::io::Error) -> StoreError {
    StoreError::Io(err.to_string())
}

impl PolicyStore {
    pub fn open(data_dir: &Path, cas: Arc<dyn BlobStore>) -> Result<Self, StoreError> {
        let dir = data_dir.join("policy");
        fs::create_dir_all(&dir).map_err(io)?;
        let active_map_file = dir.join(ACTIVE_MAP_FILE);
        if !active_map_file.exists() {
            let bytes = serde_json::to_vec(&ActiveMappings::default())
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            fs::write(&active_map_file, bytes).map_err(io)?;
        }
        Ok(Self {
            dir,
            active_map_file,
            cas,
            map_lock: Mutex::new(()),
        })
    }

    fn summary_path(&self, module_hash: &Hash32) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(module_hash)))
    }

    /// Stores the module bytes and records its metadata. Installing an
    /// already-installed module is a no-op.
    pub fn install(&self, module: &PolicyModule) -> Result<Hash32, StoreError> {
        let key = self.cas.put(module.bytes())?;
        let path = self.summary_path(&key);
        if !path.exists() {
            let bytes = serde_json::to_vec_pretty(&ModuleSummary::of(module))
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            fs::write(path, bytes).map_err(io)?;
        }
        tracing::info!(
            target: "pcq.policy",
            module_hash = %hex::encode(key),
            tenant = %module.tenant,
            version = module.version,
            "installed policy module"
        );
        Ok(key)
    }

    fn summary(&self, module_hash: &Hash32) -> Result<ModuleSummary, StoreError> {
        let bytes = match fs::read(self.summary_path(module_hash)) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotInstalled(hex::encode(module_hash)))
            }
            Err(e) => return Err(io(e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    pub fn get(&self, module_hash: &Hash32) -> Result<PolicyModule, StoreError> {
        let summary = self.summary(module_hash)?;
        let bytes = self.cas.get(module_hash)?;
        Ok(PolicyModule::from_bytes(&bytes)?.with_compiled_at(summary.compiled_at))
    }

    pub fn list(&self) -> Result<Vec<ModuleSummary>, StoreError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io)? {
            let path = entry.map_err(io)?.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(ACTIVE_MAP_FILE) {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).map_err(io)?;
            let summary: ModuleSummary =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            out.push(summary);
        }
        out.sort_by(|a, b| {
            a.tenant
                .cmp(&b.tenant)
                .then_with(|| a.version.cmp(&b.version))
                .then_with(|| a.module_hash.cmp(&b.module_hash))
        });
        Ok(out)
    }

    pub fn active_for(&self, tenant: &str) -> Result<Option<Hash32>, StoreError> {
        let mappings = self.read_mappings()?;
        mappings
            .mappings
            .iter()
            .find(|m| m.tenant == tenant)
            .map(|m| parse_hash32(&m.module_hash_hex).map_err(StoreError::Corrupt))
            .transpose()
    }

    pub fn active_module(&self, tenant: &str) -> Result<Option<PolicyModule>, StoreError> {
        self.active_for(tenant)?.map(|h| self.get(&h)).transpose()
    }

    pub fn retired_for(&self, tenant: &str) -> Result<Vec<RetiredModule>, StoreError> {
        Ok(self
            .read_mappings()?
            .mappings
            .into_iter()
            .find(|m| m.tenant == tenant)
            .map(|m| m.retired)
            .unwrap_or_default())
    }

    /// Makes an installed module the tenant's active policy. The version must
    /// be strictly greater than the current active version.
    pub fn activate(&self, tenant: &str, module_hash: &Hash32) -> Result<(), StoreError> {
        let summary = self.summary(module_hash)?;
        if summary.tenant != tenant {
            return Err(StoreError::TenantMismatch {
                tenant: tenant.to_string(),
                module_tenant: summary.tenant,
            });
        }
        let _guard = self.map_lock.lock();
        let mut mappings = self.read_mappings()?;
        let hash_hex = hex::encode(module_hash);
        if let Some(m) = mappings.mappings.iter_mut().find(|m| m.tenant == tenant) {
            if summary.version <= m.version {
                return Err(StoreError::VersionNotMonotonic {
                    active: m.version,
                    candidate: summary.version,
                });
            }
            m.retired.push(RetiredModule {
                module_hash_hex: std::mem::replace(&mut m.module_hash_hex, hash_hex.clone()),
                version: m.version,
            });
            m.version = summary.version;
        } else {
            mappings.mappings.push(ActiveMapping {
                tenant: tenant.to_string(),
                module_hash_hex: hash_hex.clone(),
                version: summary.version,
                retired: Vec::new(),
            });
        }
        mappings.mappings.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        self.write_mappings(&mappings)?;
        tracing::info!(
            target: "pcq.policy",
            tenant,
            module_hash = %hash_hex,
            version = summary.version,
            "activated policy module"
        );
        Ok(())
    }

    /// Hashes of every installed module. Used as GC roots.
    pub fn installed_hashes(&self) -> Result<Vec<Hash32>, StoreError> {
        self.list()?
            .iter()
            .map(|s| parse_hash32(&s.module_hash).map_err(StoreError::Corrupt))
            .collect()
    }

    fn read_mappings(&self) -> Result<ActiveMappings, StoreError> {
        let bytes = fs::read(&self.active_map_file).map_err(io)?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn write_mappings(&self, mappings: &ActiveMappings) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec_pretty(mappings).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tmp = self.dir.join(format!("{ACTIVE_MAP_FILE}.tmp"));
        fs::write(&tmp, bytes).map_err(io)?;
        fs::rename(&tmp, &self.active_map_file).map_err(io)
    }
}

impl ModuleResolver for PolicyStore {
    fn resolve(&self, module_hash: &Hash32) -> Result<Arc<PolicyModule>, StoreError> {
        match self.get(module_hash) {
            Ok(m) => Ok(Arc::new(m)),
            // Manifests may cite modules that were stored but never installed.
            Err(StoreError::NotInstalled(_)) => {
                let bytes = self.cas.get(module_hash)?;
                Ok(Arc::new(PolicyModule::from_bytes(&bytes)?))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::FsCas;
    use crate::policy::compile_source;

    fn module(version: u64, tenant: &str) -> PolicyModule {
        compile_source(
            &format!(
                "lac v1; policy \"p\" tenant \"{tenant}\" version {version}; grant g {{ allow: read; }}"
            ),
            1_700_000_000 + version,
        )
        .unwrap()
    }

    fn open(dir: &Path) -> PolicyStore {
        let cas: Arc<dyn BlobStore> = Arc::new(FsCas::open(dir.join("cas")).unwrap());
        PolicyStore::open(dir, cas).unwrap()
    }

    #[test]
    fn activation_is_monotonic_and_retires_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let v1 = module(1, "acme");
        let v2 = module(2, "acme");
        let h1 = store.install(&v1).unwrap();
        let h2 = store.install(&v2).unwrap();

        assert_eq!(store.active_for("acme").unwrap(), None);
        store.activate("acme", &h1).unwrap();
        store.activate("acme", &h2).unwrap();
        assert_eq!(store.active_for("acme").unwrap(), Some(h2));
        assert_eq!(
            store.retired_for("acme").unwrap(),
            vec![RetiredModule {
                module_hash_hex: hex::encode(h1),
                version: 1
            }]
        );
        assert_eq!(
            store.activate("acme", &h1),
            Err(StoreError::VersionNotMonotonic {
                active: 2,
                candidate: 1
            })
        );
        // Retired modules stay resolvable.
        assert_eq!(store.resolve(&h1).unwrap().version, 1);
    }

    #[test]
    fn get_restores_compiled_at_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let h = {
            let store = open(dir.path());
            let h = store.install(&module(3, "acme")).unwrap();
            store.activate("acme", &h).unwrap();
            h
        };
        let store = open(dir.path());
        let m = store.get(&h).unwrap();
        assert_eq!(m.compiled_at, 1_700_000_003);
        assert_eq!(store.active_module("acme").unwrap().unwrap().module_hash, h);
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.installed_hashes().unwrap(), vec![h]);
    }

    #[test]
    fn tenants_cannot_activate_foreign_modules() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        let h = store.install(&module(1, "globex")).unwrap();
        assert!(matches!(
            store.activate("acme", &h),
            Err(StoreError::TenantMismatch { .. })
        ));
        assert!(matches!(
            store.activate("acme", &[0u8; 32]),
            Err(StoreError::NotInstalled(_))
        ));
    }

    #[test]
    fn module_set_resolves_by_hash() {
        let m = Arc::new(module(1, "acme"));
        let set = ModuleSet::new().with(m.clone());
        assert_eq!(set.resolve(&m.module_hash).unwrap().version, 1);
        assert!(matches!(
            set.resolve(&[1u8; 32]),
            Err(StoreError::UnknownModule(_))
        ));
    }
}
