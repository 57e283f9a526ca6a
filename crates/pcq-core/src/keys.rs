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

//! Signing key loading and the trusted verifier key ring.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use pcq_verifier::key_id_for;

pub const KEY_PROVIDER_ENV: &str = "PCQ_KEY_PROVIDER";
pub const SIGNING_KEY_HEX_ENV: &str = "PCQ_SIGNING_KEY_HEX";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("invalid key provider {0:?}; expected file or env")]
    InvalidProvider(String),
    #[error("{0} is not set")]
    MissingEnv(&'static str),
    #[error("signing key file {path} could not be read: {reason}")]
    Io { path: String, reason: String },
    #[error("key material must be 32 raw bytes or 64 hex characters")]
    InvalidKeyMaterial,
    #[error("verifying key {0} is not a valid ed25519 point")]
    InvalidVerifyingKey(String),
    #[error("key ring is malformed: {0}")]
    MalformedKeyRing(String),
    #[error("key id {listed} does not match its key (expected {derived})")]
    KeyIdMismatch { listed: String, derived: String },
}

/// Where the tenant signing key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningKeySource {
    File(PathBuf),
    Env,
}

impl SigningKeySource {
    pub fn from_env(default_path: impl AsRef<Path>) -> Result<Self, KeyError> {
        Self::from_lookup(default_path, |k| std::env::var(k).ok())
    }

    pub fn from_lookup(
        default_path: impl AsRef<Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, KeyError> {
        match lookup(KEY_PROVIDER_ENV) {
            None => Ok(Self::File(default_path.as_ref().to_path_buf())),
            Some(v) if v.eq_ignore_ascii_case("file") => {
                Ok(Self::File(default_path.as_ref().to_path_buf()))
            }
            Some(v) if v.eq_ignore_ascii_case("env") => Ok(Self::Env),
            Some(other) => Err(KeyError::InvalidProvider(other)),
        }
    }

    pub fn load(&self) -> Result<SigningKey, KeyError> {
        self.load_with(|k| std::env::var(k).ok())
    }

    pub fn load_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<SigningKey, KeyError> {
        match self {
            Self::File(path) => load_signing_key_file(path),
            Self::Env => {
                let raw = lookup(SIGNING_KEY_HEX_ENV).ok_or(KeyError::MissingEnv(SIGNING_KEY_HEX_ENV))?;
                signing_key_from_material(raw.as_bytes())
            }
        }
    }
}

fn signing_key_from_material(material: &[u8]) -> Result<SigningKey, KeyError> {
    let seed: [u8; 32] = if material.len() == 32 {
        material.try_into().map_err(|_| KeyError::InvalidKeyMaterial)?
    } else {
        let text = std::str::from_utf8(material).map_err(|_| KeyError::InvalidKeyMaterial)?;
        hex::decode(text.trim())
            .map_err(|_| KeyError::InvalidKeyMaterial)?
            .try_into()
            .map_err(|_| KeyError::InvalidKeyMaterial)?
    };
    Ok(SigningKey::from_bytes(&seed))
}

pub fn load_signing_key_file(path: &Path) -> Result<SigningKey, KeyError> {
    let bytes = fs::read(path).map_err(|e| KeyError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    signing_key_from_material(&bytes)
}

/// Generates a fresh key and writes its seed as hex to `path`.
pub fn generate_signing_key_file(path: &Path) -> Result<SigningKey, KeyError> {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let key = SigningKey::from_bytes(&seed);
    let io_err = |e: std::io::Error| KeyError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, hex::encode(seed)).map_err(io_err)?;
    Ok(key)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyRingFile {
    keys: BTreeMap<String, String>,
}

/// Verifying keys trusted by a verifier, indexed by key id.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: BTreeMap<String, VerifyingKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: VerifyingKey) -> String {
        let kid = key_id_for(key.as_bytes());
        self.keys.insert(kid.clone(), key);
        kid
    }

    pub fn with(mut self, key: VerifyingKey) -> Self {
        self.insert(key);
        self
    }

    pub fn get(&self, key_id: &str) -> Option<&VerifyingKey> {
        self.keys.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Parses `{"keys": {"<key_id>": "<pubkey_hex>"}}`. Every listed id must
    /// match the key it names.
    pub fn from_json(bytes: &[u8]) -> Result<Self, KeyError> {
        let file: KeyRingFile =
            serde_json::from_slice(bytes).map_err(|e| KeyError::MalformedKeyRing(e.to_string()))?;
        let mut ring = Self::new();
        for (listed, key_hex) in file.keys {
            let raw: [u8; 32] = hex::decode(&key_hex)
                .ok()
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| KeyError::InvalidVerifyingKey(key_hex.clone()))?;
            let key = VerifyingKey::from_bytes(&raw)
                .map_err(|_| KeyError::InvalidVerifyingKey(key_hex.clone()))?;
            let derived = ring.insert(key);
            if derived != listed {
                return Err(KeyError::KeyIdMismatch { listed, derived });
            }
        }
        Ok(ring)
    }

    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let bytes = fs::read(path).map_err(|e| KeyError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&bytes)
    }

    pub fn to_json(&self) -> Vec<u8> {
        let file = KeyRingFile {
            keys: self
                .keys
                .iter()
                .map(|(kid, key)| (kid.clone(), hex::encode(key.as_bytes())))
                .collect(),
        };
        serde_json::to_vec_pretty(&file).unwrap_or_default()
    }
}
