// Copyright (c) 2026 Joseph Verdicchio and PCQ Contributors
// SPDX-License-Identifier: Apache-2.0

//! pcq-verifier
//!
//! Portable checks for PCQ manifests: RFC 6962-style Merkle hashing, inclusion
//! proof verification and the manifest signature transcript. Nothing here needs
//! the execution engine, so external auditors can parse a manifest and check its
//! proofs and signature with this crate alone.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub type Hash32 = [u8; 32];

pub const MANIFEST_FORMAT_V1: &str = "pcq.manifest.v1";
const DOMAIN_MANIFEST_V1: &[u8] = b"pcq:manifest:v1";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TranscriptError {
    #[error("manifest json is malformed: {0}")]
    Malformed(String),
    #[error("unsupported manifest format {0}")]
    UnsupportedFormat(String),
    #[error("hex field {field} is not a 32-byte hash")]
    InvalidHash { field: &'static str },
    #[error("manifest signature must be 64 bytes")]
    InvalidSignature,
    #[error("verifying key must be 32 bytes")]
    InvalidVerifyingKey,
    #[error("signer key id does not match the supplied verifying key")]
    SignerMismatch,
    #[error("merkle proof for leaf {leaf_index} does not verify")]
    ProofMismatch { leaf_index: u64 },
    #[error("merkle proofs are not indexed 0..{expected}")]
    ProofIndexing { expected: u64 },
    #[error("signature verification failed")]
    SignatureVerification,
}

pub fn sha256(bytes: &[u8]) -> Hash32 {
    let mut h = Sha256::new();
    h.update(bytes);
    h.finalize().into()
}

pub fn sha256_domain(domain: &[u8], payload: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(payload);
    hasher.finalize().into()
}

pub fn leaf_hash(data: &[u8]) -> Hash32 {
    let mut buf = Vec::with_capacity(1 + data.len());
    buf.push(0u8);
    buf.extend_from_slice(data);
    sha256(&buf)
}

pub fn node_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut buf = [0u8; 65];
    buf[0] = 1;
    buf[1..33].copy_from_slice(left);
    buf[33..65].copy_from_slice(right);
    sha256(&buf)
}

pub(crate) fn largest_power_of_two_less_than(n: usize) -> usize {
    debug_assert!(n > 1);
    1usize << (usize::BITS - 1 - (n - 1).leading_zeros())
}

/// Merkle tree hash over already-hashed leaves.
pub fn merkle_root(leaves: &[Hash32]) -> Hash32 {
    match leaves.len() {
        0 => sha256(b""),
        1 => leaves[0],
        n => {
            let k = largest_power_of_two_less_than(n);
            let left = merkle_root(&leaves[..k]);
            let right = merkle_root(&leaves[k..]);
            node_hash(&left, &right)
        }
    }
}

pub fn verify_inclusion_proof_ct(
    leaf_hash: &Hash32,
    leaf_index: usize,
    tree_size: usize,
    audit_path: &[Hash32],
    root: &Hash32,
) -> bool {
    if tree_size == 0 || leaf_index >= tree_size {
        return false;
    }

    let mut fn_idx = leaf_index;
    let mut sn_idx = tree_size - 1;
    let mut path_pos = 0usize;
    let mut hash = *leaf_hash;

    while sn_idx > 0 {
        if fn_idx % 2 == 1 {
            let Some(sibling) = audit_path.get(path_pos) else {
                return false;
            };
            hash = node_hash(sibling, &hash);
            path_pos += 1;
        } else if fn_idx < sn_idx {
            let Some(sibling) = audit_path.get(path_pos) else {
                return false;
            };
            hash = node_hash(&hash, sibling);
            path_pos += 1;
        }

        fn_idx /= 2;
        sn_idx /= 2;
    }

    path_pos == audit_path.len() && &hash == root
}

pub fn verify_inclusion_proof(
    proof: &[Hash32],
    leaf: &Hash32,
    leaf_index: usize,
    tree_size: usize,
    root: &Hash32,
) -> bool {
    verify_inclusion_proof_ct(leaf, leaf_index, tree_size, proof, root)
}

/// Digest signed by the manifest writer: binds the leaf count and the root.
pub fn manifest_signature_digest(leaf_count: u64, root: &Hash32) -> Hash32 {
    let mut payload = Vec::with_capacity(40);
    payload.extend_from_slice(&leaf_count.to_be_bytes());
    payload.extend_from_slice(root);
    sha256_domain(DOMAIN_MANIFEST_V1, &payload)
}

/// Key ids are the hex SHA-256 of the raw 32-byte verifying key.
pub fn key_id_for(verifying_key: &[u8; 32]) -> String {
    hex::encode(sha256(verifying_key))
}

pub fn verify_manifest_signature(
    leaf_count: u64,
    root: &Hash32,
    signature: &[u8],
    key_bytes: &[u8],
) -> Result<(), TranscriptError> {
    let signature =
        Signature::from_slice(signature).map_err(|_| TranscriptError::InvalidSignature)?;
    let key_arr: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| TranscriptError::InvalidVerifyingKey)?;
    let key =
        VerifyingKey::from_bytes(&key_arr).map_err(|_| TranscriptError::InvalidVerifyingKey)?;
    let digest = manifest_signature_digest(leaf_count, root);
    key.verify(&digest, &signature)
        .map_err(|_| TranscriptError::SignatureVerification)
}

pub fn decode_hash32(field: &'static str, value: &str) -> Result<Hash32, TranscriptError> {
    let bytes = hex::decode(value).map_err(|_| TranscriptError::InvalidHash { field })?;
    bytes
        .try_into()
        .map_err(|_| TranscriptError::InvalidHash { field })
}

/// Wire form of one leaf's inclusion proof inside a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProofV1 {
    pub node_id: String,
    pub leaf_index: u64,
    pub leaf_hash: String,
    pub audit_path: Vec<String>,
}

impl MerkleProofV1 {
    pub fn verify(&self, tree_size: u64, root: &Hash32) -> Result<(), TranscriptError> {
        let leaf = decode_hash32("leaf_hash", &self.leaf_hash)?;
        let path = self
            .audit_path
            .iter()
            .map(|h| decode_hash32("audit_path", h))
            .collect::<Result<Vec<_>, _>>()?;
        if verify_inclusion_proof_ct(
            &leaf,
            self.leaf_index as usize,
            tree_size as usize,
            &path,
            root,
        ) {
            Ok(())
        } else {
            Err(TranscriptError::ProofMismatch {
                leaf_index: self.leaf_index,
            })
        }
    }
}

/// The engine-independent subset of a manifest. Attestation bodies are kept as
/// opaque JSON so this view parses any manifest the engine writes.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEnvelope {
    pub format: String,
    pub manifest_id: String,
    #[serde(default)]
    pub node_attestations: Vec<Value>,
    pub merkle_proofs: Vec<MerkleProofV1>,
    pub signature: String,
    pub signer_key_id: String,
    pub created_at: u64,
}

impl ManifestEnvelope {
    pub fn from_json(bytes: &[u8]) -> Result<Self, TranscriptError> {
        let envelope: Self = serde_json::from_slice(bytes)
            .map_err(|err| TranscriptError::Malformed(err.to_string()))?;
        if envelope.format != MANIFEST_FORMAT_V1 {
            return Err(TranscriptError::UnsupportedFormat(envelope.format));
        }
        Ok(envelope)
    }

    pub fn root(&self) -> Result<Hash32, TranscriptError> {
        decode_hash32("manifest_id", &self.manifest_id)
    }

    /// Checks that the proofs cover leaves `0..n`, that every proof folds to the
    /// root, that the root equals the root recomputed from the proof leaves and
    /// that the signature verifies under `key_bytes`.
    pub fn verify_with_key(&self, key_bytes: &[u8]) -> Result<(), TranscriptError> {
        let root = self.root()?;
        let tree_size = self.merkle_proofs.len() as u64;
        let mut leaves = Vec::with_capacity(self.merkle_proofs.len());
        for (idx, proof) in self.merkle_proofs.iter().enumerate() {
            if proof.leaf_index != idx as u64 {
                return Err(TranscriptError::ProofIndexing {
                    expected: tree_size,
                });
            }
            proof.verify(tree_size, &root)?;
            leaves.push(decode_hash32("leaf_hash", &proof.leaf_hash)?);
        }
        if merkle_root(&leaves) != root {
            return Err(TranscriptError::ProofMismatch { leaf_index: 0 });
        }

        let key_arr: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| TranscriptError::InvalidVerifyingKey)?;
        if key_id_for(&key_arr) != self.signer_key_id {
            return Err(TranscriptError::SignerMismatch);
        }
        let signature =
            hex::decode(&self.signature).map_err(|_| TranscriptError::InvalidSignature)?;
        verify_manifest_signature(tree_size, &root, &signature, key_bytes)
    }
}

fn sort_json(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, val) in entries {
                sorted.insert(k, sort_json(val));
            }
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json).collect()),
        other => other,
    }
}

pub fn canonical_json(v: &impl Serialize) -> serde_json::Result<Vec<u8>> {
    let value = serde_json::to_value(v)?;
    let sorted = sort_json(value);
    serde_json::to_vec(&sorted)
}
