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

//! Signed, Merkle-proofed manifests over a run's attestations.
//!
//! Leaves are the attestations' [`Attestation::leaf_bytes`] in ascending node
//! id order, hashed as RFC 6962 leaves. The manifest id is the tree root and
//! the signature covers `H("pcq:manifest:v1" || leaf_count || root)`.

use std::collections::BTreeSet;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use pcq_verifier::{
    leaf_hash, manifest_signature_digest, merkle_root, verify_manifest_signature, MerkleProofV1,
    TranscriptError, MANIFEST_FORMAT_V1,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attestation::Attestation;
use crate::digest::{parse_hash32, Hash32};
use crate::keys::{key_id_for, KeyRing};
use crate::merkle::inclusion_proof;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("a manifest needs at least one attestation")]
    Empty,
    #[error("manifest json is malformed: {0}")]
    Malformed(String),
    #[error("unsupported manifest format {0}")]
    UnsupportedFormat(String),
    #[error("attestations are not in strictly ascending node id order at position {position}")]
    Unordered { position: usize },
    #[error("proof {position} does not belong to attestation {node_id}")]
    ProofMisaligned { position: usize, node_id: String },
    #[error("recomputed root {actual} does not match manifest id {expected}")]
    RootMismatch { expected: String, actual: String },
    #[error(transparent)]
    Transcript(#[from] TranscriptError),
    #[error("signer key {0} is not trusted")]
    UnknownSigner(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format: String,
    #[serde(with = "crate::digest::hex32")]
    pub manifest_id: Hash32,
    pub tenant: String,
    #[serde(default, with = "crate::digest::hex32_opt")]
    pub policy_module_hash: Option<Hash32>,
    pub node_attestations: Vec<Attestation>,
    pub merkle_proofs: Vec<MerkleProofV1>,
    /// Hex Ed25519 signature.
    pub signature: String,
    pub signer_key_id: String,
    pub created_at: u64,
}

impl Manifest {
    pub fn to_json(&self) -> Result<Vec<u8>, ManifestError> {
        serde_json::to_vec_pretty(self).map_err(|e| ManifestError::Malformed(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Self =
            serde_json::from_slice(bytes).map_err(|e| ManifestError::Malformed(e.to_string()))?;
        if manifest.format != MANIFEST_FORMAT_V1 {
            return Err(ManifestError::UnsupportedFormat(manifest.format));
        }
        Ok(manifest)
    }

    pub fn manifest_id_hex(&self) -> String {
        hex::encode(self.manifest_id)
    }

    pub fn leaves(&self) -> Vec<Hash32> {
        self.node_attestations
            .iter()
            .map(|a| leaf_hash(&a.leaf_bytes()))
            .collect()
    }

    pub fn recompute_root(&self) -> Hash32 {
        merkle_root(&self.leaves())
    }

    pub fn attestation(&self, node_id: &Hash32) -> Option<&Attestation> {
        self.node_attestations
            .binary_search_by(|a| a.node_id.cmp(node_id))
            .ok()
            .and_then(|i| self.node_attestations.get(i))
    }

    /// Checks ordering, recomputes the root from the attestations and checks
    /// every embedded proof against it. Does not look at the signature.
    pub fn check_structure(&self) -> Result<(), ManifestError> {
        if self.node_attestations.is_empty() {
            return Err(ManifestError::Empty);
        }
        if let Some(position) = self
            .node_attestations
            .windows(2)
            .position(|w| w[0].node_id >= w[1].node_id)
        {
            return Err(ManifestError::Unordered {
                position: position + 1,
            });
        }
        let leaves = self.leaves();
        let actual = merkle_root(&leaves);
        if actual != self.manifest_id {
            return Err(ManifestError::RootMismatch {
                expected: self.manifest_id_hex(),
                actual: hex::encode(actual),
            });
        }
        if self.merkle_proofs.len() != leaves.len() {
            return Err(TranscriptError::ProofIndexing {
                expected: leaves.len() as u64,
            }
            .into());
        }
        let tree_size = leaves.len() as u64;
        for (position, ((proof, leaf), att)) in self
            .merkle_proofs
            .iter()
            .zip(&leaves)
            .zip(&self.node_attestations)
            .enumerate()
        {
            let node_id = hex::encode(att.node_id);
            if proof.leaf_index != position as u64
                || proof.node_id != node_id
                || proof.leaf_hash != hex::encode(leaf)
            {
                return Err(ManifestError::ProofMisaligned { position, node_id });
            }
            proof.verify(tree_size, &self.manifest_id)?;
        }
        Ok(())
    }

    pub fn verify_signature(&self, keys: &KeyRing) -> Result<(), ManifestError> {
        let key = keys
            .get(&self.signer_key_id)
            .ok_or_else(|| ManifestError::UnknownSigner(self.signer_key_id.clone()))?;
        self.verify_signature_with(key)
    }

    pub fn verify_signature_with(&self, key: &VerifyingKey) -> Result<(), ManifestError> {
        if key_id_for(key.as_bytes()) != self.signer_key_id {
            return Err(TranscriptError::SignerMismatch.into());
        }
        let signature =
            hex::decode(&self.signature).map_err(|_| TranscriptError::InvalidSignature)?;
        verify_manifest_signature(
            self.node_attestations.len() as u64,
            &self.manifest_id,
            &signature,
            key.as_bytes(),
        )?;
        Ok(())
    }

    /// Every CAS blob this manifest cites: node inputs and outputs plus the
    /// policy modules its decisions were made under.
    pub fn referenced_blobs(&self) -> BTreeSet<Hash32> {
        let mut blobs = BTreeSet::new();
        blobs.extend(self.policy_module_hash);
        for att in &self.node_attestations {
            blobs.extend(att.input_hashes.iter().copied());
            blobs.insert(att.output_hash);
            blobs.extend(att.policy_decisions.iter().map(|d| d.module_hash));
        }
        blobs
    }
}

/// Holds a tenant's signing key.
pub struct ManifestSigner {
    key: SigningKey,
    key_id: String,
}

impl std::fmt::Debug for ManifestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl ManifestSigner {
    pub fn new(key: SigningKey) -> Self {
        let key_id = key_id_for(key.verifying_key().as_bytes());
        Self { key, key_id }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    fn sign(&self, leaf_count: u64, root: &Hash32) -> String {
        let digest = manifest_signature_digest(leaf_count, root);
        hex::encode(self.key.sign(&digest).to_bytes())
    }
}

/// Builds manifests. Writing has no side effects; persisting the result is up
/// to the caller.
#[derive(Debug)]
pub struct ManifestWriter {
    signer: ManifestSigner,
}

impl ManifestWriter {
    pub fn new(signer: ManifestSigner) -> Self {
        Self { signer }
    }

    pub fn signer(&self) -> &ManifestSigner {
        &self.signer
    }

    pub fn write(
        &self,
        tenant: &str,
        policy_module_hash: Option<Hash32>,
        mut attestations: Vec<Attestation>,
        created_at: u64,
    ) -> Result<Manifest, ManifestError> {
        if attestations.is_empty() {
            return Err(ManifestError::Empty);
        }
        attestations.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        if let Some(position) = attestations
            .windows(2)
            .position(|w| w[0].node_id == w[1].node_id)
        {
            return Err(ManifestError::Unordered {
                position: position + 1,
            });
        }
        let leaves: Vec<Hash32> = attestations
            .iter()
            .map(|a| leaf_hash(&a.leaf_bytes()))
            .collect();
        let root = merkle_root(&leaves);
        let mut merkle_proofs = Vec::with_capacity(leaves.len());
        for (idx, (leaf, att)) in leaves.iter().zip(&attestations).enumerate() {
            let path = inclusion_proof(&leaves, idx).unwrap_or_default();
            merkle_proofs.push(MerkleProofV1 {
                node_id: hex::encode(att.node_id),
                leaf_index: idx as u64,
                leaf_hash: hex::encode(leaf),
                audit_path: path.iter().map(hex::encode).collect(),
            });
        }
        let signature = self.signer.sign(leaves.len() as u64, &root);
        tracing::info!(
            target: "pcq.exec",
            manifest_id = %hex::encode(root),
            tenant,
            leaves = leaves.len(),
            signer = %self.signer.key_id,
            "manifest written"
        );
        Ok(Manifest {
            format: MANIFEST_FORMAT_V1.to_string(),
            manifest_id: root,
            tenant: tenant.to_string(),
            policy_module_hash,
            node_attestations: attestations,
            merkle_proofs,
            signature,
            signer_key_id: self.signer.key_id.clone(),
            created_at,
        })
    }
}

/// Parses a manifest id given as hex.
pub fn parse_manifest_id(raw: &str) -> Result<Hash32, ManifestError> {
    parse_hash32(raw).map_err(ManifestError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::tests::sample;
    use pcq_verifier::ManifestEnvelope;

    fn writer() -> ManifestWriter {
        ManifestWriter::new(ManifestSigner::new(SigningKey::from_bytes(&[5u8; 32])))
    }

    fn manifest(n: u8) -> Manifest {
        let atts = (0..n).map(|i| sample(i, i as u64)).collect();
        writer().write("acme", None, atts, 1_700_000_000).unwrap()
    }

    #[test]
    fn written_manifest_is_structurally_sound_and_signed() {
        for n in 1..=7 {
            let m = manifest(n);
            m.check_structure().unwrap();
            let ring = KeyRing::new().with(writer().signer().verifying_key());
            m.verify_signature(&ring).unwrap();
            assert_eq!(m.recompute_root(), m.manifest_id);
        }
    }

    #[test]
    fn json_round_trip_is_verifiable_by_the_standalone_verifier() {
        let m = manifest(5);
        let json = m.to_json().unwrap();
        assert_eq!(Manifest::from_json(&json).unwrap(), m);
        let envelope = ManifestEnvelope::from_json(&json).unwrap();
        envelope
            .verify_with_key(writer().signer().verifying_key().as_bytes())
            .unwrap();
    }

    #[test]
    fn tampered_attestation_breaks_the_root() {
        let mut m = manifest(4);
        m.node_attestations[2].output_hash[0] ^= 0xff;
        assert!(matches!(m.check_structure(), Err(ManifestError::RootMismatch { .. })));
    }

    #[test]
    fn reordered_attestations_are_rejected() {
        let mut m = manifest(3);
        m.node_attestations.swap(0, 1);
        assert!(matches!(m.check_structure(), Err(ManifestError::Unordered { .. })));
    }

    #[test]
    fn untrusted_or_wrong_signer_fails() {
        let m = manifest(2);
        assert!(matches!(
            m.verify_signature(&KeyRing::new()),
            Err(ManifestError::UnknownSigner(_))
        ));
        let other = SigningKey::from_bytes(&[6u8; 32]).verifying_key();
        assert_eq!(
            m.verify_signature_with(&other),
            Err(ManifestError::Transcript(TranscriptError::SignerMismatch))
        );
        let mut forged = m.clone();
        forged.signature = hex::encode([0u8; 64]);
        let ring = KeyRing::new().with(writer().signer().verifying_key());
        assert!(forged.verify_signature(&ring).is_err());
    }

    #[test]
    fn transcript_failures_clone_with_the_manifest_error() {
        let m = manifest(3);
        let other = SigningKey::from_bytes(&[9u8; 32]).verifying_key();
        let err = m.verify_signature_with(&other).unwrap_err();
        let copy = err.clone();
        assert_eq!(copy, err);
        assert!(matches!(copy, ManifestError::Transcript(TranscriptError::SignerMismatch)));
    }

    #[test]
    fn empty_and_duplicate_attestations_are_rejected() {
        assert_eq!(
            writer().write("acme", None, vec![], 0),
            Err(ManifestError::Empty)
        );
        let a = sample(1, 0);
        assert!(matches!(
            writer().write("acme", None, vec![a.clone(), a], 0),
            Err(ManifestError::Unordered { .. })
        ));
    }

    #[test]
    fn referenced_blobs_cover_inputs_and_outputs() {
        let m = manifest(3);
        let blobs = m.referenced_blobs();
        for att in &m.node_attestations {
            assert!(blobs.contains(&att.output_hash));
            assert!(att.input_hashes.iter().all(|h| blobs.contains(h)));
        }
    }
}
