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

//! Per-node execution evidence and the leaf encoding the manifest tree uses.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::digest::{canonical_json, sha256_domain, Hash32, DOMAIN_ATTESTATION_V1};
use crate::plan::NodeSpec;
use crate::policy::DecisionRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    #[serde(with = "crate::digest::hex32")]
    pub node_id: Hash32,
    pub logical_index: u64,
    pub node: NodeSpec,
    #[serde(with = "crate::digest::hex32_vec")]
    pub input_hashes: Vec<Hash32>,
    #[serde(with = "crate::digest::hex32")]
    pub params_hash: Hash32,
    #[serde(with = "crate::digest::hex32")]
    pub output_hash: Hash32,
    #[serde(with = "crate::digest::hex32")]
    pub checksum_root: Hash32,
    pub output_len: u64,
    pub attempts: u32,
    /// Informational only; never part of the leaf.
    pub wall_clock_duration_ms: u64,
    #[serde(default)]
    pub policy_decisions: Vec<DecisionRecord>,
}

/// The hashed view of an attestation.
#[derive(Serialize)]
struct LeafView<'a> {
    node_id: String,
    logical_index: u64,
    node: &'a NodeSpec,
    input_hashes: Vec<String>,
    params_hash: String,
    output_hash: String,
    checksum_root: String,
    output_len: u64,
    policy_decisions: &'a [DecisionRecord],
}

impl Attestation {
    /// Bytes committed to by the manifest tree. Timing and retry counts vary
    /// between otherwise identical runs and are left out.
    pub fn leaf_bytes(&self) -> Vec<u8> {
        let view = LeafView {
            node_id: hex::encode(self.node_id),
            logical_index: self.logical_index,
            node: &self.node,
            input_hashes: self.input_hashes.iter().map(hex::encode).collect(),
            params_hash: hex::encode(self.params_hash),
            output_hash: hex::encode(self.output_hash),
            checksum_root: hex::encode(self.checksum_root),
            output_len: self.output_len,
            policy_decisions: &self.policy_decisions,
        };
        let body = canonical_json(&view).unwrap_or_default();
        let mut out = Vec::with_capacity(DOMAIN_ATTESTATION_V1.len() + body.len());
        out.extend_from_slice(DOMAIN_ATTESTATION_V1);
        out.extend_from_slice(&body);
        out
    }

    /// Stable digest of the leaf bytes, handy for logs and diffs.
    pub fn digest(&self) -> Hash32 {
        sha256_domain(DOMAIN_ATTESTATION_V1, &self.leaf_bytes())
    }

    pub fn decision_ids(&self) -> impl Iterator<Item = &Hash32> {
        self.policy_decisions.iter().map(|d| &d.decision_id)
    }
}

/// Collects attestations from concurrently running nodes. Order of arrival is
/// irrelevant: [`AttestationRecorder::finish`] sorts by node id.
#[derive(Debug, Default)]
pub struct AttestationRecorder {
    records: Mutex<Vec<Attestation>>,
}

impl AttestationRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, attestation: Attestation) {
        tracing::debug!(
            target: "pcq.exec",
            node_id = %hex::encode(attestation.node_id),
            logical_index = attestation.logical_index,
            output_hash = %hex::encode(attestation.output_hash),
            "attestation recorded"
        );
        self.records.lock().push(attestation);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn finish(self) -> Vec<Attestation> {
        let mut records = self.records.into_inner();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }
}
