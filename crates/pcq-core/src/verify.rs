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

//! Independent replay verification of manifests.
//!
//! The verifier trusts nothing in the manifest it has not recomputed. It
//! rebuilds the DAG from the recorded node specs (so seeds come from the
//! manifest), re-runs it in replay mode against the original inputs and
//! compares every node. Each divergence is classified by origin so a failed
//! verification says whether the data, the policy module or the execution
//! order was at fault.

use std::sync::Arc;

use serde::Serialize;

use crate::attestation::Attestation;
use crate::cas::{BlobStore, CasError, OverlayCas};
use crate::config::EngineConfig;
use crate::digest::Hash32;
use crate::exec::{CancelToken, ExecutionError, ExecutionMode, ExecutionResult, Executor};
use crate::keys::KeyRing;
use crate::manifest::Manifest;
use crate::operators::numeric_value;
use crate::plan::Dag;
use crate::policy::{Attrs, ModuleResolver, PolicyGate};
use pcq_verifier::leaf_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceOrigin {
    Data,
    PolicyModule,
    ExecutionOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    NodeIdentity,
    Ordering,
    MerkleRoot,
    MerkleProof,
    Signature,
    Decision,
    StoredOutput,
    Replay,
    OutputHash,
    InputHashes,
    LogicalIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub check: CheckKind,
    pub origin: DivergenceOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    pub detail: String,
}

impl Divergence {
    fn manifest_wide(check: CheckKind, origin: DivergenceOrigin, detail: impl Into<String>) -> Self {
        Self {
            check,
            origin,
            node_id: None,
            node_name: None,
            logical_index: None,
            expected: None,
            actual: None,
            detail: detail.into(),
        }
    }

    fn at(att: &Attestation, check: CheckKind, origin: DivergenceOrigin, detail: impl Into<String>) -> Self {
        Self {
            check,
            origin,
            node_id: Some(hex::encode(att.node_id)),
            node_name: Some(att.node.name.clone()),
            logical_index: Some(att.logical_index),
            expected: None,
            actual: None,
            detail: detail.into(),
        }
    }

    fn values(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }
}

/// A node whose replayed output differed but stayed inside its declared band.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToleranceUse {
    pub node_id: String,
    pub node_name: String,
    pub tolerance: f64,
    pub recorded: f64,
    pub replayed: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub verdict: Verdict,
    pub manifest_id: String,
    pub recomputed_root: String,
    pub signer_key_id: String,
    pub signature_valid: bool,
    pub nodes_replayed: usize,
    pub decisions_reevaluated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_divergence: Option<Divergence>,
    pub divergences: Vec<Divergence>,
    pub tolerance_applied: Vec<ToleranceUse>,
}

impl VerificationReport {
    pub fn is_pass(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }
}

/// What the verifier replays against. `subject` and `context` default to the
/// parties recorded in the manifest's decisions.
pub struct OriginalInputs<'a> {
    pub blobs: Arc<dyn BlobStore>,
    pub policies: &'a dyn ModuleResolver,
    pub subject: Option<Attrs>,
    pub context: Option<Attrs>,
}

pub struct Verifier {
    keys: KeyRing,
    config: EngineConfig,
}

impl Verifier {
    pub fn new(keys: KeyRing, config: EngineConfig) -> Self {
        Self { keys, config }
    }

    pub fn verify(&self, manifest: &Manifest, inputs: &OriginalInputs<'_>) -> VerificationReport {
        let mut divergences = Vec::new();
        let mut tolerance_applied = Vec::new();

        check_identity(manifest, &mut divergences);
        check_ordering(manifest, &mut divergences);
        let recomputed_root = check_tree(manifest, &mut divergences);
        let signature_valid = match manifest.verify_signature(&self.keys) {
            Ok(()) => true,
            Err(e) => {
                divergences.push(Divergence::manifest_wide(
                    CheckKind::Signature,
                    DivergenceOrigin::Data,
                    e.to_string(),
                ));
                false
            }
        };
        let decisions_reevaluated = check_decisions(manifest, inputs.policies, &mut divergences);
        check_stored_outputs(manifest, inputs.blobs.as_ref(), &mut divergences);
        let nodes_replayed = self.replay(manifest, inputs, &mut divergences, &mut tolerance_applied);

        // Node-level findings sort by logical index; manifest-wide ones follow.
        divergences.sort_by_key(|d| d.logical_index.unwrap_or(u64::MAX));
        let verdict = if divergences.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Fail
        };
        let report = VerificationReport {
            verdict,
            manifest_id: manifest.manifest_id_hex(),
            recomputed_root: hex::encode(recomputed_root),
            signer_key_id: manifest.signer_key_id.clone(),
            signature_valid,
            nodes_replayed,
            decisions_reevaluated,
            first_divergence: divergences.first().cloned(),
            divergences,
            tolerance_applied,
        };
        match &report.first_divergence {
            None => tracing::info!(
                target: "pcq.verify",
                manifest_id = %report.manifest_id,
                nodes = report.nodes_replayed,
                tolerance_uses = report.tolerance_applied.len(),
                "manifest verified"
            ),
            Some(first) => tracing::error!(
                target: "pcq.verify",
                manifest_id = %report.manifest_id,
                divergences = report.divergences.len(),
                first_check = ?first.check,
                origin = ?first.origin,
                node = first.node_name.as_deref().unwrap_or("-"),
                "tamper alarm: manifest failed verification"
            ),
        }
        report
    }

    fn replay(
        &self,
        manifest: &Manifest,
        inputs: &OriginalInputs<'_>,
        divergences: &mut Vec<Divergence>,
        tolerance_applied: &mut Vec<ToleranceUse>,
    ) -> usize {
        let specs = manifest
            .node_attestations
            .iter()
            .map(|a| a.node.clone())
            .collect();
        let dag = match Dag::from_nodes(specs) {
            Ok(dag) => dag,
            Err(e) => {
                divergences.push(Divergence::manifest_wide(
                    CheckKind::Replay,
                    DivergenceOrigin::Data,
                    format!("recorded nodes do not form a valid plan: {e}"),
                ));
                return 0;
            }
        };

        for att in &manifest.node_attestations {
            let recomputed = att.node.node_id();
            if let Some(index) = dag.logical_index(&recomputed) {
                if index != att.logical_index {
                    divergences.push(
                        Divergence::at(
                            att,
                            CheckKind::LogicalIndex,
                            DivergenceOrigin::ExecutionOrder,
                            "recorded logical index differs from the deterministic schedule",
                        )
                        .values(att.logical_index.to_string(), index.to_string()),
                    );
                }
            }
        }

        let gate = match self.gate_for(manifest, inputs) {
            Ok(gate) => gate,
            Err(detail) => {
                divergences.push(Divergence::manifest_wide(
                    CheckKind::Replay,
                    DivergenceOrigin::PolicyModule,
                    detail,
                ));
                return 0;
            }
        };

        let overlay = OverlayCas::new(inputs.blobs.clone());
        let executor = Executor::new(inputs.blobs.clone(), self.config.clone());
        let outcome = executor.run_in(
            &overlay,
            &dag,
            gate.as_ref(),
            ExecutionMode::Replay,
            &CancelToken::new(),
        );
        let replayed: Vec<Attestation> = match outcome {
            Ok(ExecutionResult { attestations, .. }) => attestations,
            Err(failure) => {
                let (origin, node_id) = match &failure.error {
                    ExecutionError::PolicyDenied { node_id, .. } => {
                        (DivergenceOrigin::PolicyModule, Some(node_id.clone()))
                    }
                    ExecutionError::UngatedGovernedNode { node_id } => {
                        (DivergenceOrigin::PolicyModule, Some(node_id.clone()))
                    }
                    ExecutionError::NodeFailed { node_id, .. }
                    | ExecutionError::ExportFailed { node_id, .. } => {
                        (DivergenceOrigin::Data, Some(node_id.clone()))
                    }
                    _ => (DivergenceOrigin::Data, None),
                };
                let recorded = node_id.as_ref().and_then(|id| {
                    manifest
                        .node_attestations
                        .iter()
                        .find(|a| &hex::encode(a.node.node_id()) == id)
                });
                divergences.push(match recorded {
                    Some(att) => Divergence::at(att, CheckKind::Replay, origin, failure.error.to_string()),
                    None => Divergence::manifest_wide(CheckKind::Replay, origin, failure.error.to_string()),
                });
                failure.partial_attestations
            }
        };

        for att in &manifest.node_attestations {
            let recomputed = att.node.node_id();
            let Some(fresh) = replayed.iter().find(|r| r.node_id == recomputed) else {
                continue;
            };
            if fresh.input_hashes != att.input_hashes {
                divergences.push(
                    Divergence::at(
                        att,
                        CheckKind::InputHashes,
                        DivergenceOrigin::Data,
                        "replayed node consumed different inputs",
                    )
                    .values(join_hex(&att.input_hashes), join_hex(&fresh.input_hashes)),
                );
            }
            if fresh.policy_decisions != att.policy_decisions {
                divergences.push(Divergence::at(
                    att,
                    CheckKind::Decision,
                    DivergenceOrigin::PolicyModule,
                    "replayed policy decisions differ from the recorded ones",
                ));
            }
            if fresh.output_hash != att.output_hash {
                match within_tolerance(att, fresh, inputs.blobs.as_ref(), &overlay) {
                    Some(used) => tolerance_applied.push(used),
                    None => divergences.push(
                        Divergence::at(
                            att,
                            CheckKind::OutputHash,
                            DivergenceOrigin::Data,
                            "replayed output differs from the recorded output",
                        )
                        .values(hex::encode(att.output_hash), hex::encode(fresh.output_hash)),
                    ),
                }
            }
        }
        replayed.len()
    }

    fn gate_for(
        &self,
        manifest: &Manifest,
        inputs: &OriginalInputs<'_>,
    ) -> Result<Option<PolicyGate>, String> {
        let recorded = manifest
            .node_attestations
            .iter()
            .flat_map(|a| a.policy_decisions.iter())
            .next();
        let module_hash = match (manifest.policy_module_hash, recorded) {
            (Some(h), _) => h,
            (None, Some(d)) => d.module_hash,
            (None, None) => return Ok(None),
        };
        let module = inputs
            .policies
            .resolve(&module_hash)
            .map_err(|e| format!("policy module {} unavailable: {e}", hex::encode(module_hash)))?;
        let subject = inputs
            .subject
            .clone()
            .or_else(|| recorded.map(|d| d.subject_attrs.clone()))
            .unwrap_or_default();
        let context = inputs
            .context
            .clone()
            .or_else(|| recorded.map(|d| d.context_attrs.clone()))
            .unwrap_or_default();
        Ok(Some(PolicyGate::new(module, subject, context)))
    }
}

fn join_hex(hashes: &[Hash32]) -> String {
    hashes.iter().map(hex::encode).collect::<Vec<_>>().join(",")
}

fn check_identity(manifest: &Manifest, out: &mut Vec<Divergence>) {
    for att in &manifest.node_attestations {
        let recomputed = att.node.node_id();
        if recomputed != att.node_id {
            out.push(
                Divergence::at(
                    att,
                    CheckKind::NodeIdentity,
                    DivergenceOrigin::Data,
                    "node id does not match the recorded operator, inputs, params and seed",
                )
                .values(hex::encode(att.node_id), hex::encode(recomputed)),
            );
        }
        let params = att.node.params_hash();
        if params != att.params_hash {
            out.push(
                Divergence::at(att, CheckKind::NodeIdentity, DivergenceOrigin::Data, "params hash mismatch")
                    .values(hex::encode(att.params_hash), hex::encode(params)),
            );
        }
    }
}

fn check_ordering(manifest: &Manifest, out: &mut Vec<Divergence>) {
    for pair in manifest.node_attestations.windows(2) {
        if pair[0].node_id >= pair[1].node_id {
            out.push(Divergence::at(
                &pair[1],
                CheckKind::Ordering,
                DivergenceOrigin::ExecutionOrder,
                "attestations are not in ascending node id order",
            ));
        }
    }
}

fn check_tree(manifest: &Manifest, out: &mut Vec<Divergence>) -> Hash32 {
    let leaves = manifest.leaves();
    let root = pcq_verifier::merkle_root(&leaves);
    if root != manifest.manifest_id {
        out.push(
            Divergence::manifest_wide(
                CheckKind::MerkleRoot,
                DivergenceOrigin::Data,
                "recomputed merkle root does not match the manifest id",
            )
            .values(manifest.manifest_id_hex(), hex::encode(root)),
        );
    }
    if manifest.merkle_proofs.len() != leaves.len() {
        out.push(Divergence::manifest_wide(
            CheckKind::MerkleProof,
            DivergenceOrigin::Data,
            format!(
                "{} proofs for {} attestations",
                manifest.merkle_proofs.len(),
                leaves.len()
            ),
        ));
    }
    let tree_size = leaves.len() as u64;
    for (idx, (att, proof)) in manifest
        .node_attestations
        .iter()
        .zip(&manifest.merkle_proofs)
        .enumerate()
    {
        let leaf = leaf_hash(&att.leaf_bytes());
        let aligned = proof.leaf_index == idx as u64
            && proof.node_id == hex::encode(att.node_id)
            && proof.leaf_hash == hex::encode(leaf);
        let verified = proof.verify(tree_size, &manifest.manifest_id);
        if !aligned || verified.is_err() {
            out.push(
                Divergence::at(
                    att,
                    CheckKind::MerkleProof,
                    DivergenceOrigin::Data,
                    "inclusion proof does not bind this attestation to the manifest id",
                )
                .values(proof.leaf_hash.clone(), hex::encode(leaf)),
            );
        }
    }
    root
}

fn check_decisions(
    manifest: &Manifest,
    policies: &dyn ModuleResolver,
    out: &mut Vec<Divergence>,
) -> usize {
    let mut count = 0;
    for att in &manifest.node_attestations {
        for decision in &att.policy_decisions {
            if let Some(pinned) = manifest.policy_module_hash {
                if pinned != decision.module_hash {
                    out.push(
                        Divergence::at(
                            att,
                            CheckKind::Decision,
                            DivergenceOrigin::PolicyModule,
                            "decision cites a module other than the run's policy module",
                        )
                        .values(hex::encode(pinned), hex::encode(decision.module_hash)),
                    );
                }
            }
            let module = match policies.resolve(&decision.module_hash) {
                Ok(m) => m,
                Err(e) => {
                    out.push(Divergence::at(
                        att,
                        CheckKind::Decision,
                        DivergenceOrigin::PolicyModule,
                        format!("cited module unavailable: {e}"),
                    ));
                    continue;
                }
            };
            count += 1;
            let again = decision.reevaluate(&module);
            if &again != decision {
                out.push(
                    Divergence::at(
                        att,
                        CheckKind::Decision,
                        DivergenceOrigin::PolicyModule,
                        format!(
                            "decision {} does not re-evaluate identically",
                            hex::encode(decision.decision_id)
                        ),
                    )
                    .values(
                        format!("{:?}/{}", decision.result, decision.reason_code),
                        format!("{:?}/{}", again.result, again.reason_code),
                    ),
                );
            }
        }
    }
    count
}

fn check_stored_outputs(manifest: &Manifest, blobs: &dyn BlobStore, out: &mut Vec<Divergence>) {
    for att in &manifest.node_attestations {
        if !blobs.contains(&att.output_hash) {
            continue;
        }
        if let Err(CasError::Corrupt { actual, .. }) = blobs.get(&att.output_hash) {
            out.push(
                Divergence::at(
                    att,
                    CheckKind::StoredOutput,
                    DivergenceOrigin::Data,
                    "stored output no longer hashes to its recorded key",
                )
                .values(hex::encode(att.output_hash), actual),
            );
        }
    }
}

fn within_tolerance(
    recorded: &Attestation,
    fresh: &Attestation,
    blobs: &dyn BlobStore,
    replay: &dyn BlobStore,
) -> Option<ToleranceUse> {
    let tolerance = recorded.node.tolerance?;
    let before = numeric_value(&blobs.get(&recorded.output_hash).ok()?)?;
    let after = numeric_value(&replay.get(&fresh.output_hash).ok()?)?;
    let delta = (before - after).abs();
    (delta <= tolerance).then(|| ToleranceUse {
        node_id: hex::encode(recorded.node_id),
        node_name: recorded.node.name.clone(),
        tolerance,
        recorded: before,
        replayed: after,
        delta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::MemoryCas;
    use crate::manifest::{ManifestSigner, ManifestWriter};
    use crate::plan::{PlanSpec, SeedMap};
    use crate::policy::{compile_source, ModuleSet, PolicyModule};
    use ed25519_dalek::SigningKey;
    use serde_json::json;

    const POLICY: &str = r#"lac v1;
policy "verify" tenant "acme" version 1;
grant analysts { allow: read; where: subject.role == "analyst"; }"#;

    struct Fixture {
        cas: Arc<MemoryCas>,
        module: Arc<PolicyModule>,
        manifest: Manifest,
        keys: KeyRing,
    }

    fn fixture(plan: serde_json::Value, seed_blob: &[u8]) -> Fixture {
        let cas = Arc::new(MemoryCas::new());
        let blob = cas.put(seed_blob).unwrap();
        let plan: PlanSpec =
            serde_json::from_str(&plan.to_string().replace("$BLOB", &hex::encode(blob))).unwrap();
        let module = Arc::new(compile_source(POLICY, 0).unwrap());
        let gate = PolicyGate::new(
            module.clone(),
            [("role".to_string(), "analyst".to_string())].into(),
            Attrs::new(),
        );
        let result = Executor::new(cas.clone(), EngineConfig::default())
            .execute(&plan, &SeedMap::new(42), Some(&gate))
            .unwrap();
        let signer = ManifestSigner::new(SigningKey::from_bytes(&[9u8; 32]));
        let keys = KeyRing::new().with(signer.verifying_key());
        let manifest = ManifestWriter::new(signer)
            .write("acme", result.policy_module_hash, result.attestations, 1)
            .unwrap();
        Fixture {
            cas,
            module,
            manifest,
            keys,
        }
    }

    fn three_nodes() -> Fixture {
        fixture(
            json!({"nodes": [
                {"name": "load", "operator": "load", "inputs": [{"blob": "$BLOB"}],
                 "governed": {"action": "read", "resource": {"dataset": "d"}}},
                {"name": "pick", "operator": "sample", "inputs": [{"node": "load"}],
                 "params": {"per_mille": 500}},
                {"name": "total", "operator": "sum", "inputs": [{"node": "pick"}],
                 "params": {"field": "v"}}
            ]}),
            &serde_json::to_vec_pretty(&(0..40).map(|i| json!({"v": i})).collect::<Vec<_>>()).unwrap(),
        )
    }

    fn verify(f: &Fixture, manifest: &Manifest) -> VerificationReport {
        let policies = ModuleSet::new().with(f.module.clone());
        let inputs = OriginalInputs {
            blobs: f.cas.clone(),
            policies: &policies,
            subject: None,
            context: None,
        };
        Verifier::new(f.keys.clone(), EngineConfig::default()).verify(manifest, &inputs)
    }

    #[test]
    fn honest_manifest_passes() {
        let f = three_nodes();
        let report = verify(&f, &f.manifest);
        assert!(report.is_pass(), "{:?}", report.divergences);
        assert_eq!(report.nodes_replayed, 3);
        assert_eq!(report.decisions_reevaluated, 1);
        assert!(report.signature_valid);
    }

    #[test]
    fn flipped_output_hash_is_the_first_divergence() {
        let f = three_nodes();
        let mut tampered = f.manifest.clone();
        let target = tampered
            .node_attestations
            .iter()
            .position(|a| a.node.name == "pick")
            .unwrap();
        tampered.node_attestations[target].output_hash[0] ^= 1;
        let report = verify(&f, &tampered);
        assert_eq!(report.verdict, Verdict::Fail);
        let first = report.first_divergence.unwrap();
        assert_eq!(first.node_name.as_deref(), Some("pick"));
        assert_eq!(first.origin, DivergenceOrigin::Data);
        assert!(report
            .divergences
            .iter()
            .any(|d| d.check == CheckKind::MerkleRoot));
    }

    #[test]
    fn corrupted_stored_output_is_attributed_to_its_node() {
        let f = three_nodes();
        let pick = f
            .manifest
            .node_attestations
            .iter()
            .find(|a| a.node.name == "pick")
            .unwrap();
        let mut bytes = f.cas.get(&pick.output_hash).unwrap();
        bytes[1] ^= 0x20;
        f.cas.corrupt(&pick.output_hash, &bytes);
        let report = verify(&f, &f.manifest);
        let first = report.first_divergence.unwrap();
        assert_eq!(first.check, CheckKind::StoredOutput);
        assert_eq!(first.node_name.as_deref(), Some("pick"));
    }

    #[test]
    fn substituted_policy_module_is_classified() {
        let f = three_nodes();
        let stricter = compile_source(
            "lac v1; policy \"verify\" tenant \"acme\" version 1; grant analysts { allow: read; where: subject.role == \"auditor\"; }",
            0,
        )
        .unwrap();
        let mut tampered = f.manifest.clone();
        tampered.policy_module_hash = Some(stricter.module_hash);
        let policies = ModuleSet::new()
            .with(f.module.clone())
            .with(Arc::new(stricter));
        let inputs = OriginalInputs {
            blobs: f.cas.clone(),
            policies: &policies,
            subject: None,
            context: None,
        };
        let report = Verifier::new(f.keys.clone(), EngineConfig::default()).verify(&tampered, &inputs);
        assert!(!report.is_pass());
        assert!(report
            .divergences
            .iter()
            .all(|d| d.origin == DivergenceOrigin::PolicyModule));
    }

    #[test]
    fn reordered_schedule_is_an_execution_order_divergence() {
        let f = three_nodes();
        let mut tampered = f.manifest.clone();
        for att in tampered.node_attestations.iter_mut() {
            att.logical_index = 2 - att.logical_index;
        }
        let report = verify(&f, &tampered);
        assert!(report
            .divergences
            .iter()
            .any(|d| d.check == CheckKind::LogicalIndex && d.origin == DivergenceOrigin::ExecutionOrder));
    }

    #[test]
    fn missing_source_blob_fails_replay() {
        let f = three_nodes();
        let load = f
            .manifest
            .node_attestations
            .iter()
            .find(|a| a.node.name == "load")
            .unwrap();
        let source = load.input_hashes[0];
        f.cas.remove(&source).unwrap();
        let report = verify(&f, &f.manifest);
        let first = report.first_divergence.unwrap();
        assert_eq!(first.check, CheckKind::Replay);
        assert_eq!(first.node_name.as_deref(), Some("load"));
    }

    #[test]
    fn unknown_signer_fails_without_node() {
        let f = three_nodes();
        let policies = ModuleSet::new().with(f.module.clone());
        let inputs = OriginalInputs {
            blobs: f.cas.clone(),
            policies: &policies,
            subject: None,
            context: None,
        };
        let report = Verifier::new(KeyRing::new(), EngineConfig::default()).verify(&f.manifest, &inputs);
        assert!(!report.signature_valid);
        assert_eq!(report.divergences.len(), 1);
        assert_eq!(report.divergences[0].check, CheckKind::Signature);
    }

    #[test]
    fn tolerance_band_accepts_small_numeric_drift() {
        let f = fixture(
            json!({"nodes": [
                {"name": "load", "operator": "load", "inputs": [{"blob": "$BLOB"}],
                 "governed": {"action": "read", "resource": {}}},
                {"name": "total", "operator": "sum", "inputs": [{"node": "load"}],
                 "params": {"field": "v"}, "tolerance": 0.5}
            ]}),
            br#"[{"v": 1.25}, {"v": 2.5}]"#,
        );
        // Pretend the recorded run produced a slightly different total.
        let drifted = f.cas.put(b"3.9").unwrap();
        let mut m = f.manifest.clone();
        let idx = m
            .node_attestations
            .iter()
            .position(|a| a.node.name == "total")
            .unwrap();
        m.node_attestations[idx].output_hash = drifted;

        let report = verify(&f, &m);
        assert_eq!(report.tolerance_applied.len(), 1);
        let used = &report.tolerance_applied[0];
        assert_eq!(used.recorded, 3.9);
        assert_eq!(used.replayed, 3.75);
        assert!(!report
            .divergences
            .iter()
            .any(|d| d.check == CheckKind::OutputHash));
        // The edited attestation is still not what was signed.
        assert!(!report.is_pass());
    }

    #[test]
    fn report_serializes_with_snake_case_verdicts() {
        let f = three_nodes();
        let report = verify(&f, &f.manifest);
        let json: serde_json::Value = serde_json::from_slice(&report.to_json()).unwrap();
        assert_eq!(json["verdict"], "pass");
        assert!(json.get("first_divergence").is_none());
    }
}
