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

//! Deterministic DAG execution.
//!
//! The logical order of a run is fixed by [`Dag::schedule`]. Workers pull the
//! smallest ready node id, so concurrency only changes wall-clock time: output
//! hashes, attestations and the manifest built from them are identical for any
//! worker count.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;

use crate::attestation::{Attestation, AttestationRecorder};
use crate::cas::{BlobStore, OverlayCas};
use crate::config::EngineConfig;
use crate::digest::Hash32;
use crate::error::PcqError;
use crate::merkle::checksum_root;
use crate::operators;
use crate::plan::{Dag, GovernedAccess, InputRef, NodeSpec, OperatorKind, PlanError, PlanSpec, SeedMap};
use crate::policy::{Action, Attrs, DecisionRecord, PolicyGate, ReasonCode};

const CANCEL_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Side effects reach the configured [`ExportSink`].
    Live,
    /// Side effects are suppressed and outputs land in a scratch overlay.
    ReadOnly,
    /// Read-only re-execution of a recorded run.
    Replay,
}

impl ExecutionMode {
    pub fn is_live(self) -> bool {
        matches!(self, ExecutionMode::Live)
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("policy denied node {node_id}: {reason_code} (decision {decision_id})")]
    PolicyDenied {
        decision_id: String,
        node_id: String,
        reason_code: ReasonCode,
        cited_rule_id: Option<String>,
    },
    #[error("node {node_id} failed after {attempts} attempt(s): {cause}")]
    NodeFailed {
        node_id: String,
        cause: String,
        attempts: u32,
    },
    #[error("node {node_id} touches governed data but no policy gate was supplied")]
    UngatedGovernedNode { node_id: String },
    #[error("export from node {node_id} failed: {reason}")]
    ExportFailed { node_id: String, reason: String },
    #[error("execution cancelled after {completed} node(s)")]
    Cancelled { completed: usize },
}

/// A halted run. Attestations of the nodes that completed are kept for audit.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ExecutionFailure {
    #[source]
    pub error: ExecutionError,
    pub partial_attestations: Vec<Attestation>,
    pub denied_decision: Option<DecisionRecord>,
}

impl From<ExecutionFailure> for PcqError {
    fn from(failure: ExecutionFailure) -> Self {
        PcqError::Execution(failure.error)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub mode: ExecutionMode,
    /// Sorted by node id.
    pub attestations: Vec<Attestation>,
    /// Node id to output hash.
    pub outputs: BTreeMap<Hash32, Hash32>,
    pub policy_module_hash: Option<Hash32>,
    /// Side-effecting nodes whose effect was withheld because the run was not live.
    pub suppressed_side_effects: Vec<Hash32>,
}

impl ExecutionResult {
    pub fn output_of(&self, node_id: &Hash32) -> Option<&Hash32> {
        self.outputs.get(node_id)
    }

    pub fn decisions(&self) -> impl Iterator<Item = &DecisionRecord> {
        self.attestations.iter().flat_map(|a| a.policy_decisions.iter())
    }
}

/// Receives the output of `export` nodes during live runs.
pub trait ExportSink: Send + Sync {
    fn export(&self, node: &NodeSpec, output_hash: &Hash32, bytes: &[u8]) -> Result<(), String>;
}

#[derive(Debug, Default)]
pub struct NullSink;

impl ExportSink for NullSink {
    fn export(&self, _: &NodeSpec, _: &Hash32, _: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedBlob {
    pub node_name: String,
    pub sink: Option<String>,
    pub output_hash: Hash32,
    pub len: usize,
}

/// Sink that remembers what was exported. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryExportSink {
    exported: Mutex<Vec<ExportedBlob>>,
}

impl MemoryExportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exported(&self) -> Vec<ExportedBlob> {
        self.exported.lock().clone()
    }
}

impl ExportSink for MemoryExportSink {
    fn export(&self, node: &NodeSpec, output_hash: &Hash32, bytes: &[u8]) -> Result<(), String> {
        self.exported.lock().push(ExportedBlob {
            node_name: node.name.clone(),
            sink: node.params.get("sink").and_then(|v| v.as_str()).map(str::to_string),
            output_hash: *output_hash,
            len: bytes.len(),
        });
        Ok(())
    }
}

/// Cancels a run at the next node boundary. A node already running finishes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The access a node must be granted before it runs. Export nodes are always
/// gated, as an export with no declared resource.
pub fn effective_access(node: &NodeSpec) -> Option<GovernedAccess> {
    match (&node.governed, node.operator) {
        (Some(access), _) => Some(access.clone()),
        (None, OperatorKind::Export) => Some(GovernedAccess {
            action: Action::Export,
            resource: Attrs::new(),
        }),
        (None, _) => None,
    }
}

enum Halt {
    Denied { node_id: Hash32, decision: DecisionRecord },
    Ungated { node_id: Hash32 },
    Failed { node_id: Hash32, cause: String, attempts: u32 },
    Export { node_id: Hash32, reason: String },
    Cancelled,
}

struct Schedule {
    ready: BTreeSet<Hash32>,
    pending_deps: BTreeMap<Hash32, usize>,
    outputs: BTreeMap<Hash32, Hash32>,
    suppressed: Vec<Hash32>,
    in_flight: usize,
    done: usize,
    halt: Option<Halt>,
}

struct NodeRun {
    attestation: Attestation,
    suppressed: bool,
}

pub struct Executor {
    cas: Arc<dyn BlobStore>,
    config: EngineConfig,
    sink: Arc<dyn ExportSink>,
}

impl Executor {
    pub fn new(cas: Arc<dyn BlobStore>, config: EngineConfig) -> Self {
        Self {
            cas,
            config,
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ExportSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compiles `plan` under `seeds` and runs it live.
    pub fn execute(
        &self,
        plan: &PlanSpec,
        seeds: &SeedMap,
        gate: Option<&PolicyGate>,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        let dag = Dag::compile(plan, seeds).map_err(|e| ExecutionFailure {
            error: ExecutionError::Plan(e),
            partial_attestations: Vec::new(),
            denied_decision: None,
        })?;
        self.run(&dag, gate, ExecutionMode::Live, &CancelToken::new())
    }

    /// Runs `dag`. Non-live modes write outputs into a scratch overlay so the
    /// backing store is never mutated.
    pub fn run(
        &self,
        dag: &Dag,
        gate: Option<&PolicyGate>,
        mode: ExecutionMode,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        if mode.is_live() {
            self.run_in(self.cas.as_ref(), dag, gate, mode, cancel)
        } else {
            let overlay = OverlayCas::new(self.cas.clone());
            self.run_in(&overlay, dag, gate, mode, cancel)
        }
    }

    /// Runs `dag` reading and writing blobs through `store`.
    pub fn run_in(
        &self,
        store: &dyn BlobStore,
        dag: &Dag,
        gate: Option<&PolicyGate>,
        mode: ExecutionMode,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        let started = Instant::now();
        let total = dag.len();
        let mut pending_deps = BTreeMap::new();
        let mut ready = BTreeSet::new();
        for (id, node) in dag.nodes() {
            let deps: BTreeSet<&Hash32> = node.node_inputs().collect();
            if deps.is_empty() {
                ready.insert(*id);
            } else {
                pending_deps.insert(*id, deps.len());
            }
        }
        let state = Mutex::new(Schedule {
            ready,
            pending_deps,
            outputs: BTreeMap::new(),
            suppressed: Vec::new(),
            in_flight: 0,
            done: 0,
            halt: None,
        });
        let wakeup = Condvar::new();
        let recorder = AttestationRecorder::new();
        let workers = self.config.worker_count().min(total).max(1);

        tracing::info!(
            target: "pcq.exec",
            nodes = total,
            workers,
            mode = ?mode,
            policy_module = gate.map(|g| hex::encode(g.module.module_hash)).unwrap_or_default(),
            "dag run started"
        );

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    self.worker(store, dag, gate, mode, cancel, &state, &wakeup, &recorder)
                });
            }
        });

        let schedule = state.into_inner();
        let attestations = recorder.finish();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match schedule.halt {
            None => {
                tracing::info!(
                    target: "pcq.exec",
                    nodes = attestations.len(),
                    elapsed_ms,
                    "dag run completed"
                );
                let mut suppressed = schedule.suppressed;
                suppressed.sort();
                Ok(ExecutionResult {
                    mode,
                    attestations,
                    outputs: schedule.outputs,
                    policy_module_hash: gate.map(|g| g.module.module_hash),
                    suppressed_side_effects: suppressed,
                })
            }
            Some(halt) => {
                let (error, denied_decision) = match halt {
                    Halt::Denied { node_id, decision } => (
                        ExecutionError::PolicyDenied {
                            decision_id: hex::encode(decision.decision_id),
                            node_id: hex::encode(node_id),
                            reason_code: decision.reason_code,
                            cited_rule_id: decision.cited_rule_id.clone(),
                        },
                        Some(decision),
                    ),
                    Halt::Ungated { node_id } => (
                        ExecutionError::UngatedGovernedNode {
                            node_id: hex::encode(node_id),
                        },
                        None,
                    ),
                    Halt::Failed {
                        node_id,
                        cause,
                        attempts,
                    } => (
                        ExecutionError::NodeFailed {
                            node_id: hex::encode(node_id),
                            cause,
                            attempts,
                        },
                        None,
                    ),
                    Halt::Export { node_id, reason } => (
                        ExecutionError::ExportFailed {
                            node_id: hex::encode(node_id),
                            reason,
                        },
                        None,
                    ),
                    Halt::Cancelled => (
                        ExecutionError::Cancelled {
                            completed: attestations.len(),
                        },
                        None,
                    ),
                };
                tracing::warn!(
                    target: "pcq.exec",
                    error = %error,
                    partial = attestations.len(),
                    elapsed_ms,
                    "dag run halted"
                );
                Err(ExecutionFailure {
                    error,
                    partial_attestations: attestations,
                    denied_decision,
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn worker(
        &self,
        store: &dyn BlobStore,
        dag: &Dag,
        gate: Option<&PolicyGate>,
        mode: ExecutionMode,
        cancel: &CancelToken,
        state: &Mutex<Schedule>,
        wakeup: &Condvar,
        recorder: &AttestationRecorder,
    ) {
        let total = dag.len();
        loop {
            let (id, input_hashes) = {
                let mut st = state.lock();
                let id = loop {
                    if st.halt.is_some() || st.done == total {
                        return;
                    }
                    if cancel.is_cancelled() {
                        st.halt = Some(Halt::Cancelled);
                        wakeup.notify_all();
                        return;
                    }
                    if let Some(id) = st.ready.pop_first() {
                        st.in_flight += 1;
                        break id;
                    }
                    wakeup.wait_for(&mut st, CANCEL_POLL);
                };
                let inputs = dag
                    .node(&id)
                    .map(|node| {
                        node.inputs
                            .iter()
                            .map(|input| match input {
                                InputRef::Blob(h) => *h,
                                // Dependencies are complete before a node becomes ready.
                                InputRef::Node(dep) => st.outputs.get(dep).copied().unwrap_or_default(),
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                (id, inputs)
            };

            let outcome = match dag.node(&id) {
                Some(node) => self.run_node(store, dag, &id, node, input_hashes, gate, mode),
                None => Err(Halt::Failed {
                    node_id: id,
                    cause: "node missing from dag".into(),
                    attempts: 0,
                }),
            };

            let mut st = state.lock();
            st.in_flight -= 1;
            match outcome {
                Ok(run) => {
                    st.outputs.insert(id, run.attestation.output_hash);
                    if run.suppressed {
                        st.suppressed.push(id);
                    }
                    recorder.record(run.attestation);
                    st.done += 1;
                    for dependent in dag.dependents(&id) {
                        if let Some(pending) = st.pending_deps.get_mut(dependent) {
                            *pending -= 1;
                            if *pending == 0 {
                                st.pending_deps.remove(dependent);
                                st.ready.insert(*dependent);
                            }
                        }
                    }
                }
                Err(halt) => {
                    if st.halt.is_none() {
                        st.halt = Some(halt);
                    }
                }
            }
            wakeup.notify_all();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_node(
        &self,
        store: &dyn BlobStore,
        dag: &Dag,
        id: &Hash32,
        node: &NodeSpec,
        input_hashes: Vec<Hash32>,
        gate: Option<&PolicyGate>,
        mode: ExecutionMode,
    ) -> Result<NodeRun, Halt> {
        let started = Instant::now();
        let mut decisions = Vec::new();
        if let Some(access) = effective_access(node) {
            let gate = gate.ok_or(Halt::Ungated { node_id: *id })?;
            let decision = gate.check(access.action, &access.resource);
            if !decision.is_allow() {
                tracing::warn!(
                    target: "pcq.exec",
                    node = %node.name,
                    decision_id = %hex::encode(decision.decision_id),
                    reason = %decision.reason_code,
                    "policy denied governed node"
                );
                return Err(Halt::Denied {
                    node_id: *id,
                    decision,
                });
            }
            decisions.push(decision);
        }

        let max_attempts = self.config.node_max_attempts.max(1);
        let mut attempts = 0;
        let (output_hash, bytes) = loop {
            attempts += 1;
            match attempt(store, node, &input_hashes) {
                Ok(done) => break done,
                Err(cause) if attempts < max_attempts => {
                    tracing::warn!(
                        target: "pcq.exec",
                        node = %node.name,
                        attempt = attempts,
                        cause = %cause,
                        "node attempt failed; retrying with the same seed"
                    );
                }
                Err(cause) => {
                    return Err(Halt::Failed {
                        node_id: *id,
                        cause,
                        attempts,
                    })
                }
            }
        };

        let mut suppressed = false;
        if node.operator.has_side_effects() {
            if mode.is_live() {
                self.sink
                    .export(node, &output_hash, &bytes)
                    .map_err(|reason| Halt::Export {
                        node_id: *id,
                        reason,
                    })?;
            } else {
                suppressed = true;
            }
        }

        let attestation = Attestation {
            node_id: *id,
            logical_index: dag.logical_index(id).unwrap_or_default(),
            node: node.clone(),
            input_hashes,
            params_hash: node.params_hash(),
            output_hash,
            checksum_root: checksum_root(&bytes, self.config.checksum_chunk_bytes),
            output_len: bytes.len() as u64,
            attempts,
            wall_clock_duration_ms: started.elapsed().as_millis() as u64,
            policy_decisions: decisions,
        };
        Ok(NodeRun {
            attestation,
            suppressed,
        })
    }
}

fn attempt(
    store: &dyn BlobStore,
    node: &NodeSpec,
    input_hashes: &[Hash32],
) -> Result<(Hash32, Vec<u8>), String> {
    let inputs = input_hashes
        .iter()
        .map(|h| store.get(h))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;
    let bytes = operators::apply(node, &inputs).map_err(|e| e.to_string())?;
    let hash = store.put(&bytes).map_err(|e| e.to_string())?;
    Ok((hash, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::{CasError, MemoryCas};
    use crate::policy::compile_source;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    const POLICY: &str = r#"
lac v1;
policy "exec" tenant "acme" version 1;
grant readers { allow: read, aggregate; where: subject.role == "analyst"; }
license open { license: "CC-BY"; allow: export; }
"#;

    fn gate(role: &str) -> PolicyGate {
        let module = compile_source(POLICY, 0).unwrap();
        PolicyGate::new(
            Arc::new(module),
            [("role".to_string(), role.to_string())].into(),
            Attrs::new(),
        )
    }

    fn seeded_cas() -> (Arc<MemoryCas>, String) {
        let cas = Arc::new(MemoryCas::new());
        let rows = json!([
            {"id": 1, "region": "eu", "amount": 4},
            {"id": 2, "region": "us", "amount": 9},
            {"id": 3, "region": "eu", "amount": 6}
        ]);
        let key = cas.put(&serde_json::to_vec(&rows).unwrap()).unwrap();
        (cas, hex::encode(key))
    }

    fn plan(blob: &str, export_license: &str) -> PlanSpec {
        serde_json::from_value(json!({
            "name": "eu-total",
            "nodes": [
                {"name": "load", "operator": "load", "inputs": [{"blob": blob}],
                 "governed": {"action": "read", "resource": {"dataset": "sales"}}},
                {"name": "eu", "operator": "filter", "inputs": [{"node": "load"}],
                 "params": {"field": "region", "equals": "eu"}},
                {"name": "total", "operator": "sum", "inputs": [{"node": "eu"}],
                 "params": {"field": "amount"}},
                {"name": "ship", "operator": "export", "inputs": [{"node": "eu"}],
                 "params": {"sink": "s3://bucket"},
                 "governed": {"action": "export", "resource": {"license": export_license}}}
            ]
        }))
        .unwrap()
    }

    fn config(workers: usize) -> EngineConfig {
        EngineConfig::default().with_max_workers(workers)
    }

    #[test]
    fn live_run_attests_every_node_and_exports() {
        let (cas, blob) = seeded_cas();
        let sink = Arc::new(MemoryExportSink::new());
        let exec = Executor::new(cas.clone(), config(2)).with_sink(sink.clone());
        let result = exec
            .execute(&plan(&blob, "CC-BY"), &SeedMap::new(1), Some(&gate("analyst")))
            .unwrap();
        assert_eq!(result.attestations.len(), 4);
        assert!(result
            .attestations
            .windows(2)
            .all(|w| w[0].node_id < w[1].node_id));
        assert_eq!(result.decisions().count(), 2);
        assert_eq!(sink.exported().len(), 1);
        assert_eq!(sink.exported()[0].sink.as_deref(), Some("s3://bucket"));
        for hash in result.outputs.values() {
            assert!(cas.contains(hash));
        }
    }

    #[test]
    fn worker_count_does_not_change_outputs() {
        let (cas, blob) = seeded_cas();
        let p = plan(&blob, "CC-BY");
        let one = Executor::new(cas.clone(), config(1))
            .execute(&p, &SeedMap::new(5), Some(&gate("analyst")))
            .unwrap();
        let four = Executor::new(cas, config(4))
            .execute(&p, &SeedMap::new(5), Some(&gate("analyst")))
            .unwrap();
        let leaves = |r: &ExecutionResult| -> Vec<Vec<u8>> {
            r.attestations.iter().map(Attestation::leaf_bytes).collect()
        };
        assert_eq!(leaves(&one), leaves(&four));
    }

    #[test]
    fn denial_halts_with_partial_attestations() {
        let (cas, blob) = seeded_cas();
        let exec = Executor::new(cas, config(1));
        let failure = exec
            .execute(&plan(&blob, "proprietary"), &SeedMap::new(1), Some(&gate("analyst")))
            .unwrap_err();
        match &failure.error {
            ExecutionError::PolicyDenied { reason_code, .. } => {
                assert_eq!(*reason_code, ReasonCode::NoMatchingRule)
            }
            other => panic!("unexpected error {other:?}"),
        }
        let denied = failure.denied_decision.as_ref().unwrap();
        assert_eq!(denied.action, Action::Export);
        // load and eu must have run before ship became ready.
        assert!(failure.partial_attestations.len() >= 2);
    }

    #[test]
    fn governed_node_without_gate_is_rejected() {
        let (cas, blob) = seeded_cas();
        let failure = Executor::new(cas, config(1))
            .execute(&plan(&blob, "CC-BY"), &SeedMap::new(1), None)
            .unwrap_err();
        assert!(matches!(failure.error, ExecutionError::UngatedGovernedNode { .. }));
    }

    #[test]
    fn read_only_mode_suppresses_exports_and_leaves_store_untouched() {
        let (cas, blob) = seeded_cas();
        let before = cas.len();
        let sink = Arc::new(MemoryExportSink::new());
        let exec = Executor::new(cas.clone(), config(2)).with_sink(sink.clone());
        let dag = Dag::compile(&plan(&blob, "CC-BY"), &SeedMap::new(1)).unwrap();
        let result = exec
            .run(&dag, Some(&gate("analyst")), ExecutionMode::ReadOnly, &CancelToken::new())
            .unwrap();
        assert!(sink.exported().is_empty());
        assert_eq!(result.suppressed_side_effects.len(), 1);
        assert_eq!(cas.len(), before);
    }

    #[test]
    fn cancellation_keeps_partial_attestations() {
        let (cas, blob) = seeded_cas();
        let exec = Executor::new(cas, config(1));
        let dag = Dag::compile(&plan(&blob, "CC-BY"), &SeedMap::new(1)).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let failure = exec
            .run(&dag, Some(&gate("analyst")), ExecutionMode::Live, &cancel)
            .unwrap_err();
        assert!(matches!(failure.error, ExecutionError::Cancelled { completed: 0 }));
        assert!(failure.partial_attestations.is_empty());
    }

    /// Fails the first `failures` reads, then behaves like the inner store.
    struct FlakyCas {
        inner: MemoryCas,
        failures: AtomicUsize,
    }

    impl BlobStore for FlakyCas {
        fn put(&self, bytes: &[u8]) -> Result<Hash32, CasError> {
            self.inner.put(bytes)
        }
        fn get(&self, key: &Hash32) -> Result<Vec<u8>, CasError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CasError::Io("transient read failure".into()));
            }
            self.inner.get(key)
        }
        fn contains(&self, key: &Hash32) -> bool {
            self.inner.contains(key)
        }
        fn list(&self) -> Result<Vec<Hash32>, CasError> {
            self.inner.list()
        }
        fn remove(&self, key: &Hash32) -> Result<bool, CasError> {
            self.inner.remove(key)
        }
    }

    fn single_node(cas: &FlakyCas) -> PlanSpec {
        let key = cas.put(br#"[{"v": 1}, {"v": 2}]"#).unwrap();
        serde_json::from_value(json!({
            "nodes": [{"name": "total", "operator": "sum", "inputs": [{"blob": hex::encode(key)}],
                       "params": {"field": "v"}}]
        }))
        .unwrap()
    }

    #[test]
    fn transient_failures_recover_with_identical_output() {
        let flaky = Arc::new(FlakyCas {
            inner: MemoryCas::new(),
            failures: AtomicUsize::new(2),
        });
        let p = single_node(&flaky);
        let retried = Executor::new(flaky.clone(), config(1))
            .execute(&p, &SeedMap::new(9), None)
            .unwrap();
        assert_eq!(retried.attestations[0].attempts, 3);
        let clean = Executor::new(flaky, config(1))
            .execute(&p, &SeedMap::new(9), None)
            .unwrap();
        assert_eq!(clean.attestations[0].attempts, 1);
        assert_eq!(retried.attestations[0].leaf_bytes(), clean.attestations[0].leaf_bytes());
    }

    #[test]
    fn exhausted_retries_surface_node_failed() {
        let flaky = Arc::new(FlakyCas {
            inner: MemoryCas::new(),
            failures: AtomicUsize::new(10),
        });
        let p = single_node(&flaky);
        let failure = Executor::new(flaky, config(1))
            .execute(&p, &SeedMap::new(9), None)
            .unwrap_err();
        match failure.error {
            ExecutionError::NodeFailed { attempts, cause, .. } => {
                assert_eq!(attempts, crate::config::DEFAULT_NODE_MAX_ATTEMPTS);
                assert!(cause.contains("transient"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
