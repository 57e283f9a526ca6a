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

//! Query plans and their compiled DAG form.
//!
//! A [`PlanSpec`] names nodes and wires them by name. [`Dag::compile`] turns
//! it into content-addressed [`NodeSpec`]s: a node's id hashes its operator,
//! its resolved input references, its parameter set and its seed, so two runs
//! of the same plan under the same seeds agree on every id.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::digest::{
    append_u64, canonical_json, parse_hash32, sha256_domain, Hash32, DOMAIN_NODE_V1,
    DOMAIN_PARAMS_V1, DOMAIN_SEED_V1,
};
use crate::policy::{Action, Attrs};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("plan has no nodes")]
    Empty,
    #[error("node name `{0}` is used twice")]
    DuplicateName(String),
    #[error("nodes `{first}` and `{second}` have identical identity {node_id}")]
    DuplicateNode {
        first: String,
        second: String,
        node_id: String,
    },
    #[error("node `{node}` references unknown node `{reference}`")]
    UnknownNode { node: String, reference: String },
    #[error("node `{node}` references an invalid blob hash: {reason}")]
    InvalidBlobRef { node: String, reason: String },
    #[error("plan contains a cycle through `{0}`")]
    Cycle(String),
    #[error("operator {operator} on node `{node}` takes {expected} input(s), got {got}")]
    Arity {
        node: String,
        operator: &'static str,
        expected: &'static str,
        got: usize,
    },
    #[error("params of node `{0}` must be a JSON object")]
    ParamsNotObject(String),
    #[error("tolerance of node `{node}` must be finite and non-negative")]
    InvalidTolerance { node: String },
    #[error("plan json is malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    Load,
    Filter,
    Project,
    Sample,
    Join,
    Aggregate,
    Sort,
    Sum,
    Export,
}

impl OperatorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperatorKind::Load => "load",
            OperatorKind::Filter => "filter",
            OperatorKind::Project => "project",
            OperatorKind::Sample => "sample",
            OperatorKind::Join => "join",
            OperatorKind::Aggregate => "aggregate",
            OperatorKind::Sort => "sort",
            OperatorKind::Sum => "sum",
            OperatorKind::Export => "export",
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn has_side_effects(self) -> bool {
        matches!(self, OperatorKind::Export)
    }

    fn arity(self) -> (usize, usize, &'static str) {
        match self {
            OperatorKind::Join => (2, 2, "exactly 2"),
            _ => (1, 1, "exactly 1"),
        }
    }
}

/// A governed node asks the policy gate before it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernedAccess {
    pub action: Action,
    #[serde(default)]
    pub resource: Attrs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanInput {
    Blob(String),
    Node(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNodeSpec {
    pub name: String,
    pub operator: OperatorKind,
    #[serde(default)]
    pub inputs: Vec<PlanInput>,
    #[serde(default = "empty_params")]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governed: Option<GovernedAccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<PlanNodeSpec>,
}

impl PlanSpec {
    pub fn from_json(bytes: &[u8]) -> Result<Self, PlanError> {
        serde_json::from_slice(bytes).map_err(|e| PlanError::Malformed(e.to_string()))
    }
}

/// Seeds for seeded operators. Nodes without an override derive their seed
/// from `master` and their name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedMap {
    pub master: u64,
    #[serde(default)]
    pub overrides: BTreeMap<String, u64>,
}

impl SeedMap {
    pub fn new(master: u64) -> Self {
        Self {
            master,
            overrides: BTreeMap::new(),
        }
    }

    pub fn pin(mut self, node: impl Into<String>, seed: u64) -> Self {
        self.overrides.insert(node.into(), seed);
        self
    }

    pub fn seed_for(&self, node: &str) -> u64 {
        if let Some(seed) = self.overrides.get(node) {
            return *seed;
        }
        let mut payload = Vec::with_capacity(8 + node.len());
        append_u64(&mut payload, self.master);
        payload.extend_from_slice(node.as_bytes());
        let h = sha256_domain(DOMAIN_SEED_V1, &payload);
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&h[..8]);
        u64::from_be_bytes(arr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRef {
    Blob(#[serde(with = "crate::digest::hex32")] Hash32),
    Node(#[serde(with = "crate::digest::hex32")] Hash32),
}

impl InputRef {
    fn tag(&self) -> u8 {
        match self {
            InputRef::Blob(_) => 0,
            InputRef::Node(_) => 1,
        }
    }

    pub fn hash(&self) -> &Hash32 {
        match self {
            InputRef::Blob(h) | InputRef::Node(h) => h,
        }
    }
}

/// Fully resolved node. This is what attestations carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub operator: OperatorKind,
    pub inputs: Vec<InputRef>,
    pub params: Value,
    pub seed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governed: Option<GovernedAccess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
}

#[derive(Serialize)]
struct ParamSet<'a> {
    params: &'a Value,
    governed: &'a Option<GovernedAccess>,
    tolerance: &'a Option<f64>,
}

impl NodeSpec {
    /// Hash of everything that configures the node besides its inputs and seed.
    pub fn params_hash(&self) -> Hash32 {
        let set = ParamSet {
            params: &self.params,
            governed: &self.governed,
            tolerance: &self.tolerance,
        };
        let bytes = canonical_json(&set).unwrap_or_default();
        sha256_domain(DOMAIN_PARAMS_V1, &bytes)
    }

    pub fn node_id(&self) -> Hash32 {
        let mut payload = Vec::with_capacity(1 + 8 + 33 * self.inputs.len() + 40);
        payload.push(self.operator.tag());
        append_u64(&mut payload, self.inputs.len() as u64);
        for input in &self.inputs {
            payload.push(input.tag());
            payload.extend_from_slice(input.hash());
        }
        payload.extend_from_slice(&self.params_hash());
        append_u64(&mut payload, self.seed);
        sha256_domain(DOMAIN_NODE_V1, &payload)
    }

    pub fn node_inputs(&self) -> impl Iterator<Item = &Hash32> {
        self.inputs.iter().filter_map(|i| match i {
            InputRef::Node(h) => Some(h),
            InputRef::Blob(_) => None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Dag {
    nodes: BTreeMap<Hash32, NodeSpec>,
    dependents: BTreeMap<Hash32, Vec<Hash32>>,
    schedule: Vec<Hash32>,
    logical_index: BTreeMap<Hash32, u64>,
}

impl Dag {
    pub fn compile(spec: &PlanSpec, seeds: &SeedMap) -> Result<Self, PlanError> {
        if spec.nodes.is_empty() {
            return Err(PlanError::Empty);
        }
        let mut by_name: BTreeMap<&str, &PlanNodeSpec> = BTreeMap::new();
        for node in &spec.nodes {
            if by_name.insert(node.name.as_str(), node).is_some() {
                return Err(PlanError::DuplicateName(node.name.clone()));
            }
        }

        let mut resolved: BTreeMap<&str, Hash32> = BTreeMap::new();
        let mut specs: Vec<NodeSpec> = Vec::with_capacity(spec.nodes.len());
        for node in &spec.nodes {
            let mut visiting = BTreeSet::new();
            resolve(node, &by_name, seeds, &mut resolved, &mut visiting, &mut specs)?;
        }
        Self::from_nodes(specs)
    }

    /// Builds the graph from already-resolved nodes, as recorded in a manifest.
    pub fn from_nodes(specs: Vec<NodeSpec>) -> Result<Self, PlanError> {
        if specs.is_empty() {
            return Err(PlanError::Empty);
        }
        let mut nodes: BTreeMap<Hash32, NodeSpec> = BTreeMap::new();
        for spec in specs {
            validate_node(&spec)?;
            let id = spec.node_id();
            if let Some(existing) = nodes.get(&id) {
                return Err(PlanError::DuplicateNode {
                    first: existing.name.clone(),
                    second: spec.name,
                    node_id: hex::encode(id),
                });
            }
            nodes.insert(id, spec);
        }

        let mut dependents: BTreeMap<Hash32, Vec<Hash32>> = BTreeMap::new();
        let mut indegree: BTreeMap<Hash32, usize> = BTreeMap::new();
        for (id, spec) in &nodes {
            let deps: BTreeSet<&Hash32> = spec.node_inputs().collect();
            for dep in &deps {
                if !nodes.contains_key(*dep) {
                    return Err(PlanError::UnknownNode {
                        node: spec.name.clone(),
                        reference: hex::encode(dep),
                    });
                }
                dependents.entry(**dep).or_default().push(*id);
            }
            indegree.insert(*id, deps.len());
        }

        // Kahn's algorithm, always taking the smallest ready node id.
        let mut ready: BTreeSet<Hash32> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut schedule = Vec::with_capacity(nodes.len());
        while let Some(id) = ready.pop_first() {
            schedule.push(id);
            for dep in dependents.get(&id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(dep) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*dep);
                    }
                }
            }
        }
        if schedule.len() != nodes.len() {
            let stuck = indegree
                .iter()
                .find(|(_, d)| **d > 0)
                .and_then(|(id, _)| nodes.get(id))
                .map(|n| n.name.clone())
                .unwrap_or_default();
            return Err(PlanError::Cycle(stuck));
        }
        let logical_index = schedule
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i as u64))
            .collect();
        Ok(Self {
            nodes,
            dependents,
            schedule,
            logical_index,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in logical execution order.
    pub fn schedule(&self) -> &[Hash32] {
        &self.schedule
    }

    pub fn node(&self, id: &Hash32) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&Hash32, &NodeSpec)> {
        self.nodes.iter()
    }

    pub fn dependents(&self, id: &Hash32) -> &[Hash32] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn logical_index(&self, id: &Hash32) -> Option<u64> {
        self.logical_index.get(id).copied()
    }

    pub fn node_id_by_name(&self, name: &str) -> Option<Hash32> {
        self.nodes
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(id, _)| *id)
    }

    /// Source blobs read by `load`-style inputs.
    pub fn source_blobs(&self) -> BTreeSet<Hash32> {
        self.nodes
            .values()
            .flat_map(|n| n.inputs.iter())
            .filter_map(|i| match i {
                InputRef::Blob(h) => Some(*h),
                InputRef::Node(_) => None,
            })
            .collect()
    }
}

fn validate_node(spec: &NodeSpec) -> Result<(), PlanError> {
    let (min, max, expected) = spec.operator.arity();
    if spec.inputs.len() < min || spec.inputs.len() > max {
        return Err(PlanError::Arity {
            node: spec.name.clone(),
            operator: spec.operator.as_str(),
            expected,
            got: spec.inputs.len(),
        });
    }
    if !spec.params.is_object() {
        return Err(PlanError::ParamsNotObject(spec.name.clone()));
    }
    if let Some(t) = spec.tolerance {
        if !t.is_finite() || t < 0.0 {
            return Err(PlanError::InvalidTolerance {
                node: spec.name.clone(),
            });
        }
    }
    Ok(())
}

fn resolve<'a>(
    node: &'a PlanNodeSpec,
    by_name: &BTreeMap<&str, &'a PlanNodeSpec>,
    seeds: &SeedMap,
    resolved: &mut BTreeMap<&'a str, Hash32>,
    visiting: &mut BTreeSet<&'a str>,
    out: &mut Vec<NodeSpec>,
) -> Result<Hash32, PlanError> {
    if let Some(id) = resolved.get(node.name.as_str()) {
        return Ok(*id);
    }
    if !visiting.insert(node.name.as_str()) {
        return Err(PlanError::Cycle(node.name.clone()));
    }
    let mut inputs = Vec::with_capacity(node.inputs.len());
    for input in &node.inputs {
        inputs.push(match input {
            PlanInput::Blob(hex_hash) => {
                InputRef::Blob(parse_hash32(hex_hash).map_err(|reason| {
                    PlanError::InvalidBlobRef {
                        node: node.name.clone(),
                        reason,
                    }
                })?)
            }
            PlanInput::Node(name) => {
                let upstream: &'a PlanNodeSpec = *by_name
                    .get(name.as_str())
                    .ok_or_else(|| PlanError::UnknownNode {
                        node: node.name.clone(),
                        reference: name.clone(),
                    })?;
                InputRef::Node(resolve(upstream, by_name, seeds, resolved, visiting, out)?)
            }
        });
    }
    visiting.remove(node.name.as_str());
    let spec = NodeSpec {
        name: node.name.clone(),
        operator: node.operator,
        inputs,
        params: node.params.clone(),
        seed: seeds.seed_for(&node.name),
        governed: node.governed.clone(),
        tolerance: node.tolerance,
    };
    let id = spec.node_id();
    resolved.insert(node.name.as_str(), id);
    out.push(spec);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blob() -> String {
        hex::encode(crate::digest::sha256(b"source"))
    }

    fn plan(nodes: Value) -> PlanSpec {
        serde_json::from_value(json!({ "name": "t", "nodes": nodes })).unwrap()
    }

    fn three_node_plan() -> PlanSpec {
        plan(json!([
            {"name": "sum", "operator": "sum", "inputs": [{"node": "filter"}], "params": {"field": "amount"}},
            {"name": "load", "operator": "load", "inputs": [{"blob": blob()}]},
            {"name": "filter", "operator": "filter", "inputs": [{"node": "load"}],
             "params": {"field": "region", "equals": "eu"}}
        ]))
    }

    #[test]
    fn compile_orders_dependencies_first() {
        let dag = Dag::compile(&three_node_plan(), &SeedMap::new(7)).unwrap();
        let names: Vec<&str> = dag
            .schedule()
            .iter()
            .map(|id| dag.node(id).unwrap().name.as_str())
            .collect();
        assert_eq!(names, vec!["load", "filter", "sum"]);
        assert_eq!(dag.logical_index(&dag.node_id_by_name("sum").unwrap()), Some(2));
        assert_eq!(dag.source_blobs().len(), 1);
    }

    #[test]
    fn node_ids_depend_on_seed_params_and_inputs() {
        let a = Dag::compile(&three_node_plan(), &SeedMap::new(7)).unwrap();
        let b = Dag::compile(&three_node_plan(), &SeedMap::new(7)).unwrap();
        let c = Dag::compile(&three_node_plan(), &SeedMap::new(8)).unwrap();
        assert_eq!(a.schedule(), b.schedule());
        assert_ne!(a.node_id_by_name("load"), c.node_id_by_name("load"));

        let pinned = SeedMap::new(7).pin("load", 42);
        let d = Dag::compile(&three_node_plan(), &pinned).unwrap();
        let load = d.node(&d.node_id_by_name("load").unwrap()).unwrap();
        assert_eq!(load.seed, 42);
        // Downstream ids change with the upstream id.
        assert_ne!(a.node_id_by_name("sum"), d.node_id_by_name("sum"));
    }

    #[test]
    fn ready_ties_break_on_smallest_node_id() {
        let p = plan(json!([
            {"name": "a", "operator": "load", "inputs": [{"blob": blob()}]},
            {"name": "b", "operator": "load", "inputs": [{"blob": blob()}], "params": {"x": 1}},
            {"name": "c", "operator": "load", "inputs": [{"blob": blob()}], "params": {"x": 2}}
        ]));
        let dag = Dag::compile(&p, &SeedMap::new(1)).unwrap();
        let mut sorted = dag.schedule().to_vec();
        sorted.sort();
        assert_eq!(dag.schedule(), sorted.as_slice());
    }

    #[test]
    fn cycles_and_unknown_references_are_rejected() {
        let cyclic = plan(json!([
            {"name": "a", "operator": "filter", "inputs": [{"node": "b"}]},
            {"name": "b", "operator": "filter", "inputs": [{"node": "a"}]}
        ]));
        assert!(matches!(
            Dag::compile(&cyclic, &SeedMap::default()),
            Err(PlanError::Cycle(_))
        ));
        let dangling = plan(json!([
            {"name": "a", "operator": "filter", "inputs": [{"node": "missing"}]}
        ]));
        assert!(matches!(
            Dag::compile(&dangling, &SeedMap::default()),
            Err(PlanError::UnknownNode { .. })
        ));
    }

    #[test]
    fn duplicates_and_bad_shapes_are_rejected() {
        let dup_name = plan(json!([
            {"name": "a", "operator": "load", "inputs": [{"blob": blob()}]},
            {"name": "a", "operator": "load", "inputs": [{"blob": blob()}]}
        ]));
        assert_eq!(
            Dag::compile(&dup_name, &SeedMap::default()).unwrap_err(),
            PlanError::DuplicateName("a".into())
        );
        let same_identity = plan(json!([
            {"name": "a", "operator": "load", "inputs": [{"blob": blob()}]},
            {"name": "b", "operator": "load", "inputs": [{"blob": blob()}]}
        ]));
        let seeds = SeedMap::new(0).pin("a", 1).pin("b", 1);
        assert!(matches!(
            Dag::compile(&same_identity, &seeds),
            Err(PlanError::DuplicateNode { .. })
        ));
        let bad_arity = plan(json!([
            {"name": "j", "operator": "join", "inputs": [{"blob": blob()}], "params": {"on": "id"}}
        ]));
        assert!(matches!(
            Dag::compile(&bad_arity, &SeedMap::default()),
            Err(PlanError::Arity { got: 1, .. })
        ));
        let bad_blob = plan(json!([
            {"name": "a", "operator": "load", "inputs": [{"blob": "xyz"}]}
        ]));
        assert!(matches!(
            Dag::compile(&bad_blob, &SeedMap::default()),
            Err(PlanError::InvalidBlobRef { .. })
        ));
    }

    #[test]
    fn node_spec_round_trips_through_json_with_same_id() {
        let dag = Dag::compile(&three_node_plan(), &SeedMap::new(3)).unwrap();
        for (id, node) in dag.nodes() {
            let json = serde_json::to_vec(node).unwrap();
            let back: NodeSpec = serde_json::from_slice(&json).unwrap();
            assert_eq!(&back.node_id(), id);
        }
    }
}
