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

//! Side-by-side policy rollout simulation.
//!
//! A historical corpus is evaluated under a baseline and a candidate module.
//! Nothing here touches production state: plan replays run read-only through
//! a scratch overlay and export sinks are never invoked.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cas::{get_json, BlobStore, OverlayCas};
use crate::config::EngineConfig;
use crate::digest::{canonical_json, sha256, Hash32};
use crate::exec::{effective_access, CancelToken, ExecutionMode, Executor};
use crate::operators::row_count;
use crate::plan::{Dag, PlanSpec, SeedMap};
use crate::policy::{evaluate, Action, Attrs, DecisionRecord, Effect, PolicyGate, PolicyModule, ReasonCode};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("corpus line {line} is malformed: {reason}")]
    Corpus { line: usize, reason: String },
    #[error("duplicate query id {0}")]
    DuplicateQuery(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalQuery {
    pub query_id: String,
    #[serde(default, with = "crate::digest::hex32_opt", skip_serializing_if = "Option::is_none")]
    pub plan_hash: Option<Hash32>,
    #[serde(default)]
    pub subject_attrs: Attrs,
    pub action: Action,
    #[serde(default)]
    pub resource_attrs: Attrs,
    #[serde(default)]
    pub context_attrs: Attrs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    /// Seeds of the recorded run, so replayed `sample` nodes pick the same rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seeds: Option<SeedMap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionSummary {
    pub result: Effect,
    pub reason_code: ReasonCode,
    pub cited_rule_id: Option<String>,
}

impl From<&DecisionRecord> for DecisionSummary {
    fn from(d: &DecisionRecord) -> Self {
        Self {
            result: d.result,
            reason_code: d.reason_code,
            cited_rule_id: d.cited_rule_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangedDecision {
    pub query_id: String,
    pub before: DecisionSummary,
    pub after: DecisionSummary,
    pub affected_records: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImpactCounts {
    pub total: u64,
    pub unchanged: u64,
    pub allow_to_deny: u64,
    pub deny_to_allow: u64,
    /// Same result, different reason or cited rule.
    pub reason_changed: u64,
    pub affected_records: u64,
    /// Changed decisions per rule that decided the new outcome.
    pub by_rule: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffReport {
    pub baseline_module_hash: String,
    pub candidate_module_hash: String,
    pub corpus_id: String,
    pub changed_decisions: Vec<ChangedDecision>,
    pub impact_counts: ImpactCounts,
}

impl DiffReport {
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }
}

/// Parses a JSON Lines corpus. Blank lines are skipped.
pub fn load_corpus(bytes: &[u8]) -> Result<Vec<HistoricalQuery>, SimError> {
    let text = std::str::from_utf8(bytes).map_err(|e| SimError::Corpus {
        line: 0,
        reason: e.to_string(),
    })?;
    let mut seen = std::collections::BTreeSet::new();
    let mut corpus = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let query: HistoricalQuery = serde_json::from_str(line).map_err(|e| SimError::Corpus {
            line: idx + 1,
            reason: e.to_string(),
        })?;
        if !seen.insert(query.query_id.clone()) {
            return Err(SimError::DuplicateQuery(query.query_id));
        }
        corpus.push(query);
    }
    Ok(corpus)
}

pub fn corpus_id(corpus: &[HistoricalQuery]) -> Hash32 {
    sha256(&canonical_json(&corpus).unwrap_or_default())
}

/// Evaluates `corpus` under both modules, using each query's `record_count`.
pub fn simulate(
    baseline: &PolicyModule,
    candidate: &PolicyModule,
    corpus: &[HistoricalQuery],
) -> DiffReport {
    Simulator::new().run(baseline, candidate, corpus)
}

#[derive(Default)]
pub struct Simulator {
    plans: Option<(Arc<dyn BlobStore>, EngineConfig)>,
}

impl Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts affected records by replaying each query's plan read-only when
    /// the plan blob is present in `cas`.
    pub fn with_plan_replay(mut self, cas: Arc<dyn BlobStore>, config: EngineConfig) -> Self {
        self.plans = Some((cas, config));
        self
    }

    pub fn run(
        &self,
        baseline: &PolicyModule,
        candidate: &PolicyModule,
        corpus: &[HistoricalQuery],
    ) -> DiffReport {
        let mut counts = ImpactCounts::default();
        let mut changed = Vec::new();
        for query in corpus {
            counts.total += 1;
            let before = self.decide(baseline, query);
            let after = self.decide(candidate, query);
            let (b, a) = (DecisionSummary::from(&before), DecisionSummary::from(&after));
            if b == a {
                counts.unchanged += 1;
                continue;
            }
            match (b.result, a.result) {
                (Effect::Allow, Effect::Deny) => counts.allow_to_deny += 1,
                (Effect::Deny, Effect::Allow) => counts.deny_to_allow += 1,
                _ => counts.reason_changed += 1,
            }
            let permissive = if after.is_allow() { candidate } else { baseline };
            let records = self.affected_records(permissive, query);
            counts.affected_records += records;
            let rule = a
                .cited_rule_id
                .clone()
                .or_else(|| b.cited_rule_id.clone())
                .unwrap_or_else(|| a.reason_code.to_string());
            *counts.by_rule.entry(rule).or_default() += 1;
            changed.push(ChangedDecision {
                query_id: query.query_id.clone(),
                before: b,
                after: a,
                affected_records: records,
            });
        }
        let report = DiffReport {
            baseline_module_hash: hex::encode(baseline.module_hash),
            candidate_module_hash: hex::encode(candidate.module_hash),
            corpus_id: hex::encode(corpus_id(corpus)),
            changed_decisions: changed,
            impact_counts: counts,
        };
        tracing::info!(
            target: "pcq.sim",
            baseline = %report.baseline_module_hash,
            candidate = %report.candidate_module_hash,
            total = report.impact_counts.total,
            allow_to_deny = report.impact_counts.allow_to_deny,
            deny_to_allow = report.impact_counts.deny_to_allow,
            "policy diff simulated"
        );
        report
    }

    fn decide(&self, module: &PolicyModule, q: &HistoricalQuery) -> DecisionRecord {
        evaluate(module, &q.subject_attrs, q.action, &q.resource_attrs, &q.context_attrs)
    }

    fn affected_records(&self, module: &PolicyModule, q: &HistoricalQuery) -> u64 {
        let fallback = q.record_count.unwrap_or(1);
        let (Some((cas, config)), Some(plan_hash)) = (&self.plans, q.plan_hash) else {
            return fallback;
        };
        if !cas.contains(&plan_hash) {
            return fallback;
        }
        let plan: PlanSpec = match get_json(cas.as_ref(), &plan_hash) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(target: "pcq.sim", query = %q.query_id, error = %e, "plan blob unusable");
                return fallback;
            }
        };
        let seeds = q.seeds.clone().unwrap_or_default();
        let Ok(dag) = Dag::compile(&plan, &seeds) else {
            return fallback;
        };
        let gate = PolicyGate::new(
            Arc::new(module.clone()),
            q.subject_attrs.clone(),
            q.context_attrs.clone(),
        );
        let overlay = OverlayCas::new(cas.clone());
        let executor = Executor::new(cas.clone(), config.clone());
        match executor.run_in(&overlay, &dag, Some(&gate), ExecutionMode::ReadOnly, &CancelToken::new()) {
            Ok(result) => result
                .attestations
                .iter()
                .filter(|a| effective_access(&a.node).is_some())
                .filter_map(|a| overlay.get(&a.output_hash).ok())
                .filter_map(|bytes| row_count(&bytes))
                .sum(),
            Err(failure) => {
                tracing::debug!(
                    target: "pcq.sim",
                    query = %q.query_id,
                    error = %failure.error,
                    "plan replay halted; using recorded count"
                );
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::{put_json, MemoryCas};
    use crate::policy::compile_source;
    use serde_json::json;

    fn baseline() -> PolicyModule {
        compile_source(
            r#"lac v1; policy "rollout" tenant "acme" version 1;
               license ccby { license: "CC-BY"; allow: read, export; }"#,
            0,
        )
        .unwrap()
    }

    fn candidate() -> PolicyModule {
        compile_source(
            r#"lac v1; policy "rollout" tenant "acme" version 2;
               license ccby { license: "CC-BY"; allow: read, export; }
               retention short_hold { actions: export; max: 30d; }"#,
            0,
        )
        .unwrap()
    }

    fn query(id: &str, retention: &str) -> HistoricalQuery {
        HistoricalQuery {
            query_id: id.into(),
            plan_hash: None,
            subject_attrs: Attrs::new(),
            action: Action::Export,
            resource_attrs: [
                ("license".to_string(), "CC-BY".to_string()),
                ("retention".to_string(), retention.to_string()),
            ]
            .into(),
            context_attrs: Attrs::new(),
            record_count: Some(10),
            seeds: None,
        }
    }

    #[test]
    fn retention_rule_flips_only_long_holds() {
        let corpus = vec![query("q1", "7d"), query("q2", "90d"), query("q3", "30d")];
        let report = simulate(&baseline(), &candidate(), &corpus);
        assert_eq!(report.impact_counts.total, 3);
        assert_eq!(report.impact_counts.unchanged, 2);
        assert_eq!(report.impact_counts.allow_to_deny, 1);
        assert_eq!(report.impact_counts.affected_records, 10);
        let change = &report.changed_decisions[0];
        assert_eq!(change.query_id, "q2");
        assert_eq!(change.before.cited_rule_id.as_deref(), Some("ccby"));
        assert_eq!(change.after.cited_rule_id.as_deref(), Some("short_hold"));
        assert_eq!(change.after.reason_code, ReasonCode::RetentionExceeded);
        assert_eq!(report.impact_counts.by_rule.get("short_hold"), Some(&1));
    }

    #[test]
    fn identical_modules_change_nothing() {
        let corpus = vec![query("q1", "7d"), query("q2", "90d")];
        let report = simulate(&baseline(), &baseline(), &corpus);
        assert!(report.changed_decisions.is_empty());
        assert_eq!(report.impact_counts.unchanged, 2);
    }

    #[test]
    fn corpus_loads_from_json_lines() {
        let text = format!(
            "{}\n\n{}\n",
            serde_json::to_string(&query("a", "1d")).unwrap(),
            serde_json::to_string(&query("b", "2d")).unwrap()
        );
        let corpus = load_corpus(text.as_bytes()).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus_id(&corpus), corpus_id(&corpus.clone()));
        assert!(matches!(
            load_corpus(b"{\"query_id\": 1}"),
            Err(SimError::Corpus { line: 1, .. })
        ));
        let dup = format!("{0}\n{0}\n", serde_json::to_string(&query("a", "1d")).unwrap());
        assert_eq!(
            load_corpus(dup.as_bytes()),
            Err(SimError::DuplicateQuery("a".into()))
        );
    }

    #[test]
    fn plan_replay_counts_governed_rows_without_exporting() {
        let cas = Arc::new(MemoryCas::new());
        let rows: Vec<_> = (0..6).map(|i| json!({"id": i})).collect();
        let source = cas.put(&serde_json::to_vec_pretty(&rows).unwrap()).unwrap();
        let plan: PlanSpec = serde_json::from_value(json!({
            "nodes": [
                {"name": "load", "operator": "load", "inputs": [{"blob": hex::encode(source)}]},
                {"name": "ship", "operator": "export", "inputs": [{"node": "load"}],
                 "governed": {"action": "export",
                              "resource": {"license": "CC-BY", "retention": "90d"}}}
            ]
        }))
        .unwrap();
        let plan_hash = put_json(cas.as_ref(), &plan).unwrap();
        let blobs_before = cas.len();

        let mut q = query("q", "90d");
        q.plan_hash = Some(plan_hash);
        let report = Simulator::new()
            .with_plan_replay(cas.clone(), EngineConfig::default())
            .run(&baseline(), &candidate(), &[q]);
        assert_eq!(report.changed_decisions.len(), 1);
        assert_eq!(report.changed_decisions[0].affected_records, 6);
        assert_eq!(cas.len(), blobs_before);
    }

    #[test]
    fn plan_replay_uses_the_recorded_seeds() {
        let cas = Arc::new(MemoryCas::new());
        let rows: Vec<_> = (0..40).map(|i| json!({"id": i})).collect();
        let source = cas.put(&serde_json::to_vec(&rows).unwrap()).unwrap();
        let plan: PlanSpec = serde_json::from_value(json!({
            "nodes": [
                {"name": "load", "operator": "load", "inputs": [{"blob": hex::encode(source)}]},
                {"name": "pick", "operator": "sample", "inputs": [{"node": "load"}],
                 "params": {"per_mille": 500}},
                {"name": "ship", "operator": "export", "inputs": [{"node": "pick"}],
                 "governed": {"action": "export",
                              "resource": {"license": "CC-BY", "retention": "90d"}}}
            ]
        }))
        .unwrap();
        let plan_hash = put_json(cas.as_ref(), &plan).unwrap();
        let gate = PolicyGate::new(Arc::new(baseline()), Attrs::new(), Attrs::new());

        let mut counts = std::collections::BTreeSet::new();
        for master in 1..=6u64 {
            let seeds = SeedMap::new(master);
            let recorded = Executor::new(cas.clone(), EngineConfig::default())
                .execute(&plan, &seeds, Some(&gate))
                .unwrap();
            let expected: u64 = recorded
                .attestations
                .iter()
                .filter(|a| effective_access(&a.node).is_some())
                .filter_map(|a| cas.get(&a.output_hash).ok())
                .filter_map(|bytes| row_count(&bytes))
                .sum();

            let mut q = query("q", "90d");
            q.plan_hash = Some(plan_hash);
            q.record_count = None;
            q.seeds = Some(seeds);
            let report = Simulator::new()
                .with_plan_replay(cas.clone(), EngineConfig::default())
                .run(&candidate(), &baseline(), &[q]);
            assert_eq!(report.impact_counts.deny_to_allow, 1);
            assert_eq!(report.changed_decisions[0].affected_records, expected);
            counts.insert(expected);
        }
        assert!(counts.len() > 1);
    }
}
