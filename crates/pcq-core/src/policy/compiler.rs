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

//! Lowers parsed `lac v1` sources into policy modules.
//!
//! Compilation is a pure function of the source text (and, for the version
//! check, the prior module). It never reads clocks, the environment or a
//! random source, so recompiling the same text yields the same module hash.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::bytecode::{
    Instr, ModuleHeader, PolicyModule, Program, RuleEntry, ATTR_LICENSE, ATTR_NOW, ATTR_PURPOSE,
    ATTR_RETENTION, ATTR_WARRANT,
};
use super::lexer::{normalize, tokenize};
use super::parser::{parse, Clause, ClauseBody, CondOp, Condition, PolicySource};
use super::{Action, ActionSet, ReasonCode, RuleKind, Scope};
use crate::cas::BlobStore;
use crate::digest::{sha256_domain, Hash32, DOMAIN_SOURCE_V1};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum CompileError {
    #[error("grammar error at {line}:{col}: {message}")]
    GrammarError { line: u32, col: u32, message: String },
    #[error("unknown clause `{clause}` at {line}:{col}{}", .suggestion.as_ref().map(|s| format!("; did you mean `{s}`?")).unwrap_or_default())]
    UnknownClause {
        clause: String,
        suggestion: Option<String>,
        line: u32,
        col: u32,
    },
    #[error("rule `{rule_id}` has unknown field `{field}` at {line}:{col}")]
    UnknownField {
        rule_id: String,
        field: String,
        line: u32,
        col: u32,
    },
    #[error("rule `{rule_id}` is missing required field `{field}`")]
    MissingField { rule_id: String, field: String },
    #[error("unknown action `{action}` at {line}:{col}")]
    UnknownAction { action: String, line: u32, col: u32 },
    #[error("rule id `{rule_id}` is declared twice (second at {line}:{col})")]
    DuplicateRule { rule_id: String, line: u32, col: u32 },
    #[error("rules `{rule_a}` and `{rule_b}` conflict: {detail}")]
    ConflictingRule {
        rule_a: String,
        rule_b: String,
        detail: String,
    },
    #[error("policy version {declared} does not increase on prior version {prior}")]
    VersionNotMonotonic { prior: u64, declared: u64 },
    #[error("policy tenant `{declared}` differs from prior module tenant `{prior}`")]
    TenantMismatch { prior: String, declared: String },
    #[error("prior module {module_hash} is unavailable: {reason}")]
    PriorModuleUnavailable { module_hash: String, reason: String },
    #[error("storing compiled module failed: {0}")]
    StoreFailed(String),
}

pub fn source_dsl_hash(normalized: &str) -> Hash32 {
    sha256_domain(DOMAIN_SOURCE_V1, normalized.as_bytes())
}

/// Compiles source text without a prior-version check.
pub fn compile_source(source: &str, compiled_at: u64) -> Result<PolicyModule, CompileError> {
    let tokens = tokenize(source)?;
    let normalized = normalize(&tokens);
    let parsed = parse(&tokens)?;
    detect_conflicts(&parsed.clauses)?;
    let program = lower(&parsed);
    let header = ModuleHeader {
        name: parsed.name,
        tenant: parsed.tenant,
        version: parsed.version,
        source_dsl_hash: source_dsl_hash(&normalized),
    };
    Ok(PolicyModule::assemble(header, program, compiled_at))
}

/// Compiler bound to a blob store: resolves prior modules from it and stores
/// the compiled bytes under their module hash.
pub struct PolicyCompiler {
    store: Arc<dyn BlobStore>,
    compiled_at: u64,
}

impl PolicyCompiler {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            compiled_at: 0,
        }
    }

    pub fn with_compiled_at(mut self, compiled_at: u64) -> Self {
        self.compiled_at = compiled_at;
        self
    }

    pub fn compile(
        &self,
        source: &str,
        prior_module_hash: Option<&Hash32>,
    ) -> Result<PolicyModule, CompileError> {
        let module = compile_source(source, self.compiled_at)?;
        if let Some(prior_hash) = prior_module_hash {
            let unavailable = |reason: String| CompileError::PriorModuleUnavailable {
                module_hash: hex::encode(prior_hash),
                reason,
            };
            let bytes = self
                .store
                .get(prior_hash)
                .map_err(|e| unavailable(e.to_string()))?;
            let prior = PolicyModule::from_bytes(&bytes).map_err(|e| unavailable(e.to_string()))?;
            if prior.tenant != module.tenant {
                return Err(CompileError::TenantMismatch {
                    prior: prior.tenant,
                    declared: module.tenant,
                });
            }
            if module.version <= prior.version {
                return Err(CompileError::VersionNotMonotonic {
                    prior: prior.version,
                    declared: module.version,
                });
            }
        }
        self.store
            .put(module.bytes())
            .map_err(|e| CompileError::StoreFailed(e.to_string()))?;
        tracing::info!(
            target: "pcq.policy",
            module_hash = %hex::encode(module.module_hash),
            tenant = %module.tenant,
            version = module.version,
            rules = module.program().rules.len(),
            "compiled policy module"
        );
        Ok(module)
    }
}

/// Allowed values for one attribute under a conjunction of conditions.
#[derive(Default)]
struct Domain {
    allowed: Option<BTreeSet<String>>,
    excluded: BTreeSet<String>,
}

impl Domain {
    fn restrict(&mut self, values: impl IntoIterator<Item = String>) {
        let incoming: BTreeSet<String> = values.into_iter().collect();
        self.allowed = Some(match self.allowed.take() {
            Some(current) => current.intersection(&incoming).cloned().collect(),
            None => incoming,
        });
    }

    fn satisfiable(&self) -> bool {
        match &self.allowed {
            Some(allowed) => allowed.iter().any(|v| !self.excluded.contains(v)),
            None => true,
        }
    }
}

fn implicit_conditions(clause: &Clause) -> Vec<Condition> {
    let mut out = clause.body.conditions().to_vec();
    match &clause.body {
        ClauseBody::License { license, .. } => out.push(Condition {
            scope: Scope::Resource,
            key: ATTR_LICENSE.to_string(),
            op: CondOp::Eq(license.clone()),
        }),
        ClauseBody::Warrant { authority, .. } => out.push(Condition {
            scope: Scope::Context,
            key: ATTR_WARRANT.to_string(),
            op: CondOp::Eq(authority.clone()),
        }),
        _ => {}
    }
    out
}

/// True when some attribute assignment satisfies every condition.
fn jointly_satisfiable<'a>(conditions: impl IntoIterator<Item = &'a Condition>) -> bool {
    let mut domains: BTreeMap<(Scope, &str), Domain> = BTreeMap::new();
    for c in conditions {
        let d = domains.entry((c.scope, c.key.as_str())).or_default();
        match &c.op {
            CondOp::Eq(v) => d.restrict([v.clone()]),
            CondOp::In(vs) => d.restrict(vs.iter().cloned()),
            CondOp::Ne(v) => {
                d.excluded.insert(v.clone());
            }
        }
    }
    domains.values().all(Domain::satisfiable)
}

fn describe_actions(set: ActionSet) -> String {
    set.iter().map(Action::as_str).collect::<Vec<_>>().join(", ")
}

fn detect_conflicts(clauses: &[Clause]) -> Result<(), CompileError> {
    for (i, a) in clauses.iter().enumerate() {
        for b in &clauses[i + 1..] {
            let (ka, kb) = (a.body.kind(), b.body.kind());
            let overlap = ActionSet::from_bits(a.body.actions().bits() & b.body.actions().bits())
                .unwrap_or_default();
            if overlap.is_empty() {
                continue;
            }
            let allow_vs_deny = (ka.is_allowing() && kb == RuleKind::Deny)
                || (kb.is_allowing() && ka == RuleKind::Deny);
            if allow_vs_deny {
                let ca = implicit_conditions(a);
                let cb = implicit_conditions(b);
                if jointly_satisfiable(ca.iter().chain(cb.iter())) {
                    return Err(CompileError::ConflictingRule {
                        rule_a: a.id.clone(),
                        rule_b: b.id.clone(),
                        detail: format!(
                            "both match some request for [{}] with opposite effects",
                            describe_actions(overlap)
                        ),
                    });
                }
            }
            if let (
                ClauseBody::Purpose { require: ra, .. },
                ClauseBody::Purpose { require: rb, .. },
            ) = (&a.body, &b.body)
            {
                if !ra.iter().any(|p| rb.contains(p)) {
                    return Err(CompileError::ConflictingRule {
                        rule_a: a.id.clone(),
                        rule_b: b.id.clone(),
                        detail: format!(
                            "no purpose satisfies both for [{}]",
                            describe_actions(overlap)
                        ),
                    });
                }
            }
        }
    }
    Ok(())
}

const PENDING: u32 = u32::MAX;

#[derive(Default)]
struct Builder {
    program: Program,
    strings: BTreeMap<String, u32>,
    sets: BTreeMap<Vec<u32>, u32>,
}

impl Builder {
    fn string(&mut self, s: &str) -> u32 {
        if let Some(idx) = self.strings.get(s) {
            return *idx;
        }
        let idx = self.program.strings.len() as u32;
        self.program.strings.push(s.to_string());
        self.strings.insert(s.to_string(), idx);
        idx
    }

    fn set<'a>(&mut self, values: impl IntoIterator<Item = &'a str>) -> u32 {
        let mut members: Vec<u32> = values.into_iter().map(|v| self.string(v)).collect();
        members.sort_unstable();
        members.dedup();
        if let Some(idx) = self.sets.get(&members) {
            return *idx;
        }
        let idx = self.program.sets.len() as u32;
        self.program.sets.push(members.clone());
        self.sets.insert(members, idx);
        idx
    }

    fn emit(&mut self, instr: Instr) {
        self.program.code.push(instr);
    }

    fn here(&self) -> u32 {
        self.program.code.len() as u32
    }

    fn begin(&mut self, rule: usize, clause: &Clause) {
        self.program.rules.push(RuleEntry {
            id: clause.id.clone(),
            kind: clause.body.kind(),
        });
        self.emit(Instr::Begin { rule: rule as u16 });
        self.emit(Instr::ActionIn {
            mask: clause.body.actions(),
            skip_to: PENDING,
        });
    }

    fn condition(&mut self, c: &Condition) {
        let key = self.string(&c.key);
        let instr = match &c.op {
            CondOp::Eq(v) => Instr::AttrEq {
                scope: c.scope,
                key,
                value: self.string(v),
                skip_to: PENDING,
            },
            CondOp::Ne(v) => Instr::AttrNe {
                scope: c.scope,
                key,
                value: self.string(v),
                skip_to: PENDING,
            },
            CondOp::In(vs) => Instr::AttrIn {
                scope: c.scope,
                key,
                set: self.set(vs.iter().map(String::as_str)),
                skip_to: PENDING,
            },
        };
        self.emit(instr);
    }

    /// Points every pending branch emitted since `start` at the current end.
    fn close_block(&mut self, start: usize) {
        let end = self.here();
        for instr in &mut self.program.code[start..] {
            match instr {
                Instr::ActionIn { skip_to, .. }
                | Instr::AttrEq { skip_to, .. }
                | Instr::AttrNe { skip_to, .. }
                | Instr::AttrIn { skip_to, .. }
                    if *skip_to == PENDING =>
                {
                    *skip_to = end;
                }
                _ => {}
            }
        }
    }
}

fn lower(source: &PolicySource) -> Program {
    let mut b = Builder::default();
    let export_licenses: Vec<&str> = source
        .clauses
        .iter()
        .filter_map(|c| match &c.body {
            ClauseBody::License { license, allow, .. } if allow.contains(Action::Export) => {
                Some(license.as_str())
            }
            _ => None,
        })
        .collect();
    let export_guard = b.set(export_licenses.iter().copied());

    let by_kind = |kind: RuleKind| source.clauses.iter().filter(move |c| c.body.kind() == kind);
    let mut ordered: Vec<&Clause> = by_kind(RuleKind::Deny).collect();
    ordered.extend(by_kind(RuleKind::License));
    ordered.extend(by_kind(RuleKind::Warrant));
    ordered.extend(by_kind(RuleKind::Grant));

    let mut grants = Vec::new();
    for clause in ordered {
        let rule = b.program.rules.len();
        let start = b.program.code.len();
        b.begin(rule, clause);
        match &clause.body {
            ClauseBody::Deny { conditions, .. } => {
                for c in conditions {
                    b.condition(c);
                }
                b.emit(Instr::Deny {
                    reason: ReasonCode::ExplicitDeny,
                });
            }
            ClauseBody::License {
                license,
                conditions,
                ..
            } => {
                b.condition(&Condition {
                    scope: Scope::Resource,
                    key: ATTR_LICENSE.to_string(),
                    op: CondOp::Eq(license.clone()),
                });
                for c in conditions {
                    b.condition(c);
                }
                grants.push(b.program.code.len());
                b.emit(Instr::Grant {
                    reason: ReasonCode::LicenseGranted,
                    next: PENDING,
                });
            }
            ClauseBody::Warrant {
                authority,
                allow,
                expires,
                conditions,
            } => {
                b.condition(&Condition {
                    scope: Scope::Context,
                    key: ATTR_WARRANT.to_string(),
                    op: CondOp::Eq(authority.clone()),
                });
                for c in conditions {
                    b.condition(c);
                }
                if allow.contains(Action::Export) {
                    b.emit(Instr::GuardExport { set: export_guard });
                }
                if let Some(deadline) = expires {
                    let key = b.string(ATTR_NOW);
                    b.emit(Instr::RequireNotAfter {
                        scope: Scope::Context,
                        key,
                        deadline: *deadline,
                        reason: ReasonCode::WarrantExpired,
                    });
                }
                grants.push(b.program.code.len());
                b.emit(Instr::Grant {
                    reason: ReasonCode::WarrantGranted,
                    next: PENDING,
                });
            }
            ClauseBody::Grant {
                allow, conditions, ..
            } => {
                for c in conditions {
                    b.condition(c);
                }
                if allow.contains(Action::Export) {
                    b.emit(Instr::GuardExport { set: export_guard });
                }
                grants.push(b.program.code.len());
                b.emit(Instr::Grant {
                    reason: ReasonCode::GrantMatched,
                    next: PENDING,
                });
            }
            ClauseBody::Purpose { .. } | ClauseBody::Retention { .. } => {}
        }
        b.close_block(start);
    }

    b.emit(Instr::DefaultDeny);
    let constraints_at = b.here();
    for pc in grants {
        if let Instr::Grant { next, .. } = &mut b.program.code[pc] {
            *next = constraints_at;
        }
    }

    for clause in &source.clauses {
        let rule = b.program.rules.len();
        let start = b.program.code.len();
        match &clause.body {
            ClauseBody::Purpose { require, .. } => {
                b.begin(rule, clause);
                let key = b.string(ATTR_PURPOSE);
                let set = b.set(require.iter().map(String::as_str));
                b.emit(Instr::RequireIn {
                    scope: Scope::Context,
                    key,
                    set,
                    reason: ReasonCode::PurposeMismatch,
                });
            }
            ClauseBody::Retention { max_secs, .. } => {
                b.begin(rule, clause);
                let key = b.string(ATTR_RETENTION);
                b.emit(Instr::RequireDurationAtMost {
                    scope: Scope::Resource,
                    key,
                    max_secs: *max_secs,
                    reason: ReasonCode::RetentionExceeded,
                });
            }
            _ => continue,
        }
        b.close_block(start);
    }
    b.emit(Instr::Permit);
    b.program
}
