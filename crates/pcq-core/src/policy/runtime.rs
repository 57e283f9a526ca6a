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

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::bytecode::{Instr, PolicyModule, Program, ATTR_LICENSE};
use super::{parse_duration_secs, Action, Attrs, Effect, ReasonCode, Scope};
use crate::digest::{append_attrs, sha256_domain, Hash32, DOMAIN_DECISION_V1};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    #[serde(with = "crate::digest::hex32")]
    pub decision_id: Hash32,
    #[serde(with = "crate::digest::hex32")]
    pub module_hash: Hash32,
    pub policy_version: u64,
    pub subject_attrs: Attrs,
    pub action: Action,
    pub resource_attrs: Attrs,
    pub context_attrs: Attrs,
    pub result: Effect,
    pub reason_code: ReasonCode,
    pub cited_rule_id: Option<String>,
}

impl DecisionRecord {
    pub fn is_allow(&self) -> bool {
        self.result.is_allow()
    }

    /// Evaluates the same request against `module`.
    pub fn reevaluate(&self, module: &PolicyModule) -> DecisionRecord {
        evaluate(
            module,
            &self.subject_attrs,
            self.action,
            &self.resource_attrs,
            &self.context_attrs,
        )
    }
}

pub fn decision_id(
    module_hash: &Hash32,
    subject: &Attrs,
    action: Action,
    resource: &Attrs,
    context: &Attrs,
) -> Hash32 {
    let mut payload = Vec::with_capacity(128);
    payload.extend_from_slice(module_hash);
    append_attrs(&mut payload, subject);
    payload.push(action.tag());
    append_attrs(&mut payload, resource);
    append_attrs(&mut payload, context);
    sha256_domain(DOMAIN_DECISION_V1, &payload)
}

struct Outcome {
    effect: Effect,
    reason: ReasonCode,
    rule: Option<u16>,
}

impl Outcome {
    fn deny(reason: ReasonCode, rule: Option<u16>) -> Self {
        Self {
            effect: Effect::Deny,
            reason,
            rule,
        }
    }
}

struct Request<'a> {
    subject: &'a Attrs,
    action: Action,
    resource: &'a Attrs,
    context: &'a Attrs,
}

impl Request<'_> {
    fn attr(&self, scope: Scope, key: &str) -> Option<&str> {
        let bag = match scope {
            Scope::Subject => self.subject,
            Scope::Resource => self.resource,
            Scope::Context => self.context,
        };
        bag.get(key).map(String::as_str)
    }
}

fn run(program: &Program, req: &Request<'_>) -> Outcome {
    let code = &program.code;
    let mut pc = 0usize;
    let mut rule: Option<u16> = None;
    let mut granted: Option<(u16, ReasonCode)> = None;

    // Conditions read attributes that must be present; a missing attribute
    // never satisfies `==`, `!=` or `in`.
    while let Some(instr) = code.get(pc) {
        let mut next = pc + 1;
        match *instr {
            Instr::Begin { rule: r } => rule = Some(r),
            Instr::ActionIn { mask, skip_to } => {
                if !mask.contains(req.action) {
                    next = skip_to as usize;
                }
            }
            Instr::AttrEq {
                scope,
                key,
                value,
                skip_to,
            } => {
                if req.attr(scope, program.string(key)) != Some(program.string(value)) {
                    next = skip_to as usize;
                }
            }
            Instr::AttrNe {
                scope,
                key,
                value,
                skip_to,
            } => match req.attr(scope, program.string(key)) {
                Some(v) if v != program.string(value) => {}
                _ => next = skip_to as usize,
            },
            Instr::AttrIn {
                scope,
                key,
                set,
                skip_to,
            } => {
                let hit = req
                    .attr(scope, program.string(key))
                    .is_some_and(|v| program.set_contains(set, v));
                if !hit {
                    next = skip_to as usize;
                }
            }
            Instr::GuardExport { set } => {
                if req.action == Action::Export {
                    let licensed = req
                        .attr(Scope::Resource, ATTR_LICENSE)
                        .is_some_and(|l| program.set_contains(set, l));
                    if !licensed {
                        return Outcome::deny(ReasonCode::UnlicensedExport, rule);
                    }
                }
            }
            Instr::RequireIn {
                scope,
                key,
                set,
                reason,
            } => {
                let ok = req
                    .attr(scope, program.string(key))
                    .is_some_and(|v| program.set_contains(set, v));
                if !ok {
                    return Outcome::deny(reason, rule);
                }
            }
            Instr::RequireDurationAtMost {
                scope,
                key,
                max_secs,
                reason,
            } => match req.attr(scope, program.string(key)).and_then(parse_duration_secs) {
                None => return Outcome::deny(ReasonCode::RetentionUnknown, rule),
                Some(secs) if secs > max_secs => return Outcome::deny(reason, rule),
                Some(_) => {}
            },
            Instr::RequireNotAfter {
                scope,
                key,
                deadline,
                reason,
            } => {
                let now = req
                    .attr(scope, program.string(key))
                    .and_then(|v| v.trim().parse::<u64>().ok());
                match now {
                    Some(now) if now <= deadline => {}
                    _ => return Outcome::deny(reason, rule),
                }
            }
            Instr::Deny { reason } => return Outcome::deny(reason, rule),
            Instr::Grant { reason, next: n } => {
                if let Some(r) = rule {
                    granted = Some((r, reason));
                }
                next = n as usize;
            }
            Instr::DefaultDeny => return Outcome::deny(ReasonCode::NoMatchingRule, None),
            Instr::Permit => {
                return match granted {
                    Some((r, reason)) => Outcome {
                        effect: Effect::Allow,
                        reason,
                        rule: Some(r),
                    },
                    None => Outcome::deny(ReasonCode::NoMatchingRule, None),
                };
            }
        }
        if next <= pc {
            break;
        }
        pc = next;
    }
    Outcome::deny(ReasonCode::NoMatchingRule, None)
}

/// Evaluates one request. Pure: the same module and inputs always produce the
/// same record, including its `decision_id`.
pub fn evaluate(
    module: &PolicyModule,
    subject: &Attrs,
    action: Action,
    resource: &Attrs,
    context: &Attrs,
) -> DecisionRecord {
    let program = module.program();
    let outcome = run(
        program,
        &Request {
            subject,
            action,
            resource,
            context,
        },
    );
    DecisionRecord {
        decision_id: decision_id(&module.module_hash, subject, action, resource, context),
        module_hash: module.module_hash,
        policy_version: module.version,
        subject_attrs: subject.clone(),
        action,
        resource_attrs: resource.clone(),
        context_attrs: context.clone(),
        result: outcome.effect,
        reason_code: outcome.reason,
        cited_rule_id: outcome
            .rule
            .and_then(|r| program.rules.get(r as usize))
            .map(|r| r.id.clone()),
    }
}

/// The module plus the fixed request parties a DAG run is gated with.
#[derive(Debug, Clone)]
pub struct PolicyGate {
    pub module: Arc<PolicyModule>,
    pub subject: Attrs,
    pub context: Attrs,
}

impl PolicyGate {
    pub fn new(module: Arc<PolicyModule>, subject: Attrs, context: Attrs) -> Self {
        Self {
            module,
            subject,
            context,
        }
    }

    pub fn check(&self, action: Action, resource: &Attrs) -> DecisionRecord {
        let decision = evaluate(&self.module, &self.subject, action, resource, &self.context);
        tracing::debug!(
            target: "pcq.policy",
            decision_id = %hex::encode(decision.decision_id),
            action = %action,
            result = ?decision.result,
            reason = %decision.reason_code,
            rule = decision.cited_rule_id.as_deref().unwrap_or("-"),
            "policy decision"
        );
        decision
    }
}
