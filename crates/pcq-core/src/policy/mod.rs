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

//! LAC policy language: source text, compiled modules and evaluation.
//!
//! Source goes through [`lexer`] and [`parser`] into a clause list, the
//! [`compiler`] lowers it to the closed instruction set in [`bytecode`], and
//! [`runtime`] evaluates a module against one request. Modules are stored and
//! activated per tenant by [`store`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod bytecode;
pub mod compiler;
pub mod lexer;
pub mod parser;
pub mod runtime;
pub mod store;

pub use bytecode::{DecodeError, PolicyModule};
pub use compiler::{compile_source, CompileError, PolicyCompiler};
pub use runtime::{evaluate, DecisionRecord, PolicyGate};
pub use store::{ModuleResolver, ModuleSet, PolicyStore, StoreError};

/// Attribute bag for subjects, resources and request context.
pub type Attrs = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Export,
    Delete,
    Aggregate,
    Join,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Read,
        Action::Write,
        Action::Export,
        Action::Delete,
        Action::Aggregate,
        Action::Join,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Export => "export",
            Action::Delete => "delete",
            Action::Aggregate => "aggregate",
            Action::Join => "join",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == raw)
    }

    pub fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ActionSet(u8);

impl ActionSet {
    pub const EMPTY: ActionSet = ActionSet(0);

    pub fn from_bits(bits: u8) -> Option<Self> {
        let all = Action::ALL.iter().fold(0u8, |acc, a| acc | a.bit());
        (bits & !all == 0).then_some(Self(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn insert(&mut self, action: Action) -> bool {
        let fresh = !self.contains(action);
        self.0 |= action.bit();
        fresh
    }

    pub fn contains(self, action: Action) -> bool {
        self.0 & action.bit() != 0
    }

    pub fn intersects(self, other: ActionSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Action> {
        Action::ALL.into_iter().filter(move |a| self.contains(*a))
    }
}

impl FromIterator<Action> for ActionSet {
    fn from_iter<I: IntoIterator<Item = Action>>(iter: I) -> Self {
        let mut set = ActionSet::EMPTY;
        for a in iter {
            set.insert(a);
        }
        set
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn is_allow(self) -> bool {
        matches!(self, Effect::Allow)
    }
}

/// Why a decision came out the way it did. Stable strings; they appear in
/// decision records, manifests and simulation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    LicenseGranted,
    WarrantGranted,
    GrantMatched,
    NoMatchingRule,
    ExplicitDeny,
    PurposeMismatch,
    RetentionExceeded,
    RetentionUnknown,
    WarrantExpired,
    UnlicensedExport,
}

impl ReasonCode {
    const ALL: [ReasonCode; 10] = [
        ReasonCode::LicenseGranted,
        ReasonCode::WarrantGranted,
        ReasonCode::GrantMatched,
        ReasonCode::NoMatchingRule,
        ReasonCode::ExplicitDeny,
        ReasonCode::PurposeMismatch,
        ReasonCode::RetentionExceeded,
        ReasonCode::RetentionUnknown,
        ReasonCode::WarrantExpired,
        ReasonCode::UnlicensedExport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::LicenseGranted => "license_granted",
            ReasonCode::WarrantGranted => "warrant_granted",
            ReasonCode::GrantMatched => "grant_matched",
            ReasonCode::NoMatchingRule => "no_matching_rule",
            ReasonCode::ExplicitDeny => "explicit_deny",
            ReasonCode::PurposeMismatch => "purpose_mismatch",
            ReasonCode::RetentionExceeded => "retention_exceeded",
            ReasonCode::RetentionUnknown => "retention_unknown",
            ReasonCode::WarrantExpired => "warrant_expired",
            ReasonCode::UnlicensedExport => "unlicensed_export",
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which attribute bag a condition reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    Subject,
    Resource,
    Context,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Subject => "subject",
            Scope::Resource => "resource",
            Scope::Context => "context",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "subject" => Some(Scope::Subject),
            "resource" => Some(Scope::Resource),
            "context" => Some(Scope::Context),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Scope::Subject),
            1 => Some(Scope::Resource),
            2 => Some(Scope::Context),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    License,
    Warrant,
    Purpose,
    Retention,
    Grant,
    Deny,
}

impl RuleKind {
    pub const ALL: [RuleKind; 6] = [
        RuleKind::License,
        RuleKind::Warrant,
        RuleKind::Purpose,
        RuleKind::Retention,
        RuleKind::Grant,
        RuleKind::Deny,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            RuleKind::License => "license",
            RuleKind::Warrant => "warrant",
            RuleKind::Purpose => "purpose",
            RuleKind::Retention => "retention",
            RuleKind::Grant => "grant",
            RuleKind::Deny => "deny",
        }
    }

    pub fn from_keyword(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.keyword() == raw)
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// Rules whose match can produce an allow.
    pub fn is_allowing(self) -> bool {
        matches!(self, RuleKind::License | RuleKind::Warrant | RuleKind::Grant)
    }
}

/// Parses `30d`, `12h`, `15m`, `90s` or a bare number of seconds.
pub fn parse_duration_secs(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, unit) = match raw.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&raw[..idx], c),
        Some(_) => (raw, 's'),
        None => return None,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u64 = digits.parse().ok()?;
    let mult = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        _ => return None,
    };
    n.checked_mul(mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_set_tracks_membership() {
        let set: ActionSet = [Action::Read, Action::Export].into_iter().collect();
        assert!(set.contains(Action::Read));
        assert!(!set.contains(Action::Delete));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Action::Read, Action::Export]);
        assert!(ActionSet::from_bits(0x80).is_none());
        assert_eq!(ActionSet::from_bits(set.bits()), Some(set));
    }

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration_secs("30d"), Some(30 * 86_400));
        assert_eq!(parse_duration_secs("90"), Some(90));
        assert_eq!(parse_duration_secs("2h"), Some(7_200));
        assert_eq!(parse_duration_secs("d"), None);
        assert_eq!(parse_duration_secs("3w"), None);
        assert_eq!(parse_duration_secs(""), None);
    }

    #[test]
    fn tags_round_trip() {
        for a in Action::ALL {
            assert_eq!(Action::from_tag(a.tag()), Some(a));
            assert_eq!(Action::parse(a.as_str()), Some(a));
        }
        for r in ReasonCode::ALL {
            assert_eq!(ReasonCode::from_tag(r.tag()), Some(r));
        }
    }
}
