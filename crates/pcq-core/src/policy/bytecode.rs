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

//! Binary policy modules.
//!
//! A module is a straight-line program over a closed instruction set. All
//! jumps go forward and land on block boundaries, so evaluation always
//! terminates and a block can only be entered at its `Begin`. Decoding runs
//! [`Program::validate`], which also rejects any allowing block that could
//! grant `export` without a license check.

use std::fmt;

use thiserror::Error;

use super::{ActionSet, ReasonCode, RuleKind, Scope};
use crate::digest::{sha256, Hash32};

pub const MODULE_MAGIC: &[u8; 4] = b"LACB";
pub const MODULE_FORMAT_VERSION: u16 = 1;

/// Attribute names the compiler reads implicitly.
pub const ATTR_LICENSE: &str = "license";
pub const ATTR_WARRANT: &str = "warrant";
pub const ATTR_PURPOSE: &str = "purpose";
pub const ATTR_RETENTION: &str = "retention";
pub const ATTR_NOW: &str = "now";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("module truncated at byte {0}")]
    Truncated(usize),
    #[error("bad module magic")]
    BadMagic,
    #[error("unsupported module format version {0}")]
    UnsupportedVersion(u16),
    #[error("invalid utf-8 in string at byte {0}")]
    InvalidUtf8(usize),
    #[error("invalid opcode {opcode:#04x} at instruction {at}")]
    InvalidOpcode { opcode: u8, at: usize },
    #[error("invalid operand at instruction {at}: {reason}")]
    InvalidOperand { at: usize, reason: String },
    #[error("invalid jump at instruction {at}")]
    InvalidJump { at: usize },
    #[error("rule `{rule_id}` can grant export without a license check")]
    UnsafeExport { rule_id: String },
    #[error("malformed program: {0}")]
    Malformed(String),
    #[error("{0} trailing bytes after module")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    Begin {
        rule: u16,
    },
    ActionIn {
        mask: ActionSet,
        skip_to: u32,
    },
    AttrEq {
        scope: Scope,
        key: u32,
        value: u32,
        skip_to: u32,
    },
    AttrNe {
        scope: Scope,
        key: u32,
        value: u32,
        skip_to: u32,
    },
    AttrIn {
        scope: Scope,
        key: u32,
        set: u32,
        skip_to: u32,
    },
    /// Denies `export` unless `resource.license` is in `set`.
    GuardExport {
        set: u32,
    },
    RequireIn {
        scope: Scope,
        key: u32,
        set: u32,
        reason: ReasonCode,
    },
    RequireDurationAtMost {
        scope: Scope,
        key: u32,
        max_secs: u64,
        reason: ReasonCode,
    },
    RequireNotAfter {
        scope: Scope,
        key: u32,
        deadline: u64,
        reason: ReasonCode,
    },
    Deny {
        reason: ReasonCode,
    },
    Grant {
        reason: ReasonCode,
        next: u32,
    },
    DefaultDeny,
    Permit,
}

impl Instr {
    fn opcode(&self) -> u8 {
        match self {
            Instr::Begin { .. } => 0x01,
            Instr::ActionIn { .. } => 0x02,
            Instr::AttrEq { .. } => 0x03,
            Instr::AttrNe { .. } => 0x04,
            Instr::AttrIn { .. } => 0x05,
            Instr::GuardExport { .. } => 0x06,
            Instr::RequireIn { .. } => 0x07,
            Instr::RequireDurationAtMost { .. } => 0x08,
            Instr::RequireNotAfter { .. } => 0x09,
            Instr::Deny { .. } => 0x0a,
            Instr::Grant { .. } => 0x0b,
            Instr::DefaultDeny => 0x0c,
            Instr::Permit => 0x0d,
        }
    }

    /// Forward jump target, if the instruction can branch.
    pub fn jump_target(&self) -> Option<u32> {
        match *self {
            Instr::ActionIn { skip_to, .. }
            | Instr::AttrEq { skip_to, .. }
            | Instr::AttrNe { skip_to, .. }
            | Instr::AttrIn { skip_to, .. } => Some(skip_to),
            Instr::Grant { next, .. } => Some(next),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub id: String,
    pub kind: RuleKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    pub rules: Vec<RuleEntry>,
    pub strings: Vec<String>,
    /// Each set is a sorted list of indices into `strings`.
    pub sets: Vec<Vec<u32>>,
    pub code: Vec<Instr>,
}

impl Program {
    pub fn string(&self, idx: u32) -> &str {
        self.strings
            .get(idx as usize)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn set_contains(&self, set: u32, value: &str) -> bool {
        self.sets
            .get(set as usize)
            .is_some_and(|members| members.iter().any(|m| self.string(*m) == value))
    }

    /// Structural checks run on every decoded module.
    pub fn validate(&self) -> Result<(), DecodeError> {
        let len = self.code.len();
        if !matches!(self.code.last(), Some(Instr::Permit)) {
            return Err(DecodeError::Malformed("program must end with Permit".into()));
        }
        let default_denies: Vec<usize> = self
            .code
            .iter()
            .enumerate()
            .filter(|(_, i)| matches!(i, Instr::DefaultDeny))
            .map(|(pc, _)| pc)
            .collect();
        let &[default_deny] = default_denies.as_slice() else {
            return Err(DecodeError::Malformed(
                "program must contain exactly one DefaultDeny".into(),
            ));
        };
        for (idx, members) in self.sets.iter().enumerate() {
            if members.iter().any(|m| *m as usize >= self.strings.len()) {
                return Err(DecodeError::Malformed(format!(
                    "set {idx} references a missing string"
                )));
            }
        }

        let mut block_start: Option<(usize, u16)> = None;
        for (pc, instr) in self.code.iter().enumerate() {
            self.check_operands(pc, instr)?;
            if let Some(target) = instr.jump_target() {
                let t = target as usize;
                if t <= pc || t >= len || !self.is_block_boundary(t) {
                    return Err(DecodeError::InvalidJump { at: pc });
                }
            }
            match instr {
                Instr::Begin { rule } => block_start = Some((pc, *rule)),
                Instr::DefaultDeny | Instr::Permit => block_start = None,
                _ => {
                    if block_start.is_none() {
                        return Err(DecodeError::Malformed(format!(
                            "instruction {pc} is outside a rule block"
                        )));
                    }
                }
            }
            if let Instr::Grant { next, .. } = instr {
                if pc > default_deny || *next as usize != default_deny + 1 {
                    return Err(DecodeError::InvalidJump { at: pc });
                }
                let Some((start, rule)) = block_start else {
                    return Err(DecodeError::Malformed(format!("grant at {pc} has no rule")));
                };
                self.check_grant_block(start, pc, rule)?;
            }
        }
        Ok(())
    }

    fn is_block_boundary(&self, pc: usize) -> bool {
        matches!(
            self.code.get(pc),
            Some(Instr::Begin { .. } | Instr::DefaultDeny | Instr::Permit)
        )
    }

    fn check_operands(&self, pc: usize, instr: &Instr) -> Result<(), DecodeError> {
        let bad = |reason: &str| DecodeError::InvalidOperand {
            at: pc,
            reason: reason.to_string(),
        };
        let string_ok = |idx: u32| (idx as usize) < self.strings.len();
        let set_ok = |idx: u32| (idx as usize) < self.sets.len();
        match *instr {
            Instr::Begin { rule } if rule as usize >= self.rules.len() => Err(bad("rule index")),
            Instr::AttrEq { key, value, .. } | Instr::AttrNe { key, value, .. }
                if !string_ok(key) || !string_ok(value) =>
            {
                Err(bad("string index"))
            }
            Instr::AttrIn { key, set, .. } | Instr::RequireIn { key, set, .. }
                if !string_ok(key) || !set_ok(set) =>
            {
                Err(bad("string or set index"))
            }
            Instr::GuardExport { set } if !set_ok(set) => Err(bad("set index")),
            Instr::RequireDurationAtMost { key, .. } | Instr::RequireNotAfter { key, .. }
                if !string_ok(key) =>
            {
                Err(bad("string index"))
            }
            Instr::Grant { reason, .. }
                if !matches!(
                    reason,
                    ReasonCode::LicenseGranted | ReasonCode::WarrantGranted | ReasonCode::GrantMatched
                ) =>
            {
                Err(bad("grant with a deny reason"))
            }
            _ => Ok(()),
        }
    }

    /// A block that reaches `Grant` must either be a license block that checks
    /// `resource.license`, exclude `export` from its action mask, or carry a
    /// `GuardExport`. Branches inside the block must leave it entirely.
    fn check_grant_block(&self, start: usize, grant: usize, rule: u16) -> Result<(), DecodeError> {
        let entry = self
            .rules
            .get(rule as usize)
            .ok_or_else(|| DecodeError::Malformed(format!("rule {rule} missing")))?;
        if !entry.kind.is_allowing() {
            return Err(DecodeError::Malformed(format!(
                "rule `{}` of kind {:?} cannot grant",
                entry.id, entry.kind
            )));
        }
        let block = &self.code[start..=grant];
        for (offset, instr) in block.iter().enumerate() {
            if let Some(t) = instr.jump_target() {
                if offset + start != grant && (t as usize) <= grant {
                    return Err(DecodeError::InvalidJump { at: start + offset });
                }
            }
        }
        let license_checked = block.iter().any(|i| {
            matches!(i, Instr::AttrEq { scope: Scope::Resource, key, .. }
                if self.string(*key) == ATTR_LICENSE)
        });
        let export_excluded = block.iter().any(|i| {
            matches!(i, Instr::ActionIn { mask, .. } if !mask.contains(super::Action::Export))
        });
        let guarded = block
            .iter()
            .any(|i| matches!(i, Instr::GuardExport { .. }));
        let safe = match entry.kind {
            RuleKind::License => license_checked || export_excluded,
            _ => export_excluded || guarded,
        };
        if safe {
            Ok(())
        } else {
            Err(DecodeError::UnsafeExport {
                rule_id: entry.id.clone(),
            })
        }
    }
}

/// Header fields bound into the module bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHeader {
    pub name: String,
    pub tenant: String,
    pub version: u64,
    pub source_dsl_hash: Hash32,
}

#[derive(Clone, PartialEq, Eq)]
pub struct PolicyModule {
    pub module_hash: Hash32,
    pub source_dsl_hash: Hash32,
    pub name: String,
    pub tenant: String,
    pub version: u64,
    /// Caller-supplied metadata; not part of the hashed bytes.
    pub compiled_at: u64,
    program: Program,
    bytes: Vec<u8>,
}

impl fmt::Debug for PolicyModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyModule")
            .field("module_hash", &hex::encode(self.module_hash))
            .field("name", &self.name)
            .field("tenant", &self.tenant)
            .field("version", &self.version)
            .field("rules", &self.program.rules.len())
            .field("instructions", &self.program.code.len())
            .finish()
    }
}

impl PolicyModule {
    pub(crate) fn assemble(header: ModuleHeader, program: Program, compiled_at: u64) -> Self {
        let bytes = encode(&header, &program);
        Self {
            module_hash: sha256(&bytes),
            source_dsl_hash: header.source_dsl_hash,
            name: header.name,
            tenant: header.tenant,
            version: header.version,
            compiled_at,
            program,
            bytes,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (header, program) = decode(bytes)?;
        program.validate()?;
        Ok(Self {
            module_hash: sha256(bytes),
            source_dsl_hash: header.source_dsl_hash,
            name: header.name,
            tenant: header.tenant,
            version: header.version,
            compiled_at: 0,
            program,
            bytes: bytes.to_vec(),
        })
    }

    pub fn with_compiled_at(mut self, compiled_at: u64) -> Self {
        self.compiled_at = compiled_at;
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn rule_ids(&self) -> impl Iterator<Item = &str> {
        self.program.rules.iter().map(|r| r.id.as_str())
    }
}

struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }
    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.0.extend_from_slice(s.as_bytes());
    }
}

pub fn encode(header: &ModuleHeader, program: &Program) -> Vec<u8> {
    let mut w = Writer(Vec::with_capacity(256));
    w.0.extend_from_slice(MODULE_MAGIC);
    w.u16(MODULE_FORMAT_VERSION);
    w.str(&header.name);
    w.str(&header.tenant);
    w.u64(header.version);
    w.0.extend_from_slice(&header.source_dsl_hash);

    w.u32(program.rules.len() as u32);
    for rule in &program.rules {
        w.u8(rule.kind.tag());
        w.str(&rule.id);
    }
    w.u32(program.strings.len() as u32);
    for s in &program.strings {
        w.str(s);
    }
    w.u32(program.sets.len() as u32);
    for set in &program.sets {
        w.u32(set.len() as u32);
        for m in set {
            w.u32(*m);
        }
    }
    w.u32(program.code.len() as u32);
    for instr in &program.code {
        w.u8(instr.opcode());
        match *instr {
            Instr::Begin { rule } => w.u16(rule),
            Instr::ActionIn { mask, skip_to } => {
                w.u8(mask.bits());
                w.u32(skip_to);
            }
            Instr::AttrEq {
                scope,
                key,
                value,
                skip_to,
            }
            | Instr::AttrNe {
                scope,
                key,
                value,
                skip_to,
            } => {
                w.u8(scope.tag());
                w.u32(key);
                w.u32(value);
                w.u32(skip_to);
            }
            Instr::AttrIn {
                scope,
                key,
                set,
                skip_to,
            } => {
                w.u8(scope.tag());
                w.u32(key);
                w.u32(set);
                w.u32(skip_to);
            }
            Instr::GuardExport { set } => w.u32(set),
            Instr::RequireIn {
                scope,
                key,
                set,
                reason,
            } => {
                w.u8(scope.tag());
                w.u32(key);
                w.u32(set);
                w.u8(reason.tag());
            }
            Instr::RequireDurationAtMost {
                scope,
                key,
                max_secs: bound,
                reason,
            }
            | Instr::RequireNotAfter {
                scope,
                key,
                deadline: bound,
                reason,
            } => {
                w.u8(scope.tag());
                w.u32(key);
                w.u64(bound);
                w.u8(reason.tag());
            }
            Instr::Deny { reason } => w.u8(reason.tag()),
            Instr::Grant { reason, next } => {
                w.u8(reason.tag());
                w.u32(next);
            }
            Instr::DefaultDeny | Instr::Permit => {}
        }
    }
    w.0
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(DecodeError::Truncated(self.pos))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }
    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(arr))
    }
    fn hash(&mut self) -> Result<Hash32, DecodeError> {
        let mut arr = [0u8; 32];
        arr.copy_from_slice(self.take(32)?);
        Ok(arr)
    }
    fn str(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        let at = self.pos;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8(at))
    }
    /// Reads an element count, refusing counts the remaining input cannot hold.
    fn count(&mut self, min_item_bytes: usize) -> Result<usize, DecodeError> {
        let n = self.u32()? as usize;
        let remaining = self.bytes.len() - self.pos;
        if n.saturating_mul(min_item_bytes) > remaining {
            return Err(DecodeError::Truncated(self.pos));
        }
        Ok(n)
    }
    fn scope(&mut self, at: usize) -> Result<Scope, DecodeError> {
        let tag = self.u8()?;
        Scope::from_tag(tag).ok_or(DecodeError::InvalidOperand {
            at,
            reason: format!("scope tag {tag}"),
        })
    }
    fn reason(&mut self, at: usize) -> Result<ReasonCode, DecodeError> {
        let tag = self.u8()?;
        ReasonCode::from_tag(tag).ok_or(DecodeError::InvalidOperand {
            at,
            reason: format!("reason tag {tag}"),
        })
    }
}

pub fn decode(bytes: &[u8]) -> Result<(ModuleHeader, Program), DecodeError> {
    let mut r = Reader { bytes, pos: 0 };
    if r.take(4).map_err(|_| DecodeError::BadMagic)? != MODULE_MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = r.u16()?;
    if version != MODULE_FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let header = ModuleHeader {
        name: r.str()?,
        tenant: r.str()?,
        version: r.u64()?,
        source_dsl_hash: r.hash()?,
    };

    let mut program = Program::default();
    for _ in 0..r.count(5)? {
        let tag = r.u8()?;
        let kind = RuleKind::from_tag(tag)
            .ok_or_else(|| DecodeError::Malformed(format!("rule kind tag {tag}")))?;
        program.rules.push(RuleEntry { id: r.str()?, kind });
    }
    if program.rules.len() > u16::MAX as usize {
        return Err(DecodeError::Malformed("too many rules".into()));
    }
    for _ in 0..r.count(4)? {
        program.strings.push(r.str()?);
    }
    for _ in 0..r.count(4)? {
        let n = r.count(4)?;
        let mut set = Vec::with_capacity(n);
        for _ in 0..n {
            set.push(r.u32()?);
        }
        program.sets.push(set);
    }
    let n = r.count(1)?;
    for at in 0..n {
        let opcode = r.u8()?;
        let instr = match opcode {
            0x01 => Instr::Begin { rule: r.u16()? },
            0x02 => {
                let bits = r.u8()?;
                let mask = ActionSet::from_bits(bits).ok_or(DecodeError::InvalidOperand {
                    at,
                    reason: format!("action mask {bits:#04x}"),
                })?;
                Instr::ActionIn {
                    mask,
                    skip_to: r.u32()?,
                }
            }
            0x03 | 0x04 => {
                let scope = r.scope(at)?;
                let (key, value, skip_to) = (r.u32()?, r.u32()?, r.u32()?);
                if opcode == 0x03 {
                    Instr::AttrEq {
                        scope,
                        key,
                        value,
                        skip_to,
                    }
                } else {
                    Instr::AttrNe {
                        scope,
                        key,
                        value,
                        skip_to,
                    }
                }
            }
            0x05 => Instr::AttrIn {
                scope: r.scope(at)?,
                key: r.u32()?,
                set: r.u32()?,
                skip_to: r.u32()?,
            },
            0x06 => Instr::GuardExport { set: r.u32()? },
            0x07 => Instr::RequireIn {
                scope: r.scope(at)?,
                key: r.u32()?,
                set: r.u32()?,
                reason: r.reason(at)?,
            },
            0x08 => Instr::RequireDurationAtMost {
                scope: r.scope(at)?,
                key: r.u32()?,
                max_secs: r.u64()?,
                reason: r.reason(at)?,
            },
            0x09 => Instr::RequireNotAfter {
                scope: r.scope(at)?,
                key: r.u32()?,
                deadline: r.u64()?,
                reason: r.reason(at)?,
            },
            0x0a => Instr::Deny {
                reason: r.reason(at)?,
            },
            0x0b => Instr::Grant {
                reason: r.reason(at)?,
                next: r.u32()?,
            },
            0x0c => Instr::DefaultDeny,
            0x0d => Instr::Permit,
            other => return Err(DecodeError::InvalidOpcode { opcode: other, at }),
        };
        program.code.push(instr);
    }
    if r.pos != bytes.len() {
        return Err(DecodeError::TrailingBytes(bytes.len() - r.pos));
    }
    Ok((header, program))
}
