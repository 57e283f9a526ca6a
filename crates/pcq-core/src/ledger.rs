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

//! Append-only, hash-chained receipt ledger.
//!
//! Each tenant has its own chain stored as `<tenant>.log` (u32 little-endian
//! length-prefixed JSON receipts) plus a `<tenant>.head` checkpoint naming the
//! last appended receipt, so truncating the tail is as detectable as editing
//! or removing a record in the middle.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::{
    append_str, append_u64, sha256_domain, Hash32, DOMAIN_RECEIPT_ID_V1, DOMAIN_RECEIPT_V1,
};
use crate::manifest::Manifest;
use crate::policy::DecisionRecord;

const GENESIS: Hash32 = [0u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Decision,
    Manifest,
    ManifestRevocation,
}

impl ReceiptKind {
    fn tag(self) -> u8 {
        match self {
            ReceiptKind::Decision => 0,
            ReceiptKind::Manifest => 1,
            ReceiptKind::ManifestRevocation => 2,
        }
    }
}

/// The caller-supplied part of a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptEntry {
    pub kind: ReceiptKind,
    #[serde(default, with = "crate::digest::hex32_opt", skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<Hash32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<u64>,
    #[serde(default, with = "crate::digest::hex32_opt", skip_serializing_if = "Option::is_none")]
    pub module_hash: Option<Hash32>,
    #[serde(default, with = "crate::digest::hex32_opt", skip_serializing_if = "Option::is_none")]
    pub manifest_id: Option<Hash32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: u64,
}

impl ReceiptEntry {
    pub fn for_decision(decision: &DecisionRecord, timestamp: u64) -> Self {
        Self {
            kind: ReceiptKind::Decision,
            decision_id: Some(decision.decision_id),
            policy_version: Some(decision.policy_version),
            module_hash: Some(decision.module_hash),
            manifest_id: None,
            reason: None,
            timestamp,
        }
    }

    pub fn for_manifest(manifest: &Manifest, timestamp: u64) -> Self {
        let first_decision = manifest
            .node_attestations
            .iter()
            .flat_map(|a| a.policy_decisions.iter())
            .next();
        Self {
            kind: ReceiptKind::Manifest,
            decision_id: first_decision.map(|d| d.decision_id),
            policy_version: first_decision.map(|d| d.policy_version),
            module_hash: manifest
                .policy_module_hash
                .or(first_decision.map(|d| d.module_hash)),
            manifest_id: Some(manifest.manifest_id),
            reason: None,
            timestamp,
        }
    }

    pub fn revocation(manifest_id: Hash32, reason: impl Into<String>, timestamp: u64) -> Self {
        Self {
            kind: ReceiptKind::ManifestRevocation,
            decision_id: None,
            policy_version: None,
            module_hash: None,
            manifest_id: Some(manifest_id),
            reason: Some(reason.into()),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(with = "crate::digest::hex32")]
    pub receipt_id: Hash32,
    pub tenant: String,
    pub sequence: u64,
    #[serde(flatten)]
    pub entry: ReceiptEntry,
    #[serde(with = "crate::digest::hex32")]
    pub prev_receipt_hash: Hash32,
    #[serde(with = "crate::digest::hex32")]
    pub self_hash: Hash32,
}

fn append_opt_hash(out: &mut Vec<u8>, value: &Option<Hash32>) {
    match value {
        Some(h) => {
            out.push(1);
            out.extend_from_slice(h);
        }
        None => out.push(0),
    }
}

impl Receipt {
    fn compute_id(tenant: &str, sequence: u64, entry: &ReceiptEntry, prev: &Hash32) -> Hash32 {
        let mut payload = Vec::with_capacity(256);
        append_str(&mut payload, tenant);
        append_u64(&mut payload, sequence);
        payload.push(entry.kind.tag());
        append_opt_hash(&mut payload, &entry.decision_id);
        match entry.policy_version {
            Some(v) => {
                payload.push(1);
                append_u64(&mut payload, v);
            }
            None => payload.push(0),
        }
        append_opt_hash(&mut payload, &entry.module_hash);
        append_opt_hash(&mut payload, &entry.manifest_id);
        match &entry.reason {
            Some(r) => {
                payload.push(1);
                append_str(&mut payload, r);
            }
            None => payload.push(0),
        }
        append_u64(&mut payload, entry.timestamp);
        payload.extend_from_slice(prev);
        sha256_domain(DOMAIN_RECEIPT_ID_V1, &payload)
    }

    fn compute_self_hash(receipt_id: &Hash32, manifest_id: &Option<Hash32>, prev: &Hash32) -> Hash32 {
        let mut payload = Vec::with_capacity(98);
        payload.extend_from_slice(receipt_id);
        append_opt_hash(&mut payload, manifest_id);
        payload.extend_from_slice(prev);
        sha256_domain(DOMAIN_RECEIPT_V1, &payload)
    }

    fn seal(tenant: &str, sequence: u64, entry: ReceiptEntry, prev: Hash32) -> Self {
        let receipt_id = Self::compute_id(tenant, sequence, &entry, &prev);
        let self_hash = Self::compute_self_hash(&receipt_id, &entry.manifest_id, &prev);
        Self {
            receipt_id,
            tenant: tenant.to_string(),
            sequence,
            entry,
            prev_receipt_hash: prev,
            self_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "break", rename_all = "snake_case")]
pub enum ChainBreak {
    Unreadable { reason: String },
    Undecodable { reason: String },
    TenantMismatch { found: String },
    SequenceGap { expected: u64 },
    ReceiptIdMismatch,
    SelfHashMismatch,
    BrokenLink,
    CheckpointMismatch,
    UnknownStart,
}

impl std::fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainBreak::Unreadable { reason } => write!(f, "log cannot be read: {reason}"),
            ChainBreak::Undecodable { reason } => write!(f, "record does not decode: {reason}"),
            ChainBreak::TenantMismatch { found } => write!(f, "record belongs to tenant {found}"),
            ChainBreak::SequenceGap { expected } => write!(f, "expected sequence {expected}"),
            ChainBreak::ReceiptIdMismatch => f.write_str("receipt id does not match its fields"),
            ChainBreak::SelfHashMismatch => f.write_str("self hash does not match"),
            ChainBreak::BrokenLink => f.write_str("previous receipt hash does not link"),
            ChainBreak::CheckpointMismatch => f.write_str("chain head does not match the checkpoint"),
            ChainBreak::UnknownStart => f.write_str("start receipt is not in the chain"),
        }
    }
}

/// First broken link of a chain. Treated as a security incident.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("receipt chain broken at sequence {sequence} ({receipt_id}): {reason}")]
pub struct ChainIntegrityError {
    pub receipt_id: String,
    pub sequence: u64,
    pub reason: ChainBreak,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("ledger io error: {0}")]
    Io(String),
    #[error("receipt could not be encoded: {0}")]
    Encode(String),
    #[error("invalid tenant name {0:?}")]
    InvalidTenant(String),
    #[error("receipt exceeds the maximum record size")]
    RecordTooLarge,
    #[error("chain head is unreadable; refusing to append: {0}")]
    UnreadableHead(String),
}

fn io_err(e: std::io::Error) -> LedgerError {
    LedgerError::Io(e.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Checkpoint {
    sequence: u64,
    #[serde(with = "crate::digest::hex32")]
    self_hash: Hash32,
}

fn valid_tenant(tenant: &str) -> bool {
    !tenant.is_empty()
        && tenant.len() <= 128
        && tenant
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        && !tenant.starts_with('.')
}

/// One tenant's chain. Appends take `&mut self`; share it behind a mutex.
#[derive(Debug)]
pub struct ReceiptLedger {
    tenant: String,
    log_path: PathBuf,
    head_path: PathBuf,
    file: File,
    records: Vec<Vec<u8>>,
    /// Byte length of the whole records in `records`; anything past it is a torn write.
    log_len: u64,
    head: Option<Receipt>,
    revoked: BTreeSet<Hash32>,
}

impl ReceiptLedger {
    pub fn open(dir: impl AsRef<Path>, tenant: &str) -> Result<Self, LedgerError> {
        if !valid_tenant(tenant) {
            return Err(LedgerError::InvalidTenant(tenant.to_string()));
        }
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(io_err)?;
        let log_path = dir.join(format!("{tenant}.log"));
        let head_path = dir.join(format!("{tenant}.head"));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)
            .map_err(io_err)?;
        let LogScan { records, log_len } = read_records(&log_path)?;
        let mut revoked = BTreeSet::new();
        let mut head = None;
        for bytes in &records {
            // Undecodable records are reported by `verify_chain`, not here.
            if let Ok(receipt) = serde_json::from_slice::<Receipt>(bytes) {
                if receipt.entry.kind == ReceiptKind::ManifestRevocation {
                    revoked.extend(receipt.entry.manifest_id);
                }
                head = Some(receipt);
            }
        }
        if records.len() as u64 != head.as_ref().map(|r| r.sequence + 1).unwrap_or(0) {
            tracing::warn!(
                target: "pcq.ledger",
                tenant,
                records = records.len(),
                "ledger records and head sequence disagree; run verify_chain"
            );
        }
        Ok(Self {
            tenant: tenant.to_string(),
            log_path,
            head_path,
            file,
            records,
            log_len,
            head,
            revoked,
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn head(&self) -> Option<&Receipt> {
        self.head.as_ref()
    }

    pub fn append(&mut self, entry: ReceiptEntry) -> Result<Receipt, LedgerError> {
        let (sequence, prev) = match &self.head {
            Some(h) if h.sequence + 1 == self.records.len() as u64 => (h.sequence + 1, h.self_hash),
            Some(h) => {
                return Err(LedgerError::UnreadableHead(format!(
                    "head sequence {} but {} records",
                    h.sequence,
                    self.records.len()
                )))
            }
            None if self.records.is_empty() => (0, GENESIS),
            None => return Err(LedgerError::UnreadableHead("no decodable receipt".into())),
        };
        let receipt = Receipt::seal(&self.tenant, sequence, entry, prev);
        let bytes = serde_json::to_vec(&receipt).map_err(|e| LedgerError::Encode(e.to_string()))?;
        let len = u32::try_from(bytes.len()).map_err(|_| LedgerError::RecordTooLarge)?;
        self.drop_torn_tail()?;
        self.file.write_all(&len.to_le_bytes()).map_err(io_err)?;
        self.file.write_all(&bytes).map_err(io_err)?;
        self.file.flush().map_err(io_err)?;
        self.file.sync_data().map_err(io_err)?;
        self.write_checkpoint(&Checkpoint {
            sequence,
            self_hash: receipt.self_hash,
        })?;

        if receipt.entry.kind == ReceiptKind::ManifestRevocation {
            self.revoked.extend(receipt.entry.manifest_id);
        }
        self.log_len += 4 + u64::from(len);
        self.records.push(bytes);
        self.head = Some(receipt.clone());
        tracing::info!(
            target: "pcq.ledger",
            tenant = %self.tenant,
            sequence,
            kind = ?receipt.entry.kind,
            receipt_id = %hex::encode(receipt.receipt_id),
            "receipt appended"
        );
        Ok(receipt)
    }

    /// Appends a revocation event. The revoked manifest's receipt is untouched.
    pub fn revoke_manifest(
        &mut self,
        manifest_id: Hash32,
        reason: &str,
        timestamp: u64,
    ) -> Result<Receipt, LedgerError> {
        self.append(ReceiptEntry::revocation(manifest_id, reason, timestamp))
    }

    pub fn is_revoked(&self, manifest_id: &Hash32) -> bool {
        self.revoked.contains(manifest_id)
    }

    /// Decodes every record; fails on the first one that does not decode.
    pub fn receipts(&self) -> Result<Vec<Receipt>, ChainIntegrityError> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, bytes)| decode(bytes, i as u64))
            .collect()
    }

    pub fn get(&self, receipt_id: &Hash32) -> Option<Receipt> {
        self.records
            .iter()
            .filter_map(|b| serde_json::from_slice::<Receipt>(b).ok())
            .find(|r| &r.receipt_id == receipt_id)
    }

    /// Re-reads the log and walks the chain from `from` (or genesis)
    /// recomputing ids, self hashes, links and sequence numbers, then checks
    /// the head checkpoint. Returns the number of receipts checked.
    pub fn verify_chain(&self, from: Option<&Hash32>) -> Result<u64, ChainIntegrityError> {
        let scan = read_records(&self.log_path).map_err(|e| ChainIntegrityError {
            receipt_id: String::new(),
            sequence: 0,
            reason: ChainBreak::Unreadable {
                reason: e.to_string(),
            },
        })?;
        let receipts = scan
            .records
            .iter()
            .enumerate()
            .map(|(i, bytes)| decode(bytes, i as u64))
            .collect::<Result<Vec<_>, _>>()?;
        let start = match from {
            None => 0,
            Some(id) => receipts
                .iter()
                .position(|r| &r.receipt_id == id)
                .ok_or_else(|| ChainIntegrityError {
                    receipt_id: hex::encode(id),
                    sequence: 0,
                    reason: ChainBreak::UnknownStart,
                })?,
        };
        let mut prev = match start {
            0 => GENESIS,
            n => receipts[n - 1].self_hash,
        };
        let mut checked = 0u64;
        for (idx, receipt) in receipts.iter().enumerate().skip(start) {
            let fail = |reason| ChainIntegrityError {
                receipt_id: hex::encode(receipt.receipt_id),
                sequence: receipt.sequence,
                reason,
            };
            if receipt.tenant != self.tenant {
                return Err(fail(ChainBreak::TenantMismatch {
                    found: receipt.tenant.clone(),
                }));
            }
            if receipt.sequence != idx as u64 {
                return Err(fail(ChainBreak::SequenceGap {
                    expected: idx as u64,
                }));
            }
            if receipt.prev_receipt_hash != prev {
                return Err(fail(ChainBreak::BrokenLink));
            }
            let id = Receipt::compute_id(&receipt.tenant, receipt.sequence, &receipt.entry, &prev);
            if id != receipt.receipt_id {
                return Err(fail(ChainBreak::ReceiptIdMismatch));
            }
            let self_hash =
                Receipt::compute_self_hash(&receipt.receipt_id, &receipt.entry.manifest_id, &prev);
            if self_hash != receipt.self_hash {
                return Err(fail(ChainBreak::SelfHashMismatch));
            }
            prev = receipt.self_hash;
            checked += 1;
        }

        let checkpoint = self.read_checkpoint();
        let tail = receipts.last();
        let consistent = match (&checkpoint, tail) {
            (None, None) => true,
            (Some(cp), Some(r)) => cp.sequence == r.sequence && cp.self_hash == r.self_hash,
            _ => false,
        };
        if !consistent {
            return Err(ChainIntegrityError {
                receipt_id: tail.map(|r| hex::encode(r.receipt_id)).unwrap_or_default(),
                sequence: tail.map(|r| r.sequence).unwrap_or_default(),
                reason: ChainBreak::CheckpointMismatch,
            });
        }
        Ok(checked)
    }

    pub fn is_intact(&self) -> bool {
        match self.verify_chain(None) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(
                    target: "pcq.ledger",
                    tenant = %self.tenant,
                    error = %e,
                    "receipt chain integrity failure"
                );
                false
            }
        }
    }

    /// Cuts a partial trailing record off the log so the next record starts
    /// on a frame boundary. A log shorter than what was read at open has been
    /// tampered with and is not appended to.
    fn drop_torn_tail(&mut self) -> Result<(), LedgerError> {
        let on_disk = self.file.metadata().map_err(io_err)?.len();
        if on_disk == self.log_len {
            return Ok(());
        }
        if on_disk < self.log_len {
            return Err(LedgerError::UnreadableHead(format!(
                "log is {on_disk} bytes but {} were read",
                self.log_len
            )));
        }
        tracing::warn!(
            target: "pcq.ledger",
            tenant = %self.tenant,
            discarded = on_disk - self.log_len,
            "truncating partial trailing record before append"
        );
        self.file.set_len(self.log_len).map_err(io_err)?;
        self.file.sync_data().map_err(io_err)
    }

    fn read_checkpoint(&self) -> Option<Checkpoint> {
        let bytes = fs::read(&self.head_path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), LedgerError> {
        let bytes =
            serde_json::to_vec(checkpoint).map_err(|e| LedgerError::Encode(e.to_string()))?;
        let tmp = self.head_path.with_extension("head.tmp");
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, &self.head_path).map_err(io_err)
    }
}

fn decode(bytes: &[u8], sequence: u64) -> Result<Receipt, ChainIntegrityError> {
    serde_json::from_slice(bytes).map_err(|e| ChainIntegrityError {
        receipt_id: String::new(),
        sequence,
        reason: ChainBreak::Undecodable {
            reason: e.to_string(),
        },
    })
}

struct LogScan {
    records: Vec<Vec<u8>>,
    log_len: u64,
}

fn read_records(path: &Path) -> Result<LogScan, LedgerError> {
    let mut reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut records = Vec::new();
    let mut log_len = 0u64;
    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(io_err(e)),
        }
        let len = u32::from_le_bytes(len_bytes) as u64;
        let mut data = Vec::new();
        (&mut reader)
            .take(len)
            .read_to_end(&mut data)
            .map_err(io_err)?;
        if data.len() as u64 != len {
            // A torn trailing write; the checkpoint still names the old head.
            tracing::warn!(
                target: "pcq.ledger",
                path = %path.display(),
                "ignoring partial trailing record"
            );
            break;
        }
        log_len += 4 + len;
        records.push(data);
    }
    Ok(LogScan { records, log_len })
}

/// Per-tenant chains under one directory. Appends to the same tenant are
/// serialized; different tenants proceed independently.
#[derive(Debug)]
pub struct LedgerSet {
    dir: PathBuf,
    chains: RwLock<BTreeMap<String, Arc<Mutex<ReceiptLedger>>>>,
}

impl LedgerSet {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(io_err)?;
        Ok(Self {
            dir,
            chains: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn chain(&self, tenant: &str) -> Result<Arc<Mutex<ReceiptLedger>>, LedgerError> {
        if let Some(chain) = self.chains.read().get(tenant) {
            return Ok(chain.clone());
        }
        let mut chains = self.chains.write();
        if let Some(chain) = chains.get(tenant) {
            return Ok(chain.clone());
        }
        let chain = Arc::new(Mutex::new(ReceiptLedger::open(&self.dir, tenant)?));
        chains.insert(tenant.to_string(), chain.clone());
        Ok(chain)
    }

    pub fn append(&self, tenant: &str, entry: ReceiptEntry) -> Result<Receipt, LedgerError> {
        let chain = self.chain(tenant)?;
        let mut ledger = chain.lock();
        ledger.append(entry)
    }

    pub fn verify_chain(&self, tenant: &str) -> Result<Result<u64, ChainIntegrityError>, LedgerError> {
        let chain = self.chain(tenant)?;
        let ledger = chain.lock();
        Ok(ledger.verify_chain(None))
    }

    /// Tenants with a chain on disk.
    pub fn tenants(&self) -> Result<Vec<String>, LedgerError> {
        let mut tenants = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("log") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    tenants.push(stem.to_string());
                }
            }
        }
        tenants.sort();
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision_entry(i: u8) -> ReceiptEntry {
        ReceiptEntry {
            kind: ReceiptKind::Decision,
            decision_id: Some([i; 32]),
            policy_version: Some(1),
            module_hash: Some([0xaa; 32]),
            manifest_id: None,
            reason: None,
            timestamp: 1_700_000_000 + i as u64,
        }
    }

    fn filled(dir: &Path, n: u8) -> ReceiptLedger {
        let mut ledger = ReceiptLedger::open(dir, "acme").unwrap();
        for i in 0..n {
            ledger.append(decision_entry(i)).unwrap();
        }
        ledger
    }

    fn rewrite(path: &Path, records: &[Vec<u8>]) {
        let mut out = Vec::new();
        for r in records {
            out.extend_from_slice(&(r.len() as u32).to_le_bytes());
            out.extend_from_slice(r);
        }
        fs::write(path, out).unwrap();
    }

    #[test]
    fn appended_chain_verifies_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = filled(dir.path(), 5);
        assert_eq!(ledger.verify_chain(None), Ok(5));
        let third = ledger.receipts().unwrap()[2].receipt_id;
        assert_eq!(ledger.verify_chain(Some(&third)), Ok(3));
        drop(ledger);

        let mut reopened = ReceiptLedger::open(dir.path(), "acme").unwrap();
        assert_eq!(reopened.len(), 5);
        let next = reopened.append(decision_entry(9)).unwrap();
        assert_eq!(next.sequence, 5);
        assert!(reopened.is_intact());
    }

    #[test]
    fn genesis_links_to_zero_hash() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = filled(dir.path(), 1);
        let first = &ledger.receipts().unwrap()[0];
        assert_eq!(first.prev_receipt_hash, GENESIS);
        assert_eq!(first.sequence, 0);
    }

    #[test]
    fn altered_record_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = filled(dir.path(), 4);
        let mut records = ledger.records.clone();
        let path = ledger.path().to_path_buf();
        drop(ledger);

        let mut r: Receipt = serde_json::from_slice(&records[1]).unwrap();
        r.entry.timestamp += 1;
        records[1] = serde_json::to_vec(&r).unwrap();
        rewrite(&path, &records);

        let reopened = ReceiptLedger::open(dir.path(), "acme").unwrap();
        let err = reopened.verify_chain(None).unwrap_err();
        assert_eq!(err.sequence, 1);
        assert_eq!(err.reason, ChainBreak::ReceiptIdMismatch);
        assert!(!reopened.is_intact());
    }

    #[test]
    fn removed_record_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = filled(dir.path(), 4);
        let mut records = ledger.records.clone();
        let path = ledger.path().to_path_buf();
        drop(ledger);

        records.remove(2);
        rewrite(&path, &records);
        let err = ReceiptLedger::open(dir.path(), "acme")
            .unwrap()
            .verify_chain(None)
            .unwrap_err();
        assert_eq!(err.sequence, 3);
        assert_eq!(err.reason, ChainBreak::SequenceGap { expected: 2 });
    }

    #[test]
    fn truncated_tail_fails_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = filled(dir.path(), 3);
        let records = ledger.records.clone();
        let path = ledger.path().to_path_buf();
        drop(ledger);

        rewrite(&path, &records[..2]);
        let err = ReceiptLedger::open(dir.path(), "acme")
            .unwrap()
            .verify_chain(None)
            .unwrap_err();
        assert_eq!(err.reason, ChainBreak::CheckpointMismatch);
    }

    #[test]
    fn tampering_under_an_open_ledger_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = filled(dir.path(), 3);
        assert!(ledger.is_intact());
        let mut records = ledger.records.clone();
        records.remove(1);
        rewrite(ledger.path(), &records);

        let err = ledger.verify_chain(None).unwrap_err();
        assert_eq!(err.sequence, 2);
        assert_eq!(err.reason, ChainBreak::SequenceGap { expected: 1 });
        assert!(!ledger.is_intact());
        assert!(matches!(
            ledger.append(decision_entry(7)),
            Err(LedgerError::UnreadableHead(_))
        ));
    }

    #[test]
    fn edit_under_an_open_ledger_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = filled(dir.path(), 3);
        let mut records = ledger.records.clone();
        let mut r: Receipt = serde_json::from_slice(&records[0]).unwrap();
        r.entry.policy_version = Some(2);
        records[0] = serde_json::to_vec(&r).unwrap();
        rewrite(ledger.path(), &records);

        let err = ledger.verify_chain(None).unwrap_err();
        assert_eq!(err.sequence, 0);
        assert_eq!(err.reason, ChainBreak::ReceiptIdMismatch);
    }

    #[test]
    fn torn_tail_is_cut_before_the_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = filled(dir.path(), 2).path().to_path_buf();
        let mut torn = fs::read(&path).unwrap();
        let intact_len = torn.len() as u64;
        torn.extend_from_slice(&200u32.to_le_bytes());
        torn.extend_from_slice(b"{\"re");
        fs::write(&path, torn).unwrap();

        let mut reopened = ReceiptLedger::open(dir.path(), "acme").unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.verify_chain(None), Ok(2));
        let next = reopened.append(decision_entry(2)).unwrap();
        assert_eq!(next.sequence, 2);
        assert_eq!(reopened.verify_chain(None), Ok(3));
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            intact_len + 4 + reopened.records[2].len() as u64
        );
        drop(reopened);

        let again = ReceiptLedger::open(dir.path(), "acme").unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(again.verify_chain(None), Ok(3));
    }

    #[test]
    fn revocation_is_a_separate_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = ReceiptLedger::open(dir.path(), "acme").unwrap();
        let manifest_id = [7u8; 32];
        ledger
            .append(ReceiptEntry {
                kind: ReceiptKind::Manifest,
                decision_id: None,
                policy_version: None,
                module_hash: None,
                manifest_id: Some(manifest_id),
                reason: None,
                timestamp: 1,
            })
            .unwrap();
        assert!(!ledger.is_revoked(&manifest_id));
        ledger.revoke_manifest(manifest_id, "key compromise", 2).unwrap();
        assert!(ledger.is_revoked(&manifest_id));
        assert_eq!(ledger.len(), 2);
        assert!(ledger.is_intact());
        drop(ledger);
        assert!(ReceiptLedger::open(dir.path(), "acme")
            .unwrap()
            .is_revoked(&manifest_id));
    }

    #[test]
    fn tenants_have_independent_chains() {
        let dir = tempfile::tempdir().unwrap();
        let set = Arc::new(LedgerSet::open(dir.path()).unwrap());
        std::thread::scope(|scope| {
            for tenant in ["acme", "globex"] {
                for t in 0..4u8 {
                    let set = set.clone();
                    scope.spawn(move || {
                        for i in 0..5u8 {
                            set.append(tenant, decision_entry(t * 10 + i)).unwrap();
                        }
                    });
                }
            }
        });
        for tenant in ["acme", "globex"] {
            assert_eq!(set.verify_chain(tenant).unwrap(), Ok(20));
        }
        assert_eq!(set.tenants().unwrap(), vec!["acme".to_string(), "globex".to_string()]);
        assert!(matches!(
            set.append("../etc", decision_entry(0)),
            Err(LedgerError::InvalidTenant(_))
        ));
    }
}
