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

//! pcq-core
//!
//! Proof-carrying query execution. A compiled authorization module gates every
//! governed read and export of a query DAG; each node run is attested, the
//! attestations are sealed into a signed Merkle manifest, and a verifier can
//! later replay the whole run from content-addressed inputs.
//!
//! - `policy`: LAC-C compiler, bytecode module and the LAC-R evaluation gate
//! - `plan`, `exec`, `operators`, `attestation`: DAG runner and recorder
//! - `manifest`, `keys`: signed manifest and signing key handling
//! - `verify`: replay verifier producing PASS/FAIL reports
//! - `sim`: policy diff simulation over historical requests
//! - `ledger`: per-tenant hash-chained receipt log
//! - `cas`: content-addressed blob store

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod attestation;
pub mod cas;
pub mod config;
pub mod digest;
pub mod error;
pub mod exec;
pub mod keys;
pub mod ledger;
pub mod manifest;
pub mod merkle;
pub mod operators;
pub mod plan;
pub mod policy;
pub mod sim;
pub mod verify;

pub use crate::attestation::{Attestation, AttestationRecorder};
pub use crate::cas::{BlobStore, CasError, FsCas, MemoryCas, OverlayCas};
pub use crate::config::EngineConfig;
pub use crate::digest::Hash32;
pub use crate::error::{PcqError, PcqResult};
pub use crate::exec::{CancelToken, ExecutionMode, ExecutionResult, Executor};
pub use crate::keys::KeyRing;
pub use crate::ledger::{LedgerSet, Receipt, ReceiptEntry, ReceiptLedger};
pub use crate::manifest::{Manifest, ManifestSigner, ManifestWriter};
pub use crate::plan::{Dag, PlanSpec, SeedMap};
pub use crate::policy::{compile_source, DecisionRecord, PolicyGate, PolicyModule};
pub use crate::sim::{DiffReport, Simulator};
pub use crate::verify::{OriginalInputs, VerificationReport, Verifier};
