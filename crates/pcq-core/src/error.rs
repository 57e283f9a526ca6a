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

use thiserror::Error;

use crate::cas::CasError;
use crate::exec::ExecutionError;
use crate::keys::KeyError;
use crate::ledger::{ChainIntegrityError, LedgerError};
use crate::manifest::ManifestError;
use crate::plan::PlanError;
use crate::policy::{CompileError, DecodeError, StoreError};
use crate::sim::SimError;

pub type PcqResult<T> = Result<T, PcqError>;

#[derive(Debug, Error)]
pub enum PcqError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    ChainIntegrity(#[from] ChainIntegrityError),

    #[error(transparent)]
    Sim(#[from] SimError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for PcqError {
    fn from(err: std::io::Error) -> Self {
        PcqError::Internal(format!("io: {err}"))
    }
}
