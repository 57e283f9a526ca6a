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

//! Proof construction for the RFC 6962-style trees checked by `pcq-verifier`.

use pcq_verifier::{leaf_hash, merkle_root, node_hash};

use crate::digest::Hash32;

fn largest_power_of_two_less_than(n: usize) -> usize {
    debug_assert!(n > 1);
    1usize << (usize::BITS - 1 - (n - 1).leading_zeros())
}

fn inclusion_proof_inner(leaves: &[Hash32], leaf_index: usize) -> Vec<Hash32> {
    if leaves.len() <= 1 {
        return Vec::new();
    }
    let k = largest_power_of_two_less_than(leaves.len());
    if leaf_index < k {
        let mut p = inclusion_proof_inner(&leaves[..k], leaf_index);
        p.push(merkle_root(&leaves[k..]));
        p
    } else {
        let mut p = inclusion_proof_inner(&leaves[k..], leaf_index - k);
        p.push(merkle_root(&leaves[..k]));
        p
    }
}

/// Audit path for `leaf_index`, ordered leaf to root.
pub fn inclusion_proof(leaves: &[Hash32], leaf_index: usize) -> Option<Vec<Hash32>> {
    if leaf_index >= leaves.len() {
        return None;
    }
    Some(inclusion_proof_inner(leaves, leaf_index))
}

/// Merkle root over fixed-size chunks of an output blob. An empty blob is a
/// single empty chunk so every output has at least one leaf.
pub fn checksum_root(bytes: &[u8], chunk_bytes: usize) -> Hash32 {
    let chunk_bytes = chunk_bytes.max(1);
    if bytes.is_empty() {
        return leaf_hash(&[]);
    }
    let leaves: Vec<Hash32> = bytes.chunks(chunk_bytes).map(leaf_hash).collect();
    merkle_root(&leaves)
}

/// Pairs two subtree roots. Exposed for tests that build trees by hand.
pub fn parent(left: &Hash32, right: &Hash32) -> Hash32 {
    node_hash(left, right)
}
