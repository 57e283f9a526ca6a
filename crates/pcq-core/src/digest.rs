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

//! Hashing helpers shared by every engine component.
//!
//! All content identifiers are SHA-256. Composite identifiers are built from a
//! domain tag followed by length-prefixed fields so two different field
//! layouts can never produce the same preimage.

use std::collections::BTreeMap;

pub use pcq_verifier::{canonical_json, sha256, sha256_domain, Hash32};

pub const DOMAIN_NODE_V1: &[u8] = b"pcq:node:v1";
pub const DOMAIN_PARAMS_V1: &[u8] = b"pcq:params:v1";
pub const DOMAIN_ATTESTATION_V1: &[u8] = b"pcq:attestation:v1";
pub const DOMAIN_DECISION_V1: &[u8] = b"pcq:decision:v1";
pub const DOMAIN_RECEIPT_ID_V1: &[u8] = b"pcq:receipt-id:v1";
pub const DOMAIN_RECEIPT_V1: &[u8] = b"pcq:receipt:v1";
pub const DOMAIN_SOURCE_V1: &[u8] = b"lac:source:v1";
pub const DOMAIN_SEED_V1: &[u8] = b"pcq:seed:v1";

pub fn append_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(bytes);
}

pub fn append_str(out: &mut Vec<u8>, value: &str) {
    append_len_prefixed(out, value.as_bytes());
}

pub fn append_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Encodes an attribute map in key order. Maps are already sorted, so the
/// encoding is a pure function of the contents.
pub fn append_attrs(out: &mut Vec<u8>, attrs: &BTreeMap<String, String>) {
    append_u64(out, attrs.len() as u64);
    for (k, v) in attrs {
        append_str(out, k);
        append_str(out, v);
    }
}

pub fn parse_hash32(value: &str) -> Result<Hash32, String> {
    let bytes = hex::decode(value).map_err(|e| format!("invalid hex digest {value:?}: {e}"))?;
    bytes
        .try_into()
        .map_err(|_| format!("digest {value:?} is not 32 bytes"))
}

pub fn short_hex(hash: &Hash32) -> String {
    hex::encode(&hash[..6])
}

pub mod hex32 {
    use super::{parse_hash32, Hash32};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Hash32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Hash32, D::Error> {
        let s = String::deserialize(d)?;
        parse_hash32(&s).map_err(D::Error::custom)
    }
}

pub mod hex32_opt {
    use super::{parse_hash32, Hash32};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Hash32>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(h) => s.serialize_some(&hex::encode(h)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Hash32>, D::Error> {
        let s = Option::<String>::deserialize(d)?;
        s.map(|s| parse_hash32(&s).map_err(D::Error::custom))
            .transpose()
    }
}

pub mod hex32_vec {
    use super::{parse_hash32, Hash32};
    use serde::de::Error as _;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[Hash32], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(value.len()))?;
        for h in value {
            seq.serialize_element(&hex::encode(h))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Hash32>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|s| parse_hash32(s).map_err(D::Error::custom))
            .collect()
    }
}
