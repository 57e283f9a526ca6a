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

//! The closed set of row transforms a plan node can run.
//!
//! Row sets are JSON arrays of objects. Every operator is a pure function of
//! its input bytes, its params and its seed, and emits canonical JSON so equal
//! results always hash equally.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::digest::canonical_json;
use crate::plan::{NodeSpec, OperatorKind};

type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperatorError {
    #[error("input {index} is not a row set: {reason}")]
    MalformedInput { index: usize, reason: String },
    #[error("missing parameter `{0}`")]
    MissingParam(&'static str),
    #[error("parameter `{param}` is invalid: {reason}")]
    InvalidParam { param: &'static str, reason: String },
    #[error("field `{field}` holds a non-numeric value")]
    NonNumeric { field: String },
    #[error("output could not be encoded: {0}")]
    Encode(String),
}

pub fn apply(node: &NodeSpec, inputs: &[Vec<u8>]) -> Result<Vec<u8>, OperatorError> {
    let out = match node.operator {
        OperatorKind::Load | OperatorKind::Export => Value::Array(rows_value(inputs, 0)?),
        OperatorKind::Filter => {
            let field = str_param(&node.params, "field")?;
            let equals = node
                .params
                .get("equals")
                .ok_or(OperatorError::MissingParam("equals"))?;
            let rows = rows(inputs, 0)?
                .into_iter()
                .filter(|r| r.get(field) == Some(equals))
                .map(Value::Object)
                .collect();
            Value::Array(rows)
        }
        OperatorKind::Project => {
            let fields = str_list_param(&node.params, "fields")?;
            let rows = rows(inputs, 0)?
                .into_iter()
                .map(|mut r| {
                    r.retain(|k, _| fields.iter().any(|f| f == k));
                    Value::Object(r)
                })
                .collect();
            Value::Array(rows)
        }
        OperatorKind::Sample => {
            let per_mille = node
                .params
                .get("per_mille")
                .and_then(Value::as_u64)
                .ok_or(OperatorError::MissingParam("per_mille"))?;
            if per_mille > 1000 {
                return Err(OperatorError::InvalidParam {
                    param: "per_mille",
                    reason: format!("{per_mille} exceeds 1000"),
                });
            }
            let mut rng = ChaCha20Rng::seed_from_u64(node.seed);
            let rows = rows(inputs, 0)?
                .into_iter()
                .filter(|_| rng.gen_range(0u64..1000) < per_mille)
                .map(Value::Object)
                .collect();
            Value::Array(rows)
        }
        OperatorKind::Join => {
            let on = str_param(&node.params, "on")?;
            let left = rows(inputs, 0)?;
            let right = rows(inputs, 1)?;
            let mut joined = Vec::new();
            for l in &left {
                let Some(key) = l.get(on) else { continue };
                for r in right.iter().filter(|r| r.get(on) == Some(key)) {
                    let mut merged = r.clone();
                    // Left side wins on shared column names.
                    for (k, v) in l {
                        merged.insert(k.clone(), v.clone());
                    }
                    joined.push(Value::Object(merged));
                }
            }
            Value::Array(joined)
        }
        OperatorKind::Aggregate => {
            let group_by = str_param(&node.params, "group_by")?;
            let mut groups: BTreeMap<Vec<u8>, (Value, u64)> = BTreeMap::new();
            for r in rows(inputs, 0)? {
                let key = r.get(group_by).cloned().unwrap_or(Value::Null);
                let sort_key = canonical_json(&key).map_err(|e| OperatorError::Encode(e.to_string()))?;
                groups.entry(sort_key).or_insert((key, 0)).1 += 1;
            }
            let rows = groups
                .into_values()
                .map(|(key, count)| {
                    let mut row = Row::new();
                    row.insert(group_by.to_string(), key);
                    row.insert("count".into(), Value::from(count));
                    Value::Object(row)
                })
                .collect();
            Value::Array(rows)
        }
        OperatorKind::Sort => {
            let by = str_param(&node.params, "by")?;
            let mut rows = rows(inputs, 0)?;
            rows.sort_by(|a, b| compare_values(a.get(by), b.get(by)));
            Value::Array(rows.into_iter().map(Value::Object).collect())
        }
        OperatorKind::Sum => {
            let field = str_param(&node.params, "field")?;
            sum_field(&rows(inputs, 0)?, field)?
        }
    };
    canonical_json(&out).map_err(|e| OperatorError::Encode(e.to_string()))
}

/// Number of rows in an operator output, if it is a row set.
pub fn row_count(bytes: &[u8]) -> Option<u64> {
    match serde_json::from_slice::<Value>(bytes).ok()? {
        Value::Array(items) => Some(items.len() as u64),
        _ => None,
    }
}

/// Parses a scalar numeric output such as the result of `sum`.
pub fn numeric_value(bytes: &[u8]) -> Option<f64> {
    serde_json::from_slice::<Value>(bytes).ok()?.as_f64()
}

fn rows_value(inputs: &[Vec<u8>], index: usize) -> Result<Vec<Value>, OperatorError> {
    Ok(rows(inputs, index)?.into_iter().map(Value::Object).collect())
}

fn rows(inputs: &[Vec<u8>], index: usize) -> Result<Vec<Row>, OperatorError> {
    let malformed = |reason: String| OperatorError::MalformedInput { index, reason };
    let bytes = inputs
        .get(index)
        .ok_or_else(|| malformed("input is missing".into()))?;
    let value: Value = serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;
    let Value::Array(items) = value else {
        return Err(malformed("expected a JSON array".into()));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(row) => Ok(row),
            _ => Err(malformed(format!("row {i} is not an object"))),
        })
        .collect()
}

fn str_param<'a>(params: &'a Value, name: &'static str) -> Result<&'a str, OperatorError> {
    params
        .get(name)
        .ok_or(OperatorError::MissingParam(name))?
        .as_str()
        .ok_or_else(|| OperatorError::InvalidParam {
            param: name,
            reason: "expected a string".into(),
        })
}

fn str_list_param(params: &Value, name: &'static str) -> Result<Vec<String>, OperatorError> {
    let items = params
        .get(name)
        .ok_or(OperatorError::MissingParam(name))?
        .as_array()
        .ok_or_else(|| OperatorError::InvalidParam {
            param: name,
            reason: "expected an array of strings".into(),
        })?;
    items
        .iter()
        .map(|v| {
            v.as_str().map(str::to_string).ok_or_else(|| OperatorError::InvalidParam {
                param: name,
                reason: "expected an array of strings".into(),
            })
        })
        .collect()
}

fn sum_field(rows: &[Row], field: &str) -> Result<Value, OperatorError> {
    let mut int_total: Option<i64> = Some(0);
    let mut float_total = 0f64;
    for row in rows {
        let value = match row.get(field) {
            None | Some(Value::Null) => continue,
            Some(Value::Number(n)) => n,
            Some(_) => {
                return Err(OperatorError::NonNumeric {
                    field: field.to_string(),
                })
            }
        };
        int_total = match (int_total, value.as_i64()) {
            (Some(acc), Some(v)) => acc.checked_add(v),
            _ => None,
        };
        float_total += value.as_f64().unwrap_or(0.0);
    }
    Ok(match int_total {
        Some(total) => Value::from(total),
        None => Number::from_f64(float_total)
            .map(Value::Number)
            .ok_or_else(|| OperatorError::NonNumeric {
                field: field.to_string(),
            })?,
    })
}

fn type_rank(v: Option<&Value>) -> u8 {
    match v {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x @ (Value::Array(_) | Value::Object(_))), Some(y)) if type_rank(a) == type_rank(b) => {
            let xs = canonical_json(x).unwrap_or_default();
            let ys = canonical_json(y).unwrap_or_default();
            xs.cmp(&ys)
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
