//! Output consistency scoring for multi-run tests.
//!
//! Two formulas are kept side by side:
//! - pairwise: structural JSON equality, falling back to normalized
//!   Levenshtein similarity `1 - d / max(len_a, len_b)`, averaged over all
//!   pairs of outputs;
//! - uniqueness: `1 - (unique_outputs - 1) / (runs - 1)`.

use serde_json::Value;
use std::collections::HashSet;

use crate::domain::models::eval_spec::canonical_json;
use crate::domain::models::{ConsistencyMethod, ConsistencyReport};

/// Levenshtein edit distance over Unicode scalar values.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Normalized string similarity in [0, 1].
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// String outputs that themselves contain JSON are compared structurally.
fn normalize(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str::<Value>(s.trim())
            .ok()
            .filter(|v| v.is_object() || v.is_array())
            .unwrap_or_else(|| value.clone()),
        other => other.clone(),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => canonical_json(other),
    }
}

/// Similarity of two outputs in [0, 1].
pub fn output_similarity(a: &Value, b: &Value) -> f64 {
    let (a, b) = (normalize(a), normalize(b));
    if a == b {
        return 1.0;
    }
    string_similarity(&render(&a), &render(&b))
}

/// Average similarity over all unordered pairs; 1.0 for fewer than two outputs.
pub fn average_pairwise_similarity(outputs: &[Value]) -> f64 {
    if outputs.len() < 2 {
        return 1.0;
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..outputs.len() {
        for j in (i + 1)..outputs.len() {
            total += output_similarity(&outputs[i], &outputs[j]);
            pairs += 1;
        }
    }
    total / pairs as f64
}

/// Number of distinct outputs after structural normalization.
pub fn unique_outputs(outputs: &[Value]) -> usize {
    outputs
        .iter()
        .map(|o| canonical_json(&normalize(o)))
        .collect::<HashSet<_>>()
        .len()
}

/// `1 - (unique - 1) / (n - 1)`; 1.0 for fewer than two outputs.
pub fn uniqueness_similarity(outputs: &[Value]) -> f64 {
    if outputs.len() < 2 {
        return 1.0;
    }
    let variance = (unique_outputs(outputs) - 1) as f64 / (outputs.len() - 1) as f64;
    1.0 - variance
}

/// Score a set of run outputs against a threshold.
pub fn assess(outputs: &[Value], threshold: f64, method: ConsistencyMethod) -> ConsistencyReport {
    let pairwise_similarity = average_pairwise_similarity(outputs);
    let uniqueness_similarity = uniqueness_similarity(outputs);
    let similarity = match method {
        ConsistencyMethod::Pairwise => pairwise_similarity,
        ConsistencyMethod::Uniqueness => uniqueness_similarity,
    };
    ConsistencyReport {
        run_count: outputs.len(),
        unique_outputs: unique_outputs(outputs),
        pairwise_similarity,
        uniqueness_similarity,
        threshold,
        method,
        consistent: similarity >= threshold,
    }
}
