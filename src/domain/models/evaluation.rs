//! Evaluation request/response types exchanged with the LLM judge.

use serde::{Deserialize, Serialize};

use super::entity::EntityKind;

/// Default strictness applied when neither the criterion nor the dimension
/// specify one.
pub const DEFAULT_STRICTNESS: u8 = 85;

/// One criterion evaluation request sent to the LLM judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionRequest {
    pub criterion: String,
    /// Strictness in [0, 100]; higher means the judge needs stronger evidence.
    pub evaluation_strictness: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
    /// Outputs produced by the entity (one per run).
    pub outputs: Vec<serde_json::Value>,
    pub input: serde_json::Value,
    pub dimension: String,
    pub entity_name: String,
    pub entity_kind: EntityKind,
    /// Dimension-level guidance for the judge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_instructions: Option<String>,
}

/// The judge's verdict on one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionEvaluation {
    pub criterion: String,
    pub met: bool,
    /// Confidence/quality score in [0, 1].
    pub score: f64,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub reasoning: String,
}

impl CriterionEvaluation {
    /// Clamp the score into [0, 1]; judges occasionally answer out of range.
    pub fn normalized(mut self) -> Self {
        if !self.score.is_finite() {
            self.score = 0.0;
        }
        self.score = self.score.clamp(0.0, 1.0);
        self
    }
}

/// How multi-run output stability is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMethod {
    /// Average pairwise similarity (structural JSON, then Levenshtein).
    #[default]
    Pairwise,
    /// `1 - (unique_outputs - 1) / (runs - 1)`.
    Uniqueness,
}

/// Stability of outputs across the runs of one multi-run test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub run_count: usize,
    pub unique_outputs: usize,
    pub pairwise_similarity: f64,
    pub uniqueness_similarity: f64,
    pub threshold: f64,
    pub method: ConsistencyMethod,
    pub consistent: bool,
}

impl ConsistencyReport {
    /// The similarity value the `consistent` flag was derived from.
    pub fn similarity(&self) -> f64 {
        match self.method {
            ConsistencyMethod::Pairwise => self.pairwise_similarity,
            ConsistencyMethod::Uniqueness => self.uniqueness_similarity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_clamps_score() {
        let eval = CriterionEvaluation {
            criterion: "c".into(),
            met: true,
            score: 1.7,
            evidence: String::new(),
            reasoning: String::new(),
        };
        assert!((eval.normalized().score - 1.0).abs() < f64::EPSILON);

        let eval = CriterionEvaluation {
            criterion: "c".into(),
            met: false,
            score: f64::NAN,
            evidence: String::new(),
            reasoning: String::new(),
        };
        assert!(eval.normalized().score.abs() < f64::EPSILON);
    }

    #[test]
    fn test_criterion_evaluation_defaults_when_fields_missing() {
        let eval: CriterionEvaluation =
            serde_json::from_str(r#"{"criterion":"x","met":true,"score":0.9}"#).unwrap();
        assert!(eval.met);
        assert!(eval.evidence.is_empty());
    }
}
