//! Quality gate evaluated after the review step.
//!
//! The score is the arithmetic mean of whichever review scores are present in
//! the payload. A low score sends the document through the revise step and
//! back into review, at most `max_revisions` times per document.

use std::sync::Arc;

use folio_types::SharedState;

use crate::step::StepUnit;

/// Payload keys written by the review step.
pub const SCORE_KEYS: [&str; 3] = [
    "technical_accuracy_score",
    "engagement_score",
    "consistency_score",
];

/// Mean of the present review scores, or `None` when there are none.
pub fn quality_score(state: &SharedState) -> Option<f64> {
    let scores: Vec<f64> = SCORE_KEYS
        .iter()
        .filter_map(|key| state.get_f64(key))
        .collect();
    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}

/// The gate's routing decision.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Good enough (or nothing to judge); continue towards the final step.
    Pass { score: Option<f64> },
    /// Run the revise step, then review again. `round` is 1-based.
    Revise { score: f64, round: u32 },
    /// Still below threshold but no revision rounds are left.
    Exhausted { score: f64 },
}

impl GateDecision {
    pub fn label(&self) -> &'static str {
        match self {
            GateDecision::Pass { .. } => "pass",
            GateDecision::Revise { .. } => "revise",
            GateDecision::Exhausted { .. } => "exhausted",
        }
    }

    pub fn score(&self) -> Option<f64> {
        match self {
            GateDecision::Pass { score } => *score,
            GateDecision::Revise { score, .. } | GateDecision::Exhausted { score } => Some(*score),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityGate {
    /// Name of the step after which the gate is evaluated.
    pub review_step: String,
    pub revise: Arc<StepUnit>,
    pub threshold: f64,
    pub max_revisions: u32,
}

impl QualityGate {
    pub fn new(review_step: impl Into<String>, revise: StepUnit) -> Self {
        Self {
            review_step: review_step.into(),
            revise: Arc::new(revise),
            threshold: 0.7,
            max_revisions: 2,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_max_revisions(mut self, max_revisions: u32) -> Self {
        self.max_revisions = max_revisions;
        self
    }

    /// Decide the route for `state`. Deterministic in the payload scores and
    /// `revision_rounds`.
    pub fn decide(&self, state: &SharedState) -> GateDecision {
        let Some(score) = quality_score(state) else {
            return GateDecision::Pass { score: None };
        };
        if score >= self.threshold {
            GateDecision::Pass { score: Some(score) }
        } else if state.revision_rounds < self.max_revisions {
            GateDecision::Revise {
                score,
                round: state.revision_rounds + 1,
            }
        } else {
            GateDecision::Exhausted { score }
        }
    }
}
