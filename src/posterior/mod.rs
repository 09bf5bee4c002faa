//! Posterior aggregation.
//!
//! Sequential Bayesian combination of evidence clusters against per-paradigm
//! priors. Running scores are kept in log space so long evidence chains do
//! not underflow, and the running state is itself checkpointable: a crash
//! mid-sequence resumes without re-applying folded clusters.

mod aggregator;


pub use aggregator::*;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};

use crate::error::{PosteriorError, PosteriorResult};

/// Reserved catch-all hypothesis absorbing unexplained probability mass.
pub const CATCH_ALL_HYPOTHESIS: &str = "H_unforeseen";

/// Tolerance on the sum of a paradigm's priors.
pub const PRIOR_SUM_TOLERANCE: f64 = 1e-6;

/// Posteriors closer than this are treated as tied.
const TIE_EPSILON: f64 = 1e-12;

/// Direction a hypothesis takes on the proposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Supports,
    Opposes,
    Neutral,
}

/// One candidate explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub stance: Stance,
}

/// An epistemic stance with its own prior over the shared hypothesis set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paradigm {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub priors: BTreeMap<String, f64>,
}

/// Likelihood values contributed by one group of evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceCluster {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// paradigm id -> hypothesis id -> likelihood (non-negative, unnormalized)
    pub likelihoods: BTreeMap<String, BTreeMap<String, f64>>,
}

/// Bucketed conclusion for one paradigm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Supported,
    Refuted,
    PartiallySupported,
    PartiallyRefuted,
    Indeterminate,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Supported => "supported",
            Verdict::Refuted => "refuted",
            Verdict::PartiallySupported => "partially_supported",
            Verdict::PartiallyRefuted => "partially_refuted",
            Verdict::Indeterminate => "indeterminate",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Natural-log weight. Zero probability is `-inf`, which JSON cannot
/// carry, so it serializes as `null`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogWeight(f64);

impl LogWeight {
    /// Weight of probability zero.
    pub const ZERO: LogWeight = LogWeight(f64::NEG_INFINITY);

    pub fn from_probability(p: f64) -> Self {
        LogWeight(p.ln())
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == f64::NEG_INFINITY
    }

    /// Multiply by a likelihood.
    pub fn times(self, likelihood: f64) -> Self {
        LogWeight(self.0 + likelihood.ln())
    }
}

impl Serialize for LogWeight {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_finite() {
            serializer.serialize_f64(self.0)
        } else {
            serializer.serialize_none()
        }
    }
}

impl<'de> Deserialize<'de> for LogWeight {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?
            .map(LogWeight)
            .unwrap_or(LogWeight::ZERO))
    }
}

/// Hypotheses and paradigms of one analysis, validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorModel {
    pub hypotheses: Vec<Hypothesis>,
    pub paradigms: Vec<Paradigm>,
}

impl PosteriorModel {
    /// Build and validate a model.
    pub fn new(hypotheses: Vec<Hypothesis>, paradigms: Vec<Paradigm>) -> PosteriorResult<Self> {
        let model = Self {
            hypotheses,
            paradigms,
        };
        model.validate()?;
        Ok(model)
    }

    /// Check hypothesis ids, catch-all stance and every paradigm's prior.
    pub fn validate(&self) -> PosteriorResult<()> {
        if self.hypotheses.is_empty() {
            return Err(PosteriorError::InvalidHypotheses {
                reason: "no hypotheses declared".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for h in &self.hypotheses {
            if h.id.trim().is_empty() {
                return Err(PosteriorError::InvalidHypotheses {
                    reason: "hypothesis id must not be empty".to_string(),
                });
            }
            if !seen.insert(h.id.as_str()) {
                return Err(PosteriorError::InvalidHypotheses {
                    reason: format!("duplicate hypothesis id '{}'", h.id),
                });
            }
            if h.id == CATCH_ALL_HYPOTHESIS && h.stance != Stance::Neutral {
                return Err(PosteriorError::InvalidHypotheses {
                    reason: format!("'{}' must have neutral stance", CATCH_ALL_HYPOTHESIS),
                });
            }
        }

        if self.paradigms.is_empty() {
            return Err(PosteriorError::InvalidHypotheses {
                reason: "no paradigms declared".to_string(),
            });
        }

        let mut paradigm_ids = HashSet::new();
        for paradigm in &self.paradigms {
            if !paradigm_ids.insert(paradigm.id.as_str()) {
                return Err(PosteriorError::InvalidPrior {
                    paradigm: paradigm.id.clone(),
                    reason: "duplicate paradigm id".to_string(),
                });
            }
            self.validate_prior(paradigm)?;
        }

        Ok(())
    }

    fn validate_prior(&self, paradigm: &Paradigm) -> PosteriorResult<()> {
        let invalid = |reason: String| PosteriorError::InvalidPrior {
            paradigm: paradigm.id.clone(),
            reason,
        };

        for key in paradigm.priors.keys() {
            if self.hypothesis(key).is_none() {
                return Err(invalid(format!("unknown hypothesis '{}'", key)));
            }
        }

        let mut sum = 0.0;
        for h in &self.hypotheses {
            let p = *paradigm
                .priors
                .get(&h.id)
                .ok_or_else(|| invalid(format!("missing prior for '{}'", h.id)))?;
            if !p.is_finite() || p < 0.0 {
                return Err(invalid(format!("prior for '{}' is {}", h.id, p)));
            }
            sum += p;
        }

        if (sum - 1.0).abs() > PRIOR_SUM_TOLERANCE {
            return Err(invalid(format!("priors sum to {}, expected 1", sum)));
        }

        Ok(())
    }

    pub fn hypothesis(&self, id: &str) -> Option<&Hypothesis> {
        self.hypotheses.iter().find(|h| h.id == id)
    }

    pub fn paradigm(&self, id: &str) -> Option<&Paradigm> {
        self.paradigms.iter().find(|p| p.id == id)
    }
}

/// Final result for one paradigm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParadigmOutcome {
    pub paradigm_id: String,
    pub posterior: BTreeMap<String, f64>,
    pub winner: String,
    pub winner_posterior: f64,
    pub verdict: Verdict,
    /// Catch-all won even though informative evidence was folded in.
    #[serde(default)]
    pub miscalibration_warning: bool,
}

/// Normalize log weights with log-sum-exp.
pub fn normalize(scores: &BTreeMap<String, LogWeight>) -> Option<BTreeMap<String, f64>> {
    let max = scores
        .values()
        .map(LogWeight::value)
        .fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return None;
    }

    let total: f64 = scores.values().map(|w| (w.value() - max).exp()).sum();
    Some(
        scores
            .iter()
            .map(|(id, w)| (id.clone(), (w.value() - max).exp() / total))
            .collect(),
    )
}

/// Maximum-posterior hypothesis; ties go to the smallest id.
pub fn select_winner(posterior: &BTreeMap<String, f64>) -> Option<(&str, f64)> {
    let mut best: Option<(&str, f64)> = None;
    // BTreeMap iterates in id order, so only a strictly larger value replaces.
    for (id, &p) in posterior {
        match best {
            Some((_, best_p)) if p <= best_p + TIE_EPSILON => {}
            _ => best = Some((id.as_str(), p)),
        }
    }
    best
}

/// Bucket a winning posterior into a verdict.
pub fn classify_verdict(
    stance: Stance,
    winner_posterior: f64,
    decisive: f64,
    partial: f64,
) -> Verdict {
    match stance {
        Stance::Neutral => Verdict::Indeterminate,
        Stance::Supports if winner_posterior >= decisive => Verdict::Supported,
        Stance::Opposes if winner_posterior >= decisive => Verdict::Refuted,
        Stance::Supports if winner_posterior >= partial => Verdict::PartiallySupported,
        Stance::Opposes if winner_posterior >= partial => Verdict::PartiallyRefuted,
        _ => Verdict::Indeterminate,
    }
}
