use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::{
    classify_verdict, normalize, select_winner, EvidenceCluster, LogWeight, ParadigmOutcome,
    PosteriorModel, CATCH_ALL_HYPOTHESIS,
};
use crate::checkpoint::AnalysisCheckpointer;
use crate::config::VerdictConfig;
use crate::error::{AppResult, PosteriorError, PosteriorResult};
use crate::storage::{PhaseData, PhasePayload};

/// Phase id holding the running, unnormalized state.
pub const POSTERIOR_PROGRESS_PHASE: &str = "posterior_progress";

/// Phase id holding the final normalized outcomes.
pub const POSTERIOR_PHASE: &str = "posterior";

/// Running per-paradigm log scores plus the clusters already folded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationState {
    /// paradigm id -> hypothesis id -> log score
    pub log_scores: BTreeMap<String, BTreeMap<String, LogWeight>>,
    /// Cluster ids in fold order.
    pub applied_clusters: Vec<String>,
    /// Paradigms that received at least one informative cluster.
    #[serde(default)]
    pub informative_paradigms: BTreeSet<String>,
}

impl AggregationState {
    /// Initialize scores to the log priors.
    pub fn new(model: &PosteriorModel) -> Self {
        let log_scores = model
            .paradigms
            .iter()
            .map(|paradigm| {
                let scores = model
                    .hypotheses
                    .iter()
                    .map(|h| {
                        let prior = paradigm.priors.get(&h.id).copied().unwrap_or(0.0);
                        (h.id.clone(), LogWeight::from_probability(prior))
                    })
                    .collect();
                (paradigm.id.clone(), scores)
            })
            .collect();

        Self {
            log_scores,
            applied_clusters: Vec::new(),
            informative_paradigms: BTreeSet::new(),
        }
    }

    pub fn is_applied(&self, cluster_id: &str) -> bool {
        self.applied_clusters.iter().any(|c| c == cluster_id)
    }

    /// Fold one cluster in. Returns `false` if it was already applied.
    ///
    /// The cluster is validated completely before any score changes, so an
    /// error leaves the state untouched.
    pub fn fold(
        &mut self,
        model: &PosteriorModel,
        cluster: &EvidenceCluster,
    ) -> PosteriorResult<bool> {
        if self.is_applied(&cluster.id) {
            debug!(cluster = %cluster.id, "Cluster already folded, skipping");
            return Ok(false);
        }

        validate_cluster(model, cluster)?;

        for (paradigm_id, values) in &cluster.likelihoods {
            let Some(scores) = self.log_scores.get_mut(paradigm_id) else {
                continue;
            };
            for (hypothesis_id, score) in scores.iter_mut() {
                if let Some(&likelihood) = values.get(hypothesis_id) {
                    *score = score.times(likelihood);
                }
            }
            if is_informative(values) {
                self.informative_paradigms.insert(paradigm_id.clone());
            }
        }

        self.applied_clusters.push(cluster.id.clone());
        Ok(true)
    }

    /// Normalized posterior for one paradigm.
    pub fn posterior(&self, paradigm_id: &str) -> PosteriorResult<BTreeMap<String, f64>> {
        self.log_scores
            .get(paradigm_id)
            .and_then(normalize)
            .ok_or_else(|| PosteriorError::Degenerate {
                paradigm: paradigm_id.to_string(),
            })
    }

    /// Outcomes for every paradigm, in declaration order.
    pub fn outcomes(
        &self,
        model: &PosteriorModel,
        thresholds: &VerdictConfig,
    ) -> PosteriorResult<Vec<ParadigmOutcome>> {
        model
            .paradigms
            .iter()
            .map(|paradigm| {
                let posterior = self.posterior(&paradigm.id)?;
                let (winner, winner_posterior) = select_winner(&posterior)
                    .map(|(id, p)| (id.to_string(), p))
                    .ok_or_else(|| PosteriorError::Degenerate {
                        paradigm: paradigm.id.clone(),
                    })?;
                let stance = model
                    .hypothesis(&winner)
                    .map(|h| h.stance)
                    .ok_or_else(|| PosteriorError::InvalidHypotheses {
                        reason: format!("winner '{}' is not declared", winner),
                    })?;

                let verdict = classify_verdict(
                    stance,
                    winner_posterior,
                    thresholds.decisive_threshold,
                    thresholds.partial_threshold,
                );

                let miscalibration_warning = winner == CATCH_ALL_HYPOTHESIS
                    && self.informative_paradigms.contains(&paradigm.id);
                if miscalibration_warning {
                    warn!(
                        paradigm = %paradigm.id,
                        posterior = winner_posterior,
                        "Catch-all hypothesis won despite informative evidence; likelihood elicitation may be miscalibrated"
                    );
                }

                Ok(ParadigmOutcome {
                    paradigm_id: paradigm.id.clone(),
                    posterior,
                    winner,
                    winner_posterior,
                    verdict,
                    miscalibration_warning,
                })
            })
            .collect()
    }
}

/// Check a cluster against the model without folding it.
pub fn validate_cluster(model: &PosteriorModel, cluster: &EvidenceCluster) -> PosteriorResult<()> {
    for (paradigm_id, values) in &cluster.likelihoods {
        if model.paradigm(paradigm_id).is_none() {
            return Err(PosteriorError::UnknownParadigm {
                cluster: cluster.id.clone(),
                paradigm: paradigm_id.clone(),
            });
        }
        for hypothesis_id in values.keys() {
            if model.hypothesis(hypothesis_id).is_none() {
                return Err(PosteriorError::InvalidHypotheses {
                    reason: format!(
                        "cluster '{}' references unknown hypothesis '{}'",
                        cluster.id, hypothesis_id
                    ),
                });
            }
        }
        for h in &model.hypotheses {
            let value = *values.get(&h.id).ok_or_else(|| PosteriorError::MissingLikelihood {
                cluster: cluster.id.clone(),
                paradigm: paradigm_id.clone(),
                hypothesis: h.id.clone(),
            })?;
            if !value.is_finite() || value < 0.0 {
                return Err(PosteriorError::InvalidLikelihood {
                    cluster: cluster.id.clone(),
                    paradigm: paradigm_id.clone(),
                    hypothesis: h.id.clone(),
                    value,
                });
            }
        }
    }
    Ok(())
}

/// A cluster informs a paradigm unless all its likelihoods are equal,
/// compared relative to their magnitude.
pub(crate) fn is_informative(values: &BTreeMap<String, f64>) -> bool {
    let mut iter = values.values();
    match iter.next() {
        Some(first) => {
            iter.any(|v| (v - first).abs() > f64::EPSILON * v.abs().max(first.abs()))
        }
        None => false,
    }
}

/// Fold clusters in order without checkpointing.
pub fn combine(
    model: &PosteriorModel,
    clusters: &[EvidenceCluster],
    thresholds: &VerdictConfig,
) -> PosteriorResult<Vec<ParadigmOutcome>> {
    let mut state = AggregationState::new(model);
    for cluster in clusters {
        state.fold(model, cluster)?;
    }
    state.outcomes(model, thresholds)
}

/// Fold clusters, persisting the running state after each one.
///
/// Resumes from a saved `posterior_progress` phase and returns the stored
/// outcomes directly if the `posterior` phase is already complete.
pub async fn combine_checkpointed(
    checkpointer: &AnalysisCheckpointer,
    model: &PosteriorModel,
    clusters: &[EvidenceCluster],
    thresholds: &VerdictConfig,
) -> AppResult<Vec<ParadigmOutcome>> {
    if let Some(PhaseData {
        payload: PhasePayload::Posterior { outcomes },
        ..
    }) = checkpointer.get_phase_data(POSTERIOR_PHASE).await
    {
        info!(session_id = %checkpointer.session_id(), "Posterior already finalized, reusing");
        return Ok(outcomes);
    }

    let mut state = match checkpointer.get_phase_data(POSTERIOR_PROGRESS_PHASE).await {
        Some(PhaseData {
            payload: PhasePayload::PosteriorProgress { state },
            ..
        }) => {
            info!(
                session_id = %checkpointer.session_id(),
                applied = state.applied_clusters.len(),
                "Resuming posterior aggregation"
            );
            state
        }
        _ => AggregationState::new(model),
    };

    for cluster in clusters {
        if state.fold(model, cluster)? {
            checkpointer
                .save_phase(
                    POSTERIOR_PROGRESS_PHASE,
                    PhaseData::new(PhasePayload::PosteriorProgress {
                        state: state.clone(),
                    }),
                )
                .await?;
        }
    }

    let outcomes = state.outcomes(model, thresholds)?;
    checkpointer
        .save_phase(
            POSTERIOR_PHASE,
            PhaseData::new(PhasePayload::Posterior {
                outcomes: outcomes.clone(),
            }),
        )
        .await?;

    Ok(outcomes)
}
