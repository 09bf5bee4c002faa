use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::{
    extract_json_from_completion, EvidenceQuery, ScenarioConfig, AGGREGATION_PHASE,
    EVIDENCE_PHASE, EVIDENCE_QUERIES, FRAMING_PHASE, RESULT_PHASE, SCENARIO_PHASE, SYNTHESIS_PHASE,
};
use crate::checkpoint::{AnalysisCheckpointer, CallDetails, CheckpointSettings, CostBudget};
use crate::config::{Config, PipeConfig, VerdictConfig};
use crate::error::{AppError, AppResult, ReasoningError, StorageError};
use crate::orchestrator::{TopicAnalyzer, TopicRequest};
use crate::posterior::{combine_checkpointed, validate_cluster, EvidenceCluster, ParadigmOutcome};
use crate::prompts::{EVIDENCE_PROMPT, FRAMING_PROMPT, SYNTHESIS_PROMPT};
use crate::reasoning::{Message, ReasoningRequest, ReasoningResponse, ReasoningService};
use crate::storage::{
    AnalysisResultSnapshot, ErrorKind, PhaseData, PhasePayload, ResumePoint, SharedStore,
};

/// Runs analysis sessions against the reasoning service.
pub struct AnalysisRunner {
    reasoning: Arc<dyn ReasoningService>,
    store: SharedStore,
    pipes: PipeConfig,
    settings: CheckpointSettings,
    budget: CostBudget,
    verdict: VerdictConfig,
    max_parallel_calls: usize,
}

impl AnalysisRunner {
    /// Create a runner from the application config.
    pub fn new(reasoning: Arc<dyn ReasoningService>, store: SharedStore, config: &Config) -> Self {
        Self {
            reasoning,
            store,
            pipes: config.pipes.clone(),
            settings: CheckpointSettings::from_config(config),
            budget: CostBudget::new(config.budget.max_cost_usd),
            verdict: config.verdict,
            max_parallel_calls: config.request.max_parallel_calls,
        }
    }

    /// Override the cost ceiling.
    pub fn with_budget(mut self, budget: CostBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Override the fan-out concurrency cap.
    pub fn with_max_parallel_calls(mut self, max: usize) -> Self {
        self.max_parallel_calls = max;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Start a new session and run it to completion.
    pub async fn start(
        &self,
        scenario_id: &str,
        proposition: &str,
        scenario_config: serde_json::Value,
    ) -> AppResult<AnalysisResultSnapshot> {
        // Reject a bad scenario before any call is made.
        ScenarioConfig::from_value(&scenario_config)?;

        let checkpointer = AnalysisCheckpointer::create(
            self.store.clone(),
            scenario_id,
            proposition,
            scenario_config,
            self.settings.clone(),
        )
        .await?;
        self.run_session(Arc::new(checkpointer)).await
    }

    /// Spawn a fresh session continuing a failed one, without running it.
    pub async fn prepare_resume(
        &self,
        failed_session_id: &str,
    ) -> AppResult<(Arc<AnalysisCheckpointer>, ResumePoint)> {
        let (checkpointer, resume_point) = AnalysisCheckpointer::resume_from(
            self.store.clone(),
            failed_session_id,
            self.settings.clone(),
        )
        .await?;
        Ok((Arc::new(checkpointer), resume_point))
    }

    /// Resume a failed session and run it to completion.
    pub async fn resume(&self, failed_session_id: &str) -> AppResult<AnalysisResultSnapshot> {
        let (checkpointer, _) = self.prepare_resume(failed_session_id).await?;
        self.run_session(checkpointer).await
    }

    /// Run every phase not yet completed in this session.
    pub async fn run_session(
        &self,
        checkpointer: Arc<AnalysisCheckpointer>,
    ) -> AppResult<AnalysisResultSnapshot> {
        let snapshot = checkpointer.snapshot().await;
        let scenario = match ScenarioConfig::from_value(&snapshot.scenario_config) {
            Ok(scenario) => scenario,
            Err(e) => {
                return Err(self
                    .fail(&checkpointer, SCENARIO_PHASE, ErrorKind::PhaseFailure, e)
                    .await)
            }
        };
        let proposition = snapshot.proposition;

        if let Some(PhaseData {
            payload: PhasePayload::Result { result },
            ..
        }) = checkpointer.get_phase_data(RESULT_PHASE).await
        {
            checkpointer.mark_completed().await?;
            return Ok(result);
        }

        let framing = self
            .run_framing(&checkpointer, &proposition, &scenario)
            .await?;
        let clusters = self
            .run_evidence(&checkpointer, &proposition, &framing, &scenario)
            .await?;
        let outcomes = self
            .run_aggregation(&checkpointer, &scenario, &clusters)
            .await?;
        let summary = self
            .run_synthesis(&checkpointer, &proposition, &framing, &outcomes)
            .await?;

        let headline = outcomes.first().ok_or_else(|| AppError::Internal {
            message: "posterior produced no paradigm outcomes".to_string(),
        })?;
        let result = AnalysisResultSnapshot {
            analysis_id: checkpointer.session_id().to_string(),
            proposition,
            verdict: headline.verdict.to_string(),
            winning_hypothesis: headline.winner.clone(),
            posterior: headline.winner_posterior,
            summary,
            paradigms: outcomes.clone(),
            total_cost_usd: checkpointer.total_cost_usd().await,
            completed_at: Utc::now(),
        };

        checkpointer
            .save_phase(
                RESULT_PHASE,
                PhaseData::new(PhasePayload::Result {
                    result: result.clone(),
                }),
            )
            .await?;
        checkpointer.mark_completed().await?;

        Ok(result)
    }

    async fn run_framing(
        &self,
        checkpointer: &AnalysisCheckpointer,
        proposition: &str,
        scenario: &ScenarioConfig,
    ) -> AppResult<String> {
        if let Some(text) = completed_text(checkpointer, FRAMING_PHASE).await {
            return Ok(text);
        }
        checkpointer.start_phase(FRAMING_PHASE).await;

        let paradigms: Vec<&str> = scenario
            .model
            .paradigms
            .iter()
            .map(|p| if p.name.is_empty() { p.id.as_str() } else { p.name.as_str() })
            .collect();
        let request = ReasoningRequest::new(
            &self.pipes.framing,
            vec![
                Message::system(FRAMING_PROMPT),
                Message::user(format!(
                    "Proposition: {}\n\nParadigms: {}",
                    proposition,
                    paradigms.join(", ")
                )),
            ],
        );

        let response = self
            .call_single(checkpointer, FRAMING_PHASE, &request)
            .await?;
        checkpointer
            .save_phase(FRAMING_PHASE, PhaseData::text(&response.completion))
            .await?;
        Ok(response.completion)
    }

    async fn run_evidence(
        &self,
        checkpointer: &Arc<AnalysisCheckpointer>,
        proposition: &str,
        framing: &str,
        scenario: &ScenarioConfig,
    ) -> AppResult<Vec<EvidenceCluster>> {
        if let Some(PhaseData {
            payload: PhasePayload::Evidence { clusters },
            ..
        }) = checkpointer.get_phase_data(EVIDENCE_PHASE).await
        {
            return Ok(clusters);
        }
        checkpointer.start_phase(EVIDENCE_PHASE).await;

        let done: HashSet<String> = checkpointer
            .get_parallel_completed(EVIDENCE_PHASE, EVIDENCE_QUERIES)
            .await
            .into_iter()
            .collect();
        let pending: Vec<&EvidenceQuery> = scenario
            .evidence_queries
            .iter()
            .filter(|q| !done.contains(&q.id))
            .collect();

        info!(
            session_id = %checkpointer.session_id(),
            pending = pending.len(),
            already_completed = done.len(),
            "Starting evidence fan-out"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_parallel_calls.max(1)));
        let mut tasks = JoinSet::new();
        for query in pending {
            let task = EvidenceTask {
                reasoning: self.reasoning.clone(),
                checkpointer: checkpointer.clone(),
                semaphore: semaphore.clone(),
                budget: self.budget,
                scenario: scenario.clone(),
                query_id: query.id.clone(),
                request: self.evidence_request(proposition, framing, scenario, query),
            };
            tasks.spawn(task.run());
        }

        // Wait for every in-flight call so all of them are recorded.
        let mut incomplete = Vec::new();
        let mut budget_stopped = false;
        let mut fatal: Option<AppError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(EvidenceOutcome::Completed)) => {}
                Ok(Ok(EvidenceOutcome::Failed { query_id, reason })) => {
                    warn!(query = %query_id, reason = %reason, "Evidence query incomplete");
                    incomplete.push(query_id);
                }
                Ok(Ok(EvidenceOutcome::BudgetStopped { query_id })) => {
                    budget_stopped = true;
                    incomplete.push(query_id);
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Evidence task could not checkpoint its result");
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Evidence task aborted");
                    if fatal.is_none() {
                        fatal = Some(AppError::Internal {
                            message: format!("evidence task aborted: {}", e),
                        });
                    }
                }
            }
        }

        if let Some(e) = fatal {
            return Err(self
                .fail(checkpointer, EVIDENCE_PHASE, ErrorKind::PhaseFailure, e)
                .await);
        }
        if budget_stopped {
            return Err(self.budget_failure(checkpointer, EVIDENCE_PHASE).await);
        }
        if !incomplete.is_empty() {
            incomplete.sort();
            let err = AppError::PhaseFailure {
                phase: EVIDENCE_PHASE.to_string(),
                message: format!(
                    "{} of {} evidence queries incomplete: {}",
                    incomplete.len(),
                    scenario.evidence_queries.len(),
                    incomplete.join(", ")
                ),
            };
            return Err(self
                .fail(checkpointer, EVIDENCE_PHASE, ErrorKind::PhaseFailure, err)
                .await);
        }

        let results = checkpointer
            .get_parallel_results(EVIDENCE_PHASE, EVIDENCE_QUERIES)
            .await;
        let clusters = collect_clusters(&scenario.evidence_queries, &results)?;

        checkpointer
            .save_phase(
                EVIDENCE_PHASE,
                PhaseData::new(PhasePayload::Evidence {
                    clusters: clusters.clone(),
                }),
            )
            .await?;
        Ok(clusters)
    }

    fn evidence_request(
        &self,
        proposition: &str,
        framing: &str,
        scenario: &ScenarioConfig,
        query: &EvidenceQuery,
    ) -> ReasoningRequest {
        let hypotheses: Vec<String> = scenario
            .model
            .hypotheses
            .iter()
            .map(|h| format!("{} ({:?}): {}", h.id, h.stance, h.label))
            .collect();
        let paradigms: Vec<&str> = scenario.model.paradigms.iter().map(|p| p.id.as_str()).collect();

        let mut request = ReasoningRequest::new(
            &self.pipes.evidence,
            vec![
                Message::system(EVIDENCE_PROMPT),
                Message::user(format!(
                    "Proposition: {}\n\nFraming:\n{}\n\nQuery: {}\n\nParadigms: {}\n\nHypotheses:\n{}",
                    proposition,
                    framing,
                    query.query,
                    paradigms.join(", "),
                    hypotheses.join("\n")
                )),
            ],
        )
        .with_variable("query_id", &query.id);
        for tool in &scenario.evidence_tools {
            request = request.with_tool(tool);
        }
        request
    }

    async fn run_aggregation(
        &self,
        checkpointer: &AnalysisCheckpointer,
        scenario: &ScenarioConfig,
        clusters: &[EvidenceCluster],
    ) -> AppResult<Vec<ParadigmOutcome>> {
        checkpointer.start_phase(AGGREGATION_PHASE).await;
        match combine_checkpointed(checkpointer, &scenario.model, clusters, &self.verdict).await {
            Ok(outcomes) => Ok(outcomes),
            Err(e) => Err(self
                .fail(checkpointer, AGGREGATION_PHASE, ErrorKind::PhaseFailure, e)
                .await),
        }
    }

    async fn run_synthesis(
        &self,
        checkpointer: &AnalysisCheckpointer,
        proposition: &str,
        framing: &str,
        outcomes: &[ParadigmOutcome],
    ) -> AppResult<String> {
        if let Some(text) = completed_text(checkpointer, SYNTHESIS_PHASE).await {
            return Ok(text);
        }
        checkpointer.start_phase(SYNTHESIS_PHASE).await;

        let posterior = serde_json::to_string_pretty(outcomes).map_err(StorageError::from)?;
        let request = ReasoningRequest::new(
            &self.pipes.synthesis,
            vec![
                Message::system(SYNTHESIS_PROMPT),
                Message::user(format!(
                    "Proposition: {}\n\nFraming:\n{}\n\nPosterior by paradigm:\n{}",
                    proposition, framing, posterior
                )),
            ],
        );

        let response = self
            .call_single(checkpointer, SYNTHESIS_PHASE, &request)
            .await?;
        checkpointer
            .save_phase(SYNTHESIS_PHASE, PhaseData::text(&response.completion))
            .await?;
        Ok(response.completion)
    }

    /// One budget-checked, audited call. A failed call fails the phase.
    async fn call_single(
        &self,
        checkpointer: &AnalysisCheckpointer,
        phase: &str,
        request: &ReasoningRequest,
    ) -> AppResult<ReasoningResponse> {
        if self.budget.is_exceeded(checkpointer.total_cost_usd().await) {
            return Err(self.budget_failure(checkpointer, phase).await);
        }

        match invoke(self.reasoning.as_ref(), checkpointer, phase, request).await? {
            Ok(response) => Ok(response),
            Err(e) => {
                let kind = match e {
                    ReasoningError::Http(_) | ReasoningError::Timeout { .. } => {
                        ErrorKind::ServiceUnavailable
                    }
                    _ => ErrorKind::PhaseFailure,
                };
                let err = AppError::PhaseFailure {
                    phase: phase.to_string(),
                    message: e.to_string(),
                };
                Err(self.fail(checkpointer, phase, kind, err).await)
            }
        }
    }

    async fn budget_failure(&self, checkpointer: &AnalysisCheckpointer, phase: &str) -> AppError {
        let err = AppError::BudgetExceeded {
            spent: checkpointer.total_cost_usd().await,
            limit: self.budget.limit_usd().unwrap_or_default(),
        };
        self.fail(checkpointer, phase, ErrorKind::BudgetExceeded, err)
            .await
    }

    /// Mark the session failed and hand the error back.
    async fn fail(
        &self,
        checkpointer: &AnalysisCheckpointer,
        phase: &str,
        kind: ErrorKind,
        err: AppError,
    ) -> AppError {
        match checkpointer.save_error(&err.to_string(), phase, kind).await {
            Ok(hint) => info!(
                session_id = %checkpointer.session_id(),
                hint = %hint,
                "Session can be resumed"
            ),
            Err(e) => error!(
                session_id = %checkpointer.session_id(),
                error = %e,
                "Failed to record session error"
            ),
        }
        err
    }
}

#[async_trait]
impl TopicAnalyzer for AnalysisRunner {
    async fn analyze(&self, request: TopicRequest) -> AppResult<AnalysisResultSnapshot> {
        let mut result = self
            .start(&request.topic_id, &request.proposition, request.scenario_config)
            .await?;
        result.proposition = request.original_proposition;
        Ok(result)
    }
}

/// Text of a completed phase, if any.
async fn completed_text(checkpointer: &AnalysisCheckpointer, phase: &str) -> Option<String> {
    checkpointer
        .get_phase_data(phase)
        .await
        .and_then(|data| data.as_text().map(str::to_string))
}

/// Call the service once and record the outcome in the audit log.
///
/// The outer result fails only when recording fails.
async fn invoke(
    reasoning: &dyn ReasoningService,
    checkpointer: &AnalysisCheckpointer,
    phase: &str,
    request: &ReasoningRequest,
) -> AppResult<Result<ReasoningResponse, ReasoningError>> {
    let start = Instant::now();
    let result = reasoning.reason(request).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let details = match &result {
        Ok(response) => CallDetails::success(
            phase,
            &request.name,
            request.prompt_text(),
            response,
            duration_ms,
        ),
        Err(e) => CallDetails::failure(
            phase,
            &request.name,
            request.prompt_text(),
            e.to_string(),
            duration_ms,
        ),
    };
    checkpointer.record_api_call(details).await?;

    Ok(result)
}

/// Clusters in query declaration order.
fn collect_clusters(
    queries: &[EvidenceQuery],
    results: &BTreeMap<String, serde_json::Value>,
) -> AppResult<Vec<EvidenceCluster>> {
    queries
        .iter()
        .map(|q| {
            let value = results.get(&q.id).ok_or_else(|| AppError::PhaseFailure {
                phase: EVIDENCE_PHASE.to_string(),
                message: format!("no stored result for query '{}'", q.id),
            })?;
            serde_json::from_value(value.clone())
                .map_err(|e| AppError::from(StorageError::from(e)))
        })
        .collect()
}

enum EvidenceOutcome {
    Completed,
    Failed { query_id: String, reason: String },
    BudgetStopped { query_id: String },
}

/// Evidence reply as the pipe returns it.
#[derive(Debug, Deserialize)]
struct EvidenceReply {
    #[serde(default)]
    description: String,
    likelihoods: BTreeMap<String, BTreeMap<String, f64>>,
}

struct EvidenceTask {
    reasoning: Arc<dyn ReasoningService>,
    checkpointer: Arc<AnalysisCheckpointer>,
    semaphore: Arc<Semaphore>,
    budget: CostBudget,
    scenario: ScenarioConfig,
    query_id: String,
    request: ReasoningRequest,
}

impl EvidenceTask {
    async fn run(self) -> AppResult<EvidenceOutcome> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::Internal {
                message: format!("fan-out semaphore closed: {}", e),
            })?;

        if self
            .budget
            .is_exceeded(self.checkpointer.total_cost_usd().await)
        {
            return Ok(EvidenceOutcome::BudgetStopped {
                query_id: self.query_id,
            });
        }

        let response = match invoke(
            self.reasoning.as_ref(),
            &self.checkpointer,
            EVIDENCE_PHASE,
            &self.request,
        )
        .await?
        {
            Ok(response) => response,
            Err(e) => {
                return Ok(EvidenceOutcome::Failed {
                    query_id: self.query_id,
                    reason: e.to_string(),
                })
            }
        };

        let cluster = match self.parse_cluster(&response.completion) {
            Ok(cluster) => cluster,
            Err(reason) => {
                return Ok(EvidenceOutcome::Failed {
                    query_id: self.query_id,
                    reason,
                })
            }
        };

        let value = serde_json::to_value(&cluster).map_err(StorageError::from)?;
        self.checkpointer
            .save_parallel_progress(EVIDENCE_PHASE, EVIDENCE_QUERIES, &self.query_id, value)
            .await?;
        Ok(EvidenceOutcome::Completed)
    }

    fn parse_cluster(&self, completion: &str) -> Result<EvidenceCluster, String> {
        let json = extract_json_from_completion(completion)?;
        let reply: EvidenceReply = serde_json::from_str(json)
            .map_err(|e| format!("Failed to parse evidence response: {}", e))?;

        let cluster = EvidenceCluster {
            id: self.query_id.clone(),
            description: reply.description,
            likelihoods: reply.likelihoods,
        };
        validate_cluster(&self.scenario.model, &cluster).map_err(|e| e.to_string())?;
        Ok(cluster)
    }
}
