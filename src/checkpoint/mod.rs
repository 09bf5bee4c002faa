//! Analysis checkpointer: the per-session state machine.
//!
//! One [`AnalysisCheckpointer`] owns one session. Every external call is
//! appended to the audit log before [`AnalysisCheckpointer::record_api_call`]
//! returns, and every state change replaces the full snapshot in the store,
//! so a crashed session can resume inside a phase, not only between phases.
//!
//! ```text
//! in_progress ──(call / phase events)──> in_progress
//!     │                                     │
//!     └──> completed (terminal)             └──> failed (terminal, resumable
//!                                                 into a fresh session)
//! ```

mod budget;
mod truncate;


pub use budget::CostBudget;
pub use truncate::{
    truncate_chars, truncate_free_text, truncate_phase_data, truncate_value, FREE_TEXT_KEYS,
};

use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, PricingConfig};
use crate::error::{CheckpointError, CheckpointResult, StorageError};
use crate::reasoning::{ReasoningResponse, TokenUsage};
use crate::storage::{
    ApiCallRecord, CallStatus, CheckpointStatus, CompletedPhase, ErrorKind, ParallelProgress,
    PhaseData, ResumePoint, SessionCheckpoint, SessionError, SharedStore,
};

/// Characters of the prompt kept in an audit record.
pub const PROMPT_DIGEST_CHARS: usize = 2000;

/// Knobs the checkpointer needs from the application config.
#[derive(Debug, Clone)]
pub struct CheckpointSettings {
    pub max_field_chars: usize,
    pub pricing: PricingConfig,
}

impl CheckpointSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_field_chars: config.checkpoint.max_field_chars,
            pricing: config.pricing.clone(),
        }
    }
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            max_field_chars: 10_000,
            pricing: PricingConfig::default(),
        }
    }
}

/// Everything known about one finished external call.
#[derive(Debug, Clone)]
pub struct CallDetails {
    pub phase_name: String,
    pub method: String,
    pub model: String,
    pub prompt: String,
    pub status: CallStatus,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    pub tools_used: Vec<String>,
    pub error: Option<String>,
}

impl CallDetails {
    /// A call that returned a response.
    pub fn success(
        phase_name: impl Into<String>,
        method: impl Into<String>,
        prompt: impl Into<String>,
        response: &ReasoningResponse,
        duration_ms: u64,
    ) -> Self {
        Self {
            phase_name: phase_name.into(),
            method: method.into(),
            model: response.model().unwrap_or("unknown").to_string(),
            prompt: prompt.into(),
            status: CallStatus::Success,
            usage: response.usage(),
            duration_ms,
            tools_used: response.tools_used.clone(),
            error: None,
        }
    }

    /// A call that failed before producing a usable response.
    pub fn failure(
        phase_name: impl Into<String>,
        method: impl Into<String>,
        prompt: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            phase_name: phase_name.into(),
            method: method.into(),
            model: "unknown".to_string(),
            prompt: prompt.into(),
            status: CallStatus::Failure,
            usage: TokenUsage::default(),
            duration_ms,
            tools_used: Vec::new(),
            error: Some(error.into()),
        }
    }
}

struct SessionState {
    snapshot: SessionCheckpoint,
    current_phase: Option<String>,
}

/// Per-session state machine over the checkpoint store.
///
/// The state lock is held across store writes, so snapshots reach the
/// store in the order their mutations happened.
pub struct AnalysisCheckpointer {
    session_id: String,
    store: SharedStore,
    settings: CheckpointSettings,
    state: Mutex<SessionState>,
}

impl AnalysisCheckpointer {
    fn from_snapshot(
        store: SharedStore,
        snapshot: SessionCheckpoint,
        settings: CheckpointSettings,
    ) -> Self {
        Self {
            session_id: snapshot.analysis_id.clone(),
            store,
            settings,
            state: Mutex::new(SessionState {
                snapshot,
                current_phase: None,
            }),
        }
    }

    /// Start a new session and persist its initial snapshot.
    pub async fn create(
        store: SharedStore,
        scenario_id: impl Into<String>,
        proposition: impl Into<String>,
        scenario_config: serde_json::Value,
        settings: CheckpointSettings,
    ) -> CheckpointResult<Self> {
        let snapshot = SessionCheckpoint::new(scenario_id, proposition, scenario_config);
        store
            .store_checkpoint(&snapshot.analysis_id, &snapshot)
            .await?;

        info!(
            session_id = %snapshot.analysis_id,
            scenario_id = %snapshot.scenario_id,
            "Analysis session created"
        );
        Ok(Self::from_snapshot(store, snapshot, settings))
    }

    /// Rebuild a checkpointer from the last stored snapshot.
    ///
    /// The call counter and cost totals continue from the persisted values.
    pub async fn load(
        store: SharedStore,
        session_id: &str,
        settings: CheckpointSettings,
    ) -> CheckpointResult<Self> {
        let snapshot = store.retrieve_checkpoint(session_id).await?.ok_or_else(|| {
            StorageError::CheckpointNotFound {
                session_id: session_id.to_string(),
            }
        })?;

        debug!(
            session_id = %session_id,
            api_call_count = snapshot.api_call_count,
            phases = snapshot.completed_phases.len(),
            "Loaded analysis session"
        );
        Ok(Self::from_snapshot(store, snapshot, settings))
    }

    /// Spawn a fresh session continuing a failed one.
    ///
    /// The new session inherits completed phases, fan-out progress, the call
    /// counter and cost totals. Returns it with the point to resume from.
    pub async fn resume_from(
        store: SharedStore,
        failed_session_id: &str,
        settings: CheckpointSettings,
    ) -> CheckpointResult<(Self, ResumePoint)> {
        let old = store
            .retrieve_checkpoint(failed_session_id)
            .await?
            .ok_or_else(|| StorageError::CheckpointNotFound {
                session_id: failed_session_id.to_string(),
            })?;

        if old.status != CheckpointStatus::Failed {
            return Err(CheckpointError::NotResumable {
                session_id: failed_session_id.to_string(),
                status: old.status.to_string(),
            });
        }

        let resume_point = old.resume_point.clone().unwrap_or_else(|| ResumePoint {
            phase: old
                .error
                .as_ref()
                .map(|e| e.phase.clone())
                .unwrap_or_default(),
            description: "No resume point recorded; restarting incomplete phases".to_string(),
        });

        let mut snapshot = SessionCheckpoint::new(
            old.scenario_id.clone(),
            old.proposition.clone(),
            old.scenario_config.clone(),
        );
        snapshot.api_call_count = old.api_call_count;
        snapshot.cost_summary = old.cost_summary.clone();
        snapshot.completed_phases = old.completed_phases;
        snapshot.parallel_progress = old.parallel_progress;
        snapshot.resumed_from = Some(failed_session_id.to_string());

        store
            .store_checkpoint(&snapshot.analysis_id, &snapshot)
            .await?;

        info!(
            session_id = %snapshot.analysis_id,
            resumed_from = %failed_session_id,
            phase = %resume_point.phase,
            "Resuming failed session in a new session"
        );
        Ok((Self::from_snapshot(store, snapshot, settings), resume_point))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Copy of the current in-memory snapshot.
    pub async fn snapshot(&self) -> SessionCheckpoint {
        self.state.lock().await.snapshot.clone()
    }

    pub async fn status(&self) -> CheckpointStatus {
        self.state.lock().await.snapshot.status
    }

    pub async fn api_call_count(&self) -> u64 {
        self.state.lock().await.snapshot.api_call_count
    }

    pub async fn total_cost_usd(&self) -> f64 {
        self.state.lock().await.snapshot.cost_summary.total_cost_usd
    }

    /// Note that a phase has been entered. Not persisted.
    pub async fn start_phase(&self, phase_id: &str) {
        let mut state = self.state.lock().await;
        info!(session_id = %self.session_id, phase = %phase_id, "Phase started");
        state.current_phase = Some(phase_id.to_string());
    }

    /// Phase most recently passed to [`start_phase`](Self::start_phase).
    pub async fn current_phase(&self) -> Option<String> {
        self.state.lock().await.current_phase.clone()
    }

    /// Record one external call and return its call id.
    ///
    /// The audit record is durable before the snapshot totals are updated.
    pub async fn record_api_call(&self, details: CallDetails) -> CheckpointResult<String> {
        let mut state = self.state.lock().await;
        self.ensure_active(&state.snapshot)?;

        let next_count = state.snapshot.api_call_count + 1;
        let cost_usd = self.settings.pricing.cost_usd(
            details.usage.input_tokens,
            details.usage.output_tokens,
            details.usage.reasoning_tokens,
        );
        let call_id = format!("call-{:05}", next_count);

        let record = ApiCallRecord {
            call_id: call_id.clone(),
            timestamp: Utc::now(),
            phase_name: details.phase_name,
            method: details.method,
            model: details.model,
            prompt: truncate_chars(&details.prompt, PROMPT_DIGEST_CHARS).to_string(),
            status: details.status,
            input_tokens: details.usage.input_tokens,
            output_tokens: details.usage.output_tokens,
            reasoning_tokens: details.usage.reasoning_tokens,
            cost_usd,
            duration_ms: details.duration_ms,
            tools_used: details.tools_used,
            error: details.error,
        };

        self.store
            .append_api_call_log(&self.session_id, &record)
            .await?;

        let snapshot = &mut state.snapshot;
        snapshot.api_call_count = next_count;
        snapshot.cost_summary.total_cost_usd += cost_usd;
        snapshot.cost_summary.total_input_tokens += record.input_tokens;
        snapshot.cost_summary.total_output_tokens += record.output_tokens;
        snapshot.cost_summary.total_reasoning_tokens += record.reasoning_tokens;
        self.persist(snapshot).await?;

        debug!(
            session_id = %self.session_id,
            call_id = %call_id,
            phase = %record.phase_name,
            status = ?record.status,
            cost_usd = cost_usd,
            "API call recorded"
        );
        Ok(call_id)
    }

    /// Finalize a phase and persist the snapshot.
    pub async fn save_phase(&self, phase_id: &str, data: PhaseData) -> CheckpointResult<()> {
        let data = truncate_phase_data(data, self.settings.max_field_chars);

        let mut state = self.state.lock().await;
        self.ensure_active(&state.snapshot)?;

        state.snapshot.completed_phases.insert(
            phase_id.to_string(),
            CompletedPhase {
                data,
                completed_at: Utc::now(),
            },
        );
        self.persist(&mut state.snapshot).await?;

        info!(session_id = %self.session_id, phase = %phase_id, "Phase saved");
        Ok(())
    }

    /// Record completion of one fan-out item. Re-recording an item replaces
    /// its result without adding a second membership entry.
    ///
    /// Only free-text fields of the result are truncated.
    pub async fn save_parallel_progress(
        &self,
        phase_id: &str,
        sub_phase: &str,
        item_id: &str,
        mut item_result: serde_json::Value,
    ) -> CheckpointResult<()> {
        truncate_free_text(&mut item_result, self.settings.max_field_chars);

        let mut state = self.state.lock().await;
        self.ensure_active(&state.snapshot)?;

        let is_new = state
            .snapshot
            .parallel_progress
            .entry(phase_id.to_string())
            .or_default()
            .entry(sub_phase.to_string())
            .or_default()
            .record(item_id, item_result);
        self.persist(&mut state.snapshot).await?;

        debug!(
            session_id = %self.session_id,
            phase = %phase_id,
            sub_phase = %sub_phase,
            item_id = %item_id,
            is_new,
            "Parallel progress saved"
        );
        Ok(())
    }

    /// Completed item ids of a fan-out, in first-completion order.
    pub async fn get_parallel_completed(&self, phase_id: &str, sub_phase: &str) -> Vec<String> {
        self.with_progress(phase_id, sub_phase, |p| p.completed.clone())
            .await
            .unwrap_or_default()
    }

    /// Latest result per completed item of a fan-out.
    pub async fn get_parallel_results(
        &self,
        phase_id: &str,
        sub_phase: &str,
    ) -> BTreeMap<String, serde_json::Value> {
        self.with_progress(phase_id, sub_phase, |p| p.results.clone())
            .await
            .unwrap_or_default()
    }

    async fn with_progress<T>(
        &self,
        phase_id: &str,
        sub_phase: &str,
        f: impl FnOnce(&ParallelProgress) -> T,
    ) -> Option<T> {
        let state = self.state.lock().await;
        state
            .snapshot
            .parallel_progress
            .get(phase_id)
            .and_then(|subs| subs.get(sub_phase))
            .map(f)
    }

    /// Mark the session failed and return instructions for resuming it.
    pub async fn save_error(
        &self,
        message: &str,
        phase: &str,
        error_type: ErrorKind,
    ) -> CheckpointResult<String> {
        let mut state = self.state.lock().await;
        self.ensure_active(&state.snapshot)?;

        let completed = state.snapshot.completed_phases.len();
        let description = match error_type {
            ErrorKind::BudgetExceeded => format!(
                "Cost budget exhausted during '{}'; raise COST_BUDGET_USD before resuming",
                phase
            ),
            _ => format!(
                "Retry phase '{}' ({} completed phase(s) will be reused)",
                phase, completed
            ),
        };

        let snapshot = &mut state.snapshot;
        snapshot.status = CheckpointStatus::Failed;
        snapshot.error = Some(SessionError {
            message: message.to_string(),
            phase: phase.to_string(),
            error_type,
        });
        snapshot.resume_point = Some(ResumePoint {
            phase: phase.to_string(),
            description: description.clone(),
        });
        self.persist(snapshot).await?;

        warn!(
            session_id = %self.session_id,
            phase = %phase,
            error_type = %error_type,
            error = %message,
            "Analysis session failed"
        );

        Ok(format!(
            "Session {} failed in phase '{}': {}. {}. Run `resumable-analysis resume {}` to continue in a new session.",
            self.session_id, phase, message, description, self.session_id
        ))
    }

    /// Mark the session completed.
    pub async fn mark_completed(&self) -> CheckpointResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_active(&state.snapshot)?;

        state.snapshot.status = CheckpointStatus::Completed;
        state.snapshot.resume_point = None;
        self.persist(&mut state.snapshot).await?;

        info!(
            session_id = %self.session_id,
            api_calls = state.snapshot.api_call_count,
            total_cost_usd = state.snapshot.cost_summary.total_cost_usd,
            "Analysis session completed"
        );
        Ok(())
    }

    pub async fn is_phase_completed(&self, phase_id: &str) -> bool {
        self.state
            .lock()
            .await
            .snapshot
            .completed_phases
            .contains_key(phase_id)
    }

    /// Finalized data of a completed phase.
    pub async fn get_phase_data(&self, phase_id: &str) -> Option<PhaseData> {
        self.state
            .lock()
            .await
            .snapshot
            .completed_phases
            .get(phase_id)
            .map(|p| p.data.clone())
    }

    fn ensure_active(&self, snapshot: &SessionCheckpoint) -> CheckpointResult<()> {
        if snapshot.status.is_terminal() {
            return Err(CheckpointError::SessionTerminal {
                session_id: self.session_id.clone(),
                status: snapshot.status.to_string(),
            });
        }
        Ok(())
    }

    async fn persist(&self, snapshot: &mut SessionCheckpoint) -> CheckpointResult<()> {
        snapshot.updated_at = Utc::now();
        self.store
            .store_checkpoint(&self.session_id, snapshot)
            .await?;
        Ok(())
    }
}
