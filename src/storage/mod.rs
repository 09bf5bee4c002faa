//! Checkpoint store: durable persistence for analysis sessions.
//!
//! Two independent contracts share one keyspace (the session id):
//! - an append-only audit log with one immutable record per external call
//! - a full-replace session snapshot that is never observed half-written
//!
//! Project-level progress for the topic orchestrator is kept alongside.

mod sqlite;


pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StorageResult;
use crate::posterior::{AggregationState, EvidenceCluster, ParadigmOutcome};

/// Lifecycle status of an analysis session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Session is running or resumable.
    #[default]
    InProgress,
    /// Session finished all phases.
    Completed,
    /// Session stopped with an error; a new session may resume it.
    Failed,
}

impl CheckpointStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::InProgress => "in_progress",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }

    /// Whether no further mutation is allowed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckpointStatus::InProgress)
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in_progress" => Ok(CheckpointStatus::InProgress),
            "completed" => Ok(CheckpointStatus::Completed),
            "failed" => Ok(CheckpointStatus::Failed),
            _ => Err(format!("Unknown checkpoint status: {}", s)),
        }
    }
}

/// Outcome of one external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Failure,
}

/// Classification of a session-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A phase could not produce a finalized result.
    PhaseFailure,
    /// The configured cost ceiling was crossed.
    BudgetExceeded,
    /// The reasoning service could not be reached at all.
    ServiceUnavailable,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::PhaseFailure => write!(f, "phase_failure"),
            ErrorKind::BudgetExceeded => write!(f, "budget_exceeded"),
            ErrorKind::ServiceUnavailable => write!(f, "service_unavailable"),
        }
    }
}

/// Running cost and token totals for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_reasoning_tokens: u64,
}

/// One line of the audit log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallRecord {
    /// Session-scoped call identifier (`call-00001`, ...).
    pub call_id: String,
    pub timestamp: DateTime<Utc>,
    pub phase_name: String,
    /// Pipe or operation invoked.
    pub method: String,
    pub model: String,
    /// Prompt digest (leading characters of the prompt).
    pub prompt: String,
    pub status: CallStatus,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Finalized output of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhasePayload {
    /// Free-form text produced by the phase.
    Text { content: String },
    /// Evidence clusters with per-paradigm likelihoods.
    Evidence { clusters: Vec<EvidenceCluster> },
    /// Unnormalized running posterior after some clusters.
    PosteriorProgress { state: AggregationState },
    /// Normalized posterior per paradigm.
    Posterior { outcomes: Vec<ParadigmOutcome> },
    /// Finalized topic result.
    Result { result: AnalysisResultSnapshot },
    /// Anything else, kept as open fields.
    Generic {
        #[serde(default)]
        fields: serde_json::Map<String, serde_json::Value>,
    },
}

/// Payload plus open-ended extension fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseData {
    pub payload: PhasePayload,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl PhaseData {
    /// Wrap a payload with no extensions.
    pub fn new(payload: PhasePayload) -> Self {
        Self {
            payload,
            extensions: serde_json::Map::new(),
        }
    }

    /// Text payload shortcut.
    pub fn text(content: impl Into<String>) -> Self {
        Self::new(PhasePayload::Text {
            content: content.into(),
        })
    }

    /// Attach an extension field.
    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// The text content if this is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            PhasePayload::Text { content } => Some(content),
            _ => None,
        }
    }
}

/// A phase entry in `completed_phases`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedPhase {
    pub data: PhaseData,
    pub completed_at: DateTime<Utc>,
}

/// Fan-out progress for one (phase, sub-phase).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelProgress {
    /// Completed item ids in first-completion order, without duplicates.
    pub completed: Vec<String>,
    /// Latest result per item id.
    pub results: BTreeMap<String, serde_json::Value>,
}

impl ParallelProgress {
    /// Record an item; returns true if it was not completed before.
    pub fn record(&mut self, item_id: &str, result: serde_json::Value) -> bool {
        let is_new = !self.results.contains_key(item_id);
        if is_new {
            self.completed.push(item_id.to_string());
        }
        self.results.insert(item_id.to_string(), result);
        is_new
    }
}

/// Where a failed session should be picked up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub phase: String,
    pub description: String,
}

/// Structured error recorded on a failed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    pub message: String,
    pub phase: String,
    #[serde(rename = "type")]
    pub error_type: ErrorKind,
}

/// Full session snapshot; replaced as a whole on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub checkpoint_id: String,
    pub analysis_id: String,
    pub scenario_id: String,
    pub proposition: String,
    pub scenario_config: serde_json::Value,
    pub status: CheckpointStatus,
    pub api_call_count: u64,
    pub cost_summary: CostSummary,
    #[serde(default)]
    pub completed_phases: BTreeMap<String, CompletedPhase>,
    /// phase -> sub_phase -> progress
    #[serde(default)]
    pub parallel_progress: BTreeMap<String, BTreeMap<String, ParallelProgress>>,
    pub resume_point: Option<ResumePoint>,
    pub error: Option<SessionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionCheckpoint {
    /// Create a fresh in-progress snapshot with a new analysis id.
    pub fn new(
        scenario_id: impl Into<String>,
        proposition: impl Into<String>,
        scenario_config: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            analysis_id: Uuid::new_v4().to_string(),
            scenario_id: scenario_id.into(),
            proposition: proposition.into(),
            scenario_config,
            status: CheckpointStatus::InProgress,
            api_call_count: 0,
            cost_summary: CostSummary::default(),
            completed_phases: BTreeMap::new(),
            parallel_progress: BTreeMap::new(),
            resume_point: None,
            error: None,
            resumed_from: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Summary row for listings.
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            session_id: self.analysis_id.clone(),
            scenario_id: self.scenario_id.clone(),
            proposition: self.proposition.clone(),
            status: self.status,
            api_call_count: self.api_call_count,
            total_cost_usd: self.cost_summary.total_cost_usd,
            resume_point: self.resume_point.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Listing entry for operational introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub session_id: String,
    pub scenario_id: String,
    pub proposition: String,
    pub status: CheckpointStatus,
    pub api_call_count: u64,
    pub total_cost_usd: f64,
    pub resume_point: Option<ResumePoint>,
    pub updated_at: DateTime<Utc>,
}

/// One page of a session's audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogPage {
    pub session_id: String,
    pub records: Vec<ApiCallRecord>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

/// Finalized result of one topic, as kept in the project checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResultSnapshot {
    pub analysis_id: String,
    pub proposition: String,
    /// Headline verdict (from the first paradigm).
    pub verdict: String,
    pub winning_hypothesis: String,
    pub posterior: f64,
    pub summary: String,
    #[serde(default)]
    pub paradigms: Vec<ParadigmOutcome>,
    pub total_cost_usd: f64,
    pub completed_at: DateTime<Utc>,
}

/// Project-level progress across topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectCheckpoint {
    pub project_path: String,
    pub completed_topics: Vec<String>,
    pub results: BTreeMap<String, AnalysisResultSnapshot>,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ProjectCheckpoint {
    /// Start an empty project checkpoint.
    pub fn new(project_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            project_path: project_path.into(),
            completed_topics: Vec::new(),
            results: BTreeMap::new(),
            started_at: now,
            last_updated: now,
        }
    }

    /// Record a topic result.
    pub fn record_result(&mut self, topic_id: &str, result: AnalysisResultSnapshot) {
        if !self.completed_topics.iter().any(|t| t == topic_id) {
            self.completed_topics.push(topic_id.to_string());
        }
        self.results.insert(topic_id.to_string(), result);
        self.last_updated = Utc::now();
    }
}

/// Store handle shared between components.
pub type SharedStore = Arc<dyn CheckpointStore>;

/// Persistence contract for checkpoints and audit logs.
///
/// Implementations surface unavailability as errors and never retry.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    // Audit log (append-only)

    /// Append one record. Durable once this returns `Ok`.
    async fn append_api_call_log(&self, session_id: &str, record: &ApiCallRecord)
        -> StorageResult<()>;
    /// All records of a session in append order.
    async fn get_api_call_log(&self, session_id: &str) -> StorageResult<Vec<ApiCallRecord>>;
    /// One page of a session's records in append order.
    async fn get_api_call_log_page(
        &self,
        session_id: &str,
        offset: u64,
        limit: u64,
    ) -> StorageResult<AuditLogPage>;

    // Session snapshots (full replace)

    /// Atomically replace the session snapshot.
    async fn store_checkpoint(&self, session_id: &str, snapshot: &SessionCheckpoint)
        -> StorageResult<()>;
    /// Latest snapshot, if any.
    async fn retrieve_checkpoint(&self, session_id: &str)
        -> StorageResult<Option<SessionCheckpoint>>;
    /// Latest snapshot as the stored JSON blob.
    async fn retrieve_checkpoint_raw(&self, session_id: &str) -> StorageResult<Option<String>>;
    /// Summaries, newest first, optionally filtered by status.
    async fn list_checkpoints(
        &self,
        status: Option<CheckpointStatus>,
    ) -> StorageResult<Vec<CheckpointSummary>>;

    // Project checkpoints

    /// Replace the project checkpoint.
    async fn store_project_checkpoint(&self, project: &ProjectCheckpoint) -> StorageResult<()>;
    /// Load a project checkpoint by path.
    async fn retrieve_project_checkpoint(
        &self,
        project_path: &str,
    ) -> StorageResult<Option<ProjectCheckpoint>>;
}
