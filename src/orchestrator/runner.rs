use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{contextualize_proposition, Topic, TopicGraph};
use crate::error::AppResult;
use crate::storage::{AnalysisResultSnapshot, ProjectCheckpoint, SharedStore};

/// Input for one topic's analysis session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicRequest {
    pub topic_id: String,
    /// Proposition with any dependency digest already prepended.
    pub proposition: String,
    /// The topic's own proposition, as declared.
    pub original_proposition: String,
    pub scenario_config: serde_json::Value,
}

/// Runs the analysis session for one topic.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TopicAnalyzer: Send + Sync {
    async fn analyze(&self, request: TopicRequest) -> AppResult<AnalysisResultSnapshot>;
}

/// A topic whose session returned an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicFailure {
    pub topic_id: String,
    pub error: String,
}

/// A topic not run because a dependency has no result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedTopic {
    pub topic_id: String,
    pub missing: Vec<String>,
}

/// Summary of one project run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectOutcome {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<TopicFailure>,
    pub blocked: Vec<BlockedTopic>,
    pub checkpoint: ProjectCheckpoint,
}

/// Drives every topic of a project in dependency order.
pub struct ProjectRunner {
    store: SharedStore,
    analyzer: Arc<dyn TopicAnalyzer>,
}

impl ProjectRunner {
    pub fn new(store: SharedStore, analyzer: Arc<dyn TopicAnalyzer>) -> Self {
        Self { store, analyzer }
    }

    /// Validate the topics and run each one in order.
    ///
    /// With `resume`, results already in the project checkpoint are loaded
    /// first and their topics are skipped. A failing topic is logged and
    /// left out of the results; the run continues with the rest.
    pub async fn run(
        &self,
        project_path: &str,
        topics: Vec<Topic>,
        default_scenario: &serde_json::Value,
        resume: bool,
    ) -> AppResult<ProjectOutcome> {
        let graph = TopicGraph::build(topics)?;

        let mut checkpoint = if resume {
            match self.store.retrieve_project_checkpoint(project_path).await? {
                Some(existing) => {
                    info!(
                        project = %project_path,
                        completed = existing.completed_topics.len(),
                        "Resuming project from checkpoint"
                    );
                    existing
                }
                None => ProjectCheckpoint::new(project_path),
            }
        } else {
            ProjectCheckpoint::new(project_path)
        };
        self.persist(&checkpoint).await;

        let mut outcome = ProjectOutcome {
            executed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
            checkpoint: checkpoint.clone(),
        };

        info!(
            project = %project_path,
            topics = graph.len(),
            order = ?graph.execution_order_ids(),
            "Starting project run"
        );

        for index in graph.execution_order() {
            let Some(topic) = graph.topic(index) else {
                continue;
            };

            if checkpoint.results.contains_key(&topic.id) {
                info!(topic = %topic.id, "Topic already completed, skipping");
                outcome.skipped.push(topic.id.clone());
                continue;
            }

            let missing: Vec<String> = topic
                .depends_on
                .iter()
                .filter(|dep| !checkpoint.results.contains_key(*dep))
                .cloned()
                .collect();
            if !missing.is_empty() {
                warn!(
                    topic = %topic.id,
                    missing = ?missing,
                    "Topic blocked by unfinished dependencies"
                );
                outcome.blocked.push(BlockedTopic {
                    topic_id: topic.id.clone(),
                    missing,
                });
                continue;
            }

            let request = TopicRequest {
                topic_id: topic.id.clone(),
                proposition: contextualize_proposition(topic, &checkpoint.results),
                original_proposition: topic.proposition.clone(),
                scenario_config: topic
                    .scenario_config
                    .clone()
                    .unwrap_or_else(|| default_scenario.clone()),
            };

            info!(topic = %topic.id, "Running topic");
            match self.analyzer.analyze(request).await {
                Ok(result) => {
                    info!(
                        topic = %topic.id,
                        verdict = %result.verdict,
                        cost_usd = result.total_cost_usd,
                        "Topic completed"
                    );
                    checkpoint.record_result(&topic.id, result);
                    self.persist(&checkpoint).await;
                    outcome.executed.push(topic.id.clone());
                }
                Err(e) => {
                    error!(
                        topic = %topic.id,
                        error = %e,
                        "Topic failed, continuing with remaining topics"
                    );
                    outcome.failed.push(TopicFailure {
                        topic_id: topic.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            project = %project_path,
            executed = outcome.executed.len(),
            skipped = outcome.skipped.len(),
            failed = outcome.failed.len(),
            blocked = outcome.blocked.len(),
            "Project run finished"
        );

        outcome.checkpoint = checkpoint;
        Ok(outcome)
    }

    async fn persist(&self, checkpoint: &ProjectCheckpoint) {
        if let Err(e) = self.store.store_project_checkpoint(checkpoint).await {
            warn!(
                project = %checkpoint.project_path,
                error = %e,
                "Failed to persist project checkpoint"
            );
        }
    }
}
