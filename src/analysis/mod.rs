//! Phase driver for one topic's analysis session.
//!
//! A session runs four phases against the reasoning service:
//! - `framing`: one call restating the proposition
//! - `evidence`: one call per evidence query, fanned out and checkpointed per query
//! - `aggregation`: log-space posterior combination, checkpointed per cluster
//! - `synthesis`: one call summarizing the posterior
//!
//! Completed phases and fan-out items are skipped on resume.

mod runner;

pub use runner::AnalysisRunner;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{AppError, AppResult};
use crate::posterior::PosteriorModel;

/// Pseudo-phase blamed when a stored scenario config no longer validates.
pub const SCENARIO_PHASE: &str = "scenario";
pub const FRAMING_PHASE: &str = "framing";
pub const EVIDENCE_PHASE: &str = "evidence";
/// Sub-phase key under which evidence queries record progress.
pub const EVIDENCE_QUERIES: &str = "queries";
pub const AGGREGATION_PHASE: &str = "aggregation";
pub const SYNTHESIS_PHASE: &str = "synthesis";
pub const RESULT_PHASE: &str = "result";

/// One evidence-gathering unit of the fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceQuery {
    pub id: String,
    pub query: String,
}

/// The parts of a scenario config this driver reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(flatten)]
    pub model: PosteriorModel,
    #[serde(default)]
    pub evidence_queries: Vec<EvidenceQuery>,
    /// Service-side tools the evidence calls may use (e.g. `web_search`).
    #[serde(default)]
    pub evidence_tools: Vec<String>,
}

impl ScenarioConfig {
    /// Parse and validate a scenario config.
    pub fn from_value(value: &serde_json::Value) -> AppResult<Self> {
        let scenario: ScenarioConfig =
            serde_json::from_value(value.clone()).map_err(|e| AppError::Config {
                message: format!("Invalid scenario config: {}", e),
            })?;

        scenario.model.validate()?;

        let mut seen = HashSet::new();
        for query in &scenario.evidence_queries {
            if query.id.trim().is_empty() {
                return Err(AppError::Config {
                    message: "Evidence query id must not be empty".to_string(),
                });
            }
            if !seen.insert(query.id.as_str()) {
                return Err(AppError::Config {
                    message: format!("Duplicate evidence query id '{}'", query.id),
                });
            }
        }

        Ok(scenario)
    }
}

/// Extract JSON from a completion string, handling markdown code blocks.
///
/// Tries raw JSON first, then ```json blocks, then bare ``` blocks.
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scenario_json() -> serde_json::Value {
        json!({
            "hypotheses": [
                {"id": "H0", "stance": "opposes"},
                {"id": "H1", "stance": "supports"}
            ],
            "paradigms": [
                {"id": "P1", "priors": {"H0": 0.5, "H1": 0.5}}
            ],
            "evidence_queries": [
                {"id": "q1", "query": "studies"},
                {"id": "q2", "query": "surveys"}
            ]
        })
    }

    #[test]
    fn test_scenario_config_parses() {
        let scenario = ScenarioConfig::from_value(&scenario_json()).unwrap();
        assert_eq!(scenario.model.hypotheses.len(), 2);
        assert_eq!(scenario.evidence_queries.len(), 2);
        assert!(scenario.evidence_tools.is_empty());
    }

    #[test]
    fn test_scenario_config_rejects_duplicate_queries() {
        let mut value = scenario_json();
        value["evidence_queries"] = json!([
            {"id": "q1", "query": "a"},
            {"id": "q1", "query": "b"}
        ]);
        let err = ScenarioConfig::from_value(&value).unwrap_err();
        assert!(err.to_string().contains("Duplicate evidence query id 'q1'"));
    }

    #[test]
    fn test_scenario_config_rejects_bad_priors() {
        let mut value = scenario_json();
        value["paradigms"][0]["priors"]["H1"] = json!(0.9);
        let err = ScenarioConfig::from_value(&value).unwrap_err();
        assert!(matches!(err, AppError::Posterior(_)));
    }

    #[test]
    fn test_extract_json_raw() {
        let input = r#"{"description": "x"}"#;
        assert_eq!(extract_json_from_completion(input).unwrap(), input);
    }

    #[test]
    fn test_extract_json_from_fenced_block() {
        let input = "Here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json_from_completion(input).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_json_missing() {
        assert!(extract_json_from_completion("no json here").is_err());
    }
}
