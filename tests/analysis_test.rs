//! End-to-end analysis sessions against a mocked reasoning service.
//!
//! Requests are routed by pipe name, and evidence requests additionally by
//! the `query_id` variable, so each query can succeed or fail on its own.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use wiremock::{
    matchers::{body_partial_json, method, path},
    Mock, MockServer, ResponseTemplate, Times,
};

use resumable_analysis::analysis::AnalysisRunner;
use resumable_analysis::checkpoint::CostBudget;
use resumable_analysis::config::{
    BudgetConfig, CheckpointConfig, Config, DatabaseConfig, LogFormat, LoggingConfig, PipeConfig,
    PricingConfig, ReasoningConfig, RequestConfig, VerdictConfig,
};
use resumable_analysis::error::AppError;
use resumable_analysis::reasoning::ReasoningClient;
use resumable_analysis::storage::{
    CallStatus, CheckpointStatus, CheckpointStore, ErrorKind, SharedStore, SqliteStorage,
};

const FRAMING: &str = "analysis-framing-v1";
const EVIDENCE: &str = "evidence-elicitation-v1";
const SYNTHESIS: &str = "analysis-synthesis-v1";

/// Cost of one mocked call: 1000 input and 500 output tokens at 3/15 USD per Mtok.
const CALL_COST: f64 = 0.0105;

fn create_test_config(mock_url: &str) -> Config {
    Config {
        reasoning: ReasoningConfig {
            api_key: "test-api-key".to_string(),
            base_url: mock_url.to_string(),
        },
        database: DatabaseConfig {
            path: PathBuf::from(":memory:"),
            max_connections: 1,
        },
        logging: LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Pretty,
        },
        request: RequestConfig {
            timeout_ms: 5000,
            max_parallel_calls: 2,
        },
        pipes: PipeConfig::default(),
        checkpoint: CheckpointConfig::default(),
        budget: BudgetConfig::default(),
        pricing: PricingConfig::default(),
        verdict: VerdictConfig::default(),
    }
}

fn scenario() -> Value {
    json!({
        "hypotheses": [
            {"id": "H0", "label": "No effect", "stance": "opposes"},
            {"id": "H1", "label": "Improves focus", "stance": "supports"},
            {"id": "H_unforeseen", "label": "Something else", "stance": "neutral"}
        ],
        "paradigms": [
            {"id": "P1", "name": "Experimental", "priors": {"H0": 0.45, "H1": 0.45, "H_unforeseen": 0.1}}
        ],
        "evidence_queries": [
            {"id": "q1", "query": "controlled trials"},
            {"id": "q2", "query": "field surveys"}
        ]
    })
}

fn completion(text: &str) -> Value {
    json!({
        "success": true,
        "completion": text,
        "raw": {
            "model": "test-model",
            "usage": {"prompt_tokens": 1000, "completion_tokens": 500}
        }
    })
}

fn evidence_completion() -> Value {
    let body = json!({
        "description": "Trials favour an effect",
        "likelihoods": {"P1": {"H0": 0.2, "H1": 0.8, "H_unforeseen": 0.5}}
    });
    completion(&body.to_string())
}

async fn mount_pipe(server: &MockServer, pipe: &str, body: Value, times: impl Into<Times>) {
    Mock::given(method("POST"))
        .and(path("/v1/pipes/run"))
        .and(body_partial_json(json!({"name": pipe})))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(times)
        .mount(server)
        .await;
}

async fn mount_query(
    server: &MockServer,
    query_id: &str,
    response: ResponseTemplate,
    times: impl Into<Times>,
) {
    Mock::given(method("POST"))
        .and(path("/v1/pipes/run"))
        .and(body_partial_json(json!({
            "name": EVIDENCE,
            "variables": {"query_id": query_id}
        })))
        .respond_with(response)
        .expect(times)
        .mount(server)
        .await;
}

async fn create_store() -> SharedStore {
    Arc::new(SqliteStorage::new_in_memory().await.unwrap())
}

fn create_runner(server: &MockServer, store: SharedStore) -> AnalysisRunner {
    let config = create_test_config(&server.uri());
    let client = ReasoningClient::new(&config.reasoning, &config.request).unwrap();
    AnalysisRunner::new(Arc::new(client), store, &config)
}

#[tokio::test]
async fn test_full_session_completes() {
    let server = MockServer::start().await;
    mount_pipe(&server, FRAMING, completion("Framed."), 1).await;
    mount_query(
        &server,
        "q1",
        ResponseTemplate::new(200).set_body_json(evidence_completion()),
        1,
    )
    .await;
    mount_query(
        &server,
        "q2",
        ResponseTemplate::new(200).set_body_json(evidence_completion()),
        1,
    )
    .await;
    mount_pipe(&server, SYNTHESIS, completion("Evidence favours H1."), 1).await;

    let store = create_store().await;
    let runner = create_runner(&server, store.clone());

    let result = runner
        .start("scn", "Coffee improves focus", scenario())
        .await
        .unwrap();

    assert_eq!(result.verdict, "supported");
    assert_eq!(result.winning_hypothesis, "H1");
    // 0.45*0.64 / (0.45*0.04 + 0.45*0.64 + 0.1*0.25)
    assert!((result.posterior - 0.288 / 0.331).abs() < 1e-9);
    assert_eq!(result.summary, "Evidence favours H1.");
    assert!((result.total_cost_usd - 4.0 * CALL_COST).abs() < 1e-9);
    assert!(!result.paradigms[0].miscalibration_warning);

    let snapshot = store
        .retrieve_checkpoint(&result.analysis_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.status, CheckpointStatus::Completed);
    assert_eq!(snapshot.api_call_count, 4);
    for phase in ["framing", "evidence", "posterior_progress", "posterior", "synthesis", "result"] {
        assert!(snapshot.completed_phases.contains_key(phase), "missing {}", phase);
    }
    assert_eq!(
        snapshot.parallel_progress["evidence"]["queries"].completed.len(),
        2
    );

    let log = store.get_api_call_log(&result.analysis_id).await.unwrap();
    assert_eq!(log.len(), 4);
    assert_eq!(log[0].phase_name, "framing");
    assert_eq!(log[3].phase_name, "synthesis");
    assert!(log.iter().all(|r| r.status == CallStatus::Success));
    assert!(log.iter().all(|r| r.model == "test-model"));
}

#[tokio::test]
async fn test_invalid_scenario_makes_no_calls() {
    let server = MockServer::start().await;
    let store = create_store().await;
    let runner = create_runner(&server, store.clone());

    let mut bad = scenario();
    bad["paradigms"][0]["priors"]["H1"] = json!(0.9);
    let err = runner.start("scn", "p", bad).await.unwrap_err();

    assert!(matches!(err, AppError::Posterior(_)));
    assert!(store.list_checkpoints(None).await.unwrap().is_empty());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_query_then_resume_reuses_completed_work() {
    let store = create_store().await;

    // First run: q2 fails.
    let failing = MockServer::start().await;
    mount_pipe(&failing, FRAMING, completion("Framed."), 1).await;
    mount_query(
        &failing,
        "q1",
        ResponseTemplate::new(200).set_body_json(evidence_completion()),
        1,
    )
    .await;
    mount_query(&failing, "q2", ResponseTemplate::new(503).set_body_string("overloaded"), 1).await;
    mount_pipe(&failing, SYNTHESIS, completion("unused"), 0).await;

    let err = create_runner(&failing, store.clone())
        .start("scn", "Coffee improves focus", scenario())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PhaseFailure { ref phase, .. } if phase == "evidence"));

    let failed = store
        .list_checkpoints(Some(CheckpointStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    let failed_id = failed[0].session_id.clone();
    assert_eq!(failed[0].api_call_count, 3);
    assert_eq!(failed[0].resume_point.as_ref().unwrap().phase, "evidence");

    let log = store.get_api_call_log(&failed_id).await.unwrap();
    assert_eq!(log.len(), 3);
    let failures: Vec<_> = log.iter().filter(|r| r.status == CallStatus::Failure).collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.as_deref().unwrap().contains("503"));

    // Resume: only q2 and synthesis are called.
    let healthy = MockServer::start().await;
    mount_pipe(&healthy, FRAMING, completion("unused"), 0).await;
    mount_query(
        &healthy,
        "q1",
        ResponseTemplate::new(200).set_body_json(evidence_completion()),
        0,
    )
    .await;
    mount_query(
        &healthy,
        "q2",
        ResponseTemplate::new(200).set_body_json(evidence_completion()),
        1,
    )
    .await;
    mount_pipe(&healthy, SYNTHESIS, completion("Resumed summary."), 1).await;

    let result = create_runner(&healthy, store.clone())
        .resume(&failed_id)
        .await
        .unwrap();
    assert_ne!(result.analysis_id, failed_id);
    assert_eq!(result.verdict, "supported");
    assert_eq!(result.summary, "Resumed summary.");

    let resumed = store
        .retrieve_checkpoint(&result.analysis_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resumed.status, CheckpointStatus::Completed);
    assert_eq!(resumed.resumed_from.as_deref(), Some(failed_id.as_str()));
    assert_eq!(resumed.api_call_count, 5);

    let new_log = store.get_api_call_log(&result.analysis_id).await.unwrap();
    let ids: Vec<&str> = new_log.iter().map(|r| r.call_id.as_str()).collect();
    assert_eq!(ids, vec!["call-00004", "call-00005"]);

    // The failed session stays failed.
    let original = store.retrieve_checkpoint(&failed_id).await.unwrap().unwrap();
    assert_eq!(original.status, CheckpointStatus::Failed);
}

#[tokio::test]
async fn test_unparseable_evidence_fails_phase() {
    let server = MockServer::start().await;
    mount_pipe(&server, FRAMING, completion("Framed."), 1).await;
    mount_query(
        &server,
        "q1",
        ResponseTemplate::new(200).set_body_json(evidence_completion()),
        1,
    )
    .await;
    mount_query(
        &server,
        "q2",
        ResponseTemplate::new(200).set_body_json(completion("no json")),
        1,
    )
    .await;

    let store = create_store().await;
    let err = create_runner(&server, store.clone())
        .start("scn", "p", scenario())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("1 of 2 evidence queries incomplete: q2"));

    let failed = store
        .list_checkpoints(Some(CheckpointStatus::Failed))
        .await
        .unwrap();
    let snapshot = store
        .retrieve_checkpoint(&failed[0].session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        snapshot.parallel_progress["evidence"]["queries"].completed,
        vec!["q1"]
    );
}

#[tokio::test]
async fn test_budget_stops_further_calls() {
    let server = MockServer::start().await;
    mount_pipe(&server, FRAMING, completion("Framed."), 1).await;
    mount_query(
        &server,
        "q1",
        ResponseTemplate::new(200).set_body_json(evidence_completion()),
        0..=1u64,
    )
    .await;
    mount_query(
        &server,
        "q2",
        ResponseTemplate::new(200).set_body_json(evidence_completion()),
        0..=1u64,
    )
    .await;
    mount_pipe(&server, SYNTHESIS, completion("unused"), 0).await;

    let store = create_store().await;
    let runner = create_runner(&server, store.clone())
        .with_budget(CostBudget::new(Some(0.015)))
        .with_max_parallel_calls(1);

    let err = runner.start("scn", "p", scenario()).await.unwrap_err();
    assert!(matches!(err, AppError::BudgetExceeded { .. }));

    let failed = store
        .list_checkpoints(Some(CheckpointStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    let snapshot = store
        .retrieve_checkpoint(&failed[0].session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.error.unwrap().error_type, ErrorKind::BudgetExceeded);
    // Framing plus exactly one evidence query.
    assert_eq!(snapshot.api_call_count, 2);
    assert!(snapshot.resume_point.unwrap().description.contains("COST_BUDGET_USD"));
}
