//! Checkpointer behavior across process restarts, simulated by reloading
//! sessions from an on-disk store.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use resumable_analysis::checkpoint::{AnalysisCheckpointer, CallDetails, CheckpointSettings};
use resumable_analysis::config::{DatabaseConfig, PricingConfig, VerdictConfig};
use resumable_analysis::error::CheckpointError;
use resumable_analysis::posterior::{
    combine_checkpointed, AggregationState, EvidenceCluster, Hypothesis, Paradigm,
    PosteriorModel, Stance, POSTERIOR_PHASE, POSTERIOR_PROGRESS_PHASE,
};
use resumable_analysis::reasoning::TokenUsage;
use resumable_analysis::storage::{
    CallStatus, CheckpointStatus, CheckpointStore, ErrorKind, PhaseData, PhasePayload,
    SharedStore, SqliteStorage,
};

const LIMIT: usize = 10;

fn settings() -> CheckpointSettings {
    CheckpointSettings {
        max_field_chars: LIMIT,
        pricing: PricingConfig {
            input_per_mtok: 1.0,
            output_per_mtok: 2.0,
            reasoning_per_mtok: 2.0,
        },
    }
}

async fn open_store(dir: &TempDir) -> SharedStore {
    let config = DatabaseConfig {
        path: dir.path().join("checkpoints.db"),
        max_connections: 4,
    };
    Arc::new(SqliteStorage::new(&config).await.unwrap())
}

fn call(phase: &str) -> CallDetails {
    CallDetails {
        phase_name: phase.to_string(),
        method: "evidence-elicitation-v1".to_string(),
        model: "m".to_string(),
        prompt: "q".to_string(),
        status: CallStatus::Success,
        usage: TokenUsage {
            input_tokens: 1000,
            output_tokens: 1000,
            reasoning_tokens: 0,
        },
        duration_ms: 5,
        tools_used: Vec::new(),
        error: None,
    }
}

#[tokio::test]
async fn test_truncation_boundary() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let session = AnalysisCheckpointer::create(store.clone(), "s", "p", json!({}), settings())
        .await
        .unwrap();

    let exact = "a".repeat(LIMIT);
    let over = format!("{}é", "b".repeat(LIMIT));
    session.save_phase("exact", PhaseData::text(&exact)).await.unwrap();
    session.save_phase("over", PhaseData::text(&over)).await.unwrap();
    session
        .save_phase(
            "nested",
            PhaseData::text("short").with_extension("notes", json!(["x".repeat(LIMIT + 5)])),
        )
        .await
        .unwrap();

    let stored = store
        .retrieve_checkpoint(session.session_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.completed_phases["exact"].data.as_text(), Some(exact.as_str()));
    assert_eq!(
        stored.completed_phases["over"].data.as_text(),
        Some("b".repeat(LIMIT).as_str())
    );
    assert_eq!(
        stored.completed_phases["nested"].data.extensions["notes"][0],
        json!("x".repeat(LIMIT))
    );
}

#[tokio::test]
async fn test_parallel_progress_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let session = AnalysisCheckpointer::create(store.clone(), "s", "p", json!({}), settings())
        .await
        .unwrap();

    session
        .save_parallel_progress("evidence", "queries", "q1", json!({"v": 1}))
        .await
        .unwrap();
    session
        .save_parallel_progress("evidence", "queries", "q2", json!({"v": 2}))
        .await
        .unwrap();
    session
        .save_parallel_progress("evidence", "queries", "q1", json!({"v": 3}))
        .await
        .unwrap();

    assert_eq!(
        session.get_parallel_completed("evidence", "queries").await,
        vec!["q1", "q2"]
    );
    let results = session.get_parallel_results("evidence", "queries").await;
    assert_eq!(results["q1"], json!({"v": 3}));
    assert!(session.get_parallel_completed("evidence", "other").await.is_empty());
}

#[tokio::test]
async fn test_reload_restores_counter_cost_and_progress() {
    let dir = TempDir::new().unwrap();
    let session_id = {
        let store = open_store(&dir).await;
        let session = AnalysisCheckpointer::create(store, "s", "p", json!({}), settings())
            .await
            .unwrap();
        for _ in 0..3 {
            session.record_api_call(call("evidence")).await.unwrap();
        }
        session.save_phase("framing", PhaseData::text("framed")).await.unwrap();
        session
            .save_parallel_progress("evidence", "queries", "q1", json!({"v": 1}))
            .await
            .unwrap();
        session.session_id().to_string()
    };

    // Fresh store handle on the same file, as after a restart.
    let store = open_store(&dir).await;
    let reloaded = AnalysisCheckpointer::load(store.clone(), &session_id, settings())
        .await
        .unwrap();

    assert_eq!(reloaded.api_call_count().await, 3);
    // 3 calls x (1000 * 1.0 + 1000 * 2.0) / 1e6
    assert!((reloaded.total_cost_usd().await - 0.009).abs() < 1e-12);
    assert!(reloaded.is_phase_completed("framing").await);
    assert_eq!(
        reloaded.get_parallel_completed("evidence", "queries").await,
        vec!["q1"]
    );

    let next = reloaded.record_api_call(call("evidence")).await.unwrap();
    assert_eq!(next, "call-00004");
    assert_eq!(store.get_api_call_log(&session_id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_failed_session_rejects_writes_and_resumes_elsewhere() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let session = AnalysisCheckpointer::create(store.clone(), "s", "p", json!({}), settings())
        .await
        .unwrap();
    session.save_phase("framing", PhaseData::text("framed")).await.unwrap();
    session.record_api_call(call("evidence")).await.unwrap();

    let hint = session
        .save_error("2 of 5 queries incomplete", "evidence", ErrorKind::PhaseFailure)
        .await
        .unwrap();
    assert!(hint.contains(session.session_id()));
    assert!(hint.contains("evidence"));

    let err = session
        .save_phase("evidence", PhaseData::text("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::SessionTerminal { .. }));
    let err = session.record_api_call(call("evidence")).await.unwrap_err();
    assert!(matches!(err, CheckpointError::SessionTerminal { .. }));

    let (resumed, point) =
        AnalysisCheckpointer::resume_from(store.clone(), session.session_id(), settings())
            .await
            .unwrap();
    assert_eq!(point.phase, "evidence");
    assert_ne!(resumed.session_id(), session.session_id());
    assert!(resumed.is_phase_completed("framing").await);
    assert_eq!(resumed.api_call_count().await, 1);
    assert_eq!(resumed.status().await, CheckpointStatus::InProgress);

    resumed.mark_completed().await.unwrap();
    let err = AnalysisCheckpointer::resume_from(store, resumed.session_id(), settings())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CheckpointError::NotResumable { .. }));
}

fn model() -> PosteriorModel {
    let hyp = |id: &str, stance| Hypothesis {
        id: id.to_string(),
        label: id.to_string(),
        stance,
    };
    PosteriorModel::new(
        vec![hyp("H0", Stance::Opposes), hyp("H1", Stance::Supports)],
        vec![Paradigm {
            id: "P1".to_string(),
            name: "Empiricist".to_string(),
            priors: BTreeMap::from([("H0".to_string(), 0.5), ("H1".to_string(), 0.5)]),
        }],
    )
    .unwrap()
}

/// Ids longer than the truncation limit that share a prefix.
fn cluster(id: &str) -> EvidenceCluster {
    EvidenceCluster {
        id: id.to_string(),
        description: "a description well past the limit".to_string(),
        likelihoods: BTreeMap::from([(
            "P1".to_string(),
            BTreeMap::from([("H0".to_string(), 1.0), ("H1".to_string(), 3.0)]),
        )]),
    }
}

#[tokio::test]
async fn test_small_limit_keeps_ids_and_tags() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let session = AnalysisCheckpointer::create(store.clone(), "s", "p", json!({}), settings())
        .await
        .unwrap();

    let c1 = cluster("query-long-identifier-1");
    session
        .save_parallel_progress(
            "evidence",
            "queries",
            &c1.id,
            serde_json::to_value(&c1).unwrap(),
        )
        .await
        .unwrap();
    session
        .save_phase(
            "evidence",
            PhaseData::new(PhasePayload::Evidence {
                clusters: vec![c1.clone(), cluster("query-long-identifier-2")],
            }),
        )
        .await
        .unwrap();

    let results = session.get_parallel_results("evidence", "queries").await;
    let saved = &results["query-long-identifier-1"];
    assert_eq!(saved["id"], "query-long-identifier-1");
    assert_eq!(saved["description"], "a descript");

    let stored = store
        .retrieve_checkpoint(session.session_id())
        .await
        .unwrap()
        .unwrap();
    let PhasePayload::Evidence { clusters } = &stored.completed_phases["evidence"].data.payload
    else {
        panic!("evidence payload expected");
    };
    assert_eq!(clusters[0].id, "query-long-identifier-1");
    assert_eq!(clusters[1].id, "query-long-identifier-2");
    assert_eq!(clusters[1].description, "a descript");

    // Both clusters fold even though their ids share a prefix past the limit.
    let outcomes = combine_checkpointed(
        &session,
        &model(),
        &[c1, cluster("query-long-identifier-2")],
        &VerdictConfig::default(),
    )
    .await
    .unwrap();
    // 0.5*9 / (0.5*1 + 0.5*9)
    assert!((outcomes[0].posterior["H1"] - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn test_resumed_aggregation_applies_each_cluster_once() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let model = model();
    let c1 = cluster("c1");
    let c2 = cluster("c2");

    let session = AnalysisCheckpointer::create(store.clone(), "s", "p", json!({}), settings())
        .await
        .unwrap();
    let mut state = AggregationState::new(&model);
    assert!(state.fold(&model, &c1).unwrap());
    session
        .save_phase(
            POSTERIOR_PROGRESS_PHASE,
            PhaseData::new(PhasePayload::PosteriorProgress { state }),
        )
        .await
        .unwrap();
    session
        .save_error("crashed mid-aggregation", "aggregation", ErrorKind::PhaseFailure)
        .await
        .unwrap();

    let (resumed, _) =
        AnalysisCheckpointer::resume_from(store.clone(), session.session_id(), settings())
            .await
            .unwrap();
    let outcomes = combine_checkpointed(
        &resumed,
        &model,
        &[c1.clone(), c2.clone()],
        &VerdictConfig::default(),
    )
    .await
    .unwrap();

    // c1 applied once: 0.9. Applied twice it would be 27/28.
    assert!((outcomes[0].posterior["H0"] - 0.1).abs() < 1e-9);
    assert!((outcomes[0].posterior["H1"] - 0.9).abs() < 1e-9);

    let stored = store
        .retrieve_checkpoint(resumed.session_id())
        .await
        .unwrap()
        .unwrap();
    let PhasePayload::PosteriorProgress { state } =
        &stored.completed_phases[POSTERIOR_PROGRESS_PHASE].data.payload
    else {
        panic!("posterior_progress payload expected");
    };
    assert_eq!(state.applied_clusters, vec!["c1", "c2"]);
    assert!(matches!(
        stored.completed_phases[POSTERIOR_PHASE].data.payload,
        PhasePayload::Posterior { .. }
    ));

    // Once finalized, the stored outcomes are returned and nothing is folded.
    let again = combine_checkpointed(
        &resumed,
        &model,
        &[c1, c2, cluster("c3")],
        &VerdictConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(again, outcomes);
    let stored = store
        .retrieve_checkpoint(resumed.session_id())
        .await
        .unwrap()
        .unwrap();
    let PhasePayload::PosteriorProgress { state } =
        &stored.completed_phases[POSTERIOR_PROGRESS_PHASE].data.payload
    else {
        panic!("posterior_progress payload expected");
    };
    assert_eq!(state.applied_clusters, vec!["c1", "c2"]);
}
