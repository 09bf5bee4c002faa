//! Config environment variable tests
//!
//! `Config::from_env()` also loads a `.env` file via dotenvy, so these tests
//! set every variable they assert on. They run under `#[serial]` because the
//! process environment is shared.

use resumable_analysis::config::{Config, LogFormat};
use serial_test::serial;
use std::env;

fn with_api_key() {
    env::set_var("REASONING_API_KEY", "test-key");
}

#[test]
#[serial]
fn test_config_from_env_loads_successfully() {
    with_api_key();
    let config = Config::from_env().unwrap();
    assert_eq!(config.reasoning.api_key, "test-key");
}

#[test]
#[serial]
fn test_config_from_env_custom_base_url() {
    with_api_key();
    env::set_var("REASONING_BASE_URL", "https://custom.api.com");

    let config = Config::from_env().unwrap();
    assert_eq!(config.reasoning.base_url, "https://custom.api.com");

    env::remove_var("REASONING_BASE_URL");
}

#[test]
#[serial]
fn test_config_from_env_custom_database() {
    with_api_key();
    env::set_var("DATABASE_PATH", "/custom/path.db");
    env::set_var("DATABASE_MAX_CONNECTIONS", "10");

    let config = Config::from_env().unwrap();
    assert_eq!(config.database.path.to_str().unwrap(), "/custom/path.db");
    assert_eq!(config.database.max_connections, 10);

    env::remove_var("DATABASE_PATH");
    env::remove_var("DATABASE_MAX_CONNECTIONS");
}

#[test]
#[serial]
fn test_config_from_env_json_log_format() {
    with_api_key();
    env::set_var("LOG_FORMAT", "json");

    let config = Config::from_env().unwrap();
    assert_eq!(config.logging.format, LogFormat::Json);

    env::set_var("LOG_FORMAT", "anything-else");
    let config = Config::from_env().unwrap();
    assert_eq!(config.logging.format, LogFormat::Pretty);

    env::remove_var("LOG_FORMAT");
}

#[test]
#[serial]
fn test_config_from_env_pipes_and_parallelism() {
    with_api_key();
    env::set_var("PIPE_EVIDENCE", "custom-evidence");
    env::set_var("MAX_PARALLEL_CALLS", "8");

    let config = Config::from_env().unwrap();
    assert_eq!(config.pipes.evidence, "custom-evidence");
    assert_eq!(config.pipes.framing, "analysis-framing-v1");
    assert_eq!(config.request.max_parallel_calls, 8);

    env::set_var("MAX_PARALLEL_CALLS", "0");
    let config = Config::from_env().unwrap();
    assert_eq!(config.request.max_parallel_calls, 4);

    env::remove_var("PIPE_EVIDENCE");
    env::remove_var("MAX_PARALLEL_CALLS");
}

#[test]
#[serial]
fn test_config_from_env_budget() {
    with_api_key();
    env::remove_var("COST_BUDGET_USD");
    let config = Config::from_env().unwrap();
    assert_eq!(config.budget.max_cost_usd, None);

    env::set_var("COST_BUDGET_USD", "2.5");
    let config = Config::from_env().unwrap();
    assert_eq!(config.budget.max_cost_usd, Some(2.5));

    env::set_var("COST_BUDGET_USD", "not-a-number");
    let config = Config::from_env().unwrap();
    assert_eq!(config.budget.max_cost_usd, None);

    env::remove_var("COST_BUDGET_USD");
}

#[test]
#[serial]
fn test_config_from_env_invalid_numbers_fall_back() {
    with_api_key();
    env::set_var("REQUEST_TIMEOUT_MS", "soon");
    env::set_var("CHECKPOINT_MAX_FIELD_CHARS", "-3");

    let config = Config::from_env().unwrap();
    assert_eq!(config.request.timeout_ms, 120_000);
    assert_eq!(config.checkpoint.max_field_chars, 10_000);

    env::remove_var("REQUEST_TIMEOUT_MS");
    env::remove_var("CHECKPOINT_MAX_FIELD_CHARS");
}

#[test]
#[serial]
fn test_config_from_env_rejects_inverted_thresholds() {
    with_api_key();
    env::set_var("VERDICT_DECISIVE_THRESHOLD", "0.4");
    env::set_var("VERDICT_PARTIAL_THRESHOLD", "0.6");

    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("verdict thresholds"));

    env::remove_var("VERDICT_DECISIVE_THRESHOLD");
    env::remove_var("VERDICT_PARTIAL_THRESHOLD");
}
