use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub reasoning: ReasoningConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub pipes: PipeConfig,
    pub checkpoint: CheckpointConfig,
    pub budget: BudgetConfig,
    pub pricing: PricingConfig,
    pub verdict: VerdictConfig,
}

/// Reasoning service configuration
#[derive(Debug, Clone)]
pub struct ReasoningConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration.
///
/// Calls into the reasoning service are single-attempt; retrying is left to
/// whoever drives the pipeline.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_parallel_calls: usize,
}

/// Pipe names used by each analysis phase
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub framing: String,
    pub evidence: String,
    pub synthesis: String,
}

/// Phase snapshot limits
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Maximum characters kept for any text field of a saved phase.
    pub max_field_chars: usize,
}

/// Per-session cost ceiling
#[derive(Debug, Clone, Default)]
pub struct BudgetConfig {
    pub max_cost_usd: Option<f64>,
}

/// Token pricing in USD per million tokens
#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub reasoning_per_mtok: f64,
}

/// Posterior thresholds for verdict bucketing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerdictConfig {
    pub decisive_threshold: f64,
    pub partial_threshold: f64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let reasoning = ReasoningConfig {
            api_key: env::var("REASONING_API_KEY").map_err(|_| AppError::Config {
                message: "REASONING_API_KEY is required".to_string(),
            })?,
            base_url: env::var("REASONING_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/analysis.db".to_string()),
            ),
            max_connections: parse_env("DATABASE_MAX_CONNECTIONS").unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request_defaults = RequestConfig::default();
        let request = RequestConfig {
            timeout_ms: parse_env("REQUEST_TIMEOUT_MS").unwrap_or(request_defaults.timeout_ms),
            max_parallel_calls: parse_env::<usize>("MAX_PARALLEL_CALLS")
                .filter(|n| *n > 0)
                .unwrap_or(request_defaults.max_parallel_calls),
        };

        let pipe_defaults = PipeConfig::default();
        let pipes = PipeConfig {
            framing: env::var("PIPE_FRAMING").unwrap_or(pipe_defaults.framing),
            evidence: env::var("PIPE_EVIDENCE").unwrap_or(pipe_defaults.evidence),
            synthesis: env::var("PIPE_SYNTHESIS").unwrap_or(pipe_defaults.synthesis),
        };

        let checkpoint = CheckpointConfig {
            max_field_chars: parse_env::<usize>("CHECKPOINT_MAX_FIELD_CHARS")
                .filter(|n| *n > 0)
                .unwrap_or(CheckpointConfig::default().max_field_chars),
        };

        let budget = BudgetConfig {
            max_cost_usd: parse_env::<f64>("COST_BUDGET_USD").filter(|v| *v > 0.0),
        };

        let pricing_defaults = PricingConfig::default();
        let pricing = PricingConfig {
            input_per_mtok: parse_env("PRICE_INPUT_PER_MTOK")
                .unwrap_or(pricing_defaults.input_per_mtok),
            output_per_mtok: parse_env("PRICE_OUTPUT_PER_MTOK")
                .unwrap_or(pricing_defaults.output_per_mtok),
            reasoning_per_mtok: parse_env("PRICE_REASONING_PER_MTOK")
                .unwrap_or(pricing_defaults.reasoning_per_mtok),
        };

        let verdict_defaults = VerdictConfig::default();
        let verdict = VerdictConfig {
            decisive_threshold: parse_env("VERDICT_DECISIVE_THRESHOLD")
                .unwrap_or(verdict_defaults.decisive_threshold),
            partial_threshold: parse_env("VERDICT_PARTIAL_THRESHOLD")
                .unwrap_or(verdict_defaults.partial_threshold),
        };
        verdict.validate()?;

        Ok(Config {
            reasoning,
            database,
            logging,
            request,
            pipes,
            checkpoint,
            budget,
            pricing,
            verdict,
        })
    }
}

/// Parse an env var, treating missing or malformed values as absent.
fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            max_parallel_calls: 4,
        }
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            framing: "analysis-framing-v1".to_string(),
            evidence: "evidence-elicitation-v1".to_string(),
            synthesis: "analysis-synthesis-v1".to_string(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_field_chars: 10_000,
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
            reasoning_per_mtok: 15.0,
        }
    }
}

impl PricingConfig {
    /// Cost in USD of one call with the given token counts.
    pub fn cost_usd(&self, input_tokens: u64, output_tokens: u64, reasoning_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_mtok
            + output_tokens as f64 * self.output_per_mtok
            + reasoning_tokens as f64 * self.reasoning_per_mtok)
            / 1_000_000.0
    }
}

impl Default for VerdictConfig {
    fn default() -> Self {
        Self {
            decisive_threshold: 0.70,
            partial_threshold: 0.50,
        }
    }
}

impl VerdictConfig {
    /// Thresholds must satisfy `0 < partial < decisive <= 1`.
    pub fn validate(&self) -> Result<(), AppError> {
        let ok = self.partial_threshold > 0.0
            && self.partial_threshold < self.decisive_threshold
            && self.decisive_threshold <= 1.0;
        if ok {
            Ok(())
        } else {
            Err(AppError::Config {
                message: format!(
                    "verdict thresholds must satisfy 0 < partial ({}) < decisive ({}) <= 1",
                    self.partial_threshold, self.decisive_threshold
                ),
            })
        }
    }
}
