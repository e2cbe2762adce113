//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys) are referenced by env-var name in the config and
//! resolved once at startup via `std::env::var`. The resulting
//! configuration is immutable for the life of the process.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use crate::types::{ArbiterSpec, ProviderKind};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub arbiter: ArbiterConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MarketConfig {
    /// Upper bound on revision rounds.
    pub max_rounds: u32,
    /// Per-call deadline in milliseconds.
    pub provider_timeout_ms: u64,
    /// Retry budget per provider call.
    pub max_retries: u32,
    /// Parallel fan-out cap per round.
    pub max_concurrency: usize,
    pub convergence_confidence_threshold: f64,
    pub convergence_claim_overlap: f64,
    /// Also persist raw provider response text.
    pub debug_mode: bool,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            max_rounds: 2,
            provider_timeout_ms: 25_000,
            max_retries: 2,
            max_concurrency: 4,
            convergence_confidence_threshold: 0.1,
            convergence_claim_overlap: 0.7,
            debug_mode: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openai: ProviderConfig,
    pub anthropic: ProviderConfig,
    pub gemini: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai: ProviderConfig::defaults_for(ProviderKind::OpenAi),
            anthropic: ProviderConfig::defaults_for(ProviderKind::Anthropic),
            gemini: ProviderConfig::defaults_for(ProviderKind::Gemini),
        }
    }
}

impl ProvidersConfig {
    pub fn get(&self, kind: ProviderKind) -> &ProviderConfig {
        match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::Gemini => &self.gemini,
        }
    }
}

/// Static configuration for one provider.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ordered list of usable model strings; first is not necessarily
    /// the default.
    #[serde(default)]
    pub models: Vec<String>,
    pub default_model: String,
    pub base_url: String,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Per-provider deadline override; falls back to the market-level
    /// `provider_timeout_ms`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Name of the env var holding the API credential.
    pub api_key_env: String,
}

impl ProviderConfig {
    fn defaults_for(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::OpenAi => Self {
                enabled: true,
                models: vec!["gpt-4o".into(), "gpt-4o-mini".into()],
                default_model: "gpt-4o".into(),
                base_url: "https://api.openai.com".into(),
                rate_limit: RateLimitConfig {
                    count: 10,
                    interval_ms: 1_000,
                },
                timeout_ms: Some(25_000),
                api_key_env: "OPENAI_API_KEY".into(),
            },
            ProviderKind::Anthropic => Self {
                enabled: true,
                models: vec!["claude-sonnet-4-20250514".into()],
                default_model: "claude-sonnet-4-20250514".into(),
                base_url: "https://api.anthropic.com".into(),
                rate_limit: RateLimitConfig {
                    count: 5,
                    interval_ms: 1_000,
                },
                timeout_ms: Some(30_000),
                api_key_env: "ANTHROPIC_API_KEY".into(),
            },
            ProviderKind::Gemini => Self {
                enabled: true,
                models: vec!["gemini-2.0-flash".into()],
                default_model: "gemini-2.0-flash".into(),
                base_url: "https://generativelanguage.googleapis.com".into(),
                rate_limit: RateLimitConfig {
                    count: 10,
                    interval_ms: 1_000,
                },
                timeout_ms: Some(25_000),
                api_key_env: "GEMINI_API_KEY".into(),
            },
        }
    }
}

/// Token bucket budget: `count` calls per `interval_ms`.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct RateLimitConfig {
    pub count: u32,
    pub interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            count: 10,
            interval_ms: 1_000,
        }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// How long an open breaker waits before admitting a probe.
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Arbiter
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Primary arbiter used when the thread has no override.
    pub default: ArbiterSpec,
    /// Second-chance arbiter after the primary fails twice.
    pub fallback: ArbiterSpec,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            default: ArbiterSpec {
                provider: ProviderKind::OpenAi,
                model: "gpt-4o".into(),
            },
            fallback: ArbiterSpec {
                provider: ProviderKind::OpenAi,
                model: "gpt-4o".into(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/quorum.db".into(),
            max_connections: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Resolve the API credential for one provider, if present.
    pub fn api_key(&self, kind: ProviderKind) -> Option<String> {
        let cfg = self.providers.get(kind);
        std::env::var(&cfg.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}
