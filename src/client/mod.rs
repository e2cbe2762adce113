//! Per-provider client actors.
//!
//! One `ProviderClient` exists per enabled provider. All calls for a
//! provider are serialized through a single mutex held across the whole
//! call, so the token bucket and circuit breaker are read-modify-written
//! without further locking, and at most one request per provider is in
//! flight at any moment. Round tasks from concurrent runs queue on the
//! mutex.

pub mod breaker;
pub mod bucket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{CallError, CallResult, ErrorKind};
use crate::providers::{self, RequestParams, Transport};
use crate::types::{ProviderAnswer, ProviderKind};

use self::breaker::{CircuitBreaker, CircuitState};
use self::bucket::TokenBucket;

/// Base delay for exponential retry backoff.
const BASE_BACKOFF_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Immutable per-provider settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
    pub timeout: Duration,
    pub rate_limit_count: u32,
    pub rate_limit_interval: Duration,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub max_retries: u32,
    pub debug_mode: bool,
}

impl ProviderSettings {
    pub fn from_config(kind: ProviderKind, config: &AppConfig, api_key: String) -> Self {
        let provider = config.providers.get(kind);
        Self {
            kind,
            api_key,
            base_url: provider.base_url.clone(),
            default_model: provider.default_model.clone(),
            timeout: Duration::from_millis(
                provider
                    .timeout_ms
                    .unwrap_or(config.market.provider_timeout_ms),
            ),
            rate_limit_count: provider.rate_limit.count,
            rate_limit_interval: Duration::from_millis(provider.rate_limit.interval_ms),
            failure_threshold: config.circuit.failure_threshold,
            recovery_timeout: Duration::from_millis(config.circuit.recovery_timeout_ms),
            max_retries: config.market.max_retries,
            debug_mode: config.market.debug_mode,
        }
    }
}

// ---------------------------------------------------------------------------
// Call options / inspection
// ---------------------------------------------------------------------------

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub model: Option<String>,
    pub timeout: Option<Duration>,
}

/// Snapshot of the client's protective state, for health reporting.
#[derive(Debug, Clone)]
pub struct ClientProbe {
    pub provider: ProviderKind,
    pub circuit_state: CircuitState,
    pub available_tokens: f64,
    pub consecutive_failures: u32,
}

// ---------------------------------------------------------------------------
// Provider client
// ---------------------------------------------------------------------------

struct Guarded {
    bucket: TokenBucket,
    breaker: CircuitBreaker,
}

pub struct ProviderClient {
    settings: ProviderSettings,
    transport: Arc<dyn Transport>,
    guarded: Mutex<Guarded>,
}

impl ProviderClient {
    pub fn new(settings: ProviderSettings, transport: Arc<dyn Transport>) -> Self {
        let now = Instant::now();
        let guarded = Guarded {
            bucket: TokenBucket::new(
                settings.rate_limit_count,
                settings.rate_limit_interval,
                now,
            ),
            breaker: CircuitBreaker::new(
                settings.kind,
                settings.failure_threshold,
                settings.recovery_timeout,
            ),
        };
        Self {
            settings,
            transport,
            guarded: Mutex::new(guarded),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.settings.kind
    }

    pub fn default_model(&self) -> &str {
        &self.settings.default_model
    }

    /// The configured per-call timeout for this provider.
    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    /// Execute one call against this provider.
    ///
    /// Order of gates: circuit breaker, then token bucket, then the
    /// adapter with bounded retries. A local rate-limit rejection never
    /// counts against the breaker. Identity fields of the returned
    /// answer (run, round) are stamped by the coordinator.
    pub async fn call(&self, prompt: &str, opts: &CallOptions) -> CallResult<ProviderAnswer> {
        // Held for the duration of the call: this is the serialization
        // point for the whole actor.
        let mut guarded = self.guarded.lock().await;

        let now = Instant::now();
        if !guarded.breaker.allow(now) {
            debug!(provider = %self.settings.kind, "Circuit open, rejecting call");
            return Err(CallError::new(
                ErrorKind::CircuitOpen,
                format!("{} circuit is open", self.settings.kind),
            ));
        }

        if !guarded.bucket.acquire(now) {
            debug!(provider = %self.settings.kind, "Token bucket empty, rejecting call");
            return Err(CallError::new(
                ErrorKind::RateLimited,
                format!("{} local rate limit exceeded", self.settings.kind),
            ));
        }

        let model = opts
            .model
            .clone()
            .unwrap_or_else(|| self.settings.default_model.clone());
        let timeout = opts.timeout.unwrap_or(self.settings.timeout);

        let request = providers::build_request(
            self.settings.kind,
            &RequestParams {
                base_url: &self.settings.base_url,
                api_key: &self.settings.api_key,
                model: &model,
                prompt,
                temperature: providers::DEFAULT_TEMPERATURE,
                max_tokens: providers::DEFAULT_MAX_TOKENS,
            },
        );

        let started = Instant::now();
        let mut last_error: Option<CallError> = None;

        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                let delay = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt - 1));
                debug!(
                    provider = %self.settings.kind,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying provider call"
                );
                tokio::time::sleep(delay).await;

                // The bucket is not re-consulted on retries; only the
                // breaker gates the retry.
                if !guarded.breaker.allow(Instant::now()) {
                    return Err(CallError::new(
                        ErrorKind::CircuitOpen,
                        format!("{} circuit opened during retries", self.settings.kind),
                    ));
                }
            }

            let outcome = self.transport.execute(&request, timeout).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let error = match outcome {
                Ok(response) if (200..300).contains(&response.status) => {
                    let mut answer = providers::normalize(
                        self.settings.kind,
                        &model,
                        &response.body,
                        self.settings.debug_mode,
                    );
                    answer.latency_ms = latency_ms;
                    guarded.breaker.record_success();
                    info!(
                        provider = %self.settings.kind,
                        model = %answer.model,
                        status = %answer.status,
                        latency_ms,
                        tokens = answer.usage.total_tokens,
                        "Provider call complete"
                    );
                    return Ok(answer);
                }
                Ok(response) => {
                    providers::classify_status(response.status, &response.body)
                        .with_latency(latency_ms)
                }
                Err(e) => e.with_latency(latency_ms),
            };

            if error.is_retryable() && attempt < self.settings.max_retries {
                warn!(
                    provider = %self.settings.kind,
                    attempt,
                    error = %error,
                    "Retryable provider error"
                );
                last_error = Some(error);
                continue;
            }

            warn!(
                provider = %self.settings.kind,
                attempt,
                error = %error,
                "Provider call failed"
            );
            guarded.breaker.record_failure(Instant::now());
            return Err(error);
        }

        // Retries exhausted on a retryable error.
        guarded.breaker.record_failure(Instant::now());
        Err(last_error.unwrap_or_else(|| {
            CallError::new(ErrorKind::NetworkError, "retries exhausted with no error recorded")
        }))
    }

    /// Snapshot circuit and bucket state for health reporting.
    pub async fn inspect(&self) -> ClientProbe {
        let mut guarded = self.guarded.lock().await;
        let now = Instant::now();
        ClientProbe {
            provider: self.settings.kind,
            circuit_state: guarded.breaker.state(),
            available_tokens: guarded.bucket.available(now),
            consecutive_failures: guarded.breaker.consecutive_failures(),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider pool
// ---------------------------------------------------------------------------

/// The set of started provider clients, keyed by tag.
pub struct ProviderPool {
    clients: HashMap<ProviderKind, Arc<ProviderClient>>,
}

impl ProviderPool {
    /// Start a client for every provider that is enabled and has a
    /// credential. Providers without credentials are skipped with a
    /// warning.
    pub fn from_config(config: &AppConfig, transport: Arc<dyn Transport>) -> Self {
        let mut clients = HashMap::new();

        for kind in ProviderKind::ALL {
            let provider = config.providers.get(kind);
            if !provider.enabled {
                info!(provider = %kind, "Provider disabled in config");
                continue;
            }
            let Some(api_key) = config.api_key(kind) else {
                warn!(
                    provider = %kind,
                    env = %provider.api_key_env,
                    "No API credential, provider not started"
                );
                continue;
            };

            let settings = ProviderSettings::from_config(kind, config, api_key);
            clients.insert(kind, Arc::new(ProviderClient::new(settings, transport.clone())));
        }

        Self { clients }
    }

    /// Build a pool from pre-constructed clients (used by tests and
    /// embedders).
    pub fn from_clients(list: Vec<Arc<ProviderClient>>) -> Self {
        let clients = list.into_iter().map(|c| (c.kind(), c)).collect();
        Self { clients }
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<ProviderClient>> {
        self.clients.get(&kind).cloned()
    }

    /// Client for a tag, or a structured `provider_not_started` error.
    pub fn require(&self, kind: ProviderKind) -> CallResult<Arc<ProviderClient>> {
        self.get(kind).ok_or_else(|| {
            CallError::new(
                ErrorKind::ProviderNotStarted,
                format!("{kind} is not started"),
            )
        })
    }

    /// Enabled providers in stable declaration order.
    pub fn enabled(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|k| self.clients.contains_key(k))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Probe every started client, for health reporting.
    pub async fn inspect_all(&self) -> Vec<ClientProbe> {
        let mut probes = Vec::with_capacity(self.clients.len());
        for kind in self.enabled() {
            if let Some(client) = self.get(kind) {
                probes.push(client.inspect().await);
            }
        }
        probes
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
