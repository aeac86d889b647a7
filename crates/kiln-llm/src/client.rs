//! Core client: provider routing, middleware, timeout and retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, instrument, warn};

use crate::errors::ModelError;
use crate::provider::ProviderAdapter;
use crate::retry::{RetryPolicy, delay_for_attempt_ms};
use crate::types::{ModelRequest, ModelResponse};

pub type CompleteHandler =
    Arc<dyn Fn(ModelRequest) -> BoxFuture<'static, Result<ModelResponse, ModelError>> + Send + Sync>;

/// Wraps every provider attempt. Middleware runs inside the retry loop, so a
/// retried request passes through the chain once per attempt.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle_complete(
        &self,
        request: ModelRequest,
        next: CompleteHandler,
    ) -> Result<ModelResponse, ModelError>;
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct Client {
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    default_provider: Option<String>,
    middleware: Vec<Arc<dyn Middleware>>,
    retry: RetryPolicy,
    request_timeout: Duration,
    jitter_seed: Arc<AtomicU64>,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: None,
            middleware: Vec::new(),
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            jitter_seed: Arc::new(AtomicU64::new(seed_from_clock())),
        }
    }
}

impl Client {
    pub fn new(retry: RetryPolicy, request_timeout: Duration) -> Self {
        Self {
            retry,
            request_timeout,
            ..Self::default()
        }
    }

    pub fn register_provider(&mut self, provider: Arc<dyn ProviderAdapter>) {
        let name = provider.name().to_string();
        if self.default_provider.is_none() {
            self.default_provider = Some(name.clone());
        }
        self.providers.insert(name, provider);
    }

    pub fn set_default_provider(&mut self, provider: impl Into<String>) {
        self.default_provider = Some(provider.into());
    }

    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Sends `request` to its provider and returns the raw response.
    ///
    /// Each attempt is bounded by the request timeout. Retryable failures
    /// back off exponentially until the attempt cap is reached, at which
    /// point the last failure is reported as [`ModelError::Unavailable`].
    #[instrument(skip_all, fields(model = %request.model, messages = request.messages.len()))]
    pub async fn query(&self, mut request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let provider_name = self.resolve_provider(&request)?;
        request.provider = Some(provider_name.clone());
        let handler = self.handler_for(&provider_name)?;

        let attempts = self.retry.attempts();
        let timeout_ms = self.request_timeout.as_millis() as u64;
        let mut last_error = None;

        for attempt in 1..=attempts {
            debug!(attempt, provider = %provider_name, "querying model");
            let outcome = match tokio::time::timeout(self.request_timeout, handler(request.clone())).await {
                Ok(result) => result,
                Err(_) => Err(ModelError::Timeout { timeout_ms }),
            };

            match outcome {
                Ok(response) => return Ok(response),
                Err(error) if error.is_retryable() => {
                    if attempt < attempts {
                        let seed = self.jitter_seed.fetch_add(1, Ordering::Relaxed);
                        let computed = delay_for_attempt_ms(attempt, &self.retry, seed);
                        // A server hint may lengthen the wait but never past the cap.
                        let delay = error
                            .retry_after_ms()
                            .map_or(computed, |hint| hint.max(computed))
                            .min(self.retry.max_delay_ms);
                        warn!(attempt, delay_ms = delay, error = %error, "retrying model request");
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    } else {
                        warn!(attempt, error = %error, "model retry budget exhausted");
                    }
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(ModelError::Unavailable {
            attempts,
            last_error: last_error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "no attempt was made".to_string()),
        })
    }

    fn handler_for(&self, provider_name: &str) -> Result<CompleteHandler, ModelError> {
        let adapter = self
            .providers
            .get(provider_name)
            .ok_or_else(|| {
                ModelError::Configuration(format!("provider '{provider_name}' is not registered"))
            })?
            .clone();

        let base: CompleteHandler = Arc::new(move |req| {
            let adapter = adapter.clone();
            Box::pin(async move { adapter.complete(&req).await })
        });

        Ok(self
            .middleware
            .iter()
            .rev()
            .fold(base, |next, middleware| {
                let middleware = middleware.clone();
                Arc::new(move |req| {
                    let middleware = middleware.clone();
                    let next = next.clone();
                    Box::pin(async move { middleware.handle_complete(req, next).await })
                })
            }))
    }

    fn resolve_provider(&self, request: &ModelRequest) -> Result<String, ModelError> {
        if let Some(provider) = &request.provider {
            return Ok(provider.clone());
        }
        if let Some(provider) = &self.default_provider {
            return Ok(provider.clone());
        }
        Err(ModelError::Configuration("no provider configured".to_string()))
    }
}

fn seed_from_clock() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}
