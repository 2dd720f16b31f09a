//! Generation Gateway
//!
//! Every model call in a run goes through here. A call is answered from the
//! response cache when possible; otherwise its estimated cost is reserved
//! against the caller's budget, the client is invoked with retries and
//! model fallback, and the actual charge is settled before returning.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::cache::{CachedResponse, ResponseCache};
use super::client::GenerationClient;
use super::durable::SqliteCacheStore;
use super::rate_limit::SharedRateLimiter;
use super::request::{GatewayResponse, Generation, GenerationRequest};
use crate::config::GatewayConfig;
use crate::error::{ClientError, ErrorClass, GatewayError};
use crate::ledger::{BudgetMeter, CostRecord, Money, PriceTable};
use crate::utils::CancelToken;

/// Outcome of trying one model.
enum ModelFailure {
    /// The model cannot serve this request; the next fallback may.
    Capability(ClientError),
    Fatal(GatewayError),
}

pub struct GenerationGateway {
    client: Arc<dyn GenerationClient>,
    cache: Option<Arc<ResponseCache>>,
    limiter: Option<SharedRateLimiter>,
    pricing: PriceTable,
    backoff: BackoffPolicy,
    max_attempts: u32,
    call_timeout: Duration,
    fallback_chains: BTreeMap<String, Vec<String>>,
    external_calls: AtomicU64,
}

impl GenerationGateway {
    pub fn new(client: Arc<dyn GenerationClient>) -> Self {
        let defaults = GatewayConfig::default();
        Self {
            client,
            cache: None,
            limiter: None,
            pricing: PriceTable::default(),
            backoff: BackoffPolicy::from_config(&defaults),
            max_attempts: defaults.max_attempts,
            call_timeout: defaults.call_timeout(),
            fallback_chains: BTreeMap::new(),
            external_calls: AtomicU64::new(0),
        }
    }

    /// Builds the gateway described by `config`, opening the durable cache
    /// tier when a path is configured.
    pub async fn from_config(
        client: Arc<dyn GenerationClient>,
        config: &GatewayConfig,
        pricing: PriceTable,
    ) -> anyhow::Result<Self> {
        let mut gateway = Self::new(client)
            .with_pricing(pricing)
            .with_backoff(BackoffPolicy::from_config(config))
            .with_max_attempts(config.max_attempts)
            .with_call_timeout(config.call_timeout());

        for (model, chain) in &config.fallback_chains {
            gateway = gateway.with_fallbacks(model.clone(), chain.clone());
        }

        if config.cache_enabled {
            let mut cache = ResponseCache::new(config.cache_capacity, config.cache_ttl());
            if let Some(path) = &config.cache_path {
                let store = SqliteCacheStore::open(path).await?;
                info!("Response cache persisted at {}", path.display());
                cache = cache.with_durable(Arc::new(store));
            }
            gateway = gateway.with_cache(Arc::new(cache));
        }

        if let Some(rpm) = config.requests_per_minute {
            if let Some(limiter) = SharedRateLimiter::per_minute(rpm) {
                gateway = gateway.with_rate_limiter(limiter);
            }
        }

        Ok(gateway)
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: SharedRateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_pricing(mut self, pricing: PriceTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_fallbacks(mut self, model: impl Into<String>, chain: Vec<String>) -> Self {
        self.fallback_chains.insert(model.into(), chain);
        self
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub fn pricing(&self) -> &PriceTable {
        &self.pricing
    }

    /// Calls actually sent to the client, including retries.
    pub fn external_calls(&self) -> u64 {
        self.external_calls.load(Ordering::Relaxed)
    }

    /// The requested model followed by its configured substitutes.
    pub fn model_chain(&self, model: &str) -> Vec<String> {
        let mut chain = vec![model.to_string()];
        if let Some(fallbacks) = self.fallback_chains.get(model) {
            chain.extend(fallbacks.iter().filter(|m| m.as_str() != model).cloned());
        }
        chain
    }

    /// Pre-call estimate used for budget reservations.
    pub fn estimate(&self, request: &GenerationRequest) -> Money {
        self.pricing
            .estimate(&request.model, &request.prompt_text(), request.sampling.max_tokens)
    }

    #[tracing::instrument(
        skip_all,
        fields(model = %request.model, phase = %request.phase, turn = request.turn, actor = ?request.actor_id)
    )]
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        meter: &BudgetMeter,
        cancel: &CancelToken,
    ) -> Result<GatewayResponse, GatewayError> {
        let fingerprint = request.fingerprint();

        if let Some(cache) = &self.cache {
            if let Some(entry) = cache.get(&fingerprint).await {
                debug!(model = %request.model, phase = %request.phase, "Cache hit for {}", fingerprint);
                let cost = self.cost_record(request, &entry.response.model, &entry.response, Money::ZERO, true);
                return Ok(GatewayResponse {
                    text: entry.response.text,
                    model: entry.response.model,
                    tokens_in: entry.response.tokens_in,
                    tokens_out: entry.response.tokens_out,
                    cached: true,
                    attempts: 0,
                    cost,
                });
            }
        }

        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let reservation = meter.reserve(self.estimate(request))?;

        let (model, generation, attempts) = match self.call_with_fallbacks(request, cancel).await {
            Ok(served) => served,
            Err(e) => {
                meter.release(reservation);
                return Err(e);
            }
        };

        let amount = generation
            .reported_cost
            .unwrap_or_else(|| self.pricing.cost(&model, generation.tokens_in, generation.tokens_out));
        let response = CachedResponse {
            text: generation.text,
            model,
            tokens_in: generation.tokens_in,
            tokens_out: generation.tokens_out,
        };
        let cost = self.cost_record(request, &response.model, &response, amount, false);

        if let Some(cache) = &self.cache {
            cache.put(fingerprint, response.clone(), None).await;
        }

        if let Err(source) = meter.settle(reservation, amount) {
            return Err(GatewayError::BudgetCrossed {
                record: Box::new(cost),
                source,
            });
        }

        Ok(GatewayResponse {
            text: response.text,
            model: response.model,
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            cached: false,
            attempts,
            cost,
        })
    }

    fn cost_record(
        &self,
        request: &GenerationRequest,
        model: &str,
        response: &CachedResponse,
        amount: Money,
        cached: bool,
    ) -> CostRecord {
        CostRecord {
            timestamp: Utc::now(),
            turn: request.turn,
            actor_id: request.actor_id.clone(),
            phase: request.phase,
            model: model.to_string(),
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            amount,
            cached,
        }
    }

    async fn call_with_fallbacks(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<(String, Generation, u32), GatewayError> {
        let chain = self.model_chain(&request.model);
        let mut tried = Vec::with_capacity(chain.len());
        let mut attempts = 0;
        let mut last_error = None;

        for model in chain {
            tried.push(model.clone());
            match self.call_with_retries(&model, request, cancel, &mut attempts).await {
                Ok(generation) => {
                    if model != request.model {
                        info!("Request for '{}' served by fallback '{}'", request.model, model);
                    }
                    return Ok((model, generation, attempts));
                }
                Err(ModelFailure::Capability(e)) => {
                    warn!("Model '{}' cannot serve request: {}", model, e);
                    last_error = Some(e);
                }
                Err(ModelFailure::Fatal(e)) => return Err(e),
            }
        }

        Err(GatewayError::FallbacksExhausted {
            tried,
            source: last_error.unwrap_or_else(|| ClientError::ModelUnavailable {
                model: request.model.clone(),
                reason: "empty fallback chain".to_string(),
            }),
        })
    }

    async fn call_with_retries(
        &self,
        model: &str,
        request: &GenerationRequest,
        cancel: &CancelToken,
        attempts: &mut u32,
    ) -> Result<Generation, ModelFailure> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            *attempts += 1;

            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    _ = limiter.acquire() => {}
                    _ = cancel.cancelled() => return Err(ModelFailure::Fatal(GatewayError::Cancelled)),
                }
            }

            self.external_calls.fetch_add(1, Ordering::Relaxed);
            let outcome = tokio::time::timeout(
                self.call_timeout,
                self.client.generate(model, &request.messages, &request.sampling),
            )
            .await
            .unwrap_or(Err(ClientError::Timeout(self.call_timeout)));

            let error = match outcome {
                Ok(generation) => return Ok(generation),
                Err(e) => e,
            };

            match error.class() {
                ErrorClass::Transient => {
                    if attempt >= self.max_attempts {
                        return Err(ModelFailure::Fatal(GatewayError::RetriesExhausted {
                            model: model.to_string(),
                            attempts: attempt,
                            source: error,
                        }));
                    }
                    let delay = self.backoff.delay_for(attempt, error.retry_after());
                    debug!(
                        "Transient failure from '{}' (attempt {}/{}): {}; retrying in {:?}",
                        model, attempt, self.max_attempts, error, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(ModelFailure::Fatal(GatewayError::Cancelled)),
                    }
                }
                ErrorClass::Capability => return Err(ModelFailure::Capability(error)),
                ErrorClass::Budget => return Err(ModelFailure::Fatal(GatewayError::ProviderQuota(error))),
                _ => return Err(ModelFailure::Fatal(GatewayError::Rejected(error))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Message, SamplingParams};
    use crate::ledger::{BudgetScope, ModelPrice};
    use crate::state::PhaseKind;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted outcomes per model; succeeds once a script runs dry.
    #[derive(Default)]
    struct ScriptedClient {
        scripts: Mutex<BTreeMap<String, VecDeque<ClientError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn failing(model: &str, errors: Vec<ClientError>) -> Self {
            let client = Self::default();
            client.scripts.lock().unwrap().insert(model.to_string(), errors.into());
            client
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GenerationClient for ScriptedClient {
        async fn generate(
            &self,
            model: &str,
            _messages: &[Message],
            sampling: &SamplingParams,
        ) -> Result<Generation, ClientError> {
            self.calls.lock().unwrap().push(model.to_string());
            let next = self.scripts.lock().unwrap().get_mut(model).and_then(|q| q.pop_front());
            match next {
                Some(e) => Err(e),
                None => Ok(Generation::new(format!("from {}", model), 10, sampling.max_tokens)),
            }
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("primary", vec![Message::user("What now?")], PhaseKind::Decision, 1)
            .with_sampling(SamplingParams {
                max_tokens: 1000,
                ..Default::default()
            })
            .for_actor("alice")
    }

    fn pricing() -> PriceTable {
        // 1000 output tokens cost exactly $0.10.
        PriceTable::new().with_default(ModelPrice::new(0.0, 100.0))
    }

    fn gateway(client: Arc<ScriptedClient>) -> GenerationGateway {
        GenerationGateway::new(client)
            .with_pricing(pricing())
            .with_backoff(BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(2)))
            .with_max_attempts(3)
            .with_cache(Arc::new(ResponseCache::new(16, Duration::from_secs(3600))))
    }

    #[tokio::test]
    async fn test_success_records_cost() {
        let client = Arc::new(ScriptedClient::default());
        let gw = gateway(client.clone());
        let meter = BudgetMeter::unlimited(BudgetScope::Run);

        let res = gw.generate(&request(), &meter, &CancelToken::new()).await.unwrap();
        assert_eq!(res.text, "from primary");
        assert_eq!(res.cost.amount, Money::from_dollars(0.10));
        assert_eq!(res.cost.actor_id.as_deref(), Some("alice"));
        assert_eq!(meter.spent(), Money::from_dollars(0.10));
        assert_eq!(gw.external_calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_short_circuits() {
        let client = Arc::new(ScriptedClient::default());
        let gw = gateway(client.clone());
        let meter = BudgetMeter::unlimited(BudgetScope::Run);
        let cancel = CancelToken::new();

        gw.generate(&request(), &meter, &cancel).await.unwrap();
        let again = gw.generate(&request(), &meter, &cancel).await.unwrap();

        assert!(again.cached);
        assert_eq!(again.cost.amount, Money::ZERO);
        assert!(again.cost.cached);
        assert_eq!(client.calls().len(), 1);
        assert_eq!(meter.spent(), Money::from_dollars(0.10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let client = Arc::new(ScriptedClient::failing(
            "primary",
            vec![
                ClientError::Http {
                    status: 503,
                    message: "busy".into(),
                    retry_after: None,
                },
                ClientError::Connection("reset".into()),
            ],
        ));
        let gw = gateway(client.clone());
        let meter = BudgetMeter::unlimited(BudgetScope::Run);

        let started = tokio::time::Instant::now();
        let res = gw.generate(&request(), &meter, &CancelToken::new()).await.unwrap();
        assert_eq!(res.attempts, 3);
        assert_eq!(client.calls().len(), 3);
        // 100ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_takes_precedence() {
        let client = Arc::new(ScriptedClient::failing(
            "primary",
            vec![ClientError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            }],
        ));
        let gw = gateway(client);
        let meter = BudgetMeter::unlimited(BudgetScope::Run);

        let started = tokio::time::Instant::now();
        gw.generate(&request(), &meter, &CancelToken::new()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_releases_reservation() {
        let client = Arc::new(ScriptedClient::failing(
            "primary",
            vec![ClientError::Connection("down".into()); 5],
        ));
        let gw = gateway(client.clone());
        let meter = BudgetMeter::new(BudgetScope::Run, Some(Money::from_dollars(0.15)));

        let err = gw.generate(&request(), &meter, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(client.calls().len(), 3);
        assert_eq!(meter.spent(), Money::ZERO);
        // The reservation was returned, so another call still fits.
        assert!(meter.reserve(Money::from_dollars(0.10)).is_ok());
    }

    #[tokio::test]
    async fn test_capability_error_falls_back() {
        let client = Arc::new(ScriptedClient::failing(
            "primary",
            vec![ClientError::ModelUnavailable {
                model: "primary".into(),
                reason: "retired".into(),
            }],
        ));
        let gw = gateway(client.clone()).with_fallbacks("primary", vec!["backup".into()]);
        let meter = BudgetMeter::unlimited(BudgetScope::Run);

        let res = gw.generate(&request(), &meter, &CancelToken::new()).await.unwrap();
        assert_eq!(res.model, "backup");
        assert_eq!(res.cost.model, "backup");
        assert_eq!(client.calls(), vec!["primary".to_string(), "backup".to_string()]);
    }

    #[tokio::test]
    async fn test_fallbacks_exhausted() {
        let forbidden = ClientError::Http {
            status: 403,
            message: "no access".into(),
            retry_after: None,
        };
        let client = Arc::new(ScriptedClient::default());
        client.scripts.lock().unwrap().insert("primary".into(), vec![forbidden.clone()].into());
        client.scripts.lock().unwrap().insert("backup".into(), vec![forbidden].into());
        let gw = gateway(client).with_fallbacks("primary", vec!["backup".into()]);

        let err = gw
            .generate(&request(), &BudgetMeter::unlimited(BudgetScope::Run), &CancelToken::new())
            .await
            .unwrap_err();
        match err {
            GatewayError::FallbacksExhausted { tried, .. } => assert_eq!(tried, vec!["primary", "backup"]),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_auth_errors_never_retry_or_fall_back() {
        let client = Arc::new(ScriptedClient::failing(
            "primary",
            vec![ClientError::Authentication("bad key".into())],
        ));
        let gw = gateway(client.clone()).with_fallbacks("primary", vec!["backup".into()]);

        let err = gw
            .generate(&request(), &BudgetMeter::unlimited(BudgetScope::Run), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_budget_refusal_makes_no_call() {
        let client = Arc::new(ScriptedClient::default());
        let gw = gateway(client.clone());
        let meter = BudgetMeter::new(BudgetScope::Run, Some(Money::from_dollars(0.05)));

        let err = gw.generate(&request(), &meter, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Budget(_)));
        assert!(err.is_halt());
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_actual_charge_crossing_limit_is_reported_with_record() {
        struct Expensive;
        #[async_trait]
        impl GenerationClient for Expensive {
            async fn generate(
                &self,
                _model: &str,
                _messages: &[Message],
                _sampling: &SamplingParams,
            ) -> Result<Generation, ClientError> {
                let mut g = Generation::new("pricey", 1, 1);
                g.reported_cost = Some(Money::from_dollars(0.50));
                Ok(g)
            }
        }

        let gw = GenerationGateway::new(Arc::new(Expensive)).with_pricing(pricing());
        let meter = BudgetMeter::new(BudgetScope::Run, Some(Money::from_dollars(0.20)));
        let err = gw.generate(&request(), &meter, &CancelToken::new()).await.unwrap_err();

        match err {
            GatewayError::BudgetCrossed { record, .. } => assert_eq!(record.amount, Money::from_dollars(0.50)),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(meter.spent(), Money::from_dollars(0.50));
        assert!(meter.is_tripped());
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let client = Arc::new(ScriptedClient::default());
        let gw = gateway(client.clone());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = gw
            .generate(&request(), &BudgetMeter::unlimited(BudgetScope::Run), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
        assert!(client.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out_as_transient() {
        struct Stalled;
        #[async_trait]
        impl GenerationClient for Stalled {
            async fn generate(
                &self,
                _model: &str,
                _messages: &[Message],
                _sampling: &SamplingParams,
            ) -> Result<Generation, ClientError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Generation::new("late", 1, 1))
            }
        }

        let gw = GenerationGateway::new(Arc::new(Stalled))
            .with_call_timeout(Duration::from_secs(5))
            .with_max_attempts(2)
            .with_backoff(BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(10)));
        let err = gw
            .generate(&request(), &BudgetMeter::unlimited(BudgetScope::Run), &CancelToken::new())
            .await
            .unwrap_err();
        match err {
            GatewayError::RetriesExhausted { source, attempts, .. } => {
                assert_eq!(attempts, 2);
                assert!(matches!(source, ClientError::Timeout(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
