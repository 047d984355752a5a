//! Bounded-retry HTTP transport for the ledger authority

use crate::api::{
    CustomerResponse, Envelope, ErrorBody, ProductMetadata, PurchaseSubmission,
    RegistrationRequest,
};
use crate::config::{
    ATTEMPT_CEILING, DNS_FAILOVER_THRESHOLD, RATE_LIMIT_DELAY, REQUEST_TIMEOUT, RETRY_DELAY,
    VALIDATION_TIMEOUT,
};
use crate::error::{classify_status, CheckstandError, ErrorCode, Result};
use crate::fallback::FallbackCache;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// The ledger authority API, as the rest of the SDK sees it.
#[async_trait]
pub trait LedgerApi: Send + Sync {
    /// `POST /v1/customers` - register the device, returning its entitlements.
    async fn register(&self, req: &RegistrationRequest) -> Result<CustomerResponse>;

    /// `POST /v1/subscriptions` - submit purchases for validation.
    async fn submit_purchases(&self, req: &PurchaseSubmission) -> Result<CustomerResponse>;

    /// `GET /v2/products` - catalog metadata (which ids exist and their kind).
    async fn fetch_products(&self) -> Result<Vec<ProductMetadata>>;
}

/// What the retry loop should do after a failed attempt
#[derive(Debug, PartialEq)]
enum RetryDecision {
    RetryAfter(Duration),
    /// Switch to the secondary host, then retry
    FailoverAndRetry(Duration),
    GiveUp,
}

/// Per-call retry bookkeeping; the policy lives here so it can be tested
/// without a network.
#[derive(Debug, Default)]
struct RetryState {
    attempts: u32,
    rate_limit_retried: bool,
    dns_failures: u32,
}

impl RetryState {
    fn attempts_remaining(&self) -> bool {
        self.attempts < ATTEMPT_CEILING
    }

    fn next(&mut self, err: &CheckstandError) -> RetryDecision {
        match err.code() {
            // 429 gets exactly one retry, after an extended delay, outside
            // the normal attempt budget.
            ErrorCode::RateLimited => {
                if self.rate_limit_retried {
                    RetryDecision::GiveUp
                } else {
                    self.rate_limit_retried = true;
                    RetryDecision::RetryAfter(RATE_LIMIT_DELAY)
                }
            }
            ErrorCode::UnknownHostError => {
                self.attempts += 1;
                self.dns_failures += 1;
                if !self.attempts_remaining() {
                    RetryDecision::GiveUp
                } else if self.dns_failures >= DNS_FAILOVER_THRESHOLD {
                    self.dns_failures = 0;
                    RetryDecision::FailoverAndRetry(RETRY_DELAY)
                } else {
                    RetryDecision::RetryAfter(RETRY_DELAY)
                }
            }
            ErrorCode::TransientNetworkError | ErrorCode::ConnectionError => {
                self.attempts += 1;
                if self.attempts_remaining() {
                    RetryDecision::RetryAfter(RETRY_DELAY)
                } else {
                    RetryDecision::GiveUp
                }
            }
            // 401/402/422 and everything else typed: never retried.
            _ => RetryDecision::GiveUp,
        }
    }
}

/// Executes HTTP calls to the ledger authority with bounded retry, rate-limit
/// handling, host failover and fallback-mode activation.
pub struct RetryingTransport {
    http: reqwest::Client,
    api_key: String,
    primary: Url,
    failover: Url,
    on_failover: AtomicBool,
    fallback: Arc<FallbackCache>,
}

impl RetryingTransport {
    pub fn new(
        api_key: String,
        primary: Url,
        failover: Url,
        fallback: Arc<FallbackCache>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("checkstand-sdk-rust/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CheckstandError::transient(e.to_string()))?;
        Ok(Self {
            http,
            api_key,
            primary,
            failover,
            on_failover: AtomicBool::new(false),
            fallback,
        })
    }

    fn active_host(&self) -> &Url {
        if self.on_failover.load(Ordering::Acquire) {
            &self.failover
        } else {
            &self.primary
        }
    }

    fn switch_to_failover(&self) {
        if !self.on_failover.swap(true, Ordering::AcqRel) {
            tracing::warn!(host = %self.failover, "failing over to secondary ledger host");
        }
    }

    async fn execute<T, B>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
        timeout: Duration,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + Sync,
    {
        let mut state = RetryState::default();
        let mut last_err: Option<CheckstandError> = None;

        while state.attempts_remaining() {
            let err = match self.send_once(method.clone(), path, body, timeout).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match state.next(&err) {
                RetryDecision::GiveUp => return Err(err),
                RetryDecision::RetryAfter(delay) => {
                    tracing::debug!(path, error = %err, delay_ms = delay.as_millis() as u64, "retrying ledger call");
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::FailoverAndRetry(delay) => {
                    self.switch_to_failover();
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_err.unwrap_or(CheckstandError::RetriesExhausted))
    }

    async fn send_once<T, B>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
        timeout: Duration,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + Sync,
    {
        let host = self.active_host();
        let url = host
            .join(path)
            .map_err(|e| CheckstandError::validation(e.to_string()))?;

        let mut request = self
            .http
            .request(method, url)
            .query(&[("api_key", self.api_key.as_str())])
            .timeout(timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_request_error(e, host.as_str()))?;

        let status = response.status();
        if !status.is_success() {
            let error_body: ErrorBody = response.json().await.unwrap_or_default();
            let message = error_body
                .message
                .unwrap_or_else(|| format!("request failed: {}", status));
            return Err(classify_status(status.as_u16(), message, error_body.details));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| CheckstandError::transient(format!("undecodable response: {}", e)))?;
        envelope
            .data
            .results
            .ok_or_else(|| CheckstandError::transient("response envelope carried no results"))
    }
}

/// Map a reqwest failure to the error taxonomy. Name-resolution failures get
/// their own code so the retry loop can count them toward host failover.
fn classify_request_error(err: reqwest::Error, host: &str) -> CheckstandError {
    if err.is_timeout() {
        return CheckstandError::transient(format!("request timed out: {}", err));
    }
    if err.is_connect() {
        // reqwest does not expose DNS failure structurally; the resolver
        // error surfaces in the message chain.
        let chain = format!("{:?}", err).to_lowercase();
        if chain.contains("dns") || chain.contains("resolve") {
            return CheckstandError::UnknownHost(host.to_string());
        }
        return CheckstandError::transient(format!("connection failed: {}", err));
    }
    CheckstandError::transient(err.to_string())
}

#[async_trait]
impl LedgerApi for RetryingTransport {
    async fn register(&self, req: &RegistrationRequest) -> Result<CustomerResponse> {
        match self
            .execute(reqwest::Method::POST, "/v1/customers", Some(req), REQUEST_TIMEOUT)
            .await
        {
            Ok(customer) => Ok(customer),
            Err(err) => {
                // Registration exhausting its retries means the ledger
                // authority itself is unreachable: switch to the bundled
                // snapshot until a real round trip succeeds.
                if err.is_retriable() || err.code() == ErrorCode::RetriesExhausted {
                    self.fallback.activate();
                }
                Err(err)
            }
        }
    }

    async fn submit_purchases(&self, req: &PurchaseSubmission) -> Result<CustomerResponse> {
        self.execute(
            reqwest::Method::POST,
            "/v1/subscriptions",
            Some(req),
            VALIDATION_TIMEOUT,
        )
        .await
    }

    async fn fetch_products(&self) -> Result<Vec<ProductMetadata>> {
        self.execute::<_, ()>(reqwest::Method::GET, "/v2/products", None, REQUEST_TIMEOUT)
            .await
    }
}

impl std::fmt::Debug for RetryingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingTransport")
            .field("primary", &self.primary.as_str())
            .field("failover", &self.failover.as_str())
            .field("on_failover", &self.on_failover.load(Ordering::Relaxed))
            .finish()
    }
}
