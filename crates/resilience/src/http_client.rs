//! Resilient HTTP client for third-party platform APIs.
//!
//! Every attempt passes through the client's circuit breaker; the attempt
//! sequence is driven by [`retry_http_request`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use marketops_core::{
    config::HttpSettings, Error, HttpMethod, HttpRequest, HttpResponse, HttpTransport,
    RequestBody, Result, StatusResponse,
};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::retry::{parse_retry_after, retry_http_request, secs_to_delay, RetryConfig};

/// Upstream error bodies are cut to this many characters.
const ERROR_BODY_LIMIT: usize = 200;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// reqwest transport
// =============================================================================

/// [`HttpTransport`] backed by a pooled `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn from_settings(settings: &HttpSettings) -> Result<Self> {
        Self::new(secs_to_delay(settings.timeout_secs), &settings.user_agent)
    }
}

fn map_reqwest_error(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::Timeout(error.to_string())
    } else {
        Error::transport(error.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(pairs) => builder.form(pairs),
        };

        let response = builder.send().await.map_err(map_reqwest_error)?;

        let mut buffered = HttpResponse::new(response.status().as_u16());
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                buffered = buffered.with_header(name.as_str(), value);
            }
        }
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        Ok(buffered.with_body(body))
    }
}

// =============================================================================
// Resilient client
// =============================================================================

/// Client bound to one upstream base URL, with its own breaker and retry policy.
pub struct ResilientHttpClient<T = ReqwestTransport> {
    name: String,
    base_url: Url,
    default_headers: Vec<(String, String)>,
    transport: T,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
}

impl ResilientHttpClient<ReqwestTransport> {
    /// Start building a client named `name` (used for the breaker and logs).
    pub fn builder(name: impl Into<String>, base_url: impl Into<String>) -> ResilientHttpClientBuilder {
        ResilientHttpClientBuilder::new(name, base_url)
    }
}

impl<T: HttpTransport> ResilientHttpClient<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub async fn get(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse> {
        self.request(HttpMethod::Get, endpoint, params, RequestBody::Empty, headers)
            .await
    }

    pub async fn post(
        &self,
        endpoint: &str,
        body: RequestBody,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse> {
        self.request(HttpMethod::Post, endpoint, &[], body, headers).await
    }

    pub async fn put(
        &self,
        endpoint: &str,
        body: RequestBody,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse> {
        self.request(HttpMethod::Put, endpoint, &[], body, headers).await
    }

    pub async fn delete(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse> {
        self.request(HttpMethod::Delete, endpoint, params, RequestBody::Empty, headers)
            .await
    }

    /// Send a request with breaker gating and status-aware retries.
    ///
    /// Fails with `Error::CircuitOpen` without touching the network while the
    /// breaker rejects calls, and with `Error::RetryExhausted` once every
    /// attempt has failed.
    pub async fn request(
        &self,
        method: HttpMethod,
        endpoint: &str,
        params: &[(&str, &str)],
        body: RequestBody,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse> {
        let request = HttpRequest {
            method,
            url: self.resolve(endpoint)?.to_string(),
            headers: self.merge_headers(headers),
            query: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body,
        };
        let operation = format!("{} {} {}", self.name, method, endpoint);

        retry_http_request(|| self.attempt(request.clone()), &self.retry, &operation).await
    }

    async fn attempt(&self, request: HttpRequest) -> Result<HttpResponse> {
        let permit = self.breaker.acquire()?;

        match self.transport.send(request).await {
            Ok(response) if response.is_success() => {
                permit.success();
                Ok(response)
            }
            Ok(response) => {
                permit.failure();
                Err(Error::UpstreamStatus {
                    status: response.status(),
                    body: response.text().chars().take(ERROR_BODY_LIMIT).collect(),
                    retry_after: response.header("retry-after").and_then(parse_retry_after),
                })
            }
            Err(error) => {
                permit.failure();
                Err(error)
            }
        }
    }

    fn resolve(&self, endpoint: &str) -> Result<Url> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| Error::invalid_request(format!("Invalid endpoint '{}': {}", endpoint, e)))
    }

    /// Defaults first; a call header replaces a default of the same name.
    fn merge_headers(&self, headers: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut merged: Vec<(String, String)> = self
            .default_headers
            .iter()
            .filter(|(name, _)| !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)))
            .cloned()
            .collect();
        merged.extend(headers.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        merged
    }
}

/// Builder for [`ResilientHttpClient`].
pub struct ResilientHttpClientBuilder {
    name: String,
    base_url: String,
    default_headers: Vec<(String, String)>,
    timeout: Duration,
    user_agent: String,
    retry: RetryConfig,
    breaker_config: CircuitBreakerConfig,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl ResilientHttpClientBuilder {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            default_headers: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: HttpSettings::default().user_agent,
            retry: RetryConfig::default(),
            breaker_config: CircuitBreakerConfig::default(),
            breaker: None,
        }
    }

    pub fn with_settings(mut self, settings: &HttpSettings) -> Self {
        self.timeout = secs_to_delay(settings.timeout_secs);
        self.user_agent = settings.user_agent.clone();
        self
    }

    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Share an existing breaker (e.g. from a [`crate::CircuitBreakerRegistry`]).
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn build(self) -> Result<ResilientHttpClient<ReqwestTransport>> {
        let transport = ReqwestTransport::new(self.timeout, &self.user_agent)?;
        self.build_with_transport(transport)
    }

    pub fn build_with_transport<T: HttpTransport>(self, transport: T) -> Result<ResilientHttpClient<T>> {
        let mut base_url = Url::parse(&self.base_url)
            .map_err(|e| Error::config(format!("Invalid base URL '{}': {}", self.base_url, e)))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "Unsupported scheme '{}' in base URL for {}",
                base_url.scheme(),
                self.name
            )));
        }
        // Without a trailing slash `join` would replace the last path segment.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let breaker = self
            .breaker
            .unwrap_or_else(|| Arc::new(CircuitBreaker::new(self.name.clone(), self.breaker_config)));

        tracing::debug!(name = %self.name, base_url = %base_url, "Resilient HTTP client created");

        Ok(ResilientHttpClient {
            name: self.name,
            base_url,
            default_headers: self.default_headers,
            transport,
            breaker,
            retry: self.retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketops_core::mocks::ScriptedTransport;
    use marketops_core::ErrorKind;

    fn client(script: Vec<Result<HttpResponse>>) -> ResilientHttpClient<ScriptedTransport> {
        ResilientHttpClient::builder("hubspot", "https://api.hubapi.com/crm/v3")
            .with_default_header("Authorization", "Bearer default")
            .with_retry(
                RetryConfig::new()
                    .with_initial_delay(Duration::from_secs(1))
                    .with_jitter(false),
            )
            .with_breaker_config(CircuitBreakerConfig::new(3, Duration::from_secs(60)))
            .build_with_transport(ScriptedTransport::new(script))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_server_errors_then_succeeds() {
        let client = client(vec![
            Ok(HttpResponse::new(503)),
            Ok(HttpResponse::new(502)),
            Ok(HttpResponse::new(200).with_body(r#"{"results": []}"#)),
        ]);

        let response = client.get("objects/contacts", &[("limit", "10")], &[]).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(client.transport.calls(), 3);
        // Two failures then a success resets the count.
        assert_eq!(client.breaker().failure_count(), 0);

        let requests = client.transport.requests().await;
        assert_eq!(requests[0].url, "https://api.hubapi.com/crm/v3/objects/contacts");
        assert_eq!(requests[0].query, vec![("limit".to_string(), "10".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried_and_body_truncated() {
        let long_body = "x".repeat(500);
        let client = client(vec![Ok(HttpResponse::new(400).with_body(long_body))]);

        let err = client.post("objects/deals", RequestBody::Json(serde_json::json!({})), &[]).await.unwrap_err();
        match err {
            Error::UpstreamStatus { status, body, .. } => {
                assert_eq!(status, 400);
                assert_eq!(body.chars().count(), ERROR_BODY_LIMIT);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_opens_breaker_then_fails_fast() {
        let client = client(vec![
            Err(Error::transport("connection refused")),
            Err(Error::transport("connection refused")),
            Err(Error::transport("connection refused")),
        ]);

        let err = client.get("objects/contacts", &[], &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(client.breaker_state(), CircuitState::Open);

        let err = client.get("objects/contacts", &[], &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
        assert_eq!(client.transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_honours_retry_after() {
        let client = client(vec![
            Ok(HttpResponse::new(429).with_header("Retry-After", "4")),
            Ok(HttpResponse::new(200)),
        ]);

        let started = tokio::time::Instant::now();
        let response = client.get("objects/contacts", &[], &[]).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_call_headers_override_defaults() {
        let client = client(vec![Ok(HttpResponse::new(204))]);
        client
            .delete("objects/contacts/1", &[], &[("authorization", "Bearer call"), ("X-Trace", "t1")])
            .await
            .unwrap();

        let request = &client.transport.requests().await[0];
        assert_eq!(
            request.headers,
            vec![
                ("authorization".to_string(), "Bearer call".to_string()),
                ("X-Trace".to_string(), "t1".to_string()),
            ]
        );
        assert_eq!(request.method, HttpMethod::Delete);
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let result = ResilientHttpClient::builder("bad", "ftp://example.com")
            .build_with_transport(ScriptedTransport::new(Vec::new()));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = ResilientHttpClient::builder("bad", "not a url")
            .build_with_transport(ScriptedTransport::new(Vec::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
