//! HTTP transport with an injected retry policy, plus the tabular sink contract.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub mod google;
pub mod sink;

pub use google::{AccessTokenSource, GoogleSheets, GoogleWorksheet, ServiceAccountKey};
pub use sink::{MemoryWorksheet, ReplaceOutcome, SinkError, SinkWriter, Worksheet};

pub const CRATE_NAME: &str = "avstat-storage";

/// Upper bound on how much of an error body is kept for logs and error messages.
const ERROR_BODY_LIMIT: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    pub retryable_statuses: Vec<u16>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(700),
            factor: 2,
            max_delay: Duration::from_secs(30),
            retryable_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = self
            .factor
            .checked_pow(attempt_index as u32)
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn classify_status(&self, status: StatusCode) -> RetryDisposition {
        if self.retryable_statuses.contains(&status.as_u16()) {
            RetryDisposition::Retryable
        } else {
            RetryDisposition::NonRetryable
        }
    }
}

/// Source of delays. Production sleeps on the tokio timer; tests record instead.
#[async_trait]
pub trait Sleeper: Send + Sync + Debug {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Fake clock: remembers every requested delay and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(JsonValue),
    Form(Vec<(String, String)>),
}

/// Owned request description, rebuilt into a fresh `reqwest` request on every attempt.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub bearer: Option<String>,
    pub body: RequestBody,
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            bearer: None,
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post_json(url: impl Into<String>, body: JsonValue) -> Self {
        Self::new(Method::POST, url).json(body)
    }

    pub fn post_form(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        let mut request = Self::new(Method::POST, url);
        request.body = RequestBody::Form(form);
        request
    }

    pub fn put_json(url: impl Into<String>, body: JsonValue) -> Self {
        Self::new(Method::PUT, url).json(body)
    }

    pub fn json(mut self, body: JsonValue) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.bearer = Some(token.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: String,
}

impl ApiResponse {
    /// An empty body decodes as JSON `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        let text = if self.body.trim().is_empty() {
            "null"
        } else {
            self.body.as_str()
        };
        serde_json::from_str(text).map_err(|source| FetchError::Decode {
            url: self.url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::Decode { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

fn truncate_body(mut body: String) -> String {
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Fixed self-throttle between requests. Zero is a no-op.
    pub async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            self.sleeper.sleep(duration).await;
        }
    }

    fn build(&self, request: &ApiRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Form(form) => builder.form(form),
        }
    }

    /// Sends `request`, retrying transient failures per the backoff policy.
    /// Non-success statuses that are not retryable (or exhaust the retries) come back
    /// as `FetchError::HttpStatus`, including 404 so callers can decide what it means.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, FetchError> {
        let span = info_span!("http_fetch", method = %request.method, url = %request.url);
        self.execute_with_retries(request).instrument(span).await
    }

    async fn execute_with_retries(&self, request: &ApiRequest) -> Result<ApiResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.build(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    debug!(status = status.as_u16(), attempt, "response received");

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(ApiResponse {
                            status,
                            url: final_url,
                            body,
                        });
                    }

                    let disposition = self.backoff.classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "retryable status, backing off");
                        self.sleeper.sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    let body = truncate_body(resp.text().await.unwrap_or_default());
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt, ?delay, "transport error, backing off");
                        self.sleeper.sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fetcher_with(policy: BackoffPolicy, sleeper: Arc<RecordingSleeper>) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: policy,
            ..Default::default()
        })
        .expect("fetcher")
        .with_sleeper(sleeper)
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            factor: 2,
            max_delay: Duration::from_millis(350),
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn default_policy_retries_rate_limits_and_gateway_errors() {
        let policy = BackoffPolicy::default();
        for code in [429u16, 500, 502, 503, 504] {
            let status = StatusCode::from_u16(code).expect("status");
            assert_eq!(policy.classify_status(status), RetryDisposition::Retryable);
        }
        for code in [400u16, 401, 403, 404, 501] {
            let status = StatusCode::from_u16(code).expect("status");
            assert_eq!(policy.classify_status(status), RetryDisposition::NonRetryable);
        }
    }

    #[tokio::test]
    async fn retryable_status_is_retried_until_the_cap() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .with_body("busy")
            .expect(3)
            .create_async()
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let fetcher = fetcher_with(
            BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(700),
                ..Default::default()
            },
            sleeper.clone(),
        );

        let err = fetcher
            .execute(&ApiRequest::get(format!("{}/flaky", server.url())))
            .await
            .expect_err("should give up");

        assert_eq!(err.status(), Some(503));
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_millis(700), Duration::from_millis(1400)]
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn connection_errors_back_off_then_surface() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let fetcher = fetcher_with(BackoffPolicy::default(), sleeper.clone());

        let err = fetcher
            .execute(&ApiRequest::get("http://127.0.0.1:1/unreachable"))
            .await
            .expect_err("nothing listens on port 1");

        assert!(matches!(err, FetchError::Request(_)));
        assert_eq!(err.status(), None);
        assert_eq!(
            sleeper.recorded(),
            vec![
                Duration::from_millis(700),
                Duration::from_millis(1400),
                Duration::from_millis(2800),
                Duration::from_millis(5600),
            ]
        );
    }

    #[tokio::test]
    async fn permanent_status_is_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .with_body("Not Found")
            .expect(1)
            .create_async()
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let fetcher = fetcher_with(BackoffPolicy::default(), sleeper.clone());

        let err = fetcher
            .execute(&ApiRequest::get(format!("{}/missing", server.url())))
            .await
            .expect_err("404 surfaces");

        assert!(err.is_not_found());
        assert!(sleeper.recorded().is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn sends_bearer_query_and_json_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/stats")
            .match_header("authorization", "Bearer tok")
            .match_query(Matcher::UrlEncoded("page".into(), "2".into()))
            .match_body(Matcher::Json(json!({"dateFrom": "2025-06-27"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok": true}"#)
            .create_async()
            .await;

        let fetcher = fetcher_with(BackoffPolicy::default(), Arc::new(RecordingSleeper::default()));
        let response = fetcher
            .execute(
                &ApiRequest::post_json(
                    format!("{}/stats", server.url()),
                    json!({"dateFrom": "2025-06-27"}),
                )
                .query("page", 2)
                .bearer("tok"),
            )
            .await
            .expect("success");

        let body: JsonValue = response.json().expect("json");
        assert_eq!(body, json!({"ok": true}));
        mock.assert_async().await;
    }

    #[test]
    fn empty_body_decodes_as_null() {
        let response = ApiResponse {
            status: StatusCode::OK,
            url: "http://localhost/".into(),
            body: "  ".into(),
        };
        let value: JsonValue = response.json().expect("null");
        assert_eq!(value, JsonValue::Null);
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(ERROR_BODY_LIMIT * 2);
        assert_eq!(truncate_body(body).len(), ERROR_BODY_LIMIT);
    }
}
