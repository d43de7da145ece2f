//! Authenticated amoCRM HTTP transport: backoff, pacing, token refresh and pagination.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{info, info_span, warn, Instrument};

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub const CRATE_NAME: &str = "amostat-storage";

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const DEFAULT_PAGE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// Query parameters for reads, a JSON document for writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload {
    #[default]
    None,
    Query(Vec<(String, String)>),
    Json(JsonValue),
}

impl Payload {
    pub fn query<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Payload::Query(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    Upstream { status: u16, url: String, body: String },
    #[error("not authorized for {url} after refreshing credentials")]
    NotAuthorized { url: String },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("no usable credentials: {0}")]
    Credentials(String),
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Upstream { status, .. } => Some(*status),
            TransportError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Connection-level failures and upstream overload, worth one more attempt by callers.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            TransportError::Upstream { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// The single capability the evaluation engine needs from the CRM.
#[async_trait]
pub trait CrmTransport: Send + Sync {
    /// A 204 response yields `JsonValue::Null`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Payload,
    ) -> Result<JsonValue, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 4,
            backoff: BackoffPolicy::default(),
            // amoCRM allows 7 requests per second per integration.
            token_bucket: Some(TokenBucketConfig {
                capacity: 7,
                refill_every: Duration::from_millis(143),
            }),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    RefreshToken,
    AuthorizationCode,
}

impl GrantType {
    fn as_str(self) -> &'static str {
        match self {
            GrantType::RefreshToken => "refresh_token",
            GrantType::AuthorizationCode => "authorization_code",
        }
    }

    fn token_field(self) -> &'static str {
        match self {
            GrantType::RefreshToken => "refresh_token",
            GrantType::AuthorizationCode => "code",
        }
    }
}

/// Receives every freshly issued token pair so it survives restarts.
#[async_trait]
pub trait TokenSink: Send + Sync {
    async fn store_tokens(&self, tokens: &TokenPair) -> anyhow::Result<()>;
}

pub struct AmoTransport {
    client: reqwest::Client,
    base_url: String,
    oauth: OAuthConfig,
    tokens: RwLock<Option<TokenPair>>,
    refresh_lock: Mutex<()>,
    token_sink: Option<Arc<dyn TokenSink>>,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl AmoTransport {
    pub fn new(
        base_url: impl Into<String>,
        oauth: OAuthConfig,
        tokens: Option<TokenPair>,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            oauth,
            tokens: RwLock::new(tokens),
            refresh_lock: Mutex::new(()),
            token_sink: None,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub fn with_token_sink(mut self, sink: Arc<dyn TokenSink>) -> Self {
        self.token_sink = Some(sink);
        self
    }

    pub async fn tokens(&self) -> Option<TokenPair> {
        self.tokens.read().await.clone()
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn access_token(&self) -> Option<String> {
        self.tokens.read().await.as_ref().map(|t| t.access_token.clone())
    }

    /// Exchange a grant for a new token pair and publish it to the sink.
    pub async fn authorize(&self, grant: GrantType, token: &str) -> Result<TokenPair, TransportError> {
        let mut body = serde_json::Map::new();
        body.insert("client_id".into(), self.oauth.client_id.clone().into());
        body.insert("client_secret".into(), self.oauth.client_secret.clone().into());
        body.insert("redirect_uri".into(), self.oauth.redirect_uri.clone().into());
        body.insert("grant_type".into(), grant.as_str().into());
        body.insert(grant.token_field().into(), token.into());
        let body = JsonValue::Object(body);
        let url = self.url_for("oauth2/access_token");
        let value = self
            .send_with_retries(Method::Post, &url, &Payload::Json(body), None)
            .await?;
        let pair: TokenPair = serde_json::from_value(value).map_err(|err| TransportError::Decode {
            url: url.clone(),
            message: err.to_string(),
        })?;

        *self.tokens.write().await = Some(pair.clone());
        if let Some(sink) = &self.token_sink {
            if let Err(err) = sink.store_tokens(&pair).await {
                warn!(error = %err, "persisting refreshed tokens failed");
            }
        }
        info!(grant = grant.as_str(), "obtained new amoCRM tokens");
        Ok(pair)
    }

    /// Refresh once per expired token even when several calls hit 401 together.
    async fn reauthorize(&self, stale_access_token: Option<&str>) -> Result<(), TransportError> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.tokens().await;
        if current.as_ref().map(|t| t.access_token.as_str()) != stale_access_token {
            return Ok(());
        }

        let refreshed = match current {
            Some(pair) => self.authorize(GrantType::RefreshToken, &pair.refresh_token).await,
            None => Err(TransportError::Credentials("no refresh token stored".into())),
        };
        match refreshed {
            Ok(_) => Ok(()),
            Err(err) => match &self.oauth.auth_code {
                Some(code) => {
                    warn!(error = %err, "refresh grant failed; falling back to authorization code");
                    self.authorize(GrantType::AuthorizationCode, code).await.map(|_| ())
                }
                None => Err(err),
            },
        }
    }

    async fn send_with_retries(
        &self,
        method: Method,
        url: &str,
        payload: &Payload,
        bearer: Option<&str>,
    ) -> Result<JsonValue, TransportError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| TransportError::Credentials("transport is shutting down".into()))?;

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let mut builder = self.client.request(method.as_reqwest(), url);
            if let Some(token) = bearer {
                builder = builder.bearer_auth(token);
            }
            builder = match payload {
                Payload::None => builder,
                Payload::Query(pairs) => builder.query(pairs),
                Payload::Json(body) => builder.json(body),
            };

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status == StatusCode::NO_CONTENT {
                        return Ok(JsonValue::Null);
                    }
                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        if bytes.is_empty() {
                            return Ok(JsonValue::Null);
                        }
                        return serde_json::from_slice(&bytes).map_err(|err| TransportError::Decode {
                            url: final_url,
                            message: err.to_string(),
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying after upstream status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(TransportError::Upstream {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(TransportError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(TransportError::Request(err)),
            None => Err(TransportError::Upstream {
                status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
                url: url.to_string(),
                body: "retries exhausted".into(),
            }),
        }
    }
}

#[async_trait]
impl CrmTransport for AmoTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Payload,
    ) -> Result<JsonValue, TransportError> {
        let url = self.url_for(path);
        let span = info_span!("crm_request", method = method.as_str(), path);

        async {
            let used_token = self.access_token().await;
            match self
                .send_with_retries(method, &url, &payload, used_token.as_deref())
                .await
            {
                Err(TransportError::Upstream { status: 401, .. }) => {
                    if let Err(err) = self.reauthorize(used_token.as_deref()).await {
                        return Err(err);
                    }
                    let fresh = self.access_token().await;
                    match self
                        .send_with_retries(method, &url, &payload, fresh.as_deref())
                        .await
                    {
                        Err(TransportError::Upstream { status: 401, .. }) => {
                            Err(TransportError::NotAuthorized { url: url.clone() })
                        }
                        other => other,
                    }
                }
                other => other,
            }
        }
        .instrument(span)
        .await
    }
}

/// Forward-only walk over a paged collection; it cannot be rewound.
pub struct Paginator {
    transport: Arc<dyn CrmTransport>,
    entity: String,
    path: String,
    query: Vec<(String, String)>,
    page: u32,
    page_size: u32,
    page_interval: Duration,
    finished: bool,
}

impl Paginator {
    pub fn new(
        transport: Arc<dyn CrmTransport>,
        entity: impl Into<String>,
        path: impl Into<String>,
        query: Vec<(String, String)>,
        page_size: u32,
    ) -> Self {
        Self {
            transport,
            entity: entity.into(),
            path: path.into(),
            query,
            page: 1,
            page_size: page_size.max(1),
            page_interval: DEFAULT_PAGE_INTERVAL,
            finished: false,
        }
    }

    pub fn with_page_interval(mut self, interval: Duration) -> Self {
        self.page_interval = interval;
        self
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<JsonValue>>, TransportError> {
        if self.finished {
            return Ok(None);
        }
        if self.page > 1 && !self.page_interval.is_zero() {
            tokio::time::sleep(self.page_interval).await;
        }

        let mut query = self.query.clone();
        query.push(("page".into(), self.page.to_string()));
        query.push(("limit".into(), self.page_size.to_string()));

        let body = match self
            .transport
            .request(Method::Get, &self.path, Payload::Query(query))
            .await
        {
            Ok(body) => body,
            Err(err) => {
                self.finished = true;
                return Err(err);
            }
        };

        if body.is_null() {
            self.finished = true;
            return Ok(None);
        }

        let items = match body
            .get("_embedded")
            .and_then(|e| e.get(&self.entity))
            .and_then(|v| v.as_array())
        {
            Some(items) => items.clone(),
            None => {
                self.finished = true;
                return Err(TransportError::Decode {
                    url: self.path.clone(),
                    message: format!("missing _embedded.{}", self.entity),
                });
            }
        };

        let has_next = body
            .get("_links")
            .and_then(|l| l.get("next"))
            .is_some_and(|n| !n.is_null());
        if has_next {
            self.page += 1;
        } else {
            self.finished = true;
        }
        Ok(Some(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    #[derive(Default)]
    struct Counters {
        refreshes: AtomicUsize,
        code_exchanges: AtomicUsize,
    }

    #[derive(Default)]
    struct RecordingSink {
        stored: StdMutex<Vec<TokenPair>>,
    }

    #[async_trait]
    impl TokenSink for RecordingSink {
        async fn store_tokens(&self, tokens: &TokenPair) -> anyhow::Result<()> {
            self.stored.lock().unwrap().push(tokens.clone());
            Ok(())
        }
    }

    async fn contact_handler(headers: HeaderMap) -> Response {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if auth != "Bearer fresh" {
            return AxumStatus::UNAUTHORIZED.into_response();
        }
        Json(json!({"id": 1, "custom_fields_values": null})).into_response()
    }

    async fn token_handler(
        State(counters): State<Arc<Counters>>,
        Json(grant): Json<JsonValue>,
    ) -> Response {
        if grant["grant_type"] == "authorization_code" {
            counters.code_exchanges.fetch_add(1, Ordering::SeqCst);
        } else if grant["refresh_token"] == "revoked" {
            return (AxumStatus::BAD_REQUEST, "refresh token revoked").into_response();
        } else {
            counters.refreshes.fetch_add(1, Ordering::SeqCst);
        }
        Json(json!({
            "token_type": "Bearer",
            "expires_in": 86400,
            "access_token": "fresh",
            "refresh_token": "refresh-2"
        }))
        .into_response()
    }

    async fn companies_handler(Query(q): Query<HashMap<String, String>>) -> Response {
        let page = q.get("page").cloned().unwrap_or_default();
        let links = if page == "1" {
            json!({"self": {"href": "p1"}, "next": {"href": "p2"}})
        } else {
            json!({"self": {"href": "p2"}})
        };
        Json(json!({
            "_embedded": {"companies": [{"id": page.parse::<i64>().unwrap_or(0)}]},
            "_links": links
        }))
        .into_response()
    }

    async fn spawn_server() -> (String, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let app = Router::new()
            .route("/api/v4/contacts/1", get(contact_handler))
            .route("/oauth2/access_token", post(token_handler))
            .route("/api/v4/leads", get(|| async { AxumStatus::NO_CONTENT }))
            .route("/api/v4/companies", get(companies_handler))
            .route(
                "/api/v4/broken",
                get(|| async { (AxumStatus::BAD_REQUEST, "bad filter") }),
            )
            .with_state(counters.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (format!("http://{addr}"), counters)
    }

    fn transport(base_url: &str) -> AmoTransport {
        transport_with(base_url, "refresh-1", None)
    }

    fn transport_with(base_url: &str, refresh_token: &str, auth_code: Option<&str>) -> AmoTransport {
        AmoTransport::new(
            base_url,
            OAuthConfig {
                client_id: "client".into(),
                client_secret: "secret".into(),
                redirect_uri: "https://example.com".into(),
                auth_code: auth_code.map(str::to_string),
            },
            Some(TokenPair {
                access_token: "expired".into(),
                refresh_token: refresh_token.into(),
            }),
            HttpClientConfig {
                token_bucket: None,
                ..Default::default()
            },
        )
        .expect("transport")
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        let err = TransportError::Upstream {
            status: 404,
            url: "x".into(),
            body: String::new(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn token_bucket_waits_for_refill_once_drained() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_millis(40));
        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_millis(40));
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn unauthorized_call_refreshes_once_and_retries() {
        let (base, counters) = spawn_server().await;
        let sink = Arc::new(RecordingSink::default());
        let transport = transport(&base).with_token_sink(sink.clone());

        let body = transport
            .request(Method::Get, "api/v4/contacts/1", Payload::query([("with", "leads")]))
            .await
            .expect("contact after refresh");

        assert_eq!(body["id"], 1);
        assert_eq!(counters.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.tokens().await.unwrap().refresh_token, "refresh-2");
        assert_eq!(sink.stored.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_falls_back_to_authorization_code() {
        let (base, counters) = spawn_server().await;
        let sink = Arc::new(RecordingSink::default());
        let transport = transport_with(&base, "revoked", Some("install-code")).with_token_sink(sink.clone());

        let body = transport
            .request(Method::Get, "api/v4/contacts/1", Payload::None)
            .await
            .expect("contact after code exchange");

        assert_eq!(body["id"], 1);
        assert_eq!(counters.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(counters.code_exchanges.load(Ordering::SeqCst), 1);
        assert_eq!(transport.tokens().await.unwrap().access_token, "fresh");
        assert_eq!(sink.stored.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_without_code_surfaces_the_error() {
        let (base, counters) = spawn_server().await;
        let transport = transport_with(&base, "revoked", None);

        let err = transport
            .request(Method::Get, "api/v4/contacts/1", Payload::None)
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Upstream { status: 400, .. }));
        assert_eq!(counters.code_exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_content_is_an_empty_result_and_client_errors_surface() {
        let (base, _) = spawn_server().await;
        let transport = transport(&base);

        let empty = transport
            .request(Method::Get, "/api/v4/leads", Payload::None)
            .await
            .expect("204");
        assert!(empty.is_null());

        let err = transport
            .request(Method::Get, "api/v4/broken", Payload::None)
            .await
            .unwrap_err();
        match err {
            TransportError::Upstream { status, body, .. } => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad filter");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn paginator_follows_next_links_until_exhausted() {
        let (base, _) = spawn_server().await;
        let transport: Arc<dyn CrmTransport> = Arc::new(transport(&base));
        let mut pages = Paginator::new(transport, "companies", "api/v4/companies", vec![], 50)
            .with_page_interval(Duration::ZERO);

        let first = pages.next_page().await.expect("page 1").expect("items");
        let second = pages.next_page().await.expect("page 2").expect("items");
        assert_eq!(first[0]["id"], 1);
        assert_eq!(second[0]["id"], 2);
        assert!(pages.next_page().await.expect("done").is_none());
    }

    #[tokio::test]
    async fn paginator_stops_on_no_content() {
        let (base, _) = spawn_server().await;
        let transport: Arc<dyn CrmTransport> = Arc::new(transport(&base));
        let mut pages = Paginator::new(transport, "leads", "api/v4/leads", vec![], 50);
        assert!(pages.next_page().await.expect("204").is_none());
    }
}
