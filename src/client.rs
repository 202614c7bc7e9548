use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::correlation::{self, CORRELATION_HEADER};
use crate::csrf::{CsrfTokenManager, CSRF_HEADER};
use crate::error::{is_csrf_rejection, ApiError, Error};
use crate::BoxFuture;

/// Callback invoked on every HTTP 401. Registered once via
/// [`ApiClient::set_unauthorized_handler`].
pub type UnauthorizedHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Successful result of one request.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub data: T,
    pub status: u16,
    pub correlation_id: String,
}

/// Per-call options layered over the client defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub timeout_ms: Option<u64>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

struct Attempt {
    status: StatusCode,
    correlation_id: String,
    body: Vec<u8>,
}

fn requires_csrf(method: &Method) -> bool {
    *method == Method::POST
        || *method == Method::PUT
        || *method == Method::PATCH
        || *method == Method::DELETE
}

/// HTTP client for the storefront backend.
///
/// Mutating methods carry the CSRF double-submit header and recover once
/// from a stale token; every attempt is tagged with a fresh correlation id.
/// Construct one instance at the application's composition root and share
/// it; the CSRF cache and the unauthorized callback live on the instance.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    config: ClientConfig,
    csrf: CsrfTokenManager,
    unauthorized: Arc<RwLock<Option<UnauthorizedHandler>>>,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| Error::Config(format!("invalid default header name {name:?}: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| Error::Config(format!("invalid default header value: {err}")))?;
            headers.insert(name, value);
        }

        let http = Client::builder()
            .default_headers(headers)
            .cookie_store(config.with_credentials)
            .build()
            .map_err(|err| Error::Config(format!("building http client: {err}")))?;

        let csrf = CsrfTokenManager::new(http.clone(), config.timeout());
        Ok(Self {
            http,
            config,
            csrf,
            unauthorized: Arc::new(RwLock::new(None)),
        })
    }

    /// Register the single callback invoked on every HTTP 401. The callback
    /// is awaited before the error is returned; it never suppresses it.
    pub async fn set_unauthorized_handler(&self, handler: UnauthorizedHandler) {
        *self.unauthorized.write().await = Some(handler);
    }

    /// Execute one logical request.
    ///
    /// A CSRF-specific 403 on a mutating method triggers one token refresh
    /// and one retry; the retry's outcome is final no matter how it ends.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse<T>, Error> {
        let needs_csrf = requires_csrf(&method);
        let token = if needs_csrf {
            Some(self.csrf.get_token(&self.config.base_url).await?)
        } else {
            None
        };

        let first = self.attempt(&method, path, &options, token.as_deref()).await;
        match first {
            Err(Error::Api(api)) if needs_csrf && api.status == 403 && is_csrf_rejection(&api) => {
                debug!(
                    path = %path,
                    correlation_id = %api.correlation_id,
                    "csrf token rejected, refreshing and retrying once"
                );
                let fresh = self.csrf.refresh_token(&self.config.base_url).await?;
                self.attempt(&method, path, &options, Some(fresh.as_str())).await
            }
            other => other,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>, Error> {
        self.request(Method::GET, path, RequestOptions::default()).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
    ) -> Result<ApiResponse<T>, Error> {
        self.request(Method::POST, path, RequestOptions::default().body(body)).await
    }

    pub async fn put<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
    ) -> Result<ApiResponse<T>, Error> {
        self.request(Method::PUT, path, RequestOptions::default().body(body)).await
    }

    pub async fn patch<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
    ) -> Result<ApiResponse<T>, Error> {
        self.request(Method::PATCH, path, RequestOptions::default().body(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>, Error> {
        self.request(Method::DELETE, path, RequestOptions::default()).await
    }

    /// One physical attempt: dispatch, then classify the response. Never
    /// retries; the retry decision belongs to [`ApiClient::request`].
    async fn attempt<T: DeserializeOwned>(
        &self,
        method: &Method,
        path: &str,
        options: &RequestOptions,
        csrf_token: Option<&str>,
    ) -> Result<ApiResponse<T>, Error> {
        let attempt = self.send_once(method, path, options, csrf_token).await?;

        if attempt.status.is_success() {
            let data = if attempt.status == StatusCode::NO_CONTENT || attempt.body.is_empty() {
                serde_json::from_slice(b"null")
            } else {
                serde_json::from_slice(&attempt.body)
            }
            .map_err(|err| Error::Network {
                message: format!("failed to decode response body: {err}"),
                correlation_id: attempt.correlation_id.clone(),
            })?;
            debug!(
                method = %method,
                path = %path,
                status = %attempt.status,
                correlation_id = %attempt.correlation_id,
                "request completed"
            );
            return Ok(ApiResponse {
                data,
                status: attempt.status.as_u16(),
                correlation_id: attempt.correlation_id,
            });
        }

        let api = ApiError::from_response(
            attempt.status.as_u16(),
            &attempt.body,
            path,
            &attempt.correlation_id,
        );
        if attempt.status == StatusCode::UNAUTHORIZED {
            self.notify_unauthorized().await;
        }
        warn!(
            method = %method,
            path = %path,
            status = %attempt.status,
            code = %api.code,
            correlation_id = %api.correlation_id,
            "request failed"
        );
        Err(Error::Api(api))
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        options: &RequestOptions,
        csrf_token: Option<&str>,
    ) -> Result<Attempt, Error> {
        let correlation_id = correlation::new_correlation_id();
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let timeout_ms = options.timeout_ms.unwrap_or(self.config.timeout_ms);

        trace!(
            method = %method,
            url = %url,
            correlation_id = %correlation_id,
            timeout_ms = %timeout_ms,
            "dispatching request"
        );

        let mut request = self
            .http
            .request(method.clone(), &url)
            .timeout(Duration::from_millis(timeout_ms))
            .header(CORRELATION_HEADER, correlation_id.as_str());
        if !options.query.is_empty() {
            request = request.query(&options.query);
        }
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(token) = csrf_token {
            request = request.header(CSRF_HEADER, token);
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| classify_transport(err, timeout_ms, &correlation_id))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| classify_transport(err, timeout_ms, &correlation_id))?
            .to_vec();

        Ok(Attempt {
            status,
            correlation_id,
            body,
        })
    }

    async fn notify_unauthorized(&self) {
        let handler = self.unauthorized.read().await.clone();
        if let Some(handler) = handler {
            debug!("invoking unauthorized handler");
            handler().await;
        }
    }
}

/// Transport exceptions never escape raw; they map onto the taxonomy here.
fn classify_transport(err: reqwest::Error, timeout_ms: u64, correlation_id: &str) -> Error {
    if err.is_timeout() {
        Error::Timeout {
            timeout_ms,
            correlation_id: correlation_id.to_string(),
        }
    } else if err.is_builder() {
        Error::Config(format!("invalid request: {err}"))
    } else {
        Error::Network {
            message: err.to_string(),
            correlation_id: correlation_id.to_string(),
        }
    }
}
