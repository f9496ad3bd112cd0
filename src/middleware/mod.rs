// src/middleware/mod.rs

// HTTP rate limiting as a tower layer, for axum routers or any tower stack
use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::algorithms::{Limiter, RateLimitStatus};
use crate::error::RateLimiterError;
use crate::keys::KeyFn;

#[cfg(test)]
mod tests;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Returns true for requests that bypass rate limiting
pub type SkipFn = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Builds the response sent instead of the default 429 body
pub type LimitResponder = Arc<dyn Fn(&RateLimitStatus) -> Response + Send + Sync>;

/// Called whenever the limiter fails and the request is let through
pub type ErrorHook = Arc<dyn Fn(&RateLimiterError) + Send + Sync>;

/// A path with its own limiter and, optionally, its own key function
#[derive(Clone)]
pub struct EndpointConfig {
    pub path: String,
    pub limiter: Arc<dyn Limiter>,
    /// Falls back to the layer's key function when `None`
    pub key_fn: Option<KeyFn>,
}

impl EndpointConfig {
    pub fn new(path: impl Into<String>, limiter: Arc<dyn Limiter>) -> Self {
        Self {
            path: path.into(),
            limiter,
            key_fn: None,
        }
    }

    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = Some(key_fn);
        self
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("path", &self.path)
            .field("custom_key", &self.key_fn.is_some())
            .finish()
    }
}

#[derive(Clone)]
struct Settings {
    limiter: Arc<dyn Limiter>,
    key_fn: KeyFn,
    skip: Option<SkipFn>,
    on_limit: Option<LimitResponder>,
    on_error: Option<ErrorHook>,
    endpoints: Vec<EndpointConfig>,
}

impl Settings {
    /// First endpoint whose path equals `path`, else the defaults
    fn route(&self, path: &str) -> (&Arc<dyn Limiter>, &KeyFn) {
        match self.endpoints.iter().find(|ep| ep.path == path) {
            Some(ep) => (&ep.limiter, ep.key_fn.as_ref().unwrap_or(&self.key_fn)),
            None => (&self.limiter, &self.key_fn),
        }
    }
}

/// Applies per-key rate limits to HTTP requests.
///
/// Every checked request gets `X-RateLimit-Limit`, `X-RateLimit-Remaining`
/// and `X-RateLimit-Reset` headers; denied requests get `429 Too Many
/// Requests` with `Retry-After`. Requests whose key is empty pass through
/// untouched. If the limiter itself errors the request is forwarded without
/// headers (fail open).
#[derive(Clone)]
pub struct RateLimitLayer {
    settings: Settings,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<dyn Limiter>, key_fn: KeyFn) -> Self {
        Self {
            settings: Settings {
                limiter,
                key_fn,
                skip: None,
                on_limit: None,
                on_error: None,
                endpoints: Vec::new(),
            },
        }
    }

    /// Bypass rate limiting for requests matching `skip`
    pub fn skip_if<F>(mut self, skip: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.settings.skip = Some(Arc::new(skip));
        self
    }

    /// Replace the default 429 response. Rate limit headers and `Retry-After`
    /// are still added to whatever `responder` returns.
    pub fn on_limit<F>(mut self, responder: F) -> Self
    where
        F: Fn(&RateLimitStatus) -> Response + Send + Sync + 'static,
    {
        self.settings.on_limit = Some(Arc::new(responder));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RateLimiterError) + Send + Sync + 'static,
    {
        self.settings.on_error = Some(Arc::new(hook));
        self
    }

    /// Add a per-path limiter. Paths match exactly; the first match wins.
    pub fn endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.settings.endpoints.push(endpoint);
        self
    }
}

impl fmt::Debug for RateLimitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("endpoints", &self.settings.endpoints)
            .field("skip", &self.settings.skip.is_some())
            .field("on_limit", &self.settings.on_limit.is_some())
            .field("on_error", &self.settings.on_error.is_some())
            .finish()
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            settings: Arc::new(self.settings.clone()),
        }
    }
}

/// Service produced by [`RateLimitLayer`]
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    settings: Arc<Settings>,
}

impl<S: fmt::Debug> fmt::Debug for RateLimitService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .finish()
    }
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Take the service that was driven to readiness and leave a fresh clone
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let settings = Arc::clone(&self.settings);

        Box::pin(async move {
            if settings.skip.as_ref().is_some_and(|skip| skip(&req)) {
                return inner.call(req).await;
            }

            let (limiter, key_fn) = settings.route(req.uri().path());
            let key = key_fn(&req);
            if key.is_empty() {
                return inner.call(req).await;
            }

            let status = match limiter.allow(&key).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(key = %key, error = %e, "Rate limiter failed, allowing request");
                    if let Some(hook) = &settings.on_error {
                        hook(&e);
                    }
                    return inner.call(req).await;
                }
            };

            if status.allowed {
                let mut response = inner.call(req).await?;
                set_rate_limit_headers(response.headers_mut(), &status);
                return Ok(response);
            }

            debug!(key = %key, limit = status.limit, "Request rate limited");
            let mut response = match &settings.on_limit {
                Some(responder) => responder(&status),
                None => too_many_requests(),
            };
            set_rate_limit_headers(response.headers_mut(), &status);
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(&status)));
            Ok(response)
        })
    }
}

fn too_many_requests() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, Body::from("Too Many Requests")).into_response()
}

fn set_rate_limit_headers(headers: &mut HeaderMap, status: &RateLimitStatus) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(status.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(status.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(status.reset_at.timestamp()));
}

/// Whole seconds until `reset_at`, rounded up and never below 1
fn retry_after_secs(status: &RateLimitStatus) -> i64 {
    let millis = status.retry_after().num_milliseconds();
    (millis.saturating_add(999) / 1000).max(1)
}
