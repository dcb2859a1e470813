//! Three-tier rate limiting for the control-plane HTTP API: global, per-client,
//! and per-endpoint, each backed by [`fc_harness::rate_limiter::MultiKeyRateLimiter`].
//! Exceeding any tier returns 429 with a `Retry-After` header.

use axum::{
    body::Body,
    extract::Request,
    http::{Response, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::warn;

use fc_core::config::RateLimitConfig as ConfigRateLimits;
use fc_harness::rate_limiter::{MultiKeyRateLimiter, RateLimitConfig, RateLimitError};

pub fn limiter_from_config(config: &ConfigRateLimits) -> MultiKeyRateLimiter {
    MultiKeyRateLimiter::new(
        RateLimitConfig::per_minute(config.global_requests_per_minute),
        RateLimitConfig::per_minute(config.per_user_requests_per_minute),
        RateLimitConfig::per_minute(config.per_endpoint_requests_per_minute),
    )
}

#[derive(Clone)]
pub struct RateLimitLayer {
    rate_limiter: Arc<MultiKeyRateLimiter>,
}

impl RateLimitLayer {
    pub fn new(rate_limiter: Arc<MultiKeyRateLimiter>) -> Self {
        Self { rate_limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware { inner, rate_limiter: self.rate_limiter.clone() }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    rate_limiter: Arc<MultiKeyRateLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let rate_limiter = self.rate_limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let client_ip = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.split(',').next())
                .map(|s| s.trim().to_string())
                .or_else(|| req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()).map(|s| s.to_string()))
                .unwrap_or_else(|| "unknown".to_string());

            let endpoint = req.uri().path().to_string();

            match rate_limiter.check_all(&client_ip, &endpoint) {
                Ok(()) => inner.call(req).await,
                Err(err) => {
                    warn!(client_ip, endpoint, error = %err, "rate limit exceeded");
                    let retry_after_secs = match err {
                        RateLimitError::Exceeded { retry_after, .. } => retry_after.as_secs().max(1),
                    };
                    let resp = (
                        StatusCode::TOO_MANY_REQUESTS,
                        [("Retry-After", retry_after_secs.to_string())],
                        axum::Json(serde_json::json!({
                            "error": "rate_limit_exceeded",
                            "message": err.to_string(),
                            "retry_after": retry_after_secs
                        })),
                    )
                        .into_response();
                    Ok(resp)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn test_router(rate_limiter: Arc<MultiKeyRateLimiter>) -> Router {
        Router::new().route("/ping", get(|| async { "pong" })).layer(RateLimitLayer::new(rate_limiter))
    }

    #[tokio::test]
    async fn allows_requests_within_limit() {
        let limiter = Arc::new(MultiKeyRateLimiter::new(
            RateLimitConfig::per_second(100),
            RateLimitConfig::per_second(10),
            RateLimitConfig::per_second(5),
        ));
        let app = test_router(limiter);

        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_requests_exceeding_limit() {
        let limiter = Arc::new(MultiKeyRateLimiter::new(
            RateLimitConfig::per_second(100),
            RateLimitConfig::per_second(100),
            RateLimitConfig::per_second(2),
        ));
        let app = test_router(limiter);

        for _ in 0..2 {
            let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key("retry-after"));
    }
}
