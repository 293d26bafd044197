//! Rate limiting middleware for HTTP requests.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::ConnectInfo;
use chrono::Utc;
use http::{Request, Response};
use tower::Layer;
use tracing::{debug, warn};

use super::response::{DefaultResponder, OutcomeResponder};
use crate::config::EffectiveConfig;
use crate::ratelimit::{Decision, LimitKey, RateLimiter};

/// Header carrying the caller's API token.
pub const API_KEY_HEADER: &str = "api_key";

/// Identity used when neither a token nor a peer address is available.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Tower layer that admits or rejects requests before they reach the inner service.
#[derive(Clone)]
pub struct RateLimitLayer {
    config: Arc<EffectiveConfig>,
    limiter: RateLimiter,
    responder: Arc<dyn OutcomeResponder>,
}

impl RateLimitLayer {
    /// Create a layer with the default responses.
    pub fn new(config: Arc<EffectiveConfig>) -> Self {
        let limiter = RateLimiter::from_config(&config);
        Self {
            config,
            limiter,
            responder: Arc::new(DefaultResponder),
        }
    }

    /// Replace the component rendering blocked and failed requests.
    pub fn with_responder(mut self, responder: Arc<dyn OutcomeResponder>) -> Self {
        self.responder = responder;
        self
    }
}

impl<Service> Layer<Service> for RateLimitLayer {
    type Service = RateLimitService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        RateLimitService {
            next,
            config: self.config.clone(),
            limiter: self.limiter.clone(),
            responder: self.responder.clone(),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<Service> {
    next: Service,
    config: Arc<EffectiveConfig>,
    limiter: RateLimiter,
    responder: Arc<dyn OutcomeResponder>,
}

impl<Service, ReqBody> tower::Service<Request<ReqBody>> for RateLimitService<Service>
where
    Service: tower::Service<Request<ReqBody>, Response = Response<Body>> + Clone + Send + 'static,
    Service::Future: Send,
    Service::Error: 'static,
    ReqBody: Send + 'static,
{
    type Response = Response<Body>;
    type Error = Service::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Keep the instance that was polled ready and leave a fresh clone behind.
        let clone = self.next.clone();
        let mut next = std::mem::replace(&mut self.next, clone);
        let config = self.config.clone();
        let limiter = self.limiter.clone();
        let responder = self.responder.clone();

        Box::pin(async move {
            let key = extract_limit_key(&req);
            let (rate_config, is_custom) = config.rate_config_for(&key);

            if config.debug && is_custom {
                debug!(identity = %key.identity, "Applying custom token rate limit");
            }

            match limiter.check(&key, &rate_config).await {
                Ok(Decision::Allowed) => next.call(req).await,
                Ok(Decision::Blocked { until }) => Ok(responder.blocked(until, Utc::now())),
                Err(err) => {
                    warn!(key = %key, error = %err, "Rate limit check failed");
                    Ok(responder.error(&err))
                }
            }
        })
    }
}

/// Pick the key a request is limited under.
///
/// A non-empty `API_KEY` header selects the token scope; otherwise the peer
/// address recorded by axum's `ConnectInfo` is used.
pub fn extract_limit_key<B>(req: &Request<B>) -> LimitKey {
    let token = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|token| !token.is_empty());

    if let Some(token) = token {
        return LimitKey::token(token);
    }

    match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => LimitKey::ip(addr.ip().to_string()),
        None => LimitKey::ip(UNKNOWN_IDENTITY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::convert::Infallible;

    use async_trait::async_trait;
    use chrono::DateTime;
    use http::StatusCode;
    use tower::{service_fn, ServiceExt};

    use crate::config::{resolve_with, EnvOverrides, LimiterConfig, PartialRateConfig};
    use crate::error::StorageError;
    use crate::middleware::{INTERNAL_ERROR_MESSAGE, RATE_LIMITED_MESSAGE};
    use crate::ratelimit::{RateLimitStore, Scope};

    struct FailingStore;

    #[async_trait]
    impl RateLimitStore for FailingStore {
        async fn observe_and_maybe_block(
            &self,
            _key: &LimitKey,
            _now: DateTime<Utc>,
            _window_millis: u64,
            _max_requests: u64,
            _block_millis: u64,
        ) -> Result<Option<DateTime<Utc>>, StorageError> {
            Err(StorageError::Query("boom".to_string()))
        }

        async fn clear(&self, _key: &LimitKey) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn partial(max: u64, block: u64) -> Option<PartialRateConfig> {
        Some(PartialRateConfig {
            max_requests_per_second: Some(max),
            block_duration_millis: Some(block),
        })
    }

    fn layer(input: LimiterConfig) -> RateLimitLayer {
        let config = resolve_with(Some(input), &EnvOverrides::default()).unwrap();
        RateLimitLayer::new(Arc::new(config))
    }

    fn request(peer: &str, token: Option<&str>) -> Request<Body> {
        let addr: SocketAddr = peer.parse().unwrap();
        let mut builder = Request::builder().uri("/").extension(ConnectInfo(addr));
        if let Some(token) = token {
            builder = builder.header("API_KEY", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn send(layer: &RateLimitLayer, req: Request<Body>) -> (StatusCode, String, Option<String>) {
        let service = layer.layer(service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(Response::new(Body::from("DONE")))
        }));

        let response = service.oneshot(req).await.unwrap();
        let status = response.status();
        let retry_after = response
            .headers()
            .get(http::header::RETRY_AFTER)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

        (status, String::from_utf8(body.to_vec()).unwrap(), retry_after)
    }

    #[tokio::test]
    async fn test_allowed_request_reaches_inner_service() {
        let layer = layer(LimiterConfig {
            ip: partial(10, 100),
            ..Default::default()
        });

        let (status, body, _) = send(&layer, request("127.0.0.1:5000", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "DONE");
    }

    #[tokio::test]
    async fn test_ip_over_limit_is_rejected() {
        let layer = layer(LimiterConfig {
            ip: partial(2, 5000),
            ..Default::default()
        });

        for _ in 0..2 {
            let (status, _, _) = send(&layer, request("10.1.1.1:5000", None)).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, body, retry_after) = send(&layer, request("10.1.1.1:6000", None)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body, RATE_LIMITED_MESSAGE);
        assert_eq!(retry_after.as_deref(), Some("5"));

        // Another address is unaffected
        let (status, _, _) = send(&layer, request("10.1.1.2:5000", None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_token_uses_token_limits() {
        let layer = layer(LimiterConfig {
            ip: partial(0, 1000),
            token: partial(1, 1000),
            ..Default::default()
        });

        let (status, _, _) = send(&layer, request("10.2.2.2:5000", Some("abc"))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = send(&layer, request("10.2.2.2:5000", Some("abc"))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        let (status, _, _) = send(&layer, request("10.2.2.2:5000", None)).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_custom_token_limits() {
        let layer = layer(LimiterConfig {
            token: partial(1, 1000),
            custom_tokens: HashMap::from([("premium".to_string(), partial(3, 1000))]),
            debug: Some(true),
            ..Default::default()
        });

        for _ in 0..3 {
            let (status, _, _) = send(&layer, request("10.3.3.3:5000", Some("premium"))).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, _, _) = send(&layer, request("10.3.3.3:5000", Some("premium"))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_storage_error_renders_internal_error() {
        let layer = layer(LimiterConfig {
            storage: Some(Arc::new(FailingStore)),
            ..Default::default()
        });

        let (status, body, _) = send(&layer, request("127.0.0.1:5000", None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, INTERNAL_ERROR_MESSAGE);
    }

    #[tokio::test]
    async fn test_custom_responder() {
        struct Teapot;

        impl OutcomeResponder for Teapot {
            fn blocked(&self, _until: DateTime<Utc>, _now: DateTime<Utc>) -> Response<Body> {
                let mut response = Response::new(Body::from("slow down"));
                *response.status_mut() = StatusCode::IM_A_TEAPOT;
                response
            }

            fn error(&self, _error: &StorageError) -> Response<Body> {
                Response::new(Body::empty())
            }
        }

        let layer = layer(LimiterConfig {
            ip: partial(0, 1000),
            ..Default::default()
        })
        .with_responder(Arc::new(Teapot));

        let (status, body, _) = send(&layer, request("127.0.0.1:5000", None)).await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);
        assert_eq!(body, "slow down");
    }

    #[test]
    fn test_extract_limit_key() {
        let key = extract_limit_key(&request("192.168.0.7:443", None));
        assert_eq!(key, LimitKey::ip("192.168.0.7"));

        let key = extract_limit_key(&request("192.168.0.7:443", Some("abc")));
        assert_eq!(key.scope, Scope::Token);
        assert_eq!(key.identity, "abc");

        let key = extract_limit_key(&request("192.168.0.7:443", Some("")));
        assert_eq!(key.scope, Scope::Ip);

        let bare = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(extract_limit_key(&bare), LimitKey::ip(UNKNOWN_IDENTITY));
    }
}
