//! Tower middleware that shapes traffic per source.
//!
//! Every request is charged against the token bucket of its source. Requests
//! that fit within the bucket pass straight through; requests that need to
//! wait for a refill are held for that long and then forwarded; requests that
//! would need to wait longer than the policy tolerates are rejected with
//! `429 Too Many Requests`.

use futures::future::BoxFuture;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::bucket::TokenBucket;
use super::policy::ShapingPolicy;
use super::source::{RemoteAddrExtractor, SourceExtractor};
use super::store::{TtlStore, MAX_SOURCES};
use crate::config::ShapingConfig;
use crate::error::Result;

/// Store of per-source token buckets.
pub type BucketStore = TtlStore<Arc<TokenBucket>>;

/// Layer that wraps a service in [`Shaping`].
///
/// All services produced by one layer share the same bucket store.
pub struct ShapingLayer<E = RemoteAddrExtractor> {
    shaper: Arc<Shaper<E>>,
}

impl ShapingLayer {
    /// Build the middleware from configuration, with a fresh store of
    /// [`MAX_SOURCES`] slots.
    pub fn new(config: &ShapingConfig, name: impl Into<String>) -> Result<Self> {
        let buckets = Arc::new(BucketStore::new(MAX_SOURCES)?);
        Self::with_store(config, name, buckets)
    }

    /// Build the middleware around an existing bucket store.
    pub fn with_store(
        config: &ShapingConfig,
        name: impl Into<String>,
        buckets: Arc<BucketStore>,
    ) -> Result<Self> {
        ShapingLayer::with_extractor(config, name, buckets, RemoteAddrExtractor)
    }
}

impl<E: SourceExtractor> ShapingLayer<E> {
    /// Build the middleware with a custom source extractor.
    pub fn with_extractor(
        config: &ShapingConfig,
        name: impl Into<String>,
        buckets: Arc<BucketStore>,
        extractor: E,
    ) -> Result<Self> {
        let name = name.into();
        let policy = ShapingPolicy::from_config(config)?;

        info!(
            middleware = %name,
            rate = policy.rate(),
            burst = policy.burst(),
            max_delay = ?policy.max_delay(),
            ttl = ?policy.ttl(),
            "Request shaper created"
        );

        Ok(Self {
            shaper: Arc::new(Shaper {
                name,
                policy,
                buckets,
                extractor,
            }),
        })
    }

    /// The policy applied to every source.
    pub fn policy(&self) -> &ShapingPolicy {
        &self.shaper.policy
    }

    /// The store holding per-source buckets.
    pub fn buckets(&self) -> &Arc<BucketStore> {
        &self.shaper.buckets
    }
}

impl<E> Clone for ShapingLayer<E> {
    fn clone(&self) -> Self {
        Self {
            shaper: self.shaper.clone(),
        }
    }
}

impl<S, E> Layer<S> for ShapingLayer<E> {
    type Service = Shaping<S, E>;

    fn layer(&self, inner: S) -> Self::Service {
        Shaping {
            inner,
            shaper: self.shaper.clone(),
        }
    }
}

/// Service that shapes requests before handing them to `inner`.
pub struct Shaping<S, E = RemoteAddrExtractor> {
    inner: S,
    shaper: Arc<Shaper<E>>,
}

impl<S: Clone, E> Clone for Shaping<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shaper: self.shaper.clone(),
        }
    }
}

impl<S, E, ReqBody, ResBody> Service<Request<ReqBody>> for Shaping<S, E>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<&'static str> + Send + 'static,
    E: SourceExtractor,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        // The reservation is taken now; only the waits happen in the future
        let decision = self.shaper.decide(&request);
        let span = debug_span!("shaping", middleware = %self.shaper.name);

        Box::pin(
            async move {
                match decision {
                    Decision::Forward { delay } => {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        inner.call(request).await
                    }
                    Decision::Reject(rejection) => {
                        let wait = rejection.wait();
                        if !wait.is_zero() {
                            tokio::time::sleep(wait).await;
                        }
                        Ok(rejection.into_response())
                    }
                }
            }
            .instrument(span),
        )
    }
}

/// State shared by every service built from one layer.
struct Shaper<E> {
    name: String,
    policy: ShapingPolicy,
    buckets: Arc<BucketStore>,
    extractor: E,
}

impl<E: SourceExtractor> Shaper<E> {
    fn decide<B>(&self, request: &Request<B>) -> Decision {
        if self.policy.is_unlimited() {
            return Decision::Forward {
                delay: Duration::ZERO,
            };
        }

        let source = match self.extractor.extract(request) {
            Ok(source) => source,
            Err(e) => {
                warn!(middleware = %self.name, error = %e, "Rejecting request without a source");
                return Decision::Reject(Rejection::SourceUnknown);
            }
        };

        if self.policy.excluded().contains(&source) {
            trace!(source = %source, "Source excluded from shaping");
            return Decision::Forward {
                delay: Duration::ZERO,
            };
        }

        self.decide_for(&source)
    }

    fn decide_for(&self, source: &str) -> Decision {
        // Fetching and refreshing in one step keeps the last-seen time current
        // and gives concurrent first requests from a source the same bucket.
        let ttl = self.policy.ttl();
        let new_bucket = || Arc::new(self.policy.new_bucket());
        let bucket = match self.buckets.touch_or_insert_with(source, ttl, new_bucket) {
            Ok(bucket) => bucket,
            Err(e) => {
                warn!(
                    middleware = %self.name,
                    source = %source,
                    error = %e,
                    "Could not track source"
                );
                return Decision::Reject(Rejection::StoreFull);
            }
        };

        let reservation = bucket.reserve();
        if !reservation.is_ok() {
            debug!(source = %source, burst = bucket.burst(), "Reservation exceeds burst");
            return Decision::Reject(Rejection::BurstExceeded);
        }

        let delay = reservation.delay();
        if delay > self.policy.max_delay() {
            reservation.cancel();
            debug!(
                source = %source,
                delay = ?delay,
                max_delay = ?self.policy.max_delay(),
                "Rate exceeded"
            );
            return Decision::Reject(Rejection::DelayExceeded {
                wait: self.policy.exceed_wait(),
            });
        }

        let delay = reservation.commit();
        trace!(source = %source, delay = ?delay, "Request admitted");
        Decision::Forward { delay }
    }
}

/// Outcome of shaping one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    /// Hold the request for `delay`, then forward it
    Forward { delay: Duration },
    /// Answer with an error response
    Reject(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    /// The request's source could not be determined
    SourceUnknown,
    /// The bucket store had no room for the source
    StoreFull,
    /// The request costs more than the bucket can ever hold
    BurstExceeded,
    /// The required delay is above the tolerated maximum
    DelayExceeded { wait: Duration },
}

impl Rejection {
    fn status(&self) -> StatusCode {
        match self {
            Rejection::SourceUnknown | Rejection::StoreFull => StatusCode::INTERNAL_SERVER_ERROR,
            Rejection::BurstExceeded | Rejection::DelayExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
        }
    }

    fn message(&self) -> &'static str {
        match self {
            Rejection::SourceUnknown => "could not extract source of request",
            Rejection::StoreFull => "could not insert/update bucket",
            Rejection::BurstExceeded => "No bursty traffic allowed",
            Rejection::DelayExceeded { .. } => "Too Many Requests",
        }
    }

    /// Time to hold the request before responding.
    fn wait(&self) -> Duration {
        match self {
            Rejection::DelayExceeded { wait } => *wait,
            _ => Duration::ZERO,
        }
    }

    fn into_response<B: From<&'static str>>(self) -> Response<B> {
        let mut response = Response::new(B::from(self.message()));
        *response.status_mut() = self.status();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}
