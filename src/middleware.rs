//! Tower middleware that gates requests through a [`RateLimiter`].
//!
//! The layer extracts a rate-limit key from each request and applies the
//! synchronous check before the inner service runs. Because the check never
//! suspends, a denied request costs nothing beyond the key extraction; the
//! inner future is never constructed.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower_layer::Layer;
use tower_service::Service;

use crate::limiter::RateLimiter;

/// A layer that enforces a limit using a shared [`RateLimiter`].
#[derive(Clone)]
pub struct GateLayer<K> {
    limiter: RateLimiter,
    limit: f64,
    key_of: K,
}

impl<K> GateLayer<K> {
    /// Gate requests at `limit` requests/second per key, where `key_of`
    /// extracts the key from each request.
    pub fn new(limiter: RateLimiter, limit: f64, key_of: K) -> Self {
        Self { limiter, limit, key_of }
    }
}

impl<S, K: Clone> Layer<S> for GateLayer<K> {
    type Service = GateService<S, K>;

    fn layer(&self, inner: S) -> Self::Service {
        GateService {
            inner,
            limiter: self.limiter.clone(),
            limit: self.limit,
            key_of: self.key_of.clone(),
        }
    }
}

/// Middleware service that rejects over-limit requests before the inner call.
#[derive(Clone)]
pub struct GateService<S, K> {
    inner: S,
    limiter: RateLimiter,
    limit: f64,
    key_of: K,
}

impl<S, K, Req> Service<Req> for GateService<S, K>
where
    S: Service<Req>,
    S::Future: Send + 'static,
    K: Fn(&Req) -> Vec<u8>,
{
    type Response = S::Response;
    type Error = GateError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.key_of)(&req);
        if self.limiter.check(&key, self.limit) {
            let fut = self.inner.call(req);
            Box::pin(async move { fut.await.map_err(GateError::Inner) })
        } else {
            Box::pin(async move { Err(GateError::Limited { key }) })
        }
    }
}

/// Error returned by [`GateService`].
#[derive(Debug)]
pub enum GateError<E> {
    /// The key's global rate currently exceeds the limit
    Limited { key: Vec<u8> },
    /// The inner service failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited { key } => {
                write!(f, "rate limited: key {:?}", String::from_utf8_lossy(key))
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> GateError<E> {
    /// Check if this error is a rate-limit rejection
    pub fn is_limited(&self) -> bool {
        matches!(self, Self::Limited { .. })
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
