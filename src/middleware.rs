//! Tower middleware enforcing admission decisions.
//!
//! ```rust
//! use floodgate::prelude::*;
//! use tower::{ServiceBuilder, service_fn};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = TokenBucket::new(10.0, 20)?;
//! let svc = ServiceBuilder::new()
//!     .layer(AdmissionLayer::new(limiter).key_strategy(KeyStrategy::identity()))
//!     .service(service_fn(|_req: RequestInfo| async { Ok::<_, std::io::Error>("ok") }));
//! # let _ = svc;
//! # Ok(())
//! # }
//! ```

use crate::clock::{Clock, SystemClock};
use crate::error::{AdmissionError, Rejection};
use crate::key::{AdmissionContext, KeyStrategy};
use crate::limiter::RateLimiter;
use crate::telemetry::{AdmissionEvent, SinkHandle, TelemetrySink};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Predicate deciding that a request bypasses admission entirely.
pub type SkipPredicate = Arc<dyn Fn(&dyn AdmissionContext) -> bool + Send + Sync>;

/// A layer that gates requests through a [`RateLimiter`].
pub struct AdmissionLayer<L> {
    limiter: Arc<L>,
    strategy: KeyStrategy,
    skip: Option<SkipPredicate>,
    sink: SinkHandle,
    clock: Arc<dyn Clock>,
}

impl<L> Clone for AdmissionLayer<L> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            strategy: self.strategy.clone(),
            skip: self.skip.clone(),
            sink: self.sink.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<L> std::fmt::Debug for AdmissionLayer<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionLayer")
            .field("strategy", &self.strategy)
            .field("skip", &self.skip.is_some())
            .field("sink", &self.sink)
            .finish()
    }
}

impl<L: RateLimiter> AdmissionLayer<L> {
    /// Create a layer keyed by peer address.
    pub fn new(limiter: L) -> Self {
        Self::from_shared(Arc::new(limiter))
    }

    /// Create a layer over a limiter shared with other layers or a sweeper.
    pub fn from_shared(limiter: Arc<L>) -> Self {
        Self {
            limiter,
            strategy: KeyStrategy::default(),
            skip: None,
            sink: SinkHandle::none(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Forward requests matching `predicate` without consulting the limiter.
    pub fn skip_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&dyn AdmissionContext) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(predicate));
        self
    }

    /// Notify `sink` of every rejection.
    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.sink = SinkHandle::new(sink);
        self
    }

    /// Override the clock used for `Retry-After` (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }
}

impl<S, L> Layer<S> for AdmissionLayer<L> {
    type Service = AdmissionService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            limiter: self.limiter.clone(),
            strategy: Arc::new(self.strategy.clone()),
            skip: self.skip.clone(),
            sink: self.sink.clone(),
            clock: self.clock.clone(),
        }
    }
}

/// Middleware service that enforces admission decisions.
pub struct AdmissionService<S, L> {
    inner: S,
    limiter: Arc<L>,
    strategy: Arc<KeyStrategy>,
    skip: Option<SkipPredicate>,
    sink: SinkHandle,
    clock: Arc<dyn Clock>,
}

impl<S: Clone, L> Clone for AdmissionService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            strategy: self.strategy.clone(),
            skip: self.skip.clone(),
            sink: self.sink.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S, L> AdmissionService<S, L> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: std::fmt::Debug, L> std::fmt::Debug for AdmissionService<S, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionService")
            .field("inner", &self.inner)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl<S, L, Req> Service<Req> for AdmissionService<S, L>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    L: RateLimiter + 'static,
    Req: AdmissionContext + Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, mut req: Req) -> Self::Future {
        // The clone may not be ready; keep the instance that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = self.limiter.clone();
        let strategy = self.strategy.clone();
        let skip = self.skip.clone();
        let sink = self.sink.clone();
        let clock = self.clock.clone();

        Box::pin(async move {
            if skip.is_some_and(|skip| skip(&req)) {
                tracing::trace!(target: "floodgate::middleware", "admission skipped");
                return inner.call(req).await.map_err(AdmissionError::Inner);
            }

            let key = strategy.subject_key(&req);
            let decision = limiter.check(&key).await;
            if decision.allowed {
                req.annotate(&decision);
                return inner.call(req).await.map_err(AdmissionError::Inner);
            }

            tracing::info!(
                target: "floodgate::middleware",
                key = %key,
                cause = %decision.cause,
                limit = decision.limit,
                "request rejected"
            );
            sink.emit(AdmissionEvent::Rejected {
                key: key.clone(),
                cause: decision.cause,
                limit: decision.limit,
                reset_at_millis: decision.reset_at_millis,
            })
            .await;
            Err(AdmissionError::Rejected(Rejection {
                key,
                decision,
                now_millis: clock.now_millis(),
            }))
        })
    }
}
