//! Query client: the public entry point turning a query intent into a
//! cancellable handle.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use crate::cache::{RequestCache, Waiter, WaiterId};
use crate::config::{CancelHintPolicy, ClientConfig, ErrorPolicy};
use crate::definition::QueryDefinition;
use crate::error::ClientError;
use crate::key::QueryString;
use crate::raw::RawResult;
use crate::registry::QueryRegistry;
use crate::tracer::{CancelKind, NoopTracer, Tracer};
use crate::transform::{MemoStatus, TransformCache};
use crate::transport::{ServerMessage, Transport, TransportAdapter};

/// The query client.
///
/// Resolves named queries through the registry, deduplicates them through
/// the request cache, sends what needs sending, and hands back
/// [`QueryHandle`]s. One client per session; it is cheap to clone.
///
/// # Example
///
/// ```ignore
/// let (transport, outbound) = ChannelTransport::new();
/// let client = QueryClient::new(registry, transport);
///
/// let handle = client.query::<TotalTrips>(())?;
/// tokio::spawn({
///     let adapter = client.transport().clone();
///     async move { adapter.run(inbound).await }
/// });
/// let total = handle.await;
/// ```
#[derive(Clone)]
pub struct QueryClient {
    registry: Arc<QueryRegistry>,
    cache: Arc<RequestCache>,
    transforms: Arc<TransformCache>,
    transport: TransportAdapter,
    tracer: Arc<dyn Tracer>,
    config: Arc<ClientConfig>,
}

impl QueryClient {
    /// Create a client with default settings.
    pub fn new(registry: impl Into<Arc<QueryRegistry>>, transport: impl Transport) -> Self {
        Self::builder().build(registry, transport)
    }

    /// Create a builder for customizing the client.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let client = QueryClient::builder()
    ///     .error_policy(ErrorPolicy::RetryOnAcquire)
    ///     .cancel_hint(CancelHintPolicy::LastWaiter)
    ///     .build(registry, transport);
    /// ```
    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::new()
    }

    /// Request a registered query.
    ///
    /// Fails immediately with [`ClientError::UnknownQuery`] if `D` is not
    /// registered. Otherwise at most one execute message is sent per distinct
    /// query string: an in-flight request is joined and a completed one is
    /// replayed.
    pub fn query<D: QueryDefinition>(
        &self,
        args: D::Args,
    ) -> Result<QueryHandle<D::Output>, ClientError> {
        let definition = self.registry.resolve_typed::<D>()?;
        let query_string = QueryString::from(definition.query_string(&args));
        Ok(self.typed_handle(definition, query_string, args))
    }

    /// Request a query by name with JSON arguments, receiving JSON output.
    pub fn query_by_name(
        &self,
        name: &str,
        args: Value,
    ) -> Result<QueryHandle<Value>, ClientError> {
        let definition = self.registry.resolve(name)?;
        let query_string = definition.query_string_json(&args)?;
        let transforms = self.transforms.clone();
        let tracer = self.tracer.clone();
        Ok(self.issue(query_string, move |key, raw| {
            let (value, status) =
                transforms.get_or_compute(key, raw, |raw| definition.transform_json(raw, &args));
            tracer.on_transform(key, status == MemoStatus::Hit);
            value
        }))
    }

    /// Request a query on behalf of a view slot, withdrawing whatever the
    /// slot was previously waiting for.
    ///
    /// If the previous request had the same query string it is withdrawn
    /// without an upstream cancel hint, so the shared fetch continues and the
    /// new handle joins it.
    pub fn query_in_slot<D: QueryDefinition>(
        &self,
        slot: &mut QuerySlot,
        args: D::Args,
    ) -> Result<QueryHandle<D::Output>, ClientError> {
        let definition = self.registry.resolve_typed::<D>()?;
        let query_string = QueryString::from(definition.query_string(&args));
        if let Some(previous) = slot.current.take() {
            if previous.query_string() == &query_string {
                previous.withdraw(false);
            } else {
                previous.cancel();
            }
        }
        let handle = self.typed_handle(definition, query_string, args);
        slot.current = Some(handle.canceller());
        Ok(handle)
    }

    fn typed_handle<D: QueryDefinition>(
        &self,
        definition: Arc<D>,
        query_string: QueryString,
        args: D::Args,
    ) -> QueryHandle<D::Output> {
        let transforms = self.transforms.clone();
        let tracer = self.tracer.clone();
        self.issue(query_string, move |key, raw| {
            let (value, status) =
                transforms.get_or_compute(key, raw, |raw| definition.transform(raw, &args));
            tracer.on_transform(key, status == MemoStatus::Hit);
            value
        })
    }

    fn issue<T, F>(&self, query_string: QueryString, transform: F) -> QueryHandle<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&QueryString, &Arc<RawResult>) -> Arc<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let waiter: Waiter = {
            let cancelled = cancelled.clone();
            let key = query_string.clone();
            Box::new(move |raw| {
                let value = transform(&key, &raw);
                if !cancelled.load(Ordering::Acquire) {
                    // The receiver may be gone; nobody is listening then.
                    let _ = tx.send(value);
                }
            })
        };

        let acquired = self.cache.acquire(&query_string, waiter);
        self.tracer.on_acquire(&query_string, acquired.kind());
        if acquired.must_send() {
            if let Err(err) = self.transport.send(&query_string) {
                warn!(query = %query_string, %err, "send failed; query stays in flight until resent");
            }
        }

        let canceller = Canceller {
            inner: Arc::new(CancelState {
                cancelled,
                query_string,
                waiter: acquired.waiter(),
                cache: self.cache.clone(),
                transport: self.transport.clone(),
                tracer: self.tracer.clone(),
                cancel_hint: self.config.cancel_hint,
            }),
        };
        QueryHandle {
            rx,
            canceller,
            resolved: false,
        }
    }

    /// Feed a result as if it had arrived from the transport.
    pub fn deliver(&self, query_string: &QueryString, raw: RawResult) -> usize {
        self.transport.handle_message(ServerMessage::Result {
            query_string: query_string.clone(),
            rows: raw,
            query_time: None,
        })
    }

    /// The registry.
    pub fn registry(&self) -> &Arc<QueryRegistry> {
        &self.registry
    }

    /// The request cache.
    pub fn cache(&self) -> &Arc<RequestCache> {
        &self.cache
    }

    /// The transform cache.
    pub fn transforms(&self) -> &Arc<TransformCache> {
        &self.transforms
    }

    /// The transport adapter, for wiring up the inbound side.
    pub fn transport(&self) -> &TransportAdapter {
        &self.transport
    }

    /// The configuration the client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("transforms", &self.transforms)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder {
    config: ClientConfig,
    tracer: Arc<dyn Tracer>,
}

impl Default for QueryClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the handling of cached backend errors.
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.config.error_policy = policy;
        self
    }

    /// Set when cancellation sends the upstream hint.
    pub fn cancel_hint(mut self, policy: CancelHintPolicy) -> Self {
        self.config.cancel_hint = policy;
        self
    }

    /// Install a tracer.
    pub fn tracer<T: Tracer>(mut self, tracer: T) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Build the client with fresh caches.
    pub fn build(
        self,
        registry: impl Into<Arc<QueryRegistry>>,
        transport: impl Transport,
    ) -> QueryClient {
        let cache = Arc::new(RequestCache::new(self.config.error_policy));
        let transport = TransportAdapter::new(Arc::new(transport), cache.clone(), self.tracer.clone());
        QueryClient {
            registry: registry.into(),
            cache,
            transforms: Arc::new(TransformCache::new()),
            transport,
            tracer: self.tracer,
            config: Arc::new(self.config),
        }
    }
}

struct CancelState {
    cancelled: Arc<AtomicBool>,
    query_string: QueryString,
    /// `None` when the result was replayed and nothing was queued.
    waiter: Option<WaiterId>,
    cache: Arc<RequestCache>,
    transport: TransportAdapter,
    tracer: Arc<dyn Tracer>,
    cancel_hint: CancelHintPolicy,
}

/// Cancels a [`QueryHandle`]. Cloneable, so a view can keep one while the
/// handle itself is being awaited.
#[derive(Clone)]
pub struct Canceller {
    inner: Arc<CancelState>,
}

impl Canceller {
    /// Cancel the handle.
    ///
    /// The handle will never resolve. If it was still waiting, its waiter is
    /// withdrawn and, depending on [`CancelHintPolicy`], a cancel hint is sent
    /// upstream. Other waiters on the same query string are unaffected and the
    /// result is still cached when it arrives. Cancelling twice is a no-op.
    pub fn cancel(&self) {
        self.withdraw(true);
    }

    fn withdraw(&self, allow_hint: bool) {
        let state = &*self.inner;
        if state.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(waiter) = state.waiter else {
            return;
        };
        let Some(withdrawn) = state.cache.cancel_waiter(&state.query_string, waiter) else {
            return;
        };

        let send_hint = allow_hint
            && match state.cancel_hint {
                CancelHintPolicy::Always => true,
                CancelHintPolicy::LastWaiter => withdrawn.remaining == 0,
            };
        if send_hint {
            if let Err(err) = state.transport.send_cancel(&state.query_string) {
                warn!(query = %state.query_string, %err, "failed to send cancel hint");
            }
        }
        let kind = if send_hint {
            CancelKind::WithHint
        } else {
            CancelKind::Local
        };
        state.tracer.on_waiter_cancelled(&state.query_string, kind);
    }

    /// Returns `true` once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The query string of the cancelled request.
    pub fn query_string(&self) -> &QueryString {
        &self.inner.query_string
    }
}

impl std::fmt::Debug for Canceller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canceller")
            .field("query_string", &self.inner.query_string)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A pending typed result.
///
/// Resolves exactly once with the transformed value, or never if cancelled
/// (including when cancelled after the result arrived but before it was
/// observed) or if the transport stalls. There is no error channel; backend
/// failures are part of the output type.
pub struct QueryHandle<T> {
    rx: oneshot::Receiver<Arc<T>>,
    canceller: Canceller,
    resolved: bool,
}

impl<T> QueryHandle<T> {
    /// Cancel this handle. See [`Canceller::cancel`].
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// A cloneable canceller for this handle.
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Returns `true` once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.canceller.is_cancelled()
    }

    /// The query string this handle waits on.
    pub fn query_string(&self) -> &QueryString {
        self.canceller.query_string()
    }

    /// Take the result without blocking, for callers that poll once per frame
    /// instead of awaiting. Returns it at most once.
    pub fn try_result(&mut self) -> Option<Arc<T>> {
        if self.resolved || self.is_cancelled() {
            return None;
        }
        let value = self.rx.try_recv().ok()?;
        self.resolved = true;
        Some(value)
    }
}

impl<T> Future for QueryHandle<T> {
    type Output = Arc<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.resolved || this.is_cancelled() {
            return Poll::Pending;
        }
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(value)) => {
                this.resolved = true;
                Poll::Ready(value)
            }
            // Waiter withdrawn or client dropped: never resolves.
            Poll::Ready(Err(_)) => Poll::Pending,
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for QueryHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("query_string", self.query_string())
            .field("cancelled", &self.is_cancelled())
            .field("resolved", &self.resolved)
            .finish()
    }
}

/// The request currently backing one piece of view state.
///
/// Pass it to [`QueryClient::query_in_slot`] whenever the view's inputs
/// change; the superseded request is cancelled before the new one is issued,
/// so two handles never race to update the same state. Dropping the slot
/// cancels its request.
#[derive(Debug, Default)]
pub struct QuerySlot {
    current: Option<Canceller>,
}

impl QuerySlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Query string of the current request.
    pub fn query_string(&self) -> Option<&QueryString> {
        self.current.as_ref().map(Canceller::query_string)
    }

    /// Cancel the current request, leaving the slot empty.
    pub fn cancel(&mut self) {
        if let Some(current) = self.current.take() {
            current.cancel();
        }
    }
}

impl Drop for QuerySlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
