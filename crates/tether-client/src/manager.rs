//! Connection lifecycle for one endpoint: owns the transport link, hides
//! reconnect churn behind an idempotent [`ConnectionManager::connect`],
//! and correlates request/response pairs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use tether_core::envelope::{AuthMessage, Envelope};
use tether_core::errors::{RejectReason, TetherError, TransportError};

use crate::transport::{LinkEvent, LinkSink, LinkStream, Transport};

/// Delay before retrying after a failed or lost connection.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Minimum interval between connection-failure reports per manager.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Outbound frame queue depth per connection.
const OUTBOUND_BUFFER: usize = 64;

/// Receives every decoded inbound message plus the synthetic reconnect
/// event emitted after each successful (re)connection.
pub trait Dispatch: Send + Sync + 'static {
    /// Handle one decoded message.
    fn dispatch(&self, message: &Envelope);
}

impl<F> Dispatch for F
where
    F: Fn(&Envelope) + Send + Sync + 'static,
{
    fn dispatch(&self, message: &Envelope) {
        self(message);
    }
}

/// Supplies the bearer token transmitted as the first frame of every
/// connection.
#[async_trait]
pub trait TokenFactory: Send + Sync + 'static {
    /// Obtain a fresh bearer token.
    async fn bearer_token(&self) -> Result<String, TetherError>;
}

/// Observer invoked on every connect/disconnect transition.
pub type StateChangeFn = Box<dyn Fn(bool) + Send + Sync>;

/// Optional collaborators for a [`ConnectionManager`].
#[derive(Default)]
pub struct ConnectionOptions {
    /// Bearer-token source; when present the token is sent as the first
    /// frame of every connection.
    pub token_factory: Option<Arc<dyn TokenFactory>>,
    /// Connect/disconnect observer.
    pub on_state_change: Option<StateChangeFn>,
}

/// Marker for an attempt that failed or a link that was torn down.
#[derive(Clone, Copy, Debug)]
struct LinkLost;

/// Resolves once the in-flight attempt opens (or fails). Cloned by every
/// caller so concurrent connects converge on one attempt.
type Ready = Shared<BoxFuture<'static, Result<mpsc::Sender<String>, LinkLost>>>;

/// How the pump loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PumpExit {
    /// The link failed or the remote closed it.
    Lost,
    /// The manager was destroyed.
    Cancelled,
}

/// At most one connection-failure report per [`REPORT_INTERVAL`].
struct ReportLimiter {
    last: Mutex<Option<Instant>>,
}

impl ReportLimiter {
    fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }

    fn should_report(&self) -> bool {
        let mut last = self.last.lock();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < REPORT_INTERVAL => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

struct Inner {
    endpoint: String,
    transport: Arc<dyn Transport>,
    dispatch: Arc<dyn Dispatch>,
    token_factory: Option<Arc<dyn TokenFactory>>,
    on_state_change: Option<StateChangeFn>,
    /// Outstanding requests keyed by correlation id. Entries are removed
    /// atomically with delivery; survivors are failed on destroy.
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    /// The in-flight or established attempt. `None` while down.
    ready: Mutex<Option<Ready>>,
    destroyed: AtomicBool,
    cancel: CancellationToken,
    limiter: ReportLimiter,
}

/// Maintains one resilient logical connection to a remote endpoint.
///
/// A lost link is reopened automatically after [`RECONNECT_DELAY`] until
/// [`destroy`](Self::destroy) is called. Exactly one link is open per
/// manager at any time.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager for `endpoint`. Nothing is opened until
    /// [`connect`](Self::connect) or one of the send operations runs.
    pub fn new(
        endpoint: impl Into<String>,
        transport: Arc<dyn Transport>,
        dispatch: Arc<dyn Dispatch>,
        options: ConnectionOptions,
    ) -> Self {
        let endpoint = endpoint.into();
        trace!(endpoint = %endpoint, "creating connection manager");
        Self {
            inner: Arc::new(Inner {
                endpoint,
                transport,
                dispatch,
                token_factory: options.token_factory,
                on_state_change: options.on_state_change,
                pending: Mutex::new(HashMap::new()),
                ready: Mutex::new(None),
                destroyed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                limiter: ReportLimiter::new(),
            }),
        }
    }

    /// The endpoint this manager talks to.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Open the connection unless an attempt is already in flight or
    /// established. A destroyed manager ignores the call.
    pub fn connect(&self) {
        Inner::connect(&self.inner);
    }

    /// Fire-and-forget send. Connects on demand; any failure is logged
    /// and swallowed.
    pub async fn send_indication(&self, indication: &Value) {
        trace!(endpoint = %self.inner.endpoint, "sending indication");
        self.connect();
        let Ok(link) = self.inner.await_link().await else {
            error!(endpoint = %self.inner.endpoint, "endpoint cannot be used, indication dropped");
            return;
        };
        let text = match serde_json::to_string(indication) {
            Ok(text) => text,
            Err(e) => {
                error!(endpoint = %self.inner.endpoint, error = %e, "failed to encode indication");
                return;
            }
        };
        if link.send(text).await.is_err() {
            error!(endpoint = %self.inner.endpoint, "indication dropped, connection lost");
        }
    }

    /// Correlated request/response send. Connects on demand, attaches a
    /// generated correlation id to `request`, and resolves with the first
    /// inbound message carrying that id.
    ///
    /// No timeout is enforced; wrap the call in `tokio::time::timeout` to
    /// bound the wait. Dropping the returned future abandons it.
    pub async fn send_request(&self, request: &Value) -> Result<Envelope, TetherError> {
        trace!(endpoint = %self.inner.endpoint, "sending request");
        self.connect();
        let link = self
            .inner
            .await_link()
            .await
            .map_err(|_| TetherError::rejected(&self.inner.endpoint, RejectReason::NotConnected))?;

        let Value::Object(body) = request else {
            return Err(TetherError::rejected(
                &self.inner.endpoint,
                RejectReason::NotAnObject,
            ));
        };
        let mut body = body.clone();
        let id = Uuid::now_v7().to_string();
        let _ = body.insert("correlationId".to_owned(), Value::String(id.clone()));
        let text = serde_json::to_string(&Value::Object(body))
            .map_err(|e| TetherError::send_failed(&self.inner.endpoint, e.to_string()))?;

        let (resolve_tx, resolve_rx) = oneshot::channel();
        let _ = self.inner.pending.lock().insert(id.clone(), resolve_tx);
        counter!("tether_requests_total").increment(1);

        if link.send(text).await.is_err() {
            let _ = self.inner.pending.lock().remove(&id);
            return Err(TetherError::rejected(
                &self.inner.endpoint,
                RejectReason::NotConnected,
            ));
        }

        resolve_rx
            .await
            .map_err(|_| TetherError::rejected(&self.inner.endpoint, RejectReason::Destroyed))
    }

    /// Terminal teardown: disable every future connect and reconnect,
    /// close any live link, and fail all outstanding requests. Safe to
    /// call more than once.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(endpoint = %self.inner.endpoint, "destroying connection manager");
        self.inner.cancel.cancel();
        *self.inner.ready.lock() = None;
        self.inner.pending.lock().clear();
        self.inner.notify_state(false);
    }
}

impl Inner {
    /// Start a connection attempt unless one exists or the manager is
    /// destroyed.
    fn connect(inner: &Arc<Self>) {
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut ready = inner.ready.lock();
            if ready.is_some() {
                return;
            }
            let (open_tx, open_rx) = oneshot::channel();
            *ready = Some(
                async move { open_rx.await.unwrap_or(Err(LinkLost)) }
                    .boxed()
                    .shared(),
            );
            drop(ready);
            counter!("tether_connect_attempts_total").increment(1);
            let task = Arc::clone(inner);
            let _ = tokio::spawn(async move { task.run_connection(open_tx).await });
        }
    }

    /// One connection attempt: open, authenticate, announce, then pump
    /// frames until the link is lost or the manager is destroyed.
    async fn run_connection(
        self: Arc<Self>,
        open_tx: oneshot::Sender<Result<mpsc::Sender<String>, LinkLost>>,
    ) {
        debug!(endpoint = %self.endpoint, "opening link");
        let connected = tokio::select! {
            result = self.transport.connect(&self.endpoint) => result,
            () = self.cancel.cancelled() => {
                drop(open_tx);
                return;
            }
        };
        let (mut sink, stream) = match connected {
            Ok(halves) => halves,
            Err(e) => {
                self.report_connect_failure(&e);
                counter!("tether_connect_failures_total").increment(1);
                let _ = open_tx.send(Err(LinkLost));
                Inner::on_link_lost(&self);
                return;
            }
        };

        // Authentication is the first frame on every connection.
        if let Some(factory) = &self.token_factory {
            let token = tokio::select! {
                token = factory.bearer_token() => token,
                () = self.cancel.cancelled() => {
                    sink.close().await;
                    drop(open_tx);
                    return;
                }
            };
            match token {
                Ok(token) => match serde_json::to_string(&AuthMessage::new(token)) {
                    Ok(text) => {
                        if let Err(e) = sink.send(text).await {
                            warn!(endpoint = %self.endpoint, error = %e, "failed to send auth message");
                        }
                    }
                    Err(e) => {
                        warn!(endpoint = %self.endpoint, error = %e, "failed to encode auth message");
                    }
                },
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "unable to authenticate, continuing without token");
                }
            }
        }

        self.notify_state(true);
        self.dispatch.dispatch(&Envelope::reconnect());

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let _ = open_tx.send(Ok(out_tx));
        counter!("tether_connections_total").increment(1);

        if self.pump(sink, stream, out_rx).await == PumpExit::Cancelled {
            // destroy() already tore down manager state
            return;
        }
        Inner::on_link_lost(&self);
    }

    /// Forward outbound frames and decode inbound ones until the link
    /// dies or the manager is destroyed.
    async fn pump(
        &self,
        mut sink: Box<dyn LinkSink>,
        mut stream: Box<dyn LinkStream>,
        mut out_rx: mpsc::Receiver<String>,
    ) -> PumpExit {
        loop {
            tokio::select! {
                outbound = out_rx.recv() => {
                    let Some(text) = outbound else { return PumpExit::Lost };
                    if let Err(e) = sink.send(text).await {
                        warn!(endpoint = %self.endpoint, error = %e, "send failed");
                    }
                }
                event = stream.next_event() => match event {
                    LinkEvent::Text(text) => self.handle_inbound(&text),
                    LinkEvent::Closed => {
                        debug!(endpoint = %self.endpoint, "link closed");
                        return PumpExit::Lost;
                    }
                    LinkEvent::Error(e) => {
                        warn!(endpoint = %self.endpoint, error = %e, "link error");
                        return PumpExit::Lost;
                    }
                },
                () = self.cancel.cancelled() => {
                    sink.close().await;
                    return PumpExit::Cancelled;
                }
            }
        }
    }

    /// Decode one frame, resolve a matching pending request at most once,
    /// and forward every decoded message to the dispatch callback.
    fn handle_inbound(&self, text: &str) {
        let message: Envelope = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "dropping undecodable frame");
                return;
            }
        };
        if let Some(id) = &message.correlation_id {
            let resolver = self.pending.lock().remove(id);
            if let Some(resolver) = resolver {
                if resolver.send(message.clone()).is_err() {
                    trace!(endpoint = %self.endpoint, correlation_id = %id, "request caller went away");
                }
            }
        }
        self.dispatch.dispatch(&message);
    }

    /// Tear down after a failed open or a lost link and schedule exactly
    /// one reconnect attempt.
    fn on_link_lost(inner: &Arc<Self>) {
        inner.notify_state(false);
        *inner.ready.lock() = None;
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let cancel = inner.cancel.clone();
        let inner = Arc::clone(inner);
        let _ = tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(RECONNECT_DELAY) => Inner::connect(&inner),
                () = cancel.cancelled() => {}
            }
        });
    }

    /// Wait for the current attempt to open; fails when there is none or
    /// the attempt does not succeed.
    async fn await_link(&self) -> Result<mpsc::Sender<String>, LinkLost> {
        let ready = self.ready.lock().clone();
        match ready {
            Some(ready) => ready.await,
            None => Err(LinkLost),
        }
    }

    fn notify_state(&self, connected: bool) {
        if let Some(observer) = &self.on_state_change {
            observer(connected);
        }
    }

    fn report_connect_failure(&self, error: &TransportError) {
        if self.limiter.should_report() {
            error!(endpoint = %self.endpoint, error = %error, "endpoint not available");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
