//! Typed routing, stale-update rejection, and session fan-out above one
//! [`ConnectionManager`].
//!
//! Handlers are registered per action type. Handlers marked *ordered*
//! only see messages whose sequence number advances a per-connector gate,
//! so late-arriving updates are discarded instead of rolling state back.
//! Correlated replies bypass the gate: a response must always reach its
//! caller regardless of unrelated traffic ordering.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{trace, warn};

use tether_core::envelope::Envelope;
use tether_core::errors::{RejectReason, TetherError};

use crate::manager::{ConnectionManager, ConnectionOptions, Dispatch, TokenFactory};
use crate::session::{Session, SessionManager};
use crate::transport::Transport;

/// Handles one registered action type.
pub trait ActionHandler: Send + Sync + 'static {
    /// Process one routed message.
    fn handle(&self, action: &Envelope);
}

impl<F> ActionHandler for F
where
    F: Fn(&Envelope) + Send + Sync + 'static,
{
    fn handle(&self, action: &Envelope) {
        self(action);
    }
}

/// Hook invoked after every successful (re)connection, for
/// re-synchronizing state over the fresh link.
pub type ReconnectHook = Box<dyn Fn(&ConnectionManager) + Send + Sync>;

struct RegisteredHandler {
    callback: Arc<dyn ActionHandler>,
    ordered: bool,
}

/// Routing state shared with the manager's dispatch callback.
struct Router {
    registry: Mutex<HashMap<String, RegisteredHandler>>,
    /// Last accepted sequence number on the current connection.
    last_sequence: Mutex<Option<u64>>,
    on_reconnect: Mutex<Option<ReconnectHook>>,
    remote: Mutex<Weak<ConnectionManager>>,
}

impl Dispatch for Router {
    fn dispatch(&self, message: &Envelope) {
        if message.is_reconnect() {
            *self.last_sequence.lock() = None;
            if let Some(hook) = &*self.on_reconnect.lock() {
                if let Some(manager) = self.remote.lock().upgrade() {
                    hook(&manager);
                }
            }
        }

        // A numeric order makes this message a gate candidate. Acceptance
        // advances the gate even when nothing is registered for the type.
        let accepted = {
            let mut last = self.last_sequence.lock();
            match message.action_order {
                Some(order) if last.is_none_or(|prev| order > prev) => {
                    *last = Some(order);
                    true
                }
                _ => false,
            }
        };

        let handler = {
            let registry = self.registry.lock();
            registry
                .get(&message.kind)
                .map(|h| (Arc::clone(&h.callback), h.ordered))
        };
        let Some((callback, ordered)) = handler else {
            return;
        };

        if ordered && !accepted {
            if message.correlation_id.is_none() {
                trace!(
                    kind = %message.kind,
                    order = ?message.action_order,
                    "dropping stale action"
                );
                return;
            }
            trace!(kind = %message.kind, "stale order overridden by correlated reply");
        }

        callback.handle(message);
    }
}

/// Application-facing connector: handler registry, stale-update
/// rejection, and broadcast fan-out over one resilient connection.
pub struct Connector {
    endpoint: String,
    router: Arc<Router>,
    remote: Mutex<Option<Arc<ConnectionManager>>>,
    sessions: Arc<dyn SessionManager>,
}

impl Connector {
    /// Build a connector bound to one endpoint, one session manager, and
    /// the given collaborators.
    pub fn new(
        endpoint: impl Into<String>,
        transport: Arc<dyn Transport>,
        sessions: Arc<dyn SessionManager>,
        options: ConnectionOptions,
    ) -> Self {
        let endpoint = endpoint.into();
        let router = Arc::new(Router {
            registry: Mutex::new(HashMap::new()),
            last_sequence: Mutex::new(None),
            on_reconnect: Mutex::new(None),
            remote: Mutex::new(Weak::new()),
        });
        let manager = Arc::new(ConnectionManager::new(
            endpoint.clone(),
            transport,
            Arc::clone(&router) as Arc<dyn Dispatch>,
            options,
        ));
        *router.remote.lock() = Arc::downgrade(&manager);
        Self {
            endpoint,
            router,
            remote: Mutex::new(Some(manager)),
            sessions,
        }
    }

    /// The endpoint of the underlying connection, or `None` once
    /// destroyed.
    pub fn endpoint(&self) -> Option<String> {
        self.remote
            .lock()
            .as_ref()
            .map(|manager| manager.endpoint().to_owned())
    }

    /// Bind `handler` for one action type. Re-registering a type replaces
    /// the previous handler.
    pub fn register(&self, kind: impl Into<String>, handler: impl ActionHandler) {
        self.register_handler(kind.into(), Arc::new(handler), false);
    }

    /// Like [`register`](Self::register), but deliveries that fail the
    /// sequence gate are dropped unless they carry a correlation id.
    pub fn register_ordered(&self, kind: impl Into<String>, handler: impl ActionHandler) {
        self.register_handler(kind.into(), Arc::new(handler), true);
    }

    fn register_handler(&self, kind: String, callback: Arc<dyn ActionHandler>, ordered: bool) {
        let _ = self
            .router
            .registry
            .lock()
            .insert(kind, RegisteredHandler { callback, ordered });
    }

    /// Install the hook invoked after every successful (re)connection.
    pub fn on_reconnect(&self, hook: impl Fn(&ConnectionManager) + Send + Sync + 'static) {
        *self.router.on_reconnect.lock() = Some(Box::new(hook));
    }

    /// Fire-and-forget send to the remote endpoint.
    pub async fn send_indication(&self, indication: &Value) {
        let remote = self.remote.lock().clone();
        match remote {
            Some(manager) => manager.send_indication(indication).await,
            None => {
                warn!(endpoint = %self.endpoint, "indication dropped, connector destroyed");
            }
        }
    }

    /// Correlated request/response send to the remote endpoint.
    pub async fn send_request(&self, request: &Value) -> Result<Envelope, TetherError> {
        let remote = self.remote.lock().clone();
        match remote {
            Some(manager) => manager.send_request(request).await,
            None => Err(TetherError::rejected(&self.endpoint, RejectReason::Destroyed)),
        }
    }

    /// Send one indication to every connected session.
    pub async fn broadcast(&self, indication: &Value) {
        for session in self.sessions.sessions().await {
            deliver(session.as_ref(), indication).await;
        }
    }

    /// Compute one indication per session; `None` skips that session.
    pub async fn broadcast_with<F>(&self, factory: F)
    where
        F: Fn(&dyn Session) -> Option<Value>,
    {
        for session in self.sessions.sessions().await {
            if let Some(indication) = factory(session.as_ref()) {
                deliver(session.as_ref(), &indication).await;
            }
        }
    }

    /// Open (or reopen) the underlying connection.
    pub fn connect(&self) {
        if let Some(manager) = &*self.remote.lock() {
            manager.connect();
        }
    }

    /// Terminal teardown. Safe to call more than once.
    pub fn destroy(&self) {
        let remote = self.remote.lock().take();
        if let Some(manager) = remote {
            manager.destroy();
        }
    }
}

/// One session's delivery; a failure is logged and contained so the
/// remaining sessions still receive theirs.
async fn deliver(session: &dyn Session, indication: &Value) {
    if let Err(e) = session.send(indication).await {
        warn!(remote = %session.remote_address(), error = %e, "broadcast delivery failed");
    }
}

/// Construct a [`Connector`] bound to one endpoint, one session manager,
/// and an optional token factory. Performs no work beyond construction.
pub fn create_connector(
    endpoint: impl Into<String>,
    transport: Arc<dyn Transport>,
    sessions: Arc<dyn SessionManager>,
    token_factory: Option<Arc<dyn TokenFactory>>,
) -> Connector {
    Connector::new(
        endpoint,
        transport,
        sessions,
        ConnectionOptions {
            token_factory,
            on_state_change: None,
        },
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{PeerSession, SessionHub};
    use crate::testing::{LinkHandles, MockTransport};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn connector(transport: &Arc<MockTransport>) -> Connector {
        Connector::new(
            "wss://unit/test",
            Arc::clone(transport) as Arc<dyn Transport>,
            Arc::new(SessionHub::new()),
            ConnectionOptions::default(),
        )
    }

    /// Register a recording handler and return its capture buffer.
    fn capture(connector: &Connector, kind: &str, ordered: bool) -> Arc<Mutex<Vec<Envelope>>> {
        let seen: Arc<Mutex<Vec<Envelope>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let handler = move |message: &Envelope| sink.lock().push(message.clone());
        if ordered {
            connector.register_ordered(kind, handler);
        } else {
            connector.register(kind, handler);
        }
        seen
    }

    async fn open_link(connector: &Connector, transport: &Arc<MockTransport>) -> LinkHandles {
        connector.connect();
        let link = transport.next_link().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        link
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn routes_to_the_registered_handler_only() {
        let transport = MockTransport::new();
        let connector = connector(&transport);
        let updates = capture(&connector, "thing.updated", false);
        let removals = capture(&connector, "thing.removed", false);

        let link = open_link(&connector, &transport).await;
        link.feed_text(r#"{"type":"thing.updated","name":"a"}"#);
        settle().await;

        assert_eq!(updates.lock().len(), 1);
        assert!(removals.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_kinds_are_silently_ignored() {
        let transport = MockTransport::new();
        let connector = connector(&transport);
        let updates = capture(&connector, "thing.updated", false);

        let link = open_link(&connector, &transport).await;
        link.feed_text(r#"{"type":"nobody.cares"}"#);
        settle().await;

        assert!(updates.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reregistering_replaces_the_handler() {
        let transport = MockTransport::new();
        let connector = connector(&transport);
        let first = capture(&connector, "thing.updated", false);
        let second = capture(&connector, "thing.updated", false);

        let link = open_link(&connector, &transport).await;
        link.feed_text(r#"{"type":"thing.updated"}"#);
        settle().await;

        assert!(first.lock().is_empty());
        assert_eq!(second.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ordered_handler_rejects_stale_sequences() {
        let transport = MockTransport::new();
        let connector = connector(&transport);
        let seen = capture(&connector, "state.changed", true);

        let link = open_link(&connector, &transport).await;
        link.feed_text(r#"{"type":"state.changed","actionOrder":5,"step":"first"}"#);
        link.feed_text(r#"{"type":"state.changed","actionOrder":3,"step":"stale"}"#);
        link.feed_text(r#"{"type":"state.changed","actionOrder":7,"step":"second"}"#);
        settle().await;

        let orders: Vec<Option<u64>> = seen.lock().iter().map(|m| m.action_order).collect();
        assert_eq!(orders, vec![Some(5), Some(7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_advances_even_without_a_handler() {
        let transport = MockTransport::new();
        let connector = connector(&transport);
        let seen = capture(&connector, "state.changed", true);

        let link = open_link(&connector, &transport).await;
        // Nothing is registered for this type, but its order still counts.
        link.feed_text(r#"{"type":"unregistered.kind","actionOrder":5}"#);
        link.feed_text(r#"{"type":"state.changed","actionOrder":3}"#);
        settle().await;

        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn correlated_reply_bypasses_the_gate() {
        let transport = MockTransport::new();
        let connector = connector(&transport);
        let seen = capture(&connector, "state.changed", true);

        let link = open_link(&connector, &transport).await;
        link.feed_text(r#"{"type":"state.changed","actionOrder":5}"#);
        link.feed_text(r#"{"type":"state.changed","actionOrder":3,"correlationId":"c1"}"#);
        settle().await;

        let orders: Vec<Option<u64>> = seen.lock().iter().map(|m| m.action_order).collect();
        assert_eq!(orders, vec![Some(5), Some(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn unordered_message_to_ordered_handler_is_dropped() {
        let transport = MockTransport::new();
        let connector = connector(&transport);
        let seen = capture(&connector, "state.changed", true);

        let link = open_link(&connector, &transport).await;
        link.feed_text(r#"{"type":"state.changed","step":"no order field"}"#);
        link.feed_text(r#"{"type":"state.changed","correlationId":"c1"}"#);
        settle().await;

        // Only the correlated one is delivered.
        let ids: Vec<Option<String>> =
            seen.lock().iter().map(|m| m.correlation_id.clone()).collect();
        assert_eq!(ids, vec![Some("c1".to_owned())]);
    }

    #[tokio::test(start_paused = true)]
    async fn unordered_handler_ignores_the_gate() {
        let transport = MockTransport::new();
        let connector = connector(&transport);
        let seen = capture(&connector, "ticker.moved", false);

        let link = open_link(&connector, &transport).await;
        link.feed_text(r#"{"type":"ticker.moved","actionOrder":5}"#);
        link.feed_text(r#"{"type":"ticker.moved","actionOrder":3}"#);
        settle().await;

        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resets_the_gate_and_fires_the_hook() {
        let transport = MockTransport::new();
        let connector = connector(&transport);
        let seen = capture(&connector, "state.changed", true);
        let reconnects = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&reconnects);
        connector.on_reconnect(move |_manager| {
            let _ = hook_count.fetch_add(1, Ordering::SeqCst);
        });

        let link = open_link(&connector, &transport).await;
        link.feed_text(r#"{"type":"state.changed","actionOrder":2}"#);
        settle().await;
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);

        // Drop the link; the manager reconnects and the gate resets, so
        // the same order is accepted again.
        link.close();
        let second = transport.next_link().await;
        settle().await;
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);

        second.feed_text(r#"{"type":"state.changed","actionOrder":2}"#);
        settle().await;
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_event_reaches_a_registered_handler() {
        let transport = MockTransport::new();
        let connector = connector(&transport);
        let seen = capture(
            &connector,
            tether_core::envelope::CONNECTION_ESTABLISHED,
            false,
        );

        let _link = open_link(&connector, &transport).await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_reaches_every_session() {
        let transport = MockTransport::new();
        let hub = Arc::new(SessionHub::new());
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        hub.add(Arc::new(PeerSession::new("s1", "10.0.0.1:9100", tx_a)))
            .await;
        hub.add(Arc::new(PeerSession::new("s2", "10.0.0.2:9100", tx_b)))
            .await;
        let connector = Connector::new(
            "wss://unit/test",
            MockTransport::new() as Arc<dyn Transport>,
            Arc::clone(&hub) as Arc<dyn SessionManager>,
            ConnectionOptions::default(),
        );

        connector.broadcast(&json!({"cmd": "refresh"})).await;

        let a = rx_a.try_recv().unwrap();
        let b = rx_b.try_recv().unwrap();
        assert_eq!(a.as_str(), r#"{"cmd":"refresh"}"#);
        assert_eq!(a.as_str(), b.as_str());
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_with_computes_one_value_per_session() {
        let hub = Arc::new(SessionHub::new());
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        hub.add(Arc::new(PeerSession::new("s1", "10.0.0.1:9100", tx_a)))
            .await;
        hub.add(Arc::new(PeerSession::new("s2", "10.0.0.2:9100", tx_b)))
            .await;
        let connector = Connector::new(
            "wss://unit/test",
            MockTransport::new() as Arc<dyn Transport>,
            Arc::clone(&hub) as Arc<dyn SessionManager>,
            ConnectionOptions::default(),
        );

        connector
            .broadcast_with(|session| {
                // Skip one peer entirely.
                if session.remote_address().starts_with("10.0.0.2") {
                    None
                } else {
                    Some(json!({"for": session.remote_address()}))
                }
            })
            .await;

        let a = rx_a.try_recv().unwrap();
        assert_eq!(a.as_str(), r#"{"for":"10.0.0.1:9100"}"#);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn one_failed_session_does_not_block_the_rest() {
        let hub = Arc::new(SessionHub::new());
        let (tx_dead, rx_dead) = mpsc::channel(8);
        drop(rx_dead);
        let (tx_live, mut rx_live) = mpsc::channel(8);
        hub.add(Arc::new(PeerSession::new("dead", "10.0.0.1:9100", tx_dead)))
            .await;
        hub.add(Arc::new(PeerSession::new("live", "10.0.0.2:9100", tx_live)))
            .await;
        let connector = Connector::new(
            "wss://unit/test",
            MockTransport::new() as Arc<dyn Transport>,
            Arc::clone(&hub) as Arc<dyn SessionManager>,
            ConnectionOptions::default(),
        );

        connector.broadcast(&json!({"cmd": "refresh"})).await;

        assert!(rx_live.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_clears_the_remote_and_is_repeatable() {
        let transport = MockTransport::new();
        let connector = connector(&transport);
        let _link = open_link(&connector, &transport).await;
        assert_eq!(connector.endpoint().as_deref(), Some("wss://unit/test"));

        connector.destroy();
        connector.destroy();
        assert!(connector.endpoint().is_none());

        let result = connector.send_request(&json!({"cmd": "ping"})).await;
        assert_matches!(
            result,
            Err(TetherError::RequestRejected {
                reason: RejectReason::Destroyed,
                ..
            })
        );

        // connect() on a destroyed connector opens nothing new.
        connector.connect();
        connector.send_indication(&json!({"cmd": "noop"})).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn factory_builds_a_working_connector() {
        let transport = MockTransport::new();
        let connector = create_connector(
            "wss://unit/test",
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(SessionHub::new()),
            None,
        );
        assert_eq!(connector.endpoint().as_deref(), Some("wss://unit/test"));
        let _link = open_link(&connector, &transport).await;
        assert_eq!(transport.connect_count(), 1);
    }
}
