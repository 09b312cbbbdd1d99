//! Channel-backed transport double for exercising the connection stack
//! without sockets.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use tether_core::errors::{TransportError, TransportErrorKind};

use crate::transport::{LinkEvent, LinkSink, LinkStream, SplitLink, Transport};

/// Test handles for one opened in-memory link.
pub(crate) struct LinkHandles {
    /// Frames the manager transmitted on this link.
    pub outbound: mpsc::UnboundedReceiver<String>,
    /// Feeds inbound events to the manager.
    pub inbound: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkHandles {
    /// Deliver one inbound text frame.
    pub fn feed_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(LinkEvent::Text(text.into()));
    }

    /// Close the link from the remote side.
    pub fn close(&self) {
        let _ = self.inbound.send(LinkEvent::Closed);
    }

    /// Next frame the manager sent, waiting if none yet.
    pub async fn sent(&mut self) -> String {
        self.outbound.recv().await.expect("link produced no frame")
    }
}

/// Scripted [`Transport`]: refuses the first `refuse_first` attempts (or
/// all of them), then opens in-memory links whose handles the test can
/// claim via [`MockTransport::next_link`].
pub(crate) struct MockTransport {
    refuse_first: AtomicUsize,
    refuse_all: bool,
    /// Total connect calls observed.
    pub connects: AtomicUsize,
    opened: Mutex<VecDeque<LinkHandles>>,
    notify: Notify,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            refuse_first: AtomicUsize::new(0),
            refuse_all: false,
            connects: AtomicUsize::new(0),
            opened: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    /// A transport that refuses the first `count` attempts, then opens.
    pub fn refusing(count: usize) -> Arc<Self> {
        Arc::new(Self {
            refuse_first: AtomicUsize::new(count),
            refuse_all: false,
            connects: AtomicUsize::new(0),
            opened: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    /// A transport where every attempt fails.
    pub fn refusing_all() -> Arc<Self> {
        Arc::new(Self {
            refuse_first: AtomicUsize::new(0),
            refuse_all: true,
            connects: AtomicUsize::new(0),
            opened: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    /// Number of connect calls so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Wait for the next opened link and claim its handles.
    pub async fn next_link(&self) -> LinkHandles {
        loop {
            if let Some(handles) = self.opened.lock().pop_front() {
                return handles;
            }
            self.notify.notified().await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, endpoint: &str) -> Result<SplitLink, TransportError> {
        let _ = self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self.refuse_all
            || self
                .refuse_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if refused {
            return Err(TransportError::connect_failed(endpoint, "refused by test"));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.opened.lock().push_back(LinkHandles {
            outbound: out_rx,
            inbound: in_tx,
        });
        self.notify.notify_one();
        Ok((
            Box::new(MemorySink { tx: out_tx }),
            Box::new(MemoryStream { rx: in_rx }),
        ))
    }
}

struct MemorySink {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl LinkSink for MemorySink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(text)
            .map_err(|_| TransportError::new("memory", TransportErrorKind::Send, "link gone"))
    }

    async fn close(&mut self) {}
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
impl LinkStream for MemoryStream {
    async fn next_event(&mut self) -> LinkEvent {
        self.rx.recv().await.unwrap_or(LinkEvent::Closed)
    }
}
