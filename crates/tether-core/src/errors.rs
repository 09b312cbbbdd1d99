//! Error taxonomy for the connector.
//!
//! Two layers: [`TransportError`] is what a transport implementation
//! raises; [`TetherError`] is everything an application can observe.
//! Indications never surface failure to the caller, requests surface
//! failure only through their returned `Result`, and everything else is
//! reported through logs.

use std::fmt;

use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// TransportError
// ─────────────────────────────────────────────────────────────────────────────

/// Classification of a transport failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The connection attempt failed.
    ConnectFailed,
    /// A transmit failed on an open link.
    Send,
    /// Receiving from an open link failed.
    Receive,
    /// The link is closed.
    Closed,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed => write!(f, "connect failed"),
            Self::Send => write!(f, "send failed"),
            Self::Receive => write!(f, "receive failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Failure raised by the transport layer.
#[derive(Debug, Error)]
#[error("transport {kind} on {endpoint}: {message}")]
pub struct TransportError {
    /// Endpoint the transport was talking to.
    pub endpoint: String,
    /// What failed.
    pub kind: TransportErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Original cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    /// Create a new transport error.
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        kind: TransportErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for a failed connection attempt.
    #[must_use]
    pub fn connect_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(endpoint, TransportErrorKind::ConnectFailed, message)
    }

    /// Set the error cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TetherError
// ─────────────────────────────────────────────────────────────────────────────

/// Why a request could not be accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// No connection could be obtained.
    NotConnected,
    /// The manager has been destroyed.
    Destroyed,
    /// The request payload is not a JSON object.
    NotAnObject,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::Destroyed => write!(f, "connection destroyed"),
            Self::NotAnObject => write!(f, "payload is not a JSON object"),
        }
    }
}

/// Everything that can go wrong across the connector.
#[derive(Debug, Error)]
pub enum TetherError {
    /// A connection attempt failed; the manager retries on its own.
    #[error("{0}")]
    TransportUnavailable(#[from] TransportError),

    /// The token factory failed; the connection proceeds unauthenticated.
    #[error("authentication failed: {message}")]
    AuthenticationFailed {
        /// Human-readable message.
        message: String,
    },

    /// A transmit failed on a live connection. Logged per call, never
    /// retried.
    #[error("send failed on {endpoint}: {message}")]
    SendFailed {
        /// Endpoint or remote address the send targeted.
        endpoint: String,
        /// Human-readable message.
        message: String,
    },

    /// A request could not obtain a usable connection.
    #[error("request rejected on {endpoint}: {reason}")]
    RequestRejected {
        /// Endpoint the request targeted.
        endpoint: String,
        /// Why the request was rejected.
        reason: RejectReason,
    },

    /// An inbound frame was not a valid wire object.
    #[error("failed to decode inbound frame: {0}")]
    DecodeFailed(#[from] serde_json::Error),
}

impl TetherError {
    /// Shorthand for an authentication failure.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            message: message.into(),
        }
    }

    /// Shorthand for a failed transmit.
    #[must_use]
    pub fn send_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SendFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a rejected request.
    #[must_use]
    pub fn rejected(endpoint: impl Into<String>, reason: RejectReason) -> Self {
        Self::RequestRejected {
            endpoint: endpoint.into(),
            reason,
        }
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransportUnavailable(_) => "TRANSPORT_UNAVAILABLE",
            Self::AuthenticationFailed { .. } => "AUTHENTICATION_FAILED",
            Self::SendFailed { .. } => "SEND_FAILED",
            Self::RequestRejected { .. } => "REQUEST_REJECTED",
            Self::DecodeFailed(_) => "DECODE_FAILED",
        }
    }

    /// Whether the condition clears on its own (the reconnect loop keeps
    /// trying).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportUnavailable(_))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
