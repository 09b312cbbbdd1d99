//! Wire-format types exchanged over the logical connection.
//!
//! Frames are text, each carrying one JSON object minimally shaped as
//! `{ "type": string }`. Correlated replies add `correlationId`; ordered
//! actions add a numeric `actionOrder`. Everything else passes through
//! untouched in [`Envelope::payload`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Action type dispatched to owners after every successful (re)connection.
///
/// The event is synthetic: it never travels over the wire, and it is the
/// signal to reset per-connection state such as the sequence gate.
pub const CONNECTION_ESTABLISHED: &str = "connection.established";

/// Action type of the bearer-token message sent as the first frame of
/// every connection.
pub const AUTHENTICATE: &str = "session.authenticate";

/// One decoded message, inbound or synthetic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Action type tag used for handler routing.
    #[serde(rename = "type")]
    pub kind: String,
    /// Pairs a reply to the request that generated it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Monotonic sequence number for stale-update rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_order: Option<u64>,
    /// All remaining fields of the wire object, passed through verbatim.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope with the given action type and an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            correlation_id: None,
            action_order: None,
            payload: Map::new(),
        }
    }

    /// The synthetic event announcing a fresh connection.
    pub fn reconnect() -> Self {
        Self::new(CONNECTION_ESTABLISHED)
    }

    /// Whether this is the synthetic reconnect event.
    pub fn is_reconnect(&self) -> bool {
        self.kind == CONNECTION_ESTABLISHED
    }

    /// Look up one payload field by name.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    /// The full wire object this envelope was decoded from.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Decode the full wire object into a caller-defined type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_value())
    }
}

/// Bearer-token message transmitted before any other traffic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthMessage {
    /// Always [`AUTHENTICATE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// The bearer token.
    pub token: String,
}

impl AuthMessage {
    /// Create an authentication message carrying `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            kind: AUTHENTICATE.to_owned(),
            token: token.into(),
        }
    }
}
