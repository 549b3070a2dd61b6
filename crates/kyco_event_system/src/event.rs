//! Event and payload types flowing through the pipeline.

use crate::connection::ConnectionId;
use crate::current_timestamp;
use crate::error::EventError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Event types produced by the controller itself.
///
/// NApps are free to define their own names; these are the ones the protocol
/// server, the NApp manager and the bundled NApps agree on.
pub mod core_events {
    /// A switch opened a connection. Raw channel, JSON payload with `peer`.
    pub const CONNECTION_NEW: &str = "kyco/core.connection.new";
    /// Bytes read from a switch connection. Raw channel, bytes payload.
    pub const RAW_DATA: &str = "kyco/core.raw.data";
    /// A switch connection was closed. Raw channel.
    pub const CONNECTION_LOST: &str = "kyco/core.connection.lost";
    /// A framed message promoted from raw data. Inbound channel.
    pub const MESSAGE_IN: &str = "kyco/core.message.in";
    /// A message to write back to a connection. Outbound channel.
    pub const MESSAGE_OUT: &str = "kyco/core.message.out";
    /// A NApp finished loading. Application channel.
    pub const NAPP_LOADED: &str = "kyco/core.napp.loaded";
    /// A NApp was unloaded. Application channel.
    pub const NAPP_UNLOADED: &str = "kyco/core.napp.unloaded";
}

/// Opaque event payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

/// An immutable typed message.
///
/// Fields are private so an event cannot change once it has been enqueued;
/// build it fully with the constructors and `with_*` methods first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_type: String,
    payload: Payload,
    connection: Option<ConnectionId>,
    timestamp: u64,
}

impl Event {
    /// Creates an event stamped with the current time.
    ///
    /// # Arguments
    ///
    /// * `event_type` - Routing key listeners register against, e.g.
    ///   `kyco/core.raw.data`
    /// * `payload` - The opaque body; the core never inspects it
    ///
    /// # Returns
    ///
    /// An event without a connection. Use [`Event::with_connection`] to tie
    /// it to a switch.
    pub fn new(event_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            connection: None,
            timestamp: current_timestamp(),
        }
    }

    /// Event with no payload, used for pure notifications.
    pub fn signal(event_type: impl Into<String>) -> Self {
        Self::new(event_type, Payload::Empty)
    }

    pub fn bytes(event_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::new(event_type, Payload::Bytes(data.into()))
    }

    pub fn json(event_type: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(event_type, Payload::Json(value))
    }

    /// Serializes `value` into a JSON payload.
    pub fn from_serializable<T: Serialize>(
        event_type: impl Into<String>,
        value: &T,
    ) -> Result<Self, EventError> {
        let value = serde_json::to_value(value)?;
        Ok(Self::json(event_type, value))
    }

    /// Ties the event to a switch connection (source for raw/inbound events,
    /// destination for outbound ones).
    pub fn with_connection(mut self, connection: ConnectionId) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Creation time in Unix milliseconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Bytes(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match &self.payload {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Bytes payload or a [`EventError::PayloadMismatch`].
    pub fn expect_bytes(&self) -> Result<&[u8], EventError> {
        self.as_bytes().ok_or_else(|| EventError::PayloadMismatch {
            event_type: self.event_type.clone(),
            expected: "bytes",
        })
    }

    /// Decodes a JSON payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        let value = self.as_json().ok_or_else(|| EventError::PayloadMismatch {
            event_type: self.event_type.clone(),
            expected: "json",
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct PortStatus {
        port: u16,
        up: bool,
    }

    #[test]
    fn test_json_decode() {
        let event = Event::from_serializable("port.status", &PortStatus { port: 3, up: true })
            .expect("serializable payload");

        assert_eq!(event.event_type(), "port.status");
        assert_eq!(
            event.decode::<PortStatus>().expect("decodes"),
            PortStatus { port: 3, up: true }
        );
        assert!(event.as_bytes().is_none());
    }

    #[test]
    fn test_payload_mismatch() {
        let event = Event::bytes(core_events::RAW_DATA, b"hello".to_vec()).with_connection(7);

        assert_eq!(event.connection(), Some(7));
        assert_eq!(event.expect_bytes().expect("bytes payload"), b"hello");
        assert!(matches!(
            event.decode::<PortStatus>(),
            Err(EventError::PayloadMismatch { expected: "json", .. })
        ));
    }

    #[test]
    fn test_payload_serialization_is_tagged() {
        let value = serde_json::to_value(Payload::Json(json!({"a": 1}))).expect("serializes");
        assert_eq!(value, json!({"kind": "json", "value": {"a": 1}}));
        assert_eq!(Event::signal("tick").payload(), &Payload::Empty);
    }
}
