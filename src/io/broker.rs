//! Broker client abstraction
//!
//! A [`BrokerConnector`] builds a fresh [`BrokerClient`] per event. The
//! client accepts messages with `produce`, reports the fate of each one on
//! its delivery stream, and can be flushed and closed. Closing ends the
//! delivery stream.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Outcome of one produced message, as reported by the broker client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub payload: Vec<u8>,
    /// `Err` carries the broker's error detail
    pub result: Result<(), String>,
}

impl DeliveryReport {
    pub fn delivered(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self { topic: topic.into(), payload, result: Ok(()) }
    }

    pub fn failed(topic: impl Into<String>, payload: Vec<u8>, error: impl Into<String>) -> Self {
        Self { topic: topic.into(), payload, result: Err(error.into()) }
    }

    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }

    /// Payload as text, for logging
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Receiving half of a client's delivery report stream
pub type DeliveryReports = mpsc::UnboundedReceiver<DeliveryReport>;

/// Error raised when a message cannot be handed to the broker client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ProduceError(pub String);

/// One broker client
#[async_trait]
pub trait BrokerClient: Send {
    /// Take the delivery report stream. Returns `None` if already taken.
    fn delivery_reports(&mut self) -> Option<DeliveryReports>;

    /// Enqueue a message. Partition/placement is left to the broker.
    async fn produce(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), ProduceError>;

    /// Wait up to `timeout` for outstanding messages to be confirmed.
    /// Returns the number still outstanding.
    async fn flush(&mut self, timeout: Duration) -> usize;

    /// Tear the client down. Outstanding messages are reported as failed
    /// and the delivery stream ends. The client must not be used afterwards.
    async fn close(&mut self);
}

/// Factory for broker clients.
///
/// Connection settings are validated when the connector is built, so
/// `connect` only fails for reasons that arise at connect time.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerClient>, ProduceError>;
}
