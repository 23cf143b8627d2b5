//! Transport-agnostic broker contract.
//!
//! Exchanges and queues are durable by declaration; consumers run with an
//! effective prefetch of one (a consumer holds at most one unacked delivery).
//! At-least-once delivery; handlers must be idempotent.

use std::time::Duration;

use thiserror::Error;

use crate::event::RoutingKey;
use crate::topic::BindingPattern;

/// Primary topic exchange for domain events.
pub const EVENTS_EXCHANGE: &str = "events";

/// Fan-in exchange for audit records.
pub const AUDIT_LOGS_EXCHANGE: &str = "audit_logs";

/// Broker failure taxonomy.
///
/// `Transient` covers connection loss and timeouts (retry/reconnect);
/// `Permanent` covers malformed payloads and protocol violations (dead-letter,
/// never retried).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("transient broker error: {0}")]
    Transient(String),

    #[error("permanent broker error: {0}")]
    Permanent(String),
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Per-queue acknowledgement tag.
    pub tag: u64,
    /// Concrete routing key the message was published under.
    pub routing_key: String,
    /// Serialized event payload.
    pub payload: Vec<u8>,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
}

/// Topic broker contract.
///
/// Declarations are idempotent; publish order per routing key from one
/// producer is preserved to one consumer. No global ordering.
pub trait Broker: Send + Sync {
    fn declare_exchange(&self, exchange: &str) -> Result<(), BusError>;

    fn declare_queue(&self, queue: &str) -> Result<(), BusError>;

    fn bind(&self, queue: &str, exchange: &str, pattern: &BindingPattern) -> Result<(), BusError>;

    /// Publish a persistent message.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &RoutingKey,
        payload: &[u8],
    ) -> Result<(), BusError>;

    /// Wait up to `timeout` for the next delivery on `queue`.
    ///
    /// Returns `Ok(None)` on idle timeout. A queue hands out at most one
    /// unacked delivery per consumer at a time (prefetch 1).
    fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, BusError>;

    /// Acknowledge a delivery, removing it from the queue.
    fn ack(&self, queue: &str, tag: u64) -> Result<(), BusError>;

    /// Return a delivery to the front of the queue for redelivery.
    fn nack_requeue(&self, queue: &str, tag: u64) -> Result<(), BusError>;
}
