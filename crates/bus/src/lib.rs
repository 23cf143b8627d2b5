//! `loomerp-bus` — the typed event fabric between platform services.
//!
//! Topic-exchange semantics (durable queues, `*`/`#` bindings, prefetch-1,
//! ack/nack, dead-lettering) live in the broker layer so transports stay
//! interchangeable: the in-memory broker serves dev and tests, Redis Streams
//! (feature `redis`) is the durable transport.

pub mod broker;
pub mod consumer;
pub mod dead_letter;
pub mod event;
pub mod in_memory;
pub mod publisher;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod topic;

pub use broker::{Broker, BusError, Delivery, AUDIT_LOGS_EXCHANGE, EVENTS_EXCHANGE};
pub use consumer::{ConsumerConfig, ConsumerHandle, ConsumerRuntime, EventHandler, HandlerOutcome};
pub use dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetterSink};
pub use event::{Event, RoutingKey};
pub use in_memory::InMemoryBroker;
pub use publisher::{EventPublisher, PublisherConfig};
pub use topic::BindingPattern;
