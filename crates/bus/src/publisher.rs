//! Durable publisher with retry budget and bounded outbox.
//!
//! Producers never drop events on transient broker failure: after the retry
//! budget is spent the event is buffered locally, and `flush` drains the
//! buffer in publish order once the broker is back. Only outbox overflow
//! fails open (with a log).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::broker::{Broker, BusError};
use crate::event::Event;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Publish attempts per event before buffering.
    pub retry_budget: u32,
    /// Base delay between attempts (doubles each retry).
    pub retry_delay: Duration,
    /// Hard deadline per publish call; prevents blocking request threads.
    pub publish_timeout: Duration,
    /// Maximum buffered events before failing open.
    pub outbox_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            retry_delay: Duration::from_millis(50),
            publish_timeout: Duration::from_secs(5),
            outbox_capacity: 1024,
        }
    }
}

/// Publisher bound to one broker.
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    config: PublisherConfig,
    outbox: Mutex<VecDeque<(String, Event)>>,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_config(broker, PublisherConfig::default())
    }

    pub fn with_config(broker: Arc<dyn Broker>, config: PublisherConfig) -> Self {
        Self {
            broker,
            config,
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Publish an event, buffering on transient failure.
    ///
    /// Returns `Err` only for permanent failures (e.g. undeclared exchange);
    /// transient trouble resolves to `Ok` with the event safely buffered.
    pub fn publish(&self, exchange: &str, event: &Event) -> Result<(), BusError> {
        // Earlier buffered events go first so per-key order holds.
        if self.outbox_len() > 0 {
            self.flush()?;
            if self.outbox_len() > 0 {
                self.buffer(exchange, event.clone());
                return Ok(());
            }
        }

        match self.try_publish(exchange, event) {
            Ok(()) => Ok(()),
            Err(BusError::Permanent(e)) => Err(BusError::Permanent(e)),
            Err(BusError::Transient(e)) => {
                warn!(
                    routing_key = %event.routing_key,
                    error = %e,
                    "publish retries exhausted; buffering to outbox"
                );
                self.buffer(exchange, event.clone());
                Ok(())
            }
        }
    }

    /// Drain the outbox in order. Stops at the first transient failure.
    /// Returns the number of events flushed.
    pub fn flush(&self) -> Result<usize, BusError> {
        let mut flushed = 0;
        loop {
            let next = {
                let outbox = self.outbox.lock().unwrap_or_else(|p| p.into_inner());
                outbox.front().cloned()
            };
            let Some((exchange, event)) = next else {
                return Ok(flushed);
            };
            match self.try_publish(&exchange, &event) {
                Ok(()) => {
                    self.outbox
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .pop_front();
                    flushed += 1;
                }
                Err(BusError::Transient(_)) => return Ok(flushed),
                Err(e) => {
                    // A permanently unpublishable event would wedge the
                    // outbox; drop it and keep draining.
                    error!(routing_key = %event.routing_key, error = %e, "dropping unpublishable outbox event");
                    self.outbox
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .pop_front();
                }
            }
        }
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn buffer(&self, exchange: &str, event: Event) {
        let mut outbox = self.outbox.lock().unwrap_or_else(|p| p.into_inner());
        if outbox.len() >= self.config.outbox_capacity {
            error!(
                routing_key = %event.routing_key,
                capacity = self.config.outbox_capacity,
                "outbox full; dropping event"
            );
            return;
        }
        outbox.push_back((exchange.to_string(), event));
    }

    fn try_publish(&self, exchange: &str, event: &Event) -> Result<(), BusError> {
        let payload = event.encode();
        let deadline = Instant::now() + self.config.publish_timeout;
        let mut delay = self.config.retry_delay;
        let mut last_err = BusError::Transient("no attempts made".to_string());

        for attempt in 0..self.config.retry_budget.max(1) {
            match self.broker.publish(exchange, &event.routing_key, &payload) {
                Ok(()) => return Ok(()),
                Err(BusError::Permanent(e)) => return Err(BusError::Permanent(e)),
                Err(BusError::Transient(e)) => {
                    last_err = BusError::Transient(e);
                }
            }
            if attempt + 1 < self.config.retry_budget && Instant::now() + delay < deadline {
                std::thread::sleep(delay);
                delay *= 2;
            } else {
                break;
            }
        }
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Delivery, EVENTS_EXCHANGE};
    use crate::event::RoutingKey;
    use crate::in_memory::InMemoryBroker;
    use crate::topic::BindingPattern;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn event(key: &str) -> Event {
        Event::global(key.parse().unwrap(), serde_json::json!({"n": 1}))
    }

    /// Broker that fails transiently until `healthy` is flipped.
    struct FlakyBroker {
        inner: InMemoryBroker,
        healthy: AtomicBool,
    }

    impl FlakyBroker {
        fn new() -> Self {
            let inner = InMemoryBroker::new();
            inner.declare_exchange(EVENTS_EXCHANGE).unwrap();
            inner.declare_queue("sink").unwrap();
            inner
                .bind("sink", EVENTS_EXCHANGE, &"#".parse::<BindingPattern>().unwrap())
                .unwrap();
            Self {
                inner,
                healthy: AtomicBool::new(false),
            }
        }
    }

    impl Broker for FlakyBroker {
        fn declare_exchange(&self, e: &str) -> Result<(), BusError> {
            self.inner.declare_exchange(e)
        }
        fn declare_queue(&self, q: &str) -> Result<(), BusError> {
            self.inner.declare_queue(q)
        }
        fn bind(&self, q: &str, e: &str, p: &BindingPattern) -> Result<(), BusError> {
            self.inner.bind(q, e, p)
        }
        fn publish(&self, e: &str, k: &RoutingKey, payload: &[u8]) -> Result<(), BusError> {
            if self.healthy.load(Ordering::SeqCst) {
                self.inner.publish(e, k, payload)
            } else {
                Err(BusError::Transient("connection refused".to_string()))
            }
        }
        fn receive(&self, q: &str, t: Duration) -> Result<Option<Delivery>, BusError> {
            self.inner.receive(q, t)
        }
        fn ack(&self, q: &str, tag: u64) -> Result<(), BusError> {
            self.inner.ack(q, tag)
        }
        fn nack_requeue(&self, q: &str, tag: u64) -> Result<(), BusError> {
            self.inner.nack_requeue(q, tag)
        }
    }

    fn fast_config() -> PublisherConfig {
        PublisherConfig {
            retry_budget: 2,
            retry_delay: Duration::from_millis(1),
            publish_timeout: Duration::from_millis(100),
            outbox_capacity: 4,
        }
    }

    #[test]
    fn healthy_broker_publishes_directly() {
        let broker = Arc::new(FlakyBroker::new());
        broker.healthy.store(true, Ordering::SeqCst);
        let publisher = EventPublisher::with_config(broker.clone(), fast_config());

        publisher.publish(EVENTS_EXCHANGE, &event("pos.sale.closed")).unwrap();
        assert_eq!(publisher.outbox_len(), 0);
        assert_eq!(broker.inner.queue_depth("sink"), 1);
    }

    #[test]
    fn transient_failure_buffers_then_flush_drains_in_order() {
        let broker = Arc::new(FlakyBroker::new());
        let publisher = EventPublisher::with_config(broker.clone(), fast_config());

        publisher.publish(EVENTS_EXCHANGE, &event("pos.sale.closed")).unwrap();
        publisher.publish(EVENTS_EXCHANGE, &event("stock.update.success")).unwrap();
        assert_eq!(publisher.outbox_len(), 2);
        assert_eq!(broker.inner.queue_depth("sink"), 0);

        broker.healthy.store(true, Ordering::SeqCst);
        assert_eq!(publisher.flush().unwrap(), 2);
        assert_eq!(publisher.outbox_len(), 0);

        let first = broker.inner.receive("sink", Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(first.routing_key, "pos.sale.closed");
    }

    #[test]
    fn outbox_overflow_fails_open() {
        let broker = Arc::new(FlakyBroker::new());
        let publisher = EventPublisher::with_config(broker, fast_config());

        for _ in 0..10 {
            publisher.publish(EVENTS_EXCHANGE, &event("pos.sale.closed")).unwrap();
        }
        assert_eq!(publisher.outbox_len(), 4);
    }

    #[test]
    fn permanent_failure_surfaces() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = EventPublisher::with_config(broker, fast_config());
        // Exchange never declared → permanent.
        assert!(matches!(
            publisher.publish(EVENTS_EXCHANGE, &event("pos.sale.closed")),
            Err(BusError::Permanent(_))
        ));
    }
}
