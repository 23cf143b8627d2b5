//! In-memory topic broker for dev and tests.
//!
//! Single-process, strictly FIFO per queue, prefetch of one enforced by
//! holding back further deliveries while one is unacked.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::broker::{Broker, BusError, Delivery};
use crate::event::RoutingKey;
use crate::topic::BindingPattern;

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Delivery>,
    unacked: HashMap<u64, Delivery>,
    next_tag: u64,
}

#[derive(Debug, Default)]
struct Inner {
    /// exchange → (queue, pattern) bindings.
    exchanges: HashMap<String, Vec<(String, BindingPattern)>>,
    queues: HashMap<String, QueueState>,
}

/// In-memory broker.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    inner: Mutex<Inner>,
    wakeup: Condvar,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting on a queue (tests).
    pub fn queue_depth(&self, queue: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.queues.get(queue).map(|q| q.pending.len()).unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a publisher panicked mid-update;
        // the queue maps are still structurally valid.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Broker for InMemoryBroker {
    fn declare_exchange(&self, exchange: &str) -> Result<(), BusError> {
        self.lock().exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    fn declare_queue(&self, queue: &str) -> Result<(), BusError> {
        self.lock().queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    fn bind(&self, queue: &str, exchange: &str, pattern: &BindingPattern) -> Result<(), BusError> {
        let mut inner = self.lock();
        if !inner.queues.contains_key(queue) {
            return Err(BusError::Permanent(format!("queue '{queue}' not declared")));
        }
        let bindings = inner
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BusError::Permanent(format!("exchange '{exchange}' not declared")))?;
        let entry = (queue.to_string(), pattern.clone());
        if !bindings.contains(&entry) {
            bindings.push(entry);
        }
        Ok(())
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &RoutingKey,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let mut inner = self.lock();
        let matched: Vec<String> = inner
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::Permanent(format!("exchange '{exchange}' not declared")))?
            .iter()
            .filter(|(_, pattern)| pattern.matches(routing_key))
            .map(|(queue, _)| queue.clone())
            .collect();

        for queue in matched {
            if let Some(state) = inner.queues.get_mut(&queue) {
                state.next_tag += 1;
                state.pending.push_back(Delivery {
                    tag: state.next_tag,
                    routing_key: routing_key.as_str().to_string(),
                    payload: payload.to_vec(),
                    attempt: 1,
                });
            }
        }
        self.wakeup.notify_all();
        Ok(())
    }

    fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, BusError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            let state = inner
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::Permanent(format!("queue '{queue}' not declared")))?;

            // Prefetch 1: hold back while a delivery is outstanding.
            if state.unacked.is_empty() {
                if let Some(delivery) = state.pending.pop_front() {
                    state.unacked.insert(delivery.tag, delivery.clone());
                    return Ok(Some(delivery));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let (guard, _) = self
                .wakeup
                .wait_timeout(inner, remaining)
                .unwrap_or_else(|p| p.into_inner());
            inner = guard;
        }
    }

    fn ack(&self, queue: &str, tag: u64) -> Result<(), BusError> {
        let mut inner = self.lock();
        let state = inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Permanent(format!("queue '{queue}' not declared")))?;
        state
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| BusError::Permanent(format!("unknown delivery tag {tag}")))?;
        self.wakeup.notify_all();
        Ok(())
    }

    fn nack_requeue(&self, queue: &str, tag: u64) -> Result<(), BusError> {
        let mut inner = self.lock();
        let state = inner
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::Permanent(format!("queue '{queue}' not declared")))?;
        let mut delivery = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| BusError::Permanent(format!("unknown delivery tag {tag}")))?;
        delivery.attempt += 1;
        state.pending.push_front(delivery);
        self.wakeup.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EVENTS_EXCHANGE;

    fn setup(queue: &str, pattern: &str) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_exchange(EVENTS_EXCHANGE).unwrap();
        broker.declare_queue(queue).unwrap();
        broker
            .bind(queue, EVENTS_EXCHANGE, &pattern.parse().unwrap())
            .unwrap();
        broker
    }

    fn publish(broker: &InMemoryBroker, key: &str, payload: &[u8]) {
        broker
            .publish(EVENTS_EXCHANGE, &key.parse().unwrap(), payload)
            .unwrap();
    }

    #[test]
    fn routes_by_pattern() {
        let broker = setup("inventory", "pos.sale.*");
        publish(&broker, "pos.sale.closed", b"a");
        publish(&broker, "purchase.order.received", b"b");
        assert_eq!(broker.queue_depth("inventory"), 1);
    }

    #[test]
    fn fifo_order_preserved() {
        let broker = setup("q", "pos.#");
        publish(&broker, "pos.sale.closed", b"1");
        publish(&broker, "pos.sale.closed", b"2");

        let first = broker.receive("q", Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(first.payload, b"1");
        broker.ack("q", first.tag).unwrap();

        let second = broker.receive("q", Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(second.payload, b"2");
    }

    #[test]
    fn prefetch_one_blocks_until_ack() {
        let broker = setup("q", "#");
        publish(&broker, "pos.sale.closed", b"1");
        publish(&broker, "pos.sale.closed", b"2");

        let first = broker.receive("q", Duration::from_millis(10)).unwrap().unwrap();
        // Second receive must wait for the ack.
        assert!(broker.receive("q", Duration::from_millis(10)).unwrap().is_none());
        broker.ack("q", first.tag).unwrap();
        assert!(broker.receive("q", Duration::from_millis(10)).unwrap().is_some());
    }

    #[test]
    fn nack_requeues_at_front_with_attempt_bump() {
        let broker = setup("q", "#");
        publish(&broker, "pos.sale.closed", b"1");
        publish(&broker, "pos.sale.closed", b"2");

        let first = broker.receive("q", Duration::from_millis(10)).unwrap().unwrap();
        broker.nack_requeue("q", first.tag).unwrap();

        let redelivered = broker.receive("q", Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(redelivered.payload, b"1");
        assert_eq!(redelivered.attempt, 2);
    }

    #[test]
    fn fan_out_to_multiple_queues() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange(EVENTS_EXCHANGE).unwrap();
        for queue in ["inventory", "accounting", "loyalty"] {
            broker.declare_queue(queue).unwrap();
            broker
                .bind(queue, EVENTS_EXCHANGE, &"pos.sale.closed".parse().unwrap())
                .unwrap();
        }
        publish(&broker, "pos.sale.closed", b"sale");
        for queue in ["inventory", "accounting", "loyalty"] {
            assert_eq!(broker.queue_depth(queue), 1, "{queue}");
        }
    }

    #[test]
    fn undeclared_targets_are_permanent_errors() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.receive("nope", Duration::from_millis(1)),
            Err(BusError::Permanent(_))
        ));
        assert!(matches!(
            broker.publish(EVENTS_EXCHANGE, &"a.b".parse().unwrap(), b""),
            Err(BusError::Permanent(_))
        ));
    }
}
