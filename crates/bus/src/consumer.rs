//! Long-running consumer runtime.
//!
//! One worker per queue: declare, bind, then loop read → decode → dispatch →
//! ack. Reconnects with capped exponential backoff on transient broker
//! failure; drains the in-flight delivery on shutdown. Handlers must be
//! idempotent — the runtime gives at-least-once, never exactly-once.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BusError, Delivery};
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::event::Event;
use crate::topic::BindingPattern;

/// What a handler decided about one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Done; ack.
    Completed,
    /// Transient trouble; redeliver while the retry budget lasts.
    Retry(String),
    /// Never going to work; ack and dead-letter.
    Reject(String),
}

/// Event handler bound to a queue.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> HandlerOutcome;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> HandlerOutcome + Send + Sync,
{
    fn handle(&self, event: &Event) -> HandlerOutcome {
        self(event)
    }
}

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Durable queue name (also the worker thread name).
    pub queue: String,
    /// Exchange to bind against.
    pub exchange: String,
    /// Routing-key patterns for the binding.
    pub bindings: Vec<BindingPattern>,
    /// Delivery attempts before dead-lettering.
    pub max_attempts: u32,
    /// Idle poll timeout per receive.
    pub receive_timeout: Duration,
    /// Base reconnect delay (doubles per failure).
    pub reconnect_base: Duration,
    /// Reconnect delay cap.
    pub reconnect_cap: Duration,
}

impl ConsumerConfig {
    pub fn new(queue: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            bindings: Vec::new(),
            max_attempts: 5,
            receive_timeout: Duration::from_millis(500),
            reconnect_base: Duration::from_millis(200),
            reconnect_cap: Duration::from_secs(30),
        }
    }

    pub fn bind(mut self, pattern: BindingPattern) -> Self {
        self.bindings.push(pattern);
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }
}

/// Runtime counters.
#[derive(Debug, Clone, Default)]
pub struct ConsumerStats {
    pub handled: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub panics: u64,
    pub reconnects: u64,
}

/// Handle to a running consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl ConsumerHandle {
    /// Request graceful shutdown and wait for the in-flight delivery to drain.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Spawns consumer workers over one broker.
pub struct ConsumerRuntime {
    broker: Arc<dyn Broker>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl ConsumerRuntime {
    pub fn new(broker: Arc<dyn Broker>, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            broker,
            dead_letters,
        }
    }

    /// Spawn a worker thread for `config.queue`.
    pub fn spawn(&self, config: ConsumerConfig, handler: Arc<dyn EventHandler>) -> ConsumerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ConsumerStats::default()));
        let worker = Worker {
            broker: self.broker.clone(),
            dead_letters: self.dead_letters.clone(),
            config,
            handler,
            stats: stats.clone(),
        };

        let name = worker.config.queue.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run(shutdown_rx))
            .expect("failed to spawn consumer thread");

        ConsumerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

struct Worker {
    broker: Arc<dyn Broker>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: ConsumerConfig,
    handler: Arc<dyn EventHandler>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl Worker {
    fn run(&self, shutdown_rx: mpsc::Receiver<()>) {
        info!(queue = %self.config.queue, "consumer started");
        let mut reconnect_delay = self.config.reconnect_base;

        'outer: loop {
            if let Err(e) = self.declare_and_bind() {
                warn!(queue = %self.config.queue, error = %e, "declare/bind failed; backing off");
                self.bump(|s| s.reconnects += 1);
                if self.sleep_or_shutdown(&shutdown_rx, reconnect_delay) {
                    break 'outer;
                }
                reconnect_delay = (reconnect_delay * 2).min(self.config.reconnect_cap);
                continue;
            }
            reconnect_delay = self.config.reconnect_base;

            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break 'outer;
                }
                match self.broker.receive(&self.config.queue, self.config.receive_timeout) {
                    Ok(Some(delivery)) => self.dispatch(delivery),
                    Ok(None) => {}
                    Err(BusError::Transient(e)) => {
                        warn!(queue = %self.config.queue, error = %e, "broker connection lost; reconnecting");
                        self.bump(|s| s.reconnects += 1);
                        if self.sleep_or_shutdown(&shutdown_rx, reconnect_delay) {
                            break 'outer;
                        }
                        reconnect_delay = (reconnect_delay * 2).min(self.config.reconnect_cap);
                        continue 'outer;
                    }
                    Err(BusError::Permanent(e)) => {
                        error!(queue = %self.config.queue, error = %e, "unrecoverable broker error; consumer stopping");
                        break 'outer;
                    }
                }
            }
        }

        info!(queue = %self.config.queue, "consumer stopped");
    }

    fn declare_and_bind(&self) -> Result<(), BusError> {
        self.broker.declare_exchange(&self.config.exchange)?;
        self.broker.declare_queue(&self.config.queue)?;
        for pattern in &self.config.bindings {
            self.broker.bind(&self.config.queue, &self.config.exchange, pattern)?;
        }
        Ok(())
    }

    fn dispatch(&self, delivery: Delivery) {
        let event = match Event::decode(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                // Malformed payloads are permanent: ack + dead-letter.
                self.ack(delivery.tag);
                self.dead_letter(&delivery, format!("malformed payload: {e}"));
                return;
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| self.handler.handle(&event)));
        self.bump(|s| s.handled += 1);

        match outcome {
            Err(_) => {
                // A panicking handler would loop forever on redelivery.
                error!(
                    queue = %self.config.queue,
                    routing_key = %delivery.routing_key,
                    "handler panicked; acking to avoid redelivery loop"
                );
                self.bump(|s| s.panics += 1);
                self.ack(delivery.tag);
            }
            Ok(HandlerOutcome::Completed) => self.ack(delivery.tag),
            Ok(HandlerOutcome::Retry(reason)) => {
                if delivery.attempt < self.config.max_attempts {
                    debug!(
                        queue = %self.config.queue,
                        routing_key = %delivery.routing_key,
                        attempt = delivery.attempt,
                        reason = %reason,
                        "redelivering"
                    );
                    self.bump(|s| s.retried += 1);
                    if let Err(e) = self.broker.nack_requeue(&self.config.queue, delivery.tag) {
                        warn!(queue = %self.config.queue, error = %e, "nack failed");
                    }
                } else {
                    self.ack(delivery.tag);
                    self.dead_letter(&delivery, format!("retry budget exhausted: {reason}"));
                }
            }
            Ok(HandlerOutcome::Reject(reason)) => {
                self.ack(delivery.tag);
                self.dead_letter(&delivery, reason);
            }
        }
    }

    fn ack(&self, tag: u64) {
        if let Err(e) = self.broker.ack(&self.config.queue, tag) {
            warn!(queue = %self.config.queue, tag, error = %e, "ack failed");
        }
    }

    fn dead_letter(&self, delivery: &Delivery, reason: String) {
        self.bump(|s| s.dead_lettered += 1);
        self.dead_letters.record(DeadLetter {
            queue: self.config.queue.clone(),
            routing_key: delivery.routing_key.clone(),
            payload: delivery.payload.clone(),
            reason,
            attempts: delivery.attempt,
            at: Utc::now(),
        });
    }

    fn bump(&self, f: impl FnOnce(&mut ConsumerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(|p| p.into_inner()));
    }

    /// Sleep for `delay`, returning true if shutdown arrived meanwhile.
    fn sleep_or_shutdown(&self, shutdown_rx: &mpsc::Receiver<()>, delay: Duration) -> bool {
        matches!(
            shutdown_rx.recv_timeout(delay),
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected)
        )
    }
}
