//! Dead-letter sink for deliveries that will never be retried.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::error;

/// A message that exhausted its retries or was rejected outright.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub reason: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

pub trait DeadLetterSink: Send + Sync {
    fn record(&self, letter: DeadLetter);
}

/// Keeps dead letters in memory for inspection (dev/tests).
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn record(&self, letter: DeadLetter) {
        error!(
            queue = %letter.queue,
            routing_key = %letter.routing_key,
            reason = %letter.reason,
            attempts = letter.attempts,
            "message dead-lettered"
        );
        self.letters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(letter);
    }
}
