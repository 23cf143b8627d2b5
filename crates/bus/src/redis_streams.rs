//! Redis Streams transport (durable, at-least-once).
//!
//! Mapping of topic semantics onto streams:
//! - exchange → stream key `loom:<exchange>`
//! - queue → consumer group on every stream it is bound to
//! - binding patterns are filtered consumer-side; non-matching entries are
//!   acked immediately so they don't sit pending
//! - ack → XACK; nack is the *absence* of an XACK — the entry stays pending
//!   and is reclaimed (with its delivery count) once `pending_timeout` passes
//!
//! `BROKER_URL` points at the Redis endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{instrument, warn};

use crate::broker::{Broker, BusError, Delivery};
use crate::event::RoutingKey;
use crate::topic::BindingPattern;

const STREAM_PREFIX: &str = "loom";

/// Pending entries idle longer than this are reclaimed for redelivery.
const DEFAULT_PENDING_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Default)]
struct State {
    /// queue → (stream, pattern) bindings.
    bindings: HashMap<String, Vec<(String, BindingPattern)>>,
    /// (queue, tag) → (stream, entry id) for acking.
    tags: HashMap<(String, u64), (String, String)>,
    next_tag: u64,
}

/// Broker over Redis Streams.
pub struct RedisBroker {
    client: Arc<redis::Client>,
    consumer_name: String,
    pending_timeout_ms: u64,
    state: Mutex<State>,
}

impl RedisBroker {
    pub fn connect(broker_url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(broker_url)
            .map_err(|e| BusError::Transient(format!("broker url: {e}")))?;
        Ok(Self {
            client: Arc::new(client),
            consumer_name: format!("worker-{}", std::process::id()),
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
            state: Mutex::new(State::default()),
        })
    }

    fn conn(&self) -> Result<redis::Connection, BusError> {
        self.client
            .get_connection()
            .map_err(|e| BusError::Transient(format!("redis connection: {e}")))
    }

    fn stream_key(exchange: &str) -> String {
        format!("{STREAM_PREFIX}:{exchange}")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Streams this queue is bound to.
    fn bound_streams(&self, queue: &str) -> Vec<String> {
        let state = self.lock();
        let mut streams: Vec<String> = state
            .bindings
            .get(queue)
            .map(|b| b.iter().map(|(s, _)| s.clone()).collect())
            .unwrap_or_default();
        streams.dedup();
        streams
    }

    fn key_matches(&self, queue: &str, stream: &str, key: &RoutingKey) -> bool {
        let state = self.lock();
        state
            .bindings
            .get(queue)
            .map(|bindings| {
                bindings
                    .iter()
                    .any(|(s, pattern)| s == stream && pattern.matches(key))
            })
            .unwrap_or(false)
    }

    /// Reclaim one stale pending entry for this consumer group, if any.
    fn claim_stale(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        queue: &str,
    ) -> Result<Option<(String, HashMap<String, String>, u32)>, BusError> {
        // XPENDING summary per consumer; "-" "+" 1 scans the oldest entry.
        let pending: redis::RedisResult<Vec<(String, String, u64, u64)>> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(queue)
            .arg("IDLE")
            .arg(self.pending_timeout_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query(conn);

        let Ok(entries) = pending else {
            return Ok(None);
        };
        let Some((id, _consumer, _idle, delivery_count)) = entries.into_iter().next() else {
            return Ok(None);
        };

        let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(queue)
            .arg(&self.consumer_name)
            .arg(self.pending_timeout_ms)
            .arg(&id)
            .query(conn)
            .map_err(|e| BusError::Transient(format!("XCLAIM: {e}")))?;

        for entry in claimed {
            if let Some((entry_id, fields)) = parse_entry(&entry) {
                return Ok(Some((entry_id, fields, delivery_count as u32)));
            }
        }
        Ok(None)
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        queue: &str,
        block_ms: u64,
    ) -> Result<Option<(String, HashMap<String, String>)>, BusError> {
        let result: redis::RedisResult<HashMap<String, Vec<redis::Value>>> =
            redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(queue)
                .arg(&self.consumer_name)
                .arg("COUNT")
                .arg(1)
                .arg("BLOCK")
                .arg(block_ms)
                .arg("STREAMS")
                .arg(stream)
                .arg(">")
                .query(conn);

        let data = match result {
            Ok(data) => data,
            // Nil reply on blocking timeout surfaces as a type error.
            Err(e) if e.kind() == redis::ErrorKind::TypeError => return Ok(None),
            Err(e) => return Err(BusError::Transient(format!("XREADGROUP: {e}"))),
        };

        for entry in data.get(stream).into_iter().flatten() {
            if let Some(parsed) = parse_entry(entry) {
                return Ok(Some(parsed));
            }
        }
        Ok(None)
    }

    fn make_delivery(
        &self,
        queue: &str,
        stream: &str,
        entry_id: String,
        fields: HashMap<String, String>,
        attempt: u32,
        conn: &mut redis::Connection,
    ) -> Result<Option<Delivery>, BusError> {
        let routing_key = fields.get("routing_key").cloned().unwrap_or_default();
        let payload = fields.get("payload").cloned().unwrap_or_default();

        // Filter against this queue's bindings; non-matching entries are
        // acked so the group doesn't accumulate them as pending.
        let matches = routing_key
            .parse::<RoutingKey>()
            .map(|key| self.key_matches(queue, stream, &key))
            .unwrap_or(false);
        if !matches {
            let _: redis::RedisResult<u64> = redis::cmd("XACK")
                .arg(stream)
                .arg(queue)
                .arg(&entry_id)
                .query(conn);
            return Ok(None);
        }

        let mut state = self.lock();
        state.next_tag += 1;
        let tag = state.next_tag;
        state
            .tags
            .insert((queue.to_string(), tag), (stream.to_string(), entry_id));
        Ok(Some(Delivery {
            tag,
            routing_key,
            payload: payload.into_bytes(),
            attempt,
        }))
    }
}

impl Broker for RedisBroker {
    fn declare_exchange(&self, _exchange: &str) -> Result<(), BusError> {
        // Streams are created on first XADD / XGROUP MKSTREAM.
        Ok(())
    }

    fn declare_queue(&self, queue: &str) -> Result<(), BusError> {
        self.lock().bindings.entry(queue.to_string()).or_default();
        Ok(())
    }

    fn bind(&self, queue: &str, exchange: &str, pattern: &BindingPattern) -> Result<(), BusError> {
        let stream = Self::stream_key(exchange);
        let mut conn = self.conn()?;

        // Consumer group per queue; MKSTREAM creates the stream, an existing
        // group is fine (BUSYGROUP is ignored).
        let _: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream)
            .arg(queue)
            .arg("$")
            .arg("MKSTREAM")
            .query(&mut conn);

        let mut state = self.lock();
        let bindings = state.bindings.entry(queue.to_string()).or_default();
        let entry = (stream, pattern.clone());
        if !bindings.contains(&entry) {
            bindings.push(entry);
        }
        Ok(())
    }

    #[instrument(skip(self, payload), fields(exchange = %exchange, routing_key = %routing_key), err)]
    fn publish(
        &self,
        exchange: &str,
        routing_key: &RoutingKey,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let payload = std::str::from_utf8(payload)
            .map_err(|e| BusError::Permanent(format!("payload not utf-8: {e}")))?;
        let mut conn = self.conn()?;
        let _: String = redis::cmd("XADD")
            .arg(Self::stream_key(exchange))
            .arg("*")
            .arg("routing_key")
            .arg(routing_key.as_str())
            .arg("payload")
            .arg(payload)
            .query(&mut conn)
            .map_err(|e| BusError::Transient(format!("XADD: {e}")))?;
        Ok(())
    }

    fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>, BusError> {
        let streams = self.bound_streams(queue);
        if streams.is_empty() {
            return Err(BusError::Permanent(format!("queue '{queue}' has no bindings")));
        }
        let mut conn = self.conn()?;
        let block_ms = (timeout.as_millis() as u64).max(1) / streams.len() as u64;

        for stream in streams {
            // Stale pending entries (redeliveries) take priority.
            if let Some((id, fields, delivery_count)) = self.claim_stale(&mut conn, &stream, queue)? {
                if let Some(delivery) =
                    self.make_delivery(queue, &stream, id, fields, delivery_count, &mut conn)?
                {
                    return Ok(Some(delivery));
                }
            }
            if let Some((id, fields)) = self.read_new(&mut conn, &stream, queue, block_ms.max(1))? {
                if let Some(delivery) = self.make_delivery(queue, &stream, id, fields, 1, &mut conn)? {
                    return Ok(Some(delivery));
                }
            }
        }
        Ok(None)
    }

    fn ack(&self, queue: &str, tag: u64) -> Result<(), BusError> {
        let Some((stream, id)) = self.lock().tags.remove(&(queue.to_string(), tag)) else {
            return Err(BusError::Permanent(format!("unknown delivery tag {tag}")));
        };
        let mut conn = self.conn()?;
        let _: u64 = redis::cmd("XACK")
            .arg(&stream)
            .arg(queue)
            .arg(&id)
            .query(&mut conn)
            .map_err(|e| BusError::Transient(format!("XACK: {e}")))?;
        Ok(())
    }

    fn nack_requeue(&self, queue: &str, tag: u64) -> Result<(), BusError> {
        // No XACK: the entry stays pending and is reclaimed after the idle
        // timeout with its delivery count intact.
        if self.lock().tags.remove(&(queue.to_string(), tag)).is_none() {
            warn!(queue = %queue, tag, "nack for unknown delivery tag");
        }
        Ok(())
    }
}

/// Entry format: [entry_id, [field, value, field, value, ...]].
fn parse_entry(entry: &redis::Value) -> Option<(String, HashMap<String, String>)> {
    let redis::Value::Bulk(parts) = entry else {
        return None;
    };
    let [id_value, fields_value, ..] = parts.as_slice() else {
        return None;
    };
    let redis::Value::Data(id_bytes) = id_value else {
        return None;
    };
    let redis::Value::Bulk(field_values) = fields_value else {
        return None;
    };

    let mut fields = HashMap::new();
    for chunk in field_values.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
            fields.insert(
                String::from_utf8_lossy(key).to_string(),
                String::from_utf8_lossy(value).to_string(),
            );
        }
    }
    Some((String::from_utf8_lossy(id_bytes).to_string(), fields))
}
