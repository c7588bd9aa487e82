//! queue module: the per-event triple-stream priority queue plus its two
//! satellite pieces, the request-status store and the long-running worker.

pub mod request_status;
pub mod worker;

use crate::config::QueueConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{Priority, ReservationRequestPayload};
use crate::redis_client::RedisClient;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use ulid::Ulid;

pub const CONSUMER_GROUP: &str = "reservation_workers";

/// Smoothing factor for the per-event completion-rate estimate: how much
/// weight the most recent inter-completion gap carries against the running
/// average. Higher reacts faster to bursts, lower rides out noise.
const THROUGHPUT_EWMA_ALPHA: f64 = 0.2;

pub fn stream_key(event_id: i64, priority: Priority) -> String {
    format!("queue:{}:{}", event_id, priority.as_str())
}

pub fn dead_letter_key(event_id: i64) -> String {
    format!("queue:{}:dead", event_id)
}

/// One message dequeued from a priority stream, still unacknowledged.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub event_id: i64,
    pub priority: Priority,
    pub stream_id: String,
    pub request_id: String,
    pub payload: ReservationRequestPayload,
    pub delivery_count: u32,
}

/// Tracks a moving average of completions-per-second for one event, fed by
/// `PriorityQueue::record_completion` every time the worker finishes a
/// request for that event.
struct ThroughputTracker {
    last_completed_at: Instant,
    rate_per_second: f64,
}

#[derive(Clone)]
pub struct PriorityQueue {
    redis: RedisClient,
    config: QueueConfig,
    throughput: Arc<StdMutex<HashMap<i64, ThroughputTracker>>>,
}

impl PriorityQueue {
    pub fn new(redis: RedisClient, config: QueueConfig) -> Self {
        Self {
            redis,
            config,
            throughput: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Folds one more completed request for `event_id` into its EWMA
    /// throughput estimate. Call this once per request that reaches
    /// Completed, right before or after acking it.
    pub fn record_completion(&self, event_id: i64) {
        let now = Instant::now();
        let mut guard = self.throughput.lock().unwrap_or_else(|e| e.into_inner());
        let tracker = guard.entry(event_id).or_insert_with(|| ThroughputTracker {
            last_completed_at: now,
            rate_per_second: 0.0,
        });
        let elapsed = now.duration_since(tracker.last_completed_at).as_secs_f64().max(0.001);
        let instantaneous_rate = 1.0 / elapsed;
        tracker.rate_per_second = THROUGHPUT_EWMA_ALPHA * instantaneous_rate
            + (1.0 - THROUGHPUT_EWMA_ALPHA) * tracker.rate_per_second;
        tracker.last_completed_at = now;
    }

    fn throughput_per_second(&self, event_id: i64) -> f64 {
        self.throughput
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event_id)
            .map(|t| t.rate_per_second)
            .unwrap_or(0.0)
    }

    /// Creates the `reservation_workers` consumer group on a stream if it
    /// doesn't exist yet. `MKSTREAM` so enqueueing an empty event's first
    /// request doesn't race stream creation against group creation.
    pub async fn ensure_group(&self, stream: &str) -> EngineResult<()> {
        let mut conn = self.redis.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(CONSUMER_GROUP)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(EngineError::Cache(e)),
        }
    }

    /// Allocates a time-ordered id, writes the Pending status record, then
    /// appends to the priority stream. Non-blocking -- does not wait for a
    /// worker to pick it up.
    pub async fn enqueue(
        &self,
        status_store: &request_status::RequestStatusStore,
        priority: Priority,
        payload: ReservationRequestPayload,
    ) -> EngineResult<String> {
        let request_id = Ulid::new().to_string();
        status_store
            .create_pending(
                &request_id,
                priority,
                payload.event_id,
                &payload.seat_ids,
                &payload.user_id,
            )
            .await?;

        let stream = stream_key(payload.event_id, priority);
        self.ensure_group(&stream).await?;

        let seat_ids_json = serde_json::to_string(&payload.seat_ids).unwrap_or_else(|_| "[]".into());
        let mut conn = self.redis.conn.clone();
        let _stream_id: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg("request_id")
            .arg(&request_id)
            .arg("event_id")
            .arg(payload.event_id)
            .arg("seat_ids")
            .arg(seat_ids_json)
            .arg("user_id")
            .arg(&payload.user_id)
            .query_async(&mut conn)
            .await
            .map_err(EngineError::Cache)?;

        Ok(request_id)
    }

    /// Reads up to `count` new messages for `priority` on `event_id` for
    /// `consumer_name`, claiming them into the consumer group's PEL. Part
    /// of the priority-weighted draining round implemented by the worker.
    pub async fn read_batch(
        &self,
        event_id: i64,
        priority: Priority,
        consumer_name: &str,
        count: usize,
    ) -> EngineResult<Vec<QueueMessage>> {
        let stream = stream_key(event_id, priority);
        self.ensure_group(&stream).await?;

        let mut conn = self.redis.conn.clone();
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(CONSUMER_GROUP)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(EngineError::Cache)?;

        Ok(parse_stream_reply(reply, event_id, priority))
    }

    pub async fn ack(&self, event_id: i64, priority: Priority, stream_id: &str) -> EngineResult<()> {
        let stream = stream_key(event_id, priority);
        let mut conn = self.redis.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(&stream)
            .arg(CONSUMER_GROUP)
            .arg(stream_id)
            .query_async(&mut conn)
            .await
            .map_err(EngineError::Cache)?;
        Ok(())
    }

    /// Moves a message past its retry budget to the dead-letter stream and
    /// acknowledges it on the source stream so it leaves the PEL.
    pub async fn dead_letter(&self, message: &QueueMessage) -> EngineResult<()> {
        let mut conn = self.redis.conn.clone();
        let seat_ids_json =
            serde_json::to_string(&message.payload.seat_ids).unwrap_or_else(|_| "[]".into());
        let _: String = redis::cmd("XADD")
            .arg(dead_letter_key(message.event_id))
            .arg("*")
            .arg("request_id")
            .arg(&message.request_id)
            .arg("event_id")
            .arg(message.event_id)
            .arg("seat_ids")
            .arg(seat_ids_json)
            .arg("user_id")
            .arg(&message.payload.user_id)
            .arg("delivery_count")
            .arg(message.delivery_count)
            .query_async(&mut conn)
            .await
            .map_err(EngineError::Cache)?;

        self.ack(message.event_id, message.priority, &message.stream_id).await
    }

    /// Scans the pending-entries list for `priority` on `event_id` via
    /// `XPENDING` to learn each stuck message's true delivery count, then
    /// either `XCLAIM`s it into `consumer_name`'s ownership (delivery count
    /// still under `max_deliveries`) or reads it straight off the stream
    /// with `XRANGE` for the caller to dead-letter (budget exceeded). Using
    /// `XAUTOCLAIM` alone would silently reassign ownership without ever
    /// exposing the per-message delivery count, which is what
    /// `MAX_DELIVERIES` has to be checked against.
    pub async fn reclaim_stale(
        &self,
        event_id: i64,
        priority: Priority,
        consumer_name: &str,
    ) -> EngineResult<Vec<QueueMessage>> {
        let stream = stream_key(event_id, priority);
        let mut conn = self.redis.conn.clone();

        let pending_reply: redis::Value = redis::cmd("XPENDING")
            .arg(&stream)
            .arg(CONSUMER_GROUP)
            .arg("IDLE")
            .arg(self.config.pel_reclaim_idle_ms)
            .arg("-")
            .arg("+")
            .arg(100)
            .query_async(&mut conn)
            .await
            .map_err(EngineError::Cache)?;
        let pending = parse_pending_reply(pending_reply);

        let mut out = Vec::new();
        for entry in pending {
            if entry.delivery_count > self.config.max_deliveries {
                let range: redis::Value = redis::cmd("XRANGE")
                    .arg(&stream)
                    .arg(&entry.id)
                    .arg(&entry.id)
                    .query_async(&mut conn)
                    .await
                    .map_err(EngineError::Cache)?;
                if let Some(mut msg) = parse_entries_array(range, event_id, priority).into_iter().next() {
                    msg.delivery_count = entry.delivery_count;
                    out.push(msg);
                }
            } else {
                let claimed: redis::Value = redis::cmd("XCLAIM")
                    .arg(&stream)
                    .arg(CONSUMER_GROUP)
                    .arg(consumer_name)
                    .arg(self.config.pel_reclaim_idle_ms)
                    .arg(&entry.id)
                    .query_async(&mut conn)
                    .await
                    .map_err(EngineError::Cache)?;
                for mut msg in parse_entries_array(claimed, event_id, priority) {
                    msg.delivery_count = entry.delivery_count + 1;
                    out.push(msg);
                }
            }
        }
        Ok(out)
    }

    pub fn max_deliveries(&self) -> u32 {
        self.config.max_deliveries
    }

    /// Pending count per priority, plus a wait estimate derived from the
    /// observed completion throughput for this event. `XLEN` approximates
    /// backlog size; exact lag accounting needs `XINFO GROUPS`, which not
    /// every Redis-compatible backend reports.
    pub async fn stats(&self, event_id: i64) -> EngineResult<QueueStats> {
        let mut conn = self.redis.conn.clone();
        let mut pending_by_priority = std::collections::HashMap::new();
        let mut total_pending: i64 = 0;

        for priority in Priority::ALL {
            let stream = stream_key(event_id, priority);
            let len: i64 = conn.xlen(&stream).await.unwrap_or(0);
            pending_by_priority.insert(priority.as_str().to_string(), len);
            total_pending += len;
        }

        let throughput = self.throughput_per_second(event_id);
        let estimated_wait_seconds = if throughput > 0.0 {
            Some((total_pending as f64 / throughput).round() as u64)
        } else {
            None
        };

        Ok(QueueStats {
            pending_by_priority,
            total_pending,
            estimated_wait_seconds,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub pending_by_priority: std::collections::HashMap<String, i64>,
    pub total_pending: i64,
    /// `None` until at least one request for this event has completed and
    /// a throughput estimate exists to divide the backlog by.
    pub estimated_wait_seconds: Option<u64>,
}

fn field_str(fields: &[redis::Value], name: &str) -> Option<String> {
    let mut iter = fields.iter();
    while let (Some(redis::Value::BulkString(k)), Some(v)) = (iter.next(), iter.next()) {
        if k == name.as_bytes() {
            return value_to_string(v);
        }
    }
    None
}

fn value_to_string(v: &redis::Value) -> Option<String> {
    match v {
        redis::Value::BulkString(b) => Some(String::from_utf8_lossy(b).into_owned()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn parse_entry(
    entry: &redis::Value,
    event_id: i64,
    priority: Priority,
) -> Option<QueueMessage> {
    let redis::Value::Array(pair) = entry else { return None };
    let [redis::Value::BulkString(id_bytes), redis::Value::Array(fields)] = pair.as_slice() else {
        return None;
    };
    let stream_id = String::from_utf8_lossy(id_bytes).into_owned();
    let request_id = field_str(fields, "request_id")?;
    let user_id = field_str(fields, "user_id")?;
    let seat_ids: Vec<i64> = field_str(fields, "seat_ids")
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Some(QueueMessage {
        event_id,
        priority,
        stream_id,
        request_id,
        payload: ReservationRequestPayload {
            event_id,
            seat_ids,
            user_id,
        },
        delivery_count: 1,
    })
}

/// Parses the nested `XREADGROUP` reply shape:
/// `[[stream_name, [[id, [field, value, ...]], ...]]]`.
fn parse_stream_reply(reply: redis::Value, event_id: i64, priority: Priority) -> Vec<QueueMessage> {
    let mut out = Vec::new();
    let redis::Value::Array(streams) = reply else { return out };
    for stream_entry in streams {
        let redis::Value::Array(pair) = stream_entry else { continue };
        let [_name, redis::Value::Array(entries)] = pair.as_slice() else { continue };
        for entry in entries {
            if let Some(msg) = parse_entry(entry, event_id, priority) {
                out.push(msg);
            }
        }
    }
    out
}

/// Parses a flat array of `[id, [field,value,...]]` entries, the shape
/// shared by `XRANGE` and `XCLAIM` (non-`JUSTID`) replies.
fn parse_entries_array(reply: redis::Value, event_id: i64, priority: Priority) -> Vec<QueueMessage> {
    let mut out = Vec::new();
    let redis::Value::Array(entries) = reply else { return out };
    for entry in entries {
        if let Some(msg) = parse_entry(&entry, event_id, priority) {
            out.push(msg);
        }
    }
    out
}

/// One row of an `XPENDING key group IDLE ms - + count` summary: the
/// message id and how many times it has been delivered so far.
struct PendingEntry {
    id: String,
    delivery_count: u32,
}

fn parse_pending_reply(reply: redis::Value) -> Vec<PendingEntry> {
    let mut out = Vec::new();
    let redis::Value::Array(rows) = reply else { return out };
    for row in rows {
        let redis::Value::Array(fields) = row else { continue };
        let [redis::Value::BulkString(id_bytes), _consumer, _idle, delivery] = fields.as_slice() else {
            continue;
        };
        let delivery_count = match delivery {
            redis::Value::Int(n) => *n as u32,
            _ => 1,
        };
        out.push(PendingEntry {
            id: String::from_utf8_lossy(id_bytes).into_owned(),
            delivery_count,
        });
    }
    out
}
