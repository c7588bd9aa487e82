//! notify.rs
//!
//! In-process registry from request-id/user-id to live listeners.
//! Grounded on the broadcast-channel fan-out pattern used for reservation
//! scheduling elsewhere in the corpus: one bounded channel per listener so
//! a slow WebSocket client can never stall delivery to the rest.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::redis_client::RedisClient;

/// Channel buffer size per listener. A listener whose inbox fills up is
/// disconnected with `SlowConsumer` rather than allowed to block senders.
const LISTENER_BUFFER: usize = 32;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyMessage {
    StatusUpdate { request_id: String, state: String },
    ReservationComplete {
        request_id: String,
        reservation_ids: Vec<i64>,
        seat_ids: Vec<i64>,
        expires_at: chrono::NaiveDateTime,
    },
    ReservationFailed { request_id: String, kind: String, message: String },
    ReservationCancelled { request_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    SlowConsumer,
    Unregistered,
}

pub struct ListenerHandle {
    pub id: u64,
    pub receiver: mpsc::Receiver<NotifyMessage>,
}

/// A registration key: listeners subscribe either to a request_id or to a
/// user_id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Request(String),
    User(String),
}

impl Topic {
    /// The `notify:request:{id}` / `notify:user:{id}` pub/sub channel name
    /// a worker on another API instance publishes to and every instance's
    /// hub subscribes to.
    fn channel(&self) -> String {
        match self {
            Topic::Request(id) => format!("notify:request:{id}"),
            Topic::User(id) => format!("notify:user:{id}"),
        }
    }

    /// Recovers a `Topic` from an inbound pub/sub channel name.
    fn from_channel(channel: &str) -> Option<Topic> {
        if let Some(id) = channel.strip_prefix("notify:request:") {
            Some(Topic::Request(id.to_string()))
        } else if let Some(id) = channel.strip_prefix("notify:user:") {
            Some(Topic::User(id.to_string()))
        } else {
            None
        }
    }
}

/// Envelope carried over the Redis pub/sub channel so a receiving instance
/// can tell its own locally-originated publishes (already delivered
/// in-process) apart from ones it needs to relay from elsewhere.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    origin: String,
    message: NotifyMessage,
}

struct Listener {
    id: u64,
    sender: mpsc::Sender<NotifyMessage>,
}

/// Per-process notification fan-out. One instance is shared through
/// `AppState`; cross-instance delivery (a worker on a different API
/// process publishing to a listener here) rides the `notify:{topic}`
/// Redis pub/sub channels the hub subscribes to via `run_redis_bridge`.
pub struct NotificationHub {
    listeners: StdMutex<HashMap<Topic, Vec<Listener>>>,
    next_id: AtomicU64,
    instance_id: String,
    redis: StdMutex<Option<RedisClient>>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            listeners: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            instance_id: Uuid::new_v4().to_string(),
            redis: StdMutex::new(None),
        }
    }

    /// Wires the hub up to Redis so its publishes also reach other API
    /// instances. Without this the hub still works, purely in-process
    /// (what the unit tests below exercise).
    pub fn attach_redis(&self, redis: RedisClient) {
        *self.redis.lock().unwrap_or_else(|e| e.into_inner()) = Some(redis);
    }

    /// Returns a handle whose receiver yields messages published to
    /// `topic`. Dropping the handle (or calling `deregister`) is the
    /// cancellation path.
    pub fn register(&self, topic: Topic) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic)
            .or_default()
            .push(Listener { id, sender: tx });
        ListenerHandle { id, receiver: rx }
    }

    /// Idempotent: deregistering an id that's already gone is a no-op.
    pub fn deregister(&self, topic: &Topic, id: u64) {
        if let Some(list) = self.listeners.lock().unwrap_or_else(|e| e.into_inner()).get_mut(topic) {
            list.retain(|l| l.id != id);
        }
    }

    /// Delivers `message` to every listener on `topic`, then (if wired to
    /// Redis) relays it so any other API instance's hub can do the same for
    /// listeners connected there. A request's WebSocket client may be
    /// connected to a different instance than the one whose worker produced
    /// the outcome, so both halves matter.
    pub fn publish(&self, topic: &Topic, message: NotifyMessage) {
        self.deliver_local(topic, &message);

        let redis = self.redis.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(redis) = redis {
            let envelope = WireEnvelope {
                origin: self.instance_id.clone(),
                message,
            };
            let channel = topic.channel();
            tokio::spawn(async move {
                let Ok(payload) = serde_json::to_string(&envelope) else { return };
                let mut conn = redis.conn.clone();
                let result: redis::RedisResult<()> = redis::cmd("PUBLISH")
                    .arg(&channel)
                    .arg(payload)
                    .query_async(&mut conn)
                    .await;
                if let Err(e) = result {
                    warn!(error = %e, channel, "failed to relay notification over redis");
                }
            });
        }
    }

    /// In-process-only delivery: every listener currently registered on
    /// `topic` gets the message. A full channel means the listener is too
    /// slow; it is dropped from the registry rather than allowed to
    /// back-pressure the publisher.
    fn deliver_local(&self, topic: &Topic, message: &NotifyMessage) {
        let mut dead = Vec::new();
        {
            let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(list) = guard.get(topic) {
                for listener in list {
                    if let Err(mpsc::error::TrySendError::Full(_)) =
                        listener.sender.try_send(message.clone())
                    {
                        warn!(listener_id = listener.id, "disconnecting slow notification listener");
                        dead.push(listener.id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            if let Some(list) = self.listeners.lock().unwrap_or_else(|e| e.into_inner()).get_mut(topic) {
                list.retain(|l| !dead.contains(&l.id));
            }
        }
    }

    /// Subscribes to every `notify:request:*` / `notify:user:*` channel and
    /// relays inbound messages to local listeners, skipping envelopes this
    /// same instance produced (already delivered by `publish` directly).
    /// Runs for the lifetime of the process; reconnects on stream failure.
    pub async fn run_redis_bridge(self: std::sync::Arc<Self>, redis: RedisClient) {
        loop {
            if let Err(e) = self.run_redis_bridge_once(&redis).await {
                error!(error = %e, "notification redis bridge disconnected, retrying");
            }
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }
    }

    async fn run_redis_bridge_once(&self, redis: &RedisClient) -> redis::RedisResult<()> {
        let mut pubsub = redis.client.get_async_pubsub().await?;
        pubsub.psubscribe("notify:request:*").await?;
        pubsub.psubscribe("notify:user:*").await?;
        debug!("notification redis bridge subscribed");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let Some(topic) = Topic::from_channel(&channel) else { continue };
            let Ok(payload) = msg.get_payload::<String>() else { continue };
            let Ok(envelope) = serde_json::from_str::<WireEnvelope>(&payload) else { continue };
            if envelope.origin == self.instance_id {
                continue;
            }
            self.deliver_local(&topic, &envelope.message);
        }
        Ok(())
    }

    pub fn publish_request(&self, request_id: &str, message: NotifyMessage) {
        self.publish(&Topic::Request(request_id.to_string()), message);
    }

    pub fn publish_user(&self, user_id: &str, message: NotifyMessage) {
        self.publish(&Topic::User(user_id.to_string()), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_listener_receives_publish() {
        let hub = NotificationHub::new();
        let mut handle = hub.register(Topic::Request("r1".into()));
        hub.publish_request(
            "r1",
            NotifyMessage::StatusUpdate {
                request_id: "r1".into(),
                state: "pending".into(),
            },
        );
        let msg = handle.receiver.recv().await.expect("message delivered");
        match msg {
            NotifyMessage::StatusUpdate { request_id, .. } => assert_eq!(request_id, "r1"),
            _ => panic!("wrong message variant"),
        }
    }

    #[tokio::test]
    async fn slow_listener_is_disconnected_not_blocking() {
        let hub = NotificationHub::new();
        let handle = hub.register(Topic::Request("r2".into()));
        for _ in 0..(LISTENER_BUFFER + 5) {
            hub.publish_request(
                "r2",
                NotifyMessage::StatusUpdate {
                    request_id: "r2".into(),
                    state: "processing".into(),
                },
            );
        }
        // The registry should have dropped the listener once its buffer
        // overflowed; further publishes must not panic or block.
        drop(handle);
        hub.publish_request(
            "r2",
            NotifyMessage::ReservationCancelled { request_id: "r2".into() },
        );
    }

    #[test]
    fn deregister_is_idempotent() {
        let hub = NotificationHub::new();
        let handle = hub.register(Topic::User("u1".into()));
        let topic = Topic::User("u1".into());
        hub.deregister(&topic, handle.id);
        hub.deregister(&topic, handle.id);
    }
}
