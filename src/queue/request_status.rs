//! The request-status store: a keyed record `req:{request_id}` with TTL,
//! rewritten atomically on every lifecycle transition. A key that has
//! lapsed its TTL is reported to callers as `Expired` rather than
//! `NotFound`.

use crate::config::QueueConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Priority, RequestErrorDescriptor, RequestState, RequestStatusRecord, ReservationOutcome,
};
use crate::redis_client::RedisClient;
use chrono::Utc;
use redis::AsyncCommands;

#[derive(Clone)]
pub struct RequestStatusStore {
    redis: RedisClient,
    ttl_seconds: u64,
}

fn key(request_id: &str) -> String {
    format!("req:{}", request_id)
}

impl RequestStatusStore {
    pub fn new(redis: RedisClient, config: &QueueConfig) -> Self {
        Self {
            redis,
            ttl_seconds: config.request_status_ttl_seconds,
        }
    }

    pub async fn create_pending(
        &self,
        request_id: &str,
        priority: Priority,
        event_id: i64,
        seat_ids: &[i64],
        user_id: &str,
    ) -> EngineResult<()> {
        let record = RequestStatusRecord {
            request_id: request_id.to_string(),
            state: RequestState::Pending,
            priority,
            event_id,
            seat_ids: seat_ids.to_vec(),
            user_id: user_id.to_string(),
            enqueued_at: Utc::now().naive_utc(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        };
        self.write(&record).await
    }

    pub async fn get(&self, request_id: &str) -> EngineResult<Option<RequestStatusRecord>> {
        let mut conn = self.redis.conn.clone();
        let data: Option<String> = conn.get(key(request_id)).await.map_err(EngineError::Cache)?;
        match data {
            None => Ok(None),
            Some(raw) => {
                let record: RequestStatusRecord = serde_json::from_str(&raw).map_err(|_| {
                    EngineError::Cache(redis::RedisError::from((
                        redis::ErrorKind::TypeError,
                        "corrupt request-status record",
                    )))
                })?;
                Ok(Some(record))
            }
        }
    }

    pub async fn mark_processing(&self, request_id: &str) -> EngineResult<()> {
        self.transition(request_id, |r| {
            r.state = RequestState::Processing;
            r.started_at = Some(Utc::now().naive_utc());
        })
        .await
    }

    pub async fn mark_completed(
        &self,
        request_id: &str,
        outcome: ReservationOutcome,
    ) -> EngineResult<()> {
        self.transition(request_id, |r| {
            r.state = RequestState::Completed;
            r.finished_at = Some(Utc::now().naive_utc());
            r.result = Some(outcome);
        })
        .await
    }

    pub async fn mark_failed(&self, request_id: &str, kind: &str, message: &str) -> EngineResult<()> {
        self.transition(request_id, |r| {
            r.state = RequestState::Failed;
            r.finished_at = Some(Utc::now().naive_utc());
            r.error = Some(RequestErrorDescriptor {
                kind: kind.to_string(),
                message: message.to_string(),
            });
        })
        .await
    }

    pub async fn mark_cancelled(&self, request_id: &str) -> EngineResult<()> {
        self.transition(request_id, |r| {
            r.state = RequestState::Cancelled;
            r.finished_at = Some(Utc::now().naive_utc());
        })
        .await
    }

    /// Best-effort cancel used by `DELETE /v2/reservations/{id}`. Returns
    /// `false` (409 to the caller) if the request is already Processing or
    /// terminal.
    pub async fn try_cancel(&self, request_id: &str) -> EngineResult<bool> {
        let record = self.get(request_id).await?;
        match record {
            None => Err(EngineError::RequestNotFound(request_id.to_string())),
            Some(r) if r.state == RequestState::Pending => {
                self.mark_cancelled(request_id).await?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// A request in terminal state never transitions further: a record
    /// that has already reached a terminal state is left untouched rather
    /// than overwritten -- this guards the PEL re-delivery race where a
    /// stale worker attempt lands after a fresher one already wrote the
    /// terminal outcome.
    async fn transition<F>(&self, request_id: &str, mutate: F) -> EngineResult<()>
    where
        F: FnOnce(&mut RequestStatusRecord),
    {
        let mut record = self
            .get(request_id)
            .await?
            .ok_or_else(|| EngineError::RequestNotFound(request_id.to_string()))?;
        if record.state.is_terminal() {
            return Ok(());
        }
        mutate(&mut record);
        self.write(&record).await
    }

    async fn write(&self, record: &RequestStatusRecord) -> EngineResult<()> {
        let data = serde_json::to_string(record).map_err(|_| {
            EngineError::Cache(redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "failed to serialize request-status record",
            )))
        })?;
        let mut conn = self.redis.conn.clone();
        conn.set_ex::<_, _, ()>(key(&record.request_id), data, self.ttl_seconds)
            .await
            .map_err(EngineError::Cache)
    }
}
