//! The long-running queue consumer. Joins the shared consumer group under
//! a stable name, drains the three priority streams for each currently-OnSale
//! event in priority-weighted bursts, and invokes the reservation engine for
//! every message whose status is still Pending.

use crate::engine::ReservationEngine;
use crate::error::EngineError;
use crate::models::{Priority, RequestState, SaleStatus};
use crate::notify::{NotificationHub, NotifyMessage, Topic};
use crate::queue::request_status::RequestStatusStore;
use crate::queue::{PriorityQueue, QueueMessage};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct QueueWorker {
    pub consumer_name: String,
    pool: PgPool,
    queue: PriorityQueue,
    status_store: RequestStatusStore,
    engine: ReservationEngine,
    notify: Arc<NotificationHub>,
}

impl QueueWorker {
    pub fn new(
        consumer_name: String,
        pool: PgPool,
        queue: PriorityQueue,
        status_store: RequestStatusStore,
        engine: ReservationEngine,
        notify: Arc<NotificationHub>,
    ) -> Self {
        Self {
            consumer_name,
            pool,
            queue,
            status_store,
            engine,
            notify,
        }
    }

    pub async fn run_forever(self) {
        loop {
            match self.run_round().await {
                Ok(processed) if processed > 0 => {}
                Ok(_) => tokio::time::sleep(Duration::from_millis(200)).await,
                Err(e) => {
                    error!(error = %e, "queue worker round failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    /// One draining round: for every OnSale event, read up to
    /// `Priority::read_count()` messages from each stream, high first.
    /// Returns how many messages were actually handled this round.
    async fn run_round(&self) -> Result<usize, sqlx::Error> {
        let event_ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM events WHERE status = $1")
                .bind(SaleStatus::OnSale)
                .fetch_all(&self.pool)
                .await?;

        let mut handled = 0;
        for event_id in event_ids {
            for priority in Priority::ALL {
                let messages = self
                    .queue
                    .read_batch(event_id, priority, &self.consumer_name, priority.read_count())
                    .await
                    .unwrap_or_default();
                for message in messages {
                    self.handle_message(message).await;
                    handled += 1;
                }
            }
        }
        Ok(handled)
    }

    async fn handle_message(&self, message: QueueMessage) {
        let status = match self.status_store.get(&message.request_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                warn!(request_id = %message.request_id, "status record missing, acking and dropping");
                let _ = self.queue.ack(message.event_id, message.priority, &message.stream_id).await;
                return;
            }
            Err(e) => {
                warn!(request_id = %message.request_id, error = %e, "failed to read status, leaving unacked");
                return;
            }
        };

        // A Processing record re-delivered through PEL reclaim means the
        // previous attempt crashed before it could ack -- handled below by
        // re-deriving the outcome rather than blindly retrying.
        if status.state.is_terminal() {
            let _ = self.queue.ack(message.event_id, message.priority, &message.stream_id).await;
            if status.state == RequestState::Cancelled {
                self.notify.publish_request(
                    &message.request_id,
                    NotifyMessage::ReservationCancelled {
                        request_id: message.request_id.clone(),
                    },
                );
            }
            return;
        }

        if self.status_store.mark_processing(&message.request_id).await.is_err() {
            return;
        }
        self.notify.publish_request(
            &message.request_id,
            NotifyMessage::StatusUpdate {
                request_id: message.request_id.clone(),
                state: "processing".to_string(),
            },
        );

        // Re-delivery through PEL reclaim after a crash that committed the
        // reservation but never got to write `Completed`: re-derive the
        // outcome instead of calling `reserve` again, which would otherwise
        // fail against the seats this same request already won.
        let already_held = self
            .engine
            .already_held(message.event_id, &message.payload.seat_ids, &message.payload.user_id)
            .await
            .ok()
            .flatten();

        let outcome = match already_held {
            Some(outcome) => Ok(outcome),
            None => {
                self.engine
                    .reserve(message.event_id, &message.payload.seat_ids, &message.payload.user_id)
                    .await
            }
        };

        match outcome {
            Ok(outcome) => {
                let _ = self
                    .status_store
                    .mark_completed(&message.request_id, outcome.clone())
                    .await;
                self.queue.record_completion(message.event_id);
                self.notify.publish_request(
                    &message.request_id,
                    NotifyMessage::ReservationComplete {
                        request_id: message.request_id.clone(),
                        reservation_ids: outcome.reservation_ids,
                        seat_ids: outcome.seat_ids,
                        expires_at: outcome.expires_at,
                    },
                );
                self.notify.publish_user(
                    &message.payload.user_id,
                    NotifyMessage::StatusUpdate {
                        request_id: message.request_id.clone(),
                        state: "completed".to_string(),
                    },
                );
                let _ = self.queue.ack(message.event_id, message.priority, &message.stream_id).await;
            }
            Err(err) if err.is_transient() => {
                // Leave unacked: PEL reclaim will re-deliver up to max_deliveries.
                warn!(request_id = %message.request_id, error = %err, "transient failure, leaving for PEL reclaim");
            }
            Err(err) => {
                let _ = self
                    .status_store
                    .mark_failed(&message.request_id, err.kind(), &err.to_string())
                    .await;
                self.notify.publish_request(
                    &message.request_id,
                    NotifyMessage::ReservationFailed {
                        request_id: message.request_id.clone(),
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    },
                );
                let _ = self.queue.ack(message.event_id, message.priority, &message.stream_id).await;
            }
        }
    }

    /// Periodic PEL reclaim sweep: claims stale deliveries for this worker
    /// and either re-surfaces them for `handle_message` next round or
    /// dead-letters them once they exceed `max_deliveries`.
    pub async fn reclaim_forever(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(2000));
        loop {
            ticker.tick().await;
            let event_ids: Result<Vec<i64>, sqlx::Error> =
                sqlx::query_scalar("SELECT id FROM events WHERE status = $1")
                    .bind(SaleStatus::OnSale)
                    .fetch_all(&self.pool)
                    .await;
            let Ok(event_ids) = event_ids else { continue };

            for event_id in event_ids {
                for priority in Priority::ALL {
                    let claimed = self
                        .queue
                        .reclaim_stale(event_id, priority, &self.consumer_name)
                        .await
                        .unwrap_or_default();
                    for message in claimed {
                        if message.delivery_count > self.queue.max_deliveries() {
                            if let Err(e) = self.queue.dead_letter(&message).await {
                                error!(request_id = %message.request_id, error = %e, "failed to dead-letter message");
                                continue;
                            }
                            let _ = self
                                .status_store
                                .mark_failed(&message.request_id, "ExceededRetries", "exceeded MAX_DELIVERIES")
                                .await;
                            self.notify.publish_request(
                                &message.request_id,
                                NotifyMessage::ReservationFailed {
                                    request_id: message.request_id.clone(),
                                    kind: "ExceededRetries".to_string(),
                                    message: "exceeded MAX_DELIVERIES".to_string(),
                                },
                            );
                        } else {
                            self.handle_message(message).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_domain_vs_transient_split() {
        assert!(EngineError::OptimisticConflict.is_transient());
        assert!(!EngineError::SeatUnavailable(1).is_transient());
    }
}
