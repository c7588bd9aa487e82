//! Reservation endpoints: the synchronous Path A handlers that call the
//! Reservation Engine directly, the asynchronous Path B handlers that hand
//! off to the Priority Queue, and the WebSocket upgrade points that ride
//! the Notification Hub.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::middleware::UserId;
use crate::models::{Priority, ReservationOutcome, ReservationRequestPayload, RequestStatusRecord};
use crate::notify::Topic;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/reservations", post(create_reservation).get(list_reservations))
        .route("/reservations/{id}", get(get_reservation).delete(cancel_reservation))
        .route("/reservations/{id}/extend", post(extend_reservation))
        .route("/v2/reservations", post(enqueue_reservation))
        .route(
            "/v2/reservations/{request_id}",
            get(get_queued_reservation).delete(cancel_queued_reservation),
        )
        .route("/v2/queue/stats/{event_id}", get(queue_stats))
        .route("/v2/queue/health", get(queue_health))
        .route("/v2/ws/reservation/{request_id}", get(ws_reservation))
        .route("/v2/ws/user/{user_id}", get(ws_user))
}

#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub event_id: i64,
    pub seat_ids: Vec<i64>,
}

async fn create_reservation(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Json(req): Json<ReserveRequest>,
) -> EngineResult<(StatusCode, Json<ReservationOutcome>)> {
    let outcome = state.engine.reserve(req.event_id, &req.seat_ids, &user.0).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Debug, sqlx::FromRow, Serialize)]
pub struct ReservationView {
    pub id: i64,
    pub event_id: i64,
    pub seat_id: i64,
    pub holder: String,
    pub expires_at: chrono::NaiveDateTime,
    pub status: crate::models::ReservationStatus,
    pub created_at: chrono::NaiveDateTime,
}

async fn list_reservations(
    State(state): State<Arc<AppState>>,
    user: UserId,
) -> EngineResult<Json<Vec<ReservationView>>> {
    let reservations: Vec<ReservationView> = sqlx::query_as(
        "SELECT id, event_id, seat_id, holder, expires_at, status, created_at
         FROM reservations WHERE holder = $1 AND status = 'ACTIVE' ORDER BY id",
    )
    .bind(&user.0)
    .fetch_all(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;

    Ok(Json(reservations))
}

async fn get_reservation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> EngineResult<Json<ReservationView>> {
    let reservation: Option<ReservationView> = sqlx::query_as(
        "SELECT id, event_id, seat_id, holder, expires_at, status, created_at
         FROM reservations WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&state.db.pool)
    .await
    .map_err(EngineError::Database)?;

    reservation.map(Json).ok_or(EngineError::ReservationNotFound(id))
}

async fn extend_reservation(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(id): Path<i64>,
) -> EngineResult<Json<serde_json::Value>> {
    let expires_at = state.engine.extend(id, &user.0).await?;
    Ok(Json(json!({ "reservation_id": id, "expires_at": expires_at })))
}

async fn cancel_reservation(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Path(id): Path<i64>,
) -> EngineResult<StatusCode> {
    state.engine.cancel(id, &user.0).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct EnqueueReservationRequest {
    pub event_id: i64,
    pub seat_ids: Vec<i64>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

async fn enqueue_reservation(
    State(state): State<Arc<AppState>>,
    user: UserId,
    Json(req): Json<EnqueueReservationRequest>,
) -> EngineResult<(StatusCode, Json<serde_json::Value>)> {
    let priority = req.priority.unwrap_or(Priority::Normal);
    let payload = ReservationRequestPayload {
        event_id: req.event_id,
        seat_ids: req.seat_ids,
        user_id: user.0,
    };
    let request_id = state.queue.enqueue(&state.status_store, priority, payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "request_id": request_id, "status": "pending" })),
    ))
}

async fn get_queued_reservation(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> EngineResult<Json<RequestStatusRecord>> {
    let record = state.status_store.get(&request_id).await?;
    record.map(Json).ok_or(EngineError::RequestNotFound(request_id))
}

async fn cancel_queued_reservation(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> EngineResult<StatusCode> {
    let cancelled = state.status_store.try_cancel(&request_id).await?;
    if cancelled {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(EngineError::RequestNotCancelable(request_id))
    }
}

async fn queue_stats(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<i64>,
) -> EngineResult<Json<crate::queue::QueueStats>> {
    let stats = state.queue.stats(event_id).await?;
    Ok(Json(stats))
}

async fn queue_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn ws_reservation(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let snapshot = state.status_store.get(&request_id).await.ok().flatten();
        run_notification_socket(
            socket,
            state.clone(),
            Topic::Request(request_id),
            snapshot.and_then(|s| serde_json::to_string(&s).ok()),
        )
        .await;
    })
}

async fn ws_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        run_notification_socket(socket, state.clone(), Topic::User(user_id), None).await;
    })
}

/// Shared WebSocket loop for both endpoints: send the snapshot if any,
/// then relay everything published on `topic` until the client goes idle
/// longer than CONNECTION_IDLE_TIMEOUT or disconnects.
async fn run_notification_socket(
    mut socket: WebSocket,
    state: Arc<AppState>,
    topic: Topic,
    snapshot: Option<String>,
) {
    if let Some(snapshot) = snapshot {
        if socket.send(Message::Text(snapshot.into())).await.is_err() {
            return;
        }
    }

    let mut handle = state.notify.register(topic.clone());
    let idle_timeout = Duration::from_secs(state.config.websocket.idle_timeout_seconds);

    loop {
        tokio::select! {
            message = handle.receiver.recv() => {
                let Some(message) = message else { break };
                let Ok(text) = serde_json::to_string(&message) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = tokio::time::timeout(idle_timeout, socket.recv()) => {
                match incoming {
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => continue,
                    Ok(Some(Err(_))) => break,
                    Err(_) => {
                        debug!("closing idle notification socket");
                        break;
                    }
                }
            }
        }
    }

    state.notify.deregister(&topic, handle.id);
}
