use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::outcome_label;
use crate::registry::{Registry, TransitionError};

/// Header carrying the caller's opaque holder identity.
pub const HOLDER_TOKEN_HEADER: &str = "x-holder-token";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/slots", get(list_slots))
        .route("/slots/reserve", post(reserve_slot))
        .route("/slots/release", post(release_slot))
        .route("/slots/confirm", post(confirm_slot))
        .route("/slots/occupy", post(occupy_slot))
        .route("/slots/stream", get(stream_slots))
        .route(
            "/schedule/{resource_id}",
            put(put_schedule).get(get_schedule),
        )
        .route("/healthz", get(healthz))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Error envelope ───────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorObject,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Transition(TransitionError),
    MissingToken,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Transition(e) => match e {
                TransitionError::AlreadyHeld
                | TransitionError::NotHolder
                | TransitionError::ExpiredHold => StatusCode::CONFLICT,
                TransitionError::OutsideCalendar
                | TransitionError::InvalidTemplate(_)
                | TransitionError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
                TransitionError::Wal(_) | TransitionError::Booking(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::MissingToken => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Transition(e) => outcome_label(e),
            ApiError::MissingToken => "missing_token",
        }
    }
}

impl From<TransitionError> for ApiError {
    fn from(e: TransitionError) -> Self {
        ApiError::Transition(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::Transition(e) => e.to_string(),
            ApiError::MissingToken => format!("missing {HOLDER_TOKEN_HEADER} header"),
        };
        let body = Json(ErrorResponse {
            error: ErrorObject {
                code: self.code().to_string(),
                message,
            },
        });
        (self.status(), body).into_response()
    }
}

// ── Holder extraction ────────────────────────────────────

/// Caller identity taken from the x-holder-token header.
#[derive(Debug, Clone)]
pub struct Holder(pub HolderToken);

impl<S> FromRequestParts<S> for Holder
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            let token = parts
                .headers
                .get(HOLDER_TOKEN_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or(ApiError::MissingToken)?;
            Ok(Holder(HolderToken::new(token)))
        }
    }
}

// ── Request and response bodies ──────────────────────────

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRef {
    pub resource_id: Ulid,
    pub datetime: Stamp,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub resource_id: Ulid,
    pub datetime: Stamp,
    #[serde(default)]
    pub booking_payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OccupyRequest {
    pub resource_id: Ulid,
    pub datetime: Stamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<Ulid>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingConfirmed {
    pub booking_id: Ulid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotsQuery {
    pub resource_id: Ulid,
    #[serde(default = "default_days")]
    pub days: u32,
}

fn default_days() -> u32 {
    7
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub resource_id: Ulid,
}

// ── Handlers ─────────────────────────────────────────────

async fn run_transition<T>(
    op: &'static str,
    fut: impl Future<Output = Result<T, TransitionError>>,
) -> Result<T, ApiError> {
    let started = Instant::now();
    let result = fut.await;
    metrics::histogram!(crate::observability::TRANSITION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => outcome_label(e),
    };
    metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "op" => op, "outcome" => outcome)
        .increment(1);
    result.map_err(ApiError::Transition)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_slots(
    State(state): State<AppState>,
    Query(q): Query<SlotsQuery>,
) -> Json<CalendarSnapshot> {
    Json(state.registry.list_slots(q.resource_id, q.days).await)
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(resource_id): Path<Ulid>,
) -> Json<WeekTemplate> {
    Json(state.registry.get_template(resource_id).await)
}

async fn put_schedule(
    State(state): State<AppState>,
    Path(resource_id): Path<Ulid>,
    Json(template): Json<WeekTemplate>,
) -> Result<Json<Ack>, ApiError> {
    run_transition(
        "define_schedule",
        state.registry.define_schedule(resource_id, template),
    )
    .await?;
    Ok(Json(Ack { ok: true }))
}

async fn reserve_slot(
    State(state): State<AppState>,
    holder: Holder,
    Json(req): Json<SlotRef>,
) -> Result<Json<Ack>, ApiError> {
    run_transition(
        "reserve",
        state.registry.reserve(req.resource_id, req.datetime, &holder.0),
    )
    .await?;
    Ok(Json(Ack { ok: true }))
}

async fn release_slot(
    State(state): State<AppState>,
    holder: Holder,
    Json(req): Json<SlotRef>,
) -> Result<Json<Ack>, ApiError> {
    run_transition(
        "release",
        state.registry.release(req.resource_id, req.datetime, &holder.0),
    )
    .await?;
    Ok(Json(Ack { ok: true }))
}

async fn confirm_slot(
    State(state): State<AppState>,
    holder: Holder,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<BookingConfirmed>, ApiError> {
    let booking_id = run_transition(
        "confirm",
        state
            .registry
            .confirm(req.resource_id, req.datetime, &holder.0, req.booking_payload),
    )
    .await?;
    Ok(Json(BookingConfirmed { booking_id }))
}

async fn occupy_slot(
    State(state): State<AppState>,
    Json(req): Json<OccupyRequest>,
) -> Result<Json<BookingConfirmed>, ApiError> {
    let booking_id = run_transition(
        "occupy",
        state
            .registry
            .occupy(req.resource_id, req.datetime, req.booking_id),
    )
    .await?;
    Ok(Json(BookingConfirmed { booking_id }))
}

// ── Event stream ─────────────────────────────────────────

struct StreamGuard {
    notify: Arc<NotifyHub>,
    resource_id: Ulid,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        metrics::gauge!(crate::observability::STREAMS_ACTIVE).decrement(1.0);
        self.notify.remove_if_idle(&self.resource_id);
    }
}

fn ndjson_line(event: &SlotEvent) -> Result<Bytes, serde_json::Error> {
    let mut buf = serde_json::to_vec(event)?;
    buf.push(b'\n');
    Ok(Bytes::from(buf))
}

/// One JSON object per line. Blank lines are keepalives and carry nothing.
async fn stream_slots(
    State(state): State<AppState>,
    Query(q): Query<StreamQuery>,
) -> Response {
    let resource_id = q.resource_id;
    let rx = state.registry.notify.subscribe(resource_id);
    metrics::gauge!(crate::observability::STREAMS_ACTIVE).increment(1.0);
    let guard = StreamGuard {
        notify: state.registry.notify.clone(),
        resource_id,
    };

    let events = BroadcastStream::new(rx).map(move |item| {
        let _live = &guard;
        let event = match item {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                metrics::counter!(crate::observability::STREAM_LAGGED_TOTAL).increment(1);
                tracing::debug!("subscriber on {resource_id} lagged by {skipped} events");
                // The subscriber lost events; hint it to refetch the calendar
                SlotEvent {
                    kind: SlotEventKind::CalendarUpdated,
                    resource_id,
                    datetime: None,
                    emitted_at: Utc::now(),
                }
            }
        };
        ndjson_line(&event)
    });

    let heartbeats = IntervalStream::new(tokio::time::interval(HEARTBEAT_INTERVAL))
        .map(|_| Ok::<_, serde_json::Error>(Bytes::from_static(b"\n")));

    let body = Body::from_stream(events.merge(heartbeats));
    ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
}
