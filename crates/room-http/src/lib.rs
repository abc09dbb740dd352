//! HTTP endpoints of a room
//!
//! - `GET /alias/{token}`: who is behind an alias URL and how to reach them
//! - `POST /withssb/sessions`: open a web sign-in session
//! - `GET /withssb/events?sc=`: server-sent events for a sign-in session

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::stream::{self, Stream};
use room_control::{Room, SignInEvent};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Interval between keep-alive events on a sign-in stream
pub const PING_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Clone)]
struct AppState {
    room: Arc<Room>,
    session_ttl: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasResponse {
    pub status: String,
    pub room_id: String,
    pub user_id: String,
    pub alias: String,
    pub multiserver_address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub sc: String,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    sc: Option<String>,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            status: "error".to_string(),
            error: error.into(),
        }),
    )
        .into_response()
}

/// Router serving the room's HTTP endpoints
pub fn router(room: Arc<Room>) -> Router {
    router_with_ttl(room, room_control::bridge::SIGN_IN_TTL)
}

/// Router whose sign-in event streams give up after `session_ttl`
pub fn router_with_ttl(room: Arc<Room>, session_ttl: Duration) -> Router {
    Router::new()
        .route("/alias/{token}", get(handle_alias))
        .route("/withssb/sessions", post(handle_create_session))
        .route("/withssb/events", get(handle_events))
        .with_state(AppState { room, session_ttl })
}

/// Serve the HTTP endpoints on `addr` until `shutdown` fires
pub async fn serve(
    room: Arc<Room>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP endpoints listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(room))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn handle_alias(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match state.room.broker().resolve_alias_token(&token) {
        Ok((record, _conn)) => Json(AliasResponse {
            status: "successful".to_string(),
            room_id: state.room.id().to_string(),
            user_id: record.owner.to_string(),
            alias: record.name,
            multiserver_address: state.room.multiserver_address(),
        })
        .into_response(),
        Err(e) => {
            debug!(error = %e, "Alias lookup failed");
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
    }
}

async fn handle_create_session(State(state): State<AppState>) -> Json<SessionResponse> {
    let sc = state.room.bridge().register();
    Json(SessionResponse { sc })
}

async fn handle_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let Some(sc) = query.sc.filter(|sc| !sc.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing sc parameter");
    };
    let Some(outcome) = state.room.bridge().take_receiver(&sc) else {
        return error_response(StatusCode::BAD_REQUEST, "unknown or expired sign-in session");
    };

    Sse::new(sign_in_events(outcome, state.session_ttl)).into_response()
}

enum Phase {
    Waiting {
        outcome: oneshot::Receiver<SignInEvent>,
        ticker: Interval,
        deadline: Instant,
    },
    Done,
}

/// `ping` events until the session resolves, then one `success` or `failed`
fn sign_in_events(
    outcome: oneshot::Receiver<SignInEvent>,
    ttl: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let start = Instant::now();
    let initial = Phase::Waiting {
        outcome,
        ticker: tokio::time::interval_at(start + PING_INTERVAL, PING_INTERVAL),
        deadline: start + ttl,
    };

    stream::unfold(initial, |phase| async move {
        let Phase::Waiting {
            mut outcome,
            mut ticker,
            deadline,
        } = phase
        else {
            return None;
        };

        tokio::select! {
            result = &mut outcome => {
                let event = match result {
                    Ok(SignInEvent::Success { token }) => Event::default().event("success").data(token),
                    Ok(SignInEvent::Failed { reason }) => Event::default().event("failed").data(reason),
                    Err(_) => Event::default().event("failed").data("sign-in session closed"),
                };
                Some((Ok(event), Phase::Done))
            }
            _ = tokio::time::sleep_until(deadline) => {
                let event = Event::default().event("failed").data("sign-in session expired");
                Some((Ok(event), Phase::Done))
            }
            _ = ticker.tick() => {
                let now = Utc::now().timestamp_millis().to_string();
                let event = Event::default().event("ping").data(now);
                Some((Ok(event), Phase::Waiting { outcome, ticker, deadline }))
            }
        }
    })
}
