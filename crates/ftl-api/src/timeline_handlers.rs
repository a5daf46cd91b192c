//! Timeline handlers.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use ftl_core::config::parse_duration;
use ftl_timeline::{EventType, TimelineEvent, TimelineQuery};
use futures_util::{Stream, stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::error::{ApiError, ApiResult};
use crate::{ApiResponse, ApiState};

/// POST /api/v1/timeline/query
pub async fn get_timeline(
    State(state): State<ApiState>,
    Json(query): Json<TimelineQuery>,
) -> ApiResult<Response> {
    let events = state.timeline.get_timeline(&query)?;
    Ok(ApiResponse::ok(events).into_response())
}

#[derive(Debug, Serialize)]
pub struct Inserted {
    pub ids: Vec<u64>,
}

/// POST /api/v1/timeline/events
pub async fn create_events(
    State(state): State<ApiState>,
    Json(events): Json<Vec<TimelineEvent>>,
) -> ApiResult<Response> {
    let ids = state.timeline.insert(events)?;
    Ok(ApiResponse::ok(Inserted { ids }).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// e.g. `1h` or `30m`.
    pub age: String,
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    pub deleted: usize,
}

/// DELETE /api/v1/timeline/events?type=log&age=1h
pub async fn delete_old_events(
    State(state): State<ApiState>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<Response> {
    let age = parse_duration(&query.age)
        .ok_or_else(|| ApiError::invalid(format!("invalid age {:?}", query.age)))?;
    let deleted = state
        .timeline
        .delete_old_events(query.event_type, age, state.clock.now());
    Ok(ApiResponse::ok(Deleted { deleted }).into_response())
}

/// GET /api/v1/timeline/stream: events as they are inserted, as
/// server-sent events named after their type.
pub async fn stream_timeline(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let updates = state.timeline.stream();
    let events = stream::unfold(updates, |mut updates| async move {
        loop {
            match updates.recv().await {
                Ok(event) => {
                    let sse = match Event::default().event(event.event_type().as_str()).json_data(&event) {
                        Ok(sse) => sse,
                        Err(e) => {
                            warn!(error = %e, "failed to encode timeline event");
                            continue;
                        }
                    };
                    return Some((Ok(sse), updates));
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "timeline stream lagged"),
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
