use axum::{
    Json,
    extract::{RawQuery, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, error, warn};

use super::AppState;
use crate::thumbnails::{
    CancelOnDrop, ChannelMode, CollectingListener, Dispatch, StaticResponse,
};

const CACHE_CONTROL_SUCCESS: &str = "public, max-age=86400";
const CACHE_CONTROL_FAILURE: &str = "no-store";
const REQUEST_ID_HEADER: &str = "x-request-id";

pub async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "page-thumbs",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

/// `GET /thumbnail?url=..&width=..&height=..[&algorithm=..][&refresh=1]`
pub async fn thumbnail(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    serve_thumbnail(&state, query, ChannelMode::Generate).await
}

/// Same as [`thumbnail`] but never renders; misses answer 404
pub async fn cached_thumbnail(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Response {
    serve_thumbnail(&state, query, ChannelMode::CacheOnly).await
}

async fn serve_thumbnail(state: &AppState, query: Option<String>, mode: ChannelMode) -> Response {
    let protocol = &state.protocol;
    let uri = format!(
        "{}://thumbnail?{}",
        protocol.scheme(),
        query.unwrap_or_default()
    );

    let dispatched = match mode {
        ChannelMode::Generate => protocol.new_channel(&uri),
        ChannelMode::CacheOnly => protocol.new_cached_channel(&uri),
    };
    let channel = match dispatched {
        Ok(Dispatch::Channel(channel)) => channel,
        Ok(Dispatch::Immediate(response)) => return static_response(response),
        Err(e) => {
            debug!("Rejected thumbnail request {}: {}", uri, e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let request_id = channel.request_id().to_string();
    let (listener, receiver) = CollectingListener::new();
    if let Err(e) = channel.open(listener) {
        error!("[{}] Failed to open thumbnail channel: {}", request_id, e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    // Dropping this future (client went away) cancels the channel
    let guard = CancelOnDrop::new(channel);
    let collected = receiver.await;
    guard.disarm();

    match collected {
        Ok(collected) => thumbnail_response(
            collected.status.http_status(),
            collected.body,
            Some(&request_id),
        ),
        Err(_) => {
            warn!("[{}] Thumbnail channel ended without a response", request_id);
            thumbnail_response(
                StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                Vec::new(),
                Some(&request_id),
            )
        }
    }
}

fn static_response(response: StaticResponse) -> Response {
    thumbnail_response(response.status, response.body, None)
}

fn thumbnail_response(status: u16, body: Vec<u8>, request_id: Option<&str>) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let cache_control = if status.is_success() {
        CACHE_CONTROL_SUCCESS
    } else {
        CACHE_CONTROL_FAILURE
    };
    let has_body = !body.is_empty();

    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    if has_body {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(crate::thumbnails::CONTENT_TYPE),
        );
    } else {
        headers.remove(header::CONTENT_TYPE);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(cache_control),
    );
    if let Some(request_id) = request_id
        && let Ok(value) = HeaderValue::from_str(request_id)
    {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    response
}
