//! HTTP and SSE edge.
//!
//! A thin translation of the ingest, read, and live-stream contracts to
//! JSON over HTTP. Handlers validate parameters, call the core, and map
//! error kinds to status codes; no pipeline logic lives here.

use std::io::Read;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::debug;

use turnbus_core::error::{Classify, ErrorKind};
use turnbus_core::event::Event;
use turnbus_core::streamlog::StreamLog;

use crate::gateway::{AppendReceipt, IngestGateway};
use crate::livestream::{LiveFrame, LiveStreamConfig, LiveStreamReader};
use crate::objectstore::FsObjectStore;
use crate::store::{DurableStore, EventArchive, Thread};


/// Shared state behind every handler.
pub struct AppState {
    pub gateway: IngestGateway,
    pub log: Arc<StreamLog>,
    pub store: DurableStore,
    pub objects: FsObjectStore,
}

/// Builds the edge router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/events:append", post(append_event))
        .route("/threads/{thread_id}", get(get_thread))
        .route("/threads/{thread_id}/events", get(list_events))
        .route("/threads/{thread_id}/events/stream", get(stream_events))
        .route("/threads/{thread_id}/archives", get(list_archives))
        .route(
            "/threads/{thread_id}/archives/{archive_id}",
            get(get_archive_blob),
        )
        .with_state(state)
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Transient => StatusCode::BAD_GATEWAY,
        ErrorKind::Conflict | ErrorKind::Poison | ErrorKind::Fatal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_reply<E: Classify + std::fmt::Display>(err: &E) -> (StatusCode, String) {
    (status_for(err.kind()), err.to_string())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct AppendRequest {
    event: Event,
}

async fn append_event(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AppendRequest>,
) -> Result<Json<AppendReceipt>, (StatusCode, String)> {
    state
        .gateway
        .append(request.event)
        .await
        .map(Json)
        .map_err(|err| error_reply(&err))
}

async fn get_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<Json<Thread>, (StatusCode, String)> {
    match state.store.get_thread(&thread_id) {
        Ok(Some(thread)) => Ok(Json(thread)),
        Ok(None) => Err((StatusCode::NOT_FOUND, "not found".to_string())),
        Err(err) => Err(error_reply(&err)),
    }
}

#[derive(Debug, Deserialize)]
struct ListEventsParams {
    from_seq: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct EventsResponse {
    events: Vec<Event>,
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(params): Query<ListEventsParams>,
) -> Result<Json<EventsResponse>, (StatusCode, String)> {
    let from_seq = params.from_seq.unwrap_or(0);
    if from_seq < 0 {
        return Err((StatusCode::BAD_REQUEST, "invalid from_seq".to_string()));
    }
    let limit = params.limit.unwrap_or(500);
    if limit <= 0 || limit > 5000 {
        return Err((StatusCode::BAD_REQUEST, "invalid limit".to_string()));
    }
    state
        .store
        .list_events(&thread_id, from_seq, limit)
        .map(|events| Json(EventsResponse { events }))
        .map_err(|err| error_reply(&err))
}

#[derive(Debug, Deserialize)]
struct ListArchivesParams {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ArchivesResponse {
    archives: Vec<EventArchive>,
}

async fn list_archives(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(params): Query<ListArchivesParams>,
) -> Result<Json<ArchivesResponse>, (StatusCode, String)> {
    let limit = params.limit.unwrap_or(100);
    if limit <= 0 || limit > 1000 {
        return Err((StatusCode::BAD_REQUEST, "invalid limit".to_string()));
    }
    state
        .store
        .list_archives(&thread_id, limit)
        .map(|archives| Json(ArchivesResponse { archives }))
        .map_err(|err| error_reply(&err))
}

async fn get_archive_blob(
    State(state): State<Arc<AppState>>,
    Path((thread_id, archive_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let archive = match state.store.get_archive(&archive_id) {
        Ok(Some(archive)) if archive.thread_id == thread_id => archive,
        Ok(_) => return Err((StatusCode::NOT_FOUND, "not found".to_string())),
        Err(err) => return Err(error_reply(&err)),
    };

    let mut blob = state
        .objects
        .get_object(&archive.object_key)
        .map_err(|err| (StatusCode::BAD_GATEWAY, err.to_string()))?;
    let mut body = Vec::new();
    blob.body
        .read_to_end(&mut body)
        .map_err(|err| (StatusCode::BAD_GATEWAY, err.to_string()))?;

    // The catalog row wins over object metadata for content headers.
    let content_type = [archive.content_type, blob.content_type]
        .into_iter()
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let content_encoding = [archive.content_encoding, blob.content_encoding]
        .into_iter()
        .find(|v| !v.is_empty());

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        content_type
            .parse()
            .unwrap_or(header::HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(encoding) = content_encoding {
        if let Ok(value) = encoding.parse() {
            headers.insert(header::CONTENT_ENCODING, value);
        }
    }
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    Ok((headers, body))
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    after_seq: Option<i64>,
}

/// Resume point: the `after_seq` query wins, then the `Last-Event-ID`
/// header, then zero.
fn resume_after_seq(params: &StreamParams, headers: &HeaderMap) -> Result<i64, &'static str> {
    if let Some(after_seq) = params.after_seq {
        if after_seq < 0 {
            return Err("invalid after_seq");
        }
        return Ok(after_seq);
    }
    if let Some(value) = headers.get("last-event-id") {
        return value
            .to_str()
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v >= 0)
            .ok_or("invalid Last-Event-ID");
    }
    Ok(0)
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let after_seq = resume_after_seq(&params, &headers)
        .map_err(|msg| (StatusCode::BAD_REQUEST, msg.to_string()))?;
    debug!(thread_id = %thread_id, after_seq, "live stream subscriber connected");

    let mut reader = LiveStreamReader::new(
        Arc::clone(&state.log),
        &thread_id,
        LiveStreamConfig {
            after_seq,
            ..LiveStreamConfig::default()
        },
    );

    let stream = async_stream::stream! {
        yield Ok::<_, std::convert::Infallible>(
            SseEvent::default().retry(std::time::Duration::from_millis(2000)),
        );
        loop {
            match reader.next_frames().await {
                Ok(frames) => {
                    for frame in frames {
                        match frame {
                            LiveFrame::Event { seq, json } => {
                                yield Ok(SseEvent::default()
                                    .id(seq.to_string())
                                    .event("agent_event")
                                    .data(json));
                            }
                            LiveFrame::Keepalive => {
                                yield Ok(SseEvent::default().comment("keepalive"));
                            }
                        }
                    }
                }
                Err(_) => break,
            }
        }
    };
    Ok(Sse::new(stream))
}
