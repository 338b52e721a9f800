//! axum `Router` binding the core components to the inbound HTTP table of
//! §6, plus graceful shutdown (§10.5).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive};
use axum::response::{IntoResponse, Json, Response, Sse};
use axum::routing::{get, post};
use axum::{Router, body::Bytes};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::proxy::headers::forward_headers;
use crate::proxy::http_client::http_client;
use crate::proxy::orchestrator::{self, AppState};
use crate::store::record::StoreEvent;
use crate::store::{QueryFilters, Store, TimeRange};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/health", get(handle_health))
        .route("/monitor", get(not_implemented))
        .route("/config", get(not_implemented))
        .route("/", get(not_implemented))
        .route("/api/monitor/requests", get(handle_query))
        .route("/api/monitor/requests/{id}", get(handle_get_record))
        .route("/api/monitor/stats", get(handle_stats))
        .route("/api/monitor/stream", get(handle_event_stream))
        .route("/api/monitor/clear", post(handle_clear))
        .route("/api/monitor/export", get(handle_export))
        .route("/api/monitor/analyze", get(not_implemented))
        .route("/api/config", get(not_implemented).post(not_implemented))
        .with_state(state)
}

async fn handle_messages(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    orchestrator::proxy_messages(state, headers, body).await
}

async fn handle_count_tokens(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let url = format!("{}/v1/messages/count_tokens", state.config.anthropic_base_url.trim_end_matches('/'));
    let builder = forward_headers(http_client().post(&url), &headers);
    match builder.body(body).timeout(Duration::from_secs(state.config.request_timeout_secs)).send().await {
        Ok(upstream) => {
            let status = upstream.status();
            match upstream.bytes().await {
                Ok(bytes) => (status, bytes).into_response(),
                Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
            }
        }
        Err(err) => (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

async fn not_implemented() -> impl IntoResponse {
    (StatusCode::NOT_IMPLEMENTED, "not implemented in this deployment")
}

#[derive(Debug, Deserialize)]
struct RequestsQuery {
    status: Option<String>,
    model: Option<String>,
    #[serde(rename = "timeRange")]
    time_range: Option<String>,
    page: Option<usize>,
    limit: Option<usize>,
}

fn parse_filters(query: RequestsQuery) -> QueryFilters {
    use crate::store::record::RequestStatus;

    let status = query.status.as_deref().and_then(|s| match s {
        "pending" => Some(RequestStatus::Pending),
        "success" => Some(RequestStatus::Success),
        "error" => Some(RequestStatus::Error),
        _ => None,
    });
    let time_range = match query.time_range.as_deref() {
        Some("1h") => TimeRange::OneHour,
        Some("24h") => TimeRange::OneDay,
        Some("7d") => TimeRange::SevenDays,
        _ => TimeRange::All,
    };

    QueryFilters {
        status,
        model: query.model,
        time_range,
        page: query.page.unwrap_or(1),
        limit: query.limit.unwrap_or(50),
    }
}

async fn handle_query(State(state): State<Arc<AppState>>, Query(query): Query<RequestsQuery>) -> impl IntoResponse {
    let filters = parse_filters(query);
    Json(state.store.query(filters))
}

async fn handle_get_record(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.get(&id) {
        Some(record) => Json(record).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn handle_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RequestsQuery>,
) -> impl IntoResponse {
    let filters = parse_filters(query);
    Json(state.store.get_stats(&filters))
}

async fn handle_clear(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.store.clear();
    StatusCode::NO_CONTENT
}

async fn handle_export(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.export())
}

async fn handle_event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let receiver = state.store.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(receiver).filter_map(|item| async move {
        match item {
            Ok(event) => Some(Ok(to_sse_event(&event))),
            Err(_lagged) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &StoreEvent) -> SseEvent {
    let name = match event {
        StoreEvent::RequestStart { .. } => "requestStart",
        StoreEvent::StreamChunk { .. } => "streamChunk",
        StoreEvent::RequestEnd { .. } => "requestEnd",
        StoreEvent::RequestError { .. } => "requestError",
        StoreEvent::Clear => "clear",
    };
    SseEvent::default().event(name).data(serde_json::to_string(event).expect("store event serializes"))
}

pub struct ServeConfig {
    pub bind_address: String,
    pub config: Config,
    pub store: Arc<Store>,
    pub shutdown: CancellationToken,
}

/// Binds the listener and serves, returning once `shutdown` is cancelled.
/// Mirrors the teacher's `serve()` shape, minus TLS/CORS/rate-limit layers
/// this proxy does not need.
pub async fn serve(serve_config: ServeConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = serve_config.bind_address.parse()?;
    let state = Arc::new(AppState { config: serve_config.config, store: serve_config.store });
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    log::info!("listening on {addr}");

    let shutdown = serve_config.shutdown;
    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result?;
        }
        _ = shutdown.cancelled() => {
            log::info!("received shutdown signal, shutting down gracefully");
        }
    }

    Ok(())
}
