//! Proxy Orchestrator (§4.5): per-request control flow tying the Request
//! Translator, Streaming Translator, and Observation Store to the two
//! routing modes.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use uuid::Uuid;

use crate::codec::{self, ForeignFrame};
use crate::config::{Config, Mode};
use crate::error::ProxyError;
use crate::protocol::foreign::ChatCompletionResponse;
use crate::protocol::native::MessagesRequest;
use crate::proxy::direct_merge::DirectMergeAccumulator;
use crate::proxy::headers::forward_headers;
use crate::proxy::http_client::http_client;
use crate::store::record::ResponseSnapshot;
use crate::store::Store;
use crate::translate::nonstream;
use crate::translate::request::translate_request;
use crate::translate::stream::{FrameOutcome, StreamingTranslator};

pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
}

pub async fn proxy_messages(state: Arc<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match orchestrate(&state, headers, body).await {
        Ok(response) => response,
        Err(err) => {
            log::warn!("proxy request failed: {err}");
            err.into_response()
        }
    }
}

async fn orchestrate(state: &Arc<AppState>, headers: HeaderMap, body: Bytes) -> Result<Response, ProxyError> {
    let body_json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let is_streaming = body_json.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let record_id = state.store.start(
        "POST".to_string(),
        "/v1/messages".to_string(),
        headers_to_json(&headers),
        body_json.clone(),
    );

    let result = match state.config.mode {
        Mode::Direct => direct_mode(state, &record_id, headers, body, is_streaming).await,
        Mode::Translated => translated_mode(state, &record_id, body_json, is_streaming).await,
    };

    if let Err(err) = &result {
        state.store.set_error(&record_id, err.sanitized_message(), None);
    }
    result
}

fn headers_to_json(headers: &HeaderMap) -> serde_json::Map<String, Value> {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), Value::String(value.to_str().unwrap_or("").to_string())))
        .collect()
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as u64
}

// ---------------------------------------------------------------------
// Direct mode
// ---------------------------------------------------------------------

async fn direct_mode(
    state: &Arc<AppState>,
    record_id: &str,
    headers: HeaderMap,
    body: Bytes,
    is_streaming: bool,
) -> Result<Response, ProxyError> {
    let url = format!("{}/v1/messages", state.config.anthropic_base_url.trim_end_matches('/'));
    let timeout = Duration::from_secs(state.config.request_timeout_secs);

    let builder = forward_headers(http_client().post(&url), &headers);
    let upstream = builder
        .body(body)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ProxyError::UpstreamHttp { status: StatusCode::BAD_GATEWAY, message: e.to_string() })?;

    let status = upstream.status();

    if !is_streaming {
        let bytes = upstream
            .bytes()
            .await
            .map_err(|e| ProxyError::UpstreamStream(e.to_string()))?;
        let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        let tokens = extract_anthropic_usage(&value);
        state.store.end(
            record_id,
            ResponseSnapshot { status: status.as_u16(), headers: Default::default(), body: value },
            tokens.0,
            tokens.1,
        );
        return Ok((status, bytes).into_response());
    }

    let merge_tracked = MergeTrackingStream {
        inner: Box::pin(upstream.bytes_stream()),
        accumulator: Some(DirectMergeAccumulator::default()),
        store: state.store.clone(),
        record_id: record_id.to_string(),
        status: status.as_u16(),
    };

    let body = Body::from_stream(merge_tracked);
    Ok(Response::builder()
        .status(status)
        .header("content-type", "text/event-stream")
        .body(body)
        .expect("response with streamed body is well-formed"))
}

fn extract_anthropic_usage(value: &Value) -> (Option<u32>, Option<u32>) {
    let input = value.pointer("/usage/input_tokens").and_then(Value::as_u64).map(|v| v as u32);
    let output = value.pointer("/usage/output_tokens").and_then(Value::as_u64).map(|v| v as u32);
    (input, output)
}

/// Wraps the upstream byte stream so every chunk is both forwarded to the
/// client unchanged and fed to the Observation Store, with the merged
/// content finalized once the upstream stream ends.
struct MergeTrackingStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    accumulator: Option<DirectMergeAccumulator>,
    store: Arc<Store>,
    record_id: String,
    status: u16,
}

impl Stream for MergeTrackingStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.store.add_chunk(&self.record_id, String::from_utf8_lossy(&bytes).to_string());
                if let Some(acc) = self.accumulator.as_mut() {
                    acc.ingest(&bytes);
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(err))) => {
                self.store.set_error(&self.record_id, err.to_string(), None);
                Poll::Ready(Some(Err(std::io::Error::other(err))))
            }
            Poll::Ready(None) => {
                if let Some(acc) = self.accumulator.take() {
                    let tokens = acc.output_tokens();
                    let merged = acc.finish(now_ms());
                    self.store.set_merged(&self.record_id, merged);
                    self.store.end(
                        &self.record_id,
                        ResponseSnapshot { status: self.status, headers: Default::default(), body: Value::Null },
                        None,
                        tokens,
                    );
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MergeTrackingStream {
    /// If the body is dropped before `poll_next` ever reaches `Ready(None)`
    /// (client disconnected mid-stream), the record is still finalized
    /// rather than left `Pending` forever (§4.5 step 4).
    fn drop(&mut self) {
        if let Some(acc) = self.accumulator.take() {
            let merged = acc.finish(now_ms());
            self.store.set_merged(&self.record_id, merged);
            self.store.set_error(&self.record_id, ProxyError::ClientDisconnect.sanitized_message(), None);
        }
    }
}

// ---------------------------------------------------------------------
// Translated mode
// ---------------------------------------------------------------------

async fn translated_mode(
    state: &Arc<AppState>,
    record_id: &str,
    body_json: Value,
    is_streaming: bool,
) -> Result<Response, ProxyError> {
    let request: MessagesRequest = serde_json::from_value(body_json)
        .map_err(|e| ProxyError::Internal(format!("invalid request body: {e}")))?;
    let requested_model = request.model.clone();
    let requested_label = requested_model.clone().unwrap_or_else(|| state.config.default_model.clone());
    let foreign_request = translate_request(&request, &state.config);

    let api_key = SecretString::from(std::env::var("OPENROUTER_API_KEY").unwrap_or_default());
    let url = format!("{}/v1/chat/completions", state.config.openrouter_base_url.trim_end_matches('/'));
    let timeout = Duration::from_secs(state.config.request_timeout_secs);

    let upstream = http_client()
        .post(&url)
        .bearer_auth(api_key.expose_secret())
        .json(&foreign_request)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ProxyError::UpstreamHttp { status: StatusCode::BAD_GATEWAY, message: e.to_string() })?;

    let status = upstream.status();
    if !status.is_success() {
        let text = upstream.text().await.unwrap_or_default();
        state.store.end(
            record_id,
            ResponseSnapshot { status: status.as_u16(), headers: Default::default(), body: Value::String(text.clone()) },
            None,
            None,
        );
        return Err(ProxyError::UpstreamHttp { status, message: text });
    }

    if !is_streaming {
        let response: ChatCompletionResponse = upstream
            .json()
            .await
            .map_err(|e| ProxyError::UpstreamStream(format!("invalid upstream json: {e}")))?;
        let reply = nonstream::translate_response(&response, &requested_label);
        let reply_value = serde_json::to_value(&reply).expect("reply serializes");
        state.store.end(
            record_id,
            ResponseSnapshot { status: status.as_u16(), headers: Default::default(), body: reply_value.clone() },
            Some(reply.usage.input_tokens),
            Some(reply.usage.output_tokens),
        );
        return Ok((StatusCode::OK, axum::Json(reply_value)).into_response());
    }

    let message_id = format!("msg_{}", Uuid::new_v4().simple());
    let model = state.config.resolve_model(requested_model.as_deref());
    let frames = codec::decode_foreign_stream(upstream.bytes_stream());

    let event_stream = TranslatingStream {
        frames: Box::pin(frames),
        translator: Some(StreamingTranslator::new(message_id, model)),
        store: state.store.clone(),
        record_id: record_id.to_string(),
        status_code: status.as_u16(),
        pending: std::collections::VecDeque::new(),
    }
    .map(Ok::<SseEvent, Infallible>);

    Ok(Sse::new(event_stream).keep_alive(KeepAlive::default()).into_response())
}

/// Drives the foreign SSE stream through the Streaming Translator, emitting
/// native SSE events as they become available and finalizing the record
/// once on completion. If dropped before `ForeignFrame::Done` is reached
/// (client disconnected, or the upstream stream simply ended early), the
/// record is still finalized rather than left `Pending` forever (§4.5 step
/// 4).
struct TranslatingStream {
    frames: Pin<Box<dyn Stream<Item = ForeignFrame> + Send>>,
    translator: Option<StreamingTranslator>,
    store: Arc<Store>,
    record_id: String,
    status_code: u16,
    pending: std::collections::VecDeque<SseEvent>,
}

impl Stream for TranslatingStream {
    type Item = SseEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            let Some(mut translator) = self.translator.take() else {
                return Poll::Ready(None);
            };

            match self.frames.as_mut().poll_next(cx) {
                Poll::Pending => {
                    self.translator = Some(translator);
                    return Poll::Pending;
                }
                Poll::Ready(None) => {
                    // Upstream closed the connection without a `[DONE]`
                    // sentinel. Finalize here (not via `Drop`) since this is
                    // an upstream-side failure, not a client disconnect.
                    self.store.set_error(
                        &self.record_id,
                        ProxyError::UpstreamStream("connection closed before [DONE]".to_string()).sanitized_message(),
                        None,
                    );
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(ForeignFrame::Chunk(chunk))) => match translator.process_frame(chunk) {
                    FrameOutcome::Events(events) => {
                        self.pending.extend(emit_and_record(&self.store, &self.record_id, &events));
                        self.translator = Some(translator);
                    }
                    FrameOutcome::FatalBeforeStart(message) => {
                        self.store.set_error(&self.record_id, message.clone(), None);
                        let error_event = crate::protocol::native::StreamEvent::Error {
                            error: crate::protocol::native::StreamErrorPayload { kind: "api_error".to_string(), message },
                        };
                        self.pending
                            .extend(emit_and_record(&self.store, &self.record_id, std::slice::from_ref(&error_event)));
                    }
                },
                Poll::Ready(Some(ForeignFrame::Done)) => {
                    let (events, summary) = translator.finish();
                    self.pending.extend(emit_and_record(&self.store, &self.record_id, &events));
                    let merged = crate::store::record::MergedContent {
                        complete_text: summary.text.clone(),
                        total_characters: summary.text.chars().count(),
                        tool_calls: summary
                            .tool_calls
                            .iter()
                            .map(|c| serde_json::json!({"id": c.id, "name": c.name}))
                            .collect(),
                        message_complete: true,
                        timestamp_ms: now_ms(),
                    };
                    self.store.set_merged(&self.record_id, merged);
                    self.store.end(
                        &self.record_id,
                        ResponseSnapshot { status: self.status_code, headers: Default::default(), body: Value::Null },
                        Some(summary.usage.input_tokens),
                        Some(summary.usage.output_tokens),
                    );
                }
            }
        }
    }
}

impl Drop for TranslatingStream {
    fn drop(&mut self) {
        if self.translator.take().is_some() {
            self.store.set_error(&self.record_id, ProxyError::ClientDisconnect.sanitized_message(), None);
        }
    }
}

fn emit_and_record(
    store: &Arc<Store>,
    record_id: &str,
    events: &[crate::protocol::native::StreamEvent],
) -> Vec<SseEvent> {
    events
        .iter()
        .map(|event| {
            let frame = codec::encode_native_event(event);
            store.add_chunk(record_id, frame);
            SseEvent::default().event(event.event_name()).data(serde_json::to_string(event).expect("event serializes"))
        })
        .collect()
}
