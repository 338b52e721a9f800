//! Observation entities (§3.2): `RequestRecord`, `MergedContent`, and the
//! store-wide aggregate stats.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamChunk {
    pub timestamp_ms: u64,
    pub raw_data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub headers: serde_json::Map<String, Value>,
    pub body: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: serde_json::Map<String, Value>,
    pub body: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergedContent {
    pub complete_text: String,
    pub total_characters: usize,
    pub tool_calls: Vec<Value>,
    pub message_complete: bool,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
    pub duration_ms: Option<u64>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub first_chunk_ms: Option<u64>,
    pub chunks_count: usize,
    pub request_size: usize,
    pub response_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordError {
    pub message: String,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: String,
    pub timestamp_ms: u64,
    #[serde(skip)]
    pub start_instant: std::time::Instant,
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
    pub stream_chunks: Vec<StreamChunk>,
    pub merged_content: Option<MergedContent>,
    pub metrics: Metrics,
    pub status: RequestStatus,
    pub error: Option<RecordError>,
}

impl RequestRecord {
    pub fn model(&self) -> Option<&str> {
        self.request.body.get("model").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub total_duration_ms: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

/// Events published to live fan-out subscribers (§4.4).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    RequestStart { id: String },
    StreamChunk { id: String },
    RequestEnd { id: String, status: RequestStatus },
    RequestError { id: String },
    Clear,
}
