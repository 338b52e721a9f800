//! Observation Store (§4.4): a bounded, thread-safe repository of request
//! records with live event fan-out.

pub mod mask;
pub mod record;

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast;

use record::{
    MergedContent, Metrics, RecordError, RequestRecord, RequestSnapshot, RequestStatus,
    ResponseSnapshot, StoreEvent, StoreStats, StreamChunk,
};

const FAN_OUT_CAPACITY: usize = 256;

pub struct Store {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StoreEvent>,
    capacity: usize,
    sensitive_headers: HashSet<String>,
}

struct Inner {
    records: IndexMap<String, RequestRecord>,
    stats: StoreStats,
}

#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub status: Option<RequestStatus>,
    pub model: Option<String>,
    pub time_range: TimeRange,
    pub page: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeRange {
    OneHour,
    OneDay,
    SevenDays,
    #[default]
    All,
}

impl TimeRange {
    fn window_ms(self) -> Option<u64> {
        match self {
            TimeRange::OneHour => Some(60 * 60 * 1000),
            TimeRange::OneDay => Some(24 * 60 * 60 * 1000),
            TimeRange::SevenDays => Some(7 * 24 * 60 * 60 * 1000),
            TimeRange::All => None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueryResult {
    pub data: Vec<RecordSummary>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

/// A serializable view of a record (skips the non-`Serialize` `Instant`).
#[derive(Debug, Serialize)]
pub struct RecordSummary {
    pub id: String,
    pub timestamp_ms: u64,
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
    pub merged_content: Option<MergedContent>,
    pub metrics: Metrics,
    pub status: RequestStatus,
    pub error: Option<RecordError>,
}

impl From<&RequestRecord> for RecordSummary {
    fn from(r: &RequestRecord) -> Self {
        RecordSummary {
            id: r.id.clone(),
            timestamp_ms: r.timestamp_ms,
            request: r.request.clone(),
            response: r.response.clone(),
            merged_content: r.merged_content.clone(),
            metrics: r.metrics.clone(),
            status: r.status,
            error: r.error.clone(),
        }
    }
}

impl Store {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(FAN_OUT_CAPACITY);
        Store {
            inner: Mutex::new(Inner { records: IndexMap::new(), stats: StoreStats::default() }),
            events,
            capacity,
            sensitive_headers: mask::default_sensitive_headers(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StoreEvent) {
        // A broadcast channel with no live receivers returns Err; that is
        // the common case (no one watching `/api/monitor/stream`) and not
        // a failure of the store.
        let _ = self.events.send(event);
    }

    /// Begins tracking a new request, masking sensitive headers, evicting
    /// older records first if at capacity. Returns the new record's id.
    pub fn start(&self, method: String, url: String, headers: serde_json::Map<String, serde_json::Value>, body: serde_json::Value) -> String {
        let id = generate_id();
        let masked_headers = mask::mask_headers(&headers, &self.sensitive_headers);
        let request_size = body.to_string().len();

        let record = RequestRecord {
            id: id.clone(),
            timestamp_ms: now_ms(),
            start_instant: Instant::now(),
            request: RequestSnapshot { method, url, headers: masked_headers, body },
            response: None,
            stream_chunks: Vec::new(),
            merged_content: None,
            metrics: Metrics { request_size, ..Default::default() },
            status: RequestStatus::Pending,
            error: None,
        };

        {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            if inner.records.len() >= self.capacity {
                evict(&mut inner.records, self.capacity);
            }
            inner.records.insert(id.clone(), record);
        }

        self.publish(StoreEvent::RequestStart { id: id.clone() });
        id
    }

    pub fn add_chunk(&self, id: &str, raw_data: String) {
        {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            if let Some(record) = inner.records.get_mut(id) {
                let first = record.stream_chunks.is_empty();
                if first {
                    record.metrics.first_chunk_ms = Some(record.start_instant.elapsed().as_millis() as u64);
                }
                record.stream_chunks.push(StreamChunk { timestamp_ms: now_ms(), raw_data });
                record.metrics.chunks_count = record.stream_chunks.len();
            } else {
                log::debug!("{}", crate::error::StoreError::NotFound(id.to_string()));
            }
        }
        self.publish(StoreEvent::StreamChunk { id: id.to_string() });
    }

    pub fn set_merged(&self, id: &str, merged: MergedContent) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if let Some(record) = inner.records.get_mut(id) {
            let chunk_bytes: usize = record.stream_chunks.iter().map(|c| c.raw_data.len()).sum();
            record.metrics.response_size = merged.complete_text.len() + chunk_bytes;
            record.merged_content = Some(merged);
        } else {
            log::debug!("{}", crate::error::StoreError::NotFound(id.to_string()));
        }
    }

    pub fn end(&self, id: &str, response: ResponseSnapshot, input_tokens: Option<u32>, output_tokens: Option<u32>) {
        let status;
        {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            let Some(record) = inner.records.get_mut(id) else {
                log::debug!("{}", crate::error::StoreError::NotFound(id.to_string()));
                return;
            };
            let duration_ms = record.start_instant.elapsed().as_millis() as u64;
            status = if (200..300).contains(&response.status) { RequestStatus::Success } else { RequestStatus::Error };
            record.metrics.duration_ms = Some(duration_ms);
            record.metrics.input_tokens = input_tokens;
            record.metrics.output_tokens = output_tokens;
            record.metrics.response_size = response.body.to_string().len().max(record.metrics.response_size);
            record.response = Some(response);
            record.status = status;

            inner.stats.total_requests += 1;
            inner.stats.total_duration_ms += duration_ms;
            inner.stats.total_input_tokens += input_tokens.unwrap_or(0) as u64;
            inner.stats.total_output_tokens += output_tokens.unwrap_or(0) as u64;
            match status {
                RequestStatus::Success => inner.stats.success_count += 1,
                RequestStatus::Error => inner.stats.error_count += 1,
                RequestStatus::Pending => {}
            }
        }
        self.publish(StoreEvent::RequestEnd { id: id.to_string(), status });
    }

    pub fn set_error(&self, id: &str, message: String, stack: Option<String>) {
        {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            if let Some(record) = inner.records.get_mut(id) {
                record.status = RequestStatus::Error;
                record.error = Some(RecordError { message, stack });
                inner.stats.error_count += 1;
                inner.stats.total_requests += 1;
            } else {
                log::debug!("{}", crate::error::StoreError::NotFound(id.to_string()));
                return;
            }
        }
        self.publish(StoreEvent::RequestError { id: id.to_string() });
    }

    pub fn get(&self, id: &str) -> Option<RecordSummary> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner.records.get(id).map(RecordSummary::from)
    }

    /// Aggregate stats, honoring the same status/model/time_range filters
    /// `query` accepts (page/limit are meaningless here and ignored).
    pub fn get_stats(&self, filters: &QueryFilters) -> StoreStats {
        let inner = self.inner.lock().expect("store mutex poisoned");
        if filters.status.is_none() && filters.model.is_none() && filters.time_range == TimeRange::All {
            return inner.stats.clone();
        }

        let now = now_ms();
        let cutoff = filters.time_range.window_ms().map(|w| now.saturating_sub(w));
        let mut stats = StoreStats::default();
        for record in inner
            .records
            .values()
            .filter(|r| filters.status.is_none_or(|s| s == r.status))
            .filter(|r| filters.model.as_deref().is_none_or(|m| r.model() == Some(m)))
            .filter(|r| cutoff.is_none_or(|c| r.timestamp_ms >= c))
        {
            stats.total_requests += 1;
            stats.total_duration_ms += record.metrics.duration_ms.unwrap_or(0);
            stats.total_input_tokens += record.metrics.input_tokens.unwrap_or(0) as u64;
            stats.total_output_tokens += record.metrics.output_tokens.unwrap_or(0) as u64;
            match record.status {
                RequestStatus::Success => stats.success_count += 1,
                RequestStatus::Error => stats.error_count += 1,
                RequestStatus::Pending => {}
            }
        }
        stats
    }

    pub fn query(&self, mut filters: QueryFilters) -> QueryResult {
        if filters.page == 0 {
            filters.page = 1;
        }
        if filters.limit == 0 {
            filters.limit = 50;
        }

        let inner = self.inner.lock().expect("store mutex poisoned");
        let now = now_ms();
        let cutoff = filters.time_range.window_ms().map(|w| now.saturating_sub(w));

        let mut matching: Vec<&RequestRecord> = inner
            .records
            .values()
            .filter(|r| filters.status.is_none_or(|s| s == r.status))
            .filter(|r| filters.model.as_deref().is_none_or(|m| r.model() == Some(m)))
            .filter(|r| cutoff.is_none_or(|c| r.timestamp_ms >= c))
            .collect();

        matching.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));

        let total = matching.len();
        let start = (filters.page - 1) * filters.limit;
        let data = matching
            .into_iter()
            .skip(start)
            .take(filters.limit)
            .map(RecordSummary::from)
            .collect();

        QueryResult { data, total, page: filters.page, limit: filters.limit }
    }

    pub fn export(&self) -> Vec<RecordSummary> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        inner.records.values().map(RecordSummary::from).collect()
    }

    pub fn clear(&self) {
        {
            let mut inner = self.inner.lock().expect("store mutex poisoned");
            inner.records.clear();
            inner.stats = StoreStats::default();
        }
        self.publish(StoreEvent::Clear);
    }
}

/// Removes `max(1, floor(capacity * 0.1))` records, preferring pending
/// records last (completed-before-pending, oldest-first) so an in-flight
/// stream is never evicted out from under its subscriber unless nothing
/// else is available (§4.4).
fn evict(records: &mut IndexMap<String, RequestRecord>, capacity: usize) {
    let mut order: Vec<(String, bool, u64)> =
        records.iter().map(|(id, r)| (id.clone(), r.status == RequestStatus::Pending, r.timestamp_ms)).collect();
    order.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

    let to_remove = (capacity / 10).max(1);
    for (id, _, _) in order.into_iter().take(to_remove) {
        records.swap_remove(&id);
    }

    if records.len() >= capacity {
        if let Some((oldest_id, _)) = records
            .iter()
            .min_by_key(|(_, r)| r.timestamp_ms)
            .map(|(id, r)| (id.clone(), r.timestamp_ms))
        {
            records.swap_remove(&oldest_id);
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as u64
}

fn generate_id() -> String {
    let suffix: String = {
        let mut rng = rand::rng();
        (0..9).map(|_| std::char::from_digit(rng.random_range(0..16), 16).unwrap()).collect()
    };
    format!("req_{}_{suffix}", now_ms())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers() -> serde_json::Map<String, serde_json::Value> {
        let mut m = serde_json::Map::new();
        m.insert("content-type".to_string(), json!("application/json"));
        m
    }

    #[test]
    fn start_and_end_updates_stats() {
        let store = Store::new(10);
        let id = store.start("POST".to_string(), "/v1/messages".to_string(), headers(), json!({"model": "claude-3-5-sonnet"}));
        assert_eq!(store.get(&id).unwrap().status, RequestStatus::Pending);

        store.end(&id, ResponseSnapshot { status: 200, headers: serde_json::Map::new(), body: json!({}) }, Some(10), Some(20));
        let record = store.get(&id).unwrap();
        assert_eq!(record.status, RequestStatus::Success);
        assert_eq!(record.metrics.input_tokens, Some(10));

        let stats = store.get_stats(&QueryFilters::default());
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.success_count, 1);
    }

    #[test]
    fn get_stats_honors_model_filter() {
        let store = Store::new(10);
        let sonnet = store.start("POST".to_string(), "/v1/messages".to_string(), headers(), json!({"model": "sonnet"}));
        store.end(&sonnet, ResponseSnapshot { status: 200, headers: serde_json::Map::new(), body: json!({}) }, None, None);
        let haiku = store.start("POST".to_string(), "/v1/messages".to_string(), headers(), json!({"model": "haiku"}));
        store.end(&haiku, ResponseSnapshot { status: 200, headers: serde_json::Map::new(), body: json!({}) }, None, None);

        let all = store.get_stats(&QueryFilters::default());
        assert_eq!(all.total_requests, 2);

        let filtered = store.get_stats(&QueryFilters { model: Some("sonnet".to_string()), ..Default::default() });
        assert_eq!(filtered.total_requests, 1);
    }

    #[test]
    fn capacity_is_respected() {
        let store = Store::new(10);
        for i in 0..15 {
            let id = store.start("POST".to_string(), "/v1/messages".to_string(), headers(), json!({"model": "x"}));
            store.end(&id, ResponseSnapshot { status: 200, headers: serde_json::Map::new(), body: json!({}) }, None, None);
            let _ = i;
        }
        let inner = store.inner.lock().unwrap();
        assert!(inner.records.len() <= 10);
    }

    #[test]
    fn clear_resets_everything() {
        let store = Store::new(10);
        let id = store.start("POST".to_string(), "/v1/messages".to_string(), headers(), json!({}));
        store.end(&id, ResponseSnapshot { status: 200, headers: serde_json::Map::new(), body: json!({}) }, None, None);
        store.clear();
        assert_eq!(store.get_stats(&QueryFilters::default()).total_requests, 0);
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn query_orders_newest_first() {
        let store = Store::new(10);
        let id1 = store.start("POST".to_string(), "/v1/messages".to_string(), headers(), json!({}));
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = store.start("POST".to_string(), "/v1/messages".to_string(), headers(), json!({}));
        let result = store.query(QueryFilters::default());
        assert_eq!(result.data[0].id, id2);
        assert_eq!(result.data[1].id, id1);
    }
}
