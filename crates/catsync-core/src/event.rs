//! Inbound webhook events.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTimestamp {
    Arrived,
    AddedToQueue,
    StartedProcessing,
    FinishedProcessingSuccessfully,
    FinishedProcessingWithError,
}

/// Handle to the raw inbound request, kept so handlers can re-read the exact
/// bytes (signature checks need them, the parsed payload is not enough).
#[derive(Debug, Clone)]
pub struct OriginalRequest {
    method: String,
    uri: String,
    body: Arc<[u8]>,
}

impl OriginalRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        let body: Vec<u8> = body.into();
        Self {
            method: method.into(),
            uri: uri.into(),
            body: Arc::from(body),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Parses the body again. An empty body reads as an empty object.
    pub fn json(&self) -> Result<JsonValue, CoreError> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(JsonValue::Object(Default::default()));
        }
        serde_json::from_slice(&self.body).map_err(CoreError::InvalidPayload)
    }
}

#[derive(Debug, Clone)]
pub struct WebhookEvent {
    trace_id: String,
    headers: BTreeMap<String, String>,
    payload: JsonValue,
    original_request: Option<OriginalRequest>,
    timestamps: BTreeMap<EventTimestamp, DateTime<Utc>>,
}

impl WebhookEvent {
    pub fn new(payload: JsonValue, headers: BTreeMap<String, String>) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
            payload,
            original_request: None,
            timestamps: BTreeMap::new(),
        }
    }

    /// Parses an inbound request and stamps its arrival.
    pub fn from_request(
        request: OriginalRequest,
        headers: BTreeMap<String, String>,
    ) -> Result<Self, CoreError> {
        let payload = request.json()?;
        let mut event = Self::new(payload, headers);
        event.original_request = Some(request);
        event.stamp(EventTimestamp::Arrived);
        Ok(event)
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn original_request(&self) -> Option<&OriginalRequest> {
        self.original_request.as_ref()
    }

    /// Records the current time for `kind`. A timestamp, once set, is never overwritten.
    pub fn stamp(&mut self, kind: EventTimestamp) {
        self.timestamps.entry(kind).or_insert_with(Utc::now);
    }

    pub fn timestamp(&self, kind: EventTimestamp) -> Option<DateTime<Utc>> {
        self.timestamps.get(&kind).copied()
    }

    pub fn timestamps(&self) -> &BTreeMap<EventTimestamp, DateTime<Utc>> {
        &self.timestamps
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp(EventTimestamp::FinishedProcessingSuccessfully)
            .or_else(|| self.timestamp(EventTimestamp::FinishedProcessingWithError))
    }

    pub fn processing_millis(&self) -> Option<i64> {
        let started = self.timestamp(EventTimestamp::StartedProcessing)?;
        Some((self.finished_at()? - started).num_milliseconds())
    }
}
