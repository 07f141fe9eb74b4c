//! Session, request and response records plus adapter result shapes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::hash::{canonical_json_bytes, checksum, fingerprint};
use crate::policy::CacheMode;

/// Path recorded for responses that were never written to the payload store.
pub const EPHEMERAL_PATH: &str = "<ephemeral>";

/// Path recorded for responses served by a short-circuit cache store.
pub const CACHE_STORE_PATH: &str = "<cache>";

/// Render a timestamp the way it is stored in the database.
///
/// Fixed-width UTC with microseconds, so lexical order matches time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp back into UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(crate::Error::InvalidInput(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum! {
    /// Whether a session is driven synchronously or by a streaming consumer.
    #[derive(Default)]
    SessionMode { #[default] Sync => "sync", Async => "async" }
}

string_enum! {
    /// Request verb. Adapters decide what it means for their transport.
    #[derive(Default)]
    RequestMethod { #[default] Get => "GET", Post => "POST", Put => "PUT", Patch => "PATCH", Delete => "DELETE" }
}

string_enum! {
    /// Outcome class of a response.
    ResponseStatus { Ok => "ok", Ack => "ack", Error => "error" }
}

/// One logical unit of work against one adapter source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub source: String,
    pub mode: SessionMode,
    pub as_of: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(source: impl Into<String>, mode: SessionMode) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            mode,
            as_of: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn with_as_of(mut self, as_of: Option<DateTime<Utc>>) -> Self {
        self.as_of = as_of;
        self
    }

    /// Stamp `ended_at`, never earlier than `started_at`.
    pub fn end(&mut self) -> DateTime<Utc> {
        let ended = Utc::now().max(self.started_at);
        self.ended_at = Some(ended);
        ended
    }
}

/// Caller-facing description of a request before it is bound to a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestSpec {
    pub kind: String,
    pub method: RequestMethod,
    pub params: Map<String, Value>,
    pub body: Option<Value>,
}

impl RequestSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), ..Default::default() }
    }

    pub fn method(mut self, method: RequestMethod) -> Self {
        self.method = method;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn body(mut self, body: impl Into<Value>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A single logical ask made within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub session_id: String,
    pub kind: String,
    pub method: RequestMethod,
    pub params: Map<String, Value>,
    pub body: Option<Value>,
    pub as_of_bucket: Option<String>,
    pub cache_tag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub hash: String,
}

impl Request {
    /// Bind `spec` to a session and compute its fingerprint.
    pub fn new(
        session_id: impl Into<String>, spec: RequestSpec, as_of_bucket: Option<String>, cache_tag: Option<String>,
    ) -> Self {
        let hash = fingerprint(
            &spec.kind,
            spec.method.as_str(),
            &spec.params,
            spec.body.as_ref(),
            as_of_bucket.as_deref(),
            cache_tag.as_deref(),
        );
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            kind: spec.kind,
            method: spec.method,
            params: spec.params,
            body: spec.body,
            as_of_bucket,
            cache_tag,
            created_at: Utc::now(),
            hash,
        }
    }
}

/// Outcome of fetching or sending for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub request_id: String,
    pub status: ResponseStatus,
    pub checksum: Option<String>,
    pub path: String,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub transport_status: Option<u16>,
    pub url: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub headers: Option<BTreeMap<String, String>>,
    pub adapter_meta: Option<Map<String, Value>>,
    pub fetched_at: DateTime<Utc>,
    pub cache_mode: Option<CacheMode>,
    pub ttl_seconds: Option<f64>,
    pub as_of_bucket: Option<String>,
    pub cache_tag: Option<String>,
}

impl Response {
    /// Build a response for raw bytes stored (or to be stored) at `path`.
    pub fn from_bytes(request_id: impl Into<String>, status: ResponseStatus, data: &[u8], path: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            status,
            checksum: Some(checksum(data)),
            path: path.into(),
            size_bytes: data.len() as u64,
            content_type: None,
            transport_status: None,
            url: None,
            elapsed_ms: None,
            headers: None,
            adapter_meta: None,
            fetched_at: Utc::now(),
            cache_mode: None,
            ttl_seconds: None,
            as_of_bucket: None,
            cache_tag: None,
        }
    }

    /// Build a response carrying an adapter result's descriptive fields.
    pub fn from_adapter_result(
        request_id: impl Into<String>, status: ResponseStatus, result: &AdapterResult, path: impl Into<String>,
    ) -> Self {
        Self {
            content_type: result.content_type.clone(),
            transport_status: result.transport_status,
            url: result.url.clone(),
            elapsed_ms: result.elapsed_ms,
            headers: result.headers.clone(),
            adapter_meta: result.adapter_meta.clone(),
            ..Self::from_bytes(request_id, status, &result.data, path)
        }
    }

    /// Same as [`Response::from_adapter_result`] but with no stored payload.
    pub fn ephemeral(request_id: impl Into<String>, status: ResponseStatus, result: &AdapterResult) -> Self {
        Self { checksum: None, ..Self::from_adapter_result(request_id, status, result, EPHEMERAL_PATH) }
    }

    /// Record the cache policy and partition keys in effect.
    pub fn with_provenance(
        mut self, cache_mode: CacheMode, ttl_seconds: Option<f64>, as_of_bucket: Option<String>,
        cache_tag: Option<String>,
    ) -> Self {
        self.cache_mode = Some(cache_mode);
        self.ttl_seconds = ttl_seconds;
        self.as_of_bucket = as_of_bucket;
        self.cache_tag = cache_tag;
        self
    }

    /// True when the payload was never written to the payload store.
    pub fn is_ephemeral(&self) -> bool {
        self.checksum.is_none() || self.path == EPHEMERAL_PATH || self.path == CACHE_STORE_PATH
    }

    /// Check `data` against the recorded checksum.
    pub fn verify(&self, data: &[u8]) -> bool {
        self.checksum.as_deref() == Some(checksum(data).as_str())
    }
}

/// Rich return shape an adapter may produce instead of raw bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterResult {
    pub data: Bytes,
    pub transport_status: Option<u16>,
    pub content_type: Option<String>,
    pub url: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub headers: Option<BTreeMap<String, String>>,
    pub adapter_meta: Option<Map<String, Value>>,
}

impl AdapterResult {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), ..Default::default() }
    }

    /// Descriptive fields that are set, keyed by field name.
    ///
    /// An empty map means the result carries nothing worth a sidecar.
    pub fn meta(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        if let Some(ct) = &self.content_type {
            meta.insert("content_type".into(), Value::from(ct.as_str()));
        }
        if let Some(status) = self.transport_status {
            meta.insert("transport_status".into(), Value::from(status));
        }
        if let Some(url) = &self.url {
            meta.insert("url".into(), Value::from(url.as_str()));
        }
        if let Some(ms) = self.elapsed_ms {
            meta.insert("elapsed_ms".into(), Value::from(ms));
        }
        if let Some(headers) = &self.headers {
            let headers = headers.iter().map(|(k, v)| (k.clone(), Value::from(v.as_str()))).collect();
            meta.insert("headers".into(), Value::Object(headers));
        }
        if let Some(adapter_meta) = &self.adapter_meta {
            meta.insert("adapter_meta".into(), Value::Object(adapter_meta.clone()));
        }
        meta
    }
}

/// Any of the shapes an adapter's fetch or send may return.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterOutput {
    /// Raw payload bytes with no descriptive metadata.
    Bytes(Bytes),
    /// Payload plus transport details.
    Result(AdapterResult),
    /// A structured value, stored as canonical JSON.
    Json(Value),
}

/// An adapter output reduced to one shape ready for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedOutput {
    pub result: AdapterResult,
    pub sidecar: Option<Map<String, Value>>,
}

impl AdapterOutput {
    pub fn normalize(self) -> Result<NormalizedOutput, serde_json::Error> {
        match self {
            AdapterOutput::Bytes(data) => Ok(NormalizedOutput { result: AdapterResult::new(data), sidecar: None }),
            AdapterOutput::Result(result) => {
                let meta = result.meta();
                let sidecar = if meta.is_empty() { None } else { Some(meta) };
                Ok(NormalizedOutput { result, sidecar })
            }
            AdapterOutput::Json(value) => {
                let data = canonical_json_bytes(&value)?;
                let result = AdapterResult { content_type: Some("application/json".into()), ..AdapterResult::new(data) };
                Ok(NormalizedOutput { result, sidecar: None })
            }
        }
    }
}

impl From<Bytes> for AdapterOutput {
    fn from(data: Bytes) -> Self {
        AdapterOutput::Bytes(data)
    }
}

impl From<Vec<u8>> for AdapterOutput {
    fn from(data: Vec<u8>) -> Self {
        AdapterOutput::Bytes(data.into())
    }
}

impl From<AdapterResult> for AdapterOutput {
    fn from(result: AdapterResult) -> Self {
        AdapterOutput::Result(result)
    }
}

impl From<Value> for AdapterOutput {
    fn from(value: Value) -> Self {
        AdapterOutput::Json(value)
    }
}

/// Payload handed to a sender: raw bytes or a structured value.
#[derive(Debug, Clone, PartialEq)]
pub enum SendPayload {
    Bytes(Bytes),
    Json(Value),
}

impl SendPayload {
    /// Bytes as the sender sees them; JSON is canonically serialized.
    pub fn into_bytes(self) -> Result<Bytes, serde_json::Error> {
        match self {
            SendPayload::Bytes(data) => Ok(data),
            SendPayload::Json(value) => canonical_json_bytes(&value).map(Bytes::from),
        }
    }
}

impl From<Bytes> for SendPayload {
    fn from(data: Bytes) -> Self {
        SendPayload::Bytes(data)
    }
}

impl From<Vec<u8>> for SendPayload {
    fn from(data: Vec<u8>) -> Self {
        SendPayload::Bytes(data.into())
    }
}

impl From<&[u8]> for SendPayload {
    fn from(data: &[u8]) -> Self {
        SendPayload::Bytes(Bytes::copy_from_slice(data))
    }
}

impl From<Value> for SendPayload {
    fn from(value: Value) -> Self {
        SendPayload::Json(value)
    }
}
