//! [`Store`] over the etcd v3 JSON gateway (`POST /v3/...`).
//!
//! Keys and values travel base64-encoded and 64-bit integers arrive as JSON
//! strings. Watches are long-lived POSTs whose response body is a sequence of
//! newline-delimited JSON messages.

use super::{
    prefix_end, EventKind, KeepAliveAck, KeyValue, LeaseGrant, PutResponse, Snapshot, Store,
    TxnOutcome, WatchEvent, WatchStream,
};
use crate::{Error, LeaseId, Result, Revision};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:2379";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct GatewayStore {
    client: Client,
    endpoint: String,
    request_timeout: Duration,
}

impl GatewayStore {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Self::with_timeout(endpoint, DEFAULT_REQUEST_TIMEOUT)
    }

    /// `timeout` bounds unary calls only; watches stay open indefinitely.
    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(Error::InvalidConfig(format!(
                "endpoint {endpoint:?} must start with http:// or https://"
            )));
        }
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            request_timeout: timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(&self, path: &str, body: &Value, lease: Option<LeaseId>) -> Result<T> {
        let url = format!("{}{}", self.endpoint, path);
        trace!(%url, "gateway request");
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(Error::unavailable)?;
        let status = response.status();
        let body = response.bytes().await.map_err(Error::unavailable)?;
        if !status.is_success() {
            return Err(status_error(status, &body, lease));
        }
        decode(&body, lease)
    }
}

#[async_trait]
impl Store for GatewayStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseGrant> {
        let body = json!({ "TTL": ttl_seconds(ttl), "ID": 0 });
        let resp: GrantResponse = self.call("/v3/lease/grant", &body, None).await?;
        if let Some(error) = resp.error.filter(|e| !e.is_empty()) {
            return Err(Error::unavailable(error));
        }
        if resp.id == 0 || resp.ttl <= 0 {
            return Err(Error::Protocol("lease grant without id or ttl".into()));
        }
        debug!(lease = %LeaseId(resp.id), ttl = resp.ttl, "lease granted");
        Ok(LeaseGrant {
            id: LeaseId(resp.id),
            ttl: Duration::from_secs(resp.ttl as u64),
        })
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveAck> {
        let body = json!({ "ID": lease.0.to_string() });
        let resp: StreamResult<KeepAliveResponse> = self.call("/v3/lease/keepalive", &body, Some(lease)).await?;
        let resp = resp.result.ok_or(Error::LeaseNotFound(lease))?;
        // A lease the server no longer knows is acknowledged with TTL 0.
        if resp.ttl <= 0 {
            return Err(Error::LeaseNotFound(lease));
        }
        Ok(KeepAliveAck {
            ttl: Duration::from_secs(resp.ttl as u64),
        })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let body = json!({ "ID": lease.0.to_string() });
        match self.call::<Value>("/v3/lease/revoke", &body, Some(lease)).await {
            Ok(_) | Err(Error::LeaseNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, key: &str, value: Bytes, lease: Option<LeaseId>) -> Result<PutResponse> {
        let body = put_request(key, &value, lease);
        let resp: PutResult = self.call("/v3/kv/put", &body, lease).await?;
        Ok(resp.into_response())
    }

    async fn put_if_create_revision(
        &self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
        expected: Revision,
    ) -> Result<TxnOutcome> {
        let body = json!({
            "compare": [{
                "key": encode(key.as_bytes()),
                "target": "CREATE",
                "result": "EQUAL",
                "create_revision": expected.to_string(),
            }],
            "success": [{ "request_put": put_request(key, &value, lease) }],
            "failure": [{ "request_range": { "key": encode(key.as_bytes()) } }],
        });
        let resp: TxnResponse = self.call("/v3/kv/txn", &body, lease).await?;
        resp.into_outcome()
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let body = json!({ "key": encode(key.as_bytes()) });
        let resp: DeleteResponse = self.call("/v3/kv/deleterange", &body, None).await?;
        Ok(resp.deleted > 0)
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        let body = json!({
            "key": encode(prefix.as_bytes()),
            "range_end": encode(&prefix_end(prefix)),
            "sort_order": "ASCEND",
            "sort_target": "CREATE",
        });
        let resp: RangeResponse = self.call("/v3/kv/range", &body, None).await?;
        resp.into_snapshot()
    }

    async fn watch_prefix(&self, prefix: &str, from_revision: Revision) -> Result<WatchStream> {
        let body = json!({
            "create_request": {
                "key": encode(prefix.as_bytes()),
                "range_end": encode(&prefix_end(prefix)),
                "start_revision": from_revision.to_string(),
            }
        });
        let url = format!("{}/v3/watch", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(Error::unavailable)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(status_error(status, &body, None));
        }
        debug!(%prefix, from_revision, "gateway watch opened");

        let state = WatchState {
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(Error::unavailable))
                .boxed(),
            buf: Vec::new(),
            pending: VecDeque::new(),
            finished: false,
        };
        Ok(futures::stream::unfold(state, WatchState::next).boxed())
    }
}

struct WatchState {
    body: BoxStream<'static, Result<Bytes>>,
    buf: Vec<u8>,
    pending: VecDeque<Result<WatchEvent>>,
    finished: bool,
}

impl WatchState {
    async fn next(mut self) -> Option<(Result<WatchEvent>, Self)> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                if item.is_err() {
                    self.pending.clear();
                    self.finished = true;
                }
                return Some((item, self));
            }
            if self.finished {
                return None;
            }
            if let Some(line) = self.take_line() {
                self.push_message(&line);
                continue;
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => self.pending.push_back(Err(e)),
                None => {
                    let rest = std::mem::take(&mut self.buf);
                    if !rest.iter().all(u8::is_ascii_whitespace) {
                        self.push_message(&rest);
                    }
                    self.pending
                        .push_back(Err(Error::unavailable("watch stream closed by server")));
                }
            }
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let newline = self.buf.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=newline).collect();
        Some(line)
    }

    fn push_message(&mut self, line: &[u8]) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        match parse_watch_message(line) {
            Ok(events) => self.pending.extend(events.into_iter().map(Ok)),
            Err(e) => self.pending.push_back(Err(e)),
        }
    }
}

/// Decodes one watch message into the events it carries.
fn parse_watch_message(line: &[u8]) -> Result<Vec<WatchEvent>> {
    let message: StreamResult<WatchResponse> = decode(line, None)?;
    let Some(resp) = message.result else {
        return Ok(Vec::new());
    };
    if resp.compact_revision > 0 {
        return Err(Error::WatchCompacted {
            compact_revision: resp.compact_revision,
        });
    }
    if resp.canceled {
        return Err(Error::unavailable(format!(
            "watch cancelled: {}",
            resp.cancel_reason.unwrap_or_default()
        )));
    }
    let header_revision = resp.header.revision;
    resp.events
        .into_iter()
        .map(|event| {
            let kind = match event.kind.as_deref() {
                None | Some("PUT") => EventKind::Put,
                Some("DELETE") => EventKind::Delete,
                Some(other) => return Err(Error::Protocol(format!("unknown event type {other}"))),
            };
            let kv = event.kv.into_key_value()?;
            let revision = if kv.mod_revision > 0 { kv.mod_revision } else { header_revision };
            Ok(WatchEvent { kind, kv, revision })
        })
        .collect()
}

fn decode<T: DeserializeOwned>(body: &[u8], lease: Option<LeaseId>) -> Result<T> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Error::Protocol(format!("invalid json: {e}")))?;
    if let Some(message) = error_message(&value) {
        return Err(classify(&message, lease, None));
    }
    serde_json::from_value(value).map_err(|e| Error::Protocol(e.to_string()))
}

fn status_error(status: StatusCode, body: &[u8], lease: Option<LeaseId>) -> Error {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| error_message(&v))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    classify(&message, lease, Some(status))
}

/// The gateway reports errors either as `{"error": "...", "message": ...}`
/// or, inside streams, as `{"error": {"message": ...}}`.
fn error_message(value: &Value) -> Option<String> {
    match value.get("error") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(Value::Object(obj.clone()).to_string())),
        _ => None,
    }
}

fn classify(message: &str, lease: Option<LeaseId>, status: Option<StatusCode>) -> Error {
    if message.contains("lease not found") {
        return Error::LeaseNotFound(lease.unwrap_or(LeaseId(0)));
    }
    match status {
        Some(status) if status.is_client_error() => Error::Protocol(format!("{status}: {message}")),
        _ => Error::unavailable(message),
    }
}

fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

fn put_request(key: &str, value: &[u8], lease: Option<LeaseId>) -> Value {
    let mut body = json!({
        "key": encode(key.as_bytes()),
        "value": encode(value),
        "prev_kv": true,
    });
    if let Some(lease) = lease {
        body["lease"] = Value::String(lease.0.to_string());
    }
    body
}

/// Lease TTLs are whole seconds on the wire; round up, never to zero.
fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

fn int64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int {
        Num(i64),
        Str(String),
    }
    match Int::deserialize(deserializer)? {
        Int::Num(n) => Ok(n),
        Int::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Default, Deserialize)]
struct Header {
    #[serde(default, deserialize_with = "int64")]
    revision: i64,
}

#[derive(Debug, Default, Deserialize)]
struct RawKv {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "int64")]
    create_revision: i64,
    #[serde(default, deserialize_with = "int64")]
    mod_revision: i64,
    #[serde(default, deserialize_with = "int64")]
    lease: i64,
}

impl RawKv {
    fn into_key_value(self) -> Result<KeyValue> {
        let key = STANDARD
            .decode(&self.key)
            .map_err(|e| Error::Protocol(format!("key is not base64: {e}")))?;
        let key = String::from_utf8(key).map_err(|e| Error::Protocol(format!("key is not utf-8: {e}")))?;
        let value = STANDARD
            .decode(&self.value)
            .map_err(|e| Error::Protocol(format!("value is not base64: {e}")))?;
        Ok(KeyValue {
            key,
            value: Bytes::from(value),
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            lease: (self.lease != 0).then_some(LeaseId(self.lease)),
        })
    }
}

#[derive(Debug, Deserialize)]
struct GrantResponse {
    #[serde(rename = "ID", default, deserialize_with = "int64")]
    id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "int64")]
    ttl: i64,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamResult<T> {
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct KeepAliveResponse {
    #[serde(rename = "TTL", default, deserialize_with = "int64")]
    ttl: i64,
}

#[derive(Debug, Default, Deserialize)]
struct PutResult {
    #[serde(default)]
    header: Header,
    #[serde(default)]
    prev_kv: Option<RawKv>,
}

impl PutResult {
    fn into_response(self) -> PutResponse {
        let revision = self.header.revision;
        let create_revision = self
            .prev_kv
            .map(|kv| kv.create_revision)
            .filter(|rev| *rev > 0)
            .unwrap_or(revision);
        PutResponse {
            revision,
            create_revision,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    header: Header,
    #[serde(default)]
    kvs: Vec<RawKv>,
}

impl RangeResponse {
    fn into_snapshot(self) -> Result<Snapshot> {
        let mut kvs = self
            .kvs
            .into_iter()
            .map(RawKv::into_key_value)
            .collect::<Result<Vec<_>>>()?;
        kvs.sort_by_key(|kv| kv.create_revision);
        Ok(Snapshot {
            revision: self.header.revision,
            kvs,
        })
    }
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    #[serde(default, deserialize_with = "int64")]
    deleted: i64,
}

#[derive(Debug, Deserialize)]
struct TxnResponse {
    #[serde(default)]
    header: Header,
    #[serde(default)]
    succeeded: bool,
    #[serde(default)]
    responses: Vec<TxnOp>,
}

#[derive(Debug, Deserialize)]
struct TxnOp {
    #[serde(default)]
    response_put: Option<PutResult>,
    #[serde(default)]
    response_range: Option<RangeResponse>,
}

impl TxnResponse {
    fn into_outcome(self) -> Result<TxnOutcome> {
        let revision = self.header.revision;
        let mut responses = self.responses.into_iter();
        if self.succeeded {
            let mut put = responses
                .find_map(|op| op.response_put)
                .unwrap_or_default();
            if put.header.revision == 0 {
                put.header.revision = revision;
            }
            return Ok(TxnOutcome::Succeeded(put.into_response()));
        }
        let current = match responses.find_map(|op| op.response_range) {
            Some(range) => range.kvs.into_iter().next().map(RawKv::into_key_value).transpose()?,
            None => None,
        };
        Ok(TxnOutcome::Failed(current))
    }
}

#[derive(Debug, Deserialize)]
struct WatchResponse {
    #[serde(default)]
    header: Header,
    #[serde(default)]
    canceled: bool,
    #[serde(default, deserialize_with = "int64")]
    compact_revision: i64,
    #[serde(default)]
    cancel_reason: Option<String>,
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    kv: RawKv,
}
