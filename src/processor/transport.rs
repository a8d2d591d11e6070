//! Transport seam between processors and chat endpoints.
//!
//! Backends build a [`ChatRequest`]; a [`ChatTransport`] turns it into a
//! stream of server-sent-event payloads. [`HttpTransport`] is the reqwest
//! implementation; tests swap in scripted transports.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use lazy_static::lazy_static;
use reqwest::Client;
use serde_json::Value;

use crate::error::{SoulError, SoulResult};

/// Parsed `data:` payloads of an SSE response, in arrival order.
pub type EventStream = BoxStream<'static, SoulResult<Value>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// Backend label used in error messages
    pub processor: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, request: ChatRequest) -> SoulResult<EventStream>;
}

/// Streams SSE responses over HTTP with reqwest.
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

lazy_static! {
    static ref SHARED_HTTP: Arc<HttpTransport> = Arc::new(HttpTransport::new());
}

/// The process-wide HTTP transport used by the built-in processors.
///
/// One reqwest client means one root store load and one connection pool,
/// however many processors the registry builds.
pub fn shared_http_transport() -> Arc<dyn ChatTransport> {
    SHARED_HTTP.clone()
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, request: ChatRequest) -> SoulResult<EventStream> {
        let mut builder = self
            .client
            .post(&request.url)
            .header("content-type", "application/json")
            .json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(5000);
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&request.processor, status.as_u16(), retry_after_ms, &body));
        }

        Ok(sse_events(response.bytes_stream()))
    }
}

/// Decodes a raw SSE byte stream into its JSON `data:` payloads.
///
/// Bytes are buffered until a full line arrives, so a multibyte character
/// split across network chunks decodes intact.
pub(crate) fn sse_events<S, B, E>(source: S) -> EventStream
where
    S: futures::Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<SoulError> + Send + 'static,
{
    let stream = async_stream::try_stream! {
        let mut bytes = Box::pin(source);
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(Into::<SoulError>::into)?;
            buffer.extend_from_slice(chunk.as_ref());
            for data in drain_sse_data(&mut buffer) {
                match data {
                    SseData::Done => return,
                    SseData::Json(value) => yield value,
                }
            }
        }
        // Trailing event without a final newline
        buffer.push(b'\n');
        for data in drain_sse_data(&mut buffer) {
            if let SseData::Json(value) = data {
                yield value;
            }
        }
    };
    Box::pin(stream)
}

/// Maps a non-success HTTP status to the error taxonomy.
pub fn status_error(processor: &str, status: u16, retry_after_ms: u64, body: &str) -> SoulError {
    match status {
        429 => SoulError::RateLimited {
            processor: processor.to_string(),
            retry_after_ms,
        },
        401 | 403 => SoulError::Auth(format!("{processor} auth failed: {body}")),
        408 | 500..=599 => SoulError::Transport(format!("{processor} API error {status}: {body}")),
        _ => SoulError::Other(format!("{processor} API error {status}: {body}")),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SseData {
    Json(Value),
    Done,
}

/// Removes every complete line from `buffer`, returning the `data:` payloads.
///
/// Comment lines, `event:` lines and payloads that are not JSON are skipped.
pub(crate) fn drain_sse_data(buffer: &mut Vec<u8>) -> Vec<SseData> {
    let mut out = Vec::new();
    while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=newline).collect();
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(['\n', '\r']);
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            out.push(SseData::Done);
            continue;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(value) => out.push(SseData::Json(value)),
            Err(e) => tracing::debug!("skipping unparsable SSE payload: {e}"),
        }
    }
    out
}
