use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::config::ProcessorOptions;
use crate::error::{SoulError, SoulResult};
use crate::roles::{RoleFixOptions, FILLER_USER_TEXT};
use crate::types::{Content, ContentPart, Memory, Role};

use super::driver::{ChatBackend, Delta, DeltaStream, RequestSettings, StreamingProcessor};
use super::transport::{shared_http_transport, ChatRequest, ChatTransport};

pub const ANTHROPIC_DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The Messages API requires `max_tokens`.
pub const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 1024;

/// Messages API backend.
///
/// System memories are hoisted into the top-level `system` field; the
/// remaining turns must alternate starting with the user, so strict role
/// fixing is on unless the processor options turn it off.
pub struct AnthropicBackend {
    transport: Arc<dyn ChatTransport>,
    base_url: String,
    api_key: String,
}

pub type AnthropicProcessor = StreamingProcessor<AnthropicBackend>;

impl AnthropicBackend {
    pub fn new(transport: Arc<dyn ChatTransport>, options: &ProcessorOptions) -> Self {
        Self {
            transport,
            base_url: options
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_DEFAULT_BASE_URL.into()),
            api_key: options
                .api_key
                .clone()
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
                .unwrap_or_default(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_messages_body(&self, memories: &[Memory], settings: &RequestSettings) -> Value {
        let system: Vec<String> = memories
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.text_content())
            .collect();

        let mut messages: Vec<Value> = Vec::new();
        for memory in memories.iter().filter(|m| m.role != Role::System) {
            let role = memory.role.as_str();
            let blocks = content_blocks(&memory.content);
            // Hoisting system turns can leave two same-role turns adjacent.
            match messages.last_mut() {
                Some(last) if last["role"] == role => {
                    if let Some(existing) = last["content"].as_array_mut() {
                        existing.extend(blocks);
                    }
                }
                _ => messages.push(json!({"role": role, "content": blocks})),
            }
        }
        if messages.first().map_or(true, |m| m["role"] != "user") {
            messages.insert(
                0,
                json!({"role": "user", "content": [{"type": "text", "text": FILLER_USER_TEXT}]}),
            );
        }

        let mut body = json!({
            "model": settings.model,
            "max_tokens": settings.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
            "messages": messages,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        if let Some(temperature) = settings.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

impl StreamingProcessor<AnthropicBackend> {
    /// Processor over HTTPS using `options` for endpoint, key and defaults.
    pub fn anthropic(options: ProcessorOptions) -> Self {
        Self::anthropic_with_transport(shared_http_transport(), options)
    }

    pub fn anthropic_with_transport(
        transport: Arc<dyn ChatTransport>,
        options: ProcessorOptions,
    ) -> Self {
        let backend = AnthropicBackend::new(transport, &options);
        StreamingProcessor::new(backend, options)
    }
}

#[async_trait]
impl ChatBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        ANTHROPIC_DEFAULT_MODEL
    }

    fn role_fix(&self) -> RoleFixOptions {
        RoleFixOptions::strict()
    }

    async fn open(
        &self,
        memories: &[Memory],
        settings: &RequestSettings,
    ) -> SoulResult<DeltaStream> {
        let request = ChatRequest {
            processor: self.name().to_string(),
            url: format!("{}/v1/messages", self.base_url.trim_end_matches('/')),
            headers: vec![
                ("x-api-key".into(), self.api_key.clone()),
                ("anthropic-version".into(), ANTHROPIC_VERSION.into()),
            ],
            body: self.build_messages_body(memories, settings),
        };

        let events = self.transport.open(request).await?;
        let deltas = events.filter_map(|event| async move {
            match event {
                Ok(data) => parse_sse_event(&data),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(deltas.boxed())
    }
}

fn content_blocks(content: &Content) -> Vec<Value> {
    match content {
        Content::Text(text) => vec![json!({"type": "text", "text": text})],
        Content::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"type": "text", "text": text}),
                ContentPart::Image { url, .. } => {
                    json!({"type": "image", "source": image_source(url)})
                }
            })
            .collect(),
    }
}

/// `data:` URLs are sent inline as base64; anything else by reference.
fn image_source(url: &str) -> Value {
    let inline = url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"));
    match inline {
        Some((media_type, data)) => json!({
            "type": "base64",
            "media_type": media_type,
            "data": data,
        }),
        None => json!({"type": "url", "url": url}),
    }
}

fn parse_sse_event(data: &Value) -> Option<SoulResult<Delta>> {
    let event_type = data.get("type")?.as_str()?;
    match event_type {
        "message_start" => {
            let usage = data.pointer("/message/usage")?;
            Some(Ok(Delta::Usage {
                input_tokens: usage
                    .get("input_tokens")
                    .and_then(|v| v.as_u64())
                    .map(|n| n as usize),
                output_tokens: None,
            }))
        }
        "content_block_delta" => {
            let delta = data.get("delta")?;
            if delta.get("type")?.as_str()? != "text_delta" {
                return None;
            }
            let text = delta.get("text")?.as_str()?;
            Some(Ok(Delta::Text(text.to_string())))
        }
        "message_delta" => {
            let output = data.pointer("/usage/output_tokens")?.as_u64()?;
            Some(Ok(Delta::Usage {
                input_tokens: None,
                output_tokens: Some(output as usize),
            }))
        }
        "error" => {
            let kind = data
                .pointer("/error/type")
                .and_then(|v| v.as_str())
                .unwrap_or("error");
            let message = data
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            Some(Err(match kind {
                "rate_limit_error" => SoulError::RateLimited {
                    processor: "anthropic".into(),
                    retry_after_ms: 5000,
                },
                "authentication_error" | "permission_error" => {
                    SoulError::Auth(format!("anthropic: {message}"))
                }
                "invalid_request_error" => SoulError::Other(format!("anthropic: {message}")),
                _ => SoulError::Transport(format!("anthropic stream {kind}: {message}")),
            }))
        }
        _ => None,
    }
}
