use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::config::ProcessorOptions;
use crate::error::{SoulError, SoulResult};
use crate::roles::RoleFixOptions;
use crate::types::{Content, ContentPart, Memory};

use super::driver::{ChatBackend, Delta, DeltaStream, RequestSettings, StreamingProcessor};
use super::transport::{shared_http_transport, ChatRequest, ChatTransport};

pub const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";

/// Chat Completions backend (also fits OpenAI-compatible servers).
pub struct OpenAiBackend {
    transport: Arc<dyn ChatTransport>,
    base_url: String,
    api_key: String,
}

pub type OpenAiProcessor = StreamingProcessor<OpenAiBackend>;

impl OpenAiBackend {
    pub fn new(transport: Arc<dyn ChatTransport>, options: &ProcessorOptions) -> Self {
        Self {
            transport,
            base_url: options
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_BASE_URL.into()),
            api_key: options
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .unwrap_or_default(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_body(&self, memories: &[Memory], settings: &RequestSettings) -> Value {
        let messages: Vec<Value> = memories.iter().map(memory_to_api).collect();

        let mut body = json!({
            "model": settings.model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(max_tokens) = settings.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = settings.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

impl StreamingProcessor<OpenAiBackend> {
    /// Processor over HTTPS using `options` for endpoint, key and defaults.
    pub fn openai(options: ProcessorOptions) -> Self {
        Self::openai_with_transport(shared_http_transport(), options)
    }

    pub fn openai_with_transport(
        transport: Arc<dyn ChatTransport>,
        options: ProcessorOptions,
    ) -> Self {
        let backend = OpenAiBackend::new(transport, &options);
        StreamingProcessor::new(backend, options)
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> &str {
        OPENAI_DEFAULT_MODEL
    }

    fn role_fix(&self) -> RoleFixOptions {
        RoleFixOptions::none()
    }

    async fn open(
        &self,
        memories: &[Memory],
        settings: &RequestSettings,
    ) -> SoulResult<DeltaStream> {
        let request = ChatRequest {
            processor: self.name().to_string(),
            url: format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/')),
            headers: vec![("Authorization".into(), format!("Bearer {}", self.api_key))],
            body: self.build_body(memories, settings),
        };

        let events = self.transport.open(request).await?;
        let deltas = events.flat_map(|event| {
            let decoded = match event {
                Ok(data) => decode_event(&data),
                Err(e) => vec![Err(e)],
            };
            futures::stream::iter(decoded)
        });
        Ok(deltas.boxed())
    }
}

fn memory_to_api(memory: &Memory) -> Value {
    let content = match &memory.content {
        Content::Text(text) => json!(text),
        Content::Parts(parts) => {
            let parts: Vec<Value> = parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::Image { url, detail } => {
                        let mut image = json!({"url": url});
                        if let Some(detail) = detail {
                            image["detail"] = json!(detail);
                        }
                        json!({"type": "image_url", "image_url": image})
                    }
                })
                .collect();
            json!(parts)
        }
    };

    let mut message = json!({"role": memory.role.as_str(), "content": content});
    if let Some(name) = memory.name.as_deref().map(sanitize_name) {
        if !name.is_empty() {
            message["name"] = json!(name);
        }
    }
    message
}

/// The API only accepts `[a-zA-Z0-9_-]` in participant names.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => Some(c),
            ' ' => Some('_'),
            _ => None,
        })
        .collect()
}

/// Decodes one streamed chunk. A chunk may carry text, usage, both or neither.
fn decode_event(data: &Value) -> Vec<SoulResult<Delta>> {
    if let Some(error) = data.get("error") {
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return vec![Err(SoulError::Transport(format!("openai stream error: {message}")))];
    }

    let mut out = Vec::new();
    if let Some(text) = data
        .pointer("/choices/0/delta/content")
        .and_then(|v| v.as_str())
    {
        if !text.is_empty() {
            out.push(Ok(Delta::Text(text.to_string())));
        }
    }
    if let Some(usage) = data.get("usage").filter(|u| !u.is_null()) {
        out.push(Ok(Delta::Usage {
            input_tokens: usage
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .map(|n| n as usize),
            output_tokens: usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .map(|n| n as usize),
        }));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::EventStream;
    use crate::types::Role;

    struct NoTransport;

    #[async_trait]
    impl ChatTransport for NoTransport {
        async fn open(&self, _request: ChatRequest) -> SoulResult<EventStream> {
            Err(SoulError::Transport("offline".into()))
        }
    }

    fn backend(options: ProcessorOptions) -> OpenAiBackend {
        OpenAiBackend::new(Arc::new(NoTransport), &options)
    }

    fn settings() -> RequestSettings {
        RequestSettings {
            model: "gpt-4o-mini".into(),
            max_tokens: None,
            temperature: None,
        }
    }

    #[test]
    fn built_in_processors_share_one_http_client() {
        let a = OpenAiProcessor::openai(ProcessorOptions::default());
        let b = OpenAiProcessor::openai(ProcessorOptions::default());
        assert!(Arc::ptr_eq(&a.backend().transport, &b.backend().transport));
        assert!(Arc::ptr_eq(&a.backend().transport, &shared_http_transport()));
    }

    #[test]
    fn custom_base_url() {
        let b = backend(ProcessorOptions::default().with_base_url("http://localhost:8081"));
        assert_eq!(b.base_url(), "http://localhost:8081");
    }

    #[test]
    fn body_requests_usage_in_stream() {
        let b = backend(ProcessorOptions::default().with_api_key("k"));
        let body = b.build_body(&[Memory::system("sys"), Memory::user("hi")], &settings());
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn body_carries_generation_settings() {
        let b = backend(ProcessorOptions::default());
        let mut s = settings();
        s.max_tokens = Some(256);
        s.temperature = Some(0.5);
        let body = b.build_body(&[Memory::user("hi")], &s);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["temperature"], 0.5);
    }

    #[test]
    fn image_parts_become_image_url() {
        let memory = Memory::new(
            Role::User,
            vec![
                ContentPart::text("what is this?"),
                ContentPart::Image {
                    url: "https://example.com/cat.png".into(),
                    detail: Some("low".into()),
                },
            ],
        );
        let api = memory_to_api(&memory);
        assert_eq!(api["content"][0]["type"], "text");
        assert_eq!(api["content"][1]["type"], "image_url");
        assert_eq!(api["content"][1]["image_url"]["url"], "https://example.com/cat.png");
        assert_eq!(api["content"][1]["image_url"]["detail"], "low");
    }

    #[test]
    fn names_are_sanitized() {
        let api = memory_to_api(&Memory::assistant("hey").with_name("Samantha Jones!"));
        assert_eq!(api["name"], "Samantha_Jones");
        let api = memory_to_api(&Memory::assistant("hey").with_name("???"));
        assert!(api.get("name").is_none());
    }

    #[test]
    fn decodes_text_and_usage_chunks() {
        let text = decode_event(&json!({"choices": [{"delta": {"content": "Hel"}}]}));
        assert_eq!(text, vec![Ok(Delta::Text("Hel".into()))]);

        let usage = decode_event(&json!({
            "choices": [],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }));
        assert_eq!(
            usage,
            vec![Ok(Delta::Usage {
                input_tokens: Some(12),
                output_tokens: Some(3)
            })]
        );

        let role_only =
            decode_event(&json!({"choices": [{"delta": {"role": "assistant"}}], "usage": null}));
        assert!(role_only.is_empty());
    }

    #[test]
    fn decodes_error_payload() {
        let out = decode_event(&json!({"error": {"message": "overloaded"}}));
        assert!(matches!(&out[0], Err(SoulError::Transport(m)) if m.contains("overloaded")));
    }
}
