use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed token charge for each non-text part (images) in outgoing content.
pub const IMAGE_TOKEN_SURCHARGE: usize = 85;

/// Rough token estimate for text: 4 chars ≈ 1 token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

// ─── Message Types ──────────────────────────────────────────────────────────

/// Role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed part of multi-part content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl ContentPart {
    pub fn text(s: impl Into<String>) -> Self {
        ContentPart::Text { text: s.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::Image {
            url: url.into(),
            detail: None,
        }
    }
}

/// Memory content: plain text or an ordered list of typed parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    /// Text parts concatenated, images skipped
    pub fn text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn image_count(&self) -> usize {
        match self {
            Content::Text(_) => 0,
            Content::Parts(parts) => parts
                .iter()
                .filter(|p| matches!(p, ContentPart::Image { .. }))
                .count(),
        }
    }

    /// Parts view; plain text becomes a single text part.
    pub fn into_parts(self) -> Vec<ContentPart> {
        match self {
            Content::Text(text) => vec![ContentPart::Text { text }],
            Content::Parts(parts) => parts,
        }
    }

    pub fn estimate_tokens(&self) -> usize {
        estimate_tokens(&self.text()) + self.image_count() * IMAGE_TOKEN_SURCHARGE
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<Vec<ContentPart>> for Content {
    fn from(parts: Vec<ContentPart>) -> Self {
        Content::Parts(parts)
    }
}

/// One immutable, timestamped record in a conversation transcript.
///
/// `id` and `timestamp` are assigned once by [`Memory::new`]; the builder
/// methods below only fill optional routing fields before the memory is
/// handed to a [`WorkingMemory`](crate::memory::WorkingMemory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    id: String,
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    timestamp: DateTime<Utc>,
}

impl Memory {
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            name: None,
            region: None,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn system(text: impl Into<Content>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<Content>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<Content>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Get text content concatenated
    pub fn text_content(&self) -> String {
        self.content.text()
    }

    /// Estimate total tokens for this memory
    pub fn estimate_tokens(&self) -> usize {
        self.content.estimate_tokens() + 4 // role + framing overhead
    }
}

// ─── Token Usage ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl Usage {
    pub fn new(model: impl Into<String>, input: usize, output: usize) -> Self {
        Self {
            model: model.into(),
            input_tokens: input,
            output_tokens: output,
        }
    }

    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }

    /// Running total; the model of the newer usage wins.
    pub fn accumulate(&self, other: &Usage) -> Usage {
        Usage {
            model: if other.model.is_empty() {
                self.model.clone()
            } else {
                other.model.clone()
            },
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_gets_id_and_timestamp() {
        let a = Memory::user("hi");
        let b = Memory::user("hi");
        assert_ne!(a.id(), b.id());
        assert!(a.timestamp() <= Utc::now());
    }

    #[test]
    fn builder_fills_optional_fields() {
        let m = Memory::assistant("ok")
            .with_name("testy")
            .with_region("summary")
            .with_metadata(json!({"k": 1}));
        assert_eq!(m.name.as_deref(), Some("testy"));
        assert_eq!(m.region.as_deref(), Some("summary"));
        assert_eq!(m.metadata, Some(json!({"k": 1})));
    }

    #[test]
    fn text_content_skips_images() {
        let m = Memory::user(vec![
            ContentPart::text("look at "),
            ContentPart::image("https://example.com/cat.png"),
            ContentPart::text("this"),
        ]);
        assert_eq!(m.text_content(), "look at this");
        assert_eq!(m.content.image_count(), 1);
    }

    #[test]
    fn image_parts_carry_surcharge() {
        let text_only = Content::from("abcd");
        let with_image = Content::Parts(vec![
            ContentPart::text("abcd"),
            ContentPart::image("https://example.com/a.png"),
        ]);
        assert_eq!(text_only.estimate_tokens(), 1);
        assert_eq!(with_image.estimate_tokens(), 1 + IMAGE_TOKEN_SURCHARGE);
    }

    #[test]
    fn content_serde_is_untagged() {
        let text: Content = serde_json::from_value(json!("hello")).unwrap();
        assert_eq!(text, Content::Text("hello".into()));

        let parts: Content =
            serde_json::from_value(json!([{"type": "image", "url": "u"}])).unwrap();
        assert_eq!(parts.image_count(), 1);
    }

    #[test]
    fn memory_roundtrips_id_through_serde() {
        let m = Memory::system("You model Testy").with_region("core");
        let value = serde_json::to_value(&m).unwrap();
        assert_eq!(value["role"], "system");
        let back: Memory = serde_json::from_value(value).unwrap();
        assert_eq!(back.id(), m.id());
        assert_eq!(back, m);
    }

    #[test]
    fn usage_accumulates() {
        let a = Usage::new("gpt-4o", 10, 5);
        let b = Usage::new("", 3, 2);
        let total = a.accumulate(&b);
        assert_eq!(total.model, "gpt-4o");
        assert_eq!(total.total(), 20);
    }
}
