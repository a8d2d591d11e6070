use std::sync::Arc;

use futures::StreamExt;
use regex::Regex;

use crate::stream::{StreamProcessor, TextStream};

/// Removes a leading `"<entity> <verb>:"` and surrounding quotes from a reply.
///
/// Matching is case-insensitive and tolerates extra whitespace around the
/// verb.
pub fn strip_entity_and_verb(entity: &str, verb: &str, text: &str) -> String {
    let pattern = format!(
        r"(?i)^\s*{}\s*{}:",
        regex::escape(entity),
        regex::escape(verb)
    );
    let stripped = match Regex::new(&pattern) {
        Ok(re) => re.replace(text, "").into_owned(),
        Err(e) => {
            tracing::debug!("cannot build speaker pattern: {e}");
            text.to_string()
        }
    };
    let stripped = stripped.trim();
    let stripped = stripped.strip_prefix(['"', '\'']).unwrap_or(stripped);
    let stripped = stripped.strip_suffix(['"', '\'']).unwrap_or(stripped);
    stripped.trim().to_string()
}

enum SpeakerMatch {
    /// Everything so far fits; more text is needed to decide.
    Partial,
    /// The preamble ends at this byte offset.
    Matched(usize),
    Mismatch,
}

/// Matches `pattern` at the start of `text` the way [`strip_entity_and_verb`]
/// does: case-insensitive, leading whitespace skipped, and a space in the
/// pattern standing for any run of whitespace, including none.
fn match_speaker(text: &str, pattern: &str) -> SpeakerMatch {
    let mut chars = text.char_indices().peekable();
    while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    for expected in pattern.chars() {
        if expected == ' ' {
            while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
            continue;
        }
        match chars.next() {
            None => return SpeakerMatch::Partial,
            Some((_, c)) if c.to_lowercase().eq(expected.to_lowercase()) => {}
            Some(_) => return SpeakerMatch::Mismatch,
        }
    }
    SpeakerMatch::Matched(chars.peek().map_or(text.len(), |(i, _)| *i))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prefix,
    OpenQuote,
    Body,
}

/// Streaming counterpart of [`strip_entity_and_verb`].
///
/// Text is held back only while it could still be the speaker preamble,
/// and a trailing quote is held until more text shows it was not the last.
pub fn strip_prefix_stream(entity: &str, verb: &str) -> StreamProcessor {
    let prefix = format!("{entity} {verb}:");
    Arc::new(move |input: TextStream| -> TextStream {
        let prefix = prefix.clone();
        let stripped = async_stream::stream! {
            let mut input = input;
            let mut phase = Phase::Prefix;
            let mut head = String::new();
            let mut held = String::new();

            while let Some(item) = input.next().await {
                let mut text = match item {
                    Ok(text) => text,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                if phase == Phase::Prefix {
                    head.push_str(&text);
                    text = match match_speaker(&head, &prefix) {
                        SpeakerMatch::Partial => continue,
                        SpeakerMatch::Matched(end) => head[end..].to_string(),
                        SpeakerMatch::Mismatch => head.trim_start().to_string(),
                    };
                    head.clear();
                    phase = Phase::OpenQuote;
                }

                if phase == Phase::OpenQuote {
                    let rest = text.trim_start();
                    if rest.is_empty() {
                        continue;
                    }
                    text = rest.strip_prefix('"').unwrap_or(rest).to_string();
                    phase = Phase::Body;
                }

                let mut out = std::mem::take(&mut held);
                out.push_str(&text);
                let kept = out.trim_end().len();
                if out[..kept].ends_with('"') {
                    held = out.split_off(kept - 1);
                }
                if !out.is_empty() {
                    yield Ok(out);
                }
            }

            // Stream ended while still looking like a preamble.
            if phase == Phase::Prefix {
                let rest = head.trim();
                if !rest.is_empty() {
                    yield Ok(rest.to_string());
                }
            }
        };
        stripped.boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::collect_text;
    use futures::stream;

    fn chunks(parts: &[&str]) -> TextStream {
        stream::iter(parts.iter().map(|p| Ok(p.to_string())).collect::<Vec<_>>()).boxed()
    }

    #[test]
    fn strips_speaker_and_quotes() {
        assert_eq!(
            strip_entity_and_verb("testy", "said", "testy said: \"Hello there!\""),
            "Hello there!"
        );
        assert_eq!(
            strip_entity_and_verb("Testy", "said", "  TESTY   said:  'hey' "),
            "hey"
        );
    }

    #[test]
    fn leaves_unprefixed_text() {
        assert_eq!(strip_entity_and_verb("testy", "said", "Just words."), "Just words.");
        assert_eq!(
            strip_entity_and_verb("testy", "said", "bob said: hi"),
            "bob said: hi"
        );
    }

    #[test]
    fn entity_is_escaped() {
        assert_eq!(strip_entity_and_verb("a.b", "said", "a.b said: ok"), "ok");
        assert_eq!(strip_entity_and_verb("a.b", "said", "axb said: ok"), "axb said: ok");
    }

    #[tokio::test]
    async fn stream_strips_prefix_split_across_chunks() {
        let strip = strip_prefix_stream("testy", "said");
        let input = chunks(&["tes", "ty sa", "id: \"", "Hello", " there!\""]);
        let out = collect_text(strip(input)).await;
        assert_eq!(out.unwrap(), "Hello there!");
    }

    #[tokio::test]
    async fn stream_tolerates_extra_whitespace_like_blocking_strip() {
        let reply = "  TESTY   said: \"wide\"";
        assert_eq!(strip_entity_and_verb("testy", "said", reply), "wide");

        let strip = strip_prefix_stream("testy", "said");
        let out = collect_text(strip(chunks(&["  TESTY ", "  said", ": \"wide\""]))).await;
        assert_eq!(out.unwrap(), "wide");

        let strip = strip_prefix_stream("testy", "said");
        let out = collect_text(strip(chunks(&["testysaid: ok"]))).await;
        assert_eq!(out.unwrap(), "ok");
    }

    #[tokio::test]
    async fn stream_keeps_inner_quotes() {
        let strip = strip_prefix_stream("testy", "said");
        let out = collect_text(strip(chunks(&["testy said: \"He said \"", "hi\" twice\""]))).await;
        assert_eq!(out.unwrap(), "He said \"hi\" twice");
    }

    #[tokio::test]
    async fn stream_passes_unprefixed_text() {
        let strip = strip_prefix_stream("testy", "said");
        let out = collect_text(strip(chunks(&["Hello", " world"]))).await;
        assert_eq!(out.unwrap(), "Hello world");
    }

    #[tokio::test]
    async fn stream_flushes_short_reply() {
        let strip = strip_prefix_stream("testy", "said");
        let out = collect_text(strip(chunks(&["te"]))).await;
        assert_eq!(out.unwrap(), "te");
    }

    #[tokio::test]
    async fn stream_forwards_errors() {
        let strip = strip_prefix_stream("testy", "said");
        let input = stream::iter(vec![
            Ok("testy said: hi".to_string()),
            Err(crate::error::SoulError::Transport("reset".into())),
        ])
        .boxed();
        let items: Vec<_> = strip(input).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }
}
