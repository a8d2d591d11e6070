//! Built-in cognitive steps.
//!
//! Dialog-style steps ask for `<entity> <verb>: "..."` replies, store them
//! in that form and hand back the bare utterance. The structured steps
//! request JSON and store a one-line summary of the answer.

use serde_json::{json, Value};

use crate::error::{SoulError, SoulResult};
use crate::memory::{value_text, Command, TransformationSpec, WorkingMemory};
use crate::stream::TextStream;
use crate::types::Memory;

use super::strip::{strip_entity_and_verb, strip_prefix_stream};
use super::{create_cognitive_step, CognitiveStep};

fn spoken_step(
    verb: &'static str,
    instructions: String,
    guidance: &'static str,
) -> TransformationSpec<String> {
    let command = Command::from_fn(move |memory: &WorkingMemory| {
        let name = memory.entity_name();
        Memory::system(format!(
            "Model the mind of {name}.\n\n## Instructions\n{guidance}\n\n{instructions}\n\nPlease reply with the next {verb} line from {name}. Use the format: {name} {verb}: \"...\""
        ))
        .with_name(name)
    });

    TransformationSpec::new(command, move |memory: &WorkingMemory, value: Value| {
        let name = memory.entity_name();
        let stripped = strip_entity_and_verb(name, verb, &value_text(value));
        let record = Memory::assistant(format!("{name} {verb}: \"{stripped}\""));
        Ok((record, stripped))
    })
}

/// Something the entity says out loud.
pub fn external_dialog() -> CognitiveStep<String, String> {
    create_cognitive_step(|instructions: String| {
        spoken_step(
            "said",
            instructions,
            "* DO NOT include actions (for example, do NOT add non-verbal items like *smiles* or *nods*).\n* DO NOT include internal thoughts.\n* If necessary, use all CAPS to emphasize certain words.",
        )
        .with_stream_processor(|memory, input| strip_speaker(memory, input, "said"))
    })
}

/// Something the entity thinks to itself.
pub fn internal_monologue() -> CognitiveStep<String, String> {
    create_cognitive_step(|instructions: String| {
        spoken_step(
            "thought",
            instructions,
            "* Reply with a short, private thought.\n* DO NOT speak to anyone else.",
        )
        .with_stream_processor(|memory, input| strip_speaker(memory, input, "thought"))
    })
}

fn strip_speaker(memory: &WorkingMemory, input: TextStream, verb: &str) -> TextStream {
    strip_prefix_stream(memory.entity_name(), verb)(input)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionArgs {
    pub description: String,
    pub choices: Vec<String>,
}

impl<S: Into<String>> From<(S, Vec<String>)> for DecisionArgs {
    fn from((description, choices): (S, Vec<String>)) -> Self {
        Self {
            description: description.into(),
            choices,
        }
    }
}

/// Picks exactly one of the given choices.
pub fn decision() -> CognitiveStep<DecisionArgs, String> {
    create_cognitive_step(|args: DecisionArgs| {
        let DecisionArgs { description, choices } = args;
        let listed = choices.join(", ");
        let schema = json!({
            "type": "object",
            "properties": {
                "decision": {
                    "type": "string",
                    "enum": choices,
                    "description": description,
                }
            },
            "required": ["decision"],
        });
        let command = Command::from_fn(move |memory: &WorkingMemory| {
            let name = memory.entity_name();
            Memory::system(format!(
                "{name} is deciding: {description}\n\nChoices: {listed}\n\nReply with the choice {name} makes."
            ))
        });
        TransformationSpec::new(command, |memory: &WorkingMemory, value: Value| {
            let choice = field_str(&value, "decision")?;
            let record = Memory::assistant(format!("{} decided: {choice}", memory.entity_name()));
            Ok((record, choice))
        })
        .with_schema(schema)
    })
}

/// Comes up with new ideas about a topic.
pub fn brainstorm() -> CognitiveStep<String, Vec<String>> {
    create_cognitive_step(|topic: String| {
        let schema = json!({
            "type": "object",
            "properties": {
                "new_ideas": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "short descriptions of the new ideas",
                }
            },
            "required": ["new_ideas"],
        });
        let command = Command::from_fn(move |memory: &WorkingMemory| {
            Memory::system(format!(
                "{} is brainstorming new ideas about: {topic}",
                memory.entity_name()
            ))
        });
        TransformationSpec::new(command, |memory: &WorkingMemory, value: Value| {
            let ideas: Vec<String> = value
                .get("new_ideas")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let record = Memory::assistant(format!(
                "{} brainstormed: {}",
                memory.entity_name(),
                ideas.join("; ")
            ));
            Ok((record, ideas))
        })
        .with_schema(schema)
    })
}

/// Judges whether a statement is true in the current context.
pub fn mental_query() -> CognitiveStep<String, bool> {
    create_cognitive_step(|statement: String| {
        let schema = json!({
            "type": "object",
            "properties": {
                "isStatementTrue": {
                    "type": "boolean",
                    "description": "whether the statement is true in the context of this conversation",
                }
            },
            "required": ["isStatementTrue"],
        });
        let asked = statement.clone();
        let command = Command::from_fn(move |memory: &WorkingMemory| {
            Memory::system(format!(
                "{} evaluates the following statement against the conversation so far: \"{asked}\"",
                memory.entity_name()
            ))
        });
        TransformationSpec::new(command, move |memory: &WorkingMemory, value: Value| {
            let truth = value
                .get("isStatementTrue")
                .and_then(Value::as_bool)
                .ok_or_else(|| SoulError::MalformedOutput("missing isStatementTrue".into()))?;
            let record = Memory::assistant(format!(
                "{} evaluated: \"{statement}\" and concluded it was {truth}",
                memory.entity_name()
            ));
            Ok((record, truth))
        })
        .with_schema(schema)
    })
}

fn field_str(value: &Value, field: &str) -> SoulResult<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SoulError::MalformedOutput(format!("missing {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use futures::StreamExt;

    use crate::config::ProcessorOptions;
    use crate::memory::{ProcessorSpec, StreamingTransform, TransformOptions};
    use crate::processor::{register_processor, settled, ProcessRequest, ProcessResponse, Processor};
    use crate::stream::collect_text;
    use crate::types::{Role, Usage};

    /// Answers every request with the same reply, streamed in small chunks.
    struct Fixed {
        reply: &'static str,
        seen: Arc<Mutex<Vec<ProcessRequest>>>,
    }

    impl Processor for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn process(&self, request: ProcessRequest) -> ProcessResponse {
            let parsed = match &request.schema {
                Some(schema) => crate::json::parse_structured(self.reply, schema),
                None => Ok(Value::String(self.reply.to_string())),
            };
            self.seen.lock().unwrap().push(request);
            let chunks: Vec<_> = self
                .reply
                .as_bytes()
                .chunks(4)
                .map(|c| Ok(String::from_utf8_lossy(c).into_owned()))
                .collect();
            ProcessResponse {
                raw_completion: settled(Ok(self.reply.to_string())),
                parsed: settled(parsed),
                stream: futures::stream::iter(chunks).boxed(),
                usage: settled(Ok(Usage::new("fixed", 1, 1))),
            }
        }
    }

    fn fixed(label: &str, reply: &'static str) -> (WorkingMemory, Arc<Mutex<Vec<ProcessRequest>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let shared = seen.clone();
        register_processor(
            label.to_string(),
            Arc::new(move |_: &ProcessorOptions| -> SoulResult<Arc<dyn Processor>> {
                Ok(Arc::new(Fixed {
                    reply,
                    seen: shared.clone(),
                }) as Arc<dyn Processor>)
            }),
        );
        let memory = WorkingMemory::new(
            "testy",
            vec![Memory::system("You model Testy, a QA robot"), Memory::user("hi!")],
        )
        .with_processor(ProcessorSpec::new(label));
        (memory, seen)
    }

    #[tokio::test]
    async fn external_dialog_records_and_strips_utterance() {
        let (memory, seen) = fixed("steps-dialog", "testy said: \"Hello! How can I help?\"");
        let (next, said) = external_dialog()
            .run(&memory, "Greet the user", TransformOptions::default())
            .await
            .unwrap();

        assert_eq!(said, "Hello! How can I help?");
        assert_eq!(next.len(), memory.len() + 1);
        let last = next.at(-1).unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(last.text_content().starts_with("testy said:"));

        let requests = seen.lock().unwrap();
        let command = requests[0].memory.last().unwrap().text_content();
        assert!(command.contains("Greet the user"));
        assert!(command.contains("testy said:"));
    }

    #[tokio::test]
    async fn external_dialog_streams_without_preamble() {
        let (memory, _) = fixed("steps-dialog-stream", "testy said: \"Streaming works\"");
        let StreamingTransform { memory: handle, stream, value } = external_dialog()
            .run_stream(&memory, "Say something", TransformOptions::default())
            .await
            .unwrap();

        assert_eq!(collect_text(stream).await.unwrap(), "Streaming works");
        assert_eq!(value.await.unwrap(), "Streaming works");
        let settled = handle.finished().await.unwrap();
        assert_eq!(
            settled.at(-1).unwrap().text_content(),
            "testy said: \"Streaming works\""
        );
    }

    #[tokio::test]
    async fn internal_monologue_uses_thought_verb() {
        let (memory, _) = fixed("steps-monologue", "testy thought: \"they seem nice\"");
        let (next, thought) = internal_monologue()
            .run(&memory, "Reflect", TransformOptions::default())
            .await
            .unwrap();
        assert_eq!(thought, "they seem nice");
        assert_eq!(
            next.at(-1).unwrap().text_content(),
            "testy thought: \"they seem nice\""
        );
    }

    #[tokio::test]
    async fn decision_constrains_to_choices() {
        let (memory, seen) = fixed("steps-decision", "{\"decision\": \"stay\"}");
        let args = DecisionArgs::from(("Stay or go?", vec!["stay".to_string(), "go".to_string()]));
        let (next, choice) = decision()
            .run(&memory, args, TransformOptions::default())
            .await
            .unwrap();

        assert_eq!(choice, "stay");
        assert_eq!(next.at(-1).unwrap().text_content(), "testy decided: stay");
        let requests = seen.lock().unwrap();
        let schema = requests[0].schema.as_ref().unwrap();
        assert_eq!(schema["properties"]["decision"]["enum"], json!(["stay", "go"]));
    }

    #[tokio::test]
    async fn brainstorm_returns_ideas() {
        let (memory, _) = fixed("steps-brainstorm", "{\"new_ideas\": [\"tea\", \"walk\"]}");
        let (_, ideas) = brainstorm()
            .run(&memory, "ways to relax", TransformOptions::default())
            .await
            .unwrap();
        assert_eq!(ideas, vec!["tea", "walk"]);
    }

    #[tokio::test]
    async fn mental_query_returns_bool() {
        let (memory, _) = fixed("steps-query", "{\"isStatementTrue\": false}");
        let (next, truth) = mental_query()
            .run(&memory, "The user is angry", TransformOptions::default())
            .await
            .unwrap();
        assert!(!truth);
        assert_eq!(next.last_value(), Some(&json!(false)));
    }
}
