//! JSON extraction and schema validation for structured completions.

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::{SoulError, SoulResult};
use crate::types::{Memory, Role};

/// Finds the first JSON object in free text.
///
/// Scanning starts at the first `{`. Brace depth is tracked outside string
/// literals, and each return to depth zero is a candidate; the first
/// candidate that parses wins.
pub fn extract_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();

    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    if let Ok(value) = serde_json::from_str::<Value>(&text[start..end]) {
                        return Some(value);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Extracts and validates in one step; the error distinguishes "no JSON" from "wrong shape".
pub fn parse_structured(text: &str, schema: &Value) -> SoulResult<Value> {
    let value = extract_json(text)
        .ok_or_else(|| SoulError::MalformedOutput("no JSON found".into()))?;
    validate(schema, &value)?;
    Ok(value)
}

pub fn validate(schema: &Value, instance: &Value) -> SoulResult<()> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|e| SoulError::InvalidSpec(format!("invalid schema: {e}")))?;
    let result = compiled.validate(instance);
    if let Err(errors) = result {
        let errors: Vec<String> = errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect();
        return Err(SoulError::SchemaValidation { errors });
    }
    Ok(())
}

/// System directive asking for JSON output that matches `schema`.
pub fn json_directive(schema: &Value) -> String {
    let rendered = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "Respond *only* in JSON, conforming to the following JSON schema. Do not include any other text.\n```json\n{rendered}\n```"
    )
}

/// True when some system memory already asks for JSON.
pub fn mentions_json(memories: &[Memory]) -> bool {
    memories
        .iter()
        .any(|m| m.role == Role::System && m.text_content().contains("JSON"))
}

/// Appends the JSON directive unless one is already present.
pub fn ensure_json_directive(memories: &mut Vec<Memory>, schema: &Value) {
    if !mentions_json(memories) {
        memories.push(Memory::system(json_directive(schema)));
    }
}

/// The two corrective turns appended after a bad structured completion.
pub fn corrective_turns(bad_output: &str, error: &SoulError) -> [Memory; 2] {
    let reason = match error {
        SoulError::SchemaValidation { errors } => errors.join("\n"),
        other => other.to_string(),
    };
    [
        Memory::assistant(bad_output.to_string()),
        Memory::user(format!(
            "That response did not match the required JSON schema:\n{reason}\n\nPlease try again and respond only with JSON that conforms to the schema."
        )),
    ]
}
