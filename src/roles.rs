//! Role-alternation fixer for backends with message-format constraints.
//!
//! Some chat APIs accept only one system message, and some reject two
//! consecutive turns from the same role or a conversation that opens with
//! the assistant. [`fix_roles`] reshapes a memory list to satisfy both rules
//! without touching its input. It is idempotent: feeding its output back in
//! returns the same sequence.

use crate::types::{Content, ContentPart, Memory, Role};

/// Content of the user turn inserted before a leading assistant turn.
pub const FILLER_USER_TEXT: &str = "...";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleFixOptions {
    /// Every system memory after the first becomes a user memory.
    pub single_system_message: bool,
    /// Consecutive same-role memories merge; a leading assistant turn gets a user filler.
    pub forced_role_alternation: bool,
}

impl RoleFixOptions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            single_system_message: true,
            forced_role_alternation: true,
        }
    }
}

pub fn fix_roles(opts: RoleFixOptions, memories: &[Memory]) -> Vec<Memory> {
    let mut out: Vec<Memory> = memories.to_vec();

    if opts.single_system_message {
        let mut seen_system = false;
        for memory in out.iter_mut() {
            if memory.role == Role::System {
                if seen_system {
                    memory.role = Role::User;
                }
                seen_system = true;
            }
        }
    }

    if opts.forced_role_alternation {
        out = merge_consecutive(out);

        // System turns travel out of band on strict backends; the first
        // conversational turn must come from the user.
        let first_turn = out.iter().position(|m| m.role != Role::System);
        if let Some(idx) = first_turn {
            if out[idx].role == Role::Assistant {
                out.insert(idx, Memory::user(FILLER_USER_TEXT));
            }
        }
    }

    out
}

fn merge_consecutive(memories: Vec<Memory>) -> Vec<Memory> {
    let mut merged: Vec<Memory> = Vec::with_capacity(memories.len());
    for memory in memories {
        match merged.last_mut() {
            Some(last) if last.role == memory.role => {
                last.content = append_fragment(&last.content, &memory);
            }
            _ => merged.push(memory),
        }
    }
    merged
}

/// Appends `next` to `existing` as a `"<speaker> said: <text>"` fragment.
fn append_fragment(existing: &Content, next: &Memory) -> Content {
    let speaker = next
        .name
        .clone()
        .unwrap_or_else(|| next.role.as_str().to_string());

    match (existing, &next.content) {
        (Content::Text(prev), Content::Text(text)) => {
            Content::Text(format!("{prev}\n\n{speaker} said: {text}"))
        }
        _ => {
            let mut parts = existing.clone().into_parts();
            parts.push(ContentPart::text(format!("\n\n{speaker} said: ")));
            parts.extend(next.content.clone().into_parts());
            Content::Parts(parts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(memories: &[Memory]) -> Vec<Role> {
        memories.iter().map(|m| m.role).collect()
    }

    fn texts(memories: &[Memory]) -> Vec<String> {
        memories.iter().map(|m| m.text_content()).collect()
    }

    #[test]
    fn noop_without_flags() {
        let input = vec![Memory::system("a"), Memory::system("b"), Memory::user("c")];
        let out = fix_roles(RoleFixOptions::none(), &input);
        assert_eq!(out, input);
    }

    #[test]
    fn single_system_message_converts_later_systems() {
        let input = vec![Memory::system("a"), Memory::system("b"), Memory::user("c")];
        let opts = RoleFixOptions {
            single_system_message: true,
            forced_role_alternation: false,
        };
        let out = fix_roles(opts, &input);
        assert_eq!(roles(&out), vec![Role::System, Role::User, Role::User]);
        assert_eq!(out.iter().filter(|m| m.role == Role::System).count(), 1);

        let again = fix_roles(opts, &out);
        assert_eq!(again, out);
    }

    #[test]
    fn input_is_untouched() {
        let input = vec![Memory::system("a"), Memory::system("b")];
        let _ = fix_roles(RoleFixOptions::strict(), &input);
        assert_eq!(roles(&input), vec![Role::System, Role::System]);
    }

    #[test]
    fn merges_consecutive_same_role() {
        let input = vec![
            Memory::user("hi"),
            Memory::user("anyone there?"),
            Memory::assistant("yes"),
        ];
        let opts = RoleFixOptions {
            single_system_message: false,
            forced_role_alternation: true,
        };
        let out = fix_roles(opts, &input);
        assert_eq!(roles(&out), vec![Role::User, Role::Assistant]);
        assert_eq!(out[0].text_content(), "hi\n\nuser said: anyone there?");
        assert_eq!(out[0].id(), input[0].id());
    }

    #[test]
    fn merged_fragment_uses_name_when_present() {
        let input = vec![
            Memory::user("hi").with_name("kevin"),
            Memory::user("hello").with_name("ann"),
        ];
        let out = fix_roles(RoleFixOptions::strict(), &input);
        assert_eq!(texts(&out), vec!["hi\n\nann said: hello".to_string()]);
    }

    #[test]
    fn prepends_filler_before_leading_assistant() {
        let input = vec![Memory::system("persona"), Memory::assistant("I speak first")];
        let out = fix_roles(RoleFixOptions::strict(), &input);
        assert_eq!(roles(&out), vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(out[1].text_content(), FILLER_USER_TEXT);
    }

    #[test]
    fn strict_is_idempotent() {
        let input = vec![
            Memory::system("persona"),
            Memory::system("extra rules"),
            Memory::user("hi"),
            Memory::assistant("hey"),
            Memory::assistant("still me"),
            Memory::system("respond in JSON"),
        ];
        let once = fix_roles(RoleFixOptions::strict(), &input);
        let twice = fix_roles(RoleFixOptions::strict(), &once);
        assert_eq!(once, twice);
        assert_eq!(
            roles(&once),
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(
            once[1].text_content(),
            "extra rules\n\nuser said: hi"
        );
    }

    #[test]
    fn merges_multipart_content() {
        let input = vec![
            Memory::user("look"),
            Memory::user(vec![ContentPart::image("https://example.com/a.png")]),
        ];
        let out = fix_roles(RoleFixOptions::strict(), &input);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content.image_count(), 1);
        assert_eq!(out[0].text_content(), "look\n\nuser said: ");
    }

    #[test]
    fn empty_input() {
        assert!(fix_roles(RoleFixOptions::strict(), &[]).is_empty());
    }
}
