//! Prompt construction shared by the adapters.

use super::types::ChatMessage;

/// Roles delivered through the tool's system-prompt mechanism instead of the prompt.
fn is_system_role(role: &str) -> bool {
    matches!(role, "system" | "developer")
}

/// Text of the last message with role "user".
pub fn last_user_message(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
}

/// Text of the first message with role "user".
pub fn first_user_message(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
}

/// Joins all system/developer messages, or `None` when there are none.
pub fn collect_system_prompt(messages: &[ChatMessage]) -> Option<String> {
    let parts: Vec<&str> = messages
        .iter()
        .filter(|m| is_system_role(&m.role))
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Prompt for a fresh turn when the tool cannot resume a prior conversation.
///
/// Renders the whole history as tagged `<user>`/`<assistant>` blocks. With a
/// single user turn and no assistant turn this is just that user message.
pub fn flatten_transcript(messages: &[ChatMessage]) -> String {
    let turns: Vec<&ChatMessage> = messages
        .iter()
        .filter(|m| m.role == "user" || m.role == "assistant")
        .collect();

    let user_turns = turns.iter().filter(|m| m.role == "user").count();
    let has_assistant = turns.iter().any(|m| m.role == "assistant");
    if user_turns <= 1 && !has_assistant {
        return last_user_message(messages).unwrap_or_default().to_string();
    }

    let mut out = String::new();
    for turn in turns {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&format!("<{role}>\n{}\n</{role}>", turn.content.trim(), role = turn.role));
    }
    out
}

/// Prompt for one turn: the latest user message when the tool resumes its own
/// conversation, otherwise the flattened transcript.
pub fn build_prompt(messages: &[ChatMessage], resuming: bool) -> String {
    if resuming {
        last_user_message(messages).unwrap_or_default().to_string()
    } else {
        flatten_transcript(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> Vec<ChatMessage> {
        vec![
            ChatMessage::new("system", "Be terse."),
            ChatMessage::new("user", "2+2?"),
            ChatMessage::new("assistant", "4"),
            ChatMessage::new("developer", "Answer in digits."),
            ChatMessage::new("user", "and 3+3?"),
        ]
    }

    #[test]
    fn picks_last_and_first_user_messages() {
        let msgs = history();
        assert_eq!(last_user_message(&msgs), Some("and 3+3?"));
        assert_eq!(first_user_message(&msgs), Some("2+2?"));
        assert_eq!(last_user_message(&[ChatMessage::new("system", "x")]), None);
    }

    #[test]
    fn system_and_developer_messages_are_joined() {
        assert_eq!(
            collect_system_prompt(&history()).as_deref(),
            Some("Be terse.\n\nAnswer in digits.")
        );
        assert_eq!(collect_system_prompt(&[ChatMessage::new("user", "hi")]), None);
    }

    #[test]
    fn transcript_tags_each_turn_and_skips_system() {
        let transcript = flatten_transcript(&history());
        assert_eq!(
            transcript,
            "<user>\n2+2?\n</user>\n\n<assistant>\n4\n</assistant>\n\n<user>\nand 3+3?\n</user>"
        );
    }

    #[test]
    fn single_user_turn_is_sent_bare() {
        let msgs = vec![ChatMessage::new("system", "sys"), ChatMessage::new("user", "hello")];
        assert_eq!(flatten_transcript(&msgs), "hello");
    }

    #[test]
    fn resuming_sends_only_latest_user_message() {
        assert_eq!(build_prompt(&history(), true), "and 3+3?");
        assert!(build_prompt(&history(), false).starts_with("<user>"));
    }
}
