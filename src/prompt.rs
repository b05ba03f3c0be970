//! Prompt assembly and model-output post-processing

use crate::model::ChatMessage;
use crate::retrieval::KnowledgeItem;
use crate::session::Message;

/// Default system prompt
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer using the reference \
knowledge when it is relevant, prefer sources with higher trust, and say so when you do not know.";

/// Build the message list for one question
///
/// `history` holds the prior turns only; each contributes its summary (or
/// its content when it has none). Empty entries are skipped.
pub fn build_messages(
    system_prompt: &str,
    history: &[Message],
    question: &str,
    knowledge: &[KnowledgeItem],
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system_prompt));

    for message in history {
        let text = message.context_text().trim();
        if text.is_empty() {
            continue;
        }
        messages.push(ChatMessage::new(message.role.as_str(), text));
    }

    messages.push(ChatMessage::user(render_user_prompt(question, knowledge)));
    messages
}

/// The question with retrieved knowledge inlined, each item annotated with
/// its source and trust weight
pub fn render_user_prompt(question: &str, knowledge: &[KnowledgeItem]) -> String {
    if knowledge.is_empty() {
        return question.to_string();
    }

    let mut prompt = String::from("Reference knowledge:\n");
    for item in knowledge {
        prompt.push_str(&format!(
            "[source: {} | trust: {:.1} | data: {}]\n",
            item.source,
            item.weight,
            item.text.trim()
        ));
    }
    prompt.push_str("\nQuestion: ");
    prompt.push_str(question);
    prompt
}

/// Split model output into (reasoning, answer) around `start`/`end` markers
///
/// Output that closes a reasoning block it never opened is treated as if it
/// opened at the beginning. An unclosed block runs to the end.
pub fn split_reasoning(text: &str, start: &str, end: &str) -> (Option<String>, String) {
    let (before, thought, after) = match text.find(start) {
        Some(open) => {
            let inner = &text[open + start.len()..];
            match inner.find(end) {
                Some(close) => (&text[..open], &inner[..close], &inner[close + end.len()..]),
                None => (&text[..open], inner, ""),
            }
        }
        None => match text.find(end) {
            Some(close) => ("", &text[..close], &text[close + end.len()..]),
            None => return (None, text.trim().to_string()),
        },
    };

    let thought = thought.trim();
    let answer = format!("{}{}", before, after).trim().to_string();
    let thought = (!thought.is_empty()).then(|| thought.to_string());
    (thought, answer)
}

/// First sentence of `text`, capped at `max_chars` characters
pub fn summarize(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let sentence = match collapsed.find(|c: char| matches!(c, '.' | '!' | '?' | '。' | '！' | '？')) {
        Some(idx) => {
            let terminator_len = collapsed[idx..].chars().next().map_or(1, char::len_utf8);
            &collapsed[..idx + terminator_len]
        }
        None => collapsed.as_str(),
    };

    if sentence.chars().count() <= max_chars {
        return sentence.to_string();
    }
    let mut truncated: String = sentence.chars().take(max_chars.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}
