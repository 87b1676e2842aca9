//! Intent classification for observed text.
//!
//! Hooks usually tell us the intent directly (a stop hook is a completion, a
//! permission notification is a question). Transcript entries and stop
//! payloads carry only text, so their intent is inferred from its shape:
//! a message that ends by asking something is a QUESTION, a message that
//! reports finished work is a COMPLETION, anything else is PROGRESS.
//!
//! Matching runs on the last paragraph of ANSI-stripped text. Earlier
//! paragraphs routinely contain rhetorical questions or "done with step 1"
//! narration that says nothing about where the turn ended up.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::{CommandState, Intent};
use crate::text::strip_ansi;

/// Shape of an agent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageShape {
    Question,
    Completion,
    Progress,
}

type ShapeRule = (Regex, MessageShape);

static RULES: LazyLock<Vec<ShapeRule>> = LazyLock::new(|| {
    let rule = |pattern: &str, shape| (Regex::new(pattern).expect("valid intent pattern"), shape);
    vec![
        // Explicit choice prompts
        rule(r"(?i)\[y/n\]|\(y/n\)|\byes/no\b", MessageShape::Question),
        // Trailing question mark, ignoring closing quotes, brackets or markup
        rule(r#"\?[\s"'`*_)\]]*$"#, MessageShape::Question),
        // Requests for a decision phrased without a question mark
        rule(
            r"(?i)\b(let me know (if|whether|which|how)|please (confirm|choose|select|advise)|which (option|approach) (would|do|should)|waiting for your (input|answer|confirmation))\b",
            MessageShape::Question,
        ),
        // Finished work
        rule(
            r"(?i)\b(i('ve| have) (finished|completed|implemented|fixed|made|updated|added)|(all|the) (changes|tests) (are|have been) (done|complete|passing|made)|(task|work|implementation) (is )?(complete|completed|done|finished)|successfully (completed|implemented|fixed|updated))\b",
            MessageShape::Completion,
        ),
        rule(r"(?im)^\s*(#+\s*)?(summary|done|complete)[.!:]?\s*$", MessageShape::Completion),
    ]
});

/// Classify the closing paragraph of an agent message.
pub fn message_shape(text: &str) -> MessageShape {
    let tail = closing_paragraph(text);
    if tail.is_empty() {
        return MessageShape::Progress;
    }
    for (regex, shape) in RULES.iter() {
        if regex.is_match(&tail) {
            return *shape;
        }
    }
    MessageShape::Progress
}

/// True when the message ends by asking the operator something.
pub fn is_question(text: &str) -> bool {
    message_shape(text) == MessageShape::Question
}

/// Intent for an agent message seen in the transcript.
pub fn classify_agent_text(text: &str) -> Intent {
    match message_shape(text) {
        MessageShape::Question => Intent::Question,
        MessageShape::Completion => Intent::Completion,
        MessageShape::Progress => Intent::Progress,
    }
}

/// Intent for the message that closed an agent's turn. A turn that stops
/// without asking anything is finished.
pub fn classify_stop_text(text: &str) -> Intent {
    if is_question(text) {
        Intent::Question
    } else {
        Intent::Completion
    }
}

/// Intent of an operator message given the state of the open command.
pub fn operator_intent(open_state: Option<CommandState>) -> Intent {
    match open_state {
        Some(CommandState::AwaitingInput) => Intent::Answer,
        _ => Intent::Command,
    }
}

fn closing_paragraph(text: &str) -> String {
    let clean = strip_ansi(text);
    let trimmed = clean.trim_end();
    // Trailing fenced code blocks do not end the conversation.
    let body = match strip_trailing_fence(trimmed) {
        Some(before) if !before.trim().is_empty() => before,
        _ => trimmed,
    };
    let paragraphs: Vec<&str> = body
        .split("\n\n")
        .filter(|p| !p.trim().is_empty())
        .collect();
    paragraphs.last().map(|p| p.trim().to_string()).unwrap_or_default()
}

/// Text before a code block that closes the message, if it does.
fn strip_trailing_fence(text: &str) -> Option<&str> {
    let mut lines = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        lines.push((offset, line));
        offset += line.len();
    }
    let ((_, last), rest) = lines.split_last()?;
    if last.trim() != "```" {
        return None;
    }
    let open = rest
        .iter()
        .rposition(|(_, line)| line.trim_start().starts_with("```"))?;
    text.get(..rest[open].0)
}
