//! Agent lifecycle hooks.
//!
//! The agent runs `tether hook <event>` and writes a JSON payload to stdin.
//! Payloads are validated once here and turned into a closed [`HookEvent`];
//! nothing downstream looks at raw JSON.

pub mod receiver;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::lock::LockError;

pub use receiver::{HookOutcome, HookReceiver, HookReport};

/// Tools whose invocation means the agent is waiting on the operator.
const INTERACTIVE_TOOLS: &[&str] = &["AskUserQuestion", "ExitPlanMode"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    SessionStart,
    SessionEnd,
    UserPromptSubmit,
    Stop,
    Notification,
    PreToolUse,
    PostToolUse,
}

impl HookKind {
    pub const ALL: [HookKind; 7] = [
        HookKind::SessionStart,
        HookKind::SessionEnd,
        HookKind::UserPromptSubmit,
        HookKind::Stop,
        HookKind::Notification,
        HookKind::PreToolUse,
        HookKind::PostToolUse,
    ];

    /// Kebab-case name used on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStart => "session-start",
            Self::SessionEnd => "session-end",
            Self::UserPromptSubmit => "user-prompt-submit",
            Self::Stop => "stop",
            Self::Notification => "notification",
            Self::PreToolUse => "pre-tool-use",
            Self::PostToolUse => "post-tool-use",
        }
    }

    /// Event name in the agent's settings file.
    pub fn settings_name(self) -> &'static str {
        match self {
            Self::SessionStart => "SessionStart",
            Self::SessionEnd => "SessionEnd",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::Stop => "Stop",
            Self::Notification => "Notification",
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookKind {
    type Err = HookError;

    /// Accepts `session-start`, `session_start` and `SessionStart`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        HookKind::ALL
            .into_iter()
            .find(|kind| kind.settings_name().to_lowercase() == folded)
            .ok_or_else(|| HookError::UnknownEvent(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("unknown hook event '{0}'")]
    UnknownEvent(String),

    #[error("invalid hook payload: {0}")]
    InvalidPayload(String),

    #[error("malformed hook payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("transcript error: {0:#}")]
    Transcript(anyhow::Error),
}

/// Fields every hook shares.
#[derive(Debug, Clone, PartialEq)]
pub struct HookContext {
    pub session_id: String,
    pub cwd: String,
    pub transcript_path: Option<String>,
    pub pane_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    Permission,
    Elicitation,
    Idle,
    Other(String),
}

impl NotificationKind {
    fn classify(notification_type: Option<&str>, message: &str) -> Self {
        match notification_type {
            Some("permission_prompt") => Self::Permission,
            Some("elicitation_dialog") => Self::Elicitation,
            Some("idle_prompt") => Self::Idle,
            Some(other) => Self::Other(other.to_string()),
            None => {
                let lower = message.to_lowercase();
                if lower.contains("needs your permission") || lower.contains("permission to use") {
                    Self::Permission
                } else if lower.contains("waiting for your input") {
                    Self::Idle
                } else {
                    Self::Other(String::new())
                }
            }
        }
    }

    /// True when the notification means the agent is blocked on the operator.
    pub fn asks_operator(&self) -> bool {
        matches!(self, Self::Permission | Self::Elicitation)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    SessionStart {
        source: Option<String>,
    },
    SessionEnd {
        reason: Option<String>,
    },
    UserPromptSubmit {
        prompt: String,
    },
    Stop {
        last_message: Option<String>,
    },
    Notification {
        kind: NotificationKind,
        message: String,
    },
    PreToolUse {
        tool_name: String,
        tool_input: Option<Value>,
    },
    PostToolUse {
        tool_name: String,
    },
}

impl HookEvent {
    pub fn kind(&self) -> HookKind {
        match self {
            Self::SessionStart { .. } => HookKind::SessionStart,
            Self::SessionEnd { .. } => HookKind::SessionEnd,
            Self::UserPromptSubmit { .. } => HookKind::UserPromptSubmit,
            Self::Stop { .. } => HookKind::Stop,
            Self::Notification { .. } => HookKind::Notification,
            Self::PreToolUse { .. } => HookKind::PreToolUse,
            Self::PostToolUse { .. } => HookKind::PostToolUse,
        }
    }
}

/// A validated hook.
#[derive(Debug, Clone, PartialEq)]
pub struct HookPayload {
    pub context: HookContext,
    pub event: HookEvent,
}

#[derive(Debug, Default, Deserialize)]
struct RawPayload {
    session_id: Option<String>,
    cwd: Option<String>,
    transcript_path: Option<String>,
    prompt: Option<String>,
    last_assistant_message: Option<String>,
    message: Option<String>,
    notification_type: Option<String>,
    tool_name: Option<String>,
    tool_input: Option<Value>,
    source: Option<String>,
    reason: Option<String>,
}

impl HookPayload {
    /// Validate a raw JSON payload for `kind`. `pane_id` comes from the
    /// hook process environment, not the payload.
    pub fn parse(kind: HookKind, json: &str, pane_id: Option<String>) -> Result<Self, HookError> {
        let raw: RawPayload = serde_json::from_str(json)?;

        let session_id = required(raw.session_id, "session_id")?;
        let cwd = required(raw.cwd, "cwd")?;
        let context = HookContext {
            session_id,
            cwd,
            transcript_path: raw.transcript_path.filter(|p| !p.is_empty()),
            pane_id: pane_id.filter(|p| !p.is_empty()),
        };

        let event = match kind {
            HookKind::SessionStart => HookEvent::SessionStart { source: raw.source },
            HookKind::SessionEnd => HookEvent::SessionEnd { reason: raw.reason },
            HookKind::UserPromptSubmit => HookEvent::UserPromptSubmit {
                prompt: raw.prompt.unwrap_or_default(),
            },
            HookKind::Stop => HookEvent::Stop {
                last_message: raw.last_assistant_message.filter(|m| !m.trim().is_empty()),
            },
            HookKind::Notification => {
                let message = raw.message.unwrap_or_default();
                HookEvent::Notification {
                    kind: NotificationKind::classify(raw.notification_type.as_deref(), &message),
                    message,
                }
            }
            HookKind::PreToolUse => HookEvent::PreToolUse {
                tool_name: required(raw.tool_name, "tool_name")?,
                tool_input: raw.tool_input,
            },
            HookKind::PostToolUse => HookEvent::PostToolUse {
                tool_name: raw.tool_name.unwrap_or_default(),
            },
        };

        Ok(Self { context, event })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, HookError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(HookError::InvalidPayload(format!("missing {field}"))),
    }
}

/// True for tools that put a question to the operator.
pub fn is_interactive_tool(tool_name: &str) -> bool {
    INTERACTIVE_TOOLS.contains(&tool_name)
}

/// The text an interactive tool shows the operator.
pub fn interactive_prompt_text(tool_name: &str, tool_input: Option<&Value>) -> String {
    let input = tool_input.unwrap_or(&Value::Null);
    let text = match tool_name {
        "AskUserQuestion" => input
            .get("questions")
            .and_then(Value::as_array)
            .map(|questions| {
                questions
                    .iter()
                    .filter_map(|q| q.get("question").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .or_else(|| input.get("question").and_then(Value::as_str).map(str::to_string)),
        "ExitPlanMode" => input.get("plan").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };
    text.filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| format!("{tool_name} requested"))
}

/// What the hook prints to stdout. Always "continue"; tether never blocks the
/// agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HookResponse {
    #[serde(rename = "continue")]
    pub proceed: bool,
    #[serde(rename = "suppressOutput")]
    pub suppress_output: bool,
}

impl HookResponse {
    pub fn ok() -> Self {
        Self {
            proceed: true,
            suppress_output: true,
        }
    }

    pub fn to_json(self) -> String {
        serde_json::to_string(&self)
            .unwrap_or_else(|_| r#"{"continue":true,"suppressOutput":true}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_kind_parses_all_spellings() {
        for kind in HookKind::ALL {
            assert_eq!(kind.as_str().parse::<HookKind>().unwrap(), kind);
            assert_eq!(kind.settings_name().parse::<HookKind>().unwrap(), kind);
        }
        assert_eq!(
            "user_prompt_submit".parse::<HookKind>().unwrap(),
            HookKind::UserPromptSubmit
        );
        assert!("reboot".parse::<HookKind>().is_err());
    }

    #[test]
    fn parse_user_prompt() {
        let payload = HookPayload::parse(
            HookKind::UserPromptSubmit,
            r#"{"session_id":"s1","cwd":"/repo","prompt":"fix it","transcript_path":"/t.jsonl"}"#,
            Some("%4".to_string()),
        )
        .unwrap();
        assert_eq!(payload.context.session_id, "s1");
        assert_eq!(payload.context.pane_id.as_deref(), Some("%4"));
        assert_eq!(payload.context.transcript_path.as_deref(), Some("/t.jsonl"));
        assert_eq!(
            payload.event,
            HookEvent::UserPromptSubmit {
                prompt: "fix it".to_string()
            }
        );
    }

    #[test]
    fn missing_session_id_is_invalid() {
        let err = HookPayload::parse(HookKind::Stop, r#"{"cwd":"/repo"}"#, None).unwrap_err();
        assert!(matches!(err, HookError::InvalidPayload(_)));
        let err =
            HookPayload::parse(HookKind::Stop, r#"{"session_id":" ","cwd":"/r"}"#, None).unwrap_err();
        assert!(err.to_string().contains("session_id"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = HookPayload::parse(HookKind::Stop, "{not json", None).unwrap_err();
        assert!(matches!(err, HookError::Json(_)));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let payload = HookPayload::parse(
            HookKind::Stop,
            r#"{"session_id":"s","cwd":"/r","hook_event_name":"Stop","stop_hook_active":false}"#,
            None,
        )
        .unwrap();
        assert_eq!(payload.event, HookEvent::Stop { last_message: None });
    }

    #[test]
    fn notification_kinds() {
        let parse = |json: &str| match HookPayload::parse(HookKind::Notification, json, None)
            .unwrap()
            .event
        {
            HookEvent::Notification { kind, .. } => kind,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(
            parse(r#"{"session_id":"s","cwd":"/r","notification_type":"permission_prompt"}"#),
            NotificationKind::Permission
        );
        assert_eq!(
            parse(r#"{"session_id":"s","cwd":"/r","message":"Claude needs your permission to use Bash"}"#),
            NotificationKind::Permission
        );
        assert_eq!(
            parse(r#"{"session_id":"s","cwd":"/r","notification_type":"idle_prompt"}"#),
            NotificationKind::Idle
        );
        assert!(NotificationKind::Elicitation.asks_operator());
        assert!(!NotificationKind::Idle.asks_operator());
    }

    #[test]
    fn pre_tool_use_requires_tool_name() {
        assert!(HookPayload::parse(HookKind::PreToolUse, r#"{"session_id":"s","cwd":"/r"}"#, None).is_err());
    }

    #[test]
    fn interactive_tool_text() {
        let input = serde_json::json!({
            "questions": [{"question": "Which database?"}, {"question": "Enable caching?"}]
        });
        assert!(is_interactive_tool("AskUserQuestion"));
        assert!(!is_interactive_tool("Bash"));
        assert_eq!(
            interactive_prompt_text("AskUserQuestion", Some(&input)),
            "Which database?\nEnable caching?"
        );
        assert_eq!(
            interactive_prompt_text("ExitPlanMode", None),
            "ExitPlanMode requested"
        );
    }

    #[test]
    fn response_json_shape() {
        assert_eq!(
            HookResponse::ok().to_json(),
            r#"{"continue":true,"suppressOutput":true}"#
        );
    }
}
