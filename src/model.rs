//! Persisted records: agents, commands and turns.
//!
//! These are plain data; all mutation goes through [`crate::store::Store`]
//! while the owning agent's advisory lock is held.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::Serialize;
use thiserror::Error;

pub type AgentId = i64;
pub type CommandId = i64;
pub type TurnId = i64;

/// Returned when a persisted enum column holds a value this build does not know.
#[derive(Debug, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Conversational state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Idle,
    Commanded,
    Processing,
    AwaitingInput,
    Complete,
}

impl CommandState {
    pub const ALL: [CommandState; 5] = [
        CommandState::Idle,
        CommandState::Commanded,
        CommandState::Processing,
        CommandState::AwaitingInput,
        CommandState::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Commanded => "commanded",
            Self::Processing => "processing",
            Self::AwaitingInput => "awaiting_input",
            Self::Complete => "complete",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Who authored a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Operator,
    Agent,
}

impl Actor {
    pub const ALL: [Actor; 2] = [Actor::Operator, Actor::Agent];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Agent => "agent",
        }
    }
}

/// Structural purpose of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Command,
    Question,
    Answer,
    Progress,
    Completion,
    EndOfWork,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::Command,
        Intent::Question,
        Intent::Answer,
        Intent::Progress,
        Intent::Completion,
        Intent::EndOfWork,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Question => "question",
            Self::Answer => "answer",
            Self::Progress => "progress",
            Self::Completion => "completion",
            Self::EndOfWork => "end_of_work",
        }
    }
}

/// Which signal channel produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    Hook,
    Transcript,
}

impl TurnSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hook => "hook",
            Self::Transcript => "transcript",
        }
    }
}

macro_rules! text_enum {
    ($ty:ty, $kind:literal, [$($variant:expr),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == $variant.as_str() {
                        return Ok($variant);
                    }
                )+
                Err(UnknownVariant {
                    kind: $kind,
                    value: s.to_string(),
                })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum!(
    CommandState,
    "command state",
    [
        CommandState::Idle,
        CommandState::Commanded,
        CommandState::Processing,
        CommandState::AwaitingInput,
        CommandState::Complete,
    ]
);
text_enum!(Actor, "actor", [Actor::Operator, Actor::Agent]);
text_enum!(
    Intent,
    "intent",
    [
        Intent::Command,
        Intent::Question,
        Intent::Answer,
        Intent::Progress,
        Intent::Completion,
        Intent::EndOfWork,
    ]
);
text_enum!(TurnSource, "turn source", [TurnSource::Hook, TurnSource::Transcript]);

/// One monitored agent process and its pane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Agent {
    pub id: AgentId,
    pub session_id: Option<String>,
    pub cwd: String,
    pub pane_id: Option<String>,
    pub transcript_path: Option<String>,
    pub transcript_offset: u64,
    pub context_percent: Option<u8>,
    pub registered_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Registration request for a new agent.
#[derive(Debug, Clone, Default)]
pub struct NewAgent {
    pub cwd: String,
    pub session_id: Option<String>,
    pub pane_id: Option<String>,
    pub transcript_path: Option<String>,
}

/// One operator-initiated unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub id: CommandId,
    pub agent_id: AgentId,
    pub state: CommandState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One atomic message within a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub id: TurnId,
    pub command_id: CommandId,
    pub agent_id: AgentId,
    pub actor: Actor,
    pub intent: Intent,
    pub text: String,
    pub fingerprint: Option<String>,
    pub source: TurnSource,
    pub timestamp: DateTime<Utc>,
    pub reconciled: bool,
}

/// Convert a timestamp to the integer millisecond form stored in SQLite.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Inverse of [`to_millis`]. Out-of-range values collapse to the epoch.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_state_round_trips_through_text() {
        for state in CommandState::ALL {
            assert_eq!(state.as_str().parse::<CommandState>().unwrap(), state);
        }
    }

    #[test]
    fn unknown_intent_is_an_error() {
        let err = "shrug".parse::<Intent>().unwrap_err();
        assert_eq!(err.to_string(), "unknown intent 'shrug'");
    }

    #[test]
    fn only_complete_is_terminal() {
        let terminal: Vec<_> = CommandState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(terminal, vec![CommandState::Complete]);
    }

    #[test]
    fn millis_conversion_keeps_precision() {
        let ts = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(ts), 1_700_000_000_123);
    }
}
