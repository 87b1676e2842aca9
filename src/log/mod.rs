//! Activity log: JSON lines recording what tether observed and did.
//!
//! Hooks run inside the agent's process tree with their output suppressed,
//! so this file is where hook failures, lock timeouts and rejected
//! transitions become visible. Each line is a self-contained JSON object
//! with an RFC 3339 timestamp, easy to grep or tail.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::lifecycle::{Transition, TurnOutcome};
use crate::model::{Actor, AgentId, CommandId, CommandState, Intent, TurnId, TurnSource};
use crate::text;

const PREVIEW_CHARS: usize = 80;

/// A structured event in the activity log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LogEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    HookReceived {
        hook: String,
        session_id: String,
        agent_id: Option<AgentId>,
    },
    HookFailed {
        hook: String,
        error: String,
    },
    TurnRecorded {
        agent_id: AgentId,
        command_id: CommandId,
        turn_id: TurnId,
        actor: Actor,
        intent: Intent,
        source: TurnSource,
        preview: String,
    },
    Transitioned {
        agent_id: AgentId,
        command_id: CommandId,
        path: Vec<CommandState>,
    },
    TransitionRejected {
        agent_id: AgentId,
        command_id: CommandId,
        error: String,
    },
    TurnReconciled {
        agent_id: AgentId,
        turn_id: TurnId,
    },
    LockTimeout {
        agent_id: AgentId,
        context: String,
    },
    AgentRegistered {
        agent_id: AgentId,
        cwd: String,
    },
    AgentEnded {
        agent_id: AgentId,
        reason: String,
    },
    DeliveryFailed {
        agent_id: AgentId,
        error: String,
    },
}

/// Writer for the JSON lines activity log.
pub struct ActivityLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ActivityLog {
    /// Open for append, creating the file and its parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open activity log: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: Utc::now(),
            event,
        };
        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;
        debug!(event = %json, "activity log");

        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush activity log")?;
        Ok(())
    }

    /// Log without failing the caller; write errors go to tracing.
    pub fn note(&self, event: LogEvent) {
        if let Err(e) = self.log(event) {
            warn!(path = %self.path.display(), error = %e, "activity log write failed");
        }
    }

    /// Record a persisted turn and whatever it did to its command.
    pub fn note_outcome(&self, outcome: &TurnOutcome) {
        let turn = &outcome.turn;
        if outcome.transition == Transition::AlreadyRecorded {
            self.note(LogEvent::TurnReconciled {
                agent_id: turn.agent_id,
                turn_id: turn.id,
            });
            return;
        }
        self.note(LogEvent::TurnRecorded {
            agent_id: turn.agent_id,
            command_id: turn.command_id,
            turn_id: turn.id,
            actor: turn.actor,
            intent: turn.intent,
            source: turn.source,
            preview: text::preview(&turn.text, PREVIEW_CHARS),
        });
        match &outcome.transition {
            Transition::Applied { path } => self.note(LogEvent::Transitioned {
                agent_id: turn.agent_id,
                command_id: turn.command_id,
                path: path.clone(),
            }),
            Transition::Rejected(rejected) => self.note(LogEvent::TransitionRejected {
                agent_id: turn.agent_id,
                command_id: turn.command_id,
                error: rejected.to_string(),
            }),
            Transition::Attached | Transition::AlreadyRecorded => {}
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_entry_serializes_to_json() {
        let entry = LogEntry {
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            event: LogEvent::LockTimeout {
                agent_id: 4,
                context: "hook stop".to_string(),
            },
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"lock_timeout\""));
        assert!(json.contains("\"agent_id\":4"));
        assert!(json.contains("\"timestamp\":\"2023-11-14T22:13:20Z\""));
    }

    #[test]
    fn transition_path_serializes_as_state_names() {
        let event = LogEvent::Transitioned {
            agent_id: 1,
            command_id: 2,
            path: vec![CommandState::Idle, CommandState::Commanded, CommandState::Processing],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("[\"idle\",\"commanded\",\"processing\"]"));
    }

    #[test]
    fn write_and_read_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("activity.jsonl");
        let log = ActivityLog::open(&log_path).unwrap();

        log.log(LogEvent::HookReceived {
            hook: "stop".to_string(),
            session_id: "s-1".to_string(),
            agent_id: Some(3),
        })
        .unwrap();
        log.note(LogEvent::AgentEnded {
            agent_id: 3,
            reason: "exit".to_string(),
        });

        let content = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("event").is_some());
            assert!(parsed.get("timestamp").is_some());
        }
        assert!(lines[0].contains("\"event\":\"hook_received\""));
        assert!(lines[1].contains("\"event\":\"agent_ended\""));
    }

    #[test]
    fn creates_parent_directories_and_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("deep").join("logs").join("activity.jsonl");

        for _ in 0..2 {
            let log = ActivityLog::open(&log_path).unwrap();
            log.note(LogEvent::HookFailed {
                hook: "stop".to_string(),
                error: "boom".to_string(),
            });
        }

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert_eq!(ActivityLog::open(&log_path).unwrap().path(), log_path);
    }
}
