//! Incremental reader for an agent's JSONL transcript.
//!
//! The transcript is append-only. Reads seek to a persisted byte offset and
//! consume complete lines only; a trailing line without its newline is left
//! for the next read. Every entry carries the offset just past its line so
//! a caller can checkpoint after each one.
//!
//! Entry shape (one JSON object per line):
//!
//! ```text
//! {"type":"user","message":{"content":"fix the bug"},"timestamp":"2026-03-01T10:00:00Z"}
//! {"type":"assistant","message":{"content":[{"type":"text","text":"Done."}]},"timestamp":"..."}
//! ```
//!
//! Meta entries, sidechain (sub-agent) entries, tool results and slash-command
//! bookkeeping are not conversation and are skipped.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, trace};

use crate::model::Actor;

/// How much of the file tail `last_agent_text` inspects.
const TAIL_BYTES: u64 = 256 * 1024;

const NOISE_PREFIXES: &[&str] = &[
    "<command-name>",
    "<command-message>",
    "<command-args>",
    "<local-command-stdout>",
    "<local-command-stderr>",
    "Caveat: The messages below were generated by the user while running local commands",
    "[Request interrupted by user",
];

/// One conversational message from the transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub actor: Actor,
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
    /// Byte offset just past this entry's line.
    pub end_offset: u64,
}

/// Result of one read: the entries found and where the next read starts.
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub entries: Vec<TranscriptEntry>,
    pub next_offset: u64,
}

pub struct TranscriptReader {
    path: PathBuf,
    position: u64,
}

impl TranscriptReader {
    pub fn new(path: &Path, position: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            position,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read complete lines appended since the last read.
    pub fn read(&mut self) -> Result<ReadBatch> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReadBatch {
                    entries: Vec::new(),
                    next_offset: self.position,
                });
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to open transcript: {}", self.path.display()));
            }
        };

        // A shorter file means it was replaced; start over.
        let file_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if self.position > file_len {
            debug!(
                path = %self.path.display(),
                offset = self.position,
                len = file_len,
                "transcript shrank; rewinding"
            );
            self.position = 0;
        }

        file.seek(SeekFrom::Start(self.position))
            .context("failed to seek in transcript")?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .context("failed to read transcript")?;

        let Some(last_newline) = bytes.iter().rposition(|&b| b == b'\n') else {
            return Ok(ReadBatch {
                entries: Vec::new(),
                next_offset: self.position,
            });
        };

        let mut entries = Vec::new();
        let mut cursor = self.position;
        for line in bytes[..=last_newline].split_inclusive(|&b| b == b'\n') {
            cursor += line.len() as u64;
            let text = String::from_utf8_lossy(line);
            match parse_line(text.trim()) {
                Some((actor, body, timestamp)) => entries.push(TranscriptEntry {
                    actor,
                    text: body,
                    timestamp,
                    end_offset: cursor,
                }),
                None => trace!(offset = cursor, "skipped transcript line"),
            }
        }

        self.position = cursor;
        Ok(ReadBatch {
            entries,
            next_offset: cursor,
        })
    }
}

/// Parse one transcript line into `(actor, text, timestamp)`. Returns `None`
/// for anything that is not an operator or agent message with content.
pub fn parse_line(line: &str) -> Option<(Actor, String, Option<DateTime<Utc>>)> {
    if line.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(line).ok()?;

    if flag(&value, "isMeta") || flag(&value, "isSidechain") {
        return None;
    }
    let actor = match value.get("type")?.as_str()? {
        "user" => Actor::Operator,
        "assistant" => Actor::Agent,
        _ => return None,
    };

    let text = message_text(value.get("message")?.get("content")?)?;
    let text = text.trim();
    if text.is_empty() || NOISE_PREFIXES.iter().any(|p| text.starts_with(p)) {
        return None;
    }

    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc));

    Some((actor, text.to_string(), timestamp))
}

/// Text of the newest agent message in the transcript, if any.
pub fn last_agent_text(path: &Path) -> Result<Option<String>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to open transcript: {}", path.display()));
        }
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(TAIL_BYTES);
    file.seek(SeekFrom::Start(start))
        .context("failed to seek in transcript")?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .context("failed to read transcript")?;

    let text = String::from_utf8_lossy(&bytes);
    let mut lines = text.lines();
    if start > 0 {
        // First line is probably cut.
        lines.next();
    }
    let found = lines
        .rev()
        .filter_map(|line| parse_line(line.trim()))
        .find(|(actor, _, _)| *actor == Actor::Agent)
        .map(|(_, text, _)| text);
    Ok(found)
}

fn flag(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn message_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n\n"))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn user(text: &str, ts: &str) -> String {
        serde_json::json!({
            "type": "user",
            "message": {"role": "user", "content": text},
            "timestamp": ts,
        })
        .to_string()
    }

    fn assistant(text: &str, ts: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "message": {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": text},
                {"type": "tool_use", "id": "t1", "name": "Read", "input": {}},
            ]},
            "timestamp": ts,
        })
        .to_string()
    }

    #[test]
    fn parses_user_and_assistant_entries() {
        let (actor, text, ts) = parse_line(&user("fix the bug", "2026-03-01T10:00:00Z")).unwrap();
        assert_eq!(actor, Actor::Operator);
        assert_eq!(text, "fix the bug");
        assert_eq!(ts.unwrap().to_rfc3339(), "2026-03-01T10:00:00+00:00");

        let (actor, text, _) =
            parse_line(&assistant("On it.", "2026-03-01T10:00:01Z")).unwrap();
        assert_eq!(actor, Actor::Agent);
        assert_eq!(text, "On it.");
    }

    #[test]
    fn skips_non_conversation_entries() {
        let meta = r#"{"type":"user","isMeta":true,"message":{"content":"hidden"}}"#;
        let sidechain = r#"{"type":"assistant","isSidechain":true,"message":{"content":"sub"}}"#;
        let tool_result = r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"ok"}]}}"#;
        let command = r#"{"type":"user","message":{"content":"<command-name>/clear</command-name>"}}"#;
        let summary = r#"{"type":"summary","summary":"x"}"#;
        for line in [meta, sidechain, tool_result, command, summary, "not json", ""] {
            assert!(parse_line(line).is_none(), "should skip: {line}");
        }
    }

    #[test]
    fn reads_complete_lines_and_tracks_offsets() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.jsonl");
        let first = user("hello", "2026-03-01T10:00:00Z");
        let second = assistant("hi", "2026-03-01T10:00:01Z");
        fs::write(&path, format!("{first}\n{second}\n")).unwrap();

        let mut reader = TranscriptReader::new(&path, 0);
        let batch = reader.read().unwrap();
        assert_eq!(batch.entries.len(), 2);
        assert_eq!(batch.entries[0].end_offset, first.len() as u64 + 1);
        assert_eq!(batch.next_offset, fs::metadata(&path).unwrap().len());

        let again = reader.read().unwrap();
        assert!(again.entries.is_empty());
        assert_eq!(again.next_offset, batch.next_offset);
    }

    #[test]
    fn partial_trailing_line_waits_for_newline() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.jsonl");
        let done = user("one", "2026-03-01T10:00:00Z");
        let pending = assistant("two", "2026-03-01T10:00:01Z");
        fs::write(&path, format!("{done}\n{}", &pending[..10])).unwrap();

        let mut reader = TranscriptReader::new(&path, 0);
        let batch = reader.read().unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.next_offset, done.len() as u64 + 1);

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{}", &pending[10..]).unwrap();
        let batch = reader.read().unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].text, "two");
    }

    #[test]
    fn stale_offset_rewinds_to_start() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.jsonl");
        fs::write(&path, format!("{}\n", user("again", "2026-03-01T10:00:00Z"))).unwrap();

        let mut reader = TranscriptReader::new(&path, 10_000);
        let batch = reader.read().unwrap();
        assert_eq!(batch.entries.len(), 1);
    }

    #[test]
    fn missing_file_yields_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reader = TranscriptReader::new(&tmp.path().join("absent.jsonl"), 5);
        let batch = reader.read().unwrap();
        assert!(batch.entries.is_empty());
        assert_eq!(batch.next_offset, 5);
        assert!(last_agent_text(&tmp.path().join("absent.jsonl")).unwrap().is_none());
    }

    #[test]
    fn last_agent_text_finds_newest_assistant_message() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.jsonl");
        let lines = [
            assistant("first", "2026-03-01T10:00:00Z"),
            assistant("Shall I continue?", "2026-03-01T10:00:02Z"),
            user("<command-name>/cost</command-name>", "2026-03-01T10:00:03Z"),
        ];
        fs::write(&path, lines.join("\n") + "\n").unwrap();
        assert_eq!(
            last_agent_text(&path).unwrap().as_deref(),
            Some("Shall I continue?")
        );
    }
}
