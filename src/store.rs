//! SQLite-backed store for agents, commands and turns.
//!
//! Every caller (hook process, reconciler thread, sweeper thread, CLI) opens
//! its own [`Store`] against the same database file. Mutations are only
//! issued while the owning agent's advisory lock is held; plain reads take no
//! lock and may observe an agent mid-transition.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use crate::model::{
    Actor, Agent, AgentId, Command, CommandId, CommandState, Intent, NewAgent, Turn, TurnId,
    TurnSource, from_millis, to_millis,
};

/// How long a connection waits on SQLite's own write lock before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT UNIQUE,
    cwd TEXT NOT NULL,
    pane_id TEXT,
    transcript_path TEXT,
    transcript_offset INTEGER NOT NULL DEFAULT 0,
    context_percent INTEGER,
    registered_at INTEGER NOT NULL,
    last_active_at INTEGER NOT NULL,
    ended_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_agents_cwd ON agents(cwd, registered_at);

CREATE TABLE IF NOT EXISTS commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id INTEGER NOT NULL REFERENCES agents(id),
    state TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_commands_agent ON commands(agent_id, started_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_one_open_command
    ON commands(agent_id) WHERE state != 'complete';

CREATE TABLE IF NOT EXISTS turns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    command_id INTEGER NOT NULL REFERENCES commands(id),
    agent_id INTEGER NOT NULL REFERENCES agents(id),
    actor TEXT NOT NULL,
    intent TEXT NOT NULL,
    text TEXT NOT NULL,
    fingerprint TEXT,
    source TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    reconciled INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_turns_agent_time ON turns(agent_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_turns_command ON turns(command_id, timestamp);

CREATE TABLE IF NOT EXISTS advisory_locks (
    namespace INTEGER NOT NULL,
    key INTEGER NOT NULL,
    holder TEXT NOT NULL,
    pid INTEGER NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (namespace, key)
);
";

const AGENT_COLUMNS: &str = "id, session_id, cwd, pane_id, transcript_path, transcript_offset, \
     context_percent, registered_at, last_active_at, ended_at";
const COMMAND_COLUMNS: &str = "id, agent_id, state, started_at, completed_at";
const TURN_COLUMNS: &str = "id, command_id, agent_id, actor, intent, text, fingerprint, source, \
     timestamp, reconciled";

/// Open a connection with the pragmas every caller needs.
pub fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// A turn about to be persisted.
#[derive(Debug, Clone)]
pub struct NewTurn {
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

/// Unit-of-work connection to the shared database.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the database and ensure the schema exists. The
    /// parent directory must already exist (see [`crate::paths::ensure_parent`]).
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(db = %path.display(), "store opened");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── agents ──

    pub fn register_agent(&self, new: &NewAgent, now: DateTime<Utc>) -> rusqlite::Result<Agent> {
        self.conn.execute(
            "INSERT INTO agents (session_id, cwd, pane_id, transcript_path, registered_at, last_active_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                new.session_id,
                new.cwd,
                new.pane_id,
                new.transcript_path,
                to_millis(now),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.require_agent(id)
    }

    pub fn agent(&self, id: AgentId) -> rusqlite::Result<Option<Agent>> {
        self.conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
                params![id],
                agent_from_row,
            )
            .optional()
    }

    fn require_agent(&self, id: AgentId) -> rusqlite::Result<Agent> {
        self.conn.query_row(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
            params![id],
            agent_from_row,
        )
    }

    pub fn agent_by_session(&self, session_id: &str) -> rusqlite::Result<Option<Agent>> {
        self.conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE session_id = ?1"),
                params![session_id],
                agent_from_row,
            )
            .optional()
    }

    /// Most recently registered live agent in `cwd` that no session claimed yet.
    pub fn latest_unbound_agent(&self, cwd: &str) -> rusqlite::Result<Option<Agent>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {AGENT_COLUMNS} FROM agents
                     WHERE cwd = ?1 AND session_id IS NULL AND ended_at IS NULL
                     ORDER BY registered_at DESC, id DESC LIMIT 1"
                ),
                params![cwd],
                agent_from_row,
            )
            .optional()
    }

    /// Bind a session id to an agent that has none. Returns false if another
    /// caller bound it first.
    pub fn bind_session(&self, id: AgentId, session_id: &str) -> rusqlite::Result<bool> {
        let changed = self.conn.execute(
            "UPDATE agents SET session_id = ?2 WHERE id = ?1 AND session_id IS NULL",
            params![id, session_id],
        )?;
        Ok(changed == 1)
    }

    pub fn active_agents(&self) -> rusqlite::Result<Vec<Agent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE ended_at IS NULL ORDER BY id"
        ))?;
        let rows = stmt.query_map([], agent_from_row)?;
        rows.collect()
    }

    pub fn all_agents(&self) -> rusqlite::Result<Vec<Agent>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY id"))?;
        let rows = stmt.query_map([], agent_from_row)?;
        rows.collect()
    }

    pub fn touch_agent(&self, id: AgentId, now: DateTime<Utc>) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE agents SET last_active_at = MAX(last_active_at, ?2) WHERE id = ?1",
            params![id, to_millis(now)],
        )?;
        Ok(())
    }

    pub fn set_pane(&self, id: AgentId, pane_id: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE agents SET pane_id = ?2 WHERE id = ?1",
            params![id, pane_id],
        )?;
        Ok(())
    }

    /// Point the agent at a transcript file. Changing the path rewinds the
    /// stored offset; setting the same path again is a no-op.
    pub fn set_transcript_path(&self, id: AgentId, path: &str) -> rusqlite::Result<bool> {
        let changed = self.conn.execute(
            "UPDATE agents SET transcript_path = ?2, transcript_offset = 0
             WHERE id = ?1 AND (transcript_path IS NULL OR transcript_path != ?2)",
            params![id, path],
        )?;
        Ok(changed == 1)
    }

    pub fn set_transcript_offset(&self, id: AgentId, offset: u64) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE agents SET transcript_offset = ?2 WHERE id = ?1",
            params![id, offset_to_sql(offset)],
        )?;
        Ok(())
    }

    pub fn set_context_percent(&self, id: AgentId, percent: u8) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE agents SET context_percent = ?2 WHERE id = ?1",
            params![id, i64::from(percent)],
        )?;
        Ok(())
    }

    pub fn end_agent(&self, id: AgentId, now: DateTime<Utc>) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE agents SET ended_at = ?2 WHERE id = ?1 AND ended_at IS NULL",
            params![id, to_millis(now)],
        )?;
        Ok(())
    }

    /// Re-activate an ended agent (session resumed). The transcript is read
    /// again from the start; already-seen entries reconcile as duplicates.
    pub fn reactivate_agent(&self, id: AgentId, now: DateTime<Utc>) -> rusqlite::Result<bool> {
        let changed = self.conn.execute(
            "UPDATE agents SET ended_at = NULL, transcript_offset = 0, last_active_at = ?2
             WHERE id = ?1 AND ended_at IS NOT NULL",
            params![id, to_millis(now)],
        )?;
        Ok(changed == 1)
    }

    // ── commands ──

    pub fn open_command(&self, agent_id: AgentId) -> rusqlite::Result<Option<Command>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {COMMAND_COLUMNS} FROM commands
                     WHERE agent_id = ?1 AND state != 'complete'"
                ),
                params![agent_id],
                command_from_row,
            )
            .optional()
    }

    pub fn latest_command(&self, agent_id: AgentId) -> rusqlite::Result<Option<Command>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {COMMAND_COLUMNS} FROM commands
                     WHERE agent_id = ?1 ORDER BY started_at DESC, id DESC LIMIT 1"
                ),
                params![agent_id],
                command_from_row,
            )
            .optional()
    }

    pub fn command(&self, id: CommandId) -> rusqlite::Result<Option<Command>> {
        self.conn
            .query_row(
                &format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?1"),
                params![id],
                command_from_row,
            )
            .optional()
    }

    pub fn commands_for_agent(&self, agent_id: AgentId) -> rusqlite::Result<Vec<Command>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COMMAND_COLUMNS} FROM commands WHERE agent_id = ?1 ORDER BY started_at, id"
        ))?;
        let rows = stmt.query_map(params![agent_id], command_from_row)?;
        rows.collect()
    }

    /// Create a command. Fails with a constraint violation if the agent
    /// already has an open one.
    pub fn create_command(
        &self,
        agent_id: AgentId,
        state: CommandState,
        now: DateTime<Utc>,
    ) -> rusqlite::Result<Command> {
        let completed_at = state.is_terminal().then(|| to_millis(now));
        self.conn.execute(
            "INSERT INTO commands (agent_id, state, started_at, completed_at) VALUES (?1, ?2, ?3, ?4)",
            params![agent_id, state, to_millis(now), completed_at],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(Command {
            id,
            agent_id,
            state,
            started_at: from_millis(to_millis(now)),
            completed_at: completed_at.map(from_millis),
        })
    }

    pub fn set_command_state(
        &self,
        id: CommandId,
        state: CommandState,
        now: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        let completed_at = state.is_terminal().then(|| to_millis(now));
        self.conn.execute(
            "UPDATE commands SET state = ?2, completed_at = ?3 WHERE id = ?1",
            params![id, state, completed_at],
        )?;
        Ok(())
    }

    // ── turns ──

    pub fn insert_turn(&self, turn: &NewTurn) -> rusqlite::Result<Turn> {
        self.conn.execute(
            "INSERT INTO turns (command_id, agent_id, actor, intent, text, fingerprint, source, timestamp, reconciled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                turn.command_id,
                turn.agent_id,
                turn.actor,
                turn.intent,
                turn.text,
                turn.fingerprint,
                turn.source,
                to_millis(turn.timestamp),
                turn.reconciled,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.turn(id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    pub fn turn(&self, id: TurnId) -> rusqlite::Result<Option<Turn>> {
        self.conn
            .query_row(
                &format!("SELECT {TURN_COLUMNS} FROM turns WHERE id = ?1"),
                params![id],
                turn_from_row,
            )
            .optional()
    }

    pub fn turns_for_command(&self, command_id: CommandId) -> rusqlite::Result<Vec<Turn>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TURN_COLUMNS} FROM turns WHERE command_id = ?1 ORDER BY timestamp, id"
        ))?;
        let rows = stmt.query_map(params![command_id], turn_from_row)?;
        rows.collect()
    }

    pub fn turns_for_agent(&self, agent_id: AgentId) -> rusqlite::Result<Vec<Turn>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TURN_COLUMNS} FROM turns WHERE agent_id = ?1 ORDER BY timestamp, id"
        ))?;
        let rows = stmt.query_map(params![agent_id], turn_from_row)?;
        rows.collect()
    }

    /// Oldest unreconciled turn with this fingerprint inside `[from, to]`.
    pub fn find_unreconciled_match(
        &self,
        agent_id: AgentId,
        actor: Actor,
        fingerprint: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> rusqlite::Result<Option<Turn>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {TURN_COLUMNS} FROM turns
                     WHERE agent_id = ?1 AND actor = ?2 AND fingerprint = ?3
                       AND reconciled = 0 AND timestamp BETWEEN ?4 AND ?5
                     ORDER BY timestamp, id LIMIT 1"
                ),
                params![agent_id, actor, fingerprint, to_millis(from), to_millis(to)],
                turn_from_row,
            )
            .optional()
    }

    /// True if a reconciled turn with this fingerprint already sits at `ts`.
    /// Re-reading a transcript from the start hits these.
    pub fn reconciled_turn_exists(
        &self,
        agent_id: AgentId,
        actor: Actor,
        fingerprint: &str,
        ts: DateTime<Utc>,
    ) -> rusqlite::Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM turns
                 WHERE agent_id = ?1 AND actor = ?2 AND fingerprint = ?3
                   AND reconciled = 1 AND timestamp = ?4
                 LIMIT 1",
                params![agent_id, actor, fingerprint, to_millis(ts)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Oldest transcript-created turn with this fingerprint inside
    /// `[from, to]` that no hook has claimed yet. Claiming relabels it as
    /// hook-observed, so each transcript turn pairs with at most one hook.
    pub fn claim_transcript_turn(
        &self,
        agent_id: AgentId,
        actor: Actor,
        fingerprint: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> rusqlite::Result<Option<Turn>> {
        let found = self
            .conn
            .query_row(
                &format!(
                    "SELECT {TURN_COLUMNS} FROM turns
                     WHERE agent_id = ?1 AND actor = ?2 AND fingerprint = ?3
                       AND source = ?4 AND timestamp BETWEEN ?5 AND ?6
                     ORDER BY timestamp, id LIMIT 1"
                ),
                params![
                    agent_id,
                    actor,
                    fingerprint,
                    TurnSource::Transcript,
                    to_millis(from),
                    to_millis(to)
                ],
                turn_from_row,
            )
            .optional()?;
        let Some(turn) = found else {
            return Ok(None);
        };
        self.conn.execute(
            "UPDATE turns SET source = ?2 WHERE id = ?1",
            params![turn.id, TurnSource::Hook],
        )?;
        self.turn(turn.id)
    }

    /// Overwrite the intent of a claimed turn with the hook's reading.
    pub fn set_turn_intent(&self, id: TurnId, intent: Intent) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE turns SET intent = ?2 WHERE id = ?1",
            params![id, intent],
        )?;
        Ok(())
    }

    /// Replace a hook turn's timestamp with the transcript's and mark it
    /// reconciled.
    pub fn correct_turn_timestamp(&self, id: TurnId, ts: DateTime<Utc>) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE turns SET timestamp = ?2, reconciled = 1 WHERE id = ?1",
            params![id, to_millis(ts)],
        )?;
        Ok(())
    }
}

fn offset_to_sql(offset: u64) -> i64 {
    i64::try_from(offset).unwrap_or(i64::MAX)
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let offset: i64 = row.get(5)?;
    let context: Option<i64> = row.get(6)?;
    Ok(Agent {
        id: row.get(0)?,
        session_id: row.get(1)?,
        cwd: row.get(2)?,
        pane_id: row.get(3)?,
        transcript_path: row.get(4)?,
        transcript_offset: u64::try_from(offset).unwrap_or(0),
        context_percent: context.and_then(|c| u8::try_from(c).ok()),
        registered_at: from_millis(row.get(7)?),
        last_active_at: from_millis(row.get(8)?),
        ended_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
    })
}

fn command_from_row(row: &Row<'_>) -> rusqlite::Result<Command> {
    Ok(Command {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        state: row.get(2)?,
        started_at: from_millis(row.get(3)?),
        completed_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
    })
}

fn turn_from_row(row: &Row<'_>) -> rusqlite::Result<Turn> {
    Ok(Turn {
        id: row.get(0)?,
        command_id: row.get(1)?,
        agent_id: row.get(2)?,
        actor: row.get(3)?,
        intent: row.get(4)?,
        text: row.get(5)?,
        fingerprint: row.get(6)?,
        source: row.get(7)?,
        timestamp: from_millis(row.get(8)?),
        reconciled: row.get(9)?,
    })
}
