//! Applies the command state machine to persisted commands and turns.
//!
//! Callers must hold the agent's advisory lock. The turn is always written
//! before the transition is attempted, so a rejected transition never loses
//! the message that triggered it.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::model::{Actor, AgentId, Command, CommandState, Intent, Turn, TurnSource};
use crate::state_machine::{self, InvalidTransition};
use crate::store::{NewTurn, Store};
use crate::text;

/// A message observed on one of the signal channels.
#[derive(Debug, Clone)]
pub struct ObservedTurn {
    pub actor: Actor,
    pub intent: Intent,
    pub text: String,
    pub source: TurnSource,
    pub timestamp: DateTime<Utc>,
    pub reconciled: bool,
}

impl ObservedTurn {
    pub fn from_hook(actor: Actor, intent: Intent, text: impl Into<String>) -> Self {
        Self {
            actor,
            intent,
            text: text.into(),
            source: TurnSource::Hook,
            timestamp: Utc::now(),
            reconciled: false,
        }
    }

    pub fn from_transcript(
        actor: Actor,
        intent: Intent,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            actor,
            intent,
            text: text.into(),
            source: TurnSource::Transcript,
            timestamp,
            reconciled: true,
        }
    }
}

/// What happened to the command when a turn was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// States visited, starting with the state before the turn.
    Applied { path: Vec<CommandState> },
    /// No table entry; the turn is kept and the command is unchanged.
    Rejected(InvalidTransition),
    /// A late agent message joined an already completed command.
    Attached,
    /// The reconciler already persisted this message; no new turn was
    /// written and the command is unchanged.
    AlreadyRecorded,
}

impl Transition {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub turn: Turn,
    pub command: Command,
    pub transition: Transition,
}

pub struct Lifecycle<'a> {
    store: &'a Store,
    match_window: Duration,
}

impl<'a> Lifecycle<'a> {
    pub fn new(store: &'a Store, match_window: Duration) -> Self {
        Self {
            store,
            match_window,
        }
    }

    /// Persist `observed` against the agent's current command and drive the
    /// state machine.
    pub fn record_turn(
        &self,
        agent_id: AgentId,
        observed: &ObservedTurn,
    ) -> rusqlite::Result<TurnOutcome> {
        if let Some(outcome) = self.claim_reconciled(agent_id, observed)? {
            return Ok(outcome);
        }

        let mut intent = observed.intent;
        let command = match self.store.open_command(agent_id)? {
            Some(open) => open,
            None => match observed.actor {
                Actor::Operator => {
                    // Nothing is awaiting an answer, so this starts new work.
                    intent = Intent::Command;
                    self.store
                        .create_command(agent_id, CommandState::Idle, observed.timestamp)?
                }
                Actor::Agent => {
                    if let Some(done) = self.recently_completed(agent_id, observed.timestamp)? {
                        let turn = self.insert(agent_id, &done, observed, intent)?;
                        self.store.touch_agent(agent_id, observed.timestamp)?;
                        debug!(
                            agent_id,
                            command_id = done.id,
                            intent = %intent,
                            "late agent turn attached to completed command"
                        );
                        return Ok(TurnOutcome {
                            turn,
                            command: done,
                            transition: Transition::Attached,
                        });
                    }
                    // The operator's prompt was never observed; infer the work.
                    info!(agent_id, "agent activity without a command; inferring one");
                    self.store.create_command(
                        agent_id,
                        CommandState::Processing,
                        observed.timestamp,
                    )?
                }
            },
        };

        let turn = self.insert(agent_id, &command, observed, intent)?;
        let transition = self.apply(&command, observed.actor, intent, observed.timestamp)?;
        self.store.touch_agent(agent_id, observed.timestamp)?;

        let command = self.store.command(command.id)?.unwrap_or(command);
        Ok(TurnOutcome {
            turn,
            command,
            transition,
        })
    }

    /// Close out an agent's session: an END_OF_WORK turn on the open command,
    /// if there is one, then the agent is marked ended.
    pub fn end_session(
        &self,
        agent_id: AgentId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> rusqlite::Result<Option<TurnOutcome>> {
        let outcome = if self.store.open_command(agent_id)?.is_some() {
            let observed = ObservedTurn {
                actor: Actor::Agent,
                intent: Intent::EndOfWork,
                text: reason.to_string(),
                source: TurnSource::Hook,
                timestamp: now,
                reconciled: false,
            };
            Some(self.record_turn(agent_id, &observed)?)
        } else {
            None
        };
        self.store.end_agent(agent_id, now)?;
        info!(agent_id, reason, "agent ended");
        Ok(outcome)
    }

    /// A hook for a message the reconciler already read from the transcript
    /// pairs with that turn instead of writing a second one. The hook's
    /// reading of an agent message wins: a stop that the transcript
    /// classified as progress still completes the command.
    fn claim_reconciled(
        &self,
        agent_id: AgentId,
        observed: &ObservedTurn,
    ) -> rusqlite::Result<Option<TurnOutcome>> {
        if observed.source != TurnSource::Hook || observed.reconciled {
            return Ok(None);
        }
        let Some(fingerprint) = text::fingerprint(&observed.text) else {
            return Ok(None);
        };
        let Some(existing) = self.store.claim_transcript_turn(
            agent_id,
            observed.actor,
            &fingerprint,
            observed.timestamp - self.match_window,
            observed.timestamp + self.match_window,
        )?
        else {
            return Ok(None);
        };
        let Some(command) = self.store.command(existing.command_id)? else {
            return Ok(None);
        };

        let reapply = observed.actor == Actor::Agent
            && existing.intent != observed.intent
            && !command.state.is_terminal();
        let (turn, transition) = if reapply {
            self.store.set_turn_intent(existing.id, observed.intent)?;
            let transition =
                self.apply(&command, observed.actor, observed.intent, observed.timestamp)?;
            let turn = self.store.turn(existing.id)?.unwrap_or(existing);
            (turn, transition)
        } else {
            (existing, Transition::AlreadyRecorded)
        };
        self.store.touch_agent(agent_id, observed.timestamp)?;
        debug!(
            agent_id,
            turn_id = turn.id,
            reapplied = reapply,
            "hook matched a turn recovered from the transcript"
        );

        let command = self.store.command(command.id)?.unwrap_or(command);
        Ok(Some(TurnOutcome {
            turn,
            command,
            transition,
        }))
    }

    fn recently_completed(
        &self,
        agent_id: AgentId,
        at: DateTime<Utc>,
    ) -> rusqlite::Result<Option<Command>> {
        let Some(latest) = self.store.latest_command(agent_id)? else {
            return Ok(None);
        };
        let Some(completed_at) = latest.completed_at else {
            return Ok(None);
        };
        let within = (at - completed_at).abs() <= self.match_window;
        Ok(within.then_some(latest))
    }

    fn insert(
        &self,
        agent_id: AgentId,
        command: &Command,
        observed: &ObservedTurn,
        intent: Intent,
    ) -> rusqlite::Result<Turn> {
        self.store.insert_turn(&NewTurn {
            command_id: command.id,
            agent_id,
            actor: observed.actor,
            intent,
            text: observed.text.clone(),
            fingerprint: text::fingerprint(&observed.text),
            source: observed.source,
            timestamp: observed.timestamp,
            reconciled: observed.reconciled,
        })
    }

    fn apply(
        &self,
        command: &Command,
        actor: Actor,
        intent: Intent,
        now: DateTime<Utc>,
    ) -> rusqlite::Result<Transition> {
        let from = command.state;
        let next = match state_machine::transition(from, actor, intent) {
            Ok(next) => next,
            Err(rejected) => {
                warn!(
                    agent_id = command.agent_id,
                    command_id = command.id,
                    error = %rejected,
                    "transition rejected; turn kept"
                );
                return Ok(Transition::Rejected(rejected));
            }
        };

        let mut path = vec![from, next];
        self.store.set_command_state(command.id, next, now)?;
        if let Some(advanced) = state_machine::immediate_successor(next) {
            self.store.set_command_state(command.id, advanced, now)?;
            path.push(advanced);
        }

        debug!(
            agent_id = command.agent_id,
            command_id = command.id,
            from = %from,
            to = %path[path.len() - 1],
            "command transitioned"
        );
        Ok(Transition::Applied { path })
    }
}
