//! Hook handling: correlate, lock, persist, transition.
//!
//! Every hook follows the same sequence. The agent is resolved from the
//! payload's session id and working directory, then the agent's advisory
//! lock is taken with a bounded blocking wait. Under the lock the turn is
//! persisted and only then is the command transitioned. The lock guard is
//! dropped on every path.
//!
//! [`HookReceiver::handle`] never fails. Whatever goes wrong is written to
//! tracing and the activity log, and the agent is told to continue.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{
    HookError, HookEvent, HookKind, HookPayload, HookResponse, interactive_prompt_text,
    is_interactive_tool,
};
use crate::correlator::{self, HookIdentity, Resolution};
use crate::intent;
use crate::lifecycle::{Lifecycle, ObservedTurn, TurnOutcome};
use crate::lock::{LockError, LockKey, LockManager};
use crate::log::{ActivityLog, LogEvent};
use crate::model::{Actor, Agent, AgentId, CommandState, Intent};
use crate::store::Store;
use crate::transcript;

/// What a hook did to the agent's records.
#[derive(Debug, Clone)]
pub enum HookOutcome {
    Started { reactivated: bool },
    Recorded(TurnOutcome),
    Touched,
    Ended(Option<TurnOutcome>),
}

#[derive(Debug, Clone)]
pub struct HookReport {
    pub agent_id: AgentId,
    pub resolution: Resolution,
    pub outcome: HookOutcome,
}

pub struct HookReceiver<'a> {
    store: &'a Store,
    locks: &'a LockManager,
    lock_timeout: Duration,
    match_window: chrono::Duration,
    journal: Option<&'a ActivityLog>,
}

impl<'a> HookReceiver<'a> {
    pub fn new(
        store: &'a Store,
        locks: &'a LockManager,
        lock_timeout: Duration,
        match_window: chrono::Duration,
    ) -> Self {
        Self {
            store,
            locks,
            lock_timeout,
            match_window,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: &'a ActivityLog) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Entry point for `tether hook <event>`. Always reports success.
    pub fn handle(&self, kind: HookKind, json: &str, pane_id: Option<String>) -> HookResponse {
        let result = HookPayload::parse(kind, json, pane_id).and_then(|payload| self.process(&payload));
        match result {
            Ok(report) => {
                debug!(hook = %kind, agent_id = report.agent_id, "hook handled");
            }
            Err(e) => {
                warn!(hook = %kind, error = %e, "hook failed");
                self.note(LogEvent::HookFailed {
                    hook: kind.to_string(),
                    error: e.to_string(),
                });
            }
        }
        HookResponse::ok()
    }

    /// Apply a validated hook.
    pub fn process(&self, payload: &HookPayload) -> Result<HookReport, HookError> {
        let ctx = &payload.context;
        let kind = payload.event.kind();
        let now = Utc::now();

        let resolved = correlator::resolve(
            self.store,
            HookIdentity {
                session_id: &ctx.session_id,
                cwd: &ctx.cwd,
                pane_id: ctx.pane_id.as_deref(),
                transcript_path: ctx.transcript_path.as_deref(),
            },
            now,
        )?;
        let agent = resolved.agent;
        if resolved.via == Resolution::Created {
            self.note(LogEvent::AgentRegistered {
                agent_id: agent.id,
                cwd: agent.cwd.clone(),
            });
        }
        self.note(LogEvent::HookReceived {
            hook: kind.to_string(),
            session_id: ctx.session_id.clone(),
            agent_id: Some(agent.id),
        });

        let _guard = match self.locks.acquire(LockKey::agent(agent.id), self.lock_timeout) {
            Ok(guard) => guard,
            Err(e) => {
                if matches!(e, LockError::Timeout { .. }) {
                    self.note(LogEvent::LockTimeout {
                        agent_id: agent.id,
                        context: format!("hook {kind}"),
                    });
                }
                return Err(e.into());
            }
        };

        self.refresh_location(&agent, ctx.pane_id.as_deref(), ctx.transcript_path.as_deref())?;
        let lifecycle = Lifecycle::new(self.store, self.match_window);
        let outcome = self.dispatch(&lifecycle, &agent, &payload.event, ctx.transcript_path.as_deref())?;

        match &outcome {
            HookOutcome::Recorded(turn) | HookOutcome::Ended(Some(turn)) => {
                if let Some(journal) = self.journal {
                    journal.note_outcome(turn);
                }
            }
            _ => {}
        }
        if let HookOutcome::Ended(_) = outcome {
            self.note(LogEvent::AgentEnded {
                agent_id: agent.id,
                reason: "session ended".to_string(),
            });
        }

        Ok(HookReport {
            agent_id: agent.id,
            resolution: resolved.via,
            outcome,
        })
    }

    fn dispatch(
        &self,
        lifecycle: &Lifecycle<'_>,
        agent: &Agent,
        event: &HookEvent,
        transcript_path: Option<&str>,
    ) -> Result<HookOutcome, HookError> {
        let now = Utc::now();
        match event {
            HookEvent::SessionStart { source } => {
                let reactivated = !agent.is_active() && self.store.reactivate_agent(agent.id, now)?;
                if reactivated {
                    info!(agent_id = agent.id, source = ?source, "agent re-registered");
                }
                self.store.touch_agent(agent.id, now)?;
                Ok(HookOutcome::Started { reactivated })
            }

            HookEvent::UserPromptSubmit { prompt } => {
                let open = self.store.open_command(agent.id)?;
                let intent = intent::operator_intent(open.map(|c| c.state));
                let observed = ObservedTurn::from_hook(Actor::Operator, intent, prompt.clone());
                Ok(HookOutcome::Recorded(lifecycle.record_turn(agent.id, &observed)?))
            }

            HookEvent::Stop { last_message } => {
                let text = match last_message {
                    Some(text) => text.clone(),
                    None => self.transcript_tail(agent, transcript_path)?,
                };
                let intent = intent::classify_stop_text(&text);
                let observed = ObservedTurn::from_hook(Actor::Agent, intent, text);
                Ok(HookOutcome::Recorded(lifecycle.record_turn(agent.id, &observed)?))
            }

            HookEvent::Notification { kind, message } => {
                if kind.asks_operator() {
                    let observed =
                        ObservedTurn::from_hook(Actor::Agent, Intent::Question, message.clone());
                    Ok(HookOutcome::Recorded(lifecycle.record_turn(agent.id, &observed)?))
                } else {
                    self.store.touch_agent(agent.id, now)?;
                    Ok(HookOutcome::Touched)
                }
            }

            HookEvent::PreToolUse {
                tool_name,
                tool_input,
            } => {
                if is_interactive_tool(tool_name) {
                    let text = interactive_prompt_text(tool_name, tool_input.as_ref());
                    let observed = ObservedTurn::from_hook(Actor::Agent, Intent::Question, text);
                    Ok(HookOutcome::Recorded(lifecycle.record_turn(agent.id, &observed)?))
                } else {
                    self.store.touch_agent(agent.id, now)?;
                    Ok(HookOutcome::Touched)
                }
            }

            HookEvent::PostToolUse { tool_name } => {
                let awaiting = self
                    .store
                    .open_command(agent.id)?
                    .is_some_and(|c| c.state == CommandState::AwaitingInput);
                if awaiting {
                    debug!(agent_id = agent.id, tool = %tool_name, "tool ran after question; resuming");
                    let observed = ObservedTurn::from_hook(Actor::Agent, Intent::Progress, "");
                    Ok(HookOutcome::Recorded(lifecycle.record_turn(agent.id, &observed)?))
                } else {
                    self.store.touch_agent(agent.id, now)?;
                    Ok(HookOutcome::Touched)
                }
            }

            HookEvent::SessionEnd { reason } => {
                let reason = reason.as_deref().unwrap_or("session ended");
                Ok(HookOutcome::Ended(lifecycle.end_session(agent.id, reason, now)?))
            }
        }
    }

    fn refresh_location(
        &self,
        agent: &Agent,
        pane_id: Option<&str>,
        transcript_path: Option<&str>,
    ) -> Result<(), HookError> {
        if let Some(path) = transcript_path {
            if self.store.set_transcript_path(agent.id, path)? {
                debug!(agent_id = agent.id, path, "transcript path updated");
            }
        }
        if let Some(pane) = pane_id {
            if agent.pane_id.as_deref() != Some(pane) {
                self.store.set_pane(agent.id, pane)?;
                debug!(agent_id = agent.id, pane, "pane updated");
            }
        }
        Ok(())
    }

    fn transcript_tail(&self, agent: &Agent, from_hook: Option<&str>) -> Result<String, HookError> {
        let path = from_hook.or(agent.transcript_path.as_deref());
        let Some(path) = path else {
            return Ok(String::new());
        };
        let text = transcript::last_agent_text(Path::new(path)).map_err(HookError::Transcript)?;
        Ok(text.unwrap_or_default())
    }

    fn note(&self, event: LogEvent) {
        if let Some(journal) = self.journal {
            journal.note(event);
        }
    }
}
