//! Transcript reconciler.
//!
//! Hooks are fast but lossy. The transcript is slow but complete. Each pass
//! reads every agent's transcript from its persisted offset and, for every
//! conversational entry:
//!
//! - skips it if an identical reconciled turn already exists (a re-read)
//! - otherwise corrects the timestamp of the matching hook turn, if one
//!   exists inside the match window
//! - otherwise classifies it and records it as a new turn
//!
//! The offset is saved after each entry so a crash mid-pass re-reads at most
//! one line. Locks are only tried, never waited for: a busy agent is picked
//! up on the next pass.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::intent;
use crate::lifecycle::{Lifecycle, ObservedTurn};
use crate::lock::{LockKey, LockManager};
use crate::log::{ActivityLog, LogEvent};
use crate::model::{Actor, Agent, AgentId};
use crate::store::Store;
use crate::text;
use crate::transcript::{TranscriptEntry, TranscriptReader};

/// Counts for one pass over all agents.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub agents: usize,
    pub busy: usize,
    pub failed: usize,
    pub matched: usize,
    pub created: usize,
    pub duplicates: usize,
}

/// Counts for one agent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AgentReport {
    pub matched: usize,
    pub created: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

pub struct Reconciler<'a> {
    store: &'a Store,
    locks: &'a LockManager,
    match_window: chrono::Duration,
    journal: Option<&'a ActivityLog>,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a Store, locks: &'a LockManager, match_window: chrono::Duration) -> Self {
        Self {
            store,
            locks,
            match_window,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: &'a ActivityLog) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Reconcile every agent that is live or ended recently enough for late
    /// transcript lines to matter.
    pub fn run_pass(&self) -> Result<PassReport> {
        let cutoff = Utc::now() - self.match_window;
        let agents = self
            .store
            .all_agents()
            .context("failed to list agents")?
            .into_iter()
            .filter(|a| a.transcript_path.is_some())
            .filter(|a| a.ended_at.is_none_or(|ended| ended >= cutoff));

        let mut report = PassReport::default();
        for agent in agents {
            report.agents += 1;
            let guard = match self.locks.try_acquire(LockKey::agent(agent.id)) {
                Ok(Some(guard)) => guard,
                Ok(None) => {
                    report.busy += 1;
                    continue;
                }
                Err(e) => {
                    warn!(agent_id = agent.id, error = %e, "reconciler lock failed");
                    report.failed += 1;
                    continue;
                }
            };
            match self.reconcile_agent(agent.id) {
                Ok(counts) => {
                    report.matched += counts.matched;
                    report.created += counts.created;
                    report.duplicates += counts.duplicates;
                }
                Err(e) => {
                    warn!(agent_id = agent.id, error = %format!("{e:#}"), "reconcile failed");
                    report.failed += 1;
                }
            }
            drop(guard);
        }

        if report.matched + report.created > 0 {
            info!(
                agents = report.agents,
                matched = report.matched,
                created = report.created,
                busy = report.busy,
                "reconcile pass"
            );
        }
        Ok(report)
    }

    /// Reconcile one agent. The caller must hold the agent's lock.
    pub fn reconcile_agent(&self, agent_id: AgentId) -> Result<AgentReport> {
        let mut report = AgentReport::default();
        let Some(agent) = self.store.agent(agent_id)? else {
            return Ok(report);
        };
        let Some(path) = agent.transcript_path.as_deref() else {
            return Ok(report);
        };

        let mut reader = TranscriptReader::new(Path::new(path), agent.transcript_offset);
        let batch = reader.read()?;
        let lifecycle = Lifecycle::new(self.store, self.match_window);

        for entry in &batch.entries {
            self.reconcile_entry(&lifecycle, &agent, entry, &mut report)?;
            self.store.set_transcript_offset(agent.id, entry.end_offset)?;
        }
        if batch.next_offset != agent.transcript_offset {
            self.store.set_transcript_offset(agent.id, batch.next_offset)?;
        }

        debug!(
            agent_id,
            offset = batch.next_offset,
            matched = report.matched,
            created = report.created,
            "agent reconciled"
        );
        Ok(report)
    }

    fn reconcile_entry(
        &self,
        lifecycle: &Lifecycle<'_>,
        agent: &Agent,
        entry: &TranscriptEntry,
        report: &mut AgentReport,
    ) -> Result<()> {
        let Some(fingerprint) = text::fingerprint(&entry.text) else {
            report.skipped += 1;
            return Ok(());
        };
        let ts = entry.timestamp.unwrap_or_else(Utc::now);

        if self
            .store
            .reconciled_turn_exists(agent.id, entry.actor, &fingerprint, ts)?
        {
            report.duplicates += 1;
            return Ok(());
        }

        let window_start = ts - self.match_window;
        let window_end = ts + self.match_window;
        if let Some(turn) = self.store.find_unreconciled_match(
            agent.id,
            entry.actor,
            &fingerprint,
            window_start,
            window_end,
        )? {
            self.store.correct_turn_timestamp(turn.id, ts)?;
            report.matched += 1;
            if let Some(journal) = self.journal {
                journal.note(LogEvent::TurnReconciled {
                    agent_id: agent.id,
                    turn_id: turn.id,
                });
            }
            return Ok(());
        }

        let intent = match entry.actor {
            Actor::Operator => {
                let open = self.store.open_command(agent.id)?;
                intent::operator_intent(open.map(|c| c.state))
            }
            Actor::Agent => intent::classify_agent_text(&entry.text),
        };
        let observed = ObservedTurn::from_transcript(entry.actor, intent, entry.text.clone(), ts);
        let outcome = lifecycle.record_turn(agent.id, &observed)?;
        info!(
            agent_id = agent.id,
            turn_id = outcome.turn.id,
            actor = %entry.actor,
            intent = %intent,
            "recovered turn missed by hooks"
        );
        if let Some(journal) = self.journal {
            journal.note_outcome(&outcome);
        }
        report.created += 1;
        Ok(())
    }
}

/// Run reconcile passes until `stop` is set.
pub fn run_loop(
    store: &Store,
    locks: &LockManager,
    match_window: chrono::Duration,
    journal: Option<&ActivityLog>,
    interval: Duration,
    stop: Arc<AtomicBool>,
) {
    let mut reconciler = Reconciler::new(store, locks, match_window);
    if let Some(journal) = journal {
        reconciler = reconciler.with_journal(journal);
    }
    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = reconciler.run_pass() {
            warn!(error = %format!("{e:#}"), "reconcile pass failed");
        }
        crate::runtime::sleep_unless_stopped(interval, &stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Transition;
    use crate::lock::LockSettings;
    use crate::model::{CommandState, Intent, NewAgent, TurnSource};
    use crate::store::tests::temp_store;
    use std::io::Write;

    struct Fixture {
        tmp: tempfile::TempDir,
        store: Store,
        locks: LockManager,
        agent: AgentId,
    }

    impl Fixture {
        fn new() -> Self {
            let (tmp, store) = temp_store();
            let locks = LockManager::open(store.path(), LockSettings::default()).unwrap();
            let transcript = tmp.path().join("t.jsonl");
            std::fs::write(&transcript, "").unwrap();
            let agent = store
                .register_agent(
                    &NewAgent {
                        cwd: "/repo".to_string(),
                        session_id: Some("s-1".to_string()),
                        transcript_path: Some(transcript.to_string_lossy().to_string()),
                        ..Default::default()
                    },
                    Utc::now(),
                )
                .unwrap()
                .id;
            Self {
                tmp,
                store,
                locks,
                agent,
            }
        }

        fn reconciler(&self) -> Reconciler<'_> {
            Reconciler::new(&self.store, &self.locks, chrono::Duration::seconds(120))
        }

        fn append(&self, kind: &str, text: &str, ts: chrono::DateTime<Utc>) {
            let line = serde_json::json!({
                "type": kind,
                "message": {"content": text},
                "timestamp": ts.to_rfc3339(),
            });
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(self.tmp.path().join("t.jsonl"))
                .unwrap();
            writeln!(f, "{line}").unwrap();
        }

        fn hook_turn(&self, actor: Actor, intent: Intent, text: &str) {
            Lifecycle::new(&self.store, chrono::Duration::seconds(120))
                .record_turn(self.agent, &ObservedTurn::from_hook(actor, intent, text))
                .unwrap();
        }
    }

    #[test]
    fn matching_hook_turn_gets_transcript_timestamp() {
        let fx = Fixture::new();
        fx.hook_turn(Actor::Operator, Intent::Command, "fix the bug");
        let ts = Utc::now() - chrono::Duration::seconds(3);
        fx.append("user", "fix   the bug", ts);

        let report = fx.reconciler().run_pass().unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(report.created, 0);

        let turns = fx.store.turns_for_agent(fx.agent).unwrap();
        assert_eq!(turns.len(), 1);
        assert!(turns[0].reconciled);
        assert_eq!(turns[0].source, TurnSource::Hook);
        assert_eq!(turns[0].timestamp.timestamp(), ts.timestamp());
    }

    #[test]
    fn missed_turns_are_created_through_lifecycle() {
        let fx = Fixture::new();
        let t0 = Utc::now() - chrono::Duration::seconds(10);
        fx.append("user", "add a test", t0);
        fx.append("assistant", "Which module should it cover?", t0 + chrono::Duration::seconds(2));

        let report = fx.reconciler().run_pass().unwrap();
        assert_eq!(report.created, 2);

        let command = fx.store.latest_command(fx.agent).unwrap().unwrap();
        assert_eq!(command.state, CommandState::AwaitingInput);
        let turns = fx.store.turns_for_command(command.id).unwrap();
        assert!(turns.iter().all(|t| t.reconciled && t.source == TurnSource::Transcript));
    }

    #[test]
    fn reconciliation_is_idempotent_across_rewinds() {
        let fx = Fixture::new();
        let t0 = Utc::now() - chrono::Duration::seconds(10);
        fx.hook_turn(Actor::Operator, Intent::Command, "run the suite");
        fx.append("user", "run the suite", t0);
        fx.append("assistant", "All tests are passing.", t0 + chrono::Duration::seconds(1));

        fx.reconciler().run_pass().unwrap();
        let before = fx.store.turns_for_agent(fx.agent).unwrap();

        fx.store.set_transcript_offset(fx.agent, 0).unwrap();
        let report = fx.reconciler().run_pass().unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.matched, 0);
        assert_eq!(report.duplicates, 2);
        assert_eq!(fx.store.turns_for_agent(fx.agent).unwrap(), before);
    }

    #[test]
    fn offset_is_persisted() {
        let fx = Fixture::new();
        fx.append("user", "hello", Utc::now());
        fx.reconciler().run_pass().unwrap();
        let len = std::fs::metadata(fx.tmp.path().join("t.jsonl")).unwrap().len();
        assert_eq!(fx.store.agent(fx.agent).unwrap().unwrap().transcript_offset, len);
    }

    #[test]
    fn busy_agent_is_skipped() {
        let fx = Fixture::new();
        fx.append("user", "hello", Utc::now());

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let db = fx.store.path().to_path_buf();
        let agent = fx.agent;
        let holder = std::thread::spawn(move || {
            let locks = LockManager::open(&db, LockSettings::default()).unwrap();
            let _guard = locks.try_acquire(LockKey::agent(agent)).unwrap().unwrap();
            held_tx.send(()).unwrap();
            done_rx.recv().unwrap();
        });
        held_rx.recv().unwrap();

        let report = fx.reconciler().run_pass().unwrap();
        assert_eq!(report.busy, 1);
        assert_eq!(fx.store.agent(fx.agent).unwrap().unwrap().transcript_offset, 0);

        done_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(fx.reconciler().run_pass().unwrap().created, 1);
    }

    #[test]
    fn late_agent_line_attaches_to_completed_command() {
        let fx = Fixture::new();
        fx.hook_turn(Actor::Operator, Intent::Command, "ship");
        fx.hook_turn(Actor::Agent, Intent::Completion, "Shipped.");
        let done = fx.store.latest_command(fx.agent).unwrap().unwrap();
        assert_eq!(done.state, CommandState::Complete);

        fx.append("assistant", "Also bumped the version.", Utc::now());
        fx.reconciler().run_pass().unwrap();

        assert!(fx.store.open_command(fx.agent).unwrap().is_none());
        let turns = fx.store.turns_for_command(done.id).unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(fx.store.commands_for_agent(fx.agent).unwrap().len(), 1);
    }

    #[test]
    fn rejected_transition_from_transcript_keeps_turn() {
        let fx = Fixture::new();
        fx.hook_turn(Actor::Operator, Intent::Command, "pick one");
        fx.hook_turn(Actor::Agent, Intent::Question, "A or B?");
        fx.append("assistant", "Still need: A or B, which?", Utc::now());

        let lifecycle = Lifecycle::new(&fx.store, chrono::Duration::seconds(120));
        let outcome = lifecycle
            .record_turn(
                fx.agent,
                &ObservedTurn::from_transcript(Actor::Agent, Intent::Question, "again?", Utc::now()),
            )
            .unwrap();
        assert!(matches!(outcome.transition, Transition::Rejected(_)));

        fx.reconciler().run_pass().unwrap();
        let command = fx.store.latest_command(fx.agent).unwrap().unwrap();
        assert_eq!(command.state, CommandState::AwaitingInput);
        assert_eq!(fx.store.turns_for_command(command.id).unwrap().len(), 4);
    }
}
