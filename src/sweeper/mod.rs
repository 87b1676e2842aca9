//! Background sweeps over live agents.
//!
//! - reaper: ends agents with no activity for longer than the inactivity
//!   timeout
//! - watchdog: ends agents whose pane no longer exists
//! - context poller: reads the "N% context left" footer from each pane
//!
//! Sweeps only ever try the agent lock. A busy agent is skipped and looked
//! at again next cycle. Conditions are checked again once the lock is held,
//! since a hook may have touched the agent in between.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::bridge::BridgeError;
use crate::lifecycle::Lifecycle;
use crate::lock::{LockGuard, LockKey, LockManager};
use crate::log::{ActivityLog, LogEvent};
use crate::model::Agent;
use crate::store::Store;
use crate::tmux::Multiplexer;

static CONTEXT_LEFT: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)(\d{1,3})\s*%\s*(?:of\s+)?context\s+(?:left|remaining)").unwrap(),
        Regex::new(r"(?i)context\s+left\s+until\s+auto-compact:\s*(\d{1,3})\s*%").unwrap(),
    ]
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepKind {
    Reaper,
    Watchdog,
    Context,
}

impl SweepKind {
    pub const ALL: [SweepKind; 3] = [SweepKind::Reaper, SweepKind::Watchdog, SweepKind::Context];

    pub fn as_str(self) -> &'static str {
        match self {
            SweepKind::Reaper => "reaper",
            SweepKind::Watchdog => "watchdog",
            SweepKind::Context => "context",
        }
    }
}

impl std::fmt::Display for SweepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub inactivity_timeout: chrono::Duration,
    /// Agents younger than this are left alone by the watchdog.
    pub registration_grace: chrono::Duration,
    pub match_window: chrono::Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout: chrono::Duration::hours(6),
            registration_grace: chrono::Duration::minutes(5),
            match_window: chrono::Duration::minutes(2),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub busy: usize,
    pub failed: usize,
    pub ended: usize,
    pub updated: usize,
    /// The multiplexer could not be reached; the rest of the cycle was
    /// abandoned.
    pub unavailable: bool,
}

pub struct Sweeper<'a, M> {
    store: &'a Store,
    locks: &'a LockManager,
    mux: &'a M,
    settings: SweepSettings,
    journal: Option<&'a ActivityLog>,
}

impl<'a, M: Multiplexer> Sweeper<'a, M> {
    pub fn new(store: &'a Store, locks: &'a LockManager, mux: &'a M, settings: SweepSettings) -> Self {
        Self {
            store,
            locks,
            mux,
            settings,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: &'a ActivityLog) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn sweep(&self, kind: SweepKind, now: DateTime<Utc>) -> Result<SweepReport> {
        let report = match kind {
            SweepKind::Reaper => self.reap_inactive(now),
            SweepKind::Watchdog => self.watch_panes(now),
            SweepKind::Context => self.poll_context(),
        }?;
        if report.ended + report.updated > 0 || report.unavailable {
            info!(
                sweep = %kind,
                examined = report.examined,
                ended = report.ended,
                updated = report.updated,
                busy = report.busy,
                unavailable = report.unavailable,
                "sweep"
            );
        }
        Ok(report)
    }

    /// End agents idle past the inactivity timeout.
    pub fn reap_inactive(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for agent in self.active_agents()? {
            report.examined += 1;
            if !self.is_stale(&agent, now) {
                continue;
            }
            let Some(_guard) = self.try_lock(&agent, &mut report) else {
                continue;
            };
            // Re-read under the lock: a hook may have landed since the scan.
            match self.store.agent(agent.id) {
                Ok(Some(fresh)) if fresh.is_active() && self.is_stale(&fresh, now) => {
                    self.end(&fresh, "inactive", now, &mut report);
                }
                Ok(_) => debug!(agent_id = agent.id, "agent became active, not reaping"),
                Err(e) => {
                    warn!(agent_id = agent.id, error = %e, "reaper re-read failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// End agents whose pane has gone away.
    pub fn watch_panes(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for agent in self.active_agents()? {
            let Some(pane) = agent.pane_id.as_deref() else {
                continue;
            };
            if now - agent.registered_at < self.settings.registration_grace {
                continue;
            }
            report.examined += 1;

            match self.mux.pane_exists(pane) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    abandon_cycle(SweepKind::Watchdog, &e, &mut report);
                    break;
                }
            }

            let Some(_guard) = self.try_lock(&agent, &mut report) else {
                continue;
            };
            match self.store.agent(agent.id) {
                Ok(Some(fresh)) if fresh.is_active() && fresh.pane_id == agent.pane_id => {
                    info!(agent_id = agent.id, pane, "pane gone");
                    self.end(&fresh, "pane gone", now, &mut report);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(agent_id = agent.id, error = %e, "watchdog re-read failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Refresh each agent's context metric from its pane footer.
    pub fn poll_context(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for agent in self.active_agents()? {
            let Some(pane) = agent.pane_id.as_deref() else {
                continue;
            };
            report.examined += 1;

            let screen = match self.mux.capture(pane, false) {
                Ok(screen) => screen,
                Err(BridgeError::Failed { stderr, .. }) => {
                    // A single dead pane is the watchdog's business.
                    debug!(agent_id = agent.id, pane, stderr = %stderr, "capture failed");
                    continue;
                }
                Err(e) => {
                    abandon_cycle(SweepKind::Context, &e, &mut report);
                    break;
                }
            };
            let Some(percent) = parse_context_percent(&screen) else {
                continue;
            };
            if agent.context_percent == Some(percent) {
                continue;
            }

            let Some(_guard) = self.try_lock(&agent, &mut report) else {
                continue;
            };
            match self.store.set_context_percent(agent.id, percent) {
                Ok(()) => {
                    debug!(agent_id = agent.id, percent, "context metric updated");
                    report.updated += 1;
                }
                Err(e) => {
                    warn!(agent_id = agent.id, error = %e, "context update failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    fn active_agents(&self) -> Result<Vec<Agent>> {
        self.store
            .active_agents()
            .context("failed to list active agents")
    }

    fn is_stale(&self, agent: &Agent, now: DateTime<Utc>) -> bool {
        now - agent.last_active_at > self.settings.inactivity_timeout
    }

    fn try_lock(&self, agent: &Agent, report: &mut SweepReport) -> Option<LockGuard<'a>> {
        match self.locks.try_acquire(LockKey::agent(agent.id)) {
            Ok(Some(guard)) => Some(guard),
            Ok(None) => {
                debug!(agent_id = agent.id, "agent busy, skipping");
                report.busy += 1;
                None
            }
            Err(e) => {
                warn!(agent_id = agent.id, error = %e, "sweeper lock failed");
                report.failed += 1;
                None
            }
        }
    }

    fn end(&self, agent: &Agent, reason: &str, now: DateTime<Utc>, report: &mut SweepReport) {
        let lifecycle = Lifecycle::new(self.store, self.settings.match_window);
        match lifecycle.end_session(agent.id, reason, now) {
            Ok(outcome) => {
                report.ended += 1;
                if let Some(journal) = self.journal {
                    if let Some(outcome) = &outcome {
                        journal.note_outcome(outcome);
                    }
                    journal.note(LogEvent::AgentEnded {
                        agent_id: agent.id,
                        reason: reason.to_string(),
                    });
                }
            }
            Err(e) => {
                warn!(agent_id = agent.id, error = %e, "failed to end agent");
                report.failed += 1;
            }
        }
    }
}

fn abandon_cycle(kind: SweepKind, error: &BridgeError, report: &mut SweepReport) {
    warn!(sweep = %kind, error = %error, "terminal multiplexer unavailable, skipping cycle");
    report.unavailable = true;
}

/// The most recent "N% context left" reading on screen.
pub fn parse_context_percent(screen: &str) -> Option<u8> {
    let mut best: Option<(usize, u8)> = None;
    for pattern in CONTEXT_LEFT.iter() {
        for caps in pattern.captures_iter(screen) {
            let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let Ok(value) = number.as_str().parse::<u8>() else {
                continue;
            };
            if value > 100 {
                continue;
            }
            if best.is_none_or(|(at, _)| whole.start() >= at) {
                best = Some((whole.start(), value));
            }
        }
    }
    best.map(|(_, value)| value)
}

/// Run one kind of sweep until `stop` is set.
pub fn run_loop<M: Multiplexer>(
    sweeper: &Sweeper<'_, M>,
    kind: SweepKind,
    interval: Duration,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = sweeper.sweep(kind, Utc::now()) {
            warn!(sweep = %kind, error = %format!("{e:#}"), "sweep failed");
        }
        crate::runtime::sleep_unless_stopped(interval, &stop);
    }
}
