//! Delivers operator input into a running agent's pane.
//!
//! Text goes in as a literal key injection, then Enter follows as a separate
//! multiplexer call after a short delay. The interactive agent only treats
//! the split form as a submission. With verification on, the pane is
//! captured around the Enter; an unchanged screen gets exactly one more
//! Enter before the delivery is reported as failed.
//!
//! The bridge confirms delivery of keys, nothing more. Whatever the agent
//! does with them shows up later through hooks and the transcript.

use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{Agent, AgentId};
use crate::text::strip_ansi;
use crate::tmux::Multiplexer;

const ENTER: &str = "Enter";
const ESCAPE: &str = "Escape";
const DOWN: &str = "Down";

/// Lines from the bottom of the pane searched for the input prompt.
const PROMPT_SEARCH_LINES: usize = 15;

static SGR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\[([0-9;]*)m").unwrap());

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("terminal multiplexer unavailable: {0}")]
    Unavailable(String),

    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("{command} failed: {stderr}")]
    Failed { command: String, stderr: String },

    #[error("pane {0} no longer exists")]
    PaneMissing(String),

    #[error("agent {0} has no pane")]
    NoPane(AgentId),

    #[error("submission to pane {pane} did not register after {attempts} Enter attempts")]
    SubmissionNotRegistered { pane: String, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    pub ghost_probe: bool,
    pub ghost_wait: Duration,
    pub verify: bool,
    /// Pause between the literal text and the Enter key.
    pub enter_delay: Duration,
    /// Pause after Enter before the verifying capture.
    pub verify_delay: Duration,
    /// Pause between consecutive navigation keys.
    pub key_delay: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            ghost_probe: true,
            ghost_wait: Duration::from_millis(150),
            verify: true,
            enter_delay: Duration::from_millis(100),
            verify_delay: Duration::from_millis(300),
            key_delay: Duration::from_millis(50),
        }
    }
}

/// What a successful delivery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub ghost_cleared: bool,
    pub enter_attempts: u32,
    /// False when verification was disabled.
    pub verified: bool,
}

pub struct Bridge<M> {
    mux: M,
    settings: BridgeSettings,
}

impl<M: Multiplexer> Bridge<M> {
    pub fn new(mux: M, settings: BridgeSettings) -> Self {
        Self { mux, settings }
    }

    pub fn multiplexer(&self) -> &M {
        &self.mux
    }

    /// Type `text` into the pane and submit it.
    pub fn send_text(&self, pane: &str, text: &str) -> Result<Delivery, BridgeError> {
        self.ensure_pane(pane)?;
        let ghost_cleared = self.clear_ghost_text(pane)?;

        self.mux.send_literal(pane, text)?;
        pause(self.settings.enter_delay);

        let mut delivery = self.submit(pane)?;
        delivery.ghost_cleared = ghost_cleared;
        info!(pane, chars = text.chars().count(), attempts = delivery.enter_attempts, "text delivered");
        Ok(delivery)
    }

    /// Pick entry `option` (1-based) from a selection list whose cursor
    /// starts on the first entry.
    pub fn select_option(&self, pane: &str, option: usize) -> Result<Delivery, BridgeError> {
        self.ensure_pane(pane)?;
        for _ in 1..option {
            self.mux.send_key(pane, DOWN)?;
            pause(self.settings.key_delay);
        }
        pause(self.settings.enter_delay);

        let delivery = self.submit(pane)?;
        info!(pane, option, "option selected");
        Ok(delivery)
    }

    /// Cancel the agent's current generation.
    pub fn interrupt(&self, pane: &str) -> Result<(), BridgeError> {
        self.ensure_pane(pane)?;
        self.mux.send_key(pane, ESCAPE)?;
        info!(pane, "interrupt sent");
        Ok(())
    }

    fn ensure_pane(&self, pane: &str) -> Result<(), BridgeError> {
        if self.mux.pane_exists(pane)? {
            Ok(())
        } else {
            Err(BridgeError::PaneMissing(pane.to_string()))
        }
    }

    fn clear_ghost_text(&self, pane: &str) -> Result<bool, BridgeError> {
        if !self.settings.ghost_probe {
            return Ok(false);
        }
        let styled = self.mux.capture(pane, true)?;
        if !detect_ghost_text(&styled) {
            return Ok(false);
        }
        debug!(pane, "suggestion text at prompt, dismissing");
        self.mux.send_key(pane, ESCAPE)?;
        pause(self.settings.ghost_wait);
        Ok(true)
    }

    fn submit(&self, pane: &str) -> Result<Delivery, BridgeError> {
        if !self.settings.verify {
            self.mux.send_key(pane, ENTER)?;
            return Ok(Delivery {
                ghost_cleared: false,
                enter_attempts: 1,
                verified: false,
            });
        }

        let before = self.mux.capture(pane, false)?;
        for attempt in 1..=2u32 {
            self.mux.send_key(pane, ENTER)?;
            pause(self.settings.verify_delay);
            let after = self.mux.capture(pane, false)?;
            if after != before {
                return Ok(Delivery {
                    ghost_cleared: false,
                    enter_attempts: attempt,
                    verified: true,
                });
            }
            warn!(pane, attempt, "pane unchanged after Enter");
        }

        Err(BridgeError::SubmissionNotRegistered {
            pane: pane.to_string(),
            attempts: 2,
        })
    }
}

/// The pane address recorded for `agent`.
pub fn pane_of(agent: &Agent) -> Result<&str, BridgeError> {
    agent.pane_id.as_deref().ok_or(BridgeError::NoPane(agent.id))
}

/// True if the input prompt near the bottom of a styled capture shows
/// dimmed or grey text, which is how autocomplete suggestions render.
pub fn detect_ghost_text(styled: &str) -> bool {
    for line in styled.lines().rev().take(PROMPT_SEARCH_LINES) {
        let plain = strip_ansi(line);
        let trimmed = plain.trim_start();
        if trimmed.starts_with('>') || trimmed.starts_with('❯') {
            return prompt_has_faint_text(line);
        }
    }
    false
}

/// Walk the prompt line tracking SGR state; any visible character after the
/// prompt glyph rendered faint counts.
fn prompt_has_faint_text(line: &str) -> bool {
    let mut faint = false;
    let mut grey = false;
    let mut past_prompt = false;
    let mut cursor = 0;

    for caps in SGR.captures_iter(line) {
        let Some(whole) = caps.get(0) else { continue };
        if faint_char_after_prompt(&line[cursor..whole.start()], faint || grey, &mut past_prompt) {
            return true;
        }
        cursor = whole.end();
        apply_sgr(caps.get(1).map_or("", |m| m.as_str()), &mut faint, &mut grey);
    }
    faint_char_after_prompt(&line[cursor..], faint || grey, &mut past_prompt)
}

fn faint_char_after_prompt(segment: &str, faint: bool, past_prompt: &mut bool) -> bool {
    for ch in segment.chars() {
        if !*past_prompt {
            if ch == '>' || ch == '❯' {
                *past_prompt = true;
            }
            continue;
        }
        if faint && !ch.is_whitespace() {
            return true;
        }
    }
    false
}

fn apply_sgr(params: &str, faint: &mut bool, grey: &mut bool) {
    let codes: Vec<u32> = if params.is_empty() {
        vec![0]
    } else {
        params.split(';').map(|p| p.parse().unwrap_or(0)).collect()
    };

    let mut i = 0;
    while i < codes.len() {
        match codes[i] {
            0 => {
                *faint = false;
                *grey = false;
            }
            2 => *faint = true,
            22 => *faint = false,
            90 => *grey = true,
            30..=37 | 39 | 91..=97 => *grey = false,
            38 => match codes.get(i + 1) {
                Some(5) => {
                    *grey = codes.get(i + 2).is_some_and(|&n| is_grey_256(n));
                    i += 2;
                }
                Some(2) => {
                    *grey = match (codes.get(i + 2), codes.get(i + 3), codes.get(i + 4)) {
                        (Some(&r), Some(&g), Some(&b)) => is_grey_rgb(r, g, b),
                        _ => false,
                    };
                    i += 4;
                }
                _ => {}
            },
            _ => {}
        }
        i += 1;
    }
}

fn is_grey_256(n: u32) -> bool {
    n == 8 || (240..=250).contains(&n)
}

fn is_grey_rgb(r: u32, g: u32, b: u32) -> bool {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    max - min <= 16 && (80..=180).contains(&max)
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}
