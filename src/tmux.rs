//! tmux access for the terminal bridge and the pane watchdog.
//!
//! Every call runs the tmux binary as a child process with its own deadline.
//! A tmux server that hangs (stuck client, frozen socket) must not hang a
//! hook or a sweep, so the child is killed when the deadline passes.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, trace};

use crate::bridge::BridgeError;

const WAIT_STEP: Duration = Duration::from_millis(10);

/// Operations the bridge and sweepers need from a terminal multiplexer.
pub trait Multiplexer {
    /// Type `text` into the pane without interpreting key names.
    fn send_literal(&self, pane: &str, text: &str) -> Result<(), BridgeError>;

    /// Press a named key (`Enter`, `Escape`, `Down`, ...).
    fn send_key(&self, pane: &str, key: &str) -> Result<(), BridgeError>;

    /// Visible pane contents. `styled` keeps SGR escape sequences.
    fn capture(&self, pane: &str, styled: bool) -> Result<String, BridgeError>;

    fn pane_exists(&self, pane: &str) -> Result<bool, BridgeError>;

    fn session_exists(&self, session: &str) -> Result<bool, BridgeError>;
}

/// The real tmux binary.
#[derive(Debug, Clone)]
pub struct TmuxMultiplexer {
    binary: String,
    timeout: Duration,
}

impl TmuxMultiplexer {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Run tmux with `args`. Non-zero exit is an error carrying stderr.
    fn run(&self, args: &[&str]) -> Result<String, BridgeError> {
        let (success, stdout, stderr) = self.exec(args)?;
        if !success {
            return Err(BridgeError::Failed {
                command: describe(args),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }

    /// Run tmux where a non-zero exit is an answer ("no such pane"), not a
    /// failure.
    fn probe(&self, args: &[&str]) -> Result<bool, BridgeError> {
        let (success, _, stderr) = self.exec(args)?;
        if !success {
            trace!(command = %describe(args), stderr = %stderr.trim(), "tmux probe negative");
        }
        Ok(success)
    }

    fn exec(&self, args: &[&str]) -> Result<(bool, String, String), BridgeError> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BridgeError::Unavailable(format!("{}: {e}", self.binary)))?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BridgeError::Timeout {
                        command: describe(args),
                        after: self.timeout,
                    });
                }
                Ok(None) => thread::sleep(WAIT_STEP),
                Err(e) => {
                    return Err(BridgeError::Unavailable(format!("{}: {e}", self.binary)));
                }
            }
        };

        let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
        debug!(command = %describe(args), status = ?status.code(), "tmux");
        Ok((status.success(), stdout, stderr))
    }
}

impl Multiplexer for TmuxMultiplexer {
    fn send_literal(&self, pane: &str, text: &str) -> Result<(), BridgeError> {
        if text.is_empty() {
            return Ok(());
        }
        self.run(&["send-keys", "-t", pane, "-l", "--", text])?;
        Ok(())
    }

    fn send_key(&self, pane: &str, key: &str) -> Result<(), BridgeError> {
        self.run(&["send-keys", "-t", pane, key])?;
        Ok(())
    }

    fn capture(&self, pane: &str, styled: bool) -> Result<String, BridgeError> {
        if styled {
            self.run(&["capture-pane", "-p", "-e", "-t", pane])
        } else {
            self.run(&["capture-pane", "-p", "-t", pane])
        }
    }

    fn pane_exists(&self, pane: &str) -> Result<bool, BridgeError> {
        self.probe(&["display-message", "-p", "-t", pane, "#{pane_id}"])
    }

    fn session_exists(&self, session: &str) -> Result<bool, BridgeError> {
        self.probe(&["has-session", "-t", session])
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn describe(args: &[&str]) -> String {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        // Literal payloads can be long; keep log lines readable.
        if arg.chars().count() > 40 {
            let head: String = arg.chars().take(37).collect();
            parts.push(format!("{head}..."));
        } else {
            parts.push((*arg).to_string());
        }
    }
    format!("tmux {}", parts.join(" "))
}

/// Check that tmux is installed and reachable. Returns its version string.
pub fn check_tmux(binary: &str) -> Result<String> {
    let output = Command::new(binary).arg("-V").output().with_context(|| {
        format!("{binary} not found; install tmux (e.g., `apt install tmux` or `brew install tmux`)")
    })?;

    if !output.status.success() {
        bail!(
            "{binary} -V failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(version = %version, "tmux found");
    Ok(version)
}
