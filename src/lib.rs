//! tether: observe and steer interactive coding agents running in tmux panes.
//!
//! Agents report lifecycle hooks; each hook becomes a turn on the agent's
//! current command and drives a small state machine. A reconciler tails the
//! agent transcripts to recover turns the hooks missed, and a bridge types
//! operator replies back into the pane. Every mutation of an agent happens
//! under that agent's advisory lock in the shared SQLite store.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod correlator;
pub mod hooks;
pub mod install;
pub mod intent;
pub mod lifecycle;
pub mod lock;
pub mod log;
pub mod model;
pub mod paths;
pub mod reconciler;
pub mod runtime;
pub mod shell_completion;
pub mod state_machine;
pub mod store;
pub mod sweeper;
pub mod text;
pub mod tmux;
pub mod transcript;
