use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "tether",
    about = "Control plane for interactive coding agents running in tmux panes",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// State directory (default: $TETHER_HOME or ~/.tether)
    #[arg(long, global = true, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register an agent before its first hook fires
    Register {
        /// Working directory the agent runs in
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Tmux pane id (default: $TMUX_PANE)
        #[arg(long)]
        pane: Option<String>,

        /// Transcript file to reconcile against
        #[arg(long)]
        transcript: Option<PathBuf>,
    },

    /// Handle one agent lifecycle hook (payload on stdin)
    Hook {
        /// Event name, e.g. "stop" or "UserPromptSubmit"
        event: String,
    },

    /// Type text into an agent's pane and submit it
    Send {
        agent: i64,

        /// Text to deliver; joined with spaces
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Pick an entry from a selection list in an agent's pane
    Select {
        agent: i64,

        /// 1-based option number
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        option: u16,
    },

    /// Send Escape to an agent's pane
    Interrupt { agent: i64 },

    /// Run one transcript reconciliation pass
    Reconcile {
        /// Only this agent
        #[arg(long)]
        agent: Option<i64>,
    },

    /// Run background sweeps once
    Sweep {
        /// Only this sweep
        #[arg(long, value_enum)]
        only: Option<SweepTarget>,
    },

    /// Run the reconciler and sweepers until interrupted
    Run,

    /// Show agents and their current command state
    Status {
        /// Emit machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Include ended agents
        #[arg(long, short = 'a', default_value_t = false)]
        all: bool,
    },

    /// Show effective configuration
    Config {
        /// Emit machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Install tether hooks into the agent's settings.json
    Install {
        /// Settings file (default: ~/.claude/settings.json)
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Command the hooks invoke (default: this executable)
        #[arg(long)]
        program: Option<String>,

        /// Skip the confirmation prompt
        #[arg(long, short = 'y', default_value_t = false)]
        yes: bool,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepTarget {
    Reaper,
    Watchdog,
    Context,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
