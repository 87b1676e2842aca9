use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use tether::bridge::{self, BridgeError, Delivery};
use tether::cli::{Cli, Command, SweepTarget};
use tether::config::Config;
use tether::hooks::{HookKind, HookReceiver, HookResponse};
use tether::install;
use tether::lock::{LockKey, LockManager};
use tether::log::{ActivityLog, LogEvent};
use tether::model::{Agent, AgentId, CommandState, NewAgent};
use tether::paths::{self, Paths};
use tether::reconciler::Reconciler;
use tether::runtime;
use tether::shell_completion;
use tether::store::Store;
use tether::sweeper::{SweepKind, SweepReport, Sweeper};

/// Everything a command needs, opened from the resolved home directory.
struct Env {
    paths: Paths,
    config: Config,
    config_path: Option<PathBuf>,
}

impl Env {
    fn load(home: Option<&Path>) -> Result<Self> {
        let paths = Paths::discover(home);
        let (config, config_path) = Config::load(&paths)?;
        Ok(Self {
            paths,
            config,
            config_path,
        })
    }

    fn database(&self) -> PathBuf {
        self.config.database_path(&self.paths)
    }

    fn store(&self) -> Result<Store> {
        let db = self.database();
        paths::ensure_parent(&db)?;
        Store::open(&db).with_context(|| format!("failed to open store: {}", db.display()))
    }

    fn locks(&self) -> Result<LockManager> {
        let db = self.database();
        paths::ensure_parent(&db)?;
        LockManager::open(&db, self.config.lock_settings())
            .with_context(|| format!("failed to open lock table: {}", db.display()))
    }

    fn journal(&self) -> Result<ActivityLog> {
        ActivityLog::open(&self.paths.activity_log())
    }
}

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<26} {value}\n"));
}

fn render_config_human(env: &Env) -> String {
    let config = &env.config;
    let mut output = String::new();

    output.push_str("Store\n");
    push_kv(&mut output, "database", env.database().display());
    push_kv(&mut output, "activity_log", env.paths.activity_log().display());
    output.push('\n');

    output.push_str("Locks\n");
    push_kv(&mut output, "hook_timeout", format!("{}s", config.locks.hook_timeout_secs));
    push_kv(&mut output, "lease", format!("{}s", config.locks.lease_secs));
    push_kv(&mut output, "poll", format!("{}ms", config.locks.poll_millis));
    output.push('\n');

    output.push_str("Bridge\n");
    push_kv(&mut output, "binary", &config.bridge.binary);
    push_kv(
        &mut output,
        "command_timeout",
        format!("{}ms", config.bridge.command_timeout_millis),
    );
    push_kv(&mut output, "ghost_probe", config.bridge.ghost_probe);
    push_kv(&mut output, "verify", config.bridge.verify);
    push_kv(
        &mut output,
        "enter_delay",
        format!("{}ms", config.bridge.enter_delay_millis),
    );
    output.push('\n');

    output.push_str("Reconciler\n");
    push_kv(&mut output, "interval", format!("{}s", config.reconciler.interval_secs));
    push_kv(
        &mut output,
        "match_window",
        format!("{}s", config.reconciler.match_window_secs),
    );
    output.push('\n');

    output.push_str("Sweeper\n");
    push_kv(
        &mut output,
        "reaper_interval",
        format!("{}s", config.sweeper.reaper_interval_secs),
    );
    push_kv(
        &mut output,
        "watchdog_interval",
        format!("{}s", config.sweeper.watchdog_interval_secs),
    );
    push_kv(
        &mut output,
        "context_interval",
        format!("{}s", config.sweeper.context_interval_secs),
    );
    push_kv(
        &mut output,
        "inactivity_timeout",
        format!("{}s", config.sweeper.inactivity_timeout_secs),
    );
    push_kv(
        &mut output,
        "registration_grace",
        format!("{}s", config.sweeper.registration_grace_secs),
    );
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "home", env.paths.home().display());
    push_kv(&mut output, "path", config_source_label(env.config_path.as_deref()));

    output
}

fn render_config_json(env: &Env) -> Result<String> {
    let mut payload =
        serde_json::to_value(&env.config).context("failed to serialize config to JSON")?;
    if let Some(object) = payload.as_object_mut() {
        object.insert(
            "database_path".into(),
            env.database().display().to_string().into(),
        );
        object.insert(
            "source_path".into(),
            config_source_label(env.config_path.as_deref()).into(),
        );
    }
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

/// One row of `tether status`.
#[derive(Debug, Serialize)]
struct AgentStatus {
    id: AgentId,
    session_id: Option<String>,
    cwd: String,
    pane_id: Option<String>,
    state: Option<CommandState>,
    command_id: Option<i64>,
    context_percent: Option<u8>,
    last_active_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

fn collect_status(store: &Store, all: bool) -> Result<Vec<AgentStatus>> {
    let agents = if all {
        store.all_agents()
    } else {
        store.active_agents()
    }
    .context("failed to list agents")?;

    let mut rows = Vec::with_capacity(agents.len());
    for agent in agents {
        let command = store.latest_command(agent.id)?;
        rows.push(AgentStatus {
            id: agent.id,
            session_id: agent.session_id,
            cwd: agent.cwd,
            pane_id: agent.pane_id,
            state: command.as_ref().map(|c| c.state),
            command_id: command.map(|c| c.id),
            context_percent: agent.context_percent,
            last_active_at: agent.last_active_at,
            ended_at: agent.ended_at,
        });
    }
    Ok(rows)
}

fn render_status_human(rows: &[AgentStatus], now: DateTime<Utc>) -> String {
    if rows.is_empty() {
        return "No agents.\n".to_string();
    }
    let mut output = format!(
        "{:<5} {:<15} {:<6} {:<8} {:<10} {}\n",
        "ID", "STATE", "PANE", "CONTEXT", "ACTIVE", "CWD"
    );
    for row in rows {
        let state = match (&row.ended_at, row.state) {
            (Some(_), _) => "ended".to_string(),
            (None, Some(state)) => state.to_string(),
            (None, None) => "-".to_string(),
        };
        let context = row
            .context_percent
            .map(|p| format!("{p}%"))
            .unwrap_or_else(|| "-".to_string());
        output.push_str(&format!(
            "{:<5} {:<15} {:<6} {:<8} {:<10} {}\n",
            row.id,
            state,
            row.pane_id.as_deref().unwrap_or("-"),
            context,
            format_age(now - row.last_active_at),
            row.cwd
        ));
    }
    output
}

fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

fn format_sweep(kind: SweepKind, report: &SweepReport) -> String {
    let mut line = format!(
        "{kind:<9} examined {:>3}  ended {:>3}  updated {:>3}  busy {:>3}  failed {:>3}",
        report.examined, report.ended, report.updated, report.busy, report.failed
    );
    if report.unavailable {
        line.push_str("  (multiplexer unavailable)");
    }
    line
}

/// `tether hook <event>`: never fails, always answers "continue".
fn run_hook(home: Option<&Path>, event: &str) {
    if let Err(e) = handle_hook(home, event) {
        warn!(hook = event, error = %format!("{e:#}"), "hook not processed");
    }
    println!("{}", HookResponse::ok().to_json());
}

fn handle_hook(home: Option<&Path>, event: &str) -> Result<()> {
    let kind: HookKind = event.parse()?;
    let mut payload = String::new();
    std::io::stdin()
        .read_to_string(&mut payload)
        .context("failed to read hook payload from stdin")?;
    let pane = std::env::var("TMUX_PANE").ok();

    let env = Env::load(home)?;
    let store = env.store()?;
    let locks = env.locks()?;
    let journal = env.journal()?;
    HookReceiver::new(
        &store,
        &locks,
        env.config.hook_lock_timeout(),
        env.config.match_window(),
    )
    .with_journal(&journal)
    .handle(kind, &payload, pane);
    Ok(())
}

fn active_agent(store: &Store, id: AgentId) -> Result<Agent> {
    let Some(agent) = store.agent(id)? else {
        bail!("no agent with id {id}");
    };
    if !agent.is_active() {
        bail!("agent {id} has ended");
    }
    Ok(agent)
}

/// Run a bridge action against an agent's pane, journaling failures.
fn deliver<T>(
    env: &Env,
    id: AgentId,
    action: impl FnOnce(&str) -> Result<T, BridgeError>,
) -> Result<T> {
    let store = env.store()?;
    let agent = active_agent(&store, id)?;
    let result = bridge::pane_of(&agent).and_then(action);
    match result {
        Ok(value) => Ok(value),
        Err(e) => {
            env.journal()?.note(LogEvent::DeliveryFailed {
                agent_id: id,
                error: e.to_string(),
            });
            Err(e).with_context(|| format!("delivery to agent {id} failed"))
        }
    }
}

fn report_delivery(id: AgentId, delivery: &Delivery) {
    if delivery.enter_attempts > 1 {
        println!("Delivered to agent {id} (Enter retried).");
    } else {
        println!("Delivered to agent {id}.");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet = matches!(&cli.command, Command::Hook { .. } | Command::Config { .. });

    let filter = match cli.verbose {
        0 if quiet => "tether=warn",
        0 => "tether=info",
        1 => "tether=debug",
        _ => "tether=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let home = cli.home.as_deref();

    if let Command::Hook { event } = &cli.command {
        run_hook(home, event);
        return Ok(());
    }

    let env = Env::load(home)?;
    if !quiet || cli.verbose > 0 {
        match env.config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no config.toml in {}, using defaults", env.paths.home().display()),
        }
    }

    match cli.command {
        Command::Hook { .. } => {}
        Command::Register {
            cwd,
            pane,
            transcript,
        } => {
            let cwd = match cwd {
                Some(dir) => dir,
                None => std::env::current_dir()
                    .context("failed to get current directory (was it deleted?)")?,
            };
            let pane = pane.or_else(|| std::env::var("TMUX_PANE").ok());
            let store = env.store()?;
            let agent = store.register_agent(
                &NewAgent {
                    cwd: cwd.display().to_string(),
                    session_id: None,
                    pane_id: pane,
                    transcript_path: transcript.map(|p| p.display().to_string()),
                },
                Utc::now(),
            )?;
            env.journal()?.note(LogEvent::AgentRegistered {
                agent_id: agent.id,
                cwd: agent.cwd.clone(),
            });
            info!(agent_id = agent.id, cwd = %agent.cwd, "agent registered");
            println!("{}", agent.id);
        }
        Command::Send { agent, text } => {
            let text = text.join(" ");
            let bridge = env.config.bridge();
            let delivery = deliver(&env, agent, |pane| bridge.send_text(pane, &text))?;
            report_delivery(agent, &delivery);
        }
        Command::Select { agent, option } => {
            let bridge = env.config.bridge();
            let delivery = deliver(&env, agent, |pane| {
                bridge.select_option(pane, usize::from(option))
            })?;
            report_delivery(agent, &delivery);
        }
        Command::Interrupt { agent } => {
            let bridge = env.config.bridge();
            deliver(&env, agent, |pane| bridge.interrupt(pane))?;
            println!("Interrupted agent {agent}.");
        }
        Command::Reconcile { agent } => {
            let store = env.store()?;
            let locks = env.locks()?;
            let journal = env.journal()?;
            let reconciler =
                Reconciler::new(&store, &locks, env.config.match_window()).with_journal(&journal);
            match agent {
                Some(id) => {
                    let _guard = locks
                        .acquire(LockKey::agent(id), env.config.hook_lock_timeout())
                        .with_context(|| format!("agent {id} is busy"))?;
                    let report = reconciler.reconcile_agent(id)?;
                    println!(
                        "agent {id}: matched {}, created {}, duplicates {}, skipped {}",
                        report.matched, report.created, report.duplicates, report.skipped
                    );
                }
                None => {
                    let report = reconciler.run_pass()?;
                    println!(
                        "{} agents: matched {}, created {}, duplicates {}, busy {}, failed {}",
                        report.agents,
                        report.matched,
                        report.created,
                        report.duplicates,
                        report.busy,
                        report.failed
                    );
                }
            }
        }
        Command::Sweep { only } => {
            let store = env.store()?;
            let locks = env.locks()?;
            let journal = env.journal()?;
            let mux = env.config.multiplexer();
            let sweeper = Sweeper::new(&store, &locks, &mux, env.config.sweep_settings())
                .with_journal(&journal);
            let kinds: Vec<SweepKind> = match only {
                Some(SweepTarget::Reaper) => vec![SweepKind::Reaper],
                Some(SweepTarget::Watchdog) => vec![SweepKind::Watchdog],
                Some(SweepTarget::Context) => vec![SweepKind::Context],
                None => SweepKind::ALL.to_vec(),
            };
            for kind in kinds {
                let report = sweeper.sweep(kind, Utc::now())?;
                println!("{}", format_sweep(kind, &report));
            }
        }
        Command::Run => {
            let stop = runtime::stop_on_ctrlc();
            let journal = Arc::new(env.journal()?);
            println!(
                "tether running against {} (Ctrl-C to stop)",
                env.database().display()
            );
            runtime::run_daemon(&env.config, env.database(), journal, stop)?;
        }
        Command::Status { json, all } => {
            let store = env.store()?;
            let rows = collect_status(&store, all)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&rows).context("failed to serialize status")?
                );
            } else {
                print!("{}", render_status_human(&rows, Utc::now()));
            }
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&env)?);
            } else {
                print!("{}", render_config_human(&env));
            }
        }
        Command::Install {
            settings,
            program,
            yes,
        } => {
            let version = install::ensure_prerequisites(&env.config.bridge.binary)?;
            let settings = match settings {
                Some(path) => path,
                None => install::default_settings_path()?,
            };
            let program = match program {
                Some(program) => program,
                None => std::env::current_exe()
                    .context("failed to locate the tether executable")?
                    .display()
                    .to_string(),
            };

            if !yes {
                let proceed = dialoguer::Confirm::new()
                    .with_prompt(format!(
                        "Add tether hooks ({}) to {}?",
                        install::hook_command(&program, HookKind::Stop),
                        settings.display()
                    ))
                    .default(true)
                    .interact()?;
                if !proceed {
                    println!("Nothing installed.");
                    return Ok(());
                }
            }

            let summary = install::install_hooks(&settings, &program)?;
            println!("Checked external prerequisites:");
            println!("  present:   {version}");
            println!("Hooks in {}", settings.display());
            for kind in &summary.added {
                println!("  added:     {}", kind.settings_name());
            }
            for kind in &summary.unchanged {
                println!("  unchanged: {}", kind.settings_name());
            }
        }
        Command::Completions { shell } => {
            shell_completion::print(shell)?;
        }
    }

    Ok(())
}
