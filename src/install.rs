//! Hook installation into the agent's `settings.json`.
//!
//! Each of the seven lifecycle events gets a command hook that runs
//! `<program> hook <event>`. Existing settings, including other hooks on the
//! same events, are left alone. Re-running is a no-op.

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};
use std::fs;
use std::path::{Path, PathBuf};

use crate::hooks::HookKind;
use crate::tmux;

/// Settings file location relative to the user's home directory.
const SETTINGS_RELATIVE: &str = ".claude/settings.json";

#[derive(Debug, Default)]
pub struct InstallSummary {
    pub added: Vec<HookKind>,
    pub unchanged: Vec<HookKind>,
    /// False when every hook was already present and nothing was written.
    pub written: bool,
}

/// `~/.claude/settings.json`.
pub fn default_settings_path() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set; pass --settings")?;
    Ok(PathBuf::from(home).join(SETTINGS_RELATIVE))
}

/// The shell command a hook entry runs for `kind`.
pub fn hook_command(program: &str, kind: HookKind) -> String {
    format!("{program} hook {}", kind.as_str())
}

/// Tmux must be runnable for pane capture and delivery.
pub fn ensure_prerequisites(binary: &str) -> Result<String> {
    tmux::check_tmux(binary).with_context(|| {
        format!(
            "`{binary}` is not available. Install tmux manually (e.g., `brew install tmux` or `sudo apt-get install -y tmux`)."
        )
    })
}

/// Merge hooks for every event into the settings file at `path`.
pub fn install_hooks(path: &Path, program: &str) -> Result<InstallSummary> {
    let mut settings = read_settings(path)?;
    let summary = merge_hooks(&mut settings, program)?;

    if summary.written {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let rendered =
            serde_json::to_string_pretty(&settings).context("failed to serialize settings")?;
        fs::write(path, format!("{rendered}\n"))
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(summary)
}

fn read_settings(path: &Path) -> Result<Value> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(json!({})),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    if contents.trim().is_empty() {
        return Ok(json!({}));
    }
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    if !value.is_object() {
        bail!("{} is not a JSON object", path.display());
    }
    Ok(value)
}

fn merge_hooks(settings: &mut Value, program: &str) -> Result<InstallSummary> {
    let mut summary = InstallSummary::default();
    let Some(root) = settings.as_object_mut() else {
        bail!("settings root is not a JSON object");
    };
    let hooks = root
        .entry("hooks")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(hooks) = hooks.as_object_mut() else {
        bail!("settings \"hooks\" is not a JSON object");
    };

    for kind in HookKind::ALL {
        let command = hook_command(program, kind);
        let groups = hooks
            .entry(kind.settings_name())
            .or_insert_with(|| Value::Array(Vec::new()));
        let Some(groups) = groups.as_array_mut() else {
            bail!("settings hooks.{} is not an array", kind.settings_name());
        };

        if groups.iter().any(|group| group_runs(group, &command)) {
            summary.unchanged.push(kind);
            continue;
        }

        groups.push(json!({
            "matcher": "",
            "hooks": [{ "type": "command", "command": command }],
        }));
        summary.added.push(kind);
    }

    summary.written = !summary.added.is_empty();
    Ok(summary)
}

fn group_runs(group: &Value, command: &str) -> bool {
    group
        .get("hooks")
        .and_then(Value::as_array)
        .is_some_and(|entries| {
            entries
                .iter()
                .any(|entry| entry.get("command").and_then(Value::as_str) == Some(command))
        })
}
