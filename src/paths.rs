use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const HOME_ENV: &str = "TETHER_HOME";
const HOME_DIR: &str = ".tether";

/// Well-known locations under the tether home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    home: PathBuf,
}

impl Paths {
    /// Resolve the home directory from an explicit override, `$TETHER_HOME`,
    /// or `~/.tether`, in that order.
    pub fn discover(explicit: Option<&Path>) -> Self {
        let env_home = std::env::var_os(HOME_ENV).map(PathBuf::from);
        let user_home = std::env::var_os("HOME").map(PathBuf::from);
        Self {
            home: resolve_home(explicit, env_home.as_deref(), user_home.as_deref()),
        }
    }

    pub fn at(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config_file(&self) -> PathBuf {
        self.home.join("config.toml")
    }

    pub fn default_database(&self) -> PathBuf {
        self.home.join("tether.db")
    }

    pub fn activity_log(&self) -> PathBuf {
        self.home.join("logs").join("activity.jsonl")
    }
}

fn resolve_home(explicit: Option<&Path>, env_home: Option<&Path>, user_home: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(path) = env_home.filter(|p| !p.as_os_str().is_empty()) {
        return path.to_path_buf();
    }
    user_home
        .map(|h| h.join(HOME_DIR))
        .unwrap_or_else(|| PathBuf::from(HOME_DIR))
}

/// Create the directory a database or log file will live in.
pub fn ensure_parent(path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory: {}", parent.display()))
}
