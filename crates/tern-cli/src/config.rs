//! Configuration file discovery for tern.
//!
//! Resolution chain: `--config` flag > `TERN_CONFIG` env var >
//! `<project>/.tern/config.toml` > `~/.config/tern/config.toml` > built-in
//! defaults. An explicitly named file must exist; the search-path files are
//! optional.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use tern_core::config::HarnessConfig;
use tern_store::StoreConfig;

use crate::project::Project;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "TERN_CONFIG";

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the tern user config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/tern` or `~/.config/tern`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("tern");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tern")
}

pub fn user_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn project_config_path(store: &StoreConfig) -> PathBuf {
    store.state_dir.join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    HarnessConfig::from_toml_str(&contents)
        .with_context(|| format!("invalid config file {}", path.display()))
}

/// Serialize and write a config file, creating parent dirs as needed.
pub fn save_config(path: &Path, config: &HarnessConfig) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }
    let contents = config.to_toml_string().context("failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Flag(PathBuf),
    Env(PathBuf),
    Project(PathBuf),
    User(PathBuf),
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(p) => write!(f, "{} (--config)", p.display()),
            Self::Env(p) => write!(f, "{} ({CONFIG_ENV})", p.display()),
            Self::Project(p) => write!(f, "{} (project)", p.display()),
            Self::User(p) => write!(f, "{} (user)", p.display()),
            Self::Defaults => f.write_str("built-in defaults"),
        }
    }
}

#[derive(Debug)]
pub struct ResolvedConfig {
    pub config: HarnessConfig,
    pub source: ConfigSource,
}

pub fn resolve(flag: Option<&Path>, project: &Project) -> Result<ResolvedConfig> {
    let env = std::env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    resolve_from(
        flag,
        env,
        &project_config_path(&project.store),
        &user_config_path(),
    )
}

fn resolve_from(
    flag: Option<&Path>,
    env: Option<PathBuf>,
    project_path: &Path,
    user_path: &Path,
) -> Result<ResolvedConfig> {
    let (path, source) = if let Some(path) = flag {
        (path.to_path_buf(), ConfigSource::Flag(path.to_path_buf()))
    } else if let Some(path) = env {
        (path.clone(), ConfigSource::Env(path))
    } else if project_path.exists() {
        (project_path.to_path_buf(), ConfigSource::Project(project_path.to_path_buf()))
    } else if user_path.exists() {
        (user_path.to_path_buf(), ConfigSource::User(user_path.to_path_buf()))
    } else {
        tracing::debug!("no config file found, using defaults");
        return Ok(ResolvedConfig {
            config: HarnessConfig::default(),
            source: ConfigSource::Defaults,
        });
    };

    let config = load_config(&path)?;
    tracing::debug!(source = %source, providers = config.providers.len(), "loaded config");
    Ok(ResolvedConfig { config, source })
}

// -----------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------

/// Execute `tern config init`: write the default config to `path`.
pub fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }
    save_config(path, &HarnessConfig::default())?;
    println!("Config written to {}", path.display());
    println!("Edit the [[providers]] entries to match the assistants you have installed.");
    Ok(())
}

/// Execute `tern config show`.
pub fn cmd_show(resolved: &ResolvedConfig) -> Result<()> {
    println!("# source: {}", resolved.source);
    print!(
        "{}",
        resolved
            .config
            .to_toml_string()
            .context("failed to serialize config")?
    );
    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
