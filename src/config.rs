//! Configuration loading, defaults, and CLI flag parsing (§6).

use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("usage error: {0}")]
    Usage(String),
}

/// Log output format, mirroring `tracing_subscriber`'s two practical modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Pretty
    }
}

/// Which of `-accounts`/`-plugins` a `*`-or-csv flag resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// `-no-accounts` / `-no-plugins`: run none.
    None,
    /// Default, or explicit `*`: run everything the store names.
    All,
    /// `-accounts=a,b` / `-plugins=a,b`: run only the named ones.
    Only(Vec<String>),
}

impl Selection {
    /// Whether `name` should run under this selection.
    pub fn allows(&self, name: &str) -> bool {
        match self {
            Selection::None => false,
            Selection::All => true,
            Selection::Only(names) => names.iter().any(|n| n == name),
        }
    }
}

/// Process-level settings derived from CLI flags (§6).
#[derive(Debug, Clone)]
pub struct Args {
    /// `-dir=<path>`, env `MUPDIR`, default `~/.config/mup`.
    pub dir: PathBuf,
    pub accounts: Selection,
    pub plugins: Selection,
    pub debug: bool,
}

impl Args {
    /// Parse `argv` (excluding argv\[0\]) into [`Args`].
    pub fn parse<I, S>(argv: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut dir: Option<PathBuf> = None;
        let mut accounts = Selection::All;
        let mut plugins = Selection::All;
        let mut debug = false;

        for raw in argv {
            let arg = raw.as_ref();
            if let Some(v) = arg.strip_prefix("-dir=") {
                dir = Some(PathBuf::from(v));
            } else if let Some(v) = arg.strip_prefix("-accounts=") {
                accounts = parse_selection(v);
            } else if arg == "-no-accounts" {
                accounts = Selection::None;
            } else if let Some(v) = arg.strip_prefix("-plugins=") {
                plugins = parse_selection(v);
            } else if arg == "-no-plugins" {
                plugins = Selection::None;
            } else if arg == "-debug" {
                debug = true;
            } else {
                return Err(ConfigError::Usage(format!("unrecognized flag: {arg}")));
            }
        }

        let dir = dir
            .or_else(|| env::var_os("MUPDIR").map(PathBuf::from))
            .or_else(default_config_dir)
            .ok_or_else(|| ConfigError::Usage("could not determine home directory; pass -dir=<path>".into()))?;

        Ok(Self {
            dir,
            accounts,
            plugins,
            debug,
        })
    }

    /// Path to the SQLite file inside the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.dir.join("mup.db")
    }

    /// Path to the optional `mup.toml` settings file inside the data
    /// directory.
    pub fn config_path(&self) -> PathBuf {
        self.dir.join("mup.toml")
    }
}

fn parse_selection(v: &str) -> Selection {
    if v == "*" {
        Selection::All
    } else {
        Selection::Only(v.split(',').map(str::trim).map(str::to_owned).collect())
    }
}

fn default_config_dir() -> Option<PathBuf> {
    env::var_os("HOME").map(|home| Path::new(&home).join(".config").join("mup"))
}

/// Tunable knobs that aren't part of the persistent store's own rows
/// (§4.5, §4.6, §4.7, §5).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Round-trip budget for transport I/O and graceful shutdown (§5).
    pub network_timeout_secs: u64,
    /// Account-manager reconciliation tick; `-1` disables (§4.5).
    pub account_refresh_secs: i64,
    /// Plugin-manager / LDAP-pool reconciliation tick (§4.6, §4.9).
    pub plugin_refresh_secs: i64,
    /// Per-message auto-split cap (§4.7).
    pub max_text_len: usize,
    /// Auto-split tail-avoidance floor (§4.7).
    pub min_text_len: usize,
    /// Command prefix recognised in channel text in addition to nick
    /// addressing (§4.1 `derive_bot_text`, §4.4.1). `None` disables it.
    pub bang: Option<char>,
    /// Address `mup` binds for the WebHook inbound listener (§6).
    pub webhook_listen: String,
    /// Override for `api.telegram.org`, for tests or self-hosted relays.
    pub telegram_api_host: Option<String>,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network_timeout_secs: 15,
            account_refresh_secs: 3,
            plugin_refresh_secs: 3,
            max_text_len: 300,
            min_text_len: 50,
            bang: Some('!'),
            webhook_listen: "127.0.0.1:8765".to_owned(),
            telegram_api_host: None,
            log_format: LogFormat::default(),
        }
    }
}

impl Settings {
    /// Load `mup.toml` if it exists; otherwise fall back to defaults. A
    /// missing file is not an error — unlike a malformed one.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn network_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.network_timeout_secs)
    }
}
