//! Configuration file handling for termwire.
//!
//! Settings are loaded from `~/.termwire/config.toml` and may be
//! overridden by command line options. A missing or unparsable file
//! falls back to defaults.
//!
//! # Configuration File
//!
//! ```toml
//! host = "server.example.com"
//! port = 9584
//! user = "operator"
//! color_mode = "ansi256"
//!
//! [terminal]
//! lines = 24
//! columns = 80
//! xkeys = true
//!
//! [log]
//! level = "info"
//! file = "termwire.log"
//! ```

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::term::ColorMode;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server host name or address
    pub host: Option<String>,
    /// Server control port
    pub port: Option<u16>,
    /// User parameter passed on session start
    pub user: String,
    /// Working directory parameter passed on session start
    pub dir: String,
    /// Cell color depth: "legacy" or "ansi256"
    pub color_mode: String,
    /// Offset from UTC reported in the greeting, e.g. "-0500"
    pub utc_offset: String,
    /// Keepalive probe interval in seconds, 0 disables
    pub keepalive_secs: u64,
    /// Terminal settings
    pub terminal: TerminalConfig,
    /// Log settings
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            user: String::new(),
            dir: String::new(),
            color_mode: "legacy".to_string(),
            utc_offset: "+0000".to_string(),
            keepalive_secs: 30,
            terminal: TerminalConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Terminal geometry and key handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub lines: usize,
    pub columns: usize,
    /// Treat function keys as finish keys by default
    pub xkeys: bool,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            lines: 24,
            columns: 80,
            xkeys: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Maximum level: "error", "warn", "info", "debug", "trace"
    pub level: String,
    /// Log file name, written under `~/.termwire/`
    pub file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: "termwire.log".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                if let Ok(content) = fs::read_to_string(&path) {
                    if let Ok(config) = toml::from_str(&content) {
                        return config;
                    }
                }
            }
        }
        Self::default()
    }

    /// Parsed color mode, defaulting to legacy on unknown names
    pub fn color_mode(&self) -> ColorMode {
        match self.color_mode.as_str() {
            "ansi256" | "ansi" => ColorMode::Ansi256,
            _ => ColorMode::Legacy,
        }
    }

    /// Config file path: `~/.termwire/config.toml`
    fn config_path() -> Option<PathBuf> {
        Self::home_dir().map(|home| home.join(".termwire").join("config.toml"))
    }

    /// Log file path: `~/.termwire/<log.file>`
    pub fn log_path(&self) -> Option<PathBuf> {
        Self::home_dir().map(|home| home.join(".termwire").join(&self.log.file))
    }

    fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
