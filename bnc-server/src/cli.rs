//! Command-line flags.
//!
//! Flags override the matching keys of the config document; anything left
//! unset falls back to the document, then to the defaults below.

use std::path::{Path, PathBuf};

use bnc_core::config::ConfigDocument;
use clap::Parser;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

#[derive(Parser, Debug, Clone)]
#[command(name = "bnc", about = "Always-on multi-network IRC bouncer", version)]
pub struct Args {
    /// Config document (JSON, or TOML when the extension is .toml)
    #[arg(long, env = "BNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// WebSocket listen address (host:port)
    #[arg(long, env = "BNC_LISTEN")]
    pub listen: Option<String>,

    /// SQLite event database path
    #[arg(long, env = "BNC_DB")]
    pub db: Option<PathBuf>,
}

impl Args {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }

    pub fn listen_addr(&self, doc: &ConfigDocument) -> String {
        self.listen
            .clone()
            .or_else(|| doc.listen.clone())
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
    }

    /// Database path; defaults to `events.db` next to the config file.
    pub fn db_path(&self, doc: &ConfigDocument, config_path: &Path) -> PathBuf {
        self.db
            .clone()
            .or_else(|| doc.database.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| {
                config_path
                    .parent()
                    .unwrap_or(Path::new("."))
                    .join("events.db")
            })
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bnc")
        .join("config.json")
}
