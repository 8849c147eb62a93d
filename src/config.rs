//! Server configuration: compiled defaults, overridden by an optional TOML
//! file, overridden by environment variables, overridden by CLI flags.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Standalone,
    Master,
    Slave,
}

impl ServerRole {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "standalone" => Some(ServerRole::Standalone),
            "master" => Some(ServerRole::Master),
            "slave" => Some(ServerRole::Slave),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerRole::Standalone => "standalone",
            ServerRole::Master => "master",
            ServerRole::Slave => "slave",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Config file / environment layer. Every field is optional so later layers
/// only override what they actually set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FileConfig {
    port: Option<u16>,
    binary_port: Option<u16>,
    replication_port: Option<u16>,
    role: Option<String>,
    master_addr: Option<String>,
    db_path: Option<PathBuf>,
    log_level: Option<String>,
    log_json: Option<bool>,
}

/// CLI flags, matching the server's recognized flag set exactly.
#[derive(Debug, Parser)]
#[command(name = "flydb-server", about = "FlyDB cluster node")]
struct Cli {
    #[arg(long)]
    port: Option<u16>,
    #[arg(long = "binary-port")]
    binary_port: Option<u16>,
    #[arg(long = "replication-port")]
    replication_port: Option<u16>,
    #[arg(long)]
    role: Option<String>,
    #[arg(long = "master-addr")]
    master_addr: Option<String>,
    #[arg(long = "db-path")]
    db_path: Option<PathBuf>,
    #[arg(long = "log-level")]
    log_level: Option<String>,
    #[arg(long = "log-json")]
    log_json: Option<bool>,
    #[arg(long = "config")]
    config_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub binary_port: u16,
    pub replication_port: u16,
    pub role: ServerRole,
    pub master_addr: Option<String>,
    pub db_path: PathBuf,
    pub log_level: LogLevel,
    pub log_json: bool,
    pub admin_password: Option<String>,
    pub encryption_passphrase: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 6380,
            binary_port: 6381,
            replication_port: 6382,
            role: ServerRole::Standalone,
            master_addr: None,
            db_path: PathBuf::from("./flydb-data"),
            log_level: LogLevel::Info,
            log_json: false,
            admin_password: None,
            encryption_passphrase: None,
        }
    }
}

impl ServerConfig {
    /// Load the three layers in order: compiled defaults, then an optional
    /// TOML file (explicit `--config` flag or `flydb.toml` in the current
    /// directory), then environment variables, then CLI flags.
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        Self::load_from(cli)
    }

    fn load_from(cli: Cli) -> Result<Self> {
        let mut config = ServerConfig::default();

        let file_path = cli.config_file.clone().unwrap_or_else(|| PathBuf::from("flydb.toml"));
        if let Some(file) = Self::read_file(&file_path)? {
            config.apply_file(file);
        }

        config.apply_env();
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Option<FileConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)?;
        let parsed: FileConfig =
            toml::from_str(&contents).map_err(|e| DbError::Configuration(format!("{}: {e}", path.display())))?;
        Ok(Some(parsed))
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.port {
            self.port = v;
        }
        if let Some(v) = file.binary_port {
            self.binary_port = v;
        }
        if let Some(v) = file.replication_port {
            self.replication_port = v;
        }
        if let Some(v) = file.role.as_deref().and_then(ServerRole::parse) {
            self.role = v;
        }
        if file.master_addr.is_some() {
            self.master_addr = file.master_addr;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.log_level.as_deref().and_then(LogLevel::parse) {
            self.log_level = v;
        }
        if let Some(v) = file.log_json {
            self.log_json = v;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("FLYDB_PORT") {
            if let Ok(p) = v.parse() {
                self.port = p;
            }
        }
        if let Ok(v) = std::env::var("FLYDB_ROLE") {
            if let Some(role) = ServerRole::parse(&v) {
                self.role = role;
            }
        }
        if let Ok(v) = std::env::var("FLYDB_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&v) {
                self.log_level = level;
            }
        }
        if let Ok(v) = std::env::var("FLYDB_LOG_JSON") {
            self.log_json = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("FLYDB_ADMIN_PASSWORD") {
            self.admin_password = Some(v);
        }
        if let Ok(v) = std::env::var("FLYDB_ENCRYPTION_PASSPHRASE") {
            self.encryption_passphrase = Some(v);
        }
    }

    fn apply_cli(&mut self, cli: Cli) {
        if let Some(v) = cli.port {
            self.port = v;
        }
        if let Some(v) = cli.binary_port {
            self.binary_port = v;
        }
        if let Some(v) = cli.replication_port {
            self.replication_port = v;
        }
        if let Some(v) = cli.role.as_deref().and_then(ServerRole::parse) {
            self.role = v;
        }
        if cli.master_addr.is_some() {
            self.master_addr = cli.master_addr;
        }
        if let Some(v) = cli.db_path {
            self.db_path = v;
        }
        if let Some(v) = cli.log_level.as_deref().and_then(LogLevel::parse) {
            self.log_level = v;
        }
        if let Some(v) = cli.log_json {
            self.log_json = v;
        }
    }

    /// Reject invalid ports (0 or duplicate), unknown roles (already
    /// unrepresentable once parsed), a slave without `master_addr`, and an
    /// empty `db_path`.
    pub fn validate(&self) -> Result<()> {
        for (name, port) in [("port", self.port), ("binary_port", self.binary_port), ("replication_port", self.replication_port)] {
            if port == 0 {
                return Err(DbError::Configuration(format!("{name} must not be 0")));
            }
        }
        let ports = [self.port, self.binary_port, self.replication_port];
        for i in 0..ports.len() {
            for j in (i + 1)..ports.len() {
                if ports[i] == ports[j] {
                    return Err(DbError::Configuration(format!("duplicate port {}", ports[i])));
                }
            }
        }
        if self.role == ServerRole::Slave && self.master_addr.is_none() {
            return Err(DbError::Configuration("role=slave requires --master-addr".into()));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(DbError::Configuration("db_path must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec!["flydb-server"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    #[test]
    fn defaults_pass_validation() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn cli_flags_override_defaults() {
        let config = ServerConfig::load_from(cli(&["--port", "7000"])).unwrap();
        assert_eq!(config.port, 7000);
    }

    #[test]
    fn slave_without_master_addr_is_rejected() {
        let config = ServerConfig::load_from(cli(&["--role", "slave"]));
        assert!(config.is_err());
    }

    #[test]
    fn duplicate_ports_are_rejected() {
        let mut config = ServerConfig::default();
        config.binary_port = config.port;
        assert!(config.validate().is_err());
    }
}
