use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use crate::fanout::FanoutPolicy;

/// Command line options for the service.
#[derive(Parser, Debug, Default)]
#[command(name = "chat_delivery", about = "Realtime chat delivery and read tracking")]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory holding the database.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Directory holding `chat.db`.
    pub data_dir: PathBuf,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    /// HS256 secret used to validate bearer tokens.
    pub jwt_secret: String,
    /// Upper bound for a single store operation.
    pub store_timeout: Duration,
    pub fanout: FanoutPolicy,
    /// Grace period before a disconnected user is reported offline.
    pub presence_debounce: Duration,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("data_dir", &self.data_dir)
            .field("logging_enabled", &self.logging_enabled)
            .field("jwt_secret", &"<redacted>")
            .field("store_timeout", &self.store_timeout)
            .field("fanout", &self.fanout)
            .field("presence_debounce", &self.presence_debounce)
            .finish()
    }
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chat.db")
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    auth: FileAuth,
    #[serde(default)]
    store: FileStore,
    #[serde(default)]
    fanout: FileFanout,
    #[serde(default)]
    presence: FilePresence,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileAuth {
    #[serde(default)]
    jwt_secret: Option<String>,
}

#[derive(Deserialize)]
struct FileStore {
    #[serde(default = "default_store_timeout_ms")]
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct FileFanout {
    #[serde(default = "default_fanout_attempts")]
    attempts: u32,
    #[serde(default = "default_fanout_backoff_ms")]
    backoff_ms: u64,
}

#[derive(Deserialize)]
struct FilePresence {
    #[serde(default = "default_debounce_ms")]
    debounce_ms: u64,
}

fn default_port() -> u16 {
    8788
}

fn default_logging() -> bool {
    true
}

fn default_store_timeout_ms() -> u64 {
    5000
}

fn default_fanout_attempts() -> u32 {
    3
}

fn default_fanout_backoff_ms() -> u64 {
    100
}

fn default_debounce_ms() -> u64 {
    1000
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self {
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl Default for FileFanout {
    fn default() -> Self {
        Self {
            attempts: default_fanout_attempts(),
            backoff_ms: default_fanout_backoff_ms(),
        }
    }
}

impl Default for FilePresence {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("CHAT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/chat_delivery.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };
        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        let mut jwt_secret = file_cfg.auth.jwt_secret;

        // environment overrides
        if let Ok(p) = std::env::var("CHAT_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("CHAT_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(s) = std::env::var("CHAT_JWT_SECRET") {
            jwt_secret = Some(s);
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        // validate port range
        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        let jwt_secret = match jwt_secret {
            Some(s) if !s.is_empty() => s,
            _ => anyhow::bail!("missing_jwt_secret"),
        };
        if file_cfg.fanout.attempts == 0 {
            anyhow::bail!("invalid_fanout_attempts");
        }

        // bind address precedence for host override
        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| std::env::var("DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        Ok(Self {
            bind,
            data_dir,
            logging_enabled: logging,
            jwt_secret,
            store_timeout: Duration::from_millis(file_cfg.store.timeout_ms),
            fanout: FanoutPolicy {
                attempts: file_cfg.fanout.attempts,
                backoff: Duration::from_millis(file_cfg.fanout.backoff_ms),
            },
            presence_debounce: Duration::from_millis(file_cfg.presence.debounce_ms),
        })
    }
}

/// Determine the default data directory.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/chat_delivery");
        p
    } else {
        PathBuf::from("./chat_delivery_data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn clear_env() {
        for key in ["CHAT_PORT", "CHAT_LOGGING", "CHAT_CONFIG", "BIND", "DATA_DIR"] {
            std::env::remove_var(key);
        }
        std::env::set_var("CHAT_JWT_SECRET", "test-secret");
    }

    fn cli_for(contents: &str) -> (tempfile::TempDir, Cli) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, contents).unwrap();
        let cli = Cli {
            config: Some(path),
            ..Default::default()
        };
        (dir, cli)
    }

    #[test]
    #[serial]
    fn valid_config_parses() {
        clear_env();
        let (_dir, cli) = cli_for(
            "[server]\nport=5555\n[logging]\nenabled=false\n[store]\ntimeout_ms=250\n\
             [fanout]\nattempts=5\nbackoff_ms=10\n[presence]\ndebounce_ms=0\n",
        );
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:5555");
        assert!(!cfg.logging_enabled);
        assert_eq!(cfg.store_timeout, Duration::from_millis(250));
        assert_eq!(cfg.fanout.attempts, 5);
        assert_eq!(cfg.fanout.backoff, Duration::from_millis(10));
        assert_eq!(cfg.presence_debounce, Duration::ZERO);
    }

    #[test]
    #[serial]
    fn invalid_port_fails() {
        clear_env();
        let (_dir, cli) = cli_for("[server]\nport=80\n");
        assert!(Config::load(&cli).is_err());
    }

    #[test]
    #[serial]
    fn missing_keys_defaults() {
        clear_env();
        let (_dir, cli) = cli_for("");
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:8788");
        assert!(cfg.logging_enabled);
        assert_eq!(cfg.store_timeout, Duration::from_secs(5));
        assert_eq!(cfg.fanout.attempts, 3);
        assert_eq!(cfg.presence_debounce, Duration::from_secs(1));
    }

    #[test]
    #[serial]
    fn precedence_cli_env_file() {
        clear_env();
        let (_dir, mut cli) = cli_for("[server]\nport=1111\n");
        std::env::set_var("CHAT_PORT", "2222");
        cli.port = Some(3333);
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3333");
        cli.port = None;
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:2222");
        std::env::remove_var("CHAT_PORT");
    }

    #[test]
    #[serial]
    fn secret_is_required_and_env_wins() {
        clear_env();
        std::env::remove_var("CHAT_JWT_SECRET");
        let (_dir, cli) = cli_for("");
        assert!(Config::load(&cli).is_err());

        let (_dir, cli) = cli_for("[auth]\njwt_secret=\"from-file\"\n");
        assert_eq!(Config::load(&cli).unwrap().jwt_secret, "from-file");
        std::env::set_var("CHAT_JWT_SECRET", "from-env");
        assert_eq!(Config::load(&cli).unwrap().jwt_secret, "from-env");
    }

    #[test]
    #[serial]
    fn data_dir_and_bind_overrides() {
        clear_env();
        let (dir, mut cli) = cli_for("");
        std::env::set_var("DATA_DIR", dir.path());
        assert_eq!(Config::load(&cli).unwrap().data_dir, dir.path());
        cli.data_dir = Some(PathBuf::from("/tmp/elsewhere"));
        cli.bind = Some("0.0.0.0:9000".into());
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/elsewhere"));
        assert_eq!(cfg.bind, "0.0.0.0:9000");
        assert!(!format!("{cfg:?}").contains("test-secret"));
        std::env::remove_var("DATA_DIR");
    }
}
