//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rffmpeg/rffmpeg.toml";

/// Environment variable that overrides the configuration file location
pub const CONFIG_PATH_ENV: &str = "RFFMPEG_CONFIG";

/// Name of the SQLite database file inside `database.path`
pub const DATABASE_FILE_NAME: &str = "rffmpeg.db";

/// Flags that only query static information from the codec tool.
/// Always merged into `commands.special_flags`.
pub const DEFAULT_SPECIAL_FLAGS: &[&str] = &[
    "-version",
    "-encoders",
    "-decoders",
    "-hwaccels",
    "-filters",
    "-h",
    "-muxers",
    "-fp_format",
];

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Program-wide settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgramConfig {
    /// Directory receiving the daily log files
    #[serde(default = "default_log_dir")]
    pub log: PathBuf,
    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/jellyfin")
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            log: default_log_dir(),
            debug: false,
        }
    }
}

/// Runtime directories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectoriesConfig {
    /// Directory for remote shell control sockets
    #[serde(default = "default_persist_dir")]
    pub persist: PathBuf,
}

fn default_persist_dir() -> PathBuf {
    PathBuf::from("/run/shm")
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            persist: default_persist_dir(),
        }
    }
}

/// Remote shell transport settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    /// User to log in as on the worker hosts (empty = transport default)
    #[serde(default = "default_remote_user")]
    pub user: String,
    /// Seconds a multiplexed connection stays open (0 disables multiplexing)
    #[serde(default = "default_remote_persist")]
    pub persist: u64,
    /// Extra arguments handed to the remote shell binary
    #[serde(default = "default_remote_args")]
    pub args: Vec<String>,
}

fn default_remote_user() -> String {
    "jellyfin".to_string()
}

fn default_remote_persist() -> u64 {
    300
}

fn default_remote_args() -> Vec<String> {
    vec![
        "-i".to_string(),
        "/var/lib/rffmpeg/.ssh/id_ed25519".to_string(),
    ]
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            user: default_remote_user(),
            persist: default_remote_persist(),
            args: default_remote_args(),
        }
    }
}

/// Binaries and command composition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandsConfig {
    /// Remote shell binary
    #[serde(default = "default_ssh")]
    pub ssh: String,
    /// Tokens placed in front of the remote shell invocation
    #[serde(default)]
    pub pre: Vec<String>,
    /// ffmpeg path on the worker hosts
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    /// ffprobe path on the worker hosts
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    /// Local ffmpeg used for fallback and special flags
    #[serde(default = "default_ffmpeg")]
    pub fallback_ffmpeg: String,
    /// Local ffprobe used for fallback and special flags
    #[serde(default = "default_ffprobe")]
    pub fallback_ffprobe: String,
    /// Additional flags that force local execution
    #[serde(default)]
    pub special_flags: Vec<String>,
}

fn default_ssh() -> String {
    "/usr/bin/ssh".to_string()
}

fn default_ffmpeg() -> String {
    "/usr/lib/jellyfin-ffmpeg/ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "/usr/lib/jellyfin-ffmpeg/ffprobe".to_string()
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            ssh: default_ssh(),
            pre: Vec::new(),
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            fallback_ffmpeg: default_ffmpeg(),
            fallback_ffprobe: default_ffprobe(),
            special_flags: Vec::new(),
        }
    }
}

impl CommandsConfig {
    /// Configured special flags followed by the built-in set, without duplicates
    pub fn effective_special_flags(&self) -> Vec<String> {
        let mut flags = self.special_flags.clone();
        for flag in DEFAULT_SPECIAL_FLAGS {
            if !flags.iter().any(|f| f == flag) {
                flags.push(flag.to_string());
            }
        }
        flags
    }
}

/// Database location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Directory holding the database file
    #[serde(default = "default_database_dir")]
    pub path: PathBuf,
}

fn default_database_dir() -> PathBuf {
    PathBuf::from("/var/lib/rffmpeg")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_dir(),
        }
    }
}

impl DatabaseConfig {
    /// Full path of the SQLite database file
    pub fn file_path(&self) -> PathBuf {
        self.path.join(DATABASE_FILE_NAME)
    }
}

/// Host selection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectorConfig {
    /// How long a `dead` state keeps a host out of rotation (0 = until cleared)
    #[serde(default = "default_dead_window_secs")]
    pub dead_window_secs: u64,
}

fn default_dead_window_secs() -> u64 {
    300
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            dead_window_secs: default_dead_window_secs(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub program: ProgramConfig,
    #[serde(default)]
    pub directories: DirectoriesConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
}

/// Split a list-valued environment variable on whitespace
fn env_list(val: &str) -> Vec<String> {
    val.split_whitespace().map(str::to_string).collect()
}

fn env_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Every variable is named `RFFMPEG_<SECTION>_<FIELD>`. Values that fail to
    /// parse are ignored and the existing value is kept. List values are
    /// whitespace-separated.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RFFMPEG_PROGRAM_LOG") {
            self.program.log = PathBuf::from(val);
        }
        if let Ok(val) = env::var("RFFMPEG_PROGRAM_DEBUG") {
            if let Some(debug) = env_bool(&val) {
                self.program.debug = debug;
            }
        }

        if let Ok(val) = env::var("RFFMPEG_DIRECTORIES_PERSIST") {
            self.directories.persist = PathBuf::from(val);
        }

        if let Ok(val) = env::var("RFFMPEG_REMOTE_USER") {
            self.remote.user = val;
        }
        if let Ok(val) = env::var("RFFMPEG_REMOTE_PERSIST") {
            if let Ok(secs) = val.parse::<u64>() {
                self.remote.persist = secs;
            }
        }
        if let Ok(val) = env::var("RFFMPEG_REMOTE_ARGS") {
            self.remote.args = env_list(&val);
        }

        if let Ok(val) = env::var("RFFMPEG_COMMANDS_SSH") {
            self.commands.ssh = val;
        }
        if let Ok(val) = env::var("RFFMPEG_COMMANDS_PRE") {
            self.commands.pre = env_list(&val);
        }
        if let Ok(val) = env::var("RFFMPEG_COMMANDS_FFMPEG") {
            self.commands.ffmpeg = val;
        }
        if let Ok(val) = env::var("RFFMPEG_COMMANDS_FFPROBE") {
            self.commands.ffprobe = val;
        }
        if let Ok(val) = env::var("RFFMPEG_COMMANDS_FALLBACK_FFMPEG") {
            self.commands.fallback_ffmpeg = val;
        }
        if let Ok(val) = env::var("RFFMPEG_COMMANDS_FALLBACK_FFPROBE") {
            self.commands.fallback_ffprobe = val;
        }
        if let Ok(val) = env::var("RFFMPEG_COMMANDS_SPECIAL_FLAGS") {
            self.commands.special_flags = env_list(&val);
        }

        if let Ok(val) = env::var("RFFMPEG_DATABASE_PATH") {
            self.database.path = PathBuf::from(val);
        }

        if let Ok(val) = env::var("RFFMPEG_SELECTOR_DEAD_WINDOW_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.selector.dead_window_secs = secs;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Configuration file location, honouring `RFFMPEG_CONFIG`
    pub fn default_path() -> PathBuf {
        env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}
