use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::chat::{HistoryConfig, RoomsConfig};
use crate::hub::HubConfig;
use crate::longpoll::LongPollConfig;
use crate::routes::CorsConfig;
use crate::sync::SyncConfig;
use crate::ws::SocketConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where presence, history and room membership are kept.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

/// Command line flags. Only flags given on the command line (or through
/// their env var) are layered over the file configuration.
#[derive(Parser, Serialize, Debug)]
#[command(name = "push-hub-server", version, about = "Real-time message push hub")]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "PUSH_HUB_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,

    /// Bind address
    #[arg(long, env = "PUSH_HUB_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./push-hub.toml")]
    config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "PUSH_HUB_JSON_LOGS")]
    #[serde(skip_serializing_if = "is_false")]
    json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip_serializing_if = "is_false")]
    generate_config: bool,

    /// Data directory for the SQLite database
    #[arg(long, env = "PUSH_HUB_DATA_DIR")]
    #[serde(skip_serializing_if = "Option::is_none")]
    data_dir: Option<String>,

    /// Storage backend for presence, history and room membership
    #[arg(long, env = "PUSH_HUB_STORAGE", value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    storage: Option<StorageBackend>,

    /// Identity of this instance in the fleet (generated when unset)
    #[arg(long, env = "PUSH_HUB_INSTANCE_ID")]
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_id: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Push hub configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub config: String,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default)]
    pub generate_config: bool,
    pub data_dir: String,
    pub storage: StorageBackend,
    /// Generated as `instance-<16 hex>` at startup when unset
    #[serde(default)]
    pub instance_id: Option<String>,

    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub longpoll: LongPollConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub rooms: RoomsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: "./push-hub.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            storage: StorageBackend::Sqlite,
            instance_id: None,
            hub: HubConfig::default(),
            socket: SocketConfig::default(),
            longpoll: LongPollConfig::default(),
            sync: SyncConfig::default(),
            rooms: RoomsConfig::default(),
            history: HistoryConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (PUSH_HUB_*) < CLI args
    ///
    /// Nested keys use a double underscore in env vars, e.g.
    /// `PUSH_HUB_SYNC__GROUP_ID`.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = Cli::parse();
        let config = Self::figment(&cli.config)
            .merge(Serialized::defaults(&cli))
            .extract()
            .map_err(Box::new)?;
        Self::validated(config)
    }

    /// Defaults, then the TOML file at `path`, then the environment.
    pub fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PUSH_HUB_").split("__"))
    }

    fn validated(config: Self) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timings = [
            ("socket.read_deadline_secs", self.socket.read_deadline_secs),
            ("socket.ping_interval_secs", self.socket.ping_interval_secs),
            ("socket.write_wait_secs", self.socket.write_wait_secs),
        ];
        for (name, secs) in timings {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.socket.ping_interval_secs >= self.socket.read_deadline_secs {
            return Err(ConfigError::Invalid(format!(
                "socket.ping_interval_secs ({}) must be below socket.read_deadline_secs ({})",
                self.socket.ping_interval_secs, self.socket.read_deadline_secs
            )));
        }
        if self.socket.send_buffer == 0 {
            return Err(ConfigError::Invalid("socket.send_buffer must be positive".to_string()));
        }
        if self.hub.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid("hub.broadcast_capacity must be positive".to_string()));
        }
        if self.longpoll.timeout_secs == 0 {
            return Err(ConfigError::Invalid("longpoll.timeout_secs must be positive".to_string()));
        }
        if self.sync.partitions == 0 {
            return Err(ConfigError::Invalid("sync.partitions must be positive".to_string()));
        }
        if self.cors.allow_credentials && self.cors.allows_any_origin() {
            return Err(ConfigError::Invalid(
                "cors.allow_credentials needs explicit cors.allowed_origins".to_string(),
            ));
        }
        let invalid = self.cors.invalid_origins();
        if !invalid.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "cors.allowed_origins has invalid entries: {}",
                invalid.join(", ")
            )));
        }
        Ok(())
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Push Hub Server Configuration
# Place this file at ./push-hub.toml or specify with --config <path>
# All settings can be overridden via environment variables (PUSH_HUB_PORT,
# PUSH_HUB_SYNC__GROUP_ID, etc.) or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database
# data_dir = "./data"

# Storage for presence, history and room membership: "sqlite" or "memory"
# storage = "sqlite"

# Identity of this instance in the fleet. Generated when unset.
# instance_id = "instance-0123456789abcdef"

# ---- Hub ----
# [hub]
# broadcast_capacity = 256     # Messages waiting for the routing loop
# announce_presence = true     # Send "presence" messages to local clients

# ---- WebSocket ----
# [socket]
# send_buffer = 256            # Outbound queue per client
# read_deadline_secs = 60      # Close when nothing is read for this long
# ping_interval_secs = 54      # Must be below read_deadline_secs
# write_wait_secs = 10         # Upper bound on one frame write
# max_frame_bytes = 524288     # 512 KiB

# ---- Long-poll ----
# [longpoll]
# timeout_secs = 30

# ---- Cross-instance sync ----
# [sync]
# enabled = true
# backend = "memory"           # "memory" or "kafka" (needs the kafka feature)
# brokers = ["localhost:9092"]
# group_id = "push-hub"        # Use a distinct group per instance for full fan-out
# partitions = 8               # Memory backend only
# producer_queue = 1024
# publish_retries = 5
# publish_timeout_ms = 5000
# retry_backoff_ms = 100
#
# [sync.topics]
# user = "user_messages"
# room = "room_messages"
# system = "system_messages"
# presence = "online_status"

# ---- Rooms ----
# [rooms]
# enforce_membership = false   # Refuse clients that are not room members

# ---- History ----
# [history]
# enabled = true               # Persist messages pushed through /api/push
# default_limit = 50
# max_limit = 100

# ---- CORS ----
# [cors]
# allowed_origins = ["*"]      # Or explicit origins, e.g. ["https://app.example.com"]
# allow_credentials = false    # Needs explicit origins
# max_age_secs = 43200         # Preflight cache, 12 hours
"#
    .to_string()
}
