pub mod history;
pub mod push;
pub mod rooms;

use serde::{Deserialize, Serialize};

/// Room admission settings. Exposed in `push-hub.toml` under `[rooms]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomsConfig {
    /// Only admit clients into rooms they are a recorded member of
    #[serde(default)]
    pub enforce_membership: bool,
}

/// Message history settings. Exposed in `push-hub.toml` under `[history]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Persist messages ingested through `POST /api/push` (default: true)
    #[serde(default = "default_history_enabled")]
    pub enabled: bool,

    /// Page size when the request does not give one (default: 50)
    #[serde(default = "default_page_size")]
    pub default_limit: u32,

    /// Largest page a request may ask for (default: 100)
    #[serde(default = "default_max_page_size")]
    pub max_limit: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: default_history_enabled(),
            default_limit: default_page_size(),
            max_limit: default_max_page_size(),
        }
    }
}

fn default_history_enabled() -> bool {
    true
}

fn default_page_size() -> u32 {
    50
}

fn default_max_page_size() -> u32 {
    100
}
