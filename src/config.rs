use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    Test,
    Live,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub mode: GatewayMode,
    pub api_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub currency: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            mode: GatewayMode::Test,
            api_key: None,
            webhook_secret: None,
            currency: "EUR".to_string(),
        }
    }
}

// Credentials never reach the logs
impl fmt::Debug for GatewaySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |secret: &Option<String>| secret.as_ref().map(|_| "***");
        f.debug_struct("GatewaySettings")
            .field("mode", &self.mode)
            .field("api_key", &redact(&self.api_key))
            .field("webhook_secret", &redact(&self.webhook_secret))
            .field("currency", &self.currency)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySettings {
    pub cancellation_cutoff_hours: i64,
    pub hold_lifetime_minutes: i64,
    pub sweep_interval_secs: u64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            cancellation_cutoff_hours: 24,
            hold_lifetime_minutes: 15,
            sweep_interval_secs: 30,
        }
    }
}

impl PolicySettings {
    pub fn cancellation_cutoff(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cancellation_cutoff_hours)
    }

    pub fn hold_lifetime(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.hold_lifetime_minutes)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    RocksDb,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub state_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            state_dir: "/tmp/box-office".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let preset = RetryConfig::payment_gateway();
        Self {
            max_attempts: preset.max_attempts,
            initial_delay_ms: preset.initial_delay.as_millis() as u64,
            max_delay_ms: preset.max_delay.as_millis() as u64,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::with_delays(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Everything the engine and its hosting service read at start-up.
///
/// Built once and passed into constructors; nothing reads it globally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub gateway: GatewaySettings,
    pub policy: PolicySettings,
    pub storage: StorageSettings,
    pub retry: RetrySettings,
}
