use crate::config::{GatewayMode, Settings, StorageBackend};
use crate::{BoxOfficeError, Result};
use config::{Config, Environment};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

/// Prefix of environment overrides, e.g. `BOX_OFFICE__GATEWAY__MODE=live`
pub const ENV_PREFIX: &str = "BOX_OFFICE";

/// Parse a Java properties file into Settings, starting from the defaults
pub fn parse_properties_file<P: AsRef<Path>>(path: P) -> Result<Settings> {
    merge_properties(Settings::default(), path)
}

/// Apply a properties file over existing settings
pub fn merge_properties<P: AsRef<Path>>(mut settings: Settings, path: P) -> Result<Settings> {
    let properties = read_properties(&path)?;
    debug!("Read {} properties from {:?}", properties.len(), path.as_ref());

    for (key, value) in properties {
        let value = value.trim().to_string();
        match key.as_str() {
            "gateway.mode" => settings.gateway.mode = parse_mode(&key, &value)?,
            "gateway.api.key" => settings.gateway.api_key = Some(value),
            "gateway.webhook.secret" => settings.gateway.webhook_secret = Some(value),
            "gateway.currency" => settings.gateway.currency = value.to_uppercase(),
            "policy.cancellation.cutoff.hours" => {
                settings.policy.cancellation_cutoff_hours = parse_number(&key, &value)?
            }
            "policy.hold.lifetime.minutes" => {
                settings.policy.hold_lifetime_minutes = parse_number(&key, &value)?
            }
            "policy.sweep.interval.secs" => {
                settings.policy.sweep_interval_secs = parse_number(&key, &value)?
            }
            "storage.backend" => settings.storage.backend = parse_backend(&key, &value)?,
            "storage.state.dir" => settings.storage.state_dir = value,
            "retry.max.attempts" => settings.retry.max_attempts = parse_number(&key, &value)?,
            "retry.initial.delay.ms" => {
                settings.retry.initial_delay_ms = parse_number(&key, &value)?
            }
            "retry.max.delay.ms" => settings.retry.max_delay_ms = parse_number(&key, &value)?,
            _ => warn!("Ignoring unknown property '{}'", key),
        }
    }

    validate(&settings)?;
    Ok(settings)
}

/// Overlay `BOX_OFFICE__SECTION__FIELD` environment variables
pub fn apply_env_overrides(settings: Settings) -> Result<Settings> {
    apply_overrides(settings, Environment::with_prefix(ENV_PREFIX).separator("__"))
}

pub fn apply_overrides(settings: Settings, environment: Environment) -> Result<Settings> {
    let merged: Settings = Config::builder()
        .add_source(Config::try_from(&settings)?)
        .add_source(environment.try_parsing(true))
        .build()?
        .try_deserialize()?;

    validate(&merged)?;
    Ok(merged)
}

/// Properties file (optional) then environment, over the defaults
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let settings = match path {
        Some(path) => parse_properties_file(path)?,
        None => Settings::default(),
    };
    apply_env_overrides(settings)
}

fn read_properties<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>> {
    let file = File::open(&path).map_err(|e| {
        BoxOfficeError::InvalidArgument(format!(
            "Failed to open config file {:?}: {}",
            path.as_ref(),
            e
        ))
    })?;

    java_properties::read(BufReader::new(file))
        .map_err(|e| BoxOfficeError::InvalidArgument(format!("Failed to parse properties: {}", e)))
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        BoxOfficeError::InvalidArgument(format!("Property '{}' is not a number: '{}'", key, value))
    })
}

fn parse_mode(key: &str, value: &str) -> Result<GatewayMode> {
    match value.to_lowercase().as_str() {
        "test" => Ok(GatewayMode::Test),
        "live" => Ok(GatewayMode::Live),
        _ => Err(BoxOfficeError::InvalidArgument(format!(
            "Property '{}' must be 'test' or 'live', got '{}'",
            key, value
        ))),
    }
}

fn parse_backend(key: &str, value: &str) -> Result<StorageBackend> {
    match value.to_lowercase().as_str() {
        "memory" => Ok(StorageBackend::Memory),
        "rocksdb" => Ok(StorageBackend::RocksDb),
        _ => Err(BoxOfficeError::InvalidArgument(format!(
            "Property '{}' must be 'memory' or 'rocksdb', got '{}'",
            key, value
        ))),
    }
}

fn validate(settings: &Settings) -> Result<()> {
    if settings.policy.cancellation_cutoff_hours < 0 {
        return Err(BoxOfficeError::InvalidArgument(
            "cancellation cutoff cannot be negative".to_string(),
        ));
    }
    if settings.policy.hold_lifetime_minutes <= 0 {
        return Err(BoxOfficeError::InvalidArgument(
            "hold lifetime must be positive".to_string(),
        ));
    }
    if settings.retry.max_attempts == 0 {
        return Err(BoxOfficeError::InvalidArgument(
            "retry.max.attempts must be at least 1".to_string(),
        ));
    }
    if settings.gateway.mode == GatewayMode::Live && settings.gateway.api_key.is_none() {
        return Err(BoxOfficeError::InvalidArgument(
            "live gateway mode requires gateway.api.key".to_string(),
        ));
    }
    Ok(())
}
