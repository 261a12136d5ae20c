pub mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BindingSpec, BrokerSettings, ExchangeSpec, LogSettings, PersistenceSettings, QueueSpec,
    Settings, TopologySettings,
};

/// Loads the configuration from the default file and environment variables.
/// Merges the configuration with default values.
/// Returns a `Settings` struct covering logging, broker limits, persistence
/// and the startup topology.
pub fn load_config() -> Result<Settings, ConfigError> {
    dotenvy::dotenv().ok();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default().separator("_"));

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    Ok(Settings {
        log: LogSettings {
            level: partial
                .log
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.log.level),
        },
        broker: BrokerSettings {
            default_max_queue_length: partial
                .broker
                .as_ref()
                .and_then(|b| b.default_max_queue_length)
                .or(default.broker.default_max_queue_length),
            max_redeliveries: partial
                .broker
                .as_ref()
                .and_then(|b| b.max_redeliveries)
                .unwrap_or(default.broker.max_redeliveries),
        },
        persistence: PersistenceSettings {
            enabled: partial
                .persistence
                .as_ref()
                .and_then(|p| p.enabled)
                .unwrap_or(default.persistence.enabled),
            path: partial
                .persistence
                .as_ref()
                .and_then(|p| p.path.clone())
                .unwrap_or(default.persistence.path),
        },
        topology: partial.topology.unwrap_or(default.topology),
    })
}

#[cfg(test)]
mod tests;
