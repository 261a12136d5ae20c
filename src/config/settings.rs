use serde::Deserialize;

use crate::broker::exchange::ExchangeKind;

/// Top-level configuration settings for the broker.
///
/// Includes operational limits, persistence, logging, and the topology
/// installed at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub log: LogSettings,
    pub broker: BrokerSettings,
    pub persistence: PersistenceSettings,
    pub topology: TopologySettings,
}

/// Logging configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Operational parameters of the routing core.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Backlog cap applied to queues declared without an explicit
    /// `max_length`. `None` leaves such queues unbounded.
    pub default_max_queue_length: Option<usize>,
    /// Redeliveries allowed per message before it is dropped.
    pub max_redeliveries: u32,
}

/// Durability configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub path: String,
}

/// Exchanges, queues and bindings declared at startup.
///
/// The sections are additive and idempotent, so the same topology can be
/// shipped in configuration for every run.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TopologySettings {
    #[serde(default)]
    pub exchanges: Vec<ExchangeSpec>,
    #[serde(default)]
    pub queues: Vec<QueueSpec>,
    #[serde(default)]
    pub bindings: Vec<BindingSpec>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default)]
    pub durable: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueSpec {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub max_length: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BindingSpec {
    pub exchange: String,
    pub queue: String,
    #[serde(default)]
    pub pattern: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled
/// using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub log: Option<PartialLogSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub topology: Option<TopologySettings>,
}

/// Partial logging settings.
#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

/// Partial broker settings.
#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub default_max_queue_length: Option<usize>,
    pub max_redeliveries: Option<u32>,
}

/// Partial persistence settings.
#[derive(Debug, Deserialize)]
pub struct PartialPersistenceSettings {
    pub enabled: Option<bool>,
    pub path: Option<String>,
}

/// Provides default values for `Settings`.
///
/// Ensures the broker has sensible defaults if no configuration is
/// provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            log: LogSettings {
                level: "info".to_string(),
            },
            broker: BrokerSettings::default(),
            persistence: PersistenceSettings {
                enabled: false,
                path: "switchyard_db".to_string(),
            },
            topology: TopologySettings::default(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            default_max_queue_length: None,
            max_redeliveries: 5,
        }
    }
}
