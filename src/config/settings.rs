use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::RouteTable;
use crate::persistence::ArchiveLimits;
use crate::transport::RetryPolicy;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub bus: BusSettings,
    pub archive: ArchiveSettings,
    pub delivery: DeliverySettings,
    pub metrics: MetricsSettings,
    pub log: LogSettings,
    /// Publisher id to receiver ids, used to seed the router at start-up.
    pub routes: RouteTable,
}

/// Address the WebSocket server binds to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BusSettings {
    /// Root of the on-disk state; broker and archives live under `messages/`.
    pub disk_directory: PathBuf,
    pub speed_interval_secs: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ArchiveSettings {
    pub max_file_bytes: u64,
    pub max_records_per_file: u64,
    pub memory_floor_bytes: u64,
}

/// Retry behaviour of pushes over live sockets.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeliverySettings {
    pub sweep_interval_secs: u64,
    pub retry_timeout_secs: u64,
    pub max_tries: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MetricsSettings {
    /// Prometheus listen address; no exporter is installed when unset.
    pub listen: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

impl BusSettings {
    pub fn speed_interval(&self) -> Duration {
        Duration::from_secs(self.speed_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

impl ArchiveSettings {
    pub fn limits(&self) -> ArchiveLimits {
        ArchiveLimits {
            max_file_bytes: self.max_file_bytes,
            max_records_per_file: self.max_records_per_file,
            memory_floor_bytes: self.memory_floor_bytes,
        }
    }
}

impl DeliverySettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_timeout: Duration::from_secs(self.retry_timeout_secs),
            max_tries: self.max_tries,
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Every value is optional; missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub bus: Option<PartialBusSettings>,
    pub archive: Option<PartialArchiveSettings>,
    pub delivery: Option<PartialDeliverySettings>,
    pub metrics: Option<PartialMetricsSettings>,
    pub log: Option<PartialLogSettings>,
    pub routes: Option<HashMap<String, Vec<String>>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBusSettings {
    pub disk_directory: Option<PathBuf>,
    pub speed_interval_secs: Option<u64>,
    pub health_check_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialArchiveSettings {
    pub max_file_bytes: Option<u64>,
    pub max_records_per_file: Option<u64>,
    pub memory_floor_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialDeliverySettings {
    pub sweep_interval_secs: Option<u64>,
    pub retry_timeout_secs: Option<u64>,
    pub max_tries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialMetricsSettings {
    pub listen: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Fill every missing value from `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let bus = self.bus.unwrap_or_default();
        let archive = self.archive.unwrap_or_default();
        let delivery = self.delivery.unwrap_or_default();
        let metrics = self.metrics.unwrap_or_default();
        let log = self.log.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(defaults.server.host),
                port: server.port.unwrap_or(defaults.server.port),
            },
            bus: BusSettings {
                disk_directory: bus.disk_directory.unwrap_or(defaults.bus.disk_directory),
                speed_interval_secs: bus
                    .speed_interval_secs
                    .unwrap_or(defaults.bus.speed_interval_secs),
                health_check_interval_secs: bus
                    .health_check_interval_secs
                    .unwrap_or(defaults.bus.health_check_interval_secs),
            },
            archive: ArchiveSettings {
                max_file_bytes: archive
                    .max_file_bytes
                    .unwrap_or(defaults.archive.max_file_bytes),
                max_records_per_file: archive
                    .max_records_per_file
                    .unwrap_or(defaults.archive.max_records_per_file),
                memory_floor_bytes: archive
                    .memory_floor_bytes
                    .unwrap_or(defaults.archive.memory_floor_bytes),
            },
            delivery: DeliverySettings {
                sweep_interval_secs: delivery
                    .sweep_interval_secs
                    .unwrap_or(defaults.delivery.sweep_interval_secs),
                retry_timeout_secs: delivery
                    .retry_timeout_secs
                    .unwrap_or(defaults.delivery.retry_timeout_secs),
                max_tries: delivery.max_tries.unwrap_or(defaults.delivery.max_tries),
            },
            metrics: MetricsSettings {
                listen: metrics.listen.or(defaults.metrics.listen),
            },
            log: LogSettings {
                level: log.level.unwrap_or(defaults.log.level),
            },
            routes: self.routes.unwrap_or(defaults.routes),
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        let limits = ArchiveLimits::default();
        let policy = RetryPolicy::default();
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 54321,
            },
            bus: BusSettings {
                disk_directory: PathBuf::from("/var/lib/edgebus"),
                speed_interval_secs: 5,
                health_check_interval_secs: 5,
            },
            archive: ArchiveSettings {
                max_file_bytes: limits.max_file_bytes,
                max_records_per_file: limits.max_records_per_file,
                memory_floor_bytes: limits.memory_floor_bytes,
            },
            delivery: DeliverySettings {
                sweep_interval_secs: 10,
                retry_timeout_secs: policy.retry_timeout.as_secs(),
                max_tries: policy.max_tries,
            },
            metrics: MetricsSettings { listen: None },
            log: LogSettings {
                level: "info".to_string(),
            },
            routes: RouteTable::new(),
        }
    }
}
