mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{
    ArchiveSettings, BusSettings, DeliverySettings, LogSettings, MetricsSettings, ServerSettings,
    Settings,
};

/// Environment variable prefix, e.g. `EDGEBUS__SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "EDGEBUS";

/// Loads `config/default.toml` (if present) and `EDGEBUS__*` environment
/// variables, merged over `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Like [`load_config`] with an explicit file (extension optional).
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let name = path.as_ref().to_string_lossy().into_owned();
    let config = Config::builder()
        .add_source(File::with_name(&name).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}
