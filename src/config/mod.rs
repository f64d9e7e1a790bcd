mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BrokerSettings, LogSettings, PersistenceSettings, ServerSettings, Settings};

/// Prefix of environment overrides, e.g. `MQTTD_SERVER__PORT=1884`.
pub const ENV_PREFIX: &str = "MQTTD";

/// Loads the configuration from `config/default`, then the optional file at
/// `path`, then `MQTTD_*` environment variables.
///
/// Later sources win. Anything left unset falls back to `Settings::default()`.
pub fn load_config(path: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder =
        Config::builder().add_source(File::with_name("config/default").required(false));

    if let Some(path) = path {
        builder = builder.add_source(File::with_name(path));
    }

    let config = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge_with_defaults())
}
