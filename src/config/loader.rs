//! ConfigLoader: layers configuration sources and deserializes to [`AppConfig`].

use super::AppConfig;
use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Global configuration file (`<config dir>/filebundle/config.toml`)
    pub fn global_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "filebundle", "filebundle")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load configuration.
    /// Precedence: defaults (lowest) -> global file -> explicit file -> environment (highest).
    pub fn load(explicit: Option<&Path>) -> Result<AppConfig, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(global) = Self::global_config_path() {
            builder = add_file(builder, &global, false)?;
        }
        if let Some(path) = explicit {
            builder = add_file(builder, path, true)?;
        }
        let builder = add_environment(builder, "FILEBUNDLE");

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load configuration from a specific file with environment overlay.
    pub fn load_from_file(path: &Path) -> Result<AppConfig, ConfigError> {
        let builder = add_file(config::Config::builder(), path, true)?;
        let builder = add_environment(builder, "FILEBUNDLE");
        builder.build()?.try_deserialize()
    }

    /// Create default configuration.
    pub fn default() -> AppConfig {
        AppConfig::default()
    }
}

fn add_file(
    builder: ConfigBuilder<DefaultState>,
    path: &Path,
    required: bool,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let name = path.to_str().ok_or_else(|| {
        ConfigError::Message(format!("Config path is not valid UTF-8: {}", path.display()))
    })?;
    Ok(builder.add_source(
        File::new(name, FileFormat::Toml).required(required),
    ))
}

/// Environment overlay: `PREFIX__SECTION__KEY`
fn add_environment(
    builder: ConfigBuilder<DefaultState>,
    prefix: &str,
) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix(prefix)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    )
}
