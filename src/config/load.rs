use super::{default_global_config_path, ConfigError, Settings};
use std::path::Path;

/// Reads and validates the settings file at `path`.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let settings = Settings::from_path(path)?;
    settings.validate()?;
    Ok(settings)
}

/// Loads `$HOME/.tasking/config.yaml`; a missing file yields the defaults.
pub fn load_global_settings() -> Result<Settings, ConfigError> {
    let path = default_global_config_path()?;
    if !path.exists() {
        return Ok(Settings::default());
    }
    load_settings(&path)
}
