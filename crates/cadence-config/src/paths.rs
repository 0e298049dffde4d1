//! Platform-specific configuration paths.
//!
//! - **User config**: `~/.config/cadence/` (Linux), `~/Library/Application Support/cadence/` (macOS), `%APPDATA%\cadence\` (Windows)
//! - **Driver libraries**: `<user config>/drivers/`

use std::path::PathBuf;

/// Application name used for directory paths.
const APP_NAME: &str = "cadence";

/// Default configuration file name.
const CONFIG_FILE: &str = "cadenced.toml";

/// Subdirectory searched for driver libraries.
const DRIVERS_SUBDIR: &str = "drivers";

/// Returns the user-specific configuration directory.
///
/// Returns a fallback path if the config directory cannot be determined.
pub fn user_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Returns the default server configuration file.
pub fn default_config_path() -> PathBuf {
    user_config_dir().join(CONFIG_FILE)
}

/// Returns the user directory searched for driver libraries.
pub fn user_drivers_dir() -> PathBuf {
    user_config_dir().join(DRIVERS_SUBDIR)
}
