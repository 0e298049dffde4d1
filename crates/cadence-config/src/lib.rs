//! Configuration for the cadence audio server.
//!
//! - **Server config**: [`ServerConfig`] read from and written to TOML
//! - **Validation**: range checks run before a server is built from a config
//! - **Paths**: platform-specific config and driver-library directories
//!
//! # Example
//!
//! ```rust,no_run
//! use cadence_config::{ServerConfig, default_config_path};
//!
//! let config = ServerConfig::load(default_config_path()).unwrap_or_default();
//! config.validate().unwrap();
//! let settings = config.engine_settings();
//! ```

mod error;
mod server_config;

/// Platform-specific paths.
pub mod paths;

/// Configuration validation.
pub mod validation;

pub use error::ConfigError;
pub use paths::{default_config_path, user_config_dir, user_drivers_dir};
pub use server_config::{DriverConfig, ServerConfig};
pub use validation::{ValidationError, validate_buffer_size, validate_server_name};
