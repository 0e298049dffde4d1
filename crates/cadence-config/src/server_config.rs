//! Server configuration file.

use crate::ConfigError;
use crate::validation::{
    MAX_LOOPBACK_CHANNELS, ValidationError, validate_buffer_size, validate_server_name,
};
use cadence_core::{
    DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLE_RATE, DriverParam, EngineSettings, ParamValue,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Clock-source driver selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Registry name of the audio driver.
    pub name: String,
    /// Parameters passed to the driver, by long or short name.
    pub params: BTreeMap<String, ParamValue>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        let mut params = BTreeMap::new();
        params.insert(
            "rate".to_string(),
            ParamValue::UInt(u64::from(DEFAULT_SAMPLE_RATE)),
        );
        params.insert(
            "period".to_string(),
            ParamValue::UInt(u64::from(DEFAULT_BUFFER_SIZE)),
        );
        params.insert("capture".to_string(), ParamValue::UInt(2));
        params.insert("playback".to_string(), ParamValue::UInt(2));
        Self {
            name: "dummy".to_string(),
            params,
        }
    }
}

impl DriverConfig {
    /// Creates a driver selection with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Sets a parameter (builder pattern).
    pub fn with_param(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    /// Integer value of the first of `names` present.
    fn uint(&self, names: &[&str]) -> Option<u32> {
        let value = names.iter().find_map(|n| self.params.get(*n))?;
        match value {
            ParamValue::Int(i) => u32::try_from(*i).ok(),
            ParamValue::UInt(u) => u32::try_from(*u).ok(),
            ParamValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Complete configuration of one server instance.
///
/// # TOML Format
///
/// ```toml
/// name = "default"
/// timeout_ms = 500
/// realtime = true
/// priority = 10
/// loopback = 0
///
/// [driver]
/// name = "dummy"
///
/// [driver.params]
/// rate = 48000
/// period = 1024
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server name, used by the control channel.
    pub name: String,
    /// Synchronous mode.
    pub sync: bool,
    /// Exit when the last client leaves.
    pub temporary: bool,
    /// Client timeout inside one cycle, in milliseconds.
    pub timeout_ms: u64,
    /// Realtime scheduling for the cycle thread.
    pub realtime: bool,
    /// Realtime priority.
    pub priority: i32,
    /// Loopback channel count; 0 disables the loopback driver.
    pub loopback: u32,
    /// Verbose logging.
    pub verbose: bool,
    /// Extra directories searched for driver and internal client libraries.
    pub module_dirs: Vec<PathBuf>,
    /// Audio driver selection.
    pub driver: DriverConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let engine = EngineSettings::default();
        Self {
            name: engine.server_name,
            sync: engine.sync,
            temporary: engine.temporary,
            timeout_ms: 500,
            realtime: engine.real_time,
            priority: engine.priority,
            loopback: 0,
            verbose: engine.verbose,
            module_dirs: Vec::new(),
            driver: DriverConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load a configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Save the configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))?;
        Ok(())
    }

    /// Convert the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Buffer size requested from the driver (`period` or `p`), or the default.
    pub fn buffer_size(&self) -> u32 {
        self.driver
            .uint(&["period", "p"])
            .unwrap_or(DEFAULT_BUFFER_SIZE)
    }

    /// Sample rate requested from the driver (`rate` or `r`), or the default.
    pub fn sample_rate(&self) -> u32 {
        self.driver.uint(&["rate", "r"]).unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    /// Client timeout as a duration.
    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Checks every field a server relies on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_server_name(&self.name)?;
        if self.driver.name.is_empty() {
            return Err(ValidationError::DriverName);
        }
        validate_buffer_size(self.buffer_size())?;
        if self.sample_rate() == 0 {
            return Err(ValidationError::SampleRate);
        }
        if self.timeout_ms == 0 {
            return Err(ValidationError::Timeout);
        }
        if self.realtime && !(1..=99).contains(&self.priority) {
            return Err(ValidationError::Priority(self.priority));
        }
        if self.loopback > MAX_LOOPBACK_CHANNELS {
            return Err(ValidationError::Loopback(self.loopback));
        }
        Ok(())
    }

    /// Loads a file and validates it.
    pub fn load_validated(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Engine Control settings derived from this configuration.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            server_name: self.name.clone(),
            sync: self.sync,
            temporary: self.temporary,
            client_timeout: self.client_timeout(),
            real_time: self.realtime,
            priority: self.priority,
            verbose: self.verbose,
            buffer_size: self.buffer_size(),
            sample_rate: self.sample_rate(),
        }
    }

    /// Driver parameters in the form the driver registry accepts.
    pub fn driver_params(&self) -> Vec<DriverParam> {
        self.driver
            .params
            .iter()
            .map(|(name, value)| DriverParam::new(name.clone(), value.clone()))
            .collect()
    }
}
