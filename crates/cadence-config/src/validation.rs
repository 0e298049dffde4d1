//! Checks applied to a [`ServerConfig`](crate::ServerConfig) before the server uses it.

use thiserror::Error;

/// Longest server name, in bytes.
pub const MAX_SERVER_NAME: usize = 64;

/// Largest loopback channel count.
pub const MAX_LOOPBACK_CHANNELS: u32 = 256;

/// Smallest accepted buffer size.
pub const MIN_BUFFER_SIZE: u32 = 16;

/// Validation error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Buffer size is not a power of two within range.
    #[error("buffer size {0} must be a power of two between 16 and 8192")]
    BufferSize(u32),

    /// Sample rate is zero.
    #[error("sample rate must be positive")]
    SampleRate,

    /// Client timeout is zero.
    #[error("client timeout must be positive")]
    Timeout,

    /// Realtime priority out of range.
    #[error("realtime priority {0} must be between 1 and 99")]
    Priority(i32),

    /// Server name is empty or too long.
    #[error("server name '{0}' must be 1 to 64 bytes")]
    Name(String),

    /// Too many loopback channels.
    #[error("loopback channel count {0} exceeds 256")]
    Loopback(u32),

    /// Driver name is empty.
    #[error("driver name must not be empty")]
    DriverName,
}

/// Checks a buffer size.
pub fn validate_buffer_size(frames: u32) -> Result<(), ValidationError> {
    if frames.is_power_of_two()
        && (MIN_BUFFER_SIZE..=cadence_core::MAX_BUFFER_SIZE).contains(&frames)
    {
        Ok(())
    } else {
        Err(ValidationError::BufferSize(frames))
    }
}

/// Checks a server name.
pub fn validate_server_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > MAX_SERVER_NAME {
        Err(ValidationError::Name(name.to_string()))
    } else {
        Ok(())
    }
}
