//! Clock-source drivers for the cadence audio server.
//!
//! This crate provides:
//!
//! - **Driver capability set**: the [`Driver`] trait and the shared [`DriverCore`]
//!   (role, slaves, lifecycle, buffer size)
//! - **Audio drivers**: [`DummyDriver`] (timer-paced) and [`CpalDriver`] (hardware)
//! - **Freewheel**: [`FreewheelDriver`], the fast synthetic clock
//! - **Loopback**: [`LoopbackDriver`], playback fed back into capture
//! - **Registry**: [`DriverRegistry`] resolves driver names, including shared
//!   libraries loaded through `libloading`
//!
//! ## Master/slave chaining
//!
//! ```text
//!            ┌──────────────────────┐
//!            │  master (audio)      │  one cycle per period
//!            └──────────┬───────────┘
//!          process_slave│  then engine.process()
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   ┌─────────────┐           ┌─────────────┐
//!   │  loopback   │           │  freewheel  │
//!   └─────────────┘           └─────────────┘
//! ```

mod cpal_driver;
mod cycle;
mod driver;
mod dummy;
mod freewheel;
mod loopback;
mod registry;

pub use cpal_driver::{CpalDriver, cpal_params, output_device_names};
pub use cycle::{CycleThread, Pacing};
pub use driver::{
    Driver, DriverContext, DriverCore, DriverSettings, MIN_BUFFER_SIZE, check_buffer_size,
};
pub use dummy::{DummyDriver, SYSTEM_CLIENT, dummy_params};
pub use freewheel::{FREEWHEEL_NAME, FREEWHEEL_TIMEOUT, FreewheelDriver};
pub use loopback::{LOOPBACK_NAME, LoopbackDriver};
pub use registry::{
    DESCRIPTOR_SYMBOL, DriverDescriptor, DriverFactory, DriverModule, DriverRegistry,
    INITIALIZE_SYMBOL,
};

use cadence_core::{EngineError, ParamError};
use std::path::PathBuf;

/// Error types for driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The operation is not valid in the driver's current lifecycle state.
    #[error("driver '{driver}': {reason}")]
    InvalidState {
        /// Driver name.
        driver: String,
        /// What was attempted.
        reason: &'static str,
    },

    /// The buffer size is not a power of two within the supported range.
    #[error("unsupported buffer size: {0} frames")]
    UnsupportedBufferSize(u32),

    /// The driver's buffer size is dictated by its hardware.
    #[error("driver '{0}' has a fixed buffer size")]
    FixedBufferSize(String),

    /// The audio backend failed.
    #[error("audio backend error: {0}")]
    Backend(String),

    /// An engine operation failed.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// No driver with this name is registered or installed.
    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    /// A driver library could not be loaded.
    #[error("cannot load driver library {}: {reason}", .path.display())]
    Load {
        /// Library path.
        path: PathBuf,
        /// Loader message.
        reason: String,
    },

    /// A driver parameter was rejected.
    #[error("invalid driver parameter: {0}")]
    InvalidParameter(#[from] ParamError),
}

/// Convenience result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
