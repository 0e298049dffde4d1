//! Error types for server operations.

use cadence_core::{ClientStatus, EngineError};
use cadence_driver::DriverError;
use thiserror::Error;

/// Errors reported by the server's control operations.
///
/// Every control call returns `Ok(())` for success and one of these for
/// failure; the details are also logged where they happen.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The control channel, the engine, or the message buffer could not be opened.
    #[error("resource unavailable: {0}")]
    Resource(String),

    /// The driver module could not be resolved or its factory failed.
    #[error("cannot load driver '{driver}': {source}")]
    DriverLoad {
        /// Requested driver name.
        driver: String,
        /// What went wrong.
        #[source]
        source: DriverError,
    },

    /// A driver could not be attached to the graph.
    #[error("cannot attach driver '{driver}': {source}")]
    DriverAttach {
        /// Driver name.
        driver: String,
        /// What went wrong.
        #[source]
        source: DriverError,
    },

    /// The request conflicts with the server's current state.
    #[error("state conflict: {0}")]
    StateConflict(&'static str),

    /// A client could not be opened or initialized.
    #[error("client initialization failed (status {:#x})", .0.bits())]
    ClientInit(ClientStatus),

    /// The server has no audio driver; `open` was not called or failed early.
    #[error("server is not open")]
    NotOpen,

    /// A driver operation failed.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// An engine operation failed.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Failure of an internal client load.
///
/// The status always contains [`ClientStatus::FAILURE`]; a failed load never
/// yields a reference number.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("internal client load failed (status {:#x})", .status.bits())]
pub struct InternalClientError {
    /// Status bits describing the failure.
    pub status: ClientStatus,
}

impl InternalClientError {
    /// Creates an error, adding the failure bit to `status`.
    pub fn new(status: ClientStatus) -> Self {
        Self {
            status: status | ClientStatus::FAILURE,
        }
    }
}

impl From<InternalClientError> for ServerError {
    fn from(err: InternalClientError) -> Self {
        ServerError::ClientInit(err.status)
    }
}

/// Convenience result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
