//! Error types for engine, graph, and transport operations.

use crate::client::RefNum;
use crate::graph::PortId;
use thiserror::Error;

/// Errors raised by the engine and its collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No client is registered under this reference number.
    #[error("no such client: {0}")]
    NoSuchClient(RefNum),

    /// Another client already uses this name.
    #[error("client name already in use: {0}")]
    ClientNameTaken(String),

    /// Every client slot is occupied.
    #[error("client table is full ({0} slots)")]
    TooManyClients(usize),

    /// The port does not exist.
    #[error("no such port: {0}")]
    NoSuchPort(PortId),

    /// No port has this full name.
    #[error("no port named '{0}'")]
    UnknownPortName(String),

    /// A port with this full name already exists.
    #[error("port name already in use: {0}")]
    PortNameTaken(String),

    /// The port is not owned by the client that tried to use it.
    #[error("port {port} is not owned by client {refnum}")]
    NotPortOwner {
        /// Port that was addressed.
        port: PortId,
        /// Client that attempted the operation.
        refnum: RefNum,
    },

    /// The two ports are already connected.
    #[error("ports {src} and {dst} are already connected")]
    ConnectionExists {
        /// Output side of the connection.
        src: PortId,
        /// Input side of the connection.
        dst: PortId,
    },

    /// The two ports are not connected.
    #[error("ports {src} and {dst} are not connected")]
    NotConnected {
        /// Output side of the connection.
        src: PortId,
        /// Input side of the connection.
        dst: PortId,
    },

    /// A connection must run from an output port to an input port.
    #[error("cannot connect {src} to {dst}: connections run from an output to an input")]
    IncompatiblePorts {
        /// Requested source port.
        src: PortId,
        /// Requested destination port.
        dst: PortId,
    },

    /// The engine has not been opened, or has been closed.
    #[error("engine is closed")]
    EngineClosed,

    /// Another client already holds the timebase.
    #[error("timebase is held by client {0}")]
    TimebaseBusy(RefNum),

    /// The client asked to release a timebase it does not hold.
    #[error("client {0} is not the timebase master")]
    NotTimebaseMaster(RefNum),

    /// A synchro table slot could not be used.
    #[error("synchro slot {0} is unavailable")]
    Synchro(RefNum),
}

/// Convenience result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
