//! Core of the cadence audio graph server.
//!
//! This crate provides the pieces every driver and the server share:
//!
//! - **Engine Control**: [`EngineControl`] holds buffer size, sample rate, realtime
//!   flag, timeouts, the frame timer, and the [`Transport`]
//! - **Graph Manager**: [`GraphManager`] owns ports and connections and produces
//!   [`ConnectionState`] snapshots
//! - **Synchro Table**: [`SynchroTable`] releases client processing each cycle
//! - **Engine**: [`LockedEngine`] serializes control-plane mutations against the
//!   realtime cycle and fans out [`Notification`]s to clients
//! - **Message Buffer**: [`MessageBuffer`] carries log messages out of realtime code
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cadence_core::{EngineControl, EngineSettings, GraphManager, LockedEngine,
//!     MessageBuffer, SynchroTable};
//! use std::sync::Arc;
//!
//! let control = Arc::new(EngineControl::new(&EngineSettings::default()));
//! let graph = Arc::new(GraphManager::new(control.buffer_size()));
//! let engine = LockedEngine::new(graph, control, Arc::new(SynchroTable::new()),
//!     MessageBuffer::new());
//! engine.lock().open()?;
//!
//! // From the driver's cycle thread:
//! engine.process();
//! ```

pub mod client;
pub mod control;
pub mod engine;
pub mod error;
pub mod graph;
pub mod message_buffer;
pub mod params;
pub mod synchro;
pub mod transport;

pub use client::{
    ClientCallbacks, ClientKind, ClientOptions, ClientStatus, MAX_CLIENTS, NoCallbacks,
    Notification, NotifyKind, OpenedClient, RefNum,
};
pub use control::{
    DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLE_RATE, EngineControl, EngineSettings, FrameTimer,
    MAX_BUFFER_SIZE,
};
pub use engine::{ClientInfo, CycleOutcome, Engine, LockedEngine, MAX_CLIENT_NAME, ServerEvent};
pub use error::{EngineError, Result};
pub use graph::{Connection, ConnectionState, GraphManager, PortDirection, PortId, PortInfo};
pub use message_buffer::{MessageBuffer, RtLevel, RtMessage};
pub use params::{
    DriverParam, ParamDescriptor, ParamError, ParamKind, ParamValue, ResolvedParams,
    resolve_params,
};
pub use synchro::{SyncWait, SynchroTable};
pub use transport::{Transport, TransportState};
