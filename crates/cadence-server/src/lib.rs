//! Server orchestrator for the cadence audio graph server.
//!
//! This crate ties the engine and the drivers together:
//!
//! - **Server**: [`Server`] opens and closes the whole stack, starts and stops the
//!   audio driver, changes the buffer size, and switches freewheel mode
//! - **Control channel**: [`ServerChannel`] runs the listener thread that serves
//!   [`ChannelClient`] requests and the realtime side's events
//! - **Internal clients**: [`InternalClientRegistry`] resolves in-process client
//!   modules, built in or loaded from shared libraries
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cadence_config::ServerConfig;
//! use cadence_server::Server;
//!
//! let config = ServerConfig::default();
//! let server = Server::new(&config);
//! server.open(&config.driver.name, &config.driver_params())?;
//! server.start()?;
//!
//! server.set_freewheel(true)?;   // render as fast as possible
//! server.set_freewheel(false)?;  // back to the hardware clock
//!
//! server.stop()?;
//! server.close()?;
//! ```

pub mod channel;
mod error;
pub mod internal;
mod server;

pub use channel::{
    ChannelClient, ControlReply, ControlRequest, EVENT_CAPACITY, ExternalClient,
    NOTIFICATION_CAPACITY, ServerChannel,
};
pub use error::{InternalClientError, Result, ServerError};
pub use internal::{
    CLIENT_DESCRIPTOR_SYMBOL, CLIENT_INITIALIZE_SYMBOL, ClientContext, ClientFactory,
    ClientModule, ClientModuleDescriptor, InitArgs, InternalClient, InternalClientRegistry,
    ModuleError,
};
pub use server::{ClientTeardown, CycleState, Server, kill_client};
