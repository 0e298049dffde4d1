//! Control channel: the server's request listener.
//!
//! [`ServerChannel::open`] spawns one listener thread. It serves
//! [`ControlRequest`]s sent through [`ChannelClient`] handles and the
//! [`ServerEvent`]s the realtime cycle posts (xruns, graph reorders, kill
//! requests), so that everything the realtime side asks for runs on a
//! control-plane thread.

use crate::internal::InitArgs;
use crate::server::Server;
use crate::{Result, ServerError};
use cadence_core::{
    ClientCallbacks, ClientOptions, ClientStatus, LockedEngine, Notification, OpenedClient,
    PortDirection, PortId, RefNum, ServerEvent,
};
use crossbeam_channel::{Receiver, Sender, bounded, never, unbounded};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Capacity of the realtime event queue.
pub const EVENT_CAPACITY: usize = 256;

/// Notifications buffered per channel client before new ones are dropped.
pub const NOTIFICATION_CAPACITY: usize = 64;

/// A request served by the listener thread.
#[derive(Debug)]
pub enum ControlRequest {
    /// Open an external client.
    ClientOpen {
        /// Requested name.
        name: String,
        /// Open options.
        options: ClientOptions,
        /// Where the client's notifications go.
        notifications: Sender<Notification>,
    },
    /// Close an external client.
    ClientClose {
        /// Client to close.
        refnum: RefNum,
    },
    /// Activate a client.
    ClientActivate {
        /// Client to activate.
        refnum: RefNum,
    },
    /// Deactivate a client.
    ClientDeactivate {
        /// Client to deactivate.
        refnum: RefNum,
    },
    /// Register a port.
    PortRegister {
        /// Owning client.
        refnum: RefNum,
        /// Short port name.
        name: String,
        /// Port direction.
        direction: PortDirection,
    },
    /// Unregister a port.
    PortUnregister {
        /// Owning client.
        refnum: RefNum,
        /// Port to remove.
        port: PortId,
    },
    /// Connect two ports by full name.
    PortConnect {
        /// Output port.
        src: String,
        /// Input port.
        dst: String,
    },
    /// Disconnect two ports by full name.
    PortDisconnect {
        /// Output port.
        src: String,
        /// Input port.
        dst: String,
    },
    /// Change the buffer size.
    SetBufferSize {
        /// New size in frames.
        frames: u32,
    },
    /// Enter or leave freewheel mode.
    SetFreewheel {
        /// `true` to enter.
        onoff: bool,
    },
    /// Give up the timebase.
    ReleaseTimebase {
        /// Current holder.
        refnum: RefNum,
    },
    /// Claim the timebase.
    SetTimebaseCallback {
        /// Claiming client.
        refnum: RefNum,
        /// Fail if another client holds it.
        conditional: bool,
    },
    /// Start the transport.
    TransportStart,
    /// Stop the transport.
    TransportStop,
    /// Move the transport.
    TransportLocate {
        /// Target frame.
        frame: u64,
    },
    /// Load an internal client.
    InternalClientLoad {
        /// Client name.
        name: String,
        /// Module reference.
        module: String,
        /// Initialization arguments.
        args: InitArgs,
        /// Open options.
        options: ClientOptions,
    },
    /// Unload an internal client.
    InternalClientUnload {
        /// Client to unload.
        refnum: RefNum,
    },
}

/// Successful reply to a [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    /// The request succeeded with nothing to report.
    Done,
    /// A client was opened.
    Client(OpenedClient),
    /// A port was registered.
    Port(PortId),
    /// An internal client was loaded.
    Refnum(RefNum),
}

struct Envelope {
    request: ControlRequest,
    reply: Sender<Result<ControlReply>>,
}

/// Forwards engine notifications to a channel client without blocking.
struct ChannelCallbacks {
    tx: Sender<Notification>,
}

impl ClientCallbacks for ChannelCallbacks {
    fn notify(&self, notification: &Notification) {
        let _ = self.tx.try_send(notification.clone());
    }
}

/// A client opened over the control channel.
#[derive(Debug)]
pub struct ExternalClient {
    /// Reference number.
    pub refnum: RefNum,
    /// Registered name.
    pub name: String,
    /// Status bits of the open.
    pub status: ClientStatus,
    /// Notifications from the engine.
    pub notifications: Receiver<Notification>,
}

/// The listener side of the control channel.
#[derive(Debug)]
pub struct ServerChannel {
    name: String,
    requests: Sender<Envelope>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl ServerChannel {
    /// Routes the engine's events to a new listener thread serving `server`.
    pub fn open(name: &str, server: Weak<Server>, engine: &LockedEngine) -> std::io::Result<Self> {
        let (event_tx, event_rx) = bounded(EVENT_CAPACITY);
        let (request_tx, request_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let handle = std::thread::Builder::new()
            .name(format!("cadence-channel-{name}"))
            .spawn(move || listen(&server, &request_rx, event_rx, &stop_rx))?;
        engine.lock().set_event_sender(event_tx);
        tracing::info!(server = name, "control channel open");

        Ok(Self {
            name: name.to_string(),
            requests: request_tx,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Server name the channel was opened for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A handle for sending requests.
    pub fn client(&self) -> ChannelClient {
        ChannelClient {
            tx: self.requests.clone(),
        }
    }

    /// Stops the listener thread and waits for it.
    ///
    /// Requests already queued are dropped; their senders see the channel closed.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("control channel listener panicked");
            }
            tracing::info!(server = %self.name, "control channel closed");
        }
    }
}

impl Drop for ServerChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn listen(
    server: &Weak<Server>,
    requests: &Receiver<Envelope>,
    mut events: Receiver<ServerEvent>,
    stop: &Receiver<()>,
) {
    loop {
        let mut events_closed = false;
        crossbeam_channel::select! {
            recv(stop) -> _ => break,
            recv(events) -> event => match event {
                Ok(event) => {
                    let Some(server) = server.upgrade() else { break };
                    dispatch_event(&server, event);
                }
                Err(_) => events_closed = true,
            },
            recv(requests) -> envelope => match envelope {
                Ok(Envelope { request, reply }) => {
                    let Some(server) = server.upgrade() else { break };
                    let _ = reply.send(handle_request(&server, request));
                }
                Err(_) => break,
            },
        }
        // The engine drops its sender when it closes.
        if events_closed {
            events = never();
        }
    }
}

fn dispatch_event(server: &Server, event: ServerEvent) {
    match event {
        ServerEvent::Notify {
            refnum,
            kind,
            value,
        } => server.notify(refnum, kind, value),
        ServerEvent::ClientKill { refnum } => server.client_kill(refnum),
        ServerEvent::LastClientClosed => server.request_shutdown(),
    }
}

fn handle_request(server: &Server, request: ControlRequest) -> Result<ControlReply> {
    tracing::debug!(?request, "control request");
    let engine = server.engine();
    let reply = match request {
        ControlRequest::ClientOpen {
            name,
            options,
            notifications,
        } => {
            let callbacks = Arc::new(ChannelCallbacks { tx: notifications });
            let opened = engine
                .lock()
                .client_external_open(&name, options, callbacks)
                .map_err(ServerError::ClientInit)?;
            ControlReply::Client(opened)
        }
        ControlRequest::ClientClose { refnum } => {
            engine.lock().client_external_close(refnum)?;
            ControlReply::Done
        }
        ControlRequest::ClientActivate { refnum } => {
            engine.lock().client_activate(refnum)?;
            ControlReply::Done
        }
        ControlRequest::ClientDeactivate { refnum } => {
            engine.lock().client_deactivate(refnum)?;
            ControlReply::Done
        }
        ControlRequest::PortRegister {
            refnum,
            name,
            direction,
        } => ControlReply::Port(engine.lock().port_register(refnum, &name, direction)?),
        ControlRequest::PortUnregister { refnum, port } => {
            engine.lock().port_unregister(refnum, port)?;
            ControlReply::Done
        }
        ControlRequest::PortConnect { src, dst } => {
            engine.lock().port_connect_by_name(&src, &dst)?;
            ControlReply::Done
        }
        ControlRequest::PortDisconnect { src, dst } => {
            engine.lock().port_disconnect_by_name(&src, &dst)?;
            ControlReply::Done
        }
        ControlRequest::SetBufferSize { frames } => {
            server.set_buffer_size(frames)?;
            ControlReply::Done
        }
        ControlRequest::SetFreewheel { onoff } => {
            server.set_freewheel(onoff)?;
            ControlReply::Done
        }
        ControlRequest::ReleaseTimebase { refnum } => {
            server.release_timebase(refnum)?;
            ControlReply::Done
        }
        ControlRequest::SetTimebaseCallback {
            refnum,
            conditional,
        } => {
            server.set_timebase_callback(refnum, conditional)?;
            ControlReply::Done
        }
        ControlRequest::TransportStart => {
            server.control().transport().start();
            ControlReply::Done
        }
        ControlRequest::TransportStop => {
            server.control().transport().stop();
            ControlReply::Done
        }
        ControlRequest::TransportLocate { frame } => {
            server.control().transport().locate(frame);
            ControlReply::Done
        }
        ControlRequest::InternalClientLoad {
            name,
            module,
            args,
            options,
        } => ControlReply::Refnum(server.internal_client_load(&name, &module, &args, options)?),
        ControlRequest::InternalClientUnload { refnum } => {
            server.internal_client_unload(refnum)?;
            ControlReply::Done
        }
    };
    Ok(reply)
}

/// Sends requests to a server's listener thread and waits for the replies.
#[derive(Debug, Clone)]
pub struct ChannelClient {
    tx: Sender<Envelope>,
}

impl ChannelClient {
    /// Sends `request` and waits for its reply.
    pub fn call(&self, request: ControlRequest) -> Result<ControlReply> {
        let closed = || ServerError::Resource("control channel closed".to_string());
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Envelope {
                request,
                reply: reply_tx,
            })
            .map_err(|_| closed())?;
        reply_rx.recv().map_err(|_| closed())?
    }

    fn call_done(&self, request: ControlRequest) -> Result<()> {
        self.call(request).map(|_| ())
    }

    fn unexpected(reply: &ControlReply) -> ServerError {
        tracing::error!(?reply, "unexpected control reply");
        ServerError::Resource("unexpected control reply".to_string())
    }

    /// Opens an external client.
    pub fn client_open(&self, name: &str, options: ClientOptions) -> Result<ExternalClient> {
        let (tx, rx) = bounded(NOTIFICATION_CAPACITY);
        match self.call(ControlRequest::ClientOpen {
            name: name.to_string(),
            options,
            notifications: tx,
        })? {
            ControlReply::Client(opened) => Ok(ExternalClient {
                refnum: opened.refnum,
                name: opened.name,
                status: opened.status,
                notifications: rx,
            }),
            other => Err(Self::unexpected(&other)),
        }
    }

    /// Closes an external client.
    pub fn client_close(&self, refnum: RefNum) -> Result<()> {
        self.call_done(ControlRequest::ClientClose { refnum })
    }

    /// Activates a client.
    pub fn client_activate(&self, refnum: RefNum) -> Result<()> {
        self.call_done(ControlRequest::ClientActivate { refnum })
    }

    /// Deactivates a client.
    pub fn client_deactivate(&self, refnum: RefNum) -> Result<()> {
        self.call_done(ControlRequest::ClientDeactivate { refnum })
    }

    /// Registers a port owned by `refnum`.
    pub fn port_register(
        &self,
        refnum: RefNum,
        name: &str,
        direction: PortDirection,
    ) -> Result<PortId> {
        match self.call(ControlRequest::PortRegister {
            refnum,
            name: name.to_string(),
            direction,
        })? {
            ControlReply::Port(port) => Ok(port),
            other => Err(Self::unexpected(&other)),
        }
    }

    /// Unregisters a port.
    pub fn port_unregister(&self, refnum: RefNum, port: PortId) -> Result<()> {
        self.call_done(ControlRequest::PortUnregister { refnum, port })
    }

    /// Connects two ports by full name.
    pub fn port_connect(&self, src: &str, dst: &str) -> Result<()> {
        self.call_done(ControlRequest::PortConnect {
            src: src.to_string(),
            dst: dst.to_string(),
        })
    }

    /// Disconnects two ports by full name.
    pub fn port_disconnect(&self, src: &str, dst: &str) -> Result<()> {
        self.call_done(ControlRequest::PortDisconnect {
            src: src.to_string(),
            dst: dst.to_string(),
        })
    }

    /// Changes the buffer size.
    pub fn set_buffer_size(&self, frames: u32) -> Result<()> {
        self.call_done(ControlRequest::SetBufferSize { frames })
    }

    /// Enters or leaves freewheel mode.
    pub fn set_freewheel(&self, onoff: bool) -> Result<()> {
        self.call_done(ControlRequest::SetFreewheel { onoff })
    }

    /// Gives up the timebase.
    pub fn release_timebase(&self, refnum: RefNum) -> Result<()> {
        self.call_done(ControlRequest::ReleaseTimebase { refnum })
    }

    /// Claims the timebase.
    pub fn set_timebase_callback(&self, refnum: RefNum, conditional: bool) -> Result<()> {
        self.call_done(ControlRequest::SetTimebaseCallback {
            refnum,
            conditional,
        })
    }

    /// Starts the transport.
    pub fn transport_start(&self) -> Result<()> {
        self.call_done(ControlRequest::TransportStart)
    }

    /// Stops the transport.
    pub fn transport_stop(&self) -> Result<()> {
        self.call_done(ControlRequest::TransportStop)
    }

    /// Moves the transport to `frame`.
    pub fn transport_locate(&self, frame: u64) -> Result<()> {
        self.call_done(ControlRequest::TransportLocate { frame })
    }

    /// Loads an internal client.
    pub fn internal_client_load(
        &self,
        name: &str,
        module: &str,
        args: InitArgs,
        options: ClientOptions,
    ) -> Result<RefNum> {
        match self.call(ControlRequest::InternalClientLoad {
            name: name.to_string(),
            module: module.to_string(),
            args,
            options,
        })? {
            ControlReply::Refnum(refnum) => Ok(refnum),
            other => Err(Self::unexpected(&other)),
        }
    }

    /// Unloads an internal client.
    pub fn internal_client_unload(&self, refnum: RefNum) -> Result<()> {
        self.call_done(ControlRequest::InternalClientUnload { refnum })
    }
}
