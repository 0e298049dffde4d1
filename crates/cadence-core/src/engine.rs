//! The engine: client table, notification fan-out, and the realtime cycle.
//!
//! [`Engine`] holds the client table and wraps the [`GraphManager`] and
//! [`EngineControl`]. It is always used through a [`LockedEngine`], whose mutex
//! serializes control-plane mutations against the realtime cycle. The realtime
//! side only ever `try_lock`s; a cycle that finds the engine busy is skipped and
//! counted.
//!
//! Nothing here calls back into the server. Things the server must react to
//! (xruns, late clients) are posted as [`ServerEvent`]s on a bounded channel
//! with `try_send`.

use crate::client::{
    ClientCallbacks, ClientKind, ClientOptions, ClientStatus, MAX_CLIENTS, Notification,
    NotifyKind, OpenedClient, RefNum,
};
use crate::control::EngineControl;
use crate::error::{EngineError, Result};
use crate::graph::{GraphManager, PortDirection, PortId};
use crate::message_buffer::{MessageBuffer, RtLevel};
use crate::synchro::{SyncWait, SynchroTable};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Longest client name, in bytes.
pub const MAX_CLIENT_NAME: usize = 64;

/// How often an idle client thread re-checks its stop flag.
const CLIENT_POLL: Duration = Duration::from_millis(50);

/// Something the realtime side asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// Forward to `Server::notify`.
    Notify {
        /// Client concerned, or [`RefNum::ALL`].
        refnum: RefNum,
        /// What happened.
        kind: NotifyKind,
        /// Payload.
        value: i64,
    },
    /// A client missed its deadline and must be removed.
    ClientKill {
        /// Client to remove.
        refnum: RefNum,
    },
    /// The last client left a temporary server.
    LastClientClosed,
}

/// Summary of one realtime cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleOutcome {
    /// Clients that processed in time.
    pub processed: usize,
    /// Clients that missed the deadline.
    pub late: usize,
}

/// Public view of a client table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Reference number.
    pub refnum: RefNum,
    /// Registered name.
    pub name: String,
    /// Kind of client.
    pub kind: ClientKind,
    /// Whether the client takes part in cycles.
    pub active: bool,
}

/// A client's processing thread.
///
/// The thread holds the sending half of `done`; the channel disconnects once it
/// exits, so stopping can wait with a deadline instead of joining blindly.
struct ClientThread {
    refnum: RefNum,
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

impl ClientThread {
    fn spawn(
        refnum: RefNum,
        name: &str,
        callbacks: Arc<dyn ClientCallbacks>,
        synchro: Arc<SynchroTable>,
        control: Arc<EngineControl>,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let (alive, done) = bounded::<()>(0);
        let handle = std::thread::Builder::new()
            .name(format!("cadence-client-{name}"))
            .spawn(move || {
                let _alive = alive;
                while !flag.load(Ordering::Acquire) {
                    match synchro.wait(refnum, CLIENT_POLL) {
                        SyncWait::Signaled => {
                            callbacks.process(control.buffer_size());
                            // A stopped thread must not complete a cycle for
                            // whoever holds the slot now.
                            if flag.load(Ordering::Acquire) {
                                break;
                            }
                            synchro.finish(refnum);
                        }
                        SyncWait::TimedOut => {}
                        SyncWait::Closed => break,
                    }
                }
            })?;
        Ok(Self {
            refnum,
            stop,
            done,
            handle,
        })
    }

    /// Flags the thread to stop without waiting for it.
    fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn has_exited(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Stops the thread, waiting at most `grace` for it to exit.
    ///
    /// Hands the thread back if it is still running, e.g. stuck in `process`.
    fn stop(self, grace: Duration) -> Option<Self> {
        self.signal_stop();
        match self.done.recv_timeout(grace) {
            Err(RecvTimeoutError::Timeout) => Some(self),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.join();
                None
            }
        }
    }

    fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!(refnum = %self.refnum, "client thread panicked");
        }
    }
}

struct ClientEntry {
    name: String,
    kind: ClientKind,
    callbacks: Arc<dyn ClientCallbacks>,
    active: bool,
    zombie: bool,
    thread: Option<ClientThread>,
}

/// Client table plus the graph and control it operates on.
pub struct Engine {
    graph: Arc<GraphManager>,
    control: Arc<EngineControl>,
    synchro: Arc<SynchroTable>,
    messages: MessageBuffer,
    clients: Vec<Option<ClientEntry>>,
    open: bool,
    events: Option<Sender<ServerEvent>>,
    graph_version: u64,
    detached: Vec<ClientThread>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("open", &self.open)
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

impl Engine {
    fn new(
        graph: Arc<GraphManager>,
        control: Arc<EngineControl>,
        synchro: Arc<SynchroTable>,
        messages: MessageBuffer,
    ) -> Self {
        Self {
            graph,
            control,
            synchro,
            messages,
            clients: (0..MAX_CLIENTS).map(|_| None).collect(),
            open: false,
            events: None,
            graph_version: 0,
            detached: Vec::new(),
        }
    }

    /// Opens the engine for clients.
    pub fn open(&mut self) -> Result<()> {
        self.open = true;
        self.graph_version = self.graph.version();
        tracing::debug!("engine opened");
        Ok(())
    }

    /// Closes every remaining client and the engine itself.
    pub fn close(&mut self) -> Result<()> {
        let refnums: Vec<RefNum> = self.refnums().collect();
        for refnum in refnums.into_iter().rev() {
            self.close_client(refnum);
        }
        let running = self.reap_client_threads();
        if running > 0 {
            tracing::warn!(running, "client threads still running after close");
        }
        self.open = false;
        self.events = None;
        tracing::debug!("engine closed");
        Ok(())
    }

    /// Whether the engine is open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Routes server events into `tx`.
    pub fn set_event_sender(&mut self, tx: Sender<ServerEvent>) {
        self.events = Some(tx);
    }

    /// Stops routing server events.
    pub fn clear_event_sender(&mut self) {
        self.events = None;
    }

    /// The graph this engine drives.
    pub fn graph(&self) -> &Arc<GraphManager> {
        &self.graph
    }

    /// The shared control record.
    pub fn control(&self) -> &Arc<EngineControl> {
        &self.control
    }

    // --- client table ---

    fn refnums(&self) -> impl Iterator<Item = RefNum> + '_ {
        self.clients
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(i, _)| RefNum::new(i as u32))
    }

    fn entry(&self, refnum: RefNum) -> Result<&ClientEntry> {
        self.clients
            .get(refnum.index())
            .and_then(Option::as_ref)
            .ok_or(EngineError::NoSuchClient(refnum))
    }

    fn entry_mut(&mut self, refnum: RefNum) -> Result<&mut ClientEntry> {
        self.clients
            .get_mut(refnum.index())
            .and_then(Option::as_mut)
            .ok_or(EngineError::NoSuchClient(refnum))
    }

    fn name_taken(&self, name: &str) -> bool {
        self.clients.iter().flatten().any(|c| c.name == name)
    }

    /// Number of registered clients, drivers included.
    pub fn client_count(&self) -> usize {
        self.clients.iter().flatten().count()
    }

    /// Reference number of the client called `name`.
    pub fn client_refnum(&self, name: &str) -> Option<RefNum> {
        self.clients
            .iter()
            .position(|c| c.as_ref().is_some_and(|c| c.name == name))
            .map(|i| RefNum::new(i as u32))
    }

    /// Description of one client.
    pub fn client_info(&self, refnum: RefNum) -> Option<ClientInfo> {
        self.entry(refnum).ok().map(|c| ClientInfo {
            refnum,
            name: c.name.clone(),
            kind: c.kind,
            active: c.active,
        })
    }

    /// Description of every client, in refnum order.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.refnums()
            .filter_map(|r| self.client_info(r))
            .collect()
    }

    /// Checks `name` against the table and returns the name to register.
    ///
    /// With [`ClientOptions::USE_EXACT_NAME`] a taken name fails; otherwise a
    /// `name-NN` variant is generated and `NAME_NOT_UNIQUE` is reported in the
    /// returned status.
    pub fn client_check_name(
        &self,
        name: &str,
        options: ClientOptions,
    ) -> std::result::Result<(String, ClientStatus), ClientStatus> {
        if options.has_invalid_bits() {
            return Err(ClientStatus::FAILURE | ClientStatus::INVALID_OPTION);
        }
        if name.is_empty() || name.len() > MAX_CLIENT_NAME || name.contains(':') {
            return Err(ClientStatus::FAILURE | ClientStatus::INVALID_OPTION);
        }
        if !self.name_taken(name) {
            return Ok((name.to_string(), ClientStatus::empty()));
        }
        if options.contains(ClientOptions::USE_EXACT_NAME) {
            return Err(ClientStatus::FAILURE | ClientStatus::NAME_NOT_UNIQUE);
        }
        (1..=99)
            .map(|n| format!("{name}-{n:02}"))
            .find(|candidate| candidate.len() <= MAX_CLIENT_NAME && !self.name_taken(candidate))
            .map(|unique| (unique, ClientStatus::NAME_NOT_UNIQUE))
            .ok_or(ClientStatus::FAILURE | ClientStatus::NAME_NOT_UNIQUE)
    }

    fn add_client(
        &mut self,
        name: String,
        kind: ClientKind,
        callbacks: Arc<dyn ClientCallbacks>,
    ) -> Result<RefNum> {
        if !self.open {
            return Err(EngineError::EngineClosed);
        }
        let index = self
            .clients
            .iter()
            .position(Option::is_none)
            .ok_or(EngineError::TooManyClients(MAX_CLIENTS))?;
        let refnum = RefNum::new(index as u32);
        self.synchro.allocate(refnum, &name)?;
        self.notify_all(&Notification::ClientRegistration {
            name: name.clone(),
            registered: true,
        });
        callbacks.notify(&Notification::ClientRegistration {
            name: name.clone(),
            registered: true,
        });
        tracing::info!(%refnum, name = %name, ?kind, "client opened");
        self.clients[index] = Some(ClientEntry {
            name,
            kind,
            callbacks,
            active: false,
            zombie: false,
            thread: None,
        });
        Ok(refnum)
    }

    fn open_client(
        &mut self,
        name: &str,
        options: ClientOptions,
        kind: ClientKind,
        callbacks: Arc<dyn ClientCallbacks>,
    ) -> std::result::Result<OpenedClient, ClientStatus> {
        if !self.open {
            return Err(ClientStatus::FAILURE | ClientStatus::SERVER_ERROR);
        }
        let (name, status) = self.client_check_name(name, options)?;
        match self.add_client(name.clone(), kind, callbacks) {
            Ok(refnum) => Ok(OpenedClient {
                refnum,
                name,
                status,
            }),
            Err(err) => {
                tracing::warn!(error = %err, "client open failed");
                Err(ClientStatus::FAILURE | ClientStatus::SHM_FAILURE)
            }
        }
    }

    /// Opens an in-process client.
    pub fn client_internal_open(
        &mut self,
        name: &str,
        options: ClientOptions,
        callbacks: Arc<dyn ClientCallbacks>,
    ) -> std::result::Result<OpenedClient, ClientStatus> {
        self.open_client(name, options, ClientKind::Internal, callbacks)
    }

    /// Opens a client reached over the control channel.
    pub fn client_external_open(
        &mut self,
        name: &str,
        options: ClientOptions,
        callbacks: Arc<dyn ClientCallbacks>,
    ) -> std::result::Result<OpenedClient, ClientStatus> {
        self.open_client(name, options, ClientKind::External, callbacks)
    }

    /// Opens the client that carries a driver's hardware ports.
    ///
    /// Driver names must be unique; no variant is generated.
    pub fn client_driver_open(
        &mut self,
        name: &str,
        callbacks: Arc<dyn ClientCallbacks>,
    ) -> Result<RefNum> {
        if self.name_taken(name) {
            return Err(EngineError::ClientNameTaken(name.to_string()));
        }
        self.add_client(name.to_string(), ClientKind::Driver, callbacks)
    }

    /// Closes any non-driver client.
    pub fn client_external_close(&mut self, refnum: RefNum) -> Result<()> {
        if self.entry(refnum)?.kind == ClientKind::Driver {
            return Err(EngineError::NoSuchClient(refnum));
        }
        self.close_client(refnum);
        Ok(())
    }

    /// Closes an in-process client.
    pub fn client_internal_close(&mut self, refnum: RefNum) -> Result<()> {
        if self.entry(refnum)?.kind != ClientKind::Internal {
            return Err(EngineError::NoSuchClient(refnum));
        }
        self.close_client(refnum);
        Ok(())
    }

    /// Closes a driver's client.
    pub fn client_driver_close(&mut self, refnum: RefNum) -> Result<()> {
        if self.entry(refnum)?.kind != ClientKind::Driver {
            return Err(EngineError::NoSuchClient(refnum));
        }
        self.close_client(refnum);
        Ok(())
    }

    fn close_client(&mut self, refnum: RefNum) {
        let Some(mut entry) = self.clients.get_mut(refnum.index()).and_then(Option::take) else {
            return;
        };
        if let Some(thread) = entry.thread.take() {
            self.retire_thread(thread, entry.zombie);
        }
        let ports = self.graph.remove_all_ports(refnum);
        for port in ports {
            self.notify_all(&Notification::PortRegistration {
                port,
                registered: false,
            });
        }
        self.control.transport().client_closed(refnum);
        self.synchro.release(refnum);
        self.notify_all(&Notification::ClientRegistration {
            name: entry.name.clone(),
            registered: false,
        });
        entry.active = false;
        tracing::info!(%refnum, name = %entry.name, "client closed");

        let remaining = self
            .clients
            .iter()
            .flatten()
            .filter(|c| c.kind != ClientKind::Driver)
            .count();
        if entry.kind != ClientKind::Driver && remaining == 0 && self.control.is_temporary() {
            tracing::info!("last client closed on a temporary server");
            self.post_event(ServerEvent::LastClientClosed);
        }
    }

    /// Makes a client take part in cycles; starts its thread if it processes.
    pub fn client_activate(&mut self, refnum: RefNum) -> Result<()> {
        let synchro = Arc::clone(&self.synchro);
        let control = Arc::clone(&self.control);
        let entry = self.entry_mut(refnum)?;
        if entry.active {
            return Ok(());
        }
        if entry.kind != ClientKind::Driver && entry.callbacks.has_process() {
            let thread = ClientThread::spawn(
                refnum,
                &entry.name,
                Arc::clone(&entry.callbacks),
                synchro,
                control,
            )
            .map_err(|_| EngineError::Synchro(refnum))?;
            entry.thread = Some(thread);
        }
        entry.active = true;
        entry.zombie = false;
        tracing::debug!(%refnum, "client activated");
        self.notify_graph_reorder();
        Ok(())
    }

    /// Removes a client from cycles, stops its thread, and disconnects its ports.
    pub fn client_deactivate(&mut self, refnum: RefNum) -> Result<()> {
        let entry = self.entry_mut(refnum)?;
        let thread = entry.thread.take();
        let zombie = entry.zombie;
        entry.active = false;
        if let Some(thread) = thread {
            self.retire_thread(thread, zombie);
        }
        let removed = self.graph.disconnect_all_ports(refnum);
        for c in removed {
            self.notify_all(&Notification::PortConnect {
                src: c.src,
                dst: c.dst,
                connected: false,
            });
        }
        tracing::debug!(%refnum, "client deactivated");
        self.notify_graph_reorder();
        Ok(())
    }

    /// Stops a client thread without blocking on it indefinitely.
    ///
    /// A zombie is not waited for at all; any other thread gets the client
    /// timeout. A thread still running after that is detached and joined by a
    /// later [`reap_client_threads`](Self::reap_client_threads).
    fn retire_thread(&mut self, thread: ClientThread, zombie: bool) {
        let refnum = thread.refnum;
        thread.signal_stop();
        self.synchro.interrupt(refnum);
        let grace = if zombie {
            Duration::ZERO
        } else {
            self.control.client_timeout()
        };
        if let Some(thread) = thread.stop(grace) {
            tracing::warn!(%refnum, "client thread did not stop; detaching it");
            self.detached.push(thread);
        }
    }

    /// Joins detached client threads that have exited since.
    ///
    /// Returns how many are still running.
    pub fn reap_client_threads(&mut self) -> usize {
        let (exited, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.detached)
            .into_iter()
            .partition(ClientThread::has_exited);
        for thread in exited {
            thread.join();
        }
        self.detached = running;
        self.detached.len()
    }

    /// Whether the client takes part in cycles.
    pub fn is_active(&self, refnum: RefNum) -> bool {
        self.entry(refnum).is_ok_and(|c| c.active)
    }

    // --- ports ---

    fn register(
        &mut self,
        refnum: RefNum,
        short_name: &str,
        direction: PortDirection,
        physical: bool,
    ) -> Result<PortId> {
        let full_name = format!("{}:{short_name}", self.entry(refnum)?.name);
        let port = self
            .graph
            .allocate_port(refnum, &full_name, direction, physical)?;
        self.notify_all(&Notification::PortRegistration {
            port,
            registered: true,
        });
        Ok(port)
    }

    /// Registers a port named `client:short_name`.
    pub fn port_register(
        &mut self,
        refnum: RefNum,
        short_name: &str,
        direction: PortDirection,
    ) -> Result<PortId> {
        self.register(refnum, short_name, direction, false)
    }

    /// Registers a hardware port for a driver client.
    pub fn port_register_physical(
        &mut self,
        refnum: RefNum,
        short_name: &str,
        direction: PortDirection,
    ) -> Result<PortId> {
        self.register(refnum, short_name, direction, true)
    }

    /// Removes a port owned by `refnum`.
    pub fn port_unregister(&mut self, refnum: RefNum, port: PortId) -> Result<()> {
        self.entry(refnum)?;
        self.graph.release_port(refnum, port)?;
        self.notify_all(&Notification::PortRegistration {
            port,
            registered: false,
        });
        Ok(())
    }

    /// Connects output `src` to input `dst`.
    pub fn port_connect(&mut self, src: PortId, dst: PortId) -> Result<()> {
        self.graph.connect(src, dst)?;
        self.notify_all(&Notification::PortConnect {
            src,
            dst,
            connected: true,
        });
        Ok(())
    }

    /// Connects two ports by full name.
    pub fn port_connect_by_name(&mut self, src: &str, dst: &str) -> Result<()> {
        let src = self.port_by_name(src)?;
        let dst = self.port_by_name(dst)?;
        self.port_connect(src, dst)
    }

    /// Disconnects output `src` from input `dst`.
    pub fn port_disconnect(&mut self, src: PortId, dst: PortId) -> Result<()> {
        self.graph.disconnect(src, dst)?;
        self.notify_all(&Notification::PortConnect {
            src,
            dst,
            connected: false,
        });
        Ok(())
    }

    /// Disconnects two ports by full name.
    pub fn port_disconnect_by_name(&mut self, src: &str, dst: &str) -> Result<()> {
        let src = self.port_by_name(src)?;
        let dst = self.port_by_name(dst)?;
        self.port_disconnect(src, dst)
    }

    fn port_by_name(&self, name: &str) -> Result<PortId> {
        self.graph
            .find_port(name)
            .map(|p| p.id)
            .ok_or_else(|| EngineError::UnknownPortName(name.to_string()))
    }

    // --- notifications ---

    fn notify_all(&self, notification: &Notification) {
        for client in self.clients.iter().flatten() {
            client.callbacks.notify(notification);
        }
    }

    fn notify_one(&self, refnum: RefNum, notification: &Notification) {
        if let Ok(client) = self.entry(refnum) {
            client.callbacks.notify(notification);
        }
    }

    /// Resizes port buffers and tells every client about the new buffer size.
    pub fn notify_buffer_size(&mut self, frames: u32) {
        self.graph.set_buffer_size(frames);
        self.notify_all(&Notification::BufferSize(frames));
    }

    /// Tells every client freewheel mode started (`true`) or stopped.
    ///
    /// Entering freewheel saves and clears the realtime flag; leaving restores it.
    pub fn notify_freewheel(&mut self, onoff: bool) {
        if onoff {
            self.control.enter_freewheel();
            self.notify_all(&Notification::StartFreewheel);
        } else {
            self.control.leave_freewheel();
            self.notify_all(&Notification::StopFreewheel);
        }
    }

    /// Counts an xrun and tells `refnum` (or every client for [`RefNum::ALL`]).
    pub fn notify_xrun(&mut self, refnum: RefNum) {
        self.control.note_xrun();
        if refnum.is_all() {
            self.notify_all(&Notification::XRun);
        } else {
            self.notify_one(refnum, &Notification::XRun);
        }
    }

    /// Tells every client the processing order changed.
    pub fn notify_graph_reorder(&mut self) {
        self.graph_version = self.graph.version();
        self.notify_all(&Notification::GraphOrder);
    }

    // --- realtime ---

    fn post_event(&self, event: ServerEvent) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                self.messages
                    .post(RtLevel::Warn, "server event queue full, event dropped", 0);
            }
        }
    }

    /// Runs one cycle: advances the transport, releases every active client, and
    /// waits for them until `deadline`.
    ///
    /// A client that misses the deadline is marked as a zombie, an xrun is posted
    /// for it, and a single kill request goes to the server.
    pub fn process_cycle(&mut self, deadline: Instant) -> CycleOutcome {
        let frames = self.control.buffer_size();
        if let Some(mut transport) = self.control.try_transport() {
            transport.cycle_begin(frames);
        }

        let mut released: [Option<RefNum>; MAX_CLIENTS] = [None; MAX_CLIENTS];
        for (i, client) in self.clients.iter().enumerate() {
            let runnable = client
                .as_ref()
                .is_some_and(|c| c.active && !c.zombie && c.thread.is_some());
            let refnum = RefNum::new(i as u32);
            if runnable && self.synchro.signal(refnum) {
                released[i] = Some(refnum);
            }
        }

        let mut outcome = CycleOutcome::default();
        for refnum in released.into_iter().flatten() {
            if self.synchro.wait_finished(refnum, deadline) {
                outcome.processed += 1;
                continue;
            }
            outcome.late += 1;
            if let Some(Some(client)) = self.clients.get_mut(refnum.index()) {
                client.zombie = true;
            }
            self.messages
                .post(RtLevel::Error, "client missed its deadline", i64::from(refnum.raw()));
            self.post_event(ServerEvent::Notify {
                refnum,
                kind: NotifyKind::XRun,
                value: 0,
            });
            self.post_event(ServerEvent::ClientKill { refnum });
        }

        let version = self.graph.version();
        if version != self.graph_version {
            self.graph_version = version;
            self.post_event(ServerEvent::Notify {
                refnum: RefNum::ALL,
                kind: NotifyKind::GraphOrder,
                value: 0,
            });
        }
        outcome
    }
}

/// The engine behind its serializing lock.
#[derive(Debug)]
pub struct LockedEngine {
    engine: Mutex<Engine>,
    graph: Arc<GraphManager>,
    control: Arc<EngineControl>,
    synchro: Arc<SynchroTable>,
    messages: MessageBuffer,
}

impl LockedEngine {
    /// Wraps a new, closed engine around the shared collaborators.
    pub fn new(
        graph: Arc<GraphManager>,
        control: Arc<EngineControl>,
        synchro: Arc<SynchroTable>,
        messages: MessageBuffer,
    ) -> Self {
        let engine = Engine::new(
            Arc::clone(&graph),
            Arc::clone(&control),
            Arc::clone(&synchro),
            messages.clone(),
        );
        Self {
            engine: Mutex::new(engine),
            graph,
            control,
            synchro,
            messages,
        }
    }

    /// Locks the engine for a control-plane operation.
    pub fn lock(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock()
    }

    /// The graph.
    pub fn graph(&self) -> &Arc<GraphManager> {
        &self.graph
    }

    /// The shared control record.
    pub fn control(&self) -> &Arc<EngineControl> {
        &self.control
    }

    /// The synchro table.
    pub fn synchro(&self) -> &Arc<SynchroTable> {
        &self.synchro
    }

    /// The realtime log queue.
    pub fn messages(&self) -> &MessageBuffer {
        &self.messages
    }

    /// Realtime entry point: runs one cycle if the engine is free.
    ///
    /// Returns `None` when the engine was busy or closed; the cycle is counted as
    /// skipped.
    pub fn process(&self) -> Option<CycleOutcome> {
        self.process_within(self.control.cycle_timeout())
    }

    /// Like [`process`](Self::process), with an explicit client deadline.
    pub fn process_within(&self, timeout: Duration) -> Option<CycleOutcome> {
        let deadline = Instant::now() + timeout;
        let Some(mut engine) = self.engine.try_lock() else {
            self.control.note_skipped_cycle();
            return None;
        };
        if !engine.is_open() {
            return None;
        }
        Some(engine.process_cycle(deadline))
    }
}
