//! The server orchestrator.
//!
//! [`Server`] owns the engine, its control record, the graph, and the three
//! drivers. Audio is master after [`open`](Server::open), with Freewheel (and
//! Loopback, when enabled) as its slaves. Reconfiguration follows one pattern:
//! stop the master, mutate while quiesced, start again.
//!
//! ```text
//!   Stopped ──start──▶ Running ──stop──▶ Stopped
//!                        │  ▲
//!        set_buffer_size │  │ restart
//!        set_freewheel   ▼  │
//!                      Quiesced
//! ```

use crate::channel::{ChannelClient, ServerChannel};
use crate::internal::{ClientContext, InitArgs, InternalClientRegistry, LoadedClient};
use crate::{InternalClientError, Result, ServerError};
use cadence_config::ServerConfig;
use cadence_core::{
    ClientOptions, ClientStatus, ConnectionState, DriverParam, Engine, EngineControl,
    EngineError, GraphManager, LockedEngine, MessageBuffer, NotifyKind, RefNum, SynchroTable,
};
use cadence_driver::{
    Driver, DriverContext, DriverModule, DriverRegistry, DriverSettings, FreewheelDriver,
    LoopbackDriver,
};
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Where the realtime cycle stands from the orchestrator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleState {
    /// No driver is running.
    #[default]
    Stopped,
    /// The master driver is running cycles.
    Running,
    /// The master was stopped for a reconfiguration and will be restarted.
    Quiesced,
}

/// The two client-table operations the forced-removal path needs.
pub trait ClientTeardown {
    /// Removes the client from cycles.
    fn client_deactivate(&mut self, refnum: RefNum) -> cadence_core::Result<()>;

    /// Closes the client.
    fn client_external_close(&mut self, refnum: RefNum) -> cadence_core::Result<()>;
}

impl ClientTeardown for Engine {
    fn client_deactivate(&mut self, refnum: RefNum) -> cadence_core::Result<()> {
        Engine::client_deactivate(self, refnum)
    }

    fn client_external_close(&mut self, refnum: RefNum) -> cadence_core::Result<()> {
        Engine::client_external_close(self, refnum)
    }
}

/// Deactivates then closes `refnum`. Both steps are attempted; failures are logged.
pub fn kill_client(engine: &mut impl ClientTeardown, refnum: RefNum) {
    if let Err(err) = engine.client_deactivate(refnum) {
        tracing::warn!(%refnum, error = %err, "client kill: deactivate failed");
    }
    if let Err(err) = engine.client_external_close(refnum) {
        tracing::warn!(%refnum, error = %err, "client kill: close failed");
    }
}

/// State mutated by control operations, behind one lock.
///
/// Drop order matters: `audio` goes before the `module` that built it.
#[derive(Debug, Default)]
struct ControlState {
    audio: Option<Arc<dyn Driver>>,
    module: Option<DriverModule>,
    freewheel: bool,
    connection_state: Option<ConnectionState>,
    cycle: CycleState,
    internal: BTreeMap<RefNum, LoadedClient>,
    /// Closed internal clients waiting for detached engine threads to exit.
    retired: Vec<LoadedClient>,
}

impl ControlState {
    fn audio(&self) -> Result<Arc<dyn Driver>> {
        self.audio.clone().ok_or(ServerError::NotOpen)
    }

    /// Unloads retired clients once the engine has no client thread left
    /// running.
    fn unload_retired(&mut self, engine: &mut Engine) {
        if self.retired.is_empty() || engine.reap_client_threads() > 0 {
            return;
        }
        for client in self.retired.drain(..) {
            client.unload();
        }
    }
}

/// The audio graph server.
pub struct Server {
    me: Weak<Server>,
    name: String,
    loopback_channels: u32,
    engine: Arc<LockedEngine>,
    ctx: DriverContext,
    freewheel: Arc<dyn Driver>,
    loopback: Arc<dyn Driver>,
    drivers: DriverRegistry,
    clients: InternalClientRegistry,
    channel: Mutex<Option<ServerChannel>>,
    state: Mutex<ControlState>,
    shutdown: (Sender<()>, Receiver<()>),
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name)
            .field("loopback_channels", &self.loopback_channels)
            .field("cycle", &self.state.try_lock().map(|s| s.cycle))
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a server with the built-in driver and client registries.
    pub fn new(config: &ServerConfig) -> Arc<Self> {
        Self::with_registries(
            config,
            DriverRegistry::new(),
            InternalClientRegistry::new(),
        )
    }

    /// Creates a server that resolves drivers and internal clients through
    /// the given registries.
    ///
    /// The config's module directories are added to both.
    pub fn with_registries(
        config: &ServerConfig,
        mut drivers: DriverRegistry,
        mut clients: InternalClientRegistry,
    ) -> Arc<Self> {
        for dir in &config.module_dirs {
            drivers.add_search_dir(dir);
            clients.add_search_dir(dir);
        }
        let settings = config.engine_settings();
        let control = Arc::new(EngineControl::new(&settings));
        let graph = Arc::new(GraphManager::new(control.buffer_size()));
        let engine = Arc::new(LockedEngine::new(
            graph,
            control,
            Arc::new(SynchroTable::new()),
            MessageBuffer::new(),
        ));
        let ctx = DriverContext::new(Arc::clone(&engine));

        if settings.real_time {
            tracing::info!(priority = settings.priority, "realtime mode enabled");
        } else {
            tracing::info!("realtime mode disabled");
        }

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: settings.server_name.clone(),
            loopback_channels: config.loopback,
            freewheel: Arc::new(FreewheelDriver::new(&ctx)),
            loopback: Arc::new(LoopbackDriver::new(&ctx)),
            engine,
            ctx,
            drivers,
            clients,
            channel: Mutex::new(None),
            state: Mutex::new(ControlState::default()),
            shutdown: bounded(1),
        })
    }

    // --- accessors ---

    /// Server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The locked engine.
    pub fn engine(&self) -> &Arc<LockedEngine> {
        &self.engine
    }

    /// The shared control record.
    pub fn control(&self) -> &Arc<EngineControl> {
        self.engine.control()
    }

    /// The graph.
    pub fn graph(&self) -> &Arc<GraphManager> {
        self.engine.graph()
    }

    /// The audio driver, once opened.
    pub fn audio_driver(&self) -> Option<Arc<dyn Driver>> {
        self.state.lock().audio.clone()
    }

    /// The freewheel driver.
    pub fn freewheel_driver(&self) -> &Arc<dyn Driver> {
        &self.freewheel
    }

    /// The loopback driver.
    pub fn loopback_driver(&self) -> &Arc<dyn Driver> {
        &self.loopback
    }

    /// Configured loopback channel count.
    pub fn loopback_channels(&self) -> u32 {
        self.loopback_channels
    }

    /// The driver registry.
    pub fn driver_registry(&self) -> &DriverRegistry {
        &self.drivers
    }

    /// Whether freewheel mode is on.
    pub fn is_freewheel(&self) -> bool {
        self.state.lock().freewheel
    }

    /// Current cycle state.
    pub fn cycle_state(&self) -> CycleState {
        self.state.lock().cycle
    }

    /// Whether a connection snapshot is waiting to be restored.
    pub fn has_connection_snapshot(&self) -> bool {
        self.state.lock().connection_state.is_some()
    }

    /// Reference numbers of the loaded internal clients.
    pub fn internal_clients(&self) -> Vec<RefNum> {
        self.state.lock().internal.keys().copied().collect()
    }

    /// A handle on the control channel, while it is open.
    pub fn channel_client(&self) -> Option<ChannelClient> {
        self.channel.lock().as_ref().map(ServerChannel::client)
    }

    /// Receives once when the server asks to be shut down.
    pub fn shutdown_signal(&self) -> Receiver<()> {
        self.shutdown.1.clone()
    }

    /// Asks whoever waits on [`shutdown_signal`](Self::shutdown_signal) to stop the server.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.0.try_send(());
    }

    // --- lifecycle ---

    /// Opens the control channel and the engine, loads the audio driver, and
    /// chains the drivers with Audio as master.
    ///
    /// A failing step aborts the call without undoing the earlier ones;
    /// [`close`](Self::close) releases whatever was acquired.
    pub fn open(&self, driver: &str, params: &[DriverParam]) -> Result<()> {
        let mut state = self.state.lock();
        if state.audio.is_some() {
            return Err(ServerError::StateConflict("server already open"));
        }

        {
            let mut channel = self.channel.lock();
            if channel.is_none() {
                let opened = ServerChannel::open(&self.name, self.me.clone(), &self.engine)
                    .map_err(|e| ServerError::Resource(format!("control channel: {e}")))?;
                *channel = Some(opened);
            }
        }

        self.engine
            .lock()
            .open()
            .map_err(|e| ServerError::Resource(format!("engine: {e}")))?;

        let module = self
            .drivers
            .load(driver)
            .map_err(|source| ServerError::DriverLoad {
                driver: driver.to_string(),
                source,
            })?;
        let initialized = module.initialize(&self.ctx, params);
        if let Some(previous) = state.module.replace(module) {
            previous.unload();
        }
        let audio = initialized.map_err(|source| ServerError::DriverLoad {
            driver: driver.to_string(),
            source,
        })?;
        state.audio = Some(Arc::clone(&audio));

        let settings = DriverSettings {
            buffer_size: audio.buffer_size(),
            sample_rate: audio.sample_rate(),
            capture_channels: 0,
            playback_channels: 0,
        };
        self.freewheel.open(settings)?;
        self.loopback.open(DriverSettings {
            capture_channels: self.loopback_channels,
            playback_channels: self.loopback_channels,
            ..settings
        })?;

        audio.attach().map_err(|source| ServerError::DriverAttach {
            driver: audio.name().to_string(),
            source,
        })?;
        if self.loopback_channels > 0 {
            self.loopback
                .attach()
                .map_err(|source| ServerError::DriverAttach {
                    driver: self.loopback.name().to_string(),
                    source,
                })?;
        }

        self.freewheel.set_master(false)?;
        audio.set_master(true)?;
        if self.loopback_channels > 0 {
            audio.add_slave(Arc::clone(&self.loopback));
        }
        audio.add_slave(Arc::clone(&self.freewheel));

        self.control().init_frame_time();
        self.engine
            .messages()
            .create()
            .map_err(|e| ServerError::Resource(format!("message buffer: {e}")))?;

        tracing::info!(
            server = %self.name,
            driver = audio.name(),
            buffer_size = audio.buffer_size(),
            sample_rate = audio.sample_rate(),
            loopback = self.loopback_channels,
            "server open"
        );
        Ok(())
    }

    /// Tears down everything [`open`](Self::open) acquired.
    ///
    /// Every step is attempted; failures are logged and the first one is returned.
    pub fn close(&self) -> Result<()> {
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.close();
        }

        let mut state = self.state.lock();
        let mut first_error: Option<ServerError> = None;
        let mut record = |step: &str, result: Result<()>| {
            if let Err(err) = result {
                tracing::error!(step, error = %err, "close step failed");
                first_error.get_or_insert(err);
            }
        };

        let audio = state.audio.take();
        if self.freewheel.is_running() {
            record("stop freewheel", self.freewheel.stop().map_err(Into::into));
        }
        if let Some(audio) = &audio {
            if audio.is_running() {
                record("stop audio", audio.stop().map_err(Into::into));
            }
            if audio.client_refnum().is_some() {
                record("detach audio", audio.detach().map_err(Into::into));
            }
        }
        if self.loopback.client_refnum().is_some() {
            record("detach loopback", self.loopback.detach().map_err(Into::into));
        }
        if let Some(audio) = &audio {
            record("close audio", audio.close().map_err(Into::into));
        }
        if self.freewheel.core().is_opened() {
            record("close freewheel", self.freewheel.close().map_err(Into::into));
        }
        if self.loopback.core().is_opened() {
            record("close loopback", self.loopback.close().map_err(Into::into));
        }
        drop(audio);

        let internal = std::mem::take(&mut state.internal);
        {
            let mut engine = self.engine.lock();
            for (refnum, client) in internal {
                client.finish();
                record(
                    "close internal client",
                    engine.client_internal_close(refnum).map_err(Into::into),
                );
                state.retired.push(client);
            }
            record("close engine", engine.close().map_err(Into::into));
            state.unload_retired(&mut engine);
            for client in state.retired.drain(..) {
                client.abandon();
            }
        }
        self.engine.messages().destroy();

        if state.freewheel {
            self.control().leave_freewheel();
        }
        state.freewheel = false;
        state.connection_state = None;
        state.cycle = CycleState::Stopped;
        tracing::info!(server = %self.name, "server closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Whether [`open`](Self::open) got as far as creating the audio driver.
    pub fn is_open(&self) -> bool {
        self.state.lock().audio.is_some()
    }

    /// Starts the audio driver.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        let audio = state.audio()?;
        self.control().init_frame_time();
        audio.start()?;
        state.cycle = CycleState::Running;
        tracing::info!(driver = audio.name(), "server started");
        Ok(())
    }

    /// Stops the audio driver.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        let audio = state.audio()?;
        audio.stop()?;
        state.cycle = CycleState::Stopped;
        tracing::info!(driver = audio.name(), "server stopped");
        Ok(())
    }

    // --- reconfiguration ---

    /// Changes the buffer size of the audio and freewheel drivers and the engine.
    ///
    /// If the audio driver rejects the new size the previous one is kept and the
    /// driver is restarted anyway; the returned result is the restart's, so
    /// callers check [`EngineControl::buffer_size`] for the effective size.
    pub fn set_buffer_size(&self, frames: u32) -> Result<()> {
        let mut state = self.state.lock();
        let audio = state.audio()?;
        let previous = self.control().buffer_size();
        if frames == previous {
            return Ok(());
        }
        if audio.is_fixed_buffer_size() {
            tracing::warn!(driver = audio.name(), frames, "driver has a fixed buffer size");
            return Err(ServerError::StateConflict("driver has a fixed buffer size"));
        }
        if state.freewheel {
            return Err(ServerError::StateConflict("buffer size change during freewheel"));
        }

        audio.stop()?;
        state.cycle = CycleState::Quiesced;

        match audio.set_buffer_size(frames) {
            Ok(()) => {
                if let Err(err) = self.freewheel.set_buffer_size(frames) {
                    tracing::warn!(error = %err, "freewheel driver kept its buffer size");
                }
                self.engine.lock().notify_buffer_size(frames);
                tracing::info!(frames, previous, "buffer size changed");
            }
            Err(err) => {
                tracing::error!(frames, error = %err, "buffer size change rejected");
                if let Err(err) = self.freewheel.set_buffer_size(previous) {
                    tracing::warn!(error = %err, "freewheel driver rollback failed");
                }
            }
        }

        self.control().init_frame_time();
        let restarted = audio.start();
        state.cycle = if restarted.is_ok() {
            CycleState::Running
        } else {
            CycleState::Stopped
        };
        restarted.map_err(ServerError::from)
    }

    /// Enters (`true`) or leaves (`false`) freewheel mode.
    ///
    /// Entering stops Audio, snapshots the connections, cuts the audio driver's
    /// ports loose, and runs Freewheel as master. Leaving reverses it. Asking for
    /// the mode already in effect fails.
    pub fn set_freewheel(&self, onoff: bool) -> Result<()> {
        let mut state = self.state.lock();
        let audio = state.audio()?;
        match (state.freewheel, onoff) {
            (true, true) => return Err(ServerError::StateConflict("already freewheeling")),
            (false, false) => return Err(ServerError::StateConflict("not freewheeling")),
            _ => {}
        }

        state.cycle = CycleState::Quiesced;
        let switched = if onoff {
            self.enter_freewheel(&mut state, &*audio)
        } else {
            self.leave_freewheel(&mut state, &*audio)
        };
        // Any failure leaves the drivers stopped.
        state.cycle = if switched.is_ok() {
            CycleState::Running
        } else {
            CycleState::Stopped
        };
        switched
    }

    fn enter_freewheel(&self, state: &mut ControlState, audio: &dyn Driver) -> Result<()> {
        audio.stop()?;
        audio.set_master(false)?;
        {
            let mut engine = self.engine.lock();
            state.connection_state = Some(self.graph().save());
            if let Some(refnum) = audio.client_refnum() {
                let removed = self.graph().disconnect_all_ports(refnum);
                tracing::debug!(removed = removed.len(), "audio driver ports disconnected");
            }
            engine.notify_freewheel(true);
        }
        self.freewheel.set_master(true)?;
        state.freewheel = true;
        tracing::info!("entering freewheel");
        self.freewheel.start()?;
        Ok(())
    }

    fn leave_freewheel(&self, state: &mut ControlState, audio: &dyn Driver) -> Result<()> {
        self.freewheel.stop()?;
        {
            let mut engine = self.engine.lock();
            match state.connection_state.take() {
                Some(snapshot) => {
                    let restored = self.graph().restore(snapshot);
                    tracing::debug!(restored, "connections restored");
                }
                None => tracing::warn!("no connection snapshot to restore"),
            }
            engine.notify_freewheel(false);
        }
        // Start may have run Audio as a slave meanwhile.
        if audio.is_running() {
            audio.stop()?;
        }
        self.freewheel.set_master(false)?;
        audio.set_master(true)?;
        state.freewheel = false;
        self.control().init_frame_time();
        tracing::info!("leaving freewheel");
        audio.start()?;
        Ok(())
    }

    // --- internal clients ---

    /// Loads an internal client from `module_ref` and opens it as `name`.
    ///
    /// On failure the error's status carries [`ClientStatus::FAILURE`] plus the
    /// reason bits; no reference number is produced.
    pub fn internal_client_load(
        &self,
        name: &str,
        module_ref: &str,
        args: &InitArgs,
        options: ClientOptions,
    ) -> std::result::Result<RefNum, InternalClientError> {
        let mut state = self.state.lock();
        let ctx = ClientContext {
            graph: Arc::clone(self.graph()),
            control: Arc::clone(self.control()),
        };
        let loaded = LoadedClient::load(&self.clients, &ctx, module_ref, args)?;

        let mut engine = self.engine.lock();
        let opened = match engine.client_internal_open(name, options, loaded.callbacks()) {
            Ok(opened) => opened,
            Err(status) => {
                tracing::error!(client = name, status = status.bits(), "internal client open failed");
                drop(engine);
                loaded.unload();
                return Err(InternalClientError::new(status));
            }
        };
        let refnum = opened.refnum;
        let ready = loaded
            .initialize(&mut engine, refnum)
            .and_then(|()| engine.client_activate(refnum));
        if let Err(err) = ready {
            tracing::error!(client = %opened.name, error = %err, "internal client initialization failed");
            if let Err(err) = engine.client_internal_close(refnum) {
                tracing::warn!(error = %err, "internal client close failed");
            }
            drop(engine);
            loaded.unload();
            return Err(InternalClientError::new(ClientStatus::INIT_FAILURE));
        }
        drop(engine);

        tracing::info!(client = %opened.name, %refnum, module = module_ref, "internal client loaded");
        state.internal.insert(refnum, loaded);
        Ok(refnum)
    }

    /// Deactivates an internal client, runs its finish hook, and closes it.
    pub fn internal_client_unload(&self, refnum: RefNum) -> Result<()> {
        let mut state = self.state.lock();
        let loaded = state
            .internal
            .remove(&refnum)
            .ok_or(EngineError::NoSuchClient(refnum))?;
        {
            let mut engine = self.engine.lock();
            if let Err(err) = engine.client_deactivate(refnum) {
                tracing::warn!(%refnum, error = %err, "internal client deactivate failed");
            }
            loaded.finish();
            let closed = engine.client_internal_close(refnum);
            state.retired.push(loaded);
            state.unload_retired(&mut engine);
            closed?;
        }
        Ok(())
    }

    // --- realtime requests ---

    /// Handles a notification raised by the realtime cycle.
    ///
    /// Graph reorders and xruns are forwarded to the engine; other kinds are ignored.
    pub fn notify(&self, refnum: RefNum, kind: NotifyKind, value: i64) {
        match kind {
            NotifyKind::GraphOrder => self.engine.lock().notify_graph_reorder(),
            NotifyKind::XRun => self.engine.lock().notify_xrun(refnum),
            _ => tracing::trace!(%refnum, ?kind, value, "notification ignored"),
        }
    }

    /// Removes an unresponsive client.
    ///
    /// Deactivation and close are both attempted; failures are logged only.
    /// The client's thread is not waited for; an internal client's module stays
    /// loaded until that thread has exited.
    pub fn client_kill(&self, refnum: RefNum) {
        tracing::warn!(%refnum, "killing client");
        let mut state = self.state.lock();
        let loaded = state.internal.remove(&refnum);
        let mut engine = self.engine.lock();
        if let Some(loaded) = &loaded {
            loaded.finish();
        }
        kill_client(&mut *engine, refnum);
        state.retired.extend(loaded);
        state.unload_retired(&mut engine);
    }

    // --- transport ---

    /// Gives up the timebase held by `refnum`.
    pub fn release_timebase(&self, refnum: RefNum) -> Result<()> {
        self.control()
            .transport()
            .reset_timebase(refnum)
            .map_err(ServerError::from)
    }

    /// Makes `refnum` the timebase master.
    ///
    /// A conditional claim fails while another client holds the timebase.
    pub fn set_timebase_callback(&self, refnum: RefNum, conditional: bool) -> Result<()> {
        if self.engine.lock().client_info(refnum).is_none() {
            return Err(EngineError::NoSuchClient(refnum).into());
        }
        self.control()
            .transport()
            .set_timebase_master(refnum, conditional)
            .map_err(ServerError::from)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let opened = self.state.get_mut().audio.is_some() || self.channel.get_mut().is_some();
        if opened && let Err(err) = self.close() {
            tracing::warn!(error = %err, "server teardown incomplete");
        }
        if let Some(module) = self.state.get_mut().module.take() {
            module.unload();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        fail_deactivate: bool,
        calls: Vec<(&'static str, RefNum)>,
    }

    impl ClientTeardown for Recorder {
        fn client_deactivate(&mut self, refnum: RefNum) -> cadence_core::Result<()> {
            self.calls.push(("deactivate", refnum));
            if self.fail_deactivate {
                Err(EngineError::NoSuchClient(refnum))
            } else {
                Ok(())
            }
        }

        fn client_external_close(&mut self, refnum: RefNum) -> cadence_core::Result<()> {
            self.calls.push(("close", refnum));
            Ok(())
        }
    }

    #[test]
    fn kill_closes_even_when_deactivate_fails() {
        let mut engine = Recorder {
            fail_deactivate: true,
            ..Recorder::default()
        };
        kill_client(&mut engine, RefNum::new(7));
        assert_eq!(
            engine.calls,
            vec![("deactivate", RefNum::new(7)), ("close", RefNum::new(7))]
        );
    }

    #[test]
    fn kill_runs_both_steps_in_order() {
        let mut engine = Recorder::default();
        kill_client(&mut engine, RefNum::new(3));
        assert_eq!(
            engine.calls,
            vec![("deactivate", RefNum::new(3)), ("close", RefNum::new(3))]
        );
    }

    #[test]
    fn operations_before_open_report_not_open() {
        let server = Server::new(&ServerConfig::default());
        assert!(matches!(server.start(), Err(ServerError::NotOpen)));
        assert!(matches!(server.set_buffer_size(512), Err(ServerError::NotOpen)));
        assert!(matches!(server.set_freewheel(true), Err(ServerError::NotOpen)));
        assert_eq!(server.cycle_state(), CycleState::Stopped);
        assert!(!server.is_open());
    }
}
