//! The driver capability set and the state every driver shares.
//!
//! A driver is a clock source. Exactly one driver is master at a time: it owns
//! the timing (hardware callback, timer, or free-running loop) and on each
//! period runs one engine cycle, first giving each of its slaves a
//! [`Driver::process_slave`] pass. Slaves never start a cycle on their own.
//!
//! Lifecycle: open, attach, then any number of start/stop, then detach and
//! close. Role changes ([`Driver::set_master`]) are only accepted while stopped.

use crate::{DriverError, Result};
use cadence_core::{
    LockedEngine, MAX_BUFFER_SIZE, NoCallbacks, PortDirection, PortId, RefNum, RtLevel,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Smallest buffer size a driver accepts.
pub const MIN_BUFFER_SIZE: u32 = 16;

/// Everything a driver factory gets to build a driver.
#[derive(Debug, Clone)]
pub struct DriverContext {
    /// The engine the driver runs cycles on.
    pub engine: Arc<LockedEngine>,
}

impl DriverContext {
    /// Creates a context around `engine`.
    pub fn new(engine: Arc<LockedEngine>) -> Self {
        Self { engine }
    }
}

/// Timing and channel layout a driver opens with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    /// Frames per cycle.
    pub buffer_size: u32,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Capture channels (graph outputs).
    pub capture_channels: u32,
    /// Playback channels (graph inputs).
    pub playback_channels: u32,
}

/// Checks that `frames` is a usable buffer size.
pub fn check_buffer_size(frames: u32) -> Result<()> {
    if frames.is_power_of_two() && (MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&frames) {
        Ok(())
    } else {
        Err(DriverError::UnsupportedBufferSize(frames))
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    opened: bool,
    running: bool,
    refnum: Option<RefNum>,
    capture_ports: Vec<PortId>,
    playback_ports: Vec<PortId>,
    capture_channels: u32,
    playback_channels: u32,
}

struct CoreInner {
    name: String,
    engine: Arc<LockedEngine>,
    owns_timing: bool,
    cycle_timeout: Option<Duration>,
    lifecycle: Mutex<Lifecycle>,
    master: AtomicBool,
    slaves: Mutex<Vec<Arc<dyn Driver>>>,
    buffer_size: AtomicU32,
    sample_rate: AtomicU32,
    cycles: AtomicU64,
}

/// State shared by every driver variant: name, role, slaves, lifecycle flags,
/// buffer size, and the driver's client in the engine.
///
/// Cloning shares the same state; cycle threads hold a clone.
#[derive(Clone)]
pub struct DriverCore {
    inner: Arc<CoreInner>,
}

impl std::fmt::Debug for DriverCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverCore")
            .field("name", &self.inner.name)
            .field("master", &self.is_master())
            .field("buffer_size", &self.buffer_size())
            .field("slaves", &self.slave_names())
            .finish_non_exhaustive()
    }
}

impl DriverCore {
    /// Creates the core of a driver called `name`.
    ///
    /// `owns_timing` marks the audio driver: its buffer size and sample rate are
    /// written through to the engine control.
    pub fn new(name: impl Into<String>, ctx: &DriverContext, owns_timing: bool) -> Self {
        Self::build(name.into(), ctx, owns_timing, None)
    }

    /// Creates a core whose cycles give clients `timeout` instead of the
    /// engine's cycle timeout.
    pub fn with_cycle_timeout(
        name: impl Into<String>,
        ctx: &DriverContext,
        timeout: Duration,
    ) -> Self {
        Self::build(name.into(), ctx, false, Some(timeout))
    }

    fn build(
        name: String,
        ctx: &DriverContext,
        owns_timing: bool,
        cycle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(CoreInner {
                name,
                engine: Arc::clone(&ctx.engine),
                owns_timing,
                cycle_timeout,
                lifecycle: Mutex::new(Lifecycle::default()),
                master: AtomicBool::new(false),
                slaves: Mutex::new(Vec::new()),
                buffer_size: AtomicU32::new(ctx.engine.control().buffer_size()),
                sample_rate: AtomicU32::new(ctx.engine.control().sample_rate()),
                cycles: AtomicU64::new(0),
            }),
        }
    }

    /// Driver name; also the name of its engine client.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The engine this driver runs cycles on.
    pub fn engine(&self) -> &Arc<LockedEngine> {
        &self.inner.engine
    }

    /// Records the driver's timing and channel layout.
    pub fn open(&self, settings: DriverSettings) -> Result<()> {
        check_buffer_size(settings.buffer_size)?;
        if settings.sample_rate == 0 {
            return Err(DriverError::Backend(format!(
                "{}: sample rate must be positive",
                self.name()
            )));
        }
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.opened {
            return Err(self.invalid_state("already open"));
        }
        lifecycle.opened = true;
        lifecycle.capture_channels = settings.capture_channels;
        lifecycle.playback_channels = settings.playback_channels;
        self.inner
            .buffer_size
            .store(settings.buffer_size, Ordering::Release);
        self.inner
            .sample_rate
            .store(settings.sample_rate, Ordering::Release);
        if self.inner.owns_timing {
            let control = self.engine().control();
            control.set_buffer_size(settings.buffer_size);
            control.set_sample_rate(settings.sample_rate);
            self.engine().graph().set_buffer_size(settings.buffer_size);
        }
        tracing::info!(
            driver = self.name(),
            buffer_size = settings.buffer_size,
            sample_rate = settings.sample_rate,
            capture = settings.capture_channels,
            playback = settings.playback_channels,
            "driver opened"
        );
        Ok(())
    }

    /// Forgets the opened state. The driver must be stopped and detached.
    pub fn close(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.running {
            return Err(self.invalid_state("close while running"));
        }
        lifecycle.opened = false;
        self.inner.slaves.lock().clear();
        tracing::debug!(driver = self.name(), "driver closed");
        Ok(())
    }

    /// Whether the driver is open.
    pub fn is_opened(&self) -> bool {
        self.inner.lifecycle.lock().opened
    }

    /// Opens the driver's client in the engine and registers its physical ports:
    /// `capture_N` outputs and `playback_N` inputs.
    pub fn attach(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if !lifecycle.opened {
            return Err(self.invalid_state("attach before open"));
        }
        if lifecycle.refnum.is_some() {
            return Err(self.invalid_state("already attached"));
        }
        let mut engine = self.engine().lock();
        let refnum = engine.client_driver_open(self.name(), Arc::new(NoCallbacks))?;
        let mut capture = Vec::new();
        let mut playback = Vec::new();
        let registered = (|| -> Result<()> {
            for i in 1..=lifecycle.capture_channels {
                capture.push(engine.port_register_physical(
                    refnum,
                    &format!("capture_{i}"),
                    PortDirection::Output,
                )?);
            }
            for i in 1..=lifecycle.playback_channels {
                playback.push(engine.port_register_physical(
                    refnum,
                    &format!("playback_{i}"),
                    PortDirection::Input,
                )?);
            }
            Ok(())
        })();
        if let Err(err) = registered {
            // Closing the client removes whatever ports were registered.
            let _ = engine.client_driver_close(refnum);
            return Err(err);
        }
        engine.client_activate(refnum)?;
        tracing::info!(
            driver = self.name(),
            %refnum,
            capture = capture.len(),
            playback = playback.len(),
            "driver attached"
        );
        lifecycle.refnum = Some(refnum);
        lifecycle.capture_ports = capture;
        lifecycle.playback_ports = playback;
        Ok(())
    }

    /// Closes the driver's client, removing its ports.
    pub fn detach(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        let Some(refnum) = lifecycle.refnum.take() else {
            return Err(self.invalid_state("detach while not attached"));
        };
        lifecycle.capture_ports.clear();
        lifecycle.playback_ports.clear();
        self.engine().lock().client_driver_close(refnum)?;
        tracing::info!(driver = self.name(), %refnum, "driver detached");
        Ok(())
    }

    /// Marks the driver as running.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if !lifecycle.opened {
            return Err(self.invalid_state("start before open"));
        }
        lifecycle.running = true;
        Ok(())
    }

    /// Marks the driver as stopped.
    pub fn stop(&self) {
        self.inner.lifecycle.lock().running = false;
    }

    /// Whether the driver is running.
    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.lock().running
    }

    /// Client of this driver in the engine, once attached.
    pub fn client_refnum(&self) -> Option<RefNum> {
        self.inner.lifecycle.lock().refnum
    }

    /// Capture ports registered by [`attach`](Self::attach).
    pub fn capture_ports(&self) -> Vec<PortId> {
        self.inner.lifecycle.lock().capture_ports.clone()
    }

    /// Playback ports registered by [`attach`](Self::attach).
    pub fn playback_ports(&self) -> Vec<PortId> {
        self.inner.lifecycle.lock().playback_ports.clone()
    }

    /// Current buffer size.
    pub fn buffer_size(&self) -> u32 {
        self.inner.buffer_size.load(Ordering::Acquire)
    }

    /// Current sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate.load(Ordering::Acquire)
    }

    /// Applies a new buffer size. Only accepted while stopped.
    ///
    /// The audio driver also writes it to the engine control.
    pub fn set_buffer_size(&self, frames: u32) -> Result<()> {
        check_buffer_size(frames)?;
        if self.is_running() {
            return Err(self.invalid_state("buffer size change while running"));
        }
        self.inner.buffer_size.store(frames, Ordering::Release);
        if self.inner.owns_timing {
            self.engine().control().set_buffer_size(frames);
        }
        tracing::debug!(driver = self.name(), frames, "buffer size set");
        Ok(())
    }

    /// Sets the master role. Only accepted while stopped.
    pub fn set_master(&self, master: bool) -> Result<()> {
        if self.is_running() {
            return Err(self.invalid_state("role change while running"));
        }
        self.inner.master.store(master, Ordering::Release);
        tracing::debug!(driver = self.name(), master, "driver role set");
        Ok(())
    }

    /// Whether this driver is master.
    pub fn is_master(&self) -> bool {
        self.inner.master.load(Ordering::Acquire)
    }

    /// Adds a slave driven by this driver's cycles.
    pub fn add_slave(&self, slave: Arc<dyn Driver>) {
        tracing::debug!(driver = self.name(), slave = slave.name(), "slave added");
        self.inner.slaves.lock().push(slave);
    }

    /// Removes the slave called `name`.
    pub fn remove_slave(&self, name: &str) -> bool {
        let mut slaves = self.inner.slaves.lock();
        let before = slaves.len();
        slaves.retain(|s| s.name() != name);
        slaves.len() != before
    }

    /// Names of the current slaves, in the order they run.
    pub fn slave_names(&self) -> Vec<String> {
        self.inner
            .slaves
            .lock()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Cycles this driver has run as master or as slave.
    pub fn cycles(&self) -> u64 {
        self.inner.cycles.load(Ordering::Relaxed)
    }

    /// Counts one slave pass.
    pub fn count_cycle(&self) {
        self.inner.cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs one master cycle: frame timer, slaves, then the engine.
    ///
    /// Never blocks on the slave list or the engine; a contended lock skips
    /// that part of the cycle.
    pub fn run_cycle(&self) {
        let engine = self.engine();
        engine.control().cycle_begin(Instant::now());
        if let Some(slaves) = self.inner.slaves.try_lock() {
            for slave in slaves.iter() {
                if slave.process_slave().is_err() {
                    engine
                        .messages()
                        .post(RtLevel::Warn, "slave driver cycle failed", 0);
                }
            }
        }
        match self.inner.cycle_timeout {
            Some(timeout) => engine.process_within(timeout),
            None => engine.process(),
        };
        self.count_cycle();
    }

    fn invalid_state(&self, reason: &'static str) -> DriverError {
        DriverError::InvalidState {
            driver: self.name().to_string(),
            reason,
        }
    }
}

/// A clock source.
///
/// Every method has a default that delegates to the shared [`DriverCore`];
/// variants override what their timing source needs (usually `start`, `stop`,
/// and `process_slave`).
pub trait Driver: Send + Sync {
    /// Shared driver state.
    fn core(&self) -> &DriverCore;

    /// Driver name.
    fn name(&self) -> &str {
        self.core().name()
    }

    /// Opens the driver with explicit timing and channel layout.
    fn open(&self, settings: DriverSettings) -> Result<()> {
        self.core().open(settings)
    }

    /// Closes the driver, stopping it first if needed.
    fn close(&self) -> Result<()> {
        if self.is_running() {
            self.stop()?;
        }
        self.core().close()
    }

    /// Registers the driver's client and ports in the engine.
    fn attach(&self) -> Result<()> {
        self.core().attach()
    }

    /// Removes the driver's client and ports from the engine.
    fn detach(&self) -> Result<()> {
        self.core().detach()
    }

    /// Starts the timing source (master) or accepts slave passes (slave).
    fn start(&self) -> Result<()> {
        self.core().start()
    }

    /// Stops the timing source.
    fn stop(&self) -> Result<()> {
        self.core().stop();
        Ok(())
    }

    /// Whether the driver is running.
    fn is_running(&self) -> bool {
        self.core().is_running()
    }

    /// Applies a new buffer size.
    fn set_buffer_size(&self, frames: u32) -> Result<()> {
        if self.is_fixed_buffer_size() {
            return Err(DriverError::FixedBufferSize(self.name().to_string()));
        }
        self.core().set_buffer_size(frames)
    }

    /// Current buffer size.
    fn buffer_size(&self) -> u32 {
        self.core().buffer_size()
    }

    /// Current sample rate.
    fn sample_rate(&self) -> u32 {
        self.core().sample_rate()
    }

    /// Whether the buffer size is dictated by the hardware.
    fn is_fixed_buffer_size(&self) -> bool {
        false
    }

    /// Sets the master role.
    fn set_master(&self, master: bool) -> Result<()> {
        self.core().set_master(master)
    }

    /// Whether this driver is master.
    fn is_master(&self) -> bool {
        self.core().is_master()
    }

    /// Adds a slave driven by this driver.
    fn add_slave(&self, slave: Arc<dyn Driver>) {
        self.core().add_slave(slave);
    }

    /// Removes a slave by name.
    fn remove_slave(&self, name: &str) -> bool {
        self.core().remove_slave(name)
    }

    /// The driver's client in the engine, once attached.
    fn client_refnum(&self) -> Option<RefNum> {
        self.core().client_refnum()
    }

    /// One pass as a slave of the current master. Called on the realtime thread.
    fn process_slave(&self) -> Result<()> {
        self.core().count_cycle();
        Ok(())
    }
}

impl std::fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.core().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{EngineControl, EngineSettings, GraphManager, MessageBuffer, SynchroTable};

    struct Plain {
        core: DriverCore,
    }

    impl Driver for Plain {
        fn core(&self) -> &DriverCore {
            &self.core
        }
    }

    fn context() -> DriverContext {
        let control = Arc::new(EngineControl::new(&EngineSettings::default()));
        let engine = Arc::new(LockedEngine::new(
            Arc::new(GraphManager::new(control.buffer_size())),
            control,
            Arc::new(SynchroTable::new()),
            MessageBuffer::new(),
        ));
        engine.lock().open().unwrap();
        DriverContext::new(engine)
    }

    fn settings() -> DriverSettings {
        DriverSettings {
            buffer_size: 256,
            sample_rate: 44100,
            capture_channels: 2,
            playback_channels: 2,
        }
    }

    #[test]
    fn audio_driver_publishes_timing() {
        let ctx = context();
        let driver = Plain {
            core: DriverCore::new("system", &ctx, true),
        };
        driver.open(settings()).unwrap();
        assert_eq!(ctx.engine.control().buffer_size(), 256);
        assert_eq!(ctx.engine.control().sample_rate(), 44100);

        driver.set_buffer_size(512).unwrap();
        assert_eq!(ctx.engine.control().buffer_size(), 512);
    }

    #[test]
    fn follower_does_not_touch_control() {
        let ctx = context();
        let driver = Plain {
            core: DriverCore::new("freewheel", &ctx, false),
        };
        driver.open(settings()).unwrap();
        driver.set_buffer_size(64).unwrap();
        assert_eq!(driver.buffer_size(), 64);
        assert_eq!(ctx.engine.control().buffer_size(), 256);
    }

    #[test]
    fn attach_registers_physical_ports() {
        let ctx = context();
        let driver = Plain {
            core: DriverCore::new("system", &ctx, true),
        };
        driver.open(settings()).unwrap();
        driver.attach().unwrap();
        let refnum = driver.client_refnum().unwrap();
        let ports = ctx.engine.graph().ports_of(refnum);
        assert_eq!(ports.len(), 4);
        assert!(ports.iter().all(|p| p.physical));
        assert!(ctx.engine.graph().find_port("system:capture_1").is_some());
        assert!(ctx.engine.graph().find_port("system:playback_2").is_some());

        driver.detach().unwrap();
        assert_eq!(ctx.engine.graph().port_count(), 0);
        assert!(driver.client_refnum().is_none());
    }

    #[test]
    fn role_change_rejected_while_running() {
        let ctx = context();
        let driver = Plain {
            core: DriverCore::new("system", &ctx, true),
        };
        driver.open(settings()).unwrap();
        driver.start().unwrap();
        assert!(matches!(
            driver.set_master(true),
            Err(DriverError::InvalidState { .. })
        ));
        driver.stop().unwrap();
        driver.set_master(true).unwrap();
        assert!(driver.is_master());
    }

    #[test]
    fn bad_buffer_sizes_rejected() {
        assert!(check_buffer_size(1000).is_err());
        assert!(check_buffer_size(8).is_err());
        assert!(check_buffer_size(16384).is_err());
        assert!(check_buffer_size(1024).is_ok());
    }

    #[test]
    fn master_cycle_runs_slaves() {
        let ctx = context();
        let master = Plain {
            core: DriverCore::new("system", &ctx, true),
        };
        let slave = Arc::new(Plain {
            core: DriverCore::new("freewheel", &ctx, false),
        });
        master.add_slave(slave.clone());
        master.core().run_cycle();
        master.core().run_cycle();
        assert_eq!(master.core().cycles(), 2);
        assert_eq!(slave.core().cycles(), 2);
        assert_eq!(master.core().slave_names(), vec!["freewheel".to_string()]);
        assert!(master.remove_slave("freewheel"));
    }
}
