//! Shared realtime configuration.
//!
//! [`EngineControl`] holds the parameters every part of the server reads during a
//! cycle: buffer size, sample rate, realtime flag, client timeout, the frame
//! timer, and the transport. Scalar fields are atomics so the realtime thread can
//! read them without locking; only the orchestrator and drivers write them.

use crate::transport::Transport;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default buffer size in frames.
pub const DEFAULT_BUFFER_SIZE: u32 = 1024;

/// Default sample rate in Hz.
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

/// Largest buffer size any driver may use.
pub const MAX_BUFFER_SIZE: u32 = 8192;

/// Construction parameters for [`EngineControl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Server name, used by the control channel.
    pub server_name: String,
    /// Synchronous mode: the master waits for graph completion before writing output.
    pub sync: bool,
    /// Exit when the last client leaves.
    pub temporary: bool,
    /// Time a client may take within one cycle.
    pub client_timeout: Duration,
    /// Run the cycle thread with realtime scheduling.
    pub real_time: bool,
    /// Realtime priority of the cycle thread.
    pub priority: i32,
    /// Verbose logging.
    pub verbose: bool,
    /// Initial buffer size in frames; drivers overwrite it when they open.
    pub buffer_size: u32,
    /// Initial sample rate; drivers overwrite it when they open.
    pub sample_rate: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            server_name: "default".to_string(),
            sync: false,
            temporary: false,
            client_timeout: Duration::from_millis(500),
            real_time: true,
            priority: 10,
            verbose: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

/// Tracks the frame counter against wall-clock wakeups.
#[derive(Debug, Clone, Default)]
pub struct FrameTimer {
    initialized: bool,
    frames: u64,
    current_wakeup: Option<Instant>,
    next_wakeup: Option<Instant>,
}

impl FrameTimer {
    /// Resets the timer; the next cycle restarts the frame count at zero.
    pub fn init(&mut self) {
        self.initialized = false;
        self.frames = 0;
        self.current_wakeup = None;
        self.next_wakeup = None;
    }

    /// Records the start of a cycle of `buffer_size` frames lasting `period`.
    pub fn cycle_begin(&mut self, now: Instant, buffer_size: u32, period: Duration) {
        if self.initialized {
            self.frames += u64::from(buffer_size);
        } else {
            self.frames = 0;
            self.initialized = true;
        }
        self.current_wakeup = Some(now);
        self.next_wakeup = Some(now + period);
    }

    /// Frame count at the start of the current cycle.
    pub fn last_frame_time(&self) -> u64 {
        self.frames
    }

    /// Estimated frame time at `now`.
    pub fn frame_time(&self, now: Instant, sample_rate: u32) -> u64 {
        match self.current_wakeup {
            Some(wakeup) if now > wakeup => {
                self.frames + frames_in(now.duration_since(wakeup), sample_rate)
            }
            _ => self.frames,
        }
    }

    /// Frames elapsed since the current cycle started.
    pub fn frames_since_cycle_start(&self, now: Instant, sample_rate: u32) -> u64 {
        self.frame_time(now, sample_rate) - self.frames
    }

    /// Whether at least one cycle has been recorded since the last reset.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Expected start of the next cycle.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.next_wakeup
    }
}

fn frames_in(elapsed: Duration, sample_rate: u32) -> u64 {
    (elapsed.as_secs_f64() * f64::from(sample_rate)) as u64
}

/// Shared realtime configuration.
#[derive(Debug)]
pub struct EngineControl {
    server_name: String,
    sync: bool,
    temporary: bool,
    priority: i32,
    verbose: bool,
    client_timeout: Duration,
    buffer_size: AtomicU32,
    sample_rate: AtomicU32,
    real_time: AtomicBool,
    saved_real_time: AtomicBool,
    xruns: AtomicU64,
    skipped_cycles: AtomicU64,
    frame_timer: Mutex<FrameTimer>,
    transport: Mutex<Transport>,
}

impl EngineControl {
    /// Creates the control record from construction settings.
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            server_name: settings.server_name.clone(),
            sync: settings.sync,
            temporary: settings.temporary,
            priority: settings.priority,
            verbose: settings.verbose,
            client_timeout: settings.client_timeout,
            buffer_size: AtomicU32::new(settings.buffer_size),
            sample_rate: AtomicU32::new(settings.sample_rate),
            real_time: AtomicBool::new(settings.real_time),
            saved_real_time: AtomicBool::new(settings.real_time),
            xruns: AtomicU64::new(0),
            skipped_cycles: AtomicU64::new(0),
            frame_timer: Mutex::new(FrameTimer::default()),
            transport: Mutex::new(Transport::new()),
        }
    }

    /// Server name.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Whether the server runs in synchronous mode.
    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// Whether the server exits when the last client leaves.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Realtime priority of the cycle thread.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Whether verbose logging was requested.
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Current buffer size in frames.
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size.load(Ordering::Acquire)
    }

    /// Records a new buffer size. Called by drivers once they have applied it.
    pub fn set_buffer_size(&self, frames: u32) {
        self.buffer_size.store(frames, Ordering::Release);
    }

    /// Current sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    /// Records a new sample rate.
    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Release);
    }

    /// Duration of one cycle at the current buffer size and sample rate.
    pub fn period(&self) -> Duration {
        let rate = self.sample_rate().max(1);
        Duration::from_secs_f64(f64::from(self.buffer_size()) / f64::from(rate))
    }

    /// Time clients get to finish one cycle: the configured client timeout, but
    /// never less than two periods.
    pub fn cycle_timeout(&self) -> Duration {
        self.client_timeout.max(self.period() * 2)
    }

    /// Configured client timeout.
    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    /// Whether the cycle thread runs with realtime scheduling.
    pub fn is_real_time(&self) -> bool {
        self.real_time.load(Ordering::Acquire)
    }

    /// Saves the realtime flag and clears it for freewheel mode.
    pub fn enter_freewheel(&self) {
        self.saved_real_time
            .store(self.real_time.load(Ordering::Acquire), Ordering::Release);
        self.real_time.store(false, Ordering::Release);
    }

    /// Restores the realtime flag saved by [`enter_freewheel`](Self::enter_freewheel).
    pub fn leave_freewheel(&self) {
        self.real_time
            .store(self.saved_real_time.load(Ordering::Acquire), Ordering::Release);
    }

    /// Counts one xrun.
    pub fn note_xrun(&self) {
        self.xruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Total xruns since construction.
    pub fn xrun_count(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }

    /// Counts a cycle skipped because the engine was busy.
    pub fn note_skipped_cycle(&self) {
        self.skipped_cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Total skipped cycles since construction.
    pub fn skipped_cycle_count(&self) -> u64 {
        self.skipped_cycles.load(Ordering::Relaxed)
    }

    /// Resets the frame timer.
    pub fn init_frame_time(&self) {
        self.frame_timer.lock().init();
    }

    /// Records the start of a cycle on the frame timer.
    ///
    /// Uses `try_lock`; if a control thread is resetting the timer this cycle is
    /// simply not counted.
    pub fn cycle_begin(&self, now: Instant) {
        let buffer_size = self.buffer_size();
        let period = self.period();
        if let Some(mut timer) = self.frame_timer.try_lock() {
            timer.cycle_begin(now, buffer_size, period);
        }
    }

    /// Snapshot of the frame timer.
    pub fn frame_timer(&self) -> FrameTimer {
        self.frame_timer.lock().clone()
    }

    /// Estimated current frame time.
    pub fn frame_time(&self) -> u64 {
        self.frame_timer
            .lock()
            .frame_time(Instant::now(), self.sample_rate())
    }

    /// Locks the transport.
    pub fn transport(&self) -> MutexGuard<'_, Transport> {
        self.transport.lock()
    }

    /// Locks the transport without blocking.
    pub fn try_transport(&self) -> Option<MutexGuard<'_, Transport>> {
        self.transport.try_lock()
    }
}
