//! Thread that runs master cycles for drivers without a hardware callback.

use crate::driver::DriverCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How a cycle thread spaces its cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// One cycle per engine period (buffer size / sample rate), re-read each cycle.
    EnginePeriod,
    /// One cycle per fixed interval.
    Fixed(Duration),
    /// Next cycle as soon as the previous one finished.
    FreeRunning,
}

/// A running cycle thread. Dropping it without [`stop`](Self::stop) detaches it.
#[derive(Debug)]
pub struct CycleThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl CycleThread {
    /// Spawns a thread that calls [`DriverCore::run_cycle`] until stopped.
    pub fn spawn(core: DriverCore, pacing: Pacing) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let name = format!("cadence-{}", core.name());
        let handle = std::thread::Builder::new().name(name).spawn(move || {
            tracing::debug!(driver = core.name(), ?pacing, "cycle thread started");
            let mut next = Instant::now();
            while !flag.load(Ordering::Acquire) {
                core.run_cycle();
                match pacing {
                    Pacing::FreeRunning => std::thread::yield_now(),
                    Pacing::EnginePeriod | Pacing::Fixed(_) => {
                        let period = match pacing {
                            Pacing::Fixed(period) => period,
                            _ => core.engine().control().period(),
                        };
                        next += period;
                        let now = Instant::now();
                        if next > now {
                            std::thread::sleep(next - now);
                        } else {
                            // Fell behind by more than a period; resynchronize.
                            next = now;
                        }
                    }
                }
            }
            tracing::debug!(driver = core.name(), "cycle thread stopped");
        })?;
        Ok(Self { stop, handle })
    }

    /// Stops the thread and waits for its current cycle to finish.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            tracing::error!("driver cycle thread panicked");
        }
    }
}
